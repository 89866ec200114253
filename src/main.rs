//! # wlsession demo
//!
//! Opens one window, paints the demo artwork into it and runs the event loop
//! until the quit key is typed, the window is closed, SIGINT arrives or the
//! optional auto-quit timer fires. The process exits with the shutdown code.

use anyhow::{Context, Result};
use clap::Parser;
use log::{debug, error, info};
use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};
use wlsession::config::SessionConfig;
use wlsession::reactor::Timer;
use wlsession::{Reactor, Session, ShutdownCode, WaylandTransport, Window, WindowEvent, XkbCompiler};

mod demo;

/// Exit status when the compositor asked the window to close
const EXIT_WINDOW_CLOSED: i32 = 0;

#[derive(Parser)]
#[command(name = "wlsession")]
#[command(about = "A minimal Wayland client: one window, one event loop")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "~/.config/wlsession/wlsession.toml")]
    config: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Window width in pixels
    #[arg(long)]
    width: Option<u32>,

    /// Window height in pixels
    #[arg(long)]
    height: Option<u32>,

    /// Window title
    #[arg(long)]
    title: Option<String>,

    /// Quit after this many seconds
    #[arg(long)]
    quit_after: Option<u64>,
}

impl Cli {
    fn apply(&self, config: &mut SessionConfig) {
        if let Some(width) = self.width {
            config.window.width = width;
        }
        if let Some(height) = self.height {
            config.window.height = height;
        }
        if let Some(title) = &self.title {
            config.window.title = title.clone();
        }
        if let Some(secs) = self.quit_after {
            config.general.auto_quit_secs = Some(secs);
        }
    }
}

/// One-shot timer that stops the session
struct AutoQuit {
    deadline: Option<Instant>,
    code: i32,
    shutdown: ShutdownCode,
}

impl AutoQuit {
    fn new(after: Duration, code: i32, shutdown: ShutdownCode) -> Self {
        Self {
            deadline: Some(Instant::now() + after),
            code,
            shutdown,
        }
    }
}

impl Timer for AutoQuit {
    fn next_fire(&self) -> Option<Instant> {
        self.deadline
    }

    fn alarm(&mut self) -> Result<()> {
        self.deadline = None;
        info!("⏰ auto-quit timer fired");
        self.shutdown.set(self.code);
        Ok(())
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    if cli.debug {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug")).init();
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    }

    info!("🚀 Starting wlsession {}", wlsession::VERSION);

    // Load configuration
    let mut config = match SessionConfig::load(&cli.config) {
        Ok(config) => {
            info!("✅ Configuration loaded from: {}", cli.config);
            config
        }
        Err(e) => {
            error!("❌ Failed to load configuration: {:#}", e);
            info!("📝 Using default configuration");
            SessionConfig::default()
        }
    };
    cli.apply(&mut config);
    config.validate().context("Invalid command line override")?;

    let code = run(&config)?;
    info!("👋 exiting with code {}", code);
    log::logger().flush();
    std::process::exit(code);
}

fn run(config: &SessionConfig) -> Result<i32> {
    let mut reactor = Reactor::from_config(&config.reactor);
    let transport = WaylandTransport::connect().context("Failed to connect to the display")?;
    let session = Session::connect(
        &mut reactor,
        transport,
        Box::new(XkbCompiler::new()),
        &config.keyboard,
    )
    .context("Failed to set up the session")?;

    let window_config = &config.window;
    let mut window = Window::new(
        &mut *session.borrow_mut(),
        window_config.width,
        window_config.height,
        &window_config.title,
        &window_config.app_id,
    )
    .context("Failed to create the window")?;

    let artwork = demo::paint(window.width(), window.height())?;
    window.blit(&artwork)?;
    window.redraw(&mut *session.borrow_mut())?;

    let surface = window.surface();
    let weak = Rc::downgrade(&session);
    let shutdown = reactor.shutdown();
    reactor.add_tick(move || {
        let Some(session) = weak.upgrade() else {
            return Ok(());
        };
        for event in session.borrow_mut().take_window_events(surface) {
            match event {
                WindowEvent::CloseRequested => {
                    shutdown.set(EXIT_WINDOW_CLOSED);
                }
                other => debug!("window event {:?}", other),
            }
        }
        Ok(())
    });

    let _auto_quit = config.general.auto_quit_secs.map(|secs| {
        info!("auto-quit in {}s", secs);
        let timer: Rc<RefCell<dyn Timer>> = Rc::new(RefCell::new(AutoQuit::new(
            Duration::from_secs(secs),
            config.general.auto_quit_code,
            reactor.shutdown(),
        )));
        reactor.add_timer(Rc::downgrade(&timer));
        timer
    });

    info!("✨ window is up; type '{}' to quit", config.keyboard.quit_character);
    let code = reactor.run()?;

    let mut session = session.borrow_mut();
    window.close(&mut *session)?;
    session.disconnect()?;
    Ok(code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parsing() {
        let cli = Cli::try_parse_from(["wlsession"]).unwrap();
        assert!(!cli.debug);
        assert!(cli.width.is_none());
        assert!(cli.quit_after.is_none());
    }

    #[test]
    fn test_cli_overrides_config() {
        let cli = Cli::try_parse_from([
            "wlsession",
            "--debug",
            "--width",
            "320",
            "--height",
            "200",
            "--title",
            "hello",
            "--quit-after",
            "3",
        ])
        .unwrap();
        assert!(cli.debug);

        let mut config = SessionConfig::default();
        cli.apply(&mut config);
        assert_eq!(config.window.width, 320);
        assert_eq!(config.window.height, 200);
        assert_eq!(config.window.title, "hello");
        assert_eq!(config.general.auto_quit_secs, Some(3));
        assert_eq!(config.window.app_id, "wlsession");
    }

    #[test]
    fn test_auto_quit_fires_once() {
        let shutdown = ShutdownCode::new();
        let mut timer = AutoQuit::new(Duration::ZERO, 7, shutdown.clone());
        assert!(timer.next_fire().is_some());

        timer.alarm().unwrap();
        assert_eq!(shutdown.get(), Some(7));
        assert_eq!(timer.next_fire(), None);
    }

    #[test]
    fn test_auto_quit_stops_the_reactor() {
        let mut reactor = Reactor::new(Default::default());
        let timer: Rc<RefCell<dyn Timer>> = Rc::new(RefCell::new(AutoQuit::new(
            Duration::from_millis(5),
            4,
            reactor.shutdown(),
        )));
        reactor.add_timer(Rc::downgrade(&timer));

        while !reactor.shutdown().is_set() {
            reactor.iterate().unwrap();
        }
        assert_eq!(reactor.shutdown().get(), Some(4));
    }
}

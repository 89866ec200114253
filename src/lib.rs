//! # wlsession
//!
//! A small client-side Wayland session: one single-threaded reactor, one
//! display connection, seat and keyboard handling, and top-level windows
//! backed by shared memory.
//!
//! ## Architecture
//!
//! - `reactor`: fd watchers, timers, tick and preselect hooks, shutdown code
//! - `interrupt`: SIGINT handling for the reactor
//! - `protocol`: the display-protocol seam (requests trait, typed events)
//! - `backend`: the real transport over `wayland-client`
//! - `session`: startup, global binding, event routing
//! - `seat`: pointer and keyboard devices per seat
//! - `keyboard`: keymap compilation and key decoding
//! - `window`: shared-memory buffers, damage and commit
//! - `config`: TOML configuration
//! - `testing`: an in-memory transport for headless runs
//!
//! ## Usage
//!
//! ```rust,no_run
//! use wlsession::{Reactor, Session, WaylandTransport, Window, XkbCompiler};
//! use wlsession::config::SessionConfig;
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = SessionConfig::default();
//!     let mut reactor = Reactor::from_config(&config.reactor);
//!     let session = Session::connect(
//!         &mut reactor,
//!         WaylandTransport::connect()?,
//!         Box::new(XkbCompiler::new()),
//!         &config.keyboard,
//!     )?;
//!     let window = Window::new(&mut session.borrow_mut(), 640, 480, "Window", "demo")?;
//!     let code = reactor.run()?;
//!     window.close(&mut session.borrow_mut())?;
//!     session.borrow_mut().disconnect()?;
//!     std::process::exit(code);
//! }
//! ```

pub mod backend;
pub mod config;
pub mod error;
pub mod interrupt;
pub mod keyboard;
pub mod protocol;
pub mod reactor;
pub mod seat;
pub mod session;
pub mod testing;
pub mod window;

pub use backend::WaylandTransport;
pub use config::SessionConfig;
pub use error::{Error, Result};
pub use keyboard::{KeyboardDecoder, XkbCompiler};
pub use protocol::Protocol;
pub use reactor::{Reactor, ShutdownCode, EXIT_INTERRUPTED, EXIT_QUIT_KEY};
pub use session::{Session, WindowEvent};
pub use window::Window;

/// Version information for wlsession
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

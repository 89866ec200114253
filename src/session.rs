//! The display connection and everything keyed off it
//!
//! A [`Session`] owns the transport, binds the globals it needs during two
//! startup round-trips, tracks seats, and keeps the table of our surfaces
//! used to route pointer, keyboard and shell events to windows.

use crate::config::KeyboardConfig;
use crate::error::{Error, Result};
use crate::keyboard::LayoutCompiler;
use crate::protocol::{Event, GlobalName, Interface, PixelFormat, Protocol, ShellEvent, SurfaceId};
use crate::reactor::{FdWatcher, Reactor, ShutdownCode};
use crate::seat::{Seat, SeatContext};
use log::{debug, info, warn};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::os::fd::RawFd;
use std::rc::Rc;

/// Input routed to one of our windows
#[derive(Debug, Clone, PartialEq)]
pub enum WindowEvent {
    PointerEnter {
        seat: GlobalName,
        x: f64,
        y: f64,
    },
    PointerLeave {
        seat: GlobalName,
    },
    PointerMotion {
        seat: GlobalName,
        time: u32,
        x: f64,
        y: f64,
    },
    PointerButton {
        seat: GlobalName,
        time: u32,
        button: u32,
        pressed: bool,
    },
    PointerAxis {
        seat: GlobalName,
        time: u32,
        axis: u32,
        value: f64,
    },
    KeyboardFocus {
        seat: GlobalName,
        focused: bool,
    },
    Text {
        seat: GlobalName,
        text: String,
    },
    CloseRequested,
}

#[derive(Debug, Default)]
struct SurfaceEntry {
    inbox: VecDeque<WindowEvent>,
    configured: bool,
    close_requested: bool,
}

/// Registration of every surface a window has attached to the session.
///
/// The session owns the registration, not the window.
#[derive(Debug, Default)]
pub struct SurfaceTable {
    entries: HashMap<SurfaceId, SurfaceEntry>,
}

impl SurfaceTable {
    pub fn insert(&mut self, surface: SurfaceId) {
        self.entries.entry(surface).or_default();
    }

    pub fn remove(&mut self, surface: SurfaceId) -> bool {
        self.entries.remove(&surface).is_some()
    }

    pub fn contains(&self, surface: SurfaceId) -> bool {
        self.entries.contains_key(&surface)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Queue an event for the window owning `surface`; unknown surfaces
    /// drop it
    pub fn push_event(&mut self, surface: SurfaceId, event: WindowEvent) {
        if let Some(entry) = self.entries.get_mut(&surface) {
            entry.inbox.push_back(event);
        }
    }

    pub fn take_events(&mut self, surface: SurfaceId) -> Vec<WindowEvent> {
        self.entries
            .get_mut(&surface)
            .map(|e| e.inbox.drain(..).collect())
            .unwrap_or_default()
    }

    pub fn is_configured(&self, surface: SurfaceId) -> bool {
        self.entries.get(&surface).is_some_and(|e| e.configured)
    }

    pub fn close_requested(&self, surface: SurfaceId) -> bool {
        self.entries.get(&surface).is_some_and(|e| e.close_requested)
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Globals {
    compositor: Option<GlobalName>,
    shell: Option<GlobalName>,
    shm: Option<GlobalName>,
}

/// The connection session
pub struct Session<P: Protocol> {
    protocol: P,
    shutdown: ShutdownCode,
    compiler: Box<dyn LayoutCompiler>,
    quit_character: char,
    globals: Globals,
    pixel_formats: Vec<PixelFormat>,
    seats: Vec<Seat>,
    /// Seats whose global went away; late events for them are dropped
    removed_seats: HashSet<GlobalName>,
    surfaces: SurfaceTable,
}

impl<P: Protocol + 'static> Session<P> {
    /// Set up the session and register it with the reactor as an fd watcher
    /// (read → receive and dispatch) and a preselect hook (flush).
    pub fn connect(
        reactor: &mut Reactor,
        protocol: P,
        compiler: Box<dyn LayoutCompiler>,
        keyboard: &KeyboardConfig,
    ) -> Result<Rc<RefCell<Self>>> {
        let session = Self::new(protocol, reactor.shutdown(), compiler, keyboard)?;
        let session = Rc::new(RefCell::new(session));

        let watcher: Rc<RefCell<dyn FdWatcher>> = session.clone();
        reactor.add_watcher(Rc::downgrade(&watcher));

        let weak = Rc::downgrade(&session);
        reactor.add_preselect(move || {
            if let Some(session) = weak.upgrade() {
                session.borrow_mut().flush()?;
            }
            Ok(())
        });

        Ok(session)
    }
}

impl<P: Protocol> Session<P> {
    /// Perform the two startup round-trips without touching any reactor.
    ///
    /// The first binds the mandatory globals; the second collects the pixel
    /// formats, which are only sent once `wl_shm` is bound.
    pub fn new(
        protocol: P,
        shutdown: ShutdownCode,
        compiler: Box<dyn LayoutCompiler>,
        keyboard: &KeyboardConfig,
    ) -> Result<Self> {
        let mut session = Self {
            protocol,
            shutdown,
            compiler,
            quit_character: keyboard.quit_character,
            globals: Globals::default(),
            pixel_formats: Vec::new(),
            seats: Vec::new(),
            removed_seats: HashSet::new(),
            surfaces: SurfaceTable::default(),
        };

        session.roundtrip()?;
        if session.globals.compositor.is_none() {
            return Err(Error::MissingGlobal(Interface::Compositor.name()));
        }
        if session.globals.shell.is_none() {
            return Err(Error::MissingGlobal(Interface::Shell.name()));
        }
        if session.globals.shm.is_none() {
            return Err(Error::MissingGlobal(Interface::Shm.name()));
        }

        session.roundtrip()?;
        if session.pixel_formats.is_empty() {
            return Err(Error::NoPixelFormats);
        }
        info!(
            "session ready: {} pixel format(s), {} seat(s)",
            session.pixel_formats.len(),
            session.seats.len()
        );
        Ok(session)
    }

    pub fn protocol(&self) -> &P {
        &self.protocol
    }

    pub fn protocol_mut(&mut self) -> &mut P {
        &mut self.protocol
    }

    pub fn shutdown(&self) -> &ShutdownCode {
        &self.shutdown
    }

    /// Usable formats in advertisement order, most preferred first
    pub fn pixel_formats(&self) -> &[PixelFormat] {
        &self.pixel_formats
    }

    pub fn seats(&self) -> &[Seat] {
        &self.seats
    }

    pub fn surfaces(&self) -> &SurfaceTable {
        &self.surfaces
    }

    pub fn register_surface(&mut self, surface: SurfaceId) {
        self.surfaces.insert(surface);
    }

    pub fn unregister_surface(&mut self, surface: SurfaceId) {
        self.surfaces.remove(surface);
    }

    pub fn take_window_events(&mut self, surface: SurfaceId) -> Vec<WindowEvent> {
        self.surfaces.take_events(surface)
    }

    pub fn flush(&mut self) -> Result<()> {
        self.protocol.flush()
    }

    /// Round-trip with the compositor and handle everything it sent
    pub fn roundtrip(&mut self) -> Result<()> {
        let events = self.protocol.roundtrip()?;
        self.dispatch(events)
    }

    /// Receive whatever is readable and handle it
    pub fn receive(&mut self) -> Result<()> {
        let events = self.protocol.receive()?;
        self.dispatch(events)
    }

    /// Final round-trip, then close the transport
    pub fn disconnect(&mut self) -> Result<()> {
        self.roundtrip()?;
        self.protocol.disconnect()
    }

    pub fn dispatch(&mut self, events: Vec<Event>) -> Result<()> {
        for event in events {
            self.handle_event(event)?;
        }
        Ok(())
    }

    pub fn handle_event(&mut self, event: Event) -> Result<()> {
        match event {
            Event::Global {
                name,
                interface,
                version,
            } => self.global_added(name, &interface, version),
            Event::GlobalRemove { name } => self.global_removed(name),
            Event::ShmFormat(code) => {
                match PixelFormat::from_wl(code) {
                    Some(format) if !self.pixel_formats.contains(&format) => {
                        debug!("shm format {:?}", format);
                        self.pixel_formats.push(format);
                    }
                    Some(_) => {}
                    None => debug!("ignoring shm format {:#x}", code),
                }
                Ok(())
            }
            Event::Ping { serial } => self.protocol.pong(serial),
            Event::Shell { surface, event } => self.shell_event(surface, event),
            Event::Seat { seat, event } => {
                let Self {
                    protocol,
                    seats,
                    removed_seats,
                    ..
                } = self;
                match seats.iter_mut().find(|s| s.global() == seat) {
                    Some(s) => s.handle_event(event, protocol),
                    None if removed_seats.contains(&seat) => {
                        debug!("late event for removed seat {}: {:?}", seat, event);
                        Ok(())
                    }
                    None => Err(Error::Protocol(format!("event for unknown seat {}", seat))),
                }
            }
            Event::Pointer { seat, event } => {
                self.with_seat(seat, |s, ctx| s.handle_pointer(event, ctx))
            }
            Event::Keyboard { seat, event } => {
                self.with_seat(seat, |s, ctx| s.handle_keyboard(event, ctx))
            }
        }
    }

    fn with_seat(
        &mut self,
        seat: GlobalName,
        f: impl FnOnce(&mut Seat, &mut SeatContext<'_>) -> Result<()>,
    ) -> Result<()> {
        let Self {
            protocol,
            shutdown,
            compiler,
            quit_character,
            seats,
            removed_seats,
            surfaces,
            ..
        } = self;
        let Some(target) = seats.iter_mut().find(|s| s.global() == seat) else {
            if removed_seats.contains(&seat) {
                debug!("late device event for removed seat {}", seat);
                return Ok(());
            }
            return Err(Error::Protocol(format!("event for unknown seat {}", seat)));
        };
        let mut ctx = SeatContext {
            protocol,
            surfaces,
            compiler: &**compiler,
            shutdown,
            quit_character: *quit_character,
        };
        f(target, &mut ctx)
    }

    fn global_added(&mut self, name: GlobalName, interface: &str, version: u32) -> Result<()> {
        debug!("global {} is {} v{}", name, interface, version);
        let Some(kind) = Interface::from_name(interface) else {
            return Ok(());
        };
        match kind {
            Interface::Compositor if self.globals.compositor.is_none() => {
                self.protocol.bind(name, kind, version)?;
                self.globals.compositor = Some(name);
            }
            Interface::Shell if self.globals.shell.is_none() => {
                self.protocol.bind(name, kind, version)?;
                self.globals.shell = Some(name);
            }
            Interface::Shm if self.globals.shm.is_none() => {
                self.protocol.bind(name, kind, version)?;
                self.globals.shm = Some(name);
            }
            Interface::Seat => {
                self.protocol.bind(name, kind, version)?;
                self.seats.push(Seat::new(name));
            }
            _ => debug!("already bound a {}, ignoring global {}", interface, name),
        }
        Ok(())
    }

    fn global_removed(&mut self, name: GlobalName) -> Result<()> {
        debug!("global {} gone", name);
        if let Some(index) = self.seats.iter().position(|s| s.global() == name) {
            let mut seat = self.seats.remove(index);
            self.removed_seats.insert(name);
            seat.removed(&mut self.protocol)?;
        }
        Ok(())
    }

    fn shell_event(&mut self, surface: SurfaceId, event: ShellEvent) -> Result<()> {
        let Some(entry) = self.surfaces.entries.get_mut(&surface) else {
            warn!("shell event for unknown {}: {:?}", surface, event);
            return Ok(());
        };
        match event {
            ShellEvent::Configure { serial } => {
                entry.configured = true;
                self.protocol.ack_configure(surface, serial)
            }
            ShellEvent::Close => {
                info!("close requested for {}", surface);
                entry.close_requested = true;
                entry.inbox.push_back(WindowEvent::CloseRequested);
                Ok(())
            }
        }
    }
}

impl<P: Protocol> FdWatcher for Session<P> {
    fn fd(&self) -> RawFd {
        self.protocol.fd()
    }

    fn on_readable(&mut self) -> anyhow::Result<()> {
        self.receive()?;
        Ok(())
    }
}

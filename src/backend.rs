//! The real transport: a Wayland display connection
//!
//! [`WaylandTransport`] implements [`Protocol`] on top of `wayland-client`.
//! Proxies are kept in maps keyed by the small ids the rest of the crate
//! uses, and every wire event is translated into a typed [`Event`] that is
//! handed back from `receive` / `roundtrip`.

use crate::error::{Error, Result};
use crate::protocol::{
    BufferId, Capability, Event, GlobalName, Interface, KeyboardEvent, PixelFormat, PointerEvent,
    PoolId, Protocol, Rect, SeatEvent, ShellEvent, SurfaceId,
};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};
use wayland_backend::client::WaylandError;
use wayland_client::protocol::{
    wl_buffer, wl_compositor, wl_keyboard, wl_pointer, wl_registry, wl_seat, wl_shm, wl_shm_pool,
    wl_surface,
};
use wayland_client::{delegate_noop, Connection, Dispatch, EventQueue, Proxy, QueueHandle, WEnum};
use wayland_protocols::xdg::shell::client::{xdg_surface, xdg_toplevel, xdg_wm_base};

/// Highest interface versions this client speaks
const COMPOSITOR_VERSION: u32 = 4;
const SHM_VERSION: u32 = 1;
const WM_BASE_VERSION: u32 = 2;
const SEAT_VERSION: u32 = 5;

/// First version of `wl_pointer` / `wl_keyboard` with a `release` request
const RELEASE_SINCE: u32 = 3;
/// First version of `wl_seat` with a `release` request
const SEAT_RELEASE_SINCE: u32 = 5;

/// Dispatch target: collects translated events until the transport drains
/// them
#[derive(Default)]
pub struct Inbox {
    events: Vec<Event>,
}

impl Inbox {
    fn push(&mut self, event: Event) {
        self.events.push(event);
    }
}

struct SeatProxies {
    seat: wl_seat::WlSeat,
    pointer: Option<wl_pointer::WlPointer>,
    keyboard: Option<wl_keyboard::WlKeyboard>,
}

struct SurfaceProxies {
    surface: wl_surface::WlSurface,
    xdg: Option<(xdg_surface::XdgSurface, xdg_toplevel::XdgToplevel)>,
}

pub struct WaylandTransport {
    conn: Connection,
    queue: EventQueue<Inbox>,
    qh: QueueHandle<Inbox>,
    registry: wl_registry::WlRegistry,
    inbox: Inbox,
    compositor: Option<wl_compositor::WlCompositor>,
    shm: Option<wl_shm::WlShm>,
    wm_base: Option<xdg_wm_base::XdgWmBase>,
    seats: HashMap<GlobalName, SeatProxies>,
    surfaces: HashMap<SurfaceId, SurfaceProxies>,
    pools: HashMap<PoolId, wl_shm_pool::WlShmPool>,
    buffers: HashMap<BufferId, wl_buffer::WlBuffer>,
}

impl WaylandTransport {
    /// Connect to the display named by `WAYLAND_DISPLAY` and request the
    /// registry. No round-trip happens here.
    pub fn connect() -> Result<Self> {
        let conn = Connection::connect_to_env()?;
        let queue = conn.new_event_queue();
        let qh = queue.handle();
        let registry = conn.display().get_registry(&qh, ());
        info!("connected to the display");

        Ok(Self {
            conn,
            queue,
            qh,
            registry,
            inbox: Inbox::default(),
            compositor: None,
            shm: None,
            wm_base: None,
            seats: HashMap::new(),
            surfaces: HashMap::new(),
            pools: HashMap::new(),
            buffers: HashMap::new(),
        })
    }

    fn take_events(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.inbox.events)
    }

    fn surface(&self, id: SurfaceId) -> Result<&SurfaceProxies> {
        self.surfaces.get(&id).ok_or(Error::UnknownObject {
            kind: "surface",
            id: id.0,
        })
    }

    fn toplevel(&self, id: SurfaceId) -> Result<&(xdg_surface::XdgSurface, xdg_toplevel::XdgToplevel)> {
        self.surface(id)?.xdg.as_ref().ok_or(Error::UnknownObject {
            kind: "toplevel",
            id: id.0,
        })
    }

    fn seat(&self, name: GlobalName) -> Result<&SeatProxies> {
        self.seats.get(&name).ok_or(Error::UnknownObject {
            kind: "seat",
            id: name,
        })
    }

    fn seat_mut(&mut self, name: GlobalName) -> Result<&mut SeatProxies> {
        self.seats.get_mut(&name).ok_or(Error::UnknownObject {
            kind: "seat",
            id: name,
        })
    }
}

fn shm_format(format: PixelFormat) -> wl_shm::Format {
    match format {
        PixelFormat::Argb8888 => wl_shm::Format::Argb8888,
        PixelFormat::Xrgb8888 => wl_shm::Format::Xrgb8888,
        PixelFormat::Rgb565 => wl_shm::Format::Rgb565,
    }
}

impl Protocol for WaylandTransport {
    fn fd(&self) -> RawFd {
        self.conn.backend().poll_fd().as_raw_fd()
    }

    fn flush(&mut self) -> Result<()> {
        match self.conn.flush() {
            // Socket full; the rest goes out on the next flush
            Err(WaylandError::Io(e)) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            other => Ok(other?),
        }
    }

    fn receive(&mut self) -> Result<Vec<Event>> {
        if let Some(guard) = self.queue.prepare_read() {
            match guard.read() {
                Ok(n) => debug!("read {} message(s)", n),
                Err(WaylandError::Io(e)) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e.into()),
            }
        }
        self.queue.dispatch_pending(&mut self.inbox)?;
        Ok(self.take_events())
    }

    fn roundtrip(&mut self) -> Result<Vec<Event>> {
        self.queue.roundtrip(&mut self.inbox)?;
        Ok(self.take_events())
    }

    fn disconnect(&mut self) -> Result<()> {
        for (_, proxies) in self.surfaces.drain() {
            if let Some((xdg, toplevel)) = proxies.xdg {
                toplevel.destroy();
                xdg.destroy();
            }
            proxies.surface.destroy();
        }
        for (_, buffer) in self.buffers.drain() {
            buffer.destroy();
        }
        for (_, pool) in self.pools.drain() {
            pool.destroy();
        }
        if let Some(wm_base) = self.wm_base.take() {
            wm_base.destroy();
        }
        self.seats.clear();
        self.compositor = None;
        self.shm = None;
        self.conn.flush()?;
        info!("disconnected from the display");
        Ok(())
    }

    fn bind(&mut self, name: GlobalName, interface: Interface, version: u32) -> Result<()> {
        let qh = &self.qh;
        match interface {
            Interface::Compositor => {
                self.compositor = Some(self.registry.bind(
                    name,
                    version.min(COMPOSITOR_VERSION),
                    qh,
                    (),
                ));
            }
            Interface::Shell => {
                self.wm_base = Some(self.registry.bind(name, version.min(WM_BASE_VERSION), qh, ()));
            }
            Interface::Shm => {
                self.shm = Some(self.registry.bind(name, version.min(SHM_VERSION), qh, ()));
            }
            Interface::Seat => {
                let seat = self
                    .registry
                    .bind(name, version.min(SEAT_VERSION), qh, name);
                self.seats.insert(
                    name,
                    SeatProxies {
                        seat,
                        pointer: None,
                        keyboard: None,
                    },
                );
            }
        }
        debug!("bound {} (global {})", interface.name(), name);
        Ok(())
    }

    fn create_surface(&mut self) -> Result<SurfaceId> {
        let compositor = self
            .compositor
            .as_ref()
            .ok_or(Error::MissingGlobal(Interface::Compositor.name()))?;
        let surface = compositor.create_surface(&self.qh, ());
        let id = SurfaceId(surface.id().protocol_id());
        self.surfaces
            .insert(id, SurfaceProxies { surface, xdg: None });
        Ok(id)
    }

    fn destroy_surface(&mut self, surface: SurfaceId) -> Result<()> {
        let proxies = self.surfaces.remove(&surface).ok_or(Error::UnknownObject {
            kind: "surface",
            id: surface.0,
        })?;
        if let Some((xdg, toplevel)) = proxies.xdg {
            toplevel.destroy();
            xdg.destroy();
        }
        proxies.surface.destroy();
        Ok(())
    }

    fn attach(&mut self, surface: SurfaceId, buffer: Option<BufferId>, x: i32, y: i32) -> Result<()> {
        let buffer = match buffer {
            Some(id) => Some(self.buffers.get(&id).ok_or(Error::UnknownObject {
                kind: "buffer",
                id: id.0,
            })?),
            None => None,
        };
        self.surface(surface)?.surface.attach(buffer, x, y);
        Ok(())
    }

    fn damage(&mut self, surface: SurfaceId, rect: Rect) -> Result<()> {
        self.surface(surface)?
            .surface
            .damage(rect.x, rect.y, rect.width, rect.height);
        Ok(())
    }

    fn commit(&mut self, surface: SurfaceId) -> Result<()> {
        self.surface(surface)?.surface.commit();
        Ok(())
    }

    fn create_toplevel(&mut self, surface: SurfaceId, title: &str, app_id: &str) -> Result<()> {
        let wm_base = self
            .wm_base
            .as_ref()
            .ok_or(Error::MissingGlobal(Interface::Shell.name()))?;
        let proxies = self.surfaces.get_mut(&surface).ok_or(Error::UnknownObject {
            kind: "surface",
            id: surface.0,
        })?;
        let xdg = wm_base.get_xdg_surface(&proxies.surface, &self.qh, surface);
        let toplevel = xdg.get_toplevel(&self.qh, surface);
        toplevel.set_title(title.to_string());
        toplevel.set_app_id(app_id.to_string());
        proxies.xdg = Some((xdg, toplevel));
        Ok(())
    }

    fn ack_configure(&mut self, surface: SurfaceId, serial: u32) -> Result<()> {
        self.toplevel(surface)?.0.ack_configure(serial);
        Ok(())
    }

    fn pong(&mut self, serial: u32) -> Result<()> {
        let wm_base = self
            .wm_base
            .as_ref()
            .ok_or(Error::MissingGlobal(Interface::Shell.name()))?;
        wm_base.pong(serial);
        Ok(())
    }

    fn move_toplevel(&mut self, surface: SurfaceId, seat: GlobalName, serial: u32) -> Result<()> {
        let seat = &self.seat(seat)?.seat;
        self.toplevel(surface)?.1._move(seat, serial);
        Ok(())
    }

    fn create_pool(&mut self, fd: BorrowedFd<'_>, size: i32) -> Result<PoolId> {
        let shm = self
            .shm
            .as_ref()
            .ok_or(Error::MissingGlobal(Interface::Shm.name()))?;
        let pool = shm.create_pool(fd, size, &self.qh, ());
        let id = PoolId(pool.id().protocol_id());
        self.pools.insert(id, pool);
        Ok(id)
    }

    fn destroy_pool(&mut self, pool: PoolId) -> Result<()> {
        self.pools
            .remove(&pool)
            .ok_or(Error::UnknownObject {
                kind: "pool",
                id: pool.0,
            })?
            .destroy();
        Ok(())
    }

    fn create_buffer(
        &mut self,
        pool: PoolId,
        offset: i32,
        width: i32,
        height: i32,
        stride: i32,
        format: PixelFormat,
    ) -> Result<BufferId> {
        let buffer = self
            .pools
            .get(&pool)
            .ok_or(Error::UnknownObject {
                kind: "pool",
                id: pool.0,
            })?
            .create_buffer(offset, width, height, stride, shm_format(format), &self.qh, ());
        let id = BufferId(buffer.id().protocol_id());
        self.buffers.insert(id, buffer);
        Ok(id)
    }

    fn destroy_buffer(&mut self, buffer: BufferId) -> Result<()> {
        self.buffers
            .remove(&buffer)
            .ok_or(Error::UnknownObject {
                kind: "buffer",
                id: buffer.0,
            })?
            .destroy();
        Ok(())
    }

    fn get_pointer(&mut self, seat: GlobalName) -> Result<()> {
        let qh = self.qh.clone();
        let proxies = self.seat_mut(seat)?;
        proxies.pointer = Some(proxies.seat.get_pointer(&qh, seat));
        Ok(())
    }

    fn release_pointer(&mut self, seat: GlobalName) -> Result<()> {
        if let Some(pointer) = self.seat_mut(seat)?.pointer.take() {
            if pointer.version() >= RELEASE_SINCE {
                pointer.release();
            }
        }
        Ok(())
    }

    fn hide_cursor(&mut self, seat: GlobalName, serial: u32) -> Result<()> {
        if let Some(pointer) = &self.seat(seat)?.pointer {
            pointer.set_cursor(serial, None, 0, 0);
        }
        Ok(())
    }

    fn get_keyboard(&mut self, seat: GlobalName) -> Result<()> {
        let qh = self.qh.clone();
        let proxies = self.seat_mut(seat)?;
        proxies.keyboard = Some(proxies.seat.get_keyboard(&qh, seat));
        Ok(())
    }

    fn release_keyboard(&mut self, seat: GlobalName) -> Result<()> {
        if let Some(keyboard) = self.seat_mut(seat)?.keyboard.take() {
            if keyboard.version() >= RELEASE_SINCE {
                keyboard.release();
            }
        }
        Ok(())
    }

    fn release_seat(&mut self, seat: GlobalName) -> Result<()> {
        let proxies = self.seats.remove(&seat).ok_or(Error::UnknownObject {
            kind: "seat",
            id: seat,
        })?;
        if proxies.seat.version() >= SEAT_RELEASE_SINCE {
            proxies.seat.release();
        }
        Ok(())
    }
}

impl Dispatch<wl_registry::WlRegistry, ()> for Inbox {
    fn event(
        state: &mut Self,
        _registry: &wl_registry::WlRegistry,
        event: wl_registry::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        match event {
            wl_registry::Event::Global {
                name,
                interface,
                version,
            } => state.push(Event::Global {
                name,
                interface,
                version,
            }),
            wl_registry::Event::GlobalRemove { name } => state.push(Event::GlobalRemove { name }),
            _ => {}
        }
    }
}

impl Dispatch<wl_shm::WlShm, ()> for Inbox {
    fn event(
        state: &mut Self,
        _shm: &wl_shm::WlShm,
        event: wl_shm::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        if let wl_shm::Event::Format { format } = event {
            state.push(Event::ShmFormat(u32::from(format)));
        }
    }
}

impl Dispatch<xdg_wm_base::XdgWmBase, ()> for Inbox {
    fn event(
        state: &mut Self,
        _wm_base: &xdg_wm_base::XdgWmBase,
        event: xdg_wm_base::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        if let xdg_wm_base::Event::Ping { serial } = event {
            state.push(Event::Ping { serial });
        }
    }
}

impl Dispatch<xdg_surface::XdgSurface, SurfaceId> for Inbox {
    fn event(
        state: &mut Self,
        _xdg: &xdg_surface::XdgSurface,
        event: xdg_surface::Event,
        surface: &SurfaceId,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        if let xdg_surface::Event::Configure { serial } = event {
            state.push(Event::Shell {
                surface: *surface,
                event: ShellEvent::Configure { serial },
            });
        }
    }
}

impl Dispatch<xdg_toplevel::XdgToplevel, SurfaceId> for Inbox {
    fn event(
        state: &mut Self,
        _toplevel: &xdg_toplevel::XdgToplevel,
        event: xdg_toplevel::Event,
        surface: &SurfaceId,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        match event {
            xdg_toplevel::Event::Close => state.push(Event::Shell {
                surface: *surface,
                event: ShellEvent::Close,
            }),
            // The buffer size is fixed; suggested sizes are only logged
            xdg_toplevel::Event::Configure { width, height, .. } => {
                debug!("{} suggested size {}x{}", surface, width, height)
            }
            _ => {}
        }
    }
}

impl Dispatch<wl_seat::WlSeat, GlobalName> for Inbox {
    fn event(
        state: &mut Self,
        _seat: &wl_seat::WlSeat,
        event: wl_seat::Event,
        seat: &GlobalName,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        let event = match event {
            wl_seat::Event::Capabilities { capabilities } => {
                SeatEvent::Capabilities(Capability::from_bits_truncate(u32::from(capabilities)))
            }
            wl_seat::Event::Name { name } => SeatEvent::Name(name),
            _ => return,
        };
        state.push(Event::Seat { seat: *seat, event });
    }
}

fn surface_id(surface: &wl_surface::WlSurface) -> SurfaceId {
    SurfaceId(surface.id().protocol_id())
}

impl Dispatch<wl_pointer::WlPointer, GlobalName> for Inbox {
    fn event(
        state: &mut Self,
        _pointer: &wl_pointer::WlPointer,
        event: wl_pointer::Event,
        seat: &GlobalName,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        let event = match event {
            wl_pointer::Event::Enter {
                serial,
                surface,
                surface_x,
                surface_y,
            } => PointerEvent::Enter {
                serial,
                surface: surface_id(&surface),
                x: surface_x,
                y: surface_y,
            },
            wl_pointer::Event::Leave { serial, surface } => PointerEvent::Leave {
                serial,
                surface: surface_id(&surface),
            },
            wl_pointer::Event::Motion {
                time,
                surface_x,
                surface_y,
            } => PointerEvent::Motion {
                time,
                x: surface_x,
                y: surface_y,
            },
            wl_pointer::Event::Button {
                serial,
                time,
                button,
                state: button_state,
            } => PointerEvent::Button {
                serial,
                time,
                button,
                pressed: button_state == WEnum::Value(wl_pointer::ButtonState::Pressed),
            },
            wl_pointer::Event::Axis { time, axis, value } => PointerEvent::Axis {
                time,
                axis: u32::from(axis),
                value,
            },
            _ => return,
        };
        state.push(Event::Pointer { seat: *seat, event });
    }
}

impl Dispatch<wl_keyboard::WlKeyboard, GlobalName> for Inbox {
    fn event(
        state: &mut Self,
        _keyboard: &wl_keyboard::WlKeyboard,
        event: wl_keyboard::Event,
        seat: &GlobalName,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        let event = match event {
            wl_keyboard::Event::Keymap { format, fd, size } => KeyboardEvent::Keymap {
                format: u32::from(format),
                fd,
                size,
            },
            wl_keyboard::Event::Enter {
                serial,
                surface,
                keys,
            } => KeyboardEvent::Enter {
                serial,
                surface: surface_id(&surface),
                keys: keys
                    .chunks_exact(4)
                    .map(|b| u32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
                    .collect(),
            },
            wl_keyboard::Event::Leave { serial, surface } => KeyboardEvent::Leave {
                serial,
                surface: surface_id(&surface),
            },
            wl_keyboard::Event::Key {
                serial,
                time,
                key,
                state: key_state,
            } => KeyboardEvent::Key {
                serial,
                time,
                key,
                pressed: key_state == WEnum::Value(wl_keyboard::KeyState::Pressed),
            },
            wl_keyboard::Event::Modifiers {
                serial,
                mods_depressed,
                mods_latched,
                mods_locked,
                group,
            } => KeyboardEvent::Modifiers {
                serial,
                depressed: mods_depressed,
                latched: mods_latched,
                locked: mods_locked,
                group,
            },
            wl_keyboard::Event::RepeatInfo { rate, delay } => {
                KeyboardEvent::RepeatInfo { rate, delay }
            }
            other => {
                warn!("unhandled keyboard event {:?}", other);
                return;
            }
        };
        state.push(Event::Keyboard { seat: *seat, event });
    }
}

delegate_noop!(Inbox: wl_compositor::WlCompositor);
delegate_noop!(Inbox: wl_shm_pool::WlShmPool);
delegate_noop!(Inbox: ignore wl_surface::WlSurface);
delegate_noop!(Inbox: ignore wl_buffer::WlBuffer);

//! In-memory stand-ins for the compositor and the layout compiler
//!
//! [`FakeProtocol`] records every request and answers round-trips with a
//! scripted event queue, enough to run a whole session headless. Queued
//! events also make its descriptor readable, so it can sit in a reactor.
//! [`TableCompiler`] understands a tiny keymap text of `keycode=char` pairs.

use crate::error::{Error, Result};
use crate::keyboard::{CompiledKeymap, KeyState, LayoutCompiler, ModifierState};
use crate::protocol::{
    BufferId, Event, GlobalName, Interface, PixelFormat, PoolId, Protocol, Rect, ShellEvent,
    SurfaceId,
};
use crate::window::anonymous_file;
use std::collections::{HashMap, HashSet, VecDeque};
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

/// One request made through [`FakeProtocol`]
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Flush,
    Disconnect,
    Bind(GlobalName, Interface),
    CreateSurface(SurfaceId),
    DestroySurface(SurfaceId),
    Attach(SurfaceId, Option<BufferId>),
    Damage(SurfaceId, Rect),
    Commit(SurfaceId),
    CreateToplevel(SurfaceId, String, String),
    AckConfigure(SurfaceId, u32),
    Pong(u32),
    Move(SurfaceId, GlobalName, u32),
    CreatePool(PoolId, i32),
    DestroyPool(PoolId),
    CreateBuffer {
        buffer: BufferId,
        pool: PoolId,
        offset: i32,
        width: i32,
        height: i32,
        stride: i32,
        format: PixelFormat,
    },
    DestroyBuffer(BufferId),
    GetPointer(GlobalName),
    ReleasePointer(GlobalName),
    HideCursor(GlobalName, u32),
    GetKeyboard(GlobalName),
    ReleaseKeyboard(GlobalName),
    ReleaseSeat(GlobalName),
}

/// Scripted compositor
pub struct FakeProtocol {
    wake: Option<(UnixStream, UnixStream)>,
    requests: Vec<Request>,
    pending: VecDeque<Event>,
    formats: Vec<u32>,
    next_id: u32,
    serial: u32,
    roundtrips: u32,
    pools: HashSet<PoolId>,
    surfaces: HashSet<SurfaceId>,
    pointers: HashSet<GlobalName>,
    keyboards: HashSet<GlobalName>,
}

impl Default for FakeProtocol {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeProtocol {
    /// A compositor advertising nothing
    pub fn new() -> Self {
        Self {
            wake: wake_pair().ok(),
            requests: Vec::new(),
            pending: VecDeque::new(),
            formats: vec![PixelFormat::Argb8888.wl_code()],
            next_id: 100,
            serial: 1000,
            roundtrips: 0,
            pools: HashSet::new(),
            surfaces: HashSet::new(),
            pointers: HashSet::new(),
            keyboards: HashSet::new(),
        }
    }

    pub fn with_globals(globals: &[(GlobalName, &str)]) -> Self {
        let mut fake = Self::new();
        for (name, interface) in globals {
            fake.add_global(*name, interface);
        }
        fake
    }

    /// The three mandatory globals plus `argb8888`
    pub fn compositor() -> Self {
        Self::with_globals(&[(1, "wl_compositor"), (2, "xdg_wm_base"), (3, "wl_shm")])
    }

    pub fn add_global(&mut self, name: GlobalName, interface: &str) {
        self.pending.push_back(Event::Global {
            name,
            interface: interface.to_string(),
            version: 1,
        });
    }

    /// Format codes sent once `wl_shm` is bound
    pub fn set_formats(&mut self, codes: &[u32]) {
        self.formats = codes.to_vec();
    }

    /// Queue an event for the next `receive` or `roundtrip`
    pub fn push_event(&mut self, event: Event) {
        self.pending.push_back(event);
        if let Some((_, writer)) = &mut self.wake {
            let _ = writer.write_all(&[1]);
        }
    }

    pub fn requests(&self) -> &[Request] {
        &self.requests
    }

    pub fn count(&self, pred: impl Fn(&Request) -> bool) -> usize {
        self.requests.iter().filter(|r| pred(r)).count()
    }

    pub fn roundtrips(&self) -> u32 {
        self.roundtrips
    }

    pub fn live_pools(&self) -> usize {
        self.pools.len()
    }

    fn drain(&mut self) -> Vec<Event> {
        if let Some((reader, _)) = &mut self.wake {
            let mut sink = [0u8; 64];
            while matches!(reader.read(&mut sink), Ok(n) if n > 0) {}
        }
        self.pending.drain(..).collect()
    }

    fn next_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    fn known_surface(&self, surface: SurfaceId) -> Result<()> {
        if self.surfaces.contains(&surface) {
            Ok(())
        } else {
            Err(Error::UnknownObject {
                kind: "surface",
                id: surface.0,
            })
        }
    }
}

impl Protocol for FakeProtocol {
    fn fd(&self) -> RawFd {
        self.wake.as_ref().map_or(-1, |(reader, _)| reader.as_raw_fd())
    }

    fn flush(&mut self) -> Result<()> {
        self.requests.push(Request::Flush);
        Ok(())
    }

    fn receive(&mut self) -> Result<Vec<Event>> {
        Ok(self.drain())
    }

    fn roundtrip(&mut self) -> Result<Vec<Event>> {
        self.roundtrips += 1;
        Ok(self.drain())
    }

    fn disconnect(&mut self) -> Result<()> {
        self.requests.push(Request::Disconnect);
        Ok(())
    }

    fn bind(&mut self, name: GlobalName, interface: Interface, _version: u32) -> Result<()> {
        self.requests.push(Request::Bind(name, interface));
        if interface == Interface::Shm {
            for code in self.formats.clone() {
                self.pending.push_back(Event::ShmFormat(code));
            }
        }
        Ok(())
    }

    fn create_surface(&mut self) -> Result<SurfaceId> {
        let surface = SurfaceId(self.next_id());
        self.surfaces.insert(surface);
        self.requests.push(Request::CreateSurface(surface));
        Ok(surface)
    }

    fn destroy_surface(&mut self, surface: SurfaceId) -> Result<()> {
        self.known_surface(surface)?;
        self.surfaces.remove(&surface);
        self.requests.push(Request::DestroySurface(surface));
        Ok(())
    }

    fn attach(
        &mut self,
        surface: SurfaceId,
        buffer: Option<BufferId>,
        _x: i32,
        _y: i32,
    ) -> Result<()> {
        self.known_surface(surface)?;
        self.requests.push(Request::Attach(surface, buffer));
        Ok(())
    }

    fn damage(&mut self, surface: SurfaceId, rect: Rect) -> Result<()> {
        self.known_surface(surface)?;
        self.requests.push(Request::Damage(surface, rect));
        Ok(())
    }

    fn commit(&mut self, surface: SurfaceId) -> Result<()> {
        self.known_surface(surface)?;
        self.requests.push(Request::Commit(surface));
        Ok(())
    }

    fn create_toplevel(&mut self, surface: SurfaceId, title: &str, app_id: &str) -> Result<()> {
        self.known_surface(surface)?;
        self.requests.push(Request::CreateToplevel(
            surface,
            title.to_string(),
            app_id.to_string(),
        ));
        self.serial += 1;
        self.pending.push_back(Event::Shell {
            surface,
            event: ShellEvent::Configure {
                serial: self.serial,
            },
        });
        Ok(())
    }

    fn ack_configure(&mut self, surface: SurfaceId, serial: u32) -> Result<()> {
        self.requests.push(Request::AckConfigure(surface, serial));
        Ok(())
    }

    fn pong(&mut self, serial: u32) -> Result<()> {
        self.requests.push(Request::Pong(serial));
        Ok(())
    }

    fn move_toplevel(&mut self, surface: SurfaceId, seat: GlobalName, serial: u32) -> Result<()> {
        self.known_surface(surface)?;
        self.requests.push(Request::Move(surface, seat, serial));
        Ok(())
    }

    fn create_pool(&mut self, _fd: BorrowedFd<'_>, size: i32) -> Result<PoolId> {
        let pool = PoolId(self.next_id());
        self.pools.insert(pool);
        self.requests.push(Request::CreatePool(pool, size));
        Ok(pool)
    }

    fn destroy_pool(&mut self, pool: PoolId) -> Result<()> {
        if !self.pools.remove(&pool) {
            return Err(Error::UnknownObject {
                kind: "pool",
                id: pool.0,
            });
        }
        self.requests.push(Request::DestroyPool(pool));
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
        if !self.pools.contains(&pool) {
            return Err(Error::UnknownObject {
                kind: "pool",
                id: pool.0,
            });
        }
        let buffer = BufferId(self.next_id());
        self.requests.push(Request::CreateBuffer {
            buffer,
            pool,
            offset,
            width,
            height,
            stride,
            format,
        });
        Ok(buffer)
    }

    fn destroy_buffer(&mut self, buffer: BufferId) -> Result<()> {
        self.requests.push(Request::DestroyBuffer(buffer));
        Ok(())
    }

    fn get_pointer(&mut self, seat: GlobalName) -> Result<()> {
        self.pointers.insert(seat);
        self.requests.push(Request::GetPointer(seat));
        Ok(())
    }

    fn release_pointer(&mut self, seat: GlobalName) -> Result<()> {
        if !self.pointers.remove(&seat) {
            return Err(Error::UnknownObject {
                kind: "pointer",
                id: seat,
            });
        }
        self.requests.push(Request::ReleasePointer(seat));
        Ok(())
    }

    fn hide_cursor(&mut self, seat: GlobalName, serial: u32) -> Result<()> {
        self.requests.push(Request::HideCursor(seat, serial));
        Ok(())
    }

    fn get_keyboard(&mut self, seat: GlobalName) -> Result<()> {
        self.keyboards.insert(seat);
        self.requests.push(Request::GetKeyboard(seat));
        Ok(())
    }

    fn release_keyboard(&mut self, seat: GlobalName) -> Result<()> {
        if !self.keyboards.remove(&seat) {
            return Err(Error::UnknownObject {
                kind: "keyboard",
                id: seat,
            });
        }
        self.requests.push(Request::ReleaseKeyboard(seat));
        Ok(())
    }

    fn release_seat(&mut self, seat: GlobalName) -> Result<()> {
        if self.pointers.contains(&seat) || self.keyboards.contains(&seat) {
            return Err(Error::Protocol(format!(
                "seat {} released with live devices",
                seat
            )));
        }
        self.requests.push(Request::ReleaseSeat(seat));
        Ok(())
    }
}

fn wake_pair() -> io::Result<(UnixStream, UnixStream)> {
    let (reader, writer) = UnixStream::pair()?;
    reader.set_nonblocking(true)?;
    Ok((reader, writer))
}

/// Compiles `"24=q 38=a"` style keymaps: xkb keycode to character. Bit 0
/// of the depressed modifiers acts as shift.
#[derive(Debug, Default, Clone, Copy)]
pub struct TableCompiler;

impl LayoutCompiler for TableCompiler {
    fn compile(&self, keymap: &str) -> Result<Box<dyn CompiledKeymap>> {
        let mut table = HashMap::new();
        for entry in keymap.split_whitespace() {
            let parsed = entry.split_once('=').and_then(|(code, ch)| {
                let code = code.parse::<u32>().ok()?;
                let mut chars = ch.chars();
                let c = chars.next()?;
                chars.next().is_none().then_some((code, c))
            });
            let (code, c) =
                parsed.ok_or_else(|| Error::Keymap(format!("bad keymap entry {:?}", entry)))?;
            table.insert(code, c);
        }
        Ok(Box::new(TableKeymap(table)))
    }
}

struct TableKeymap(HashMap<u32, char>);

impl CompiledKeymap for TableKeymap {
    fn new_state(&self) -> Box<dyn KeyState> {
        Box::new(TableState {
            table: self.0.clone(),
            mods: ModifierState::default(),
        })
    }
}

struct TableState {
    table: HashMap<u32, char>,
    mods: ModifierState,
}

impl KeyState for TableState {
    fn update_mask(&mut self, mods: &ModifierState) {
        self.mods = *mods;
    }

    fn key_utf8(&self, keycode: u32) -> String {
        let Some(c) = self.table.get(&keycode) else {
            return String::new();
        };
        if self.mods.depressed & 1 != 0 {
            c.to_uppercase().collect()
        } else {
            c.to_string()
        }
    }
}

/// A NUL-terminated keymap in anonymous shared memory, as a compositor
/// would send it
pub fn keymap_fd(text: &str) -> io::Result<(OwnedFd, u32)> {
    let mut file = anonymous_file("wlsession-keymap", 0)?;
    file.write_all(text.as_bytes())?;
    file.write_all(&[0])?;
    Ok((OwnedFd::from(file), text.len() as u32 + 1))
}

//! The narrow interface between the session core and the display protocol
//!
//! Wire encoding lives behind [`Protocol`]. The core sends requests through
//! its methods and receives the compositor's events as the typed [`Event`]
//! enum, one variant family per proxy kind. Objects are named by small
//! copyable ids; seats are named by their registry global name.

use crate::error::Result;
use bitflags::bitflags;
use std::fmt;
use std::os::fd::{BorrowedFd, OwnedFd, RawFd};

/// A surface, keyed by its protocol object id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SurfaceId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId(pub u32);

/// Registry name of a global; for seats this is also the seat's identity
pub type GlobalName = u32;

impl fmt::Display for SurfaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "surface@{}", self.0)
    }
}

/// Globals the session cares about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Interface {
    Compositor,
    Shell,
    Shm,
    Seat,
}

impl Interface {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "wl_compositor" => Some(Interface::Compositor),
            "xdg_wm_base" => Some(Interface::Shell),
            "wl_shm" => Some(Interface::Shm),
            "wl_seat" => Some(Interface::Seat),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Interface::Compositor => "wl_compositor",
            Interface::Shell => "xdg_wm_base",
            Interface::Shm => "wl_shm",
            Interface::Seat => "wl_seat",
        }
    }
}

bitflags! {
    /// Input device types a seat offers
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Capability: u32 {
        const POINTER = 1;
        const KEYBOARD = 2;
        const TOUCH = 4;
    }
}

/// Shared-memory pixel formats the session can draw into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    Argb8888,
    Xrgb8888,
    Rgb565,
}

impl PixelFormat {
    /// Map a `wl_shm` format code; unsupported codes yield `None`
    pub fn from_wl(code: u32) -> Option<Self> {
        match code {
            0 => Some(PixelFormat::Argb8888),
            1 => Some(PixelFormat::Xrgb8888),
            0x2036_3154 => Some(PixelFormat::Rgb565),
            _ => None,
        }
    }

    pub fn wl_code(&self) -> u32 {
        match self {
            PixelFormat::Argb8888 => 0,
            PixelFormat::Xrgb8888 => 1,
            PixelFormat::Rgb565 => 0x2036_3154,
        }
    }

    pub fn bytes_per_pixel(&self) -> u32 {
        match self {
            PixelFormat::Argb8888 | PixelFormat::Xrgb8888 => 4,
            PixelFormat::Rgb565 => 2,
        }
    }

    /// Row length in bytes, padded to a multiple of four. `None` when the
    /// row does not fit in a `u32`.
    pub fn stride_for_width(&self, width: u32) -> Option<u32> {
        self.bytes_per_pixel()
            .checked_mul(width)?
            .checked_add(3)
            .map(|bytes| bytes & !3)
    }
}

/// Axis-aligned rectangle in surface coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl Rect {
    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Smallest rectangle covering both
    pub fn union(&self, other: &Rect) -> Rect {
        let x1 = self.x.min(other.x);
        let y1 = self.y.min(other.y);
        let x2 = (self.x + self.width).max(other.x + other.width);
        let y2 = (self.y + self.height).max(other.y + other.height);
        Rect::new(x1, y1, x2 - x1, y2 - y1)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SeatEvent {
    Capabilities(Capability),
    Name(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum PointerEvent {
    Enter {
        serial: u32,
        surface: SurfaceId,
        x: f64,
        y: f64,
    },
    Leave {
        serial: u32,
        surface: SurfaceId,
    },
    Motion {
        time: u32,
        x: f64,
        y: f64,
    },
    Button {
        serial: u32,
        time: u32,
        button: u32,
        pressed: bool,
    },
    Axis {
        time: u32,
        axis: u32,
        value: f64,
    },
}

/// Keymap wire format advertised with a keymap event
pub const KEYMAP_FORMAT_XKB_V1: u32 = 1;

#[derive(Debug)]
pub enum KeyboardEvent {
    Keymap {
        format: u32,
        fd: OwnedFd,
        size: u32,
    },
    Enter {
        serial: u32,
        surface: SurfaceId,
        keys: Vec<u32>,
    },
    Leave {
        serial: u32,
        surface: SurfaceId,
    },
    Key {
        serial: u32,
        time: u32,
        key: u32,
        pressed: bool,
    },
    Modifiers {
        serial: u32,
        depressed: u32,
        latched: u32,
        locked: u32,
        group: u32,
    },
    RepeatInfo {
        rate: i32,
        delay: i32,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ShellEvent {
    Configure { serial: u32 },
    Close,
}

/// Everything the transport can deliver to the session
#[derive(Debug)]
pub enum Event {
    Global {
        name: GlobalName,
        interface: String,
        version: u32,
    },
    GlobalRemove {
        name: GlobalName,
    },
    ShmFormat(u32),
    Ping {
        serial: u32,
    },
    Seat {
        seat: GlobalName,
        event: SeatEvent,
    },
    Pointer {
        seat: GlobalName,
        event: PointerEvent,
    },
    Keyboard {
        seat: GlobalName,
        event: KeyboardEvent,
    },
    Shell {
        surface: SurfaceId,
        event: ShellEvent,
    },
}

/// Requests the session core makes of the display connection.
///
/// `receive` and `roundtrip` return the events decoded while they ran, in
/// wire order. Requests are buffered until `flush`.
pub trait Protocol {
    fn fd(&self) -> RawFd;
    fn flush(&mut self) -> Result<()>;
    /// Read whatever is available on the socket and decode pending events
    fn receive(&mut self) -> Result<Vec<Event>>;
    /// Block until every prior request has been processed by the peer
    fn roundtrip(&mut self) -> Result<Vec<Event>>;
    fn disconnect(&mut self) -> Result<()>;

    fn bind(&mut self, name: GlobalName, interface: Interface, version: u32) -> Result<()>;

    fn create_surface(&mut self) -> Result<SurfaceId>;
    fn destroy_surface(&mut self, surface: SurfaceId) -> Result<()>;
    fn attach(&mut self, surface: SurfaceId, buffer: Option<BufferId>, x: i32, y: i32)
        -> Result<()>;
    fn damage(&mut self, surface: SurfaceId, rect: Rect) -> Result<()>;
    fn commit(&mut self, surface: SurfaceId) -> Result<()>;

    fn create_toplevel(&mut self, surface: SurfaceId, title: &str, app_id: &str) -> Result<()>;
    fn ack_configure(&mut self, surface: SurfaceId, serial: u32) -> Result<()>;
    fn pong(&mut self, serial: u32) -> Result<()>;
    fn move_toplevel(&mut self, surface: SurfaceId, seat: GlobalName, serial: u32) -> Result<()>;

    fn create_pool(&mut self, fd: BorrowedFd<'_>, size: i32) -> Result<PoolId>;
    fn destroy_pool(&mut self, pool: PoolId) -> Result<()>;
    fn create_buffer(
        &mut self,
        pool: PoolId,
        offset: i32,
        width: i32,
        height: i32,
        stride: i32,
        format: PixelFormat,
    ) -> Result<BufferId>;
    fn destroy_buffer(&mut self, buffer: BufferId) -> Result<()>;

    fn get_pointer(&mut self, seat: GlobalName) -> Result<()>;
    fn release_pointer(&mut self, seat: GlobalName) -> Result<()>;
    /// Hide the cursor while the pointer is over one of our surfaces
    fn hide_cursor(&mut self, seat: GlobalName, serial: u32) -> Result<()>;
    fn get_keyboard(&mut self, seat: GlobalName) -> Result<()>;
    fn release_keyboard(&mut self, seat: GlobalName) -> Result<()>;
    /// Forget a seat whose global is gone. Devices are released first.
    fn release_seat(&mut self, seat: GlobalName) -> Result<()>;
}

//! Error types for the session core
//!
//! Nothing in the core catches and retries; every variant here propagates
//! out of the reactor and ends the session. Handler time budget overruns are
//! not errors at all, they are only logged (see [`crate::reactor::Budget`]).

use thiserror::Error;

/// Result alias used throughout the library
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// A mandatory global was not advertised by the compositor
    #[error("mandatory global `{0}` not advertised by the compositor")]
    MissingGlobal(&'static str),

    /// No usable shared-memory pixel format after the second round-trip
    #[error("no suitable shm pixel formats available")]
    NoPixelFormats,

    #[error("invalid window geometry {width}x{height}")]
    InvalidGeometry { width: u32, height: u32 },

    /// Shared-memory allocation or mapping failed
    #[error("shared memory allocation of {size} bytes failed: {source}")]
    ShmAllocation {
        size: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("keymap compilation failed: {0}")]
    Keymap(String),

    /// Malformed or unexpected event arguments
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// A request referenced an object the transport does not know about
    #[error("unknown {kind} object {id}")]
    UnknownObject { kind: &'static str, id: u32 },

    #[error("failed to connect to the display: {0}")]
    Connect(#[from] wayland_client::ConnectError),

    #[error("display transport error: {0}")]
    Transport(#[from] wayland_backend::client::WaylandError),

    #[error("event dispatch failed: {0}")]
    Dispatch(#[from] wayland_client::DispatchError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

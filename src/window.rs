//! Top-level windows backed by a shared-memory buffer
//!
//! A window carves exactly one buffer out of a freshly created pool and
//! destroys the pool straight away; the buffer stays valid on its own. Damage
//! accumulates until [`Window::commit`] presents it.

use crate::error::{Error, Result};
use crate::protocol::{BufferId, PixelFormat, Protocol, Rect, SurfaceId};
use crate::session::{Session, WindowEvent};
use log::{debug, info};
use memmap2::{MmapMut, MmapOptions};
use std::fs::File;
use std::io;
use std::os::fd::AsFd;

/// Create an anonymous, unlinked file of `size` bytes
pub fn anonymous_file(name: &str, size: u64) -> io::Result<File> {
    let file = create_anonymous(name)?;
    file.set_len(size)?;
    Ok(file)
}

#[cfg(target_os = "linux")]
fn create_anonymous(name: &str) -> io::Result<File> {
    use std::ffi::CString;
    use std::os::fd::FromRawFd;

    let name = CString::new(name).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let fd = unsafe { libc::memfd_create(name.as_ptr(), libc::MFD_CLOEXEC) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { File::from_raw_fd(fd) })
}

#[cfg(not(target_os = "linux"))]
fn create_anonymous(name: &str) -> io::Result<File> {
    use std::fs::OpenOptions;

    let dir = std::env::var_os("XDG_RUNTIME_DIR")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(std::env::temp_dir);
    let path = dir.join(format!("{}-{}", name, std::process::id()));
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .open(&path)?;
    std::fs::remove_file(&path)?;
    Ok(file)
}

/// A mapped shared-memory region and the file backing it
#[derive(Debug)]
pub struct ShmRegion {
    file: File,
    map: MmapMut,
}

impl ShmRegion {
    pub fn allocate(size: usize) -> Result<Self> {
        let alloc = |source| Error::ShmAllocation { size, source };
        let file = anonymous_file("wlsession-shm", size as u64).map_err(alloc)?;
        let map = unsafe { MmapOptions::new().len(size).map_mut(&file) }.map_err(alloc)?;
        Ok(Self { file, map })
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn file(&self) -> &File {
        &self.file
    }

    pub fn bytes(&self) -> &[u8] {
        &self.map
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.map
    }
}

#[derive(Debug)]
pub struct Window {
    surface: SurfaceId,
    width: u32,
    height: u32,
    format: PixelFormat,
    stride: u32,
    buffer: BufferId,
    region: ShmRegion,
    pending_damage: Option<Rect>,
}

impl Window {
    /// Create a top-level window, present its (blank) buffer once and
    /// register its surface with the session.
    pub fn new<P: Protocol>(
        session: &mut Session<P>,
        width: u32,
        height: u32,
        title: &str,
        app_id: &str,
    ) -> Result<Self> {
        let format = *session.pixel_formats().first().ok_or(Error::NoPixelFormats)?;
        let stride = format
            .stride_for_width(width)
            .ok_or(Error::InvalidGeometry { width, height })?;
        let size = stride as u64 * height as u64;
        if width == 0 || height == 0 || size > i32::MAX as u64 {
            return Err(Error::InvalidGeometry { width, height });
        }

        let surface = session.protocol_mut().create_surface()?;
        session.register_surface(surface);
        session
            .protocol_mut()
            .create_toplevel(surface, title, app_id)?;
        // The first configure must be acked before a buffer may be attached
        session.protocol_mut().commit(surface)?;
        session.roundtrip()?;

        let region = ShmRegion::allocate(size as usize)?;
        let protocol = session.protocol_mut();
        let pool = protocol.create_pool(region.file().as_fd(), size as i32)?;
        let buffer = protocol.create_buffer(
            pool,
            0,
            width as i32,
            height as i32,
            stride as i32,
            format,
        )?;
        protocol.destroy_pool(pool)?;

        protocol.attach(surface, Some(buffer), 0, 0)?;
        protocol.commit(surface)?;
        info!(
            "window {} {}x{} {:?} stride {} ({} bytes)",
            surface, width, height, format, stride, size
        );

        Ok(Self {
            surface,
            width,
            height,
            format,
            stride,
            buffer,
            region,
            pending_damage: None,
        })
    }

    pub fn surface(&self) -> SurfaceId {
        self.surface
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn stride(&self) -> u32 {
        self.stride
    }

    /// Size of the shared-memory buffer in bytes
    pub fn buffer_size(&self) -> usize {
        self.region.len()
    }

    pub fn pending_damage(&self) -> Option<Rect> {
        self.pending_damage
    }

    fn full(&self) -> Rect {
        Rect::new(0, 0, self.width as i32, self.height as i32)
    }

    /// Mark `rect` (the whole surface when `None`) as needing presentation
    pub fn add_damage<P: Protocol>(
        &mut self,
        session: &mut Session<P>,
        rect: Option<Rect>,
    ) -> Result<()> {
        let rect = rect.unwrap_or_else(|| self.full());
        session.protocol_mut().damage(self.surface, rect)?;
        self.pending_damage = Some(match self.pending_damage {
            Some(pending) => pending.union(&rect),
            None => rect,
        });
        Ok(())
    }

    /// Present the accumulated damage
    pub fn commit<P: Protocol>(&mut self, session: &mut Session<P>) -> Result<()> {
        debug!("commit {} damage {:?}", self.surface, self.pending_damage);
        session.protocol_mut().commit(self.surface)?;
        self.pending_damage = None;
        Ok(())
    }

    /// Damage everything, then commit
    pub fn redraw<P: Protocol>(&mut self, session: &mut Session<P>) -> Result<()> {
        self.add_damage(session, None)?;
        self.commit(session)
    }

    pub fn take_events<P: Protocol>(&self, session: &mut Session<P>) -> Vec<WindowEvent> {
        session.take_window_events(self.surface)
    }

    /// Raw pixel memory, `stride` bytes per row
    pub fn pixels_mut(&mut self) -> &mut [u8] {
        self.region.bytes_mut()
    }

    pub fn pixels(&self) -> &[u8] {
        self.region.bytes()
    }

    /// Copy a premultiplied RGBA pixmap into the buffer, converting to the
    /// window's pixel format. The pixmap must match the window's size.
    pub fn blit(&mut self, pixmap: &tiny_skia::Pixmap) -> Result<()> {
        if pixmap.width() != self.width || pixmap.height() != self.height {
            return Err(Error::InvalidGeometry {
                width: pixmap.width(),
                height: pixmap.height(),
            });
        }
        let format = self.format;
        let bpp = format.bytes_per_pixel() as usize;
        let stride = self.stride as usize;
        let row_len = self.width as usize * 4;
        let dst = self.region.bytes_mut();

        for (y, src_row) in pixmap.data().chunks_exact(row_len).enumerate() {
            let dst_row = &mut dst[y * stride..y * stride + self.width as usize * bpp];
            for (src, out) in src_row.chunks_exact(4).zip(dst_row.chunks_exact_mut(bpp)) {
                encode_pixel(format, [src[0], src[1], src[2], src[3]], out);
            }
        }
        Ok(())
    }

    /// Destroy the surface and buffer, drop the registration and unmap the
    /// shared memory
    pub fn close<P: Protocol>(self, session: &mut Session<P>) -> Result<()> {
        info!("closing window {}", self.surface);
        session.unregister_surface(self.surface);
        let protocol = session.protocol_mut();
        protocol.destroy_surface(self.surface)?;
        protocol.destroy_buffer(self.buffer)?;
        drop(self.region);
        Ok(())
    }
}

/// Write one premultiplied RGBA pixel in `format`'s little-endian layout
fn encode_pixel(format: PixelFormat, [r, g, b, a]: [u8; 4], out: &mut [u8]) {
    match format {
        PixelFormat::Argb8888 => out.copy_from_slice(&[b, g, r, a]),
        PixelFormat::Xrgb8888 => out.copy_from_slice(&[b, g, r, 0xff]),
        PixelFormat::Rgb565 => {
            let v = ((r as u16 >> 3) << 11) | ((g as u16 >> 2) << 5) | (b as u16 >> 3);
            out.copy_from_slice(&v.to_le_bytes());
        }
    }
}

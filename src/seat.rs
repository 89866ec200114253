//! Seats and their input devices
//!
//! A seat advertises a capability bitmask. Each newly asserted bit gets its
//! device created once; repeating a bit is a no-op, and clearing one leaves
//! the device alone. Devices are only released when the seat global itself
//! goes away.

use crate::error::{Error, Result};
use crate::keyboard::{KeyboardDecoder, LayoutCompiler, ModifierState};
use crate::protocol::{
    Capability, GlobalName, KeyboardEvent, PointerEvent, Protocol, SeatEvent, SurfaceId,
    KEYMAP_FORMAT_XKB_V1,
};
use crate::reactor::{ShutdownCode, EXIT_QUIT_KEY};
use crate::session::{SurfaceTable, WindowEvent};
use log::{debug, info, warn};
use memmap2::MmapOptions;
use std::fs::File;
use std::os::fd::OwnedFd;

/// Linux input code of the primary (left) pointer button
pub const BTN_LEFT: u32 = 0x110;

/// What a seat handler may touch while processing one event
pub struct SeatContext<'a> {
    pub protocol: &'a mut dyn Protocol,
    pub surfaces: &'a mut SurfaceTable,
    pub compiler: &'a dyn LayoutCompiler,
    pub shutdown: &'a ShutdownCode,
    pub quit_character: char,
}

#[derive(Debug, Default)]
pub struct Pointer {
    focus: Option<SurfaceId>,
    position: (f64, f64),
}

impl Pointer {
    /// Window under the pointer, if it is one of ours
    pub fn focus(&self) -> Option<SurfaceId> {
        self.focus
    }

    pub fn position(&self) -> (f64, f64) {
        self.position
    }
}

#[derive(Default)]
pub struct Keyboard {
    decoder: KeyboardDecoder,
    focus: Option<SurfaceId>,
    repeat: Option<(i32, i32)>,
}

impl Keyboard {
    pub fn decoder(&self) -> &KeyboardDecoder {
        &self.decoder
    }

    pub fn focus(&self) -> Option<SurfaceId> {
        self.focus
    }

    /// Repeat rate (keys/s) and delay (ms), once the compositor has sent them
    pub fn repeat_info(&self) -> Option<(i32, i32)> {
        self.repeat
    }
}

pub struct Seat {
    global: GlobalName,
    name: Option<String>,
    capabilities: Capability,
    pointer: Option<Pointer>,
    keyboard: Option<Keyboard>,
}

impl Seat {
    pub fn new(global: GlobalName) -> Self {
        Self {
            global,
            name: None,
            capabilities: Capability::empty(),
            pointer: None,
            keyboard: None,
        }
    }

    pub fn global(&self) -> GlobalName {
        self.global
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn capabilities(&self) -> Capability {
        self.capabilities
    }

    pub fn pointer(&self) -> Option<&Pointer> {
        self.pointer.as_ref()
    }

    pub fn keyboard(&self) -> Option<&Keyboard> {
        self.keyboard.as_ref()
    }

    fn label(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => format!("seat@{}", self.global),
        }
    }

    pub fn handle_event(&mut self, event: SeatEvent, protocol: &mut dyn Protocol) -> Result<()> {
        match event {
            SeatEvent::Name(name) => {
                info!("seat {} is named {:?}", self.global, name);
                self.name = Some(name);
                Ok(())
            }
            SeatEvent::Capabilities(caps) => self.set_capabilities(caps, protocol),
        }
    }

    fn set_capabilities(&mut self, caps: Capability, protocol: &mut dyn Protocol) -> Result<()> {
        info!("seat {} capabilities: {:?}", self.label(), caps);
        self.capabilities = caps;

        if caps.contains(Capability::POINTER) && self.pointer.is_none() {
            protocol.get_pointer(self.global)?;
            self.pointer = Some(Pointer::default());
            debug!("seat {} pointer created", self.label());
        }
        if caps.contains(Capability::KEYBOARD) && self.keyboard.is_none() {
            protocol.get_keyboard(self.global)?;
            self.keyboard = Some(Keyboard::default());
            debug!("seat {} keyboard created", self.label());
        }
        Ok(())
    }

    /// Release both devices, then the seat itself
    pub fn removed(&mut self, protocol: &mut dyn Protocol) -> Result<()> {
        info!("seat {} removed, releasing devices", self.label());
        if self.pointer.take().is_some() {
            protocol.release_pointer(self.global)?;
        }
        if self.keyboard.take().is_some() {
            protocol.release_keyboard(self.global)?;
        }
        protocol.release_seat(self.global)
    }

    pub fn handle_pointer(&mut self, event: PointerEvent, ctx: &mut SeatContext<'_>) -> Result<()> {
        let seat = self.global;
        let Some(pointer) = self.pointer.as_mut() else {
            debug!("pointer event for seat {} without a pointer: {:?}", seat, event);
            return Ok(());
        };

        match event {
            PointerEvent::Enter {
                serial,
                surface,
                x,
                y,
            } => {
                debug!("pointer enter {} at ({}, {})", surface, x, y);
                pointer.focus = ctx.surfaces.contains(surface).then_some(surface);
                pointer.position = (x, y);
                ctx.protocol.hide_cursor(seat, serial)?;
                if pointer.focus.is_some() {
                    ctx.surfaces
                        .push_event(surface, WindowEvent::PointerEnter { seat, x, y });
                }
            }
            PointerEvent::Leave { surface, .. } => {
                debug!("pointer leave {}", surface);
                if let Some(focused) = pointer.focus.take() {
                    ctx.surfaces
                        .push_event(focused, WindowEvent::PointerLeave { seat });
                }
            }
            PointerEvent::Motion { time, x, y } => {
                pointer.position = (x, y);
                if let Some(focused) = pointer.focus {
                    ctx.surfaces
                        .push_event(focused, WindowEvent::PointerMotion { seat, time, x, y });
                }
            }
            PointerEvent::Button {
                serial,
                time,
                button,
                pressed,
            } => {
                debug!("pointer button {} {} serial {}", button, pressed, serial);
                if let Some(focused) = pointer.focus {
                    ctx.surfaces.push_event(
                        focused,
                        WindowEvent::PointerButton {
                            seat,
                            time,
                            button,
                            pressed,
                        },
                    );
                    if pressed && button == BTN_LEFT {
                        info!("seat {} starting interactive move of {}", seat, focused);
                        ctx.protocol.move_toplevel(focused, seat, serial)?;
                    }
                }
            }
            PointerEvent::Axis { time, axis, value } => {
                debug!("pointer axis {} {}", axis, value);
                if let Some(focused) = pointer.focus {
                    ctx.surfaces.push_event(
                        focused,
                        WindowEvent::PointerAxis {
                            seat,
                            time,
                            axis,
                            value,
                        },
                    );
                }
            }
        }
        Ok(())
    }

    pub fn handle_keyboard(
        &mut self,
        event: KeyboardEvent,
        ctx: &mut SeatContext<'_>,
    ) -> Result<()> {
        let seat = self.global;
        let Some(keyboard) = self.keyboard.as_mut() else {
            debug!("keyboard event for seat {} without a keyboard", seat);
            return Ok(());
        };

        match event {
            KeyboardEvent::Keymap { format, fd, size } => {
                debug!("keymap format {} size {}", format, size);
                if format != KEYMAP_FORMAT_XKB_V1 {
                    warn!("ignoring keymap in unsupported format {}", format);
                    return Ok(());
                }
                install_keymap(&mut keyboard.decoder, ctx.compiler, fd, size)?;
            }
            KeyboardEvent::Enter {
                serial,
                surface,
                keys,
            } => {
                debug!("keyboard enter {} serial {} keys {:?}", surface, serial, keys);
                keyboard.focus = ctx.surfaces.contains(surface).then_some(surface);
                if keyboard.focus.is_some() {
                    ctx.surfaces.push_event(
                        surface,
                        WindowEvent::KeyboardFocus {
                            seat,
                            focused: true,
                        },
                    );
                }
            }
            KeyboardEvent::Leave { serial, surface } => {
                debug!("keyboard leave {} serial {}", surface, serial);
                if let Some(focused) = keyboard.focus.take() {
                    ctx.surfaces.push_event(
                        focused,
                        WindowEvent::KeyboardFocus {
                            seat,
                            focused: false,
                        },
                    );
                }
            }
            KeyboardEvent::Key {
                serial,
                time,
                key,
                pressed,
            } => {
                debug!("key {} pressed={} serial {} time {}", key, pressed, serial, time);
                if !pressed {
                    return Ok(());
                }
                let text = keyboard.decoder.decode(key);
                if text.is_empty() {
                    return Ok(());
                }
                debug!("key {} produced {:?}", key, text);
                if is_quit(&text, ctx.quit_character) {
                    ctx.shutdown.set(EXIT_QUIT_KEY);
                }
                if let Some(focused) = keyboard.focus {
                    ctx.surfaces
                        .push_event(focused, WindowEvent::Text { seat, text });
                }
            }
            KeyboardEvent::Modifiers {
                serial,
                depressed,
                latched,
                locked,
                group,
            } => {
                debug!(
                    "modifiers serial {} depressed {:#x} latched {:#x} locked {:#x} group {}",
                    serial, depressed, latched, locked, group
                );
                keyboard
                    .decoder
                    .update_modifiers(ModifierState::from_wire(depressed, latched, locked, group));
            }
            KeyboardEvent::RepeatInfo { rate, delay } => {
                keyboard.repeat = Some((rate, delay));
            }
        }
        Ok(())
    }
}

fn is_quit(text: &str, quit: char) -> bool {
    let mut chars = text.chars();
    chars.next() == Some(quit) && chars.next().is_none()
}

/// Map the keymap fd read-only, compile it, then drop the mapping and fd
fn install_keymap(
    decoder: &mut KeyboardDecoder,
    compiler: &dyn LayoutCompiler,
    fd: OwnedFd,
    size: u32,
) -> Result<()> {
    if size == 0 {
        return Err(Error::Protocol("empty keymap".into()));
    }
    let file = File::from(fd);
    let map = unsafe { MmapOptions::new().len(size as usize).map(&file)? };

    // Compositors send the text NUL-terminated
    let bytes = map.split(|b| *b == 0).next().unwrap_or_default();
    let text = std::str::from_utf8(bytes)
        .map_err(|e| Error::Protocol(format!("keymap is not UTF-8: {}", e)))?;
    decoder.replace_keymap(compiler, text)?;

    drop(map);
    drop(file);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeProtocol, Request, TableCompiler};

    struct Harness {
        protocol: FakeProtocol,
        surfaces: SurfaceTable,
        compiler: TableCompiler,
        shutdown: ShutdownCode,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                protocol: FakeProtocol::new(),
                surfaces: SurfaceTable::default(),
                compiler: TableCompiler,
                shutdown: ShutdownCode::new(),
            }
        }

        fn ctx(&mut self) -> SeatContext<'_> {
            SeatContext {
                protocol: &mut self.protocol,
                surfaces: &mut self.surfaces,
                compiler: &self.compiler,
                shutdown: &self.shutdown,
                quit_character: 'q',
            }
        }
    }

    fn keymap(text: &str) -> KeyboardEvent {
        let (fd, size) = crate::testing::keymap_fd(text).unwrap();
        KeyboardEvent::Keymap {
            format: KEYMAP_FORMAT_XKB_V1,
            fd,
            size,
        }
    }

    fn press(key: u32) -> KeyboardEvent {
        KeyboardEvent::Key {
            serial: 1,
            time: 0,
            key,
            pressed: true,
        }
    }

    #[test]
    fn test_capabilities_are_idempotent() {
        let mut h = Harness::new();
        let mut seat = Seat::new(7);
        let caps = SeatEvent::Capabilities(Capability::KEYBOARD);
        seat.handle_event(caps.clone(), &mut h.protocol).unwrap();
        seat.handle_event(caps, &mut h.protocol).unwrap();

        assert!(seat.keyboard().is_some());
        assert_eq!(h.protocol.count(|r| matches!(r, Request::GetKeyboard(7))), 1);
    }

    #[test]
    fn test_clearing_a_bit_keeps_the_device() {
        let mut h = Harness::new();
        let mut seat = Seat::new(1);
        seat.handle_event(SeatEvent::Capabilities(Capability::POINTER), &mut h.protocol)
            .unwrap();
        seat.handle_event(SeatEvent::Capabilities(Capability::empty()), &mut h.protocol)
            .unwrap();
        assert!(seat.pointer().is_some());
        assert_eq!(seat.capabilities(), Capability::empty());
    }

    #[test]
    fn test_name_may_arrive_after_capabilities() {
        let mut h = Harness::new();
        let mut seat = Seat::new(1);
        seat.handle_event(SeatEvent::Capabilities(Capability::POINTER), &mut h.protocol)
            .unwrap();
        seat.handle_event(SeatEvent::Name("seat0".into()), &mut h.protocol)
            .unwrap();
        assert_eq!(seat.name(), Some("seat0"));
        assert!(seat.pointer().is_some());
    }

    #[test]
    fn test_removed_releases_both_devices() {
        let mut h = Harness::new();
        let mut seat = Seat::new(3);
        seat.handle_event(
            SeatEvent::Capabilities(Capability::POINTER | Capability::KEYBOARD),
            &mut h.protocol,
        )
        .unwrap();
        seat.removed(&mut h.protocol).unwrap();

        assert!(seat.pointer().is_none());
        assert!(seat.keyboard().is_none());
        assert_eq!(h.protocol.count(|r| matches!(r, Request::ReleasePointer(3))), 1);
        assert_eq!(h.protocol.count(|r| matches!(r, Request::ReleaseKeyboard(3))), 1);
        assert_eq!(h.protocol.requests().last(), Some(&Request::ReleaseSeat(3)));
    }

    #[test]
    fn test_quit_key_sets_shutdown_once() {
        let mut h = Harness::new();
        let mut seat = Seat::new(1);
        seat.handle_event(SeatEvent::Capabilities(Capability::KEYBOARD), &mut h.protocol)
            .unwrap();
        // keycode 16 + 8 = 24 -> 'q'
        seat.handle_keyboard(keymap("24=q 38=a"), &mut h.ctx()).unwrap();

        seat.handle_keyboard(press(16), &mut h.ctx()).unwrap();
        assert_eq!(h.shutdown.get(), Some(EXIT_QUIT_KEY));

        h.shutdown.set(5);
        seat.handle_keyboard(press(16), &mut h.ctx()).unwrap();
        assert_eq!(h.shutdown.get(), Some(EXIT_QUIT_KEY));
    }

    #[test]
    fn test_key_without_text_is_not_an_error() {
        let mut h = Harness::new();
        let mut seat = Seat::new(1);
        seat.handle_event(SeatEvent::Capabilities(Capability::KEYBOARD), &mut h.protocol)
            .unwrap();
        seat.handle_keyboard(keymap("38=a"), &mut h.ctx()).unwrap();

        seat.handle_keyboard(press(42), &mut h.ctx()).unwrap();
        assert!(!h.shutdown.is_set());
    }

    #[test]
    fn test_key_release_is_not_decoded() {
        let mut h = Harness::new();
        let mut seat = Seat::new(1);
        seat.handle_event(SeatEvent::Capabilities(Capability::KEYBOARD), &mut h.protocol)
            .unwrap();
        seat.handle_keyboard(keymap("24=q"), &mut h.ctx()).unwrap();
        seat.handle_keyboard(
            KeyboardEvent::Key {
                serial: 2,
                time: 0,
                key: 16,
                pressed: false,
            },
            &mut h.ctx(),
        )
        .unwrap();
        assert!(!h.shutdown.is_set());
    }

    #[test]
    fn test_unsupported_keymap_format_is_ignored() {
        let mut h = Harness::new();
        let mut seat = Seat::new(1);
        seat.handle_event(SeatEvent::Capabilities(Capability::KEYBOARD), &mut h.protocol)
            .unwrap();
        let (fd, size) = crate::testing::keymap_fd("24=q").unwrap();
        seat.handle_keyboard(KeyboardEvent::Keymap { format: 0, fd, size }, &mut h.ctx())
            .unwrap();
        assert!(!seat.keyboard().unwrap().decoder().has_keymap());
    }

    #[test]
    fn test_enter_on_foreign_surface_leaves_no_focus() {
        let mut h = Harness::new();
        let mut seat = Seat::new(1);
        seat.handle_event(SeatEvent::Capabilities(Capability::POINTER), &mut h.protocol)
            .unwrap();
        seat.handle_pointer(
            PointerEvent::Enter {
                serial: 9,
                surface: SurfaceId(99),
                x: 1.0,
                y: 2.0,
            },
            &mut h.ctx(),
        )
        .unwrap();
        assert_eq!(seat.pointer().unwrap().focus(), None);
        assert_eq!(h.protocol.count(|r| matches!(r, Request::HideCursor(1, 9))), 1);
    }

    #[test]
    fn test_primary_press_starts_move() {
        let mut h = Harness::new();
        let surface = h.protocol.create_surface().unwrap();
        h.surfaces.insert(surface);
        let mut seat = Seat::new(1);
        seat.handle_event(SeatEvent::Capabilities(Capability::POINTER), &mut h.protocol)
            .unwrap();
        seat.handle_pointer(
            PointerEvent::Enter {
                serial: 1,
                surface,
                x: 0.0,
                y: 0.0,
            },
            &mut h.ctx(),
        )
        .unwrap();
        seat.handle_pointer(
            PointerEvent::Button {
                serial: 42,
                time: 0,
                button: BTN_LEFT,
                pressed: true,
            },
            &mut h.ctx(),
        )
        .unwrap();

        assert_eq!(
            h.protocol
                .count(|r| matches!(r, Request::Move(s, 1, 42) if *s == surface)),
            1
        );
    }

    #[test]
    fn test_button_without_focus_does_nothing() {
        let mut h = Harness::new();
        let mut seat = Seat::new(1);
        seat.handle_event(SeatEvent::Capabilities(Capability::POINTER), &mut h.protocol)
            .unwrap();
        seat.handle_pointer(
            PointerEvent::Button {
                serial: 42,
                time: 0,
                button: BTN_LEFT,
                pressed: true,
            },
            &mut h.ctx(),
        )
        .unwrap();
        assert_eq!(h.protocol.count(|r| matches!(r, Request::Move(..))), 0);
    }

    #[test]
    fn test_motion_routes_to_focused_window() {
        let mut h = Harness::new();
        let surface = SurfaceId(5);
        h.surfaces.insert(surface);
        let mut seat = Seat::new(1);
        seat.handle_event(SeatEvent::Capabilities(Capability::POINTER), &mut h.protocol)
            .unwrap();
        for event in [
            PointerEvent::Enter {
                serial: 1,
                surface,
                x: 0.0,
                y: 0.0,
            },
            PointerEvent::Motion {
                time: 5,
                x: 3.0,
                y: 4.0,
            },
        ] {
            seat.handle_pointer(event, &mut h.ctx()).unwrap();
        }

        let events = h.surfaces.take_events(surface);
        assert!(events.contains(&WindowEvent::PointerMotion {
            seat: 1,
            time: 5,
            x: 3.0,
            y: 4.0
        }));
        assert_eq!(seat.pointer().unwrap().position(), (3.0, 4.0));
    }

    #[test]
    fn test_is_quit_needs_single_character() {
        assert!(is_quit("q", 'q'));
        assert!(!is_quit("qq", 'q'));
        assert!(!is_quit("Q", 'q'));
        assert!(!is_quit("", 'q'));
    }
}

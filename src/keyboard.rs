//! Key code to text decoding
//!
//! A [`KeyboardDecoder`] owns a compiled keymap and the input state derived
//! from it. Layout compilation sits behind [`LayoutCompiler`]; the real
//! implementation is [`XkbCompiler`] on top of libxkbcommon.

use crate::error::{Error, Result};
use log::{debug, warn};
use xkbcommon::xkb;

/// Offset between evdev scancodes on the wire and xkb keycodes
pub const EVDEV_OFFSET: u32 = 8;

/// The three modifier tiers plus the layout index triplet.
///
/// Updates always replace the whole value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ModifierState {
    pub depressed: u32,
    pub latched: u32,
    pub locked: u32,
    pub depressed_layout: u32,
    pub latched_layout: u32,
    pub locked_layout: u32,
}

impl ModifierState {
    /// Modifier state as sent by `wl_keyboard.modifiers`, where the group
    /// is the effective layout.
    ///
    /// The group goes into the locked-layout slot, not the depressed one.
    /// xkb resolves the same effective layout from either.
    pub fn from_wire(depressed: u32, latched: u32, locked: u32, group: u32) -> Self {
        Self {
            depressed,
            latched,
            locked,
            depressed_layout: 0,
            latched_layout: 0,
            locked_layout: group,
        }
    }
}

/// Turns keymap text into a compiled keymap
#[cfg_attr(test, mockall::automock)]
pub trait LayoutCompiler {
    fn compile(&self, keymap: &str) -> Result<Box<dyn CompiledKeymap>>;
}

pub trait CompiledKeymap {
    /// A fresh input state with no modifiers applied
    fn new_state(&self) -> Box<dyn KeyState>;
}

pub trait KeyState {
    fn update_mask(&mut self, mods: &ModifierState);
    /// UTF-8 text produced by `keycode` (an xkb keycode); empty when the key
    /// produces none
    fn key_utf8(&self, keycode: u32) -> String;
}

/// Compiled keymap plus live modifier state for one keyboard
pub struct KeyboardDecoder {
    keymap: Option<Box<dyn CompiledKeymap>>,
    state: Option<Box<dyn KeyState>>,
    modifiers: ModifierState,
    generation: u32,
}

impl Default for KeyboardDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyboardDecoder {
    pub fn new() -> Self {
        Self {
            keymap: None,
            state: None,
            modifiers: ModifierState::default(),
            generation: 0,
        }
    }

    /// Compile `text` and replace the current keymap and state wholesale.
    ///
    /// The previous keymap and its state are dropped here. Modifier tiers
    /// reset to empty, matching the fresh state.
    pub fn replace_keymap(&mut self, compiler: &dyn LayoutCompiler, text: &str) -> Result<()> {
        let keymap = compiler.compile(text)?;
        let state = keymap.new_state();

        // State before the keymap it was derived from
        self.state = None;
        self.keymap = None;

        self.keymap = Some(keymap);
        self.state = Some(state);
        self.modifiers = ModifierState::default();
        self.generation += 1;
        debug!("keymap #{} installed", self.generation);
        Ok(())
    }

    pub fn has_keymap(&self) -> bool {
        self.keymap.is_some()
    }

    /// Number of keymaps installed so far
    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn modifiers(&self) -> ModifierState {
        self.modifiers
    }

    pub fn update_modifiers(&mut self, mods: ModifierState) {
        self.modifiers = mods;
        match self.state.as_mut() {
            Some(state) => state.update_mask(&mods),
            None => debug!("modifiers before keymap, recorded only"),
        }
    }

    /// Resolve a wire keycode to text. Empty text is a normal outcome.
    pub fn decode(&self, wire_keycode: u32) -> String {
        match self.state.as_ref() {
            Some(state) => match wire_keycode.checked_add(EVDEV_OFFSET) {
                Some(keycode) => state.key_utf8(keycode),
                None => {
                    warn!("key {} has no xkb keycode, ignored", wire_keycode);
                    String::new()
                }
            },
            None => {
                warn!("key {} before any keymap, ignored", wire_keycode);
                String::new()
            }
        }
    }
}

/// libxkbcommon-backed layout compiler
pub struct XkbCompiler {
    context: xkb::Context,
}

impl Default for XkbCompiler {
    fn default() -> Self {
        Self::new()
    }
}

impl XkbCompiler {
    pub fn new() -> Self {
        Self {
            context: xkb::Context::new(xkb::CONTEXT_NO_FLAGS),
        }
    }
}

impl LayoutCompiler for XkbCompiler {
    fn compile(&self, keymap: &str) -> Result<Box<dyn CompiledKeymap>> {
        let keymap = xkb::Keymap::new_from_string(
            &self.context,
            keymap.to_string(),
            xkb::KEYMAP_FORMAT_TEXT_V1,
            xkb::KEYMAP_COMPILE_NO_FLAGS,
        )
        .ok_or_else(|| Error::Keymap("xkbcommon rejected the keymap text".into()))?;
        Ok(Box::new(XkbKeymap(keymap)))
    }
}

struct XkbKeymap(xkb::Keymap);

impl CompiledKeymap for XkbKeymap {
    fn new_state(&self) -> Box<dyn KeyState> {
        Box::new(XkbState(xkb::State::new(&self.0)))
    }
}

struct XkbState(xkb::State);

impl KeyState for XkbState {
    fn update_mask(&mut self, mods: &ModifierState) {
        self.0.update_mask(
            mods.depressed,
            mods.latched,
            mods.locked,
            mods.depressed_layout,
            mods.latched_layout,
            mods.locked_layout,
        );
    }

    fn key_utf8(&self, keycode: u32) -> String {
        self.0.key_get_utf8(keycode.into())
    }
}

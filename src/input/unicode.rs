//! Unicode Keyboard Translation
//!
//! Unicode keyboard events carry UTF-16 code units; they translate to
//! keysyms independently of the scancode path and keep their own
//! pressed set so a Synchronize event can release everything.

use std::collections::HashSet;

use crate::host::KeyState;
use crate::input::keyboard::KeyboardAction;

/// Offset of the direct Unicode keysym range.
const UNICODE_KEYSYM_OFFSET: u32 = 0x0100_0000;

/// Map a Unicode code point to a keysym: Latin-1 maps directly, a few
/// control characters have legacy keysyms, everything else uses the
/// Unicode keysym range.
pub fn utf32_to_keysym(code_point: u32) -> Option<u32> {
    match code_point {
        0x08 => Some(0xFF08), // BackSpace
        0x09 => Some(0xFF09), // Tab
        0x0D => Some(0xFF0D), // Return
        0x1B => Some(0xFF1B), // Escape
        0x7F => Some(0xFFFF), // Delete
        0x20..=0x7E | 0xA0..=0xFF => Some(code_point),
        cp if cp >= 0x100 => Some(cp + UNICODE_KEYSYM_OFFSET),
        _ => None,
    }
}

/// Unicode-side keyboard state.
#[derive(Default)]
pub struct UnicodeTranslator {
    pressed_keysyms: HashSet<u32>,
}

impl UnicodeTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Translate one Unicode key event. Lone surrogates and unmappable
    /// code points are dropped.
    pub fn handle_code_unit(&mut self, code_unit: u16, pressed: bool) -> Option<KeyboardAction> {
        // A single code unit that is a surrogate half cannot form a
        // code point.
        let code_point = char::decode_utf16([code_unit]).next()?.ok()? as u32;
        let keysym = utf32_to_keysym(code_point)?;

        if pressed {
            if !self.pressed_keysyms.insert(keysym) {
                return None;
            }
        } else if !self.pressed_keysyms.remove(&keysym) {
            return None;
        }

        Some(KeyboardAction::Keysym {
            keysym,
            state: if pressed {
                KeyState::Pressed
            } else {
                KeyState::Released
            },
        })
    }

    /// Release every pressed keysym (Synchronize event).
    pub fn release_all(&mut self) -> Vec<KeyboardAction> {
        self.pressed_keysyms
            .drain()
            .map(|keysym| KeyboardAction::Keysym {
                keysym,
                state: KeyState::Released,
            })
            .collect()
    }

    /// Number of keysyms currently held.
    pub fn pressed_count(&self) -> usize {
        self.pressed_keysyms.len()
    }
}

//! Keyboard Translation
//!
//! Scancode events map through the translation table into platform
//! keycodes; the pressed set makes release events idempotent and lets a
//! Synchronize event release everything. The four-event Pause sequence
//! (Ctrl-down ext1, NumLock-down, Ctrl-up ext1, NumLock-up) collapses
//! into a single synthetic Pause keysym press/release with no keycode
//! events for the constituents.

use std::collections::HashSet;

use tracing::{debug, warn};

use crate::host::KeyState;
use crate::input::keymap::{keycodes, scancode_to_keycode};

/// Pause keysym emitted by the sequence synthesis.
pub const KEYSYM_PAUSE: u32 = 0xFF13;

/// One translated keyboard action for the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyboardAction {
    Keycode { keycode: u32, state: KeyState },
    Keysym { keysym: u32, state: KeyState },
}

/// Pause-key sequence automaton ([MS-RDPBCGR] Pause handling).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum PauseKeyState {
    #[default]
    None,
    CtrlDown,
    NumLockDown,
    CtrlUp,
}

/// Scancode-side keyboard state.
#[derive(Default)]
pub struct KeyboardTranslator {
    pressed_keys: HashSet<u32>,
    pause_key_state: PauseKeyState,
}

impl KeyboardTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Translate one scancode event. Usually emits zero or one action;
    /// completing the Pause sequence emits the synthetic press/release
    /// pair.
    pub fn handle_scancode(
        &mut self,
        code: u16,
        pressed: bool,
        extended: bool,
        extended1: bool,
    ) -> Vec<KeyboardAction> {
        let Some(keycode) = scancode_to_keycode(code, extended) else {
            warn!("dropping unmapped scancode 0x{code:02X} (extended: {extended})");
            return Vec::new();
        };

        if let Some(actions) = self.advance_pause_sequence(keycode, pressed, extended1) {
            return actions;
        }

        if pressed {
            if !self.pressed_keys.insert(keycode) {
                return Vec::new();
            }
        } else if !self.pressed_keys.remove(&keycode) {
            return Vec::new();
        }

        let state = if pressed {
            KeyState::Pressed
        } else {
            KeyState::Released
        };
        vec![KeyboardAction::Keycode { keycode, state }]
    }

    /// Release every pressed key (Synchronize event).
    pub fn release_all(&mut self) -> Vec<KeyboardAction> {
        let actions = self
            .pressed_keys
            .drain()
            .map(|keycode| KeyboardAction::Keycode {
                keycode,
                state: KeyState::Released,
            })
            .collect();
        actions
    }

    /// Number of keys currently held.
    pub fn pressed_count(&self) -> usize {
        self.pressed_keys.len()
    }

    /// Drive the Pause automaton. `Some` means the event belongs to the
    /// sequence and was consumed (with the synthesized pair on
    /// completion); `None` means normal processing continues.
    fn advance_pause_sequence(
        &mut self,
        keycode: u32,
        pressed: bool,
        extended1: bool,
    ) -> Option<Vec<KeyboardAction>> {
        let is_e1_ctrl = keycode == keycodes::KEY_LEFTCTRL && extended1;
        let is_numlock = keycode == keycodes::KEY_NUMLOCK;

        match self.pause_key_state {
            PauseKeyState::None => {
                if is_e1_ctrl && pressed {
                    self.pause_key_state = PauseKeyState::CtrlDown;
                    return Some(Vec::new());
                }
                return None;
            }
            PauseKeyState::CtrlDown => {
                if is_numlock && pressed {
                    self.pause_key_state = PauseKeyState::NumLockDown;
                    return Some(Vec::new());
                }
            }
            PauseKeyState::NumLockDown => {
                if is_e1_ctrl && !pressed {
                    self.pause_key_state = PauseKeyState::CtrlUp;
                    return Some(Vec::new());
                }
            }
            PauseKeyState::CtrlUp => {
                if is_numlock && !pressed {
                    self.pause_key_state = PauseKeyState::None;
                    debug!("pause key sequence completed");
                    return Some(vec![
                        KeyboardAction::Keysym {
                            keysym: KEYSYM_PAUSE,
                            state: KeyState::Pressed,
                        },
                        KeyboardAction::Keysym {
                            keysym: KEYSYM_PAUSE,
                            state: KeyState::Released,
                        },
                    ]);
                }
            }
        }

        warn!("received invalid pause key sequence");
        self.pause_key_state = PauseKeyState::None;
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_press_release_round_trip() {
        let mut translator = KeyboardTranslator::new();

        let actions = translator.handle_scancode(0x1E, true, false, false);
        assert_eq!(
            actions,
            vec![KeyboardAction::Keycode {
                keycode: 30,
                state: KeyState::Pressed
            }]
        );
        assert_eq!(translator.pressed_count(), 1);

        let actions = translator.handle_scancode(0x1E, false, false, false);
        assert_eq!(
            actions,
            vec![KeyboardAction::Keycode {
                keycode: 30,
                state: KeyState::Released
            }]
        );
        assert_eq!(translator.pressed_count(), 0);
    }

    #[test]
    fn test_duplicate_press_suppressed() {
        let mut translator = KeyboardTranslator::new();
        assert_eq!(translator.handle_scancode(0x1E, true, false, false).len(), 1);
        assert!(translator.handle_scancode(0x1E, true, false, false).is_empty());
    }

    #[test]
    fn test_release_without_press_suppressed() {
        let mut translator = KeyboardTranslator::new();
        assert!(translator.handle_scancode(0x1E, false, false, false).is_empty());
    }

    #[test]
    fn test_release_all() {
        let mut translator = KeyboardTranslator::new();
        translator.handle_scancode(0x1E, true, false, false);
        translator.handle_scancode(0x1F, true, false, false);

        let released = translator.release_all();
        assert_eq!(released.len(), 2);
        assert!(released
            .iter()
            .all(|a| matches!(a, KeyboardAction::Keycode { state: KeyState::Released, .. })));
        assert_eq!(translator.pressed_count(), 0);
    }

    #[test]
    fn test_pause_sequence_synthesis() {
        let mut translator = KeyboardTranslator::new();

        // Ctrl-down E1, NumLock-down, Ctrl-up E1, NumLock-up.
        assert!(translator.handle_scancode(0x1D, true, false, true).is_empty());
        assert!(translator.handle_scancode(0x45, true, false, false).is_empty());
        assert!(translator.handle_scancode(0x1D, false, false, true).is_empty());
        let actions = translator.handle_scancode(0x45, false, false, false);

        assert_eq!(
            actions,
            vec![
                KeyboardAction::Keysym {
                    keysym: KEYSYM_PAUSE,
                    state: KeyState::Pressed
                },
                KeyboardAction::Keysym {
                    keysym: KEYSYM_PAUSE,
                    state: KeyState::Released
                },
            ]
        );
        // No keycode ever reached the pressed set.
        assert_eq!(translator.pressed_count(), 0);
    }

    #[test]
    fn test_broken_pause_sequence_resets() {
        let mut translator = KeyboardTranslator::new();

        assert!(translator.handle_scancode(0x1D, true, false, true).is_empty());
        // 'A' instead of NumLock breaks the sequence and is processed
        // as a normal key event.
        let actions = translator.handle_scancode(0x1E, true, false, false);
        assert_eq!(actions.len(), 1);

        // The automaton restarted: a full sequence still works.
        translator.handle_scancode(0x1D, true, false, true);
        translator.handle_scancode(0x45, true, false, false);
        translator.handle_scancode(0x1D, false, false, true);
        let actions = translator.handle_scancode(0x45, false, false, false);
        assert_eq!(actions.len(), 2);
    }

    #[test]
    fn test_plain_ctrl_not_consumed() {
        let mut translator = KeyboardTranslator::new();
        // Left Ctrl without the E1 prefix is a normal key.
        let actions = translator.handle_scancode(0x1D, true, false, false);
        assert_eq!(actions.len(), 1);
    }

    #[test]
    fn test_plain_numlock_passes_through() {
        let mut translator = KeyboardTranslator::new();
        let actions = translator.handle_scancode(0x45, true, false, false);
        assert_eq!(
            actions,
            vec![KeyboardAction::Keycode {
                keycode: keycodes::KEY_NUMLOCK,
                state: KeyState::Pressed
            }]
        );
    }
}

//! Input Translation
//!
//! Translates client input PDUs into host injection calls: scancode and
//! Unicode keyboards with pressed-set tracking and Pause synthesis,
//! pointer events with wheel scaling, and the multi-contact touch
//! automaton. The session resolves absolute positions through the
//! layout manager before anything reaches the host.

pub mod dvc;
pub mod keyboard;
pub mod keymap;
pub mod pointer;
pub mod touch;
pub mod unicode;

pub use dvc::InputDvc;
pub use keyboard::{KeyboardAction, KeyboardTranslator, KEYSYM_PAUSE};
pub use pointer::{translate_extended_mouse_event, translate_mouse_event, PointerAction};
pub use touch::{ContactState, TouchAction, TouchTranslator};
pub use unicode::UnicodeTranslator;

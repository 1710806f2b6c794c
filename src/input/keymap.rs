//! Scancode Translation Table
//!
//! Maps RDP keyboard scancodes (AT set 1, with the extended flag) to
//! platform keycodes. The base block is identity-mapped; extended
//! scancodes go through an explicit table.

/// Platform keycodes referenced by the translation logic.
pub mod keycodes {
    pub const KEY_LEFTCTRL: u32 = 29;
    pub const KEY_LEFTSHIFT: u32 = 42;
    pub const KEY_RIGHTSHIFT: u32 = 54;
    pub const KEY_LEFTALT: u32 = 56;
    pub const KEY_CAPSLOCK: u32 = 58;
    pub const KEY_NUMLOCK: u32 = 69;
    pub const KEY_SCROLLLOCK: u32 = 70;
    pub const KEY_KPENTER: u32 = 96;
    pub const KEY_RIGHTCTRL: u32 = 97;
    pub const KEY_KPSLASH: u32 = 98;
    pub const KEY_SYSRQ: u32 = 99;
    pub const KEY_RIGHTALT: u32 = 100;
    pub const KEY_HOME: u32 = 102;
    pub const KEY_UP: u32 = 103;
    pub const KEY_PAGEUP: u32 = 104;
    pub const KEY_LEFT: u32 = 105;
    pub const KEY_RIGHT: u32 = 106;
    pub const KEY_END: u32 = 107;
    pub const KEY_DOWN: u32 = 108;
    pub const KEY_PAGEDOWN: u32 = 109;
    pub const KEY_INSERT: u32 = 110;
    pub const KEY_DELETE: u32 = 111;
    pub const KEY_MUTE: u32 = 113;
    pub const KEY_VOLUMEDOWN: u32 = 114;
    pub const KEY_VOLUMEUP: u32 = 115;
    pub const KEY_POWER: u32 = 116;
    pub const KEY_PAUSE: u32 = 119;
    pub const KEY_LEFTMETA: u32 = 125;
    pub const KEY_RIGHTMETA: u32 = 126;
    pub const KEY_COMPOSE: u32 = 127;
    pub const KEY_SLEEP: u32 = 142;
    pub const KEY_WAKEUP: u32 = 143;
    pub const KEY_MAIL: u32 = 155;
    pub const KEY_BACK: u32 = 158;
    pub const KEY_FORWARD: u32 = 159;
    pub const KEY_NEXTSONG: u32 = 163;
    pub const KEY_PLAYPAUSE: u32 = 164;
    pub const KEY_PREVIOUSSONG: u32 = 165;
    pub const KEY_STOPCD: u32 = 166;
    pub const KEY_HOMEPAGE: u32 = 172;
}

use keycodes::{
    KEY_BACK, KEY_COMPOSE, KEY_DELETE, KEY_DOWN, KEY_END, KEY_FORWARD, KEY_HOME, KEY_HOMEPAGE,
    KEY_INSERT, KEY_KPENTER, KEY_KPSLASH, KEY_LEFT, KEY_LEFTMETA, KEY_MAIL, KEY_MUTE,
    KEY_NEXTSONG, KEY_PAGEDOWN, KEY_PAGEUP, KEY_PLAYPAUSE, KEY_POWER, KEY_PREVIOUSSONG,
    KEY_RIGHT, KEY_RIGHTALT, KEY_RIGHTCTRL, KEY_RIGHTMETA, KEY_SLEEP, KEY_STOPCD, KEY_SYSRQ,
    KEY_UP, KEY_VOLUMEDOWN, KEY_VOLUMEUP, KEY_WAKEUP,
};

/// Highest scancode of the identity-mapped base block.
const BASE_BLOCK_END: u16 = 0x58;

/// Translate an RDP scancode to a platform keycode. Returns `None` for
/// scancodes with no mapping; callers drop those events.
pub fn scancode_to_keycode(code: u16, extended: bool) -> Option<u32> {
    if !extended {
        return match code {
            0x01..=BASE_BLOCK_END => Some(code as u32),
            _ => None,
        };
    }

    let keycode = match code {
        0x1C => KEY_KPENTER,
        0x1D => KEY_RIGHTCTRL,
        0x35 => KEY_KPSLASH,
        0x37 => KEY_SYSRQ,
        0x38 => KEY_RIGHTALT,
        0x47 => KEY_HOME,
        0x48 => KEY_UP,
        0x49 => KEY_PAGEUP,
        0x4B => KEY_LEFT,
        0x4D => KEY_RIGHT,
        0x4F => KEY_END,
        0x50 => KEY_DOWN,
        0x51 => KEY_PAGEDOWN,
        0x52 => KEY_INSERT,
        0x53 => KEY_DELETE,
        0x5B => KEY_LEFTMETA,
        0x5C => KEY_RIGHTMETA,
        0x5D => KEY_COMPOSE,
        0x5E => KEY_POWER,
        0x5F => KEY_SLEEP,
        0x63 => KEY_WAKEUP,
        0x20 => KEY_MUTE,
        0x2E => KEY_VOLUMEDOWN,
        0x30 => KEY_VOLUMEUP,
        0x22 => KEY_PLAYPAUSE,
        0x24 => KEY_STOPCD,
        0x19 => KEY_NEXTSONG,
        0x10 => KEY_PREVIOUSSONG,
        0x69 => KEY_FORWARD,
        0x6A => KEY_BACK,
        0x6C => KEY_MAIL,
        0x32 => KEY_HOMEPAGE,
        _ => return None,
    };
    Some(keycode)
}

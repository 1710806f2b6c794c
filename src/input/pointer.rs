//! Pointer Translation
//!
//! Maps RDP mouse and extended-mouse events into host pointer actions.
//! Absolute positions are resolved through the layout transform by the
//! caller; wheel rotation scales into discrete scroll steps.

use crate::host::{axis_flags, ButtonState};
use crate::peer::pdu::pointer_flags::{
    PTR_FLAGS_BUTTON1, PTR_FLAGS_BUTTON2, PTR_FLAGS_BUTTON3, PTR_FLAGS_DOWN, PTR_FLAGS_HWHEEL,
    PTR_FLAGS_WHEEL, PTR_FLAGS_WHEEL_NEGATIVE, PTR_XFLAGS_BUTTON1, PTR_XFLAGS_BUTTON2,
    WHEEL_ROTATION_MASK,
};

/// Linux button codes for the host injector.
pub const BTN_LEFT: i32 = 0x110;
pub const BTN_RIGHT: i32 = 0x111;
pub const BTN_MIDDLE: i32 = 0x112;
pub const BTN_SIDE: i32 = 0x113;
pub const BTN_EXTRA: i32 = 0x114;

/// One wheel detent maps to this many scroll units.
pub const DISCRETE_SCROLL_STEP: f64 = 10.0;

/// Translated pointer action; `Motion` carries the untransformed client
/// desktop position.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PointerAction {
    Motion { x: i32, y: i32 },
    Button { button: i32, state: ButtonState },
    Axis { dx: f64, dy: f64, flags: u32 },
}

/// Translate a mouse event ([MS-RDPBCGR] 2.2.8.1.1.3.1.1.3).
pub fn translate_mouse_event(flags: u16, x: u16, y: u16) -> Vec<PointerAction> {
    let mut actions = Vec::with_capacity(2);
    let is_wheel = flags & (PTR_FLAGS_WHEEL | PTR_FLAGS_HWHEEL) != 0;

    if !is_wheel {
        actions.push(PointerAction::Motion {
            x: x as i32,
            y: y as i32,
        });
    }

    let state = if flags & PTR_FLAGS_DOWN != 0 {
        ButtonState::Pressed
    } else {
        ButtonState::Released
    };
    let button = if flags & PTR_FLAGS_BUTTON1 != 0 {
        Some(BTN_LEFT)
    } else if flags & PTR_FLAGS_BUTTON2 != 0 {
        Some(BTN_RIGHT)
    } else if flags & PTR_FLAGS_BUTTON3 != 0 {
        Some(BTN_MIDDLE)
    } else {
        None
    };
    if let Some(button) = button {
        actions.push(PointerAction::Button { button, state });
    }

    if !is_wheel {
        return actions;
    }

    // Rotation is a 9-bit two's-complement value inside the flags.
    let mut axis_value = flags & WHEEL_ROTATION_MASK;
    if axis_value & PTR_FLAGS_WHEEL_NEGATIVE != 0 {
        axis_value = (!axis_value & WHEEL_ROTATION_MASK) + 1;
    }

    let mut axis_step = -(axis_value as f64) / 120.0;
    if flags & PTR_FLAGS_WHEEL_NEGATIVE != 0 {
        axis_step = -axis_step;
    }

    if flags & PTR_FLAGS_WHEEL != 0 {
        actions.push(PointerAction::Axis {
            dx: 0.0,
            dy: axis_step * DISCRETE_SCROLL_STEP,
            flags: axis_flags::SOURCE_WHEEL,
        });
    }
    if flags & PTR_FLAGS_HWHEEL != 0 {
        actions.push(PointerAction::Axis {
            dx: -axis_step * DISCRETE_SCROLL_STEP,
            dy: 0.0,
            flags: axis_flags::SOURCE_WHEEL,
        });
    }

    actions
}

/// Translate an extended mouse event (side/extra buttons).
pub fn translate_extended_mouse_event(flags: u16, x: u16, y: u16) -> Vec<PointerAction> {
    let mut actions = Vec::with_capacity(2);
    actions.push(PointerAction::Motion {
        x: x as i32,
        y: y as i32,
    });

    let state = if flags & PTR_FLAGS_DOWN != 0 {
        ButtonState::Pressed
    } else {
        ButtonState::Released
    };
    let button = if flags & PTR_XFLAGS_BUTTON1 != 0 {
        Some(BTN_SIDE)
    } else if flags & PTR_XFLAGS_BUTTON2 != 0 {
        Some(BTN_EXTRA)
    } else {
        None
    };
    if let Some(button) = button {
        actions.push(PointerAction::Button { button, state });
    }

    actions
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_motion_only() {
        let actions = translate_mouse_event(0x0800, 100, 200);
        assert_eq!(actions, vec![PointerAction::Motion { x: 100, y: 200 }]);
    }

    #[test]
    fn test_left_button_press() {
        let actions = translate_mouse_event(PTR_FLAGS_DOWN | PTR_FLAGS_BUTTON1, 10, 20);
        assert_eq!(
            actions,
            vec![
                PointerAction::Motion { x: 10, y: 20 },
                PointerAction::Button {
                    button: BTN_LEFT,
                    state: ButtonState::Pressed
                },
            ]
        );
    }

    #[test]
    fn test_middle_button_release() {
        let actions = translate_mouse_event(PTR_FLAGS_BUTTON3, 10, 20);
        assert_eq!(
            actions[1],
            PointerAction::Button {
                button: BTN_MIDDLE,
                state: ButtonState::Released
            }
        );
    }

    #[test]
    fn test_wheel_forward() {
        // One detent forward: rotation +120.
        let actions = translate_mouse_event(PTR_FLAGS_WHEEL | 120, 0, 0);
        assert_eq!(
            actions,
            vec![PointerAction::Axis {
                dx: 0.0,
                dy: -DISCRETE_SCROLL_STEP,
                flags: axis_flags::SOURCE_WHEEL,
            }]
        );
    }

    #[test]
    fn test_wheel_backward() {
        // One detent backward: rotation −120 in 9-bit two's complement.
        let rotation = (!120u16 & WHEEL_ROTATION_MASK) + 1;
        let actions =
            translate_mouse_event(PTR_FLAGS_WHEEL | PTR_FLAGS_WHEEL_NEGATIVE | rotation, 0, 0);
        assert_eq!(
            actions,
            vec![PointerAction::Axis {
                dx: 0.0,
                dy: DISCRETE_SCROLL_STEP,
                flags: axis_flags::SOURCE_WHEEL,
            }]
        );
    }

    #[test]
    fn test_hwheel_inverts_sign() {
        let actions = translate_mouse_event(PTR_FLAGS_HWHEEL | 120, 0, 0);
        assert_eq!(
            actions,
            vec![PointerAction::Axis {
                dx: DISCRETE_SCROLL_STEP,
                dy: 0.0,
                flags: axis_flags::SOURCE_WHEEL,
            }]
        );
    }

    #[test]
    fn test_wheel_has_no_motion() {
        let actions = translate_mouse_event(PTR_FLAGS_WHEEL | 120, 55, 66);
        assert!(actions
            .iter()
            .all(|a| !matches!(a, PointerAction::Motion { .. })));
    }

    #[test]
    fn test_extended_buttons() {
        let actions = translate_extended_mouse_event(PTR_FLAGS_DOWN | PTR_XFLAGS_BUTTON1, 5, 5);
        assert_eq!(
            actions[1],
            PointerAction::Button {
                button: BTN_SIDE,
                state: ButtonState::Pressed
            }
        );

        let actions = translate_extended_mouse_event(PTR_XFLAGS_BUTTON2, 5, 5);
        assert_eq!(
            actions[1],
            PointerAction::Button {
                button: BTN_EXTRA,
                state: ButtonState::Released
            }
        );
    }
}

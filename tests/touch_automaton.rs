//! Property test for the touch contact automaton: arbitrary flag
//! sequences must drive a contact through the states of the transition
//! table, and every exit from the engaged state must emit exactly one
//! of up/cancel.

use proptest::prelude::*;

use lamco_rdp_session::input::touch::ContactState;
use lamco_rdp_session::input::{TouchAction, TouchTranslator};
use lamco_rdp_session::peer::pdu::contact_flags::{
    CONTACT_FLAG_CANCELED, CONTACT_FLAG_DOWN, CONTACT_FLAG_INCONTACT, CONTACT_FLAG_INRANGE,
    CONTACT_FLAG_UP, CONTACT_FLAG_UPDATE,
};
use lamco_rdp_session::peer::pdu::{TouchContact, TouchFrame};

const DOWN_CONTACT: u32 = CONTACT_FLAG_DOWN | CONTACT_FLAG_INRANGE | CONTACT_FLAG_INCONTACT;
const MOVE_CONTACT: u32 = CONTACT_FLAG_UPDATE | CONTACT_FLAG_INRANGE | CONTACT_FLAG_INCONTACT;
const HOVER: u32 = CONTACT_FLAG_UPDATE | CONTACT_FLAG_INRANGE;
const HOVER_CANCEL: u32 = CONTACT_FLAG_UPDATE | CONTACT_FLAG_CANCELED;
const UP_IN_RANGE: u32 = CONTACT_FLAG_UP | CONTACT_FLAG_INRANGE;
const UP_CANCEL: u32 = CONTACT_FLAG_UP | CONTACT_FLAG_CANCELED;

/// Flag combinations a client may send, valid and invalid alike.
fn arb_flags() -> impl Strategy<Value = u32> {
    prop::sample::select(vec![
        DOWN_CONTACT,
        MOVE_CONTACT,
        HOVER,
        HOVER_CANCEL,
        CONTACT_FLAG_UPDATE,
        UP_IN_RANGE,
        UP_CANCEL,
        CONTACT_FLAG_UP,
        CONTACT_FLAG_INCONTACT,
        0,
    ])
}

/// Reference transition table ([MS-RDPEI] 3.1.1.1).
fn model_transition(state: ContactState, flags: u32) -> ContactState {
    match state {
        ContactState::OutOfRange => match flags {
            f if f == DOWN_CONTACT => ContactState::Engaged,
            f if f == HOVER => ContactState::Hovering,
            _ => ContactState::OutOfRange,
        },
        ContactState::Hovering => match flags {
            f if f == DOWN_CONTACT || f == MOVE_CONTACT => ContactState::Engaged,
            f if f == HOVER => ContactState::Hovering,
            f if f == HOVER_CANCEL || f == CONTACT_FLAG_UPDATE => ContactState::OutOfRange,
            _ => ContactState::Hovering,
        },
        ContactState::Engaged => match flags {
            f if f == MOVE_CONTACT => ContactState::Engaged,
            f if f == UP_IN_RANGE => ContactState::Hovering,
            f if f == UP_CANCEL || f == CONTACT_FLAG_UP => ContactState::OutOfRange,
            _ => ContactState::Engaged,
        },
    }
}

fn in_bounds(x: i32, y: i32) -> Option<(u32, f64, f64)> {
    Some((0, x as f64, y as f64))
}

proptest! {
    #[test]
    fn touch_states_match_transition_table(flag_sequence in prop::collection::vec(arb_flags(), 0..64)) {
        let mut translator = TouchTranslator::new();
        let mut model = ContactState::OutOfRange;

        for flags in flag_sequence {
            let frame = TouchFrame {
                contacts: vec![TouchContact {
                    contact_id: 0,
                    x: 10,
                    y: 10,
                    flags,
                }],
            };
            let actions = translator.handle_frame(&frame, in_bounds);

            let previous = model;
            model = model_transition(model, flags);
            prop_assert_eq!(translator.contact_state(0), model);

            let ups = actions
                .iter()
                .filter(|a| matches!(a, TouchAction::Up { .. }))
                .count();
            let cancels = actions
                .iter()
                .filter(|a| matches!(a, TouchAction::Cancel { .. }))
                .count();

            if previous == ContactState::Engaged && model != ContactState::Engaged {
                // Every engaged exit emits exactly one of up/cancel.
                prop_assert_eq!(ups + cancels, 1);
            } else {
                prop_assert_eq!(ups + cancels, 0);
            }
        }
    }

    #[test]
    fn device_frame_emitted_once_per_mutating_batch(flag_sequence in prop::collection::vec(arb_flags(), 0..64)) {
        let mut translator = TouchTranslator::new();

        for flags in flag_sequence {
            let frame = TouchFrame {
                contacts: vec![TouchContact {
                    contact_id: 3,
                    x: 5,
                    y: 5,
                    flags,
                }],
            };
            let actions = translator.handle_frame(&frame, in_bounds);

            let frames = actions
                .iter()
                .filter(|a| matches!(a, TouchAction::DeviceFrame))
                .count();
            if actions.is_empty() {
                prop_assert_eq!(frames, 0);
            } else {
                prop_assert_eq!(frames, 1);
                prop_assert!(matches!(actions.last(), Some(TouchAction::DeviceFrame)));
            }
        }
    }
}

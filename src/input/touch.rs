//! Touch Contact State Machine
//!
//! Automaton per contact id based on the touch contact state
//! transitions of [MS-RDPEI] 3.1.1.1. Contacts whose transformed
//! position lies outside every surface are marked ignored but still
//! driven through all automaton states, because the client cannot know
//! which of its contacts are useless.
//!
//! Every processed frame ends with a single device-frame notification
//! if any contact mutation reached the host.

use tracing::warn;

use crate::peer::pdu::contact_flags::{
    CONTACT_FLAG_CANCELED, CONTACT_FLAG_DOWN, CONTACT_FLAG_INCONTACT, CONTACT_FLAG_INRANGE,
    CONTACT_FLAG_UPDATE,
};
use crate::peer::pdu::{TouchContact, TouchFrame};

const CONTACT_FLAG_UP: u32 = crate::peer::pdu::contact_flags::CONTACT_FLAG_UP;

/// Number of contact ids addressable by the wire protocol.
pub const MAX_TOUCH_CONTACTS: usize = 256;

/// Automaton states per contact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContactState {
    #[default]
    OutOfRange,
    Hovering,
    Engaged,
}

/// Host-facing touch mutation. Positions are stream-local, produced by
/// the layout transform supplied to [`TouchTranslator::handle_frame`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TouchAction {
    Down {
        contact: u64,
        stream_id: u32,
        x: f64,
        y: f64,
    },
    Motion {
        contact: u64,
        stream_id: u32,
        x: f64,
        y: f64,
    },
    Up {
        contact: u64,
    },
    Cancel {
        contact: u64,
    },
    /// Exactly one per processed frame with any mutation.
    DeviceFrame,
}

#[derive(Default)]
struct ContactContext {
    state: ContactState,
    /// Host contact handle while reserved (Hovering or Engaged).
    contact: Option<u64>,
    ignore: bool,
}

/// Per-session touch automaton over all 256 contact ids.
pub struct TouchTranslator {
    contacts: Vec<ContactContext>,
    next_contact_handle: u64,
}

impl Default for TouchTranslator {
    fn default() -> Self {
        Self::new()
    }
}

impl TouchTranslator {
    pub fn new() -> Self {
        TouchTranslator {
            contacts: (0..MAX_TOUCH_CONTACTS)
                .map(|_| ContactContext::default())
                .collect(),
            next_contact_handle: 1,
        }
    }

    /// Current automaton state of a contact id.
    pub fn contact_state(&self, contact_id: u8) -> ContactState {
        self.contacts[contact_id as usize].state
    }

    /// Process one touch frame. `transform` maps client desktop
    /// coordinates to a surface's stream and local position; `None`
    /// marks the contact ignored.
    pub fn handle_frame<F>(&mut self, frame: &TouchFrame, transform: F) -> Vec<TouchAction>
    where
        F: Fn(i32, i32) -> Option<(u32, f64, f64)>,
    {
        let mut actions = Vec::new();

        for contact in &frame.contacts {
            self.process_contact(contact, &transform, &mut actions);
        }

        if !actions.is_empty() {
            actions.push(TouchAction::DeviceFrame);
        }
        actions
    }

    /// Cancel every reserved contact (channel teardown).
    pub fn cancel_all(&mut self) -> Vec<TouchAction> {
        let mut actions = Vec::new();
        for context in &mut self.contacts {
            if let Some(contact) = context.contact.take() {
                if context.state == ContactState::Engaged && !context.ignore {
                    actions.push(TouchAction::Cancel { contact });
                }
            }
            context.state = ContactState::OutOfRange;
            context.ignore = false;
        }
        if !actions.is_empty() {
            actions.push(TouchAction::DeviceFrame);
        }
        actions
    }

    fn acquire_handle(&mut self) -> u64 {
        let handle = self.next_contact_handle;
        self.next_contact_handle += 1;
        handle
    }

    fn process_contact<F>(
        &mut self,
        data: &TouchContact,
        transform: &F,
        actions: &mut Vec<TouchAction>,
    ) where
        F: Fn(i32, i32) -> Option<(u32, f64, f64)>,
    {
        match self.contacts[data.contact_id as usize].state {
            ContactState::OutOfRange => self.handle_out_of_range(data, transform, actions),
            ContactState::Hovering => self.handle_hovering(data, transform, actions),
            ContactState::Engaged => self.handle_engaged(data, transform, actions),
        }
    }

    fn handle_out_of_range<F>(
        &mut self,
        data: &TouchContact,
        transform: &F,
        actions: &mut Vec<TouchAction>,
    ) where
        F: Fn(i32, i32) -> Option<(u32, f64, f64)>,
    {
        let flags = data.flags;
        if flags == CONTACT_FLAG_DOWN | CONTACT_FLAG_INRANGE | CONTACT_FLAG_INCONTACT {
            let handle = self.acquire_handle();
            let context = &mut self.contacts[data.contact_id as usize];
            context.contact = Some(handle);

            if let Some((stream_id, x, y)) = transform(data.x, data.y) {
                actions.push(TouchAction::Down {
                    contact: handle,
                    stream_id,
                    x,
                    y,
                });
            } else {
                context.ignore = true;
            }
            context.state = ContactState::Engaged;
        } else if flags == CONTACT_FLAG_UPDATE | CONTACT_FLAG_INRANGE {
            let handle = self.acquire_handle();
            let context = &mut self.contacts[data.contact_id as usize];
            context.contact = Some(handle);
            context.state = ContactState::Hovering;
        } else {
            warn!(
                "protocol violation: contact flags 0x{:08X} in state 'out of range' for contact {}",
                flags, data.contact_id
            );
        }
    }

    fn handle_hovering<F>(
        &mut self,
        data: &TouchContact,
        transform: &F,
        actions: &mut Vec<TouchAction>,
    ) where
        F: Fn(i32, i32) -> Option<(u32, f64, f64)>,
    {
        let flags = data.flags;
        if flags == CONTACT_FLAG_DOWN | CONTACT_FLAG_INRANGE | CONTACT_FLAG_INCONTACT
            || flags == CONTACT_FLAG_UPDATE | CONTACT_FLAG_INRANGE | CONTACT_FLAG_INCONTACT
        {
            let context = &mut self.contacts[data.contact_id as usize];
            let handle = context.contact.expect("hovering contact is reserved");

            if let Some((stream_id, x, y)) = transform(data.x, data.y) {
                actions.push(TouchAction::Down {
                    contact: handle,
                    stream_id,
                    x,
                    y,
                });
            } else {
                context.ignore = true;
            }
            context.state = ContactState::Engaged;
        } else if flags == CONTACT_FLAG_UPDATE | CONTACT_FLAG_INRANGE {
            // Still hovering.
        } else if flags == CONTACT_FLAG_UPDATE | CONTACT_FLAG_CANCELED
            || flags == CONTACT_FLAG_UPDATE
        {
            // A dismissed hovering contact is disposed without any
            // host emission.
            let context = &mut self.contacts[data.contact_id as usize];
            context.contact = None;
            context.ignore = false;
            context.state = ContactState::OutOfRange;
        } else {
            warn!(
                "protocol violation: contact flags 0x{:08X} in state 'hovering' for contact {}",
                flags, data.contact_id
            );
        }
    }

    fn handle_engaged<F>(
        &mut self,
        data: &TouchContact,
        transform: &F,
        actions: &mut Vec<TouchAction>,
    ) where
        F: Fn(i32, i32) -> Option<(u32, f64, f64)>,
    {
        let flags = data.flags;
        if flags == CONTACT_FLAG_UPDATE | CONTACT_FLAG_INRANGE | CONTACT_FLAG_INCONTACT {
            let context = &self.contacts[data.contact_id as usize];
            let handle = context.contact.expect("engaged contact is reserved");
            if context.ignore {
                return;
            }
            if let Some((stream_id, x, y)) = transform(data.x, data.y) {
                actions.push(TouchAction::Motion {
                    contact: handle,
                    stream_id,
                    x,
                    y,
                });
            }
        } else if flags == CONTACT_FLAG_UP | CONTACT_FLAG_INRANGE {
            // Lifted but still in range: emit the up, dispose the old
            // contact and reserve a fresh one for the hover.
            let old_handle = {
                let context = &mut self.contacts[data.contact_id as usize];
                let handle = context.contact.take().expect("engaged contact is reserved");
                if !context.ignore {
                    Some(handle)
                } else {
                    None
                }
            };
            if let Some(handle) = old_handle {
                actions.push(TouchAction::Up { contact: handle });
            }

            let new_handle = self.acquire_handle();
            let context = &mut self.contacts[data.contact_id as usize];
            context.contact = Some(new_handle);
            context.ignore = false;
            context.state = ContactState::Hovering;
        } else if flags == CONTACT_FLAG_UP | CONTACT_FLAG_CANCELED || flags == CONTACT_FLAG_UP {
            let context = &mut self.contacts[data.contact_id as usize];
            let handle = context.contact.take().expect("engaged contact is reserved");
            if !context.ignore {
                if flags & CONTACT_FLAG_CANCELED != 0 {
                    actions.push(TouchAction::Cancel { contact: handle });
                } else {
                    actions.push(TouchAction::Up { contact: handle });
                }
            }
            context.ignore = false;
            context.state = ContactState::OutOfRange;
        } else {
            warn!(
                "protocol violation: contact flags 0x{:08X} in state 'engaged' for contact {}",
                flags, data.contact_id
            );
        }
    }
}

//! Session Flag Word
//!
//! The session-global flags live in one atomic word so the socket,
//! graphics and main-loop threads can gate on them without locking.
//!
//! No rendering activity happens while `ACTIVATED` is clear, while
//! `OUTPUT_ENABLED` is clear, or while `PENDING_GFX_INIT` is set.

use std::sync::atomic::{AtomicU32, Ordering};

/// Set by post-connect; cleared by teardown and fatal errors.
pub const ACTIVATED: u32 = 1 << 0;
/// Set by post-connect and SuppressOutput(allow); cleared by
/// SuppressOutput(deny).
pub const OUTPUT_ENABLED: u32 = 1 << 1;
/// Set by post-connect when the client supports the graphics pipeline;
/// cleared once the GFX channel is ready.
pub const PENDING_GFX_INIT: u32 = 1 << 2;
/// Set by desktop resizes and GFX readiness; cleared after the
/// graphics reset went out.
pub const PENDING_GFX_RESET: u32 = 1 << 3;

/// The atomic session flag word.
#[derive(Default)]
pub struct SessionFlags(AtomicU32);

impl SessionFlags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, flags: u32) {
        self.0.fetch_or(flags, Ordering::AcqRel);
    }

    pub fn clear(&self, flags: u32) {
        self.0.fetch_and(!flags, Ordering::AcqRel);
    }

    /// Whether every given flag is set.
    pub fn is_set(&self, flags: u32) -> bool {
        self.0.load(Ordering::Acquire) & flags == flags
    }

    /// Whether the session may render right now.
    pub fn rendering_allowed(&self) -> bool {
        let word = self.0.load(Ordering::Acquire);
        word & ACTIVATED != 0 && word & OUTPUT_ENABLED != 0 && word & PENDING_GFX_INIT == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_clear() {
        let flags = SessionFlags::new();
        assert!(!flags.is_set(ACTIVATED));

        flags.set(ACTIVATED | OUTPUT_ENABLED);
        assert!(flags.is_set(ACTIVATED));
        assert!(flags.is_set(ACTIVATED | OUTPUT_ENABLED));

        flags.clear(ACTIVATED);
        assert!(!flags.is_set(ACTIVATED));
        assert!(flags.is_set(OUTPUT_ENABLED));
    }

    #[test]
    fn test_rendering_gate() {
        let flags = SessionFlags::new();
        assert!(!flags.rendering_allowed());

        flags.set(ACTIVATED | OUTPUT_ENABLED);
        assert!(flags.rendering_allowed());

        flags.set(PENDING_GFX_INIT);
        assert!(!flags.rendering_allowed());

        flags.clear(PENDING_GFX_INIT);
        flags.clear(OUTPUT_ENABLED);
        assert!(!flags.rendering_allowed());
    }
}

//! # lamco-rdp-session
//!
//! Server-side RDP session runtime for Linux remote desktop hosts.
//!
//! This crate is the per-client state machine and the subsystems it
//! owns; the embedding process supplies desktop frames, accepts input
//! injection and exposes a clipboard through the [`host`] traits,
//! while the RDP wire codec sits behind the [`peer`] contract.
//!
//! # Architecture
//!
//! ```text
//! lamco-rdp-session
//!   ├─> Session Runtime (peer loop, capability gate, flags, teardown)
//!   ├─> Layout Manager (monitor config → surfaces → capture streams)
//!   ├─> Graphics Stack (damage, encode sessions, GFX bridge, bitmaps)
//!   ├─> Cursor Renderer (pointer cache, system/hidden/cached updates)
//!   ├─> DVC Registry (creation-status multiplexing)
//!   ├─> Clipboard (CLIPRDR FSM + FUSE file selections)
//!   ├─> Audio (RDPSND playback + AUDIN capture)
//!   └─> Input Translation (scancodes, unicode, pointer, touch)
//! ```
//!
//! # Data Flow
//!
//! **Ingress:** peer library → session runtime → per-channel FSMs →
//! host-facing calls (input events, monitor layout, clipboard mime
//! advertisements).
//!
//! **Egress:** host capture → encode session → graphics submission
//! pipeline → peer library. Pointer updates flow host → cursor
//! renderer → peer library.

#![warn(clippy::all)]

/// Audio playback and input channels.
pub mod audio;

/// CLIPRDR clipboard state machine and FUSE file selections.
pub mod clipboard;

/// Session settings consumed from the embedding host.
pub mod config;

/// Cursor renderer and pointer cache.
pub mod cursor;

/// Display-control (DISP) channel.
pub mod display;

/// Dynamic virtual channel registry.
pub mod dvc;

/// Session error taxonomy.
pub mod error;

/// Damage tracking, encode sessions and the submission pipeline.
pub mod graphics;

/// Embedding-host contract.
pub mod host;

/// Input translation.
pub mod input;

/// Monitor configs, surfaces and the layout manager.
pub mod layout;

/// Logging bootstrap helper.
pub mod logging;

/// Peer library contract.
pub mod peer;

/// The session runtime.
pub mod session;

/// Test doubles for the peer, host and codec collaborators.
pub mod testing;

pub use error::{ErrorInfo, SessionError};
pub use session::{Session, SessionConfig};

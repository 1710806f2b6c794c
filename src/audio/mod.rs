//! Audio Channels
//!
//! RDPSND playback and AUDIN capture, both over dynamic virtual
//! channels, plus the DSP collaborator interfaces they negotiate
//! against.

pub mod dsp;
pub mod input;
pub mod playback;

pub use dsp::{AudioDsp, BuiltinDsp};
pub use input::AudioInput;
pub use playback::AudioPlayback;

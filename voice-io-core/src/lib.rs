//! # voice-io-core
//!
//! Platform-agnostic core of the voice I/O engine.
//!
//! Provides the lock-free frame ring, the capture and playback sessions, and
//! the handle table behind the C surface. Platform backends (WASAPI,
//! CoreAudio, AVAudioEngine, PulseAudio, Oboe) implement the
//! `CaptureBackend` / `PlaybackBackend` traits and plug into the generic
//! sessions.
//!
//! ## Architecture
//!
//! ```text
//! voice-io-core (this crate)
//! ├── traits/       ← CaptureBackend, PlaybackBackend, SampleSource
//! ├── models/       ← VoiceError, VoiceConfig, SessionState, Frames
//! ├── processing/   ← RingBuffer, sample decoding, signal levels
//! ├── session/      ← CaptureSession, PlaybackSession (generic over the backend)
//! └── handles       ← HandleTable, HandleEngine (integer-status API)
//! ```

pub mod handles;
pub mod models;
pub mod processing;
pub mod session;
pub mod traits;

// Re-export key types at crate root for convenience.
pub use handles::{HandleEngine, HandleTable};
pub use models::config::{Channels, VoiceConfig};
pub use models::error::{VoiceError, VoiceResult};
pub use models::frames::{CaptureStats, Frames, RecvInto};
pub use models::state::{SessionState, StreamState};
pub use processing::ring_buffer::{frame_channel, FrameConsumer, FrameProducer, RingBuffer};
pub use processing::sample_format::SampleEncoding;
pub use session::capture::CaptureSession;
pub use session::playback::PlaybackSession;
pub use traits::backend::{CaptureBackend, PlaybackBackend, SampleSource};

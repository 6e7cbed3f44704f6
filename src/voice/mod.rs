//! Real-time spoken tutoring over a streaming voice endpoint.
//!
//! ## Design
//! - One logical thread of control: [`runner`] serializes commands, capture
//!   frames and link events into [`session::VoiceEngine`]
//! - Half-duplex capture gate: learner audio is dropped while the tutor speaks
//! - Gapless playback scheduling with flush on barge-in
//! - English-only language gate on learner transcripts
//! - Fast-path step advance over the open link, with one reconnect fallback
//! - Device, transport and credential seams are traits so the engine runs
//!   against fakes in tests

pub mod capture;
pub mod credentials;
#[cfg(feature = "audio-device")]
pub mod device;
pub mod error;
pub mod gemini_live;
pub mod mixer;
pub mod persona;
pub mod playback;
pub mod runner;
pub mod session;
pub mod transcript;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

// ── Shared voice event type ──────────────────────────────────────

/// Inbound event produced by a live link.
#[derive(Debug, Clone, PartialEq)]
pub enum VoiceEvent {
    /// Setup acknowledged, ready to stream.
    SetupComplete,
    /// Synthesized speech chunk (PCM16, 24kHz mono).
    Audio { data: Vec<u8> },
    /// Partial transcription of the learner's speech.
    InputTranscript { text: String },
    /// Partial transcription of the tutor's speech.
    OutputTranscript { text: String },
    /// The tutor finished a response turn.
    TurnComplete,
    /// The tutor was interrupted by learner speech.
    Interrupted,
    /// The endpoint will close the connection soon.
    GoAway { time_left: Option<String> },
    /// Remote error, or a close frame carrying an error reason.
    Error { message: String },
}

pub use capture::{AudioFrame, CaptureDevice, CaptureGate, FrameSink};
pub use credentials::{CredentialSource, KeyRing};
#[cfg(feature = "audio-device")]
pub use device::{CpalCapture, CpalSink};
pub use error::{VoiceError, VoiceResult};
pub use gemini_live::GeminiLiveSession;
pub use persona::SessionContext;
pub use playback::{AudioSink, PlaybackScheduler};
pub use runner::VoiceSessionHandle;
pub use session::{
    AdvancePath, EngineInput, LifecycleState, SessionSnapshot, SessionStats, TurnState,
    VoiceEngine,
};
pub use transcript::TranscriptAggregator;
pub use transport::{GeminiLiveTransport, LiveLink, LiveTransport};

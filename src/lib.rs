//! Real-time spoken English tutoring over a streaming voice endpoint.
//!
//! [`voice::VoiceEngine`] owns one tutoring session: microphone capture,
//! gapless playback, transcripts with an English-only gate, and scripted
//! step advances. [`voice::VoiceSessionHandle`] runs it as an actor.

pub mod config;
pub mod voice;

pub use config::Config;

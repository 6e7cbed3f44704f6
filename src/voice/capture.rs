//! Microphone capture and the half-duplex gate.
//!
//! A [`CaptureDevice`] pushes fixed-size blocks of mono samples into a
//! [`FrameSink`] from its own callback thread. The sink consults the shared
//! [`CaptureGate`] before anything is encoded or queued:
//!
//! - closing: the session is tearing down, drop
//! - stale generation: the sink belongs to an older session handle, drop
//! - tutor speaking: half-duplex discipline, drop
//!
//! Surviving frames are PCM16-encoded and queued to the engine inbox. A
//! closed inbox is an expected teardown race and is swallowed.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use super::error::{VoiceError, VoiceResult};
use super::session::EngineInput;
use crate::config::CaptureConfig;

/// One PCM16-encoded capture block tagged with the session it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    pub generation: u64,
    /// PCM16 little-endian mono.
    pub pcm: Vec<u8>,
}

/// Convert normalized float samples to PCM16 little-endian bytes.
pub fn encode_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &s in samples {
        let clamped = s.clamp(-1.0, 1.0);
        let v = if clamped < 0.0 {
            (clamped * 32768.0) as i16
        } else {
            (clamped * 32767.0) as i16
        };
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

// ── Gate ──────────────────────────────────────────────────────────

/// Flags shared between the engine and the capture callback thread.
#[derive(Debug, Default)]
pub struct CaptureGate {
    closing: AtomicBool,
    ai_speaking: AtomicBool,
    generation: AtomicU64,
    gated: AtomicU64,
    dropped: AtomicU64,
}

impl CaptureGate {
    pub fn new() -> Self {
        Self {
            // Nothing flows until a session opens the gate.
            closing: AtomicBool::new(true),
            ..Self::default()
        }
    }

    /// Admit frames for `generation`.
    pub fn open(&self, generation: u64) {
        self.generation.store(generation, Ordering::SeqCst);
        self.ai_speaking.store(false, Ordering::SeqCst);
        self.closing.store(false, Ordering::SeqCst);
    }

    /// First step of teardown: in-flight callbacks observe this and no-op.
    pub fn close(&self) {
        self.closing.store(true, Ordering::SeqCst);
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    pub fn set_ai_speaking(&self, speaking: bool) {
        self.ai_speaking.store(speaking, Ordering::SeqCst);
    }

    pub fn is_ai_speaking(&self) -> bool {
        self.ai_speaking.load(Ordering::SeqCst)
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Frames dropped because the tutor was speaking.
    pub fn gated_count(&self) -> u64 {
        self.gated.load(Ordering::Relaxed)
    }

    /// Frames dropped because the session was closing or gone.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn reset_counters(&self) {
        self.gated.store(0, Ordering::Relaxed);
        self.dropped.store(0, Ordering::Relaxed);
    }
}

// ── Sink ──────────────────────────────────────────────────────────

/// Where a capture device delivers its blocks. Cheap to clone.
#[derive(Debug, Clone)]
pub struct FrameSink {
    generation: u64,
    gate: Arc<CaptureGate>,
    inbox: mpsc::UnboundedSender<EngineInput>,
}

impl FrameSink {
    pub fn new(
        generation: u64,
        gate: Arc<CaptureGate>,
        inbox: mpsc::UnboundedSender<EngineInput>,
    ) -> Self {
        Self {
            generation,
            gate,
            inbox,
        }
    }

    /// Offer one block of samples. Returns true when the frame was queued.
    /// Never fails: every drop is counted and swallowed.
    pub fn deliver(&self, samples: &[f32]) -> bool {
        if samples.is_empty() {
            return false;
        }
        if self.gate.is_closing() || self.gate.generation() != self.generation {
            self.gate.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        if self.gate.is_ai_speaking() {
            self.gate.gated.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        let frame = AudioFrame {
            generation: self.generation,
            pcm: encode_pcm16(samples),
        };
        if self.inbox.send(EngineInput::Frame(frame)).is_err() {
            self.gate.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(generation = self.generation, "Engine inbox closed, dropping frame");
            return false;
        }
        true
    }

    /// Report that the device failed after `start` returned, for devices
    /// that acquire the hardware off the caller's thread.
    pub fn fail(&self, error: VoiceError) {
        let failure = EngineInput::CaptureFailed {
            generation: self.generation,
            error,
        };
        if self.inbox.send(failure).is_err() {
            tracing::debug!(generation = self.generation, "Engine inbox closed, dropping capture failure");
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

// ── Device seam ───────────────────────────────────────────────────

/// A microphone that emits blocks of `config.block_size` mono samples at
/// `config.sample_rate`.
///
/// Both methods run on the engine's event loop and must not wait on the
/// hardware. A device that opens asynchronously reports a late failure
/// through [`FrameSink::fail`].
pub trait CaptureDevice: Send {
    /// Begin acquiring the device and delivering to `sink`. Errors are
    /// [`VoiceError::Device`].
    fn start(&mut self, config: &CaptureConfig, sink: FrameSink) -> VoiceResult<()>;

    /// Stop delivering. Safe to call when not started.
    fn stop(&mut self);
}

/// Re-chunks arbitrary callback buffers into fixed-size blocks.
#[derive(Debug)]
pub struct BlockAssembler {
    block_size: usize,
    pending: Vec<f32>,
}

impl BlockAssembler {
    pub fn new(block_size: usize) -> Self {
        Self {
            block_size: block_size.max(1),
            pending: Vec::with_capacity(block_size.max(1)),
        }
    }

    /// Append samples, calling `emit` for every completed block.
    pub fn push(&mut self, samples: &[f32], mut emit: impl FnMut(&[f32])) {
        let mut rest = samples;
        while !rest.is_empty() {
            let take = (self.block_size - self.pending.len()).min(rest.len());
            self.pending.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
            if self.pending.len() == self.block_size {
                emit(&self.pending);
                self.pending.clear();
            }
        }
    }
}

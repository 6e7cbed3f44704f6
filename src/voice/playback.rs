//! Gapless playback of inbound speech chunks.
//!
//! Every decoded chunk starts at `max(cursor, now)` on the output timeline
//! and advances the cursor by its duration, so chunks play back-to-back
//! regardless of network jitter. [`PlaybackScheduler::flush`] stops every
//! in-flight source and rewinds the cursor to zero.

use std::collections::HashSet;

use super::error::{VoiceError, VoiceResult};

/// Identifier of one scheduled playback source.
pub type SourceId = u64;

/// Decoded mono PCM ready for the output sink.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackBuffer {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl PlaybackBuffer {
    /// Duration in seconds.
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / f64::from(self.sample_rate)
    }
}

/// Decode a PCM16 little-endian mono chunk into normalized samples.
pub fn decode_pcm16(data: &[u8], sample_rate: u32) -> VoiceResult<PlaybackBuffer> {
    if data.is_empty() {
        return Err(VoiceError::Decode("empty audio chunk".into()));
    }
    if data.len() % 2 != 0 {
        return Err(VoiceError::Decode(format!(
            "PCM16 chunk has odd length {}",
            data.len()
        )));
    }
    let samples = data
        .chunks_exact(2)
        .map(|pair| f32::from(i16::from_le_bytes([pair[0], pair[1]])) / 32768.0)
        .collect();
    Ok(PlaybackBuffer {
        samples,
        sample_rate,
    })
}

/// Output device seam. Times are seconds on the sink's own clock.
pub trait AudioSink: Send {
    /// Current position of the output clock.
    fn now(&self) -> f64;

    /// Start `buffer` at time `at` (never earlier than `now`).
    fn start(&mut self, id: SourceId, buffer: PlaybackBuffer, at: f64) -> VoiceResult<()>;

    /// Stop a source immediately. Unknown ids are ignored.
    fn stop(&mut self, id: SourceId);

    /// Sources that finished naturally since the last call.
    fn drain_finished(&mut self) -> Vec<SourceId>;
}

impl<S: AudioSink + ?Sized> AudioSink for Box<S> {
    fn now(&self) -> f64 {
        (**self).now()
    }

    fn start(&mut self, id: SourceId, buffer: PlaybackBuffer, at: f64) -> VoiceResult<()> {
        (**self).start(id, buffer, at)
    }

    fn stop(&mut self, id: SourceId) {
        (**self).stop(id);
    }

    fn drain_finished(&mut self) -> Vec<SourceId> {
        (**self).drain_finished()
    }
}

/// Schedules chunks on an [`AudioSink`] without gaps or overlap.
pub struct PlaybackScheduler<S: AudioSink> {
    sink: S,
    sample_rate: u32,
    cursor: f64,
    active: HashSet<SourceId>,
    next_id: SourceId,
}

impl<S: AudioSink> PlaybackScheduler<S> {
    pub fn new(sink: S, sample_rate: u32) -> Self {
        Self {
            sink,
            sample_rate,
            cursor: 0.0,
            active: HashSet::new(),
            next_id: 1,
        }
    }

    /// Decode and schedule one inbound chunk. Returns the start time, or
    /// `None` when the chunk was dropped.
    pub fn schedule(&mut self, chunk: &[u8]) -> Option<f64> {
        self.reap();

        let buffer = match decode_pcm16(chunk, self.sample_rate) {
            Ok(buffer) => buffer,
            Err(e) => {
                tracing::warn!(error = %e, bytes = chunk.len(), "Dropping undecodable audio chunk");
                return None;
            }
        };

        let duration = buffer.duration();
        let start_at = self.cursor.max(self.sink.now());
        let id = self.next_id;
        self.next_id += 1;

        if let Err(e) = self.sink.start(id, buffer, start_at) {
            tracing::warn!(error = %e, "Audio sink rejected chunk");
            return None;
        }

        self.active.insert(id);
        self.cursor = start_at + duration;
        Some(start_at)
    }

    /// Stop every in-flight source and rewind the cursor.
    pub fn flush(&mut self) {
        for id in self.active.drain() {
            self.sink.stop(id);
        }
        // Finished notifications for stopped sources are stale now.
        let _ = self.sink.drain_finished();
        self.cursor = 0.0;
    }

    /// Forget sources that finished playing on their own.
    pub fn reap(&mut self) {
        for id in self.sink.drain_finished() {
            self.active.remove(&id);
        }
    }

    pub fn cursor(&self) -> f64 {
        self.cursor
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn is_playing(&mut self) -> bool {
        self.reap();
        !self.active.is_empty()
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }
}

//! Sample-clock mixer and format helpers behind the device adapters.

use std::collections::VecDeque;

use rubato::{FastFixedIn, PolynomialDegree, Resampler};

use super::error::{VoiceError, VoiceResult};
use super::playback::SourceId;

/// Input frames per resampler call.
pub const RESAMPLER_CHUNK: usize = 256;

struct Source {
    id: SourceId,
    start: u64,
    samples: Vec<f32>,
    pos: usize,
}

/// Mixes scheduled mono sources onto an interleaved output buffer.
///
/// The clock counts output frames rendered so far, so `now` only advances
/// while the device is pulling audio.
pub struct Mixer {
    rate: u32,
    clock: u64,
    sources: Vec<Source>,
    finished: Vec<SourceId>,
}

impl Mixer {
    pub fn new(rate: u32) -> Self {
        Self {
            rate: rate.max(1),
            clock: 0,
            sources: Vec::new(),
            finished: Vec::new(),
        }
    }

    pub fn rate(&self) -> u32 {
        self.rate
    }

    /// Output clock in seconds.
    pub fn now(&self) -> f64 {
        self.clock as f64 / f64::from(self.rate)
    }

    /// Queue `samples` (already at the mixer rate) to start at `at` seconds.
    /// Start times in the past snap to the current clock.
    pub fn add(&mut self, id: SourceId, samples: Vec<f32>, at: f64) {
        let start = (at.max(0.0) * f64::from(self.rate)).round() as u64;
        self.sources.push(Source {
            id,
            start: start.max(self.clock),
            samples,
            pos: 0,
        });
    }

    pub fn remove(&mut self, id: SourceId) {
        self.sources.retain(|s| s.id != id);
    }

    pub fn active(&self) -> usize {
        self.sources.len()
    }

    /// Fill `out` (interleaved, `channels` wide) and advance the clock.
    pub fn render(&mut self, out: &mut [f32], channels: usize) {
        let channels = channels.max(1);
        let frames = out.len() / channels;
        out.fill(0.0);

        for source in &mut self.sources {
            for frame in 0..frames {
                if self.clock + (frame as u64) < source.start {
                    continue;
                }
                let Some(sample) = source.samples.get(source.pos) else {
                    break;
                };
                source.pos += 1;
                for slot in &mut out[frame * channels..(frame + 1) * channels] {
                    *slot += sample;
                }
            }
        }
        for slot in out.iter_mut() {
            *slot = slot.clamp(-1.0, 1.0);
        }

        self.clock += frames as u64;
        let finished = &mut self.finished;
        self.sources.retain(|s| {
            let done = s.pos >= s.samples.len();
            if done {
                finished.push(s.id);
            }
            !done
        });
    }

    pub fn drain_finished(&mut self) -> Vec<SourceId> {
        std::mem::take(&mut self.finished)
    }
}

/// Average interleaved frames down to mono.
pub fn downmix(data: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return data.to_vec();
    }
    data.chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

/// Stateful mono sample-rate converter.
///
/// Input is buffered until a full chunk is available, so callers may push
/// buffers of any size without losing the fractional tail of each one.
pub struct StreamResampler {
    inner: Option<FastFixedIn<f32>>,
    chunk: usize,
    pending: Vec<f32>,
}

impl StreamResampler {
    pub fn new(from: u32, to: u32, chunk: usize) -> VoiceResult<Self> {
        let chunk = chunk.max(1);
        let inner = if from == to || from == 0 || to == 0 {
            None
        } else {
            let ratio = f64::from(to) / f64::from(from);
            let resampler =
                FastFixedIn::<f32>::new(ratio, 2.0, PolynomialDegree::Septic, chunk, 1)
                    .map_err(|e| {
                        VoiceError::Device(format!("failed to build {from}->{to} Hz resampler: {e}"))
                    })?;
            Some(resampler)
        };
        Ok(Self {
            inner,
            chunk,
            pending: Vec::with_capacity(chunk * 2),
        })
    }

    pub fn is_passthrough(&self) -> bool {
        self.inner.is_none()
    }

    pub fn chunk(&self) -> usize {
        self.chunk
    }

    /// Feed `input` and append every output sample that is ready to `out`.
    pub fn push(&mut self, input: &[f32], out: &mut Vec<f32>) -> VoiceResult<()> {
        let Some(inner) = self.inner.as_mut() else {
            out.extend_from_slice(input);
            return Ok(());
        };

        self.pending.extend_from_slice(input);
        let mut consumed = 0;
        while self.pending.len() - consumed >= self.chunk {
            let block = &self.pending[consumed..consumed + self.chunk];
            let converted = inner
                .process(&[block], None)
                .map_err(|e| VoiceError::Device(format!("resampling failed: {e}")))?;
            if let Some(channel) = converted.first() {
                out.extend_from_slice(channel);
            }
            consumed += self.chunk;
        }
        self.pending.drain(..consumed);
        Ok(())
    }
}

/// Pulls mono audio from a [`Mixer`] at the mixer rate and writes it to an
/// interleaved device buffer at the device rate.
pub struct OutputStage {
    resampler: StreamResampler,
    scratch: Vec<f32>,
    converted: Vec<f32>,
    ready: VecDeque<f32>,
}

impl OutputStage {
    pub fn new(mixer_rate: u32, device_rate: u32) -> VoiceResult<Self> {
        Ok(Self {
            resampler: StreamResampler::new(mixer_rate, device_rate, RESAMPLER_CHUNK)?,
            scratch: Vec::new(),
            converted: Vec::new(),
            ready: VecDeque::new(),
        })
    }

    /// Fill `out` (interleaved, `channels` wide). Frames the resampler has not
    /// produced yet are left silent.
    pub fn fill(&mut self, mixer: &mut Mixer, out: &mut [f32], channels: usize) {
        let channels = channels.max(1);
        let frames = out.len() / channels;

        while self.ready.len() < frames {
            let want = if self.resampler.is_passthrough() {
                frames - self.ready.len()
            } else {
                self.resampler.chunk()
            };
            self.scratch.resize(want, 0.0);
            mixer.render(&mut self.scratch, 1);

            self.converted.clear();
            if let Err(e) = self.resampler.push(&self.scratch, &mut self.converted) {
                tracing::warn!(error = %e, "Output resampling failed");
                break;
            }
            self.ready.extend(self.converted.iter().copied());
        }

        for frame in out.chunks_exact_mut(channels) {
            let sample = self.ready.pop_front().unwrap_or(0.0);
            frame.fill(sample);
        }
    }
}

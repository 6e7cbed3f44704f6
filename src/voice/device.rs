//! Microphone and speaker adapters over cpal.
//!
//! cpal streams are not `Send` on every host, so each stream lives on its
//! own thread and is dropped when that thread's stop channel closes.

use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use parking_lot::Mutex;

use super::capture::{BlockAssembler, CaptureDevice, FrameSink};
use super::error::{VoiceError, VoiceResult};
use super::mixer::{downmix, Mixer, OutputStage, StreamResampler, RESAMPLER_CHUNK};
use super::playback::{AudioSink, PlaybackBuffer, SourceId};
use crate::config::CaptureConfig;

struct StreamThread {
    stop: std_mpsc::Sender<()>,
    thread: JoinHandle<()>,
}

impl StreamThread {
    /// Open a stream on a fresh thread and park it there until
    /// [`StreamThread::release`]. Returns without waiting for the device.
    ///
    /// `after` is joined on the new thread first so two streams never hold
    /// the same device. `opened` runs on the new thread with the outcome.
    fn spawn<T, F, R>(
        name: &str,
        after: Option<JoinHandle<()>>,
        open: F,
        opened: R,
    ) -> VoiceResult<Self>
    where
        F: FnOnce() -> VoiceResult<(cpal::Stream, T)> + Send + 'static,
        R: FnOnce(VoiceResult<T>) + Send + 'static,
    {
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        let thread = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                if let Some(previous) = after {
                    if previous.join().is_err() {
                        tracing::warn!("Previous audio stream thread panicked");
                    }
                }
                match open() {
                    Ok((stream, value)) => {
                        opened(Ok(value));
                        // Blocks until the sender is dropped.
                        let _ = stop_rx.recv();
                        drop(stream);
                    }
                    Err(e) => opened(Err(e)),
                }
            })
            .map_err(|e| VoiceError::Device(format!("failed to spawn {name} thread: {e}")))?;

        Ok(Self {
            stop: stop_tx,
            thread,
        })
    }

    /// Tell the thread to drop its stream. Does not wait for it.
    fn release(self) -> JoinHandle<()> {
        drop(self.stop);
        self.thread
    }
}

fn device_error(context: &str, e: impl std::fmt::Display) -> VoiceError {
    VoiceError::Device(format!("{context}: {e}"))
}

// ── Capture ───────────────────────────────────────────────────────

/// Default input device, downmixed and resampled to the configured rate.
///
/// The device is opened on its own thread. A failure to open it reaches
/// the engine through [`FrameSink::fail`].
#[derive(Default)]
pub struct CpalCapture {
    running: Option<StreamThread>,
    retiring: Option<JoinHandle<()>>,
}

impl CpalCapture {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CaptureDevice for CpalCapture {
    fn start(&mut self, config: &CaptureConfig, sink: FrameSink) -> VoiceResult<()> {
        self.stop();
        if config.echo_cancellation || config.noise_suppression || config.auto_gain_control {
            tracing::debug!(
                "Echo cancellation, noise suppression and gain control are not available through cpal; capturing raw input"
            );
        }

        let target_rate = config.sample_rate;
        let block_size = config.block_size;
        let reporter = sink.clone();
        let thread = StreamThread::spawn(
            "speakwell-capture",
            self.retiring.take(),
            move || open_input(target_rate, block_size, sink),
            move |outcome| match outcome {
                Ok(device_rate) => tracing::info!(
                    device_rate = device_rate,
                    target_rate = target_rate,
                    "Microphone capture started"
                ),
                Err(e) => reporter.fail(e),
            },
        )?;
        self.running = Some(thread);
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(running) = self.running.take() {
            self.retiring = Some(running.release());
            tracing::debug!("Microphone capture stopping");
        }
    }
}

impl Drop for CpalCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

fn open_input(
    target_rate: u32,
    block_size: usize,
    sink: FrameSink,
) -> VoiceResult<(cpal::Stream, u32)> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| VoiceError::Device("no input device available".to_string()))?;
    let supported = device
        .default_input_config()
        .map_err(|e| device_error("failed to query input config", e))?;

    let channels = usize::from(supported.channels());
    let device_rate = supported.sample_rate().0;
    let stream_config: cpal::StreamConfig = supported.config();

    let mut resampler = StreamResampler::new(device_rate, target_rate, RESAMPLER_CHUNK)?;
    let mut assembler = BlockAssembler::new(block_size);
    let mut resampled = Vec::new();
    let mut process = move |mono: Vec<f32>| {
        resampled.clear();
        if let Err(e) = resampler.push(&mono, &mut resampled) {
            tracing::warn!(error = %e, "Dropping capture buffer");
            return;
        }
        assembler.push(&resampled, |block| {
            sink.deliver(block);
        });
    };
    let on_error = |e: cpal::StreamError| tracing::warn!(error = %e, "Input stream error");

    let stream = match supported.sample_format() {
        cpal::SampleFormat::F32 => device.build_input_stream(
            &stream_config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| process(downmix(data, channels)),
            on_error,
            None,
        ),
        cpal::SampleFormat::I16 => device.build_input_stream(
            &stream_config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                let samples: Vec<f32> = data.iter().map(|s| f32::from(*s) / 32768.0).collect();
                process(downmix(&samples, channels));
            },
            on_error,
            None,
        ),
        other => {
            return Err(VoiceError::Device(format!(
                "unsupported input sample format {other:?}"
            )))
        }
    }
    .map_err(|e| device_error("failed to build input stream", e))?;

    stream
        .play()
        .map_err(|e| device_error("failed to start input stream", e))?;
    Ok((stream, device_rate))
}

// ── Playback ──────────────────────────────────────────────────────

/// Default output device driven by a shared [`Mixer`] running at the
/// playback rate. The output callback converts to the device rate.
pub struct CpalSink {
    mixer: Arc<Mutex<Mixer>>,
    stream: Option<StreamThread>,
}

impl CpalSink {
    /// Open the speaker for audio at `rate` Hz. Waits for the device, so
    /// call it before the session loop starts.
    pub fn open(rate: u32) -> VoiceResult<Self> {
        let mixer = Arc::new(Mutex::new(Mixer::new(rate)));
        let (ready_tx, ready_rx) = std_mpsc::channel();
        let shared = Arc::clone(&mixer);
        let stream = StreamThread::spawn(
            "speakwell-playback",
            None,
            move || open_output(shared),
            move |outcome| {
                let _ = ready_tx.send(outcome);
            },
        )?;
        let device_rate = ready_rx.recv().map_err(|_| {
            VoiceError::Device("playback thread exited before the stream started".to_string())
        })??;
        tracing::info!(mixer_rate = rate, device_rate = device_rate, "Speaker output started");
        Ok(Self {
            mixer,
            stream: Some(stream),
        })
    }
}

impl AudioSink for CpalSink {
    fn now(&self) -> f64 {
        self.mixer.lock().now()
    }

    fn start(&mut self, id: SourceId, buffer: PlaybackBuffer, at: f64) -> VoiceResult<()> {
        let mut mixer = self.mixer.lock();
        if buffer.sample_rate != mixer.rate() {
            return Err(VoiceError::Device(format!(
                "chunk at {} Hz does not match the {} Hz output mixer",
                buffer.sample_rate,
                mixer.rate()
            )));
        }
        mixer.add(id, buffer.samples, at);
        Ok(())
    }

    fn stop(&mut self, id: SourceId) {
        self.mixer.lock().remove(id);
    }

    fn drain_finished(&mut self) -> Vec<SourceId> {
        self.mixer.lock().drain_finished()
    }
}

impl Drop for CpalSink {
    fn drop(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.release();
        }
    }
}

fn open_output(mixer: Arc<Mutex<Mixer>>) -> VoiceResult<(cpal::Stream, u32)> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| VoiceError::Device("no output device available".to_string()))?;
    let supported = device
        .default_output_config()
        .map_err(|e| device_error("failed to query output config", e))?;

    let channels = usize::from(supported.channels());
    let device_rate = supported.sample_rate().0;
    let mut stage = OutputStage::new(mixer.lock().rate(), device_rate)?;
    let stream_config: cpal::StreamConfig = supported.config();
    let on_error = |e: cpal::StreamError| tracing::warn!(error = %e, "Output stream error");

    let stream = match supported.sample_format() {
        cpal::SampleFormat::F32 => device.build_output_stream(
            &stream_config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                stage.fill(&mut mixer.lock(), data, channels);
            },
            on_error,
            None,
        ),
        cpal::SampleFormat::I16 => {
            let mut scratch = Vec::new();
            device.build_output_stream(
                &stream_config,
                move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                    scratch.resize(data.len(), 0.0);
                    stage.fill(&mut mixer.lock(), &mut scratch, channels);
                    for (out, sample) in data.iter_mut().zip(&scratch) {
                        *out = (sample * f32::from(i16::MAX)) as i16;
                    }
                },
                on_error,
                None,
            )
        }
        other => {
            return Err(VoiceError::Device(format!(
                "unsupported output sample format {other:?}"
            )))
        }
    }
    .map_err(|e| device_error("failed to build output stream", e))?;

    stream
        .play()
        .map_err(|e| device_error("failed to start output stream", e))?;
    Ok((stream, device_rate))
}

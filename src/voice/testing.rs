//! In-memory fakes for the device, transport and credential seams.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use super::capture::{CaptureDevice, FrameSink};
use super::credentials::CredentialSource;
use super::error::{VoiceError, VoiceResult};
use super::playback::{AudioSink, PlaybackBuffer, SourceId};
use super::session::{EngineInput, VoiceEngine};
use super::transport::{LinkRequest, LiveLink, LiveTransport, OpenedLink};
use super::VoiceEvent;
use crate::config::{CaptureConfig, Config};

/// Silent PCM16 chunk of `samples` samples.
pub(crate) fn chunk_of(samples: usize) -> Vec<u8> {
    vec![0u8; samples * 2]
}

// ── Audio sink ────────────────────────────────────────────────────

#[derive(Debug)]
struct FakeSource {
    id: SourceId,
    start: f64,
    duration: f64,
    stopped: bool,
    reported: bool,
}

#[derive(Debug, Default)]
struct SinkState {
    now: f64,
    sources: Vec<FakeSource>,
}

/// Output clock under test control. Sources finish when the clock passes
/// their end.
#[derive(Debug, Clone, Default)]
pub(crate) struct FakeSink {
    state: Arc<Mutex<SinkState>>,
}

impl FakeSink {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn set_now(&self, now: f64) {
        self.state.lock().now = now;
    }

    /// Sources neither stopped nor finished at the current clock.
    pub(crate) fn active_sources(&self) -> usize {
        let state = self.state.lock();
        state
            .sources
            .iter()
            .filter(|s| !s.stopped && s.start + s.duration > state.now)
            .count()
    }

    pub(crate) fn start_times(&self) -> Vec<f64> {
        self.state.lock().sources.iter().map(|s| s.start).collect()
    }
}

impl AudioSink for FakeSink {
    fn now(&self) -> f64 {
        self.state.lock().now
    }

    fn start(&mut self, id: SourceId, buffer: PlaybackBuffer, at: f64) -> VoiceResult<()> {
        self.state.lock().sources.push(FakeSource {
            id,
            start: at,
            duration: buffer.duration(),
            stopped: false,
            reported: false,
        });
        Ok(())
    }

    fn stop(&mut self, id: SourceId) {
        if let Some(source) = self.state.lock().sources.iter_mut().find(|s| s.id == id) {
            source.stopped = true;
        }
    }

    fn drain_finished(&mut self) -> Vec<SourceId> {
        let mut state = self.state.lock();
        let now = state.now;
        state
            .sources
            .iter_mut()
            .filter(|s| !s.stopped && !s.reported && s.start + s.duration <= now)
            .map(|s| {
                s.reported = true;
                s.id
            })
            .collect()
    }
}

// ── Capture ───────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct CaptureState {
    sink: Option<FrameSink>,
    running: bool,
    stops: usize,
    fail_next: Option<String>,
    emit_during_stop: bool,
    emitted_during_stop: Vec<bool>,
}

/// Microphone driven by the test through [`FakeCapture::emit`].
#[derive(Debug, Clone, Default)]
pub(crate) struct FakeCapture {
    state: Arc<Mutex<CaptureState>>,
}

impl FakeCapture {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Simulate one capture callback. Returns whether the frame was queued.
    pub(crate) fn emit(&self, samples: &[f32]) -> bool {
        let sink = {
            let state = self.state.lock();
            if !state.running {
                return false;
            }
            state.sink.clone()
        };
        sink.is_some_and(|s| s.deliver(samples))
    }

    pub(crate) fn fail_next_start(&self, message: &str) {
        self.state.lock().fail_next = Some(message.to_string());
    }

    /// Report a failure from the device thread after `start` returned.
    /// Returns false when no sink is attached.
    pub(crate) fn fail_late(&self, message: &str) -> bool {
        let sink = self.state.lock().sink.clone();
        match sink {
            Some(sink) => {
                sink.fail(VoiceError::Device(message.to_string()));
                true
            }
            None => false,
        }
    }

    /// Fire one more callback from inside `stop`, the way a platform
    /// callback can race teardown.
    pub(crate) fn emit_during_stop(&self) {
        self.state.lock().emit_during_stop = true;
    }

    pub(crate) fn emitted_during_stop(&self) -> Vec<bool> {
        self.state.lock().emitted_during_stop.clone()
    }

    pub(crate) fn is_running(&self) -> bool {
        self.state.lock().running
    }

    pub(crate) fn stops(&self) -> usize {
        self.state.lock().stops
    }
}

impl CaptureDevice for FakeCapture {
    fn start(&mut self, _config: &CaptureConfig, sink: FrameSink) -> VoiceResult<()> {
        let mut state = self.state.lock();
        if let Some(message) = state.fail_next.take() {
            return Err(VoiceError::Device(message));
        }
        state.sink = Some(sink);
        state.running = true;
        Ok(())
    }

    fn stop(&mut self) {
        let mut state = self.state.lock();
        if state.emit_during_stop {
            if let Some(sink) = state.sink.clone() {
                let queued = sink.deliver(&[0.3; 16]);
                state.emitted_during_stop.push(queued);
            }
        }
        state.sink = None;
        state.running = false;
        state.stops += 1;
    }
}

// ── Transport ─────────────────────────────────────────────────────

#[derive(Debug)]
struct FakeLinkInner {
    session_id: String,
    audio: Mutex<Vec<Vec<u8>>>,
    texts: Mutex<Vec<String>>,
    stream_ended: AtomicBool,
    closed: AtomicBool,
    fail_text: AtomicBool,
    events: Mutex<Option<mpsc::Sender<VoiceEvent>>>,
}

/// Records everything sent; the test pushes inbound events.
#[derive(Debug, Clone)]
pub(crate) struct FakeLink {
    inner: Arc<FakeLinkInner>,
}

impl FakeLink {
    fn new(session_id: String, events: mpsc::Sender<VoiceEvent>) -> Self {
        Self {
            inner: Arc::new(FakeLinkInner {
                session_id,
                audio: Mutex::new(Vec::new()),
                texts: Mutex::new(Vec::new()),
                stream_ended: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                fail_text: AtomicBool::new(false),
                events: Mutex::new(Some(events)),
            }),
        }
    }

    pub(crate) async fn push(&self, event: VoiceEvent) {
        let sender = self.inner.events.lock().clone();
        if let Some(sender) = sender {
            let _ = sender.send(event).await;
        }
    }

    /// Remote side drops the connection.
    pub(crate) fn hang_up(&self) {
        self.inner.events.lock().take();
    }

    pub(crate) fn fail_text_sends(&self) {
        self.inner.fail_text.store(true, Ordering::SeqCst);
    }

    pub(crate) fn audio_frames(&self) -> usize {
        self.inner.audio.lock().len()
    }

    pub(crate) fn texts(&self) -> Vec<String> {
        self.inner.texts.lock().clone()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn stream_ended(&self) -> bool {
        self.inner.stream_ended.load(Ordering::SeqCst)
    }
}

impl LiveLink for FakeLink {
    fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    fn send_audio(&self, pcm: Vec<u8>) -> VoiceResult<()> {
        if self.is_closed() {
            return Err(VoiceError::Send("link closed".into()));
        }
        self.inner.audio.lock().push(pcm);
        Ok(())
    }

    fn send_text(&self, text: String) -> VoiceResult<()> {
        if self.is_closed() || self.inner.fail_text.load(Ordering::SeqCst) {
            return Err(VoiceError::Send("link closed".into()));
        }
        self.inner.texts.lock().push(text);
        Ok(())
    }

    fn end_audio_stream(&self) -> VoiceResult<()> {
        if self.is_closed() {
            return Err(VoiceError::Send("link closed".into()));
        }
        self.inner.stream_ended.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.hang_up();
    }
}

#[derive(Debug, Default)]
struct TransportState {
    requests: Vec<LinkRequest>,
    links: Vec<FakeLink>,
    failures: VecDeque<VoiceError>,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct FakeTransport {
    state: Arc<Mutex<TransportState>>,
}

impl FakeTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn fail_next(&self, error: VoiceError) {
        self.state.lock().failures.push_back(error);
    }

    pub(crate) fn requests(&self) -> Vec<LinkRequest> {
        self.state.lock().requests.clone()
    }

    /// Open attempts, successful or not.
    pub(crate) fn open_count(&self) -> usize {
        self.state.lock().requests.len()
    }

    /// Links opened and not yet closed.
    pub(crate) fn open_links(&self) -> usize {
        self.state
            .lock()
            .links
            .iter()
            .filter(|l| !l.is_closed())
            .count()
    }

    pub(crate) fn last_link(&self) -> FakeLink {
        self.state
            .lock()
            .links
            .last()
            .cloned()
            .expect("no link has been opened")
    }
}

#[async_trait]
impl LiveTransport for FakeTransport {
    async fn open(&self, request: LinkRequest) -> VoiceResult<OpenedLink> {
        let mut state = self.state.lock();
        state.requests.push(request.clone());
        if let Some(error) = state.failures.pop_front() {
            return Err(error);
        }
        let (tx, rx) = mpsc::channel(64);
        let link = FakeLink::new(request.session_id, tx);
        state.links.push(link.clone());
        Ok(OpenedLink {
            link: Box::new(link),
            events: rx,
        })
    }
}

// ── Credentials ───────────────────────────────────────────────────

#[derive(Debug, Default)]
pub(crate) struct FakeCredentials {
    reselects: AtomicUsize,
}

impl FakeCredentials {
    pub(crate) fn reselects(&self) -> usize {
        self.reselects.load(Ordering::SeqCst)
    }
}

impl CredentialSource for FakeCredentials {
    fn current(&self) -> VoiceResult<String> {
        Ok("test-key".to_string())
    }

    fn reselect(&self) {
        self.reselects.fetch_add(1, Ordering::SeqCst);
    }
}

// ── Harness ───────────────────────────────────────────────────────

pub(crate) struct Fakes {
    pub(crate) transport: FakeTransport,
    pub(crate) capture: FakeCapture,
    pub(crate) sink: FakeSink,
    pub(crate) credentials: Arc<FakeCredentials>,
}

/// An engine wired to fakes, plus the engine's input queue.
pub(crate) struct Harness {
    pub(crate) engine: VoiceEngine,
    pub(crate) inbox: mpsc::UnboundedReceiver<EngineInput>,
    pub(crate) fakes: Fakes,
}

impl Harness {
    pub(crate) fn new() -> Self {
        Self::build(Config::default(), None)
    }

    pub(crate) fn with_config(config: Config) -> Self {
        Self::build(config, None)
    }

    pub(crate) fn with_credentials(credentials: Arc<dyn CredentialSource>) -> Self {
        Self::build(Config::default(), Some(credentials))
    }

    fn build(config: Config, credentials: Option<Arc<dyn CredentialSource>>) -> Self {
        let fakes = Fakes {
            transport: FakeTransport::new(),
            capture: FakeCapture::new(),
            sink: FakeSink::new(),
            credentials: Arc::new(FakeCredentials::default()),
        };
        let credentials = credentials
            .unwrap_or_else(|| fakes.credentials.clone() as Arc<dyn CredentialSource>);
        let (engine, inbox) = VoiceEngine::new(
            config,
            Arc::new(fakes.transport.clone()),
            credentials,
            Box::new(fakes.capture.clone()),
            Box::new(fakes.sink.clone()),
        );
        Self {
            engine,
            inbox,
            fakes,
        }
    }

    /// Split into parts for driving the engine from a runner.
    pub(crate) fn into_parts(self) -> (VoiceEngine, mpsc::UnboundedReceiver<EngineInput>, Fakes) {
        (self.engine, self.inbox, self.fakes)
    }

    /// Apply everything already queued.
    pub(crate) fn drain(&mut self) {
        while let Ok(input) = self.inbox.try_recv() {
            self.engine.handle_input(input);
        }
    }

    /// One capture callback, then apply the queue. Returns whether the
    /// frame got past the capture-side gate.
    pub(crate) fn emit_frame(&mut self) -> bool {
        let queued = self.fakes.capture.emit(&[0.1; 16]);
        self.drain();
        queued
    }

    /// Wait for the next queued input and apply it.
    pub(crate) async fn next_input(&mut self) {
        let input = tokio::time::timeout(Duration::from_secs(2), self.inbox.recv())
            .await
            .expect("engine input within timeout")
            .expect("engine inbox open");
        self.engine.handle_input(input);
    }

    /// Push an event on the current link and apply inputs up to and
    /// including it.
    pub(crate) async fn deliver(&mut self, event: VoiceEvent) {
        self.fakes.transport.last_link().push(event).await;
        loop {
            let input = tokio::time::timeout(Duration::from_secs(2), self.inbox.recv())
                .await
                .expect("link event forwarded within timeout")
                .expect("engine inbox open");
            let is_frame = matches!(input, EngineInput::Frame(_));
            self.engine.handle_input(input);
            if !is_frame {
                break;
            }
        }
    }
}

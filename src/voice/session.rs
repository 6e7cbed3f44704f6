//! Session lifecycle and turn state machine.
//!
//! [`VoiceEngine`] is the single owner of the session handle, the capture
//! gate, the playback scheduler and the transcript buffers. Everything that
//! happens asynchronously (capture callbacks, link events, link close)
//! arrives as an [`EngineInput`] on one queue and is applied by
//! [`VoiceEngine::handle_input`], so all state changes are serialized.
//!
//! Opening a link is split in two so the caller's event loop never blocks
//! on the network: [`VoiceEngine::begin_start`] returns a [`PendingOpen`]
//! future, and its result is applied with [`VoiceEngine::finish_open`].
//! Results for a superseded generation are closed and discarded.

use serde::Serialize;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::capture::{AudioFrame, CaptureDevice, CaptureGate, FrameSink};
use super::credentials::CredentialSource;
use super::error::{VoiceError, VoiceResult};
use super::persona::{tag_step_instruction, SessionContext};
use super::playback::{AudioSink, PlaybackScheduler};
use super::transcript::{FragmentVerdict, LanguageWarning, TranscriptAggregator};
use super::transport::{LinkRequest, LiveLink, LiveTransport, OpenedLink};
use super::VoiceEvent;
use crate::config::Config;

// ── State ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    #[default]
    Disconnected,
    Connecting,
    Live,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnState {
    /// Listening, nobody speaking.
    #[default]
    Idle,
    /// The learner is speaking.
    UserTurn,
    /// The tutor is speaking; capture is gated.
    AiTurn,
    /// The tutor was cut off; playback has been flushed.
    Interrupted,
}

/// How [`VoiceEngine::advance`] delivered the step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvancePath {
    /// Sent as a control message on the open link.
    FastPath,
    /// Delivered by a full reconnect with the step folded into the context.
    Reconnected,
}

/// Counters for one session context. Reset by an explicit start, kept
/// across fallback reconnects.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub frames_sent: u64,
    /// Dropped by the half-duplex gate.
    pub frames_gated: u64,
    /// Dropped because the session was closing or gone.
    pub frames_dropped: u64,
    pub chunks_scheduled: u64,
    /// Dropped because they could not be decoded.
    pub chunks_dropped: u64,
    pub turns_completed: u64,
    pub interruptions: u64,
    pub fast_path_advances: u64,
    pub fallback_reconnects: u64,
}

/// Everything a UI needs to render the session.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub session_id: Option<String>,
    pub lifecycle: LifecycleState,
    pub is_live: bool,
    pub turn: TurnState,
    pub input_transcript: String,
    pub output_transcript: String,
    pub connection_error: Option<String>,
    pub language_warning: Option<String>,
    pub stats: SessionStats,
}

/// Asynchronous input applied by [`VoiceEngine::handle_input`].
#[derive(Debug)]
pub enum EngineInput {
    /// A capture block that passed the gate at capture time.
    Frame(AudioFrame),
    /// An inbound event from the link opened for `generation`.
    Link { generation: u64, event: VoiceEvent },
    /// The link opened for `generation` stopped producing events.
    LinkClosed { generation: u64 },
    /// The microphone started for `generation` could not be acquired.
    CaptureFailed { generation: u64, error: VoiceError },
    /// The language warning deadline passed.
    WarningExpired,
}

pub type OpenFuture = Pin<Box<dyn Future<Output = VoiceResult<OpenedLink>> + Send>>;

/// A link open in flight for `generation`.
pub struct PendingOpen {
    pub generation: u64,
    pub future: OpenFuture,
}

impl std::fmt::Debug for PendingOpen {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingOpen")
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

/// Decision taken by [`VoiceEngine::begin_advance`].
#[derive(Debug)]
pub enum AdvanceAction {
    Sent,
    Reconnect(PendingOpen),
}

struct SessionHandle {
    session_id: String,
    generation: u64,
    link: Box<dyn LiveLink>,
    opened_at: Instant,
}

enum FrameOutcome {
    Sent,
    Gated,
    Dropped,
}

// ── Engine ────────────────────────────────────────────────────────

pub struct VoiceEngine {
    config: Config,
    transport: Arc<dyn LiveTransport>,
    credentials: Arc<dyn CredentialSource>,
    capture: Box<dyn CaptureDevice>,
    gate: Arc<CaptureGate>,
    playback: PlaybackScheduler<Box<dyn AudioSink>>,
    transcripts: TranscriptAggregator,
    inbox: mpsc::UnboundedSender<EngineInput>,
    handle: Option<SessionHandle>,
    pending_session_id: Option<String>,
    lifecycle: LifecycleState,
    turn: TurnState,
    context: Option<SessionContext>,
    connection_error: Option<String>,
    generation: u64,
    stats: SessionStats,
}

impl VoiceEngine {
    /// Build an engine and the receiving end of its input queue.
    pub fn new(
        config: Config,
        transport: Arc<dyn LiveTransport>,
        credentials: Arc<dyn CredentialSource>,
        capture: Box<dyn CaptureDevice>,
        sink: Box<dyn AudioSink>,
    ) -> (Self, mpsc::UnboundedReceiver<EngineInput>) {
        let (inbox, inbox_rx) = mpsc::unbounded_channel();
        let engine = Self {
            playback: PlaybackScheduler::new(sink, config.playback.sample_rate),
            transcripts: TranscriptAggregator::new(config.transcript.clone()),
            config,
            transport,
            credentials,
            capture,
            gate: Arc::new(CaptureGate::new()),
            inbox,
            handle: None,
            pending_session_id: None,
            lifecycle: LifecycleState::Disconnected,
            turn: TurnState::Idle,
            context: None,
            connection_error: None,
            generation: 0,
            stats: SessionStats::default(),
        };
        (engine, inbox_rx)
    }

    /// Register a callback fired once per language warning.
    pub fn on_warning(&mut self, callback: impl Fn(&LanguageWarning) + Send + Sync + 'static) {
        self.transcripts.on_warning(callback);
    }

    // ── start / stop ──────────────────────────────────────────────

    /// Start a fresh session context: tears down any open session, resets
    /// transcripts and counters, and begins opening a link.
    pub fn begin_start(&mut self, context: SessionContext) -> PendingOpen {
        self.teardown("superseded by a new start");
        self.transcripts.reset();
        self.stats = SessionStats::default();
        self.gate.reset_counters();
        self.open_with(context)
    }

    /// Convenience for callers that can await the open inline.
    pub async fn start(&mut self, context: SessionContext) -> VoiceResult<()> {
        let pending = self.begin_start(context);
        let result = pending.future.await;
        self.finish_open(pending.generation, result)
    }

    /// Idempotent teardown. Transcripts and the last error stay readable.
    pub fn stop(&mut self) {
        self.teardown("stopped by caller");
    }

    fn open_with(&mut self, context: SessionContext) -> PendingOpen {
        self.teardown("reopening");

        self.generation += 1;
        let generation = self.generation;
        let session_id = Uuid::new_v4().to_string();

        self.context = Some(context.clone());
        self.connection_error = None;
        self.lifecycle = LifecycleState::Connecting;
        self.turn = TurnState::Idle;
        self.pending_session_id = Some(session_id.clone());

        tracing::info!(
            session_id = %session_id,
            generation = generation,
            step = context.current_step().unwrap_or("-"),
            "Opening voice session"
        );

        let transport = Arc::clone(&self.transport);
        let api_key = self.credentials.current();
        let future = Box::pin(async move {
            let api_key = api_key?;
            transport
                .open(LinkRequest {
                    session_id,
                    api_key,
                    context,
                })
                .await
        });

        PendingOpen { generation, future }
    }

    /// Apply the outcome of a [`PendingOpen`].
    pub fn finish_open(
        &mut self,
        generation: u64,
        result: VoiceResult<OpenedLink>,
    ) -> VoiceResult<()> {
        if generation != self.generation || self.lifecycle != LifecycleState::Connecting {
            if let Ok(opened) = result {
                tracing::debug!(
                    session_id = %opened.link.session_id(),
                    generation = generation,
                    "Closing link opened for a superseded session"
                );
                opened.link.close();
            }
            return Err(VoiceError::Connection(
                "session start was superseded".to_string(),
            ));
        }

        let OpenedLink { link, events } = match result {
            Ok(opened) => opened,
            Err(e) => {
                tracing::warn!(generation = generation, error = %e, "Voice session failed to open");
                self.fail(&e);
                return Err(e);
            }
        };

        let session_id = link.session_id().to_string();
        tokio::spawn(forward_events(events, self.inbox.clone(), generation));
        self.handle = Some(SessionHandle {
            session_id: session_id.clone(),
            generation,
            link,
            opened_at: Instant::now(),
        });
        self.pending_session_id = None;

        self.gate.open(generation);
        let sink = FrameSink::new(generation, Arc::clone(&self.gate), self.inbox.clone());
        if let Err(e) = self.capture.start(&self.config.capture, sink) {
            tracing::error!(session_id = %session_id, error = %e, "Microphone unavailable");
            self.fail(&e);
            return Err(e);
        }

        self.lifecycle = LifecycleState::Live;
        self.turn = TurnState::Idle;
        tracing::info!(session_id = %session_id, generation = generation, "Voice session live");
        Ok(())
    }

    /// Tear down, run the one-time credential reselection when the error
    /// calls for it, and surface the error.
    fn fail(&mut self, error: &VoiceError) {
        self.teardown("fatal error");
        if matches!(error, VoiceError::Credential(_)) {
            self.credentials.reselect();
        }
        self.connection_error = Some(error.to_string());
    }

    /// Ordered teardown: close the gate and stop capture, flush playback,
    /// end the audio stream and close the link, clear the handle last.
    fn teardown(&mut self, reason: &str) {
        if self.lifecycle == LifecycleState::Disconnected && self.handle.is_none() {
            return;
        }

        self.gate.close();
        self.capture.stop();
        self.playback.flush();

        if let Some(handle) = self.handle.as_ref() {
            if let Err(e) = handle.link.end_audio_stream() {
                tracing::debug!(session_id = %handle.session_id, error = %e, "audioStreamEnd not sent");
            }
            handle.link.close();
        }
        let handle = self.handle.take();

        self.gate.set_ai_speaking(false);
        self.lifecycle = LifecycleState::Disconnected;
        self.turn = TurnState::Idle;
        self.pending_session_id = None;

        let stats = self.stats();
        match handle {
            Some(handle) => tracing::info!(
                session_id = %handle.session_id,
                reason = reason,
                duration_secs = handle.opened_at.elapsed().as_secs(),
                frames_sent = stats.frames_sent,
                frames_gated = stats.frames_gated,
                chunks_scheduled = stats.chunks_scheduled,
                turns = stats.turns_completed,
                interruptions = stats.interruptions,
                "Voice session closed"
            ),
            None => tracing::info!(reason = reason, "Voice session open cancelled"),
        }
    }

    // ── advance ───────────────────────────────────────────────────

    /// Decide how to deliver the next scripted step.
    ///
    /// While live and listening the step goes out as a tagged text message
    /// on the open link. If that send fails, no session is open, or the
    /// tutor is mid-turn, the engine performs exactly one stop + start with
    /// the step folded into the session context. Transcripts are kept.
    pub fn begin_advance(&mut self, step: &str) -> VoiceResult<AdvanceAction> {
        let context = self.context.as_ref().ok_or(VoiceError::NoContext)?;
        let next_context = context.with_step(step);

        let listening = self.lifecycle == LifecycleState::Live && self.turn != TurnState::AiTurn;
        if let Some(handle) = self.handle.as_ref().filter(|_| listening) {
            match handle.link.send_text(tag_step_instruction(step)) {
                Ok(()) => {
                    tracing::info!(session_id = %handle.session_id, "Advanced step on open link");
                    self.context = Some(next_context);
                    self.stats.fast_path_advances += 1;
                    return Ok(AdvanceAction::Sent);
                }
                Err(e) => tracing::warn!(
                    session_id = %handle.session_id,
                    error = %e,
                    "Step message not sent, reconnecting"
                ),
            }
        } else {
            tracing::info!(
                lifecycle = ?self.lifecycle,
                turn = ?self.turn,
                "No listening session, reconnecting for next step"
            );
        }

        self.stats.fallback_reconnects += 1;
        self.teardown("reconnecting for next step");
        Ok(AdvanceAction::Reconnect(self.open_with(next_context)))
    }

    pub async fn advance(&mut self, step: &str) -> VoiceResult<AdvancePath> {
        match self.begin_advance(step)? {
            AdvanceAction::Sent => Ok(AdvancePath::FastPath),
            AdvanceAction::Reconnect(pending) => {
                let result = pending.future.await;
                self.finish_open(pending.generation, result)?;
                Ok(AdvancePath::Reconnected)
            }
        }
    }

    // ── inputs ────────────────────────────────────────────────────

    pub fn handle_input(&mut self, input: EngineInput) {
        match input {
            EngineInput::Frame(frame) => self.on_frame(frame),
            EngineInput::Link { generation, event } => {
                if self.is_current(generation) {
                    self.on_link_event(event);
                } else {
                    tracing::trace!(generation = generation, "Ignoring event from stale link");
                }
            }
            EngineInput::LinkClosed { generation } => {
                if self.is_current(generation) {
                    tracing::warn!(generation = generation, "Voice link closed by remote");
                    self.fail(&VoiceError::Connection(
                        "connection closed by the remote endpoint".to_string(),
                    ));
                }
            }
            EngineInput::CaptureFailed { generation, error } => {
                if self.is_current(generation) {
                    tracing::error!(generation = generation, error = %error, "Microphone unavailable");
                    self.fail(&error);
                }
            }
            EngineInput::WarningExpired => {
                self.transcripts.expire_warning(Instant::now());
            }
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.handle
            .as_ref()
            .is_some_and(|h| h.generation == generation)
    }

    fn on_frame(&mut self, frame: AudioFrame) {
        let outcome = match self.handle.as_ref() {
            Some(handle) if handle.generation == frame.generation && !self.gate.is_closing() => {
                if self.turn == TurnState::AiTurn {
                    FrameOutcome::Gated
                } else {
                    match handle.link.send_audio(frame.pcm) {
                        Ok(()) => FrameOutcome::Sent,
                        Err(e) => {
                            tracing::debug!(session_id = %handle.session_id, error = %e, "Frame send failed, dropping");
                            FrameOutcome::Dropped
                        }
                    }
                }
            }
            _ => FrameOutcome::Dropped,
        };

        match outcome {
            FrameOutcome::Sent => self.stats.frames_sent += 1,
            FrameOutcome::Gated => self.stats.frames_gated += 1,
            FrameOutcome::Dropped => self.stats.frames_dropped += 1,
        }
    }

    fn on_link_event(&mut self, event: VoiceEvent) {
        match event {
            VoiceEvent::SetupComplete => {}
            VoiceEvent::Audio { data } => {
                if self.turn != TurnState::AiTurn {
                    self.turn = TurnState::AiTurn;
                    self.gate.set_ai_speaking(true);
                }
                match self.playback.schedule(&data) {
                    Some(_) => self.stats.chunks_scheduled += 1,
                    None => self.stats.chunks_dropped += 1,
                }
            }
            VoiceEvent::InputTranscript { text } => {
                let verdict = self.transcripts.append_input(&text, Instant::now());
                if verdict == FragmentVerdict::Accepted
                    && !text.trim().is_empty()
                    && matches!(self.turn, TurnState::Idle | TurnState::Interrupted)
                {
                    self.turn = TurnState::UserTurn;
                }
            }
            VoiceEvent::OutputTranscript { text } => {
                self.transcripts.append_output(&text);
            }
            VoiceEvent::TurnComplete => {
                self.turn = TurnState::Idle;
                self.gate.set_ai_speaking(false);
                self.stats.turns_completed += 1;
            }
            VoiceEvent::Interrupted => {
                self.playback.flush();
                self.gate.set_ai_speaking(false);
                self.turn = TurnState::Interrupted;
                self.stats.interruptions += 1;
            }
            VoiceEvent::GoAway { time_left } => {
                tracing::warn!(time_left = ?time_left, "Endpoint will close the session soon");
            }
            VoiceEvent::Error { message } => {
                let error = VoiceError::from_remote(message);
                tracing::warn!(error = %error, "Voice link reported an error");
                self.fail(&error);
            }
        }
    }

    // ── accessors ─────────────────────────────────────────────────

    pub fn lifecycle(&self) -> LifecycleState {
        self.lifecycle
    }

    pub fn turn(&self) -> TurnState {
        self.turn
    }

    pub fn is_live(&self) -> bool {
        self.lifecycle == LifecycleState::Live
    }

    pub fn connection_error(&self) -> Option<&str> {
        self.connection_error.as_deref()
    }

    pub fn context(&self) -> Option<&SessionContext> {
        self.context.as_ref()
    }

    pub fn session_id(&self) -> Option<&str> {
        self.handle
            .as_ref()
            .map(|h| h.session_id.as_str())
            .or(self.pending_session_id.as_deref())
    }

    pub fn input_transcript(&self) -> &str {
        self.transcripts.input_transcript()
    }

    pub fn output_transcript(&self) -> &str {
        self.transcripts.output_transcript()
    }

    pub fn warning_deadline(&self) -> Option<Instant> {
        self.transcripts.warning_deadline()
    }

    pub fn capture_gate(&self) -> &Arc<CaptureGate> {
        &self.gate
    }

    pub fn playback(&self) -> &PlaybackScheduler<Box<dyn AudioSink>> {
        &self.playback
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            frames_gated: self.stats.frames_gated + self.gate.gated_count(),
            frames_dropped: self.stats.frames_dropped + self.gate.dropped_count(),
            ..self.stats.clone()
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.session_id().map(str::to_string),
            lifecycle: self.lifecycle,
            is_live: self.is_live(),
            turn: self.turn,
            input_transcript: self.transcripts.input_transcript().to_string(),
            output_transcript: self.transcripts.output_transcript().to_string(),
            connection_error: self.connection_error.clone(),
            language_warning: self
                .transcripts
                .active_warning(Instant::now())
                .map(|w| w.message.clone()),
            stats: self.stats(),
        }
    }
}

/// Relay link events into the engine queue, then report the close.
async fn forward_events(
    mut events: mpsc::Receiver<VoiceEvent>,
    inbox: mpsc::UnboundedSender<EngineInput>,
    generation: u64,
) {
    while let Some(event) = events.recv().await {
        if inbox.send(EngineInput::Link { generation, event }).is_err() {
            return;
        }
    }
    let _ = inbox.send(EngineInput::LinkClosed { generation });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::voice::testing::{chunk_of, Harness};
    use crate::voice::transcript::NON_ENGLISH_WARNING;
    use crate::voice::persona::STEP_INSTRUCTION_TAG;

    fn context() -> SessionContext {
        SessionContext::new("You are Sam, a barista taking coffee orders.")
    }

    async fn live_harness() -> Harness {
        let mut h = Harness::new();
        h.engine.start(context()).await.unwrap();
        h
    }

    #[tokio::test]
    async fn start_opens_link_and_goes_live() {
        let h = live_harness().await;
        assert_eq!(h.engine.lifecycle(), LifecycleState::Live);
        assert_eq!(h.engine.turn(), TurnState::Idle);
        assert!(h.fakes.capture.is_running());

        let requests = h.fakes.transport.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].api_key, "test-key");
        assert_eq!(requests[0].context, context());

        let snapshot = h.engine.snapshot();
        assert!(snapshot.is_live);
        assert_eq!(snapshot.session_id.as_deref(), Some(requests[0].session_id.as_str()));
        assert!(snapshot.connection_error.is_none());
    }

    #[tokio::test]
    async fn frames_flow_while_listening() {
        let mut h = live_harness().await;
        assert!(h.emit_frame());
        assert!(h.emit_frame());
        assert_eq!(h.fakes.transport.last_link().audio_frames(), 2);
        assert_eq!(h.engine.stats().frames_sent, 2);
    }

    #[tokio::test]
    async fn half_duplex_gate_blocks_frames_during_ai_turn() {
        let mut h = live_harness().await;
        let link = h.fakes.transport.last_link();

        h.deliver(VoiceEvent::Audio { data: chunk_of(2400) }).await;
        assert_eq!(h.engine.turn(), TurnState::AiTurn);

        for _ in 0..5 {
            h.emit_frame();
        }
        assert_eq!(link.audio_frames(), 0);
        assert_eq!(h.engine.stats().frames_gated, 5);

        h.deliver(VoiceEvent::TurnComplete).await;
        assert_eq!(h.engine.turn(), TurnState::Idle);
        assert!(h.emit_frame());
        assert_eq!(link.audio_frames(), 1);
        assert_eq!(h.engine.stats().turns_completed, 1);
    }

    #[tokio::test]
    async fn frame_queued_before_ai_turn_is_gated_by_engine() {
        let mut h = live_harness().await;
        // Passed the capture-side gate while listening, processed after the
        // tutor started speaking.
        assert!(h.fakes.capture.emit(&[0.1; 16]));
        let generation = h.engine.capture_gate().generation();
        h.engine.handle_input(EngineInput::Link {
            generation,
            event: VoiceEvent::Audio { data: chunk_of(240) },
        });
        h.drain();
        assert_eq!(h.fakes.transport.last_link().audio_frames(), 0);
        assert_eq!(h.engine.stats().frames_gated, 1);
    }

    #[tokio::test]
    async fn inbound_chunks_play_gaplessly() {
        let mut h = live_harness().await;
        h.fakes.sink.set_now(2.0);
        for samples in [2400, 4800, 1200] {
            h.deliver(VoiceEvent::Audio { data: chunk_of(samples) }).await;
        }
        let starts = h.fakes.sink.start_times();
        assert_eq!(starts.len(), 3);
        assert!((starts[0] - 2.0).abs() < 1e-9);
        assert!((starts[1] - 2.1).abs() < 1e-9);
        assert!((starts[2] - 2.3).abs() < 1e-9);
        assert_eq!(h.engine.stats().chunks_scheduled, 3);
    }

    #[tokio::test]
    async fn interruption_flushes_playback() {
        let mut h = live_harness().await;
        for _ in 0..3 {
            h.deliver(VoiceEvent::Audio { data: chunk_of(2400) }).await;
        }
        assert_eq!(h.fakes.sink.active_sources(), 3);

        h.deliver(VoiceEvent::Interrupted).await;
        assert_eq!(h.engine.turn(), TurnState::Interrupted);
        assert_eq!(h.engine.playback().active_count(), 0);
        assert_eq!(h.engine.playback().cursor(), 0.0);
        assert_eq!(h.fakes.sink.active_sources(), 0);
        assert!(!h.engine.capture_gate().is_ai_speaking());
        assert_eq!(h.engine.stats().interruptions, 1);

        assert!(h.emit_frame());
        assert_eq!(h.fakes.transport.last_link().audio_frames(), 1);
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let mut h = live_harness().await;
        let link = h.fakes.transport.last_link();

        h.engine.stop();
        let once = h.engine.snapshot();
        h.engine.stop();
        let twice = h.engine.snapshot();

        assert_eq!(once, twice);
        assert!(!twice.is_live);
        assert_eq!(twice.lifecycle, LifecycleState::Disconnected);
        assert_eq!(twice.turn, TurnState::Idle);
        assert!(link.is_closed());
        assert!(link.stream_ended());
        assert!(!h.fakes.capture.is_running());
        assert_eq!(h.fakes.capture.stops(), 1);
    }

    #[tokio::test]
    async fn stop_without_session_is_noop() {
        let mut h = Harness::new();
        h.engine.stop();
        h.engine.stop();
        assert_eq!(h.engine.lifecycle(), LifecycleState::Disconnected);
        assert_eq!(h.fakes.capture.stops(), 0);
    }

    #[tokio::test]
    async fn language_gate_drops_non_english_input() {
        let mut h = live_harness().await;
        h.deliver(VoiceEvent::InputTranscript { text: "hola amigo".into() }).await;
        let snapshot = h.engine.snapshot();
        assert_eq!(snapshot.input_transcript, "");
        assert_eq!(snapshot.language_warning.as_deref(), Some(NON_ENGLISH_WARNING));
        assert_eq!(snapshot.turn, TurnState::Idle);

        h.deliver(VoiceEvent::InputTranscript {
            text: "I am going to the store".into(),
        })
        .await;
        assert_eq!(h.engine.input_transcript(), "I am going to the store");
        assert_eq!(h.engine.turn(), TurnState::UserTurn);
    }

    #[tokio::test]
    async fn output_transcript_accumulates() {
        let mut h = live_harness().await;
        h.deliver(VoiceEvent::OutputTranscript { text: "What can I ".into() }).await;
        h.deliver(VoiceEvent::OutputTranscript { text: "get you?".into() }).await;
        assert_eq!(h.engine.output_transcript(), "What can I get you?");
    }

    #[tokio::test]
    async fn advance_uses_fast_path_on_listening_session() {
        let mut h = live_harness().await;
        let path = h.engine.advance("Ask about milk preference").await.unwrap();
        assert_eq!(path, AdvancePath::FastPath);

        let link = h.fakes.transport.last_link();
        let texts = link.texts();
        assert_eq!(texts.len(), 1);
        assert!(texts[0].starts_with(STEP_INSTRUCTION_TAG));
        assert!(texts[0].ends_with("Ask about milk preference"));
        assert!(!link.is_closed());
        assert_eq!(h.fakes.transport.open_count(), 1);
        assert_eq!(
            h.engine.context().and_then(|c| c.current_step()),
            Some("Ask about milk preference")
        );
        assert_eq!(h.engine.stats().fast_path_advances, 1);
    }

    #[tokio::test]
    async fn advance_falls_back_to_one_reconnect_on_send_failure() {
        let mut h = live_harness().await;
        h.deliver(VoiceEvent::InputTranscript { text: "I like tea".into() }).await;
        let first = h.fakes.transport.last_link();
        first.fail_text_sends();

        let path = h.engine.advance("Question 2").await.unwrap();
        assert_eq!(path, AdvancePath::Reconnected);

        assert_eq!(h.fakes.transport.open_count(), 2);
        assert!(first.is_closed());
        assert_eq!(h.fakes.transport.open_links(), 1);
        let requests = h.fakes.transport.requests();
        assert_eq!(requests[1].context.current_step(), Some("Question 2"));
        assert!(h.engine.is_live());
        assert_eq!(h.engine.stats().fallback_reconnects, 1);
        // Same session context, so the learner's transcript survives.
        assert_eq!(h.engine.input_transcript(), "I like tea");
    }

    #[tokio::test]
    async fn advance_during_ai_turn_reconnects() {
        let mut h = live_harness().await;
        h.deliver(VoiceEvent::Audio { data: chunk_of(2400) }).await;
        let path = h.engine.advance("Question 2").await.unwrap();
        assert_eq!(path, AdvancePath::Reconnected);
        assert!(h.fakes.transport.requests()[0].context.steps.is_empty());
        assert_eq!(h.fakes.transport.open_links(), 1);
        assert_eq!(h.engine.turn(), TurnState::Idle);
    }

    #[tokio::test]
    async fn advance_after_stop_reconnects_with_step() {
        let mut h = live_harness().await;
        h.engine.stop();
        let path = h.engine.advance("Question 3").await.unwrap();
        assert_eq!(path, AdvancePath::Reconnected);
        assert!(h.engine.is_live());
        assert_eq!(h.fakes.transport.open_links(), 1);
    }

    #[tokio::test]
    async fn advance_without_context_fails() {
        let mut h = Harness::new();
        assert!(matches!(
            h.engine.advance("Question 1").await,
            Err(VoiceError::NoContext)
        ));
        assert_eq!(h.fakes.transport.open_count(), 0);
    }

    #[tokio::test]
    async fn reconnect_failure_surfaces_once() {
        let mut h = live_harness().await;
        h.fakes.transport.last_link().fail_text_sends();
        h.fakes
            .transport
            .fail_next(VoiceError::Connection("network unreachable".into()));

        let result = h.engine.advance("Question 2").await;
        assert!(matches!(result, Err(VoiceError::Connection(_))));
        assert_eq!(h.fakes.transport.open_count(), 2);
        assert_eq!(h.fakes.transport.open_links(), 0);
        assert!(h.engine.connection_error().unwrap().contains("network unreachable"));
    }

    #[tokio::test]
    async fn late_capture_callback_during_teardown_is_swallowed() {
        let mut h = live_harness().await;
        h.fakes.capture.emit_during_stop();
        h.engine.stop();
        h.drain();

        assert_eq!(h.fakes.capture.emitted_during_stop(), vec![false]);
        assert_eq!(h.fakes.transport.last_link().audio_frames(), 0);
        assert!(h.engine.stats().frames_dropped >= 1);
    }

    #[tokio::test]
    async fn frame_queued_before_stop_is_not_sent() {
        let mut h = live_harness().await;
        assert!(h.fakes.capture.emit(&[0.1; 16]));
        h.engine.stop();
        h.drain();
        assert_eq!(h.fakes.transport.last_link().audio_frames(), 0);
        assert_eq!(h.engine.stats().frames_dropped, 1);
    }

    #[tokio::test]
    async fn credential_error_on_open_reselects_once() {
        let mut h = Harness::new();
        h.fakes
            .transport
            .fail_next(VoiceError::Credential("Requested entity was not found.".into()));

        let result = h.engine.start(context()).await;
        assert!(matches!(result, Err(VoiceError::Credential(_))));
        assert_eq!(h.fakes.credentials.reselects(), 1);
        assert_eq!(h.engine.lifecycle(), LifecycleState::Disconnected);
        assert!(h
            .engine
            .connection_error()
            .unwrap()
            .contains("Requested entity was not found"));
    }

    #[tokio::test]
    async fn credential_error_from_link_reselects_and_disconnects() {
        let mut h = live_harness().await;
        let link = h.fakes.transport.last_link();
        h.deliver(VoiceEvent::Error {
            message: "Requested entity was not found.".into(),
        })
        .await;

        assert_eq!(h.fakes.credentials.reselects(), 1);
        assert_eq!(h.engine.lifecycle(), LifecycleState::Disconnected);
        assert!(link.is_closed());
        assert!(h.engine.connection_error().is_some());
    }

    #[tokio::test]
    async fn generic_error_does_not_reselect() {
        let mut h = live_harness().await;
        h.deliver(VoiceEvent::Error {
            message: "Internal error".into(),
        })
        .await;
        assert_eq!(h.fakes.credentials.reselects(), 0);
        assert_eq!(h.engine.lifecycle(), LifecycleState::Disconnected);
        assert!(h.engine.connection_error().unwrap().contains("Internal error"));
    }

    #[tokio::test]
    async fn remote_close_disconnects() {
        let mut h = live_harness().await;
        h.fakes.transport.last_link().hang_up();
        h.next_input().await;
        assert_eq!(h.engine.lifecycle(), LifecycleState::Disconnected);
        assert!(h.engine.connection_error().unwrap().contains("closed"));
        assert!(!h.fakes.capture.is_running());
    }

    #[tokio::test]
    async fn device_error_leaves_turn_idle() {
        let mut h = Harness::new();
        h.fakes.capture.fail_next_start("permission denied");

        let result = h.engine.start(context()).await;
        assert!(matches!(result, Err(VoiceError::Device(_))));
        assert_eq!(h.engine.lifecycle(), LifecycleState::Disconnected);
        assert_eq!(h.engine.turn(), TurnState::Idle);
        assert!(h.fakes.transport.last_link().is_closed());
        assert!(h.engine.connection_error().unwrap().contains("permission denied"));
        assert_eq!(h.fakes.credentials.reselects(), 0);
    }

    #[tokio::test]
    async fn late_capture_failure_ends_session() {
        let mut h = live_harness().await;
        assert!(h.fakes.capture.fail_late("device busy"));

        h.next_input().await;
        assert_eq!(h.engine.lifecycle(), LifecycleState::Disconnected);
        assert_eq!(h.engine.turn(), TurnState::Idle);
        assert!(h.fakes.transport.last_link().is_closed());
        assert!(h.engine.connection_error().unwrap().contains("device busy"));
        assert!(!h.fakes.capture.is_running());
    }

    #[tokio::test]
    async fn capture_failure_from_replaced_session_is_ignored() {
        let mut h = live_harness().await;
        h.engine.handle_input(EngineInput::CaptureFailed {
            generation: 0,
            error: VoiceError::Device("old stream".into()),
        });
        assert!(h.engine.is_live());
        assert!(h.engine.connection_error().is_none());
    }

    #[tokio::test]
    async fn new_start_replaces_previous_session() {
        let mut h = live_harness().await;
        h.deliver(VoiceEvent::InputTranscript { text: "I like tea".into() }).await;
        let first = h.fakes.transport.last_link();

        h.engine.start(context()).await.unwrap();
        assert!(first.is_closed());
        assert_eq!(h.fakes.transport.open_links(), 1);
        assert_eq!(h.engine.input_transcript(), "");

        // Late event from the replaced link.
        h.engine.handle_input(EngineInput::Link {
            generation: 1,
            event: VoiceEvent::Audio { data: chunk_of(240) },
        });
        assert_eq!(h.engine.turn(), TurnState::Idle);
        assert_eq!(h.engine.stats().chunks_scheduled, 0);
    }

    #[tokio::test]
    async fn open_completing_after_stop_is_discarded() {
        let mut h = Harness::new();
        let pending = h.engine.begin_start(context());
        assert_eq!(h.engine.lifecycle(), LifecycleState::Connecting);
        h.engine.stop();

        let result = pending.future.await;
        assert!(h.engine.finish_open(pending.generation, result).is_err());
        assert!(h.fakes.transport.last_link().is_closed());
        assert_eq!(h.engine.lifecycle(), LifecycleState::Disconnected);
        assert!(!h.fakes.capture.is_running());
    }

    #[tokio::test]
    async fn undecodable_chunk_is_dropped() {
        let mut h = live_harness().await;
        h.deliver(VoiceEvent::Audio { data: vec![1, 2, 3] }).await;
        assert!(h.engine.is_live());
        assert_eq!(h.engine.stats().chunks_dropped, 1);
        assert_eq!(h.engine.stats().chunks_scheduled, 0);
    }

    #[tokio::test]
    async fn missing_api_key_is_config_error() {
        let mut h = Harness::with_credentials(Arc::new(crate::voice::KeyRing::new(Vec::new())));
        let result = h.engine.start(context()).await;
        assert!(matches!(result, Err(VoiceError::Config(_))));
        assert_eq!(h.fakes.transport.open_count(), 0);
        assert!(h.engine.connection_error().is_some());
    }
}

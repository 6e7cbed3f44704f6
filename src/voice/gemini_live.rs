//! Gemini Live WebSocket client for real-time tutoring sessions.
//!
//! Implements the bidirectional streaming protocol of Google's Gemini Live
//! API (BidiGenerateContent).
//!
//! ## Protocol Overview
//!
//! 1. **Connect**: open WebSocket to the configured endpoint
//! 2. **Setup**: send model, voice, system instruction, transcript flags
//!    and VAD settings, then wait for `setupComplete`
//! 3. **Stream**: send learner audio as `realtimeInput`, receive tutor
//!    audio and transcripts as `serverContent`
//! 4. **Close**: send `audioStreamEnd`, then close the WebSocket
//!
//! ## Binary Frame Protocol
//!
//! Gemini Live sends JSON control messages (including `setupComplete`) as
//! WebSocket Binary frames. A Binary frame whose payload starts with `{` is
//! parsed as a server message; any other Binary payload is logged and
//! skipped.

use base64::Engine;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::error::{VoiceError, VoiceResult};
use super::persona::SessionContext;
use super::VoiceEvent;
use crate::config::LiveConfig;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

// ── Constants ──────────────────────────────────────────────────────

/// Audio MIME type for learner input (16kHz PCM mono).
pub const INPUT_AUDIO_MIME: &str = "audio/pcm;rate=16000";

// ── VAD Configuration ──────────────────────────────────────────────

/// Start-of-speech detection sensitivity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VadSensitivity {
    #[serde(rename = "START_SENSITIVITY_HIGH")]
    High,
    #[serde(rename = "START_SENSITIVITY_LOW")]
    Low,
}

/// End-of-speech detection sensitivity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndSensitivity {
    #[serde(rename = "END_SENSITIVITY_HIGH")]
    High,
    #[serde(rename = "END_SENSITIVITY_LOW")]
    Low,
}

/// Automatic Activity Detection settings sent in `realtimeInputConfig`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VadConfig {
    /// `false` lets the endpoint decide when the learner starts and stops.
    pub disabled: bool,
    #[serde(rename = "startOfSpeechSensitivity")]
    pub start_sensitivity: VadSensitivity,
    #[serde(rename = "endOfSpeechSensitivity")]
    pub end_sensitivity: EndSensitivity,
    /// Audio kept from before detected speech start.
    pub prefix_padding_ms: u32,
    /// Silence required before the learner's turn is considered over.
    /// Learners pause mid-sentence, so this is longer than for fluent
    /// speakers.
    pub silence_duration_ms: u32,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            disabled: false,
            start_sensitivity: VadSensitivity::High,
            end_sensitivity: EndSensitivity::Low,
            prefix_padding_ms: 200,
            silence_duration_ms: 800,
        }
    }
}

impl VadConfig {
    pub fn from_live(live: &LiveConfig) -> Self {
        Self {
            disabled: !live.automatic_activity_detection,
            ..Self::default()
        }
    }
}

// ── Setup message (JSON sent as first frame) ───────────────────────

#[derive(Debug, Serialize)]
pub struct SetupMessage {
    pub setup: SetupPayload,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupPayload {
    pub model: String,
    pub generation_config: GenerationConfig,
    pub system_instruction: SystemInstruction,
    pub realtime_input_config: RealtimeInputConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_transcription: Option<AudioTranscriptionConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_audio_transcription: Option<AudioTranscriptionConfig>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<String>,
    pub speech_config: SpeechConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

#[derive(Debug, Serialize)]
pub struct SystemInstruction {
    pub parts: Vec<TextPart>,
}

#[derive(Debug, Serialize)]
pub struct TextPart {
    pub text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInputConfig {
    pub automatic_activity_detection: VadConfig,
}

/// Presence of this (empty) object enables transcript echo.
#[derive(Debug, Default, Serialize)]
pub struct AudioTranscriptionConfig {}

/// Build the setup message for one tutoring session.
pub fn build_setup_message(context: &SessionContext, live: &LiveConfig) -> SetupMessage {
    let voice_name = context
        .voice_id
        .clone()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| live.default_voice.clone());
    let input_audio_transcription = context
        .transcripts_enabled
        .then(AudioTranscriptionConfig::default);
    let output_audio_transcription = context
        .transcripts_enabled
        .then(AudioTranscriptionConfig::default);

    SetupMessage {
        setup: SetupPayload {
            model: format!("models/{}", live.model),
            generation_config: GenerationConfig {
                response_modalities: vec!["AUDIO".to_string()],
                speech_config: SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig { voice_name },
                    },
                },
            },
            system_instruction: SystemInstruction {
                parts: vec![TextPart {
                    text: context.build_system_instruction(),
                }],
            },
            realtime_input_config: RealtimeInputConfig {
                automatic_activity_detection: VadConfig::from_live(live),
            },
            input_audio_transcription,
            output_audio_transcription,
        },
    }
}

// ── Client messages ────────────────────────────────────────────────

/// Wire format: `{"realtimeInput": {"mediaChunks": [{"mimeType": "audio/pcm;rate=16000", "data": "<base64>"}]}}`
///
/// `mediaChunks` is what the official SDKs still put on the wire; the newer
/// `audio` field is not reliably processed.
#[derive(Debug, Serialize)]
pub struct RealtimeInputMessage {
    #[serde(rename = "realtimeInput")]
    pub realtime_input: RealtimeInput,
}

#[derive(Debug, Serialize)]
pub struct RealtimeInput {
    #[serde(rename = "mediaChunks")]
    pub media_chunks: Vec<MediaChunk>,
}

#[derive(Debug, Serialize)]
pub struct MediaChunk {
    #[serde(rename = "mimeType")]
    pub mime_type: String,
    /// Base64-encoded PCM16LE.
    pub data: String,
}

pub fn build_audio_message(pcm_data: &[u8]) -> RealtimeInputMessage {
    RealtimeInputMessage {
        realtime_input: RealtimeInput {
            media_chunks: vec![MediaChunk {
                mime_type: INPUT_AUDIO_MIME.to_string(),
                data: base64::engine::general_purpose::STANDARD.encode(pcm_data),
            }],
        },
    }
}

/// A complete user turn carrying a text control message.
pub fn build_text_message(text: &str) -> serde_json::Value {
    serde_json::json!({
        "clientContent": {
            "turns": [{
                "role": "user",
                "parts": [{ "text": text }]
            }],
            "turnComplete": true,
        }
    })
}

/// Tell the endpoint the microphone is closed so it flushes buffered input.
pub fn build_audio_stream_end_message() -> serde_json::Value {
    serde_json::json!({
        "realtimeInput": {
            "audioStreamEnd": true
        }
    })
}

// ── Server messages ────────────────────────────────────────────────

/// Parse one JSON server message into events.
///
/// A single message can carry several events (audio plus transcription,
/// or the last audio chunk plus `turnComplete`). Audio and transcripts are
/// emitted before turn boundaries so that a chunk arriving with
/// `turnComplete` still belongs to the turn it ends.
pub fn parse_server_message(json_text: &str) -> Vec<VoiceEvent> {
    let mut events = Vec::new();

    let value: serde_json::Value = match serde_json::from_str(json_text) {
        Ok(v) => v,
        Err(e) => {
            events.push(VoiceEvent::Error {
                message: format!("Failed to parse server message: {e}"),
            });
            return events;
        }
    };

    if value.get("setupComplete").is_some() {
        events.push(VoiceEvent::SetupComplete);
    }

    let content = value.get("serverContent");
    if let Some(parts) = content
        .and_then(|c| c.pointer("/modelTurn/parts"))
        .and_then(|v| v.as_array())
    {
        for part in parts {
            if let Some(data_b64) = part.pointer("/inlineData/data").and_then(|v| v.as_str()) {
                match base64::engine::general_purpose::STANDARD.decode(data_b64) {
                    Ok(data) => events.push(VoiceEvent::Audio { data }),
                    Err(e) => tracing::debug!(error = %e, "Skipping undecodable inlineData"),
                }
            }
            // Thought parts are model reasoning, not speech.
            let is_thought = part.get("thought").and_then(|v| v.as_bool()) == Some(true);
            if let Some(text) = part.get("text").and_then(|v| v.as_str()) {
                if !is_thought && !text.is_empty() {
                    events.push(VoiceEvent::OutputTranscript {
                        text: text.to_string(),
                    });
                }
            }
        }
    }

    // Transcriptions arrive either inside serverContent or at the top level
    // depending on API revision.
    for (key, input) in [("inputTranscription", true), ("outputTranscription", false)] {
        let text = content
            .and_then(|c| c.get(key))
            .or_else(|| value.get(key))
            .and_then(|t| t.get("text"))
            .and_then(|v| v.as_str());
        if let Some(text) = text.filter(|t| !t.is_empty()) {
            let text = text.to_string();
            events.push(if input {
                VoiceEvent::InputTranscript { text }
            } else {
                VoiceEvent::OutputTranscript { text }
            });
        }
    }

    if let Some(content) = content {
        if content.get("interrupted").and_then(|v| v.as_bool()) == Some(true) {
            events.push(VoiceEvent::Interrupted);
        }
        if content.get("turnComplete").and_then(|v| v.as_bool()) == Some(true) {
            events.push(VoiceEvent::TurnComplete);
        }
    }

    if let Some(go_away) = value.get("goAway") {
        events.push(VoiceEvent::GoAway {
            time_left: go_away
                .get("timeLeft")
                .and_then(|v| v.as_str())
                .map(str::to_string),
        });
    }

    if let Some(err) = value.get("error") {
        let message = err
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or("Unknown server error");
        events.push(VoiceEvent::Error {
            message: message.to_string(),
        });
    }

    events
}

/// JSON text carried by a frame, for both Text and JSON-in-Binary frames.
fn frame_json(msg: &WsMessage) -> Option<&str> {
    match msg {
        WsMessage::Text(text) => Some(text.as_str()),
        WsMessage::Binary(data) if data.first() == Some(&b'{') => std::str::from_utf8(data).ok(),
        _ => None,
    }
}

/// Error reason carried by a close frame, if the close was not a normal one.
fn close_error(frame: Option<&CloseFrame>) -> Option<String> {
    let frame = frame?;
    let reason = frame.reason.as_str().trim();
    if frame.code == CloseCode::Normal && reason.is_empty() {
        return None;
    }
    if reason.is_empty() {
        Some(format!("connection closed with code {}", u16::from(frame.code)))
    } else {
        Some(reason.to_string())
    }
}

// ── Live session (WebSocket connection manager) ────────────────────

/// Outbound message queued for the WebSocket writer.
#[derive(Debug)]
pub enum OutboundMessage {
    /// Raw PCM16 bytes (wrapped in realtimeInput).
    Audio(Vec<u8>),
    /// Text control message (wrapped in clientContent).
    Text(String),
    /// Microphone stopped.
    AudioStreamEnd,
    Close,
}

/// A handle for one open Gemini Live session.
///
/// Created by [`GeminiLiveSession::connect`]. Sends never block: they are
/// queued with `try_send` and fail once the writer has stopped.
pub struct GeminiLiveSession {
    outbound_tx: mpsc::Sender<OutboundMessage>,
    event_rx: Option<mpsc::Receiver<VoiceEvent>>,
    session_id: String,
}

impl GeminiLiveSession {
    /// Connect, send the setup message and wait for `setupComplete`.
    pub async fn connect(
        session_id: String,
        api_key: &str,
        context: &SessionContext,
        live: &LiveConfig,
    ) -> VoiceResult<Self> {
        let url = format!("{}?key={api_key}", live.endpoint);

        tracing::info!(
            session_id = %session_id,
            model = %live.model,
            voice = context.voice_id.as_deref().unwrap_or(&live.default_voice),
            transcripts = context.transcripts_enabled,
            "Connecting to Gemini Live"
        );

        let (mut ws_stream, _response) = tokio_tungstenite::connect_async(&url)
            .await
            .map_err(|e| VoiceError::from_remote(format!("Failed to connect to Gemini Live: {e}")))?;

        let setup_json = serde_json::to_string(&build_setup_message(context, live))
            .map_err(|e| VoiceError::Connection(format!("Failed to encode setup message: {e}")))?;
        tracing::debug!(session_id = %session_id, setup = %setup_json, "Sending Gemini Live setup");
        ws_stream
            .send(WsMessage::Text(setup_json.into()))
            .await
            .map_err(|e| VoiceError::Connection(format!("Failed to send setup message: {e}")))?;

        let handshake = await_setup_complete(&mut ws_stream, &session_id);
        match live.setup_timeout_secs {
            Some(secs) => tokio::time::timeout(Duration::from_secs(secs), handshake)
                .await
                .map_err(|_| {
                    VoiceError::Connection(format!("Gemini Live setupComplete timeout ({secs}s)"))
                })??,
            None => handshake.await?,
        }

        let (ws_sender, ws_receiver) = ws_stream.split();
        let (outbound_tx, outbound_rx) = mpsc::channel(live.channel_capacity);
        let (event_tx, event_rx) = mpsc::channel(live.channel_capacity);

        tokio::spawn(outbound_loop(outbound_rx, ws_sender, session_id.clone()));
        tokio::spawn(inbound_loop(ws_receiver, event_tx, session_id.clone()));

        Ok(Self {
            outbound_tx,
            event_rx: Some(event_rx),
            session_id,
        })
    }

    /// Take the inbound event receiver. Returns `None` after the first call.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<VoiceEvent>> {
        self.event_rx.take()
    }

    pub fn try_send_audio(&self, pcm: Vec<u8>) -> VoiceResult<()> {
        if pcm.is_empty() {
            return Ok(());
        }
        self.queue(OutboundMessage::Audio(pcm))
    }

    pub fn try_send_text(&self, text: String) -> VoiceResult<()> {
        self.queue(OutboundMessage::Text(text))
    }

    pub fn try_send_audio_stream_end(&self) -> VoiceResult<()> {
        self.queue(OutboundMessage::AudioStreamEnd)
    }

    /// Ask the writer to close the WebSocket.
    pub fn close(&self) {
        if let Err(e) = self.queue(OutboundMessage::Close) {
            tracing::debug!(session_id = %self.session_id, error = %e, "Close on finished session");
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    fn queue(&self, msg: OutboundMessage) -> VoiceResult<()> {
        self.outbound_tx
            .try_send(msg)
            .map_err(|e| VoiceError::Send(e.to_string()))
    }
}

async fn await_setup_complete(ws_stream: &mut WsStream, session_id: &str) -> VoiceResult<()> {
    while let Some(msg_result) = ws_stream.next().await {
        let msg = msg_result.map_err(|e| {
            VoiceError::from_remote(format!("WebSocket error before setupComplete: {e}"))
        })?;
        if let WsMessage::Close(frame) = &msg {
            let reason = close_error(frame.as_ref())
                .unwrap_or_else(|| "closed without reason".to_string());
            return Err(VoiceError::from_remote(format!(
                "Connection closed before setupComplete: {reason}"
            )));
        }
        let Some(text) = frame_json(&msg) else {
            tracing::debug!(session_id = %session_id, msg = ?msg, "Gemini Live setup phase: non-JSON frame");
            continue;
        };
        for event in parse_server_message(text) {
            match event {
                VoiceEvent::SetupComplete => {
                    tracing::info!(session_id = %session_id, "Gemini Live setup complete, ready to stream");
                    return Ok(());
                }
                VoiceEvent::Error { message } => return Err(VoiceError::from_remote(message)),
                _ => {}
            }
        }
    }
    Err(VoiceError::Connection(
        "Stream ended before setupComplete".to_string(),
    ))
}

/// Encode queued messages and write them to the WebSocket.
async fn outbound_loop(
    mut rx: mpsc::Receiver<OutboundMessage>,
    mut ws_sender: SplitSink<WsStream, WsMessage>,
    session_id: String,
) {
    let mut audio_chunk_count: u64 = 0;
    let mut total_bytes: u64 = 0;

    while let Some(msg) = rx.recv().await {
        let json = match msg {
            OutboundMessage::Audio(pcm) => {
                audio_chunk_count += 1;
                total_bytes += pcm.len() as u64;
                if audio_chunk_count == 1 || audio_chunk_count.is_multiple_of(50) {
                    tracing::info!(
                        session_id = %session_id,
                        chunk = audio_chunk_count,
                        pcm_bytes = pcm.len(),
                        total_bytes = total_bytes,
                        "Sending audio chunk to Gemini"
                    );
                }
                serde_json::to_string(&build_audio_message(&pcm))
            }
            OutboundMessage::Text(text) => {
                tracing::info!(session_id = %session_id, chars = text.len(), "Sending text control message");
                serde_json::to_string(&build_text_message(&text))
            }
            OutboundMessage::AudioStreamEnd => {
                tracing::info!(session_id = %session_id, "Sending audioStreamEnd to Gemini Live");
                serde_json::to_string(&build_audio_stream_end_message())
            }
            OutboundMessage::Close => {
                let _ = ws_sender.send(WsMessage::Close(None)).await;
                break;
            }
        };

        let json = match json {
            Ok(json) => json,
            Err(e) => {
                tracing::error!(session_id = %session_id, error = %e, "Failed to serialize outbound message");
                continue;
            }
        };
        if ws_sender.send(WsMessage::Text(json.into())).await.is_err() {
            tracing::warn!(session_id = %session_id, "WebSocket send failed, closing outbound loop");
            break;
        }
    }

    tracing::debug!(
        session_id = %session_id,
        audio_chunks = audio_chunk_count,
        total_bytes = total_bytes,
        "Outbound loop terminated"
    );
}

/// Read server messages and forward parsed events. Dropping `event_tx` on
/// exit is the close signal for the consumer.
async fn inbound_loop(
    mut ws_receiver: SplitStream<WsStream>,
    event_tx: mpsc::Sender<VoiceEvent>,
    session_id: String,
) {
    let start_time = Instant::now();
    let mut audio_response_count: u64 = 0;
    let mut turn_count: u64 = 0;

    while let Some(msg_result) = ws_receiver.next().await {
        let msg = match msg_result {
            Ok(msg) => msg,
            Err(e) => {
                tracing::error!(session_id = %session_id, error = %e, "Gemini Live WebSocket error");
                let _ = event_tx
                    .send(VoiceEvent::Error {
                        message: format!("WebSocket error: {e}"),
                    })
                    .await;
                break;
            }
        };

        if let WsMessage::Close(frame) = &msg {
            tracing::info!(session_id = %session_id, close_frame = ?frame, "Gemini Live connection closed");
            if let Some(message) = close_error(frame.as_ref()) {
                let _ = event_tx.send(VoiceEvent::Error { message }).await;
            }
            break;
        }

        let Some(text) = frame_json(&msg) else {
            if let WsMessage::Binary(data) = &msg {
                tracing::warn!(
                    session_id = %session_id,
                    len = data.len(),
                    "Unexpected non-JSON binary frame from Gemini Live, skipping"
                );
            }
            continue;
        };

        tracing::debug!(session_id = %session_id, msg = %text, "Gemini Live message");
        let elapsed = start_time.elapsed().as_secs_f32();
        for event in parse_server_message(text) {
            match &event {
                VoiceEvent::Audio { data } => {
                    audio_response_count += 1;
                    tracing::debug!(
                        session_id = %session_id,
                        t = format!("{elapsed:.1}s"),
                        audio_n = audio_response_count,
                        bytes = data.len(),
                        "Gemini audio response"
                    );
                }
                VoiceEvent::TurnComplete => {
                    turn_count += 1;
                    tracing::info!(
                        session_id = %session_id,
                        t = format!("{elapsed:.1}s"),
                        turn = turn_count,
                        audio_chunks = audio_response_count,
                        "Turn complete"
                    );
                }
                VoiceEvent::Interrupted => {
                    tracing::info!(session_id = %session_id, t = format!("{elapsed:.1}s"), "Interrupted");
                }
                VoiceEvent::GoAway { time_left } => {
                    tracing::warn!(session_id = %session_id, time_left = ?time_left, "Gemini Live goAway");
                }
                _ => {}
            }
            if event_tx.send(event).await.is_err() {
                tracing::debug!(session_id = %session_id, "Event receiver dropped, closing inbound loop");
                return;
            }
        }
    }

    tracing::debug!(session_id = %session_id, "Inbound loop terminated");
}

// ── Tests ──────────────────────────────────────────────────────────

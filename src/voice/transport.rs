//! The duplex link seam between the session engine and a voice endpoint.
//!
//! The engine only ever sees [`LiveLink`] (non-blocking sends) and the
//! receiver of [`VoiceEvent`]s returned alongside it. The receiver ending
//! is the close signal.

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::error::{VoiceError, VoiceResult};
use super::gemini_live::GeminiLiveSession;
use super::persona::SessionContext;
use super::VoiceEvent;
use crate::config::LiveConfig;

/// Everything needed to open one link.
#[derive(Debug, Clone)]
pub struct LinkRequest {
    pub session_id: String,
    pub api_key: String,
    pub context: SessionContext,
}

/// An open link plus its inbound events.
pub struct OpenedLink {
    pub link: Box<dyn LiveLink>,
    pub events: mpsc::Receiver<VoiceEvent>,
}

impl std::fmt::Debug for OpenedLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenedLink")
            .field("session_id", &self.link.session_id())
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait LiveTransport: Send + Sync {
    /// Open a link and complete the setup handshake.
    async fn open(&self, request: LinkRequest) -> VoiceResult<OpenedLink>;
}

/// Outbound half of an open link. Sends queue without blocking and fail
/// with [`VoiceError::Send`] once the link is gone.
pub trait LiveLink: Send + Sync {
    fn session_id(&self) -> &str;
    fn send_audio(&self, pcm: Vec<u8>) -> VoiceResult<()>;
    fn send_text(&self, text: String) -> VoiceResult<()>;
    fn end_audio_stream(&self) -> VoiceResult<()>;
    fn close(&self);
}

// ── Gemini Live ───────────────────────────────────────────────────

/// Opens [`GeminiLiveSession`]s against the configured endpoint.
pub struct GeminiLiveTransport {
    live: LiveConfig,
}

impl GeminiLiveTransport {
    pub fn new(live: LiveConfig) -> Self {
        Self { live }
    }
}

#[async_trait]
impl LiveTransport for GeminiLiveTransport {
    async fn open(&self, request: LinkRequest) -> VoiceResult<OpenedLink> {
        let mut session = GeminiLiveSession::connect(
            request.session_id,
            &request.api_key,
            &request.context,
            &self.live,
        )
        .await?;
        let events = session
            .take_events()
            .ok_or_else(|| VoiceError::Connection("event stream already taken".into()))?;
        Ok(OpenedLink {
            link: Box::new(session),
            events,
        })
    }
}

impl LiveLink for GeminiLiveSession {
    fn session_id(&self) -> &str {
        GeminiLiveSession::session_id(self)
    }

    fn send_audio(&self, pcm: Vec<u8>) -> VoiceResult<()> {
        self.try_send_audio(pcm)
    }

    fn send_text(&self, text: String) -> VoiceResult<()> {
        self.try_send_text(text)
    }

    fn end_audio_stream(&self) -> VoiceResult<()> {
        self.try_send_audio_stream_end()
    }

    fn close(&self) {
        GeminiLiveSession::close(self);
    }
}

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Default Gemini Live WebSocket endpoint.
pub const DEFAULT_LIVE_ENDPOINT: &str =
    "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Default native-audio model.
pub const DEFAULT_LIVE_MODEL: &str = "gemini-2.5-flash-native-audio-preview-12-2025";

/// Top-level configuration, loaded from `config.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct Config {
    pub live: LiveConfig,
    pub capture: CaptureConfig,
    pub playback: PlaybackConfig,
    pub transcript: TranscriptConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct LiveConfig {
    /// WebSocket endpoint of the streaming voice service.
    pub endpoint: String,
    /// Model identifier (without the `models/` prefix).
    pub model: String,
    /// Prebuilt voice used when the session context does not name one.
    pub default_voice: String,
    /// API keys in preference order. `GEMINI_API_KEY` / `GOOGLE_API_KEY`
    /// are appended at load time when set.
    pub api_keys: Vec<String>,
    /// Seconds to wait for `setupComplete`. Unset waits for the endpoint's
    /// own error or close.
    pub setup_timeout_secs: Option<u64>,
    /// Capacity of the outbound and inbound message channels.
    pub channel_capacity: usize,
    /// Let the endpoint detect speech start/end itself.
    pub automatic_activity_detection: bool,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_LIVE_ENDPOINT.to_string(),
            model: DEFAULT_LIVE_MODEL.to_string(),
            default_voice: "Aoede".to_string(),
            api_keys: Vec::new(),
            setup_timeout_secs: None,
            channel_capacity: 256,
            automatic_activity_detection: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct CaptureConfig {
    pub sample_rate: u32,
    /// Samples per emitted frame (1024 at 16 kHz is a 64 ms cadence).
    pub block_size: usize,
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            block_size: 1024,
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct PlaybackConfig {
    pub sample_rate: u32,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            sample_rate: 24_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct TranscriptConfig {
    /// Rolling window size, in characters, for each transcript buffer.
    pub max_chars: usize,
    /// Minimum ASCII fraction for a fragment to count as Latin-script.
    pub ascii_threshold: f32,
    /// How long a "non-English ignored" warning stays visible.
    pub warning_ttl_ms: u64,
}

impl Default for TranscriptConfig {
    fn default() -> Self {
        Self {
            max_chars: 2000,
            ascii_threshold: 0.8,
            warning_ttl_ms: 4000,
        }
    }
}

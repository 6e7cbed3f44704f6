//! API key selection and the one-time reselection on credential errors.

use parking_lot::Mutex;

use super::error::{VoiceError, VoiceResult};
use crate::config::LiveConfig;

/// Supplies the credential used to open a link.
pub trait CredentialSource: Send + Sync {
    fn current(&self) -> VoiceResult<String>;

    /// Switch to another credential after the endpoint rejected the current
    /// one. Called at most once per failed open.
    fn reselect(&self);
}

/// Rotates through configured API keys.
pub struct KeyRing {
    keys: Vec<String>,
    index: Mutex<usize>,
}

impl KeyRing {
    pub fn new(keys: Vec<String>) -> Self {
        Self {
            keys,
            index: Mutex::new(0),
        }
    }

    pub fn from_config(live: &LiveConfig) -> Self {
        Self::new(live.api_keys.clone())
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl CredentialSource for KeyRing {
    fn current(&self) -> VoiceResult<String> {
        let index = *self.index.lock();
        self.keys.get(index).cloned().ok_or_else(|| {
            VoiceError::Config(
                "no API key configured (set live.api_keys or GEMINI_API_KEY)".to_string(),
            )
        })
    }

    fn reselect(&self) {
        if self.keys.len() < 2 {
            tracing::warn!("Credential rejected and no alternate API key is configured");
            return;
        }
        let mut index = self.index.lock();
        *index = (*index + 1) % self.keys.len();
        tracing::info!(key_index = *index, "Switched to next API key");
    }
}

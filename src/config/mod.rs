pub mod schema;

pub use schema::{
    CaptureConfig, Config, LiveConfig, PlaybackConfig, TranscriptConfig, DEFAULT_LIVE_ENDPOINT,
    DEFAULT_LIVE_MODEL,
};

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Environment variable overriding the config file location.
pub const CONFIG_PATH_ENV: &str = "SPEAKWELL_CONFIG";

const API_KEY_ENVS: [&str; 2] = ["GEMINI_API_KEY", "GOOGLE_API_KEY"];

impl Config {
    /// Load from `$SPEAKWELL_CONFIG` or `~/.speakwell/config.toml`, then
    /// apply environment overrides. A missing file yields defaults.
    pub fn load_or_default() -> Result<Self> {
        let path = default_config_path()?;
        let mut config = Self::load_from(&path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load a specific file without environment overrides.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Self = toml::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        tracing::info!(path = %path.display(), "Loaded config");
        Ok(config)
    }

    /// Append API keys from the environment, skipping blanks and duplicates.
    pub fn apply_env_overrides(&mut self) {
        for var in API_KEY_ENVS {
            if let Ok(key) = std::env::var(var) {
                self.live.push_api_key(key);
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.live.endpoint.trim().is_empty() {
            anyhow::bail!("live.endpoint cannot be empty");
        }
        if self.live.model.trim().is_empty() {
            anyhow::bail!("live.model cannot be empty");
        }
        if self.live.channel_capacity == 0 {
            anyhow::bail!("live.channel_capacity must be greater than zero");
        }
        if self.capture.sample_rate == 0 || self.playback.sample_rate == 0 {
            anyhow::bail!("sample rates must be greater than zero");
        }
        if self.capture.block_size == 0 {
            anyhow::bail!("capture.block_size must be greater than zero");
        }
        let threshold = self.transcript.ascii_threshold;
        if !(threshold > 0.0 && threshold <= 1.0) {
            anyhow::bail!("transcript.ascii_threshold must be in (0, 1], got {threshold}");
        }
        if self.transcript.max_chars == 0 {
            anyhow::bail!("transcript.max_chars must be greater than zero");
        }
        Ok(())
    }

    /// JSON schema of the config file, pretty-printed.
    pub fn json_schema() -> Result<String> {
        let schema = schemars::schema_for!(Config);
        Ok(serde_json::to_string_pretty(&schema)?)
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

impl LiveConfig {
    pub fn push_api_key(&mut self, key: String) {
        let key = key.trim().to_string();
        if !key.is_empty() && !self.api_keys.contains(&key) {
            self.api_keys.push(key);
        }
    }
}

/// Resolve the config path: `$SPEAKWELL_CONFIG` (with `~` and env vars
/// expanded) or `<home>/.speakwell/config.toml`.
pub fn default_config_path() -> Result<PathBuf> {
    if let Ok(raw) = std::env::var(CONFIG_PATH_ENV) {
        if !raw.trim().is_empty() {
            let expanded = shellexpand::full(raw.trim())
                .with_context(|| format!("Failed to expand {CONFIG_PATH_ENV}={raw}"))?;
            return Ok(PathBuf::from(expanded.as_ref()));
        }
    }
    let dirs = directories::UserDirs::new().context("Could not determine home directory")?;
    Ok(dirs.home_dir().join(".speakwell").join("config.toml"))
}

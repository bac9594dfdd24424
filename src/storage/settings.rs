//! Settings storage
//!
//! Manages persistence of sampler, load and stop-word preferences.

use crate::inference::engine::DEFAULT_MAX_TOKENS;
use crate::inference::sampler::SamplerParams;
use crate::storage::{get_data_dir, StorageError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Engine settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Temperature parameter for text generation (0.0 - 2.0)
    pub temperature: f32,
    /// Top-p (nucleus sampling) parameter (0.0 - 1.0)
    pub top_p: f32,
    /// Top-k sampling parameter (0 = disabled)
    pub top_k: u32,
    /// Repetition penalty (1.0 = disabled)
    pub repeat_penalty: f32,
    pub presence_penalty: f32,
    pub frequency_penalty: f32,
    /// Default number of tokens to generate
    pub max_tokens: u32,
    /// Context window size
    pub context_size: u32,
    /// Number of GPU layers to offload (0 = CPU only)
    pub gpu_layers: u32,
    /// Keep K/Q/V tensors on the accelerator
    pub offload_kqv: bool,
    /// Evaluation threads (unset = all cores)
    pub threads: Option<u32>,
    /// Phrases that end generation
    pub stop_words: Vec<String>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        let sampler = SamplerParams::default();
        Self {
            temperature: sampler.temperature,
            top_p: sampler.top_p,
            top_k: sampler.top_k,
            repeat_penalty: sampler.repeat_penalty,
            presence_penalty: sampler.presence_penalty,
            frequency_penalty: sampler.frequency_penalty,
            max_tokens: DEFAULT_MAX_TOKENS,
            context_size: 2048,
            gpu_layers: 0,
            offload_kqv: true,
            threads: None,
            stop_words: Vec::new(),
        }
    }
}

impl EngineSettings {
    /// Validate settings values
    ///
    /// Ensures all parameters are within acceptable ranges
    pub fn validate(&mut self) {
        let before = self.clone();

        // Clamp temperature between 0.0 and 2.0
        self.temperature = finite_or(self.temperature, 0.8).clamp(0.0, 2.0);

        // Clamp top_p between 0.0 and 1.0
        self.top_p = finite_or(self.top_p, 1.0).clamp(0.0, 1.0);

        self.repeat_penalty = finite_or(self.repeat_penalty, 1.0).max(0.0);
        self.presence_penalty = finite_or(self.presence_penalty, 0.0);
        self.frequency_penalty = finite_or(self.frequency_penalty, 0.0);

        if self.max_tokens == 0 {
            self.max_tokens = DEFAULT_MAX_TOKENS;
        }

        if self.context_size == 0 {
            self.context_size = 2048;
        }

        if self.threads == Some(0) {
            self.threads = None;
        }

        self.stop_words.retain(|word| !word.is_empty());

        if *self != before {
            tracing::warn!("Settings adjusted into valid ranges");
        }
    }

    /// The sampler part of these settings
    pub fn sampler_params(&self) -> SamplerParams {
        SamplerParams {
            temperature: self.temperature,
            top_k: self.top_k,
            top_p: self.top_p,
            repeat_penalty: self.repeat_penalty,
            presence_penalty: self.presence_penalty,
            frequency_penalty: self.frequency_penalty,
        }
    }
}

fn finite_or(value: f32, fallback: f32) -> f32 {
    if value.is_finite() {
        value
    } else {
        fallback
    }
}

/// Get the settings file path
pub fn get_settings_path() -> Result<PathBuf, StorageError> {
    Ok(get_data_dir()?.join("settings.json"))
}

/// Load settings from disk
///
/// Returns default settings if the file doesn't exist or is corrupted
pub fn load_settings() -> EngineSettings {
    match get_settings_path().and_then(|path| load_settings_internal(&path)) {
        Ok(settings) => settings,
        Err(e) => {
            tracing::warn!("Failed to load settings, using defaults: {}", e);
            EngineSettings::default()
        }
    }
}

/// Load settings from `path`, with the same fallback as [`load_settings`]
pub fn load_settings_from(path: &Path) -> EngineSettings {
    match load_settings_internal(path) {
        Ok(settings) => settings,
        Err(e) => {
            tracing::warn!(
                "Failed to load settings from {}, using defaults: {}",
                path.display(),
                e
            );
            EngineSettings::default()
        }
    }
}

/// Internal settings loading with error propagation
fn load_settings_internal(path: &Path) -> Result<EngineSettings, StorageError> {
    if !path.exists() {
        tracing::info!("Settings file not found, using defaults");
        return Ok(EngineSettings::default());
    }

    let json = fs::read_to_string(path)?;
    let mut settings: EngineSettings = serde_json::from_str(&json)?;

    // Validate loaded settings
    settings.validate();

    tracing::debug!("Loaded settings from {}", path.display());
    Ok(settings)
}

/// Save settings to disk
pub fn save_settings(settings: &EngineSettings) -> Result<(), StorageError> {
    save_settings_to(settings, &get_settings_path()?)
}

/// Save settings to `path`
pub fn save_settings_to(settings: &EngineSettings, path: &Path) -> Result<(), StorageError> {
    // Ensure the parent directory exists
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let json = serde_json::to_string_pretty(settings)?;
    fs::write(path, json)?;

    tracing::debug!("Saved settings to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = EngineSettings::default();
        assert_eq!(settings.temperature, 0.8);
        assert_eq!(settings.top_p, 0.9);
        assert_eq!(settings.top_k, 40);
        assert_eq!(settings.max_tokens, 200);
        assert!(settings.offload_kqv);
        assert!(settings.stop_words.is_empty());
        assert_eq!(settings.sampler_params(), SamplerParams::default());
    }

    #[test]
    fn test_settings_validation() {
        let mut settings = EngineSettings::default();

        // Test temperature clamping
        settings.temperature = 5.0;
        settings.validate();
        assert_eq!(settings.temperature, 2.0);

        settings.temperature = -1.0;
        settings.validate();
        assert_eq!(settings.temperature, 0.0);

        // Test top_p clamping
        settings.top_p = 2.0;
        settings.validate();
        assert_eq!(settings.top_p, 1.0);

        settings.repeat_penalty = f32::NAN;
        settings.max_tokens = 0;
        settings.context_size = 0;
        settings.threads = Some(0);
        settings.stop_words = vec![String::new(), "User:".to_string()];
        settings.validate();
        assert_eq!(settings.repeat_penalty, 1.0);
        assert_eq!(settings.max_tokens, 200);
        assert_eq!(settings.context_size, 2048);
        assert_eq!(settings.threads, None);
        assert_eq!(settings.stop_words, vec!["User:".to_string()]);
    }

    #[test]
    fn test_partial_file_uses_defaults_for_missing_fields() {
        let settings: EngineSettings =
            serde_json::from_str(r#"{ "temperature": 0.1, "stop_words": ["</s>"] }"#).unwrap();
        assert_eq!(settings.temperature, 0.1);
        assert_eq!(settings.stop_words, vec!["</s>".to_string()]);
        assert_eq!(settings.top_k, 40);
    }

    #[test]
    fn test_settings_persistence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");

        let settings = EngineSettings {
            temperature: 0.3,
            gpu_layers: 33,
            threads: Some(6),
            stop_words: vec!["</s>".to_string()],
            ..EngineSettings::default()
        };
        save_settings_to(&settings, &path).unwrap();

        let loaded = load_settings_from(&path);
        assert_eq!(loaded, settings);
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = load_settings_from(&dir.path().join("absent.json"));
        assert_eq!(loaded, EngineSettings::default());
    }

    #[test]
    fn test_corrupt_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, "{ not json").unwrap();
        assert_eq!(load_settings_from(&path), EngineSettings::default());
    }
}

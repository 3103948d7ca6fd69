//! Persistent host settings (JSON file in the app data directory).

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use livevox_core::{LiveConfig, SessionConfig};
use serde::{Deserialize, Serialize};

/// Environment variables consulted for the API key, in priority order.
pub const API_KEY_ENV: &[&str] = &["LIVEVOX_API_KEY", "GEMINI_API_KEY"];

const DEFAULT_ATHLETE: &str = "an athlete";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct AppSettings {
    pub api_key: Option<String>,
    pub model: String,
    pub voice: String,
    /// Name the coach uses for the user.
    pub athlete_name: Option<String>,
    /// Full system instruction override; replaces the coach persona.
    pub persona: Option<String>,
    pub preferred_input_device: Option<String>,
    pub preferred_output_device: Option<String>,
    pub setup_timeout_secs: u64,
}

impl Default for AppSettings {
    fn default() -> Self {
        let live = LiveConfig::default();
        Self {
            api_key: None,
            model: live.model,
            voice: live.voice,
            athlete_name: None,
            persona: None,
            preferred_input_device: None,
            preferred_output_device: None,
            setup_timeout_secs: live.setup_timeout.as_secs(),
        }
    }
}

impl AppSettings {
    pub fn normalize(&mut self) {
        let defaults = LiveConfig::default();
        self.api_key = normalize_optional(self.api_key.take());
        self.model = normalize_or(&self.model, &defaults.model);
        self.voice = normalize_or(&self.voice, &defaults.voice);
        self.athlete_name = normalize_optional(self.athlete_name.take());
        self.persona = normalize_optional(self.persona.take());
        self.preferred_input_device = normalize_optional(self.preferred_input_device.take());
        self.preferred_output_device = normalize_optional(self.preferred_output_device.take());
        self.setup_timeout_secs = self.setup_timeout_secs.clamp(1, 120);
    }

    /// API key from the environment if set, else from the file.
    pub fn resolve_api_key(&self, env: impl Fn(&str) -> Option<String>) -> Option<String> {
        API_KEY_ENV
            .iter()
            .find_map(|name| env(name).and_then(|v| normalize_optional(Some(v))))
            .or_else(|| self.api_key.clone())
    }

    /// The persona override, or the coach persona addressing the athlete.
    pub fn system_instruction(&self) -> String {
        match &self.persona {
            Some(persona) => persona.clone(),
            None => coach_instruction(self.athlete_name.as_deref().unwrap_or(DEFAULT_ATHLETE)),
        }
    }

    pub fn live_config(&self, api_key: String) -> LiveConfig {
        LiveConfig {
            model: self.model.clone(),
            voice: self.voice.clone(),
            api_key,
            setup_timeout: Duration::from_secs(self.setup_timeout_secs),
            ..LiveConfig::default()
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            input_device: self.preferred_input_device.clone(),
            output_device: self.preferred_output_device.clone(),
            ..SessionConfig::default()
        }
    }
}

/// Default persona: an upbeat fitness coach speaking to `athlete`.
pub fn coach_instruction(athlete: &str) -> String {
    format!(
        "You are a high-energy, motivating fitness coach named 'Global Coach'. \
         You are talking to {athlete}. \
         Keep responses concise, encouraging, and focused on fitness, form check, or quick advice. \
         Do not use markdown. Speak naturally."
    )
}

fn normalize_optional(raw: Option<String>) -> Option<String> {
    raw.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn normalize_or(raw: &str, fallback: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        fallback.to_string()
    } else {
        trimmed.to_string()
    }
}

pub fn default_settings_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("livevox")
            .join("settings.json")
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var_os("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                std::env::var_os("HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("/tmp"))
                    .join(".local")
                    .join("share")
            })
            .join("livevox")
            .join("settings.json")
    }
}

/// Load and normalize settings; a missing or unreadable file yields defaults.
pub fn load_settings(path: &Path) -> AppSettings {
    let mut settings = fs::read_to_string(path)
        .ok()
        .and_then(|raw| match serde_json::from_str::<AppSettings>(&raw) {
            Ok(s) => Some(s),
            Err(e) => {
                tracing::warn!(path = %path.display(), "ignoring malformed settings file: {e}");
                None
            }
        })
        .unwrap_or_default();
    settings.normalize();
    settings
}

pub fn save_settings(path: &Path, settings: &AppSettings) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(settings).map_err(std::io::Error::other)?;
    fs::write(path, json)
}

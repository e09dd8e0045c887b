//! Persistent application settings (JSON file in app data directory).

use std::fs;
use std::path::{Path, PathBuf};

use parley_core::engine::{DEFAULT_MODEL, DEFAULT_SYSTEM_INSTRUCTION, DEFAULT_VOICE};
use parley_core::remote::loopback::DEFAULT_TURN_BLOCKS;
use parley_core::SessionConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct AppSettings {
    pub preferred_input_device: Option<String>,
    pub preferred_output_device: Option<String>,
    pub model: String,
    pub voice_name: Option<String>,
    pub system_instruction: String,
    pub input_transcription: bool,
    pub output_transcription: bool,
    pub block_size: usize,
    /// Captured blocks per reply from the built-in loopback remote.
    pub loopback_turn_blocks: usize,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            preferred_input_device: None,
            preferred_output_device: None,
            model: DEFAULT_MODEL.into(),
            voice_name: Some(DEFAULT_VOICE.into()),
            system_instruction: DEFAULT_SYSTEM_INSTRUCTION.into(),
            input_transcription: true,
            output_transcription: true,
            block_size: 4096,
            loopback_turn_blocks: DEFAULT_TURN_BLOCKS,
        }
    }
}

impl AppSettings {
    pub fn normalize(&mut self) {
        self.preferred_input_device = normalize_optional(self.preferred_input_device.take());
        self.preferred_output_device = normalize_optional(self.preferred_output_device.take());
        self.voice_name = normalize_optional(self.voice_name.take());

        let model = self.model.trim();
        self.model = if model.is_empty() {
            DEFAULT_MODEL.into()
        } else {
            model.into()
        };

        let instruction = self.system_instruction.trim();
        self.system_instruction = if instruction.is_empty() {
            DEFAULT_SYSTEM_INSTRUCTION.into()
        } else {
            instruction.into()
        };

        self.block_size = self.block_size.clamp(256, 16_384);
        self.loopback_turn_blocks = self.loopback_turn_blocks.clamp(1, 256);
    }

    /// `PARLEY_*` environment variables win over the file.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(model) = lookup("PARLEY_MODEL") {
            self.model = model;
        }
        if let Some(voice) = lookup("PARLEY_VOICE") {
            self.voice_name = Some(voice);
        }
        if let Some(instruction) = lookup("PARLEY_SYSTEM_INSTRUCTION") {
            self.system_instruction = instruction;
        }
        if let Some(device) = lookup("PARLEY_INPUT_DEVICE") {
            self.preferred_input_device = Some(device);
        }
        if let Some(device) = lookup("PARLEY_OUTPUT_DEVICE") {
            self.preferred_output_device = Some(device);
        }
        if let Some(blocks) = lookup("PARLEY_LOOPBACK_TURN_BLOCKS").and_then(|v| v.parse().ok()) {
            self.loopback_turn_blocks = blocks;
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            model: self.model.clone(),
            voice_name: self.voice_name.clone(),
            system_instruction: self.system_instruction.clone(),
            input_transcription: self.input_transcription,
            output_transcription: self.output_transcription,
            block_size: self.block_size,
            ..SessionConfig::default()
        }
    }
}

fn normalize_optional(raw: Option<String>) -> Option<String> {
    raw.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

pub fn default_settings_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("Lattice Labs")
            .join("Parley")
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
            .join("parley")
            .join("settings.json")
    }
}

pub fn load_settings(path: &Path) -> AppSettings {
    let mut settings = fs::read_to_string(path)
        .ok()
        .and_then(|raw| serde_json::from_str::<AppSettings>(&raw).ok())
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

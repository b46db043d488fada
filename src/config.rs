use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const SETTINGS_FILE: &str = "scanline8.json";

/// Who drives emulation forward.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Pacing {
    /// The audio callback steps the core once per output sample.
    #[default]
    Audio,
    /// The UI runs whole frames at the NTSC rate and queues the audio.
    Frame,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Requested output rate. `None` takes the device default.
    pub sample_rate: Option<u32>,
    pub pacing: Pacing,
    pub window_scale: f32,
    /// `tracing_subscriber::EnvFilter` directive, overridden by `RUST_LOG`.
    pub log_filter: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            sample_rate: None,
            pacing: Pacing::Audio,
            window_scale: 3.0,
            log_filter: "info".to_string(),
        }
    }
}

impl Settings {
    /// Reads settings from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read settings {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("failed to parse settings {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let text = serde_json::to_string_pretty(self)?;
        fs::write(path, text)
            .with_context(|| format!("failed to write settings {}", path.display()))
    }

    pub fn window_size(&self) -> [f32; 2] {
        let scale = self.window_scale.clamp(1.0, 8.0);
        [256.0 * scale, 240.0 * scale + 96.0]
    }
}

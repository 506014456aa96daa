use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::devices::{AcquisitionRequest, CurrentRange, FormatElements};

pub const DEFAULT_CONFIG_FILE: &str = "keithley.json";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid configuration in {path}: {source}")]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// Serial line and burst settings for one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub port: String,
    pub baud_rate: u32,
    pub timeout_ms: u64,
    pub burst: BurstSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BurstSettings {
    pub samples: usize,
    pub nplc: f64,
    /// Fixed range in amps, autorange when absent
    pub range_amps: Option<f64>,
    pub elements: FormatElements,
    pub read_timeout_ms: Option<u64>,
    pub discard_first: bool,
    pub output_dir: PathBuf,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 9600,
            timeout_ms: 2000,
            burst: BurstSettings::default(),
        }
    }
}

impl Default for BurstSettings {
    fn default() -> Self {
        Self {
            samples: 100,
            nplc: 0.01,
            range_amps: None,
            elements: FormatElements::Reading,
            read_timeout_ms: Some(10_000),
            discard_first: true,
            output_dir: PathBuf::from("logs"),
        }
    }
}

impl AppConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Json {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load `explicit` if given, else `keithley.json` when it exists, else defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            info!("Loading configuration from {}", path.display());
            return Self::from_file(path);
        }
        let fallback = Path::new(DEFAULT_CONFIG_FILE);
        if fallback.exists() {
            info!("Loading configuration from {}", fallback.display());
            return Self::from_file(fallback);
        }
        info!("No configuration file found, using defaults");
        Ok(Self::default())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl BurstSettings {
    pub fn request(&self) -> AcquisitionRequest {
        let range = match self.range_amps {
            Some(amps) => CurrentRange::Fixed(amps),
            None => CurrentRange::Auto,
        };
        let request = AcquisitionRequest::new(self.samples, self.nplc)
            .range(range)
            .elements(self.elements);
        match self.read_timeout_ms {
            Some(ms) => request.read_timeout(Duration::from_millis(ms)),
            None => request,
        }
    }
}

//! Session configuration loaded from TOML.
//!
//! Every field has a default, so an empty file (or no file) yields the
//! standard five-shot plain burst gated on auto-exposure.
//!
//! ```toml
//! mode = "windowed"
//! burst_count = 5
//! window_size = 5
//! policy = "full"
//! image_format = "heic"
//! deadline_ms = 8000
//! output_dir = "/var/lib/burst"
//! sink = { kind = "fifo", capacity = 4 }
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::controller::{BurstMode, ControllerConfig};
use crate::convergence::ConvergencePolicy;
use crate::sink::SinkPolicy;
use crate::templates::StillSettings;
use crate::traits::{Facing, ImageFormat, Size};

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config file {path}: {source}")]
    FileRead {
        /// File that failed.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The file is not valid TOML for this schema.
    #[error("failed to parse config file {path}: {message}")]
    Parse {
        /// File that failed.
        path: PathBuf,
        /// Parser message.
        message: String,
    },

    /// A value is out of range.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Complete session configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BurstConfig {
    /// Plain batch or windowed zero-shutter-lag burst.
    pub mode: BurstMode,
    /// Stills per session.
    pub burst_count: u32,
    /// Preview frames eligible for windowed capture. Defaults to `burst_count`.
    pub window_size: Option<u32>,
    /// Axes that must converge before capture.
    pub policy: ConvergencePolicy,
    /// Clear the observed convergence flag when a later frame regresses.
    pub resettable: bool,
    /// Encoded still format.
    pub image_format: ImageFormat,
    /// JPEG quality, 1..=100.
    pub jpeg_quality: u8,
    /// Preview target dimensions.
    pub preview_size: Size,
    /// Still size when the device reports none.
    pub fallback_still_size: Size,
    /// Image target depth. Defaults to `burst_count + 2`.
    pub max_images: Option<u32>,
    /// Retention policy for undrained images.
    pub sink: SinkPolicy,
    /// Overall session deadline in milliseconds.
    pub deadline_ms: u64,
    /// Time to keep persisting late images after a completed burst.
    pub linger_ms: u64,
    /// Directory images are written to.
    pub output_dir: PathBuf,
    /// Facing reported for devices that cannot tell.
    pub facing: Facing,
}

impl Default for BurstConfig {
    fn default() -> Self {
        Self {
            mode: BurstMode::Plain,
            burst_count: 5,
            window_size: None,
            policy: ConvergencePolicy::Exposure,
            resettable: false,
            image_format: ImageFormat::Jpeg,
            jpeg_quality: 90,
            preview_size: Size::new(640, 480),
            fallback_still_size: Size::new(1920, 1440),
            max_images: None,
            sink: SinkPolicy::Latest,
            deadline_ms: 10_000,
            linger_ms: 300,
            output_dir: PathBuf::from("burst"),
            facing: Facing::Back,
        }
    }
}

impl BurstConfig {
    /// Load and validate a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&contents).map_err(|err| ConfigError::Parse {
            path: path.to_path_buf(),
            message: err.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the session could never satisfy.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.burst_count == 0 {
            return Err(ConfigError::Invalid("burst_count must be at least 1".to_owned()));
        }
        if self.window_size() < self.burst_count {
            return Err(ConfigError::Invalid(format!(
                "window_size {} is smaller than burst_count {}",
                self.window_size(),
                self.burst_count
            )));
        }
        if !(1..=100).contains(&self.jpeg_quality) {
            return Err(ConfigError::Invalid(format!(
                "jpeg_quality {} outside 1..=100",
                self.jpeg_quality
            )));
        }
        if self.sink.capacity() == 0 {
            return Err(ConfigError::Invalid("sink capacity must be at least 1".to_owned()));
        }
        if self.max_images() == 0 {
            return Err(ConfigError::Invalid("max_images must be at least 1".to_owned()));
        }
        Ok(())
    }

    /// Effective capture window.
    pub fn window_size(&self) -> u32 {
        self.window_size.unwrap_or(self.burst_count)
    }

    /// Effective image target depth.
    pub fn max_images(&self) -> u32 {
        self.max_images
            .unwrap_or_else(|| self.burst_count.saturating_add(2))
    }

    /// Overall session deadline.
    pub const fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }

    /// Post-burst linger before teardown.
    pub const fn linger(&self) -> Duration {
        Duration::from_millis(self.linger_ms)
    }

    /// Parameters for the burst state machine.
    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            mode: self.mode,
            burst_count: self.burst_count,
            window_size: self.window_size(),
            policy: self.policy,
            resettable: self.resettable,
        }
    }

    /// Still-request settings for the template cache.
    pub fn still_settings(&self) -> StillSettings {
        StillSettings {
            jpeg_quality: self.jpeg_quality,
            zero_shutter_lag: self.mode == BurstMode::Windowed,
        }
    }
}

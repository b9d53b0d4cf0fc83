use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::camera::{CameraConstraints, FacingMode, Resolution};
use crate::common::error::{PunchError, Result};
use crate::core::{AttemptPolicy, CaptureSettings, OrchestratorSettings};

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    pub camera: CameraConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub verification: VerificationConfig,
    /// Deliberately has no default: the calling layer must decide how many
    /// failed verifications it tolerates before locking an identity out.
    pub attempts: AttemptsConfig,
    pub matcher: MatcherConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CameraBackendKind {
    V4l2,
    Simulated,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CameraConfig {
    #[serde(default = "default_backend")]
    pub backend: CameraBackendKind,
    pub device_index: u32,
    pub width: u32,
    pub height: u32,
    #[serde(default = "default_min_width")]
    pub min_width: u32,
    #[serde(default = "default_min_height")]
    pub min_height: u32,
    #[serde(default = "default_max_width")]
    pub max_width: u32,
    #[serde(default = "default_max_height")]
    pub max_height: u32,
    #[serde(default = "default_facing")]
    pub facing: FacingMode,
    #[serde(default = "default_frame_rate")]
    pub frame_rate: u32,
    #[serde(default = "default_warmup_frames")]
    pub warmup_frames: u32,
    #[serde(default = "default_warmup_delay")]
    pub warmup_delay_ms: u64,
    #[serde(default = "default_ready_timeout")]
    pub ready_timeout_ms: u64,
}

fn default_backend() -> CameraBackendKind { CameraBackendKind::V4l2 }
fn default_min_width() -> u32 { 320 }
fn default_min_height() -> u32 { 240 }
fn default_max_width() -> u32 { 1280 }
fn default_max_height() -> u32 { 720 }
fn default_facing() -> FacingMode { FacingMode::User }
fn default_frame_rate() -> u32 { 30 }
fn default_warmup_frames() -> u32 { 3 }
fn default_warmup_delay() -> u64 { 50 }
fn default_ready_timeout() -> u64 { 5000 }

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CaptureConfig {
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
    #[serde(default = "default_true")]
    pub mirror: bool,
    #[serde(default = "default_countdown_ticks")]
    pub countdown_ticks: u32,
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            jpeg_quality: default_jpeg_quality(),
            mirror: true,
            countdown_ticks: default_countdown_ticks(),
            tick_interval_ms: default_tick_interval(),
        }
    }
}

fn default_jpeg_quality() -> u8 { 85 }

const JPEG_QUALITY_RANGE: std::ops::RangeInclusive<u8> = 80..=90;

/// One year.
const MAX_LOCKOUT_SECONDS: u64 = 365 * 24 * 60 * 60;
fn default_true() -> bool { true }
fn default_countdown_ticks() -> u32 { 3 }
fn default_tick_interval() -> u64 { 1000 }

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct VerificationConfig {
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self { similarity_threshold: default_similarity_threshold() }
    }
}

fn default_similarity_threshold() -> f32 { 0.75 }

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AttemptsConfig {
    pub max_attempts: u32,
    pub lockout_seconds: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MatcherKind {
    Service,
    Fixed,
    Identical,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MatcherConfig {
    pub kind: MatcherKind,
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,
    #[serde(default = "default_matcher_timeout")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub fixed_score: Option<f32>,
}

fn default_socket_path() -> PathBuf { PathBuf::from(crate::service::protocol::SOCKET_PATH) }
fn default_matcher_timeout() -> u64 { 10_000 }

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub log_hmac_key_file: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { data_dir: default_data_dir(), log_hmac_key_file: None }
    }
}

fn default_data_dir() -> PathBuf { crate::common::paths::default_data_dir() }

impl Config {
    pub fn load_from_path(path: &std::path::Path) -> Result<Self> {
        if !path.exists() {
            return Err(PunchError::Config(format!(
                "Config file not found: {}. Please create it from configs/facepunch.toml.",
                path.display()
            )));
        }

        tracing::debug!("Loading config from: {}", path.display());
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)
            .map_err(|e| PunchError::Config(format!("Config parse error: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let cam = &self.camera;
        for (name, value) in [("width", cam.width), ("height", cam.height)] {
            if value == 0 || value > 4096 {
                return Err(PunchError::Config(format!(
                    "Camera {} must be between 1 and 4096, got {}", name, value
                )));
            }
        }
        if cam.min_width > cam.width || cam.width > cam.max_width
            || cam.min_height > cam.height || cam.height > cam.max_height
        {
            return Err(PunchError::Config(format!(
                "Camera resolution {}x{} must lie within min {}x{} and max {}x{}",
                cam.width, cam.height, cam.min_width, cam.min_height, cam.max_width, cam.max_height
            )));
        }
        if cam.ready_timeout_ms == 0 {
            return Err(PunchError::Config("Camera ready_timeout_ms must be positive".into()));
        }

        if !JPEG_QUALITY_RANGE.contains(&self.capture.jpeg_quality) {
            return Err(PunchError::Config(format!(
                "JPEG quality must be between {} and {}, got {}",
                JPEG_QUALITY_RANGE.start(), JPEG_QUALITY_RANGE.end(), self.capture.jpeg_quality
            )));
        }

        let threshold = self.verification.similarity_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(PunchError::Config(format!(
                "Similarity threshold must be between 0.0 and 1.0, got {}", threshold
            )));
        }

        if self.attempts.max_attempts == 0 {
            return Err(PunchError::Config("attempts.max_attempts must be at least 1".into()));
        }
        if self.attempts.lockout_seconds == 0 || self.attempts.lockout_seconds > MAX_LOCKOUT_SECONDS {
            return Err(PunchError::Config(format!(
                "attempts.lockout_seconds must be between 1 and {}, got {}",
                MAX_LOCKOUT_SECONDS, self.attempts.lockout_seconds
            )));
        }

        if self.matcher.kind == MatcherKind::Fixed {
            match self.matcher.fixed_score {
                Some(score) if (0.0..=1.0).contains(&score) => {}
                Some(score) => {
                    return Err(PunchError::Config(format!(
                        "matcher.fixed_score must be between 0.0 and 1.0, got {}", score
                    )));
                }
                None => {
                    return Err(PunchError::Config(
                        "matcher.fixed_score is required when matcher.kind = \"fixed\"".into(),
                    ));
                }
            }
        }

        Ok(())
    }

    /// Test doubles are refused outside development mode.
    pub fn validate_for_production(&self) -> Result<()> {
        if self.camera.backend == CameraBackendKind::Simulated {
            return Err(PunchError::Config(
                "The simulated camera is only available with --dev".into(),
            ));
        }
        if self.matcher.kind != MatcherKind::Service {
            return Err(PunchError::Config(
                "Only matcher.kind = \"service\" is accepted outside --dev".into(),
            ));
        }
        Ok(())
    }

    pub fn constraints(&self) -> CameraConstraints {
        let cam = &self.camera;
        CameraConstraints {
            preferred: Some(Resolution::new(cam.width, cam.height)),
            min: Some(Resolution::new(cam.min_width, cam.min_height)),
            max: Some(Resolution::new(cam.max_width, cam.max_height)),
            facing: Some(cam.facing),
            frame_rate: Some(cam.frame_rate),
        }
    }

    pub fn attempt_policy(&self) -> AttemptPolicy {
        AttemptPolicy {
            max_attempts: self.attempts.max_attempts,
            lockout: Duration::from_secs(self.attempts.lockout_seconds),
        }
    }

    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            constraints: self.constraints(),
            ready_timeout: Duration::from_millis(self.camera.ready_timeout_ms),
            countdown_ticks: self.capture.countdown_ticks,
            tick_interval: Duration::from_millis(self.capture.tick_interval_ms),
            capture: CaptureSettings {
                jpeg_quality: self.capture.jpeg_quality,
                mirror: self.capture.mirror,
                ..CaptureSettings::default()
            },
            similarity_threshold: self.verification.similarity_threshold,
        }
    }
}

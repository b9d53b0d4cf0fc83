//! Camera acquisition: device backends and the scoped [`CameraSession`].

pub mod session;
pub mod simulated;
pub mod v4l2;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

pub use session::CameraSession;
pub use simulated::{SimulatedCamera, SimulatedStats};
pub use v4l2::V4l2Backend;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    /// Used for still output when the device never reported its format.
    pub const DEFAULT_OUTPUT: Resolution = Resolution { width: 640, height: 480 };

    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FacingMode {
    /// Front camera, facing the person punching in.
    User,
    Environment,
}

/// What a caller asks of the device. `None` fields are unconstrained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraConstraints {
    pub preferred: Option<Resolution>,
    pub min: Option<Resolution>,
    pub max: Option<Resolution>,
    pub facing: Option<FacingMode>,
    pub frame_rate: Option<u32>,
}

impl CameraConstraints {
    /// Any video input at all; the fallback after the ideal set fails.
    pub fn minimal() -> Self {
        Self { preferred: None, min: None, max: None, facing: None, frame_rate: None }
    }

    pub fn is_minimal(&self) -> bool {
        *self == Self::minimal()
    }

    /// Whether a negotiated resolution lies within the min/max bounds.
    pub fn admits(&self, resolution: Resolution) -> bool {
        let above_min = self.min.map_or(true, |min| {
            resolution.width >= min.width && resolution.height >= min.height
        });
        let below_max = self.max.map_or(true, |max| {
            resolution.width <= max.width && resolution.height <= max.height
        });
        above_min && below_max
    }
}

impl Default for CameraConstraints {
    fn default() -> Self {
        Self {
            preferred: Some(Resolution::new(640, 480)),
            min: Some(Resolution::new(320, 240)),
            max: Some(Resolution::new(1280, 720)),
            facing: Some(FacingMode::User),
            frame_rate: Some(30),
        }
    }
}

/// One decoded frame from a live source.
#[derive(Debug, Clone)]
pub struct Frame {
    pub image: Arc<DynamicImage>,
    pub captured_at: DateTime<Utc>,
}

impl Frame {
    pub fn new(image: DynamicImage) -> Self {
        Self { image: Arc::new(image), captured_at: Utc::now() }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CameraError {
    #[error("Camera permission denied: {0}")]
    PermissionDenied(String),

    #[error("Camera unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Camera busy: {0}")]
    DeviceBusy(String),

    #[error("Camera unsupported: {0}")]
    Unsupported(String),

    #[error("No frame available from the camera yet")]
    NoFrameAvailable,
}

/// Summary of a video device found during discovery.
#[derive(Debug, Clone)]
pub struct CameraInfo {
    pub index: u32,
    pub name: String,
    pub formats: Vec<String>,
    pub can_capture: bool,
}

impl CameraInfo {
    pub fn has_color_format(&self) -> bool {
        self.formats.iter().any(|f| f == "MJPG" || f == "YUYV")
    }
}

impl fmt::Display for CameraInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/dev/video{}: {} [{}]", self.index, self.name, self.formats.join(", "))
    }
}

/// A device that has been acquired and is (or soon will be) streaming.
#[async_trait]
pub trait LiveSource: Send + Sync {
    fn label(&self) -> &str;

    fn resolution(&self) -> Option<Resolution>;

    fn facing(&self) -> Option<FacingMode>;

    /// Resolves once the first frame has been produced.
    async fn first_frame(&mut self) -> Result<(), CameraError>;

    /// Most recent frame; never blocks.
    fn latest_frame(&self) -> Option<Frame>;

    /// Stops the hardware stream and releases the device. Must be idempotent
    /// and must not return while the device is still held.
    fn stop(&mut self);
}

#[async_trait]
pub trait CameraBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn acquire(&self, constraints: &CameraConstraints)
        -> Result<Box<dyn LiveSource>, CameraError>;
}

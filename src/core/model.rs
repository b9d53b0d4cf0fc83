use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use crate::camera::Resolution;

const MAX_IDENTITY_LEN: usize = 64;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid identity '{0}': use 1-64 letters, digits, '-', '_' or '.'")]
pub struct InvalidIdentity(pub String);

/// Owner of references and attempts. Restricted to a filename-safe alphabet
/// because it is embedded in blob paths and store file names.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Identity(String);

impl Identity {
    pub fn new(value: impl Into<String>) -> Result<Self, InvalidIdentity> {
        let value = value.into();
        let valid = !value.is_empty()
            && value.len() <= MAX_IDENTITY_LEN
            && !value.starts_with('.')
            && value.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if valid {
            Ok(Self(value))
        } else {
            Err(InvalidIdentity(value))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Identity {
    type Error = InvalidIdentity;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Identity> for String {
    fn from(identity: Identity) -> Self {
        identity.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Store the capture as the identity's new active reference.
    Register,
    /// Compare the capture against the active reference.
    Verify,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Register => f.write_str("register"),
            Mode::Verify => f.write_str("verify"),
        }
    }
}

/// An encoded still. Immutable once produced.
#[derive(Debug, Clone)]
pub struct CapturedImage {
    bytes: Arc<[u8]>,
    mime_type: &'static str,
    width: u32,
    height: u32,
    captured_at: DateTime<Utc>,
}

impl CapturedImage {
    pub const JPEG: &'static str = "image/jpeg";

    pub fn jpeg(bytes: Vec<u8>, width: u32, height: u32, captured_at: DateTime<Utc>) -> Self {
        Self { bytes: bytes.into(), mime_type: Self::JPEG, width, height, captured_at }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn mime_type(&self) -> &'static str {
        self.mime_type
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrollmentReference {
    pub identity: Identity,
    pub image_uri: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttemptOutcome {
    Success,
    Failed,
    Error,
}

impl fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptOutcome::Success => f.write_str("success"),
            AttemptOutcome::Failed => f.write_str("failed"),
            AttemptOutcome::Error => f.write_str("error"),
        }
    }
}

/// Client and device context stored with every attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub client: String,
    pub platform: String,
    pub camera: Option<String>,
    pub resolution: Option<Resolution>,
}

impl DeviceInfo {
    pub fn current(camera: Option<String>, resolution: Option<Resolution>) -> Self {
        Self {
            client: format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
            platform: format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH),
            camera,
            resolution,
        }
    }
}

/// An attempt as handed to the log, before it is assigned an id.
#[derive(Debug, Clone)]
pub struct NewAttempt {
    pub identity: Identity,
    pub probe_uri: Option<String>,
    pub reference_uri: Option<String>,
    pub similarity: Option<f32>,
    pub outcome: AttemptOutcome,
    pub error: Option<String>,
    pub device: DeviceInfo,
    pub recorded_at: DateTime<Utc>,
}

impl NewAttempt {
    pub fn with_id(self, id: String) -> VerificationAttempt {
        VerificationAttempt {
            id,
            identity: self.identity,
            probe_uri: self.probe_uri,
            reference_uri: self.reference_uri,
            similarity: self.similarity,
            outcome: self.outcome,
            error: self.error,
            device: self.device,
            recorded_at: self.recorded_at,
        }
    }
}

/// One logged match attempt. Never mutated after it is written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationAttempt {
    pub id: String,
    pub identity: Identity,
    pub probe_uri: Option<String>,
    pub reference_uri: Option<String>,
    pub similarity: Option<f32>,
    pub outcome: AttemptOutcome,
    pub error: Option<String>,
    pub device: DeviceInfo,
    pub recorded_at: DateTime<Utc>,
}

pub mod blob_store;
pub mod reference_store;
pub mod verification_log;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use thiserror::Error;

use crate::core::model::{EnrollmentReference, Identity, NewAttempt};

pub use blob_store::{FsBlobStore, MemoryBlobStore};
pub use reference_store::{FileReferenceStore, MemoryReferenceStore};
pub use verification_log::{ChainReport, JsonlVerificationLog, LogEntry, MemoryVerificationLog};

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Refusing to overwrite existing blob: {0}")]
    AlreadyExists(String),

    #[error("Invalid blob URL: {0}")]
    InvalidUrl(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobPurpose {
    Reference,
    Attempt,
}

impl BlobPurpose {
    pub fn prefix(self) -> &'static str {
        match self {
            BlobPurpose::Reference => "reference",
            BlobPurpose::Attempt => "attempts",
        }
    }
}

/// Relative object path: `{reference|attempts}/{identity}_{millis}.jpg`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobPath(String);

impl BlobPath {
    pub fn new(purpose: BlobPurpose, identity: &Identity, at: DateTime<Utc>) -> Self {
        Self(format!("{}/{}_{}.jpg", purpose.prefix(), identity, at.timestamp_millis()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BlobPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Binary object storage keyed by path. Blobs are write-once.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Stores `bytes` and returns a URL that [`BlobStore::fetch`] accepts.
    async fn upload(&self, bytes: &[u8], path: &BlobPath) -> Result<String, StorageError>;

    async fn fetch(&self, url: &str) -> Result<Vec<u8>, StorageError>;
}

/// Result of registering a new reference.
#[derive(Debug, Clone, PartialEq)]
pub struct Enrollment {
    pub reference: EnrollmentReference,
    /// How many previously active references were deactivated.
    pub deactivated: usize,
}

/// Keeps at most one active reference per identity.
#[async_trait]
pub trait ReferenceStore: Send + Sync {
    async fn active(&self, identity: &Identity) -> Result<Option<EnrollmentReference>, StorageError>;

    /// Deactivates any active reference and inserts the new one as active,
    /// as a single step.
    async fn enroll(&self, identity: &Identity, image_uri: &str) -> Result<Enrollment, StorageError>;

    /// All references for the identity, oldest first.
    async fn history(&self, identity: &Identity) -> Result<Vec<EnrollmentReference>, StorageError>;
}

/// Append-only record of match attempts.
#[async_trait]
pub trait VerificationLog: Send + Sync {
    async fn append(&self, attempt: NewAttempt) -> Result<LogEntry, StorageError>;

    async fn entries_for(&self, identity: &Identity) -> Result<Vec<LogEntry>, StorageError>;

    /// Recomputes the digest chain over every entry.
    async fn verify_chain(&self) -> Result<ChainReport, StorageError>;
}

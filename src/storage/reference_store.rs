use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;

use crate::core::model::{EnrollmentReference, Identity};
use crate::storage::{Enrollment, ReferenceStore, StorageError};

const STORAGE_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct ReferenceFile {
    version: u32,
    identity: Identity,
    references: Vec<EnrollmentReference>,
}

fn apply_enrollment(references: &mut Vec<EnrollmentReference>, identity: &Identity, image_uri: &str) -> Enrollment {
    let mut deactivated = 0;
    for reference in references.iter_mut().filter(|r| r.active) {
        reference.active = false;
        deactivated += 1;
    }

    let reference = EnrollmentReference {
        identity: identity.clone(),
        image_uri: image_uri.to_string(),
        active: true,
        created_at: Utc::now(),
    };
    references.push(reference.clone());

    Enrollment { reference, deactivated }
}

fn active_of(references: &[EnrollmentReference]) -> Option<EnrollmentReference> {
    references.iter().rev().find(|r| r.active).cloned()
}

/// One bincode file per identity holding its full reference history.
/// Files are replaced atomically, so a crash mid-enrollment leaves the
/// previous state intact.
pub struct FileReferenceStore {
    data_dir: PathBuf,
    write_lock: Mutex<()>,
}

impl FileReferenceStore {
    pub fn new(data_dir: impl AsRef<Path>) -> Result<Self, StorageError> {
        let data_dir = data_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&data_dir)?;
        Ok(Self { data_dir, write_lock: Mutex::new(()) })
    }

    fn file_for(&self, identity: &Identity) -> PathBuf {
        self.data_dir.join(format!("{}.bincode", identity))
    }

    async fn load(&self, identity: &Identity) -> Result<Vec<EnrollmentReference>, StorageError> {
        let path = self.file_for(identity);
        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let file: ReferenceFile = bincode::deserialize(&data)
            .map_err(|e| StorageError::Corrupt(format!("{}: {}", path.display(), e)))?;
        if file.version > STORAGE_VERSION {
            return Err(StorageError::Corrupt(format!(
                "{} has version {}, newer than supported {}", path.display(), file.version, STORAGE_VERSION
            )));
        }
        if &file.identity != identity {
            return Err(StorageError::Corrupt(format!(
                "{} belongs to '{}'", path.display(), file.identity
            )));
        }
        Ok(file.references)
    }

    async fn save(&self, identity: &Identity, references: Vec<EnrollmentReference>) -> Result<(), StorageError> {
        let file = ReferenceFile { version: STORAGE_VERSION, identity: identity.clone(), references };
        let encoded = bincode::serialize(&file)
            .map_err(|e| StorageError::Serialization(format!("Failed to serialize: {}", e)))?;

        let path = self.file_for(identity);
        let tmp = path.with_extension("bincode.tmp");
        tokio::fs::write(&tmp, encoded).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

#[async_trait]
impl ReferenceStore for FileReferenceStore {
    async fn active(&self, identity: &Identity) -> Result<Option<EnrollmentReference>, StorageError> {
        Ok(active_of(&self.load(identity).await?))
    }

    async fn enroll(&self, identity: &Identity, image_uri: &str) -> Result<Enrollment, StorageError> {
        let _guard = self.write_lock.lock().await;
        let mut references = self.load(identity).await?;
        let enrollment = apply_enrollment(&mut references, identity, image_uri);
        self.save(identity, references).await?;

        tracing::info!("Enrolled new reference for {} ({} deactivated)", identity, enrollment.deactivated);
        Ok(enrollment)
    }

    async fn history(&self, identity: &Identity) -> Result<Vec<EnrollmentReference>, StorageError> {
        self.load(identity).await
    }
}

#[derive(Default)]
pub struct MemoryReferenceStore {
    references: Mutex<HashMap<Identity, Vec<EnrollmentReference>>>,
    unavailable: AtomicBool,
}

impl MemoryReferenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StorageError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StorageError::Unavailable("reference store is offline".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ReferenceStore for MemoryReferenceStore {
    async fn active(&self, identity: &Identity) -> Result<Option<EnrollmentReference>, StorageError> {
        self.check()?;
        let references = self.references.lock().await;
        Ok(references.get(identity).and_then(|refs| active_of(refs)))
    }

    async fn enroll(&self, identity: &Identity, image_uri: &str) -> Result<Enrollment, StorageError> {
        self.check()?;
        let mut references = self.references.lock().await;
        Ok(apply_enrollment(references.entry(identity.clone()).or_default(), identity, image_uri))
    }

    async fn history(&self, identity: &Identity) -> Result<Vec<EnrollmentReference>, StorageError> {
        self.check()?;
        let references = self.references.lock().await;
        Ok(references.get(identity).cloned().unwrap_or_default())
    }
}

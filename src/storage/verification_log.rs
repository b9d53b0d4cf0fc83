use async_trait::async_trait;
use fs2::FileExt;
use hmac::{Hmac, Mac};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

use crate::core::model::{Identity, NewAttempt, VerificationAttempt};
use crate::storage::{StorageError, VerificationLog};

type HmacSha256 = Hmac<Sha256>;

/// `prev_digest` of the first entry.
pub const GENESIS_DIGEST: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// One line of the log. `digest` covers the sequence number, the previous
/// digest and the serialized attempt, so edits and deletions break the chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub sequence: u64,
    pub attempt: VerificationAttempt,
    pub prev_digest: String,
    pub digest: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainReport {
    pub entries: u64,
    /// Sequence number of the first entry that fails verification.
    pub broken_at: Option<u64>,
    pub keyed: bool,
}

impl ChainReport {
    pub fn is_intact(&self) -> bool {
        self.broken_at.is_none()
    }
}

#[derive(Clone)]
struct ChainSigner {
    key: Option<Vec<u8>>,
}

impl ChainSigner {
    fn digest(&self, sequence: u64, prev_digest: &str, attempt: &VerificationAttempt) -> Result<String, StorageError> {
        let body = serde_json::to_vec(attempt)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;

        let bytes = match &self.key {
            Some(key) => {
                let mut mac = HmacSha256::new_from_slice(key)
                    .map_err(|e| StorageError::Unavailable(format!("invalid log key: {}", e)))?;
                mac.update(&sequence.to_le_bytes());
                mac.update(prev_digest.as_bytes());
                mac.update(&body);
                mac.finalize().into_bytes().to_vec()
            }
            None => {
                let mut hasher = Sha256::new();
                hasher.update(sequence.to_le_bytes());
                hasher.update(prev_digest.as_bytes());
                hasher.update(&body);
                hasher.finalize().to_vec()
            }
        };
        Ok(hex::encode(bytes))
    }

    fn seal(&self, sequence: u64, prev_digest: String, attempt: VerificationAttempt) -> Result<LogEntry, StorageError> {
        let digest = self.digest(sequence, &prev_digest, &attempt)?;
        Ok(LogEntry { sequence, attempt, prev_digest, digest })
    }

    fn verify(&self, entries: &[LogEntry]) -> Result<ChainReport, StorageError> {
        let mut prev = GENESIS_DIGEST.to_string();
        let mut broken_at = None;

        for (index, entry) in entries.iter().enumerate() {
            let expected_sequence = index as u64 + 1;
            let intact = entry.sequence == expected_sequence
                && entry.prev_digest == prev
                && self.digest(entry.sequence, &entry.prev_digest, &entry.attempt)? == entry.digest;
            if !intact {
                broken_at = Some(expected_sequence);
                break;
            }
            prev = entry.digest.clone();
        }

        Ok(ChainReport { entries: entries.len() as u64, broken_at, keyed: self.key.is_some() })
    }
}

fn new_attempt_id() -> String {
    let bytes: [u8; 12] = rand::thread_rng().gen();
    hex::encode(bytes)
}

/// Newline-delimited JSON log, one [`LogEntry`] per line. Existing lines are
/// never rewritten.
///
/// Appends hold an exclusive lock on the file and read the chain tail under
/// it, so several processes can share one log without forking the chain.
pub struct JsonlVerificationLog {
    path: PathBuf,
    signer: ChainSigner,
    writer: Mutex<()>,
}

impl JsonlVerificationLog {
    /// Opens (or creates) the log, checking that existing lines parse.
    /// With a key, digests are HMAC-SHA256 instead of plain SHA-256.
    pub async fn open(path: impl AsRef<Path>, key: Option<Vec<u8>>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let entries = read_entries(&path).await?;
        tracing::debug!("Verification log {} holds {} entries", path.display(), entries.len());

        Ok(Self { path, signer: ChainSigner { key }, writer: Mutex::new(()) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn all_entries(&self) -> Result<Vec<LogEntry>, StorageError> {
        read_entries(&self.path).await
    }
}

async fn read_entries(path: &Path) -> Result<Vec<LogEntry>, StorageError> {
    let contents = match tokio::fs::read_to_string(path).await {
        Ok(contents) => contents,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    parse_entries(&contents, path)
}

fn parse_entries(contents: &str, path: &Path) -> Result<Vec<LogEntry>, StorageError> {
    contents.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(number, line)| parse_line(line, number + 1, path))
        .collect()
}

fn parse_line(line: &str, number: usize, path: &Path) -> Result<LogEntry, StorageError> {
    serde_json::from_str(line)
        .map_err(|e| StorageError::Corrupt(format!("{} line {}: {}", path.display(), number, e)))
}

fn append_locked(path: &Path, signer: &ChainSigner, attempt: VerificationAttempt) -> Result<LogEntry, StorageError> {
    let mut file = OpenOptions::new().read(true).append(true).create(true).open(path)?;
    file.lock_exclusive()?;
    let appended = append_to(&mut file, path, signer, attempt);
    if let Err(e) = file.unlock() {
        tracing::debug!("Unlocking {} failed: {}", path.display(), e);
    }
    appended
}

fn append_to(file: &mut File, path: &Path, signer: &ChainSigner, attempt: VerificationAttempt)
    -> Result<LogEntry, StorageError>
{
    let mut contents = String::new();
    file.seek(SeekFrom::Start(0))?;
    file.read_to_string(&mut contents)?;

    let tail = contents.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .last()
        .map(|(number, line)| parse_line(line, number + 1, path))
        .transpose()?;
    let (sequence, prev_digest) = tail
        .map(|e| (e.sequence + 1, e.digest))
        .unwrap_or_else(|| (1, GENESIS_DIGEST.to_string()));

    let entry = signer.seal(sequence, prev_digest, attempt)?;
    let mut line = serde_json::to_string(&entry)
        .map_err(|e| StorageError::Serialization(e.to_string()))?;
    line.push('\n');

    write_or_rollback(file, line.as_bytes())?;
    Ok(entry)
}

/// Appends `line`, truncating back to the previous length if the write or
/// sync fails so a torn line never reaches readers.
fn write_or_rollback(file: &mut File, line: &[u8]) -> io::Result<()> {
    let len = file.metadata()?.len();
    let written = file.write_all(line).and_then(|()| file.sync_data());
    rollback_on_error(file, len, written)
}

fn rollback_on_error(file: &File, len: u64, written: io::Result<()>) -> io::Result<()> {
    if written.is_err() {
        if let Err(e) = file.set_len(len) {
            tracing::error!("Could not roll back partial log write: {}", e);
        }
    }
    written
}

#[async_trait]
impl VerificationLog for JsonlVerificationLog {
    async fn append(&self, attempt: NewAttempt) -> Result<LogEntry, StorageError> {
        let _writer = self.writer.lock().await;
        let path = self.path.clone();
        let signer = self.signer.clone();
        let attempt = attempt.with_id(new_attempt_id());

        let entry = tokio::task::spawn_blocking(move || append_locked(&path, &signer, attempt))
            .await
            .map_err(|e| StorageError::Unavailable(format!("log writer failed: {}", e)))??;

        tracing::debug!("Logged attempt {} for {} ({})", entry.attempt.id, entry.attempt.identity, entry.attempt.outcome);
        Ok(entry)
    }

    async fn entries_for(&self, identity: &Identity) -> Result<Vec<LogEntry>, StorageError> {
        Ok(read_entries(&self.path).await?
            .into_iter()
            .filter(|e| &e.attempt.identity == identity)
            .collect())
    }

    async fn verify_chain(&self) -> Result<ChainReport, StorageError> {
        self.signer.verify(&read_entries(&self.path).await?)
    }
}

/// In-process log for development mode and tests. Chained like the file log.
pub struct MemoryVerificationLog {
    signer: ChainSigner,
    entries: Mutex<Vec<LogEntry>>,
    unavailable: std::sync::atomic::AtomicBool,
}

impl Default for MemoryVerificationLog {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryVerificationLog {
    pub fn new() -> Self {
        Self {
            signer: ChainSigner { key: None },
            entries: Mutex::new(Vec::new()),
            unavailable: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, std::sync::atomic::Ordering::SeqCst);
    }

    pub async fn all(&self) -> Vec<LogEntry> {
        self.entries.lock().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}

#[async_trait]
impl VerificationLog for MemoryVerificationLog {
    async fn append(&self, attempt: NewAttempt) -> Result<LogEntry, StorageError> {
        if self.unavailable.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(StorageError::Unavailable("verification log is offline".into()));
        }
        let mut entries = self.entries.lock().await;
        let (sequence, prev) = entries.last()
            .map(|e| (e.sequence + 1, e.digest.clone()))
            .unwrap_or_else(|| (1, GENESIS_DIGEST.to_string()));
        let entry = self.signer.seal(sequence, prev, attempt.with_id(new_attempt_id()))?;
        entries.push(entry.clone());
        Ok(entry)
    }

    async fn entries_for(&self, identity: &Identity) -> Result<Vec<LogEntry>, StorageError> {
        let entries = self.entries.lock().await;
        Ok(entries.iter().filter(|e| &e.attempt.identity == identity).cloned().collect())
    }

    async fn verify_chain(&self) -> Result<ChainReport, StorageError> {
        let entries = self.entries.lock().await;
        self.signer.verify(&entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::{AttemptOutcome, DeviceInfo};
    use chrono::Utc;
    use tempfile::TempDir;

    fn attempt(identity: &str, outcome: AttemptOutcome, similarity: f32) -> NewAttempt {
        NewAttempt {
            identity: Identity::new(identity).unwrap(),
            probe_uri: Some("mem://attempts/p.jpg".into()),
            reference_uri: Some("mem://reference/r.jpg".into()),
            similarity: Some(similarity),
            outcome,
            error: None,
            device: DeviceInfo::current(Some("Simulated Camera".into()), None),
            recorded_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_append_chains_entries() {
        let dir = TempDir::new().unwrap();
        let log = JsonlVerificationLog::open(dir.path().join("logs/v.jsonl"), None).await.unwrap();

        let first = log.append(attempt("alice", AttemptOutcome::Success, 0.9)).await.unwrap();
        let second = log.append(attempt("bob", AttemptOutcome::Failed, 0.2)).await.unwrap();

        assert_eq!(first.sequence, 1);
        assert_eq!(first.prev_digest, GENESIS_DIGEST);
        assert_eq!(second.prev_digest, first.digest);
        assert_ne!(first.attempt.id, second.attempt.id);
        assert!(log.verify_chain().await.unwrap().is_intact());

        let alice = log.entries_for(&Identity::new("alice").unwrap()).await.unwrap();
        assert_eq!(alice.len(), 1);
        assert_eq!(alice[0].attempt.outcome, AttemptOutcome::Success);
    }

    #[tokio::test]
    async fn test_reopen_continues_chain() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("v.jsonl");
        let first = JsonlVerificationLog::open(&path, None).await.unwrap()
            .append(attempt("alice", AttemptOutcome::Failed, 0.1)).await.unwrap();

        let log = JsonlVerificationLog::open(&path, None).await.unwrap();
        let second = log.append(attempt("alice", AttemptOutcome::Success, 0.8)).await.unwrap();
        assert_eq!(second.sequence, 2);
        assert_eq!(second.prev_digest, first.digest);
        assert_eq!(log.verify_chain().await.unwrap().entries, 2);
    }

    #[tokio::test]
    async fn test_tampering_is_detected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("v.jsonl");
        let log = JsonlVerificationLog::open(&path, None).await.unwrap();
        log.append(attempt("alice", AttemptOutcome::Failed, 0.30)).await.unwrap();
        log.append(attempt("alice", AttemptOutcome::Failed, 0.40)).await.unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        std::fs::write(&path, contents.replacen("\"failed\"", "\"success\"", 1)).unwrap();

        let report = log.verify_chain().await.unwrap();
        assert_eq!(report.broken_at, Some(1));
    }

    #[tokio::test]
    async fn test_keyed_chain_rejects_wrong_key() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("v.jsonl");
        let keyed = JsonlVerificationLog::open(&path, Some(b"secret".to_vec())).await.unwrap();
        keyed.append(attempt("alice", AttemptOutcome::Success, 0.9)).await.unwrap();
        assert!(keyed.verify_chain().await.unwrap().keyed);
        assert!(keyed.verify_chain().await.unwrap().is_intact());

        let other = JsonlVerificationLog::open(&path, Some(b"other".to_vec())).await.unwrap();
        assert_eq!(other.verify_chain().await.unwrap().broken_at, Some(1));
    }

    #[tokio::test]
    async fn test_separate_handles_share_one_chain() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("v.jsonl");
        let kiosk = JsonlVerificationLog::open(&path, None).await.unwrap();
        let admin = JsonlVerificationLog::open(&path, None).await.unwrap();

        kiosk.append(attempt("alice", AttemptOutcome::Failed, 0.1)).await.unwrap();
        let second = admin.append(attempt("bob", AttemptOutcome::Success, 0.9)).await.unwrap();
        let third = kiosk.append(attempt("alice", AttemptOutcome::Success, 0.8)).await.unwrap();
        assert_eq!(second.sequence, 2);
        assert_eq!(third.sequence, 3);
        assert_eq!(third.prev_digest, second.digest);

        tokio::join!(
            async {
                for _ in 0..5 {
                    kiosk.append(attempt("alice", AttemptOutcome::Failed, 0.2)).await.unwrap();
                }
            },
            async {
                for _ in 0..5 {
                    admin.append(attempt("bob", AttemptOutcome::Failed, 0.2)).await.unwrap();
                }
            },
        );

        let report = kiosk.verify_chain().await.unwrap();
        assert_eq!(report.entries, 13);
        assert!(report.is_intact());
    }

    #[tokio::test]
    async fn test_failed_write_is_rolled_back() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("v.jsonl");
        let log = JsonlVerificationLog::open(&path, None).await.unwrap();
        log.append(attempt("alice", AttemptOutcome::Failed, 0.3)).await.unwrap();

        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        let len = file.metadata().unwrap().len();
        file.write_all(b"{\"sequence\":2,\"att").unwrap();
        let failed = rollback_on_error(&file, len, Err(io::Error::new(io::ErrorKind::Other, "disk full")));
        assert!(failed.is_err());
        assert_eq!(std::fs::metadata(&path).unwrap().len(), len);

        let next = log.append(attempt("alice", AttemptOutcome::Success, 0.9)).await.unwrap();
        assert_eq!(next.sequence, 2);
        assert!(log.verify_chain().await.unwrap().is_intact());
    }

    #[tokio::test]
    async fn test_memory_log() {
        let log = MemoryVerificationLog::new();
        log.append(attempt("alice", AttemptOutcome::Error, 0.0)).await.unwrap();
        assert_eq!(log.len().await, 1);
        assert!(log.verify_chain().await.unwrap().is_intact());

        log.set_unavailable(true);
        assert!(log.append(attempt("alice", AttemptOutcome::Error, 0.0)).await.is_err());
        assert_eq!(log.len().await, 1);
    }
}

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::camera::{CameraBackend, SimulatedCamera, V4l2Backend};
use crate::common::config::{CameraBackendKind, MatcherKind};
use crate::common::{paths, Config, DevMode, PunchError, Result};
use crate::core::{
    Collaborators, FaceMatcher, FixedMatcher, Identity, IdenticalImageMatcher, Mode, VerificationOrchestrator,
};
use crate::service::ServiceMatcher;
use crate::storage::{FileReferenceStore, FsBlobStore, JsonlVerificationLog};

/// Collaborators built from configuration, shared by every command.
pub struct AppContext {
    pub config: Config,
    pub dev_mode: DevMode,
    pub data_dir: PathBuf,
    pub deps: Collaborators,
}

impl AppContext {
    pub async fn build(config: Config, dev_mode: DevMode) -> Result<Self> {
        if !dev_mode.is_enabled() {
            config.validate_for_production()?;
        }

        let data_dir = dev_mode.data_dir(&config.storage.data_dir);
        tracing::info!("Using data directory {}", data_dir.display());

        let camera: Arc<dyn CameraBackend> = match config.camera.backend {
            CameraBackendKind::V4l2 => Arc::new(V4l2Backend::new(&config.camera)),
            CameraBackendKind::Simulated => Arc::new(SimulatedCamera::new()),
        };

        let matcher: Arc<dyn FaceMatcher> = match config.matcher.kind {
            MatcherKind::Service => Arc::new(ServiceMatcher::new(
                config.matcher.socket_path.clone(),
                Duration::from_millis(config.matcher.timeout_ms),
            )),
            MatcherKind::Fixed => {
                let score = config.matcher.fixed_score.unwrap_or(1.0);
                Arc::new(FixedMatcher::new(score).map_err(|e| PunchError::Config(e.to_string()))?)
            }
            MatcherKind::Identical => {
                Arc::new(IdenticalImageMatcher::new(0.0).map_err(|e| PunchError::Config(e.to_string()))?)
            }
        };

        let key = match &config.storage.log_hmac_key_file {
            Some(path) => Some(read_log_key(path)?),
            None => None,
        };

        let deps = Collaborators {
            camera,
            matcher,
            blobs: Arc::new(FsBlobStore::new(paths::blobs_dir(&data_dir))?),
            references: Arc::new(FileReferenceStore::new(paths::references_dir(&data_dir))?),
            log: Arc::new(JsonlVerificationLog::open(paths::verification_log_file(&data_dir), key).await?),
        };

        Ok(Self { config, dev_mode, data_dir, deps })
    }

    pub fn orchestrator(&self, mode: Mode, identity: Identity) -> VerificationOrchestrator {
        VerificationOrchestrator::new(mode, identity, self.deps.clone(), self.config.orchestrator_settings())
    }
}

fn read_log_key(path: &Path) -> Result<Vec<u8>> {
    let mut key = std::fs::read(path)
        .map_err(|e| PunchError::Config(format!("Cannot read log key {}: {}", path.display(), e)))?;
    while key.last().map_or(false, |b| b.is_ascii_whitespace()) {
        key.pop();
    }
    if key.is_empty() {
        return Err(PunchError::Config(format!("Log key file {} is empty", path.display())));
    }
    Ok(key)
}

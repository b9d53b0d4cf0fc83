use std::time::Duration;

use crate::camera::{CameraBackend, CameraConstraints, CameraError, FacingMode, Frame, LiveSource, Resolution};

/// Exclusive, scoped ownership of one acquired camera.
///
/// The device is released by [`CameraSession::close`] or, failing that, when
/// the session is dropped. Closing twice is a no-op.
pub struct CameraSession {
    source: Option<Box<dyn LiveSource>>,
    label: String,
    resolution: Option<Resolution>,
    facing: Option<FacingMode>,
    ready: bool,
}

impl CameraSession {
    /// Acquires a device, relaxing to [`CameraConstraints::minimal`] once if
    /// the requested constraints cannot be met.
    pub async fn open(
        backend: &dyn CameraBackend,
        constraints: &CameraConstraints,
    ) -> Result<Self, CameraError> {
        tracing::debug!("Opening camera via {} backend", backend.name());

        let source = match backend.acquire(constraints).await {
            Ok(source) => source,
            Err(e @ CameraError::PermissionDenied(_)) => return Err(e),
            Err(e) if constraints.is_minimal() => return Err(e),
            Err(e) => {
                tracing::warn!("Camera rejected preferred constraints ({}); retrying with minimal set", e);
                backend.acquire(&CameraConstraints::minimal()).await?
            }
        };

        Ok(Self::from_source(source))
    }

    fn from_source(source: Box<dyn LiveSource>) -> Self {
        let label = source.label().to_string();
        let resolution = source.resolution();
        let facing = source.facing();
        tracing::debug!("Camera '{}' acquired ({:?})", label, resolution);

        Self { source: Some(source), label, resolution, facing, ready: false }
    }

    /// Suspends until the first frame arrives. Snapshotting before this
    /// resolves fails with [`CameraError::NoFrameAvailable`].
    pub async fn wait_ready(&mut self, timeout: Duration) -> Result<(), CameraError> {
        let source = self.source.as_mut()
            .ok_or_else(|| CameraError::DeviceUnavailable("camera session already closed".into()))?;

        match tokio::time::timeout(timeout, source.first_frame()).await {
            Ok(Ok(())) => {
                self.ready = true;
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(CameraError::DeviceUnavailable(format!(
                "camera produced no frame within {} ms", timeout.as_millis()
            ))),
        }
    }

    pub fn current_frame(&self) -> Result<Frame, CameraError> {
        if !self.ready {
            return Err(CameraError::NoFrameAvailable);
        }
        self.source.as_ref()
            .and_then(|source| source.latest_frame())
            .ok_or(CameraError::NoFrameAvailable)
    }

    pub fn close(&mut self) {
        if let Some(mut source) = self.source.take() {
            source.stop();
            self.ready = false;
            tracing::debug!("Camera '{}' released", self.label);
        }
    }

    pub fn is_open(&self) -> bool {
        self.source.is_some()
    }

    pub fn is_ready(&self) -> bool {
        self.ready && self.is_open()
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Negotiated native resolution, if the device reported one.
    pub fn resolution(&self) -> Option<Resolution> {
        self.resolution
    }

    pub fn facing(&self) -> Option<FacingMode> {
        self.facing
    }
}

impl Drop for CameraSession {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for CameraSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CameraSession")
            .field("label", &self.label)
            .field("resolution", &self.resolution)
            .field("open", &self.is_open())
            .field("ready", &self.ready)
            .finish()
    }
}

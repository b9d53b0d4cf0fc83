use chrono::Utc;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::camera::{CameraBackend, CameraConstraints, CameraError, CameraSession};
use crate::core::capturer::{CaptureSettings, FrameCapturer};
use crate::core::error::{ErrorKind, VerificationError};
use crate::core::matcher::{Decision, FaceMatcher, MatchPolicy, Similarity, DEFAULT_THRESHOLD};
use crate::core::model::{AttemptOutcome, CapturedImage, DeviceInfo, Identity, Mode, NewAttempt};
use crate::storage::{BlobPath, BlobPurpose, BlobStore, Enrollment, ReferenceStore, VerificationLog};

/// Everything the orchestrator talks to. Injected so tests and development
/// mode can substitute doubles.
#[derive(Clone)]
pub struct Collaborators {
    pub camera: Arc<dyn CameraBackend>,
    pub matcher: Arc<dyn FaceMatcher>,
    pub blobs: Arc<dyn BlobStore>,
    pub references: Arc<dyn ReferenceStore>,
    pub log: Arc<dyn VerificationLog>,
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub constraints: CameraConstraints,
    pub ready_timeout: Duration,
    pub countdown_ticks: u32,
    pub tick_interval: Duration,
    pub capture: CaptureSettings,
    pub similarity_threshold: f32,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            constraints: CameraConstraints::default(),
            ready_timeout: Duration::from_secs(5),
            countdown_ticks: 3,
            tick_interval: Duration::from_secs(1),
            capture: CaptureSettings::default(),
            similarity_threshold: DEFAULT_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolved {
    Success,
    Retry,
    Fatal(ErrorKind),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    Initializing,
    Live,
    Countdown { remaining: u32 },
    Captured,
    Submitting,
    Resolved(Resolved),
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            State::Idle => f.write_str("idle"),
            State::Initializing => f.write_str("initializing"),
            State::Live => f.write_str("live"),
            State::Countdown { remaining } => write!(f, "countdown ({})", remaining),
            State::Captured => f.write_str("captured"),
            State::Submitting => f.write_str("submitting"),
            State::Resolved(Resolved::Success) => f.write_str("resolved (success)"),
            State::Resolved(Resolved::Retry) => f.write_str("resolved (retry)"),
            State::Resolved(Resolved::Fatal(kind)) => write!(f, "resolved (fatal: {})", kind),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AttemptSummary {
    pub attempt_id: String,
    pub sequence: u64,
    pub similarity: Similarity,
    pub threshold: f32,
    pub probe_uri: String,
    pub reference_uri: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FatalReport {
    pub kind: ErrorKind,
    pub message: String,
    /// Id of the error row written to the verification log, if any.
    pub attempt_id: Option<String>,
}

impl FatalReport {
    pub fn user_message(&self) -> &'static str {
        self.kind.user_message()
    }
}

/// How a cycle ended. Fatal verdicts are also returned to the caller as the
/// corresponding [`VerificationError`].
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Registered(Enrollment),
    Verified(AttemptSummary),
    Retry(AttemptSummary),
    Fatal(FatalReport),
}

impl Verdict {
    pub fn resolved(&self) -> Resolved {
        match self {
            Verdict::Registered(_) | Verdict::Verified(_) => Resolved::Success,
            Verdict::Retry(_) => Resolved::Retry,
            Verdict::Fatal(report) => Resolved::Fatal(report.kind),
        }
    }
}

/// Receives lifecycle notifications. All methods default to no-ops.
pub trait VerificationObserver: Send {
    fn on_state(&mut self, _state: State) {}

    fn on_countdown(&mut self, _remaining: u32) {}

    fn on_resolved(&mut self, _verdict: &Verdict) {}

    fn on_cancelled(&mut self) {}
}

pub struct NoopObserver;

impl VerificationObserver for NoopObserver {}

/// Requests cancellation from outside the orchestrator (a signal handler, a
/// UI thread). Honored immediately while waiting for the camera or counting
/// down, otherwise at the start of the next operation. Submission is never
/// interrupted.
#[derive(Clone, Debug)]
pub struct CancelHandle {
    generation: Arc<watch::Sender<u64>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.generation.send_modify(|g| *g = g.wrapping_add(1));
    }
}

async fn cancellation(mut rx: watch::Receiver<u64>, seen: u64) {
    let closed = rx.wait_for(|generation| *generation != seen).await.is_err();
    if closed {
        std::future::pending::<()>().await;
    }
}

/// Drives one identity through camera acquisition, countdown capture,
/// review, and submission in either [`Mode`].
///
/// At most one camera session is open at a time, and it is closed on every
/// path out of the live states: capture, cancel, failure, reset and drop.
pub struct VerificationOrchestrator {
    mode: Mode,
    identity: Identity,
    deps: Collaborators,
    settings: OrchestratorSettings,
    capturer: FrameCapturer,
    policy: MatchPolicy,
    observer: Box<dyn VerificationObserver>,
    state: State,
    session: Option<CameraSession>,
    captured: Option<CapturedImage>,
    device: DeviceInfo,
    cancel: Arc<watch::Sender<u64>>,
    cancel_seen: u64,
    error_attempt: Option<String>,
}

impl VerificationOrchestrator {
    pub fn new(mode: Mode, identity: Identity, deps: Collaborators, settings: OrchestratorSettings) -> Self {
        let (cancel, _) = watch::channel(0u64);
        Self {
            mode,
            identity,
            capturer: FrameCapturer::new(settings.capture.clone()),
            policy: MatchPolicy::new(settings.similarity_threshold),
            deps,
            settings,
            observer: Box::new(NoopObserver),
            state: State::Idle,
            session: None,
            captured: None,
            device: DeviceInfo::current(None, None),
            cancel: Arc::new(cancel),
            cancel_seen: 0,
            error_attempt: None,
        }
    }

    pub fn with_observer(mut self, observer: impl VerificationObserver + 'static) -> Self {
        self.observer = Box::new(observer);
        self
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn captured(&self) -> Option<&CapturedImage> {
        self.captured.as_ref()
    }

    pub fn is_camera_open(&self) -> bool {
        self.session.as_ref().map_or(false, CameraSession::is_open)
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle { generation: Arc::clone(&self.cancel) }
    }

    /// Acquires the camera and waits for the first frame.
    /// Valid from `Idle` and after a retry verdict.
    pub async fn start(&mut self) -> Result<(), VerificationError> {
        self.guard_cancel()?;
        match self.state {
            State::Idle | State::Resolved(Resolved::Retry) => {}
            state => return Err(VerificationError::InvalidState { operation: "start", state }),
        }
        self.captured = None;
        self.error_attempt = None;
        self.go_live().await
    }

    /// Counts down, snapshots the current frame and releases the camera.
    ///
    /// If no frame is available yet the orchestrator stays live so the caller
    /// can try again.
    pub async fn capture(&mut self) -> Result<&CapturedImage, VerificationError> {
        self.guard_cancel()?;
        if self.state != State::Live {
            return Err(VerificationError::InvalidState { operation: "capture", state: self.state });
        }

        for remaining in (1..=self.settings.countdown_ticks).rev() {
            self.set_state(State::Countdown { remaining });
            self.observer.on_countdown(remaining);

            let cancelled = cancellation(self.cancel.subscribe(), self.cancel_seen);
            tokio::select! {
                _ = tokio::time::sleep(self.settings.tick_interval) => {}
                _ = cancelled => {
                    self.acknowledge_cancel();
                    self.abort();
                    return Err(VerificationError::Cancelled);
                }
            }
        }

        let grabbed = match self.session.as_ref() {
            Some(session) => self.capturer.grab(session),
            None => Err(CameraError::DeviceUnavailable("camera session is not open".into())),
        };
        let (frame, size) = match grabbed {
            Ok(grabbed) => grabbed,
            Err(CameraError::NoFrameAvailable) => {
                tracing::warn!("No frame available yet; staying live");
                self.set_state(State::Live);
                return Err(CameraError::NoFrameAvailable.into());
            }
            Err(e) => return Err(self.fail(e.into())),
        };
        self.close_camera();

        match self.capturer.encode(frame, size).await {
            Ok(image) => {
                tracing::info!("Captured {}x{} still ({} bytes)", image.width(), image.height(), image.bytes().len());
                self.set_state(State::Captured);
                Ok(&*self.captured.insert(image))
            }
            Err(e) => Err(self.fail(e.into())),
        }
    }

    /// Discards the capture and reopens the camera.
    pub async fn retake(&mut self) -> Result<(), VerificationError> {
        self.guard_cancel()?;
        if self.state != State::Captured {
            return Err(VerificationError::InvalidState { operation: "retake", state: self.state });
        }
        self.captured = None;
        self.go_live().await
    }

    /// Registers or verifies the capture. Every verification that reaches
    /// the matcher, and every failure after the reference lookup, leaves
    /// exactly one row in the verification log.
    pub async fn submit(&mut self) -> Result<Verdict, VerificationError> {
        self.guard_cancel()?;
        let image = match (self.state, self.captured.take()) {
            (State::Captured, Some(image)) => image,
            (state, _) => return Err(VerificationError::InvalidState { operation: "submit", state }),
        };
        self.set_state(State::Submitting);

        let result = match self.mode {
            Mode::Register => self.register(&image).await,
            Mode::Verify => self.verify(&image).await,
        };

        match result {
            Ok(verdict) => {
                self.set_state(State::Resolved(verdict.resolved()));
                self.observer.on_resolved(&verdict);
                Ok(verdict)
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Start, capture and submit without a review step.
    pub async fn run_once(&mut self) -> Result<Verdict, VerificationError> {
        self.start().await?;
        self.capture().await?;
        self.submit().await
    }

    /// Abandons the cycle: closes the camera, discards any capture and
    /// returns to `Idle`.
    pub fn cancel(&mut self) {
        self.acknowledge_cancel();
        self.abort();
    }

    /// Returns to `Idle` from any state, dropping any pending cancel.
    pub fn reset(&mut self) {
        self.acknowledge_cancel();
        self.close_camera();
        self.captured = None;
        self.error_attempt = None;
        if self.state != State::Idle {
            self.set_state(State::Idle);
        }
    }

    async fn go_live(&mut self) -> Result<(), VerificationError> {
        self.close_camera();
        self.set_state(State::Initializing);

        let cancelled = cancellation(self.cancel.subscribe(), self.cancel_seen);
        let opened = tokio::select! {
            result = self.open_session() => Some(result),
            _ = cancelled => None,
        };

        match opened {
            Some(Ok(())) => {
                self.set_state(State::Live);
                Ok(())
            }
            Some(Err(e)) => Err(self.fail(e.into())),
            None => {
                self.acknowledge_cancel();
                self.abort();
                Err(VerificationError::Cancelled)
            }
        }
    }

    async fn open_session(&mut self) -> Result<(), CameraError> {
        let camera = Arc::clone(&self.deps.camera);
        let timeout = self.settings.ready_timeout;

        let session = CameraSession::open(camera.as_ref(), &self.settings.constraints).await?;
        self.device = DeviceInfo::current(Some(session.label().to_string()), session.resolution());
        self.session.insert(session).wait_ready(timeout).await
    }

    async fn register(&mut self, image: &CapturedImage) -> Result<Verdict, VerificationError> {
        let path = BlobPath::new(BlobPurpose::Reference, &self.identity, image.captured_at());
        let uri = self.deps.blobs.upload(image.bytes(), &path).await
            .map_err(VerificationError::UploadFailed)?;

        let enrollment = self.deps.references.enroll(&self.identity, &uri).await
            .map_err(VerificationError::Storage)?;

        tracing::info!("Registered reference for {} at {}", self.identity, uri);
        Ok(Verdict::Registered(enrollment))
    }

    async fn verify(&mut self, image: &CapturedImage) -> Result<Verdict, VerificationError> {
        let reference = match self.deps.references.active(&self.identity).await {
            Ok(Some(reference)) => reference,
            Ok(None) => return Err(VerificationError::NoReferenceEnrolled(self.identity.clone())),
            Err(e) => return Err(self.log_failure(None, None, VerificationError::Storage(e)).await),
        };
        let reference_uri = reference.image_uri;

        let path = BlobPath::new(BlobPurpose::Attempt, &self.identity, image.captured_at());
        let probe_uri = match self.deps.blobs.upload(image.bytes(), &path).await {
            Ok(uri) => uri,
            Err(e) => {
                let error = VerificationError::UploadFailed(e);
                return Err(self.log_failure(None, Some(reference_uri), error).await);
            }
        };

        let reference_bytes = match self.deps.blobs.fetch(&reference_uri).await {
            Ok(bytes) => bytes,
            Err(e) => {
                let error = VerificationError::Storage(e);
                return Err(self.log_failure(Some(probe_uri), Some(reference_uri), error).await);
            }
        };

        let similarity = match self.deps.matcher.compare(image.bytes(), &reference_bytes).await {
            Ok(similarity) => similarity,
            Err(e) => return Err(self.log_failure(Some(probe_uri), Some(reference_uri), e.into()).await),
        };

        let decision = self.policy.decide(similarity);
        let outcome = match decision {
            Decision::Accept => AttemptOutcome::Success,
            Decision::Reject => AttemptOutcome::Failed,
        };
        let attempt = self.new_attempt(
            outcome,
            Some(probe_uri.clone()),
            Some(reference_uri.clone()),
            Some(similarity.value()),
            None,
        );
        let entry = self.deps.log.append(attempt).await.map_err(VerificationError::Storage)?;

        tracing::info!("Verification for {}: similarity {} vs threshold {} -> {}",
                       self.identity, similarity, self.policy.threshold(), outcome);

        let summary = AttemptSummary {
            attempt_id: entry.attempt.id,
            sequence: entry.sequence,
            similarity,
            threshold: self.policy.threshold(),
            probe_uri,
            reference_uri,
        };
        Ok(match decision {
            Decision::Accept => Verdict::Verified(summary),
            Decision::Reject => Verdict::Retry(summary),
        })
    }

    async fn log_failure(
        &mut self,
        probe_uri: Option<String>,
        reference_uri: Option<String>,
        error: VerificationError,
    ) -> VerificationError {
        let attempt = self.new_attempt(AttemptOutcome::Error, probe_uri, reference_uri, None, Some(error.to_string()));
        match self.deps.log.append(attempt).await {
            Ok(entry) => self.error_attempt = Some(entry.attempt.id),
            Err(e) => tracing::warn!("Could not log failed attempt for {}: {}", self.identity, e),
        }
        error
    }

    fn new_attempt(
        &self,
        outcome: AttemptOutcome,
        probe_uri: Option<String>,
        reference_uri: Option<String>,
        similarity: Option<f32>,
        error: Option<String>,
    ) -> NewAttempt {
        NewAttempt {
            identity: self.identity.clone(),
            probe_uri,
            reference_uri,
            similarity,
            outcome,
            error,
            device: self.device.clone(),
            recorded_at: Utc::now(),
        }
    }

    fn fail(&mut self, error: VerificationError) -> VerificationError {
        let report = FatalReport {
            kind: error.kind(),
            message: error.to_string(),
            attempt_id: self.error_attempt.take(),
        };
        tracing::error!("{} for {} failed: {}", self.mode, self.identity, error);

        self.close_camera();
        self.captured = None;
        self.set_state(State::Resolved(Resolved::Fatal(report.kind)));
        self.observer.on_resolved(&Verdict::Fatal(report));
        error
    }

    fn guard_cancel(&mut self) -> Result<(), VerificationError> {
        if *self.cancel.borrow() == self.cancel_seen {
            return Ok(());
        }
        self.acknowledge_cancel();
        self.abort();
        Err(VerificationError::Cancelled)
    }

    fn acknowledge_cancel(&mut self) {
        self.cancel_seen = *self.cancel.borrow();
    }

    fn abort(&mut self) {
        if !matches!(self.state, State::Idle | State::Resolved(_)) {
            tracing::info!("{} for {} cancelled", self.mode, self.identity);
        }
        self.close_camera();
        self.captured = None;
        if self.state != State::Idle {
            self.set_state(State::Idle);
        }
        self.observer.on_cancelled();
    }

    fn close_camera(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.close();
        }
    }

    fn set_state(&mut self, next: State) {
        tracing::debug!("{} [{}]: {} -> {}", self.mode, self.identity, self.state, next);
        self.state = next;
        self.observer.on_state(next);
    }
}

impl Drop for VerificationOrchestrator {
    fn drop(&mut self) {
        self.close_camera();
    }
}

pub mod attempts;
pub mod capturer;
pub mod error;
pub mod matcher;
pub mod model;
pub mod orchestrator;

pub use attempts::{AttemptPolicy, AttemptStatus};
pub use capturer::{CaptureSettings, FrameCapturer};
pub use error::{ErrorKind, VerificationError};
pub use matcher::{FaceMatcher, FixedMatcher, IdenticalImageMatcher, MatchError, MatchPolicy, Similarity};
pub use model::{
    AttemptOutcome, CapturedImage, DeviceInfo, EnrollmentReference, Identity, InvalidIdentity, Mode,
    NewAttempt, VerificationAttempt,
};
pub use orchestrator::{
    AttemptSummary, CancelHandle, Collaborators, FatalReport, OrchestratorSettings, Resolved, State,
    Verdict, VerificationObserver, VerificationOrchestrator,
};

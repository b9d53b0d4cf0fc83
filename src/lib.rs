// Core modules
pub mod camera;
pub mod cli;
pub mod common;
pub mod context;
pub mod core;
pub mod service;
pub mod storage;

// Re-export commonly used types
pub use common::{Config, DevMode, PunchError, Result};
pub use context::AppContext;
pub use core::{
    Collaborators, Identity, Mode, OrchestratorSettings, State, Verdict, VerificationError,
    VerificationOrchestrator,
};

//! End-to-end runs through the file-backed stores a `--dev` install uses.

use facepunch::common::paths;
use facepunch::core::{AttemptOutcome, ErrorKind, Resolved};
use facepunch::storage::{JsonlVerificationLog, ReferenceStore, VerificationLog};
use facepunch::{AppContext, Config, DevMode, Identity, Mode, State, Verdict};
use tempfile::TempDir;

const DEV_CONFIG: &str = r#"
    [camera]
    backend = "simulated"
    device_index = 0
    width = 640
    height = 480

    [capture]
    countdown_ticks = 0

    [attempts]
    max_attempts = 3
    lockout_seconds = 60

    [matcher]
    kind = "identical"
"#;

async fn dev_context(tmp: &TempDir, toml: &str) -> AppContext {
    let config = Config::from_toml(toml).unwrap();
    let dev_mode = DevMode::with_base_dir(true, tmp.path().to_path_buf()).unwrap();
    AppContext::build(config, dev_mode).await.unwrap()
}

#[tokio::test]
async fn enroll_and_verify_on_disk() {
    let tmp = TempDir::new().unwrap();
    let ctx = dev_context(&tmp, DEV_CONFIG).await;
    let alice = Identity::new("alice").unwrap();

    let verdict = ctx.orchestrator(Mode::Register, alice.clone()).run_once().await.unwrap();
    let reference = match verdict {
        Verdict::Registered(enrollment) => enrollment.reference,
        other => panic!("expected registration, got {:?}", other),
    };
    assert!(reference.image_uri.starts_with("file://"));

    let mut orch = ctx.orchestrator(Mode::Verify, alice.clone());
    assert!(matches!(orch.run_once().await.unwrap(), Verdict::Verified(_)));
    assert_eq!(orch.state(), State::Resolved(Resolved::Success));

    let stored = std::fs::read_dir(tmp.path().join("blobs").join("attempts")).unwrap().count();
    assert_eq!(stored, 1);

    let entries = ctx.deps.log.entries_for(&alice).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].attempt.outcome, AttemptOutcome::Success);
    assert!(ctx.deps.log.verify_chain().await.unwrap().is_intact());
}

#[tokio::test]
async fn state_survives_restart() {
    let tmp = TempDir::new().unwrap();
    let bob = Identity::new("bob").unwrap();

    {
        let ctx = dev_context(&tmp, DEV_CONFIG).await;
        ctx.orchestrator(Mode::Register, bob.clone()).run_once().await.unwrap();
        ctx.orchestrator(Mode::Verify, bob.clone()).run_once().await.unwrap();
    }

    let ctx = dev_context(&tmp, DEV_CONFIG).await;
    let active = ctx.deps.references.active(&bob).await.unwrap();
    assert!(active.is_some());

    ctx.orchestrator(Mode::Verify, bob.clone()).run_once().await.unwrap();
    let entries = ctx.deps.log.entries_for(&bob).await.unwrap();
    assert_eq!(entries.iter().map(|e| e.sequence).collect::<Vec<_>>(), vec![1, 2]);
    assert_eq!(entries[1].prev_digest, entries[0].digest);
}

#[tokio::test]
async fn unknown_identity_leaves_no_trace() {
    let tmp = TempDir::new().unwrap();
    let ctx = dev_context(&tmp, DEV_CONFIG).await;

    let err = ctx.orchestrator(Mode::Verify, Identity::new("nobody").unwrap())
        .run_once().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NoReferenceEnrolled);

    let log = JsonlVerificationLog::open(paths::verification_log_file(tmp.path()), None).await.unwrap();
    assert!(log.all_entries().await.unwrap().is_empty());
}

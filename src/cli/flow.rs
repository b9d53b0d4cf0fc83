use anyhow::{Context, Result};
use chrono::{Local, Utc};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};

use crate::camera::{CameraSession, V4l2Backend};
use crate::cli::terminal::{confirm, prompt_review, ReviewChoice, TerminalObserver};
use crate::context::AppContext;
use crate::core::{
    AttemptStatus, CancelHandle, FrameCapturer, Identity, Mode, Verdict, VerificationAttempt, VerificationError,
    VerificationOrchestrator,
};

/// First Ctrl-C cancels the running cycle, a second one exits.
fn install_interrupt_handler(handle: CancelHandle) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            handle.cancel();
        }
        if tokio::signal::ctrl_c().await.is_ok() {
            std::process::exit(130);
        }
    });
}

/// One capture with review. `Ok(None)` means the user cancelled.
async fn capture_and_submit<R: AsyncBufRead + Unpin>(
    orch: &mut VerificationOrchestrator,
    input: &mut Lines<R>,
) -> Result<Option<Verdict>, VerificationError> {
    orch.start().await?;
    loop {
        match orch.capture().await {
            Ok(_) => {}
            Err(VerificationError::Camera(crate::camera::CameraError::NoFrameAvailable)) => continue,
            Err(e) => return Err(e),
        }

        match prompt_review(input).await {
            ReviewChoice::Submit => return orch.submit().await.map(Some),
            ReviewChoice::Retake => orch.retake().await?,
            ReviewChoice::Cancel => {
                orch.cancel();
                return Ok(None);
            }
        }
    }
}

async fn run_cycle<R: AsyncBufRead + Unpin>(
    orch: &mut VerificationOrchestrator,
    input: &mut Lines<R>,
) -> Result<Option<Verdict>> {
    match capture_and_submit(orch, input).await {
        Ok(verdict) => Ok(verdict),
        Err(VerificationError::Cancelled) => Ok(None),
        // The observer has already shown the user-facing message.
        Err(e) => Err(anyhow::Error::new(e)),
    }
}

pub async fn enroll(ctx: &AppContext, identity: Identity) -> Result<()> {
    println!("Registering reference photo for {}", identity);
    let mut orch = ctx.orchestrator(Mode::Register, identity).with_observer(TerminalObserver::new());
    install_interrupt_handler(orch.cancel_handle());
    let mut input = BufReader::new(tokio::io::stdin()).lines();

    if let Some(Verdict::Registered(enrollment)) = run_cycle(&mut orch, &mut input).await? {
        println!("✅ Reference registered: {}", enrollment.reference.image_uri);
        if enrollment.deactivated > 0 {
            println!("   Replaced {} previous reference(s)", enrollment.deactivated);
        }
    }
    Ok(())
}

pub async fn verify(ctx: &AppContext, identity: Identity) -> Result<()> {
    println!("Verifying {}", identity);
    let policy = ctx.config.attempt_policy();
    let mut orch = ctx.orchestrator(Mode::Verify, identity.clone()).with_observer(TerminalObserver::new());
    install_interrupt_handler(orch.cancel_handle());
    let mut input = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let history: Vec<VerificationAttempt> = ctx.deps.log.entries_for(&identity).await?
            .into_iter()
            .map(|entry| entry.attempt)
            .collect();
        match policy.evaluate(&history, Utc::now()) {
            AttemptStatus::LockedOut { until } => {
                println!("🔒 Too many unsuccessful attempts. Try again after {}.",
                         until.with_timezone(&Local).format("%H:%M:%S"));
                return Ok(());
            }
            AttemptStatus::Allowed { remaining } => {
                tracing::debug!("{} attempt(s) remaining for {}", remaining, identity);
            }
        }

        match run_cycle(&mut orch, &mut input).await? {
            Some(Verdict::Verified(summary)) => {
                println!("✅ Verified (similarity {})", summary.similarity);
                return Ok(());
            }
            Some(Verdict::Retry(summary)) => {
                println!("❌ That photo did not match your reference (similarity {}).", summary.similarity);
                if !confirm(&mut input, "Try again?").await {
                    return Ok(());
                }
            }
            Some(other) => {
                tracing::warn!("Unexpected verdict in verify mode: {:?}", other);
                return Ok(());
            }
            None => return Ok(()),
        }
    }
}

pub fn detect_camera() -> Result<()> {
    println!("🔍 Detecting available cameras...\n");

    let cameras = V4l2Backend::list_cameras()?;
    if cameras.is_empty() {
        println!("❌ No cameras found!");
        println!("\nTroubleshooting:");
        println!("  1. Check if cameras are connected");
        println!("  2. Ensure you have permission to access /dev/video*");
        println!("  3. Add your user to the 'video' group");
        return Ok(());
    }

    for camera in &cameras {
        let marker = if camera.can_capture { "📷" } else { "  " };
        println!("{} {}", marker, camera);
    }

    println!("═══════════════════════════════════════════════════════");
    match V4l2Backend::detect_camera() {
        Ok(index) => {
            println!("✅ Auto-detected camera: /dev/video{}", index);
            println!("\nThis will be used when device_index = 999 (auto-detect)");
        }
        Err(e) => println!("⚠️  {}", e),
    }

    println!("\n📝 To pick a camera manually, set in the configuration:");
    println!("   [camera]");
    println!("   device_index = <NUMBER>");
    Ok(())
}

pub async fn test_camera(ctx: &AppContext) -> Result<()> {
    let settings = ctx.config.orchestrator_settings();
    let mut session = CameraSession::open(ctx.deps.camera.as_ref(), &settings.constraints).await?;
    session.wait_ready(settings.ready_timeout).await?;

    println!("📷 {} ({})", session.label(),
             session.resolution().map_or_else(|| "resolution not reported".to_string(), |r| r.to_string()));

    let still = FrameCapturer::new(settings.capture).snapshot(&session).await?;
    session.close();

    let path = ctx.dev_mode.get_capture_path("test_capture");
    std::fs::write(&path, still.bytes())
        .with_context(|| format!("Failed to write {}", path.display()))?;
    println!("✅ Saved {}x{} still to {}", still.width(), still.height(), path.display());
    Ok(())
}

pub async fn history(ctx: &AppContext, identity: Identity) -> Result<()> {
    let references = ctx.deps.references.history(&identity).await?;
    println!("References for {}:", identity);
    if references.is_empty() {
        println!("   (none registered)");
    }
    for reference in &references {
        println!("   {} {}  {}",
                 if reference.active { "●" } else { "○" },
                 reference.created_at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S"),
                 reference.image_uri);
    }

    let entries = ctx.deps.log.entries_for(&identity).await?;
    println!("\nAttempts ({}):", entries.len());
    for entry in &entries {
        let attempt = &entry.attempt;
        let similarity = attempt.similarity.map_or_else(|| "-".to_string(), |s| format!("{:.3}", s));
        println!("   #{:<5} {}  {:<7}  {:>6}  {}",
                 entry.sequence,
                 attempt.recorded_at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S"),
                 attempt.outcome,
                 similarity,
                 attempt.error.as_deref().unwrap_or(""));
    }
    Ok(())
}

pub async fn audit(ctx: &AppContext) -> Result<()> {
    let report = ctx.deps.log.verify_chain().await?;
    let digest = if report.keyed { "HMAC-SHA256" } else { "SHA-256" };
    match report.broken_at {
        None => {
            println!("✅ Verification log intact: {} entries ({})", report.entries, digest);
            Ok(())
        }
        Some(sequence) => {
            println!("❌ Verification log chain broken at entry #{} of {}", sequence, report.entries);
            anyhow::bail!("verification log failed integrity check")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{Config, DevMode};
    use tempfile::TempDir;

    const DEV_CONFIG: &str = r#"
        [camera]
        backend = "simulated"
        device_index = 0
        width = 320
        height = 240

        [capture]
        countdown_ticks = 0

        [attempts]
        max_attempts = 2
        lockout_seconds = 600

        [matcher]
        kind = "fixed"
        fixed_score = 0.2
    "#;

    async fn context(tmp: &TempDir) -> AppContext {
        let config = Config::from_toml(DEV_CONFIG).unwrap();
        let dev_mode = DevMode::with_base_dir(true, tmp.path().to_path_buf()).unwrap();
        AppContext::build(config, dev_mode).await.unwrap()
    }

    #[tokio::test]
    async fn test_review_retake_then_submit() {
        let tmp = TempDir::new().unwrap();
        let ctx = context(&tmp).await;
        let mut orch = ctx.orchestrator(Mode::Register, Identity::new("emp-1").unwrap());
        let mut input = BufReader::new(&b"r\ny\n"[..]).lines();

        let verdict = run_cycle(&mut orch, &mut input).await.unwrap();
        assert!(matches!(verdict, Some(Verdict::Registered(_))));
    }

    #[tokio::test]
    async fn test_cancel_at_review_returns_none() {
        let tmp = TempDir::new().unwrap();
        let ctx = context(&tmp).await;
        let mut orch = ctx.orchestrator(Mode::Register, Identity::new("emp-1").unwrap());
        let mut input = BufReader::new(&b"c\n"[..]).lines();

        assert!(run_cycle(&mut orch, &mut input).await.unwrap().is_none());
        assert!(ctx.deps.references.active(&Identity::new("emp-1").unwrap()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failed_verifications_feed_lockout() {
        let tmp = TempDir::new().unwrap();
        let ctx = context(&tmp).await;
        let identity = Identity::new("emp-1").unwrap();

        let mut register = ctx.orchestrator(Mode::Register, identity.clone());
        register.run_once().await.unwrap();

        let mut orch = ctx.orchestrator(Mode::Verify, identity.clone());
        for _ in 0..2 {
            let mut input = BufReader::new(&b"y\n"[..]).lines();
            assert!(matches!(run_cycle(&mut orch, &mut input).await.unwrap(), Some(Verdict::Retry(_))));
        }

        let history: Vec<VerificationAttempt> = ctx.deps.log.entries_for(&identity).await.unwrap()
            .into_iter().map(|e| e.attempt).collect();
        assert!(matches!(ctx.config.attempt_policy().evaluate(&history, Utc::now()),
                         AttemptStatus::LockedOut { .. }));
    }
}

use facepunch::{cli::flow, AppContext, Config, DevMode, Identity};

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "facepunch")]
#[command(about = "Camera capture and face verification for attendance")]
struct Cli {
    /// Enable development mode (local data directory, simulated devices allowed)
    #[arg(long, global = true)]
    dev: bool,

    /// Configuration file to use instead of the default location
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List video devices and show which one auto-detection picks
    DetectCamera,
    /// Open the configured camera and save one still
    TestCamera,
    /// Register a reference photo
    Enroll {
        #[arg(short, long)]
        identity: String,
    },
    /// Verify against the registered reference
    Verify {
        #[arg(short, long)]
        identity: String,
    },
    /// Show references and attempts for an identity
    History {
        #[arg(short, long)]
        identity: String,
    },
    /// Check the integrity of the verification log
    Audit,
}

#[tokio::main]
async fn main() -> Result<()> {
    let Cli { dev, config, command } = Cli::parse();

    // Setup logging based on mode
    setup_logging(dev);

    match command {
        Commands::DetectCamera => flow::detect_camera()?,
        Commands::TestCamera => flow::test_camera(&load_context(dev, config).await?).await?,
        Commands::Enroll { identity } => {
            let identity = Identity::new(identity)?;
            flow::enroll(&load_context(dev, config).await?, identity).await?
        }
        Commands::Verify { identity } => {
            let identity = Identity::new(identity)?;
            flow::verify(&load_context(dev, config).await?, identity).await?
        }
        Commands::History { identity } => {
            let identity = Identity::new(identity)?;
            flow::history(&load_context(dev, config).await?, identity).await?
        }
        Commands::Audit => flow::audit(&load_context(dev, config).await?).await?,
    }

    Ok(())
}

async fn load_context(dev: bool, config_path: Option<PathBuf>) -> Result<AppContext> {
    let dev_mode = DevMode::new(dev)?;
    let config_path = config_path.unwrap_or_else(|| dev_mode.config_file());
    let config = Config::load_from_path(&config_path)?;
    Ok(AppContext::build(config, dev_mode).await?)
}

fn setup_logging(dev_mode: bool) {
    if dev_mode {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_file(true)
            .with_line_number(true)
            .with_thread_ids(true)
            .init();
    } else {
        tracing_subscriber::fmt::init();
    }
}

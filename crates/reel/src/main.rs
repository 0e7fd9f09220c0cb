use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use reel::{
    telemetry, CaptureOptions, JsonFileStore, SessionController, SimulatedCapture,
    TracingObserver,
};
use reelconf::ReelConfig;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Recording session controller
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Config file, layered over /etc/reel and ~/.config/reel
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the effective configuration and where it came from
    Config,

    /// Record one session against the simulated capture device
    Demo {
        /// How long to record before stopping
        #[arg(long, default_value = "3")]
        seconds: u64,

        /// Pause this long halfway through (0 to skip)
        #[arg(long, default_value = "0")]
        pause_ms: u64,

        /// Per-session max duration in seconds, overriding the config
        #[arg(long)]
        max_duration: Option<u64>,

        /// Make the first N capture starts fail
        #[arg(long, default_value = "0")]
        fail_starts: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (config, sources) = ReelConfig::load_with_sources_from(cli.config.as_deref())
        .context("Failed to load configuration")?;

    match cli.command {
        Command::Config => {
            for file in &sources.files {
                eprintln!("# loaded {}", file.display());
            }
            for var in &sources.env_overrides {
                eprintln!("# override {}", var);
            }
            print!("{}", config.to_toml());
        }
        Command::Demo {
            seconds,
            pause_ms,
            max_duration,
            fail_starts,
        } => {
            telemetry::init(&config.telemetry.log_level)
                .context("Failed to initialize tracing")?;
            run_demo(config, seconds, pause_ms, max_duration, fail_starts).await?;
        }
    }

    Ok(())
}

async fn run_demo(
    config: ReelConfig,
    seconds: u64,
    pause_ms: u64,
    max_duration: Option<u64>,
    fail_starts: u32,
) -> Result<()> {
    let store = Arc::new(JsonFileStore::new(config.paths.metadata_dir.clone()));
    let capture = Arc::new(SimulatedCapture::new().failing_starts(fail_starts));
    let controller = SessionController::builder(config, capture)
        .store(store.clone())
        .observer(Arc::new(TracingObserver))
        .build()
        .context("Invalid configuration")?;

    controller.initialize().await?;

    let mut options = CaptureOptions::default().with_label("demo");
    if let Some(secs) = max_duration {
        options = options.with_max_duration(Duration::from_secs(secs));
    }
    let session_id = controller.start(options).await?;
    tracing::info!(session_id = %session_id, "recording for {}s", seconds);

    let total = Duration::from_secs(seconds);
    if pause_ms > 0 {
        let half = total / 2;
        tokio::time::sleep(half).await;
        controller.pause().await?;
        tokio::time::sleep(Duration::from_millis(pause_ms)).await;
        controller.resume().await?;
        tokio::time::sleep(total - half).await;
    } else {
        tokio::time::sleep(total).await;
    }

    // The max-duration deadline may already have ended the session.
    let result = match controller.stop().await {
        Ok(result) => Some(result),
        Err(err) if err.is_not_active() => None,
        Err(err) => return Err(err.into()),
    };

    match result {
        Some(result) => println!("{}", serde_json::to_string_pretty(&result)?),
        None => println!(
            "{}",
            serde_json::to_string_pretty(&store.read(&session_id).await?)?
        ),
    }

    controller.shutdown().await?;
    Ok(())
}

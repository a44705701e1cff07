//! portalshot: grab one frame of the screen through the desktop portal.
//!
//! ```text
//! portalshot ──► spawn_portal() ──► start_capture() ──► CaptureEvent
//!                                                           │
//!                              Succeeded: "captured WxH RGB (n bytes)"
//!                              Failed:    reason on stderr, exit 1
//! ```
//!
//! Log verbosity follows `RUST_LOG` (default `info`).

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use portalshot_core::{CaptureConfig, SourceKind};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "portalshot")]
#[command(about = "Capture a single screen frame through the screen-cast portal")]
#[command(version)]
struct Cli {
    /// JSON capture configuration (missing keys take their defaults)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Content the portal may offer: monitor, window, virtual
    #[arg(short, long = "source", value_delimiter = ',')]
    sources: Vec<SourceKind>,
}

fn load_config(path: Option<&Path>) -> Result<CaptureConfig> {
    let Some(path) = path else {
        return Ok(CaptureConfig::default());
    };
    let text = std::fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("Parsing {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = load_config(cli.config.as_deref())?;
    if !cli.sources.is_empty() {
        config.source_types = cli.sources;
    }
    config.validate().context("Invalid capture configuration")?;

    info!("portalshot v{}", env!("CARGO_PKG_VERSION"));
    run(config).await
}

#[cfg(target_os = "linux")]
async fn run(config: CaptureConfig) -> Result<()> {
    use portalshot_core::CaptureEvent;

    let (handle, mut events) = portalshot_capture::spawn_portal(config).await?;
    handle.start_capture()?;

    let outcome = events.recv().await;
    handle.shutdown();
    // The channel closes once the loop has finished its final cleanup.
    while events.recv().await.is_some() {}

    match outcome {
        Some(CaptureEvent::Succeeded(frame)) => {
            println!("captured {}x{} RGB ({} bytes)", frame.width, frame.height, frame.data.len());
            Ok(())
        }
        Some(CaptureEvent::Failed(e)) => {
            eprintln!("capture failed: {e}");
            std::process::exit(1);
        }
        None => anyhow::bail!("capture service stopped without an outcome"),
    }
}

#[cfg(not(target_os = "linux"))]
async fn run(_config: CaptureConfig) -> Result<()> {
    anyhow::bail!("the screen-cast portal is only available on Linux")
}

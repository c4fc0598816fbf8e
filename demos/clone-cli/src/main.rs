//! Command-line front end for radio clone transfers.
//!
//! The host side owns the serial port; clone operations run on the engine
//! side of an in-process bridge.
//!
//! Run with: cargo run -p radio-clone-cli -- --simulate download --out radio.img

mod config;

use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use radio_clone_bridge::{BridgedRuntime, EngineClient};
use radio_clone_core::{
    CloneError, CloneEvent, CloneTransport, DeviceKey, MemoryRow, ProgressStore,
};
use radio_clone_engine::{DeviceFamily, FamilyRegistry};
use radio_clone_serial::{SerialPortProvider, SimulatedRadio, TransportOwner};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{Overrides, PORT_ENV, Settings};

#[derive(Debug, Parser)]
#[command(name = "radio-clone", about = "Read and write radio channel memory")]
struct Args {
    /// TOML config file (default: $RADIO_CLONE_CONFIG)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Serial port (default: $RADIO_CLONE_PORT)
    #[arg(long, global = true)]
    port: Option<String>,

    /// Device key, e.g. p3107.CompactHandheld
    #[arg(long, global = true)]
    device: Option<String>,

    /// Override the family's baud rate
    #[arg(long, global = true)]
    baud: Option<u32>,

    /// Talk to a simulated radio instead of a serial port
    #[arg(long, global = true)]
    simulate: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Read the radio and save its image
    Download {
        #[arg(long)]
        out: PathBuf,
        /// Also write the populated channels as JSON
        #[arg(long)]
        rows: Option<PathBuf>,
    },
    /// Make the radio's channel table match the given rows
    Upload {
        /// JSON array of channel rows; channels not listed are erased
        #[arg(long)]
        rows: PathBuf,
        /// Base image to edit instead of downloading first
        #[arg(long)]
        image: Option<PathBuf>,
    },
    /// Write a saved image back to the radio
    Restore {
        #[arg(long)]
        image: PathBuf,
    },
    /// Download, re-upload unchanged, download again and compare
    Smoke {
        #[arg(long, default_value_t = 0)]
        max_diff_bytes: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let settings = Settings::load(args.config.as_deref())?.layered(
        std::env::var(PORT_ENV).ok(),
        Overrides {
            port: args.port.clone(),
            device: args.device.clone(),
            baud: args.baud,
        },
    );

    let key: DeviceKey = settings.device().parse()?;
    let registry = Arc::new(FamilyRegistry::builtin());
    let family = registry.get(&key)?;
    let context = settings.context();

    let owner = if args.simulate {
        tracing::info!("Using simulated radio");
        TransportOwner::new(simulated(&family))
    } else {
        let Some(port) = settings.port.clone() else {
            bail!("no serial port: pass --port, set {PORT_ENV}, or use --simulate");
        };
        TransportOwner::new(SerialPortProvider::new(port))
    };
    let info = owner.open(context.baud_rate(family.baud_rate)).await?;
    tracing::info!(baud_rate = info.baud_rate, device = %key, "Serial session open");
    let owner = Arc::new(owner);

    let progress = ProgressStore::shared();
    let logger = tokio::spawn(log_progress(Arc::clone(&progress)));
    let mut runtime = BridgedRuntime::start(
        Arc::clone(&owner) as Arc<dyn CloneTransport>,
        registry,
        context,
        progress,
    );

    let result = run(&runtime.client(), &key, args.command).await;

    runtime.shutdown();
    logger.abort();
    if let Err(e) = owner.close().await {
        tracing::warn!("Failed to close serial session: {e}");
    }
    if let Some(err) = result.as_ref().err().and_then(clone_error) {
        tracing::error!(class = ?err.class(), retryable = err.is_retryable(), "{}", err.hint());
    }
    result
}

/// The clone failure behind `err`, if it came from a radio operation.
fn clone_error(err: &anyhow::Error) -> Option<&CloneError> {
    err.downcast_ref::<CloneError>()
}

async fn run(client: &EngineClient, key: &DeviceKey, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Download { out, rows } => {
            let summary = client.download(key).await?;
            let image = client.export_image(key).await?;
            std::fs::write(&out, image.bytes())
                .with_context(|| format!("writing {}", out.display()))?;
            tracing::info!(size = summary.size, path = %out.display(), "Saved image");

            let json = serde_json::to_string_pretty(&summary.rows)?;
            match rows {
                Some(path) => std::fs::write(&path, json)
                    .with_context(|| format!("writing {}", path.display()))?,
                None => println!("{json}"),
            }
        }
        Command::Upload { rows, image } => {
            let text = std::fs::read_to_string(&rows)
                .with_context(|| format!("reading {}", rows.display()))?;
            let rows: Vec<MemoryRow> = serde_json::from_str(&text)
                .with_context(|| format!("parsing {}", rows.display()))?;

            match image {
                Some(path) => {
                    let bytes = std::fs::read(&path)
                        .with_context(|| format!("reading {}", path.display()))?;
                    client.import_image(key, bytes).await?;
                }
                None => {
                    client.download(key).await?;
                }
            }
            let summary = client.upload(key, rows).await?;
            tracing::info!(changed = summary.changed, "Upload complete");
        }
        Command::Restore { image } => {
            let bytes = std::fs::read(&image)
                .with_context(|| format!("reading {}", image.display()))?;
            client.import_image(key, bytes.clone()).await?;
            let summary = client.upload_image(key, bytes).await?;
            tracing::info!(size = summary.size, "Restore complete");
        }
        Command::Smoke { max_diff_bytes } => smoke(client, key, max_diff_bytes).await?,
    }
    Ok(())
}

/// Round-trip the radio's own image and check nothing drifted.
async fn smoke(client: &EngineClient, key: &DeviceKey, max_diff_bytes: usize) -> anyhow::Result<()> {
    client.download(key).await?;
    let before = client.export_image(key).await?;

    client.upload_image(key, before.bytes().to_vec()).await?;
    client.download(key).await?;
    let after = client.export_image(key).await?;

    let diff = diff_bytes(before.bytes(), after.bytes());
    tracing::info!(diff, max_diff_bytes, "Smoke comparison");
    if diff > max_diff_bytes {
        bail!("image changed in {diff} bytes after an unchanged upload (allowed {max_diff_bytes})");
    }
    Ok(())
}

fn diff_bytes(a: &[u8], b: &[u8]) -> usize {
    let common = a.iter().zip(b).filter(|(x, y)| x != y).count();
    common + a.len().abs_diff(b.len())
}

async fn log_progress(progress: Arc<ProgressStore>) {
    let mut events = progress.get_receiver();
    while let Ok(event) = events.recv().await {
        match &event {
            CloneEvent::Finished { ok: false } => tracing::warn!("Radio operation failed"),
            CloneEvent::Finished { ok: true } => tracing::info!("Radio operation finished"),
            _ => tracing::debug!("{event}"),
        }
    }
}

/// A radio with one stored channel, answering like the given family.
fn simulated(family: &DeviceFamily) -> SimulatedRadio {
    let mut memory = vec![0xFF; family.memory_size];
    let mut ident = family.signatures.first().cloned().unwrap_or_default();
    ident.resize(8, 0);
    if let Ok(range) = family.layout.record(1) {
        // 146.520 MHz simplex
        let record = &mut memory[range];
        record[..8].copy_from_slice(&[0x00, 0x20, 0x65, 0x14, 0x00, 0x20, 0x65, 0x14]);
        record[12] = 0x08;
    }
    SimulatedRadio::new(&family.program_command, &ident, memory)
}

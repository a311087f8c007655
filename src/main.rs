mod cli;
mod commands;

use anyhow::Result;
use clap::Parser;
use crate::cli::VerifyMode;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Resumable over-the-air firmware updater", long_about = None)]
pub struct Args {
    /// Image URL to install directly (optional, if provided the metadata check is skipped)
    #[arg(index = 1)]
    url: Option<String>,

    /// Device identifier used to pick the metadata file (overrides --settings)
    #[arg(short = 'i', long = "device-id")]
    device_id: Option<String>,

    /// Version currently installed on the device
    #[arg(long = "installed-version")]
    installed_version: Option<String>,

    /// Base URL of the update server (overrides the config file)
    #[arg(short = 's', long)]
    server: Option<String>,

    /// JSON settings file holding device_id and installed_version
    #[arg(long, default_value = "settings.json")]
    settings: PathBuf,

    /// JSON config file
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Image file standing in for the OTA partition
    #[arg(short = 'p', long, default_value = "ota_partition.img")]
    partition: PathBuf,

    /// Only check for an update, do not install
    #[arg(long)]
    check: bool,

    /// Install without asking for confirmation
    #[arg(short = 'y', long)]
    yes: bool,

    /// Install even if the server version is not newer
    #[arg(long)]
    force: bool,

    /// Rate limit in bytes per second (e.g., 1048576 for 1MB/s)
    #[arg(short = 'r', long)]
    rate_limit: Option<u32>,

    /// Expected SHA-256 of the image
    #[arg(long)]
    sha256: Option<String>,

    /// Hash verification: auto (only when --sha256 given), on (require it), off (skip)
    #[arg(long = "verify-hash", value_enum, default_value = "auto")]
    verify_hash: VerifyMode,

    /// Show the state of an interrupted or installed update and exit
    #[arg(short = 'l', long)]
    status: bool,

    /// URL probed periodically to detect connectivity loss
    #[arg(long = "probe-url")]
    probe_url: Option<String>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        if args.status {
            let config = rota::OtaConfig::load(args.config.as_deref())?;
            return crate::commands::show_status(&args.partition, config.flash.block_size).await;
        }
        crate::commands::run_update(&args).await
    })
}

use anyhow::{bail, Context, Result};
use indicatif::{HumanBytes, ProgressBar, ProgressStyle};
use std::io::{BufRead, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use rota::checker::Availability;
use rota::hashing::calculate_hash;
use rota::partition::{BootMarker, FilePartition, Partition};
use rota::settings::{JsonSettings, MemorySettings, SettingsStore, DEVICE_ID_KEY};
use rota::state::SessionSnapshot;
use rota::utils::percent_of;
use rota::{ConnectivityMonitor, OtaConfig, ReqwestTransport, UpdateEvent, UpdateOrchestrator, UpdateState};

use crate::Args;

const INSTALLED_VERSION_KEY: &str = "installed_version";

fn load_settings(args: &Args) -> Result<Arc<dyn SettingsStore>> {
    if let Some(id) = &args.device_id {
        let mut settings = MemorySettings::default().with(DEVICE_ID_KEY, id);
        if let Some(version) = &args.installed_version {
            settings = settings.with(INSTALLED_VERSION_KEY, version);
        }
        return Ok(Arc::new(settings));
    }
    if args.settings.exists() {
        return Ok(Arc::new(JsonSettings::load(&args.settings)?));
    }
    warn!(path = ?args.settings, "Settings file not found and no --device-id given");
    Ok(Arc::new(MemorySettings::default()))
}

fn build_config(args: &Args) -> Result<OtaConfig> {
    let mut config = OtaConfig::load(args.config.as_deref())?;
    if let Some(server) = &args.server {
        config.server_url = server.clone();
    }
    if args.rate_limit.is_some() {
        config.download.rate_limit = args.rate_limit;
    }
    config.validate()?;
    Ok(config)
}

pub async fn run_update(args: &Args) -> Result<()> {
    let config = build_config(args)?;
    let expected_digest = args.verify_hash.expected_digest(args.sha256.clone())?;
    let settings = load_settings(args)?;
    let installed_version = args
        .installed_version
        .clone()
        .or_else(|| settings.get(INSTALLED_VERSION_KEY))
        .unwrap_or_else(|| "0.0.0".to_string());

    if let Some(parent) = args.partition.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .await
                .context("Failed to create partition directory")?;
        }
    }

    // Without a probe there is nothing to tell us the link is down.
    let connectivity = ConnectivityMonitor::new(args.probe_url.is_none());
    let probe = args
        .probe_url
        .clone()
        .map(|url| connectivity.spawn_probe(url, Duration::from_secs(2)));
    let callback = connectivity.register_callback(|online| {
        if online {
            info!("Network connected");
        } else {
            warn!("Network disconnected");
        }
    });

    let transport = Arc::new(ReqwestTransport::new(&config.download));
    let partition = FilePartition::new(&args.partition, config.flash.block_size);
    let (mut orchestrator, events) = UpdateOrchestrator::new(
        &config,
        transport,
        partition,
        connectivity.clone(),
        settings,
        installed_version,
    )
    .context("Invalid update server URL")?;
    orchestrator.expect_digest(expected_digest);
    if orchestrator.restore_session().await {
        let session = orchestrator.writer().session();
        println!(
            "Found interrupted download: {} of {} written",
            HumanBytes(session.bytes_written),
            HumanBytes(session.total_size)
        );
    }

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });
    }

    let reporter = tokio::spawn(report_events(events));
    let result = drive(&mut orchestrator, args, &cancel).await;
    // Closing the event channel lets the reporter finish.
    drop(orchestrator);
    reporter.await?;

    connectivity.unregister_callback(callback);
    if let Some(probe) = probe {
        probe.abort();
    }
    result
}

async fn drive(
    orchestrator: &mut UpdateOrchestrator<FilePartition>,
    args: &Args,
    cancel: &CancellationToken,
) -> Result<()> {
    let state = if let Some(url) = &args.url {
        orchestrator.install_from(url, cancel).await
    } else {
        let Some(result) = orchestrator.check_when_online(cancel).await else {
            bail!("No network connection, update check not possible");
        };
        let Ok(offer) = result else {
            bail!("{}", orchestrator.message().unwrap_or("Update check failed"));
        };
        if args.check {
            return Ok(());
        }
        if offer.availability != Availability::Newer && !args.force {
            println!(
                "Nothing to install ({}). Use --force to install version {} anyway.",
                offer.availability, offer.descriptor.version
            );
            return Ok(());
        }
        if !args.yes && !confirm(&offer.descriptor.version).await? {
            println!("Update declined.");
            return Ok(());
        }
        orchestrator.install_update(cancel).await
    };

    if state != UpdateState::Completed {
        bail!("{}", orchestrator.message().unwrap_or("Update failed"));
    }
    Ok(())
}

async fn confirm(version: &str) -> Result<bool> {
    let prompt = format!("Install version {}? [y/N] ", version);
    tokio::task::spawn_blocking(move || -> Result<bool> {
        print!("{}", prompt);
        std::io::stdout().flush()?;
        let mut answer = String::new();
        std::io::stdin().lock().read_line(&mut answer)?;
        Ok(matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"))
    })
    .await?
}

async fn report_events(mut events: UnboundedReceiver<UpdateEvent>) {
    let bar = ProgressBar::hidden();
    bar.set_length(100);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos:>3}% {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );

    while let Some(event) = events.recv().await {
        match event {
            UpdateEvent::StateChanged { state, message } => {
                if state == UpdateState::Downloading && bar.is_hidden() {
                    bar.set_draw_target(indicatif::ProgressDrawTarget::stderr());
                }
                let line = match message {
                    Some(message) => format!("[{}] {}", state, message),
                    None => format!("[{}]", state),
                };
                if bar.is_hidden() {
                    println!("{}", line);
                } else {
                    bar.println(line);
                }
            }
            UpdateEvent::Offer(offer) => {
                info!(
                    installed = %offer.installed_version,
                    available = %offer.descriptor.version,
                    "Update offer"
                );
            }
            UpdateEvent::Progress(percent) => bar.set_position(percent as u64),
            UpdateEvent::Speed(bytes_per_sec) => {
                bar.set_message(format!("{}/s", HumanBytes(bytes_per_sec as u64)));
            }
        }
    }
    bar.finish_and_clear();
}

pub async fn show_status(partition: &Path, block_size: usize) -> Result<()> {
    let partition = FilePartition::new(partition, block_size);
    let image = partition.path();

    println!("{:<40} {:<15} {:<15} {:<15}", "Image", "Status", "Progress", "Size");
    println!("{:-<40} {:-<15} {:-<15} {:-<15}", "", "", "", "");

    let name = image.display().to_string();
    let snapshot = match partition.snapshot_path() {
        Some(path) => SessionSnapshot::load(&path).await,
        None => None,
    };

    if let Some(snapshot) = snapshot {
        println!(
            "{:<40} {:<15} {:<15} {:<15}",
            name,
            "Paused",
            format!("{:.2}%", percent_of(snapshot.bytes_written, snapshot.total_size)),
            format!("{}", HumanBytes(snapshot.total_size))
        );
        println!();
        println!("Source:     {}", snapshot.url);
        println!("Written:    {} bytes", snapshot.bytes_written);
        println!("Updated at: {}", snapshot.updated_at.to_rfc3339());
        match calculate_hash(image, Some(snapshot.bytes_written)).await {
            Ok(hash) => println!("SHA-256 of written blocks: {}", hash),
            Err(e) => println!("Cannot read image: {}", e),
        }
        return Ok(());
    }

    if let Ok(content) = fs::read_to_string(partition.boot_marker_path()).await {
        if let Ok(marker) = serde_json::from_str::<BootMarker>(&content) {
            let size = fs::metadata(image).await.map(|m| m.len()).unwrap_or(0);
            println!(
                "{:<40} {:<15} {:<15} {:<15}",
                name,
                "Installed",
                "100.00%",
                format!("{}", HumanBytes(size))
            );
            println!();
            println!("Marked bootable at: {}", marker.marked_at.to_rfc3339());
            return Ok(());
        }
    }

    println!("No interrupted or installed update found for {:?}.", image);
    Ok(())
}

use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::checker::{UpdateChecker, UpdateOffer};
use crate::config::{OtaConfig, ResumeConfig};
use crate::connectivity::ConnectivityMonitor;
use crate::downloader::{DownloadObserver, Downloader};
use crate::error::CheckError;
use crate::flash::{FlashWriter, InstallOutcome};
use crate::hashing::digests_match;
use crate::partition::Partition;
use crate::settings::{SettingsStore, DEVICE_ID_KEY};
use crate::transport::Transport;
use crate::utils::{get_filename_from_url, percent_of};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateState {
    Idle,
    WaitingForConnectivity,
    CheckingMetadata,
    /// Metadata fetched; nothing is installed until the caller confirms.
    UpdateAvailable,
    Downloading,
    DownloadPaused,
    Completed,
    Error,
}

impl fmt::Display for UpdateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            UpdateState::Idle => "idle",
            UpdateState::WaitingForConnectivity => "waiting for connectivity",
            UpdateState::CheckingMetadata => "checking for update",
            UpdateState::UpdateAvailable => "update information received",
            UpdateState::Downloading => "downloading",
            UpdateState::DownloadPaused => "download paused",
            UpdateState::Completed => "completed",
            UpdateState::Error => "error",
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum UpdateEvent {
    StateChanged {
        state: UpdateState,
        message: Option<String>,
    },
    Offer(UpdateOffer),
    Progress(f64),
    Speed(f64),
}

struct EventObserver {
    events: UnboundedSender<UpdateEvent>,
}

impl DownloadObserver for EventObserver {
    fn on_progress(&self, percent: f64) {
        let _ = self.events.send(UpdateEvent::Progress(percent));
    }

    fn on_speed(&self, bytes_per_sec: f64) {
        let _ = self.events.send(UpdateEvent::Speed(bytes_per_sec));
    }
}

enum Reconnect {
    Online,
    TimedOut,
    Cancelled,
}

fn has_http_status(lower: &str, codes: &[u16]) -> bool {
    codes.iter().any(|code| lower.contains(&format!("http {}", code)))
}

/// Turn a raw error message into something a user can act on.
pub fn friendly_message(error: &str) -> String {
    let lower = error.to_lowercase();
    if has_http_status(&lower, &[404]) {
        "Update information not found for your device.\n\nThis hardware may not yet be supported.".to_string()
    } else if has_http_status(&lower, &[500, 502, 503]) {
        "Update server is temporarily unavailable.\n\nPlease try again in a few minutes.".to_string()
    } else if lower.contains("timeout") || lower.contains("timed out") {
        "Connection timeout.\n\nCheck your internet connection and try again.".to_string()
    } else if lower.contains("connection refused") {
        "Cannot connect to update server.\n\nCheck your internet connection.".to_string()
    } else if lower.contains("invalid json") || lower.contains("syntax error") {
        "Server returned invalid data.\n\nThe update server may be experiencing issues.\nTry again later."
            .to_string()
    } else if lower.contains("missing required fields") {
        "Update information is incomplete.\n\nThe update server may be experiencing issues.\nTry again later."
            .to_string()
    } else if lower.contains("enospc") || lower.contains("no space") {
        "Not enough storage space.\n\nFree up space and try again.".to_string()
    } else {
        format!("An error occurred:\n{}\n\nPlease try again.", error)
    }
}

/// Drives check, confirm, download, pause/resume and boot-swap for one device.
///
/// Owns the only [`FlashWriter`], so at most one OTA session can run at a time.
pub struct UpdateOrchestrator<P: Partition> {
    state: UpdateState,
    message: Option<String>,
    checker: UpdateChecker,
    writer: FlashWriter<P>,
    connectivity: Arc<ConnectivityMonitor>,
    settings: Arc<dyn SettingsStore>,
    installed_version: String,
    offer: Option<UpdateOffer>,
    download_url: Option<String>,
    expected_digest: Option<String>,
    resume: ResumeConfig,
    events: UnboundedSender<UpdateEvent>,
}

impl<P: Partition> UpdateOrchestrator<P> {
    pub fn new(
        config: &OtaConfig,
        transport: Arc<dyn Transport>,
        partition: P,
        connectivity: Arc<ConnectivityMonitor>,
        settings: Arc<dyn SettingsStore>,
        installed_version: impl Into<String>,
    ) -> Result<(Self, UnboundedReceiver<UpdateEvent>), url::ParseError> {
        let downloader = Arc::new(Downloader::new(transport, config.download.clone()));
        let checker = UpdateChecker::new(downloader.clone(), config)?;
        let writer = FlashWriter::new(
            downloader,
            partition,
            connectivity.clone(),
            config.flash.fill_byte,
        );
        let (events, rx) = mpsc::unbounded_channel();
        Ok((
            Self {
                state: UpdateState::Idle,
                message: None,
                checker,
                writer,
                connectivity,
                settings,
                installed_version: installed_version.into(),
                offer: None,
                download_url: None,
                expected_digest: None,
                resume: config.resume,
                events,
            },
            rx,
        ))
    }

    pub fn state(&self) -> UpdateState {
        self.state
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn offer(&self) -> Option<&UpdateOffer> {
        self.offer.as_ref()
    }

    pub fn installed_version(&self) -> &str {
        &self.installed_version
    }

    pub fn download_url(&self) -> Option<&str> {
        self.download_url.as_deref()
    }

    pub fn writer(&self) -> &FlashWriter<P> {
        &self.writer
    }

    /// Refuse the boot-swap unless the image hashes to this SHA-256.
    pub fn expect_digest(&mut self, digest: Option<String>) {
        self.expected_digest = digest;
    }

    /// Reload resume state persisted by an earlier run.
    pub async fn restore_session(&mut self) -> bool {
        let restored = self.writer.restore().await;
        if restored {
            self.download_url = self.writer.session().url.clone();
        }
        restored
    }

    fn set_state(&mut self, state: UpdateState, message: Option<String>) {
        info!("state change {:?} -> {:?}", self.state, state);
        self.state = state;
        self.message = message.clone();
        let _ = self.events.send(UpdateEvent::StateChanged { state, message });
    }

    /// React to a connectivity transition.
    ///
    /// Returns the metadata check result when coming online triggered one.
    pub async fn network_changed(&mut self, online: bool) -> Option<Result<UpdateOffer, CheckError>> {
        info!(online, state = ?self.state, "network changed");
        match (online, self.state) {
            (false, UpdateState::Idle | UpdateState::CheckingMetadata) => {
                self.set_state(
                    UpdateState::WaitingForConnectivity,
                    Some("Waiting for network connection...".to_string()),
                );
                None
            }
            (true, UpdateState::Idle | UpdateState::WaitingForConnectivity | UpdateState::Error) => {
                Some(self.check_for_update().await)
            }
            _ => None,
        }
    }

    /// Keep reacting to connectivity until a metadata check produced an
    /// answer other than "network unavailable".
    ///
    /// Gives up after the reconnect ceiling passes without a connectivity
    /// change, returning the last connectivity error if there was one.
    /// `None` when cancelled.
    pub async fn check_when_online(
        &mut self,
        cancel: &CancellationToken,
    ) -> Option<Result<UpdateOffer, CheckError>> {
        let mut changes = self.connectivity.subscribe();
        let mut online = *changes.borrow_and_update();
        let mut pending = None;
        loop {
            if let Some(result) = self.network_changed(online).await {
                if self.state != UpdateState::WaitingForConnectivity {
                    return Some(result);
                }
                pending = Some(result);
            }
            tokio::select! {
                changed = changes.changed() => {
                    if changed.is_err() {
                        return pending;
                    }
                }
                _ = tokio::time::sleep(self.resume.max_wait()) => {
                    warn!("No connectivity change within {:?}, giving up", self.resume.max_wait());
                    return pending;
                }
                _ = cancel.cancelled() => return None,
            }
            online = *changes.borrow_and_update();
        }
    }

    /// Fetch and validate the metadata for this device and compare versions.
    pub async fn check_for_update(&mut self) -> Result<UpdateOffer, CheckError> {
        self.set_state(
            UpdateState::CheckingMetadata,
            Some("Checking for OS updates...".to_string()),
        );
        let Some(device_id) = self.settings.get(DEVICE_ID_KEY) else {
            let err = CheckError::MissingDeviceId(DEVICE_ID_KEY.to_string());
            self.set_state(UpdateState::Error, Some(err.to_string()));
            return Err(err);
        };

        let result = match self.checker.fetch_update_info(&device_id).await {
            Ok(descriptor) => UpdateOffer::new(descriptor, &self.installed_version),
            Err(e) => Err(e),
        };
        match result {
            Ok(offer) => {
                let d = &offer.descriptor;
                let message = format!(
                    "{}: {}\n\nDetails:\n\n{}",
                    offer.availability, d.version, d.changelog
                );
                self.download_url = Some(d.download_url.clone());
                self.offer = Some(offer.clone());
                self.set_state(UpdateState::UpdateAvailable, Some(message));
                let _ = self.events.send(UpdateEvent::Offer(offer.clone()));
                Ok(offer)
            }
            Err(e) if e.is_connectivity() => {
                warn!("Network error while checking for updates, waiting for connectivity: {}", e);
                self.set_state(
                    UpdateState::WaitingForConnectivity,
                    Some("Waiting for network connection...".to_string()),
                );
                Err(e)
            }
            Err(e) => {
                warn!("Update check failed: {}", e);
                self.set_state(UpdateState::Error, Some(friendly_message(&e.to_string())));
                Err(e)
            }
        }
    }

    /// Install the image from the last successful check. Calling this is the
    /// user's confirmation.
    pub async fn install_update(&mut self, cancel: &CancellationToken) -> UpdateState {
        let Some(url) = self.download_url.clone() else {
            self.set_state(
                UpdateState::Error,
                Some("No update to install. Check for updates first.".to_string()),
            );
            return self.state;
        };
        self.run_install(&url, cancel).await
    }

    /// Install an explicitly named image, bypassing the metadata check.
    pub async fn install_from(&mut self, url: &str, cancel: &CancellationToken) -> UpdateState {
        self.download_url = Some(url.to_string());
        self.run_install(url, cancel).await
    }

    async fn run_install(&mut self, url: &str, cancel: &CancellationToken) -> UpdateState {
        if self.state == UpdateState::Completed {
            warn!("Update already installed, ignoring install request");
            return self.state;
        }
        let image = get_filename_from_url(url).unwrap_or_else(|_| url.to_string());
        info!(%url, %image, "Installing update");
        self.set_state(UpdateState::Downloading, None);
        let observer = EventObserver {
            events: self.events.clone(),
        };

        loop {
            let outcome = self.writer.download_and_install(url, cancel, &observer).await;
            match outcome {
                InstallOutcome::Installed {
                    bytes_written,
                    digest,
                } => {
                    self.finish_install(bytes_written, &digest).await;
                    return self.state;
                }
                InstallOutcome::Paused {
                    bytes_written,
                    total_size,
                } => {
                    self.set_state(
                        UpdateState::DownloadPaused,
                        Some(format!(
                            "Download paused at {:.1}% ({}/{} bytes). Waiting for network...",
                            percent_of(bytes_written, total_size),
                            bytes_written,
                            total_size
                        )),
                    );
                    match self.wait_for_reconnect(cancel).await {
                        Reconnect::Online => {
                            info!("Network reconnected, waiting for stabilization");
                            tokio::select! {
                                _ = tokio::time::sleep(self.resume.stabilization()) => {}
                                _ = cancel.cancelled() => {}
                            }
                            if cancel.is_cancelled() {
                                self.set_state(UpdateState::Error, Some(cancelled_message(bytes_written, total_size)));
                                return self.state;
                            }
                            self.set_state(
                                UpdateState::Downloading,
                                Some("Resuming download...".to_string()),
                            );
                        }
                        Reconnect::TimedOut => {
                            self.set_state(
                                UpdateState::Error,
                                Some(format!(
                                    "Network timeout during download.\n{}/{} bytes written.\nPress retry to resume.",
                                    bytes_written, total_size
                                )),
                            );
                            return self.state;
                        }
                        Reconnect::Cancelled => {
                            self.set_state(UpdateState::Error, Some(cancelled_message(bytes_written, total_size)));
                            return self.state;
                        }
                    }
                }
                InstallOutcome::Cancelled {
                    bytes_written,
                    total_size,
                } => {
                    self.set_state(UpdateState::Error, Some(cancelled_message(bytes_written, total_size)));
                    return self.state;
                }
                InstallOutcome::Failed {
                    error,
                    bytes_written,
                    total_size,
                } => {
                    let mut message = format!(
                        "{}\n\nProgress: {}/{} bytes",
                        friendly_message(&error),
                        bytes_written,
                        total_size
                    );
                    if bytes_written > 0 {
                        message.push_str("\n\nPress retry to resume.");
                    }
                    self.set_state(UpdateState::Error, Some(message));
                    return self.state;
                }
            }
        }
    }

    async fn finish_install(&mut self, bytes_written: u64, digest: &str) {
        if let Some(expected) = &self.expected_digest {
            if !digests_match(expected, digest) {
                warn!(expected = %expected, computed = %digest, "Image digest mismatch");
                self.set_state(
                    UpdateState::Error,
                    Some(format!(
                        "Downloaded image failed verification.\nExpected SHA-256 {}, got {}.\nPress retry to download again.",
                        expected, digest
                    )),
                );
                return;
            }
            info!(%digest, "Image digest verified");
        }
        self.set_state(
            UpdateState::Completed,
            Some(format!("Update installed ({} bytes). Restarting...", bytes_written)),
        );
        if let Err(e) = self.writer.boot_swap().await {
            self.set_state(
                UpdateState::Error,
                Some(format!("Could not activate the new image: {}", e)),
            );
        }
    }

    /// Wait for the link to return, polling as a fallback for missed
    /// notifications, for at most the configured ceiling.
    async fn wait_for_reconnect(&self, cancel: &CancellationToken) -> Reconnect {
        let mut changes = self.connectivity.subscribe();
        let mut ticker = tokio::time::interval(self.resume.poll_interval().max(Duration::from_millis(1)));
        let wait = async {
            loop {
                if self.connectivity.is_online() {
                    return Reconnect::Online;
                }
                tokio::select! {
                    _ = changes.changed() => {}
                    _ = ticker.tick() => {}
                    _ = cancel.cancelled() => return Reconnect::Cancelled,
                }
            }
        };
        tokio::time::timeout(self.resume.max_wait(), wait)
            .await
            .unwrap_or(Reconnect::TimedOut)
    }
}

fn cancelled_message(bytes_written: u64, total_size: u64) -> String {
    format!(
        "Update cancelled by user.\n\n{}/{} bytes downloaded.\nPress retry to resume.",
        bytes_written, total_size
    )
}

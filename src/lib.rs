//! Resilient over-the-air firmware updates.
//!
//! The pipeline has four layers:
//!
//! * [`downloader`] streams a URL in fixed-size chunks with per-chunk
//!   timeouts and retries, into memory, a file, or a [`ChunkSink`].
//! * [`checker`] fetches and validates the per-device update metadata and
//!   compares versions.
//! * [`flash`] writes the image into a [`Partition`] whole blocks at a time,
//!   so an interrupted transfer resumes with a `Range` request from the last
//!   committed block.
//! * [`orchestrator`] is the state machine tying these to connectivity
//!   changes and user confirmation.

pub mod checker;
pub mod config;
pub mod connectivity;
pub mod downloader;
pub mod error;
pub mod flash;
pub mod hashing;
pub mod orchestrator;
pub mod partition;
pub mod settings;
pub mod state;
pub mod transport;
pub mod utils;

pub use checker::{compare_versions, Availability, UpdateChecker, UpdateDescriptor, UpdateOffer, Version};
pub use config::OtaConfig;
pub use connectivity::ConnectivityMonitor;
pub use downloader::{ChunkSink, DownloadObserver, DownloadRequest, Downloaded, Downloader};
pub use error::{CheckError, DownloadError, FailureKind, PartitionError};
pub use flash::{FlashWriter, InstallOutcome};
pub use orchestrator::{friendly_message, UpdateEvent, UpdateOrchestrator, UpdateState};
pub use partition::{FilePartition, MemoryPartition, Partition};
pub use settings::{JsonSettings, MemorySettings, SettingsStore};
pub use transport::{ReqwestTransport, Transport};

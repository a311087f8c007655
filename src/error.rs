use thiserror::Error;

/// Substrings that mark an opaque transport failure as a flaky-link problem.
const NETWORK_INDICATORS: &[&str] = &[
    "-113",
    "-104",
    "-110",
    "-118",
    "econnaborted",
    "econnreset",
    "etimedout",
    "ehostunreach",
    "connection reset",
    "connection aborted",
    "timed out",
    "broken pipe",
    "network unreachable",
    "host unreachable",
];

#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("cannot use both an output file and a chunk sink")]
    InvalidDestination,

    #[error("HTTP {status} while fetching {url}")]
    HttpStatus { status: u16, url: String },

    #[error("failed to download chunk after retries ({attempts} attempts at byte {offset}): {last}")]
    ChunkReadExhausted {
        attempts: u32,
        offset: u64,
        last: String,
    },

    #[error("network error: {0}")]
    Network(String),

    #[error("network went offline")]
    Offline,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Storage(#[from] PartitionError),

    #[error("download cancelled by user")]
    Cancelled,

    #[error("server resumed at byte {actual}, expected {expected}")]
    RangeMismatch { expected: u64, actual: u64 },

    #[error("partial response without a usable Content-Range, expected start {expected}")]
    MissingContentRange { expected: u64 },
}

/// How a failed transfer should be handled by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The link dropped; pause and resume later.
    Transient,
    /// The caller asked us to stop.
    Cancelled,
    Other,
}

impl DownloadError {
    pub fn kind(&self) -> FailureKind {
        match self {
            DownloadError::Network(_)
            | DownloadError::Offline
            | DownloadError::ChunkReadExhausted { .. } => FailureKind::Transient,
            DownloadError::Cancelled => FailureKind::Cancelled,
            DownloadError::Transport(msg) if looks_like_network_error(msg) => {
                FailureKind::Transient
            }
            DownloadError::Io(e) if is_network_io(e) => FailureKind::Transient,
            _ => FailureKind::Other,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == FailureKind::Transient
    }
}

impl From<reqwest::Error> for DownloadError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() || e.is_body() || e.is_request() {
            DownloadError::Network(e.to_string())
        } else {
            DownloadError::Transport(e.to_string())
        }
    }
}

pub fn looks_like_network_error(message: &str) -> bool {
    let lower = message.to_lowercase();
    NETWORK_INDICATORS.iter().any(|i| lower.contains(i))
}

fn is_network_io(e: &std::io::Error) -> bool {
    use std::io::ErrorKind::*;
    matches!(
        e.kind(),
        ConnectionReset | ConnectionAborted | TimedOut | NotConnected | BrokenPipe
    ) || looks_like_network_error(&e.to_string())
}

#[derive(Error, Debug)]
pub enum PartitionError {
    #[error("block {index} has {len} bytes, expected {expected}")]
    BlockSize {
        index: u32,
        len: usize,
        expected: usize,
    },

    #[error("block {index} is outside the partition ({blocks} blocks)")]
    OutOfBounds { index: u32, blocks: u32 },

    #[error("partition I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("boot-swap failed: {0}")]
    BootSwap(String),
}

/// Metadata lookup failures. Validation problems mean the server answered
/// with bad data; transport problems mean we never got a usable answer.
#[derive(Error, Debug)]
pub enum CheckError {
    #[error("{0}")]
    Validation(String),

    #[error(transparent)]
    Transport(#[from] DownloadError),

    #[error("no device identifier configured (settings key `{0}`)")]
    MissingDeviceId(String),
}

impl CheckError {
    /// True when the failure is a connectivity problem worth waiting out.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, CheckError::Transport(e) if e.is_transient())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VersionError {
    #[error("empty version string")]
    Empty,
    #[error("invalid version component `{component}` in `{version}`")]
    Component { version: String, component: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhausted_chunk_reads_count_as_network_trouble() {
        let e = DownloadError::ChunkReadExhausted {
            attempts: 3,
            offset: 4096,
            last: "read timed out".into(),
        };
        assert!(e.to_string().contains("failed to download chunk after retries"));
        assert_eq!(e.kind(), FailureKind::Transient);
    }

    #[test]
    fn opaque_transport_messages_are_classified() {
        assert!(DownloadError::Transport("connection error: ECONNRESET".into()).is_transient());
        assert!(DownloadError::Transport("socket error -113".into()).is_transient());
        assert_eq!(
            DownloadError::Transport("certificate unknown".into()).kind(),
            FailureKind::Other
        );
    }

    #[test]
    fn io_reset_is_transient() {
        let e = DownloadError::Io(std::io::Error::from(std::io::ErrorKind::ConnectionReset));
        assert!(e.is_transient());
        let e = DownloadError::Io(std::io::Error::from(std::io::ErrorKind::PermissionDenied));
        assert_eq!(e.kind(), FailureKind::Other);
    }

    #[test]
    fn cancellation_is_distinct() {
        assert_eq!(DownloadError::Cancelled.kind(), FailureKind::Cancelled);
        assert!(!DownloadError::Cancelled.is_transient());
    }

    #[test]
    fn check_error_connectivity() {
        let e = CheckError::Transport(DownloadError::Network("connect refused".into()));
        assert!(e.is_connectivity());
        let e = CheckError::Transport(DownloadError::HttpStatus {
            status: 404,
            url: "x".into(),
        });
        assert!(!e.is_connectivity());
        assert!(!CheckError::Validation("bad".into()).is_connectivity());
    }
}

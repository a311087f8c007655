use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};
use url::Url;

use crate::config::OtaConfig;
use crate::downloader::Downloader;
use crate::error::{CheckError, DownloadError, VersionError};

const REQUIRED_FIELDS: [&str; 3] = ["version", "download_url", "changelog"];

/// The metadata document describing the latest build for a device.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct UpdateDescriptor {
    pub version: String,
    pub download_url: String,
    pub changelog: String,
}

impl UpdateDescriptor {
    /// Parse and validate a metadata body. Unknown fields are ignored.
    pub fn parse(body: &[u8]) -> Result<Self, CheckError> {
        let value: Value = serde_json::from_slice(body)
            .map_err(|e| CheckError::Validation(format!("Invalid JSON in update file: {}", e)))?;
        let Some(object) = value.as_object() else {
            return Err(CheckError::Validation(
                "Invalid JSON in update file: expected an object".to_string(),
            ));
        };

        let field = |name: &str| {
            object
                .get(name)
                .and_then(Value::as_str)
                .filter(|s| !s.trim().is_empty())
                .map(str::to_string)
        };
        let missing: Vec<&str> = REQUIRED_FIELDS
            .iter()
            .copied()
            .filter(|name| field(*name).is_none())
            .collect();
        if !missing.is_empty() {
            return Err(CheckError::Validation(format!(
                "Update file missing required fields: {}",
                missing.join(", ")
            )));
        }

        Ok(Self {
            version: field("version").unwrap_or_default(),
            download_url: field("download_url").unwrap_or_default(),
            changelog: field("changelog").unwrap_or_default(),
        })
    }
}

/// Dot-separated numeric version. Missing trailing components count as zero,
/// so `1.2` and `1.2.0` are equal.
#[derive(Debug, Clone)]
pub struct Version(Vec<u64>);

impl FromStr for Version {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(VersionError::Empty);
        }
        s.split('.')
            .map(|part| {
                part.trim().parse::<u64>().map_err(|_| VersionError::Component {
                    version: s.to_string(),
                    component: part.to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Version)
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.0.len().max(other.0.len());
        (0..len)
            .map(|i| {
                let a = self.0.get(i).copied().unwrap_or(0);
                let b = other.0.get(i).copied().unwrap_or(0);
                a.cmp(&b)
            })
            .find(|o| o.is_ne())
            .unwrap_or(Ordering::Equal)
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(u64::to_string).collect();
        f.write_str(&parts.join("."))
    }
}

/// Three-way numeric comparison of two version strings.
pub fn compare_versions(a: &str, b: &str) -> Result<Ordering, VersionError> {
    Ok(a.parse::<Version>()?.cmp(&b.parse::<Version>()?))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Availability {
    Newer,
    Older,
    Same,
}

impl From<Ordering> for Availability {
    fn from(o: Ordering) -> Self {
        match o {
            Ordering::Greater => Availability::Newer,
            Ordering::Less => Availability::Older,
            Ordering::Equal => Availability::Same,
        }
    }
}

impl fmt::Display for Availability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Availability::Newer => "newer version available",
            Availability::Older => "server version is older than installed",
            Availability::Same => "already up to date",
        })
    }
}

/// A checked descriptor together with how it relates to what is installed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpdateOffer {
    pub descriptor: UpdateDescriptor,
    pub installed_version: String,
    pub availability: Availability,
}

impl UpdateOffer {
    pub fn new(descriptor: UpdateDescriptor, installed_version: &str) -> Result<Self, CheckError> {
        let ordering = compare_versions(&descriptor.version, installed_version)
            .map_err(|e| CheckError::Validation(format!("Unusable version in update file: {}", e)))?;
        Ok(Self {
            descriptor,
            installed_version: installed_version.to_string(),
            availability: ordering.into(),
        })
    }
}

pub struct UpdateChecker {
    downloader: Arc<Downloader>,
    server_url: Url,
    reference_device: String,
    metadata_stem: String,
}

impl UpdateChecker {
    pub fn new(downloader: Arc<Downloader>, config: &OtaConfig) -> Result<Self, url::ParseError> {
        let mut base = config.server_url.clone();
        if !base.ends_with('/') {
            base.push('/');
        }
        Ok(Self {
            downloader,
            server_url: Url::parse(&base)?,
            reference_device: config.reference_device.clone(),
            metadata_stem: config.metadata_stem.clone(),
        })
    }

    /// The reference device reads `<stem>.json`; every other device `<stem>_<id>.json`.
    pub fn metadata_url(&self, device_id: &str) -> Result<Url, CheckError> {
        let file = if device_id == self.reference_device {
            format!("{}.json", self.metadata_stem)
        } else {
            format!("{}_{}.json", self.metadata_stem, device_id)
        };
        self.server_url
            .join(&file)
            .map_err(|e| CheckError::Transport(DownloadError::Transport(e.to_string())))
    }

    pub async fn fetch_update_info(&self, device_id: &str) -> Result<UpdateDescriptor, CheckError> {
        let url = self.metadata_url(device_id)?;
        info!(%url, "Fetching update info");
        let body = self.downloader.fetch_bytes(url.as_str()).await.map_err(|e| {
            warn!(%url, "Error fetching update info: {}", e);
            CheckError::Transport(e)
        })?;
        let descriptor = UpdateDescriptor::parse(&body)?;
        info!(
            version = %descriptor.version,
            download_url = %descriptor.download_url,
            "Update info received"
        );
        Ok(descriptor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_not_lexicographic() {
        assert_eq!(compare_versions("1.10.0", "1.9.9").unwrap(), Ordering::Greater);
        assert_eq!(compare_versions("1.9.9", "1.10.0").unwrap(), Ordering::Less);
        assert_eq!(compare_versions("1.2.3", "1.2.3").unwrap(), Ordering::Equal);
    }

    #[test]
    fn missing_components_are_zero() {
        assert_eq!(compare_versions("1.2", "1.2.0").unwrap(), Ordering::Equal);
        assert_eq!(compare_versions("1.2.0.1", "1.2").unwrap(), Ordering::Greater);
        assert_eq!("1.2".parse::<Version>().unwrap(), "1.2.0.0".parse().unwrap());
    }

    #[test]
    fn bad_versions_are_errors() {
        assert_eq!(compare_versions("", "1"), Err(VersionError::Empty));
        assert!(matches!(
            compare_versions("1.x", "1"),
            Err(VersionError::Component { .. })
        ));
    }

    #[test]
    fn descriptor_ignores_extra_fields() {
        let body = br#"{"version":"2.0.0","download_url":"https://x/fw.bin","changelog":"fix","size":5}"#;
        let d = UpdateDescriptor::parse(body).unwrap();
        assert_eq!(d.version, "2.0.0");
        assert_eq!(d.download_url, "https://x/fw.bin");
        assert_eq!(d.changelog, "fix");
    }

    #[test]
    fn descriptor_names_missing_fields() {
        let err = UpdateDescriptor::parse(br#"{"version":"2.0.0","changelog":""}"#).unwrap_err();
        let CheckError::Validation(msg) = err else {
            panic!("expected validation error");
        };
        assert_eq!(msg, "Update file missing required fields: download_url, changelog");
    }

    #[test]
    fn descriptor_rejects_bad_json() {
        let err = UpdateDescriptor::parse(b"not valid json {").unwrap_err();
        assert!(matches!(&err, CheckError::Validation(m) if m.contains("Invalid JSON")));
        let err = UpdateDescriptor::parse(b"[1]").unwrap_err();
        assert!(matches!(&err, CheckError::Validation(m) if m.contains("Invalid JSON")));
    }

    #[test]
    fn offer_reports_availability() {
        let d = UpdateDescriptor::parse(
            br#"{"version":"2.0.0","download_url":"https://x/fw.bin","changelog":"fix"}"#,
        )
        .unwrap();
        let offer = UpdateOffer::new(d.clone(), "1.0.0").unwrap();
        assert_eq!(offer.availability, Availability::Newer);
        assert_eq!(offer.availability.to_string(), "newer version available");
        assert_eq!(UpdateOffer::new(d.clone(), "2.0").unwrap().availability, Availability::Same);
        assert_eq!(UpdateOffer::new(d, "3").unwrap().availability, Availability::Older);
    }
}

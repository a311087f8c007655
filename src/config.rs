use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct OtaConfig {
    /// Directory URL holding the per-device metadata files.
    pub server_url: String,
    /// The device whose metadata file carries no identifier suffix.
    pub reference_device: String,
    pub metadata_stem: String,
    pub download: DownloadConfig,
    pub flash: FlashConfig,
    pub resume: ResumeConfig,
}

impl Default for OtaConfig {
    fn default() -> Self {
        Self {
            server_url: "https://updates.example.com/".to_string(),
            reference_device: "waveshare_esp32_s3_touch_lcd_2".to_string(),
            metadata_stem: "osupdate".to_string(),
            download: DownloadConfig::default(),
            flash: FlashConfig::default(),
            resume: ResumeConfig::default(),
        }
    }
}

impl OtaConfig {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        let config: OtaConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file {:?}", path))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.download.chunk_size > 0, "download.chunk_size must be > 0");
        anyhow::ensure!(self.download.max_retries > 0, "download.max_retries must be > 0");
        anyhow::ensure!(self.flash.block_size > 0, "flash.block_size must be > 0");
        anyhow::ensure!(
            self.download.fallback_total_size > 0,
            "download.fallback_total_size must be > 0"
        );
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct DownloadConfig {
    pub chunk_size: usize,
    pub max_retries: u32,
    pub chunk_timeout_secs: u64,
    /// Assumed body size when the server sends neither Content-Range nor Content-Length.
    pub fallback_total_size: u64,
    pub speed_interval_ms: u64,
    pub connect_timeout_secs: u64,
    pub user_agent: String,
    /// Bytes per second, unlimited when absent.
    pub rate_limit: Option<u32>,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            chunk_size: 4096,
            max_retries: 3,
            chunk_timeout_secs: 10,
            fallback_total_size: 100 * 1024,
            speed_interval_ms: 1000,
            connect_timeout_secs: 10,
            user_agent: concat!("rota/", env!("CARGO_PKG_VERSION")).to_string(),
            rate_limit: None,
        }
    }
}

impl DownloadConfig {
    pub fn chunk_timeout(&self) -> Duration {
        Duration::from_secs(self.chunk_timeout_secs)
    }

    pub fn speed_interval(&self) -> Duration {
        Duration::from_millis(self.speed_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy)]
#[serde(default)]
pub struct FlashConfig {
    pub block_size: usize,
    pub fill_byte: u8,
}

impl Default for FlashConfig {
    fn default() -> Self {
        Self {
            block_size: 4096,
            fill_byte: 0xFF,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy)]
#[serde(default)]
pub struct ResumeConfig {
    pub poll_interval_ms: u64,
    /// Give up waiting for the link after this long.
    pub max_wait_secs: u64,
    /// Settle time after the link returns, before the next range request.
    pub stabilization_ms: u64,
}

impl Default for ResumeConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2000,
            max_wait_secs: 300,
            stabilization_ms: 2000,
        }
    }
}

impl ResumeConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_secs(self.max_wait_secs)
    }

    pub fn stabilization(&self) -> Duration {
        Duration::from_millis(self.stabilization_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"flash": {{"block_size": 512}}, "server_url": "http://h/"}}"#).unwrap();
        let config = OtaConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.flash.block_size, 512);
        assert_eq!(config.flash.fill_byte, 0xFF);
        assert_eq!(config.server_url, "http://h/");
        assert_eq!(config.download.max_retries, 3);
        assert_eq!(config.resume.max_wait(), Duration::from_secs(300));
    }

    #[test]
    fn zero_block_size_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"flash": {{"block_size": 0}}}}"#).unwrap();
        assert!(OtaConfig::load(Some(file.path())).is_err());
    }

    #[test]
    fn no_path_means_defaults() {
        let config = OtaConfig::load(None).unwrap();
        assert_eq!(config.download.chunk_size, 4096);
        assert_eq!(config.download.fallback_total_size, 102_400);
    }
}

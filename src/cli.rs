use anyhow::{bail, Result};
use clap::ValueEnum;

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum VerifyMode {
    /// Verify only when a digest was supplied.
    Auto,
    /// Refuse to install without a digest.
    On,
    Off,
}

impl VerifyMode {
    /// The digest the installer should enforce, if any.
    pub fn expected_digest(self, sha256: Option<String>) -> Result<Option<String>> {
        match (self, sha256) {
            (VerifyMode::Off, _) => Ok(None),
            (VerifyMode::On, None) => bail!("--verify-hash on requires --sha256"),
            (_, Some(digest)) => {
                let digest = digest.trim().to_lowercase();
                if digest.len() != 64 || hex::decode(&digest).is_err() {
                    bail!("--sha256 must be 64 hex characters, got {:?}", digest);
                }
                Ok(Some(digest))
            }
            (VerifyMode::Auto, None) => Ok(None),
        }
    }
}

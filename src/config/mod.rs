//! Session Settings
//!
//! The settings the runtime consumes from the embedding host: TLS
//! material for the peer library, RDP credentials, the screen-share
//! mode, and view-only. Parsed from TOML; certificate and key files
//! are validated as PEM up front so a bad path fails at startup rather
//! than at the first connect.

use std::io::BufReader;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;
use tracing::debug;
use zeroize::Zeroize;

/// Settings errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    Io(PathBuf, std::io::Error),

    #[error("failed to parse settings: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("{0} contains no PEM certificate")]
    InvalidCertificate(PathBuf),

    #[error("{0} contains no PEM private key")]
    InvalidKey(PathBuf),
}

/// Result alias for settings operations.
pub type Result<T> = std::result::Result<T, ConfigError>;

/// How client layouts map to host capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScreenShareMode {
    /// Mirror the host's primary monitor.
    MirrorPrimary,
    /// Drive virtual monitors from the client layout.
    #[default]
    Extend,
}

/// RDP credentials; the password is wiped on drop.
#[derive(Debug, Clone, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Drop for Credentials {
    fn drop(&mut self) {
        self.password.zeroize();
    }
}

/// The session settings block.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SessionSettings {
    /// `rdp-server-cert`: PEM certificate chain for the peer library.
    pub rdp_server_cert: PathBuf,
    /// `rdp-server-key`: PEM private key for the peer library.
    pub rdp_server_key: PathBuf,
    /// `rdp-credentials`.
    pub rdp_credentials: Credentials,
    /// `rdp-screen-share-mode`.
    #[serde(default)]
    pub rdp_screen_share_mode: ScreenShareMode,
    /// `rdp-view-only`: suppress all input injection.
    #[serde(default)]
    pub rdp_view_only: bool,
}

impl SessionSettings {
    /// Parse settings from a TOML string.
    pub fn from_toml(toml: &str) -> Result<Self> {
        Ok(toml::from_str(toml)?)
    }

    /// Parse settings from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        Self::from_toml(&contents)
    }

    /// Validate the TLS material without loading it into the stack.
    pub fn validate_tls_material(&self) -> Result<()> {
        let file = std::fs::File::open(&self.rdp_server_cert)
            .map_err(|e| ConfigError::Io(self.rdp_server_cert.clone(), e))?;
        let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(file))
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| ConfigError::Io(self.rdp_server_cert.clone(), e))?;
        if certs.is_empty() {
            return Err(ConfigError::InvalidCertificate(
                self.rdp_server_cert.clone(),
            ));
        }

        let file = std::fs::File::open(&self.rdp_server_key)
            .map_err(|e| ConfigError::Io(self.rdp_server_key.clone(), e))?;
        let key = rustls_pemfile::private_key(&mut BufReader::new(file))
            .map_err(|e| ConfigError::Io(self.rdp_server_key.clone(), e))?;
        if key.is_none() {
            return Err(ConfigError::InvalidKey(self.rdp_server_key.clone()));
        }

        debug!("TLS material validated");
        Ok(())
    }
}

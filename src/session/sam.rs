//! SAM Credential Scratch File
//!
//! The peer library authenticates against a SAM-style file whose path
//! it receives through the settings. The file is created per session
//! and unlinked on post-connect, so the credentials spend as little
//! time on disk as possible.

use std::io::Write;
use std::path::PathBuf;

use tempfile::NamedTempFile;
use tracing::debug;
use zeroize::Zeroize;

/// The per-session SAM scratch file.
pub struct SamFile {
    file: Option<NamedTempFile>,
}

impl SamFile {
    /// Create the scratch file with the session credentials.
    pub fn create(username: &str, password: &str) -> std::io::Result<Self> {
        let mut file = tempfile::Builder::new()
            .prefix("grd-cred-")
            .suffix(".sam")
            .tempfile()?;

        let mut line = format!("user:{username}:{password}\n");
        file.write_all(line.as_bytes())?;
        file.flush()?;
        line.zeroize();

        debug!("SAM scratch file created at {:?}", file.path());
        Ok(SamFile { file: Some(file) })
    }

    /// Path handed to the peer library.
    pub fn path(&self) -> Option<PathBuf> {
        self.file.as_ref().map(|f| f.path().to_path_buf())
    }

    /// Unlink the file (post-connect). Idempotent.
    pub fn unlink(&mut self) {
        if let Some(file) = self.file.take() {
            debug!("unlinking SAM scratch file");
            let _ = file.close();
        }
    }
}

impl Drop for SamFile {
    fn drop(&mut self) {
        self.unlink();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_unlink() {
        let mut sam = SamFile::create("alice", "secret").unwrap();
        let path = sam.path().unwrap();
        assert!(path.exists());

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("alice"));

        sam.unlink();
        assert!(!path.exists());
        assert!(sam.path().is_none());

        // Idempotent.
        sam.unlink();
    }
}

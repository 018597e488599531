//! Raw payload capture for outcomes worth a second look.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("archive io error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Abstract `store(name, fingerprint, bytes)` channel.
#[async_trait]
pub trait Archiver: Send + Sync {
    /// Returns a url for the stored payload when the backend has one to offer.
    async fn store(
        &self,
        name: &str,
        fingerprint: &str,
        body: &[u8],
    ) -> Result<Option<String>, ArchiveError>;
}

/// Hex sha256 of a payload.
pub fn fingerprint(body: &[u8]) -> String {
    hex::encode(Sha256::digest(body))
}

/// Writes `<dir>/<name>.<fingerprint>.out`, once per distinct payload.
#[derive(Debug, Clone)]
pub struct FileArchiver {
    dir: PathBuf,
}

impl FileArchiver {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Creates the output directory.
    pub fn prepare(&self) -> Result<(), ArchiveError> {
        std::fs::create_dir_all(&self.dir).map_err(|source| ArchiveError::Io {
            path: self.dir.clone(),
            source,
        })
    }

    pub fn path_for(&self, name: &str, fingerprint: &str) -> PathBuf {
        self.dir.join(format!("{name}.{fingerprint}.out"))
    }
}

#[async_trait]
impl Archiver for FileArchiver {
    async fn store(
        &self,
        name: &str,
        fingerprint: &str,
        body: &[u8],
    ) -> Result<Option<String>, ArchiveError> {
        let path = self.path_for(name, fingerprint);
        let io_error = |source| ArchiveError::Io {
            path: path.clone(),
            source,
        };

        if tokio::fs::try_exists(&path).await.map_err(io_error)? {
            return Ok(None);
        }

        tokio::fs::write(&path, body).await.map_err(io_error)?;
        log::debug!("wrote {} bytes to file: {}", body.len(), path.display());
        Ok(None)
    }
}

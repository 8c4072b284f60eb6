//! Where cached block contents live: in memory or spilled to local files.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tempfile::TempDir;
use tokio::io::AsyncWriteExt;

/// Spill files hold decrypted block contents.
const SPILL_FILE_MODE: u32 = 0o600;

/// Contents of one cache slot.
#[derive(Debug, Default)]
pub(crate) enum Content {
    /// Admitted but not loaded yet (or released)
    #[default]
    Empty,
    Memory(Vec<u8>),
    Disk(PathBuf),
}

#[derive(Debug)]
pub(crate) enum Storage {
    Memory,
    /// The directory is private to the owner and removed when dropped.
    File { dir: TempDir, serial: AtomicU64 },
}

impl Storage {
    /// File storage in a fresh `<label>*` directory under `root`.
    pub(crate) fn file(root: &Path, label: &str) -> std::io::Result<Self> {
        std::fs::create_dir_all(root)?;
        let dir = tempfile::Builder::new().prefix(label).tempdir_in(root)?;
        tracing::debug!(dir = %dir.path().display(), "spill directory created");
        Ok(Storage::File {
            dir,
            serial: AtomicU64::new(0),
        })
    }

    pub(crate) fn dir(&self) -> Option<&Path> {
        match self {
            Storage::Memory => None,
            Storage::File { dir, .. } => Some(dir.path()),
        }
    }

    pub(crate) async fn load(&self, content: &Content) -> std::io::Result<Option<Vec<u8>>> {
        match content {
            Content::Empty => Ok(None),
            Content::Memory(data) => Ok(Some(data.clone())),
            Content::Disk(path) => Ok(Some(tokio::fs::read(path).await?)),
        }
    }

    /// Replace the slot's contents with `data`.
    ///
    /// Every admitted slot gets its own spill file name, so a file being
    /// removed for an evicted slot never collides with a readmitted one.
    pub(crate) async fn store(
        &self,
        content: &mut Content,
        index: u64,
        data: Vec<u8>,
    ) -> std::io::Result<()> {
        match self {
            Storage::Memory => {
                *content = Content::Memory(data);
            }
            Storage::File { dir, serial } => {
                let path = match content {
                    Content::Disk(path) => path.clone(),
                    _ => dir.path().join(format!(
                        "{index:016x}.{}",
                        serial.fetch_add(1, Ordering::Relaxed)
                    )),
                };
                let mut file = tokio::fs::OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .mode(SPILL_FILE_MODE)
                    .open(&path)
                    .await?;
                file.write_all(&data).await?;
                file.flush().await?;
                *content = Content::Disk(path);
            }
        }
        Ok(())
    }

    /// Drop the slot's contents, removing any spill file.
    pub(crate) async fn release(&self, content: &mut Content) {
        if let Content::Disk(path) = std::mem::take(content) {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                tracing::warn!(path = %path.display(), "failed to remove cache file: {}", e);
            }
        }
    }
}

//! Filesystem seam for channel file synchronization
//!
//! Channels never touch the disk directly; they go through this interface
//! so tests and embedders can supply their own storage layout.

use std::fs::{File, Metadata, OpenOptions};
use std::io;
use std::path::PathBuf;

/// The create/open/stat surface a channel needs for its file manifest.
///
/// Paths are relative to the channel; implementations decide where a
/// channel's files actually live.
pub trait FileSystem: Send + Sync + 'static {
    /// Create a file (and any missing parent directories) for a channel.
    fn create(&self, chain_id: &str, path: &str) -> io::Result<File>;

    /// Open an existing channel file with the given options.
    fn open_file(&self, chain_id: &str, path: &str, opts: &OpenOptions) -> io::Result<File>;

    /// Stat a channel file.
    fn stat(&self, chain_id: &str, path: &str) -> io::Result<Metadata>;
}

/// Disk-backed filesystem rooted at `base_dir/<chain_id>/`.
pub struct DiskFileSystem {
    base_dir: PathBuf,
}

impl DiskFileSystem {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    fn resolve(&self, chain_id: &str, path: &str) -> PathBuf {
        self.base_dir.join(chain_id).join(path)
    }
}

impl FileSystem for DiskFileSystem {
    fn create(&self, chain_id: &str, path: &str) -> io::Result<File> {
        let full = self.resolve(chain_id, path);
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent)?;
        }
        File::create(full)
    }

    fn open_file(&self, chain_id: &str, path: &str, opts: &OpenOptions) -> io::Result<File> {
        opts.open(self.resolve(chain_id, path))
    }

    fn stat(&self, chain_id: &str, path: &str) -> io::Result<Metadata> {
        std::fs::metadata(self.resolve(chain_id, path))
    }
}

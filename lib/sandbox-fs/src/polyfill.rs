//! Lifts a [`Basic`]-only backend into a full [`crate::Filesystem`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::{
    Basic, Capability, Chroot, ChrootFileSystem, Dir, File, FileOpener, FsError, Metadata,
    OpenOptions, OpenOptionsConfig, ReadDir, Result, SharedFileSystem, Symlink, TempFile, ops,
    path,
};

/// Answers [`FsError::Unsupported`] for directory listing and symlinks, and
/// derives temporary files and chroots from the basic operations.
///
/// `lstat` falls back to `stat`, since a backend without symlinks has no
/// link to describe.
#[derive(Debug)]
pub struct Polyfill<B> {
    basic: Arc<B>,
}

impl<B> Clone for Polyfill<B> {
    fn clone(&self) -> Self {
        Self {
            basic: self.basic.clone(),
        }
    }
}

impl<B: Basic> Polyfill<B> {
    pub fn new(basic: B) -> Self {
        Self {
            basic: Arc::new(basic),
        }
    }

    pub fn inner(&self) -> &B {
        &self.basic
    }
}

impl<B: Basic> FileOpener for Polyfill<B> {
    fn open_file(&self, path: &Path, conf: &OpenOptionsConfig) -> Result<Box<dyn File>> {
        self.basic.open_file(path, conf)
    }
}

impl<B: Basic> Basic for Polyfill<B> {
    fn new_open_options(&self) -> OpenOptions<'_> {
        OpenOptions::new(self)
    }

    fn stat(&self, path: &Path) -> Result<Metadata> {
        self.basic.stat(path)
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        self.basic.rename(from, to)
    }

    fn remove(&self, path: &Path) -> Result<()> {
        self.basic.remove(path)
    }

    fn join(&self, base: &Path, path: &Path) -> PathBuf {
        self.basic.join(base, path)
    }

    fn capabilities(&self) -> Capability {
        self.basic.capabilities()
    }
}

impl<B: Basic> TempFile for Polyfill<B> {
    fn temp_file(&self, dir: &Path, prefix: &str) -> Result<Box<dyn File>> {
        ops::temp_file(self, dir, prefix)
    }
}

impl<B: Basic> Dir for Polyfill<B> {
    fn read_dir(&self, _path: &Path) -> Result<ReadDir> {
        Err(FsError::Unsupported)
    }

    fn create_dir_all(&self, _path: &Path, _mode: u32) -> Result<()> {
        Err(FsError::Unsupported)
    }
}

impl<B: Basic> Symlink for Polyfill<B> {
    fn lstat(&self, path: &Path) -> Result<Metadata> {
        self.basic.stat(path)
    }

    fn symlink(&self, _target: &Path, _link: &Path) -> Result<()> {
        Err(FsError::Unsupported)
    }

    fn readlink(&self, _link: &Path) -> Result<PathBuf> {
        Err(FsError::Unsupported)
    }
}

impl<B: Basic + Send + Sync + 'static> Chroot for Polyfill<B> {
    fn chroot(&self, path: &Path) -> Result<SharedFileSystem> {
        Ok(Arc::new(ChrootFileSystem::new(
            Arc::new(self.clone()),
            path::to_absolute(path),
        )))
    }

    fn root(&self) -> &Path {
        Path::new("/")
    }
}

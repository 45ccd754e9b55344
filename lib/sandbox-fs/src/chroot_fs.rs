use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, trace};

use crate::named_file::NamedFile;
use crate::{
    Basic, Capability, Chroot, Dir, DirEntry, File, FileOpener, FsError, Metadata, OpenOptions,
    OpenOptionsConfig, ReadDir, Result, SharedFileSystem, Symlink, TempFile, path,
};

/// A [`crate::Filesystem`] confined to a subtree of another filesystem.
///
/// Every path is joined onto `base` before it is handed down, and any path
/// that climbs above its starting point once cleaned is rejected with
/// [`FsError::CrossedBoundary`] without reaching the wrapped filesystem.
///
/// The check is lexical. A symlink stored in the wrapped filesystem that
/// points outside of `base` is still followed by that filesystem; use
/// [`crate::root_fs::RootFileSystem`] when that matters.
#[derive(Debug, Clone)]
pub struct ChrootFileSystem {
    underlying: SharedFileSystem,
    base: PathBuf,
}

impl ChrootFileSystem {
    pub fn new(underlying: SharedFileSystem, base: impl AsRef<Path>) -> Self {
        Self {
            underlying,
            base: path::clean(base.as_ref()),
        }
    }

    pub fn underlying(&self) -> &SharedFileSystem {
        &self.underlying
    }

    fn prepare_path(&self, path: &Path) -> Result<PathBuf> {
        if path::is_crossing_boundary(path) {
            debug!(
                path = %path.display(),
                base = %self.base.display(),
                "path crosses the chroot boundary"
            );
            return Err(FsError::CrossedBoundary);
        }

        let full = path::join(&self.base, &path::clean(path));
        trace!(path = %path.display(), full = %full.display(), "chroot path");
        Ok(full)
    }

    /// `path` relative to the chroot, without any leading `/`.
    fn view_path(path: &Path) -> PathBuf {
        path::relativize(Path::new("/"), &path::to_absolute(path))
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

impl FileOpener for ChrootFileSystem {
    fn open_file(&self, path: &Path, conf: &OpenOptionsConfig) -> Result<Box<dyn File>> {
        let full = self.prepare_path(path)?;
        let file = self.underlying.open_file(&full, conf)?;
        Ok(NamedFile::boxed(file, path))
    }
}

impl Basic for ChrootFileSystem {
    fn new_open_options(&self) -> OpenOptions<'_> {
        OpenOptions::new(self)
    }

    fn stat(&self, path: &Path) -> Result<Metadata> {
        let full = self.prepare_path(path)?;
        let mut metadata = self.underlying.stat(&full)?;
        metadata.name = crate::metadata_name(path);
        Ok(metadata)
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        let from = self.prepare_path(from)?;
        let to = self.prepare_path(to)?;
        self.underlying.rename(&from, &to)
    }

    fn remove(&self, path: &Path) -> Result<()> {
        let full = self.prepare_path(path)?;
        self.underlying.remove(&full)
    }

    fn capabilities(&self) -> Capability {
        self.underlying.capabilities()
    }
}

impl TempFile for ChrootFileSystem {
    fn temp_file(&self, dir: &Path, prefix: &str) -> Result<Box<dyn File>> {
        let full = self.prepare_path(dir)?;
        let file = self.underlying.temp_file(&full, prefix)?;
        let name = path::join(dir, &path::base_name(file.name()));
        Ok(NamedFile::boxed(file, name))
    }
}

impl Dir for ChrootFileSystem {
    fn read_dir(&self, path: &Path) -> Result<ReadDir> {
        let full = self.prepare_path(path)?;
        let parent = path::to_absolute(path);

        let mut entries = Vec::new();
        for entry in self.underlying.read_dir(&full)? {
            let entry = entry?;
            let path = parent.join(entry.file_name());
            entries.push(DirEntry { path, ..entry });
        }

        Ok(ReadDir::new(entries))
    }

    fn create_dir_all(&self, path: &Path, mode: u32) -> Result<()> {
        let full = self.prepare_path(path)?;
        self.underlying.create_dir_all(&full, mode)
    }
}

impl Symlink for ChrootFileSystem {
    fn lstat(&self, path: &Path) -> Result<Metadata> {
        let full = self.prepare_path(path)?;
        let mut metadata = self.underlying.lstat(&full)?;
        metadata.name = crate::metadata_name(path);
        Ok(metadata)
    }

    fn symlink(&self, target: &Path, link: &Path) -> Result<()> {
        let full_link = self.prepare_path(link)?;

        let target = if target.is_absolute() {
            path::join(&self.base, &path::clean(target))
        } else {
            let link_dir = path::parent(&Self::view_path(link));
            if path::is_crossing_boundary(&path::join(&link_dir, target)) {
                debug!(
                    target = %target.display(),
                    link = %link.display(),
                    "symlink target crosses the chroot boundary"
                );
                return Err(FsError::CrossedBoundary);
            }
            target.to_path_buf()
        };

        self.underlying.symlink(&target, &full_link)
    }

    fn readlink(&self, link: &Path) -> Result<PathBuf> {
        let full = self.prepare_path(link)?;
        let target = self.underlying.readlink(&full)?;
        if !target.is_absolute() {
            return Ok(target);
        }

        match path::relativize(&self.base, &target) {
            Some(rel) => Ok(path::to_absolute(&rel)),
            None => {
                debug!(
                    target = %target.display(),
                    base = %self.base.display(),
                    "symlink target lies outside of the chroot"
                );
                Err(FsError::CrossedBoundary)
            }
        }
    }
}

impl Chroot for ChrootFileSystem {
    fn chroot(&self, path: &Path) -> Result<SharedFileSystem> {
        let full = self.prepare_path(path)?;
        Ok(Arc::new(ChrootFileSystem::new(self.underlying.clone(), full)))
    }

    fn root(&self) -> &Path {
        &self.base
    }
}

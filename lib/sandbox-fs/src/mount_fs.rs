//! Mounts a filesystem at a path of another one.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, trace};

use crate::named_file::NamedFile;
use crate::{
    Basic, Capability, Chroot, ChrootFileSystem, Dir, DirEntry, File, FileOpener, FileType,
    FsError, Metadata, OpenOptions, OpenOptionsConfig, ReadDir, Result, SharedFileSystem, Symlink,
    TempFile, path,
};

/// Routes every path at or below `mountpoint` to `source`, with the
/// mountpoint stripped, and everything else to `underlying`.
///
/// An entry cannot be renamed from one side of the mountpoint to the other
/// ([`FsError::CrossDevice`]) and the mountpoint itself cannot be removed or
/// renamed.
#[derive(Debug, Clone)]
pub struct MountFileSystem {
    underlying: SharedFileSystem,
    source: SharedFileSystem,
    mountpoint: PathBuf,
}

/// Which side of the mount a path lives on.
enum Target<'a> {
    Underlying(&'a SharedFileSystem, PathBuf),
    Source(&'a SharedFileSystem, PathBuf),
}

impl Target<'_> {
    fn fs(&self) -> &SharedFileSystem {
        match self {
            Target::Underlying(fs, _) | Target::Source(fs, _) => fs,
        }
    }

    fn path(&self) -> &Path {
        match self {
            Target::Underlying(_, path) | Target::Source(_, path) => path,
        }
    }

    fn is_source(&self) -> bool {
        matches!(self, Target::Source(..))
    }
}

impl MountFileSystem {
    pub fn new(
        underlying: SharedFileSystem,
        mountpoint: impl AsRef<Path>,
        source: SharedFileSystem,
    ) -> Self {
        Self {
            underlying,
            source,
            mountpoint: path::to_absolute(mountpoint.as_ref()),
        }
    }

    pub fn mountpoint(&self) -> &Path {
        &self.mountpoint
    }

    fn target(&self, path: &Path) -> Target<'_> {
        let full = path::to_absolute(path);
        match path::relativize(&self.mountpoint, &full) {
            Some(rel) => {
                let rel = path::to_absolute(&rel);
                trace!(path = %path.display(), mounted = %rel.display(), "path is mounted");
                Target::Source(&self.source, rel)
            }
            None => Target::Underlying(&self.underlying, full),
        }
    }

    fn is_mountpoint(&self, path: &Path) -> bool {
        path::to_absolute(path) == self.mountpoint
    }
}

impl FileOpener for MountFileSystem {
    fn open_file(&self, path: &Path, conf: &OpenOptionsConfig) -> Result<Box<dyn File>> {
        let target = self.target(path);
        let file = target.fs().open_file(target.path(), conf)?;
        Ok(NamedFile::boxed(file, path))
    }
}

impl Basic for MountFileSystem {
    fn new_open_options(&self) -> OpenOptions<'_> {
        OpenOptions::new(self)
    }

    fn stat(&self, path: &Path) -> Result<Metadata> {
        let target = self.target(path);
        let mut metadata = target.fs().stat(target.path())?;
        metadata.name = crate::metadata_name(path);
        Ok(metadata)
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        if self.is_mountpoint(from) || self.is_mountpoint(to) {
            return Err(FsError::BaseDirRename);
        }

        let from = self.target(from);
        let to = self.target(to);
        if from.is_source() != to.is_source() {
            debug!(
                from = %from.path().display(),
                to = %to.path().display(),
                "rename across the mountpoint"
            );
            return Err(FsError::CrossDevice);
        }

        from.fs().rename(from.path(), to.path())
    }

    fn remove(&self, path: &Path) -> Result<()> {
        if self.is_mountpoint(path) {
            return Err(FsError::BaseDirRemove);
        }

        let target = self.target(path);
        target.fs().remove(target.path())
    }

    fn capabilities(&self) -> Capability {
        self.underlying.capabilities() & self.source.capabilities()
    }
}

impl TempFile for MountFileSystem {
    fn temp_file(&self, dir: &Path, prefix: &str) -> Result<Box<dyn File>> {
        let target = self.target(dir);
        let file = target.fs().temp_file(target.path(), prefix)?;
        let name = path::join(dir, &path::base_name(file.name()));
        Ok(NamedFile::boxed(file, name))
    }
}

impl Dir for MountFileSystem {
    /// Lists `path` on the side it lives on. The mountpoint shows up as a
    /// directory in its parent's listing even if `underlying` has nothing
    /// there.
    fn read_dir(&self, path: &Path) -> Result<ReadDir> {
        let parent = path::to_absolute(path);
        let target = self.target(path);

        let mut entries = Vec::new();
        let listed = target.fs().read_dir(target.path());

        let shows_mountpoint = !target.is_source() && path::parent(&self.mountpoint) == parent;
        match listed {
            Ok(listed) => {
                for entry in listed {
                    let entry = entry?;
                    let path = parent.join(entry.file_name());
                    entries.push(DirEntry { path, ..entry });
                }
            }
            // The parent of the mountpoint may only exist because of it.
            Err(FsError::EntityNotFound) if shows_mountpoint => {}
            Err(e) => return Err(e),
        }

        if shows_mountpoint && !entries.iter().any(|entry| entry.path == self.mountpoint) {
            let metadata = self.source.stat(Path::new("/")).map(|metadata| Metadata {
                name: crate::metadata_name(&self.mountpoint),
                ft: FileType::new_dir(),
                ..metadata
            });
            entries.push(DirEntry {
                path: self.mountpoint.clone(),
                metadata,
            });
            entries.sort_by(|a, b| a.path.file_name().cmp(&b.path.file_name()));
        }

        Ok(ReadDir::new(entries))
    }

    fn create_dir_all(&self, path: &Path, mode: u32) -> Result<()> {
        let target = self.target(path);
        target.fs().create_dir_all(target.path(), mode)
    }
}

impl Symlink for MountFileSystem {
    fn lstat(&self, path: &Path) -> Result<Metadata> {
        let target = self.target(path);
        let mut metadata = target.fs().lstat(target.path())?;
        metadata.name = crate::metadata_name(path);
        Ok(metadata)
    }

    fn symlink(&self, target: &Path, link: &Path) -> Result<()> {
        let link = self.target(link);
        link.fs().symlink(target, link.path())
    }

    fn readlink(&self, link: &Path) -> Result<PathBuf> {
        let link = self.target(link);
        link.fs().readlink(link.path())
    }
}

impl Chroot for MountFileSystem {
    fn chroot(&self, path: &Path) -> Result<SharedFileSystem> {
        Ok(Arc::new(ChrootFileSystem::new(
            Arc::new(self.clone()),
            path::to_absolute(path),
        )))
    }

    fn root(&self) -> &Path {
        self.underlying.root()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{mem_fs, ops};

    fn mounted() -> (
        Arc<mem_fs::FileSystem>,
        Arc<mem_fs::FileSystem>,
        MountFileSystem,
    ) {
        let underlying = Arc::new(mem_fs::FileSystem::default());
        let source = Arc::new(mem_fs::FileSystem::default());
        let fs = MountFileSystem::new(underlying.clone(), "/mnt/data", source.clone());
        (underlying, source, fs)
    }

    #[test]
    fn test_routing() {
        let (underlying, source, fs) = mounted();

        ops::write_file(&fs, "/mnt/data/inner.txt", b"mounted").unwrap();
        ops::write_file(&fs, "/outer.txt", b"plain").unwrap();

        assert_eq!(
            ops::read_file(source.as_ref(), "/inner.txt").unwrap(),
            b"mounted"
        );
        assert_eq!(
            ops::read_file(underlying.as_ref(), "/outer.txt").unwrap(),
            b"plain"
        );
        assert!(!ops::exists(underlying.as_ref(), "/mnt/data/inner.txt"));

        let file = fs.open(Path::new("mnt/data/inner.txt")).unwrap();
        assert_eq!(file.name(), Path::new("mnt/data/inner.txt"));
    }

    #[test]
    fn test_prefix_is_not_a_mount() {
        let (underlying, _source, fs) = mounted();

        ops::touch(&fs, "/mnt/database").unwrap();
        assert!(ops::exists(underlying.as_ref(), "/mnt/database"));
    }

    #[test]
    fn test_rename_across_mountpoint() {
        let (_underlying, _source, fs) = mounted();
        ops::touch(&fs, "/a").unwrap();
        ops::touch(&fs, "/mnt/data/b").unwrap();

        assert_eq!(
            fs.rename(Path::new("/a"), Path::new("/mnt/data/a")),
            Err(FsError::CrossDevice)
        );
        assert_eq!(
            fs.rename(Path::new("/mnt/data/b"), Path::new("/b")),
            Err(FsError::CrossDevice)
        );
        assert_eq!(
            fs.rename(Path::new("/mnt/data/b"), Path::new("/mnt/data/c")),
            Ok(())
        );
        assert_eq!(
            fs.rename(Path::new("/mnt/data"), Path::new("/elsewhere")),
            Err(FsError::BaseDirRename)
        );
        assert_eq!(
            fs.remove(Path::new("/mnt/data")),
            Err(FsError::BaseDirRemove)
        );
    }

    #[test]
    fn test_read_dir_shows_mountpoint() {
        let (_underlying, _source, fs) = mounted();
        ops::touch(&fs, "/mnt/zzz").unwrap();
        ops::touch(&fs, "/mnt/data/file").unwrap();

        let entries: Vec<_> = fs
            .read_dir(Path::new("/mnt"))
            .unwrap()
            .map(|entry| entry.unwrap())
            .collect();
        let paths: Vec<_> = entries.iter().map(|entry| entry.path()).collect();
        assert_eq!(
            paths,
            vec![PathBuf::from("/mnt/data"), PathBuf::from("/mnt/zzz")]
        );
        assert!(entries[0].metadata().unwrap().is_dir());

        let inner: Vec<_> = fs
            .read_dir(Path::new("/mnt/data"))
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .collect();
        assert_eq!(inner, vec![PathBuf::from("/mnt/data/file")]);
    }

    #[test]
    fn test_capabilities_intersect() {
        let underlying: SharedFileSystem = Arc::new(mem_fs::FileSystem::default());
        let tmp = tempfile::TempDir::new().unwrap();
        let host: SharedFileSystem =
            Arc::new(crate::host_fs::FileSystem::with_root(tmp.path()).unwrap());

        let fs = MountFileSystem::new(underlying.clone(), "/host", host.clone());
        assert_eq!(
            fs.capabilities(),
            underlying.capabilities() & host.capabilities()
        );
        assert!(!fs.capabilities().contains(Capability::LOCK));
    }

    #[test]
    fn test_chroot_into_mount() {
        let (_underlying, source, fs) = mounted();

        let jail = fs.chroot(Path::new("/mnt")).unwrap();
        ops::write_file(jail.as_ref(), "data/x", b"1").unwrap();
        assert!(ops::exists(source.as_ref(), "/x"));
        assert_eq!(
            jail.stat(Path::new("../outer")),
            Err(FsError::CrossedBoundary)
        );
    }
}

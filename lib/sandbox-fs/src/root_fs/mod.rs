//! A host filesystem confined to a directory by the OS.
//!
//! Where [`crate::ChrootFileSystem`] only checks paths lexically,
//! [`RootFileSystem`] resolves every path through a [`Root`] directory
//! handle, so a symlink on the host, planted before or during the call,
//! cannot lead outside of the base directory.

mod platform;
mod root;

pub use self::platform::Stat;
pub use self::root::Root;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::trace;

use crate::host_fs::HostFile;
use crate::{
    Basic, Chroot, DEFAULT_DIR_MODE, Dir, DirEntry, File, FileOpener, FsError, Metadata,
    OpenOptions, OpenOptionsConfig, ReadDir, Result, SharedFileSystem, Symlink, TempFile, ops,
    path,
};

#[derive(Debug, Clone)]
enum RootHandle {
    /// Opened for every operation and closed right after.
    PerCall,
    Shared(Arc<Root>),
}

#[derive(Debug, Clone)]
pub struct RootFileSystem {
    base: PathBuf,
    handle: RootHandle,
}

impl RootFileSystem {
    /// Confines to `base`, opening it anew for every operation.
    ///
    /// Nothing is checked until the first operation, which fails if `base`
    /// is not a directory.
    pub fn new(base: impl AsRef<Path>) -> Self {
        Self {
            base: path::clean(base.as_ref()),
            handle: RootHandle::PerCall,
        }
    }

    /// Confines to an already opened `root`, kept for the life of the value.
    pub fn with_root(root: Arc<Root>) -> Self {
        Self {
            base: root.path().to_path_buf(),
            handle: RootHandle::Shared(root),
        }
    }

    fn with_root_handle<T>(&self, f: impl FnOnce(&Root) -> Result<T>) -> Result<T> {
        match &self.handle {
            RootHandle::PerCall => {
                let root = Root::open(&self.base)?;
                f(&root)
            }
            RootHandle::Shared(root) => f(root),
        }
    }

    /// `path` relative to the base. Absolute paths must name the base or
    /// something below it.
    fn rel_path(&self, path: &Path) -> Result<PathBuf> {
        if path.is_absolute() {
            let rel = path::relativize(&self.base, path)
                .ok_or_else(|| FsError::PathEscapesParent(path.to_path_buf()))?;
            trace!(path = %path.display(), rel = %rel.display(), "relativized against base");
            return Ok(rel);
        }

        if path.as_os_str().is_empty() {
            return Ok(PathBuf::from("."));
        }
        Ok(path.to_path_buf())
    }

    fn create_parent(root: &Root, rel: &Path) -> Result<()> {
        let parent = path::parent(rel);
        if path::is_current_dir(&parent) {
            return Ok(());
        }
        root.mkdir_all(&parent, DEFAULT_DIR_MODE)
    }

    /// Removes `path` and everything below it. A missing `path` is not an
    /// error; the base itself cannot be removed.
    pub fn remove_all(&self, path: &Path) -> Result<()> {
        let rel = self.rel_path(path)?;
        if path::is_current_dir(&rel) {
            return Err(FsError::BaseDirRemove);
        }
        self.with_root_handle(|root| root.remove_all(&rel))
    }
}

fn metadata_from_stat(path: &Path, stat: Stat) -> Metadata {
    Metadata {
        name: crate::metadata_name(path),
        ft: stat.file_type,
        perm: stat.perm,
        len: stat.size,
        modified: stat.modified,
    }
}

impl FileOpener for RootFileSystem {
    fn open_file(&self, path: &Path, conf: &OpenOptionsConfig) -> Result<Box<dyn File>> {
        let rel = self.rel_path(path)?;
        self.with_root_handle(|root| {
            if conf.creates() {
                Self::create_parent(root, &rel)?;
            }
            let file = root.open_file(&rel, conf)?;
            Ok(Box::new(HostFile::new(file, path)) as Box<dyn File>)
        })
    }
}

impl Basic for RootFileSystem {
    fn new_open_options(&self) -> OpenOptions<'_> {
        OpenOptions::new(self)
    }

    fn stat(&self, path: &Path) -> Result<Metadata> {
        let rel = self.rel_path(path)?;
        let stat = self.with_root_handle(|root| root.stat(&rel))?;
        Ok(metadata_from_stat(path, stat))
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        let from = self.rel_path(from)?;
        let to = self.rel_path(to)?;
        if path::is_current_dir(&from) || path::is_current_dir(&to) {
            return Err(FsError::BaseDirRename);
        }

        self.with_root_handle(|root| {
            Self::create_parent(root, &to)?;
            root.rename(&from, &to)
        })
    }

    fn remove(&self, path: &Path) -> Result<()> {
        let rel = self.rel_path(path)?;
        if path::is_current_dir(&rel) {
            return Err(FsError::BaseDirRemove);
        }
        self.with_root_handle(|root| root.remove(&rel))
    }
}

impl TempFile for RootFileSystem {
    fn temp_file(&self, dir: &Path, prefix: &str) -> Result<Box<dyn File>> {
        let rel = self.rel_path(dir)?;
        self.with_root_handle(|root| root.mkdir_all(&rel, DEFAULT_DIR_MODE))?;
        ops::temp_file(self, dir, prefix)
    }
}

impl Dir for RootFileSystem {
    fn read_dir(&self, path: &Path) -> Result<ReadDir> {
        let rel = self.rel_path(path)?;
        let entries = self.with_root_handle(|root| root.read_dir(&rel))?;

        let data = entries
            .into_iter()
            .map(|(name, stat)| {
                let entry_path = path.join(&name);
                DirEntry {
                    metadata: Ok(metadata_from_stat(&entry_path, stat)),
                    path: entry_path,
                }
            })
            .collect();
        Ok(ReadDir::new(data))
    }

    fn create_dir_all(&self, path: &Path, mode: u32) -> Result<()> {
        let rel = self.rel_path(path)?;
        self.with_root_handle(|root| root.mkdir_all(&rel, mode))
    }
}

impl Symlink for RootFileSystem {
    fn lstat(&self, path: &Path) -> Result<Metadata> {
        let rel = self.rel_path(path)?;
        let stat = self.with_root_handle(|root| root.lstat(&rel))?;
        Ok(metadata_from_stat(path, stat))
    }

    fn symlink(&self, target: &Path, link: &Path) -> Result<()> {
        let rel = self.rel_path(link)?;
        self.with_root_handle(|root| {
            Self::create_parent(root, &rel)?;
            root.symlink(target, &rel)
        })
    }

    fn readlink(&self, link: &Path) -> Result<PathBuf> {
        let rel = self.rel_path(link)?;
        self.with_root_handle(|root| root.readlink(&rel))
    }
}

impl Chroot for RootFileSystem {
    fn chroot(&self, path: &Path) -> Result<SharedFileSystem> {
        let rel = self.rel_path(path)?;
        self.with_root_handle(|root| {
            match root.mkdir_all(&rel, DEFAULT_DIR_MODE) {
                Ok(()) => {}
                Err(FsError::AlreadyExists) => return Err(FsError::BaseNotDirectory),
                Err(e) => return Err(e),
            }
            if !root.stat(&rel)?.is_dir() {
                return Err(FsError::BaseNotDirectory);
            }

            let sub = root.open_root(&rel)?;
            let fs = match &self.handle {
                RootHandle::PerCall => RootFileSystem::new(sub.path()),
                RootHandle::Shared(_) => RootFileSystem::with_root(Arc::new(sub)),
            };
            Ok(Arc::new(fs) as SharedFileSystem)
        })
    }

    fn root(&self) -> &Path {
        &self.base
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};

    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    use super::*;
    use crate::Capability;

    fn setup() -> (TempDir, PathBuf) {
        let temp = TempDir::new().unwrap();
        let base = temp.path().join("base");
        std::fs::create_dir(&base).unwrap();
        std::fs::write(temp.path().join("secret"), b"secret").unwrap();
        let base = std::fs::canonicalize(base).unwrap();
        (temp, base)
    }

    fn both(base: &Path) -> Vec<RootFileSystem> {
        vec![
            RootFileSystem::new(base),
            RootFileSystem::with_root(Arc::new(Root::open(base).unwrap())),
        ]
    }

    #[test]
    fn test_create_write_read() {
        let (_temp, base) = setup();

        for fs in both(&base) {
            let mut file = fs.create(Path::new("dir/file.txt")).unwrap();
            assert_eq!(file.name(), Path::new("dir/file.txt"));
            file.write_all(b"confined").unwrap();
            file.close().unwrap();

            let mut file = fs.open(Path::new("dir/file.txt")).unwrap();
            let mut content = String::new();
            file.read_to_string(&mut content).unwrap();
            assert_eq!(content, "confined");
            assert_eq!(std::fs::read(base.join("dir/file.txt")).unwrap(), b"confined");

            fs.remove_all(Path::new("dir")).unwrap();
        }
    }

    #[test]
    fn test_absolute_paths() {
        let (temp, base) = setup();
        let fs = RootFileSystem::new(&base);

        ops::write_file(&fs, base.join("file"), b"abc").unwrap();
        assert_eq!(fs.stat(Path::new("file")).unwrap().len, 3);
        assert_eq!(fs.stat(&base.join("file")).unwrap().len, 3);

        let outside = temp.path().join("secret");
        assert_eq!(
            fs.stat(&outside),
            Err(FsError::PathEscapesParent(outside.clone()))
        );
    }

    #[test]
    fn test_symlink_escape_is_refused() {
        let (temp, base) = setup();

        for fs in both(&base) {
            fs.symlink(&temp.path().join("secret"), Path::new("abs"))
                .unwrap();
            fs.symlink(Path::new("../secret"), Path::new("rel")).unwrap();
            fs.symlink(Path::new("."), Path::new("dot")).unwrap();

            for link in ["abs", "rel", "dot/rel"] {
                assert!(
                    matches!(
                        fs.open(Path::new(link)).map(|_| ()),
                        Err(FsError::PathEscapesParent(_))
                    ),
                    "opening {link} must not leave the base",
                );
            }
            assert_eq!(
                fs.readlink(Path::new("rel")).unwrap(),
                PathBuf::from("../secret"),
                "targets are stored verbatim",
            );

            for link in ["abs", "rel", "dot"] {
                fs.remove(Path::new(link)).unwrap();
            }
        }
    }

    #[test]
    fn test_symlink_inside_is_followed() {
        let (_temp, base) = setup();
        let fs = RootFileSystem::new(&base);

        ops::write_file(&fs, "dir/target", b"data").unwrap();
        fs.symlink(Path::new("dir/target"), Path::new("link")).unwrap();
        fs.symlink(&base.join("dir"), Path::new("abs")).unwrap();

        assert_eq!(ops::read_file(&fs, "link").unwrap(), b"data");
        assert_eq!(ops::read_file(&fs, "abs/target").unwrap(), b"data");
        assert!(fs.lstat(Path::new("link")).unwrap().is_symlink());
        assert!(fs.stat(Path::new("link")).unwrap().is_file());
    }

    #[test]
    fn test_base_cannot_be_removed_or_renamed() {
        let (_temp, base) = setup();

        for fs in both(&base) {
            assert_eq!(fs.remove(Path::new(".")), Err(FsError::BaseDirRemove));
            assert_eq!(fs.remove(&base), Err(FsError::BaseDirRemove));
            assert_eq!(fs.remove(Path::new("")), Err(FsError::BaseDirRemove));
            assert_eq!(fs.remove_all(&base), Err(FsError::BaseDirRemove));
            assert_eq!(
                fs.rename(Path::new("."), Path::new("other")),
                Err(FsError::BaseDirRename)
            );
            assert_eq!(
                fs.rename(&base, Path::new("other")),
                Err(FsError::BaseDirRename)
            );
        }
        assert!(base.is_dir());
    }

    #[test]
    fn test_rename_creates_parent() {
        let (_temp, base) = setup();
        let fs = RootFileSystem::new(&base);
        ops::write_file(&fs, "a", b"12345").unwrap();

        fs.rename(Path::new("a"), Path::new("x/y/b")).unwrap();
        assert_eq!(fs.stat(Path::new("a")), Err(FsError::EntityNotFound));
        assert_eq!(fs.stat(Path::new("x/y/b")).unwrap().len, 5);
    }

    #[test]
    fn test_read_dir() {
        let (_temp, base) = setup();
        let fs = RootFileSystem::new(&base);
        fs.create_dir_all(Path::new("foo/bar/baz"), 0o755).unwrap();
        ops::touch(&fs, "foo/file").unwrap();

        assert!(fs.stat(Path::new("foo/bar")).unwrap().is_dir());
        let entries: Vec<_> = fs
            .read_dir(Path::new("foo"))
            .unwrap()
            .map(|entry| entry.unwrap())
            .collect();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].path, PathBuf::from("foo/bar"));
        assert!(entries[0].metadata().unwrap().is_dir());
        assert_eq!(entries[1].file_name(), "file");
    }

    #[test]
    fn test_chroot() {
        let (_temp, base) = setup();

        for fs in both(&base) {
            let jail = fs.chroot(Path::new("jail")).unwrap();
            assert_eq!(jail.root(), base.join("jail"));
            ops::write_file(jail.as_ref(), "file", b"x").unwrap();
            assert!(base.join("jail/file").is_file());
            assert!(matches!(
                jail.stat(Path::new("../secret")),
                Err(FsError::PathEscapesParent(_))
            ));

            ops::touch(&fs, "plain").unwrap();
            assert_eq!(
                fs.chroot(Path::new("plain")).map(|_| ()),
                Err(FsError::BaseNotDirectory)
            );

            fs.remove_all(Path::new("jail")).unwrap();
            fs.remove(Path::new("plain")).unwrap();
        }
    }

    #[test]
    fn test_temp_file() {
        let (_temp, base) = setup();
        let fs = RootFileSystem::new(&base);

        let file = fs.temp_file(Path::new("tmp"), "scratch").unwrap();
        let name = file.name().to_path_buf();
        assert!(name.starts_with("tmp"));
        assert!(fs.stat(&name).unwrap().is_file());
    }

    #[test]
    fn test_capabilities() {
        let (_temp, base) = setup();
        assert_eq!(
            RootFileSystem::new(&base).capabilities(),
            Capability::DEFAULT
        );
    }

    #[test]
    fn test_missing_base() {
        let temp = TempDir::new().unwrap();
        let fs = RootFileSystem::new(temp.path().join("missing"));

        assert_eq!(
            fs.stat(Path::new("file")),
            Err(FsError::EntityNotFound)
        );
    }
}

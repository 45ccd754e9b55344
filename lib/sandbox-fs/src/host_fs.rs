//! The host filesystem, accessed through `std::fs`.
//!
//! Paths are cleaned and joined onto the configured root lexically, so `..`
//! never climbs above it, but symlinks on the host are followed wherever
//! they lead. Wrap it with [`crate::root_fs::RootFileSystem`] when that is
//! not acceptable.

use std::ffi::OsString;
use std::fs;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use tracing::debug;

use crate::{
    Basic, Chroot, ChrootFileSystem, Dir, DirEntry, File, FileOpener, FileType, FsError, Metadata,
    OpenOptions, OpenOptionsConfig, ReadDir, Result, SharedFileSystem, Symlink, TempFile, ops,
    path,
};

#[derive(Debug, Clone)]
pub struct FileSystem {
    root: PathBuf,
}

impl Default for FileSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl FileSystem {
    /// The whole host filesystem.
    pub fn new() -> Self {
        Self {
            root: PathBuf::from("/"),
        }
    }

    /// The host filesystem below `root`, which must be an existing directory.
    pub fn with_root(root: impl Into<PathBuf>) -> Result<Self> {
        let root = fs::canonicalize(root.into())?;
        if !root.is_dir() {
            return Err(FsError::BaseNotDirectory);
        }

        Ok(Self { root })
    }

    fn prepare_path(&self, path: &Path) -> PathBuf {
        let path = path::join(&self.root, &path::to_absolute(path));
        debug_assert!(path.starts_with(&self.root));
        path
    }
}

impl FileOpener for FileSystem {
    fn open_file(&self, path: &Path, conf: &OpenOptionsConfig) -> Result<Box<dyn File>> {
        let full = self.prepare_path(path);

        if conf.creates() {
            if let Some(parent) = full.parent() {
                fs::create_dir_all(parent)?;
            }
        }

        let file = std_open_options(conf).open(&full)?;
        #[cfg(not(unix))]
        {
            if conf.append() && conf.truncate() {
                file.set_len(0)?;
            }
        }
        Ok(Box::new(HostFile::new(file, path)))
    }
}

impl Basic for FileSystem {
    fn new_open_options(&self) -> OpenOptions<'_> {
        OpenOptions::new(self)
    }

    fn stat(&self, path: &Path) -> Result<Metadata> {
        let full = self.prepare_path(path);
        let metadata = fs::metadata(full)?;
        Ok(metadata_from_std(crate::metadata_name(path), &metadata))
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        let from = self.prepare_path(from);
        let to = self.prepare_path(to);

        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(from, to).map_err(Into::into)
    }

    fn remove(&self, path: &Path) -> Result<()> {
        let full = self.prepare_path(path);
        if full == self.root {
            return Err(FsError::BaseDirRemove);
        }

        if fs::symlink_metadata(&full)?.is_dir() {
            fs::remove_dir(full).map_err(Into::into)
        } else {
            fs::remove_file(full).map_err(Into::into)
        }
    }
}

impl TempFile for FileSystem {
    fn temp_file(&self, dir: &Path, prefix: &str) -> Result<Box<dyn File>> {
        fs::create_dir_all(self.prepare_path(dir))?;
        ops::temp_file(self, dir, prefix)
    }
}

impl Dir for FileSystem {
    fn read_dir(&self, path: &Path) -> Result<ReadDir> {
        let full = self.prepare_path(path);
        let parent = path::to_absolute(path);

        let mut data = fs::read_dir(full)?
            .map(|entry| {
                let entry = entry?;
                let name = entry.file_name();
                let metadata = entry.metadata()?;

                Ok(DirEntry {
                    path: parent.join(&name),
                    metadata: Ok(metadata_from_std(name, &metadata)),
                })
            })
            .collect::<std::result::Result<Vec<DirEntry>, io::Error>>()
            .map_err::<FsError, _>(Into::into)?;
        data.sort_by(|a, b| a.path.file_name().cmp(&b.path.file_name()));

        Ok(ReadDir::new(data))
    }

    fn create_dir_all(&self, path: &Path, mode: u32) -> Result<()> {
        let full = self.prepare_path(path);

        let mut builder = fs::DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            builder.mode(mode);
        }
        #[cfg(not(unix))]
        let _ = mode;

        builder.create(full).map_err(Into::into)
    }
}

impl Symlink for FileSystem {
    fn lstat(&self, path: &Path) -> Result<Metadata> {
        let full = self.prepare_path(path);
        let metadata = fs::symlink_metadata(full)?;
        Ok(metadata_from_std(crate::metadata_name(path), &metadata))
    }

    #[cfg(unix)]
    fn symlink(&self, target: &Path, link: &Path) -> Result<()> {
        let full = self.prepare_path(link);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)?;
        }
        std::os::unix::fs::symlink(target, full).map_err(Into::into)
    }

    #[cfg(not(unix))]
    fn symlink(&self, _target: &Path, _link: &Path) -> Result<()> {
        Err(FsError::Unsupported)
    }

    fn readlink(&self, link: &Path) -> Result<PathBuf> {
        let full = self.prepare_path(link);
        fs::read_link(full).map_err(Into::into)
    }
}

impl Chroot for FileSystem {
    fn chroot(&self, path: &Path) -> Result<SharedFileSystem> {
        Ok(Arc::new(ChrootFileSystem::new(
            Arc::new(self.clone()),
            path::to_absolute(path),
        )))
    }

    fn root(&self) -> &Path {
        &self.root
    }
}

/// Translates our open flags to `std`, which is stricter about their
/// combinations than `open(2)`.
pub(crate) fn std_open_options(conf: &OpenOptionsConfig) -> fs::OpenOptions {
    let write = conf.writable() || conf.creates() || conf.truncate();

    let mut options = fs::OpenOptions::new();
    options
        .read(conf.readable())
        .create(conf.create())
        .create_new(conf.create_new());

    // `std` refuses to truncate an append-only handle.
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options
            .write(write)
            .truncate(conf.truncate())
            .mode(conf.mode());
        if conf.append() {
            options.custom_flags(libc::O_APPEND);
        }
    }

    // Truncation is applied by the caller once the file is open.
    #[cfg(not(unix))]
    {
        let append = conf.append();
        options
            .write(write && !append)
            .append(append)
            .truncate(conf.truncate() && !append);
    }

    options
}

pub(crate) fn metadata_from_std(name: OsString, metadata: &fs::Metadata) -> Metadata {
    let file_type = metadata.file_type();

    #[cfg(unix)]
    let perm = {
        use std::os::unix::fs::PermissionsExt;
        metadata.permissions().mode() & crate::MODE_PERM_MASK
    };
    #[cfg(not(unix))]
    let perm = if metadata.permissions().readonly() {
        0o444
    } else {
        0o666
    };

    Metadata {
        name,
        ft: FileType {
            dir: file_type.is_dir(),
            file: file_type.is_file(),
            symlink: file_type.is_symlink(),
        },
        perm,
        len: metadata.len(),
        modified: metadata
            .modified()
            .ok()
            .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
            .map(|elapsed| elapsed.as_nanos() as u64)
            .unwrap_or_default(),
    }
}

/// A file on the host.
///
/// The descriptor is released by [`File::close`] or on drop, whichever
/// comes first.
#[derive(Debug)]
pub struct HostFile {
    inner: Option<fs::File>,
    name: PathBuf,
}

impl HostFile {
    pub fn new(file: fs::File, name: impl Into<PathBuf>) -> Self {
        Self {
            inner: Some(file),
            name: name.into(),
        }
    }

    fn file(&self) -> Result<&fs::File> {
        self.inner.as_ref().ok_or(FsError::FileClosed)
    }

    fn file_mut(&mut self) -> Result<&mut fs::File> {
        self.inner.as_mut().ok_or(FsError::FileClosed)
    }
}

impl Read for HostFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file_mut()?.read(buf)
    }
}

impl Write for HostFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file_mut()?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file_mut()?.flush()
    }
}

impl Seek for HostFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.file_mut()?.seek(pos)
    }
}

impl File for HostFile {
    fn name(&self) -> &Path {
        &self.name
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let file = self.file()?;

        let mut total = 0;
        while total < buf.len() {
            match read_at(file, &mut buf[total..], offset + total as u64) {
                Ok(0) => break,
                Ok(read) => total += read,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }

        Ok(total)
    }

    fn write_at(&mut self, buf: &[u8], offset: u64) -> Result<usize> {
        let file = self.file()?;
        write_all_at(file, buf, offset)?;
        Ok(buf.len())
    }

    fn truncate(&mut self, size: u64) -> Result<()> {
        self.file()?.set_len(size).map_err(Into::into)
    }

    fn metadata(&self) -> Result<Metadata> {
        let metadata = self.file()?.metadata()?;
        Ok(metadata_from_std(crate::metadata_name(&self.name), &metadata))
    }

    fn lock(&self) -> Result<()> {
        flock(self.file()?, FlockOp::Exclusive)
    }

    fn unlock(&self) -> Result<()> {
        flock(self.file()?, FlockOp::Unlock)
    }

    fn close(&mut self) -> Result<()> {
        match self.inner.take() {
            Some(file) => {
                drop(file);
                Ok(())
            }
            None => Err(FsError::FileClosed),
        }
    }
}

#[cfg(unix)]
fn read_at(file: &fs::File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    std::os::unix::fs::FileExt::read_at(file, buf, offset)
}

#[cfg(unix)]
fn write_all_at(file: &fs::File, buf: &[u8], offset: u64) -> io::Result<()> {
    std::os::unix::fs::FileExt::write_all_at(file, buf, offset)
}

#[cfg(windows)]
fn read_at(file: &fs::File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    std::os::windows::fs::FileExt::seek_read(file, buf, offset)
}

#[cfg(windows)]
fn write_all_at(file: &fs::File, mut buf: &[u8], mut offset: u64) -> io::Result<()> {
    while !buf.is_empty() {
        let written = std::os::windows::fs::FileExt::seek_write(file, buf, offset)?;
        if written == 0 {
            return Err(io::ErrorKind::WriteZero.into());
        }
        buf = &buf[written..];
        offset += written as u64;
    }
    Ok(())
}

#[cfg(not(any(unix, windows)))]
fn read_at(_file: &fs::File, _buf: &mut [u8], _offset: u64) -> io::Result<usize> {
    Err(io::ErrorKind::Unsupported.into())
}

#[cfg(not(any(unix, windows)))]
fn write_all_at(_file: &fs::File, _buf: &[u8], _offset: u64) -> io::Result<()> {
    Err(io::ErrorKind::Unsupported.into())
}

#[derive(Debug, Clone, Copy)]
enum FlockOp {
    Exclusive,
    Unlock,
}

#[cfg(unix)]
fn flock(file: &fs::File, op: FlockOp) -> Result<()> {
    use std::os::unix::io::AsRawFd;

    let operation = match op {
        FlockOp::Exclusive => libc::LOCK_EX,
        FlockOp::Unlock => libc::LOCK_UN,
    };

    loop {
        let res = unsafe { libc::flock(file.as_raw_fd(), operation) };
        if res == 0 {
            return Ok(());
        }

        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            debug!(?op, %err, "flock failed");
            return Err(err.into());
        }
    }
}

#[cfg(not(unix))]
fn flock(_file: &fs::File, op: FlockOp) -> Result<()> {
    debug!(?op, "advisory locks are not available on this platform");
    Err(FsError::Unsupported)
}

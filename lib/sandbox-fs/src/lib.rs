//! A virtual filesystem contract shared by interchangeable backends.
//!
//! Backends implement the small [`Basic`] surface plus the optional
//! [`TempFile`], [`Dir`], [`Symlink`] and [`Chroot`] traits; anything that
//! implements all of them is a [`Filesystem`]. Confinement is layered on top:
//! [`ChrootFileSystem`] restricts any filesystem to a subtree by lexical path
//! checks, while [`root_fs::RootFileSystem`] resolves every path through an
//! open directory handle so that symlinks cannot lead outside of it.

use std::ffi::OsString;
use std::fmt;
use std::io::{self, Read, Seek, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;

pub mod capability;
pub mod chroot_fs;
pub mod host_fs;
pub mod mem_fs;
pub mod mount_fs;
mod named_file;
pub mod ops;
pub mod path;
pub mod polyfill;
#[cfg(unix)]
pub mod root_fs;

pub use capability::{Capability, capabilities, capability_check};
pub use chroot_fs::ChrootFileSystem;
pub use mount_fs::MountFileSystem;
pub use polyfill::Polyfill;

pub type Result<T> = std::result::Result<T, FsError>;

/// Shared handle on any filesystem implementation.
pub type SharedFileSystem = Arc<dyn Filesystem + Send + Sync>;

/// Permission bits applied to files created without an explicit mode.
pub const DEFAULT_FILE_MODE: u32 = 0o666;
/// Permission bits applied to directories created implicitly.
pub const DEFAULT_DIR_MODE: u32 = 0o755;

/// Symlinks followed while resolving a single path before giving up with
/// [`FsError::TooManySymlinks`], like Linux's `MAXSYMLINKS`.
pub const MAX_SYMLINKS: usize = 40;

pub const MODE_TYPE_MASK: u32 = 0o170000;
pub const MODE_TYPE_DIR: u32 = 0o040000;
pub const MODE_TYPE_FILE: u32 = 0o100000;
pub const MODE_TYPE_SYMLINK: u32 = 0o120000;
pub const MODE_PERM_MASK: u32 = 0o7777;

/// Opens files on behalf of an [`OpenOptions`] builder.
pub trait FileOpener {
    fn open_file(&self, path: &Path, conf: &OpenOptionsConfig) -> Result<Box<dyn File>>;
}

/// The operations every backend supports.
pub trait Basic: FileOpener + fmt::Debug {
    fn new_open_options(&self) -> OpenOptions<'_>;

    /// Creates or truncates `path` and opens it for reading and writing.
    fn create(&self, path: &Path) -> Result<Box<dyn File>> {
        self.new_open_options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
    }

    /// Opens `path` read-only.
    fn open(&self, path: &Path) -> Result<Box<dyn File>> {
        self.new_open_options().read(true).open(path)
    }

    fn stat(&self, path: &Path) -> Result<Metadata>;

    fn rename(&self, from: &Path, to: &Path) -> Result<()>;

    /// Removes a file or an empty directory.
    fn remove(&self, path: &Path) -> Result<()>;

    fn join(&self, base: &Path, path: &Path) -> PathBuf {
        path::join(base, path)
    }

    fn capabilities(&self) -> Capability {
        Capability::DEFAULT
    }
}

pub trait TempFile {
    /// Creates a new file with a unique name in `dir`, starting with `prefix`.
    fn temp_file(&self, dir: &Path, prefix: &str) -> Result<Box<dyn File>>;
}

pub trait Dir {
    fn read_dir(&self, path: &Path) -> Result<ReadDir>;
    fn create_dir_all(&self, path: &Path, mode: u32) -> Result<()>;
}

pub trait Symlink {
    /// Like [`Basic::stat`] but a final symlink is described instead of followed.
    fn lstat(&self, path: &Path) -> Result<Metadata>;
    fn symlink(&self, target: &Path, link: &Path) -> Result<()>;
    fn readlink(&self, link: &Path) -> Result<PathBuf>;
}

pub trait Chroot {
    /// Returns a filesystem confined to `path`.
    fn chroot(&self, path: &Path) -> Result<SharedFileSystem>;
    /// The base this filesystem is rooted at.
    fn root(&self) -> &Path;
}

/// Every capability trait at once.
pub trait Filesystem: Basic + TempFile + Dir + Symlink + Chroot {}

impl<T> Filesystem for T where T: Basic + TempFile + Dir + Symlink + Chroot + ?Sized {}

/// An open file.
///
/// Once [`File::close`] has been called every operation fails with
/// [`FsError::FileClosed`].
pub trait File: fmt::Debug + Read + Write + Seek + Send + Sync {
    /// The path this file was opened with, as the caller supplied it.
    fn name(&self) -> &Path;

    /// Reads from `offset` without moving the cursor. A short count means the
    /// end of the file was reached; at or past the end this returns `Ok(0)`.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize>;

    /// Writes at `offset` without moving the cursor, zero filling any gap.
    fn write_at(&mut self, buf: &[u8], offset: u64) -> Result<usize>;

    fn truncate(&mut self, size: u64) -> Result<()>;

    fn metadata(&self) -> Result<Metadata>;

    /// Takes an advisory exclusive lock.
    fn lock(&self) -> Result<()>;

    fn unlock(&self) -> Result<()>;

    fn close(&mut self) -> Result<()>;

    fn size(&self) -> Result<u64> {
        Ok(self.metadata()?.len)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenOptionsConfig {
    pub read: bool,
    pub write: bool,
    pub create_new: bool,
    pub create: bool,
    pub append: bool,
    pub truncate: bool,
    pub mode: u32,
}

impl Default for OpenOptionsConfig {
    fn default() -> Self {
        Self {
            read: false,
            write: false,
            create_new: false,
            create: false,
            append: false,
            truncate: false,
            mode: DEFAULT_FILE_MODE,
        }
    }
}

impl OpenOptionsConfig {
    pub const fn read(&self) -> bool {
        self.read
    }

    pub const fn write(&self) -> bool {
        self.write
    }

    pub const fn create_new(&self) -> bool {
        self.create_new
    }

    pub const fn create(&self) -> bool {
        self.create
    }

    pub const fn append(&self) -> bool {
        self.append
    }

    pub const fn truncate(&self) -> bool {
        self.truncate
    }

    pub const fn mode(&self) -> u32 {
        self.mode
    }

    /// Whether the handle may write, `append` implying write access.
    pub const fn writable(&self) -> bool {
        self.write || self.append
    }

    /// Whether the handle may read. A handle opened with no access flag at
    /// all is read-only.
    pub const fn readable(&self) -> bool {
        self.read || !self.writable()
    }

    pub const fn creates(&self) -> bool {
        self.create || self.create_new
    }

    /// Would a file opened with this [`OpenOptionsConfig`] change files on the
    /// filesystem.
    pub const fn would_mutate(&self) -> bool {
        self.writable() || self.truncate || self.creates()
    }
}

#[derive(derive_more::Debug)]
pub struct OpenOptions<'a> {
    #[debug(ignore)]
    opener: &'a dyn FileOpener,
    conf: OpenOptionsConfig,
}

impl<'a> OpenOptions<'a> {
    pub fn new(opener: &'a dyn FileOpener) -> Self {
        Self {
            opener,
            conf: OpenOptionsConfig::default(),
        }
    }

    pub fn get_config(&self) -> OpenOptionsConfig {
        self.conf.clone()
    }

    /// Use an existing [`OpenOptionsConfig`] to configure this [`OpenOptions`].
    pub fn options(&mut self, options: OpenOptionsConfig) -> &mut Self {
        self.conf = options;
        self
    }

    pub fn read(&mut self, read: bool) -> &mut Self {
        self.conf.read = read;
        self
    }

    pub fn write(&mut self, write: bool) -> &mut Self {
        self.conf.write = write;
        self
    }

    pub fn append(&mut self, append: bool) -> &mut Self {
        self.conf.append = append;
        self
    }

    pub fn truncate(&mut self, truncate: bool) -> &mut Self {
        self.conf.truncate = truncate;
        self
    }

    pub fn create(&mut self, create: bool) -> &mut Self {
        self.conf.create = create;
        self
    }

    pub fn create_new(&mut self, create_new: bool) -> &mut Self {
        self.conf.create_new = create_new;
        self
    }

    /// Permission bits for a file created by this open.
    pub fn mode(&mut self, mode: u32) -> &mut Self {
        self.conf.mode = mode;
        self
    }

    pub fn open<P: AsRef<Path>>(&mut self, path: P) -> Result<Box<dyn File>> {
        self.opener.open_file(path.as_ref(), &self.conf)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FileType {
    pub dir: bool,
    pub file: bool,
    pub symlink: bool,
}

impl FileType {
    pub fn new_dir() -> Self {
        Self {
            dir: true,
            ..Default::default()
        }
    }

    pub fn new_file() -> Self {
        Self {
            file: true,
            ..Default::default()
        }
    }

    pub fn new_symlink() -> Self {
        Self {
            symlink: true,
            ..Default::default()
        }
    }

    pub fn is_dir(&self) -> bool {
        self.dir
    }

    pub fn is_file(&self) -> bool {
        self.file
    }

    pub fn is_symlink(&self) -> bool {
        self.symlink
    }

    fn mode_bits(&self) -> u32 {
        if self.dir {
            MODE_TYPE_DIR
        } else if self.symlink {
            MODE_TYPE_SYMLINK
        } else if self.file {
            MODE_TYPE_FILE
        } else {
            0
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Metadata {
    /// Final component of the path that was asked about.
    pub name: OsString,
    pub ft: FileType,
    /// Permission bits only, see [`Metadata::mode`].
    pub perm: u32,
    pub len: u64,
    /// Last modification time in nanoseconds since the UNIX epoch.
    pub modified: u64,
}

impl Metadata {
    pub fn name(&self) -> &OsString {
        &self.name
    }

    pub fn is_dir(&self) -> bool {
        self.ft.is_dir()
    }

    pub fn is_file(&self) -> bool {
        self.ft.is_file()
    }

    pub fn is_symlink(&self) -> bool {
        self.ft.is_symlink()
    }

    pub fn file_type(&self) -> FileType {
        self.ft.clone()
    }

    /// Permission bits combined with the file type bits.
    pub fn mode(&self) -> u32 {
        self.ft.mode_bits() | (self.perm & MODE_PERM_MASK)
    }

    pub fn modified(&self) -> u64 {
        self.modified
    }

    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> u64 {
        self.len
    }
}

#[derive(Debug, Clone)]
pub struct DirEntry {
    pub path: PathBuf,
    pub metadata: Result<Metadata>,
}

impl DirEntry {
    pub fn path(&self) -> PathBuf {
        self.path.clone()
    }

    pub fn metadata(&self) -> Result<Metadata> {
        self.metadata.clone()
    }

    pub fn file_type(&self) -> Result<FileType> {
        let metadata = self.metadata.clone()?;
        Ok(metadata.file_type())
    }

    pub fn file_name(&self) -> OsString {
        self.path
            .file_name()
            .unwrap_or(self.path.as_os_str())
            .to_owned()
    }
}

#[derive(Debug, Clone)]
pub struct ReadDir {
    data: Vec<DirEntry>,
    index: usize,
}

impl ReadDir {
    pub fn new(data: Vec<DirEntry>) -> Self {
        Self { data, index: 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.data.len() <= self.index
    }
}

impl Iterator for ReadDir {
    type Item = Result<DirEntry>;

    fn next(&mut self) -> Option<Result<DirEntry>> {
        if let Some(v) = self.data.get(self.index).cloned() {
            self.index += 1;
            return Some(Ok(v));
        }
        None
    }
}

/// Error type for external users
#[derive(Error, Clone, Debug, PartialEq, Eq)]
pub enum FsError {
    /// The requested file or directory could not be found
    #[error("entity not found")]
    EntityNotFound,
    /// File exists
    #[error("file exists")]
    AlreadyExists,
    /// The path given as a base was not a directory so the operation was not possible
    #[error("not a directory")]
    BaseNotDirectory,
    /// Expected a file but found not a file
    #[error("not a file")]
    NotAFile,
    /// The directory still has children
    #[error("directory not empty")]
    DirectoryNotEmpty,
    /// The filesystem does not accept changes
    #[error("read-only filesystem")]
    ReadOnly,
    /// The backend does not implement this operation
    #[error("feature not supported")]
    Unsupported,
    /// A path resolved outside of a chroot boundary
    #[error("chroot boundary crossed")]
    CrossedBoundary,
    /// A path resolved outside of a root directory handle
    #[error("path escapes from parent: {}", .0.display())]
    PathEscapesParent(PathBuf),
    /// The base directory of a confined filesystem cannot be renamed
    #[error("base dir cannot be renamed")]
    BaseDirRename,
    /// The base directory of a confined filesystem cannot be removed
    #[error("base dir cannot be removed")]
    BaseDirRemove,
    /// The file handle was already closed
    #[error("file already closed")]
    FileClosed,
    /// Symlink resolution gave up
    #[error("too many levels of symbolic links")]
    TooManySymlinks,
    /// No unused temporary file name could be found
    #[error("temporary file names exhausted")]
    TempFileExhausted,
    /// A rename tried to move an entry to another filesystem
    #[error("cross-device link")]
    CrossDevice,
    /// The provided data is invalid
    #[error("invalid input")]
    InvalidInput,
    /// Caller was not allowed to perform this operation
    #[error("permission denied")]
    PermissionDenied,
    /// Any other OS error, kept verbatim
    #[error("{message}")]
    Io {
        kind: io::ErrorKind,
        raw_os_error: Option<i32>,
        message: String,
    },
}

impl From<io::Error> for FsError {
    fn from(io_error: io::Error) -> Self {
        // An FsError that went through one of the std io traits.
        if let Some(inner) = io_error
            .get_ref()
            .and_then(|inner| inner.downcast_ref::<FsError>())
        {
            return inner.clone();
        }

        if let Some(fs_error) = io_error.raw_os_error().and_then(from_errno) {
            return fs_error;
        }

        match io_error.kind() {
            io::ErrorKind::NotFound => FsError::EntityNotFound,
            io::ErrorKind::AlreadyExists => FsError::AlreadyExists,
            io::ErrorKind::PermissionDenied => FsError::PermissionDenied,
            io::ErrorKind::InvalidInput => FsError::InvalidInput,
            io::ErrorKind::Unsupported => FsError::Unsupported,
            io::ErrorKind::NotADirectory => FsError::BaseNotDirectory,
            io::ErrorKind::IsADirectory => FsError::NotAFile,
            io::ErrorKind::DirectoryNotEmpty => FsError::DirectoryNotEmpty,
            io::ErrorKind::ReadOnlyFilesystem => FsError::ReadOnly,
            kind => {
                tracing::debug!(%io_error, "passing through unmapped io error");
                FsError::Io {
                    kind,
                    raw_os_error: io_error.raw_os_error(),
                    message: io_error.to_string(),
                }
            }
        }
    }
}

impl From<FsError> for io::Error {
    fn from(fs_error: FsError) -> Self {
        let kind = match &fs_error {
            FsError::EntityNotFound => io::ErrorKind::NotFound,
            FsError::AlreadyExists => io::ErrorKind::AlreadyExists,
            FsError::BaseNotDirectory => io::ErrorKind::NotADirectory,
            FsError::NotAFile => io::ErrorKind::IsADirectory,
            FsError::DirectoryNotEmpty => io::ErrorKind::DirectoryNotEmpty,
            FsError::ReadOnly => io::ErrorKind::ReadOnlyFilesystem,
            FsError::Unsupported => io::ErrorKind::Unsupported,
            FsError::PermissionDenied
            | FsError::CrossedBoundary
            | FsError::PathEscapesParent(_)
            | FsError::BaseDirRename
            | FsError::BaseDirRemove => io::ErrorKind::PermissionDenied,
            FsError::InvalidInput => io::ErrorKind::InvalidInput,
            FsError::Io { kind, .. } => *kind,
            FsError::FileClosed
            | FsError::TooManySymlinks
            | FsError::TempFileExhausted
            | FsError::CrossDevice => io::ErrorKind::Other,
        };
        io::Error::new(kind, fs_error)
    }
}

#[cfg(unix)]
fn from_errno(errno: i32) -> Option<FsError> {
    match errno {
        libc::ELOOP => Some(FsError::TooManySymlinks),
        libc::EXDEV => Some(FsError::CrossDevice),
        libc::ENOTDIR => Some(FsError::BaseNotDirectory),
        libc::EISDIR => Some(FsError::NotAFile),
        libc::ENOTEMPTY => Some(FsError::DirectoryNotEmpty),
        libc::EROFS => Some(FsError::ReadOnly),
        libc::ENOTSUP => Some(FsError::Unsupported),
        _ => None,
    }
}

#[cfg(not(unix))]
fn from_errno(_errno: i32) -> Option<FsError> {
    None
}

/// Name reported in [`Metadata`] for `path`.
pub(crate) fn metadata_name(path: &Path) -> OsString {
    path::base_name(path).into_os_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_fs_error_survives_io_error() {
        let io_error: io::Error = FsError::PathEscapesParent(PathBuf::from("../x")).into();
        assert_eq!(io_error.kind(), io::ErrorKind::PermissionDenied);
        assert_eq!(
            FsError::from(io_error),
            FsError::PathEscapesParent(PathBuf::from("../x"))
        );
    }

    #[test]
    fn test_io_error_mapping() {
        assert_eq!(
            FsError::from(io::Error::from(io::ErrorKind::NotFound)),
            FsError::EntityNotFound
        );
        assert_eq!(
            FsError::from(io::Error::from(io::ErrorKind::AlreadyExists)),
            FsError::AlreadyExists
        );

        match FsError::from(io::Error::new(io::ErrorKind::TimedOut, "slow disk")) {
            FsError::Io { kind, message, .. } => {
                assert_eq!(kind, io::ErrorKind::TimedOut);
                assert_eq!(message, "slow disk");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_raw_os_error_mapping() {
        assert_eq!(
            FsError::from(io::Error::from_raw_os_error(libc::ELOOP)),
            FsError::TooManySymlinks
        );
        assert_eq!(
            FsError::from(io::Error::from_raw_os_error(libc::EXDEV)),
            FsError::CrossDevice
        );
    }

    #[test]
    fn test_open_options_access() {
        let conf = OpenOptionsConfig::default();
        assert!(conf.readable());
        assert!(!conf.writable());
        assert!(!conf.would_mutate());

        let conf = OpenOptionsConfig {
            write: true,
            ..Default::default()
        };
        assert!(!conf.readable());
        assert!(conf.would_mutate());

        let conf = OpenOptionsConfig {
            append: true,
            read: true,
            ..Default::default()
        };
        assert!(conf.readable());
        assert!(conf.writable());
    }

    #[test]
    fn test_metadata_mode() {
        let metadata = Metadata {
            name: "a".into(),
            ft: FileType::new_dir(),
            perm: 0o755,
            len: 0,
            modified: 0,
        };
        assert_eq!(metadata.mode(), MODE_TYPE_DIR | 0o755);
        assert!(metadata.is_dir());
        assert!(!metadata.is_file());
    }
}

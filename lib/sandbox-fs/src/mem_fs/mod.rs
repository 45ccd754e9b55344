//! An in-memory filesystem.
//!
//! Nodes live in a slab and are indexed by their cleaned absolute path.
//! Every node owns its content behind its own lock, so open handles on
//! different files never contend with each other.

mod file;
mod filesystem;
mod lock;

pub use file::FileHandle;
pub use filesystem::FileSystem;
pub use lock::{LockStrategy, SingleThreaded};

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::lock_api::RwLock;

use crate::{FileType, MAX_SYMLINKS};

type Inode = usize;
const ROOT_INODE: Inode = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeKind {
    File,
    Directory,
    Symlink,
}

impl NodeKind {
    fn file_type(self) -> FileType {
        match self {
            NodeKind::File => FileType::new_file(),
            NodeKind::Directory => FileType::new_dir(),
            NodeKind::Symlink => FileType::new_symlink(),
        }
    }
}

/// Bytes and attributes of a node. For a symlink `data` is the raw target.
#[derive(Debug)]
struct Content {
    data: Vec<u8>,
    perm: u32,
    modified: u64,
}

impl Content {
    fn new(data: Vec<u8>, perm: u32) -> Self {
        Self {
            data,
            perm,
            modified: time(),
        }
    }
}

type SharedContent<L> = Arc<RwLock<L, Content>>;

struct Node<L: LockStrategy> {
    kind: NodeKind,
    content: SharedContent<L>,
}

impl<L: LockStrategy> Node<L> {
    fn new(kind: NodeKind, data: Vec<u8>, perm: u32) -> Self {
        Self {
            kind,
            content: Arc::new(RwLock::new(Content::new(data, perm))),
        }
    }

    fn is_dir(&self) -> bool {
        self.kind == NodeKind::Directory
    }
}

fn time() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos() as u64)
        .unwrap_or_default()
}

#[cfg(unix)]
fn path_to_bytes(path: &Path) -> Vec<u8> {
    use std::os::unix::ffi::OsStrExt;
    path.as_os_str().as_bytes().to_vec()
}

#[cfg(not(unix))]
fn path_to_bytes(path: &Path) -> Vec<u8> {
    path.to_string_lossy().into_owned().into_bytes()
}

#[cfg(unix)]
fn bytes_to_path(bytes: &[u8]) -> PathBuf {
    use std::os::unix::ffi::OsStrExt;
    PathBuf::from(std::ffi::OsStr::from_bytes(bytes))
}

#[cfg(not(unix))]
fn bytes_to_path(bytes: &[u8]) -> PathBuf {
    PathBuf::from(String::from_utf8_lossy(bytes).into_owned())
}

fn name_of(path: &Path) -> OsString {
    crate::metadata_name(path)
}

//! This module contains the [`FileSystem`] type itself.

use std::collections::{BTreeMap, VecDeque};
use std::ffi::OsString;
use std::fmt;
use std::ops::Bound;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use parking_lot::lock_api::RwLock;
use slab::Slab;
use tracing::trace;

use super::*;
use crate::{
    Basic, Capability, Chroot, ChrootFileSystem, DEFAULT_DIR_MODE, Dir, DirEntry, File,
    FileOpener, FsError, MODE_PERM_MASK, Metadata, OpenOptions, OpenOptionsConfig, ReadDir, Result,
    SharedFileSystem, Symlink, TempFile, ops, path,
};

/// What the in-memory filesystem can do: everything but locking.
pub const CAPABILITIES: Capability = Capability::from_bits_truncate(
    Capability::WRITE.bits()
        | Capability::READ.bits()
        | Capability::READ_AND_WRITE.bits()
        | Capability::SEEK.bits()
        | Capability::TRUNCATE.bits(),
);

/// The in-memory file system!
///
/// This `FileSystem` type can be cloned, it's a light copy of the
/// `FileSystemInner` (which is behind a `Arc` + `RwLock`).
///
/// The lock type is picked at construction: [`FileSystem::new`] is
/// synchronized with [`parking_lot`], [`FileSystem::unsynchronized`] uses
/// [`SingleThreaded`].
pub struct FileSystem<L: LockStrategy = parking_lot::RawRwLock> {
    pub(super) inner: Arc<RwLock<L, FileSystemInner<L>>>,
}

impl FileSystem {
    pub fn new() -> Self {
        Self::with_lock()
    }
}

impl Default for FileSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl FileSystem<SingleThreaded> {
    /// A filesystem that must only ever be used from one thread at a time.
    pub fn unsynchronized() -> Self {
        Self::with_lock()
    }
}

impl<L: LockStrategy> FileSystem<L> {
    /// A filesystem guarded by the lock type `L`.
    pub fn with_lock() -> Self {
        Self {
            inner: Arc::new(RwLock::new(FileSystemInner::new())),
        }
    }

    fn shared_content(&self, path: &Path, conf: &OpenOptionsConfig) -> Result<SharedContent<L>> {
        if conf.creates() {
            self.inner.write().open_or_create(path, conf)
        } else {
            self.inner.read().open_existing(path, conf)
        }
    }
}

impl<L: LockStrategy> Clone for FileSystem<L> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<L: LockStrategy> fmt::Debug for FileSystem<L> {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.try_read() {
            Some(inner) => fmt::Debug::fmt(&*inner, formatter),
            None => formatter.write_str("FileSystem { <locked> }"),
        }
    }
}

impl<L: LockStrategy> FileOpener for FileSystem<L> {
    fn open_file(&self, path: &Path, conf: &OpenOptionsConfig) -> Result<Box<dyn File>> {
        let content = self.shared_content(path, conf)?;

        if conf.truncate() {
            let mut content = content.write();
            content.data.clear();
            content.modified = time();
        }

        Ok(Box::new(FileHandle::new(
            path.to_path_buf(),
            content,
            conf,
        )))
    }
}

impl<L: LockStrategy> Basic for FileSystem<L> {
    fn new_open_options(&self) -> OpenOptions<'_> {
        OpenOptions::new(self)
    }

    fn stat(&self, path: &Path) -> Result<Metadata> {
        let inner = self.inner.read();
        let target = inner.resolve(path, true)?;
        inner.metadata_of(&target, name_of(path))
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        let mut inner = self.inner.write();
        let from = inner.resolve(from, false)?;
        let to = inner.resolve(to, false)?;

        if from == Path::new("/") || to == Path::new("/") {
            return Err(FsError::BaseNotDirectory);
        }
        if !inner.exists(&from) {
            return Err(FsError::EntityNotFound);
        }
        if from == to {
            return Ok(());
        }
        if to.starts_with(&from) {
            return Err(FsError::InvalidInput);
        }

        let from_is_dir = inner.is_dir(&from);
        if inner.exists(&to) {
            match (from_is_dir, inner.is_dir(&to)) {
                (true, true) if inner.has_descendants(&to) => {
                    return Err(FsError::DirectoryNotEmpty);
                }
                (false, true) => return Err(FsError::NotAFile),
                (true, false) => return Err(FsError::BaseNotDirectory),
                _ => {}
            }
            inner.unlink(&to);
        }

        inner.mkdir_all(&path::parent(&to), DEFAULT_DIR_MODE)?;
        inner.relink(&from, &to);

        if let Some(node) = inner.node_at(&to) {
            node.content.write().modified = time();
        }

        trace!(from = %from.display(), to = %to.display(), "renamed");
        Ok(())
    }

    fn remove(&self, path: &Path) -> Result<()> {
        let mut inner = self.inner.write();
        let target = inner.resolve(path, false)?;

        if target == Path::new("/") {
            return Err(FsError::BaseNotDirectory);
        }
        if !inner.exists(&target) {
            return Err(FsError::EntityNotFound);
        }
        if inner.has_descendants(&target) {
            return Err(FsError::DirectoryNotEmpty);
        }

        inner.unlink(&target);
        Ok(())
    }

    fn capabilities(&self) -> Capability {
        CAPABILITIES
    }
}

impl<L: LockStrategy> TempFile for FileSystem<L> {
    fn temp_file(&self, dir: &Path, prefix: &str) -> Result<Box<dyn File>> {
        ops::temp_file(self, dir, prefix)
    }
}

impl<L: LockStrategy> Dir for FileSystem<L> {
    fn read_dir(&self, path: &Path) -> Result<ReadDir> {
        let inner = self.inner.read();
        let target = inner.resolve(path, true)?;

        match inner.node_at(&target) {
            Some(node) if !node.is_dir() => return Err(FsError::BaseNotDirectory),
            None if !inner.has_descendants(&target) => return Err(FsError::EntityNotFound),
            _ => {}
        }

        let parent = path::to_absolute(path);
        let entries = inner
            .children(&target)
            .into_iter()
            .map(|(name, child)| DirEntry {
                path: parent.join(&name),
                metadata: inner.metadata_of(&child, name),
            })
            .collect();

        Ok(ReadDir::new(entries))
    }

    fn create_dir_all(&self, path: &Path, mode: u32) -> Result<()> {
        let mut inner = self.inner.write();
        let target = inner.resolve(path, true)?;

        if let Some(node) = inner.node_at(&target) {
            if !node.is_dir() {
                return Err(FsError::AlreadyExists);
            }
        }

        inner.mkdir_all(&target, mode & MODE_PERM_MASK)
    }
}

impl<L: LockStrategy> Symlink for FileSystem<L> {
    fn lstat(&self, path: &Path) -> Result<Metadata> {
        let inner = self.inner.read();
        let target = inner.resolve(path, false)?;
        inner.metadata_of(&target, name_of(path))
    }

    fn symlink(&self, target: &Path, link: &Path) -> Result<()> {
        let mut inner = self.inner.write();
        let link = inner.resolve(link, false)?;

        if inner.exists(&link) {
            return Err(FsError::AlreadyExists);
        }

        inner.insert(&link, NodeKind::Symlink, 0o777, path_to_bytes(target))?;
        Ok(())
    }

    fn readlink(&self, link: &Path) -> Result<PathBuf> {
        let inner = self.inner.read();
        let link = inner.resolve(link, false)?;

        match inner.node_at(&link) {
            Some(node) if node.kind == NodeKind::Symlink => {
                Ok(bytes_to_path(&node.content.read().data))
            }
            Some(_) => Err(FsError::InvalidInput),
            None if inner.has_descendants(&link) => Err(FsError::InvalidInput),
            None => Err(FsError::EntityNotFound),
        }
    }
}

impl<L: LockStrategy> Chroot for FileSystem<L> {
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

/// One step of a path walk.
enum Step {
    Parent,
    Name(OsString),
}

fn steps(path: &Path) -> Vec<Step> {
    path.components()
        .filter_map(|component| match component {
            Component::ParentDir => Some(Step::Parent),
            Component::Normal(name) => Some(Step::Name(name.to_owned())),
            Component::Prefix(_) | Component::RootDir | Component::CurDir => None,
        })
        .collect()
}

/// The nodes and the path index, guarded together by one lock.
pub(super) struct FileSystemInner<L: LockStrategy> {
    pub(super) storage: Slab<Node<L>>,
    pub(super) index: BTreeMap<PathBuf, Inode>,
}

impl<L: LockStrategy> FileSystemInner<L> {
    fn new() -> Self {
        let mut storage = Slab::new();
        let root = storage.insert(Node::new(NodeKind::Directory, Vec::new(), DEFAULT_DIR_MODE));
        debug_assert_eq!(root, ROOT_INODE);

        let mut index = BTreeMap::new();
        index.insert(PathBuf::from("/"), root);

        Self { storage, index }
    }

    fn node_at(&self, path: &Path) -> Option<&Node<L>> {
        self.index
            .get(path)
            .and_then(|inode| self.storage.get(*inode))
    }

    /// Keys strictly below `path`, in order.
    fn descendants<'a>(&'a self, path: &'a Path) -> impl Iterator<Item = (&'a PathBuf, &'a Inode)> {
        self.index
            .range::<Path, _>((Bound::Excluded(path), Bound::Unbounded))
            .take_while(move |(key, _)| key.starts_with(path))
    }

    fn has_descendants(&self, path: &Path) -> bool {
        self.descendants(path).next().is_some()
    }

    /// Whether `path` is stored or implied by a stored descendant.
    fn exists(&self, path: &Path) -> bool {
        self.index.contains_key(path) || self.has_descendants(path)
    }

    fn is_dir(&self, path: &Path) -> bool {
        match self.node_at(path) {
            Some(node) => node.is_dir(),
            None => self.has_descendants(path),
        }
    }

    /// Resolves `path` to the cleaned absolute key it designates.
    ///
    /// Symlinks met along the way are followed, the last component only if
    /// `follow_final` is set. Components that do not exist are kept as they
    /// are, so the result may name a path that still has to be created.
    fn resolve(&self, path: &Path, follow_final: bool) -> Result<PathBuf> {
        let mut current = PathBuf::from("/");
        let mut queue: VecDeque<Step> = steps(path).into();
        let mut followed = 0;

        while let Some(step) = queue.pop_front() {
            let name = match step {
                Step::Parent => {
                    current.pop();
                    continue;
                }
                Step::Name(name) => name,
            };

            let candidate = current.join(&name);
            let is_final = queue.is_empty();

            match self.node_at(&candidate) {
                Some(node)
                    if node.kind == NodeKind::Symlink && (follow_final || !is_final) =>
                {
                    followed += 1;
                    if followed > MAX_SYMLINKS {
                        return Err(FsError::TooManySymlinks);
                    }

                    let target = bytes_to_path(&node.content.read().data);
                    trace!(
                        link = %candidate.display(),
                        target = %target.display(),
                        "following symlink"
                    );

                    if target.is_absolute() {
                        current = PathBuf::from("/");
                    }
                    for step in steps(&target).into_iter().rev() {
                        queue.push_front(step);
                    }
                }
                Some(node) if !is_final && !node.is_dir() => {
                    return Err(FsError::BaseNotDirectory);
                }
                _ => current = candidate,
            }
        }

        Ok(current)
    }

    fn metadata_of(&self, path: &Path, name: OsString) -> Result<Metadata> {
        match self.node_at(path) {
            Some(node) => {
                let content = node.content.read();
                Ok(Metadata {
                    name,
                    ft: node.kind.file_type(),
                    perm: content.perm,
                    len: content.data.len() as u64,
                    modified: content.modified,
                })
            }
            None if self.has_descendants(path) => Ok(Metadata {
                name,
                ft: NodeKind::Directory.file_type(),
                perm: DEFAULT_DIR_MODE,
                len: 0,
                modified: 0,
            }),
            None => Err(FsError::EntityNotFound),
        }
    }

    /// Immediate children of `dir` by name, each with its full key.
    fn children(&self, dir: &Path) -> BTreeMap<OsString, PathBuf> {
        let mut children = BTreeMap::new();

        for (key, _) in self.descendants(dir) {
            let Ok(rest) = key.strip_prefix(dir) else {
                continue;
            };
            let Some(Component::Normal(name)) = rest.components().next() else {
                continue;
            };
            children
                .entry(name.to_owned())
                .or_insert_with(|| dir.join(name));
        }

        children
    }

    fn open_existing(&self, path: &Path, conf: &OpenOptionsConfig) -> Result<SharedContent<L>> {
        if conf.create_new() && self.exists(&self.resolve(path, false)?) {
            return Err(FsError::AlreadyExists);
        }

        let target = self.resolve(path, true)?;
        match self.node_at(&target) {
            Some(node) if node.kind == NodeKind::File => Ok(node.content.clone()),
            Some(_) => Err(FsError::NotAFile),
            None if self.has_descendants(&target) => Err(FsError::NotAFile),
            None => Err(FsError::EntityNotFound),
        }
    }

    fn open_or_create(&mut self, path: &Path, conf: &OpenOptionsConfig) -> Result<SharedContent<L>> {
        match self.open_existing(path, conf) {
            Err(FsError::EntityNotFound) => {
                let target = self.resolve(path, true)?;
                let inode = self.insert(
                    &target,
                    NodeKind::File,
                    conf.mode() & MODE_PERM_MASK,
                    Vec::new(),
                )?;
                trace!(path = %target.display(), inode, "created file");

                self.storage
                    .get(inode)
                    .map(|node| node.content.clone())
                    .ok_or(FsError::EntityNotFound)
            }
            other => other,
        }
    }

    /// Stores a new node at `path`, creating missing parent directories.
    fn insert(&mut self, path: &Path, kind: NodeKind, perm: u32, data: Vec<u8>) -> Result<Inode> {
        self.mkdir_all(&path::parent(path), DEFAULT_DIR_MODE)?;

        let inode = self.storage.insert(Node::new(kind, data, perm));
        self.index.insert(path.to_path_buf(), inode);
        Ok(inode)
    }

    fn mkdir_all(&mut self, path: &Path, perm: u32) -> Result<()> {
        let ancestors: Vec<PathBuf> = path.ancestors().map(Path::to_path_buf).collect();

        for dir in ancestors.into_iter().rev() {
            match self.node_at(&dir) {
                Some(node) if node.is_dir() => {}
                Some(_) => return Err(FsError::BaseNotDirectory),
                None => {
                    let inode = self
                        .storage
                        .insert(Node::new(NodeKind::Directory, Vec::new(), perm));
                    self.index.insert(dir, inode);
                }
            }
        }

        Ok(())
    }

    /// Drops `path` and everything below it.
    fn unlink(&mut self, path: &Path) {
        let doomed: Vec<PathBuf> = self
            .index
            .get_key_value(path)
            .map(|(key, _)| key.clone())
            .into_iter()
            .chain(self.descendants(path).map(|(key, _)| key.clone()))
            .collect();

        for key in doomed {
            if let Some(inode) = self.index.remove(&key) {
                self.storage.remove(inode);
            }
        }
    }

    /// Moves `from` and everything below it to `to`, keeping the nodes.
    fn relink(&mut self, from: &Path, to: &Path) {
        let moved: Vec<(PathBuf, Inode)> = self
            .index
            .get_key_value(from)
            .map(|(key, inode)| (key.clone(), *inode))
            .into_iter()
            .chain(
                self.descendants(from)
                    .map(|(key, inode)| (key.clone(), *inode)),
            )
            .collect();

        for (key, _) in &moved {
            self.index.remove(key);
        }

        for (key, inode) in moved {
            let new_key = match key.strip_prefix(from) {
                Ok(rest) if !rest.as_os_str().is_empty() => to.join(rest),
                _ => to.to_path_buf(),
            };
            self.index.insert(new_key, inode);
        }
    }
}

impl<L: LockStrategy> fmt::Debug for FileSystemInner<L> {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(formatter, "\n{inode:<8}    {ty:<9}    path", inode = "inode", ty = "type")?;

        for (path, inode) in &self.index {
            let ty = match self.storage.get(*inode).map(|node| node.kind) {
                Some(NodeKind::File) => "file",
                Some(NodeKind::Directory) => "dir",
                Some(NodeKind::Symlink) => "symlink",
                None => "?",
            };
            writeln!(
                formatter,
                "{inode:<8}    {ty:<9}    {path}",
                path = path.display()
            )?;
        }

        Ok(())
    }
}

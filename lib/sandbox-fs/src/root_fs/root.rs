use std::collections::VecDeque;
use std::ffi::{OsStr, OsString};
use std::fs;
use std::os::unix::ffi::OsStrExt;
use std::path::{Component, Path, PathBuf};

use tracing::{debug, trace};

use super::platform::{self, DirHandle, Stat};
use crate::{FsError, MAX_SYMLINKS, OpenOptionsConfig, Result, path};

/// An open directory that path lookups cannot leave.
///
/// Paths given to a `Root` are relative to it. They are resolved one
/// component at a time with `openat(2)` and friends: `..` never climbs above
/// the directory the `Root` was opened on, and symlinks are read and spliced
/// into the remaining path by the `Root` itself instead of being followed by
/// the kernel. Anything that would lead outside fails with
/// [`FsError::PathEscapesParent`].
#[derive(Debug)]
pub struct Root {
    dir: DirHandle,
    path: PathBuf,
}

/// Where a path ended up: an entry `name` in `dir`, or `dir` itself.
#[derive(Debug)]
struct Location {
    dir: DirHandle,
    /// `dir` relative to the root.
    dir_path: PathBuf,
    name: Option<OsString>,
}

impl Location {
    fn path(&self) -> PathBuf {
        match &self.name {
            Some(name) => self.dir_path.join(name),
            None => self.dir_path.clone(),
        }
    }

    /// Did the path end on the root itself?
    fn is_root(&self) -> bool {
        self.name.is_none() && self.dir_path.as_os_str().is_empty()
    }

    /// The entry to act on, or `base_error` if the path named the root.
    /// Any other directory reached through a trailing `..` has no entry
    /// name to act on, like `rmdir("a/..")`.
    fn entry(&self, base_error: FsError) -> Result<&OsStr> {
        match &self.name {
            Some(name) => Ok(name),
            None if self.is_root() => Err(base_error),
            None => Err(FsError::InvalidInput),
        }
    }
}

impl Root {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = fs::canonicalize(path.as_ref())?;
        let dir = platform::open_root_dir(path.as_os_str().as_bytes())?;
        trace!(root = %path.display(), "opened root");
        Ok(Self { dir, path })
    }

    /// The canonical host path this root was opened on.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn try_clone(&self) -> Result<Self> {
        Ok(Self {
            dir: self.dir.try_clone()?,
            path: self.path.clone(),
        })
    }

    fn walk(&self, path: &Path, follow_final: bool) -> Result<Location> {
        let escapes = || FsError::PathEscapesParent(path.to_path_buf());

        let mut pending: VecDeque<OsString> = VecDeque::new();
        for component in path.components() {
            match component {
                Component::Normal(name) => pending.push_back(name.to_owned()),
                Component::ParentDir => pending.push_back(OsString::from("..")),
                Component::CurDir => {}
                Component::RootDir | Component::Prefix(_) => return Err(escapes()),
            }
        }

        // `names[i]` is the entry `stack[i + 1]` was opened from.
        let mut stack = vec![self.dir.try_clone()?];
        let mut names: Vec<OsString> = Vec::new();
        let mut links = 0;

        while let Some(name) = pending.pop_front() {
            if name == ".." {
                if names.pop().is_none() {
                    debug!(path = %path.display(), root = %self.path.display(), "path escapes root");
                    return Err(escapes());
                }
                stack.pop();
                continue;
            }

            let is_last = pending.is_empty();
            let Some(dir) = stack.last() else {
                return Err(escapes());
            };

            let stat = match platform::stat_at(dir, name.as_bytes(), true) {
                Ok(stat) => stat,
                Err(e) if is_last && e.kind() == std::io::ErrorKind::NotFound => {
                    return self.location(stack, names, Some(name));
                }
                Err(e) => return Err(e.into()),
            };

            if stat.is_symlink() && (follow_final || !is_last) {
                links += 1;
                if links > MAX_SYMLINKS {
                    return Err(FsError::TooManySymlinks);
                }

                let target = PathBuf::from(OsStr::from_bytes(&platform::readlink_at(
                    dir,
                    name.as_bytes(),
                )?));
                trace!(link = ?name, target = %target.display(), "splicing symlink");

                let target = if target.is_absolute() {
                    let Some(rel) = path::relativize(&self.path, &target) else {
                        debug!(
                            path = %path.display(),
                            target = %target.display(),
                            "absolute symlink target outside of root"
                        );
                        return Err(escapes());
                    };
                    stack.truncate(1);
                    names.clear();
                    rel
                } else {
                    target
                };

                for component in target.components().rev() {
                    match component {
                        Component::Normal(part) => pending.push_front(part.to_owned()),
                        Component::ParentDir => pending.push_front(OsString::from("..")),
                        _ => {}
                    }
                }
                continue;
            }

            if is_last {
                return self.location(stack, names, Some(name));
            }
            if !stat.is_dir() {
                return Err(FsError::BaseNotDirectory);
            }

            let next = platform::open_dir_at(dir, name.as_bytes())?;
            stack.push(next);
            names.push(name);
        }

        self.location(stack, names, None)
    }

    fn location(
        &self,
        mut stack: Vec<DirHandle>,
        names: Vec<OsString>,
        name: Option<OsString>,
    ) -> Result<Location> {
        let dir = stack.pop().ok_or(FsError::EntityNotFound)?;
        Ok(Location {
            dir,
            dir_path: names.iter().collect(),
            name,
        })
    }

    /// Opens the file at `path`, following symlinks within the root.
    pub fn open_file(&self, path: &Path, conf: &OpenOptionsConfig) -> Result<fs::File> {
        let location = self.walk(path, true)?;
        let name = location.name.as_deref().unwrap_or(OsStr::new("."));
        platform::open_file_at(&location.dir, name.as_bytes(), conf).map_err(Into::into)
    }

    pub fn stat(&self, path: &Path) -> Result<Stat> {
        self.stat_location(&self.walk(path, true)?)
    }

    pub fn lstat(&self, path: &Path) -> Result<Stat> {
        self.stat_location(&self.walk(path, false)?)
    }

    fn stat_location(&self, location: &Location) -> Result<Stat> {
        match &location.name {
            Some(name) => platform::stat_at(&location.dir, name.as_bytes(), true),
            None => platform::stat_dir(&location.dir),
        }
        .map_err(Into::into)
    }

    pub fn mkdir(&self, path: &Path, mode: u32) -> Result<()> {
        let location = self.walk(path, false)?;
        let Some(name) = &location.name else {
            return Err(FsError::AlreadyExists);
        };
        platform::mkdir_at(&location.dir, name.as_bytes(), mode).map_err(Into::into)
    }

    /// Creates `path` and every missing parent. An existing directory is
    /// fine, an existing file in its place is not.
    pub fn mkdir_all(&self, path: &Path, mode: u32) -> Result<()> {
        let mut current = PathBuf::new();
        let components: Vec<_> = path
            .components()
            .filter(|component| !matches!(component, Component::CurDir))
            .collect();

        for (i, component) in components.iter().enumerate() {
            current.push(component);
            let is_last = i + 1 == components.len();

            match self.stat(&current) {
                Ok(stat) if stat.is_dir() => continue,
                Ok(_) if is_last => return Err(FsError::AlreadyExists),
                Ok(_) => return Err(FsError::BaseNotDirectory),
                Err(FsError::EntityNotFound) => {}
                Err(e) => return Err(e),
            }

            match self.mkdir(&current, mode) {
                Ok(()) => {}
                // Lost a race with another creator; the next round checks it.
                Err(FsError::AlreadyExists) if self.stat(&current)?.is_dir() => {}
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }

    /// Removes a file or an empty directory. A symlink is removed, not its
    /// target.
    pub fn remove(&self, path: &Path) -> Result<()> {
        let location = self.walk(path, false)?;
        let name = location.entry(FsError::BaseDirRemove)?;

        let stat = platform::stat_at(&location.dir, name.as_bytes(), true)?;
        if stat.is_dir() {
            platform::rmdir_at(&location.dir, name.as_bytes())?;
        } else {
            platform::unlink_at(&location.dir, name.as_bytes())?;
        }
        Ok(())
    }

    /// Removes `path` and everything below it without ever leaving the
    /// subtree. A missing `path` is not an error.
    pub fn remove_all(&self, path: &Path) -> Result<()> {
        let location = self.walk(path, false)?;
        let name = location.entry(FsError::BaseDirRemove)?;

        let stat = match platform::stat_at(&location.dir, name.as_bytes(), true) {
            Ok(stat) => stat,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        if stat.is_dir() {
            let dir = platform::open_dir_at(&location.dir, name.as_bytes())?;
            remove_tree(&dir)?;
            platform::rmdir_at(&location.dir, name.as_bytes())?;
        } else {
            platform::unlink_at(&location.dir, name.as_bytes())?;
        }
        Ok(())
    }

    pub fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        let from = self.walk(from, false)?;
        let to = self.walk(to, false)?;
        let from_name = from.entry(FsError::BaseDirRename)?;
        let to_name = to.entry(FsError::BaseDirRename)?;

        platform::rename_at(&from.dir, from_name.as_bytes(), &to.dir, to_name.as_bytes())
            .map_err(Into::into)
    }

    /// Creates `link` pointing at `target`, which is stored as is.
    pub fn symlink(&self, target: &Path, link: &Path) -> Result<()> {
        let location = self.walk(link, false)?;
        let Some(name) = &location.name else {
            return Err(FsError::AlreadyExists);
        };

        platform::symlink_at(
            &location.dir,
            name.as_bytes(),
            target.as_os_str().as_bytes(),
        )
        .map_err(Into::into)
    }

    pub fn readlink(&self, link: &Path) -> Result<PathBuf> {
        let location = self.walk(link, false)?;
        let Some(name) = &location.name else {
            return Err(FsError::InvalidInput);
        };

        let target = platform::readlink_at(&location.dir, name.as_bytes())?;
        Ok(PathBuf::from(OsStr::from_bytes(&target)))
    }

    /// Entries of the directory at `path` sorted by name. Symlinks are
    /// described, not followed.
    pub fn read_dir(&self, path: &Path) -> Result<Vec<(OsString, Stat)>> {
        let location = self.walk(path, true)?;
        let opened;
        let dir = match &location.name {
            Some(name) => {
                opened = platform::open_dir_at(&location.dir, name.as_bytes())?;
                &opened
            }
            None => &location.dir,
        };

        let mut entries = Vec::new();
        for name in platform::read_dir(dir)? {
            match platform::stat_at(dir, &name, true) {
                Ok(stat) => entries.push((OsStr::from_bytes(&name).to_owned(), stat)),
                // Removed while listing.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        Ok(entries)
    }

    /// A new root on the directory at `path`.
    pub fn open_root(&self, path: &Path) -> Result<Root> {
        let location = self.walk(path, true)?;
        let resolved = location.path();
        let dir = match &location.name {
            Some(name) => platform::open_dir_at(&location.dir, name.as_bytes())?,
            None => location.dir,
        };

        Ok(Root {
            dir,
            path: self.path.join(resolved),
        })
    }
}

fn remove_tree(dir: &DirHandle) -> Result<()> {
    for name in platform::read_dir(dir)? {
        let stat = match platform::stat_at(dir, &name, true) {
            Ok(stat) => stat,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        };

        if stat.is_dir() {
            let child = platform::open_dir_at(dir, &name)?;
            remove_tree(&child)?;
            platform::rmdir_at(dir, &name)?;
        } else {
            platform::unlink_at(dir, &name)?;
        }
    }
    Ok(())
}

//! Common [`crate::Filesystem`] operations built on top of the traits.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use tracing::trace;

use crate::{Basic, DEFAULT_DIR_MODE, Dir, File, Filesystem, FsError, Metadata, Result, path};

/// Attempts made by [`temp_file`] and [`temp_dir`] before giving up.
pub const TEMP_NAME_ATTEMPTS: usize = 10_000;

/// Does this item exists?
pub fn exists<F>(fs: &F, path: impl AsRef<Path>) -> bool
where
    F: Basic + ?Sized,
{
    fs.stat(path.as_ref()).is_ok()
}

/// Does this path refer to a directory?
pub fn is_dir<F>(fs: &F, path: impl AsRef<Path>) -> bool
where
    F: Basic + ?Sized,
{
    match fs.stat(path.as_ref()) {
        Ok(meta) => meta.is_dir(),
        Err(_) => false,
    }
}

/// Does this path refer to a file?
pub fn is_file<F>(fs: &F, path: impl AsRef<Path>) -> bool
where
    F: Basic + ?Sized,
{
    match fs.stat(path.as_ref()) {
        Ok(meta) => meta.is_file(),
        Err(_) => false,
    }
}

/// Make sure a directory (and all its parents) exist.
pub fn create_dir_all<F>(fs: &F, path: impl AsRef<Path>) -> Result<()>
where
    F: Dir + ?Sized,
{
    fs.create_dir_all(path.as_ref(), DEFAULT_DIR_MODE)
}

/// Create a file if it doesn't exist.
pub fn touch<F>(fs: &F, path: impl AsRef<Path>) -> Result<()>
where
    F: Basic + ?Sized,
{
    let mut file = fs
        .new_open_options()
        .create(true)
        .write(true)
        .open(path.as_ref())?;
    file.close()
}

/// Replaces the content of `path` with `data`.
pub fn write_file<F>(fs: &F, path: impl AsRef<Path>, data: &[u8]) -> Result<()>
where
    F: Basic + ?Sized,
{
    let mut file = fs
        .new_open_options()
        .create(true)
        .truncate(true)
        .write(true)
        .open(path.as_ref())?;

    file.write_all(data)?;
    file.flush()?;
    file.close()
}

/// Reads the whole content of `path`.
pub fn read_file<F>(fs: &F, path: impl AsRef<Path>) -> Result<Vec<u8>>
where
    F: Basic + ?Sized,
{
    let mut file = fs.open(path.as_ref())?;
    let mut data = Vec::new();
    file.read_to_end(&mut data)?;
    file.close()?;
    Ok(data)
}

fn temp_name(prefix: &str) -> String {
    format!("{prefix}{:09}", rand::random::<u32>() % 1_000_000_000)
}

/// Creates a file with a unique name in `dir`, opened for reading and
/// writing. Names are `prefix` followed by random digits; a name already
/// taken is retried up to [`TEMP_NAME_ATTEMPTS`] times.
pub fn temp_file<F>(fs: &F, dir: &Path, prefix: &str) -> Result<Box<dyn File>>
where
    F: Basic + ?Sized,
{
    for _ in 0..TEMP_NAME_ATTEMPTS {
        let name = path::join(dir, Path::new(&temp_name(prefix)));
        match fs
            .new_open_options()
            .read(true)
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(&name)
        {
            Err(FsError::AlreadyExists) => {
                trace!(name = %name.display(), "temporary name taken");
                continue;
            }
            other => return other,
        }
    }

    Err(FsError::TempFileExhausted)
}

/// Creates a directory with a unique name in `dir` and returns its path.
pub fn temp_dir<F>(fs: &F, dir: &Path, prefix: &str) -> Result<PathBuf>
where
    F: Basic + Dir + ?Sized,
{
    for _ in 0..TEMP_NAME_ATTEMPTS {
        let name = path::join(dir, Path::new(&temp_name(prefix)));
        if exists(fs, &name) {
            continue;
        }
        fs.create_dir_all(&name, 0o700)?;
        return Ok(name);
    }

    Err(FsError::TempFileExhausted)
}

/// Removes `path` and, if it is a directory, everything below it.
///
/// A missing `path` is not an error. Symlinks are removed, not followed.
pub fn remove_all<F>(fs: &F, path: impl AsRef<Path>) -> Result<()>
where
    F: Filesystem + ?Sized,
{
    let path = path.as_ref();
    let metadata = match fs.lstat(path) {
        Ok(metadata) => metadata,
        Err(FsError::EntityNotFound) => return Ok(()),
        Err(e) => return Err(e),
    };

    if metadata.is_dir() {
        for entry in fs.read_dir(path)? {
            let entry = entry?;
            remove_all(fs, path::join(path, Path::new(&entry.file_name())))?;
        }
    }

    fs.remove(path)
}

/// Every path below `root` (and `root` itself) with its metadata, depth
/// first and in name order. Symlinks are reported, not followed.
pub fn walk<F>(fs: &F, root: impl AsRef<Path>) -> Result<Vec<(PathBuf, Metadata)>>
where
    F: Filesystem + ?Sized,
{
    let root = root.as_ref();
    let mut found = Vec::new();
    walk_into(fs, root.to_path_buf(), fs.lstat(root)?, &mut found)?;
    Ok(found)
}

fn walk_into<F>(
    fs: &F,
    path: PathBuf,
    metadata: Metadata,
    found: &mut Vec<(PathBuf, Metadata)>,
) -> Result<()>
where
    F: Filesystem + ?Sized,
{
    let is_dir = metadata.is_dir();
    found.push((path.clone(), metadata));

    if is_dir {
        for entry in fs.read_dir(&path)? {
            let entry = entry?;
            let child = path::join(&path, Path::new(&entry.file_name()));
            let metadata = entry.metadata()?;
            walk_into(fs, child, metadata, found)?;
        }
    }

    Ok(())
}

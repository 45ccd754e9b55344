//! Open handles on in-memory files.

use std::fmt;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use super::{LockStrategy, SharedContent, name_of, time};
use crate::{File, FileType, FsError, Metadata, OpenOptionsConfig, Result};

/// A handle on the content of an in-memory file.
///
/// Every open returns a new handle with its own cursor and access flags;
/// handles opened on the same path share the content and see each other's
/// writes immediately.
pub struct FileHandle<L: LockStrategy = parking_lot::RawRwLock> {
    name: PathBuf,
    content: SharedContent<L>,
    cursor: u64,
    readable: bool,
    writable: bool,
    append: bool,
    closed: bool,
}

impl<L: LockStrategy> FileHandle<L> {
    pub(super) fn new(name: PathBuf, content: SharedContent<L>, conf: &OpenOptionsConfig) -> Self {
        let cursor = if conf.append() {
            content.read().data.len() as u64
        } else {
            0
        };

        Self {
            name,
            content,
            cursor,
            readable: conf.readable(),
            writable: conf.writable(),
            append: conf.append(),
            closed: false,
        }
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(FsError::FileClosed);
        }
        Ok(())
    }

    fn check_readable(&self) -> Result<()> {
        self.check_open()?;
        if !self.readable {
            return Err(FsError::PermissionDenied);
        }
        Ok(())
    }

    fn check_writable(&self) -> Result<()> {
        self.check_open()?;
        if !self.writable {
            return Err(FsError::PermissionDenied);
        }
        Ok(())
    }

    fn len(&self) -> u64 {
        self.content.read().data.len() as u64
    }

    fn read_from(&self, buf: &mut [u8], offset: u64) -> usize {
        let content = self.content.read();
        let Ok(start) = usize::try_from(offset) else {
            return 0;
        };
        if start >= content.data.len() {
            return 0;
        }

        let read = buf.len().min(content.data.len() - start);
        buf[..read].copy_from_slice(&content.data[start..start + read]);
        read
    }

    /// Writes `buf` at `offset`, or at the end of the content when `offset`
    /// is `None`, and returns the offset that was written at.
    fn write_to(&self, buf: &[u8], offset: Option<u64>) -> Result<u64> {
        let mut content = self.content.write();

        let start = match offset {
            Some(offset) => usize::try_from(offset).map_err(|_| FsError::InvalidInput)?,
            None => content.data.len(),
        };
        let end = start
            .checked_add(buf.len())
            .ok_or(FsError::InvalidInput)?;

        if content.data.len() < end {
            content.data.resize(end, 0);
        }
        content.data[start..end].copy_from_slice(buf);
        content.modified = time();

        Ok(start as u64)
    }
}

impl<L: LockStrategy> fmt::Debug for FileHandle<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileHandle")
            .field("name", &self.name)
            .field("cursor", &self.cursor)
            .field("readable", &self.readable)
            .field("writable", &self.writable)
            .field("append", &self.append)
            .field("closed", &self.closed)
            .finish()
    }
}

impl<L: LockStrategy> Read for FileHandle<L> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.check_readable()?;

        let read = self.read_from(buf, self.cursor);
        self.cursor += read as u64;
        Ok(read)
    }
}

impl<L: LockStrategy> Write for FileHandle<L> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.check_writable()?;

        let offset = if self.append { None } else { Some(self.cursor) };
        let start = self.write_to(buf, offset)?;
        self.cursor = start + buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.check_open()?;
        Ok(())
    }
}

impl<L: LockStrategy> Seek for FileHandle<L> {
    fn seek(&mut self, position: SeekFrom) -> io::Result<u64> {
        self.check_open()?;

        let target = match position {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::End(delta) => self.len().checked_add_signed(delta),
            SeekFrom::Current(delta) => self.cursor.checked_add_signed(delta),
        };

        match target {
            Some(cursor) => {
                self.cursor = cursor;
                Ok(cursor)
            }
            None => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seeking to a negative or overflowing position",
            )),
        }
    }
}

impl<L: LockStrategy> File for FileHandle<L> {
    fn name(&self) -> &Path {
        &self.name
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        self.check_readable()?;
        Ok(self.read_from(buf, offset))
    }

    fn write_at(&mut self, buf: &[u8], offset: u64) -> Result<usize> {
        self.check_writable()?;
        self.write_to(buf, Some(offset))?;
        Ok(buf.len())
    }

    fn truncate(&mut self, size: u64) -> Result<()> {
        self.check_writable()?;
        let size = usize::try_from(size).map_err(|_| FsError::InvalidInput)?;

        let mut content = self.content.write();
        content.data.resize(size, 0);
        content.modified = time();
        Ok(())
    }

    fn metadata(&self) -> Result<Metadata> {
        self.check_open()?;

        let content = self.content.read();
        Ok(Metadata {
            name: name_of(&self.name),
            ft: FileType::new_file(),
            perm: content.perm,
            len: content.data.len() as u64,
            modified: content.modified,
        })
    }

    // Locks are not supported; the capability set says so.
    fn lock(&self) -> Result<()> {
        self.check_open()
    }

    fn unlock(&self) -> Result<()> {
        self.check_open()
    }

    fn close(&mut self) -> Result<()> {
        self.check_open()?;
        self.closed = true;
        Ok(())
    }
}

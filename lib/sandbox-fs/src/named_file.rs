//! A file handed out by a wrapping filesystem under the caller's name.

use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::{File, Metadata, Result};

/// Forwards everything to the wrapped file except [`File::name`], which
/// reports the path the caller used instead of the backend's path.
#[derive(Debug)]
pub(crate) struct NamedFile {
    inner: Box<dyn File>,
    name: PathBuf,
}

impl NamedFile {
    pub(crate) fn new(inner: Box<dyn File>, name: impl Into<PathBuf>) -> Self {
        Self {
            inner,
            name: name.into(),
        }
    }

    pub(crate) fn boxed(inner: Box<dyn File>, name: impl Into<PathBuf>) -> Box<dyn File> {
        Box::new(Self::new(inner, name))
    }
}

impl Read for NamedFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl Write for NamedFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl Seek for NamedFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.inner.seek(pos)
    }
}

impl File for NamedFile {
    fn name(&self) -> &Path {
        &self.name
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        self.inner.read_at(buf, offset)
    }

    fn write_at(&mut self, buf: &[u8], offset: u64) -> Result<usize> {
        self.inner.write_at(buf, offset)
    }

    fn truncate(&mut self, size: u64) -> Result<()> {
        self.inner.truncate(size)
    }

    fn metadata(&self) -> Result<Metadata> {
        let mut metadata = self.inner.metadata()?;
        metadata.name = crate::metadata_name(&self.name);
        Ok(metadata)
    }

    fn lock(&self) -> Result<()> {
        self.inner.lock()
    }

    fn unlock(&self) -> Result<()> {
        self.inner.unlock()
    }

    fn close(&mut self) -> Result<()> {
        self.inner.close()
    }
}

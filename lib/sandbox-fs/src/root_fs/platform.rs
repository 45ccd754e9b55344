//! Thin wrappers over the `*at` family of syscalls.
//!
//! Every lookup is relative to an open directory descriptor and never
//! follows a symlink in the final position, so callers stay in control of
//! where resolution goes.

use std::ffi::{CStr, CString};
use std::fs;
use std::io;
use std::mem;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use crate::{FileType, OpenOptionsConfig};

#[derive(Debug)]
pub struct DirHandle {
    fd: OwnedFd,
}

impl DirHandle {
    pub fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub fn try_clone(&self) -> io::Result<Self> {
        Ok(Self {
            fd: self.fd.try_clone()?,
        })
    }
}

/// What `fstatat(2)` reports about an entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stat {
    pub file_type: FileType,
    pub perm: u32,
    pub size: u64,
    pub modified: u64,
}

impl Stat {
    pub fn is_dir(&self) -> bool {
        self.file_type.is_dir()
    }

    pub fn is_symlink(&self) -> bool {
        self.file_type.is_symlink()
    }
}

fn c_name(name: &[u8]) -> io::Result<CString> {
    CString::new(name).map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "name NUL"))
}

pub fn open_root_dir(path: &[u8]) -> io::Result<DirHandle> {
    let cstr = CString::new(path)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains NUL"))?;
    let flags = libc::O_RDONLY | libc::O_DIRECTORY | libc::O_CLOEXEC;
    let fd = unsafe { libc::open(cstr.as_ptr(), flags) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(DirHandle {
        fd: unsafe { OwnedFd::from_raw_fd(fd) },
    })
}

pub fn open_dir_at(parent: &DirHandle, name: &[u8]) -> io::Result<DirHandle> {
    let cstr = c_name(name)?;
    let flags = libc::O_RDONLY | libc::O_DIRECTORY | libc::O_CLOEXEC | libc::O_NOFOLLOW;
    let fd = unsafe { libc::openat(parent.as_raw_fd(), cstr.as_ptr(), flags) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(DirHandle {
        fd: unsafe { OwnedFd::from_raw_fd(fd) },
    })
}

pub fn stat_dir(dir: &DirHandle) -> io::Result<Stat> {
    let mut st = unsafe { mem::zeroed::<libc::stat>() };
    let res = unsafe { libc::fstat(dir.as_raw_fd(), &mut st) };
    if res < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(stat_from_libc(&st))
}

pub fn stat_at(parent: &DirHandle, name: &[u8], nofollow: bool) -> io::Result<Stat> {
    let cstr = c_name(name)?;
    let mut st = unsafe { mem::zeroed::<libc::stat>() };
    let flags = if nofollow {
        libc::AT_SYMLINK_NOFOLLOW
    } else {
        0
    };
    let res = unsafe { libc::fstatat(parent.as_raw_fd(), cstr.as_ptr(), &mut st, flags) };
    if res < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(stat_from_libc(&st))
}

/// Opens `name` in `parent`. A symlink in that position is refused with
/// `ELOOP` rather than followed.
pub fn open_file_at(
    parent: &DirHandle,
    name: &[u8],
    conf: &OpenOptionsConfig,
) -> io::Result<fs::File> {
    let cstr = c_name(name)?;
    let mut oflags = libc::O_CLOEXEC | libc::O_NOFOLLOW;
    if conf.truncate() {
        oflags |= libc::O_TRUNC;
    }
    if conf.creates() {
        oflags |= libc::O_CREAT;
    }
    if conf.create_new() {
        oflags |= libc::O_EXCL;
    }
    if conf.append() {
        oflags |= libc::O_APPEND;
    }

    let write = conf.writable() || conf.truncate();
    let access = if conf.readable() && write {
        libc::O_RDWR
    } else if write {
        libc::O_WRONLY
    } else {
        libc::O_RDONLY
    };
    oflags |= access;

    let mode = conf.mode() as libc::c_uint;
    let fd = unsafe { libc::openat(parent.as_raw_fd(), cstr.as_ptr(), oflags, mode) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { fs::File::from_raw_fd(fd) })
}

pub fn mkdir_at(parent: &DirHandle, name: &[u8], mode: u32) -> io::Result<()> {
    let cstr = c_name(name)?;
    let res = unsafe { libc::mkdirat(parent.as_raw_fd(), cstr.as_ptr(), mode as libc::mode_t) };
    if res < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub fn unlink_at(parent: &DirHandle, name: &[u8]) -> io::Result<()> {
    let cstr = c_name(name)?;
    let res = unsafe { libc::unlinkat(parent.as_raw_fd(), cstr.as_ptr(), 0) };
    if res < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub fn rmdir_at(parent: &DirHandle, name: &[u8]) -> io::Result<()> {
    let cstr = c_name(name)?;
    let res = unsafe { libc::unlinkat(parent.as_raw_fd(), cstr.as_ptr(), libc::AT_REMOVEDIR) };
    if res < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub fn rename_at(
    old_parent: &DirHandle,
    old_name: &[u8],
    new_parent: &DirHandle,
    new_name: &[u8],
) -> io::Result<()> {
    let old_cstr = c_name(old_name)?;
    let new_cstr = c_name(new_name)?;
    let res = unsafe {
        libc::renameat(
            old_parent.as_raw_fd(),
            old_cstr.as_ptr(),
            new_parent.as_raw_fd(),
            new_cstr.as_ptr(),
        )
    };
    if res < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub fn symlink_at(parent: &DirHandle, new_name: &[u8], target: &[u8]) -> io::Result<()> {
    let new_cstr = c_name(new_name)?;
    let target_cstr = CString::new(target)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "target NUL"))?;
    let res =
        unsafe { libc::symlinkat(target_cstr.as_ptr(), parent.as_raw_fd(), new_cstr.as_ptr()) };
    if res < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub fn readlink_at(parent: &DirHandle, name: &[u8]) -> io::Result<Vec<u8>> {
    let cstr = c_name(name)?;
    let mut buf = vec![0u8; 1024];
    loop {
        let res = unsafe {
            libc::readlinkat(
                parent.as_raw_fd(),
                cstr.as_ptr(),
                buf.as_mut_ptr() as *mut _,
                buf.len(),
            )
        };
        if res < 0 {
            return Err(io::Error::last_os_error());
        }
        let len = res as usize;
        if len < buf.len() {
            buf.truncate(len);
            return Ok(buf);
        }
        buf.resize(buf.len() * 2, 0);
    }
}

/// Names in `dir`, without `.` and `..`, in whatever order the OS gives.
pub fn read_dir(dir: &DirHandle) -> io::Result<Vec<Vec<u8>>> {
    // `closedir` closes the descriptor it was given, so hand it a copy.
    let dup_fd = unsafe { libc::dup(dir.as_raw_fd()) };
    if dup_fd < 0 {
        return Err(io::Error::last_os_error());
    }
    let dirp = unsafe { libc::fdopendir(dup_fd) };
    if dirp.is_null() {
        let err = io::Error::last_os_error();
        unsafe { libc::close(dup_fd) };
        return Err(err);
    }
    // The duplicate shares its offset with `dir`, which may have been
    // listed before.
    unsafe { libc::rewinddir(dirp) };

    let mut names = Vec::new();
    loop {
        set_errno(0);
        let ent = unsafe { libc::readdir(dirp) };
        if ent.is_null() {
            let err = errno();
            if err == 0 {
                break;
            }
            unsafe { libc::closedir(dirp) };
            return Err(io::Error::from_raw_os_error(err));
        }
        let name = unsafe { CStr::from_ptr((*ent).d_name.as_ptr()) }
            .to_bytes()
            .to_vec();
        if name == b"." || name == b".." {
            continue;
        }
        names.push(name);
    }
    unsafe { libc::closedir(dirp) };
    Ok(names)
}

fn stat_from_libc(st: &libc::stat) -> Stat {
    let file_type = if (st.st_mode & libc::S_IFMT) == libc::S_IFDIR {
        FileType::new_dir()
    } else if (st.st_mode & libc::S_IFMT) == libc::S_IFLNK {
        FileType::new_symlink()
    } else {
        FileType::new_file()
    };

    Stat {
        file_type,
        perm: (st.st_mode & 0o7777) as u32,
        size: st.st_size as u64,
        modified: stat_mtime(st),
    }
}

fn stat_mtime(st: &libc::stat) -> u64 {
    let secs = u64::try_from(st.st_mtime).unwrap_or_default();
    let nanos = u64::try_from(st.st_mtime_nsec).unwrap_or_default();
    secs.saturating_mul(1_000_000_000).saturating_add(nanos)
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn errno() -> i32 {
    unsafe { *libc::__errno_location() }
}

#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
fn errno() -> i32 {
    unsafe { *libc::__error() }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn set_errno(val: i32) {
    unsafe {
        *libc::__errno_location() = val;
    }
}

#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
fn set_errno(val: i32) {
    unsafe {
        *libc::__error() = val;
    }
}

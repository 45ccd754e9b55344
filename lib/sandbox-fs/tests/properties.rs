//! Behavior every backend and wrapper must agree on.

use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use pretty_assertions::assert_eq;
use sandbox_fs::{
    Capability, ChrootFileSystem, FsError, MountFileSystem, Polyfill, SharedFileSystem,
    capabilities, host_fs, mem_fs, ops,
};
use tempfile::TempDir;

/// Every full filesystem, each paired with whatever keeps it alive.
fn filesystems() -> Vec<(&'static str, SharedFileSystem, Option<TempDir>)> {
    let mut all: Vec<(&'static str, SharedFileSystem, Option<TempDir>)> = vec![
        ("mem_fs", Arc::new(mem_fs::FileSystem::default()), None),
        (
            "mem_fs unsynchronized",
            Arc::new(mem_fs::FileSystem::<mem_fs::SingleThreaded>::unsynchronized()),
            None,
        ),
        (
            "chroot over mem_fs",
            Arc::new(ChrootFileSystem::new(
                Arc::new(mem_fs::FileSystem::default()),
                "/jail",
            )),
            None,
        ),
        (
            "mount over mem_fs",
            Arc::new(MountFileSystem::new(
                Arc::new(mem_fs::FileSystem::default()),
                "/",
                Arc::new(mem_fs::FileSystem::default()),
            )),
            None,
        ),
    ];

    let temp = TempDir::new().unwrap();
    let host = host_fs::FileSystem::with_root(temp.path()).unwrap();
    all.push(("host_fs", Arc::new(host), Some(temp)));

    #[cfg(unix)]
    {
        let temp = TempDir::new().unwrap();
        let root = sandbox_fs::root_fs::RootFileSystem::new(temp.path());
        all.push(("root_fs", Arc::new(root), Some(temp)));

        let temp = TempDir::new().unwrap();
        let root = sandbox_fs::root_fs::Root::open(temp.path()).unwrap();
        let root = sandbox_fs::root_fs::RootFileSystem::with_root(Arc::new(root));
        all.push(("root_fs shared", Arc::new(root), Some(temp)));
    }

    all
}

#[test_log::test]
fn write_close_reopen_read() {
    for (name, fs, _guard) in filesystems() {
        let mut file = fs.create(Path::new("round/trip.txt")).unwrap();
        file.write_all(b"the same bytes").unwrap();
        file.close().unwrap();

        let mut file = fs.open(Path::new("round/trip.txt")).unwrap();
        let mut content = Vec::new();
        file.read_to_end(&mut content).unwrap();
        assert_eq!(content, b"the same bytes", "{name}");
    }
}

#[test_log::test]
fn close_twice() {
    for (name, fs, _guard) in filesystems() {
        let mut file = fs.create(Path::new("closing")).unwrap();
        assert_eq!(file.close(), Ok(()), "{name}");
        assert_eq!(file.close(), Err(FsError::FileClosed), "{name}");
    }
}

#[test_log::test]
fn append_with_truncate_still_appends() {
    for (name, fs, _guard) in filesystems() {
        ops::write_file(fs.as_ref(), "log", b"old").unwrap();

        let mut file = fs
            .new_open_options()
            .append(true)
            .truncate(true)
            .open("log")
            .unwrap();
        file.write_all(b"ab").unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();
        file.write_all(b"cd").unwrap();
        file.close().unwrap();

        assert_eq!(ops::read_file(fs.as_ref(), "log").unwrap(), b"abcd", "{name}");
    }
}

#[test_log::test]
fn sparse_write() {
    for (name, fs, _guard) in filesystems() {
        let mut file = fs.create(Path::new("sparse")).unwrap();
        assert_eq!(file.write_at(b"TEST", 10), Ok(4), "{name}");
        file.close().unwrap();

        let content = ops::read_file(fs.as_ref(), "sparse").unwrap();
        let mut expected = vec![0u8; 10];
        expected.extend_from_slice(b"TEST");
        assert_eq!(content, expected, "{name}");

        let file = fs.open(Path::new("sparse")).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(file.read_at(&mut buf, 10), Ok(4), "{name}: short read at the end");
        assert_eq!(file.read_at(&mut buf, 14), Ok(0), "{name}: read at the end");
        assert_eq!(file.read_at(&mut buf, 100), Ok(0), "{name}: read past the end");
    }
}

#[test_log::test]
fn create_dir_all_creates_parents() {
    for (name, fs, _guard) in filesystems() {
        fs.create_dir_all(Path::new("foo/bar/baz"), 0o755).unwrap();

        assert!(fs.stat(Path::new("foo/bar")).unwrap().is_dir(), "{name}");
        assert!(fs.stat(Path::new("foo/bar/baz")).unwrap().is_dir(), "{name}");
        assert_eq!(
            fs.create_dir_all(Path::new("foo/bar"), 0o755),
            Ok(()),
            "{name}: existing directories are fine"
        );
    }
}

#[cfg(unix)]
#[test_log::test]
fn symlink_then_readlink() {
    for (name, fs, _guard) in filesystems() {
        fs.symlink(Path::new("target"), Path::new("link")).unwrap();
        assert_eq!(
            fs.readlink(Path::new("link")),
            Ok(PathBuf::from("target")),
            "{name}"
        );
        assert!(fs.lstat(Path::new("link")).unwrap().is_symlink(), "{name}");
        assert_eq!(
            fs.stat(Path::new("link")),
            Err(FsError::EntityNotFound),
            "{name}: dangling"
        );

        ops::write_file(fs.as_ref(), "target", b"now").unwrap();
        assert_eq!(ops::read_file(fs.as_ref(), "link").unwrap(), b"now", "{name}");
    }
}

#[test_log::test]
fn rename_keeps_content() {
    for (name, fs, _guard) in filesystems() {
        ops::write_file(fs.as_ref(), "a", b"twelve bytes").unwrap();

        fs.rename(Path::new("a"), Path::new("b")).unwrap();
        assert_eq!(fs.stat(Path::new("a")), Err(FsError::EntityNotFound), "{name}");
        assert_eq!(fs.stat(Path::new("b")).unwrap().len, 12, "{name}");
    }
}

#[test_log::test]
fn remove_rules() {
    for (name, fs, _guard) in filesystems() {
        ops::touch(fs.as_ref(), "dir/file").unwrap();

        assert_eq!(
            fs.remove(Path::new("dir")),
            Err(FsError::DirectoryNotEmpty),
            "{name}"
        );
        assert_eq!(
            fs.remove(Path::new("missing")),
            Err(FsError::EntityNotFound),
            "{name}"
        );

        ops::remove_all(fs.as_ref(), "dir").unwrap();
        assert!(!ops::exists(fs.as_ref(), "dir"), "{name}");
    }
}

#[test_log::test]
fn read_dir_lists_children_in_order() {
    for (name, fs, _guard) in filesystems() {
        ops::touch(fs.as_ref(), "list/c").unwrap();
        ops::touch(fs.as_ref(), "list/a/deep/file").unwrap();
        ops::touch(fs.as_ref(), "list/b").unwrap();

        let names: Vec<_> = fs
            .read_dir(Path::new("list"))
            .unwrap()
            .map(|entry| entry.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec!["a", "b", "c"], "{name}");
    }
}

#[test_log::test]
fn temp_files_are_unique() {
    for (name, fs, _guard) in filesystems() {
        let mut names = Vec::new();
        for _ in 0..8 {
            let mut file = fs.temp_file(Path::new("tmp"), "unique").unwrap();
            names.push(file.name().to_path_buf());
            file.close().unwrap();
        }
        names.sort();
        names.dedup();
        assert_eq!(names.len(), 8, "{name}");
    }
}

#[test_log::test]
fn wrappers_report_the_intersection() {
    for (name, fs, _guard) in filesystems() {
        let wrapped = ChrootFileSystem::new(fs.clone(), "/");
        assert_eq!(capabilities(&wrapped), capabilities(fs.as_ref()), "{name}");

        let mem: SharedFileSystem = Arc::new(mem_fs::FileSystem::default());
        let mounted = MountFileSystem::new(fs.clone(), "/mem", mem.clone());
        assert_eq!(
            capabilities(&mounted),
            capabilities(fs.as_ref()) & capabilities(mem.as_ref()),
            "{name}"
        );
    }

    let polyfilled = Polyfill::new(mem_fs::FileSystem::default());
    assert_eq!(
        capabilities(&polyfilled),
        capabilities(&mem_fs::FileSystem::default())
    );
    assert!(!capabilities(&polyfilled).contains(Capability::LOCK));
}

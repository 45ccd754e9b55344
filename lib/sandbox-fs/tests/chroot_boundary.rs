use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use sandbox_fs::{
    Basic, Chroot, ChrootFileSystem, Dir, File, FileOpener, FsError, Metadata, OpenOptions,
    OpenOptionsConfig, ReadDir, Result, SharedFileSystem, Symlink, TempFile, mem_fs, ops,
};

/// An in-memory filesystem that remembers every path it was asked about.
#[derive(Debug, Default)]
struct Recording {
    inner: mem_fs::FileSystem,
    seen: Mutex<Vec<PathBuf>>,
}

impl Recording {
    fn record(&self, path: &Path) {
        self.seen.lock().push(path.to_path_buf());
    }

    fn seen(&self) -> Vec<PathBuf> {
        self.seen.lock().clone()
    }
}

impl FileOpener for Recording {
    fn open_file(&self, path: &Path, conf: &OpenOptionsConfig) -> Result<Box<dyn File>> {
        self.record(path);
        self.inner.open_file(path, conf)
    }
}

impl Basic for Recording {
    fn new_open_options(&self) -> OpenOptions<'_> {
        OpenOptions::new(self)
    }

    fn stat(&self, path: &Path) -> Result<Metadata> {
        self.record(path);
        self.inner.stat(path)
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        self.record(from);
        self.record(to);
        self.inner.rename(from, to)
    }

    fn remove(&self, path: &Path) -> Result<()> {
        self.record(path);
        self.inner.remove(path)
    }
}

impl TempFile for Recording {
    fn temp_file(&self, dir: &Path, prefix: &str) -> Result<Box<dyn File>> {
        self.record(dir);
        self.inner.temp_file(dir, prefix)
    }
}

impl Dir for Recording {
    fn read_dir(&self, path: &Path) -> Result<ReadDir> {
        self.record(path);
        self.inner.read_dir(path)
    }

    fn create_dir_all(&self, path: &Path, mode: u32) -> Result<()> {
        self.record(path);
        self.inner.create_dir_all(path, mode)
    }
}

impl Symlink for Recording {
    fn lstat(&self, path: &Path) -> Result<Metadata> {
        self.record(path);
        self.inner.lstat(path)
    }

    fn symlink(&self, target: &Path, link: &Path) -> Result<()> {
        self.record(link);
        self.inner.symlink(target, link)
    }

    fn readlink(&self, link: &Path) -> Result<PathBuf> {
        self.record(link);
        self.inner.readlink(link)
    }
}

impl Chroot for Recording {
    fn chroot(&self, path: &Path) -> Result<SharedFileSystem> {
        self.record(path);
        self.inner.chroot(path)
    }

    fn root(&self) -> &Path {
        self.inner.root()
    }
}

fn setup() -> (Arc<Recording>, ChrootFileSystem) {
    let recording = Arc::new(Recording::default());
    let fs = ChrootFileSystem::new(recording.clone(), "/foo");
    (recording, fs)
}

const CROSSING: &[&str] = &["..", "../bar", "a/../../bar", "./../foo/x", "a/b/../../../c"];

#[test_log::test]
fn crossing_paths_never_reach_the_backend() {
    let (recording, fs) = setup();

    for path in CROSSING {
        let path = Path::new(path);
        let inside = Path::new("inside");

        let results = [
            ("open", fs.open(path).map(|_| ())),
            ("create", fs.create(path).map(|_| ())),
            (
                "open_file",
                fs.new_open_options().write(true).open(path).map(|_| ()),
            ),
            ("stat", fs.stat(path).map(|_| ())),
            ("lstat", fs.lstat(path).map(|_| ())),
            ("rename from", fs.rename(path, inside)),
            ("rename to", fs.rename(inside, path)),
            ("remove", fs.remove(path)),
            ("read_dir", fs.read_dir(path).map(|_| ())),
            ("create_dir_all", fs.create_dir_all(path, 0o755)),
            ("temp_file", fs.temp_file(path, "tmp").map(|_| ())),
            ("symlink", fs.symlink(Path::new("target"), path)),
            ("readlink", fs.readlink(path).map(|_| ())),
            ("chroot", fs.chroot(path).map(|_| ())),
        ];

        for (operation, result) in results {
            assert_eq!(
                result,
                Err(FsError::CrossedBoundary),
                "{operation} on {} must be rejected",
                path.display()
            );
        }
    }

    assert_eq!(recording.seen(), Vec::<PathBuf>::new());
}

#[test_log::test]
fn symlink_targets_are_checked_before_delegating() {
    let (recording, fs) = setup();

    assert_eq!(
        fs.symlink(Path::new("../../etc/passwd"), Path::new("dir/link")),
        Err(FsError::CrossedBoundary)
    );
    assert_eq!(recording.seen(), Vec::<PathBuf>::new());

    fs.symlink(Path::new("../sibling"), Path::new("dir/link"))
        .unwrap();
    assert_eq!(recording.seen(), vec![PathBuf::from("/foo/dir/link")]);
}

#[test_log::test]
fn paths_inside_are_joined_onto_the_base() {
    let (recording, fs) = setup();

    ops::touch(&fs, "bar").unwrap();
    ops::touch(&fs, "/baz").unwrap();
    let _ = fs.stat(Path::new("a/../qux"));

    assert_eq!(
        recording.seen(),
        vec![
            PathBuf::from("/foo/bar"),
            PathBuf::from("/foo/baz"),
            PathBuf::from("/foo/qux"),
        ]
    );
    assert!(ops::is_file(&recording.inner, "/foo/bar"));
}

#[test_log::test]
fn nested_chroots_compose() {
    let mem = Arc::new(mem_fs::FileSystem::default());
    let outer = ChrootFileSystem::new(mem.clone(), "/a");

    let mut fs: SharedFileSystem = Arc::new(outer);
    for level in ["b", "c", "d"] {
        fs = fs.chroot(Path::new(level)).unwrap();
    }

    assert_eq!(fs.root(), Path::new("/a/b/c/d"));
    ops::write_file(fs.as_ref(), "file", b"deep").unwrap();
    assert_eq!(ops::read_file(mem.as_ref(), "/a/b/c/d/file").unwrap(), b"deep");
    assert_eq!(
        fs.open(Path::new("../file")).map(|_| ()),
        Err(FsError::CrossedBoundary)
    );
}

use std::io;
use std::path::Path;
use std::sync::Arc;

/// Filesystem operations the controller needs. Abstracted so tests can run
/// against an in-memory hierarchy instead of `/sys/fs/cgroup`.
pub trait FsProvider: Send + Sync {
    fn exists(&self, p: &Path) -> bool;
    fn create_dir(&self, p: &Path) -> io::Result<()>;
    fn remove_dir(&self, p: &Path) -> io::Result<()>;
    /// Single `write(2)` of `data`; cgroup control files reject partial writes.
    fn write_str(&self, p: &Path, data: &str) -> io::Result<()>;
    fn read_to_string(&self, p: &Path) -> io::Result<String>;
}

/// Real filesystem provider.
#[derive(Clone, Copy, Debug, Default)]
pub struct RealFs;

impl FsProvider for RealFs {
    fn exists(&self, p: &Path) -> bool {
        p.exists()
    }

    fn create_dir(&self, p: &Path) -> io::Result<()> {
        std::fs::create_dir(p)
    }

    fn remove_dir(&self, p: &Path) -> io::Result<()> {
        std::fs::remove_dir(p)
    }

    fn write_str(&self, p: &Path, data: &str) -> io::Result<()> {
        use std::io::Write;
        // Control files must not be truncated or created.
        let mut f = std::fs::OpenOptions::new().write(true).open(p)?;
        f.write_all(data.as_bytes())
    }

    fn read_to_string(&self, p: &Path) -> io::Result<String> {
        std::fs::read_to_string(p)
    }
}

/// Lets a controller hold a type-erased provider (`Cgroup<Arc<dyn FsProvider>>`).
impl<T: FsProvider + ?Sized> FsProvider for Arc<T> {
    fn exists(&self, p: &Path) -> bool {
        (**self).exists(p)
    }

    fn create_dir(&self, p: &Path) -> io::Result<()> {
        (**self).create_dir(p)
    }

    fn remove_dir(&self, p: &Path) -> io::Result<()> {
        (**self).remove_dir(p)
    }

    fn write_str(&self, p: &Path, data: &str) -> io::Result<()> {
        (**self).write_str(p, data)
    }

    fn read_to_string(&self, p: &Path) -> io::Result<String> {
        (**self).read_to_string(p)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_real_fs_write_requires_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let fs = RealFs;
        let missing = dir.path().join("tasks");
        let err = fs.write_str(&missing, "1").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);

        std::fs::write(&missing, "").unwrap();
        fs.write_str(&missing, "42").unwrap();
        assert_eq!(fs.read_to_string(&missing).unwrap(), "42");
    }

    #[test]
    fn test_real_fs_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let fs = RealFs;
        let g = dir.path().join("grp");
        assert!(!fs.exists(&g));
        fs.create_dir(&g).unwrap();
        assert!(fs.exists(&g));
        assert_eq!(
            fs.create_dir(&g).unwrap_err().raw_os_error(),
            Some(libc::EEXIST)
        );
        fs.remove_dir(&g).unwrap();
        assert!(!fs.exists(&g));
    }
}

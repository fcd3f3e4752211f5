//! Filesystem space accounting and filling it with a preallocated file.

use std::fs::{self, File};
use std::io;
use std::os::fd::AsRawFd;
use std::path::Path;

use log::debug;
use nix::errno::Errno;
use nix::fcntl::{fallocate, FallocateFlags};
use nix::sys::statvfs::statvfs;

use crate::{Error, Result};

/// Space left unfilled when a fill would take every free block, so that
/// whatever lives on the filesystem can still write a little.
pub const RESERVE_KB: u64 = 10;

/// Space of the filesystem holding a directory, in KB.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DiskUsage {
    pub total_kb: u64,
    /// Available to unprivileged users
    pub free_kb: u64,
    pub used_kb: u64,
}

impl DiskUsage {
    pub fn of(dir: &Path) -> Result<Self> {
        let st = statvfs(dir).map_err(|e| Error::Io {
            path: dir.to_path_buf(),
            source: io::Error::from(e),
        })?;
        let frag = st.fragment_size() as u64;
        let kb = |blocks: u64| blocks.saturating_mul(frag) / 1024;
        Ok(Self {
            total_kb: kb(st.blocks() as u64),
            free_kb: kb(st.blocks_available() as u64),
            used_kb: kb((st.blocks() as u64).saturating_sub(st.blocks_free() as u64)),
        })
    }

    /// Used share of what non-root users can reach, as `df` reports it.
    pub fn used_percent(&self) -> f64 {
        let reachable = self.used_kb + self.free_kb;
        if reachable == 0 {
            return 0.0;
        }
        self.used_kb as f64 / reachable as f64 * 100.0
    }

    /// KB to add so that usage reaches `percent`.
    pub fn kbytes_for_percent(&self, percent: u32) -> Result<u64> {
        let used = self.used_percent();
        if f64::from(percent) < used {
            return Err(Error::invalid(
                format!("{}%", percent),
                format!("current disk usage is {:.2}%, no need to fill", used),
            ));
        }
        Ok(((f64::from(percent) - used) / 100.0 * self.total_kb as f64) as u64)
    }

    /// Check `kb` against free space. Taking exactly all of it leaves
    /// [`RESERVE_KB`] behind.
    pub fn fit(&self, kb: u64) -> Result<u64> {
        if kb > self.free_kb {
            return Err(Error::NoSpace {
                fill_kb: kb,
                free_kb: self.free_kb,
            });
        }
        let kb = if kb == self.free_kb {
            kb.saturating_sub(RESERVE_KB)
        } else {
            kb
        };
        if kb == 0 {
            return Err(Error::invalid("0KB", "fill size must be larger than 0KB"));
        }
        Ok(kb)
    }
}

/// Create `path` holding `size_kb` KB of allocated blocks. Filesystems
/// without `fallocate` get the data written instead. A partial file is
/// removed on error.
pub fn allocate_file(path: &Path, size_kb: u64) -> Result<()> {
    let io_err = |e: io::Error| Error::Io {
        path: path.to_path_buf(),
        source: e,
    };
    let f = File::create(path).map_err(io_err)?;
    let len = i64::try_from(size_kb.saturating_mul(1024))
        .map_err(|_| Error::invalid(format!("{}KB", size_kb), "too large"))?;
    let res = match fallocate(f.as_raw_fd(), FallocateFlags::empty(), 0, len) {
        Ok(()) => f.sync_all().map_err(io_err),
        Err(Errno::EOPNOTSUPP) => {
            debug!("space: fallocate unsupported at {}, writing", path.display());
            drop(f);
            crate::memory::fill_file(path, size_kb)
        }
        Err(e) => Err(io_err(io::Error::from(e))),
    };
    if res.is_err() {
        let _ = fs::remove_file(path);
    }
    res
}

/// Remove `path`; a missing file is fine.
pub fn remove_file(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(Error::Io {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn usage(total: u64, used: u64, free: u64) -> DiskUsage {
        DiskUsage {
            total_kb: total,
            free_kb: free,
            used_kb: used,
        }
    }

    #[test]
    fn test_kbytes_for_percent() {
        let u = usage(1000, 250, 750);
        assert!((u.used_percent() - 25.0).abs() < 1e-9);
        assert_eq!(u.kbytes_for_percent(50).unwrap(), 250);
        let err = u.kbytes_for_percent(20).unwrap_err();
        assert!(err.to_string().contains("current disk usage is 25.00%"));
    }

    #[test]
    fn test_fit() {
        let u = usage(1000, 250, 750);
        assert_eq!(u.fit(100).unwrap(), 100);
        assert_eq!(u.fit(750).unwrap(), 740);
        assert!(matches!(
            u.fit(751),
            Err(Error::NoSpace {
                fill_kb: 751,
                free_kb: 750
            })
        ));
        assert!(u.fit(0).is_err());
        assert!(usage(100, 95, 5).fit(5).is_err());
    }

    #[test]
    fn test_usage_of_tempdir() {
        let tmp = tempdir().unwrap();
        let u = DiskUsage::of(tmp.path()).unwrap();
        assert!(u.total_kb > 0);
        assert!(u.free_kb <= u.total_kb);
        assert!(DiskUsage::of(&tmp.path().join("missing")).is_err());
    }

    #[test]
    fn test_allocate_and_remove() {
        let tmp = tempdir().unwrap();
        let p = tmp.path().join("chaosmeta_fill1.dat");
        allocate_file(&p, 64).unwrap();
        assert_eq!(fs::metadata(&p).unwrap().len(), 64 * 1024);
        assert!(remove_file(&p).unwrap());
        assert!(!remove_file(&p).unwrap());

        let bad = tmp.path().join("missing").join("f.dat");
        assert!(allocate_file(&bad, 1).is_err());
    }
}

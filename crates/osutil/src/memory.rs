//! Memory accounting and the two ways of consuming memory: a tmpfs-backed
//! file (page cache) or an anonymous buffer held by a helper process.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, warn};
use nix::mount::{self, MntFlags, MsFlags};

use crate::process::ProcFs;
use crate::{Error, Result};

/// File created inside the tmpfs mount.
pub const FILL_FILE: &str = "chaosmeta_fill";

/// Host memory in KB, as reported by `/proc/meminfo`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MemInfo {
    pub total_kb: u64,
    pub available_kb: u64,
}

impl MemInfo {
    pub fn parse(content: &str) -> Option<Self> {
        let mut total = None;
        let mut avail = None;
        for line in content.lines() {
            let mut it = line.split_whitespace();
            let (Some(key), Some(val)) = (it.next(), it.next()) else {
                continue;
            };
            match key {
                "MemTotal:" => total = val.parse().ok(),
                "MemAvailable:" => avail = val.parse().ok(),
                _ => {}
            }
        }
        Some(Self {
            total_kb: total?,
            available_kb: avail?,
        })
    }

    pub fn read(procfs: &ProcFs) -> Result<Self> {
        let path = procfs.root().join("meminfo");
        let content = fs::read_to_string(&path).map_err(|e| Error::Io {
            path: path.clone(),
            source: e,
        })?;
        Self::parse(&content).ok_or_else(|| {
            Error::invalid(path.display().to_string(), "MemTotal or MemAvailable missing")
        })
    }

    /// Build from cgroup byte counters.
    pub fn from_cgroup_bytes(limit: u64, usage: u64) -> Self {
        Self {
            total_kb: limit / 1024,
            available_kb: limit.saturating_sub(usage) / 1024,
        }
    }

    pub fn used_percent(&self) -> f64 {
        if self.total_kb == 0 {
            return 0.0;
        }
        let used = self.total_kb.saturating_sub(self.available_kb) as f64;
        used / self.total_kb as f64 * 100.0
    }

    /// KB to add so that usage reaches `percent` of the total.
    pub fn kbytes_to_fill(&self, percent: u32) -> Result<u64> {
        let used = self.used_percent();
        let target = f64::from(percent);
        if target < used {
            return Err(Error::NoNeedToFill { used });
        }
        let fill = ((target - used) / 100.0 * self.total_kb as f64).round() as u64;
        if fill == 0 {
            return Err(Error::invalid(
                format!("{}%", percent),
                "need to fill mem is 0KB",
            ));
        }
        Ok(fill)
    }
}

/// Mount a tmpfs of `size_kb` at `dir`, creating the directory.
pub fn mount_tmpfs(dir: &Path, size_kb: u64) -> Result<()> {
    fs::create_dir_all(dir).map_err(|e| Error::Io {
        path: dir.to_path_buf(),
        source: e,
    })?;
    let opts = format!("size={}k", size_kb);
    mount::mount(
        Some("tmpfs"),
        dir,
        Some("tmpfs"),
        MsFlags::empty(),
        Some(opts.as_str()),
    )
    .map_err(|source| Error::Mount {
        op: "mount tmpfs",
        path: dir.to_path_buf(),
        source,
    })?;
    debug!("memory: mounted tmpfs {} with {}", dir.display(), opts);
    Ok(())
}

/// Write `size_kb` KB of data to `path`. Data is written rather than
/// allocated sparsely so that every page is charged.
pub fn fill_file(path: &Path, size_kb: u64) -> Result<()> {
    let io_err = |e: io::Error| Error::Io {
        path: path.to_path_buf(),
        source: e,
    };
    let mut f = File::create(path).map_err(io_err)?;
    let chunk = vec![0x5au8; 1024 * 1024];
    let mut left = size_kb * 1024;
    while left > 0 {
        let n = left.min(chunk.len() as u64) as usize;
        f.write_all(&chunk[..n]).map_err(io_err)?;
        left -= n as u64;
    }
    f.sync_all().map_err(io_err)
}

/// Mount a tmpfs at `dir` and fill it with `size_kb` KB. The mount is left
/// in place on a fill error so a later undo can clean it up.
pub fn fill_tmpfs(dir: &Path, size_kb: u64) -> Result<PathBuf> {
    mount_tmpfs(dir, size_kb)?;
    let file = dir.join(FILL_FILE);
    fill_file(&file, size_kb)?;
    Ok(file)
}

/// Unmount and remove a fill directory. A directory that is not mounted or
/// already gone is fine.
pub async fn undo_tmpfs(dir: &Path) -> Result<()> {
    match mount::umount2(dir, MntFlags::empty()) {
        Ok(()) => debug!("memory: unmounted {}", dir.display()),
        Err(nix::errno::Errno::EINVAL) | Err(nix::errno::Errno::ENOENT) => {
            debug!("memory: {} is not mounted", dir.display())
        }
        Err(e) => warn!("memory: umount {} error: {}", dir.display(), e),
    }
    tokio::time::sleep(Duration::from_millis(500)).await;
    match fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::Io {
            path: dir.to_path_buf(),
            source: e,
        }),
    }
}

/// Allocate `size_kb` KB and touch every byte so the memory is resident.
/// An amount the allocator refuses is an error rather than an abort.
pub fn hold_memory(size_kb: u64) -> Result<Vec<u8>> {
    let len = usize::try_from(size_kb)
        .ok()
        .and_then(|kb| kb.checked_mul(1024))
        .ok_or_else(|| Error::invalid(format!("{}KB", size_kb), "too large to allocate"))?;
    let mut buf = Vec::new();
    buf.try_reserve_exact(len)
        .map_err(|e| Error::invalid(format!("{}KB", size_kb), format!("allocate error: {}", e)))?;
    buf.resize(len, 0x5a);
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const MEMINFO: &str = "MemTotal:       16000000 kB\n\
                           MemFree:         1000000 kB\n\
                           MemAvailable:   10560000 kB\n\
                           Buffers:          200000 kB\n";

    #[test]
    fn test_parse_meminfo() {
        let m = MemInfo::parse(MEMINFO).unwrap();
        assert_eq!(m.total_kb, 16000000);
        assert_eq!(m.available_kb, 10560000);
        assert!((m.used_percent() - 34.0).abs() < 1e-9);
        assert!(MemInfo::parse("MemTotal: 1 kB\n").is_none());
    }

    #[test]
    fn test_read_meminfo_from_procfs() {
        let tmp = tempdir().unwrap();
        fs::write(tmp.path().join("meminfo"), MEMINFO).unwrap();
        let m = MemInfo::read(&ProcFs::new(tmp.path())).unwrap();
        assert_eq!(m.total_kb, 16000000);
    }

    #[test]
    fn test_fill_below_current_usage() {
        let m = MemInfo::parse(MEMINFO).unwrap();
        let err = m.kbytes_to_fill(30).unwrap_err();
        assert_eq!(
            err.to_string(),
            "current mem usage is 34.00%, no need to fill any mem"
        );
        assert_eq!(m.kbytes_to_fill(50).unwrap(), 2560000);
        assert_eq!(m.kbytes_to_fill(100).unwrap(), 10560000);
    }

    #[test]
    fn test_from_cgroup_bytes() {
        let m = MemInfo::from_cgroup_bytes(1024 * 1024 * 1024, 256 * 1024 * 1024);
        assert_eq!(m.total_kb, 1024 * 1024);
        assert_eq!(m.available_kb, 768 * 1024);
        assert!((m.used_percent() - 25.0).abs() < 1e-9);
    }

    #[test]
    fn test_fill_file_size() {
        let tmp = tempdir().unwrap();
        let p = tmp.path().join("f");
        fill_file(&p, 1500).unwrap();
        assert_eq!(fs::metadata(&p).unwrap().len(), 1500 * 1024);
    }

    #[tokio::test]
    async fn test_undo_tmpfs_on_plain_dir() {
        let tmp = tempdir().unwrap();
        let dir = tmp.path().join("chaosmeta_mem_tmpfs1");
        fs::create_dir(&dir).unwrap();
        fs::write(dir.join(FILL_FILE), "x").unwrap();
        undo_tmpfs(&dir).await.unwrap();
        assert!(!dir.exists());
        // second call finds nothing and still succeeds
        undo_tmpfs(&dir).await.unwrap();
    }

    #[test]
    fn test_hold_memory() {
        let b = hold_memory(4).unwrap();
        assert_eq!(b.len(), 4096);
        assert!(b.iter().all(|x| *x == 0x5a));
        assert!(hold_memory(u64::MAX).is_err());
    }
}

//! Memory accounting of a cgroup.

use crate::{Cgroup, FsProvider, Result, Subsystem};

pub const LIMIT_IN_BYTES_FILE: &str = "memory.limit_in_bytes";
pub const USAGE_IN_BYTES_FILE: &str = "memory.usage_in_bytes";

/// Limits at or above this are the kernel's "no limit" value
/// (`PAGE_COUNTER_MAX` pages, 0x7FFFFFFFFFFFF000 on 4K pages).
pub const UNLIMITED_THRESHOLD: u64 = 1 << 62;

/// Limit and usage of one memory group, in bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryUsage {
    pub limit: u64,
    pub usage: u64,
}

impl MemoryUsage {
    pub fn available(&self) -> u64 {
        self.limit.saturating_sub(self.usage)
    }

    pub fn is_unlimited(&self) -> bool {
        self.limit >= UNLIMITED_THRESHOLD
    }
}

impl<P: FsProvider> Cgroup<P> {
    /// Read limit and usage of the memory group `rel`.
    pub fn memory_usage(&self, rel: &str) -> Result<MemoryUsage> {
        let dir = self.subsystem_path(Subsystem::Memory, rel);
        Ok(MemoryUsage {
            limit: self.read_u64(&dir, LIMIT_IN_BYTES_FILE)?,
            usage: self.read_u64(&dir, USAGE_IN_BYTES_FILE)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockFs;
    use crate::Config;
    use std::path::Path;

    #[test]
    fn test_memory_usage() {
        let fs = MockFs::default();
        let dir = Path::new("/sys/fs/cgroup/memory/kubepods/pod1");
        fs.add_dir(dir);
        fs.add_file(&dir.join(LIMIT_IN_BYTES_FILE), "2048\n");
        fs.add_file(&dir.join(USAGE_IN_BYTES_FILE), "512\n");
        let cg = Cgroup::with_provider(fs.clone(), Config::default());
        let u = cg.memory_usage("/kubepods/pod1").unwrap();
        assert_eq!(u.limit, 2048);
        assert_eq!(u.usage, 512);
        assert_eq!(u.available(), 1536);
        assert!(!u.is_unlimited());

        fs.add_file(&dir.join(LIMIT_IN_BYTES_FILE), "9223372036854771712\n");
        assert!(cg.memory_usage("/kubepods/pod1").unwrap().is_unlimited());
    }
}

//! Cores a cpuset group may run on.

use crate::{Cgroup, Error, FsProvider, Result, Subsystem};

pub const CPUS_FILE: &str = "cpuset.cpus";

/// Parse a kernel cpu list such as `0-2,6`. Order of first appearance is
/// kept and duplicates are dropped. Blank input is an empty list.
pub fn parse_cpu_list(s: &str) -> std::result::Result<Vec<usize>, String> {
    let mut out: Vec<usize> = Vec::new();
    let mut push = |c: usize| {
        if !out.contains(&c) {
            out.push(c);
        }
    };
    for unit in s.split(',').map(str::trim).filter(|u| !u.is_empty()) {
        let num = |t: &str| {
            t.trim()
                .parse::<usize>()
                .map_err(|_| format!("core[{}] is not a non-negative number", t.trim()))
        };
        match unit.split_once('-') {
            Some((a, b)) => {
                let (start, end) = (num(a)?, num(b)?);
                if start > end {
                    return Err(format!("core range {} must be start <= end", unit));
                }
                (start..=end).for_each(&mut push);
            }
            None => push(num(unit)?),
        }
    }
    Ok(out)
}

impl<P: FsProvider> Cgroup<P> {
    /// Cores allowed to the cpuset group `rel`.
    pub fn cpuset_cpus(&self, rel: &str) -> Result<Vec<usize>> {
        let p = self.subsystem_path(Subsystem::Cpuset, rel).join(CPUS_FILE);
        let content = self.fs.read_to_string(&p).map_err(|e| Error::Io {
            path: p.clone(),
            source: e,
        })?;
        parse_cpu_list(&content).map_err(|detail| Error::Parse { path: p, detail })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockFs;
    use crate::Config;
    use std::path::Path;

    #[test]
    fn test_parse_cpu_list() {
        assert_eq!(parse_cpu_list("0-2,6").unwrap(), vec![0, 1, 2, 6]);
        assert_eq!(parse_cpu_list(" 3, 1-2 ,3\n").unwrap(), vec![3, 1, 2]);
        assert!(parse_cpu_list("\n").unwrap().is_empty());
        assert!(parse_cpu_list("2-1").is_err());
        assert!(parse_cpu_list("-1").is_err());
        assert!(parse_cpu_list("a").is_err());
        assert!(parse_cpu_list("1-2-3").is_err());
    }

    #[test]
    fn test_cpuset_cpus() {
        let fs = MockFs::default();
        fs.add_file(Path::new("/sys/fs/cgroup/cpuset/cpuset.cpus"), "0-7\n");
        fs.add_file(
            Path::new("/sys/fs/cgroup/cpuset/docker/c1/cpuset.cpus"),
            "2,4\n",
        );
        let cg = Cgroup::with_provider(fs.clone(), Config::default());
        assert_eq!(cg.cpuset_cpus("/").unwrap().len(), 8);
        assert_eq!(cg.cpuset_cpus("/docker/c1").unwrap(), vec![2, 4]);
        assert!(matches!(cg.cpuset_cpus("/docker/c2"), Err(Error::Io { .. })));

        fs.add_file(Path::new("/sys/fs/cgroup/cpuset/docker/c1/cpuset.cpus"), "x");
        assert!(matches!(cg.cpuset_cpus("/docker/c1"), Err(Error::Parse { .. })));
    }
}

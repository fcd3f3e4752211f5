//! cgroup v1 controller used by the fault injectors.
//!
//! Groups are plain directories under `<root>/<subsystem>`; processes are
//! moved by writing their pid to a group's `tasks` file and located by
//! parsing `/proc/<pid>/cgroup`.

pub mod blkio;
pub mod cpuset;
mod fs;
pub mod memory;
#[cfg(any(test, feature = "test-utils"))]
pub mod mock;

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use log::{debug, warn};

pub use fs::{FsProvider, RealFs};

/// Errors returned by the controller.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("process {pid} does not exist")]
    NoSuchPid { pid: i32 },
    #[error("process {pid} has no {subsystem} cgroup")]
    NoSubsystem { pid: i32, subsystem: Subsystem },
    #[error("cgroup {path} already exists")]
    Exists { path: PathBuf },
    #[error("apply limit {file} error: {source}")]
    Limit {
        file: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid content in {path}: {detail}")]
    Parse { path: PathBuf, detail: String },
}

pub type Result<T> = std::result::Result<T, Error>;

/// cgroup v1 hierarchies the injectors touch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Subsystem {
    Blkio,
    Memory,
    Cpu,
    Cpuset,
}

impl Subsystem {
    pub fn name(&self) -> &'static str {
        match self {
            Subsystem::Blkio => "blkio",
            Subsystem::Memory => "memory",
            Subsystem::Cpu => "cpu",
            Subsystem::Cpuset => "cpuset",
        }
    }

    /// True if a `/proc/<pid>/cgroup` controller list names this subsystem.
    /// cpu is usually co-mounted as `cpu,cpuacct`.
    fn listed_in(&self, controllers: &str) -> bool {
        controllers.split(',').any(|c| c == self.name())
    }
}

impl fmt::Display for Subsystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Controller configuration.
#[derive(Clone, Debug)]
pub struct Config {
    /// Mount point holding one directory per subsystem
    pub root: PathBuf,
    /// procfs mount, used to resolve a pid's current groups
    pub proc_root: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/sys/fs/cgroup"),
            proc_root: PathBuf::from("/proc"),
        }
    }
}

/// One control-file write applied when a group is created.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LimitWrite {
    /// File name inside the group directory
    pub file: String,
    pub value: String,
    /// Value that lifts the limit again, written when a later write fails
    pub revert: Option<String>,
}

/// cgroup controller. Generic over `FsProvider` for testability.
pub struct Cgroup<P: FsProvider = RealFs> {
    fs: P,
    cfg: Config,
}

impl Cgroup<RealFs> {
    pub fn new(cfg: Config) -> Self {
        Self { fs: RealFs, cfg }
    }
}

impl Default for Cgroup<RealFs> {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

impl<P: FsProvider> Cgroup<P> {
    pub fn with_provider(fs: P, cfg: Config) -> Self {
        Self { fs, cfg }
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    /// Absolute directory of `rel` (as found in `/proc/<pid>/cgroup`) inside
    /// the given hierarchy.
    pub fn subsystem_path(&self, sub: Subsystem, rel: &str) -> PathBuf {
        let base = self.cfg.root.join(sub.name());
        let rel = rel.trim_start_matches('/');
        if rel.is_empty() {
            base
        } else {
            base.join(rel)
        }
    }

    pub fn exists(&self, path: &Path) -> bool {
        self.fs.exists(path)
    }

    /// Current group of `pid` in hierarchy `sub`, relative to the hierarchy
    /// root (e.g. `/user.slice`).
    pub fn pid_cgroup(&self, pid: i32, sub: Subsystem) -> Result<String> {
        let path = self.cfg.proc_root.join(pid.to_string()).join("cgroup");
        let content = self.fs.read_to_string(&path).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                Error::NoSuchPid { pid }
            } else {
                Error::Io {
                    path: path.clone(),
                    source: e,
                }
            }
        })?;

        for line in content.lines() {
            // hierarchy-id:controller-list:path
            let mut parts = line.splitn(3, ':');
            let (_, controllers, cg) = match (parts.next(), parts.next(), parts.next()) {
                (Some(id), Some(c), Some(p)) => (id, c, p),
                _ => {
                    return Err(Error::Parse {
                        path,
                        detail: format!("malformed line {:?}", line),
                    })
                }
            };
            if sub.listed_in(controllers) {
                return Ok(cg.trim().to_string());
            }
        }
        Err(Error::NoSubsystem {
            pid,
            subsystem: sub,
        })
    }

    /// Record the current group of every pid before any of them is moved.
    pub fn snapshot(&self, pids: &[i32], sub: Subsystem) -> Result<HashMap<i32, String>> {
        let mut map = HashMap::with_capacity(pids.len());
        for &pid in pids {
            map.insert(pid, self.pid_cgroup(pid, sub)?);
        }
        debug!("cgroup: {} snapshot: {:?}", sub, map);
        Ok(map)
    }

    /// Create `path` and apply `limits` one write at a time. If any write
    /// fails, the writes already applied are reverted and the directory is
    /// removed before the error is returned.
    pub fn create_group(&self, path: &Path, limits: &[LimitWrite]) -> Result<()> {
        match self.fs.create_dir(path) {
            Ok(()) => {}
            Err(e) if e.raw_os_error() == Some(libc::EEXIST) => {
                return Err(Error::Exists {
                    path: path.to_path_buf(),
                })
            }
            Err(e) => {
                return Err(Error::Io {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        }

        let mut applied: Vec<&LimitWrite> = Vec::with_capacity(limits.len());
        for w in limits {
            let file = path.join(&w.file);
            if let Err(source) = self.fs.write_str(&file, &w.value) {
                warn!(
                    "cgroup: write {:?} to {} failed: {}; rolling back {} applied writes",
                    w.value,
                    file.display(),
                    source,
                    applied.len()
                );
                self.rollback(path, &applied);
                return Err(Error::Limit { file, source });
            }
            debug!("cgroup: {} <- {}", file.display(), w.value);
            applied.push(w);
        }
        Ok(())
    }

    fn rollback(&self, path: &Path, applied: &[&LimitWrite]) {
        for w in applied.iter().rev() {
            if let Some(revert) = &w.revert {
                let file = path.join(&w.file);
                if let Err(e) = self.fs.write_str(&file, revert) {
                    warn!("cgroup: revert {} failed: {}", file.display(), e);
                }
            }
        }
        if let Err(e) = self.fs.remove_dir(path) {
            warn!("cgroup: remove {} failed: {}", path.display(), e);
        }
    }

    /// Move one pid into the group at `path`.
    pub fn move_pid(&self, pid: i32, path: &Path) -> Result<()> {
        let tasks = path.join("tasks");
        self.fs
            .write_str(&tasks, &pid.to_string())
            .map_err(|e| match e.raw_os_error() {
                Some(libc::ESRCH) => Error::NoSuchPid { pid },
                _ => Error::Io {
                    path: tasks.clone(),
                    source: e,
                },
            })
    }

    pub fn move_pids(&self, pids: &[i32], path: &Path) -> Result<()> {
        for &pid in pids {
            self.move_pid(pid, path)?;
        }
        Ok(())
    }

    /// Pids currently attached to the group at `path`.
    pub fn tasks(&self, path: &Path) -> Result<Vec<i32>> {
        let tasks = path.join("tasks");
        let content = self.fs.read_to_string(&tasks).map_err(|e| Error::Io {
            path: tasks.clone(),
            source: e,
        })?;
        content
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(|l| {
                l.parse::<i32>().map_err(|_| Error::Parse {
                    path: tasks.clone(),
                    detail: format!("{:?} is not a pid", l),
                })
            })
            .collect()
    }

    /// Move every task out of `path`: back to its snapshot group, or to
    /// `fallback` when it has none (e.g. children forked after the move) or
    /// when that group has been removed since. Pids that exited meanwhile
    /// are skipped. Returns the number moved.
    pub fn evacuate(
        &self,
        path: &Path,
        sub: Subsystem,
        snapshot: &HashMap<i32, String>,
        fallback: &str,
    ) -> Result<usize> {
        let mut moved = 0;
        for pid in self.tasks(path)? {
            let dest = match snapshot.get(&pid) {
                Some(p) => p.as_str(),
                None => {
                    warn!(
                        "cgroup: no original {} group for pid {}, moving to {}",
                        sub, pid, fallback
                    );
                    fallback
                }
            };
            let res = match self.move_pid(pid, &self.subsystem_path(sub, dest)) {
                Err(Error::Io { source, .. })
                    if source.kind() == io::ErrorKind::NotFound && dest != fallback =>
                {
                    warn!(
                        "cgroup: {} group {} is gone, moving pid {} to {}",
                        sub, dest, pid, fallback
                    );
                    self.move_pid(pid, &self.subsystem_path(sub, fallback))
                }
                other => other,
            };
            match res {
                Ok(()) => moved += 1,
                Err(Error::NoSuchPid { .. }) => debug!("cgroup: pid {} already gone", pid),
                Err(e) => return Err(e),
            }
        }
        Ok(moved)
    }

    /// Remove the group directory. Returns `false` if it did not exist.
    /// All tasks must have been moved out first.
    pub fn remove_group(&self, path: &Path) -> Result<bool> {
        if !self.fs.exists(path) {
            return Ok(false);
        }
        match self.fs.remove_dir(path) {
            Ok(()) => Ok(true),
            Err(e) if e.raw_os_error() == Some(libc::ENOENT) => Ok(false),
            Err(e) => Err(Error::Io {
                path: path.to_path_buf(),
                source: e,
            }),
        }
    }

    /// Parse a single-number control file such as `memory.limit_in_bytes`.
    pub fn read_u64(&self, path: &Path, file: &str) -> Result<u64> {
        let p = path.join(file);
        let content = self.fs.read_to_string(&p).map_err(|e| Error::Io {
            path: p.clone(),
            source: e,
        })?;
        content.trim().parse::<u64>().map_err(|_| Error::Parse {
            path: p,
            detail: format!("{:?} is not a number", content.trim()),
        })
    }
}

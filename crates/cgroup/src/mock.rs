//! In-memory cgroup v1 hierarchy for tests.
//!
//! Models what the kernel enforces: a pid belongs to exactly one group per
//! subsystem, writing an unknown pid to `tasks` fails with `ESRCH`, and a
//! group with attached tasks cannot be removed (`EBUSY`).

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::{Config, FsProvider, Subsystem};

#[derive(Default)]
struct MockState {
    dirs: HashSet<PathBuf>,
    files: HashMap<PathBuf, String>,
    writes: HashMap<PathBuf, Vec<String>>,
    failing: HashSet<PathBuf>,
    // pid -> subsystem name -> group path relative to the hierarchy root
    procs: BTreeMap<i32, BTreeMap<String, String>>,
}

/// Shared-handle mock; clones observe the same state.
#[derive(Clone)]
pub struct MockFs {
    cfg: Config,
    state: Arc<Mutex<MockState>>,
}

impl Default for MockFs {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

impl MockFs {
    pub fn new(cfg: Config) -> Self {
        let state = MockState::default();
        let fs = Self {
            cfg,
            state: Arc::new(Mutex::new(state)),
        };
        for sub in [
            Subsystem::Blkio,
            Subsystem::Memory,
            Subsystem::Cpu,
            Subsystem::Cpuset,
        ] {
            fs.add_dir(&fs.cfg.root.join(sub.name()));
        }
        fs
    }

    pub fn add_dir(&self, p: &Path) {
        self.state.lock().unwrap().dirs.insert(p.to_path_buf());
    }

    pub fn add_file(&self, p: &Path, content: &str) {
        self.state
            .lock()
            .unwrap()
            .files
            .insert(p.to_path_buf(), content.to_string());
    }

    /// Register a live process and its current groups. The group
    /// directories (and their parents) are created as needed.
    pub fn add_process(&self, pid: i32, groups: &[(Subsystem, &str)]) {
        let mut st = self.state.lock().unwrap();
        for (sub, rel) in groups {
            let base = self.cfg.root.join(sub.name());
            let mut dir = base.clone();
            st.dirs.insert(base);
            for comp in Path::new(rel.trim_start_matches('/')).components() {
                dir.push(comp);
                st.dirs.insert(dir.clone());
            }
            st.procs
                .entry(pid)
                .or_default()
                .insert(sub.name().to_string(), rel.to_string());
        }
    }

    /// Drop a group directory and everything below it, as when systemd
    /// tears down a scope. Processes are not touched.
    pub fn remove_group_dir(&self, p: &Path) {
        let mut st = self.state.lock().unwrap();
        st.dirs.retain(|d| !d.starts_with(p));
        st.files.retain(|f, _| !f.starts_with(p));
    }

    pub fn exit_process(&self, pid: i32) {
        self.state.lock().unwrap().procs.remove(&pid);
    }

    /// Make every write to `p` fail with `EACCES`.
    pub fn fail_writes_to(&self, p: &Path) {
        self.state.lock().unwrap().failing.insert(p.to_path_buf());
    }

    /// Last value written to (or seeded into) a file.
    pub fn file_content(&self, p: &Path) -> Option<String> {
        self.state.lock().unwrap().files.get(p).cloned()
    }

    /// Every successful write to `p`, in order.
    pub fn writes_to(&self, p: &Path) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .writes
            .get(p)
            .cloned()
            .unwrap_or_default()
    }

    pub fn group_of(&self, pid: i32, sub: Subsystem) -> Option<String> {
        let st = self.state.lock().unwrap();
        st.procs.get(&pid).and_then(|g| g.get(sub.name()).cloned())
    }

    /// Split `<root>/<subsystem>/<rel>` into subsystem name and `/rel`.
    fn locate(&self, dir: &Path) -> Option<(String, String)> {
        let rest = dir.strip_prefix(&self.cfg.root).ok()?;
        let mut comps = rest.components();
        let sub = comps.next()?.as_os_str().to_string_lossy().into_owned();
        let rel = comps.as_path().to_string_lossy();
        Some((sub, format!("/{}", rel)))
    }

    fn proc_pid(&self, p: &Path) -> Option<i32> {
        let rest = p.strip_prefix(&self.cfg.proc_root).ok()?;
        let mut comps = rest.components();
        let pid = comps.next()?.as_os_str().to_str()?.parse::<i32>().ok()?;
        if comps.as_path() == Path::new("cgroup") {
            Some(pid)
        } else {
            None
        }
    }
}

fn is_tasks(p: &Path) -> bool {
    p.file_name() == Some(std::ffi::OsStr::new("tasks"))
}

impl FsProvider for MockFs {
    fn exists(&self, p: &Path) -> bool {
        let st = self.state.lock().unwrap();
        if st.dirs.contains(p) || st.files.contains_key(p) {
            return true;
        }
        if is_tasks(p) {
            return p.parent().map(|d| st.dirs.contains(d)).unwrap_or(false);
        }
        match self.proc_pid(p) {
            Some(pid) => st.procs.contains_key(&pid),
            None => false,
        }
    }

    fn create_dir(&self, p: &Path) -> io::Result<()> {
        let mut st = self.state.lock().unwrap();
        if st.dirs.contains(p) {
            return Err(io::Error::from_raw_os_error(libc::EEXIST));
        }
        st.dirs.insert(p.to_path_buf());
        Ok(())
    }

    fn remove_dir(&self, p: &Path) -> io::Result<()> {
        let mut st = self.state.lock().unwrap();
        if !st.dirs.contains(p) {
            return Err(io::Error::from_raw_os_error(libc::ENOENT));
        }
        if st.dirs.iter().any(|d| d != p && d.starts_with(p)) {
            return Err(io::Error::from_raw_os_error(libc::EBUSY));
        }
        if let Some((sub, rel)) = self.locate(p) {
            let busy = st
                .procs
                .values()
                .any(|g| g.get(&sub).map(|r| *r == rel).unwrap_or(false));
            if busy {
                return Err(io::Error::from_raw_os_error(libc::EBUSY));
            }
        }
        st.dirs.remove(p);
        st.files.retain(|f, _| !f.starts_with(p));
        Ok(())
    }

    fn write_str(&self, p: &Path, data: &str) -> io::Result<()> {
        let mut st = self.state.lock().unwrap();
        if st.failing.contains(p) {
            return Err(io::Error::from_raw_os_error(libc::EACCES));
        }
        let dir = p.parent().unwrap_or(Path::new("/"));
        if !st.dirs.contains(dir) {
            return Err(io::Error::from_raw_os_error(libc::ENOENT));
        }
        if is_tasks(p) {
            let (sub, rel) = self
                .locate(dir)
                .ok_or_else(|| io::Error::from_raw_os_error(libc::EINVAL))?;
            let pid = data
                .trim()
                .parse::<i32>()
                .map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))?;
            match st.procs.get_mut(&pid) {
                Some(groups) => {
                    groups.insert(sub, rel);
                }
                None => return Err(io::Error::from_raw_os_error(libc::ESRCH)),
            }
        } else {
            st.files.insert(p.to_path_buf(), data.to_string());
        }
        st.writes
            .entry(p.to_path_buf())
            .or_default()
            .push(data.to_string());
        Ok(())
    }

    fn read_to_string(&self, p: &Path) -> io::Result<String> {
        let st = self.state.lock().unwrap();
        if let Some(s) = st.files.get(p) {
            return Ok(s.clone());
        }
        if is_tasks(p) {
            let dir = p.parent().unwrap_or(Path::new("/"));
            if !st.dirs.contains(dir) {
                return Err(io::Error::from_raw_os_error(libc::ENOENT));
            }
            let (sub, rel) = self
                .locate(dir)
                .ok_or_else(|| io::Error::from_raw_os_error(libc::EINVAL))?;
            let mut out = String::new();
            for (pid, groups) in &st.procs {
                if groups.get(&sub) == Some(&rel) {
                    out.push_str(&format!("{}\n", pid));
                }
            }
            return Ok(out);
        }
        if let Some(pid) = self.proc_pid(p) {
            if let Some(groups) = st.procs.get(&pid) {
                let mut out = String::new();
                for (i, (sub, rel)) in groups.iter().enumerate() {
                    out.push_str(&format!("{}:{}:{}\n", i + 1, sub, rel));
                }
                return Ok(out);
            }
        }
        Err(io::Error::from_raw_os_error(libc::ENOENT))
    }
}

//! Process lookup through procfs and signal delivery.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::debug;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;

use crate::{Error, Result};

/// Name of the agent binary; its own inject/recover invocations are never
/// selected as targets.
pub const AGENT_NAME: &str = "chaosmetad";

/// procfs reader. The root is configurable so tests can point it at a
/// temporary directory laid out like `/proc`.
#[derive(Clone, Debug)]
pub struct ProcFs {
    root: PathBuf,
}

impl Default for ProcFs {
    fn default() -> Self {
        Self::new("/proc")
    }
}

impl ProcFs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn exists(&self, pid: i32) -> bool {
        pid > 0 && self.root.join(pid.to_string()).is_dir()
    }

    /// Argument vector from `/proc/<pid>/cmdline`. Kernel threads yield an
    /// empty vector.
    pub fn argv(&self, pid: i32) -> Result<Vec<String>> {
        let path = self.root.join(pid.to_string()).join("cmdline");
        let raw = fs::read(&path).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                Error::NoSuchProcess { pid }
            } else {
                Error::Io { path, source: e }
            }
        })?;
        Ok(raw
            .split(|b| *b == 0)
            .filter(|p| !p.is_empty())
            .map(|p| String::from_utf8_lossy(p).into_owned())
            .collect())
    }

    /// Command line with NUL separators replaced by spaces.
    pub fn cmdline(&self, pid: i32) -> Result<String> {
        Ok(self.argv(pid)?.join(" "))
    }

    /// All numeric entries of the proc root, ascending.
    pub fn pids(&self) -> Result<Vec<i32>> {
        let entries = fs::read_dir(&self.root).map_err(|e| Error::Io {
            path: self.root.clone(),
            source: e,
        })?;
        let mut pids: Vec<i32> = entries
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().to_str().and_then(|n| n.parse::<i32>().ok()))
            .collect();
        pids.sort_unstable();
        Ok(pids)
    }

    /// Pids whose argument vector satisfies `pred`. The calling process,
    /// kernel threads and processes that exit during the scan are skipped.
    pub fn pids_where<F>(&self, pred: F) -> Result<Vec<i32>>
    where
        F: Fn(&[String]) -> bool,
    {
        let me = std::process::id() as i32;
        let mut out = Vec::new();
        for pid in self.pids()? {
            if pid == me {
                continue;
            }
            let argv = match self.argv(pid) {
                Ok(a) => a,
                // raced with exit
                Err(Error::NoSuchProcess { .. }) => continue,
                Err(e) => return Err(e),
            };
            if !argv.is_empty() && pred(&argv) {
                out.push(pid);
            }
        }
        Ok(out)
    }

    /// Pids whose command line contains `key`. Agent inject/recover
    /// invocations are excluded.
    pub fn pids_by_key(&self, key: &str) -> Result<Vec<i32>> {
        let out = self.pids_where(|argv| {
            let cmd = argv.join(" ");
            !is_agent_invocation(&cmd) && cmd.contains(key)
        })?;
        debug!("process: key {:?} matched {:?}", key, out);
        Ok(out)
    }

    /// Write `/proc/<pid>/oom_score_adj`.
    pub fn set_oom_score_adj(&self, pid: i32, value: i32) -> Result<()> {
        let path = self.root.join(pid.to_string()).join("oom_score_adj");
        fs::write(&path, value.to_string()).map_err(|e| Error::Io { path, source: e })
    }
}

fn is_agent(token: &str) -> bool {
    Path::new(token)
        .file_name()
        .map(|n| n == AGENT_NAME)
        .unwrap_or(false)
}

fn is_shell(token: &str) -> bool {
    Path::new(token)
        .file_name()
        .map(|n| n == "bash" || n == "sh")
        .unwrap_or(false)
}

/// True for command lines such as `/usr/bin/chaosmetad inject mem fill ...`,
/// and for the shell that runs a delayed `chaosmetad ... recover <uid>`.
pub fn is_agent_invocation(cmd: &str) -> bool {
    let tokens: Vec<&str> = cmd.split_whitespace().collect();
    let Some(first) = tokens.first() else {
        return false;
    };
    let lifecycle = |rest: &[&str]| rest.iter().any(|t| *t == "inject" || *t == "recover");
    if is_agent(first) {
        return lifecycle(&tokens[1..]);
    }
    if is_shell(first) {
        return tokens
            .iter()
            .position(|t| is_agent(t))
            .map(|i| lifecycle(&tokens[i + 1..]))
            .unwrap_or(false);
    }
    false
}

/// Value following `flag` in an argument vector, e.g. `--uid <value>`.
pub fn flag_value<'a>(argv: &'a [String], flag: &str) -> Option<&'a str> {
    argv.iter()
        .position(|a| a == flag)
        .and_then(|i| argv.get(i + 1))
        .map(String::as_str)
}

/// Parse `"12,13, 14"`. Duplicates are dropped, order is kept.
pub fn parse_pid_list(s: &str) -> Result<Vec<i32>> {
    let mut out: Vec<i32> = Vec::new();
    for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let pid = part
            .parse::<i32>()
            .map_err(|_| Error::invalid(part, "pid is not a num"))?;
        if pid <= 0 {
            return Err(Error::invalid(part, "pid must be larger than 0"));
        }
        if !out.contains(&pid) {
            out.push(pid);
        }
    }
    Ok(out)
}

/// Convert a numeric signal into a nix `Signal`.
pub fn to_signal(sig: i32) -> Result<Signal> {
    Signal::try_from(sig).map_err(|_| Error::invalid(sig.to_string(), "unknown signal"))
}

pub fn send_signal(pid: i32, sig: Signal) -> Result<()> {
    signal::kill(Pid::from_raw(pid), sig).map_err(|e| match e {
        nix::errno::Errno::ESRCH => Error::NoSuchProcess { pid },
        source => Error::Signal {
            pid,
            signal: sig,
            source,
        },
    })
}

/// Existence check with signal 0; EPERM still means the process exists.
pub fn is_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    match signal::kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(nix::errno::Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Signal each pid; processes that exit meanwhile are ignored. Returns the
/// pids signalled.
pub fn kill_pids(pids: &[i32], sig: Signal) -> Result<Vec<i32>> {
    let mut killed = Vec::new();
    for &pid in pids {
        match send_signal(pid, sig) {
            Ok(()) => killed.push(pid),
            Err(Error::NoSuchProcess { .. }) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(killed)
}

/// Signal every process matching `key`.
pub fn kill_by_key(procfs: &ProcFs, key: &str, sig: Signal) -> Result<Vec<i32>> {
    kill_pids(&procfs.pids_by_key(key)?, sig)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn fake_proc(root: &Path, pid: i32, argv: &[&str]) {
        let dir = root.join(pid.to_string());
        fs::create_dir_all(&dir).unwrap();
        let mut raw = Vec::new();
        for a in argv {
            raw.extend_from_slice(a.as_bytes());
            raw.push(0);
        }
        fs::write(dir.join("cmdline"), raw).unwrap();
    }

    #[test]
    fn test_cmdline_and_exists() {
        let tmp = tempdir().unwrap();
        fake_proc(tmp.path(), 10, &["/usr/bin/redis-server", "*:6379"]);
        let p = ProcFs::new(tmp.path());
        assert!(p.exists(10));
        assert!(!p.exists(11));
        assert_eq!(p.cmdline(10).unwrap(), "/usr/bin/redis-server *:6379");
        assert!(matches!(p.cmdline(11), Err(Error::NoSuchProcess { pid: 11 })));
    }

    #[test]
    fn test_pids_by_key_excludes_agent() {
        let tmp = tempdir().unwrap();
        fs::create_dir_all(tmp.path().join("self")).unwrap();
        fake_proc(tmp.path(), 20, &["java", "-jar", "app.jar"]);
        fake_proc(tmp.path(), 21, &["java", "-jar", "other.jar"]);
        fake_proc(
            tmp.path(),
            22,
            &["/opt/chaosmetad", "inject", "process", "kill", "-a", "key=app.jar"],
        );
        fake_proc(tmp.path(), 23, &[]);
        let p = ProcFs::new(tmp.path());
        assert_eq!(p.pids().unwrap(), vec![20, 21, 22, 23]);
        assert_eq!(p.pids_by_key("app.jar").unwrap(), vec![20]);
        assert_eq!(p.pids_by_key("java").unwrap(), vec![20, 21]);
        assert!(p.pids_by_key("nginx").unwrap().is_empty());
    }

    #[test]
    fn test_is_agent_invocation() {
        assert!(is_agent_invocation("chaosmetad recover 2023"));
        assert!(is_agent_invocation("/usr/local/bin/chaosmetad --data-dir /x inject mem fill"));
        assert!(!is_agent_invocation("chaosmetad query"));
        assert!(!is_agent_invocation("vim chaosmetad inject"));
        assert!(is_agent_invocation(
            "/bin/bash -c sleep 30s; /usr/bin/chaosmetad --data-dir /x recover exp-1 >> /tmp/l 2>&1"
        ));
        assert!(!is_agent_invocation("/bin/bash -c sleep 30; echo recover"));
        assert!(!is_agent_invocation(""));
    }

    #[test]
    fn test_pids_by_key_skips_delayed_recover_shell() {
        let tmp = tempdir().unwrap();
        fake_proc(tmp.path(), 30, &["/usr/sbin/mysqld", "--port=3306"]);
        fake_proc(
            tmp.path(),
            31,
            &[
                "/bin/bash",
                "-c",
                "sleep 60s; /usr/bin/chaosmetad --data-dir /var/lib/x recover mysqld-io >> /tmp/l 2>&1",
            ],
        );
        let p = ProcFs::new(tmp.path());
        assert_eq!(p.pids_by_key("mysqld").unwrap(), vec![30]);
    }

    #[test]
    fn test_pids_where_and_flag_value() {
        let tmp = tempdir().unwrap();
        fake_proc(tmp.path(), 101, &["chaosmetad", "mem-filler", "--uid", "exp-1", "--kbytes", "10"]);
        fake_proc(tmp.path(), 102, &["chaosmetad", "mem-filler", "--uid", "exp-12", "--kbytes", "10"]);
        let p = ProcFs::new(tmp.path());
        assert_eq!(
            p.pids_where(|a| flag_value(a, "--uid") == Some("exp-1")).unwrap(),
            vec![101]
        );
        let argv = p.argv(102).unwrap();
        assert_eq!(flag_value(&argv, "--kbytes"), Some("10"));
        assert_eq!(flag_value(&argv, "--timeout"), None);
        assert!(p.argv(103).is_err());
    }

    #[test]
    fn test_parse_pid_list() {
        assert_eq!(parse_pid_list("1, 2,2,3").unwrap(), vec![1, 2, 3]);
        assert!(parse_pid_list("").unwrap().is_empty());
        assert!(parse_pid_list("1,a").is_err());
        assert!(parse_pid_list("0").is_err());
    }

    #[test]
    fn test_signals() {
        assert_eq!(to_signal(9).unwrap(), Signal::SIGKILL);
        assert!(to_signal(0).is_err());
        assert!(is_alive(std::process::id() as i32));
        assert!(!is_alive(-1));
        // signal 0 equivalent via SIGCONT on ourselves is harmless
        send_signal(std::process::id() as i32, Signal::SIGCONT).unwrap();
    }
}

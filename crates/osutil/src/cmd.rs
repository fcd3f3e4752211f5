//! Shell execution: foreground `bash -c` with captured output, and fully
//! detached background commands that outlive the agent.

use std::io;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Command as StdCommand, Stdio};

use log::{debug, info};
use tokio::process::Command;

use crate::{Error, Result};

pub const BASH: &str = "/bin/bash";

/// Where the detached recovery command appends its output.
pub const RECOVER_LOG: &str = "/tmp/chaosmetad_recover.log";

/// Run `cmd` through `bash -c` and return `(exit code, stdout, stderr)`.
pub async fn run_bash_capture(cmd: &str) -> Result<(i32, String, String)> {
    debug!("cmd: bash -c {:?}", cmd);
    let output = Command::new(BASH)
        .arg("-c")
        .arg(cmd)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|source| Error::Spawn {
            cmd: cmd.to_string(),
            source,
        })?;
    let code = output.status.code().unwrap_or(-1);
    let out = String::from_utf8_lossy(&output.stdout).to_string();
    let err = String::from_utf8_lossy(&output.stderr).to_string();
    Ok((code, out, err))
}

/// Run `cmd` and return stdout; a non-zero exit is an error carrying stderr.
pub async fn run_bash(cmd: &str) -> Result<String> {
    let (code, out, err) = run_bash_capture(cmd).await?;
    if code == 0 {
        Ok(out)
    } else {
        Err(Error::CommandFailed {
            cmd: cmd.to_string(),
            code,
            stderr: err.trim().to_string(),
        })
    }
}

/// Start `cmd` in its own session with all stdio detached and return its
/// pid. The child is never waited on.
pub fn spawn_detached(cmd: &str) -> Result<u32> {
    let mut command = StdCommand::new(BASH);
    command
        .arg("-c")
        .arg(cmd)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    // SAFETY: setsid is async-signal-safe and touches no parent state.
    unsafe {
        command.pre_exec(|| nix::unistd::setsid().map(|_| ()).map_err(io::Error::from));
    }
    let child = command.spawn().map_err(|source| Error::Spawn {
        cmd: cmd.to_string(),
        source,
    })?;
    let pid = child.id();
    info!("cmd: detached pid {}: {}", pid, cmd);
    Ok(pid)
}

/// Quote for bash unless the word is plainly safe.
pub fn shell_quote(s: &str) -> String {
    let safe = !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=,@%+".contains(c));
    if safe {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', r"'\''"))
    }
}

/// `sleep <secs>s; <exe> --data-dir <dir> recover <uid> >> <log> 2>&1`
pub fn sleep_recover_command(exe: &Path, data_dir: &Path, uid: &str, secs: u64) -> String {
    format!(
        "sleep {}s; {} --data-dir {} recover {} >> {} 2>&1",
        secs,
        shell_quote(&exe.to_string_lossy()),
        shell_quote(&data_dir.to_string_lossy()),
        shell_quote(uid),
        RECOVER_LOG
    )
}

/// Arm the detached self-recovery for experiment `uid`.
pub fn start_sleep_recover(exe: &Path, data_dir: &Path, uid: &str, secs: u64) -> Result<u32> {
    spawn_detached(&sleep_recover_command(exe, data_dir, uid, secs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process;
    use std::time::Duration;

    #[tokio::test]
    async fn test_run_bash() {
        assert_eq!(run_bash("echo hello").await.unwrap(), "hello\n");
        let (code, out, err) = run_bash_capture("echo warn >&2; echo ok").await.unwrap();
        assert_eq!(code, 0);
        assert_eq!(out, "ok\n");
        assert_eq!(err, "warn\n");
        match run_bash("echo boom >&2; exit 3").await {
            Err(Error::CommandFailed { code, stderr, .. }) => {
                assert_eq!(code, 3);
                assert_eq!(stderr, "boom");
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("/usr/bin/chaosmetad"), "/usr/bin/chaosmetad");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn test_sleep_recover_command() {
        let c = sleep_recover_command(
            Path::new("/usr/bin/chaosmetad"),
            Path::new("/var/lib/chaosmetad/experiments"),
            "202301011200001234",
            30,
        );
        assert_eq!(
            c,
            "sleep 30s; /usr/bin/chaosmetad --data-dir /var/lib/chaosmetad/experiments \
             recover 202301011200001234 >> /tmp/chaosmetad_recover.log 2>&1"
        );
    }

    #[test]
    fn test_spawn_detached_returns_running_pid() {
        let pid = spawn_detached("sleep 5").unwrap() as i32;
        assert!(process::is_alive(pid));
        process::send_signal(pid, nix::sys::signal::Signal::SIGKILL).unwrap();
        std::thread::sleep(Duration::from_millis(50));
    }
}

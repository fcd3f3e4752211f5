use std::process::Command;
use std::time::Duration;

use nix::sys::signal::Signal;
use osutil::process::{self, ProcFs};

fn spawn_sleeper(key: &str) -> std::process::Child {
    Command::new("sleep").arg(key).spawn().unwrap()
}

#[test]
fn test_find_and_kill_by_key_on_host() {
    // a distinctive fractional duration doubles as the match key
    let key = "3600.123457";
    let mut child = spawn_sleeper(key);
    let pid = child.id() as i32;
    std::thread::sleep(Duration::from_millis(100));

    let procfs = ProcFs::default();
    assert!(procfs.exists(pid));
    assert_eq!(procfs.pids_by_key(key).unwrap(), vec![pid]);

    let killed = process::kill_by_key(&procfs, key, Signal::SIGKILL).unwrap();
    assert_eq!(killed, vec![pid]);
    let status = child.wait().unwrap();
    assert!(!status.success());
    assert!(!process::is_alive(pid));
    assert!(procfs.pids_by_key(key).unwrap().is_empty());
}

#[test]
fn test_signal_to_reaped_process() {
    let mut child = Command::new("true").spawn().unwrap();
    let pid = child.id() as i32;
    child.wait().unwrap();
    assert!(matches!(
        process::send_signal(pid, Signal::SIGTERM),
        Err(osutil::Error::NoSuchProcess { .. })
    ));
}

#[tokio::test]
async fn test_stderr_alone_is_not_failure() {
    let out = osutil::cmd::run_bash("echo ok; echo warn >&2").await.unwrap();
    assert_eq!(out.trim(), "ok");
    assert!(osutil::cmd::run_bash("echo bad >&2; exit 3").await.is_err());
}

//! Runs runtime CLIs and captures `(exit code, stdout, stderr)`.

use std::process::Stdio;

use async_trait::async_trait;
use log::debug;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::{Error, Result};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Output {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// One program invocation.
#[derive(Clone, Debug, Default)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub envs: Vec<(String, String)>,
    pub stdin: Option<Vec<u8>>,
}

impl Invocation {
    pub fn display(&self) -> String {
        format!("{} {}", self.program, self.args.join(" "))
    }
}

#[async_trait]
pub trait Runner: Send + Sync {
    async fn run_capture(&self, inv: &Invocation) -> Result<Output>;

    /// stdout of a zero-exit run; anything else is `CommandFailed`.
    async fn run_ok(&self, inv: &Invocation) -> Result<String> {
        let out = self.run_capture(inv).await?;
        if out.code == 0 {
            Ok(out.stdout)
        } else {
            Err(Error::CommandFailed {
                cmd: inv.display(),
                code: out.code,
                stderr: out.stderr.trim().to_string(),
            })
        }
    }
}

/// Spawns the program on this host.
#[derive(Clone, Copy, Debug, Default)]
pub struct LocalRunner;

#[async_trait]
impl Runner for LocalRunner {
    async fn run_capture(&self, inv: &Invocation) -> Result<Output> {
        debug!("crclient: run {}", inv.display());
        let spawn_err = |e: std::io::Error| Error::CommandFailed {
            cmd: inv.display(),
            code: -1,
            stderr: e.to_string(),
        };
        let mut cmd = Command::new(&inv.program);
        cmd.args(&inv.args)
            .envs(inv.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if inv.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            });
        let mut child = cmd.spawn().map_err(spawn_err)?;
        if let (Some(data), Some(mut stdin)) = (inv.stdin.as_ref(), child.stdin.take()) {
            stdin.write_all(data).await.map_err(spawn_err)?;
            // dropping closes the pipe so the reader sees EOF
            drop(stdin);
        }
        let output = child.wait_with_output().await.map_err(spawn_err)?;
        Ok(Output {
            code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str, stdin: Option<&str>) -> Invocation {
        Invocation {
            program: "/bin/sh".into(),
            args: vec!["-c".into(), script.into()],
            envs: vec![("GREETING".into(), "hi".into())],
            stdin: stdin.map(|s| s.as_bytes().to_vec()),
        }
    }

    #[tokio::test]
    async fn test_local_runner_captures() {
        let out = LocalRunner
            .run_capture(&sh("echo $GREETING; echo oops >&2; exit 4", None))
            .await
            .unwrap();
        assert_eq!(
            out,
            Output {
                code: 4,
                stdout: "hi\n".into(),
                stderr: "oops\n".into()
            }
        );
        assert!(matches!(
            LocalRunner.run_ok(&sh("exit 4", None)).await,
            Err(Error::CommandFailed { code: 4, .. })
        ));
    }

    #[tokio::test]
    async fn test_local_runner_feeds_stdin() {
        let out = LocalRunner.run_ok(&sh("cat", Some("payload"))).await.unwrap();
        assert_eq!(out, "payload");
    }
}

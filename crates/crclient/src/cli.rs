//! Docker and Pouch clients, driven through their command-line tools.
//!
//! Both CLIs share the verbs used here (`inspect`, `top`, `exec`, `pause`,
//! `rm -f`, ...); they differ in binary, daemon socket and whether the
//! low-level runtime is checked.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use async_trait::async_trait;
use log::{debug, info};
use serde_json::Value;

use crate::cmd::{Invocation, LocalRunner, Runner};
use crate::{ContainerClient, Error, Result, RuntimeKind, SimpleProcess};

pub const DEFAULT_DOCKER_API_VERSION: &str = "1.24";

#[derive(Clone, Debug)]
pub struct DockerConfig {
    pub binary: String,
    pub host: String,
    /// Exported as `DOCKER_API_VERSION`
    pub api_version: String,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            binary: "docker".to_string(),
            host: "unix:///var/run/docker.sock".to_string(),
            api_version: std::env::var("DOCKER_API_VERSION")
                .unwrap_or_else(|_| DEFAULT_DOCKER_API_VERSION.to_string()),
        }
    }
}

#[derive(Clone, Debug)]
pub struct PouchConfig {
    pub binary: String,
    pub host: String,
}

impl Default for PouchConfig {
    fn default() -> Self {
        Self {
            binary: "pouch".to_string(),
            host: "unix:///var/run/pouchd.sock".to_string(),
        }
    }
}

/// CLI-backed client. Generic over `Runner` for testability.
pub struct CliClient<R: Runner = LocalRunner> {
    kind: RuntimeKind,
    binary: String,
    host: String,
    envs: Vec<(String, String)>,
    /// Reject containers not run by runc
    runc_only: bool,
    runner: R,
}

impl CliClient<LocalRunner> {
    pub fn docker(cfg: DockerConfig) -> Self {
        Self::docker_with_runner(cfg, LocalRunner)
    }

    pub fn pouch(cfg: PouchConfig) -> Self {
        Self::pouch_with_runner(cfg, LocalRunner)
    }
}

impl<R: Runner> CliClient<R> {
    pub fn docker_with_runner(cfg: DockerConfig, runner: R) -> Self {
        Self {
            kind: RuntimeKind::Docker,
            binary: cfg.binary,
            host: cfg.host,
            envs: vec![("DOCKER_API_VERSION".to_string(), cfg.api_version)],
            runc_only: true,
            runner,
        }
    }

    pub fn pouch_with_runner(cfg: PouchConfig, runner: R) -> Self {
        Self {
            kind: RuntimeKind::Pouch,
            binary: cfg.binary,
            host: cfg.host,
            envs: Vec::new(),
            runc_only: false,
            runner,
        }
    }

    fn invocation(&self, args: &[&str]) -> Invocation {
        let mut all = vec!["-H".to_string(), self.host.clone()];
        all.extend(args.iter().map(|a| a.to_string()));
        Invocation {
            program: self.binary.clone(),
            args: all,
            envs: self.envs.clone(),
            stdin: None,
        }
    }

    async fn run_ok(&self, args: &[&str]) -> Result<String> {
        self.runner.run_ok(&self.invocation(args)).await
    }

    /// `inspect` output for one container as a JSON object.
    async fn inspect(&self, id: &str) -> Result<Value> {
        let out = self.run_ok(&["inspect", id]).await?;
        let v: Value = serde_json::from_str(&out)?;
        match v {
            Value::Array(mut items) if !items.is_empty() => Ok(items.swap_remove(0)),
            Value::Object(_) => Ok(v),
            _ => Err(Error::Parse {
                what: format!("inspect of container[{}]", id),
                detail: "empty result".to_string(),
            }),
        }
    }

    async fn exec_with_stdin(&self, id: &str, cmd: &str, stdin: Option<Vec<u8>>) -> Result<String> {
        let mut inv = if stdin.is_some() {
            self.invocation(&["exec", "-i", id, "/bin/sh", "-c", cmd])
        } else {
            self.invocation(&["exec", id, "/bin/sh", "-c", cmd])
        };
        inv.stdin = stdin;
        let out = self.runner.run_capture(&inv).await?;
        let output = format!("{}{}", out.stdout, out.stderr);
        if out.code != 0 {
            return Err(Error::Exec {
                id: id.to_string(),
                code: out.code,
                output: output.trim().to_string(),
            });
        }
        Ok(output)
    }
}

/// Parse `top` output. The header names the `PID` column and the command
/// column (`CMD` or `COMMAND`), which runs to the end of the line.
pub fn parse_top(out: &str) -> Result<Vec<SimpleProcess>> {
    let parse_err = |detail: String| Error::Parse {
        what: "top output".to_string(),
        detail,
    };
    let mut lines = out.lines().filter(|l| !l.trim().is_empty());
    let header: Vec<&str> = lines
        .next()
        .ok_or_else(|| parse_err("empty output".to_string()))?
        .split_whitespace()
        .collect();
    let pid_idx = header
        .iter()
        .position(|h| *h == "PID")
        .ok_or_else(|| parse_err("no PID column".to_string()))?;
    let cmd_idx = header
        .iter()
        .position(|h| *h == "CMD" || *h == "COMMAND")
        .ok_or_else(|| parse_err("no CMD column".to_string()))?;
    if cmd_idx < pid_idx {
        return Err(parse_err("CMD column before PID column".to_string()));
    }

    let mut procs = Vec::new();
    for line in lines {
        let (fields, rest) = split_fields(line, cmd_idx);
        let pid = fields
            .get(pid_idx)
            .and_then(|p| p.parse::<i32>().ok())
            .ok_or_else(|| parse_err(format!("bad line {:?}", line)))?;
        procs.push(SimpleProcess {
            pid,
            cmd: rest.to_string(),
        });
    }
    Ok(procs)
}

/// First `n` whitespace-separated fields and the remainder of the line.
fn split_fields(line: &str, n: usize) -> (Vec<&str>, &str) {
    let mut fields = Vec::with_capacity(n);
    let mut rest = line.trim_start();
    while fields.len() < n && !rest.is_empty() {
        let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
        fields.push(&rest[..end]);
        rest = rest[end..].trim_start();
    }
    (fields, rest.trim_end())
}

#[async_trait]
impl<R: Runner> ContainerClient for CliClient<R> {
    fn kind(&self) -> RuntimeKind {
        self.kind
    }

    async fn get_pid_by_id(&self, id: &str) -> Result<i32> {
        let info = self.inspect(id).await?;
        if self.runc_only {
            let runtime = info
                .pointer("/HostConfig/Runtime")
                .and_then(Value::as_str)
                .unwrap_or_default();
            if runtime != "runc" {
                return Err(Error::UnsupportedLowLevelRuntime {
                    id: id.to_string(),
                    runtime: runtime.to_string(),
                });
            }
        }
        let pid = info
            .pointer("/State/Pid")
            .and_then(Value::as_i64)
            .unwrap_or(0);
        if pid <= 0 {
            return Err(Error::NotRunning { id: id.to_string() });
        }
        i32::try_from(pid).map_err(|_| Error::Parse {
            what: format!("pid of container[{}]", id),
            detail: pid.to_string(),
        })
    }

    async fn get_all_pid_list(&self, id: &str) -> Result<Vec<SimpleProcess>> {
        parse_top(&self.run_ok(&["top", id]).await?)
    }

    async fn exec(&self, id: &str, cmd: &str) -> Result<String> {
        self.exec_with_stdin(id, cmd, None).await
    }

    async fn kill(&self, id: &str) -> Result<()> {
        self.run_ok(&["kill", "-s", "KILL", id]).await.map(|_| ())
    }

    async fn pause(&self, id: &str) -> Result<()> {
        self.run_ok(&["pause", id]).await.map(|_| ())
    }

    async fn unpause(&self, id: &str) -> Result<()> {
        match self.run_ok(&["unpause", id]).await {
            Ok(_) => Ok(()),
            Err(Error::CommandFailed { stderr, .. }) if stderr.contains("not paused") => {
                Err(Error::NotPaused { id: id.to_string() })
            }
            Err(e) => Err(e),
        }
    }

    async fn rmf(&self, id: &str) -> Result<()> {
        self.run_ok(&["rm", "-f", id]).await.map(|_| ())
    }

    async fn restart(&self, id: &str, wait_secs: u64) -> Result<()> {
        let t = wait_secs.to_string();
        self.run_ok(&["restart", "-t", &t, id]).await.map(|_| ())
    }

    async fn cp_file(&self, id: &str, src: &Path, dst: &str) -> Result<()> {
        let io_err = |e| Error::Io {
            path: src.to_path_buf(),
            source: e,
        };
        let meta = fs::metadata(src).map_err(io_err)?;

        let info = self.inspect(id).await?;
        let merged = info
            .pointer("/GraphDriver/Data/MergedDir")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if !merged.is_empty() && Path::new(merged).is_dir() {
            let target = Path::new(merged).join(dst.trim_start_matches('/'));
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).map_err(|e| Error::Io {
                    path: parent.to_path_buf(),
                    source: e,
                })?;
            }
            fs::copy(src, &target).map_err(|e| Error::Io {
                path: target.clone(),
                source: e,
            })?;
            debug!("crclient: copied {} to {}", src.display(), target.display());
            return Ok(());
        }

        info!(
            "crclient: merged dir of container[{}] not visible, copying through exec",
            id
        );
        let perm = meta.permissions().mode() & 0o7777;
        let data = fs::read(src).map_err(io_err)?;
        let dst = osutil::cmd::shell_quote(dst);
        let script = format!("touch {0} && chmod {1:o} {0} && cat > {0}", dst, perm);
        self.exec_with_stdin(id, &script, Some(data)).await.map(|_| ())
    }

    async fn list_id(&self) -> Result<Vec<String>> {
        let out = self.run_ok(&["ps", "-q", "--no-trunc"]).await?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmd::Output;
    use std::sync::{Arc, Mutex};

    /// Answers by the verb following `-H <host>`.
    #[derive(Clone, Default)]
    struct ScriptedRunner {
        answers: Arc<Mutex<Vec<(String, Output)>>>,
        calls: Arc<Mutex<Vec<Invocation>>>,
    }

    impl ScriptedRunner {
        fn answer(&self, verb: &str, code: i32, stdout: &str, stderr: &str) {
            self.answers.lock().unwrap().push((
                verb.to_string(),
                Output {
                    code,
                    stdout: stdout.to_string(),
                    stderr: stderr.to_string(),
                },
            ));
        }

        fn calls(&self) -> Vec<Invocation> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Runner for ScriptedRunner {
        async fn run_capture(&self, inv: &Invocation) -> Result<Output> {
            self.calls.lock().unwrap().push(inv.clone());
            let verb = inv.args.get(2).cloned().unwrap_or_default();
            let answers = self.answers.lock().unwrap();
            Ok(answers
                .iter()
                .find(|(v, _)| *v == verb)
                .map(|(_, o)| o.clone())
                .unwrap_or_default())
        }
    }

    fn docker(r: &ScriptedRunner) -> CliClient<ScriptedRunner> {
        CliClient::docker_with_runner(DockerConfig::default(), r.clone())
    }

    const INSPECT_RUNC: &str = r#"[{"State":{"Pid":4242},"HostConfig":{"Runtime":"runc"},
        "GraphDriver":{"Data":{"MergedDir":"/nonexistent/merged"}}}]"#;

    #[tokio::test]
    async fn test_get_pid_by_id() {
        let r = ScriptedRunner::default();
        r.answer("inspect", 0, INSPECT_RUNC, "");
        let c = docker(&r);
        assert_eq!(c.get_pid_by_id("abc").await.unwrap(), 4242);
        let call = &r.calls()[0];
        assert_eq!(call.program, "docker");
        assert_eq!(call.args, vec!["-H", "unix:///var/run/docker.sock", "inspect", "abc"]);
        assert!(call.envs.iter().any(|(k, _)| k == "DOCKER_API_VERSION"));
    }

    #[tokio::test]
    async fn test_get_pid_rejects_other_runtime_and_stopped() {
        let r = ScriptedRunner::default();
        r.answer(
            "inspect",
            0,
            r#"[{"State":{"Pid":1},"HostConfig":{"Runtime":"kata"}}]"#,
            "",
        );
        assert!(matches!(
            docker(&r).get_pid_by_id("abc").await,
            Err(Error::UnsupportedLowLevelRuntime { runtime, .. }) if runtime == "kata"
        ));

        let r = ScriptedRunner::default();
        r.answer(
            "inspect",
            0,
            r#"[{"State":{"Pid":0},"HostConfig":{"Runtime":"runc"}}]"#,
            "",
        );
        assert!(matches!(
            docker(&r).get_pid_by_id("abc").await,
            Err(Error::NotRunning { .. })
        ));

        // pouch does not check the low-level runtime
        let r = ScriptedRunner::default();
        r.answer("inspect", 0, r#"{"State":{"Pid":7},"HostConfig":{"Runtime":"kata"}}"#, "");
        let p = CliClient::pouch_with_runner(PouchConfig::default(), r.clone());
        assert_eq!(p.get_pid_by_id("abc").await.unwrap(), 7);
        assert_eq!(r.calls()[0].args[1], "unix:///var/run/pouchd.sock");
    }

    #[tokio::test]
    async fn test_exec_uses_exit_code_not_stderr() {
        let r = ScriptedRunner::default();
        r.answer("exec", 0, "out\n", "warning\n");
        assert_eq!(docker(&r).exec("abc", "ls").await.unwrap(), "out\nwarning\n");

        let r = ScriptedRunner::default();
        r.answer("exec", 2, "", "no such file\n");
        match docker(&r).exec("abc", "ls /x").await {
            Err(Error::Exec { code, output, .. }) => {
                assert_eq!(code, 2);
                assert_eq!(output, "no such file");
            }
            other => panic!("expected exec error, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_top() {
        let out = "UID   PID   PPID  C  STIME  TTY  TIME      CMD\n\
                   root  1201  1180  0  10:00  ?    00:00:00  nginx: master process nginx -g daemon off;\n\
                   101   1250  1201  0  10:00  ?    00:00:00  nginx: worker process\n";
        let procs = parse_top(out).unwrap();
        assert_eq!(procs.len(), 2);
        assert_eq!(procs[0].pid, 1201);
        assert_eq!(procs[0].cmd, "nginx: master process nginx -g daemon off;");
        assert_eq!(procs[1].cmd, "nginx: worker process");

        assert!(parse_top("").is_err());
        assert!(parse_top("UID CMD\nroot sh\n").is_err());
    }

    #[tokio::test]
    async fn test_restart_and_rm_args() {
        let r = ScriptedRunner::default();
        let c = docker(&r);
        c.restart("abc", 10).await.unwrap();
        c.rmf("abc").await.unwrap();
        c.kill("abc").await.unwrap();
        let calls = r.calls();
        assert_eq!(&calls[0].args[2..], ["restart", "-t", "10", "abc"]);
        assert_eq!(&calls[1].args[2..], ["rm", "-f", "abc"]);
        assert_eq!(&calls[2].args[2..], ["kill", "-s", "KILL", "abc"]);
    }

    #[tokio::test]
    async fn test_unpause_of_running_container() {
        let r = ScriptedRunner::default();
        r.answer(
            "unpause",
            1,
            "",
            "Error response from daemon: Container abc is not paused\n",
        );
        assert!(matches!(
            docker(&r).unpause("abc").await,
            Err(Error::NotPaused { id }) if id == "abc"
        ));

        let r = ScriptedRunner::default();
        r.answer("unpause", 1, "", "Error: No such container: abc\n");
        assert!(matches!(
            docker(&r).unpause("abc").await,
            Err(Error::CommandFailed { code: 1, .. })
        ));
    }

    #[tokio::test]
    async fn test_cp_file_merged_dir_fast_path() {
        let tmp = tempfile::tempdir().unwrap();
        let merged = tmp.path().join("merged");
        fs::create_dir(&merged).unwrap();
        let src = tmp.path().join("tool.sh");
        fs::write(&src, "#!/bin/sh\necho hi\n").unwrap();

        let r = ScriptedRunner::default();
        r.answer(
            "inspect",
            0,
            &format!(
                r#"[{{"GraphDriver":{{"Data":{{"MergedDir":"{}"}}}}}}]"#,
                merged.display()
            ),
            "",
        );
        docker(&r).cp_file("abc", &src, "/tmp/tool.sh").await.unwrap();
        assert_eq!(
            fs::read_to_string(merged.join("tmp/tool.sh")).unwrap(),
            "#!/bin/sh\necho hi\n"
        );
        assert_eq!(r.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_cp_file_exec_fallback() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("tool.sh");
        fs::write(&src, "data").unwrap();
        fs::set_permissions(&src, fs::Permissions::from_mode(0o755)).unwrap();

        let r = ScriptedRunner::default();
        r.answer("inspect", 0, INSPECT_RUNC, "");
        r.answer("exec", 0, "", "");
        docker(&r).cp_file("abc", &src, "/tmp/tool.sh").await.unwrap();

        let exec = &r.calls()[1];
        assert_eq!(&exec.args[2..6], ["exec", "-i", "abc", "/bin/sh"]);
        assert_eq!(
            exec.args[7],
            "touch /tmp/tool.sh && chmod 755 /tmp/tool.sh && cat > /tmp/tool.sh"
        );
        assert_eq!(exec.stdin.as_deref(), Some(&b"data"[..]));
    }

    #[tokio::test]
    async fn test_list_id() {
        let r = ScriptedRunner::default();
        r.answer("ps", 0, "aaa\nbbb\n\n", "");
        assert_eq!(docker(&r).list_id().await.unwrap(), vec!["aaa", "bbb"]);
    }
}

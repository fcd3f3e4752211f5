//! containerd client over the gRPC task, container and snapshot services.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use containerd_client::services::v1::containers_client::ContainersClient;
use containerd_client::services::v1::snapshots::snapshots_client::SnapshotsClient;
use containerd_client::services::v1::snapshots::MountsRequest;
use containerd_client::services::v1::tasks_client::TasksClient;
use containerd_client::services::v1::{
    Container, CreateTaskRequest, DeleteProcessRequest, DeleteTaskRequest, ExecProcessRequest,
    GetContainerRequest, GetRequest as GetTaskRequest, KillRequest, ListContainersRequest,
    ListPidsRequest, PauseTaskRequest, ResumeTaskRequest, StartRequest, WaitRequest,
};
use containerd_client::{connect, with_namespace};
use log::{debug, info, warn};
use nix::sys::stat::Mode;
use osutil::process::ProcFs;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tonic::transport::Channel;
// with_namespace! expands to Request::new
use tonic::Request;

use crate::{ContainerClient, Error, Result, RuntimeKind, SimpleProcess};

const SIGKILL: u32 = 9;
const SIGTERM: u32 = 15;
/// 128 + SIGTERM, the status of a process stopped by SIGTERM
const EXIT_SIGTERM: i32 = 143;
const PROCESS_SPEC_TYPE: &str = "types.containerd.io/opencontainers/runtime-spec/1/Process";
const DEFAULT_PATH_ENV: &str = "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";
const FIFO_POLL: Duration = Duration::from_millis(10);

#[derive(Clone, Debug)]
pub struct ContainerdConfig {
    pub socket: PathBuf,
    pub namespace: String,
    /// Per-task state directories of the v2 shim; holds each task's rootfs
    pub task_root: PathBuf,
    /// Where exec FIFOs are created
    pub fifo_dir: PathBuf,
}

impl Default for ContainerdConfig {
    fn default() -> Self {
        Self {
            socket: PathBuf::from("/run/containerd/containerd.sock"),
            namespace: "k8s.io".to_string(),
            task_root: PathBuf::from("/run/containerd/io.containerd.runtime.v2.task"),
            fifo_dir: std::env::temp_dir(),
        }
    }
}

impl ContainerdConfig {
    pub fn rootfs_path(&self, id: &str) -> PathBuf {
        self.task_root.join(&self.namespace).join(id).join("rootfs")
    }
}

pub struct ContainerdClient {
    channel: Channel,
    cfg: ContainerdConfig,
    procfs: ProcFs,
}

fn grpc(op: impl Into<String>) -> impl FnOnce(tonic::Status) -> Error {
    let op = op.into();
    move |source| Error::Grpc { op, source }
}

/// Exec FIFOs, removed when dropped.
struct Fifos(Vec<PathBuf>);

impl Fifos {
    fn create(dir: &Path, exec_id: &str, names: &[&str]) -> Result<Self> {
        let mut fifos = Fifos(Vec::new());
        for name in names {
            let p = dir.join(format!("{}-{}", exec_id, name));
            nix::unistd::mkfifo(&p, Mode::S_IRUSR | Mode::S_IWUSR).map_err(|e| Error::Io {
                path: p.clone(),
                source: io::Error::from(e),
            })?;
            fifos.0.push(p);
        }
        Ok(fifos)
    }
}

impl Drop for Fifos {
    fn drop(&mut self) {
        for p in &self.0 {
            let _ = fs::remove_file(p);
        }
    }
}

/// Open a FIFO read-write and non-blocking: the open does not wait for a
/// peer and reads stop at the data currently buffered.
fn open_fifo_nonblocking(p: &Path) -> Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(p)
        .map_err(|e| Error::Io {
            path: p.to_path_buf(),
            source: e,
        })
}

/// Read everything currently buffered; once `stop` is set, return at the
/// first empty read instead of polling for more.
fn collect(f: &mut File, stop: &AtomicBool) -> String {
    let mut out = Vec::new();
    let mut buf = [0u8; 8192];
    loop {
        match f.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => out.extend_from_slice(&buf[..n]),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if stop.load(Ordering::Acquire) {
                    break;
                }
                std::thread::sleep(FIFO_POLL);
            }
            Err(_) => break,
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Keeps an output FIFO drained while the exec runs, so a process writing
/// more than the pipe buffer never blocks.
struct FifoCollector {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<String>>,
}

impl FifoCollector {
    fn start(mut f: File) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let handle = tokio::task::spawn_blocking(move || collect(&mut f, &flag));
        Self {
            stop,
            handle: Some(handle),
        }
    }

    async fn finish(mut self) -> String {
        self.stop.store(true, Ordering::Release);
        match self.handle.take() {
            Some(h) => h.await.unwrap_or_default(),
            None => String::new(),
        }
    }
}

impl Drop for FifoCollector {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
    }
}

/// OCI process for an exec: the container's own process settings (user,
/// env, cwd) with `args` replaced.
pub fn process_spec(container_spec: Option<&[u8]>, args: &[&str]) -> Result<Vec<u8>> {
    let mut process = container_spec
        .and_then(|b| serde_json::from_slice::<Value>(b).ok())
        .and_then(|v| v.get("process").cloned())
        .filter(Value::is_object)
        .unwrap_or_else(|| {
            json!({
                "user": { "uid": 0, "gid": 0 },
                "cwd": "/",
                "env": [DEFAULT_PATH_ENV],
            })
        });
    if let Some(obj) = process.as_object_mut() {
        obj.insert("args".to_string(), json!(args));
        obj.insert("terminal".to_string(), Value::Bool(false));
    }
    Ok(serde_json::to_vec(&process)?)
}

struct ExecResult {
    code: i32,
    stdout: String,
    stderr: String,
}

impl ContainerdClient {
    pub async fn connect(cfg: ContainerdConfig) -> Result<Self> {
        let channel = connect(&cfg.socket).await.map_err(|e| Error::Connect {
            socket: cfg.socket.display().to_string(),
            detail: e.to_string(),
        })?;
        info!(
            "crclient: connected to containerd at {} (namespace {})",
            cfg.socket.display(),
            cfg.namespace
        );
        Ok(Self {
            channel,
            cfg,
            procfs: ProcFs::default(),
        })
    }

    fn ns(&self) -> &str {
        self.cfg.namespace.as_str()
    }

    fn tasks(&self) -> TasksClient<Channel> {
        TasksClient::new(self.channel.clone())
    }

    async fn container(&self, id: &str) -> Result<Container> {
        let mut client = ContainersClient::new(self.channel.clone());
        let req = with_namespace!(GetContainerRequest { id: id.to_string() }, self.ns());
        let resp = client
            .get(req)
            .await
            .map_err(grpc(format!("get container[{}]", id)))?;
        resp.into_inner().container.ok_or_else(|| Error::Parse {
            what: format!("container[{}]", id),
            detail: "empty response".to_string(),
        })
    }

    async fn kill_task(&self, id: &str, exec_id: &str, signal: u32) -> Result<()> {
        let req = with_namespace!(
            KillRequest {
                container_id: id.to_string(),
                exec_id: exec_id.to_string(),
                signal,
                all: exec_id.is_empty(),
            },
            self.ns()
        );
        self.tasks()
            .kill(req)
            .await
            .map_err(grpc(format!("kill task of container[{}]", id)))?;
        Ok(())
    }

    async fn wait_task(&self, id: &str, exec_id: &str) -> Result<u32> {
        let req = with_namespace!(
            WaitRequest {
                container_id: id.to_string(),
                exec_id: exec_id.to_string(),
            },
            self.ns()
        );
        let resp = self
            .tasks()
            .wait(req)
            .await
            .map_err(grpc(format!("wait task of container[{}]", id)))?;
        Ok(resp.into_inner().exit_status)
    }

    async fn delete_task(&self, id: &str) -> Result<()> {
        let req = with_namespace!(
            DeleteTaskRequest {
                container_id: id.to_string(),
            },
            self.ns()
        );
        self.tasks()
            .delete(req)
            .await
            .map_err(grpc(format!("delete task of container[{}]", id)))?;
        Ok(())
    }

    /// SIGTERM, wait up to `grace`, then SIGKILL and wait for the exit.
    async fn stop_task(&self, id: &str, grace: Duration) -> Result<()> {
        self.kill_task(id, "", SIGTERM).await?;
        match tokio::time::timeout(grace, self.wait_task(id, "")).await {
            Ok(r) => r.map(|_| ()),
            Err(_) => {
                debug!("crclient: container[{}] ignored SIGTERM, killing", id);
                self.kill_task(id, "", SIGKILL).await?;
                self.wait_task(id, "").await.map(|_| ())
            }
        }
    }

    /// Run `args` in the container. With `stdin`, the data is written to the
    /// process and, if `term_after` is set, the process is sent SIGTERM after
    /// that delay for commands that never see end of input.
    async fn exec_process(
        &self,
        id: &str,
        args: &[&str],
        stdin: Option<Vec<u8>>,
        term_after: Option<Duration>,
    ) -> Result<ExecResult> {
        let exec_id = format!("chaosmeta-{}", uuid::Uuid::new_v4().simple());
        let names: &[&str] = if stdin.is_some() {
            &["stdout", "stderr", "stdin"]
        } else {
            &["stdout", "stderr"]
        };
        let fifos = Fifos::create(&self.cfg.fifo_dir, &exec_id, names)?;
        let out = FifoCollector::start(open_fifo_nonblocking(&fifos.0[0])?);
        let err = FifoCollector::start(open_fifo_nonblocking(&fifos.0[1])?);
        let stdin_path = fifos.0.get(2).cloned();

        let container = self.container(id).await?;
        let spec = process_spec(container.spec.as_ref().map(|a| a.value.as_slice()), args)?;

        let path_str = |p: Option<&PathBuf>| {
            p.map(|p| p.to_string_lossy().to_string())
                .unwrap_or_default()
        };
        let req = with_namespace!(
            ExecProcessRequest {
                container_id: id.to_string(),
                stdin: path_str(stdin_path.as_ref()),
                stdout: path_str(fifos.0.first()),
                stderr: path_str(fifos.0.get(1)),
                terminal: false,
                spec: Some(prost_types::Any {
                    type_url: PROCESS_SPEC_TYPE.to_string(),
                    value: spec,
                }),
                exec_id: exec_id.clone(),
            },
            self.ns()
        );
        let mut tasks = self.tasks();
        tasks
            .exec(req)
            .await
            .map_err(grpc(format!("exec in container[{}]", id)))?;

        let result = self
            .run_started_exec(id, &exec_id, stdin_path, stdin, term_after)
            .await;

        let del = with_namespace!(
            DeleteProcessRequest {
                container_id: id.to_string(),
                exec_id: exec_id.clone(),
            },
            self.ns()
        );
        if let Err(e) = tasks.delete_process(del).await {
            warn!("crclient: delete exec {} error: {}", exec_id, e);
        }

        let code = result?;
        Ok(ExecResult {
            code,
            stdout: out.finish().await,
            stderr: err.finish().await,
        })
    }

    async fn run_started_exec(
        &self,
        id: &str,
        exec_id: &str,
        stdin_path: Option<PathBuf>,
        stdin: Option<Vec<u8>>,
        term_after: Option<Duration>,
    ) -> Result<i32> {
        let req = with_namespace!(
            StartRequest {
                container_id: id.to_string(),
                exec_id: exec_id.to_string(),
            },
            self.ns()
        );
        self.tasks()
            .start(req)
            .await
            .map_err(grpc(format!("start exec in container[{}]", id)))?;

        if let (Some(p), Some(data)) = (stdin_path, stdin) {
            tokio::task::spawn_blocking(move || -> io::Result<()> {
                let mut f = OpenOptions::new().read(true).write(true).open(&p)?;
                f.write_all(&data)
            })
            .await
            .map_err(|e| Error::Io {
                path: PathBuf::from(exec_id),
                source: io::Error::new(io::ErrorKind::Other, e),
            })?
            .map_err(|e| Error::Io {
                path: PathBuf::from(exec_id),
                source: e,
            })?;
            if let Some(d) = term_after {
                tokio::time::sleep(d).await;
                if let Err(e) = self.kill_task(id, exec_id, SIGTERM).await {
                    debug!("crclient: exec {} already exited: {}", exec_id, e);
                }
            }
        }

        let status = self.wait_task(id, exec_id).await?;
        Ok(status as i32)
    }
}

#[async_trait]
impl ContainerClient for ContainerdClient {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Containerd
    }

    async fn get_pid_by_id(&self, id: &str) -> Result<i32> {
        let req = with_namespace!(
            GetTaskRequest {
                container_id: id.to_string(),
                exec_id: String::new(),
            },
            self.ns()
        );
        let resp = self
            .tasks()
            .get(req)
            .await
            .map_err(grpc(format!("get task of container[{}]", id)))?;
        match resp.into_inner().process {
            Some(p) if p.pid > 0 => Ok(p.pid as i32),
            _ => Err(Error::NotRunning { id: id.to_string() }),
        }
    }

    async fn get_all_pid_list(&self, id: &str) -> Result<Vec<SimpleProcess>> {
        let req = with_namespace!(
            ListPidsRequest {
                container_id: id.to_string(),
            },
            self.ns()
        );
        let resp = self
            .tasks()
            .list_pids(req)
            .await
            .map_err(grpc(format!("list pids of container[{}]", id)))?;
        let mut procs = Vec::new();
        for p in resp.into_inner().processes {
            let pid = p.pid as i32;
            match self.procfs.cmdline(pid) {
                Ok(cmd) => procs.push(SimpleProcess { pid, cmd }),
                Err(e) => debug!("crclient: skip pid {}: {}", pid, e),
            }
        }
        Ok(procs)
    }

    async fn exec(&self, id: &str, cmd: &str) -> Result<String> {
        let r = self.exec_process(id, &["/bin/sh", "-c", cmd], None, None).await?;
        let output = format!("{}{}", r.stdout, r.stderr);
        if r.code != 0 {
            return Err(Error::Exec {
                id: id.to_string(),
                code: r.code,
                output: output.trim().to_string(),
            });
        }
        Ok(output)
    }

    async fn kill(&self, id: &str) -> Result<()> {
        self.kill_task(id, "", SIGKILL).await
    }

    async fn pause(&self, id: &str) -> Result<()> {
        let req = with_namespace!(
            PauseTaskRequest {
                container_id: id.to_string(),
            },
            self.ns()
        );
        self.tasks()
            .pause(req)
            .await
            .map_err(grpc(format!("pause container[{}]", id)))?;
        Ok(())
    }

    async fn unpause(&self, id: &str) -> Result<()> {
        let req = with_namespace!(
            ResumeTaskRequest {
                container_id: id.to_string(),
            },
            self.ns()
        );
        match self.tasks().resume(req).await {
            Ok(_) => Ok(()),
            Err(s)
                if s.code() == tonic::Code::FailedPrecondition
                    || s.message().contains("not paused") =>
            {
                Err(Error::NotPaused { id: id.to_string() })
            }
            Err(s) => Err(grpc(format!("resume container[{}]", id))(s)),
        }
    }

    async fn rmf(&self, id: &str) -> Result<()> {
        self.kill_task(id, "", SIGKILL).await?;
        self.wait_task(id, "").await?;
        self.delete_task(id).await
    }

    async fn restart(&self, id: &str, wait_secs: u64) -> Result<()> {
        let container = self.container(id).await?;
        self.stop_task(id, Duration::from_secs(wait_secs)).await?;
        self.delete_task(id).await?;

        let mut snapshots = SnapshotsClient::new(self.channel.clone());
        let req = with_namespace!(
            MountsRequest {
                snapshotter: container.snapshotter.clone(),
                key: container.snapshot_key.clone(),
            },
            self.ns()
        );
        let mounts = snapshots
            .mounts(req)
            .await
            .map_err(grpc(format!("get rootfs mounts of container[{}]", id)))?
            .into_inner()
            .mounts;

        let mut tasks = self.tasks();
        let req = with_namespace!(
            CreateTaskRequest {
                container_id: id.to_string(),
                rootfs: mounts,
                ..Default::default()
            },
            self.ns()
        );
        tasks
            .create(req)
            .await
            .map_err(grpc(format!("create task of container[{}]", id)))?;
        let req = with_namespace!(
            StartRequest {
                container_id: id.to_string(),
                exec_id: String::new(),
            },
            self.ns()
        );
        tasks
            .start(req)
            .await
            .map_err(grpc(format!("start task of container[{}]", id)))?;
        info!("crclient: container[{}] restarted", id);
        Ok(())
    }

    async fn cp_file(&self, id: &str, src: &Path, dst: &str) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let io_err = |e| Error::Io {
            path: src.to_path_buf(),
            source: e,
        };
        let meta = fs::metadata(src).map_err(io_err)?;

        let rootfs = self.cfg.rootfs_path(id);
        if rootfs.is_dir() {
            let target = rootfs.join(dst.trim_start_matches('/'));
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
            return Ok(());
        }

        let data = fs::read(src).map_err(io_err)?;
        let perm = meta.permissions().mode() & 0o7777;
        let dst = osutil::cmd::shell_quote(dst);
        let script = format!("touch {0} && chmod {1:o} {0} && cat > {0}", dst, perm);
        let r = self
            .exec_process(
                id,
                &["/bin/sh", "-c", &script],
                Some(data),
                Some(Duration::from_millis(500)),
            )
            .await?;
        if r.code != 0 && r.code != EXIT_SIGTERM {
            return Err(Error::Exec {
                id: id.to_string(),
                code: r.code,
                output: format!("{}{}", r.stdout, r.stderr).trim().to_string(),
            });
        }
        Ok(())
    }

    async fn list_id(&self) -> Result<Vec<String>> {
        let mut client = ContainersClient::new(self.channel.clone());
        let req = with_namespace!(ListContainersRequest { filters: vec![] }, self.ns());
        let resp = client
            .list(req)
            .await
            .map_err(grpc("list containers"))?;
        Ok(resp.into_inner().containers.into_iter().map(|c| c.id).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = ContainerdConfig::default();
        assert_eq!(cfg.socket, PathBuf::from("/run/containerd/containerd.sock"));
        assert_eq!(cfg.namespace, "k8s.io");
        assert_eq!(
            cfg.rootfs_path("abc"),
            PathBuf::from("/run/containerd/io.containerd.runtime.v2.task/k8s.io/abc/rootfs")
        );
    }

    #[test]
    fn test_process_spec_keeps_container_settings() {
        let spec = br#"{"ociVersion":"1.0.2","process":{"user":{"uid":1000,"gid":1000},
            "env":["PATH=/bin","APP=1"],"cwd":"/app","args":["nginx"],"terminal":true}}"#;
        let out = process_spec(Some(spec), &["/bin/sh", "-c", "ls"]).unwrap();
        let v: Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(v["user"]["uid"], 1000);
        assert_eq!(v["cwd"], "/app");
        assert_eq!(v["args"], json!(["/bin/sh", "-c", "ls"]));
        assert_eq!(v["terminal"], false);
    }

    #[test]
    fn test_process_spec_default() {
        let out = process_spec(None, &["id"]).unwrap();
        let v: Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(v["user"]["uid"], 0);
        assert_eq!(v["env"][0], DEFAULT_PATH_ENV);
        assert_eq!(v["args"], json!(["id"]));
        // garbage spec falls back too
        let out = process_spec(Some(b"not json"), &["id"]).unwrap();
        let v: Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(v["cwd"], "/");
    }

    #[test]
    fn test_fifos_collect_and_cleanup() {
        let tmp = tempfile::tempdir().unwrap();
        let stopped = AtomicBool::new(true);
        let paths = {
            let fifos = Fifos::create(tmp.path(), "exec1", &["stdout", "stderr"]).unwrap();
            let mut f = open_fifo_nonblocking(&fifos.0[0]).unwrap();
            let mut w = OpenOptions::new().write(true).open(&fifos.0[0]).unwrap();
            w.write_all(b"hello").unwrap();
            assert_eq!(collect(&mut f, &stopped), "hello");
            // nothing buffered: returns at once instead of blocking
            let mut e = open_fifo_nonblocking(&fifos.0[1]).unwrap();
            assert_eq!(collect(&mut e, &stopped), "");
            fifos.0.clone()
        };
        assert!(paths.iter().all(|p| !p.exists()));
    }

    #[tokio::test]
    async fn test_collector_keeps_large_output_flowing() {
        let tmp = tempfile::tempdir().unwrap();
        let fifos = Fifos::create(tmp.path(), "exec2", &["stdout"]).unwrap();
        let collector = FifoCollector::start(open_fifo_nonblocking(&fifos.0[0]).unwrap());

        // four times the default pipe buffer; a blocking write only
        // completes if the reader keeps up
        let path = fifos.0[0].clone();
        let writer = tokio::task::spawn_blocking(move || {
            let mut w = OpenOptions::new().write(true).open(&path).unwrap();
            w.write_all(&vec![b'x'; 256 * 1024]).unwrap();
        });
        tokio::time::timeout(Duration::from_secs(10), writer)
            .await
            .unwrap()
            .unwrap();

        let out = collector.finish().await;
        assert_eq!(out.len(), 256 * 1024);
    }
}

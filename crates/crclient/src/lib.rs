//! Uniform client over the container runtimes an experiment can target.
//!
//! Docker and Pouch are driven through their CLIs, containerd over its gRPC
//! API. Clients are built lazily, once per runtime kind, by a
//! [`ClientRegistry`] that callers pass around explicitly.

pub mod cli;
pub mod cmd;
pub mod containerd;
#[cfg(any(test, feature = "test-utils"))]
pub mod fake;

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use log::info;
use tokio::sync::Mutex;

pub use cli::{CliClient, DockerConfig, PouchConfig};
pub use containerd::{ContainerdClient, ContainerdConfig};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("not support container runtime: {0}")]
    UnsupportedRuntime(String),
    #[error("container[{id}] uses runtime {runtime:?}, only runc is supported")]
    UnsupportedLowLevelRuntime { id: String, runtime: String },
    #[error("container[{id}] is not running")]
    NotRunning { id: String },
    #[error("container[{id}] is not paused")]
    NotPaused { id: String },
    #[error("exec in container[{id}] exited with code {code}: {output}")]
    Exec { id: String, code: i32, output: String },
    #[error("`{cmd}` exited with code {code}: {stderr}")]
    CommandFailed {
        cmd: String,
        code: i32,
        stderr: String,
    },
    #[error("connect to {socket} error: {detail}")]
    Connect { socket: String, detail: String },
    #[error("{op} error: {source}")]
    Grpc {
        op: String,
        #[source]
        source: tonic::Status,
    },
    #[error("parse {what} error: {detail}")]
    Parse { what: String, detail: String },
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Container runtime selected by `container_runtime` of an experiment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RuntimeKind {
    Docker,
    Containerd,
    Pouch,
}

impl RuntimeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuntimeKind::Docker => "docker",
            RuntimeKind::Containerd => "containerd",
            RuntimeKind::Pouch => "pouch",
        }
    }
}

impl fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RuntimeKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "docker" => Ok(RuntimeKind::Docker),
            "containerd" => Ok(RuntimeKind::Containerd),
            "pouch" => Ok(RuntimeKind::Pouch),
            other => Err(Error::UnsupportedRuntime(other.to_string())),
        }
    }
}

/// One entry of a container's process list.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SimpleProcess {
    /// Host pid
    pub pid: i32,
    pub cmd: String,
}

#[async_trait]
pub trait ContainerClient: Send + Sync {
    fn kind(&self) -> RuntimeKind;

    /// Host pid of the container's init process.
    async fn get_pid_by_id(&self, id: &str) -> Result<i32>;

    async fn get_all_pid_list(&self, id: &str) -> Result<Vec<SimpleProcess>>;

    /// Run `cmd` through `/bin/sh -c` inside the container. Returns stdout
    /// followed by stderr; a non-zero exit code is an error.
    async fn exec(&self, id: &str, cmd: &str) -> Result<String>;

    async fn kill(&self, id: &str) -> Result<()>;

    async fn pause(&self, id: &str) -> Result<()>;

    async fn unpause(&self, id: &str) -> Result<()>;

    /// Force-remove the container.
    async fn rmf(&self, id: &str) -> Result<()>;

    /// Stop (waiting up to `wait_secs` before killing) and start again.
    async fn restart(&self, id: &str, wait_secs: u64) -> Result<()>;

    /// Copy a host file to `dst` inside the container, keeping its mode.
    async fn cp_file(&self, id: &str, src: &Path, dst: &str) -> Result<()>;

    async fn list_id(&self) -> Result<Vec<String>>;
}

/// Builds the client for a runtime kind.
#[async_trait]
pub trait ClientFactory: Send + Sync {
    async fn create(&self, kind: RuntimeKind) -> Result<Arc<dyn ContainerClient>>;
}

/// Factory for the real runtimes.
#[derive(Clone, Debug, Default)]
pub struct RuntimeFactory {
    pub docker: DockerConfig,
    pub containerd: ContainerdConfig,
    pub pouch: PouchConfig,
}

#[async_trait]
impl ClientFactory for RuntimeFactory {
    async fn create(&self, kind: RuntimeKind) -> Result<Arc<dyn ContainerClient>> {
        let client: Arc<dyn ContainerClient> = match kind {
            RuntimeKind::Docker => Arc::new(CliClient::docker(self.docker.clone())),
            RuntimeKind::Pouch => Arc::new(CliClient::pouch(self.pouch.clone())),
            RuntimeKind::Containerd => {
                Arc::new(ContainerdClient::connect(self.containerd.clone()).await?)
            }
        };
        Ok(client)
    }
}

/// One lazily-built client per runtime kind. Construction is serialized by
/// the map lock; the clients themselves are shared afterwards.
pub struct ClientRegistry {
    factory: Box<dyn ClientFactory>,
    clients: Mutex<HashMap<RuntimeKind, Arc<dyn ContainerClient>>>,
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::with_factory(Box::new(RuntimeFactory::default()))
    }

    pub fn with_factory(factory: Box<dyn ClientFactory>) -> Self {
        Self {
            factory,
            clients: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get(&self, kind: RuntimeKind) -> Result<Arc<dyn ContainerClient>> {
        let mut clients = self.clients.lock().await;
        if let Some(c) = clients.get(&kind) {
            return Ok(c.clone());
        }
        let c = self.factory.create(kind).await?;
        info!("crclient: {} client ready", kind);
        clients.insert(kind, c.clone());
        Ok(c)
    }

    pub async fn get_by_name(&self, runtime: &str) -> Result<Arc<dyn ContainerClient>> {
        self.get(runtime.parse()?).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::{FakeClient, FakeFactory};

    #[test]
    fn test_runtime_kind_parse() {
        assert_eq!("docker".parse::<RuntimeKind>().unwrap(), RuntimeKind::Docker);
        assert_eq!(
            "containerd".parse::<RuntimeKind>().unwrap(),
            RuntimeKind::Containerd
        );
        assert_eq!("pouch".parse::<RuntimeKind>().unwrap(), RuntimeKind::Pouch);
        let err = "crio".parse::<RuntimeKind>().unwrap_err();
        assert_eq!(err.to_string(), "not support container runtime: crio");
    }

    #[tokio::test]
    async fn test_registry_builds_each_kind_once() {
        let fake = Arc::new(FakeClient::new());
        let factory = FakeFactory::new(fake.clone());
        let created = factory.created();
        let reg = ClientRegistry::with_factory(Box::new(factory));

        let a = reg.get(RuntimeKind::Docker).await.unwrap();
        let b = reg.get_by_name("docker").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        reg.get(RuntimeKind::Pouch).await.unwrap();
        assert_eq!(*created.lock().unwrap(), vec![RuntimeKind::Docker, RuntimeKind::Pouch]);

        assert!(matches!(
            reg.get_by_name("rkt").await,
            Err(Error::UnsupportedRuntime(_))
        ));
    }
}

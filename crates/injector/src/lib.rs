//! Fault injectors and the contract they share.
//!
//! Every (target, fault) pair is a [`Fault`] implementation holding no
//! state of its own. [`FaultInjector`] pairs it with the experiment's
//! [`CommonInfo`], typed arguments and runtime record, and exposes the
//! object-safe [`Injector`] lifecycle the runner drives:
//! `set_default -> validate -> inject -> recover`.

pub mod args;
pub mod container;
pub mod cpu;
pub mod disk;
pub mod diskio;
pub mod info;
pub mod mem;
pub mod process;
pub mod registry;
pub mod target;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use cgroup::{Cgroup, FsProvider, RealFs};
use crclient::ClientRegistry;
use log::info;
use osutil::disk::BlockDevices;
use osutil::process::ProcFs;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

pub use info::{is_valid_uid, new_uid, recover_guard, validate_common, CommonInfo, Status};
pub use registry::Registry;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Rejected before any side effect.
    #[error("{0}")]
    InvalidArgs(String),
    #[error("not support target[{target}] fault[{fault}]")]
    UnknownFault { target: String, fault: String },
    #[error(transparent)]
    Cgroup(#[from] cgroup::Error),
    #[error(transparent)]
    Os(#[from] osutil::Error),
    #[error(transparent)]
    Client(#[from] crclient::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

pub(crate) fn invalid(msg: impl Into<String>) -> Error {
    Error::InvalidArgs(msg.into())
}

pub const DEFAULT_FILL_DIR_PREFIX: &str = "/tmp/chaosmeta_mem_tmpfs";
pub const DEFAULT_FALLBACK_CGROUP: &str = "/user.slice";

/// Everything an injector may touch, passed in explicitly.
pub struct Env {
    pub clients: Arc<ClientRegistry>,
    pub cgroup: Cgroup<Arc<dyn FsProvider>>,
    pub procfs: ProcFs,
    pub devices: BlockDevices,
    /// tmpfs mount point of a cache fill is this prefix plus the uid
    pub fill_dir_prefix: String,
    /// Group for tasks with no recorded original blkio group (host only)
    pub fallback_cgroup: String,
    /// Agent binary, re-executed for helper processes
    pub exe: PathBuf,
}

impl Default for Env {
    fn default() -> Self {
        let fs: Arc<dyn FsProvider> = Arc::new(RealFs);
        Self {
            clients: Arc::new(ClientRegistry::new()),
            cgroup: Cgroup::with_provider(fs, cgroup::Config::default()),
            procfs: ProcFs::default(),
            devices: BlockDevices::default(),
            fill_dir_prefix: DEFAULT_FILL_DIR_PREFIX.to_string(),
            fallback_cgroup: DEFAULT_FALLBACK_CGROUP.to_string(),
            exe: std::env::current_exe()
                .unwrap_or_else(|_| PathBuf::from(osutil::process::AGENT_NAME)),
        }
    }
}

/// Object-safe lifecycle of one experiment.
#[async_trait]
pub trait Injector: Send + Sync {
    fn info(&self) -> &CommonInfo;
    fn info_mut(&mut self) -> &mut CommonInfo;

    fn args(&self) -> Result<Value>;
    fn runtime(&self) -> Result<Value>;
    /// Replace the fault arguments; `null` resets them to defaults.
    fn set_args(&mut self, args: Value) -> Result<()>;
    fn set_runtime(&mut self, runtime: Value) -> Result<()>;

    /// Fill unset optional arguments. Runs before `validate`.
    fn set_default(&mut self);

    /// Check preconditions without mutating anything.
    async fn validate(&self, env: &Env) -> Result<()>;

    /// Apply the fault, recording in the runtime state whatever `recover`
    /// needs, including on failure.
    async fn inject(&mut self, env: &Env) -> Result<()>;

    /// Undo exactly what the runtime state records. Idempotent.
    async fn recover(&mut self, env: &Env) -> Result<()>;
}

/// One kind of fault. Implementations are stateless; arguments and runtime
/// state are owned by the surrounding [`FaultInjector`].
#[async_trait]
pub trait Fault: Default + Send + Sync + 'static {
    const TARGET: &'static str;
    const FAULT: &'static str;

    type Args: Serialize + DeserializeOwned + Default + Send + Sync;
    type Runtime: Serialize + DeserializeOwned + Default + Send + Sync;

    fn set_default(&self, _info: &CommonInfo, _args: &mut Self::Args) {}

    async fn validate(&self, info: &CommonInfo, args: &Self::Args, env: &Env) -> Result<()>;

    async fn inject(
        &self,
        info: &CommonInfo,
        args: &Self::Args,
        rt: &mut Self::Runtime,
        env: &Env,
    ) -> Result<()>;

    async fn recover(
        &self,
        info: &CommonInfo,
        args: &Self::Args,
        rt: &mut Self::Runtime,
        env: &Env,
    ) -> Result<()>;
}

pub struct FaultInjector<F: Fault> {
    info: CommonInfo,
    args: F::Args,
    runtime: F::Runtime,
    fault: F,
}

impl<F: Fault> Default for FaultInjector<F> {
    fn default() -> Self {
        Self {
            info: CommonInfo {
                target: F::TARGET.to_string(),
                fault: F::FAULT.to_string(),
                ..Default::default()
            },
            args: F::Args::default(),
            runtime: F::Runtime::default(),
            fault: F::default(),
        }
    }
}

impl<F: Fault> FaultInjector<F> {
    pub fn typed_args(&self) -> &F::Args {
        &self.args
    }

    pub fn typed_runtime(&self) -> &F::Runtime {
        &self.runtime
    }
}

fn from_value<T: DeserializeOwned + Default>(v: Value) -> Result<T> {
    if v.is_null() {
        return Ok(T::default());
    }
    Ok(serde_json::from_value(v)?)
}

#[async_trait]
impl<F: Fault> Injector for FaultInjector<F> {
    fn info(&self) -> &CommonInfo {
        &self.info
    }

    fn info_mut(&mut self) -> &mut CommonInfo {
        &mut self.info
    }

    fn args(&self) -> Result<Value> {
        Ok(serde_json::to_value(&self.args)?)
    }

    fn runtime(&self) -> Result<Value> {
        Ok(serde_json::to_value(&self.runtime)?)
    }

    fn set_args(&mut self, args: Value) -> Result<()> {
        self.args = from_value(args).map_err(|e| invalid(format!("parse args error: {}", e)))?;
        Ok(())
    }

    fn set_runtime(&mut self, runtime: Value) -> Result<()> {
        self.runtime = from_value(runtime)?;
        Ok(())
    }

    fn set_default(&mut self) {
        self.info.apply_defaults();
        self.fault.set_default(&self.info, &mut self.args);
    }

    async fn validate(&self, env: &Env) -> Result<()> {
        validate_common(&self.info)?;
        self.fault.validate(&self.info, &self.args, env).await
    }

    async fn inject(&mut self, env: &Env) -> Result<()> {
        info!(
            "injector: [{}] inject {} {}",
            self.info.uid, self.info.target, self.info.fault
        );
        self.fault
            .inject(&self.info, &self.args, &mut self.runtime, env)
            .await
    }

    async fn recover(&mut self, env: &Env) -> Result<()> {
        if recover_guard(&self.info) {
            return Ok(());
        }
        info!(
            "injector: [{}] recover {} {}",
            self.info.uid, self.info.target, self.info.fault
        );
        self.fault
            .recover(&self.info, &self.args, &mut self.runtime, env)
            .await
    }
}

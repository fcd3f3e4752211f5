//! Drives one injector lifecycle per invocation and keeps the experiment
//! record in step with it.

use std::path::PathBuf;

use injector::{Env, Injector, Registry, Status};
use log::{error, info, warn};
use serde_json::Value;

use crate::store::{self, Experiment, Filter, Store};

/// Runner outcome classes, each with a stable process exit code.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("args error: {0}")]
    BadArgs(#[source] injector::Error),
    #[error("store error: {0}")]
    Store(#[from] store::Error),
    #[error("inject error: {0}")]
    Inject(#[source] injector::Error),
    #[error("recover error: {0}")]
    Recover(#[source] injector::Error),
    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

pub const EXIT_OK: i32 = 0;
pub const EXIT_UNKNOWN: i32 = 1;
pub const EXIT_BAD_ARGS: i32 = 2;
pub const EXIT_STORE: i32 = 3;
pub const EXIT_INJECT: i32 = 4;
pub const EXIT_RECOVER: i32 = 5;
pub const EXIT_INTERNAL: i32 = 6;

impl Error {
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::BadArgs(_) => EXIT_BAD_ARGS,
            Error::Store(_) => EXIT_STORE,
            Error::Inject(_) => EXIT_INJECT,
            Error::Recover(_) => EXIT_RECOVER,
            Error::Internal(_) => EXIT_INTERNAL,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub data_dir: PathBuf,
    /// Arm a detached `recover` when the experiment has a timeout
    pub auto_recover: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(store::DEFAULT_DIR),
            auto_recover: true,
        }
    }
}

/// What the caller wants injected; everything but target and fault may be
/// left empty for defaults.
#[derive(Clone, Debug, Default)]
pub struct InjectRequest {
    pub target: String,
    pub fault: String,
    pub uid: String,
    pub creator: String,
    pub timeout: String,
    pub container_runtime: String,
    pub container_id: String,
    pub args: Value,
}

pub struct Runner {
    cfg: Config,
    store: Store,
    env: Env,
    registry: &'static Registry,
}

impl Runner {
    pub fn new(cfg: Config, env: Env) -> Result<Self> {
        Self::with_registry(cfg, env, Registry::builtin())
    }

    pub fn with_registry(cfg: Config, env: Env, registry: &'static Registry) -> Result<Self> {
        let store = Store::open(&cfg.data_dir)?;
        Ok(Self {
            cfg,
            store,
            env,
            registry,
        })
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn env(&self) -> &Env {
        &self.env
    }

    fn build(&self, req: &InjectRequest) -> Result<Box<dyn Injector>> {
        let mut inj = self
            .registry
            .get(&req.target, &req.fault)
            .map_err(Error::BadArgs)?;
        {
            let info = inj.info_mut();
            info.uid = req.uid.clone();
            info.creator = req.creator.clone();
            info.timeout = req.timeout.clone();
            info.container_runtime = req.container_runtime.clone();
            info.container_id = req.container_id.clone();
        }
        inj.set_args(req.args.clone()).map_err(Error::BadArgs)?;
        Ok(inj)
    }

    fn record(inj: &dyn Injector) -> Result<Experiment> {
        let args = inj
            .args()
            .map_err(|e| Error::Internal(format!("encode args: {}", e)))?;
        let runtime = inj
            .runtime()
            .map_err(|e| Error::Internal(format!("encode runtime: {}", e)))?;
        Ok(Experiment::from_info(inj.info(), args, runtime))
    }

    /// Validate, record and inject. Returns the experiment uid.
    pub async fn process_inject(&self, req: &InjectRequest) -> Result<String> {
        let mut inj = self.build(req)?;
        inj.set_default();
        inj.validate(&self.env).await.map_err(Error::BadArgs)?;

        let uid = inj.info().uid.clone();
        inj.info_mut().status = Status::Created;
        let mut rec = Self::record(&*inj)?;
        self.store.insert(&mut rec)?;
        info!(
            "runner: [{}] created {} {} by {}",
            uid, rec.target, rec.fault, rec.creator
        );

        if let Err(e) = inj.inject(&self.env).await {
            error!("runner: [{}] inject failed: {}", uid, e);
            // keep whatever runtime was captured so recover can clean up
            let info = inj.info_mut();
            info.status = Status::Error;
            info.error = e.to_string();
            match Self::record(&*inj) {
                Ok(mut failed) => {
                    failed.create_time = rec.create_time.clone();
                    if let Err(se) = self.store.update(&mut failed) {
                        error!("runner: [{}] persist error state failed: {}", uid, se);
                    }
                }
                Err(re) => error!("runner: [{}] {}", uid, re),
            }
            return Err(Error::Inject(e));
        }

        inj.info_mut().status = Status::Success;
        let persisted = Self::record(&*inj).and_then(|mut done| {
            done.create_time = rec.create_time.clone();
            self.store.update(&mut done).map_err(Error::from)
        });
        if let Err(e) = persisted {
            error!(
                "runner: [{}] persist success state failed, recovering: {}",
                uid, e
            );
            if let Err(re) = inj.recover(&self.env).await {
                error!("runner: [{}] rollback recover failed: {}", uid, re);
            }
            return Err(e);
        }
        info!("runner: [{}] inject success", uid);

        self.arm_recover(&*inj);
        Ok(uid)
    }

    fn arm_recover(&self, inj: &dyn Injector) {
        let info = inj.info();
        let secs = match info.timeout_secs() {
            Ok(Some(s)) => s,
            Ok(None) => return,
            Err(e) => {
                warn!("runner: [{}] timeout ignored: {}", info.uid, e);
                return;
            }
        };
        if !self.cfg.auto_recover {
            return;
        }
        match osutil::cmd::start_sleep_recover(&self.env.exe, &self.cfg.data_dir, &info.uid, secs) {
            Ok(pid) => info!(
                "runner: [{}] auto recover in {}s armed, pid {}",
                info.uid, secs, pid
            ),
            Err(e) => warn!(
                "runner: [{}] arm auto recover failed: {}; run `{} recover {}` manually",
                info.uid,
                e,
                osutil::process::AGENT_NAME,
                info.uid
            ),
        }
    }

    /// Undo an experiment from its persisted record.
    pub async fn process_recover(&self, uid: &str) -> Result<()> {
        let rec = self.store.get_by_uid(uid)?;
        let mut inj = self
            .registry
            .get(&rec.target, &rec.fault)
            .map_err(|e| Error::Internal(e.to_string()))?;
        *inj.info_mut() = rec.info();
        inj.set_args(rec.args.clone())
            .map_err(|e| Error::Internal(format!("load args: {}", e)))?;
        inj.set_runtime(rec.runtime.clone())
            .map_err(|e| Error::Internal(format!("load runtime: {}", e)))?;

        inj.recover(&self.env).await.map_err(|e| {
            error!("runner: [{}] recover failed: {}", uid, e);
            Error::Recover(e)
        })?;

        if rec.status != Status::Destroyed {
            let mut done = rec;
            done.status = Status::Destroyed;
            match inj.runtime() {
                Ok(rt) => done.runtime = rt,
                Err(e) => warn!("runner: [{}] encode runtime: {}", uid, e),
            }
            if let Err(e) = self.store.update(&mut done) {
                warn!("runner: [{}] mark destroyed failed: {}", uid, e);
            }
        }
        info!("runner: [{}] recover success", uid);
        Ok(())
    }

    pub fn process_query(&self, filter: &Filter) -> Result<(Vec<Experiment>, usize)> {
        Ok(self.store.query(filter)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        let bad = Error::BadArgs(injector::Error::InvalidArgs("x".to_string()));
        assert_eq!(bad.exit_code(), EXIT_BAD_ARGS);
        assert_eq!(bad.to_string(), "args error: x");
        let store = Error::Store(store::Error::NotFound {
            uid: "abcde".to_string(),
        });
        assert_eq!(store.exit_code(), EXIT_STORE);
        assert_eq!(
            Error::Inject(injector::Error::InvalidArgs(String::new())).exit_code(),
            EXIT_INJECT
        );
        assert_eq!(
            Error::Recover(injector::Error::InvalidArgs(String::new())).exit_code(),
            EXIT_RECOVER
        );
        assert_eq!(Error::Internal(String::new()).exit_code(), EXIT_INTERNAL);
    }
}

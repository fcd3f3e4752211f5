//! Process faults: kill with a signal, or stop until recovered.

use async_trait::async_trait;
use log::{info, warn};
use nix::sys::signal::Signal;
use osutil::process::{send_signal, to_signal};
use serde::{Deserialize, Serialize};

use crate::target::{container_client, resolve_pids, PidScope};
use crate::{args, invalid, CommonInfo, Env, Fault, Result};

pub const DEFAULT_SIGNAL: i32 = 9;

fn pid_arg(pid: Option<i32>) -> String {
    pid.map(|p| p.to_string()).unwrap_or_default()
}

async fn target_pids(info: &CommonInfo, env: &Env, pid: Option<i32>, key: &str) -> Result<Vec<i32>> {
    if let Some(p) = pid {
        if p <= 0 {
            return Err(invalid(format!("\"pid\"[{}] must be larger than 0", p)));
        }
    }
    resolve_pids(info, env, &pid_arg(pid), key, PidScope::ContainerMember).await
}

/// Signal each pid, collecting the ones reached. Processes that exit in
/// between are skipped.
fn signal_all(uid: &str, pids: &[i32], sig: Signal, done: &mut Vec<i32>) -> Result<()> {
    for &pid in pids {
        match send_signal(pid, sig) {
            Ok(()) => {
                info!("injector: [{}] sent {} to pid {}", uid, sig, pid);
                done.push(pid);
            }
            Err(osutil::Error::NoSuchProcess { .. }) => {
                warn!("injector: [{}] pid {} exited before {}", uid, pid, sig);
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KillArgs {
    #[serde(deserialize_with = "args::opt_num")]
    pub pid: Option<i32>,
    #[serde(deserialize_with = "args::string")]
    pub key: String,
    #[serde(deserialize_with = "args::opt_num")]
    pub signal: Option<i32>,
    /// Shell command run on recover, e.g. to restart the service
    #[serde(alias = "recover-cmd", deserialize_with = "args::string")]
    pub recover_cmd: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KillRuntime {
    pub killed: Vec<i32>,
}

#[derive(Default)]
pub struct ProcessKill;

impl ProcessKill {
    fn signal(args: &KillArgs) -> Result<Signal> {
        let sig = args.signal.unwrap_or(DEFAULT_SIGNAL);
        if sig <= 0 {
            return Err(invalid(format!("\"signal\"[{}] must be larger than 0", sig)));
        }
        to_signal(sig).map_err(|e| invalid(e.to_string()))
    }
}

#[async_trait]
impl Fault for ProcessKill {
    const TARGET: &'static str = "process";
    const FAULT: &'static str = "kill";
    type Args = KillArgs;
    type Runtime = KillRuntime;

    fn set_default(&self, _info: &CommonInfo, args: &mut KillArgs) {
        if args.signal.is_none() {
            args.signal = Some(DEFAULT_SIGNAL);
        }
    }

    async fn validate(&self, info: &CommonInfo, args: &KillArgs, env: &Env) -> Result<()> {
        Self::signal(args)?;
        target_pids(info, env, args.pid, &args.key).await?;
        Ok(())
    }

    async fn inject(
        &self,
        info: &CommonInfo,
        args: &KillArgs,
        rt: &mut KillRuntime,
        env: &Env,
    ) -> Result<()> {
        let sig = Self::signal(args)?;
        let pids = target_pids(info, env, args.pid, &args.key).await?;
        signal_all(&info.uid, &pids, sig, &mut rt.killed)
    }

    async fn recover(
        &self,
        info: &CommonInfo,
        args: &KillArgs,
        _rt: &mut KillRuntime,
        env: &Env,
    ) -> Result<()> {
        let cmd = args.recover_cmd.trim();
        if cmd.is_empty() {
            return Ok(());
        }
        if info.in_container() {
            let out = container_client(info, env)
                .await?
                .exec(&info.container_id, cmd)
                .await?;
            info!(
                "injector: [{}] recover cmd in container[{}]: {}",
                info.uid,
                info.container_id,
                out.trim()
            );
        } else {
            let pid = osutil::cmd::spawn_detached(cmd)?;
            info!("injector: [{}] recover cmd started as pid {}", info.uid, pid);
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StopArgs {
    #[serde(deserialize_with = "args::opt_num")]
    pub pid: Option<i32>,
    #[serde(deserialize_with = "args::string")]
    pub key: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StopRuntime {
    pub stopped: Vec<i32>,
}

#[derive(Default)]
pub struct ProcessStop;

#[async_trait]
impl Fault for ProcessStop {
    const TARGET: &'static str = "process";
    const FAULT: &'static str = "stop";
    type Args = StopArgs;
    type Runtime = StopRuntime;

    async fn validate(&self, info: &CommonInfo, args: &StopArgs, env: &Env) -> Result<()> {
        target_pids(info, env, args.pid, &args.key).await?;
        Ok(())
    }

    async fn inject(
        &self,
        info: &CommonInfo,
        args: &StopArgs,
        rt: &mut StopRuntime,
        env: &Env,
    ) -> Result<()> {
        let pids = target_pids(info, env, args.pid, &args.key).await?;
        signal_all(&info.uid, &pids, Signal::SIGSTOP, &mut rt.stopped)
    }

    async fn recover(
        &self,
        info: &CommonInfo,
        _args: &StopArgs,
        rt: &mut StopRuntime,
        env: &Env,
    ) -> Result<()> {
        let alive: Vec<i32> = rt
            .stopped
            .iter()
            .copied()
            .filter(|p| env.procfs.exists(*p))
            .collect();
        let mut resumed = Vec::new();
        signal_all(&info.uid, &alive, Signal::SIGCONT, &mut resumed)?;
        rt.stopped.clear();
        Ok(())
    }
}

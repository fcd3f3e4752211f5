//! Container lifecycle faults: pause, rm, restart, kill.

use async_trait::async_trait;
use log::info;
use serde::{Deserialize, Serialize};

use crate::target::{container_client, require_container};
use crate::{args, invalid, CommonInfo, Env, Fault, Result};

pub const DEFAULT_WAIT_TIME: u64 = 10;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoArgs {}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoRuntime {}

/// Fails fast when the container does not exist or is not running.
async fn validate_running(info: &CommonInfo, env: &Env) -> Result<()> {
    require_container(info)?;
    container_client(info, env)
        .await?
        .get_pid_by_id(&info.container_id)
        .await?;
    Ok(())
}

#[derive(Default)]
pub struct ContainerPause;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PauseRuntime {
    pub paused: bool,
}

#[async_trait]
impl Fault for ContainerPause {
    const TARGET: &'static str = "container";
    const FAULT: &'static str = "pause";
    type Args = NoArgs;
    type Runtime = PauseRuntime;

    async fn validate(&self, info: &CommonInfo, _args: &NoArgs, env: &Env) -> Result<()> {
        validate_running(info, env).await
    }

    async fn inject(
        &self,
        info: &CommonInfo,
        _args: &NoArgs,
        rt: &mut PauseRuntime,
        env: &Env,
    ) -> Result<()> {
        container_client(info, env)
            .await?
            .pause(&info.container_id)
            .await?;
        rt.paused = true;
        Ok(())
    }

    async fn recover(
        &self,
        info: &CommonInfo,
        _args: &NoArgs,
        rt: &mut PauseRuntime,
        env: &Env,
    ) -> Result<()> {
        if !rt.paused {
            return Ok(());
        }
        match container_client(info, env)
            .await?
            .unpause(&info.container_id)
            .await
        {
            Ok(()) => {}
            Err(crclient::Error::NotPaused { id }) => {
                info!("container[{}] is already running, nothing to unpause", id)
            }
            Err(e) => return Err(e.into()),
        }
        rt.paused = false;
        Ok(())
    }
}

#[derive(Default)]
pub struct ContainerRm;

#[async_trait]
impl Fault for ContainerRm {
    const TARGET: &'static str = "container";
    const FAULT: &'static str = "rm";
    type Args = NoArgs;
    type Runtime = NoRuntime;

    async fn validate(&self, info: &CommonInfo, _args: &NoArgs, env: &Env) -> Result<()> {
        validate_running(info, env).await
    }

    async fn inject(
        &self,
        info: &CommonInfo,
        _args: &NoArgs,
        _rt: &mut NoRuntime,
        env: &Env,
    ) -> Result<()> {
        container_client(info, env)
            .await?
            .rmf(&info.container_id)
            .await?;
        Ok(())
    }

    async fn recover(
        &self,
        info: &CommonInfo,
        _args: &NoArgs,
        _rt: &mut NoRuntime,
        _env: &Env,
    ) -> Result<()> {
        info!(
            "injector: [{}] removed container[{}] is not brought back",
            info.uid, info.container_id
        );
        Ok(())
    }
}

#[derive(Default)]
pub struct ContainerRestart;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartArgs {
    /// Seconds to wait for the container to stop before it is killed
    #[serde(alias = "wait-time", deserialize_with = "args::opt_num")]
    pub wait_time: Option<u64>,
}

#[async_trait]
impl Fault for ContainerRestart {
    const TARGET: &'static str = "container";
    const FAULT: &'static str = "restart";
    type Args = RestartArgs;
    type Runtime = NoRuntime;

    fn set_default(&self, _info: &CommonInfo, args: &mut RestartArgs) {
        if args.wait_time.is_none() {
            args.wait_time = Some(DEFAULT_WAIT_TIME);
        }
    }

    async fn validate(&self, info: &CommonInfo, args: &RestartArgs, env: &Env) -> Result<()> {
        if args.wait_time == Some(0) {
            return Err(invalid("\"wait-time\" must be larger than 0"));
        }
        validate_running(info, env).await
    }

    async fn inject(
        &self,
        info: &CommonInfo,
        args: &RestartArgs,
        _rt: &mut NoRuntime,
        env: &Env,
    ) -> Result<()> {
        container_client(info, env)
            .await?
            .restart(
                &info.container_id,
                args.wait_time.unwrap_or(DEFAULT_WAIT_TIME),
            )
            .await?;
        Ok(())
    }

    async fn recover(
        &self,
        _info: &CommonInfo,
        _args: &RestartArgs,
        _rt: &mut NoRuntime,
        _env: &Env,
    ) -> Result<()> {
        Ok(())
    }
}

#[derive(Default)]
pub struct ContainerKill;

#[async_trait]
impl Fault for ContainerKill {
    const TARGET: &'static str = "container";
    const FAULT: &'static str = "kill";
    type Args = NoArgs;
    type Runtime = NoRuntime;

    async fn validate(&self, info: &CommonInfo, _args: &NoArgs, env: &Env) -> Result<()> {
        validate_running(info, env).await
    }

    async fn inject(
        &self,
        info: &CommonInfo,
        _args: &NoArgs,
        _rt: &mut NoRuntime,
        env: &Env,
    ) -> Result<()> {
        container_client(info, env)
            .await?
            .kill(&info.container_id)
            .await?;
        Ok(())
    }

    // Whether a killed container comes back is up to its restart policy.
    async fn recover(
        &self,
        _info: &CommonInfo,
        _args: &NoArgs,
        _rt: &mut NoRuntime,
        _env: &Env,
    ) -> Result<()> {
        Ok(())
    }
}

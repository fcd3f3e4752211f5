//! Resolving what an experiment acts on: the container client, a
//! container's cgroup, and the target pid list.

use std::sync::Arc;

use cgroup::Subsystem;
use crclient::ContainerClient;
use log::debug;
use osutil::process::{is_agent_invocation, parse_pid_list};

use crate::{invalid, CommonInfo, Env, Result};

/// Fail unless both the runtime and the container id are set.
pub fn require_container(info: &CommonInfo) -> Result<()> {
    if info.container_runtime.is_empty() || info.container_id.is_empty() {
        return Err(invalid(
            "must provide \"container-runtime\" and \"container-id\"",
        ));
    }
    Ok(())
}

pub async fn container_client(info: &CommonInfo, env: &Env) -> Result<Arc<dyn ContainerClient>> {
    Ok(env.clients.get_by_name(&info.container_runtime).await?)
}

/// Group of the container's init process in hierarchy `sub`.
pub async fn container_cgroup(info: &CommonInfo, env: &Env, sub: Subsystem) -> Result<String> {
    let client = container_client(info, env).await?;
    let pid = client.get_pid_by_id(&info.container_id).await?;
    let rel = env.cgroup.pid_cgroup(pid, sub)?;
    debug!(
        "injector: container[{}] pid {} {} cgroup {}",
        info.container_id, pid, sub, rel
    );
    Ok(rel)
}

/// How an explicit pid list is treated when targeting a container.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PidScope {
    /// Host-only; explicit pids are rejected for containers
    HostOnly,
    /// Explicit pids must belong to the container
    ContainerMember,
}

/// Target pids from an explicit comma-separated list or a command-line
/// key. The list wins when both are given. Inside a container the key is
/// matched against the container's process list.
pub async fn resolve_pids(
    info: &CommonInfo,
    env: &Env,
    pid_list: &str,
    key: &str,
    scope: PidScope,
) -> Result<Vec<i32>> {
    let pid_list = pid_list.trim();
    let key = key.trim();
    if pid_list.is_empty() && key.is_empty() {
        return Err(invalid("must provide \"pid\" or \"key\""));
    }
    let explicit = parse_pid_list(pid_list).map_err(|e| invalid(e.to_string()))?;

    let pids = if info.in_container() {
        if !explicit.is_empty() && scope == PidScope::HostOnly {
            return Err(invalid("not support \"pid-list\" args in container"));
        }
        let procs = container_client(info, env)
            .await?
            .get_all_pid_list(&info.container_id)
            .await?;
        if !explicit.is_empty() {
            for pid in &explicit {
                if !procs.iter().any(|p| p.pid == *pid) {
                    return Err(invalid(format!(
                        "pid[{}] is not in container[{}]",
                        pid, info.container_id
                    )));
                }
            }
            explicit
        } else {
            procs
                .into_iter()
                .filter(|p| p.cmd.contains(key) && !is_agent_invocation(&p.cmd))
                .map(|p| p.pid)
                .collect()
        }
    } else if !explicit.is_empty() {
        for pid in &explicit {
            if !env.procfs.exists(*pid) {
                return Err(invalid(format!("pid[{}] is not exist", pid)));
            }
        }
        explicit
    } else {
        env.procfs.pids_by_key(key)?
    };

    if pids.is_empty() {
        return Err(invalid("no valid pid"));
    }
    Ok(pids)
}

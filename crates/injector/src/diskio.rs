//! Block IO faults through blkio throttling: `hang` throttles to 1 B/s,
//! `limit` applies the given rates.

use std::collections::HashMap;

use async_trait::async_trait;
use cgroup::blkio::{self, Throttle};
use cgroup::Subsystem;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::target::{container_cgroup, resolve_pids, PidScope};
use crate::{args, invalid, CommonInfo, Env, Fault, Result};

/// Rate used to hang IO: one byte per second.
pub const HANG_BYTES: u64 = 1;

pub const MODE_ALL: &str = "all";
pub const MODE_READ: &str = "read";
pub const MODE_WRITE: &str = "write";

/// What inject created, so recover can undo it without looking anything
/// up again.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlkioRuntime {
    /// Group relative to the blkio root; empty until created
    pub group: String,
    /// Destination for tasks with no snapshot entry
    pub fallback: String,
    /// Original blkio group of each target pid
    pub snapshot: HashMap<i32, String>,
}

async fn targets(
    info: &CommonInfo,
    env: &Env,
    pid_list: &str,
    key: &str,
    dev_list: &str,
) -> Result<(Vec<i32>, Vec<String>)> {
    let pids = resolve_pids(info, env, pid_list, key, PidScope::HostOnly).await?;
    for &pid in &pids {
        let rel = env.cgroup.pid_cgroup(pid, Subsystem::Blkio)?;
        if blkio::in_experiment_group(&rel) {
            return Err(invalid(format!(
                "pid[{}] is already in blkio experiment cgroup[{}]",
                pid, rel
            )));
        }
    }
    let devs = env.devices.validate_dev_list(dev_list).map_err(|e| invalid(e.to_string()))?;
    Ok((pids, devs))
}

async fn inject_throttle(
    info: &CommonInfo,
    env: &Env,
    pids: &[i32],
    devs: &[String],
    throttle: Throttle,
    rt: &mut BlkioRuntime,
) -> Result<()> {
    let parent = if info.in_container() {
        Some(container_cgroup(info, env, Subsystem::Blkio).await?)
    } else {
        None
    };
    let group = blkio::group_rel_path(&info.uid, parent.as_deref());
    rt.fallback = parent.unwrap_or_else(|| env.fallback_cgroup.clone());
    rt.snapshot = env.cgroup.snapshot(pids, Subsystem::Blkio)?;

    let path = env.cgroup.subsystem_path(Subsystem::Blkio, &group);
    env.cgroup.create_group(&path, &throttle.writes(devs))?;
    rt.group = group;
    info!(
        "injector: [{}] blkio group {} created for {:?}",
        info.uid,
        path.display(),
        devs
    );

    if let Err(e) = env.cgroup.move_pids(pids, &path) {
        warn!(
            "injector: [{}] move pids into {} failed, undoing: {}",
            info.uid,
            path.display(),
            e
        );
        if let Err(undo) = undo_group(env, rt) {
            warn!("injector: [{}] undo blkio group error: {}", info.uid, undo);
        }
        return Err(e.into());
    }
    Ok(())
}

fn undo_group(env: &Env, rt: &mut BlkioRuntime) -> Result<()> {
    if rt.group.is_empty() {
        return Ok(());
    }
    let path = env.cgroup.subsystem_path(Subsystem::Blkio, &rt.group);
    if !env.cgroup.exists(&path) {
        debug!("injector: blkio group {} already gone", path.display());
        rt.group.clear();
        return Ok(());
    }
    let moved = env
        .cgroup
        .evacuate(&path, Subsystem::Blkio, &rt.snapshot, &rt.fallback)?;
    env.cgroup.remove_group(&path)?;
    debug!(
        "injector: blkio group {} removed, {} tasks moved back",
        path.display(),
        moved
    );
    rt.group.clear();
    Ok(())
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HangArgs {
    #[serde(alias = "pid-list", deserialize_with = "args::string")]
    pub pid_list: String,
    #[serde(deserialize_with = "args::string")]
    pub key: String,
    #[serde(alias = "dev-list", deserialize_with = "args::string")]
    pub dev_list: String,
    #[serde(deserialize_with = "args::string")]
    pub mode: String,
}

impl HangArgs {
    fn throttle(&self) -> Result<Throttle> {
        let (read, write) = match self.mode.as_str() {
            MODE_ALL => (true, true),
            MODE_READ => (true, false),
            MODE_WRITE => (false, true),
            other => return Err(invalid(format!("\"mode\"[{}] is not supported", other))),
        };
        Ok(Throttle {
            read_bps: read.then_some(HANG_BYTES),
            write_bps: write.then_some(HANG_BYTES),
            ..Default::default()
        })
    }
}

#[derive(Default)]
pub struct DiskioHang;

#[async_trait]
impl Fault for DiskioHang {
    const TARGET: &'static str = "diskio";
    const FAULT: &'static str = "hang";
    type Args = HangArgs;
    type Runtime = BlkioRuntime;

    fn set_default(&self, _info: &CommonInfo, args: &mut HangArgs) {
        if args.mode.is_empty() {
            args.mode = MODE_ALL.to_string();
        }
    }

    async fn validate(&self, info: &CommonInfo, args: &HangArgs, env: &Env) -> Result<()> {
        args.throttle()?;
        targets(info, env, &args.pid_list, &args.key, &args.dev_list).await?;
        Ok(())
    }

    async fn inject(
        &self,
        info: &CommonInfo,
        args: &HangArgs,
        rt: &mut BlkioRuntime,
        env: &Env,
    ) -> Result<()> {
        let throttle = args.throttle()?;
        let (pids, devs) = targets(info, env, &args.pid_list, &args.key, &args.dev_list).await?;
        inject_throttle(info, env, &pids, &devs, throttle, rt).await
    }

    async fn recover(
        &self,
        _info: &CommonInfo,
        _args: &HangArgs,
        rt: &mut BlkioRuntime,
        env: &Env,
    ) -> Result<()> {
        undo_group(env, rt)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitArgs {
    #[serde(alias = "pid-list", deserialize_with = "args::string")]
    pub pid_list: String,
    #[serde(deserialize_with = "args::string")]
    pub key: String,
    #[serde(alias = "dev-list", deserialize_with = "args::string")]
    pub dev_list: String,
    /// Read rate such as `10MB`; a bare number is bytes
    #[serde(alias = "read-bytes", deserialize_with = "args::string")]
    pub read_bytes: String,
    #[serde(alias = "write-bytes", deserialize_with = "args::string")]
    pub write_bytes: String,
    #[serde(alias = "read-io", deserialize_with = "args::opt_num")]
    pub read_io: Option<u64>,
    #[serde(alias = "write-io", deserialize_with = "args::opt_num")]
    pub write_io: Option<u64>,
}

fn rate(name: &str, s: &str) -> Result<Option<u64>> {
    if s.trim().is_empty() {
        return Ok(None);
    }
    match osutil::units::parse_bytes(s) {
        Ok(0) => Err(invalid(format!("\"{}\" must be larger than 0", name))),
        Ok(n) => Ok(Some(n)),
        Err(e) => Err(invalid(format!("\"{}\" is invalid: {}", name, e))),
    }
}

impl LimitArgs {
    fn throttle(&self) -> Result<Throttle> {
        for (name, v) in [("read-io", self.read_io), ("write-io", self.write_io)] {
            if v == Some(0) {
                return Err(invalid(format!("\"{}\" must be larger than 0", name)));
            }
        }
        let t = Throttle {
            read_bps: rate("read-bytes", &self.read_bytes)?,
            write_bps: rate("write-bytes", &self.write_bytes)?,
            read_iops: self.read_io,
            write_iops: self.write_io,
        };
        if t.is_empty() {
            return Err(invalid(
                "must provide at least one of \"read-bytes\", \"write-bytes\", \"read-io\", \"write-io\"",
            ));
        }
        Ok(t)
    }
}

#[derive(Default)]
pub struct DiskioLimit;

#[async_trait]
impl Fault for DiskioLimit {
    const TARGET: &'static str = "diskio";
    const FAULT: &'static str = "limit";
    type Args = LimitArgs;
    type Runtime = BlkioRuntime;

    async fn validate(&self, info: &CommonInfo, args: &LimitArgs, env: &Env) -> Result<()> {
        args.throttle()?;
        targets(info, env, &args.pid_list, &args.key, &args.dev_list).await?;
        Ok(())
    }

    async fn inject(
        &self,
        info: &CommonInfo,
        args: &LimitArgs,
        rt: &mut BlkioRuntime,
        env: &Env,
    ) -> Result<()> {
        let throttle = args.throttle()?;
        let (pids, devs) = targets(info, env, &args.pid_list, &args.key, &args.dev_list).await?;
        inject_throttle(info, env, &pids, &devs, throttle, rt).await
    }

    async fn recover(
        &self,
        _info: &CommonInfo,
        _args: &LimitArgs,
        rt: &mut BlkioRuntime,
        env: &Env,
    ) -> Result<()> {
        undo_group(env, rt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hang_throttle_modes() {
        let mut a = HangArgs::default();
        DiskioHang.set_default(&CommonInfo::default(), &mut a);
        assert_eq!(a.mode, MODE_ALL);
        let t = a.throttle().unwrap();
        assert_eq!(t.read_bps, Some(HANG_BYTES));
        assert_eq!(t.write_bps, Some(HANG_BYTES));

        a.mode = MODE_WRITE.to_string();
        let t = a.throttle().unwrap();
        assert_eq!(t.read_bps, None);
        assert_eq!(t.write_bps, Some(1));

        a.mode = "both".to_string();
        assert!(a.throttle().is_err());
    }

    #[test]
    fn test_limit_throttle() {
        let a: LimitArgs = serde_json::from_value(serde_json::json!({
            "read-bytes": "10MB",
            "write_io": "50",
        }))
        .unwrap();
        let t = a.throttle().unwrap();
        assert_eq!(t.read_bps, Some(10 * 1024 * 1024));
        assert_eq!(t.write_bps, None);
        assert_eq!(t.write_iops, Some(50));

        assert!(LimitArgs::default().throttle().is_err());

        let zero = LimitArgs {
            read_io: Some(0),
            write_bytes: "1kb".to_string(),
            ..Default::default()
        };
        assert!(zero.throttle().is_err());

        let bad = LimitArgs {
            read_bytes: "ten".to_string(),
            ..Default::default()
        };
        assert!(bad.throttle().is_err());
    }

    #[test]
    fn test_runtime_roundtrips_through_json() {
        let rt = BlkioRuntime {
            group: "/chaosmeta_blkio_abcde".to_string(),
            fallback: "/user.slice".to_string(),
            snapshot: HashMap::from([(42, "/system.slice".to_string())]),
        };
        let v = serde_json::to_value(&rt).unwrap();
        assert_eq!(v["snapshot"]["42"], "/system.slice");
        let back: BlkioRuntime = serde_json::from_value(v).unwrap();
        assert_eq!(back, rt);
    }
}

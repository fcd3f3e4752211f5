//! Memory pressure: fill a share of memory, or all of it (oom).
//!
//! `cache` mode writes a file into a private tmpfs, `ram` mode starts a
//! detached helper (`chaosmetad mem-filler`) that holds anonymous memory.
//! Inside a container only `ram` is possible; the helper joins the
//! container's memory cgroup before it allocates, so the container is
//! charged for it.

use std::path::Path;

use async_trait::async_trait;
use cgroup::Subsystem;
use log::{info, warn};
use nix::sys::signal::Signal;
use osutil::memory::MemInfo;
use osutil::process::{self, flag_value};
use serde::{Deserialize, Serialize};

use crate::target::container_cgroup;
use crate::{args, invalid, CommonInfo, Env, Error, Fault, Result};

pub const MODE_RAM: &str = "ram";
pub const MODE_CACHE: &str = "cache";

/// Name of the hidden helper subcommand.
pub const FILLER_SUBCOMMAND: &str = "mem-filler";
pub const FILLER_UID_FLAG: &str = "--uid";

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemArgs {
    /// Target usage in percent of total memory, in (0,100]
    #[serde(deserialize_with = "args::opt_num")]
    pub percent: Option<u32>,
    /// Absolute amount to fill, such as `512MB`; a bare number is KB
    #[serde(deserialize_with = "args::string")]
    pub bytes: String,
    #[serde(deserialize_with = "args::string")]
    pub mode: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemRuntime {
    pub fill_kb: u64,
    pub fill_dir: Option<String>,
    pub filler_pid: Option<i32>,
}

fn default_mode(info: &CommonInfo, args: &mut MemArgs) {
    if args.mode.is_empty() {
        args.mode = if info.in_container() {
            MODE_RAM.to_string()
        } else {
            MODE_CACHE.to_string()
        };
    }
}

fn validate_args(info: &CommonInfo, args: &MemArgs) -> Result<()> {
    match args.percent {
        Some(p) if p == 0 || p > 100 => {
            return Err(invalid(format!(
                "\"percent\"[{}] must be in (0,100]",
                p
            )))
        }
        Some(_) => {}
        None if args.bytes.is_empty() => {
            return Err(invalid("must provide \"percent\" or \"bytes\""))
        }
        None => {
            let kb = osutil::units::parse_kbytes(&args.bytes)
                .map_err(|e| invalid(format!("\"bytes\" is invalid: {}", e)))?;
            if kb == 0 {
                return Err(invalid("\"bytes\" must be larger than 0KB"));
            }
        }
    }
    match args.mode.as_str() {
        MODE_RAM => Ok(()),
        MODE_CACHE if info.in_container() => {
            Err(invalid("not support \"cache\" mode in container"))
        }
        MODE_CACHE => Ok(()),
        other => Err(invalid(format!("\"mode\"[{}] is not supported", other))),
    }
}

/// Memory totals of the host, or of the container's memory cgroup.
async fn mem_info(info: &CommonInfo, env: &Env) -> Result<MemInfo> {
    if info.in_container() {
        let rel = container_cgroup(info, env, Subsystem::Memory).await?;
        let usage = env.cgroup.memory_usage(&rel)?;
        if usage.is_unlimited() {
            return Err(invalid(format!(
                "container[{}] has no memory limit, use \"bytes\" instead of \"percent\"",
                info.container_id
            )));
        }
        Ok(MemInfo::from_cgroup_bytes(usage.limit, usage.usage))
    } else {
        Ok(MemInfo::read(&env.procfs)?)
    }
}

/// KB to fill. A percent below current usage is an argument error.
pub async fn fill_kbytes(info: &CommonInfo, args: &MemArgs, env: &Env) -> Result<u64> {
    match args.percent {
        Some(p) => {
            let m = mem_info(info, env).await?;
            m.kbytes_to_fill(p).map_err(|e| match e {
                osutil::Error::NoNeedToFill { .. } => invalid(e.to_string()),
                other => Error::Os(other),
            })
        }
        None => Ok(osutil::units::parse_kbytes(&args.bytes)?),
    }
}

pub fn fill_dir(env: &Env, uid: &str) -> String {
    format!("{}{}", env.fill_dir_prefix, uid)
}

/// `exec <exe> mem-filler --uid <uid> --kbytes <kb> --timeout <secs>
/// [--cgroup <dir>]`. With a cgroup the helper joins it before allocating.
pub fn filler_command(
    exe: &Path,
    uid: &str,
    kb: u64,
    timeout_secs: u64,
    cgroup: Option<&Path>,
) -> String {
    let mut cmd = format!(
        "exec {} {} {} {} --kbytes {} --timeout {}",
        osutil::cmd::shell_quote(&exe.to_string_lossy()),
        FILLER_SUBCOMMAND,
        FILLER_UID_FLAG,
        osutil::cmd::shell_quote(uid),
        kb,
        timeout_secs
    );
    if let Some(dir) = cgroup {
        cmd.push_str(" --cgroup ");
        cmd.push_str(&osutil::cmd::shell_quote(&dir.to_string_lossy()));
    }
    cmd
}

/// True if `argv` is the filler of experiment `uid` and of no other.
pub fn is_filler_of(argv: &[String], uid: &str) -> bool {
    argv.iter().any(|a| a == FILLER_SUBCOMMAND) && flag_value(argv, FILLER_UID_FLAG) == Some(uid)
}

async fn inject_fill(
    info: &CommonInfo,
    args: &MemArgs,
    rt: &mut MemRuntime,
    env: &Env,
) -> Result<()> {
    let kb = fill_kbytes(info, args, env).await?;
    rt.fill_kb = kb;
    info!(
        "injector: [{}] filling {}KB in {} mode",
        info.uid, kb, args.mode
    );

    if args.mode == MODE_CACHE {
        let dir = fill_dir(env, &info.uid);
        rt.fill_dir = Some(dir.clone());
        if let Err(e) = osutil::memory::fill_tmpfs(Path::new(&dir), kb) {
            if let Err(undo) = osutil::memory::undo_tmpfs(Path::new(&dir)).await {
                warn!("injector: [{}] undo tmpfs {} error: {}", info.uid, dir, undo);
            }
            rt.fill_dir = None;
            return Err(e.into());
        }
        return Ok(());
    }

    // resolved before the helper exists: it must join before allocating
    let group = if info.in_container() {
        let rel = container_cgroup(info, env, Subsystem::Memory).await?;
        Some(env.cgroup.subsystem_path(Subsystem::Memory, &rel))
    } else {
        None
    };
    let timeout = info.timeout_secs()?.unwrap_or(0);
    let cmd = filler_command(&env.exe, &info.uid, kb, timeout, group.as_deref());
    let pid = osutil::cmd::spawn_detached(&cmd)? as i32;
    rt.filler_pid = Some(pid);

    if let Some(path) = group {
        // the helper joins on its own; writing the pid again confirms it
        if let Err(e) = env.cgroup.move_pid(pid, &path) {
            if let Err(k) = process::send_signal(pid, Signal::SIGKILL) {
                warn!("injector: [{}] kill filler {} error: {}", info.uid, pid, k);
            }
            rt.filler_pid = None;
            return Err(e.into());
        }
    }
    Ok(())
}

async fn recover_fill(
    info: &CommonInfo,
    args: &MemArgs,
    rt: &mut MemRuntime,
    env: &Env,
) -> Result<()> {
    if let Some(dir) = rt.fill_dir.clone() {
        osutil::memory::undo_tmpfs(Path::new(&dir)).await?;
        rt.fill_dir = None;
    }
    if args.mode != MODE_RAM {
        return Ok(());
    }
    // also catches a filler whose pid was never recorded
    let uid = info.uid.as_str();
    let fillers = env.procfs.pids_where(|argv| is_filler_of(argv, uid))?;
    let killed = process::kill_pids(&fillers, Signal::SIGKILL)?;
    if !killed.is_empty() {
        info!("injector: [{}] killed fillers {:?}", info.uid, killed);
    }
    rt.filler_pid = None;
    Ok(())
}

#[derive(Default)]
pub struct MemFill;

#[async_trait]
impl Fault for MemFill {
    const TARGET: &'static str = "mem";
    const FAULT: &'static str = "fill";
    type Args = MemArgs;
    type Runtime = MemRuntime;

    fn set_default(&self, info: &CommonInfo, args: &mut MemArgs) {
        default_mode(info, args);
    }

    async fn validate(&self, info: &CommonInfo, args: &MemArgs, env: &Env) -> Result<()> {
        validate_args(info, args)?;
        fill_kbytes(info, args, env).await.map(|_| ())
    }

    async fn inject(
        &self,
        info: &CommonInfo,
        args: &MemArgs,
        rt: &mut MemRuntime,
        env: &Env,
    ) -> Result<()> {
        inject_fill(info, args, rt, env).await
    }

    async fn recover(
        &self,
        info: &CommonInfo,
        args: &MemArgs,
        rt: &mut MemRuntime,
        env: &Env,
    ) -> Result<()> {
        recover_fill(info, args, rt, env).await
    }
}

/// Fill to 100%.
#[derive(Default)]
pub struct MemOom;

#[async_trait]
impl Fault for MemOom {
    const TARGET: &'static str = "mem";
    const FAULT: &'static str = "oom";
    type Args = MemArgs;
    type Runtime = MemRuntime;

    fn set_default(&self, info: &CommonInfo, args: &mut MemArgs) {
        default_mode(info, args);
    }

    async fn validate(&self, info: &CommonInfo, args: &MemArgs, env: &Env) -> Result<()> {
        if !args.bytes.is_empty() {
            return Err(invalid("not support \"bytes\" args in oom"));
        }
        if args.percent.is_some_and(|p| p != 100) {
            return Err(invalid("not support \"percent\" args in oom"));
        }
        let full = oom_args(args);
        validate_args(info, &full)?;
        fill_kbytes(info, &full, env).await.map(|_| ())
    }

    async fn inject(
        &self,
        info: &CommonInfo,
        args: &MemArgs,
        rt: &mut MemRuntime,
        env: &Env,
    ) -> Result<()> {
        inject_fill(info, &oom_args(args), rt, env).await
    }

    async fn recover(
        &self,
        info: &CommonInfo,
        args: &MemArgs,
        rt: &mut MemRuntime,
        env: &Env,
    ) -> Result<()> {
        recover_fill(info, args, rt, env).await
    }
}

fn oom_args(args: &MemArgs) -> MemArgs {
    MemArgs {
        percent: Some(100),
        bytes: String::new(),
        mode: args.mode.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host() -> CommonInfo {
        CommonInfo {
            uid: "mem-1".to_string(),
            ..Default::default()
        }
    }

    fn container() -> CommonInfo {
        CommonInfo {
            uid: "mem-2".to_string(),
            container_id: "abc".to_string(),
            container_runtime: "docker".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_default_mode() {
        let mut a = MemArgs::default();
        default_mode(&host(), &mut a);
        assert_eq!(a.mode, MODE_CACHE);
        let mut a = MemArgs::default();
        default_mode(&container(), &mut a);
        assert_eq!(a.mode, MODE_RAM);
    }

    #[test]
    fn test_validate_args() {
        let ok = MemArgs {
            percent: Some(80),
            mode: MODE_CACHE.to_string(),
            ..Default::default()
        };
        validate_args(&host(), &ok).unwrap();
        assert!(validate_args(&container(), &ok).is_err());

        let zero = MemArgs {
            percent: Some(0),
            ..ok.clone()
        };
        assert!(validate_args(&host(), &zero).is_err());
        let over = MemArgs {
            percent: Some(101),
            ..ok.clone()
        };
        assert!(validate_args(&host(), &over).is_err());

        let bytes = MemArgs {
            percent: None,
            bytes: "512MB".to_string(),
            mode: MODE_RAM.to_string(),
        };
        validate_args(&host(), &bytes).unwrap();
        let bad = MemArgs {
            bytes: "512XB".to_string(),
            ..bytes.clone()
        };
        assert!(validate_args(&host(), &bad).is_err());
        let none = MemArgs {
            bytes: String::new(),
            ..bytes
        };
        assert!(validate_args(&host(), &none).is_err());

        let mode = MemArgs {
            mode: "disk".to_string(),
            ..ok
        };
        assert!(validate_args(&host(), &mode).is_err());
    }

    #[test]
    fn test_filler_command() {
        let exe = Path::new("/usr/bin/chaosmetad");
        assert_eq!(
            filler_command(exe, "u-123", 2048, 60, None),
            "exec /usr/bin/chaosmetad mem-filler --uid u-123 --kbytes 2048 --timeout 60"
        );
        assert_eq!(
            filler_command(
                exe,
                "u-123",
                2048,
                0,
                Some(Path::new("/sys/fs/cgroup/memory/docker/c1"))
            ),
            "exec /usr/bin/chaosmetad mem-filler --uid u-123 --kbytes 2048 --timeout 0 \
             --cgroup /sys/fs/cgroup/memory/docker/c1"
        );
    }

    fn argv(cmd: &str) -> Vec<String> {
        cmd.split_whitespace().map(String::from).collect()
    }

    #[test]
    fn test_is_filler_of_matches_exact_uid() {
        let a = argv("/usr/bin/chaosmetad mem-filler --uid exp-12 --kbytes 10 --timeout 0");
        assert!(is_filler_of(&a, "exp-12"));
        assert!(!is_filler_of(&a, "exp-1"));
        assert!(!is_filler_of(&a, "exp-123"));
        assert!(!is_filler_of(&argv("sleep --uid exp-12"), "exp-12"));
    }
}

//! CPU pressure: keep a set of cores busy for a share of every period.
//!
//! One detached helper (`chaosmetad cpu-burner`) runs per core, pinned to
//! it. Inside a container the cores come from the container's cpuset and
//! every helper joins the container's cpu cgroup before burning.

use std::path::Path;

use async_trait::async_trait;
use cgroup::cpuset::parse_cpu_list;
use cgroup::Subsystem;
use log::{debug, info, warn};
use nix::sys::signal::Signal;
use osutil::process::{self, flag_value};
use serde::{Deserialize, Serialize};

use crate::target::container_cgroup;
use crate::{args, invalid, CommonInfo, Env, Fault, Result};

/// Name of the hidden helper subcommand.
pub const BURNER_SUBCOMMAND: &str = "cpu-burner";
pub const BURNER_UID_FLAG: &str = "--uid";

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CpuArgs {
    /// Busy share of each core in (0,100]
    #[serde(deserialize_with = "args::opt_num")]
    pub percent: Option<u32>,
    /// Number of cores; unset, 0 or more than available means all
    #[serde(deserialize_with = "args::opt_num")]
    pub count: Option<i32>,
    /// Cores such as `0-2,6`; wins over `count`
    #[serde(deserialize_with = "args::string")]
    pub list: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CpuRuntime {
    pub cores: Vec<usize>,
    pub burner_pids: Vec<i32>,
}

/// Cores the target may run on: the host's root cpuset or the container's.
async fn available_cores(info: &CommonInfo, env: &Env) -> Result<Vec<usize>> {
    let rel = if info.in_container() {
        container_cgroup(info, env, Subsystem::Cpuset).await?
    } else {
        "/".to_string()
    };
    let cores = env.cgroup.cpuset_cpus(&rel)?;
    if cores.is_empty() {
        return Err(invalid(format!("cpuset {} has no available core", rel)));
    }
    Ok(cores)
}

/// Cores to burn. Picks from the front of `available` when counting.
pub fn select_cores(args: &CpuArgs, available: &[usize]) -> Result<Vec<usize>> {
    if !args.list.trim().is_empty() {
        let cores = parse_cpu_list(&args.list)
            .map_err(|e| invalid(format!("\"list\"[{}] is not valid: {}", args.list, e)))?;
        if let Some(c) = cores.iter().find(|c| !available.contains(c)) {
            return Err(invalid(format!("core[{}] is not available", c)));
        }
        return Ok(cores);
    }
    match args.count {
        Some(c) if c < 0 => Err(invalid(format!("\"count\"[{}] can not less than 0", c))),
        Some(c) if c > 0 && (c as usize) < available.len() => Ok(available[..c as usize].to_vec()),
        _ => Ok(available.to_vec()),
    }
}

fn validate_percent(args: &CpuArgs) -> Result<u32> {
    match args.percent {
        Some(p) if p > 0 && p <= 100 => Ok(p),
        Some(p) => Err(invalid(format!("\"percent\"[{}] must be in (0,100]", p))),
        None => Err(invalid("must provide \"percent\"")),
    }
}

/// `exec <exe> cpu-burner --uid <uid> --core <n> --percent <p> --timeout
/// <secs> [--cgroup <dir>]`
pub fn burner_command(
    exe: &Path,
    uid: &str,
    core: usize,
    percent: u32,
    timeout_secs: u64,
    cgroup: Option<&Path>,
) -> String {
    let mut cmd = format!(
        "exec {} {} {} {} --core {} --percent {} --timeout {}",
        osutil::cmd::shell_quote(&exe.to_string_lossy()),
        BURNER_SUBCOMMAND,
        BURNER_UID_FLAG,
        osutil::cmd::shell_quote(uid),
        core,
        percent,
        timeout_secs
    );
    if let Some(dir) = cgroup {
        cmd.push_str(" --cgroup ");
        cmd.push_str(&osutil::cmd::shell_quote(&dir.to_string_lossy()));
    }
    cmd
}

pub fn is_burner_of(argv: &[String], uid: &str) -> bool {
    argv.iter().any(|a| a == BURNER_SUBCOMMAND) && flag_value(argv, BURNER_UID_FLAG) == Some(uid)
}

/// SIGKILL every burner of `uid`, recorded or not.
fn kill_burners(uid: &str, env: &Env) -> Result<Vec<i32>> {
    let pids = env.procfs.pids_where(|argv| is_burner_of(argv, uid))?;
    Ok(process::kill_pids(&pids, Signal::SIGKILL)?)
}

async fn start_burners(
    info: &CommonInfo,
    percent: u32,
    rt: &mut CpuRuntime,
    env: &Env,
) -> Result<()> {
    let group = if info.in_container() {
        let rel = container_cgroup(info, env, Subsystem::Cpu).await?;
        Some(env.cgroup.subsystem_path(Subsystem::Cpu, &rel))
    } else {
        None
    };
    let timeout = info.timeout_secs()?.unwrap_or(0);
    for &core in &rt.cores {
        let cmd = burner_command(&env.exe, &info.uid, core, percent, timeout, group.as_deref());
        let pid = osutil::cmd::spawn_detached(&cmd)? as i32;
        rt.burner_pids.push(pid);
        if let Some(path) = &group {
            env.cgroup.move_pid(pid, path)?;
        }
        debug!("injector: [{}] burner {} on core {}", info.uid, pid, core);
    }
    Ok(())
}

#[derive(Default)]
pub struct CpuBurn;

#[async_trait]
impl Fault for CpuBurn {
    const TARGET: &'static str = "cpu";
    const FAULT: &'static str = "burn";
    type Args = CpuArgs;
    type Runtime = CpuRuntime;

    async fn validate(&self, info: &CommonInfo, args: &CpuArgs, env: &Env) -> Result<()> {
        validate_percent(args)?;
        let available = available_cores(info, env).await?;
        select_cores(args, &available).map(|_| ())
    }

    async fn inject(
        &self,
        info: &CommonInfo,
        args: &CpuArgs,
        rt: &mut CpuRuntime,
        env: &Env,
    ) -> Result<()> {
        let percent = validate_percent(args)?;
        let available = available_cores(info, env).await?;
        rt.cores = select_cores(args, &available)?;
        info!(
            "injector: [{}] burning {}% of cores {:?}",
            info.uid, percent, rt.cores
        );
        if let Err(e) = start_burners(info, percent, rt, env).await {
            // a burner that has not exec'd yet only matches by pid
            let undo = process::kill_pids(&rt.burner_pids, Signal::SIGKILL)
                .map_err(Into::into)
                .and_then(|_| kill_burners(&info.uid, env));
            match undo {
                Ok(_) => rt.burner_pids.clear(),
                Err(k) => warn!("injector: [{}] undo burners error: {}", info.uid, k),
            }
            return Err(e);
        }
        Ok(())
    }

    async fn recover(
        &self,
        info: &CommonInfo,
        _args: &CpuArgs,
        rt: &mut CpuRuntime,
        env: &Env,
    ) -> Result<()> {
        let killed = kill_burners(&info.uid, env)?;
        if !killed.is_empty() {
            info!("injector: [{}] killed burners {:?}", info.uid, killed);
        }
        rt.burner_pids.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(s: &str) -> Vec<String> {
        s.split(' ').map(String::from).collect()
    }

    #[test]
    fn test_select_cores() {
        let avail = [0, 1, 2, 3];
        let mut a = CpuArgs::default();
        assert_eq!(select_cores(&a, &avail).unwrap(), vec![0, 1, 2, 3]);
        a.count = Some(2);
        assert_eq!(select_cores(&a, &avail).unwrap(), vec![0, 1]);
        a.count = Some(9);
        assert_eq!(select_cores(&a, &avail).unwrap().len(), 4);
        a.count = Some(-1);
        assert!(select_cores(&a, &avail).is_err());

        // list wins over count
        a.list = "3,1-2".to_string();
        assert_eq!(select_cores(&a, &avail).unwrap(), vec![3, 1, 2]);
        a.list = "2-5".to_string();
        let err = select_cores(&a, &avail).unwrap_err();
        assert_eq!(err.to_string(), "core[4] is not available");
        a.list = "x".to_string();
        assert!(select_cores(&a, &avail).is_err());
    }

    #[test]
    fn test_validate_percent() {
        let mut a = CpuArgs::default();
        assert!(validate_percent(&a).is_err());
        a.percent = Some(0);
        assert!(validate_percent(&a).is_err());
        a.percent = Some(101);
        assert!(validate_percent(&a).is_err());
        a.percent = Some(100);
        assert_eq!(validate_percent(&a).unwrap(), 100);
    }

    #[test]
    fn test_burner_command_and_match() {
        let exe = Path::new("/usr/bin/chaosmetad");
        assert_eq!(
            burner_command(exe, "cb-1", 3, 60, 0, None),
            "exec /usr/bin/chaosmetad cpu-burner --uid cb-1 --core 3 --percent 60 --timeout 0"
        );
        assert!(burner_command(exe, "cb-1", 3, 60, 0, Some(Path::new("/sys/fs/cgroup/cpu/d/c1")))
            .ends_with(" --cgroup /sys/fs/cgroup/cpu/d/c1"));

        let a = argv("/usr/bin/chaosmetad cpu-burner --uid cb-1 --core 3 --percent 60");
        assert!(is_burner_of(&a, "cb-1"));
        assert!(!is_burner_of(&a, "cb-12"));
        assert!(!is_burner_of(&argv("/usr/bin/chaosmetad mem-filler --uid cb-1"), "cb-1"));
    }
}

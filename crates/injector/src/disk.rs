//! Disk space pressure: fill the filesystem holding a directory with one
//! preallocated file per experiment.
//!
//! Inside a container the directory is resolved through the container's
//! root (`/proc/<pid>/root`), so the file lands in its mount namespace.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use log::info;
use osutil::space::{self, DiskUsage};
use serde::{Deserialize, Serialize};

use crate::target::container_client;
use crate::{args, invalid, CommonInfo, Env, Error, Fault, Result};

pub const DEFAULT_DIR: &str = "/tmp";
pub const FILL_FILE_PREFIX: &str = "chaosmeta_fill";

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskArgs {
    /// Target usage of the filesystem in (0,100]
    #[serde(deserialize_with = "args::opt_num")]
    pub percent: Option<u32>,
    /// Amount to add, such as `10GB`; a bare number is KB
    #[serde(deserialize_with = "args::string")]
    pub bytes: String,
    #[serde(deserialize_with = "args::string")]
    pub dir: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskRuntime {
    pub fill_kb: u64,
    /// Host path of the fill file
    pub fill_file: Option<String>,
}

pub fn fill_file_name(uid: &str) -> String {
    format!("{}{}.dat", FILL_FILE_PREFIX, uid)
}

/// Where `dir` is seen from this host.
async fn host_dir(info: &CommonInfo, args: &DiskArgs, env: &Env) -> Result<PathBuf> {
    if args.dir.trim().is_empty() {
        return Err(invalid("\"dir\" is empty"));
    }
    let dir = if info.in_container() {
        if !Path::new(&args.dir).is_absolute() {
            return Err(invalid("\"dir\" must provide absolute path"));
        }
        let pid = container_client(info, env)
            .await?
            .get_pid_by_id(&info.container_id)
            .await?;
        env.procfs
            .root()
            .join(pid.to_string())
            .join("root")
            .join(args.dir.trim_start_matches('/'))
    } else {
        PathBuf::from(&args.dir)
    };
    if !dir.is_dir() {
        return Err(invalid(format!("\"dir\"[{}] is not a directory", args.dir)));
    }
    Ok(dir)
}

fn fill_kbytes(args: &DiskArgs, dir: &Path) -> Result<u64> {
    let kb = match args.percent {
        Some(p) if p == 0 || p > 100 => {
            return Err(invalid(format!("\"percent\"[{}] must be in (0,100]", p)))
        }
        Some(p) => DiskUsage::of(dir)?.kbytes_for_percent(p),
        None if args.bytes.is_empty() => {
            return Err(invalid("must provide \"percent\" or \"bytes\""))
        }
        None => osutil::units::parse_kbytes(&args.bytes),
    };
    kb.and_then(|kb| DiskUsage::of(dir)?.fit(kb)).map_err(|e| match e {
        osutil::Error::InvalidValue { .. } | osutil::Error::NoSpace { .. } => {
            invalid(format!("calculate fill bytes error: {}", e))
        }
        other => Error::Os(other),
    })
}

#[derive(Default)]
pub struct DiskFill;

#[async_trait]
impl Fault for DiskFill {
    const TARGET: &'static str = "disk";
    const FAULT: &'static str = "fill";
    type Args = DiskArgs;
    type Runtime = DiskRuntime;

    fn set_default(&self, info: &CommonInfo, args: &mut DiskArgs) {
        if args.dir.is_empty() {
            args.dir = DEFAULT_DIR.to_string();
        }
        // a later recover may run from another working directory
        if !info.in_container() && Path::new(&args.dir).is_relative() {
            if let Ok(cwd) = std::env::current_dir() {
                args.dir = cwd.join(&args.dir).to_string_lossy().into_owned();
            }
        }
    }

    async fn validate(&self, info: &CommonInfo, args: &DiskArgs, env: &Env) -> Result<()> {
        let dir = host_dir(info, args, env).await?;
        fill_kbytes(args, &dir).map(|_| ())
    }

    async fn inject(
        &self,
        info: &CommonInfo,
        args: &DiskArgs,
        rt: &mut DiskRuntime,
        env: &Env,
    ) -> Result<()> {
        let dir = host_dir(info, args, env).await?;
        let kb = fill_kbytes(args, &dir)?;
        let file = dir.join(fill_file_name(&info.uid));
        info!("injector: [{}] filling {}KB at {}", info.uid, kb, file.display());
        rt.fill_kb = kb;
        rt.fill_file = Some(file.to_string_lossy().into_owned());
        if let Err(e) = space::allocate_file(&file, kb) {
            rt.fill_file = None;
            return Err(e.into());
        }
        Ok(())
    }

    async fn recover(
        &self,
        info: &CommonInfo,
        _args: &DiskArgs,
        rt: &mut DiskRuntime,
        _env: &Env,
    ) -> Result<()> {
        if let Some(file) = rt.fill_file.clone() {
            if space::remove_file(Path::new(&file))? {
                info!("injector: [{}] removed {}", info.uid, file);
            }
            rt.fill_file = None;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fill_file_name() {
        assert_eq!(fill_file_name("df-1"), "chaosmeta_filldf-1.dat");
    }

    #[test]
    fn test_set_default_dir() {
        let mut a = DiskArgs::default();
        DiskFill.set_default(&CommonInfo::default(), &mut a);
        assert_eq!(a.dir, DEFAULT_DIR);

        let mut rel = DiskArgs {
            dir: "data".to_string(),
            ..Default::default()
        };
        DiskFill.set_default(&CommonInfo::default(), &mut rel);
        assert!(Path::new(&rel.dir).is_absolute());
        assert!(rel.dir.ends_with("/data"));

        let c = CommonInfo {
            container_id: "c1".to_string(),
            container_runtime: "docker".to_string(),
            ..Default::default()
        };
        let mut in_c = DiskArgs {
            dir: "data".to_string(),
            ..Default::default()
        };
        DiskFill.set_default(&c, &mut in_c);
        assert_eq!(in_c.dir, "data");
    }

    #[test]
    fn test_fill_kbytes_args() {
        let tmp = tempfile::tempdir().unwrap();
        let by = |b: &str| DiskArgs {
            bytes: b.to_string(),
            ..Default::default()
        };
        assert_eq!(fill_kbytes(&by("64"), tmp.path()).unwrap(), 64);
        assert_eq!(fill_kbytes(&by("1MB"), tmp.path()).unwrap(), 1024);
        assert!(matches!(fill_kbytes(&by(""), tmp.path()), Err(Error::InvalidArgs(_))));
        assert!(matches!(fill_kbytes(&by("0"), tmp.path()), Err(Error::InvalidArgs(_))));
        assert!(matches!(
            fill_kbytes(&by("1000000TB"), tmp.path()),
            Err(Error::InvalidArgs(m)) if m.contains("space not enough")
        ));

        let pct = |p: u32| DiskArgs {
            percent: Some(p),
            ..Default::default()
        };
        assert!(matches!(fill_kbytes(&pct(0), tmp.path()), Err(Error::InvalidArgs(_))));
        assert!(matches!(fill_kbytes(&pct(101), tmp.path()), Err(Error::InvalidArgs(_))));
    }
}

use std::path::{Path, PathBuf};
use std::process;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chaosmetad::runner::{self, Config, InjectRequest, Runner, EXIT_OK, EXIT_UNKNOWN};
use chaosmetad::store::{self, Filter};
use cgroup::{Cgroup, RealFs};
use clap::{Args, Parser, Subcommand};
use injector::{Env, Registry, Status};
use log::{debug, info, warn};
use osutil::process::ProcFs;
use serde_json::{json, Map, Value};

/// Chaos fault-injection agent
#[derive(Debug, Parser)]
#[command(name = "chaosmetad")]
struct Cli {
    /// Directory holding experiment records
    #[arg(long, global = true, default_value = store::DEFAULT_DIR)]
    data_dir: PathBuf,

    /// Verbose debug output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Inject a fault; prints the experiment uid
    Inject(InjectCmd),
    /// Undo an experiment
    Recover {
        uid: String,
    },
    /// Show experiment records
    Query(QueryCmd),
    /// List targets, or the faults of one target
    List {
        target: Option<String>,
    },
    #[command(name = "mem-filler", hide = true)]
    MemFiller(MemFillerCmd),
    #[command(name = "cpu-burner", hide = true)]
    CpuBurner(CpuBurnerCmd),
}

#[derive(Debug, Args)]
struct InjectCmd {
    target: String,
    fault: String,

    /// Recover automatically after this long, e.g. `30s`, `5m`
    #[arg(short, long, default_value = "")]
    timeout: String,

    #[arg(long, default_value = "")]
    creator: String,

    /// Experiment uid; generated when empty
    #[arg(long, default_value = "")]
    uid: String,

    /// docker, containerd or pouch
    #[arg(short = 'r', long, default_value = "")]
    container_runtime: String,

    #[arg(short = 'c', long, default_value = "")]
    container_id: String,

    /// Fault argument as key=value; repeatable
    #[arg(short = 'a', long = "arg", value_parser = parse_kv)]
    arg: Vec<(String, String)>,

    /// Fault arguments as a JSON object
    #[arg(long)]
    args: Option<String>,
}

#[derive(Debug, Args)]
struct QueryCmd {
    #[arg(long, default_value = "")]
    uid: String,
    #[arg(long)]
    status: Option<String>,
    #[arg(long, default_value = "")]
    target: String,
    #[arg(long, default_value = "")]
    fault: String,
    #[arg(long, default_value = "")]
    creator: String,
    #[arg(long, default_value = "")]
    container_runtime: String,
    #[arg(long, default_value = "")]
    container_id: String,
    #[arg(long, default_value = "0")]
    offset: usize,
    #[arg(long, default_value = "0")]
    limit: usize,
    /// Print JSON instead of a table
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct MemFillerCmd {
    #[arg(long)]
    uid: String,
    #[arg(long)]
    kbytes: u64,
    /// Seconds to hold the memory; 0 holds until killed
    #[arg(long, default_value = "0")]
    timeout: u64,
    /// Memory cgroup directory to join before allocating
    #[arg(long)]
    cgroup: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct CpuBurnerCmd {
    #[arg(long)]
    uid: String,
    #[arg(long)]
    core: usize,
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..=100))]
    percent: u32,
    /// Seconds to burn; 0 burns until killed
    #[arg(long, default_value = "0")]
    timeout: u64,
    /// cpu cgroup directory to join before burning
    #[arg(long)]
    cgroup: Option<PathBuf>,
}

fn parse_kv(s: &str) -> std::result::Result<(String, String), String> {
    match s.split_once('=') {
        Some((k, v)) if !k.trim().is_empty() => Ok((k.trim().to_string(), v.to_string())),
        _ => Err(format!("{:?} is not in key=value form", s)),
    }
}

fn bad_args(msg: impl Into<String>) -> runner::Error {
    runner::Error::BadArgs(injector::Error::InvalidArgs(msg.into()))
}

/// `--args` JSON overlaid with each `-a key=value`.
fn fault_args(cmd: &InjectCmd) -> std::result::Result<Value, runner::Error> {
    let mut map = match &cmd.args {
        Some(raw) => match serde_json::from_str::<Value>(raw) {
            Ok(Value::Object(m)) => m,
            Ok(_) => return Err(bad_args("--args must be a JSON object")),
            Err(e) => return Err(bad_args(format!("--args is not valid JSON: {}", e))),
        },
        None => Map::new(),
    };
    for (k, v) in &cmd.arg {
        map.insert(k.clone(), Value::String(v.clone()));
    }
    Ok(Value::Object(map))
}

fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

fn run(cli: Cli, rt: &tokio::runtime::Runtime) -> Result<()> {
    match cli.command {
        Command::Inject(cmd) => {
            let req = InjectRequest {
                args: fault_args(&cmd)?,
                target: cmd.target,
                fault: cmd.fault,
                uid: cmd.uid,
                creator: cmd.creator,
                timeout: cmd.timeout,
                container_runtime: cmd.container_runtime,
                container_id: cmd.container_id,
            };
            let runner = open_runner(&cli.data_dir)?;
            let uid = rt.block_on(runner.process_inject(&req))?;
            println!("{}", uid);
        }
        Command::Recover { uid } => {
            let runner = open_runner(&cli.data_dir)?;
            rt.block_on(runner.process_recover(&uid))?;
            println!("recover {} success", uid);
        }
        Command::Query(q) => {
            let status = match q.status.as_deref() {
                None | Some("") => None,
                Some(s) => Some(s.parse::<Status>().map_err(runner::Error::BadArgs)?),
            };
            let filter = Filter {
                uid: q.uid,
                status,
                target: q.target,
                fault: q.fault,
                creator: q.creator,
                container_runtime: q.container_runtime,
                container_id: q.container_id,
                offset: q.offset,
                limit: q.limit,
            };
            let runner = open_runner(&cli.data_dir)?;
            let (recs, total) = runner.process_query(&filter)?;
            if q.json {
                let out = json!({"total": total, "experiments": recs});
                println!("{}", serde_json::to_string_pretty(&out)?);
            } else {
                println!(
                    "{:<20} {:<10} {:<10} {:<10} {:<20} {:<10} {}",
                    "UID", "TARGET", "FAULT", "STATUS", "CREATE_TIME", "CREATOR", "ERROR"
                );
                for r in &recs {
                    println!(
                        "{:<20} {:<10} {:<10} {:<10} {:<20} {:<10} {}",
                        r.uid, r.target, r.fault, r.status, r.create_time, r.creator, r.error
                    );
                }
                println!("total: {}", total);
            }
        }
        Command::List { target } => {
            let reg = Registry::builtin();
            match target {
                Some(t) => {
                    let faults = reg.faults(&t);
                    if faults.is_empty() {
                        return Err(bad_args(format!("not support target[{}]", t)).into());
                    }
                    for f in faults {
                        println!("{}", f);
                    }
                }
                None => {
                    for t in reg.targets() {
                        println!("{}", t);
                    }
                }
            }
        }
        Command::MemFiller(cmd) => mem_filler(&cmd)?,
        Command::CpuBurner(cmd) => cpu_burner(&cmd)?,
    }
    Ok(())
}

fn open_runner(data_dir: &Path) -> Result<Runner> {
    let cfg = Config {
        data_dir: data_dir.to_path_buf(),
        ..Default::default()
    };
    Ok(Runner::new(cfg, Env::default())?)
}

/// Holds `kbytes` of touched anonymous memory, then exits. With a cgroup,
/// joins it first so the pages are charged there.
fn mem_filler(cmd: &MemFillerCmd) -> Result<()> {
    let me = process::id() as i32;
    if let Some(dir) = &cmd.cgroup {
        Cgroup::<RealFs>::default()
            .move_pid(me, dir)
            .with_context(|| format!("mem-filler: [{}] join {}", cmd.uid, dir.display()))?;
        debug!("mem-filler: [{}] joined {}", cmd.uid, dir.display());
    }
    if let Err(e) = ProcFs::default().set_oom_score_adj(me, -999) {
        warn!("mem-filler: [{}] set oom_score_adj: {}", cmd.uid, e);
    }
    let buf = osutil::memory::hold_memory(cmd.kbytes)
        .with_context(|| format!("mem-filler: [{}] hold {}KB", cmd.uid, cmd.kbytes))?;
    info!(
        "mem-filler: [{}] holding {}KB in pid {}",
        cmd.uid, cmd.kbytes, me
    );
    if cmd.timeout == 0 {
        loop {
            thread::sleep(Duration::from_secs(3600));
            std::hint::black_box(&buf);
        }
    }
    thread::sleep(Duration::from_secs(cmd.timeout));
    std::hint::black_box(&buf);
    debug!("mem-filler: [{}] timeout reached", cmd.uid);
    Ok(())
}

/// Pins itself to one core and keeps it `percent` busy.
fn cpu_burner(cmd: &CpuBurnerCmd) -> Result<()> {
    let me = process::id() as i32;
    if let Some(dir) = &cmd.cgroup {
        Cgroup::<RealFs>::default()
            .move_pid(me, dir)
            .with_context(|| format!("cpu-burner: [{}] join {}", cmd.uid, dir.display()))?;
    }
    osutil::cpu::pin_to_core(cmd.core)
        .with_context(|| format!("cpu-burner: [{}] pin to core {}", cmd.uid, cmd.core))?;
    info!(
        "cpu-burner: [{}] burning {}% of core {} in pid {}",
        cmd.uid, cmd.percent, cmd.core, me
    );
    let deadline = (cmd.timeout > 0).then(|| Instant::now() + Duration::from_secs(cmd.timeout));
    osutil::cpu::burn(cmd.percent, deadline);
    debug!("cpu-burner: [{}] timeout reached", cmd.uid);
    Ok(())
}

fn exit_code(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<runner::Error>() {
        Some(e) => e.exit_code(),
        None => EXIT_UNKNOWN,
    }
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    debug!("chaosmetad: {:?}", cli);

    let code = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("build tokio runtime")
        .and_then(|rt| run(cli, &rt))
    {
        Ok(()) => EXIT_OK,
        Err(e) => {
            eprintln!("[error] {:#}", e);
            exit_code(&e)
        }
    };
    process::exit(code);
}

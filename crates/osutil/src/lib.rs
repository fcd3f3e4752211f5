//! OS primitives shared by the injectors: process lookup and signals, bash
//! execution, tmpfs and memory helpers, cpu burning, filesystem space,
//! block devices and unit parsing.

pub mod cmd;
pub mod cpu;
pub mod disk;
pub mod memory;
pub mod process;
pub mod space;
pub mod units;

use std::io;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid value {value:?}: {reason}")]
    InvalidValue { value: String, reason: String },
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("spawn `{cmd}` error: {source}")]
    Spawn {
        cmd: String,
        #[source]
        source: io::Error,
    },
    #[error("`{cmd}` exited with code {code}: {stderr}")]
    CommandFailed {
        cmd: String,
        code: i32,
        stderr: String,
    },
    #[error("process[{pid}] is not exist")]
    NoSuchProcess { pid: i32 },
    #[error("send signal {signal} to process[{pid}] error: {source}")]
    Signal {
        pid: i32,
        signal: nix::sys::signal::Signal,
        #[source]
        source: nix::Error,
    },
    #[error("dev[{0}] is not exist")]
    NoSuchDevice(String),
    #[error("{op} {path} error: {source}")]
    Mount {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: nix::Error,
    },
    #[error("current mem usage is {used:.2}%, no need to fill any mem")]
    NoNeedToFill { used: f64 },
    #[error("space not enough, fill: {fill_kb}KB, free: {free_kb}KB")]
    NoSpace { fill_kb: u64, free_kb: u64 },
}

impl Error {
    pub(crate) fn invalid(value: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::InvalidValue {
            value: value.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Login name of the invoking user, falling back to the numeric uid.
pub fn current_user() -> String {
    match std::env::var("USER") {
        Ok(u) if !u.is_empty() => u,
        _ => {
            let uid = nix::unistd::getuid();
            match nix::unistd::User::from_uid(uid) {
                Ok(Some(u)) => u.name,
                _ => uid.to_string(),
            }
        }
    }
}

//! Experiment records on local disk, one JSON file per uid.
//!
//! Records are the only hand-off between an `inject` and a later
//! `recover`, which may run in a detached process moments afterwards, so
//! every write lands in a temporary sibling, is fsynced and then renamed
//! into place. The directory is fsynced after the rename so the new entry
//! survives a crash too.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::Local;
use injector::{CommonInfo, Status};
use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
pub const DEFAULT_DIR: &str = "/var/lib/chaosmetad/experiments";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("experiment[{uid}] is not exist")]
    NotFound { uid: String },
    #[error("experiment[{uid}] already exists")]
    Exists { uid: String },
    #[error("uid[{uid}] is invalid")]
    InvalidUid { uid: String },
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("decode {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("encode record: {0}")]
    Encode(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Experiment {
    pub uid: String,
    pub creator: String,
    pub status: Status,
    pub error: String,
    pub timeout: String,
    pub target: String,
    pub fault: String,
    pub container_id: String,
    pub container_runtime: String,
    pub args: Value,
    pub runtime: Value,
    pub create_time: String,
    pub update_time: String,
}

impl Experiment {
    pub fn from_info(info: &CommonInfo, args: Value, runtime: Value) -> Self {
        Self {
            uid: info.uid.clone(),
            creator: info.creator.clone(),
            status: info.status,
            error: info.error.clone(),
            timeout: info.timeout.clone(),
            target: info.target.clone(),
            fault: info.fault.clone(),
            container_id: info.container_id.clone(),
            container_runtime: info.container_runtime.clone(),
            args,
            runtime,
            ..Default::default()
        }
    }

    pub fn info(&self) -> CommonInfo {
        CommonInfo {
            uid: self.uid.clone(),
            creator: self.creator.clone(),
            status: self.status,
            error: self.error.clone(),
            timeout: self.timeout.clone(),
            target: self.target.clone(),
            fault: self.fault.clone(),
            container_id: self.container_id.clone(),
            container_runtime: self.container_runtime.clone(),
        }
    }
}

/// Query conditions; empty fields match everything.
#[derive(Clone, Debug, Default)]
pub struct Filter {
    pub uid: String,
    pub status: Option<Status>,
    pub target: String,
    pub fault: String,
    pub creator: String,
    pub container_runtime: String,
    pub container_id: String,
    pub offset: usize,
    /// 0 means no limit
    pub limit: usize,
}

fn field_matches(want: &str, have: &str) -> bool {
    want.is_empty() || want == have
}

impl Filter {
    pub fn matches(&self, e: &Experiment) -> bool {
        field_matches(&self.uid, &e.uid)
            && self.status.map_or(true, |s| s == e.status)
            && field_matches(&self.target, &e.target)
            && field_matches(&self.fault, &e.fault)
            && field_matches(&self.creator, &e.creator)
            && field_matches(&self.container_runtime, &e.container_runtime)
            && field_matches(&self.container_id, &e.container_id)
    }
}

fn now() -> String {
    Local::now().format(TIME_FORMAT).to_string()
}

#[derive(Clone, Debug)]
pub struct Store {
    dir: PathBuf,
}

impl Store {
    /// Open the store, creating its directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| Error::Io {
            path: dir.clone(),
            source: e,
        })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, uid: &str) -> Result<PathBuf> {
        if !injector::is_valid_uid(uid) {
            return Err(Error::InvalidUid {
                uid: uid.to_string(),
            });
        }
        Ok(self.dir.join(format!("{}.json", uid)))
    }

    fn sync_dir(&self) -> Result<()> {
        File::open(&self.dir)
            .and_then(|d| d.sync_all())
            .map_err(|source| Error::Io {
                path: self.dir.clone(),
                source,
            })
    }

    fn write_tmp(&self, e: &Experiment) -> Result<PathBuf> {
        let tmp = self
            .dir
            .join(format!(".{}.{}.tmp", e.uid, Uuid::new_v4().simple()));
        let data = serde_json::to_vec_pretty(e)?;
        let io_err = |source| Error::Io {
            path: tmp.clone(),
            source,
        };
        let mut f = File::create(&tmp).map_err(io_err)?;
        f.write_all(&data).map_err(io_err)?;
        f.sync_all().map_err(io_err)?;
        Ok(tmp)
    }

    /// Add a new record. Fails if the uid is taken.
    pub fn insert(&self, e: &mut Experiment) -> Result<()> {
        let path = self.path(&e.uid)?;
        let t = now();
        e.create_time = t.clone();
        e.update_time = t;
        let tmp = self.write_tmp(e)?;
        // hard_link refuses to replace an existing record
        let linked = fs::hard_link(&tmp, &path);
        let _ = fs::remove_file(&tmp);
        match linked {
            Ok(()) => {
                self.sync_dir()?;
                debug!("store: inserted {}", path.display());
                Ok(())
            }
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Err(Error::Exists {
                uid: e.uid.clone(),
            }),
            Err(source) => Err(Error::Io { path, source }),
        }
    }

    /// Replace an existing record, refreshing its update time.
    pub fn update(&self, e: &mut Experiment) -> Result<()> {
        let path = self.path(&e.uid)?;
        if !path.exists() {
            return Err(Error::NotFound {
                uid: e.uid.clone(),
            });
        }
        e.update_time = now();
        let tmp = self.write_tmp(e)?;
        fs::rename(&tmp, &path).map_err(|source| {
            let _ = fs::remove_file(&tmp);
            Error::Io {
                path: path.clone(),
                source,
            }
        })?;
        self.sync_dir()?;
        debug!("store: updated {} status {}", path.display(), e.status);
        Ok(())
    }

    pub fn update_status(&self, uid: &str, status: Status) -> Result<()> {
        let mut e = self.get_by_uid(uid)?;
        e.status = status;
        self.update(&mut e)
    }

    pub fn update_status_and_error(&self, uid: &str, status: Status, error: &str) -> Result<()> {
        let mut e = self.get_by_uid(uid)?;
        e.status = status;
        e.error = error.to_string();
        self.update(&mut e)
    }

    pub fn get_by_uid(&self, uid: &str) -> Result<Experiment> {
        let path = self.path(uid)?;
        let data = fs::read(&path).map_err(|source| {
            if source.kind() == io::ErrorKind::NotFound {
                Error::NotFound {
                    uid: uid.to_string(),
                }
            } else {
                Error::Io {
                    path: path.clone(),
                    source,
                }
            }
        })?;
        serde_json::from_slice(&data).map_err(|source| Error::Decode { path, source })
    }

    /// Matching records, newest first, and the number that matched before
    /// offset and limit were applied.
    pub fn query(&self, filter: &Filter) -> Result<(Vec<Experiment>, usize)> {
        let entries = fs::read_dir(&self.dir).map_err(|source| Error::Io {
            path: self.dir.clone(),
            source,
        })?;
        let mut found = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| Error::Io {
                path: self.dir.clone(),
                source,
            })?;
            let name = entry.file_name();
            let Some(uid) = name.to_str().and_then(|n| n.strip_suffix(".json")) else {
                continue;
            };
            if uid.starts_with('.') || !injector::is_valid_uid(uid) {
                continue;
            }
            match self.get_by_uid(uid) {
                Ok(e) if filter.matches(&e) => found.push(e),
                Ok(_) => {}
                // removed between listing and reading
                Err(Error::NotFound { .. }) => {}
                Err(err) => return Err(err),
            }
        }
        found.sort_by(|a, b| {
            b.create_time
                .cmp(&a.create_time)
                .then_with(|| b.uid.cmp(&a.uid))
        });
        let total = found.len();
        let limit = if filter.limit == 0 { usize::MAX } else { filter.limit };
        let page = found.into_iter().skip(filter.offset).take(limit).collect();
        Ok((page, total))
    }
}

//! Fields shared by every experiment and the checks that apply to all of
//! them.

use std::fmt;
use std::str::FromStr;

use chrono::Local;
use crclient::RuntimeKind;
use log::info;
use serde::{Deserialize, Serialize};

use crate::{invalid, Error, Result};

pub const UID_MIN_LEN: usize = 5;
pub const UID_MAX_LEN: usize = 36;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    #[default]
    Created,
    Success,
    Error,
    Destroyed,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Created => "created",
            Status::Success => "success",
            Status::Error => "error",
            Status::Destroyed => "destroyed",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "created" => Ok(Status::Created),
            "success" => Ok(Status::Success),
            "error" => Ok(Status::Error),
            "destroyed" => Ok(Status::Destroyed),
            other => Err(invalid(format!("unknown status: {}", other))),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommonInfo {
    pub uid: String,
    pub creator: String,
    pub status: Status,
    pub error: String,
    /// Duration string such as `30s` or `5m`; empty means unbounded
    pub timeout: String,
    pub target: String,
    pub fault: String,
    pub container_id: String,
    pub container_runtime: String,
}

impl CommonInfo {
    pub fn apply_defaults(&mut self) {
        if self.creator.is_empty() {
            self.creator = osutil::current_user();
        }
        if self.uid.is_empty() {
            self.uid = new_uid();
        }
        if !self.container_id.is_empty() && self.container_runtime.is_empty() {
            self.container_runtime = RuntimeKind::Docker.to_string();
        }
    }

    pub fn in_container(&self) -> bool {
        !self.container_id.is_empty()
    }

    /// Timeout in seconds; `None` when unset or zero.
    pub fn timeout_secs(&self) -> Result<Option<u64>> {
        if self.timeout.trim().is_empty() {
            return Ok(None);
        }
        let secs = osutil::units::parse_time_seconds(&self.timeout)
            .map_err(|e| invalid(format!("\"timeout\" is invalid: {}", e)))?;
        Ok(if secs == 0 { None } else { Some(secs) })
    }
}

/// `%Y%m%d%H%M%S` of local time followed by four sub-second digits.
pub fn new_uid() -> String {
    let now = Local::now();
    format!(
        "{}{:04}",
        now.format("%Y%m%d%H%M%S"),
        now.timestamp_subsec_nanos() / 100_000 % 10_000
    )
}

pub fn is_valid_uid(uid: &str) -> bool {
    (UID_MIN_LEN..=UID_MAX_LEN).contains(&uid.len())
        && uid
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Checks every injector runs before its own.
pub fn validate_common(info: &CommonInfo) -> Result<()> {
    if !is_valid_uid(&info.uid) {
        return Err(invalid(format!(
            "uid[{}] is invalid: must be {}-{} chars of [A-Za-z0-9_-]",
            info.uid, UID_MIN_LEN, UID_MAX_LEN
        )));
    }
    if !info.container_runtime.is_empty() {
        if info.container_id.is_empty() {
            return Err(invalid(
                "\"container-id\" is required when \"container-runtime\" is set",
            ));
        }
        info.container_runtime
            .parse::<RuntimeKind>()
            .map_err(|e| invalid(e.to_string()))?;
    }
    info.timeout_secs()?;
    Ok(())
}

/// True when there is nothing left to recover. An experiment in `error`
/// state is still recovered since its injection may have been partial.
pub fn recover_guard(info: &CommonInfo) -> bool {
    if info.status == Status::Destroyed {
        info!("injector: [{}] already destroyed, nothing to recover", info.uid);
        return true;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> CommonInfo {
        CommonInfo {
            uid: "exp-0001".to_string(),
            target: "mem".to_string(),
            fault: "fill".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_new_uid_shape() {
        let uid = new_uid();
        assert_eq!(uid.len(), 18);
        assert!(uid.chars().all(|c| c.is_ascii_digit()));
        assert!(is_valid_uid(&uid));
    }

    #[test]
    fn test_is_valid_uid() {
        assert!(is_valid_uid("abc_-1"));
        assert!(!is_valid_uid("abcd"));
        assert!(!is_valid_uid(&"a".repeat(37)));
        assert!(!is_valid_uid("../../etc"));
        assert!(!is_valid_uid("with space"));
    }

    #[test]
    fn test_apply_defaults() {
        let mut i = CommonInfo {
            container_id: "abc".to_string(),
            ..Default::default()
        };
        i.apply_defaults();
        assert!(!i.uid.is_empty());
        assert!(!i.creator.is_empty());
        assert_eq!(i.status, Status::Created);
        assert_eq!(i.container_runtime, "docker");

        let mut host = CommonInfo::default();
        host.apply_defaults();
        assert!(host.container_runtime.is_empty());
        assert!(!host.in_container());
    }

    #[test]
    fn test_validate_common() {
        validate_common(&base()).unwrap();

        let mut i = base();
        i.container_runtime = "docker".to_string();
        assert!(validate_common(&i).is_err());

        i.container_id = "abc".to_string();
        validate_common(&i).unwrap();

        i.container_runtime = "rkt".to_string();
        assert!(matches!(validate_common(&i), Err(Error::InvalidArgs(_))));

        let mut i = base();
        i.timeout = "ten".to_string();
        assert!(validate_common(&i).is_err());

        let mut i = base();
        i.uid = "x".to_string();
        assert!(validate_common(&i).is_err());
    }

    #[test]
    fn test_timeout_secs() {
        let mut i = base();
        assert_eq!(i.timeout_secs().unwrap(), None);
        i.timeout = "2m".to_string();
        assert_eq!(i.timeout_secs().unwrap(), Some(120));
        i.timeout = "0".to_string();
        assert_eq!(i.timeout_secs().unwrap(), None);
    }

    #[test]
    fn test_recover_guard() {
        let mut i = base();
        assert!(!recover_guard(&i));
        i.status = Status::Error;
        assert!(!recover_guard(&i));
        i.status = Status::Destroyed;
        assert!(recover_guard(&i));
    }

    #[test]
    fn test_status_serde() {
        assert_eq!(
            serde_json::to_string(&Status::Destroyed).unwrap(),
            "\"destroyed\""
        );
        assert_eq!("success".parse::<Status>().unwrap(), Status::Success);
        assert!("gone".parse::<Status>().is_err());
    }
}

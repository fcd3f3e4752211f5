//! Block device lookup by `major:minor` number.

use std::fs;
use std::path::PathBuf;

use regex::Regex;

use crate::{Error, Result};

const DEV_PATTERN: &str = r"^\d+:\d+$";

/// View of `/sys/dev/block`.
#[derive(Clone, Debug)]
pub struct BlockDevices {
    sys_root: PathBuf,
}

impl Default for BlockDevices {
    fn default() -> Self {
        Self::new("/sys/dev/block")
    }
}

impl BlockDevices {
    pub fn new(sys_root: impl Into<PathBuf>) -> Self {
        Self {
            sys_root: sys_root.into(),
        }
    }

    /// True if `dev` names a whole disk (not a partition).
    pub fn is_disk(&self, dev: &str) -> bool {
        let uevent = self.sys_root.join(dev).join("uevent");
        match fs::read_to_string(uevent) {
            Ok(c) => c.lines().any(|l| l.trim() == "DEVTYPE=disk"),
            Err(_) => false,
        }
    }

    /// Parse `"8:0,8:16"` and check that every device exists.
    pub fn validate_dev_list(&self, s: &str) -> Result<Vec<String>> {
        let re = Regex::new(DEV_PATTERN).map_err(|e| Error::invalid(DEV_PATTERN, e.to_string()))?;
        let mut devs: Vec<String> = Vec::new();
        for dev in s.split(',').map(str::trim).filter(|d| !d.is_empty()) {
            if !re.is_match(dev) {
                return Err(Error::invalid(dev, "dev must be in the form major:minor"));
            }
            if !self.is_disk(dev) {
                return Err(Error::NoSuchDevice(dev.to_string()));
            }
            if !devs.iter().any(|d| d == dev) {
                devs.push(dev.to_string());
            }
        }
        if devs.is_empty() {
            return Err(Error::invalid(s, "args dev-list is empty"));
        }
        Ok(devs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn fake_dev(root: &std::path::Path, dev: &str, devtype: &str) {
        let d = root.join(dev);
        fs::create_dir_all(&d).unwrap();
        fs::write(
            d.join("uevent"),
            format!("MAJOR=8\nMINOR=0\nDEVNAME=sda\nDEVTYPE={}\n", devtype),
        )
        .unwrap();
    }

    #[test]
    fn test_validate_dev_list() {
        let tmp = tempdir().unwrap();
        fake_dev(tmp.path(), "8:0", "disk");
        fake_dev(tmp.path(), "8:1", "partition");
        let b = BlockDevices::new(tmp.path());

        assert_eq!(b.validate_dev_list("8:0, 8:0").unwrap(), vec!["8:0"]);
        assert_eq!(
            b.validate_dev_list("8:0,8:1").unwrap_err().to_string(),
            "dev[8:1] is not exist"
        );
        assert!(matches!(
            b.validate_dev_list("8:0,9:9"),
            Err(Error::NoSuchDevice(d)) if d == "9:9"
        ));
        assert!(b.validate_dev_list("").is_err());
        assert!(b.validate_dev_list("sda").is_err());
    }
}

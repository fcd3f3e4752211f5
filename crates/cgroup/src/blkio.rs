//! blkio throttling groups.

use crate::LimitWrite;

/// Name prefix of every experiment group; used to refuse nesting experiments.
pub const GROUP_PREFIX: &str = "chaosmeta_blkio";

pub const READ_BPS_FILE: &str = "blkio.throttle.read_bps_device";
pub const WRITE_BPS_FILE: &str = "blkio.throttle.write_bps_device";
pub const READ_IOPS_FILE: &str = "blkio.throttle.read_iops_device";
pub const WRITE_IOPS_FILE: &str = "blkio.throttle.write_iops_device";

/// Per-device throttle rates; `None` leaves that direction unlimited.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Throttle {
    pub read_bps: Option<u64>,
    pub write_bps: Option<u64>,
    pub read_iops: Option<u64>,
    pub write_iops: Option<u64>,
}

impl Throttle {
    pub fn is_empty(&self) -> bool {
        self.read_bps.is_none()
            && self.write_bps.is_none()
            && self.read_iops.is_none()
            && self.write_iops.is_none()
    }

    /// One write per (direction, device). Writing a rate of 0 removes a rule,
    /// which is what a rollback writes.
    pub fn writes(&self, devs: &[String]) -> Vec<LimitWrite> {
        let mut out = Vec::new();
        let rules = [
            (READ_BPS_FILE, self.read_bps),
            (WRITE_BPS_FILE, self.write_bps),
            (READ_IOPS_FILE, self.read_iops),
            (WRITE_IOPS_FILE, self.write_iops),
        ];
        for (file, rate) in rules {
            let Some(rate) = rate else { continue };
            for dev in devs {
                out.push(LimitWrite {
                    file: file.to_string(),
                    value: format!("{} {}", dev, rate),
                    revert: Some(format!("{} 0", dev)),
                });
            }
        }
        out
    }
}

pub fn group_name(uid: &str) -> String {
    format!("{}_{}", GROUP_PREFIX, uid)
}

/// Group path relative to the blkio root, nested under `parent` when the
/// experiment targets a container.
pub fn group_rel_path(uid: &str, parent: Option<&str>) -> String {
    let parent = parent.unwrap_or("").trim_end_matches('/');
    format!("{}/{}", parent, group_name(uid))
}

/// True if `rel` is (inside) an experiment group.
pub fn in_experiment_group(rel: &str) -> bool {
    rel.contains(GROUP_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_writes_per_device_and_direction() {
        let t = Throttle {
            read_bps: Some(1),
            write_iops: Some(50),
            ..Default::default()
        };
        let w = t.writes(&["8:0".to_string(), "8:16".to_string()]);
        assert_eq!(w.len(), 4);
        assert_eq!(w[0].file, READ_BPS_FILE);
        assert_eq!(w[0].value, "8:0 1");
        assert_eq!(w[1].value, "8:16 1");
        assert_eq!(w[2].file, WRITE_IOPS_FILE);
        assert_eq!(w[3].revert.as_deref(), Some("8:16 0"));
        assert!(Throttle::default().is_empty());
        assert!(!t.is_empty());
    }

    #[test]
    fn test_group_paths() {
        assert_eq!(group_rel_path("2023", None), "/chaosmeta_blkio_2023");
        assert_eq!(
            group_rel_path("2023", Some("/kubepods/pod1/abc/")),
            "/kubepods/pod1/abc/chaosmeta_blkio_2023"
        );
        assert!(in_experiment_group("/chaosmeta_blkio_2023"));
        assert!(!in_experiment_group("/user.slice"));
    }
}

//! Keeping one core busy for a share of every period.

use std::time::{Duration, Instant};

use nix::sched::{sched_setaffinity, CpuSet};
use nix::unistd::Pid;

use crate::{Error, Result};

/// One busy/idle cycle.
pub const PERIOD: Duration = Duration::from_millis(100);

/// Restrict the calling thread to `core`.
pub fn pin_to_core(core: usize) -> Result<()> {
    let mut set = CpuSet::new();
    set.set(core)
        .map_err(|e| Error::invalid(format!("core[{}]", core), e.to_string()))?;
    sched_setaffinity(Pid::from_raw(0), &set)
        .map_err(|e| Error::invalid(format!("core[{}]", core), format!("set affinity error: {}", e)))
}

/// Busy and idle time of one period for `percent` in (0,100].
pub fn duty_cycle(percent: u32) -> (Duration, Duration) {
    let percent = percent.min(100);
    let busy = PERIOD * percent / 100;
    (busy, PERIOD - busy)
}

/// Spin for `percent` of every period until `deadline`, or forever.
pub fn burn(percent: u32, deadline: Option<Instant>) {
    let (busy, idle) = duty_cycle(percent);
    loop {
        let start = Instant::now();
        if deadline.is_some_and(|d| start >= d) {
            return;
        }
        while start.elapsed() < busy {
            std::hint::spin_loop();
        }
        if !idle.is_zero() {
            std::thread::sleep(idle);
        }
    }
}

//! Capacity this worker offers to the server.

use jobcenter_core::{ResourceAllocation, WorkerConfig};
use tracing::{debug, warn};

const MEMINFO: &str = "/proc/meminfo";

/// `MemTotal` in MiB from the contents of `/proc/meminfo`.
pub fn parse_meminfo(meminfo: &str) -> Option<i64> {
    meminfo.lines().find_map(|line| {
        let rest = line.strip_prefix("MemTotal:")?;
        let kib: i64 = rest.split_whitespace().next()?.parse().ok()?;
        Some(kib / 1024)
    })
}

/// Swap offered for `memory_mb` of memory.
pub fn swap_for(memory_mb: i64, swap_factor: f64) -> i64 {
    (memory_mb as f64 * swap_factor).floor() as i64
}

/// Configured resources, or cpu count and total memory of this host.
pub fn detect(config: &WorkerConfig) -> ResourceAllocation {
    if let Some(resources) = config.resources {
        return resources;
    }
    let cpu = std::thread::available_parallelism()
        .map(|n| n.get() as i64)
        .unwrap_or(1);
    let memory = match std::fs::read_to_string(MEMINFO) {
        Ok(content) => parse_meminfo(&content).unwrap_or(0),
        Err(e) => {
            warn!(error = %e, "cannot read {MEMINFO}; offering no memory");
            0
        }
    };
    let detected = ResourceAllocation::new(cpu, memory, swap_for(memory, config.swap_factor));
    debug!(%detected, "detected worker resources");
    detected
}

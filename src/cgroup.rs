//! Container-aware CPU budget detection.
//!
//! The default write concurrency is the number of CPUs the process may
//! actually use, which inside a container is the cgroup CPU quota rather than
//! the host's core count.

use std::fs;
use std::sync::OnceLock;

const CPU_OVERRIDE_ENV: &str = "TSDBE_MAX_CPUS";
const CGROUP_V2_CPU_MAX: &str = "/sys/fs/cgroup/cpu.max";
const CGROUP_V1_QUOTA: &str = "/sys/fs/cgroup/cpu/cpu.cfs_quota_us";
const CGROUP_V1_PERIOD: &str = "/sys/fs/cgroup/cpu/cpu.cfs_period_us";

static AVAILABLE_CPUS: OnceLock<usize> = OnceLock::new();

/// Returns the number of CPUs available to the process, detected once.
pub fn available_cpus() -> usize {
    *AVAILABLE_CPUS.get_or_init(detect_available_cpus)
}

/// Returns the default number of concurrent writers.
pub fn default_workers_limit() -> usize {
    available_cpus()
}

fn detect_available_cpus() -> usize {
    if let Some(n) = std::env::var(CPU_OVERRIDE_ENV)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .filter(|n| *n > 0)
    {
        return n;
    }

    let host = num_cpus::get().max(1);
    match cpu_quota() {
        // A fractional quota still gets one worker.
        Some(quota) => (quota.ceil() as usize).clamp(1, host),
        None => host,
    }
}

fn cpu_quota() -> Option<f64> {
    if let Ok(content) = fs::read_to_string(CGROUP_V2_CPU_MAX) {
        return parse_cpu_max(&content);
    }

    let quota: i64 = read_trimmed(CGROUP_V1_QUOTA)?.parse().ok()?;
    let period: i64 = read_trimmed(CGROUP_V1_PERIOD)?.parse().ok()?;
    if quota <= 0 || period <= 0 {
        return None;
    }
    Some(quota as f64 / period as f64)
}

/// Parses the cgroup v2 `cpu.max` format: `"<quota> <period>"` or `"max <period>"`.
fn parse_cpu_max(content: &str) -> Option<f64> {
    let mut parts = content.split_whitespace();
    let quota = parts.next()?;
    let period = parts.next()?.parse::<f64>().ok()?;
    if quota == "max" || period <= 0.0 || parts.next().is_some() {
        return None;
    }
    Some(quota.parse::<f64>().ok()? / period)
}

fn read_trimmed(path: &str) -> Option<String> {
    fs::read_to_string(path).ok().map(|s| s.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cpu_max() {
        assert_eq!(parse_cpu_max("200000 100000\n"), Some(2.0));
        assert_eq!(parse_cpu_max("50000 100000"), Some(0.5));
        assert_eq!(parse_cpu_max("max 100000"), None);
        assert_eq!(parse_cpu_max("100 0"), None);
        assert_eq!(parse_cpu_max(""), None);
    }

    #[test]
    fn test_available_cpus() {
        let cpus = available_cpus();
        assert!(cpus > 0);
        assert_eq!(default_workers_limit(), cpus);
    }
}

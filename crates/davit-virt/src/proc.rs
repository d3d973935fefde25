//! /proc sampling helpers shared by the VM and container back-ends.

use std::fs;
use std::time::Instant;

/// Resident set size of a process in MB, or None if unreadable.
pub fn rss_mb(pid: u32) -> Option<i64> {
    let status = fs::read_to_string(format!("/proc/{pid}/status")).ok()?;
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("VmRSS:") {
            let kb: i64 = rest.trim().trim_end_matches(" kB").trim().parse().ok()?;
            return Some(kb / 1024);
        }
    }
    None
}

/// Cumulative user+system CPU ticks of a process.
pub fn cpu_ticks(pid: u32) -> Option<u64> {
    let stat = fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    // Fields 14 (utime) and 15 (stime), counting from 1. The comm field may
    // contain spaces, so split after the closing paren.
    let after = stat.rsplit_once(')')?.1;
    let fields: Vec<&str> = after.split_whitespace().collect();
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    Some(utime + stime)
}

fn clock_ticks_per_sec() -> u64 {
    // SAFETY: sysconf has no preconditions.
    let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if ticks > 0 { ticks as u64 } else { 100 }
}

/// CPU usage sampler keeping the previous tick count so usage can be
/// computed as a delta. The first sample after a reset is unknown (`-1`).
#[derive(Debug, Default)]
pub struct CpuSampler {
    last: Option<(u64, Instant)>,
}

impl CpuSampler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop the previous sample, e.g. after the guest reconnected.
    pub fn reset(&mut self) {
        self.last = None;
    }

    /// Percent of one CPU consumed since the previous sample, or `-1`
    /// when no baseline exists yet or /proc is unreadable.
    pub fn sample(&mut self, pid: u32) -> i32 {
        let Some(ticks) = cpu_ticks(pid) else {
            self.last = None;
            return -1;
        };
        let now = Instant::now();
        let pct = match self.last {
            Some((prev_ticks, prev_at)) => {
                let elapsed = now.duration_since(prev_at).as_secs_f64();
                if elapsed <= 0.0 {
                    -1
                } else {
                    let used = ticks.saturating_sub(prev_ticks) as f64 / clock_ticks_per_sec() as f64;
                    ((used / elapsed) * 100.0).round() as i32
                }
            }
            None => -1,
        };
        self.last = Some((ticks, now));
        pct
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rss_of_self() {
        let pid = std::process::id();
        let rss = rss_mb(pid);
        assert!(rss.is_some());
        assert!(rss.unwrap() >= 0);
    }

    #[test]
    fn test_cpu_ticks_of_self() {
        let pid = std::process::id();
        assert!(cpu_ticks(pid).is_some());
    }

    #[test]
    fn test_cpu_sampler_first_sample_unknown() {
        let mut sampler = CpuSampler::new();
        assert_eq!(sampler.sample(std::process::id()), -1);
        // Second sample has a baseline.
        let second = sampler.sample(std::process::id());
        assert!(second >= 0);
    }

    #[test]
    fn test_cpu_sampler_reset() {
        let mut sampler = CpuSampler::new();
        let pid = std::process::id();
        sampler.sample(pid);
        sampler.reset();
        assert_eq!(sampler.sample(pid), -1);
    }

    #[test]
    fn test_missing_pid_is_unknown() {
        let mut sampler = CpuSampler::new();
        assert_eq!(sampler.sample(u32::MAX - 1), -1);
        assert!(rss_mb(u32::MAX - 1).is_none());
    }
}

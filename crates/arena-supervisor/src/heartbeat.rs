//! Resource sampling for heartbeats, read from `/proc`.

use std::time::Instant;

use nix::unistd::{SysconfVar, sysconf};

/// Resident set size of `pid` in MiB, from `VmRSS` in `/proc/<pid>/status`.
pub fn resident_memory_mb(pid: u32) -> Option<u64> {
    let status = std::fs::read_to_string(format!("/proc/{pid}/status")).ok()?;
    parse_vm_rss_kb(&status).map(|kb| kb / 1024)
}

fn parse_vm_rss_kb(status: &str) -> Option<u64> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("VmRSS:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|kb| kb.parse().ok())
}

/// `utime + stime` of `pid` in clock ticks, from `/proc/<pid>/stat`.
fn cpu_ticks(pid: u32) -> Option<u64> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    parse_cpu_ticks(&stat)
}

fn parse_cpu_ticks(stat: &str) -> Option<u64> {
    // The command name may contain spaces; fields resume after the last ')'.
    let rest = &stat[stat.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    // After the name: state(0) ... utime(11) stime(12).
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    Some(utime + stime)
}

fn clock_ticks_per_sec() -> u64 {
    match sysconf(SysconfVar::CLK_TCK) {
        Ok(Some(ticks)) if ticks > 0 => ticks as u64,
        _ => 100,
    }
}

/// CPU usage of one process between successive samples.
#[derive(Debug)]
pub struct CpuSampler {
    pid: u32,
    last: Option<(u64, Instant)>,
    ticks_per_sec: u64,
}

impl CpuSampler {
    pub fn new(pid: u32) -> Self {
        Self {
            pid,
            last: None,
            ticks_per_sec: clock_ticks_per_sec(),
        }
    }

    /// Percent of one core used since the previous sample; `0.0` on the
    /// first sample or when `/proc` is unavailable.
    pub fn sample(&mut self) -> f64 {
        let Some(ticks) = cpu_ticks(self.pid) else {
            return 0.0;
        };
        let now = Instant::now();
        let percent = match self.last {
            Some((prev_ticks, prev_at)) => {
                let elapsed = now.duration_since(prev_at).as_secs_f64();
                if elapsed > 0.0 {
                    let cpu_secs = ticks.saturating_sub(prev_ticks) as f64 / self.ticks_per_sec as f64;
                    (cpu_secs / elapsed) * 100.0
                } else {
                    0.0
                }
            }
            None => 0.0,
        };
        self.last = Some((ticks, now));
        percent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_vm_rss() {
        let status = "Name:\tjava\nVmPeak:\t 9000 kB\nVmRSS:\t  524288 kB\nThreads:\t42\n";
        assert_eq!(parse_vm_rss_kb(status), Some(524288));
        assert_eq!(parse_vm_rss_kb("Name:\tkthreadd\n"), None);
    }

    #[test]
    fn parses_cpu_ticks_with_spaces_in_name() {
        let stat = "1234 (my server) S 1 1234 1234 0 -1 4194560 100 0 0 0 250 50 0 0 20 0 1 0";
        assert_eq!(parse_cpu_ticks(stat), Some(300));
        assert_eq!(parse_cpu_ticks("garbage"), None);
    }

    #[test]
    fn samples_own_process() {
        let pid = std::process::id();
        assert!(resident_memory_mb(pid).is_some());
        let mut sampler = CpuSampler::new(pid);
        assert_eq!(sampler.sample(), 0.0);
        assert!(sampler.sample() >= 0.0);
    }

    #[test]
    fn missing_process_samples_zero() {
        let mut sampler = CpuSampler::new(u32::MAX);
        assert_eq!(sampler.sample(), 0.0);
        assert_eq!(resident_memory_mb(u32::MAX), None);
    }
}

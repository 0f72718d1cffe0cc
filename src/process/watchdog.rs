//! CPU usage watchdog for long-running child processes.

use crate::alerts::{cause, Alert};
use crate::context::RunContext;
use crate::process::supervisor::ManagedProcess;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Kernel clock ticks per second (`USER_HZ`), fixed at 100 on Linux ABIs.
const CLOCK_TICKS_PER_SEC: f64 = 100.0;

/// Measures CPU usage of a process since the previous sample.
pub trait CpuSampler: Send {
    /// Percentage of one core used since the last call; `None` when the
    /// process can no longer be read. The first call establishes a baseline.
    fn sample(&mut self, pid: u32) -> Option<f32>;
}

/// Reads `utime + stime` from `/proc/<pid>/stat`.
#[derive(Debug, Default)]
pub struct ProcStatSampler {
    last: Option<(u64, Instant)>,
}

impl ProcStatSampler {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Total user + system ticks from the contents of `/proc/<pid>/stat`.
pub fn parse_cpu_ticks(stat: &str) -> Option<u64> {
    // comm may contain spaces or parens; fields resume after the last ')'
    let rest = &stat[stat.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    // fields[0] is state (field 3); utime and stime are fields 14 and 15
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    Some(utime + stime)
}

impl CpuSampler for ProcStatSampler {
    fn sample(&mut self, pid: u32) -> Option<f32> {
        let stat = std::fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
        let ticks = parse_cpu_ticks(&stat)?;
        let now = Instant::now();
        let percent = match self.last {
            Some((prev_ticks, prev_at)) => {
                let elapsed = now.duration_since(prev_at).as_secs_f64();
                if elapsed <= 0.0 {
                    0.0
                } else {
                    let busy = ticks.saturating_sub(prev_ticks) as f64 / CLOCK_TICKS_PER_SEC;
                    (busy / elapsed * 100.0) as f32
                }
            }
            None => 0.0,
        };
        self.last = Some((ticks, now));
        Some(percent)
    }
}

/// Raises a `cpu` warning whenever a sampled process runs above the limit.
/// Never restarts or throttles the process.
pub struct CpuWatchdog {
    max_percent: f32,
    interval: Duration,
    ctx: RunContext,
}

impl CpuWatchdog {
    pub fn new(max_percent: f32, interval: Duration, ctx: RunContext) -> Self {
        Self {
            max_percent,
            interval,
            ctx,
        }
    }

    pub fn spawn(
        self,
        process: Arc<ManagedProcess>,
        mut sampler: Box<dyn CpuSampler>,
    ) -> std::io::Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name(format!("{}-cpu-watchdog", process.role()))
            .spawn(move || loop {
                if !process.is_running() || self.ctx.is_shutting_down() {
                    return;
                }
                if let Some(percent) = sampler.sample(process.pid()) {
                    if percent > self.max_percent {
                        log::warn!(
                            "{} (pid {}) at {:.0}% CPU",
                            process.role(),
                            process.pid(),
                            percent
                        );
                        self.ctx.alert(Alert::warning(cause::CPU));
                    }
                }
                // Doubles as the sampling interval; returns early on exit.
                if process.wait_exit(self.interval).is_some() {
                    return;
                }
            })
    }
}

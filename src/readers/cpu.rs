//! CPU utilisation computed from cumulative time counters.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::Path;
use sysinfo::{CpuRefreshKind, RefreshKind, System};

use super::{MetricReader, ReaderError};
use crate::core::point::{Cpu, Measurement, MetricKind};

const PROC_STAT: &str = "/proc/stat";

/// Aggregate jiffies from the `cpu` line of `/proc/stat`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CpuTimes {
    pub user: u64,
    pub nice: u64,
    pub system: u64,
    pub idle: u64,
    pub iowait: u64,
    pub irq: u64,
    pub softirq: u64,
    pub steal: u64,
}

impl CpuTimes {
    fn total(&self) -> u64 {
        self.user
            + self.nice
            + self.system
            + self.idle
            + self.iowait
            + self.irq
            + self.softirq
            + self.steal
    }

    /// Percentages of time spent since `earlier`, or `None` if no time passed.
    pub fn usage_since(&self, earlier: &CpuTimes) -> Option<Cpu> {
        let total = self.total().saturating_sub(earlier.total());
        if total == 0 {
            return None;
        }
        let share = |now: u64, then: u64| now.saturating_sub(then) as f64 * 100.0 / total as f64;

        Some(Cpu {
            user: share(self.user + self.nice, earlier.user + earlier.nice),
            system: share(
                self.system + self.irq + self.softirq,
                earlier.system + earlier.irq + earlier.softirq,
            ),
            idle: share(self.idle + self.iowait, earlier.idle + earlier.iowait),
        })
    }
}

/// Parse the aggregate `cpu` line out of `/proc/stat`.
pub fn parse_proc_stat(content: &str) -> Result<CpuTimes, ReaderError> {
    let line = content
        .lines()
        .find(|l| l.split_whitespace().next() == Some("cpu"))
        .ok_or_else(|| ReaderError::parse("cpu line", ""))?;

    let values: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .map(|v| v.parse::<u64>().map_err(|_| ReaderError::parse("cpu counter", line)))
        .collect::<Result<_, _>>()?;
    if values.len() < 4 {
        return Err(ReaderError::parse("cpu line", line));
    }
    let field = |i: usize| values.get(i).copied().unwrap_or(0);

    Ok(CpuTimes {
        user: field(0),
        nice: field(1),
        system: field(2),
        idle: field(3),
        iowait: field(4),
        irq: field(5),
        softirq: field(6),
        steal: field(7),
    })
}

enum Source {
    /// Counters from `/proc/stat`, with the previous reading as baseline.
    ProcStat(Mutex<Option<CpuTimes>>),
    /// Portable fallback; `sysinfo` keeps its own baseline.
    Sysinfo(Mutex<System>),
}

pub struct CpuReader {
    source: Source,
}

impl CpuReader {
    pub fn new() -> Self {
        let source = if Path::new(PROC_STAT).exists() {
            Source::ProcStat(Mutex::new(None))
        } else {
            Source::Sysinfo(Mutex::new(System::new_with_specifics(
                RefreshKind::new().with_cpu(CpuRefreshKind::new().with_cpu_usage()),
            )))
        };
        Self { source }
    }

    async fn read_times() -> Result<CpuTimes, ReaderError> {
        let content = tokio::fs::read_to_string(PROC_STAT)
            .await
            .map_err(|source| ReaderError::Io {
                path: PROC_STAT.to_string(),
                source,
            })?;
        parse_proc_stat(&content)
    }
}

#[async_trait]
impl MetricReader for CpuReader {
    fn kind(&self) -> MetricKind {
        MetricKind::Cpu
    }

    /// Capture the counter baseline the first `get` is measured against.
    async fn start(&self) -> Result<(), ReaderError> {
        match &self.source {
            Source::ProcStat(baseline) => {
                let times = Self::read_times().await?;
                *baseline.lock() = Some(times);
            }
            Source::Sysinfo(system) => system.lock().refresh_cpu_usage(),
        }
        Ok(())
    }

    async fn stop(&self) -> Result<(), ReaderError> {
        if let Source::ProcStat(baseline) = &self.source {
            *baseline.lock() = None;
        }
        Ok(())
    }

    async fn get(&self) -> Result<Measurement, ReaderError> {
        let cpu = match &self.source {
            Source::ProcStat(baseline) => {
                let times = Self::read_times().await?;
                let previous = baseline.lock().replace(times);
                previous
                    .and_then(|earlier| times.usage_since(&earlier))
                    .ok_or(ReaderError::NoData)?
            }
            Source::Sysinfo(system) => {
                let mut system = system.lock();
                system.refresh_cpu_usage();
                let busy = f64::from(system.global_cpu_usage()).clamp(0.0, 100.0);
                Cpu {
                    user: busy,
                    system: 0.0,
                    idle: 100.0 - busy,
                }
            }
        };
        Ok(Measurement::Cpu(cpu))
    }
}

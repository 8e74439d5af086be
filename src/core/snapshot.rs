//! Windowed averaging of retained points.

use chrono::Duration;
use std::collections::BTreeMap;

use crate::core::events::MetricsData;
use crate::core::point::{Cpu, DiskLoad, FsUsage, LoadAvg, Stats};

/// Running sum of `N` values plus how many samples contributed.
#[derive(Debug, Clone, Copy)]
struct Mean<const N: usize> {
    count: u32,
    sums: [f64; N],
}

impl<const N: usize> Default for Mean<N> {
    fn default() -> Self {
        Self {
            count: 0,
            sums: [0.0; N],
        }
    }
}

impl<const N: usize> Mean<N> {
    fn add(&mut self, values: [f64; N]) {
        self.count += 1;
        for (sum, value) in self.sums.iter_mut().zip(values) {
            *sum += value;
        }
    }

    fn value(&self) -> Option<[f64; N]> {
        if self.count == 0 {
            return None;
        }
        let count = f64::from(self.count);
        Some(self.sums.map(|sum| sum / count))
    }
}

/// Average every point in `[data.time - window, data.time)`.
///
/// Each group is averaged over the points that carry it, disks and
/// filesystems per name over the points in which that name showed up.
pub fn make_stats(data: &MetricsData, window: i64) -> Stats {
    let from = data.time - Duration::seconds(window);

    let mut load = Mean::<3>::default();
    let mut cpu = Mean::<3>::default();
    let mut disks: BTreeMap<&str, Mean<3>> = BTreeMap::new();
    let mut filesystems: BTreeMap<&str, Mean<2>> = BTreeMap::new();

    for point in data.points.range(from..data.time).map(|(_, point)| point) {
        if let Some(la) = &point.load_avg {
            load.add([la.load1, la.load5, la.load15]);
        }
        if let Some(c) = &point.cpu {
            cpu.add([c.user, c.system, c.idle]);
        }
        for disk in point.load_disks.iter().flatten() {
            disks
                .entry(disk.name.as_str())
                .or_default()
                .add([disk.tps, disk.kb_read, disk.kb_write]);
        }
        for fs in point.used_fs.iter().flatten() {
            filesystems
                .entry(fs.path.as_str())
                .or_default()
                .add([fs.used_space, fs.used_inode]);
        }
    }

    Stats {
        time: data.time,
        load_avg: load.value().map(|[load1, load5, load15]| LoadAvg {
            load1,
            load5,
            load15,
        }),
        cpu: cpu.value().map(|[user, system, idle]| Cpu { user, system, idle }),
        load_disks: disks
            .into_iter()
            .filter_map(|(name, mean)| {
                let [tps, kb_read, kb_write] = mean.value()?;
                Some(DiskLoad {
                    name: name.to_string(),
                    tps,
                    kb_read,
                    kb_write,
                })
            })
            .collect(),
        used_fs: filesystems
            .into_iter()
            .filter_map(|(path, mean)| {
                let [used_space, used_inode] = mean.value()?;
                Some(FsUsage {
                    path: path.to_string(),
                    used_space,
                    used_inode,
                })
            })
            .collect(),
    }
}

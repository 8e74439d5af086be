//! Per-second measurement records and the averaged view sent to clients.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Truncate a wall-clock instant to the start of its second.
pub fn truncate_to_second(time: DateTime<Utc>) -> DateTime<Utc> {
    time.trunc_subsecs(0)
}

/// System load average over 1, 5 and 15 minutes.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct LoadAvg {
    pub load1: f64,
    pub load5: f64,
    pub load15: f64,
}

/// CPU time split, in percent.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Cpu {
    pub user: f64,
    pub system: f64,
    pub idle: f64,
}

/// I/O load of a single block device.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DiskLoad {
    pub name: String,
    pub tps: f64,
    pub kb_read: f64,
    pub kb_write: f64,
}

/// Usage of a single mounted filesystem, in percent.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FsUsage {
    pub path: String,
    pub used_space: f64,
    pub used_inode: f64,
}

/// The metric families the daemon knows how to collect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    LoadAvg,
    Cpu,
    LoadDisks,
    UsedFs,
}

impl std::fmt::Display for MetricKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LoadAvg => write!(f, "loadavg"),
            Self::Cpu => write!(f, "cpu"),
            Self::LoadDisks => write!(f, "loaddisks"),
            Self::UsedFs => write!(f, "usedfs"),
        }
    }
}

/// A single reading returned by a metric reader.
#[derive(Debug, Clone, PartialEq)]
pub enum Measurement {
    LoadAvg(LoadAvg),
    Cpu(Cpu),
    LoadDisks(Vec<DiskLoad>),
    UsedFs(Vec<FsUsage>),
}

impl Measurement {
    pub fn kind(&self) -> MetricKind {
        match self {
            Self::LoadAvg(_) => MetricKind::LoadAvg,
            Self::Cpu(_) => MetricKind::Cpu,
            Self::LoadDisks(_) => MetricKind::LoadDisks,
            Self::UsedFs(_) => MetricKind::UsedFs,
        }
    }
}

/// Everything measured during one second. Each field is owned by exactly one
/// collection worker and stays `None` until that worker reports.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Point {
    pub load_avg: Option<LoadAvg>,
    pub cpu: Option<Cpu>,
    pub load_disks: Option<Vec<DiskLoad>>,
    pub used_fs: Option<Vec<FsUsage>>,
}

impl Point {
    /// Store a measurement in the field matching its kind.
    pub fn apply(&mut self, measurement: Measurement) {
        match measurement {
            Measurement::LoadAvg(data) => self.load_avg = Some(data),
            Measurement::Cpu(data) => self.cpu = Some(data),
            Measurement::LoadDisks(data) => self.load_disks = Some(data),
            Measurement::UsedFs(data) => self.used_fs = Some(data),
        }
    }
}

/// Retained points keyed by their (second-truncated) timestamp.
pub type Points = BTreeMap<DateTime<Utc>, Point>;

/// Averaged metrics delivered to one client for one tick.
///
/// A group is left out when no point inside the averaging window carried it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stats {
    pub time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_avg: Option<LoadAvg>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<Cpu>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub load_disks: Vec<DiskLoad>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub used_fs: Vec<FsUsage>,
}

impl Stats {
    pub fn empty(time: DateTime<Utc>) -> Self {
        Self {
            time,
            load_avg: None,
            cpu: None,
            load_disks: Vec::new(),
            used_fs: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn apply_fills_only_the_matching_field() {
        let mut point = Point::default();
        point.apply(Measurement::Cpu(Cpu {
            user: 1.0,
            system: 2.0,
            idle: 97.0,
        }));

        assert!(point.cpu.is_some());
        assert!(point.load_avg.is_none());
        assert!(point.load_disks.is_none());
        assert!(point.used_fs.is_none());
    }

    #[test]
    fn truncates_sub_second_part() {
        let time = Utc.timestamp_opt(1_700_000_000, 987_654_321).unwrap();
        assert_eq!(
            truncate_to_second(time),
            Utc.timestamp_opt(1_700_000_000, 0).unwrap()
        );
    }

    #[test]
    fn empty_groups_are_omitted_from_json() {
        let stats = Stats::empty(Utc.timestamp_opt(1_700_000_000, 0).unwrap());
        let json = serde_json::to_value(&stats).unwrap();
        let object = json.as_object().unwrap();

        assert_eq!(object.len(), 1);
        assert!(object.contains_key("time"));
    }
}

//! Bounded, lock-guarded time series of per-second points.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::sync::Arc;

use crate::core::point::{Point, Points};

/// Thread-safe history store.
///
/// Every operation takes the lock for the shortest span it needs and never
/// across an `.await`; readers outside the collector only ever get copies.
pub struct History {
    points: Arc<Mutex<Points>>,
    max_seconds: i64,
}

impl History {
    pub fn new(max_seconds: u32) -> Self {
        Self {
            points: Arc::new(Mutex::new(Points::new())),
            max_seconds: i64::from(max_seconds),
        }
    }

    pub fn max_seconds(&self) -> i64 {
        self.max_seconds
    }

    /// Start an empty point for `now`, keeping one that already exists.
    pub fn open(&self, now: DateTime<Utc>) {
        self.points.lock().entry(now).or_default();
    }

    /// Mutate the point recorded for `time`. Returns `false` if it has
    /// already been retired.
    pub fn update<F>(&self, time: DateTime<Utc>, mutator: F) -> bool
    where
        F: FnOnce(&mut Point),
    {
        let mut points = self.points.lock();
        match points.get_mut(&time) {
            Some(point) => {
                mutator(point);
                true
            }
            None => false,
        }
    }

    /// Drop every point older than the retention window, returning how many
    /// were removed.
    pub fn prune(&self, now: DateTime<Utc>) -> usize {
        let limit = now - Duration::seconds(self.max_seconds);
        let mut points = self.points.lock();
        let before = points.len();
        *points = points.split_off(&limit);
        before - points.len()
    }

    /// Copy of every point strictly before `now`; the point for `now` itself
    /// is still being filled and is left out.
    pub fn snapshot(&self, now: DateTime<Utc>) -> Points {
        self.points
            .lock()
            .range(..now)
            .map(|(time, point)| (*time, point.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.points.lock().len()
    }
}

impl Clone for History {
    fn clone(&self) -> Self {
        Self {
            points: Arc::clone(&self.points),
            max_seconds: self.max_seconds,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::point::LoadAvg;
    use chrono::TimeZone;

    fn at(second: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + second, 0).unwrap()
    }

    #[test]
    fn prune_keeps_only_the_retention_window() {
        let history = History::new(5);
        for second in 0..=12 {
            history.open(at(second));
            history.prune(at(second));
        }

        let retained = history.snapshot(at(13));
        assert_eq!(retained.keys().next(), Some(&at(7)));
        assert_eq!(history.len(), 6);
    }

    #[test]
    fn snapshot_excludes_the_current_second() {
        let history = History::new(600);
        history.open(at(0));
        history.open(at(1));

        let snapshot = history.snapshot(at(1));
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot.contains_key(&at(0)));
    }

    #[test]
    fn snapshot_is_detached_from_live_points() {
        let history = History::new(600);
        history.open(at(0));
        let snapshot = history.snapshot(at(1));

        history.update(at(0), |point| {
            point.load_avg = Some(LoadAvg {
                load1: 1.0,
                load5: 1.0,
                load15: 1.0,
            })
        });

        assert!(snapshot[&at(0)].load_avg.is_none());
    }

    #[test]
    fn reopening_a_second_keeps_its_data() {
        let history = History::new(600);
        history.open(at(0));
        history.update(at(0), |point| {
            point.load_avg = Some(LoadAvg::default());
        });
        history.open(at(0));

        assert!(history.snapshot(at(1))[&at(0)].load_avg.is_some());
    }

    #[test]
    fn update_of_retired_point_is_ignored() {
        let history = History::new(2);
        history.open(at(0));
        history.open(at(5));
        history.prune(at(5));

        assert!(!history.update(at(0), |_| {}));
        assert!(history.update(at(5), |_| {}));
    }
}

//! Metric readers - OS-facing sources for each metric kind
//!
//! Each reader owns whatever state it needs between calls (CPU counter
//! baselines, helper processes) and is shared between the collector, which
//! mounts and unmounts it, and the collection worker that polls `get`.

pub mod command;
pub mod cpu;
pub mod loadavg;
pub mod loaddisks;
pub mod usedfs;

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::MetricConfig;
use crate::core::point::{Measurement, MetricKind};

#[derive(Debug, thiserror::Error)]
pub enum ReaderError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse {what}: {line:?}")]
    Parse { what: &'static str, line: String },

    #[error("no data collected yet")]
    NoData,

    #[error("{command}: {message}")]
    Command {
        command: &'static str,
        message: String,
    },
}

impl ReaderError {
    pub fn parse(what: &'static str, line: impl Into<String>) -> Self {
        Self::Parse {
            what,
            line: line.into(),
        }
    }
}

/// Start/stop/get protocol every metric source implements.
///
/// Callers bound each call with a deadline and abandon it by dropping the
/// future, so implementations must not rely on running to completion.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MetricReader: Send + Sync {
    fn kind(&self) -> MetricKind;

    /// Prepare the reader (capture a baseline, spawn a helper process).
    async fn start(&self) -> Result<(), ReaderError>;

    /// Release whatever `start` acquired.
    async fn stop(&self) -> Result<(), ReaderError>;

    /// Take one measurement.
    async fn get(&self) -> Result<Measurement, ReaderError>;
}

/// Enabled readers, one per metric kind.
#[derive(Clone, Default)]
pub struct ReaderSet {
    readers: BTreeMap<MetricKind, Arc<dyn MetricReader>>,
}

impl ReaderSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the platform readers for every metric switched on in `config`.
    pub fn from_config(config: &MetricConfig) -> Self {
        let mut set = Self::new();
        for kind in config.enabled() {
            let reader: Arc<dyn MetricReader> = match kind {
                MetricKind::LoadAvg => Arc::new(loadavg::LoadAvgReader::new()),
                MetricKind::Cpu => Arc::new(cpu::CpuReader::new()),
                MetricKind::LoadDisks => Arc::new(loaddisks::LoadDisksReader::new()),
                MetricKind::UsedFs => Arc::new(usedfs::UsedFsReader::new()),
            };
            set.insert(reader);
        }
        set
    }

    /// Register a reader under its own kind, replacing any previous one.
    pub fn insert(&mut self, reader: Arc<dyn MetricReader>) {
        self.readers.insert(reader.kind(), reader);
    }

    pub fn kinds(&self) -> Vec<MetricKind> {
        self.readers.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn MetricReader>> {
        self.readers.values()
    }

    pub fn len(&self) -> usize {
        self.readers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readers.is_empty()
    }
}

/// Readers whose `get` takes real (or paused) time to answer.
#[cfg(test)]
pub mod testing {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Answers every `get` with `measurement`, sleeping `delay` first on the
    /// first `slow_calls` calls.
    pub struct DelayedReader {
        measurement: Measurement,
        delay: Duration,
        slow_calls: usize,
        calls: AtomicUsize,
    }

    impl DelayedReader {
        pub fn new(measurement: Measurement, delay: Duration, slow_calls: usize) -> Self {
            Self {
                measurement,
                delay,
                slow_calls,
                calls: AtomicUsize::new(0),
            }
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl MetricReader for DelayedReader {
        fn kind(&self) -> MetricKind {
            self.measurement.kind()
        }

        async fn start(&self) -> Result<(), ReaderError> {
            Ok(())
        }

        async fn stop(&self) -> Result<(), ReaderError> {
            Ok(())
        }

        async fn get(&self) -> Result<Measurement, ReaderError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.slow_calls {
                tokio::time::sleep(self.delay).await;
            }
            Ok(self.measurement.clone())
        }
    }
}

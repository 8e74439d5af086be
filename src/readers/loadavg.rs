//! System load average

use async_trait::async_trait;
use sysinfo::System;

use super::{MetricReader, ReaderError};
use crate::core::point::{LoadAvg, Measurement, MetricKind};

const PROC_LOADAVG: &str = "/proc/loadavg";

/// Reads `/proc/loadavg`, falling back to `sysinfo` where it is missing.
pub struct LoadAvgReader;

impl LoadAvgReader {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl MetricReader for LoadAvgReader {
    fn kind(&self) -> MetricKind {
        MetricKind::LoadAvg
    }

    async fn start(&self) -> Result<(), ReaderError> {
        Ok(())
    }

    async fn stop(&self) -> Result<(), ReaderError> {
        Ok(())
    }

    async fn get(&self) -> Result<Measurement, ReaderError> {
        let load = match tokio::fs::read_to_string(PROC_LOADAVG).await {
            Ok(content) => parse_loadavg(&content)?,
            Err(_) => {
                let load = System::load_average();
                LoadAvg {
                    load1: load.one,
                    load5: load.five,
                    load15: load.fifteen,
                }
            }
        };
        Ok(Measurement::LoadAvg(load))
    }
}

/// Parse the first three fields of `/proc/loadavg`.
pub fn parse_loadavg(content: &str) -> Result<LoadAvg, ReaderError> {
    let mut fields = content.split_whitespace();
    let mut next = |what: &'static str| -> Result<f64, ReaderError> {
        fields
            .next()
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| ReaderError::parse(what, content.trim()))
    };

    Ok(LoadAvg {
        load1: next("load1")?,
        load5: next("load5")?,
        load15: next("load15")?,
    })
}

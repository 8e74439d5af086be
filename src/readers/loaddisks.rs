//! Per-device disk load from a long-running `iostat`.

use async_trait::async_trait;

use super::command::{check_installed, ChunkParser, StreamingCommand};
use super::{MetricReader, ReaderError};
use crate::core::point::{DiskLoad, Measurement, MetricKind};

const IOSTAT: &str = "iostat";

/// Splits `iostat -dky 1` output into per-interval device reports.
///
/// Each report starts after a `Device` header line and ends at a blank
/// line; loop devices are skipped.
#[derive(Debug)]
pub struct IostatParser {
    in_header: bool,
    rows: Vec<String>,
}

impl IostatParser {
    pub fn new() -> Self {
        Self {
            in_header: true,
            rows: Vec::new(),
        }
    }
}

impl ChunkParser for IostatParser {
    type Output = Vec<DiskLoad>;

    fn feed(&mut self, line: &str) -> Option<Result<Vec<DiskLoad>, ReaderError>> {
        if self.in_header {
            if line.starts_with("Device") {
                self.in_header = false;
            }
            return None;
        }
        if line.trim().is_empty() {
            self.in_header = true;
            let rows = std::mem::take(&mut self.rows);
            return Some(rows.iter().map(|row| parse_iostat_row(row)).collect());
        }
        if !line.starts_with("loop") {
            self.rows.push(line.to_string());
        }
        None
    }
}

/// Parse `name tps kB_read/s kB_wrtn/s ...`, accepting comma decimals.
pub fn parse_iostat_row(row: &str) -> Result<DiskLoad, ReaderError> {
    let row = row.replace(',', ".");
    let fields: Vec<&str> = row.split_whitespace().collect();
    if fields.len() < 4 {
        return Err(ReaderError::parse("iostat line", row.as_str()));
    }
    let number = |i: usize, what: &'static str| {
        fields[i]
            .parse::<f64>()
            .map_err(|_| ReaderError::parse(what, row.as_str()))
    };

    Ok(DiskLoad {
        name: fields[0].to_string(),
        tps: number(1, "tps")?,
        kb_read: number(2, "kB_read/s")?,
        kb_write: number(3, "kB_wrtn/s")?,
    })
}

pub struct LoadDisksReader {
    iostat: StreamingCommand<IostatParser>,
}

impl LoadDisksReader {
    pub fn new() -> Self {
        Self {
            iostat: StreamingCommand::new(IOSTAT, IOSTAT, &["-dky", "1"], IostatParser::new),
        }
    }
}

#[async_trait]
impl MetricReader for LoadDisksReader {
    fn kind(&self) -> MetricKind {
        MetricKind::LoadDisks
    }

    async fn start(&self) -> Result<(), ReaderError> {
        check_installed(IOSTAT, IOSTAT, &["-dky"]).await?;
        self.iostat.start().await
    }

    async fn stop(&self) -> Result<(), ReaderError> {
        self.iostat.stop().await
    }

    async fn get(&self) -> Result<Measurement, ReaderError> {
        self.iostat.latest().map(Measurement::LoadDisks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OUTPUT: &str = "\
Linux 6.1.0 (host) \t01/02/2024 \t_x86_64_\t(8 CPU)

Device             tps    kB_read/s    kB_wrtn/s    kB_dscd/s    kB_read    kB_wrtn    kB_dscd
loop0             0.00         0.00         0.00         0.00          0          0          0
nvme0n1          12.00        48.00       256,50         0.00         48        256          0
sda               1.00         0.00         4.00         0.00          0          4          0

Device             tps    kB_read/s    kB_wrtn/s    kB_dscd/s    kB_read    kB_wrtn    kB_dscd
nvme0n1           2.00         8.00         0.00         0.00          8          0          0

";

    fn feed_all(parser: &mut IostatParser, text: &str) -> Vec<Vec<DiskLoad>> {
        text.lines()
            .filter_map(|line| parser.feed(line))
            .map(|sample| sample.expect("valid sample"))
            .collect()
    }

    #[test]
    fn splits_reports_and_skips_loop_devices() {
        let mut parser = IostatParser::new();
        let samples = feed_all(&mut parser, OUTPUT);

        assert_eq!(samples.len(), 2);
        pretty_assertions::assert_eq!(
            samples[0],
            vec![
                DiskLoad {
                    name: "nvme0n1".to_string(),
                    tps: 12.0,
                    kb_read: 48.0,
                    kb_write: 256.5,
                },
                DiskLoad {
                    name: "sda".to_string(),
                    tps: 1.0,
                    kb_read: 0.0,
                    kb_write: 4.0,
                },
            ]
        );
        assert_eq!(samples[1].len(), 1);
    }

    #[test]
    fn malformed_row_surfaces_as_error_sample() {
        let mut parser = IostatParser::new();
        assert!(parser.feed("Device tps kB_read/s kB_wrtn/s").is_none());
        assert!(parser.feed("sda one two three").is_none());

        let sample = parser.feed("").expect("report completed");
        assert!(matches!(sample, Err(ReaderError::Parse { what: "tps", .. })));
    }

    #[test]
    fn short_row_is_rejected() {
        assert!(parse_iostat_row("sda 1.0").is_err());
    }
}

//! Filesystem space and inode usage from a `df` loop.

use async_trait::async_trait;

use super::command::{ChunkParser, StreamingCommand};
use super::{MetricReader, ReaderError};
use crate::core::point::{FsUsage, Measurement, MetricKind};

const DF_LOOP: &str = "while true; do \
    df --output=used,avail,itotal,iused,target -x tmpfs -x squashfs -x devtmpfs; \
    echo ---; sleep 1; done";

const SEPARATOR: &str = "---";

/// Collects `df` rows until the `---` separator, dropping each block's header.
#[derive(Debug, Default)]
pub struct DfParser {
    lines: Vec<String>,
}

impl DfParser {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ChunkParser for DfParser {
    type Output = Vec<FsUsage>;

    fn feed(&mut self, line: &str) -> Option<Result<Vec<FsUsage>, ReaderError>> {
        if line.trim() != SEPARATOR {
            self.lines.push(line.to_string());
            return None;
        }
        let lines = std::mem::take(&mut self.lines);
        Some(
            lines
                .iter()
                .skip(1)
                .filter(|row| !row.trim().is_empty())
                .map(|row| parse_df_row(row))
                .collect(),
        )
    }
}

/// Parse `used avail itotal iused target` into percentages.
pub fn parse_df_row(row: &str) -> Result<FsUsage, ReaderError> {
    let fields: Vec<&str> = row.split_whitespace().collect();
    if fields.len() < 5 {
        return Err(ReaderError::parse("df line", row));
    }
    let number = |i: usize, what: &'static str| {
        fields[i]
            .parse::<u64>()
            .map_err(|_| ReaderError::parse(what, row))
    };

    let used = number(0, "used")?;
    let avail = number(1, "avail")?;
    let inodes = number(2, "itotal")?;
    let inodes_used = number(3, "iused")?;

    Ok(FsUsage {
        // mount points may contain spaces
        path: fields[4..].join(" "),
        used_space: percent(used, used + avail),
        used_inode: percent(inodes_used, inodes),
    })
}

fn percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 * 100.0 / whole as f64
    }
}

pub struct UsedFsReader {
    df: StreamingCommand<DfParser>,
}

impl UsedFsReader {
    pub fn new() -> Self {
        Self {
            df: StreamingCommand::new("df", "sh", &["-c", DF_LOOP], DfParser::new),
        }
    }
}

#[async_trait]
impl MetricReader for UsedFsReader {
    fn kind(&self) -> MetricKind {
        MetricKind::UsedFs
    }

    async fn start(&self) -> Result<(), ReaderError> {
        self.df.start().await
    }

    async fn stop(&self) -> Result<(), ReaderError> {
        self.df.stop().await
    }

    async fn get(&self) -> Result<Measurement, ReaderError> {
        self.df.latest().map(Measurement::UsedFs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_block_between_separators() {
        let mut parser = DfParser::new();
        let output = [
            "    Used    Avail  Inodes  IUsed Mounted on",
            "20000000 80000000 1000000 700000 /",
            "     300     9700     100      6 /data",
            "---",
        ];

        let samples: Vec<_> = output.iter().filter_map(|l| parser.feed(l)).collect();
        assert_eq!(samples.len(), 1);

        let usage = samples.into_iter().next().unwrap().unwrap();
        pretty_assertions::assert_eq!(
            usage,
            vec![
                FsUsage {
                    path: "/".to_string(),
                    used_space: 20.0,
                    used_inode: 70.0,
                },
                FsUsage {
                    path: "/data".to_string(),
                    used_space: 3.0,
                    used_inode: 6.0,
                },
            ]
        );
    }

    #[test]
    fn zero_sized_filesystem_reports_zero_usage() {
        let usage = parse_df_row("0 0 0 0 /proc/fake").unwrap();
        assert_eq!(usage.used_space, 0.0);
        assert_eq!(usage.used_inode, 0.0);
    }

    #[test]
    fn keeps_spaces_in_mount_points() {
        let usage = parse_df_row("1 1 2 1 /media/usb stick").unwrap();
        assert_eq!(usage.path, "/media/usb stick");
    }

    #[test]
    fn rejects_non_numeric_counters() {
        assert!(matches!(
            parse_df_row("- 1 2 1 /"),
            Err(ReaderError::Parse { what: "used", .. })
        ));
    }
}

//! Command-line subscriber - prints one metric group as a table

use anyhow::{Context, Result};
use clap::ValueEnum;
use futures::StreamExt;

use crate::core::point::Stats;

/// Metric group printed by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Show {
    /// Load average
    La,
    /// CPU usage
    Cpu,
    /// Per-disk load
    Disk,
    /// Filesystem usage
    Fs,
}

impl Show {
    pub fn header(&self) -> &'static str {
        match self {
            Self::La => "Load Average\n  time   | load1 | load5 | load15",
            Self::Cpu => "Load CPU\n  time   | user  | system| idle",
            Self::Disk => "Load Disks\n  time   |   tps    |   read   |  write   |  name",
            Self::Fs => "Used File Systems\n  time   | use%  | IUse% |  path",
        }
    }

    /// Table rows for one stats message; absent groups print as `-`.
    pub fn rows(&self, stats: &Stats) -> Vec<String> {
        let time = stats.time.format("%H:%M:%S");
        match self {
            Self::La => vec![match &stats.load_avg {
                Some(la) => format!(
                    "{time} | {:5.2} | {:5.2} | {:5.2}",
                    la.load1, la.load5, la.load15
                ),
                None => format!("{time} |   -   |   -   |   -"),
            }],
            Self::Cpu => vec![match &stats.cpu {
                Some(cpu) => format!(
                    "{time} | {:5.2} | {:5.2} | {:5.2}",
                    cpu.user, cpu.system, cpu.idle
                ),
                None => format!("{time} |   -   |   -   |   -"),
            }],
            Self::Disk => std::iter::once(format!("{time} |          |          |          |"))
                .chain(stats.load_disks.iter().map(|disk| {
                    format!(
                        "         | {:8.2} | {:8.2} | {:8.2} | {}",
                        disk.tps, disk.kb_read, disk.kb_write, disk.name
                    )
                }))
                .collect(),
            Self::Fs => std::iter::once(format!("{time} |       |       |"))
                .chain(stats.used_fs.iter().map(|fs| {
                    format!(
                        "         | {:5.2} | {:5.2} | {}",
                        fs.used_space, fs.used_inode, fs.path
                    )
                }))
                .collect(),
        }
    }
}

/// Incremental Server-Sent Events decoder returning the `data` payload of
/// every complete event.
#[derive(Debug, Default)]
pub struct SseDecoder {
    /// Raw bytes of the unfinished event; a chunk may end inside a UTF-8
    /// sequence.
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer
            .extend(chunk.iter().copied().filter(|&byte| byte != b'\r'));

        let mut events = Vec::new();
        while let Some(end) = self.buffer.windows(2).position(|pair| pair == b"\n\n") {
            let block: Vec<u8> = self.buffer.drain(..end + 2).collect();
            let block = String::from_utf8_lossy(&block);
            let data: Vec<&str> = block
                .lines()
                .filter_map(|line| line.strip_prefix("data:"))
                .map(|value| value.strip_prefix(' ').unwrap_or(value))
                .collect();
            // comment-only blocks are keep-alives
            if !data.is_empty() {
                events.push(data.join("\n"));
            }
        }
        events
    }
}

/// Subscribe to `addr` and print every stats message until the server
/// closes the stream.
pub async fn run(addr: &str, show: Show, n: i64, m: i64) -> Result<()> {
    let url = format!("{}/stats", addr.trim_end_matches('/'));
    let response = reqwest::Client::new()
        .get(&url)
        .query(&[("n", n), ("m", m)])
        .send()
        .await
        .with_context(|| format!("cannot connect to {url}"))?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        anyhow::bail!("server answered {status}: {body}");
    }

    println!("{}", show.header());

    let mut decoder = SseDecoder::new();
    let mut body = response.bytes_stream();
    while let Some(chunk) = body.next().await {
        let chunk = chunk.context("stream interrupted")?;
        for data in decoder.push(&chunk) {
            let stats: Stats = serde_json::from_str(&data)
                .with_context(|| format!("malformed stats message {data:?}"))?;
            for row in show.rows(&stats) {
                println!("{row}");
            }
        }
    }

    tracing::debug!("server closed the stream");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::point::{DiskLoad, LoadAvg};
    use chrono::{TimeZone, Utc};
    use pretty_assertions::assert_eq;

    fn stats() -> Stats {
        Stats::empty(Utc.timestamp_opt(1_700_000_000, 0).unwrap())
    }

    #[test]
    fn decodes_events_split_across_chunks() {
        let mut decoder = SseDecoder::new();

        assert!(decoder.push(b"event: stats\nda").is_empty());
        assert!(decoder.push(b"ta: {\"a\":1}\n").is_empty());
        assert_eq!(decoder.push(b"\n:\n\nevent: stats\r\ndata: 2\r\n\r\n"), vec![
            "{\"a\":1}".to_string(),
            "2".to_string(),
        ]);
    }

    #[test]
    fn keeps_characters_split_between_chunks() {
        let event = "data: {\"mount\":\"/mnt/donn\u{e9}es\"}\r\n\r\n".as_bytes();
        // cut between the two bytes of the accented letter and inside the CRLF
        let accent = event.iter().position(|&byte| byte == 0xc3).unwrap();
        let crlf = event.len() - 3;

        let mut decoder = SseDecoder::new();
        assert!(decoder.push(&event[..accent + 1]).is_empty());
        assert!(decoder.push(&event[accent + 1..crlf]).is_empty());
        assert_eq!(decoder.push(&event[crlf..]), vec![
            "{\"mount\":\"/mnt/donn\u{e9}es\"}".to_string(),
        ]);
    }

    #[test]
    fn absent_group_prints_dashes() {
        assert_eq!(Show::La.rows(&stats()), vec!["22:13:20 |   -   |   -   |   -"]);
        assert_eq!(Show::Cpu.rows(&stats()), vec!["22:13:20 |   -   |   -   |   -"]);
    }

    #[test]
    fn formats_load_average() {
        let mut stats = stats();
        stats.load_avg = Some(LoadAvg {
            load1: 0.5,
            load5: 1.25,
            load15: 10.0,
        });
        assert_eq!(Show::La.rows(&stats), vec!["22:13:20 |  0.50 |  1.25 | 10.00"]);
    }

    #[test]
    fn lists_one_row_per_disk() {
        let mut stats = stats();
        stats.load_disks = vec![DiskLoad {
            name: "sda".to_string(),
            tps: 1.5,
            kb_read: 10.0,
            kb_write: 0.0,
        }];

        assert_eq!(
            Show::Disk.rows(&stats),
            vec![
                "22:13:20 |          |          |          |".to_string(),
                "         |     1.50 |    10.00 |     0.00 | sda".to_string(),
            ]
        );
    }
}

//! Long-running helper processes whose output is parsed into samples.
//!
//! Tools like `iostat` report rates over an interval, so instead of running
//! them once per tick the reader keeps one process alive, parses its output
//! as it streams in and hands out the latest complete sample.

use parking_lot::Mutex;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

use super::ReaderError;

/// Incremental line parser that yields a sample whenever a block of output
/// is complete.
pub trait ChunkParser: Send + 'static {
    type Output: Clone + Send + 'static;

    fn feed(&mut self, line: &str) -> Option<Result<Self::Output, ReaderError>>;
}

type Latest<T> = Arc<Mutex<Option<Result<T, String>>>>;

struct Running {
    child: Child,
    pump: JoinHandle<()>,
}

pub struct StreamingCommand<P: ChunkParser> {
    name: &'static str,
    program: &'static str,
    args: Vec<String>,
    new_parser: fn() -> P,
    latest: Latest<P::Output>,
    running: tokio::sync::Mutex<Option<Running>>,
}

impl<P: ChunkParser> StreamingCommand<P> {
    pub fn new(name: &'static str, program: &'static str, args: &[&str], new_parser: fn() -> P) -> Self {
        Self {
            name,
            program,
            args: args.iter().map(|a| a.to_string()).collect(),
            new_parser,
            latest: Arc::new(Mutex::new(None)),
            running: tokio::sync::Mutex::new(None),
        }
    }

    /// Spawn the helper unless it is already running.
    pub async fn start(&self) -> Result<(), ReaderError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Ok(());
        }

        let mut child = Command::new(self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| self.error(format!("cannot start: {e}")))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| self.error("stdout was not captured"))?;

        let latest = Arc::clone(&self.latest);
        let mut parser = (self.new_parser)();
        let name = self.name;
        let pump = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if let Some(sample) = parser.feed(&line) {
                    *latest.lock() = Some(sample.map_err(|e| e.to_string()));
                }
            }
            tracing::debug!(command = name, "helper output closed");
        });

        *running = Some(Running { child, pump });
        Ok(())
    }

    /// Kill the helper and forget its last sample.
    pub async fn stop(&self) -> Result<(), ReaderError> {
        let Some(mut running) = self.running.lock().await.take() else {
            return Ok(());
        };

        running.pump.abort();
        let killed = running.child.kill().await;
        let _ = running.pump.await;
        *self.latest.lock() = None;
        killed.map_err(|e| self.error(format!("cannot stop: {e}")))
    }

    /// Latest complete sample, or the error its parsing produced.
    pub fn latest(&self) -> Result<P::Output, ReaderError> {
        match self.latest.lock().clone() {
            Some(Ok(sample)) => Ok(sample),
            Some(Err(message)) => Err(self.error(message)),
            None => Err(ReaderError::NoData),
        }
    }

    fn error(&self, message: impl Into<String>) -> ReaderError {
        ReaderError::Command {
            command: self.name,
            message: message.into(),
        }
    }
}

/// Run `program` once and fail if it cannot be spawned or complains on
/// stderr.
pub async fn check_installed(
    name: &'static str,
    program: &str,
    args: &[&str],
) -> Result<(), ReaderError> {
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| ReaderError::Command {
            command: name,
            message: format!("cannot be used: {e}"),
        })?;

    if !output.stderr.is_empty() {
        return Err(ReaderError::Command {
            command: name,
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    /// Emits the number of lines seen between `--` separators.
    struct CountLines(usize);

    impl ChunkParser for CountLines {
        type Output = usize;

        fn feed(&mut self, line: &str) -> Option<Result<usize, ReaderError>> {
            if line == "--" {
                let count = std::mem::take(&mut self.0);
                return Some(Ok(count));
            }
            self.0 += 1;
            None
        }
    }

    #[test]
    fn latest_without_start_is_no_data() {
        let command = StreamingCommand::new("count", "sh", &[], || CountLines(0));
        assert!(matches!(command.latest(), Err(ReaderError::NoData)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn streams_samples_until_stopped() {
        let command = StreamingCommand::new(
            "count",
            "sh",
            &["-c", "printf 'a\\nb\\n--\\n'; sleep 30"],
            || CountLines(0),
        );
        command.start().await.expect("helper starts");

        let mut sample = None;
        for _ in 0..50 {
            if let Ok(value) = command.latest() {
                sample = Some(value);
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(sample, Some(2));

        command.stop().await.expect("helper stops");
        assert!(matches!(command.latest(), Err(ReaderError::NoData)));
    }

    #[tokio::test]
    async fn missing_program_fails_to_start() {
        let command = StreamingCommand::new(
            "missing",
            "symon-definitely-not-installed",
            &[],
            || CountLines(0),
        );
        assert!(matches!(
            command.start().await,
            Err(ReaderError::Command { .. })
        ));
    }
}

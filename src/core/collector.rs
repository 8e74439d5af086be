//! Per-second tick scheduler.
//!
//! The collector owns the history. Every second it opens a point for the
//! current second, asks each collection worker to fill its field, retires
//! points that fell out of the retention window and, while clients are
//! registered, hands a copy of the completed points to the client registry.

use futures::future::join_all;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::AppConfig;
use crate::core::clock::Clock;
use crate::core::events::{
    stopped, CollectorCommand, CommandReceiver, MetricsData, MetricsSender,
};
use crate::core::history::History;
use crate::core::point::{truncate_to_second, MetricKind};
use crate::core::worker::{self, TimePoint};
use crate::readers::ReaderSet;

pub const TICK: Duration = Duration::from_secs(1);
/// Upper bound for mounting all readers.
pub const MOUNT_DEADLINE: Duration = Duration::from_secs(5);
/// A worker still busy with the previous second misses the next one.
const WORKER_QUEUE_LEN: usize = 1;

#[derive(Default)]
struct Tasks {
    tick_loop: Option<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
    readers: ReaderSet,
}

pub struct Collector {
    history: History,
    clock: Arc<dyn Clock>,
    pause_without_clients: bool,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Tasks>,
}

impl Collector {
    pub fn new(config: &AppConfig, clock: Arc<dyn Clock>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            history: History::new(config.max_seconds),
            clock,
            pause_without_clients: config.pause_without_clients,
            shutdown,
            tasks: Mutex::new(Tasks::default()),
        }
    }

    #[cfg(test)]
    pub fn history(&self) -> &History {
        &self.history
    }

    /// Mount the readers, spawn one worker per reader and begin ticking.
    pub async fn start(
        &self,
        readers: ReaderSet,
        from_clients: CommandReceiver,
        to_clients: MetricsSender,
    ) {
        mount(&readers).await;

        let mut workers = Vec::with_capacity(readers.len());
        let mut queues = Vec::with_capacity(readers.len());
        for reader in readers.iter() {
            let (tx, rx) = mpsc::channel(WORKER_QUEUE_LEN);
            workers.push(tokio::spawn(worker::run(
                Arc::clone(reader),
                self.history.clone(),
                rx,
                self.shutdown.subscribe(),
            )));
            queues.push((reader.kind(), tx));
        }

        let tick_loop = TickLoop {
            history: self.history.clone(),
            clock: Arc::clone(&self.clock),
            pause_without_clients: self.pause_without_clients,
            workers: queues,
            from_clients,
            to_clients,
            shutdown: self.shutdown.subscribe(),
        };

        let mut tasks = self.tasks.lock();
        tasks.tick_loop = Some(tokio::spawn(tick_loop.run()));
        tasks.workers = workers;
        tasks.readers = readers;

        tracing::debug!(
            metrics = ?tasks.readers.kinds(),
            max_seconds = self.history.max_seconds(),
            "collector is started"
        );
    }

    /// Stop ticking, wait for the workers and unmount the readers, all
    /// within `deadline`.
    pub async fn stop(&self, deadline: Duration) {
        let started = Instant::now();
        self.shutdown.send_replace(true);
        let tasks = std::mem::take(&mut *self.tasks.lock());

        if let Some(mut tick_loop) = tasks.tick_loop {
            if tokio::time::timeout(deadline, &mut tick_loop).await.is_err() {
                tracing::warn!("collector loop did not stop in time, aborting it");
                tick_loop.abort();
            }
        }

        for mut worker in tasks.workers {
            let remaining = deadline.saturating_sub(started.elapsed());
            if tokio::time::timeout(remaining, &mut worker).await.is_err() {
                worker.abort();
            }
        }

        unmount(&tasks.readers, deadline.saturating_sub(started.elapsed())).await;
        tracing::debug!(retained = self.history.len(), "collector is stopped");
    }
}

async fn mount(readers: &ReaderSet) {
    let starts = readers.iter().map(|reader| async move {
        let kind = reader.kind();
        match tokio::time::timeout(MOUNT_DEADLINE, reader.start()).await {
            Ok(Ok(())) => tracing::debug!(metric = %kind, "reader mounted"),
            Ok(Err(e)) => tracing::debug!(metric = %kind, error = %e, "cannot mount reader"),
            Err(_) => tracing::debug!(metric = %kind, "reader mount timed out"),
        }
    });
    join_all(starts).await;
}

async fn unmount(readers: &ReaderSet, deadline: Duration) {
    let stops = readers.iter().map(|reader| async move {
        let kind = reader.kind();
        match tokio::time::timeout(deadline, reader.stop()).await {
            Ok(Ok(())) => tracing::debug!(metric = %kind, "reader unmounted"),
            Ok(Err(e)) => tracing::debug!(metric = %kind, error = %e, "cannot unmount reader"),
            Err(_) => tracing::debug!(metric = %kind, "reader unmount timed out"),
        }
    });
    join_all(stops).await;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopState {
    /// Not ticking; waiting for a client to show up.
    Idle,
    Running,
}

struct TickLoop {
    history: History,
    clock: Arc<dyn Clock>,
    pause_without_clients: bool,
    workers: Vec<(MetricKind, mpsc::Sender<TimePoint>)>,
    from_clients: CommandReceiver,
    to_clients: MetricsSender,
    shutdown: watch::Receiver<bool>,
}

impl TickLoop {
    async fn run(mut self) {
        let mut state = if self.pause_without_clients {
            LoopState::Idle
        } else {
            LoopState::Running
        };
        let mut ticker = new_ticker();

        loop {
            // the slot holds the registry's current state, not a queue of edges
            let have_clients =
                *self.from_clients.borrow_and_update() == CollectorCommand::HaveClients;
            if self.pause_without_clients {
                match (state, have_clients) {
                    (LoopState::Idle, true) => {
                        ticker = new_ticker();
                        state = LoopState::Running;
                        tracing::debug!("collection resumed");
                    }
                    (LoopState::Running, false) => {
                        state = LoopState::Idle;
                        tracing::debug!("collection paused");
                    }
                    _ => {}
                }
            }

            match state {
                LoopState::Idle => {
                    tokio::select! {
                        _ = stopped(&mut self.shutdown) => break,
                        changed = self.from_clients.changed() => if changed.is_err() {
                            break;
                        },
                    }
                }
                LoopState::Running => {
                    tokio::select! {
                        _ = stopped(&mut self.shutdown) => break,
                        changed = self.from_clients.changed() => if changed.is_err() {
                            break;
                        },
                        _ = ticker.tick() => self.tick(have_clients),
                    }
                }
            }
        }

        tracing::debug!("collector loop stopped");
    }

    fn tick(&self, have_clients: bool) {
        let now = truncate_to_second(self.clock.now());
        self.history.open(now);

        for (kind, queue) in &self.workers {
            if queue.try_send(TimePoint { time: now }).is_err() {
                tracing::trace!(metric = %kind, "worker busy, second skipped");
            }
        }

        let pruned = self.history.prune(now);
        if pruned > 0 {
            tracing::trace!(pruned, "retired old points");
        }

        if have_clients {
            let data = MetricsData {
                time: now,
                points: self.history.snapshot(now),
            };
            // a registry still busy with the previous snapshot misses this one
            let _ = self.to_clients.try_send(data);
        }
    }
}

fn new_ticker() -> tokio::time::Interval {
    let mut ticker = tokio::time::interval(TICK);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker
}

//! Client registry: subscribers, their delivery schedules and the
//! have/no-clients back channel to the collector.

use chrono::{DateTime, Duration, Utc};
use futures::Stream;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::core::clock::Clock;
use crate::core::events::{stopped, CollectorCommand, CommandSender, MetricsData, MetricsReceiver};
use crate::core::point::{truncate_to_second, Stats};
use crate::core::snapshot::make_stats;

/// Capacity of every client's output queue; a slow client loses stats
/// beyond this.
pub const MAX_QUEUE_LEN: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientsError {
    #[error("{name} = {value} is out of range [1, {max}]")]
    OutOfRange {
        name: &'static str,
        value: i64,
        max: i64,
    },

    #[error("service is closing")]
    Stopped,
}

struct Client {
    id: Uuid,
    n: i64,
    m: i64,
    next_due: DateTime<Utc>,
    tx: mpsc::Sender<Arc<Stats>>,
    dead: Arc<AtomicBool>,
}

impl Client {
    fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Acquire)
    }
}

struct Registry {
    clients: Vec<Client>,
    stopped: bool,
}

struct Shared {
    registry: Mutex<Registry>,
    to_collector: CommandSender,
    clock: Arc<dyn Clock>,
    max_seconds: i64,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    /// Publish whether clients exist. The slot always holds the registry's
    /// current state; the collector is woken only when it flips.
    fn signal(&self, registry: &Registry) {
        let wanted = if registry.clients.is_empty() {
            CollectorCommand::NoClients
        } else {
            CollectorCommand::HaveClients
        };
        let flipped = self.to_collector.send_if_modified(|current| {
            if *current == wanted {
                return false;
            }
            *current = wanted;
            true
        });
        if flipped {
            tracing::trace!(command = ?wanted, "collector signalled");
        }
    }
}

/// Handle to the client registry; clones share the same registry.
#[derive(Clone)]
pub struct Clients {
    shared: Arc<Shared>,
}

impl Clients {
    pub fn new(max_seconds: u32, clock: Arc<dyn Clock>, to_collector: CommandSender) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                registry: Mutex::new(Registry {
                    clients: Vec::new(),
                    stopped: false,
                }),
                to_collector,
                clock,
                max_seconds: i64::from(max_seconds),
                shutdown,
                task: Mutex::new(None),
            }),
        }
    }

    pub fn max_seconds(&self) -> i64 {
        self.shared.max_seconds
    }

    /// Consume snapshots from the collector until it closes the queue or
    /// `stop` is called.
    pub fn start(&self, from_collector: MetricsReceiver) {
        let clients = self.clone();
        let shutdown = self.shared.shutdown.subscribe();
        let handle = tokio::spawn(clients.run(from_collector, shutdown));
        *self.shared.task.lock() = Some(handle);
    }

    async fn run(self, mut from_collector: MetricsReceiver, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = stopped(&mut shutdown) => break,
                data = from_collector.recv() => match data {
                    Some(data) => self.send_stats(&data),
                    None => break,
                },
            }
        }
        self.close();
        tracing::debug!("client registry loop stopped");
    }

    /// Register a client that wants stats every `n` seconds averaged over
    /// the last `m` seconds.
    pub fn new_client(&self, n: i64, m: i64) -> Result<Subscription, ClientsError> {
        let max = self.shared.max_seconds;
        check_range("n", n, max)?;
        check_range("m", m, max)?;

        let (tx, rx) = mpsc::channel(MAX_QUEUE_LEN);
        let dead = Arc::new(AtomicBool::new(false));
        let id = Uuid::new_v4();
        let now = truncate_to_second(self.shared.clock.now());

        {
            let mut registry = self.shared.registry.lock();
            if registry.stopped {
                return Err(ClientsError::Stopped);
            }
            registry.clients.push(Client {
                id,
                n,
                m,
                // the first stats go out once a full window has been collected
                next_due: now + Duration::seconds(m),
                tx,
                dead: Arc::clone(&dead),
            });
            self.shared.signal(&registry);
        }

        tracing::debug!(client = %id, n, m, "client registered");
        Ok(Subscription { id, rx, dead })
    }

    /// Deliver stats to every client due at `data.time` and sweep the
    /// clients that went away.
    pub fn send_stats(&self, data: &MetricsData) {
        let now = data.time;

        let due: Vec<(Uuid, i64, mpsc::Sender<Arc<Stats>>)> = {
            let mut registry = self.shared.registry.lock();
            registry
                .clients
                .iter_mut()
                .filter(|client| !client.is_dead() && client.next_due <= now)
                .map(|client| {
                    client.next_due = now + Duration::seconds(client.n);
                    (client.id, client.m, client.tx.clone())
                })
                .collect()
        };

        let mut by_window: BTreeMap<i64, Arc<Stats>> = BTreeMap::new();
        let mut gone = Vec::new();
        for (id, m, tx) in due {
            let stats = by_window
                .entry(m)
                .or_insert_with(|| Arc::new(make_stats(data, m)));
            match tx.try_send(Arc::clone(stats)) {
                Ok(()) | Err(TrySendError::Full(_)) => {}
                Err(TrySendError::Closed(_)) => gone.push(id),
            }
        }

        let mut registry = self.shared.registry.lock();
        let before = registry.clients.len();
        registry
            .clients
            .retain(|client| !client.is_dead() && !gone.contains(&client.id));
        let swept = before - registry.clients.len();
        if swept > 0 {
            tracing::debug!(swept, remaining = registry.clients.len(), "removed clients");
        }
        self.shared.signal(&registry);
    }

    /// Number of clients that have not unsubscribed.
    pub fn len(&self) -> usize {
        self.shared
            .registry
            .lock()
            .clients
            .iter()
            .filter(|client| !client.is_dead())
            .count()
    }

    /// Reject new clients, stop the loop within `deadline` and close every
    /// client queue.
    pub async fn stop(&self, deadline: std::time::Duration) {
        self.shared.registry.lock().stopped = true;
        self.shared.shutdown.send_replace(true);

        let task = self.shared.task.lock().take();
        if let Some(mut task) = task {
            if tokio::time::timeout(deadline, &mut task).await.is_err() {
                tracing::warn!("client registry loop did not stop in time, aborting it");
                task.abort();
            }
        }

        self.close();
        tracing::debug!("client registry is stopped");
    }

    fn close(&self) {
        let clients = {
            let mut registry = self.shared.registry.lock();
            registry.stopped = true;
            std::mem::take(&mut registry.clients)
        };
        if !clients.is_empty() {
            tracing::debug!(count = clients.len(), "closing client queues");
        }
    }
}

fn check_range(name: &'static str, value: i64, max: i64) -> Result<(), ClientsError> {
    if (1..=max).contains(&value) {
        Ok(())
    } else {
        Err(ClientsError::OutOfRange { name, value, max })
    }
}

/// Receiving end of one client. Dropping it unsubscribes.
pub struct Subscription {
    id: Uuid,
    rx: mpsc::Receiver<Arc<Stats>>,
    dead: Arc<AtomicBool>,
}

impl Subscription {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Next stats, or `None` once the registry closed the queue.
    pub async fn recv(&mut self) -> Option<Arc<Stats>> {
        self.rx.recv().await
    }

    #[cfg(test)]
    pub fn try_recv(&mut self) -> Result<Arc<Stats>, mpsc::error::TryRecvError> {
        self.rx.try_recv()
    }

    /// Mark the client for removal on the next sweep.
    pub fn cancel(&self) {
        if !self.dead.swap(true, Ordering::AcqRel) {
            tracing::debug!(client = %self.id, "client unsubscribed");
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = Arc<Stats>> {
        futures::stream::unfold(self, |mut subscription| async move {
            let stats = subscription.recv().await?;
            Some((stats, subscription))
        })
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

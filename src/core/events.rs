//! Messages exchanged between the collector and the client registry

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};

use crate::core::point::Points;

/// Capacity of the collector → client registry snapshot queue.
pub const SNAPSHOT_QUEUE_LEN: usize = 1;

/// Tells the collector whether anybody is listening.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectorCommand {
    HaveClients,
    NoClients,
}

/// One tick worth of data for the client registry: the tick's second and a
/// copy of every completed point still retained.
#[derive(Debug, Clone)]
pub struct MetricsData {
    pub time: DateTime<Utc>,
    pub points: Points,
}

/// Single slot holding the registry's current state; a newer command
/// replaces one the collector has not looked at yet.
pub type CommandSender = watch::Sender<CollectorCommand>;
pub type CommandReceiver = watch::Receiver<CollectorCommand>;
pub type MetricsSender = mpsc::Sender<MetricsData>;
pub type MetricsReceiver = mpsc::Receiver<MetricsData>;

pub fn command_channel() -> (CommandSender, CommandReceiver) {
    watch::channel(CollectorCommand::NoClients)
}

pub fn metrics_channel() -> (MetricsSender, MetricsReceiver) {
    mpsc::channel(SNAPSHOT_QUEUE_LEN)
}

/// Resolves once shutdown has been requested or the sender is gone.
pub async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn stopped_resolves_on_signal_and_on_drop() {
        let (tx, mut rx) = watch::channel(false);
        let waiter = tokio::spawn(async move { stopped(&mut rx).await });
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("stop signal observed")
            .unwrap();

        let (tx, mut rx) = watch::channel(false);
        drop(tx);
        tokio::time::timeout(Duration::from_secs(1), stopped(&mut rx))
            .await
            .expect("dropped sender observed");
    }

    #[tokio::test]
    async fn latest_command_replaces_an_unread_one() {
        let (tx, mut rx) = command_channel();
        tx.send_replace(CollectorCommand::HaveClients);
        tx.send_replace(CollectorCommand::NoClients);
        tx.send_replace(CollectorCommand::HaveClients);

        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), CollectorCommand::HaveClients);
        assert!(!rx.has_changed().unwrap());
    }
}

//! Daemon orchestrator: wires the collector, the client registry and the
//! HTTP server together and runs them until a termination signal.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::core::clients::Clients;
use crate::core::clock::{Clock, SystemClock};
use crate::core::collector::Collector;
use crate::core::events::{command_channel, metrics_channel};
use crate::readers::ReaderSet;
use crate::server::{self, Server};

/// Budget for each shutdown step.
pub const SOFT_SHUTDOWN: Duration = Duration::from_secs(4);
/// Budget for the whole shutdown.
pub const HARD_SHUTDOWN: Duration = Duration::from_secs(5);

pub struct App {
    config: Config,
    clock: Arc<dyn Clock>,
}

impl App {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            clock: Arc::new(SystemClock),
        }
    }

    pub async fn run(self) -> Result<()> {
        let readers = ReaderSet::from_config(&self.config.metric);
        if readers.is_empty() {
            tracing::warn!("every metric is disabled, clients will only get timestamps");
        }

        let (to_collector, from_clients) = command_channel();
        let (to_clients, from_collector) = metrics_channel();

        let clients = Clients::new(
            self.config.app.max_seconds,
            Arc::clone(&self.clock),
            to_collector,
        );
        let router = server::router(clients.clone(), readers.kinds());
        let mut server = Server::bind(self.config.listen_addr()?, router).await?;

        let collector = Collector::new(&self.config.app, Arc::clone(&self.clock));
        clients.start(from_collector);
        collector.start(readers, from_clients, to_clients).await;

        tracing::info!(addr = %server.local_addr(), "system monitor is running");
        wait_for_signal().await?;
        tracing::info!("shutting down");

        let shutdown = async {
            server.begin_shutdown();
            collector.stop(SOFT_SHUTDOWN).await;
            clients.stop(SOFT_SHUTDOWN).await;
            server.wait(SOFT_SHUTDOWN).await
        };
        match tokio::time::timeout(HARD_SHUTDOWN, shutdown).await {
            Ok(result) => result?,
            Err(_) => tracing::warn!("shutdown did not finish in time"),
        }

        tracing::info!("system monitor is stopped");
        Ok(())
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        _ = terminate.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_signal() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}

//! Collection worker: one per metric kind, fills that kind's field of each
//! second's point.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

use crate::core::events::stopped;
use crate::core::history::History;
use crate::readers::MetricReader;

/// Upper bound for a single `get`, just under one tick.
pub const READ_DEADLINE: Duration = Duration::from_millis(950);

/// Request to measure the second starting at `time`.
#[derive(Debug, Clone, Copy)]
pub struct TimePoint {
    pub time: DateTime<Utc>,
}

/// Serve write requests until shutdown or until the request queue closes.
pub async fn run(
    reader: Arc<dyn MetricReader>,
    history: History,
    mut requests: mpsc::Receiver<TimePoint>,
    mut shutdown: watch::Receiver<bool>,
) {
    let kind = reader.kind();

    loop {
        let request = tokio::select! {
            _ = stopped(&mut shutdown) => break,
            request = requests.recv() => match request {
                Some(request) => request,
                None => break,
            },
        };

        let result = tokio::select! {
            _ = stopped(&mut shutdown) => break,
            result = tokio::time::timeout(READ_DEADLINE, reader.get()) => result,
        };

        match result {
            // deadline hit, the metric is simply missing for this second
            Err(_) => continue,
            Ok(Err(e)) => {
                tracing::debug!(metric = %kind, error = %e, "cannot get metric");
            }
            Ok(Ok(measurement)) if measurement.kind() != kind => {
                tracing::warn!(
                    metric = %kind,
                    got = %measurement.kind(),
                    "reader returned a measurement of another kind"
                );
            }
            Ok(Ok(measurement)) => {
                history.update(request.time, |point| point.apply(measurement));
            }
        }
    }

    tracing::debug!(metric = %kind, "collection worker stopped");
}

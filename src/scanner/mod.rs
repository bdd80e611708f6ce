pub mod protocols;
pub mod targets;

use std::{sync::Arc, time::Duration};

use tokio::{
    sync::{Semaphore, mpsc::UnboundedSender},
    task::JoinSet,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::{
    config::Config,
    database::{ServerRecord, ServerStore, Upsert},
    processing::{ProbeOutcome, ScanEvent},
    terminal_colors::*,
};

use self::{
    protocols::{ProbeResult, Prober, ServerStatus},
    targets::{Endpoint, EndpointSource},
};

#[derive(Debug, Clone, Copy)]
pub struct ScanSettings {
    /// How many endpoints are drawn per batch.
    pub batch_size: usize,
    /// How many probes can be in flight at once.
    pub concurrency: usize,
    pub timeout: Duration,
}

impl ScanSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            batch_size: config.scanner.batch_size,
            concurrency: config.scanner.concurrency,
            timeout: config.scanner.timeout(),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchReport {
    pub dispatched: usize,
    pub found: usize,
    /// Whether we stopped dispatching early because of a cancellation.
    pub cancelled: bool,
}

/// Pings endpoints in batches and saves every server that answers.
///
/// A batch is only started once every probe of the previous one is done, and
/// cancellation is only checked between probes, so anything already in flight
/// gets to finish (or time out) before [`Scanner::run`] returns.
pub struct Scanner {
    source: Arc<dyn EndpointSource>,
    prober: Arc<Prober>,
    store: Arc<ServerStore>,
    settings: ScanSettings,
}

impl Scanner {
    pub fn new(
        source: Arc<dyn EndpointSource>,
        prober: Arc<Prober>,
        store: Arc<ServerStore>,
        settings: ScanSettings,
    ) -> Self {
        Self {
            source,
            prober,
            store,
            settings,
        }
    }

    /// Scan until `cancel` fires, or until `max_batches` batches were done if
    /// it's set. Returns the number of batches that were started.
    pub async fn run(
        &self,
        cancel: &CancellationToken,
        events: &UnboundedSender<ScanEvent>,
        max_batches: Option<u64>,
    ) -> u64 {
        let mut batches = 0;
        while !cancel.is_cancelled() {
            if max_batches.is_some_and(|max_batches| batches >= max_batches) {
                debug!("stopping after {batches} batches");
                break;
            }

            let batch = self.next_batch();
            let report = self.run_batch(batch, cancel, events).await;
            batches += 1;
            debug!(
                "batch {batches}: dispatched {}, found {}",
                report.dispatched, report.found
            );
            // the aggregator might be gone if we're shutting down, that's fine
            let _ = events.send(ScanEvent::BatchDone { batch: batches });

            if report.cancelled {
                break;
            }
        }
        batches
    }

    fn next_batch(&self) -> Vec<Endpoint> {
        (0..self.settings.batch_size)
            .map(|_| self.source.next_endpoint())
            .collect()
    }

    /// Probe every endpoint in the batch and wait for all of them.
    pub async fn run_batch(
        &self,
        batch: Vec<Endpoint>,
        cancel: &CancellationToken,
        events: &UnboundedSender<ScanEvent>,
    ) -> BatchReport {
        let semaphore = Arc::new(Semaphore::new(self.settings.concurrency.max(1)));
        let mut tasks = JoinSet::new();
        let mut report = BatchReport::default();

        for endpoint in batch {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    report.cancelled = true;
                    break;
                }
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    // only happens if the semaphore is closed, which we never do
                    Err(_) => break,
                },
            };
            report.dispatched += 1;

            let prober = self.prober.clone();
            let store = self.store.clone();
            let events = events.clone();
            let timeout = self.settings.timeout;
            tasks.spawn(async move {
                let _permit = permit;

                let outcome = match prober.probe(&endpoint, timeout).await {
                    ProbeResult::Success(status) => {
                        let upsert = persist(store, &endpoint, &status).await;
                        ProbeOutcome::Found { status, upsert }
                    }
                    ProbeResult::Failure => ProbeOutcome::Missed,
                };
                let found = matches!(outcome, ProbeOutcome::Found { .. });
                let _ = events.send(ScanEvent::Probed { endpoint, outcome });
                found
            });
        }

        while let Some(result) = tasks.join_next().await {
            match result {
                Ok(true) => report.found += 1,
                Ok(false) => {}
                Err(err) => error!("probe task failed: {err}"),
            }
        }

        report
    }
}

/// Save a server as soon as it's found. A failed write is reported and the
/// scan goes on.
async fn persist(store: Arc<ServerStore>, endpoint: &Endpoint, status: &ServerStatus) -> Option<Upsert> {
    let record = ServerRecord::from_status(endpoint.clone(), status);
    let result = match tokio::task::spawn_blocking(move || store.append(record)).await {
        Ok(result) => result,
        Err(err) => Err(eyre::eyre!("store task failed: {err}")),
    };
    match result {
        Ok(upsert) => Some(upsert),
        Err(err) => {
            error!("couldn't save {endpoint}: {err:#}");
            eprintln!("{RED}couldn't save {endpoint}: {err:#}{RESET}");
            None
        }
    }
}

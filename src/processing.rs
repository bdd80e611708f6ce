//! Counting what the scanner finds.
//!
//! Probe tasks never touch shared counters. They send a [`ScanEvent`] down a
//! channel and one aggregator owns the totals, prints the found servers and
//! the periodic progress lines.

use tokio::{sync::mpsc, task::JoinHandle};
use tracing::info;

use crate::{
    database::Upsert,
    scanner::{
        protocols::{ProtocolKind, ServerStatus},
        targets::Endpoint,
    },
    terminal_colors::*,
};

#[derive(Debug)]
pub enum ScanEvent {
    /// One endpoint finished, successfully or not.
    Probed {
        endpoint: Endpoint,
        outcome: ProbeOutcome,
    },
    /// Every probe of the batch has finished.
    BatchDone { batch: u64 },
}

#[derive(Debug)]
pub enum ProbeOutcome {
    Found {
        status: ServerStatus,
        /// `None` if saving it failed.
        upsert: Option<Upsert>,
    },
    Missed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanTotals {
    pub batches: u64,
    pub processed: u64,
    pub found: u64,
    /// Found servers that weren't in the store yet.
    pub new_servers: u64,
}

pub struct Aggregator {
    totals: ScanTotals,
    progress_every: u64,
}

impl Aggregator {
    pub fn new(progress_every: u64) -> Self {
        Self {
            totals: ScanTotals::default(),
            progress_every: progress_every.max(1),
        }
    }

    pub fn totals(&self) -> ScanTotals {
        self.totals
    }

    /// Update the totals, and return the text that should be shown for the
    /// event if there is any.
    pub fn handle(&mut self, event: ScanEvent) -> Option<String> {
        match event {
            ScanEvent::Probed { endpoint, outcome } => {
                self.totals.processed += 1;
                match outcome {
                    ProbeOutcome::Found { status, upsert } => {
                        self.totals.found += 1;
                        if upsert == Some(Upsert::Inserted) {
                            self.totals.new_servers += 1;
                        }
                        Some(found_server_block(&endpoint, &status, upsert))
                    }
                    ProbeOutcome::Missed => None,
                }
            }
            ScanEvent::BatchDone { batch } => {
                self.totals.batches = self.totals.batches.max(batch);
                if batch % self.progress_every == 0 {
                    Some(self.progress_line())
                } else {
                    None
                }
            }
        }
    }

    pub fn progress_line(&self) -> String {
        format!(
            "{GRAY}Processed {BOLD}{}{RESET}{GRAY} addresses... Found {BOLD}{}{RESET}{GRAY} servers so far ({} new){RESET}",
            self.totals.processed, self.totals.found, self.totals.new_servers
        )
    }
}

/// The block printed as soon as a server answers.
pub fn found_server_block(endpoint: &Endpoint, status: &ServerStatus, upsert: Option<Upsert>) -> String {
    let label = match upsert {
        Some(Upsert::Inserted) => format!("{BLUE}{BOLD}Found new server{RESET}"),
        Some(Upsert::Updated) => format!("{GREEN}{BOLD}Found server again{RESET}"),
        None => format!("{YELLOW}{BOLD}Found server (not saved){RESET}"),
    };

    let mut lines = vec![
        format!("{label} {BOLD}{endpoint}{RESET} {GRAY}via {}{RESET}", status.protocol),
        format!(
            "  Players: {}/{}",
            status.players_online, status.players_max
        ),
        format!("  Version: {}", status.version),
    ];
    if status.protocol == ProtocolKind::Query {
        if let Some(software) = &status.software {
            lines.push(format!("  Software: {software}"));
        }
        if let Some(plugin_count) = status.plugin_count {
            lines.push(format!("  Plugins: {plugin_count}"));
        }
    }
    let description = status.description.trim();
    if !description.is_empty() {
        lines.push(format!("  Description: {ITALIC}{description}{RESET}"));
    }
    if let Some(latency_ms) = status.latency_ms {
        lines.push(format!("  Latency: {latency_ms:.0}ms"));
    }
    lines.join("\n")
}

/// Consume events until every sender is dropped, then hand back the totals.
///
/// Runs on the blocking pool since all it does is print.
pub fn spawn_aggregator(
    mut events: mpsc::UnboundedReceiver<ScanEvent>,
    progress_every: u64,
) -> JoinHandle<ScanTotals> {
    tokio::task::spawn_blocking(move || {
        let mut aggregator = Aggregator::new(progress_every);
        while let Some(event) = events.blocking_recv() {
            let is_batch_done = matches!(event, ScanEvent::BatchDone { .. });
            if let Some(text) = aggregator.handle(event) {
                println!("{text}");
            }
            if is_batch_done {
                let totals = aggregator.totals();
                info!(
                    "batch {} done, {} addresses processed, {} servers found",
                    totals.batches, totals.processed, totals.found
                );
            }
        }
        aggregator.totals()
    })
}

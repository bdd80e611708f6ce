mod minecraft;
mod query;

use std::{fmt, time::Duration};

use chrono::{NaiveDateTime, SubsecRound};
use futures_util::future::BoxFuture;
use tracing::trace;

pub use minecraft::Minecraft;
pub use query::Query;

use crate::{config::Config, scanner::targets::Endpoint};

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("timed out")]
    Timeout,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("invalid response: {0}")]
    Invalid(String),
    #[error("incomplete response, expected {expected_length} bytes")]
    Incomplete { expected_length: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolKind {
    /// The server list ping over TCP.
    Status,
    /// The GameSpy4 query protocol over UDP.
    Query,
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolKind::Status => f.write_str("status"),
            ProtocolKind::Query => f.write_str("query"),
        }
    }
}

/// What a server told us about itself.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerStatus {
    pub protocol: ProtocolKind,
    pub players_online: u32,
    /// Not necessarily bigger than `players_online`, plenty of servers lie.
    pub players_max: u32,
    pub version: String,
    pub description: String,
    /// Only known from the query protocol.
    pub software: Option<String>,
    pub plugin_count: Option<u32>,
    /// Only known from the status protocol.
    pub latency_ms: Option<f64>,
    pub timestamp: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProbeResult {
    Success(ServerStatus),
    Failure,
}

/// One way of asking a server for its status.
pub trait Protocol: Send + Sync {
    fn kind(&self) -> ProtocolKind;

    /// Connect to the endpoint and ask for its status. [`Prober`] gives up
    /// after `timeout`, so optional steps should fit in what's left of it.
    fn query<'a>(
        &'a self,
        endpoint: &'a Endpoint,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<ServerStatus, ProbeError>>;
}

/// Tries each protocol in order, the first one that answers wins.
pub struct Prober {
    protocols: Vec<Box<dyn Protocol>>,
    /// The timeout for every protocol after the first one. Uses the timeout
    /// passed to [`Self::probe`] if unset.
    fallback_timeout: Option<Duration>,
}

impl Prober {
    pub fn new(protocols: Vec<Box<dyn Protocol>>) -> Self {
        Self {
            protocols,
            fallback_timeout: None,
        }
    }

    pub fn with_fallback_timeout(mut self, timeout: Duration) -> Self {
        self.fallback_timeout = Some(timeout);
        self
    }

    /// The status ping followed by the query protocol, unless the fallback is
    /// disabled.
    pub fn from_config(config: &Config) -> Self {
        let mut protocols: Vec<Box<dyn Protocol>> =
            vec![Box::new(Minecraft::new(config.target.protocol_version))];
        if config.scanner.query_fallback {
            protocols.push(Box::new(Query));
        }
        Self::new(protocols).with_fallback_timeout(config.scanner.query_timeout())
    }

    pub async fn probe(&self, endpoint: &Endpoint, timeout: Duration) -> ProbeResult {
        for (i, protocol) in self.protocols.iter().enumerate() {
            let timeout = match (i, self.fallback_timeout) {
                (0, _) | (_, None) => timeout,
                (_, Some(fallback_timeout)) => fallback_timeout,
            };

            let result = match tokio::time::timeout(timeout, protocol.query(endpoint, timeout)).await {
                Ok(result) => result,
                Err(_) => Err(ProbeError::Timeout),
            };
            match result {
                Ok(status) => return ProbeResult::Success(status),
                Err(err) => trace!("{} ping to {endpoint} failed: {err}", protocol.kind()),
            }
        }
        ProbeResult::Failure
    }
}

/// Local time to the second, which is all the store keeps.
pub(crate) fn now() -> NaiveDateTime {
    chrono::Local::now().naive_local().trunc_subsecs(0)
}

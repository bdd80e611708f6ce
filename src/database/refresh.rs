use std::{collections::HashSet, sync::Arc, time::Duration};

use futures_util::{StreamExt, stream};
use tracing::info;

use super::{ServerRecord, ServerStore};
use crate::scanner::protocols::{ProbeResult, Prober, now};

#[derive(Debug, Clone, PartialEq)]
pub struct RefreshedServer {
    pub record: ServerRecord,
    /// Whether it answered this refresh.
    pub online: bool,
}

#[derive(Debug)]
pub struct RefreshOutcome {
    /// Sorted by players online, most first.
    pub servers: Vec<RefreshedServer>,
    pub responsive: usize,
    pub offline: usize,
}

impl RefreshOutcome {
    /// One line per server, numbered from 1.
    pub fn listing(&self) -> Vec<String> {
        self.servers
            .iter()
            .enumerate()
            .map(|(i, server)| {
                let record = &server.record;
                let description = record
                    .description
                    .split_whitespace()
                    .collect::<Vec<_>>()
                    .join(" ");
                let description = match description.char_indices().nth(50) {
                    Some((end, _)) => format!("{}...", &description[..end]),
                    None => description,
                };
                format!(
                    "{}. {} | {} | {}/{} players | {} | {}",
                    i + 1,
                    record.address,
                    if server.online { "Online" } else { "Offline" },
                    record.players_online,
                    record.players_max,
                    record.version,
                    description
                )
            })
            .collect()
    }
}

impl ServerStore {
    /// Ping every stored server again and save what we learn.
    ///
    /// Servers that don't answer are kept with zero players online instead of
    /// being removed. `on_progress` gets called with (done, total) after every
    /// ping.
    pub async fn refresh_all(
        self: &Arc<Self>,
        prober: &Prober,
        concurrency: usize,
        timeout: Duration,
        mut on_progress: impl FnMut(usize, usize),
    ) -> eyre::Result<RefreshOutcome> {
        let store = self.clone();
        let mut servers = tokio::task::spawn_blocking(move || store.load()).await?.servers;
        let total = servers.len();

        let endpoints = servers
            .iter()
            .map(|server| server.address.clone())
            .enumerate()
            .collect::<Vec<_>>();
        let mut pings = stream::iter(endpoints)
            .map(|(index, endpoint)| async move {
                (index, prober.probe(&endpoint, timeout).await)
            })
            .buffer_unordered(concurrency.max(1));

        let mut online = HashSet::new();
        let mut offline = 0;
        while let Some((index, result)) = pings.next().await {
            let server = &mut servers[index];
            server.timestamp = Some(now());
            match result {
                ProbeResult::Success(status) => {
                    server.players_online = status.players_online;
                    server.players_max = status.players_max;
                    online.insert(server.address.clone());
                }
                ProbeResult::Failure => {
                    server.players_online = 0;
                    offline += 1;
                }
            }
            on_progress(online.len() + offline, total);
        }
        let responsive = online.len();

        let store = self.clone();
        let merged = tokio::task::spawn_blocking(move || store.merge_refreshed(&servers)).await??;

        info!("Refreshed {total} servers, {responsive} responded and {offline} didn't");

        Ok(RefreshOutcome {
            servers: merged
                .servers
                .into_iter()
                .map(|record| RefreshedServer {
                    online: online.contains(&record.address),
                    record,
                })
                .collect(),
            responsive,
            offline,
        })
    }
}

#[cfg(test)]
mod test {
    use chrono::NaiveDateTime;

    use super::*;
    use crate::scanner::protocols::testing::{MockProtocol, status};

    fn stale_record(address: &str, players_online: u32) -> ServerRecord {
        ServerRecord {
            address: address.parse().unwrap(),
            players_online,
            players_max: 10,
            version: "1.8.9".to_string(),
            description: "old motd".to_string(),
            timestamp: NaiveDateTime::parse_from_str("2020-01-01 00:00:00", "%Y-%m-%d %H:%M:%S").ok(),
        }
    }

    #[tokio::test]
    async fn test_offline_server_keeps_its_data() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ServerStore::open(dir.path().join("servers.json")));
        let old = stale_record("1.2.3.4:25565", 4);
        store.append(old.clone()).unwrap();

        let prober = Prober::new(vec![Box::new(MockProtocol::default())]);
        let mut progress = Vec::new();
        let outcome = store
            .refresh_all(&prober, 20, Duration::from_secs(1), |done, total| {
                progress.push((done, total))
            })
            .await
            .unwrap();

        assert_eq!(outcome.responsive, 0);
        assert_eq!(outcome.offline, 1);
        assert_eq!(progress, vec![(1, 1)]);

        let refreshed = &outcome.servers[0].record;
        assert!(!outcome.servers[0].online);
        assert_eq!(refreshed.players_online, 0);
        assert_eq!(refreshed.players_max, old.players_max);
        assert_eq!(refreshed.version, old.version);
        assert_eq!(refreshed.description, old.description);
        assert!(refreshed.timestamp > old.timestamp);

        assert_eq!(store.load().servers, vec![refreshed.clone()]);
    }

    #[tokio::test]
    async fn test_refresh_sorts_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ServerStore::open(dir.path().join("servers.json")));
        for (address, players) in [
            ("1.1.1.1:25565", 50),
            ("2.2.2.2:25565", 0),
            ("3.3.3.3:25565", 7),
            ("4.4.4.4:25565", 7),
            ("5.5.5.5:25565", 3),
        ] {
            store.append(stale_record(address, players)).unwrap();
        }

        let protocol = Arc::new(
            MockProtocol::default()
                .with_server("2.2.2.2:25565", status(12, 20, "1.20.1"))
                .with_server("3.3.3.3:25565", status(1, 20, "1.20.1"))
                .with_server("4.4.4.4:25565", status(1, 20, "1.20.1"))
                .with_server("5.5.5.5:25565", status(30, 20, "1.20.1")),
        );
        let prober = Prober::new(vec![Box::new(protocol.clone())]);

        let first = store
            .refresh_all(&prober, 2, Duration::from_secs(1), |_, _| {})
            .await
            .unwrap();
        let order = |outcome: &RefreshOutcome| {
            outcome
                .servers
                .iter()
                .map(|s| (s.record.address.to_string(), s.record.players_online))
                .collect::<Vec<_>>()
        };
        assert_eq!(
            order(&first),
            vec![
                ("5.5.5.5:25565".to_string(), 30),
                ("2.2.2.2:25565".to_string(), 12),
                ("3.3.3.3:25565".to_string(), 1),
                ("4.4.4.4:25565".to_string(), 1),
                ("1.1.1.1:25565".to_string(), 0),
            ]
        );
        assert_eq!(first.responsive, 4);
        assert_eq!(first.offline, 1);

        let second = store
            .refresh_all(&prober, 2, Duration::from_secs(1), |_, _| {})
            .await
            .unwrap();
        assert_eq!(order(&first), order(&second));
        assert_eq!(store.load().servers.len(), 5);
        assert_eq!(protocol.calls(), 10);
    }

    #[test]
    fn test_listing() {
        let mut long = stale_record("1.2.3.4:25565", 3);
        long.description = "A very long\nmessage of the day that goes on and on and on forever".to_string();
        let outcome = RefreshOutcome {
            servers: vec![
                RefreshedServer {
                    record: long,
                    online: true,
                },
                RefreshedServer {
                    record: stale_record("5.6.7.8:25565", 0),
                    online: false,
                },
            ],
            responsive: 1,
            offline: 1,
        };
        assert_eq!(
            outcome.listing(),
            vec![
                "1. 1.2.3.4:25565 | Online | 3/10 players | 1.8.9 | A very long message of the day that goes on and on...",
                "2. 5.6.7.8:25565 | Offline | 0/10 players | 1.8.9 | old motd",
            ]
        );
    }

    #[tokio::test]
    async fn test_refresh_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ServerStore::open(dir.path().join("servers.json")));
        let prober = Prober::new(vec![Box::new(MockProtocol::default())]);
        let outcome = store
            .refresh_all(&prober, 20, Duration::from_secs(1), |_, _| {})
            .await
            .unwrap();
        assert!(outcome.servers.is_empty());
        assert_eq!(store.load().total_count, 0);
    }
}

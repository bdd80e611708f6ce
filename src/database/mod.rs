//! The JSON file that discovered servers are kept in.
//!
//! Every write goes through one lock that covers the whole read, modify and
//! write cycle, so probes finishing at the same time can't lose each other's
//! updates.

pub mod refresh;

use std::{
    collections::{HashMap, HashSet},
    ffi::OsString,
    fs, io,
    path::{Path, PathBuf},
};

use chrono::NaiveDateTime;
use eyre::WrapErr;
use parking_lot::Mutex;
use serde::{Deserialize, Deserializer, Serialize};
use tracing::{debug, warn};

use crate::scanner::{protocols::ServerStatus, targets::Endpoint};

pub use refresh::{RefreshOutcome, RefreshedServer};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerRecord {
    pub address: Endpoint,
    #[serde(default, deserialize_with = "lenient_count")]
    pub players_online: u32,
    #[serde(default, deserialize_with = "lenient_count")]
    pub players_max: u32,
    #[serde(default, deserialize_with = "lenient_string")]
    pub version: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub description: String,
    /// When we last pinged the server.
    #[serde(default, with = "timestamp")]
    pub timestamp: Option<NaiveDateTime>,
}

impl ServerRecord {
    pub fn from_status(address: Endpoint, status: &ServerStatus) -> Self {
        Self {
            address,
            players_online: status.players_online,
            players_max: status.players_max,
            version: status.version.clone(),
            description: status.description.clone(),
            timestamp: Some(status.timestamp),
        }
    }
}

/// The whole file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerList {
    #[serde(default)]
    pub servers: Vec<ServerRecord>,
    #[serde(default)]
    pub total_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Inserted,
    Updated,
}

enum ReadError {
    Missing,
    Corrupt(serde_json::Error),
    Io(io::Error),
}

pub struct ServerStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl ServerStore {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Everything in the store. A missing or unreadable file is an empty
    /// store.
    pub fn load(&self) -> ServerList {
        let _guard = self.lock.lock();
        match self.read() {
            Ok(list) => list,
            Err(ReadError::Missing) => ServerList::default(),
            Err(ReadError::Corrupt(err)) => {
                warn!("{} is corrupt, treating it as empty: {err}", self.path.display());
                ServerList::default()
            }
            Err(ReadError::Io(err)) => {
                warn!("couldn't read {}, treating it as empty: {err}", self.path.display());
                ServerList::default()
            }
        }
    }

    /// Insert the record, or replace the one with the same address.
    pub fn append(&self, record: ServerRecord) -> eyre::Result<Upsert> {
        let _guard = self.lock.lock();
        let mut list = self.read_for_write()?;

        let upsert = match list
            .servers
            .iter_mut()
            .find(|existing| existing.address == record.address)
        {
            Some(existing) => {
                *existing = record;
                Upsert::Updated
            }
            None => {
                list.servers.push(record);
                Upsert::Inserted
            }
        };

        self.write(&mut list)?;
        Ok(upsert)
    }

    /// Save the results of a refresh that started from an earlier
    /// [`Self::load`].
    ///
    /// Only the fields a refresh touches (players and timestamp) are copied
    /// onto the stored records, and records saved after the refresh pinged
    /// them are left alone. Records added in the meantime are kept. Returns the
    /// merged list sorted by players online, most first.
    pub fn merge_refreshed(&self, refreshed: &[ServerRecord]) -> eyre::Result<ServerList> {
        let _guard = self.lock.lock();
        let current = self.read_for_write()?;

        let stored_order = current
            .servers
            .iter()
            .map(|server| server.address.clone())
            .collect::<Vec<_>>();
        let mut current_by_address = current
            .servers
            .into_iter()
            .map(|server| (server.address.clone(), server))
            .collect::<HashMap<_, _>>();

        let mut list = ServerList::default();
        let mut seen = HashSet::with_capacity(refreshed.len());
        for server in refreshed {
            if !seen.insert(&server.address) {
                continue;
            }
            let merged = match current_by_address.remove(&server.address) {
                // saved by a scan after we pinged it
                Some(stored) if stored.timestamp > server.timestamp => stored,
                Some(stored) => ServerRecord {
                    players_online: server.players_online,
                    players_max: server.players_max,
                    timestamp: server.timestamp,
                    ..stored
                },
                None => server.clone(),
            };
            list.servers.push(merged);
        }
        // keep the order they were stored in for the ones the refresh didn't
        // know about
        for address in stored_order {
            if let Some(stored) = current_by_address.remove(&address) {
                list.servers.push(stored);
            }
        }

        // stable, so ties keep their order
        list.servers.sort_by(|a, b| b.players_online.cmp(&a.players_online));

        self.write(&mut list)?;
        Ok(list)
    }

    fn read(&self) -> Result<ServerList, ReadError> {
        let contents = match fs::read(&self.path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Err(ReadError::Missing),
            Err(err) => return Err(ReadError::Io(err)),
        };
        serde_json::from_slice(&contents).map_err(ReadError::Corrupt)
    }

    /// Like [`Self::read`], but a corrupt file gets moved out of the way
    /// first so the write that follows doesn't destroy it. Errors other than
    /// the file not existing abort the write.
    fn read_for_write(&self) -> eyre::Result<ServerList> {
        match self.read() {
            Ok(list) => Ok(list),
            Err(ReadError::Missing) => Ok(ServerList::default()),
            Err(ReadError::Corrupt(err)) => {
                let corrupt_path = self.backup_path();
                warn!(
                    "{} is corrupt ({err}), moving it to {} and starting over",
                    self.path.display(),
                    corrupt_path.display()
                );
                fs::rename(&self.path, &corrupt_path).wrap_err_with(|| {
                    format!("moving corrupt {} out of the way", self.path.display())
                })?;
                Ok(ServerList::default())
            }
            Err(ReadError::Io(err)) => {
                Err(err).wrap_err_with(|| format!("reading {}", self.path.display()))
            }
        }
    }

    /// Write to a temporary file and rename it over the real one, so the file
    /// is never half-written.
    fn write(&self, list: &mut ServerList) -> eyre::Result<()> {
        list.total_count = list.servers.len();

        let tmp_path = self.sibling_path(".tmp");
        let contents = serde_json::to_vec_pretty(list)?;
        fs::write(&tmp_path, contents)
            .wrap_err_with(|| format!("writing {}", tmp_path.display()))?;
        fs::rename(&tmp_path, &self.path)
            .wrap_err_with(|| format!("replacing {}", self.path.display()))?;

        debug!("wrote {} servers to {}", list.total_count, self.path.display());
        Ok(())
    }

    /// `<path>.corrupt-<time>`, with a counter added if that's taken too, so
    /// older backups are never overwritten.
    fn backup_path(&self) -> PathBuf {
        let base = format!(".corrupt-{}", chrono::Local::now().format("%Y%m%d-%H%M%S"));
        let mut path = self.sibling_path(&base);
        let mut n = 1;
        while path.exists() {
            path = self.sibling_path(&format!("{base}-{n}"));
            n += 1;
        }
        path
    }

    fn sibling_path(&self, suffix: &str) -> PathBuf {
        let mut path = OsString::from(self.path.as_os_str());
        path.push(suffix);
        PathBuf::from(path)
    }
}

/// Player counts that aren't a non-negative integer (negative, fractional,
/// quoted or missing) are read as the closest count instead of making the
/// whole file unreadable.
fn lenient_count<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    let count = match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_u64().map(|n| n.min(i64::MAX as u64) as i64))
            .or_else(|| n.as_f64().map(|n| n as i64)),
        serde_json::Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    };
    Ok(count.unwrap_or_default().clamp(0, i64::from(u32::MAX)) as u32)
}

/// Older files sometimes have a chat component object as the description.
fn lenient_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => s,
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    })
}

mod timestamp {
    use chrono::NaiveDateTime;
    use serde::{Deserialize, Deserializer, Serializer};

    const FORMAT: &str = "%Y-%m-%d %H:%M:%S";

    pub fn serialize<S>(timestamp: &Option<NaiveDateTime>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match timestamp {
            Some(timestamp) => serializer.collect_str(&timestamp.format(FORMAT)),
            None => serializer.serialize_str(""),
        }
    }

    /// Unparseable timestamps become None rather than making the whole file
    /// unreadable.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<NaiveDateTime>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = Option::<String>::deserialize(deserializer)?;
        Ok(s.and_then(|s| NaiveDateTime::parse_from_str(&s, FORMAT).ok()))
    }
}

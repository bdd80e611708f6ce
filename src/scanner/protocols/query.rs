//! The GameSpy4 query protocol. Servers only answer it if `enable-query` is
//! on, but when they do we also learn the server software and plugins.

use std::{
    collections::HashMap,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
    time::Duration,
};

use futures_util::future::BoxFuture;
use tokio::net::UdpSocket;
use tracing::trace;

use super::{ProbeError, Protocol, ProtocolKind, ServerStatus, minecraft::clamp_count, now};
use crate::scanner::targets::Endpoint;

const MAGIC: [u8; 2] = [0xfe, 0xfd];
const TYPE_HANDSHAKE: u8 = 0x09;
const TYPE_STAT: u8 = 0x00;

/// `splitnum\0` followed by 0x80 0x00, before the key/value section.
const STAT_PADDING: &[u8] = b"splitnum\x00\x80\x00";
/// Between the key/value section and the player list.
const PLAYERS_PADDING: &[u8] = b"\x01player_\x00\x00";

#[derive(Clone, Copy, Default)]
pub struct Query;

impl Query {
    async fn full_stat(&self, endpoint: &Endpoint) -> Result<ServerStatus, ProbeError> {
        let target = tokio::net::lookup_host((endpoint.host.as_str(), endpoint.port))
            .await?
            .next()
            .ok_or_else(|| ProbeError::Invalid(format!("{endpoint} didn't resolve")))?;
        let socket = UdpSocket::bind(local_addr_for(&target)).await?;
        socket.connect(target).await?;

        // the server only echoes back the lower 4 bits of every byte
        let session_id = rand::random::<i32>() & 0x0f0f_0f0f;
        let mut buffer = vec![0; 65_535];

        socket.send(&handshake_request(session_id)).await?;
        let len = socket.recv(&mut buffer).await?;
        let challenge_token = parse_handshake_response(&buffer[..len], session_id)?;

        socket
            .send(&full_stat_request(session_id, challenge_token))
            .await?;
        let len = socket.recv(&mut buffer).await?;
        let response = parse_full_stat_response(&buffer[..len], session_id)?;
        trace!("{endpoint} answered a query with players {:?}", response.players);

        Ok(response.into_status())
    }
}

impl Protocol for Query {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::Query
    }

    fn query<'a>(
        &'a self,
        endpoint: &'a Endpoint,
        _timeout: Duration,
    ) -> BoxFuture<'a, Result<ServerStatus, ProbeError>> {
        Box::pin(self.full_stat(endpoint))
    }
}

#[derive(Debug, PartialEq)]
pub struct QueryResponse {
    pub motd: String,
    pub version: String,
    pub software_brand: String,
    pub plugins: Vec<String>,
    pub online_players: Option<i64>,
    pub max_players: Option<i64>,
    pub players: Vec<String>,
}

impl QueryResponse {
    fn into_status(self) -> ServerStatus {
        ServerStatus {
            protocol: ProtocolKind::Query,
            players_online: clamp_count(self.online_players),
            players_max: clamp_count(self.max_players),
            version: self.version,
            description: self.motd,
            software: Some(self.software_brand),
            plugin_count: Some(self.plugins.len() as u32),
            latency_ms: None,
            timestamp: now(),
        }
    }
}

/// Any local port, on the same address family as the server.
fn local_addr_for(target: &SocketAddr) -> SocketAddr {
    match target {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    }
}

fn handshake_request(session_id: i32) -> Vec<u8> {
    let mut request = MAGIC.to_vec();
    request.push(TYPE_HANDSHAKE);
    request.extend_from_slice(&session_id.to_be_bytes());
    request
}

fn full_stat_request(session_id: i32, challenge_token: i32) -> Vec<u8> {
    let mut request = MAGIC.to_vec();
    request.push(TYPE_STAT);
    request.extend_from_slice(&session_id.to_be_bytes());
    request.extend_from_slice(&challenge_token.to_be_bytes());
    // asking for the full stat instead of the basic one
    request.extend_from_slice(&[0, 0, 0, 0]);
    request
}

/// Check the packet type and session id, and return the rest of the packet.
fn check_header(data: &[u8], expected_type: u8, session_id: i32) -> Result<&[u8], ProbeError> {
    if data.len() < 5 {
        return Err(ProbeError::Incomplete { expected_length: 5 });
    }
    if data[0] != expected_type {
        return Err(ProbeError::Invalid(format!(
            "expected packet type {expected_type}, got {}",
            data[0]
        )));
    }
    if data[1..5] != session_id.to_be_bytes() {
        return Err(ProbeError::Invalid("session id mismatch".to_string()));
    }
    Ok(&data[5..])
}

fn parse_handshake_response(data: &[u8], session_id: i32) -> Result<i32, ProbeError> {
    let rest = check_header(data, TYPE_HANDSHAKE, session_id)?;
    let mut reader = NullTerminated(rest);
    let token = reader
        .next_str()
        .ok_or_else(|| ProbeError::Invalid("missing challenge token".to_string()))?;
    token
        .trim()
        .parse::<i32>()
        .map_err(|_| ProbeError::Invalid(format!("bad challenge token {token:?}")))
}

fn parse_full_stat_response(data: &[u8], session_id: i32) -> Result<QueryResponse, ProbeError> {
    let rest = check_header(data, TYPE_STAT, session_id)?;
    let rest = rest
        .strip_prefix(STAT_PADDING)
        .ok_or_else(|| ProbeError::Invalid("missing splitnum padding".to_string()))?;

    let mut reader = NullTerminated(rest);
    let mut values = HashMap::new();
    loop {
        let key = reader
            .next_str()
            .ok_or_else(|| ProbeError::Invalid("unterminated key/value section".to_string()))?;
        if key.is_empty() {
            break;
        }
        let value = reader.next_str().unwrap_or_default();
        values.insert(key, value);
    }

    // the player list is optional as far as we're concerned
    let mut players = Vec::new();
    let rest = reader.0.strip_prefix(PLAYERS_PADDING).unwrap_or_default();
    let mut reader = NullTerminated(rest);
    while let Some(name) = reader.next_str() {
        if name.is_empty() {
            break;
        }
        players.push(name);
    }

    let mut take = |key: &str| values.remove(key).unwrap_or_default();
    let (software_brand, plugins) = parse_plugins(&take("plugins"));
    let online_players = take("numplayers").trim().parse().ok();
    let max_players = take("maxplayers").trim().parse().ok();

    Ok(QueryResponse {
        motd: take("hostname"),
        version: take("version"),
        software_brand,
        plugins,
        online_players,
        max_players,
        players,
    })
}

/// The plugins value looks like `Paper on 1.20.1: WorldEdit 7.2.15; LuckPerms
/// 5.4`, or is empty on vanilla.
fn parse_plugins(plugins: &str) -> (String, Vec<String>) {
    let plugins = plugins.trim();
    if plugins.is_empty() {
        return ("vanilla".to_string(), Vec::new());
    }
    match plugins.split_once(": ") {
        Some((brand, list)) => (
            brand.trim().to_string(),
            list.split("; ")
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect(),
        ),
        None => (plugins.to_string(), Vec::new()),
    }
}

/// Reads null-terminated strings off the front of a buffer.
struct NullTerminated<'a>(&'a [u8]);

impl NullTerminated<'_> {
    /// None if there's no terminated string left.
    fn next_str(&mut self) -> Option<String> {
        let end = self.0.iter().position(|&b| b == 0)?;
        let s = String::from_utf8_lossy(&self.0[..end]).to_string();
        self.0 = &self.0[end + 1..];
        Some(s)
    }
}

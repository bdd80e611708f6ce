use std::{
    io::{Cursor, Read},
    time::Duration,
};

use futures_util::future::BoxFuture;
use serde::Deserialize;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time::Instant,
};

use super::{ProbeError, Protocol, ProtocolKind, ServerStatus, now};
use crate::scanner::targets::Endpoint;

/// Status responses with big favicons are usually under 100kb, anything this
/// big is not a Minecraft server.
const MAX_PACKET_LENGTH: i32 = 2 * 1024 * 1024;

/// The part of the probe's time that the latency ping never gets to use, so a
/// server that doesn't answer the ping can't make the whole probe time out.
const LATENCY_MARGIN: Duration = Duration::from_millis(20);

/// The server list ping over TCP.
#[derive(Clone)]
pub struct Minecraft {
    protocol_version: i32,
}

impl Minecraft {
    pub fn new(protocol_version: i32) -> Self {
        Self { protocol_version }
    }

    async fn ping(&self, endpoint: &Endpoint, timeout: Duration) -> Result<ServerStatus, ProbeError> {
        let deadline = Instant::now() + timeout;
        let mut stream = TcpStream::connect((endpoint.host.as_str(), endpoint.port)).await?;
        stream.set_nodelay(true)?;

        let request = build_latest_request(&endpoint.host, endpoint.port, self.protocol_version);
        stream.write_all(&request).await?;

        let packet = read_packet(&mut stream).await?;
        let status_json = parse_response(&packet)?;
        let response = parse_ping_response_json(&status_json)?;

        // a server that answers the status but not the ping is still a server
        let latency_ms = match deadline.checked_sub(LATENCY_MARGIN) {
            Some(ping_deadline) if ping_deadline > Instant::now() => {
                tokio::time::timeout_at(ping_deadline, measure_latency(&mut stream))
                    .await
                    .ok()
                    .and_then(Result::ok)
            }
            _ => None,
        };

        Ok(ServerStatus {
            protocol: ProtocolKind::Status,
            players_online: clamp_count(response.online_players),
            players_max: clamp_count(response.max_players),
            version: response.version_name.unwrap_or_default(),
            description: response.description_plaintext,
            software: None,
            plugin_count: None,
            latency_ms,
            timestamp: now(),
        })
    }
}

impl Protocol for Minecraft {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::Status
    }

    fn query<'a>(
        &'a self,
        endpoint: &'a Endpoint,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<ServerStatus, ProbeError>> {
        Box::pin(self.ping(endpoint, timeout))
    }
}

/// Negative counts get treated as zero.
pub(super) fn clamp_count(count: Option<i64>) -> u32 {
    count.unwrap_or_default().clamp(0, i64::from(u32::MAX)) as u32
}

pub struct PingResponse {
    pub description_plaintext: String,
    pub version_name: Option<String>,
    pub online_players: Option<i64>,
    pub max_players: Option<i64>,
}

#[derive(Deserialize)]
struct RawPingResponse {
    description: Option<serde_json::Value>,
    version: Option<RawVersion>,
    players: Option<RawPlayers>,
}
#[derive(Deserialize)]
struct RawVersion {
    name: Option<String>,
}
#[derive(Deserialize)]
struct RawPlayers {
    online: Option<i64>,
    max: Option<i64>,
}

pub fn parse_ping_response_json(d: &str) -> Result<PingResponse, ProbeError> {
    let v: RawPingResponse = serde_json::from_str(d)
        .map_err(|err| ProbeError::Invalid(format!("failed to parse status json: {err}")))?;

    if v.description.is_none() && v.version.is_none() && v.players.is_none() {
        // some servers are missing one of these fields (even description isn't
        // technically required), but if they're missing all three then it's
        // probably not even a minecraft server
        return Err(ProbeError::Invalid(
            "missing description, version, and players fields".to_string(),
        ));
    }

    let description_plaintext = v
        .description
        .as_ref()
        .map(|description| {
            azalea_chat::FormattedText::deserialize(description)
                .unwrap_or_default()
                .to_string()
        })
        .unwrap_or_default();

    let version_name = v.version.and_then(|version| version.name);
    let (online_players, max_players) = match v.players {
        Some(players) => (players.online, players.max),
        None => (None, None),
    };

    Ok(PingResponse {
        description_plaintext,
        version_name,
        online_players,
        max_players,
    })
}

/// Pull the JSON out of a status response packet (without its length
/// prefix).
pub fn parse_response(packet: &[u8]) -> Result<String, ProbeError> {
    let invalid = |reason: &str| ProbeError::Invalid(reason.to_string());

    let mut stream = Cursor::new(packet);
    let packet_id = read_varint(&mut stream).ok_or_else(|| invalid("bad packet id"))?;
    let response_length = read_varint(&mut stream).ok_or_else(|| invalid("bad response length"))?;
    if packet_id != 0x00 || response_length < 0 {
        return Err(invalid("not a status response"));
    }
    // read until end
    let position = stream.position() as usize;
    let status_buffer = &packet[position..];
    if status_buffer.len() < response_length as usize {
        return Err(ProbeError::Incomplete {
            expected_length: response_length as u32,
        });
    }

    let status_string =
        String::from_utf8_lossy(&status_buffer[..response_length as usize]).to_string();

    // make sure it starts with {
    if !status_string.starts_with('{') {
        return Err(invalid("status isn't a json object"));
    }

    Ok(status_string)
}

/// Send a ping packet and time how long the pong takes.
async fn measure_latency(stream: &mut TcpStream) -> Result<f64, ProbeError> {
    let payload = rand::random::<i64>();

    let mut packet = vec![
        9,    // length of packet id + payload
        0x01, // ping
    ];
    packet.extend_from_slice(&payload.to_be_bytes());

    let start = Instant::now();
    stream.write_all(&packet).await?;
    let pong = read_packet(stream).await?;
    let latency = start.elapsed();

    if pong.len() != 9 || pong[0] != 0x01 || pong[1..] != payload.to_be_bytes() {
        return Err(ProbeError::Invalid("bad pong".to_string()));
    }

    Ok(latency.as_secs_f64() * 1000.)
}

/// Read one length-prefixed packet.
pub(super) async fn read_packet<R>(reader: &mut R) -> Result<Vec<u8>, ProbeError>
where
    R: AsyncRead + Unpin,
{
    let length = read_varint_async(reader).await?;
    if length <= 0 || length > MAX_PACKET_LENGTH {
        return Err(ProbeError::Invalid(format!("bad packet length {length}")));
    }
    let mut packet = vec![0; length as usize];
    reader.read_exact(&mut packet).await?;
    Ok(packet)
}

/// https://github.com/kiwiyou/craftping/blob/master/src/lib.rs#L73
pub fn build_latest_request(hostname: &str, port: u16, protocol_version: i32) -> Vec<u8> {
    // buffer for the 1st packet's data part
    let mut buffer = vec![
        // 0 for handshake packet
        0x00,
    ];

    write_varint(&mut buffer, protocol_version); // protocol version

    // Some server implementations require hostname and port to be properly set (Notchian does not)
    write_varint(&mut buffer, hostname.len() as i32); // length of hostname as VarInt
    buffer.extend_from_slice(hostname.as_bytes());
    buffer.extend_from_slice(&port.to_be_bytes()); // server port as unsigned short
    buffer.push(0x01); // next state: 1 (status) as VarInt

    // buffer for the 1st and 2nd packet
    let mut full_buffer = vec![];
    write_varint(&mut full_buffer, buffer.len() as i32); // length of 1st packet id + data as VarInt
    full_buffer.append(&mut buffer);
    full_buffer.extend_from_slice(&[
        1,    // length of 2nd packet id + data as VarInt
        0x00, // 2nd packet id: 0 for request as VarInt
    ]);

    full_buffer
}

pub(super) fn write_varint(writer: &mut Vec<u8>, value: i32) {
    let mut value = value as u32;
    loop {
        let mut byte = (value & 0b0111_1111) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0b1000_0000;
        }
        writer.push(byte);
        if value == 0 {
            break;
        }
    }
}

fn read_varint(reader: &mut impl Read) -> Option<i32> {
    let mut buffer = [0];
    let mut ans = 0;
    for i in 0..5 {
        reader.read_exact(&mut buffer).ok()?;
        ans |= ((buffer[0] & 0b0111_1111) as i32) << (7 * i);
        if buffer[0] & 0b1000_0000 == 0 {
            return Some(ans);
        }
    }
    None
}

async fn read_varint_async<R>(reader: &mut R) -> Result<i32, ProbeError>
where
    R: AsyncRead + Unpin,
{
    let mut ans = 0;
    for i in 0..5 {
        let byte = reader.read_u8().await?;
        ans |= ((byte & 0b0111_1111) as i32) << (7 * i);
        if byte & 0b1000_0000 == 0 {
            return Ok(ans);
        }
    }
    Err(ProbeError::Invalid("varint is too long".to_string()))
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use tokio::net::TcpListener;

    use super::*;
    use crate::scanner::protocols::{ProbeResult, Prober};

    fn status_packet(json: &str) -> Vec<u8> {
        let mut body = vec![0x00];
        write_varint(&mut body, json.len() as i32);
        body.extend_from_slice(json.as_bytes());
        let mut packet = Vec::new();
        write_varint(&mut packet, body.len() as i32);
        packet.extend(body);
        packet
    }

    #[test]
    fn test_varints() {
        for (value, expected) in [
            (0, vec![0x00]),
            (1, vec![0x01]),
            (127, vec![0x7f]),
            (128, vec![0x80, 0x01]),
            (25565, vec![0xdd, 0xc7, 0x01]),
            (-1, vec![0xff, 0xff, 0xff, 0xff, 0x0f]),
        ] {
            let mut buffer = Vec::new();
            write_varint(&mut buffer, value);
            assert_eq!(buffer, expected, "writing {value}");
            assert_eq!(read_varint(&mut Cursor::new(&buffer)), Some(value));
        }
        assert_eq!(read_varint(&mut Cursor::new(&[0xff; 6])), None);
    }

    #[test]
    fn test_build_request() {
        let request = build_latest_request("a.b", 25565, 47);
        assert_eq!(
            request,
            vec![
                9, 0x00, 47, 3, b'a', b'.', b'b', 0x63, 0xdd, 0x01, // handshake
                1, 0x00, // status request
            ]
        );
    }

    #[test]
    fn test_parse_response() {
        let json = r#"{"description":"hi"}"#;
        let packet = status_packet(json);
        // skip the length prefix, which is one byte here
        assert_eq!(parse_response(&packet[1..]).unwrap(), json);

        assert!(matches!(
            parse_response(&packet[1..packet.len() - 3]),
            Err(ProbeError::Incomplete { expected_length: 20 })
        ));

        let mut wrong_id = packet[1..].to_vec();
        wrong_id[0] = 0x01;
        assert!(matches!(parse_response(&wrong_id), Err(ProbeError::Invalid(_))));

        let not_json = status_packet("hello");
        assert!(matches!(parse_response(&not_json[1..]), Err(ProbeError::Invalid(_))));
    }

    #[test]
    fn test_parse_ping_response_json() {
        let response = parse_ping_response_json(
            r#"{
                "version": {"name": "Paper 1.20.1", "protocol": 763},
                "players": {"online": 5, "max": 20, "sample": []},
                "description": {"text": "Hello ", "extra": [{"text": "world", "bold": true}]}
            }"#,
        )
        .unwrap();
        assert_eq!(response.version_name.as_deref(), Some("Paper 1.20.1"));
        assert_eq!(response.online_players, Some(5));
        assert_eq!(response.max_players, Some(20));
        assert_eq!(response.description_plaintext, "Hello world");

        let response = parse_ping_response_json(r#"{"description": "plain motd"}"#).unwrap();
        assert_eq!(response.description_plaintext, "plain motd");
        assert_eq!(response.online_players, None);

        assert!(parse_ping_response_json(r#"{"foo": 1}"#).is_err());
        assert!(parse_ping_response_json("{").is_err());
    }

    #[test]
    fn test_clamp_count() {
        assert_eq!(clamp_count(Some(-3)), 0);
        assert_eq!(clamp_count(None), 0);
        assert_eq!(clamp_count(Some(7)), 7);
    }

    /// Pretend to be a vanilla server for one connection. If `answer_ping` is
    /// off, the ping is read and then ignored while the connection stays open.
    async fn serve_status(listener: TcpListener, json: &'static str, answer_ping: bool) {
        let (mut stream, _) = listener.accept().await.unwrap();
        let handshake = read_packet(&mut stream).await.unwrap();
        assert_eq!(handshake[0], 0x00);
        assert_eq!(*handshake.last().unwrap(), 0x01);
        let request = read_packet(&mut stream).await.unwrap();
        assert_eq!(request, vec![0x00]);

        stream.write_all(&status_packet(json)).await.unwrap();

        let ping = read_packet(&mut stream).await.unwrap();
        assert_eq!(ping[0], 0x01);
        if !answer_ping {
            tokio::time::sleep(Duration::from_secs(30)).await;
            return;
        }
        let mut pong = vec![ping.len() as u8];
        pong.extend(ping);
        stream.write_all(&pong).await.unwrap();
    }

    #[tokio::test]
    async fn test_ping_local_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(serve_status(
            listener,
            r#"{"version":{"name":"1.20.1","protocol":763},"players":{"online":-2,"max":20},"description":"A Minecraft Server"}"#,
            true,
        ));

        let prober = Prober::new(vec![Box::new(Minecraft::new(763))]);
        let result = prober
            .probe(&Endpoint::new("127.0.0.1", port), Duration::from_secs(5))
            .await;
        server.await.unwrap();

        let ProbeResult::Success(status) = result else {
            panic!("expected a status response");
        };
        assert_eq!(status.protocol, ProtocolKind::Status);
        assert_eq!(status.players_online, 0);
        assert_eq!(status.players_max, 20);
        assert_eq!(status.version, "1.20.1");
        assert_eq!(status.description, "A Minecraft Server");
        assert!(status.latency_ms.is_some());
    }

    #[tokio::test]
    async fn test_unanswered_ping_still_finds_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(serve_status(
            listener,
            r#"{"version":{"name":"1.8.9"},"players":{"online":1,"max":10},"description":"no pong"}"#,
            false,
        ));

        let prober = Prober::new(vec![Box::new(Minecraft::new(47))]);
        let result = prober
            .probe(&Endpoint::new("127.0.0.1", port), Duration::from_millis(300))
            .await;
        server.abort();

        let ProbeResult::Success(status) = result else {
            panic!("expected the status to survive the missing pong, got {result:?}");
        };
        assert_eq!(status.players_online, 1);
        assert_eq!(status.description, "no pong");
        assert_eq!(status.latency_ms, None);
    }

    #[tokio::test]
    async fn test_ping_refused() {
        // bind and immediately drop so nothing is listening on the port
        let port = TcpListener::bind("127.0.0.1:0")
            .await
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let result = Minecraft::new(47)
            .ping(&Endpoint::new("127.0.0.1", port), Duration::from_secs(1))
            .await;
        assert!(result.is_err());
    }
}

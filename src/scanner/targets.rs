use std::{fmt, net::Ipv4Addr, str::FromStr};

use eyre::bail;
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer, de};

pub const DEFAULT_PORT: u16 = 25565;

/// A host and port that we can ping. This is also the key that stored servers
/// are deduplicated by.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into().to_ascii_lowercase(),
            port,
        }
    }

    pub fn from_ipv4(addr: Ipv4Addr, port: u16) -> Self {
        Self {
            host: addr.to_string(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid endpoint {0:?}")]
pub struct InvalidEndpoint(String);

impl FromStr for Endpoint {
    type Err = InvalidEndpoint;

    /// Parses `host:port`, `[v6]:port` or a bare host (which gets the default
    /// port).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let invalid = || InvalidEndpoint(s.to_string());

        if let Some(rest) = s.strip_prefix('[') {
            let (host, after) = rest.split_once(']').ok_or_else(invalid)?;
            let port = match after.strip_prefix(':') {
                Some(port) => port.parse().map_err(|_| invalid())?,
                None if after.is_empty() => DEFAULT_PORT,
                None => return Err(invalid()),
            };
            if host.is_empty() {
                return Err(invalid());
            }
            return Ok(Endpoint::new(host, port));
        }

        let (host, port) = match s.split_once(':') {
            Some((host, port)) => (host, port.parse().map_err(|_| invalid())?),
            None => (s, DEFAULT_PORT),
        };
        if host.is_empty() || host.contains(char::is_whitespace) {
            return Err(invalid());
        }
        Ok(Endpoint::new(host, port))
    }
}

impl Serialize for Endpoint {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Endpoint {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub struct Ipv4Range {
    pub start: Ipv4Addr,
    pub end: Ipv4Addr,
}

impl Ipv4Range {
    pub fn single(addr: Ipv4Addr) -> Self {
        Self {
            start: addr,
            end: addr,
        }
    }

    pub fn count(&self) -> u64 {
        u64::from(u32::from(self.end)) - u64::from(u32::from(self.start)) + 1
    }
}

/// A sorted set of non-overlapping ranges.
#[derive(Default, Clone, Debug)]
pub struct Ipv4Ranges {
    ranges: Vec<Ipv4Range>,
}

impl Ipv4Ranges {
    /// Sort the ranges and merge the ones that overlap or touch, so
    /// [`Self::contains`] can binary search.
    pub fn new(mut ranges: Vec<Ipv4Range>) -> Self {
        ranges.sort_by_key(|r| r.start);

        let mut merged: Vec<Ipv4Range> = Vec::with_capacity(ranges.len());
        for range in ranges {
            if let Some(last) = merged.last_mut() {
                if u64::from(u32::from(range.start)) <= u64::from(u32::from(last.end)) + 1 {
                    if range.end > last.end {
                        last.end = range.end;
                    }
                    continue;
                }
            }
            merged.push(range);
        }

        Self { ranges: merged }
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        let mut start = 0;
        let mut end = self.ranges.len();
        while start < end {
            let mid = (start + end) / 2;
            let range = &self.ranges[mid];
            if range.end < addr {
                start = mid + 1;
            } else if range.start > addr {
                end = mid;
            } else {
                return true;
            }
        }
        false
    }

    /// The number of addresses covered by the ranges.
    pub fn count(&self) -> u64 {
        self.ranges.iter().map(Ipv4Range::count).sum()
    }

    pub fn ranges(&self) -> &Vec<Ipv4Range> {
        &self.ranges
    }
}

/// Something that hands out endpoints to scan. Implementations must be safe
/// to call from many tasks at once.
pub trait EndpointSource: Send + Sync {
    fn next_endpoint(&self) -> Endpoint;
}

/// Uniformly random IPv4 addresses on a fixed port, skipping the excluded
/// ranges.
pub struct RandomAddresses {
    excluded: Ipv4Ranges,
    port: u16,
}

impl RandomAddresses {
    pub fn new(excluded: Ipv4Ranges, port: u16) -> eyre::Result<Self> {
        if excluded.count() > u64::from(u32::MAX) {
            bail!("the exclude ranges cover every IPv4 address, there's nothing left to scan");
        }
        Ok(Self { excluded, port })
    }

    /// Draw from `rng` until we get an address that isn't excluded.
    pub fn next_addr_with<R: RngCore + ?Sized>(&self, rng: &mut R) -> Ipv4Addr {
        loop {
            let addr = Ipv4Addr::from(rng.next_u32());
            if !self.excluded.contains(addr) {
                return addr;
            }
        }
    }
}

impl EndpointSource for RandomAddresses {
    fn next_endpoint(&self) -> Endpoint {
        let addr = self.next_addr_with(&mut rand::thread_rng());
        Endpoint::from_ipv4(addr, self.port)
    }
}

#[cfg(test)]
mod test {
    use rand::{SeedableRng, rngs::StdRng, rngs::mock::StepRng};

    use super::*;
    use crate::exclude;

    #[test]
    fn test_generated_addresses_are_never_excluded() {
        let reserved = exclude::reserved().unwrap();
        let generator = RandomAddresses::new(reserved.clone(), DEFAULT_PORT).unwrap();

        let mut rng = StdRng::seed_from_u64(0x6d63);
        for _ in 0..10_000 {
            let addr = generator.next_addr_with(&mut rng);
            assert!(!reserved.contains(addr), "{addr} is in an excluded range");
            assert!(!addr.is_private());
            assert!(!addr.is_loopback());
            assert!(!addr.is_link_local());
            assert!(!addr.is_multicast());
            assert!(!addr.is_broadcast());
        }

        for _ in 0..1_000 {
            let endpoint = generator.next_endpoint();
            assert_eq!(endpoint.port, DEFAULT_PORT);
            let addr: Ipv4Addr = endpoint.host.parse().unwrap();
            assert!(!reserved.contains(addr));
        }
    }

    #[test]
    fn test_redraws_excluded_addresses() {
        let generator = RandomAddresses::new(exclude::reserved().unwrap(), DEFAULT_PORT).unwrap();
        // 10.0.0.1 is private, the next draw is 11.0.0.1
        let mut rng = StepRng::new(u64::from(u32::from(Ipv4Addr::new(10, 0, 0, 1))), 1 << 24);
        assert_eq!(generator.next_addr_with(&mut rng), Ipv4Addr::new(11, 0, 0, 1));
    }

    #[test]
    fn test_everything_excluded() {
        let everything = Ipv4Ranges::new(vec![Ipv4Range {
            start: Ipv4Addr::new(0, 0, 0, 0),
            end: Ipv4Addr::new(255, 255, 255, 255),
        }]);
        assert!(RandomAddresses::new(everything, DEFAULT_PORT).is_err());
    }

    #[test]
    fn test_ranges_merge() {
        let ranges = Ipv4Ranges::new(vec![
            Ipv4Range::single(Ipv4Addr::new(255, 255, 255, 255)),
            Ipv4Range {
                start: Ipv4Addr::new(240, 0, 0, 0),
                end: Ipv4Addr::new(255, 255, 255, 255),
            },
            Ipv4Range {
                start: Ipv4Addr::new(1, 0, 0, 0),
                end: Ipv4Addr::new(1, 0, 0, 9),
            },
            Ipv4Range {
                start: Ipv4Addr::new(1, 0, 0, 10),
                end: Ipv4Addr::new(1, 0, 0, 20),
            },
        ]);
        assert_eq!(
            ranges.ranges(),
            &vec![
                Ipv4Range {
                    start: Ipv4Addr::new(1, 0, 0, 0),
                    end: Ipv4Addr::new(1, 0, 0, 20),
                },
                Ipv4Range {
                    start: Ipv4Addr::new(240, 0, 0, 0),
                    end: Ipv4Addr::new(255, 255, 255, 255),
                },
            ]
        );
        assert_eq!(ranges.count(), 21 + (1 << 28));
        assert!(ranges.contains(Ipv4Addr::new(250, 0, 0, 1)));
        assert!(!ranges.contains(Ipv4Addr::new(1, 0, 0, 21)));
    }

    #[test]
    fn test_endpoint_parsing() {
        assert_eq!(
            "1.2.3.4:25566".parse::<Endpoint>().unwrap(),
            Endpoint::new("1.2.3.4", 25566)
        );
        assert_eq!(
            "Play.Example.com".parse::<Endpoint>().unwrap(),
            Endpoint::new("play.example.com", DEFAULT_PORT)
        );
        assert_eq!(
            "[::1]:25570".parse::<Endpoint>().unwrap(),
            Endpoint::new("::1", 25570)
        );
        assert_eq!(Endpoint::new("::1", 25570).to_string(), "[::1]:25570");
        assert_eq!(Endpoint::new("1.2.3.4", 25565).to_string(), "1.2.3.4:25565");
        assert!("1.2.3.4:notaport".parse::<Endpoint>().is_err());
        assert!(":25565".parse::<Endpoint>().is_err());
        assert!("".parse::<Endpoint>().is_err());
    }

    #[test]
    fn test_endpoint_serializes_as_string() {
        let endpoint = Endpoint::new("1.2.3.4", 25565);
        let json = serde_json::to_string(&endpoint).unwrap();
        assert_eq!(json, r#""1.2.3.4:25565""#);
        assert_eq!(serde_json::from_str::<Endpoint>(&json).unwrap(), endpoint);
        assert!(serde_json::from_str::<Endpoint>(r#""a:b:c""#).is_err());
    }
}

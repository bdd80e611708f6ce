use std::{fs, net::Ipv4Addr, path::Path, str::FromStr};

use eyre::{WrapErr, eyre};

use crate::scanner::targets::{Ipv4Range, Ipv4Ranges};

/// Address space that's never worth scanning: private, loopback, link-local,
/// IANA special-purpose, multicast, reserved and broadcast.
pub const RESERVED_RANGES: &str = "
0.0.0.0/8          # this network
10.0.0.0/8         # private
100.64.0.0/10      # carrier-grade nat
127.0.0.0/8        # loopback
169.254.0.0/16     # link-local
172.16.0.0/12      # private
192.0.0.0/24       # ietf protocol assignments
192.0.2.0/24       # test-net-1
192.88.99.0/24     # 6to4 relay anycast
192.168.0.0/16     # private
198.18.0.0/15      # benchmarking
198.51.100.0/24    # test-net-2
203.0.113.0/24     # test-net-3
224.0.0.0/4        # multicast
240.0.0.0/4        # reserved
255.255.255.255    # broadcast
";

/// The reserved ranges plus whatever is in `extra_file`, if any.
pub fn load(extra_file: Option<&Path>) -> eyre::Result<Ipv4Ranges> {
    let mut ranges = parse(RESERVED_RANGES)?;

    if let Some(extra_file) = extra_file {
        let input = fs::read_to_string(extra_file)
            .wrap_err_with(|| format!("reading exclude file {}", extra_file.display()))?;
        ranges.extend(parse(&input)?);
    }

    Ok(Ipv4Ranges::new(ranges))
}

pub fn reserved() -> eyre::Result<Ipv4Ranges> {
    load(None)
}

fn parse(input: &str) -> eyre::Result<Vec<Ipv4Range>> {
    let mut ranges = Vec::new();

    for line in input.lines() {
        // remove everything after the first #
        let line = line.split('#').next().unwrap_or_default().trim();

        if line.is_empty() {
            continue;
        }

        // can be either like 0.0.0.0-0.0.0.0 or 0.0.0.0/32

        let is_slash = line.contains('/');
        let is_hypen = line.contains('-');

        if is_slash && is_hypen {
            return Err(eyre!(
                "Invalid exclude range: {} (cannot contain both - and /)",
                line
            ));
        }

        let range = if let Some((ip, mask)) = line.split_once('/') {
            let prefix_len = mask.trim().parse::<u8>()?;
            if prefix_len > 32 {
                return Err(eyre!(
                    "Invalid exclude range: {} (prefix length is over 32)",
                    line
                ));
            }

            let host_bits = 32 - u32::from(prefix_len);
            let mask_bits = if host_bits == 32 {
                u32::MAX
            } else {
                (1u32 << host_bits) - 1
            };

            let ip_u32 = u32::from(Ipv4Addr::from_str(ip.trim())?);

            Ipv4Range {
                start: Ipv4Addr::from(ip_u32 & !mask_bits),
                end: Ipv4Addr::from(ip_u32 | mask_bits),
            }
        } else if let Some((ip_start, ip_end)) = line.split_once('-') {
            let ip_start = Ipv4Addr::from_str(ip_start.trim())?;
            let ip_end = Ipv4Addr::from_str(ip_end.trim())?;

            if ip_start > ip_end {
                return Err(eyre!(
                    "Invalid exclude range: {} (start cannot be greater than end)",
                    line
                ));
            }

            Ipv4Range {
                start: ip_start,
                end: ip_end,
            }
        } else {
            Ipv4Range::single(Ipv4Addr::from_str(line)?)
        };

        ranges.push(range);
    }

    Ok(ranges)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_forms() {
        let ranges = parse(
            "
            # comment line
            1.2.3.0/24
            5.5.5.5 - 5.5.5.9   # with a comment
            8.8.8.8
            ",
        )
        .unwrap();
        assert_eq!(
            ranges,
            vec![
                Ipv4Range {
                    start: Ipv4Addr::new(1, 2, 3, 0),
                    end: Ipv4Addr::new(1, 2, 3, 255),
                },
                Ipv4Range {
                    start: Ipv4Addr::new(5, 5, 5, 5),
                    end: Ipv4Addr::new(5, 5, 5, 9),
                },
                Ipv4Range::single(Ipv4Addr::new(8, 8, 8, 8)),
            ]
        );
    }

    #[test]
    fn test_slash_zero_and_slash_32() {
        let ranges = parse("0.0.0.0/0\n9.9.9.9/32").unwrap();
        assert_eq!(
            ranges[0],
            Ipv4Range {
                start: Ipv4Addr::new(0, 0, 0, 0),
                end: Ipv4Addr::new(255, 255, 255, 255),
            }
        );
        assert_eq!(ranges[1], Ipv4Range::single(Ipv4Addr::new(9, 9, 9, 9)));
    }

    #[test]
    fn test_invalid_lines() {
        assert!(parse("1.2.3.4/24-1.2.3.5").is_err());
        assert!(parse("1.2.3.9-1.2.3.4").is_err());
        assert!(parse("1.2.3.4/33").is_err());
        assert!(parse("not an ip").is_err());
    }

    #[test]
    fn test_reserved_ranges() {
        let reserved = reserved().unwrap();
        for addr in [
            Ipv4Addr::new(0, 1, 2, 3),
            Ipv4Addr::new(10, 200, 0, 1),
            Ipv4Addr::new(100, 127, 255, 255),
            Ipv4Addr::new(127, 0, 0, 1),
            Ipv4Addr::new(169, 254, 10, 10),
            Ipv4Addr::new(172, 31, 255, 255),
            Ipv4Addr::new(192, 0, 0, 8),
            Ipv4Addr::new(192, 0, 2, 200),
            Ipv4Addr::new(192, 88, 99, 1),
            Ipv4Addr::new(192, 168, 1, 1),
            Ipv4Addr::new(198, 19, 0, 1),
            Ipv4Addr::new(198, 51, 100, 7),
            Ipv4Addr::new(203, 0, 113, 99),
            Ipv4Addr::new(224, 0, 0, 251),
            Ipv4Addr::new(239, 255, 255, 250),
            Ipv4Addr::new(250, 1, 1, 1),
            Ipv4Addr::new(255, 255, 255, 255),
        ] {
            assert!(reserved.contains(addr), "{addr} should be excluded");
        }
        for addr in [
            Ipv4Addr::new(1, 1, 1, 1),
            Ipv4Addr::new(9, 255, 255, 255),
            Ipv4Addr::new(11, 0, 0, 0),
            Ipv4Addr::new(100, 128, 0, 0),
            Ipv4Addr::new(172, 32, 0, 0),
            Ipv4Addr::new(192, 0, 1, 1),
            Ipv4Addr::new(198, 20, 0, 0),
            Ipv4Addr::new(223, 255, 255, 255),
        ] {
            assert!(!reserved.contains(addr), "{addr} should not be excluded");
        }
    }
}

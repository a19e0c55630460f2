//! Address grammar: parses the small set of address strings this runtime
//! accepts on `--listen` and from recovered inherited sockets.
//!
//! Grammar (see module docs in the crate root for the full writeup):
//!
//! - `unix:PATH`       -> Unix domain socket, `unix:@name` is abstract on Linux
//! - `[ADDR]` / `[ADDR]:PORT` -> IPv6
//! - `*:PORT` / `ADDR:PORT` / `ADDR` / `PORT` -> IPv4

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

use tracing::error;

/// Socket family/type-discriminated address, immutable once parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketAddress {
    Unix {
        /// Filesystem path, or the empty-first-byte abstract name on Linux.
        path: Vec<u8>,
        /// True if this is a Linux abstract socket (`sun_path[0] == 0`).
        abstract_name: bool,
        /// Bytes actually significant in `sun_path` (excludes the NUL
        /// terminator for named sockets, and the leading NUL marker byte
        /// is still counted for abstract sockets).
        socklen: usize,
        text: String,
    },
    Inet(SocketAddr),
}

/// `sun_path` is 108 bytes on Linux and the BSDs this crate targets. Reserve
/// one byte for the trailing NUL so a later socket bind never overruns,
/// matching `sizeof(sockaddr_un.sun_path) - 1`.
pub const SUN_PATH_MAX: usize = 108 - 1;

impl SocketAddress {
    /// Parses `addr` per the grammar described in the module docs. Returns
    /// `None` and logs a critical-level error naming the offending input on
    /// any malformed input; never partially constructs a result.
    pub fn parse(addr: &str) -> Option<SocketAddress> {
        if let Some(rest) = addr.strip_prefix("unix:") {
            return Self::parse_unix(rest, addr);
        }

        if let Some(rest) = addr.strip_prefix('[') {
            return Self::parse_inet6(rest, addr);
        }

        Self::parse_inet(addr)
    }

    fn parse_unix(path: &str, original: &str) -> Option<SocketAddress> {
        if path.is_empty() {
            error!(address = original, "unix domain socket name is invalid");
            return None;
        }

        if path.len() > SUN_PATH_MAX {
            error!(address = original, "unix domain socket name is too long");
            return None;
        }

        let mut bytes = path.as_bytes().to_vec();
        let mut socklen = bytes.len() + 1;
        let mut abstract_name = false;

        if cfg!(target_os = "linux") && bytes[0] == b'@' {
            bytes[0] = 0;
            socklen -= 1;
            abstract_name = true;
        }

        Some(SocketAddress::Unix {
            path: bytes,
            abstract_name,
            socklen,
            text: original.to_string(),
        })
    }

    fn parse_inet6(after_bracket: &str, original: &str) -> Option<SocketAddress> {
        let close = match after_bracket.find(']') {
            Some(idx) => idx,
            None => {
                error!(address = original, "invalid IPv6 address");
                return None;
            }
        };

        let addr_text = &after_bracket[..close];
        let ip: Ipv6Addr = match addr_text.parse() {
            Ok(ip) => ip,
            Err(_) => {
                error!(address = original, "invalid IPv6 address");
                return None;
            }
        };

        let rest = &after_bracket[close + 1..];

        let port = if rest.is_empty() {
            0
        } else {
            let port_text = match rest.strip_prefix(':') {
                Some(p) => p,
                None => {
                    error!(address = original, "invalid port");
                    return None;
                }
            };
            match parse_port(port_text) {
                Some(p) => p,
                None => {
                    error!(address = original, "invalid port");
                    return None;
                }
            }
        };

        Some(SocketAddress::Inet(SocketAddr::V6(SocketAddrV6::new(
            ip, port, 0, 0,
        ))))
    }

    fn parse_inet(addr: &str) -> Option<SocketAddress> {
        match addr.find(':') {
            None => {
                // Bare port, or bare dotted-quad with the default port.
                if let Some(port) = parse_port(addr) {
                    return Some(SocketAddress::Inet(SocketAddr::V4(SocketAddrV4::new(
                        Ipv4Addr::UNSPECIFIED,
                        port,
                    ))));
                }

                match addr.parse::<Ipv4Addr>() {
                    Ok(ip) => Some(SocketAddress::Inet(SocketAddr::V4(SocketAddrV4::new(
                        ip, 8080,
                    )))),
                    Err(_) => {
                        error!(address = addr, "invalid address");
                        None
                    }
                }
            }
            Some(colon) => {
                let (host, port_text) = (&addr[..colon], &addr[colon + 1..]);

                let port = match parse_port(port_text) {
                    Some(p) => p,
                    None => {
                        error!(address = addr, "invalid port");
                        return None;
                    }
                };

                let ip = if host == "*" {
                    Ipv4Addr::UNSPECIFIED
                } else {
                    match host.parse::<Ipv4Addr>() {
                        Ok(ip) => ip,
                        Err(_) => {
                            error!(address = addr, "invalid address");
                            return None;
                        }
                    }
                };

                Some(SocketAddress::Inet(SocketAddr::V4(SocketAddrV4::new(
                    ip, port,
                ))))
            }
        }
    }

    /// Renders the address back to its canonical text form. For IPv4/IPv6
    /// this round-trips through `parse`; for Unix sockets, `text` retains
    /// the original literal the caller supplied.
    pub fn text(&self) -> String {
        match self {
            SocketAddress::Unix { text, .. } => text.clone(),
            SocketAddress::Inet(SocketAddr::V4(v4)) => format!("{}:{}", v4.ip(), v4.port()),
            SocketAddress::Inet(SocketAddr::V6(v6)) => {
                format!("[{}]:{}", v6.ip(), v6.port())
            }
        }
    }

    /// Family-aware equality used by the listen-socket reconciler (C8).
    /// Resolves Open Question #3: the comparison is byte/value equality on
    /// the parsed representation, not a textual comparison.
    pub fn matches(&self, other: &SocketAddress) -> bool {
        self == other
    }
}

fn parse_port(text: &str) -> Option<u16> {
    let port: u32 = text.parse().ok()?;
    if (1..=65535).contains(&port) {
        Some(port as u16)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unix_path_round_trips() {
        let sa = SocketAddress::parse("unix:/tmp/nxt.sock").unwrap();
        match sa {
            SocketAddress::Unix {
                path, abstract_name, ..
            } => {
                assert_eq!(path, b"/tmp/nxt.sock");
                assert!(!abstract_name);
            }
            _ => panic!("expected unix"),
        }
    }

    #[test]
    fn unix_empty_path_is_invalid() {
        assert!(SocketAddress::parse("unix:").is_none());
    }

    #[test]
    fn unix_path_at_max_len_accepted_one_over_rejected() {
        let exact = format!("unix:{}", "a".repeat(SUN_PATH_MAX));
        assert!(SocketAddress::parse(&exact).is_some());

        let over = format!("unix:{}", "a".repeat(SUN_PATH_MAX + 1));
        assert!(SocketAddress::parse(&over).is_none());
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn unix_abstract_socket_strips_leading_at() {
        let sa = SocketAddress::parse("unix:@abstract").unwrap();
        match sa {
            SocketAddress::Unix {
                path,
                abstract_name,
                socklen,
                ..
            } => {
                assert_eq!(path[0], 0);
                assert!(abstract_name);
                // socklen tracks only the sun_path portion; the trailing
                // NUL reserved for named sockets is dropped for abstract
                // ones since the leading NUL already delimits the name.
                assert_eq!(socklen, path.len());
            }
            _ => panic!("expected unix"),
        }
    }

    #[test]
    fn ipv6_without_port_defaults_to_zero() {
        let sa = SocketAddress::parse("[::1]").unwrap();
        assert_eq!(sa, SocketAddress::Inet("[::1]:0".parse().unwrap()));
    }

    #[test]
    fn ipv6_with_port() {
        let sa = SocketAddress::parse("[::1]:8080").unwrap();
        assert_eq!(sa, SocketAddress::Inet("[::1]:8080".parse().unwrap()));
    }

    #[test]
    fn ipv6_invalid_address_rejected() {
        assert!(SocketAddress::parse("[not-an-ip]").is_none());
    }

    #[test]
    fn ipv4_bare_port() {
        let sa = SocketAddress::parse("8080").unwrap();
        assert_eq!(sa, SocketAddress::Inet("0.0.0.0:8080".parse().unwrap()));
    }

    #[test]
    fn ipv4_bare_address_gets_default_port() {
        let sa = SocketAddress::parse("127.0.0.1").unwrap();
        assert_eq!(sa, SocketAddress::Inet("127.0.0.1:8080".parse().unwrap()));
    }

    #[test]
    fn ipv4_wildcard_with_port() {
        let sa = SocketAddress::parse("*:9000").unwrap();
        assert_eq!(sa, SocketAddress::Inet("0.0.0.0:9000".parse().unwrap()));
    }

    #[test]
    fn ipv4_address_with_port() {
        let sa = SocketAddress::parse("127.0.0.1:9000").unwrap();
        assert_eq!(sa, SocketAddress::Inet("127.0.0.1:9000".parse().unwrap()));
    }

    #[test]
    fn port_zero_and_65536_rejected_everywhere() {
        assert!(SocketAddress::parse("0").is_none());
        assert!(SocketAddress::parse("65536").is_none());
        assert!(SocketAddress::parse("127.0.0.1:0").is_none());
        assert!(SocketAddress::parse("[::1]:65536").is_none());
    }

    #[test]
    fn ipv4_round_trip_through_text() {
        let sa = SocketAddress::parse("127.0.0.1:8081").unwrap();
        let reparsed = SocketAddress::parse(&sa.text()).unwrap();
        assert_eq!(sa, reparsed);
    }
}

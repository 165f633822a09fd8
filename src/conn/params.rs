//! Contact point parsing (spec.md §4.4 "Initialization" step 1, §8
//! boundary behaviors). Grounded on the teacher's `conn/params/cp_url.rs` +
//! `url.rs`: a small, dependency-free parser rather than pulling in a
//! general URL crate for a three-shape grammar.

use std::net::SocketAddr;

use crate::error::{DriverError, DriverResult};

/// One configured contact point, not yet resolved to an [`Endpoint`]
/// (DNS resolution happens in the Control Connection, spec.md §4.4 step
/// 1, since failures there are per-host and non-fatal).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContactPoint {
    /// Already a concrete socket address — `ip:port` or `[ipv6]:port`.
    Resolved(SocketAddr),
    /// A hostname (with or without an explicit port) that still needs
    /// resolving, possibly to more than one address.
    Hostname { host: String, port: Option<u16> },
}

/// Parses one `contactPoints` entry (spec.md §6): bracketed IPv6 with
/// port, `ip:port`, bare IP, or hostname with an optional port.
pub fn parse_contact_point(raw: &str) -> DriverResult<ContactPoint> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(DriverError::ArgumentError("empty contact point".into()));
    }

    if let Some(rest) = raw.strip_prefix('[') {
        // Bracketed IPv6, optionally with a port: `[::1]:9042` or `[::1]`.
        let close = rest
            .find(']')
            .ok_or_else(|| DriverError::ArgumentError(format!("unterminated '[' in {raw}")))?;
        let host = &rest[..close];
        let remainder = &rest[close + 1..];
        let port = parse_optional_port(remainder)?;
        let ip: std::net::Ipv6Addr = host
            .parse()
            .map_err(|_| DriverError::ArgumentError(format!("invalid IPv6 address {host}")))?;
        return Ok(match port {
            Some(port) => ContactPoint::Resolved(SocketAddr::new(ip.into(), port)),
            None => ContactPoint::Hostname {
                host: ip.to_string(),
                port: None,
            },
        });
    }

    // Try a bare IPv6 address with no brackets and no port (ambiguous with
    // `host:port` only for IPv4/hostnames, since IPv6 has multiple colons).
    if raw.matches(':').count() > 1 {
        let ip: std::net::Ipv6Addr = raw
            .parse()
            .map_err(|_| DriverError::ArgumentError(format!("invalid IPv6 address {raw}")))?;
        return Ok(ContactPoint::Hostname {
            host: ip.to_string(),
            port: None,
        });
    }

    if let Some((host, port)) = raw.rsplit_once(':') {
        let port: u16 = port
            .parse()
            .map_err(|_| DriverError::ArgumentError(format!("invalid port in {raw}")))?;
        if let Ok(ip) = host.parse::<std::net::Ipv4Addr>() {
            return Ok(ContactPoint::Resolved(SocketAddr::new(ip.into(), port)));
        }
        return Ok(ContactPoint::Hostname {
            host: host.to_string(),
            port: Some(port),
        });
    }

    if let Ok(ip) = raw.parse::<std::net::Ipv4Addr>() {
        return Ok(ContactPoint::Hostname {
            host: ip.to_string(),
            port: None,
        });
    }

    Ok(ContactPoint::Hostname {
        host: raw.to_string(),
        port: None,
    })
}

fn parse_optional_port(remainder: &str) -> DriverResult<Option<u16>> {
    if remainder.is_empty() {
        return Ok(None);
    }
    let port_str = remainder
        .strip_prefix(':')
        .ok_or_else(|| DriverError::ArgumentError(format!("expected ':' after ']', got {remainder}")))?;
    Ok(Some(port_str.parse().map_err(|_| {
        DriverError::ArgumentError(format!("invalid port {port_str}"))
    })?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bracketed_ipv6_with_port() {
        let cp = parse_contact_point("[::1]:9042").unwrap();
        assert_eq!(
            cp,
            ContactPoint::Resolved("[::1]:9042".parse().unwrap())
        );
    }

    #[test]
    fn parses_ipv4_with_port() {
        let cp = parse_contact_point("10.0.0.1:9042").unwrap();
        assert_eq!(cp, ContactPoint::Resolved("10.0.0.1:9042".parse().unwrap()));
    }

    #[test]
    fn parses_bare_hostname_for_later_dual_stack_resolution() {
        let cp = parse_contact_point("localhost").unwrap();
        assert_eq!(
            cp,
            ContactPoint::Hostname {
                host: "localhost".into(),
                port: None
            }
        );
    }

    #[test]
    fn rejects_empty_contact_point() {
        assert!(parse_contact_point("   ").is_err());
    }
}

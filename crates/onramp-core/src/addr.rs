//! Destination address parsing
//!
//! Destinations arrive either as URLs (`http://foo.i2p/index.html`) or as
//! bare `host[:port]` strings (`foo.onion:80`, `[::1]:8080`). Routing only
//! needs the hostname; dialers also need the port.

use crate::error::{OnrampError, Result};
use url::Url;

/// Hostname suffix of the I2P network
pub const I2P_SUFFIX: &str = ".i2p";

/// Hostname suffix of Tor onion services
pub const ONION_SUFFIX: &str = ".onion";

/// Split a destination into host and optional port
pub fn split_host_port(addr: &str) -> Result<(String, Option<u16>)> {
    let addr = addr.trim();
    if addr.is_empty() {
        return Err(OnrampError::InvalidAddress("empty address".to_string()));
    }

    if addr.contains("://") {
        let url = Url::parse(addr)
            .map_err(|e| OnrampError::InvalidAddress(format!("{}: {}", addr, e)))?;
        let host = url
            .host_str()
            .ok_or_else(|| OnrampError::InvalidAddress(format!("{}: no host", addr)))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        return Ok((host.to_string(), url.port_or_known_default()));
    }

    // Drop any path component
    let authority = addr.split('/').next().unwrap_or(addr);

    if let Some(rest) = authority.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| OnrampError::InvalidAddress(format!("{}: unclosed bracket", addr)))?;
        let port = match tail.strip_prefix(':') {
            Some(p) => Some(parse_port(addr, p)?),
            None => None,
        };
        return Ok((host.to_string(), port));
    }

    match authority.rsplit_once(':') {
        // More than one colon without brackets is a bare IPv6 literal
        Some((host, _)) if host.contains(':') => Ok((authority.to_string(), None)),
        Some((host, port)) => {
            if host.is_empty() {
                return Err(OnrampError::InvalidAddress(format!("{}: no host", addr)));
            }
            Ok((host.to_string(), Some(parse_port(addr, port)?)))
        }
        None => Ok((authority.to_string(), None)),
    }
}

fn parse_port(addr: &str, port: &str) -> Result<u16> {
    port.parse::<u16>()
        .map_err(|_| OnrampError::InvalidAddress(format!("{}: bad port {:?}", addr, port)))
}

/// Hostname portion of a destination, lowercased
pub fn hostname(addr: &str) -> Result<String> {
    let (host, _) = split_host_port(addr)?;
    Ok(host.to_ascii_lowercase())
}

/// Whether the destination's hostname ends in `.i2p`
pub fn is_i2p(addr: &str) -> bool {
    hostname(addr)
        .map(|h| h.ends_with(I2P_SUFFIX))
        .unwrap_or(false)
}

/// Whether the destination's hostname ends in `.onion`
pub fn is_onion(addr: &str) -> bool {
    hostname(addr)
        .map(|h| h.ends_with(ONION_SUFFIX))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_host_port() {
        assert_eq!(
            split_host_port("foo.i2p:80").unwrap(),
            ("foo.i2p".to_string(), Some(80))
        );
        assert_eq!(
            split_host_port("example.com").unwrap(),
            ("example.com".to_string(), None)
        );
    }

    #[test]
    fn test_url_forms() {
        assert_eq!(
            split_host_port("http://foo.i2p/index.html").unwrap(),
            ("foo.i2p".to_string(), Some(80))
        );
        assert_eq!(
            split_host_port("https://abc.onion:8443/x").unwrap(),
            ("abc.onion".to_string(), Some(8443))
        );
    }

    #[test]
    fn test_ipv6_forms() {
        assert_eq!(
            split_host_port("[::1]:8080").unwrap(),
            ("::1".to_string(), Some(8080))
        );
        assert_eq!(split_host_port("::1").unwrap(), ("::1".to_string(), None));
    }

    #[test]
    fn test_invalid() {
        assert!(split_host_port("").is_err());
        assert!(split_host_port(":80").is_err());
        assert!(split_host_port("host:notaport").is_err());
        assert!(split_host_port("[::1:80").is_err());
    }

    #[test]
    fn test_suffix_checks() {
        assert!(is_i2p("FOO.I2P:80"));
        assert!(is_i2p("abcdef.b32.i2p"));
        assert!(!is_i2p("i2p.example.com"));
        assert!(is_onion("abc.onion:80"));
        assert!(!is_onion("example.com:80"));
    }
}

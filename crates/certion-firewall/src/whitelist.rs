//! Source-IP whitelist with CIDR support
//!
//! Entries are individual addresses ("203.0.113.7", "2001:db8::1") or CIDR
//! ranges ("10.0.0.0/8"). An empty whitelist exempts nobody.

use ipnet::IpNet;
use std::net::IpAddr;

use crate::error::FirewallError;

/// A single address becomes a host network (/32 or /128)
fn parse_entry(entry: &str) -> Result<IpNet, FirewallError> {
    let trimmed = entry.trim();
    if trimmed.contains('/') {
        trimmed
            .parse::<IpNet>()
            .map_err(|_| FirewallError::InvalidWhitelistEntry(entry.to_string()))
    } else {
        trimmed
            .parse::<IpAddr>()
            .map(IpNet::from)
            .map_err(|_| FirewallError::InvalidWhitelistEntry(entry.to_string()))
    }
}

/// Set of addresses exempt from rate limiting and rule evaluation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IpWhitelist {
    networks: Vec<IpNet>,
}

impl IpWhitelist {
    /// Parse every entry, failing on the first invalid one
    pub fn parse<S: AsRef<str>>(entries: &[S]) -> Result<Self, FirewallError> {
        let networks = entries
            .iter()
            .map(|e| parse_entry(e.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { networks })
    }

    /// Parse entries, dropping invalid ones.
    ///
    /// Used at evaluation time where a bad stored entry must not fail the
    /// request; returns the rejected entries for logging.
    pub fn parse_lenient<S: AsRef<str>>(entries: &[S]) -> (Self, Vec<String>) {
        let mut networks = Vec::with_capacity(entries.len());
        let mut rejected = Vec::new();
        for entry in entries {
            match parse_entry(entry.as_ref()) {
                Ok(network) => networks.push(network),
                Err(_) => rejected.push(entry.as_ref().to_string()),
            }
        }
        (Self { networks }, rejected)
    }

    pub fn contains(&self, ip: &IpAddr) -> bool {
        let ip = canonical(ip);
        self.networks.iter().any(|n| n.contains(&ip))
    }

    pub fn is_empty(&self) -> bool {
        self.networks.is_empty()
    }
}

/// IPv4-mapped IPv6 addresses compare as IPv4
fn canonical(ip: &IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6
            .to_ipv4_mapped()
            .map(IpAddr::V4)
            .unwrap_or(IpAddr::V6(*v6)),
        v4 => *v4,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_empty_whitelist_exempts_nobody() {
        let list = IpWhitelist::default();
        assert!(list.is_empty());
        assert!(!list.contains(&ip("127.0.0.1")));
    }

    #[test]
    fn test_exact_and_cidr_entries() {
        let list = IpWhitelist::parse(&["203.0.113.7", "10.0.0.0/8"]).unwrap();
        assert!(list.contains(&ip("203.0.113.7")));
        assert!(!list.contains(&ip("203.0.113.8")));
        assert!(list.contains(&ip("10.200.3.4")));
        assert!(!list.contains(&ip("11.0.0.1")));
    }

    #[test]
    fn test_single_address_is_host_network() {
        let list = IpWhitelist::parse(&[" 2001:db8::1 ", "198.51.100.4"]).unwrap();
        assert!(list.contains(&ip("2001:db8::1")));
        assert!(!list.contains(&ip("2001:db8::2")));
        assert!(list.contains(&ip("198.51.100.4")));
        assert!(!list.contains(&ip("198.51.100.5")));
    }

    #[test]
    fn test_ipv6_cidr() {
        let list = IpWhitelist::parse(&["2001:db8::/32"]).unwrap();
        assert!(list.contains(&ip("2001:db8:1::42")));
        assert!(!list.contains(&ip("2001:db9::1")));
        assert!(!list.contains(&ip("10.0.0.1")));
    }

    #[test]
    fn test_ipv4_mapped_address_matches_v4_entry() {
        let list = IpWhitelist::parse(&["192.168.1.0/24"]).unwrap();
        assert!(list.contains(&ip("::ffff:192.168.1.20")));
    }

    #[test]
    fn test_zero_prefix_stays_within_family() {
        let list = IpWhitelist::parse(&["0.0.0.0/0"]).unwrap();
        assert!(list.contains(&ip("8.8.8.8")));
        assert!(!list.contains(&ip("2001:db8::1")));
    }

    #[test]
    fn test_invalid_entries() {
        assert!(IpWhitelist::parse(&["not-an-ip"]).is_err());
        assert!(IpWhitelist::parse(&["10.0.0.0/33"]).is_err());
        assert!(IpWhitelist::parse(&["10.0.0.0/abc"]).is_err());

        let (list, rejected) = IpWhitelist::parse_lenient(&["bogus", "10.0.0.1"]);
        assert_eq!(rejected, vec!["bogus".to_string()]);
        assert!(list.contains(&ip("10.0.0.1")));
    }
}

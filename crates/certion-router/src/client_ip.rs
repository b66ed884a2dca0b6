//! Source IP of a public request

use http::HeaderMap;
use std::net::{IpAddr, SocketAddr};

pub const CF_CONNECTING_IP: &str = "cf-connecting-ip";
pub const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Resolve the client address.
///
/// With `trust_forwarded` (relay behind Cloudflare or another proxy) the
/// `CF-Connecting-IP` header wins, then the first `X-Forwarded-For` entry.
/// Unparseable header values fall through to the socket peer.
pub fn client_ip(headers: &HeaderMap, peer: SocketAddr, trust_forwarded: bool) -> IpAddr {
    if trust_forwarded {
        if let Some(ip) = header_ip(headers, CF_CONNECTING_IP, false) {
            return ip;
        }
        if let Some(ip) = header_ip(headers, X_FORWARDED_FOR, true) {
            return ip;
        }
    }
    peer.ip()
}

fn header_ip(headers: &HeaderMap, name: &str, first_of_list: bool) -> Option<IpAddr> {
    let value = headers.get(name)?.to_str().ok()?;
    let candidate = if first_of_list {
        value.split(',').next()?
    } else {
        value
    };
    candidate.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn peer() -> SocketAddr {
        "10.0.0.9:51234".parse().unwrap()
    }

    #[test]
    fn test_peer_address_by_default() {
        let mut headers = HeaderMap::new();
        headers.insert(CF_CONNECTING_IP, HeaderValue::from_static("1.2.3.4"));
        assert_eq!(
            client_ip(&headers, peer(), false),
            "10.0.0.9".parse::<IpAddr>().unwrap()
        );
    }

    #[test]
    fn test_forwarded_headers_when_trusted() {
        let mut headers = HeaderMap::new();
        headers.insert(
            X_FORWARDED_FOR,
            HeaderValue::from_static("5.6.7.8, 10.0.0.1"),
        );
        assert_eq!(
            client_ip(&headers, peer(), true),
            "5.6.7.8".parse::<IpAddr>().unwrap()
        );

        headers.insert(CF_CONNECTING_IP, HeaderValue::from_static("2001:db8::1"));
        assert_eq!(
            client_ip(&headers, peer(), true),
            "2001:db8::1".parse::<IpAddr>().unwrap()
        );
    }

    #[test]
    fn test_garbage_header_falls_back_to_peer() {
        let mut headers = HeaderMap::new();
        headers.insert(X_FORWARDED_FOR, HeaderValue::from_static("unknown"));
        assert_eq!(
            client_ip(&headers, peer(), true),
            "10.0.0.9".parse::<IpAddr>().unwrap()
        );
    }
}

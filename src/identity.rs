//! Connection identity
//!
//! A channel is named after the client's address: the first non-empty of
//! `X-Real-Ip`, the first hop in `X-Forwarded-For`, then the peer socket
//! address.

use std::net::SocketAddr;

use axum::http::HeaderMap;

/// Header set by a trusted reverse proxy
pub const REAL_IP_HEADER: &str = "x-real-ip";

/// Standard proxy chain header
pub const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";

/// Cookie carrying the identity back on non-streaming requests
pub const SESSION_COOKIE: &str = "ws-ip";

/// Derive the identity for a connecting client
pub fn from_request(headers: &HeaderMap, peer: SocketAddr) -> String {
    header_value(headers, REAL_IP_HEADER)
        .or_else(|| {
            header_value(headers, FORWARDED_FOR_HEADER)
                .and_then(|chain| chain.split(',').map(str::trim).find(|hop| !hop.is_empty()))
        })
        .map(str::to_owned)
        .unwrap_or_else(|| peer.to_string())
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn peer() -> SocketAddr {
        "192.168.1.20:51234".parse().unwrap()
    }

    #[test]
    fn test_real_ip_wins() {
        let mut headers = HeaderMap::new();
        headers.insert("X-Real-Ip", HeaderValue::from_static("10.0.0.1"));
        headers.insert("X-Forwarded-For", HeaderValue::from_static("10.0.0.2"));
        assert_eq!(from_request(&headers, peer()), "10.0.0.1");
    }

    #[test]
    fn test_forwarded_for_first_hop() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "X-Forwarded-For",
            HeaderValue::from_static("203.0.113.7, 10.0.0.2"),
        );
        assert_eq!(from_request(&headers, peer()), "203.0.113.7");
    }

    #[test]
    fn test_empty_headers_fall_through() {
        let mut headers = HeaderMap::new();
        headers.insert("X-Real-Ip", HeaderValue::from_static(""));
        headers.insert("X-Forwarded-For", HeaderValue::from_static(" , "));
        assert_eq!(from_request(&headers, peer()), "192.168.1.20:51234");
    }

    #[test]
    fn test_peer_address_fallback() {
        assert_eq!(from_request(&HeaderMap::new(), peer()), "192.168.1.20:51234");
    }
}

mod admin_auth;
mod ip_filter;

pub use admin_auth::{require_admin_token, AdminAuth};
pub use ip_filter::IpFilterLayer;

use axum::http::HeaderMap;
use ipnetwork::IpNetwork;
use std::net::IpAddr;

/// Client address of a request
///
/// Proxy headers (`X-Forwarded-For` first hop, then `X-Real-IP`) are only
/// honored when the socket peer is itself allowed; any other peer is judged by
/// its own address. Without a peer address the client is unknown.
pub(crate) fn client_ip(
    headers: &HeaderMap,
    peer: Option<IpAddr>,
    allowed_networks: &[IpNetwork],
) -> Option<IpAddr> {
    let peer = peer?;
    if !is_allowed(allowed_networks, peer) {
        return Some(peer);
    }

    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.split(',').next())
        .and_then(|s| s.trim().parse::<IpAddr>().ok());

    let real_ip = || {
        headers
            .get("x-real-ip")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<IpAddr>().ok())
    };

    forwarded.or_else(real_ip).or(Some(peer))
}

/// Loopback is always allowed
pub(crate) fn is_allowed(allowed_networks: &[IpNetwork], ip: IpAddr) -> bool {
    ip.is_loopback() || allowed_networks.iter().any(|network| network.contains(ip))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use std::str::FromStr;

    #[test]
    fn test_loopback_always_allowed() {
        let allowed: Vec<IpNetwork> = vec![];
        assert!(is_allowed(&allowed, "127.0.0.1".parse().unwrap()));
        assert!(is_allowed(&allowed, "::1".parse().unwrap()));
    }

    #[test]
    fn test_network_membership() {
        let allowed = vec![IpNetwork::from_str("10.0.1.0/24").unwrap()];
        assert!(is_allowed(&allowed, "10.0.1.5".parse().unwrap()));
        assert!(!is_allowed(&allowed, "10.0.2.1".parse().unwrap()));
        assert!(!is_allowed(&allowed, "8.8.8.8".parse().unwrap()));
    }

    #[test]
    fn test_client_ip_precedence() {
        let allowed = vec![IpNetwork::from_str("192.168.1.0/24").unwrap()];
        let proxy: Option<IpAddr> = Some("192.168.1.10".parse().unwrap());
        let mut headers = HeaderMap::new();
        assert_eq!(client_ip(&headers, proxy, &allowed), proxy);

        headers.insert("x-real-ip", HeaderValue::from_static("10.0.0.7"));
        assert_eq!(client_ip(&headers, proxy, &allowed), Some("10.0.0.7".parse().unwrap()));

        headers.insert("x-forwarded-for", HeaderValue::from_static("10.0.0.9, 172.16.0.1"));
        assert_eq!(client_ip(&headers, proxy, &allowed), Some("10.0.0.9".parse().unwrap()));

        assert_eq!(client_ip(&headers, None, &allowed), None);
    }

    #[test]
    fn test_headers_from_untrusted_peer_ignored() {
        let allowed = vec![IpNetwork::from_str("10.0.0.0/8").unwrap()];
        let outsider: Option<IpAddr> = Some("203.0.113.5".parse().unwrap());
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("127.0.0.1"));
        headers.insert("x-real-ip", HeaderValue::from_static("10.0.0.1"));

        assert_eq!(client_ip(&headers, outsider, &allowed), outsider);
    }
}

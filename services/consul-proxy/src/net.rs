//! Address selection helpers.

use std::net::SocketAddr;

/// Pick the first IPv4 address, falling back to the first address of any
/// family.
///
/// `localhost` commonly resolves to `::1` before `127.0.0.1`; binding or
/// dialing only the IPv6 loopback leaves IPv4-only peers unreachable.
pub(crate) fn prefer_ipv4(addrs: impl IntoIterator<Item = SocketAddr>) -> Option<SocketAddr> {
    let mut first = None;
    for addr in addrs {
        if addr.is_ipv4() {
            return Some(addr);
        }
        first.get_or_insert(addr);
    }
    first
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_prefers_ipv4_over_earlier_ipv6() {
        let picked = prefer_ipv4([addr("[::1]:9090"), addr("127.0.0.1:9090")]);
        assert_eq!(picked, Some(addr("127.0.0.1:9090")));
    }

    #[test]
    fn test_falls_back_to_first_address() {
        let picked = prefer_ipv4([addr("[::1]:53"), addr("[fe80::1]:53")]);
        assert_eq!(picked, Some(addr("[::1]:53")));
    }

    #[test]
    fn test_empty_input() {
        assert_eq!(prefer_ipv4(Vec::new()), None);
    }
}

use std::net::IpAddr;

use ipnet::IpNet;

/// Reserved address blocks that are never redirected.
const RESERVED_BLOCKS: [&str; 8] = [
    "127.0.0.0/8",    // IPv4 loopback
    "10.0.0.0/8",     // RFC1918
    "172.16.0.0/12",  // RFC1918
    "192.168.0.0/16", // RFC1918
    "169.254.0.0/16", // RFC3927 link-local
    "::1/128",        // IPv6 loopback
    "fe80::/10",      // IPv6 link-local
    "fc00::/7",       // IPv6 unique local
];

/// Private and link-scoped address classification.
///
/// Built once at startup and shared behind an `Arc`; traffic to any address
/// it matches stays on the direct path.
#[derive(Debug)]
pub struct PrivateNetworks {
    blocks: Vec<IpNet>,
}

impl PrivateNetworks {
    pub fn new() -> Self {
        let blocks = RESERVED_BLOCKS
            .iter()
            .map(|cidr| cidr.parse().expect("reserved CIDR literals parse"))
            .collect();
        Self { blocks }
    }

    /// True for loopback, link-local, link-local multicast, RFC1918 and
    /// unique-local destinations.
    pub fn contains(&self, ip: IpAddr) -> bool {
        if ip.is_loopback() || is_link_local_unicast(ip) || is_link_local_multicast(ip) {
            return true;
        }
        self.blocks.iter().any(|block| block.contains(&ip))
    }
}

impl Default for PrivateNetworks {
    fn default() -> Self {
        Self::new()
    }
}

fn is_link_local_unicast(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_link_local(),
        IpAddr::V6(v6) => (v6.segments()[0] & 0xffc0) == 0xfe80,
    }
}

fn is_link_local_multicast(ip: IpAddr) -> bool {
    match ip {
        // 224.0.0.0/24
        IpAddr::V4(v4) => {
            let octets = v4.octets();
            octets[0] == 224 && octets[1] == 0 && octets[2] == 0
        }
        // ff02::/16
        IpAddr::V6(v6) => (v6.segments()[0] & 0xff0f) == 0xff02,
    }
}

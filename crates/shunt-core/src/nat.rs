use std::net::Ipv4Addr;

use dashmap::DashMap;

/// Per-rule NAT table mapping a client's ephemeral source port to the
/// original destination address captured at forward-rewrite time.
///
/// Written on the forward path and read on the reverse path, potentially
/// from concurrent packet tasks. The OS hands out unique ephemeral ports per
/// live connection, so an insert for a reused port overwrites a stale entry.
#[derive(Debug, Default)]
pub struct NatMap {
    entries: DashMap<u16, Ipv4Addr>,
}

impl NatMap {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Record the original destination for a client source port.
    pub fn record(&self, src_port: u16, original_dst: Ipv4Addr) {
        self.entries.insert(src_port, original_dst);
    }

    /// Original destination captured for a client port, if any.
    pub fn original_dst(&self, port: u16) -> Option<Ipv4Addr> {
        self.entries.get(&port).map(|e| *e)
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

use std::net::IpAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use shunt_core::{PrivateNetworks, RedirectRule};

use crate::channel::{ChannelError, DivertPacket, PacketChannel};
use crate::packet;

const MAX_TCP_PORTS: usize = 65536;

#[derive(Debug, Error)]
#[error("port {0} is claimed by more than one rule")]
pub struct DuplicatePort(pub u16);

/// Resolves a TCP port to the rule that claimed it, either as its protocol
/// port or as its local target port. Read-only once built.
pub struct PortLookup {
    table: Vec<Option<Arc<RedirectRule>>>,
}

impl PortLookup {
    /// Build the table, rejecting configurations where two rules claim the
    /// same port on either side.
    pub fn build(rules: &[Arc<RedirectRule>]) -> Result<Self, DuplicatePort> {
        let mut table: Vec<Option<Arc<RedirectRule>>> = vec![None; MAX_TCP_PORTS];
        for rule in rules {
            for port in [rule.protocol_port(), rule.target_port()] {
                let slot = &mut table[port as usize];
                if slot.is_some() {
                    return Err(DuplicatePort(port));
                }
                *slot = Some(rule.clone());
            }
        }
        Ok(Self { table })
    }

    pub fn get(&self, port: u16) -> Option<&Arc<RedirectRule>> {
        self.table[port as usize].as_ref()
    }
}

/// Filter expression selecting packets headed for any rule's protocol port
/// or leaving any rule's target port.
pub fn build_filter(rules: &[Arc<RedirectRule>]) -> String {
    let clauses: Vec<String> = rules
        .iter()
        .map(|rule| {
            format!(
                "tcp.DstPort == {} or tcp.SrcPort == {}",
                rule.protocol_port(),
                rule.target_port()
            )
        })
        .collect();
    format!("tcp and ({})", clauses.join(" or "))
}

/// What the engine decided to do with a diverted packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Verdict {
    /// Client-to-remote packet, rewritten toward the local listener.
    Forward,
    /// Listener-to-client packet, restored to the original remote identity.
    Reverse,
    /// Not ours to touch; reinjected unchanged.
    Passthrough,
}

#[derive(Debug, Error)]
pub(crate) enum RewriteError {
    #[error(transparent)]
    Packet(#[from] packet::PacketError),
    #[error("no NAT entry for client port {0}")]
    MissingNatEntry(u16),
}

/// Classify and rewrite one diverted packet in place.
pub(crate) fn rewrite_packet(
    data: &mut [u8],
    lookup: &PortLookup,
    private: &PrivateNetworks,
) -> Result<Verdict, RewriteError> {
    if !packet::is_ipv4_tcp(data) {
        // IPv6 and non-TCP traffic gets address-class recognition only.
        return Ok(Verdict::Passthrough);
    }
    let flow = packet::parse_tcp_flow(data)?;

    if let Some(rule) = lookup.get(flow.dst_port) {
        if rule.protocol_port() == flow.dst_port {
            let dst = IpAddr::V4(flow.dst_addr);
            if private.contains(dst) || rule.is_excluded_ip(dst) {
                return Ok(Verdict::Passthrough);
            }
            rule.nat().record(flow.src_port, flow.dst_addr);
            packet::set_destination(data, flow.header_len, rule.target_ip(), rule.target_port());
            packet::update_checksums(data, flow.header_len);
            return Ok(Verdict::Forward);
        }
    }

    if let Some(rule) = lookup.get(flow.src_port) {
        if rule.target_port() == flow.src_port {
            let original_dst = rule
                .nat()
                .original_dst(flow.dst_port)
                .ok_or(RewriteError::MissingNatEntry(flow.dst_port))?;
            packet::set_source(data, flow.header_len, original_dst, rule.protocol_port());
            packet::update_checksums(data, flow.header_len);
            return Ok(Verdict::Reverse);
        }
    }

    Ok(Verdict::Passthrough)
}

/// Pulls diverted packets off the channel and dispatches rewrites.
///
/// A relay thread owns the blocking receive side and feeds an unbounded
/// queue; the pump task spawns one task per packet so rewrite work never
/// serializes the pump. Per-packet failures drop the packet and nothing
/// else.
pub(crate) struct PacketEngine<C: PacketChannel> {
    channel: Arc<C>,
    lookup: Arc<PortLookup>,
    private: Arc<PrivateNetworks>,
}

impl<C: PacketChannel> PacketEngine<C> {
    pub(crate) fn new(
        channel: Arc<C>,
        lookup: Arc<PortLookup>,
        private: Arc<PrivateNetworks>,
    ) -> Self {
        Self {
            channel,
            lookup,
            private,
        }
    }

    /// Spawn the relay thread and the pump task. The returned handle
    /// resolves once the channel closes and the queue has drained.
    pub(crate) fn spawn(self) -> JoinHandle<()> {
        let (tx, mut rx) = mpsc::unbounded_channel::<C::Packet>();

        let channel = self.channel.clone();
        std::thread::spawn(move || loop {
            match channel.recv() {
                Ok(packet) => {
                    if tx.send(packet).is_err() {
                        break;
                    }
                }
                Err(ChannelError::Closed) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "packet receive failed");
                    std::thread::sleep(std::time::Duration::from_millis(1));
                }
            }
        });

        let channel = self.channel;
        let lookup = self.lookup;
        let private = self.private;
        tokio::spawn(async move {
            tracing::info!("redirecting intercepted packets");
            while let Some(mut packet) = rx.recv().await {
                let channel = channel.clone();
                let lookup = lookup.clone();
                let private = private.clone();
                tokio::spawn(async move {
                    match rewrite_packet(packet.data_mut(), &lookup, &private) {
                        Ok(verdict) => {
                            if verdict != Verdict::Passthrough {
                                tracing::trace!(?verdict, "rewrote diverted packet");
                            }
                            if let Err(e) = channel.send(packet) {
                                tracing::debug!(error = %e, "packet reinjection failed");
                            }
                        }
                        Err(e) => {
                            tracing::debug!(error = %e, "dropping undeliverable packet");
                        }
                    }
                });
            }
            tracing::debug!("packet pump drained");
        })
    }
}

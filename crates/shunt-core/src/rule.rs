use std::net::{IpAddr, Ipv4Addr};

use ipnet::IpNet;
use thiserror::Error;

use crate::nat::NatMap;

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("port 0 is not a valid {0} port")]
    ZeroPort(&'static str),
    #[error("protocol port and target port must differ (both are {0})")]
    PortClash(u16),
    #[error("invalid proxy address {0:?}: expected host:port")]
    InvalidProxyAddress(String),
}

/// Which upstream adapter services connections accepted for a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handler {
    Http,
    Https,
}

/// One port redirection: which protocol port to intercept, where the local
/// listener sits, and which upstream proxy finally receives the traffic.
///
/// All fields are fixed at construction; only the NAT map mutates over the
/// rule's lifetime.
#[derive(Debug)]
pub struct RedirectRule {
    protocol_port: u16,
    target_port: u16,
    target_ip: Ipv4Addr,
    proxy_addr: String,
    handler: Handler,
    excluded_networks: Vec<IpNet>,
    nat: NatMap,
}

impl RedirectRule {
    pub fn new(
        protocol_port: u16,
        target_port: u16,
        target_ip: Ipv4Addr,
        proxy_addr: impl Into<String>,
        handler: Handler,
        excluded_networks: Vec<IpNet>,
    ) -> Result<Self, RuleError> {
        if protocol_port == 0 {
            return Err(RuleError::ZeroPort("protocol"));
        }
        if target_port == 0 {
            return Err(RuleError::ZeroPort("target"));
        }
        if protocol_port == target_port {
            return Err(RuleError::PortClash(protocol_port));
        }
        let proxy_addr = proxy_addr.into();
        validate_proxy_addr(&proxy_addr)?;

        Ok(Self {
            protocol_port,
            target_port,
            target_ip,
            proxy_addr,
            handler,
            excluded_networks,
            nat: NatMap::new(),
        })
    }

    /// The well-known port being intercepted (80, 443, ...).
    pub fn protocol_port(&self) -> u16 {
        self.protocol_port
    }

    /// The local port the adapter listens on.
    pub fn target_port(&self) -> u16 {
        self.target_port
    }

    /// Local address the listener binds.
    pub fn target_ip(&self) -> Ipv4Addr {
        self.target_ip
    }

    /// Upstream proxy in host:port form.
    pub fn proxy_addr(&self) -> &str {
        &self.proxy_addr
    }

    pub fn handler(&self) -> Handler {
        self.handler
    }

    /// Source-port to original-destination state for this rule.
    pub fn nat(&self) -> &NatMap {
        &self.nat
    }

    /// True if any excluded CIDR contains `ip`.
    pub fn is_excluded_ip(&self, ip: IpAddr) -> bool {
        self.excluded_networks.iter().any(|net| net.contains(&ip))
    }
}

fn validate_proxy_addr(addr: &str) -> Result<(), RuleError> {
    let invalid = || RuleError::InvalidProxyAddress(addr.to_string());
    let (host, port) = addr.rsplit_once(':').ok_or_else(invalid)?;
    if host.is_empty() || port.parse::<u16>().map_or(true, |p| p == 0) {
        return Err(invalid());
    }
    Ok(())
}

use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use shunt_core::proxy::{self, ProxyError};
use shunt_core::rule::Handler;
use shunt_core::{PrivateNetworks, RedirectRule};

use crate::channel::{ChannelError, PacketChannel};
use crate::engine::{build_filter, DuplicatePort, PacketEngine, PortLookup};
use crate::PlatformChannel;

#[derive(Debug, Error)]
pub enum RedirectorError {
    #[error("a redirector needs at least one rule")]
    NoRules,
    #[error(transparent)]
    DuplicatePort(#[from] DuplicatePort),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error("failed to bind listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },
}

/// Owns the packet filter channel, the pump, and the per-rule listeners.
///
/// Dropping a `Redirector` without calling `close` leaves the channel open;
/// callers are expected to shut down explicitly.
#[derive(Debug)]
pub struct Redirector<C: PacketChannel> {
    channel: Arc<C>,
    pump: JoinHandle<()>,
    listeners: Vec<JoinHandle<()>>,
}

impl Redirector<PlatformChannel> {
    /// Open the platform packet filter and start redirecting.
    pub async fn start(rules: Vec<RedirectRule>) -> Result<Self, RedirectorError> {
        let rules: Vec<Arc<RedirectRule>> = rules.into_iter().map(Arc::new).collect();
        let lookup = prepare(&rules)?;
        let filter = build_filter(&rules);
        tracing::debug!(filter = %filter, "packet filter expression");
        let channel = Arc::new(PlatformChannel::open(&filter)?);
        assemble(rules, lookup, channel).await
    }
}

impl<C: PacketChannel> Redirector<C> {
    /// Start over an explicitly provided diversion channel.
    pub async fn with_channel(
        rules: Vec<RedirectRule>,
        channel: Arc<C>,
    ) -> Result<Self, RedirectorError> {
        let rules: Vec<Arc<RedirectRule>> = rules.into_iter().map(Arc::new).collect();
        let lookup = prepare(&rules)?;
        assemble(rules, lookup, channel).await
    }

    /// Release the packet filter and stop the listeners. In-flight handler
    /// tasks finish on their own.
    pub fn close(&self) {
        self.channel.close();
        for listener in &self.listeners {
            listener.abort();
        }
    }

    /// Close and wait for the packet pump to drain.
    pub async fn shutdown(self) {
        self.close();
        let _ = self.pump.await;
    }
}

fn prepare(rules: &[Arc<RedirectRule>]) -> Result<Arc<PortLookup>, RedirectorError> {
    if rules.is_empty() {
        return Err(RedirectorError::NoRules);
    }
    Ok(Arc::new(PortLookup::build(rules)?))
}

async fn assemble<C: PacketChannel>(
    rules: Vec<Arc<RedirectRule>>,
    lookup: Arc<PortLookup>,
    channel: Arc<C>,
) -> Result<Redirector<C>, RedirectorError> {
    let private = Arc::new(PrivateNetworks::new());
    let pump = PacketEngine::new(channel.clone(), lookup, private).spawn();

    let mut listeners = Vec::with_capacity(rules.len());
    for rule in &rules {
        match spawn_listener(rule.clone()).await {
            Ok(handle) => listeners.push(handle),
            Err(e) => {
                channel.close();
                for listener in &listeners {
                    listener.abort();
                }
                return Err(e);
            }
        }
    }

    Ok(Redirector {
        channel,
        pump,
        listeners,
    })
}

/// Bind the rule's local listener and run its accept loop.
async fn spawn_listener(rule: Arc<RedirectRule>) -> Result<JoinHandle<()>, RedirectorError> {
    let addr = SocketAddr::from((rule.target_ip(), rule.target_port()));
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| RedirectorError::Bind { addr, source })?;
    tracing::info!(addr = %addr, handler = ?rule.handler(), "listening for redirected connections");

    Ok(tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((conn, peer)) => {
                    let rule = rule.clone();
                    tokio::spawn(async move {
                        if let Err(e) = dispatch(conn, &rule).await {
                            tracing::error!(peer = %peer, error = %e, "connection handler failed");
                        }
                    });
                }
                Err(e) => {
                    tracing::error!(error = %e, "accept failed, stopping listener");
                    break;
                }
            }
        }
    }))
}

async fn dispatch(conn: TcpStream, rule: &RedirectRule) -> Result<(), ProxyError> {
    match rule.handler() {
        Handler::Http => proxy::http::run(conn, rule).await,
        Handler::Https => proxy::https::run(conn, rule).await,
    }
}

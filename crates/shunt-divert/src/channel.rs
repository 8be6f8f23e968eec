use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("failed to open packet filter handle: {0}")]
    Open(String),
    #[error("packet receive failed: {0}")]
    Recv(String),
    #[error("packet send failed: {0}")]
    Send(String),
    #[error("packet filter handle is closed")]
    Closed,
    #[error("packet diversion is not supported on this platform")]
    Unsupported,
}

/// A diverted packet: raw bytes plus whatever reinjection metadata the
/// backend carries alongside them.
pub trait DivertPacket {
    fn data(&self) -> &[u8];
    fn data_mut(&mut self) -> &mut [u8];
}

/// Kernel packet-diversion seam.
///
/// `recv` blocks its calling thread, so the engine runs it on a dedicated
/// relay thread. `send` may be called from any task; backends that are not
/// safe for concurrent sends serialize internally. After `close`, `recv`
/// reports `ChannelError::Closed` and the relay thread winds down.
pub trait PacketChannel: Send + Sync + Sized + 'static {
    type Packet: DivertPacket + Send + 'static;

    /// Open a handle diverting packets that match `filter`.
    fn open(filter: &str) -> Result<Self, ChannelError>;

    /// Block until the next diverted packet arrives.
    fn recv(&self) -> Result<Self::Packet, ChannelError>;

    /// Reinject a (possibly rewritten) packet.
    fn send(&self, packet: Self::Packet) -> Result<(), ChannelError>;

    /// Release the handle; pending and future `recv` calls observe `Closed`.
    fn close(&self);
}

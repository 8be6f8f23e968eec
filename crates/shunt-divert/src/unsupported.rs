use crate::channel::{ChannelError, DivertPacket, PacketChannel};

/// Raw packet wrapper used by the stub channel.
pub struct RawPacket(Vec<u8>);

impl DivertPacket for RawPacket {
    fn data(&self) -> &[u8] {
        &self.0
    }

    fn data_mut(&mut self) -> &mut [u8] {
        &mut self.0
    }
}

/// Stand-in for platforms without a diversion backend; `open` always fails.
pub struct UnsupportedChannel;

impl PacketChannel for UnsupportedChannel {
    type Packet = RawPacket;

    fn open(_filter: &str) -> Result<Self, ChannelError> {
        Err(ChannelError::Unsupported)
    }

    fn recv(&self) -> Result<Self::Packet, ChannelError> {
        Err(ChannelError::Closed)
    }

    fn send(&self, _packet: Self::Packet) -> Result<(), ChannelError> {
        Err(ChannelError::Closed)
    }

    fn close(&self) {}
}

use std::borrow::Cow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use windivert::prelude::*;

use crate::channel::{ChannelError, DivertPacket, PacketChannel};

const MAX_PACKET_SIZE: usize = 65535;

/// Packet pulled off the WinDivert network layer, with the address block
/// WinDivert wants back at reinjection time.
pub struct WinDivertPacketBuf {
    address: WinDivertAddress<NetworkLayer>,
    data: Vec<u8>,
}

impl DivertPacket for WinDivertPacketBuf {
    fn data(&self) -> &[u8] {
        &self.data
    }

    fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

/// WinDivert-backed diversion channel.
///
/// Two handles: one diverting matches of the filter expression, one
/// send-only handle for reinjection. Receives come from the single relay
/// thread; sends are serialized behind the handle's mutex.
pub struct WinDivertChannel {
    recv_handle: Mutex<WinDivert<NetworkLayer>>,
    send_handle: Mutex<WinDivert<NetworkLayer>>,
    closed: AtomicBool,
}

impl PacketChannel for WinDivertChannel {
    type Packet = WinDivertPacketBuf;

    fn open(filter: &str) -> Result<Self, ChannelError> {
        let recv_handle = WinDivert::network(filter, 0, WinDivertFlags::new())
            .map_err(|e| ChannelError::Open(e.to_string()))?;
        let send_handle = WinDivert::network("false", 0, WinDivertFlags::new().set_send_only())
            .map_err(|e| ChannelError::Open(e.to_string()))?;
        Ok(Self {
            recv_handle: Mutex::new(recv_handle),
            send_handle: Mutex::new(send_handle),
            closed: AtomicBool::new(false),
        })
    }

    fn recv(&self) -> Result<Self::Packet, ChannelError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ChannelError::Closed);
        }
        let mut buf = vec![0u8; MAX_PACKET_SIZE];
        let handle = self.recv_handle.lock().unwrap();
        let packet = handle
            .recv(Some(&mut buf))
            .map_err(|e| ChannelError::Recv(e.to_string()))?;
        if self.closed.load(Ordering::SeqCst) {
            return Err(ChannelError::Closed);
        }
        Ok(WinDivertPacketBuf {
            address: packet.address,
            data: packet.data.into_owned(),
        })
    }

    fn send(&self, packet: Self::Packet) -> Result<(), ChannelError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ChannelError::Closed);
        }
        let divert_packet = WinDivertPacket::<NetworkLayer> {
            address: packet.address,
            data: Cow::Owned(packet.data),
        };
        let handle = self.send_handle.lock().unwrap();
        handle
            .send(&divert_packet)
            .map_err(|e| ChannelError::Send(e.to_string()))?;
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

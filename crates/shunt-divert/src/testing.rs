use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};

use crate::channel::{ChannelError, DivertPacket, PacketChannel};

pub(crate) struct MockPacket(pub(crate) Vec<u8>);

impl DivertPacket for MockPacket {
    fn data(&self) -> &[u8] {
        &self.0
    }

    fn data_mut(&mut self) -> &mut [u8] {
        &mut self.0
    }
}

/// In-memory channel: tests preload incoming packets, the engine drains
/// them, and reinjected packets land in `sent`.
#[derive(Debug)]
pub(crate) struct MockChannel {
    incoming: Mutex<VecDeque<Vec<u8>>>,
    available: Condvar,
    pub(crate) sent: Mutex<Vec<Vec<u8>>>,
    closed: AtomicBool,
}

impl MockChannel {
    pub(crate) fn new(packets: Vec<Vec<u8>>) -> Self {
        Self {
            incoming: Mutex::new(packets.into()),
            available: Condvar::new(),
            sent: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }
}

impl PacketChannel for MockChannel {
    type Packet = MockPacket;

    fn open(_filter: &str) -> Result<Self, ChannelError> {
        Ok(Self::new(Vec::new()))
    }

    fn recv(&self) -> Result<Self::Packet, ChannelError> {
        let mut incoming = self.incoming.lock().unwrap();
        loop {
            if let Some(data) = incoming.pop_front() {
                return Ok(MockPacket(data));
            }
            if self.closed.load(Ordering::SeqCst) {
                return Err(ChannelError::Closed);
            }
            incoming = self.available.wait(incoming).unwrap();
        }
    }

    fn send(&self, packet: Self::Packet) -> Result<(), ChannelError> {
        self.sent.lock().unwrap().push(packet.0);
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.available.notify_all();
    }
}

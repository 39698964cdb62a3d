//! In-memory IP device between the packet pipeline and smoltcp.

use smoltcp::phy::{self, DeviceCapabilities, Medium};
use smoltcp::time::Instant;
use std::collections::VecDeque;
use std::sync::Arc;
use vnic_core::{Packet, PacketPool};

/// Packet queues in both directions. Inbound packets go back to the pool
/// once the stack has consumed them; outbound packets are drawn from it.
pub(crate) struct QueueDevice {
    pub(crate) rx: VecDeque<Packet>,
    pub(crate) tx: VecDeque<Packet>,
    pool: Arc<PacketPool>,
    mtu: usize,
}

impl QueueDevice {
    pub(crate) fn new(pool: Arc<PacketPool>, mtu: usize) -> Self {
        Self {
            rx: VecDeque::new(),
            tx: VecDeque::new(),
            pool,
            mtu,
        }
    }
}

pub(crate) struct PacketRxToken<'a> {
    packet: Packet,
    pool: &'a PacketPool,
}

impl phy::RxToken for PacketRxToken<'_> {
    fn consume<R, F>(self, f: F) -> R
    where
        F: FnOnce(&[u8]) -> R,
    {
        let r = f(self.packet.as_bytes());
        self.pool.put(self.packet);
        r
    }
}

pub(crate) struct PacketTxToken<'a> {
    queue: &'a mut VecDeque<Packet>,
    pool: &'a PacketPool,
}

impl phy::TxToken for PacketTxToken<'_> {
    fn consume<R, F>(self, len: usize, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let mut packet = self.pool.get();
        packet.resize(len);
        let r = f(packet.as_bytes_mut());
        self.queue.push_back(packet);
        r
    }
}

impl phy::Device for QueueDevice {
    type RxToken<'a> = PacketRxToken<'a> where Self: 'a;
    type TxToken<'a> = PacketTxToken<'a> where Self: 'a;

    fn receive(&mut self, _timestamp: Instant) -> Option<(Self::RxToken<'_>, Self::TxToken<'_>)> {
        let Self { rx, tx, pool, .. } = self;
        let pool: &PacketPool = pool;
        let packet = rx.pop_front()?;
        Some((
            PacketRxToken { packet, pool },
            PacketTxToken { queue: tx, pool },
        ))
    }

    fn transmit(&mut self, _timestamp: Instant) -> Option<Self::TxToken<'_>> {
        Some(PacketTxToken {
            queue: &mut self.tx,
            pool: &self.pool,
        })
    }

    fn capabilities(&self) -> DeviceCapabilities {
        let mut caps = DeviceCapabilities::default();
        caps.medium = Medium::Ip;
        caps.max_transmission_unit = self.mtu;
        caps
    }
}

//! Raw IP packet buffers and their pool.
//!
//! Every [`Packet`] reserves [`IP_PACKET_OFFSET`] bytes of headroom ahead of
//! the IP packet so that a transport (e.g. a tunnel framing layer) can
//! prepend its own header without copying.

use crate::error::{CoreError, CoreResult};
use parking_lot::Mutex;

/// Headroom reserved in front of every pooled IP packet.
pub const IP_PACKET_OFFSET: usize = 16;

/// Default interface MTU.
pub const DEFAULT_MTU: usize = 1428;

/// Largest IP payload used when a pool is created with an MTU of zero.
const MAX_PACKET: usize = (2 << 15) - 8 - 40 - IP_PACKET_OFFSET;

/// Idle packets kept per pool; extras are dropped on release.
const MAX_IDLE: usize = 1024;

/// An IP packet with reserved headroom.
#[derive(Debug, Clone)]
pub struct Packet {
    buf: Vec<u8>,
    offset: usize,
}

impl Packet {
    /// Allocate an empty packet with `offset` bytes of headroom and room for
    /// `capacity` bytes in total.
    ///
    /// # Panics
    ///
    /// Panics if `offset` exceeds `capacity`.
    pub fn new(offset: usize, capacity: usize) -> Self {
        assert!(offset <= capacity, "short packet cap");
        let mut buf = Vec::with_capacity(capacity);
        buf.resize(offset, 0);
        Self { buf, offset }
    }

    /// The IP packet, without headroom.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[self.offset..]
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.buf[self.offset..]
    }

    /// IP version from the first nibble, or 0 for an empty packet.
    pub fn version(&self) -> u8 {
        self.as_bytes().first().map_or(0, |b| b >> 4)
    }

    /// The packet including headroom starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ShortPacketOffset`] if `offset` lies inside the
    /// IP packet rather than the headroom.
    pub fn bytes(&self, offset: usize) -> CoreResult<&[u8]> {
        if offset > self.offset {
            return Err(CoreError::ShortPacketOffset);
        }
        Ok(&self.buf[offset..])
    }

    /// Append to the IP packet.
    pub fn write(&mut self, b: &[u8]) {
        self.buf.extend_from_slice(b);
    }

    /// Set the IP packet length to `len`, zero-filling any new bytes.
    pub fn resize(&mut self, len: usize) {
        self.buf.resize(self.offset + len, 0);
    }

    /// Copy `header` into the start of the headroom.
    pub fn set_header(&mut self, header: &[u8]) -> CoreResult<()> {
        if header.len() > self.offset {
            return Err(CoreError::ShortPacketOffset);
        }
        self.buf[..header.len()].copy_from_slice(header);
        Ok(())
    }

    /// Drop the IP packet, keeping the headroom.
    pub fn reset(&mut self) {
        self.buf.truncate(self.offset);
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn len(&self) -> usize {
        self.buf.len() - self.offset
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Free list of MTU-sized packets.
///
/// `get` never blocks: it reuses an idle packet or allocates a new one.
/// Packets are reset when they are released, not when they are handed out.
#[derive(Debug)]
pub struct PacketPool {
    mtu: usize,
    free: Mutex<Vec<Packet>>,
}

impl PacketPool {
    pub fn new(mtu: usize) -> Self {
        Self {
            mtu: if mtu == 0 { MAX_PACKET } else { mtu },
            free: Mutex::new(Vec::new()),
        }
    }

    pub fn mtu(&self) -> usize {
        self.mtu
    }

    pub fn get(&self) -> Packet {
        self.free
            .lock()
            .pop()
            .unwrap_or_else(|| Packet::new(IP_PACKET_OFFSET, IP_PACKET_OFFSET + self.mtu))
    }

    pub fn put(&self, mut packet: Packet) {
        packet.reset();
        let mut free = self.free.lock();
        if free.len() < MAX_IDLE {
            free.push(packet);
        }
    }

    /// Number of idle packets.
    pub fn idle(&self) -> usize {
        self.free.lock().len()
    }
}

impl Default for PacketPool {
    fn default() -> Self {
        Self::new(DEFAULT_MTU)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_headroom() {
        let mut p = Packet::new(4, 64);
        assert!(p.is_empty());
        assert_eq!(p.version(), 0);

        p.write(&[0x45, 0x00, 0x00, 0x14]);
        assert_eq!(p.version(), 4);
        assert_eq!(p.as_bytes(), &[0x45, 0x00, 0x00, 0x14]);

        p.set_header(&[1, 2]).unwrap();
        assert_eq!(p.bytes(0).unwrap(), &[1, 2, 0, 0, 0x45, 0x00, 0x00, 0x14]);
        assert_eq!(p.bytes(4).unwrap(), p.as_bytes());
        assert!(p.bytes(5).is_err());
        assert!(p.set_header(&[0; 5]).is_err());
    }

    #[test]
    #[should_panic(expected = "short packet cap")]
    fn offset_beyond_capacity_panics() {
        let _ = Packet::new(8, 4);
    }

    #[test]
    fn pool_resets_on_put() {
        let pool = PacketPool::new(1400);
        let mut p = pool.get();
        assert_eq!(p.offset(), IP_PACKET_OFFSET);
        p.write(&[0x60; 40]);
        pool.put(p);
        assert_eq!(pool.idle(), 1);

        let p = pool.get();
        assert!(p.is_empty());
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn zero_mtu_uses_maximum() {
        assert_eq!(PacketPool::new(0).mtu(), MAX_PACKET);
        assert_eq!(PacketPool::default().mtu(), DEFAULT_MTU);
    }
}

//! Wire format and the buffer pool backing it.

use std::sync::Mutex;

/// The one-byte discriminator at the start of every datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketProperty {
    Unreliable = 0,
    ReliableUnordered = 1,
    ReliableOrdered = 2,
    Sequenced = 3,
    ReliableSequenced = 4,
    AckReliable = 5,
    Ping = 6,
    Pong = 7,
    ConnectRequest = 8,
    ConnectAccept = 9,
    Disconnect = 10,
    ShutdownOk = 11,
    UnconnectedMessage = 12,
    DiscoveryRequest = 13,
    DiscoveryResponse = 14,
    NatIntroductionRequest = 15,
    NatIntroduction = 16,
    NatPunchMessage = 17,
    MtuCheck = 18,
    MtuOk = 19,
    Merged = 20,
}

impl PacketProperty {
    /// Parse the leading byte of a datagram. Returns `None` for unrecognized codes, which the
    /// demultiplexer silently drops.
    pub fn from_byte(byte: u8) -> Option<Self> {
        use PacketProperty::*;
        Some(match byte {
            0 => Unreliable,
            1 => ReliableUnordered,
            2 => ReliableOrdered,
            3 => Sequenced,
            4 => ReliableSequenced,
            5 => AckReliable,
            6 => Ping,
            7 => Pong,
            8 => ConnectRequest,
            9 => ConnectAccept,
            10 => Disconnect,
            11 => ShutdownOk,
            12 => UnconnectedMessage,
            13 => DiscoveryRequest,
            14 => DiscoveryResponse,
            15 => NatIntroductionRequest,
            16 => NatIntroduction,
            17 => NatPunchMessage,
            18 => MtuCheck,
            19 => MtuOk,
            20 => Merged,
            _ => return None,
        })
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

/// How outbound user data should be delivered by the peer's reliability layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliveryMethod {
    Unreliable,
    ReliableUnordered,
    ReliableOrdered,
    Sequenced,
    ReliableSequenced,
}

impl DeliveryMethod {
    pub fn to_property(self) -> PacketProperty {
        match self {
            DeliveryMethod::Unreliable => PacketProperty::Unreliable,
            DeliveryMethod::ReliableUnordered => PacketProperty::ReliableUnordered,
            DeliveryMethod::ReliableOrdered => PacketProperty::ReliableOrdered,
            DeliveryMethod::Sequenced => PacketProperty::Sequenced,
            DeliveryMethod::ReliableSequenced => PacketProperty::ReliableSequenced,
        }
    }
}

/// The header size reserved at the front of every raw packet buffer for the property byte.
pub const HEADER_SIZE: usize = 1;

/// An owned datagram buffer.
///
/// Obtained from [`PacketPool`], populated, then handed off to an event or recycled. A packet
/// must be recycled exactly once along any control path.
#[derive(Debug)]
pub struct Packet {
    raw_data: Vec<u8>,
    size: usize,
    property: Option<PacketProperty>,
}

impl Packet {
    fn new(capacity: usize) -> Self {
        Self {
            raw_data: vec![0u8; capacity.max(HEADER_SIZE)],
            size: 0,
            property: None,
        }
    }

    /// The parsed property byte, if the buffer's first byte was recognized.
    pub fn property(&self) -> Option<PacketProperty> {
        self.property
    }

    /// Total valid length of the buffer, header included.
    pub fn size(&self) -> usize {
        self.size
    }

    /// The full raw buffer, including the header byte, truncated to `size`.
    pub fn raw(&self) -> &[u8] {
        &self.raw_data[..self.size]
    }

    /// The payload, with the header byte stripped.
    pub fn payload(&self) -> &[u8] {
        if self.size <= HEADER_SIZE {
            &[]
        } else {
            &self.raw_data[HEADER_SIZE..self.size]
        }
    }

    /// Overwrite this packet's contents from wire bytes and reparse the property.
    pub fn fill_from(&mut self, bytes: &[u8]) {
        if self.raw_data.len() < bytes.len() {
            self.raw_data.resize(bytes.len(), 0);
        }
        self.raw_data[..bytes.len()].copy_from_slice(bytes);
        self.size = bytes.len();
        self.property = bytes.first().copied().and_then(PacketProperty::from_byte);
    }

    /// Construct a send-ready packet with the property byte already written.
    fn fill_with_data(&mut self, property: PacketProperty, payload: &[u8]) {
        let total = HEADER_SIZE + payload.len();
        if self.raw_data.len() < total {
            self.raw_data.resize(total, 0);
        }
        self.raw_data[0] = property.as_byte();
        self.raw_data[HEADER_SIZE..total].copy_from_slice(payload);
        self.size = total;
        self.property = Some(property);
    }

    fn reset(&mut self, clear: bool) {
        self.size = 0;
        self.property = None;
        if clear {
            for b in self.raw_data.iter_mut() {
                *b = 0;
            }
        }
    }
}

/// A size-classed free-list of [`Packet`] buffers.
///
/// Buffers are recycled without zero-fill unless the caller asks for a cleared buffer; this keeps
/// the hot receive path allocation-free.
pub struct PacketPool {
    free: Mutex<Vec<Packet>>,
    default_capacity: usize,
}

impl PacketPool {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            default_capacity,
        }
    }

    /// Obtain a packet with at least `size` bytes of capacity.
    pub fn get_packet(&self, size: usize, clear: bool) -> Packet {
        let mut free = self.free.lock().expect("packet pool poisoned");
        let mut packet = free.pop().unwrap_or_else(|| Packet::new(size.max(self.default_capacity)));
        if packet.raw_data.len() < size {
            packet.raw_data.resize(size, 0);
        }
        packet.reset(clear);
        packet
    }

    /// Obtain a send-ready packet for `payload`, tagged with `property`.
    pub fn get_with_data(&self, property: PacketProperty, payload: &[u8]) -> Packet {
        let mut packet = self.get_packet(HEADER_SIZE + payload.len(), false);
        packet.fill_with_data(property, payload);
        packet
    }

    /// Return a packet to the pool. Must be called exactly once per packet obtained.
    pub fn recycle(&self, packet: Packet) {
        let mut free = self.free.lock().expect("packet pool poisoned");
        free.push(packet);
    }

    /// Number of buffers currently idle in the pool. Exposed for tests.
    pub fn idle_count(&self) -> usize {
        self.free.lock().expect("packet pool poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_payload() {
        let pool = PacketPool::new(64);
        let packet = pool.get_with_data(PacketProperty::Unreliable, &[1, 2, 3]);
        assert_eq!(packet.payload(), &[1, 2, 3]);
        assert_eq!(packet.property(), Some(PacketProperty::Unreliable));
    }

    #[test]
    fn recycled_packet_is_reused() {
        let pool = PacketPool::new(64);
        let packet = pool.get_packet(32, false);
        pool.recycle(packet);
        assert_eq!(pool.idle_count(), 1);

        let reused = pool.get_packet(16, false);
        assert_eq!(pool.idle_count(), 0);
        pool.recycle(reused);
    }

    #[test]
    fn unknown_property_byte_is_none() {
        let pool = PacketPool::new(64);
        let mut packet = pool.get_packet(4, true);
        packet.fill_from(&[0xFE, 1, 2]);
        assert_eq!(packet.property(), None);
    }
}

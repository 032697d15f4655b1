use bitflags::bitflags;
use bytes::{Buf, BufMut};
use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::time::Instant;
use anyhow::bail;

pub type PacketId = u16;
pub type ChannelId = u8;

/// Total size of a datagram on the wire, header included
pub const PACKET_SIZE: usize = 1400;
pub const HEADER_LEN: usize = PacketHeader::SERIALIZED_LEN;
pub const MAX_PAYLOAD: usize = PACKET_SIZE - HEADER_LEN;

/// Valid channel ids are `0..MAX_CHANNELS`
pub const MAX_CHANNELS: usize = 255;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct PacketFlags: u8 {
        const CONFIRM_DELIVERY = 1;
        const IS_ACK = 4;
        const IN_ORDER = 8;
        const END_OF_MESSAGE = 16;
        const START_OF_MESSAGE = 32;
    }
}

/// Packet header, all numbers in network byte order (BE):
/// ```ascii
/// 0: packet id (u16) - sequence number, scoped to (peer, channel)
/// 2: channel id (u8)
/// 3: flags (u8)
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub struct PacketHeader {
    pub packet_id: PacketId,
    pub channel_id: ChannelId,
    pub flags: PacketFlags,
}

impl PacketHeader {
    pub const SERIALIZED_LEN: usize = size_of::<u16>() + size_of::<u8>() + size_of::<u8>();

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u16(self.packet_id);
        buf.put_u8(self.channel_id);
        buf.put_u8(self.flags.bits());
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<PacketHeader> {
        if buf.remaining() < Self::SERIALIZED_LEN {
            bail!("packet header requires {} bytes, got {}", Self::SERIALIZED_LEN, buf.remaining());
        }

        Ok(PacketHeader {
            packet_id: buf.get_u16(),
            channel_id: buf.get_u8(),
            // unknown bits are retained so that an ack echoes the header exactly
            flags: PacketFlags::from_bits_retain(buf.get_u8()),
        })
    }

    pub fn is_ack(&self) -> bool {
        self.flags.contains(PacketFlags::IS_ACK)
    }

    /// the header of the acknowledgement for a packet with this header
    pub fn to_ack(&self) -> PacketHeader {
        PacketHeader {
            flags: self.flags | PacketFlags::IS_ACK,
            ..*self
        }
    }

    /// exact header equality with the IS_ACK bit ignored
    pub fn is_acked_by(&self, ack: &PacketHeader) -> bool {
        self.packet_id == ack.packet_id
            && self.channel_id == ack.channel_id
            && self.flags.difference(PacketFlags::IS_ACK) == ack.flags.difference(PacketFlags::IS_ACK)
    }
}

/// A fixed-size datagram buffer: header at the start, followed by a payload region that is
///  addressed by independent read and write cursors. Reads and writes past the end of the buffer
///  are truncated silently, reporting the number of bytes actually transferred.
///
/// `timestamp`, `target_addr` and `resend_count` are bookkeeping that never goes on the wire.
pub struct Packet {
    buf: [u8; PACKET_SIZE],
    read_pos: usize,
    write_pos: usize,
    /// time of the most recent send, for ack timeouts
    pub timestamp: Option<Instant>,
    /// destination for outbound packets, source for inbound packets
    pub target_addr: Option<SocketAddr>,
    pub resend_count: u32,
}

impl Default for Packet {
    fn default() -> Self {
        Packet {
            buf: [0; PACKET_SIZE],
            read_pos: 0,
            write_pos: 0,
            timestamp: None,
            target_addr: None,
            resend_count: 0,
        }
    }
}

impl Debug for Packet {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Packet")
            .field("header", &self.header())
            .field("payload_len", &self.write_pos)
            .field("target_addr", &self.target_addr)
            .finish()
    }
}

impl Packet {
    pub fn header(&self) -> PacketHeader {
        let mut buf: &[u8] = &self.buf[..HEADER_LEN];
        PacketHeader {
            packet_id: buf.get_u16(),
            channel_id: buf.get_u8(),
            flags: PacketFlags::from_bits_retain(buf.get_u8()),
        }
    }

    pub fn set_header(&mut self, header: &PacketHeader) {
        let mut buf: &mut [u8] = &mut self.buf[..HEADER_LEN];
        header.ser(&mut buf);
    }

    /// Append to the payload. Returns the number of bytes written, which is less than
    ///  `data.len()` if the packet is full.
    pub fn write(&mut self, data: &[u8]) -> usize {
        let len = data.len().min(MAX_PAYLOAD - self.write_pos);
        let offs = HEADER_LEN + self.write_pos;
        self.buf[offs..offs + len].copy_from_slice(&data[..len]);
        self.write_pos += len;
        len
    }

    /// Read from the payload at the read cursor, up to the end of the written payload
    pub fn read(&mut self, out: &mut [u8]) -> usize {
        let len = out.len().min(self.write_pos - self.read_pos);
        let offs = HEADER_LEN + self.read_pos;
        out[..len].copy_from_slice(&self.buf[offs..offs + len]);
        self.read_pos += len;
        len
    }

    pub fn payload(&self) -> &[u8] {
        &self.buf[HEADER_LEN..HEADER_LEN + self.write_pos]
    }

    pub fn payload_len(&self) -> usize {
        self.write_pos
    }

    pub fn remaining_capacity(&self) -> usize {
        MAX_PAYLOAD - self.write_pos
    }

    /// header size plus payload written so far - the number of bytes that go on the wire
    pub fn total_size(&self) -> usize {
        HEADER_LEN + self.write_pos
    }

    pub fn as_wire_bytes(&self) -> &[u8] {
        &self.buf[..self.total_size()]
    }

    /// The full buffer for receiving a datagram into. Must be followed by
    ///  [`Packet::set_received_len`].
    pub fn receive_buffer(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    /// Adjust cursors after a datagram of `len` bytes was received into the buffer. Returns
    ///  `false` if the datagram is too short to contain a header.
    pub fn set_received_len(&mut self, len: usize) -> bool {
        if len < HEADER_LEN || len > PACKET_SIZE {
            return false;
        }
        self.read_pos = 0;
        self.write_pos = len - HEADER_LEN;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::zero(PacketHeader { packet_id: 0, channel_id: 0, flags: PacketFlags::empty() }, vec![0, 0, 0, 0])]
    #[case::big_endian(PacketHeader { packet_id: 0x1234, channel_id: 7, flags: PacketFlags::CONFIRM_DELIVERY }, vec![0x12, 0x34, 7, 1])]
    #[case::all_flags(PacketHeader { packet_id: u16::MAX, channel_id: 254, flags: PacketFlags::all() }, vec![0xff, 0xff, 254, 61])]
    #[case::start_end(PacketHeader { packet_id: 3, channel_id: 1, flags: PacketFlags::START_OF_MESSAGE | PacketFlags::END_OF_MESSAGE }, vec![0, 3, 1, 48])]
    fn test_header_ser(#[case] header: PacketHeader, #[case] expected: Vec<u8>) {
        let mut buf = Vec::new();
        header.ser(&mut buf);
        assert_eq!(buf, expected);

        let mut b: &[u8] = &buf;
        assert_eq!(PacketHeader::deser(&mut b).unwrap(), header);
        assert!(b.is_empty());
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::three_bytes(vec![1, 2, 3])]
    fn test_header_deser_too_short(#[case] buf: Vec<u8>) {
        let mut b: &[u8] = &buf;
        assert!(PacketHeader::deser(&mut b).is_err());
    }

    #[test]
    fn test_header_unknown_flags_retained() {
        let mut b: &[u8] = &[0, 1, 2, 0x82];
        let header = PacketHeader::deser(&mut b).unwrap();
        assert_eq!(header.flags.bits(), 0x82);
    }

    #[rstest]
    #[case::identical(PacketFlags::CONFIRM_DELIVERY, PacketFlags::CONFIRM_DELIVERY | PacketFlags::IS_ACK, true)]
    #[case::without_ack_bit(PacketFlags::CONFIRM_DELIVERY, PacketFlags::CONFIRM_DELIVERY, true)]
    #[case::other_flags(PacketFlags::CONFIRM_DELIVERY, PacketFlags::CONFIRM_DELIVERY | PacketFlags::IN_ORDER | PacketFlags::IS_ACK, false)]
    fn test_is_acked_by(#[case] sent: PacketFlags, #[case] ack: PacketFlags, #[case] expected: bool) {
        let sent = PacketHeader { packet_id: 5, channel_id: 2, flags: sent };
        let ack = PacketHeader { packet_id: 5, channel_id: 2, flags: ack };
        assert_eq!(sent.is_acked_by(&ack), expected);

        assert!(!sent.is_acked_by(&PacketHeader { packet_id: 6, ..ack }));
        assert!(!sent.is_acked_by(&PacketHeader { channel_id: 3, ..ack }));
    }

    #[test]
    fn test_to_ack() {
        let header = PacketHeader { packet_id: 9, channel_id: 1, flags: PacketFlags::CONFIRM_DELIVERY | PacketFlags::START_OF_MESSAGE };
        let ack = header.to_ack();
        assert!(ack.is_ack());
        assert!(header.is_acked_by(&ack));
        assert!(!header.is_ack());
    }

    #[test]
    fn test_set_header() {
        let mut packet = Packet::default();
        let header = PacketHeader { packet_id: 300, channel_id: 4, flags: PacketFlags::IN_ORDER };
        packet.set_header(&header);
        assert_eq!(packet.header(), header);
        assert_eq!(packet.as_wire_bytes(), &[1, 44, 4, 8]);
    }

    #[rstest]
    #[case::empty(0, 0)]
    #[case::small(13, 13)]
    #[case::exact(MAX_PAYLOAD, MAX_PAYLOAD)]
    #[case::overflow(MAX_PAYLOAD + 1, MAX_PAYLOAD)]
    #[case::way_too_big(3 * PACKET_SIZE, MAX_PAYLOAD)]
    fn test_write_is_clipped(#[case] len: usize, #[case] expected: usize) {
        let data = (0..len).map(|i| i as u8).collect::<Vec<_>>();
        let mut packet = Packet::default();

        assert_eq!(packet.write(&data), expected);
        assert_eq!(packet.payload(), &data[..expected]);
        assert_eq!(packet.total_size(), HEADER_LEN + expected);
        assert_eq!(packet.remaining_capacity(), MAX_PAYLOAD - expected);
        assert_eq!(packet.write(&[1]), if expected == MAX_PAYLOAD { 0 } else { 1 });
    }

    #[test]
    fn test_read_cursor() {
        let mut packet = Packet::default();
        packet.write(b"hello");
        packet.write(b" world");

        let mut out = [0u8; 4];
        assert_eq!(packet.read(&mut out), 4);
        assert_eq!(&out, b"hell");

        let mut out = [0u8; 100];
        assert_eq!(packet.read(&mut out), 7);
        assert_eq!(&out[..7], b"o world");
        assert_eq!(packet.read(&mut out), 0);
    }

    #[rstest]
    #[case::empty(0, false)]
    #[case::short(HEADER_LEN - 1, false)]
    #[case::header_only(HEADER_LEN, true)]
    #[case::full(PACKET_SIZE, true)]
    #[case::oversized(PACKET_SIZE + 1, false)]
    fn test_set_received_len(#[case] len: usize, #[case] expected: bool) {
        let mut packet = Packet::default();
        packet.receive_buffer()[..HEADER_LEN].copy_from_slice(&[0, 1, 2, 3]);
        assert_eq!(packet.set_received_len(len), expected);
        if expected {
            assert_eq!(packet.total_size(), len);
            assert_eq!(packet.header().packet_id, 1);
        }
    }
}

use std::net::Ipv4Addr;

use crate::buffer::PacketBuffer;
use crate::forward::Disposition;
use crate::ip::{IpError, Ipv4Header, ProtocolType, IPV4_HEADER_LENGTH, MAX_TOTAL_LENGTH};

const IPV4_VERSION: u8 = 4;

/// Wraps the packet into an outer IPv4 header addressed to `gateway`.
///
/// The outer header copies TOS, identification, fragmentation and TTL from the original
/// header, and uses the ASN-FWD protocol number to mark the payload. The buffer is left
/// untouched if there is no room for the outer header.
pub fn encode(packet: &mut PacketBuffer, gateway: Ipv4Addr) -> Result<Disposition, IpError> {
    let inner = packet.header()?;
    let tos = inner.tos();
    let identification = inner.identification();
    let fragment = inner.fragment();
    let ttl = inner.ttl();
    let src_addr = inner.src_addr();
    let total_length = inner.total_length() as usize + IPV4_HEADER_LENGTH;

    if packet.headroom() < IPV4_HEADER_LENGTH {
        return Err(IpError::InsufficientSpace(
            "No headroom to add outer IPv4 header",
        ));
    }
    if total_length > MAX_TOTAL_LENGTH {
        return Err(IpError::InsufficientSpace(
            "Encapsulated packet exceeds maximum IPv4 length",
        ));
    }

    let mut outer = packet.grow_header(IPV4_HEADER_LENGTH)?;
    outer.set_version(IPV4_VERSION);
    outer.set_ihl((IPV4_HEADER_LENGTH / 4) as u8);
    outer.set_tos(tos);
    outer.set_total_length(total_length as u16);
    outer.set_identification(identification);
    outer.set_fragment(fragment);
    outer.set_ttl(ttl);
    outer.set_protocol(ProtocolType::ASNFWD);
    outer.set_src_addr(src_addr);
    outer.set_dst_addr(gateway);
    // Checksum is filled in by the dispatcher.
    Ok(Disposition::Modified)
}

/// Strips the outer ASN-FWD header, if there is one.
///
/// The TTL of the outer header replaces the TTL of the inner header.
pub fn decode(packet: &mut PacketBuffer) -> Result<Disposition, IpError> {
    let outer = packet.header()?;
    if outer.protocol() != ProtocolType::ASNFWD {
        return Ok(Disposition::Unchanged);
    }
    let ttl = outer.ttl();
    let outer_length = outer.header_length();

    if Ipv4Header::new_checked(&packet.data()[outer_length..]).is_err() {
        return Err(IpError::MalformedInstruction(
            "ASN-FWD packet doesn't contain a valid IPv4 packet",
        ));
    }

    let mut inner = packet.pull_front(outer_length)?;
    inner.set_ttl(ttl);
    Ok(Disposition::Modified)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ip::test::build_packet;

    const SRC: Ipv4Addr = Ipv4Addr::new(192, 0, 2, 1);
    const DST: Ipv4Addr = Ipv4Addr::new(203, 0, 113, 9);
    const GATEWAY: Ipv4Addr = Ipv4Addr::new(198, 51, 100, 1);

    #[test]
    fn encode_adds_outer_header() {
        let original = build_packet(SRC, DST, &[], b"some payload");
        let mut packet = PacketBuffer::new(&original, 64);
        assert_eq!(encode(&mut packet, GATEWAY).unwrap(), Disposition::Modified);

        assert_eq!(packet.len(), original.len() + 20);
        assert_eq!(&packet.data()[20..], &original[..]);
        let outer = packet.header().unwrap();
        assert_eq!(outer.version(), 4);
        assert_eq!(outer.ihl(), 5);
        assert_eq!(outer.tos(), 0x10);
        assert_eq!(outer.total_length() as usize, original.len() + 20);
        assert_eq!(outer.identification(), 0x1234);
        assert_eq!(outer.fragment(), 0x4000);
        assert_eq!(outer.ttl(), 64);
        assert_eq!(outer.protocol(), ProtocolType::ASNFWD);
        assert_eq!(outer.src_addr(), SRC);
        assert_eq!(outer.dst_addr(), GATEWAY);
    }

    #[test]
    fn encode_without_headroom() {
        let original = build_packet(SRC, DST, &[], b"some payload");
        let mut packet = PacketBuffer::new(&original, 19);
        assert!(matches!(
            encode(&mut packet, GATEWAY),
            Err(IpError::InsufficientSpace(_))
        ));
        assert_eq!(packet.headroom(), 19);
        assert_eq!(packet.data(), &original[..]);
    }

    #[test]
    fn encode_oversized_packet() {
        let original = build_packet(SRC, DST, &[], &vec![0u8; MAX_TOTAL_LENGTH - 20]);
        let mut packet = PacketBuffer::new(&original, 64);
        assert!(matches!(
            encode(&mut packet, GATEWAY),
            Err(IpError::InsufficientSpace(_))
        ));
        assert_eq!(packet.data(), &original[..]);
    }

    #[test]
    fn decode_restores_packet() {
        let original = build_packet(SRC, DST, &[1, 1, 1, 0], b"data");
        let mut packet = PacketBuffer::new(&original, 20);
        encode(&mut packet, GATEWAY).unwrap();
        assert_eq!(decode(&mut packet).unwrap(), Disposition::Modified);
        assert_eq!(packet.headroom(), 20);
        assert_eq!(packet.data(), &original[..]);
    }

    #[test]
    fn decode_copies_outer_ttl() {
        let original = build_packet(SRC, DST, &[], b"data");
        let mut packet = PacketBuffer::new(&original, 20);
        encode(&mut packet, GATEWAY).unwrap();
        // Three hops between encapsulation and decapsulation.
        packet.header_mut().unwrap().set_ttl(61);
        decode(&mut packet).unwrap();
        assert_eq!(packet.header().unwrap().ttl(), 61);
        assert_eq!(&packet.data()[9..], &original[9..]);
    }

    #[test]
    fn decode_plain_packet() {
        let original = build_packet(SRC, DST, &[], b"data");
        let mut packet = PacketBuffer::new(&original, 20);
        assert_eq!(decode(&mut packet).unwrap(), Disposition::Unchanged);
        assert_eq!(packet.data(), &original[..]);
    }

    #[test]
    fn decode_truncated_inner_packet() {
        let mut original = build_packet(SRC, GATEWAY, &[], &[0x45, 0, 0, 4]);
        original[9] = ProtocolType::ASNFWD.to_u8();
        let mut packet = PacketBuffer::new(&original, 0);
        assert!(matches!(
            decode(&mut packet),
            Err(IpError::MalformedInstruction(_))
        ));
        assert_eq!(packet.data(), &original[..]);
    }
}

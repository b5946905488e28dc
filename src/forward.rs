use std::{fmt, str::FromStr};

use log::{debug, info, trace, warn};

use crate::buffer::{ChecksumStatus, PacketBuffer};
use crate::ip::{IpError, ProtocolType};
use crate::route::{Interfaces, Resolver, RouteTable};
use crate::{ipip, options};

pub const DEFAULT_TABLE: u32 = 100;

/// How the ASN gateway is carried in the packet.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum Format {
    /// An outer IPv4 header addressed to the gateway.
    #[default]
    Ipip,
    /// An IP option saving the original destination, which is replaced by the gateway.
    Options,
}

impl Format {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ipip => "IPIP",
            Self::Options => "OPTIONS",
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Format {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Format, Self::Err> {
        match s.to_lowercase().as_str() {
            "ipip" | "0" => Ok(Format::Ipip),
            "options" | "1" => Ok(Format::Options),
            _ => Err("Valid formats are 0 (IPIP) and 1 (OPTIONS)"),
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct Config {
    pub table: u32,
    pub format: Format,
    pub debug: bool,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            table: DEFAULT_TABLE,
            format: Format::default(),
            debug: false,
        }
    }
}

/// What the interception framework should do with a processed packet.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Disposition {
    Unchanged,
    Modified,
    Reject,
}

/// Applies ASN-FWD routing to packets.
///
/// Holds only immutable state, so a single instance can process packets from multiple
/// threads at once as long as the route table allows it.
pub struct Forwarder<R> {
    format: Format,
    debug: bool,
    resolver: Resolver<R>,
}

impl<R: RouteTable> Forwarder<R> {
    pub fn new(config: Config, table: R) -> Forwarder<R> {
        info!(
            "ASN-FWD ready: table = {}, format = {}, debug is {}",
            config.table,
            config.format,
            if config.debug { "on" } else { "off" }
        );
        Forwarder {
            format: config.format,
            debug: config.debug,
            resolver: Resolver::new(table, config.table, config.debug),
        }
    }

    pub fn process(&self, packet: &mut PacketBuffer, interfaces: &Interfaces) -> Disposition {
        let (src_addr, dst_addr) = match packet.header() {
            Ok(header) => (header.src_addr(), header.dst_addr()),
            Err(err) => {
                if self.debug {
                    debug!("Dropping packet at {}: {err}", interfaces.hook());
                }
                return Disposition::Reject;
            }
        };
        if self.debug {
            debug!("Hook is {}", interfaces.hook());
            debug!("(Original) From {src_addr} to {dst_addr}");
        }

        let result = match self.format {
            Format::Ipip => self.process_ipip(packet, interfaces),
            Format::Options => self.process_options(packet, interfaces),
        };
        match result {
            Ok(Disposition::Modified) => self.finish_modified(packet),
            Ok(disposition) => disposition,
            Err(err) => {
                if self.debug {
                    debug!(
                        "Dropping packet from {src_addr} to {dst_addr}: {err}, headroom = {}",
                        packet.headroom()
                    );
                }
                Disposition::Reject
            }
        }
    }

    fn process_ipip(
        &self,
        packet: &mut PacketBuffer,
        interfaces: &Interfaces,
    ) -> Result<Disposition, IpError> {
        let header = packet.header()?;
        if header.protocol() == ProtocolType::ASNFWD {
            if self.debug {
                debug!("Is ASN-FWD protocol");
            }
            return ipip::decode(packet);
        }
        match self.resolver.resolve(header.dst_addr(), interfaces) {
            Some(gateway) => ipip::encode(packet, gateway),
            None => Ok(Disposition::Unchanged),
        }
    }

    fn process_options(
        &self,
        packet: &mut PacketBuffer,
        interfaces: &Interfaces,
    ) -> Result<Disposition, IpError> {
        let header = packet.header()?;
        if let Some(instruction) = options::find_instruction(&header)? {
            if self.debug {
                debug!(
                    "Option found at offset {}, original destination {}",
                    instruction.offset(),
                    instruction.original_dst()
                );
            }
            return options::decode(packet, instruction);
        }
        match self.resolver.resolve(header.dst_addr(), interfaces) {
            Some(gateway) => options::encode(packet, gateway),
            None => Ok(Disposition::Unchanged),
        }
    }

    fn finish_modified(&self, packet: &mut PacketBuffer) -> Disposition {
        // Transport checksums are unaffected, but a previously verified IP checksum is stale.
        if packet.checksum_status() != ChecksumStatus::None {
            trace!("Clearing checksum status {:?}", packet.checksum_status());
            packet.set_checksum_status(ChecksumStatus::None);
        }
        let mut header = match packet.header_mut() {
            Ok(header) => header,
            Err(err) => {
                warn!("Rewritten packet has an invalid IPv4 header: {err}");
                return Disposition::Reject;
            }
        };
        header.fill_checksum();
        trace!("Rewritten header: {header}");
        if self.debug {
            debug!(
                "(Modified using {}) From {} to {}.",
                self.format,
                header.src_addr(),
                header.dst_addr()
            );
        }
        Disposition::Modified
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ip::{test::build_packet, Ipv4Header};
    use crate::route::StaticRouteTable;
    use rand::{rngs::StdRng, Rng, SeedableRng};
    use std::net::Ipv4Addr;

    const SRC: Ipv4Addr = Ipv4Addr::new(192, 0, 2, 1);
    const DST: Ipv4Addr = Ipv4Addr::new(203, 0, 113, 9);
    const GATEWAY: Ipv4Addr = Ipv4Addr::new(198, 51, 100, 1);

    fn forwarder(format: Format) -> Forwarder<StaticRouteTable> {
        let table = StaticRouteTable::parse(
            "203.0.113.0/24 via 198.51.100.1 table 100\n\
             192.0.2.0/24 dev eth0 table 100\n\
             203.0.113.0/24 via 198.51.100.99 table 200",
        )
        .unwrap();
        let config = Config {
            format,
            debug: true,
            ..Default::default()
        };
        Forwarder::new(config, table)
    }

    fn random_packet(rng: &mut StdRng, dst: Ipv4Addr) -> Vec<u8> {
        let option_words = rng.gen_range(0..=8usize);
        let mut options = vec![1u8; option_words * 4];
        if option_words > 0 && rng.gen_bool(0.5) {
            // Record route option with a trailing end marker.
            let len = options.len();
            options[0] = 7;
            options[1] = (len - 1) as u8;
            options[2] = 4;
            options[len - 1] = 0;
        }
        let payload = (0..rng.gen_range(0..200usize))
            .map(|_| rng.gen())
            .collect::<Vec<u8>>();
        let mut packet = build_packet(Ipv4Addr::from(rng.gen::<u32>()), dst, &options, &payload);
        let mut header = Ipv4Header::new(&mut packet[..]).unwrap();
        header.set_tos(rng.gen());
        header.set_identification(rng.gen());
        header.set_fragment(rng.gen::<u16>() & 0x5fff);
        header.set_ttl(rng.gen_range(1..=255));
        header.set_protocol(ProtocolType::from_u8(rng.gen_range(1..=200)));
        header.fill_checksum();
        packet
    }

    #[test]
    fn ipip_scenario() {
        let forwarder = forwarder(Format::Ipip);
        let original = build_packet(SRC, DST, &[], b"hello");
        let mut packet = PacketBuffer::new(&original, 64);
        assert_eq!(
            forwarder.process(&mut packet, &Interfaces::incoming("eth0")),
            Disposition::Modified
        );
        let header = packet.header().unwrap();
        assert_eq!(header.ihl(), 5);
        assert_eq!(header.protocol(), ProtocolType::ASNFWD);
        assert_eq!(header.dst_addr(), GATEWAY);
        assert_eq!(header.total_length() as usize, original.len() + 20);
        assert!(header.verify_checksum());
        assert_eq!(&packet.data()[20..], &original[..]);
        assert_eq!(packet.checksum_status(), ChecksumStatus::None);
    }

    #[test]
    fn options_scenario() {
        let forwarder = forwarder(Format::Options);
        let original = build_packet(SRC, DST, &[], b"hello");
        let mut packet = PacketBuffer::new(&original, 64);
        assert_eq!(
            forwarder.process(&mut packet, &Interfaces::outgoing("eth0")),
            Disposition::Modified
        );
        let header = packet.header().unwrap();
        assert_eq!(header.ihl(), 7);
        assert_eq!(header.options(), &[222, 8, 203, 0, 113, 9, 1, 0]);
        assert_eq!(header.dst_addr(), GATEWAY);
        assert_eq!(header.total_length() as usize, original.len() + 8);
        assert!(header.verify_checksum());
    }

    #[test]
    fn options_malformed_scenario() {
        let forwarder = forwarder(Format::Options);
        let original = build_packet(SRC, DST, &[1, 1, 1, 1, 68, 15, 0, 0], b"hello");
        let mut packet = PacketBuffer::new(&original, 64);
        assert_eq!(
            forwarder.process(&mut packet, &Interfaces::incoming("eth0")),
            Disposition::Reject
        );
        assert_eq!(packet.data(), &original[..]);
    }

    #[test]
    fn no_route_is_unchanged() {
        for format in [Format::Ipip, Format::Options] {
            let forwarder = forwarder(format);
            for dst in [Ipv4Addr::new(198, 18, 0, 1), Ipv4Addr::new(192, 0, 2, 77)] {
                let original = build_packet(SRC, dst, &[], b"hello");
                let mut packet = PacketBuffer::new(&original, 64);
                packet.set_checksum_status(ChecksumStatus::Unnecessary);
                assert_eq!(
                    forwarder.process(&mut packet, &Interfaces::incoming("eth0")),
                    Disposition::Unchanged
                );
                assert_eq!(packet.data(), &original[..]);
                assert_eq!(packet.checksum_status(), ChecksumStatus::Unnecessary);
            }
        }
    }

    #[test]
    fn no_device_is_unchanged() {
        let forwarder = forwarder(Format::Ipip);
        let original = build_packet(SRC, DST, &[], b"hello");
        let mut packet = PacketBuffer::new(&original, 64);
        assert_eq!(
            forwarder.process(&mut packet, &Interfaces::default()),
            Disposition::Unchanged
        );
        assert_eq!(packet.data(), &original[..]);
    }

    #[test]
    fn other_table() {
        let table = StaticRouteTable::parse("203.0.113.0/24 via 198.51.100.99 table 200").unwrap();
        let config = Config {
            table: 200,
            ..Default::default()
        };
        let forwarder = Forwarder::new(config, &table);
        let original = build_packet(SRC, DST, &[], b"hello");
        let mut packet = PacketBuffer::new(&original, 64);
        assert_eq!(
            forwarder.process(&mut packet, &Interfaces::incoming("eth0")),
            Disposition::Modified
        );
        assert_eq!(
            packet.header().unwrap().dst_addr(),
            Ipv4Addr::new(198, 51, 100, 99)
        );
    }

    #[test]
    fn insufficient_headroom_rejects() {
        for (format, headroom) in [(Format::Ipip, 19), (Format::Options, 7)] {
            let forwarder = forwarder(format);
            let original = build_packet(SRC, DST, &[], b"hello");
            let mut packet = PacketBuffer::new(&original, headroom);
            assert_eq!(
                forwarder.process(&mut packet, &Interfaces::incoming("eth0")),
                Disposition::Reject
            );
            assert_eq!(packet.headroom(), headroom);
            assert_eq!(packet.data(), &original[..]);
        }
    }

    #[test]
    fn invalid_packet_rejects() {
        let forwarder = forwarder(Format::Ipip);
        let mut original = build_packet(SRC, DST, &[], b"hello");
        original[2] = 0xff;
        let mut packet = PacketBuffer::new(&original, 64);
        assert_eq!(
            forwarder.process(&mut packet, &Interfaces::incoming("eth0")),
            Disposition::Reject
        );
        let mut packet = PacketBuffer::new(&[0x45, 0x00], 64);
        assert_eq!(
            forwarder.process(&mut packet, &Interfaces::incoming("eth0")),
            Disposition::Reject
        );
    }

    #[test]
    fn round_trip() {
        let mut rng = StdRng::seed_from_u64(0xa5f);
        for format in [Format::Ipip, Format::Options] {
            let forwarder = forwarder(format);
            for _ in 0..200 {
                let dst = Ipv4Addr::new(203, 0, 113, rng.gen());
                let original = random_packet(&mut rng, dst);
                let mut packet = PacketBuffer::new(&original, 64);
                let interfaces = Interfaces::outgoing("eth0");
                assert_eq!(
                    forwarder.process(&mut packet, &interfaces),
                    Disposition::Modified
                );
                assert!(packet.header().unwrap().verify_checksum());
                assert_eq!(packet.header().unwrap().dst_addr(), GATEWAY);

                let interfaces = Interfaces::incoming("eth1");
                assert_eq!(
                    forwarder.process(&mut packet, &interfaces),
                    Disposition::Modified
                );
                let header = packet.header().unwrap();
                assert!(header.verify_checksum());
                assert_eq!(header.dst_addr(), dst);
                assert_eq!(header.ttl(), original[8]);
                assert_eq!(packet.headroom(), 64);
                // The end markers before the instruction are not restored.
                let header_length = header.header_length();
                assert_eq!(header_length, (original[0] & 0x0f) as usize * 4);
                assert_eq!(&packet.data()[..10], &original[..10]);
                assert_eq!(&packet.data()[12..20], &original[12..20]);
                assert_eq!(
                    &packet.data()[header_length..],
                    &original[header_length..]
                );
            }
        }
    }
}

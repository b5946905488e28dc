use std::{error, fmt, net::Ipv4Addr};

pub const IPV4_HEADER_LENGTH: usize = 20;
pub const MAX_IPV4_HEADER_LENGTH: usize = 60;
pub const MAX_OPTIONS_LENGTH: usize = MAX_IPV4_HEADER_LENGTH - IPV4_HEADER_LENGTH;
pub const MAX_TOTAL_LENGTH: usize = u16::MAX as usize;

const IPV4_VERSION: u8 = 4;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ProtocolType(u8);

impl ProtocolType {
    pub const ICMP: ProtocolType = ProtocolType(1);
    pub const IPIP: ProtocolType = ProtocolType(4);
    pub const TCP: ProtocolType = ProtocolType(6);
    pub const UDP: ProtocolType = ProtocolType(17);
    // Reserved for experimentation by RFC 3692, marks an ASN-FWD encapsulated datagram.
    pub const ASNFWD: ProtocolType = ProtocolType(254);

    pub fn from_u8(value: u8) -> ProtocolType {
        ProtocolType(value)
    }

    pub fn to_u8(self) -> u8 {
        self.0
    }
}

impl fmt::Display for ProtocolType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::ICMP => write!(f, "ICMP"),
            Self::IPIP => write!(f, "IPIP"),
            Self::TCP => write!(f, "TCP"),
            Self::UDP => write!(f, "UDP"),
            Self::ASNFWD => write!(f, "ASN-FWD"),
            _ => write!(f, "Unknown IP protocol {}", self.0),
        }
    }
}

/// View over an IPv4 datagram, starting at the first byte of its header.
///
/// Accessors for the fixed part of the header assume at least 20 bytes are present, which
/// every constructor guarantees. Option accessors are clamped to the available bytes, so a
/// view stays usable while a buffer mutation is halfway through updating the header length.
pub struct Ipv4Header<B> {
    data: B,
}

impl<B: AsRef<[u8]>> Ipv4Header<B> {
    /// Wraps `data` after checking that the fixed header fits.
    pub fn new(data: B) -> Result<Ipv4Header<B>, IpError> {
        if data.as_ref().len() < IPV4_HEADER_LENGTH {
            return Err(IpError::InvalidPacket("Not enough bytes in IPv4 header"));
        }
        Ok(Ipv4Header { data })
    }

    /// Wraps `data` and validates the header against the length of the datagram.
    pub fn new_checked(data: B) -> Result<Ipv4Header<B>, IpError> {
        let header = Self::new(data)?;
        header.validate()?;
        Ok(header)
    }

    pub fn validate(&self) -> Result<(), IpError> {
        let data = self.data.as_ref();
        if self.version() != IPV4_VERSION {
            return Err(IpError::InvalidPacket("Not an IPv4 packet"));
        }
        let header_length = self.header_length();
        if header_length < IPV4_HEADER_LENGTH {
            return Err(IpError::InvalidPacket("IPv4 header length is too small"));
        }
        if data.len() < header_length {
            return Err(IpError::InvalidPacket("IPv4 header length overflow"));
        }
        if self.total_length() as usize != data.len() {
            return Err(IpError::InvalidPacket(
                "IPv4 total length doesn't match packet length",
            ));
        }
        Ok(())
    }

    pub fn version(&self) -> u8 {
        self.data.as_ref()[0] >> 4
    }

    pub fn ihl(&self) -> u8 {
        self.data.as_ref()[0] & 0x0f
    }

    pub fn header_length(&self) -> usize {
        self.ihl() as usize * 4
    }

    pub fn tos(&self) -> u8 {
        self.data.as_ref()[1]
    }

    pub fn total_length(&self) -> u16 {
        self.read_u16(2)
    }

    pub fn identification(&self) -> u16 {
        self.read_u16(4)
    }

    /// Flags and fragment offset, as stored on the wire.
    pub fn fragment(&self) -> u16 {
        self.read_u16(6)
    }

    pub fn ttl(&self) -> u8 {
        self.data.as_ref()[8]
    }

    pub fn protocol(&self) -> ProtocolType {
        ProtocolType::from_u8(self.data.as_ref()[9])
    }

    pub fn checksum(&self) -> u16 {
        self.read_u16(10)
    }

    pub fn src_addr(&self) -> Ipv4Addr {
        self.read_addr(12)
    }

    pub fn dst_addr(&self) -> Ipv4Addr {
        self.read_addr(16)
    }

    fn options_end(&self) -> usize {
        self.header_length()
            .clamp(IPV4_HEADER_LENGTH, self.data.as_ref().len())
    }

    pub fn options(&self) -> &[u8] {
        &self.data.as_ref()[IPV4_HEADER_LENGTH..self.options_end()]
    }

    pub fn header(&self) -> &[u8] {
        &self.data.as_ref()[..self.options_end()]
    }

    pub fn verify_checksum(&self) -> bool {
        let mut checksum = Checksum::from_slice(self.header());
        checksum.fold();
        checksum.value() == 0x0000
    }

    fn read_u16(&self, offset: usize) -> u16 {
        let mut value = [0u8; 2];
        value.copy_from_slice(&self.data.as_ref()[offset..offset + 2]);
        u16::from_be_bytes(value)
    }

    fn read_addr(&self, offset: usize) -> Ipv4Addr {
        let mut addr = [0u8; 4];
        addr.copy_from_slice(&self.data.as_ref()[offset..offset + 4]);
        Ipv4Addr::from(addr)
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> Ipv4Header<B> {
    pub fn set_version(&mut self, version: u8) {
        let data = self.data.as_mut();
        data[0] = (version << 4) | (data[0] & 0x0f);
    }

    pub fn set_ihl(&mut self, ihl: u8) {
        let data = self.data.as_mut();
        data[0] = (data[0] & 0xf0) | (ihl & 0x0f);
    }

    pub fn set_tos(&mut self, tos: u8) {
        self.data.as_mut()[1] = tos;
    }

    pub fn set_total_length(&mut self, total_length: u16) {
        self.data.as_mut()[2..4].copy_from_slice(&total_length.to_be_bytes());
    }

    pub fn set_identification(&mut self, identification: u16) {
        self.data.as_mut()[4..6].copy_from_slice(&identification.to_be_bytes());
    }

    pub fn set_fragment(&mut self, fragment: u16) {
        self.data.as_mut()[6..8].copy_from_slice(&fragment.to_be_bytes());
    }

    pub fn set_ttl(&mut self, ttl: u8) {
        self.data.as_mut()[8] = ttl;
    }

    pub fn set_protocol(&mut self, protocol: ProtocolType) {
        self.data.as_mut()[9] = protocol.to_u8();
    }

    pub fn set_src_addr(&mut self, addr: Ipv4Addr) {
        self.data.as_mut()[12..16].copy_from_slice(&addr.octets());
    }

    pub fn set_dst_addr(&mut self, addr: Ipv4Addr) {
        self.data.as_mut()[16..20].copy_from_slice(&addr.octets());
    }

    pub fn options_mut(&mut self) -> &mut [u8] {
        let end = self.options_end();
        &mut self.data.as_mut()[IPV4_HEADER_LENGTH..end]
    }

    /// Recomputes the header checksum over the current header length.
    pub fn fill_checksum(&mut self) {
        let end = self.options_end();
        let data = self.data.as_mut();
        data[10..12].fill(0);
        let mut checksum = Checksum::from_slice(&data[..end]);
        checksum.fold();
        data[10..12].copy_from_slice(&checksum.value().to_be_bytes());
    }
}

impl<B: AsRef<[u8]>> fmt::Display for Ipv4Header<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "IPv4 {} -> {} {} ihl={} len={} ttl={} checksum={:#06x}",
            self.src_addr(),
            self.dst_addr(),
            self.protocol(),
            self.ihl(),
            self.total_length(),
            self.ttl(),
            self.checksum()
        )
    }
}

/// One's complement sum as used by the IPv4 header checksum (RFC 1071).
struct Checksum(u32);

impl Checksum {
    fn from_slice(data: &[u8]) -> Checksum {
        let mut checksum = Checksum(0);
        checksum.add_slice(data);
        checksum
    }

    #[inline]
    fn fold(&mut self) {
        let mut sum = self.0;
        // At most two adds are needed: 0xffff + 0xffff = 0x1fffe, 0x1+0xfffe = ffff
        sum = (sum >> 16) + (sum & 0x0000ffffu32);
        sum = (sum >> 16) + (sum & 0x0000ffffu32);
        self.0 = sum;
    }

    fn add_slice(&mut self, add: &[u8]) {
        let mut iter = add.chunks_exact(2);
        let full_sum = iter
            .by_ref()
            .map(|bytes| ((bytes[0] as u32) << 8) | (bytes[1] as u32))
            .sum::<u32>();
        let remain_sum = match *iter.remainder() {
            [high] => (high as u32) << 8,
            _ => 0u32,
        };

        self.0 += full_sum + remain_sum;
    }

    fn value(&self) -> u16 {
        // Must fold before calling!
        !((self.0 & 0x0000ffff) as u16)
    }
}

#[derive(Debug)]
pub enum IpError {
    Internal(&'static str),
    InvalidPacket(&'static str),
    InsufficientSpace(&'static str),
    MalformedInstruction(&'static str),
}

impl fmt::Display for IpError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Internal(msg) => f.write_str(msg),
            Self::InvalidPacket(msg) => write!(f, "Invalid packet: {msg}"),
            Self::InsufficientSpace(msg) => write!(f, "Insufficient space: {msg}"),
            Self::MalformedInstruction(msg) => write!(f, "Malformed instruction: {msg}"),
        }
    }
}

impl error::Error for IpError {}

impl From<&'static str> for IpError {
    fn from(msg: &'static str) -> IpError {
        Self::Internal(msg)
    }
}

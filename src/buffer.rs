use crate::ip::{IpError, Ipv4Header, IPV4_HEADER_LENGTH};

/// Whether the host already verified the checksums of the packet.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ChecksumStatus {
    None,
    Unnecessary,
}

/// A single IPv4 datagram with free space (headroom) in front of it.
///
/// The datagram occupies `data[start..]`. Growing the header moves `start` to the left,
/// shrinking moves it to the right; the payload is never copied. Every mutating call returns
/// a new header view, and since views borrow the buffer no view survives a relocation.
pub struct PacketBuffer {
    data: Vec<u8>,
    start: usize,
    checksum_status: ChecksumStatus,
}

impl PacketBuffer {
    pub fn new(packet: &[u8], headroom: usize) -> PacketBuffer {
        let mut data = vec![0u8; headroom + packet.len()];
        data[headroom..].copy_from_slice(packet);
        PacketBuffer {
            data,
            start: headroom,
            checksum_status: ChecksumStatus::None,
        }
    }

    pub fn headroom(&self) -> usize {
        self.start
    }

    pub fn len(&self) -> usize {
        self.data.len() - self.start
    }

    pub fn data(&self) -> &[u8] {
        &self.data[self.start..]
    }

    pub fn checksum_status(&self) -> ChecksumStatus {
        self.checksum_status
    }

    pub fn set_checksum_status(&mut self, status: ChecksumStatus) {
        self.checksum_status = status;
    }

    /// Returns a validated view of the IPv4 header.
    pub fn header(&self) -> Result<Ipv4Header<&[u8]>, IpError> {
        Ipv4Header::new_checked(self.data())
    }

    /// Returns a validated, writable view of the IPv4 header.
    pub fn header_mut(&mut self) -> Result<Ipv4Header<&mut [u8]>, IpError> {
        Ipv4Header::new_checked(&mut self.data[self.start..])
    }

    fn view(&mut self) -> Result<Ipv4Header<&mut [u8]>, IpError> {
        Ipv4Header::new(&mut self.data[self.start..])
    }

    fn check_headroom(&self, n: usize) -> Result<(), IpError> {
        if self.start < n {
            Err(IpError::InsufficientSpace("Not enough headroom in packet buffer"))
        } else if self.len() + n < IPV4_HEADER_LENGTH {
            Err(IpError::InvalidPacket("Not enough bytes in IPv4 header"))
        } else {
            Ok(())
        }
    }

    fn check_removable(&self, offset: usize, n: usize) -> Result<(), IpError> {
        if offset + n > self.len() {
            Err("Removed range is outside of packet".into())
        } else if self.len() - n < IPV4_HEADER_LENGTH {
            Err(IpError::InvalidPacket("Not enough bytes left for an IPv4 header"))
        } else {
            Ok(())
        }
    }

    /// Moves the start of the packet `n` bytes into the headroom, without initializing them.
    pub fn push_front(&mut self, n: usize) -> Result<Ipv4Header<&mut [u8]>, IpError> {
        self.check_headroom(n)?;
        self.start -= n;
        self.view()
    }

    /// Drops the first `n` bytes of the packet.
    pub fn pull_front(&mut self, n: usize) -> Result<Ipv4Header<&mut [u8]>, IpError> {
        self.check_removable(0, n)?;
        self.start += n;
        self.view()
    }

    /// Prepends `n` zeroed bytes to the header.
    pub fn grow_header(&mut self, n: usize) -> Result<Ipv4Header<&mut [u8]>, IpError> {
        self.push_front(n)?;
        self.data[self.start..self.start + n].fill(0);
        self.view()
    }

    /// Removes `n` bytes from the front of the header.
    pub fn shrink_header(&mut self, n: usize) -> Result<Ipv4Header<&mut [u8]>, IpError> {
        self.remove_from_header(0, n)
    }

    /// Opens a zeroed gap of `n` bytes at `offset`, moving everything before `offset` into
    /// the headroom. The header length and total length fields are left to the caller.
    pub fn insert_in_header(
        &mut self,
        offset: usize,
        n: usize,
    ) -> Result<Ipv4Header<&mut [u8]>, IpError> {
        if offset > self.len() {
            return Err("Insert offset is outside of packet".into());
        }
        self.check_headroom(n)?;
        let start = self.start;
        self.data.copy_within(start..start + offset, start - n);
        self.start -= n;
        self.data[start - n + offset..start + offset].fill(0);
        self.view()
    }

    /// Removes `n` bytes at `offset`, moving everything before `offset` forward to close the
    /// gap. The header length and total length fields are left to the caller.
    pub fn remove_from_header(
        &mut self,
        offset: usize,
        n: usize,
    ) -> Result<Ipv4Header<&mut [u8]>, IpError> {
        self.check_removable(offset, n)?;
        let start = self.start;
        self.data.copy_within(start..start + offset, start + n);
        self.start += n;
        self.view()
    }
}

use std::net::Ipv4Addr;

use crate::buffer::PacketBuffer;
use crate::forward::Disposition;
use crate::ip::{IpError, Ipv4Header, IPV4_HEADER_LENGTH, MAX_OPTIONS_LENGTH, MAX_TOTAL_LENGTH};

const OPTION_END: u8 = 0;
const OPTION_NOOP: u8 = 1;
// Copied flag set, class 2 (debugging and measurement), number 30.
const OPTION_ASNFWD: u8 = 222;
pub const INSTRUCTION_LENGTH: usize = 8;

/// Location and content of an ASN-FWD option found in a header.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Instruction {
    offset: usize,
    original_dst: Ipv4Addr,
}

impl Instruction {
    /// Offset of the option from the start of the IPv4 header.
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn original_dst(&self) -> Ipv4Addr {
        self.original_dst
    }
}

/// Scans the options area for an ASN-FWD option.
///
/// Returns an error if the options are structurally invalid, or if the ASN-FWD option
/// doesn't have the expected length. A truncated instruction is never treated as missing.
pub fn find_instruction<B: AsRef<[u8]>>(
    header: &Ipv4Header<B>,
) -> Result<Option<Instruction>, IpError> {
    let options = header.options();
    let mut i = 0;
    while i < options.len() {
        if matches!(options[i], OPTION_END | OPTION_NOOP) {
            i += 1;
            continue;
        }
        let remaining = options.len() - i;
        if remaining < 2 {
            return Err(IpError::MalformedInstruction("IP option has no length"));
        }
        let length = options[i + 1] as usize;
        if length < 2 || length > remaining {
            return Err(IpError::MalformedInstruction("IP option has invalid length"));
        }
        if options[i] == OPTION_ASNFWD {
            if length != INSTRUCTION_LENGTH {
                return Err(IpError::MalformedInstruction(
                    "ASN-FWD option has invalid length",
                ));
            }
            let mut original_dst = [0u8; 4];
            original_dst.copy_from_slice(&options[i + 2..i + 6]);
            return Ok(Some(Instruction {
                offset: IPV4_HEADER_LENGTH + i,
                original_dst: Ipv4Addr::from(original_dst),
            }));
        }
        i += length;
    }
    Ok(None)
}

/// Replaces every End of Options List marker with a No Operation.
///
/// A new option is appended after the existing ones, and must not end up behind an
/// earlier end marker.
pub fn sanitize_end_markers<B: AsRef<[u8]> + AsMut<[u8]>>(header: &mut Ipv4Header<B>) {
    let options = header.options_mut();
    let mut i = 0;
    while i < options.len() {
        match options[i] {
            OPTION_END => {
                options[i] = OPTION_NOOP;
                i += 1;
            }
            OPTION_NOOP => i += 1,
            _ => match options.get(i + 1) {
                Some(&length) if length >= 2 => i += length as usize,
                _ => break,
            },
        }
    }
}

/// Saves the current destination into an ASN-FWD option and sends the packet to `gateway`.
///
/// The buffer is left untouched if the option doesn't fit into the headroom or into the
/// options area.
pub fn encode(packet: &mut PacketBuffer, gateway: Ipv4Addr) -> Result<Disposition, IpError> {
    let header = packet.header()?;
    let header_length = header.header_length();
    let options_length = header.options().len();
    let total_length = header.total_length() as usize + INSTRUCTION_LENGTH;
    let original_dst = header.dst_addr();

    if packet.headroom() < INSTRUCTION_LENGTH
        || MAX_OPTIONS_LENGTH - options_length < INSTRUCTION_LENGTH
    {
        return Err(IpError::InsufficientSpace("No space to add ASN-FWD option"));
    }
    if total_length > MAX_TOTAL_LENGTH {
        return Err(IpError::InsufficientSpace(
            "ASN-FWD option exceeds maximum IPv4 length",
        ));
    }

    sanitize_end_markers(&mut packet.header_mut()?);

    let mut header = packet.insert_in_header(header_length, INSTRUCTION_LENGTH)?;
    header.set_ihl(((header_length + INSTRUCTION_LENGTH) / 4) as u8);
    header.set_total_length(total_length as u16);
    let option = &mut header.options_mut()[options_length..options_length + INSTRUCTION_LENGTH];
    option[0] = OPTION_ASNFWD;
    option[1] = INSTRUCTION_LENGTH as u8;
    option[2..6].copy_from_slice(&original_dst.octets());
    option[6] = OPTION_NOOP;
    option[7] = OPTION_END;
    header.set_dst_addr(gateway);
    // Checksum is filled in by the dispatcher.
    Ok(Disposition::Modified)
}

/// Restores the destination saved in `instruction` and removes the ASN-FWD option.
pub fn decode(packet: &mut PacketBuffer, instruction: Instruction) -> Result<Disposition, IpError> {
    let mut header = packet.header_mut()?;
    let header_length = header.header_length();
    let total_length = header.total_length() as usize;
    if instruction.offset < IPV4_HEADER_LENGTH
        || instruction.offset + INSTRUCTION_LENGTH > header_length
    {
        return Err("ASN-FWD option is outside of the IPv4 header".into());
    }
    header.set_dst_addr(instruction.original_dst);

    let mut header = packet.remove_from_header(instruction.offset, INSTRUCTION_LENGTH)?;
    header.set_ihl(((header_length - INSTRUCTION_LENGTH) / 4) as u8);
    header.set_total_length((total_length - INSTRUCTION_LENGTH) as u16);
    Ok(Disposition::Modified)
}

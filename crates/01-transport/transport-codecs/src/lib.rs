#![deny(missing_docs)]
//! HCI UART wire format shared by the bus driver and its callers.
//!
//! Every packet on the link starts with one packet-type byte followed by a
//! type-specific header whose length is fixed per type. Data packets encode
//! their payload length inside that header; the four sleep-protocol packets
//! are a bare type byte.

use thiserror::Error;

/// Longest protocol header (ACL) that follows the packet-type byte.
pub const MAX_HEADER_LEN: usize = 4;

/// Packet-type byte plus the longest header.
pub const MAX_WIRE_HEADER_LEN: usize = 1 + MAX_HEADER_LEN;

/// Errors raised while interpreting or building wire frames.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// The packet-type byte is not part of the supported set.
    #[error("unknown packet type 0x{0:02x}")]
    UnknownPacketType(u8),
    /// Header bytes do not match the fixed length of the packet type.
    #[error("{packet_type:?} header must be {expected} bytes, got {actual}")]
    HeaderLength {
        /// Packet type the header was built for.
        packet_type: PacketType,
        /// Fixed header length of that type.
        expected: usize,
        /// Number of bytes supplied.
        actual: usize,
    },
    /// Payload length disagrees with the length encoded in the header.
    #[error("header declares {declared} payload bytes but {actual} were supplied")]
    LengthMismatch {
        /// Length taken from the header.
        declared: usize,
        /// Length of the payload supplied.
        actual: usize,
    },
    /// Declared payload does not fit the receive buffer.
    #[error("declared payload of {declared} bytes exceeds receive capacity {capacity}")]
    Oversized {
        /// Length taken from the header.
        declared: usize,
        /// Bytes available in the receive buffer.
        capacity: usize,
    },
}

/// Closed set of packet types carried over the link.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    /// HCI command (host to controller).
    Command = 0x01,
    /// ACL data.
    Acl = 0x02,
    /// SCO audio data.
    Sco = 0x03,
    /// HCI event (controller to host).
    Event = 0x04,
    /// Vendor-specific (NAVC) channel.
    Vendor = 0x09,
    /// Peer asks to put the link to sleep.
    SleepInd = 0x30,
    /// Acknowledges a sleep indication.
    SleepAck = 0x31,
    /// Peer asks to wake the link.
    WakeInd = 0x32,
    /// Acknowledges a wake indication.
    WakeAck = 0x33,
}

impl PacketType {
    /// Every supported packet type, data types first.
    pub const ALL: [PacketType; 9] = [
        PacketType::Command,
        PacketType::Acl,
        PacketType::Sco,
        PacketType::Event,
        PacketType::Vendor,
        PacketType::SleepInd,
        PacketType::SleepAck,
        PacketType::WakeInd,
        PacketType::WakeAck,
    ];

    /// Raw packet-type byte.
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Length of the protocol header that follows the type byte.
    pub const fn header_len(self) -> usize {
        match self {
            PacketType::Command => 3,
            PacketType::Acl => 4,
            PacketType::Sco => 3,
            PacketType::Event => 2,
            PacketType::Vendor => 3,
            PacketType::SleepInd
            | PacketType::SleepAck
            | PacketType::WakeInd
            | PacketType::WakeAck => 0,
        }
    }

    /// Sleep-protocol opcode carried by this type, if any.
    pub const fn sleep_op(self) -> Option<SleepOp> {
        match self {
            PacketType::SleepInd => Some(SleepOp::SleepInd),
            PacketType::SleepAck => Some(SleepOp::SleepAck),
            PacketType::WakeInd => Some(SleepOp::WakeInd),
            PacketType::WakeAck => Some(SleepOp::WakeAck),
            _ => None,
        }
    }

    /// True for the four sleep-protocol control types.
    pub const fn is_sleep(self) -> bool {
        self.sleep_op().is_some()
    }
}

impl TryFrom<u8> for PacketType {
    type Error = FrameError;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        Ok(match byte {
            0x01 => PacketType::Command,
            0x02 => PacketType::Acl,
            0x03 => PacketType::Sco,
            0x04 => PacketType::Event,
            0x09 => PacketType::Vendor,
            0x30 => PacketType::SleepInd,
            0x31 => PacketType::SleepAck,
            0x32 => PacketType::WakeInd,
            0x33 => PacketType::WakeAck,
            other => return Err(FrameError::UnknownPacketType(other)),
        })
    }
}

/// Sleep-protocol control opcodes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SleepOp {
    /// Sleep indication.
    SleepInd,
    /// Sleep acknowledgment.
    SleepAck,
    /// Wake indication.
    WakeInd,
    /// Wake acknowledgment.
    WakeAck,
}

impl SleepOp {
    /// Packet type used to carry the opcode on the wire.
    pub const fn packet_type(self) -> PacketType {
        match self {
            SleepOp::SleepInd => PacketType::SleepInd,
            SleepOp::SleepAck => PacketType::SleepAck,
            SleepOp::WakeInd => PacketType::WakeInd,
            SleepOp::WakeAck => PacketType::WakeAck,
        }
    }
}

/// Decodes the payload length from a protocol header (type byte excluded).
pub fn payload_len(packet_type: PacketType, header: &[u8]) -> Result<usize, FrameError> {
    let expected = packet_type.header_len();
    if header.len() != expected {
        return Err(FrameError::HeaderLength {
            packet_type,
            expected,
            actual: header.len(),
        });
    }
    Ok(match packet_type {
        PacketType::Command => header[2] as usize,
        PacketType::Acl => u16::from_le_bytes([header[2], header[3]]) as usize,
        PacketType::Sco => header[2] as usize,
        PacketType::Event => header[1] as usize,
        PacketType::Vendor => u16::from_le_bytes([header[1], header[2]]) as usize,
        _ => 0,
    })
}

/// Packet-type byte plus protocol header, ready to be written ahead of a payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameHeader {
    packet_type: PacketType,
    bytes: [u8; MAX_WIRE_HEADER_LEN],
}

impl FrameHeader {
    /// Builds a header from raw protocol header bytes (type byte excluded).
    pub fn new(packet_type: PacketType, header: &[u8]) -> Result<Self, FrameError> {
        let expected = packet_type.header_len();
        if header.len() != expected {
            return Err(FrameError::HeaderLength {
                packet_type,
                expected,
                actual: header.len(),
            });
        }
        let mut bytes = [0u8; MAX_WIRE_HEADER_LEN];
        bytes[0] = packet_type.as_u8();
        bytes[1..=expected].copy_from_slice(header);
        Ok(Self { packet_type, bytes })
    }

    /// Command header: little-endian opcode followed by a one-byte length.
    pub fn command(opcode: u16, len: u8) -> Self {
        let [lo, hi] = opcode.to_le_bytes();
        Self::from_parts(PacketType::Command, &[lo, hi, len])
    }

    /// ACL header: little-endian handle/flags followed by a little-endian length.
    pub fn acl(handle_flags: u16, len: u16) -> Self {
        let [h0, h1] = handle_flags.to_le_bytes();
        let [l0, l1] = len.to_le_bytes();
        Self::from_parts(PacketType::Acl, &[h0, h1, l0, l1])
    }

    /// SCO header: little-endian handle followed by a one-byte length.
    pub fn sco(handle: u16, len: u8) -> Self {
        let [h0, h1] = handle.to_le_bytes();
        Self::from_parts(PacketType::Sco, &[h0, h1, len])
    }

    /// Event header: event code followed by a one-byte length.
    pub fn event(code: u8, len: u8) -> Self {
        Self::from_parts(PacketType::Event, &[code, len])
    }

    /// Vendor header: one opcode byte followed by a little-endian length.
    pub fn vendor(opcode: u8, len: u16) -> Self {
        let [l0, l1] = len.to_le_bytes();
        Self::from_parts(PacketType::Vendor, &[opcode, l0, l1])
    }

    /// Single-byte header of a sleep-protocol control packet.
    pub fn sleep(op: SleepOp) -> Self {
        Self::from_parts(op.packet_type(), &[])
    }

    fn from_parts(packet_type: PacketType, header: &[u8]) -> Self {
        let mut bytes = [0u8; MAX_WIRE_HEADER_LEN];
        bytes[0] = packet_type.as_u8();
        bytes[1..=header.len()].copy_from_slice(header);
        Self { packet_type, bytes }
    }

    /// Packet type of the frame.
    pub fn packet_type(&self) -> PacketType {
        self.packet_type
    }

    /// Protocol header bytes, type byte excluded.
    pub fn header_bytes(&self) -> &[u8] {
        &self.bytes[1..self.wire_len()]
    }

    /// Type byte plus protocol header, as written on the wire.
    pub fn wire_bytes(&self) -> &[u8] {
        &self.bytes[..self.wire_len()]
    }

    /// Number of bytes in [`FrameHeader::wire_bytes`].
    pub fn wire_len(&self) -> usize {
        1 + self.packet_type.header_len()
    }

    /// Payload length declared by the header.
    pub fn payload_len(&self) -> usize {
        // Header length is validated at construction.
        payload_len(self.packet_type, self.header_bytes()).unwrap_or(0)
    }
}

/// Serializes a complete frame, checking the payload against the header.
pub fn encode_frame(header: &FrameHeader, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    let declared = header.payload_len();
    if declared != payload.len() {
        return Err(FrameError::LengthMismatch {
            declared,
            actual: payload.len(),
        });
    }
    let mut out = Vec::with_capacity(header.wire_len() + payload.len());
    out.extend_from_slice(header.wire_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

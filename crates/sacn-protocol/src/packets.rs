use crate::cid::Cid;
use crate::error::PacketError;
use crate::{is_valid_universe, DEFAULT_PRIORITY, MAX_PRIORITY, UNIVERSES_PER_PAGE, UNIVERSE_SIZE};

// -- Root layer constants --

pub const PREAMBLE_SIZE: u16 = 0x0010;
pub const POSTAMBLE_SIZE: u16 = 0x0000;
pub const ACN_PACKET_IDENTIFIER: [u8; 12] = *b"ASC-E1.17\0\0\0";

pub const VECTOR_ROOT_E131_DATA: u32 = 0x0000_0004;
pub const VECTOR_ROOT_E131_EXTENDED: u32 = 0x0000_0008;

// -- Framing / DMP / discovery layer constants --

pub const VECTOR_E131_DATA_PACKET: u32 = 0x0000_0002;
pub const VECTOR_E131_EXTENDED_DISCOVERY: u32 = 0x0000_0002;
pub const VECTOR_DMP_SET_PROPERTY: u8 = 0x02;
pub const DMP_ADDRESS_DATA_TYPE: u8 = 0xa1;
pub const VECTOR_UNIVERSE_DISCOVERY_UNIVERSE_LIST: u32 = 0x0000_0001;

/// Top nibble of every PDU length field
const PDU_FLAGS: u16 = 0x7000;

const SOURCE_NAME_LEN: usize = 64;

// -- Field offsets shared by both packet kinds --

const ROOT_LENGTH: usize = 16;
const ROOT_VECTOR: usize = 18;
const CID_OFFSET: usize = 22;
const FRAMING_LENGTH: usize = 38;
const FRAMING_VECTOR: usize = 40;
const SOURCE_NAME: usize = 44;

// -- Data packet offsets --

const PRIORITY: usize = 108;
const SEQUENCE: usize = 111;
const UNIVERSE: usize = 113;
const DMP_LENGTH: usize = 115;
const DMP_VECTOR: usize = 117;
const DMP_ADDRESS_TYPE: usize = 118;
const DMP_ADDRESS_INCREMENT: usize = 121;
const PROPERTY_COUNT: usize = 123;

// -- Discovery packet offsets --

const DISCOVERY_LENGTH: usize = 112;
const DISCOVERY_VECTOR: usize = 114;
const PAGE: usize = 118;
const LAST_PAGE: usize = 119;

/// Smallest buffer that carries a root vector.
pub const MIN_PACKET_SIZE: usize = 22;

/// A decoded sACN datagram. There are exactly two kinds the toolkit
/// understands; everything else is a decode error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Data(DataPacket),
    Discovery(DiscoveryPacket),
}

impl Packet {
    /// Parse one datagram. Returns the first problem found; never a
    /// partially-filled packet.
    pub fn deserialize(data: &[u8]) -> Result<Self, PacketError> {
        if data.len() < MIN_PACKET_SIZE {
            return Err(PacketError::TooShort);
        }
        if data[4..16] != ACN_PACKET_IDENTIFIER {
            return Err(PacketError::InvalidHeader);
        }

        match read_u32(data, ROOT_VECTOR) {
            VECTOR_ROOT_E131_DATA => DataPacket::parse(data).map(Packet::Data),
            VECTOR_ROOT_E131_EXTENDED => DiscoveryPacket::parse(data).map(Packet::Discovery),
            _ => Err(PacketError::InvalidVector),
        }
    }

    pub fn cid(&self) -> Cid {
        match self {
            Packet::Data(p) => p.cid,
            Packet::Discovery(p) => p.cid,
        }
    }

    pub fn source_name(&self) -> &str {
        match self {
            Packet::Data(p) => &p.source_name,
            Packet::Discovery(p) => &p.source_name,
        }
    }
}

// -- Data Packet --
// One frame of DMX512 levels for one universe.

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPacket {
    pub cid: Cid,
    pub source_name: String,
    /// 0-200; values above 200 are clamped when encoding
    pub priority: u8,
    pub sequence: u8,
    pub universe: u16,
    dmx: [u8; UNIVERSE_SIZE],
    dmx_len: usize,
}

impl DataPacket {
    /// Everything up to and including the DMX start code
    pub const HEADER_SIZE: usize = 126;
    /// Header plus a full universe
    pub const MAX_SIZE: usize = Self::HEADER_SIZE + UNIVERSE_SIZE;

    pub fn new(cid: Cid, source_name: impl Into<String>, universe: u16, sequence: u8, dmx: &[u8]) -> Self {
        let mut packet = Self {
            cid,
            source_name: source_name.into(),
            priority: DEFAULT_PRIORITY,
            sequence,
            universe,
            dmx: [0; UNIVERSE_SIZE],
            dmx_len: 0,
        };
        packet.set_dmx(dmx);
        packet
    }

    /// Channel levels (start code excluded). Never longer than 512.
    pub fn dmx(&self) -> &[u8] {
        &self.dmx[..self.dmx_len]
    }

    /// Replace the channel levels, keeping at most the first 512.
    pub fn set_dmx(&mut self, dmx: &[u8]) {
        let len = dmx.len().min(UNIVERSE_SIZE);
        self.dmx[..len].copy_from_slice(&dmx[..len]);
        self.dmx[len..].fill(0);
        self.dmx_len = len;
    }

    /// Size of this packet on the wire.
    pub fn wire_len(&self) -> usize {
        Self::HEADER_SIZE + self.dmx_len
    }

    /// Encode into `buf`, returning the number of bytes written.
    pub fn serialize(&self, buf: &mut [u8; Self::MAX_SIZE]) -> usize {
        let len = self.wire_len();
        let buf = &mut buf[..len];
        buf.fill(0);

        write_root_layer(buf, VECTOR_ROOT_E131_DATA, &self.cid);
        write_framing_header(buf, VECTOR_E131_DATA_PACKET, &self.source_name);

        buf[PRIORITY] = self.priority.min(MAX_PRIORITY);
        // 109-110 sync address and 112 options stay zero
        buf[SEQUENCE] = self.sequence;
        buf[UNIVERSE..UNIVERSE + 2].copy_from_slice(&self.universe.to_be_bytes());

        write_flags_length(buf, DMP_LENGTH);
        buf[DMP_VECTOR] = VECTOR_DMP_SET_PROPERTY;
        buf[DMP_ADDRESS_TYPE] = DMP_ADDRESS_DATA_TYPE;
        // 119-120 first property address is zero
        buf[DMP_ADDRESS_INCREMENT..DMP_ADDRESS_INCREMENT + 2].copy_from_slice(&1u16.to_be_bytes());
        let property_count = (self.dmx_len + 1) as u16;
        buf[PROPERTY_COUNT..PROPERTY_COUNT + 2].copy_from_slice(&property_count.to_be_bytes());
        // 125 start code is zero
        buf[Self::HEADER_SIZE..].copy_from_slice(self.dmx());

        len
    }

    fn parse(data: &[u8]) -> Result<Self, PacketError> {
        if data.len() < Self::HEADER_SIZE {
            return Err(PacketError::TooShort);
        }
        if read_u32(data, FRAMING_VECTOR) != VECTOR_E131_DATA_PACKET {
            return Err(PacketError::InvalidVector);
        }
        if data[DMP_VECTOR] != VECTOR_DMP_SET_PROPERTY || data[DMP_ADDRESS_TYPE] != DMP_ADDRESS_DATA_TYPE {
            return Err(PacketError::InvalidVector);
        }

        // Property count includes the start code
        let property_count = read_u16(data, PROPERTY_COUNT) as usize;
        if property_count < 1 {
            return Err(PacketError::TooShort);
        }
        let dmx_len = (property_count - 1).min(UNIVERSE_SIZE);
        if data.len() < Self::HEADER_SIZE + dmx_len {
            return Err(PacketError::TooShort);
        }

        let mut dmx = [0u8; UNIVERSE_SIZE];
        dmx[..dmx_len].copy_from_slice(&data[Self::HEADER_SIZE..Self::HEADER_SIZE + dmx_len]);

        Ok(Self {
            cid: Cid::from_slice(&data[CID_OFFSET..]),
            source_name: read_source_name(data),
            priority: data[PRIORITY],
            sequence: data[SEQUENCE],
            universe: read_u16(data, UNIVERSE),
            dmx,
            dmx_len,
        })
    }
}

// -- Universe Discovery Packet --
// One page of the list of universes a source is transmitting.

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryPacket {
    pub cid: Cid,
    pub source_name: String,
    pub page: u8,
    /// Index of the final page (total pages - 1)
    pub last_page: u8,
    pub universes: Vec<u16>,
}

impl DiscoveryPacket {
    /// Everything before the universe list
    pub const HEADER_SIZE: usize = 120;
    /// Shortest extended packet that can still carry a discovery vector
    const FRAMING_MIN_SIZE: usize = 118;
    pub const MAX_SIZE: usize = Self::HEADER_SIZE + UNIVERSES_PER_PAGE * 2;

    /// Encode into `buf` (cleared first). Lists longer than 512 entries are
    /// cut to the first 512; paging is the caller's job.
    pub fn serialize(&self, buf: &mut Vec<u8>) {
        let count = self.universes.len().min(UNIVERSES_PER_PAGE);
        buf.clear();
        buf.resize(Self::HEADER_SIZE + count * 2, 0);

        write_root_layer(buf, VECTOR_ROOT_E131_EXTENDED, &self.cid);
        write_framing_header(buf, VECTOR_E131_EXTENDED_DISCOVERY, &self.source_name);
        // 108-111 reserved

        write_flags_length(buf, DISCOVERY_LENGTH);
        buf[DISCOVERY_VECTOR..DISCOVERY_VECTOR + 4]
            .copy_from_slice(&VECTOR_UNIVERSE_DISCOVERY_UNIVERSE_LIST.to_be_bytes());
        buf[PAGE] = self.page;
        buf[LAST_PAGE] = self.last_page;

        for (slot, universe) in buf[Self::HEADER_SIZE..]
            .chunks_exact_mut(2)
            .zip(&self.universes[..count])
        {
            slot.copy_from_slice(&universe.to_be_bytes());
        }
    }

    fn parse(data: &[u8]) -> Result<Self, PacketError> {
        if data.len() < Self::FRAMING_MIN_SIZE {
            return Err(PacketError::TooShort);
        }
        if read_u32(data, FRAMING_VECTOR) != VECTOR_E131_EXTENDED_DISCOVERY {
            return Err(PacketError::InvalidVector);
        }
        if data.len() < Self::HEADER_SIZE {
            return Err(PacketError::TooShort);
        }
        if read_u32(data, DISCOVERY_VECTOR) != VECTOR_UNIVERSE_DISCOVERY_UNIVERSE_LIST {
            return Err(PacketError::InvalidVector);
        }

        // Out-of-range entries (padding, broken peers) are skipped, not fatal
        let universes = data[Self::HEADER_SIZE..]
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .filter(|&u| is_valid_universe(u))
            .collect();

        Ok(Self {
            cid: Cid::from_slice(&data[CID_OFFSET..]),
            source_name: read_source_name(data),
            page: data[PAGE],
            last_page: data[LAST_PAGE],
            universes,
        })
    }
}

// -- Shared layer writers / readers --

fn write_root_layer(buf: &mut [u8], vector: u32, cid: &Cid) {
    buf[0..2].copy_from_slice(&PREAMBLE_SIZE.to_be_bytes());
    buf[2..4].copy_from_slice(&POSTAMBLE_SIZE.to_be_bytes());
    buf[4..16].copy_from_slice(&ACN_PACKET_IDENTIFIER);
    write_flags_length(buf, ROOT_LENGTH);
    buf[ROOT_VECTOR..ROOT_VECTOR + 4].copy_from_slice(&vector.to_be_bytes());
    buf[CID_OFFSET..CID_OFFSET + Cid::LEN].copy_from_slice(cid.as_bytes());
}

fn write_framing_header(buf: &mut [u8], vector: u32, source_name: &str) {
    write_flags_length(buf, FRAMING_LENGTH);
    buf[FRAMING_VECTOR..FRAMING_VECTOR + 4].copy_from_slice(&vector.to_be_bytes());

    let name = source_name.as_bytes();
    let n = name.len().min(SOURCE_NAME_LEN);
    buf[SOURCE_NAME..SOURCE_NAME + n].copy_from_slice(&name[..n]);
}

/// A PDU length covers everything from its own length field to the end of
/// the packet.
fn write_flags_length(buf: &mut [u8], offset: usize) {
    let value = PDU_FLAGS | (buf.len() - offset) as u16;
    buf[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
}

fn read_u16(data: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([data[offset], data[offset + 1]])
}

fn read_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([data[offset], data[offset + 1], data[offset + 2], data[offset + 3]])
}

fn read_source_name(data: &[u8]) -> String {
    String::from_utf8_lossy(&data[SOURCE_NAME..SOURCE_NAME + SOURCE_NAME_LEN])
        .trim_end_matches('\0')
        .to_string()
}

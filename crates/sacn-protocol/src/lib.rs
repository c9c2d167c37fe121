pub mod cid;
pub mod error;
pub mod packets;

use std::net::{Ipv4Addr, SocketAddrV4};

pub use cid::Cid;
pub use error::PacketError;
pub use packets::{DataPacket, DiscoveryPacket, Packet};

/// UDP port for all sACN traffic (data and discovery)
pub const SACN_PORT: u16 = 5568;

/// Universe discovery multicast group
pub const DISCOVERY_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 250, 214);

/// Discovery advertisements use the reserved universe 64214 (0xFAD6)
pub const DISCOVERY_UNIVERSE: u16 = 64214;

/// Valid data universes
pub const MIN_UNIVERSE: u16 = 1;
pub const MAX_UNIVERSE: u16 = 63999;

/// DMX512 slots per universe (not counting the start code)
pub const UNIVERSE_SIZE: usize = 512;

/// Universes listed per discovery page
pub const UNIVERSES_PER_PAGE: usize = 512;

/// Default source priority
pub const DEFAULT_PRIORITY: u8 = 100;
pub const MAX_PRIORITY: u8 = 200;

/// Timing defaults (E1.31 §12)
pub const DISCOVERY_INTERVAL_SECS: u64 = 10;
pub const SOURCE_EXPIRY_SECS: u64 = 60;
pub const SWEEP_INTERVAL_SECS: u64 = 30;

pub fn is_valid_universe(universe: u16) -> bool {
    (MIN_UNIVERSE..=MAX_UNIVERSE).contains(&universe)
}

/// Multicast group for a universe: 239.255.<hi>.<lo>
pub fn universe_group(universe: u16) -> Ipv4Addr {
    let [hi, lo] = universe.to_be_bytes();
    Ipv4Addr::new(239, 255, hi, lo)
}

/// Destination socket address for a universe's data stream.
pub fn universe_addr(universe: u16) -> SocketAddrV4 {
    SocketAddrV4::new(universe_group(universe), SACN_PORT)
}

pub fn discovery_addr() -> SocketAddrV4 {
    SocketAddrV4::new(DISCOVERY_GROUP, SACN_PORT)
}

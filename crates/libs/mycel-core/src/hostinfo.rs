use core::fmt;

use crate::buffer::{InputBuffer, OutputBuffer};
use crate::clock::Timestamp;
use crate::error::CoreError;
use crate::id::{Magic, PeerId};
use crate::Wire;

pub const MAX_LOWLEVEL_ADDRESSES: usize = 16;
pub const HOSTINFO_NAME_WIRE_LEN: usize = 64;
const ADDR_RAW_WIRE_LEN: usize = 8;
const DEVICE_NAME_WIRE_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrFamily {
    Stream = 0,
    Datagram = 1,
    L2cap = 2,
}

impl AddrFamily {
    pub fn from_wire(value: u8) -> Result<Self, CoreError> {
        match value {
            0 => Ok(AddrFamily::Stream),
            1 => Ok(AddrFamily::Datagram),
            2 => Ok(AddrFamily::L2cap),
            _ => Err(CoreError::Malformed),
        }
    }
}

/// One low-level way of reaching a host: an address family, raw address
/// bytes (IPv4 octets or a Bluetooth bd-addr) and a port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LowLevelAddress {
    pub family: AddrFamily,
    pub raw: Vec<u8>,
    pub port: u16,
    pub is_loopback: bool,
    pub device: String,
}

impl LowLevelAddress {
    pub fn ipv4(family: AddrFamily, octets: [u8; 4], port: u16, is_loopback: bool) -> Self {
        Self { family, raw: octets.to_vec(), port, is_loopback, device: String::new() }
    }

    pub fn serialize(&self, buffer: &mut OutputBuffer) -> Result<usize, CoreError> {
        if self.raw.len() > ADDR_RAW_WIRE_LEN {
            return Err(CoreError::InvalidArgument);
        }

        buffer.write_byte(self.family as u8)?;
        buffer.write_byte(self.is_loopback as u8)?;
        buffer.write_byte(self.raw.len() as u8)?;
        let mut raw = [0u8; ADDR_RAW_WIRE_LEN];
        raw[..self.raw.len()].copy_from_slice(&self.raw);
        buffer.write(&raw)?;
        buffer.write_u16(self.port)?;
        buffer.write_padded(&self.device, DEVICE_NAME_WIRE_LEN)?;

        Ok(buffer.offset())
    }

    pub fn deserialize(buffer: &mut InputBuffer) -> Result<Self, CoreError> {
        let family = AddrFamily::from_wire(buffer.read_byte()?)?;
        let is_loopback = buffer.read_byte()? != 0;
        let len = buffer.read_byte()? as usize;
        if len > ADDR_RAW_WIRE_LEN {
            return Err(CoreError::Malformed);
        }
        let mut raw = [0u8; ADDR_RAW_WIRE_LEN];
        buffer.read(&mut raw)?;
        let port = buffer.read_u16()?;
        let device = buffer.read_padded(DEVICE_NAME_WIRE_LEN)?;

        Ok(Self { family, raw: raw[..len].to_vec(), port, is_loopback, device })
    }
}

impl fmt::Display for LowLevelAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.family {
            AddrFamily::Stream | AddrFamily::Datagram if self.raw.len() == 4 => {
                let scheme = if self.family == AddrFamily::Stream { "tcp" } else { "udp" };
                write!(
                    f,
                    "{}://{}.{}.{}.{}:{}",
                    scheme, self.raw[0], self.raw[1], self.raw[2], self.raw[3], self.port
                )
            }
            AddrFamily::L2cap => write!(f, "bt://{};{}", hex::encode(&self.raw), self.port),
            _ => write!(f, "?:{}", hex::encode(&self.raw)),
        }
    }
}

/// Everything one peer knows about another: identity, incarnation magic,
/// names, cluster witness and the addresses it may be reached at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostInfo {
    pub id: PeerId,
    pub magic: Magic,
    pub hostname: String,
    pub fullname: String,
    /// Lowest routable PeerId this peer can currently see, including itself.
    pub network_cluster: PeerId,
    pub addresses: Vec<LowLevelAddress>,
    pub last_seen: Timestamp,
    /// 0 on a live beacon, 1 when relayed from another peer's store.
    pub is_cached: bool,
}

impl HostInfo {
    pub fn new(id: PeerId, magic: Magic, hostname: &str, fullname: &str) -> Self {
        Self {
            id,
            magic,
            hostname: hostname.to_string(),
            fullname: fullname.to_string(),
            network_cluster: id,
            addresses: Vec::new(),
            last_seen: Timestamp::ZERO,
            is_cached: false,
        }
    }

    pub fn push_address(&mut self, address: LowLevelAddress) -> Result<(), CoreError> {
        if self.addresses.len() >= MAX_LOWLEVEL_ADDRESSES {
            return Err(CoreError::OutOfSpace);
        }
        self.addresses.push(address);
        Ok(())
    }

    pub fn has_loopback_only(&self) -> bool {
        !self.addresses.is_empty() && self.addresses.iter().all(|a| a.is_loopback)
    }
}

impl Wire for HostInfo {
    fn serialize(&self, buffer: &mut OutputBuffer) -> Result<usize, CoreError> {
        if self.addresses.len() > MAX_LOWLEVEL_ADDRESSES {
            return Err(CoreError::InvalidArgument);
        }

        buffer.write_byte(self.is_cached as u8)?;
        self.id.serialize(buffer)?;
        self.magic.serialize(buffer)?;
        self.network_cluster.serialize(buffer)?;
        buffer.write_padded(&self.hostname, HOSTINFO_NAME_WIRE_LEN)?;
        buffer.write_padded(&self.fullname, HOSTINFO_NAME_WIRE_LEN)?;
        buffer.write_i64(self.last_seen.secs())?;
        buffer.write_u32(self.last_seen.subsec_micros())?;
        buffer.write_byte(self.addresses.len() as u8)?;
        for address in &self.addresses {
            address.serialize(buffer)?;
        }

        Ok(buffer.offset())
    }

    fn deserialize(buffer: &mut InputBuffer) -> Result<Self, CoreError> {
        let is_cached = buffer.read_byte()? != 0;
        let id = PeerId::deserialize(buffer)?;
        let magic = Magic::deserialize(buffer)?;
        let network_cluster = PeerId::deserialize(buffer)?;
        let hostname = buffer.read_padded(HOSTINFO_NAME_WIRE_LEN)?;
        let fullname = buffer.read_padded(HOSTINFO_NAME_WIRE_LEN)?;
        let secs = buffer.read_i64()?;
        let micros = buffer.read_u32()?;
        let naddr = buffer.read_byte()? as usize;
        if naddr > MAX_LOWLEVEL_ADDRESSES {
            return Err(CoreError::Malformed);
        }

        let mut addresses = Vec::with_capacity(naddr);
        for _ in 0..naddr {
            addresses.push(LowLevelAddress::deserialize(buffer)?);
        }

        Ok(Self {
            id,
            magic,
            hostname,
            fullname,
            network_cluster,
            addresses,
            last_seen: Timestamp::from_parts(secs, micros),
            is_cached,
        })
    }
}

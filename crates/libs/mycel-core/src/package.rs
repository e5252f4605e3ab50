use core::fmt;

use crate::buffer::{InputBuffer, OutputBuffer};
use crate::error::CoreError;
use crate::id::PeerId;
use crate::Wire;

/// Wire sync constant opening every package header.
pub const PACKAGE_SYNC: u32 = 0x4d59_4331;
/// Largest payload a single package may carry.
pub const MAX_PAYLOAD: usize = 1024;
/// Serialized header size, payload excluded.
pub const HEADER_LEN: usize = 40;

/// Reserved service ports. Everything at or below [`port::HIGHEST_META`]
/// is kernel metadata and excluded from useful-traffic accounting.
pub mod port {
    pub const ROUTING: u16 = 0;
    pub const TRACE: u16 = 1;
    pub const TRACE_REPLY: u16 = 2;
    pub const NEIGHBOURS: u16 = 3;
    pub const NEIGHBOURS_REPLY: u16 = 4;
    pub const SUBSCRIBE: u16 = 5;
    pub const UNSUBSCRIBE: u16 = 6;
    pub const PUSH_TUPLE: u16 = 7;
    pub const UDP_SPEED: u16 = 8;
    pub const DEAD_HOST: u16 = 9;
    pub const SET_REMOTE_TUPLE: u16 = 10;
    pub const TIMESYNC: u16 = 11;
    pub const QUERY_HOST: u16 = 12;
    pub const HOSTINFO: u16 = 13;
    pub const ACKNOWLEDGEMENTS: u16 = 14;
    pub const SET_APPEND_TUPLE: u16 = 15;
    pub const PUSH_APPENDED_TUPLE: u16 = 16;

    pub const HIGHEST_META: u16 = 19;
    pub const NPORTS: u16 = 256;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PackageFlags(pub u16);

impl PackageFlags {
    pub const REQUEST_ACK: PackageFlags = PackageFlags(1 << 0);
    pub const IS_ACK: PackageFlags = PackageFlags(1 << 1);
    pub const BULK: PackageFlags = PackageFlags(1 << 2);
    pub const HIPRI: PackageFlags = PackageFlags(1 << 3);

    pub fn contains(&self, other: PackageFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: PackageFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: PackageFlags) {
        self.0 &= !other.0;
    }
}

impl core::ops::BitOr for PackageFlags {
    type Output = PackageFlags;

    fn bitor(self, rhs: PackageFlags) -> PackageFlags {
        PackageFlags(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageType {
    /// Consumed by the neighbor, never forwarded.
    LinkLocal = 0,
    Broadcast = 1,
    Directed = 2,
}

impl PackageType {
    pub fn from_wire(value: u8) -> Result<Self, CoreError> {
        match value {
            0 => Ok(PackageType::LinkLocal),
            1 => Ok(PackageType::Broadcast),
            2 => Ok(PackageType::Directed),
            _ => Err(CoreError::Malformed),
        }
    }
}

/// One kernel message. `ack_id` equals `id` unless reliable delivery drew
/// an independent acknowledgement id for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Package {
    pub id: i32,
    pub link_cnt: u32,
    pub ack_id: i32,
    pub flags: PackageFlags,
    pub package_type: PackageType,
    pub hops: u8,
    pub source: PeerId,
    pub destination: PeerId,
    pub port: u16,
    pub seq_len: u16,
    pub seq_id: u16,
    pub seq_num: u16,
    pub payload: Vec<u8>,
}

impl Package {
    pub fn new(package_type: PackageType, source: PeerId, destination: PeerId) -> Self {
        Self {
            id: 0,
            link_cnt: 0,
            ack_id: 0,
            flags: PackageFlags::default(),
            package_type,
            hops: 0,
            source,
            destination,
            port: 0,
            seq_len: 0,
            seq_id: 0,
            seq_num: 0,
            payload: Vec::new(),
        }
    }

    pub fn wire_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }

    pub fn is_fragment(&self) -> bool {
        self.seq_len > 1
    }

    /// Queue priority implied by the flag word.
    pub fn is_bulk(&self) -> bool {
        self.flags.contains(PackageFlags::BULK)
    }

    pub fn is_hipri(&self) -> bool {
        self.flags.contains(PackageFlags::HIPRI)
    }

    pub fn wants_ack(&self) -> bool {
        self.flags.contains(PackageFlags::REQUEST_ACK)
    }

    pub fn is_ack(&self) -> bool {
        self.flags.contains(PackageFlags::IS_ACK)
    }
}

impl Wire for Package {
    fn serialize(&self, buffer: &mut OutputBuffer) -> Result<usize, CoreError> {
        if self.payload.len() > MAX_PAYLOAD {
            return Err(CoreError::InvalidArgument);
        }

        buffer.write_u32(PACKAGE_SYNC)?;
        buffer.write_i32(self.id)?;
        buffer.write_u32(self.link_cnt)?;
        buffer.write_i32(self.ack_id)?;
        buffer.write_u16(self.flags.0)?;
        buffer.write_byte(self.package_type as u8)?;
        buffer.write_byte(self.hops)?;
        self.source.serialize(buffer)?;
        self.destination.serialize(buffer)?;
        buffer.write_u16(self.port)?;
        buffer.write_u16(self.payload.len() as u16)?;
        buffer.write_u16(self.seq_len)?;
        buffer.write_u16(self.seq_id)?;
        buffer.write_u16(self.seq_num)?;
        buffer.write_u16(0)?; // padding
        buffer.write(&self.payload)?;

        Ok(buffer.offset())
    }

    fn deserialize(buffer: &mut InputBuffer) -> Result<Self, CoreError> {
        let sync = buffer.read_u32()?;
        if sync != PACKAGE_SYNC {
            return Err(CoreError::Malformed);
        }

        let id = buffer.read_i32()?;
        let link_cnt = buffer.read_u32()?;
        let ack_id = buffer.read_i32()?;
        let flags = PackageFlags(buffer.read_u16()?);
        let package_type = PackageType::from_wire(buffer.read_byte()?)?;
        let hops = buffer.read_byte()?;
        let source = PeerId::deserialize(buffer)?;
        let destination = PeerId::deserialize(buffer)?;
        let port = buffer.read_u16()?;
        let datalen = buffer.read_u16()? as usize;
        let seq_len = buffer.read_u16()?;
        let seq_id = buffer.read_u16()?;
        let seq_num = buffer.read_u16()?;
        let _padding = buffer.read_u16()?;

        if datalen > MAX_PAYLOAD {
            return Err(CoreError::Malformed);
        }

        let payload = buffer.read_slice(datalen)?.to_vec();

        Ok(Self {
            id,
            link_cnt,
            ack_id,
            flags,
            package_type,
            hops,
            source,
            destination,
            port,
            seq_len,
            seq_id,
            seq_num,
            payload,
        })
    }
}

impl fmt::Display for Package {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{:?} {}->{} port={} id={} hops={} len={}]",
            self.package_type,
            self.source,
            self.destination,
            self.port,
            self.id,
            self.hops,
            self.payload.len()
        )
    }
}

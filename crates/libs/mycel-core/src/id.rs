use core::fmt;

use serde::{Deserialize, Serialize};

use crate::buffer::{InputBuffer, OutputBuffer};
use crate::error::CoreError;

/// 32-bit peer identifier drawn at boot. `-1` addresses every peer.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct PeerId(pub i32);

impl PeerId {
    pub const BROADCAST: PeerId = PeerId(-1);

    pub fn is_broadcast(&self) -> bool {
        self.0 < 0
    }

    pub fn is_valid(&self) -> bool {
        self.0 >= 0
    }

    pub fn serialize(&self, buffer: &mut OutputBuffer) -> Result<usize, CoreError> {
        buffer.write_i32(self.0)
    }

    pub fn deserialize(buffer: &mut InputBuffer) -> Result<Self, CoreError> {
        Ok(PeerId(buffer.read_i32()?))
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_broadcast() {
            write!(f, "*")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Random per-incarnation nonce. A peer reappearing with the same id but a
/// different magic is a new incarnation, not the same host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Magic(pub u32);

impl Magic {
    pub fn serialize(&self, buffer: &mut OutputBuffer) -> Result<usize, CoreError> {
        buffer.write_u32(self.0)
    }

    pub fn deserialize(buffer: &mut InputBuffer) -> Result<Self, CoreError> {
        Ok(Magic(buffer.read_u32()?))
    }
}

impl fmt::Display for Magic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0.to_be_bytes()))
    }
}

pub const NETWORK_NAME_WIRE_LEN: usize = 64;

/// Overlay membership string. Peers on different networks refuse to link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkName(String);

impl NetworkName {
    pub fn new(name: &str) -> Self {
        let mut take = name.len().min(NETWORK_NAME_WIRE_LEN - 1);
        while take > 0 && !name.is_char_boundary(take) {
            take -= 1;
        }
        Self(name[..take].to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn serialize(&self, buffer: &mut OutputBuffer) -> Result<usize, CoreError> {
        buffer.write_padded(&self.0, NETWORK_NAME_WIRE_LEN)
    }

    pub fn deserialize(buffer: &mut InputBuffer) -> Result<Self, CoreError> {
        Ok(Self(buffer.read_padded(NETWORK_NAME_WIRE_LEN)?))
    }
}

impl Default for NetworkName {
    fn default() -> Self {
        Self::new("default")
    }
}

impl fmt::Display for NetworkName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_id_is_never_valid() {
        assert!(PeerId::BROADCAST.is_broadcast());
        assert!(!PeerId::BROADCAST.is_valid());
        assert!(PeerId(0).is_valid());
        assert!(PeerId(42).is_valid());
    }

    #[test]
    fn network_name_round_trips_through_fixed_field() {
        let name = NetworkName::new("field-trial");
        let mut raw = [0u8; NETWORK_NAME_WIRE_LEN];
        let mut out = OutputBuffer::new(&mut raw);
        name.serialize(&mut out).expect("serialize");

        let mut input = InputBuffer::new(out.as_slice());
        assert_eq!(NetworkName::deserialize(&mut input).expect("deserialize"), name);
    }

    #[test]
    fn overlong_network_name_is_clamped() {
        let long = "n".repeat(200);
        let name = NetworkName::new(&long);
        assert_eq!(name.as_str().len(), NETWORK_NAME_WIRE_LEN - 1);
    }
}

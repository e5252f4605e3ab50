use core::fmt;

use mycel_core::{CoreError, InputBuffer, OutputBuffer, PeerId, Timestamp, Wire};

use crate::error::TupleError;

/// Mimetype marking a tuple whose value names another tuple.
pub const META_MIMETYPE: &str = "x-mycel/metatuple";

const MAX_KEY_LEN: usize = 256;
const MAX_MIMETYPE_LEN: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TupleEncoding {
    Plain = 0,
    Binary = 1,
}

impl TupleEncoding {
    pub fn from_wire(value: u8) -> Result<Self, CoreError> {
        match value {
            0 => Ok(TupleEncoding::Plain),
            1 => Ok(TupleEncoding::Binary),
            _ => Err(CoreError::Malformed),
        }
    }
}

/// Dot-separated key match with `*` wildcard segments. Patterns and keys
/// must agree on segment count; each `*` matches any one segment.
pub fn key_matches(pattern: &str, key: &str) -> bool {
    let mut pattern_segments = pattern.split('.');
    let mut key_segments = key.split('.');

    loop {
        match (pattern_segments.next(), key_segments.next()) {
            (None, None) => return true,
            (Some(p), Some(k)) => {
                if p != "*" && p != k {
                    return false;
                }
            }
            _ => return false,
        }
    }
}

pub fn validate_key(key: &str) -> Result<(), TupleError> {
    if key.is_empty() || key.len() > MAX_KEY_LEN {
        return Err(TupleError::BadKey);
    }
    if key.split('.').any(|segment| segment.is_empty()) {
        return Err(TupleError::BadKey);
    }
    Ok(())
}

/// A named, typed binary value owned by one peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tuple {
    pub owner: PeerId,
    pub key: String,
    pub data: Vec<u8>,
    pub mimetype: String,
    pub encoding: TupleEncoding,
    /// Stamped by the owner's network clock when the value was written.
    pub ts_write: Timestamp,
    /// Caller-provided timestamp, carried verbatim.
    pub ts_user: Timestamp,
    /// After this instant the tuple is invisible; ZERO means never.
    pub ts_expire: Timestamp,
    /// Owner-side version counter; newer versions replace older ones.
    pub seq: u32,
}

impl Tuple {
    pub fn new(owner: PeerId, key: &str, data: Vec<u8>) -> Self {
        Self {
            owner,
            key: key.to_string(),
            data,
            mimetype: "text/plain".to_string(),
            encoding: TupleEncoding::Plain,
            ts_write: Timestamp::ZERO,
            ts_user: Timestamp::ZERO,
            ts_expire: Timestamp::ZERO,
            seq: 0,
        }
    }

    /// Builds a metatuple pointing at `(real_owner, real_key)`.
    pub fn meta(owner: PeerId, key: &str, real_owner: PeerId, real_key: &str) -> Self {
        let mut tuple =
            Tuple::new(owner, key, format!("{} {}", real_owner.0, real_key).into_bytes());
        tuple.mimetype = META_MIMETYPE.to_string();
        tuple
    }

    pub fn is_meta(&self) -> bool {
        self.mimetype == META_MIMETYPE
    }

    /// The `(real_owner, real_key)` a metatuple designates.
    pub fn meta_target(&self) -> Result<(PeerId, String), TupleError> {
        if !self.is_meta() {
            return Err(TupleError::NotMeta);
        }
        let text = core::str::from_utf8(&self.data).map_err(|_| TupleError::BadKey)?;
        let (owner, key) = text.split_once(' ').ok_or(TupleError::BadKey)?;
        let owner = owner.parse::<i32>().map_err(|_| TupleError::BadKey)?;
        validate_key(key)?;
        Ok((PeerId(owner), key.to_string()))
    }

    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.ts_expire != Timestamp::ZERO && now > self.ts_expire
    }

    fn write_timestamp(
        ts: Timestamp,
        buffer: &mut OutputBuffer,
    ) -> Result<usize, CoreError> {
        buffer.write_i64(ts.secs())?;
        buffer.write_u32(ts.subsec_micros())
    }

    fn read_timestamp(buffer: &mut InputBuffer) -> Result<Timestamp, CoreError> {
        let secs = buffer.read_i64()?;
        let micros = buffer.read_u32()?;
        Ok(Timestamp::from_parts(secs, micros))
    }
}

impl Wire for Tuple {
    fn serialize(&self, buffer: &mut OutputBuffer) -> Result<usize, CoreError> {
        if self.key.len() > MAX_KEY_LEN || self.mimetype.len() > MAX_MIMETYPE_LEN {
            return Err(CoreError::InvalidArgument);
        }

        self.owner.serialize(buffer)?;
        buffer.write_u16(self.key.len() as u16)?;
        buffer.write(self.key.as_bytes())?;
        buffer.write_u16(self.mimetype.len() as u16)?;
        buffer.write(self.mimetype.as_bytes())?;
        buffer.write_byte(self.encoding as u8)?;
        Self::write_timestamp(self.ts_write, buffer)?;
        Self::write_timestamp(self.ts_user, buffer)?;
        Self::write_timestamp(self.ts_expire, buffer)?;
        buffer.write_u32(self.seq)?;
        buffer.write_u32(self.data.len() as u32)?;
        buffer.write(&self.data)?;
        Ok(buffer.offset())
    }

    fn deserialize(buffer: &mut InputBuffer) -> Result<Self, CoreError> {
        let owner = PeerId::deserialize(buffer)?;

        let key_len = buffer.read_u16()? as usize;
        if key_len > MAX_KEY_LEN {
            return Err(CoreError::Malformed);
        }
        let key = String::from_utf8_lossy(buffer.read_slice(key_len)?).into_owned();

        let mimetype_len = buffer.read_u16()? as usize;
        if mimetype_len > MAX_MIMETYPE_LEN {
            return Err(CoreError::Malformed);
        }
        let mimetype = String::from_utf8_lossy(buffer.read_slice(mimetype_len)?).into_owned();

        let encoding = TupleEncoding::from_wire(buffer.read_byte()?)?;
        let ts_write = Self::read_timestamp(buffer)?;
        let ts_user = Self::read_timestamp(buffer)?;
        let ts_expire = Self::read_timestamp(buffer)?;
        let seq = buffer.read_u32()?;

        let data_len = buffer.read_u32()? as usize;
        if data_len > buffer.bytes_left() {
            return Err(CoreError::Malformed);
        }
        let data = buffer.read_slice(data_len)?.to_vec();

        Ok(Self { owner, key, data, mimetype, encoding, ts_write, ts_user, ts_expire, seq })
    }
}

impl fmt::Display for Tuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} ({} bytes, v{})", self.owner, self.key, self.data.len(), self.seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_segments_match_one_position() {
        assert!(key_matches("robot.*.pose", "robot.arm.pose"));
        assert!(key_matches("*", "anything"));
        assert!(!key_matches("robot.*.pose", "robot.arm.grip"));
        assert!(!key_matches("robot.*", "robot.arm.pose"));
        assert!(!key_matches("robot.arm.pose", "robot.arm"));
        assert!(key_matches("a.b", "a.b"));
    }

    #[test]
    fn tuple_round_trips_every_field() {
        let mut tuple = Tuple::new(PeerId(9), "sensor.temp", b"21.5".to_vec());
        tuple.mimetype = "text/plain".to_string();
        tuple.ts_write = Timestamp::from_parts(100, 5);
        tuple.ts_user = Timestamp::from_parts(90, 1);
        tuple.ts_expire = Timestamp::from_parts(200, 0);
        tuple.seq = 7;

        let bytes = tuple.to_bytes().expect("serialize");
        assert_eq!(Tuple::from_bytes(&bytes).expect("deserialize"), tuple);
    }

    #[test]
    fn metatuple_target_parses() {
        let meta = Tuple::meta(PeerId(1), "alias.pose", PeerId(42), "robot.arm.pose");
        assert!(meta.is_meta());
        let (owner, key) = meta.meta_target().expect("target");
        assert_eq!(owner, PeerId(42));
        assert_eq!(key, "robot.arm.pose");

        let plain = Tuple::new(PeerId(1), "x", vec![]);
        assert_eq!(plain.meta_target().err(), Some(TupleError::NotMeta));
    }

    #[test]
    fn expiry_is_honoured() {
        let mut tuple = Tuple::new(PeerId(1), "x", vec![]);
        assert!(!tuple.is_expired(Timestamp::from_parts(1_000, 0)));
        tuple.ts_expire = Timestamp::from_parts(500, 0);
        assert!(tuple.is_expired(Timestamp::from_parts(1_000, 0)));
        assert!(!tuple.is_expired(Timestamp::from_parts(400, 0)));
    }

    #[test]
    fn malformed_keys_are_rejected() {
        assert!(validate_key("a.b.c").is_ok());
        assert!(validate_key("").is_err());
        assert!(validate_key("a..b").is_err());
        assert!(validate_key(&"k".repeat(300)).is_err());
    }
}

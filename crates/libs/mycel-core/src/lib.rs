pub mod buffer;
pub mod clock;
pub mod error;
pub mod hostinfo;
pub mod id;
pub mod package;
pub mod url;

pub use buffer::{InputBuffer, OutputBuffer};
pub use clock::{Clock, Timestamp};
pub use error::CoreError;
pub use hostinfo::{AddrFamily, HostInfo, LowLevelAddress};
pub use id::{Magic, NetworkName, PeerId};
pub use package::{Package, PackageFlags, PackageType};
pub use url::LinkUrl;

/// Field-walking wire codec. Every multi-byte field crosses the wire in
/// network byte order; in-memory representation stays in host order.
pub trait Wire: Sized {
    fn serialize(&self, buffer: &mut OutputBuffer) -> Result<usize, CoreError>;
    fn deserialize(buffer: &mut InputBuffer) -> Result<Self, CoreError>;

    fn to_bytes(&self) -> Result<Vec<u8>, CoreError> {
        // Values vary from fixed headers to multi-KiB tuple payloads; grow
        // the scratch buffer instead of guessing a single size.
        let mut capacity = 4096;
        loop {
            let mut raw = vec![0u8; capacity];
            let mut out = OutputBuffer::new(&mut raw);
            match self.serialize(&mut out) {
                Ok(len) => {
                    raw.truncate(len);
                    return Ok(raw);
                }
                Err(CoreError::OutOfSpace) if capacity < (1 << 24) => capacity *= 4,
                Err(err) => return Err(err),
            }
        }
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, CoreError> {
        Self::deserialize(&mut InputBuffer::new(bytes))
    }
}

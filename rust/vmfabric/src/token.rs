//! Transferable tokens for shareable allocations.

use bincode::{Decode, Encode};
use vmfabric_common::{Result, error::Error};

use crate::handles::DeviceOrdinal;

/// Names the physical memory behind a shareable handle. Two tokens with equal
/// identities refer to the same memory, whichever process produced them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Encode, Decode)]
pub struct MemoryIdentity {
    pub dev: u64,
    pub ino: u64,
}

/// A capability for a physical allocation, produced by exporting it and redeemed
/// by importing it.
///
/// The token names a POSIX file descriptor open in `owner_pid`. It carries no
/// ownership: it stays redeemable only while the exporting allocation handle is
/// alive in the owner process. Move it between processes as raw bytes
/// ([`to_bytes`](Self::to_bytes)) through any channel, or pass the descriptor
/// itself with [`crate::transport`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Encode, Decode)]
pub struct TransferableToken {
    pub owner_pid: u32,
    pub fd: i32,
    pub size: u64,
    pub device: DeviceOrdinal,
    pub identity: MemoryIdentity,
}

impl TransferableToken {
    /// Returns `true` if both tokens refer to the same physical memory.
    pub fn same_memory(&self, other: &TransferableToken) -> bool {
        self.identity == other.identity
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::encode_to_vec(self, Self::binc_config())
            .map_err(|e| Error::invalid_operation(format!("encode token: {e}")))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<TransferableToken> {
        let (token, read) = bincode::decode_from_slice(bytes, Self::binc_config())
            .map_err(|e| Error::invalid_arg("token", e.to_string()))?;
        if read != bytes.len() {
            return Err(Error::invalid_arg("token", "trailing bytes after token"));
        }
        Ok(token)
    }

    /// Size of the encoded form, which is fixed.
    pub const ENCODED_LEN: usize = 4 + 4 + 8 + 4 + 8 + 8;

    fn binc_config() -> impl bincode::config::Config {
        bincode::config::standard().with_fixed_int_encoding()
    }
}

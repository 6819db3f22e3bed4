use bincode::{Decode, Encode};
use vmfabric::TransferableToken;
use vmfabric_common::{Result, error::Error};

/// Describes one rank's flag buffer to its peers.
///
/// Produced by [`MultiDeviceBarrier::buffer_handle`](crate::MultiDeviceBarrier::buffer_handle)
/// and handed back, one per rank and ordered by rank, to
/// [`set_peer_buffer_handles`](crate::MultiDeviceBarrier::set_peer_buffer_handles).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub struct BufferDescriptor {
    pub rank: u32,
    pub num_ranks: u32,
    pub token: TransferableToken,
}

impl BufferDescriptor {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::encode_to_vec(self, Self::binc_config())
            .map_err(|e| Error::invalid_operation(format!("encode descriptor: {e}")))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<BufferDescriptor> {
        let (descriptor, read) = bincode::decode_from_slice(bytes, Self::binc_config())
            .map_err(|e| Error::invalid_arg("descriptor", e.to_string()))?;
        if read != bytes.len() {
            return Err(Error::invalid_arg(
                "descriptor",
                "trailing bytes after descriptor",
            ));
        }
        Ok(descriptor)
    }

    pub const ENCODED_LEN: usize = 4 + 4 + TransferableToken::ENCODED_LEN;

    fn binc_config() -> impl bincode::config::Config {
        bincode::config::standard().with_fixed_int_encoding()
    }
}

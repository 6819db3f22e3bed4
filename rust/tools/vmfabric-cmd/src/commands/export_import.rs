//! Export-import command implementation

use anyhow::{Context, Result};
use vmfabric::{DeviceOrdinal, TransferableToken};

use crate::{
    commands::{CmdConfig, size_or_granule},
    utils::format_size,
};

pub fn run(config: &CmdConfig, device: u32, peer_device: u32, alloc_size: Option<u64>) -> Result<()> {
    let fabric = config.fabric()?;
    let device = DeviceOrdinal::new(device);
    let peer_device = DeviceOrdinal::new(peer_device);
    let size = size_or_granule(&fabric, device, alloc_size)?;

    let source = fabric
        .allocate_range(device, size)
        .with_context(|| format!("Failed to allocate {} on {device}", format_size(size as u64)))?;
    let mut pattern = vec![0u8; size];
    fastrand::fill(&mut pattern);
    unsafe { std::ptr::copy_nonoverlapping(pattern.as_ptr(), source.as_ptr::<u8>(), size) };

    let token_bytes = source.export()?.to_bytes()?;
    log::debug!("token: {} bytes", token_bytes.len());
    let token = TransferableToken::from_bytes(&token_bytes)?;
    let peer = fabric
        .import_range(peer_device, &token)
        .with_context(|| format!("Failed to import the allocation on {peer_device}"))?;

    let imported = unsafe { std::slice::from_raw_parts(peer.as_ptr::<u8>(), size) };
    if let Some(offset) = pattern.iter().zip(imported).position(|(a, b)| a != b) {
        anyhow::bail!("Imported memory differs at byte {offset}");
    }

    // Writes through the peer mapping are visible at the source.
    let marker = !pattern[0];
    unsafe {
        peer.as_ptr::<u8>().write_volatile(marker);
        anyhow::ensure!(
            source.as_ptr::<u8>().read_volatile() == marker,
            "A write through the peer mapping is not visible at the source"
        );
    }
    println!(
        "Shared {} from {device} (at {}) with {peer_device} (at {}), contents match",
        format_size(size as u64),
        source.address(),
        peer.address()
    );
    peer.close()?;
    source.close()?;
    Ok(())
}

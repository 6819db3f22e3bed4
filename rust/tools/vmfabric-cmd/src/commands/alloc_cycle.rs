//! Alloc-cycle command implementation

use anyhow::{Context, Result};
use vmfabric::{DeviceOrdinal, VirtualMemoryFabric};

use crate::{
    commands::{CmdConfig, size_or_granule},
    utils::format_size,
};

/// Reports how much free device memory each step consumed (positive) or
/// returned (negative).
fn step(fabric: &VirtualMemoryFabric, device: DeviceOrdinal, label: &str, before: u64) -> Result<u64> {
    let after = fabric.memory_info(device)?.free;
    let delta = before as i128 - after as i128;
    let sign = if delta < 0 { "-" } else { "" };
    println!(
        "{label:<12} free {:>12}  delta {sign}{}",
        format_size(after),
        format_size(delta.unsigned_abs() as u64)
    );
    Ok(after)
}

pub fn run(
    config: &CmdConfig,
    device: u32,
    virtual_size: u64,
    alloc_size: Option<u64>,
    cycles: u32,
) -> Result<()> {
    let fabric = config.fabric()?;
    let device = DeviceOrdinal::new(device);
    let virtual_size =
        usize::try_from(virtual_size).context("Size does not fit the address space")?;
    let alloc_size = size_or_granule(&fabric, device, alloc_size)?;

    let initial = fabric.memory_info(device)?.free;
    let reservation = fabric
        .reserve_scoped(device, virtual_size)
        .with_context(|| format!("Failed to reserve {}", format_size(virtual_size as u64)))?;
    let mut free = step(&fabric, device, "reserve", initial)?;

    for cycle in 0..cycles {
        let handle = fabric
            .allocate(device, reservation.address(), alloc_size)
            .with_context(|| format!("Cycle {cycle}: failed to allocate {}", format_size(alloc_size as u64)))?;
        free = step(&fabric, device, "allocate", free)?;
        fabric
            .deallocate(reservation.address(), handle, alloc_size)
            .with_context(|| format!("Cycle {cycle}: failed to deallocate {handle}"))?;
        free = step(&fabric, device, "deallocate", free)?;
    }

    reservation.close()?;
    step(&fabric, device, "release", free)?;
    let leaked = initial.saturating_sub(fabric.memory_info(device)?.free);
    anyhow::ensure!(leaked == 0, "{} of device memory was not returned", format_size(leaked));
    Ok(())
}

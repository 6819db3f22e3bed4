//! Barrier command implementation

use std::{
    thread,
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use vmfabric::{BackedRange, DeviceOrdinal, VirtualMemoryFabric};
use vmfabric_barrier::{BufferDescriptor, MAX_RANKS, MultiDeviceBarrier};

use crate::{commands::CmdConfig, utils::format_size};

pub fn run(
    config: &CmdConfig,
    ranks: usize,
    iterations: u64,
    rounds: u32,
    work_bytes: u64,
) -> Result<()> {
    anyhow::ensure!(
        (1..=MAX_RANKS).contains(&ranks),
        "--ranks must be between 1 and {MAX_RANKS}"
    );
    let fabric = config.fabric()?;
    let work_bytes = usize::try_from(work_bytes).context("Size does not fit the address space")?;

    for round in 0..rounds {
        let start = Instant::now();
        let barriers = setup(config, &fabric, ranks)?;
        // Work memory is allocated up front: a rank failing inside its loop
        // would leave the others waiting forever.
        let work = barriers
            .iter()
            .map(|barrier| work_memory(&fabric, barrier.device(), work_bytes))
            .collect::<Result<Vec<_>>>()?;
        let setup_time = start.elapsed();

        let start = Instant::now();
        thread::scope(|s| -> Result<()> {
            let workers: Vec<_> = barriers
                .into_iter()
                .zip(work)
                .map(|(barrier, work)| s.spawn(move || episodes(barrier, work, iterations)))
                .collect();
            for worker in workers {
                worker
                    .join()
                    .map_err(|_| anyhow::anyhow!("A rank thread panicked"))??;
            }
            Ok(())
        })?;
        let elapsed = start.elapsed();

        println!(
            "Round {round}: {ranks} ranks, {iterations} episodes in {elapsed:.3?} \
             ({:.2?} per episode, setup {setup_time:.3?})",
            per_episode(elapsed, iterations)
        );
    }
    Ok(())
}

fn per_episode(elapsed: Duration, iterations: u64) -> Duration {
    elapsed.div_f64(iterations.max(1) as f64)
}

/// Constructs one barrier per rank and exchanges the flag buffers, passing the
/// descriptors through their byte form.
fn setup(
    config: &CmdConfig,
    fabric: &VirtualMemoryFabric,
    ranks: usize,
) -> Result<Vec<MultiDeviceBarrier>> {
    let devices = fabric.device_count();
    let mut barriers = (0..ranks)
        .map(|rank| {
            let device = DeviceOrdinal::new((rank % devices) as u32);
            MultiDeviceBarrier::with_options(fabric.clone(), device, rank, ranks, config.wait.clone())
                .with_context(|| format!("Failed to construct the barrier for rank {rank}"))
        })
        .collect::<Result<Vec<_>>>()?;

    let gathered = barriers
        .iter_mut()
        .map(|barrier| -> Result<Vec<u8>> { Ok(barrier.buffer_handle()?.to_bytes()?) })
        .collect::<Result<Vec<_>>>()?;
    let descriptors = gathered
        .iter()
        .map(|bytes| BufferDescriptor::from_bytes(bytes))
        .collect::<vmfabric_common::Result<Vec<_>>>()?;

    for barrier in &mut barriers {
        barrier
            .set_peer_buffer_handles(&descriptors)
            .with_context(|| format!("Rank {} failed to import its peers", barrier.rank()))?;
    }
    Ok(barriers)
}

fn work_memory(
    fabric: &VirtualMemoryFabric,
    device: DeviceOrdinal,
    work_bytes: usize,
) -> Result<Option<BackedRange>> {
    if work_bytes == 0 {
        return Ok(None);
    }
    let size = work_bytes.next_multiple_of(fabric.granularity(device)?);
    let range = fabric
        .allocate_range(device, size)
        .with_context(|| format!("Failed to allocate {} of work memory on {device}", format_size(size as u64)))?;
    Ok(Some(range))
}

/// One rank's loop: touch a random amount of device memory, then wait for the
/// other ranks.
fn episodes(
    mut barrier: MultiDeviceBarrier,
    work: Option<BackedRange>,
    iterations: u64,
) -> Result<()> {
    let mut rng = fastrand::Rng::with_seed(barrier.rank() as u64);
    for iteration in 0..iterations {
        if let Some(work) = &work {
            let values = unsafe {
                std::slice::from_raw_parts_mut(work.as_ptr::<f32>(), work.size() / size_of::<f32>())
            };
            let len = rng.usize(..=values.len());
            for value in &mut values[..len] {
                *value = rng.f32();
            }
            for value in &mut values[..len] {
                *value += *value;
            }
        }
        barrier.run()?;
        if barrier.rank() == 0 && (iteration + 1) % 100 == 0 {
            log::info!("completed episode {}", iteration + 1);
        }
    }
    Ok(())
}

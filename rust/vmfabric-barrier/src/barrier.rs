use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

use vmfabric::{BackedRange, DeviceOrdinal, TransferableToken, VirtualAddress, VirtualMemoryFabric};
use vmfabric_common::{Result, error::Error, verify_arg};

use crate::{MAX_RANKS, descriptor::BufferDescriptor, wait::WaitPolicy};

const SLOT_SIZE: usize = size_of::<u64>();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierState {
    /// The flag buffer exists but has not been exported.
    Created,
    /// The descriptor was handed out; waiting for the peer descriptors.
    HandleExported,
    /// Every peer buffer is mapped.
    PeersImported,
    /// The peer table is complete and episodes may run.
    Ready,
}

impl fmt::Display for BarrierState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BarrierState::Created => "Created",
            BarrierState::HandleExported => "HandleExported",
            BarrierState::PeersImported => "PeersImported",
            BarrierState::Ready => "Ready",
        };
        f.write_str(name)
    }
}

/// Where a rank's flag is visible from this instance.
struct PeerSlot {
    flag: *const AtomicU64,
    /// Local mapping of the peer's buffer; `None` for the own slot, which lives in
    /// the local flag buffer.
    _buffer: Option<BackedRange>,
}

impl PeerSlot {
    fn flag(&self) -> &AtomicU64 {
        // The pointer targets a mapped slot of a buffer owned by this instance
        // (`_buffer` or the barrier's own flag buffer).
        unsafe { &*self.flag }
    }
}

/// One rank's view of a barrier shared by `num_ranks` ranks.
///
/// Rank `r` owns a flag buffer with one `u64` slot per rank and only ever writes
/// slot `r` of it. Peers map that buffer and read the slot. Setup runs once:
///
/// 1. every rank constructs its instance and exports [`buffer_handle`](Self::buffer_handle);
/// 2. a coordinator collects the descriptors, ordered by rank, and hands the full
///    sequence to [`set_peer_buffer_handles`](Self::set_peer_buffer_handles) on every rank;
/// 3. ranks call [`run`](Self::run) once per episode.
///
/// `run` blocks the calling thread until all ranks have arrived. A rank that
/// never arrives blocks its peers indefinitely.
pub struct MultiDeviceBarrier {
    fabric: VirtualMemoryFabric,
    rank: usize,
    num_ranks: usize,
    policy: WaitPolicy,
    state: BarrierState,
    generation: u64,
    exported: Option<TransferableToken>,
    // Peer mappings go before the local flag buffer.
    peers: [Option<PeerSlot>; MAX_RANKS],
    flag: BackedRange,
}

// The raw slot pointers refer to memory owned by the instance and are only used
// for atomic access.
unsafe impl Send for MultiDeviceBarrier {}
unsafe impl Sync for MultiDeviceBarrier {}

impl MultiDeviceBarrier {
    pub fn new(
        fabric: VirtualMemoryFabric,
        device: DeviceOrdinal,
        rank: usize,
        num_ranks: usize,
    ) -> Result<MultiDeviceBarrier> {
        Self::with_options(fabric, device, rank, num_ranks, WaitPolicy::default())
    }

    /// Allocates a zeroed flag buffer on `device` for rank `rank` of `num_ranks`.
    pub fn with_options(
        fabric: VirtualMemoryFabric,
        device: DeviceOrdinal,
        rank: usize,
        num_ranks: usize,
        policy: WaitPolicy,
    ) -> Result<MultiDeviceBarrier> {
        verify_arg!(num_ranks, num_ranks >= 1);
        verify_arg!(num_ranks, num_ranks <= MAX_RANKS);
        verify_arg!(rank, rank < num_ranks);

        let granularity = fabric.granularity(device)?;
        let size = (num_ranks * SLOT_SIZE).next_multiple_of(granularity);
        let flag = fabric.allocate_range(device, size)?;
        let base = flag.as_ptr::<AtomicU64>();
        for slot in 0..num_ranks {
            unsafe { (*base.add(slot)).store(0, Ordering::Relaxed) };
        }
        log::debug!(
            "barrier rank {rank}/{num_ranks}: flag buffer at {} on {device}",
            flag.address()
        );
        Ok(MultiDeviceBarrier {
            fabric,
            rank,
            num_ranks,
            policy,
            state: BarrierState::Created,
            generation: 0,
            exported: None,
            peers: Default::default(),
            flag,
        })
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn num_ranks(&self) -> usize {
        self.num_ranks
    }

    pub fn device(&self) -> DeviceOrdinal {
        self.flag.device()
    }

    pub fn state(&self) -> BarrierState {
        self.state
    }

    /// Number of completed episodes.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn policy(&self) -> &WaitPolicy {
        &self.policy
    }

    /// Address of the local flag buffer. Slot `rank()` holds this rank's
    /// generation.
    pub fn flag_address(&self) -> VirtualAddress {
        self.flag.address()
    }

    /// The generation `rank` has published, as seen through the peer table.
    /// `None` until the table is populated, or for a rank out of range.
    pub fn peer_flag(&self, rank: usize) -> Option<u64> {
        self.peers
            .get(rank)?
            .as_ref()
            .map(|slot| slot.flag().load(Ordering::Acquire))
    }

    /// Exports the flag buffer for redistribution to the other ranks. May be
    /// called again in later states; it returns the same descriptor.
    pub fn buffer_handle(&mut self) -> Result<BufferDescriptor> {
        let token = match self.exported {
            Some(token) => token,
            None => {
                let token = self.flag.export()?;
                self.exported = Some(token);
                self.state = BarrierState::HandleExported;
                token
            }
        };
        Ok(BufferDescriptor {
            rank: self.rank as u32,
            num_ranks: self.num_ranks as u32,
            token,
        })
    }

    /// Imports the flag buffers of all ranks, `descriptors[r]` being rank `r`'s.
    ///
    /// The whole sequence is validated first. On any failure the instance is left
    /// as it was, with no peer buffer mapped.
    pub fn set_peer_buffer_handles(&mut self, descriptors: &[BufferDescriptor]) -> Result<()> {
        match self.state {
            BarrierState::Created => {
                return Err(Error::not_ready(
                    "set_peer_buffer_handles",
                    self.state.to_string(),
                ));
            }
            BarrierState::HandleExported => (),
            BarrierState::PeersImported | BarrierState::Ready => {
                return Err(Error::invalid_operation(
                    "set_peer_buffer_handles: peers are already set up",
                ));
            }
        }
        self.validate_descriptors(descriptors)?;

        let device = self.device();
        let mut peers: [Option<PeerSlot>; MAX_RANKS] = Default::default();
        for (rank, descriptor) in descriptors.iter().enumerate() {
            let slot = if rank == self.rank {
                PeerSlot {
                    flag: self.slot_ptr(&self.flag, rank),
                    _buffer: None,
                }
            } else {
                let buffer = self.fabric.import_range(device, &descriptor.token)?;
                PeerSlot {
                    flag: self.slot_ptr(&buffer, rank),
                    _buffer: Some(buffer),
                }
            };
            peers[rank] = Some(slot);
        }
        self.peers = peers;
        self.state = BarrierState::PeersImported;

        if self.peers[..self.num_ranks].iter().all(Option::is_some) {
            self.state = BarrierState::Ready;
        }
        log::debug!(
            "barrier rank {}/{}: {} peer buffer(s) mapped on {device}",
            self.rank,
            self.num_ranks,
            self.num_ranks - 1
        );
        Ok(())
    }

    /// Runs one episode: advances the local generation, publishes it and waits
    /// until every rank has published at least the same generation.
    ///
    /// Writes made by any rank before its call happen-before everything that
    /// follows the return on every other rank.
    pub fn run(&mut self) -> Result<()> {
        if self.state != BarrierState::Ready {
            return Err(Error::not_ready("run", self.state.to_string()));
        }
        self.generation += 1;
        let generation = self.generation;
        self.own_flag().store(generation, Ordering::Release);

        for slot in self.peers.iter().flatten() {
            let flag = slot.flag();
            let mut backoff = self.policy.backoff();
            while flag.load(Ordering::Acquire) < generation {
                backoff.snooze();
            }
        }
        log::trace!("barrier rank {}: passed generation {generation}", self.rank);
        Ok(())
    }

    fn validate_descriptors(&self, descriptors: &[BufferDescriptor]) -> Result<()> {
        verify_arg!(descriptors, descriptors.len() == self.num_ranks);
        let min_size = (self.num_ranks * SLOT_SIZE) as u64;
        for (rank, descriptor) in descriptors.iter().enumerate() {
            if descriptor.rank as usize != rank {
                return Err(Error::invalid_arg(
                    "descriptors",
                    format!("entry {rank} describes rank {}", descriptor.rank),
                ));
            }
            if descriptor.num_ranks as usize != self.num_ranks {
                return Err(Error::invalid_arg(
                    "descriptors",
                    format!(
                        "entry {rank} is for {} ranks, expected {}",
                        descriptor.num_ranks, self.num_ranks
                    ),
                ));
            }
            if descriptor.token.size < min_size {
                return Err(Error::invalid_arg(
                    "descriptors",
                    format!(
                        "entry {rank} buffer of {} bytes cannot hold {} flags",
                        descriptor.token.size, self.num_ranks
                    ),
                ));
            }
        }
        let own = &descriptors[self.rank].token;
        if !self.exported.is_some_and(|token| token.same_memory(own)) {
            return Err(Error::invalid_arg(
                "descriptors",
                format!("entry {} does not describe this rank's buffer", self.rank),
            ));
        }
        Ok(())
    }

    fn slot_ptr(&self, buffer: &BackedRange, rank: usize) -> *const AtomicU64 {
        debug_assert!(rank < self.num_ranks && buffer.size() >= self.num_ranks * SLOT_SIZE);
        unsafe { buffer.as_ptr::<AtomicU64>().add(rank) }
    }

    fn own_flag(&self) -> &AtomicU64 {
        unsafe { &*self.slot_ptr(&self.flag, self.rank) }
    }
}

impl fmt::Debug for MultiDeviceBarrier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiDeviceBarrier")
            .field("rank", &self.rank)
            .field("num_ranks", &self.num_ranks)
            .field("device", &self.device())
            .field("state", &self.state)
            .field("generation", &self.generation)
            .field("flag", &self.flag.address())
            .finish_non_exhaustive()
    }
}

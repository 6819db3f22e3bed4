//! A [`DeviceDriver`] that emulates devices on host memory.
//!
//! Each emulated device has its own memory budget and reports the configured
//! granularity. The OS objects standing in for driver resources:
//!
//! - reservation: an inaccessible `MAP_NORESERVE` span ([`ReservedRegion`]);
//! - physical allocation: a `memfd` object ([`SharedMemory`]), charged to the
//!   device budget;
//! - mapping: a `MAP_SHARED | MAP_FIXED` mapping of the memfd over part of a
//!   reservation, made accessible by `mem_set_access`;
//! - transferable token: the memfd descriptor number plus the owning pid.
//!
//! Since the pages are ordinary shared memory, every process that imports a token
//! sees the same bytes, and host threads can read and write mapped device memory
//! directly.

use std::{
    collections::{BTreeMap, btree_map, hash_map},
    ffi::CString,
    sync::{
        Mutex,
        atomic::{AtomicU64, Ordering},
    },
};

use vmfabric_common::{Result, error::Error};
use vmfabric_page_alloc::{
    ObjectIdentity, Protection, region::ReservedRegion, shared_memory::SharedMemory,
};

use crate::{
    budget::{Budget, Charge},
    driver::{DeviceDriver, MemoryInfo},
    handles::{AllocationHandle, DeviceOrdinal, VirtualAddress},
    token::{MemoryIdentity, TransferableToken},
};

mod options;

pub use options::HostDriverOptions;

pub struct HostDriver {
    options: HostDriverOptions,
    budgets: Vec<Budget>,
    next_handle: AtomicU64,
    state: Mutex<HostState>,
}

#[derive(Default)]
struct HostState {
    /// Reservations keyed by base address.
    reservations: BTreeMap<u64, Reservation>,
    allocations: ahash::HashMap<u64, Allocation>,
    backings: Backings,
}

/// Reference counts of the physical objects behind handles and mappings. An
/// object's budget charge is returned when its count drops to zero.
#[derive(Default)]
struct Backings(ahash::HashMap<ObjectIdentity, Backing>);

struct Reservation {
    device: DeviceOrdinal,
    region: ReservedRegion,
    /// Mappings keyed by offset into the region.
    mappings: BTreeMap<usize, Mapping>,
}

struct Mapping {
    len: usize,
    identity: ObjectIdentity,
    access: Option<DeviceOrdinal>,
}

struct Allocation {
    device: DeviceOrdinal,
    memory: SharedMemory,
    imported: bool,
}

struct Backing {
    refs: usize,
    /// Budget charge of a locally created object; `None` for memory imported from
    /// another process.
    _charge: Option<Charge>,
}

impl HostDriver {
    pub fn new(options: HostDriverOptions) -> Result<HostDriver> {
        options.validate()?;
        let budgets = (0..options.device_count)
            .map(|_| Budget::new(options.device_memory))
            .collect();
        log::debug!(
            "host driver: {} devices, granularity {}, {} bytes each",
            options.device_count,
            options.granularity,
            options.device_memory
        );
        Ok(HostDriver {
            options,
            budgets,
            next_handle: AtomicU64::new(1),
            state: Mutex::new(HostState::default()),
        })
    }

    pub fn options(&self) -> &HostDriverOptions {
        &self.options
    }

    /// Number of live reservations, allocation handles and mappings.
    pub fn resource_counts(&self) -> (usize, usize, usize) {
        let state = self.state.lock().unwrap();
        let mappings = state
            .reservations
            .values()
            .map(|r| r.mappings.len())
            .sum();
        (state.reservations.len(), state.allocations.len(), mappings)
    }

    fn check_device(&self, op: &str, device: DeviceOrdinal) -> Result<()> {
        if device.index() < self.options.device_count {
            Ok(())
        } else {
            Err(Error::driver(op, format!("invalid {device}")))
        }
    }

    fn check_size(&self, op: &str, size: usize) -> Result<()> {
        if size != 0 && size.is_multiple_of(self.options.granularity) {
            Ok(())
        } else {
            Err(Error::driver(
                op,
                format!(
                    "size {size} is not a positive multiple of the granularity {}",
                    self.options.granularity
                ),
            ))
        }
    }

    fn new_handle(&self) -> AllocationHandle {
        AllocationHandle::from_u64(self.next_handle.fetch_add(1, Ordering::Relaxed))
    }
}

/// Finds the reservation containing `address..address + size`.
fn reservation_for<'a>(
    reservations: &'a mut BTreeMap<u64, Reservation>,
    op: &str,
    address: VirtualAddress,
    size: usize,
) -> Result<&'a mut Reservation> {
    reservations
        .range_mut(..=address.as_u64())
        .next_back()
        .map(|(_, r)| r)
        .filter(|r| r.region.contains(address.as_u64(), size))
        .ok_or_else(|| {
            Error::driver(
                op,
                format!("{address}+{size} is not inside a reserved range"),
            )
        })
}

impl Backings {
    fn add_ref(&mut self, identity: ObjectIdentity, charge: Option<Charge>) {
        match self.0.entry(identity) {
            hash_map::Entry::Occupied(mut e) => e.get_mut().refs += 1,
            hash_map::Entry::Vacant(e) => {
                e.insert(Backing {
                    refs: 1,
                    _charge: charge,
                });
            }
        }
    }

    fn drop_ref(&mut self, identity: ObjectIdentity) {
        if let hash_map::Entry::Occupied(mut e) = self.0.entry(identity) {
            e.get_mut().refs -= 1;
            if e.get().refs == 0 {
                e.remove();
            }
        }
    }
}

impl Reservation {
    fn offset_of(&self, address: VirtualAddress) -> usize {
        (address.as_u64() - self.region.base()) as usize
    }

    fn overlaps(&self, offset: usize, len: usize) -> bool {
        let before = self
            .mappings
            .range(..=offset)
            .next_back()
            .is_some_and(|(&start, m)| start + m.len > offset);
        let after = self
            .mappings
            .range(offset..offset + len)
            .next()
            .is_some();
        before || after
    }
}

impl DeviceDriver for HostDriver {
    fn device_count(&self) -> usize {
        self.options.device_count
    }

    fn granularity(&self, device: DeviceOrdinal) -> Result<usize> {
        self.check_device("granularity", device)?;
        Ok(self.options.granularity)
    }

    fn memory_info(&self, device: DeviceOrdinal) -> Result<MemoryInfo> {
        self.check_device("memory_info", device)?;
        let budget = &self.budgets[device.index()];
        Ok(MemoryInfo {
            free: budget.remaining(),
            total: budget.total(),
        })
    }

    fn address_reserve(&self, device: DeviceOrdinal, size: usize) -> Result<VirtualAddress> {
        self.check_device("address_reserve", device)?;
        self.check_size("address_reserve", size)?;
        let region = ReservedRegion::reserve_aligned(size, self.options.granularity)
            .map_err(|e| Error::driver_os("address_reserve", e))?;
        let address = VirtualAddress::from_u64(region.base());
        log::debug!("reserved {size} bytes at {address} on {device}");
        self.state.lock().unwrap().reservations.insert(
            address.as_u64(),
            Reservation {
                device,
                region,
                mappings: BTreeMap::new(),
            },
        );
        Ok(address)
    }

    fn address_free(&self, address: VirtualAddress, size: usize) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let btree_map::Entry::Occupied(entry) = state.reservations.entry(address.as_u64()) else {
            return Err(Error::driver(
                "address_free",
                format!("{address} is not the base of a reserved range"),
            ));
        };
        let reservation = entry.get();
        if reservation.region.len() != size {
            return Err(Error::driver(
                "address_free",
                format!(
                    "size {size} does not match the reserved size {}",
                    reservation.region.len()
                ),
            ));
        }
        if !reservation.mappings.is_empty() {
            return Err(Error::driver(
                "address_free",
                format!(
                    "{address} still has {} mapping(s)",
                    reservation.mappings.len()
                ),
            ));
        }
        let reservation = entry.remove();
        drop(state);
        reservation
            .region
            .release()
            .map_err(|e| Error::driver_os("address_free", e))?;
        log::debug!("released {size} bytes at {address}");
        Ok(())
    }

    fn mem_create(&self, device: DeviceOrdinal, size: usize) -> Result<AllocationHandle> {
        self.check_device("mem_create", device)?;
        self.check_size("mem_create", size)?;
        let charge = self.budgets[device.index()]
            .charge(size as u64)
            .map_err(|e| Error::driver("mem_create", e.to_string()))?;
        let name = CString::new(format!("vmfabric-dev{}", device.as_u32()))
            .map_err(|e| Error::driver("mem_create", e.to_string()))?;
        let memory =
            SharedMemory::create(&name, size).map_err(|e| Error::driver_os("mem_create", e))?;

        let handle = self.new_handle();
        let mut state = self.state.lock().unwrap();
        state.backings.add_ref(memory.identity(), Some(charge));
        state.allocations.insert(
            handle.as_u64(),
            Allocation {
                device,
                memory,
                imported: false,
            },
        );
        log::debug!("created {handle} of {size} bytes on {device}");
        Ok(handle)
    }

    fn mem_map(
        &self,
        address: VirtualAddress,
        size: usize,
        handle: AllocationHandle,
    ) -> Result<()> {
        self.check_size("mem_map", size)?;
        let granularity = self.options.granularity;
        let mut state = self.state.lock().unwrap();
        let HostState {
            reservations,
            allocations,
            backings,
        } = &mut *state;
        let Some(allocation) = allocations.get(&handle.as_u64()) else {
            return Err(Error::driver("mem_map", format!("unknown {handle}")));
        };
        if size as u64 > allocation.memory.len() {
            return Err(Error::driver(
                "mem_map",
                format!(
                    "{size} bytes exceed the {} byte allocation",
                    allocation.memory.len()
                ),
            ));
        }
        let reservation = reservation_for(reservations, "mem_map", address, size)?;
        if !allocation.imported && allocation.device != reservation.device {
            return Err(Error::driver(
                "mem_map",
                format!(
                    "{handle} lives on {}, the range belongs to {}",
                    allocation.device, reservation.device
                ),
            ));
        }
        let offset = reservation.offset_of(address);
        if !offset.is_multiple_of(granularity) {
            return Err(Error::driver(
                "mem_map",
                format!("{address} is not aligned to the granularity {granularity}"),
            ));
        }
        if reservation.overlaps(offset, size) {
            return Err(Error::driver(
                "mem_map",
                format!("{address}+{size} overlaps an existing mapping"),
            ));
        }
        reservation
            .region
            .map(offset..offset + size, &allocation.memory)
            .map_err(|e| Error::driver_os("mem_map", e))?;
        let identity = allocation.memory.identity();
        reservation.mappings.insert(
            offset,
            Mapping {
                len: size,
                identity,
                access: None,
            },
        );
        backings.add_ref(identity, None);
        log::debug!("mapped {handle} at {address}+{size}");
        Ok(())
    }

    fn mem_set_access(
        &self,
        address: VirtualAddress,
        size: usize,
        device: DeviceOrdinal,
    ) -> Result<()> {
        self.check_device("mem_set_access", device)?;
        let mut state = self.state.lock().unwrap();
        let reservation = reservation_for(&mut state.reservations, "mem_set_access", address, size)?;
        let offset = reservation.offset_of(address);
        let Some(mapping) = reservation
            .mappings
            .get_mut(&offset)
            .filter(|m| m.len == size)
        else {
            return Err(Error::driver(
                "mem_set_access",
                format!("{address}+{size} is not a mapped span"),
            ));
        };
        reservation
            .region
            .protect(offset..offset + size, Protection::ReadWrite)
            .map_err(|e| Error::driver_os("mem_set_access", e))?;
        mapping.access = Some(device);
        Ok(())
    }

    fn mem_unmap(&self, address: VirtualAddress, size: usize) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let HostState {
            reservations,
            backings,
            ..
        } = &mut *state;
        let reservation = reservation_for(reservations, "mem_unmap", address, size)?;
        let offset = reservation.offset_of(address);
        let btree_map::Entry::Occupied(entry) = reservation.mappings.entry(offset) else {
            return Err(Error::driver(
                "mem_unmap",
                format!("nothing is mapped at {address}"),
            ));
        };
        if entry.get().len != size {
            return Err(Error::driver(
                "mem_unmap",
                format!(
                    "partial unmap: {size} bytes requested, the mapping at {address} has {}",
                    entry.get().len
                ),
            ));
        }
        reservation
            .region
            .unmap(offset..offset + size)
            .map_err(|e| Error::driver_os("mem_unmap", e))?;
        let mapping = entry.remove();
        backings.drop_ref(mapping.identity);
        log::debug!(
            "unmapped {address}+{size} (access was {:?})",
            mapping.access
        );
        Ok(())
    }

    fn mem_release(&self, handle: AllocationHandle) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let Some(allocation) = state.allocations.remove(&handle.as_u64()) else {
            return Err(Error::driver("mem_release", format!("unknown {handle}")));
        };
        state.backings.drop_ref(allocation.memory.identity());
        log::debug!("released {handle} on {}", allocation.device);
        Ok(())
    }

    fn export_shareable(&self, handle: AllocationHandle) -> Result<TransferableToken> {
        let state = self.state.lock().unwrap();
        let Some(allocation) = state.allocations.get(&handle.as_u64()) else {
            return Err(Error::driver(
                "export_shareable",
                format!("unknown {handle}"),
            ));
        };
        let identity = allocation.memory.identity();
        Ok(TransferableToken {
            owner_pid: std::process::id(),
            fd: allocation.memory.as_raw_fd(),
            size: allocation.memory.len(),
            device: allocation.device,
            identity: MemoryIdentity {
                dev: identity.dev,
                ino: identity.ino,
            },
        })
    }

    fn import_shareable(&self, token: &TransferableToken) -> Result<AllocationHandle> {
        let memory = SharedMemory::from_process(token.owner_pid, token.fd)
            .map_err(|e| Error::driver_os("import_shareable", e))?;
        let identity = memory.identity();
        if identity.dev != token.identity.dev
            || identity.ino != token.identity.ino
            || memory.len() != token.size
        {
            return Err(Error::driver(
                "import_shareable",
                format!(
                    "stale token: fd {} of pid {} no longer refers to the exported memory",
                    token.fd, token.owner_pid
                ),
            ));
        }

        let handle = self.new_handle();
        let mut state = self.state.lock().unwrap();
        state.backings.add_ref(identity, None);
        state.allocations.insert(
            handle.as_u64(),
            Allocation {
                device: token.device,
                memory,
                imported: true,
            },
        );
        log::debug!(
            "imported {handle} ({} bytes from pid {})",
            token.size,
            token.owner_pid
        );
        Ok(handle)
    }
}

impl Drop for HostDriver {
    fn drop(&mut self) {
        let Ok(state) = self.state.get_mut() else {
            return;
        };
        let mappings: usize = state.reservations.values().map(|r| r.mappings.len()).sum();
        if !state.reservations.is_empty() || !state.allocations.is_empty() {
            log::warn!(
                "host driver dropped with {} reservation(s), {} allocation handle(s) \
                 and {mappings} mapping(s) still live",
                state.reservations.len(),
                state.allocations.len()
            );
        }
    }
}

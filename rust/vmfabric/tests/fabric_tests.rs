use std::{
    io::{BufRead, BufReader, Write},
    os::unix::net::UnixStream,
    process::{Child, Command, Stdio},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use vmfabric::{
    AllocationHandle, DeviceDriver, DeviceOrdinal, MemoryInfo, TransferableToken, VirtualAddress,
    VirtualMemoryFabric,
    host::{HostDriver, HostDriverOptions},
    transport,
};
use vmfabric_common::{Result, error::Error};

const GRANULARITY: usize = 64 * 1024;
const DEVICE_MEMORY: u64 = 64 * 1024 * 1024;
const DEV0: DeviceOrdinal = DeviceOrdinal::new(0);
const DEV1: DeviceOrdinal = DeviceOrdinal::new(1);

fn options() -> HostDriverOptions {
    HostDriverOptions::default()
        .with_device_count(2)
        .with_granularity(GRANULARITY)
        .with_device_memory(DEVICE_MEMORY)
}

fn host_fabric() -> (Arc<HostDriver>, VirtualMemoryFabric) {
    let driver = Arc::new(HostDriver::new(options()).unwrap());
    let fabric = VirtualMemoryFabric::new(driver.clone());
    (driver, fabric)
}

fn pattern(len: usize, seed: u64) -> Vec<u8> {
    fastrand::seed(seed);
    (0..len).map(|_| fastrand::u8(..)).collect()
}

fn fill_pattern(address: VirtualAddress, len: usize, seed: u64) -> Vec<u8> {
    let bytes = pattern(len, seed);
    unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), address.as_ptr(), len) };
    bytes
}

fn read_bytes(address: VirtualAddress, len: usize) -> Vec<u8> {
    unsafe { std::slice::from_raw_parts(address.as_ptr::<u8>(), len) }.to_vec()
}

#[test]
fn test_reserve_granularity() {
    let (driver, fabric) = host_fabric();
    assert_eq!(fabric.granularity(DEV0).unwrap(), GRANULARITY);

    fastrand::seed(11);
    for _ in 0..32 {
        let size = fastrand::usize(1..GRANULARITY * 8);
        if size.is_multiple_of(GRANULARITY) {
            continue;
        }
        let err = fabric.reserve(DEV0, size).unwrap_err();
        assert!(err.is_invalid_arg(), "{size}: {err}");
    }
    assert!(fabric.reserve(DEV0, 0).unwrap_err().is_invalid_arg());

    for units in [1, 2, 7, 64] {
        let size = GRANULARITY * units;
        let address = fabric.reserve(DEV0, size).unwrap();
        assert!(!address.is_null());
        assert!(address.as_u64().is_multiple_of(GRANULARITY as u64));
        fabric.release(address, size).unwrap();
    }
    assert_eq!(driver.resource_counts(), (0, 0, 0));
}

#[test]
fn test_reserve_unknown_device() {
    let (_driver, fabric) = host_fabric();
    let err = fabric.reserve(DeviceOrdinal::new(2), GRANULARITY).unwrap_err();
    assert!(err.is_invalid_arg());
}

#[test]
fn test_reserve_does_not_consume_memory() {
    let (_driver, fabric) = host_fabric();
    let size = 1 << 34;
    let address = fabric.reserve(DEV0, size).unwrap();
    assert_eq!(fabric.memory_info(DEV0).unwrap().free, DEVICE_MEMORY);
    fabric.release(address, size).unwrap();
}

#[test]
fn test_allocate_deallocate_round_trip() {
    let (driver, fabric) = host_fabric();
    let virtual_size = GRANULARITY * 16;
    let address = fabric.reserve(DEV0, virtual_size).unwrap();

    let handle = fabric.allocate(DEV0, address, GRANULARITY * 4).unwrap();
    assert_eq!(
        fabric.memory_info(DEV0).unwrap(),
        MemoryInfo {
            free: DEVICE_MEMORY - (GRANULARITY * 4) as u64,
            total: DEVICE_MEMORY,
        }
    );
    assert!(read_bytes(address, GRANULARITY * 4).iter().all(|&b| b == 0));
    fill_pattern(address, GRANULARITY * 4, 1);
    fabric.deallocate(address, handle, GRANULARITY * 4).unwrap();
    assert_eq!(fabric.memory_info(DEV0).unwrap().free, DEVICE_MEMORY);

    // The range is reusable for an equal or smaller allocation.
    for size in [GRANULARITY * 4, GRANULARITY * 2, GRANULARITY] {
        let handle = fabric.allocate(DEV0, address, size).unwrap();
        assert!(read_bytes(address, size).iter().all(|&b| b == 0));
        fabric.deallocate(address, handle, size).unwrap();
    }

    // The whole reservation, and a sub-span at an offset.
    let handle = fabric.allocate(DEV0, address, virtual_size).unwrap();
    fabric.deallocate(address, handle, virtual_size).unwrap();
    let inner = address.offset((GRANULARITY * 3) as u64).unwrap();
    let handle = fabric.allocate(DEV0, inner, GRANULARITY * 2).unwrap();
    fabric.deallocate(inner, handle, GRANULARITY * 2).unwrap();

    fabric.release(address, virtual_size).unwrap();
    assert_eq!(driver.resource_counts(), (0, 0, 0));
}

#[test]
fn test_allocate_validates_arguments() {
    let (driver, fabric) = host_fabric();
    let address = fabric.reserve(DEV0, GRANULARITY * 4).unwrap();

    let err = fabric.allocate(DEV0, address, GRANULARITY + 1).unwrap_err();
    assert!(err.is_invalid_arg());
    let err = fabric.allocate(DEV0, address.offset(1).unwrap(), GRANULARITY).unwrap_err();
    assert!(err.is_invalid_arg());
    let err = fabric.allocate(DEV0, VirtualAddress::NULL, GRANULARITY).unwrap_err();
    assert!(err.is_invalid_arg());
    assert_eq!(fabric.memory_info(DEV0).unwrap().free, DEVICE_MEMORY);

    // Beyond the reservation: the driver rejects the mapping and the allocation
    // is rolled back.
    let err = fabric.allocate(DEV0, address, GRANULARITY * 8).unwrap_err();
    assert!(err.is_driver());
    assert_eq!(fabric.memory_info(DEV0).unwrap().free, DEVICE_MEMORY);
    assert_eq!(driver.resource_counts(), (1, 0, 0));

    fabric.release(address, GRANULARITY * 4).unwrap();
}

#[test]
fn test_overlapping_allocation_is_rejected() {
    let (driver, fabric) = host_fabric();
    let address = fabric.reserve(DEV0, GRANULARITY * 4).unwrap();
    let handle = fabric.allocate(DEV0, address, GRANULARITY * 2).unwrap();

    let err = fabric
        .allocate(DEV0, address.offset(GRANULARITY as u64).unwrap(), GRANULARITY * 2)
        .unwrap_err();
    assert!(err.is_driver());
    assert_eq!(driver.resource_counts(), (1, 1, 1));

    fabric.deallocate(address, handle, GRANULARITY * 2).unwrap();
    fabric.release(address, GRANULARITY * 4).unwrap();
}

#[test]
fn test_allocate_on_foreign_device_range_is_rejected() {
    let (driver, fabric) = host_fabric();
    let address = fabric.reserve(DEV1, GRANULARITY).unwrap();
    let err = fabric.allocate(DEV0, address, GRANULARITY).unwrap_err();
    assert!(err.is_driver());
    assert_eq!(driver.resource_counts(), (1, 0, 0));
    assert_eq!(fabric.memory_info(DEV0).unwrap().free, DEVICE_MEMORY);
    fabric.release(address, GRANULARITY).unwrap();
}

#[test]
fn test_out_of_device_memory() {
    let (driver, fabric) = host_fabric();
    let size = DEVICE_MEMORY as usize * 2;
    let address = fabric.reserve(DEV0, size).unwrap();
    let err = fabric.allocate(DEV0, address, size).unwrap_err();
    assert!(err.is_driver());
    assert_eq!(driver.resource_counts(), (1, 0, 0));

    // The other device has its own budget.
    let range = fabric.allocate_range(DEV1, DEVICE_MEMORY as usize).unwrap();
    assert_eq!(fabric.memory_info(DEV1).unwrap().free, 0);
    assert_eq!(fabric.memory_info(DEV0).unwrap().free, DEVICE_MEMORY);
    range.close().unwrap();

    fabric.release(address, size).unwrap();
}

#[test]
fn test_release_requires_unmapped_range() {
    let (driver, fabric) = host_fabric();
    let address = fabric.reserve(DEV0, GRANULARITY * 2).unwrap();
    let handle = fabric.allocate(DEV0, address, GRANULARITY).unwrap();

    assert!(fabric.release(address, GRANULARITY * 2).unwrap_err().is_driver());
    assert!(fabric.release(address, GRANULARITY).unwrap_err().is_driver());

    fabric.deallocate(address, handle, GRANULARITY).unwrap();
    fabric.release(address, GRANULARITY * 2).unwrap();
    assert!(fabric.release(address, GRANULARITY * 2).unwrap_err().is_driver());
    assert_eq!(driver.resource_counts(), (0, 0, 0));
}

#[test]
fn test_deallocate_releases_even_if_unmap_fails() {
    let (driver, fabric) = host_fabric();
    let address = fabric.reserve(DEV0, GRANULARITY * 2).unwrap();
    let handle = fabric.allocate(DEV0, address, GRANULARITY * 2).unwrap();

    // Partial unmap is refused, the handle is released regardless.
    let err = fabric.deallocate(address, handle, GRANULARITY).unwrap_err();
    assert!(err.is_driver());
    assert_eq!(driver.resource_counts(), (1, 0, 1));
    // The mapping still holds the memory.
    assert_eq!(
        fabric.memory_info(DEV0).unwrap().free,
        DEVICE_MEMORY - (GRANULARITY * 2) as u64
    );

    fabric.unmap(address, GRANULARITY * 2).unwrap();
    assert_eq!(fabric.memory_info(DEV0).unwrap().free, DEVICE_MEMORY);
    assert!(fabric.release_handle(handle).unwrap_err().is_driver());
    fabric.release(address, GRANULARITY * 2).unwrap();
}

#[test]
fn test_export_import_shares_memory() {
    let (driver, fabric) = host_fabric();
    let size = GRANULARITY * 2;
    let src = fabric.reserve(DEV0, size).unwrap();
    let handle = fabric.allocate(DEV0, src, size).unwrap();
    let pattern = fill_pattern(src, size, 42);

    let token = fabric.export_handle(handle).unwrap();
    assert_eq!(token.size, size as u64);
    assert_eq!(token.device, DEV0);
    let token = TransferableToken::from_bytes(&token.to_bytes().unwrap()).unwrap();

    let dst = fabric.reserve(DEV1, size).unwrap();
    let imported = fabric.import_handle(&token).unwrap();
    assert_ne!(imported, handle);
    fabric.map(DEV1, dst, imported, size).unwrap();
    assert_eq!(read_bytes(dst, size), pattern);

    // Writes through either mapping are visible through the other.
    unsafe { *dst.as_ptr::<u8>() = !pattern[0] };
    assert_eq!(read_bytes(src, 1), vec![!pattern[0]]);

    // Exporting again yields a token for the same memory.
    let again = fabric.export_handle(handle).unwrap();
    assert!(again.same_memory(&token));

    // Imported memory is not charged a second time.
    assert_eq!(fabric.memory_info(DEV1).unwrap().free, DEVICE_MEMORY);

    // Releasing the exporter's side first keeps the imported mapping intact.
    fabric.deallocate(src, handle, size).unwrap();
    assert_eq!(read_bytes(dst, 1), vec![!pattern[0]]);
    fabric.deallocate(dst, imported, size).unwrap();
    assert_eq!(fabric.memory_info(DEV0).unwrap().free, DEVICE_MEMORY);

    fabric.release(src, size).unwrap();
    fabric.release(dst, size).unwrap();
    assert_eq!(driver.resource_counts(), (0, 0, 0));
}

#[test]
fn test_import_keeps_memory_alive() {
    let (_driver, fabric) = host_fabric();
    let range = fabric.allocate_range(DEV0, GRANULARITY).unwrap();
    let pattern = fill_pattern(range.address(), GRANULARITY, 5);
    let imported = fabric.import_handle(&range.export().unwrap()).unwrap();
    range.close().unwrap();

    // Charged until the imported handle goes away too.
    assert_eq!(
        fabric.memory_info(DEV0).unwrap().free,
        DEVICE_MEMORY - GRANULARITY as u64
    );
    let copy = fabric
        .map_scoped(DEV0, fabric.reserve(DEV0, GRANULARITY).unwrap(), imported, GRANULARITY)
        .unwrap();
    assert_eq!(read_bytes(copy.address(), GRANULARITY), pattern);
    let address = copy.address();
    copy.close().unwrap();
    fabric.release(address, GRANULARITY).unwrap();
    assert_eq!(fabric.memory_info(DEV0).unwrap().free, DEVICE_MEMORY);
}

#[test]
fn test_import_stale_token() {
    let (driver, fabric) = host_fabric();
    let range = fabric.allocate_range(DEV0, GRANULARITY).unwrap();
    let mut token = range.export().unwrap();
    token.identity.ino = token.identity.ino.wrapping_add(1);
    assert!(fabric.import_handle(&token).unwrap_err().is_driver());

    let token = range.export().unwrap();
    range.close().unwrap();
    assert!(fabric.import_handle(&token).unwrap_err().is_driver());
    assert_eq!(driver.resource_counts(), (0, 0, 0));
}

#[test]
fn test_scoped_guards_release_on_drop() {
    let (driver, fabric) = host_fabric();
    {
        let reservation = fabric.reserve_scoped(DEV0, GRANULARITY * 4).unwrap();
        let _a = fabric
            .allocate_scoped(DEV0, reservation.address(), GRANULARITY)
            .unwrap();
        let _b = fabric
            .allocate_scoped(
                DEV0,
                reservation.address().offset(GRANULARITY as u64).unwrap(),
                GRANULARITY,
            )
            .unwrap();
        let range = fabric.allocate_range(DEV1, GRANULARITY).unwrap();
        let _imported = fabric.import_range(DEV0, &range.export().unwrap()).unwrap();
        assert_eq!(driver.resource_counts(), (3, 4, 4));
        // Guards drop in reverse declaration order: mappings before the
        // reservation that holds them.
    }
    assert_eq!(driver.resource_counts(), (0, 0, 0));
    assert_eq!(fabric.memory_info(DEV0).unwrap().free, DEVICE_MEMORY);
    assert_eq!(fabric.memory_info(DEV1).unwrap().free, DEVICE_MEMORY);
}

#[test]
fn test_import_range_validates_size() {
    let driver = Arc::new(
        HostDriver::new(options().with_granularity(GRANULARITY * 2)).unwrap(),
    );
    let coarse = VirtualMemoryFabric::new(driver);
    let (_driver, fabric) = host_fabric();
    let range = fabric.allocate_range(DEV0, GRANULARITY).unwrap();
    let err = coarse
        .import_range(DEV0, &range.export().unwrap())
        .unwrap_err();
    assert!(err.is_invalid_arg());
}

#[test]
fn test_token_over_unix_socket() {
    let (driver, fabric) = host_fabric();
    let range = fabric.allocate_range(DEV0, GRANULARITY).unwrap();
    let pattern = fill_pattern(range.address(), GRANULARITY, 9);

    let (left, right) = UnixStream::pair().unwrap();
    let token = range.export().unwrap();
    let sender = std::thread::spawn(move || transport::send_token(&left, &token));
    let received = transport::recv_token(&right).unwrap();
    sender.join().unwrap().unwrap();

    assert_ne!(received.token().fd, range.export().unwrap().fd);
    assert!(received.token().same_memory(&range.export().unwrap()));
    let peer = fabric.import_range(DEV1, received.token()).unwrap();
    drop(received);
    assert_eq!(read_bytes(peer.address(), GRANULARITY), pattern);

    peer.close().unwrap();
    range.close().unwrap();
    assert_eq!(driver.resource_counts(), (0, 0, 0));
}

#[test]
fn test_send_foreign_token_is_rejected() {
    let (_driver, fabric) = host_fabric();
    let range = fabric.allocate_range(DEV0, GRANULARITY).unwrap();
    let mut token = range.export().unwrap();
    token.owner_pid = token.owner_pid.wrapping_add(1);
    let (left, _right) = UnixStream::pair().unwrap();
    assert!(transport::send_token(&left, &token).unwrap_err().is_invalid_arg());
}

#[test]
fn test_recv_token_without_descriptor() {
    let (_driver, fabric) = host_fabric();
    let range = fabric.allocate_range(DEV0, GRANULARITY).unwrap();
    let payload = range.export().unwrap().to_bytes().unwrap();

    // Token bytes alone, with no descriptor attached.
    let (mut left, right) = UnixStream::pair().unwrap();
    left.write_all(&payload).unwrap();
    let err = transport::recv_token(&right).unwrap_err();
    assert!(err.to_string().contains("recv_token"), "{err}");

    // A well-formed message still goes through afterwards.
    transport::send_token(&left, &range.export().unwrap()).unwrap();
    let received = transport::recv_token(&right).unwrap();
    assert!(received.token().same_memory(&range.export().unwrap()));
}

/// Set in the environment of a test binary re-executed as the peer process.
const PEER_PROCESS: &str = "VMFABRIC_PEER_PROCESS";

/// Runs `test` alone in a new instance of this test binary, talking to it over
/// its stdin and stdout.
fn spawn_peer(test: &str) -> Child {
    Command::new(std::env::current_exe().unwrap())
        .args([test, "--exact", "--nocapture", "--test-threads=1"])
        .env(PEER_PROCESS, "1")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()
        .unwrap()
}

fn send_message(writer: &mut impl Write, key: &str, value: &str) {
    writeln!(writer, "<{key}>{value}").unwrap();
    writer.flush().unwrap();
}

/// Skips lines up to the one carrying `key` and returns its value. The harness
/// may print its own text in front of it.
fn read_message(reader: &mut impl BufRead, key: &str) -> String {
    let marker = format!("<{key}>");
    let mut line = String::new();
    loop {
        line.clear();
        let read = reader.read_line(&mut line).unwrap();
        assert_ne!(read, 0, "peer closed the stream before sending {key}");
        if let Some(at) = line.find(&marker) {
            return line[at + marker.len()..].trim().to_string();
        }
    }
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn from_hex(text: &str) -> Vec<u8> {
    (0..text.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&text[i..i + 2], 16).unwrap())
        .collect()
}

#[test]
fn test_import_from_another_process() {
    const SEED: u64 = 77;
    if std::env::var_os(PEER_PROCESS).is_some() {
        return export_to_parent(SEED);
    }

    let (driver, fabric) = host_fabric();
    let mut peer = spawn_peer("test_import_from_another_process");
    let mut output = BufReader::new(peer.stdout.take().unwrap());
    let mut input = peer.stdin.take().unwrap();

    let token =
        TransferableToken::from_bytes(&from_hex(&read_message(&mut output, "token"))).unwrap();
    assert_eq!(token.owner_pid, peer.id());
    assert_ne!(token.owner_pid, std::process::id());
    let range = fabric.import_range(DEV1, &token).unwrap();
    let expected = pattern(GRANULARITY, SEED);
    assert_eq!(read_bytes(range.address(), GRANULARITY), expected);

    // A write through the imported range is seen by the exporting process.
    unsafe { std::ptr::write_volatile(range.as_ptr::<u8>(), !expected[0]) };
    send_message(&mut input, "check", "");
    assert_eq!(read_message(&mut output, "first"), format!("{:02x}", !expected[0]));
    drop(input);
    assert!(peer.wait().unwrap().success());

    // The memory outlives the exporter.
    assert_eq!(read_bytes(range.address(), GRANULARITY)[1..], expected[1..]);
    range.close().unwrap();
    assert_eq!(driver.resource_counts(), (0, 0, 0));
    assert_eq!(fabric.memory_info(DEV1).unwrap().free, DEVICE_MEMORY);
}

/// Peer side of `test_import_from_another_process`.
fn export_to_parent(seed: u64) {
    let (_driver, fabric) = host_fabric();
    let range = fabric.allocate_range(DEV0, GRANULARITY).unwrap();
    fill_pattern(range.address(), GRANULARITY, seed);
    let token = range.export().unwrap();
    send_message(&mut std::io::stdout(), "token", &to_hex(&token.to_bytes().unwrap()));

    read_message(&mut std::io::stdin().lock(), "check");
    let first = unsafe { std::ptr::read_volatile(range.as_ptr::<u8>()) };
    send_message(&mut std::io::stdout(), "first", &format!("{first:02x}"));
    range.close().unwrap();
}

/// Delegates to a host driver, failing selected steps on demand.
struct FaultyDriver {
    inner: HostDriver,
    fail_map: AtomicBool,
    fail_set_access: AtomicBool,
}

impl FaultyDriver {
    fn new() -> FaultyDriver {
        FaultyDriver {
            inner: HostDriver::new(options()).unwrap(),
            fail_map: AtomicBool::new(false),
            fail_set_access: AtomicBool::new(false),
        }
    }
}

impl DeviceDriver for FaultyDriver {
    fn device_count(&self) -> usize {
        self.inner.device_count()
    }

    fn granularity(&self, device: DeviceOrdinal) -> Result<usize> {
        self.inner.granularity(device)
    }

    fn memory_info(&self, device: DeviceOrdinal) -> Result<MemoryInfo> {
        self.inner.memory_info(device)
    }

    fn address_reserve(&self, device: DeviceOrdinal, size: usize) -> Result<VirtualAddress> {
        self.inner.address_reserve(device, size)
    }

    fn address_free(&self, address: VirtualAddress, size: usize) -> Result<()> {
        self.inner.address_free(address, size)
    }

    fn mem_create(&self, device: DeviceOrdinal, size: usize) -> Result<AllocationHandle> {
        self.inner.mem_create(device, size)
    }

    fn mem_map(
        &self,
        address: VirtualAddress,
        size: usize,
        handle: AllocationHandle,
    ) -> Result<()> {
        if self.fail_map.load(Ordering::Relaxed) {
            return Err(Error::driver("mem_map", "injected"));
        }
        self.inner.mem_map(address, size, handle)
    }

    fn mem_set_access(
        &self,
        address: VirtualAddress,
        size: usize,
        device: DeviceOrdinal,
    ) -> Result<()> {
        if self.fail_set_access.load(Ordering::Relaxed) {
            return Err(Error::driver("mem_set_access", "injected"));
        }
        self.inner.mem_set_access(address, size, device)
    }

    fn mem_unmap(&self, address: VirtualAddress, size: usize) -> Result<()> {
        self.inner.mem_unmap(address, size)
    }

    fn mem_release(&self, handle: AllocationHandle) -> Result<()> {
        self.inner.mem_release(handle)
    }

    fn export_shareable(&self, handle: AllocationHandle) -> Result<TransferableToken> {
        self.inner.export_shareable(handle)
    }

    fn import_shareable(&self, token: &TransferableToken) -> Result<AllocationHandle> {
        self.inner.import_shareable(token)
    }
}

#[test]
fn test_failed_map_rolls_back_allocation() {
    let driver = Arc::new(FaultyDriver::new());
    let fabric = VirtualMemoryFabric::new(driver.clone());
    let address = fabric.reserve(DEV0, GRANULARITY).unwrap();

    driver.fail_map.store(true, Ordering::Relaxed);
    let err = fabric.allocate(DEV0, address, GRANULARITY).unwrap_err();
    assert!(err.is_driver());
    assert_eq!(driver.inner.resource_counts(), (1, 0, 0));
    assert_eq!(fabric.memory_info(DEV0).unwrap().free, DEVICE_MEMORY);
    driver.fail_map.store(false, Ordering::Relaxed);

    driver.fail_set_access.store(true, Ordering::Relaxed);
    let err = fabric.allocate(DEV0, address, GRANULARITY).unwrap_err();
    assert!(err.is_driver());
    assert_eq!(driver.inner.resource_counts(), (1, 0, 0));
    assert_eq!(fabric.memory_info(DEV0).unwrap().free, DEVICE_MEMORY);
    driver.fail_set_access.store(false, Ordering::Relaxed);

    let handle = fabric.allocate(DEV0, address, GRANULARITY).unwrap();
    fabric.deallocate(address, handle, GRANULARITY).unwrap();
    fabric.release(address, GRANULARITY).unwrap();
}

#[test]
fn test_failed_map_scoped_releases_imported_handle() {
    let driver = Arc::new(FaultyDriver::new());
    let fabric = VirtualMemoryFabric::new(driver.clone());
    let range = fabric.allocate_range(DEV0, GRANULARITY).unwrap();

    driver.fail_set_access.store(true, Ordering::Relaxed);
    let err = fabric
        .import_range(DEV1, &range.export().unwrap())
        .unwrap_err();
    assert!(err.is_driver());
    assert_eq!(driver.inner.resource_counts(), (1, 1, 1));
    driver.fail_set_access.store(false, Ordering::Relaxed);

    range.close().unwrap();
    assert_eq!(driver.inner.resource_counts(), (0, 0, 0));
}

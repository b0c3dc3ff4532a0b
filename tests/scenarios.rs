//! Seeded end-to-end scenarios exercising the device through its
//! public API the way a filesystem client would: format, mount,
//! create/write/read, and simulated crash/remount cycles.

use nand_driver::fault::{Fault, FaultInjectingNandDriver};
use nand_driver::memory::MemNandDriver;
use nand_driver::{NandDriver, NandGeometry};
use yaffs_core::{mount, Device, DeviceConfig};

fn geometry(chunk_size: usize, chunks_per_block: usize, n_blocks: usize) -> NandGeometry {
    NandGeometry {
        total_bytes_per_chunk: chunk_size,
        spare_bytes_per_chunk: 64,
        chunks_per_block,
        n_blocks,
    }
}

fn config(chunk_size: usize, chunks_per_block: usize, n_blocks: usize, reserved: usize) -> DeviceConfig {
    let mut cfg = DeviceConfig::default();
    cfg.total_bytes_per_chunk = chunk_size;
    cfg.chunks_per_block = chunks_per_block;
    cfg.start_block = 0;
    cfg.end_block = n_blocks - 1;
    cfg.n_reserved_blocks = reserved;
    cfg.max_objects = 64;
    cfg
}

#[test]
fn basic_write_read() {
    let cfg = config(1024, 16, 20, 2);
    let driver = MemNandDriver::new(geometry(1024, 16, 20));
    let mut dev = mount(driver, &cfg).unwrap();

    let a = dev.create_file(yaffs_core::object::ROOT_OBJ_ID, "a", 0o100644).unwrap();
    dev.wr_file(a, 0, b"hello", true).unwrap();

    let mut buf = [0u8; 5];
    dev.file_rd(a, 0, &mut buf).unwrap();
    assert_eq!(&buf, b"hello");
}

#[test]
fn crash_mid_write_recovers_full_chunks_via_v2_scan() {
    let cfg = config(1024, 16, 20, 2);
    let driver = MemNandDriver::new(geometry(1024, 16, 20));
    let mut dev = mount(driver, &cfg).unwrap();

    let b = dev.create_file(yaffs_core::object::ROOT_OBJ_ID, "b", 0o100644).unwrap();
    let chunk_size = 1024usize;
    let full_chunks = vec![0xABu8; chunk_size * 3];
    dev.wr_file(b, 0, &full_chunks, true).unwrap();

    // Simulate a crash: drop the in-RAM device without syncing a
    // checkpoint, then remount from the raw driver via scan.
    let driver = dev.driver;
    let mut dev = Device::new(driver, &cfg).unwrap();
    dev.scan_mount().unwrap();

    let mut readback = vec![0u8; chunk_size * 3];
    dev.file_rd(b, 0, &mut readback).unwrap();
    assert_eq!(readback, full_chunks);
}

#[test]
fn gc_reclaims_under_pressure_and_never_dips_below_reserve() {
    let chunks_per_block = 8;
    let n_blocks = 30;
    let reserved = 2;
    let cfg = config(512, chunks_per_block, n_blocks, reserved);
    let driver = MemNandDriver::new(geometry(512, chunks_per_block, n_blocks));
    let mut dev = mount(driver, &cfg).unwrap();

    let c = dev.create_file(yaffs_core::object::ROOT_OBJ_ID, "c", 0o100644).unwrap();
    let payload = vec![0x42u8; 512];
    let total_chunks = (n_blocks - dev.checkpoint_blocks_required) * chunks_per_block;

    // Write 64 chunks, then overwrite the same 64 logical chunks twice
    // more. Every overwrite orphans the old physical copy; without GC
    // reclaiming those dirty blocks the device would run out of space
    // well before the third round completes.
    for _round in 0..3u64 {
        for logical in 0..64u64 {
            dev.wr_file(c, logical * 512, &payload, true).unwrap();
            dev.check_gc(false).unwrap();
            assert!(
                dev.allocator.n_free_chunks <= total_chunks,
                "free-chunk accounting exceeded device capacity"
            );
        }
    }

    let mut readback = vec![0u8; 512];
    dev.file_rd(c, 0, &mut readback).unwrap();
    assert_eq!(readback, payload);
}

#[test]
fn rename_over_existing_shadows_destination() {
    let cfg = config(1024, 16, 20, 2);
    let driver = MemNandDriver::new(geometry(1024, 16, 20));
    let mut dev = mount(driver, &cfg).unwrap();

    let x = dev.create_file(yaffs_core::object::ROOT_OBJ_ID, "x", 0o100644).unwrap();
    dev.wr_file(x, 0, b"x-data", true).unwrap();
    let y = dev.create_file(yaffs_core::object::ROOT_OBJ_ID, "y", 0o100644).unwrap();
    dev.wr_file(y, 0, b"y-data", true).unwrap();

    dev.rename_obj(x, yaffs_core::object::ROOT_OBJ_ID, "y").unwrap();

    let found = dev.objects.lookup_child(yaffs_core::object::ROOT_OBJ_ID, "y").unwrap();
    let mut buf = [0u8; 6];
    dev.file_rd(found, 0, &mut buf).unwrap();
    assert_eq!(&buf, b"x-data");

    let driver = dev.driver;
    let mut dev = Device::new(driver, &cfg).unwrap();
    dev.scan_mount().unwrap();
    let found = dev.objects.lookup_child(yaffs_core::object::ROOT_OBJ_ID, "y").unwrap();
    let mut buf = [0u8; 6];
    dev.file_rd(found, 0, &mut buf).unwrap();
    assert_eq!(&buf, b"x-data");
}

#[test]
fn hardlink_collapse() {
    let cfg = config(1024, 16, 20, 2);
    let driver = MemNandDriver::new(geometry(1024, 16, 20));
    let mut dev = mount(driver, &cfg).unwrap();

    let f = dev.create_file(yaffs_core::object::ROOT_OBJ_ID, "f", 0o100644).unwrap();
    let g = dev.link_obj(yaffs_core::object::ROOT_OBJ_ID, "g", f).unwrap();

    dev.wr_file(f, 0, b"shared", true).unwrap();

    let resolved = dev.resolve(g);
    let mut buf = [0u8; 6];
    dev.file_rd(resolved, 0, &mut buf).unwrap();
    assert_eq!(&buf, b"shared");

    dev.unlink_obj(f).unwrap();

    let resolved = dev.resolve(g);
    let mut buf = [0u8; 6];
    dev.file_rd(resolved, 0, &mut buf).unwrap();
    assert_eq!(&buf, b"shared");
}

#[test]
fn power_cut_resize_down_leaves_a_valid_prefix() {
    let cfg = config(256, 16, 30, 2);
    let driver = MemNandDriver::new(geometry(256, 16, 30));
    let mut dev = mount(driver, &cfg).unwrap();

    let chunk_size = 256u64;
    let f = dev.create_file(yaffs_core::object::ROOT_OBJ_ID, "f", 0o100644).unwrap();
    let mut original = Vec::new();
    for logical in 0..100u64 {
        let chunk = vec![(logical % 256) as u8; chunk_size as usize];
        dev.wr_file(f, logical * chunk_size, &chunk, true).unwrap();
        original.extend_from_slice(&chunk);
    }

    // Begin a shrink to 10 chunks, but only carry out 30 of the
    // deletions before the simulated crash — resize_file's own loop,
    // replicated here so the crash point lands mid-operation instead
    // of after resize_file returns.
    for logical in (11..=100u64).rev().take(30) {
        let phys = dev
            .objects
            .get(f)
            .and_then(|o| o.as_file())
            .and_then(|file| file.tnode.find(logical));
        if let Some(phys_chunk) = phys {
            dev.delete_chunk(phys_chunk as usize);
            if let Some(file) = dev.objects.get_mut(f).and_then(|o| o.as_file_mut()) {
                file.tnode.add_find(logical, Some(0));
                file.n_data_chunks = file.n_data_chunks.saturating_sub(1);
            }
        }
    }
    // Crash: the shrunk file_size was never flushed to the header.

    let driver = dev.driver;
    let mut dev = Device::new(driver, &cfg).unwrap();
    dev.scan_mount().unwrap();

    let size = dev
        .objects
        .get(f)
        .and_then(|o| o.as_file())
        .unwrap()
        .file_size;
    assert!(size >= 10 * chunk_size, "size {} below the truncation target", size);

    let mut prefix = vec![0u8; (10 * chunk_size) as usize];
    dev.file_rd(f, 0, &mut prefix).unwrap();
    assert_eq!(prefix, &original[..prefix.len()]);
}

#[test]
fn permanent_ecc_failure_is_reported_not_panicked() {
    let inner = MemNandDriver::new(geometry(512, 8, 10));
    let mut driver = FaultInjectingNandDriver::new(inner).with_fault(Fault::PermanentEccFailure { block: 0 });
    let spare = vec![0u8; 64];
    driver.write_chunk(0, &vec![1u8; 512], &spare).unwrap();
    let mut data = vec![0u8; 512];
    let result = driver.read_chunk(0, Some(&mut data), None).unwrap();
    assert!(matches!(result, nand_driver::EccResult::Unfixed));
    assert!(driver.tripped());
}

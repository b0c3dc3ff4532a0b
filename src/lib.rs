//! Log-structured flash filesystem engine for raw NAND: the object
//! graph, block lifecycle, garbage collector, and checkpointing.

pub mod alloc;
pub mod bitmap;
pub mod block;
pub mod cache;
pub mod checkpoint;
pub mod device;
pub mod error;
pub mod gc;
pub mod geometry;
pub mod header;
pub mod io;
pub mod object;
pub mod registry;
pub mod scan;
pub mod tags;
pub mod tnode;

pub use device::Device;
pub use error::{YaffsError, YaffsResult};
pub use geometry::{DeviceConfig, Geometry};
pub use scan::mount;

/// Installs `env_logger`, reading its filter from `RUST_LOG`.
pub fn init_logs() {
    let _ = env_logger::builder().is_test(false).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use nand_driver::memory::MemNandDriver;
    use nand_driver::NandGeometry;

    fn tiny_config() -> DeviceConfig {
        let mut cfg = DeviceConfig::default();
        cfg.total_bytes_per_chunk = 1024;
        cfg.chunks_per_block = 8;
        cfg.start_block = 0;
        cfg.end_block = 15;
        cfg.n_reserved_blocks = 2;
        cfg.max_objects = 64;
        cfg
    }

    #[test]
    fn mount_format_create_and_read_back() {
        let cfg = tiny_config();
        let driver = MemNandDriver::new(NandGeometry {
            total_bytes_per_chunk: cfg.total_bytes_per_chunk,
            spare_bytes_per_chunk: 64,
            chunks_per_block: cfg.chunks_per_block,
            n_blocks: cfg.end_block - cfg.start_block + 1,
        });
        let mut dev = mount(driver, &cfg).unwrap();
        let file_id = dev
            .create_file(object::ROOT_OBJ_ID, "hello.txt", 0o100644)
            .unwrap();
        dev.wr_file(file_id, 0, b"hi", true).unwrap();
        let mut buf = [0u8; 2];
        dev.file_rd(file_id, 0, &mut buf).unwrap();
        assert_eq!(&buf, b"hi");
    }
}

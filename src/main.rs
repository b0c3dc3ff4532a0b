use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::info;
use nand_driver::file::FileNandDriver;
use nand_driver::NandGeometry;
use std::path::PathBuf;
use yaffs_core::{mount, DeviceConfig};

/// yaffsctl: mount, format, and inspect a file-backed YAFFS image
/// without going through a kernel or FUSE layer.
#[derive(Parser)]
#[command(name = "yaffsctl", version, about)]
struct Cli {
    /// Backing data file (a second file with a `.spare` extension holds
    /// the out-of-band tag area).
    #[arg(short, long, default_value = "yaffs.img")]
    device: PathBuf,

    #[arg(long, default_value_t = 2048)]
    chunk_size: usize,

    #[arg(long, default_value_t = 64)]
    chunks_per_block: usize,

    #[arg(long, default_value_t = 200)]
    blocks: usize,

    #[arg(long, default_value_t = 5)]
    reserved_blocks: usize,

    #[arg(short, long, action = clap::ArgAction::SetTrue)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Erase the image and write a fresh empty filesystem.
    Format,
    /// Mount (checkpoint if valid, else scan) and print summary stats.
    Stat,
    /// Force a mount-time scan, ignoring any checkpoint, and report
    /// what it found.
    Scan,
    /// Run one foreground garbage-collection pass and sync.
    Gc,
    /// Force a scan and report orphans/hang fix-ups (scan already does
    /// the repair; this just surfaces the result).
    Fsck,
}

fn open_driver(cli: &Cli) -> Result<FileNandDriver> {
    let spare_path = cli.device.with_extension("spare");
    let geometry = NandGeometry {
        total_bytes_per_chunk: cli.chunk_size,
        spare_bytes_per_chunk: 64,
        chunks_per_block: cli.chunks_per_block,
        n_blocks: cli.blocks,
    };
    FileNandDriver::create(&cli.device, &spare_path, geometry)
        .with_context(|| format!("opening device image at {}", cli.device.display()))
}

fn device_config(cli: &Cli) -> DeviceConfig {
    let mut cfg = DeviceConfig::default();
    cfg.total_bytes_per_chunk = cli.chunk_size;
    cfg.chunks_per_block = cli.chunks_per_block;
    cfg.start_block = 0;
    cfg.end_block = cli.blocks - 1;
    cfg.n_reserved_blocks = cli.reserved_blocks;
    cfg
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    if cli.verbose {
        std::env::set_var("RUST_LOG", "debug");
    }
    yaffs_core::init_logs();

    let config = device_config(&cli);

    match cli.command {
        Command::Format => {
            let driver = open_driver(&cli)?;
            let mut dev = yaffs_core::Device::new(driver, &config)?;
            dev.format()?;
            dev.sync()?;
            info!("formatted {}", cli.device.display());
            println!("formatted {} ({} blocks)", cli.device.display(), config.end_block + 1);
        }
        Command::Stat => {
            let driver = open_driver(&cli)?;
            let dev = mount(driver, &config)?;
            print_stats(&dev);
        }
        Command::Scan => {
            let driver = open_driver(&cli)?;
            let mut dev = yaffs_core::Device::new(driver, &config)?;
            dev.scan_mount()?;
            println!("scan complete");
            print_stats(&dev);
        }
        Command::Gc => {
            let driver = open_driver(&cli)?;
            let mut dev = mount(driver, &config)?;
            dev.check_gc(false)?;
            dev.sync()?;
            println!("gc pass complete");
            print_stats(&dev);
        }
        Command::Fsck => {
            let driver = open_driver(&cli)?;
            let mut dev = yaffs_core::Device::new(driver, &config)?;
            dev.scan_mount()?;
            println!("fsck (scan + fix-up) complete");
            print_stats(&dev);
        }
    }
    Ok(())
}

fn print_stats<T: nand_driver::NandDriver>(dev: &yaffs_core::Device<T>) {
    println!("objects: {}", dev.objects.len());
    println!("free chunks: {}", dev.allocator.n_free_chunks);
    println!("erased blocks: {}", dev.allocator.n_erased_blocks);
    println!("checkpoint blocks reserved: {}", dev.checkpoint_blocks_required);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_config_reflects_cli_flags() {
        let cli = Cli::parse_from([
            "yaffsctl",
            "--chunk-size",
            "4096",
            "--blocks",
            "50",
            "stat",
        ]);
        let cfg = device_config(&cli);
        assert_eq!(cfg.total_bytes_per_chunk, 4096);
        assert_eq!(cfg.end_block, 49);
    }
}

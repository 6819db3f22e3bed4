use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

mod commands;
mod utils;

#[derive(Parser)]
#[command(name = "vmfabric-cmd")]
#[command(about = "Exercises the device virtual memory fabric and the multi-device barrier")]
#[command(version)]
struct Cli {
    /// JSON file with host driver and wait policy settings
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Increase verbosity (-v for debug, -vv for trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Time the reservation of a large address range
    Reserve {
        /// Bytes to reserve (accepts K/M/G/T suffixes)
        #[arg(long, default_value = "256G", value_parser = utils::parse_size)]
        size: u64,

        #[arg(long, default_value_t = 0)]
        device: u32,
    },

    /// Reserve, allocate and deallocate, reporting device memory after each step
    AllocCycle {
        #[arg(long, default_value = "16M", value_parser = utils::parse_size)]
        virtual_size: u64,

        /// Defaults to one granularity unit
        #[arg(long, value_parser = utils::parse_size)]
        alloc_size: Option<u64>,

        #[arg(long, default_value_t = 0)]
        device: u32,

        /// Number of allocate/deallocate rounds on the same range
        #[arg(long, default_value_t = 1)]
        cycles: u32,
    },

    /// Export an allocation, import it into a second range and compare contents
    ExportImport {
        /// Defaults to one granularity unit
        #[arg(long, value_parser = utils::parse_size)]
        alloc_size: Option<u64>,

        #[arg(long, default_value_t = 0)]
        device: u32,

        /// Device that imports the allocation
        #[arg(long, default_value_t = 1)]
        peer_device: u32,
    },

    /// Run barrier episodes with one thread per rank
    Barrier {
        #[arg(long, default_value_t = 2)]
        ranks: usize,

        /// Episodes per round
        #[arg(long, default_value_t = 1000)]
        iterations: u64,

        /// Rounds, each with freshly constructed barriers
        #[arg(long, default_value_t = 1)]
        rounds: u32,

        /// Upper bound of the device memory each rank touches between episodes
        #[arg(long, default_value = "4M", value_parser = utils::parse_size)]
        work_bytes: u64,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    utils::init_logging(cli.verbose);
    let config = commands::CmdConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Reserve { size, device } => commands::reserve::run(&config, device, size),
        Commands::AllocCycle {
            virtual_size,
            alloc_size,
            device,
            cycles,
        } => commands::alloc_cycle::run(&config, device, virtual_size, alloc_size, cycles),
        Commands::ExportImport {
            alloc_size,
            device,
            peer_device,
        } => commands::export_import::run(&config, device, peer_device, alloc_size),
        Commands::Barrier {
            ranks,
            iterations,
            rounds,
            work_bytes,
        } => commands::barrier::run(&config, ranks, iterations, rounds, work_bytes),
    }
}

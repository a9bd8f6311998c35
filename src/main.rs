use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, ValueEnum};
use log::{debug, error, warn};

use vmsim::constants::memory::{DISK_SIZE, HIGH_WATERMARK, LOW_WATERMARK, MEMORY_SIZE};
use vmsim::logging;
use vmsim::memory::access_cache::CacheMode;
use vmsim::memory::tlb::ReplacementPolicy;
use vmsim::memory::{AccessKind, MemoryManager, SimConfig};
use vmsim::trace::run_trace;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CacheModeArg {
    /// Cache whole huge pages.
    HugePage,
    /// Cache 4 KiB segments within huge pages.
    Segment,
}

impl From<CacheModeArg> for CacheMode {
    fn from(arg: CacheModeArg) -> Self {
        match arg {
            CacheModeArg::HugePage => CacheMode::HugePage,
            CacheModeArg::Segment => CacheMode::Segment,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PolicyArg {
    Random,
    Fifo,
}

impl From<PolicyArg> for ReplacementPolicy {
    fn from(arg: PolicyArg) -> Self {
        match arg {
            PolicyArg::Random => ReplacementPolicy::Random,
            PolicyArg::Fifo => ReplacementPolicy::Fifo,
        }
    }
}

/// Virtual-memory subsystem simulator.
///
/// Replays a trace of per-process memory operations through simulated page
/// tables, TLB, frame allocator and swap, then reports translation and
/// cache statistics.
#[derive(Parser)]
#[command(name = "vmsim", version, about)]
struct Cli {
    /// Path to the trace file.
    trace: PathBuf,

    /// Physical memory size in bytes.
    #[arg(long, default_value_t = MEMORY_SIZE)]
    memory: u64,

    /// Simulated disk size in bytes.
    #[arg(long, default_value_t = DISK_SIZE)]
    disk: u64,

    /// Free-memory level restored by a swap sweep.
    #[arg(long, default_value_t = HIGH_WATERMARK)]
    high_watermark: u64,

    /// Free-memory level that triggers a swap sweep.
    #[arg(long, default_value_t = LOW_WATERMARK)]
    low_watermark: u64,

    /// Access cache granularity.
    #[arg(long, value_enum, default_value = "huge-page")]
    cache_mode: CacheModeArg,

    /// TLB replacement policy.
    #[arg(long, value_enum, default_value = "fifo")]
    policy: PolicyArg,

    /// Enable debug logging.
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let file = match File::open(&cli.trace) {
        Ok(file) => file,
        Err(e) => {
            error!("unable to open trace file {}: {}", cli.trace.display(), e);
            return ExitCode::FAILURE;
        }
    };

    let config = SimConfig {
        memory_size: cli.memory,
        disk_size: cli.disk,
        high_watermark: cli.high_watermark,
        low_watermark: cli.low_watermark,
        cache_mode: cli.cache_mode.into(),
        policy: cli.policy.into(),
    };
    let mut mm = MemoryManager::new(config);

    match run_trace(BufReader::new(file), &mut mm) {
        Ok(summary) => {
            if summary.skipped > 0 {
                warn!("skipped {} malformed trace lines", summary.skipped);
            }
            debug!(
                "executed {} instructions{}",
                summary.executed,
                if summary.stopped_at_switch {
                    ", stopped at second switch"
                } else {
                    ""
                }
            );
        }
        Err(e) => error!("trace aborted: {}", e),
    }

    report(&mm);
    ExitCode::SUCCESS
}

fn report(mm: &MemoryManager) {
    let stats = mm.stats();
    println!("Total memory access attempts: {}", stats.accesses);

    let tlb = mm.tlb_stats();
    println!(
        "TLB: {} L1 hits, {} L2 hits, {} misses",
        tlb.l1_hits, tlb.l2_hits, tlb.misses
    );
    for kind in [AccessKind::Code, AccessKind::Stack, AccessKind::Heap] {
        println!(
            "  {} misses: {}",
            kind.as_str(),
            stats.kind_misses[kind.index()]
        );
    }
    println!("Page-table reads: {}", stats.walk_reads);

    let swap = mm.swap_stats();
    println!(
        "Swap: {} pages out ({} bytes), {} pages in",
        swap.pages_out, swap.bytes_out, swap.pages_in
    );

    match mm.cache_mode() {
        CacheMode::HugePage => {
            let cache = mm.cache_stats();
            println!(
                "Access cache: {} hits, {} misses, hit rate {:.2}%",
                cache.hits,
                cache.misses,
                cache.hit_rate() * 100.0
            );
        }
        CacheMode::Segment => {
            for proc in mm.processes() {
                for (pfn, offsets) in &proc.segment_accesses {
                    let segments = mm.segment_counts().get(pfn).copied().unwrap_or(0);
                    println!(
                        "PID {} huge page at frame {} ({} segments):",
                        proc.pid, pfn, segments
                    );
                    for (offset, count) in offsets {
                        println!("  segment {:>4}: {} accesses", offset, count);
                    }
                }
            }
        }
    }
}

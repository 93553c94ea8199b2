//! Runtime diagnostics and the exit report.
//!
//! Per-thread VM counters live in the state; process-wide lifetime totals
//! are lock-free atomics updated on the hot paths. `dump_diagnostics`
//! writes a snapshot to stderr and, with the `diagnostics` feature on
//! Unix, is wired to SIGQUIT (kill -3) so production processes can be
//! inspected without stopping them.
//!
//! The exit report is controlled by the `VESPER_REPORT` environment
//! variable, parsed once:
//! - unset or `0`: nothing
//! - `1`: human-readable summary to stderr at `deinit`
//! - `json`: JSON to stderr (feature `report-json`)
//! - `json:/path`: JSON to a file

use std::io::Write;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::state::VmState;

/// Collections run, across all VM threads, for the process lifetime.
pub static TOTAL_COLLECTIONS: AtomicU64 = AtomicU64::new(0);
/// Fibers created, across all VM threads, for the process lifetime.
pub static TOTAL_FIBERS: AtomicU64 = AtomicU64::new(0);

// =============================================================================
// Report configuration (parsed from VESPER_REPORT)
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportFormat {
    Human,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportDestination {
    Stderr,
    File(String),
}

#[derive(Debug, Clone)]
pub struct ReportConfig {
    pub format: ReportFormat,
    pub destination: ReportDestination,
}

impl ReportConfig {
    /// Parse from the VESPER_REPORT environment variable.
    pub fn from_env() -> Option<Self> {
        let val = std::env::var("VESPER_REPORT").ok()?;
        match val.as_str() {
            "" | "0" => None,
            "1" => Some(ReportConfig {
                format: ReportFormat::Human,
                destination: ReportDestination::Stderr,
            }),
            "json" => Some(ReportConfig {
                format: ReportFormat::Json,
                destination: ReportDestination::Stderr,
            }),
            s if s.starts_with("json:") => Some(ReportConfig {
                format: ReportFormat::Json,
                destination: ReportDestination::File(s[5..].to_string()),
            }),
            other => {
                eprintln!("warning: VESPER_REPORT='{other}' not recognized, ignoring");
                None
            }
        }
    }
}

static REPORT_CONFIG: OnceLock<Option<ReportConfig>> = OnceLock::new();

fn report_config() -> &'static Option<ReportConfig> {
    REPORT_CONFIG.get_or_init(ReportConfig::from_env)
}

// =============================================================================
// Snapshots
// =============================================================================

/// Snapshot of one thread's VM counters plus process totals.
#[derive(Debug)]
pub struct DiagnosticsData {
    pub blocks_live: usize,
    pub peak_blocks: usize,
    pub blocks_allocated: u64,
    pub bytes_allocated: u64,
    pub blocks_freed: u64,
    pub collections: u64,
    pub pending_bytes: usize,
    pub gc_interval: usize,
    pub fibers_created: u64,
    pub signals_raised: u64,
    pub total_collections: u64,
    pub total_fibers: u64,
}

pub(crate) fn collect_data(vm: &VmState) -> DiagnosticsData {
    DiagnosticsData {
        blocks_live: vm.block_count.get(),
        peak_blocks: vm.stats.peak_blocks.get(),
        blocks_allocated: vm.stats.blocks_allocated.get(),
        bytes_allocated: vm.stats.bytes_allocated.get(),
        blocks_freed: vm.stats.blocks_freed.get(),
        collections: vm.stats.collections.get(),
        pending_bytes: vm.next_collection.get(),
        gc_interval: vm.gc_interval.get(),
        fibers_created: vm.stats.fibers_created.get(),
        signals_raised: vm.stats.signals_raised.get(),
        total_collections: TOTAL_COLLECTIONS.load(Ordering::Relaxed),
        total_fibers: TOTAL_FIBERS.load(Ordering::Relaxed),
    }
}

fn write_human(out: &mut dyn Write, data: &DiagnosticsData) {
    let _ = writeln!(out, "\n=== Vesper Runtime Diagnostics ===");
    let _ = writeln!(out, "[Heap]");
    let _ = writeln!(out, "  Live blocks:      {}", data.blocks_live);
    let _ = writeln!(out, "  Peak blocks:      {}", data.peak_blocks);
    let _ = writeln!(out, "  Blocks allocated: {}", data.blocks_allocated);
    let _ = writeln!(out, "  Bytes allocated:  {}", data.bytes_allocated);
    let _ = writeln!(out, "  Blocks freed:     {}", data.blocks_freed);
    let _ = writeln!(
        out,
        "  Pressure:         {} / {}",
        data.pending_bytes, data.gc_interval
    );
    let _ = writeln!(out, "[Collector]");
    let _ = writeln!(out, "  Collections:      {}", data.collections);
    let _ = writeln!(out, "  Process total:    {}", data.total_collections);
    let _ = writeln!(out, "[Fibers]");
    let _ = writeln!(out, "  Created:          {}", data.fibers_created);
    let _ = writeln!(out, "  Process total:    {}", data.total_fibers);
    let _ = writeln!(out, "  Signals raised:   {}", data.signals_raised);
    let _ = writeln!(out, "=== End Diagnostics ===\n");
}

#[cfg(feature = "report-json")]
fn write_json(out: &mut dyn Write, data: &DiagnosticsData) {
    let json = serde_json::json!({
        "heap": {
            "live_blocks": data.blocks_live,
            "peak_blocks": data.peak_blocks,
            "blocks_allocated": data.blocks_allocated,
            "bytes_allocated": data.bytes_allocated,
            "blocks_freed": data.blocks_freed,
            "pending_bytes": data.pending_bytes,
            "gc_interval": data.gc_interval,
        },
        "collector": {
            "collections": data.collections,
            "process_total": data.total_collections,
        },
        "fibers": {
            "created": data.fibers_created,
            "process_total": data.total_fibers,
            "signals_raised": data.signals_raised,
        },
    });
    let _ = writeln!(out, "{json}");
}

/// Dump a diagnostics snapshot for this thread's VM to stderr.
pub fn dump_diagnostics() {
    crate::state::with_vm(|vm| {
        let data = collect_data(vm);
        let mut err = std::io::stderr().lock();
        write_human(&mut err, &data);
    });
}

// =============================================================================
// SIGQUIT handler (Unix, diagnostics feature)
// =============================================================================

/// Install the SIGQUIT diagnostics handler. Idempotent; called by hosts
/// that want `kill -3` dumps. The handler reports the totals of the
/// receiving thread's VM.
#[cfg(all(unix, feature = "diagnostics"))]
pub fn install_signal_handler() {
    use std::sync::Once;
    static SIGNAL_HANDLER_INIT: Once = Once::new();
    SIGNAL_HANDLER_INIT.call_once(|| {
        unsafe {
            let _ = signal_hook::low_level::register(signal_hook::consts::SIGQUIT, || {
                // Only the process totals are safely readable from the
                // handler context; thread-local heap counters are not.
                let mut err = std::io::stderr().lock();
                let _ = writeln!(err, "\n=== Vesper Runtime (SIGQUIT) ===");
                let _ = writeln!(
                    err,
                    "  Collections: {}",
                    TOTAL_COLLECTIONS.load(Ordering::Relaxed)
                );
                let _ = writeln!(err, "  Fibers:      {}", TOTAL_FIBERS.load(Ordering::Relaxed));
                let _ = writeln!(err, "=== End ===\n");
            });
        }
    });
}

#[cfg(not(all(unix, feature = "diagnostics")))]
pub fn install_signal_handler() {}

// =============================================================================
// Exit report
// =============================================================================

/// Emit the `VESPER_REPORT` exit report. Called by `deinit` before the
/// heap is torn down.
pub(crate) fn emit_exit_report(vm: &VmState) {
    let Some(config) = report_config() else { return };
    let data = collect_data(vm);
    match &config.destination {
        ReportDestination::Stderr => {
            let mut err = std::io::stderr().lock();
            emit_to(&mut err, &config.format, &data);
        }
        ReportDestination::File(path) => match std::fs::File::create(path) {
            Ok(mut file) => emit_to(&mut file, &config.format, &data),
            Err(e) => eprintln!("warning: cannot write report to {path}: {e}"),
        },
    }
}

fn emit_to(out: &mut dyn Write, format: &ReportFormat, data: &DiagnosticsData) {
    match format {
        ReportFormat::Human => write_human(out, data),
        #[cfg(feature = "report-json")]
        ReportFormat::Json => write_json(out, data),
        #[cfg(not(feature = "report-json"))]
        ReportFormat::Json => write_human(out, data),
    }
}

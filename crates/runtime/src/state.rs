//! Per-thread VM state.
//!
//! All VM globals live in one thread-local struct: the GC block list and
//! accounting, the current and root fibers, the interned-string cache, the
//! registries, the return register and the recursion guard. Separate threads
//! are separate VMs and share no heap objects.
//!
//! Fields use `Cell`/`RefCell` so the state can be re-entered freely from
//! native functions running under the interpreter; `RefCell` borrows are
//! never held across calls into user code.
//!
//! # Panic transport
//!
//! `vm_panic` is the runtime's longjmp: the payload value is parked in the
//! state and a private zero-sized token is thrown with `panic_any`. Every
//! interpreter entrance runs under `catch_unwind` and converts the token
//! (or any foreign host panic) into an ERROR signal. A process-wide panic
//! hook suppresses the default backtrace printing for the token only.

use std::cell::{Cell, RefCell};
use std::panic;
use std::sync::{Once, OnceLock};

use crate::fiber::Fiber;
use crate::gc::GcHeader;
use crate::strings::InternTable;
use crate::table::VTable;
use crate::value::Value;

/// Default allocation pressure (bytes) between collections.
const DEFAULT_GC_INTERVAL: usize = 4 * 1024 * 1024;

/// Default fiber stack limit, in value slots.
const DEFAULT_MAX_STACK: i32 = 16384;

/// Maximum nested interpreter entrances before a recursion error.
pub const RECURSION_GUARD: u32 = 1024;

// =============================================================================
// Environment configuration (parsed once at first use)
// =============================================================================

/// Process configuration parsed from `VESPER_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// `VESPER_GC_INTERVAL`: bytes of allocation between collections.
    pub gc_interval: usize,
    /// `VESPER_MAX_STACK`: default fiber `maxstack` in value slots.
    pub max_stack: i32,
    /// `VESPER_HASH_KEY`: hex seed for the keyed hash.
    pub hash_key: Option<u64>,
}

impl Config {
    pub fn from_env() -> Config {
        let gc_interval = std::env::var("VESPER_GC_INTERVAL")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|&v| v > 0)
            .unwrap_or(DEFAULT_GC_INTERVAL);
        let max_stack = std::env::var("VESPER_MAX_STACK")
            .ok()
            .and_then(|v| v.parse::<i32>().ok())
            .filter(|&v| v > 0)
            .unwrap_or(DEFAULT_MAX_STACK);
        let hash_key = std::env::var("VESPER_HASH_KEY")
            .ok()
            .and_then(|v| u64::from_str_radix(v.trim_start_matches("0x"), 16).ok());
        Config { gc_interval, max_stack, hash_key }
    }
}

static CONFIG: OnceLock<Config> = OnceLock::new();

pub fn config() -> &'static Config {
    CONFIG.get_or_init(Config::from_env)
}

// =============================================================================
// VM statistics
// =============================================================================

/// Per-thread lifetime counters, dumped by diagnostics and the exit report.
#[derive(Default)]
pub struct VmStats {
    pub blocks_allocated: Cell<u64>,
    pub bytes_allocated: Cell<u64>,
    pub collections: Cell<u64>,
    pub blocks_freed: Cell<u64>,
    pub fibers_created: Cell<u64>,
    pub signals_raised: Cell<u64>,
    pub peak_blocks: Cell<usize>,
}

// =============================================================================
// VmState
// =============================================================================

/// The whole VM, one per thread.
pub struct VmState {
    pub(crate) initialized: Cell<bool>,

    // Allocator and collector
    pub(crate) blocks: Cell<*mut GcHeader>,
    pub(crate) block_count: Cell<usize>,
    pub(crate) next_collection: Cell<usize>,
    pub(crate) gc_interval: Cell<usize>,
    pub(crate) gc_lock: Cell<u32>,
    pub(crate) traversal: RefCell<Vec<*mut GcHeader>>,
    pub(crate) roots: RefCell<Vec<Value>>,

    // Fibers and interpreter registers
    pub(crate) fiber: Cell<*mut Fiber>,
    pub(crate) root_fiber: Cell<*mut Fiber>,
    pub(crate) stack_depth: Cell<u32>,
    pub(crate) auto_suspend: Cell<bool>,
    pub(crate) return_reg: Cell<Value>,
    pub(crate) panic_payload: Cell<Value>,

    // Registries
    pub(crate) registry: Cell<*mut VTable>,
    pub(crate) core_env: Cell<*mut VTable>,
    pub(crate) abstract_types: RefCell<Vec<&'static crate::value::AbstractType>>,

    // Symbol/keyword internment
    pub(crate) cache: RefCell<InternTable>,

    pub(crate) default_maxstack: Cell<i32>,
    pub(crate) stats: VmStats,
}

impl VmState {
    fn new() -> VmState {
        VmState {
            initialized: Cell::new(false),
            blocks: Cell::new(std::ptr::null_mut()),
            block_count: Cell::new(0),
            next_collection: Cell::new(0),
            gc_interval: Cell::new(DEFAULT_GC_INTERVAL),
            gc_lock: Cell::new(0),
            traversal: RefCell::new(Vec::new()),
            roots: RefCell::new(Vec::new()),
            fiber: Cell::new(std::ptr::null_mut()),
            root_fiber: Cell::new(std::ptr::null_mut()),
            stack_depth: Cell::new(0),
            auto_suspend: Cell::new(false),
            return_reg: Cell::new(Value::nil()),
            panic_payload: Cell::new(Value::nil()),
            registry: Cell::new(std::ptr::null_mut()),
            core_env: Cell::new(std::ptr::null_mut()),
            abstract_types: RefCell::new(Vec::new()),
            cache: RefCell::new(InternTable::new()),
            default_maxstack: Cell::new(DEFAULT_MAX_STACK),
            stats: VmStats::default(),
        }
    }
}

thread_local! {
    static VM: VmState = VmState::new();
}

/// Run a closure against this thread's VM state.
pub(crate) fn with_vm<R>(f: impl FnOnce(&VmState) -> R) -> R {
    VM.with(f)
}

// =============================================================================
// Lifecycle
// =============================================================================

static PANIC_HOOK_INIT: Once = Once::new();

/// Initialize this thread's VM. Idempotent.
///
/// Reads `VESPER_*` configuration, installs the panic-transport hook, seeds
/// the keyed hash, and creates the registry and core environment tables.
pub fn init() {
    PANIC_HOOK_INIT.call_once(|| {
        let prev = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            if info.payload().downcast_ref::<PanicToken>().is_none() {
                prev(info);
            }
        }));
    });

    with_vm(|vm| {
        if vm.initialized.get() {
            return;
        }
        let cfg = config();
        if let Some(key) = cfg.hash_key {
            let _ = vesper_core::set_hash_key(key);
        }
        vm.gc_interval.set(cfg.gc_interval);
        vm.default_maxstack.set(cfg.max_stack);
        vm.initialized.set(true);

        // Registry and core environment live behind a GC lock so partial
        // construction is never swept.
        crate::gc::gclock();
        vm.registry.set(crate::table::table_new(vm, 16));
        vm.core_env.set(crate::corelib::make_core_env(vm));
        crate::gc::gcunlock();
    });
}

/// Tear down this thread's VM: free every heap block and reset all state.
///
/// Emits the `VESPER_REPORT` exit report first, while counters are intact.
pub fn deinit() {
    with_vm(|vm| {
        if !vm.initialized.get() {
            return;
        }
        crate::diagnostics::emit_exit_report(vm);
        unsafe { crate::gc::sweep_all(vm) };
        vm.blocks.set(std::ptr::null_mut());
        vm.block_count.set(0);
        vm.next_collection.set(0);
        vm.gc_lock.set(0);
        vm.roots.borrow_mut().clear();
        vm.traversal.borrow_mut().clear();
        vm.fiber.set(std::ptr::null_mut());
        vm.root_fiber.set(std::ptr::null_mut());
        vm.stack_depth.set(0);
        vm.return_reg.set(Value::nil());
        vm.panic_payload.set(Value::nil());
        vm.registry.set(std::ptr::null_mut());
        vm.core_env.set(std::ptr::null_mut());
        vm.abstract_types.borrow_mut().clear();
        *vm.cache.borrow_mut() = InternTable::new();
        vm.initialized.set(false);
    });
}

/// True once `init` has run on this thread.
pub fn is_initialized() -> bool {
    with_vm(|vm| vm.initialized.get())
}

/// Enable or disable auto-suspend mode: when on, the interpreter raises an
/// INTERRUPT signal on backward jumps and call instructions so a supervisor
/// can time-slice fibers.
pub fn set_auto_suspend(enabled: bool) {
    with_vm(|vm| vm.auto_suspend.set(enabled));
}

// =============================================================================
// Panic transport
// =============================================================================

/// Private unwind token. The actual payload value is parked in the VM state
/// because heap values cannot cross `panic_any`'s `Send` bound.
pub(crate) struct PanicToken;

/// Raise a runtime error carrying `value`, unwinding to the nearest
/// interpreter entrance.
pub fn vm_panic(value: Value) -> ! {
    with_vm(|vm| {
        vm.stats.signals_raised.set(vm.stats.signals_raised.get() + 1);
        vm.panic_payload.set(value);
    });
    panic::panic_any(PanicToken);
}

/// Raise a runtime error from a format string.
#[macro_export]
macro_rules! panicf {
    ($($arg:tt)*) => {
        $crate::state::vm_panic($crate::value::Value::from_str(&format!($($arg)*)))
    };
}

/// Format a foreign panic payload, for panics that did not originate from
/// `vm_panic` (bugs or panics in host native functions).
pub(crate) fn format_panic_payload(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Take the parked panic payload after catching `PanicToken`.
pub(crate) fn take_panic_payload() -> Value {
    with_vm(|vm| {
        let v = vm.panic_payload.get();
        vm.panic_payload.set(Value::nil());
        v
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let cfg = Config {
            gc_interval: DEFAULT_GC_INTERVAL,
            max_stack: DEFAULT_MAX_STACK,
            hash_key: None,
        };
        assert!(cfg.gc_interval > 0);
        assert!(cfg.max_stack > 0);
    }

    #[test]
    fn test_init_deinit_cycle() {
        init();
        assert!(is_initialized());
        with_vm(|vm| {
            assert!(!vm.registry.get().is_null());
            assert!(!vm.core_env.get().is_null());
        });
        deinit();
        assert!(!is_initialized());
        with_vm(|vm| {
            assert!(vm.blocks.get().is_null());
            assert_eq!(vm.block_count.get(), 0);
        });
        // Re-init must work after teardown.
        init();
        assert!(is_initialized());
        deinit();
    }

    #[test]
    fn test_panic_payload_roundtrip() {
        init();
        let caught = std::panic::catch_unwind(|| {
            vm_panic(Value::boolean(true));
        });
        let payload = caught.expect_err("vm_panic must unwind");
        assert!(payload.downcast_ref::<PanicToken>().is_some());
        let value = take_panic_payload();
        assert!(value.truthy());
        deinit();
    }

    #[test]
    fn test_foreign_panic_formatting() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("host bug");
        assert_eq!(format_panic_payload(&payload), "host bug");
        let payload: Box<dyn std::any::Any + Send> = Box::new("owned".to_string());
        assert_eq!(format_panic_payload(&payload), "owned");
    }
}

//! Vesper runtime: the execution substrate of the Vesper language.
//!
//! This crate is the core a host embeds: a register-based bytecode
//! interpreter, a precise mark-and-sweep garbage collector, stackless
//! cooperative fibers, and the core value types (mutable buffer, array and
//! table; immutable string, tuple and struct; interned symbols and
//! keywords; closures with captured environments).
//!
//! Everything above it — reader, compiler, assembler, module loading, I/O
//! libraries, the REPL — consumes this crate through the embedding API in
//! [`api`] and the wire format in [`wire`].
//!
//! All VM state is per-thread: call [`init`] before anything else on a
//! thread, and [`deinit`] to tear the heap down. Values are only
//! meaningful on the thread whose VM created them.
//!
//! # Modules
//!
//! - `state`: thread-local VM state, configuration, panic transport
//! - `gc`: allocator, mark/sweep collector, root registration
//! - `value`: the tagged value type and its logical operations
//! - `strings`: strings and the symbol/keyword intern table
//! - `array`, `buffer`, `tuple`, `structs`, `table`: containers
//! - `function`: definitions, captured environments, closures
//! - `fiber`: stacks, frames, vararg packing
//! - `signal`: signals and fiber status
//! - `vm`: the dispatch loop and fiber resumption
//! - `api`: host embedding surface and parameter extractors
//! - `corelib`: the bootstrap core environment
//! - `debug`: breakpoints, stepping, stack traces, disassembly
//! - `wire`: function-definition wire format for external assemblers
//! - `diagnostics`: counters, SIGQUIT dump, exit report

pub mod api;
pub mod array;
pub mod buffer;
pub mod corelib;
pub mod debug;
pub mod diagnostics;
pub mod fiber;
pub mod function;
pub mod gc;
pub mod signal;
pub mod state;
pub mod strings;
pub mod structs;
pub mod table;
pub mod tuple;
pub mod value;
pub mod vm;
pub mod wire;

// Re-export key types and functions
pub use api::{
    arity, call, cancel, continue_fiber, core_env, fiber, find_abstract_type, fixarity, pcall,
    register_abstract_type, register_cfunction,
};
pub use fiber::{
    FRAME_SIZE, Fiber, StackFrame, fiber_can_resume, fiber_mask, fiber_set_root, fiber_status,
};
pub use gc::{collect, gclock, gcroot, gcunlock, gcunroot, maybe_collect};
pub use signal::{FiberStatus, Signal};
pub use state::{deinit, init, is_initialized, set_auto_suspend, vm_panic};
pub use value::{AbstractType, CFunction, Value, abstract_new};
pub use vesper_core::Kind;

/// Runtime version, from the crate metadata.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

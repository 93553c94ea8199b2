//! Host embedding API.
//!
//! Everything a host needs to run Vesper code: fiber creation and
//! resumption, protected and unprotected calls, registries for native
//! functions and abstract types, and the parameter extractors native
//! functions use to validate their arguments.
//!
//! Native functions all share one signature, `fn(argc, argv) -> Value`,
//! and report errors by panicking through [`vm_panic`]/[`panicf!`]; the
//! nearest interpreter entrance converts that into an ERROR signal.

use crate::fiber::{self, Fiber, frame_flags};
use crate::signal::Signal;
use crate::state::{RECURSION_GUARD, vm_panic, with_vm};
use crate::strings::VString;
use crate::table;
use crate::value::{AbstractType, CFunction, Value};
use crate::vm;
use crate::panicf;
use vesper_core::Kind;

// =============================================================================
// Environment and registries
// =============================================================================

/// The core environment table created by `init`.
pub fn core_env() -> Value {
    with_vm(|vm| {
        let env = vm.core_env.get();
        if env.is_null() {
            panicf!("vesper runtime is not initialized");
        }
        Value::table(env)
    })
}

/// Register a native function under a name, for stack traces and printing.
pub fn register_cfunction(name: &str, f: CFunction) {
    with_vm(|vm| {
        let registry = vm.registry.get();
        if registry.is_null() {
            panicf!("vesper runtime is not initialized");
        }
        table::table_put(
            registry,
            Value::cfunction(f),
            Value::symbol_from(name.as_bytes()),
        );
    });
}

/// Registered name of a native function, if any.
pub(crate) fn cfunction_name(f: Value) -> Option<String> {
    with_vm(|vm| {
        let registry = vm.registry.get();
        if registry.is_null() {
            return None;
        }
        let name = table::table_rawget(registry, f);
        if name.is_nil() {
            None
        } else {
            Some(String::from_utf8_lossy(name.as_bytes()).into_owned())
        }
    })
}

/// Register an abstract type for lookup by name.
pub fn register_abstract_type(ty: &'static AbstractType) {
    with_vm(|vm| {
        let mut types = vm.abstract_types.borrow_mut();
        if types.iter().any(|t| t.name == ty.name) {
            panicf!("abstract type {} already registered", ty.name);
        }
        types.push(ty);
    });
}

/// Look up a registered abstract type by name.
pub fn find_abstract_type(name: &str) -> Option<&'static AbstractType> {
    with_vm(|vm| vm.abstract_types.borrow().iter().copied().find(|t| t.name == name))
}

// =============================================================================
// Fibers, calls, cancellation
// =============================================================================

/// Create a fiber over `callee` with preset arguments. The error value
/// reports arity mismatches and non-callable callees.
pub fn fiber(callee: Value, capacity: usize, args: &[Value]) -> Result<Value, Value> {
    fiber::fiber_new(callee, capacity, args).map(Value::fiber)
}

/// Resume a fiber. The signal tells how it stopped; the value lands in
/// `out`.
pub fn continue_fiber(fiber_value: Value, input: Value, out: &mut Value) -> Signal {
    vm::continue_fiber(fiber_value.fiber_ptr(), input, out)
}

/// Resume a fiber with an injected ERROR at its suspension point.
pub fn cancel(fiber_value: Value, error: Value, out: &mut Value) -> Signal {
    vm::cancel_fiber(fiber_value.fiber_ptr(), error, out)
}

/// Call a function on the current fiber, panicking on any non-OK signal.
///
/// When no fiber is running, a transient one is created. Recursion from
/// native functions back into the interpreter is bounded by
/// [`RECURSION_GUARD`].
pub fn call(callee: Value, args: &[Value]) -> Value {
    with_vm(|vm| {
        let current = vm.fiber.get();
        if current.is_null() {
            let mut out = Value::nil();
            match pcall(callee, args, &mut out) {
                Signal::Ok => out,
                _ => vm_panic(out),
            }
        } else {
            if vm.stack_depth.get() >= RECURSION_GUARD {
                vm_panic(Value::from_str("recursed too deeply"));
            }
            call_on(vm, current, callee, args)
        }
    })
}

fn call_on(
    vm: &crate::state::VmState,
    current: *mut Fiber,
    callee: Value,
    args: &[Value],
) -> Value {
    unsafe {
        match callee.kind() {
            Kind::Function => {
                fiber::push_values(current, args);
                if let Err(e) = fiber::func_frame(current, callee.function_ptr()) {
                    vm_panic(e);
                }
                let frame = crate::fiber::frame_at(current, (*current).frame);
                (*frame).flags |= frame_flags::ENTRANCE;
                vm.stack_depth.set(vm.stack_depth.get() + 1);
                let sig = vm::run_vm(vm, current, None);
                vm.stack_depth.set(vm.stack_depth.get() - 1);
                match sig {
                    Signal::Ok => vm.return_reg.get(),
                    Signal::Error => vm_panic(vm.return_reg.get()),
                    other => panicf!("{} signal outside fiber", other.name()),
                }
            }
            Kind::CFunction => {
                fiber::push_values(current, args);
                let (argv, argc) = fiber::cfunc_frame(current);
                vm.stack_depth.set(vm.stack_depth.get() + 1);
                let ret = (callee.cfunction_ptr())(argc, argv);
                vm.stack_depth.set(vm.stack_depth.get() - 1);
                fiber::pop_frame(current);
                ret
            }
            kind => panicf!("expected callable, got {}", kind.name()),
        }
    }
}

/// Protected call: runs `callee` on a fresh fiber, returning the ending
/// signal and placing the result (or error) in `out`.
pub fn pcall(callee: Value, args: &[Value], out: &mut Value) -> Signal {
    let fib = match fiber::fiber_new(callee, 64, args) {
        Ok(f) => f,
        Err(e) => {
            *out = e;
            return Signal::Error;
        }
    };
    vm::continue_fiber(fib, Value::nil(), out)
}

// =============================================================================
// Parameter extractors
// =============================================================================

/// Fail unless exactly `expected` arguments were passed.
pub fn fixarity(argc: i32, expected: i32) {
    if argc != expected {
        panicf!("expected {expected} arguments, got {argc}");
    }
}

/// Fail unless `min <= argc <= max`.
pub fn arity(argc: i32, min: i32, max: i32) {
    if argc < min || argc > max {
        panicf!("expected {min} to {max} arguments, got {argc}");
    }
}

/// Argument `n`, already bounds-checked by an arity call.
///
/// # Safety
/// `argv` must point to at least `n + 1` values.
#[inline(always)]
pub unsafe fn arg(argv: *const Value, n: i32) -> Value {
    unsafe { *argv.add(n as usize) }
}

macro_rules! typed_getter {
    ($name:ident, $kind:expr, $ret:ty, $conv:expr, $what:literal) => {
        /// # Safety
        /// `argv` must point to at least `n + 1` values.
        pub unsafe fn $name(argv: *const Value, n: i32) -> $ret {
            let v = unsafe { arg(argv, n) };
            if v.kind() != $kind {
                panicf!(concat!("bad argument #{}: expected ", $what, ", got {}"), n, v.kind().name());
            }
            #[allow(clippy::redundant_closure_call)]
            ($conv)(v)
        }
    };
}

typed_getter!(get_number, Kind::Number, f64, |v: Value| v.as_number(), "number");
typed_getter!(get_boolean, Kind::Boolean, bool, |v: Value| v.as_boolean(), "boolean");
typed_getter!(get_string, Kind::String, *mut VString, |v: Value| v.string_ptr(), "string");
typed_getter!(get_symbol, Kind::Symbol, *mut VString, |v: Value| v.string_ptr(), "symbol");
typed_getter!(get_keyword, Kind::Keyword, *mut VString, |v: Value| v.string_ptr(), "keyword");
typed_getter!(get_array, Kind::Array, *mut crate::array::VArray, |v: Value| v.array_ptr(), "array");
typed_getter!(get_tuple, Kind::Tuple, *mut crate::tuple::VTuple, |v: Value| v.tuple_ptr(), "tuple");
typed_getter!(get_table, Kind::Table, *mut table::VTable, |v: Value| v.table_ptr(), "table");
typed_getter!(get_struct, Kind::Struct, *mut crate::structs::VStruct, |v: Value| v.struct_ptr(), "struct");
typed_getter!(get_buffer, Kind::Buffer, *mut crate::buffer::VBuffer, |v: Value| v.buffer_ptr(), "buffer");
typed_getter!(get_function, Kind::Function, *mut crate::function::Function, |v: Value| v.function_ptr(), "function");
typed_getter!(get_fiber, Kind::Fiber, *mut Fiber, |v: Value| v.fiber_ptr(), "fiber");

/// Integer-valued number argument.
///
/// # Safety
/// `argv` must point to at least `n + 1` values.
pub unsafe fn get_integer(argv: *const Value, n: i32) -> i64 {
    let v = unsafe { arg(argv, n) };
    match v.checked_int() {
        Some(i) => i,
        None => panicf!("bad argument #{}: expected integer, got {}", n, v.describe()),
    }
}

/// Integer argument constrained to `[min, max]`.
///
/// # Safety
/// `argv` must point to at least `n + 1` values.
pub unsafe fn get_integer_range(argv: *const Value, n: i32, min: i64, max: i64) -> i64 {
    let i = unsafe { get_integer(argv, n) };
    if i < min || i > max {
        panicf!("bad argument #{n}: {i} out of range [{min}, {max}]");
    }
    i
}

/// Non-negative size argument.
///
/// # Safety
/// `argv` must point to at least `n + 1` values.
pub unsafe fn get_size(argv: *const Value, n: i32) -> usize {
    unsafe { get_integer_range(argv, n, 0, i64::from(i32::MAX)) as usize }
}

/// Instance of a registered abstract type.
///
/// # Safety
/// `argv` must point to at least `n + 1` values.
pub unsafe fn get_abstract(
    argv: *const Value,
    n: i32,
    ty: &'static AbstractType,
) -> *mut crate::value::VAbstract {
    let v = unsafe { arg(argv, n) };
    if v.kind() != Kind::Abstract {
        panicf!("bad argument #{}: expected {}, got {}", n, ty.name, v.kind().name());
    }
    let a = v.abstract_ptr();
    unsafe {
        if !std::ptr::eq((*a).ty, ty) {
            panicf!("bad argument #{}: expected {}, got {}", n, ty.name, (*(*a).ty).name);
        }
    }
    a
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state;

    fn with_rt(f: impl FnOnce()) {
        state::init();
        f();
        state::deinit();
    }

    fn native_add(argc: i32, argv: *const Value) -> Value {
        fixarity(argc, 2);
        let a = unsafe { get_number(argv, 0) };
        let b = unsafe { get_number(argv, 1) };
        Value::number(a + b)
    }

    #[test]
    fn test_pcall_cfunction() {
        with_rt(|| {
            let mut out = Value::nil();
            let sig = pcall(
                Value::cfunction(native_add),
                &[Value::number(2.0), Value::number(3.0)],
                &mut out,
            );
            assert_eq!(sig, Signal::Ok);
            assert_eq!(out.as_number(), 5.0);
        });
    }

    #[test]
    fn test_pcall_reports_extractor_errors() {
        with_rt(|| {
            let mut out = Value::nil();
            let sig = pcall(
                Value::cfunction(native_add),
                &[Value::number(2.0), Value::from_str("no")],
                &mut out,
            );
            assert_eq!(sig, Signal::Error);
            let msg = String::from_utf8_lossy(out.as_bytes()).into_owned();
            assert!(msg.contains("expected number"), "{msg}");
        });
    }

    #[test]
    fn test_pcall_arity() {
        with_rt(|| {
            let mut out = Value::nil();
            let sig = pcall(Value::cfunction(native_add), &[Value::number(2.0)], &mut out);
            assert_eq!(sig, Signal::Error);
        });
    }

    #[test]
    fn test_call_without_fiber() {
        with_rt(|| {
            let v = call(
                Value::cfunction(native_add),
                &[Value::number(1.0), Value::number(2.0)],
            );
            assert_eq!(v.as_number(), 3.0);
        });
    }

    #[test]
    fn test_cfunction_registry() {
        with_rt(|| {
            register_cfunction("native-add", native_add);
            let name = cfunction_name(Value::cfunction(native_add));
            assert_eq!(name.as_deref(), Some("native-add"));
            let described = Value::cfunction(native_add).describe();
            assert_eq!(described, "<cfunction native-add>");
        });
    }

    #[test]
    fn test_abstract_registry() {
        with_rt(|| {
            static COUNTER: AbstractType =
                AbstractType { name: "core/counter", finalize: None, gcmark: None };
            register_abstract_type(&COUNTER);
            assert!(find_abstract_type("core/counter").is_some());
            assert!(find_abstract_type("core/missing").is_none());
        });
    }

    #[test]
    fn test_non_callable_pcall() {
        with_rt(|| {
            let mut out = Value::nil();
            let sig = pcall(Value::number(1.0), &[], &mut out);
            assert_eq!(sig, Signal::Error);
        });
    }
}

//! Core environment bindings.
//!
//! The execution core ships only a small bootstrap environment: value
//! introspection, aggregate constructors and GC control. Everything else
//! (I/O, OS, modules) belongs to outer layers that consume the embedding
//! API.

use crate::api::{self, arity, fixarity};
use crate::array;
use crate::gc;
use crate::state::VmState;
use crate::structs;
use crate::table::{self, VTable};
use crate::tuple;
use crate::value::Value;

fn core_type(argc: i32, argv: *const Value) -> Value {
    fixarity(argc, 1);
    let v = unsafe { api::arg(argv, 0) };
    Value::keyword_from(v.kind().name().as_bytes())
}

fn core_describe(argc: i32, argv: *const Value) -> Value {
    fixarity(argc, 1);
    let v = unsafe { api::arg(argv, 0) };
    Value::from_str(&v.describe())
}

fn core_length(argc: i32, argv: *const Value) -> Value {
    fixarity(argc, 1);
    unsafe { api::arg(argv, 0) }.length()
}

fn core_error(argc: i32, argv: *const Value) -> Value {
    fixarity(argc, 1);
    crate::state::vm_panic(unsafe { api::arg(argv, 0) });
}

fn core_gccollect(argc: i32, _argv: *const Value) -> Value {
    fixarity(argc, 0);
    gc::collect();
    Value::nil()
}

/// View of the caller's argument window. The slice aliases the calling
/// fiber's stack, which can move on any later allocation into it, so it
/// must not outlive the native call that received `argv`.
fn args_slice<'a>(argc: i32, argv: *const Value) -> &'a [Value] {
    unsafe { std::slice::from_raw_parts(argv, argc as usize) }
}

fn core_tuple(argc: i32, argv: *const Value) -> Value {
    Value::tuple(tuple::tuple_of(args_slice(argc, argv)))
}

fn core_array(argc: i32, argv: *const Value) -> Value {
    Value::array(array::array_of(args_slice(argc, argv)))
}

fn core_struct(argc: i32, argv: *const Value) -> Value {
    if argc % 2 != 0 {
        crate::panicf!("expected even number of arguments, got {argc}");
    }
    Value::structure(structs::struct_of(args_slice(argc, argv)))
}

fn core_table(argc: i32, argv: *const Value) -> Value {
    if argc % 2 != 0 {
        crate::panicf!("expected even number of arguments, got {argc}");
    }
    let t = table::table_create(argc as usize / 2);
    for pair in args_slice(argc, argv).chunks_exact(2) {
        table::table_put(t, pair[0], pair[1]);
    }
    Value::table(t)
}

fn core_get(argc: i32, argv: *const Value) -> Value {
    arity(argc, 2, 3);
    let ds = unsafe { api::arg(argv, 0) };
    let key = unsafe { api::arg(argv, 1) };
    let found = ds.get(key);
    if found.is_nil() && argc == 3 {
        unsafe { api::arg(argv, 2) }
    } else {
        found
    }
}

fn core_put(argc: i32, argv: *const Value) -> Value {
    fixarity(argc, 3);
    let ds = unsafe { api::arg(argv, 0) };
    ds.put(unsafe { api::arg(argv, 1) }, unsafe { api::arg(argv, 2) });
    ds
}

fn core_next(argc: i32, argv: *const Value) -> Value {
    fixarity(argc, 2);
    let ds = unsafe { api::arg(argv, 0) };
    ds.next_key(unsafe { api::arg(argv, 1) })
}

/// Build the core environment table and register its natives.
pub(crate) fn make_core_env(vm: &VmState) -> *mut VTable {
    let env = table::table_new(vm, 16);
    let bindings: &[(&str, crate::value::CFunction)] = &[
        ("type", core_type),
        ("describe", core_describe),
        ("length", core_length),
        ("error", core_error),
        ("gccollect", core_gccollect),
        ("tuple", core_tuple),
        ("array", core_array),
        ("struct", core_struct),
        ("table", core_table),
        ("get", core_get),
        ("put", core_put),
        ("next", core_next),
    ];
    for &(name, f) in bindings {
        table::table_put(env, Value::symbol_from(name.as_bytes()), Value::cfunction(f));
        table::table_put(
            vm.registry.get(),
            Value::cfunction(f),
            Value::symbol_from(name.as_bytes()),
        );
    }
    env
}

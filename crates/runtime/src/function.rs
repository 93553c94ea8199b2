//! Function definitions, captured environments and closures.
//!
//! A [`FuncDef`] is the immutable compiled form: bytecode, constants,
//! nested definitions, the environment-capture map and optional debug
//! metadata. A [`Function`] (closure) pairs a definition with the concrete
//! [`FuncEnv`]s captured when the CLOSURE instruction ran.
//!
//! Environments have two states. On-stack: `offset > 0` is the register
//! base of a live frame in `fiber`, and reads and writes go straight into
//! that fiber's value array. Detached: `offset == 0` and the environment
//! owns its `values` allocation. Popping a frame detaches any environment
//! that referenced it.

use crate::fiber::{FRAME_SIZE, Fiber};
use crate::gc::{self, GcHeader, MemoryKind};
use crate::state::{VmState, with_vm};
use crate::strings::VString;
use crate::value::Value;

/// Flags on a function definition.
pub mod def_flags {
    /// Excess positional arguments pack into a tuple.
    pub const VARARG: u32 = 0x01;
    /// Excess positional arguments pack into a struct of pairs.
    pub const STRUCTARG: u32 = 0x02;
    /// Exactly `arity` arguments are accepted.
    pub const FIX_ARITY: u32 = 0x04;
    pub const HAS_NAME: u32 = 0x08;
    pub const HAS_SOURCE: u32 = 0x10;
    pub const HAS_SOURCEMAP: u32 = 0x20;
    pub const HAS_CLOSURE_BITSET: u32 = 0x40;
}

/// Entry in the environment-capture map meaning "capture the current
/// frame"; any other entry is an index into the parent closure's
/// environments.
pub const ENV_CAPTURE_SELF: i32 = -1;

/// Per-instruction source mapping.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceMapping {
    pub start: i32,
    pub end: i32,
}

// =============================================================================
// FuncDef
// =============================================================================

/// Immutable compiled function record. All payload arrays are owned and
/// freed by the finalizer; constants, nested defs and debug strings are
/// marked as children.
#[repr(C)]
pub struct FuncDef {
    pub(crate) gc: GcHeader,
    pub flags: u32,
    pub slotcount: i32,
    pub arity: i32,
    pub min_arity: i32,
    pub max_arity: i32,
    pub constants: *mut Value,
    pub constants_len: u32,
    pub defs: *mut *mut FuncDef,
    pub defs_len: u32,
    pub environments: *mut i32,
    pub environments_len: u32,
    pub bytecode: *mut u32,
    pub bytecode_len: u32,
    pub closure_bitset: *mut u32,
    pub closure_bitset_len: u32,
    pub sourcemap: *mut SourceMapping,
    pub sourcemap_len: u32,
    pub name: *mut VString,
    pub source: *mut VString,
}

impl FuncDef {
    #[inline(always)]
    pub fn is_vararg(&self) -> bool {
        self.flags & def_flags::VARARG != 0
    }

    #[inline(always)]
    pub fn is_struct_arg(&self) -> bool {
        self.flags & def_flags::STRUCTARG != 0
    }

    pub fn bytecode_words(&self) -> &[u32] {
        unsafe { std::slice::from_raw_parts(self.bytecode, self.bytecode_len as usize) }
    }

    /// Is stack slot `slot` named by the close-over bitset?
    pub fn slot_in_closure_bitset(&self, slot: usize) -> bool {
        if self.flags & def_flags::HAS_CLOSURE_BITSET == 0 {
            // No bitset: conservatively keep everything.
            return true;
        }
        let word = slot / 32;
        if word >= self.closure_bitset_len as usize {
            return false;
        }
        unsafe { *self.closure_bitset.add(word) & (1 << (slot % 32)) != 0 }
    }
}

fn vec_into_payload<T: Copy>(vm: &VmState, items: &[T]) -> *mut T {
    let ptr = gc::alloc_payload::<T>(vm, items.len());
    unsafe {
        std::ptr::copy_nonoverlapping(items.as_ptr(), ptr, items.len());
    }
    ptr
}

/// Builder for function definitions, used by the wire decoder and tests.
pub struct FuncDefBuilder {
    pub slotcount: i32,
    pub arity: i32,
    pub vararg: bool,
    pub struct_arg: bool,
    pub constants: Vec<Value>,
    pub defs: Vec<*mut FuncDef>,
    pub environments: Vec<i32>,
    pub bytecode: Vec<u32>,
    pub closure_bitset: Vec<u32>,
    pub sourcemap: Vec<SourceMapping>,
    pub name: Option<Vec<u8>>,
    pub source: Option<Vec<u8>>,
}

impl FuncDefBuilder {
    pub fn new(arity: i32, slotcount: i32, bytecode: Vec<u32>) -> FuncDefBuilder {
        FuncDefBuilder {
            slotcount,
            arity,
            vararg: false,
            struct_arg: false,
            constants: Vec::new(),
            defs: Vec::new(),
            environments: Vec::new(),
            bytecode,
            closure_bitset: Vec::new(),
            sourcemap: Vec::new(),
            name: None,
            source: None,
        }
    }

    pub fn build(self) -> *mut FuncDef {
        with_vm(|vm| {
            let def = gc::alloc(vm, MemoryKind::FuncDef, std::mem::size_of::<FuncDef>())
                as *mut FuncDef;
            let mut flags = 0u32;
            if self.vararg {
                flags |= def_flags::VARARG;
            } else {
                flags |= def_flags::FIX_ARITY;
            }
            if self.struct_arg {
                flags |= def_flags::STRUCTARG;
            }
            if !self.closure_bitset.is_empty() {
                flags |= def_flags::HAS_CLOSURE_BITSET;
            }
            if !self.sourcemap.is_empty() {
                flags |= def_flags::HAS_SOURCEMAP;
            }
            unsafe {
                (*def).slotcount = self.slotcount.max(self.arity);
                (*def).arity = self.arity;
                (*def).min_arity = self.arity;
                (*def).max_arity = if self.vararg { i32::MAX } else { self.arity };
                (*def).constants = vec_into_payload(vm, &self.constants);
                (*def).constants_len = self.constants.len() as u32;
                (*def).defs = vec_into_payload(vm, &self.defs);
                (*def).defs_len = self.defs.len() as u32;
                (*def).environments = vec_into_payload(vm, &self.environments);
                (*def).environments_len = self.environments.len() as u32;
                (*def).bytecode = vec_into_payload(vm, &self.bytecode);
                (*def).bytecode_len = self.bytecode.len() as u32;
                (*def).closure_bitset = vec_into_payload(vm, &self.closure_bitset);
                (*def).closure_bitset_len = self.closure_bitset.len() as u32;
                (*def).sourcemap = vec_into_payload(vm, &self.sourcemap);
                (*def).sourcemap_len = self.sourcemap.len() as u32;
                if let Some(name) = &self.name {
                    (*def).name = crate::strings::string_new(name);
                    flags |= def_flags::HAS_NAME;
                }
                if let Some(source) = &self.source {
                    (*def).source = crate::strings::string_new(source);
                    flags |= def_flags::HAS_SOURCE;
                }
                (*def).flags = flags;
            }
            def
        })
    }
}

/// Free a definition's owned payload arrays. Called from the sweep phase.
pub(crate) unsafe fn finalize_funcdef(def: *mut FuncDef) {
    unsafe {
        gc::free_payload((*def).constants, (*def).constants_len as usize);
        gc::free_payload((*def).defs, (*def).defs_len as usize);
        gc::free_payload((*def).environments, (*def).environments_len as usize);
        gc::free_payload((*def).bytecode, (*def).bytecode_len as usize);
        gc::free_payload((*def).closure_bitset, (*def).closure_bitset_len as usize);
        gc::free_payload((*def).sourcemap, (*def).sourcemap_len as usize);
    }
}

/// Debug name of a definition, if it carries one.
pub(crate) unsafe fn funcdef_name(def: *mut FuncDef) -> Option<String> {
    unsafe {
        if def.is_null() || (*def).name.is_null() {
            None
        } else {
            Some(String::from_utf8_lossy((*(*def).name).bytes()).into_owned())
        }
    }
}

// =============================================================================
// FuncEnv
// =============================================================================

/// Captured local-variable storage.
#[repr(C)]
pub struct FuncEnv {
    pub(crate) gc: GcHeader,
    pub fiber: *mut Fiber,
    pub values: *mut Value,
    /// Register base of the referencing frame when on-stack; 0 when
    /// detached.
    pub offset: i32,
    pub length: i32,
}

impl FuncEnv {
    #[inline(always)]
    pub fn is_on_stack(&self) -> bool {
        self.offset > 0
    }
}

/// Create an environment referencing a live frame of `fiber`.
pub(crate) fn funcenv_new_onstack(fiber: *mut Fiber, offset: i32, length: i32) -> *mut FuncEnv {
    debug_assert!(offset > 0);
    with_vm(|vm| {
        let env = gc::alloc(vm, MemoryKind::FuncEnv, std::mem::size_of::<FuncEnv>())
            as *mut FuncEnv;
        unsafe {
            (*env).fiber = fiber;
            (*env).values = std::ptr::null_mut();
            (*env).offset = offset;
            (*env).length = length;
        }
        env
    })
}

/// Create a detached environment owning copies of `values`.
pub fn funcenv_detached(values: &[Value]) -> *mut FuncEnv {
    with_vm(|vm| {
        let env = gc::alloc(vm, MemoryKind::FuncEnv, std::mem::size_of::<FuncEnv>())
            as *mut FuncEnv;
        unsafe {
            (*env).fiber = std::ptr::null_mut();
            (*env).values = gc::alloc_payload::<Value>(vm, values.len());
            std::ptr::copy_nonoverlapping(values.as_ptr(), (*env).values, values.len());
            (*env).offset = 0;
            (*env).length = values.len() as i32;
        }
        env
    })
}

/// Migrate an on-stack environment to owned storage. Runs when the
/// referencing frame is popped or replaced by a tail call. `def` is the
/// popped frame's definition, consulted for the close-over bitset so slots
/// that no closure can reach are dropped instead of retained.
pub(crate) unsafe fn funcenv_detach(env: *mut FuncEnv, def: *mut FuncDef) {
    unsafe {
        if env.is_null() || !(*env).is_on_stack() {
            return;
        }
        let length = (*env).length as usize;
        let fiber = (*env).fiber;
        let offset = (*env).offset as usize;
        let values = with_vm(|vm| gc::alloc_payload::<Value>(vm, length));
        std::ptr::copy_nonoverlapping((*fiber).data.add(offset), values, length);
        if !def.is_null() {
            for slot in 0..length {
                if !(*def).slot_in_closure_bitset(slot) {
                    *values.add(slot) = Value::nil();
                }
            }
        }
        (*env).values = values;
        (*env).offset = 0;
        (*env).fiber = std::ptr::null_mut();
    }
}

/// Read a captured slot.
pub(crate) unsafe fn env_read(env: *mut FuncEnv, slot: usize) -> Value {
    unsafe {
        debug_assert!(slot < (*env).length as usize);
        if (*env).is_on_stack() {
            *(*(*env).fiber).data.add((*env).offset as usize + slot)
        } else {
            *(*env).values.add(slot)
        }
    }
}

/// Write a captured slot.
pub(crate) unsafe fn env_write(env: *mut FuncEnv, slot: usize, value: Value) {
    unsafe {
        debug_assert!(slot < (*env).length as usize);
        if (*env).is_on_stack() {
            *(*(*env).fiber).data.add((*env).offset as usize + slot) = value;
        } else {
            *(*env).values.add(slot) = value;
        }
    }
}

/// Confirm an on-stack environment still matches a live frame of its
/// fiber; on mismatch (stale references after fiber surgery) transition to
/// an empty detached environment. Detached environments are always valid.
pub fn funcenv_validate(env: *mut FuncEnv) -> bool {
    unsafe {
        if !(*env).is_on_stack() {
            return true;
        }
        let fiber = (*env).fiber;
        let frame_idx = (*env).offset - FRAME_SIZE as i32;
        let ok = !fiber.is_null()
            && frame_idx >= 0
            && (*fiber).stacktop > 0
            && frame_idx <= (*fiber).frame
            && {
                let frame = crate::fiber::frame_at(fiber, frame_idx);
                !(*frame).func.is_null()
                    && (*(*(*frame).func).def).slotcount == (*env).length
                    && (*frame).env == env
            };
        if !ok {
            (*env).fiber = std::ptr::null_mut();
            (*env).offset = 0;
            (*env).length = 0;
            (*env).values = std::ptr::NonNull::<Value>::dangling().as_ptr();
        }
        ok
    }
}

// =============================================================================
// Function (closure)
// =============================================================================

/// A closure: definition plus captured environments, stored inline.
#[repr(C)]
pub struct Function {
    pub(crate) gc: GcHeader,
    pub def: *mut FuncDef,
    envs: [*mut FuncEnv; 0],
}

impl Function {
    #[inline(always)]
    pub fn env_count(&self) -> usize {
        unsafe { (*self.def).environments_len as usize }
    }

    #[inline(always)]
    pub fn env(&self, index: usize) -> *mut FuncEnv {
        debug_assert!(index < self.env_count());
        unsafe { *self.envs.as_ptr().add(index) }
    }

    #[inline(always)]
    pub(crate) fn set_env(&mut self, index: usize, env: *mut FuncEnv) {
        debug_assert!(index < self.env_count());
        unsafe { *self.envs.as_mut_ptr().add(index) = env }
    }
}

/// Allocate a closure over `def` with all environment slots null; the
/// caller fills them before the closure escapes.
pub fn function_new(def: *mut FuncDef) -> *mut Function {
    with_vm(|vm| {
        let envs = unsafe { (*def).environments_len as usize };
        let size = std::mem::size_of::<Function>() + envs * std::mem::size_of::<*mut FuncEnv>();
        let f = gc::alloc(vm, MemoryKind::Function, size) as *mut Function;
        unsafe {
            (*f).def = def;
        }
        f
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state;
    use vesper_core::{Op, encode_0};

    fn with_rt(f: impl FnOnce()) {
        state::init();
        f();
        state::deinit();
    }

    fn trivial_def() -> *mut FuncDef {
        FuncDefBuilder::new(0, 1, vec![encode_0(Op::ReturnNil)]).build()
    }

    #[test]
    fn test_builder_arity_flags() {
        with_rt(|| {
            let def = trivial_def();
            unsafe {
                assert_eq!((*def).arity, 0);
                assert_eq!((*def).min_arity, 0);
                assert_eq!((*def).max_arity, 0);
                assert!(!(*def).is_vararg());
                assert_eq!((*def).flags & def_flags::FIX_ARITY, def_flags::FIX_ARITY);
            }

            let mut b = FuncDefBuilder::new(2, 4, vec![encode_0(Op::ReturnNil)]);
            b.vararg = true;
            let def = b.build();
            unsafe {
                assert!((*def).is_vararg());
                assert_eq!((*def).min_arity, 2);
                assert_eq!((*def).max_arity, i32::MAX);
            }
        });
    }

    #[test]
    fn test_builder_name_and_constants() {
        with_rt(|| {
            let mut b = FuncDefBuilder::new(0, 1, vec![encode_0(Op::ReturnNil)]);
            b.name = Some(b"my-fn".to_vec());
            b.constants = vec![Value::number(42.0), Value::from_str("k")];
            let def = b.build();
            unsafe {
                assert_eq!(funcdef_name(def).as_deref(), Some("my-fn"));
                assert_eq!((*def).constants_len, 2);
                assert_eq!((*(*def).constants).as_number(), 42.0);
            }
        });
    }

    #[test]
    fn test_detached_env_read_write() {
        with_rt(|| {
            let env = funcenv_detached(&[Value::number(1.0), Value::number(2.0)]);
            unsafe {
                assert!(!(*env).is_on_stack());
                assert_eq!(env_read(env, 0).as_number(), 1.0);
                env_write(env, 1, Value::number(9.0));
                assert_eq!(env_read(env, 1).as_number(), 9.0);
            }
            assert!(funcenv_validate(env));
        });
    }

    #[test]
    fn test_closure_bitset_lookup() {
        with_rt(|| {
            let mut b = FuncDefBuilder::new(0, 40, vec![encode_0(Op::ReturnNil)]);
            b.closure_bitset = vec![0b101, 0b1];
            let def = b.build();
            unsafe {
                assert!((*def).slot_in_closure_bitset(0));
                assert!(!(*def).slot_in_closure_bitset(1));
                assert!((*def).slot_in_closure_bitset(2));
                assert!((*def).slot_in_closure_bitset(32));
                assert!(!(*def).slot_in_closure_bitset(33));
                // Past the bitset means dead.
                assert!(!(*def).slot_in_closure_bitset(64));
            }
            // Without a bitset everything is retained.
            let def = trivial_def();
            unsafe {
                assert!((*def).slot_in_closure_bitset(17));
            }
        });
    }

    #[test]
    fn test_function_env_slots() {
        with_rt(|| {
            let mut b = FuncDefBuilder::new(0, 1, vec![encode_0(Op::ReturnNil)]);
            b.environments = vec![ENV_CAPTURE_SELF, 0];
            let def = b.build();
            let f = function_new(def);
            let env = funcenv_detached(&[Value::nil()]);
            unsafe {
                assert_eq!((*f).env_count(), 2);
                (*f).set_env(0, env);
                (*f).set_env(1, env);
                assert_eq!((*f).env(0), env);
                assert_eq!((*f).env(1), env);
            }
        });
    }
}

//! Fibers: stackless cooperative tasks.
//!
//! A fiber owns one growable `Value` array serving as both operand stack
//! and frame store. A frame is a fixed-size header at index `frame`
//! followed by that call's registers; `stackstart` is where the next
//! call's arguments accumulate and `stacktop` is the high-water mark:
//!
//! ```text
//! 0 ...... frame | header (FRAME_SIZE slots) | registers ... | args... |
//!                                                       stackstart^    ^stacktop
//! ```
//!
//! Frame headers are raw data living in value slots, so the GC walks
//! frames explicitly: header slots get kind-aware treatment (function and
//! environment pointers mark, the pc does not), every other slot below
//! `stacktop` is a live value.

use crate::function::{self, FuncEnv, Function, funcenv_detach};
use crate::gc::{self, GcHeader, MemoryKind};
use crate::signal::{FiberStatus, Signal};
use crate::state::{VmState, with_vm};
use crate::structs;
use crate::tuple;
use crate::value::Value;

/// Non-mask fiber flag: host-owned, cannot be resumed from bytecode.
pub const FIBER_FLAG_ROOT: u32 = 1 << 16;
/// Non-mask fiber flag: next resume re-executes a breakpointed
/// instruction with the breakpoint bit ignored once.
pub const FIBER_FLAG_BREAK_RESUME: u32 = 1 << 17;
/// Non-mask fiber flag: the suspension wrote no destination register, so
/// the next resume input is discarded (interrupt suspensions).
pub const FIBER_FLAG_DISCARD_RESUME: u32 = 1 << 18;
/// Non-mask fiber flag: skip the next auto-suspend checkpoint so a
/// resumed instruction is not immediately re-interrupted.
pub const FIBER_FLAG_SKIP_INTERRUPT: u32 = 1 << 19;

/// Frame header flags.
pub mod frame_flags {
    /// Frame replaced its caller via TAILCALL.
    pub const TAIL: u32 = 1;
    /// Returning from this frame exits the interpreter entrance.
    pub const ENTRANCE: u32 = 2;
    /// Native-call frame: no bytecode, registers are the arguments.
    pub const CFRAME: u32 = 4;
}

/// Fixed-size frame header, stored in value slots.
#[repr(C)]
pub struct StackFrame {
    pub func: *mut Function,
    pub env: *mut FuncEnv,
    pub pc: u32,
    pub prevframe: i32,
    pub flags: u32,
    _pad: u32,
}

/// Header size in value slots.
pub const FRAME_SIZE: usize = {
    let frame = std::mem::size_of::<StackFrame>();
    let value = std::mem::size_of::<Value>();
    (frame + value - 1) / value
};

/// A cooperative task: value stack, frame chain, status and signal mask.
#[repr(C)]
pub struct Fiber {
    pub(crate) gc: GcHeader,
    pub data: *mut Value,
    pub capacity: i32,
    pub frame: i32,
    pub stackstart: i32,
    pub stacktop: i32,
    pub maxstack: i32,
    /// Low bits: which child signals this fiber intercepts on RESUME.
    /// High bits: `FIBER_FLAG_*`.
    pub flags: u32,
    pub status: FiberStatus,
    pub child: *mut Fiber,
    pub last_value: Value,
}

#[inline(always)]
pub(crate) fn frame_at(fiber: *mut Fiber, index: i32) -> *mut StackFrame {
    debug_assert!(index >= 0);
    unsafe { (*fiber).data.add(index as usize) as *mut StackFrame }
}

/// Does this fiber intercept `signal` from its children?
#[inline(always)]
pub fn fiber_intercepts(fiber: *mut Fiber, signal: Signal) -> bool {
    unsafe { (*fiber).flags & signal.mask_bit() != 0 }
}

/// Add `signal` to the fiber's interception mask.
pub fn fiber_mask(fiber: *mut Fiber, signal: Signal) {
    unsafe {
        (*fiber).flags |= signal.mask_bit();
    }
}

// =============================================================================
// Construction
// =============================================================================

fn alloc_stack(vm: &VmState, capacity: usize) -> *mut Value {
    let data = gc::alloc_payload::<Value>(vm, capacity);
    unsafe {
        for i in 0..capacity {
            *data.add(i) = Value::nil();
        }
    }
    data
}

/// Create a fiber over a function or cfunction with preset arguments.
/// Arity is validated here, before the fiber exists to callers.
pub fn fiber_new(callee: Value, capacity: usize, args: &[Value]) -> Result<*mut Fiber, Value> {
    let fiber = with_vm(|vm| {
        let capacity = capacity.clamp(args.len() + FRAME_SIZE + 8, i32::MAX as usize);
        let fiber = gc::alloc(vm, MemoryKind::Fiber, std::mem::size_of::<Fiber>()) as *mut Fiber;
        unsafe {
            (*fiber).data = alloc_stack(vm, capacity);
            (*fiber).capacity = capacity as i32;
            (*fiber).maxstack = vm.default_maxstack.get();
            (*fiber).status = FiberStatus::New;
            (*fiber).child = std::ptr::null_mut();
            (*fiber).last_value = Value::nil();
        }
        vm.stats.fibers_created.set(vm.stats.fibers_created.get() + 1);
        crate::diagnostics::TOTAL_FIBERS.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        fiber
    });
    unsafe { fiber_setup(fiber, callee, args)? };
    Ok(fiber)
}

/// Reuse a finished or fresh fiber for a new callee. Keeps the signal
/// mask and stack allocation.
pub fn fiber_reset(fiber: *mut Fiber, callee: Value, args: &[Value]) -> Result<(), Value> {
    unsafe {
        (*fiber).frame = 0;
        (*fiber).stackstart = 0;
        (*fiber).stacktop = 0;
        (*fiber).child = std::ptr::null_mut();
        (*fiber).last_value = Value::nil();
        (*fiber).flags &=
            !(FIBER_FLAG_BREAK_RESUME | FIBER_FLAG_DISCARD_RESUME | FIBER_FLAG_SKIP_INTERRUPT);
        (*fiber).status = FiberStatus::New;
        fiber_setup(fiber, callee, args)
    }
}

unsafe fn fiber_setup(fiber: *mut Fiber, callee: Value, args: &[Value]) -> Result<(), Value> {
    unsafe {
        push_values(fiber, args);
        match callee.kind() {
            vesper_core::Kind::Function => {
                func_frame(fiber, callee.function_ptr())?;
                let frame = frame_at(fiber, (*fiber).frame);
                (*frame).flags |= frame_flags::ENTRANCE;
                Ok(())
            }
            vesper_core::Kind::CFunction => {
                // The cfunction runs on first resume; until then the frame
                // just holds the arguments.
                cfunc_frame(fiber);
                let frame = frame_at(fiber, (*fiber).frame);
                (*frame).flags |= frame_flags::ENTRANCE;
                (*fiber).last_value = callee;
                Ok(())
            }
            kind => Err(Value::from_str(&format!(
                "expected function or cfunction, got {}",
                kind.name()
            ))),
        }
    }
}

// =============================================================================
// Stack growth and pushes
// =============================================================================

unsafe fn fiber_grow(fiber: *mut Fiber, needed: usize) {
    unsafe {
        if needed <= (*fiber).capacity as usize {
            return;
        }
        let mut new_cap = std::cmp::max(16, (*fiber).capacity as usize);
        while new_cap < needed {
            new_cap = std::cmp::min(new_cap.saturating_mul(2), i32::MAX as usize);
        }
        with_vm(|vm| {
            let new_data = alloc_stack(vm, new_cap);
            std::ptr::copy_nonoverlapping((*fiber).data, new_data, (*fiber).stacktop as usize);
            gc::free_payload((*fiber).data, (*fiber).capacity as usize);
            (*fiber).data = new_data;
            (*fiber).capacity = new_cap as i32;
        });
    }
}

/// Append one outgoing argument at `stacktop`.
pub fn fiber_push(fiber: *mut Fiber, value: Value) {
    unsafe {
        let top = (*fiber).stacktop as usize;
        if top + 1 > (*fiber).maxstack as usize {
            crate::state::vm_panic(Value::from_str("stack overflow"));
        }
        fiber_grow(fiber, top + 1);
        *(*fiber).data.add(top) = value;
        (*fiber).stacktop = (top + 1) as i32;
    }
}

/// Append several outgoing arguments.
pub fn push_values(fiber: *mut Fiber, values: &[Value]) {
    unsafe {
        let top = (*fiber).stacktop as usize;
        if top + values.len() > (*fiber).maxstack as usize {
            crate::state::vm_panic(Value::from_str("stack overflow"));
        }
        fiber_grow(fiber, top + values.len());
        for (i, &v) in values.iter().enumerate() {
            *(*fiber).data.add(top + i) = v;
        }
        (*fiber).stacktop = (top + values.len()) as i32;
    }
}

// =============================================================================
// Frame push / replace / pop
// =============================================================================

fn arity_error(func: *mut Function, argc: usize) -> Value {
    unsafe {
        let def = (*func).def;
        let display = match function::funcdef_name(def) {
            Some(name) => format!("<function {name}>"),
            None => "<function anonymous>".to_string(),
        };
        let expected = if (*def).is_vararg() {
            format!("at least {}", (*def).min_arity)
        } else {
            format!("{}", (*def).arity)
        };
        Value::from_str(&format!(
            "{display} called with {argc} arguments, expected {expected}"
        ))
    }
}

/// Pack excess positional arguments for vararg and struct-arg functions.
/// The arguments live at `reg_base` and are already GC-reachable.
unsafe fn pack_excess_args(
    fiber: *mut Fiber,
    reg_base: usize,
    argc: usize,
    def: *mut crate::function::FuncDef,
) -> Result<(), Value> {
    unsafe {
        let arity = (*def).arity as usize;
        let rest = argc.saturating_sub(arity);
        if (*def).is_struct_arg() {
            if rest % 2 != 0 {
                return Err(Value::from_str("expected an even number of keyword arguments"));
            }
            let st = structs::struct_begin(rest / 2);
            for i in (0..rest).step_by(2) {
                structs::struct_put(
                    st,
                    *(*fiber).data.add(reg_base + arity + i),
                    *(*fiber).data.add(reg_base + arity + i + 1),
                );
            }
            let st = structs::struct_end(st);
            *(*fiber).data.add(reg_base + arity) = Value::structure(st);
        } else {
            let items: Vec<Value> = (0..rest)
                .map(|i| *(*fiber).data.add(reg_base + arity + i))
                .collect();
            let t = tuple::tuple_of(&items);
            *(*fiber).data.add(reg_base + arity) = Value::tuple(t);
        }
        // Clear the consumed slots above the rest parameter.
        for i in (arity + 1)..argc {
            if i < (*def).slotcount as usize {
                *(*fiber).data.add(reg_base + i) = Value::nil();
            }
        }
        Ok(())
    }
}

/// Push a function frame consuming the pending argument region.
pub(crate) unsafe fn func_frame(fiber: *mut Fiber, func: *mut Function) -> Result<(), Value> {
    unsafe {
        let def = (*func).def;
        let argc = ((*fiber).stacktop - (*fiber).stackstart) as usize;

        // Validate arity before any frame state changes.
        let argc_i = argc as i32;
        if argc_i < (*def).min_arity || argc_i > (*def).max_arity {
            return Err(arity_error(func, argc));
        }

        let frame_new = (*fiber).stackstart as usize;
        let reg_base = frame_new + FRAME_SIZE;
        let slots = (*def).slotcount as usize;
        let next_top = reg_base + std::cmp::max(slots, argc);
        if next_top > (*fiber).maxstack as usize {
            return Err(Value::from_str("stack overflow"));
        }
        fiber_grow(fiber, next_top);

        // Shift arguments up past the header, then nil the fresh register
        // slots for GC correctness.
        std::ptr::copy(
            (*fiber).data.add(frame_new),
            (*fiber).data.add(reg_base),
            argc,
        );
        for i in argc..slots {
            *(*fiber).data.add(reg_base + i) = Value::nil();
        }

        if (*def).is_vararg() || (*def).is_struct_arg() {
            pack_excess_args(fiber, reg_base, argc, def)?;
        }

        let frame = (*fiber).data.add(frame_new) as *mut StackFrame;
        (*frame).func = func;
        (*frame).env = std::ptr::null_mut();
        (*frame).pc = 0;
        (*frame).prevframe = (*fiber).frame;
        (*frame).flags = 0;

        (*fiber).frame = frame_new as i32;
        (*fiber).stackstart = (reg_base + slots) as i32;
        (*fiber).stacktop = (reg_base + slots) as i32;
        Ok(())
    }
}

/// Replace the current frame in place (tail call): the caller's captured
/// environment detaches first, then the argument region slides down to the
/// caller's base.
pub(crate) unsafe fn tail_frame(fiber: *mut Fiber, func: *mut Function) -> Result<(), Value> {
    unsafe {
        let def = (*func).def;
        let argc = ((*fiber).stacktop - (*fiber).stackstart) as usize;

        let argc_i = argc as i32;
        if argc_i < (*def).min_arity || argc_i > (*def).max_arity {
            return Err(arity_error(func, argc));
        }

        let frame_idx = (*fiber).frame;
        let frame = frame_at(fiber, frame_idx);
        let old_flags = (*frame).flags;
        let old_func = (*frame).func;
        if !(*frame).env.is_null() {
            let old_def = if old_func.is_null() { std::ptr::null_mut() } else { (*old_func).def };
            funcenv_detach((*frame).env, old_def);
            (*frame).env = std::ptr::null_mut();
        }

        let reg_base = frame_idx as usize + FRAME_SIZE;
        let slots = (*def).slotcount as usize;
        let next_top = reg_base + std::cmp::max(slots, argc);
        if next_top > (*fiber).maxstack as usize {
            return Err(Value::from_str("stack overflow"));
        }
        fiber_grow(fiber, next_top);

        std::ptr::copy(
            (*fiber).data.add((*fiber).stackstart as usize),
            (*fiber).data.add(reg_base),
            argc,
        );
        for i in argc..slots {
            *(*fiber).data.add(reg_base + i) = Value::nil();
        }

        if (*def).is_vararg() || (*def).is_struct_arg() {
            pack_excess_args(fiber, reg_base, argc, def)?;
        }

        let frame = frame_at(fiber, frame_idx);
        (*frame).func = func;
        (*frame).pc = 0;
        (*frame).flags = frame_flags::TAIL | (old_flags & frame_flags::ENTRANCE);

        (*fiber).stackstart = (reg_base + slots) as i32;
        (*fiber).stacktop = (reg_base + slots) as i32;
        Ok(())
    }
}

/// Push a native-call frame around the pending arguments. Returns the
/// argument base pointer and count.
pub(crate) unsafe fn cfunc_frame(fiber: *mut Fiber) -> (*mut Value, i32) {
    unsafe {
        let argc = ((*fiber).stacktop - (*fiber).stackstart) as usize;
        let frame_new = (*fiber).stackstart as usize;
        let reg_base = frame_new + FRAME_SIZE;
        let next_top = reg_base + argc;
        if next_top > (*fiber).maxstack as usize {
            crate::state::vm_panic(Value::from_str("stack overflow"));
        }
        fiber_grow(fiber, next_top);

        std::ptr::copy(
            (*fiber).data.add(frame_new),
            (*fiber).data.add(reg_base),
            argc,
        );

        let frame = (*fiber).data.add(frame_new) as *mut StackFrame;
        (*frame).func = std::ptr::null_mut();
        (*frame).env = std::ptr::null_mut();
        (*frame).pc = 0;
        (*frame).prevframe = (*fiber).frame;
        (*frame).flags = frame_flags::CFRAME;

        (*fiber).frame = frame_new as i32;
        (*fiber).stackstart = next_top as i32;
        (*fiber).stacktop = next_top as i32;
        ((*fiber).data.add(reg_base), argc as i32)
    }
}

/// Pop the current frame: detach its captured environment, then restore
/// the caller's window.
pub(crate) unsafe fn pop_frame(fiber: *mut Fiber) {
    unsafe {
        let frame_idx = (*fiber).frame;
        let frame = frame_at(fiber, frame_idx);
        if !(*frame).env.is_null() {
            let def = if (*frame).func.is_null() {
                std::ptr::null_mut()
            } else {
                (*(*frame).func).def
            };
            funcenv_detach((*frame).env, def);
            (*frame).env = std::ptr::null_mut();
        }
        (*fiber).stacktop = frame_idx;
        (*fiber).stackstart = frame_idx;
        (*fiber).frame = (*frame).prevframe;
    }
}

// =============================================================================
// GC marking
// =============================================================================

/// Mark a fiber's reachable portion: value slots below `stacktop` except
/// frame headers, which contribute their function and environment
/// pointers.
pub(crate) fn mark_fiber(vm: &VmState, fiber: *mut Fiber) {
    unsafe {
        gc::mark_ptr(vm, (*fiber).child as *mut GcHeader);
        gc::mark_value(vm, (*fiber).last_value);
        if (*fiber).stacktop <= 0 {
            return;
        }
        let mut upper = (*fiber).stacktop as usize;
        let mut frame_idx = (*fiber).frame;
        loop {
            let frame = frame_at(fiber, frame_idx);
            gc::mark_ptr(vm, (*frame).func as *mut GcHeader);
            gc::mark_ptr(vm, (*frame).env as *mut GcHeader);
            let reg_base = frame_idx as usize + FRAME_SIZE;
            for i in reg_base..upper {
                gc::mark_value(vm, *(*fiber).data.add(i));
            }
            if frame_idx == 0 {
                break;
            }
            upper = frame_idx as usize;
            frame_idx = (*frame).prevframe;
        }
    }
}

// =============================================================================
// Status access
// =============================================================================

pub fn fiber_status(fiber: *mut Fiber) -> FiberStatus {
    unsafe { (*fiber).status }
}

pub(crate) fn set_fiber_status(fiber: *mut Fiber, status: FiberStatus) {
    unsafe {
        (*fiber).status = status;
    }
}

/// True if `continue` may run this fiber right now.
pub fn fiber_can_resume(fiber: *mut Fiber) -> bool {
    unsafe { (*fiber).status.is_resumable() && (*fiber).flags & FIBER_FLAG_ROOT == 0 }
}

/// Mark or unmark a fiber as host-owned. Root-marked fibers refuse
/// resumption, from bytecode and from the host API alike, until unmarked.
pub fn fiber_set_root(fiber: *mut Fiber, on: bool) {
    unsafe {
        if on {
            (*fiber).flags |= FIBER_FLAG_ROOT;
        } else {
            (*fiber).flags &= !FIBER_FLAG_ROOT;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function::FuncDefBuilder;
    use crate::state;
    use vesper_core::{Op, encode_0};

    fn with_rt(f: impl FnOnce()) {
        state::init();
        f();
        state::deinit();
    }

    fn make_function(arity: i32, slotcount: i32, vararg: bool) -> Value {
        let mut b = FuncDefBuilder::new(arity, slotcount, vec![encode_0(Op::ReturnNil)]);
        b.vararg = vararg;
        Value::function(crate::function::function_new(b.build()))
    }

    #[test]
    fn test_frame_size_covers_header() {
        assert!(FRAME_SIZE * std::mem::size_of::<Value>() >= std::mem::size_of::<StackFrame>());
    }

    #[test]
    fn test_new_fiber_layout() {
        with_rt(|| {
            let f = make_function(2, 4, false);
            let fiber =
                fiber_new(f, 64, &[Value::number(1.0), Value::number(2.0)]).expect("fiber");
            unsafe {
                assert_eq!((*fiber).status, FiberStatus::New);
                assert_eq!((*fiber).frame, 0);
                let expected_top = (FRAME_SIZE + 4) as i32;
                assert_eq!((*fiber).stacktop, expected_top);
                assert_eq!((*fiber).stackstart, expected_top);
                // Arguments landed in the first two registers.
                let reg_base = FRAME_SIZE;
                assert_eq!((*(*fiber).data.add(reg_base)).as_number(), 1.0);
                assert_eq!((*(*fiber).data.add(reg_base + 1)).as_number(), 2.0);
                // Remaining registers are nil.
                assert!((*(*fiber).data.add(reg_base + 2)).is_nil());
                let frame = frame_at(fiber, 0);
                assert_eq!((*frame).prevframe, 0);
                assert_ne!((*frame).flags & frame_flags::ENTRANCE, 0);
            }
        });
    }

    #[test]
    fn test_arity_rejected_before_mutation() {
        with_rt(|| {
            let f = make_function(2, 4, false);
            let err = fiber_new(f, 64, &[Value::number(1.0)]).unwrap_err();
            let msg = String::from_utf8_lossy(err.as_bytes()).into_owned();
            assert!(msg.contains("called with 1 arguments, expected 2"), "{msg}");
        });
    }

    #[test]
    fn test_vararg_packs_tuple() {
        with_rt(|| {
            let f = make_function(1, 3, true);
            let fiber = fiber_new(
                f,
                64,
                &[Value::number(0.0), Value::number(1.0), Value::number(2.0)],
            )
            .expect("fiber");
            unsafe {
                let rest = *(*fiber).data.add(FRAME_SIZE + 1);
                assert_eq!(rest.kind(), vesper_core::Kind::Tuple);
                let t = rest.tuple_ptr();
                assert_eq!((*t).length, 2);
                assert_eq!((*t).get(0).as_number(), 1.0);
                assert_eq!((*t).get(1).as_number(), 2.0);
            }
        });
    }

    #[test]
    fn test_vararg_empty_tuple() {
        with_rt(|| {
            let f = make_function(0, 2, true);
            let fiber = fiber_new(f, 64, &[]).expect("fiber");
            unsafe {
                let rest = *(*fiber).data.add(FRAME_SIZE);
                assert_eq!(rest.kind(), vesper_core::Kind::Tuple);
                assert_eq!((*rest.tuple_ptr()).length, 0);
            }
        });
    }

    #[test]
    fn test_frame_push_and_pop() {
        with_rt(|| {
            let outer = make_function(0, 2, false);
            let inner = make_function(0, 3, false);
            let fiber = fiber_new(outer, 64, &[]).expect("fiber");
            unsafe {
                let first_frame = (*fiber).frame;
                let first_top = (*fiber).stacktop;
                func_frame(fiber, inner.function_ptr()).expect("push");
                assert_eq!((*fiber).frame, first_top);
                assert!((*fiber).stacktop > first_top);
                let frame = frame_at(fiber, (*fiber).frame);
                assert_eq!((*frame).prevframe, first_frame);
                pop_frame(fiber);
                assert_eq!((*fiber).frame, first_frame);
                assert_eq!((*fiber).stacktop, first_top);
                assert_eq!((*fiber).stackstart, first_top);
            }
        });
    }

    #[test]
    fn test_stack_overflow_detected() {
        with_rt(|| {
            let f = make_function(0, 32, false);
            let fiber = fiber_new(f, 64, &[]).expect("fiber");
            unsafe {
                (*fiber).maxstack = 100;
                let inner = make_function(0, 64, false);
                let err = func_frame(fiber, inner.function_ptr()).unwrap_err();
                assert_eq!(err.as_bytes(), b"stack overflow");
            }
        });
    }

    #[test]
    fn test_tail_frame_replaces_in_place() {
        with_rt(|| {
            let outer = make_function(0, 2, false);
            let next = make_function(1, 2, false);
            let fiber = fiber_new(outer, 64, &[]).expect("fiber");
            unsafe {
                let frame_idx = (*fiber).frame;
                fiber_push(fiber, Value::number(7.0));
                tail_frame(fiber, next.function_ptr()).expect("tail");
                // Same frame index, new function, argument in register 0.
                assert_eq!((*fiber).frame, frame_idx);
                let frame = frame_at(fiber, frame_idx);
                assert_eq!((*frame).func, next.function_ptr());
                assert_ne!((*frame).flags & frame_flags::TAIL, 0);
                assert_ne!((*frame).flags & frame_flags::ENTRANCE, 0);
                assert_eq!((*(*fiber).data.add(frame_idx as usize + FRAME_SIZE)).as_number(), 7.0);
            }
        });
    }

    #[test]
    fn test_stack_growth_preserves_contents() {
        with_rt(|| {
            let f = make_function(0, 2, false);
            let fiber = fiber_new(f, 0, &[]).expect("fiber");
            unsafe {
                let base = (*fiber).stacktop;
                for i in 0..500 {
                    fiber_push(fiber, Value::number(f64::from(i)));
                }
                for i in 0..500 {
                    let v = *(*fiber).data.add((base + i) as usize);
                    assert_eq!(v.as_number(), f64::from(i));
                }
            }
        });
    }

    #[test]
    fn test_fiber_reset_reuses_allocation() {
        with_rt(|| {
            let f = make_function(0, 2, false);
            let fiber = fiber_new(f, 64, &[]).expect("fiber");
            unsafe {
                (*fiber).status = FiberStatus::Dead;
            }
            let g = make_function(1, 2, false);
            fiber_reset(fiber, g, &[Value::number(5.0)]).expect("reset");
            unsafe {
                assert_eq!((*fiber).status, FiberStatus::New);
                assert_eq!((*(*fiber).data.add(FRAME_SIZE)).as_number(), 5.0);
            }
        });
    }

    #[test]
    fn test_mask_bits() {
        with_rt(|| {
            let f = make_function(0, 2, false);
            let fiber = fiber_new(f, 64, &[]).expect("fiber");
            assert!(!fiber_intercepts(fiber, Signal::Yield));
            fiber_mask(fiber, Signal::Yield);
            assert!(fiber_intercepts(fiber, Signal::Yield));
            assert!(!fiber_intercepts(fiber, Signal::Error));
        });
    }
}

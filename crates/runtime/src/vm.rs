//! The bytecode interpreter and fiber scheduler.
//!
//! One dispatch loop executes 32-bit instruction words against the current
//! fiber's register window. Function calls push frames on the same fiber;
//! RESUME descends into a child fiber by recursing into [`continue_with`]
//! under the recursion guard. Signals leave the loop by returning; errors
//! raised from native code unwind via the panic transport and are caught
//! at the entrance installed here.
//!
//! The loop keeps four locals per active frame: the frame index, the
//! running closure, its definition and the program counter. Register
//! access always re-derives the data pointer from the fiber, because any
//! push can grow (and move) the stack. `frame.pc` is kept pointing at the
//! next instruction so returns, resume-value writes and stack traces can
//! re-decode the call site at `pc - 1`.

use std::panic::{AssertUnwindSafe, catch_unwind};

use crate::api;
use crate::array;
use crate::buffer;
use crate::fiber::{
    FIBER_FLAG_BREAK_RESUME, FIBER_FLAG_DISCARD_RESUME, FIBER_FLAG_SKIP_INTERRUPT, FRAME_SIZE,
    Fiber, cfunc_frame, fiber_can_resume, fiber_intercepts, fiber_push, frame_at, frame_flags,
    func_frame, pop_frame, set_fiber_status, tail_frame,
};
use crate::function::{ENV_CAPTURE_SELF, env_read, env_write, funcenv_new_onstack, function_new};
use crate::signal::{FiberStatus, Signal};
use crate::state::{
    PanicToken, RECURSION_GUARD, VmState, format_panic_payload, take_panic_payload, with_vm,
};
use crate::structs;
use crate::table;
use crate::tuple;
use crate::value::Value;
use vesper_core::{
    Kind, Op, decode_a, decode_b, decode_c, decode_cs, decode_d, decode_ds, decode_e, decode_es,
    decode_op, has_breakpoint,
};

/// Resume (or start) a fiber with an input value. Returns the signal that
/// ended the run; the accompanying value lands in `out`.
pub fn continue_fiber(fiber: *mut Fiber, input: Value, out: &mut Value) -> Signal {
    with_vm(|vm| {
        let sig = continue_with(vm, fiber, input, None);
        *out = vm.return_reg.get();
        sig
    })
}

/// Resume a fiber by injecting an ERROR signal at its suspension point.
pub fn cancel_fiber(fiber: *mut Fiber, error: Value, out: &mut Value) -> Signal {
    with_vm(|vm| {
        let sig = continue_with(vm, fiber, Value::nil(), Some(error));
        *out = vm.return_reg.get();
        sig
    })
}

/// Core resume logic, shared by the host API and the RESUME/CANCEL
/// instructions. `injected` carries a cancellation error.
pub(crate) fn continue_with(
    vm: &VmState,
    fiber: *mut Fiber,
    mut input: Value,
    mut injected: Option<Value>,
) -> Signal {
    unsafe {
        // A live child must be driven to completion (or to a signal this
        // fiber does not intercept) before the fiber itself can continue.
        let child = (*fiber).child;
        if !child.is_null() && fiber_can_resume(child) {
            let sig = continue_with(vm, child, input, injected.take());
            if sig != Signal::Ok && !fiber_intercepts(fiber, sig) {
                return sig;
            }
            (*fiber).child = std::ptr::null_mut();
            input = vm.return_reg.get();
        }

        if !fiber_can_resume(fiber) {
            let msg = if (*fiber).flags & crate::fiber::FIBER_FLAG_ROOT != 0 {
                Value::from_str("cannot resume root fiber")
            } else {
                Value::from_str(&format!(
                    "cannot resume fiber with status {}",
                    (*fiber).status.name()
                ))
            };
            vm.return_reg.set(msg);
            return Signal::Error;
        }
        if vm.stack_depth.get() >= RECURSION_GUARD {
            vm.return_reg.set(Value::from_str("recursed too deeply"));
            return Signal::Error;
        }

        let old_status = (*fiber).status;
        // Depth is restored, not decremented, after the protected scope:
        // an unwinding error skips the decrements of any nested entrances.
        let saved_depth = vm.stack_depth.get();
        vm.stack_depth.set(saved_depth + 1);
        let prev_fiber = vm.fiber.get();
        vm.fiber.set(fiber);
        let owns_root = vm.root_fiber.get().is_null();
        if owns_root {
            vm.root_fiber.set(fiber);
        }
        set_fiber_status(fiber, FiberStatus::Alive);

        // Protected scope: vm_panic and foreign host panics both become
        // ERROR signals here.
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            run_resumed(vm, fiber, input, old_status, injected)
        }));
        let sig = match outcome {
            Ok(sig) => sig,
            Err(payload) => {
                let value = if payload.downcast_ref::<PanicToken>().is_some() {
                    take_panic_payload()
                } else {
                    Value::from_str(&format_panic_payload(&payload))
                };
                vm.return_reg.set(value);
                Signal::Error
            }
        };

        set_fiber_status(fiber, FiberStatus::from_signal(sig));
        (*fiber).last_value = vm.return_reg.get();
        vm.fiber.set(prev_fiber);
        if owns_root {
            vm.root_fiber.set(std::ptr::null_mut());
        }
        vm.stack_depth.set(saved_depth);
        sig
    }
}

/// Prepare the resume point for the fiber's previous status, then enter
/// the dispatch loop.
unsafe fn run_resumed(
    vm: &VmState,
    fiber: *mut Fiber,
    input: Value,
    old_status: FiberStatus,
    injected: Option<Value>,
) -> Signal {
    unsafe {
        match old_status {
            FiberStatus::New => {
                // First resume: the input value is discarded by convention;
                // arguments reach the function through fiber construction.
                let frame = frame_at(fiber, (*fiber).frame);
                if (*frame).flags & frame_flags::CFRAME != 0 {
                    // Fiber rooted at a native function: invoke it directly.
                    if let Some(err) = injected {
                        vm.return_reg.set(err);
                        return Signal::Error;
                    }
                    let cfun = (*fiber).last_value.cfunction_ptr();
                    let reg_base = (*fiber).frame as usize + FRAME_SIZE;
                    let argc = (*fiber).stackstart as usize - reg_base;
                    let argv = (*fiber).data.add(reg_base);
                    let ret = cfun(argc as i32, argv);
                    pop_frame(fiber);
                    vm.return_reg.set(ret);
                    return Signal::Ok;
                }
                run_vm(vm, fiber, injected)
            }
            FiberStatus::Debug => {
                // Re-execute the trapped instruction with the breakpoint
                // bit ignored once. The resume input is discarded. The
                // skip flag is only armed when the pending instruction
                // still carries the bit, so stepping onto a clean
                // instruction does not blow through the next trap.
                let frame = frame_at(fiber, (*fiber).frame);
                if !(*frame).func.is_null() {
                    let def = (*(*frame).func).def;
                    let pc = (*frame).pc as usize;
                    if pc < (*def).bytecode_len as usize
                        && has_breakpoint(*(*def).bytecode.add(pc))
                    {
                        (*fiber).flags |= FIBER_FLAG_BREAK_RESUME;
                    }
                }
                run_vm(vm, fiber, injected)
            }
            _ => {
                // Pending or user-suspended: the suspending instruction is
                // at pc-1; its A operand receives the resume value.
                if (*fiber).flags & FIBER_FLAG_DISCARD_RESUME != 0 {
                    (*fiber).flags &= !FIBER_FLAG_DISCARD_RESUME;
                } else if injected.is_none() {
                    let frame = frame_at(fiber, (*fiber).frame);
                    let def = (*(*frame).func).def;
                    let instr = *(*def).bytecode.add((*frame).pc as usize - 1);
                    let dest = decode_a(instr) as usize;
                    let reg_base = (*fiber).frame as usize + FRAME_SIZE;
                    *(*fiber).data.add(reg_base + dest) = input;
                }
                run_vm(vm, fiber, injected)
            }
        }
    }
}

// =============================================================================
// Dispatch loop
// =============================================================================

#[allow(clippy::too_many_lines)]
pub(crate) unsafe fn run_vm(
    vm: &VmState,
    fiber: *mut Fiber,
    mut pending_error: Option<Value>,
) -> Signal {
    unsafe {
        let mut frame_idx = (*fiber).frame;
        let mut func = (*frame_at(fiber, frame_idx)).func;
        debug_assert!(!func.is_null(), "run_vm entered on a native frame");
        let mut def = (*func).def;
        let mut code = (*def).bytecode;
        let mut pc = (*frame_at(fiber, frame_idx)).pc as usize;

        // Register access recomputes the base pointer every time: pushes
        // can grow and move the fiber stack.
        macro_rules! reg {
            ($i:expr) => {
                *(*fiber)
                    .data
                    .add(frame_idx as usize + FRAME_SIZE + ($i) as usize)
            };
        }
        macro_rules! frameref {
            () => {
                frame_at(fiber, frame_idx)
            };
        }
        macro_rules! raise {
            ($value:expr) => {{
                let value: Value = $value;
                vm.return_reg.set(value);
                (*fiber).last_value = value;
                return Signal::Error;
            }};
        }
        macro_rules! raisef {
            ($($arg:tt)*) => {
                raise!(Value::from_str(&format!($($arg)*)))
            };
        }
        // Reload cached locals after a frame push, pop or tail call.
        macro_rules! load_frame {
            () => {{
                frame_idx = (*fiber).frame;
                func = (*frameref!()).func;
                def = (*func).def;
                code = (*def).bytecode;
                pc = (*frameref!()).pc as usize;
            }};
        }
        // Pop the current frame and deliver `$val` to the caller, or exit
        // the entrance.
        macro_rules! vm_return {
            ($val:expr) => {{
                let retval: Value = $val;
                let flags = (*frameref!()).flags;
                pop_frame(fiber);
                if flags & frame_flags::ENTRANCE != 0 {
                    vm.return_reg.set(retval);
                    (*fiber).last_value = retval;
                    return Signal::Ok;
                }
                load_frame!();
                let call_instr = *code.add(pc - 1);
                reg!(decode_a(call_instr)) = retval;
                continue;
            }};
        }
        // Suspend with INTERRUPT before a backward jump or call when
        // auto-suspend is on. The instruction re-executes on resume.
        macro_rules! interrupt_check {
            () => {
                if vm.auto_suspend.get() {
                    if (*fiber).flags & FIBER_FLAG_SKIP_INTERRUPT != 0 {
                        (*fiber).flags &= !FIBER_FLAG_SKIP_INTERRUPT;
                    } else {
                        (*fiber).flags |=
                            FIBER_FLAG_DISCARD_RESUME | FIBER_FLAG_SKIP_INTERRUPT;
                        (*frameref!()).pc = (pc - 1) as u32;
                        vm.return_reg.set(Value::nil());
                        return Signal::Interrupt;
                    }
                }
            };
        }

        loop {
            if let Some(err) = pending_error.take() {
                raise!(err);
            }

            // Opportunistic collection between instructions.
            if vm.gc_lock.get() == 0 && vm.next_collection.get() >= vm.gc_interval.get() {
                (*frameref!()).pc = pc as u32;
                crate::gc::collect_vm(vm);
            }

            if pc >= (*def).bytecode_len as usize {
                raisef!("program counter {pc} out of bounds");
            }
            let instr = *code.add(pc);

            if has_breakpoint(instr) {
                if (*fiber).flags & FIBER_FLAG_BREAK_RESUME != 0 {
                    (*fiber).flags &= !FIBER_FLAG_BREAK_RESUME;
                } else {
                    (*frameref!()).pc = pc as u32;
                    vm.return_reg.set(Value::nil());
                    return Signal::Debug;
                }
            }

            pc += 1;
            (*frameref!()).pc = pc as u32;

            let Some(op) = Op::from_u8(decode_op(instr)) else {
                raisef!("unknown opcode 0x{:02x}", decode_op(instr));
            };

            match op {
                Op::Noop => {}

                // ---------------------------------------------------------
                // Constants and moves
                // ---------------------------------------------------------
                Op::LoadNil => reg!(decode_d(instr)) = Value::nil(),
                Op::LoadTrue => reg!(decode_d(instr)) = Value::boolean(true),
                Op::LoadFalse => reg!(decode_d(instr)) = Value::boolean(false),
                Op::LoadInteger => {
                    reg!(decode_a(instr)) = Value::number(f64::from(decode_es(instr)));
                }
                Op::LoadConstant => {
                    let idx = decode_e(instr);
                    if idx >= (*def).constants_len {
                        raisef!("invalid constant index {idx}");
                    }
                    reg!(decode_a(instr)) = *(*def).constants.add(idx as usize);
                }
                Op::LoadSelf => reg!(decode_d(instr)) = Value::function(func),
                Op::MoveNear => reg!(decode_a(instr)) = reg!(decode_e(instr)),
                Op::MoveFar => reg!(decode_e(instr)) = reg!(decode_a(instr)),

                // ---------------------------------------------------------
                // Upvalues
                // ---------------------------------------------------------
                Op::LoadUpvalue | Op::SetUpvalue => {
                    let a = decode_a(instr);
                    let env_idx = decode_b(instr) as usize;
                    let slot = decode_c(instr) as usize;
                    if env_idx >= (*func).env_count() {
                        raisef!("invalid environment index {env_idx}");
                    }
                    let env = (*func).env(env_idx);
                    if slot >= (*env).length as usize {
                        raisef!("invalid environment slot {slot}");
                    }
                    if op == Op::LoadUpvalue {
                        reg!(a) = env_read(env, slot);
                    } else {
                        env_write(env, slot, reg!(a));
                    }
                }

                // ---------------------------------------------------------
                // Arithmetic
                // ---------------------------------------------------------
                Op::Add | Op::Subtract | Op::Multiply | Op::Divide | Op::DivideFloor
                | Op::Modulo | Op::Remainder => {
                    let lhs = reg!(decode_b(instr));
                    let rhs = reg!(decode_c(instr));
                    reg!(decode_a(instr)) = arith(vm, op, lhs, rhs);
                }
                Op::AddImmediate | Op::SubtractImmediate | Op::MultiplyImmediate
                | Op::DivideImmediate | Op::DivideFloorImmediate | Op::ModuloImmediate
                | Op::RemainderImmediate => {
                    let lhs = reg!(decode_b(instr));
                    let rhs = Value::number(f64::from(decode_cs(instr)));
                    reg!(decode_a(instr)) = arith(vm, immediate_base(op), lhs, rhs);
                }

                // ---------------------------------------------------------
                // Bitwise (32-bit integer domain)
                // ---------------------------------------------------------
                Op::BitAnd | Op::BitOr | Op::BitXor | Op::ShiftLeft | Op::ShiftRight
                | Op::ShiftRightUnsigned => {
                    let lhs = int32_operand(reg!(decode_b(instr)));
                    let rhs = int32_operand(reg!(decode_c(instr)));
                    reg!(decode_a(instr)) = bitop(op, lhs, rhs);
                }
                Op::BitAndImmediate | Op::BitOrImmediate | Op::BitXorImmediate
                | Op::ShiftLeftImmediate | Op::ShiftRightImmediate
                | Op::ShiftRightUnsignedImmediate => {
                    let lhs = int32_operand(reg!(decode_b(instr)));
                    let rhs = decode_cs(instr);
                    reg!(decode_a(instr)) = bitop(immediate_base(op), lhs, rhs);
                }
                Op::BitNot => {
                    let v = int32_operand(reg!(decode_e(instr)));
                    reg!(decode_a(instr)) = Value::number(f64::from(!v));
                }

                // ---------------------------------------------------------
                // Comparison
                // ---------------------------------------------------------
                Op::Equals | Op::NotEquals | Op::LessThan | Op::LessThanEqual
                | Op::GreaterThan | Op::GreaterThanEqual => {
                    let lhs = reg!(decode_b(instr));
                    let rhs = reg!(decode_c(instr));
                    reg!(decode_a(instr)) = Value::boolean(compare_op(op, lhs, rhs));
                }
                Op::EqualsImmediate | Op::NotEqualsImmediate | Op::LessThanImmediate
                | Op::LessThanEqualImmediate | Op::GreaterThanImmediate
                | Op::GreaterThanEqualImmediate => {
                    let lhs = reg!(decode_b(instr));
                    let rhs = Value::number(f64::from(decode_cs(instr)));
                    reg!(decode_a(instr)) = Value::boolean(compare_op(immediate_base(op), lhs, rhs));
                }
                Op::Compare => {
                    let lhs = reg!(decode_b(instr));
                    let rhs = reg!(decode_c(instr));
                    reg!(decode_a(instr)) = Value::number(f64::from(lhs.compare_int(rhs)));
                }

                // ---------------------------------------------------------
                // Control flow
                // ---------------------------------------------------------
                Op::Jump => {
                    let offset = decode_ds(instr);
                    if offset <= 0 {
                        interrupt_check!();
                    }
                    pc = (pc as i64 - 1 + i64::from(offset)) as usize;
                }
                Op::JumpIf | Op::JumpIfNot | Op::JumpIfNil | Op::JumpIfNotNil => {
                    let v = reg!(decode_a(instr));
                    let jump = match op {
                        Op::JumpIf => v.truthy(),
                        Op::JumpIfNot => !v.truthy(),
                        Op::JumpIfNil => v.is_nil(),
                        _ => !v.is_nil(),
                    };
                    if jump {
                        let offset = decode_es(instr);
                        if offset <= 0 {
                            interrupt_check!();
                        }
                        pc = (pc as i64 - 1 + i64::from(offset)) as usize;
                    }
                }
                Op::Error => {
                    raise!(reg!(decode_d(instr)));
                }
                Op::Typecheck => {
                    let v = reg!(decode_a(instr));
                    let mask = decode_e(instr) as u16;
                    if v.kind().type_bit() & mask == 0 {
                        raisef!(
                            "unexpected type, got {} (type mask 0x{mask:04x})",
                            v.kind().name()
                        );
                    }
                }

                // ---------------------------------------------------------
                // Argument pushes
                // ---------------------------------------------------------
                Op::Push => {
                    let v = reg!(decode_d(instr));
                    fiber_push(fiber, v);
                }
                Op::Push2 => {
                    let a = reg!(decode_a(instr));
                    let b = reg!(decode_e(instr));
                    fiber_push(fiber, a);
                    fiber_push(fiber, b);
                }
                Op::Push3 => {
                    let a = reg!(decode_a(instr));
                    let b = reg!(decode_b(instr));
                    let c = reg!(decode_c(instr));
                    fiber_push(fiber, a);
                    fiber_push(fiber, b);
                    fiber_push(fiber, c);
                }
                Op::PushArray => {
                    let v = reg!(decode_d(instr));
                    match v.kind() {
                        Kind::Array => {
                            let a = v.array_ptr();
                            for i in 0..(*a).count as usize {
                                fiber_push(fiber, array::array_lookup(a, i));
                            }
                        }
                        Kind::Tuple => {
                            let t = v.tuple_ptr();
                            for i in 0..(*t).length as usize {
                                fiber_push(fiber, (*t).get(i));
                            }
                        }
                        kind => raisef!("expected array or tuple to spread, got {}", kind.name()),
                    }
                }

                // ---------------------------------------------------------
                // Calls
                // ---------------------------------------------------------
                Op::Call => {
                    interrupt_check!();
                    let dest = decode_a(instr);
                    let callee = resolve_callee(fiber, reg!(decode_e(instr)));
                    match callee.kind() {
                        Kind::Function => {
                            let f = callee.function_ptr();
                            if let Err(e) = func_frame(fiber, f) {
                                raise!(e);
                            }
                            load_frame!();
                        }
                        Kind::CFunction => {
                            let cf = callee.cfunction_ptr();
                            let (argv, argc) = cfunc_frame(fiber);
                            let ret = cf(argc, argv);
                            pop_frame(fiber);
                            reg!(dest) = ret;
                        }
                        _ => {
                            reg!(dest) = call_data_structure(fiber, callee);
                        }
                    }
                }
                Op::TailCall => {
                    interrupt_check!();
                    let callee = resolve_callee(fiber, reg!(decode_d(instr)));
                    match callee.kind() {
                        Kind::Function => {
                            let f = callee.function_ptr();
                            if let Err(e) = tail_frame(fiber, f) {
                                raise!(e);
                            }
                            load_frame!();
                        }
                        Kind::CFunction => {
                            let cf = callee.cfunction_ptr();
                            let (argv, argc) = cfunc_frame(fiber);
                            let ret = cf(argc, argv);
                            pop_frame(fiber);
                            vm_return!(ret);
                        }
                        _ => {
                            let ret = call_data_structure(fiber, callee);
                            vm_return!(ret);
                        }
                    }
                }

                // ---------------------------------------------------------
                // Fibers and signals
                // ---------------------------------------------------------
                Op::Resume | Op::Cancel => {
                    let dest = decode_a(instr);
                    let fv = reg!(decode_b(instr));
                    if fv.kind() != Kind::Fiber {
                        raisef!("expected fiber, got {}", fv.kind().name());
                    }
                    let child = fv.fiber_ptr();
                    let arg = reg!(decode_c(instr));
                    (*fiber).child = child;
                    let sig = if op == Op::Resume {
                        continue_with(vm, child, arg, None)
                    } else {
                        continue_with(vm, child, Value::nil(), Some(arg))
                    };
                    if sig == Signal::Ok || fiber_intercepts(fiber, sig) {
                        (*fiber).child = std::ptr::null_mut();
                        reg!(dest) = vm.return_reg.get();
                    } else {
                        // Propagate: this fiber suspends at the RESUME with
                        // the same signal; the child stays attached.
                        (*fiber).last_value = vm.return_reg.get();
                        return sig;
                    }
                }
                Op::Signal => {
                    let code_imm = decode_c(instr) as u8;
                    let Some(sig) = Signal::from_u8(code_imm) else {
                        raisef!("invalid signal code {code_imm}");
                    };
                    if matches!(sig, Signal::Ok | Signal::Error) {
                        raisef!("invalid signal code {code_imm}");
                    }
                    let v = reg!(decode_b(instr));
                    vm.return_reg.set(v);
                    (*fiber).last_value = v;
                    return sig;
                }
                Op::Propagate => {
                    let v = reg!(decode_a(instr));
                    let fv = reg!(decode_e(instr));
                    if fv.kind() != Kind::Fiber {
                        raisef!("expected fiber, got {}", fv.kind().name());
                    }
                    let target = fv.fiber_ptr();
                    let Some(sig) = (*target).status.to_signal() else {
                        raisef!(
                            "cannot propagate from fiber with status {}",
                            (*target).status.name()
                        );
                    };
                    (*fiber).child = target;
                    vm.return_reg.set(v);
                    (*fiber).last_value = v;
                    return sig;
                }

                // ---------------------------------------------------------
                // Returns
                // ---------------------------------------------------------
                Op::Return => {
                    let v = reg!(decode_d(instr));
                    vm_return!(v);
                }
                Op::ReturnNil => {
                    vm_return!(Value::nil());
                }

                // ---------------------------------------------------------
                // Data access
                // ---------------------------------------------------------
                Op::Get => {
                    let ds = reg!(decode_b(instr));
                    let key = reg!(decode_c(instr));
                    reg!(decode_a(instr)) = ds.get(key);
                }
                Op::In => {
                    let ds = reg!(decode_b(instr));
                    let key = reg!(decode_c(instr));
                    reg!(decode_a(instr)) = ds.strict_get(key);
                }
                Op::GetIndex => {
                    let ds = reg!(decode_b(instr));
                    let idx = Value::number(f64::from(decode_c(instr)));
                    reg!(decode_a(instr)) = ds.get(idx);
                }
                Op::Put => {
                    let ds = reg!(decode_a(instr));
                    let key = reg!(decode_b(instr));
                    let v = reg!(decode_c(instr));
                    ds.put(key, v);
                }
                Op::PutIndex => {
                    let ds = reg!(decode_a(instr));
                    let v = reg!(decode_b(instr));
                    let idx = Value::number(f64::from(decode_c(instr)));
                    ds.put(idx, v);
                }
                Op::Length => {
                    let ds = reg!(decode_e(instr));
                    reg!(decode_a(instr)) = ds.length();
                }
                Op::Next => {
                    let ds = reg!(decode_b(instr));
                    let key = reg!(decode_c(instr));
                    reg!(decode_a(instr)) = ds.next_key(key);
                }

                // ---------------------------------------------------------
                // Aggregate construction
                // ---------------------------------------------------------
                Op::MakeArray | Op::MakeBuffer | Op::MakeString | Op::MakeStruct
                | Op::MakeTable | Op::MakeTuple | Op::MakeBracketTuple => {
                    let start = (*fiber).stackstart as usize;
                    let top = (*fiber).stacktop as usize;
                    let count = top - start;
                    let items = std::slice::from_raw_parts((*fiber).data.add(start), count);
                    let built = match op {
                        Op::MakeArray => Value::array(array::array_of(items)),
                        Op::MakeTuple => Value::tuple(tuple::tuple_of(items)),
                        Op::MakeBracketTuple => {
                            let t = tuple::tuple_of(items);
                            (*t).flags |= tuple::TUPLE_BRACKET;
                            Value::tuple(t)
                        }
                        Op::MakeStruct => {
                            if count % 2 != 0 {
                                raisef!("expected even number of items for struct, got {count}");
                            }
                            Value::structure(structs::struct_of(items))
                        }
                        Op::MakeTable => {
                            if count % 2 != 0 {
                                raisef!("expected even number of items for table, got {count}");
                            }
                            let t = table::table_create(count / 2);
                            for pair in items.chunks_exact(2) {
                                table::table_put(t, pair[0], pair[1]);
                            }
                            Value::table(t)
                        }
                        Op::MakeString => {
                            let mut bytes = Vec::new();
                            for item in items {
                                bytes.extend_from_slice(&item.to_display_bytes());
                            }
                            Value::string(crate::strings::string_new(&bytes))
                        }
                        Op::MakeBuffer => {
                            let buf = buffer::buffer_new(0);
                            for item in items {
                                buffer::buffer_push_bytes(buf, &item.to_display_bytes());
                            }
                            Value::buffer(buf)
                        }
                        _ => unreachable!(),
                    };
                    (*fiber).stacktop = start as i32;
                    reg!(decode_d(instr)) = built;
                }

                // ---------------------------------------------------------
                // Closure construction
                // ---------------------------------------------------------
                Op::Closure => {
                    let dest = decode_a(instr);
                    let def_idx = decode_e(instr);
                    if def_idx >= (*def).defs_len {
                        raisef!("invalid nested definition index {def_idx}");
                    }
                    let target_def = *(*def).defs.add(def_idx as usize);
                    let env_count = (*target_def).environments_len as usize;
                    // Resolve environments before allocating the closure so
                    // every allocation in between stays reachable.
                    let mut envs = Vec::with_capacity(env_count);
                    for i in 0..env_count {
                        let entry = *(*target_def).environments.add(i);
                        if entry == ENV_CAPTURE_SELF {
                            let frame = frameref!();
                            if (*frame).env.is_null() {
                                (*frame).env = funcenv_new_onstack(
                                    fiber,
                                    frame_idx + FRAME_SIZE as i32,
                                    (*def).slotcount,
                                );
                            }
                            envs.push((*frame).env);
                        } else {
                            if entry < 0 || entry as usize >= (*func).env_count() {
                                raisef!("invalid environment capture index {entry}");
                            }
                            envs.push((*func).env(entry as usize));
                        }
                    }
                    let closure = function_new(target_def);
                    for (i, env) in envs.into_iter().enumerate() {
                        (*closure).set_env(i, env);
                    }
                    reg!(dest) = Value::function(closure);
                }
            }
        }
    }
}

// =============================================================================
// Call helpers
// =============================================================================

/// Resolve keyword callees to methods on the first argument. A keyword in
/// callee position looks itself up on the receiver; the result must be an
/// actual callable, so chains of keywords are bounded.
unsafe fn resolve_callee(fiber: *mut Fiber, callee: Value) -> Value {
    unsafe {
        let mut callee = callee;
        let mut hops = 0;
        while callee.kind() == Kind::Keyword {
            if hops == 4 {
                crate::state::vm_panic(Value::from_str("method resolution loops"));
            }
            hops += 1;
            let start = (*fiber).stackstart as usize;
            let argc = (*fiber).stacktop as usize - start;
            if argc == 0 {
                crate::state::vm_panic(Value::from_str(&format!(
                    "method call {} requires a receiver",
                    callee.describe()
                )));
            }
            let receiver = *(*fiber).data.add(start);
            let method = receiver.get(callee);
            if method.is_nil() {
                crate::state::vm_panic(Value::from_str(&format!(
                    "no method {} for {}",
                    callee.describe(),
                    receiver.describe()
                )));
            }
            callee = method;
        }
        callee
    }
}

/// Calling a data structure indexes into it with a single argument.
unsafe fn call_data_structure(fiber: *mut Fiber, ds: Value) -> Value {
    unsafe {
        let start = (*fiber).stackstart as usize;
        let argc = (*fiber).stacktop as usize - start;
        if argc != 1 {
            crate::state::vm_panic(Value::from_str(&format!(
                "{} called with {argc} arguments, expected 1",
                ds.describe()
            )));
        }
        let key = *(*fiber).data.add(start);
        (*fiber).stacktop = start as i32;
        ds.strict_get(key)
    }
}

// =============================================================================
// Arithmetic helpers
// =============================================================================

/// Map an immediate-form opcode to its register form.
fn immediate_base(op: Op) -> Op {
    match op {
        Op::AddImmediate => Op::Add,
        Op::SubtractImmediate => Op::Subtract,
        Op::MultiplyImmediate => Op::Multiply,
        Op::DivideImmediate => Op::Divide,
        Op::DivideFloorImmediate => Op::DivideFloor,
        Op::ModuloImmediate => Op::Modulo,
        Op::RemainderImmediate => Op::Remainder,
        Op::BitAndImmediate => Op::BitAnd,
        Op::BitOrImmediate => Op::BitOr,
        Op::BitXorImmediate => Op::BitXor,
        Op::ShiftLeftImmediate => Op::ShiftLeft,
        Op::ShiftRightImmediate => Op::ShiftRight,
        Op::ShiftRightUnsignedImmediate => Op::ShiftRightUnsigned,
        Op::EqualsImmediate => Op::Equals,
        Op::NotEqualsImmediate => Op::NotEquals,
        Op::LessThanImmediate => Op::LessThan,
        Op::LessThanEqualImmediate => Op::LessThanEqual,
        Op::GreaterThanImmediate => Op::GreaterThan,
        Op::GreaterThanEqualImmediate => Op::GreaterThanEqual,
        other => other,
    }
}

fn arith_numbers(op: Op, a: f64, b: f64) -> f64 {
    match op {
        Op::Add => a + b,
        Op::Subtract => a - b,
        Op::Multiply => a * b,
        Op::Divide => a / b,
        Op::DivideFloor => {
            if b == 0.0 {
                crate::state::vm_panic(Value::from_str("division by zero"));
            }
            (a / b).floor()
        }
        Op::Modulo => {
            if b == 0.0 {
                crate::state::vm_panic(Value::from_str("division by zero"));
            }
            a - b * (a / b).floor()
        }
        Op::Remainder => {
            if b == 0.0 {
                crate::state::vm_panic(Value::from_str("division by zero"));
            }
            a % b
        }
        _ => unreachable!(),
    }
}

fn method_names(op: Op) -> (&'static [u8], &'static [u8]) {
    match op {
        Op::Add => (b"+" as &[u8], b"r+" as &[u8]),
        Op::Subtract => (b"-", b"r-"),
        Op::Multiply => (b"*", b"r*"),
        Op::Divide => (b"/", b"r/"),
        Op::DivideFloor => (b"div", b"rdiv"),
        Op::Modulo => (b"mod", b"rmod"),
        Op::Remainder => (b"%", b"r%"),
        _ => unreachable!(),
    }
}

/// Numeric fast path, with a method-dispatch fallback for non-number
/// operands (`:+` on the left operand, `:r+` on the right).
fn arith(_vm: &VmState, op: Op, lhs: Value, rhs: Value) -> Value {
    if lhs.checktype(Kind::Number) && rhs.checktype(Kind::Number) {
        return Value::number(arith_numbers(op, lhs.as_number(), rhs.as_number()));
    }
    let (name, rname) = method_names(op);
    if !lhs.checktype(Kind::Number) {
        let method = lhs.get(Value::keyword_from(name));
        if !method.is_nil() {
            return api::call(method, &[lhs, rhs]);
        }
    }
    let method = rhs.get(Value::keyword_from(rname));
    if !method.is_nil() {
        return api::call(method, &[rhs, lhs]);
    }
    crate::state::vm_panic(Value::from_str(&format!(
        "could not apply {} to {} and {}",
        String::from_utf8_lossy(name),
        lhs.describe(),
        rhs.describe()
    )));
}

fn int32_operand(v: Value) -> i32 {
    match v.checked_int() {
        Some(n) if (i64::from(i32::MIN)..=i64::from(i32::MAX)).contains(&n) => n as i32,
        _ => crate::state::vm_panic(Value::from_str(&format!(
            "expected 32-bit integer operand, got {}",
            v.describe()
        ))),
    }
}

fn bitop(op: Op, a: i32, b: i32) -> Value {
    let out = match op {
        Op::BitAnd => a & b,
        Op::BitOr => a | b,
        Op::BitXor => a ^ b,
        Op::ShiftLeft => a.wrapping_shl(b as u32 & 31),
        Op::ShiftRight => a.wrapping_shr(b as u32 & 31),
        Op::ShiftRightUnsigned => {
            return Value::number(f64::from((a as u32).wrapping_shr(b as u32 & 31)));
        }
        _ => unreachable!(),
    };
    Value::number(f64::from(out))
}

fn compare_op(op: Op, lhs: Value, rhs: Value) -> bool {
    match op {
        Op::Equals => lhs.equals(rhs),
        Op::NotEquals => !lhs.equals(rhs),
        _ => {
            // Numbers follow IEEE partial order (NaN compares false);
            // everything else delegates to the universal total order.
            if lhs.checktype(Kind::Number) && rhs.checktype(Kind::Number) {
                let a = lhs.as_number();
                let b = rhs.as_number();
                match op {
                    Op::LessThan => a < b,
                    Op::LessThanEqual => a <= b,
                    Op::GreaterThan => a > b,
                    Op::GreaterThanEqual => a >= b,
                    _ => unreachable!(),
                }
            } else {
                let ord = lhs.compare(rhs);
                match op {
                    Op::LessThan => ord == std::cmp::Ordering::Less,
                    Op::LessThanEqual => ord != std::cmp::Ordering::Greater,
                    Op::GreaterThan => ord == std::cmp::Ordering::Greater,
                    Op::GreaterThanEqual => ord != std::cmp::Ordering::Less,
                    _ => unreachable!(),
                }
            }
        }
    }
}

//! Debugger surface: breakpoints, single-stepping, stack traces and
//! disassembly.
//!
//! A breakpoint is the high bit of an instruction's opcode byte. The
//! interpreter traps on it with a DEBUG signal, leaving the bit intact so
//! the next resume re-executes the original instruction. `step` builds on
//! the same mechanism: it plants temporary breakpoints on every
//! statically-reachable successor of the pending instruction, resumes,
//! then removes what it planted.

use crate::fiber::{FRAME_SIZE, Fiber, frame_at, frame_flags};
use crate::function::{self, FuncDef};
use crate::signal::{FiberStatus, Signal};
use crate::value::Value;
use crate::vm;
use vesper_core::{BREAKPOINT_BIT, Op, decode_op, disassemble};

/// Set the breakpoint bit on the instruction at `pc`.
pub fn set_breakpoint(def: *mut FuncDef, pc: usize) -> Result<(), String> {
    unsafe {
        if pc >= (*def).bytecode_len as usize {
            return Err(format!("instruction index {pc} out of bounds"));
        }
        *(*def).bytecode.add(pc) |= u32::from(BREAKPOINT_BIT);
        Ok(())
    }
}

/// Clear the breakpoint bit on the instruction at `pc`.
pub fn clear_breakpoint(def: *mut FuncDef, pc: usize) -> Result<(), String> {
    unsafe {
        if pc >= (*def).bytecode_len as usize {
            return Err(format!("instruction index {pc} out of bounds"));
        }
        *(*def).bytecode.add(pc) &= !u32::from(BREAKPOINT_BIT);
        Ok(())
    }
}

/// Statically-reachable successors of the instruction at `pc`.
fn successors(def: *mut FuncDef, pc: usize) -> Vec<usize> {
    unsafe {
        let len = (*def).bytecode_len as usize;
        let instr = *(*def).bytecode.add(pc);
        let Some(op) = Op::from_u8(decode_op(instr)) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        if let Some(offset) = op.jump_offset(instr) {
            let target = pc as i64 + i64::from(offset);
            if (0..len as i64).contains(&target) {
                out.push(target as usize);
            }
        }
        let falls_through = !op.is_terminator();
        if falls_through && pc + 1 < len {
            out.push(pc + 1);
        }
        out
    }
}

/// Run one instruction of a suspended or new fiber, then stop with a DEBUG
/// signal (or whatever signal the instruction itself produced).
pub fn step(fiber: *mut Fiber, input: Value, out: &mut Value) -> Signal {
    unsafe {
        if !matches!(
            (*fiber).status,
            FiberStatus::New | FiberStatus::Debug | FiberStatus::Pending
        ) && (*fiber).status.to_signal().is_none()
        {
            *out = Value::from_str(&format!(
                "cannot step fiber with status {}",
                (*fiber).status.name()
            ));
            return Signal::Error;
        }
        let frame = frame_at(fiber, (*fiber).frame);
        if (*frame).flags & frame_flags::CFRAME != 0 {
            return vm::continue_fiber(fiber, input, out);
        }
        let def = (*(*frame).func).def;
        let pending = match (*fiber).status {
            FiberStatus::New => 0,
            // Debug: pc rests on the trapped instruction. Suspended: pc is
            // past the suspending instruction, i.e. the next to run.
            _ => (*frame).pc as usize,
        };
        if pending >= (*def).bytecode_len as usize {
            return vm::continue_fiber(fiber, input, out);
        }

        let mut planted = Vec::new();
        for succ in successors(def, pending) {
            let word = *(*def).bytecode.add(succ);
            if word & u32::from(BREAKPOINT_BIT) == 0 {
                let _ = set_breakpoint(def, succ);
                planted.push(succ);
            }
        }
        let sig = vm::continue_fiber(fiber, input, out);
        for pc in planted {
            let _ = clear_breakpoint(def, pc);
        }
        sig
    }
}

/// Render a stack trace by walking frames from the innermost outward.
pub fn stack_trace(fiber: *mut Fiber) -> String {
    unsafe {
        let mut out = String::new();
        if (*fiber).stacktop <= 0 {
            return out;
        }
        let mut frame_idx = (*fiber).frame;
        loop {
            let frame = frame_at(fiber, frame_idx);
            if (*frame).flags & frame_flags::CFRAME != 0 {
                out.push_str("  in <native>\n");
            } else {
                let func = (*frame).func;
                let def = (*func).def;
                let name = function::funcdef_name(def)
                    .unwrap_or_else(|| format!("<anonymous 0x{:x}>", func as usize));
                let pc = ((*frame).pc as usize).saturating_sub(1);
                out.push_str(&format!("  in {name} [pc={pc}]"));
                if (*def).sourcemap_len as usize > pc {
                    let mapping = *(*def).sourcemap.add(pc);
                    out.push_str(&format!(" (source {}..{})", mapping.start, mapping.end));
                }
                out.push('\n');
            }
            if frame_idx == 0 {
                break;
            }
            frame_idx = (*frame).prevframe;
        }
        out
    }
}

/// Disassemble a whole definition, one instruction per line.
pub fn disassemble_def(def: *mut FuncDef) -> String {
    unsafe {
        let mut out = String::new();
        for pc in 0..(*def).bytecode_len as usize {
            let word = *(*def).bytecode.add(pc);
            out.push_str(&format!("{pc:04} {}\n", disassemble(word)));
        }
        out
    }
}

/// Current frame's register window, for debugger inspection.
pub fn inspect_registers(fiber: *mut Fiber) -> Vec<Value> {
    unsafe {
        if (*fiber).stacktop <= 0 {
            return Vec::new();
        }
        let frame = frame_at(fiber, (*fiber).frame);
        if (*frame).func.is_null() {
            return Vec::new();
        }
        let slots = (*(*(*frame).func).def).slotcount as usize;
        let base = (*fiber).frame as usize + FRAME_SIZE;
        (0..slots).map(|i| *(*fiber).data.add(base + i)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function::FuncDefBuilder;
    use crate::state;
    use vesper_core::{encode_0, encode_aes, encode_d, encode_ds};

    fn with_rt(f: impl FnOnce()) {
        state::init();
        f();
        state::deinit();
    }

    #[test]
    fn test_breakpoint_toggle() {
        with_rt(|| {
            let def = FuncDefBuilder::new(0, 1, vec![encode_0(Op::Noop), encode_0(Op::ReturnNil)])
                .build();
            set_breakpoint(def, 0).unwrap();
            unsafe {
                assert!(vesper_core::has_breakpoint(*(*def).bytecode));
            }
            clear_breakpoint(def, 0).unwrap();
            unsafe {
                assert!(!vesper_core::has_breakpoint(*(*def).bytecode));
            }
            assert!(set_breakpoint(def, 9).is_err());
        });
    }

    #[test]
    fn test_successors_fallthrough_and_branch() {
        with_rt(|| {
            let def = FuncDefBuilder::new(
                0,
                1,
                vec![
                    encode_aes(Op::JumpIf, 0, 2),
                    encode_0(Op::Noop),
                    encode_ds(Op::Jump, -2),
                    encode_d(Op::Return, 0),
                ],
            )
            .build();
            // Conditional branch: both the target and the fall-through.
            let mut s = successors(def, 0);
            s.sort_unstable();
            assert_eq!(s, vec![1, 2]);
            // Plain instruction: fall-through only.
            assert_eq!(successors(def, 1), vec![2]);
            // Unconditional jump: target only.
            assert_eq!(successors(def, 2), vec![0]);
            // Return: nothing.
            assert!(successors(def, 3).is_empty());
        });
    }

    #[test]
    fn test_disassemble_def() {
        with_rt(|| {
            let def = FuncDefBuilder::new(0, 1, vec![encode_0(Op::Noop), encode_0(Op::ReturnNil)])
                .build();
            let text = disassemble_def(def);
            assert!(text.contains("0000 noop"));
            assert!(text.contains("0001 retn"));
        });
    }
}

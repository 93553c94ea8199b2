//! Function-definition wire format.
//!
//! External assemblers produce function definitions as serde records
//! encoded with bincode (little-endian, fixed-width integers). Constants
//! are restricted to the assembler-producible subset: nil, booleans,
//! numbers, strings, symbols, keywords and tuples of those. Decoding
//! verifies the bytecode before the definition is handed to the
//! interpreter, so invalid register, constant and jump operands are
//! rejected up front instead of trapping mid-run.

use serde::{Deserialize, Serialize};

use crate::function::{ENV_CAPTURE_SELF, FuncDef, FuncDefBuilder, SourceMapping};
use crate::value::Value;
use vesper_core::{ArgLayout, Kind, Op, decode_a, decode_b, decode_c, decode_d, decode_e, decode_op};

/// Wire-format errors.
#[derive(Debug, PartialEq, Eq)]
pub enum WireError {
    /// Malformed bincode input.
    Decode(String),
    /// A constant outside the encodable subset.
    UnsupportedConstant(String),
    /// Bytecode failed verification.
    Verify { pc: usize, reason: String },
    /// Structural field out of range (arity, slot count, capture map).
    Malformed(String),
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WireError::Decode(msg) => write!(f, "decode error: {msg}"),
            WireError::UnsupportedConstant(what) => {
                write!(f, "constant not encodable on the wire: {what}")
            }
            WireError::Verify { pc, reason } => {
                write!(f, "bad bytecode at instruction {pc}: {reason}")
            }
            WireError::Malformed(msg) => write!(f, "malformed definition: {msg}"),
        }
    }
}

impl std::error::Error for WireError {}

/// Wire constant: the encodable value subset.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum WireConst {
    Nil,
    Boolean(bool),
    Number(f64),
    Str(Vec<u8>),
    Symbol(Vec<u8>),
    Keyword(Vec<u8>),
    Tuple(Vec<WireConst>),
}

/// Wire form of a function definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireFuncDef {
    pub arity: i32,
    pub vararg: bool,
    pub struct_arg: bool,
    pub slotcount: i32,
    pub constants: Vec<WireConst>,
    pub defs: Vec<WireFuncDef>,
    pub environments: Vec<i32>,
    pub bytecode: Vec<u32>,
    pub closure_bitset: Vec<u32>,
    pub sourcemap: Vec<(i32, i32)>,
    pub name: Option<Vec<u8>>,
    pub source: Option<Vec<u8>>,
}

fn bincode_options() -> impl bincode::Options {
    use bincode::Options;
    bincode::DefaultOptions::new()
        .with_little_endian()
        .with_fixint_encoding()
}

/// Encode a wire definition to bytes.
pub fn encode(def: &WireFuncDef) -> Result<Vec<u8>, WireError> {
    use bincode::Options;
    bincode_options()
        .serialize(def)
        .map_err(|e| WireError::Decode(e.to_string()))
}

/// Decode, verify and build a function definition from bytes.
pub fn decode(bytes: &[u8]) -> Result<*mut FuncDef, WireError> {
    use bincode::Options;
    let wire: WireFuncDef = bincode_options()
        .deserialize(bytes)
        .map_err(|e| WireError::Decode(e.to_string()))?;
    build(&wire, 0)
}

/// Convert a heap definition back to its wire form, for round-trips and
/// assembler tooling.
pub fn to_wire(def: *mut FuncDef) -> Result<WireFuncDef, WireError> {
    unsafe {
        let constants = (0..(*def).constants_len as usize)
            .map(|i| const_to_wire(*(*def).constants.add(i)))
            .collect::<Result<Vec<_>, _>>()?;
        let defs = (0..(*def).defs_len as usize)
            .map(|i| to_wire(*(*def).defs.add(i)))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(WireFuncDef {
            arity: (*def).arity,
            vararg: (*def).is_vararg(),
            struct_arg: (*def).is_struct_arg(),
            slotcount: (*def).slotcount,
            constants,
            defs,
            environments: (0..(*def).environments_len as usize)
                .map(|i| *(*def).environments.add(i))
                .collect(),
            bytecode: (*def).bytecode_words().to_vec(),
            closure_bitset: (0..(*def).closure_bitset_len as usize)
                .map(|i| *(*def).closure_bitset.add(i))
                .collect(),
            sourcemap: (0..(*def).sourcemap_len as usize)
                .map(|i| {
                    let m = *(*def).sourcemap.add(i);
                    (m.start, m.end)
                })
                .collect(),
            name: (!(*def).name.is_null()).then(|| (*(*def).name).bytes().to_vec()),
            source: (!(*def).source.is_null()).then(|| (*(*def).source).bytes().to_vec()),
        })
    }
}

fn const_to_wire(v: Value) -> Result<WireConst, WireError> {
    match v.kind() {
        Kind::Nil => Ok(WireConst::Nil),
        Kind::Boolean => Ok(WireConst::Boolean(v.as_boolean())),
        Kind::Number => Ok(WireConst::Number(v.as_number())),
        Kind::String => Ok(WireConst::Str(v.as_bytes().to_vec())),
        Kind::Symbol => Ok(WireConst::Symbol(v.as_bytes().to_vec())),
        Kind::Keyword => Ok(WireConst::Keyword(v.as_bytes().to_vec())),
        Kind::Tuple => {
            let t = v.tuple_ptr();
            let len = unsafe { (*t).length as usize };
            let items = (0..len)
                .map(|i| const_to_wire(unsafe { (*t).get(i) }))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(WireConst::Tuple(items))
        }
        kind => Err(WireError::UnsupportedConstant(kind.name().to_string())),
    }
}

fn const_from_wire(c: &WireConst) -> Value {
    match c {
        WireConst::Nil => Value::nil(),
        WireConst::Boolean(b) => Value::boolean(*b),
        WireConst::Number(n) => Value::number(*n),
        WireConst::Str(bytes) => Value::string(crate::strings::string_new(bytes)),
        WireConst::Symbol(bytes) => Value::symbol_from(bytes),
        WireConst::Keyword(bytes) => Value::keyword_from(bytes),
        WireConst::Tuple(items) => {
            let values: Vec<Value> = items.iter().map(const_from_wire).collect();
            Value::tuple(crate::tuple::tuple_of(&values))
        }
    }
}

/// Nested definitions can only capture self or a parent environment; the
/// depth parameter exists to keep recursion honest on hostile input.
const MAX_NESTING: usize = 64;

fn build(wire: &WireFuncDef, depth: usize) -> Result<*mut FuncDef, WireError> {
    if depth > MAX_NESTING {
        return Err(WireError::Malformed("definition nesting too deep".to_string()));
    }
    if wire.arity < 0 {
        return Err(WireError::Malformed(format!("negative arity {}", wire.arity)));
    }
    if wire.slotcount < wire.arity || wire.slotcount > u8::MAX as i32 + 1 {
        return Err(WireError::Malformed(format!(
            "slot count {} out of range",
            wire.slotcount
        )));
    }
    if wire.bytecode.is_empty() {
        return Err(WireError::Malformed("empty bytecode".to_string()));
    }
    for (i, &entry) in wire.environments.iter().enumerate() {
        if entry != ENV_CAPTURE_SELF && entry < 0 {
            return Err(WireError::Malformed(format!(
                "environment capture {i} has invalid index {entry}"
            )));
        }
    }
    verify(wire)?;

    // The GC lock protects the builder's constants between allocations.
    crate::gc::gclock();
    let result = (|| {
        let mut builder = FuncDefBuilder::new(wire.arity, wire.slotcount, wire.bytecode.clone());
        builder.vararg = wire.vararg;
        builder.struct_arg = wire.struct_arg;
        builder.constants = wire.constants.iter().map(const_from_wire).collect();
        builder.environments = wire.environments.clone();
        builder.closure_bitset = wire.closure_bitset.clone();
        builder.sourcemap = wire
            .sourcemap
            .iter()
            .map(|&(start, end)| SourceMapping { start, end })
            .collect();
        builder.name = wire.name.clone();
        builder.source = wire.source.clone();
        let defs = wire
            .defs
            .iter()
            .map(|d| build(d, depth + 1))
            .collect::<Result<Vec<_>, _>>()?;
        builder.defs = defs;
        Ok(builder.build())
    })();
    crate::gc::gcunlock();
    result
}

// =============================================================================
// Verification
// =============================================================================

/// Check every instruction against the definition it will run in: known
/// opcodes, register operands inside the slot window, constant and nested
/// definition indices in range, jump targets inside the bytecode.
pub fn verify(wire: &WireFuncDef) -> Result<(), WireError> {
    let len = wire.bytecode.len();
    let slots = wire.slotcount as u32;
    let fail = |pc: usize, reason: String| Err(WireError::Verify { pc, reason });

    for (pc, &instr) in wire.bytecode.iter().enumerate() {
        let Some(op) = Op::from_u8(decode_op(instr)) else {
            return fail(pc, format!("unknown opcode 0x{:02x}", decode_op(instr)));
        };

        let check_reg = |r: u32, what: &str| -> Result<(), WireError> {
            if r >= slots {
                Err(WireError::Verify {
                    pc,
                    reason: format!("{what} register {r} outside {slots} slots"),
                })
            } else {
                Ok(())
            }
        };

        // Register operands per layout; immediate fields skip the check.
        match op.layout() {
            ArgLayout::None | ArgLayout::Ds => {}
            ArgLayout::D => check_reg(decode_d(instr), "target")?,
            ArgLayout::Ae | ArgLayout::Aes => check_reg(decode_a(instr), "target")?,
            ArgLayout::Abc => {
                check_reg(decode_a(instr), "target")?;
                check_reg(decode_b(instr), "operand")?;
                // GetIndex/PutIndex carry an immediate index in C, and
                // Signal carries the signal code there.
                if !matches!(op, Op::GetIndex | Op::PutIndex | Op::Signal) {
                    check_reg(decode_c(instr), "operand")?;
                }
            }
            ArgLayout::Abcs => {
                check_reg(decode_a(instr), "target")?;
                check_reg(decode_b(instr), "operand")?;
            }
        }

        // E-field registers for the ops that treat E as a register.
        match op {
            Op::MoveNear | Op::MoveFar | Op::Call | Op::Length | Op::Propagate | Op::BitNot => {
                check_reg(decode_e(instr), "operand")?;
            }
            Op::LoadConstant => {
                let idx = decode_e(instr) as usize;
                if idx >= wire.constants.len() {
                    return fail(pc, format!("constant index {idx} out of range"));
                }
            }
            Op::Closure => {
                let idx = decode_e(instr) as usize;
                if idx >= wire.defs.len() {
                    return fail(pc, format!("nested definition index {idx} out of range"));
                }
            }
            Op::LoadUpvalue | Op::SetUpvalue => {
                let env = decode_b(instr) as usize;
                if env >= wire.environments.len() {
                    return fail(pc, format!("environment index {env} out of range"));
                }
            }
            Op::Signal => {
                let code = decode_c(instr) as u8;
                match crate::signal::Signal::from_u8(code) {
                    Some(crate::signal::Signal::Ok | crate::signal::Signal::Error) | None => {
                        return fail(pc, format!("invalid signal code {code}"));
                    }
                    Some(_) => {}
                }
            }
            _ => {}
        }

        if let Some(offset) = op.jump_offset(instr) {
            let target = pc as i64 + i64::from(offset);
            if !(0..len as i64).contains(&target) {
                return fail(pc, format!("jump target {target} out of range"));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state;
    use vesper_core::{encode_0, encode_abc, encode_ae, encode_aes, encode_d, encode_ds};

    fn with_rt(f: impl FnOnce()) {
        state::init();
        f();
        state::deinit();
    }

    fn sample_wire() -> WireFuncDef {
        WireFuncDef {
            arity: 1,
            vararg: false,
            struct_arg: false,
            slotcount: 3,
            constants: vec![
                WireConst::Number(42.0),
                WireConst::Keyword(b"name".to_vec()),
                WireConst::Tuple(vec![WireConst::Nil, WireConst::Boolean(true)]),
            ],
            defs: vec![],
            environments: vec![],
            bytecode: vec![
                encode_ae(Op::LoadConstant, 1, 0),
                encode_abc(Op::Add, 2, 0, 1),
                encode_d(Op::Return, 2),
            ],
            closure_bitset: vec![],
            sourcemap: vec![(0, 4), (5, 9), (10, 11)],
            name: Some(b"sample".to_vec()),
            source: Some(b"(sample)".to_vec()),
        }
    }

    #[test]
    fn test_roundtrip() {
        with_rt(|| {
            let wire = sample_wire();
            let bytes = encode(&wire).expect("encode");
            let def = decode(&bytes).expect("decode");
            unsafe {
                assert_eq!((*def).arity, 1);
                assert_eq!((*def).slotcount, 3);
                assert_eq!((*def).bytecode_len, 3);
                assert_eq!((*def).constants_len, 3);
                assert_eq!((*(*def).constants).as_number(), 42.0);
            }
            // And back out to the wire form.
            let wire2 = to_wire(def).expect("to_wire");
            assert_eq!(wire2.bytecode, wire.bytecode);
            assert_eq!(wire2.constants, wire.constants);
            assert_eq!(wire2.name, wire.name);
        });
    }

    #[test]
    fn test_decoded_def_runs() {
        with_rt(|| {
            let bytes = encode(&sample_wire()).expect("encode");
            let def = decode(&bytes).expect("decode");
            let f = Value::function(crate::function::function_new(def));
            let mut out = Value::nil();
            let sig = crate::api::pcall(f, &[Value::number(8.0)], &mut out);
            assert_eq!(sig, crate::signal::Signal::Ok);
            assert_eq!(out.as_number(), 50.0);
        });
    }

    #[test]
    fn test_verify_rejects_unknown_opcode() {
        with_rt(|| {
            let mut wire = sample_wire();
            wire.bytecode = vec![0x7F, encode_0(Op::ReturnNil)];
            assert!(matches!(verify(&wire), Err(WireError::Verify { pc: 0, .. })));
        });
    }

    #[test]
    fn test_verify_rejects_bad_registers() {
        with_rt(|| {
            let mut wire = sample_wire();
            wire.bytecode = vec![encode_abc(Op::Add, 200, 0, 1), encode_0(Op::ReturnNil)];
            assert!(matches!(verify(&wire), Err(WireError::Verify { pc: 0, .. })));
        });
    }

    #[test]
    fn test_verify_rejects_bad_constant_index() {
        with_rt(|| {
            let mut wire = sample_wire();
            wire.bytecode = vec![encode_ae(Op::LoadConstant, 0, 9), encode_0(Op::ReturnNil)];
            assert!(matches!(verify(&wire), Err(WireError::Verify { pc: 0, .. })));
        });
    }

    #[test]
    fn test_verify_rejects_escaping_jump() {
        with_rt(|| {
            let mut wire = sample_wire();
            wire.bytecode = vec![encode_ds(Op::Jump, 10), encode_0(Op::ReturnNil)];
            assert!(matches!(verify(&wire), Err(WireError::Verify { pc: 0, .. })));
            wire.bytecode = vec![encode_ds(Op::Jump, -5), encode_0(Op::ReturnNil)];
            assert!(matches!(verify(&wire), Err(WireError::Verify { pc: 0, .. })));
        });
    }

    #[test]
    fn test_verify_rejects_branch_register() {
        with_rt(|| {
            let mut wire = sample_wire();
            wire.bytecode = vec![encode_aes(Op::JumpIf, 77, 1), encode_0(Op::ReturnNil)];
            assert!(matches!(verify(&wire), Err(WireError::Verify { pc: 0, .. })));
        });
    }

    #[test]
    fn test_malformed_structure() {
        with_rt(|| {
            let mut wire = sample_wire();
            wire.slotcount = 0;
            assert!(matches!(build(&wire, 0), Err(WireError::Malformed(_))));

            let mut wire = sample_wire();
            wire.bytecode = vec![];
            assert!(matches!(build(&wire, 0), Err(WireError::Malformed(_))));
        });
    }

    #[test]
    fn test_decode_garbage() {
        with_rt(|| {
            assert!(matches!(decode(b"not bincode at all"), Err(WireError::Decode(_))));
        });
    }
}

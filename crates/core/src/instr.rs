//! Bytecode instruction words.
//!
//! Instructions are 32-bit little-endian words. Bits [0..7] hold the opcode;
//! bit 7 of the opcode byte is the per-instruction breakpoint flag and is
//! masked off on dispatch. The remaining 24 bits decode in one of three ways:
//!
//! ```text
//! +--------+--------+--------+--------+
//! |   C    |   B    |   A    | opcode |   three 8-bit registers
//! +--------+--------+--------+--------+
//! |        E        |   A    | opcode |   8-bit register + 16-bit reg/imm
//! +--------+--------+--------+--------+
//! |            D             | opcode |   24-bit register/immediate
//! +--------+--------+--------+--------+
//! ```
//!
//! The signed variants (CS, DS, ES) are arithmetic shifts of the same fields
//! and carry signed immediates (integer literals, jump offsets).

/// Breakpoint flag in the opcode byte.
pub const BREAKPOINT_BIT: u8 = 0x80;

/// How the argument bits of an instruction decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgLayout {
    /// No arguments.
    None,
    /// One 24-bit register.
    D,
    /// One signed 24-bit immediate (jump offset).
    Ds,
    /// 8-bit register A plus 16-bit register/immediate E.
    Ae,
    /// 8-bit register A plus signed 16-bit immediate ES.
    Aes,
    /// Three 8-bit registers A, B, C.
    Abc,
    /// Registers A, B plus signed 8-bit immediate CS.
    Abcs,
}

macro_rules! opcodes {
    ($(($name:ident, $value:expr, $layout:ident, $pretty:expr)),* $(,)?) => {
        /// Vesper opcode set.
        #[repr(u8)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Op {
            $($name = $value),*
        }

        impl Op {
            /// Decode an opcode byte (breakpoint bit already masked).
            pub fn from_u8(byte: u8) -> Option<Op> {
                match byte {
                    $($value => Some(Op::$name),)*
                    _ => None,
                }
            }

            /// Assembler mnemonic.
            pub fn name(self) -> &'static str {
                match self {
                    $(Op::$name => $pretty),*
                }
            }

            /// Argument layout for decoding and verification.
            pub fn layout(self) -> ArgLayout {
                match self {
                    $(Op::$name => ArgLayout::$layout),*
                }
            }
        }
    };
}

opcodes! {
    (Noop,                      0x00, None, "noop"),
    (Error,                     0x01, D,    "error"),
    (Typecheck,                 0x02, Ae,   "tcheck"),
    (Return,                    0x03, D,    "ret"),
    (ReturnNil,                 0x04, None, "retn"),

    (LoadNil,                   0x05, D,    "ldn"),
    (LoadTrue,                  0x06, D,    "ldt"),
    (LoadFalse,                 0x07, D,    "ldf"),
    (LoadInteger,               0x08, Aes,  "ldi"),
    (LoadConstant,              0x09, Ae,   "ldc"),
    (LoadSelf,                  0x0A, D,    "ldself"),
    (LoadUpvalue,               0x0B, Abc,  "ldu"),
    (SetUpvalue,                0x0C, Abc,  "setu"),

    (MoveNear,                  0x0D, Ae,   "movn"),
    (MoveFar,                   0x0E, Ae,   "movf"),

    (Add,                       0x0F, Abc,  "add"),
    (AddImmediate,              0x10, Abcs, "addim"),
    (Subtract,                  0x11, Abc,  "sub"),
    (SubtractImmediate,         0x12, Abcs, "subim"),
    (Multiply,                  0x13, Abc,  "mul"),
    (MultiplyImmediate,         0x14, Abcs, "mulim"),
    (Divide,                    0x15, Abc,  "div"),
    (DivideImmediate,           0x16, Abcs, "divim"),
    (DivideFloor,               0x17, Abc,  "divf"),
    (DivideFloorImmediate,      0x18, Abcs, "divfim"),
    (Modulo,                    0x19, Abc,  "mod"),
    (ModuloImmediate,           0x1A, Abcs, "modim"),
    (Remainder,                 0x1B, Abc,  "rem"),
    (RemainderImmediate,        0x1C, Abcs, "remim"),

    (BitAnd,                    0x1D, Abc,  "band"),
    (BitAndImmediate,           0x1E, Abcs, "bandim"),
    (BitOr,                     0x1F, Abc,  "bor"),
    (BitOrImmediate,            0x20, Abcs, "borim"),
    (BitXor,                    0x21, Abc,  "bxor"),
    (BitXorImmediate,           0x22, Abcs, "bxorim"),
    (BitNot,                    0x23, Ae,   "bnot"),
    (ShiftLeft,                 0x24, Abc,  "sl"),
    (ShiftLeftImmediate,        0x25, Abcs, "slim"),
    (ShiftRight,                0x26, Abc,  "sr"),
    (ShiftRightImmediate,       0x27, Abcs, "srim"),
    (ShiftRightUnsigned,        0x28, Abc,  "sru"),
    (ShiftRightUnsignedImmediate, 0x29, Abcs, "sruim"),

    (Equals,                    0x2A, Abc,  "eq"),
    (EqualsImmediate,           0x2B, Abcs, "eqim"),
    (NotEquals,                 0x2C, Abc,  "neq"),
    (NotEqualsImmediate,        0x2D, Abcs, "neqim"),
    (LessThan,                  0x2E, Abc,  "lt"),
    (LessThanImmediate,         0x2F, Abcs, "ltim"),
    (LessThanEqual,             0x30, Abc,  "lte"),
    (LessThanEqualImmediate,    0x31, Abcs, "lteim"),
    (GreaterThan,               0x32, Abc,  "gt"),
    (GreaterThanImmediate,      0x33, Abcs, "gtim"),
    (GreaterThanEqual,          0x34, Abc,  "gte"),
    (GreaterThanEqualImmediate, 0x35, Abcs, "gteim"),
    (Compare,                   0x36, Abc,  "cmp"),

    (Jump,                      0x37, Ds,   "jmp"),
    (JumpIf,                    0x38, Aes,  "jmpif"),
    (JumpIfNot,                 0x39, Aes,  "jmpno"),
    (JumpIfNil,                 0x3A, Aes,  "jmpnil"),
    (JumpIfNotNil,              0x3B, Aes,  "jmpnn"),

    (Push,                      0x3C, D,    "push"),
    (Push2,                     0x3D, Ae,   "push2"),
    (Push3,                     0x3E, Abc,  "push3"),
    (PushArray,                 0x3F, D,    "pusha"),
    (Call,                      0x40, Ae,   "call"),
    (TailCall,                  0x41, D,    "tcall"),

    (Resume,                    0x42, Abc,  "res"),
    (Signal,                    0x43, Abc,  "sig"),
    (Propagate,                 0x44, Ae,   "prop"),
    (Cancel,                    0x45, Abc,  "cancel"),

    (Get,                       0x46, Abc,  "get"),
    (GetIndex,                  0x47, Abc,  "geti"),
    (In,                        0x48, Abc,  "in"),
    (Put,                       0x49, Abc,  "put"),
    (PutIndex,                  0x4A, Abc,  "puti"),
    (Length,                    0x4B, Ae,   "len"),

    (MakeArray,                 0x4C, D,    "mkarr"),
    (MakeBuffer,                0x4D, D,    "mkbuf"),
    (MakeString,                0x4E, D,    "mkstr"),
    (MakeStruct,                0x4F, D,    "mkstu"),
    (MakeTable,                 0x50, D,    "mktab"),
    (MakeTuple,                 0x51, D,    "mktup"),
    (MakeBracketTuple,          0x52, D,    "mkbtp"),

    (Closure,                   0x53, Ae,   "closure"),
    (Next,                      0x54, Abc,  "next"),
}

/// Number of defined opcodes; discriminants are contiguous from zero.
pub const OP_COUNT: u8 = 0x55;

impl Op {
    /// True for instructions that never fall through to pc+1.
    pub fn is_terminator(self) -> bool {
        matches!(
            self,
            Op::Return | Op::ReturnNil | Op::Error | Op::TailCall | Op::Jump
        )
    }

    /// Relative jump offset, if this instruction can branch.
    pub fn jump_offset(self, instr: u32) -> Option<i32> {
        match self {
            Op::Jump => Some(decode_ds(instr)),
            Op::JumpIf | Op::JumpIfNot | Op::JumpIfNil | Op::JumpIfNotNil => {
                Some(decode_es(instr))
            }
            _ => None,
        }
    }
}

// =============================================================================
// Decoding
// =============================================================================

/// Opcode byte with the breakpoint flag masked off.
#[inline(always)]
pub fn decode_op(instr: u32) -> u8 {
    (instr as u8) & !BREAKPOINT_BIT
}

/// Raw opcode byte including the breakpoint flag.
#[inline(always)]
pub fn decode_op_raw(instr: u32) -> u8 {
    instr as u8
}

#[inline(always)]
pub fn has_breakpoint(instr: u32) -> bool {
    (instr as u8) & BREAKPOINT_BIT != 0
}

#[inline(always)]
pub fn decode_a(instr: u32) -> u32 {
    (instr >> 8) & 0xFF
}

#[inline(always)]
pub fn decode_b(instr: u32) -> u32 {
    (instr >> 16) & 0xFF
}

#[inline(always)]
pub fn decode_c(instr: u32) -> u32 {
    instr >> 24
}

/// Signed 8-bit immediate in the C slot (arithmetic shift).
#[inline(always)]
pub fn decode_cs(instr: u32) -> i32 {
    (instr as i32) >> 24
}

#[inline(always)]
pub fn decode_d(instr: u32) -> u32 {
    instr >> 8
}

/// Signed 24-bit immediate in the D slot.
#[inline(always)]
pub fn decode_ds(instr: u32) -> i32 {
    (instr as i32) >> 8
}

#[inline(always)]
pub fn decode_e(instr: u32) -> u32 {
    instr >> 16
}

/// Signed 16-bit immediate in the E slot.
#[inline(always)]
pub fn decode_es(instr: u32) -> i32 {
    (instr as i32) >> 16
}

// =============================================================================
// Encoding (used by tests, the wire verifier and external assemblers)
// =============================================================================

#[inline]
pub fn encode_0(op: Op) -> u32 {
    op as u32
}

#[inline]
pub fn encode_d(op: Op, d: u32) -> u32 {
    debug_assert!(d <= 0x00FF_FFFF);
    (op as u32) | (d << 8)
}

#[inline]
pub fn encode_ds(op: Op, ds: i32) -> u32 {
    debug_assert!((-(1 << 23)..(1 << 23)).contains(&ds));
    (op as u32) | (((ds as u32) & 0x00FF_FFFF) << 8)
}

#[inline]
pub fn encode_ae(op: Op, a: u32, e: u32) -> u32 {
    debug_assert!(a <= 0xFF && e <= 0xFFFF);
    (op as u32) | (a << 8) | (e << 16)
}

#[inline]
pub fn encode_aes(op: Op, a: u32, es: i32) -> u32 {
    debug_assert!(a <= 0xFF && (-0x8000..0x8000).contains(&es));
    (op as u32) | (a << 8) | (((es as u32) & 0xFFFF) << 16)
}

#[inline]
pub fn encode_abc(op: Op, a: u32, b: u32, c: u32) -> u32 {
    debug_assert!(a <= 0xFF && b <= 0xFF && c <= 0xFF);
    (op as u32) | (a << 8) | (b << 16) | (c << 24)
}

#[inline]
pub fn encode_abcs(op: Op, a: u32, b: u32, cs: i32) -> u32 {
    debug_assert!(a <= 0xFF && b <= 0xFF && (-0x80..0x80).contains(&cs));
    (op as u32) | (a << 8) | (b << 16) | (((cs as u32) & 0xFF) << 24)
}

/// Render one instruction as assembler text.
pub fn disassemble(instr: u32) -> String {
    let bp = if has_breakpoint(instr) { "*" } else { "" };
    let Some(op) = Op::from_u8(decode_op(instr)) else {
        return format!("{bp}?? 0x{instr:08x}");
    };
    let name = op.name();
    match op.layout() {
        ArgLayout::None => format!("{bp}{name}"),
        ArgLayout::D => format!("{bp}{name} {}", decode_d(instr)),
        ArgLayout::Ds => format!("{bp}{name} {:+}", decode_ds(instr)),
        ArgLayout::Ae => format!("{bp}{name} {} {}", decode_a(instr), decode_e(instr)),
        ArgLayout::Aes => format!("{bp}{name} {} {:+}", decode_a(instr), decode_es(instr)),
        ArgLayout::Abc => format!(
            "{bp}{name} {} {} {}",
            decode_a(instr),
            decode_b(instr),
            decode_c(instr)
        ),
        ArgLayout::Abcs => format!(
            "{bp}{name} {} {} {:+}",
            decode_a(instr),
            decode_b(instr),
            decode_cs(instr)
        ),
    }
}

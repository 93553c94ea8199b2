//! Vesper core: the substrate of the Vesper virtual machine.
//!
//! This crate holds the pieces that are independent of the heap and the
//! interpreter so they can be shared with external tools (assemblers,
//! disassemblers, debuggers):
//!
//! - `kinds`: the value-kind enumeration and fixed cross-type ordering
//! - `tagged`: the 64-bit tagged value encodings (NaN-boxed and portable),
//!   chosen at build time by the `nanbox` feature
//! - `hash`: stable 32-bit content hashing (shift-add mixer, or keyed
//!   HalfSipHash with the `keyed-hash` feature)
//! - `instr`: 32-bit instruction words, opcode table, encode/decode and
//!   single-instruction disassembly

pub mod hash;
pub mod instr;
pub mod kinds;
pub mod tagged;

// Re-export key types and functions
pub use hash::{hash_bytes, hash_combine, hash_key, hash_word, set_hash_key};
pub use instr::{
    ArgLayout, BREAKPOINT_BIT, OP_COUNT, Op, decode_a, decode_b, decode_c, decode_cs, decode_d,
    decode_ds, decode_e, decode_es, decode_op, decode_op_raw, disassemble, encode_0, encode_abc,
    encode_abcs, encode_ae, encode_aes, encode_d, encode_ds, has_breakpoint,
};
pub use kinds::{KIND_COUNT, Kind};
pub use tagged::{CANONICAL_NAN, RawValue};

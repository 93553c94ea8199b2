//! The Vesper value type.
//!
//! `Value` wraps the core tagged encoding with typed constructors and
//! accessors, and defines the logical operations the interpreter and host
//! API build on: truthiness, equality, hashing, total ordering, the
//! polymorphic get/put/length/next data protocol, and printing.
//!
//! Equality, ordering and hashing are defined on logical values, never on
//! encodings. Hashing never allocates.

use std::cmp::Ordering;

use crate::array::{self, VArray};
use crate::buffer::VBuffer;
use crate::fiber::Fiber;
use crate::function::Function;
use crate::gc::{self, GcHeader, MemoryKind};
use crate::strings::{self, VString};
use crate::structs::{self, VStruct};
use crate::table::{self, VTable};
use crate::tuple::{self, VTuple};
use crate::panicf;
use vesper_core::{Kind, RawValue, hash_word};

/// Host-callable native function. Errors are raised with `vm_panic` or the
/// `panicf!` macro and surface as ERROR signals at the interpreter entrance.
pub type CFunction = fn(argc: i32, argv: *const Value) -> Value;

/// Maximum depth for recursive printing and prototype traversal.
const PRINT_DEPTH: u32 = 8;

// =============================================================================
// Abstract (opaque host) values
// =============================================================================

/// Behavior table for an opaque host type.
pub struct AbstractType {
    pub name: &'static str,
    /// Called when an instance is swept.
    pub finalize: Option<unsafe fn(data: *mut u8, len: usize)>,
    /// Called during the mark phase; use `gc::mark_from_abstract` inside.
    pub gcmark: Option<unsafe fn(data: *mut u8, len: usize)>,
}

/// Managed block holding an abstract instance.
#[repr(C)]
pub struct VAbstract {
    pub(crate) gc: GcHeader,
    pub(crate) ty: *const AbstractType,
    pub(crate) size: usize,
    data: [u8; 0],
}

impl VAbstract {
    #[inline(always)]
    pub fn data_ptr(&self) -> *mut u8 {
        self.data.as_ptr() as *mut u8
    }

    #[inline(always)]
    pub fn abstract_type(&self) -> &AbstractType {
        unsafe { &*self.ty }
    }
}

/// Allocate an abstract instance with `size` bytes of zeroed payload.
pub fn abstract_new(ty: &'static AbstractType, size: usize) -> *mut VAbstract {
    crate::state::with_vm(|vm| {
        let total = std::mem::size_of::<VAbstract>() + size;
        let abs = gc::alloc(vm, MemoryKind::Abstract, total) as *mut VAbstract;
        unsafe {
            (*abs).ty = ty;
            (*abs).size = size;
        }
        abs
    })
}

// =============================================================================
// Value
// =============================================================================

/// A Vesper value: an 8-byte tagged word (NaN-boxed builds) referencing
/// GC-owned heap objects. Values are borrowed references; the GC owns every
/// heap object exclusively.
#[derive(Copy, Clone)]
pub struct Value(RawValue);

impl Default for Value {
    fn default() -> Self {
        Value::nil()
    }
}

impl Value {
    // -------------------------------------------------------------------------
    // Constructors
    // -------------------------------------------------------------------------

    #[inline(always)]
    pub fn nil() -> Value {
        Value(RawValue::nil())
    }

    #[inline(always)]
    pub fn boolean(b: bool) -> Value {
        Value(RawValue::boolean(b))
    }

    #[inline(always)]
    pub fn number(n: f64) -> Value {
        Value(RawValue::number(n))
    }

    #[inline(always)]
    pub fn integer(n: i32) -> Value {
        Value(RawValue::number(f64::from(n)))
    }

    /// Allocate a new string value from UTF-8 text.
    pub fn from_str(text: &str) -> Value {
        Value::string(strings::string_new(text.as_bytes()))
    }

    /// Intern `name` and wrap it as a symbol.
    pub fn symbol_from(name: &[u8]) -> Value {
        Value::symbol(strings::symbol_new(name))
    }

    /// Intern `name` and wrap it as a keyword.
    pub fn keyword_from(name: &[u8]) -> Value {
        Value::keyword(strings::keyword_new(name))
    }

    #[inline(always)]
    pub fn string(s: *mut VString) -> Value {
        Value(RawValue::pointer(Kind::String, s as *mut ()))
    }

    #[inline(always)]
    pub fn symbol(s: *mut VString) -> Value {
        Value(RawValue::pointer(Kind::Symbol, s as *mut ()))
    }

    #[inline(always)]
    pub fn keyword(s: *mut VString) -> Value {
        Value(RawValue::pointer(Kind::Keyword, s as *mut ()))
    }

    #[inline(always)]
    pub fn array(a: *mut VArray) -> Value {
        Value(RawValue::pointer(Kind::Array, a as *mut ()))
    }

    #[inline(always)]
    pub fn tuple(t: *mut VTuple) -> Value {
        Value(RawValue::pointer(Kind::Tuple, t as *mut ()))
    }

    #[inline(always)]
    pub fn table(t: *mut VTable) -> Value {
        Value(RawValue::pointer(Kind::Table, t as *mut ()))
    }

    #[inline(always)]
    pub fn structure(s: *mut VStruct) -> Value {
        Value(RawValue::pointer(Kind::Struct, s as *mut ()))
    }

    #[inline(always)]
    pub fn buffer(b: *mut VBuffer) -> Value {
        Value(RawValue::pointer(Kind::Buffer, b as *mut ()))
    }

    #[inline(always)]
    pub fn function(f: *mut Function) -> Value {
        Value(RawValue::pointer(Kind::Function, f as *mut ()))
    }

    #[inline(always)]
    pub fn fiber(f: *mut Fiber) -> Value {
        Value(RawValue::pointer(Kind::Fiber, f as *mut ()))
    }

    #[inline(always)]
    pub fn cfunction(f: CFunction) -> Value {
        Value(RawValue::pointer(Kind::CFunction, f as *mut ()))
    }

    #[inline(always)]
    pub fn abstract_value(a: *mut VAbstract) -> Value {
        Value(RawValue::pointer(Kind::Abstract, a as *mut ()))
    }

    // -------------------------------------------------------------------------
    // Inspection
    // -------------------------------------------------------------------------

    #[inline(always)]
    pub fn kind(self) -> Kind {
        self.0.kind()
    }

    #[inline(always)]
    pub fn is_nil(self) -> bool {
        self.0.is_nil()
    }

    /// nil and false are the only falsey values.
    #[inline(always)]
    pub fn truthy(self) -> bool {
        self.0.is_truthy()
    }

    #[inline(always)]
    pub fn checktype(self, kind: Kind) -> bool {
        self.kind() == kind
    }

    /// Bitwise identity: pointer identity for heap values, encoding
    /// identity otherwise. Use [`Value::equals`] for logical equality.
    #[inline(always)]
    pub fn identical(self, other: Value) -> bool {
        self.0.same(other.0)
    }

    #[inline(always)]
    pub(crate) fn raw(self) -> RawValue {
        self.0
    }

    // -------------------------------------------------------------------------
    // Unwrappers
    // -------------------------------------------------------------------------

    #[inline(always)]
    pub fn as_number(self) -> f64 {
        self.0.as_number()
    }

    #[inline(always)]
    pub fn as_boolean(self) -> bool {
        self.0.as_boolean()
    }

    /// Payload of a string, symbol or keyword.
    #[inline(always)]
    pub fn string_ptr(self) -> *mut VString {
        debug_assert!(matches!(self.kind(), Kind::String | Kind::Symbol | Kind::Keyword));
        self.0.as_pointer() as *mut VString
    }

    /// Bytes of a string, symbol or keyword.
    pub fn as_bytes(self) -> &'static [u8] {
        unsafe { (*self.string_ptr()).bytes() }
    }

    #[inline(always)]
    pub fn array_ptr(self) -> *mut VArray {
        debug_assert_eq!(self.kind(), Kind::Array);
        self.0.as_pointer() as *mut VArray
    }

    #[inline(always)]
    pub fn tuple_ptr(self) -> *mut VTuple {
        debug_assert_eq!(self.kind(), Kind::Tuple);
        self.0.as_pointer() as *mut VTuple
    }

    #[inline(always)]
    pub fn table_ptr(self) -> *mut VTable {
        debug_assert_eq!(self.kind(), Kind::Table);
        self.0.as_pointer() as *mut VTable
    }

    #[inline(always)]
    pub fn struct_ptr(self) -> *mut VStruct {
        debug_assert_eq!(self.kind(), Kind::Struct);
        self.0.as_pointer() as *mut VStruct
    }

    #[inline(always)]
    pub fn buffer_ptr(self) -> *mut VBuffer {
        debug_assert_eq!(self.kind(), Kind::Buffer);
        self.0.as_pointer() as *mut VBuffer
    }

    #[inline(always)]
    pub fn function_ptr(self) -> *mut Function {
        debug_assert_eq!(self.kind(), Kind::Function);
        self.0.as_pointer() as *mut Function
    }

    #[inline(always)]
    pub fn fiber_ptr(self) -> *mut Fiber {
        debug_assert_eq!(self.kind(), Kind::Fiber);
        self.0.as_pointer() as *mut Fiber
    }

    #[inline(always)]
    pub fn abstract_ptr(self) -> *mut VAbstract {
        debug_assert_eq!(self.kind(), Kind::Abstract);
        self.0.as_pointer() as *mut VAbstract
    }

    pub fn cfunction_ptr(self) -> CFunction {
        debug_assert_eq!(self.kind(), Kind::CFunction);
        unsafe { std::mem::transmute::<*mut (), CFunction>(self.0.as_pointer()) }
    }

    /// GC header of a managed heap value.
    #[inline(always)]
    pub(crate) fn gc_header(self) -> *mut GcHeader {
        debug_assert!(self.kind().is_gc_object());
        self.0.as_pointer() as *mut GcHeader
    }

    // -------------------------------------------------------------------------
    // Numeric conversions
    // -------------------------------------------------------------------------

    /// The number as an exact integer, if it is one.
    pub fn checked_int(self) -> Option<i64> {
        if !self.0.is_number() {
            return None;
        }
        let n = self.0.as_number();
        if n.fract() == 0.0 && n.abs() <= 9_007_199_254_740_992.0 {
            Some(n as i64)
        } else {
            None
        }
    }

    /// Non-negative integer index, if representable.
    pub fn checked_index(self) -> Option<usize> {
        match self.checked_int() {
            Some(n) if n >= 0 => Some(n as usize),
            _ => None,
        }
    }
}

// =============================================================================
// Equality
// =============================================================================

impl Value {
    /// Logical equality.
    ///
    /// Numbers compare by IEEE rules (NaN is not equal to itself); strings
    /// by content; symbols and keywords by identity (interning makes that
    /// equivalent to content); tuples element-wise; structs as sets of
    /// pairs; every mutable heap object by pointer identity.
    pub fn equals(self, other: Value) -> bool {
        let kind = self.kind();
        if kind != other.kind() {
            return false;
        }
        match kind {
            Kind::Nil => true,
            Kind::Boolean => self.as_boolean() == other.as_boolean(),
            Kind::Number => self.as_number() == other.as_number(),
            Kind::String => unsafe {
                let a = self.string_ptr();
                let b = other.string_ptr();
                a == b || ((*a).hash == (*b).hash && (*a).bytes() == (*b).bytes())
            },
            Kind::Symbol | Kind::Keyword => self.string_ptr() == other.string_ptr(),
            Kind::Tuple => tuple::tuple_equals(self.tuple_ptr(), other.tuple_ptr()),
            Kind::Struct => structs::struct_equals(self.struct_ptr(), other.struct_ptr()),
            _ => self.identical(other),
        }
    }

    /// Stable 32-bit hash, consistent with [`Value::equals`].
    ///
    /// Immutable aggregates use the hash cached in their headers; mutable
    /// objects hash by address. Never allocates.
    pub fn hash(self) -> u32 {
        match self.kind() {
            Kind::Nil => 0,
            Kind::Boolean => 1 + u32::from(self.as_boolean()),
            Kind::Number => {
                let n = self.as_number();
                // +0.0 and -0.0 are equal, so they must hash alike.
                if n == 0.0 { hash_word(0) } else { hash_word(n.to_bits()) }
            }
            Kind::String | Kind::Symbol | Kind::Keyword => unsafe { (*self.string_ptr()).hash },
            Kind::Tuple => unsafe { (*self.tuple_ptr()).hash },
            Kind::Struct => unsafe { (*self.struct_ptr()).hash },
            _ => hash_word(self.0.payload_bits()),
        }
    }

    /// Total order: a fixed cross-type ordering first, then a type-specific
    /// order. NaN sorts after every other number and equal to itself, so
    /// sorting is deterministic.
    pub fn compare(self, other: Value) -> Ordering {
        let ka = self.kind();
        let kb = other.kind();
        if ka != kb {
            return (ka as u8).cmp(&(kb as u8));
        }
        match ka {
            Kind::Nil => Ordering::Equal,
            Kind::Boolean => self.as_boolean().cmp(&other.as_boolean()),
            Kind::Number => {
                let a = self.as_number();
                let b = other.as_number();
                match a.partial_cmp(&b) {
                    Some(ord) => ord,
                    None => match (a.is_nan(), b.is_nan()) {
                        (true, true) => Ordering::Equal,
                        (true, false) => Ordering::Greater,
                        (false, true) => Ordering::Less,
                        (false, false) => unreachable!(),
                    },
                }
            }
            Kind::String | Kind::Symbol | Kind::Keyword => {
                self.as_bytes().cmp(other.as_bytes())
            }
            Kind::Tuple => tuple::tuple_compare(self.tuple_ptr(), other.tuple_ptr()),
            Kind::Struct => structs::struct_compare(self.struct_ptr(), other.struct_ptr()),
            _ => {
                let a = self.0.payload_bits();
                let b = other.0.payload_bits();
                a.cmp(&b)
            }
        }
    }

    /// `compare` as the -1/0/1 integer the COMPARE instruction produces.
    pub fn compare_int(self, other: Value) -> i32 {
        match self.compare(other) {
            Ordering::Less => -1,
            Ordering::Equal => 0,
            Ordering::Greater => 1,
        }
    }
}

// =============================================================================
// The data protocol: get / put / length / next
// =============================================================================

impl Value {
    /// Permissive lookup: nil for a missing key or an unsupported data
    /// structure. Tables read through their prototype chain.
    pub fn get(self, key: Value) -> Value {
        match self.kind() {
            Kind::Table => table::table_get(self.table_ptr(), key),
            Kind::Struct => structs::struct_get(self.struct_ptr(), key),
            Kind::Array => match key.checked_index() {
                Some(i) => array::array_lookup(self.array_ptr(), i),
                None => Value::nil(),
            },
            Kind::Tuple => match key.checked_index() {
                Some(i) => tuple::tuple_lookup(self.tuple_ptr(), i),
                None => Value::nil(),
            },
            Kind::String | Kind::Symbol | Kind::Keyword => match key.checked_index() {
                Some(i) => {
                    let bytes = self.as_bytes();
                    if i < bytes.len() { Value::integer(i32::from(bytes[i])) } else { Value::nil() }
                }
                None => Value::nil(),
            },
            Kind::Buffer => match key.checked_index() {
                Some(i) => unsafe {
                    let buf = self.buffer_ptr();
                    if i < (*buf).count as usize {
                        Value::integer(i32::from(*(*buf).data.add(i)))
                    } else {
                        Value::nil()
                    }
                },
                None => Value::nil(),
            },
            _ => Value::nil(),
        }
    }

    /// Strict lookup, used by the IN instruction: sequences demand an
    /// in-range integer index, and non-indexable values are a type error.
    pub fn strict_get(self, key: Value) -> Value {
        match self.kind() {
            Kind::Table => table::table_get(self.table_ptr(), key),
            Kind::Struct => structs::struct_get(self.struct_ptr(), key),
            Kind::Array | Kind::Tuple | Kind::String | Kind::Symbol | Kind::Keyword
            | Kind::Buffer => {
                let len = self.length_usize();
                let Some(i) = key.checked_index() else {
                    panicf!("expected integer index, got {}", key.describe());
                };
                if i >= len {
                    panicf!("index {} out of range [0, {})", i, len);
                }
                self.get(key)
            }
            _ => panicf!("cannot index {}", self.kind().name()),
        }
    }

    /// Mutating put. Nil keys are a no-op on tables; a nil value deletes.
    pub fn put(self, key: Value, value: Value) {
        match self.kind() {
            Kind::Table => table::table_put(self.table_ptr(), key, value),
            Kind::Array => {
                let Some(i) = key.checked_index() else {
                    panicf!("expected integer index, got {}", key.describe());
                };
                array::array_put(self.array_ptr(), i, value);
            }
            Kind::Buffer => {
                let Some(i) = key.checked_index() else {
                    panicf!("expected integer index, got {}", key.describe());
                };
                let Some(byte) = value.checked_int().filter(|b| (0..=255).contains(b)) else {
                    panicf!("expected byte value, got {}", value.describe());
                };
                unsafe {
                    let buf = self.buffer_ptr();
                    if i >= (*buf).count as usize {
                        panicf!("index {} out of range [0, {})", i, (*buf).count);
                    }
                    *(*buf).data.add(i) = byte as u8;
                }
            }
            kind => panicf!("cannot put into {}", kind.name()),
        }
    }

    /// Element/byte/entry count. Panics for non-measurable kinds.
    pub fn length(self) -> Value {
        Value::number(self.length_usize() as f64)
    }

    pub fn length_usize(self) -> usize {
        match self.kind() {
            Kind::String | Kind::Symbol | Kind::Keyword => self.as_bytes().len(),
            Kind::Array => unsafe { (*self.array_ptr()).count as usize },
            Kind::Tuple => unsafe { (*self.tuple_ptr()).length as usize },
            Kind::Table => unsafe { (*self.table_ptr()).count as usize },
            Kind::Struct => unsafe { (*self.struct_ptr()).length as usize },
            Kind::Buffer => unsafe { (*self.buffer_ptr()).count as usize },
            kind => panicf!("cannot take length of {}", kind.name()),
        }
    }

    /// Next key in traversal order; nil starts the traversal, nil result
    /// ends it.
    pub fn next_key(self, key: Value) -> Value {
        match self.kind() {
            Kind::Array | Kind::Tuple | Kind::String | Kind::Symbol | Kind::Keyword
            | Kind::Buffer => {
                let len = self.length_usize();
                let next = match key.kind() {
                    Kind::Nil => 0,
                    _ => match key.checked_index() {
                        Some(i) => i + 1,
                        None => panicf!("expected integer key, got {}", key.describe()),
                    },
                };
                if next < len { Value::number(next as f64) } else { Value::nil() }
            }
            Kind::Table => table::table_next(self.table_ptr(), key),
            Kind::Struct => structs::struct_next(self.struct_ptr(), key),
            kind => panicf!("cannot iterate {}", kind.name()),
        }
    }
}

// =============================================================================
// Printing
// =============================================================================

fn escape_into(out: &mut String, bytes: &[u8]) {
    for &b in bytes {
        match b {
            b'"' => out.push_str("\\\""),
            b'\\' => out.push_str("\\\\"),
            b'\n' => out.push_str("\\n"),
            b'\t' => out.push_str("\\t"),
            0x20..=0x7E => out.push(b as char),
            _ => out.push_str(&format!("\\x{b:02x}")),
        }
    }
}

impl Value {
    /// Printable representation, used by MAKE_STRING, error messages and
    /// diagnostics. Bounded depth; never fails.
    pub fn describe(self) -> String {
        let mut out = String::new();
        self.describe_into(&mut out, PRINT_DEPTH);
        out
    }

    fn describe_into(self, out: &mut String, depth: u32) {
        if depth == 0 {
            out.push_str("...");
            return;
        }
        match self.kind() {
            Kind::Nil => out.push_str("nil"),
            Kind::Boolean => out.push_str(if self.as_boolean() { "true" } else { "false" }),
            Kind::Number => {
                let n = self.as_number();
                out.push_str(&format!("{n}"));
            }
            Kind::String => {
                out.push('"');
                escape_into(out, self.as_bytes());
                out.push('"');
            }
            Kind::Symbol => out.push_str(&String::from_utf8_lossy(self.as_bytes())),
            Kind::Keyword => {
                out.push(':');
                out.push_str(&String::from_utf8_lossy(self.as_bytes()));
            }
            Kind::Tuple => {
                let t = self.tuple_ptr();
                let bracket = unsafe { (*t).is_bracket() };
                out.push(if bracket { '[' } else { '(' });
                let len = unsafe { (*t).length as usize };
                for i in 0..len {
                    if i > 0 {
                        out.push(' ');
                    }
                    unsafe { (*t).get(i) }.describe_into(out, depth - 1);
                }
                out.push(if bracket { ']' } else { ')' });
            }
            Kind::Array => {
                out.push_str("@[");
                let a = self.array_ptr();
                let len = unsafe { (*a).count as usize };
                for i in 0..len {
                    if i > 0 {
                        out.push(' ');
                    }
                    array::array_lookup(a, i).describe_into(out, depth - 1);
                }
                out.push(']');
            }
            Kind::Table => {
                out.push_str("@{");
                self.describe_pairs(out, depth);
                out.push('}');
            }
            Kind::Struct => {
                out.push('{');
                self.describe_pairs(out, depth);
                out.push('}');
            }
            Kind::Buffer => {
                out.push_str("@\"");
                let b = self.buffer_ptr();
                unsafe {
                    escape_into(
                        out,
                        std::slice::from_raw_parts((*b).data, (*b).count as usize),
                    );
                }
                out.push('"');
            }
            Kind::Function => {
                let f = self.function_ptr();
                let name = unsafe { crate::function::funcdef_name((*f).def) };
                match name {
                    Some(n) => out.push_str(&format!("<function {n}>")),
                    None => out.push_str(&format!("<function 0x{:x}>", f as usize)),
                }
            }
            Kind::CFunction => match crate::api::cfunction_name(self) {
                Some(name) => out.push_str(&format!("<cfunction {name}>")),
                None => {
                    out.push_str(&format!("<cfunction 0x{:x}>", self.0.payload_bits()))
                }
            },
            Kind::Fiber => out.push_str(&format!("<fiber 0x{:x}>", self.0.payload_bits())),
            Kind::Abstract => {
                let a = self.abstract_ptr();
                let name = unsafe { (*a).abstract_type().name };
                out.push_str(&format!("<{name} 0x{:x}>", a as usize));
            }
        }
    }

    fn describe_pairs(self, out: &mut String, depth: u32) {
        let mut key = Value::nil();
        let mut first = true;
        loop {
            key = self.next_key(key);
            if key.is_nil() {
                break;
            }
            if !first {
                out.push(' ');
            }
            first = false;
            key.describe_into(out, depth - 1);
            out.push(' ');
            self.get(key).describe_into(out, depth - 1);
        }
    }

    /// Raw bytes contributed to MAKE_STRING and buffer formatting: byte
    /// payloads verbatim, everything else via `describe`.
    pub fn to_display_bytes(self) -> Vec<u8> {
        match self.kind() {
            Kind::String | Kind::Symbol | Kind::Keyword => self.as_bytes().to_vec(),
            Kind::Buffer => unsafe {
                let b = self.buffer_ptr();
                std::slice::from_raw_parts((*b).data, (*b).count as usize).to_vec()
            },
            _ => self.describe().into_bytes(),
        }
    }
}

impl std::fmt::Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.describe())
    }
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

    #[test]
    fn test_wrap_unwrap_roundtrip() {
        with_rt(|| {
            assert!(Value::nil().is_nil());
            assert!(Value::boolean(true).as_boolean());
            assert_eq!(Value::number(2.5).as_number(), 2.5);
            assert_eq!(Value::integer(-7).as_number(), -7.0);
            let s = Value::from_str("abc");
            assert_eq!(s.kind(), Kind::String);
            assert_eq!(s.as_bytes(), b"abc");
        });
    }

    #[test]
    fn test_equality_numbers_ieee() {
        with_rt(|| {
            assert!(Value::number(1.0).equals(Value::number(1.0)));
            assert!(!Value::number(f64::NAN).equals(Value::number(f64::NAN)));
            assert!(Value::number(0.0).equals(Value::number(-0.0)));
        });
    }

    #[test]
    fn test_equality_strings_by_content() {
        with_rt(|| {
            let a = Value::from_str("twin");
            let b = Value::from_str("twin");
            assert!(!a.identical(b));
            assert!(a.equals(b));
            assert_eq!(a.hash(), b.hash());
        });
    }

    #[test]
    fn test_symbols_equal_iff_identical() {
        with_rt(|| {
            let a = Value::symbol_from(b"x");
            let b = Value::symbol_from(b"x");
            assert!(a.identical(b));
            assert!(a.equals(b));
            // Symbol and keyword of the same name are different values.
            let kw = Value::keyword_from(b"x");
            assert!(!a.equals(kw));
        });
    }

    #[test]
    fn test_zero_hash_consistency() {
        with_rt(|| {
            assert_eq!(Value::number(0.0).hash(), Value::number(-0.0).hash());
        });
    }

    #[test]
    fn test_cross_type_ordering_fixed() {
        with_rt(|| {
            let nil = Value::nil();
            let b = Value::boolean(false);
            let n = Value::number(0.0);
            let s = Value::from_str("");
            assert_eq!(nil.compare(b), Ordering::Less);
            assert_eq!(b.compare(n), Ordering::Less);
            assert_eq!(n.compare(s), Ordering::Less);
            assert_eq!(s.compare(nil), Ordering::Greater);
        });
    }

    #[test]
    fn test_nan_sorts_deterministically() {
        with_rt(|| {
            let nan = Value::number(f64::NAN);
            let one = Value::number(1.0);
            let inf = Value::number(f64::INFINITY);
            assert_eq!(nan.compare(one), Ordering::Greater);
            assert_eq!(nan.compare(inf), Ordering::Greater);
            assert_eq!(one.compare(nan), Ordering::Less);
            assert_eq!(nan.compare(nan), Ordering::Equal);
        });
    }

    #[test]
    fn test_compare_int_values() {
        with_rt(|| {
            assert_eq!(Value::number(1.0).compare_int(Value::number(2.0)), -1);
            assert_eq!(Value::number(2.0).compare_int(Value::number(2.0)), 0);
            assert_eq!(Value::number(3.0).compare_int(Value::number(2.0)), 1);
        });
    }

    #[test]
    fn test_checked_int_range() {
        with_rt(|| {
            assert_eq!(Value::number(42.0).checked_int(), Some(42));
            assert_eq!(Value::number(-1.0).checked_int(), Some(-1));
            assert_eq!(Value::number(1.5).checked_int(), None);
            assert_eq!(Value::number(1e300).checked_int(), None);
            assert_eq!(Value::nil().checked_int(), None);
            assert_eq!(Value::number(-1.0).checked_index(), None);
        });
    }

    #[test]
    fn test_describe_basics() {
        with_rt(|| {
            assert_eq!(Value::nil().describe(), "nil");
            assert_eq!(Value::boolean(true).describe(), "true");
            assert_eq!(Value::number(100.0).describe(), "100");
            assert_eq!(Value::number(1.5).describe(), "1.5");
            assert_eq!(Value::from_str("hi\n").describe(), "\"hi\\n\"");
            assert_eq!(Value::keyword_from(b"name").describe(), ":name");
            assert_eq!(Value::symbol_from(b"name").describe(), "name");
        });
    }

    #[test]
    fn test_string_indexing() {
        with_rt(|| {
            let s = Value::from_str("abc");
            assert_eq!(s.get(Value::number(0.0)).as_number(), 97.0);
            assert!(s.get(Value::number(3.0)).is_nil());
            assert!(s.get(Value::from_str("x")).is_nil());
            assert_eq!(s.length_usize(), 3);
        });
    }

    mod laws {
        use super::*;
        use proptest::prelude::*;

        // Number-only laws run without a VM: the number path never
        // touches the heap.
        proptest! {
            #[test]
            fn prop_equal_numbers_hash_alike(a: f64) {
                let x = Value::number(a);
                let y = Value::number(a);
                if x.equals(y) {
                    prop_assert_eq!(x.hash(), y.hash());
                }
            }

            #[test]
            fn prop_compare_is_antisymmetric(a: f64, b: f64) {
                let x = Value::number(a);
                let y = Value::number(b);
                prop_assert_eq!(x.compare(y), y.compare(x).reverse());
            }

            #[test]
            fn prop_hash_is_stable(a: f64) {
                let x = Value::number(a);
                prop_assert_eq!(x.hash(), x.hash());
            }
        }
    }
}

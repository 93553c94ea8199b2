//! Value kinds and the fixed cross-type ordering.
//!
//! Every Vesper value has exactly one kind. The discriminant order below is
//! the total order used when values of different kinds are compared, and the
//! bit positions used by the TYPECHECK instruction's 16-bit mask.

/// Kind of a Vesper value.
///
/// The numeric discriminants are part of the bytecode contract: the
/// TYPECHECK instruction tests `(1 << kind)` against an immediate mask,
/// so reordering variants is a breaking change.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Kind {
    Nil = 0,
    Boolean = 1,
    Number = 2,
    String = 3,
    Symbol = 4,
    Keyword = 5,
    Array = 6,
    Tuple = 7,
    Table = 8,
    Struct = 9,
    Buffer = 10,
    Function = 11,
    CFunction = 12,
    Fiber = 13,
    Abstract = 14,
}

/// Number of kinds. Must stay <= 16 so TYPECHECK masks fit in 16 bits.
pub const KIND_COUNT: usize = 15;

const _: () = assert!(KIND_COUNT <= 16, "TYPECHECK masks are 16 bits wide");

impl Kind {
    /// Decode a kind from its discriminant.
    pub fn from_u8(tag: u8) -> Option<Kind> {
        match tag {
            0 => Some(Kind::Nil),
            1 => Some(Kind::Boolean),
            2 => Some(Kind::Number),
            3 => Some(Kind::String),
            4 => Some(Kind::Symbol),
            5 => Some(Kind::Keyword),
            6 => Some(Kind::Array),
            7 => Some(Kind::Tuple),
            8 => Some(Kind::Table),
            9 => Some(Kind::Struct),
            10 => Some(Kind::Buffer),
            11 => Some(Kind::Function),
            12 => Some(Kind::CFunction),
            13 => Some(Kind::Fiber),
            14 => Some(Kind::Abstract),
            _ => None,
        }
    }

    /// Human-readable kind name, as printed in type errors.
    pub fn name(self) -> &'static str {
        match self {
            Kind::Nil => "nil",
            Kind::Boolean => "boolean",
            Kind::Number => "number",
            Kind::String => "string",
            Kind::Symbol => "symbol",
            Kind::Keyword => "keyword",
            Kind::Array => "array",
            Kind::Tuple => "tuple",
            Kind::Table => "table",
            Kind::Struct => "struct",
            Kind::Buffer => "buffer",
            Kind::Function => "function",
            Kind::CFunction => "cfunction",
            Kind::Fiber => "fiber",
            Kind::Abstract => "abstract",
        }
    }

    /// Bit for this kind in a TYPECHECK mask.
    #[inline(always)]
    pub fn type_bit(self) -> u16 {
        1u16 << (self as u8)
    }

    /// True if values of this kind carry a payload pointer.
    #[inline(always)]
    pub fn is_pointer(self) -> bool {
        (self as u8) >= (Kind::String as u8)
    }

    /// True if the payload pointer refers to a GC-managed heap object.
    ///
    /// CFunctions carry a bare host function pointer, not a heap block.
    #[inline(always)]
    pub fn is_gc_object(self) -> bool {
        self.is_pointer() && self != Kind::CFunction
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_discriminants() {
        for tag in 0..KIND_COUNT as u8 {
            let kind = Kind::from_u8(tag).expect("valid tag");
            assert_eq!(kind as u8, tag);
        }
        assert_eq!(Kind::from_u8(KIND_COUNT as u8), None);
        assert_eq!(Kind::from_u8(255), None);
    }

    #[test]
    fn test_cross_type_order() {
        assert!(Kind::Nil < Kind::Boolean);
        assert!(Kind::Boolean < Kind::Number);
        assert!(Kind::Number < Kind::String);
        assert!(Kind::Function < Kind::Fiber);
    }

    #[test]
    fn test_pointer_classification() {
        assert!(!Kind::Nil.is_pointer());
        assert!(!Kind::Boolean.is_pointer());
        assert!(!Kind::Number.is_pointer());
        assert!(Kind::String.is_pointer());
        assert!(Kind::CFunction.is_pointer());
        assert!(!Kind::CFunction.is_gc_object());
        assert!(Kind::Fiber.is_gc_object());
        assert!(Kind::Abstract.is_gc_object());
    }

    #[test]
    fn test_type_bits_distinct() {
        let mut seen = 0u16;
        for tag in 0..KIND_COUNT as u8 {
            let bit = Kind::from_u8(tag).unwrap().type_bit();
            assert_eq!(seen & bit, 0, "duplicate type bit");
            seen |= bit;
        }
    }
}

//! Immutable key-value association.
//!
//! Stored as an open-addressed table whose capacity is a fixed function of
//! the declared length, so lookups stay O(1). Construction is
//! write-then-freeze: `struct_begin` reserves, `struct_put` fills,
//! `struct_end` caches the hash. The hash combines pairs commutatively, so
//! two structs with the same pairs are equal and hash alike regardless of
//! insertion order.

use std::cmp::Ordering;

use crate::gc::{self, GcHeader, MemoryKind};
use crate::state::with_vm;
use crate::value::Value;
use vesper_core::hash_combine;

/// Struct header; interleaved key/value slots follow inline.
#[repr(C)]
pub struct VStruct {
    pub(crate) gc: GcHeader,
    pub hash: u32,
    pub length: u32,
    pub capacity: u32,
    _pad: u32,
    data: [Value; 0],
}

impl VStruct {
    /// Raw slot access over the interleaved kv array; `index < 2*capacity`.
    #[inline(always)]
    pub(crate) fn kv(&self, index: usize) -> Value {
        debug_assert!(index < 2 * self.capacity as usize);
        unsafe { *self.data.as_ptr().add(index) }
    }

    #[inline(always)]
    fn kv_set(&mut self, index: usize, value: Value) {
        debug_assert!(index < 2 * self.capacity as usize);
        unsafe { *self.data.as_mut_ptr().add(index) = value }
    }
}

/// Slot capacity reserved for a struct of `length` pairs.
fn struct_capacity(length: usize) -> usize {
    if length == 0 { 0 } else { (2 * length).next_power_of_two() }
}

/// Reserve a scratch struct for up to `length` pairs.
pub fn struct_begin(length: usize) -> *mut VStruct {
    let capacity = struct_capacity(length);
    with_vm(|vm| {
        let size = std::mem::size_of::<VStruct>() + 2 * capacity * std::mem::size_of::<Value>();
        let st = gc::alloc(vm, MemoryKind::Struct, size) as *mut VStruct;
        unsafe {
            (*st).length = 0;
            (*st).capacity = capacity as u32;
            for i in 0..2 * capacity {
                (*st).kv_set(i, Value::nil());
            }
        }
        st
    })
}

/// Insert a pair into a struct under construction. Nil keys, NaN keys and
/// nil values are ignored; putting an existing key overwrites its value.
pub fn struct_put(st: *mut VStruct, key: Value, value: Value) {
    if key.is_nil() || value.is_nil() {
        return;
    }
    if key.checktype(vesper_core::Kind::Number) && key.as_number().is_nan() {
        return;
    }
    unsafe {
        let cap = (*st).capacity as usize;
        debug_assert!(((*st).length as usize) < cap, "struct over-filled");
        let mask = cap - 1;
        let mut idx = key.hash() as usize & mask;
        loop {
            let existing = (*st).kv(2 * idx);
            if existing.is_nil() {
                (*st).kv_set(2 * idx, key);
                (*st).kv_set(2 * idx + 1, value);
                (*st).length += 1;
                return;
            }
            if existing.equals(key) {
                (*st).kv_set(2 * idx + 1, value);
                return;
            }
            idx = (idx + 1) & mask;
        }
    }
}

/// Freeze a struct: computes the order-independent hash.
pub fn struct_end(st: *mut VStruct) -> *mut VStruct {
    unsafe {
        let mut hash = hash_combine(0x5BD1_E995, (*st).length);
        for i in 0..(*st).capacity as usize {
            let key = (*st).kv(2 * i);
            if key.is_nil() {
                continue;
            }
            let value = (*st).kv(2 * i + 1);
            // Commutative pair combine keeps the hash independent of slot
            // placement and insertion order.
            hash = hash.wrapping_add(hash_combine(key.hash(), value.hash()));
        }
        (*st).hash = hash;
    }
    st
}

/// Build a struct from interleaved key/value pairs.
pub fn struct_of(pairs: &[Value]) -> *mut VStruct {
    debug_assert!(pairs.len() % 2 == 0);
    let st = struct_begin(pairs.len() / 2);
    for pair in pairs.chunks_exact(2) {
        struct_put(st, pair[0], pair[1]);
    }
    struct_end(st)
}

/// Lookup; nil for a missing key.
pub fn struct_get(st: *mut VStruct, key: Value) -> Value {
    if key.is_nil() {
        return Value::nil();
    }
    unsafe {
        let cap = (*st).capacity as usize;
        if cap == 0 {
            return Value::nil();
        }
        let mask = cap - 1;
        let mut idx = key.hash() as usize & mask;
        loop {
            let existing = (*st).kv(2 * idx);
            if existing.is_nil() {
                return Value::nil();
            }
            if existing.equals(key) {
                return (*st).kv(2 * idx + 1);
            }
            idx = (idx + 1) & mask;
        }
    }
}

/// Next key in slot order; nil starts and ends the traversal.
pub fn struct_next(st: *mut VStruct, key: Value) -> Value {
    unsafe {
        let cap = (*st).capacity as usize;
        let start = if key.is_nil() {
            0
        } else {
            let mask = cap.max(1) - 1;
            let mut idx = key.hash() as usize & mask;
            loop {
                if cap == 0 {
                    return Value::nil();
                }
                let existing = (*st).kv(2 * idx);
                if existing.is_nil() {
                    return Value::nil();
                }
                if existing.equals(key) {
                    break idx + 1;
                }
                idx = (idx + 1) & mask;
            }
        };
        for idx in start..cap {
            let slot_key = (*st).kv(2 * idx);
            if !slot_key.is_nil() {
                return slot_key;
            }
        }
        Value::nil()
    }
}

pub(crate) fn struct_equals(a: *mut VStruct, b: *mut VStruct) -> bool {
    if a == b {
        return true;
    }
    unsafe {
        if (*a).length != (*b).length || (*a).hash != (*b).hash {
            return false;
        }
        for i in 0..(*a).capacity as usize {
            let key = (*a).kv(2 * i);
            if key.is_nil() {
                continue;
            }
            if !struct_get(b, key).equals((*a).kv(2 * i + 1)) {
                return false;
            }
        }
    }
    true
}

/// Occupied pairs in canonical order: sorted by key, then value, so the
/// result is independent of slot placement and insertion order.
unsafe fn sorted_pairs(st: *mut VStruct) -> Vec<(Value, Value)> {
    unsafe {
        let mut pairs = Vec::with_capacity((*st).length as usize);
        for i in 0..(*st).capacity as usize {
            let key = (*st).kv(2 * i);
            if !key.is_nil() {
                pairs.push((key, (*st).kv(2 * i + 1)));
            }
        }
        pairs.sort_by(|x, y| x.0.compare(y.0).then_with(|| x.1.compare(y.1)));
        pairs
    }
}

/// Total order on logical content: length, then the canonically sorted
/// pair sequences. Two structs that are `struct_equals` always compare
/// Equal, whatever order their pairs were inserted in.
pub(crate) fn struct_compare(a: *mut VStruct, b: *mut VStruct) -> Ordering {
    if a == b {
        return Ordering::Equal;
    }
    unsafe {
        let ord = (*a).length.cmp(&(*b).length);
        if ord != Ordering::Equal {
            return ord;
        }
        let pa = sorted_pairs(a);
        let pb = sorted_pairs(b);
        for ((ka, va), (kb, vb)) in pa.iter().zip(pb.iter()) {
            let ord = ka.compare(*kb);
            if ord != Ordering::Equal {
                return ord;
            }
            let ord = va.compare(*vb);
            if ord != Ordering::Equal {
                return ord;
            }
        }
    }
    Ordering::Equal
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

    fn kw(name: &[u8]) -> Value {
        Value::keyword_from(name)
    }

    #[test]
    fn test_put_then_get() {
        with_rt(|| {
            let st = struct_begin(2);
            struct_put(st, kw(b"a"), Value::number(1.0));
            struct_put(st, kw(b"b"), Value::number(2.0));
            let st = struct_end(st);
            assert_eq!(struct_get(st, kw(b"a")).as_number(), 1.0);
            assert_eq!(struct_get(st, kw(b"b")).as_number(), 2.0);
            assert!(struct_get(st, kw(b"c")).is_nil());
            unsafe {
                assert_eq!((*st).length, 2);
            }
        });
    }

    #[test]
    fn test_put_order_does_not_matter() {
        with_rt(|| {
            let a = struct_of(&[kw(b"x"), Value::number(1.0), kw(b"y"), Value::number(2.0)]);
            let b = struct_of(&[kw(b"y"), Value::number(2.0), kw(b"x"), Value::number(1.0)]);
            assert!(struct_equals(a, b));
            unsafe {
                assert_eq!((*a).hash, (*b).hash);
            }
        });
    }

    #[test]
    fn test_nil_entries_ignored() {
        with_rt(|| {
            let st = struct_begin(3);
            struct_put(st, Value::nil(), Value::number(1.0));
            struct_put(st, kw(b"k"), Value::nil());
            struct_put(st, Value::number(f64::NAN), Value::number(1.0));
            let st = struct_end(st);
            unsafe {
                assert_eq!((*st).length, 0);
            }
        });
    }

    #[test]
    fn test_duplicate_key_overwrites() {
        with_rt(|| {
            let st = struct_begin(2);
            struct_put(st, kw(b"k"), Value::number(1.0));
            struct_put(st, kw(b"k"), Value::number(2.0));
            let st = struct_end(st);
            unsafe {
                assert_eq!((*st).length, 1);
            }
            assert_eq!(struct_get(st, kw(b"k")).as_number(), 2.0);
        });
    }

    #[test]
    fn test_empty_struct() {
        with_rt(|| {
            let a = struct_of(&[]);
            let b = struct_of(&[]);
            assert!(struct_equals(a, b));
            assert!(struct_get(a, kw(b"missing")).is_nil());
            assert!(struct_next(a, Value::nil()).is_nil());
        });
    }

    #[test]
    fn test_traversal_visits_all_keys() {
        with_rt(|| {
            let st = struct_of(&[
                kw(b"a"), Value::number(1.0),
                kw(b"b"), Value::number(2.0),
                kw(b"c"), Value::number(3.0),
            ]);
            let mut seen = 0;
            let mut key = Value::nil();
            loop {
                key = struct_next(st, key);
                if key.is_nil() {
                    break;
                }
                seen += 1;
                assert!(!struct_get(st, key).is_nil());
            }
            assert_eq!(seen, 3);
        });
    }

    #[test]
    fn test_compare_consistent_with_equality() {
        with_rt(|| {
            // :a and :e collide into the same bucket of a capacity-4 slot
            // array under the default mixer, so these two builds place
            // their pairs in different physical slots.
            let a = struct_of(&[kw(b"a"), Value::number(1.0), kw(b"e"), Value::number(2.0)]);
            let b = struct_of(&[kw(b"e"), Value::number(2.0), kw(b"a"), Value::number(1.0)]);
            assert!(struct_equals(a, b));
            assert_eq!(struct_compare(a, b), Ordering::Equal);
            assert_eq!(
                Value::structure(a).compare(Value::structure(b)),
                Ordering::Equal
            );

            // Unequal content still orders, antisymmetrically.
            let c = struct_of(&[kw(b"a"), Value::number(9.0), kw(b"e"), Value::number(2.0)]);
            let ord = struct_compare(a, c);
            assert_ne!(ord, Ordering::Equal);
            assert_eq!(struct_compare(c, a), ord.reverse());
        });
    }

    #[test]
    fn test_number_keys() {
        with_rt(|| {
            let st = struct_of(&[Value::number(1.0), kw(b"one"), Value::number(2.0), kw(b"two")]);
            assert_eq!(struct_get(st, Value::number(2.0)).as_bytes(), b"two");
        });
    }
}

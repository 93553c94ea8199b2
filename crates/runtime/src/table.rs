//! Mutable open-addressed hash table with prototype lookup.
//!
//! Slots store interleaved key/value pairs. A live entry never has a nil
//! key or a nil value, so nil-key slots encode the free states: value nil
//! means never used, value false means a tombstone left by a deletion.
//! Reads may traverse the prototype chain up to a bounded depth; writes
//! always hit the table itself.

use crate::gc::{self, GcHeader, MemoryKind};
use crate::panicf;
use crate::state::{VmState, with_vm};
use crate::value::Value;
use vesper_core::Kind;

/// Bound on prototype-chain traversal for reads.
pub const MAX_PROTO_DEPTH: u32 = 200;

/// Managed table header; the kv slot array is a separately owned
/// allocation of `2 * capacity` values.
#[repr(C)]
pub struct VTable {
    pub(crate) gc: GcHeader,
    pub count: i32,
    pub capacity: i32,
    pub deleted: i32,
    _pad: i32,
    pub data: *mut Value,
    pub proto: *mut VTable,
}

fn initial_capacity(hint: usize) -> usize {
    std::cmp::max(2, hint.next_power_of_two())
}

/// Allocate a table sized for roughly `hint` entries.
pub(crate) fn table_new(vm: &VmState, hint: usize) -> *mut VTable {
    let capacity = initial_capacity(hint);
    let table = gc::alloc(vm, MemoryKind::Table, std::mem::size_of::<VTable>()) as *mut VTable;
    unsafe {
        (*table).count = 0;
        (*table).capacity = capacity as i32;
        (*table).deleted = 0;
        (*table).data = alloc_slots(vm, capacity);
        (*table).proto = std::ptr::null_mut();
    }
    table
}

/// Allocate a table from host code.
pub fn table_create(hint: usize) -> *mut VTable {
    with_vm(|vm| table_new(vm, hint))
}

fn alloc_slots(vm: &VmState, capacity: usize) -> *mut Value {
    let data = gc::alloc_payload::<Value>(vm, 2 * capacity);
    // Zeroed memory is not the nil encoding; clear every slot explicitly.
    unsafe {
        for i in 0..2 * capacity {
            *data.add(i) = Value::nil();
        }
    }
    data
}

#[inline(always)]
unsafe fn slot_key(table: *mut VTable, idx: usize) -> Value {
    unsafe { *(*table).data.add(2 * idx) }
}

#[inline(always)]
unsafe fn slot_value(table: *mut VTable, idx: usize) -> Value {
    unsafe { *(*table).data.add(2 * idx + 1) }
}

#[inline(always)]
unsafe fn slot_set(table: *mut VTable, idx: usize, key: Value, value: Value) {
    unsafe {
        *(*table).data.add(2 * idx) = key;
        *(*table).data.add(2 * idx + 1) = value;
    }
}

/// Probe result: the slot holding `key`, or the first reusable bucket
/// (tombstone if one was passed, else the terminating never-used slot).
fn table_find(table: *mut VTable, key: Value) -> (Option<usize>, usize) {
    unsafe {
        let cap = (*table).capacity as usize;
        let mask = cap - 1;
        let mut idx = key.hash() as usize & mask;
        let mut first_free: Option<usize> = None;
        for _ in 0..cap {
            let k = slot_key(table, idx);
            if k.is_nil() {
                if slot_value(table, idx).is_nil() {
                    // Never-used slot terminates the probe chain.
                    return (None, first_free.unwrap_or(idx));
                }
                // Tombstone: remember for reuse, keep probing.
                if first_free.is_none() {
                    first_free = Some(idx);
                }
            } else if k.equals(key) {
                return (Some(idx), idx);
            }
            idx = (idx + 1) & mask;
        }
        (None, first_free.expect("table probe found no free slot"))
    }
}

/// Lookup without prototype traversal.
pub fn table_rawget(table: *mut VTable, key: Value) -> Value {
    if key.is_nil() {
        return Value::nil();
    }
    match table_find(table, key) {
        (Some(idx), _) => unsafe { slot_value(table, idx) },
        (None, _) => Value::nil(),
    }
}

/// Lookup, reading through the prototype chain up to [`MAX_PROTO_DEPTH`].
pub fn table_get(table: *mut VTable, key: Value) -> Value {
    let mut current = table;
    let mut depth = 0;
    while !current.is_null() && depth < MAX_PROTO_DEPTH {
        let found = table_rawget(current, key);
        if !found.is_nil() {
            return found;
        }
        current = unsafe { (*current).proto };
        depth += 1;
    }
    Value::nil()
}

/// Insert, overwrite or delete. A nil (or NaN) key is a no-op; a nil value
/// deletes the key.
pub fn table_put(table: *mut VTable, key: Value, value: Value) {
    if key.is_nil() {
        return;
    }
    if key.checktype(Kind::Number) && key.as_number().is_nan() {
        return;
    }
    if value.is_nil() {
        table_remove(table, key);
        return;
    }
    unsafe {
        // Rehash ahead of the insert so a free slot always exists.
        if 2 * ((*table).count + (*table).deleted + 1) > (*table).capacity {
            table_rehash(table);
        }
        match table_find(table, key) {
            (Some(idx), _) => slot_set(table, idx, key, value),
            (None, free) => {
                if !slot_key(table, free).is_nil() || !slot_value(table, free).is_nil() {
                    // Reusing a tombstone.
                    (*table).deleted -= 1;
                }
                slot_set(table, free, key, value);
                (*table).count += 1;
            }
        }
    }
}

/// Delete a key, returning the previous value (nil if absent).
pub fn table_remove(table: *mut VTable, key: Value) -> Value {
    if key.is_nil() {
        return Value::nil();
    }
    match table_find(table, key) {
        (Some(idx), _) => unsafe {
            let old = slot_value(table, idx);
            slot_set(table, idx, Value::nil(), Value::boolean(false));
            (*table).count -= 1;
            (*table).deleted += 1;
            old
        },
        (None, _) => Value::nil(),
    }
}

fn table_rehash(table: *mut VTable) {
    unsafe {
        let old_cap = (*table).capacity as usize;
        let old_data = (*table).data;
        let new_cap = std::cmp::max(
            initial_capacity(0),
            (2 * (*table).count as usize + 2).next_power_of_two(),
        );
        with_vm(|vm| {
            (*table).data = alloc_slots(vm, new_cap);
            (*table).capacity = new_cap as i32;
            (*table).count = 0;
            (*table).deleted = 0;
            for idx in 0..old_cap {
                let key = *old_data.add(2 * idx);
                if !key.is_nil() {
                    let value = *old_data.add(2 * idx + 1);
                    match table_find(table, key) {
                        (Some(_), _) => unreachable!("duplicate key during rehash"),
                        (None, free) => {
                            slot_set(table, free, key, value);
                            (*table).count += 1;
                        }
                    }
                }
            }
            gc::free_payload(old_data, 2 * old_cap);
        });
    }
}

/// Remove every entry, keeping capacity and prototype.
pub fn table_clear(table: *mut VTable) {
    unsafe {
        for idx in 0..(*table).capacity as usize {
            slot_set(table, idx, Value::nil(), Value::nil());
        }
        (*table).count = 0;
        (*table).deleted = 0;
    }
}

/// Next key in slot order; nil starts and ends the traversal. The key must
/// be present (or nil).
pub fn table_next(table: *mut VTable, key: Value) -> Value {
    unsafe {
        let cap = (*table).capacity as usize;
        let start = if key.is_nil() {
            0
        } else {
            match table_find(table, key) {
                (Some(idx), _) => idx + 1,
                (None, _) => panicf!("key {} not found in table", key.describe()),
            }
        };
        for idx in start..cap {
            let k = slot_key(table, idx);
            if !k.is_nil() {
                return k;
            }
        }
        Value::nil()
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

    fn kw(name: &[u8]) -> Value {
        Value::keyword_from(name)
    }

    #[test]
    fn test_put_get_roundtrip() {
        with_rt(|| {
            let t = table_create(0);
            table_put(t, kw(b"a"), Value::number(1.0));
            table_put(t, Value::from_str("s"), Value::number(2.0));
            table_put(t, Value::number(3.0), Value::number(3.0));
            assert_eq!(table_get(t, kw(b"a")).as_number(), 1.0);
            assert_eq!(table_get(t, Value::from_str("s")).as_number(), 2.0);
            assert_eq!(table_get(t, Value::number(3.0)).as_number(), 3.0);
            unsafe {
                assert_eq!((*t).count, 3);
            }
        });
    }

    #[test]
    fn test_nil_key_is_noop_and_nil_value_deletes() {
        with_rt(|| {
            let t = table_create(0);
            table_put(t, Value::nil(), Value::number(1.0));
            unsafe {
                assert_eq!((*t).count, 0);
            }
            table_put(t, kw(b"k"), Value::number(1.0));
            table_put(t, kw(b"k"), Value::nil());
            unsafe {
                assert_eq!((*t).count, 0);
                assert_eq!((*t).deleted, 1);
            }
            assert!(table_get(t, kw(b"k")).is_nil());
        });
    }

    #[test]
    fn test_tombstone_reuse() {
        with_rt(|| {
            let t = table_create(4);
            table_put(t, kw(b"x"), Value::number(1.0));
            table_remove(t, kw(b"x"));
            unsafe {
                assert_eq!((*t).deleted, 1);
            }
            table_put(t, kw(b"x"), Value::number(2.0));
            unsafe {
                assert_eq!((*t).deleted, 0);
                assert_eq!((*t).count, 1);
            }
            assert_eq!(table_get(t, kw(b"x")).as_number(), 2.0);
        });
    }

    #[test]
    fn test_growth_preserves_entries() {
        with_rt(|| {
            let t = table_create(0);
            for i in 0..200 {
                table_put(t, Value::number(f64::from(i)), Value::number(f64::from(i * 2)));
            }
            unsafe {
                assert_eq!((*t).count, 200);
                assert!((*t).capacity >= 256);
                // Capacity stays a power of two.
                assert_eq!((*t).capacity & ((*t).capacity - 1), 0);
            }
            for i in 0..200 {
                assert_eq!(
                    table_get(t, Value::number(f64::from(i))).as_number(),
                    f64::from(i * 2)
                );
            }
        });
    }

    #[test]
    fn test_prototype_chain() {
        with_rt(|| {
            let proto = table_create(0);
            table_put(proto, kw(b"a"), Value::number(1.0));
            let t = table_create(0);
            unsafe {
                (*t).proto = proto;
            }
            // Inherited read.
            assert_eq!(table_get(t, kw(b"a")).as_number(), 1.0);
            assert!(table_rawget(t, kw(b"a")).is_nil());
            // Shadowing write hits the child only.
            table_put(t, kw(b"a"), Value::number(2.0));
            assert_eq!(table_get(t, kw(b"a")).as_number(), 2.0);
            assert_eq!(table_get(proto, kw(b"a")).as_number(), 1.0);
            // Deleting the shadow re-exposes the prototype value.
            table_put(t, kw(b"a"), Value::nil());
            assert_eq!(table_get(t, kw(b"a")).as_number(), 1.0);
        });
    }

    #[test]
    fn test_proto_cycle_bounded() {
        with_rt(|| {
            let a = table_create(0);
            let b = table_create(0);
            unsafe {
                (*a).proto = b;
                (*b).proto = a;
            }
            // Lookup terminates despite the cycle.
            assert!(table_get(a, kw(b"missing")).is_nil());
        });
    }

    #[test]
    fn test_traversal_visits_everything() {
        with_rt(|| {
            let t = table_create(0);
            for i in 0..50 {
                table_put(t, Value::number(f64::from(i)), Value::boolean(true));
            }
            let mut seen = 0;
            let mut key = Value::nil();
            loop {
                key = table_next(t, key);
                if key.is_nil() {
                    break;
                }
                seen += 1;
            }
            assert_eq!(seen, 50);
        });
    }

    #[test]
    fn test_clear() {
        with_rt(|| {
            let t = table_create(0);
            table_put(t, kw(b"a"), Value::number(1.0));
            table_remove(t, kw(b"a"));
            table_put(t, kw(b"b"), Value::number(2.0));
            table_clear(t);
            unsafe {
                assert_eq!((*t).count, 0);
                assert_eq!((*t).deleted, 0);
            }
            assert!(table_get(t, kw(b"b")).is_nil());
        });
    }
}

//! Non-moving, precise, stop-the-world mark-and-sweep collector.
//!
//! Every managed allocation starts with a [`GcHeader`] threading it into a
//! single intrusive list owned by the thread's VM state. Collection marks
//! from the roots (current fiber, root fiber, registries, host roots, the
//! return and panic registers) through an explicit worklist — never by deep
//! recursion — then sweeps the list, finalizing and freeing dead blocks.
//!
//! Payload arrays owned by containers (array/buffer/table data, fiber
//! stacks, function-definition tables) are plain allocations freed by the
//! owner's finalizer; they still count toward allocation pressure.
//!
//! Collection runs only between instructions or when explicitly requested,
//! and never while `gclock` is held.

use std::alloc::{Layout, alloc_zeroed, dealloc};

use crate::state::{VmState, with_vm};
use crate::value::Value;

/// Alignment of every managed block and payload.
pub(crate) const GC_ALIGN: usize = 8;

/// Kind of a managed heap block.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryKind {
    String = 0,
    Symbol = 1,
    Array = 2,
    Tuple = 3,
    Table = 4,
    Struct = 5,
    Buffer = 6,
    Function = 7,
    FuncDef = 8,
    FuncEnv = 9,
    Fiber = 10,
    Abstract = 11,
}

/// Mark bit: set during the mark phase, cleared during sweep.
pub(crate) const GC_MARK: u8 = 0x01;
/// Foreign bit: payload memory is not owned and must not be freed or grown.
pub(crate) const GC_FOREIGN: u8 = 0x02;

/// Header prefixed to every managed allocation.
#[repr(C)]
pub struct GcHeader {
    pub(crate) next: *mut GcHeader,
    pub(crate) size: usize,
    pub(crate) kind: MemoryKind,
    pub(crate) flags: u8,
}

impl GcHeader {
    #[inline(always)]
    pub(crate) fn is_marked(&self) -> bool {
        self.flags & GC_MARK != 0
    }

    #[inline(always)]
    pub(crate) fn is_foreign(&self) -> bool {
        self.flags & GC_FOREIGN != 0
    }
}

/// Abort the process on allocation failure. Out-of-memory is fatal.
pub(crate) fn oom_abort(what: &str) -> ! {
    use std::io::Write;
    let mut err = std::io::stderr().lock();
    let _ = writeln!(err, "vesper: out of memory ({what})");
    let _ = err.flush();
    unsafe { libc::abort() }
}

fn block_layout(size: usize) -> Layout {
    Layout::from_size_align(size, GC_ALIGN).unwrap_or_else(|_| oom_abort("layout overflow"))
}

// =============================================================================
// Allocation
// =============================================================================

/// Allocate a zero-initialized managed block of `size` bytes (header
/// included), link it into the block list and account the pressure.
pub(crate) fn alloc(vm: &VmState, kind: MemoryKind, size: usize) -> *mut GcHeader {
    debug_assert!(size >= std::mem::size_of::<GcHeader>());
    let ptr = unsafe { alloc_zeroed(block_layout(size)) } as *mut GcHeader;
    if ptr.is_null() {
        oom_abort("managed block");
    }
    unsafe {
        (*ptr).next = vm.blocks.get();
        (*ptr).size = size;
        (*ptr).kind = kind;
        (*ptr).flags = 0;
    }
    vm.blocks.set(ptr);
    vm.block_count.set(vm.block_count.get() + 1);
    if vm.block_count.get() > vm.stats.peak_blocks.get() {
        vm.stats.peak_blocks.set(vm.block_count.get());
    }
    vm.stats.blocks_allocated.set(vm.stats.blocks_allocated.get() + 1);
    vm.stats.bytes_allocated.set(vm.stats.bytes_allocated.get() + size as u64);
    vm.next_collection.set(vm.next_collection.get().saturating_add(size));
    ptr
}

/// Allocate an owned payload array of `count` items of `T`, zeroed.
pub(crate) fn alloc_payload<T>(vm: &VmState, count: usize) -> *mut T {
    if count == 0 {
        return std::ptr::NonNull::<T>::dangling().as_ptr();
    }
    let layout = Layout::array::<T>(count).unwrap_or_else(|_| oom_abort("payload layout"));
    let ptr = unsafe { alloc_zeroed(layout) } as *mut T;
    if ptr.is_null() {
        oom_abort("payload array");
    }
    vm.next_collection.set(vm.next_collection.get().saturating_add(layout.size()));
    ptr
}

/// Free a payload array previously created with [`alloc_payload`].
pub(crate) unsafe fn free_payload<T>(ptr: *mut T, count: usize) {
    if count == 0 || ptr.is_null() {
        return;
    }
    let layout = Layout::array::<T>(count).expect("payload layout");
    unsafe { dealloc(ptr as *mut u8, layout) };
}

// =============================================================================
// Collection entry points
// =============================================================================

/// Collect if allocation pressure crossed the configured interval.
pub fn maybe_collect() {
    with_vm(|vm| {
        if vm.gc_lock.get() == 0 && vm.next_collection.get() >= vm.gc_interval.get() {
            unsafe { collect_vm(vm) };
        }
    });
}

/// Unconditionally run a full collection.
pub fn collect() {
    with_vm(|vm| {
        if vm.gc_lock.get() == 0 {
            unsafe { collect_vm(vm) };
        }
    });
}

pub(crate) unsafe fn collect_vm(vm: &VmState) {
    // Mark phase: seed the worklist with every root, then drain it.
    mark_ptr(vm, vm.fiber.get() as *mut GcHeader);
    mark_ptr(vm, vm.root_fiber.get() as *mut GcHeader);
    mark_ptr(vm, vm.registry.get() as *mut GcHeader);
    mark_ptr(vm, vm.core_env.get() as *mut GcHeader);
    mark_value(vm, vm.return_reg.get());
    mark_value(vm, vm.panic_payload.get());
    {
        let roots = vm.roots.borrow();
        for &root in roots.iter() {
            mark_value(vm, root);
        }
    }
    process_traversal(vm);

    unsafe { sweep(vm) };

    vm.next_collection.set(0);
    vm.stats.collections.set(vm.stats.collections.get() + 1);
    crate::diagnostics::TOTAL_COLLECTIONS.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
}

// =============================================================================
// Marking
// =============================================================================

/// Mark a value if it references a managed block.
pub(crate) fn mark_value(vm: &VmState, value: Value) {
    if value.kind().is_gc_object() {
        mark_ptr(vm, value.gc_header());
    }
}

/// Mark a block and queue it for child traversal.
pub(crate) fn mark_ptr(vm: &VmState, obj: *mut GcHeader) {
    if obj.is_null() {
        return;
    }
    unsafe {
        if (*obj).is_marked() {
            return;
        }
        (*obj).flags |= GC_MARK;
    }
    vm.traversal.borrow_mut().push(obj);
}

/// Drain the worklist, expanding each block's children.
fn process_traversal(vm: &VmState) {
    loop {
        let next = vm.traversal.borrow_mut().pop();
        let Some(obj) = next else { break };
        unsafe { mark_children(vm, obj) };
    }
}

unsafe fn mark_children(vm: &VmState, obj: *mut GcHeader) {
    unsafe {
        match (*obj).kind {
            MemoryKind::String | MemoryKind::Symbol | MemoryKind::Buffer => {}
            MemoryKind::Array => {
                let arr = obj as *mut crate::array::VArray;
                for i in 0..(*arr).count as usize {
                    mark_value(vm, *(*arr).data.add(i));
                }
            }
            MemoryKind::Tuple => {
                let tup = obj as *mut crate::tuple::VTuple;
                for i in 0..(*tup).length as usize {
                    mark_value(vm, (*tup).get(i));
                }
            }
            MemoryKind::Table => {
                let table = obj as *mut crate::table::VTable;
                let slots = 2 * (*table).capacity as usize;
                for i in 0..slots {
                    mark_value(vm, *(*table).data.add(i));
                }
                mark_ptr(vm, (*table).proto as *mut GcHeader);
            }
            MemoryKind::Struct => {
                let st = obj as *mut crate::structs::VStruct;
                let slots = 2 * (*st).capacity as usize;
                for i in 0..slots {
                    mark_value(vm, (*st).kv(i));
                }
            }
            MemoryKind::Function => {
                let func = obj as *mut crate::function::Function;
                mark_ptr(vm, (*func).def as *mut GcHeader);
                for i in 0..(*func).env_count() {
                    mark_ptr(vm, (*func).env(i) as *mut GcHeader);
                }
            }
            MemoryKind::FuncDef => {
                let def = obj as *mut crate::function::FuncDef;
                for i in 0..(*def).constants_len as usize {
                    mark_value(vm, *(*def).constants.add(i));
                }
                for i in 0..(*def).defs_len as usize {
                    mark_ptr(vm, *(*def).defs.add(i) as *mut GcHeader);
                }
                mark_ptr(vm, (*def).name as *mut GcHeader);
                mark_ptr(vm, (*def).source as *mut GcHeader);
            }
            MemoryKind::FuncEnv => {
                let env = obj as *mut crate::function::FuncEnv;
                if (*env).offset > 0 {
                    // On-stack: the referenced fiber owns the slots.
                    mark_ptr(vm, (*env).fiber as *mut GcHeader);
                } else {
                    for i in 0..(*env).length as usize {
                        mark_value(vm, *(*env).values.add(i));
                    }
                }
            }
            MemoryKind::Fiber => {
                crate::fiber::mark_fiber(vm, obj as *mut crate::fiber::Fiber);
            }
            MemoryKind::Abstract => {
                let abs = obj as *mut crate::value::VAbstract;
                if let Some(gcmark) = (*(*abs).ty).gcmark {
                    gcmark((*abs).data_ptr(), (*abs).size);
                }
            }
        }
    }
}

/// Mark a value from inside an abstract type's `gcmark` hook.
pub fn mark_from_abstract(value: Value) {
    with_vm(|vm| mark_value(vm, value));
}

// =============================================================================
// Sweeping
// =============================================================================

unsafe fn sweep(vm: &VmState) {
    let mut prev: *mut GcHeader = std::ptr::null_mut();
    let mut cur = vm.blocks.get();
    let mut freed: u64 = 0;
    unsafe {
        while !cur.is_null() {
            let next = (*cur).next;
            if (*cur).is_marked() {
                (*cur).flags &= !GC_MARK;
                prev = cur;
            } else {
                if prev.is_null() {
                    vm.blocks.set(next);
                } else {
                    (*prev).next = next;
                }
                finalize_block(vm, cur);
                dealloc(cur as *mut u8, block_layout((*cur).size));
                vm.block_count.set(vm.block_count.get() - 1);
                freed += 1;
            }
            cur = next;
        }
    }
    vm.stats.blocks_freed.set(vm.stats.blocks_freed.get() + freed);
}

/// Free every block unconditionally. Used by `deinit`.
pub(crate) unsafe fn sweep_all(vm: &VmState) {
    let mut cur = vm.blocks.get();
    unsafe {
        while !cur.is_null() {
            let next = (*cur).next;
            finalize_block(vm, cur);
            dealloc(cur as *mut u8, block_layout((*cur).size));
            cur = next;
        }
    }
    vm.blocks.set(std::ptr::null_mut());
    vm.block_count.set(0);
}

/// Release resources owned by a dying block: payload arrays, the interned
/// entry for symbols, abstract finalizers. Foreign-backed payloads are left
/// alone.
unsafe fn finalize_block(vm: &VmState, obj: *mut GcHeader) {
    unsafe {
        match (*obj).kind {
            MemoryKind::String => {}
            MemoryKind::Symbol => {
                vm.cache.borrow_mut().remove(obj as *mut crate::strings::VString);
            }
            MemoryKind::Array => {
                let arr = obj as *mut crate::array::VArray;
                free_payload((*arr).data, (*arr).capacity as usize);
            }
            MemoryKind::Buffer => {
                let buf = obj as *mut crate::buffer::VBuffer;
                if !(*obj).is_foreign() {
                    free_payload((*buf).data, (*buf).capacity as usize);
                }
            }
            MemoryKind::Table => {
                let table = obj as *mut crate::table::VTable;
                free_payload((*table).data, 2 * (*table).capacity as usize);
            }
            MemoryKind::Tuple | MemoryKind::Struct | MemoryKind::Function => {}
            MemoryKind::FuncDef => {
                crate::function::finalize_funcdef(obj as *mut crate::function::FuncDef);
            }
            MemoryKind::FuncEnv => {
                let env = obj as *mut crate::function::FuncEnv;
                if (*env).offset == 0 {
                    free_payload((*env).values, (*env).length as usize);
                }
            }
            MemoryKind::Fiber => {
                let fiber = obj as *mut crate::fiber::Fiber;
                free_payload((*fiber).data, (*fiber).capacity as usize);
            }
            MemoryKind::Abstract => {
                let abs = obj as *mut crate::value::VAbstract;
                if let Some(fin) = (*(*abs).ty).finalize {
                    fin((*abs).data_ptr(), (*abs).size);
                }
            }
        }
    }
}

// =============================================================================
// Host root registration and locking
// =============================================================================

/// Keep `value` alive across collections until `gcunroot`.
pub fn gcroot(value: Value) {
    with_vm(|vm| vm.roots.borrow_mut().push(value));
}

/// Drop one registration of `value`. Returns false if it was not rooted.
pub fn gcunroot(value: Value) -> bool {
    with_vm(|vm| {
        let mut roots = vm.roots.borrow_mut();
        if let Some(pos) = roots.iter().position(|r| r.identical(value)) {
            roots.swap_remove(pos);
            true
        } else {
            false
        }
    })
}

/// Disable collection until the matching `gcunlock`. Nests.
pub fn gclock() {
    with_vm(|vm| vm.gc_lock.set(vm.gc_lock.get() + 1));
}

/// Re-enable collection.
pub fn gcunlock() {
    with_vm(|vm| {
        let lock = vm.gc_lock.get();
        debug_assert!(lock > 0, "gcunlock without gclock");
        vm.gc_lock.set(lock.saturating_sub(1));
    });
}

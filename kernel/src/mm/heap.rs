//! Kernel heap allocator.
//!
//! A first-fit free-list allocator layered on the PMM and VMM. Every block
//! starts with a 32-byte header carrying its size (low bit = used), a magic
//! word that must match the block's state, and free-list links that are
//! meaningful only while the block is free. The free list is kept in
//! address order so freeing can eagerly coalesce with both neighbors; the
//! heap therefore never contains two adjacent free blocks.
//!
//! The heap occupies a fixed virtual window starting at [`HEAP_START`]. It
//! opens at 1 MiB and grows in 256 KiB steps up to 16 MiB by pulling pages
//! from the PMM and mapping them at the window's next offset. Growth and
//! placement go through the [`HeapBacking`] seam so the identical allocator
//! runs against a plain memory arena in tests.
//!
//! On bare metal the same allocator backs Rust's `alloc` via
//! [`LockedKernelHeap`]; host builds use the system allocator instead
//! (see `lib.rs`).

use core::alloc::{GlobalAlloc, Layout};

use spin::Mutex;

use super::{pmm::FRAME_ALLOCATOR, vmm, PAGE_SIZE};
use crate::error::{KernelError, KernelResult};

/// Start of the heap's virtual window.
pub const HEAP_START: usize = 0x4444_4444_0000;

/// Initial heap size.
pub const HEAP_INITIAL_SIZE: usize = 1024 * 1024;

/// Growth step when no fitting block exists.
pub const HEAP_EXPAND_SIZE: usize = 256 * 1024;

/// Hard cap on heap size.
pub const HEAP_MAX_SIZE: usize = 16 * 1024 * 1024;

/// Smallest payload the allocator hands out.
pub const HEAP_MIN_ALLOC: usize = 32;

/// Payload sizes round up to this.
const HEAP_ALIGN: usize = 16;

/// Magic word of a live allocation.
pub const BLOCK_MAGIC_USED: u64 = 0xB10C_A110_CA7E_D00D;

/// Magic word of a free block.
pub const BLOCK_MAGIC_FREE: u64 = 0xF4EE_F4EE_F4EE_F4EE;

/// Block header. `size_flags` holds the full block size (header included)
/// with the used flag in bit 0; sizes are 16-aligned so the bit is free.
#[repr(C)]
struct BlockHeader {
    size_flags: usize,
    magic: u64,
    prev_free: *mut BlockHeader,
    next_free: *mut BlockHeader,
}

const HEADER_SIZE: usize = core::mem::size_of::<BlockHeader>();

impl BlockHeader {
    #[inline]
    fn size(&self) -> usize {
        self.size_flags & !1
    }

    #[inline]
    fn is_used(&self) -> bool {
        self.size_flags & 1 != 0
    }

    #[inline]
    fn set(&mut self, size: usize, used: bool) {
        debug_assert_eq!(size % HEAP_ALIGN, 0);
        self.size_flags = size | used as usize;
        self.magic = if used {
            BLOCK_MAGIC_USED
        } else {
            BLOCK_MAGIC_FREE
        };
    }
}

/// Heap statistics
#[derive(Debug, Default, Clone, Copy)]
pub struct HeapStats {
    /// Total bytes handed out over time
    pub allocated_bytes: usize,
    /// Total bytes returned over time
    pub freed_bytes: usize,
    /// Current bytes in live allocations (payloads)
    pub used_bytes: usize,
    /// Peak bytes used
    pub peak_bytes: usize,
    /// Number of allocations
    pub allocation_count: u64,
    /// Number of frees
    pub free_count: u64,
}

/// How the heap obtains usable memory for its virtual window.
pub trait HeapBacking {
    /// Make `[at, at + bytes)` readable and writable. Returns `false` when
    /// the underlying memory is exhausted.
    fn expand(&mut self, at: usize, bytes: usize) -> bool;
}

/// Bare-metal backing: pages from the PMM, mapped at the window offset.
pub struct PageBacking;

impl HeapBacking for PageBacking {
    fn expand(&mut self, at: usize, bytes: usize) -> bool {
        debug_assert_eq!(bytes % PAGE_SIZE, 0);
        for i in 0..bytes / PAGE_SIZE {
            let frame = match FRAME_ALLOCATOR.lock().alloc_page() {
                Some(frame) => frame,
                None => return false,
            };
            let virt = (at + i * PAGE_SIZE) as u64;
            let flags =
                vmm::PageFlags::PRESENT | vmm::PageFlags::WRITABLE | vmm::PageFlags::NO_EXECUTE;
            if vmm::map_page(virt, frame.as_u64(), flags).is_err() {
                return false;
            }
        }
        true
    }
}

/// The allocator proper.
pub struct KernelHeap<B: HeapBacking> {
    start: usize,
    /// One past the last usable byte.
    extent_end: usize,
    /// `start + max` growth limit.
    max_end: usize,
    free_head: *mut BlockHeader,
    stats: HeapStats,
    backing: B,
}

// SAFETY: The raw pointers reference the heap window, owned exclusively by
// this allocator; access is serialized by the Mutex wrapping it.
unsafe impl<B: HeapBacking + Send> Send for KernelHeap<B> {}

impl<B: HeapBacking> KernelHeap<B> {
    /// Open the heap window with its initial extent.
    pub fn new(start: usize, max_size: usize, mut backing: B) -> Option<Self> {
        debug_assert_eq!(start % HEAP_ALIGN, 0);
        let initial = HEAP_INITIAL_SIZE.min(max_size);
        if !backing.expand(start, initial) {
            return None;
        }

        let head = start as *mut BlockHeader;
        // SAFETY: The backing just made [start, start+initial) writable and
        // nothing else references it.
        unsafe {
            (*head).set(initial, false);
            (*head).prev_free = core::ptr::null_mut();
            (*head).next_free = core::ptr::null_mut();
        }

        Some(Self {
            start,
            extent_end: start + initial,
            max_end: start + max_size,
            free_head: head,
            stats: HeapStats::default(),
            backing,
        })
    }

    /// Current heap extent in bytes.
    pub fn extent(&self) -> usize {
        self.extent_end - self.start
    }

    pub fn stats(&self) -> HeapStats {
        self.stats
    }

    fn payload_size(size: usize) -> usize {
        ((size + HEAP_ALIGN - 1) & !(HEAP_ALIGN - 1)).max(HEAP_MIN_ALLOC)
    }

    /// Allocate `size` bytes. Returns null on exhaustion.
    pub fn alloc(&mut self, size: usize) -> *mut u8 {
        if size == 0 {
            return core::ptr::null_mut();
        }
        let payload = Self::payload_size(size);
        let need = payload + HEADER_SIZE;

        loop {
            if let Some(block) = self.find_fit(need) {
                return self.take_block(block, need, payload);
            }
            if !self.grow() {
                return core::ptr::null_mut();
            }
        }
    }

    /// First fit, front to back.
    fn find_fit(&self, need: usize) -> Option<*mut BlockHeader> {
        let mut cursor = self.free_head;
        while !cursor.is_null() {
            // SAFETY: Free-list nodes are valid headers inside the window.
            unsafe {
                if (*cursor).size() >= need {
                    return Some(cursor);
                }
                cursor = (*cursor).next_free;
            }
        }
        None
    }

    /// Carve the allocation out of `block`, splitting when the remainder
    /// can still hold a header plus the minimum allocation.
    fn take_block(&mut self, block: *mut BlockHeader, need: usize, payload: usize) -> *mut u8 {
        // SAFETY: `block` is a free-list node; arithmetic stays inside the
        // block's extent which is inside the window.
        unsafe {
            let block_size = (*block).size();
            debug_assert!(!(*block).is_used());

            if block_size - need >= HEADER_SIZE + HEAP_MIN_ALLOC {
                // Split: remainder keeps the block's place in the list.
                let rest = (block as usize + need) as *mut BlockHeader;
                (*rest).set(block_size - need, false);
                (*rest).prev_free = (*block).prev_free;
                (*rest).next_free = (*block).next_free;
                if !(*rest).prev_free.is_null() {
                    (*(*rest).prev_free).next_free = rest;
                } else {
                    self.free_head = rest;
                }
                if !(*rest).next_free.is_null() {
                    (*(*rest).next_free).prev_free = rest;
                }
                (*block).set(need, true);
            } else {
                self.unlink(block);
                (*block).set(block_size, true);
            }

            self.stats.allocation_count += 1;
            self.stats.allocated_bytes += payload;
            self.stats.used_bytes += (*block).size() - HEADER_SIZE;
            self.stats.peak_bytes = self.stats.peak_bytes.max(self.stats.used_bytes);

            (block as *mut u8).add(HEADER_SIZE)
        }
    }

    fn unlink(&mut self, block: *mut BlockHeader) {
        // SAFETY: `block` is on the free list; links are valid nodes.
        unsafe {
            if !(*block).prev_free.is_null() {
                (*(*block).prev_free).next_free = (*block).next_free;
            } else {
                self.free_head = (*block).next_free;
            }
            if !(*block).next_free.is_null() {
                (*(*block).next_free).prev_free = (*block).prev_free;
            }
            (*block).prev_free = core::ptr::null_mut();
            (*block).next_free = core::ptr::null_mut();
        }
    }

    /// Grow the window by one expansion step.
    fn grow(&mut self) -> bool {
        if self.extent_end + HEAP_EXPAND_SIZE > self.max_end {
            return false;
        }
        if !self.backing.expand(self.extent_end, HEAP_EXPAND_SIZE) {
            return false;
        }

        let block = self.extent_end as *mut BlockHeader;
        // SAFETY: The backing just made the step writable.
        unsafe {
            (*block).set(HEAP_EXPAND_SIZE, false);
            (*block).prev_free = core::ptr::null_mut();
            (*block).next_free = core::ptr::null_mut();
        }
        self.extent_end += HEAP_EXPAND_SIZE;
        self.insert_free(block);
        self.coalesce(block);
        true
    }

    /// Return an allocation. Null is a no-op; a double free is detected by
    /// the magic word, logged, and otherwise ignored.
    pub fn free(&mut self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        let addr = ptr as usize;
        if addr < self.start + HEADER_SIZE || addr >= self.extent_end {
            println!("[HEAP] Warning: free of foreign pointer {:#x}", addr);
            return;
        }
        let block = (addr - HEADER_SIZE) as *mut BlockHeader;

        // SAFETY: The pointer arithmetic above stays in the window; the
        // header contents are validated before anything is trusted.
        unsafe {
            if (*block).magic == BLOCK_MAGIC_FREE && !(*block).is_used() {
                println!("[HEAP] Warning: double free at {:#x}", addr);
                return;
            }
            if (*block).magic != BLOCK_MAGIC_USED || !(*block).is_used() {
                println!("[HEAP] Warning: free of corrupt block at {:#x}", addr);
                return;
            }

            let payload = (*block).size() - HEADER_SIZE;
            self.stats.free_count += 1;
            self.stats.freed_bytes += payload;
            self.stats.used_bytes -= payload;

            (*block).set((*block).size(), false);
        }
        self.insert_free(block);
        self.coalesce(block);
    }

    /// Insert into the address-ordered free list.
    fn insert_free(&mut self, block: *mut BlockHeader) {
        // SAFETY: Traversal over valid list nodes; `block` is a valid free
        // header not currently on the list.
        unsafe {
            if self.free_head.is_null() || self.free_head > block {
                (*block).prev_free = core::ptr::null_mut();
                (*block).next_free = self.free_head;
                if !self.free_head.is_null() {
                    (*self.free_head).prev_free = block;
                }
                self.free_head = block;
                return;
            }
            let mut cursor = self.free_head;
            while !(*cursor).next_free.is_null() && (*cursor).next_free < block {
                cursor = (*cursor).next_free;
            }
            (*block).next_free = (*cursor).next_free;
            (*block).prev_free = cursor;
            if !(*cursor).next_free.is_null() {
                (*(*cursor).next_free).prev_free = block;
            }
            (*cursor).next_free = block;
        }
    }

    /// Merge `block` with its address-order neighbors when they are free.
    fn coalesce(&mut self, block: *mut BlockHeader) {
        // SAFETY: Adjacency is established by exact address arithmetic over
        // the contiguous block layout; only free-list nodes are merged.
        unsafe {
            // Absorb the successor.
            let next = (*block).next_free;
            if !next.is_null() && (block as usize + (*block).size()) == next as usize {
                let merged = (*block).size() + (*next).size();
                self.unlink(next);
                (*block).set(merged, false);
            }
            // Be absorbed by the predecessor.
            let prev = (*block).prev_free;
            if !prev.is_null() && (prev as usize + (*prev).size()) == block as usize {
                let merged = (*prev).size() + (*block).size();
                self.unlink(block);
                (*prev).set(merged, false);
            }
        }
    }

    /// Resize an allocation: alloc-copy-free.
    pub fn realloc(&mut self, ptr: *mut u8, size: usize) -> *mut u8 {
        if ptr.is_null() {
            return self.alloc(size);
        }
        if size == 0 {
            self.free(ptr);
            return core::ptr::null_mut();
        }
        let new_ptr = self.alloc(size);
        if new_ptr.is_null() {
            return core::ptr::null_mut();
        }
        // SAFETY: Old pointer came from this heap, so its header is just
        // below it; copy the smaller of old/new payload sizes.
        unsafe {
            let old_block = (ptr as usize - HEADER_SIZE) as *const BlockHeader;
            let old_payload = (*old_block).size() - HEADER_SIZE;
            core::ptr::copy_nonoverlapping(ptr, new_ptr, old_payload.min(size));
        }
        self.free(ptr);
        new_ptr
    }

    /// Walk every block in address order: `f(addr, block_size, used)`.
    /// Diagnostic/verification surface; the §8 invariants are phrased over
    /// this walk.
    pub fn walk(&self, mut f: impl FnMut(usize, usize, bool)) {
        let mut cursor = self.start;
        while cursor < self.extent_end {
            // SAFETY: Block sizes chain exactly from start to extent_end.
            let (size, used) = unsafe {
                let hdr = cursor as *const BlockHeader;
                ((*hdr).size(), (*hdr).is_used())
            };
            f(cursor, size, used);
            if size == 0 {
                break; // corrupt header; stop rather than loop forever
            }
            cursor += size;
        }
    }
}

/// `GlobalAlloc` adapter for the bare-metal target.
pub struct LockedKernelHeap {
    inner: Mutex<Option<KernelHeap<PageBacking>>>,
}

impl LockedKernelHeap {
    pub const fn empty() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }

    /// Open the kernel heap window. Called once from `mm::init` after the
    /// PMM and VMM are up.
    pub fn init(&self) -> KernelResult<()> {
        let mut guard = self.inner.lock();
        if guard.is_some() {
            return Err(KernelError::AlreadyExists {
                resource: "kernel heap",
                id: 0,
            });
        }
        let heap = KernelHeap::new(HEAP_START, HEAP_MAX_SIZE, PageBacking).ok_or(
            KernelError::OutOfMemory {
                requested: HEAP_INITIAL_SIZE,
                available: 0,
            },
        )?;
        *guard = Some(heap);
        Ok(())
    }

    pub fn stats(&self) -> HeapStats {
        self.inner
            .lock()
            .as_ref()
            .map(|h| h.stats())
            .unwrap_or_default()
    }
}

// The lock is taken with interrupts disabled: a task preempted while
// holding it would deadlock any other allocating task on this single-CPU
// kernel. IRQ handlers still must not allocate (they would re-enter the
// PMM path); the interrupt disable covers task-vs-task preemption only.
unsafe impl GlobalAlloc for LockedKernelHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let _guard = crate::arch::x86_64::disable_interrupts();
        let mut guard = self.inner.lock();
        let heap = match guard.as_mut() {
            Some(heap) => heap,
            None => return core::ptr::null_mut(),
        };
        if layout.align() <= HEAP_ALIGN {
            return heap.alloc(layout.size());
        }
        // Over-aligned: over-allocate and stash the original pointer just
        // below the aligned payload.
        let raw = heap.alloc(layout.size() + layout.align() + core::mem::size_of::<usize>());
        if raw.is_null() {
            return raw;
        }
        let raw_addr = raw as usize;
        let aligned = (raw_addr + core::mem::size_of::<usize>() + layout.align() - 1)
            & !(layout.align() - 1);
        // SAFETY: aligned - 8 lies within the over-allocated block.
        unsafe {
            *((aligned - core::mem::size_of::<usize>()) as *mut usize) = raw_addr;
        }
        aligned as *mut u8
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        let _guard = crate::arch::x86_64::disable_interrupts();
        let mut guard = self.inner.lock();
        let heap = match guard.as_mut() {
            Some(heap) => heap,
            None => return,
        };
        if layout.align() <= HEAP_ALIGN {
            heap.free(ptr);
            return;
        }
        // SAFETY: alloc() stored the original pointer at ptr - 8 for
        // over-aligned layouts.
        let raw = unsafe { *((ptr as usize - core::mem::size_of::<usize>()) as *const usize) };
        heap.free(raw as *mut u8);
    }
}

/// The kernel's global allocator instance (bare metal only; host builds
/// use the system allocator).
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
#[global_allocator]
pub static ALLOCATOR: LockedKernelHeap = LockedKernelHeap::empty();

/// Open the heap window behind Rust's `alloc`.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub fn init() -> KernelResult<()> {
    ALLOCATOR.init()?;
    println!(
        "[HEAP] Kernel heap at {:#x}: {} KiB initial, {} MiB max",
        HEAP_START,
        HEAP_INITIAL_SIZE / 1024,
        HEAP_MAX_SIZE / (1024 * 1024)
    );
    Ok(())
}

/// Host builds allocate through std; nothing to initialize.
#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
pub fn init() -> KernelResult<()> {
    Ok(())
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use alloc::vec;
    use alloc::vec::Vec;

    use super::*;

    /// Backing over a leaked, pre-sized arena: expansion just validates
    /// that the requested range stays inside it.
    struct ArenaBacking {
        base: usize,
        len: usize,
    }

    impl HeapBacking for ArenaBacking {
        fn expand(&mut self, at: usize, bytes: usize) -> bool {
            at >= self.base && at + bytes <= self.base + self.len
        }
    }

    fn arena_heap(len: usize) -> KernelHeap<ArenaBacking> {
        let arena: Vec<u128> = vec![0; len / 16];
        let base = Vec::leak(arena).as_mut_ptr() as usize;
        KernelHeap::new(base, len, ArenaBacking { base, len }).expect("arena heap")
    }

    fn free_blocks(heap: &KernelHeap<ArenaBacking>) -> Vec<(usize, usize)> {
        let mut v = Vec::new();
        heap.walk(|addr, size, used| {
            if !used {
                v.push((addr, size));
            }
        });
        v
    }

    #[test]
    fn test_walk_sums_to_extent() {
        let mut heap = arena_heap(HEAP_INITIAL_SIZE);
        let a = heap.alloc(100);
        let b = heap.alloc(5000);
        assert!(!a.is_null() && !b.is_null());

        let mut sum = 0;
        heap.walk(|_, size, _| sum += size);
        assert_eq!(sum, heap.extent());
    }

    #[test]
    fn test_min_granularity_and_alignment() {
        let mut heap = arena_heap(HEAP_INITIAL_SIZE);
        let a = heap.alloc(1);
        let b = heap.alloc(17);
        assert_eq!(a as usize % 16, 0);
        assert_eq!(b as usize % 16, 0);
        // 1-byte and 17-byte requests both occupy a 32-byte payload.
        assert_eq!(b as usize - a as usize, HEAP_MIN_ALLOC + HEADER_SIZE);
    }

    #[test]
    fn test_coalesce_scenario() {
        let mut heap = arena_heap(HEAP_INITIAL_SIZE);
        let a = heap.alloc(128);
        let b = heap.alloc(128);
        let c = heap.alloc(128);

        heap.free(b);
        heap.free(a);

        // a and b merged into a single leading free block.
        let frees = free_blocks(&heap);
        assert_eq!(frees.len(), 2, "merged front block plus the tail");
        assert!(frees[0].1 >= 256 + 2 * HEADER_SIZE);

        heap.free(c);
        let frees = free_blocks(&heap);
        assert_eq!(frees.len(), 1, "heap collapsed to one free block");
        assert_eq!(frees[0].1, heap.extent());
    }

    #[test]
    fn test_no_adjacent_free_blocks_invariant() {
        let mut heap = arena_heap(HEAP_INITIAL_SIZE);
        let ptrs: Vec<*mut u8> = (0..16).map(|i| heap.alloc(64 + i * 16)).collect();
        // Free every other block, then the rest, in a scrambled order.
        for &p in ptrs.iter().step_by(2) {
            heap.free(p);
        }
        for &p in ptrs.iter().skip(1).step_by(2) {
            heap.free(p);
        }

        let mut prev_free = false;
        heap.walk(|_, _, used| {
            assert!(!(prev_free && !used), "two adjacent free blocks");
            prev_free = !used;
        });
    }

    #[test]
    fn test_free_restores_prior_state() {
        let mut heap = arena_heap(HEAP_INITIAL_SIZE);
        let before: Vec<(usize, usize, bool)> = {
            let mut v = Vec::new();
            heap.walk(|a, s, u| v.push((a, s, u)));
            v
        };
        let p = heap.alloc(512);
        heap.free(p);
        let after: Vec<(usize, usize, bool)> = {
            let mut v = Vec::new();
            heap.walk(|a, s, u| v.push((a, s, u)));
            v
        };
        assert_eq!(before, after);
    }

    #[test]
    fn test_double_free_detected() {
        let mut heap = arena_heap(HEAP_INITIAL_SIZE);
        let p = heap.alloc(64);
        heap.free(p);
        let stats_before = heap.stats();
        heap.free(p); // detected via magic; no crash, no counter change
        let stats_after = heap.stats();
        assert_eq!(stats_before.free_count, stats_after.free_count);
        assert_eq!(stats_before.used_bytes, stats_after.used_bytes);
    }

    #[test]
    fn test_free_null_is_noop() {
        let mut heap = arena_heap(HEAP_INITIAL_SIZE);
        heap.free(core::ptr::null_mut());
        assert_eq!(heap.stats().free_count, 0);
    }

    #[test]
    fn test_expansion_up_to_cap() {
        let mut heap = arena_heap(2 * 1024 * 1024);
        // Exhaust the initial megabyte, forcing expansion steps.
        let big = heap.alloc(HEAP_INITIAL_SIZE);
        assert!(!big.is_null());
        let more = heap.alloc(512 * 1024);
        assert!(!more.is_null());
        assert!(heap.extent() > HEAP_INITIAL_SIZE);

        // The 2 MiB arena caps further growth.
        let too_much = heap.alloc(4 * 1024 * 1024);
        assert!(too_much.is_null());
    }

    #[test]
    fn test_realloc_preserves_contents() {
        let mut heap = arena_heap(HEAP_INITIAL_SIZE);
        let p = heap.alloc(64);
        // SAFETY: p is a valid 64-byte allocation.
        unsafe {
            core::ptr::write_bytes(p, 0xAB, 64);
        }
        let q = heap.realloc(p, 256);
        assert!(!q.is_null());
        // SAFETY: q is at least 256 bytes; the first 64 were copied.
        unsafe {
            for i in 0..64 {
                assert_eq!(*q.add(i), 0xAB);
            }
        }
        heap.free(q);
    }

    #[test]
    fn test_stats_track_peak() {
        let mut heap = arena_heap(HEAP_INITIAL_SIZE);
        let a = heap.alloc(1000);
        let peak = heap.stats().peak_bytes;
        heap.free(a);
        assert!(heap.stats().used_bytes < peak);
        assert_eq!(heap.stats().peak_bytes, peak);
    }
}

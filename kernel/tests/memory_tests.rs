//! Memory management scenarios, run against the real allocator and
//! walker code on the host: the PMM over its bitmap, the VMM over an
//! arena-backed page-table tree, and the heap inside a plain memory
//! window.

use borealis_kernel::mm::heap::{HeapBacking, KernelHeap, HEAP_INITIAL_SIZE};
use borealis_kernel::mm::pmm::PhysFrameAllocator;
use borealis_kernel::mm::vmm::{testing::ArenaPhysAccess, PageFlags};
use borealis_kernel::mm::{MemoryRegion, PhysicalAddress};

/// PMM bring-up: one available region [1 MiB, 128 MiB), kernel image at
/// [1 MiB, 2 MiB). The accounting identities hold across an alloc/free
/// cycle.
#[test]
fn pmm_bringup_scenario() {
    let mut pmm = Box::new(PhysFrameAllocator::new());
    let regions = [MemoryRegion {
        start: 0x10_0000,
        size: 0x800_0000 - 0x10_0000,
        usable: true,
    }];
    pmm.init(&regions, &[(0, 0x10_0000), (0x10_0000, 0x20_0000)]);

    let initial = pmm.stats();
    assert_eq!(initial.used_pages + initial.free_pages, initial.total_pages);
    assert!(initial.peak_usage >= initial.used_pages);

    let a = pmm.alloc_page().expect("first page");
    let b = pmm.alloc_page().expect("second page");
    assert_ne!(a, b);
    assert!(a.as_u64() >= 0x20_0000 && a.is_aligned());
    assert!(b.as_u64() >= 0x20_0000 && b.is_aligned());

    pmm.free_page(a);
    assert_eq!(pmm.alloc_page(), Some(a), "first-fit reuses the freed page");

    let end = pmm.stats();
    assert_eq!(end.used_pages + end.free_pages, end.total_pages);
    assert_eq!(
        end.total_allocations - end.total_frees,
        end.used_pages - initial.used_pages
    );
}

/// VMM identity scenario: map a high virtual page to a high physical
/// frame, translate through it, then unmap and observe the hole. The
/// boot-style 1 GiB identity window stays intact throughout.
#[test]
fn vmm_map_translate_unmap_scenario() {
    let mut arena = ArenaPhysAccess::new();
    let mut space = arena.new_space();
    arena.install_identity_1g(&mut space);

    let virt = 0x8000_0000u64;
    let phys = 0x2_0000_0000u64;
    space
        .map_page(&mut arena, virt, phys, PageFlags::PRESENT | PageFlags::WRITABLE)
        .unwrap();
    assert_eq!(space.translate(&arena, virt), Some(phys));

    space.unmap_page(&arena, virt).unwrap();
    assert_eq!(space.translate(&arena, virt), None);

    // Identity property below 1 GiB is unaffected.
    for v in [0u64, 0x1000, 0x3FFF_FFFF] {
        assert_eq!(space.translate(&arena, v), Some(v));
    }
}

struct ArenaBacking {
    base: usize,
    len: usize,
}

impl HeapBacking for ArenaBacking {
    fn expand(&mut self, at: usize, bytes: usize) -> bool {
        at >= self.base && at + bytes <= self.base + self.len
    }
}

/// Heap coalescing scenario: three allocations, free the middle then the
/// first (one merged block), then the last (heap collapses to a single
/// free block spanning the whole extent).
#[test]
fn heap_coalesce_scenario() {
    let arena: Vec<u128> = vec![0; HEAP_INITIAL_SIZE / 16];
    let base = Vec::leak(arena).as_mut_ptr() as usize;
    let mut heap = KernelHeap::new(
        base,
        HEAP_INITIAL_SIZE,
        ArenaBacking {
            base,
            len: HEAP_INITIAL_SIZE,
        },
    )
    .expect("heap");

    let a = heap.alloc(128);
    let b = heap.alloc(128);
    let c = heap.alloc(128);
    assert!(!a.is_null() && !b.is_null() && !c.is_null());

    heap.free(b);
    heap.free(a);

    let mut free_blocks: Vec<usize> = Vec::new();
    heap.walk(|_, size, used| {
        if !used {
            free_blocks.push(size);
        }
    });
    assert_eq!(free_blocks.len(), 2);
    assert!(free_blocks[0] >= 256 + 64, "a+b merged with both headers");

    heap.free(c);
    let mut free_blocks: Vec<usize> = Vec::new();
    heap.walk(|_, size, used| {
        assert!(!used);
        free_blocks.push(size);
    });
    assert_eq!(free_blocks, vec![heap.extent()]);
}

/// The block-walk identity: sizes always sum to the extent, and no two
/// adjacent blocks are ever both free, across a randomized-ish workload.
#[test]
fn heap_structural_invariants_under_churn() {
    let arena: Vec<u128> = vec![0; HEAP_INITIAL_SIZE / 16];
    let base = Vec::leak(arena).as_mut_ptr() as usize;
    let mut heap = KernelHeap::new(
        base,
        HEAP_INITIAL_SIZE,
        ArenaBacking {
            base,
            len: HEAP_INITIAL_SIZE,
        },
    )
    .expect("heap");

    let mut live: Vec<*mut u8> = Vec::new();
    // Deterministic churn: sizes cycle, frees hit every third allocation.
    for round in 0..200usize {
        let size = 16 + (round * 37) % 900;
        let p = heap.alloc(size);
        assert!(!p.is_null());
        live.push(p);
        if round % 3 == 0 {
            let victim = live.swap_remove((round * 7) % live.len());
            heap.free(victim);
        }

        let mut sum = 0;
        let mut prev_free = false;
        heap.walk(|_, size, used| {
            sum += size;
            assert!(!(prev_free && !used), "adjacent free blocks");
            prev_free = !used;
        });
        assert_eq!(sum, heap.extent());
    }
    for p in live {
        heap.free(p);
    }
}

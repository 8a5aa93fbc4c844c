//! Virtual memory manager.
//!
//! A 4-level page-table walker and mapper operating on the tables the boot
//! trampoline installed: the first gigabyte is identity-mapped with 2 MiB
//! huge pages, so any page-table frame the PMM hands out (always inside
//! the tracked gigabyte) can be written through its own physical address.
//!
//! Table memory is reached through the [`PhysAccess`] seam. The kernel
//! uses [`IdentityPhysAccess`]; tests use an arena and run the identical
//! walker code. Intermediate tables are allocated from the PMM, zeroed,
//! and installed `PRESENT | WRITABLE` so the leaf flags govern effective
//! permissions. No table is ever freed (reclamation is a non-goal).

use core::ops::{Index, IndexMut};

use bitflags::bitflags;
use spin::Mutex;

use super::{pmm::FRAME_ALLOCATOR, PhysicalAddress, PAGE_SIZE};
use crate::error::{KernelError, KernelResult};

bitflags! {
    /// Page-table entry flag bits. The values are the hardware layout and
    /// must not be papered over.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u64 {
        const PRESENT       = 1 << 0;
        const WRITABLE      = 1 << 1;
        const USER          = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const NO_CACHE      = 1 << 4;
        const ACCESSED      = 1 << 5;
        const DIRTY         = 1 << 6;
        /// Terminates the walk at PDPT (1 GiB) or PD (2 MiB) level.
        const HUGE          = 1 << 7;
        const GLOBAL        = 1 << 8;
        const NO_EXECUTE    = 1 << 63;
    }
}

/// Flag set for MMIO mappings (framebuffer, virtio configuration windows).
pub const MMIO_FLAGS: PageFlags = PageFlags::PRESENT
    .union(PageFlags::WRITABLE)
    .union(PageFlags::NO_CACHE)
    .union(PageFlags::WRITE_THROUGH);

/// Bits 12-51 of an entry hold the physical frame address.
pub const ENTRY_ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

/// Number of entries in a page table.
pub const PAGE_TABLE_ENTRIES: usize = 512;

/// The boot identity mapping covers this range with 2 MiB pages.
pub const IDENTITY_LIMIT: u64 = 1 << 30;

const HUGE_2M_MASK: u64 = 0x1F_FFFF;
const HUGE_1G_MASK: u64 = 0x3FFF_FFFF;

/// Page table entry
#[derive(Debug, Clone, Copy)]
#[repr(transparent)]
pub struct PageTableEntry(u64);

impl PageTableEntry {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn is_present(&self) -> bool {
        self.0 & PageFlags::PRESENT.bits() != 0
    }

    pub const fn is_huge(&self) -> bool {
        self.0 & PageFlags::HUGE.bits() != 0
    }

    pub const fn addr(&self) -> u64 {
        self.0 & ENTRY_ADDR_MASK
    }

    pub const fn flags(&self) -> PageFlags {
        PageFlags::from_bits_truncate(self.0)
    }

    pub fn set(&mut self, addr: u64, flags: PageFlags) {
        self.0 = (addr & ENTRY_ADDR_MASK) | flags.bits();
    }

    pub fn clear(&mut self) {
        self.0 = 0;
    }

    pub const fn raw(&self) -> u64 {
        self.0
    }
}

/// A page table with 512 entries.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageTableEntry; PAGE_TABLE_ENTRIES],
}

impl PageTable {
    pub const fn new() -> Self {
        Self {
            entries: [PageTableEntry::empty(); PAGE_TABLE_ENTRIES],
        }
    }

    pub fn zero(&mut self) {
        for entry in &mut self.entries {
            entry.clear();
        }
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}

impl Index<usize> for PageTable {
    type Output = PageTableEntry;

    fn index(&self, index: usize) -> &Self::Output {
        &self.entries[index]
    }
}

impl IndexMut<usize> for PageTable {
    fn index_mut(&mut self, index: usize) -> &mut Self::Output {
        &mut self.entries[index]
    }
}

/// How the walker reaches physical page-table frames.
pub trait PhysAccess {
    /// Pointer through which the frame at `phys` can be read and written.
    fn table_ptr(&self, phys: PhysicalAddress) -> *mut PageTable;

    /// Allocate a zeroed frame for a new intermediate table.
    fn alloc_table(&mut self) -> Option<PhysicalAddress>;
}

/// Kernel-side access: table frames live below 1 GiB and are reachable
/// through the boot identity mapping.
pub struct IdentityPhysAccess;

impl PhysAccess for IdentityPhysAccess {
    fn table_ptr(&self, phys: PhysicalAddress) -> *mut PageTable {
        debug_assert!(phys.as_u64() < IDENTITY_LIMIT);
        phys.as_u64() as *mut PageTable
    }

    fn alloc_table(&mut self) -> Option<PhysicalAddress> {
        let frame = FRAME_ALLOCATOR.lock().alloc_page()?;
        // SAFETY: The frame was just allocated, lies in the identity-mapped
        // gigabyte, and nothing else references it yet.
        unsafe {
            (*self.table_ptr(frame)).zero();
        }
        Some(frame)
    }
}

/// Split a canonical virtual address into its four table indices.
#[inline]
fn table_indices(virt: u64) -> [usize; 4] {
    [
        ((virt >> 39) & 0x1FF) as usize, // PML4
        ((virt >> 30) & 0x1FF) as usize, // PDPT
        ((virt >> 21) & 0x1FF) as usize, // PD
        ((virt >> 12) & 0x1FF) as usize, // PT
    ]
}

/// A 4-level address space rooted at a PML4 frame.
pub struct AddressSpace {
    root: PhysicalAddress,
}

impl AddressSpace {
    pub const fn new(root: PhysicalAddress) -> Self {
        Self { root }
    }

    /// The address space the CPU is currently using.
    pub fn current() -> Self {
        Self::new(PhysicalAddress::new(crate::arch::x86_64::read_cr3()))
    }

    pub const fn root(&self) -> PhysicalAddress {
        self.root
    }

    /// Map one 4 KiB page.
    ///
    /// Both addresses are aligned down. Identity requests below 1 GiB
    /// succeed immediately: boot established that mapping with 2 MiB
    /// pages. A walk that runs into a huge-page entry is rejected unless
    /// the request is an identity mapping covered by it. Re-mapping an
    /// already-present leaf overwrites it.
    pub fn map_page(
        &mut self,
        access: &mut impl PhysAccess,
        virt: u64,
        phys: u64,
        flags: PageFlags,
    ) -> KernelResult<()> {
        let virt = virt & !(PAGE_SIZE as u64 - 1);
        let phys = phys & !(PAGE_SIZE as u64 - 1);

        if virt < IDENTITY_LIMIT && virt == phys {
            return Ok(());
        }

        let [l4, l3, l2, l1] = table_indices(virt);

        let pml4 = access.table_ptr(self.root);
        // SAFETY: All table pointers below come from PhysAccess::table_ptr
        // over frames that are either the live root or frames this walker
        // installed; the walker is the only mutator (callers serialize
        // through the kernel-space mutex).
        let pdpt_phys = unsafe { Self::next_table(access, &mut (&mut (*pml4))[l4], virt)? };
        let pdpt = access.table_ptr(pdpt_phys);

        let entry = unsafe { &mut (&mut (*pdpt))[l3] };
        if entry.is_present() && entry.is_huge() {
            // 1 GiB huge page in the way
            return if virt == phys {
                Ok(())
            } else {
                Err(KernelError::HugePageConflict { virt })
            };
        }
        let pd_phys = unsafe { Self::next_table(access, &mut (&mut (*pdpt))[l3], virt)? };
        let pd = access.table_ptr(pd_phys);

        let entry = unsafe { &mut (&mut (*pd))[l2] };
        if entry.is_present() && entry.is_huge() {
            // 2 MiB huge page in the way
            return if virt == phys {
                Ok(())
            } else {
                Err(KernelError::HugePageConflict { virt })
            };
        }
        let pt_phys = unsafe { Self::next_table(access, &mut (&mut (*pd))[l2], virt)? };
        let pt = access.table_ptr(pt_phys);

        // Install (or overwrite) the leaf.
        unsafe {
            (&mut (*pt))[l1].set(phys, flags | PageFlags::PRESENT);
        }
        flush_tlb(virt);
        Ok(())
    }

    /// Follow `entry` to the next table level, creating it when absent.
    ///
    /// # Safety
    ///
    /// `entry` must reference an entry of a live table frame owned by this
    /// address space.
    unsafe fn next_table(
        access: &mut impl PhysAccess,
        entry: &mut PageTableEntry,
        virt: u64,
    ) -> KernelResult<PhysicalAddress> {
        if !entry.is_present() {
            let frame = access.alloc_table().ok_or(KernelError::OutOfMemory {
                requested: PAGE_SIZE,
                available: 0,
            })?;
            entry.set(
                frame.as_u64(),
                PageFlags::PRESENT | PageFlags::WRITABLE,
            );
            return Ok(frame);
        }
        if entry.is_huge() {
            return Err(KernelError::HugePageConflict { virt });
        }
        Ok(PhysicalAddress::new(entry.addr()))
    }

    /// Remove a 4 KiB mapping.
    ///
    /// The walk never creates tables. Unmapping inside a huge page is
    /// rejected: the caller asked for 4 KiB granularity the mapping does
    /// not have.
    pub fn unmap_page(&mut self, access: &impl PhysAccess, virt: u64) -> KernelResult<()> {
        let virt = virt & !(PAGE_SIZE as u64 - 1);
        let [l4, l3, l2, l1] = table_indices(virt);

        let pml4 = access.table_ptr(self.root);
        // SAFETY: Table pointers as in map_page; read-then-clear of entries
        // in tables this address space owns.
        unsafe {
            let e4 = (&(*pml4))[l4];
            if !e4.is_present() {
                return Err(KernelError::UnmappedMemory { addr: virt });
            }
            let pdpt = access.table_ptr(PhysicalAddress::new(e4.addr()));
            let e3 = (&(*pdpt))[l3];
            if !e3.is_present() {
                return Err(KernelError::UnmappedMemory { addr: virt });
            }
            if e3.is_huge() {
                return Err(KernelError::HugePageConflict { virt });
            }
            let pd = access.table_ptr(PhysicalAddress::new(e3.addr()));
            let e2 = (&(*pd))[l2];
            if !e2.is_present() {
                return Err(KernelError::UnmappedMemory { addr: virt });
            }
            if e2.is_huge() {
                return Err(KernelError::HugePageConflict { virt });
            }
            let pt = access.table_ptr(PhysicalAddress::new(e2.addr()));
            if !(&(*pt))[l1].is_present() {
                return Err(KernelError::UnmappedMemory { addr: virt });
            }
            (&mut (*pt))[l1].clear();
        }
        flush_tlb(virt);
        Ok(())
    }

    /// Translate a virtual address, honoring huge pages at both levels.
    pub fn translate(&self, access: &impl PhysAccess, virt: u64) -> Option<u64> {
        let [l4, l3, l2, l1] = table_indices(virt);

        let pml4 = access.table_ptr(self.root);
        // SAFETY: Read-only walk over live table frames.
        unsafe {
            let e4 = (&(*pml4))[l4];
            if !e4.is_present() {
                return None;
            }
            let pdpt = access.table_ptr(PhysicalAddress::new(e4.addr()));
            let e3 = (&(*pdpt))[l3];
            if !e3.is_present() {
                return None;
            }
            if e3.is_huge() {
                return Some((e3.addr() & !HUGE_1G_MASK) + (virt & HUGE_1G_MASK));
            }
            let pd = access.table_ptr(PhysicalAddress::new(e3.addr()));
            let e2 = (&(*pd))[l2];
            if !e2.is_present() {
                return None;
            }
            if e2.is_huge() {
                return Some((e2.addr() & !HUGE_2M_MASK) + (virt & HUGE_2M_MASK));
            }
            let pt = access.table_ptr(PhysicalAddress::new(e2.addr()));
            let e1 = (&(*pt))[l1];
            if !e1.is_present() {
                return None;
            }
            Some(e1.addr() + (virt & (PAGE_SIZE as u64 - 1)))
        }
    }
}

/// Flush the TLB entry for one address (no-op off bare metal).
pub fn flush_tlb(virt: u64) {
    #[cfg(target_os = "none")]
    crate::arch::x86_64::tlb_flush_address(virt);
    #[cfg(not(target_os = "none"))]
    let _ = virt;
}

/// Flush the whole TLB (no-op off bare metal).
pub fn flush_tlb_all() {
    #[cfg(target_os = "none")]
    crate::arch::x86_64::tlb_flush_all();
}

/// The kernel's address space, captured from CR3 at init.
static KERNEL_SPACE: Mutex<Option<AddressSpace>> = Mutex::new(None);

/// Record the boot page tables as the kernel address space.
pub fn init() {
    let space = AddressSpace::current();
    println!("[VMM] Kernel page tables at {:#x}", space.root().as_u64());
    *KERNEL_SPACE.lock() = Some(space);
}

/// Map a page in the kernel address space.
pub fn map_page(virt: u64, phys: u64, flags: PageFlags) -> KernelResult<()> {
    let mut guard = KERNEL_SPACE.lock();
    let space = guard.as_mut().ok_or(KernelError::NotInitialized {
        subsystem: "VMM",
    })?;
    space.map_page(&mut IdentityPhysAccess, virt, phys, flags)
}

/// Map `count` pages starting at `(virt, phys)`.
pub fn map_range(virt: u64, phys: u64, count: usize, flags: PageFlags) -> KernelResult<()> {
    for i in 0..count {
        map_page(
            virt + (i * PAGE_SIZE) as u64,
            phys + (i * PAGE_SIZE) as u64,
            flags,
        )?;
    }
    Ok(())
}

/// Unmap a page from the kernel address space.
pub fn unmap_page(virt: u64) -> KernelResult<()> {
    let mut guard = KERNEL_SPACE.lock();
    let space = guard.as_mut().ok_or(KernelError::NotInitialized {
        subsystem: "VMM",
    })?;
    space.unmap_page(&IdentityPhysAccess, virt)
}

/// Translate through the kernel address space.
pub fn translate(virt: u64) -> Option<u64> {
    let guard = KERNEL_SPACE.lock();
    let space = guard.as_ref()?;
    space.translate(&IdentityPhysAccess, virt)
}

/// Arena-backed [`PhysAccess`] for running the walker off bare metal.
#[cfg(not(target_os = "none"))]
pub mod testing {
    extern crate alloc;
    use alloc::{boxed::Box, vec::Vec};

    use super::*;

    /// Hands out leaked boxed tables; "physical" addresses are synthetic
    /// ids `(index + 1) << 12`.
    pub struct ArenaPhysAccess {
        tables: Vec<*mut PageTable>,
    }

    impl ArenaPhysAccess {
        pub fn new() -> Self {
            Self { tables: Vec::new() }
        }

        /// Allocate the root table for a fresh address space.
        pub fn new_space(&mut self) -> AddressSpace {
            let root = self.alloc_table().expect("arena alloc");
            AddressSpace::new(root)
        }

        /// Install boot-like 2 MiB identity entries for the first 1 GiB.
        pub fn install_identity_1g(&mut self, space: &mut AddressSpace) {
            let root_ptr = self.table_ptr(space.root());
            let pdpt_phys = self.alloc_table().unwrap();
            let pd_phys = self.alloc_table().unwrap();
            // SAFETY: Freshly allocated arena tables; exclusive access.
            unsafe {
                (*root_ptr)[0].set(
                    pdpt_phys.as_u64(),
                    PageFlags::PRESENT | PageFlags::WRITABLE,
                );
                let pdpt = self.table_ptr(pdpt_phys);
                (*pdpt)[0].set(pd_phys.as_u64(), PageFlags::PRESENT | PageFlags::WRITABLE);
                let pd = self.table_ptr(pd_phys);
                for i in 0..PAGE_TABLE_ENTRIES {
                    (*pd)[i].set(
                        (i as u64) * 0x20_0000,
                        PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::HUGE,
                    );
                }
            }
        }

        pub fn table_count(&self) -> usize {
            self.tables.len()
        }
    }

    impl Default for ArenaPhysAccess {
        fn default() -> Self {
            Self::new()
        }
    }

    impl PhysAccess for ArenaPhysAccess {
        fn table_ptr(&self, phys: PhysicalAddress) -> *mut PageTable {
            let idx = (phys.as_u64() >> 12) as usize - 1;
            self.tables[idx]
        }

        fn alloc_table(&mut self) -> Option<PhysicalAddress> {
            let table = Box::leak(Box::new(PageTable::new()));
            self.tables.push(table as *mut PageTable);
            Some(PhysicalAddress::new((self.tables.len() as u64) << 12))
        }
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::testing::ArenaPhysAccess;
    use super::*;

    fn identity_space() -> (ArenaPhysAccess, AddressSpace) {
        let mut arena = ArenaPhysAccess::new();
        let mut space = arena.new_space();
        arena.install_identity_1g(&mut space);
        (arena, space)
    }

    #[test]
    fn test_identity_translation_below_1g() {
        let (arena, space) = identity_space();
        for &v in &[0u64, 0x1000, 0x20_0000, 0x1234_5678, IDENTITY_LIMIT - 1] {
            assert_eq!(space.translate(&arena, v), Some(v));
        }
    }

    #[test]
    fn test_identity_map_short_circuits() {
        let (mut arena, mut space) = identity_space();
        let tables_before = arena.table_count();
        space
            .map_page(&mut arena, 0x40_0000, 0x40_0000, PageFlags::WRITABLE)
            .unwrap();
        // No table was created: boot already mapped that range.
        assert_eq!(arena.table_count(), tables_before);
    }

    #[test]
    fn test_map_translate_unmap_cycle() {
        let (mut arena, mut space) = identity_space();
        let virt = 0x8000_0000u64;
        let phys = 0x2_0000_0000u64;
        space
            .map_page(&mut arena, virt, phys, PageFlags::PRESENT | PageFlags::WRITABLE)
            .unwrap();
        assert_eq!(space.translate(&arena, virt), Some(phys));
        assert_eq!(space.translate(&arena, virt + 0x123), Some(phys + 0x123));

        space.unmap_page(&arena, virt).unwrap();
        assert_eq!(space.translate(&arena, virt), None);
    }

    #[test]
    fn test_map_is_idempotent_overwrite() {
        let (mut arena, mut space) = identity_space();
        let virt = 0x9000_0000u64;
        let flags = PageFlags::PRESENT | PageFlags::WRITABLE;
        space.map_page(&mut arena, virt, 0x2_0000_0000, flags).unwrap();
        let tables_after_first = arena.table_count();
        space.map_page(&mut arena, virt, 0x2_0000_0000, flags).unwrap();
        assert_eq!(arena.table_count(), tables_after_first);
        assert_eq!(space.translate(&arena, virt), Some(0x2_0000_0000));
    }

    #[test]
    fn test_non_identity_into_huge_page_rejected() {
        let (mut arena, mut space) = identity_space();
        // 0x40_0000 falls inside a boot 2 MiB page; mapping it to a
        // different frame needs 4 KiB granularity that is not there.
        let err = space
            .map_page(&mut arena, 0x40_0000, 0x2_0000_0000, PageFlags::WRITABLE)
            .unwrap_err();
        assert_eq!(err, KernelError::HugePageConflict { virt: 0x40_0000 });
    }

    #[test]
    fn test_unmap_inside_huge_page_rejected() {
        let (arena, mut space) = identity_space();
        let err = space.unmap_page(&arena, 0x40_0000).unwrap_err();
        assert_eq!(err, KernelError::HugePageConflict { virt: 0x40_0000 });
    }

    #[test]
    fn test_unmap_absent_mapping_rejected() {
        let (arena, mut space) = identity_space();
        assert!(space.unmap_page(&arena, 0xFFFF_8000_0000_0000u64 & !0xFFF).is_err());
    }

    #[test]
    fn test_translate_honors_huge_page_offset() {
        let (arena, space) = identity_space();
        // Inside the 2 MiB page starting at 0x20_0000
        assert_eq!(space.translate(&arena, 0x2F_FFFF), Some(0x2F_FFFF));
    }
}

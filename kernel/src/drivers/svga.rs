//! VMware SVGA II display backend.
//!
//! The device exposes an index/value register pair in I/O space (BAR0),
//! the framebuffer in BAR1, and a command FIFO in BAR2. Mode setting
//! writes the WIDTH/HEIGHT/BPP registers and enables the device; each
//! present pushes an UPDATE command through the FIFO and synchronizes via
//! the SYNC/BUSY register pair. One more implementation of the same
//! `GpuBackend` flip contract the virtio path fulfils.

use alloc::boxed::Box;

use crate::drivers::pci::{self, PciBar};
use crate::error::{KernelError, KernelResult};
use crate::graphics::{gpu::GpuBackend, Rect};
use crate::mm::{vmm, PAGE_SIZE};

/// VMware PCI vendor / SVGA II device.
pub const VMWARE_VENDOR_ID: u16 = 0x15AD;
pub const SVGA2_DEVICE_ID: u16 = 0x0405;

/// Index/value port offsets within BAR0.
const SVGA_INDEX_PORT: u16 = 0;
const SVGA_VALUE_PORT: u16 = 1;

/// Device version magic: SVGA II.
const SVGA_ID_2: u32 = 0x9000_0002;

/// SVGA registers (by index).
mod reg {
    pub const ID: u32 = 0;
    pub const ENABLE: u32 = 1;
    pub const WIDTH: u32 = 2;
    pub const HEIGHT: u32 = 3;
    pub const MAX_WIDTH: u32 = 4;
    pub const MAX_HEIGHT: u32 = 5;
    pub const BITS_PER_PIXEL: u32 = 7;
    pub const FB_START: u32 = 13;
    pub const VRAM_SIZE: u32 = 15;
    pub const FIFO_START: u32 = 18;
    pub const FIFO_SIZE: u32 = 19;
    pub const CONFIG_DONE: u32 = 20;
    pub const SYNC: u32 = 21;
    pub const BUSY: u32 = 22;
}

/// FIFO control slots (u32 indices into the FIFO memory).
mod fifo {
    pub const MIN: usize = 0;
    pub const MAX: usize = 1;
    pub const NEXT_CMD: usize = 2;
    pub const STOP: usize = 3;
    /// First usable command byte offset.
    pub const DATA_START: u32 = 16;
}

/// FIFO command: update a framebuffer rectangle on screen.
const SVGA_CMD_UPDATE: u32 = 1;

pub struct SvgaBackend {
    io_base: u16,
    fifo: *mut u32,
    fifo_size: u32,
    width: u32,
    height: u32,
}

// SAFETY: The FIFO pointer references the mapped BAR2 region owned by this
// backend; access is serialized by the HAL registry mutex.
unsafe impl Send for SvgaBackend {}

impl SvgaBackend {
    fn write_reg(&self, index: u32, value: u32) {
        // SAFETY: The index/value pair is the SVGA register protocol on
        // ports this driver owns.
        unsafe {
            crate::arch::x86_64::outl(self.io_base + SVGA_INDEX_PORT, index);
            crate::arch::x86_64::outl(self.io_base + SVGA_VALUE_PORT, value);
        }
    }

    fn read_reg(&self, index: u32) -> u32 {
        // SAFETY: As write_reg.
        unsafe {
            crate::arch::x86_64::outl(self.io_base + SVGA_INDEX_PORT, index);
            crate::arch::x86_64::inl(self.io_base + SVGA_VALUE_PORT)
        }
    }

    fn fifo_read(&self, slot: usize) -> u32 {
        // SAFETY: Slot indices stay inside the mapped FIFO region.
        unsafe { core::ptr::read_volatile(self.fifo.add(slot)) }
    }

    fn fifo_write(&self, slot: usize, value: u32) {
        // SAFETY: As fifo_read.
        unsafe { core::ptr::write_volatile(self.fifo.add(slot), value) }
    }

    /// Append one dword to the command FIFO, wrapping at MAX.
    fn fifo_push(&self, value: u32) {
        let next = self.fifo_read(fifo::NEXT_CMD);
        self.fifo_write(next as usize / 4, value);
        let mut advanced = next + 4;
        if advanced >= self.fifo_read(fifo::MAX) {
            advanced = self.fifo_read(fifo::MIN);
        }
        self.fifo_write(fifo::NEXT_CMD, advanced);
    }

    /// Kick the device and wait until it drains the FIFO.
    fn sync_fifo(&self) {
        self.write_reg(reg::SYNC, 1);
        let mut spins = 0u32;
        while self.read_reg(reg::BUSY) != 0 && spins < 1_000_000 {
            core::hint::spin_loop();
            spins += 1;
        }
    }

    /// Probe the adapter and initialize registers and FIFO.
    pub fn init() -> KernelResult<Self> {
        let pci_dev = pci::find_device(VMWARE_VENDOR_ID, SVGA2_DEVICE_ID)
            .ok_or(KernelError::DeviceAbsent { device: "svga2" })?;

        let mut access = pci::PortConfigAccess;
        pci::enable_memory_space(&mut access, pci_dev.location);
        pci::enable_bus_master(&mut access, pci_dev.location);

        let io_base = pci_dev.bars[0]
            .io_address()
            .ok_or(KernelError::HardwareError {
                device: "svga2",
                code: 0,
            })? as u16;
        let PciBar::Memory {
            address: fifo_phys, ..
        } = pci_dev.bars[2]
        else {
            return Err(KernelError::HardwareError {
                device: "svga2",
                code: 2,
            });
        };

        let mut backend = Self {
            io_base,
            fifo: core::ptr::null_mut(),
            fifo_size: 0,
            width: 0,
            height: 0,
        };

        // Version handshake: the device must accept SVGA II.
        backend.write_reg(reg::ID, SVGA_ID_2);
        if backend.read_reg(reg::ID) != SVGA_ID_2 {
            return Err(KernelError::NegotiationFailed { device: "svga2" });
        }

        let fifo_size = backend.read_reg(reg::FIFO_SIZE);
        let pages = (fifo_size as usize).div_ceil(PAGE_SIZE);
        vmm::map_range(fifo_phys, fifo_phys, pages, vmm::MMIO_FLAGS)?;
        backend.fifo = fifo_phys as *mut u32;
        backend.fifo_size = fifo_size;

        // FIFO bootstrap: reserve the control slots, then open for business.
        backend.fifo_write(fifo::MIN, fifo::DATA_START);
        backend.fifo_write(fifo::MAX, fifo_size);
        backend.fifo_write(fifo::NEXT_CMD, fifo::DATA_START);
        backend.fifo_write(fifo::STOP, fifo::DATA_START);
        backend.write_reg(reg::CONFIG_DONE, 1);

        println!(
            "[GPU] SVGA II at io {:#x}: vram {} KiB, fifo {} KiB, max {}x{}",
            io_base,
            backend.read_reg(reg::VRAM_SIZE) / 1024,
            fifo_size / 1024,
            backend.read_reg(reg::MAX_WIDTH),
            backend.read_reg(reg::MAX_HEIGHT)
        );
        Ok(backend)
    }

    /// Framebuffer physical base as programmed in the adapter.
    pub fn framebuffer_phys(&self) -> u64 {
        self.read_reg(reg::FB_START) as u64
    }
}

impl GpuBackend for SvgaBackend {
    fn name(&self) -> &'static str {
        "svga2"
    }

    fn priority(&self) -> u8 {
        // Below virtio-gpu: prefer the paravirtual path when both exist.
        5
    }

    fn configure(&mut self, width: u32, height: u32, _backing: &[(u64, u32)]) -> KernelResult<()> {
        // The adapter scans out of its own VRAM (the multiboot
        // framebuffer); backing pages are the software path's concern.
        self.write_reg(reg::WIDTH, width);
        self.write_reg(reg::HEIGHT, height);
        self.write_reg(reg::BITS_PER_PIXEL, 32);
        self.write_reg(reg::ENABLE, 1);
        self.width = width;
        self.height = height;
        Ok(())
    }

    fn present(&mut self, rect: Rect) -> KernelResult<()> {
        self.fifo_push(SVGA_CMD_UPDATE);
        self.fifo_push(rect.x);
        self.fifo_push(rect.y);
        self.fifo_push(rect.width);
        self.fifo_push(rect.height);
        self.sync_fifo();
        Ok(())
    }

    fn sync(&mut self) -> KernelResult<()> {
        if self.read_reg(reg::BUSY) != 0 {
            self.sync_fifo();
        }
        Ok(())
    }
}

/// Probe the adapter and register it with the HAL.
pub fn register_backend() -> KernelResult<()> {
    let backend = SvgaBackend::init()?;
    crate::graphics::gpu::register_backend(Box::new(backend))
}

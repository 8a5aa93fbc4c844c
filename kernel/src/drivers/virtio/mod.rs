//! Virtio subsystem -- modern PCI transport and device drivers.
//!
//! Virtio devices appear on the PCI bus with vendor ID 0x1AF4 (Red Hat).
//! The modern (virtio 1.0) transport exposes its register windows through
//! vendor-specific PCI capabilities: each capability names a configuration
//! structure type, the BAR it lives in, and an offset/length within that
//! BAR. The transport maps those windows uncached and drives the device
//! through them:
//!
//! ```text
//!   VirtioPciDevice
//!     |-- common_cfg   -- status, feature windows, queue registers
//!     |-- notify       -- queue doorbells (offset scaled per queue)
//!     |-- isr          -- interrupt status (read clears)
//!     +-- device_cfg   -- device-class specific (MAC address, ...)
//!
//!   VirtQueue (queue.rs)         -- split virtqueue in guest memory (shared)
//!   VirtioGpu (gpu.rs)           -- 2D framebuffer presentation
//!   VirtioNet (net.rs)           -- ethernet frames + RX buffer pool
//!   VirtioConsole (console.rs)   -- host-visible byte channel
//! ```
//!
//! Bring-up follows the virtio 1.0 status handshake: reset, ACKNOWLEDGE,
//! DRIVER, feature negotiation, FEATURES_OK (verified by read-back), queue
//! setup, DRIVER_OK.

pub mod console;
pub mod gpu;
pub mod net;
pub mod queue;

use crate::drivers::pci::{self, ConfigAccess, PciBar, PciDevice, PortConfigAccess};
use crate::error::{KernelError, KernelResult};
use crate::mm::{vmm, PAGE_SIZE};

use queue::VirtQueue;

/// Virtio vendor ID (Red Hat, Inc.)
pub const VIRTIO_VENDOR_ID: u16 = 0x1AF4;

/// Virtio-net device IDs: transitional and modern.
pub const VIRTIO_NET_ID_TRANSITIONAL: u16 = 0x1000;
pub const VIRTIO_NET_ID_MODERN: u16 = 0x1041;

/// Virtio-console device IDs: transitional and modern.
pub const VIRTIO_CONSOLE_ID_TRANSITIONAL: u16 = 0x1003;
pub const VIRTIO_CONSOLE_ID_MODERN: u16 = 0x1043;

/// Virtio-gpu device ID.
pub const VIRTIO_GPU_ID: u16 = 0x1050;

/// VIRTIO_F_VERSION_1: the device speaks the modern interface. Mandatory
/// for every modern bring-up; a device that drops it from FEATURES_OK is
/// unusable.
pub const VIRTIO_F_VERSION_1: u64 = 1 << 32;

/// Device status flags (cumulative).
pub mod status {
    /// Guest has found the device.
    pub const ACKNOWLEDGE: u8 = 1;
    /// Guest knows how to drive the device.
    pub const DRIVER: u8 = 2;
    /// Driver is ready.
    pub const DRIVER_OK: u8 = 4;
    /// Feature negotiation is complete.
    pub const FEATURES_OK: u8 = 8;
    /// Device hit an unrecoverable error.
    pub const DEVICE_NEEDS_RESET: u8 = 64;
    /// Driver has given up on the device.
    pub const FAILED: u8 = 128;
}

/// Vendor-capability `cfg_type` values.
mod cfg_type {
    pub const COMMON: u8 = 1;
    pub const NOTIFY: u8 = 2;
    pub const ISR: u8 = 3;
    pub const DEVICE: u8 = 4;
}

/// PCI capability id of vendor-specific capabilities.
const PCI_CAP_ID_VENDOR: u8 = 0x09;

/// `common_cfg` register offsets (virtio 1.0 section 4.1.4.3).
mod common_cfg {
    pub const DEVICE_FEATURE_SELECT: usize = 0x00;
    pub const DEVICE_FEATURE: usize = 0x04;
    pub const DRIVER_FEATURE_SELECT: usize = 0x08;
    pub const DRIVER_FEATURE: usize = 0x0C;
    pub const NUM_QUEUES: usize = 0x12;
    pub const DEVICE_STATUS: usize = 0x14;
    pub const QUEUE_SELECT: usize = 0x16;
    pub const QUEUE_SIZE: usize = 0x18;
    pub const QUEUE_ENABLE: usize = 0x1C;
    pub const QUEUE_NOTIFY_OFF: usize = 0x1E;
    pub const QUEUE_DESC: usize = 0x20;
    pub const QUEUE_DRIVER: usize = 0x28;
    pub const QUEUE_DEVICE: usize = 0x30;
}

/// A mapped MMIO window with volatile typed accessors.
///
/// The compiler must never reorder, elide or split these accesses; every
/// read/write is a `read_volatile`/`write_volatile` of the exact width.
#[derive(Debug, Clone, Copy)]
pub struct MmioWindow {
    base: usize,
    len: usize,
}

impl MmioWindow {
    /// # Safety
    ///
    /// `base..base+len` must be a mapped, uncached MMIO region owned by
    /// the caller's device for the kernel's lifetime.
    pub unsafe fn new(base: usize, len: usize) -> Self {
        Self { base, len }
    }

    #[inline]
    fn check(&self, offset: usize, width: usize) {
        debug_assert!(offset + width <= self.len, "MMIO access out of window");
    }

    pub fn read_u8(&self, offset: usize) -> u8 {
        self.check(offset, 1);
        // SAFETY: In-window access to mapped MMIO (constructor contract).
        unsafe { core::ptr::read_volatile((self.base + offset) as *const u8) }
    }

    pub fn write_u8(&self, offset: usize, value: u8) {
        self.check(offset, 1);
        // SAFETY: As read_u8.
        unsafe { core::ptr::write_volatile((self.base + offset) as *mut u8, value) }
    }

    pub fn read_u16(&self, offset: usize) -> u16 {
        self.check(offset, 2);
        // SAFETY: As read_u8.
        unsafe { core::ptr::read_volatile((self.base + offset) as *const u16) }
    }

    pub fn write_u16(&self, offset: usize, value: u16) {
        self.check(offset, 2);
        // SAFETY: As read_u8.
        unsafe { core::ptr::write_volatile((self.base + offset) as *mut u16, value) }
    }

    pub fn read_u32(&self, offset: usize) -> u32 {
        self.check(offset, 4);
        // SAFETY: As read_u8.
        unsafe { core::ptr::read_volatile((self.base + offset) as *const u32) }
    }

    pub fn write_u32(&self, offset: usize, value: u32) {
        self.check(offset, 4);
        // SAFETY: As read_u8.
        unsafe { core::ptr::write_volatile((self.base + offset) as *mut u32, value) }
    }

    pub fn write_u64(&self, offset: usize, value: u64) {
        // Two dword halves: some devices reject 64-bit MMIO bursts.
        self.write_u32(offset, value as u32);
        self.write_u32(offset + 4, (value >> 32) as u32);
    }
}

/// One parsed vendor capability.
#[derive(Debug, Clone, Copy)]
struct VirtioCap {
    cfg_type: u8,
    bar: u8,
    offset: u32,
    length: u32,
    /// Only meaningful on notify capabilities.
    notify_off_multiplier: u32,
}

/// A bound modern virtio PCI device.
pub struct VirtioPciDevice {
    pub pci: PciDevice,
    common: MmioWindow,
    notify_base: usize,
    notify_len: usize,
    notify_off_multiplier: u32,
    isr: MmioWindow,
    device_cfg: Option<MmioWindow>,
}

impl VirtioPciDevice {
    /// Bind the transport: enable the device on the bus, parse the vendor
    /// capabilities and map every referenced window uncached.
    pub fn bind(name: &'static str, pci_dev: PciDevice) -> KernelResult<Self> {
        let mut access = PortConfigAccess;
        pci::enable_memory_space(&mut access, pci_dev.location);
        pci::enable_bus_master(&mut access, pci_dev.location);

        let mut common = None;
        let mut notify = None;
        let mut isr = None;
        let mut device_cfg = None;

        for (id, cap_off) in pci::capabilities(&mut access, pci_dev.location) {
            if id != PCI_CAP_ID_VENDOR {
                continue;
            }
            let cap = VirtioCap {
                cfg_type: access.read8(pci_dev.location, cap_off + 3),
                bar: access.read8(pci_dev.location, cap_off + 4),
                offset: access.read32(pci_dev.location, cap_off + 8),
                length: access.read32(pci_dev.location, cap_off + 12),
                notify_off_multiplier: if access.read8(pci_dev.location, cap_off + 3)
                    == cfg_type::NOTIFY
                {
                    access.read32(pci_dev.location, cap_off + 16)
                } else {
                    0
                },
            };
            match cap.cfg_type {
                cfg_type::COMMON if common.is_none() => common = Some(cap),
                cfg_type::NOTIFY if notify.is_none() => notify = Some(cap),
                cfg_type::ISR if isr.is_none() => isr = Some(cap),
                cfg_type::DEVICE if device_cfg.is_none() => device_cfg = Some(cap),
                _ => {}
            }
        }

        let common = common.ok_or(KernelError::NegotiationFailed { device: name })?;
        let notify = notify.ok_or(KernelError::NegotiationFailed { device: name })?;
        let isr = isr.ok_or(KernelError::NegotiationFailed { device: name })?;

        let common_win = Self::map_cap(&pci_dev, &common, name)?;
        let notify_win = Self::map_cap(&pci_dev, &notify, name)?;
        let isr_win = Self::map_cap(&pci_dev, &isr, name)?;
        let device_win = match device_cfg {
            Some(cap) => Some(Self::map_cap(&pci_dev, &cap, name)?),
            None => None,
        };

        println!(
            "[VIRTIO] {} bound: common at {:#x}, notify multiplier {}",
            name, common_win.base, notify.notify_off_multiplier
        );

        Ok(Self {
            pci: pci_dev,
            common: common_win,
            notify_base: notify_win.base,
            notify_len: notify_win.len,
            notify_off_multiplier: notify.notify_off_multiplier,
            isr: isr_win,
            device_cfg: device_win,
        })
    }

    /// Map the pages covering a capability's window, uncached, and return
    /// the window itself.
    fn map_cap(
        pci_dev: &PciDevice,
        cap: &VirtioCap,
        name: &'static str,
    ) -> KernelResult<MmioWindow> {
        if cap.length == 0 {
            return Err(KernelError::NegotiationFailed { device: name });
        }
        let bar = *pci_dev
            .bars
            .get(cap.bar as usize)
            .ok_or(KernelError::NegotiationFailed { device: name })?;
        let PciBar::Memory { address, .. } = bar else {
            return Err(KernelError::NegotiationFailed { device: name });
        };

        let phys = address + cap.offset as u64;
        let first_page = phys & !(PAGE_SIZE as u64 - 1);
        let last_page = (phys + cap.length as u64 - 1) & !(PAGE_SIZE as u64 - 1);
        let pages = ((last_page - first_page) / PAGE_SIZE as u64 + 1) as usize;
        vmm::map_range(first_page, first_page, pages, vmm::MMIO_FLAGS)?;

        // SAFETY: Just mapped, device-owned for the kernel's lifetime.
        Ok(unsafe { MmioWindow::new(phys as usize, cap.length as usize) })
    }

    // ---- Status handshake ----

    pub fn read_status(&self) -> u8 {
        self.common.read_u8(common_cfg::DEVICE_STATUS)
    }

    fn write_status(&self, status: u8) {
        self.common.write_u8(common_cfg::DEVICE_STATUS, status);
    }

    fn add_status(&self, bits: u8) {
        let current = self.read_status();
        self.write_status(current | bits);
    }

    /// Reset, then acknowledge and declare a driver.
    pub fn begin_init(&self) {
        self.write_status(0);
        // The device signals reset completion by reading back 0.
        let mut spins = 0u32;
        while self.read_status() != 0 && spins < 100_000 {
            core::hint::spin_loop();
            spins += 1;
        }
        self.add_status(status::ACKNOWLEDGE);
        self.add_status(status::DRIVER);
    }

    /// Negotiate the feature set: offer ∩ `supported`, always including
    /// VIRTIO_F_VERSION_1. Verifies the device retained FEATURES_OK.
    pub fn negotiate_features(
        &self,
        name: &'static str,
        supported: u64,
    ) -> KernelResult<u64> {
        self.common
            .write_u32(common_cfg::DEVICE_FEATURE_SELECT, 0);
        let lo = self.common.read_u32(common_cfg::DEVICE_FEATURE) as u64;
        self.common
            .write_u32(common_cfg::DEVICE_FEATURE_SELECT, 1);
        let hi = self.common.read_u32(common_cfg::DEVICE_FEATURE) as u64;
        let offered = (hi << 32) | lo;

        let accepted = offered & (supported | VIRTIO_F_VERSION_1);
        if accepted & VIRTIO_F_VERSION_1 == 0 {
            println!("[VIRTIO] {} does not offer VERSION_1", name);
            self.add_status(status::FAILED);
            return Err(KernelError::NegotiationFailed { device: name });
        }

        self.common
            .write_u32(common_cfg::DRIVER_FEATURE_SELECT, 0);
        self.common
            .write_u32(common_cfg::DRIVER_FEATURE, accepted as u32);
        self.common
            .write_u32(common_cfg::DRIVER_FEATURE_SELECT, 1);
        self.common
            .write_u32(common_cfg::DRIVER_FEATURE, (accepted >> 32) as u32);

        self.add_status(status::FEATURES_OK);
        if self.read_status() & status::FEATURES_OK == 0 {
            println!("[VIRTIO] {} rejected FEATURES_OK", name);
            self.add_status(status::FAILED);
            return Err(KernelError::NegotiationFailed { device: name });
        }
        Ok(accepted)
    }

    /// Number of virtqueues the device exposes.
    pub fn num_queues(&self) -> u16 {
        self.common.read_u16(common_cfg::NUM_QUEUES)
    }

    /// Configure virtqueue `index`: read the device's size (capped at
    /// `max`), lay the rings out in two fresh pages, hand the physical
    /// pointers to the device, enable the queue, and record its doorbell.
    pub fn setup_queue(
        &self,
        name: &'static str,
        index: u16,
        max: u16,
    ) -> KernelResult<VirtQueue> {
        self.common.write_u16(common_cfg::QUEUE_SELECT, index);
        let device_size = self.common.read_u16(common_cfg::QUEUE_SIZE);
        if device_size == 0 {
            return Err(KernelError::NegotiationFailed { device: name });
        }
        let size = device_size.min(max);
        // A smaller driver cap is written back so the ring layouts agree.
        if size != device_size {
            self.common.write_u16(common_cfg::QUEUE_SIZE, size);
        }

        let mem = queue::alloc_queue_memory()?;
        let mut vq = VirtQueue::new(size, mem)?;

        self.common
            .write_u64(common_cfg::QUEUE_DESC, vq.phys_desc());
        self.common
            .write_u64(common_cfg::QUEUE_DRIVER, vq.phys_avail());
        self.common
            .write_u64(common_cfg::QUEUE_DEVICE, vq.phys_used());
        self.common.write_u16(common_cfg::QUEUE_ENABLE, 1);

        let notify_off = self.common.read_u16(common_cfg::QUEUE_NOTIFY_OFF);
        let doorbell =
            self.notify_base + notify_off as usize * self.notify_off_multiplier as usize;
        debug_assert!(doorbell + 2 <= self.notify_base + self.notify_len);
        vq.set_doorbell(doorbell, index);

        println!(
            "[VIRTIO] {} queue {} ready: {} entries, notify offset {}",
            name, index, size, notify_off
        );
        Ok(vq)
    }

    /// Declare bring-up complete.
    pub fn set_driver_ok(&self) {
        self.add_status(status::DRIVER_OK);
    }

    /// Read the ISR status (read clears the interrupt).
    pub fn read_isr(&self) -> u8 {
        self.isr.read_u8(0)
    }

    /// Read one byte of device-specific configuration.
    pub fn read_device_cfg_u8(&self, offset: usize) -> Option<u8> {
        self.device_cfg.map(|w| w.read_u8(offset))
    }
}

//! PCI bus driver.
//!
//! Configuration space is reached through the legacy 0xCF8/0xCFC port
//! pair. The scan covers bus 0, devices 0-31, function 0 plus functions
//! 1-7 on multifunction headers. BAR probing uses the all-ones
//! write/read-back/restore sequence and understands I/O, 32-bit memory and
//! 64-bit memory BARs (which consume the following slot).
//!
//! Access goes through the [`ConfigAccess`] trait so the probe and sizing
//! logic runs against a mock in tests; the kernel uses [`PortConfigAccess`].

use alloc::vec::Vec;

use spin::Mutex;

use crate::error::{KernelError, KernelResult};
use crate::sync::GlobalState;

/// PCI configuration space registers
#[repr(u8)]
#[allow(dead_code)]
pub enum PciConfigRegister {
    VendorId = 0x00,
    DeviceId = 0x02,
    Command = 0x04,
    Status = 0x06,
    RevisionId = 0x08,
    ProgIf = 0x09,
    Subclass = 0x0A,
    ClassCode = 0x0B,
    HeaderType = 0x0E,
    Bar0 = 0x10,
    CapabilitiesPointer = 0x34,
    InterruptLine = 0x3C,
    InterruptPin = 0x3D,
}

/// PCI command register flags
pub mod command_flags {
    pub const IO_SPACE: u16 = 1 << 0;
    pub const MEMORY_SPACE: u16 = 1 << 1;
    pub const BUS_MASTER: u16 = 1 << 2;
    pub const INTERRUPT_DISABLE: u16 = 1 << 10;
}

/// Status register: capability list present.
const STATUS_CAP_LIST: u16 = 1 << 4;

/// PCI device location on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PciLocation {
    pub bus: u8,
    pub device: u8,
    pub function: u8,
}

impl PciLocation {
    pub fn new(bus: u8, device: u8, function: u8) -> Self {
        Self {
            bus,
            device,
            function,
        }
    }

    /// 0xCF8 address format: enable bit, bus, device, function.
    pub fn to_config_address(self, offset: u8) -> u32 {
        0x8000_0000
            | ((self.bus as u32) << 16)
            | ((self.device as u32) << 11)
            | ((self.function as u32) << 8)
            | (offset as u32 & 0xFC)
    }
}

/// How configuration space is accessed.
pub trait ConfigAccess {
    fn read32(&mut self, loc: PciLocation, offset: u8) -> u32;
    fn write32(&mut self, loc: PciLocation, offset: u8, value: u32);

    fn read16(&mut self, loc: PciLocation, offset: u8) -> u16 {
        let dword = self.read32(loc, offset & 0xFC);
        (dword >> ((offset & 2) * 8)) as u16
    }

    fn read8(&mut self, loc: PciLocation, offset: u8) -> u8 {
        let dword = self.read32(loc, offset & 0xFC);
        (dword >> ((offset & 3) * 8)) as u8
    }

    fn write16(&mut self, loc: PciLocation, offset: u8, value: u16) {
        let aligned = offset & 0xFC;
        let shift = (offset & 2) * 8;
        let dword = self.read32(loc, aligned);
        let dword = (dword & !(0xFFFF << shift)) | ((value as u32) << shift);
        self.write32(loc, aligned, dword);
    }
}

/// The real mechanism: address latch at 0xCF8, data window at 0xCFC.
pub struct PortConfigAccess;

const CONFIG_ADDRESS: u16 = 0xCF8;
const CONFIG_DATA: u16 = 0xCFC;

impl ConfigAccess for PortConfigAccess {
    fn read32(&mut self, loc: PciLocation, offset: u8) -> u32 {
        // SAFETY: The 0xCF8/0xCFC pair is the architectural configuration
        // mechanism; reads have no device side effects.
        unsafe {
            crate::arch::x86_64::outl(CONFIG_ADDRESS, loc.to_config_address(offset));
            crate::arch::x86_64::inl(CONFIG_DATA)
        }
    }

    fn write32(&mut self, loc: PciLocation, offset: u8, value: u32) {
        // SAFETY: Writing a configuration register the caller owns.
        unsafe {
            crate::arch::x86_64::outl(CONFIG_ADDRESS, loc.to_config_address(offset));
            crate::arch::x86_64::outl(CONFIG_DATA, value);
        }
    }
}

/// One decoded Base Address Register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PciBar {
    None,
    Io {
        address: u32,
        size: u32,
    },
    Memory {
        address: u64,
        size: u64,
        prefetchable: bool,
        is_64bit: bool,
    },
}

impl PciBar {
    pub fn memory_address(&self) -> Option<u64> {
        match self {
            PciBar::Memory { address, .. } => Some(*address),
            _ => None,
        }
    }

    pub fn io_address(&self) -> Option<u32> {
        match self {
            PciBar::Io { address, .. } => Some(*address),
            _ => None,
        }
    }
}

/// A discovered PCI function.
#[derive(Debug, Clone)]
pub struct PciDevice {
    pub location: PciLocation,
    pub vendor_id: u16,
    pub device_id: u16,
    pub class_code: u8,
    pub subclass: u8,
    pub prog_if: u8,
    pub revision: u8,
    pub header_type: u8,
    pub interrupt_line: u8,
    pub interrupt_pin: u8,
    pub bars: [PciBar; 6],
}

impl PciDevice {
    pub fn is_multifunction(&self) -> bool {
        self.header_type & 0x80 != 0
    }
}

/// Vendor ID read on an empty slot.
const VENDOR_NONE: u16 = 0xFFFF;

/// Probe one function; `None` when the slot is empty.
pub fn probe_function(access: &mut impl ConfigAccess, loc: PciLocation) -> Option<PciDevice> {
    let vendor_id = access.read16(loc, 0x00);
    if vendor_id == VENDOR_NONE {
        return None;
    }

    let device_id = access.read16(loc, 0x02);
    let revision = access.read8(loc, 0x08);
    let prog_if = access.read8(loc, 0x09);
    let subclass = access.read8(loc, 0x0A);
    let class_code = access.read8(loc, 0x0B);
    let header_type = access.read8(loc, 0x0E);
    let interrupt_line = access.read8(loc, 0x3C);
    let interrupt_pin = access.read8(loc, 0x3D);

    // Only standard (type 0) headers carry the six BARs.
    let bars = if header_type & 0x7F == 0 {
        probe_bars(access, loc)
    } else {
        [PciBar::None; 6]
    };

    Some(PciDevice {
        location: loc,
        vendor_id,
        device_id,
        class_code,
        subclass,
        prog_if,
        revision,
        header_type,
        interrupt_line,
        interrupt_pin,
        bars,
    })
}

/// Size and decode the six BARs with the all-ones probe.
fn probe_bars(access: &mut impl ConfigAccess, loc: PciLocation) -> [PciBar; 6] {
    let mut bars = [PciBar::None; 6];
    let mut i = 0;
    while i < 6 {
        let offset = 0x10 + (i as u8) * 4;
        let original = access.read32(loc, offset);
        access.write32(loc, offset, 0xFFFF_FFFF);
        let mask = access.read32(loc, offset);
        access.write32(loc, offset, original);

        if mask == 0 {
            i += 1;
            continue;
        }

        if original & 1 != 0 {
            // I/O BAR: low two bits are type
            let size = (!(mask & !0x3)).wrapping_add(1);
            bars[i] = PciBar::Io {
                address: original & !0x3,
                size,
            };
            i += 1;
        } else {
            let bar_type = (original >> 1) & 0x3;
            let prefetchable = original & 0x8 != 0;
            if bar_type == 2 {
                // 64-bit memory BAR: the next slot holds the upper dword.
                let offset_hi = offset + 4;
                let original_hi = access.read32(loc, offset_hi);
                access.write32(loc, offset_hi, 0xFFFF_FFFF);
                let mask_hi = access.read32(loc, offset_hi);
                access.write32(loc, offset_hi, original_hi);

                let full_mask = ((mask_hi as u64) << 32) | (mask & !0xF) as u64;
                let size = (!full_mask).wrapping_add(1);
                let address = ((original_hi as u64) << 32) | (original & !0xF) as u64;
                bars[i] = PciBar::Memory {
                    address,
                    size,
                    prefetchable,
                    is_64bit: true,
                };
                i += 2;
            } else {
                let size = (!(mask & !0xF)).wrapping_add(1) as u64;
                bars[i] = PciBar::Memory {
                    address: (original & !0xF) as u64,
                    size,
                    prefetchable,
                    is_64bit: false,
                };
                i += 1;
            }
        }
    }
    bars
}

/// Enumerate bus 0.
pub fn scan_bus0(access: &mut impl ConfigAccess) -> Vec<PciDevice> {
    let mut devices = Vec::new();
    for device in 0..32 {
        let loc = PciLocation::new(0, device, 0);
        let Some(dev) = probe_function(access, loc) else {
            continue;
        };
        let multifunction = dev.is_multifunction();
        devices.push(dev);

        if multifunction {
            for function in 1..8 {
                let loc = PciLocation::new(0, device, function);
                if let Some(dev) = probe_function(access, loc) {
                    devices.push(dev);
                }
            }
        }
    }
    devices
}

/// Walk the capability list: `(capability id, config-space offset)` pairs.
pub fn capabilities(access: &mut impl ConfigAccess, loc: PciLocation) -> Vec<(u8, u8)> {
    let mut caps = Vec::new();
    let status = access.read16(loc, 0x06);
    if status & STATUS_CAP_LIST == 0 {
        return caps;
    }
    let mut ptr = access.read8(loc, 0x34) & 0xFC;
    // Bounded walk; a malformed list must not loop forever.
    for _ in 0..48 {
        if ptr == 0 {
            break;
        }
        let id = access.read8(loc, ptr);
        caps.push((id, ptr));
        ptr = access.read8(loc, ptr + 1) & 0xFC;
    }
    caps
}

/// Set command-register bits; idempotent (writes only when bits are clear).
fn enable_command_bits(access: &mut impl ConfigAccess, loc: PciLocation, bits: u16) {
    let command = access.read16(loc, 0x04);
    if command & bits != bits {
        access.write16(loc, 0x04, command | bits);
    }
}

/// Allow the device to DMA into guest memory.
pub fn enable_bus_master(access: &mut impl ConfigAccess, loc: PciLocation) {
    enable_command_bits(access, loc, command_flags::BUS_MASTER);
}

/// Allow the device to decode its memory BARs.
pub fn enable_memory_space(access: &mut impl ConfigAccess, loc: PciLocation) {
    enable_command_bits(access, loc, command_flags::MEMORY_SPACE);
}

/// Devices discovered at init.
static DEVICES: GlobalState<Mutex<Vec<PciDevice>>> = GlobalState::new();

/// Scan the bus once and record what was found.
pub fn init() -> KernelResult<()> {
    let mut access = PortConfigAccess;
    let devices = scan_bus0(&mut access);
    for dev in &devices {
        println!(
            "[PCI] {:02x}:{:02x}.{} {:04x}:{:04x} class {:02x}.{:02x} irq {}",
            dev.location.bus,
            dev.location.device,
            dev.location.function,
            dev.vendor_id,
            dev.device_id,
            dev.class_code,
            dev.subclass,
            dev.interrupt_line
        );
    }
    println!("[PCI] Enumeration complete: {} functions", devices.len());
    DEVICES
        .init(Mutex::new(devices))
        .map_err(|_| KernelError::AlreadyExists {
            resource: "PCI device list",
            id: 0,
        })
}

/// Find a device by vendor/device ID in the scan results.
pub fn find_device(vendor_id: u16, device_id: u16) -> Option<PciDevice> {
    DEVICES.with(|devices| {
        devices
            .lock()
            .iter()
            .find(|d| d.vendor_id == vendor_id && d.device_id == device_id)
            .cloned()
    })?
}

/// Find the first device of a class/subclass pair.
pub fn find_by_class(class_code: u8, subclass: u8) -> Option<PciDevice> {
    DEVICES.with(|devices| {
        devices
            .lock()
            .iter()
            .find(|d| d.class_code == class_code && d.subclass == subclass)
            .cloned()
    })?
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use alloc::collections::BTreeMap;

    use super::*;

    /// Register-level mock. BAR slots answer the all-ones probe with their
    /// size mask, like hardware.
    struct MockConfig {
        regs: BTreeMap<(PciLocation, u8), u32>,
        /// BAR offset -> (reset value, size mask answered to all-ones)
        bar_masks: BTreeMap<(PciLocation, u8), u32>,
    }

    impl MockConfig {
        fn new() -> Self {
            Self {
                regs: BTreeMap::new(),
                bar_masks: BTreeMap::new(),
            }
        }

        fn set(&mut self, loc: PciLocation, offset: u8, value: u32) {
            self.regs.insert((loc, offset), value);
        }

        fn set_bar(&mut self, loc: PciLocation, offset: u8, value: u32, mask: u32) {
            self.regs.insert((loc, offset), value);
            self.bar_masks.insert((loc, offset), mask);
        }
    }

    impl ConfigAccess for MockConfig {
        fn read32(&mut self, loc: PciLocation, offset: u8) -> u32 {
            // Empty slots float high, like real config reads.
            *self.regs.get(&(loc, offset)).unwrap_or(&0xFFFF_FFFF)
        }

        fn write32(&mut self, loc: PciLocation, offset: u8, value: u32) {
            if value == 0xFFFF_FFFF {
                if let Some(&mask) = self.bar_masks.get(&(loc, offset)) {
                    self.regs.insert((loc, offset), mask);
                    return;
                }
            }
            self.regs.insert((loc, offset), value);
        }
    }

    fn loc0() -> PciLocation {
        PciLocation::new(0, 3, 0)
    }

    fn install_device(mock: &mut MockConfig, loc: PciLocation) {
        mock.set(loc, 0x00, (0x1041u32 << 16) | 0x1AF4); // device:vendor
        mock.set(loc, 0x04, 0x0010_0000); // status: cap list; command 0
        mock.set(loc, 0x08, 0x0200_0001); // class 02 (net), rev 1
        mock.set(loc, 0x0C, 0); // single-function header
        mock.set(loc, 0x3C, 0x0000_010B); // pin 1, line 11
        for bar in 0..6u8 {
            mock.set(loc, 0x10 + bar * 4, 0);
        }
    }

    #[test]
    fn test_config_address_format() {
        let loc = PciLocation::new(0, 31, 7);
        let addr = loc.to_config_address(0x3D);
        assert_eq!(addr, 0x8000_0000 | (31 << 11) | (7 << 8) | 0x3C);
    }

    #[test]
    fn test_probe_reads_identity() {
        let mut mock = MockConfig::new();
        install_device(&mut mock, loc0());
        let dev = probe_function(&mut mock, loc0()).unwrap();
        assert_eq!(dev.vendor_id, 0x1AF4);
        assert_eq!(dev.device_id, 0x1041);
        assert_eq!(dev.class_code, 0x02);
        assert_eq!(dev.interrupt_line, 0x0B);
        assert_eq!(dev.interrupt_pin, 0x01);
        assert!(!dev.is_multifunction());
    }

    #[test]
    fn test_absent_slot_is_none() {
        let mut mock = MockConfig::new();
        assert!(probe_function(&mut mock, loc0()).is_none());
    }

    #[test]
    fn test_io_bar_sizing() {
        let mut mock = MockConfig::new();
        install_device(&mut mock, loc0());
        // 32-byte I/O window at 0xC000
        mock.set_bar(loc0(), 0x10, 0xC001, 0xFFFF_FFE1);
        let dev = probe_function(&mut mock, loc0()).unwrap();
        assert_eq!(
            dev.bars[0],
            PciBar::Io {
                address: 0xC000,
                size: 32
            }
        );
    }

    #[test]
    fn test_memory_bar_32bit_sizing() {
        let mut mock = MockConfig::new();
        install_device(&mut mock, loc0());
        // 4 KiB non-prefetchable window at 0xFEB0_0000
        mock.set_bar(loc0(), 0x10, 0xFEB0_0000, 0xFFFF_F000);
        let dev = probe_function(&mut mock, loc0()).unwrap();
        assert_eq!(
            dev.bars[0],
            PciBar::Memory {
                address: 0xFEB0_0000,
                size: 4096,
                prefetchable: false,
                is_64bit: false
            }
        );
    }

    #[test]
    fn test_memory_bar_64bit_consumes_next_slot() {
        let mut mock = MockConfig::new();
        install_device(&mut mock, loc0());
        // 16 KiB prefetchable 64-bit window at 0x8_0000_0000
        mock.set_bar(loc0(), 0x10, 0x0000_000C, 0xFFFF_C000);
        mock.set_bar(loc0(), 0x14, 0x0000_0008, 0xFFFF_FFFF);
        let dev = probe_function(&mut mock, loc0()).unwrap();
        assert_eq!(
            dev.bars[0],
            PciBar::Memory {
                address: 0x8_0000_0000,
                size: 16384,
                prefetchable: true,
                is_64bit: true
            }
        );
        assert_eq!(dev.bars[1], PciBar::None);
    }

    #[test]
    fn test_bar_probe_restores_original_value() {
        let mut mock = MockConfig::new();
        install_device(&mut mock, loc0());
        mock.set_bar(loc0(), 0x10, 0xFEB0_0000, 0xFFFF_F000);
        probe_function(&mut mock, loc0()).unwrap();
        assert_eq!(mock.read32(loc0(), 0x10), 0xFEB0_0000);
    }

    #[test]
    fn test_capability_walk() {
        let mut mock = MockConfig::new();
        install_device(&mut mock, loc0());
        mock.set(loc0(), 0x34, 0x40);
        // Vendor cap at 0x40 chaining to MSI-X at 0x50
        mock.set(loc0(), 0x40, 0x0000_5009);
        mock.set(loc0(), 0x50, 0x0000_0011);
        let caps = capabilities(&mut mock, loc0());
        assert_eq!(caps, alloc::vec![(0x09, 0x40), (0x11, 0x50)]);
    }

    #[test]
    fn test_enable_bits_idempotent() {
        let mut mock = MockConfig::new();
        install_device(&mut mock, loc0());
        enable_bus_master(&mut mock, loc0());
        let after_first = mock.read32(loc0(), 0x04);
        enable_bus_master(&mut mock, loc0());
        assert_eq!(mock.read32(loc0(), 0x04), after_first);
        assert_ne!(after_first & command_flags::BUS_MASTER as u32, 0);
    }

    #[test]
    fn test_scan_respects_multifunction_bit() {
        let mut mock = MockConfig::new();
        let f0 = PciLocation::new(0, 4, 0);
        let f1 = PciLocation::new(0, 4, 1);
        install_device(&mut mock, f0);
        mock.set(f0, 0x0C, 0x0080_0000); // multifunction header type
        install_device(&mut mock, f1);
        let devices = scan_bus0(&mut mock);
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[1].location, f1);
    }
}

//! VirtIO network driver.
//!
//! Two virtqueues over the modern transport: receiveq (0) and transmitq
//! (1). A pool of device-writable RX buffers is posted up front and
//! recycled as frames drain; a single TX buffer is reused for every send
//! (sends are synchronous: publish, kick, poll the used ring, reclaim).
//!
//! On the bus every frame is prefixed by the 10-byte virtio-net header;
//! the driver zeroes it on transmit and strips it on receive, so the
//! protocol stack above sees plain Ethernet frames.

use alloc::boxed::Box;

use crate::drivers::pci;
use crate::drivers::virtio::{
    VirtioPciDevice, VIRTIO_NET_ID_MODERN, VIRTIO_NET_ID_TRANSITIONAL, VIRTIO_VENDOR_ID,
};
use crate::error::{KernelError, KernelResult};
use crate::mm::{pmm::FRAME_ALLOCATOR, PAGE_SIZE};
use crate::net::{device::NetDevice, MacAddress};

use super::queue::{VirtQueue, VIRTQ_DESC_F_WRITE, VIRTQ_INVALID_NEXT};

/// Receive queue index.
const RX_QUEUE: u16 = 0;
/// Transmit queue index.
const TX_QUEUE: u16 = 1;

/// Driver cap on both queue sizes.
const QUEUE_MAX: u16 = 128;

/// Length of the virtio-net header prefixed to every frame on the bus.
pub const NET_HDR_LEN: usize = 10;

/// Per-buffer size: header + a full Ethernet frame with headroom.
const BUF_LEN: usize = 2048;

/// Posted RX buffers.
const RX_POOL: usize = 16;

/// Feature bit: the device reports its MAC in device config.
const VIRTIO_NET_F_MAC: u64 = 1 << 5;

/// The bound NIC.
pub struct VirtioNet {
    dev: VirtioPciDevice,
    rxq: VirtQueue,
    txq: VirtQueue,
    /// Physically contiguous RX pool block.
    rx_block: u64,
    /// Single TX staging buffer.
    tx_block: u64,
    mac: MacAddress,
}

// SAFETY: The DMA blocks are PMM allocations owned by this driver; access
// is serialized by the mutex the registered device sits behind.
unsafe impl Send for VirtioNet {}

impl VirtioNet {
    /// Probe and bring up the NIC, post the RX pool, read the MAC.
    pub fn init() -> KernelResult<Self> {
        let pci_dev = pci::find_device(VIRTIO_VENDOR_ID, VIRTIO_NET_ID_MODERN)
            .or_else(|| pci::find_device(VIRTIO_VENDOR_ID, VIRTIO_NET_ID_TRANSITIONAL))
            .ok_or(KernelError::DeviceAbsent {
                device: "virtio-net",
            })?;

        let dev = VirtioPciDevice::bind("virtio-net", pci_dev)?;
        dev.begin_init();
        let features = dev.negotiate_features("virtio-net", VIRTIO_NET_F_MAC)?;

        let mut rxq = dev.setup_queue("virtio-net", RX_QUEUE, QUEUE_MAX)?;
        let txq = dev.setup_queue("virtio-net", TX_QUEUE, QUEUE_MAX)?;

        // RX pool and TX buffer, physically contiguous.
        let rx_pages = (RX_POOL * BUF_LEN).div_ceil(PAGE_SIZE);
        let rx_block = FRAME_ALLOCATOR
            .lock()
            .alloc_pages(rx_pages)
            .ok_or(KernelError::OutOfMemory {
                requested: rx_pages * PAGE_SIZE,
                available: 0,
            })?
            .as_u64();
        let tx_block = FRAME_ALLOCATOR
            .lock()
            .alloc_page()
            .ok_or(KernelError::OutOfMemory {
                requested: PAGE_SIZE,
                available: 0,
            })?
            .as_u64();

        // Post every RX buffer as a device-writable descriptor.
        for i in 0..RX_POOL {
            let desc = rxq.alloc_desc().ok_or(KernelError::ResourceExhausted {
                resource: "virtio-net rx descriptors",
            })?;
            // SAFETY: The pool block stays allocated for the driver's
            // lifetime; each buffer is BUF_LEN bytes.
            unsafe {
                rxq.write_desc(
                    desc,
                    rx_block + (i * BUF_LEN) as u64,
                    BUF_LEN as u32,
                    VIRTQ_DESC_F_WRITE,
                    VIRTQ_INVALID_NEXT,
                );
            }
            rxq.publish(desc);
        }
        rxq.kick();

        dev.set_driver_ok();

        let mac = if features & VIRTIO_NET_F_MAC != 0 {
            let mut bytes = [0u8; 6];
            for (i, b) in bytes.iter_mut().enumerate() {
                *b = dev.read_device_cfg_u8(i).unwrap_or(0);
            }
            MacAddress(bytes)
        } else {
            // QEMU's default guest MAC prefix; better than all-zero.
            MacAddress([0x52, 0x54, 0x00, 0x12, 0x34, 0x56])
        };

        println!(
            "[NET] virtio-net up, MAC {:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}, {} rx buffers",
            mac.0[0], mac.0[1], mac.0[2], mac.0[3], mac.0[4], mac.0[5], RX_POOL
        );

        Ok(Self {
            dev,
            rxq,
            txq,
            rx_block,
            tx_block,
            mac,
        })
    }

    /// ISR read for the polling path.
    pub fn ack_interrupt(&self) -> u8 {
        self.dev.read_isr()
    }
}

impl NetDevice for VirtioNet {
    fn mac_address(&self) -> MacAddress {
        self.mac
    }

    fn transmit(&mut self, frame: &[u8]) -> KernelResult<()> {
        if frame.len() + NET_HDR_LEN > BUF_LEN {
            return Err(KernelError::InvalidArgument {
                name: "frame",
                value: "exceeds the transmit buffer",
            });
        }

        let tx_virt = self.tx_block as *mut u8;
        // SAFETY: The TX block is a page owned by this driver; the device
        // has completed (or never seen) any previous use of it because
        // sends are synchronous.
        unsafe {
            core::ptr::write_bytes(tx_virt, 0, NET_HDR_LEN);
            core::ptr::copy_nonoverlapping(frame.as_ptr(), tx_virt.add(NET_HDR_LEN), frame.len());
        }

        let desc = self
            .txq
            .alloc_desc()
            .ok_or(KernelError::ResourceExhausted {
                resource: "virtio-net tx descriptors",
            })?;
        // SAFETY: TX block valid for the duration of the synchronous send.
        unsafe {
            self.txq.write_desc(
                desc,
                self.tx_block,
                (NET_HDR_LEN + frame.len()) as u32,
                0,
                VIRTQ_INVALID_NEXT,
            );
        }
        self.txq.publish(desc);
        self.txq.kick();

        let result = self.txq.wait_used("virtio-net transmit");
        self.txq.free_chain(desc);
        result.map(|_| ())
    }

    fn poll_receive(&mut self, sink: &mut dyn FnMut(&[u8])) -> KernelResult<()> {
        let mut drained = false;
        while let Some((desc_idx, written)) = self.rxq.poll_used() {
            let desc = self.rxq.desc(desc_idx);
            debug_assert!(desc.addr >= self.rx_block);
            let written = written as usize;
            if written > NET_HDR_LEN && written <= BUF_LEN {
                let frame_ptr = (desc.addr as usize + NET_HDR_LEN) as *const u8;
                // SAFETY: The descriptor's buffer is inside the RX pool
                // block; the device wrote `written` bytes of it.
                let frame =
                    unsafe { core::slice::from_raw_parts(frame_ptr, written - NET_HDR_LEN) };
                sink(frame);
            }

            // Re-post the same buffer for the next frame.
            // SAFETY: Same pool buffer, still owned by the driver.
            unsafe {
                self.rxq.write_desc(
                    desc_idx,
                    desc.addr,
                    BUF_LEN as u32,
                    VIRTQ_DESC_F_WRITE,
                    VIRTQ_INVALID_NEXT,
                );
            }
            self.rxq.publish(desc_idx);
            drained = true;
        }
        if drained {
            self.rxq.kick();
        }
        Ok(())
    }
}

/// Probe the NIC and hand it to the network stack. Absence is logged and
/// tolerated: the kernel just runs without networking.
pub fn init() -> KernelResult<()> {
    let nic = VirtioNet::init()?;
    crate::net::device::register(Box::new(nic))
}

//! VirtIO console driver.
//!
//! The third consumer of the shared transport, next to the GPU and the
//! NIC. Port 0's receiveq (0) and transmitq (1) carry raw bytes; the
//! kernel uses the device as a host-visible side channel: boot banners
//! and anything pushed through [`write_bytes`] appear on the hypervisor's
//! console socket, and host input can be drained with [`poll_input`].
//!
//! Multiport operation (queues 2+) is not negotiated; port 0 is enough
//! for a log channel.

use spin::Mutex;

use crate::drivers::pci;
use crate::drivers::virtio::{
    VirtioPciDevice, VIRTIO_CONSOLE_ID_MODERN, VIRTIO_CONSOLE_ID_TRANSITIONAL, VIRTIO_VENDOR_ID,
};
use crate::error::{KernelError, KernelResult};
use crate::mm::{pmm::FRAME_ALLOCATOR, PAGE_SIZE};
use crate::sync::GlobalState;

use super::queue::{VirtQueue, VIRTQ_DESC_F_WRITE, VIRTQ_INVALID_NEXT};

/// Receive queue index (port 0).
const RX_QUEUE: u16 = 0;
/// Transmit queue index (port 0).
const TX_QUEUE: u16 = 1;

/// Driver cap on queue sizes.
const QUEUE_MAX: u16 = 64;

/// Per-buffer size for both directions.
const BUF_LEN: usize = 1024;

/// Posted RX buffers.
const RX_POOL: usize = 4;

/// The bound console.
pub struct VirtioConsole {
    rxq: VirtQueue,
    txq: VirtQueue,
    tx_block: u64,
}

// SAFETY: The DMA blocks are PMM allocations owned by this driver; access
// is serialized by the global mutex below.
unsafe impl Send for VirtioConsole {}

impl VirtioConsole {
    fn bring_up() -> KernelResult<Self> {
        let pci_dev = pci::find_device(VIRTIO_VENDOR_ID, VIRTIO_CONSOLE_ID_MODERN)
            .or_else(|| pci::find_device(VIRTIO_VENDOR_ID, VIRTIO_CONSOLE_ID_TRANSITIONAL))
            .ok_or(KernelError::DeviceAbsent {
                device: "virtio-console",
            })?;

        let dev = VirtioPciDevice::bind("virtio-console", pci_dev)?;
        dev.begin_init();
        dev.negotiate_features("virtio-console", 0)?;

        let mut rxq = dev.setup_queue("virtio-console", RX_QUEUE, QUEUE_MAX)?;
        let txq = dev.setup_queue("virtio-console", TX_QUEUE, QUEUE_MAX)?;

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

        for i in 0..RX_POOL {
            let desc = rxq.alloc_desc().ok_or(KernelError::ResourceExhausted {
                resource: "virtio-console rx descriptors",
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
        println!("[VIRTIO] Console up ({} rx buffers)", RX_POOL);

        Ok(Self {
            rxq,
            txq,
            tx_block,
        })
    }

    /// Synchronous write of up to one buffer of bytes.
    fn write(&mut self, bytes: &[u8]) -> KernelResult<()> {
        let len = bytes.len().min(BUF_LEN);
        let tx_virt = self.tx_block as *mut u8;
        // SAFETY: The TX page is owned by this driver; sends are
        // synchronous, so no prior use is still in flight.
        unsafe {
            core::ptr::copy_nonoverlapping(bytes.as_ptr(), tx_virt, len);
        }

        let desc = self
            .txq
            .alloc_desc()
            .ok_or(KernelError::ResourceExhausted {
                resource: "virtio-console tx descriptors",
            })?;
        // SAFETY: TX block valid for the duration of the synchronous send.
        unsafe {
            self.txq
                .write_desc(desc, self.tx_block, len as u32, 0, VIRTQ_INVALID_NEXT);
        }
        self.txq.publish(desc);
        self.txq.kick();

        let result = self.txq.wait_used("virtio-console transmit");
        self.txq.free_chain(desc);
        result.map(|_| ())
    }

    /// Drain host input into `sink`, re-posting each buffer.
    fn drain(&mut self, sink: &mut dyn FnMut(&[u8])) {
        let mut drained = false;
        while let Some((desc_idx, written)) = self.rxq.poll_used() {
            let desc = self.rxq.desc(desc_idx);
            let written = (written as usize).min(BUF_LEN);
            if written > 0 {
                // SAFETY: The descriptor's buffer lies in the RX pool; the
                // device wrote `written` bytes of it.
                let data =
                    unsafe { core::slice::from_raw_parts(desc.addr as *const u8, written) };
                sink(data);
            }
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
    }
}

static CONSOLE: GlobalState<Mutex<VirtioConsole>> = GlobalState::new();

/// Probe and bring up the console. Absence is the normal case outside a
/// hypervisor with a console device attached.
pub fn init() -> KernelResult<()> {
    let console = VirtioConsole::bring_up()?;
    CONSOLE
        .init(Mutex::new(console))
        .map_err(|_| KernelError::AlreadyExists {
            resource: "virtio console",
            id: 0,
        })
}

/// Whether a console was bound.
pub fn is_available() -> bool {
    CONSOLE.is_initialized()
}

/// Write bytes to the host console.
pub fn write_bytes(bytes: &[u8]) -> KernelResult<()> {
    CONSOLE
        .with(|c| c.lock().write(bytes))
        .unwrap_or(Err(KernelError::DeviceAbsent {
            device: "virtio-console",
        }))
}

/// Write a string to the host console.
pub fn write_str(s: &str) -> KernelResult<()> {
    write_bytes(s.as_bytes())
}

/// Drain pending host input into `sink`.
pub fn poll_input(sink: &mut dyn FnMut(&[u8])) {
    let _ = CONSOLE.with(|c| c.lock().drain(sink));
}

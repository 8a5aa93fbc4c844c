//! VirtIO GPU driver (2D path).
//!
//! Drives a virtio-gpu PCI device through the modern transport: one
//! control virtqueue carrying command/response pairs. The 2D contract the
//! compositor relies on:
//!
//! 1. `RESOURCE_CREATE_2D` -- host-side surface of the backbuffer's size
//! 2. `RESOURCE_ATTACH_BACKING` -- the backbuffer's physical pages become
//!    the surface's backing store
//! 3. `SET_SCANOUT` -- bind the surface to display 0
//! 4. per flip: `TRANSFER_TO_HOST_2D` + `RESOURCE_FLUSH`
//!
//! Commands are staged in a physically contiguous block sized for the
//! worst case (an attach-backing with one entry per backbuffer page);
//! responses land in their own page, marked device-writable.

use crate::drivers::pci;
use crate::drivers::virtio::{VirtioPciDevice, VIRTIO_GPU_ID, VIRTIO_VENDOR_ID};
use crate::error::{KernelError, KernelResult};
use crate::mm::{pmm::FRAME_ALLOCATOR, PAGE_SIZE};

use super::queue::{VirtQueue, VIRTQ_DESC_F_NEXT, VIRTQ_DESC_F_WRITE, VIRTQ_INVALID_NEXT};

// --- Command types ---

const VIRTIO_GPU_CMD_GET_DISPLAY_INFO: u32 = 0x100;
const VIRTIO_GPU_CMD_RESOURCE_CREATE_2D: u32 = 0x101;
const VIRTIO_GPU_CMD_RESOURCE_UNREF: u32 = 0x102;
const VIRTIO_GPU_CMD_SET_SCANOUT: u32 = 0x103;
const VIRTIO_GPU_CMD_RESOURCE_FLUSH: u32 = 0x104;
const VIRTIO_GPU_CMD_TRANSFER_TO_HOST_2D: u32 = 0x105;
const VIRTIO_GPU_CMD_RESOURCE_ATTACH_BACKING: u32 = 0x106;
const VIRTIO_GPU_CMD_RESOURCE_DETACH_BACKING: u32 = 0x107;

// --- Response types ---

const VIRTIO_GPU_RESP_OK_NODATA: u32 = 0x1100;
const VIRTIO_GPU_RESP_OK_DISPLAY_INFO: u32 = 0x1101;
const VIRTIO_GPU_RESP_ERR_BASE: u32 = 0x1200;

/// B8G8R8A8: matches the compositor's ARGB8888 little-endian pixels.
const FORMAT_B8G8R8A8_UNORM: u32 = 1;

const VIRTIO_GPU_MAX_SCANOUTS: usize = 16;

/// Pages in the contiguous command staging block. 8 pages hold an
/// attach-backing for a 1280x1024x32 backbuffer (1280 entries).
const CMD_BLOCK_PAGES: usize = 8;

/// Control queue index.
const CONTROL_QUEUE: u16 = 0;

/// Driver cap on the control queue size.
const CONTROL_QUEUE_MAX: u16 = 64;

/// Common header prefixing every command and response.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct CtrlHeader {
    hdr_type: u32,
    flags: u32,
    fence_id: u64,
    ctx_id: u32,
    ring_idx: u8,
    padding: [u8; 3],
}

impl CtrlHeader {
    fn new(hdr_type: u32) -> Self {
        Self {
            hdr_type,
            flags: 0,
            fence_id: 0,
            ctx_id: 0,
            ring_idx: 0,
            padding: [0; 3],
        }
    }
}

/// Rectangle in GPU coordinates.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct GpuRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct DisplayOne {
    rect: GpuRect,
    enabled: u32,
    flags: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct RespDisplayInfo {
    hdr: CtrlHeader,
    pmodes: [DisplayOne; VIRTIO_GPU_MAX_SCANOUTS],
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct ResourceCreate2d {
    hdr: CtrlHeader,
    resource_id: u32,
    format: u32,
    width: u32,
    height: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct ResourceUnref {
    hdr: CtrlHeader,
    resource_id: u32,
    padding: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct SetScanout {
    hdr: CtrlHeader,
    rect: GpuRect,
    scanout_id: u32,
    resource_id: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct ResourceFlush {
    hdr: CtrlHeader,
    rect: GpuRect,
    resource_id: u32,
    padding: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct TransferToHost2d {
    hdr: CtrlHeader,
    rect: GpuRect,
    offset: u64,
    resource_id: u32,
    padding: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct AttachBackingHeader {
    hdr: CtrlHeader,
    resource_id: u32,
    nr_entries: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct MemEntry {
    addr: u64,
    length: u32,
    padding: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct DetachBacking {
    hdr: CtrlHeader,
    resource_id: u32,
    padding: u32,
}

/// Classify a response type word.
fn response_ok(resp_type: u32) -> bool {
    (VIRTIO_GPU_RESP_OK_NODATA..VIRTIO_GPU_RESP_ERR_BASE).contains(&resp_type)
}

/// The bound GPU.
pub struct VirtioGpu {
    dev: VirtioPciDevice,
    controlq: VirtQueue,
    cmd_phys: u64,
    cmd_virt: *mut u8,
    cmd_len: usize,
    resp_phys: u64,
    resp_virt: *mut u8,
    next_resource_id: u32,
    /// Resource currently scanned out (0 = none).
    scanout_resource: u32,
    pub width: u32,
    pub height: u32,
}

// SAFETY: Raw pointers reference PMM blocks owned exclusively by this
// driver; access is serialized by the mutex around the registered backend.
unsafe impl Send for VirtioGpu {}

impl VirtioGpu {
    /// Probe and bring up the device. `Err(DeviceAbsent)` is the normal
    /// outcome on machines without a virtio-gpu; callers fall back to the
    /// software flip path.
    pub fn init() -> KernelResult<Self> {
        let pci_dev = pci::find_device(VIRTIO_VENDOR_ID, VIRTIO_GPU_ID)
            .ok_or(KernelError::DeviceAbsent { device: "virtio-gpu" })?;

        let dev = VirtioPciDevice::bind("virtio-gpu", pci_dev)?;
        dev.begin_init();
        // 2D only: no optional features beyond the mandatory VERSION_1.
        dev.negotiate_features("virtio-gpu", 0)?;
        let controlq = dev.setup_queue("virtio-gpu", CONTROL_QUEUE, CONTROL_QUEUE_MAX)?;

        let cmd_frame = FRAME_ALLOCATOR
            .lock()
            .alloc_pages(CMD_BLOCK_PAGES)
            .ok_or(KernelError::OutOfMemory {
                requested: CMD_BLOCK_PAGES * PAGE_SIZE,
                available: 0,
            })?;
        let resp_frame = FRAME_ALLOCATOR
            .lock()
            .alloc_page()
            .ok_or(KernelError::OutOfMemory {
                requested: PAGE_SIZE,
                available: 0,
            })?;

        dev.set_driver_ok();

        let mut gpu = Self {
            dev,
            controlq,
            cmd_phys: cmd_frame.as_u64(),
            cmd_virt: cmd_frame.as_u64() as *mut u8,
            cmd_len: CMD_BLOCK_PAGES * PAGE_SIZE,
            resp_phys: resp_frame.as_u64(),
            resp_virt: resp_frame.as_u64() as *mut u8,
            next_resource_id: 1,
            scanout_resource: 0,
            width: 0,
            height: 0,
        };

        match gpu.query_display_info() {
            Ok((w, h)) => {
                gpu.width = w;
                gpu.height = h;
                println!("[GPU] virtio-gpu display {}x{}", w, h);
            }
            Err(e) => println!("[GPU] virtio-gpu display query failed: {}", e),
        }
        Ok(gpu)
    }

    /// Stage `cmd_len` already-written command bytes, run the two-descriptor
    /// chain, and return the response type word.
    fn submit_staged(&mut self, cmd_len: usize, resp_len: usize) -> KernelResult<u32> {
        debug_assert!(cmd_len <= self.cmd_len);
        debug_assert!(resp_len <= PAGE_SIZE);

        let head = self
            .controlq
            .alloc_desc()
            .ok_or(KernelError::ResourceExhausted {
                resource: "virtio-gpu descriptors",
            })?;
        let resp_desc = match self.controlq.alloc_desc() {
            Some(d) => d,
            None => {
                self.controlq.free_desc(head);
                return Err(KernelError::ResourceExhausted {
                    resource: "virtio-gpu descriptors",
                });
            }
        };

        // SAFETY: cmd/resp blocks are PMM allocations owned by this driver
        // and stay valid until the device completes the chain.
        unsafe {
            self.controlq.write_desc(
                head,
                self.cmd_phys,
                cmd_len as u32,
                VIRTQ_DESC_F_NEXT,
                resp_desc,
            );
            self.controlq.write_desc(
                resp_desc,
                self.resp_phys,
                resp_len as u32,
                VIRTQ_DESC_F_WRITE,
                VIRTQ_INVALID_NEXT,
            );
        }

        self.controlq.publish(head);
        self.controlq.kick();

        match self.controlq.wait_used("virtio-gpu command") {
            Ok(_) => {}
            Err(e) => {
                // Timed out: reclaim the chain, report failure.
                self.controlq.free_chain(head);
                return Err(e);
            }
        }
        self.controlq.free_chain(head);

        // SAFETY: The device just wrote the response header.
        let resp_type = unsafe { core::ptr::read_volatile(self.resp_virt as *const u32) };
        if !response_ok(resp_type) {
            return Err(KernelError::HardwareError {
                device: "virtio-gpu",
                code: resp_type,
            });
        }
        Ok(resp_type)
    }

    /// Copy a command struct into the staging block and submit it.
    fn submit<T: Copy>(&mut self, cmd: &T, resp_len: usize) -> KernelResult<u32> {
        let len = core::mem::size_of::<T>();
        debug_assert!(len <= self.cmd_len);
        // SAFETY: Staging block is at least `len` bytes (asserted).
        unsafe {
            core::ptr::copy_nonoverlapping(cmd as *const T as *const u8, self.cmd_virt, len);
        }
        self.submit_staged(len, resp_len)
    }

    /// Ask the device for the first enabled scanout's mode.
    pub fn query_display_info(&mut self) -> KernelResult<(u32, u32)> {
        let cmd = CtrlHeader::new(VIRTIO_GPU_CMD_GET_DISPLAY_INFO);
        let resp_type = self.submit(&cmd, core::mem::size_of::<RespDisplayInfo>())?;
        if resp_type != VIRTIO_GPU_RESP_OK_DISPLAY_INFO {
            return Err(KernelError::HardwareError {
                device: "virtio-gpu",
                code: resp_type,
            });
        }
        // SAFETY: The device wrote a full RespDisplayInfo on success.
        let info = unsafe { core::ptr::read_volatile(self.resp_virt as *const RespDisplayInfo) };
        for mode in info.pmodes.iter() {
            if mode.enabled != 0 {
                return Ok((mode.rect.width, mode.rect.height));
            }
        }
        Err(KernelError::DeviceAbsent {
            device: "virtio-gpu scanout",
        })
    }

    /// Create a host resource of the given size.
    pub fn create_resource(&mut self, width: u32, height: u32) -> KernelResult<u32> {
        let resource_id = self.next_resource_id;
        self.next_resource_id += 1;
        let cmd = ResourceCreate2d {
            hdr: CtrlHeader::new(VIRTIO_GPU_CMD_RESOURCE_CREATE_2D),
            resource_id,
            format: FORMAT_B8G8R8A8_UNORM,
            width,
            height,
        };
        self.submit(&cmd, core::mem::size_of::<CtrlHeader>())?;
        Ok(resource_id)
    }

    /// Attach guest pages as the resource's backing store.
    pub fn attach_backing(
        &mut self,
        resource_id: u32,
        entries: &[(u64, u32)],
    ) -> KernelResult<()> {
        let header_len = core::mem::size_of::<AttachBackingHeader>();
        let total = header_len + entries.len() * core::mem::size_of::<MemEntry>();
        if total > self.cmd_len {
            return Err(KernelError::InvalidArgument {
                name: "backing_entries",
                value: "exceed the command staging block",
            });
        }

        let header = AttachBackingHeader {
            hdr: CtrlHeader::new(VIRTIO_GPU_CMD_RESOURCE_ATTACH_BACKING),
            resource_id,
            nr_entries: entries.len() as u32,
        };
        // SAFETY: Bounds checked against the staging block above.
        unsafe {
            core::ptr::copy_nonoverlapping(
                &header as *const AttachBackingHeader as *const u8,
                self.cmd_virt,
                header_len,
            );
            let mut cursor = self.cmd_virt.add(header_len) as *mut MemEntry;
            for &(addr, length) in entries {
                cursor.write_unaligned(MemEntry {
                    addr,
                    length,
                    padding: 0,
                });
                cursor = cursor.add(1);
            }
        }
        self.submit_staged(total, core::mem::size_of::<CtrlHeader>())?;
        Ok(())
    }

    /// Bind a resource to scanout 0.
    pub fn set_scanout(&mut self, resource_id: u32, width: u32, height: u32) -> KernelResult<()> {
        let cmd = SetScanout {
            hdr: CtrlHeader::new(VIRTIO_GPU_CMD_SET_SCANOUT),
            rect: GpuRect {
                x: 0,
                y: 0,
                width,
                height,
            },
            scanout_id: 0,
            resource_id,
        };
        self.submit(&cmd, core::mem::size_of::<CtrlHeader>())?;
        self.scanout_resource = resource_id;
        Ok(())
    }

    /// Copy a backbuffer rectangle into the host resource.
    pub fn transfer_to_host(&mut self, rect: GpuRect, offset: u64) -> KernelResult<()> {
        let cmd = TransferToHost2d {
            hdr: CtrlHeader::new(VIRTIO_GPU_CMD_TRANSFER_TO_HOST_2D),
            rect,
            offset,
            resource_id: self.scanout_resource,
            padding: 0,
        };
        self.submit(&cmd, core::mem::size_of::<CtrlHeader>())?;
        Ok(())
    }

    /// Present a resource rectangle on the display.
    pub fn flush(&mut self, rect: GpuRect) -> KernelResult<()> {
        let cmd = ResourceFlush {
            hdr: CtrlHeader::new(VIRTIO_GPU_CMD_RESOURCE_FLUSH),
            rect,
            resource_id: self.scanout_resource,
            padding: 0,
        };
        self.submit(&cmd, core::mem::size_of::<CtrlHeader>())?;
        Ok(())
    }

    /// Drop the current scanout resource (resize path).
    pub fn release_scanout(&mut self) -> KernelResult<()> {
        if self.scanout_resource == 0 {
            return Ok(());
        }
        let resource_id = self.scanout_resource;
        let detach = DetachBacking {
            hdr: CtrlHeader::new(VIRTIO_GPU_CMD_RESOURCE_DETACH_BACKING),
            resource_id,
            padding: 0,
        };
        self.submit(&detach, core::mem::size_of::<CtrlHeader>())?;
        let unref = ResourceUnref {
            hdr: CtrlHeader::new(VIRTIO_GPU_CMD_RESOURCE_UNREF),
            resource_id,
            padding: 0,
        };
        self.submit(&unref, core::mem::size_of::<CtrlHeader>())?;
        self.scanout_resource = 0;
        Ok(())
    }

    /// ISR read for the polling path (clears the interrupt line).
    pub fn ack_interrupt(&self) -> u8 {
        self.dev.read_isr()
    }

    /// Full scanout pipeline for a freshly bound backbuffer.
    pub fn bind_scanout(
        &mut self,
        width: u32,
        height: u32,
        backing: &[(u64, u32)],
    ) -> KernelResult<()> {
        self.release_scanout()?;
        let resource = self.create_resource(width, height)?;
        self.attach_backing(resource, backing)?;
        self.set_scanout(resource, width, height)?;
        self.width = width;
        self.height = height;
        Ok(())
    }
}

/// Back-of-queue helper shared with tests and the transport: how many
/// attach-backing entries fit the staging block.
pub fn max_backing_entries() -> usize {
    (CMD_BLOCK_PAGES * PAGE_SIZE - core::mem::size_of::<AttachBackingHeader>())
        / core::mem::size_of::<MemEntry>()
}

/// HAL adapter: the compositor drives the GPU through this.
pub struct VirtioGpuBackend {
    gpu: VirtioGpu,
}

impl crate::graphics::gpu::GpuBackend for VirtioGpuBackend {
    fn name(&self) -> &'static str {
        "virtio-gpu"
    }

    fn priority(&self) -> u8 {
        10
    }

    fn configure(
        &mut self,
        width: u32,
        height: u32,
        backing: &[(u64, u32)],
    ) -> KernelResult<()> {
        self.gpu.bind_scanout(width, height, backing)
    }

    fn present(&mut self, rect: crate::graphics::Rect) -> KernelResult<()> {
        let gpu_rect = GpuRect {
            x: rect.x,
            y: rect.y,
            width: rect.width,
            height: rect.height,
        };
        // Byte offset of the rectangle's first pixel within the resource.
        let offset = (rect.y as u64 * self.gpu.width as u64 + rect.x as u64) * 4;
        self.gpu.transfer_to_host(gpu_rect, offset)?;
        self.gpu.flush(gpu_rect)
    }

    fn sync(&mut self) -> KernelResult<()> {
        // Command submission is synchronous; nothing can still be pending.
        Ok(())
    }
}

/// Probe the GPU and register it with the HAL. Absence is tolerated; the
/// compositor falls back to the software flip path.
pub fn register_backend() -> KernelResult<()> {
    let gpu = VirtioGpu::init()?;
    crate::graphics::gpu::register_backend(alloc::boxed::Box::new(VirtioGpuBackend { gpu }))
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn test_wire_struct_sizes() {
        // Sizes fixed by the virtio-gpu protocol.
        assert_eq!(core::mem::size_of::<CtrlHeader>(), 24);
        assert_eq!(core::mem::size_of::<GpuRect>(), 16);
        assert_eq!(core::mem::size_of::<ResourceCreate2d>(), 40);
        assert_eq!(core::mem::size_of::<SetScanout>(), 48);
        assert_eq!(core::mem::size_of::<TransferToHost2d>(), 56);
        assert_eq!(core::mem::size_of::<ResourceFlush>(), 48);
        assert_eq!(core::mem::size_of::<MemEntry>(), 16);
        assert_eq!(
            core::mem::size_of::<RespDisplayInfo>(),
            24 + 16 * core::mem::size_of::<DisplayOne>()
        );
    }

    #[test]
    fn test_response_classification() {
        assert!(response_ok(VIRTIO_GPU_RESP_OK_NODATA));
        assert!(response_ok(VIRTIO_GPU_RESP_OK_DISPLAY_INFO));
        assert!(!response_ok(VIRTIO_GPU_RESP_ERR_BASE));
        assert!(!response_ok(0x1203));
        assert!(!response_ok(0));
    }

    #[test]
    fn test_staging_block_fits_max_display() {
        // 1280x1024x4 bytes of backbuffer = 1280 pages of backing.
        let pages_needed = (1280 * 1024 * 4usize).div_ceil(PAGE_SIZE);
        assert!(max_backing_entries() >= pages_needed);
    }
}

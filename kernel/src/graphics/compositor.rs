//! Framebuffer compositor.
//!
//! All drawing lands in a heap backbuffer (ARGB8888, pixel `(x, y)` at
//! `y * width + x`); [`Compositor::flip`] transfers it to the mapped MMIO
//! framebuffer, honoring the device pitch. A fixed bitmap of 32x32-pixel
//! tiles (sized for up to 1280x1024) tracks which regions changed between
//! flips so the common case copies only dirty tiles.
//!
//! Frame pacing: on bare metal the flip waits for the VGA vertical
//! retrace (port 0x3DA bit 3, first clear then set); under a hypervisor
//! that does not emulate the retrace (the `vm-pacing` feature) a 3-tick
//! (~30 ms) PIT pacing loop substitutes.
//!
//! The flip path is the only reader of the dirty map and zeroes it after
//! reading; drawing and flipping both run in task context, which is the
//! implicit serialization the map relies on.

use alloc::vec::Vec;

use spin::Mutex;

use crate::arch::x86_64::multiboot::FramebufferInfo;
use crate::error::{KernelError, KernelResult};
use crate::mm::{vmm, PAGE_SIZE};
use crate::sync::GlobalState;

use super::{gpu, Color, Rect};

/// Dirty-tile edge length in pixels.
pub const FB_TILE_SIZE: usize = 32;
/// Largest display the tile map covers.
pub const FB_MAX_WIDTH: usize = 1280;
pub const FB_MAX_HEIGHT: usize = 1024;
/// Tile grid dimensions.
pub const FB_TILE_COLS: usize = FB_MAX_WIDTH / FB_TILE_SIZE;
pub const FB_TILE_ROWS: usize = FB_MAX_HEIGHT / FB_TILE_SIZE;

const TILE_WORDS: usize = FB_TILE_COLS * FB_TILE_ROWS / 64;

/// Ticks between flips when PIT pacing substitutes for VSync.
#[allow(dead_code)] // consulted only by the bare-metal pacing path
const VM_PACE_TICKS: u64 = 3;

/// The tile dirty map.
#[derive(Debug, Clone, Copy)]
pub struct TileMap {
    bits: [u64; TILE_WORDS],
    enabled: bool,
}

impl TileMap {
    pub const fn new() -> Self {
        Self {
            bits: [0; TILE_WORDS],
            enabled: false,
        }
    }

    /// Turn tracking on; everything starts dirty so the first flip is a
    /// full redraw.
    pub fn enable(&mut self) {
        self.enabled = true;
        self.mark_all();
    }

    pub fn disable(&mut self) {
        self.enabled = false;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    #[inline]
    fn index(col: usize, row: usize) -> (usize, u64) {
        let bit = row * FB_TILE_COLS + col;
        (bit / 64, 1u64 << (bit % 64))
    }

    /// Mark every tile intersecting the pixel rectangle.
    pub fn mark_rect(&mut self, x: u32, y: u32, width: u32, height: u32) {
        if !self.enabled || width == 0 || height == 0 {
            return;
        }
        let col0 = x as usize / FB_TILE_SIZE;
        let row0 = y as usize / FB_TILE_SIZE;
        let col1 = ((x + width - 1) as usize / FB_TILE_SIZE).min(FB_TILE_COLS - 1);
        let row1 = ((y + height - 1) as usize / FB_TILE_SIZE).min(FB_TILE_ROWS - 1);
        for row in row0.min(FB_TILE_ROWS - 1)..=row1 {
            for col in col0.min(FB_TILE_COLS - 1)..=col1 {
                let (word, mask) = Self::index(col, row);
                self.bits[word] |= mask;
            }
        }
    }

    pub fn mark_all(&mut self) {
        self.bits = [u64::MAX; TILE_WORDS];
    }

    pub fn clear_all(&mut self) {
        self.bits = [0; TILE_WORDS];
    }

    pub fn is_dirty(&self, col: usize, row: usize) -> bool {
        let (word, mask) = Self::index(col, row);
        self.bits[word] & mask != 0
    }

    pub fn has_dirty(&self) -> bool {
        self.bits.iter().any(|&w| w != 0)
    }

    /// Number of dirty tiles (diagnostics).
    pub fn dirty_count(&self) -> usize {
        self.bits.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Bounding rectangle of the dirty tiles, in pixels, clipped to the
    /// given mode.
    pub fn dirty_bounds(&self, width: u32, height: u32) -> Option<Rect> {
        let mut min_col = usize::MAX;
        let mut min_row = usize::MAX;
        let mut max_col = 0usize;
        let mut max_row = 0usize;
        let mut any = false;
        for row in 0..FB_TILE_ROWS {
            for col in 0..FB_TILE_COLS {
                if self.is_dirty(col, row) {
                    any = true;
                    min_col = min_col.min(col);
                    min_row = min_row.min(row);
                    max_col = max_col.max(col);
                    max_row = max_row.max(row);
                }
            }
        }
        if !any {
            return None;
        }
        let x = (min_col * FB_TILE_SIZE) as u32;
        let y = (min_row * FB_TILE_SIZE) as u32;
        let w = (((max_col + 1) * FB_TILE_SIZE) as u32).min(width) - x.min(width);
        let h = (((max_row + 1) * FB_TILE_SIZE) as u32).min(height) - y.min(height);
        Some(Rect::new(x.min(width), y.min(height), w, h))
    }
}

impl Default for TileMap {
    fn default() -> Self {
        Self::new()
    }
}

/// Compositor state: MMIO target, backbuffer, mode, dirty map.
pub struct Compositor {
    mmio: *mut u8,
    phys_addr: u64,
    width: u32,
    height: u32,
    pitch: u32,
    bpp: u8,
    size: usize,
    backbuffer: Vec<u32>,
    tiles: TileMap,
    last_flip_tick: u64,
    initialized: bool,
}

// SAFETY: The MMIO pointer references the mapped framebuffer, which only
// the compositor writes; the struct is always behind the global mutex.
unsafe impl Send for Compositor {}

impl Compositor {
    /// Bind the multiboot framebuffer: map its MMIO region uncached and
    /// allocate a zeroed backbuffer.
    pub fn new(fb: &FramebufferInfo) -> KernelResult<Self> {
        if fb.bpp != 32 {
            return Err(KernelError::InvalidArgument {
                name: "framebuffer",
                value: "only 32 bpp is supported",
            });
        }
        let size = (fb.pitch as usize) * (fb.height as usize);
        let pages = size.div_ceil(PAGE_SIZE);
        vmm::map_range(fb.phys_addr, fb.phys_addr, pages, vmm::MMIO_FLAGS)?;

        let mut compositor = Self {
            mmio: fb.phys_addr as *mut u8,
            phys_addr: fb.phys_addr,
            width: fb.width,
            height: fb.height,
            pitch: fb.pitch,
            bpp: fb.bpp,
            size,
            backbuffer: Vec::new(),
            tiles: TileMap::new(),
            last_flip_tick: 0,
            initialized: false,
        };
        compositor.alloc_backbuffer(fb.width, fb.height)?;

        // SAFETY: The MMIO region was just mapped, `size` bytes long.
        unsafe {
            core::ptr::write_bytes(compositor.mmio, 0, size);
        }
        compositor.initialized = true;
        println!(
            "[FB] Compositor online: {}x{} pitch {} at {:#x}",
            fb.width, fb.height, fb.pitch, fb.phys_addr
        );
        Ok(compositor)
    }

    /// Test/off-metal constructor over caller-provided MMIO memory.
    pub fn with_buffers(mmio: *mut u8, width: u32, height: u32, pitch: u32) -> Self {
        let mut c = Self {
            mmio,
            phys_addr: mmio as u64,
            width,
            height,
            pitch,
            bpp: 32,
            size: (pitch as usize) * (height as usize),
            backbuffer: Vec::new(),
            tiles: TileMap::new(),
            last_flip_tick: 0,
            initialized: true,
        };
        c.alloc_backbuffer(width, height).expect("backbuffer");
        c
    }

    fn alloc_backbuffer(&mut self, width: u32, height: u32) -> KernelResult<()> {
        let pixels = width as usize * height as usize;
        let mut buf = Vec::new();
        if buf.try_reserve_exact(pixels).is_err() {
            return Err(KernelError::OutOfMemory {
                requested: pixels * 4,
                available: 0,
            });
        }
        buf.resize(pixels, 0);
        self.backbuffer = buf;
        Ok(())
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Device scanline stride in bytes.
    pub fn pitch(&self) -> u32 {
        self.pitch
    }

    pub fn bpp(&self) -> u8 {
        self.bpp
    }

    /// Physical address of the MMIO framebuffer.
    pub fn phys_addr(&self) -> u64 {
        self.phys_addr
    }

    /// Size of the MMIO region in bytes.
    pub fn size_bytes(&self) -> usize {
        self.size
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Physical page runs backing the backbuffer, for GPU attach.
    /// Pages are translated individually: heap virtual pages need not be
    /// physically contiguous.
    pub fn backing_pages(&self) -> Vec<(u64, u32)> {
        let mut entries = Vec::new();
        let base = self.backbuffer.as_ptr() as u64;
        let bytes = self.backbuffer.len() * 4;
        let mut offset = 0u64;
        while offset < bytes as u64 {
            let virt = base + offset;
            let page_off = virt % PAGE_SIZE as u64;
            let run = (PAGE_SIZE as u64 - page_off).min(bytes as u64 - offset);
            match vmm::translate(virt) {
                Some(phys) => entries.push((phys, run as u32)),
                None => return Vec::new(),
            }
            offset += run;
        }
        entries
    }

    // ---- Drawing ----

    pub fn put_pixel(&mut self, x: u32, y: u32, color: Color) {
        if x >= self.width || y >= self.height {
            return;
        }
        self.backbuffer[(y * self.width + x) as usize] = color.to_u32();
        self.tiles.mark_rect(x, y, 1, 1);
    }

    /// Fill a rectangle (clipped to the mode).
    pub fn fill_rect(&mut self, x: u32, y: u32, width: u32, height: u32, color: Color) {
        let x1 = (x + width).min(self.width);
        let y1 = (y + height).min(self.height);
        if x >= x1 || y >= y1 {
            return;
        }
        let pixel = color.to_u32();
        for row in y..y1 {
            let start = (row * self.width + x) as usize;
            self.backbuffer[start..start + (x1 - x) as usize].fill(pixel);
        }
        self.tiles.mark_rect(x, y, x1 - x, y1 - y);
    }

    /// One-pixel rectangle outline.
    pub fn draw_rect(&mut self, x: u32, y: u32, width: u32, height: u32, color: Color) {
        if width == 0 || height == 0 {
            return;
        }
        self.fill_rect(x, y, width, 1, color);
        self.fill_rect(x, y + height - 1, width, 1, color);
        self.fill_rect(x, y, 1, height, color);
        self.fill_rect(x + width - 1, y, 1, height, color);
    }

    pub fn clear(&mut self, color: Color) {
        self.backbuffer.fill(color.to_u32());
        if self.tiles.is_enabled() {
            self.tiles.mark_all();
        }
    }

    /// Copy a pixel block into the backbuffer at `(x, y)`, clipped.
    pub fn blit(&mut self, x: u32, y: u32, src: &[u32], src_width: u32, src_height: u32) {
        if src.len() < (src_width as usize) * (src_height as usize) {
            return;
        }
        let copy_w = src_width.min(self.width.saturating_sub(x));
        let copy_h = src_height.min(self.height.saturating_sub(y));
        if copy_w == 0 || copy_h == 0 {
            return;
        }
        for row in 0..copy_h {
            let src_start = (row * src_width) as usize;
            let dst_start = ((y + row) * self.width + x) as usize;
            self.backbuffer[dst_start..dst_start + copy_w as usize]
                .copy_from_slice(&src[src_start..src_start + copy_w as usize]);
        }
        self.tiles.mark_rect(x, y, copy_w, copy_h);
    }

    /// Copy a region within the backbuffer, overlap-safe: descending row
    /// order when the destination is below the source.
    pub fn copy_region(&mut self, src_x: u32, src_y: u32, dst_x: u32, dst_y: u32, width: u32, height: u32) {
        let width = width
            .min(self.width.saturating_sub(src_x))
            .min(self.width.saturating_sub(dst_x));
        let height = height
            .min(self.height.saturating_sub(src_y))
            .min(self.height.saturating_sub(dst_y));
        if width == 0 || height == 0 {
            return;
        }

        let fb_width = self.width;
        let copy_row = move |buf: &mut [u32], row: u32| {
            let src_start = ((src_y + row) * fb_width + src_x) as usize;
            let dst_start = ((dst_y + row) * fb_width + dst_x) as usize;
            buf.copy_within(src_start..src_start + width as usize, dst_start);
        };

        if dst_y <= src_y {
            for row in 0..height {
                copy_row(&mut self.backbuffer, row);
            }
        } else {
            for row in (0..height).rev() {
                copy_row(&mut self.backbuffer, row);
            }
        }
        self.tiles.mark_rect(dst_x, dst_y, width, height);
    }

    // ---- Dirty tracking ----

    pub fn enable_dirty_tracking(&mut self) {
        self.tiles.enable();
    }

    pub fn disable_dirty_tracking(&mut self) {
        self.tiles.disable();
    }

    pub fn mark_all_dirty(&mut self) {
        self.tiles.mark_all();
    }

    pub fn has_dirty(&self) -> bool {
        self.tiles.has_dirty()
    }

    pub fn tile_dirty(&self, col: usize, row: usize) -> bool {
        self.tiles.is_dirty(col, row)
    }

    // ---- Flip ----

    /// Transfer the backbuffer to the display.
    ///
    /// Any pending GPU work is synced first; then either the dirty tiles
    /// or the whole frame are copied to MMIO (pitch-aware); finally the
    /// active GPU backend presents the flipped region.
    pub fn flip(&mut self) {
        let _ = gpu::with_active(|b| b.sync());

        self.pace();

        let present_rect = if self.tiles.is_enabled() {
            let bounds = self.tiles.dirty_bounds(self.width, self.height);
            self.copy_dirty_tiles();
            self.tiles.clear_all();
            bounds
        } else {
            self.copy_full();
            Some(Rect::new(0, 0, self.width, self.height))
        };

        if let Some(rect) = present_rect {
            let _ = gpu::with_active(|b| b.present(rect));
        }
    }

    fn copy_dirty_tiles(&mut self) {
        if self.mmio.is_null() {
            return;
        }
        let max_col = (self.width as usize).div_ceil(FB_TILE_SIZE).min(FB_TILE_COLS);
        let max_row = (self.height as usize).div_ceil(FB_TILE_SIZE).min(FB_TILE_ROWS);
        for row in 0..max_row {
            for col in 0..max_col {
                if self.tiles.is_dirty(col, row) {
                    self.copy_tile(col, row);
                }
            }
        }
    }

    fn copy_tile(&mut self, col: usize, row: usize) {
        let x0 = col * FB_TILE_SIZE;
        let y0 = row * FB_TILE_SIZE;
        let x1 = (x0 + FB_TILE_SIZE).min(self.width as usize);
        let y1 = (y0 + FB_TILE_SIZE).min(self.height as usize);
        if x0 >= x1 || y0 >= y1 {
            return;
        }
        let row_bytes = (x1 - x0) * 4;
        for y in y0..y1 {
            let src = &self.backbuffer[y * self.width as usize + x0];
            // SAFETY: Destination stays inside the mapped MMIO region:
            // y < height and x1 <= width <= pitch/4.
            unsafe {
                let dst = self.mmio.add(y * self.pitch as usize + x0 * 4);
                core::ptr::copy_nonoverlapping(src as *const u32 as *const u8, dst, row_bytes);
            }
        }
    }

    fn copy_full(&mut self) {
        if self.mmio.is_null() {
            return;
        }
        let width_bytes = self.width as usize * 4;
        if self.pitch as usize == width_bytes {
            // SAFETY: Backbuffer and MMIO are both width*height*4 bytes
            // (pitch == width*4).
            unsafe {
                core::ptr::copy_nonoverlapping(
                    self.backbuffer.as_ptr() as *const u8,
                    self.mmio,
                    self.backbuffer.len() * 4,
                );
            }
        } else {
            for y in 0..self.height as usize {
                let src = &self.backbuffer[y * self.width as usize];
                // SAFETY: Row-by-row copy honoring the device pitch; each
                // destination row lies inside the mapped region.
                unsafe {
                    let dst = self.mmio.add(y * self.pitch as usize);
                    core::ptr::copy_nonoverlapping(
                        src as *const u32 as *const u8,
                        dst,
                        width_bytes,
                    );
                }
            }
        }
    }

    /// Frame pacing before the copy: VGA retrace on hardware, a 3-tick
    /// PIT loop under hypervisors that don't emulate the retrace bit.
    fn pace(&mut self) {
        #[cfg(all(target_os = "none", feature = "vm-pacing"))]
        {
            use crate::arch::x86_64::timer;
            let target = self.last_flip_tick + VM_PACE_TICKS;
            while timer::ticks() < target {
                crate::arch::x86_64::idle();
            }
            self.last_flip_tick = timer::ticks();
        }
        #[cfg(all(target_os = "none", not(feature = "vm-pacing")))]
        {
            self.wait_vsync();
            self.last_flip_tick = crate::arch::x86_64::timer::ticks();
        }
    }

    /// Wait for the start of a vertical retrace: bit 3 of VGA input
    /// status register 1 -- wait for it to clear, then to set.
    #[cfg(target_os = "none")]
    fn wait_vsync(&self) {
        const VGA_ISR1: u16 = 0x3DA;
        const RETRACE_BIT: u8 = 1 << 3;
        // Bounded: a hypervisor may never toggle the bit.
        for _ in 0..1_000_000 {
            // SAFETY: Reading the VGA input status register.
            if unsafe { crate::arch::x86_64::inb(VGA_ISR1) } & RETRACE_BIT == 0 {
                break;
            }
            core::hint::spin_loop();
        }
        for _ in 0..1_000_000 {
            // SAFETY: As above.
            if unsafe { crate::arch::x86_64::inb(VGA_ISR1) } & RETRACE_BIT != 0 {
                return;
            }
            core::hint::spin_loop();
        }
    }

    // ---- Resize ----

    /// Change the display mode.
    ///
    /// Out-of-range requests fail without touching any state. Backbuffer
    /// allocation failure reverts to the previous dimensions with the old
    /// backbuffer intact (it is only replaced after the new one exists).
    pub fn resize(&mut self, width: u32, height: u32) -> KernelResult<()> {
        if width == 0
            || height == 0
            || width as usize > FB_MAX_WIDTH
            || height as usize > FB_MAX_HEIGHT
        {
            println!("[FB] Resize to {}x{} rejected", width, height);
            return Err(KernelError::InvalidArgument {
                name: "resize",
                value: "dimensions out of range",
            });
        }

        let pixels = width as usize * height as usize;
        let mut new_buf: Vec<u32> = Vec::new();
        if new_buf.try_reserve_exact(pixels).is_err() {
            // Old mode and backbuffer remain untouched.
            println!("[FB] Resize to {}x{} failed: out of memory", width, height);
            return Err(KernelError::OutOfMemory {
                requested: pixels * 4,
                available: 0,
            });
        }
        new_buf.resize(pixels, 0);

        self.backbuffer = new_buf;
        self.width = width;
        self.height = height;
        // The multiboot framebuffer keeps its pitch; a GPU backend takes
        // over scanout at the new size.
        if self.tiles.is_enabled() {
            self.tiles.mark_all();
        }

        let backing = self.backing_pages();
        if !backing.is_empty() {
            let _ = gpu::with_active(|b| b.configure(width, height, &backing));
        }
        Ok(())
    }
}

/// The kernel's compositor instance.
static COMPOSITOR: GlobalState<Mutex<Compositor>> = GlobalState::new();

/// Bring the compositor up on the multiboot framebuffer and hand the
/// backbuffer to the active GPU backend.
pub fn init(fb: &FramebufferInfo) -> KernelResult<()> {
    let mut compositor = Compositor::new(fb)?;
    compositor.enable_dirty_tracking();

    let backing = compositor.backing_pages();
    if !backing.is_empty() {
        if let Some(Err(e)) =
            gpu::with_active(|b| b.configure(compositor.width(), compositor.height(), &backing))
        {
            println!("[FB] GPU backend configure failed: {}; software flip only", e);
        }
    }

    COMPOSITOR
        .init(Mutex::new(compositor))
        .map_err(|_| KernelError::AlreadyExists {
            resource: "compositor",
            id: 0,
        })
}

/// Run `f` against the compositor.
pub fn with_compositor<R>(f: impl FnOnce(&mut Compositor) -> R) -> Option<R> {
    COMPOSITOR.with(|c| f(&mut c.lock()))
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use alloc::vec;

    use super::*;

    const W: u32 = 320;
    const H: u32 = 200;

    fn test_compositor(pitch: u32) -> (Compositor, &'static mut [u8]) {
        let mmio: Vec<u8> = vec![0u8; (pitch * H) as usize];
        let mmio = Vec::leak(mmio);
        let c = Compositor::with_buffers(mmio.as_mut_ptr(), W, H, pitch);
        // The leaked slice aliases the compositor's mmio pointer; tests
        // read it after flips.
        let view = unsafe { core::slice::from_raw_parts_mut(c.mmio, (pitch * H) as usize) };
        (c, view)
    }

    fn mmio_pixel(view: &[u8], pitch: u32, x: u32, y: u32) -> u32 {
        let off = (y * pitch + x * 4) as usize;
        u32::from_le_bytes([view[off], view[off + 1], view[off + 2], view[off + 3]])
    }

    /// §8 scenario 5: fill_rect(40,40,10,10) dirties exactly tile (1,1).
    #[test]
    fn test_fill_rect_dirties_single_tile() {
        let (mut c, _) = test_compositor(W * 4);
        c.enable_dirty_tracking();
        c.flip(); // consume the initial full-redraw marking
        assert!(!c.has_dirty());

        c.fill_rect(40, 40, 10, 10, Color::RED);
        assert!(c.tile_dirty(1, 1));
        assert_eq!(c.tiles.dirty_count(), 1);

        c.flip();
        assert!(!c.has_dirty());
    }

    #[test]
    fn test_rect_spanning_tiles_marks_all_of_them() {
        let (mut c, _) = test_compositor(W * 4);
        c.enable_dirty_tracking();
        c.flip();
        // 30..70 crosses the 32 and 64 tile boundaries in both axes.
        c.fill_rect(30, 30, 40, 40, Color::GREEN);
        for row in 0..=2 {
            for col in 0..=2 {
                assert!(c.tile_dirty(col, row), "tile ({}, {})", col, row);
            }
        }
        assert_eq!(c.tiles.dirty_count(), 9);
    }

    #[test]
    fn test_flip_writes_pixels_through() {
        let (mut c, view) = test_compositor(W * 4);
        c.enable_dirty_tracking();
        c.put_pixel(5, 7, Color::rgb(0x11, 0x22, 0x33));
        c.flip();
        assert_eq!(mmio_pixel(view, W * 4, 5, 7), 0xFF11_2233);
        // Untouched pixels stay zero.
        assert_eq!(mmio_pixel(view, W * 4, 6, 7), 0);
    }

    #[test]
    fn test_flip_honors_device_pitch() {
        let pitch = W * 4 + 64;
        let (mut c, view) = test_compositor(pitch);
        c.disable_dirty_tracking();
        c.fill_rect(0, 0, W, H, Color::WHITE);
        c.flip();
        assert_eq!(mmio_pixel(view, pitch, 0, 0), 0xFFFF_FFFF);
        assert_eq!(mmio_pixel(view, pitch, W - 1, H - 1), 0xFFFF_FFFF);

        // With dirty tracking, tiles land at the same pitched offsets.
        let (mut c2, view2) = test_compositor(pitch);
        c2.enable_dirty_tracking();
        c2.flip();
        c2.fill_rect(33, 65, 4, 4, Color::BLUE);
        c2.flip();
        assert_eq!(mmio_pixel(view2, pitch, 34, 66), Color::BLUE.to_u32());
    }

    #[test]
    fn test_copy_region_overlap_downward() {
        let (mut c, _) = test_compositor(W * 4);
        // Paint rows 0..3 with distinct colors, then shift down by one.
        for row in 0..3 {
            c.fill_rect(0, row, W, 1, Color::rgb(row as u8 + 1, 0, 0));
        }
        c.copy_region(0, 0, 0, 1, W, 3);
        // Row 1 now holds old row 0, row 3 old row 2.
        assert_eq!(c.backbuffer[(1 * W) as usize], Color::rgb(1, 0, 0).to_u32());
        assert_eq!(c.backbuffer[(2 * W) as usize], Color::rgb(2, 0, 0).to_u32());
        assert_eq!(c.backbuffer[(3 * W) as usize], Color::rgb(3, 0, 0).to_u32());
    }

    #[test]
    fn test_copy_region_overlap_upward() {
        let (mut c, _) = test_compositor(W * 4);
        for row in 1..4 {
            c.fill_rect(0, row, W, 1, Color::rgb(row as u8, 0, 0));
        }
        c.copy_region(0, 1, 0, 0, W, 3);
        assert_eq!(c.backbuffer[0], Color::rgb(1, 0, 0).to_u32());
        assert_eq!(c.backbuffer[(1 * W) as usize], Color::rgb(2, 0, 0).to_u32());
        assert_eq!(c.backbuffer[(2 * W) as usize], Color::rgb(3, 0, 0).to_u32());
    }

    #[test]
    fn test_drawing_clips_to_mode() {
        let (mut c, _) = test_compositor(W * 4);
        c.put_pixel(W, 0, Color::RED); // off-screen: no effect, no panic
        c.fill_rect(W - 2, H - 2, 10, 10, Color::RED);
        assert_eq!(
            c.backbuffer[((H - 1) * W + (W - 1)) as usize],
            Color::RED.to_u32()
        );
    }

    #[test]
    fn test_resize_rejects_out_of_range() {
        let (mut c, _) = test_compositor(W * 4);
        let before = (c.width(), c.height());
        assert!(c.resize(0, 100).is_err());
        assert!(c.resize(FB_MAX_WIDTH as u32 + 1, 100).is_err());
        assert_eq!((c.width(), c.height()), before);
    }

    #[test]
    fn test_resize_resets_dirty_map() {
        let (mut c, _) = test_compositor(W * 4);
        c.enable_dirty_tracking();
        c.flip();
        assert!(!c.has_dirty());
        c.resize(160, 100).unwrap();
        assert!(c.has_dirty(), "resize must force a full redraw");
        assert_eq!(c.backbuffer.len(), 160 * 100);
    }

    #[test]
    fn test_clear_marks_everything() {
        let (mut c, _) = test_compositor(W * 4);
        c.enable_dirty_tracking();
        c.flip();
        c.clear(Color::BLACK);
        assert!(c.has_dirty());
        assert_eq!(c.backbuffer[0], Color::BLACK.to_u32());
    }

    #[test]
    fn test_blit_copies_and_marks() {
        let (mut c, _) = test_compositor(W * 4);
        c.enable_dirty_tracking();
        c.flip();
        let sprite = vec![Color::GREEN.to_u32(); 16];
        c.blit(100, 100, &sprite, 4, 4);
        assert_eq!(
            c.backbuffer[(101 * W + 102) as usize],
            Color::GREEN.to_u32()
        );
        assert!(c.tile_dirty(3, 3)); // 100/32 == 3
    }
}

//! Borealis kernel entry point.
//!
//! The multiboot2 trampoline in `arch::x86_64::boot` lands in
//! [`kernel_main`] with the loader's magic and info pointer. Bring-up
//! order follows the dependency chain: descriptor tables and the PIC,
//! then memory (PMM, VMM, heap), then time, then the scheduler, then
//! buses and devices, and finally the kernel tasks. The tail of
//! `kernel_main` becomes the idle task.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(target_os = "none")]
use borealis_kernel::{
    arch::{
        self,
        x86_64::{multiboot, pvclock, timer},
    },
    drivers, graphics,
    graphics::{compositor, Color},
    klog::{klog, LogLevel},
    mm, net, println, sched,
};

#[cfg(target_os = "none")]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    println!("[KERNEL PANIC] {}", info);
    borealis_kernel::arch::x86_64::halt();
}

/// Kernel-mode task: animate a bouncing rectangle and the mouse cursor,
/// flipping dirty tiles each frame.
#[cfg(target_os = "none")]
extern "C" fn render_task(_arg: usize) {
    let mut x: i32 = 40;
    let mut y: i32 = 40;
    let mut dx: i32 = 2;
    let mut dy: i32 = 2;
    const SIZE: u32 = 48;

    loop {
        compositor::with_compositor(|c| {
            let (w, h) = (c.width() as i32, c.height() as i32);
            x += dx;
            y += dy;
            if x <= 0 || x + SIZE as i32 >= w {
                dx = -dx;
                x = x.clamp(0, w - SIZE as i32);
            }
            if y <= 0 || y + SIZE as i32 >= h {
                dy = -dy;
                y = y.clamp(0, h - SIZE as i32);
            }

            c.clear(Color::rgb(16, 24, 40));
            c.fill_rect(x as u32, y as u32, SIZE, SIZE, Color::rgb(220, 120, 32));
            c.draw_rect(x as u32, y as u32, SIZE, SIZE, Color::WHITE);

            let mouse = drivers::mouse::get_state();
            c.fill_rect(mouse.x as u32, mouse.y as u32, 8, 8, Color::WHITE);

            c.flip();
        });
        sched::yield_now();
    }
}

/// Kernel-mode task: drain the NIC, answer ARP/ICMP, and ping the
/// gateway periodically.
#[cfg(target_os = "none")]
extern "C" fn net_task(_arg: usize) {
    let mut seq: u16 = 0;
    let mut next_ping_tick = timer::ticks() + 300;
    loop {
        net::poll();

        if let Some(rtt) = net::icmp::ping_check() {
            klog(LogLevel::Info, "net", "gateway ping completed");
            let _ = rtt;
        }

        if timer::ticks() >= next_ping_tick {
            next_ping_tick = timer::ticks() + 500;
            seq = seq.wrapping_add(1);
            if let Err(e) = net::icmp::ping_gateway(seq) {
                println!("[NET] Ping failed: {}", e);
            }
        }
        sched::yield_now();
    }
}

#[cfg(target_os = "none")]
#[no_mangle]
pub extern "C" fn kernel_main(magic: u32, info_addr: u32) -> ! {
    println!(
        "Borealis v{} booting (multiboot2 info at {:#x})",
        env!("CARGO_PKG_VERSION"),
        info_addr
    );

    if magic != multiboot::MULTIBOOT2_BOOTLOADER_MAGIC {
        panic!("Invalid multiboot2 magic: {:#x}", magic);
    }

    // SAFETY: The loader passed this pointer in EBX; the structure is
    // complete and below 4 GiB per the multiboot2 contract.
    let boot_info = match unsafe { multiboot::parse(info_addr as usize) } {
        Ok(info) => info,
        Err(e) => panic!("Unparseable multiboot2 info: {}", e),
    };

    arch::x86_64::init();

    if let Err(e) = mm::init(&boot_info) {
        panic!("Memory initialization failed: {}", e);
    }

    timer::init();
    pvclock::init();

    sched::init();

    if let Err(e) = drivers::pci::init() {
        println!("[PCI] Scan failed: {}", e);
    }

    // Display backends, best first; a machine with neither still runs on
    // the software flip path.
    graphics::gpu::init();
    match drivers::virtio::gpu::register_backend() {
        Ok(()) => {}
        Err(e) => println!("[GPU] virtio-gpu unavailable: {}", e),
    }
    match drivers::svga::register_backend() {
        Ok(()) => {}
        Err(e) => println!("[GPU] SVGA II unavailable: {}", e),
    }

    let mut screen = (1024u32, 768u32);
    match boot_info.framebuffer {
        Some(fb) => {
            screen = (fb.width, fb.height);
            if let Err(e) = compositor::init(&fb) {
                println!("[FB] Compositor init failed: {}", e);
            }
        }
        None => println!("[FB] No framebuffer tag; running headless"),
    }

    match drivers::virtio::net::init() {
        Ok(()) => {
            if let Err(e) = net::init() {
                println!("[NET] Stack init failed: {}", e);
            }
        }
        Err(e) => println!("[NET] virtio-net unavailable: {}", e),
    }

    match drivers::virtio::console::init() {
        Ok(()) => {
            let _ = drivers::virtio::console::write_str("Borealis console online\n");
        }
        Err(e) => println!("[VIRTIO] Console unavailable: {}", e),
    }

    if let Err(e) = drivers::keyboard::init() {
        println!("[KBD] Keyboard init failed: {}", e);
    }
    if let Err(e) = drivers::mouse::init(screen.0, screen.1) {
        println!("[MOUSE] Mouse init failed: {}", e);
    }

    if compositor::with_compositor(|_| ()).is_some() {
        if let Err(e) = sched::create("render", render_task, 0) {
            println!("[SCHED] render task: {}", e);
        }
    }
    if net::device::is_registered() {
        if let Err(e) = sched::create("net", net_task, 0) {
            println!("[SCHED] net task: {}", e);
        }
    }

    klog(LogLevel::Info, "boot", "kernel initialization complete");
    println!(
        "[KERNEL] Up: {} display backend, entering idle loop",
        graphics::gpu::active_name().unwrap_or("software")
    );

    // The boot flow is PID 0 from here on.
    sched::run();
}

#[cfg(not(target_os = "none"))]
fn main() {
    // The kernel binary only exists for the bare-metal target; host builds
    // compile it as an empty program so `cargo test` can proceed.
}

//! PS/2 mouse driver.
//!
//! Bring-up talks to the shared 8042 controller: enable the auxiliary
//! port, set bit 1 (IRQ12 enable) and clear bit 5 (aux clock inhibit) in
//! the controller configuration, then SET_DEFAULTS and ENABLE_DATA to the
//! mouse itself, consuming one ACK byte per command.
//!
//! Packets are the 3-byte standard kind. Byte 0 is
//! `[Yov | Xov | Ys | Xs | 1 | M | R | L]`: the always-one bit clear
//! means the stream lost sync and the packet is discarded; overflow bits
//! drop the packet; the sign bits extend the 8-bit deltas. The on-screen
//! Y axis grows downward, so the hardware Y delta is negated.
//!
//! The shared state carries absolute position, buttons, and `moved`/
//! `clicked` edge flags that stay latched until [`get_state`] consumes
//! them.

use spin::Mutex;

use crate::error::KernelResult;

/// Mouse IRQ line (slave PIC).
pub const MOUSE_IRQ: u8 = 12;

const PS2_DATA_PORT: u16 = 0x60;
const PS2_STATUS_PORT: u16 = 0x64;
const PS2_COMMAND_PORT: u16 = 0x64;

// Controller commands
const CMD_ENABLE_AUX: u8 = 0xA8;
const CMD_READ_CONFIG: u8 = 0x20;
const CMD_WRITE_CONFIG: u8 = 0x60;
const CMD_WRITE_AUX: u8 = 0xD4;

// Mouse commands
const MOUSE_SET_DEFAULTS: u8 = 0xF6;
const MOUSE_ENABLE_DATA: u8 = 0xF4;

/// Button bits in packet byte 0 and in [`MouseState::buttons`].
pub const BUTTON_LEFT: u8 = 0x01;
pub const BUTTON_RIGHT: u8 = 0x02;
pub const BUTTON_MIDDLE: u8 = 0x04;

/// Packet byte 0 bits.
const PKT_ALWAYS_ONE: u8 = 0x08;
const PKT_X_SIGN: u8 = 0x10;
const PKT_Y_SIGN: u8 = 0x20;
const PKT_X_OVERFLOW: u8 = 0x40;
const PKT_Y_OVERFLOW: u8 = 0x80;

/// Snapshot handed to consumers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MouseState {
    pub x: i32,
    pub y: i32,
    pub buttons: u8,
    /// Cursor moved since the last `get_state`.
    pub moved: bool,
    /// A button went down since the last `get_state`.
    pub clicked: bool,
}

/// Outcome of decoding one 3-byte packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketOutcome {
    /// Stream out of sync; discard and realign.
    Resync,
    /// Overflow flagged; drop the packet.
    Drop,
    /// A motion/button event.
    Event { dx: i32, dy: i32, buttons: u8 },
}

/// Decode a standard 3-byte packet.
pub fn decode_packet(packet: [u8; 3]) -> PacketOutcome {
    let status = packet[0];
    if status & PKT_ALWAYS_ONE == 0 {
        return PacketOutcome::Resync;
    }
    if status & (PKT_X_OVERFLOW | PKT_Y_OVERFLOW) != 0 {
        return PacketOutcome::Drop;
    }

    let mut dx = packet[1] as i32;
    let mut dy = packet[2] as i32;
    if status & PKT_X_SIGN != 0 {
        dx -= 256;
    }
    if status & PKT_Y_SIGN != 0 {
        dy -= 256;
    }

    PacketOutcome::Event {
        dx,
        // Hardware Y grows upward; the screen grows downward.
        dy: -dy,
        buttons: status & (BUTTON_LEFT | BUTTON_RIGHT | BUTTON_MIDDLE),
    }
}

struct MouseInner {
    state: MouseState,
    packet: [u8; 3],
    packet_idx: usize,
    screen_w: i32,
    screen_h: i32,
    initialized: bool,
}

/// Shared driver state. Locked from the IRQ handler (which runs with
/// interrupts disabled) and from task context; every task-side locker
/// must disable interrupts for the duration, or the handler could spin
/// against its own CPU.
static MOUSE: Mutex<MouseInner> = Mutex::new(MouseInner {
    state: MouseState {
        x: 0,
        y: 0,
        buttons: 0,
        moved: false,
        clicked: false,
    },
    packet: [0; 3],
    packet_idx: 0,
    screen_w: 1024,
    screen_h: 768,
    initialized: false,
});

/// Apply one packet to the shared state.
fn apply_packet(inner: &mut MouseInner, outcome: PacketOutcome) {
    let PacketOutcome::Event { dx, dy, buttons } = outcome else {
        return;
    };
    if dx != 0 || dy != 0 {
        inner.state.x = (inner.state.x + dx).clamp(0, inner.screen_w - 1);
        inner.state.y = (inner.state.y + dy).clamp(0, inner.screen_h - 1);
        inner.state.moved = true;
    }
    // Rising edge on any button latches a click.
    if buttons & !inner.state.buttons != 0 {
        inner.state.clicked = true;
    }
    inner.state.buttons = buttons;
}

/// IRQ12 handler: accumulate bytes; decode on the third.
fn mouse_interrupt(_irq: u8) {
    // SAFETY: Reading the 8042 status and data ports.
    let status = unsafe { crate::arch::x86_64::inb(PS2_STATUS_PORT) };
    // Bit 0: data ready; bit 5: the byte came from the aux device.
    if status & 0x21 != 0x21 {
        return;
    }
    // SAFETY: Data is ready; reading consumes the byte.
    let byte = unsafe { crate::arch::x86_64::inb(PS2_DATA_PORT) };

    let mut inner = MOUSE.lock();
    if !inner.initialized {
        return;
    }

    // Realign on a byte that cannot start a packet.
    if inner.packet_idx == 0 && byte & PKT_ALWAYS_ONE == 0 {
        return;
    }
    let idx = inner.packet_idx;
    inner.packet[idx] = byte;
    inner.packet_idx += 1;

    if inner.packet_idx == 3 {
        inner.packet_idx = 0;
        let outcome = decode_packet(inner.packet);
        apply_packet(&mut inner, outcome);
    }
}

fn wait_input_clear() {
    for _ in 0..10_000 {
        // SAFETY: Status read only.
        if unsafe { crate::arch::x86_64::inb(PS2_STATUS_PORT) } & 0x02 == 0 {
            return;
        }
    }
}

fn wait_output_ready() -> bool {
    for _ in 0..10_000 {
        // SAFETY: Status read only.
        if unsafe { crate::arch::x86_64::inb(PS2_STATUS_PORT) } & 0x01 != 0 {
            return true;
        }
    }
    false
}

/// Send a command byte to the mouse (through the controller).
fn mouse_write(cmd: u8) {
    wait_input_clear();
    // SAFETY: 0xD4 routes the next data byte to the aux device.
    unsafe {
        crate::arch::x86_64::outb(PS2_COMMAND_PORT, CMD_WRITE_AUX);
    }
    wait_input_clear();
    // SAFETY: Data byte for the aux device.
    unsafe {
        crate::arch::x86_64::outb(PS2_DATA_PORT, cmd);
    }
}

/// Read the mouse's response byte (usually an 0xFA ACK).
fn mouse_read() -> Option<u8> {
    if wait_output_ready() {
        // SAFETY: Data is ready.
        Some(unsafe { crate::arch::x86_64::inb(PS2_DATA_PORT) })
    } else {
        None
    }
}

/// Bring up the auxiliary port and start streaming.
pub fn init(screen_w: u32, screen_h: u32) -> KernelResult<()> {
    // Enable the aux port.
    wait_input_clear();
    // SAFETY: Controller command, no data byte.
    unsafe {
        crate::arch::x86_64::outb(PS2_COMMAND_PORT, CMD_ENABLE_AUX);
    }

    // Read-modify-write the controller configuration: enable IRQ12,
    // un-inhibit the aux clock.
    wait_input_clear();
    // SAFETY: Controller command with a response byte.
    unsafe {
        crate::arch::x86_64::outb(PS2_COMMAND_PORT, CMD_READ_CONFIG);
    }
    if let Some(mut config) = mouse_read() {
        config |= 0x02;
        config &= !0x20;
        wait_input_clear();
        // SAFETY: Controller command followed by its data byte.
        unsafe {
            crate::arch::x86_64::outb(PS2_COMMAND_PORT, CMD_WRITE_CONFIG);
        }
        wait_input_clear();
        // SAFETY: As above.
        unsafe {
            crate::arch::x86_64::outb(PS2_DATA_PORT, config);
        }
    }

    mouse_write(MOUSE_SET_DEFAULTS);
    let _ = mouse_read(); // ACK
    mouse_write(MOUSE_ENABLE_DATA);
    let _ = mouse_read(); // ACK

    {
        let mut inner = MOUSE.lock();
        inner.screen_w = screen_w.max(1) as i32;
        inner.screen_h = screen_h.max(1) as i32;
        inner.state.x = inner.screen_w / 2;
        inner.state.y = inner.screen_h / 2;
        inner.initialized = true;
    }

    crate::irq::register_handler(MOUSE_IRQ, mouse_interrupt)?;
    crate::arch::x86_64::pic::enable_irq(MOUSE_IRQ);
    println!("[MOUSE] PS/2 mouse online (IRQ12), bounds {}x{}", screen_w, screen_h);
    Ok(())
}

/// Consume the current state; the edge flags reset once read.
pub fn get_state() -> MouseState {
    crate::arch::x86_64::without_interrupts(|| {
        let mut inner = MOUSE.lock();
        let snapshot = inner.state;
        inner.state.moved = false;
        inner.state.clicked = false;
        snapshot
    })
}

/// Update clamping bounds after a mode change.
pub fn set_screen_bounds(width: u32, height: u32) {
    crate::arch::x86_64::without_interrupts(|| {
        let mut inner = MOUSE.lock();
        inner.screen_w = width.max(1) as i32;
        inner.screen_h = height.max(1) as i32;
        inner.state.x = inner.state.x.clamp(0, inner.screen_w - 1);
        inner.state.y = inner.state.y.clamp(0, inner.screen_h - 1);
    });
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn test_decode_simple_motion() {
        // always-one set, positive deltas, no buttons
        let outcome = decode_packet([PKT_ALWAYS_ONE, 5, 3]);
        assert_eq!(
            outcome,
            PacketOutcome::Event {
                dx: 5,
                dy: -3, // screen Y grows downward
                buttons: 0
            }
        );
    }

    #[test]
    fn test_decode_sign_extension() {
        // X sign set with raw 0xFB = -5; Y sign set with raw 0xFE = -2
        let outcome = decode_packet([PKT_ALWAYS_ONE | PKT_X_SIGN | PKT_Y_SIGN, 0xFB, 0xFE]);
        assert_eq!(
            outcome,
            PacketOutcome::Event {
                dx: -5,
                dy: 2,
                buttons: 0
            }
        );
    }

    #[test]
    fn test_decode_resync_on_missing_marker() {
        assert_eq!(decode_packet([0x00, 10, 10]), PacketOutcome::Resync);
    }

    #[test]
    fn test_decode_overflow_dropped() {
        assert_eq!(
            decode_packet([PKT_ALWAYS_ONE | PKT_X_OVERFLOW, 1, 1]),
            PacketOutcome::Drop
        );
        assert_eq!(
            decode_packet([PKT_ALWAYS_ONE | PKT_Y_OVERFLOW, 1, 1]),
            PacketOutcome::Drop
        );
    }

    #[test]
    fn test_decode_buttons() {
        let outcome = decode_packet([PKT_ALWAYS_ONE | BUTTON_LEFT | BUTTON_RIGHT, 0, 0]);
        assert_eq!(
            outcome,
            PacketOutcome::Event {
                dx: 0,
                dy: 0,
                buttons: BUTTON_LEFT | BUTTON_RIGHT
            }
        );
    }

    #[test]
    fn test_apply_clamps_and_latches_edges() {
        let mut inner = MouseInner {
            state: MouseState {
                x: 10,
                y: 10,
                buttons: 0,
                moved: false,
                clicked: false,
            },
            packet: [0; 3],
            packet_idx: 0,
            screen_w: 100,
            screen_h: 100,
            initialized: true,
        };

        apply_packet(
            &mut inner,
            PacketOutcome::Event {
                dx: -50,
                dy: 0,
                buttons: 0,
            },
        );
        assert_eq!(inner.state.x, 0, "clamped at the left edge");
        assert!(inner.state.moved);

        apply_packet(
            &mut inner,
            PacketOutcome::Event {
                dx: 0,
                dy: 0,
                buttons: BUTTON_LEFT,
            },
        );
        assert!(inner.state.clicked, "rising edge latches a click");

        // Held button (no new press) must not re-latch after consumption.
        inner.state.clicked = false;
        apply_packet(
            &mut inner,
            PacketOutcome::Event {
                dx: 0,
                dy: 0,
                buttons: BUTTON_LEFT,
            },
        );
        assert!(!inner.state.clicked);

        apply_packet(&mut inner, PacketOutcome::Drop);
        apply_packet(&mut inner, PacketOutcome::Resync);
        assert_eq!(inner.state.x, 0, "drops and resyncs change nothing");
    }
}

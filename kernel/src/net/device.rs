//! Network device abstraction.
//!
//! The protocol stack speaks to hardware through [`NetDevice`]; the
//! virtio-net driver is the one real implementation, and tests register a
//! mock that captures transmitted frames.

use alloc::boxed::Box;

use spin::Mutex;

use crate::error::{KernelError, KernelResult, NetError};
use crate::net::MacAddress;
use crate::sync::GlobalState;

/// A device able to move Ethernet frames.
pub trait NetDevice: Send {
    fn mac_address(&self) -> MacAddress;

    /// Transmit one complete Ethernet frame (without any bus-level
    /// header; the driver adds what its transport needs).
    fn transmit(&mut self, frame: &[u8]) -> KernelResult<()>;

    /// Drain received frames into `sink`. Each call to `sink` gets one
    /// complete Ethernet frame.
    fn poll_receive(&mut self, sink: &mut dyn FnMut(&[u8])) -> KernelResult<()>;
}

/// The registered device (single-homed stack).
static DEVICE: GlobalState<Mutex<Box<dyn NetDevice>>> = GlobalState::new();

/// Install the device the stack will use.
pub fn register(device: Box<dyn NetDevice>) -> KernelResult<()> {
    let mac = device.mac_address();
    DEVICE
        .init(Mutex::new(device))
        .map_err(|_| KernelError::AlreadyExists {
            resource: "network device",
            id: 0,
        })?;
    println!(
        "[NET] Device registered, MAC {:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
        mac.0[0], mac.0[1], mac.0[2], mac.0[3], mac.0[4], mac.0[5]
    );
    Ok(())
}

/// Whether a device has been registered.
pub fn is_registered() -> bool {
    DEVICE.is_initialized()
}

/// Run `f` against the device.
pub fn with_device<R>(f: impl FnOnce(&mut dyn NetDevice) -> R) -> KernelResult<R> {
    DEVICE
        .with(|device| f(&mut **device.lock()))
        .ok_or(KernelError::NetError(NetError::NoDevice))
}

/// MAC of the registered device.
pub fn mac_address() -> KernelResult<MacAddress> {
    with_device(|d| d.mac_address())
}

/// Transmit through the registered device.
pub fn transmit(frame: &[u8]) -> KernelResult<()> {
    with_device(|d| d.transmit(frame))?
}

//! Composite USB control plane for the Squid multi-channel probe.
//!
//! The probe enumerates as a single full-speed composite device carrying
//! five logical functions: two CDC-ACM serial channels bridged to
//! hardware UARTs, a third CDC-ACM pair carrying SLCAN frames, a
//! vendor-specific LED control interface, and an application-mode DFU
//! interface used only for the detach handshake into the bootloader.
//!
//! This crate owns descriptor composition, class/vendor control-request
//! routing, the per-channel modem-status machinery and the DFU detach
//! gate. Everything hardware-specific stays outside: the USB driver is
//! any [`embassy_usb::driver::Driver`], the LED is any
//! [`embedded_hal::digital::OutputPin`], and the reboot path is reached
//! through the [`dfu::BootRequest`] and [`dfu::Reset`] traits.
//!
//! ```ignore
//! let mut builder = embassy_usb::Builder::new(
//!     driver,
//!     squid_usb::device::usb_config(serial_number),
//!     static_byte_buffer!(256),
//!     static_byte_buffer!(64),
//!     static_byte_buffer!(256),
//!     static_byte_buffer!(128),
//! );
//!
//! static STATE: StaticCell<device::State<'static, Output<'static>>> = StaticCell::new();
//! let squid = SquidUsb::new(&mut builder, STATE.init_with(device::State::new), led_pin);
//!
//! spawner.must_spawn(usb_task(builder.build()));
//! for notifier in squid.notifiers {
//!     spawner.must_spawn(notify_task(notifier));
//! }
//! spawner.must_spawn(detach_task(squid.dfu));
//! // squid.uart1 / squid.uart2 / squid.can go to the byte-stream bridges.
//! ```

#![no_std]

// This mod MUST go first, so that the others see its macros.
pub(crate) mod fmt;

pub mod channel;
pub mod control;
pub mod device;
pub mod dfu;
pub mod led;

pub use channel::{LineCoding, Notifier, Port, SerialChannel};
pub use device::{ConfigHandle, SquidUsb, State};
pub use dfu::{BootRequest, DetachRequest, DfuDetach, Reset};
pub use led::{LED_OFF, LED_ON};

/// Expands to a `&'static mut [u8; $size]` backed by a `ConstStaticCell`.
///
/// Handy for the descriptor and control buffers the USB builder wants to
/// borrow for the lifetime of the device.
#[macro_export]
macro_rules! static_byte_buffer {
    ($size:expr) => {{
        static BUFFER: ::static_cell::ConstStaticCell<[u8; $size]> =
            ::static_cell::ConstStaticCell::new([0; $size]);
        BUFFER.take()
    }};
}

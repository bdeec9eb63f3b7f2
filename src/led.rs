//! Vendor LED control channel.
//!
//! The host drives the probe's status LED with single-byte vendor
//! requests. Every vendor transfer completes; the outcome is reported
//! in a one-byte status payload that IN transfers carry back to the
//! host.

use embassy_usb::control::{InResponse, OutResponse, Request};
use embedded_hal::digital::OutputPin;

/// Vendor command: drive the LED off.
pub const LED_OFF: u8 = 0;
/// Vendor command: drive the LED on.
pub const LED_ON: u8 = 1;

/// Command executed.
const STATUS_OK: u8 = 0x01;
/// Unknown command, or the pin refused to switch.
const STATUS_FAIL: u8 = 0xFF;

pub(crate) struct LedControl<P: OutputPin> {
    pin: P,
}

impl<P: OutputPin> LedControl<P> {
    pub(crate) fn new(pin: P) -> Self {
        Self { pin }
    }

    /// Executes a vendor command, leaving the pin untouched for unknown
    /// codes, and reports the one-byte status.
    fn execute(&mut self, command: u8) -> u8 {
        match command {
            LED_ON => match self.pin.set_high() {
                Ok(()) => STATUS_OK,
                Err(_) => STATUS_FAIL,
            },
            LED_OFF => match self.pin.set_low() {
                Ok(()) => STATUS_OK,
                Err(_) => STATUS_FAIL,
            },
            _ => {
                debug!("unknown vendor command {}", command);
                STATUS_FAIL
            }
        }
    }

    pub(crate) fn handle_out(&mut self, req: Request) -> OutResponse {
        // The status byte has nowhere to go on an OUT transfer; the
        // transfer itself still completes.
        self.execute(req.request);
        OutResponse::Accepted
    }

    pub(crate) fn handle_in<'a>(&mut self, req: Request, buf: &'a mut [u8]) -> InResponse<'a> {
        buf[0] = self.execute(req.request);
        InResponse::Accepted(&buf[..1])
    }
}

#[cfg(test)]
pub(crate) mod tests {
    extern crate std;

    use core::cell::Cell;
    use core::convert::Infallible;

    use embassy_usb::control::{Recipient, Request, RequestType};
    use embassy_usb::driver::Direction;
    use std::boxed::Box;

    use super::*;

    pub(crate) struct FakeLed {
        state: &'static Cell<bool>,
    }

    impl FakeLed {
        pub(crate) fn new() -> (Self, &'static Cell<bool>) {
            let state: &'static Cell<bool> = Box::leak(Box::new(Cell::new(false)));
            (Self { state }, state)
        }
    }

    impl embedded_hal::digital::ErrorType for FakeLed {
        type Error = Infallible;
    }

    impl OutputPin for FakeLed {
        fn set_low(&mut self) -> Result<(), Infallible> {
            self.state.set(false);
            Ok(())
        }

        fn set_high(&mut self) -> Result<(), Infallible> {
            self.state.set(true);
            Ok(())
        }
    }

    fn vendor_in(command: u8) -> Request {
        Request {
            direction: Direction::In,
            request_type: RequestType::Vendor,
            recipient: Recipient::Device,
            request: command,
            value: 0,
            index: 0,
            length: 1,
        }
    }

    #[test]
    fn test_led_on_sets_pin_and_reports_success() {
        let (led, pin) = FakeLed::new();
        let mut control = LedControl::new(led);
        let mut buf = [0u8; 8];

        let resp = control.handle_in(vendor_in(LED_ON), &mut buf);
        assert_eq!(resp, InResponse::Accepted(&[0x01]));
        assert!(pin.get());
    }

    #[test]
    fn test_led_off_clears_pin_and_reports_success() {
        let (led, pin) = FakeLed::new();
        pin.set(true);
        let mut control = LedControl::new(led);
        let mut buf = [0u8; 8];

        let resp = control.handle_in(vendor_in(LED_OFF), &mut buf);
        assert_eq!(resp, InResponse::Accepted(&[0x01]));
        assert!(!pin.get());
    }

    #[test]
    fn test_unknown_command_reports_failure_without_touching_pin() {
        let (led, pin) = FakeLed::new();
        pin.set(true);
        let mut control = LedControl::new(led);
        let mut buf = [0u8; 8];

        let resp = control.handle_in(vendor_in(0x42), &mut buf);
        assert_eq!(resp, InResponse::Accepted(&[0xFF]));
        assert!(pin.get());
    }

    #[test]
    fn test_out_transfer_always_completes() {
        let (led, _pin) = FakeLed::new();
        let mut control = LedControl::new(led);

        let mut req = vendor_in(0x42);
        req.direction = Direction::Out;
        req.length = 0;
        assert_eq!(control.handle_out(req), OutResponse::Accepted);
    }
}

//! Application-mode DFU: status reporting and the detach gate.
//!
//! Only the run-time half of DFU lives here. The device advertises
//! download capability and answers status polls, but the actual
//! download state machine belongs to the bootloader image the probe
//! reboots into. A valid DETACH arms a one-shot request that the
//! [`DfuDetach`] runner consumes after the transfer has completed,
//! ending in an unconditional core reset.

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::signal::Signal;
use embassy_time::Timer;
use embassy_usb::control::{InResponse, OutResponse, Request};
use embassy_usb::types::InterfaceNumber;

/// DFU_DETACH request code.
pub(crate) const REQ_DETACH: u8 = 0;
/// DFU_GETSTATUS request code.
pub(crate) const REQ_GETSTATUS: u8 = 3;

/// Fixed GETSTATUS reply: status OK, zero poll timeout, idle
/// application state, no status string. Satisfies host tooling that
/// polls status before issuing a detach.
const APP_STATUS: [u8; 6] = [0x00, 0x00, 0x00, 0x00, 0x04, 0x00];

/// Pause between the accepted DETACH transfer and the reset, so the
/// status stage reaches the host before the device disappears. Must
/// stay well inside the 255 ms detach timeout advertised by the
/// functional descriptor.
const DETACH_SETTLE_MS: u64 = 10;

/// Records the platform's bootloader request ahead of a detach reset,
/// e.g. by writing a magic value the early boot path checks.
pub trait BootRequest {
    fn request_bootloader(&mut self);
}

/// Platform reset primitive.
pub trait Reset {
    fn sys_reset(&self) -> !;
}

/// [`Reset`] via the ARM SCB, for Cortex-M targets.
#[cfg(feature = "cortex-m")]
pub struct ResetImmediate;

#[cfg(feature = "cortex-m")]
impl Reset for ResetImmediate {
    fn sys_reset(&self) -> ! {
        cortex_m::peripheral::SCB::sys_reset()
    }
}

/// An armed request to leave application mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DetachRequest {
    /// Interface the host addressed; always the DFU interface.
    pub interface: u8,
}

/// Control-side of the detach handshake. Owned by the request router.
pub(crate) struct DetachGate<'d> {
    interface: InterfaceNumber,
    detach: &'d Signal<CriticalSectionRawMutex, DetachRequest>,
}

impl<'d> DetachGate<'d> {
    pub(crate) fn new(
        interface: InterfaceNumber,
        detach: &'d Signal<CriticalSectionRawMutex, DetachRequest>,
    ) -> Self {
        Self { interface, detach }
    }

    fn targets_dfu(&self, req: &Request) -> bool {
        req.index == u16::from(u8::from(self.interface))
    }

    pub(crate) fn handle_detach(&mut self, req: Request) -> Option<OutResponse> {
        if !self.targets_dfu(&req) {
            return None;
        }
        info!("dfu detach requested, arming reboot");
        self.detach.signal(DetachRequest {
            interface: u8::from(self.interface),
        });
        Some(OutResponse::Accepted)
    }

    pub(crate) fn handle_get_status<'a>(
        &mut self,
        req: Request,
        buf: &'a mut [u8],
    ) -> Option<InResponse<'a>> {
        if !self.targets_dfu(&req) {
            return None;
        }
        buf[..APP_STATUS.len()].copy_from_slice(&APP_STATUS);
        Some(InResponse::Accepted(&buf[..APP_STATUS.len()]))
    }
}

/// Deferred side of the detach handshake.
pub struct DfuDetach<'d> {
    pub(crate) detach: &'d Signal<CriticalSectionRawMutex, DetachRequest>,
}

impl DfuDetach<'_> {
    /// Waits for an armed detach, then reboots into the bootloader.
    ///
    /// The request is consumed exactly once and cannot be cancelled.
    /// After the settle delay the boot-mode request is recorded and the
    /// core is reset; this never returns and the device's USB presence
    /// ends with it.
    pub async fn run<B: BootRequest, R: Reset>(self, mut boot: B, reset: R) -> ! {
        let request = self.detach.wait().await;
        info!("rebooting to bootloader (detach on interface {})", request.interface);
        Timer::after_millis(DETACH_SETTLE_MS).await;
        boot.request_bootloader();
        reset.sys_reset()
    }
}

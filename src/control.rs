//! Control-request router for the composite device.
//!
//! A single [`embassy_usb::Handler`] receives every class and vendor
//! control transfer and dispatches it through two disjoint filters:
//! class requests addressed to an interface go to the CDC/DFU arm,
//! vendor requests of any recipient go to the LED arm. Standard
//! requests are answered by the device core and never arrive here.
//! Anything unmatched is left unhandled, which makes the transport
//! stall the transfer; that stall is the only host-visible failure
//! signal, and no side effect ever precedes it.

use core::sync::atomic::{AtomicBool, Ordering};

use embassy_usb::control::{InResponse, OutResponse, Recipient, Request, RequestType};
use embassy_usb::types::{InterfaceNumber, StringIndex};
use embassy_usb::Handler;
use embedded_hal::digital::OutputPin;

use crate::channel::{ChannelShared, LineCoding, Port, SerialState};
use crate::dfu::{self, DetachGate};
use crate::led::LedControl;

/// CDC PSTN request: apply a line-coding record.
const REQ_SET_LINE_CODING: u8 = 0x20;
/// CDC PSTN request: host DTR/RTS update.
const REQ_SET_CONTROL_LINE_STATE: u8 = 0x22;

/// Per-channel control state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ControlState {
    Idle,
    LineStateSet,
}

/// Control-plane view of one serial channel.
pub(crate) struct ChannelControl<'d> {
    port: Port,
    comm_if: InterfaceNumber,
    #[allow(dead_code)]
    data_if: InterfaceNumber,
    state: ControlState,
    line_coding: LineCoding,
    shared: &'d ChannelShared,
}

impl<'d> ChannelControl<'d> {
    pub(crate) fn new(
        port: Port,
        comm_if: InterfaceNumber,
        data_if: InterfaceNumber,
        shared: &'d ChannelShared,
    ) -> Self {
        Self {
            port,
            comm_if,
            data_if,
            state: ControlState::Idle,
            line_coding: LineCoding::default(),
            shared,
        }
    }

    /// Queues a modem-status notification for the pump. Best-effort: a
    /// full queue drops the update rather than blocking the handler.
    fn notify(&self, state: SerialState) {
        let _ = self.shared.notifications.try_send(state);
    }

    fn set_line_state(&mut self) {
        self.state = ControlState::LineStateSet;
        // Echo the signals back asserted regardless of what the host
        // requested, so *BSD/MacOS tty layers see the port as open.
        self.notify(SerialState::ASSERTED);
    }

    fn set_line_coding(&mut self, coding: LineCoding) {
        self.line_coding = coding;
        self.shared.line_coding.signal(coding);
    }

    /// Last line-coding record accepted from the host.
    pub(crate) fn line_coding(&self) -> LineCoding {
        self.line_coding
    }

    /// Whether the host has issued SET_CONTROL_LINE_STATE yet.
    pub(crate) fn line_state_set(&self) -> bool {
        self.state == ControlState::LineStateSet
    }
}

/// Routes class and vendor control transfers across the five logical
/// functions. Registered with the builder once, at composition.
pub struct Control<'d, LED: OutputPin> {
    channels: [ChannelControl<'d>; 3],
    dfu: DetachGate<'d>,
    led: LedControl<LED>,
    configured: &'d AtomicBool,
    strings: [(StringIndex, &'static str); 4],
}

impl<'d, LED: OutputPin> Control<'d, LED> {
    pub(crate) fn new(
        channels: [ChannelControl<'d>; 3],
        dfu: DetachGate<'d>,
        led: LedControl<LED>,
        configured: &'d AtomicBool,
        strings: [(StringIndex, &'static str); 4],
    ) -> Self {
        Self {
            channels,
            dfu,
            led,
            configured,
            strings,
        }
    }

    fn is_configured(&self) -> bool {
        self.configured.load(Ordering::Acquire)
    }

    fn channel_mut(&mut self, index: u16) -> Option<&mut ChannelControl<'d>> {
        self.channels
            .iter_mut()
            .find(|ch| u16::from(u8::from(ch.comm_if)) == index)
    }

    fn class_out(&mut self, req: Request, data: &[u8]) -> Option<OutResponse> {
        match req.request {
            REQ_SET_CONTROL_LINE_STATE => {
                let ch = self.channel_mut(req.index)?;
                ch.set_line_state();
                trace!("line state set on interface {}", req.index);
                Some(OutResponse::Accepted)
            }
            REQ_SET_LINE_CODING => {
                // A short data stage is rejected before anything is
                // read past the bytes the host actually sent.
                let coding = LineCoding::from_bytes(data)?;
                let ch = self.channel_mut(req.index)?;
                match ch.port {
                    Port::Uart2 => {
                        debug!("line coding on interface {}: {} baud", req.index, coding.data_rate);
                        ch.set_line_coding(coding);
                        Some(OutResponse::Accepted)
                    }
                    // The CAN bit rate is fixed; take the record and
                    // drop it.
                    Port::Can => Some(OutResponse::Accepted),
                    Port::Uart1 => None,
                }
            }
            dfu::REQ_DETACH => self.dfu.handle_detach(req),
            _ => None,
        }
    }

    fn class_in<'a>(&mut self, req: Request, buf: &'a mut [u8]) -> Option<InResponse<'a>> {
        match req.request {
            dfu::REQ_GETSTATUS => self.dfu.handle_get_status(req, buf),
            _ => None,
        }
    }
}

impl<'d, LED: OutputPin> Handler for Control<'d, LED> {
    fn reset(&mut self) {
        self.configured.store(false, Ordering::Release);
    }

    fn configured(&mut self, configured: bool) {
        self.configured.store(configured, Ordering::Release);
        if configured {
            info!("usb configured");
            // Assert DCD+DSR on every serial channel up front so hosts
            // need not issue SET_CONTROL_LINE_STATE first.
            for ch in &self.channels {
                ch.notify(SerialState::ASSERTED);
            }
        }
    }

    fn control_out(&mut self, req: Request, data: &[u8]) -> Option<OutResponse> {
        if !self.is_configured() {
            return None;
        }
        match (req.request_type, req.recipient) {
            (RequestType::Class, Recipient::Interface) => self.class_out(req, data),
            (RequestType::Vendor, _) => Some(self.led.handle_out(req)),
            _ => None,
        }
    }

    fn control_in<'a>(&'a mut self, req: Request, buf: &'a mut [u8]) -> Option<InResponse<'a>> {
        if !self.is_configured() {
            return None;
        }
        match (req.request_type, req.recipient) {
            (RequestType::Class, Recipient::Interface) => self.class_in(req, buf),
            (RequestType::Vendor, _) => Some(self.led.handle_in(req, buf)),
            _ => None,
        }
    }

    fn get_string(&mut self, index: StringIndex, _lang_id: u16) -> Option<&str> {
        self.strings
            .iter()
            .find(|(idx, _)| *idx == index)
            .map(|(_, s)| *s)
    }
}

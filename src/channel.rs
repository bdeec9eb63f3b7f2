//! Logical serial channels: line coding, modem status and data pipes.
//!
//! Each CDC-ACM pair on the composite device is one [`SerialChannel`].
//! The control handler never touches endpoints directly; it queues
//! modem-status updates and line-coding records into the channel's
//! shared state, and the channel's [`Notifier`] pump plus the external
//! byte-stream bridge drain them from task context.

use core::cmp::max;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_sync::signal::Signal;
use embassy_usb::driver::{Driver, Endpoint, EndpointError, EndpointIn, EndpointOut};

/// Wire size of a CDC line-coding record.
pub const LINE_CODING_LEN: usize = 7;

/// Pending modem-status updates per channel. The pump usually drains a
/// queued update before the next control transfer can arrive.
const NOTIF_QUEUE_DEPTH: usize = 4;

/// SERIAL_STATE notification: 8-byte class header plus 2-byte bitfield.
const SERIAL_STATE_LEN: usize = 10;
const NOTIF_REQUEST_TYPE: u8 = 0xA1;
const NOTIF_SERIAL_STATE: u8 = 0x20;

/// The three logical serial channels multiplexed onto the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Port {
    /// Auxiliary UART bridge.
    Uart1,
    /// Main UART bridge. The only channel whose line coding reaches
    /// real hardware.
    Uart2,
    /// SLCAN framer channel. The CAN bit rate is negotiated in-band, so
    /// host line-coding records are accepted and dropped.
    Can,
}

/// CDC-ACM line coding record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct LineCoding {
    /// Baud rate in bits per second.
    pub data_rate: u32,
    /// Stop bit encoding: 0 = 1 stop bit, 1 = 1.5, 2 = 2.
    pub stop_bits: u8,
    /// Parity: 0 = none, 1 = odd, 2 = even, 3 = mark, 4 = space.
    pub parity: u8,
    /// Data bits per character.
    pub data_bits: u8,
}

impl LineCoding {
    /// Decodes the wire record. Returns `None` when the host sent fewer
    /// bytes than the record needs; the tail of a longer buffer is
    /// never read.
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < LINE_CODING_LEN {
            return None;
        }
        Some(Self {
            data_rate: u32::from_le_bytes([data[0], data[1], data[2], data[3]]),
            stop_bits: data[4],
            parity: data[5],
            data_bits: data[6],
        })
    }
}

impl Default for LineCoding {
    fn default() -> Self {
        Self {
            data_rate: 115_200,
            stop_bits: 0,
            parity: 0,
            data_bits: 8,
        }
    }
}

/// Modem line state reported to the host as a SERIAL_STATE notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SerialState {
    /// Carrier detect.
    pub dcd: bool,
    /// Data set ready.
    pub dsr: bool,
}

impl SerialState {
    /// Both signals asserted. Reported unconditionally so host tty
    /// layers treat the port as open.
    pub const ASSERTED: Self = Self { dcd: true, dsr: true };

    pub(crate) fn encode(self, comm_if: u8) -> [u8; SERIAL_STATE_LEN] {
        let bits = (self.dcd as u8) | ((self.dsr as u8) << 1);
        [
            NOTIF_REQUEST_TYPE,
            NOTIF_SERIAL_STATE,
            0x00,
            0x00, // wValue
            comm_if,
            0x00, // wIndex: the channel's control interface
            0x02,
            0x00, // wLength
            bits,
            0x00,
        ]
    }
}

/// State shared between the control handler and a channel's tasks.
pub(crate) struct ChannelShared {
    pub(crate) notifications: Channel<CriticalSectionRawMutex, SerialState, NOTIF_QUEUE_DEPTH>,
    pub(crate) line_coding: Signal<CriticalSectionRawMutex, LineCoding>,
}

impl ChannelShared {
    pub(crate) const fn new() -> Self {
        Self {
            notifications: Channel::new(),
            line_coding: Signal::new(),
        }
    }
}

/// Data side of one serial channel, handed to its byte-stream bridge.
pub struct SerialChannel<'d, D: Driver<'d>> {
    pub(crate) port: Port,
    pub(crate) read_ep: D::EndpointOut,
    pub(crate) write_ep: D::EndpointIn,
    pub(crate) shared: &'d ChannelShared,
}

impl<'d, D: Driver<'d>> SerialChannel<'d, D> {
    /// Which logical channel this is.
    pub fn port(&self) -> Port {
        self.port
    }

    /// Bulk packet size shared by both data endpoints.
    pub fn max_packet_size(&self) -> u16 {
        self.read_ep.info().max_packet_size
    }

    /// Waits until the host has configured the device and the data
    /// endpoints are live.
    pub async fn wait_connection(&mut self) {
        self.read_ep.wait_enabled().await
    }

    /// Next line-coding record pushed by the host. Only [`Port::Uart2`]
    /// ever receives one.
    pub async fn line_coding_changed(&self) -> LineCoding {
        self.shared.line_coding.wait().await
    }

    /// Reads one transfer, reassembling packets until a short packet
    /// ends it. Returns the number of bytes placed in `buf`.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, EndpointError> {
        let max_packet = max(self.read_ep.info().max_packet_size, 1) as usize;
        let mut offset = 0;

        loop {
            if offset == buf.len() {
                return Err(EndpointError::BufferOverflow);
            }
            let n = self.read_ep.read(&mut buf[offset..]).await?;
            offset += n;

            if n < max_packet {
                break;
            }
        }

        Ok(offset)
    }

    /// Writes one transfer, splitting `data` into max-packet chunks and
    /// closing with a zero-length packet when the length is an exact
    /// multiple of the packet size.
    pub async fn write(&mut self, data: &[u8]) -> Result<(), EndpointError> {
        let max_packet = max(self.write_ep.info().max_packet_size, 1) as usize;

        for chunk in data.chunks(max_packet) {
            self.write_ep.write(chunk).await?;
        }
        if data.len() % max_packet == 0 {
            self.write_ep.write(&[]).await?;
        }

        Ok(())
    }
}

/// Pump draining one channel's modem-status queue into its interrupt-IN
/// endpoint.
pub struct Notifier<'d, D: Driver<'d>> {
    pub(crate) ep: D::EndpointIn,
    pub(crate) shared: &'d ChannelShared,
    pub(crate) comm_if: u8,
}

impl<'d, D: Driver<'d>> Notifier<'d, D> {
    /// Runs the pump. Writes are best-effort and never retried; a
    /// notification the host does not collect is dropped, matching the
    /// one-way semantics of the notification stream.
    pub async fn run(mut self) -> ! {
        loop {
            let state = self.shared.notifications.receive().await;
            let packet = state.encode(self.comm_if);
            if self.ep.write(&packet).await.is_err() {
                trace!("serial state notification dropped on interface {}", self.comm_if);
            }
        }
    }
}

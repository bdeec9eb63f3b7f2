//! Composite device assembly: identity, descriptors, endpoints, wiring.
//!
//! [`SquidUsb::new`] lays the five functions onto an
//! [`embassy_usb::Builder`] in a fixed order, so interface numbers and
//! endpoint addresses come out the same on every enumeration:
//!
//! | function   | interfaces | endpoints            |
//! |------------|------------|----------------------|
//! | UART1      | 0, 1       | 0x01/0x81, notif 0x82 |
//! | UART2      | 2, 3       | 0x03/0x83, notif 0x84 |
//! | DFU        | 4          | none                 |
//! | LED        | 5          | 0x85 (reserved)      |
//! | SLCAN      | 6, 7       | 0x07/0x87, notif 0x88 |
//!
//! Modem-status notifications always surface on `0x82 +` the channel's
//! control interface number; the vendor LED kernel driver and the
//! SLCAN tooling both depend on this layout.

use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicBool, Ordering};

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::signal::Signal;
use embassy_usb::driver::{Direction, Driver, EndpointAddress};
use embassy_usb::msos::{self, windows_version};
use embassy_usb::types::StringIndex;
use embassy_usb::{Builder, Config};
use embedded_hal::digital::OutputPin;

use crate::channel::{ChannelShared, Notifier, Port, SerialChannel};
use crate::control::{ChannelControl, Control};
use crate::dfu::{DetachGate, DetachRequest, DfuDetach};
use crate::led::LedControl;

/// OpenMoko community vendor id.
pub const VID: u16 = 0x1D50;
/// Product id of the probe.
pub const PID: u16 = 0x60F7;

const MANUFACTURER: &str = "Squid Devices";
const PRODUCT: &str = "Squid Probe";

const UART1_STRING: &str = "Squid UART1";
const UART2_STRING: &str = "Squid UART2";
const CAN_STRING: &str = "Squid SLCAN";
const DFU_STRING: &str = "Squid DFU";

/// Windows device interface GUID for the vendor LED function, consumed
/// by the WinUSB feature descriptors.
const DEVICE_INTERFACE_GUIDS: &[&str] = &["{5D7F6C3A-9E04-4B82-9C6D-1B3E8F204A11}"];

/// Bulk packet size shared by the three data channels.
pub const PACKET_SIZE: u16 = 64;
const NOTIF_PACKET_SIZE: u16 = 64;

const USB_CLASS_CDC: u8 = 0x02;
const USB_CLASS_CDC_DATA: u8 = 0x0A;
const CDC_SUBCLASS_ACM: u8 = 0x02;
const CDC_PROTOCOL_AT: u8 = 0x01;
const CDC_PROTOCOL_NONE: u8 = 0x00;

const CS_INTERFACE: u8 = 0x24;
const CDC_TYPE_HEADER: u8 = 0x00;
const CDC_TYPE_CALL_MANAGEMENT: u8 = 0x01;
const CDC_TYPE_ACM: u8 = 0x02;
const CDC_TYPE_UNION: u8 = 0x06;

const USB_CLASS_APPN_SPEC: u8 = 0xFE;
const APPN_SPEC_SUBCLASS_DFU: u8 = 0x01;
const DFU_PROTOCOL_RUNTIME: u8 = 0x01;
const DESC_DFU_FUNCTIONAL: u8 = 0x21;

const USB_CLASS_VENDOR: u8 = 0xFF;

/// Interface numbers, fixed by function creation order.
pub(crate) mod interfaces {
    pub(crate) const UART1_COMM: u8 = 0;
    pub(crate) const UART2_COMM: u8 = 2;
    pub(crate) const DFU: u8 = 4;
    pub(crate) const LED: u8 = 5;
    pub(crate) const CAN_COMM: u8 = 6;
}

/// Interrupt endpoint number of the LED interface.
const LED_ENDPOINT: u8 = 5;

/// Bulk data endpoints sit one above their control interface number.
fn data_endpoint(comm_if: u8, dir: Direction) -> EndpointAddress {
    EndpointAddress::from_parts(usize::from(comm_if) + 1, dir)
}

/// Notification endpoints sit at `0x82 +` the control interface number.
fn notif_endpoint(comm_if: u8) -> EndpointAddress {
    EndpointAddress::from_parts(usize::from(comm_if) + 2, Direction::In)
}

fn cdc_header_desc() -> [u8; 3] {
    // bcdCDC 1.10
    [CDC_TYPE_HEADER, 0x10, 0x01]
}

fn cdc_call_mgmt_desc(data_if: u8) -> [u8; 3] {
    [CDC_TYPE_CALL_MANAGEMENT, 0x00, data_if]
}

fn cdc_acm_desc() -> [u8; 2] {
    // bmCapabilities: line coding and serial state supported.
    [CDC_TYPE_ACM, 0x02]
}

fn cdc_union_desc(comm_if: u8, data_if: u8) -> [u8; 3] {
    [CDC_TYPE_UNION, comm_if, data_if]
}

/// DFU functional descriptor: download and detach capable, 255 ms
/// detach timeout, 1024-byte transfers, DFU 1.1a.
fn dfu_functional_desc() -> [u8; 7] {
    [0x09, 0xFF, 0x00, 0x00, 0x04, 0x1A, 0x01]
}

/// Device identity for the probe. The serial number comes from the
/// platform's serial-number provider and doubles as the identifier DFU
/// tooling uses to find the device again after a detach.
pub fn usb_config(serial_number: &'static str) -> Config<'static> {
    let mut config = Config::new(VID, PID);
    config.manufacturer = Some(MANUFACTURER);
    config.product = Some(PRODUCT);
    config.serial_number = Some(serial_number);
    config.device_release = 0x0100;
    config.max_power = 100;
    config.max_packet_size_0 = 64;
    config.composite_with_iads = true;
    config.device_class = 0xEF;
    config.device_sub_class = 0x02;
    config.device_protocol = 0x01;
    config
}

/// State shared across the control handler and the channel tasks.
pub(crate) struct Shared {
    pub(crate) uart1: ChannelShared,
    pub(crate) uart2: ChannelShared,
    pub(crate) can: ChannelShared,
    pub(crate) detach: Signal<CriticalSectionRawMutex, DetachRequest>,
    pub(crate) configured: AtomicBool,
}

impl Shared {
    pub(crate) const fn new() -> Self {
        Self {
            uart1: ChannelShared::new(),
            uart2: ChannelShared::new(),
            can: ChannelShared::new(),
            detach: Signal::new(),
            configured: AtomicBool::new(false),
        }
    }
}

/// Backing storage for one composite device instance. Allocate it
/// statically (e.g. in a `StaticCell`) and hand it to [`SquidUsb::new`].
pub struct State<'d, LED: OutputPin> {
    control: MaybeUninit<Control<'d, LED>>,
    shared: Shared,
}

impl<'d, LED: OutputPin> State<'d, LED> {
    pub const fn new() -> Self {
        Self {
            control: MaybeUninit::uninit(),
            shared: Shared::new(),
        }
    }
}

impl<'d, LED: OutputPin> Default for State<'d, LED> {
    fn default() -> Self {
        Self::new()
    }
}

/// Read side of the configuration flag.
#[derive(Copy, Clone)]
pub struct ConfigHandle<'d> {
    configured: &'d AtomicBool,
}

impl ConfigHandle<'_> {
    /// Whether the host has selected the (single) configuration.
    pub fn is_configured(&self) -> bool {
        self.configured.load(Ordering::Acquire)
    }
}

struct SerialParts<'d, D: Driver<'d>> {
    channel: SerialChannel<'d, D>,
    notifier: Notifier<'d, D>,
    control: ChannelControl<'d>,
    comm_if: u8,
}

fn add_serial_function<'d, D: Driver<'d>>(
    builder: &mut Builder<'d, D>,
    shared: &'d ChannelShared,
    port: Port,
    iad_protocol: u8,
    name: StringIndex,
    notif_interval_ms: u8,
) -> SerialParts<'d, D> {
    let mut func = builder.function(USB_CLASS_CDC, CDC_SUBCLASS_ACM, iad_protocol);

    // Control interface: class sub-descriptors plus the notification
    // endpoint.
    let mut iface = func.interface();
    let comm_if = iface.interface_number();
    let data_if = u8::from(comm_if) + 1;
    let mut alt = iface.alt_setting(USB_CLASS_CDC, CDC_SUBCLASS_ACM, CDC_PROTOCOL_AT, Some(name));
    alt.descriptor(CS_INTERFACE, &cdc_header_desc());
    alt.descriptor(CS_INTERFACE, &cdc_call_mgmt_desc(data_if));
    alt.descriptor(CS_INTERFACE, &cdc_acm_desc());
    alt.descriptor(CS_INTERFACE, &cdc_union_desc(u8::from(comm_if), data_if));
    let notif_ep = alt.endpoint_interrupt_in(
        Some(notif_endpoint(u8::from(comm_if))),
        NOTIF_PACKET_SIZE,
        notif_interval_ms,
    );

    // Data interface: the bulk pair the byte-stream bridge drives.
    let mut iface = func.interface();
    let data_if_actual = iface.interface_number();
    let mut alt = iface.alt_setting(USB_CLASS_CDC_DATA, 0x00, 0x00, None);
    let read_ep = alt.endpoint_bulk_out(
        Some(data_endpoint(u8::from(comm_if), Direction::Out)),
        PACKET_SIZE,
    );
    let write_ep = alt.endpoint_bulk_in(
        Some(data_endpoint(u8::from(comm_if), Direction::In)),
        PACKET_SIZE,
    );
    drop(func);

    // The union and call-management sub-descriptors were written before
    // the data interface existed; a skewed number is a build defect.
    assert_eq!(u8::from(data_if_actual), data_if);

    SerialParts {
        channel: SerialChannel {
            port,
            read_ep,
            write_ep,
            shared,
        },
        notifier: Notifier {
            ep: notif_ep,
            shared,
            comm_if: u8::from(comm_if),
        },
        control: ChannelControl::new(port, comm_if, data_if_actual, shared),
        comm_if: u8::from(comm_if),
    }
}

/// The assembled composite device: data channels for the byte bridges,
/// notification pumps, the detach runner and the reserved LED endpoint.
pub struct SquidUsb<'d, D: Driver<'d>> {
    /// Auxiliary UART channel.
    pub uart1: SerialChannel<'d, D>,
    /// Main UART channel.
    pub uart2: SerialChannel<'d, D>,
    /// SLCAN channel.
    pub can: SerialChannel<'d, D>,
    /// Modem-status pumps, one per serial channel. Spawn each one.
    pub notifiers: [Notifier<'d, D>; 3],
    /// Deferred side of the DFU detach handshake.
    pub dfu: DfuDetach<'d>,
    /// Interrupt endpoint of the LED interface. Reserved; no traffic is
    /// defined for it yet.
    pub led_status: D::EndpointIn,
    /// Read side of the configuration flag.
    pub config: ConfigHandle<'d>,
}

impl<'d, D: Driver<'d>> SquidUsb<'d, D> {
    /// Lays the probe's functions onto `builder` and registers the
    /// control-request router. Call once per device.
    pub fn new<LED: OutputPin>(
        builder: &mut Builder<'d, D>,
        state: &'d mut State<'d, LED>,
        led: LED,
    ) -> Self {
        let uart1_str = builder.string();
        let uart2_str = builder.string();
        let can_str = builder.string();
        let dfu_str = builder.string();

        builder.msos_descriptor(windows_version::WIN8_1, 0);

        let shared = &state.shared;

        let uart1 = add_serial_function(
            builder,
            &shared.uart1,
            Port::Uart1,
            CDC_PROTOCOL_AT,
            uart1_str,
            4,
        );
        let uart2 = add_serial_function(
            builder,
            &shared.uart2,
            Port::Uart2,
            CDC_PROTOCOL_NONE,
            uart2_str,
            1,
        );

        // DFU function: one interface, no endpoints, grouped alone.
        let mut func = builder.function(USB_CLASS_APPN_SPEC, APPN_SPEC_SUBCLASS_DFU, DFU_PROTOCOL_RUNTIME);
        let mut iface = func.interface();
        let dfu_if = iface.interface_number();
        let mut alt = iface.alt_setting(
            USB_CLASS_APPN_SPEC,
            APPN_SPEC_SUBCLASS_DFU,
            DFU_PROTOCOL_RUNTIME,
            Some(dfu_str),
        );
        alt.descriptor(DESC_DFU_FUNCTIONAL, &dfu_functional_desc());
        drop(func);

        // Vendor LED function: a lone interface with the reserved
        // interrupt endpoint. The WinUSB features let libusb clients
        // reach it on Windows without an INF file.
        let mut func = builder.function(USB_CLASS_VENDOR, 0, 0);
        func.msos_feature(msos::CompatibleIdFeatureDescriptor::new("WINUSB", ""));
        func.msos_feature(msos::RegistryPropertyFeatureDescriptor::new(
            "DeviceInterfaceGUIDs",
            msos::PropertyData::RegMultiSz(DEVICE_INTERFACE_GUIDS),
        ));
        let mut iface = func.interface();
        let led_if = iface.interface_number();
        let mut alt = iface.alt_setting(USB_CLASS_VENDOR, 0, 0, None);
        let led_status = alt.endpoint_interrupt_in(
            Some(EndpointAddress::from_parts(usize::from(LED_ENDPOINT), Direction::In)),
            NOTIF_PACKET_SIZE,
            11,
        );
        drop(func);

        let can = add_serial_function(
            builder,
            &shared.can,
            Port::Can,
            CDC_PROTOCOL_NONE,
            can_str,
            10,
        );

        // The layout is part of the external contract; any drift is a
        // build defect.
        assert_eq!(uart1.comm_if, interfaces::UART1_COMM);
        assert_eq!(uart2.comm_if, interfaces::UART2_COMM);
        assert_eq!(u8::from(dfu_if), interfaces::DFU);
        assert_eq!(u8::from(led_if), interfaces::LED);
        assert_eq!(can.comm_if, interfaces::CAN_COMM);

        let control = state.control.write(Control::new(
            [uart1.control, uart2.control, can.control],
            DetachGate::new(dfu_if, &shared.detach),
            LedControl::new(led),
            &shared.configured,
            [
                (uart1_str, UART1_STRING),
                (uart2_str, UART2_STRING),
                (can_str, CAN_STRING),
                (dfu_str, DFU_STRING),
            ],
        ));
        builder.handler(control);

        SquidUsb {
            uart1: uart1.channel,
            uart2: uart2.channel,
            can: can.channel,
            notifiers: [uart1.notifier, uart2.notifier, can.notifier],
            dfu: DfuDetach {
                detach: &shared.detach,
            },
            led_status,
            config: ConfigHandle {
                configured: &shared.configured,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notification_endpoints_follow_control_interfaces() {
        assert_eq!(u8::from(notif_endpoint(interfaces::UART1_COMM)), 0x82);
        assert_eq!(u8::from(notif_endpoint(interfaces::UART2_COMM)), 0x84);
        assert_eq!(u8::from(notif_endpoint(interfaces::CAN_COMM)), 0x88);
    }

    #[test]
    fn test_data_endpoints_pair_with_interfaces() {
        assert_eq!(u8::from(data_endpoint(interfaces::UART1_COMM, Direction::Out)), 0x01);
        assert_eq!(u8::from(data_endpoint(interfaces::UART1_COMM, Direction::In)), 0x81);
        assert_eq!(u8::from(data_endpoint(interfaces::UART2_COMM, Direction::In)), 0x83);
        assert_eq!(u8::from(data_endpoint(interfaces::CAN_COMM, Direction::In)), 0x87);
    }

    #[test]
    fn test_cdc_sub_descriptors_reference_the_pair() {
        let comm = interfaces::UART2_COMM;
        let data = comm + 1;
        assert_eq!(cdc_union_desc(comm, data), [0x06, 0x02, 0x03]);
        assert_eq!(cdc_call_mgmt_desc(data), [0x01, 0x00, 0x03]);
        // SET_LINE_CODING support advertised.
        assert_eq!(cdc_acm_desc(), [0x02, 0x02]);
        assert_eq!(cdc_header_desc(), [0x00, 0x10, 0x01]);
    }

    #[test]
    fn test_dfu_functional_descriptor() {
        let desc = dfu_functional_desc();
        // Download and detach capable.
        assert_eq!(desc[0], 0x09);
        // wDetachTimeout 255 ms.
        assert_eq!(u16::from_le_bytes([desc[1], desc[2]]), 255);
        // wTransferSize 1024.
        assert_eq!(u16::from_le_bytes([desc[3], desc[4]]), 1024);
        // DFU 1.1a.
        assert_eq!(u16::from_le_bytes([desc[5], desc[6]]), 0x011A);
    }

    #[test]
    fn test_device_identity() {
        let config = usb_config("0123456789AB");
        // Miscellaneous device with interface associations.
        assert_eq!(config.device_class, 0xEF);
        assert_eq!(config.device_sub_class, 0x02);
        assert_eq!(config.device_protocol, 0x01);
        assert!(config.composite_with_iads);
        assert_eq!(config.serial_number, Some("0123456789AB"));
    }
}

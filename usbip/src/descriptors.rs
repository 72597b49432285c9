use serde::{Deserialize, Serialize};

use crate::protocol::{DeviceRecord, InterfaceRecord};

pub const DESCRIPTOR_TYPE_DEVICE: u8 = 0x01;
pub const DESCRIPTOR_TYPE_CONFIGURATION: u8 = 0x02;
pub const DESCRIPTOR_TYPE_STRING: u8 = 0x03;
pub const DESCRIPTOR_TYPE_INTERFACE: u8 = 0x04;
pub const DESCRIPTOR_TYPE_ENDPOINT: u8 = 0x05;
pub const DESCRIPTOR_TYPE_DEVICE_QUALIFIER: u8 = 0x06;
pub const DESCRIPTOR_TYPE_HID: u8 = 0x21;
pub const DESCRIPTOR_TYPE_HID_REPORT: u8 = 0x22;

pub const ENDPOINT_INTERRUPT_IN: u8 = 0x81;
pub const ENDPOINT_INTERRUPT_OUT: u8 = 0x01;

/// Size of every interrupt report and of the control endpoint packet.
pub const MAX_PACKET_SIZE: u16 = 64;

const USB_VERSION: u16 = 0x0200;
const HID_VERSION: u16 = 0x0111;
const HID_INTERFACE_CLASS: u8 = 0x03;
const ENDPOINT_ATTRIBUTES_INTERRUPT: u8 = 0x03;
const INTERRUPT_INTERVAL_MS: u8 = 5;
const CONFIGURATION_VALUE: u8 = 1;
const LANGUAGE_EN_US: u16 = 0x0409;
/// `USB_SPEED_FULL` from the Linux `usb_device_speed` enum.
const SPEED_FULL: u32 = 2;

const STRING_MANUFACTURER: u8 = 1;
const STRING_PRODUCT: u8 = 2;
const STRING_SERIAL_NUMBER: u8 = 3;

/// Identity of the emulated device, as configured by the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub vendor_id: u16,
    pub product_id: u16,
    pub device_version: u16,
    pub manufacturer: String,
    pub product: String,
    pub serial_number: String,
    pub bus_id: String,
    pub bus_number: u32,
    pub device_number: u32,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            // pid.codes open source vendor id
            vendor_id: 0x1209,
            product_id: 0xf1d0,
            device_version: 0x0100,
            manufacturer: "usbip-fido".into(),
            product: "Virtual FIDO Authenticator".into(),
            serial_number: "000000000001".into(),
            bus_id: "1-1".into(),
            bus_number: 1,
            device_number: 1,
        }
    }
}

/// The static descriptor set of a single-interface HID device with one interrupt endpoint in
/// each direction. Built once, read-only afterwards.
#[derive(Debug, Clone)]
pub struct Descriptors {
    device: Vec<u8>,
    configuration: Vec<u8>,
    hid: Vec<u8>,
    report: Vec<u8>,
    strings: Vec<Vec<u8>>,
}

impl Descriptors {
    pub fn new(config: &DeviceConfig, report_descriptor: &[u8]) -> Self {
        let mut device = Vec::with_capacity(18);
        device.push(18);
        device.push(DESCRIPTOR_TYPE_DEVICE);
        device.extend_from_slice(&USB_VERSION.to_le_bytes());
        // Class, subclass and protocol are defined per interface
        device.extend_from_slice(&[0, 0, 0]);
        device.push(MAX_PACKET_SIZE as u8);
        device.extend_from_slice(&config.vendor_id.to_le_bytes());
        device.extend_from_slice(&config.product_id.to_le_bytes());
        device.extend_from_slice(&config.device_version.to_le_bytes());
        device.extend_from_slice(&[STRING_MANUFACTURER, STRING_PRODUCT, STRING_SERIAL_NUMBER]);
        device.push(1);

        let hid = hid_descriptor(report_descriptor.len() as u16);

        let mut interface_and_endpoints = vec![
            9,
            DESCRIPTOR_TYPE_INTERFACE,
            0, // interface number
            0, // alternate setting
            2, // endpoints
            HID_INTERFACE_CLASS,
            0, // no boot interface subclass
            0,
            0,
        ];
        interface_and_endpoints.extend_from_slice(&hid);
        interface_and_endpoints.extend(endpoint_descriptor(ENDPOINT_INTERRUPT_IN));
        interface_and_endpoints.extend(endpoint_descriptor(ENDPOINT_INTERRUPT_OUT));

        let total_length = 9 + interface_and_endpoints.len() as u16;
        let mut configuration = Vec::with_capacity(total_length as usize);
        configuration.push(9);
        configuration.push(DESCRIPTOR_TYPE_CONFIGURATION);
        configuration.extend_from_slice(&total_length.to_le_bytes());
        configuration.push(1); // interfaces
        configuration.push(CONFIGURATION_VALUE);
        configuration.push(0);
        configuration.push(0x80); // bus powered
        configuration.push(50); // 100 mA in 2 mA units
        configuration.extend(interface_and_endpoints);

        let mut languages = vec![4, DESCRIPTOR_TYPE_STRING];
        languages.extend_from_slice(&LANGUAGE_EN_US.to_le_bytes());

        Descriptors {
            device,
            configuration,
            hid,
            report: report_descriptor.to_vec(),
            strings: vec![
                languages,
                string_descriptor(&config.manufacturer),
                string_descriptor(&config.product),
                string_descriptor(&config.serial_number),
            ],
        }
    }

    pub fn device(&self) -> &[u8] {
        &self.device
    }

    /// Configuration descriptor followed by its interface, HID and endpoint descriptors.
    pub fn configuration(&self) -> &[u8] {
        &self.configuration
    }

    pub fn hid(&self) -> &[u8] {
        &self.hid
    }

    pub fn report(&self) -> &[u8] {
        &self.report
    }

    pub fn string(&self, index: u8) -> Option<&[u8]> {
        self.strings.get(index as usize).map(Vec::as_slice)
    }

    pub fn interface_record(&self) -> InterfaceRecord {
        InterfaceRecord {
            class: HID_INTERFACE_CLASS,
            subclass: 0,
            protocol: 0,
        }
    }

    pub fn device_record(&self, config: &DeviceConfig, configuration_value: u8) -> DeviceRecord {
        DeviceRecord {
            path: format!("/sys/devices/platform/usbip-fido/{}", config.bus_id),
            bus_id: config.bus_id.clone(),
            bus_number: config.bus_number,
            device_number: config.device_number,
            speed: SPEED_FULL,
            vendor_id: config.vendor_id,
            product_id: config.product_id,
            device_version: config.device_version,
            device_class: 0,
            device_subclass: 0,
            device_protocol: 0,
            configuration_value,
            num_configurations: 1,
            num_interfaces: 1,
        }
    }
}

pub(crate) fn is_valid_configuration(value: u8) -> bool {
    value == 0 || value == CONFIGURATION_VALUE
}

fn hid_descriptor(report_len: u16) -> Vec<u8> {
    let mut hid = vec![9, DESCRIPTOR_TYPE_HID];
    hid.extend_from_slice(&HID_VERSION.to_le_bytes());
    hid.push(0); // not localized
    hid.push(1);
    hid.push(DESCRIPTOR_TYPE_HID_REPORT);
    hid.extend_from_slice(&report_len.to_le_bytes());
    hid
}

fn endpoint_descriptor(address: u8) -> Vec<u8> {
    let mut endpoint = vec![
        7,
        DESCRIPTOR_TYPE_ENDPOINT,
        address,
        ENDPOINT_ATTRIBUTES_INTERRUPT,
    ];
    endpoint.extend_from_slice(&MAX_PACKET_SIZE.to_le_bytes());
    endpoint.push(INTERRUPT_INTERVAL_MS);
    endpoint
}

/// UTF-16LE string descriptor, truncated to the 255 byte descriptor limit.
fn string_descriptor(value: &str) -> Vec<u8> {
    let units: Vec<u16> = value.encode_utf16().take(126).collect();
    let mut descriptor = Vec::with_capacity(2 + units.len() * 2);
    descriptor.push((2 + units.len() * 2) as u8);
    descriptor.push(DESCRIPTOR_TYPE_STRING);
    for unit in units {
        descriptor.extend_from_slice(&unit.to_le_bytes());
    }
    descriptor
}

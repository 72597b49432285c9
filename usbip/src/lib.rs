//! A USB/IP server that exports one virtual HID-class USB device.
//!
//! The host attaches with the stock `usbip` client. Control transfers are answered from the
//! device's static descriptor set; interrupt transfers are carried through bounded report queues
//! that the HID function on the device side fills and drains.

pub mod codec;
pub mod descriptors;
pub mod device;
pub mod protocol;
mod server;

pub use codec::{FramingError, Record};
pub use descriptors::{DeviceConfig, Descriptors};
pub use device::{EndpointError, HidDevice, SetupPacket, Stall, REPORT_LEN};
pub use server::{handle_connection, ConnectionError, UsbIpServer};

/// Conventional USB/IP TCP port.
pub const USBIP_PORT: u16 = 3240;

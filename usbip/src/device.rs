use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::descriptors::{
    is_valid_configuration, DeviceConfig, Descriptors, DESCRIPTOR_TYPE_CONFIGURATION,
    DESCRIPTOR_TYPE_DEVICE, DESCRIPTOR_TYPE_HID, DESCRIPTOR_TYPE_HID_REPORT,
    DESCRIPTOR_TYPE_STRING, MAX_PACKET_SIZE,
};
use crate::protocol::{DeviceRecord, InterfaceRecord};

/// Length of every interrupt report carried by the device.
pub const REPORT_LEN: usize = MAX_PACKET_SIZE as usize;

const REQUEST_TYPE_MASK: u8 = 0b0110_0000;
const REQUEST_TYPE_STANDARD: u8 = 0b0000_0000;
const REQUEST_TYPE_CLASS: u8 = 0b0010_0000;

const GET_STATUS: u8 = 0x00;
const CLEAR_FEATURE: u8 = 0x01;
const SET_FEATURE: u8 = 0x03;
const SET_ADDRESS: u8 = 0x05;
const GET_DESCRIPTOR: u8 = 0x06;
const GET_CONFIGURATION: u8 = 0x08;
const SET_CONFIGURATION: u8 = 0x09;
const GET_INTERFACE: u8 = 0x0a;
const SET_INTERFACE: u8 = 0x0b;

const HID_GET_REPORT: u8 = 0x01;
const HID_GET_IDLE: u8 = 0x02;
const HID_GET_PROTOCOL: u8 = 0x03;
const HID_SET_REPORT: u8 = 0x09;
const HID_SET_IDLE: u8 = 0x0a;
const HID_SET_PROTOCOL: u8 = 0x0b;

const HID_PROTOCOL_REPORT: u8 = 1;

/// The eight byte SETUP stage of a control transfer. Unlike USB/IP, fields are little-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetupPacket {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl SetupPacket {
    pub fn parse(bytes: &[u8; 8]) -> Self {
        SetupPacket {
            request_type: bytes[0],
            request: bytes[1],
            value: LittleEndian::read_u16(&bytes[2..4]),
            index: LittleEndian::read_u16(&bytes[4..6]),
            length: LittleEndian::read_u16(&bytes[6..8]),
        }
    }

    pub fn to_bytes(&self) -> [u8; 8] {
        let mut bytes = [0u8; 8];
        bytes[0] = self.request_type;
        bytes[1] = self.request;
        LittleEndian::write_u16(&mut bytes[2..4], self.value);
        LittleEndian::write_u16(&mut bytes[4..6], self.index);
        LittleEndian::write_u16(&mut bytes[6..8], self.length);
        bytes
    }

    fn descriptor_type(&self) -> u8 {
        (self.value >> 8) as u8
    }

    fn descriptor_index(&self) -> u8 {
        (self.value & 0xff) as u8
    }
}

/// The control request is not supported, answered with a STALL handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Control request stalled")]
pub struct Stall;

#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("Endpoint queue closed")]
    Closed,
}

#[derive(Debug)]
struct ControlState {
    address: u16,
    configuration: u8,
    idle_rate: u8,
    protocol: u8,
}

#[derive(Debug)]
struct InterruptInQueue {
    receiver: mpsc::Receiver<Vec<u8>>,
    /// Reports handed out but not delivered, served before anything in `receiver`.
    returned: VecDeque<Vec<u8>>,
}

/// A virtual HID-class USB device.
///
/// The host side (USB/IP connections) issues control transfers and drains/fills the interrupt
/// endpoints. The function side (the HID protocol running on the device) writes IN reports and
/// reads OUT reports. Each interrupt direction is a bounded queue; readers park until a report
/// is available and are served in arrival order.
#[derive(Debug)]
pub struct HidDevice {
    config: DeviceConfig,
    descriptors: Descriptors,
    control: Mutex<ControlState>,
    interrupt_in_tx: mpsc::Sender<Vec<u8>>,
    interrupt_in: tokio::sync::Mutex<InterruptInQueue>,
    interrupt_out_tx: mpsc::Sender<Vec<u8>>,
    interrupt_out: tokio::sync::Mutex<mpsc::Receiver<Vec<u8>>>,
}

impl HidDevice {
    pub fn new(config: DeviceConfig, report_descriptor: &[u8], queue_depth: usize) -> Self {
        let (interrupt_in_tx, interrupt_in_rx) = mpsc::channel(queue_depth.max(1));
        let (interrupt_out_tx, interrupt_out_rx) = mpsc::channel(queue_depth.max(1));
        HidDevice {
            descriptors: Descriptors::new(&config, report_descriptor),
            config,
            control: Mutex::new(ControlState {
                address: 0,
                configuration: 0,
                idle_rate: 0,
                protocol: HID_PROTOCOL_REPORT,
            }),
            interrupt_in_tx,
            interrupt_in: tokio::sync::Mutex::new(InterruptInQueue {
                receiver: interrupt_in_rx,
                returned: VecDeque::new(),
            }),
            interrupt_out_tx,
            interrupt_out: tokio::sync::Mutex::new(interrupt_out_rx),
        }
    }

    pub fn bus_id(&self) -> &str {
        &self.config.bus_id
    }

    pub fn descriptors(&self) -> &Descriptors {
        &self.descriptors
    }

    pub fn device_record(&self) -> DeviceRecord {
        let configuration = self.control_state(|state| state.configuration);
        self.descriptors
            .device_record(&self.config, configuration)
    }

    pub fn interface_records(&self) -> Vec<InterfaceRecord> {
        vec![self.descriptors.interface_record()]
    }

    fn control_state<T>(&self, f: impl FnOnce(&mut ControlState) -> T) -> T {
        let mut state = self.control.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut state)
    }

    /// Answers a control transfer on endpoint 0. `data` is the OUT data stage, if any.
    ///
    /// The returned bytes are the IN data stage truncated to `wLength`; OUT requests return an
    /// empty acknowledgement.
    pub fn control_transfer(&self, setup: SetupPacket, data: &[u8]) -> Result<Vec<u8>, Stall> {
        let mut response = match setup.request_type & REQUEST_TYPE_MASK {
            REQUEST_TYPE_STANDARD => self.standard_request(&setup),
            REQUEST_TYPE_CLASS => self.hid_class_request(&setup, data),
            _ => Err(Stall),
        }
        .map_err(|stall| {
            debug!(?setup, "Stalling unsupported control request");
            stall
        })?;
        response.truncate(setup.length as usize);
        trace!(?setup, response_len = response.len(), "Control transfer");
        Ok(response)
    }

    fn standard_request(&self, setup: &SetupPacket) -> Result<Vec<u8>, Stall> {
        match setup.request {
            // Bus powered, no remote wakeup, endpoints never halted
            GET_STATUS => Ok(vec![0, 0]),
            CLEAR_FEATURE | SET_FEATURE => Ok(Vec::new()),
            SET_ADDRESS => {
                self.control_state(|state| state.address = setup.value);
                Ok(Vec::new())
            }
            GET_DESCRIPTOR => self.descriptor(setup),
            GET_CONFIGURATION => Ok(vec![self.control_state(|state| state.configuration)]),
            SET_CONFIGURATION => {
                let value = (setup.value & 0xff) as u8;
                if !is_valid_configuration(value) {
                    return Err(Stall);
                }
                debug!(configuration = value, "Configuration selected");
                self.control_state(|state| state.configuration = value);
                Ok(Vec::new())
            }
            GET_INTERFACE => Ok(vec![0]),
            SET_INTERFACE if setup.value == 0 => Ok(Vec::new()),
            _ => Err(Stall),
        }
    }

    fn descriptor(&self, setup: &SetupPacket) -> Result<Vec<u8>, Stall> {
        let descriptor = match setup.descriptor_type() {
            DESCRIPTOR_TYPE_DEVICE => self.descriptors.device(),
            DESCRIPTOR_TYPE_CONFIGURATION => self.descriptors.configuration(),
            DESCRIPTOR_TYPE_STRING => self
                .descriptors
                .string(setup.descriptor_index())
                .ok_or(Stall)?,
            DESCRIPTOR_TYPE_HID => self.descriptors.hid(),
            DESCRIPTOR_TYPE_HID_REPORT => self.descriptors.report(),
            // Full speed only, so no device qualifier
            _ => return Err(Stall),
        };
        Ok(descriptor.to_vec())
    }

    fn hid_class_request(&self, setup: &SetupPacket, data: &[u8]) -> Result<Vec<u8>, Stall> {
        match setup.request {
            HID_GET_IDLE => Ok(vec![self.control_state(|state| state.idle_rate)]),
            HID_SET_IDLE => {
                self.control_state(|state| state.idle_rate = (setup.value >> 8) as u8);
                Ok(Vec::new())
            }
            HID_GET_PROTOCOL => Ok(vec![self.control_state(|state| state.protocol)]),
            HID_SET_PROTOCOL => {
                self.control_state(|state| state.protocol = (setup.value & 0xff) as u8);
                Ok(Vec::new())
            }
            HID_GET_REPORT | HID_SET_REPORT => {
                trace!(data_len = data.len(), "Reports are only carried on interrupt endpoints");
                Err(Stall)
            }
            _ => Err(Stall),
        }
    }

    /// Host side: takes the next IN report, waiting for one if the queue is empty.
    ///
    /// `deliver` runs while the queue is held. If it hands the report back the report stays at
    /// the head of the queue, so a reader cancelled after a report became available loses
    /// nothing.
    pub async fn read_interrupt_in<F>(&self, deliver: F) -> Result<(), EndpointError>
    where
        F: FnOnce(Vec<u8>) -> Result<(), Vec<u8>>,
    {
        let mut queue = self.interrupt_in.lock().await;
        let report = match queue.returned.pop_front() {
            Some(report) => report,
            None => queue.receiver.recv().await.ok_or(EndpointError::Closed)?,
        };
        if let Err(report) = deliver(report) {
            trace!("IN report not delivered, requeued");
            queue.returned.push_front(report);
        }
        Ok(())
    }

    /// Host side: queues a report received on the OUT endpoint. Short reports are zero padded.
    pub async fn submit_interrupt_out(&self, mut report: Vec<u8>) -> Result<(), EndpointError> {
        if report.len() < REPORT_LEN {
            report.resize(REPORT_LEN, 0);
        }
        self.interrupt_out_tx
            .send(report)
            .await
            .map_err(|_| EndpointError::Closed)
    }

    /// Function side: queues a report for the host to read from the IN endpoint.
    pub async fn write_interrupt_in(&self, report: Vec<u8>) -> Result<(), EndpointError> {
        self.interrupt_in_tx
            .send(report)
            .await
            .map_err(|_| EndpointError::Closed)
    }

    /// Function side: waits for the next report the host wrote to the OUT endpoint.
    pub async fn read_interrupt_out(&self) -> Result<Vec<u8>, EndpointError> {
        self.interrupt_out
            .lock()
            .await
            .recv()
            .await
            .ok_or(EndpointError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use assert_matches::assert_matches;

    use super::*;

    const REPORT_DESCRIPTOR: [u8; 4] = [0x06, 0xd0, 0xf1, 0xc0];

    fn device() -> HidDevice {
        HidDevice::new(DeviceConfig::default(), &REPORT_DESCRIPTOR, 4)
    }

    fn get_descriptor(descriptor_type: u8, index: u8, length: u16) -> SetupPacket {
        SetupPacket {
            request_type: 0x80,
            request: GET_DESCRIPTOR,
            value: (descriptor_type as u16) << 8 | index as u16,
            index: 0,
            length,
        }
    }

    #[test]
    fn setup_packet_is_little_endian() {
        let setup = SetupPacket::parse(&[0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x12, 0x00]);
        assert_eq!(setup, get_descriptor(DESCRIPTOR_TYPE_DEVICE, 0, 18));
        assert_eq!(
            setup.to_bytes(),
            [0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x12, 0x00]
        );
    }

    #[test]
    fn get_device_descriptor() {
        let device = device();
        let response = device
            .control_transfer(get_descriptor(DESCRIPTOR_TYPE_DEVICE, 0, 64), &[])
            .unwrap();
        assert_eq!(response, device.descriptors().device());
    }

    #[test]
    fn get_descriptor_truncates_to_length() {
        let response = device()
            .control_transfer(get_descriptor(DESCRIPTOR_TYPE_CONFIGURATION, 0, 9), &[])
            .unwrap();
        assert_eq!(response.len(), 9);
        assert_eq!(&response[2..4], &[41, 0]);
    }

    #[test]
    fn get_report_descriptor() {
        let setup = SetupPacket {
            request_type: 0x81,
            ..get_descriptor(DESCRIPTOR_TYPE_HID_REPORT, 0, 0xff)
        };
        assert_eq!(
            device().control_transfer(setup, &[]).unwrap(),
            REPORT_DESCRIPTOR.to_vec()
        );
    }

    #[test]
    fn unknown_string_and_qualifier_stall() {
        let device = device();
        assert_matches!(
            device.control_transfer(get_descriptor(DESCRIPTOR_TYPE_STRING, 9, 255), &[]),
            Err(Stall)
        );
        assert_matches!(
            device.control_transfer(get_descriptor(0x06, 0, 10), &[]),
            Err(Stall)
        );
    }

    #[test]
    fn set_and_get_configuration() {
        let device = device();
        let set = |value| SetupPacket {
            request_type: 0x00,
            request: SET_CONFIGURATION,
            value,
            index: 0,
            length: 0,
        };
        let get = SetupPacket {
            request_type: 0x80,
            request: GET_CONFIGURATION,
            value: 0,
            index: 0,
            length: 1,
        };

        assert_eq!(device.control_transfer(set(1), &[]), Ok(vec![]));
        assert_eq!(device.control_transfer(get, &[]), Ok(vec![1]));
        assert_eq!(device.device_record().configuration_value, 1);
        assert_eq!(device.control_transfer(set(2), &[]), Err(Stall));
    }

    #[test]
    fn hid_idle_and_protocol() {
        let device = device();
        let class = |request_type, request, value, length| SetupPacket {
            request_type,
            request,
            value,
            index: 0,
            length,
        };

        assert_eq!(
            device.control_transfer(class(0x21, HID_SET_IDLE, 0x0400, 0), &[]),
            Ok(vec![])
        );
        assert_eq!(
            device.control_transfer(class(0xa1, HID_GET_IDLE, 0, 1), &[]),
            Ok(vec![4])
        );
        assert_eq!(
            device.control_transfer(class(0xa1, HID_GET_PROTOCOL, 0, 1), &[]),
            Ok(vec![1])
        );
        assert_eq!(
            device.control_transfer(class(0xa1, HID_GET_REPORT, 0x0100, 64), &[]),
            Err(Stall)
        );
    }

    #[test]
    fn vendor_request_stalls() {
        let setup = SetupPacket {
            request_type: 0xc0,
            request: 0x01,
            value: 0,
            index: 0,
            length: 0,
        };
        assert_eq!(device().control_transfer(setup, &[]), Err(Stall));
    }

    #[tokio::test]
    async fn out_reports_are_padded_and_ordered() {
        let device = device();
        device.submit_interrupt_out(vec![1, 2]).await.unwrap();
        device.submit_interrupt_out(vec![3; 64]).await.unwrap();

        let first = device.read_interrupt_out().await.unwrap();
        assert_eq!(first.len(), REPORT_LEN);
        assert_eq!(&first[..3], &[1, 2, 0]);
        assert_eq!(device.read_interrupt_out().await.unwrap(), vec![3; 64]);
    }

    #[tokio::test]
    async fn in_reader_parks_until_report_written() {
        let device = Arc::new(device());
        let reader = {
            let device = device.clone();
            tokio::spawn(async move {
                let mut received = None;
                device
                    .read_interrupt_in(|report| {
                        received = Some(report);
                        Ok(())
                    })
                    .await
                    .unwrap();
                received
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!reader.is_finished());

        device.write_interrupt_in(vec![7; 64]).await.unwrap();
        assert_eq!(reader.await.unwrap(), Some(vec![7; 64]));
    }

    #[tokio::test]
    async fn refused_report_is_served_next() {
        let device = device();
        device.write_interrupt_in(vec![1]).await.unwrap();
        device.write_interrupt_in(vec![2]).await.unwrap();

        device.read_interrupt_in(Err).await.unwrap();

        let mut received = Vec::new();
        for _ in 0..2 {
            device
                .read_interrupt_in(|report| {
                    received.push(report);
                    Ok(())
                })
                .await
                .unwrap();
        }
        assert_eq!(received, vec![vec![1], vec![2]]);
    }
}

//! USB/IP wire records.
//!
//! Layouts follow the Linux `usbip_common.h` / `usbip_network.h` definitions: every integer is
//! big-endian, strings are NUL padded to their fixed width.

use tokio::io::AsyncRead;
use tracing::trace;

use crate::codec::{read_payload, read_record, FieldReader, FieldWriter, FramingError, Record};

pub const USBIP_VERSION: u16 = 0x0111;

pub const OP_REQ_DEVLIST: u16 = 0x8005;
pub const OP_REP_DEVLIST: u16 = 0x0005;
pub const OP_REQ_IMPORT: u16 = 0x8003;
pub const OP_REP_IMPORT: u16 = 0x0003;

pub const USBIP_CMD_SUBMIT: u32 = 0x0001;
pub const USBIP_CMD_UNLINK: u32 = 0x0002;
pub const USBIP_RET_SUBMIT: u32 = 0x0003;
pub const USBIP_RET_UNLINK: u32 = 0x0004;

pub const OP_STATUS_OK: u32 = 0;
pub const OP_STATUS_ERROR: u32 = 1;

/// URB status for a stalled or unsupported transfer, `-EPIPE`.
pub const STATUS_STALL: i32 = -32;
/// URB status for a transfer cancelled by unlink, `-ECONNRESET`.
pub const STATUS_CANCELLED: i32 = -104;

const PATH_LEN: usize = 256;
const BUS_ID_LEN: usize = 32;
const ISO_PACKET_DESCRIPTOR_LEN: usize = 16;

/// Upper bound on a single transfer buffer accepted from the host.
pub const MAX_TRANSFER_LEN: usize = 1 << 20;
const MAX_ISO_PACKETS: usize = 1024;

fn nul_terminated(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// Common header of every control-phase operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpHeader {
    pub version: u16,
    pub code: u16,
    pub status: u32,
}

impl OpHeader {
    pub fn reply(code: u16, status: u32) -> Self {
        OpHeader {
            version: USBIP_VERSION,
            code,
            status,
        }
    }
}

impl Record for OpHeader {
    const NAME: &'static str = "OpHeader";
    const LEN: usize = 8;

    fn read_fields(fields: &mut FieldReader<'_>) -> Result<Self, FramingError> {
        Ok(OpHeader {
            version: fields.u16(),
            code: fields.u16(),
            status: fields.u32(),
        })
    }

    fn write_fields(&self, fields: &mut FieldWriter<'_>) {
        fields.u16(self.version);
        fields.u16(self.code);
        fields.u32(self.status);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportRequest {
    pub bus_id: String,
}

impl Record for ImportRequest {
    const NAME: &'static str = "ImportRequest";
    const LEN: usize = BUS_ID_LEN;

    fn read_fields(fields: &mut FieldReader<'_>) -> Result<Self, FramingError> {
        Ok(ImportRequest {
            bus_id: nul_terminated(&fields.array::<BUS_ID_LEN>()),
        })
    }

    fn write_fields(&self, fields: &mut FieldWriter<'_>) {
        fields.bytes(self.bus_id.as_bytes(), BUS_ID_LEN);
    }
}

/// Number of device records following an `OP_REP_DEVLIST` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceCount(pub u32);

impl Record for DeviceCount {
    const NAME: &'static str = "DeviceCount";
    const LEN: usize = 4;

    fn read_fields(fields: &mut FieldReader<'_>) -> Result<Self, FramingError> {
        Ok(DeviceCount(fields.u32()))
    }

    fn write_fields(&self, fields: &mut FieldWriter<'_>) {
        fields.u32(self.0);
    }
}

/// `struct usbip_usb_device`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRecord {
    pub path: String,
    pub bus_id: String,
    pub bus_number: u32,
    pub device_number: u32,
    pub speed: u32,
    pub vendor_id: u16,
    pub product_id: u16,
    pub device_version: u16,
    pub device_class: u8,
    pub device_subclass: u8,
    pub device_protocol: u8,
    pub configuration_value: u8,
    pub num_configurations: u8,
    pub num_interfaces: u8,
}

impl Record for DeviceRecord {
    const NAME: &'static str = "DeviceRecord";
    const LEN: usize = 312;

    fn read_fields(fields: &mut FieldReader<'_>) -> Result<Self, FramingError> {
        Ok(DeviceRecord {
            path: nul_terminated(&fields.array::<PATH_LEN>()),
            bus_id: nul_terminated(&fields.array::<BUS_ID_LEN>()),
            bus_number: fields.u32(),
            device_number: fields.u32(),
            speed: fields.u32(),
            vendor_id: fields.u16(),
            product_id: fields.u16(),
            device_version: fields.u16(),
            device_class: fields.u8(),
            device_subclass: fields.u8(),
            device_protocol: fields.u8(),
            configuration_value: fields.u8(),
            num_configurations: fields.u8(),
            num_interfaces: fields.u8(),
        })
    }

    fn write_fields(&self, fields: &mut FieldWriter<'_>) {
        fields.bytes(self.path.as_bytes(), PATH_LEN);
        fields.bytes(self.bus_id.as_bytes(), BUS_ID_LEN);
        fields.u32(self.bus_number);
        fields.u32(self.device_number);
        fields.u32(self.speed);
        fields.u16(self.vendor_id);
        fields.u16(self.product_id);
        fields.u16(self.device_version);
        fields.u8(self.device_class);
        fields.u8(self.device_subclass);
        fields.u8(self.device_protocol);
        fields.u8(self.configuration_value);
        fields.u8(self.num_configurations);
        fields.u8(self.num_interfaces);
    }
}

/// `struct usbip_usb_interface`, only sent in device list replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceRecord {
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
}

impl Record for InterfaceRecord {
    const NAME: &'static str = "InterfaceRecord";
    const LEN: usize = 4;

    fn read_fields(fields: &mut FieldReader<'_>) -> Result<Self, FramingError> {
        let record = InterfaceRecord {
            class: fields.u8(),
            subclass: fields.u8(),
            protocol: fields.u8(),
        };
        fields.skip(1);
        Ok(record)
    }

    fn write_fields(&self, fields: &mut FieldWriter<'_>) {
        fields.u8(self.class);
        fields.u8(self.subclass);
        fields.u8(self.protocol);
        fields.skip(1);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Out,
    In,
}

impl Direction {
    fn from_wire(value: u32) -> Result<Self, FramingError> {
        match value {
            0 => Ok(Direction::Out),
            1 => Ok(Direction::In),
            code => Err(FramingError::UnknownCode {
                record: "Direction",
                code,
            }),
        }
    }

    fn to_wire(self) -> u32 {
        match self {
            Direction::Out => 0,
            Direction::In => 1,
        }
    }
}

/// `struct usbip_header_basic`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderBasic {
    pub command: u32,
    pub seqnum: u32,
    pub devid: u32,
    pub direction: Direction,
    pub endpoint: u32,
}

impl HeaderBasic {
    /// Header for a reply. The Linux stub driver zeroes devid, direction and endpoint on returns.
    fn reply(command: u32, seqnum: u32) -> Self {
        HeaderBasic {
            command,
            seqnum,
            devid: 0,
            direction: Direction::Out,
            endpoint: 0,
        }
    }
}

impl Record for HeaderBasic {
    const NAME: &'static str = "HeaderBasic";
    const LEN: usize = 20;

    fn read_fields(fields: &mut FieldReader<'_>) -> Result<Self, FramingError> {
        Ok(HeaderBasic {
            command: fields.u32(),
            seqnum: fields.u32(),
            devid: fields.u32(),
            direction: Direction::from_wire(fields.u32())?,
            endpoint: fields.u32(),
        })
    }

    fn write_fields(&self, fields: &mut FieldWriter<'_>) {
        fields.u32(self.command);
        fields.u32(self.seqnum);
        fields.u32(self.devid);
        fields.u32(self.direction.to_wire());
        fields.u32(self.endpoint);
    }
}

/// `struct usbip_header_cmd_submit`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmitBody {
    pub transfer_flags: u32,
    pub transfer_buffer_length: u32,
    pub start_frame: i32,
    pub number_of_packets: u32,
    pub interval: u32,
    pub setup: [u8; 8],
}

impl SubmitBody {
    /// Non-isochronous URBs carry 0 or 0xffffffff here.
    pub fn iso_packet_count(&self) -> usize {
        match self.number_of_packets {
            0 | 0xffff_ffff => 0,
            n => n as usize,
        }
    }
}

impl Record for SubmitBody {
    const NAME: &'static str = "SubmitBody";
    const LEN: usize = 28;

    fn read_fields(fields: &mut FieldReader<'_>) -> Result<Self, FramingError> {
        Ok(SubmitBody {
            transfer_flags: fields.u32(),
            transfer_buffer_length: fields.u32(),
            start_frame: fields.i32(),
            number_of_packets: fields.u32(),
            interval: fields.u32(),
            setup: fields.array(),
        })
    }

    fn write_fields(&self, fields: &mut FieldWriter<'_>) {
        fields.u32(self.transfer_flags);
        fields.u32(self.transfer_buffer_length);
        fields.i32(self.start_frame);
        fields.u32(self.number_of_packets);
        fields.u32(self.interval);
        fields.bytes(&self.setup, 8);
    }
}

/// `struct usbip_header_cmd_unlink`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnlinkBody {
    pub unlink_seqnum: u32,
}

impl Record for UnlinkBody {
    const NAME: &'static str = "UnlinkBody";
    const LEN: usize = 28;

    fn read_fields(fields: &mut FieldReader<'_>) -> Result<Self, FramingError> {
        let body = UnlinkBody {
            unlink_seqnum: fields.u32(),
        };
        fields.skip(24);
        Ok(body)
    }

    fn write_fields(&self, fields: &mut FieldWriter<'_>) {
        fields.u32(self.unlink_seqnum);
        fields.skip(24);
    }
}

/// `USBIP_RET_SUBMIT` header; the IN transfer buffer follows on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetSubmit {
    pub seqnum: u32,
    pub status: i32,
    pub actual_length: u32,
    pub start_frame: i32,
    pub number_of_packets: u32,
    pub error_count: u32,
}

impl RetSubmit {
    pub fn new(seqnum: u32, status: i32, actual_length: usize) -> Self {
        RetSubmit {
            seqnum,
            status,
            actual_length: actual_length as u32,
            start_frame: 0,
            number_of_packets: 0,
            error_count: 0,
        }
    }
}

impl Record for RetSubmit {
    const NAME: &'static str = "RetSubmit";
    const LEN: usize = 48;

    fn read_fields(fields: &mut FieldReader<'_>) -> Result<Self, FramingError> {
        let header = HeaderBasic::read_fields(fields)?;
        if header.command != USBIP_RET_SUBMIT {
            return Err(FramingError::UnknownCode {
                record: Self::NAME,
                code: header.command,
            });
        }
        let ret = RetSubmit {
            seqnum: header.seqnum,
            status: fields.i32(),
            actual_length: fields.u32(),
            start_frame: fields.i32(),
            number_of_packets: fields.u32(),
            error_count: fields.u32(),
        };
        fields.skip(8);
        Ok(ret)
    }

    fn write_fields(&self, fields: &mut FieldWriter<'_>) {
        HeaderBasic::reply(USBIP_RET_SUBMIT, self.seqnum).write_fields(fields);
        fields.i32(self.status);
        fields.u32(self.actual_length);
        fields.i32(self.start_frame);
        fields.u32(self.number_of_packets);
        fields.u32(self.error_count);
        fields.skip(8);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetUnlink {
    pub seqnum: u32,
    pub status: i32,
}

impl Record for RetUnlink {
    const NAME: &'static str = "RetUnlink";
    const LEN: usize = 48;

    fn read_fields(fields: &mut FieldReader<'_>) -> Result<Self, FramingError> {
        let header = HeaderBasic::read_fields(fields)?;
        if header.command != USBIP_RET_UNLINK {
            return Err(FramingError::UnknownCode {
                record: Self::NAME,
                code: header.command,
            });
        }
        let ret = RetUnlink {
            seqnum: header.seqnum,
            status: fields.i32(),
        };
        fields.skip(24);
        Ok(ret)
    }

    fn write_fields(&self, fields: &mut FieldWriter<'_>) {
        HeaderBasic::reply(USBIP_RET_UNLINK, self.seqnum).write_fields(fields);
        fields.i32(self.status);
        fields.skip(24);
    }
}

/// A data-phase command read off the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Submit {
        header: HeaderBasic,
        body: SubmitBody,
        /// OUT transfer data, empty for IN transfers.
        buffer: Vec<u8>,
        /// Isochronous packet descriptors were present and have been discarded.
        isochronous: bool,
    },
    Unlink {
        header: HeaderBasic,
        body: UnlinkBody,
    },
}

impl Command {
    pub fn seqnum(&self) -> u32 {
        match self {
            Command::Submit { header, .. } | Command::Unlink { header, .. } => header.seqnum,
        }
    }

    fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::new();
        match self {
            Command::Submit {
                header,
                body,
                buffer,
                ..
            } => {
                header.encode_into(&mut bytes);
                body.encode_into(&mut bytes);
                bytes.extend_from_slice(buffer);
            }
            Command::Unlink { header, body } => {
                header.encode_into(&mut bytes);
                body.encode_into(&mut bytes);
            }
        }
        bytes
    }
}

/// Reads one `USBIP_CMD_SUBMIT` or `USBIP_CMD_UNLINK` including any trailing transfer data.
pub async fn read_command<R>(reader: &mut R) -> Result<Command, FramingError>
where
    R: AsyncRead + Unpin,
{
    let header: HeaderBasic = read_record(reader).await?;
    match header.command {
        USBIP_CMD_SUBMIT => {
            let body: SubmitBody = read_record(reader).await?;
            let buffer = match header.direction {
                Direction::Out => {
                    let len = body.transfer_buffer_length as usize;
                    if len > MAX_TRANSFER_LEN {
                        return Err(FramingError::Oversized {
                            record: "transfer buffer",
                            len,
                            max: MAX_TRANSFER_LEN,
                        });
                    }
                    read_payload(reader, len).await?
                }
                Direction::In => Vec::new(),
            };
            let packets = body.iso_packet_count();
            if packets > MAX_ISO_PACKETS {
                return Err(FramingError::Oversized {
                    record: "isochronous packet descriptors",
                    len: packets,
                    max: MAX_ISO_PACKETS,
                });
            }
            if packets > 0 {
                read_payload(reader, packets * ISO_PACKET_DESCRIPTOR_LEN).await?;
                trace!(seqnum = header.seqnum, packets, "Discarded isochronous descriptors");
            }
            Ok(Command::Submit {
                header,
                body,
                buffer,
                isochronous: packets > 0,
            })
        }
        USBIP_CMD_UNLINK => {
            let body: UnlinkBody = read_record(reader).await?;
            Ok(Command::Unlink { header, body })
        }
        code => Err(FramingError::UnknownCode {
            record: "USB/IP command",
            code,
        }),
    }
}

/// Encodes a command as a host would send it. Used by clients and tests.
pub fn encode_command(command: &Command) -> Vec<u8> {
    command.encode()
}

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};

use futures::Future;
use pin_project::pin_project;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, info, trace, warn};

use crate::codec::{read_record, FramingError, Record};
use crate::descriptors::{ENDPOINT_INTERRUPT_IN, ENDPOINT_INTERRUPT_OUT};
use crate::device::{EndpointError, HidDevice, SetupPacket, Stall};
use crate::protocol::*;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Framing error: {0}")]
    Framing(#[from] FramingError),

    #[error("Endpoint error: {0}")]
    Endpoint(#[from] EndpointError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Connection writer closed")]
    WriterClosed,
}

/// Accepts USB/IP connections and serves each on its own task, all sharing one device.
#[must_use = "futures do nothing unless polled"]
#[pin_project]
#[derive(Debug)]
pub struct UsbIpServer {
    listener: TcpListener,
    device: Arc<HidDevice>,
}

impl UsbIpServer {
    pub fn serve(listener: TcpListener, device: Arc<HidDevice>) -> Self {
        UsbIpServer { listener, device }
    }
}

impl Future for UsbIpServer {
    type Output = io::Result<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        loop {
            // Repeats while connections are available, returns on error or when none are pending.
            match this.listener.poll_accept(cx) {
                Poll::Ready(Ok((stream, addr))) => {
                    debug!(%addr, "Accepted USB/IP connection");
                    let device = this.device.clone();
                    spawn_named("usbip connection", async move {
                        match handle_connection(stream, addr, device).await {
                            Ok(()) => debug!(%addr, "USB/IP connection closed"),
                            Err(err) => error!(%addr, error = %err, "USB/IP connection failed"),
                        }
                    });
                }
                Poll::Ready(Err(err)) => return Poll::Ready(Err(err)),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

/// Serves one USB/IP connection: the operation phase, then URB traffic once the device has been
/// imported. Pending URBs are dropped without reply when the connection ends.
pub async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    device: Arc<HidDevice>,
) -> Result<(), ConnectionError> {
    stream.set_nodelay(true)?;
    let (mut reader, mut writer) = stream.into_split();

    if !negotiate(&mut reader, &mut writer, &device).await? {
        return Ok(());
    }
    info!(%addr, bus_id = device.bus_id(), "Device imported");

    let (replies, mut reply_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let writer_task = spawn_named("usbip writer", async move {
        while let Some(bytes) = reply_rx.recv().await {
            writer.write_all(&bytes).await?;
        }
        writer.shutdown().await
    });

    let interrupt_in = Arc::new(InterruptIn::default());
    let dispatcher = spawn_named(
        "usbip interrupt in",
        serve_interrupt_in(device.clone(), interrupt_in.clone(), replies.clone()),
    );

    let mut connection = Connection {
        device,
        interrupt_in,
        replies,
    };
    let result = connection.run(&mut reader).await;

    // Releases parked IN transfers without answering them
    connection.interrupt_in.pending().clear();
    drop(connection);
    dispatcher.abort();
    match dispatcher.await {
        Ok(Err(err)) => warn!(%addr, error = %err, "Interrupt IN failed"),
        Ok(Ok(())) | Err(_) => {}
    }

    match writer_task.await {
        Ok(Err(err)) if result.is_ok() => Err(err.into()),
        _ => result,
    }
}

/// Handles `OP_REQ_*` requests. Returns true once the device has been imported, false if the
/// peer disconnected first.
async fn negotiate(
    reader: &mut OwnedReadHalf,
    writer: &mut OwnedWriteHalf,
    device: &HidDevice,
) -> Result<bool, ConnectionError> {
    loop {
        let header: OpHeader = match read_record(reader).await {
            Ok(header) => header,
            Err(err) if err.is_eof() => return Ok(false),
            Err(err) => return Err(err.into()),
        };
        if header.version != USBIP_VERSION {
            warn!(version = header.version, "Unexpected USB/IP version, continuing");
        }

        let mut reply = Vec::new();
        match header.code {
            OP_REQ_DEVLIST => {
                trace!("OP_REQ_DEVLIST");
                OpHeader::reply(OP_REP_DEVLIST, OP_STATUS_OK).encode_into(&mut reply);
                DeviceCount(1).encode_into(&mut reply);
                device.device_record().encode_into(&mut reply);
                for interface in device.interface_records() {
                    interface.encode_into(&mut reply);
                }
                writer.write_all(&reply).await?;
            }
            OP_REQ_IMPORT => {
                let request: ImportRequest = read_record(reader).await?;
                if request.bus_id == device.bus_id() {
                    OpHeader::reply(OP_REP_IMPORT, OP_STATUS_OK).encode_into(&mut reply);
                    device.device_record().encode_into(&mut reply);
                    writer.write_all(&reply).await?;
                    return Ok(true);
                }
                warn!(bus_id = %request.bus_id, "Import requested for unknown bus id");
                OpHeader::reply(OP_REP_IMPORT, OP_STATUS_ERROR).encode_into(&mut reply);
                writer.write_all(&reply).await?;
            }
            code => {
                return Err(FramingError::UnknownCode {
                    record: "USB/IP operation",
                    code: code.into(),
                }
                .into())
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PendingIn {
    seqnum: u32,
    buffer_len: usize,
}

/// Interrupt IN submits still waiting for a report, oldest first. Whoever removes an entry owns
/// the single reply for that seqnum and queues it before releasing the lock.
#[derive(Debug, Default)]
struct InterruptIn {
    pending: Mutex<VecDeque<PendingIn>>,
    parked: Notify,
}

impl InterruptIn {
    fn pending(&self) -> std::sync::MutexGuard<'_, VecDeque<PendingIn>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn park(&self, urb: PendingIn) {
        self.pending().push_back(urb);
        self.parked.notify_one();
    }
}

/// Hands IN reports to parked submits in the order they were submitted.
async fn serve_interrupt_in(
    device: Arc<HidDevice>,
    interrupt_in: Arc<InterruptIn>,
    replies: mpsc::UnboundedSender<Vec<u8>>,
) -> Result<(), EndpointError> {
    loop {
        if interrupt_in.pending().is_empty() {
            interrupt_in.parked.notified().await;
            continue;
        }
        device
            .read_interrupt_in(|report| {
                let mut pending = interrupt_in.pending();
                // Everything was unlinked while waiting
                let urb = match pending.front() {
                    Some(urb) => *urb,
                    None => return Err(report),
                };
                let len = report.len().min(urb.buffer_len);
                let mut reply = RetSubmit::new(urb.seqnum, 0, len).encode();
                reply.extend_from_slice(&report[..len]);
                if replies.send(reply).is_err() {
                    return Err(report);
                }
                pending.pop_front();
                trace!(seqnum = urb.seqnum, len, "Interrupt IN completed");
                Ok(())
            })
            .await?;
    }
}

struct Connection {
    device: Arc<HidDevice>,
    interrupt_in: Arc<InterruptIn>,
    replies: mpsc::UnboundedSender<Vec<u8>>,
}

impl Connection {
    fn reply(&self, bytes: Vec<u8>) -> Result<(), ConnectionError> {
        self.replies
            .send(bytes)
            .map_err(|_| ConnectionError::WriterClosed)
    }

    async fn run(&mut self, reader: &mut OwnedReadHalf) -> Result<(), ConnectionError> {
        loop {
            let command = match read_command(reader).await {
                Ok(command) => command,
                Err(err) if err.is_eof() => return Ok(()),
                Err(err) => {
                    warn!(error = %err, "Closing desynchronized USB/IP connection");
                    return Err(err.into());
                }
            };
            match command {
                Command::Submit {
                    header,
                    body,
                    buffer,
                    isochronous,
                } => self.submit(header, body, buffer, isochronous).await?,
                Command::Unlink { header, body } => self.unlink(header, body)?,
            }
        }
    }

    async fn submit(
        &self,
        header: HeaderBasic,
        body: SubmitBody,
        buffer: Vec<u8>,
        isochronous: bool,
    ) -> Result<(), ConnectionError> {
        let seqnum = header.seqnum;
        trace!(
            seqnum,
            endpoint = header.endpoint,
            direction = ?header.direction,
            length = body.transfer_buffer_length,
            "USBIP_CMD_SUBMIT"
        );

        if isochronous {
            debug!(seqnum, "Isochronous transfers are not supported");
            return self.reply(RetSubmit::new(seqnum, STATUS_STALL, 0).encode());
        }

        match (header.endpoint, header.direction) {
            (0, direction) => {
                let setup = SetupPacket::parse(&body.setup);
                let reply = match self.device.control_transfer(setup, &buffer) {
                    Ok(mut data) if direction == Direction::In => {
                        data.truncate(body.transfer_buffer_length as usize);
                        let mut reply = RetSubmit::new(seqnum, 0, data.len()).encode();
                        reply.extend_from_slice(&data);
                        reply
                    }
                    Ok(_) => RetSubmit::new(seqnum, 0, buffer.len()).encode(),
                    Err(Stall) => RetSubmit::new(seqnum, STATUS_STALL, 0).encode(),
                };
                self.reply(reply)
            }
            (endpoint, Direction::Out) if endpoint == u32::from(ENDPOINT_INTERRUPT_OUT) => {
                let len = buffer.len();
                self.device.submit_interrupt_out(buffer).await?;
                self.reply(RetSubmit::new(seqnum, 0, len).encode())
            }
            (endpoint, Direction::In) if endpoint == u32::from(ENDPOINT_INTERRUPT_IN & 0x7f) => {
                self.interrupt_in.park(PendingIn {
                    seqnum,
                    buffer_len: body.transfer_buffer_length as usize,
                });
                Ok(())
            }
            (endpoint, direction) => {
                debug!(seqnum, endpoint, ?direction, "Transfer on unknown endpoint");
                self.reply(RetSubmit::new(seqnum, STATUS_STALL, 0).encode())
            }
        }
    }

    fn unlink(&self, header: HeaderBasic, body: UnlinkBody) -> Result<(), ConnectionError> {
        let mut pending = self.interrupt_in.pending();
        let parked = pending
            .iter()
            .position(|urb| urb.seqnum == body.unlink_seqnum);
        let status = match parked.and_then(|index| pending.remove(index)) {
            Some(_) => STATUS_CANCELLED,
            // Already answered
            None => 0,
        };
        debug!(
            seqnum = header.seqnum,
            unlink_seqnum = body.unlink_seqnum,
            status,
            "USBIP_CMD_UNLINK"
        );
        self.reply(
            RetUnlink {
                seqnum: header.seqnum,
                status,
            }
            .encode(),
        )
    }
}

fn spawn_named<T>(
    _name: &str,
    task: impl std::future::Future<Output = T> + Send + 'static,
) -> tokio::task::JoinHandle<T>
where
    T: Send + 'static,
{
    #[cfg(tokio_unstable)]
    return tokio::task::Builder::new().name(_name).spawn(task);

    #[cfg(not(tokio_unstable))]
    tokio::spawn(task)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::AsyncReadExt;

    use super::*;
    use crate::codec::read_payload;
    use crate::descriptors::DeviceConfig;

    const REPORT_DESCRIPTOR: [u8; 4] = [0x06, 0xd0, 0xf1, 0xc0];

    async fn start() -> (SocketAddr, Arc<HidDevice>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let device = Arc::new(HidDevice::new(
            DeviceConfig::default(),
            &REPORT_DESCRIPTOR,
            8,
        ));
        tokio::spawn(UsbIpServer::serve(listener, device.clone()));
        (addr, device)
    }

    async fn request_import(stream: &mut TcpStream, bus_id: &str) -> OpHeader {
        let mut request = OpHeader {
            version: USBIP_VERSION,
            code: OP_REQ_IMPORT,
            status: 0,
        }
        .encode();
        ImportRequest {
            bus_id: bus_id.into(),
        }
        .encode_into(&mut request);
        stream.write_all(&request).await.unwrap();
        read_record(stream).await.unwrap()
    }

    async fn import(addr: SocketAddr) -> TcpStream {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        assert_eq!(
            request_import(&mut stream, "1-1").await,
            OpHeader::reply(OP_REP_IMPORT, OP_STATUS_OK)
        );
        let record: DeviceRecord = read_record(&mut stream).await.unwrap();
        assert_eq!(record.bus_id, "1-1");
        stream
    }

    fn submit(
        seqnum: u32,
        endpoint: u32,
        direction: Direction,
        length: u32,
        setup: [u8; 8],
        buffer: Vec<u8>,
    ) -> Vec<u8> {
        encode_command(&Command::Submit {
            header: HeaderBasic {
                command: USBIP_CMD_SUBMIT,
                seqnum,
                devid: 0x0001_0001,
                direction,
                endpoint,
            },
            body: SubmitBody {
                transfer_flags: 0,
                transfer_buffer_length: length,
                start_frame: 0,
                number_of_packets: 0,
                interval: 5,
                setup,
            },
            buffer,
            isochronous: false,
        })
    }

    fn unlink(seqnum: u32, unlink_seqnum: u32) -> Vec<u8> {
        encode_command(&Command::Unlink {
            header: HeaderBasic {
                command: USBIP_CMD_UNLINK,
                seqnum,
                devid: 0x0001_0001,
                direction: Direction::Out,
                endpoint: 0,
            },
            body: UnlinkBody { unlink_seqnum },
        })
    }

    async fn read_ret_submit(stream: &mut TcpStream) -> (RetSubmit, Vec<u8>) {
        let ret: RetSubmit = read_record(stream).await.unwrap();
        let data = read_payload(stream, ret.actual_length as usize)
            .await
            .unwrap();
        (ret, data)
    }

    #[tokio::test]
    async fn device_list() {
        let (addr, device) = start().await;
        let mut stream = TcpStream::connect(addr).await.unwrap();

        stream
            .write_all(&OpHeader::reply(OP_REQ_DEVLIST, 0).encode())
            .await
            .unwrap();

        let header: OpHeader = read_record(&mut stream).await.unwrap();
        assert_eq!(header, OpHeader::reply(OP_REP_DEVLIST, OP_STATUS_OK));
        let count: DeviceCount = read_record(&mut stream).await.unwrap();
        assert_eq!(count, DeviceCount(1));
        let record: DeviceRecord = read_record(&mut stream).await.unwrap();
        assert_eq!(record, device.device_record());
        assert_eq!(record.num_interfaces, 1);
        let interface: InterfaceRecord = read_record(&mut stream).await.unwrap();
        assert_eq!(interface.class, 3);
    }

    #[tokio::test]
    async fn import_unknown_bus_id_keeps_negotiating() {
        let (addr, _device) = start().await;
        let mut stream = TcpStream::connect(addr).await.unwrap();

        assert_eq!(
            request_import(&mut stream, "9-9").await,
            OpHeader::reply(OP_REP_IMPORT, OP_STATUS_ERROR)
        );
        assert_eq!(
            request_import(&mut stream, "1-1").await,
            OpHeader::reply(OP_REP_IMPORT, OP_STATUS_OK)
        );
    }

    #[tokio::test]
    async fn control_get_device_descriptor() {
        let (addr, device) = start().await;
        let mut stream = import(addr).await;

        let setup = [0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x40, 0x00];
        stream
            .write_all(&submit(1, 0, Direction::In, 64, setup, vec![]))
            .await
            .unwrap();

        let (ret, data) = read_ret_submit(&mut stream).await;
        assert_eq!(ret.seqnum, 1);
        assert_eq!(ret.status, 0);
        assert_eq!(data, device.descriptors().device());
    }

    #[tokio::test]
    async fn control_unsupported_request_stalls() {
        let (addr, _device) = start().await;
        let mut stream = import(addr).await;

        let setup = [0xc0, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];
        stream
            .write_all(&submit(2, 0, Direction::In, 0, setup, vec![]))
            .await
            .unwrap();

        let (ret, data) = read_ret_submit(&mut stream).await;
        assert_eq!(ret.seqnum, 2);
        assert_eq!(ret.status, STATUS_STALL);
        assert!(data.is_empty());
    }

    #[tokio::test]
    async fn interrupt_out_reaches_device() {
        let (addr, device) = start().await;
        let mut stream = import(addr).await;

        stream
            .write_all(&submit(3, 1, Direction::Out, 64, [0; 8], vec![0xab; 64]))
            .await
            .unwrap();

        let (ret, _) = read_ret_submit(&mut stream).await;
        assert_eq!((ret.seqnum, ret.status, ret.actual_length), (3, 0, 64));
        assert_eq!(device.read_interrupt_out().await.unwrap(), vec![0xab; 64]);
    }

    #[tokio::test]
    async fn interrupt_in_waits_for_report() {
        let (addr, device) = start().await;
        let mut stream = import(addr).await;

        stream
            .write_all(&submit(4, 1, Direction::In, 64, [0; 8], vec![]))
            .await
            .unwrap();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            device.write_interrupt_in(vec![0x5a; 64]).await.unwrap();
        });

        let (ret, data) = read_ret_submit(&mut stream).await;
        assert_eq!(ret.seqnum, 4);
        assert_eq!(ret.status, 0);
        assert_eq!(data, vec![0x5a; 64]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn parked_interrupt_in_served_in_submission_order() {
        for _ in 0..10 {
            let (addr, device) = start().await;
            let mut stream = import(addr).await;

            let submits: Vec<u8> = (1..=8)
                .flat_map(|seqnum| submit(seqnum, 1, Direction::In, 64, [0; 8], vec![]))
                .collect();
            stream.write_all(&submits).await.unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
            for i in 1..=8u8 {
                device.write_interrupt_in(vec![i; 64]).await.unwrap();
            }

            for seqnum in 1..=8u32 {
                let (ret, data) = read_ret_submit(&mut stream).await;
                assert_eq!(ret.seqnum, seqnum);
                assert_eq!(data, vec![seqnum as u8; 64]);
            }
        }
    }

    #[tokio::test]
    async fn unlink_middle_parked_in_keeps_order() {
        let (addr, device) = start().await;
        let mut stream = import(addr).await;

        for seqnum in 20..=22 {
            stream
                .write_all(&submit(seqnum, 1, Direction::In, 64, [0; 8], vec![]))
                .await
                .unwrap();
        }
        stream.write_all(&unlink(23, 21)).await.unwrap();
        let ret: RetUnlink = read_record(&mut stream).await.unwrap();
        assert_eq!(
            ret,
            RetUnlink {
                seqnum: 23,
                status: STATUS_CANCELLED
            }
        );

        device.write_interrupt_in(vec![1; 64]).await.unwrap();
        device.write_interrupt_in(vec![2; 64]).await.unwrap();

        let (ret, data) = read_ret_submit(&mut stream).await;
        assert_eq!((ret.seqnum, data[0]), (20, 1));
        let (ret, data) = read_ret_submit(&mut stream).await;
        assert_eq!((ret.seqnum, data[0]), (22, 2));
    }

    #[tokio::test]
    async fn unlink_pending_in_then_report_goes_to_next_submit() {
        let (addr, device) = start().await;
        let mut stream = import(addr).await;

        stream
            .write_all(&submit(5, 1, Direction::In, 64, [0; 8], vec![]))
            .await
            .unwrap();
        stream.write_all(&unlink(6, 5)).await.unwrap();

        let ret: RetUnlink = read_record(&mut stream).await.unwrap();
        assert_eq!(
            ret,
            RetUnlink {
                seqnum: 6,
                status: STATUS_CANCELLED
            }
        );

        device.write_interrupt_in(vec![0x11; 64]).await.unwrap();
        stream
            .write_all(&submit(7, 1, Direction::In, 64, [0; 8], vec![]))
            .await
            .unwrap();

        let (ret, data) = read_ret_submit(&mut stream).await;
        assert_eq!(ret.seqnum, 7);
        assert_eq!(data, vec![0x11; 64]);
    }

    #[tokio::test]
    async fn unlink_completed_submit_is_acknowledged() {
        let (addr, _device) = start().await;
        let mut stream = import(addr).await;

        let setup = [0x80, 0x08, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00];
        stream
            .write_all(&submit(8, 0, Direction::In, 1, setup, vec![]))
            .await
            .unwrap();
        let (ret, data) = read_ret_submit(&mut stream).await;
        assert_eq!((ret.seqnum, data), (8, vec![0]));

        stream.write_all(&unlink(9, 8)).await.unwrap();
        let ret: RetUnlink = read_record(&mut stream).await.unwrap();
        assert_eq!(ret, RetUnlink { seqnum: 9, status: 0 });
    }

    #[tokio::test]
    async fn isochronous_submit_fails() {
        let (addr, _device) = start().await;
        let mut stream = import(addr).await;

        let mut bytes = submit(10, 1, Direction::In, 0, [0; 8], vec![]);
        // number_of_packets
        bytes[20 + 12..20 + 16].copy_from_slice(&1u32.to_be_bytes());
        bytes.extend_from_slice(&[0; 16]);
        stream.write_all(&bytes).await.unwrap();

        let (ret, _) = read_ret_submit(&mut stream).await;
        assert_eq!((ret.seqnum, ret.status), (10, STATUS_STALL));
    }

    #[tokio::test]
    async fn unknown_command_closes_connection() {
        let (addr, _device) = start().await;
        let mut stream = import(addr).await;

        let mut bytes = unlink(11, 0);
        bytes[3] = 0x09;
        stream.write_all(&bytes).await.unwrap();

        // Closed, possibly with a reset since the body was never read
        let mut buf = [0u8; 1];
        assert!(matches!(stream.read(&mut buf).await, Ok(0) | Err(_)));
    }
}

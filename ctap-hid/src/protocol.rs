use std::{
    collections::{HashMap, VecDeque},
    convert::Infallible,
    fmt,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll, Waker},
};

use futures::{Future, Sink, Stream};
use tokio::time::{sleep, Instant, Sleep};
use tracing::{debug, info, trace, warn};

use crate::{
    api::CtapHidApi,
    channel::{ChannelId, Channels},
    packet::Packet,
    request::Request,
    response::{KeepAliveStatus, Response, ResponseMessage},
    CommandType, ErrorCode, CTAP2_ERR_KEEPALIVE_CANCEL, CTAPHID_PROTOCOL_VERSION,
    KEEPALIVE_INTERVAL, MAX_PAYLOAD_LEN, PACKET_TIMEOUT,
};

type ResponseFuture<E> = Pin<Box<dyn Future<Output = Result<Response, E>> + Send>>;

/// CTAPHID state machine: consumes request packets as a [`Sink`] and yields response packets
/// as a [`Stream`].
///
/// Any number of channels may be reassembling messages at once, but only one MSG, CBOR or WINK
/// transaction is processed at a time.
pub struct Protocol<Api: CtapHidApi> {
    service: Arc<Api>,
    channels: HashMap<ChannelId, ChannelState>,
    channel_allocator: Channels,
    transaction: Option<Transaction<Api::Error>>,
    lock: Option<ChannelLock>,
    output: VecDeque<Packet>,
    output_waker: Option<Waker>,
}

enum ChannelState {
    Ready,
    Receiving {
        command: CommandType,
        payload: Vec<u8>,
        payload_len: usize,
        next_sequence_number: u8,
        last_packet: Instant,
    },
}

struct Transaction<E> {
    channel_id: ChannelId,
    command: CommandType,
    future: ResponseFuture<E>,
    keepalive: Pin<Box<Sleep>>,
}

#[derive(Debug, Clone, Copy)]
struct ChannelLock {
    channel_id: ChannelId,
    expires: Instant,
}

impl<Api: CtapHidApi> Protocol<Api> {
    pub fn new(service: Api) -> Self {
        Protocol {
            service: Arc::new(service),
            channels: HashMap::new(),
            channel_allocator: Channels::new(),
            transaction: None,
            lock: None,
            output: VecDeque::new(),
            output_waker: None,
        }
    }

    /// Handles one packet from the host. Problems with the packet are answered on the wire.
    pub fn receive(&mut self, packet: Packet) {
        trace!(channel_id = %packet.channel_id(), ?packet, "Received packet");
        self.expire_lock();
        match packet {
            Packet::Initialization {
                channel_id,
                command,
                data,
                payload_len,
            } => self.receive_initialization(channel_id, command, data, payload_len.into()),
            Packet::Continuation {
                channel_id,
                sequence_number,
                data,
            } => self.receive_continuation(channel_id, sequence_number, data),
        }
    }

    /// Next packet for the host, either queued output or progress of the current transaction.
    pub fn poll_output(&mut self, cx: &mut Context<'_>) -> Poll<Packet> {
        self.expire_lock();
        self.poll_transaction(cx);

        match self.output.pop_front() {
            Some(packet) => Poll::Ready(packet),
            None => {
                self.output_waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }

    fn receive_initialization(
        &mut self,
        channel_id: ChannelId,
        command: CommandType,
        mut data: Vec<u8>,
        payload_len: usize,
    ) {
        if payload_len > MAX_PAYLOAD_LEN {
            return self.send_error(channel_id, ErrorCode::InvalidMessageLength);
        }

        if command == CommandType::Init {
            // INIT always fits in one packet and is allowed on the broadcast channel.
            if payload_len > data.len() {
                return self.send_error(channel_id, ErrorCode::InvalidMessageLength);
            }
            data.truncate(payload_len);
            return self.dispatch(channel_id, command, data);
        }

        if let Err(code) = self.check_channel(channel_id) {
            return self.send_error(channel_id, code);
        }

        if command == CommandType::Cancel {
            return self.cancel(channel_id);
        }

        if let Some(ChannelState::Receiving {
            command: interrupted,
            last_packet,
            ..
        }) = self.channels.insert(channel_id, ChannelState::Ready)
        {
            if last_packet.elapsed() <= *PACKET_TIMEOUT {
                debug!(
                    %channel_id,
                    command = %interrupted,
                    "Initialization packet interrupted message"
                );
                return self.send_error(channel_id, ErrorCode::InvalidMessageSequencing);
            }
            debug!(%channel_id, command = %interrupted, "Discarding abandoned message");
        }

        if data.len() >= payload_len {
            data.truncate(payload_len);
            self.dispatch(channel_id, command, data);
        } else {
            self.channels.insert(
                channel_id,
                ChannelState::Receiving {
                    command,
                    payload: data,
                    payload_len,
                    next_sequence_number: 0,
                    last_packet: Instant::now(),
                },
            );
        }
    }

    fn receive_continuation(&mut self, channel_id: ChannelId, sequence_number: u8, data: Vec<u8>) {
        if let Err(code) = self.check_channel(channel_id) {
            return self.send_error(channel_id, code);
        }

        let state = self.channels.insert(channel_id, ChannelState::Ready);
        let (command, mut payload, payload_len, next_sequence_number, last_packet) = match state {
            Some(ChannelState::Receiving {
                command,
                payload,
                payload_len,
                next_sequence_number,
                last_packet,
            }) => (
                command,
                payload,
                payload_len,
                next_sequence_number,
                last_packet,
            ),
            _ => {
                debug!(%channel_id, sequence_number, "Continuation packet without a message");
                return self.send_error(channel_id, ErrorCode::InvalidMessageSequencing);
            }
        };

        if last_packet.elapsed() > *PACKET_TIMEOUT {
            debug!(%channel_id, %command, "Message timed out");
            return self.send_error(channel_id, ErrorCode::MessageTimedOut);
        }

        if sequence_number != next_sequence_number {
            debug!(
                %channel_id,
                sequence_number, next_sequence_number, "Out of order continuation packet"
            );
            return self.send_error(channel_id, ErrorCode::InvalidMessageSequencing);
        }

        payload.extend_from_slice(&data);
        if payload.len() >= payload_len {
            payload.truncate(payload_len);
            self.dispatch(channel_id, command, payload);
        } else {
            self.channels.insert(
                channel_id,
                ChannelState::Receiving {
                    command,
                    payload,
                    payload_len,
                    next_sequence_number: next_sequence_number.wrapping_add(1),
                    last_packet: Instant::now(),
                },
            );
        }
    }

    /// Channels other than INIT's must be allocated and not locked out.
    fn check_channel(&self, channel_id: ChannelId) -> Result<(), ErrorCode> {
        if !self.channel_allocator.is_allocated(channel_id) {
            debug!(%channel_id, "Packet on unallocated channel");
            return Err(ErrorCode::InvalidChannel);
        }
        match self.lock {
            Some(lock) if lock.channel_id != channel_id => {
                debug!(%channel_id, locked_by = %lock.channel_id, "Device is locked");
                Err(ErrorCode::ChannelBusy)
            }
            _ => Ok(()),
        }
    }

    fn dispatch(&mut self, channel_id: ChannelId, command: CommandType, payload: Vec<u8>) {
        let request = match Request::decode(command, &payload) {
            Ok(request) => request,
            Err(err) => {
                debug!(%channel_id, %command, %err, "Invalid request");
                return self.send_error(channel_id, err.error_code());
            }
        };
        debug!(%channel_id, %command, len = payload.len(), "Dispatching request");

        let service = Arc::clone(&self.service);
        match request {
            Request::Init { nonce } => self.init(channel_id, nonce),
            Request::Cancel => self.cancel(channel_id),
            Request::Ping { data } => self.send_response(channel_id, Response::Ping { data }),
            Request::Lock { lock_time } => {
                self.lock = if lock_time.is_zero() {
                    None
                } else {
                    Some(ChannelLock {
                        channel_id,
                        expires: Instant::now() + lock_time,
                    })
                };
                self.send_response(channel_id, Response::Lock);
            }
            Request::Msg { data } => self.start_transaction(channel_id, command, async move {
                service.msg(data).await.map(|data| Response::Msg { data })
            }),
            Request::Cbor { data } => self.start_transaction(channel_id, command, async move {
                service.cbor(data).await.map(|data| Response::Cbor { data })
            }),
            Request::Wink => self.start_transaction(channel_id, command, async move {
                service.wink().await.map(|()| Response::Wink)
            }),
        }
    }

    fn init(&mut self, channel_id: ChannelId, nonce: [u8; 8]) {
        let new_channel_id = if channel_id.is_broadcast() {
            match self.channel_allocator.allocate() {
                Some(new_channel_id) => new_channel_id,
                None => {
                    warn!("Channel identifiers exhausted");
                    return self.send_error(channel_id, ErrorCode::Other);
                }
            }
        } else if self.channel_allocator.is_allocated(channel_id) {
            if matches!(&self.transaction, Some(transaction) if transaction.channel_id == channel_id)
            {
                debug!(%channel_id, "Resync aborted transaction");
                self.transaction = None;
            }
            channel_id
        } else {
            return self.send_error(channel_id, ErrorCode::InvalidChannel);
        };

        info!(%channel_id, %new_channel_id, "Channel initialized");
        self.channels.insert(new_channel_id, ChannelState::Ready);

        let version = self.service.version();
        self.send_response(
            channel_id,
            Response::Init {
                nonce,
                new_channel_id,
                ctaphid_protocol_version: CTAPHID_PROTOCOL_VERSION,
                major_device_version_number: version.major,
                minor_device_version_number: version.minor,
                build_device_version_number: version.build,
                capabilities: version.capabilities,
            },
        );
    }

    fn cancel(&mut self, channel_id: ChannelId) {
        match &self.transaction {
            Some(transaction)
                if transaction.channel_id == channel_id
                    && transaction.command == CommandType::Cbor =>
            {
                debug!(%channel_id, "Cancelled transaction");
                self.transaction = None;
                self.send_response(
                    channel_id,
                    Response::Cbor {
                        data: vec![CTAP2_ERR_KEEPALIVE_CANCEL],
                    },
                );
            }
            _ => trace!(%channel_id, "Nothing to cancel"),
        }
    }

    fn start_transaction<F>(&mut self, channel_id: ChannelId, command: CommandType, future: F)
    where
        F: Future<Output = Result<Response, Api::Error>> + Send + 'static,
    {
        if let Some(transaction) = &self.transaction {
            debug!(
                %channel_id,
                busy_channel_id = %transaction.channel_id,
                "Transaction already in progress"
            );
            return self.send_error(channel_id, ErrorCode::ChannelBusy);
        }

        self.transaction = Some(Transaction {
            channel_id,
            command,
            future: Box::pin(future),
            keepalive: Box::pin(sleep(*KEEPALIVE_INTERVAL)),
        });
        self.wake_output();
    }

    fn poll_transaction(&mut self, cx: &mut Context<'_>) {
        let transaction = match self.transaction.as_mut() {
            Some(transaction) => transaction,
            None => return,
        };
        let channel_id = transaction.channel_id;
        let command = transaction.command;

        let result = match transaction.future.as_mut().poll(cx) {
            Poll::Ready(result) => result,
            Poll::Pending => {
                while transaction.keepalive.as_mut().poll(cx).is_ready() {
                    trace!(%channel_id, "Sending keepalive");
                    transaction
                        .keepalive
                        .as_mut()
                        .reset(Instant::now() + *KEEPALIVE_INTERVAL);
                    self.output.extend(
                        ResponseMessage {
                            channel_id,
                            response: Response::KeepAlive {
                                status: KeepAliveStatus::Processing,
                            },
                        }
                        .to_packets(),
                    );
                }
                return;
            }
        };
        self.transaction = None;

        let response = match result {
            Ok(response) if payload_len(&response) > MAX_PAYLOAD_LEN => {
                warn!(%channel_id, %command, len = payload_len(&response), "Response too long");
                Response::Error {
                    code: ErrorCode::Other,
                }
            }
            Ok(response) => response,
            Err(err) => {
                warn!(%channel_id, %command, ?err, "Error processing request");
                Response::Error {
                    code: ErrorCode::Other,
                }
            }
        };
        self.send_response(channel_id, response);
    }

    fn expire_lock(&mut self) {
        if let Some(lock) = self.lock {
            if lock.expires <= Instant::now() {
                debug!(channel_id = %lock.channel_id, "Lock expired");
                self.lock = None;
            }
        }
    }

    fn send_error(&mut self, channel_id: ChannelId, code: ErrorCode) {
        self.send_response(channel_id, Response::Error { code });
    }

    fn send_response(&mut self, channel_id: ChannelId, response: Response) {
        trace!(%channel_id, ?response, "Queueing response");
        self.output.extend(
            ResponseMessage {
                channel_id,
                response,
            }
            .to_packets(),
        );
        self.wake_output();
    }

    fn wake_output(&mut self) {
        if let Some(waker) = self.output_waker.take() {
            waker.wake()
        }
    }
}

fn payload_len(response: &Response) -> usize {
    match response {
        Response::Ping { data } | Response::Msg { data } | Response::Cbor { data } => data.len(),
        _ => 0,
    }
}

impl<Api: CtapHidApi> fmt::Debug for Protocol<Api> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Protocol")
            .field("channels", &self.channels.len())
            .field("transaction", &self.transaction.as_ref().map(|t| t.channel_id))
            .field("lock", &self.lock)
            .field("output", &self.output.len())
            .finish()
    }
}

impl<Api: CtapHidApi> Sink<Packet> for Protocol<Api> {
    type Error = Infallible;

    fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn start_send(self: Pin<&mut Self>, packet: Packet) -> Result<(), Self::Error> {
        self.get_mut().receive(packet);
        Ok(())
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }
}

impl<Api: CtapHidApi> Stream for Protocol<Api> {
    type Item = Packet;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().poll_output(cx).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use std::{cmp, io, time::Duration};

    use async_trait::async_trait;
    use futures::{poll, SinkExt, StreamExt};

    use crate::{
        api::VersionInfo,
        channel::BROADCAST_CHANNEL_ID,
        packet::{CONTINUATION_PACKET_DATA_LEN, INITIAL_PACKET_DATA_LEN},
        request::RequestMessage,
        CapabilityFlags,
    };

    use super::*;

    #[derive(Default)]
    struct FakeApi {
        delay: Duration,
        fail: bool,
    }

    impl FakeApi {
        async fn respond(&self, data: &[u8]) -> Result<Vec<u8>, io::Error> {
            if !self.delay.is_zero() {
                sleep(self.delay).await;
            }
            if self.fail {
                return Err(io::Error::new(io::ErrorKind::Other, "fake failure"));
            }
            Ok(data.to_vec())
        }
    }

    #[async_trait]
    impl CtapHidApi for FakeApi {
        type Error = io::Error;

        fn version(&self) -> VersionInfo {
            VersionInfo {
                major: 1,
                minor: 2,
                build: 3,
                capabilities: CapabilityFlags::WINK | CapabilityFlags::CBOR,
            }
        }
        async fn wink(&self) -> Result<(), Self::Error> {
            Ok(())
        }
        async fn msg(&self, _msg: Vec<u8>) -> Result<Vec<u8>, Self::Error> {
            self.respond(b"msg").await
        }
        async fn cbor(&self, _cbor: Vec<u8>) -> Result<Vec<u8>, Self::Error> {
            self.respond(b"cbor").await
        }
    }

    async fn send_request(protocol: &mut Protocol<FakeApi>, channel_id: ChannelId, request: Request) {
        let request_message = RequestMessage {
            channel_id,
            request,
        };

        for packet in request_message.to_packets() {
            protocol.send(packet).await.unwrap();
        }
    }

    async fn next_response(protocol: &mut Protocol<FakeApi>) -> ResponseMessage {
        let first = protocol.next().await.unwrap();
        let payload_len = match &first {
            Packet::Initialization { payload_len, .. } => *payload_len as usize,
            other => panic!("expected an initialization packet, got {:?}", other),
        };

        let mut packets = vec![first];
        let mut received = cmp::min(payload_len, INITIAL_PACKET_DATA_LEN);
        while received < payload_len {
            packets.push(protocol.next().await.unwrap());
            received += CONTINUATION_PACKET_DATA_LEN;
        }

        ResponseMessage::decode(&packets).unwrap().unwrap()
    }

    async fn init_channel(protocol: &mut Protocol<FakeApi>) -> ChannelId {
        send_request(
            protocol,
            BROADCAST_CHANNEL_ID,
            Request::Init {
                nonce: [0, 1, 2, 3, 4, 5, 6, 7],
            },
        )
        .await;

        match next_response(protocol).await {
            ResponseMessage {
                channel_id: BROADCAST_CHANNEL_ID,
                response: Response::Init { new_channel_id, .. },
            } => new_channel_id,
            other => panic!("unexpected response {:?}", other),
        }
    }

    fn error(channel_id: ChannelId, code: ErrorCode) -> ResponseMessage {
        ResponseMessage {
            channel_id,
            response: Response::Error { code },
        }
    }

    #[tokio::test]
    async fn init() {
        let mut protocol = Protocol::new(FakeApi::default());
        let init_request = RequestMessage {
            channel_id: BROADCAST_CHANNEL_ID,
            request: Request::Init {
                nonce: [0, 1, 2, 3, 4, 5, 6, 7],
            },
        };

        for packet in init_request.to_packets() {
            protocol.send(packet).await.unwrap();
        }

        assert_eq!(
            protocol.next().await,
            Some(Packet::Initialization {
                channel_id: BROADCAST_CHANNEL_ID,
                command: CommandType::Init,
                data: vec![0, 1, 2, 3, 4, 5, 6, 7, 0, 0, 0, 1, 2, 1, 2, 3, 5],
                payload_len: 17,
            })
        );
    }

    #[tokio::test]
    async fn init_allocates_distinct_channels() {
        let mut protocol = Protocol::new(FakeApi::default());

        let first = init_channel(&mut protocol).await;
        let second = init_channel(&mut protocol).await;

        assert_ne!(first, second);
        assert!(!first.is_broadcast());
        assert!(!second.is_broadcast());
    }

    #[tokio::test(start_paused = true)]
    async fn init_on_allocated_channel_resyncs() {
        let mut protocol = Protocol::new(FakeApi {
            delay: Duration::from_secs(10),
            ..Default::default()
        });
        let channel_id = init_channel(&mut protocol).await;

        send_request(&mut protocol, channel_id, Request::Cbor { data: vec![1] }).await;
        send_request(
            &mut protocol,
            channel_id,
            Request::Init {
                nonce: [9, 9, 9, 9, 9, 9, 9, 9],
            },
        )
        .await;

        assert_matches::assert_matches!(
            next_response(&mut protocol).await,
            ResponseMessage {
                channel_id: response_channel,
                response: Response::Init { new_channel_id, nonce: [9, 9, 9, 9, 9, 9, 9, 9], .. },
            } if response_channel == channel_id && new_channel_id == channel_id
        );
        // The aborted transaction never answers.
        assert!(poll!(protocol.next()).is_pending());
    }

    #[tokio::test]
    async fn ping() {
        let mut protocol = Protocol::new(FakeApi::default());
        let channel_id = init_channel(&mut protocol).await;

        send_request(
            &mut protocol,
            channel_id,
            Request::Ping {
                data: (0..200).map(|i| i as u8).collect(),
            },
        )
        .await;

        assert_eq!(
            next_response(&mut protocol).await,
            ResponseMessage {
                channel_id,
                response: Response::Ping {
                    data: (0..200).map(|i| i as u8).collect(),
                }
            }
        );
    }

    #[tokio::test]
    async fn wink() {
        let mut protocol = Protocol::new(FakeApi::default());
        let channel_id = init_channel(&mut protocol).await;

        send_request(&mut protocol, channel_id, Request::Wink).await;

        assert_eq!(
            next_response(&mut protocol).await.response,
            Response::Wink
        );
    }

    #[tokio::test]
    async fn msg() {
        let mut protocol = Protocol::new(FakeApi::default());
        let channel_id = init_channel(&mut protocol).await;

        send_request(
            &mut protocol,
            channel_id,
            Request::Msg {
                data: (0u8..100).collect(),
            },
        )
        .await;

        assert_eq!(
            next_response(&mut protocol).await,
            ResponseMessage {
                channel_id,
                response: Response::Msg {
                    data: b"msg".to_vec()
                }
            }
        );
    }

    #[tokio::test]
    async fn cbor() {
        let mut protocol = Protocol::new(FakeApi::default());
        let channel_id = init_channel(&mut protocol).await;

        send_request(
            &mut protocol,
            channel_id,
            Request::Cbor {
                data: (0u8..100).collect(),
            },
        )
        .await;

        assert_eq!(
            next_response(&mut protocol).await.response,
            Response::Cbor {
                data: b"cbor".to_vec()
            }
        );
    }

    #[tokio::test]
    async fn service_error_answers_other() {
        let mut protocol = Protocol::new(FakeApi {
            fail: true,
            ..Default::default()
        });
        let channel_id = init_channel(&mut protocol).await;

        send_request(&mut protocol, channel_id, Request::Msg { data: vec![0] }).await;

        assert_eq!(
            next_response(&mut protocol).await,
            error(channel_id, ErrorCode::Other)
        );
    }

    #[tokio::test]
    async fn unallocated_and_reserved_channels_are_invalid() {
        let mut protocol = Protocol::new(FakeApi::default());
        init_channel(&mut protocol).await;

        for channel_id in [ChannelId(0), ChannelId(0x1234)] {
            send_request(&mut protocol, channel_id, Request::Ping { data: vec![1] }).await;
            assert_eq!(
                next_response(&mut protocol).await,
                error(channel_id, ErrorCode::InvalidChannel)
            );
        }
    }

    #[tokio::test]
    async fn only_init_on_broadcast_channel() {
        let mut protocol = Protocol::new(FakeApi::default());

        send_request(&mut protocol, BROADCAST_CHANNEL_ID, Request::Wink).await;

        assert_eq!(
            next_response(&mut protocol).await,
            error(BROADCAST_CHANNEL_ID, ErrorCode::InvalidChannel)
        );
    }

    #[tokio::test]
    async fn unknown_command_is_invalid() {
        let mut protocol = Protocol::new(FakeApi::default());
        let channel_id = init_channel(&mut protocol).await;

        protocol
            .send(Packet::Initialization {
                channel_id,
                command: CommandType::Unknown { identifier: 0x22 },
                data: vec![0; INITIAL_PACKET_DATA_LEN],
                payload_len: 0,
            })
            .await
            .unwrap();

        assert_eq!(
            next_response(&mut protocol).await,
            error(channel_id, ErrorCode::InvalidCommand)
        );
    }

    #[tokio::test]
    async fn declared_length_too_long() {
        let mut protocol = Protocol::new(FakeApi::default());
        let channel_id = init_channel(&mut protocol).await;

        protocol
            .send(Packet::Initialization {
                channel_id,
                command: CommandType::Msg,
                data: vec![0; INITIAL_PACKET_DATA_LEN],
                payload_len: (MAX_PAYLOAD_LEN + 1) as u16,
            })
            .await
            .unwrap();

        assert_eq!(
            next_response(&mut protocol).await,
            error(channel_id, ErrorCode::InvalidMessageLength)
        );
    }

    #[tokio::test]
    async fn interleaved_channels_reassemble_independently() {
        let mut protocol = Protocol::new(FakeApi::default());
        let first = init_channel(&mut protocol).await;
        let second = init_channel(&mut protocol).await;

        let first_data: Vec<u8> = (0..150).map(|i| i as u8).collect();
        let second_data: Vec<u8> = (0..150).map(|i| 255 - i as u8).collect();
        let first_packets = RequestMessage {
            channel_id: first,
            request: Request::Ping {
                data: first_data.clone(),
            },
        }
        .to_packets();
        let second_packets = RequestMessage {
            channel_id: second,
            request: Request::Ping {
                data: second_data.clone(),
            },
        }
        .to_packets();

        for (a, b) in first_packets.into_iter().zip(second_packets) {
            protocol.send(a).await.unwrap();
            protocol.send(b).await.unwrap();
        }

        assert_eq!(
            next_response(&mut protocol).await,
            ResponseMessage {
                channel_id: first,
                response: Response::Ping { data: first_data }
            }
        );
        assert_eq!(
            next_response(&mut protocol).await,
            ResponseMessage {
                channel_id: second,
                response: Response::Ping { data: second_data }
            }
        );
    }

    #[tokio::test]
    async fn out_of_order_continuation() {
        let mut protocol = Protocol::new(FakeApi::default());
        let channel_id = init_channel(&mut protocol).await;

        let mut packets = RequestMessage {
            channel_id,
            request: Request::Ping {
                data: vec![0; 200],
            },
        }
        .to_packets();
        packets.swap(1, 2);
        protocol.send(packets[0].clone()).await.unwrap();
        protocol.send(packets[1].clone()).await.unwrap();

        assert_eq!(
            next_response(&mut protocol).await,
            error(channel_id, ErrorCode::InvalidMessageSequencing)
        );

        // The channel recovers for the next message.
        send_request(&mut protocol, channel_id, Request::Ping { data: vec![7] }).await;
        assert_eq!(
            next_response(&mut protocol).await.response,
            Response::Ping { data: vec![7] }
        );
    }

    #[tokio::test]
    async fn continuation_without_initialization() {
        let mut protocol = Protocol::new(FakeApi::default());
        let channel_id = init_channel(&mut protocol).await;

        protocol
            .send(Packet::Continuation {
                channel_id,
                sequence_number: 0,
                data: vec![0; CONTINUATION_PACKET_DATA_LEN],
            })
            .await
            .unwrap();

        assert_eq!(
            next_response(&mut protocol).await,
            error(channel_id, ErrorCode::InvalidMessageSequencing)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn slow_continuation_times_out() {
        let mut protocol = Protocol::new(FakeApi::default());
        let channel_id = init_channel(&mut protocol).await;

        let packets = RequestMessage {
            channel_id,
            request: Request::Ping {
                data: vec![0; 100],
            },
        }
        .to_packets();
        protocol.send(packets[0].clone()).await.unwrap();
        tokio::time::advance(Duration::from_millis(600)).await;
        protocol.send(packets[1].clone()).await.unwrap();

        assert_eq!(
            next_response(&mut protocol).await,
            error(channel_id, ErrorCode::MessageTimedOut)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_message_does_not_block_next_request() {
        let mut protocol = Protocol::new(FakeApi::default());
        let channel_id = init_channel(&mut protocol).await;

        let packets = RequestMessage {
            channel_id,
            request: Request::Ping {
                data: vec![0; 100],
            },
        }
        .to_packets();
        protocol.send(packets[0].clone()).await.unwrap();
        tokio::time::advance(Duration::from_secs(5)).await;
        send_request(&mut protocol, channel_id, Request::Ping { data: vec![7] }).await;

        assert_eq!(
            next_response(&mut protocol).await,
            ResponseMessage {
                channel_id,
                response: Response::Ping { data: vec![7] }
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn busy_while_transaction_in_progress() {
        let mut protocol = Protocol::new(FakeApi {
            delay: Duration::from_secs(1),
            ..Default::default()
        });
        let first = init_channel(&mut protocol).await;
        let second = init_channel(&mut protocol).await;

        send_request(&mut protocol, first, Request::Cbor { data: vec![4] }).await;
        send_request(&mut protocol, second, Request::Cbor { data: vec![4] }).await;

        assert_eq!(
            next_response(&mut protocol).await,
            error(second, ErrorCode::ChannelBusy)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn keepalive_while_processing() {
        let mut protocol = Protocol::new(FakeApi {
            delay: Duration::from_millis(120),
            ..Default::default()
        });
        let channel_id = init_channel(&mut protocol).await;

        send_request(&mut protocol, channel_id, Request::Cbor { data: vec![4] }).await;

        let keepalive = ResponseMessage {
            channel_id,
            response: Response::KeepAlive {
                status: KeepAliveStatus::Processing,
            },
        };
        assert_eq!(next_response(&mut protocol).await, keepalive);
        assert_eq!(next_response(&mut protocol).await, keepalive);
        assert_eq!(
            next_response(&mut protocol).await.response,
            Response::Cbor {
                data: b"cbor".to_vec()
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_cbor_transaction() {
        let mut protocol = Protocol::new(FakeApi {
            delay: Duration::from_secs(10),
            ..Default::default()
        });
        let channel_id = init_channel(&mut protocol).await;

        send_request(&mut protocol, channel_id, Request::Cbor { data: vec![4] }).await;
        send_request(&mut protocol, channel_id, Request::Cancel).await;

        assert_eq!(
            next_response(&mut protocol).await,
            ResponseMessage {
                channel_id,
                response: Response::Cbor {
                    data: vec![CTAP2_ERR_KEEPALIVE_CANCEL]
                }
            }
        );
        assert!(poll!(protocol.next()).is_pending());
    }

    #[tokio::test]
    async fn cancel_without_transaction_is_ignored() {
        let mut protocol = Protocol::new(FakeApi::default());
        let channel_id = init_channel(&mut protocol).await;

        send_request(&mut protocol, channel_id, Request::Cancel).await;

        assert!(poll!(protocol.next()).is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn lock_excludes_other_channels_until_expiry() {
        let mut protocol = Protocol::new(FakeApi::default());
        let owner = init_channel(&mut protocol).await;
        let other = init_channel(&mut protocol).await;

        send_request(
            &mut protocol,
            owner,
            Request::Lock {
                lock_time: Duration::from_secs(1),
            },
        )
        .await;
        assert_eq!(next_response(&mut protocol).await.response, Response::Lock);

        send_request(&mut protocol, other, Request::Ping { data: vec![1] }).await;
        assert_eq!(
            next_response(&mut protocol).await,
            error(other, ErrorCode::ChannelBusy)
        );

        send_request(&mut protocol, owner, Request::Ping { data: vec![2] }).await;
        assert_eq!(
            next_response(&mut protocol).await.response,
            Response::Ping { data: vec![2] }
        );

        tokio::time::advance(Duration::from_millis(1100)).await;
        send_request(&mut protocol, other, Request::Ping { data: vec![3] }).await;
        assert_eq!(
            next_response(&mut protocol).await,
            ResponseMessage {
                channel_id: other,
                response: Response::Ping { data: vec![3] }
            }
        );
    }
}

use std::{
    pin::Pin,
    task::{Context, Poll},
};

use futures::{ready, Future, Sink, Stream};
use pin_project::pin_project;
use tracing::{debug, trace};

use crate::{api::CtapHidApi, packet::Packet, protocol::Protocol};

/// Pumps HID reports between a transport and the [`Protocol`] until the input ends.
///
/// Input and output are separate halves so the reports can come from and go to different
/// endpoints of the same device.
#[pin_project]
pub struct Server<Api: CtapHidApi, I, O> {
    protocol: Protocol<Api>,
    send_buffer: Option<Packet>,
    flushing: bool,
    #[pin]
    input: I,
    #[pin]
    output: O,
}

impl<Api, I, O, E> Server<Api, I, O>
where
    Api: CtapHidApi,
    I: Stream<Item = Result<Packet, E>>,
    O: Sink<Packet, Error = E>,
{
    pub fn new(service: Api, input: I, output: O) -> Server<Api, I, O> {
        Server {
            protocol: Protocol::new(service),
            send_buffer: None,
            flushing: false,
            input,
            output,
        }
    }
}

impl<Api, I, O, E> Future for Server<Api, I, O>
where
    Api: CtapHidApi,
    I: Stream<Item = Result<Packet, E>>,
    O: Sink<Packet, Error = E>,
{
    type Output = Result<(), E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut this = self.project();
        loop {
            // Finish writing what was sent before looking for more work
            if *this.flushing {
                ready!(this.output.as_mut().poll_flush(cx))?;
                *this.flushing = false;
            }

            if let Some(packet) = this.send_buffer.take() {
                match this.output.as_mut().poll_ready(cx)? {
                    Poll::Ready(()) => {
                        trace!(channel_id = %packet.channel_id(), "Sending packet");
                        this.output.as_mut().start_send(packet)?;
                        *this.flushing = true;
                        continue;
                    }
                    Poll::Pending => {
                        *this.send_buffer = Some(packet);
                        return Poll::Pending;
                    }
                }
            }

            if let Poll::Ready(packet) = this.protocol.poll_output(cx) {
                *this.send_buffer = Some(packet);
                continue;
            }

            match ready!(this.input.as_mut().poll_next(cx)?) {
                Some(packet) => this.protocol.receive(packet),
                None => {
                    debug!("Input closed, stopping");
                    return Poll::Ready(Ok(()));
                }
            }
        }
    }
}

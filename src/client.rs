use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Duration, Instant};
use tracing::{debug, trace, warn};

use crate::protocol::{Frame, FrameType, MSG_MAX_PAYLOAD};

/// How long an unacknowledged DATA frame may sit before it is resent.
pub const RETRANSMIT_TIMEOUT: Duration = Duration::from_millis(500);

/// Resends of one frame before the peer is assumed gone.
pub const MAX_RETRIES: u32 = 5;

/// Frame-derived input the dispatcher forwards to a client task.
#[derive(Debug)]
pub enum ClientEvent {
    HelloAck,
    Data { seq: bool, payload: Bytes },
    Ack { seq: bool },
    Goodbye,
}

/// The one DATA frame sent but not yet acknowledged. While this exists
/// the TCP side is not read, which is what makes the protocol
/// stop-and-wait.
struct PendingFrame {
    datagram: Bytes,
    seq: bool,
    sent_at: Instant,
    retries: u32,
}

/// Why a client task stopped.
#[derive(Debug)]
enum Teardown {
    /// Peer sent GOODBYE.
    Goodbye,
    /// The remote TCP endpoint closed its stream.
    TcpEof,
    /// Retransmission budget for the pending frame ran out.
    RetriesExhausted,
    /// The server dropped this client's handle (shutdown or removal).
    Released,
    Io(io::Error),
}

impl From<io::Error> for Teardown {
    fn from(err: io::Error) -> Teardown {
        Teardown::Io(err)
    }
}

/// One logical TCP-over-UDP connection. The task owns the TCP stream and
/// all protocol state; the dispatcher only ever talks to it through its
/// event channel.
pub struct Client {
    id: u16,
    /// UDP address the HELLO came from; every frame for this client goes here.
    peer: SocketAddr,
    /// TCP address resolved from the HELLO payload.
    target: SocketAddr,
    udp: Arc<UdpSocket>,
    events: mpsc::UnboundedReceiver<ClientEvent>,
    /// None until the peer's HELLOACK arrives and the connect succeeds.
    tcp: Option<TcpStream>,
    /// Sequence bit for the next DATA frame this side sends.
    next_send_seq: bool,
    /// Sequence bit expected on the next DATA frame from the peer.
    expect_recv_seq: bool,
    pending: Option<PendingFrame>,
}

impl Client {
    pub fn new(
        id: u16,
        peer: SocketAddr,
        target: SocketAddr,
        udp: Arc<UdpSocket>,
        events: mpsc::UnboundedReceiver<ClientEvent>,
    ) -> Client {
        Client {
            id,
            peer,
            target,
            udp,
            events,
            tcp: None,
            next_send_seq: false,
            expect_recv_seq: false,
            pending: None,
        }
    }

    /// Drive the client until it tears down. Dropping the returned future
    /// (or this struct) closes the TCP stream.
    pub async fn run(mut self) {
        debug!(id = self.id, peer = %self.peer, target = %self.target, "client task started");
        match self.drive().await {
            Teardown::Io(err) => {
                warn!(id = self.id, error = %err, "client torn down by i/o error");
            }
            reason => debug!(id = self.id, reason = ?reason, "client closed"),
        }
    }

    async fn drive(&mut self) -> Teardown {
        let mut buf = [0u8; MSG_MAX_PAYLOAD];
        loop {
            let deadline = self
                .pending
                .as_ref()
                .map(|pending| pending.sent_at + RETRANSMIT_TIMEOUT);

            // The TCP branch is guarded on `pending`: the stream drops out
            // of the readiness set while a frame is unacknowledged and
            // rejoins it when the ACK clears `pending`.
            let step = tokio::select! {
                event = self.events.recv() => match event {
                    Some(event) => self.on_event(event).await,
                    None => Err(Teardown::Released),
                },
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.retransmit().await
                }
                read = read_some(self.tcp.as_mut(), &mut buf),
                        if self.tcp.is_some() && self.pending.is_none() => match read {
                    Ok(0) => Err(Teardown::TcpEof),
                    Ok(n) => self.forward_tcp(&buf[..n]).await,
                    Err(err) => Err(Teardown::Io(err)),
                },
            };

            if let Err(reason) = step {
                return reason;
            }
        }
    }

    async fn on_event(&mut self, event: ClientEvent) -> Result<(), Teardown> {
        match event {
            ClientEvent::HelloAck => self.on_helloack().await,
            ClientEvent::Data { seq, payload } => self.on_data(seq, payload).await,
            ClientEvent::Ack { seq } => {
                self.on_ack(seq);
                Ok(())
            }
            ClientEvent::Goodbye => Err(Teardown::Goodbye),
        }
    }

    /// The peer acknowledged the tunnel: connect the TCP side. Repeats
    /// after the stream exists change nothing.
    async fn on_helloack(&mut self) -> Result<(), Teardown> {
        if self.tcp.is_some() {
            trace!(id = self.id, "repeated HELLOACK ignored");
            return Ok(());
        }
        let stream = TcpStream::connect(self.target).await?;
        debug!(id = self.id, target = %self.target, "tcp connected");
        self.tcp = Some(stream);
        Ok(())
    }

    async fn on_data(&mut self, seq: bool, payload: Bytes) -> Result<(), Teardown> {
        if self.tcp.is_none() {
            debug!(id = self.id, "DATA before the tunnel was established");
            return Err(Teardown::Io(io::Error::new(
                io::ErrorKind::NotConnected,
                "DATA frame before HELLOACK",
            )));
        }
        if seq == self.expect_recv_seq {
            // In-order frame: deliver to TCP before acknowledging, so a
            // write failure never acknowledges bytes that were lost.
            if let Some(tcp) = self.tcp.as_mut() {
                tcp.write_all(&payload).await?;
            }
            self.send_frame(FrameType::ack(seq), Bytes::new()).await?;
            self.expect_recv_seq = !self.expect_recv_seq;
            trace!(id = self.id, len = payload.len(), seq = seq as u8, "data delivered to tcp");
        } else {
            // Our ACK was lost and the peer resent. Discard, ACK again.
            trace!(id = self.id, seq = seq as u8, "duplicate DATA, repeating ACK");
            self.send_frame(FrameType::ack(seq), Bytes::new()).await?;
        }
        Ok(())
    }

    fn on_ack(&mut self, seq: bool) {
        match self.pending {
            Some(ref pending) if pending.seq == seq => {
                self.pending = None;
                self.next_send_seq = !self.next_send_seq;
                trace!(id = self.id, seq = seq as u8, "pending frame acknowledged");
            }
            _ => trace!(id = self.id, seq = seq as u8, "stray ACK ignored"),
        }
    }

    /// Bytes arrived from TCP: emit them as the next DATA frame and hold
    /// the encoded datagram for retransmission until the ACK comes back.
    async fn forward_tcp(&mut self, chunk: &[u8]) -> Result<(), Teardown> {
        let seq = self.next_send_seq;
        let datagram = self
            .send_frame(FrameType::data(seq), Bytes::copy_from_slice(chunk))
            .await?;
        trace!(id = self.id, len = chunk.len(), seq = seq as u8, "data frame sent");
        self.pending = Some(PendingFrame {
            datagram,
            seq,
            sent_at: Instant::now(),
            retries: 0,
        });
        Ok(())
    }

    async fn retransmit(&mut self) -> Result<(), Teardown> {
        let Some(pending) = self.pending.as_mut() else {
            return Ok(());
        };
        if pending.retries >= MAX_RETRIES {
            warn!(id = self.id, retries = pending.retries, "giving up on unacknowledged frame");
            return Err(Teardown::RetriesExhausted);
        }
        self.udp.send_to(&pending.datagram, self.peer).await?;
        pending.retries += 1;
        pending.sent_at = Instant::now();
        debug!(id = self.id, retries = pending.retries, "retransmitted data frame");
        Ok(())
    }

    async fn send_frame(&self, kind: FrameType, payload: Bytes) -> Result<Bytes, Teardown> {
        let datagram = Frame::with_payload(self.id, kind, payload)
            .encode()
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;
        self.udp.send_to(&datagram, self.peer).await?;
        Ok(datagram)
    }
}

/// Readable only while the select! guard holds; never resolves without a
/// stream so a disabled branch stays disabled.
async fn read_some(tcp: Option<&mut TcpStream>, buf: &mut [u8]) -> io::Result<usize> {
    match tcp {
        Some(stream) => stream.read(buf).await,
        None => std::future::pending().await,
    }
}

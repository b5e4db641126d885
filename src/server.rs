use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::net::{self, UdpSocket};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::client::{Client, ClientEvent};
use crate::protocol::{Frame, FrameType};

/// Address family the server listens on and resolves HELLO targets in.
/// IPv6 is opt-in via the `-6` flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpFamily {
    V4,
    V6,
}

impl IpFamily {
    pub fn wildcard(self) -> IpAddr {
        match self {
            IpFamily::V4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpFamily::V6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        }
    }

    fn matches(self, addr: &SocketAddr) -> bool {
        match self {
            IpFamily::V4 => addr.is_ipv4(),
            IpFamily::V6 => addr.is_ipv6(),
        }
    }
}

/// Dispatcher-side view of one client: where its frames come from and the
/// channel into its task. Dropping the handle ends the task.
pub struct ClientHandle {
    peer: SocketAddr,
    events: mpsc::UnboundedSender<ClientEvent>,
}

/// Tunnel id to client handle map. Ids are handed out monotonically from
/// 1; 0 stays reserved for HELLO, and on wrap-around ids still in use are
/// skipped.
pub struct ClientTable {
    clients: HashMap<u16, ClientHandle>,
    next_id: u16,
}

impl ClientTable {
    fn new() -> ClientTable {
        ClientTable {
            clients: HashMap::new(),
            next_id: 1,
        }
    }

    /// Insert a handle under a fresh id, or `None` if all 65535 ids are
    /// taken.
    fn insert(&mut self, handle: ClientHandle) -> Option<u16> {
        if self.clients.len() >= usize::from(u16::MAX) {
            return None;
        }
        loop {
            let id = self.next_id;
            self.next_id = if id == u16::MAX { 1 } else { id + 1 };
            if !self.clients.contains_key(&id) {
                self.clients.insert(id, handle);
                return Some(id);
            }
        }
    }

    fn get(&self, id: u16) -> Option<&ClientHandle> {
        self.clients.get(&id)
    }

    fn remove(&mut self, id: u16) -> Option<ClientHandle> {
        self.clients.remove(&id)
    }

    fn clear(&mut self) {
        self.clients.clear();
    }

    fn len(&self) -> usize {
        self.clients.len()
    }
}

/// The server half of the tunnel: one UDP socket shared by every client,
/// a table of live clients, and the dispatch loop tying them together.
pub struct Server {
    udp: Arc<UdpSocket>,
    clients: Arc<Mutex<ClientTable>>,
    family: IpFamily,
}

impl Server {
    /// Bind the UDP listener. `None` for the host binds the family's
    /// wildcard address.
    pub async fn bind(host: Option<&str>, port: u16, family: IpFamily) -> io::Result<Server> {
        let addr = match host {
            None => SocketAddr::new(family.wildcard(), port),
            Some(host) => resolve(host, port, family).await?,
        };
        let udp = UdpSocket::bind(addr).await?;
        Ok(Server {
            udp: Arc::new(udp),
            clients: Arc::new(Mutex::new(ClientTable::new())),
            family,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.udp.local_addr()
    }

    /// Receive-and-dispatch until `shutdown` resolves or the UDP socket
    /// fails. Shutdown tears down every client before returning.
    pub async fn run(&self, shutdown: impl Future<Output = ()>) -> io::Result<()> {
        info!(addr = %self.udp.local_addr()?, "tunnel server listening");
        tokio::pin!(shutdown);

        let mut buf = vec![0u8; 64 * 1024];
        let result = loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutdown requested");
                    break Ok(());
                }
                recv = self.udp.recv_from(&mut buf) => match recv {
                    Ok((len, from)) => self.handle_datagram(&buf[..len], from).await,
                    // A receive error on the shared socket takes the whole
                    // server down; per-client faults never reach here.
                    Err(err) => break Err(err),
                },
            }
        };

        let mut clients = self.clients.lock();
        debug!(count = clients.len(), "tearing down remaining clients");
        clients.clear();
        result
    }

    async fn handle_datagram(&self, datagram: &[u8], from: SocketAddr) {
        let frame = match Frame::decode(datagram) {
            Ok(frame) => frame,
            Err(err) => {
                debug!(%from, error = %err, "dropping malformed datagram");
                return;
            }
        };
        trace!(id = frame.id, kind = ?frame.kind, len = frame.payload.len(), %from, "frame received");

        if frame.id == 0 {
            if frame.kind == FrameType::Hello {
                self.handle_hello(frame.payload, from).await;
            } else {
                debug!(kind = ?frame.kind, %from, "dropping non-HELLO frame with unassigned id");
            }
            return;
        }

        let event = match frame.kind {
            FrameType::Hello => {
                debug!(id = frame.id, %from, "dropping HELLO with an already-assigned id");
                return;
            }
            FrameType::Keepalive => {
                trace!(id = frame.id, "keepalive");
                return;
            }
            FrameType::HelloAck => ClientEvent::HelloAck,
            FrameType::Goodbye => ClientEvent::Goodbye,
            FrameType::Data0 => ClientEvent::Data { seq: false, payload: frame.payload },
            FrameType::Data1 => ClientEvent::Data { seq: true, payload: frame.payload },
            FrameType::Ack0 => ClientEvent::Ack { seq: false },
            FrameType::Ack1 => ClientEvent::Ack { seq: true },
        };

        let mut clients = self.clients.lock();
        match clients.get(frame.id) {
            None => {
                // Nothing goes back: unknown ids must not be probeable.
                debug!(id = frame.id, %from, "dropping frame for unknown client");
            }
            Some(handle) => {
                if handle.peer != from {
                    debug!(id = frame.id, stored = %handle.peer, %from, "source address differs from stored peer");
                }
                if handle.events.send(event).is_err() {
                    // The task is already gone; drop the stale entry.
                    clients.remove(frame.id);
                }
            }
        }
    }

    /// HELLO: parse `"host port"`, resolve it, create the client, answer
    /// HELLOACK. Any failure along the way drops the HELLO silently.
    async fn handle_hello(&self, payload: Bytes, from: SocketAddr) {
        let Some((host, port)) = parse_hello(&payload) else {
            debug!(%from, "dropping malformed HELLO payload");
            return;
        };
        let target = match resolve(&host, port, self.family).await {
            Ok(target) => target,
            Err(err) => {
                debug!(%from, host = %host, port, error = %err, "HELLO target did not resolve");
                return;
            }
        };

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let id = {
            let mut clients = self.clients.lock();
            match clients.insert(ClientHandle { peer: from, events: events_tx }) {
                Some(id) => id,
                None => {
                    warn!(%from, "client table is full, dropping HELLO");
                    return;
                }
            }
        };

        let client = Client::new(id, from, target, self.udp.clone(), events_rx);
        let clients = self.clients.clone();
        tokio::spawn(async move {
            client.run().await;
            clients.lock().remove(id);
        });
        info!(id, peer = %from, target = %target, "tunnel client created");

        match Frame::new(id, FrameType::HelloAck).encode() {
            Ok(datagram) => {
                if let Err(err) = self.udp.send_to(&datagram, from).await {
                    warn!(id, peer = %from, error = %err, "failed to send HELLOACK");
                }
            }
            Err(err) => warn!(id, error = %err, "failed to encode HELLOACK"),
        }
    }
}

/// Split a HELLO payload at the first space into host and decimal port.
fn parse_hello(payload: &[u8]) -> Option<(String, u16)> {
    let text = std::str::from_utf8(payload).ok()?;
    let (host, port) = text.split_once(' ')?;
    let port = port.parse::<u16>().ok()?;
    Some((host.to_owned(), port))
}

/// Resolve `host:port`, keeping only addresses in the selected family.
async fn resolve(host: &str, port: u16, family: IpFamily) -> io::Result<SocketAddr> {
    net::lookup_host((host, port))
        .await?
        .find(|addr| family.matches(addr))
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                "host has no address in the configured family",
            )
        })
}

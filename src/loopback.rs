//! An in-process [`NativeTransport`].
//!
//! Every socket lives in one shared fabric; associations are links between
//! two sockets of the same `LoopbackTransport`. It behaves like a kernel
//! transport in the ways the channels care about: COMM_UP on both ends of a
//! new association, negotiated stream counts, partial delivery, graceful
//! shutdown, abort on close with zero linger, send failures on dead
//! associations, peer address changes and branching.
//!
//! Threads blocked in `receive`, `accept` or a blocking connect park on a
//! per-socket `polling::Poller` and are woken with `Poller::notify`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use polling::{Events, Poller};
use uuid::Uuid;

use crate::association::AssocId;
use crate::envelope::{
    AssocChangeEvent, AssocChangeRecord, PeerAddrChangeRecord, PeerAddressEvent, ReceivedMessage, ResultEnvelope,
    SendFailedRecord, ShutdownRecord,
};
use crate::native::{ConnectStatus, Descriptor, NativeTransport, SendParams, Waiter};
use crate::options::{InitMaxStreams, OptionName, SocketOption};

/// First port handed out for port-0 binds.
pub const FIRST_EPHEMERAL_PORT: u16 = 40000;

/// Streams requested in each direction unless `InitMaxStreams` says otherwise.
pub const DEFAULT_STREAMS: u16 = 10;

/// Error code carried by send-failed notifications for dead associations.
pub const SEND_FAILED_PEER_GONE: u32 = 1;

const DEFAULT_BUFFER_SIZE: usize = 65536;

/// Shared in-process transport. Clones share the same fabric.
#[derive(Clone)]
pub struct LoopbackTransport {
    fabric: Arc<Mutex<Fabric>>,
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new()
    }
}

struct Fabric {
    next_fd: u32,
    next_assoc: AssocId,
    next_port: u16,
    sockets: HashMap<Descriptor, Socket>,
}

struct Socket {
    multiplexed: bool,
    local: Vec<SocketAddr>,
    listening: bool,
    backlog: u32,
    nonblocking: bool,
    closing: bool,
    had_association: bool,
    inbox: VecDeque<Inbound>,
    accept_queue: VecDeque<(Descriptor, SocketAddr)>,
    links: HashMap<AssocId, Link>,
    options: HashMap<OptionName, SocketOption>,
    signalled: HashSet<Uuid>,
    parked: usize,
    poller: Arc<Poller>,
}

struct Link {
    peer_fd: Descriptor,
    peer_assoc: AssocId,
    peer_addresses: Vec<SocketAddr>,
    max_inbound: u16,
    max_outbound: u16,
    alive: bool,
}

enum Inbound {
    Data {
        message: ReceivedMessage,
        payload: Vec<u8>,
    },
    Event(ResultEnvelope),
}

impl Inbound {
    fn assoc_id(&self) -> Option<AssocId> {
        match self {
            Inbound::Data { message, .. } => Some(message.assoc_id),
            Inbound::Event(ResultEnvelope::AssociationChanged(r)) => Some(r.assoc_id),
            Inbound::Event(ResultEnvelope::PeerAddressChanged(r)) => Some(r.assoc_id),
            Inbound::Event(ResultEnvelope::SendFailed(r)) => Some(r.assoc_id),
            Inbound::Event(ResultEnvelope::Shutdown(r)) => Some(r.assoc_id),
            Inbound::Event(_) => None,
        }
    }
}

fn bad_descriptor(fd: Descriptor) -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, format!("{fd} is not open"))
}

fn invalid(msg: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, msg)
}

fn concrete(addr: SocketAddr, fallback: IpAddr) -> SocketAddr {
    if addr.ip().is_unspecified() {
        SocketAddr::new(fallback, addr.port())
    } else {
        addr
    }
}

impl Socket {
    fn new(multiplexed: bool) -> io::Result<Self> {
        Ok(Socket {
            multiplexed,
            local: Vec::new(),
            listening: false,
            backlog: 0,
            nonblocking: false,
            closing: false,
            had_association: false,
            inbox: VecDeque::new(),
            accept_queue: VecDeque::new(),
            links: HashMap::new(),
            options: HashMap::new(),
            signalled: HashSet::new(),
            parked: 0,
            poller: Arc::new(Poller::new()?),
        })
    }

    fn wake(&self) {
        if let Err(err) = self.poller.notify() {
            log::warn!("loopback wake failed: {err}");
        }
    }

    fn push(&mut self, item: Inbound) {
        self.inbox.push_back(item);
        self.wake();
    }

    fn push_event(&mut self, envelope: ResultEnvelope) {
        self.push(Inbound::Event(envelope));
    }

    fn init_streams(&self) -> InitMaxStreams {
        match self.options.get(&OptionName::InitMaxStreams) {
            Some(SocketOption::InitMaxStreams(streams)) => *streams,
            _ => InitMaxStreams::new(DEFAULT_STREAMS, DEFAULT_STREAMS),
        }
    }

    fn aborts_on_close(&self) -> bool {
        matches!(self.options.get(&OptionName::Linger), Some(SocketOption::Linger(0)))
    }

    fn primary_address(&self) -> Option<SocketAddr> {
        self.local
            .first()
            .map(|a| concrete(*a, IpAddr::V4(Ipv4Addr::LOCALHOST)))
    }

    /// One-to-one socket whose association is gone: reads see end of stream.
    fn at_eof(&self) -> bool {
        !self.multiplexed && self.had_association && self.links.values().all(|l| !l.alive)
    }

    fn only_link(&self) -> Option<(AssocId, &Link)> {
        self.links.iter().next().map(|(id, l)| (*id, l))
    }

    fn take_signal(&mut self, waiter: &Waiter) -> bool {
        self.signalled.remove(&waiter.token())
    }
}

impl Fabric {
    fn socket(&self, fd: Descriptor) -> io::Result<&Socket> {
        self.sockets.get(&fd).ok_or_else(|| bad_descriptor(fd))
    }

    fn socket_mut(&mut self, fd: Descriptor) -> io::Result<&mut Socket> {
        self.sockets.get_mut(&fd).ok_or_else(|| bad_descriptor(fd))
    }

    fn allocate_fd(&mut self, socket: Socket) -> Descriptor {
        self.next_fd += 1;
        let fd = Descriptor::new(self.next_fd);
        self.sockets.insert(fd, socket);
        fd
    }

    fn port_in_use(&self, ip: IpAddr, port: u16) -> bool {
        self.sockets.values().any(|s| {
            s.local
                .iter()
                .any(|a| a.port() == port && (a.ip() == ip || a.ip().is_unspecified() || ip.is_unspecified()))
        })
    }

    fn ephemeral_port(&mut self) -> io::Result<u16> {
        for _ in 0..=u16::MAX {
            let port = self.next_port;
            self.next_port = self.next_port.checked_add(1).unwrap_or(FIRST_EPHEMERAL_PORT);
            if !self.port_in_use(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port) {
                return Ok(port);
            }
        }
        Err(io::Error::new(io::ErrorKind::AddrInUse, "no ephemeral ports left"))
    }

    fn bind(&mut self, fd: Descriptor, address: SocketAddr) -> io::Result<()> {
        if !self.socket(fd)?.local.is_empty() {
            return Err(invalid("socket is already bound"));
        }
        let port = if address.port() == 0 {
            self.ephemeral_port()?
        } else if self.port_in_use(address.ip(), address.port()) {
            return Err(io::Error::new(io::ErrorKind::AddrInUse, format!("{address} in use")));
        } else {
            address.port()
        };
        self.socket_mut(fd)?.local = vec![SocketAddr::new(address.ip(), port)];
        Ok(())
    }

    fn autobind(&mut self, fd: Descriptor) -> io::Result<()> {
        if self.socket(fd)?.local.is_empty() {
            self.bind(fd, SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0))?;
        }
        Ok(())
    }

    fn find_listener(&self, remote: SocketAddr) -> Option<Descriptor> {
        self.sockets
            .iter()
            .find(|(_, s)| {
                s.listening
                    && !s.closing
                    && s.local
                        .iter()
                        .any(|l| l.port() == remote.port() && (l.ip() == remote.ip() || l.ip().is_unspecified()))
            })
            .map(|(fd, _)| *fd)
    }

    fn next_assoc_id(&mut self) -> AssocId {
        self.next_assoc += 1;
        self.next_assoc
    }

    /// Set up an association from `fd` to the listener at `remote`.
    /// Returns the association id on the `fd` side.
    fn associate(&mut self, fd: Descriptor, remote: SocketAddr) -> io::Result<AssocId> {
        let listener = self
            .find_listener(remote)
            .ok_or_else(|| io::Error::new(io::ErrorKind::ConnectionRefused, format!("nothing listening on {remote}")))?;
        if listener == fd {
            return Err(invalid("cannot associate a socket with itself"));
        }
        self.autobind(fd)?;

        let (server_fd, accept_from) = {
            let target = self.socket(listener)?;
            if target.multiplexed {
                (listener, None)
            } else {
                if target.accept_queue.len() >= target.backlog as usize {
                    return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "backlog full"));
                }
                let mut accepted = Socket::new(false)?;
                accepted.local = target.local.clone();
                accepted.options = target.options.clone();
                let from = self.socket(fd)?.primary_address();
                (self.allocate_fd(accepted), Some(from))
            }
        };

        let client = self.socket(fd)?;
        let server = self.socket(server_fd)?;
        let client_streams = client.init_streams();
        let server_streams = server.init_streams();
        let client_to_server = client_streams.max_outbound.min(server_streams.max_inbound);
        let server_to_client = server_streams.max_outbound.min(client_streams.max_inbound);

        let mut server_addrs: Vec<SocketAddr> = server.local.iter().map(|a| concrete(*a, remote.ip())).collect();
        server_addrs.dedup();
        let mut client_addrs: Vec<SocketAddr> = client
            .local
            .iter()
            .map(|a| concrete(*a, IpAddr::V4(Ipv4Addr::LOCALHOST)))
            .collect();
        client_addrs.dedup();

        let client_id = self.next_assoc_id();
        let server_id = self.next_assoc_id();

        let client = self.socket_mut(fd)?;
        client.had_association = true;
        client.links.insert(
            client_id,
            Link {
                peer_fd: server_fd,
                peer_assoc: server_id,
                peer_addresses: server_addrs,
                max_inbound: server_to_client,
                max_outbound: client_to_server,
                alive: true,
            },
        );
        client.push_event(ResultEnvelope::AssociationChanged(AssocChangeRecord {
            assoc_id: client_id,
            event: AssocChangeEvent::CommUp,
            max_inbound_streams: server_to_client,
            max_outbound_streams: client_to_server,
        }));

        let server = self.socket_mut(server_fd)?;
        server.had_association = true;
        server.links.insert(
            server_id,
            Link {
                peer_fd: fd,
                peer_assoc: client_id,
                peer_addresses: client_addrs,
                max_inbound: client_to_server,
                max_outbound: server_to_client,
                alive: true,
            },
        );
        server.push_event(ResultEnvelope::AssociationChanged(AssocChangeRecord {
            assoc_id: server_id,
            event: AssocChangeEvent::CommUp,
            max_inbound_streams: client_to_server,
            max_outbound_streams: server_to_client,
        }));

        if let Some(from) = accept_from {
            let target = self.socket_mut(listener)?;
            target.accept_queue.push_back((server_fd, from.unwrap_or(remote)));
            target.wake();
        }
        log::trace!("loopback: {fd}/{client_id} <-> {server_fd}/{server_id}");
        Ok(client_id)
    }

    /// Local association id for a send.
    fn resolve_target(&mut self, fd: Descriptor, params: &SendParams) -> io::Result<AssocId> {
        let socket = self.socket(fd)?;
        if let Some(id) = params.assoc_id {
            return if socket.links.contains_key(&id) {
                Ok(id)
            } else {
                Err(io::Error::new(io::ErrorKind::NotConnected, format!("no association {id}")))
            };
        }
        if !socket.multiplexed {
            return socket
                .only_link()
                .map(|(id, _)| id)
                .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected));
        }
        let address = params.address.ok_or_else(|| invalid("destination required"))?;
        let existing = socket
            .links
            .iter()
            .find(|(_, l)| l.alive && l.peer_addresses.contains(&address))
            .map(|(id, _)| *id);
        match existing {
            Some(id) => Ok(id),
            None => self.associate(fd, address),
        }
    }

    /// Mark both ends of the association dead and queue the given events.
    fn sever(&mut self, fd: Descriptor, id: AssocId, local: Option<ResultEnvelope>, peer: impl FnOnce(AssocId) -> ResultEnvelope) {
        let Some(socket) = self.sockets.get_mut(&fd) else {
            return;
        };
        let Some(link) = socket.links.get_mut(&id) else {
            return;
        };
        if !link.alive {
            return;
        }
        link.alive = false;
        let (peer_fd, peer_assoc) = (link.peer_fd, link.peer_assoc);
        if let Some(event) = local {
            socket.push_event(event);
        } else {
            socket.wake();
        }
        if let Some(peer_socket) = self.sockets.get_mut(&peer_fd) {
            if let Some(peer_link) = peer_socket.links.get_mut(&peer_assoc) {
                peer_link.alive = false;
            }
            peer_socket.push_event(peer(peer_assoc));
        }
    }

    fn announce_address(&mut self, fd: Descriptor, address: SocketAddr, event: PeerAddressEvent) -> io::Result<()> {
        let peers: Vec<(Descriptor, AssocId)> = self
            .socket(fd)?
            .links
            .values()
            .filter(|l| l.alive)
            .map(|l| (l.peer_fd, l.peer_assoc))
            .collect();
        for (peer_fd, peer_assoc) in peers {
            if let Some(peer) = self.sockets.get_mut(&peer_fd) {
                if let Some(link) = peer.links.get_mut(&peer_assoc) {
                    match event {
                        PeerAddressEvent::AddrRemoved => link.peer_addresses.retain(|a| *a != address),
                        _ => {
                            if !link.peer_addresses.contains(&address) {
                                link.peer_addresses.push(address);
                            }
                        }
                    }
                }
                peer.push_event(ResultEnvelope::PeerAddressChanged(PeerAddrChangeRecord {
                    assoc_id: peer_assoc,
                    address,
                    event,
                }));
            }
        }
        Ok(())
    }

    fn release(&mut self, fd: Descriptor) {
        let Some(socket) = self.sockets.get(&fd) else {
            return;
        };
        let abort = socket.aborts_on_close();
        let ids: Vec<AssocId> = socket.links.keys().copied().collect();
        let pending: Vec<Descriptor> = socket.accept_queue.iter().map(|(fd, _)| *fd).collect();
        for id in ids {
            self.sever(fd, id, None, |peer_assoc| {
                if abort {
                    ResultEnvelope::AssociationChanged(AssocChangeRecord {
                        assoc_id: peer_assoc,
                        event: AssocChangeEvent::CommLost,
                        max_inbound_streams: 0,
                        max_outbound_streams: 0,
                    })
                } else {
                    ResultEnvelope::Shutdown(ShutdownRecord { assoc_id: peer_assoc })
                }
            });
        }
        if let Some(socket) = self.sockets.remove(&fd) {
            socket.wake();
        }
        for accepted in pending {
            self.release(accepted);
        }
    }
}

impl LoopbackTransport {
    /// An empty fabric.
    pub fn new() -> Self {
        LoopbackTransport {
            fabric: Arc::new(Mutex::new(Fabric {
                next_fd: 0,
                next_assoc: 0,
                next_port: FIRST_EPHEMERAL_PORT,
                sockets: HashMap::new(),
            })),
        }
    }

    /// Whether `fd` is still allocated (closed descriptors are released).
    pub fn is_allocated(&self, fd: Descriptor) -> bool {
        self.fabric.lock().sockets.contains_key(&fd)
    }

    /// Number of allocated descriptors.
    pub fn allocated(&self) -> usize {
        self.fabric.lock().sockets.len()
    }

    /// Number of threads currently parked on `fd`.
    pub fn parked(&self, fd: Descriptor) -> usize {
        self.fabric.lock().sockets.get(&fd).map(|s| s.parked).unwrap_or(0)
    }

    /// Queue an arbitrary notification on `fd`, as if the peer had caused it.
    pub fn inject(&self, fd: Descriptor, envelope: ResultEnvelope) -> io::Result<()> {
        self.fabric.lock().socket_mut(fd)?.push_event(envelope);
        Ok(())
    }

    /// Block until `ready` yields a value, the call is signalled, the socket
    /// is closed, or `timeout` elapses (`Ok(None)`).
    fn wait_until<T, F>(&self, fd: Descriptor, waiter: &Waiter, timeout: Option<Duration>, mut ready: F) -> io::Result<Option<T>>
    where
        F: FnMut(&mut Socket) -> io::Result<Option<T>>,
    {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let poller = {
                let mut fabric = self.fabric.lock();
                let socket = fabric.socket_mut(fd)?;
                if socket.take_signal(waiter) || socket.closing {
                    return Err(io::ErrorKind::Interrupted.into());
                }
                if let Some(value) = ready(socket)? {
                    return Ok(Some(value));
                }
                if socket.nonblocking {
                    return Err(io::ErrorKind::WouldBlock.into());
                }
                socket.parked += 1;
                socket.poller.clone()
            };

            let remaining = match deadline {
                Some(deadline) => Some(deadline.saturating_duration_since(Instant::now())),
                None => None,
            };
            let mut events = Events::new();
            let waited = poller.wait(&mut events, remaining);

            if let Some(socket) = self.fabric.lock().sockets.get_mut(&fd) {
                socket.parked -= 1;
            }
            match waited {
                Ok(_) => {}
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err),
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Ok(None);
            }
        }
    }
}

impl NativeTransport for LoopbackTransport {
    fn create_socket(&self, multiplexed: bool) -> io::Result<Descriptor> {
        let socket = Socket::new(multiplexed)?;
        let fd = self.fabric.lock().allocate_fd(socket);
        log::trace!("loopback: created {fd} (multiplexed: {multiplexed})");
        Ok(fd)
    }

    fn bind(&self, fd: Descriptor, address: SocketAddr) -> io::Result<()> {
        self.fabric.lock().bind(fd, address)
    }

    fn bind_extra_address(&self, fd: Descriptor, address: IpAddr, port: u16, add: bool) -> io::Result<()> {
        let mut fabric = self.fabric.lock();
        let sockaddr = SocketAddr::new(address, port);
        if add {
            if fabric.port_in_use(address, port) {
                return Err(io::Error::new(io::ErrorKind::AddrInUse, format!("{sockaddr} in use")));
            }
            fabric.socket_mut(fd)?.local.push(sockaddr);
            fabric.announce_address(fd, sockaddr, PeerAddressEvent::AddrAdded)
        } else {
            let socket = fabric.socket_mut(fd)?;
            let before = socket.local.len();
            socket.local.retain(|a| *a != sockaddr);
            if socket.local.len() == before {
                return Err(invalid("address not bound"));
            }
            fabric.announce_address(fd, sockaddr, PeerAddressEvent::AddrRemoved)
        }
    }

    fn listen(&self, fd: Descriptor, backlog: u32) -> io::Result<()> {
        let mut fabric = self.fabric.lock();
        fabric.autobind(fd)?;
        let socket = fabric.socket_mut(fd)?;
        socket.listening = true;
        socket.backlog = backlog;
        Ok(())
    }

    fn connect(&self, fd: Descriptor, remote: SocketAddr) -> io::Result<ConnectStatus> {
        let mut fabric = self.fabric.lock();
        let socket = fabric.socket(fd)?;
        if socket.closing {
            return Err(io::ErrorKind::Interrupted.into());
        }
        if socket.multiplexed {
            return Err(invalid("one-to-many sockets set up associations on send"));
        }
        if socket.had_association {
            return Err(io::Error::from(io::ErrorKind::AlreadyExists));
        }
        let nonblocking = socket.nonblocking;
        fabric.associate(fd, remote)?;
        Ok(if nonblocking {
            ConnectStatus::InProgress
        } else {
            ConnectStatus::Connected
        })
    }

    fn poll_connect(&self, fd: Descriptor, timeout: Option<Duration>, waiter: &Waiter) -> io::Result<bool> {
        let done = self.wait_until(fd, waiter, timeout, |socket| {
            if socket.had_association {
                Ok(Some(()))
            } else {
                Err(io::Error::from(io::ErrorKind::NotConnected))
            }
        });
        match done {
            Ok(done) => Ok(done.is_some()),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(false),
            Err(err) => Err(err),
        }
    }

    fn accept(&self, fd: Descriptor, waiter: &Waiter) -> io::Result<(Descriptor, SocketAddr)> {
        if !self.fabric.lock().socket(fd)?.listening {
            return Err(invalid("socket is not listening"));
        }
        self.wait_until(fd, waiter, None, |socket| Ok(socket.accept_queue.pop_front()))?
            .ok_or_else(|| io::ErrorKind::WouldBlock.into())
    }

    fn receive(&self, fd: Descriptor, buf: &mut [u8], peek: bool, waiter: &Waiter) -> io::Result<(usize, ResultEnvelope)> {
        let received = self.wait_until(fd, waiter, None, |socket| {
            let Some(front) = socket.inbox.front_mut() else {
                return Ok(socket.at_eof().then_some((0, ResultEnvelope::Nothing)));
            };
            match front {
                Inbound::Event(envelope) => {
                    let envelope = envelope.clone();
                    if !peek {
                        socket.inbox.pop_front();
                    }
                    Ok(Some((0, envelope)))
                }
                Inbound::Data { message, payload } => {
                    let n = payload.len().min(buf.len());
                    buf[..n].copy_from_slice(&payload[..n]);
                    let mut message = message.clone();
                    if n < payload.len() {
                        message.complete = false;
                        if !peek {
                            payload.drain(..n);
                        }
                    } else if !peek {
                        socket.inbox.pop_front();
                    }
                    Ok(Some((n, ResultEnvelope::Message(message))))
                }
            }
        })?;
        Ok(received.unwrap_or((0, ResultEnvelope::Nothing)))
    }

    fn send(&self, fd: Descriptor, buf: &[u8], params: &SendParams, waiter: &Waiter) -> io::Result<usize> {
        let mut fabric = self.fabric.lock();
        {
            let socket = fabric.socket_mut(fd)?;
            if socket.take_signal(waiter) || socket.closing {
                return Err(io::ErrorKind::Interrupted.into());
            }
        }
        fabric.autobind(fd)?;
        let id = fabric.resolve_target(fd, params)?;
        let socket = fabric.socket_mut(fd)?;
        let from = socket.primary_address();
        let Some(link) = socket.links.get(&id) else {
            return Err(io::ErrorKind::NotConnected.into());
        };
        if params.stream >= link.max_outbound {
            return Err(invalid("stream out of range"));
        }
        if !link.alive {
            let address = params.address.or_else(|| link.peer_addresses.first().copied());
            socket.push_event(ResultEnvelope::SendFailed(SendFailedRecord {
                assoc_id: id,
                address,
                data: buf.to_vec(),
                error_code: SEND_FAILED_PEER_GONE,
                stream: params.stream,
            }));
            return Ok(buf.len());
        }
        let (peer_fd, peer_assoc) = (link.peer_fd, link.peer_assoc);
        let peer = fabric.socket_mut(peer_fd)?;
        peer.push(Inbound::Data {
            message: ReceivedMessage {
                assoc_id: peer_assoc,
                address: from,
                stream: params.stream,
                unordered: params.unordered,
                payload_protocol_id: params.payload_protocol_id,
                complete: params.complete,
            },
            payload: buf.to_vec(),
        });
        Ok(buf.len())
    }

    fn local_addresses(&self, fd: Descriptor) -> io::Result<Vec<SocketAddr>> {
        Ok(self.fabric.lock().socket(fd)?.local.clone())
    }

    fn remote_addresses(&self, fd: Descriptor, assoc_id: Option<AssocId>) -> io::Result<Vec<SocketAddr>> {
        let fabric = self.fabric.lock();
        let socket = fabric.socket(fd)?;
        let link = match assoc_id {
            Some(id) => socket.links.get(&id),
            None => socket.only_link().map(|(_, l)| l),
        };
        match link {
            Some(link) if link.alive => Ok(link.peer_addresses.clone()),
            _ => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    fn get_option(&self, fd: Descriptor, name: OptionName, assoc_id: Option<AssocId>) -> io::Result<SocketOption> {
        let fabric = self.fabric.lock();
        let socket = fabric.socket(fd)?;
        if let Some(value) = socket.options.get(&name) {
            return Ok(*value);
        }
        let value = match name {
            OptionName::DisableFragments => SocketOption::DisableFragments(false),
            OptionName::ExplicitComplete => SocketOption::ExplicitComplete(false),
            OptionName::FragmentInterleave => SocketOption::FragmentInterleave(1),
            OptionName::InitMaxStreams => SocketOption::InitMaxStreams(socket.init_streams()),
            OptionName::NoDelay => SocketOption::NoDelay(false),
            OptionName::SendBuffer => SocketOption::SendBuffer(DEFAULT_BUFFER_SIZE),
            OptionName::ReceiveBuffer => SocketOption::ReceiveBuffer(DEFAULT_BUFFER_SIZE),
            OptionName::Linger => SocketOption::Linger(-1),
            OptionName::PrimaryAddress => {
                let link = match assoc_id {
                    Some(id) => socket.links.get(&id),
                    None => socket.only_link().map(|(_, l)| l),
                };
                let primary = link
                    .and_then(|l| l.peer_addresses.first().copied())
                    .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
                SocketOption::PrimaryAddress(primary)
            }
            OptionName::SetPeerPrimaryAddress => return Err(invalid("option is write-only")),
        };
        Ok(value)
    }

    fn set_option(&self, fd: Descriptor, option: SocketOption, assoc_id: Option<AssocId>) -> io::Result<()> {
        let mut fabric = self.fabric.lock();
        let socket = fabric.socket_mut(fd)?;
        match option {
            SocketOption::PrimaryAddress(address) => {
                let link = match assoc_id {
                    Some(id) => socket.links.get(&id),
                    None => socket.only_link().map(|(_, l)| l),
                };
                match link {
                    Some(link) if link.peer_addresses.contains(&address) => {}
                    Some(_) => return Err(invalid("not a peer address")),
                    None => return Err(io::ErrorKind::NotConnected.into()),
                }
            }
            SocketOption::SetPeerPrimaryAddress(address) => {
                if !socket.local.iter().any(|a| *a == address || (a.ip().is_unspecified() && a.port() == address.port())) {
                    return Err(invalid("not a local address"));
                }
            }
            _ => {}
        }
        socket.options.insert(option.name(), option);
        Ok(())
    }

    fn shutdown_association(&self, fd: Descriptor, assoc_id: Option<AssocId>) -> io::Result<()> {
        let mut fabric = self.fabric.lock();
        let socket = fabric.socket(fd)?;
        let id = match assoc_id {
            Some(id) => id,
            None => socket
                .only_link()
                .map(|(id, _)| id)
                .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?,
        };
        if !socket.links.contains_key(&id) {
            return Err(io::ErrorKind::NotConnected.into());
        }
        let local = ResultEnvelope::AssociationChanged(AssocChangeRecord {
            assoc_id: id,
            event: AssocChangeEvent::Shutdown,
            max_inbound_streams: 0,
            max_outbound_streams: 0,
        });
        fabric.sever(fd, id, Some(local), |peer_assoc| {
            ResultEnvelope::Shutdown(ShutdownRecord { assoc_id: peer_assoc })
        });
        Ok(())
    }

    fn branch_association(&self, fd: Descriptor, assoc_id: AssocId) -> io::Result<Descriptor> {
        let mut fabric = self.fabric.lock();
        let socket = fabric.socket_mut(fd)?;
        if !socket.multiplexed {
            return Err(invalid("only one-to-many sockets can branch"));
        }
        let link = socket
            .links
            .remove(&assoc_id)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, format!("no association {assoc_id}")))?;
        let (moved, kept): (VecDeque<Inbound>, VecDeque<Inbound>) = std::mem::take(&mut socket.inbox)
            .into_iter()
            .partition(|item| item.assoc_id() == Some(assoc_id));
        socket.inbox = kept;
        let local = socket.local.clone();
        let options = socket.options.clone();
        let (peer_fd, peer_assoc) = (link.peer_fd, link.peer_assoc);

        let mut branched = Socket::new(false)?;
        branched.local = local;
        branched.options = options;
        branched.had_association = true;
        branched.links.insert(assoc_id, link);
        branched.inbox = moved;
        let new_fd = fabric.allocate_fd(branched);

        if let Some(peer) = fabric.sockets.get_mut(&peer_fd) {
            if let Some(peer_link) = peer.links.get_mut(&peer_assoc) {
                peer_link.peer_fd = new_fd;
            }
        }
        log::trace!("loopback: branched {fd}/{assoc_id} onto {new_fd}");
        Ok(new_fd)
    }

    fn set_nonblocking(&self, fd: Descriptor, nonblocking: bool) -> io::Result<()> {
        self.fabric.lock().socket_mut(fd)?.nonblocking = nonblocking;
        Ok(())
    }

    fn pre_close(&self, fd: Descriptor) -> io::Result<()> {
        let mut fabric = self.fabric.lock();
        let socket = fabric.socket_mut(fd)?;
        socket.closing = true;
        socket.wake();
        Ok(())
    }

    fn close(&self, fd: Descriptor) -> io::Result<()> {
        let mut fabric = self.fabric.lock();
        fabric.socket(fd)?;
        fabric.release(fd);
        log::trace!("loopback: closed {fd}");
        Ok(())
    }

    fn signal(&self, fd: Descriptor, waiter: &Waiter) {
        if let Some(socket) = self.fabric.lock().sockets.get_mut(&fd) {
            socket.signalled.insert(waiter.token());
            socket.wake();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn next_event(transport: &LoopbackTransport, fd: Descriptor) -> ResultEnvelope {
        let mut buf = [0u8; 64];
        transport.receive(fd, &mut buf, false, &Waiter::current()).unwrap().1
    }

    #[test]
    fn test_ephemeral_ports_and_conflicts() {
        let transport = LoopbackTransport::new();
        let a = transport.create_socket(false).unwrap();
        let b = transport.create_socket(false).unwrap();
        transport.bind(a, addr("127.0.0.1:0")).unwrap();
        assert_eq!(transport.local_addresses(a).unwrap(), vec![addr("127.0.0.1:40000")]);

        let err = transport.bind(b, addr("0.0.0.0:40000")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AddrInUse);
        transport.bind(b, addr("127.0.0.2:0")).unwrap();
        assert_eq!(transport.local_addresses(b).unwrap()[0].port(), 40001);
    }

    #[test]
    fn test_streams_negotiated_down() {
        let transport = LoopbackTransport::new();
        let server = transport.create_socket(true).unwrap();
        transport
            .set_option(server, SocketOption::InitMaxStreams(InitMaxStreams::new(3, 20)), None)
            .unwrap();
        transport.bind(server, addr("127.0.0.1:0")).unwrap();
        transport.listen(server, 5).unwrap();
        let client = transport.create_socket(false).unwrap();
        transport.connect(client, addr("127.0.0.1:40000")).unwrap();

        match next_event(&transport, client) {
            ResultEnvelope::AssociationChanged(up) => {
                assert_eq!(up.event, AssocChangeEvent::CommUp);
                assert_eq!(up.max_outbound_streams, 3);
                assert_eq!(up.max_inbound_streams, DEFAULT_STREAMS);
            }
            other => panic!("unexpected {other:?}"),
        }
        match next_event(&transport, server) {
            ResultEnvelope::AssociationChanged(up) => {
                assert_eq!(up.max_inbound_streams, 3);
                assert_eq!(up.max_outbound_streams, DEFAULT_STREAMS);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_backlog_limits_pending_accepts() {
        let transport = LoopbackTransport::new();
        let server = transport.create_socket(false).unwrap();
        transport.bind(server, addr("127.0.0.1:0")).unwrap();
        transport.listen(server, 1).unwrap();

        let first = transport.create_socket(false).unwrap();
        transport.connect(first, addr("127.0.0.1:40000")).unwrap();
        let second = transport.create_socket(false).unwrap();
        let err = transport.connect(second, addr("127.0.0.1:40000")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
    }

    #[test]
    fn test_accept_reports_client_address() {
        let transport = LoopbackTransport::new();
        let server = transport.create_socket(false).unwrap();
        transport.bind(server, addr("127.0.0.1:0")).unwrap();
        transport.listen(server, 4).unwrap();

        let bound = transport.create_socket(false).unwrap();
        transport.bind(bound, addr("127.0.0.3:0")).unwrap();
        transport.connect(bound, addr("127.0.0.1:40000")).unwrap();
        // Never bound: connect picks its address.
        let unbound = transport.create_socket(false).unwrap();
        transport.connect(unbound, addr("127.0.0.1:40000")).unwrap();

        let waiter = Waiter::current();
        let (first, from) = transport.accept(server, &waiter).unwrap();
        assert_eq!(from, transport.local_addresses(bound).unwrap()[0]);
        assert_eq!(from.ip(), addr("127.0.0.3:0").ip());
        let (second, from) = transport.accept(server, &waiter).unwrap();
        assert_ne!(first, second);
        assert_eq!(from, transport.local_addresses(unbound).unwrap()[0]);
    }

    #[test]
    fn test_signal_interrupts_blocked_receive() {
        let transport = LoopbackTransport::new();
        let fd = transport.create_socket(true).unwrap();
        let (tx, rx) = std::sync::mpsc::channel();
        let receiver = transport.clone();
        let handle = std::thread::spawn(move || {
            let waiter = Waiter::current();
            tx.send(waiter.clone()).unwrap();
            let mut buf = [0u8; 8];
            receiver.receive(fd, &mut buf, false, &waiter).map(|(n, _)| n)
        });

        let waiter = rx.recv().unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while transport.parked(fd) == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        transport.signal(fd, &waiter);
        let err = handle.join().unwrap().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Interrupted);
        assert_eq!(transport.parked(fd), 0);
    }

    #[test]
    fn test_nonblocking_receive_would_block() {
        let transport = LoopbackTransport::new();
        let fd = transport.create_socket(true).unwrap();
        transport.set_nonblocking(fd, true).unwrap();
        let mut buf = [0u8; 8];
        let err = transport.receive(fd, &mut buf, false, &Waiter::current()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn test_close_aborts_or_shuts_down_peer() {
        let transport = LoopbackTransport::new();
        let server = transport.create_socket(true).unwrap();
        transport.bind(server, addr("127.0.0.1:0")).unwrap();
        transport.listen(server, 5).unwrap();

        let graceful = transport.create_socket(false).unwrap();
        transport.connect(graceful, addr("127.0.0.1:40000")).unwrap();
        let aborting = transport.create_socket(false).unwrap();
        transport.set_option(aborting, SocketOption::Linger(0), None).unwrap();
        transport.connect(aborting, addr("127.0.0.1:40000")).unwrap();
        next_event(&transport, server);
        next_event(&transport, server);

        transport.close(graceful).unwrap();
        assert!(matches!(next_event(&transport, server), ResultEnvelope::Shutdown(_)));
        transport.close(aborting).unwrap();
        assert!(matches!(
            next_event(&transport, server),
            ResultEnvelope::AssociationChanged(AssocChangeRecord { event: AssocChangeEvent::CommLost, .. })
        ));
        assert_eq!(transport.allocated(), 1);
    }
}

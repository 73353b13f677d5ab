//! The seam to the kernel transport.
//!
//! Channels never talk to the operating system directly; every socket
//! operation goes through a [`NativeTransport`]. Blocking operations take a
//! [`Waiter`] naming the calling thread so that a concurrent close can wake
//! it through [`NativeTransport::signal`].

use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::thread::{self, ThreadId};
use std::time::Duration;

use uuid::Uuid;

use crate::association::AssocId;
use crate::envelope::ResultEnvelope;
use crate::options::{OptionName, SocketOption};

/// Handle to a transport socket.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Descriptor(u32);

impl Descriptor {
    /// Wrap a raw transport handle.
    pub fn new(raw: u32) -> Self {
        Descriptor(raw)
    }

    /// The raw transport handle.
    pub fn raw(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fd#{}", self.0)
    }
}

/// Identity of one in-flight blocking call.
///
/// The token is unique per call; the thread id is there for transports
/// that interrupt calls by signalling the OS thread.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Waiter {
    token: Uuid,
    thread: ThreadId,
}

impl Waiter {
    /// A waiter for a call made from the current thread.
    pub fn current() -> Self {
        Waiter {
            token: Uuid::new_v4(),
            thread: thread::current().id(),
        }
    }

    /// Unique token of the call.
    pub fn token(&self) -> Uuid {
        self.token
    }

    /// Thread making the call.
    pub fn thread(&self) -> ThreadId {
        self.thread
    }
}

/// Result of starting a connect.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectStatus {
    /// The association is established.
    Connected,
    /// Non-blocking connect started; poll for completion.
    InProgress,
}

/// Destination and ancillary data for one native send.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SendParams {
    /// Explicit destination. Without an association this starts a new one.
    pub address: Option<SocketAddr>,
    /// Association to send on.
    pub assoc_id: Option<AssocId>,
    /// Stream number.
    pub stream: u16,
    /// Unordered delivery.
    pub unordered: bool,
    /// Payload protocol identifier.
    pub payload_protocol_id: u32,
    /// Whether this send completes the message.
    pub complete: bool,
    /// Discard if not sent within this time.
    pub time_to_live: Option<Duration>,
}

/// Kernel-facing socket operations.
///
/// Errors use `std::io::ErrorKind` the way socket calls do:
/// `Interrupted` when a blocking call was woken by [`signal`](Self::signal)
/// or a close, `WouldBlock` when a non-blocking call has nothing to do.
/// Every other error is a transport failure.
pub trait NativeTransport: Send + Sync {
    /// Create a socket, one-to-many when `multiplexed` is set.
    fn create_socket(&self, multiplexed: bool) -> io::Result<Descriptor>;

    /// Bind to `address`; port 0 picks an ephemeral port.
    fn bind(&self, fd: Descriptor, address: SocketAddr) -> io::Result<()>;

    /// Add (or remove) one more local address on the already bound port.
    fn bind_extra_address(&self, fd: Descriptor, address: IpAddr, port: u16, add: bool) -> io::Result<()>;

    /// Mark the socket passive.
    fn listen(&self, fd: Descriptor, backlog: u32) -> io::Result<()>;

    /// Start an association with `remote`.
    fn connect(&self, fd: Descriptor, remote: SocketAddr) -> io::Result<ConnectStatus>;

    /// Check whether a pending connect finished, waiting at most `timeout`
    /// (forever when `None`).
    fn poll_connect(&self, fd: Descriptor, timeout: Option<Duration>, waiter: &Waiter) -> io::Result<bool>;

    /// Accept a pending one-to-one association.
    fn accept(&self, fd: Descriptor, waiter: &Waiter) -> io::Result<(Descriptor, SocketAddr)>;

    /// Receive one message or notification into `buf`.
    ///
    /// Returns the number of payload bytes written together with the
    /// envelope describing what was read.
    fn receive(&self, fd: Descriptor, buf: &mut [u8], peek: bool, waiter: &Waiter) -> io::Result<(usize, ResultEnvelope)>;

    /// Send one message.
    fn send(&self, fd: Descriptor, buf: &[u8], params: &SendParams, waiter: &Waiter) -> io::Result<usize>;

    /// Local addresses the socket is bound to.
    fn local_addresses(&self, fd: Descriptor) -> io::Result<Vec<SocketAddr>>;

    /// Peer addresses of `assoc_id` (or of the only association).
    fn remote_addresses(&self, fd: Descriptor, assoc_id: Option<AssocId>) -> io::Result<Vec<SocketAddr>>;

    /// Read an option.
    fn get_option(&self, fd: Descriptor, name: OptionName, assoc_id: Option<AssocId>) -> io::Result<SocketOption>;

    /// Write an option.
    fn set_option(&self, fd: Descriptor, option: SocketOption, assoc_id: Option<AssocId>) -> io::Result<()>;

    /// Gracefully shut down `assoc_id` (or the only association).
    fn shutdown_association(&self, fd: Descriptor, assoc_id: Option<AssocId>) -> io::Result<()>;

    /// Move `assoc_id` onto a new one-to-one socket.
    fn branch_association(&self, fd: Descriptor, assoc_id: AssocId) -> io::Result<Descriptor>;

    /// Switch between blocking and non-blocking mode.
    fn set_nonblocking(&self, fd: Descriptor, nonblocking: bool) -> io::Result<()>;

    /// First half of a close: blocked and future calls fail with
    /// `Interrupted`, the descriptor stays allocated.
    fn pre_close(&self, fd: Descriptor) -> io::Result<()>;

    /// Release the descriptor.
    fn close(&self, fd: Descriptor) -> io::Result<()>;

    /// Make the blocking call identified by `waiter` return early.
    fn signal(&self, fd: Descriptor, waiter: &Waiter);
}

//! # SCTP Channel - Multi-Association Message Channels
//!
//! SCTP Channel is a Rust library that puts a safe, cancellable channel API
//! on top of a message-oriented transport where one endpoint can hold several
//! independent associations at once. The transport itself is reached through
//! the [`NativeTransport`] trait; this crate owns the state machines, the
//! association bookkeeping and the concurrency discipline around blocking
//! calls.
//!
//! ## Key Features
//!
//! - **Single-association channels**: [`SctpChannel`] with classic
//!   connect/accept semantics, plus the listening [`SctpServerChannel`]
//! - **Multiplexed channels**: [`SctpMultiChannel`] hosts many associations on
//!   one descriptor and demultiplexes traffic by association
//! - **Notifications**: association, peer address, send failure and shutdown
//!   events are delivered through `receive` to a [`NotificationHandler`], with
//!   the owning [`Association`] already resolved
//! - **Branching**: detach one association from a multiplexed channel into its
//!   own [`SctpChannel`]
//! - **Cancellable I/O**: closing a channel wakes threads blocked in it; the
//!   descriptor is released once the last of them has left
//!
//! ## How It Works
//!
//! Every channel keeps three locks: one serializing senders, one serializing
//! receivers and a short-lived state lock that is never held across a
//! blocking transport call or a user callback. Before a thread blocks in the
//! transport it records itself under the state lock, so a concurrent
//! [`close`](SctpChannel::close) can wake it through [`NativeTransport::signal`]
//! instead of waiting for it.
//!
//! Each native receive yields one [`ResultEnvelope`]. Data is copied into the
//! caller's buffer; notifications first pass an internal interceptor that
//! creates associations on COMM_UP and retires them on COMM_LOST/SHUTDOWN,
//! after the user handler for that notification has returned.
//!
//! ## Basic Usage
//!
//! The in-process [`LoopbackTransport`] makes the channels usable without a
//! kernel transport:
//!
//! ```rust
//! use std::sync::Arc;
//! use sctp_channel::{LoopbackTransport, MessageInfo, NativeTransport, SctpChannel, SctpMultiChannel};
//!
//! let transport: Arc<dyn NativeTransport> = Arc::new(LoopbackTransport::new());
//!
//! let server = SctpMultiChannel::open(transport.clone())?;
//! server.bind(Some("127.0.0.1:0".parse().unwrap()), 0)?;
//! let addr = server.local_addresses()?[0];
//!
//! let client = SctpChannel::open(transport.clone())?;
//! client.connect(addr)?;
//! client.send(b"hello", &MessageInfo::new(None, 0))?;
//!
//! // Without a handler, each notification ends the call; the first one is
//! // the COMM_UP of the client's association.
//! let mut buf = Vec::<u8>::new();
//! let info = loop {
//!     if let Some(info) = server.receive(&mut buf, &mut (), None)? {
//!         break info;
//!     }
//! };
//! assert_eq!(&buf[..], b"hello");
//! assert_eq!(info.association(), server.associations()?.first());
//! # Ok::<(), sctp_channel::ChannelError>(())
//! ```
//!
//! ## Configuration
//!
//! [`ChannelConfig`] sets the default listen backlog, the largest staging
//! buffer used by one receive and how many staging buffers a channel keeps.
//! Socket options go through [`SocketOption`] and are range-checked before
//! they reach the transport.

#![warn(missing_docs)]

mod association;
mod binding;
mod channel;
mod config;
mod envelope;
mod error;
mod inflight;
mod interceptor;
mod loopback;
mod message;
mod multi;
mod native;
mod notification;
mod options;
mod pool;
mod registry;
mod server;
mod shared;

pub use association::{AssocId, Association};
pub use channel::SctpChannel;
pub use config::{ChannelConfig, DEFAULT_BACKLOG, DEFAULT_MAX_RECEIVE_SIZE, DEFAULT_POOLED_BUFFERS};
pub use envelope::{
    AssocChangeEvent, AssocChangeRecord, PeerAddrChangeRecord, PeerAddressEvent, ReceivedMessage, ResultEnvelope,
    SendFailedRecord, ShutdownRecord,
};
pub use error::ChannelError;
pub use loopback::{DEFAULT_STREAMS, FIRST_EPHEMERAL_PORT, LoopbackTransport, SEND_FAILED_PEER_GONE};
pub use message::MessageInfo;
pub use multi::SctpMultiChannel;
pub use native::{ConnectStatus, Descriptor, NativeTransport, SendParams, Waiter};
pub use notification::{
    AssociationChange, HandlerResult, Notification, NotificationHandler, PeerAddressChange, SendFailed,
    ShutdownNotification,
};
pub use options::{InitMaxStreams, MAX_LINGER, OptionName, SocketOption};
pub use server::SctpServerChannel;

//! What one native receive call produces.
//!
//! The transport only knows association ids. The records here carry those
//! ids; the channel resolves them to [`Association`](crate::Association)
//! values before anything reaches user code.

use std::net::SocketAddr;

use crate::association::AssocId;

/// Outcome of exactly one native receive call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResultEnvelope {
    /// Nothing was ready (non-blocking) or the peer is gone.
    Nothing,
    /// A data message was copied into the caller's buffer.
    Message(ReceivedMessage),
    /// A message could not be delivered to the peer.
    SendFailed(SendFailedRecord),
    /// An association came up, went down or restarted.
    AssociationChanged(AssocChangeRecord),
    /// One of the peer's addresses changed state.
    PeerAddressChanged(PeerAddrChangeRecord),
    /// The peer started a graceful shutdown.
    Shutdown(ShutdownRecord),
}

impl ResultEnvelope {
    /// Whether this envelope carries a notification rather than data.
    pub fn is_notification(&self) -> bool {
        !matches!(self, ResultEnvelope::Nothing | ResultEnvelope::Message(_))
    }
}

/// Per-message metadata for received data.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReceivedMessage {
    /// Association the message arrived on.
    pub assoc_id: AssocId,
    /// Source address of the message.
    pub address: Option<SocketAddr>,
    /// Stream the message arrived on.
    pub stream: u16,
    /// Whether the message was sent unordered.
    pub unordered: bool,
    /// Payload protocol identifier.
    pub payload_protocol_id: u32,
    /// Whether this read completes the message.
    pub complete: bool,
}

/// Association lifecycle events.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AssocChangeEvent {
    /// The association is ready for data (COMM_UP).
    CommUp,
    /// The association failed (COMM_LOST).
    CommLost,
    /// The peer restarted.
    Restart,
    /// A graceful shutdown completed (SHUTDOWN_COMP).
    Shutdown,
    /// The association could not be set up.
    CantStart,
}

/// Native form of an association-change notification.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AssocChangeRecord {
    /// Association the event is about.
    pub assoc_id: AssocId,
    /// What happened.
    pub event: AssocChangeEvent,
    /// Negotiated inbound streams.
    pub max_inbound_streams: u16,
    /// Negotiated outbound streams.
    pub max_outbound_streams: u16,
}

/// Peer address state changes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PeerAddressEvent {
    /// The address is reachable again.
    AddrAvailable,
    /// The address can no longer be reached.
    AddrUnreachable,
    /// The peer removed the address from the association.
    AddrRemoved,
    /// The peer added the address to the association.
    AddrAdded,
    /// The address is now the primary destination.
    AddrMadePrimary,
    /// The address was confirmed.
    AddrConfirmed,
}

/// Native form of a peer-address-change notification.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerAddrChangeRecord {
    /// Association the address belongs to.
    pub assoc_id: AssocId,
    /// The peer address.
    pub address: SocketAddr,
    /// What happened to it.
    pub event: PeerAddressEvent,
}

/// Native form of a send-failed notification.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SendFailedRecord {
    /// Association the message was sent on.
    pub assoc_id: AssocId,
    /// Destination address, if known.
    pub address: Option<SocketAddr>,
    /// The undelivered payload.
    pub data: Vec<u8>,
    /// Transport specific error code.
    pub error_code: u32,
    /// Stream the message was sent on.
    pub stream: u16,
}

/// Native form of a shutdown notification.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShutdownRecord {
    /// Association being shut down.
    pub assoc_id: AssocId,
}

use std::net::SocketAddr;
use std::time::Duration;

use crate::association::Association;
use crate::envelope::ReceivedMessage;

/// Ancillary data for a message, outbound or inbound.
///
/// For sends, either an association or a peer address (or both) names the
/// destination. For receives the channel fills in the owning association,
/// the source address, stream, ordering flag, payload protocol id and the
/// number of bytes copied.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageInfo {
    association: Option<Association>,
    address: Option<SocketAddr>,
    stream: u16,
    unordered: bool,
    payload_protocol_id: u32,
    complete: bool,
    time_to_live: Option<Duration>,
    bytes: usize,
}

impl MessageInfo {
    /// Outbound message to `address` (or to the connected peer if `None`) on `stream`.
    pub fn new(address: Option<SocketAddr>, stream: u16) -> Self {
        MessageInfo {
            association: None,
            address,
            stream,
            unordered: false,
            payload_protocol_id: 0,
            complete: true,
            time_to_live: None,
            bytes: 0,
        }
    }

    /// Outbound message on an existing association.
    pub fn for_association(association: &Association, stream: u16) -> Self {
        MessageInfo {
            association: Some(*association),
            ..MessageInfo::new(None, stream)
        }
    }

    pub(crate) fn received(association: Option<Association>, message: &ReceivedMessage, bytes: usize) -> Self {
        MessageInfo {
            association,
            address: message.address,
            stream: message.stream,
            unordered: message.unordered,
            payload_protocol_id: message.payload_protocol_id,
            complete: message.complete,
            time_to_live: None,
            bytes,
        }
    }

    /// Prefer `address` as the destination within the association.
    pub fn with_address(mut self, address: SocketAddr) -> Self {
        self.address = Some(address);
        self
    }

    /// Deliver without ordering guarantees relative to the stream.
    pub fn with_unordered(mut self, unordered: bool) -> Self {
        self.unordered = unordered;
        self
    }

    /// Set the payload protocol identifier.
    pub fn with_payload_protocol_id(mut self, ppid: u32) -> Self {
        self.payload_protocol_id = ppid;
        self
    }

    /// Mark whether this send completes the message.
    pub fn with_complete(mut self, complete: bool) -> Self {
        self.complete = complete;
        self
    }

    /// Discard the message if not sent within `ttl`.
    pub fn with_time_to_live(mut self, ttl: Duration) -> Self {
        self.time_to_live = Some(ttl);
        self
    }

    /// Owning association.
    pub fn association(&self) -> Option<&Association> {
        self.association.as_ref()
    }

    /// Peer address.
    pub fn address(&self) -> Option<SocketAddr> {
        self.address
    }

    /// Stream number.
    pub fn stream(&self) -> u16 {
        self.stream
    }

    /// Unordered delivery flag.
    pub fn is_unordered(&self) -> bool {
        self.unordered
    }

    /// Payload protocol identifier.
    pub fn payload_protocol_id(&self) -> u32 {
        self.payload_protocol_id
    }

    /// Whether the message is complete.
    ///
    /// A received message that did not fit the buffer is delivered across
    /// several reads; all but the last report `false`.
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Time to live for outbound messages.
    pub fn time_to_live(&self) -> Option<Duration> {
        self.time_to_live
    }

    /// Number of bytes received.
    pub fn bytes(&self) -> usize {
        self.bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let assoc = Association::new(1, 4, 4);
        let info = MessageInfo::for_association(&assoc, 3)
            .with_unordered(true)
            .with_payload_protocol_id(51)
            .with_complete(false);
        assert_eq!(info.association(), Some(&assoc));
        assert_eq!(info.address(), None);
        assert_eq!(info.stream(), 3);
        assert!(info.is_unordered());
        assert_eq!(info.payload_protocol_id(), 51);
        assert!(!info.is_complete());
    }
}

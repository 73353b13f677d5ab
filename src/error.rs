use std::net::{IpAddr, SocketAddr};

use thiserror::Error;

use crate::association::AssocId;

/// Errors returned by the channel types.
///
/// Everything except [`ChannelError::Io`] is a usage error: a precondition
/// the caller violated. Those are reported synchronously and never retried.
/// `Io` carries a genuine transport failure.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The channel already has a local binding.
    #[error("channel is already bound")]
    AlreadyBound,

    /// The operation needs a bound channel.
    #[error("channel is not yet bound")]
    NotYetBound,

    /// The channel is already connected.
    #[error("channel is already connected")]
    AlreadyConnected,

    /// A non-blocking connect is in progress.
    #[error("connection is pending")]
    ConnectionPending,

    /// `finish_connect` was called without a pending connect.
    #[error("no connection is pending")]
    NoConnectionPending,

    /// The operation needs a connected channel.
    #[error("channel is not yet connected")]
    NotYetConnected,

    /// The channel (or its descriptor) has been closed.
    #[error("channel is closed")]
    Closed,

    /// The channel or association was shut down for sending.
    #[error("channel has been shut down for sending")]
    Shutdown,

    /// Incremental address management is not possible on a wildcard binding.
    #[error("channel is bound to the wildcard address")]
    WildcardBound,

    /// The address cannot be unbound.
    #[error("cannot unbind {address}: {reason}")]
    IllegalUnbind {
        /// Address the caller tried to remove.
        address: IpAddr,
        /// Why the removal was rejected.
        reason: &'static str,
    },

    /// Stream number outside the association's negotiated outbound streams.
    #[error("invalid stream {stream}: association allows {max_outbound} outbound streams")]
    InvalidStream {
        /// Requested stream.
        stream: u16,
        /// Negotiated maximum outbound streams.
        max_outbound: u16,
    },

    /// The association does not belong to this channel.
    #[error("association {0} is not owned by this channel")]
    NotOwned(AssocId),

    /// The preferred address does not belong to the given association.
    #[error("address {address} does not belong to association {association}")]
    AddressNotOwned {
        /// Preferred peer address.
        address: SocketAddr,
        /// Association the message was sent on.
        association: AssocId,
    },

    /// `receive` was re-entered from inside a notification handler.
    #[error("receive called from within a notification handler")]
    ReentrantReceive,

    /// The destination buffer has no room left.
    #[error("destination buffer has no remaining capacity")]
    BufferFull,

    /// A message argument was rejected.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// A socket option value was rejected before it reached the transport.
    #[error("invalid value for option {option}: {reason}")]
    InvalidOption {
        /// Option name.
        option: &'static str,
        /// What was wrong with the value.
        reason: &'static str,
    },

    /// The address is not usable with this transport.
    #[error("unresolved address {0}")]
    UnresolvedAddress(SocketAddr),

    /// Transport failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl ChannelError {
    /// Whether this error is a caller contract violation rather than a
    /// transport failure.
    pub fn is_usage_error(&self) -> bool {
        !matches!(self, ChannelError::Io(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usage_error_classification() {
        assert!(ChannelError::AlreadyBound.is_usage_error());
        assert!(ChannelError::InvalidStream { stream: 4, max_outbound: 4 }.is_usage_error());
        let io = ChannelError::from(std::io::Error::from(std::io::ErrorKind::ConnectionReset));
        assert!(!io.is_usage_error());
    }

    #[test]
    fn test_display() {
        let err = ChannelError::InvalidStream { stream: 12, max_outbound: 10 };
        assert_eq!(
            err.to_string(),
            "invalid stream 12: association allows 10 outbound streams"
        );
    }
}

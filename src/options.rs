//! Socket options understood by the channels, with the range checks applied
//! before a value is handed to the transport.

use std::fmt;
use std::net::SocketAddr;

use crate::error::ChannelError;

/// Largest linger value the transport accepts, in seconds.
pub const MAX_LINGER: i32 = 65535;

/// Requested stream counts for new associations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InitMaxStreams {
    /// Maximum inbound streams to accept.
    pub max_inbound: u16,
    /// Number of outbound streams to request.
    pub max_outbound: u16,
}

impl InitMaxStreams {
    /// Both counts must be at least one.
    pub fn new(max_inbound: u16, max_outbound: u16) -> Self {
        InitMaxStreams {
            max_inbound,
            max_outbound,
        }
    }
}

/// Option names, used to query a value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OptionName {
    /// `SCTP_DISABLE_FRAGMENTS`
    DisableFragments,
    /// `SCTP_EXPLICIT_COMPLETE`
    ExplicitComplete,
    /// `SCTP_FRAGMENT_INTERLEAVE`
    FragmentInterleave,
    /// `SCTP_INIT_MAXSTREAMS`
    InitMaxStreams,
    /// `SCTP_NODELAY`
    NoDelay,
    /// `SCTP_PRIMARY_ADDR`
    PrimaryAddress,
    /// `SCTP_SET_PEER_PRIMARY_ADDR`
    SetPeerPrimaryAddress,
    /// `SO_SNDBUF`
    SendBuffer,
    /// `SO_RCVBUF`
    ReceiveBuffer,
    /// `SO_LINGER`
    Linger,
}

impl OptionName {
    /// Options that act on one association and need one named when used on
    /// a multiplexed channel.
    pub fn is_per_association(&self) -> bool {
        matches!(self, OptionName::PrimaryAddress | OptionName::SetPeerPrimaryAddress)
    }

    /// Whether the option can be read back.
    pub fn is_readable(&self) -> bool {
        !matches!(self, OptionName::SetPeerPrimaryAddress)
    }

    /// Canonical name, used in errors and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            OptionName::DisableFragments => "SCTP_DISABLE_FRAGMENTS",
            OptionName::ExplicitComplete => "SCTP_EXPLICIT_COMPLETE",
            OptionName::FragmentInterleave => "SCTP_FRAGMENT_INTERLEAVE",
            OptionName::InitMaxStreams => "SCTP_INIT_MAXSTREAMS",
            OptionName::NoDelay => "SCTP_NODELAY",
            OptionName::PrimaryAddress => "SCTP_PRIMARY_ADDR",
            OptionName::SetPeerPrimaryAddress => "SCTP_SET_PEER_PRIMARY_ADDR",
            OptionName::SendBuffer => "SO_SNDBUF",
            OptionName::ReceiveBuffer => "SO_RCVBUF",
            OptionName::Linger => "SO_LINGER",
        }
    }
}

impl fmt::Display for OptionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An option together with its value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SocketOption {
    /// Fail sends larger than the path MTU instead of fragmenting them.
    DisableFragments(bool),
    /// Messages are only complete once sent with the complete flag set.
    ExplicitComplete(bool),
    /// Partial delivery interleave level, one of 0, 1 or 2.
    FragmentInterleave(u8),
    /// Stream counts requested for new associations.
    InitMaxStreams(InitMaxStreams),
    /// Disable the Nagle-like bundling delay.
    NoDelay(bool),
    /// Local preference for the peer's primary address.
    PrimaryAddress(SocketAddr),
    /// Ask the peer to use this local address as its primary.
    SetPeerPrimaryAddress(SocketAddr),
    /// Send buffer size in bytes.
    SendBuffer(usize),
    /// Receive buffer size in bytes.
    ReceiveBuffer(usize),
    /// Linger on close, in seconds. Negative disables lingering.
    Linger(i32),
}

impl SocketOption {
    /// The option's name.
    pub fn name(&self) -> OptionName {
        match self {
            SocketOption::DisableFragments(_) => OptionName::DisableFragments,
            SocketOption::ExplicitComplete(_) => OptionName::ExplicitComplete,
            SocketOption::FragmentInterleave(_) => OptionName::FragmentInterleave,
            SocketOption::InitMaxStreams(_) => OptionName::InitMaxStreams,
            SocketOption::NoDelay(_) => OptionName::NoDelay,
            SocketOption::PrimaryAddress(_) => OptionName::PrimaryAddress,
            SocketOption::SetPeerPrimaryAddress(_) => OptionName::SetPeerPrimaryAddress,
            SocketOption::SendBuffer(_) => OptionName::SendBuffer,
            SocketOption::ReceiveBuffer(_) => OptionName::ReceiveBuffer,
            SocketOption::Linger(_) => OptionName::Linger,
        }
    }

    /// Check the value and return the form that is passed to the transport.
    ///
    /// Linger is clamped into `0..=MAX_LINGER`; a negative linger is
    /// normalised to `-1`. Everything else is rejected when out of range.
    pub fn validate(self) -> Result<SocketOption, ChannelError> {
        let option = self.name().as_str();
        match self {
            SocketOption::FragmentInterleave(level) if level > 2 => Err(ChannelError::InvalidOption {
                option,
                reason: "interleave level must be 0, 1 or 2",
            }),
            SocketOption::InitMaxStreams(streams) if streams.max_inbound == 0 || streams.max_outbound == 0 => {
                Err(ChannelError::InvalidOption {
                    option,
                    reason: "stream counts must be at least 1",
                })
            }
            SocketOption::SendBuffer(0) | SocketOption::ReceiveBuffer(0) => Err(ChannelError::InvalidOption {
                option,
                reason: "buffer size must be positive",
            }),
            SocketOption::Linger(secs) if secs < 0 => Ok(SocketOption::Linger(-1)),
            SocketOption::Linger(secs) => Ok(SocketOption::Linger(secs.min(MAX_LINGER))),
            other => Ok(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linger_clamped() {
        assert_eq!(SocketOption::Linger(70_000).validate().unwrap(), SocketOption::Linger(MAX_LINGER));
        assert_eq!(SocketOption::Linger(-20).validate().unwrap(), SocketOption::Linger(-1));
        assert_eq!(SocketOption::Linger(5).validate().unwrap(), SocketOption::Linger(5));
    }

    #[test]
    fn test_interleave_range() {
        for level in 0..=2 {
            assert!(SocketOption::FragmentInterleave(level).validate().is_ok());
        }
        assert!(matches!(
            SocketOption::FragmentInterleave(3).validate(),
            Err(ChannelError::InvalidOption { option: "SCTP_FRAGMENT_INTERLEAVE", .. })
        ));
    }

    #[test]
    fn test_rejects_empty_values() {
        assert!(SocketOption::SendBuffer(0).validate().is_err());
        assert!(SocketOption::ReceiveBuffer(0).validate().is_err());
        assert!(SocketOption::InitMaxStreams(InitMaxStreams::new(0, 4)).validate().is_err());
        assert!(SocketOption::InitMaxStreams(InitMaxStreams::new(4, 4)).validate().is_ok());
    }

    #[test]
    fn test_per_association_options() {
        assert!(OptionName::PrimaryAddress.is_per_association());
        assert!(!OptionName::NoDelay.is_per_association());
        assert!(!OptionName::SetPeerPrimaryAddress.is_readable());
    }
}

use std::fmt;
use std::hash::{Hash, Hasher};

/// Identifier the transport assigns to an association.
pub type AssocId = u32;

/// One logical peer relationship.
///
/// An `Association` is created by a channel when it observes the
/// association coming up; user code never constructs one. Two values are
/// equal when their ids are equal, regardless of the stream counts.
#[derive(Clone, Copy, Debug)]
pub struct Association {
    id: AssocId,
    max_inbound_streams: u16,
    max_outbound_streams: u16,
}

impl Association {
    pub(crate) fn new(id: AssocId, max_inbound_streams: u16, max_outbound_streams: u16) -> Self {
        Association {
            id,
            max_inbound_streams,
            max_outbound_streams,
        }
    }

    /// The transport's identifier for this association.
    pub fn id(&self) -> AssocId {
        self.id
    }

    /// Number of inbound streams negotiated with the peer.
    pub fn max_inbound_streams(&self) -> u16 {
        self.max_inbound_streams
    }

    /// Number of outbound streams negotiated with the peer.
    pub fn max_outbound_streams(&self) -> u16 {
        self.max_outbound_streams
    }
}

impl PartialEq for Association {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Association {}

impl Hash for Association {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for Association {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Association {{ id: {}, in: {}, out: {} }}",
            self.id, self.max_inbound_streams, self.max_outbound_streams
        )
    }
}

//! Control-plane events delivered through `receive`, and the handler trait
//! user code implements to observe them.

use std::net::SocketAddr;

use crate::association::{AssocId, Association};
pub use crate::envelope::{AssocChangeEvent, PeerAddressEvent};

/// An association came up, was lost, restarted or finished shutting down.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AssociationChange {
    pub(crate) association: Option<Association>,
    pub(crate) event: AssocChangeEvent,
}

impl AssociationChange {
    /// The association the event refers to.
    ///
    /// `None` for [`AssocChangeEvent::CantStart`], where no association
    /// was ever established.
    pub fn association(&self) -> Option<&Association> {
        self.association.as_ref()
    }

    /// The lifecycle event.
    pub fn event(&self) -> AssocChangeEvent {
        self.event
    }
}

/// One of the peer's addresses changed state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerAddressChange {
    pub(crate) association: Option<Association>,
    pub(crate) address: SocketAddr,
    pub(crate) event: PeerAddressEvent,
}

impl PeerAddressChange {
    /// The association the address belongs to.
    pub fn association(&self) -> Option<&Association> {
        self.association.as_ref()
    }

    /// The peer address.
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// What happened to the address.
    pub fn event(&self) -> PeerAddressEvent {
        self.event
    }
}

/// A message could not be delivered.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SendFailed {
    pub(crate) association: Option<Association>,
    pub(crate) address: Option<SocketAddr>,
    pub(crate) data: Vec<u8>,
    pub(crate) error_code: u32,
    pub(crate) stream: u16,
}

impl SendFailed {
    /// The association the message was sent on, if it is still known.
    pub fn association(&self) -> Option<&Association> {
        self.association.as_ref()
    }

    /// Destination address of the failed message.
    pub fn address(&self) -> Option<SocketAddr> {
        self.address
    }

    /// The payload that was not delivered.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Transport specific error code.
    pub fn error_code(&self) -> u32 {
        self.error_code
    }

    /// Stream the message was sent on.
    pub fn stream(&self) -> u16 {
        self.stream
    }
}

/// The peer started a graceful shutdown; no more data will arrive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShutdownNotification {
    pub(crate) association: Option<Association>,
}

impl ShutdownNotification {
    /// The association being shut down.
    pub fn association(&self) -> Option<&Association> {
        self.association.as_ref()
    }
}

/// A control event delivered through the receive path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Notification {
    /// See [`AssociationChange`].
    AssociationChange(AssociationChange),
    /// See [`PeerAddressChange`].
    PeerAddressChange(PeerAddressChange),
    /// See [`SendFailed`].
    SendFailed(SendFailed),
    /// See [`ShutdownNotification`].
    Shutdown(ShutdownNotification),
}

impl Notification {
    /// The association the notification refers to.
    pub fn association(&self) -> Option<&Association> {
        match self {
            Notification::AssociationChange(n) => n.association(),
            Notification::PeerAddressChange(n) => n.association(),
            Notification::SendFailed(n) => n.association(),
            Notification::Shutdown(n) => n.association(),
        }
    }

    pub(crate) fn association_id(&self) -> Option<AssocId> {
        self.association().map(Association::id)
    }
}

/// What a notification handler wants the receive loop to do next.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandlerResult {
    /// Keep receiving.
    Continue,
    /// Return from `receive` without a message.
    Return,
}

/// Observes notifications delivered during `receive`.
///
/// Handlers run on the receiving thread while the channel's receive lock is
/// held, so a handler must not call `receive` on the same channel; that
/// call fails with [`ChannelError::ReentrantReceive`](crate::ChannelError::ReentrantReceive).
///
/// Either override [`handle_notification`](Self::handle_notification), or
/// override only the per-kind methods you care about; the others return
/// [`HandlerResult::Continue`].
///
/// Closures of the form `FnMut(&Notification, &mut A) -> HandlerResult`
/// implement this trait.
pub trait NotificationHandler<A> {
    /// Called for every notification.
    fn handle_notification(&mut self, notification: &Notification, attachment: &mut A) -> HandlerResult {
        match notification {
            Notification::AssociationChange(n) => self.handle_association_change(n, attachment),
            Notification::PeerAddressChange(n) => self.handle_peer_address_change(n, attachment),
            Notification::SendFailed(n) => self.handle_send_failed(n, attachment),
            Notification::Shutdown(n) => self.handle_shutdown(n, attachment),
        }
    }

    /// Called for association changes.
    fn handle_association_change(&mut self, _notification: &AssociationChange, _attachment: &mut A) -> HandlerResult {
        HandlerResult::Continue
    }

    /// Called for peer address changes.
    fn handle_peer_address_change(&mut self, _notification: &PeerAddressChange, _attachment: &mut A) -> HandlerResult {
        HandlerResult::Continue
    }

    /// Called for failed sends.
    fn handle_send_failed(&mut self, _notification: &SendFailed, _attachment: &mut A) -> HandlerResult {
        HandlerResult::Continue
    }

    /// Called when the peer shuts down.
    fn handle_shutdown(&mut self, _notification: &ShutdownNotification, _attachment: &mut A) -> HandlerResult {
        HandlerResult::Continue
    }
}

impl<A, F> NotificationHandler<A> for F
where
    F: FnMut(&Notification, &mut A) -> HandlerResult,
{
    fn handle_notification(&mut self, notification: &Notification, attachment: &mut A) -> HandlerResult {
        self(notification, attachment)
    }
}

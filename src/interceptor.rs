//! The handler every notification passes through before user code.
//!
//! It resolves the association id the transport reported into an
//! [`Association`], creates the association on COMM_UP, and marks it for
//! removal on COMM_LOST / SHUTDOWN. Removal is deferred: the receive loop
//! applies the [`PendingRemoval`] only after the user handler returned, so
//! the handler still sees a registered association.

use std::net::SocketAddr;

use crate::association::{AssocId, Association};
use crate::envelope::{AssocChangeEvent, PeerAddressEvent, ResultEnvelope};
use crate::notification::{
    AssociationChange, HandlerResult, Notification, NotificationHandler, PeerAddressChange, SendFailed,
    ShutdownNotification,
};

/// Association bookkeeping a channel exposes to the interceptor.
pub(crate) trait AssociationBook {
    fn resolve(&self, id: AssocId) -> Option<Association>;

    /// An association came up. Called only when `resolve` found nothing.
    fn establish(&mut self, association: Association);

    fn peer_address_changed(&mut self, _association: &Association, _address: SocketAddr, _event: PeerAddressEvent) {}
}

/// Association to deregister once the current notification was handled.
#[derive(Debug, Default)]
pub(crate) struct PendingRemoval(Option<Association>);

impl PendingRemoval {
    pub(crate) fn mark(&mut self, association: Option<&Association>) {
        if let Some(association) = association {
            self.0 = Some(*association);
        }
    }

    pub(crate) fn take(&mut self) -> Option<Association> {
        self.0.take()
    }
}

pub(crate) struct Interceptor<'a, B: AssociationBook> {
    book: &'a mut B,
}

impl<'a, B: AssociationBook> Interceptor<'a, B> {
    pub(crate) fn new(book: &'a mut B) -> Self {
        Interceptor { book }
    }

    /// Turn a native notification into its user-facing form, creating the
    /// association first if this is the event that brings it up. Returns
    /// `None` for data and empty envelopes.
    pub(crate) fn bind(&mut self, envelope: ResultEnvelope) -> Option<Notification> {
        let notification = match envelope {
            ResultEnvelope::Nothing | ResultEnvelope::Message(_) => return None,
            ResultEnvelope::AssociationChanged(record) => {
                let association = match record.event {
                    AssocChangeEvent::CommUp | AssocChangeEvent::Restart => {
                        match self.book.resolve(record.assoc_id) {
                            Some(existing) => Some(existing),
                            None => {
                                let created = Association::new(
                                    record.assoc_id,
                                    record.max_inbound_streams,
                                    record.max_outbound_streams,
                                );
                                log::debug!("association up: {created}");
                                self.book.establish(created);
                                Some(created)
                            }
                        }
                    }
                    AssocChangeEvent::CantStart => None,
                    AssocChangeEvent::CommLost | AssocChangeEvent::Shutdown => self.book.resolve(record.assoc_id),
                };
                Notification::AssociationChange(AssociationChange {
                    association,
                    event: record.event,
                })
            }
            ResultEnvelope::PeerAddressChanged(record) => Notification::PeerAddressChange(PeerAddressChange {
                association: self.book.resolve(record.assoc_id),
                address: record.address,
                event: record.event,
            }),
            ResultEnvelope::SendFailed(record) => Notification::SendFailed(SendFailed {
                association: self.book.resolve(record.assoc_id),
                address: record.address,
                data: record.data,
                error_code: record.error_code,
                stream: record.stream,
            }),
            ResultEnvelope::Shutdown(record) => Notification::Shutdown(ShutdownNotification {
                association: self.book.resolve(record.assoc_id),
            }),
        };
        Some(notification)
    }
}

impl<B: AssociationBook> NotificationHandler<PendingRemoval> for Interceptor<'_, B> {
    fn handle_association_change(&mut self, n: &AssociationChange, pending: &mut PendingRemoval) -> HandlerResult {
        if matches!(n.event(), AssocChangeEvent::CommLost | AssocChangeEvent::Shutdown) {
            pending.mark(n.association());
        }
        HandlerResult::Continue
    }

    fn handle_peer_address_change(&mut self, n: &PeerAddressChange, _pending: &mut PendingRemoval) -> HandlerResult {
        if let Some(association) = n.association() {
            self.book.peer_address_changed(association, n.address(), n.event());
        }
        HandlerResult::Continue
    }

    fn handle_shutdown(&mut self, n: &ShutdownNotification, pending: &mut PendingRemoval) -> HandlerResult {
        pending.mark(n.association());
        HandlerResult::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{AssocChangeRecord, ShutdownRecord};
    use std::collections::HashMap;

    #[derive(Default)]
    struct Book {
        known: HashMap<AssocId, Association>,
    }

    impl AssociationBook for Book {
        fn resolve(&self, id: AssocId) -> Option<Association> {
            self.known.get(&id).copied()
        }

        fn establish(&mut self, association: Association) {
            self.known.insert(association.id(), association);
        }
    }

    fn up(id: AssocId) -> ResultEnvelope {
        ResultEnvelope::AssociationChanged(AssocChangeRecord {
            assoc_id: id,
            event: AssocChangeEvent::CommUp,
            max_inbound_streams: 5,
            max_outbound_streams: 6,
        })
    }

    #[test]
    fn test_comm_up_creates_once() {
        let mut book = Book::default();
        let mut interceptor = Interceptor::new(&mut book);
        let first = interceptor.bind(up(9)).unwrap();
        let second = interceptor.bind(up(9)).unwrap();
        assert_eq!(first.association_id(), Some(9));
        assert_eq!(second.association().map(|a| a.max_outbound_streams()), Some(6));
        assert_eq!(book.known.len(), 1);
    }

    #[test]
    fn test_shutdown_marks_pending_and_continues() {
        let mut book = Book::default();
        let mut interceptor = Interceptor::new(&mut book);
        interceptor.bind(up(2));
        let n = interceptor
            .bind(ResultEnvelope::Shutdown(ShutdownRecord { assoc_id: 2 }))
            .unwrap();

        let mut pending = PendingRemoval::default();
        assert_eq!(interceptor.handle_notification(&n, &mut pending), HandlerResult::Continue);
        assert_eq!(pending.take().map(|a| a.id()), Some(2));
        assert!(pending.take().is_none());
    }

    #[test]
    fn test_data_is_not_a_notification() {
        let mut book = Book::default();
        let mut interceptor = Interceptor::new(&mut book);
        assert!(interceptor.bind(ResultEnvelope::Nothing).is_none());
    }
}

//! One-to-many channel.
//!
//! An [`SctpMultiChannel`] hosts any number of associations on one
//! descriptor. Inbound data and notifications are demultiplexed by
//! association id; outbound messages name their association directly or by
//! one of its peer addresses. A message to an address no association owns
//! sets up a new association on the fly. That association shows up in
//! [`associations`](SctpMultiChannel::associations) only after a later
//! receive drained its COMM_UP.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use bytes::BufMut;

use crate::association::{AssocId, Association};
use crate::binding::LocalBinding;
use crate::channel::SctpChannel;
use crate::config::ChannelConfig;
use crate::envelope::PeerAddressEvent;
use crate::error::ChannelError;
use crate::inflight::{IoTracker, Lifecycle, Slot};
use crate::interceptor::AssociationBook;
use crate::message::MessageInfo;
use crate::native::{Descriptor, NativeTransport, SendParams};
use crate::notification::NotificationHandler;
use crate::options::{OptionName, SocketOption};
use crate::registry::AssociationRegistry;
use crate::shared::{ChannelCore, Demultiplex, ReceiveMode};

/// Descriptor validity of a multiplexed channel. Binding and association
/// lifecycles are tracked separately.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum MultiChannelState {
    Open,
    KillPending,
    Killed,
}

pub(crate) struct MultiInner {
    state: MultiChannelState,
    binding: LocalBinding,
    registry: AssociationRegistry,
    shut_down: HashSet<AssocId>,
    io: IoTracker,
    transport: Arc<dyn NativeTransport>,
    fd: Descriptor,
}

impl MultiInner {
    fn check_open(&self) -> Result<(), ChannelError> {
        if self.is_open() { Ok(()) } else { Err(ChannelError::Closed) }
    }

    fn owned(&self, association: &Association) -> Result<Association, ChannelError> {
        self.registry
            .get(association.id())
            .ok_or(ChannelError::NotOwned(association.id()))
    }

    fn per_association(&self, name: OptionName, association: Option<&Association>) -> Result<Option<AssocId>, ChannelError> {
        match association {
            Some(association) => Ok(Some(self.owned(association)?.id())),
            None if name.is_per_association() => Err(ChannelError::InvalidOption {
                option: name.as_str(),
                reason: "an association is required",
            }),
            None => Ok(None),
        }
    }

    fn send_params(&self, info: &MessageInfo) -> Result<SendParams, ChannelError> {
        let association = match (info.association(), info.address()) {
            (Some(requested), address) => {
                let association = self.owned(requested)?;
                if let Some(address) = address {
                    if self.registry.association_for(&address) != Some(association) {
                        return Err(ChannelError::AddressNotOwned {
                            address,
                            association: association.id(),
                        });
                    }
                }
                Some(association)
            }
            (None, Some(address)) if address.ip().is_unspecified() || address.port() == 0 => {
                return Err(ChannelError::UnresolvedAddress(address));
            }
            (None, Some(address)) => self.registry.association_for(&address),
            (None, None) => return Err(ChannelError::InvalidArgument("message has no destination")),
        };

        if let Some(association) = association {
            if self.shut_down.contains(&association.id()) {
                return Err(ChannelError::Shutdown);
            }
            if info.stream() >= association.max_outbound_streams() {
                return Err(ChannelError::InvalidStream {
                    stream: info.stream(),
                    max_outbound: association.max_outbound_streams(),
                });
            }
        }
        Ok(SendParams {
            address: info.address(),
            assoc_id: association.map(|a| a.id()),
            stream: info.stream(),
            unordered: info.is_unordered(),
            payload_protocol_id: info.payload_protocol_id(),
            complete: info.is_complete(),
            time_to_live: info.time_to_live(),
        })
    }
}

impl Lifecycle for MultiInner {
    fn io(&mut self) -> &mut IoTracker {
        &mut self.io
    }

    fn io_ref(&self) -> &IoTracker {
        &self.io
    }

    fn is_open(&self) -> bool {
        self.state == MultiChannelState::Open
    }

    fn is_kill_pending(&self) -> bool {
        self.state == MultiChannelState::KillPending
    }

    fn mark_kill_pending(&mut self) {
        self.state = MultiChannelState::KillPending;
    }

    fn mark_killed(&mut self) {
        self.state = MultiChannelState::Killed;
    }
}

impl AssociationBook for MultiInner {
    fn resolve(&self, id: AssocId) -> Option<Association> {
        self.registry.get(id)
    }

    fn establish(&mut self, association: Association) {
        let addresses = match self.transport.remote_addresses(self.fd, Some(association.id())) {
            Ok(addresses) => addresses,
            Err(err) => {
                log::debug!("{} peer addresses of {association} unknown: {err}", self.fd);
                Vec::new()
            }
        };
        self.registry.insert(association, addresses);
    }

    fn peer_address_changed(&mut self, association: &Association, address: SocketAddr, event: PeerAddressEvent) {
        let id = association.id();
        match event {
            PeerAddressEvent::AddrAdded | PeerAddressEvent::AddrAvailable | PeerAddressEvent::AddrConfirmed => {
                self.registry.add_address(id, address);
            }
            PeerAddressEvent::AddrRemoved | PeerAddressEvent::AddrUnreachable => {
                if !self.registry.remove_address(id, &address) {
                    log::trace!("{} kept {address} on {association}", self.fd);
                }
            }
            PeerAddressEvent::AddrMadePrimary => {}
        }
    }
}

impl Demultiplex for MultiInner {
    fn check_receive(&self, _mode: ReceiveMode) -> Result<(), ChannelError> {
        if self.binding.is_bound() { Ok(()) } else { Err(ChannelError::NotYetBound) }
    }

    fn deregister(&mut self, association: &Association) {
        self.registry.remove(association.id());
        self.shut_down.remove(&association.id());
    }
}

/// A channel multiplexing many associations over one descriptor.
pub struct SctpMultiChannel {
    core: ChannelCore<MultiInner>,
}

impl SctpMultiChannel {
    /// Open an unbound multiplexed channel with the default configuration.
    pub fn open(transport: Arc<dyn NativeTransport>) -> Result<Self, ChannelError> {
        Self::open_with_config(transport, ChannelConfig::default())
    }

    /// Open an unbound multiplexed channel.
    pub fn open_with_config(transport: Arc<dyn NativeTransport>, config: ChannelConfig) -> Result<Self, ChannelError> {
        let fd = transport.create_socket(true)?;
        log::debug!("{fd} opened (multiplexed)");
        let inner = MultiInner {
            state: MultiChannelState::Open,
            binding: LocalBinding::default(),
            registry: AssociationRegistry::default(),
            shut_down: HashSet::new(),
            io: IoTracker::default(),
            transport: transport.clone(),
            fd,
        };
        Ok(SctpMultiChannel {
            core: ChannelCore::new(transport, fd, config, inner),
        })
    }

    /// The transport descriptor.
    pub fn descriptor(&self) -> Descriptor {
        self.core.fd
    }

    /// Whether the channel was not closed yet.
    pub fn is_open(&self) -> bool {
        self.core.is_open()
    }

    /// Bind and accept new associations. A `backlog` below 1 uses the
    /// configured default.
    pub fn bind(&self, local: Option<SocketAddr>, backlog: i32) -> Result<(), ChannelError> {
        let mut st = self.core.state.lock();
        st.check_open()?;
        self.bind_locked(&mut st, local, backlog)
    }

    fn bind_locked(&self, st: &mut MultiInner, local: Option<SocketAddr>, backlog: i32) -> Result<(), ChannelError> {
        st.binding.bind(self.core.transport(), self.core.fd, local)?;
        let backlog = self.core.config.backlog(backlog);
        self.core.transport().listen(self.core.fd, backlog)?;
        log::debug!("{} listening, backlog {backlog}", self.core.fd);
        Ok(())
    }

    /// Add a local address on the bound port.
    pub fn bind_address(&self, address: IpAddr) -> Result<(), ChannelError> {
        let mut st = self.core.state.lock();
        st.check_open()?;
        st.binding.add(self.core.transport(), self.core.fd, address)
    }

    /// Remove a local address. The last address cannot be removed.
    pub fn unbind_address(&self, address: IpAddr) -> Result<(), ChannelError> {
        let mut st = self.core.state.lock();
        st.check_open()?;
        st.binding.remove(self.core.transport(), self.core.fd, address)
    }

    /// Bound local addresses; empty if not bound.
    pub fn local_addresses(&self) -> Result<Vec<SocketAddr>, ChannelError> {
        let st = self.core.state.lock();
        st.check_open()?;
        Ok(st.binding.addresses())
    }

    /// Registered associations, ordered by id.
    pub fn associations(&self) -> Result<Vec<Association>, ChannelError> {
        let st = self.core.state.lock();
        st.check_open()?;
        if !st.binding.is_bound() {
            return Err(ChannelError::NotYetBound);
        }
        Ok(st.registry.associations())
    }

    /// Peer addresses of `association`.
    ///
    /// Falls back to the addresses recorded for it when the transport can
    /// no longer enumerate them.
    pub fn remote_addresses(&self, association: &Association) -> Result<Vec<SocketAddr>, ChannelError> {
        let st = self.core.state.lock();
        st.check_open()?;
        let association = st.owned(association)?;
        match self.core.transport().remote_addresses(self.core.fd, Some(association.id())) {
            Ok(addresses) if !addresses.is_empty() => Ok(addresses),
            Ok(_) => Ok(st.registry.addresses_of(association.id()).unwrap_or_default()),
            Err(err) => {
                log::debug!("{} using recorded addresses of {association}: {err}", self.core.fd);
                Ok(st.registry.addresses_of(association.id()).unwrap_or_default())
            }
        }
    }

    /// Receive one message into `buf`; see [`SctpChannel::receive`]. The
    /// returned [`MessageInfo`] names the association the message arrived on.
    pub fn receive<B, A>(
        &self,
        buf: &mut B,
        attachment: &mut A,
        handler: Option<&mut dyn NotificationHandler<A>>,
    ) -> Result<Option<MessageInfo>, ChannelError>
    where
        B: BufMut,
    {
        let _session = self.core.receive_session()?;
        self.core.receive_loop(ReceiveMode::User, buf, attachment, handler)
    }

    /// Send one message to the association or peer address `info` names.
    ///
    /// Sending to an address no association owns sets up a new association.
    /// An unbound channel is bound to an ephemeral port first.
    pub fn send(&self, data: &[u8], info: &MessageInfo) -> Result<usize, ChannelError> {
        if data.is_empty() {
            return Err(ChannelError::InvalidArgument("empty message"));
        }
        let _send = self.core.send_lock.lock();
        {
            let mut st = self.core.state.lock();
            st.check_open()?;
            if !st.binding.is_bound() {
                self.bind_locked(&mut st, None, 0)?;
            }
        }
        let (guard, params) = self.core.enter(Slot::Sender, |st| st.send_params(info))?;
        if params.assoc_id.is_none() {
            log::debug!("{} first contact with {:?}", self.core.fd, params.address);
        }
        let sent = self
            .core
            .retry(|| self.core.transport().send(self.core.fd, data, &params, guard.waiter()))?;
        Ok(sent.unwrap_or(0))
    }

    /// Move `association` onto a new single-association channel.
    ///
    /// Afterwards this channel no longer sends or receives for it. May be
    /// called from a notification handler, e.g. on COMM_UP.
    pub fn branch(&self, association: &Association) -> Result<SctpChannel, ChannelError> {
        let _receive = self.core.receive_exclusion();
        let _send = self.core.send_lock.lock();
        let (fd, association, addresses) = {
            let mut st = self.core.state.lock();
            st.check_open()?;
            let association = st.owned(association)?;
            let fd = self.core.transport().branch_association(self.core.fd, association.id())?;
            let addresses = st
                .registry
                .remove(association.id())
                .map(|(_, mut addresses)| {
                    addresses.sort();
                    addresses
                })
                .unwrap_or_default();
            st.shut_down.remove(&association.id());
            (fd, association, addresses)
        };
        log::debug!("{} branched {association} onto {fd}", self.core.fd);
        Ok(SctpChannel::from_branch(
            self.core.transport.clone(),
            fd,
            self.core.config.clone(),
            association,
            addresses,
        ))
    }

    /// Shut down `association` for sending. A second call does nothing.
    pub fn shutdown(&self, association: &Association) -> Result<(), ChannelError> {
        let mut st = self.core.state.lock();
        st.check_open()?;
        let association = st.owned(association)?;
        if st.shut_down.contains(&association.id()) {
            return Ok(());
        }
        self.core
            .transport()
            .shutdown_association(self.core.fd, Some(association.id()))?;
        st.shut_down.insert(association.id());
        log::debug!("{} shut down {association}", self.core.fd);
        Ok(())
    }

    /// Set a socket option, for one association when `association` is given.
    pub fn set_option(&self, option: SocketOption, association: Option<&Association>) -> Result<(), ChannelError> {
        let option = option.validate()?;
        let st = self.core.state.lock();
        st.check_open()?;
        let id = st.per_association(option.name(), association)?;
        self.core.transport().set_option(self.core.fd, option, id)?;
        Ok(())
    }

    /// Read a socket option, for one association when `association` is given.
    pub fn get_option(&self, name: OptionName, association: Option<&Association>) -> Result<SocketOption, ChannelError> {
        if !name.is_readable() {
            return Err(ChannelError::InvalidOption {
                option: name.as_str(),
                reason: "option is write-only",
            });
        }
        let st = self.core.state.lock();
        st.check_open()?;
        let id = st.per_association(name, association)?;
        Ok(self.core.transport().get_option(self.core.fd, name, id)?)
    }

    /// Switch between blocking and non-blocking mode.
    pub fn configure_blocking(&self, blocking: bool) -> Result<(), ChannelError> {
        let st = self.core.state.lock();
        st.check_open()?;
        self.core.transport().set_nonblocking(self.core.fd, !blocking)?;
        Ok(())
    }

    /// Close the channel and every association on it.
    pub fn close(&self) -> Result<(), ChannelError> {
        self.core.close()
    }
}

impl Drop for SctpMultiChannel {
    fn drop(&mut self) {
        if let Err(err) = self.core.close() {
            log::warn!("{} close on drop failed: {err}", self.core.fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::LoopbackTransport;
    use crate::notification::{HandlerResult, Notification};

    fn multi(transport: &Arc<dyn NativeTransport>) -> SctpMultiChannel {
        let multi = SctpMultiChannel::open(transport.clone()).unwrap();
        multi.bind(Some("127.0.0.1:0".parse().unwrap()), 0).unwrap();
        multi
    }

    fn drain_one(multi: &SctpMultiChannel) {
        let mut handler = |_: &Notification, _: &mut ()| HandlerResult::Return;
        multi.receive(&mut Vec::<u8>::new(), &mut (), Some(&mut handler)).unwrap();
    }

    #[test]
    fn test_comm_up_records_every_peer_address() {
        let transport: Arc<dyn NativeTransport> = Arc::new(LoopbackTransport::new());
        let server = multi(&transport);
        let addr = server.local_addresses().unwrap()[0];

        let client = SctpChannel::open(transport).unwrap();
        client.bind(Some("127.0.0.1:0".parse().unwrap())).unwrap();
        client.bind_address("127.0.0.2".parse().unwrap()).unwrap();
        client.connect(addr).unwrap();
        drain_one(&server);

        let expected = client.local_addresses().unwrap();
        let st = server.core.state.lock();
        let association = st.registry.associations()[0];
        let mut recorded = st.registry.addresses_of(association.id()).unwrap();
        recorded.sort();
        assert_eq!(recorded, expected);
        for address in &expected {
            assert_eq!(st.registry.association_for(address), Some(association));
        }
    }

    #[test]
    fn test_registry_cleared_on_shutdown() {
        let transport: Arc<dyn NativeTransport> = Arc::new(LoopbackTransport::new());
        let server = multi(&transport);
        let client = SctpChannel::open(transport).unwrap();
        client.connect(server.local_addresses().unwrap()[0]).unwrap();
        drain_one(&server);

        let association = server.associations().unwrap()[0];
        server.shutdown(&association).unwrap();
        assert!(server.core.state.lock().shut_down.contains(&association.id()));

        drain_one(&server);
        let st = server.core.state.lock();
        assert_eq!(st.registry.len(), 0);
        assert!(st.shut_down.is_empty());
    }

    #[test]
    fn test_first_contact_leaves_association_unresolved() {
        let transport: Arc<dyn NativeTransport> = Arc::new(LoopbackTransport::new());
        let server = multi(&transport);
        let client = multi(&transport);
        let target = server.local_addresses().unwrap()[0];

        let params = client
            .core
            .state
            .lock()
            .send_params(&MessageInfo::new(Some(target), 0))
            .unwrap();
        assert_eq!(params.assoc_id, None);
        assert_eq!(params.address, Some(target));
    }
}

//! Single-association channel.
//!
//! An [`SctpChannel`] carries at most one association. It is created by
//! [`SctpChannel::open`] and connected with [`connect`](SctpChannel::connect),
//! or handed out already connected by [`SctpServerChannel::accept`](crate::SctpServerChannel::accept)
//! and [`SctpMultiChannel::branch`](crate::SctpMultiChannel::branch).

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, BytesMut};

use crate::association::{AssocId, Association};
use crate::binding::LocalBinding;
use crate::config::ChannelConfig;
use crate::envelope::PeerAddressEvent;
use crate::error::ChannelError;
use crate::inflight::{IoTracker, Lifecycle, Slot};
use crate::interceptor::AssociationBook;
use crate::message::MessageInfo;
use crate::native::{ConnectStatus, Descriptor, NativeTransport, SendParams};
use crate::notification::NotificationHandler;
use crate::options::{OptionName, SocketOption};
use crate::shared::{ChannelCore, Demultiplex, ReceiveMode};

/// Lifecycle of a single-association channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ChannelState {
    Unconnected,
    Pending,
    Connected,
    KillPending,
    Killed,
}

pub(crate) struct ChannelInner {
    state: ChannelState,
    binding: LocalBinding,
    association: Option<Association>,
    /// Last peer address set the transport reported.
    remote_addresses: Vec<SocketAddr>,
    pending_remote: Option<SocketAddr>,
    shut_down: bool,
    blocking: bool,
    io: IoTracker,
}

impl ChannelInner {
    fn new(state: ChannelState) -> Self {
        ChannelInner {
            state,
            binding: LocalBinding::default(),
            association: None,
            remote_addresses: Vec::new(),
            pending_remote: None,
            shut_down: false,
            blocking: true,
            io: IoTracker::default(),
        }
    }

    fn check_unconnected(&self) -> Result<(), ChannelError> {
        match self.state {
            ChannelState::Unconnected => Ok(()),
            ChannelState::Pending => Err(ChannelError::ConnectionPending),
            ChannelState::Connected => Err(ChannelError::AlreadyConnected),
            ChannelState::KillPending | ChannelState::Killed => Err(ChannelError::Closed),
        }
    }

    fn connected_association(&self) -> Result<Association, ChannelError> {
        match (self.state, self.association) {
            (ChannelState::Connected, Some(association)) => Ok(association),
            _ => Err(ChannelError::NotYetConnected),
        }
    }

    fn send_params(&self, info: &MessageInfo) -> Result<SendParams, ChannelError> {
        let association = self.connected_association()?;
        if self.shut_down {
            return Err(ChannelError::Shutdown);
        }
        if let Some(requested) = info.association() {
            if *requested != association {
                return Err(ChannelError::NotOwned(requested.id()));
            }
        }
        if info.stream() >= association.max_outbound_streams() {
            return Err(ChannelError::InvalidStream {
                stream: info.stream(),
                max_outbound: association.max_outbound_streams(),
            });
        }
        if let Some(address) = info.address() {
            if !self.remote_addresses.contains(&address) {
                return Err(ChannelError::AddressNotOwned {
                    address,
                    association: association.id(),
                });
            }
        }
        Ok(SendParams {
            address: info.address(),
            assoc_id: Some(association.id()),
            stream: info.stream(),
            unordered: info.is_unordered(),
            payload_protocol_id: info.payload_protocol_id(),
            complete: info.is_complete(),
            time_to_live: info.time_to_live(),
        })
    }
}

impl Lifecycle for ChannelInner {
    fn io(&mut self) -> &mut IoTracker {
        &mut self.io
    }

    fn io_ref(&self) -> &IoTracker {
        &self.io
    }

    fn is_open(&self) -> bool {
        matches!(
            self.state,
            ChannelState::Unconnected | ChannelState::Pending | ChannelState::Connected
        )
    }

    fn is_kill_pending(&self) -> bool {
        self.state == ChannelState::KillPending
    }

    fn mark_kill_pending(&mut self) {
        self.state = ChannelState::KillPending;
    }

    fn mark_killed(&mut self) {
        self.state = ChannelState::Killed;
    }
}

impl AssociationBook for ChannelInner {
    fn resolve(&self, _id: AssocId) -> Option<Association> {
        self.association
    }

    fn establish(&mut self, association: Association) {
        self.association = Some(association);
    }

    fn peer_address_changed(&mut self, _association: &Association, address: SocketAddr, event: PeerAddressEvent) {
        match event {
            PeerAddressEvent::AddrAdded | PeerAddressEvent::AddrAvailable | PeerAddressEvent::AddrConfirmed => {
                if !self.remote_addresses.contains(&address) {
                    self.remote_addresses.push(address);
                }
            }
            PeerAddressEvent::AddrRemoved | PeerAddressEvent::AddrUnreachable => {
                if self.remote_addresses.len() > 1 {
                    self.remote_addresses.retain(|a| *a != address);
                }
            }
            PeerAddressEvent::AddrMadePrimary => {}
        }
    }
}

impl Demultiplex for ChannelInner {
    fn check_receive(&self, mode: ReceiveMode) -> Result<(), ChannelError> {
        match (mode, self.state) {
            (_, ChannelState::Connected) => Ok(()),
            (ReceiveMode::Establish, ChannelState::Pending) => Ok(()),
            _ => Err(ChannelError::NotYetConnected),
        }
    }
}

/// A channel carrying at most one association.
///
/// Sends and receives may run concurrently from different threads; calls in
/// the same direction are serialized. [`close`](Self::close) never blocks:
/// threads parked in the transport are woken and the descriptor is released
/// by the last of them.
pub struct SctpChannel {
    core: ChannelCore<ChannelInner>,
}

impl SctpChannel {
    /// Open an unconnected channel with the default configuration.
    pub fn open(transport: Arc<dyn NativeTransport>) -> Result<Self, ChannelError> {
        Self::open_with_config(transport, ChannelConfig::default())
    }

    /// Open an unconnected channel.
    pub fn open_with_config(transport: Arc<dyn NativeTransport>, config: ChannelConfig) -> Result<Self, ChannelError> {
        let fd = transport.create_socket(false)?;
        log::debug!("{fd} opened");
        Ok(SctpChannel {
            core: ChannelCore::new(transport, fd, config, ChannelInner::new(ChannelState::Unconnected)),
        })
    }

    /// Wrap a descriptor returned by accept. The association's COMM_UP is
    /// consumed before this returns.
    pub(crate) fn from_accepted(
        transport: Arc<dyn NativeTransport>,
        fd: Descriptor,
        config: ChannelConfig,
    ) -> Result<Self, ChannelError> {
        let channel = SctpChannel {
            core: ChannelCore::new(transport, fd, config, ChannelInner::new(ChannelState::Pending)),
        };
        {
            let mut st = channel.core.state.lock();
            st.binding.adopt(channel.core.transport(), fd);
        }
        channel.establish()?;
        Ok(channel)
    }

    /// Wrap a descriptor carved out of a multiplexed channel.
    pub(crate) fn from_branch(
        transport: Arc<dyn NativeTransport>,
        fd: Descriptor,
        config: ChannelConfig,
        association: Association,
        remote_addresses: Vec<SocketAddr>,
    ) -> Self {
        let mut inner = ChannelInner::new(ChannelState::Connected);
        inner.binding.adopt(transport.as_ref(), fd);
        inner.association = Some(association);
        inner.remote_addresses = remote_addresses;
        SctpChannel {
            core: ChannelCore::new(transport, fd, config, inner),
        }
    }

    /// The transport descriptor.
    pub fn descriptor(&self) -> Descriptor {
        self.core.fd
    }

    /// Whether the channel was not closed yet.
    pub fn is_open(&self) -> bool {
        self.core.is_open()
    }

    /// Bind to `local`, or to an ephemeral port on the wildcard address.
    pub fn bind(&self, local: Option<SocketAddr>) -> Result<(), ChannelError> {
        let mut st = self.core.state.lock();
        if !st.is_open() {
            return Err(ChannelError::Closed);
        }
        st.check_unconnected()?;
        st.binding.bind(self.core.transport(), self.core.fd, local)
    }

    /// Add a local address on the bound port.
    pub fn bind_address(&self, address: IpAddr) -> Result<(), ChannelError> {
        let mut st = self.core.state.lock();
        if !st.is_open() {
            return Err(ChannelError::Closed);
        }
        if st.state == ChannelState::Pending {
            return Err(ChannelError::ConnectionPending);
        }
        st.binding.add(self.core.transport(), self.core.fd, address)
    }

    /// Remove a local address. The last address cannot be removed.
    pub fn unbind_address(&self, address: IpAddr) -> Result<(), ChannelError> {
        let mut st = self.core.state.lock();
        if !st.is_open() {
            return Err(ChannelError::Closed);
        }
        if st.state == ChannelState::Pending {
            return Err(ChannelError::ConnectionPending);
        }
        st.binding.remove(self.core.transport(), self.core.fd, address)
    }

    /// Connect to `remote`.
    ///
    /// Returns `true` once the association is up. On a non-blocking channel
    /// that cannot finish right away, returns `false` and leaves the
    /// connection pending; complete it with [`finish_connect`](Self::finish_connect).
    pub fn connect(&self, remote: SocketAddr) -> Result<bool, ChannelError> {
        if remote.ip().is_unspecified() || remote.port() == 0 {
            return Err(ChannelError::UnresolvedAddress(remote));
        }
        let _session = self.core.receive_session()?;
        let _send = self.core.send_lock.lock();

        let status = {
            let (guard, ()) = self.core.enter(Slot::Receiver, ChannelInner::check_unconnected)?;
            match self
                .core
                .retry(|| self.core.transport().connect(self.core.fd, remote))
            {
                Ok(Some(status)) => status,
                Ok(None) => return Ok(false),
                Err(err) => {
                    drop(guard);
                    return Err(self.core.fail(err));
                }
            }
        };

        {
            let mut st = self.core.state.lock();
            if !st.is_open() {
                return Err(ChannelError::Closed);
            }
            st.state = ChannelState::Pending;
            st.pending_remote = Some(remote);
            if !st.binding.is_bound() {
                st.binding.adopt(self.core.transport(), self.core.fd);
            }
        }
        log::debug!("{} connecting to {remote}: {status:?}", self.core.fd);

        match status {
            ConnectStatus::InProgress => Ok(false),
            ConnectStatus::Connected => self.establish().map(|()| true),
        }
    }

    /// Complete a pending connect.
    ///
    /// Blocks until the connect finishes on a blocking channel; returns
    /// `false` on a non-blocking channel whose connect is still underway.
    pub fn finish_connect(&self) -> Result<bool, ChannelError> {
        let _session = self.core.receive_session()?;
        let _send = self.core.send_lock.lock();

        let done = {
            let (guard, blocking) = self.core.enter(Slot::Receiver, |st| match st.state {
                ChannelState::Pending => Ok(Some(st.blocking)),
                ChannelState::Connected => Ok(None),
                _ => Err(ChannelError::NoConnectionPending),
            })?;
            let Some(blocking) = blocking else {
                return Ok(true);
            };
            let timeout = if blocking { None } else { Some(Duration::ZERO) };
            match self
                .core
                .retry(|| self.core.transport().poll_connect(self.core.fd, timeout, guard.waiter()))
            {
                Ok(done) => done.unwrap_or(false),
                Err(err) => {
                    drop(guard);
                    return Err(self.core.fail(err));
                }
            }
        };
        if !done {
            return Ok(false);
        }
        self.establish()?;
        Ok(true)
    }

    /// Whether a connect was started and not yet finished.
    pub fn is_connection_pending(&self) -> bool {
        self.core.state.lock().state == ChannelState::Pending
    }

    /// Consume the COMM_UP of a freshly set up association and move to
    /// connected. Any failure closes the channel.
    fn establish(&self) -> Result<(), ChannelError> {
        let mut scratch = BytesMut::new();
        if let Err(err) = self
            .core
            .receive_loop::<_, ()>(ReceiveMode::Establish, &mut scratch, &mut (), None)
        {
            return Err(self.core.fail(err));
        }

        let mut st = self.core.state.lock();
        if !st.is_open() {
            return Err(ChannelError::Closed);
        }
        let Some(association) = st.association else {
            drop(st);
            let err = io::Error::new(io::ErrorKind::ConnectionRefused, "association did not come up");
            return Err(self.core.fail(err.into()));
        };
        st.state = ChannelState::Connected;
        let fallback = st.pending_remote.take();
        st.remote_addresses = match self.core.transport().remote_addresses(self.core.fd, Some(association.id())) {
            Ok(addresses) if !addresses.is_empty() => addresses,
            Ok(_) => fallback.into_iter().collect(),
            Err(err) => {
                log::debug!("{} peer addresses unknown: {err}", self.core.fd);
                fallback.into_iter().collect()
            }
        };
        if !st.binding.is_bound() {
            st.binding.adopt(self.core.transport(), self.core.fd);
        }
        log::debug!("{} connected: {association}", self.core.fd);
        Ok(())
    }

    /// Receive one message into `buf`.
    ///
    /// Notifications read on the way go to `handler` together with
    /// `attachment`. The call keeps receiving while the handler returns
    /// [`Continue`](crate::HandlerResult::Continue) and returns `Ok(None)` as
    /// soon as it returns [`Return`](crate::HandlerResult::Return), when no
    /// handler was given, or when nothing is available.
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

    /// Send one message. Returns the number of bytes sent, or 0 if the
    /// channel is non-blocking and the transport cannot take the message.
    pub fn send(&self, data: &[u8], info: &MessageInfo) -> Result<usize, ChannelError> {
        if data.is_empty() {
            return Err(ChannelError::InvalidArgument("empty message"));
        }
        let _send = self.core.send_lock.lock();
        let (guard, params) = self.core.enter(Slot::Sender, |st| st.send_params(info))?;
        let sent = self
            .core
            .retry(|| self.core.transport().send(self.core.fd, data, &params, guard.waiter()))?;
        Ok(sent.unwrap_or(0))
    }

    /// Shut down the association for sending. Receives keep draining what
    /// the peer still sends. A second call does nothing.
    pub fn shutdown(&self) -> Result<(), ChannelError> {
        let mut st = self.core.state.lock();
        if !st.is_open() {
            return Err(ChannelError::Closed);
        }
        st.connected_association()?;
        if st.shut_down {
            return Ok(());
        }
        self.core.transport().shutdown_association(self.core.fd, None)?;
        st.shut_down = true;
        if let Some(sender) = st.io_ref().sender() {
            self.core.transport().signal(self.core.fd, sender);
        }
        log::debug!("{} shut down", self.core.fd);
        Ok(())
    }

    /// Close the channel.
    pub fn close(&self) -> Result<(), ChannelError> {
        self.core.close()
    }

    /// The association, once connected.
    pub fn association(&self) -> Result<Option<Association>, ChannelError> {
        let st = self.core.state.lock();
        if !st.is_open() {
            return Err(ChannelError::Closed);
        }
        Ok(st.association)
    }

    /// Bound local addresses; empty if not bound.
    pub fn local_addresses(&self) -> Result<Vec<SocketAddr>, ChannelError> {
        let st = self.core.state.lock();
        if !st.is_open() {
            return Err(ChannelError::Closed);
        }
        Ok(st.binding.addresses())
    }

    /// Peer addresses of the association; empty if not connected.
    ///
    /// When the transport can no longer enumerate them (the association
    /// was lost or shut down), the last known set is returned.
    pub fn remote_addresses(&self) -> Result<Vec<SocketAddr>, ChannelError> {
        let mut st = self.core.state.lock();
        if !st.is_open() {
            return Err(ChannelError::Closed);
        }
        let Some(association) = st.association else {
            return Ok(Vec::new());
        };
        match self.core.transport().remote_addresses(self.core.fd, Some(association.id())) {
            Ok(addresses) if !addresses.is_empty() => st.remote_addresses = addresses,
            Ok(_) => {}
            Err(err) => log::debug!("{} using cached peer addresses: {err}", self.core.fd),
        }
        Ok(st.remote_addresses.clone())
    }

    /// Set a socket option.
    pub fn set_option(&self, option: SocketOption) -> Result<(), ChannelError> {
        let option = option.validate()?;
        let st = self.core.state.lock();
        if !st.is_open() {
            return Err(ChannelError::Closed);
        }
        let association = if option.name().is_per_association() {
            Some(st.connected_association()?.id())
        } else {
            None
        };
        self.core.transport().set_option(self.core.fd, option, association)?;
        Ok(())
    }

    /// Read a socket option.
    pub fn get_option(&self, name: OptionName) -> Result<SocketOption, ChannelError> {
        if !name.is_readable() {
            return Err(ChannelError::InvalidOption {
                option: name.as_str(),
                reason: "option is write-only",
            });
        }
        let st = self.core.state.lock();
        if !st.is_open() {
            return Err(ChannelError::Closed);
        }
        let association = if name.is_per_association() {
            Some(st.connected_association()?.id())
        } else {
            None
        };
        Ok(self.core.transport().get_option(self.core.fd, name, association)?)
    }

    /// Switch between blocking and non-blocking mode.
    pub fn configure_blocking(&self, blocking: bool) -> Result<(), ChannelError> {
        let mut st = self.core.state.lock();
        if !st.is_open() {
            return Err(ChannelError::Closed);
        }
        self.core.transport().set_nonblocking(self.core.fd, !blocking)?;
        st.blocking = blocking;
        Ok(())
    }

    /// Whether calls block.
    pub fn is_blocking(&self) -> bool {
        self.core.state.lock().blocking
    }

    #[cfg(test)]
    pub(crate) fn staging_leases(&self) -> usize {
        self.core.pool.active_leases()
    }
}

impl Drop for SctpChannel {
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
    use crate::server::SctpServerChannel;

    fn pair() -> (SctpChannel, SctpChannel) {
        let transport: Arc<dyn NativeTransport> = Arc::new(LoopbackTransport::new());
        let server = SctpServerChannel::open(transport.clone()).unwrap();
        server.bind(Some("127.0.0.1:0".parse().unwrap()), 0).unwrap();
        let client = SctpChannel::open(transport).unwrap();
        client.connect(server.local_addresses().unwrap()[0]).unwrap();
        let accepted = server.accept().unwrap().unwrap();
        (client, accepted)
    }

    #[test]
    fn test_staging_buffer_returned_on_error() {
        let transport: Arc<dyn NativeTransport> = Arc::new(LoopbackTransport::new());
        let channel = SctpChannel::open(transport).unwrap();
        let mut buf = Vec::<u8>::new();
        assert!(matches!(
            channel.receive(&mut buf, &mut (), None),
            Err(ChannelError::NotYetConnected)
        ));
        assert_eq!(channel.staging_leases(), 0);
    }

    #[test]
    fn test_staging_buffer_returned_on_success() {
        let (client, accepted) = pair();
        client.send(b"abc", &MessageInfo::new(None, 0)).unwrap();
        let mut buf = BytesMut::new();
        let info = accepted.receive(&mut buf, &mut (), None).unwrap().unwrap();
        assert_eq!(info.bytes(), 3);
        assert_eq!(&buf[..], b"abc");
        assert_eq!(accepted.staging_leases(), 0);
    }

    #[test]
    fn test_remote_addresses_follow_peer_changes() {
        let (client, accepted) = pair();
        let port = accepted.local_addresses().unwrap()[0].port();
        let extra: IpAddr = "127.0.0.5".parse().unwrap();
        accepted.bind_address(extra).unwrap();

        let mut seen = 0usize;
        let mut handler = |_: &Notification, seen: &mut usize| {
            *seen += 1;
            HandlerResult::Return
        };
        client
            .receive(&mut Vec::<u8>::new(), &mut seen, Some(&mut handler))
            .unwrap();
        assert_eq!(seen, 1);
        let inner_remote = client.core.state.lock().remote_addresses.clone();
        assert!(inner_remote.contains(&SocketAddr::new(extra, port)));
    }

    #[test]
    fn test_close_releases_descriptor() {
        let transport = LoopbackTransport::new();
        let shared: Arc<dyn NativeTransport> = Arc::new(transport.clone());
        let channel = SctpChannel::open(shared).unwrap();
        let fd = channel.descriptor();
        assert!(transport.is_allocated(fd));
        drop(channel);
        assert!(!transport.is_allocated(fd));
        assert_eq!(transport.allocated(), 0);
    }
}

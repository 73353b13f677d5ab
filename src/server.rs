//! Listening side of single-association channels.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use crate::binding::LocalBinding;
use crate::channel::SctpChannel;
use crate::config::ChannelConfig;
use crate::error::ChannelError;
use crate::inflight::{IoTracker, Lifecycle, Slot};
use crate::native::{Descriptor, NativeTransport};
use crate::options::{OptionName, SocketOption};
use crate::shared::ChannelCore;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ServerChannelState {
    InUse,
    KillPending,
    Killed,
}

pub(crate) struct ServerInner {
    state: ServerChannelState,
    binding: LocalBinding,
    io: IoTracker,
}

impl Lifecycle for ServerInner {
    fn io(&mut self) -> &mut IoTracker {
        &mut self.io
    }

    fn io_ref(&self) -> &IoTracker {
        &self.io
    }

    fn is_open(&self) -> bool {
        self.state == ServerChannelState::InUse
    }

    fn is_kill_pending(&self) -> bool {
        self.state == ServerChannelState::KillPending
    }

    fn mark_kill_pending(&mut self) {
        self.state = ServerChannelState::KillPending;
    }

    fn mark_killed(&mut self) {
        self.state = ServerChannelState::Killed;
    }
}

/// Accepts associations, handing each out as its own [`SctpChannel`].
pub struct SctpServerChannel {
    core: ChannelCore<ServerInner>,
}

impl SctpServerChannel {
    /// Open an unbound server channel with the default configuration.
    pub fn open(transport: Arc<dyn NativeTransport>) -> Result<Self, ChannelError> {
        Self::open_with_config(transport, ChannelConfig::default())
    }

    /// Open an unbound server channel. Accepted channels inherit `config`.
    pub fn open_with_config(transport: Arc<dyn NativeTransport>, config: ChannelConfig) -> Result<Self, ChannelError> {
        let fd = transport.create_socket(false)?;
        log::debug!("{fd} opened for listening");
        let inner = ServerInner {
            state: ServerChannelState::InUse,
            binding: LocalBinding::default(),
            io: IoTracker::default(),
        };
        Ok(SctpServerChannel {
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

    /// Bind and start listening. A `backlog` below 1 uses the configured
    /// default.
    pub fn bind(&self, local: Option<SocketAddr>, backlog: i32) -> Result<(), ChannelError> {
        let mut st = self.core.state.lock();
        if !st.is_open() {
            return Err(ChannelError::Closed);
        }
        st.binding.bind(self.core.transport(), self.core.fd, local)?;
        let backlog = self.core.config.backlog(backlog);
        self.core.transport().listen(self.core.fd, backlog)?;
        log::debug!("{} listening, backlog {backlog}", self.core.fd);
        Ok(())
    }

    /// Add a local address on the bound port.
    pub fn bind_address(&self, address: IpAddr) -> Result<(), ChannelError> {
        let mut st = self.core.state.lock();
        if !st.is_open() {
            return Err(ChannelError::Closed);
        }
        st.binding.add(self.core.transport(), self.core.fd, address)
    }

    /// Remove a local address. The last address cannot be removed.
    pub fn unbind_address(&self, address: IpAddr) -> Result<(), ChannelError> {
        let mut st = self.core.state.lock();
        if !st.is_open() {
            return Err(ChannelError::Closed);
        }
        st.binding.remove(self.core.transport(), self.core.fd, address)
    }

    /// Accept one association.
    ///
    /// Returns `Ok(None)` when the channel is non-blocking and nothing is
    /// pending, or when the channel was closed while waiting.
    pub fn accept(&self) -> Result<Option<SctpChannel>, ChannelError> {
        let _receive = self.core.receive_lock.lock();
        let accepted = {
            let (guard, ()) = self.core.enter(Slot::Receiver, |st| {
                if st.binding.is_bound() {
                    Ok(())
                } else {
                    Err(ChannelError::NotYetBound)
                }
            })?;
            self.core
                .retry(|| self.core.transport().accept(self.core.fd, guard.waiter()))?
        };
        let Some((fd, peer)) = accepted else {
            return Ok(None);
        };
        log::debug!("{} accepted {fd} from {peer}", self.core.fd);
        let channel = SctpChannel::from_accepted(self.core.transport.clone(), fd, self.core.config.clone())?;
        Ok(Some(channel))
    }

    /// Bound local addresses; empty if not bound.
    pub fn local_addresses(&self) -> Result<Vec<SocketAddr>, ChannelError> {
        let st = self.core.state.lock();
        if !st.is_open() {
            return Err(ChannelError::Closed);
        }
        Ok(st.binding.addresses())
    }

    /// Set a socket option. Accepted channels inherit it.
    pub fn set_option(&self, option: SocketOption) -> Result<(), ChannelError> {
        let option = option.validate()?;
        if option.name().is_per_association() {
            return Err(ChannelError::InvalidOption {
                option: option.name().as_str(),
                reason: "not supported on a listening channel",
            });
        }
        if !self.is_open() {
            return Err(ChannelError::Closed);
        }
        self.core.transport().set_option(self.core.fd, option, None)?;
        Ok(())
    }

    /// Read a socket option.
    pub fn get_option(&self, name: OptionName) -> Result<SocketOption, ChannelError> {
        if !name.is_readable() || name.is_per_association() {
            return Err(ChannelError::InvalidOption {
                option: name.as_str(),
                reason: "not supported on a listening channel",
            });
        }
        if !self.is_open() {
            return Err(ChannelError::Closed);
        }
        Ok(self.core.transport().get_option(self.core.fd, name, None)?)
    }

    /// Switch between blocking and non-blocking accepts.
    pub fn configure_blocking(&self, blocking: bool) -> Result<(), ChannelError> {
        if !self.is_open() {
            return Err(ChannelError::Closed);
        }
        self.core.transport().set_nonblocking(self.core.fd, !blocking)?;
        Ok(())
    }

    /// Close the channel. A thread blocked in [`accept`](Self::accept)
    /// returns `Ok(None)`.
    pub fn close(&self) -> Result<(), ChannelError> {
        self.core.close()
    }
}

impl Drop for SctpServerChannel {
    fn drop(&mut self) {
        if let Err(err) = self.core.close() {
            log::warn!("{} close on drop failed: {err}", self.core.fd);
        }
    }
}

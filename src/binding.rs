//! Local address bookkeeping shared by every channel flavor.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use crate::error::ChannelError;
use crate::native::{Descriptor, NativeTransport};

/// Set of bound local addresses. Once bound, the port never changes.
#[derive(Debug, Default)]
pub(crate) struct LocalBinding {
    addresses: HashSet<SocketAddr>,
    port: Option<u16>,
    wildcard: bool,
}

impl LocalBinding {
    pub(crate) fn is_bound(&self) -> bool {
        self.port.is_some()
    }

    pub(crate) fn addresses(&self) -> Vec<SocketAddr> {
        let mut addrs: Vec<_> = self.addresses.iter().copied().collect();
        addrs.sort();
        addrs
    }

    /// Bind to `address`, or to an ephemeral port on the wildcard address.
    pub(crate) fn bind(
        &mut self,
        transport: &dyn NativeTransport,
        fd: Descriptor,
        address: Option<SocketAddr>,
    ) -> Result<(), ChannelError> {
        if self.is_bound() {
            return Err(ChannelError::AlreadyBound);
        }
        let address = address.unwrap_or_else(|| SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0));
        transport.bind(fd, address)?;
        let bound = transport.local_addresses(fd)?;
        let port = match bound.first() {
            Some(first) => first.port(),
            None => address.port(),
        };
        log::debug!("{fd} bound to {address}, resolved port {port}");
        self.wildcard = address.ip().is_unspecified();
        self.addresses = bound.into_iter().collect();
        if self.addresses.is_empty() {
            self.addresses.insert(SocketAddr::new(address.ip(), port));
        }
        self.port = Some(port);
        Ok(())
    }

    /// Take over whatever the transport reports, for sockets that were
    /// bound implicitly (connect without bind, accept, branch).
    pub(crate) fn adopt(&mut self, transport: &dyn NativeTransport, fd: Descriptor) {
        match transport.local_addresses(fd) {
            Ok(bound) if !bound.is_empty() => {
                self.port = bound.first().map(SocketAddr::port);
                self.wildcard = bound.iter().any(|a| a.ip().is_unspecified());
                self.addresses = bound.into_iter().collect();
            }
            Ok(_) => {}
            Err(err) => log::debug!("{fd} local addresses unavailable: {err}"),
        }
    }

    pub(crate) fn add(
        &mut self,
        transport: &dyn NativeTransport,
        fd: Descriptor,
        address: IpAddr,
    ) -> Result<(), ChannelError> {
        let port = self.port.ok_or(ChannelError::NotYetBound)?;
        if self.wildcard {
            return Err(ChannelError::WildcardBound);
        }
        if address.is_unspecified() {
            return Err(ChannelError::InvalidArgument("cannot add the wildcard address"));
        }
        let address = SocketAddr::new(address, port);
        if self.addresses.contains(&address) {
            return Err(ChannelError::AlreadyBound);
        }
        transport.bind_extra_address(fd, address.ip(), port, true)?;
        self.addresses.insert(address);
        Ok(())
    }

    pub(crate) fn remove(
        &mut self,
        transport: &dyn NativeTransport,
        fd: Descriptor,
        address: IpAddr,
    ) -> Result<(), ChannelError> {
        let port = self.port.ok_or(ChannelError::NotYetBound)?;
        if self.wildcard {
            return Err(ChannelError::WildcardBound);
        }
        let sockaddr = SocketAddr::new(address, port);
        if !self.addresses.contains(&sockaddr) {
            return Err(ChannelError::IllegalUnbind {
                address,
                reason: "address is not bound",
            });
        }
        if self.addresses.len() == 1 {
            return Err(ChannelError::IllegalUnbind {
                address,
                reason: "cannot unbind the last address",
            });
        }
        transport.bind_extra_address(fd, address, port, false)?;
        self.addresses.remove(&sockaddr);
        Ok(())
    }
}

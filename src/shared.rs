//! Plumbing common to all channel flavors: the three lock domains, the
//! in-flight guard around native calls, deferred teardown, the retry
//! policy for transient native results and the envelope-driven receive loop.

use std::io;
use std::sync::Arc;

use bytes::BufMut;
use parking_lot::{Mutex, MutexGuard};

use crate::association::Association;
use crate::config::ChannelConfig;
use crate::envelope::ResultEnvelope;
use crate::error::ChannelError;
use crate::inflight::{Lifecycle, Slot};
use crate::interceptor::{AssociationBook, Interceptor, PendingRemoval};
use crate::message::MessageInfo;
use crate::native::{Descriptor, NativeTransport, Waiter};
use crate::notification::{HandlerResult, NotificationHandler};
use crate::pool::BufferPool;

/// Who a receive is for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ReceiveMode {
    /// A caller of `receive`: notifications go to the user handler.
    User,
    /// The internal receive of connect/accept: stop after the first
    /// notification, which is the association coming up.
    Establish,
}

/// What the receive loop needs from a channel's state beyond its lifecycle.
pub(crate) trait Demultiplex: Lifecycle + AssociationBook {
    fn check_receive(&self, mode: ReceiveMode) -> Result<(), ChannelError>;

    /// Forget an association after its closing notification was handled.
    fn deregister(&mut self, _association: &Association) {}
}

pub(crate) struct ChannelCore<S> {
    pub(crate) transport: Arc<dyn NativeTransport>,
    pub(crate) fd: Descriptor,
    pub(crate) config: ChannelConfig,
    pub(crate) pool: BufferPool,
    pub(crate) state: Mutex<S>,
    pub(crate) send_lock: Mutex<()>,
    pub(crate) receive_lock: Mutex<()>,
}

impl<S: Lifecycle> ChannelCore<S> {
    pub(crate) fn new(transport: Arc<dyn NativeTransport>, fd: Descriptor, config: ChannelConfig, state: S) -> Self {
        ChannelCore {
            pool: BufferPool::new(config.pooled_buffers),
            transport,
            fd,
            config,
            state: Mutex::new(state),
            send_lock: Mutex::new(()),
            receive_lock: Mutex::new(()),
        }
    }

    pub(crate) fn transport(&self) -> &dyn NativeTransport {
        self.transport.as_ref()
    }

    pub(crate) fn is_open(&self) -> bool {
        self.state.lock().is_open()
    }

    /// Take the receive lock, rejecting a re-entrant call from a handler
    /// running on this thread.
    pub(crate) fn receive_session(&self) -> Result<ReceiveSession<'_, S>, ChannelError> {
        if self.state.lock().io_ref().is_receive_owner() {
            return Err(ChannelError::ReentrantReceive);
        }
        let lock = self.receive_lock.lock();
        self.state.lock().io().claim_receive();
        Ok(ReceiveSession { core: self, _lock: lock })
    }

    /// Take the receive lock unless this thread already holds it, which is
    /// the case inside a notification handler run by `receive`.
    pub(crate) fn receive_exclusion(&self) -> Option<MutexGuard<'_, ()>> {
        if self.state.lock().io_ref().is_receive_owner() {
            None
        } else {
            Some(self.receive_lock.lock())
        }
    }

    /// Register the current thread as in-flight in `slot` after `check`
    /// accepts the state. The returned guard deregisters it on drop; the
    /// second value is whatever `check` extracted from the state.
    pub(crate) fn enter<T, F>(&self, slot: Slot, check: F) -> Result<(InFlight<'_, S>, T), ChannelError>
    where
        F: FnOnce(&S) -> Result<T, ChannelError>,
    {
        let mut st = self.state.lock();
        if !st.is_open() {
            return Err(ChannelError::Closed);
        }
        let value = check(&st)?;
        let waiter = st.io().enter(slot);
        let guard = InFlight {
            core: self,
            slot,
            waiter,
        };
        Ok((guard, value))
    }

    /// Run a native call, retrying while it is interrupted and the channel
    /// is still open. `Ok(None)` means nothing was available: the call would
    /// block, or the channel was closed while it was parked.
    pub(crate) fn retry<T, F>(&self, mut op: F) -> Result<Option<T>, ChannelError>
    where
        F: FnMut() -> io::Result<T>,
    {
        loop {
            match op() {
                Ok(value) => return Ok(Some(value)),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {
                    if !self.is_open() {
                        log::trace!("{} interrupted by close", self.fd);
                        return Ok(None);
                    }
                    log::trace!("{} interrupted, retrying", self.fd);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Close the channel. Threads parked in native calls are woken and the
    /// descriptor is released once the last of them leaves. Closing twice
    /// is a no-op.
    pub(crate) fn close(&self) -> Result<(), ChannelError> {
        let mut st = self.state.lock();
        if !st.is_open() {
            return Ok(());
        }
        st.mark_kill_pending();
        log::debug!("{} close requested", self.fd);
        let pre_close = self.transport.pre_close(self.fd);
        for waiter in st.io_ref().waiters() {
            log::trace!("{} waking {:?}", self.fd, waiter.thread());
            self.transport.signal(self.fd, waiter);
        }
        if st.io_ref().is_idle() {
            self.kill(&mut st)?;
        }
        pre_close.map_err(ChannelError::from)
    }

    fn kill(&self, st: &mut MutexGuard<'_, S>) -> io::Result<()> {
        st.mark_killed();
        log::debug!("{} released", self.fd);
        self.transport.close(self.fd)
    }

    /// Teardown on the error path of connect: the channel must not stay
    /// half open.
    pub(crate) fn fail(&self, err: ChannelError) -> ChannelError {
        if let Err(close_err) = self.close() {
            log::warn!("{} close after failure: {close_err}", self.fd);
        }
        err
    }
}

impl<S: Demultiplex> ChannelCore<S> {
    /// One user-level receive: native receives until a message arrives, the
    /// handler asks to return, or nothing is available. The caller holds the
    /// receive session.
    pub(crate) fn receive_loop<B, A>(
        &self,
        mode: ReceiveMode,
        buf: &mut B,
        attachment: &mut A,
        mut handler: Option<&mut dyn NotificationHandler<A>>,
    ) -> Result<Option<MessageInfo>, ChannelError>
    where
        B: BufMut,
    {
        if !buf.has_remaining_mut() {
            return Err(ChannelError::BufferFull);
        }
        let mut staging = self.pool.acquire(buf.remaining_mut().min(self.config.max_receive_size));

        loop {
            let received = {
                let (guard, ()) = self.enter(Slot::Receiver, |st| st.check_receive(mode))?;
                self.retry(|| self.transport.receive(self.fd, &mut staging, false, guard.waiter()))?
            };
            let Some((n, envelope)) = received else {
                return Ok(None);
            };

            let envelope = match envelope {
                ResultEnvelope::Nothing => return Ok(None),
                ResultEnvelope::Message(message) => {
                    buf.put_slice(&staging[..n]);
                    let association = self.state.lock().resolve(message.assoc_id);
                    return Ok(Some(MessageInfo::received(association, &message, n)));
                }
                notification => notification,
            };

            let mut pending = PendingRemoval::default();
            let notification = {
                let mut st = self.state.lock();
                let mut interceptor = Interceptor::new(&mut *st);
                let notification = interceptor.bind(envelope);
                if let Some(notification) = &notification {
                    interceptor.handle_notification(notification, &mut pending);
                }
                notification
            };
            let Some(notification) = notification else {
                continue;
            };
            log::trace!("{} notification for association {:?}", self.fd, notification.association_id());

            let result = match (mode, handler.as_deref_mut()) {
                (ReceiveMode::User, Some(handler)) => handler.handle_notification(&notification, attachment),
                _ => HandlerResult::Return,
            };
            if let Some(association) = pending.take() {
                log::debug!("{} association {} gone", self.fd, association.id());
                self.state.lock().deregister(&association);
            }
            if result == HandlerResult::Return {
                return Ok(None);
            }
        }
    }
}

/// Holds the receive lock and marks the current thread as the receive
/// owner for re-entrancy detection.
pub(crate) struct ReceiveSession<'a, S: Lifecycle> {
    core: &'a ChannelCore<S>,
    _lock: MutexGuard<'a, ()>,
}

impl<S: Lifecycle> Drop for ReceiveSession<'_, S> {
    fn drop(&mut self) {
        self.core.state.lock().io().release_receive();
    }
}

/// One thread inside one native call.
pub(crate) struct InFlight<'a, S: Lifecycle> {
    core: &'a ChannelCore<S>,
    slot: Slot,
    waiter: Waiter,
}

impl<S: Lifecycle> InFlight<'_, S> {
    pub(crate) fn waiter(&self) -> &Waiter {
        &self.waiter
    }
}

impl<S: Lifecycle> Drop for InFlight<'_, S> {
    fn drop(&mut self) {
        let mut st = self.core.state.lock();
        st.io().leave(self.slot);
        if st.is_kill_pending() && st.io_ref().is_idle() {
            if let Err(err) = self.core.kill(&mut st) {
                log::warn!("{} deferred close failed: {err}", self.core.fd);
            }
        }
    }
}

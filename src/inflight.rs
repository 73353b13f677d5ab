//! Which threads are parked inside native calls, and when teardown may run.
//!
//! A close that finds a thread inside a native call only marks the channel
//! kill-pending and wakes that thread. The descriptor is released by
//! whichever thread brings the in-flight count back to zero.

use std::thread::{self, ThreadId};

use crate::native::Waiter;

/// Direction of a blocking call. At most one thread occupies each slot,
/// since the send and receive locks serialize callers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Slot {
    /// receive, connect, finish_connect and accept
    Receiver,
    /// send
    Sender,
}

#[derive(Debug, Default)]
pub(crate) struct IoTracker {
    receiver: Option<Waiter>,
    sender: Option<Waiter>,
    in_flight: usize,
    receive_owner: Option<ThreadId>,
}

impl IoTracker {
    pub(crate) fn enter(&mut self, slot: Slot) -> Waiter {
        let waiter = Waiter::current();
        let previous = match slot {
            Slot::Receiver => self.receiver.replace(waiter.clone()),
            Slot::Sender => self.sender.replace(waiter.clone()),
        };
        debug_assert!(previous.is_none(), "{slot:?} slot already occupied");
        self.in_flight += 1;
        waiter
    }

    pub(crate) fn leave(&mut self, slot: Slot) {
        let previous = match slot {
            Slot::Receiver => self.receiver.take(),
            Slot::Sender => self.sender.take(),
        };
        if previous.is_some() {
            self.in_flight -= 1;
        }
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.in_flight == 0
    }

    pub(crate) fn sender(&self) -> Option<&Waiter> {
        self.sender.as_ref()
    }

    pub(crate) fn waiters(&self) -> impl Iterator<Item = &Waiter> {
        self.receiver.iter().chain(self.sender.iter())
    }

    /// Whether the current thread is already inside `receive`, i.e. a
    /// handler tried to re-enter it.
    pub(crate) fn is_receive_owner(&self) -> bool {
        self.receive_owner == Some(thread::current().id())
    }

    /// Record the current thread as the receive path owner. Called with the
    /// receive lock held.
    pub(crate) fn claim_receive(&mut self) {
        self.receive_owner = Some(thread::current().id());
    }

    pub(crate) fn release_receive(&mut self) {
        self.receive_owner = None;
    }
}

/// Lifecycle hooks the shared channel core needs from a channel's state.
pub(crate) trait Lifecycle {
    fn io(&mut self) -> &mut IoTracker;

    fn io_ref(&self) -> &IoTracker;

    /// The descriptor is valid and no close was requested.
    fn is_open(&self) -> bool;

    fn is_kill_pending(&self) -> bool;

    /// Close requested; descriptor not yet released.
    fn mark_kill_pending(&mut self);

    /// Descriptor released.
    fn mark_killed(&mut self);
}

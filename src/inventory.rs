//! Pool bookkeeping shared by blocking and async pools.
//!
//! Nothing in here blocks or allocates resources. Callers hold the pool mutex around
//! every call, which makes each method a single atomic transition.

use std::{
    collections::{HashSet, VecDeque},
    num::NonZeroUsize,
    sync::{
        atomic::{AtomicU64, Ordering},
        Weak,
    },
};

use crate::{
    metrics::PoolState,
    resource::{Recycle, ResourceId},
};

/// Allocate a process-unique pool identifier.
fn next_pool_id() -> u64 {
    static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);
    NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed)
}

/// Something handed straight to a waiting caller.
pub(crate) enum Grant<R> {
    /// Previously leased resource, still counted as leased.
    Resource(ResourceId, R),
    /// Right to create a resource in a reserved capacity slot.
    Reservation(ResourceId),
}

/// Suspended caller, waiting for a [`Grant`].
pub(crate) trait Waiter<R>: Sized {
    /// Hand over a grant.
    ///
    /// Gives the grant back if the waiter is no longer listening.
    fn wake(self, grant: Grant<R>) -> Result<(), Grant<R>>;
}

/// Outcome of a non-waiting checkout.
pub(crate) enum Checkout<R> {
    /// Idle resource, now leased.
    Idle(ResourceId, R),
    /// Capacity slot reserved; the caller must create the resource and register it.
    Reserved(ResourceId),
    /// Every slot is taken.
    Exhausted,
}

/// Grant in transit, returned to the pool if dropped before being claimed.
pub(crate) struct Claim<R> {
    grant: Option<Grant<R>>,
    home: Weak<dyn Recycle<R>>,
}

impl<R> Claim<R> {
    pub(crate) fn new(grant: Grant<R>, home: Weak<dyn Recycle<R>>) -> Self {
        Self {
            grant: Some(grant),
            home,
        }
    }

    /// Take the grant out, disarming the return path.
    pub(crate) fn into_grant(mut self) -> Grant<R> {
        self.grant.take().expect("claim holds its grant")
    }

    /// Forget the grant without returning it anywhere.
    pub(crate) fn disarm(mut self) {
        self.grant = None;
    }
}

impl<R> Drop for Claim<R> {
    fn drop(&mut self) {
        let Some(grant) = self.grant.take() else {
            return;
        };
        if let Some(home) = self.home.upgrade() {
            match grant {
                Grant::Resource(id, resource) => home.recycle(id, resource),
                Grant::Reservation(id) => home.abandon(id),
            }
        }
    }
}

/// Idle and leased resources, capacity reservations and the queue of waiters.
pub(crate) struct Inventory<R, W> {
    /// Identifier of the owning pool.
    pool_id: u64,
    /// Hard limit on `idle + leased + pending`.
    capacity: usize,
    /// Sequence number for the next created resource.
    next_seq: u64,
    /// Ticket number for the next queued waiter.
    next_ticket: u64,
    /// Slots reserved for resources being constructed outside the lock.
    pending: usize,
    /// Unused resources, oldest release first.
    idle: VecDeque<(ResourceId, R)>,
    /// Checked out resources.
    leased: HashSet<ResourceId>,
    /// Suspended callers in arrival order.
    waiters: VecDeque<(u64, W)>,
}

impl<R, W: Waiter<R>> Inventory<R, W> {
    pub(crate) fn new(capacity: NonZeroUsize) -> Self {
        Self {
            pool_id: next_pool_id(),
            capacity: capacity.get(),
            next_seq: 0,
            next_ticket: 0,
            pending: 0,
            idle: VecDeque::with_capacity(capacity.get()),
            leased: HashSet::with_capacity(capacity.get()),
            waiters: VecDeque::new(),
        }
    }

    pub(crate) fn pool_id(&self) -> u64 {
        self.pool_id
    }

    /// Whether `id` is currently checked out from this pool.
    pub(crate) fn is_leased(&self, id: ResourceId) -> bool {
        id.pool_id() == self.pool_id && self.leased.contains(&id)
    }

    /// Take the oldest idle resource, or reserve a slot for a new one.
    pub(crate) fn checkout(&mut self) -> Checkout<R> {
        if let Some((id, resource)) = self.idle.pop_front() {
            self.leased.insert(id);
            return Checkout::Idle(id, resource);
        }
        if self.idle.len() + self.leased.len() + self.pending < self.capacity {
            self.pending += 1;
            self.next_seq += 1;
            return Checkout::Reserved(ResourceId::new(self.pool_id, self.next_seq));
        }
        Checkout::Exhausted
    }

    /// Turn a reservation into a leased resource.
    pub(crate) fn register(&mut self, id: ResourceId) {
        debug_assert!(self.pending > 0, "registering without a reservation");
        self.pending -= 1;
        self.leased.insert(id);
    }

    /// Give up a reservation, passing the slot to the oldest waiter if there is one.
    pub(crate) fn abandon(&mut self, id: ResourceId) {
        if self.hand_over(Grant::Reservation(id)).is_some() {
            self.pending -= 1;
        }
    }

    /// Queue a waiter, returning its ticket.
    pub(crate) fn enqueue(&mut self, waiter: W) -> u64 {
        self.next_ticket += 1;
        self.waiters.push_back((self.next_ticket, waiter));
        self.next_ticket
    }

    /// Withdraw a queued waiter.
    ///
    /// Returns `false` if the waiter was already woken with a grant.
    pub(crate) fn cancel(&mut self, ticket: u64) -> bool {
        match self.waiters.iter().position(|(t, _)| *t == ticket) {
            Some(pos) => {
                self.waiters.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Return a leased resource.
    ///
    /// The resource goes straight to the oldest live waiter, staying leased, or to the
    /// back of the idle queue. Resources not leased from this pool are given back.
    pub(crate) fn check_in(&mut self, id: ResourceId, resource: R) -> Result<(), R> {
        if !self.is_leased(id) {
            return Err(resource);
        }
        if let Some(Grant::Resource(id, resource)) = self.hand_over(Grant::Resource(id, resource))
        {
            self.leased.remove(&id);
            self.idle.push_back((id, resource));
        }
        Ok(())
    }

    /// Offer a grant to waiters in arrival order, returning it if nobody took it.
    fn hand_over(&mut self, mut grant: Grant<R>) -> Option<Grant<R>> {
        while let Some((_, waiter)) = self.waiters.pop_front() {
            match waiter.wake(grant) {
                Ok(()) => return None,
                Err(rejected) => grant = rejected,
            }
        }
        Some(grant)
    }

    /// Consistent snapshot of all counts.
    pub(crate) fn state(&self) -> PoolState {
        PoolState {
            capacity: self.capacity,
            idle: self.idle.len(),
            leased: self.leased.len(),
            pending: self.pending,
            waiting: self.waiters.len(),
        }
    }
}

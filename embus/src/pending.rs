//! Pending-call table
//!
//! One bounded slot arena of outstanding service calls, keyed by
//! [`CallId`] and owned collectively by the live client instances: each entry
//! belongs to exactly one client row and is removed before that row goes away.
//! The table never calls user code itself; the node extracts an entry under
//! the lock and runs its thunk after releasing it.

use core::ptr::NonNull;

use crate::registry::ClientToken;
use crate::service::CallId;
use crate::time::Instant;

/// Erased result of one call, as seen at the engine boundary.
pub(crate) enum RawOutcome<'a> {
    /// Matched response payload bytes, not yet deserialized.
    Response(&'a [u8]),
    /// The deadline elapsed with no matching response.
    Timeout,
}

/// Monomorphised result delivery: deserializes a response (timeouts carry
/// none) and invokes the owning client's bound handler.
///
/// Invoked with the engine lock released. For responses the thunk must call
/// `commit` after successful deserialization and deliver only if it returns
/// true; `commit` re-acquires the lock and consumes the pending entry, so a
/// payload that fails to decode leaves the call pending.
pub(crate) type ResponseThunk =
    unsafe fn(NonNull<()>, CallId, RawOutcome<'_>, &mut dyn FnMut(CallId) -> bool);

pub(crate) struct PendingCall {
    pub key: CallId,
    pub deadline: Instant,
    pub owner: ClientToken,
    pub handler: NonNull<()>,
    pub thunk: ResponseThunk,
}

// Safety: the handler pointer is supplied by a `Client` handle, which
// guarantees the referent outlives the entry and purges its entries in Drop
// before the guarantee ends. The pointer is only dereferenced by the dispatch
// and sweep paths under the engine's locking discipline.
unsafe impl Send for PendingCall {}

/// Fixed-capacity table of pending calls.
pub(crate) struct CallTable<const N: usize> {
    slots: [Option<PendingCall>; N],
}

impl<const N: usize> CallTable<N> {
    pub fn new() -> Self {
        Self {
            slots: core::array::from_fn(|_| None),
        }
    }

    /// Finds a free slot without claiming it.
    ///
    /// Insertion is two-phase (reserve, then [`Self::occupy`] after the
    /// request frame was accepted by the transport) so that a rejected send
    /// leaves no trace and an accepted one cannot fail to be recorded.
    pub fn reserve(&self) -> Option<usize> {
        self.slots.iter().position(Option::is_none)
    }

    pub fn occupy(&mut self, slot: usize, entry: PendingCall) {
        debug_assert!(self.slots[slot].is_none());
        self.slots[slot] = Some(entry);
    }

    pub fn contains(&self, key: CallId) -> bool {
        self.find(key).is_some()
    }

    pub fn get(&self, key: CallId) -> Option<&PendingCall> {
        let slot = self.find(key)?;
        self.slots[slot].as_ref()
    }

    pub fn remove(&mut self, key: CallId) -> Option<PendingCall> {
        let slot = self.find(key)?;
        self.slots[slot].take()
    }

    /// Removes an entry only if it exists and belongs to `owner`.
    pub fn remove_owned(&mut self, key: CallId, owner: ClientToken) -> Option<PendingCall> {
        let slot = self.find(key)?;
        match &self.slots[slot] {
            Some(entry) if entry.owner == owner => self.slots[slot].take(),
            _ => None,
        }
    }

    /// Removes and returns the expired entry with the earliest deadline.
    ///
    /// Equal deadlines resolve to the lowest slot index, keeping eviction
    /// order reproducible when several calls expire in the same tick.
    pub fn take_expired(&mut self, now: Instant) -> Option<PendingCall> {
        let mut earliest: Option<usize> = None;
        for (slot, entry) in self.slots.iter().enumerate() {
            let Some(entry) = entry else { continue };
            if entry.deadline > now {
                continue;
            }
            match earliest {
                Some(best) if unwrap!(self.slots[best].as_ref()).deadline <= entry.deadline => {}
                _ => earliest = Some(slot),
            }
        }
        self.slots[earliest?].take()
    }

    /// Drops every entry owned by `owner` without delivering results.
    pub fn purge_owner(&mut self, owner: ClientToken) -> usize {
        let mut removed = 0;
        for slot in self.slots.iter_mut() {
            if slot.as_ref().is_some_and(|entry| entry.owner == owner) {
                *slot = None;
                removed += 1;
            }
        }
        removed
    }

    fn find(&self, key: CallId) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| slot.as_ref().is_some_and(|entry| entry.key == key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{NodeId, ServiceId, TransferId};
    use crate::registry::Listeners;
    use crate::time::Duration;

    unsafe fn dummy_thunk(
        _handler: NonNull<()>,
        _call: CallId,
        _outcome: RawOutcome<'_>,
        _commit: &mut dyn FnMut(CallId) -> bool,
    ) {
    }

    fn ts(us: u64) -> Instant {
        Instant::MIN + Duration::from_micros(us)
    }

    fn key(transfer: u8) -> CallId {
        CallId {
            server: NodeId::from_u8_truncating(7),
            service: ServiceId::from_u16_truncating(100),
            transfer: TransferId::from_u8_truncating(transfer),
        }
    }

    fn entry(transfer: u8, deadline_us: u64, owner: ClientToken) -> PendingCall {
        PendingCall {
            key: key(transfer),
            deadline: ts(deadline_us),
            owner,
            handler: NonNull::dangling(),
            thunk: dummy_thunk,
        }
    }

    fn tokens() -> (ClientToken, ClientToken) {
        let mut listeners: Listeners<2> = Listeners::new();
        let service = ServiceId::from_u16_truncating(100);
        (
            listeners.client_add(service).unwrap(),
            listeners.client_add(service).unwrap(),
        )
    }

    #[test]
    fn test_insert_and_match() {
        let (owner, other) = tokens();
        let mut table: CallTable<2> = CallTable::new();

        let slot = table.reserve().unwrap();
        table.occupy(slot, entry(3, 1000, owner));

        assert!(table.contains(key(3)));
        assert!(!table.contains(key(4)));
        assert!(table.remove_owned(key(3), other).is_none());
        assert!(table.remove_owned(key(3), owner).is_some());
        // Idempotent: removing an absent key is a no-op.
        assert!(table.remove(key(3)).is_none());
    }

    #[test]
    fn test_capacity() {
        let (owner, _) = tokens();
        let mut table: CallTable<2> = CallTable::new();
        for transfer in 0..2 {
            let slot = table.reserve().unwrap();
            table.occupy(slot, entry(transfer, 1000, owner));
        }
        assert!(table.reserve().is_none());

        table.remove(key(0)).unwrap();
        assert!(table.reserve().is_some());
    }

    #[test]
    fn test_expiry_order() {
        let (owner, _) = tokens();
        let mut table: CallTable<4> = CallTable::new();
        for (transfer, deadline) in [(0u8, 3000u64), (1, 1000), (2, 2000), (3, 1000)] {
            let slot = table.reserve().unwrap();
            table.occupy(slot, entry(transfer, deadline, owner));
        }

        assert!(table.take_expired(ts(999)).is_none());

        // Earliest deadline first; the tie at 1000 resolves by slot order.
        assert_eq!(table.take_expired(ts(2500)).unwrap().key, key(1));
        assert_eq!(table.take_expired(ts(2500)).unwrap().key, key(3));
        assert_eq!(table.take_expired(ts(2500)).unwrap().key, key(2));
        assert!(table.take_expired(ts(2500)).is_none());
        assert_eq!(table.take_expired(ts(3000)).unwrap().key, key(0));
    }

    #[test]
    fn test_purge_owner() {
        let (owner, other) = tokens();
        let mut table: CallTable<4> = CallTable::new();
        for (transfer, who) in [(0u8, owner), (1, other), (2, owner)] {
            let slot = table.reserve().unwrap();
            table.occupy(slot, entry(transfer, 1000, who));
        }

        assert_eq!(table.purge_owner(owner), 2);
        assert!(!table.contains(key(0)));
        assert!(table.contains(key(1)));
        assert_eq!(table.purge_owner(owner), 0);
    }
}

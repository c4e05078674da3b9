mod alloc;
mod probe;

pub(crate) mod utils;

use std::marker::PhantomData;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::thread::{self, ThreadId};

use parking_lot::{Condvar, Mutex, MutexGuard};
use seize::{reclaim, Guard, LocalGuard};
use tracing::{debug, trace};

use self::alloc::{RawTable, Table};
use self::probe::Probe;
use crate::hash::mix;

// An entry in a shard table.
//
// Entries are immutable once written. A state change swaps in a new entry and
// retires the old one, so lock-free readers never observe a partial update.
pub enum Entry<V> {
    // Some thread claimed the key and is constructing its value.
    Reserved(i32, Claim),
    // The claim was withdrawn, and the next thread to see it takes over.
    Abandoned(i32),
    // The published value, never replaced until the next clear.
    Real(i32, V),
}

impl<V> Entry<V> {
    #[inline]
    fn key(&self) -> i32 {
        match *self {
            Entry::Reserved(key, _) | Entry::Abandoned(key) | Entry::Real(key, _) => key,
        }
    }
}

/// Identifies a single reservation of a key.
///
/// Claim ids are never reused within a shard, clears included, so a reservation
/// that was cleared away is never mistaken for a later one on the same key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Claim {
    id: u64,
    owner: ThreadId,
}

impl Claim {
    /// Returns `true` if the reservation was made by the calling thread.
    pub fn held_by_current_thread(&self) -> bool {
        self.owner == thread::current().id()
    }
}

/// The result of a reservation attempt.
pub enum Reserve<V> {
    /// The value was already published.
    Published(V),
    /// The caller now holds the reservation.
    Claimed(Claim),
}

// A single open-addressing table, along with the lock that serializes all writes to it.
pub struct Shard<V> {
    // The current table.
    //
    // Only replaced with the lock held, and read without it on the fast path.
    table: AtomicPtr<RawTable<V>>,

    // Bookkeeping for the current table.
    state: Mutex<State>,

    // Signaled whenever a reservation is resolved, or the table is reset.
    resolved: Condvar,

    // The shard never shrinks below its initial capacity.
    initial_capacity: usize,

    // The number of low hash bits consumed by shard routing.
    shift: u32,

    _v: PhantomData<V>,
}

struct State {
    // The number of occupied slots, including reservations.
    count: usize,
    // The count at which the table grows.
    threshold: usize,
    // Set by a clear that found the table mostly empty, a second one in a row shrinks it.
    shrinkable: bool,
    // The id of the most recent claim.
    claims: u64,
}

impl State {
    // Issue a claim for the calling thread.
    fn claim(&mut self) -> Claim {
        self.claims += 1;
        Claim {
            id: self.claims,
            owner: thread::current().id(),
        }
    }
}

impl<V> Shard<V> {
    pub fn new(capacity: usize, shift: u32) -> Shard<V> {
        let table = Table::<V>::alloc(capacity);

        Shard {
            table: AtomicPtr::new(table.raw),
            state: Mutex::new(State {
                count: 0,
                threshold: probe::threshold(capacity),
                shrinkable: false,
                claims: 0,
            }),
            resolved: Condvar::new(),
            initial_capacity: capacity,
            shift,
            _v: PhantomData,
        }
    }

    // Returns the current table.
    #[inline]
    fn root(&self, guard: &LocalGuard<'_>) -> Table<V> {
        let raw = guard.protect(&self.table, Ordering::Acquire);

        // Safety: The table pointer always refers to a live allocation, and
        // replaced tables are retired through the collector.
        unsafe { Table::from_raw(raw) }
    }

    // Searches `table` for `key`, continuing from wherever `probe` stopped.
    //
    // Returns the entry with a matching key, or null at the first empty slot. In
    // either case `probe` is left pointing at the returned slot. A result that is
    // not a real value is only conclusive under the lock, and only if `table` is
    // still the current table.
    #[inline]
    fn find(table: Table<V>, key: i32, probe: &mut Probe, guard: &LocalGuard<'_>) -> *mut Entry<V> {
        loop {
            // Safety: The guard keeps the table alive, and the probe is masked to its length.
            let entry = guard.protect(unsafe { table.slot(probe.i) }, Ordering::Acquire);

            // Safety: Non-null entries are kept alive by the guard.
            if entry.is_null() || unsafe { (*entry).key() } == key {
                return entry;
            }

            probe.next(table.mask);
        }
    }

    // Replace the entry at the probe position. Must be called with the lock held.
    #[inline]
    fn store(table: Table<V>, probe: &Probe, entry: Entry<V>) {
        let entry = Box::into_raw(Box::new(entry));

        // Safety: The caller holds the lock, so `table` is still the current table.
        unsafe { table.slot(probe.i).store(entry, Ordering::Release) };
    }

    // Swap out an entry that was replaced by `store`.
    #[inline]
    fn retire(entry: *mut Entry<V>, guard: &LocalGuard<'_>) {
        // Safety: The entry was unlinked by `store`, and readers that may
        // still hold it are protected by their own guards.
        unsafe { guard.defer_retire(entry, reclaim::boxed::<Entry<V>>) };
    }
}

impl<V> Shard<V>
where
    V: Clone,
{
    /// Returns the value for `key`, or claims the right to construct it.
    ///
    /// Blocks while another thread holds the reservation for `key`.
    pub fn reserve(&self, key: i32, hash: u32, guard: &LocalGuard<'_>) -> Reserve<V> {
        let mut table = self.root(guard);
        let mut probe = Probe::start(hash, table.mask);

        // Fast path: a published value can be read without the lock.
        //
        // Safety: Entries are protected by the guard.
        let entry = Self::find(table, key, &mut probe, guard);
        if let Some(Entry::Real(_, value)) = unsafe { entry.as_ref() } {
            return Reserve::Published(value.clone());
        }

        let mut state = self.state.lock();

        loop {
            // The table was resized or cleared since we last looked, start over.
            let current = self.root(guard);
            if current.raw != table.raw {
                table = current;
                probe = Probe::start(hash, table.mask);
            }

            // Continue the search from where the last one stopped.
            let entry = Self::find(table, key, &mut probe, guard);

            // Safety: Entries are protected by the guard.
            match unsafe { entry.as_ref() } {
                // Another thread published between our search and taking the lock.
                Some(Entry::Real(_, value)) => return Reserve::Published(value.clone()),

                // Another thread is constructing the value, wait for it to be published.
                //
                // Spurious wakeups and wakeups for other keys land back here.
                //
                // The guard stays active while we wait, which holds back reclamation
                // for the shard but keeps the table identity check above sound.
                Some(Entry::Reserved(..)) => {
                    trace!(key, "waiting for pending construction");
                    self.resolved.wait(&mut state);
                }

                // The previous owner gave up, the reservation is ours.
                Some(Entry::Abandoned(_)) => {
                    trace!(key, "taking over abandoned reservation");
                    let claim = state.claim();
                    Self::store(table, &probe, Entry::Reserved(key, claim));
                    Self::retire(entry, guard);
                    return Reserve::Claimed(claim);
                }

                // The key is absent, claim the slot.
                None => {
                    let claim = state.claim();
                    Self::store(table, &probe, Entry::Reserved(key, claim));
                    self.occupied(&mut state, table, guard);
                    return Reserve::Claimed(claim);
                }
            }
        }
    }

    /// Publishes the value for `key`, fulfilling a reservation.
    ///
    /// Returns the existing value if `key` was already published, leaving it in place.
    pub fn publish(&self, key: i32, value: V, hash: u32, guard: &LocalGuard<'_>) -> Option<V> {
        let mut state = self.state.lock();

        let table = self.root(guard);
        let mut probe = Probe::start(hash, table.mask);
        let entry = Self::find(table, key, &mut probe, guard);

        // Safety: Entries are protected by the guard.
        match unsafe { entry.as_ref() } {
            // Published values are never replaced.
            Some(Entry::Real(_, existing)) => Some(existing.clone()),

            // The slot was already counted when it was reserved.
            Some(Entry::Reserved(..) | Entry::Abandoned(_)) => {
                Self::store(table, &probe, Entry::Real(key, value));
                Self::retire(entry, guard);

                // Waiters may be blocked on any key in this shard.
                self.resolved.notify_all();
                None
            }

            // Published without a reservation.
            None => {
                Self::store(table, &probe, Entry::Real(key, value));
                self.occupied(&mut state, table, guard);
                None
            }
        }
    }

    /// Returns the published value for `key`, without claiming or waiting for it.
    pub fn get(&self, key: i32, hash: u32, guard: &LocalGuard<'_>) -> Option<V> {
        let table = self.root(guard);
        let mut probe = Probe::start(hash, table.mask);

        let entry = Self::find(table, key, &mut probe, guard);

        // Safety: Entries are protected by the guard.
        if let Some(Entry::Real(_, value)) = unsafe { entry.as_ref() } {
            return Some(value.clone());
        }

        // Search again under the lock, in case we raced with a resize.
        let _state = self.state.lock();

        let current = self.root(guard);
        if current.raw != table.raw {
            probe = Probe::start(hash, current.mask);
        }

        let entry = Self::find(current, key, &mut probe, guard);

        // Safety: Entries are protected by the guard.
        match unsafe { entry.as_ref() } {
            Some(Entry::Real(_, value)) => Some(value.clone()),
            _ => None,
        }
    }

    /// Returns a snapshot of every published entry in the shard.
    pub fn entries(&self, guard: &LocalGuard<'_>) -> Vec<(i32, V)> {
        let _state = self.state.lock();
        let table = self.root(guard);

        (0..table.len())
            .filter_map(|i| {
                // Safety: `i` is in-bounds, and the lock keeps the table current.
                let entry = unsafe { table.slot(i).load(Ordering::Acquire) };

                // Safety: The lock prevents the entry from being retired.
                match unsafe { entry.as_ref() } {
                    Some(Entry::Real(key, value)) => Some((*key, value.clone())),
                    _ => None,
                }
            })
            .collect()
    }
}

impl<V> Shard<V> {
    /// Withdraws the outstanding reservation for `key`, if `owns` accepts its claim.
    ///
    /// Returns `false` if `key` is not currently reserved, or is reserved under a
    /// claim that `owns` rejects.
    pub fn abandon<F>(&self, key: i32, hash: u32, owns: F, guard: &LocalGuard<'_>) -> bool
    where
        F: Fn(&Claim) -> bool,
    {
        let _state = self.state.lock();

        let table = self.root(guard);
        let mut probe = Probe::start(hash, table.mask);
        let entry = Self::find(table, key, &mut probe, guard);

        // Safety: Entries are protected by the guard.
        match unsafe { entry.as_ref() } {
            Some(Entry::Reserved(_, claim)) if owns(claim) => {
                // The slot stays occupied, so the count is unchanged and
                // probe sequences through it stay intact.
                Self::store(table, &probe, Entry::Abandoned(key));
                Self::retire(entry, guard);

                // Wake a waiter to take over the construction.
                self.resolved.notify_all();
                true
            }
            _ => false,
        }
    }

    /// Drops every entry, shrinking the table if it stayed mostly empty for two clears in a row.
    pub fn clear(&self, guard: &LocalGuard<'_>) {
        let mut state = self.state.lock();
        let table = self.root(guard);

        let mut len = table.len();
        if state.count < (state.threshold >> 1) {
            if state.shrinkable {
                state.shrinkable = false;
                len = self.initial_capacity.max(len >> 1);

                if len < table.len() {
                    debug!(from = table.len(), to = len, "shrinking shard table");
                }
            } else {
                state.shrinkable = true;
            }
        } else {
            // Require two sparse clears in a row.
            state.shrinkable = false;
        }

        // Install a fresh table rather than clearing in place, so that threads
        // holding a probe into the old one see the table change and start over.
        let next = Table::<V>::alloc(len);
        state.count = 0;
        state.threshold = probe::threshold(len);
        self.table.store(next.raw, Ordering::Release);

        // Safety: The old table is now unreachable from the shard, and its
        // entries are not linked into the new one.
        unsafe { guard.defer_retire(table.raw, alloc::reclaim_cleared::<V>) };

        // Waiters for reservations in the old table must start over.
        self.resolved.notify_all();
    }

    /// Returns the current number of slots.
    pub fn capacity(&self, guard: &LocalGuard<'_>) -> usize {
        self.root(guard).len()
    }

    /// Returns the number of occupied slots, including reservations.
    pub fn len(&self) -> usize {
        self.state.lock().count
    }

    // Account for a newly occupied slot, growing the table once the load factor is reached.
    fn occupied(&self, state: &mut MutexGuard<'_, State>, table: Table<V>, guard: &LocalGuard<'_>) {
        if state.count >= state.threshold {
            self.grow(state, table, guard);
        }

        state.count += 1;
    }

    // Rehash every entry into a table of twice the size.
    //
    // Runs with the lock held, so no reservation can be made or resolved mid-copy.
    // Reservations move along with published values, and waiters notice the new
    // table when they next wake up.
    #[cold]
    fn grow(&self, state: &mut MutexGuard<'_, State>, table: Table<V>, guard: &LocalGuard<'_>) {
        let next = Table::<V>::alloc(table.len() << 1);

        for i in 0..table.len() {
            // Safety: `i` is in-bounds, and all writes happen under the lock.
            let entry = unsafe { table.slot(i).load(Ordering::Relaxed) };
            if entry.is_null() {
                continue;
            }

            // Safety: Live entries are owned by the table we are copying from.
            let key = unsafe { (*entry).key() };
            let mut probe = Probe::start(mix(key) >> self.shift, next.mask);

            // Keys are unique, so we only need to find an empty slot.
            //
            // Safety: `next` is a live table, and the probe is masked to its length.
            while !unsafe { next.slot(probe.i).load(Ordering::Relaxed) }.is_null() {
                probe.next(next.mask);
            }

            unsafe { next.slot(probe.i).store(entry, Ordering::Relaxed) };
        }

        state.threshold = probe::threshold(next.len());

        // Publishes the fully populated table to lock-free readers.
        self.table.store(next.raw, Ordering::Release);

        debug!(from = table.len(), to = next.len(), "grew shard table");

        // Safety: The old table is unreachable from the shard. Its entries were
        // moved, so only the allocation itself is reclaimed.
        unsafe { guard.defer_retire(table.raw, alloc::reclaim_table::<V>) };
    }
}

impl<V> Drop for Shard<V> {
    fn drop(&mut self) {
        // Safety: We have unique access to the shard, and the current table is
        // the only table that still owns its entries.
        unsafe {
            let table = Table::from_raw(*self.table.get_mut());
            table.drop_entries();
            Table::dealloc(table);
        }
    }
}

use crate::error::{Error, Result};
use crate::hash::mix;
use crate::raw::utils::{log2, CachePadded};
use crate::raw::{Claim, Reserve, Shard};

use seize::Collector;
use tracing::debug;

use std::fmt;
use std::marker::PhantomData;
use std::mem;

// The smallest table a shard starts with.
const MIN_SHARD_CAPACITY: u32 = 32;

/// A concurrent cache that constructs at most one value per address.
///
/// Keys are non-zero 32-bit addresses, and values are handed out by clone, so
/// payloads that are expensive to copy should be wrapped in an
/// [`Arc`](std::sync::Arc). See the [crate-level documentation](crate) for an
/// overview of the reservation protocol.
pub struct AddrCache<V> {
    shards: Box<[CachePadded<Shard<V>>]>,
    // Mask for the low hash bits that select a shard.
    mask: u32,
    // The number of hash bits consumed by the shard mask.
    shift: u32,
    collector: Collector,
}

// Safety: Values are cloned out to, and dropped by, arbitrary threads.
unsafe impl<V: Send + Sync> Send for AddrCache<V> {}
unsafe impl<V: Send + Sync> Sync for AddrCache<V> {}

/// A builder for an [`AddrCache`].
///
/// # Examples
///
/// ```rust
/// use addrcache::AddrCache;
/// use seize::Collector;
///
/// let cache: AddrCache<u64> = AddrCache::builder()
///     // Set the expected number of entries.
///     .capacity(2048)
///     // Set the number of threads expected to use the cache at once.
///     .concurrency(8)
///     // Set a custom garbage collector.
///     .collector(Collector::new().batch_size(128))
///     // Construct the cache.
///     .build()
///     .unwrap();
///
/// assert_eq!(cache.concurrency(), 8);
/// assert_eq!(cache.capacity(), 2048);
/// ```
pub struct AddrCacheBuilder<V> {
    capacity: u32,
    concurrency: u32,
    collector: Collector,
    _v: PhantomData<V>,
}

impl<V> AddrCacheBuilder<V> {
    /// Set the desired overall capacity of the cache.
    ///
    /// The capacity is rounded up to a power of two, and to at least 32 slots.
    pub fn capacity(self, capacity: u32) -> AddrCacheBuilder<V> {
        AddrCacheBuilder { capacity, ..self }
    }

    /// Set the desired concurrency level.
    ///
    /// The cache is split into the largest power of two shards not exceeding
    /// `concurrency`, reduced until every shard starts with at least 32 slots.
    /// See [`default_concurrency_level`] for a heuristic based on the number of cores.
    pub fn concurrency(self, concurrency: u32) -> AddrCacheBuilder<V> {
        AddrCacheBuilder {
            concurrency,
            ..self
        }
    }

    /// Set the [`seize::Collector`] used to reclaim replaced tables and entries.
    pub fn collector(self, collector: Collector) -> AddrCacheBuilder<V> {
        AddrCacheBuilder { collector, ..self }
    }

    /// Construct an [`AddrCache`] from the builder, using the configured options.
    ///
    /// Fails if the capacity or concurrency level is zero.
    pub fn build(self) -> Result<AddrCache<V>> {
        let (shards, shard_capacity) = layout(self.capacity, self.concurrency)?;

        debug!(
            shards,
            shard_capacity,
            requested_capacity = self.capacity,
            requested_concurrency = self.concurrency,
            "created address cache"
        );

        let shift = log2!(shards) as u32;
        let shards = (0..shards)
            .map(|_| CachePadded::new(Shard::new(shard_capacity, shift)))
            .collect();

        Ok(AddrCache {
            shards,
            mask: (1 << shift) - 1,
            shift,
            collector: self.collector,
        })
    }
}

impl<V> fmt::Debug for AddrCacheBuilder<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddrCacheBuilder")
            .field("capacity", &self.capacity)
            .field("concurrency", &self.concurrency)
            .field("collector", &self.collector)
            .finish()
    }
}

// Returns the number of shards and the initial capacity of each shard.
fn layout(capacity: u32, concurrency: u32) -> Result<(usize, usize)> {
    if capacity < 1 || concurrency < 1 {
        return Err(Error::InvalidConfiguration {
            capacity,
            concurrency,
        });
    }

    let capacity = capacity
        .checked_next_power_of_two()
        .unwrap_or(1 << 31)
        .max(MIN_SHARD_CAPACITY);

    // The largest power of two not exceeding the requested concurrency.
    let mut shards = 1 << (u32::BITS - 1 - concurrency.leading_zeros());

    // Degrade concurrency until every shard gets a full-sized table.
    while shards > 1 && capacity / shards < MIN_SHARD_CAPACITY {
        shards >>= 1;
    }

    Ok((shards as usize, (capacity / shards) as usize))
}

/// Returns a concurrency level suited to a machine with the given number of cores.
///
/// Grows much slower than the core count, since the cores are expected to be busy
/// with other work too.
///
/// | cores    | level |
/// |----------|-------|
/// | 0..=1    | 1     |
/// | 2..=4    | 2     |
/// | 5..=32   | 4     |
/// | 33..=128 | 8     |
/// | 129..    | 16    |
pub fn default_concurrency_level(cores: usize) -> u32 {
    match cores {
        0..=1 => 1,
        2..=4 => 2,
        5..=32 => 4,
        33..=128 => 8,
        _ => 16,
    }
}

impl<V> AddrCache<V> {
    /// Creates an empty cache sized for `capacity` entries, split into shards for
    /// roughly `concurrency` simultaneous users.
    ///
    /// Fails if either argument is zero.
    ///
    /// # Examples
    ///
    /// ```
    /// use addrcache::AddrCache;
    ///
    /// let cache: AddrCache<String> = AddrCache::new(32, 4).unwrap();
    /// // Too small for four shards of 32 slots.
    /// assert_eq!(cache.concurrency(), 1);
    ///
    /// assert!(AddrCache::<String>::new(0, 4).is_err());
    /// ```
    pub fn new(capacity: u32, concurrency: u32) -> Result<AddrCache<V>> {
        AddrCache::builder()
            .capacity(capacity)
            .concurrency(concurrency)
            .build()
    }

    /// Returns a builder for an `AddrCache`.
    ///
    /// Defaults to a capacity of 32 and a single shard.
    pub fn builder() -> AddrCacheBuilder<V> {
        AddrCacheBuilder {
            capacity: MIN_SHARD_CAPACITY,
            concurrency: 1,
            collector: Collector::new(),
            _v: PhantomData,
        }
    }

    // Returns the shard responsible for `key`, along with the in-shard hash.
    #[inline]
    fn route(&self, key: i32) -> (&Shard<V>, u32) {
        assert!(key != 0, "address 0 is reserved");

        let hash = mix(key);
        let shard = &self.shards[(hash & self.mask) as usize];
        (shard, hash >> self.shift)
    }

    /// Withdraws the calling thread's reservation for `key`, without publishing a value.
    ///
    /// One of the threads waiting on `key` wakes up and inherits the reservation,
    /// or if none are waiting, the next call to [`reserve`](AddrCache::reserve)
    /// does. Returns `false` if `key` is not reserved, or if the reservation was
    /// made by another thread.
    ///
    /// # Panics
    ///
    /// Panics if `key` is zero.
    pub fn abandon(&self, key: i32) -> bool {
        let guard = self.collector.enter();
        let (shard, hash) = self.route(key);
        shard.abandon(key, hash, Claim::held_by_current_thread, &guard)
    }

    // Withdraws exactly the reservation identified by `claim`, if it is still outstanding.
    fn withdraw(&self, key: i32, claim: Claim) -> bool {
        let guard = self.collector.enter();
        let (shard, hash) = self.route(key);
        shard.abandon(key, hash, |current| *current == claim, &guard)
    }

    /// Removes every entry from the cache.
    ///
    /// Shards are cleared one at a time. A shard that was left mostly empty by two
    /// clears in a row halves its capacity, but never below its initial capacity.
    ///
    /// Threads waiting on a reservation when its shard is cleared start over, and
    /// may be granted the reservation themselves.
    pub fn clear(&self) {
        let guard = self.collector.enter();
        for shard in self.shards.iter() {
            shard.clear(&guard);
        }
    }

    /// Returns the total number of slots across all shards.
    pub fn capacity(&self) -> usize {
        let guard = self.collector.enter();
        self.shards.iter().map(|shard| shard.capacity(&guard)).sum()
    }

    /// Returns the number of slots in each shard.
    pub fn capacities(&self) -> Vec<usize> {
        let guard = self.collector.enter();
        self.shards
            .iter()
            .map(|shard| shard.capacity(&guard))
            .collect()
    }

    /// Returns the number of entries in the cache, including outstanding reservations.
    ///
    /// Shards are counted one at a time, so under concurrent use this is only an
    /// approximation.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.len()).sum()
    }

    /// Returns `true` if the cache holds no entries or reservations.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the number of shards.
    pub fn concurrency(&self) -> usize {
        self.shards.len()
    }
}

impl<V> AddrCache<V>
where
    V: Clone,
{
    /// Returns the value for `key`, or claims the right to construct it.
    ///
    /// - `Some(value)`: the value already exists, use it.
    /// - `None`: the caller now holds the reservation for `key`, and must construct
    ///   the value and [`publish`](AddrCache::publish) it, or
    ///   [`abandon`](AddrCache::abandon) the reservation.
    ///
    /// Exactly one caller per key receives `None` between clears. Everyone else
    /// blocks until the value is published.
    ///
    /// # Panics
    ///
    /// Panics if `key` is zero.
    ///
    /// # Examples
    ///
    /// ```
    /// use addrcache::AddrCache;
    ///
    /// let cache = AddrCache::new(32, 1).unwrap();
    /// assert_eq!(cache.reserve(5), None);
    /// assert_eq!(cache.publish(5, "X"), None);
    /// assert_eq!(cache.reserve(5), Some("X"));
    /// ```
    pub fn reserve(&self, key: i32) -> Option<V> {
        match self.claim(key) {
            Reserve::Published(value) => Some(value),
            Reserve::Claimed(_) => None,
        }
    }

    // Like `reserve`, but hands back the claim when the reservation is granted.
    fn claim(&self, key: i32) -> Reserve<V> {
        let guard = self.collector.enter();
        let (shard, hash) = self.route(key);
        shard.reserve(key, hash, &guard)
    }

    /// Publishes the value for `key`, waking any threads waiting on its reservation.
    ///
    /// Publishing without a reservation is allowed. If `key` already holds a value,
    /// that value is kept and returned, and `value` is dropped.
    ///
    /// # Panics
    ///
    /// Panics if `key` is zero.
    pub fn publish(&self, key: i32, value: V) -> Option<V> {
        let guard = self.collector.enter();
        let (shard, hash) = self.route(key);
        shard.publish(key, value, hash, &guard)
    }

    /// Returns the value for `key` if it has been published.
    ///
    /// Unlike [`reserve`](AddrCache::reserve), this never blocks on a pending
    /// construction, and never claims the key.
    ///
    /// # Panics
    ///
    /// Panics if `key` is zero.
    pub fn get(&self, key: i32) -> Option<V> {
        let guard = self.collector.enter();
        let (shard, hash) = self.route(key);
        shard.get(key, hash, &guard)
    }

    /// Returns the value for `key`, constructing it with `f` if it does not exist.
    ///
    /// `f` runs without any locks held, so it may use the cache itself. If `f` panics,
    /// the reservation is abandoned and the panic is propagated.
    ///
    /// # Panics
    ///
    /// Panics if `key` is zero.
    ///
    /// # Examples
    ///
    /// ```
    /// use addrcache::AddrCache;
    ///
    /// let cache = AddrCache::new(32, 1).unwrap();
    /// assert_eq!(cache.get_or_insert_with(3, |key| key * 10), 30);
    /// assert_eq!(cache.get_or_insert_with(3, |_| unreachable!()), 30);
    /// ```
    pub fn get_or_insert_with<F>(&self, key: i32, f: F) -> V
    where
        F: FnOnce(i32) -> V,
    {
        let claim = match self.claim(key) {
            Reserve::Published(value) => return value,
            Reserve::Claimed(claim) => claim,
        };

        let reservation = Reservation {
            cache: self,
            key,
            claim,
        };
        let value = f(key);
        mem::forget(reservation);

        // Someone published outside of the protocol while we were building.
        match self.publish(key, value.clone()) {
            Some(previous) => previous,
            None => value,
        }
    }

    /// Returns a snapshot of every published entry, in no particular order.
    ///
    /// Shards are visited one at a time.
    pub fn entries(&self) -> Vec<(i32, V)> {
        let guard = self.collector.enter();
        self.shards
            .iter()
            .flat_map(|shard| shard.entries(&guard))
            .collect()
    }
}

// Abandons a reservation if construction unwinds.
//
// Only the reservation this guard was created for is withdrawn. If the shard was
// cleared during construction, the key may since have been reserved again.
struct Reservation<'a, V> {
    cache: &'a AddrCache<V>,
    key: i32,
    claim: Claim,
}

impl<V> Drop for Reservation<'_, V> {
    fn drop(&mut self) {
        self.cache.withdraw(self.key, self.claim);
    }
}

impl<V> fmt::Debug for AddrCache<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddrCache")
            .field("concurrency", &self.concurrency())
            .field("capacity", &self.capacity())
            .field("len", &self.len())
            .finish()
    }
}

impl<V> Drop for AddrCache<V> {
    fn drop(&mut self) {
        // Tables and entries retired by earlier operations are reclaimed before the
        // shards free their current tables.
        //
        // Safety: We have unique access to the collector.
        unsafe { self.collector.reclaim_all() };
    }
}

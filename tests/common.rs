#![allow(dead_code)]

use addrcache::AddrCache;
use rand::prelude::*;

// Run the test on different configurations of an `AddrCache`.
pub fn with_cache<V>(mut test: impl FnMut(&dyn Fn() -> AddrCache<V>)) {
    // A single small shard, forcing frequent resizes.
    test(&(|| AddrCache::new(32, 1).unwrap()));

    // A few shards.
    test(&(|| AddrCache::new(256, 4).unwrap()));

    // Many shards, each starting at the minimum size.
    if !cfg!(addrcache_stress) {
        test(&(|| AddrCache::new(512, 16).unwrap()));
    }
}

// Returns `count` distinct, shuffled addresses that are small multiples of each other,
// the way an object store hands them out.
pub fn addrs(count: usize, rng: &mut impl Rng) -> Vec<i32> {
    let mut prev = 0;
    let mut addrs: Vec<i32> = (0..count)
        .map(|_| {
            prev += rng.gen_range(1..=14);
            prev
        })
        .collect();

    addrs.shuffle(rng);
    addrs
}

// Installs a `tracing` subscriber that honors `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// Returns the number of threads to use for stress testing.
pub fn threads() -> usize {
    if cfg!(miri) {
        2
    } else {
        num_cpus::get_physical().next_power_of_two().clamp(2, 16)
    }
}

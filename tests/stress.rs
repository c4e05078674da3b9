use addrcache::AddrCache;
use dashmap::DashMap;
use rand::prelude::*;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

mod common;
use common::{addrs, threads, with_cache};

#[test]
fn single_construction() {
    const ITERATIONS: usize = if cfg!(miri) { 1 } else { 64 };
    const KEYS: i32 = if cfg!(miri) { 16 } else { 1 << 10 };

    with_cache::<Arc<i32>>(|cache| {
        for _ in 0..ITERATIONS {
            let cache = cache();
            let built = AtomicUsize::new(0);
            let threads = threads();
            let barrier = Barrier::new(threads);

            thread::scope(|s| {
                for _ in 0..threads {
                    s.spawn(|| {
                        barrier.wait();
                        for key in 1..=KEYS {
                            let value = cache.get_or_insert_with(key, |key| {
                                built.fetch_add(1, Ordering::Relaxed);
                                Arc::new(key)
                            });
                            assert_eq!(*value, key);
                        }
                    });
                }
            });

            assert_eq!(built.load(Ordering::Relaxed), KEYS as usize);
            assert_eq!(cache.len(), KEYS as usize);
        }
    });
}

#[test]
fn everyone_sees_the_published_value() {
    const ITERATIONS: usize = if cfg!(miri) { 1 } else { 256 };

    with_cache::<Arc<String>>(|cache| {
        for i in 0..ITERATIONS {
            let cache = cache();
            let key = i as i32 + 1;
            let owners = AtomicUsize::new(0);
            let threads = threads();
            let barrier = Barrier::new(threads);

            let seen: Vec<Arc<String>> = thread::scope(|s| {
                let (cache, owners, barrier) = (&cache, &owners, &barrier);
                let handles: Vec<_> = (0..threads)
                    .map(|t| {
                        s.spawn(move || {
                            barrier.wait();
                            match cache.reserve(key) {
                                Some(value) => value,
                                None => {
                                    owners.fetch_add(1, Ordering::Relaxed);
                                    let value = Arc::new(format!("built by {t}"));
                                    assert!(cache.publish(key, value.clone()).is_none());
                                    value
                                }
                            }
                        })
                    })
                    .collect();

                handles.into_iter().map(|h| h.join().unwrap()).collect()
            });

            assert_eq!(owners.load(Ordering::Relaxed), 1);
            assert!(seen.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        }
    });
}

#[test]
fn reserve_blocks_until_publish() {
    let cache = AddrCache::<&str>::new(32, 1).unwrap();
    let done = AtomicBool::new(false);

    assert_eq!(cache.reserve(5), None);

    thread::scope(|s| {
        let waiter = s.spawn(|| {
            let value = cache.reserve(5);
            done.store(true, Ordering::SeqCst);
            value
        });

        // The waiter cannot finish while we hold the reservation.
        thread::sleep(Duration::from_millis(50));
        assert!(!done.load(Ordering::SeqCst));

        assert_eq!(cache.publish(5, "X"), None);
        assert_eq!(waiter.join().unwrap(), Some("X"));
    });

    // Published values are returned without blocking.
    thread::scope(|s| {
        let late = s.spawn(|| cache.reserve(5));
        assert_eq!(late.join().unwrap(), Some("X"));
    });
}

#[test]
fn waiters_survive_resize() {
    let cache = AddrCache::<i32>::new(32, 1).unwrap();
    let threads = threads();

    assert_eq!(cache.reserve(1), None);

    thread::scope(|s| {
        let cache = &cache;
        let waiters: Vec<_> = (0..threads)
            .map(|_| s.spawn(move || cache.reserve(1)))
            .collect();

        // Force the table holding the reservation to be replaced a few times.
        thread::sleep(Duration::from_millis(10));
        for key in 2..=1000 {
            cache.publish(key, key);
        }

        assert_eq!(cache.publish(1, 1), None);
        for waiter in waiters {
            assert_eq!(waiter.join().unwrap(), Some(1));
        }
    });

    assert_eq!(cache.len(), 1000);
}

#[test]
fn abandoned_reservation_is_inherited() {
    const ITERATIONS: usize = if cfg!(miri) { 1 } else { 32 };

    for _ in 0..ITERATIONS {
        let cache = AddrCache::<usize>::new(32, 1).unwrap();
        let owners = AtomicUsize::new(0);
        let threads = threads();

        assert_eq!(cache.reserve(3), None);

        thread::scope(|s| {
            let (cache, owners) = (&cache, &owners);
            let waiters: Vec<_> = (0..threads)
                .map(|t| {
                    s.spawn(move || match cache.reserve(3) {
                        Some(value) => value,
                        None => {
                            owners.fetch_add(1, Ordering::Relaxed);
                            cache.publish(3, t);
                            t
                        }
                    })
                })
                .collect();

            thread::sleep(Duration::from_millis(5));
            assert!(cache.abandon(3));

            let values: Vec<usize> = waiters.into_iter().map(|w| w.join().unwrap()).collect();
            assert!(values.windows(2).all(|w| w[0] == w[1]));
        });

        assert_eq!(owners.load(Ordering::Relaxed), 1);
        assert_eq!(cache.len(), 1);
    }
}

#[test]
fn clear_hands_reservation_to_waiter() {
    let cache = AddrCache::<&str>::new(32, 1).unwrap();
    let barrier = Barrier::new(2);

    // The owner reserves first.
    assert_eq!(cache.reserve(9), None);

    thread::scope(|s| {
        let waiter = s.spawn(|| {
            let claimed = cache.reserve(9);
            barrier.wait();

            // Wait for the previous owner to publish.
            barrier.wait();
            (claimed, cache.publish(9, "waiter"))
        });

        thread::sleep(Duration::from_millis(50));
        cache.clear();

        // The waiter restarts in the new table and takes the reservation.
        barrier.wait();
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(9), None);

        // The previous owner's value fulfills the new reservation.
        assert_eq!(cache.publish(9, "owner"), None);
        barrier.wait();

        let (claimed, published) = waiter.join().unwrap();
        assert_eq!(claimed, None);
        assert_eq!(published, Some("owner"));
    });

    assert_eq!(cache.reserve(9), Some("owner"));
    assert_eq!(cache.len(), 1);
}

#[test]
fn unwinding_builder_spares_new_owner() {
    let cache = AddrCache::<usize>::new(32, 1).unwrap();
    let (cleared, reserved) = (Barrier::new(2), Barrier::new(2));
    let done = AtomicBool::new(false);

    thread::scope(|s| {
        // Starts building, then panics after the key changed hands.
        let builder = s.spawn(|| {
            cache.get_or_insert_with(5, |_| {
                cache.clear();
                cleared.wait();
                reserved.wait();
                panic!("construction failed")
            })
        });

        // Reserves the key again once the builder's reservation is gone.
        cleared.wait();
        assert_eq!(cache.reserve(5), None);
        reserved.wait();
        assert!(builder.join().is_err());

        // The builder's unwinding must not have released our reservation.
        let late = s.spawn(|| {
            let value = cache.reserve(5);
            done.store(true, Ordering::SeqCst);
            value
        });

        thread::sleep(Duration::from_millis(50));
        assert!(!done.load(Ordering::SeqCst));

        assert_eq!(cache.publish(5, 50), None);
        assert_eq!(late.join().unwrap(), Some(50));
    });

    assert_eq!(cache.len(), 1);
}

#[test]
fn abandon_requires_owner() {
    let cache = AddrCache::<usize>::new(32, 1).unwrap();
    assert_eq!(cache.reserve(4), None);

    thread::scope(|s| {
        let other = s.spawn(|| cache.abandon(4));
        assert!(!other.join().unwrap());
    });

    assert!(cache.abandon(4));
}

#[test]
fn matches_reference_map() {
    const ROUNDS: usize = if cfg!(miri) { 1 } else { 8 };
    const ENTRIES: usize = if cfg!(miri) { 64 } else { 20_000 };

    common::init_tracing();
    let keys = addrs(ENTRIES, &mut rand::thread_rng());

    with_cache::<Arc<i32>>(|cache| {
        let cache = cache();
        let check = DashMap::<i32, Arc<i32>>::new();
        let threads = threads();
        let barrier = Barrier::new(threads);

        for _ in 0..ROUNDS {
            thread::scope(|s| {
                for _ in 0..threads {
                    s.spawn(|| {
                        let mut rng = rand::thread_rng();
                        barrier.wait();

                        for _ in 0..ENTRIES / 4 {
                            let key = keys[rng.gen_range(0..ENTRIES / 16)];
                            let mut created = false;
                            let value = cache.get_or_insert_with(key, |key| {
                                let value = Arc::new(key);
                                check.insert(key, value.clone());
                                created = true;
                                value
                            });

                            if !created {
                                let expected = check.get(&key).map(|v| Arc::clone(v.value()));
                                assert!(expected.is_some_and(|e| Arc::ptr_eq(&e, &value)));
                            }
                        }
                    });
                }
            });

            check.clear();
            cache.clear();
        }
    });
}

#[test]
fn clear_while_racing() {
    const ENTRIES: usize = if cfg!(miri) { 64 } else { 1 << 12 };
    const CLEARS: usize = if cfg!(miri) { 2 } else { 64 };

    let keys = addrs(ENTRIES, &mut rand::thread_rng());

    with_cache::<i64>(|cache| {
        let cache = cache();
        let stop = AtomicBool::new(false);
        let threads = threads();

        thread::scope(|s| {
            for _ in 0..threads {
                s.spawn(|| {
                    let mut rng = rand::thread_rng();
                    while !stop.load(Ordering::Relaxed) {
                        let key = *keys.choose(&mut rng).unwrap();
                        let value = cache.get_or_insert_with(key, |key| key as i64 * 2);
                        assert_eq!(value, key as i64 * 2);
                        if let Some(value) = cache.get(key) {
                            assert_eq!(value, key as i64 * 2);
                        }
                    }
                });
            }

            for _ in 0..CLEARS {
                thread::sleep(Duration::from_millis(1));
                cache.clear();
            }
            stop.store(true, Ordering::Relaxed);
        });

        assert!(cache.capacities().iter().all(|c| c.is_power_of_two()));
    });
}

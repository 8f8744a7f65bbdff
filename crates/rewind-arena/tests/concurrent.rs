//! Integration test: many threads allocating from one arena.

use std::thread;

use rewind_arena::{ArenaConfig, Handle, RawHandle, RewindArena, StalePolicy};
use rewind_test_utils::CountingAllocator;

const THREADS: usize = 8;
const PER_THREAD: usize = 1_000;

fn assert_disjoint(mut ranges: Vec<(usize, usize)>) {
    ranges.sort_unstable();
    for pair in ranges.windows(2) {
        let (start, len) = pair[0];
        assert!(
            start + len <= pair[1].0,
            "ranges overlap: {:#x}+{} and {:#x}",
            start,
            len,
            pair[1].0
        );
    }
}

#[test]
fn concurrent_allocations_never_overlap() {
    let config = ArenaConfig::new(1024)
        .with_max_blocks(4096)
        .with_stale_policy(StalePolicy::Ignore);
    let arena = RewindArena::new(config).unwrap();

    let handles: Vec<RawHandle> = thread::scope(|s| {
        let workers: Vec<_> = (0..THREADS)
            .map(|_| {
                s.spawn(|| {
                    (0..PER_THREAD)
                        .map(|i| arena.allocate(8 + i % 5 * 8, 8, 1).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        workers
            .into_iter()
            .flat_map(|w| w.join().unwrap())
            .collect()
    });

    assert_eq!(handles.len(), THREADS * PER_THREAD);
    assert!(arena.blocks_allocated() > 1);
    assert!(handles.iter().all(|h| arena.is_valid(h)));
    assert_disjoint(
        handles
            .iter()
            .map(|h| (h.as_ptr() as usize, h.len()))
            .collect(),
    );
}

#[test]
fn concurrent_typed_writes_stay_intact() {
    let config = ArenaConfig::new(4096)
        .with_max_blocks(4096)
        .with_stale_policy(StalePolicy::Ignore);
    let arena = RewindArena::new(config).unwrap();

    let handles: Vec<(u64, Handle<u64>)> = thread::scope(|s| {
        let workers: Vec<_> = (0..THREADS as u64)
            .map(|t| {
                let arena = &arena;
                s.spawn(move || {
                    (0..PER_THREAD as u64)
                        .map(|i| {
                            let tag = t << 32 | i;
                            (tag, arena.alloc_slice(4, tag).unwrap())
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        workers
            .into_iter()
            .flat_map(|w| w.join().unwrap())
            .collect()
    });

    for (tag, handle) in &handles {
        assert_eq!(arena.get(handle).unwrap(), &[*tag; 4]);
    }
}

#[test]
fn growth_race_leaks_no_blocks() {
    let counts = CountingAllocator::new();
    {
        let config = ArenaConfig::new(256).with_max_blocks(8192);
        let arena = RewindArena::with_allocator(config, &counts).unwrap();
        thread::scope(|s| {
            for _ in 0..THREADS {
                s.spawn(|| {
                    for _ in 0..500 {
                        let _ = arena.allocate(200, 8, 1).unwrap();
                    }
                });
            }
        });
        // Blocks lost in install races were returned immediately.
        assert_eq!(counts.live_blocks(), arena.blocks_allocated());
        assert_eq!(counts.live_bytes(), arena.reserved_bytes());
    }
    assert_eq!(counts.live_blocks(), 0);
    assert_eq!(counts.live_bytes(), 0);
}

#[test]
fn epochs_with_concurrent_work() {
    let config = ArenaConfig::new(16 * 1024).with_stale_policy(StalePolicy::Ignore);
    let mut arena = RewindArena::new(config).unwrap();

    for _ in 0..20 {
        let handles: Vec<RawHandle> = thread::scope(|s| {
            let workers: Vec<_> = (0..4)
                .map(|_| {
                    s.spawn(|| {
                        (0..100)
                            .map(|_| arena.allocate(64, 8, 1).unwrap())
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            workers
                .into_iter()
                .flat_map(|w| w.join().unwrap())
                .collect()
        });
        assert_eq!(arena.bytes_allocated(), 400 * 64);
        arena.rewind().unwrap();
        assert!(handles.iter().all(|h| !arena.is_valid(h)));
    }
    // 400 * 64 bytes per epoch fits the first two blocks every time.
    assert!(arena.blocks_allocated() <= 2);
}

#[test]
fn concurrent_individual_free_reclaims_block() {
    let config = ArenaConfig::new(64 * 1024).with_individual_free(true);
    let arena = RewindArena::new(config).unwrap();

    thread::scope(|s| {
        for _ in 0..THREADS {
            s.spawn(|| {
                for _ in 0..200 {
                    let h = arena.allocate(32, 8, 1).unwrap();
                    // SAFETY: h is never dereferenced.
                    unsafe { arena.free(h).unwrap() };
                }
            });
        }
    });

    assert_eq!(arena.live_allocations(), 0);
    assert_eq!(arena.bytes_allocated(), 0);
}

#[test]
fn churn_beside_kept_allocations_leaves_them_intact() {
    let config = ArenaConfig::new(4096)
        .with_max_blocks(4096)
        .with_individual_free(true)
        .with_stale_policy(StalePolicy::Ignore);
    let arena = RewindArena::new(config).unwrap();

    let kept: Vec<(u64, Handle<u64>)> = thread::scope(|s| {
        let workers: Vec<_> = (0..THREADS as u64)
            .map(|t| {
                let arena = &arena;
                s.spawn(move || {
                    let tag = 0xC0DE_0000_0000 | t;
                    let keep = arena.alloc_slice(4, tag).unwrap();
                    for i in 0..500 {
                        let h = arena.allocate(16 + i % 4 * 16, 8, 1).unwrap();
                        // SAFETY: h is freed once and never dereferenced.
                        unsafe { arena.free(h).unwrap() };
                    }
                    (tag, keep)
                })
            })
            .collect();
        workers.into_iter().map(|w| w.join().unwrap()).collect()
    });

    assert_eq!(arena.live_allocations(), THREADS);
    for (tag, handle) in &kept {
        assert_eq!(arena.get(handle).unwrap(), &[*tag; 4]);
    }
    assert_disjoint(
        kept.iter()
            .map(|(_, h)| (h.raw().as_ptr() as usize, h.raw().len()))
            .collect(),
    );
}

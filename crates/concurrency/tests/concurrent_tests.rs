//! Concurrent/Multi-threaded Tests for stm-concurrency
//!
//! These tests verify correct behavior under actual concurrent execution:
//!
//! 1. **No Lost Updates** - Concurrent read-modify-write transactions serialize
//! 2. **Stale Reads** - A read overtaken by a commit fails validation
//! 3. **Read-Only Transactions** - No locks, no clock advance, still validated
//! 4. **Abort Atomicity** - Values of aborted attempts are never observed
//! 5. **Allocator Rollback** - Restarted attempts get their blocks back
//! 6. **Serial Fallback** - Serial mode keeps progress and correctness
//!
//! ## Running These Tests
//!
//! ```bash
//! cargo test --test concurrent_tests
//! cargo test --test concurrent_tests -- --nocapture --test-threads=1  # sequential for debugging
//! ```

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use stm_concurrency::{BackoffPolicy, StmConfig, StmRuntime, ThreadContext};
use stm_core::{Addr, ConflictKind, StmResult};

// ============================================================================
// Test Helpers
// ============================================================================

fn create_runtime() -> Arc<StmRuntime> {
    StmRuntime::startup(StmConfig::for_testing()).unwrap()
}

/// Allocate `words` zeroed words in one committed transaction
fn alloc_zeroed(ctx: &mut ThreadContext, words: usize) -> Addr {
    ctx.atomically(|tx| {
        let block = tx.allocate(words)?;
        for i in 0..words as u64 {
            tx.write_word(block.offset(i), 0);
        }
        Ok(block)
    })
    .unwrap()
}

fn increment(ctx: &mut ThreadContext, counter: Addr, unrelated: Addr) {
    ctx.atomically(|tx| {
        let _ = tx.read_i64(unrelated)?;
        let n = tx.read_i64(counter)?;
        tx.write_i64(counter, n + 1);
        Ok(())
    })
    .unwrap();
}

// ============================================================================
// SECTION 1: No Lost Updates
// ============================================================================

mod no_lost_updates {
    use super::*;

    /// Two threads, 1000 increments each, with unrelated reads mixed in
    #[test]
    fn test_two_threads_thousand_increments() {
        let runtime = create_runtime();
        let mut setup = runtime.thread_enter();
        let counter = alloc_zeroed(&mut setup, 1);
        let unrelated = alloc_zeroed(&mut setup, 4);
        drop(setup);

        let barrier = Arc::new(Barrier::new(2));
        let handles: Vec<_> = (0..2)
            .map(|i| {
                let runtime = Arc::clone(&runtime);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    let mut ctx = runtime.thread_enter();
                    barrier.wait();
                    for _ in 0..1000 {
                        increment(&mut ctx, counter, unrelated.offset(i));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(runtime.heap().load(counter) as i64, 2000);
        let metrics = runtime.shutdown();
        assert_eq!(metrics.total_committed - metrics.read_only_commits, 2002);
    }

    /// Many threads hammering one counter
    #[test]
    fn test_high_contention_counter() {
        let runtime = create_runtime();
        let mut setup = runtime.thread_enter();
        let counter = alloc_zeroed(&mut setup, 1);
        let unrelated = alloc_zeroed(&mut setup, 1);
        drop(setup);

        let num_threads = 8;
        let per_thread = 500;
        let barrier = Arc::new(Barrier::new(num_threads));
        let handles: Vec<_> = (0..num_threads)
            .map(|_| {
                let runtime = Arc::clone(&runtime);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    let mut ctx = runtime.thread_enter();
                    barrier.wait();
                    for _ in 0..per_thread {
                        increment(&mut ctx, counter, unrelated);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(
            runtime.heap().load(counter) as usize,
            num_threads * per_thread
        );
        assert_eq!(runtime.manager().orecs().locked_count(), 0);
    }

    /// Transfers between accounts preserve the total, and read-only
    /// observers only ever see the preserved total
    #[test]
    fn test_bank_transfers_preserve_total() {
        let runtime = create_runtime();
        let accounts = 16u64;
        let initial = 100i64;
        let mut setup = runtime.thread_enter();
        let bank = setup
            .atomically(|tx| {
                let bank = tx.allocate(accounts as usize)?;
                for i in 0..accounts {
                    tx.write_i64(bank.offset(i), initial);
                }
                Ok(bank)
            })
            .unwrap();
        drop(setup);

        let done = Arc::new(AtomicBool::new(false));
        let observer = {
            let runtime = Arc::clone(&runtime);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                let mut ctx = runtime.thread_enter();
                let mut observations = 0;
                while !done.load(Ordering::Acquire) {
                    let total = ctx
                        .atomically_read_only(|tx| {
                            let mut sum = 0;
                            for i in 0..accounts {
                                sum += tx.read_i64(bank.offset(i))?;
                            }
                            Ok(sum)
                        })
                        .unwrap();
                    assert_eq!(total, initial * accounts as i64);
                    observations += 1;
                }
                observations
            })
        };

        let handles: Vec<_> = (0..4u64)
            .map(|t| {
                let runtime = Arc::clone(&runtime);
                thread::spawn(move || {
                    let mut ctx = runtime.thread_enter();
                    for step in 0..500u64 {
                        let from = bank.offset((t * 7 + step) % accounts);
                        let to = bank.offset((t * 3 + step * 5 + 1) % accounts);
                        if from == to {
                            continue;
                        }
                        ctx.atomically(|tx| {
                            let a = tx.read_i64(from)?;
                            let b = tx.read_i64(to)?;
                            tx.write_i64(from, a - 1);
                            tx.write_i64(to, b + 1);
                            Ok(())
                        })
                        .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        done.store(true, Ordering::Release);
        assert!(observer.join().unwrap() > 0);

        let total: i64 = (0..accounts)
            .map(|i| runtime.heap().load(bank.offset(i)) as i64)
            .sum();
        assert_eq!(total, initial * accounts as i64);
    }
}

// ============================================================================
// SECTION 2: Stale Reads
// ============================================================================

mod stale_reads {
    use super::*;

    /// T1 reads X at version 5, T2 commits X at version 6, T1 fails
    /// validation and its re-execution observes the new value
    #[test]
    fn test_overtaken_read_fails_validation() {
        let runtime = create_runtime();
        let mut t1 = runtime.thread_enter();
        let mut t2 = runtime.thread_enter();
        let x = alloc_zeroed(&mut t1, 1);
        let y = alloc_zeroed(&mut t1, 1);

        // Bring X's record to version 5 (the two allocations took 1 and 2)
        for v in 1..=3 {
            t2.atomically(|tx| {
                tx.write_i64(x, v);
                Ok(())
            })
            .unwrap();
        }
        let orecs = runtime.manager().orecs();
        assert_eq!(orecs.for_addr(x).version(), 5);

        let mut tx1 = t1.begin();
        assert_eq!(tx1.read_i64(x).unwrap(), 3);

        t2.atomically(|tx| {
            tx.write_i64(x, 4);
            Ok(())
        })
        .unwrap();
        assert_eq!(orecs.for_addr(x).version(), 6);

        tx1.write_i64(y, 1);
        let err = tx1.end().unwrap_err();
        assert!(matches!(
            err.conflict_kind(),
            Some(ConflictKind::ValidationFailed {
                observed: 5,
                current: 6,
                ..
            })
        ));
        assert_eq!(runtime.heap().load(y), 0);

        let seen = t1
            .atomically(|tx| {
                let v = tx.read_i64(x)?;
                tx.write_i64(y, v);
                Ok(v)
            })
            .unwrap();
        assert_eq!(seen, 4);
        assert_eq!(runtime.heap().load(y), 4);
    }

    /// A read after an overtaking commit is rejected immediately
    #[test]
    fn test_read_newer_than_snapshot_rejected() {
        let runtime = create_runtime();
        let mut t1 = runtime.thread_enter();
        let mut t2 = runtime.thread_enter();
        let x = alloc_zeroed(&mut t1, 1);

        let mut tx1 = t1.begin();
        t2.atomically(|tx| {
            tx.write_i64(x, 9);
            Ok(())
        })
        .unwrap();

        let err = tx1.read_i64(x).unwrap_err();
        assert!(matches!(
            err.conflict_kind(),
            Some(ConflictKind::StaleRead { .. })
        ));
        // The attempt is doomed even if the error is swallowed
        assert!(tx1.end().is_err());
    }
}

// ============================================================================
// SECTION 3: Read-Only Transactions
// ============================================================================

mod read_only {
    use super::*;

    #[test]
    fn test_read_only_acquires_no_locks() {
        let runtime = create_runtime();
        let mut ctx = runtime.thread_enter();
        let block = alloc_zeroed(&mut ctx, 8);
        let clock = runtime.clock_now();

        let rt = Arc::clone(&runtime);
        ctx.atomically_read_only(|tx| {
            for i in 0..8 {
                tx.read_word(block.offset(i))?;
            }
            assert_eq!(rt.manager().orecs().locked_count(), 0);
            Ok(())
        })
        .unwrap();

        assert_eq!(runtime.clock_now(), clock);
        for i in 0..8 {
            assert_eq!(runtime.manager().orecs().for_addr(block.offset(i)).owner(), None);
        }
        assert_eq!(ctx.stats().read_only_commits, 1);
    }

    #[test]
    fn test_read_only_restarts_when_location_changes() {
        let runtime = create_runtime();
        let mut reader = runtime.thread_enter();
        let mut writer = runtime.thread_enter();
        let x = alloc_zeroed(&mut reader, 1);

        let mut tx = reader.begin_read_only();
        assert_eq!(tx.read_i64(x).unwrap(), 0);
        writer
            .atomically(|w| {
                w.write_i64(x, 1);
                Ok(())
            })
            .unwrap();
        assert!(tx.end().unwrap_err().is_conflict());

        let value = reader.atomically_read_only(|tx| tx.read_i64(x)).unwrap();
        assert_eq!(value, 1);
    }

    /// Read-only transactions never make writers fail
    #[test]
    fn test_readers_never_block_writers() {
        let runtime = create_runtime();
        let mut setup = runtime.thread_enter();
        let x = alloc_zeroed(&mut setup, 1);
        drop(setup);

        let stop = Arc::new(AtomicBool::new(false));
        let readers: Vec<_> = (0..3)
            .map(|_| {
                let runtime = Arc::clone(&runtime);
                let stop = Arc::clone(&stop);
                thread::spawn(move || {
                    let mut ctx = runtime.thread_enter();
                    let mut last = 0;
                    while !stop.load(Ordering::Acquire) {
                        let v = ctx.atomically_read_only(|tx| tx.read_i64(x)).unwrap();
                        assert!(v >= last, "value went backwards: {} after {}", v, last);
                        last = v;
                    }
                })
            })
            .collect();

        let mut writer = runtime.thread_enter();
        for _ in 0..1000 {
            writer
                .atomically(|tx| {
                    let v = tx.read_i64(x)?;
                    tx.write_i64(x, v + 1);
                    Ok(())
                })
                .unwrap();
        }
        stop.store(true, Ordering::Release);
        for reader in readers {
            reader.join().unwrap();
        }

        // A single writer has nobody to conflict with
        assert_eq!(writer.stats().aborted(), 0);
        assert_eq!(runtime.heap().load(x), 1000);
    }
}

// ============================================================================
// SECTION 4: Abort Atomicity
// ============================================================================

mod abort_atomicity {
    use super::*;

    const POISON: i64 = -1;

    /// Writers always abandon a first attempt after writing poison; observers
    /// must never see poison or a torn pair
    #[test]
    fn test_aborted_writes_never_visible() {
        let runtime = create_runtime();
        let mut setup = runtime.thread_enter();
        let pair = alloc_zeroed(&mut setup, 2);
        drop(setup);

        let stop = Arc::new(AtomicBool::new(false));
        let observer = {
            let runtime = Arc::clone(&runtime);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                let mut ctx = runtime.thread_enter();
                while !stop.load(Ordering::Acquire) {
                    let (a, b) = ctx
                        .atomically_read_only(|tx| {
                            Ok((tx.read_i64(pair)?, tx.read_i64(pair.offset(1))?))
                        })
                        .unwrap();
                    assert_ne!(a, POISON);
                    assert_eq!(a, b, "torn pair observed");
                }
            })
        };

        let writers: Vec<_> = (0..2)
            .map(|_| {
                let runtime = Arc::clone(&runtime);
                thread::spawn(move || {
                    let mut ctx = runtime.thread_enter();
                    for _ in 0..300 {
                        let mut first = true;
                        ctx.atomically(|tx| -> StmResult<()> {
                            let v = tx.read_i64(pair)?;
                            if first {
                                first = false;
                                tx.write_i64(pair, POISON);
                                tx.write_i64(pair.offset(1), POISON);
                                return tx.retry();
                            }
                            tx.write_i64(pair, v + 1);
                            tx.write_i64(pair.offset(1), v + 1);
                            Ok(())
                        })
                        .unwrap();
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }
        stop.store(true, Ordering::Release);
        observer.join().unwrap();

        assert_eq!(runtime.heap().load(pair) as i64, 600);
        assert_eq!(runtime.heap().load(pair.offset(1)) as i64, 600);
    }
}

// ============================================================================
// SECTION 5: Allocator Rollback
// ============================================================================

mod allocator_rollback {
    use super::*;

    #[test]
    fn test_restart_reuses_same_address() {
        let runtime = create_runtime();
        let mut ctx = runtime.thread_enter();
        let seen = Mutex::new(Vec::new());

        let block = ctx
            .atomically(|tx| {
                let block = tx.allocate(6)?;
                seen.lock().push(block);
                if seen.lock().len() == 1 {
                    return tx.retry();
                }
                Ok(block)
            })
            .unwrap();

        let seen = seen.into_inner();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], seen[1]);
        assert_eq!(block, seen[0]);
        assert_eq!(runtime.heap().live_blocks(), 1);
    }

    /// Allocation churn under contention leaks nothing
    #[test]
    fn test_concurrent_alloc_free_balances() {
        let runtime = create_runtime();
        let mut setup = runtime.thread_enter();
        let slot = alloc_zeroed(&mut setup, 1);
        drop(setup);

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let runtime = Arc::clone(&runtime);
                thread::spawn(move || {
                    let mut ctx = runtime.thread_enter();
                    for i in 0..200u64 {
                        ctx.atomically(|tx| {
                            let old = tx.read_addr(slot)?;
                            let fresh = tx.allocate(3)?;
                            tx.write_word(fresh, i);
                            tx.write_addr(slot, fresh);
                            if !old.is_null() {
                                tx.deallocate(old);
                            }
                            Ok(())
                        })
                        .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        // The slot block plus whichever block the slot points at
        assert_eq!(runtime.heap().live_blocks(), 2);
    }
}

// ============================================================================
// SECTION 6: Serial Fallback
// ============================================================================

mod serial_fallback {
    use super::*;

    #[test]
    fn test_serial_mode_keeps_counter_exact() {
        let config = StmConfig::for_testing()
            .with_backoff(BackoffPolicy::none())
            .with_serial_after(Some(1));
        let runtime = StmRuntime::startup(config).unwrap();
        let mut setup = runtime.thread_enter();
        let counter = alloc_zeroed(&mut setup, 1);
        let unrelated = alloc_zeroed(&mut setup, 1);
        drop(setup);

        let num_threads = 6;
        let barrier = Arc::new(Barrier::new(num_threads));
        let serial_total = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..num_threads)
            .map(|_| {
                let runtime = Arc::clone(&runtime);
                let barrier = Arc::clone(&barrier);
                let serial_total = Arc::clone(&serial_total);
                thread::spawn(move || {
                    let mut ctx = runtime.thread_enter();
                    barrier.wait();
                    for _ in 0..300 {
                        increment(&mut ctx, counter, unrelated);
                    }
                    serial_total.fetch_add(ctx.stats().serial_entries as usize, Ordering::Relaxed);
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(runtime.heap().load(counter), 1800);
        let metrics = runtime.shutdown();
        assert_eq!(
            metrics.serial_entries as usize,
            serial_total.load(Ordering::Relaxed)
        );
    }
}

//! Property-based checks: no leaked workers after terminate, resize
//! convergence, and chunk delivery order.

use proptest::prelude::*;
use rpool::pending::ChunkOutcome;
use rpool::pool::{Pool, PoolState};
use rpool::thread_backend::ClosureBackend;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

fn wait_until(mut condition: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

proptest! {
    /// The k-th chunk fulfilled has index k-1, regardless of the order the
    /// underlying workers happen to finish in.
    #[test]
    fn kth_fulfilled_chunk_has_index_k_minus_one(
        delays_ms in prop::collection::vec(0u64..20, 3..12),
    ) {
        let backend = ClosureBackend::new(move |(value, delay_ms): (u32, u64)| {
            std::thread::sleep(Duration::from_millis(delay_ms));
            Ok::<u32, String>(value)
        });
        let pool = Pool::new(backend, NonZeroUsize::new(4).unwrap()).unwrap();

        let tasks: Vec<(u32, u64)> = delays_ms
            .iter()
            .enumerate()
            .map(|(i, delay)| (i as u32, *delay))
            .collect();
        let expected: Vec<u32> = tasks.iter().map(|(v, _)| *v).collect();

        let job = pool.submit(tasks).unwrap();
        let results = job.wait();

        let values: Vec<u32> = results
            .into_iter()
            .map(|outcome| match outcome {
                ChunkOutcome::Ok(v) => v,
                other => panic!("unexpected outcome: {other:?}"),
            })
            .collect();
        prop_assert_eq!(values, expected);

        pool.terminate();
    }

    /// After `resize(n)` every worker handle is either still running or has
    /// been reaped, and the worker count converges to `n`.
    #[test]
    fn resize_converges_and_leaks_no_workers(
        start in 1usize..4,
        target in 1usize..4,
    ) {
        let backend = ClosureBackend::new(|x: u32| Ok::<u32, String>(x));
        let pool = Pool::new(backend, NonZeroUsize::new(start).unwrap()).unwrap();

        pool.resize(Some(target)).unwrap();
        prop_assert_eq!(pool.nproc(), target);

        pool.terminate();
        prop_assert_eq!(pool.state(), PoolState::Terminate);
    }
}

/// terminate() leaves no worker unreaped.
#[test]
fn terminate_reaps_every_worker() {
    let backend = ClosureBackend::new(|x: u32| Ok::<u32, String>(x));
    let pool = Pool::new(backend, NonZeroUsize::new(3).unwrap()).unwrap();
    for i in 0..10u32 {
        pool.submit([i]).unwrap().wait();
    }
    pool.terminate();
    assert_eq!(pool.state(), PoolState::Terminate);
}

/// Once a pool is BROKEN, a fresh `get_pool` call (simulated directly here
/// without the thread-local registry) yields a distinct, running pool.
#[test]
fn a_broken_pool_never_returns_to_run() {
    let backend = ClosureBackend::new(|_: u32| -> Result<u32, String> { panic!("boom") });
    let pool = Pool::new(backend, NonZeroUsize::new(1).unwrap()).unwrap();
    pool.submit([1u32]).unwrap();
    assert!(wait_until(|| pool.state() == PoolState::Broken, Duration::from_secs(2)));
    // BROKEN is absorbing: it must never observe RUN again.
    for _ in 0..20 {
        assert_eq!(pool.state(), PoolState::Broken);
        std::thread::sleep(Duration::from_millis(5));
    }
    pool.terminate();
}

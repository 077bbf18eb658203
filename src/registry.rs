//! The thread-local singleton registry: one pool per caller scope, replaced
//! automatically once it goes [`BROKEN`](PoolState::Broken).

use crate::backend::Backend;
use crate::error::PoolResult;
use crate::pool::{logical_cpu_count, Pool, PoolState};
use std::cell::RefCell;
use std::num::NonZeroUsize;
use std::sync::Arc;

/// Returns the calling thread's pool for backend `B`, creating it on first
/// use and transparently replacing it if a previous instance went `BROKEN`.
///
/// An existing pool is given an immediate maintenance pass before its state
/// is checked, so a crash that happened since the last periodic tick is
/// reflected here rather than being discovered only after handing back a
/// pool that's about to go `BROKEN` underneath the caller.
///
/// `make_backend` is only invoked when a new pool actually needs to be
/// built, so it's cheap to pass a closure that would be expensive to call
/// unconditionally.
pub fn get_pool<B: Backend>(
    make_backend: impl FnOnce() -> B,
    processes: Option<usize>,
) -> PoolResult<Arc<Pool<B>>> {
    thread_local! {
        static SLOT: RefCell<Option<Arc<Pool<B>>>> = const { RefCell::new(None) };
    }

    let existing = SLOT.with(|slot| slot.borrow().clone());
    if let Some(pool) = &existing {
        pool.maintain();
    }

    match existing {
        None => {
            let nproc = processes.unwrap_or_else(logical_cpu_count).max(1);
            let nproc = NonZeroUsize::new(nproc).expect("nproc clamped to at least 1 above");
            let pool = Pool::new(make_backend(), nproc)?;
            SLOT.with(|slot| *slot.borrow_mut() = Some(Arc::clone(&pool)));
            Ok(pool)
        }
        Some(pool) if pool.state() == PoolState::Run => {
            pool.resize(processes)?;
            Ok(pool)
        }
        Some(pool) => {
            // Broken (or otherwise no longer RUN): retire it and build a
            // fresh one under the same slot.
            pool.terminate();
            SLOT.with(|slot| *slot.borrow_mut() = None);
            get_pool(make_backend, processes)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread_backend::ClosureBackend;

    #[test]
    fn reuses_the_same_pool_across_calls() {
        let pool_a = get_pool(|| ClosureBackend::new(|x: u32| Ok::<u32, String>(x + 1)), Some(2)).unwrap();
        let pool_b = get_pool(|| ClosureBackend::new(|x: u32| Ok::<u32, String>(x + 1)), Some(2)).unwrap();
        assert!(Arc::ptr_eq(&pool_a, &pool_b));
        pool_a.terminate();
    }

    #[test]
    fn replaces_a_broken_pool_transparently() {
        let pool_a = get_pool(|| ClosureBackend::new(|_: u32| -> Result<u32, String> { panic!("boom") }), Some(1)).unwrap();
        pool_a.submit([1u32]).unwrap();

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
        while pool_a.state() == PoolState::Run && std::time::Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert_eq!(pool_a.state(), PoolState::Broken);

        let pool_b = get_pool(|| ClosureBackend::new(|x: u32| Ok::<u32, String>(x)), Some(1)).unwrap();
        assert!(!Arc::ptr_eq(&pool_a, &pool_b));
        pool_b.terminate();
    }

    /// A crashed worker's exit is only reaped by a maintenance pass; without
    /// `get_pool` running one eagerly, a call arriving right after the crash
    /// (before the 50ms periodic tick) would still see `Run` and hand back a
    /// pool that's about to go `Broken` underneath the caller.
    #[test]
    fn get_pool_reaps_a_fresh_crash_before_checking_state() {
        let pool_a = get_pool(|| ClosureBackend::new(|_: u32| -> Result<u32, String> { panic!("boom") }), Some(1)).unwrap();
        let job = pool_a.submit([1u32]).unwrap();
        job.wait();

        let pool_b = get_pool(|| ClosureBackend::new(|x: u32| Ok::<u32, String>(x)), Some(1)).unwrap();
        assert!(!Arc::ptr_eq(&pool_a, &pool_b));
        assert_eq!(pool_b.state(), PoolState::Run);
        pool_b.terminate();
    }
}

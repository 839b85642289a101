#[cfg(all(not(feature = "std"), loom))]
compile_error!("loom requires the standard library");

#[cfg(loom)]
pub(crate) mod atomic {
    pub(crate) use loom::sync::atomic::{fence, AtomicBool, AtomicU64, AtomicUsize};
}
#[cfg(loom)]
pub(crate) use loom::cell::UnsafeCell;
#[cfg(loom)]
pub(crate) use loom::thread::yield_now;

#[cfg(not(loom))]
pub(crate) mod atomic {
    pub(crate) use core::sync::atomic::{fence, AtomicBool, AtomicU64, AtomicUsize};
}

/// `core::cell::UnsafeCell` with loom's closure-based access API.
#[cfg(not(loom))]
#[derive(Debug)]
pub(crate) struct UnsafeCell<T>(core::cell::UnsafeCell<T>);

#[cfg(not(loom))]
impl<T> UnsafeCell<T> {
    pub(crate) const fn new(data: T) -> Self {
        Self(core::cell::UnsafeCell::new(data))
    }

    pub(crate) fn with<R>(&self, f: impl FnOnce(*const T) -> R) -> R {
        f(self.0.get())
    }

    pub(crate) fn with_mut<R>(&self, f: impl FnOnce(*mut T) -> R) -> R {
        f(self.0.get())
    }
}

// Make the core atomics usable with loom's `with_mut` API.
#[cfg(not(loom))]
pub(crate) trait WithMut<T> {
    fn with_mut<R>(&mut self, f: impl FnOnce(&mut T) -> R) -> R;
}
#[cfg(not(loom))]
impl WithMut<usize> for core::sync::atomic::AtomicUsize {
    fn with_mut<R>(&mut self, f: impl FnOnce(&mut usize) -> R) -> R {
        f(self.get_mut())
    }
}

/// Spin-then-yield backoff for the pointer lock.
///
/// Outside of loom this is `crossbeam_utils::Backoff`, which spins with `PAUSE` for a few rounds
/// and then starts yielding the thread (or keeps spinning on `no_std`). Under loom every retry has
/// to yield so the model checker can schedule the lock holder.
#[cfg(not(loom))]
pub(crate) use crossbeam_utils::Backoff;

#[cfg(loom)]
pub(crate) struct Backoff(());

#[cfg(loom)]
impl Backoff {
    pub(crate) fn new() -> Self {
        Backoff(())
    }

    pub(crate) fn snooze(&self) {
        yield_now();
    }

    pub(crate) fn is_completed(&self) -> bool {
        false
    }
}

/// Block until `word` no longer holds `expected`, or until woken by [`unpark_one`]/[`unpark_all`].
///
/// May return spuriously; callers re-check in a loop.
#[cfg(all(feature = "std", not(loom)))]
pub(crate) fn park(word: &core::sync::atomic::AtomicUsize, expected: usize) {
    use core::sync::atomic::Ordering;

    let key = word as *const _ as usize;
    // Safety: the key is the address of `word`, which outlives this call, and neither callback
    // panics or calls back into parking_lot.
    unsafe {
        parking_lot_core::park(
            key,
            || word.load(Ordering::Relaxed) == expected,
            || {},
            |_, _| {},
            parking_lot_core::DEFAULT_PARK_TOKEN,
            None,
        );
    }
}

#[cfg(all(feature = "std", not(loom)))]
pub(crate) fn unpark_one(word: &core::sync::atomic::AtomicUsize) {
    let key = word as *const _ as usize;
    // Safety: the callback does not panic or call back into parking_lot.
    unsafe {
        parking_lot_core::unpark_one(key, |_| parking_lot_core::DEFAULT_UNPARK_TOKEN);
    }
}

#[cfg(all(feature = "std", not(loom)))]
pub(crate) fn unpark_all(word: &core::sync::atomic::AtomicUsize) {
    let key = word as *const _ as usize;
    // Safety: parking_lot_core only uses the key to find the bucket.
    unsafe {
        parking_lot_core::unpark_all(key, parking_lot_core::DEFAULT_UNPARK_TOKEN);
    }
}

// No OS parking available: waiters spin (or yield, under loom) and notify is a no-op.
#[cfg(any(loom, not(feature = "std")))]
pub(crate) fn park(_word: &atomic::AtomicUsize, _expected: usize) {
    #[cfg(loom)]
    yield_now();
    #[cfg(not(loom))]
    core::hint::spin_loop();
}

#[cfg(any(loom, not(feature = "std")))]
pub(crate) fn unpark_one(_word: &atomic::AtomicUsize) {}

#[cfg(any(loom, not(feature = "std")))]
pub(crate) fn unpark_all(_word: &atomic::AtomicUsize) {}

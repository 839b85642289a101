use crate::sync::atomic::AtomicUsize;
use crate::sync::Backoff;
#[cfg(not(loom))]
use crate::sync::WithMut;
use core::sync::atomic::Ordering;

/// Set while a thread holds the lock on the word.
pub(crate) const LOCKED: usize = 0b01;

/// Toggled when the value half of a wide pointer changes but the control address does not, so
/// that waiters parked on the control word see a different word.
pub(crate) const NOTIFY: usize = 0b10;

/// Both stolen bits.
pub(crate) const META: usize = LOCKED | NOTIFY;

/// The ordering for acquiring the lock: at least `Acquire`.
pub(crate) fn acquiring(order: Ordering) -> Ordering {
    match order {
        Ordering::Relaxed | Ordering::Acquire => Ordering::Acquire,
        Ordering::Release | Ordering::AcqRel => Ordering::AcqRel,
        _ => Ordering::SeqCst,
    }
}

/// The ordering for releasing the lock: at least `Release`.
pub(crate) fn releasing(order: Ordering) -> Ordering {
    match order {
        Ordering::SeqCst => Ordering::SeqCst,
        _ => Ordering::Release,
    }
}

/// The strongest ordering a plain load supports that is no stronger than `order`.
pub(crate) fn loading(order: Ordering) -> Ordering {
    match order {
        Ordering::Release => Ordering::Relaxed,
        Ordering::AcqRel => Ordering::Acquire,
        order => order,
    }
}

/// The ordering for exchanging the word in one step: both acquire and release.
fn exchanging(order: Ordering) -> Ordering {
    match order {
        Ordering::SeqCst => Ordering::SeqCst,
        _ => Ordering::AcqRel,
    }
}

/// A pointer-sized word whose lowest bit doubles as a spinlock.
///
/// The rest of the word is the address of a control block (or zero), which is at least 4-aligned,
/// so both [`LOCKED`] and [`NOTIFY`] are free. The lock is held only for a handful of instructions
/// at a time, and never across user code or a blocking call.
///
/// The lock always acquires and releases, whatever ordering the caller passes: a pointer read out
/// of the word is dereferenced through safe code.
pub(crate) struct LockWord {
    word: AtomicUsize,
}

impl LockWord {
    pub(crate) fn new(word: usize) -> Self {
        debug_assert_eq!(word & LOCKED, 0);
        Self {
            word: AtomicUsize::new(word),
        }
    }

    /// Read the word without taking the lock. The result may have `LOCKED` set.
    pub(crate) fn load(&self, order: Ordering) -> usize {
        self.word.load(loading(order))
    }

    /// Take the lock, and return the word as it was before locking.
    pub(crate) fn lock(&self, order: Ordering) -> usize {
        let backoff = Backoff::new();
        let mut yielding = false;
        let mut current = self.word.load(Ordering::Relaxed);
        loop {
            if current & LOCKED == 0 {
                match self.word.compare_exchange_weak(
                    current,
                    current | LOCKED,
                    acquiring(order),
                    Ordering::Relaxed,
                ) {
                    Ok(_) => return current,
                    Err(now) => {
                        current = now;
                        continue;
                    }
                }
            }
            if !yielding && backoff.is_completed() {
                log::trace!("pointer lock at {:p} still held after spinning", &self.word);
                yielding = true;
            }
            backoff.snooze();
            current = self.word.load(Ordering::Relaxed);
        }
    }

    /// Release the lock, leaving `word` behind.
    ///
    /// Must only be called by the thread that took the lock.
    pub(crate) fn unlock(&self, word: usize, order: Ordering) {
        debug_assert_eq!(word & LOCKED, 0, "unlocking with the lock bit set");
        self.word.store(word, releasing(order));
    }

    /// Replace an unlocked word with `desired` in a single step, waiting out any lock holder, and
    /// return the previous word.
    pub(crate) fn exchange(&self, desired: usize, order: Ordering) -> usize {
        debug_assert_eq!(desired & LOCKED, 0);
        let backoff = Backoff::new();
        let mut current = self.word.load(Ordering::Relaxed);
        loop {
            if current & LOCKED == 0 {
                match self.word.compare_exchange_weak(
                    current,
                    desired,
                    exchanging(order),
                    Ordering::Relaxed,
                ) {
                    Ok(_) => return current,
                    Err(now) => {
                        current = now;
                        continue;
                    }
                }
            }
            backoff.snooze();
            current = self.word.load(Ordering::Relaxed);
        }
    }

    /// Block until the word is no longer `expected`, or until woken by a notify.
    ///
    /// `expected` must be an unlocked word: lock holders do not notify.
    pub(crate) fn park(&self, expected: usize) {
        debug_assert_eq!(expected & LOCKED, 0);
        crate::sync::park(&self.word, expected);
    }

    pub(crate) fn notify_one(&self) {
        crate::sync::unpark_one(&self.word);
    }

    pub(crate) fn notify_all(&self) {
        crate::sync::unpark_all(&self.word);
    }

    /// Take the word out through exclusive access, leaving zero behind.
    pub(crate) fn take(&mut self) -> usize {
        self.word.with_mut(|word| {
            debug_assert_eq!(*word & LOCKED, 0, "exclusive access to a locked word");
            core::mem::replace(word, 0)
        })
    }
}

impl core::fmt::Debug for LockWord {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let word = self.word.load(Ordering::Relaxed);
        f.debug_struct("LockWord")
            .field("address", &((word & !META) as *const ()))
            .field("locked", &(word & LOCKED != 0))
            .finish()
    }
}

use crate::control::Control;
use crate::lock::{LockWord, LOCKED, META};
use crate::narrow::{Shared, Weak};
use crate::pointer::NarrowPointer;
use crate::slice::{SharedSlice, WeakSlice};
use crate::sync::Backoff;
use core::marker::PhantomData;
use core::mem;
use core::ptr::NonNull;
use core::sync::atomic::Ordering;

/// An atomic cell holding an optional narrow pointer in a single word.
///
/// The cell owns one reference unit on whatever it stores. Every operation that takes a pointer
/// takes ownership of its unit, and every pointer handed back carries a unit the caller now owns:
/// [`load`](AtomicNarrow::load) adds one, [`swap`](AtomicNarrow::swap) hands over the cell's.
///
/// The low bit of the word is a spinlock. Reads need it too, since the count increment in `load`
/// must not race with the stored pointer being dropped, so the cell is not lock-free. The lock is
/// held for a few instructions, and pointers are never dropped while it is held.
///
/// `Relaxed` and `Acquire` orderings are strengthened: a pointer that comes out of the cell is
/// dereferenced through safe code, so every store releases and every load acquires.
pub struct AtomicNarrow<P: NarrowPointer> {
    word: LockWord,
    _owns: PhantomData<Option<P>>,
}

/// An atomic [`Shared`] pointer.
pub type AtomicShared<T> = AtomicNarrow<Shared<T>>;

/// An atomic [`Weak`] pointer.
pub type AtomicWeak<T> = AtomicNarrow<Weak<T>>;

/// An atomic [`SharedSlice`] pointer.
pub type AtomicSharedSlice<T> = AtomicNarrow<SharedSlice<T>>;

/// An atomic [`WeakSlice`] pointer.
pub type AtomicWeakSlice<T> = AtomicNarrow<WeakSlice<T>>;

// Safety: the cell moves `P`s between threads, and hands out clones of it to any thread.
unsafe impl<P: NarrowPointer + Send + Sync> Send for AtomicNarrow<P> {}
// Safety: as above.
unsafe impl<P: NarrowPointer + Send + Sync> Sync for AtomicNarrow<P> {}

fn address<P: NarrowPointer>(pointer: &Option<P>) -> usize {
    pointer
        .as_ref()
        .map_or(0, |p| P::control(p).as_ptr() as usize)
}

fn into_word<P: NarrowPointer>(pointer: Option<P>) -> usize {
    pointer.map_or(0, |p| P::into_control(p).as_ptr() as usize)
}

/// # Safety
///
/// `word` must carry a unit of `P`'s kind, or be zero.
unsafe fn from_word<P: NarrowPointer>(word: usize) -> Option<P> {
    // Safety: forwarded to the caller.
    NonNull::new((word & !META) as *mut Control).map(|control| unsafe { P::from_control(control) })
}

impl<P: NarrowPointer> AtomicNarrow<P> {
    /// This cell never guarantees lock-freedom.
    pub const IS_ALWAYS_LOCK_FREE: bool = false;

    /// A cell holding `value`.
    pub fn new(value: Option<P>) -> Self {
        Self {
            word: LockWord::new(into_word(value)),
            _owns: PhantomData,
        }
    }

    /// An empty cell.
    pub fn null() -> Self {
        Self::new(None)
    }

    /// Always `false`.
    pub fn is_lock_free(&self) -> bool {
        Self::IS_ALWAYS_LOCK_FREE
    }

    /// A new reference to the stored pointer.
    pub fn load(&self, order: Ordering) -> Option<P> {
        let word = self.word.lock(order);
        if let Some(control) = NonNull::new(word as *mut Control) {
            // Safety: the cell's own unit keeps the block alive, and nobody can take it while we
            // hold the lock.
            unsafe { P::increment(control) };
        }
        self.word.unlock(word, order);
        // Safety: the unit we just added.
        unsafe { from_word(word) }
    }

    /// Replace the stored pointer, dropping the previous one.
    pub fn store(&self, value: Option<P>, order: Ordering) {
        drop(self.swap(value, order));
    }

    /// Replace the stored pointer, returning the previous one.
    pub fn swap(&self, value: Option<P>, order: Ordering) -> Option<P> {
        let previous = self.word.exchange(into_word(value), order);
        // Safety: the cell's unit on the previous pointer is now ours.
        unsafe { from_word(previous) }
    }

    /// Store `desired` if the cell holds the same control block as `expected`.
    ///
    /// On success, the cell adopts `desired` and its previous pointer is dropped; `expected` is
    /// left alone. On failure, `expected` is replaced by a new reference to the pointer the cell
    /// holds, and `desired` is handed back unused.
    pub fn compare_exchange(
        &self,
        expected: &mut Option<P>,
        desired: Option<P>,
        success: Ordering,
        failure: Ordering,
    ) -> Result<(), Option<P>> {
        let current = self.word.lock(success);
        if current == address(expected) {
            self.word.unlock(into_word(desired), success);
            // Safety: the cell's unit on the replaced pointer is ours, and `expected` still holds
            // another one.
            drop(unsafe { from_word::<P>(current) });
            Ok(())
        } else {
            if let Some(control) = NonNull::new(current as *mut Control) {
                // Safety: the cell's own unit keeps the block alive while we hold the lock.
                unsafe { P::increment(control) };
            }
            self.word.unlock(current, failure);
            // Safety: the unit we just added.
            let witnessed = unsafe { from_word(current) };
            drop(mem::replace(expected, witnessed));
            Err(desired)
        }
    }

    /// Like [`compare_exchange`](AtomicNarrow::compare_exchange). Allowed to fail spuriously,
    /// which this implementation never does.
    pub fn compare_exchange_weak(
        &self,
        expected: &mut Option<P>,
        desired: Option<P>,
        success: Ordering,
        failure: Ordering,
    ) -> Result<(), Option<P>> {
        self.compare_exchange(expected, desired, success, failure)
    }

    /// Block until the cell holds a different control block than `old`.
    ///
    /// Returns only after the stored pointer has changed and the change was published with
    /// [`notify_one`](AtomicNarrow::notify_one) or [`notify_all`](AtomicNarrow::notify_all), or
    /// once a change is seen without having to block. A change to a different pointer and back
    /// in between two checks can go unnoticed.
    pub fn wait(&self, old: Option<&P>, order: Ordering) {
        let old = old.map_or(0, |p| P::control(p).as_ptr() as usize);
        let backoff = Backoff::new();
        loop {
            let word = self.word.load(order);
            if word & !META != old {
                return;
            }
            if word & LOCKED != 0 {
                // Lock holders do not notify, so there is nothing to park on.
                backoff.snooze();
                continue;
            }
            self.word.park(word);
        }
    }

    /// Wake one thread blocked in [`wait`](AtomicNarrow::wait).
    pub fn notify_one(&self) {
        self.word.notify_one();
    }

    /// Wake all threads blocked in [`wait`](AtomicNarrow::wait).
    pub fn notify_all(&self) {
        self.word.notify_all();
    }

    /// The stored pointer, taken out of the cell.
    pub fn into_inner(mut self) -> Option<P> {
        let word = self.word.take();
        // Safety: the cell's unit, which the cell no longer has.
        unsafe { from_word(word) }
    }
}

impl<P: NarrowPointer> Drop for AtomicNarrow<P> {
    fn drop(&mut self) {
        let word = self.word.take();
        // Safety: the cell's unit.
        drop(unsafe { from_word::<P>(word) });
    }
}

impl<P: NarrowPointer> Default for AtomicNarrow<P> {
    fn default() -> Self {
        Self::null()
    }
}

impl<P: NarrowPointer> From<P> for AtomicNarrow<P> {
    fn from(value: P) -> Self {
        Self::new(Some(value))
    }
}

impl<P: NarrowPointer> From<Option<P>> for AtomicNarrow<P> {
    fn from(value: Option<P>) -> Self {
        Self::new(value)
    }
}

impl<P: NarrowPointer> core::fmt::Debug for AtomicNarrow<P> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AtomicNarrow")
            .field("word", &self.word)
            .finish_non_exhaustive()
    }
}

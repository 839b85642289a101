use crate::control::Control;
use crate::lock::{LockWord, LOCKED, META, NOTIFY};
use crate::pointer::WidePointer;
use crate::sync::UnsafeCell;
use crate::wide::{WideShared, WideWeak};
use core::marker::PhantomData;
use core::mem;
use core::ptr::{self, NonNull};
use core::sync::atomic::Ordering;

/// An atomic cell holding an optional wide pointer.
///
/// The control block address lives in a word whose low bit is the same spinlock
/// [`AtomicNarrow`](crate::AtomicNarrow) uses; the value address is plain data guarded by that
/// lock. Reference units move exactly as they do for the narrow cell.
///
/// Waiters park on the control word. When a store changes only the value address, the second
/// lowest bit of the control word is flipped so that the word still changes and `wait` notices.
pub struct AtomicWide<P: WidePointer> {
    word: LockWord,
    value: UnsafeCell<*mut P::Target>,
    _owns: PhantomData<Option<P>>,
}

/// An atomic [`WideShared`] pointer.
pub type AtomicWideShared<T> = AtomicWide<WideShared<T>>;

/// An atomic [`WideWeak`] pointer.
pub type AtomicWideWeak<T> = AtomicWide<WideWeak<T>>;

// Safety: the cell moves `P`s between threads, and hands out clones of it to any thread. The
// value address is only touched under the lock.
unsafe impl<P: WidePointer + Send + Sync> Send for AtomicWide<P> {}
// Safety: as above.
unsafe impl<P: WidePointer + Send + Sync> Sync for AtomicWide<P> {}

fn addresses<P: WidePointer>(pointer: Option<&P>) -> (usize, *mut P::Target) {
    pointer.map_or((0, ptr::null_mut()), |p| {
        let (control, value) = P::parts(p);
        (control.as_ptr() as usize, value.as_ptr())
    })
}

fn into_words<P: WidePointer>(pointer: Option<P>) -> (usize, *mut P::Target) {
    pointer.map_or((0, ptr::null_mut()), |p| {
        let (control, value) = P::into_parts(p);
        (control.as_ptr() as usize, value.as_ptr())
    })
}

/// # Safety
///
/// `word` must carry a unit of `P`'s kind paired with `value`, or be zero.
unsafe fn from_words<P: WidePointer>(word: usize, value: *mut P::Target) -> Option<P> {
    NonNull::new((word & !META) as *mut Control).map(|control| {
        // Safety: a stored control block always comes with a non-null value address, and the
        // unit is the caller's to hand over.
        unsafe { P::from_parts(control, NonNull::new_unchecked(value)) }
    })
}

/// The control word to unlock with after the cell's pointer became `(control, _)`.
///
/// `locked` is the word as it was when the lock was taken. If the control block is unchanged,
/// its meta bits carry over, with the notify bit flipped if the value address changed.
fn next_word(locked: usize, control: usize, value_changed: bool) -> usize {
    debug_assert_eq!(locked & LOCKED, 0);
    if locked & !META != control {
        control
    } else if value_changed {
        locked ^ NOTIFY
    } else {
        locked
    }
}

impl<P: WidePointer> AtomicWide<P> {
    /// This cell never guarantees lock-freedom.
    pub const IS_ALWAYS_LOCK_FREE: bool = false;

    /// A cell holding `value`.
    pub fn new(value: Option<P>) -> Self {
        let (word, value) = into_words(value);
        Self {
            word: LockWord::new(word),
            value: UnsafeCell::new(value),
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

    fn read_value(&self) -> *mut P::Target {
        // Safety: only called with the lock held.
        self.value.with(|value| unsafe { *value })
    }

    fn replace_value(&self, new: *mut P::Target) -> *mut P::Target {
        // Safety: only called with the lock held.
        self.value.with_mut(|value| unsafe { mem::replace(&mut *value, new) })
    }

    /// A new reference to the stored pointer.
    pub fn load(&self, order: Ordering) -> Option<P> {
        let word = self.word.lock(order);
        let value = self.read_value();
        if let Some(control) = NonNull::new((word & !META) as *mut Control) {
            // Safety: the cell's own unit keeps the block alive while we hold the lock.
            unsafe { P::increment(control) };
        }
        self.word.unlock(word, order);
        // Safety: the unit we just added.
        unsafe { from_words(word, value) }
    }

    /// Replace the stored pointer, dropping the previous one.
    pub fn store(&self, value: Option<P>, order: Ordering) {
        drop(self.swap(value, order));
    }

    /// Replace the stored pointer, returning the previous one.
    pub fn swap(&self, value: Option<P>, order: Ordering) -> Option<P> {
        let (control, value) = into_words(value);
        let word = self.word.lock(order);
        let previous = self.replace_value(value);
        self.word.unlock(next_word(word, control, previous != value), order);
        // Safety: the cell's unit on the previous pointer is now ours.
        unsafe { from_words(word, previous) }
    }

    /// Store `desired` if the cell holds the same control block and value address as
    /// `expected`.
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
        let (expected_control, expected_value) = addresses(expected.as_ref());
        let word = self.word.lock(success);
        let current = self.read_value();
        if word & !META == expected_control && current == expected_value {
            let (control, value) = into_words(desired);
            self.replace_value(value);
            self.word.unlock(next_word(word, control, current != value), success);
            // Safety: the cell's unit on the replaced pointer is ours, and `expected` still holds
            // another one.
            drop(unsafe { from_words::<P>(word, current) });
            Ok(())
        } else {
            if let Some(control) = NonNull::new((word & !META) as *mut Control) {
                // Safety: the cell's own unit keeps the block alive while we hold the lock.
                unsafe { P::increment(control) };
            }
            self.word.unlock(word, failure);
            // Safety: the unit we just added.
            let witnessed = unsafe { from_words(word, current) };
            drop(mem::replace(expected, witnessed));
            Err(desired)
        }
    }

    /// Like [`compare_exchange`](AtomicWide::compare_exchange). Allowed to fail spuriously,
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

    /// Block until the cell holds a different control block or value address than `old`.
    ///
    /// As for [`AtomicNarrow::wait`](crate::AtomicNarrow::wait), a change is only guaranteed to
    /// wake the waiter once it has been published with a notify.
    ///
    /// Value-only changes are signalled by flipping a single bit of the control word, so an even
    /// number of them leaves the word as it was. If two such stores and their notifies all land
    /// between this thread's last check and its parking, the waiter keeps sleeping even though
    /// the value address is no longer `old`'s. A later notify wakes it.
    pub fn wait(&self, old: Option<&P>, order: Ordering) {
        let (old_control, old_value) = addresses(old);
        loop {
            let word = self.word.lock(order);
            let value = self.read_value();
            self.word.unlock(word, order);
            if word & !META != old_control || value != old_value {
                return;
            }
            // The meta bits are part of what is compared, so a value-only change wakes us too.
            self.word.park(word);
        }
    }

    /// Wake one thread blocked in [`wait`](AtomicWide::wait).
    pub fn notify_one(&self) {
        self.word.notify_one();
    }

    /// Wake all threads blocked in [`wait`](AtomicWide::wait).
    pub fn notify_all(&self) {
        self.word.notify_all();
    }

    /// The stored pointer, taken out of the cell.
    pub fn into_inner(mut self) -> Option<P> {
        let word = self.word.take();
        let value = self.replace_value(ptr::null_mut());
        // Safety: the cell's unit, which the cell no longer has.
        unsafe { from_words(word, value) }
    }
}

impl<P: WidePointer> Drop for AtomicWide<P> {
    fn drop(&mut self) {
        let word = self.word.take();
        let value = self.replace_value(ptr::null_mut());
        // Safety: the cell's unit.
        drop(unsafe { from_words::<P>(word, value) });
    }
}

impl<P: WidePointer> Default for AtomicWide<P> {
    fn default() -> Self {
        Self::null()
    }
}

impl<P: WidePointer> From<P> for AtomicWide<P> {
    fn from(value: P) -> Self {
        Self::new(Some(value))
    }
}

impl<P: WidePointer> From<Option<P>> for AtomicWide<P> {
    fn from(value: Option<P>) -> Self {
        Self::new(value)
    }
}

impl<P: WidePointer> core::fmt::Debug for AtomicWide<P> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AtomicWide")
            .field("word", &self.word)
            .finish_non_exhaustive()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn next_word_rules() {
        assert_eq!(next_word(0x40, 0x80, true), 0x80);
        assert_eq!(next_word(0x40, 0x80, false), 0x80);
        assert_eq!(next_word(0x40, 0x40, false), 0x40);
        assert_eq!(next_word(0x40, 0x40, true), 0x40 | NOTIFY);
        assert_eq!(next_word(0x40 | NOTIFY, 0x40, true), 0x40);
        assert_eq!(next_word(0x40 | NOTIFY, 0x80, false), 0x80);
    }

    #[test]
    fn value_only_change_flips_notify_bit() {
        let pair = WideShared::new((1u32, 2u32));
        let first = WideShared::map(pair.clone(), |p| &p.0);
        let second = WideShared::map(pair, |p| &p.1);

        let cell = AtomicWideShared::new(Some(first));
        let before = cell.word.load(Ordering::SeqCst);
        drop(cell.swap(Some(second), Ordering::SeqCst));
        let after = cell.word.load(Ordering::SeqCst);
        assert_eq!(before ^ after, NOTIFY);
        assert_eq!(*cell.load(Ordering::SeqCst).unwrap(), 2);
    }
}

use crate::error::AllocError;
#[cfg(debug_assertions)]
use crate::sync::atomic::AtomicBool;
use crate::sync::atomic::{fence, AtomicU64};
use core::alloc::Layout;
use core::any::TypeId;
use core::ptr::NonNull;
use core::sync::atomic::Ordering;

#[cfg(not(target_has_atomic = "64"))]
compile_error!("both reference counts share one `AtomicU64`, which this target does not have");

/// One reference to the managed value, in the low half of the counter.
pub const VALUE_ONE: u64 = 1;

/// One reference to the control block, in the high half of the counter.
pub const CONTROL_ONE: u64 = 1 << 32;

/// The counter delta of a single weak reference.
pub const WEAK_ONE: u64 = CONTROL_ONE;

/// The counter delta of a single shared reference: it keeps both the value and the block alive.
pub const SHARED_ONE: u64 = CONTROL_ONE | VALUE_ONE;

/// The largest number of simultaneous references a control block supports.
///
/// Each half of the counter is 32 bits wide. Increments that would take the control count past
/// this limit abort the process (or panic on `no_std`) rather than wrap. The headroom above the
/// limit absorbs increments racing with the check.
pub const MAX_REFCOUNT: u32 = u32::MAX >> 1;

#[inline]
const fn value_count(counter: u64) -> u32 {
    counter as u32
}

#[inline]
const fn control_count(counter: u64) -> u32 {
    (counter >> 32) as u32
}

/// The type-erased operations of a control block.
///
/// Every control block points at one `'static` table. Each function receives the address of the
/// [`Control`] header, which must be the first field of a `#[repr(C)]` block so that the function
/// can cast back to the concrete block type.
#[derive(Debug)]
pub struct Operations {
    /// Drop the managed value. Called exactly once, when the value count reaches zero.
    pub destroy: unsafe fn(NonNull<Control>),

    /// Free the block. Called exactly once, after `destroy`, when the control count reaches zero.
    pub deallocate: unsafe fn(NonNull<Control>),

    /// Return the address of the block's deleter if it is of the type identified by `TypeId`.
    pub deleter: Option<unsafe fn(NonNull<Control>, TypeId) -> Option<NonNull<()>>>,
}

/// A reference-count header shared by every pointer to one managed value.
///
/// The header packs two counters into a single `u64`: the number of shared references (the
/// _value count_, low half) and the number of references of either kind (the _control count_,
/// high half). A shared reference is worth [`SHARED_ONE`], a weak one [`WEAK_ONE`], so every event
/// is a single atomic update.
///
/// The value is alive while the value count is non-zero; the block itself is alive while the
/// control count is non-zero. Nothing outside the counters owns a control block: the decrement
/// that observes the last unit is the one that runs [`Operations::destroy`] and
/// [`Operations::deallocate`].
#[repr(C)]
pub struct Control {
    counter: AtomicU64,
    operations: &'static Operations,
    #[cfg(debug_assertions)]
    destroyed: AtomicBool,
}

// The atomic wrappers keep a lock bit and a notify bit in the low bits of a control address.
const _: () = assert!(core::mem::align_of::<Control>() >= 4);

impl Control {
    /// A header holding one shared reference.
    pub fn new_shared(operations: &'static Operations) -> Self {
        Self::with_counter(SHARED_ONE, operations)
    }

    /// A header holding one weak reference and no live value.
    ///
    /// Dropping that weak reference deallocates the block without calling `destroy`.
    pub fn new_weak(operations: &'static Operations) -> Self {
        Self::with_counter(WEAK_ONE, operations)
    }

    fn with_counter(counter: u64, operations: &'static Operations) -> Self {
        Self {
            counter: AtomicU64::new(counter),
            operations,
            #[cfg(debug_assertions)]
            destroyed: AtomicBool::new(value_count(counter) == 0),
        }
    }

    /// The operation table of this block.
    pub fn operations(&self) -> &'static Operations {
        self.operations
    }

    /// The number of shared references.
    ///
    /// The count may change as soon as it has been read.
    pub fn use_count(&self) -> u32 {
        value_count(self.counter.load(Ordering::Relaxed))
    }

    /// The number of weak references.
    pub fn weak_count(&self) -> u32 {
        let counter = self.counter.load(Ordering::Relaxed);
        control_count(counter) - value_count(counter)
    }

    /// Whether the caller's shared reference is the only reference of either kind.
    pub(crate) fn is_unique(&self) -> bool {
        // Acquire pairs with the release decrements of the references that are gone.
        self.counter.load(Ordering::Acquire) == SHARED_ONE
    }

    /// Add one shared reference.
    ///
    /// The caller must already hold a reference that keeps the value alive.
    #[inline]
    pub fn shared_increment(&self) {
        // A new holder is created from an existing one, so it cannot observe anything the existing
        // holder could not: relaxed is enough.
        let previous = self.counter.fetch_add(SHARED_ONE, Ordering::Relaxed);
        debug_assert!(value_count(previous) > 0, "shared increment of a dead value");
        if control_count(previous) >= MAX_REFCOUNT {
            refcount_overflow();
        }
    }

    /// Add one weak reference.
    #[inline]
    pub fn weak_increment(&self) {
        let previous = self.counter.fetch_add(WEAK_ONE, Ordering::Relaxed);
        debug_assert!(control_count(previous) > 0, "weak increment of a freed block");
        if control_count(previous) >= MAX_REFCOUNT {
            refcount_overflow();
        }
    }

    /// Add one shared reference if the value is still alive.
    ///
    /// Returns `false`, leaving the counter untouched, once the value count has reached zero; the
    /// value is never resurrected.
    pub fn try_promote(&self) -> bool {
        let mut current = self.counter.load(Ordering::Relaxed);
        while value_count(current) > 0 {
            if control_count(current) >= MAX_REFCOUNT {
                refcount_overflow();
            }
            match self.counter.compare_exchange_weak(
                current,
                current + SHARED_ONE,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(now) => current = now,
            }
        }
        false
    }

    /// Drop one shared reference.
    ///
    /// Destroys the value when this was the last shared reference, and frees the block when it was
    /// the last reference of any kind.
    ///
    /// # Safety
    ///
    /// `this` must point to a live control block in which the caller owns one shared reference.
    /// The reference is consumed, and the caller must not touch the block afterwards.
    pub unsafe fn shared_decrement(this: NonNull<Self>) {
        // Safety: the caller's shared reference keeps the block alive until we give it up below.
        let counter = unsafe { &this.as_ref().counter };
        let mut current = counter.load(Ordering::Relaxed);
        loop {
            debug_assert!(value_count(current) > 0, "shared decrement of a dead value");
            if value_count(current) == 1 && current != SHARED_ONE {
                // Last shared reference, but weak references remain. Give up only the value half,
                // so that a concurrent weak decrement cannot free the block while we destroy the
                // value in it. Our control half is released once destroy has returned.
                match counter.compare_exchange_weak(
                    current,
                    current - VALUE_ONE,
                    Ordering::Release,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        fence(Ordering::Acquire);
                        // Safety: we took the value count to zero, and still own a control unit.
                        unsafe { Self::destroy(this) };
                        // Safety: the control unit left over from our shared reference.
                        unsafe { Self::weak_decrement(this) };
                        return;
                    }
                    Err(now) => current = now,
                }
            } else {
                match counter.compare_exchange_weak(
                    current,
                    current - SHARED_ONE,
                    Ordering::Release,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        if current == SHARED_ONE {
                            fence(Ordering::Acquire);
                            // Safety: we removed the last unit of both kinds; nobody else can
                            // reach the block any more.
                            unsafe {
                                Self::destroy(this);
                                Self::deallocate(this);
                            }
                        }
                        return;
                    }
                    Err(now) => current = now,
                }
            }
        }
    }

    /// Drop one weak reference, freeing the block if it was the last reference of any kind.
    ///
    /// # Safety
    ///
    /// `this` must point to a live control block in which the caller owns one control unit that
    /// is not paired with a value unit. The unit is consumed, and the caller must not touch the
    /// block afterwards.
    pub unsafe fn weak_decrement(this: NonNull<Self>) {
        let last = {
            // Safety: the caller's unit keeps the block alive.
            let counter = unsafe { &this.as_ref().counter };
            // If ours is the only reference left, nobody can be racing with us, and the
            // subtraction can be skipped.
            if counter.load(Ordering::Acquire) == WEAK_ONE {
                true
            } else {
                let previous = counter.fetch_sub(WEAK_ONE, Ordering::Release);
                debug_assert!(control_count(previous) > value_count(previous));
                if previous == WEAK_ONE {
                    fence(Ordering::Acquire);
                    true
                } else {
                    false
                }
            }
        };
        if last {
            // Safety: the control count is zero, so the value count is too and destroy has run.
            unsafe { Self::deallocate(this) };
        }
    }

    /// Drop the value half of one shared reference, keeping its control half.
    ///
    /// This turns a shared reference into a weak one in a single update. Destroys the value if
    /// this was the last shared reference; never frees the block.
    ///
    /// # Safety
    ///
    /// `this` must point to a live control block in which the caller owns one shared reference.
    /// Afterwards the caller owns one weak reference instead.
    pub unsafe fn demote_value_unit(this: NonNull<Self>) {
        // Safety: the caller's reference keeps the block alive, and keeps doing so afterwards.
        let previous = unsafe { this.as_ref() }
            .counter
            .fetch_sub(VALUE_ONE, Ordering::Release);
        debug_assert!(value_count(previous) > 0, "demoting a dead value");
        if value_count(previous) == 1 {
            fence(Ordering::Acquire);
            // Safety: we took the value count to zero, and still own a control unit.
            unsafe { Self::destroy(this) };
        }
    }

    /// Turn the only (weak) reference of a block built with [`Control::new_weak`] into a shared
    /// one, once the value has been written.
    pub(crate) fn publish_value(&self) {
        #[cfg(debug_assertions)]
        self.destroyed.store(false, Ordering::Relaxed);
        // Release pairs with the acquire in `try_promote` on other weak references.
        let previous = self.counter.fetch_add(VALUE_ONE, Ordering::Release);
        debug_assert_eq!(value_count(previous), 0);
    }

    /// Look up the deleter stored in the block, if it has one of type `D`.
    ///
    /// # Safety
    ///
    /// `this` must point to a live control block whose value has not yet been destroyed.
    pub(crate) unsafe fn deleter<D: 'static>(this: NonNull<Self>) -> Option<NonNull<D>> {
        // Safety: the block is alive by the caller's contract.
        let lookup = unsafe { this.as_ref() }.operations.deleter?;
        // Safety: as above; the lookup only reads the block.
        unsafe { lookup(this, TypeId::of::<D>()) }.map(NonNull::cast)
    }

    unsafe fn destroy(this: NonNull<Self>) {
        // Safety: the caller took the value count to zero and still holds a control unit.
        let control = unsafe { this.as_ref() };
        #[cfg(debug_assertions)]
        {
            let again = control.destroyed.swap(true, Ordering::Relaxed);
            debug_assert!(!again, "control block value destroyed twice");
        }
        let destroy = control.operations.destroy;
        // Safety: destroy is called exactly once, here.
        unsafe { destroy(this) };
    }

    unsafe fn deallocate(this: NonNull<Self>) {
        // Safety: the caller took the control count to zero; the block is ours alone.
        let control = unsafe { this.as_ref() };
        #[cfg(debug_assertions)]
        debug_assert!(
            control.destroyed.load(Ordering::Relaxed),
            "control block freed before its value was destroyed"
        );
        let deallocate = control.operations.deallocate;
        // Safety: deallocate is called exactly once, here, after destroy.
        unsafe { deallocate(this) };
    }
}

impl core::fmt::Debug for Control {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let counter = self.counter.load(Ordering::Relaxed);
        f.debug_struct("Control")
            .field("use_count", &value_count(counter))
            .field("weak_count", &(control_count(counter) - value_count(counter)))
            .finish_non_exhaustive()
    }
}

/// Allocate uninitialized memory for a control block of type `B`.
pub(crate) fn allocate_block<B>() -> Result<NonNull<B>, AllocError> {
    allocate(Layout::new::<B>()).map(NonNull::cast)
}

/// Free memory obtained from [`allocate_block`], without dropping anything in it.
///
/// # Safety
///
/// `block` must come from `allocate_block::<B>` and must not be used afterwards.
pub(crate) unsafe fn free_block<B>(block: NonNull<B>) {
    // Safety: same layout as in allocate_block, by the caller's contract.
    unsafe { free(block.cast(), Layout::new::<B>()) };
}

/// Allocate uninitialized memory for a control block whose size is only known at run time.
pub(crate) fn allocate(layout: Layout) -> Result<NonNull<u8>, AllocError> {
    debug_assert!(layout.size() > 0, "control blocks always contain a header");
    // Safety: every block contains a `Control`, so the layout is never zero-sized.
    let ptr = unsafe { alloc::alloc::alloc(layout) };
    NonNull::new(ptr).ok_or_else(|| {
        log::warn!("control block allocation of {} bytes failed", layout.size());
        AllocError::new(layout)
    })
}

/// Free memory obtained from [`allocate`].
///
/// # Safety
///
/// `block` must come from `allocate(layout)` with this same `layout`, and must not be used
/// afterwards.
pub(crate) unsafe fn free(block: NonNull<u8>, layout: Layout) {
    // Safety: forwarded to the caller.
    unsafe { alloc::alloc::dealloc(block.as_ptr(), layout) };
}

#[cold]
#[inline(never)]
fn refcount_overflow() -> ! {
    #[cfg(feature = "std")]
    std::process::abort();
    #[cfg(not(feature = "std"))]
    panic!("reference count overflow");
}

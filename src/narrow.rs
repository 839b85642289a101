use crate::control::{allocate_block, free_block, Control, Operations};
use crate::error::AllocError;
use crate::pointer::{NarrowPointer, Owner};
use core::borrow::Borrow;
use core::marker::PhantomData;
use core::ptr::{self, NonNull};
use core::{fmt, hash, mem};

/// A control block allocated together with the value it manages.
#[repr(C)]
struct Block<T> {
    control: Control,
    value: T,
}

impl<T> Block<T> {
    const VALUE_OFFSET: usize = mem::offset_of!(Block<T>, value);

    const OPERATIONS: Operations = Operations {
        destroy: Self::destroy,
        deallocate: Self::deallocate,
        deleter: None,
    };

    unsafe fn destroy(control: NonNull<Control>) {
        let block = control.cast::<Self>().as_ptr();
        // Safety: the value count reached zero, so nobody else can reach the value.
        unsafe { ptr::drop_in_place(ptr::addr_of_mut!((*block).value)) };
    }

    unsafe fn deallocate(control: NonNull<Control>) {
        let block = control.cast::<Self>();
        // Safety: the control count reached zero; the value has already been destroyed, so only
        // the header is left to drop.
        unsafe {
            ptr::drop_in_place(ptr::addr_of_mut!((*block.as_ptr()).control));
            free_block(block);
        }
    }

    fn value(control: NonNull<Control>) -> NonNull<T> {
        // Safety: the header sits at the start of the block, so stepping forward to the value
        // stays inside the allocation, and cannot produce null.
        unsafe {
            NonNull::new_unchecked(
                control
                    .as_ptr()
                    .byte_add(Self::VALUE_OFFSET)
                    .cast::<T>(),
            )
        }
    }

    fn control(value: NonNull<T>) -> NonNull<Control> {
        // Safety: `value` points into a block, at its value field.
        unsafe {
            NonNull::new_unchecked(
                value
                    .as_ptr()
                    .byte_sub(Self::VALUE_OFFSET)
                    .cast::<Control>(),
            )
        }
    }
}

/// A single-word reference-counted pointer, with the count allocated next to the value.
///
/// `Shared` is the narrow counterpart of [`WideShared`](crate::WideShared): it only ever points
/// at the value its control block was allocated with, which is what lets it be stored in a single
/// word by [`AtomicShared`](crate::AtomicShared).
///
/// Like `Arc`, the associated functions take the pointer as `this` rather than `self`, so they do
/// not shadow methods of `T`.
pub struct Shared<T> {
    value: NonNull<T>,
    _owns: PhantomData<T>,
}

// Safety: `Shared<T>` hands out `&T` to every thread holding a clone, and the last holder, on
// any thread, drops the `T`.
unsafe impl<T: Send + Sync> Send for Shared<T> {}
// Safety: as above.
unsafe impl<T: Send + Sync> Sync for Shared<T> {}

impl<T> Shared<T> {
    /// Allocate `value` together with a fresh control block.
    ///
    /// Aborts through [`handle_alloc_error`](alloc::alloc::handle_alloc_error) if allocation
    /// fails.
    pub fn new(value: T) -> Self {
        match Self::try_new(value) {
            Ok(this) => this,
            Err(e) => alloc::alloc::handle_alloc_error(e.layout()),
        }
    }

    /// Allocate `value` together with a fresh control block, or fail without side effects
    /// (other than dropping `value`).
    pub fn try_new(value: T) -> Result<Self, AllocError> {
        let block = allocate_block::<Block<T>>()?;
        // Safety: freshly allocated for exactly this type.
        unsafe {
            block.as_ptr().write(Block {
                control: Control::new_shared(&Block::<T>::OPERATIONS),
                value,
            })
        };
        // Safety: the block holds one shared unit, which we adopt.
        Ok(unsafe { Self::from_control(block.cast()) })
    }

    /// Allocate a value that holds a weak reference to itself.
    ///
    /// `build` receives a weak pointer to the allocation it is building. Until `build` returns,
    /// upgrading that pointer (or any clone of it) fails. If `build` panics, the allocation is
    /// freed and its weak pointers stay expired.
    pub fn new_cyclic<F>(build: F) -> Self
    where
        F: FnOnce(&Weak<T>) -> T,
    {
        match Self::try_new_cyclic(build) {
            Ok(this) => this,
            Err(e) => alloc::alloc::handle_alloc_error(e.layout()),
        }
    }

    /// Like [`Shared::new_cyclic`], but reports allocation failure instead of aborting. `build`
    /// is not called if allocation fails.
    pub fn try_new_cyclic<F>(build: F) -> Result<Self, AllocError>
    where
        F: FnOnce(&Weak<T>) -> T,
    {
        let block = allocate_block::<Block<T>>()?;
        // Safety: freshly allocated; the value stays uninitialized until `build` returns, and the
        // weak-only header guarantees nobody reads it before then.
        unsafe {
            ptr::addr_of_mut!((*block.as_ptr()).control)
                .write(Control::new_weak(&Block::<T>::OPERATIONS))
        };
        let weak = Weak::<T> {
            control: block.cast(),
            _owns: PhantomData,
        };

        let value = build(&weak);

        // Safety: the block is alive while `weak` is, and nobody else touches the value field.
        unsafe {
            ptr::addr_of_mut!((*block.as_ptr()).value).write(value);
            weak.control.as_ref().publish_value();
        }
        // The weak unit became the control half of the new shared unit.
        let control = Weak::into_control(weak);
        // Safety: the block now holds the shared unit we just published.
        Ok(unsafe { Self::from_control(control) })
    }

    fn header(this: &Self) -> NonNull<Control> {
        Block::<T>::control(this.value)
    }

    /// The address of the value.
    pub fn as_ptr(this: &Self) -> *const T {
        this.value.as_ptr()
    }

    /// The number of shared references to the value.
    pub fn use_count(this: &Self) -> u32 {
        // Safety: our unit keeps the block alive.
        unsafe { Self::header(this).as_ref() }.use_count()
    }

    /// The number of weak references to the value.
    pub fn weak_count(this: &Self) -> u32 {
        // Safety: our unit keeps the block alive.
        unsafe { Self::header(this).as_ref() }.weak_count()
    }

    /// Create a weak reference to the value.
    pub fn downgrade(this: &Self) -> Weak<T> {
        let control = Self::header(this);
        // Safety: our unit keeps the block alive.
        unsafe { control.as_ref() }.weak_increment();
        Weak {
            control,
            _owns: PhantomData,
        }
    }

    /// Turn this reference into a weak one without touching the control count.
    ///
    /// Destroys the value if this was the last shared reference.
    pub fn into_weak(this: Self) -> Weak<T> {
        let control = Self::into_control(this);
        // Safety: we own the shared unit, and keep its control half as the weak unit.
        unsafe { Control::demote_value_unit(control) };
        Weak {
            control,
            _owns: PhantomData,
        }
    }

    /// Whether both pointers point at the same allocation.
    pub fn ptr_eq(this: &Self, other: &Self) -> bool {
        this.value == other.value
    }

    /// Give up ownership, returning the address of the value. The shared unit stays with the
    /// address; pass it to [`Shared::from_raw`] to get it back.
    pub fn into_raw(this: Self) -> *const T {
        let value = this.value;
        mem::forget(this);
        value.as_ptr()
    }

    /// Rebuild a pointer from an address returned by [`Shared::into_raw`].
    ///
    /// # Safety
    ///
    /// `ptr` must come from `Shared::<T>::into_raw`, and every `into_raw` may be matched by at
    /// most one `from_raw`.
    pub unsafe fn from_raw(ptr: *const T) -> Self {
        Self {
            // Safety: into_raw never returns null.
            value: unsafe { NonNull::new_unchecked(ptr.cast_mut()) },
            _owns: PhantomData,
        }
    }

    /// A mutable reference to the value, if no other reference of either kind exists.
    pub fn get_mut(this: &mut Self) -> Option<&mut T> {
        // Safety: our unit keeps the block alive.
        if unsafe { Self::header(this).as_ref() }.is_unique() {
            // Safety: there is no other way to reach the value, and `this` is borrowed mutably.
            Some(unsafe { this.value.as_mut() })
        } else {
            None
        }
    }
}

impl<T> core::ops::Deref for Shared<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: our shared unit keeps the value alive.
        unsafe { self.value.as_ref() }
    }
}

impl<T> Clone for Shared<T> {
    fn clone(&self) -> Self {
        // Safety: our unit keeps the block alive.
        unsafe { Self::header(self).as_ref() }.shared_increment();
        Self {
            value: self.value,
            _owns: PhantomData,
        }
    }
}

impl<T> Drop for Shared<T> {
    fn drop(&mut self) {
        // Safety: we own one shared unit and never touch the block again.
        unsafe { Control::shared_decrement(Self::header(self)) };
    }
}

// Safety: the control block address and the value address are a fixed distance apart, and the
// unit handed over is a shared one.
unsafe impl<T> NarrowPointer for Shared<T> {
    fn into_control(this: Self) -> NonNull<Control> {
        let control = Self::header(&this);
        mem::forget(this);
        control
    }

    fn control(this: &Self) -> NonNull<Control> {
        Self::header(this)
    }

    unsafe fn from_control(control: NonNull<Control>) -> Self {
        Self {
            value: Block::<T>::value(control),
            _owns: PhantomData,
        }
    }

    unsafe fn increment(control: NonNull<Control>) {
        // Safety: the caller guarantees the block is alive.
        unsafe { control.as_ref() }.shared_increment();
    }
}

impl<T> Owner for Shared<T> {
    fn owner(&self) -> *const Control {
        Self::header(self).as_ptr()
    }
}

impl<T: Default> Default for Shared<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> From<T> for Shared<T> {
    fn from(value: T) -> Self {
        Self::new(value)
    }
}

impl<T> AsRef<T> for Shared<T> {
    fn as_ref(&self) -> &T {
        self
    }
}

impl<T> Borrow<T> for Shared<T> {
    fn borrow(&self) -> &T {
        self
    }
}

impl<T: fmt::Debug> fmt::Debug for Shared<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

impl<T: fmt::Display> fmt::Display for Shared<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&**self, f)
    }
}

impl<T> fmt::Pointer for Shared<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Pointer::fmt(&Self::as_ptr(self), f)
    }
}

impl<T: PartialEq> PartialEq for Shared<T> {
    fn eq(&self, other: &Self) -> bool {
        **self == **other
    }
}

impl<T: Eq> Eq for Shared<T> {}

impl<T: PartialOrd> PartialOrd for Shared<T> {
    fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
        (**self).partial_cmp(&**other)
    }
}

impl<T: Ord> Ord for Shared<T> {
    fn cmp(&self, other: &Self) -> core::cmp::Ordering {
        (**self).cmp(&**other)
    }
}

impl<T: hash::Hash> hash::Hash for Shared<T> {
    fn hash<H: hash::Hasher>(&self, state: &mut H) {
        (**self).hash(state)
    }
}

/// A weak reference to a value managed by [`Shared`].
///
/// It keeps the allocation alive but not the value; [`Weak::upgrade`] gives access to the value
/// if some shared reference still exists.
pub struct Weak<T> {
    control: NonNull<Control>,
    _owns: PhantomData<T>,
}

// Safety: a weak reference only hands out `Shared<T>`.
unsafe impl<T: Send + Sync> Send for Weak<T> {}
// Safety: as above.
unsafe impl<T: Send + Sync> Sync for Weak<T> {}

impl<T> Weak<T> {
    /// A shared reference to the value, unless it has already been destroyed.
    pub fn upgrade(&self) -> Option<Shared<T>> {
        // Safety: our unit keeps the block alive.
        if unsafe { self.control.as_ref() }.try_promote() {
            // Safety: try_promote added the shared unit we adopt.
            Some(unsafe { Shared::from_control(self.control) })
        } else {
            None
        }
    }

    /// The number of shared references to the value.
    pub fn use_count(&self) -> u32 {
        // Safety: our unit keeps the block alive.
        unsafe { self.control.as_ref() }.use_count()
    }

    /// The number of weak references to the value, this one included.
    pub fn weak_count(&self) -> u32 {
        // Safety: our unit keeps the block alive.
        unsafe { self.control.as_ref() }.weak_count()
    }

    /// Whether the value has been destroyed.
    pub fn expired(&self) -> bool {
        self.use_count() == 0
    }

    /// Whether both references share an allocation.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        self.control == other.control
    }

    /// Where the value lives (or lived) in the allocation.
    pub(crate) fn value_address(&self) -> NonNull<T> {
        Block::<T>::value(self.control)
    }
}

impl<T> Clone for Weak<T> {
    fn clone(&self) -> Self {
        // Safety: our unit keeps the block alive.
        unsafe { self.control.as_ref() }.weak_increment();
        Self {
            control: self.control,
            _owns: PhantomData,
        }
    }
}

impl<T> Drop for Weak<T> {
    fn drop(&mut self) {
        // Safety: we own one weak unit and never touch the block again.
        unsafe { Control::weak_decrement(self.control) };
    }
}

// Safety: the unit handed over is a weak one.
unsafe impl<T> NarrowPointer for Weak<T> {
    fn into_control(this: Self) -> NonNull<Control> {
        let control = this.control;
        mem::forget(this);
        control
    }

    fn control(this: &Self) -> NonNull<Control> {
        this.control
    }

    unsafe fn from_control(control: NonNull<Control>) -> Self {
        Self {
            control,
            _owns: PhantomData,
        }
    }

    unsafe fn increment(control: NonNull<Control>) {
        // Safety: the caller guarantees the block is alive.
        unsafe { control.as_ref() }.weak_increment();
    }
}

impl<T> Owner for Weak<T> {
    fn owner(&self) -> *const Control {
        self.control.as_ptr()
    }
}

impl<T> fmt::Debug for Weak<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(Weak)")
    }
}

impl<T> From<Shared<T>> for Weak<T> {
    fn from(shared: Shared<T>) -> Self {
        Shared::into_weak(shared)
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use alloc::string::String;

    #[test]
    fn block_layout() {
        let shared = Shared::new(0u64);
        let control = Shared::header(&shared);
        assert_eq!(control.as_ptr() as usize % 8, 0);
        assert_eq!(Block::<u64>::value(control), shared.value);
        assert_eq!(Block::<u64>::control(shared.value), control);
    }

    #[test]
    fn zero_sized() {
        let a = Shared::new(());
        let b = a.clone();
        assert_eq!(Shared::use_count(&a), 2);
        assert!(Shared::ptr_eq(&a, &b));
    }

    #[test]
    fn get_mut_needs_uniqueness() {
        let mut a = Shared::new(String::from("x"));
        Shared::get_mut(&mut a).unwrap().push('y');
        assert_eq!(*a, "xy");

        let weak = Shared::downgrade(&a);
        assert!(Shared::get_mut(&mut a).is_none());
        drop(weak);

        let b = a.clone();
        assert!(Shared::get_mut(&mut a).is_none());
        drop(b);
        assert!(Shared::get_mut(&mut a).is_some());
    }

    #[test]
    fn raw_round_trip() {
        let a = Shared::new(7);
        let raw = Shared::into_raw(a.clone());
        assert_eq!(unsafe { *raw }, 7);
        let b = unsafe { Shared::from_raw(raw) };
        assert!(Shared::ptr_eq(&a, &b));
        assert_eq!(Shared::use_count(&a), 2);
    }
}

use crate::control::{allocate_block, free_block, Control, Operations};
use crate::deleter::{deleters::DropBox, Deleter};
use crate::error::AllocError;
use crate::narrow::{Shared, Weak};
use crate::pointer::{NarrowPointer, Owner, WidePointer};
use alloc::boxed::Box;
use core::any::TypeId;
use core::borrow::Borrow;
use core::fmt;
use core::marker::PhantomData;
use core::mem::{self, ManuallyDrop};
use core::ptr::{self, NonNull};

/// A control block for a value allocated elsewhere, with the deleter that releases it.
#[repr(C)]
struct External<T, D> {
    control: Control,
    value: NonNull<T>,
    deleter: ManuallyDrop<D>,
}

impl<T, D: Deleter<T>> External<T, D> {
    const OPERATIONS: Operations = Operations {
        destroy: Self::destroy,
        deallocate: Self::deallocate,
        deleter: Some(Self::deleter),
    };

    unsafe fn destroy(control: NonNull<Control>) {
        let block = control.cast::<Self>().as_ptr();
        // Safety: destroy runs once, so the deleter is still there to take, and the value count
        // reached zero so nobody else uses the value address.
        unsafe {
            let value = (*block).value;
            let deleter = ManuallyDrop::take(&mut (*block).deleter);
            deleter.delete(value);
        }
    }

    unsafe fn deallocate(control: NonNull<Control>) {
        let block = control.cast::<Self>();
        // Safety: the control count reached zero, and destroy already took the deleter.
        unsafe {
            ptr::drop_in_place(ptr::addr_of_mut!((*block.as_ptr()).control));
            free_block(block);
        }
    }

    unsafe fn deleter(control: NonNull<Control>, id: TypeId) -> Option<NonNull<()>> {
        if id != TypeId::of::<D>() {
            return None;
        }
        let block = control.cast::<Self>().as_ptr();
        // Safety: the block is alive by the caller's contract; `ManuallyDrop<D>` has the layout
        // of `D`.
        Some(unsafe { NonNull::new_unchecked(ptr::addr_of_mut!((*block).deleter)) }.cast())
    }
}

/// A two-word reference-counted pointer: a control block, and a value address it keeps alive.
///
/// Unlike [`Shared`], the value does not have to live in the control block's allocation. A
/// `WideShared` can adopt a raw pointer along with a [`Deleter`] for it, or alias any value the
/// control block keeps alive, such as a field of a shared struct.
///
/// Any `Shared<T>` converts into a `WideShared<T>` without touching the count.
pub struct WideShared<T> {
    control: NonNull<Control>,
    value: NonNull<T>,
    _owns: PhantomData<T>,
}

// Safety: as for `Shared<T>`. The deleter stored in the control block is `Send + Sync`.
unsafe impl<T: Send + Sync> Send for WideShared<T> {}
// Safety: as above.
unsafe impl<T: Send + Sync> Sync for WideShared<T> {}

impl<T> WideShared<T> {
    /// Allocate `value` together with a fresh control block.
    pub fn new(value: T) -> Self {
        Self::from(Shared::new(value))
    }

    /// Allocate `value` together with a fresh control block, or fail without side effects
    /// (other than dropping `value`).
    pub fn try_new(value: T) -> Result<Self, AllocError> {
        Shared::try_new(value).map(Self::from)
    }

    /// Adopt a boxed value.
    pub fn from_box(value: Box<T>) -> Self {
        let value = NonNull::from(Box::leak(value));
        // Safety: the address came from a Box, which is what DropBox frees.
        unsafe { Self::from_raw_with_deleter(value, DropBox) }
    }

    /// Adopt a value allocated elsewhere. `deleter` runs on `value` once the last shared
    /// reference is gone.
    ///
    /// # Safety
    ///
    /// `value` must be valid for shared access until `deleter` runs, and nothing else may
    /// release it.
    pub unsafe fn from_raw_with_deleter<D: Deleter<T>>(value: NonNull<T>, deleter: D) -> Self {
        // Safety: forwarded to the caller.
        match unsafe { Self::try_from_raw_with_deleter(value, deleter) } {
            Ok(this) => this,
            Err(e) => alloc::alloc::handle_alloc_error(e.layout()),
        }
    }

    /// Like [`WideShared::from_raw_with_deleter`], but reports allocation failure instead of
    /// aborting. On failure `deleter` has already been run on `value`.
    ///
    /// # Safety
    ///
    /// As for [`WideShared::from_raw_with_deleter`].
    pub unsafe fn try_from_raw_with_deleter<D: Deleter<T>>(
        value: NonNull<T>,
        deleter: D,
    ) -> Result<Self, AllocError> {
        let block = match allocate_block::<External<T, D>>() {
            Ok(block) => block,
            Err(e) => {
                // Safety: the caller handed `value` over to us together with its deleter.
                unsafe { deleter.delete(value) };
                return Err(e);
            }
        };
        // Safety: freshly allocated for exactly this type.
        unsafe {
            block.as_ptr().write(External {
                control: Control::new_shared(&External::<T, D>::OPERATIONS),
                value,
                deleter: ManuallyDrop::new(deleter),
            })
        };
        Ok(Self {
            control: block.cast(),
            value,
            _owns: PhantomData,
        })
    }

    /// A pointer to `value` that shares ownership with `owner`.
    ///
    /// # Safety
    ///
    /// `value` must stay valid for as long as `owner`'s control block keeps its value alive, and
    /// the owned value must be safe to drop on any thread that the result is sent to.
    pub unsafe fn alias<U>(owner: &WideShared<U>, value: NonNull<T>) -> Self {
        // Safety: `owner` keeps the block alive.
        unsafe { owner.control.as_ref() }.shared_increment();
        Self {
            control: owner.control,
            value,
            _owns: PhantomData,
        }
    }

    /// Point at something inside the value, keeping the whole value alive.
    ///
    /// The count is unchanged: the returned pointer takes over this one's reference.
    pub fn map<U, F>(this: Self, project: F) -> WideShared<U>
    where
        T: Send + Sync,
        F: FnOnce(&T) -> &U,
    {
        let value = NonNull::from(project(&*this));
        let (control, _) = Self::into_parts(this);
        WideShared {
            control,
            value,
            _owns: PhantomData,
        }
    }

    /// The address of the value.
    pub fn as_ptr(this: &Self) -> *const T {
        this.value.as_ptr()
    }

    /// The number of shared references keeping the value alive.
    pub fn use_count(this: &Self) -> u32 {
        // Safety: our unit keeps the block alive.
        unsafe { this.control.as_ref() }.use_count()
    }

    /// The number of weak references to the control block.
    pub fn weak_count(this: &Self) -> u32 {
        // Safety: our unit keeps the block alive.
        unsafe { this.control.as_ref() }.weak_count()
    }

    /// Create a weak reference to the value.
    pub fn downgrade(this: &Self) -> WideWeak<T> {
        // Safety: our unit keeps the block alive.
        unsafe { this.control.as_ref() }.weak_increment();
        WideWeak {
            control: this.control,
            value: this.value,
            _owns: PhantomData,
        }
    }

    /// Turn this reference into a weak one without touching the control count.
    pub fn into_weak(this: Self) -> WideWeak<T> {
        let (control, value) = Self::into_parts(this);
        // Safety: we own the shared unit, and keep its control half as the weak unit.
        unsafe { Control::demote_value_unit(control) };
        WideWeak {
            control,
            value,
            _owns: PhantomData,
        }
    }

    /// The deleter of the control block, if it was created with one of type `D`.
    pub fn get_deleter<D: 'static>(this: &Self) -> Option<&D> {
        // Safety: our unit keeps the value alive, so destroy has not taken the deleter yet, and
        // the returned borrow is tied to `this`.
        unsafe { Control::deleter::<D>(this.control).map(|d| &*d.as_ptr()) }
    }

    /// Whether both pointers point at the same address.
    pub fn ptr_eq(this: &Self, other: &Self) -> bool {
        this.value == other.value
    }
}

impl<T> core::ops::Deref for WideShared<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: our shared unit keeps the value alive.
        unsafe { self.value.as_ref() }
    }
}

impl<T> Clone for WideShared<T> {
    fn clone(&self) -> Self {
        // Safety: our unit keeps the block alive.
        unsafe { self.control.as_ref() }.shared_increment();
        Self {
            control: self.control,
            value: self.value,
            _owns: PhantomData,
        }
    }
}

impl<T> Drop for WideShared<T> {
    fn drop(&mut self) {
        // Safety: we own one shared unit and never touch the block again.
        unsafe { Control::shared_decrement(self.control) };
    }
}

// Safety: the parts are carried verbatim, and the unit handed over is a shared one.
unsafe impl<T> WidePointer for WideShared<T> {
    type Target = T;

    fn into_parts(this: Self) -> (NonNull<Control>, NonNull<T>) {
        let parts = (this.control, this.value);
        mem::forget(this);
        parts
    }

    fn parts(this: &Self) -> (NonNull<Control>, NonNull<T>) {
        (this.control, this.value)
    }

    unsafe fn from_parts(control: NonNull<Control>, value: NonNull<T>) -> Self {
        Self {
            control,
            value,
            _owns: PhantomData,
        }
    }

    unsafe fn increment(control: NonNull<Control>) {
        // Safety: the caller guarantees the block is alive.
        unsafe { control.as_ref() }.shared_increment();
    }
}

impl<T> Owner for WideShared<T> {
    fn owner(&self) -> *const Control {
        self.control.as_ptr()
    }
}

impl<T> From<Shared<T>> for WideShared<T> {
    fn from(shared: Shared<T>) -> Self {
        // Safety: a live Shared never points at null.
        let value = unsafe { NonNull::new_unchecked(Shared::as_ptr(&shared).cast_mut()) };
        Self {
            control: Shared::into_control(shared),
            value,
            _owns: PhantomData,
        }
    }
}

impl<T> From<Box<T>> for WideShared<T> {
    fn from(value: Box<T>) -> Self {
        Self::from_box(value)
    }
}

impl<T> AsRef<T> for WideShared<T> {
    fn as_ref(&self) -> &T {
        self
    }
}

impl<T> Borrow<T> for WideShared<T> {
    fn borrow(&self) -> &T {
        self
    }
}

impl<T: fmt::Debug> fmt::Debug for WideShared<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

impl<T: fmt::Display> fmt::Display for WideShared<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&**self, f)
    }
}

impl<T> fmt::Pointer for WideShared<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Pointer::fmt(&Self::as_ptr(self), f)
    }
}

/// A weak reference that remembers the address of the value it was created for.
pub struct WideWeak<T> {
    control: NonNull<Control>,
    value: NonNull<T>,
    _owns: PhantomData<T>,
}

// Safety: a weak reference only hands out `WideShared<T>`.
unsafe impl<T: Send + Sync> Send for WideWeak<T> {}
// Safety: as above.
unsafe impl<T: Send + Sync> Sync for WideWeak<T> {}

impl<T> WideWeak<T> {
    /// A shared reference to the value, unless it has already been destroyed.
    pub fn upgrade(&self) -> Option<WideShared<T>> {
        // Safety: our unit keeps the block alive.
        if unsafe { self.control.as_ref() }.try_promote() {
            Some(WideShared {
                control: self.control,
                value: self.value,
                _owns: PhantomData,
            })
        } else {
            None
        }
    }

    /// The number of shared references keeping the value alive.
    pub fn use_count(&self) -> u32 {
        // Safety: our unit keeps the block alive.
        unsafe { self.control.as_ref() }.use_count()
    }

    /// The number of weak references to the control block, this one included.
    pub fn weak_count(&self) -> u32 {
        // Safety: our unit keeps the block alive.
        unsafe { self.control.as_ref() }.weak_count()
    }

    /// Whether the value has been destroyed.
    pub fn expired(&self) -> bool {
        self.use_count() == 0
    }

    /// Whether both references share a control block and a value address.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        self.control == other.control && self.value == other.value
    }
}

impl<T> Clone for WideWeak<T> {
    fn clone(&self) -> Self {
        // Safety: our unit keeps the block alive.
        unsafe { self.control.as_ref() }.weak_increment();
        Self {
            control: self.control,
            value: self.value,
            _owns: PhantomData,
        }
    }
}

impl<T> Drop for WideWeak<T> {
    fn drop(&mut self) {
        // Safety: we own one weak unit and never touch the block again.
        unsafe { Control::weak_decrement(self.control) };
    }
}

// Safety: the parts are carried verbatim, and the unit handed over is a weak one.
unsafe impl<T> WidePointer for WideWeak<T> {
    type Target = T;

    fn into_parts(this: Self) -> (NonNull<Control>, NonNull<T>) {
        let parts = (this.control, this.value);
        mem::forget(this);
        parts
    }

    fn parts(this: &Self) -> (NonNull<Control>, NonNull<T>) {
        (this.control, this.value)
    }

    unsafe fn from_parts(control: NonNull<Control>, value: NonNull<T>) -> Self {
        Self {
            control,
            value,
            _owns: PhantomData,
        }
    }

    unsafe fn increment(control: NonNull<Control>) {
        // Safety: the caller guarantees the block is alive.
        unsafe { control.as_ref() }.weak_increment();
    }
}

impl<T> Owner for WideWeak<T> {
    fn owner(&self) -> *const Control {
        self.control.as_ptr()
    }
}

impl<T> From<Weak<T>> for WideWeak<T> {
    fn from(weak: Weak<T>) -> Self {
        let value = weak.value_address();
        Self {
            control: Weak::into_control(weak),
            value,
            _owns: PhantomData,
        }
    }
}

impl<T> From<WideShared<T>> for WideWeak<T> {
    fn from(shared: WideShared<T>) -> Self {
        WideShared::into_weak(shared)
    }
}

impl<T> fmt::Debug for WideWeak<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(WideWeak)")
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::deleter::deleters::Leak;

    #[test]
    fn deleter_lookup_by_type() {
        let shared = WideShared::from_box(Box::new(5));
        assert_eq!(WideShared::get_deleter::<DropBox>(&shared), Some(&DropBox));
        assert!(WideShared::get_deleter::<Leak>(&shared).is_none());

        let narrow = WideShared::new(5);
        assert!(WideShared::get_deleter::<DropBox>(&narrow).is_none());
    }

    #[test]
    fn static_value() {
        static VALUE: u32 = 9;
        // Safety: a static outlives everything, and Leak never frees it.
        let shared = unsafe { WideShared::from_raw_with_deleter(NonNull::from(&VALUE), Leak) };
        let other = shared.clone();
        assert_eq!(*other, 9);
        assert_eq!(WideShared::use_count(&shared), 2);
    }

    #[test]
    fn map_keeps_count() {
        let pair = WideShared::new((1u8, 2u16));
        let second = WideShared::map(pair.clone(), |p| &p.1);
        assert_eq!(*second, 2);
        assert_eq!(WideShared::use_count(&pair), 2);
        assert!(second.owner_eq(&pair));
    }
}

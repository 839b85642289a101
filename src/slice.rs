use crate::control::{allocate, free, Control, Operations};
use crate::error::AllocError;
use crate::pointer::{NarrowPointer, Owner};
use alloc::vec::Vec;
use core::alloc::Layout;
use core::borrow::Borrow;
use core::marker::PhantomData;
use core::ptr::{self, NonNull};
use core::{fmt, hash, mem};

/// The fixed part of a slice block. The elements follow it in the same allocation.
#[repr(C)]
struct Header {
    control: Control,
    len: usize,
}

/// Layout arithmetic and type-erased operations for blocks holding `[T]`.
struct SliceBlock<T>(PhantomData<T>);

impl<T> SliceBlock<T> {
    const ELEMENTS_OFFSET: usize =
        mem::size_of::<Header>().next_multiple_of(mem::align_of::<T>());

    const OPERATIONS: Operations = Operations {
        destroy: Self::destroy,
        deallocate: Self::deallocate,
        deleter: None,
    };

    /// The layout of a block holding `len` elements, or `None` if it does not fit in `isize`.
    fn layout(len: usize) -> Option<Layout> {
        let elements = Layout::array::<T>(len).ok()?;
        let (layout, offset) = Layout::new::<Header>().extend(elements).ok()?;
        debug_assert_eq!(offset, Self::ELEMENTS_OFFSET);
        Some(layout.pad_to_align())
    }

    fn elements(control: NonNull<Control>) -> NonNull<T> {
        // Safety: the elements start inside the allocation the header starts, and the sum
        // cannot wrap to null.
        unsafe {
            NonNull::new_unchecked(control.as_ptr().byte_add(Self::ELEMENTS_OFFSET).cast::<T>())
        }
    }

    /// # Safety
    ///
    /// `control` must be the header of a live slice block.
    unsafe fn len(control: NonNull<Control>) -> usize {
        // Safety: forwarded to the caller; `len` is never written after construction.
        unsafe { (*control.cast::<Header>().as_ptr()).len }
    }

    /// # Safety
    ///
    /// `control` must be the header of a live slice block whose elements have not been
    /// destroyed.
    unsafe fn slice(control: NonNull<Control>) -> NonNull<[T]> {
        // Safety: forwarded to the caller.
        let len = unsafe { Self::len(control) };
        NonNull::slice_from_raw_parts(Self::elements(control), len)
    }

    unsafe fn destroy(control: NonNull<Control>) {
        // Safety: the value count reached zero, so nobody else can reach the elements.
        unsafe { ptr::drop_in_place(Self::slice(control).as_ptr()) };
    }

    unsafe fn deallocate(control: NonNull<Control>) {
        // Safety: the control count reached zero, so the block is ours alone; the elements have
        // already been destroyed, leaving only the header to drop.
        unsafe {
            let len = Self::len(control);
            // The same length produced a layout when the block was allocated.
            let layout = Self::layout(len).unwrap_unchecked();
            ptr::drop_in_place(control.cast::<Header>().as_ptr());
            free(control.cast(), layout);
        }
    }
}

/// A block whose elements are still being written. Dropping it drops the elements written so
/// far and frees the memory; the header is never written.
struct Partial<T> {
    block: NonNull<u8>,
    layout: Layout,
    elements: NonNull<T>,
    written: usize,
}

impl<T> Drop for Partial<T> {
    fn drop(&mut self) {
        // Safety: the first `written` elements are initialized and owned by nobody else, and the
        // block came from `allocate(layout)`.
        unsafe {
            ptr::drop_in_place(ptr::slice_from_raw_parts_mut(
                self.elements.as_ptr(),
                self.written,
            ));
            free(self.block, self.layout);
        }
    }
}

#[cold]
#[inline(never)]
fn capacity_overflow() -> ! {
    panic!("slice block size overflows `isize`");
}

/// A single-word reference-counted slice.
///
/// The element count is stored in the allocation, next to the control block, so a
/// `SharedSlice<T>` is one address wide like [`Shared`](crate::Shared), and can be stored in
/// an [`AtomicSharedSlice`](crate::AtomicSharedSlice).
///
/// ```rust
/// use packrc::SharedSlice;
/// use std::mem::size_of;
///
/// let squares = SharedSlice::from_fn(4, |i| i * i);
/// assert_eq!(*squares, [0, 1, 4, 9]);
/// assert_eq!(size_of::<Option<SharedSlice<u8>>>(), size_of::<usize>());
/// ```
pub struct SharedSlice<T> {
    control: NonNull<Control>,
    _owns: PhantomData<[T]>,
}

// Safety: as for `Shared<T>`; every holder reads the elements and the last one drops them.
unsafe impl<T: Send + Sync> Send for SharedSlice<T> {}
// Safety: as above.
unsafe impl<T: Send + Sync> Sync for SharedSlice<T> {}

impl<T> SharedSlice<T> {
    /// Allocate `len` elements, the `i`th produced by `f(i)`, next to a fresh control block.
    ///
    /// If `f` panics, the elements already produced are dropped and the allocation is freed
    /// before the panic continues. No control block is ever visible half built.
    ///
    /// # Panics
    ///
    /// If the block would be larger than `isize::MAX` bytes. Aborts through
    /// [`handle_alloc_error`](alloc::alloc::handle_alloc_error) if allocation fails.
    pub fn from_fn<F>(len: usize, f: F) -> Self
    where
        F: FnMut(usize) -> T,
    {
        match Self::try_from_fn(len, f) {
            Ok(this) => this,
            Err(e) => alloc::alloc::handle_alloc_error(e.layout()),
        }
    }

    /// Like [`SharedSlice::from_fn`], but reports allocation failure instead of aborting. `f` is
    /// not called if allocation fails.
    pub fn try_from_fn<F>(len: usize, mut f: F) -> Result<Self, AllocError>
    where
        F: FnMut(usize) -> T,
    {
        let Some(layout) = SliceBlock::<T>::layout(len) else {
            capacity_overflow();
        };
        let block = allocate(layout)?;
        let control = block.cast::<Control>();
        let mut partial = Partial {
            block,
            layout,
            elements: SliceBlock::<T>::elements(control),
            written: 0,
        };
        while partial.written < len {
            let element = f(partial.written);
            // Safety: in bounds, and not yet written.
            unsafe { partial.elements.as_ptr().add(partial.written).write(element) };
            partial.written += 1;
        }
        mem::forget(partial);

        // Safety: the block was allocated for this layout, and all `len` elements are written.
        unsafe {
            control.cast::<Header>().as_ptr().write(Header {
                control: Control::new_shared(&SliceBlock::<T>::OPERATIONS),
                len,
            })
        };
        Ok(Self {
            control,
            _owns: PhantomData,
        })
    }

    /// `len` clones of `value`.
    pub fn from_elem(len: usize, value: T) -> Self
    where
        T: Clone,
    {
        Self::from_fn(len, |_| value.clone())
    }

    /// The address of the first element.
    pub fn as_ptr(this: &Self) -> *const T {
        SliceBlock::<T>::elements(this.control).as_ptr()
    }

    /// The number of shared references to the elements.
    pub fn use_count(this: &Self) -> u32 {
        // Safety: our unit keeps the block alive.
        unsafe { this.control.as_ref() }.use_count()
    }

    /// The number of weak references to the elements.
    pub fn weak_count(this: &Self) -> u32 {
        // Safety: our unit keeps the block alive.
        unsafe { this.control.as_ref() }.weak_count()
    }

    /// Create a weak reference to the elements.
    pub fn downgrade(this: &Self) -> WeakSlice<T> {
        // Safety: our unit keeps the block alive.
        unsafe { this.control.as_ref() }.weak_increment();
        WeakSlice {
            control: this.control,
            _owns: PhantomData,
        }
    }

    /// Turn this reference into a weak one without touching the control count.
    pub fn into_weak(this: Self) -> WeakSlice<T> {
        let control = Self::into_control(this);
        // Safety: we own the shared unit, and keep its control half as the weak unit.
        unsafe { Control::demote_value_unit(control) };
        WeakSlice {
            control,
            _owns: PhantomData,
        }
    }

    /// Whether both pointers point at the same allocation.
    pub fn ptr_eq(this: &Self, other: &Self) -> bool {
        this.control == other.control
    }

    /// Mutable access to the elements, if no other reference of either kind exists.
    pub fn get_mut(this: &mut Self) -> Option<&mut [T]> {
        // Safety: our unit keeps the block alive.
        if unsafe { this.control.as_ref() }.is_unique() {
            // Safety: there is no other way to reach the elements, and `this` is borrowed
            // mutably.
            Some(unsafe { SliceBlock::<T>::slice(this.control).as_mut() })
        } else {
            None
        }
    }
}

impl<T> core::ops::Deref for SharedSlice<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        // Safety: our shared unit keeps the elements alive.
        unsafe { SliceBlock::<T>::slice(self.control).as_ref() }
    }
}

impl<T> Clone for SharedSlice<T> {
    fn clone(&self) -> Self {
        // Safety: our unit keeps the block alive.
        unsafe { self.control.as_ref() }.shared_increment();
        Self {
            control: self.control,
            _owns: PhantomData,
        }
    }
}

impl<T> Drop for SharedSlice<T> {
    fn drop(&mut self) {
        // Safety: we own one shared unit and never touch the block again.
        unsafe { Control::shared_decrement(self.control) };
    }
}

// Safety: the pointer is the control block address, and the unit handed over is a shared one.
unsafe impl<T> NarrowPointer for SharedSlice<T> {
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
        unsafe { control.as_ref() }.shared_increment();
    }
}

impl<T> Owner for SharedSlice<T> {
    fn owner(&self) -> *const Control {
        self.control.as_ptr()
    }
}

impl<T> Default for SharedSlice<T> {
    fn default() -> Self {
        Self::from_fn(0, |_| unreachable!())
    }
}

impl<T: Clone> From<&[T]> for SharedSlice<T> {
    fn from(elements: &[T]) -> Self {
        Self::from_fn(elements.len(), |i| elements[i].clone())
    }
}

impl<T> From<Vec<T>> for SharedSlice<T> {
    fn from(mut elements: Vec<T>) -> Self {
        let len = elements.len();
        let Some(layout) = SliceBlock::<T>::layout(len) else {
            capacity_overflow();
        };
        let block = match allocate(layout) {
            Ok(block) => block,
            Err(e) => alloc::alloc::handle_alloc_error(e.layout()),
        };
        let control = block.cast::<Control>();
        // Safety: the elements move bitwise into the fresh block, and the vector forgets them
        // before it frees its buffer.
        unsafe {
            ptr::copy_nonoverlapping(
                elements.as_ptr(),
                SliceBlock::<T>::elements(control).as_ptr(),
                len,
            );
            elements.set_len(0);
            control.cast::<Header>().as_ptr().write(Header {
                control: Control::new_shared(&SliceBlock::<T>::OPERATIONS),
                len,
            });
        }
        Self {
            control,
            _owns: PhantomData,
        }
    }
}

impl<T> FromIterator<T> for SharedSlice<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self::from(iter.into_iter().collect::<Vec<T>>())
    }
}

impl<T> AsRef<[T]> for SharedSlice<T> {
    fn as_ref(&self) -> &[T] {
        self
    }
}

impl<T> Borrow<[T]> for SharedSlice<T> {
    fn borrow(&self) -> &[T] {
        self
    }
}

impl<T: fmt::Debug> fmt::Debug for SharedSlice<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

impl<T> fmt::Pointer for SharedSlice<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Pointer::fmt(&Self::as_ptr(self), f)
    }
}

impl<T: PartialEq> PartialEq for SharedSlice<T> {
    fn eq(&self, other: &Self) -> bool {
        **self == **other
    }
}

impl<T: Eq> Eq for SharedSlice<T> {}

impl<T: PartialOrd> PartialOrd for SharedSlice<T> {
    fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
        (**self).partial_cmp(&**other)
    }
}

impl<T: Ord> Ord for SharedSlice<T> {
    fn cmp(&self, other: &Self) -> core::cmp::Ordering {
        (**self).cmp(&**other)
    }
}

impl<T: hash::Hash> hash::Hash for SharedSlice<T> {
    fn hash<H: hash::Hasher>(&self, state: &mut H) {
        (**self).hash(state)
    }
}

/// A weak reference to the elements of a [`SharedSlice`].
pub struct WeakSlice<T> {
    control: NonNull<Control>,
    _owns: PhantomData<[T]>,
}

// Safety: a weak reference only hands out `SharedSlice<T>`.
unsafe impl<T: Send + Sync> Send for WeakSlice<T> {}
// Safety: as above.
unsafe impl<T: Send + Sync> Sync for WeakSlice<T> {}

impl<T> WeakSlice<T> {
    /// A shared reference to the elements, unless they have already been destroyed.
    pub fn upgrade(&self) -> Option<SharedSlice<T>> {
        // Safety: our unit keeps the block alive.
        if unsafe { self.control.as_ref() }.try_promote() {
            Some(SharedSlice {
                control: self.control,
                _owns: PhantomData,
            })
        } else {
            None
        }
    }

    /// The number of elements the slice was built with. Still available once they are gone.
    pub fn len(&self) -> usize {
        // Safety: our unit keeps the header alive.
        unsafe { SliceBlock::<T>::len(self.control) }
    }

    /// Whether the slice was built empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The number of shared references to the elements.
    pub fn use_count(&self) -> u32 {
        // Safety: our unit keeps the block alive.
        unsafe { self.control.as_ref() }.use_count()
    }

    /// The number of weak references, this one included.
    pub fn weak_count(&self) -> u32 {
        // Safety: our unit keeps the block alive.
        unsafe { self.control.as_ref() }.weak_count()
    }

    /// Whether the elements have been destroyed.
    pub fn expired(&self) -> bool {
        self.use_count() == 0
    }

    /// Whether both references share an allocation.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        self.control == other.control
    }
}

impl<T> Clone for WeakSlice<T> {
    fn clone(&self) -> Self {
        // Safety: our unit keeps the block alive.
        unsafe { self.control.as_ref() }.weak_increment();
        Self {
            control: self.control,
            _owns: PhantomData,
        }
    }
}

impl<T> Drop for WeakSlice<T> {
    fn drop(&mut self) {
        // Safety: we own one weak unit and never touch the block again.
        unsafe { Control::weak_decrement(self.control) };
    }
}

// Safety: the unit handed over is a weak one.
unsafe impl<T> NarrowPointer for WeakSlice<T> {
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

impl<T> Owner for WeakSlice<T> {
    fn owner(&self) -> *const Control {
        self.control.as_ptr()
    }
}

impl<T> fmt::Debug for WeakSlice<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(WeakSlice)")
    }
}

impl<T> From<SharedSlice<T>> for WeakSlice<T> {
    fn from(shared: SharedSlice<T>) -> Self {
        SharedSlice::into_weak(shared)
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn elements_follow_the_header() {
        assert_eq!(SliceBlock::<u8>::ELEMENTS_OFFSET, mem::size_of::<Header>());
        assert_eq!(SliceBlock::<u128>::ELEMENTS_OFFSET % mem::align_of::<u128>(), 0);
        assert_eq!(
            SliceBlock::<u64>::layout(3).map(|l| l.size()),
            Some(SliceBlock::<u64>::ELEMENTS_OFFSET + 24)
        );
        assert!(SliceBlock::<u64>::layout(usize::MAX).is_none());
    }

    #[test]
    fn one_word() {
        assert_eq!(mem::size_of::<SharedSlice<u64>>(), mem::size_of::<usize>());
        assert_eq!(mem::size_of::<Option<WeakSlice<u64>>>(), mem::size_of::<usize>());
    }

    #[test]
    fn zero_sized_elements() {
        let units = SharedSlice::from_elem(5, ());
        assert_eq!(units.len(), 5);
        let empty = SharedSlice::<u32>::default();
        assert!(empty.is_empty());
    }
}

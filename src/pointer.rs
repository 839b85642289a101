use crate::control::Control;
use core::ptr::NonNull;

/// A reference-counted pointer that can be turned into, and rebuilt from, the address of its
/// control block.
///
/// This is what lets [`AtomicNarrow`](crate::AtomicNarrow) store the pointer in a single word.
/// Dropping a rebuilt pointer gives its unit back to the control block.
///
/// # Safety
///
/// 1. `into_control` must hand over exactly one reference unit, of the kind `Self` holds, on the
///    returned control block, and `from_control` must adopt one such unit.
/// 2. `from_control(into_control(p))` must behave exactly like `p`.
/// 3. `control(p)` must return the address `into_control(p)` would.
/// 4. `increment` must add one unit of the same kind to a live control block.
pub unsafe trait NarrowPointer: Sized {
    /// Give up ownership of `this`, keeping its reference unit alive.
    fn into_control(this: Self) -> NonNull<Control>;

    /// The control block of `this`.
    fn control(this: &Self) -> NonNull<Control>;

    /// Rebuild a pointer from a control block address.
    ///
    /// # Safety
    ///
    /// `control` must carry one reference unit of the kind `Self` holds, obtained from
    /// `into_control` or `increment` for this same pointer type, and the unit must not be used
    /// for anything else.
    unsafe fn from_control(control: NonNull<Control>) -> Self;

    /// Add one reference unit of the kind `Self` holds.
    ///
    /// # Safety
    ///
    /// `control` must be a live control block of this pointer type, on which the caller
    /// (transitively) holds a unit of the same kind.
    unsafe fn increment(control: NonNull<Control>);
}

/// A reference-counted pointer that can be split into, and rebuilt from, its control block and
/// value addresses.
///
/// Unlike a [`NarrowPointer`], the value address need not be derivable from the control block, so
/// a wide pointer can point anywhere the control block keeps alive.
///
/// # Safety
///
/// The requirements of [`NarrowPointer`] apply, with the value address carried alongside the
/// control block address.
pub unsafe trait WidePointer: Sized {
    /// The pointee.
    type Target;

    /// Give up ownership of `this`, keeping its reference unit alive.
    fn into_parts(this: Self) -> (NonNull<Control>, NonNull<Self::Target>);

    /// The control block and value addresses of `this`.
    fn parts(this: &Self) -> (NonNull<Control>, NonNull<Self::Target>);

    /// Rebuild a pointer from its parts.
    ///
    /// # Safety
    ///
    /// As for [`NarrowPointer::from_control`]; `value` must be the address that was paired with
    /// `control` when the unit was handed over.
    unsafe fn from_parts(control: NonNull<Control>, value: NonNull<Self::Target>) -> Self;

    /// Add one reference unit of the kind `Self` holds.
    ///
    /// # Safety
    ///
    /// As for [`NarrowPointer::increment`].
    unsafe fn increment(control: NonNull<Control>);
}

/// Ordering and equality by control block, rather than by pointee.
///
/// Two pointers have the same owner if they share a control block, whatever they point at and
/// whether they are shared or weak. `None` has no owner and orders before everything else.
pub trait Owner {
    /// The control block address, or null.
    fn owner(&self) -> *const Control;

    /// Whether `self`'s control block orders before `other`'s.
    fn owner_before<O: Owner + ?Sized>(&self, other: &O) -> bool {
        self.owner() < other.owner()
    }

    /// Whether `self` and `other` share a control block.
    fn owner_eq<O: Owner + ?Sized>(&self, other: &O) -> bool {
        core::ptr::eq(self.owner(), other.owner())
    }
}

impl<P: Owner> Owner for Option<P> {
    fn owner(&self) -> *const Control {
        self.as_ref().map_or(core::ptr::null(), P::owner)
    }
}

impl<P: Owner + ?Sized> Owner for &P {
    fn owner(&self) -> *const Control {
        P::owner(self)
    }
}

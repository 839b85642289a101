use core::ptr::NonNull;

/// Releases a value that a wide pointer adopted by raw address.
///
/// The deleter is stored in the control block next to the address, and runs exactly once, when
/// the last shared reference goes away. It is reachable from every thread holding a reference, so
/// it must be both `Send` and `Sync`.
///
/// Any `FnOnce(NonNull<T>)` closure is a deleter.
pub trait Deleter<T>: Send + Sync + 'static {
    /// Release `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must be the address this deleter was paired with, and must not be used afterwards.
    unsafe fn delete(self, ptr: NonNull<T>);
}

impl<T, F> Deleter<T> for F
where
    F: FnOnce(NonNull<T>) + Send + Sync + 'static,
{
    unsafe fn delete(self, ptr: NonNull<T>) {
        (self)(ptr)
    }
}

/// Ready-made deleters.
pub mod deleters {
    use super::Deleter;
    use alloc::boxed::Box;
    use core::ptr::NonNull;

    /// Frees a value allocated as a `Box<T>`.
    ///
    /// Can only be paired with addresses that came from [`Box::into_raw`].
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct DropBox;

    impl<T> Deleter<T> for DropBox {
        unsafe fn delete(self, ptr: NonNull<T>) {
            // Safety: the address came from Box::into_raw, by the pairing contract.
            drop(unsafe { Box::from_raw(ptr.as_ptr()) });
        }
    }

    /// Does nothing; for values the pointer does not own, such as statics.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct Leak;

    impl<T> Deleter<T> for Leak {
        unsafe fn delete(self, _: NonNull<T>) {}
    }
}

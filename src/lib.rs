//! Reference-counted pointers with a packed count, and atomic cells that hold them.
//!
//! Every managed value has a _control block_: a header with a single 64-bit counter and a pointer
//! to a table of type-erased operations. The counter holds two counts at once. The low half counts
//! the references that keep the value alive (shared references); the high half counts every
//! reference, shared or weak, that keeps the control block itself alive. A shared reference is
//! worth one unit of each, a weak reference one unit of the high half only, so every clone, drop,
//! promotion, and demotion is a single atomic update. The value is destroyed when the low half
//! reaches zero, and the block is freed when the high half does.
//!
//! There are two pointer shapes:
//!
//! - [`Shared`] and [`Weak`] are _narrow_: one word, the address of a control block allocated
//!   together with its value. [`SharedSlice`] and [`WeakSlice`] are the same for a run of
//!   elements, with the element count kept in the allocation.
//! - [`WideShared`] and [`WideWeak`] are _wide_: a control block address and a separate value
//!   address. They can adopt raw pointers along with a [`Deleter`], and can point at any part of
//!   a value the control block keeps alive.
//!
//! Each shape has an atomic cell, [`AtomicNarrow`] and [`AtomicWide`], that supports
//! `load`, `store`, `swap`, `compare_exchange`, and `wait`/`notify` with the usual memory orderings.
//! The cells steal the low bits of the control block address: bit 0 is a spinlock that every
//! operation holds for a few instructions, and bit 1 flips when a wide cell changes only its
//! value address, so that waiters see the change.
//!
//! Ownership always moves with the pointer. A pointer passed into a cell gives the cell its
//! reference; a pointer coming out of a cell carries a reference the caller now owns. Empty
//! pointers are `Option::None`.
//!
//! ```rust
//! use packrc::{AtomicShared, Shared};
//! use std::sync::atomic::Ordering;
//!
//! let cell = AtomicShared::new(Some(Shared::new(1)));
//!
//! let mut expected = cell.load(Ordering::Acquire);
//! let next = Shared::new(**expected.as_ref().unwrap() + 1);
//! assert!(cell
//!     .compare_exchange(&mut expected, Some(next), Ordering::AcqRel, Ordering::Acquire)
//!     .is_ok());
//!
//! assert_eq!(*cell.load(Ordering::Acquire).unwrap(), 2);
//! ```
//!
//! # Custom control blocks
//!
//! [`Control`] and [`Operations`] are public, so other pointer types can share the counting
//! protocol: put a `Control` first in a `#[repr(C)]` block, supply the operations, and implement
//! [`NarrowPointer`] or [`WidePointer`] to store the type in the atomic cells.
//!
//! # Limits
//!
//! The counter is an `AtomicU64` on every target, so the crate needs 64-bit atomics. Each half
//! is 32 bits. Going past [`MAX_REFCOUNT`] references to one control block aborts the process
//! (panics without `std`).
//!
//! # Features
//!
//! - `std` (default): waiters block in the OS via `parking_lot_core`, and lock contention yields
//!   the thread. Without it the crate is `no_std` (with `alloc`), and waiters spin.

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

mod atomic;
mod atomic_wide;
mod control;
mod deleter;
mod error;
mod lock;
mod narrow;
mod pointer;
mod slice;
mod sync;
mod wide;

pub use atomic::{AtomicNarrow, AtomicShared, AtomicSharedSlice, AtomicWeak, AtomicWeakSlice};
pub use atomic_wide::{AtomicWide, AtomicWideShared, AtomicWideWeak};
pub use control::{
    Control, Operations, CONTROL_ONE, MAX_REFCOUNT, SHARED_ONE, VALUE_ONE, WEAK_ONE,
};
pub use deleter::{deleters, Deleter};
pub use error::AllocError;
pub use narrow::{Shared, Weak};
pub use pointer::{NarrowPointer, Owner, WidePointer};
pub use slice::{SharedSlice, WeakSlice};
pub use wide::{WideShared, WideWeak};

/// ```compile_fail
/// use packrc::Shared;
/// use std::rc::Rc;
///
/// let x = Shared::new(Rc::new(1));
/// std::thread::spawn(move || drop(x));
/// ```
#[cfg(doctest)]
struct CannotSendNonSendValue;

/// ```compile_fail
/// use packrc::{AtomicShared, Shared};
/// use std::cell::Cell;
///
/// let cell = AtomicShared::new(Some(Shared::new(Cell::new(1))));
/// std::thread::scope(|s| {
///     s.spawn(|| cell.load(std::sync::atomic::Ordering::Acquire));
/// });
/// ```
#[cfg(doctest)]
struct CannotShareNonSyncValue;

/// ```compile_fail
/// use packrc::WideShared;
///
/// let outer = WideShared::new((1, 2));
/// let inner = {
///     let local = 5;
///     WideShared::map(outer, |_| &local)
/// };
/// ```
#[cfg(doctest)]
struct CannotProjectOutsideValue;

//! A pointer type built outside the crate on top of the public control block API.

use packrc::*;

use std::mem::ManuallyDrop;
use std::ptr::NonNull;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;

#[derive(Default, Clone)]
struct Tally {
    destroyed: Arc<AtomicUsize>,
    freed: Arc<AtomicUsize>,
}

#[repr(C)]
struct Node {
    control: Control,
    id: ManuallyDrop<usize>,
    tally: Tally,
}

static NODE_OPERATIONS: Operations = Operations {
    destroy: destroy_node,
    deallocate: deallocate_node,
    deleter: None,
};

unsafe fn destroy_node(control: NonNull<Control>) {
    let node = control.cast::<Node>().as_ptr();
    unsafe {
        ManuallyDrop::drop(&mut (*node).id);
        (*node).tally.destroyed.fetch_add(1, Ordering::SeqCst);
    }
}

unsafe fn deallocate_node(control: NonNull<Control>) {
    let node = unsafe { Box::from_raw(control.cast::<Node>().as_ptr()) };
    node.tally.freed.fetch_add(1, Ordering::SeqCst);
}

/// A shared handle to a `Node`.
struct Handle(NonNull<Control>);

unsafe impl Send for Handle {}
unsafe impl Sync for Handle {}

impl Handle {
    fn new(id: usize, tally: &Tally) -> Self {
        let node = Box::new(Node {
            control: Control::new_shared(&NODE_OPERATIONS),
            id: ManuallyDrop::new(id),
            tally: tally.clone(),
        });
        Handle(NonNull::from(Box::leak(node)).cast())
    }

    fn id(&self) -> usize {
        *unsafe { self.0.cast::<Node>().as_ref() }.id
    }

    fn use_count(&self) -> u32 {
        unsafe { self.0.as_ref() }.use_count()
    }
}

impl Clone for Handle {
    fn clone(&self) -> Self {
        unsafe { self.0.as_ref() }.shared_increment();
        Handle(self.0)
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        unsafe { Control::shared_decrement(self.0) };
    }
}

unsafe impl NarrowPointer for Handle {
    fn into_control(this: Self) -> NonNull<Control> {
        ManuallyDrop::new(this).0
    }

    fn control(this: &Self) -> NonNull<Control> {
        this.0
    }

    unsafe fn from_control(control: NonNull<Control>) -> Self {
        Handle(control)
    }

    unsafe fn increment(control: NonNull<Control>) {
        unsafe { control.as_ref() }.shared_increment();
    }
}

#[test]
fn custom_block_in_atomic_cell() {
    let tally = Tally::default();
    let cell = AtomicNarrow::new(Some(Handle::new(1, &tally)));

    let loaded = cell.load(Ordering::Acquire).expect("not null");
    assert_eq!(loaded.id(), 1);
    assert_eq!(loaded.use_count(), 2);

    cell.store(Some(Handle::new(2, &tally)), Ordering::Release);
    assert_eq!(tally.destroyed.load(Ordering::SeqCst), 0);
    drop(loaded);
    assert_eq!(tally.destroyed.load(Ordering::SeqCst), 1);
    assert_eq!(tally.freed.load(Ordering::SeqCst), 1);

    let mut expected = Some(Handle::new(3, &tally));
    let back = cell
        .compare_exchange(&mut expected, None, Ordering::AcqRel, Ordering::Acquire)
        .expect_err("cell holds 2");
    assert!(back.is_none());
    // The probe handle 3 was released when `expected` was overwritten.
    assert_eq!(tally.destroyed.load(Ordering::SeqCst), 2);
    assert_eq!(expected.as_ref().map(Handle::id), Some(2));

    drop(expected);
    drop(cell);
    assert_eq!(tally.destroyed.load(Ordering::SeqCst), 3);
    assert_eq!(tally.freed.load(Ordering::SeqCst), 3);
}

#[test]
fn weak_units_through_public_api() {
    let tally = Tally::default();
    let handle = Handle::new(7, &tally);
    let block = handle.0;

    unsafe { block.as_ref() }.weak_increment();
    assert_eq!(unsafe { block.as_ref() }.weak_count(), 1);
    assert!(unsafe { block.as_ref() }.try_promote());
    let promoted = Handle(block);
    assert_eq!(promoted.use_count(), 2);

    drop(promoted);
    drop(handle);
    assert_eq!(tally.destroyed.load(Ordering::SeqCst), 1);
    assert_eq!(tally.freed.load(Ordering::SeqCst), 0);

    assert!(!unsafe { block.as_ref() }.try_promote());
    unsafe { Control::weak_decrement(block) };
    assert_eq!(tally.freed.load(Ordering::SeqCst), 1);
}

#[test]
fn demote_through_public_api() {
    let tally = Tally::default();
    let handle = Handle::new(9, &tally);
    let block = NarrowPointer::into_control(handle);

    unsafe { Control::demote_value_unit(block) };
    assert_eq!(tally.destroyed.load(Ordering::SeqCst), 1);
    assert_eq!(unsafe { block.as_ref() }.use_count(), 0);
    assert_eq!(unsafe { block.as_ref() }.weak_count(), 1);

    unsafe { Control::weak_decrement(block) };
    assert_eq!(tally.freed.load(Ordering::SeqCst), 1);
}

#[test]
fn racing_last_shared_and_last_weak() {
    // The last shared and the last weak reference are dropped at the same time; the node must be
    // destroyed before it is freed, each exactly once.
    for _ in 0..200 {
        let tally = Tally::default();
        let handle = Handle::new(0, &tally);
        unsafe { handle.0.as_ref() }.weak_increment();
        let weak = SendPtr(handle.0);

        let t = thread::spawn(move || {
            let weak = weak;
            unsafe { Control::weak_decrement(weak.0) };
        });
        drop(handle);
        t.join().unwrap();

        assert_eq!(tally.destroyed.load(Ordering::SeqCst), 1);
        assert_eq!(tally.freed.load(Ordering::SeqCst), 1);
    }
}

struct SendPtr(NonNull<Control>);
unsafe impl Send for SendPtr {}

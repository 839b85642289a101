use packrc::*;

use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

struct CountDrops(Arc<AtomicUsize>);
impl CountDrops {
    pub fn new() -> Self {
        Self(Default::default())
    }

    pub fn counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.0)
    }
}
impl Drop for CountDrops {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn feels_good() {
    let drops_42 = CountDrops::new();
    let ndrops_42 = drops_42.counter();

    let x = Shared::new((42, drops_42));
    assert_eq!(x.0, 42);
    assert_eq!(Shared::use_count(&x), 1);
    assert_eq!(Shared::weak_count(&x), 0);

    let y = x.clone();
    assert!(Shared::ptr_eq(&x, &y));
    assert_eq!(Shared::use_count(&x), 2);

    drop(x);
    assert_eq!(ndrops_42.load(Ordering::SeqCst), 0);
    assert_eq!(y.0, 42);

    drop(y);
    assert_eq!(ndrops_42.load(Ordering::SeqCst), 1);
}

#[test]
fn atomic_load_and_drop_in_any_order() {
    // make X (1/1), store a clone into an atomic (2), load (3), drop all.
    for order in 0..6 {
        let drops = CountDrops::new();
        let ndrops = drops.counter();

        let x = Shared::new(drops);
        assert_eq!(Shared::use_count(&x), 1);
        let cell = AtomicShared::new(Some(x.clone()));
        assert_eq!(Shared::use_count(&x), 2);
        let loaded = cell.load(Ordering::SeqCst).expect("not null");
        assert_eq!(Shared::use_count(&x), 3);

        let mut x = Some(x);
        let mut cell = Some(cell);
        let mut loaded = Some(loaded);
        let mut droppers: [&mut dyn FnMut(); 3] = [
            &mut || drop(x.take()),
            &mut || drop(cell.take()),
            &mut || drop(loaded.take()),
        ];
        // All six permutations of three drops.
        let permutation = [[0, 1, 2], [0, 2, 1], [1, 0, 2], [1, 2, 0], [2, 0, 1], [2, 1, 0]];
        for (i, &step) in permutation[order].iter().enumerate() {
            assert_eq!(ndrops.load(Ordering::SeqCst), 0, "dropped early at step {i}");
            droppers[step]();
        }
        assert_eq!(ndrops.load(Ordering::SeqCst), 1);
    }
}

#[test]
fn weak_upgrade_after_last_shared() {
    let drops = CountDrops::new();
    let ndrops = drops.counter();

    let x = Shared::new(drops);
    let weak = Shared::downgrade(&x);
    assert_eq!(weak.use_count(), 1);
    assert_eq!(weak.weak_count(), 1);
    assert!(!weak.expired());

    let upgraded = weak.upgrade().expect("value alive");
    assert_eq!(Shared::use_count(&x), 2);
    drop(upgraded);

    drop(x);
    assert_eq!(ndrops.load(Ordering::SeqCst), 1);
    assert!(weak.upgrade().is_none());
    assert_eq!(weak.use_count(), 0);
    assert!(weak.expired());

    // Upgrade keeps failing; the value is never resurrected.
    let other = weak.clone();
    assert!(other.upgrade().is_none());
    assert_eq!(weak.weak_count(), 2);
}

#[test]
fn upgrade_fails_from_first_expiry_on() {
    // The last shared reference goes away while another thread keeps upgrading; once one upgrade
    // has failed, no later one may succeed.
    for _ in 0..500 {
        let drops = CountDrops::new();
        let ndrops = drops.counter();
        let x = Shared::new(drops);
        let weak = Shared::downgrade(&x);
        let barrier = Arc::new(std::sync::Barrier::new(2));

        let upgrader = {
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                barrier.wait();
                let mut expired = false;
                for _ in 0..200 {
                    match weak.upgrade() {
                        Some(alive) => {
                            assert!(!expired, "upgrade succeeded after the value expired");
                            assert_eq!(alive.0.load(Ordering::SeqCst), 0);
                        }
                        None => expired = true,
                    }
                }
                weak
            })
        };

        barrier.wait();
        drop(x);
        let weak = upgrader.join().unwrap();
        assert!(weak.upgrade().is_none());
        assert_eq!(ndrops.load(Ordering::SeqCst), 1);
    }
}

#[test]
fn into_weak_demotes() {
    let drops = CountDrops::new();
    let ndrops = drops.counter();

    let x = Shared::new(drops);
    let y = x.clone();
    let weak = Shared::into_weak(x);
    assert_eq!(weak.use_count(), 1);
    assert_eq!(weak.weak_count(), 1);
    assert_eq!(ndrops.load(Ordering::SeqCst), 0);

    let weak2: Weak<_> = y.into();
    assert_eq!(ndrops.load(Ordering::SeqCst), 1);
    assert!(weak.ptr_eq(&weak2));
    assert!(weak2.expired());
}

#[test]
fn cyclic() {
    struct Node {
        me: Weak<Node>,
        value: u32,
    }

    let node = Shared::new_cyclic(|me| {
        // Not yet upgradable while being built.
        assert!(me.upgrade().is_none());
        Node {
            me: me.clone(),
            value: 7,
        }
    });
    assert_eq!(Shared::use_count(&node), 1);
    assert_eq!(Shared::weak_count(&node), 1);

    let again = node.me.upgrade().expect("published");
    assert_eq!(again.value, 7);
    assert!(Shared::ptr_eq(&node, &again));
}

#[test]
fn cyclic_build_panics() {
    let escaped: Arc<Mutex<Option<Weak<u32>>>> = Default::default();
    let escaped2 = Arc::clone(&escaped);
    let result = std::panic::catch_unwind(move || {
        Shared::new_cyclic(|me: &Weak<u32>| {
            *escaped2.lock().unwrap() = Some(me.clone());
            panic!("build failed");
        })
    });
    assert!(result.is_err());

    let weak = escaped.lock().unwrap().take().expect("weak escaped");
    assert!(weak.expired());
    assert!(weak.upgrade().is_none());
    assert_eq!(weak.weak_count(), 1);
}

#[test]
fn owner_order() {
    let a = Shared::new(1);
    let b = Shared::new(1);
    let a_weak = Shared::downgrade(&a);
    let a_wide = WideShared::from(a.clone());

    assert!(a.owner_eq(&a_weak));
    assert!(a.owner_eq(&a_wide));
    assert!(!a.owner_eq(&b));
    assert_ne!(a.owner_before(&b), b.owner_before(&a));
    assert!(!a.owner_before(&a_weak));

    let none: Option<Shared<i32>> = None;
    assert!(none.owner_before(&a));
    assert!(!a.owner_before(&none));
    assert!(none.owner_eq(&None::<Weak<i32>>));

    // Same values, different owners: equality is by value.
    assert_eq!(a, b);
}

#[test]
fn delegates_to_value() {
    use std::collections::HashSet;

    let a = Shared::new(String::from("a"));
    assert_eq!(format!("{a}"), "a");
    assert_eq!(format!("{a:?}"), "\"a\"");
    assert_eq!(format!("{a:p}"), format!("{:p}", Shared::as_ptr(&a)));
    assert!(Shared::new(String::from("b")) > a);

    let mut set = HashSet::new();
    set.insert(a.clone());
    assert!(set.contains(&String::from("a")));
    assert_eq!(format!("{:?}", Shared::downgrade(&a)), "(Weak)");
}

#[test]
fn shared_across_threads() {
    let drops = CountDrops::new();
    let ndrops = drops.counter();
    let x = Shared::new(drops);
    let weak = Shared::downgrade(&x);

    let threads: Vec<_> = (0..8)
        .map(|i| {
            let x = x.clone();
            let weak = weak.clone();
            std::thread::spawn(move || {
                for _ in 0..1_000 {
                    let y = x.clone();
                    let w = Shared::downgrade(&y);
                    if i % 2 == 0 {
                        drop(Shared::into_weak(y));
                    }
                    assert!(w.upgrade().is_some());
                    assert!(weak.upgrade().is_some());
                }
            })
        })
        .collect();
    for thread in threads {
        thread.join().unwrap();
    }

    assert_eq!(Shared::use_count(&x), 1);
    assert_eq!(Shared::weak_count(&x), 1);
    drop(x);
    assert_eq!(ndrops.load(Ordering::SeqCst), 1);
    assert!(weak.upgrade().is_none());
}

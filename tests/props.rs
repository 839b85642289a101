use packrc::*;

use proptest::collection::vec;
use proptest::prelude::*;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::Arc;

const SLOTS: usize = 4;

struct CountDrops(Arc<AtomicUsize>);
impl Drop for CountDrops {
    fn drop(&mut self) {
        self.0.fetch_add(1, SeqCst);
    }
}

struct Obj {
    id: usize,
    _drops: CountDrops,
}

#[derive(Debug, Clone)]
enum Op {
    New(usize),
    Clone(usize, usize),
    Drop(usize),
    Store(usize),
    Load(usize),
    Swap(usize),
    CompareExchange(usize, usize),
    Downgrade(usize, usize),
    Upgrade(usize, usize),
    Demote(usize, usize),
    DropWeak(usize),
}

fn op() -> impl Strategy<Value = Op> {
    let slot = || 0..SLOTS;
    prop_oneof![
        slot().prop_map(Op::New),
        (slot(), slot()).prop_map(|(a, b)| Op::Clone(a, b)),
        slot().prop_map(Op::Drop),
        slot().prop_map(Op::Store),
        slot().prop_map(Op::Load),
        slot().prop_map(Op::Swap),
        (slot(), slot()).prop_map(|(a, b)| Op::CompareExchange(a, b)),
        (slot(), slot()).prop_map(|(a, b)| Op::Downgrade(a, b)),
        (slot(), slot()).prop_map(|(a, b)| Op::Upgrade(a, b)),
        (slot(), slot()).prop_map(|(a, b)| Op::Demote(a, b)),
        slot().prop_map(Op::DropWeak),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    // Property: every object is dropped exactly once, and never while a shared holder is live.
    #[test]
    fn prop_balance(ops in vec(op(), 0..64)) {
        let mut counters: Vec<Arc<AtomicUsize>> = Vec::new();
        let mut slots: [Option<Shared<Obj>>; SLOTS] = Default::default();
        let mut weaks: [Option<Weak<Obj>>; SLOTS] = Default::default();
        let cell = AtomicShared::<Obj>::null();

        for op in ops {
            match op {
                Op::New(s) => {
                    let counter = Arc::new(AtomicUsize::new(0));
                    let id = counters.len();
                    counters.push(Arc::clone(&counter));
                    slots[s] = Some(Shared::new(Obj { id, _drops: CountDrops(counter) }));
                }
                Op::Clone(a, b) => slots[b] = slots[a].clone(),
                Op::Drop(s) => slots[s] = None,
                Op::Store(s) => cell.store(slots[s].clone(), SeqCst),
                Op::Load(s) => slots[s] = cell.load(SeqCst),
                Op::Swap(s) => {
                    let previous = cell.swap(slots[s].take(), SeqCst);
                    slots[s] = previous;
                }
                Op::CompareExchange(e, d) => {
                    let matches = cell.load(SeqCst).owner_eq(&slots[e]);
                    let mut expected = slots[e].clone();
                    let result = cell.compare_exchange(&mut expected, slots[d].clone(), SeqCst, SeqCst);
                    prop_assert_eq!(result.is_ok(), matches);
                    if result.is_err() {
                        prop_assert!(cell.load(SeqCst).owner_eq(&expected));
                    }
                    slots[e] = expected;
                }
                Op::Downgrade(s, w) => weaks[w] = slots[s].as_ref().map(Shared::downgrade),
                Op::Upgrade(w, s) => {
                    let alive = weaks[w].as_ref().map_or(false, |weak| !weak.expired());
                    slots[s] = weaks[w].as_ref().and_then(Weak::upgrade);
                    prop_assert_eq!(slots[s].is_some(), alive);
                }
                Op::Demote(s, w) => {
                    if let Some(shared) = slots[s].take() {
                        weaks[w] = Some(Shared::into_weak(shared));
                    }
                }
                Op::DropWeak(w) => weaks[w] = None,
            }

            for held in slots.iter().flatten() {
                prop_assert_eq!(counters[held.id].load(SeqCst), 0);
            }
            if let Some(held) = cell.load(SeqCst) {
                prop_assert_eq!(counters[held.id].load(SeqCst), 0);
            }
            for counter in &counters {
                prop_assert!(counter.load(SeqCst) <= 1);
            }
        }

        drop(slots);
        drop(weaks);
        drop(cell);
        for counter in &counters {
            prop_assert_eq!(counter.load(SeqCst), 1);
        }
    }
}

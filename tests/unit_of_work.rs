//! End-to-end unit-of-work scenarios through the container

use scoped_disposal::prelude::*;
use scoped_disposal::{ActivationExpression, CleanupDelegate};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Barrier, Mutex};

/// Records every dispose call by instance id
#[derive(Default)]
struct Ledger {
    disposed: Mutex<Vec<u64>>,
    next: AtomicUsize,
}

impl Ledger {
    fn count(&self, id: u64) -> usize {
        self.disposed.lock().unwrap().iter().filter(|d| **d == id).count()
    }

    fn total(&self) -> usize {
        self.disposed.lock().unwrap().len()
    }
}

struct Tracked {
    id: u64,
    ledger: Arc<Ledger>,
}

impl Disposable for Tracked {
    fn dispose(&self) {
        self.ledger.disposed.lock().unwrap().push(self.id);
    }
}

fn container_with_ledger() -> (Container, Arc<Ledger>) {
    let ledger = Arc::new(Ledger::default());
    let container = Container::new();
    let factory_ledger = Arc::clone(&ledger);
    container.register(move || Tracked {
        id: factory_ledger.next.fetch_add(1, Ordering::SeqCst) as u64,
        ledger: Arc::clone(&factory_ledger),
    });
    (container, ledger)
}

#[test]
fn test_two_activations_released_once_each() {
    let (container, ledger) = container_with_ledger();

    // Unit of work A
    let a = container.begin_unit_of_work();
    let x = container.activate::<Tracked>(Some(&a)).unwrap();
    let y = container.activate::<Tracked>(Some(&a)).unwrap();

    let scope_a = container.resolver().cached(&a).unwrap();
    assert_eq!(scope_a.len(), 2);
    assert_eq!(a.len(), 1);

    a.end();
    assert_eq!(ledger.count(x.id), 1);
    assert_eq!(ledger.count(y.id), 1);
    assert_eq!(ledger.total(), 2);

    // Unit of work B starts fresh
    let b = container.begin_unit_of_work();
    let scope_b = container
        .resolver()
        .resolve(Arc::clone(container.disposal_scope()), Some(&b))
        .unwrap();
    assert_ne!(scope_a.id(), scope_b.id());
    assert!(scope_b.is_empty());
    assert!(!scope_b.is_released());

    b.end();
    assert_eq!(ledger.total(), 2);
}

#[test]
fn test_concurrent_activations_share_one_scope() {
    const THREADS: usize = 32;

    let (container, ledger) = container_with_ledger();
    let request = container.begin_unit_of_work();
    let barrier = Barrier::new(THREADS);

    std::thread::scope(|s| {
        for _ in 0..THREADS {
            s.spawn(|| {
                barrier.wait();
                container.activate::<Tracked>(Some(&request)).unwrap();
            });
        }
    });

    assert_eq!(request.len(), 1);
    let scope = container.resolver().cached(&request).unwrap();
    assert_eq!(scope.kind(), ScopeKind::Request);
    assert_eq!(scope.len(), THREADS);
    assert!(container.disposal_scope().is_empty());

    request.end();
    assert_eq!(ledger.total(), THREADS);
    for id in 0..THREADS as u64 {
        assert_eq!(ledger.count(id), 1);
    }
}

#[test]
fn test_parallel_units_of_work_are_isolated() {
    const REQUESTS: usize = 8;
    const PER_REQUEST: usize = 5;

    let (container, ledger) = container_with_ledger();

    let scope_ids: Vec<_> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..REQUESTS)
            .map(|_| {
                s.spawn(|| {
                    let request = container.begin_unit_of_work();
                    for _ in 0..PER_REQUEST {
                        container.activate::<Tracked>(Some(&request)).unwrap();
                    }
                    let scope = container.resolver().cached(&request).unwrap();
                    assert_eq!(scope.len(), PER_REQUEST);
                    request.end();
                    scope.id()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let mut unique = scope_ids.clone();
    unique.sort_by_key(|id| id.id());
    unique.dedup();
    assert_eq!(unique.len(), REQUESTS);
    assert_eq!(ledger.total(), REQUESTS * PER_REQUEST);
}

#[test]
fn test_mismatched_delegate_is_not_an_error() {
    struct Other;

    let ledger = Arc::new(Ledger::default());
    let wrong_shape_calls = Arc::new(AtomicUsize::new(0));

    let container = Container::new();
    let calls_in = Arc::clone(&wrong_shape_calls);
    let factory_ledger = Arc::clone(&ledger);
    container.configure(
        ActivationConfiguration::new::<Tracked>().with_disposal_delegate(CleanupDelegate::new(
            move |_o: &Other| {
                calls_in.fetch_add(1, Ordering::SeqCst);
            },
        )),
        ActivationExpression::from_fn(move || Tracked {
            id: 99,
            ledger: Arc::clone(&factory_ledger),
        }),
    );

    let request = container.begin_unit_of_work();
    container.activate::<Tracked>(Some(&request)).unwrap();
    request.end();

    assert_eq!(wrong_shape_calls.load(Ordering::SeqCst), 0);
    assert_eq!(ledger.count(99), 1);
}

#[test]
fn test_release_without_unit_of_work_is_noop() {
    let (container, ledger) = container_with_ledger();
    container.activate::<Tracked>(None).unwrap();

    container.resolver().release_ambient(None);
    assert_eq!(ledger.total(), 0);

    container.dispose();
    assert_eq!(ledger.total(), 1);
}

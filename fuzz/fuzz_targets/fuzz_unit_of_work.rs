#![no_main]

//! Fuzz target for unit-of-work lifecycles
//!
//! Drives random activations, request ends, child containers and disposals,
//! then checks that every activated instance was released exactly once.

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use scoped_disposal::{Container, Disposable, DisposalError, UnitOfWork};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct Tally {
    created: AtomicU32,
    rejected: AtomicU32,
    released: Mutex<Vec<u32>>,
}

struct Plain {
    id: u32,
    tally: Arc<Tally>,
}

impl Disposable for Plain {
    fn dispose(&self) {
        self.tally.released.lock().unwrap().push(self.id);
    }
}

struct WithCleanup {
    id: u32,
    tally: Arc<Tally>,
}

impl Disposable for WithCleanup {
    fn dispose(&self) {
        panic!("cleanup delegate must replace dispose");
    }
}

#[derive(Debug, Arbitrary)]
enum Op {
    BeginRequest,
    EndRequest(u8),
    ActivatePlain(Option<u8>),
    ActivateWithCleanup(Option<u8>),
    ActivateInChild(Option<u8>),
    OpenChild,
    DisposeChild,
}

fuzz_target!(|ops: Vec<Op>| {
    let tally = Arc::new(Tally::default());

    let container = Container::new();
    let plain_tally = Arc::clone(&tally);
    container.register(move || Plain {
        id: plain_tally.created.fetch_add(1, Ordering::SeqCst),
        tally: Arc::clone(&plain_tally),
    });
    let cleanup_tally = Arc::clone(&tally);
    container.register_with_cleanup(
        move || WithCleanup {
            id: cleanup_tally.created.fetch_add(1, Ordering::SeqCst),
            tally: Arc::clone(&cleanup_tally),
        },
        |instance: &WithCleanup| instance.tally.released.lock().unwrap().push(instance.id),
    );

    let mut requests: Vec<UnitOfWork> = Vec::new();
    let mut child: Option<Container> = None;

    let pick = |requests: &[UnitOfWork], index: Option<u8>| -> Option<UnitOfWork> {
        let index = index? as usize;
        if requests.is_empty() {
            None
        } else {
            Some(requests[index % requests.len()].clone())
        }
    };

    for op in ops.into_iter().take(200) {
        match op {
            Op::BeginRequest => {
                if requests.len() < 8 {
                    requests.push(container.begin_unit_of_work());
                }
            }
            Op::EndRequest(index) => {
                if !requests.is_empty() {
                    let request = requests.remove(index as usize % requests.len());
                    request.end();
                    // Ending twice is harmless
                    request.end();
                }
            }
            Op::ActivatePlain(index) => {
                let request = pick(&requests, index);
                container
                    .activate::<Plain>(request.as_ref())
                    .expect("open unit of work accepts activations");
            }
            Op::ActivateWithCleanup(index) => {
                let request = pick(&requests, index);
                container
                    .activate::<WithCleanup>(request.as_ref())
                    .expect("open unit of work accepts activations");
            }
            Op::ActivateInChild(index) => {
                if let Some(ref c) = child {
                    let request = pick(&requests, index);
                    c.activate::<Plain>(request.as_ref())
                        .expect("live child accepts activations");
                }
            }
            Op::OpenChild => {
                if let Some(old) = child.replace(container.scope()) {
                    old.dispose();
                }
            }
            Op::DisposeChild => {
                if let Some(c) = child.take() {
                    c.dispose();
                    // A released scope rejects new instances
                    let rejected = c.activate::<Plain>(None).err();
                    assert!(matches!(rejected, Some(DisposalError::ScopeReleased { .. })));
                    tally.rejected.fetch_add(1, Ordering::SeqCst);
                }
            }
        }
    }

    for request in requests {
        request.end();
    }
    if let Some(c) = child {
        c.dispose();
    }
    container.dispose();

    let created = tally.created.load(Ordering::SeqCst);
    let rejected = tally.rejected.load(Ordering::SeqCst);
    let mut released = tally.released.lock().unwrap().clone();
    released.sort_unstable();
    released.dedup();
    assert_eq!(released.len(), tally.released.lock().unwrap().len());
    assert_eq!(released.len() as u32 + rejected, created);
});

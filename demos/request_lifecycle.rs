//! A simulated request pipeline
//!
//! Each request activates services through the root container. The services
//! are released when the request ends, while singletons activated outside a
//! request live until the container is disposed.
//!
//! ```bash
//! cargo run --example request_lifecycle
//! ```

use scoped_disposal::{Container, Disposable};
use std::sync::atomic::{AtomicU32, Ordering};

static NEXT_ID: AtomicU32 = AtomicU32::new(1);

struct DbConnection {
    id: u32,
}

impl DbConnection {
    fn open() -> Self {
        let id = NEXT_ID.fetch_add(1, Ordering::SeqCst);
        println!("  [db] open connection #{id}");
        Self { id }
    }

    fn return_to_pool(&self) {
        println!("  [db] connection #{} returned to pool", self.id);
    }
}

impl Disposable for DbConnection {
    fn dispose(&self) {
        println!("  [db] close connection #{}", self.id);
    }
}

struct AuditLog;

impl Disposable for AuditLog {
    fn dispose(&self) {
        println!("  [audit] flushed");
    }
}

struct Metrics;

impl Disposable for Metrics {
    fn dispose(&self) {
        println!("  [metrics] reporter stopped");
    }
}

fn main() {
    let container = Container::new();
    container.register_with_cleanup(DbConnection::open, DbConnection::return_to_pool);
    container.register(|| AuditLog);
    container.register(|| Metrics);

    println!("=== Startup ===");
    let _metrics = container
        .activate::<Metrics>(None)
        .expect("metrics registered");

    for request_id in 1..=2 {
        println!("\n=== Request {request_id} ===");
        let request = container.begin_unit_of_work();

        let _audit = container
            .activate::<AuditLog>(Some(&request))
            .expect("audit registered");
        let _first = container
            .activate::<DbConnection>(Some(&request))
            .expect("db registered");
        let _second = container
            .activate::<DbConnection>(Some(&request))
            .expect("db registered");

        if let Some(scope) = container.resolver().cached(&request) {
            println!("  request scope {} owns {} instances", scope.id(), scope.len());
        }

        println!("--- end of request {request_id} ---");
        request.end();
    }

    println!("\n=== Shutdown ===");
    println!(
        "  container scope owns {} instances",
        container.disposal_scope().len()
    );
    container.dispose();
}

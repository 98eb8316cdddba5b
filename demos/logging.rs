//! Example demonstrating logging capabilities
//!
//! Run with JSON logging (production):
//! ```bash
//! cargo run --example logging --features logging-json
//! ```
//!
//! Run with pretty logging (development):
//! ```bash
//! cargo run --example logging --features logging-pretty
//! ```

use scoped_disposal::{ActivationConfiguration, ActivationExpression, CleanupDelegate, Container, Disposable};

struct Database;

impl Disposable for Database {
    fn dispose(&self) {
        println!("  [App] Database disposed");
    }
}

struct Cache;

impl Disposable for Cache {
    fn dispose(&self) {
        println!("  [App] Cache disposed");
    }
}

struct Unrelated;

fn main() {
    // JSON if logging-json is enabled, pretty if logging-pretty is enabled
    scoped_disposal::logging::builder()
        .trace()
        .scoped_disposal_only()
        .init();

    println!("=== Scoped Disposal Logging Demo ===\n");

    // Logs: "Creating new root container"
    let container = Container::new();

    // Logs: "Registering activation"
    container.register(|| Database);

    // A delegate whose parameter does not match the activated type.
    // Logs a warning at compile time and falls back to `dispose`.
    container.configure(
        ActivationConfiguration::new::<Cache>()
            .with_disposal_delegate(CleanupDelegate::new(|_: &Unrelated| {})),
        ActivationExpression::from_fn(|| Cache),
    );

    println!("\n--- Activation outside a request ---");
    let _db = container.activate::<Database>(None);

    println!("\n--- Request ---");
    let request = container.begin_unit_of_work();
    // Logs: "Created ambient disposal scope" once, then registrations
    let _ = container.activate::<Database>(Some(&request));
    let _ = container.activate::<Cache>(Some(&request));

    // Logs: "Releasing ambient disposal scope"
    request.end();

    println!("\n--- Shutdown ---");
    container.dispose();

    println!("\n=== Demo Complete ===");
}

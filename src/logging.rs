//! One-shot `tracing` initialization, factored out of `main` the same way
//! the teacher's `main.rs` wires `tracing_subscriber` before doing anything
//! else.

use tracing::Level;
use tracing_subscriber::EnvFilter;

pub fn init() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .init();
}

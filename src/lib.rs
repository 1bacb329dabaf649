pub mod api;
pub mod behaviour;
pub mod cli;
pub mod compiler;
pub mod config;
pub mod diagnostics;
pub mod ecs;
pub mod events;
pub mod lifecycle;
pub mod reflect;
pub mod registry;
pub mod runtime;
pub mod time;
pub mod watcher;

pub use runtime::{ReloadOutcome, ReloadReport, ScriptRuntime};

/// Installs the `tracing` subscriber used by the binaries. `RUST_LOG` overrides `default_filter`.
pub fn init_tracing(default_filter: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_target(false).try_init();
}

#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod config;
mod deferred;
mod engine;
mod error;
mod hooks;
mod loader;
#[cfg(test)]
mod testing;
mod unit;

pub use crate::config::{CyclePolicy, LoaderConfig};
pub use crate::deferred::Deferred;
pub use crate::engine::{Diagnostics, UnitReport};
pub use crate::error::{HookError, LoaderError, Stage};
pub use crate::hooks::{
    Executor, HookFuture, Hooks, Import, Instantiation, LoadInfo, Metadata, Request,
};
pub use crate::loader::{LoadOptions, Loader};
pub use crate::unit::{Unit, UnitStatus};

/// Installs a `tracing` subscriber printing to stderr, filtered by
/// `RUST_LOG` (default `info`).
#[cfg(feature = "logging")]
pub fn init_logging() -> anyhow::Result<()> {
    use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let formatter = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);

    tracing_subscriber::registry()
        .with(formatter)
        .with(filter)
        .try_init()?;

    Ok(())
}

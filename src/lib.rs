//! Task graph execution with incremental, content-addressed up-to-date
//! checks.
//!
//! Declare tasks with a [`Blueprint`], or assemble [`TaskNode`]s into a
//! [`TaskGraph`] by hand, then hand the graph to an [`Engine`]. Every task
//! that declares its inputs and outputs is skipped when neither changed since
//! its last successful run.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use kiln::{Blueprint, Engine, Settings, StatusLine};
//!
//! let mut blueprint = Blueprint::new();
//! blueprint
//!     .task("compile")
//!     .input_dir("sources", "src")
//!     .output_file("binary", "build/app")
//!     .run(|| Ok(()));
//!
//! let graph = blueprint.finish()?;
//! let engine = Engine::new(Settings::default().workers(4))
//!     .with_reporter(Arc::new(StatusLine::new()));
//!
//! let result = engine.run(&graph, &["compile"])?;
//! assert!(result.is_success());
//! # Ok::<(), anyhow::Error>(())
//! ```
#![forbid(unsafe_code)]

mod blueprint;
mod core;
pub mod engine;
mod error;
pub mod fingerprint;
mod graph;
pub mod module;
pub mod report;
pub mod store;
mod task;

pub use crate::blueprint::{Blueprint, TaskBuilder};
pub use crate::core::{FailurePolicy, Hash32, Settings, TaskId};
pub use crate::engine::{BuildResult, Counts, Engine, RunPhase, Summary, TaskExecution};
pub use crate::error::*;
pub use crate::graph::{ReadySet, States, TaskGraph};
pub use crate::report::{Fanout, ProgressBar, Recorder, Reporter, StatusLine};
pub use crate::store::{DiskPersistence, FingerprintStore, MemoryPersistence, Persistence};
pub use crate::task::{Collections, Location, Outcome, TaskNode, TaskResult, TaskState};

/// Installs a global `tracing` subscriber: an fmt layer filtered by
/// `RUST_LOG` (default `info`) and an `IndicatifLayer` rendering the
/// progress bars of running tasks.
#[cfg(feature = "logging")]
pub fn init_logging() -> anyhow::Result<()> {
    use tracing_indicatif::IndicatifLayer;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::{EnvFilter, fmt};

    let indicatif = IndicatifLayer::new();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(indicatif.get_stderr_writer()))
        .with(indicatif)
        .try_init()?;

    Ok(())
}

//! gridlet: worker-side execution engine for pipe-dispatched distributed tasks.

mod context;
mod registry;
mod serializer;
mod value;

pub mod cache;
pub mod executor;
pub mod resolver;
pub mod slot;
pub mod supervisor;
pub mod tracker;
pub mod wire;

pub use context::{ContextError, ContextPhase, ExecutionContext};

pub use registry::{
    ParamDirection, RegisteredTask, TaskFailure, TaskFn, TaskFuture, TaskRegistry,
};

pub use cache::{CacheConfig, CacheError, CacheHandle, CacheHit, ObjectCache, ProfilingReport};
pub use executor::{TaskError, TaskExecutor};
pub use resolver::{AccessMode, BackingResolver, FileResolver, Resolution, ResolveError};
pub use serializer::{JsonSerializer, SerializeError, Serializer};
pub use slot::WorkerSlot;
pub use supervisor::{SupervisorConfig, SupervisorError, SupervisorState, WorkerSupervisor};
pub use tracker::{ObjectId, ObjectTracker, SyncError, SyncMode, TrackerConsistencyError};
pub use value::RuntimeValue;

/// Install the process-wide tracing subscriber for an embedding worker
/// binary. Filtering follows the usual env-filter conventions; defaults to
/// `info` when the environment says nothing.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}

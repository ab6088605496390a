//! Worker process supervisor.
//!
//! Owns the lifecycle of N worker slots and the optional cache component.
//! Slots execute independently; the supervisor imposes no ordering between
//! them beyond what the master's dispatch stream implies by which slot's
//! inbound pipe a message lands on.
//!
//! State machine: Stopped → Starting (pipes created, cache launched) →
//! Running (slots accepting dispatches) → Draining (no new dispatches,
//! in-flight work finishes) → Stopped.

use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cache::{CacheConfig, CacheHandle, ObjectCache};
use crate::context::{ContextError, ExecutionContext};
use crate::executor::TaskExecutor;
use crate::registry::TaskRegistry;
use crate::resolver::{BackingResolver, FileResolver};
use crate::serializer::{JsonSerializer, Serializer};
use crate::slot::WorkerSlot;
use crate::tracker::ObjectTracker;
use crate::wire::channel::{ChannelError, PipeChannel, PipePair};
use crate::wire::codec::WireError;
use crate::wire::protocol::{InboundMessage, OutboundMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Stopped,
    Starting,
    Running,
    Draining,
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Context(#[from] ContextError),

    #[error("failed to create pipe directory {path}: {source}")]
    PipeDir {
        path: PathBuf,
        source: std::io::Error,
    },
}

pub struct SupervisorConfig {
    num_slots: usize,
    pipe_dir: PathBuf,
    cache: Option<CacheConfig>,
    registry: Arc<TaskRegistry>,
    serializer: Arc<dyn Serializer>,
    resolver: Arc<dyn BackingResolver>,
    context: Arc<ExecutionContext>,
}

impl SupervisorConfig {
    pub fn new(registry: Arc<TaskRegistry>) -> Self {
        let pipe_dir = std::env::temp_dir().join(format!("gridlet-{}", std::process::id()));
        Self {
            num_slots: 1,
            pipe_dir: pipe_dir.clone(),
            cache: None,
            registry,
            serializer: Arc::new(JsonSerializer),
            resolver: Arc::new(FileResolver::new()),
            context: Arc::new(ExecutionContext::new("worker", pipe_dir)),
        }
    }

    pub fn with_num_slots(mut self, n: usize) -> Self {
        self.num_slots = n;
        self
    }

    pub fn with_pipe_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.pipe_dir = dir.into();
        self
    }

    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_serializer(mut self, serializer: Arc<dyn Serializer>) -> Self {
        self.serializer = serializer;
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn BackingResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_context(mut self, context: Arc<ExecutionContext>) -> Self {
        self.context = context;
        self
    }
}

#[derive(Debug)]
pub struct WorkerSupervisor {
    state: Arc<StdMutex<SupervisorState>>,
    cancel: CancellationToken,
    slots: Vec<JoinHandle<()>>,
    control: Option<JoinHandle<()>>,
    cache: Option<(CacheHandle, JoinHandle<()>)>,
    pairs: Vec<PipePair>,
    control_pair: PipePair,
    pipe_dir: PathBuf,
    context: Arc<ExecutionContext>,
}

/// Control-pipe loop: a QUIT here stops everything. PING is answered;
/// dispatches do not belong on this pipe and are dropped with a warning.
async fn run_control_loop(mut channel: PipeChannel, cancel: CancellationToken) {
    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            message = channel.next_message() => {
                match message {
                    Some(Ok(InboundMessage::Quit)) => {
                        tracing::info!("quit received on control pipe, draining all slots");
                        cancel.cancel();
                        break;
                    }
                    Some(Ok(InboundMessage::Ping)) => {
                        if let Err(e) = channel.send(OutboundMessage::Pong).await {
                            tracing::error!(error = %e, "failed to answer control ping");
                            break;
                        }
                    }
                    Some(Ok(InboundMessage::Execute(request))) => {
                        tracing::warn!(
                            request_id = request.request_id,
                            "dispatch arrived on control pipe, dropping"
                        );
                    }
                    Some(Err(WireError::Protocol(e))) => {
                        tracing::warn!(error = %e, "malformed control line, skipping");
                    }
                    Some(Err(e)) => {
                        tracing::error!(error = %e, "control channel failure");
                        break;
                    }
                    None => break,
                }
            }
        }
    }
    channel.close();
}

impl WorkerSupervisor {
    /// Create pipe pairs, launch the cache component if configured, and
    /// spawn one slot task per pair.
    pub async fn start(config: SupervisorConfig) -> Result<Self, SupervisorError> {
        let SupervisorConfig {
            num_slots,
            pipe_dir,
            cache,
            registry,
            serializer,
            resolver,
            context,
        } = config;

        context.activate()?;
        let state = Arc::new(StdMutex::new(SupervisorState::Starting));
        tracing::info!(num_slots, pipe_dir = %pipe_dir.display(), "supervisor starting");

        std::fs::create_dir_all(&pipe_dir).map_err(|e| SupervisorError::PipeDir {
            path: pipe_dir.clone(),
            source: e,
        })?;

        let cache = cache.map(ObjectCache::spawn);
        let cache_handle = cache.as_ref().map(|(handle, _)| handle.clone());

        let cancel = CancellationToken::new();
        let mut slots = Vec::with_capacity(num_slots);
        let mut pairs: Vec<PipePair> = Vec::with_capacity(num_slots);

        for slot_id in 0..num_slots {
            let pair = PipePair::in_dir(&pipe_dir, slot_id);

            let tracker = Arc::new(ObjectTracker::new(
                Arc::clone(&resolver),
                Arc::clone(&serializer),
            ));
            let executor = Arc::new(TaskExecutor::new(
                Arc::clone(&registry),
                tracker,
                cache_handle.clone(),
                Arc::clone(&resolver),
                Arc::clone(&serializer),
                Arc::clone(&context),
            ));

            let slot = match WorkerSlot::open(slot_id, pair.clone(), executor, cancel.child_token())
            {
                Ok(slot) => slot,
                Err(e) => {
                    tracing::error!(slot = slot_id, error = %e, "slot startup failed");
                    cancel.cancel();
                    for handle in slots {
                        let _ = handle.await;
                    }
                    for created in &pairs {
                        created.unlink();
                    }
                    if let Some((handle, join)) = cache {
                        handle.quit().await;
                        let _ = join.await;
                    }
                    return Err(e.into());
                }
            };

            slots.push(tokio::spawn(slot.run()));
            pairs.push(pair);
        }

        let control_pair = PipePair::control(&pipe_dir);
        let control = match PipeChannel::open(control_pair.clone()) {
            Ok(channel) => tokio::spawn(run_control_loop(channel, cancel.clone())),
            Err(e) => {
                tracing::error!(error = %e, "control pipe startup failed");
                cancel.cancel();
                for handle in slots {
                    let _ = handle.await;
                }
                for created in &pairs {
                    created.unlink();
                }
                if let Some((handle, join)) = cache {
                    handle.quit().await;
                    let _ = join.await;
                }
                return Err(e.into());
            }
        };

        *state.lock().expect("supervisor state lock poisoned") = SupervisorState::Running;
        tracing::info!(num_slots, "supervisor running");

        Ok(Self {
            state,
            cancel,
            slots,
            control: Some(control),
            cache,
            pairs,
            control_pair,
            pipe_dir,
            context,
        })
    }

    /// Resolves once a drain has been requested: a QUIT on the control pipe
    /// or a local `shutdown` call. Embedders typically await this, then call
    /// [`WorkerSupervisor::shutdown`].
    pub async fn quiesced(&self) {
        self.cancel.cancelled().await;
    }

    /// The supervisor's dedicated control pipe pair.
    pub fn control_pair(&self) -> &PipePair {
        &self.control_pair
    }

    pub fn state(&self) -> SupervisorState {
        *self.state.lock().expect("supervisor state lock poisoned")
    }

    /// Pipe pairs in slot order, for the master side to attach to.
    pub fn pipe_pairs(&self) -> &[PipePair] {
        &self.pairs
    }

    pub fn cache_handle(&self) -> Option<CacheHandle> {
        self.cache.as_ref().map(|(handle, _)| handle.clone())
    }

    /// Drain every slot, stop the cache component, and release the pipes.
    ///
    /// In-flight dispatches finish; no new ones are accepted.
    pub async fn shutdown(mut self) -> Result<(), SupervisorError> {
        *self.state.lock().expect("supervisor state lock poisoned") = SupervisorState::Draining;
        tracing::info!("supervisor draining");

        self.cancel.cancel();
        for handle in self.slots.drain(..) {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "slot task panicked");
            }
        }
        if let Some(control) = self.control.take()
            && let Err(e) = control.await
        {
            tracing::error!(error = %e, "control task panicked");
        }

        if let Some((handle, join)) = self.cache.take() {
            handle.quit().await;
            if let Err(e) = join.await {
                tracing::error!(error = %e, "cache task panicked");
            }
        }

        // Slots unlink their own pipes on close; drop the directory itself.
        if let Err(e) = std::fs::remove_dir_all(&self.pipe_dir)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!(dir = %self.pipe_dir.display(), error = %e, "failed to remove pipe directory");
        }

        self.context.teardown()?;
        *self.state.lock().expect("supervisor state lock poisoned") = SupervisorState::Stopped;
        tracing::info!("supervisor stopped");
        Ok(())
    }
}

//! Task executor: realizes a decoded dispatch into a call on a registered
//! task, then packages the results into a completion report.
//!
//! All task-scoped failures fold into a non-zero exit status plus a message;
//! nothing unwinds past `execute`, so a single task failure never takes the
//! slot down.

use std::sync::Arc;

use crate::cache::CacheHandle;
use crate::context::ExecutionContext;
use crate::registry::{TaskFailure, TaskRegistry};
use crate::resolver::{AccessMode, BackingResolver, Resolution};
use crate::serializer::Serializer;
use crate::tracker::{ObjectTracker, SyncMode};
use crate::value::RuntimeValue;
use crate::wire::protocol::{
    CompletionReport, DispatchRequest, NewValueDescriptor, ParamSpec, ParamValue,
};

#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("failed to resolve parameter {name}: {reason}")]
    ParamResolution { name: String, reason: String },

    #[error("task invocation failed: {message}")]
    Invocation {
        message: String,
        exit_code: Option<i32>,
    },

    #[error("failed to package result: {reason}")]
    Serialization { reason: String },
}

impl TaskError {
    /// Exit status carried in the completion report. Always non-zero.
    pub fn exit_status(&self) -> i32 {
        match self {
            Self::ParamResolution { .. } => 2,
            Self::Serialization { .. } => 3,
            Self::Invocation { exit_code, .. } => exit_code.filter(|c| *c != 0).unwrap_or(1),
        }
    }
}

pub struct TaskExecutor {
    registry: Arc<TaskRegistry>,
    tracker: Arc<ObjectTracker>,
    cache: Option<CacheHandle>,
    resolver: Arc<dyn BackingResolver>,
    serializer: Arc<dyn Serializer>,
    context: Arc<ExecutionContext>,
}

impl TaskExecutor {
    pub fn new(
        registry: Arc<TaskRegistry>,
        tracker: Arc<ObjectTracker>,
        cache: Option<CacheHandle>,
        resolver: Arc<dyn BackingResolver>,
        serializer: Arc<dyn Serializer>,
        context: Arc<ExecutionContext>,
    ) -> Self {
        Self {
            registry,
            tracker,
            cache,
            resolver,
            serializer,
            context,
        }
    }

    pub fn tracker(&self) -> &Arc<ObjectTracker> {
        &self.tracker
    }

    /// Run one dispatch to completion.
    pub async fn execute(&self, request: &DispatchRequest) -> CompletionReport {
        tracing::debug!(
            request_id = request.request_id,
            signature = %request.signature(),
            node = self.context.node_name(),
            "executing dispatch"
        );

        self.prepare_stream(&request.stdout_path).await;
        self.prepare_stream(&request.stderr_path).await;

        match self.run(request).await {
            Ok(new_values) => {
                tracing::debug!(
                    request_id = request.request_id,
                    new_values = new_values.len(),
                    "task completed"
                );
                CompletionReport::success(request.request_id, new_values)
            }
            Err(e) => {
                tracing::warn!(request_id = request.request_id, error = %e, "task failed");
                self.append_stream(&request.stderr_path, &e.to_string()).await;
                CompletionReport::failure(request.request_id, e.exit_status(), e.to_string())
            }
        }
    }

    async fn run(&self, request: &DispatchRequest) -> Result<Vec<NewValueDescriptor>, TaskError> {
        let signature = request.signature();
        let task = self
            .registry
            .lookup(&signature)
            .ok_or_else(|| TaskError::Invocation {
                message: format!("unknown task signature: {signature}"),
                exit_code: None,
            })?;

        if task.param_directions.len() != request.params.len() {
            return Err(TaskError::Invocation {
                message: format!(
                    "task {signature} declares {} parameter(s), dispatch carries {}",
                    task.param_directions.len(),
                    request.params.len()
                ),
                exit_code: None,
            });
        }

        let mut args = Vec::with_capacity(request.params.len());
        for spec in &request.params {
            args.push(self.realize_param(spec).await?);
        }

        let outputs = (task.func)(args).await.map_err(|e| match e.downcast::<TaskFailure>() {
            Ok(failure) => TaskError::Invocation {
                message: failure.message,
                exit_code: Some(failure.exit_code),
            },
            Err(other) => TaskError::Invocation {
                message: other.to_string(),
                exit_code: None,
            },
        })?;

        self.package_results(request, outputs).await
    }

    /// Turn one parameter spec into a concrete in-memory argument.
    async fn realize_param(&self, spec: &ParamSpec) -> Result<Arc<RuntimeValue>, TaskError> {
        match &spec.value {
            ParamValue::Int(i) => Ok(Arc::new(RuntimeValue::Int(*i))),
            ParamValue::Long(l) => Ok(Arc::new(RuntimeValue::Long(*l))),
            ParamValue::Double(d) => Ok(Arc::new(RuntimeValue::Double(*d))),
            ParamValue::Bool(b) => Ok(Arc::new(RuntimeValue::Bool(*b))),
            ParamValue::Str(s) => Ok(Arc::new(RuntimeValue::Str(s.clone()))),
            ParamValue::Null => Ok(Arc::new(RuntimeValue::Null)),
            ParamValue::File(path) => self.realize_reference(path, &spec.name).await,
            ParamValue::ExternalRef(key) => self.realize_reference(key, &spec.name).await,
        }
    }

    /// Materialize a reference parameter: the tracker first for outputs of
    /// earlier tasks, then the cache, then a cold read through the resolver.
    ///
    /// A pending output must synchronize before any cached copy is trusted;
    /// a rewrite of the backing location leaves the cache stale.
    async fn realize_reference(
        &self,
        key: &str,
        name: &str,
    ) -> Result<Arc<RuntimeValue>, TaskError> {
        if let Some(resident) = self.tracker.resident_for_backing(key) {
            let was_pending = self
                .tracker
                .identity_of(&resident)
                .and_then(|id| self.tracker.pending_sync(id))
                .unwrap_or(false);
            let value = self
                .tracker
                .wait_on(resident, SyncMode::Read)
                .await
                .map_err(|e| TaskError::ParamResolution {
                    name: name.to_string(),
                    reason: e.to_string(),
                })?;
            if was_pending
                && !value.is_null_result()
                && let Some(cache) = &self.cache
                && let Err(e) = cache.put(key, Arc::clone(&value), None).await
            {
                tracing::warn!(key, error = %e, "cache refresh failed");
            }
            return Ok(value);
        }

        if let Some(cache) = &self.cache
            && let Some(hit) = cache.get(key).await
        {
            tracing::trace!(key, hit_count = hit.hit_count, "parameter served from cache");
            return Ok(hit.value);
        }

        let value = match self.resolver.open(key, AccessMode::Read).await {
            Ok(Resolution::Content(bytes)) => {
                let value = self.serializer.deserialize(&bytes).map_err(|e| {
                    TaskError::ParamResolution {
                        name: name.to_string(),
                        reason: e.to_string(),
                    }
                })?;
                if let Err(e) = self.resolver.close(key, AccessMode::Read).await {
                    tracing::warn!(key, error = %e, "failed to close backing location");
                }
                Arc::new(value)
            }
            Ok(Resolution::Absent) => {
                tracing::debug!(key, "parameter backing absent, passing null result");
                Arc::new(RuntimeValue::NullResult)
            }
            Err(e) => {
                return Err(TaskError::ParamResolution {
                    name: name.to_string(),
                    reason: e.to_string(),
                });
            }
        };

        // Admit real content only: a null-result marker must not shadow the
        // value once the producer materializes it.
        if !value.is_null_result()
            && let Some(cache) = &self.cache
            && let Err(e) = cache.put(key, Arc::clone(&value), None).await
        {
            tracing::warn!(key, error = %e, "cache admission failed");
        }

        Ok(value)
    }

    /// Serialize reference results to their bindings and register them as
    /// fresh pending identities; primitives travel inline.
    async fn package_results(
        &self,
        request: &DispatchRequest,
        outputs: Vec<RuntimeValue>,
    ) -> Result<Vec<NewValueDescriptor>, TaskError> {
        if outputs.len() > request.result_bindings.len() {
            return Err(TaskError::Serialization {
                reason: format!(
                    "task produced {} value(s) for {} result binding(s)",
                    outputs.len(),
                    request.result_bindings.len()
                ),
            });
        }

        let mut descriptors = Vec::with_capacity(outputs.len());
        for (value, binding) in outputs.into_iter().zip(&request.result_bindings) {
            if value.is_reference() {
                let value = Arc::new(value);
                let bytes =
                    self.serializer
                        .serialize(&value)
                        .map_err(|e| TaskError::Serialization {
                            reason: e.to_string(),
                        })?;
                tokio::fs::write(binding, bytes)
                    .await
                    .map_err(|e| TaskError::Serialization {
                        reason: format!("failed to write {binding}: {e}"),
                    })?;

                let (id, _) = self.tracker.track(&value, value.is_container());
                self.tracker.mark_pending_after_produce(id, binding.as_str());

                descriptors.push(NewValueDescriptor {
                    identity: id.to_string(),
                    value: ParamValue::File(binding.clone()),
                });
            } else {
                descriptors.push(NewValueDescriptor {
                    identity: binding.clone(),
                    value: inline_param(&value),
                });
            }
        }

        Ok(descriptors)
    }

    async fn prepare_stream(&self, path: &str) {
        if path.is_empty() {
            return;
        }
        if let Err(e) = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
        {
            tracing::warn!(path, error = %e, "failed to prepare stream file");
        }
    }

    async fn append_stream(&self, path: &str, line: &str) {
        if path.is_empty() {
            return;
        }
        use tokio::io::AsyncWriteExt;
        match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
        {
            Ok(mut file) => {
                let _ = file.write_all(format!("{line}\n").as_bytes()).await;
            }
            Err(e) => {
                tracing::warn!(path, error = %e, "failed to append to stream file");
            }
        }
    }
}

fn inline_param(value: &RuntimeValue) -> ParamValue {
    match value {
        RuntimeValue::Int(i) => ParamValue::Int(*i),
        RuntimeValue::Long(l) => ParamValue::Long(*l),
        RuntimeValue::Double(d) => ParamValue::Double(*d),
        RuntimeValue::Bool(b) => ParamValue::Bool(*b),
        RuntimeValue::Str(s) => ParamValue::Str(s.clone()),
        RuntimeValue::Null | RuntimeValue::NullResult => ParamValue::Null,
        // Reference types take the serialized path in package_results.
        RuntimeValue::List(_) | RuntimeValue::Map(_) => ParamValue::Null,
    }
}

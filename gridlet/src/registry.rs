//! Task registration table.
//!
//! Tasks are registered explicitly at process startup: a stable signature
//! string maps to a closure plus a typed parameter-direction descriptor.
//! There is no runtime discovery.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use dashmap::DashMap;

use crate::value::RuntimeValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamDirection {
    In,
    Out,
    InOut,
}

/// Typed failure a task can return through `anyhow` to carry its exit code
/// into the completion report.
#[derive(Debug, thiserror::Error)]
#[error("task failed with exit code {exit_code}: {message}")]
pub struct TaskFailure {
    pub message: String,
    pub exit_code: i32,
}

impl TaskFailure {
    pub fn new(message: impl Into<String>, exit_code: i32) -> Self {
        Self {
            message: message.into(),
            exit_code,
        }
    }
}

pub type TaskFuture = Pin<Box<dyn Future<Output = anyhow::Result<Vec<RuntimeValue>>> + Send>>;

/// Type-erased task body: realized arguments in, produced values out.
pub type TaskFn = Arc<dyn Fn(Vec<Arc<RuntimeValue>>) -> TaskFuture + Send + Sync>;

#[derive(Clone)]
pub struct RegisteredTask {
    pub func: TaskFn,
    pub param_directions: Vec<ParamDirection>,
}

/// Registry holding the mapping between task signatures and their bodies.
pub struct TaskRegistry {
    tasks: DashMap<String, RegisteredTask>,
}

impl TaskRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            tasks: DashMap::new(),
        })
    }

    /// Register a task body under `signature` (`"module.method"`).
    ///
    /// The future type is erased here so differently-shaped async functions
    /// share one table.
    pub fn register<F, Fut>(&self, signature: &str, param_directions: Vec<ParamDirection>, func: F)
    where
        F: Fn(Vec<Arc<RuntimeValue>>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Vec<RuntimeValue>>> + Send + 'static,
    {
        let func: TaskFn = Arc::new(move |args| Box::pin(func(args)) as TaskFuture);
        self.tasks.insert(
            signature.to_string(),
            RegisteredTask {
                func,
                param_directions,
            },
        );
        tracing::info!(signature, "registered task");
    }

    pub fn lookup(&self, signature: &str) -> Option<RegisteredTask> {
        self.tasks.get(signature).map(|t| t.clone())
    }

    pub fn signatures(&self) -> Vec<String> {
        self.tasks.iter().map(|e| e.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn registered_task_is_invocable() {
        let registry = TaskRegistry::new();
        registry.register("demo.double", vec![ParamDirection::In], |args| async move {
            let RuntimeValue::Int(x) = *args[0] else {
                anyhow::bail!("expected int");
            };
            Ok(vec![RuntimeValue::Int(x * 2)])
        });

        let task = registry.lookup("demo.double").unwrap();
        let out = (task.func)(vec![Arc::new(RuntimeValue::Int(21))]).await.unwrap();
        assert_eq!(out, vec![RuntimeValue::Int(42)]);
        assert_eq!(task.param_directions, vec![ParamDirection::In]);
    }

    #[test]
    fn unknown_signature_is_none() {
        let registry = TaskRegistry::new();
        assert!(registry.lookup("nope.missing").is_none());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn task_failure_downcasts_with_exit_code() {
        let registry = TaskRegistry::new();
        registry.register("demo.fail", vec![], |_args| async move {
            Err(TaskFailure::new("went sideways", 7).into())
        });

        let task = registry.lookup("demo.fail").unwrap();
        let err = (task.func)(vec![]).await.unwrap_err();
        let failure = err.downcast_ref::<TaskFailure>().unwrap();
        assert_eq!(failure.exit_code, 7);
    }

    #[test]
    fn reregistration_replaces() {
        let registry = TaskRegistry::new();
        registry.register("demo.t", vec![], |_| async { Ok(vec![]) });
        registry.register("demo.t", vec![ParamDirection::Out], |_| async { Ok(vec![]) });
        assert_eq!(registry.len(), 1);
        let task = registry.lookup("demo.t").unwrap();
        assert_eq!(task.param_directions, vec![ParamDirection::Out]);
    }
}

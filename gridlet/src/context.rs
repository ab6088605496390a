//! Execution context threaded explicitly through construction.
//!
//! Replaces a process-wide "who am I" flag: the context is a value created at
//! process start, activated by the supervisor, and torn down at process stop.

use std::path::{Path, PathBuf};
use std::sync::Mutex as StdMutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextPhase {
    Init,
    Active,
    TornDown,
}

#[derive(Debug, thiserror::Error)]
#[error("invalid context transition: {from:?} -> {to:?}")]
pub struct ContextError {
    from: ContextPhase,
    to: ContextPhase,
}

/// Worker-process execution context.
///
/// Lifecycle: `Init` (constructed) → `Active` (supervisor started) →
/// `TornDown` (supervisor stopped). Transitions are one-way.
#[derive(Debug)]
pub struct ExecutionContext {
    node_name: String,
    working_dir: PathBuf,
    debug: bool,
    phase: StdMutex<ContextPhase>,
}

impl ExecutionContext {
    pub fn new(node_name: impl Into<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            node_name: node_name.into(),
            working_dir: working_dir.into(),
            debug: false,
            phase: StdMutex::new(ContextPhase::Init),
        }
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    pub fn debug(&self) -> bool {
        self.debug
    }

    pub fn phase(&self) -> ContextPhase {
        *self.phase.lock().expect("context phase lock poisoned")
    }

    pub fn is_active(&self) -> bool {
        self.phase() == ContextPhase::Active
    }

    pub fn activate(&self) -> Result<(), ContextError> {
        self.transition(ContextPhase::Init, ContextPhase::Active)
    }

    pub fn teardown(&self) -> Result<(), ContextError> {
        self.transition(ContextPhase::Active, ContextPhase::TornDown)
    }

    fn transition(&self, from: ContextPhase, to: ContextPhase) -> Result<(), ContextError> {
        let mut phase = self.phase.lock().expect("context phase lock poisoned");
        if *phase != from {
            return Err(ContextError { from: *phase, to });
        }
        *phase = to;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_lifecycle() {
        let ctx = ExecutionContext::new("node-0", "/tmp");
        assert_eq!(ctx.phase(), ContextPhase::Init);
        assert!(!ctx.is_active());

        ctx.activate().unwrap();
        assert!(ctx.is_active());

        ctx.teardown().unwrap();
        assert_eq!(ctx.phase(), ContextPhase::TornDown);
    }

    #[test]
    fn teardown_before_activate_is_rejected() {
        let ctx = ExecutionContext::new("node-0", "/tmp");
        assert!(ctx.teardown().is_err());
        assert_eq!(ctx.phase(), ContextPhase::Init);
    }

    #[test]
    fn double_activate_is_rejected() {
        let ctx = ExecutionContext::new("node-0", "/tmp");
        ctx.activate().unwrap();
        assert!(ctx.activate().is_err());
        assert!(ctx.is_active());
    }

    #[test]
    fn debug_flag() {
        let ctx = ExecutionContext::new("node-0", "/tmp").with_debug(true);
        assert!(ctx.debug());
        assert_eq!(ctx.node_name(), "node-0");
    }
}

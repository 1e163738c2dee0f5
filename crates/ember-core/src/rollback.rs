//! Compensating actions for multi-step setup.
//!
//! Each acquired resource pushes its own undo step. On failure the steps run
//! in reverse order; a failing step is logged and the rest still run.

use crate::error::{CoreError, Result};
use futures::future::BoxFuture;
use std::future::Future;

type Undo = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

/// Ordered list of undo steps.
#[derive(Default)]
pub struct Rollback {
    steps: Vec<(&'static str, Undo)>,
}

impl std::fmt::Debug for Rollback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.labels()).finish()
    }
}

impl Rollback {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the undo step for a resource just acquired.
    pub fn push<F, Fut>(&mut self, label: &'static str, undo: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.steps.push((label, Box::new(move || Box::pin(undo()))));
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Labels in registration order.
    pub fn labels(&self) -> Vec<&'static str> {
        self.steps.iter().map(|(label, _)| *label).collect()
    }

    /// Setup succeeded; drop every undo step.
    pub fn commit(mut self) {
        self.steps.clear();
    }

    /// Run undo steps newest first. Returns the failures.
    pub async fn run(mut self) -> Vec<(&'static str, CoreError)> {
        let mut failures = Vec::new();
        while let Some((label, undo)) = self.steps.pop() {
            match undo().await {
                Ok(()) => tracing::debug!(step = label, "Rollback step completed"),
                Err(e) => {
                    tracing::warn!(step = label, error = %e, "Rollback step failed");
                    failures.push((label, e));
                }
            }
        }
        failures
    }
}

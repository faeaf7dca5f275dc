//! Injected task scheduling
//!
//! The crate never creates its own runtime. Drivers and per-stream tasks are
//! handed to an [`Executor`] supplied by the caller.

use futures::future::BoxFuture;
use std::sync::Arc;
use tracing::warn;

use crate::error::ExecuteError;

/// Capability to run a background task to completion.
pub trait Executor: Send + Sync + 'static {
    fn execute(&self, task: BoxFuture<'static, ()>) -> Result<(), ExecuteError>;
}

impl<E: Executor + ?Sized> Executor for Arc<E> {
    fn execute(&self, task: BoxFuture<'static, ()>) -> Result<(), ExecuteError> {
        (**self).execute(task)
    }
}

/// Spawns onto the tokio runtime the caller is running in.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioExecutor;

impl TokioExecutor {
    pub fn new() -> Self {
        Self
    }
}

impl Executor for TokioExecutor {
    fn execute(&self, task: BoxFuture<'static, ()>) -> Result<(), ExecuteError> {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(task);
                Ok(())
            }
            Err(e) => {
                warn!("No tokio runtime to spawn onto: {}", e);
                Err(ExecuteError)
            }
        }
    }
}

//! Errors reported by the job system.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Every handle slot is live. This is a capacity problem, waiting won't fix it.
    #[error("job handle table exhausted ({capacity} handles live)")]
    HandleExhausted { capacity: usize },

    #[error("fiber pool exhausted ({capacity} fibers in use)")]
    FiberExhausted { capacity: usize },

    #[error("failed to allocate a fiber stack: {0}")]
    FiberStack(#[source] std::io::Error),

    #[error("the job system has been shut down")]
    ShutDown,

    #[error("the job system is not initialized")]
    NotInitialized,
}

//! Context assembly: token estimation, the five-layer assembler, and the
//! two outbound prompt formats.

pub mod context;
pub mod format;
pub mod tokens;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ContextError {
    /// Not even the immediate layer fits the budget.
    #[error("context budget exceeded")]
    BudgetExceeded,

    #[error("context assembly timed out")]
    Timeout,

    #[error("context assembly cancelled")]
    Cancelled,

    #[error("model does not support {0}")]
    CapabilityDenied(String),

    #[error(transparent)]
    Store(#[from] balachka_memory::error::StoreError),
}

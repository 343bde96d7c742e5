//! ACL error types.

/// Evaluation failures. An `Err` from the evaluator always means the
/// access is denied; the error carries why.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AclError {
    #[error("store query failed: {0}")]
    Store(String),

    #[error("hierarchy provider failed: {0}")]
    Hierarchy(String),

    #[error("hierarchy traversal exceeded depth {0}")]
    DepthExceeded(u32),
}

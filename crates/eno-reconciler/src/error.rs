use thiserror::Error;

use eno_api::ApiError;
use eno_domain::DomainError;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("api error: {0}")]
    Api(#[from] ApiError),

    #[error("expression error: {0}")]
    Expr(#[from] eno_expr::ExprError),

    #[error("domain error: {0}")]
    Domain(#[from] DomainError),
}

impl ReconcileError {
    /// Terminal errors are not retried until an informer event changes the
    /// inputs; everything else goes back on the queue with backoff.
    pub fn is_terminal(&self) -> bool {
        match self {
            ReconcileError::Api(e) => e.is_terminal(),
            ReconcileError::Expr(_) => true,
            ReconcileError::Domain(_) => true,
        }
    }
}

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DomainError {
    #[error("invalid manifest at {slice}[{index}]: {message}")]
    InvalidManifest {
        slice: String,
        index: usize,
        message: String,
    },

    #[error("invalid annotation {key}: {message}")]
    InvalidAnnotation { key: String, message: String },

    #[error("expression error in {key}: {source}")]
    Expr {
        key: String,
        #[source]
        source: eno_expr::ExprError,
    },

    #[error("invalid duration {0:?}")]
    InvalidDuration(String),
}

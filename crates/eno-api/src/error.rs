use thiserror::Error;

/// Classified API failures. The reconciler's retry behavior keys off the
/// variant: NotFound and Conflict have dedicated handling, Terminal errors
/// are not retried until inputs change, everything Transient goes back on
/// the queue with backoff.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("namespace {0:?} does not exist")]
    NamespaceMissing(String),

    #[error("terminal: {0}")]
    Terminal(String),

    #[error("transient: {0}")]
    Transient(String),
}

impl ApiError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ApiError::NotFound)
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, ApiError::Conflict(_))
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ApiError::Terminal(_))
    }

    /// Map an HTTP status + extracted message into the taxonomy.
    pub fn from_status(status: u16, message: String) -> Self {
        match status {
            404 => match missing_namespace(&message) {
                Some(ns) => ApiError::NamespaceMissing(ns),
                None => ApiError::NotFound,
            },
            409 => ApiError::Conflict(message),
            400 | 422 => ApiError::Terminal(message),
            _ => ApiError::Transient(format!("status {}: {}", status, message)),
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        ApiError::Transient(e.to_string())
    }
}

/// The API server reports writes into an absent namespace as a 404 whose
/// message names the namespace: `namespaces "foo" not found`.
fn missing_namespace(message: &str) -> Option<String> {
    let rest = message.split("namespaces \"").nth(1)?;
    let ns = rest.split('"').next()?;
    if rest.contains("not found") {
        Some(ns.to_string())
    } else {
        None
    }
}

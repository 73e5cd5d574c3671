use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExprError {
    #[error("parse error at offset {offset}: {message}")]
    Parse { offset: usize, message: String },

    #[error("index {index} out of range for sequence of length {len}")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("evaluation error: {0}")]
    Eval(String),

    #[error("expression exceeded the step budget of {0}")]
    StepBudget(u64),

    #[error("invalid resource quantity: {0:?}")]
    Quantity(String),
}

impl ExprError {
    pub(crate) fn parse(offset: usize, message: impl Into<String>) -> Self {
        ExprError::Parse {
            offset,
            message: message.into(),
        }
    }
}

use thiserror::Error;

#[derive(Error, Debug)]
pub enum VmError {
    /// Input rejected before any external call was made
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, VmError>;

use thiserror::Error;

use crate::adapter::AdapterError;
use crate::engine::EngineError;
use crate::runtime::conf::ConfError;

/// Main application error type for cleave.
#[derive(Debug, Error)]
pub enum CleaveError {
    #[error("configuration error: {0}")]
    Conf(#[from] ConfError),

    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("adapter error: {0}")]
    Adapter(#[from] AdapterError),

    #[error("signal handling error: {0}")]
    Signal(#[from] std::io::Error),
}

/// Type alias for Result with CleaveError.
pub type Result<T> = std::result::Result<T, CleaveError>;

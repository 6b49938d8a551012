use thiserror::Error;

#[derive(Error, Debug)]
pub enum SimError {
    /// Rejected before any trial runs.
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Invalid historical data: {0}")]
    Data(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl SimError {
    pub fn config(msg: impl Into<String>) -> Self {
        SimError::Config(msg.into())
    }

    pub fn is_config(&self) -> bool {
        matches!(self, SimError::Config(_))
    }
}

pub type SimResult<T> = Result<T, SimError>;

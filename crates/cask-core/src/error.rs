use thiserror::Error;

pub type Result<T> = std::result::Result<T, CaskError>;

#[derive(Debug, Error)]
pub enum CaskError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The on-disk logs and the in-memory indexes disagree. Fatal: the run
    /// cannot produce a consistent dictionary from this state.
    #[error("store corruption: {0}")]
    Corruption(String),
}

impl CaskError {
    pub fn config(msg: impl Into<String>) -> Self {
        CaskError::Config(msg.into())
    }

    pub fn corruption(msg: impl Into<String>) -> Self {
        CaskError::Corruption(msg.into())
    }
}

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CadenceError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("unknown bucket: {0}")]
    UnknownBucket(String),
}

pub type CadenceResult<T> = Result<T, CadenceError>;

use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CoreError {
    #[error("buffer capacity exceeded")]
    OutOfSpace,
    #[error("truncated input")]
    Truncated,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("malformed wire data")]
    Malformed,
    #[error("invalid address url")]
    InvalidUrl,
}

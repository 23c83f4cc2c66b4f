use thiserror::Error;

#[derive(Debug, Error)]
pub enum PairedDeviceRepositoryError {
    #[error("paired device not found")]
    NotFound,

    #[error("storage error: {0}")]
    Storage(String),
}

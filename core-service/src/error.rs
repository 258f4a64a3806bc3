use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Core initialization failed: {0}")]
    InitializationFailed(String),

    #[error("Runtime error: {0}")]
    Runtime(#[from] core_runtime::Error),

    #[error("Sync error: {0}")]
    Sync(#[from] core_sync::SyncError),
}

impl CoreError {
    /// Whether the service can not keep running after this error
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Sync(e) => e.is_fatal(),
            Self::InitializationFailed(_) | Self::Runtime(_) => true,
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("API error: {0}")]
    Api(String),

    #[error("Rate limited")]
    RateLimited,

    #[error("network error: {0}")]
    Network(String),

    #[error("Timeout")]
    Timeout,
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage read error: {0}")]
    Read(String),

    #[error("storage write error: {0}")]
    Write(String),

    #[error("storage serialization error: {0}")]
    Serialize(String),
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("a request is already in flight")]
    Busy,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("unknown session: {0}")]
    UnknownSession(String),
}

use ulid::Ulid;

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// A conditional transition's precondition failed — slot unavailable,
    /// hold no longer Active. Expected under contention, never fatal.
    Conflict(Ulid),
    Expired(Ulid),
    Forbidden,
    LimitExceeded(&'static str),
    LockTimeout,
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::Conflict(id) => write!(f, "conflict on slot: {id}"),
            EngineError::Expired(id) => write!(f, "hold expired: {id}"),
            EngineError::Forbidden => write!(f, "forbidden"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::LockTimeout => write!(f, "exclusive section wait timed out"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

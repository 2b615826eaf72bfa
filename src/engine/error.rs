#[derive(Debug)]
pub enum EngineError {
    UnknownDate(String),
    InvalidGroupSize(u32),
    EmptyStudentIds,
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    /// True for request-shape failures the caller can fix and resubmit;
    /// false for storage faults worth retrying as-is.
    pub fn is_invalid_request(&self) -> bool {
        !matches!(self, EngineError::WalError(_))
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::UnknownDate(date) => write!(f, "unknown date: {date}"),
            EngineError::InvalidGroupSize(size) => write!(f, "invalid group size: {size}"),
            EngineError::EmptyStudentIds => write!(f, "student id list is empty"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

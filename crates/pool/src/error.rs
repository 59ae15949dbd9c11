use thiserror::Error;

/// Failures surfaced by the pool. `Clone` so one installation or pool
/// start-up outcome can be handed to every caller waiting on it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    /// Image or archive could not be fetched.
    #[error("transport error: {0}")]
    Transport(String),
    /// Image or archive bytes could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),
    /// A write or sync on the mounted filesystem failed.
    #[error("filesystem error: {0}")]
    Filesystem(String),
    /// The runtime could not be instantiated from its image.
    #[error("runtime error: {0}")]
    Runtime(String),
    /// The script failed. `message` includes any output produced before the fault.
    #[error("{message}")]
    Interpreter { message: String },
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("unit not ready: {0}")]
    NotReady(String),
    #[error("execution unit {0} is gone")]
    UnitGone(String),
    #[error("scheduler is not running")]
    SchedulerGone,
}

impl PoolError {
    pub fn transport(err: impl std::fmt::Display) -> Self {
        Self::Transport(format!("{err:#}"))
    }

    pub fn decode(err: impl std::fmt::Display) -> Self {
        Self::Decode(format!("{err:#}"))
    }

    pub fn filesystem(err: impl std::fmt::Display) -> Self {
        Self::Filesystem(format!("{err:#}"))
    }

    /// Whether an installation attempt failing with this error may be retried.
    pub fn is_install_failure(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::Decode(_) | Self::Filesystem(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages() {
        let err = PoolError::Interpreter {
            message: "Error running PHP code:\nhello".to_string(),
        };
        assert_eq!(err.to_string(), "Error running PHP code:\nhello");
        assert_eq!(
            PoolError::transport("404 Not Found").to_string(),
            "transport error: 404 Not Found"
        );
        assert!(PoolError::decode("bad zip").is_install_failure());
        assert!(!PoolError::SchedulerGone.is_install_failure());
    }
}

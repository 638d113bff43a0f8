use thiserror::Error;

/// Error kinds with distinct recovery policies. Transient I/O is retried
/// locally; semantic errors propagate to the supervisor.
#[derive(Debug, Error)]
pub enum BotError {
    #[error("transient network error: {0}")]
    TransientNetwork(String),

    #[error("authentication failure: {0}")]
    Auth(String),

    #[error("order rejected: {0}")]
    Rejected(String),

    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("data missing: {0}")]
    DataMissing(String),

    #[error("disk contention on {path}: {source}")]
    DiskContention {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl BotError {
    /// Retried locally and never surfaced past a log line.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BotError::TransientNetwork(_) | BotError::DiskContention { .. }
        )
    }

    /// Must reach the supervisor.
    pub fn is_fatal(&self) -> bool {
        matches!(self, BotError::Auth(_) | BotError::InvariantViolation(_))
    }
}

pub type BotResult<T> = Result<T, BotError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert!(BotError::TransientNetwork("reset".into()).is_transient());
        assert!(!BotError::TransientNetwork("reset".into()).is_fatal());
        assert!(BotError::Auth("401".into()).is_fatal());
        assert!(BotError::InvariantViolation("oversell".into()).is_fatal());
        assert!(!BotError::Rejected("cash too low".into()).is_fatal());
        assert!(!BotError::DataMissing("no candles".into()).is_transient());
    }
}

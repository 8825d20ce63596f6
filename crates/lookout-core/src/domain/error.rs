//! Domain-level error taxonomy for Lookout.

use std::time::Duration;

/// Errors produced anywhere in a session's lifecycle.
///
/// Every variant is caught at the state machine boundary and converted into a
/// terminal `Failed`/`TimedOut` transition; none of them propagate out of a
/// session or affect concurrently running sessions.
#[derive(Debug, thiserror::Error)]
pub enum EvalError {
    #[error("attach error: {0}")]
    Attach(String),

    #[error("target already instrumented: {0}")]
    AlreadyInstrumented(String),

    #[error("script load error: {0}")]
    ScriptLoad(String),

    #[error("channel error: {0}")]
    Channel(String),

    #[error("verdict error: {0}")]
    Verdict(String),

    #[error("evaluation timed out after {0:?}")]
    Timeout(Duration),

    #[error("session cancelled: {0}")]
    Cancelled(String),

    #[error("context restore failed: {0}")]
    Restore(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for Lookout domain operations.
pub type Result<T> = std::result::Result<T, EvalError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eval_error_display() {
        let err = EvalError::Attach("process not found: /usr/bin/nowhere".to_string());
        assert!(err.to_string().contains("attach error"));

        let err = EvalError::AlreadyInstrumented("telegram".to_string());
        assert!(err.to_string().contains("already instrumented"));

        let err = EvalError::ScriptLoad("no start_success within 5s".to_string());
        assert!(err.to_string().contains("script load error"));
    }

    #[test]
    fn test_timeout_error_carries_budget() {
        let err = EvalError::Timeout(Duration::from_secs(180));
        assert!(err.to_string().contains("180"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: EvalError = io.into();
        assert!(matches!(err, EvalError::Io(_)));
    }
}

use crate::models::RevisionId;
use crate::provider::ProviderError;
use crate::state::config::RetrySettings;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, warn};

/// Errors surfaced by the layout engine.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Unknown revision: {0}")]
    UnknownRevision(RevisionId),

    #[error("Revision provider unavailable: {reason}")]
    ProviderUnavailable { reason: String },

    #[error("Generation {generation} was retired")]
    Cancelled { generation: u64 },

    #[error("Load budget of {limit} revisions exceeded")]
    BudgetExceeded { limit: usize },

    #[error("Layout invariant violated: {detail}")]
    InvariantViolation { detail: String },

    #[error("Provider error: {0}")]
    Provider(ProviderError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EngineError {
    pub fn cancelled(generation: u64) -> Self {
        debug!("Discarding work for retired generation {}", generation);
        EngineError::Cancelled { generation }
    }

    pub fn budget_exceeded(limit: usize) -> Self {
        debug!("Load budget of {} revisions reached", limit);
        EngineError::BudgetExceeded { limit }
    }

    pub fn invariant(detail: impl Into<String>) -> Self {
        let detail = detail.into();
        error!("Layout invariant violated: {}", detail);
        EngineError::InvariantViolation { detail }
    }

    /// Recoverable errors leave the engine able to make progress, possibly
    /// after a retry or a user request.
    pub fn is_recoverable(&self) -> bool {
        match self {
            EngineError::UnknownRevision(_) => true,
            EngineError::ProviderUnavailable { .. } => true,
            EngineError::Cancelled { .. } => true,
            EngineError::BudgetExceeded { .. } => true,
            EngineError::InvariantViolation { .. } => false,
            EngineError::Provider(e) => e.is_transient(),
            EngineError::Io(_) => true,
            EngineError::Serialization(_) => false,
        }
    }

    /// Only provider outages are retried automatically.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::ProviderUnavailable { .. })
            || matches!(self, EngineError::Provider(e) if e.is_transient())
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self {
            EngineError::UnknownRevision(_) => ErrorSeverity::Medium,
            EngineError::ProviderUnavailable { .. } => ErrorSeverity::Medium,
            EngineError::Cancelled { .. } => ErrorSeverity::Low,
            EngineError::BudgetExceeded { .. } => ErrorSeverity::Low,
            EngineError::InvariantViolation { .. } => ErrorSeverity::Critical,
            EngineError::Provider(_) => ErrorSeverity::Medium,
            EngineError::Io(_) => ErrorSeverity::High,
            EngineError::Serialization(_) => ErrorSeverity::Medium,
        }
    }
}

impl From<ProviderError> for EngineError {
    fn from(error: ProviderError) -> Self {
        match error {
            ProviderError::UnknownRevision(id) => EngineError::UnknownRevision(id),
            ProviderError::Unavailable { reason } => EngineError::ProviderUnavailable { reason },
            other => EngineError::Provider(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorSeverity::Low => write!(f, "LOW"),
            ErrorSeverity::Medium => write!(f, "MEDIUM"),
            ErrorSeverity::High => write!(f, "HIGH"),
            ErrorSeverity::Critical => write!(f, "CRITICAL"),
        }
    }
}

pub struct ErrorReporter;

impl ErrorReporter {
    /// Log error with a level matching its severity.
    pub fn log_error(error: &EngineError, context: &str) {
        match error.severity() {
            ErrorSeverity::Critical => error!("[CRITICAL] {}: {}", context, error),
            ErrorSeverity::High => error!("[HIGH] {}: {}", context, error),
            ErrorSeverity::Medium => warn!("[MEDIUM] {}: {}", context, error),
            ErrorSeverity::Low => debug!("[LOW] {}: {}", context, error),
        }
    }
}

/// Exponential retry schedule for transient provider failures.
#[derive(Debug, Clone)]
pub struct Backoff {
    settings: RetrySettings,
    attempt: u32,
}

impl Backoff {
    pub fn new(settings: RetrySettings) -> Self {
        Self {
            settings,
            attempt: 0,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Registers a failure. Returns the delay before the next attempt, or
    /// `None` once the attempt ceiling is reached.
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.attempt += 1;
        if self.attempt >= self.settings.max_attempts {
            return None;
        }
        let factor = 1u64.checked_shl(self.attempt - 1).unwrap_or(u64::MAX);
        let delay = self
            .settings
            .base_delay_ms
            .saturating_mul(factor)
            .min(self.settings.max_delay_ms);
        Some(Duration::from_millis(delay))
    }

    pub fn reset(&mut self) {
        if self.attempt > 0 {
            debug!("Provider recovered after {} failed attempts", self.attempt);
        }
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_properties() {
        let cancelled = EngineError::cancelled(3);
        assert!(cancelled.is_recoverable());
        assert!(!cancelled.is_retryable());
        assert_eq!(cancelled.severity(), ErrorSeverity::Low);

        let broken = EngineError::invariant("two lines in column 1");
        assert!(!broken.is_recoverable());
        assert!(!broken.is_retryable());
        assert_eq!(broken.severity(), ErrorSeverity::Critical);
    }

    #[test]
    fn test_provider_error_conversion() {
        let err: EngineError = ProviderError::UnknownRevision("x".into()).into();
        assert!(matches!(err, EngineError::UnknownRevision(_)));
        assert!(!err.is_retryable());

        let err: EngineError = ProviderError::unavailable("network down").into();
        assert!(err.is_retryable());

        let err: EngineError = ProviderError::git("corrupt object").into();
        assert!(matches!(err, EngineError::Provider(ProviderError::Git { .. })));
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut backoff = Backoff::new(RetrySettings {
            max_attempts: 6,
            base_delay_ms: 1000,
            max_delay_ms: 5000,
        });
        let delays: Vec<_> = std::iter::from_fn(|| backoff.next_delay()).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(1000),
                Duration::from_millis(2000),
                Duration::from_millis(4000),
                Duration::from_millis(5000),
                Duration::from_millis(5000),
            ]
        );
        assert_eq!(backoff.attempts(), 6);
        backoff.reset();
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(1000)));
    }
}

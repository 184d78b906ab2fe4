use crate::types::RecoveryStrategy;
use regex::Regex;
use serde::Serialize;
use std::time::Duration;
use tracing::warn;
use weft_core::{ErrorCategory, WeftError};

/// Default handling for one error category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RecoveryPolicy {
    pub strategy: RecoveryStrategy,
    pub recoverable: bool,
    pub max_retries: u32,
}

impl RecoveryPolicy {
    const fn new(strategy: RecoveryStrategy, recoverable: bool, max_retries: u32) -> Self {
        Self {
            strategy,
            recoverable,
            max_retries,
        }
    }

    /// The default policy for `category`.
    pub fn for_category(category: ErrorCategory) -> Self {
        use RecoveryStrategy::*;
        match category {
            ErrorCategory::Network => Self::new(Retry, true, 3),
            ErrorCategory::Timeout => Self::new(Retry, true, 2),
            ErrorCategory::Validation
            | ErrorCategory::Permission
            | ErrorCategory::Dependency
            | ErrorCategory::UserInput => Self::new(ManualIntervention, false, 0),
            ErrorCategory::Resource | ErrorCategory::WorkerServer => {
                Self::new(RestartWorker, true, 2)
            }
            ErrorCategory::System => Self::new(FailFast, false, 0),
            ErrorCategory::Unknown => Self::new(Retry, true, 1),
        }
    }
}

/// Message patterns, tried in this order against the lowercased message.
const PATTERNS: [(ErrorCategory, &str); 9] = [
    (
        ErrorCategory::Timeout,
        r"\b(timeout|timed out|time out|deadline exceeded|etimedout)\b",
    ),
    (
        ErrorCategory::Network,
        r"\b(econnrefused|econnreset|enotfound|ehostunreach|connection (refused|reset|closed|aborted)|network|socket|dns|unreachable|broken pipe)\b",
    ),
    (
        ErrorCategory::Permission,
        r"\b(permission denied|access denied|forbidden|unauthorized|eacces|eperm|not permitted)\b",
    ),
    (
        ErrorCategory::Validation,
        r"\b(invalid|validation|malformed|schema|parse error|unexpected token|bad request)\b",
    ),
    (
        ErrorCategory::Resource,
        r"\b(out of memory|oom|enomem|no space left|enospc|quota|resource exhausted|too many open files|emfile)\b",
    ),
    (
        ErrorCategory::WorkerServer,
        r"\b(worker (crashed|exited|died|unavailable|unhealthy)|server error|bad gateway|service unavailable|502|503)\b",
    ),
    (
        ErrorCategory::Dependency,
        r"\b(module not found|cannot find module|no module named|missing dependency|dependency)\b",
    ),
    (
        ErrorCategory::UserInput,
        r"\b(user input|missing required (argument|parameter|field)|required (argument|parameter|field))\b",
    ),
    (
        ErrorCategory::System,
        r"\b(segmentation fault|sigsegv|sigkill|kernel|system error|panicked)\b",
    ),
];

/// Maps failures to an [`ErrorCategory`].
///
/// Structured errors are mapped directly; everything else is matched by
/// message against a fixed, ordered pattern table. The first match wins, and
/// a message matching nothing is [`ErrorCategory::Unknown`].
pub struct ErrorClassifier {
    patterns: Vec<(ErrorCategory, Regex)>,
}

impl ErrorClassifier {
    pub fn new() -> Self {
        let patterns = PATTERNS
            .iter()
            .filter_map(|(category, pattern)| match Regex::new(pattern) {
                Ok(re) => Some((*category, re)),
                Err(e) => {
                    warn!(%category, error = %e, "Skipping unusable classification pattern");
                    None
                }
            })
            .collect();
        Self { patterns }
    }

    pub fn classify(&self, error: &WeftError) -> ErrorCategory {
        match error {
            WeftError::Step {
                category: Some(category),
                ..
            } => *category,
            WeftError::Timeout(_) => ErrorCategory::Timeout,
            WeftError::Http(_) => ErrorCategory::Network,
            WeftError::LaunchArtifactMissing(_) => ErrorCategory::Dependency,
            WeftError::PortsExhausted { .. } => ErrorCategory::Resource,
            WeftError::Startup(_) | WeftError::Worker(_) | WeftError::UnknownWorker(_) => {
                ErrorCategory::WorkerServer
            }
            WeftError::Config(_) | WeftError::Json(_) => ErrorCategory::Validation,
            WeftError::Io(io) => self.classify_io(io),
            other => self.classify_message(&other.to_string()),
        }
    }

    fn classify_io(&self, error: &std::io::Error) -> ErrorCategory {
        use std::io::ErrorKind;
        match error.kind() {
            ErrorKind::TimedOut => ErrorCategory::Timeout,
            ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
            | ErrorKind::AddrNotAvailable
            | ErrorKind::BrokenPipe => ErrorCategory::Network,
            ErrorKind::PermissionDenied => ErrorCategory::Permission,
            ErrorKind::InvalidInput | ErrorKind::InvalidData => ErrorCategory::Validation,
            ErrorKind::OutOfMemory => ErrorCategory::Resource,
            ErrorKind::NotFound => ErrorCategory::Dependency,
            _ => self.classify_message(&error.to_string()),
        }
    }

    /// Classify free text.
    pub fn classify_message(&self, message: &str) -> ErrorCategory {
        let lower = message.to_lowercase();
        self.patterns
            .iter()
            .find(|(_, re)| re.is_match(&lower))
            .map_or(ErrorCategory::Unknown, |(category, _)| *category)
    }
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::new()
    }
}

/// Delay before retry number `retry_count + 1`: `2^retry_count * base`.
pub fn compute_backoff(base: Duration, retry_count: u32) -> Duration {
    let factor = 2u32.saturating_pow(retry_count);
    base.saturating_mul(factor)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_every_pattern_compiles() {
        for (_, pattern) in PATTERNS {
            Regex::new(pattern).unwrap();
        }
        assert_eq!(ErrorClassifier::new().patterns.len(), PATTERNS.len());
    }

    #[test]
    fn test_default_table() {
        let cases = [
            (ErrorCategory::Network, RecoveryStrategy::Retry, true, 3),
            (ErrorCategory::Timeout, RecoveryStrategy::Retry, true, 2),
            (ErrorCategory::Validation, RecoveryStrategy::ManualIntervention, false, 0),
            (ErrorCategory::Permission, RecoveryStrategy::ManualIntervention, false, 0),
            (ErrorCategory::Dependency, RecoveryStrategy::ManualIntervention, false, 0),
            (ErrorCategory::Resource, RecoveryStrategy::RestartWorker, true, 2),
            (ErrorCategory::WorkerServer, RecoveryStrategy::RestartWorker, true, 2),
            (ErrorCategory::System, RecoveryStrategy::FailFast, false, 0),
            (ErrorCategory::UserInput, RecoveryStrategy::ManualIntervention, false, 0),
            (ErrorCategory::Unknown, RecoveryStrategy::Retry, true, 1),
        ];
        for (category, strategy, recoverable, max_retries) in cases {
            assert_eq!(
                RecoveryPolicy::for_category(category),
                RecoveryPolicy {
                    strategy,
                    recoverable,
                    max_retries
                },
                "{category}"
            );
        }
    }

    #[test]
    fn test_classify_messages() {
        let c = ErrorClassifier::new();
        assert_eq!(c.classify_message("Request timed out after 30s"), ErrorCategory::Timeout);
        assert_eq!(c.classify_message("ECONNREFUSED 127.0.0.1:3100"), ErrorCategory::Network);
        assert_eq!(c.classify_message("Permission denied (os error 13)"), ErrorCategory::Permission);
        assert_eq!(c.classify_message("invalid JSON payload"), ErrorCategory::Validation);
        assert_eq!(c.classify_message("JavaScript heap out of memory"), ErrorCategory::Resource);
        assert_eq!(c.classify_message("worker crashed with signal 11"), ErrorCategory::WorkerServer);
        assert_eq!(c.classify_message("Cannot find module 'sharp'"), ErrorCategory::Dependency);
        assert_eq!(c.classify_message("missing required parameter: url"), ErrorCategory::UserInput);
        assert_eq!(c.classify_message("Segmentation fault"), ErrorCategory::System);
        assert_eq!(c.classify_message("something odd happened"), ErrorCategory::Unknown);
    }

    #[test]
    fn test_word_boundaries() {
        let c = ErrorClassifier::new();
        // "invalidated" is not "invalid", "networking" is not "network"
        assert_eq!(c.classify_message("cache invalidated"), ErrorCategory::Unknown);
        assert_eq!(c.classify_message("networking stack ready"), ErrorCategory::Unknown);
    }

    #[test]
    fn test_order_breaks_ties() {
        let c = ErrorClassifier::new();
        // timeout is checked before network
        assert_eq!(c.classify_message("socket timeout"), ErrorCategory::Timeout);
    }

    #[test]
    fn test_structured_errors_win() {
        let c = ErrorClassifier::new();
        let e = WeftError::categorized(ErrorCategory::System, "timeout while flushing");
        assert_eq!(c.classify(&e), ErrorCategory::System);
        assert_eq!(c.classify(&WeftError::Http("boom".into())), ErrorCategory::Network);
        assert_eq!(c.classify(&WeftError::Timeout("probe".into())), ErrorCategory::Timeout);

        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope");
        assert_eq!(c.classify(&WeftError::Io(io)), ErrorCategory::Permission);

        assert_eq!(
            c.classify(&WeftError::step("connection reset by peer")),
            ErrorCategory::Network
        );
    }

    #[test]
    fn test_backoff_doubles() {
        let base = Duration::from_millis(1000);
        assert_eq!(compute_backoff(base, 0), Duration::from_millis(1000));
        assert_eq!(compute_backoff(base, 1), Duration::from_millis(2000));
        assert_eq!(compute_backoff(base, 3), Duration::from_millis(8000));
        assert_eq!(compute_backoff(Duration::ZERO, 5), Duration::ZERO);
    }
}

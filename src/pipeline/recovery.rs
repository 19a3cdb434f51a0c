//! Error recovery: classify attempt failures and decide what happens next.
//!
//! Structured adapter errors classify by variant. Unstructured failures
//! ([`AgentError::Failed`]) are matched against two regex sets, fatal
//! patterns first. Anything that matches neither is treated as transient:
//! it is retried within the attempt bound and then escalated to a human.

use std::time::Duration;

use anyhow::{Context, Result};
use botarmy_common::{AgentError, ProjectId, RetryPolicy, Stage};
use regex::RegexSet;
use tracing::debug;

use crate::store::{NewFailure, StageFailure, StoreHandle};

pub use crate::store::{DecisionKind, ErrorClass};

pub const DEFAULT_TRANSIENT_PATTERNS: &[&str] = &[
    r"(?i)rate[ _-]?limit",
    r"(?i)too many requests",
    r"\b429\b",
    r"(?i)timed?[ _-]?out",
    r"(?i)connection (reset|refused|closed|aborted)",
    r"(?i)temporar(y|ily) unavailable",
    r"(?i)overloaded",
    r"\b50[234]\b",
];

pub const DEFAULT_FATAL_PATTERNS: &[&str] = &[
    r"(?i)permission denied",
    r"(?i)forbidden",
    r"(?i)unauthori[sz]ed",
    r"\b40[13]\b",
    r"(?i)invalid (input|request|api key|argument)",
    r"(?i)malformed",
    r"(?i)not found",
];

/// An attempt failure after classification.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassifiedError {
    pub class: ErrorClass,
    /// Short machine-readable kind (`rate_limited`, `validation`, ...).
    pub kind: String,
    pub message: String,
    /// Fatal-class failures that may still be retried within the bound.
    pub retryable: bool,
    pub retry_after: Option<Duration>,
}

impl ClassifiedError {
    /// An attempt that never reported back, found when resuming a stage
    /// whose attempt window was already used up.
    pub fn interrupted(last_error: Option<String>) -> Self {
        Self {
            class: ErrorClass::Transient,
            kind: "interrupted".to_string(),
            message: last_error
                .unwrap_or_else(|| "attempt interrupted before reporting a result".to_string()),
            retryable: true,
            retry_after: None,
        }
    }

    /// Rebuild the error behind a recorded failure.
    pub fn from_failure(failure: &StageFailure) -> Self {
        Self {
            class: failure.class,
            kind: failure.error_kind.clone(),
            message: failure.message.clone(),
            retryable: failure.decision != DecisionKind::Abort,
            retry_after: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryDecision {
    Retry(Duration),
    Escalate,
    Abort,
}

impl RecoveryDecision {
    pub fn kind(&self) -> DecisionKind {
        match self {
            RecoveryDecision::Retry(_) => DecisionKind::Retry,
            RecoveryDecision::Escalate => DecisionKind::Escalate,
            RecoveryDecision::Abort => DecisionKind::Abort,
        }
    }

    pub fn delay(&self) -> Option<Duration> {
        match self {
            RecoveryDecision::Retry(delay) => Some(*delay),
            RecoveryDecision::Escalate | RecoveryDecision::Abort => None,
        }
    }
}

pub struct ErrorRecoveryManager {
    transient: RegexSet,
    fatal: RegexSet,
}

impl ErrorRecoveryManager {
    pub fn new<S: AsRef<str>>(transient_patterns: &[S], fatal_patterns: &[S]) -> Result<Self> {
        let transient = RegexSet::new(transient_patterns.iter().map(AsRef::as_ref))
            .context("Invalid transient error pattern")?;
        let fatal = RegexSet::new(fatal_patterns.iter().map(AsRef::as_ref))
            .context("Invalid fatal error pattern")?;
        Ok(Self { transient, fatal })
    }

    pub fn with_default_patterns() -> Result<Self> {
        Self::new(DEFAULT_TRANSIENT_PATTERNS, DEFAULT_FATAL_PATTERNS)
    }

    pub fn classify(&self, error: &AgentError) -> ClassifiedError {
        let (class, retryable) = match error {
            AgentError::Timeout(_) | AgentError::RateLimited { .. } | AgentError::Connection(_) => {
                (ErrorClass::Transient, true)
            }
            AgentError::InvalidInput(_) | AgentError::PermissionDenied(_) => {
                (ErrorClass::Fatal, false)
            }
            AgentError::Validation(_) => (ErrorClass::Fatal, true),
            AgentError::Failed(message) => self.classify_message(message),
        };
        ClassifiedError {
            class,
            kind: error.kind().to_string(),
            message: error.to_string(),
            retryable,
            retry_after: error.retry_after(),
        }
    }

    fn classify_message(&self, message: &str) -> (ErrorClass, bool) {
        if self.fatal.is_match(message) {
            return (ErrorClass::Fatal, false);
        }
        if !self.transient.is_match(message) {
            debug!(message, "unrecognised agent failure, treating as transient");
        }
        (ErrorClass::Transient, true)
    }

    /// Whether `message` matches one of the transient patterns.
    pub fn is_known_transient(&self, message: &str) -> bool {
        self.transient.is_match(message) && !self.fatal.is_match(message)
    }

    /// Decide what follows failed attempt `attempt` (1-based).
    pub fn decide(
        &self,
        stage: Stage,
        attempt: u32,
        error: &ClassifiedError,
        policy: &RetryPolicy,
    ) -> RecoveryDecision {
        let decision = match (error.class, error.retryable) {
            (ErrorClass::Fatal, false) => RecoveryDecision::Abort,
            _ if policy.allows_another(attempt) => {
                let backoff = policy.backoff(attempt);
                let delay = error
                    .retry_after
                    .map_or(backoff, |hint| hint.max(backoff).min(policy.max_delay));
                RecoveryDecision::Retry(delay)
            }
            (ErrorClass::Transient, _) => RecoveryDecision::Escalate,
            (ErrorClass::Fatal, true) => RecoveryDecision::Abort,
        };
        debug!(
            stage = %stage,
            attempt,
            class = %error.class,
            kind = %error.kind,
            decision = %decision.kind(),
            "recovery decision"
        );
        decision
    }

    /// Persist a classified failure together with the decision taken.
    pub async fn record(
        &self,
        store: &StoreHandle,
        project_id: ProjectId,
        stage: Stage,
        attempt: u32,
        error: &ClassifiedError,
        decision: RecoveryDecision,
    ) -> Result<StageFailure> {
        let failure = NewFailure {
            stage,
            attempt,
            class: error.class,
            error_kind: error.kind.clone(),
            message: error.message.clone(),
            decision: decision.kind(),
            retry_delay_ms: decision.delay().map(|d| d.as_millis() as u64),
        };
        store
            .call(move |db| db.record_failure(project_id, &failure))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> ErrorRecoveryManager {
        ErrorRecoveryManager::with_default_patterns().unwrap()
    }

    fn policy() -> RetryPolicy {
        RetryPolicy::default().with_base_delay(Duration::from_millis(100))
    }

    #[test]
    fn test_classifies_structured_errors() {
        let m = manager();
        let transient = [
            AgentError::Timeout(Duration::from_secs(300)),
            AgentError::RateLimited {
                message: "429".into(),
                retry_after: None,
            },
            AgentError::Connection("reset by peer".into()),
        ];
        for err in &transient {
            assert_eq!(m.classify(err).class, ErrorClass::Transient, "{:?}", err);
        }

        let fatal = m.classify(&AgentError::PermissionDenied("no key".into()));
        assert_eq!(fatal.class, ErrorClass::Fatal);
        assert!(!fatal.retryable);

        let validation = m.classify(&AgentError::Validation("missing files".into()));
        assert_eq!(validation.class, ErrorClass::Fatal);
        assert!(validation.retryable);
        assert_eq!(validation.kind, "validation");
    }

    #[test]
    fn test_classifies_unstructured_messages_by_pattern() {
        let m = manager();
        let cases = [
            ("HTTP 429: rate limit exceeded", ErrorClass::Transient),
            ("request timed out", ErrorClass::Transient),
            ("connection reset by peer", ErrorClass::Transient),
            ("service temporarily unavailable (503)", ErrorClass::Transient),
            ("403 Forbidden", ErrorClass::Fatal),
            ("Invalid API key provided", ErrorClass::Fatal),
            ("sh: claude: command not found", ErrorClass::Fatal),
            ("something odd happened", ErrorClass::Transient),
        ];
        for (message, expected) in cases {
            let classified = m.classify(&AgentError::Failed(message.into()));
            assert_eq!(classified.class, expected, "{}", message);
        }
        assert!(m.is_known_transient("rate limit"));
        assert!(!m.is_known_transient("something odd happened"));
    }

    #[test]
    fn test_transient_retries_then_escalates() {
        let m = manager();
        let err = m.classify(&AgentError::RateLimited {
            message: "slow down".into(),
            retry_after: None,
        });
        let p = policy();
        assert_eq!(
            m.decide(Stage::Architecting, 1, &err, &p),
            RecoveryDecision::Retry(Duration::from_millis(100))
        );
        assert_eq!(
            m.decide(Stage::Architecting, 2, &err, &p),
            RecoveryDecision::Retry(Duration::from_millis(200))
        );
        assert_eq!(
            m.decide(Stage::Architecting, 3, &err, &p),
            RecoveryDecision::Escalate
        );
    }

    #[test]
    fn test_fatal_aborts_immediately() {
        let m = manager();
        let err = m.classify(&AgentError::InvalidInput("bad requirement".into()));
        assert_eq!(
            m.decide(Stage::Analyzing, 1, &err, &policy()),
            RecoveryDecision::Abort
        );
    }

    #[test]
    fn test_validation_retries_within_bound_then_aborts() {
        let m = manager();
        let err = m.classify(&AgentError::Validation("missing files".into()));
        let p = policy();
        assert!(matches!(
            m.decide(Stage::Developing, 1, &err, &p),
            RecoveryDecision::Retry(_)
        ));
        assert_eq!(m.decide(Stage::Developing, 3, &err, &p), RecoveryDecision::Abort);
    }

    #[test]
    fn test_retry_after_hint_extends_backoff() {
        let m = manager();
        let err = m.classify(&AgentError::RateLimited {
            message: "slow down".into(),
            retry_after: Some(Duration::from_secs(5)),
        });
        assert_eq!(
            m.decide(Stage::Analyzing, 1, &err, &policy()),
            RecoveryDecision::Retry(Duration::from_secs(5))
        );
    }

    #[test]
    fn test_invalid_pattern_is_an_error() {
        let result = ErrorRecoveryManager::new(&["("], &["x"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_interrupted_attempt_is_transient() {
        let err = ClassifiedError::interrupted(Some("rate limited: 429".into()));
        assert_eq!(err.class, ErrorClass::Transient);
        assert_eq!(err.message, "rate limited: 429");
        assert_eq!(
            ClassifiedError::interrupted(None).kind,
            "interrupted"
        );
    }
}

//! Error taxonomy for the routing pipeline
//!
//! Every failure the pipeline can surface maps to exactly one [`ErrorKind`].
//! Kinds decide two things for the caller: whether the failure is worth a
//! local retry ([`RuntimeError::is_transient`]) and whether it should be
//! rendered as a client-side or server-side problem ([`StatusClass`]).

use serde::Serialize;

/// Stable error classification surfaced to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorKind {
    ConfigurationError,
    ChannelNotFoundError,
    NotFoundError,
    UpstreamError,
    ClassifierError,
    TimeoutError,
    DispatchError,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::ConfigurationError => "ConfigurationError",
            Self::ChannelNotFoundError => "ChannelNotFoundError",
            Self::NotFoundError => "NotFoundError",
            Self::UpstreamError => "UpstreamError",
            Self::ClassifierError => "ClassifierError",
            Self::TimeoutError => "TimeoutError",
            Self::DispatchError => "DispatchError",
        };
        write!(f, "{}", name)
    }
}

/// Whether a failure is the caller's problem (4xx-like) or ours (5xx-like)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusClass {
    Client,
    Server,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum RuntimeError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("channel '{channel_id}' not found")]
    ChannelNotFound { channel_id: String },

    #[error("no routing configuration for channel '{channel_id}'")]
    NotFound { channel_id: String },

    #[error("upstream unavailable: {cause}")]
    Upstream { cause: String, transient: bool },

    #[error("classifier failed: {cause}")]
    Classifier { cause: String, transient: bool },

    #[error("{stage} exceeded the turn deadline")]
    Timeout { stage: String },

    #[error("dispatch to agent '{agent_id}' failed: {cause}")]
    Dispatch {
        agent_id: String,
        cause: String,
        transient: bool,
    },
}

pub type Result<T> = std::result::Result<T, RuntimeError>;

impl RuntimeError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn upstream(cause: impl std::fmt::Display, transient: bool) -> Self {
        Self::Upstream {
            cause: cause.to_string(),
            transient,
        }
    }

    pub fn classifier(cause: impl std::fmt::Display, transient: bool) -> Self {
        Self::Classifier {
            cause: cause.to_string(),
            transient,
        }
    }

    pub fn dispatch(agent_id: &str, cause: impl std::fmt::Display, transient: bool) -> Self {
        Self::Dispatch {
            agent_id: agent_id.to_string(),
            cause: cause.to_string(),
            transient,
        }
    }

    pub fn timeout(stage: impl Into<String>) -> Self {
        Self::Timeout {
            stage: stage.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration(_) => ErrorKind::ConfigurationError,
            Self::ChannelNotFound { .. } => ErrorKind::ChannelNotFoundError,
            Self::NotFound { .. } => ErrorKind::NotFoundError,
            Self::Upstream { .. } => ErrorKind::UpstreamError,
            Self::Classifier { .. } => ErrorKind::ClassifierError,
            Self::Timeout { .. } => ErrorKind::TimeoutError,
            Self::Dispatch { .. } => ErrorKind::DispatchError,
        }
    }

    /// Worth one more attempt after a backoff.
    ///
    /// Deadline expiry is never transient: the caller's budget is spent.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Upstream { transient, .. }
            | Self::Classifier { transient, .. }
            | Self::Dispatch { transient, .. } => *transient,
            Self::Configuration(_)
            | Self::ChannelNotFound { .. }
            | Self::NotFound { .. }
            | Self::Timeout { .. } => false,
        }
    }

    pub fn status_class(&self) -> StatusClass {
        match self {
            Self::ChannelNotFound { .. } | Self::NotFound { .. } => StatusClass::Client,
            _ => StatusClass::Server,
        }
    }
}

/// Classify a free-form provider error message as retryable
/// (rate limit, server error, timeout, connection trouble).
pub fn is_retryable_message(err: &str) -> bool {
    let retryable_patterns = [
        "429",
        "500",
        "502",
        "503",
        "504",
        "rate limit",
        "rate_limit",
        "overloaded",
        "timeout",
        "timed out",
        "connection reset",
        "connection refused",
        "temporarily unavailable",
    ];
    let lower = err.to_lowercase();
    retryable_patterns.iter().any(|p| lower.contains(p))
}

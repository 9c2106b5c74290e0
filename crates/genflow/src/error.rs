use std::fmt;
use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

/// Failure of a single provider call. Recovered by the dispatcher, which
/// moves on to the next provider.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("http {status}: {body}")]
    Http { status: u16, body: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("empty response")]
    EmptyResponse,
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        let e = e.without_url();
        if e.is_timeout() {
            ProviderError::Transport(format!("request timed out: {e}"))
        } else if e.is_decode() {
            ProviderError::Malformed(e.to_string())
        } else {
            ProviderError::Transport(e.to_string())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderFailure {
    pub provider: String,
    pub reason: String,
}

impl fmt::Display for ProviderFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.provider, self.reason)
    }
}

fn join_failures(failures: &[ProviderFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Error)]
pub enum DispatchError {
    /// No provider has a resolvable credential. Raised before any network call.
    #[error("no provider configured")]
    NoProviderConfigured,

    /// Every configured provider was tried and failed, in dispatch order.
    #[error("all providers failed: {}", join_failures(.0))]
    AllProvidersFailed(Vec<ProviderFailure>),
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("invalid prompt: {0}")]
    InvalidPrompt(String),

    #[error("job {0} not found")]
    JobNotFound(Uuid),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

use serde::Serialize;
use thiserror::Error;

/// Failures that cross a component boundary.
///
/// Adapters never return raw errors: whatever goes wrong inside a backend is
/// folded into one of these variants and carried by a `ProviderResult`, a
/// block status or an image summary.
#[derive(Debug, Clone, PartialEq, Error, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum Error {
    #[error("{provider} timed out after {timeout_ms}ms")]
    AdapterTimeout { provider: String, timeout_ms: u64 },

    #[error("{provider} failed: {cause}")]
    AdapterFailure { provider: String, cause: String },

    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    #[error("font reference is empty")]
    EmptyFont,

    #[error("text is empty")]
    EmptyContent,

    #[error("cancelled")]
    Cancelled,

    #[error("render failed: {0}")]
    Render(String),

    #[error("image could not be read: {0}")]
    UnreadableImage(String),

    /// Advisory only: the text did not fit its block even at the smallest size.
    #[error("text overflows its block at {font_size}px")]
    Overflowed { font_size: u32 },
}

impl Error {
    pub fn adapter(provider: impl Into<String>, cause: impl std::fmt::Display) -> Self {
        Error::AdapterFailure {
            provider: provider.into(),
            cause: cause.to_string(),
        }
    }

    pub fn geometry(detail: impl Into<String>) -> Self {
        Error::InvalidGeometry(detail.into())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

/// Convert an infrastructure error chain into an attributed adapter failure.
pub(crate) fn from_anyhow(provider: &str, err: anyhow::Error) -> Error {
    Error::AdapterFailure {
        provider: provider.to_string(),
        cause: format!("{:#}", err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adapter_failure_keeps_context_chain() {
        let err = anyhow::anyhow!("connection reset").context("request failed");
        let converted = from_anyhow("gemini", err);
        assert_eq!(
            converted.to_string(),
            "gemini failed: request failed: connection reset"
        );
    }

    #[test]
    fn serializes_with_kind_tag() {
        let value = serde_json::to_value(Error::Overflowed { font_size: 12 }).unwrap();
        assert_eq!(value["kind"], "overflowed");
        assert_eq!(value["detail"]["font_size"], 12);
    }
}

use thiserror::Error;

/// Failures surfaced by content store operations.
///
/// Retry classification happens on the *display message* (see
/// `retry::should_retry`), so each variant's message is chosen to classify
/// correctly: timeouts say "timeout" and transport failures say "network".
/// Remote rejections repeat whatever the server said, which for
/// infrastructure-level failures tends to contain phrases like
/// "connection reset".
#[derive(Debug, Error)]
pub enum StoreError {
    /// The request was never worth sending (missing id, empty slug, ...).
    /// Never retried.
    #[error("validation error: {0}")]
    Validation(String),

    /// Transport-level failure from the HTTP client.
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// The upload timer won the race against the network call.
    #[error("upload timeout after {ms}ms")]
    Timeout { ms: u64 },

    /// Non-2xx response, with the server-provided message when the body
    /// carried one.
    #[error("remote error (status {status}): {message}")]
    Remote { status: u16, message: String },

    /// A 2xx response whose body did not have the promised shape.
    #[error("unexpected response payload: {0}")]
    Payload(#[from] serde_json::Error),

    /// Local file problem while preparing an upload.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

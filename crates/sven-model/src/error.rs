// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Typed provider-error taxonomy.
//!
//! Drivers classify transport and HTTP failures into [`ModelError`] instead
//! of returning bare `anyhow::Error` strings, so callers (the Agent Loop's
//! error-recovery arm, the Fallback Policy) can dispatch on error *kind*
//! rather than parsing message text.

use reqwest::StatusCode;

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("provider unavailable: {0}")]
    Unavailable(String),
    #[error("authentication failed: {0}")]
    AuthError(String),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("server error: {0}")]
    ServerError(String),
    #[error("context window exceeded")]
    ContextWindowExceeded,
    #[error("guardrail violation: {0}")]
    GuardrailViolation(String),
    #[error("request cancelled")]
    Cancelled,
    #[error("refused: {0}")]
    Refusal(String),
    #[error("concurrent request limit reached")]
    ConcurrentRequest,
    #[error("request timed out")]
    Timeout,
}

impl ModelError {
    /// Kinds the Fallback Policy (C9) retries against the next candidate
    /// provider rather than surfacing or retrying in place.
    pub fn is_fallback_retryable(&self) -> bool {
        matches!(
            self,
            ModelError::RateLimited(_) | ModelError::ServerError(_) | ModelError::Timeout
        )
    }
}

/// Classify a non-2xx HTTP response from a chat-completions-style endpoint.
pub fn classify_http_status(driver: &str, status: StatusCode, body: &str) -> ModelError {
    let detail = format!("{driver} error {status}: {body}");
    match status.as_u16() {
        401 | 403 => ModelError::AuthError(detail),
        408 => ModelError::Timeout,
        429 => ModelError::RateLimited(detail),
        500..=599 => ModelError::ServerError(detail),
        _ => ModelError::ServerError(detail),
    }
}

/// Classify a transport-level `reqwest::Error` (the request never completed
/// or the connection dropped mid-stream).
pub fn classify_transport_error(driver: &str, e: &reqwest::Error) -> ModelError {
    if e.is_timeout() {
        ModelError::Timeout
    } else if e.is_connect() {
        ModelError::Unavailable(format!("{driver}: {e}"))
    } else {
        ModelError::ServerError(format!("{driver} request failed: {e}"))
    }
}

// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Retry policy for calls into [`crate::ModelProvider`].
//!
//! Providers surface failures as a plain `anyhow::Error` (network errors,
//! non-2xx HTTP responses, malformed streaming bodies). This module
//! classifies that error into a [`ProviderError`] and applies the matching
//! backoff so callers don't have to hand-roll retry loops per driver.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

/// A classified provider failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderError {
    /// Connection refused, DNS failure, timed-out request, or an HTTP 503 --
    /// transient conditions where the same request is likely to succeed a
    /// moment later.
    Transport,
    /// The response body could not be parsed as the expected JSON/SSE shape.
    /// Usually a truncated stream or a provider returning an HTML error page
    /// under a 200 status; retrying unchanged rarely helps, but a short
    /// linear backoff absorbs one-off hiccups without amplifying load.
    Parse,
    /// A non-2xx HTTP response with a specific status code.
    Http { status: u16 },
    /// The call was cancelled by the caller (user interrupt). Never retried.
    Aborted,
}

impl ProviderError {
    /// Classify a raw error message using the provider-agnostic signals
    /// drivers already put in their bail!()/anyhow! messages: an HTTP status
    /// code ("... error 503: ..."), a reqwest transport failure, or a JSON
    /// decode failure.
    pub fn classify(err: &anyhow::Error) -> Self {
        let msg = err.to_string();

        if let Some(status) = extract_status_code(&msg) {
            return ProviderError::Http { status };
        }
        if err.downcast_ref::<reqwest::Error>().is_some() {
            return ProviderError::Transport;
        }
        if err.downcast_ref::<serde_json::Error>().is_some()
            || msg.contains("expected value")
            || msg.contains("EOF while parsing")
        {
            return ProviderError::Parse;
        }
        if msg.contains("cancelled") || msg.contains("aborted") {
            return ProviderError::Aborted;
        }
        ProviderError::Transport
    }

    /// Whether this failure should be retried at all.
    fn is_retryable(self) -> bool {
        match self {
            ProviderError::Transport => true,
            ProviderError::Parse => true,
            ProviderError::Aborted => false,
            ProviderError::Http { status } => matches!(status, 503 | 429),
        }
    }

    /// Backoff delay before attempt number `attempt` (1-based: the delay
    /// before the *second* try).
    fn backoff(self, attempt: u32) -> Duration {
        match self {
            ProviderError::Transport | ProviderError::Http { .. } => {
                // Exponential: 500ms, 1s, 2s, 4s, capped at 8s.
                let millis = 500u64.saturating_mul(1u64 << attempt.min(4));
                Duration::from_millis(millis.min(8_000))
            }
            ProviderError::Parse => {
                // Linear: 200ms, 400ms, 600ms.
                Duration::from_millis(200 * attempt as u64)
            }
            ProviderError::Aborted => Duration::ZERO,
        }
    }
}

fn extract_status_code(msg: &str) -> Option<u16> {
    let idx = msg.find("error ")?;
    let rest = &msg[idx + "error ".len()..];
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.len() == 3 {
        digits.parse().ok()
    } else {
        None
    }
}

/// Retry policy: how many attempts, and which classes of error to retry.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts including the first (non-retry) call.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 3 }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
        }
    }

    /// Run `op` up to `max_attempts` times, classifying and backing off
    /// between retryable failures. Returns the last error if every attempt
    /// is exhausted, or immediately on a non-retryable classification.
    pub async fn with_retries<T, F, Fut>(&self, mut op: F) -> anyhow::Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) => {
                    let classified = ProviderError::classify(&e);
                    attempt += 1;
                    if !classified.is_retryable() || attempt >= self.max_attempts {
                        return Err(e);
                    }
                    let delay = classified.backoff(attempt);
                    warn!(
                        attempt,
                        max_attempts = self.max_attempts,
                        ?classified,
                        delay_ms = delay.as_millis() as u64,
                        "provider call failed, retrying: {e}"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

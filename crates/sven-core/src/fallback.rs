// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Fallback Policy: an ordered list of secondary model providers consulted
//! when the primary model fails with a retryable error (rate limit, server
//! error, timeout).
//!
//! Each attempt rebuilds the completion request against the next candidate
//! in order — tool schemas and prompt formatting can differ across
//! providers, so the request is never reused verbatim.  Exhausting every
//! candidate re-raises the *original* error from the primary model, not the
//! last fallback's error, so the caller sees the failure that actually
//! matters.

use std::sync::Arc;

/// Ordered fallback candidates plus the attempt budget.  An empty policy
/// (the default for sub-agents) means no failover is attempted.
#[derive(Clone, Default)]
pub struct FallbackPolicy {
    candidates: Vec<Arc<dyn sven_model::ModelProvider>>,
    max_attempts: u32,
}

impl FallbackPolicy {
    pub fn new(candidates: Vec<Arc<dyn sven_model::ModelProvider>>, max_attempts: u32) -> Self {
        Self {
            candidates,
            max_attempts,
        }
    }

    /// No fallback candidates — used for sub-agents (`TaskTool`) which stay
    /// scoped to their single assigned model.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    /// The candidate to try for a given zero-based attempt number, bounded by
    /// `max_attempts` and the number of configured candidates.
    pub fn candidate(&self, attempt: u32) -> Option<&Arc<dyn sven_model::ModelProvider>> {
        if attempt >= self.max_attempts {
            return None;
        }
        self.candidates.get(attempt as usize)
    }
}

// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Unified error types for Blattwerk.

use thiserror::Error;

use crate::types::RunId;

/// Top-level error type for all Blattwerk operations.
#[derive(Debug, Error)]
pub enum BlattwerkError {
    // -- Pipeline stage errors --
    #[error("corpus scan failed: {0}")]
    Scan(String),

    #[error("corpus analysis failed: {0}")]
    Analysis(String),

    #[error("page normalization failed: {0}")]
    Normalization(String),

    #[error("image processing failed: {0}")]
    Image(String),

    // -- Run lifecycle --
    #[error("a run is already active: {0}")]
    RunActive(RunId),

    #[error("unknown run id: {0}")]
    UnknownRun(RunId),

    #[error("run cancelled")]
    Cancelled,

    // -- Storage / persistence --
    #[error("run index error: {0}")]
    Index(String),

    #[error("run artifact error: {0}")]
    Artifact(String),

    #[error("file I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, BlattwerkError>;

/// Whether an error was caused by cooperative cancellation rather than a
/// genuine failure. Matches the typed `Cancelled` variant first, then falls
/// back to a message pattern for errors that crossed a string boundary
/// (join errors, collaborator messages).
pub fn is_abort_error(err: &BlattwerkError) -> bool {
    if matches!(err, BlattwerkError::Cancelled) {
        return true;
    }
    let message = err.to_string().to_ascii_lowercase();
    message.contains("cancel") || message.contains("abort")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancelled_variant_is_abort() {
        assert!(is_abort_error(&BlattwerkError::Cancelled));
    }

    #[test]
    fn message_pattern_is_abort() {
        assert!(is_abort_error(&BlattwerkError::Scan(
            "task aborted mid-stage".into()
        )));
        assert!(is_abort_error(&BlattwerkError::Normalization(
            "worker observed cancellation".into()
        )));
    }

    #[test]
    fn genuine_failure_is_not_abort() {
        assert!(!is_abort_error(&BlattwerkError::Scan(
            "root directory unreadable".into()
        )));
    }
}

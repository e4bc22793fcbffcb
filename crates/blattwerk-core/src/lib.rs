// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Blattwerk — Core types, error definitions, and settings shared across all crates.

pub mod error;
pub mod settings;
pub mod types;

pub use error::BlattwerkError;
pub use settings::{PipelineSettings, RetryPolicy};
pub use types::*;

// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Blattwerk — Per-page normalization engine. Consumes the pixel primitives
// plus a page's bounds estimate and produces geometry, correction, and
// quality statistics for one page.

pub mod dpi;
pub mod geometry;
pub mod normalize;
pub mod shading;

pub use dpi::{DpiResolution, resolve_dpi};
pub use geometry::{GeometryOutcome, median_trim_box, resolve_geometry};
pub use normalize::normalize_page;

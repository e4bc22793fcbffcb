// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Blattwerk Pipeline — run orchestration over the normalization engine.
// Scans a corpus, analyzes it into a summary, normalizes pages on a bounded
// worker pool, and aggregates the results, with a persistent run index,
// mirrored status artifacts, and throttled progress events.

pub mod artifacts;
pub mod index;
pub mod manager;
pub mod progress;
pub mod runner;
pub mod traits;

pub use artifacts::{ReviewEntry, ReviewQueue, RunManifest, RunPaths, RunReport};
pub use index::RunIndexStore;
pub use manager::RunManager;
pub use progress::ProgressBroker;
pub use runner::{
    InferredDimensions, PauseGate, PipelineRunner, RunCompletion, RunError, RunOutcome,
};
pub use traits::{
    CorpusAnalyzer, CorpusScanner, EdgeAnalyzer, FsScanner, ImageNormalizer, PageNormalizer,
};


/// Manager wired with the production scanner, analyzer, and normalizer.
pub type ProductionRunManager = RunManager<FsScanner, EdgeAnalyzer, ImageNormalizer>;

impl ProductionRunManager {
    pub fn with_defaults(
        output_dir: impl AsRef<std::path::Path>,
        settings: blattwerk_core::settings::PipelineSettings,
    ) -> Self {
        RunManager::new(
            output_dir,
            FsScanner,
            EdgeAnalyzer,
            ImageNormalizer,
            settings,
        )
    }
}

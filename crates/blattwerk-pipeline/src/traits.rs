// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Collaborator seams for the pipeline runner.
//
// Scan and analysis are async (they may talk to devices or remote stores in
// other deployments); normalization is synchronous and CPU-bound, so the
// runner wraps it in `spawn_blocking`. Tests substitute stubs at these seams
// to exercise retry, fallback, and partial-failure paths deterministically.

use std::future::Future;
use std::path::Path;

use tracing::{debug, instrument, warn};

use blattwerk_core::error::{BlattwerkError, Result};
use blattwerk_core::settings::PipelineSettings;
use blattwerk_core::types::{
    CorpusSummary, NormalizationResult, PageBoundsEstimate, PageSource, PixelBox, RunConfig,
};
use blattwerk_normalize::normalize_page;
use blattwerk_primitives::default_kernel;

/// Discovers and validates the page sources for a run, turning a run request
/// plus a project root into the resolved `RunConfig` the pipeline executes.
pub trait CorpusScanner: Send + Sync {
    fn scan(
        &self,
        root: &Path,
        request: &RunConfig,
    ) -> impl Future<Output = Result<RunConfig>> + Send;
}

/// Produces the corpus-level summary (target dims, per-page bounds estimates).
pub trait CorpusAnalyzer: Send + Sync {
    fn analyze(
        &self,
        config: &RunConfig,
        pages: &[PageSource],
    ) -> impl Future<Output = Result<CorpusSummary>> + Send;
}

/// Normalizes a single page. Synchronous and CPU-bound; callers move
/// invocations onto the blocking pool.
pub trait PageNormalizer: Send + Sync {
    fn normalize(
        &self,
        page: &PageSource,
        estimate: Option<&PageBoundsEstimate>,
        summary: &CorpusSummary,
        book_prior: Option<&PixelBox>,
        run_dir: &Path,
        settings: &PipelineSettings,
    ) -> Result<NormalizationResult>;
}

// -- Production implementations -----------------------------------------------

/// Scanner over a project directory on disk.
///
/// A request that already names its pages is validated (relative paths
/// resolved against the root); a request with no pages discovers every image
/// file directly under the root, ordered by file name.
#[derive(Debug, Clone, Default)]
pub struct FsScanner;

impl FsScanner {
    const IMAGE_EXTENSIONS: [&'static str; 5] = ["png", "jpg", "jpeg", "tif", "tiff"];

    fn is_image_file(path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| {
                let ext = ext.to_ascii_lowercase();
                Self::IMAGE_EXTENSIONS.iter().any(|known| *known == ext)
            })
    }

    async fn discover(root: &Path) -> Result<Vec<PageSource>> {
        let mut dir = tokio::fs::read_dir(root)
            .await
            .map_err(|err| BlattwerkError::Scan(format!("read {}: {err}", root.display())))?;
        let mut pages = Vec::new();
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|err| BlattwerkError::Scan(format!("read {}: {err}", root.display())))?
        {
            let path = entry.path();
            if !path.is_file() || !Self::is_image_file(&path) {
                continue;
            }
            let file_name = entry.file_name().to_string_lossy().into_owned();
            let id = path
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_else(|| file_name.clone());
            pages.push(PageSource {
                id,
                file_name,
                source_path: path,
                metadata_dpi: None,
                confidence: Default::default(),
            });
        }
        pages.sort_by(|a, b| a.file_name.cmp(&b.file_name));
        if pages.is_empty() {
            return Err(BlattwerkError::Scan(format!(
                "no page images found under {}",
                root.display()
            )));
        }
        Ok(pages)
    }
}

impl CorpusScanner for FsScanner {
    #[instrument(skip_all, fields(root = %root.display(), requested = request.pages.len()))]
    async fn scan(&self, root: &Path, request: &RunConfig) -> Result<RunConfig> {
        let mut config = request.clone();
        if config.pages.is_empty() {
            config.pages = Self::discover(root).await?;
        } else {
            for page in &mut config.pages {
                if page.source_path.is_relative() {
                    page.source_path = root.join(&page.source_path);
                }
                if !page.source_path.is_file() {
                    return Err(BlattwerkError::Scan(format!(
                        "missing source file for page {}: {}",
                        page.id,
                        page.source_path.display()
                    )));
                }
            }
        }
        debug!(pages = config.pages.len(), "corpus scan complete");
        Ok(config)
    }
}

/// Analyzer that decodes every page and derives bounds estimates from edge
/// energy. Runs on the blocking pool since decoding is CPU-bound.
#[derive(Debug, Clone, Default)]
pub struct EdgeAnalyzer;

impl EdgeAnalyzer {
    /// Margin used to expand detected content into a page-bounds estimate,
    /// as a fraction of the smaller image dimension.
    const PAGE_MARGIN_FRACTION: f64 = 0.03;

    fn estimate_page(page: &PageSource) -> Result<PageBoundsEstimate> {
        let gray = image::open(&page.source_path)
            .map_err(|err| {
                BlattwerkError::Analysis(format!(
                    "failed to decode {}: {err}",
                    page.source_path.display()
                ))
            })?
            .to_luma8();
        let (width, height) = gray.dimensions();
        if width == 0 || height == 0 {
            return Err(BlattwerkError::Analysis(format!("empty image: {}", page.id)));
        }

        let kernel = default_kernel();
        let frame = PixelBox::new(0, 0, width, height);
        let content = blattwerk_normalize::geometry::detect_content_bounds(
            kernel,
            gray.as_raw(),
            width as usize,
            height as usize,
        );

        let margin = ((width.min(height) as f64) * Self::PAGE_MARGIN_FRACTION).round() as u32;
        let page_bounds = PixelBox::new(
            content.x.saturating_sub(margin),
            content.y.saturating_sub(margin),
            content.width + 2 * margin,
            content.height + 2 * margin,
        )
        .clamp_to(&frame);

        Ok(PageBoundsEstimate {
            page_id: page.id.clone(),
            width_px: width,
            height_px: height,
            bleed_px: margin / 2,
            trim_px: margin,
            page_bounds,
            content_bounds: content.clamp_to(&frame),
        })
    }
}

impl CorpusAnalyzer for EdgeAnalyzer {
    #[instrument(skip_all, fields(project_id = %config.project_id, pages = pages.len()))]
    async fn analyze(&self, config: &RunConfig, pages: &[PageSource]) -> Result<CorpusSummary> {
        let config = config.clone();
        let pages = pages.to_vec();
        tokio::task::spawn_blocking(move || {
            let mut estimates = Vec::with_capacity(pages.len());
            for page in &pages {
                match Self::estimate_page(page) {
                    Ok(estimate) => estimates.push(estimate),
                    // A page that cannot be analyzed still gets normalized
                    // later without an estimate.
                    Err(err) => warn!(page_id = %page.id, "page analysis skipped: {err}"),
                }
            }
            if estimates.is_empty() {
                return Err(BlattwerkError::Analysis(
                    "no page could be analyzed".into(),
                ));
            }
            let mut summary = CorpusSummary::fallback(&config);
            summary.page_count = pages.len();
            summary.estimates = estimates;
            summary.notes = None;
            Ok(summary)
        })
        .await
        .map_err(|err| BlattwerkError::Analysis(format!("analysis task failed: {err}")))?
    }
}

/// Production normalizer backed by the image normalization engine.
#[derive(Debug, Clone, Default)]
pub struct ImageNormalizer;

impl PageNormalizer for ImageNormalizer {
    fn normalize(
        &self,
        page: &PageSource,
        estimate: Option<&PageBoundsEstimate>,
        summary: &CorpusSummary,
        book_prior: Option<&PixelBox>,
        run_dir: &Path,
        settings: &PipelineSettings,
    ) -> Result<NormalizationResult> {
        normalize_page(page, estimate, summary, book_prior, run_dir, settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    fn page(id: &str, path: PathBuf) -> PageSource {
        PageSource {
            id: id.into(),
            file_name: format!("{id}.png"),
            source_path: path,
            metadata_dpi: None,
            confidence: BTreeMap::new(),
        }
    }

    fn config(pages: Vec<PageSource>) -> RunConfig {
        RunConfig {
            project_id: "test".into(),
            pages,
            target_dpi: 300.0,
            target_width_mm: 210.0,
            target_height_mm: 297.0,
        }
    }

    #[tokio::test]
    async fn fs_scanner_rejects_missing_files() {
        let tmp = tempfile::TempDir::new().expect("tempdir");
        let cfg = config(vec![page("p1", PathBuf::from("/nonexistent/p1.png"))]);
        let err = FsScanner
            .scan(tmp.path(), &cfg)
            .await
            .expect_err("missing file");
        assert!(matches!(err, BlattwerkError::Scan(_)));
    }

    #[tokio::test]
    async fn fs_scanner_resolves_relative_paths_against_the_root() {
        let tmp = tempfile::TempDir::new().expect("tempdir");
        tokio::fs::write(tmp.path().join("p1.png"), b"stub")
            .await
            .expect("fixture");

        let cfg = config(vec![page("p1", PathBuf::from("p1.png"))]);
        let resolved = FsScanner.scan(tmp.path(), &cfg).await.expect("scan");
        assert_eq!(resolved.pages[0].source_path, tmp.path().join("p1.png"));
    }

    #[tokio::test]
    async fn fs_scanner_discovers_pages_in_file_name_order() {
        let tmp = tempfile::TempDir::new().expect("tempdir");
        for name in ["b.png", "a.png", "notes.txt"] {
            tokio::fs::write(tmp.path().join(name), b"stub")
                .await
                .expect("fixture");
        }

        let resolved = FsScanner
            .scan(tmp.path(), &config(Vec::new()))
            .await
            .expect("scan");
        let names: Vec<_> = resolved.pages.iter().map(|p| p.file_name.as_str()).collect();
        assert_eq!(names, vec!["a.png", "b.png"]);
        assert_eq!(resolved.pages[0].id, "a");
    }

    #[tokio::test]
    async fn fs_scanner_rejects_a_pageless_root() {
        let tmp = tempfile::TempDir::new().expect("tempdir");
        let err = FsScanner
            .scan(tmp.path(), &config(Vec::new()))
            .await
            .expect_err("empty root");
        assert!(matches!(err, BlattwerkError::Scan(_)));
    }

    #[tokio::test]
    async fn edge_analyzer_estimates_bounds_for_real_pages() {
        let tmp = tempfile::TempDir::new().expect("tempdir");
        let img = image::GrayImage::from_fn(200, 283, |x, y| {
            if x > 40 && x < 160 && y > 40 && y < 240 {
                image::Luma([40u8])
            } else {
                image::Luma([230u8])
            }
        });
        let path = tmp.path().join("p1.png");
        img.save(&path).expect("write fixture");

        let pages = vec![page("p1", path)];
        let cfg = config(pages.clone());
        let summary = EdgeAnalyzer.analyze(&cfg, &pages).await.expect("analyze");

        assert_eq!(summary.page_count, 1);
        assert_eq!(summary.estimates.len(), 1);
        assert!(summary.notes.is_none());
        let estimate = &summary.estimates[0];
        assert!(estimate.page_bounds.contains(&estimate.content_bounds));
        assert!(estimate.content_bounds.width < 200);
    }

    #[tokio::test]
    async fn edge_analyzer_fails_when_nothing_decodes() {
        let pages = vec![page("p1", PathBuf::from("/nonexistent/p1.png"))];
        let cfg = config(pages.clone());
        let err = EdgeAnalyzer
            .analyze(&cfg, &pages)
            .await
            .expect_err("nothing decodable");
        assert!(matches!(err, BlattwerkError::Analysis(_)));
    }
}

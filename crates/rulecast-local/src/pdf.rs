//! Two-stage rulebook PDF ingestion: text-layer extraction first, OCR
//! fallback when the text layer is missing or untrustworthy.
//!
//! OCR temp directories are scoped: they are released on success, error,
//! and cancel alike, and their names carry a per-call counter so parallel
//! ingests never collide.

use crate::shellout;
use rulecast_core::{
    Error, IngestHeuristics, OcrEngine, OcrUsage, PageTextSource, ParsedPage, Result, TocInfo,
};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

static OCR_CALL: AtomicU64 = AtomicU64::new(0);

const TOC_MARKERS: &[&str] = &[
    "table of contents",
    "índice",
    "sommaire",
    "inhaltsverzeichnis",
];

#[derive(Clone)]
pub struct PdfIngestOptions {
    /// Pages below this primary-parse confidence get the OCR treatment.
    pub ocr_threshold: f64,
    /// Rasterizer binary name; `None` disables the OCR fallback entirely.
    pub rasterizer: Option<String>,
    /// In-process OCR worker used when no `tesseract` binary exists.
    pub ocr_worker: Option<Arc<dyn OcrEngine>>,
    /// Pages with fewer characters than this count as low-text.
    pub low_text_threshold: usize,
}

impl Default for PdfIngestOptions {
    fn default() -> Self {
        Self {
            ocr_threshold: 0.5,
            rasterizer: Some("pdftoppm".to_string()),
            ocr_worker: None,
            low_text_threshold: 200,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PdfIngest {
    /// Strictly ordered by page number.
    pub pages: Vec<ParsedPage>,
    pub ocr: OcrUsage,
    pub heuristics: IngestHeuristics,
    pub warnings: Vec<&'static str>,
}

pub struct PdfIngestor {
    opts: PdfIngestOptions,
}

impl PdfIngestor {
    pub fn new(opts: PdfIngestOptions) -> Self {
        Self { opts }
    }

    pub async fn ingest(&self, path: &Path, cancel: &CancellationToken) -> Result<PdfIngest> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| Error::PdfUnreadable(format!("{}: {e}", path.display())))?;

        let mut warnings: Vec<&'static str> = Vec::new();
        let primary = tokio::task::spawn_blocking(move || pdf_to_text_guarded(&bytes))
            .await
            .map_err(|e| Error::PdfUnreadable(format!("extract task failed: {e}")))?;

        let mut pages = match primary {
            Ok(text) => split_pages(&text),
            Err(msg) => {
                tracing::warn!(path = %path.display(), "primary pdf extraction failed: {msg}");
                warnings.push("pdf_primary_extract_failed");
                Vec::new()
            }
        };

        let mut ocr = OcrUsage::default();
        let doc_has_text = pages.iter().any(|p| !p.text.trim().is_empty());

        if !doc_has_text {
            self.ocr_document(path, &mut pages, &mut ocr, &mut warnings, cancel)
                .await?;
        } else {
            let low: Vec<u32> = pages
                .iter()
                .filter(|p| p.confidence < self.opts.ocr_threshold)
                .map(|p| p.page_number)
                .collect();
            for page_number in low {
                self.ocr_page(path, page_number, &mut pages, &mut ocr, &mut warnings, cancel)
                    .await?;
            }
        }

        let heuristics = compute_heuristics(&pages, self.opts.low_text_threshold);
        Ok(PdfIngest {
            pages,
            ocr,
            heuristics,
            warnings,
        })
    }

    fn ocr_backends(&self) -> (bool, bool) {
        let raster_ok = self
            .opts
            .rasterizer
            .as_deref()
            .map(shellout::has)
            .unwrap_or(false);
        let engine_ok = shellout::has("tesseract") || self.opts.ocr_worker.is_some();
        (raster_ok, engine_ok)
    }

    async fn ocr_document(
        &self,
        path: &Path,
        pages: &mut Vec<ParsedPage>,
        ocr: &mut OcrUsage,
        warnings: &mut Vec<&'static str>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let texts = match self.ocr_range(path, None, cancel).await? {
            Some(t) => t,
            None => {
                ocr.unavailable = true;
                warnings.push("ocr_unavailable");
                return Ok(());
            }
        };
        *pages = texts
            .into_iter()
            .enumerate()
            .map(|(i, text)| {
                let confidence = if text.trim().is_empty() { 0.0 } else { 0.7 };
                ParsedPage {
                    page_number: (i + 1) as u32,
                    text,
                    confidence,
                    source: PageTextSource::Ocr,
                }
            })
            .collect();
        ocr.used = true;
        ocr.pages = pages.iter().map(|p| p.page_number).collect();
        Ok(())
    }

    async fn ocr_page(
        &self,
        path: &Path,
        page_number: u32,
        pages: &mut [ParsedPage],
        ocr: &mut OcrUsage,
        warnings: &mut Vec<&'static str>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let texts = match self
            .ocr_range(path, Some((page_number, page_number)), cancel)
            .await?
        {
            Some(t) => t,
            None => {
                ocr.unavailable = true;
                if !warnings.contains(&"ocr_unavailable") {
                    warnings.push("ocr_unavailable");
                }
                return Ok(());
            }
        };
        let text = texts.join("\n");
        if text.trim().is_empty() {
            return Ok(());
        }
        if let Some(p) = pages.iter_mut().find(|p| p.page_number == page_number) {
            p.text = text;
            p.confidence = 0.7;
            p.source = PageTextSource::Ocr;
            ocr.used = true;
            ocr.pages.push(page_number);
        }
        Ok(())
    }

    /// Rasterize a page range and OCR every produced PNG, in order.
    /// `Ok(None)` means no OCR path is available at all.
    async fn ocr_range(
        &self,
        path: &Path,
        range: Option<(u32, u32)>,
        cancel: &CancellationToken,
    ) -> Result<Option<Vec<String>>> {
        let (raster_ok, engine_ok) = self.ocr_backends();
        if !raster_ok || !engine_ok {
            return Ok(None);
        }
        let rasterizer = self
            .opts
            .rasterizer
            .clone()
            .unwrap_or_else(|| "pdftoppm".to_string());

        let call = OCR_CALL.fetch_add(1, Ordering::Relaxed);
        let tmp = tempfile::Builder::new()
            .prefix(&format!("rulecast-ocr-{call}-"))
            .tempdir()
            .map_err(|e| Error::PdfUnreadable(format!("ocr tempdir: {e}")))?;

        let pngs = {
            let pdf = path.to_path_buf();
            let dir = tmp.path().to_path_buf();
            let cancel = cancel.clone();
            tokio::task::spawn_blocking(move || {
                shellout::rasterize_pdf_pages(&rasterizer, &pdf, range, &dir, &cancel)
            })
            .await
            .map_err(|e| Error::PdfUnreadable(format!("rasterize task failed: {e}")))?
        };
        let pngs = match pngs {
            Ok(p) => p,
            Err("shellout_canceled") => return Err(Error::Canceled),
            Err(msg) => {
                tracing::warn!("rasterization failed: {msg}");
                return Ok(None);
            }
        };

        let mut texts = Vec::with_capacity(pngs.len());
        for png in pngs {
            if cancel.is_cancelled() {
                return Err(Error::Canceled);
            }
            let text = if shellout::has("tesseract") {
                let cancel2 = cancel.clone();
                let r = tokio::task::spawn_blocking(move || {
                    shellout::tesseract_png(&png, &cancel2)
                })
                .await
                .map_err(|e| Error::PdfUnreadable(format!("ocr task failed: {e}")))?;
                match r {
                    Ok(t) => t,
                    Err("shellout_canceled") => return Err(Error::Canceled),
                    Err(_) => String::new(),
                }
            } else if let Some(worker) = &self.opts.ocr_worker {
                let bytes = tokio::fs::read(&png)
                    .await
                    .map_err(|e| Error::PdfUnreadable(format!("ocr png read: {e}")))?;
                worker.recognize_png(&bytes).await.unwrap_or_default()
            } else {
                String::new()
            };
            texts.push(text);
        }
        // tmp dropped here: rasterized pages are cleaned up on every path.
        Ok(Some(texts))
    }
}

fn pdf_to_text_guarded(bytes: &[u8]) -> std::result::Result<String, String> {
    // pdf-extract has panicked on malformed PDFs; contain it so one bad
    // rulebook cannot take down the pipeline.
    match std::panic::catch_unwind(|| pdf_extract::extract_text_from_mem(bytes)) {
        Ok(inner) => inner.map_err(|e| e.to_string()),
        Err(_) => Err("pdf_extract_panicked".to_string()),
    }
}

/// Split a whole-document blob on form feeds into 1-based pages.
/// Confidence is 1.0 exactly when the page has any text.
pub fn split_pages(text: &str) -> Vec<ParsedPage> {
    let mut parts: Vec<&str> = text.split('\u{000C}').collect();
    // A trailing form feed produces one empty phantom segment; drop it.
    if parts.len() > 1 && parts.last().map(|s| s.trim().is_empty()) == Some(true) {
        parts.pop();
    }
    parts
        .into_iter()
        .enumerate()
        .map(|(i, part)| {
            let text = part.trim().to_string();
            let confidence = if text.is_empty() { 0.0 } else { 1.0 };
            ParsedPage {
                page_number: (i + 1) as u32,
                text,
                confidence,
                source: PageTextSource::Parser,
            }
        })
        .collect()
}

fn compute_heuristics(pages: &[ParsedPage], low_text_threshold: usize) -> IngestHeuristics {
    let pages_with_low_text_ratio = pages
        .iter()
        .filter(|p| p.text.chars().count() < low_text_threshold)
        .map(|p| p.page_number)
        .collect();

    let full_text_lc = pages
        .iter()
        .map(|p| p.text.to_lowercase())
        .collect::<Vec<_>>()
        .join("\n");
    let components_detected =
        full_text_lc.contains("components") || full_text_lc.contains("contents of the box");

    let toc = pages.iter().find_map(|p| {
        let lc = p.text.to_lowercase();
        TOC_MARKERS.iter().any(|m| lc.contains(m)).then(|| TocInfo {
            page_number: p.page_number,
            excerpt: p.text.chars().take(500).collect(),
        })
    });

    IngestHeuristics {
        pages_with_low_text_ratio,
        components_detected,
        toc,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_pages_numbers_and_scores() {
        let pages = split_pages("First page text\u{000C}\u{000C}Third page");
        assert_eq!(pages.len(), 3);
        assert_eq!(pages[0].page_number, 1);
        assert_eq!(pages[0].confidence, 1.0);
        assert_eq!(pages[1].text, "");
        assert_eq!(pages[1].confidence, 0.0);
        assert_eq!(pages[2].page_number, 3);
        assert!(pages.iter().all(|p| p.source == PageTextSource::Parser));
    }

    #[test]
    fn split_pages_drops_trailing_formfeed_phantom() {
        let pages = split_pages("Only page\u{000C}");
        assert_eq!(pages.len(), 1);
    }

    #[test]
    fn single_blob_is_one_page() {
        let pages = split_pages("no form feeds here");
        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0].page_number, 1);
    }

    #[test]
    fn heuristics_flag_low_text_components_and_toc() {
        let long = "x".repeat(300);
        let pages = vec![
            ParsedPage {
                page_number: 1,
                text: format!("Table of Contents\n1. Setup ... 2\n{long}"),
                confidence: 1.0,
                source: PageTextSource::Parser,
            },
            ParsedPage {
                page_number: 2,
                text: "Components: 19 hexes, 6 frames".to_string(),
                confidence: 1.0,
                source: PageTextSource::Parser,
            },
            ParsedPage {
                page_number: 3,
                text: String::new(),
                confidence: 0.0,
                source: PageTextSource::Parser,
            },
        ];
        let h = compute_heuristics(&pages, 200);
        assert_eq!(h.pages_with_low_text_ratio, vec![2, 3]);
        assert!(h.components_detected);
        let toc = h.toc.unwrap();
        assert_eq!(toc.page_number, 1);
        assert!(toc.excerpt.starts_with("Table of Contents"));
        assert!(toc.excerpt.chars().count() <= 500);
    }

    #[test]
    fn toc_markers_are_multilingual() {
        let pages = vec![ParsedPage {
            page_number: 4,
            text: "Índice\n1. Preparación".to_string(),
            confidence: 1.0,
            source: PageTextSource::Parser,
        }];
        let h = compute_heuristics(&pages, 10);
        assert_eq!(h.toc.unwrap().page_number, 4);
    }

    #[tokio::test]
    async fn missing_file_is_pdf_unreadable() {
        let ing = PdfIngestor::new(PdfIngestOptions::default());
        let err = ing
            .ingest(
                Path::new("/definitely/not/a/file.pdf"),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "INGEST_PDF_UNREADABLE");
    }

    #[tokio::test]
    async fn unextractable_pdf_without_ocr_backends_records_unavailable() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("garbage.pdf");
        std::fs::write(&path, b"%PDF-1.4 not really a pdf at all").unwrap();

        let ing = PdfIngestor::new(PdfIngestOptions {
            rasterizer: Some("definitely-not-a-real-binary-xyz".to_string()),
            ocr_worker: None,
            ..PdfIngestOptions::default()
        });
        let out = ing.ingest(&path, &CancellationToken::new()).await.unwrap();
        assert!(out.ocr.unavailable);
        assert!(out.warnings.contains(&"ocr_unavailable"));
        assert!(out.pages.iter().all(|p| p.text.is_empty()));
    }

    #[tokio::test]
    async fn disabled_rasterizer_means_no_ocr_path() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("garbage.pdf");
        std::fs::write(&path, b"%PDF-1.4 still not a pdf").unwrap();

        let ing = PdfIngestor::new(PdfIngestOptions {
            rasterizer: None,
            ..PdfIngestOptions::default()
        });
        let out = ing.ingest(&path, &CancellationToken::new()).await.unwrap();
        assert!(out.ocr.unavailable);
        assert!(!out.ocr.used);
    }
}

//! Line Recognizer
//!
//! Runs OCR on individual line strips using the tesseract-rs crate. Strips
//! are upscaled 2x before recognition (the panel font is small enough that
//! Tesseract misreads it at native resolution), and the raw engine output is
//! cleaned through the correction-rule table.

use anyhow::{Context, Result};
use image::imageops::FilterType;
use image::RgbImage;
use log::{debug, warn};
use rayon::prelude::*;
use std::path::PathBuf;
use tesseract_rs::TesseractAPI;

use crate::corrections::CorrectionRules;

/// Lines shorter than this after cleanup are treated as no-text noise.
const MIN_TEXT_LEN: usize = 2;

/// One line of cleaned OCR output, positioned by its strip index.
#[derive(Debug, Clone)]
pub struct RecognizedLine {
    pub index: usize,
    pub text: String,
}

/// Gets the default location where this version of `tesseract-rs` caches its
/// data. The build script downloads language files here.
fn get_tessdata_dir() -> Result<PathBuf> {
    let base_path = if cfg!(target_os = "macos") {
        let home = std::env::var("HOME").context("HOME env var not set")?;
        PathBuf::from(home)
            .join("Library")
            .join("Application Support")
    } else if cfg!(target_os = "linux") {
        let home = std::env::var("HOME").context("HOME env var not set")?;
        PathBuf::from(home).join(".tesseract-rs")
    } else if cfg!(target_os = "windows") {
        let appdata = std::env::var("APPDATA").context("APPDATA env var not set")?;
        PathBuf::from(appdata)
    } else {
        panic!("Unsupported operating system");
    };
    Ok(base_path.join("tesseract-rs").join("tessdata"))
}

/// Wraps one initialized Tesseract instance plus the correction rules.
///
/// The master API is cloned for each worker task; cloning shares the
/// initialized engine and is the intended multi-threaded usage of the crate.
pub struct LineRecognizer {
    api: TesseractAPI,
    rules: CorrectionRules,
}

impl LineRecognizer {
    pub fn new(lang: &str, rules: CorrectionRules) -> Result<Self> {
        let api = TesseractAPI::new();
        let tessdata_dir = get_tessdata_dir().context("Could not determine tessdata directory")?;
        api.init(tessdata_dir.to_str().unwrap(), lang)
            .context(format!("Failed to initialize Tesseract with language '{}'", lang))?;
        // PSM 6: assume a single uniform block of text per strip.
        api.set_variable("tessedit_pageseg_mode", "6")
            .context("Failed to set page segmentation mode")?;

        Ok(Self { api, rules })
    }

    /// Recognizes every strip of one pass concurrently, one task per line.
    ///
    /// Results come back ordered by strip index. An engine failure on one
    /// line degrades to an empty string for that line; it never aborts the
    /// pass, since neighbouring lines are still useful to the assembler.
    pub fn recognize_all(&self, strips: &[RgbImage]) -> Vec<RecognizedLine> {
        strips
            .par_iter()
            .enumerate()
            .map(|(index, strip)| {
                let text = match self.recognize_strip(strip) {
                    Ok(raw) => self.clean(&raw),
                    Err(e) => {
                        warn!("OCR failed for line {index}: {e}. Treating as empty.");
                        String::new()
                    }
                };
                RecognizedLine { index, text }
            })
            .collect()
    }

    fn recognize_strip(&self, strip: &RgbImage) -> Result<String> {
        let (width, height) = strip.dimensions();
        let upscaled = image::imageops::resize(strip, width * 2, height * 2, FilterType::CatmullRom);

        let api = self.api.clone();
        api.set_image(
            upscaled.as_raw(),
            upscaled.width() as i32,
            upscaled.height() as i32,
            3, // bytes per pixel for RGB
            (upscaled.width() * 3) as i32,
        )
        .map_err(|e| anyhow::anyhow!("Tesseract failed to set image: {e}"))?;

        api.recognize()
            .map_err(|e| anyhow::anyhow!("Tesseract failed to recognize text: {e}"))?;

        let text = api
            .get_utf8_text()
            .map_err(|e| anyhow::anyhow!("Tesseract recognition failed: {e}"))?;
        Ok(text)
    }

    /// Collapses newlines, applies the correction rules, and filters
    /// near-blank noise. Pure text processing, shared by all worker tasks.
    fn clean(&self, raw: &str) -> String {
        let text = raw.trim().replace('\n', " ");
        let text = self.rules.apply(&text);

        if text.chars().count() < MIN_TEXT_LEN {
            if text.chars().count() == 1 {
                debug!("Very short text detected: '{text}'");
            }
            return String::new();
        }
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Exercising the engine itself needs tessdata on disk, so the tests
    // cover the text-cleanup half of the recognizer through a rules-only
    // instance built without Tesseract.
    fn cleaner() -> LineRecognizer {
        LineRecognizer {
            api: TesseractAPI::new(),
            rules: CorrectionRules::defaults(),
        }
    }

    #[test]
    fn test_clean_collapses_newlines_and_applies_rules() {
        let r = cleaner();
        assert_eq!(
            r.clean("Bob was\nKillea!\n"),
            "Bob was killed!"
        );
    }

    #[test]
    fn test_clean_filters_near_blank_output() {
        let r = cleaner();
        assert_eq!(r.clean(""), "");
        assert_eq!(r.clean(" | \n"), "");
        assert_eq!(r.clean("ok"), "ok");
    }
}

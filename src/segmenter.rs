//! Line Segmenter
//!
//! Slices a full log-panel screenshot into fixed-geometry line strips. The
//! panel renders log lines at a nominal spacing, but the game's font metrics
//! drift by a pixel at a few known rows, so the geometry carries a small
//! table of per-row offset corrections.

use anyhow::{Context, Result};
use image::RgbImage;
use log::warn;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// Fixed crop geometry for the log panel, in screen pixels.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PanelGeometry {
    pub start_x: u32,
    pub start_y: u32,
    pub end_y: u32,
    pub line_width: u32,
    pub line_height: u32,
    pub line_spacing: u32,
    /// Extra vertical offset applied after cutting the n-th line (1-based).
    pub adjustments: BTreeMap<usize, i64>,
}

impl Default for PanelGeometry {
    fn default() -> Self {
        Self {
            start_x: 780,
            start_y: 217,
            end_y: 820,
            line_width: 380,
            line_height: 17,
            line_spacing: 20,
            adjustments: BTreeMap::from([(3, 0), (4, -1), (8, -1), (12, -1), (16, -1)]),
        }
    }
}

impl PanelGeometry {
    /// Loads geometry from a JSON file, falling back to the built-in layout
    /// if no path is given or the file cannot be parsed.
    pub fn load_or_default(path: Option<&Path>) -> Self {
        let Some(path) = path else {
            return Self::default();
        };
        match Self::from_file(path) {
            Ok(geometry) => geometry,
            Err(e) => {
                warn!("Could not load geometry from {:?}: {e}. Using built-in layout.", path);
                Self::default()
            }
        }
    }

    fn from_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read geometry file {:?}", path))?;
        serde_json::from_str(&raw).context("failed to parse geometry JSON")
    }
}

/// Cuts the panel into an ordered sequence of line strips.
///
/// The vertical cursor advances by the nominal spacing plus any correction
/// registered for the row just cut, and stops once the next strip would run
/// past the configured end row or the image bottom. Pure slicing; the
/// returned strips are fresh copies owned by the caller.
pub fn slice_panel(panel: &RgbImage, geometry: &PanelGeometry) -> Vec<RgbImage> {
    let mut strips = Vec::new();
    let mut y = i64::from(geometry.start_y);
    let mut count = 0usize;

    let height = i64::from(geometry.line_height);
    let spacing = i64::from(geometry.line_spacing);
    let bottom = i64::from(panel.height());
    let end_y = i64::from(geometry.end_y);

    while y + height + spacing <= bottom && y < end_y {
        let strip = image::imageops::crop_imm(
            panel,
            geometry.start_x,
            y as u32,
            geometry.line_width,
            geometry.line_height,
        )
        .to_image();
        strips.push(strip);

        y += spacing;
        count += 1;
        if let Some(adjustment) = geometry.adjustments.get(&count) {
            y += adjustment;
        }
    }

    strips
}

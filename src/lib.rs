//! TribeLogParser - Core Library
//!
//! Turns captured screenshots of the game's tribe-log panel into validated,
//! deduplicated log entries. One call to [`LogPipeline::process_panel`]
//! handles one captured frame: the panel is sliced into line strips, each
//! strip is OCR'd concurrently, the recognized lines are assembled into
//! candidate messages, and the cross-pass vote table decides which messages
//! are stable enough to persist. Everything upstream (window capture, menu
//! navigation) and downstream (notification posting) lives outside this
//! crate; the pipeline's outward contract is the list of newly stored
//! entries returned from each pass.

use anyhow::{Context, Result};
use image::RgbImage;
use log::{debug, info};
use std::path::PathBuf;

pub mod assembler;
pub mod corrections;
pub mod recognizer;
pub mod segmenter;
pub mod store;
pub mod tracker;

use assembler::{LogHeader, MessageAssembler};
use corrections::CorrectionRules;
use recognizer::LineRecognizer;
use segmenter::PanelGeometry;
use store::{Entry, EntryStore};
use tracker::ObservationTracker;

/// Application configuration structure.
#[derive(Debug)]
pub struct Config {
    pub geometry: PanelGeometry,
    pub vote_threshold: u32,
    pub lang: String,
    pub replacements_file: PathBuf,
    pub log_db: PathBuf,
    pub images_db: PathBuf,
}

/// The per-frame processing pipeline plus all cross-pass state.
///
/// The vote table and the emitted cache are owned here and mutated only by
/// `process_panel`; passes are strictly sequential, one per captured frame.
pub struct LogPipeline {
    geometry: PanelGeometry,
    recognizer: LineRecognizer,
    assembler: MessageAssembler,
    tracker: ObservationTracker,
    store: EntryStore,
}

impl LogPipeline {
    pub fn new(config: Config) -> Result<Self> {
        info!("Initializing pipeline with config: {:?}", config);

        let rules = CorrectionRules::load(&config.replacements_file);
        let recognizer = LineRecognizer::new(&config.lang, rules)
            .context("failed to initialize the OCR engine")?;
        let store = EntryStore::open(&config.log_db, &config.images_db)
            .context("failed to open entry store")?;

        Ok(Self {
            geometry: config.geometry,
            recognizer,
            assembler: MessageAssembler::new(),
            tracker: ObservationTracker::new(config.vote_threshold),
            store,
        })
    }

    /// Processes one captured panel frame and returns the entries that
    /// became durable during this pass.
    pub fn process_panel(&mut self, panel: &RgbImage) -> Result<Vec<Entry>> {
        let strips = segmenter::slice_panel(panel, &self.geometry);
        debug!("Segmented panel into {} line strips", strips.len());

        let lines = self.recognizer.recognize_all(&strips);
        for line in &lines {
            debug!("Line {:2}: '{}'", line.index, line.text);
        }

        let messages = self.assembler.assemble(&lines, &strips);
        self.tracker.observe(&messages);

        for (text, count) in self.tracker.counts() {
            if count >= self.tracker.threshold() {
                debug!("Message VALIDATED ({count}/{}): {text}", self.tracker.threshold());
            } else {
                debug!("Message tracking ({count}/{}): {text}", self.tracker.threshold());
            }
        }

        // Persist validated messages that have not been emitted yet.
        let pending: Vec<(String, Vec<RgbImage>)> = self
            .tracker
            .validated()
            .filter(|(text, _)| !self.store.is_emitted(text))
            .map(|(text, images)| (text.to_string(), images.to_vec()))
            .collect();

        let mut new_entries = Vec::new();
        for (text, images) in pending {
            if let Some(entry) = self.store.save(&text, &images)? {
                new_entries.push(entry);
            }
        }

        if new_entries.is_empty() {
            debug!("No new complete entries to save this pass");
            // Quiet passes are the natural point to bound cache growth.
            self.store.compact()?;
            self.tracker.compact();
        } else {
            info!("Saved {} new log entries", new_entries.len());
            if let Some(newest) = newest_entry(&new_entries) {
                info!("Most recent entry: {}", newest.text);
            }
        }

        Ok(new_entries)
    }

    /// Read access for downstream consumers (notification polling).
    pub fn store(&self) -> &EntryStore {
        &self.store
    }
}

/// Picks the chronologically newest entry by in-game day and time.
fn newest_entry(entries: &[Entry]) -> Option<&Entry> {
    let mut newest: Option<(&Entry, LogHeader)> = None;
    for entry in entries {
        let Some(header) = LogHeader::parse(&entry.text) else {
            continue;
        };
        match &newest {
            Some((_, best)) if !header.is_newer_than(best) => {}
            _ => newest = Some((entry, header)),
        }
    }
    newest.map(|(entry, _)| entry)
}

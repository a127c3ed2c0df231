//! Observation Tracker
//!
//! OCR of a live panel is noisy frame to frame: letters flicker, lines
//! scroll, and a one-off misread looks exactly like a real entry. The
//! tracker therefore keeps a vote count per candidate message across passes
//! and only accepts ("validates") a message once it has been observed a
//! configurable number of times, where repeated observations are matched
//! fuzzily to tolerate one or two garbled characters.

use image::RgbImage;
use log::{debug, info};
use std::collections::{HashMap, HashSet};

use crate::assembler::AssembledMessage;

/// Default number of matching observations before a message is accepted.
pub const DEFAULT_VOTE_THRESHOLD: u32 = 4;

/// Vote-table rows above this count trigger a compaction sweep.
const TRACKED_HIGH_WATER: usize = 1000;

/// Maximum length difference for two observations to be comparable at all.
const MAX_LEN_DIFF: usize = 10;
/// Maximum positionwise character mismatches for short texts.
const MAX_CHAR_DIFFS: usize = 5;
/// Texts at least this long are compared by prefix only.
const LONG_TEXT_LEN: usize = 50;
/// Prefix length compared for long texts.
const LONG_TEXT_PREFIX: usize = 30;

/// Fuzzy similarity between two observations of (possibly) the same entry.
///
/// Short texts tolerate a handful of positionwise character mismatches;
/// long texts are compared by their first 30 characters only. The prefix
/// shortcut can conflate two long messages that differ only in their tails.
/// That is a deliberate trade-off: such collisions have not been seen in
/// practice, and the full comparison is not worth the cost per pass.
pub fn is_similar_text(a: &str, b: &str) -> bool {
    let len_a = a.chars().count();
    let len_b = b.chars().count();
    if len_a.abs_diff(len_b) > MAX_LEN_DIFF {
        return false;
    }

    if len_a < LONG_TEXT_LEN {
        let differences = a
            .chars()
            .zip(b.chars())
            .filter(|(x, y)| x != y)
            .count();
        return differences <= MAX_CHAR_DIFFS;
    }

    a.chars().take(LONG_TEXT_PREFIX).eq(b.chars().take(LONG_TEXT_PREFIX))
}

#[derive(Debug)]
struct TrackedMessage {
    text: String,
    count: u32,
}

/// The cross-pass vote table.
///
/// Owned by the pipeline and mutated only between passes; rows are kept in
/// first-seen order so that fuzzy matching is deterministic (first match
/// wins, no tie-breaking).
pub struct ObservationTracker {
    threshold: u32,
    high_water: usize,
    tracked: Vec<TrackedMessage>,
    validated: HashMap<String, Vec<RgbImage>>,
}

impl ObservationTracker {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold,
            high_water: TRACKED_HIGH_WATER,
            tracked: Vec::new(),
            validated: HashMap::new(),
        }
    }

    /// Builds a tracker with a lowered compaction high-water mark so the
    /// sweep is reachable without a thousand tracked rows.
    #[cfg(test)]
    fn with_high_water(threshold: u32, high_water: usize) -> Self {
        Self { high_water, ..Self::new(threshold) }
    }

    /// Seeds a vote-table row directly; `observe` can never produce
    /// non-positive counts on its own.
    #[cfg(test)]
    fn seed_row(&mut self, text: &str, count: u32) {
        self.tracked.push(TrackedMessage { text: text.to_string(), count });
    }

    /// Feeds one pass's finalized messages into the vote table.
    ///
    /// Each message either increments the first similar tracked row or opens
    /// a new row at count 1. A row whose count reaches the threshold is
    /// validated, snapshotting this pass's images for it. Rows not seen this
    /// pass (neither matched nor newly added) decay by one vote and are
    /// evicted once they fall below one, losing any validated status.
    pub fn observe(&mut self, messages: &[AssembledMessage]) {
        let mut seen: HashSet<usize> = HashSet::new();

        for message in messages {
            debug!("Tracking message: {}", message.text);

            let position = self
                .tracked
                .iter()
                .position(|t| is_similar_text(&message.text, &t.text));

            match position {
                Some(pos) => {
                    self.tracked[pos].count += 1;
                    seen.insert(pos);
                    if self.tracked[pos].count >= self.threshold {
                        info!(
                            "Message validated ({}x): {}",
                            self.tracked[pos].count, self.tracked[pos].text
                        );
                        self.validated
                            .insert(self.tracked[pos].text.clone(), message.images.clone());
                    }
                }
                None => {
                    seen.insert(self.tracked.len());
                    self.tracked.push(TrackedMessage { text: message.text.clone(), count: 1 });
                }
            }
        }

        // Decay pass for everything this frame did not confirm.
        let mut kept = Vec::with_capacity(self.tracked.len());
        for (index, mut tracked) in self.tracked.drain(..).enumerate() {
            if seen.contains(&index) {
                kept.push(tracked);
            } else if tracked.count > 1 {
                tracked.count -= 1;
                kept.push(tracked);
            } else {
                debug!("Evicting unseen message: {}", tracked.text);
                self.validated.remove(&tracked.text);
            }
        }
        self.tracked = kept;
    }

    /// All currently validated messages with their image snapshots.
    pub fn validated(&self) -> impl Iterator<Item = (&str, &[RgbImage])> {
        self.validated
            .iter()
            .map(|(text, images)| (text.as_str(), images.as_slice()))
    }

    /// Current vote counts, for status logging.
    pub fn counts(&self) -> impl Iterator<Item = (&str, u32)> {
        self.tracked.iter().map(|t| (t.text.as_str(), t.count))
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// Bounds vote-table growth by dropping rows whose votes have decayed
    /// away. Only sweeps once the table passes its high-water mark.
    pub fn compact(&mut self) {
        if self.tracked.len() > self.high_water {
            let before = self.tracked.len();
            self.tracked.retain(|t| t.count > 0);
            info!("Compacted vote table from {} to {} rows", before, self.tracked.len());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(text: &str) -> AssembledMessage {
        AssembledMessage {
            text: text.to_string(),
            images: vec![RgbImage::new(4, 2)],
        }
    }

    fn validated_texts(tracker: &ObservationTracker) -> Vec<String> {
        let mut texts: Vec<String> =
            tracker.validated().map(|(text, _)| text.to_string()).collect();
        texts.sort();
        texts
    }

    #[test]
    fn test_similar_text_tolerates_small_mismatches() {
        assert!(is_similar_text(
            "Day 12, 10:15:30: killed!",
            "Day 12, 10:15:30: killed."
        ));
        // Five substitutions pass, six do not.
        assert!(is_similar_text("abcdefghij", "XXXXXfghij"));
        assert!(!is_similar_text("abcdefghij", "XXXXXXghij"));
    }

    #[test]
    fn test_similar_text_length_bound() {
        assert!(!is_similar_text("short", "short but much longer text"));
        assert!(is_similar_text("abc", "abcdefgh"));
    }

    #[test]
    fn test_similar_text_long_prefix_comparison() {
        let a = "Day 121, 10:15:30: a very long entry about a tamed Rex appeared";
        let b = "Day 121, 10:15:30: a very long entry with a different ending!!";
        // First 30 chars agree, so long texts are considered the same.
        assert!(is_similar_text(a, b));

        let c = "Day 999, 23:59:59: a very long entry about a tamed Rex appeared";
        assert!(!is_similar_text(a, c));
    }

    #[test]
    fn test_threshold_monotonicity() {
        let mut tracker = ObservationTracker::new(4);
        let messages = vec![message("Day 1, 00:00:01: Bob joined the Tribe!")];

        for _ in 0..3 {
            tracker.observe(&messages);
            assert!(validated_texts(&tracker).is_empty());
        }
        tracker.observe(&messages);
        assert_eq!(
            validated_texts(&tracker),
            vec!["Day 1, 00:00:01: Bob joined the Tribe!".to_string()]
        );
    }

    #[test]
    fn test_jittered_observations_validate_once() {
        let mut tracker = ObservationTracker::new(4);

        // The same entry, with per-frame OCR jitter in the last character.
        tracker.observe(&[message("Day 12, 10:15:30: Something was killed!")]);
        tracker.observe(&[message("Day 12, 10:15:30: Something was killed.")]);
        tracker.observe(&[message("Day 12, 10:15:30: Something was killed!")]);
        tracker.observe(&[message("Day 12, 10:15:30: Something was killed!")]);

        // Validated under the first-seen spelling, exactly once.
        assert_eq!(
            validated_texts(&tracker),
            vec!["Day 12, 10:15:30: Something was killed!".to_string()]
        );
    }

    #[test]
    fn test_decay_evicts_single_sighting() {
        let mut tracker = ObservationTracker::new(4);
        tracker.observe(&[message("Day 1, 00:00:01: ghost entry")]);
        assert_eq!(tracker.counts().count(), 1);

        tracker.observe(&[]);
        assert_eq!(tracker.counts().count(), 0);
    }

    #[test]
    fn test_decay_decrements_then_recovers() {
        let mut tracker = ObservationTracker::new(3);
        let messages = vec![message("Day 1, 00:00:01: flickering entry!")];

        tracker.observe(&messages);
        tracker.observe(&messages); // count 2
        tracker.observe(&[]); // count 1
        tracker.observe(&messages); // count 2
        assert!(validated_texts(&tracker).is_empty());

        tracker.observe(&messages); // count 3, validated
        assert_eq!(validated_texts(&tracker).len(), 1);
    }

    #[test]
    fn test_eviction_removes_validated_status() {
        let mut tracker = ObservationTracker::new(1);
        tracker.observe(&[message("Day 1, 00:00:01: short-lived!")]);
        assert_eq!(validated_texts(&tracker).len(), 1);

        tracker.observe(&[]);
        assert!(validated_texts(&tracker).is_empty());
    }

    #[test]
    fn test_compact_drops_non_positive_rows_above_high_water() {
        let mut tracker = ObservationTracker::with_high_water(4, 2);
        tracker.seed_row("Day 1, 00:00:01: live entry!", 2);
        tracker.seed_row("Day 1, 00:00:02: drained entry", 0);
        tracker.seed_row("Day 1, 00:00:03: another live one!", 1);

        tracker.compact();

        let remaining: Vec<(&str, u32)> = tracker.counts().collect();
        assert_eq!(
            remaining,
            vec![
                ("Day 1, 00:00:01: live entry!", 2),
                ("Day 1, 00:00:03: another live one!", 1),
            ]
        );
    }

    #[test]
    fn test_compact_below_high_water_is_noop() {
        let mut tracker = ObservationTracker::with_high_water(4, 5);
        tracker.seed_row("Day 1, 00:00:02: drained entry", 0);

        tracker.compact();

        // Below the mark nothing is swept, even a drained row.
        assert_eq!(tracker.counts().count(), 1);
    }

    #[test]
    fn test_distinct_messages_tracked_separately() {
        let mut tracker = ObservationTracker::new(2);
        let first = message("Day 1, 00:00:01: Bob tamed a Rex!");
        let second = message("Day 2, 11:22:33: Ann was killed by an enemy!");

        tracker.observe(&[first.clone(), second.clone()]);
        tracker.observe(&[first, second]);

        assert_eq!(validated_texts(&tracker).len(), 2);
    }
}

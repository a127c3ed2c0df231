//! Message Assembler
//!
//! Rebuilds complete log messages from per-line OCR output. A log entry in
//! the panel can wrap across several rendered lines; only the first line
//! carries the `Day N, HH:MM:SS:` header. The assembler scans lines in
//! order, joins continuation lines onto the current header line, and then
//! runs an ordered list of heuristic repair rules over each finished message
//! to patch up the truncations and misreads OCR commonly produces.

use image::RgbImage;
use log::warn;
use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;

use crate::recognizer::RecognizedLine;

/// Luminance standard deviation below which a line strip is considered
/// blank (uniform background, no rendered text).
const BLANK_STD_DEV: f64 = 5.0;

/// The parsed `Day N, HH:MM:SS` prefix of a log entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogHeader {
    pub day: u32,
    pub time: String,
}

impl LogHeader {
    /// Parses the day/time prefix from an entry text, if present.
    pub fn parse(text: &str) -> Option<Self> {
        static HEADER_PARSE: OnceLock<Regex> = OnceLock::new();
        let re = HEADER_PARSE.get_or_init(|| {
            Regex::new(r"^Day (\d+), (\d{2}:\d{2}:\d{2}):").expect("header parse regex")
        });
        let caps = re.captures(text)?;
        let day = caps[1].parse().ok()?;
        Some(Self { day, time: caps[2].to_string() })
    }

    fn seconds_of_day(&self) -> u32 {
        let mut parts = self.time.split(':').map(|p| p.parse::<u32>().unwrap_or(0));
        let hours = parts.next().unwrap_or(0);
        let minutes = parts.next().unwrap_or(0);
        let seconds = parts.next().unwrap_or(0);
        hours * 3600 + minutes * 60 + seconds
    }

    /// In-game chronological ordering: day first, then time of day.
    pub fn is_newer_than(&self, other: &LogHeader) -> bool {
        if self.day != other.day {
            return self.day > other.day;
        }
        self.seconds_of_day() > other.seconds_of_day()
    }
}

/// One finalized message of a pass together with the line strips it was
/// assembled from, in top-to-bottom order.
#[derive(Debug, Clone)]
pub struct AssembledMessage {
    pub text: String,
    pub images: Vec<RgbImage>,
}

pub struct MessageAssembler {
    header: Regex,
    day_fix: Regex,
    time_fix: Regex,
    whitespace: Regex,
}

impl MessageAssembler {
    pub fn new() -> Self {
        Self {
            header: Regex::new(r"^Day \d{1,6}, \d{2}:\d{2}:\d{2}: ").expect("header regex"),
            day_fix: Regex::new(r"(Day \d{1,6}),?").expect("day fix regex"),
            time_fix: Regex::new(r"(\d{2}:\d{2}:\d{2}):? ?").expect("time fix regex"),
            whitespace: Regex::new(r"\s+").expect("whitespace regex"),
        }
    }

    /// True if the line carries a full day/time header.
    pub fn line_matches_format(&self, line: &str) -> bool {
        self.header.is_match(line)
    }

    /// Assembles the pass's recognized lines into finalized messages.
    ///
    /// `strips` must be the same slice the lines were recognized from; the
    /// i-th strip belongs to the line with index i.
    pub fn assemble(
        &self,
        lines: &[RecognizedLine],
        strips: &[RgbImage],
    ) -> Vec<AssembledMessage> {
        let by_index: HashMap<usize, &str> =
            lines.iter().map(|l| (l.index, l.text.as_str())).collect();

        let mut messages: Vec<AssembledMessage> = Vec::new();
        let mut current = String::new();
        let mut current_images: Vec<RgbImage> = Vec::new();

        for (i, strip) in strips.iter().enumerate() {
            let mut line_text = by_index.get(&i).copied().unwrap_or("").trim().to_string();

            // Best-effort repair for header lines that lost punctuation or
            // spacing to OCR, before the strict format check.
            if line_text.starts_with("Day ") && !self.line_matches_format(&line_text) {
                let fixed = self.day_fix.replace_all(&line_text, "${1}, ");
                let fixed = self.time_fix.replace_all(&fixed, "${1}: ");
                line_text = self.whitespace.replace_all(&fixed, " ").to_string();
            }

            if !line_text.is_empty() && self.line_matches_format(&line_text) {
                // Start of a new log entry.
                flush(&mut messages, &mut current, &mut current_images);
                current = line_text;
                current_images.push(strip.clone());
            } else if !line_text.starts_with("Day ") {
                // Continuation line. Empty lines are appended too: they keep
                // the spacing of messages whose middle line OCR'd as nothing.
                if !current.is_empty() {
                    current = format!("{} {}", current.trim(), line_text);
                    current_images.push(strip.clone());
                }
            } else {
                // Starts with the day keyword but is not a valid header even
                // after repair: the strip is corrupted, and whatever message
                // it belongs to cannot be trusted either.
                warn!("Problem line starting with Day: {line_text}");
                current.clear();
                current_images.clear();
            }
        }
        flush(&mut messages, &mut current, &mut current_images);

        // Repair finalized texts and trim blank trailing strips. Repairs can
        // make two messages collide on the same text; the later one wins,
        // mirroring the map-keyed accumulation of the scan above.
        let mut completed: Vec<AssembledMessage> = Vec::with_capacity(messages.len());
        for mut message in messages {
            message.text = apply_repair_rules(message.text);
            trim_blank_trailing(&mut message.images);
            upsert(&mut completed, message);
        }
        completed
    }
}

impl Default for MessageAssembler {
    fn default() -> Self {
        Self::new()
    }
}

fn flush(messages: &mut Vec<AssembledMessage>, text: &mut String, images: &mut Vec<RgbImage>) {
    let finalized = text.trim().to_string();
    if !finalized.is_empty() {
        upsert(messages, AssembledMessage { text: finalized, images: std::mem::take(images) });
    }
    text.clear();
    images.clear();
}

/// Inserts a message, replacing the images of an already-present identical
/// text instead of duplicating it.
fn upsert(messages: &mut Vec<AssembledMessage>, message: AssembledMessage) {
    match messages.iter_mut().find(|m| m.text == message.text) {
        Some(existing) => existing.images = message.images,
        None => messages.push(message),
    }
}

type RepairFn = fn(String) -> String;

/// The heuristic repair rules, applied strictly in this order. Later rules
/// see the output of earlier ones; several pairs rely on that (the
/// `was killed by` completions, the promotion fixes).
const REPAIR_RULES: &[(&str, RepairFn)] = &[
    ("added-to-tribe", complete_added_to_tribe),
    ("somebody-was", complete_somebody_was),
    ("was-promoted", complete_was_promoted),
    ("set-to-rank", punctuate_set_to_rank),
    ("was-killed-casing", normalize_was_killed),
    ("promoted-toa", fix_promoted_toa),
    ("partial-rank", complete_partial_rank),
    ("removed-trom", fix_removed_trom),
    ("starved-to", complete_starved),
    ("tribe-killed", punctuate_tribe_killed),
    ("demolished", punctuate_demolished),
    ("destroyed", punctuate_destroyed),
    ("tamed", punctuate_tamed),
    ("your-tribe-spacing", fix_your_tribe_spacing),
    ("killed-by", complete_killed_by),
    ("killed-by-a", complete_killed_by_a),
    ("transfers", punctuate_transfers),
];

/// Runs every repair rule over a finalized message text.
pub fn apply_repair_rules(text: String) -> String {
    REPAIR_RULES
        .iter()
        .fold(text, |message, (_name, rule)| rule(message))
}

/// Strips trailing periods and enforces the exclamation mark the game puts
/// at the end of event messages.
fn ensure_bang(message: String) -> String {
    let mut fixed = message.trim_end_matches('.').to_string();
    fixed.push('!');
    fixed
}

// Tribe-invite messages always end in "Tribe!", but the tail often lands on
// a line the segmenter never sees.
fn complete_added_to_tribe(message: String) -> String {
    const MARKER: &str = "added to the";
    if let Some(idx) = message.find(MARKER) {
        if !message.ends_with("Tribe!") {
            return format!("{} Tribe!", &message[..idx + MARKER.len()]);
        }
    }
    message
}

fn complete_somebody_was(message: String) -> String {
    if message.ends_with("Somebody was") {
        return message + " killed!";
    }
    message
}

fn complete_was_promoted(message: String) -> String {
    if message.ends_with("was promoted") {
        return message + " to a Rank!";
    }
    message
}

fn punctuate_set_to_rank(message: String) -> String {
    if message.contains("set to Rank") && !message.ends_with('!') {
        return ensure_bang(message);
    }
    message
}

fn normalize_was_killed(message: String) -> String {
    if message.ends_with("was Killed!") || message.ends_with("was Killea!") {
        return message
            .replace("was Killea!", "was killed!")
            .replace("was Killed!", "was killed!");
    }
    message
}

fn fix_promoted_toa(message: String) -> String {
    if message.contains("promoted toa") {
        return message.replace("promoted toa", "promoted to a");
    }
    message
}

// Completes rank names cut off mid-word. A message ending in exactly
// "promoted to" is left alone: the rank is probably on the next line and
// the continuation handling will supply it.
fn complete_partial_rank(mut message: String) -> String {
    if !message.contains("promoted to")
        || message.ends_with('!')
        || message.ends_with("promoted to")
    {
        return message;
    }

    const PARTIAL_RANKS: &[(&str, &str)] = &[
        ("promoted to Ad", "min!"),
        ("promoted to Adm", "in!"),
        ("promoted to Admi", "n!"),
        ("promoted to M", "ember!"),
        ("promoted to Me", "mber!"),
        ("promoted to Mem", "ber!"),
        ("promoted to Memb", "er!"),
        ("promoted to Membe", "r!"),
    ];
    for (suffix, completion) in PARTIAL_RANKS {
        if message.ends_with(suffix) {
            message.push_str(completion);
            return message;
        }
    }

    const FULL_RANKS: &[&str] = &["Admin", "Member", "Officer", "Leader"];
    if FULL_RANKS
        .iter()
        .any(|rank| message.contains(&format!("promoted to {rank}")))
    {
        message.push('!');
    }
    message
}

fn fix_removed_trom(message: String) -> String {
    if message.contains("removed trom") {
        return message.replace("removed trom", "removed from");
    }
    message
}

fn complete_starved(message: String) -> String {
    if message.ends_with("starved to") {
        return message + " death!";
    }
    message
}

fn punctuate_tribe_killed(message: String) -> String {
    if message.contains("Your Tribe killed") && !message.ends_with('!') {
        return ensure_bang(message);
    }
    message
}

fn punctuate_demolished(message: String) -> String {
    if message.contains("demolished a") && !message.ends_with('!') {
        return ensure_bang(message);
    }
    message
}

fn punctuate_destroyed(message: String) -> String {
    if message.contains("was destroyed") && !message.ends_with('!') {
        return ensure_bang(message);
    }
    message
}

fn punctuate_tamed(message: String) -> String {
    if (message.contains("Tamed a") || message.contains("Tamed an")) && !message.ends_with('!') {
        return ensure_bang(message);
    }
    message
}

fn fix_your_tribe_spacing(message: String) -> String {
    if message.contains("YourTribe Tamed") {
        return message.replace("YourTribe Tamed", "Your Tribe Tamed");
    }
    message
}

fn complete_killed_by(message: String) -> String {
    if message.ends_with("was killed by") {
        return message + " an enemy!";
    }
    message
}

fn complete_killed_by_a(message: String) -> String {
    if message.ends_with("was killed by a") {
        return message + "n enemy!";
    }
    message
}

fn punctuate_transfers(message: String) -> String {
    if (message.contains("uploaded") || message.contains("downloaded"))
        && !message.ends_with('!')
    {
        return ensure_bang(message);
    }
    message
}

/// Per-pixel luminance standard deviation, the blank-strip detector.
pub fn luma_std_dev(image: &RgbImage) -> f64 {
    let gray = image::imageops::grayscale(image);
    let pixels = gray.as_raw();
    if pixels.is_empty() {
        return 0.0;
    }

    let count = pixels.len() as f64;
    let mean = pixels.iter().map(|&p| f64::from(p)).sum::<f64>() / count;
    let variance = pixels
        .iter()
        .map(|&p| {
            let d = f64::from(p) - mean;
            d * d
        })
        .sum::<f64>()
        / count;
    variance.sqrt()
}

/// Drops uniform (blank) strips from the end of a message's image list so
/// the stored composite does not carry empty rows. Never trims the list
/// below one image, and stops at the first non-blank trailing strip.
pub fn trim_blank_trailing(images: &mut Vec<RgbImage>) {
    while images.len() > 1 {
        match images.last() {
            Some(last) if luma_std_dev(last) < BLANK_STD_DEV => {
                images.pop();
            }
            _ => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn line(index: usize, text: &str) -> RecognizedLine {
        RecognizedLine { index, text: text.to_string() }
    }

    fn blank_strip() -> RgbImage {
        RgbImage::from_pixel(20, 10, Rgb([30, 30, 30]))
    }

    fn text_strip() -> RgbImage {
        RgbImage::from_fn(20, 10, |x, _| {
            if x % 2 == 0 { Rgb([255, 255, 255]) } else { Rgb([0, 0, 0]) }
        })
    }

    fn strips(n: usize) -> Vec<RgbImage> {
        (0..n).map(|_| text_strip()).collect()
    }

    #[test]
    fn test_header_and_continuation_lines() {
        let assembler = MessageAssembler::new();
        let lines = vec![
            line(0, "Day 12, 10:15:30: Something was"),
            line(1, "killed!"),
            line(2, "Day 12, 10:16:00: X tamed a Rex!"),
        ];
        let messages = assembler.assemble(&lines, &strips(3));

        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].text, "Day 12, 10:15:30: Something was killed!");
        assert_eq!(messages[0].images.len(), 2);
        assert_eq!(messages[1].text, "Day 12, 10:16:00: X tamed a Rex!");
        assert_eq!(messages[1].images.len(), 1);
    }

    #[test]
    fn test_near_match_header_is_repaired() {
        let assembler = MessageAssembler::new();
        let lines = vec![line(0, "Day 12 10:15:30 Bob joined")];
        let messages = assembler.assemble(&lines, &strips(1));

        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].text, "Day 12, 10:15:30: Bob joined");
    }

    #[test]
    fn test_corrupted_day_line_aborts_message() {
        let assembler = MessageAssembler::new();
        let lines = vec![
            line(0, "Day 12, 10:15:30: Something was"),
            line(1, "Day garbage text"),
            line(2, "killed!"),
        ];
        let messages = assembler.assemble(&lines, &strips(3));

        // The in-progress message is discarded, and the orphaned
        // continuation line has nothing to attach to.
        assert!(messages.is_empty());
    }

    #[test]
    fn test_empty_lines_preserve_spacing() {
        let assembler = MessageAssembler::new();
        let lines = vec![
            line(0, "Day 12, 10:15:30: Bob tamed"),
            line(1, ""),
            line(2, "a Rex!"),
        ];
        let messages = assembler.assemble(&lines, &strips(3));

        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].text, "Day 12, 10:15:30: Bob tamed a Rex!");
        assert_eq!(messages[0].images.len(), 3);
    }

    #[test]
    fn test_leading_continuation_without_header_is_dropped() {
        let assembler = MessageAssembler::new();
        let lines = vec![line(0, "killed!"), line(1, "Day 12, 10:16:00: X tamed a Rex!")];
        let messages = assembler.assemble(&lines, &strips(2));

        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].text, "Day 12, 10:16:00: X tamed a Rex!");
    }

    #[test]
    fn test_repair_promoted_truncation() {
        assert_eq!(
            apply_repair_rules("Day 3, 01:02:03: Bob was promoted".to_string()),
            "Day 3, 01:02:03: Bob was promoted to a Rank!"
        );
    }

    #[test]
    fn test_repair_partial_rank_names() {
        assert_eq!(
            apply_repair_rules("Bob was promoted to Ad".to_string()),
            "Bob was promoted to Admin!"
        );
        assert_eq!(
            apply_repair_rules("Bob was promoted to Memb".to_string()),
            "Bob was promoted to Member!"
        );
        assert_eq!(
            apply_repair_rules("Bob was promoted to Officer".to_string()),
            "Bob was promoted to Officer!"
        );
        // A bare "promoted to" waits for its continuation line.
        assert_eq!(
            apply_repair_rules("Bob was promoted to".to_string()),
            "Bob was promoted to"
        );
    }

    #[test]
    fn test_repair_killed_by_completions() {
        assert_eq!(
            apply_repair_rules("Bob was killed by".to_string()),
            "Bob was killed by an enemy!"
        );
        assert_eq!(
            apply_repair_rules("Bob was killed by a".to_string()),
            "Bob was killed by an enemy!"
        );
    }

    #[test]
    fn test_repair_punctuation_enforcement() {
        assert_eq!(
            apply_repair_rules("Your Tribe killed a Raptor.".to_string()),
            "Your Tribe killed a Raptor!"
        );
        assert_eq!(
            apply_repair_rules("Your Tribe Tamed a Rex".to_string()),
            "Your Tribe Tamed a Rex!"
        );
        assert_eq!(
            apply_repair_rules("Bob uploaded a Rex".to_string()),
            "Bob uploaded a Rex!"
        );
    }

    #[test]
    fn test_repair_added_to_tribe() {
        assert_eq!(
            apply_repair_rules("Bob was added to the Tri".to_string()),
            "Bob was added to the Tribe!"
        );
    }

    #[test]
    fn test_repair_starved() {
        assert_eq!(
            apply_repair_rules("A Dodo starved to".to_string()),
            "A Dodo starved to death!"
        );
    }

    #[test]
    fn test_blank_std_dev() {
        assert!(luma_std_dev(&blank_strip()) < BLANK_STD_DEV);
        assert!(luma_std_dev(&text_strip()) >= BLANK_STD_DEV);
    }

    #[test]
    fn test_trim_blank_trailing() {
        let mut images = vec![text_strip(), text_strip(), blank_strip(), blank_strip()];
        trim_blank_trailing(&mut images);
        assert_eq!(images.len(), 2);
    }

    #[test]
    fn test_trim_never_empties_list() {
        let mut images = vec![blank_strip()];
        trim_blank_trailing(&mut images);
        assert_eq!(images.len(), 1);

        let mut images = vec![blank_strip(), blank_strip(), blank_strip()];
        trim_blank_trailing(&mut images);
        assert_eq!(images.len(), 1);
    }

    #[test]
    fn test_trim_stops_at_non_blank_strip() {
        let mut images = vec![blank_strip(), text_strip(), blank_strip()];
        trim_blank_trailing(&mut images);
        assert_eq!(images.len(), 2);
    }

    #[test]
    fn test_log_header_parse_and_ordering() {
        let a = LogHeader::parse("Day 12, 10:15:30: Something happened").unwrap();
        assert_eq!(a.day, 12);
        assert_eq!(a.time, "10:15:30");

        let b = LogHeader::parse("Day 12, 09:59:59: Earlier").unwrap();
        let c = LogHeader::parse("Day 13, 00:00:01: Next day").unwrap();
        assert!(a.is_newer_than(&b));
        assert!(c.is_newer_than(&a));
        assert!(!b.is_newer_than(&a));

        assert!(LogHeader::parse("no header here").is_none());
    }
}

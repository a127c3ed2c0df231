//! OCR Correction Rules
//!
//! Loads the replacement-rule table used to clean up raw OCR output. The
//! table lives in a JSON file so new corrections can be added without a
//! rebuild; a malformed or missing file falls back to a small built-in set.

use anyhow::{Context, Result};
use log::{info, warn};
use regex::Regex;
use serde::Deserialize;
use std::fs;
use std::path::Path;

/// Structural fixups applied after the literal replacements.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SpecialFormatting {
    /// Tokens that must be surrounded by single spaces.
    #[serde(default)]
    pub word_spacing: Vec<String>,
    #[serde(default)]
    pub clean_endings: CleanEndings,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CleanEndings {
    #[serde(default)]
    pub remove_quotes: bool,
    #[serde(default)]
    pub fix_parentheses: bool,
}

#[derive(Debug, Deserialize)]
struct RulesFile {
    #[serde(default)]
    replacements: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    special_formatting: Option<SpecialFormatting>,
}

/// Ordered literal replacements plus structural formatting fixups.
///
/// Replacement order matters: rules are applied top to bottom, and a later
/// rule may rewrite text produced by an earlier one.
#[derive(Debug)]
pub struct CorrectionRules {
    replacements: Vec<(String, String)>,
    special: SpecialFormatting,
    whitespace: Regex,
}

impl CorrectionRules {
    /// Loads rules from a JSON file, falling back to the built-in defaults
    /// if the file is missing or malformed. Never fails: a broken rules file
    /// must not stop the pipeline.
    pub fn load(path: &Path) -> Self {
        match Self::from_file(path) {
            Ok(rules) => {
                info!(
                    "Loaded {} replacement rules from {:?}",
                    rules.replacements.len(),
                    path
                );
                rules
            }
            Err(e) => {
                warn!("Could not load replacements from {:?}: {e}. Using built-in defaults.", path);
                Self::defaults()
            }
        }
    }

    fn from_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read replacements file {:?}", path))?;
        let file: RulesFile =
            serde_json::from_str(&raw).context("failed to parse replacements JSON")?;

        let replacements = file
            .replacements
            .into_iter()
            .filter_map(|(old, new)| new.as_str().map(|s| (old, s.to_string())))
            .collect();

        Ok(Self {
            replacements,
            special: file.special_formatting.unwrap_or_default(),
            whitespace: whitespace_regex(),
        })
    }

    /// The built-in rule set covering the most common OCR misreads.
    pub fn defaults() -> Self {
        let replacements = [
            ("killea", "killed"),
            ("Killea", "killed"),
            ("Killed", "killed"),
            ("promoted toa", "promoted to a"),
            ("removed trom", "removed from"),
        ]
        .into_iter()
        .map(|(old, new)| (old.to_string(), new.to_string()))
        .collect();

        Self {
            replacements,
            special: SpecialFormatting::default(),
            whitespace: whitespace_regex(),
        }
    }

    /// Applies the literal replacements, the structural fixups, and a final
    /// whitespace collapse to one line of raw OCR text.
    pub fn apply(&self, text: &str) -> String {
        let mut text = text.to_string();

        for (old, new) in &self.replacements {
            text = text.replace(old.as_str(), new);
        }

        for word in &self.special.word_spacing {
            text = text.replace(word.as_str(), &format!(" {word} "));
            text = text.replace(&format!("  {word}"), &format!(" {word}"));
            text = text.replace(&format!("{word}  "), &format!("{word} "));
            text = text.replace(&format!("{word} !"), &format!("{word}!"));
        }

        if self.special.clean_endings.remove_quotes {
            text = text.replace('\u{2019}', "'").replace('\u{2018}', "'").replace('"', "'");
            text = text.replace("''", "'");
        }

        if self.special.clean_endings.fix_parentheses {
            text = text.replace('{', "(").replace('}', ")");
            text = text.replace(")))", ")!");
            text = text.replace("'l", "'!");
        }

        self.whitespace.replace_all(&text, " ").trim().to_string()
    }
}

fn whitespace_regex() -> Regex {
    Regex::new(r"\s+").expect("whitespace regex is valid")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules_with_formatting(special: SpecialFormatting) -> CorrectionRules {
        let mut rules = CorrectionRules::defaults();
        rules.special = special;
        rules
    }

    #[test]
    fn test_default_replacements() {
        let rules = CorrectionRules::defaults();
        assert_eq!(rules.apply("Bob was Killea!"), "Bob was killed!");
        assert_eq!(rules.apply("promoted toa Member"), "promoted to a Member");
        assert_eq!(rules.apply("removed trom the Tribe"), "removed from the Tribe");
    }

    #[test]
    fn test_whitespace_collapse() {
        let rules = CorrectionRules::defaults();
        assert_eq!(rules.apply("  Day 12,   10:15:30:  hello  "), "Day 12, 10:15:30: hello");
    }

    #[test]
    fn test_word_spacing() {
        let rules = rules_with_formatting(SpecialFormatting {
            word_spacing: vec!["Tribe".to_string()],
            clean_endings: CleanEndings::default(),
        });
        assert_eq!(rules.apply("YourTribe!"), "Your Tribe!");
    }

    #[test]
    fn test_quote_and_parenthesis_normalization() {
        let rules = rules_with_formatting(SpecialFormatting {
            word_spacing: vec![],
            clean_endings: CleanEndings { remove_quotes: true, fix_parentheses: true },
        });
        assert_eq!(rules.apply("Bob\u{2019}s {Rex}"), "Bob's (Rex)");
        assert_eq!(rules.apply("Rex - Lvl 100)))"), "Rex - Lvl 100)!");
    }

    #[test]
    fn test_load_missing_file_falls_back_to_defaults() {
        let rules = CorrectionRules::load(Path::new("/nonexistent/replacements.json"));
        assert_eq!(rules.apply("Killea"), "killed");
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("replacements.json");
        std::fs::write(
            &path,
            r#"{
                "replacements": {"tamea": "tamed"},
                "special_formatting": {
                    "word_spacing": [],
                    "clean_endings": {"remove_quotes": true, "fix_parentheses": false}
                }
            }"#,
        )
        .unwrap();

        let rules = CorrectionRules::load(&path);
        assert_eq!(rules.apply("Bob tamea a Rex"), "Bob tamed a Rex");
        assert_eq!(rules.apply("Bob\u{2019}s Rex"), "Bob's Rex");
    }
}

//! Sentence segmentation — text → ordered [`SpeakableUnit`]s.
//!
//! Paragraphs (blocks separated by a blank line) are scanned for runs of
//! terminal punctuation (`.`, `!`, `?`, `…`).  A run ends a unit unless it
//! sits between two digits (`125.000`, `3.5`), or the token in front of it
//! is a known abbreviation or is at most two characters long; then the
//! punctuation stays inside the running unit.
//! Whatever is left at the end of a paragraph becomes a unit of its own.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default ceiling on units per job.
pub const DEFAULT_MAX_UNITS: usize = 500;

/// Abbreviations that never end a sentence (case-sensitive, without the dot).
pub const ABBREVIATIONS: &[&str] = &[
    "Dr", "Prof", "vs", "vb", "örn", "sayfa", "no", "ör", "Doç", "Yrd", "Yrd.Doç", "Uz", "Müh",
    "Mim", "Av", "Ltd", "Şti", "A.Ş", "Ltd.Şti",
];

static RE_TERMINAL: Lazy<Regex> = Lazy::new(|| Regex::new(r"[.!?…]+\s*").unwrap());
static RE_PARAGRAPH: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n[ \t\r]*\n").unwrap());

const QUOTES: &[char] = &['"', '“', '”', '„', '«', '»'];
const DASHES: &[char] = &['—', '–'];

// ─────────────────────────────────────────────────────────────────────────────
// Unit model
// ─────────────────────────────────────────────────────────────────────────────

/// Prosodic type of a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitKind {
    Statement,
    Question,
    Exclamation,
    Dialogue,
}

impl UnitKind {
    /// Question and exclamation are decided by the last character and win
    /// over dialogue markers anywhere in the text.
    pub fn classify(text: &str) -> Self {
        let text = text.trim();
        if text.ends_with('?') {
            UnitKind::Question
        } else if text.ends_with('!') {
            UnitKind::Exclamation
        } else if text.contains(QUOTES) || text.contains(DASHES) {
            UnitKind::Dialogue
        } else {
            UnitKind::Statement
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            UnitKind::Statement => "statement",
            UnitKind::Question => "question",
            UnitKind::Exclamation => "exclamation",
            UnitKind::Dialogue => "dialogue",
        }
    }
}

impl fmt::Display for UnitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Seconds of silence after a unit, from its trailing punctuation.
pub fn pause_after(text: &str) -> f32 {
    let text = text.trim_end();
    if text.ends_with("...") || text.ends_with('…') {
        0.8
    } else if text.ends_with('!') || text.ends_with('?') {
        0.6
    } else if text.ends_with(';') {
        0.4
    } else if text.ends_with(':') {
        0.3
    } else if text.ends_with('.') {
        0.5
    } else if text.ends_with(',') {
        0.2
    } else {
        0.3
    }
}

/// One sentence-like piece of narration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeakableUnit {
    pub text: String,
    pub kind: UnitKind,
    pub word_count: usize,
    /// Seconds of silence to insert after this unit's audio.
    pub pause_after: f32,
}

impl SpeakableUnit {
    /// Build a unit from raw text.  Internal whitespace is collapsed.
    /// Returns `None` for blank input.
    pub fn new(text: &str) -> Option<Self> {
        let words: Vec<&str> = text.split_whitespace().collect();
        if words.is_empty() {
            return None;
        }
        let text = words.join(" ");
        Some(Self {
            kind: UnitKind::classify(&text),
            word_count: words.len(),
            pause_after: pause_after(&text),
            text,
        })
    }

    pub fn pause(&self) -> Duration {
        Duration::from_secs_f32(self.pause_after)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Segmenter
// ─────────────────────────────────────────────────────────────────────────────

/// Splits normalised text into units.
#[derive(Debug, Clone)]
pub struct Segmenter {
    abbreviations: Vec<String>,
    max_units: usize,
}

impl Default for Segmenter {
    fn default() -> Self {
        Self {
            abbreviations: ABBREVIATIONS.iter().map(|s| s.to_string()).collect(),
            max_units: DEFAULT_MAX_UNITS,
        }
    }
}

impl Segmenter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the ceiling above which [`split`](Self::split) refuses the text.
    pub fn with_max_units(mut self, max_units: usize) -> Self {
        self.max_units = max_units;
        self
    }

    /// Add an extra abbreviation (without its trailing dot).
    pub fn with_abbreviation(mut self, abbr: impl Into<String>) -> Self {
        self.abbreviations.push(abbr.into());
        self
    }

    pub fn max_units(&self) -> usize {
        self.max_units
    }

    /// Split `text` into units.
    ///
    /// Fails with [`Error::Validation`] when the text yields more units than
    /// the configured ceiling; the caller has to split the job.
    pub fn split(&self, text: &str) -> Result<Vec<SpeakableUnit>> {
        let units = self.split_unbounded(text);
        if units.len() > self.max_units {
            return Err(Error::Validation(format!(
                "text produces {} units, more than the ceiling of {}; split it into smaller jobs",
                units.len(),
                self.max_units
            )));
        }
        Ok(units)
    }

    /// Split without enforcing the ceiling.
    pub fn split_unbounded(&self, text: &str) -> Vec<SpeakableUnit> {
        RE_PARAGRAPH
            .split(text)
            .filter(|p| !p.trim().is_empty())
            .flat_map(|p| self.split_paragraph(p))
            .filter_map(|s| SpeakableUnit::new(&s))
            .collect()
    }

    fn split_paragraph(&self, paragraph: &str) -> Vec<String> {
        let mut sentences = Vec::new();
        let mut current = String::new();
        let mut last = 0;

        for m in RE_TERMINAL.find_iter(paragraph) {
            current.push_str(&paragraph[last..m.end()]);
            last = m.end();
            if is_inside_number(paragraph, m.start(), m.end()) {
                continue;
            }
            if !self.is_abbreviation_end(&current) {
                sentences.push(std::mem::take(&mut current));
            }
        }
        current.push_str(&paragraph[last..]);
        if !current.trim().is_empty() {
            sentences.push(current);
        }
        sentences
    }

    /// True when the token before the trailing punctuation of `text` is an
    /// abbreviation or has at most two characters.
    fn is_abbreviation_end(&self, text: &str) -> bool {
        let Some(last) = text.split_whitespace().last() else {
            return false;
        };
        let token = last.trim_end_matches(['.', '!', '?', '…']);
        token.chars().count() <= 2 || self.abbreviations.iter().any(|a| a == token)
    }
}

/// Punctuation with a digit on both sides and no space after it.
fn is_inside_number(text: &str, start: usize, end: usize) -> bool {
    let before = text[..start].chars().next_back();
    let after = text[end..].chars().next();
    matches!((before, after), (Some(b), Some(a)) if b.is_ascii_digit() && a.is_ascii_digit())
}

/// Count units per kind, for reporting.
pub fn kind_histogram(units: &[SpeakableUnit]) -> BTreeMap<UnitKind, usize> {
    let mut counts = BTreeMap::new();
    for u in units {
        *counts.entry(u.kind).or_insert(0) += 1;
    }
    counts
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn texts(units: &[SpeakableUnit]) -> Vec<&str> {
        units.iter().map(|u| u.text.as_str()).collect()
    }

    #[test]
    fn test_abbreviation_does_not_split() {
        let units = Segmenter::new().split("Dr. Ahmet geldi. Gitti.").unwrap();
        assert_eq!(texts(&units), vec!["Dr. Ahmet geldi.", "Gitti."]);
    }

    #[test]
    fn test_numbers_do_not_split() {
        let units = Segmenter::new()
            .split("Nüfus 125.000 kişiydi. Oran 3.5 puan arttı. Yıl 1923. Sonra barış geldi.")
            .unwrap();
        assert_eq!(
            texts(&units),
            vec!["Nüfus 125.000 kişiydi.", "Oran 3.5 puan arttı.", "Yıl 1923.", "Sonra barış geldi."]
        );
    }

    #[test]
    fn test_three_sentence_scenario() {
        let units = Segmenter::new()
            .split("Merhaba! Bu bir test cümlesidir. Çalışıyor mu?")
            .unwrap();
        assert_eq!(units.len(), 3);

        assert_eq!(units[0].text, "Merhaba!");
        assert_eq!(units[0].kind, UnitKind::Exclamation);
        assert_eq!(units[0].pause_after, 0.6);

        assert_eq!(units[1].text, "Bu bir test cümlesidir.");
        assert_eq!(units[1].kind, UnitKind::Statement);
        assert_eq!(units[1].pause_after, 0.5);
        assert_eq!(units[1].word_count, 4);

        assert_eq!(units[2].text, "Çalışıyor mu?");
        assert_eq!(units[2].kind, UnitKind::Question);
        assert_eq!(units[2].pause_after, 0.6);
    }

    #[test]
    fn test_pause_table() {
        assert_eq!(pause_after("Bekle..."), 0.8);
        assert_eq!(pause_after("Bekle…"), 0.8);
        assert_eq!(pause_after("Dur!"), 0.6);
        assert_eq!(pause_after("Neden?"), 0.6);
        assert_eq!(pause_after("bir; "), 0.4);
        assert_eq!(pause_after("şunlar:"), 0.3);
        assert_eq!(pause_after("Bitti."), 0.5);
        assert_eq!(pause_after("ama,"), 0.2);
        assert_eq!(pause_after("noktasız"), 0.3);
    }

    #[test]
    fn test_classification_precedence() {
        assert_eq!(UnitKind::classify("\"Geliyor musun?"), UnitKind::Question);
        assert_eq!(UnitKind::classify("— Koş!"), UnitKind::Exclamation);
        assert_eq!(UnitKind::classify("“Harika,” dedi."), UnitKind::Dialogue);
        assert_eq!(UnitKind::classify("Ali – Veli geldi."), UnitKind::Dialogue);
        assert_eq!(UnitKind::classify("Hava güzel."), UnitKind::Statement);
    }

    #[test]
    fn test_unterminated_tail_uses_default_pause() {
        let units = Segmenter::new().split("Birinci cümle bitti. ikinci yarım kaldı").unwrap();
        assert_eq!(texts(&units), vec!["Birinci cümle bitti.", "ikinci yarım kaldı"]);
        assert_eq!(units[1].pause_after, 0.3);
    }

    #[test]
    fn test_paragraphs_and_blank_input() {
        let seg = Segmenter::new();
        assert!(seg.split("").unwrap().is_empty());
        assert!(seg.split("   \n\n \t \n\n").unwrap().is_empty());

        let units = seg.split("İlk paragraf burada\n\n\n\nİkinci paragraf burada").unwrap();
        assert_eq!(texts(&units), vec!["İlk paragraf burada", "İkinci paragraf burada"]);
    }

    #[test]
    fn test_coverage_is_lossless() {
        let input = "Evet, çok iyi çalışıyor... Dr. Ahmet'in söylediği gibi.\n\n\
                     \"Bu harika bir sistem,\" dedi Ayşe. İşte böyle!  Son parça";
        let units = Segmenter::new().split(input).unwrap();
        let joined = texts(&units).join(" ");
        let expected = input.split_whitespace().collect::<Vec<_>>().join(" ");
        assert_eq!(joined, expected);
    }

    #[test]
    fn test_ellipsis_run_is_one_boundary() {
        let units = Segmenter::new().split("Bekledi... Sonra gitti.").unwrap();
        assert_eq!(texts(&units), vec!["Bekledi...", "Sonra gitti."]);
        assert_eq!(units[0].pause_after, 0.8);
    }

    #[test]
    fn test_ceiling_is_enforced() {
        let text = "Cümle burada. ".repeat(501);
        let err = Segmenter::new().with_max_units(500).split(&text).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        let ok = Segmenter::new().with_max_units(501).split(&text).unwrap();
        assert_eq!(ok.len(), 501);
    }

    #[test]
    fn test_histogram() {
        let units = Segmenter::new().split("Evet. Hayır! Neden? Tamam.").unwrap();
        let h = kind_histogram(&units);
        assert_eq!(h[&UnitKind::Statement], 2);
        assert_eq!(h[&UnitKind::Exclamation], 1);
        assert_eq!(h[&UnitKind::Question], 1);
    }
}

//! Input documents → raw narration text.
//!
//! Plain text is read as is.  PDFs go through the external `pdftotext`
//! tool (poppler); each page becomes its own paragraph and line-wrap
//! artefacts are repaired.

use std::path::Path;
use std::process::Command;

use anyhow::{bail, Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

/// Average narration speed used for the length estimate.
pub const WORDS_PER_MINUTE: f64 = 150.0;

static RE_SPACES: Lazy<Regex> = Lazy::new(|| Regex::new(r" +").unwrap());
static RE_BLANK_LINES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n\s*\n\s*\n+").unwrap());
static RE_HYPHEN_BREAK: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\w+)-\n(\w+)").unwrap());

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExtractedText {
    pub text: String,
    pub pages: usize,
    pub word_count: usize,
    pub estimated_minutes: f64,
}

impl ExtractedText {
    /// Join pages with a blank line between them.
    pub fn from_pages(pages: Vec<String>) -> Self {
        let cleaned: Vec<String> = pages
            .iter()
            .map(|p| clean_extracted(p).trim().to_string())
            .filter(|p| !p.is_empty())
            .collect();
        let text = cleaned.join("\n\n");
        let word_count = text.split_whitespace().count();
        Self {
            text,
            pages: pages.len(),
            word_count,
            estimated_minutes: word_count as f64 / WORDS_PER_MINUTE,
        }
    }
}

/// Repair common extraction artefacts: runs of spaces, piles of blank
/// lines, and words hyphenated across a line break.
pub fn clean_extracted(text: &str) -> String {
    let text = RE_SPACES.replace_all(text, " ");
    let text = RE_BLANK_LINES.replace_all(&text, "\n\n");
    RE_HYPHEN_BREAK.replace_all(&text, "$1$2").into_owned()
}

pub trait TextSource {
    fn extract(&self, path: &Path) -> Result<ExtractedText>;
}

/// `.txt` / `.md` and anything else that is UTF-8 text.
pub struct PlainText;

impl TextSource for PlainText {
    fn extract(&self, path: &Path) -> Result<ExtractedText> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read {}", path.display()))?;
        Ok(ExtractedText::from_pages(vec![text]))
    }
}

/// PDF extraction through `pdftotext`.
pub struct PdfToText {
    program: String,
}

impl Default for PdfToText {
    fn default() -> Self {
        Self { program: "pdftotext".to_string() }
    }
}

impl PdfToText {
    pub fn with_program(program: impl Into<String>) -> Self {
        Self { program: program.into() }
    }
}

impl TextSource for PdfToText {
    fn extract(&self, path: &Path) -> Result<ExtractedText> {
        let program = which::which(&self.program)
            .with_context(|| format!("'{}' not found on PATH (install poppler-utils)", self.program))?;
        let output = Command::new(program)
            .args(["-enc", "UTF-8"])
            .arg(path)
            .arg("-")
            .output()
            .with_context(|| format!("failed to run {}", self.program))?;
        if !output.status.success() {
            bail!(
                "{} failed on {}: {}",
                self.program,
                path.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        let text = String::from_utf8_lossy(&output.stdout);
        // pdftotext ends every page with a form feed
        let pages: Vec<String> = text
            .split('\u{c}')
            .map(str::to_string)
            .filter(|p| !p.trim().is_empty())
            .collect();
        let extracted = ExtractedText::from_pages(pages);
        log::info!(
            "{}: {} pages, {} words (~{:.0} min)",
            path.display(),
            extracted.pages,
            extracted.word_count,
            extracted.estimated_minutes
        );
        Ok(extracted)
    }
}

/// Extract with the source matching `path`'s extension.
pub fn extract(path: &Path) -> Result<ExtractedText> {
    let is_pdf = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("pdf"));
    if is_pdf {
        PdfToText::default().extract(path)
    } else {
        PlainText.extract(path)
    }
}

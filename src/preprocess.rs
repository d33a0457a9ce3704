//! Text cleanup before segmentation.
//!
//! Turns raw book text into something the synthesiser reads cleanly while
//! keeping Turkish letters (ş ğ ü ö ç ı İ and their capitals) intact.
//! Paragraph breaks survive so the segmenter can still see them.

use once_cell::sync::Lazy;
use regex::Regex;
use unicode_normalization::char::{decompose_canonical, is_combining_mark};
use unicode_normalization::UnicodeNormalization;

// ─────────────────────────────────────────────────────────────────────────────
// Diacritics
// ─────────────────────────────────────────────────────────────────────────────

/// Turkish letters that have a canonical decomposition but must not be
/// folded.  `ı` has none and passes through untouched.
const TURKISH_LETTERS: &[char] = &['ş', 'Ş', 'ç', 'Ç', 'ğ', 'Ğ', 'ü', 'Ü', 'ö', 'Ö', 'İ'];

/// Letters whose stroke is not a combining mark, so decomposition alone
/// does not reach the base letter.
fn fold_stroke(c: char) -> Option<char> {
    let base = match c {
        'Đ' | 'Ð' => 'D',
        'đ' | 'ð' => 'd',
        'Ø' => 'O',
        'ø' => 'o',
        'Ł' => 'L',
        'ł' => 'l',
        _ => return None,
    };
    Some(base)
}

/// Strip accents (`hikâye` → `hikaye`, `ẕ` → `z`) but keep Turkish letters.
///
/// Input is composed first (NFC) so decomposed Turkish letters are
/// recognised; every other letter is decomposed (NFD) and loses its
/// combining marks.
pub fn remove_diacritics(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.nfc() {
        if TURKISH_LETTERS.contains(&c) {
            out.push(c);
        } else if let Some(base) = fold_stroke(c) {
            out.push(base);
        } else {
            decompose_canonical(c, |d| {
                if !is_combining_mark(d) {
                    out.push(d);
                }
            });
        }
    }
    out
}

// ─────────────────────────────────────────────────────────────────────────────
// Regex-based steps
// ─────────────────────────────────────────────────────────────────────────────

static RE_SPECIAL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"[^a-zA-ZşğüöçıİŞĞÜÖÇ0-9\s.,!?:;\-—–'"“”„«»‘’()\[\]…]"#).unwrap()
});
static RE_PARAGRAPH: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n\s*\n").unwrap());
static RE_LONG_DOTS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\.{4,}").unwrap());
static RE_SPACE_BEFORE_PUNCT: Lazy<Regex> = Lazy::new(|| Regex::new(r"[ \t]+([.,!?:;])").unwrap());
static RE_NO_SPACE_AFTER_PUNCT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"([.,!?:;])([^\s.,!?:;0-9"'”’»)\]…])"#).unwrap());

/// Drop characters a narrator cannot read.  Letters (ASCII and Turkish),
/// digits, whitespace and ordinary punctuation stay.
pub fn remove_special_characters(text: &str) -> String {
    RE_SPECIAL.replace_all(text, "").into_owned()
}

/// Collapse whitespace inside each paragraph; paragraphs are re-joined with
/// one blank line.
pub fn normalize_whitespace(text: &str) -> String {
    RE_PARAGRAPH
        .split(text)
        .map(|p| p.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// `....` → `...`, no space before `.,!?:;`, one space after them.
pub fn fix_common_issues(text: &str) -> String {
    let text = RE_LONG_DOTS.replace_all(text, "...");
    let text = RE_SPACE_BEFORE_PUNCT.replace_all(&text, "$1");
    RE_NO_SPACE_AFTER_PUNCT.replace_all(&text, "$1 $2").into_owned()
}

// ─────────────────────────────────────────────────────────────────────────────
// TextCleaner — full pipeline
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct CleanerConfig {
    pub remove_diacritics: bool,
    pub remove_special_characters: bool,
    pub normalize_whitespace: bool,
    pub fix_common_issues: bool,
}

impl Default for CleanerConfig {
    fn default() -> Self {
        Self {
            remove_diacritics: true,
            remove_special_characters: true,
            normalize_whitespace: true,
            fix_common_issues: true,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TextCleaner {
    pub config: CleanerConfig,
}

impl TextCleaner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: CleanerConfig) -> Self {
        Self { config }
    }

    pub fn clean(&self, text: &str) -> String {
        let cfg = &self.config;
        let before = text.chars().count();
        let mut text = text.to_string();

        if cfg.remove_diacritics {
            text = remove_diacritics(&text);
        }
        if cfg.remove_special_characters {
            text = remove_special_characters(&text);
        }
        if cfg.normalize_whitespace {
            text = normalize_whitespace(&text);
        }
        if cfg.fix_common_issues {
            text = fix_common_issues(&text);
        }

        log::debug!("cleaned text: {before} → {} chars", text.chars().count());
        text
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_turkish_letters_survive() {
        let s = "Türkçe karakterler: şğüöçıİ ŞĞÜÖÇI";
        assert_eq!(remove_diacritics(s), s);
        assert_eq!(TextCleaner::new().clean(s), s);
    }

    #[test]
    fn test_accents_folded() {
        assert_eq!(remove_diacritics("Her insanın bir hikâyesi vardır"), "Her insanın bir hikayesi vardır");
        assert_eq!(remove_diacritics("Bazı kelimeler ẕ harfi ile"), "Bazı kelimeler z harfi ile");
        assert_eq!(remove_diacritics("Café São Paulo"), "Cafe Sao Paulo");
    }

    #[test]
    fn test_any_latin_accent_folded() {
        assert_eq!(
            remove_diacritics("Nguyễn, Đạt ve Žižek ǎ ȩ geldi."),
            "Nguyen, Dat ve Zizek a e geldi."
        );
        assert_eq!(remove_diacritics("Łódź ve Ørsted"), "Lodz ve Orsted");
        assert_eq!(
            TextCleaner::new().clean("Dvořák ile Nguyễn çalıştı."),
            "Dvorak ile Nguyen çalıştı."
        );
    }

    #[test]
    fn test_decomposed_turkish_recomposed() {
        assert_eq!(remove_diacritics("s\u{327}eker g\u{306}u\u{308}zel"), "şeker ğüzel");
        assert_eq!(remove_diacritics("e\u{301}"), "e");
        assert_eq!(remove_diacritics("I\u{307}stanbul x\u{301}"), "İstanbul x");
    }

    #[test]
    fn test_special_characters_removed() {
        assert_eq!(
            remove_special_characters("Özel@#$%karakterler&*() burada"),
            "Özelkarakterler() burada"
        );
        assert_eq!(remove_special_characters("“Gel” dedi — sonra…"), "“Gel” dedi — sonra…");
    }

    #[test]
    fn test_whitespace_keeps_paragraphs() {
        assert_eq!(normalize_whitespace("Çok    fazla \t boşluk"), "Çok fazla boşluk");
        assert_eq!(normalize_whitespace("  Bir.\n iki.\n\n \n Üç.  "), "Bir. iki.\n\nÜç.");
    }

    #[test]
    fn test_common_fixes() {
        assert_eq!(fix_common_issues("Bekle..... geldi"), "Bekle... geldi");
        assert_eq!(fix_common_issues("Merhaba , dünya !"), "Merhaba, dünya!");
        assert_eq!(fix_common_issues("Geldi.Gitti,sonra"), "Geldi. Gitti, sonra");
        assert_eq!(fix_common_issues("Saat 10:30 ve 3.5 kilo"), "Saat 10:30 ve 3.5 kilo");
    }

    #[test]
    fn test_full_pipeline() {
        let raw = "Bir  zamanlar , uzak bir ülkede...Kral  “Gel!” dedi.\n\n\nSonra   gitti.";
        let cleaned = TextCleaner::new().clean(raw);
        assert_eq!(cleaned, "Bir zamanlar, uzak bir ülkede... Kral “Gel!” dedi.\n\nSonra gitti.");
    }

    #[test]
    fn test_steps_can_be_disabled() {
        let cleaner = TextCleaner::with_config(CleanerConfig {
            remove_diacritics: false,
            ..CleanerConfig::default()
        });
        assert_eq!(cleaner.clean("hikâye"), "hikye");
    }
}

//! Verification code extraction
//!
//! Codes arrive in a handful of shapes: `123456`, `1 2 3 4 5 6` and
//! `1-2-3-4-5-6`. Every match becomes a [`CodeCandidate`] with a
//! confidence score; the best one wins.

use regex::Regex;
use std::cmp::Ordering;

const KEYWORDS: [&str; 6] = ["code", "verification", "verify", "otp", "pin", "token"];
const CONTEXT_WINDOW: usize = 50;

/// Which pattern produced a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeFormat {
    Continuous,
    Spaced,
    Dashed,
}

/// A possible verification code and how sure we are about it.
#[derive(Debug, Clone, PartialEq)]
pub struct CodeCandidate {
    /// Digits only.
    pub code: String,
    /// 0.0 to 1.0
    pub confidence: f32,
    pub format: CodeFormat,
}

#[derive(Debug, Clone)]
pub struct CodeParser {
    patterns: [(CodeFormat, Regex); 3],
    blocks: Regex,
    tags: Regex,
}

impl CodeParser {
    /// # Panics
    ///
    /// Panics if `code_length` is zero.
    #[must_use]
    pub fn new(code_length: usize) -> Self {
        assert!(code_length > 0, "code length must be positive");
        let rest = code_length - 1;
        let build = |pattern: String| Regex::new(&pattern).expect("valid code pattern");
        Self {
            patterns: [
                (CodeFormat::Continuous, build(format!(r"\b\d{{{code_length}}}\b"))),
                (CodeFormat::Spaced, build(format!(r"\b\d(?:[ \t\r\n]+\d){{{rest}}}\b"))),
                (CodeFormat::Dashed, build(format!(r"\b\d(?:-\d){{{rest}}}\b"))),
            ],
            blocks: Regex::new(r"(?is)<(?:style|script)\b[^>]*>.*?</(?:style|script)\s*>")
                .expect("valid block pattern"),
            tags: Regex::new(r"<[^>]+>").expect("valid tag pattern"),
        }
    }

    /// Best code in `content` (plain text or HTML), if any.
    #[must_use]
    pub fn parse(&self, content: &str) -> Option<String> {
        let clean = self.clean_html(content);
        self.find_candidates(&clean)
            .into_iter()
            .next()
            .map(|c| c.code)
    }

    /// All candidates in already-cleaned text, best first.
    #[must_use]
    pub fn find_candidates(&self, content: &str) -> Vec<CodeCandidate> {
        let mut candidates = Vec::new();

        for (format, pattern) in &self.patterns {
            for m in pattern.find_iter(content) {
                let code: String = m.as_str().chars().filter(char::is_ascii_digit).collect();
                let confidence = confidence(*format, content, m.start(), m.end());
                candidates.push(CodeCandidate {
                    code,
                    confidence,
                    format: *format,
                });
            }
        }

        // stable: equal scores keep pattern order, then position order
        candidates.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(Ordering::Equal)
        });
        candidates
    }

    fn clean_html(&self, content: &str) -> String {
        let without_blocks = self.blocks.replace_all(content, " ");
        self.tags
            .replace_all(&without_blocks, " ")
            .replace("&nbsp;", " ")
    }
}

fn confidence(format: CodeFormat, text: &str, start: usize, end: usize) -> f32 {
    let mut score: f32 = match format {
        CodeFormat::Continuous => 0.8,
        CodeFormat::Spaced | CodeFormat::Dashed => 0.9,
    };

    let window_start = floor_boundary(text, start.saturating_sub(CONTEXT_WINDOW));
    let window_end = ceil_boundary(text, (start + CONTEXT_WINDOW).min(text.len()));
    let local = text[window_start..window_end].to_lowercase();
    if KEYWORDS.iter().any(|k| local.contains(k)) {
        score += 0.1;
    }

    if start > 0 && end < text.len() {
        let before = &text[floor_boundary(text, start.saturating_sub(2))..start];
        let after = &text[end..ceil_boundary(text, (end + 2).min(text.len()))];
        let standalone = |s: &str| s.contains('\n') || s.chars().all(char::is_whitespace);
        if standalone(before) && standalone(after) {
            score += 0.05;
        }
    }

    score.min(1.0)
}

fn floor_boundary(text: &str, mut idx: usize) -> usize {
    while !text.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

fn ceil_boundary(text: &str, mut idx: usize) -> usize {
    while !text.is_char_boundary(idx) {
        idx += 1;
    }
    idx
}

impl Default for CodeParser {
    fn default() -> Self {
        Self::new(6)
    }
}

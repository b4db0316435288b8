//! # Summarizers
//!
//! Levels 1 and 2 call a pluggable [`Summarizer`]; production hosts pass an
//! LLM-backed implementation, [`ExtractiveSummarizer`] is the deterministic default.
//! Level 3 never calls a summarizer: [`build_digest`] extracts a bounded digest with
//! fixed pattern rules.

use itertools::Itertools;
use lazy_static::lazy_static;
use regex::Regex;

/// Upper bound on a level-3 digest, in characters
pub const MAX_DIGEST_CHARS: usize = 1024;

/// Upper bound on one summary's contribution to a digest
pub const MAX_DIGEST_ENTRY_CHARS: usize = 240;

/// Upper bound on one extracted sentence in the default summarizer
pub const MAX_SENTENCE_CHARS: usize = 200;

/// Separator between digest entries
pub const DIGEST_SEPARATOR: &str = " | ";

lazy_static! {
    static ref FILE_PATH: Regex = Regex::new(
        r"(?:[A-Za-z]:\\|/|\./|\.\./)?(?:[\w.-]+[/\\])+[\w.-]+\.[A-Za-z0-9]{1,8}\b|\b[\w-]+\.(?:rs|py|js|ts|tsx|go|java|c|h|cpp|hpp|rb|toml|json|yaml|yml|md|txt|sql|sh|log|cfg|ini)\b"
    )
    .expect("file path pattern is valid");
    static ref ERROR_TEXT: Regex = Regex::new(
        r"(?i)\b(?:[A-Z]\w*(?:Error|Exception)|error|exception|panic(?:ked)?|traceback|fatal|failed)\b[^.\n|]{0,120}"
    )
    .expect("error pattern is valid");
}

/// Turns a batch of texts into one summary text
///
/// Failures abort the current compaction level without writing anything.
pub trait Summarizer: Send + Sync {
    /// Summarize `texts`, given in sequence order
    fn summarize(&self, texts: &[String]) -> anyhow::Result<String>;
}

impl<F> Summarizer for F
where
    F: Fn(&[String]) -> anyhow::Result<String> + Send + Sync,
{
    fn summarize(&self, texts: &[String]) -> anyhow::Result<String> {
        self(texts)
    }
}

/// First sentence of every text, joined with a space
#[derive(Debug, Clone, Copy, Default)]
pub struct ExtractiveSummarizer;

impl Summarizer for ExtractiveSummarizer {
    fn summarize(&self, texts: &[String]) -> anyhow::Result<String> {
        Ok(texts
            .iter()
            .map(|t| first_sentence(t, MAX_SENTENCE_CHARS))
            .filter(|s| !s.is_empty())
            .join(" "))
    }
}

/// Leading sentence of `text`, at most `max_chars` characters
///
/// A sentence ends at `.`, `!` or `?` followed by whitespace or the end of the text.
pub fn first_sentence(text: &str, max_chars: usize) -> String {
    let text = text.trim();
    let mut chars = text.char_indices().peekable();
    let mut end = text.len();
    while let Some((idx, c)) = chars.next() {
        if matches!(c, '.' | '!' | '?') {
            let at_boundary = chars.peek().map_or(true, |(_, next)| next.is_whitespace());
            if at_boundary {
                end = idx + c.len_utf8();
                break;
            }
        }
    }
    truncate_chars(&text[..end], max_chars)
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => text[..idx].trim_end().to_string(),
        None => text.to_string(),
    }
}

/// One summary's digest entry: first sentence, file paths, error fragments
///
/// Paths and errors are cut first: the entry is truncated to `entry_cap` characters
/// but never below its first sentence.
pub fn digest_entry(content: &str, entry_cap: usize) -> String {
    let sentence = first_sentence(content, MAX_DIGEST_ENTRY_CHARS);
    let floor = sentence.chars().count();
    let paths = FILE_PATH.find_iter(content).map(|m| m.as_str().to_string());
    let errors = ERROR_TEXT
        .find_iter(content)
        .map(|m| m.as_str().trim().to_string());

    let entry = std::iter::once(sentence)
        .chain(paths)
        .chain(errors)
        .filter(|part| !part.is_empty())
        .unique()
        // Fragments already inside the first sentence add nothing
        .enumerate()
        .fold(Vec::<String>::new(), |mut kept, (i, part)| {
            if i == 0 || !kept[0].contains(part.as_str()) {
                kept.push(part);
            }
            kept
        })
        .join(" ");
    truncate_chars(&entry, entry_cap.clamp(floor, MAX_DIGEST_ENTRY_CHARS))
}

/// Level-3 digest over `contents` with entries cut to `entry_cap`, never longer
/// than [`MAX_DIGEST_CHARS`]
pub fn build_digest(contents: &[String], entry_cap: usize) -> String {
    let digest = contents
        .iter()
        .map(|c| digest_entry(c, entry_cap))
        .filter(|e| !e.is_empty())
        .unique()
        .join(DIGEST_SEPARATOR);
    truncate_chars(&digest, MAX_DIGEST_CHARS)
}

/// Entries of an existing digest, so re-digesting it keeps every entry
pub fn digest_entries(digest: &str) -> impl Iterator<Item = &str> {
    digest.split(DIGEST_SEPARATOR).filter(|e| !e.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_sentence() {
        assert_eq!(first_sentence("Done. Next step pending.", 200), "Done.");
        assert_eq!(first_sentence("Is it ready? Yes", 200), "Is it ready?");
        assert_eq!(first_sentence("no terminator here", 200), "no terminator here");
        assert_eq!(first_sentence("", 200), "");
    }

    #[test]
    fn test_first_sentence_ignores_inner_dots() {
        assert_eq!(
            first_sentence("Edited src/main.rs today. Then tests.", 200),
            "Edited src/main.rs today."
        );
        assert_eq!(first_sentence("Version 1.2 shipped. Ok.", 200), "Version 1.2 shipped.");
    }

    #[test]
    fn test_first_sentence_respects_char_cap() {
        let s = first_sentence("ééééééééé", 4);
        assert_eq!(s.chars().count(), 4);
    }

    #[test]
    fn test_extractive_summarizer() {
        let texts = vec![
            "Opened the file. Read it.".to_string(),
            String::new(),
            "Fixed the bug! Celebrated.".to_string(),
        ];
        assert_eq!(
            ExtractiveSummarizer.summarize(&texts).unwrap(),
            "Opened the file. Fixed the bug!"
        );
    }

    #[test]
    fn test_closure_summarizer() {
        let summarizer = |texts: &[String]| -> anyhow::Result<String> {
            Ok(format!("{} texts", texts.len()))
        };
        assert_eq!(
            summarizer.summarize(&["a".into(), "b".into()]).unwrap(),
            "2 texts"
        );
    }

    #[test]
    fn test_digest_entry_keeps_paths_and_errors() {
        let entry = digest_entry(
            "Refactored the loader. Touched crates/core/src/lib.rs and config.toml. \
             Then hit TypeError: cannot read property x",
            MAX_DIGEST_ENTRY_CHARS,
        );
        assert!(entry.starts_with("Refactored the loader."));
        assert!(entry.contains("crates/core/src/lib.rs"));
        assert!(entry.contains("config.toml"));
        assert!(entry.contains("TypeError: cannot read property x"));
    }

    #[test]
    fn test_digest_entry_never_cuts_into_first_sentence() {
        let content = "Step 1 edited src/file_1.rs. Also touched src/file_4.rs.";
        assert_eq!(digest_entry(content, 0), "Step 1 edited src/file_1.rs.");
        assert_eq!(digest_entry(content, 5), "Step 1 edited src/file_1.rs.");
        assert_eq!(
            digest_entry(content, MAX_DIGEST_ENTRY_CHARS),
            "Step 1 edited src/file_1.rs. src/file_4.rs"
        );
    }

    #[test]
    fn test_redigesting_a_digest_is_stable() {
        let contents = vec![
            "Step 1 edited src/file_1.rs. Also touched src/file_4.rs.".to_string(),
            "Step 5 failed. error: linker exited with code 1".to_string(),
        ];
        let digest = build_digest(&contents, MAX_DIGEST_ENTRY_CHARS);
        let entries: Vec<String> = digest_entries(&digest).map(str::to_string).collect();
        assert_eq!(entries.len(), 2);
        assert_eq!(build_digest(&entries, MAX_DIGEST_ENTRY_CHARS), digest);
        assert_eq!(
            build_digest(&entries, 0),
            "Step 1 edited src/file_1.rs. | Step 5 failed."
        );
    }

    #[test]
    fn test_digest_is_bounded() {
        let huge = vec!["word ".repeat(10_000); 50];
        let digest = build_digest(&huge, MAX_DIGEST_ENTRY_CHARS);
        assert!(digest.chars().count() <= MAX_DIGEST_CHARS);

        let distinct: Vec<String> = (0..50)
            .map(|i| format!("Entry {i} {}", "word ".repeat(100)))
            .collect();
        let digest = build_digest(&distinct, MAX_DIGEST_ENTRY_CHARS);
        assert!(digest.chars().count() <= MAX_DIGEST_CHARS);
        assert!(digest.starts_with("Entry 0 word"));
    }

    #[test]
    fn test_digest_joins_and_dedupes_entries() {
        let contents = vec![
            "Alpha done.".to_string(),
            "Alpha done.".to_string(),
            "Beta done.".to_string(),
        ];
        assert_eq!(build_digest(&contents, 1024), "Alpha done. | Beta done.");
    }
}

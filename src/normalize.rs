//! Text normalization shared by semantic search and duplicate detection.
//!
//! `normalize` is the single canonical form used everywhere text is compared
//! or embedded:
//! 1. Strip markup tags (inner text kept) and decode common entities
//! 2. Lowercase
//! 3. Drop punctuation
//! 4. Collapse whitespace and trim

use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};

use crate::library::BookRecord;

/// Maximum searchable text length (characters, not tokens)
const MAX_SEARCHABLE_LENGTH: usize = 2048;

/// Anything that looks like a tag. Deliberately permissive: no nesting,
/// no attribute parsing, an unmatched `<` is left alone.
static TAG_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<[^<>]*>").expect("Failed to compile tag regex"));

static ENTITY_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"&(#[0-9]{1,7}|#[xX][0-9a-fA-F]{1,6}|[a-zA-Z]{2,8});")
        .expect("Failed to compile entity regex")
});

static PUNCTUATION_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^\w\s]").expect("Failed to compile punctuation regex"));

/// Normalize text for comparison and embedding.
pub fn normalize(text: &str) -> String {
    let text = strip_markup(text).to_lowercase();
    let text = PUNCTUATION_REGEX.replace_all(&text, "");
    collapse_whitespace(&text)
}

/// Remove markup tags, keeping the text between them.
///
/// Tags are replaced by a space so adjacent block elements don't glue words
/// together. Entities are decoded where known and dropped otherwise.
pub fn strip_markup(text: &str) -> String {
    let without_tags = TAG_REGEX.replace_all(text, " ");

    ENTITY_REGEX
        .replace_all(&without_tags, |caps: &regex::Captures| decode_entity(&caps[1]))
        .into_owned()
}

fn decode_entity(entity: &str) -> String {
    let decoded = match entity {
        "amp" => Some('&'),
        "lt" => Some('<'),
        "gt" => Some('>'),
        "quot" => Some('"'),
        "apos" => Some('\''),
        "nbsp" => Some(' '),
        _ => entity.strip_prefix('#').and_then(|code| {
            let value = match code.strip_prefix(['x', 'X']) {
                Some(hex) => u32::from_str_radix(hex, 16).ok(),
                None => code.parse::<u32>().ok(),
            };
            value.and_then(char::from_u32)
        }),
    };

    decoded.map(String::from).unwrap_or_else(|| " ".to_string())
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Build the normalized text a book is embedded from.
///
/// Title, authors, series, tags, publisher and the de-markup'd description,
/// truncated to `MAX_SEARCHABLE_LENGTH` characters.
pub fn searchable_text(record: &BookRecord) -> String {
    let mut parts: Vec<&str> = vec![&record.title];
    parts.extend(record.authors.iter().map(String::as_str));

    if let Some(series) = &record.series {
        parts.push(series);
    }
    parts.extend(record.tags.iter().map(String::as_str));
    if let Some(publisher) = &record.publisher {
        parts.push(publisher);
    }
    if let Some(description) = &record.description {
        parts.push(description);
    }

    truncate(normalize(&parts.join(" ")))
}

fn truncate(text: String) -> String {
    if text.chars().count() <= MAX_SEARCHABLE_LENGTH {
        return text;
    }
    text.chars()
        .take(MAX_SEARCHABLE_LENGTH)
        .collect::<String>()
        .trim_end()
        .to_string()
}

/// Stable digest of a searchable text, stored next to each cached vector.
///
/// Uses SHA-256 rather than `DefaultHasher` because it is persisted.
pub fn content_fingerprint(text: &str) -> u64 {
    let digest = Sha256::digest(text.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_basic() {
        assert_eq!(normalize("The Hobbit"), "the hobbit");
        assert_eq!(normalize("The Hobbit!!!"), "the hobbit");
        assert_eq!(normalize("The   Hobbit"), "the hobbit");
        assert_eq!(normalize("  \tThe\nHobbit  "), "the hobbit");
        assert_eq!(normalize(""), "");
    }

    #[test]
    fn test_normalize_drops_punctuation_without_splitting() {
        assert_eq!(normalize("J.R.R. Tolkien"), "jrr tolkien");
        assert_eq!(normalize("The Hobbit: Enhanced Edition"), "the hobbit enhanced edition");
        assert_eq!(normalize("Don't Panic"), "dont panic");
    }

    #[test]
    fn test_normalize_keeps_unicode_letters() {
        assert_eq!(normalize("Über Café"), "über café");
        assert_eq!(normalize("日本語 タイトル"), "日本語 タイトル");
    }

    #[test]
    fn test_strip_markup_keeps_inner_text() {
        assert_eq!(
            normalize("<p>In a <b>hole</b> in the ground</p><p>there lived</p>"),
            "in a hole in the ground there lived"
        );
    }

    #[test]
    fn test_strip_markup_tolerates_malformed_input() {
        // unclosed tag and stray angle brackets must not panic or eat text
        assert_eq!(normalize("a < b and <i>c"), "a b and c");
        assert_eq!(normalize("<div class=\"x\">text"), "text");
        assert_eq!(normalize("broken <tag"), "broken tag");
        assert_eq!(normalize("1 > 0"), "1 0");
    }

    #[test]
    fn test_strip_markup_decodes_entities() {
        assert_eq!(strip_markup("Tom &amp; Jerry"), "Tom & Jerry");
        assert_eq!(strip_markup("caf&#233;"), "café");
        assert_eq!(strip_markup("caf&#xE9;"), "café");
        assert_eq!(normalize("a&nbsp;b"), "a b");
        assert_eq!(normalize("a&bogus;b"), "a b");
    }

    #[test]
    fn test_searchable_text_combines_fields() {
        let record = BookRecord::new(1, "The Hobbit")
            .with_authors(["J.R.R. Tolkien"])
            .with_tags(["Fantasy"])
            .with_description("<p>A <em>hobbit</em> goes on an adventure.</p>");

        assert_eq!(
            searchable_text(&record),
            "the hobbit jrr tolkien fantasy a hobbit goes on an adventure"
        );
    }

    #[test]
    fn test_searchable_text_truncates_on_char_boundary() {
        let record = BookRecord::new(1, "é".repeat(5000));
        let text = searchable_text(&record);

        assert_eq!(text.chars().count(), MAX_SEARCHABLE_LENGTH);
    }

    #[test]
    fn test_content_fingerprint_consistency() {
        assert_eq!(content_fingerprint("abc"), content_fingerprint("abc"));
        assert_ne!(content_fingerprint("abc"), content_fingerprint("abd"));
    }
}

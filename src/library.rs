//! Book records as handed over by the catalog.
//!
//! The catalog tool's machine listing (`calibredb list --for-machine`) is a
//! JSON array of loosely typed objects: authors may come as a list or as a
//! single `" & "`-joined string, tags as a list or a comma separated string,
//! and the ISBN may sit in its own top-level field next to the identifier map.
//! [`BookRecord`] is the cleaned-up snapshot the rest of the crate works with.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Deserializer, Serialize};

/// Identifier assigned to a book by the catalog.
pub type BookId = u64;

/// Scheme for a top-level `isbn` that disagrees with `identifiers["isbn"]`.
pub const LISTING_ISBN_SCHEME: &str = "listing_isbn";

/// Immutable snapshot of one book's metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawBookRecord")]
pub struct BookRecord {
    pub id: BookId,
    pub title: String,
    pub authors: Vec<String>,
    /// Scheme (lowercased) -> value
    pub identifiers: BTreeMap<String, String>,
    pub description: Option<String>,
    pub tags: BTreeSet<String>,
    pub series: Option<String>,
    pub publisher: Option<String>,
}

impl BookRecord {
    pub fn new(id: BookId, title: impl Into<String>) -> Self {
        Self {
            id,
            title: title.into(),
            authors: vec![],
            identifiers: BTreeMap::new(),
            description: None,
            tags: BTreeSet::new(),
            series: None,
            publisher: None,
        }
    }

    pub fn with_authors<I, S>(mut self, authors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.authors = authors.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_identifier(mut self, scheme: &str, value: impl Into<String>) -> Self {
        self.identifiers
            .insert(scheme.trim().to_lowercase(), value.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Authors joined for display.
    pub fn authors_display(&self) -> String {
        if self.authors.is_empty() {
            "Unknown".to_string()
        } else {
            self.authors.join(", ")
        }
    }
}

/// Wire shape of a catalog listing entry.
#[derive(Deserialize)]
struct RawBookRecord {
    id: BookId,
    #[serde(default)]
    title: Option<String>,
    #[serde(default, deserialize_with = "string_or_list_authors")]
    authors: Vec<String>,
    #[serde(default)]
    identifiers: BTreeMap<String, String>,
    #[serde(default)]
    isbn: Option<String>,
    #[serde(default, alias = "comments")]
    description: Option<String>,
    #[serde(default, deserialize_with = "string_or_list_tags")]
    tags: Vec<String>,
    #[serde(default)]
    series: Option<String>,
    #[serde(default)]
    publisher: Option<String>,
}

impl From<RawBookRecord> for BookRecord {
    fn from(raw: RawBookRecord) -> Self {
        let mut identifiers: BTreeMap<String, String> = raw
            .identifiers
            .into_iter()
            .map(|(scheme, value)| (scheme.trim().to_lowercase(), value))
            .collect();

        if let Some(isbn) = raw.isbn.filter(|isbn| !isbn.trim().is_empty()) {
            match identifiers.get("isbn") {
                None => {
                    identifiers.insert("isbn".to_string(), isbn);
                }
                Some(mapped) if !mapped.trim().eq_ignore_ascii_case(isbn.trim()) => {
                    identifiers.insert(LISTING_ISBN_SCHEME.to_string(), isbn);
                }
                Some(_) => {}
            }
        }

        Self {
            id: raw.id,
            title: raw.title.unwrap_or_default(),
            authors: raw.authors,
            identifiers,
            description: raw.description.filter(|d| !d.trim().is_empty()),
            tags: raw.tags.into_iter().collect(),
            series: raw.series.filter(|s| !s.trim().is_empty()),
            publisher: raw.publisher.filter(|p| !p.trim().is_empty()),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StringOrList {
    One(String),
    Many(Vec<String>),
}

fn split_list(value: Option<StringOrList>, separator: &str) -> Vec<String> {
    let items = match value {
        None => vec![],
        Some(StringOrList::Many(items)) => items,
        Some(StringOrList::One(joined)) => joined.split(separator).map(str::to_string).collect(),
    };

    items
        .into_iter()
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
        .collect()
}

fn string_or_list_authors<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(split_list(Option::deserialize(deserializer)?, " & "))
}

fn string_or_list_tags<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(split_list(Option::deserialize(deserializer)?, ","))
}

/// Parse a catalog listing.
pub fn parse_library(json: &str) -> Result<Vec<BookRecord>, serde_json::Error> {
    serde_json::from_str(json)
}

/// Read a catalog listing from `path`, or from stdin when no path is given.
pub fn read_library(path: Option<&Path>) -> anyhow::Result<Vec<BookRecord>> {
    use anyhow::Context;

    let json = match path {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("failed to read library listing {}", path.display()))?,
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("failed to read library listing from stdin")?;
            buf
        }
    };

    let records = parse_library(&json).context("library listing is malformed")?;
    log::debug!("loaded {} library records", records.len());
    Ok(records)
}

//! Multi-signal duplicate detection.
//!
//! Three independent matchers run over the same records:
//! - `exact`: same normalized title and the same set of normalized authors
//! - `fuzzy`: pairs of titles whose bigram similarity reaches a threshold
//! - `identifier`: same identifier value (e.g. ISBN) under any scheme
//!
//! Their groups are reported side by side in a [`DuplicateReport`], never
//! merged. None of this touches the embedding model or cache.

mod exact;
mod fuzzy;
mod identifier;
mod report;

use std::cmp::Ordering;
use std::collections::BTreeSet;

use serde::Serialize;

use crate::library::{BookId, BookRecord};

pub use exact::find_exact_duplicates;
pub use fuzzy::{find_similar_titles, title_similarity};
pub use identifier::find_identifier_duplicates;
pub use report::{format_markdown, DuplicateSummary};

/// Default minimum title similarity for the fuzzy matcher.
pub const DEFAULT_FUZZY_THRESHOLD: f64 = 0.85;

#[derive(Debug, thiserror::Error)]
pub enum DuplicateError {
    #[error("similarity threshold must be between 0.0 and 1.0, got {0}")]
    InvalidThreshold(f64),
}

/// Why a set of books was grouped.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MatchSignal {
    Exact { fields: Vec<String> },
    Fuzzy { field: String, similarity: f64 },
    /// `schemes` lists every scheme the value was recorded under.
    Identifier { schemes: Vec<String>, value: String },
}

impl MatchSignal {
    fn cmp_detail(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Exact { fields: a }, Self::Exact { fields: b }) => a.cmp(b),
            (
                Self::Fuzzy { field: fa, similarity: sa },
                Self::Fuzzy { field: fb, similarity: sb },
            ) => fa.cmp(fb).then(sb.total_cmp(sa)),
            (
                Self::Identifier { schemes: sa, value: va },
                Self::Identifier { schemes: sb, value: vb },
            ) => va.cmp(vb).then_with(|| sa.cmp(sb)),
            _ => self.rank().cmp(&other.rank()),
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Exact { .. } => 0,
            Self::Fuzzy { .. } => 1,
            Self::Identifier { .. } => 2,
        }
    }
}

/// Two or more books (ids ascending) and the signal that grouped them.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DuplicateGroup {
    pub ids: Vec<BookId>,
    #[serde(flatten)]
    pub signal: MatchSignal,
}

impl DuplicateGroup {
    /// Build a group from unordered ids. `None` if fewer than two distinct ids.
    pub(crate) fn new(ids: impl IntoIterator<Item = BookId>, signal: MatchSignal) -> Option<Self> {
        let ids: Vec<BookId> = ids.into_iter().collect::<BTreeSet<_>>().into_iter().collect();
        if ids.len() < 2 {
            return None;
        }
        Some(Self { ids, signal })
    }
}

/// Order groups by their ids, then by signal detail.
pub(crate) fn sort_groups(groups: &mut [DuplicateGroup]) {
    groups.sort_by(|a, b| a.ids.cmp(&b.ids).then_with(|| a.signal.cmp_detail(&b.signal)));
}

/// Results of all three matchers.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DuplicateReport {
    pub exact: Vec<DuplicateGroup>,
    pub fuzzy: Vec<DuplicateGroup>,
    pub identifier: Vec<DuplicateGroup>,
    pub all_duplicate_ids: BTreeSet<BookId>,
}

impl DuplicateReport {
    pub fn groups(&self) -> impl Iterator<Item = &DuplicateGroup> {
        self.exact.iter().chain(&self.fuzzy).chain(&self.identifier)
    }

    pub fn is_empty(&self) -> bool {
        self.groups().next().is_none()
    }
}

fn validate_threshold(threshold: f64) -> Result<(), DuplicateError> {
    if threshold.is_nan() || !(0.0..=1.0).contains(&threshold) {
        return Err(DuplicateError::InvalidThreshold(threshold));
    }
    Ok(())
}

/// Run every matcher over `records`.
pub fn find_all_duplicates(
    records: &[BookRecord],
    threshold: f64,
) -> Result<DuplicateReport, DuplicateError> {
    validate_threshold(threshold)?;

    let exact = find_exact_duplicates(records);
    let fuzzy = find_similar_titles(records, threshold)?;
    let identifier = find_identifier_duplicates(records);

    let all_duplicate_ids = exact
        .iter()
        .chain(&fuzzy)
        .chain(&identifier)
        .flat_map(|group| group.ids.iter().copied())
        .collect();

    log::debug!(
        "found {} exact, {} fuzzy and {} identifier duplicate groups",
        exact.len(),
        fuzzy.len(),
        identifier.len()
    );

    Ok(DuplicateReport {
        exact,
        fuzzy,
        identifier,
        all_duplicate_ids,
    })
}

use std::collections::BTreeMap;

use crate::duplicates::{sort_groups, DuplicateGroup, MatchSignal};
use crate::library::{BookId, BookRecord};
use crate::normalize::normalize;

/// Normalized title plus the sorted normalized authors.
type ExactKey = (String, Vec<String>);

fn exact_key(record: &BookRecord) -> Option<ExactKey> {
    let title = normalize(&record.title);
    if title.is_empty() {
        return None;
    }

    let mut authors: Vec<String> = record
        .authors
        .iter()
        .map(|author| normalize(author))
        .filter(|author| !author.is_empty())
        .collect();
    authors.sort();

    Some((title, authors))
}

/// Group books sharing the same title and the same authors, ignoring case,
/// punctuation, spacing and author order.
pub fn find_exact_duplicates(records: &[BookRecord]) -> Vec<DuplicateGroup> {
    let mut buckets: BTreeMap<ExactKey, Vec<BookId>> = BTreeMap::new();

    for record in records {
        if let Some(key) = exact_key(record) {
            buckets.entry(key).or_default().push(record.id);
        }
    }

    let mut groups: Vec<DuplicateGroup> = buckets
        .into_values()
        .filter_map(|ids| {
            DuplicateGroup::new(
                ids,
                MatchSignal::Exact {
                    fields: vec!["title".to_string(), "authors".to_string()],
                },
            )
        })
        .collect();

    sort_groups(&mut groups);
    groups
}

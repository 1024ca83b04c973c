use std::collections::{BTreeMap, BTreeSet};

use crate::duplicates::{sort_groups, DuplicateGroup, MatchSignal};
use crate::library::{BookId, BookRecord};

#[derive(Default)]
struct Bucket {
    ids: Vec<BookId>,
    schemes: BTreeSet<String>,
}

/// Group books that share an identifier value, whatever scheme it was
/// recorded under.
///
/// Values compare case-insensitively after trimming. They are otherwise
/// taken as-is: an ISBN-10 and its ISBN-13 form are different keys.
pub fn find_identifier_duplicates(records: &[BookRecord]) -> Vec<DuplicateGroup> {
    let mut buckets: BTreeMap<String, Bucket> = BTreeMap::new();

    for record in records {
        for (scheme, value) in &record.identifiers {
            let value = value.trim().to_lowercase();
            if value.is_empty() {
                continue;
            }
            let bucket = buckets.entry(value).or_default();
            bucket.ids.push(record.id);
            bucket.schemes.insert(scheme.trim().to_lowercase());
        }
    }

    let mut groups: Vec<DuplicateGroup> = buckets
        .into_iter()
        .filter_map(|(value, bucket)| {
            DuplicateGroup::new(
                bucket.ids,
                MatchSignal::Identifier {
                    schemes: bucket.schemes.into_iter().collect(),
                    value,
                },
            )
        })
        .collect();

    sort_groups(&mut groups);
    groups
}

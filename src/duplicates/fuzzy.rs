use std::collections::HashMap;

use crate::duplicates::{sort_groups, validate_threshold, DuplicateError, DuplicateGroup, MatchSignal};
use crate::library::{BookId, BookRecord};
use crate::normalize::normalize;

struct Title {
    id: BookId,
    normalized: String,
    /// Characters once whitespace is removed
    compact_len: usize,
}

/// Sørensen–Dice similarity of two normalized titles over character bigrams,
/// whitespace ignored.
///
/// Lengths are counted in characters, so non-ASCII titles score the same as
/// their ASCII transliterations.
pub fn title_similarity(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().filter(|c| !c.is_whitespace()).collect();
    let b: Vec<char> = b.chars().filter(|c| !c.is_whitespace()).collect();

    if a == b {
        return 1.0;
    }
    if a.len() < 2 || b.len() < 2 {
        return 0.0;
    }

    let mut bigrams: HashMap<(char, char), usize> = HashMap::new();
    for pair in a.windows(2) {
        *bigrams.entry((pair[0], pair[1])).or_default() += 1;
    }

    let mut shared = 0;
    for pair in b.windows(2) {
        if let Some(count) = bigrams.get_mut(&(pair[0], pair[1])) {
            if *count > 0 {
                *count -= 1;
                shared += 1;
            }
        }
    }

    (2 * shared) as f64 / (a.len() + b.len() - 2) as f64
}

/// Best similarity two titles of these compact lengths could reach.
///
/// Each side has `len - 1` bigrams and the shared count can't exceed the
/// smaller side, so `2 * min / (na + nb)` bounds the coefficient.
fn similarity_upper_bound(a: &Title, b: &Title) -> f64 {
    let na = a.compact_len.saturating_sub(1);
    let nb = b.compact_len.saturating_sub(1);
    if na + nb == 0 {
        return 1.0;
    }
    (2 * na.min(nb)) as f64 / (na + nb) as f64
}

/// Report every pair of books whose titles are at least `threshold` similar.
///
/// Compares all pairs; pairs whose lengths alone rule them out are skipped.
pub fn find_similar_titles(
    records: &[BookRecord],
    threshold: f64,
) -> Result<Vec<DuplicateGroup>, DuplicateError> {
    validate_threshold(threshold)?;

    let mut titles: Vec<Title> = records
        .iter()
        .filter_map(|record| {
            let normalized = normalize(&record.title);
            if normalized.is_empty() {
                return None;
            }
            let compact_len = normalized.chars().filter(|c| !c.is_whitespace()).count();
            Some(Title {
                id: record.id,
                normalized,
                compact_len,
            })
        })
        .collect();
    titles.sort_by_key(|title| title.id);
    titles.dedup_by_key(|title| title.id);

    let mut groups = Vec::new();
    for (i, a) in titles.iter().enumerate() {
        for b in &titles[i + 1..] {
            if a.normalized != b.normalized && similarity_upper_bound(a, b) < threshold {
                continue;
            }

            let similarity = title_similarity(&a.normalized, &b.normalized);
            if similarity >= threshold {
                groups.extend(DuplicateGroup::new(
                    [a.id, b.id],
                    MatchSignal::Fuzzy {
                        field: "title".to_string(),
                        similarity,
                    },
                ));
            }
        }
    }

    sort_groups(&mut groups);
    Ok(groups)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn similarity_of(group: &DuplicateGroup) -> f64 {
        match group.signal {
            MatchSignal::Fuzzy { similarity, .. } => similarity,
            _ => panic!("not a fuzzy group"),
        }
    }

    #[test]
    fn test_edition_suffix_stays_below_default_threshold() {
        let a = normalize("The Hobbit");
        let b = normalize("The Hobbit: Enhanced Edition");
        assert_eq!(a, "the hobbit");
        assert_eq!(b, "the hobbit enhanced edition");
        assert!((title_similarity(&a, &b) - 16.0 / 31.0).abs() < 1e-9);

        let records = vec![
            BookRecord::new(1, "The Hobbit"),
            BookRecord::new(2, "The Hobbit: Enhanced Edition"),
        ];
        assert!(find_similar_titles(&records, 0.85).unwrap().is_empty());
        assert_eq!(find_similar_titles(&records, 0.5).unwrap().len(), 1);
    }

    #[test]
    fn test_near_identical_titles_are_reported() {
        let records = vec![
            BookRecord::new(8, "The Fellowship of the Rings"),
            BookRecord::new(4, "The Fellowship of the Ring"),
        ];

        let groups = find_similar_titles(&records, 0.85).unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].ids, vec![4, 8]);
        assert!((similarity_of(&groups[0]) - 42.0 / 43.0).abs() < 1e-9);
    }

    #[test]
    fn test_non_ascii_titles_score_by_characters() {
        // "войнаимир" vs "войнаимиры": 8 shared bigrams out of 8 + 9
        let cyrillic = title_similarity(&normalize("Война и мир"), &normalize("Война и миры"));
        let latin = title_similarity(&normalize("Voina i mir"), &normalize("Voina i miry"));
        assert!((cyrillic - 16.0 / 17.0).abs() < 1e-9);
        assert_eq!(cyrillic, latin);

        let records = vec![
            BookRecord::new(1, "Война и мир"),
            BookRecord::new(2, "Война и миры"),
            BookRecord::new(3, "Les Misérables"),
            BookRecord::new(4, "Les Misérables."),
        ];
        let groups = find_similar_titles(&records, 0.85).unwrap();
        let pairs: Vec<Vec<BookId>> = groups.iter().map(|g| g.ids.clone()).collect();
        assert_eq!(pairs, vec![vec![1, 2], vec![3, 4]]);
    }

    #[test]
    fn test_length_bound_never_hides_a_match() {
        let titles = [
            "a", "ab", "abc", "the hobbit", "the hobbits", "hobbit the",
            "the fellowship of the ring", "fellowship", "ring", "dune", "dunes",
            "война и мир", "война и миры", "戦争と平和", "戦争と平和 上",
        ];
        let records: Vec<BookRecord> = titles
            .iter()
            .enumerate()
            .map(|(i, title)| BookRecord::new(i as BookId, *title))
            .collect();

        for threshold in [0.0, 0.3, 0.5, 0.85, 1.0] {
            let groups = find_similar_titles(&records, threshold).unwrap();

            let mut expected = 0;
            for (i, a) in titles.iter().enumerate() {
                for b in &titles[i + 1..] {
                    if title_similarity(a, b) >= threshold {
                        expected += 1;
                    }
                }
            }
            assert_eq!(groups.len(), expected, "threshold {threshold}");
        }
    }

    #[test]
    fn test_identical_titles_are_fully_similar() {
        let records = vec![BookRecord::new(1, "Emma"), BookRecord::new(2, "EMMA.")];

        let groups = find_similar_titles(&records, 1.0).unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(similarity_of(&groups[0]), 1.0);
    }

    #[test]
    fn test_empty_titles_never_match() {
        let records = vec![BookRecord::new(1, ""), BookRecord::new(2, "---")];
        assert!(find_similar_titles(&records, 0.0).unwrap().is_empty());
    }

    #[test]
    fn test_invalid_threshold() {
        assert!(matches!(
            find_similar_titles(&[], 2.0),
            Err(DuplicateError::InvalidThreshold(_))
        ));
    }
}

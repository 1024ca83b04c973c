use std::collections::HashMap;
use std::fmt::Write;

use serde::Serialize;

use crate::duplicates::{DuplicateGroup, DuplicateReport, MatchSignal};
use crate::library::{BookId, BookRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DuplicateSummary {
    pub exact_groups: usize,
    pub fuzzy_groups: usize,
    pub identifier_groups: usize,
    pub total_groups: usize,
    /// Books that could be removed, counting one keeper per group
    pub total_duplicates: usize,
}

impl DuplicateReport {
    pub fn summary(&self) -> DuplicateSummary {
        let exact_groups = self.exact.len();
        let fuzzy_groups = self.fuzzy.len();
        let identifier_groups = self.identifier.len();

        DuplicateSummary {
            exact_groups,
            fuzzy_groups,
            identifier_groups,
            total_groups: exact_groups + fuzzy_groups + identifier_groups,
            total_duplicates: self.groups().map(|group| group.ids.len() - 1).sum(),
        }
    }
}

/// Render the report as markdown, one section per matcher.
pub fn format_markdown(report: &DuplicateReport, records: &[BookRecord]) -> String {
    if report.is_empty() {
        return "No duplicates found.\n".to_string();
    }

    let by_id: HashMap<BookId, &BookRecord> =
        records.iter().map(|record| (record.id, record)).collect();
    let mut out = String::new();

    if !report.exact.is_empty() {
        out.push_str("## Exact Title/Author Matches\n");
        for group in &report.exact {
            let heading = group
                .ids
                .first()
                .and_then(|id| by_id.get(id))
                .map(|record| format!("{} by {}", record.title, record.authors_display()))
                .unwrap_or_else(|| "Unknown".to_string());
            let _ = writeln!(out, "\n### {heading}");
            write_members(&mut out, group, &by_id);
        }
    }

    if !report.fuzzy.is_empty() {
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str("## Similar Titles\n");
        for (i, group) in report.fuzzy.iter().enumerate() {
            match &group.signal {
                MatchSignal::Fuzzy { similarity, .. } => {
                    let _ = writeln!(out, "\n### Group {} (similarity {:.2})", i + 1, similarity);
                }
                _ => {
                    let _ = writeln!(out, "\n### Group {}", i + 1);
                }
            }
            write_members(&mut out, group, &by_id);
        }
    }

    if !report.identifier.is_empty() {
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str("## Identifier Duplicates\n");
        for group in &report.identifier {
            if let MatchSignal::Identifier { schemes, value } = &group.signal {
                let _ = writeln!(out, "\n### {}: {}", schemes.join("/").to_uppercase(), value);
            }
            write_members(&mut out, group, &by_id);
        }
    }

    out
}

fn write_members(out: &mut String, group: &DuplicateGroup, by_id: &HashMap<BookId, &BookRecord>) {
    for id in &group.ids {
        match by_id.get(id) {
            Some(record) => {
                let _ = writeln!(out, "- ID: {} | {} by {}", id, record.title, record.authors_display());
            }
            None => {
                let _ = writeln!(out, "- ID: {id}");
            }
        }
    }
}

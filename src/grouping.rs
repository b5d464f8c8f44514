//! Partitioning of uploaded rows into batches.
//!
//! Rows sharing a normalized (municipality, state, position) triple form one
//! batch. Output order is deterministic: (state, municipality, position) ascending.

use std::collections::BTreeMap;

use crate::payload::RawRow;

/// Approximate characters per token used for estimates.
pub const CHARS_PER_TOKEN: usize = 4;
/// Fixed prompt text sent with every ANALYZE request, in characters.
pub const ANALYZE_PROMPT_OVERHEAD_CHARS: usize = 6_000;
/// Fixed prompt and schema text sent with every STRUCTURE request, in characters.
pub const STRUCTURE_PROMPT_OVERHEAD_CHARS: usize = 12_000;
/// Bucket for rows without a position.
pub const UNKNOWN_POSITION: &str = "unknown-position";

/// One batch worth of rows, not yet persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupedBatch {
    pub group_key: String,
    pub municipality: String,
    pub state: String,
    pub position: String,
    pub rows: Vec<RawRow>,
    pub estimated_analyze_tokens: i32,
    pub estimated_structure_tokens: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct SortKey {
    state: String,
    municipality: String,
    position: String,
}

/// Groups rows into batches. Pure and deterministic.
pub fn group_rows(rows: &[RawRow]) -> Vec<GroupedBatch> {
    let mut groups: BTreeMap<SortKey, Vec<RawRow>> = BTreeMap::new();
    for row in rows {
        let key = SortKey {
            state: normalize_key(row.state.as_deref()),
            municipality: normalize_key(row.municipality.as_deref()),
            position: match normalize_key(row.position.as_deref()) {
                position if position.is_empty() => UNKNOWN_POSITION.to_string(),
                position => position,
            },
        };
        groups.entry(key).or_default().push(row.clone());
    }

    groups
        .into_iter()
        .map(|(key, rows)| {
            let first = &rows[0];
            let position = if key.position == UNKNOWN_POSITION {
                UNKNOWN_POSITION.to_string()
            } else {
                display_value(first.position.as_deref())
            };
            let (analyze, structure) = estimate_tokens(&rows);
            GroupedBatch {
                group_key: format!("{}|{}|{}", key.municipality, key.state, key.position),
                municipality: display_value(first.municipality.as_deref()),
                state: display_value(first.state.as_deref()),
                position,
                rows,
                estimated_analyze_tokens: analyze,
                estimated_structure_tokens: structure,
            }
        })
        .collect()
}

/// Lowercases and collapses internal whitespace.
pub fn normalize_key(value: Option<&str>) -> String {
    display_value(value).to_lowercase()
}

fn display_value(value: Option<&str>) -> String {
    value
        .unwrap_or_default()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Advisory (analyze, structure) token estimates for a set of rows.
///
/// The structure estimate also budgets for the analysis handed off from the
/// previous stage, assumed to be about as large as the rows themselves.
pub fn estimate_tokens(rows: &[RawRow]) -> (i32, i32) {
    let serialized = serde_json::to_string(rows)
        .map(|json| json.len())
        .unwrap_or_default();
    let analyze = (serialized + ANALYZE_PROMPT_OVERHEAD_CHARS).div_ceil(CHARS_PER_TOKEN);
    let structure =
        (serialized * 2 + STRUCTURE_PROMPT_OVERHEAD_CHARS).div_ceil(CHARS_PER_TOKEN);
    (saturate(analyze), saturate(structure))
}

fn saturate(value: usize) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn groups_by_normalized_triple() {
        let rows = vec![
            RawRow::new("Springfield", "IL", "Mayor"),
            RawRow::new("  springfield ", "il", "MAYOR"),
            RawRow::new("Austin", "TX", "Clerk"),
        ];

        let batches = group_rows(&rows);

        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].group_key, "springfield|il|mayor");
        assert_eq!(batches[0].rows.len(), 2);
        assert_eq!(batches[0].municipality, "Springfield");
        assert_eq!(batches[1].group_key, "austin|tx|clerk");
        assert_eq!(batches[1].rows.len(), 1);
    }

    #[test]
    fn orders_by_state_then_municipality_then_position() {
        let rows = vec![
            RawRow::new("Zeta", "AK", "Mayor"),
            RawRow::new("Alpha", "WY", "Clerk"),
            RawRow::new("Alpha", "AK", "Treasurer"),
            RawRow::new("Alpha", "AK", "Clerk"),
        ];

        let keys: Vec<_> = group_rows(&rows)
            .into_iter()
            .map(|batch| batch.group_key)
            .collect();

        assert_eq!(
            keys,
            vec![
                "alpha|ak|clerk",
                "alpha|ak|treasurer",
                "zeta|ak|mayor",
                "alpha|wy|clerk",
            ]
        );
    }

    #[test]
    fn missing_position_goes_to_unknown_bucket() {
        let mut row = RawRow::new("Springfield", "IL", "");
        row.position = None;
        let batches = group_rows(&[row, RawRow::new("Springfield", "IL", "   ")]);

        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].position, UNKNOWN_POSITION);
        assert_eq!(batches[0].rows.len(), 2);
    }

    #[test]
    fn estimates_grow_with_rows_and_structure_exceeds_analyze() {
        let one = vec![RawRow::new("Springfield", "IL", "Mayor")];
        let many: Vec<_> = (0..50)
            .map(|i| RawRow::new("Springfield", "IL", "Mayor").with_name(&format!("c{i}")))
            .collect();

        let (analyze_one, structure_one) = estimate_tokens(&one);
        let (analyze_many, _) = estimate_tokens(&many);

        assert!(analyze_one >= (ANALYZE_PROMPT_OVERHEAD_CHARS / CHARS_PER_TOKEN) as i32);
        assert!(structure_one > analyze_one);
        assert!(analyze_many > analyze_one);
    }

    #[test]
    fn empty_input_yields_no_batches() {
        assert!(group_rows(&[]).is_empty());
    }
}

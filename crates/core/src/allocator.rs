//! Dataset index allocation.
//!
//! Pure functions: callers serialise allocation and creation themselves.

use crate::dataset::Dataset;
use crate::error::IndexError;
use crate::index::DatasetIndex;

/// Deepest index the allocator will produce.
pub const MAX_INDEX_DEPTH: usize = 8;

/// Compute an index strictly between two adjacent catalog entries.
///
/// An unsplit `before` (`1`, `0_2`) descends one level and takes child `1`.
/// A split `before` (`1_1`, `0_2_1`) advances its last segment. If that
/// candidate does not stay below `after`, the allocator keeps descending from
/// `before` (`before_0_..._1`) until a candidate fits or the depth bound is
/// reached. The leading segment is never changed, so import indexes stay in the
/// reserved `0` range.
pub fn compute_insert_idx(before: &DatasetIndex, after: &DatasetIndex) -> Result<DatasetIndex, IndexError> {
    if before >= after {
        return Err(IndexError::Order {
            before: before.to_string(),
            after: after.to_string(),
        });
    }

    let primary = if before.is_split() {
        before.next_sibling()
    } else {
        Some(before.child(1))
    };

    let result = match primary {
        Some(candidate) if candidate < *after => candidate,
        _ => descend_between(before, after)?,
    };

    assert!(
        *before < result && result < *after,
        "allocated index {result} escapes ({before}, {after})"
    );
    Ok(result)
}

/// Textual form of [`compute_insert_idx`].
pub fn compute_insert_idx_str(before: &str, after: &str) -> Result<String, IndexError> {
    let before = DatasetIndex::parse(before)?;
    let after = DatasetIndex::parse(after)?;
    compute_insert_idx(&before, &after).map(|index| index.to_string())
}

fn descend_between(before: &DatasetIndex, after: &DatasetIndex) -> Result<DatasetIndex, IndexError> {
    let mut prefix = before.clone();
    while prefix.depth() < MAX_INDEX_DEPTH {
        let candidate = prefix.child(1);
        if candidate < *after {
            return Ok(candidate);
        }
        prefix = prefix.child(0);
    }
    Err(IndexError::NoRoom {
        before: before.to_string(),
        after: after.to_string(),
    })
}

/// Compute the import index for splicing a foreign node's datasets ahead of
/// `anchor`.
///
/// The anchor must be an unsplit regular dataset and every existing dataset
/// must be unsplit. The result is `0_<n>` where `n` is one past both the number
/// of existing import datasets and the highest import slot in use.
pub fn compute_idx_for_cluster_migration(
    table_prefix: &str,
    existing: &[Dataset],
    anchor: &Dataset,
) -> Result<DatasetIndex, IndexError> {
    let indexes: Vec<&DatasetIndex> = existing.iter().map(|dataset| &dataset.index).collect();
    next_import_slot(table_prefix, &indexes, &anchor.index)
}

/// Textual form of [`compute_idx_for_cluster_migration`].
///
/// An empty `existing` list fails with [`IndexError::EmptyCatalog`] before the
/// anchor is looked at.
pub fn compute_idx_for_cluster_migration_str(
    table_prefix: &str,
    existing: &[&str],
    anchor: &str,
) -> Result<String, IndexError> {
    if existing.is_empty() {
        return Err(IndexError::EmptyCatalog);
    }
    let anchor = DatasetIndex::parse(anchor)?;
    let parsed = existing
        .iter()
        .map(|raw| DatasetIndex::parse(raw))
        .collect::<Result<Vec<_>, _>>()?;
    let indexes: Vec<&DatasetIndex> = parsed.iter().collect();
    next_import_slot(table_prefix, &indexes, &anchor).map(|index| index.to_string())
}

fn next_import_slot(
    table_prefix: &str,
    existing: &[&DatasetIndex],
    anchor: &DatasetIndex,
) -> Result<DatasetIndex, IndexError> {
    if existing.is_empty() {
        return Err(IndexError::EmptyCatalog);
    }
    if anchor.depth() != 1 || anchor.is_import() {
        return Err(IndexError::SplitAnchor {
            table: crate::dataset::job_table_name(table_prefix, anchor),
        });
    }

    let mut import_count: u64 = 0;
    let mut highest_slot: u64 = 0;
    for index in existing {
        if index.is_split() {
            return Err(IndexError::SplitCatalog {
                table: crate::dataset::job_table_name(table_prefix, index),
            });
        }
        if index.is_import() {
            import_count += 1;
            highest_slot = highest_slot.max(index.last());
        }
    }

    let slot = import_count.max(highest_slot).checked_add(1).ok_or_else(|| IndexError::NoRoom {
        before: DatasetIndex::import_slot(highest_slot).to_string(),
        after: anchor.to_string(),
    })?;
    Ok(DatasetIndex::import_slot(slot))
}

/// Index for a new tail dataset: one past the first segment of the last
/// regular dataset, or `1` for a catalog with no regular datasets.
pub fn compute_append_idx(existing: &[Dataset]) -> Result<DatasetIndex, IndexError> {
    let last_regular = existing
        .iter()
        .filter(|dataset| !dataset.index.is_import())
        .map(|dataset| dataset.index.first())
        .max()
        .unwrap_or(0);
    let next = last_regular.checked_add(1).ok_or_else(|| IndexError::NoRoom {
        before: last_regular.to_string(),
        after: "end of queue".to_string(),
    })?;
    DatasetIndex::regular(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::TablePrefix;
    use proptest::prelude::*;

    fn idx(s: &str) -> DatasetIndex {
        DatasetIndex::parse(s).unwrap()
    }

    fn datasets(indexes: &[&str]) -> Vec<Dataset> {
        let prefix = TablePrefix::parse("tt").unwrap();
        indexes.iter().map(|s| Dataset::new(&prefix, idx(s))).collect()
    }

    const INSERT_VECTORS: &[(&str, &str, &str)] = &[
        ("1", "2", "1_1"),
        ("2", "3", "2_1"),
        ("1_1", "2", "1_2"),
        ("1", "2_1", "1_1"),
        ("2_1", "3", "2_2"),
        ("1_1", "2_1", "1_2"),
        ("0_1", "1", "0_1_1"),
        ("0_1", "0_2", "0_1_1"),
        ("0_2", "1", "0_2_1"),
        ("0_1_1", "0_2", "0_1_2"),
        ("0_2_1", "1", "0_2_2"),
        ("0_1_1", "0_2_1", "0_1_2"),
        ("0_1", "0_2_1", "0_1_1"),
        ("9", "10", "9_1"),
    ];

    #[test]
    fn insert_reproduces_reference_vectors() {
        for (before, after, expected) in INSERT_VECTORS {
            let got = compute_insert_idx_str(before, after).unwrap();
            assert_eq!(&got, expected, "between {before} and {after}");
        }
    }

    #[test]
    fn insert_rejects_non_numeric_segments() {
        for (before, after) in [("1_!", "2"), ("1", "2_x"), ("a", "b"), ("1__1", "2")] {
            assert!(matches!(
                compute_insert_idx_str(before, after),
                Err(IndexError::Format { .. })
            ));
        }
    }

    #[test]
    fn insert_rejects_unordered_pairs() {
        assert!(matches!(compute_insert_idx_str("2", "1"), Err(IndexError::Order { .. })));
        assert!(matches!(compute_insert_idx_str("1_1", "1_1"), Err(IndexError::Order { .. })));
    }

    #[test]
    fn insert_descends_when_sibling_collides() {
        assert_eq!(compute_insert_idx_str("1", "1_1").unwrap(), "1_0_1");
        assert_eq!(compute_insert_idx_str("1_1", "1_2").unwrap(), "1_1_1");
        assert_eq!(compute_insert_idx_str("1_1", "1_1_1").unwrap(), "1_1_0_1");
    }

    #[test]
    fn insert_reports_dense_pairs() {
        assert!(matches!(compute_insert_idx_str("1", "1_0"), Err(IndexError::NoRoom { .. })));
        assert!(matches!(compute_insert_idx_str("1", "1_0_0"), Err(IndexError::NoRoom { .. })));
    }

    #[test]
    fn migration_reproduces_reference_vectors() {
        assert_eq!(compute_idx_for_cluster_migration_str("tt", &["1"], "1").unwrap(), "0_1");
        assert_eq!(
            compute_idx_for_cluster_migration_str("tt", &["0_1", "1", "2"], "1").unwrap(),
            "0_2"
        );
    }

    #[test]
    fn migration_result_ignores_which_regular_anchor() {
        let existing = ["0_1", "1", "2"];
        assert_eq!(
            compute_idx_for_cluster_migration_str("tt", &existing, "1").unwrap(),
            compute_idx_for_cluster_migration_str("tt", &existing, "2").unwrap()
        );
    }

    #[test]
    fn migration_rejects_split_datasets() {
        assert!(matches!(
            compute_idx_for_cluster_migration_str("tt", &["1"], "1_1"),
            Err(IndexError::SplitAnchor { table }) if table == "tt_jobs_1_1"
        ));
        assert!(matches!(
            compute_idx_for_cluster_migration_str("tt", &["1_1", "2"], "2"),
            Err(IndexError::SplitCatalog { table }) if table == "tt_jobs_1_1"
        ));
        assert!(matches!(
            compute_idx_for_cluster_migration_str("tt", &["0_1_1", "2"], "2"),
            Err(IndexError::SplitCatalog { .. })
        ));
        assert!(matches!(
            compute_idx_for_cluster_migration_str("tt", &["0_1", "1"], "0_1"),
            Err(IndexError::SplitAnchor { .. })
        ));
    }

    #[test]
    fn migration_rejects_empty_catalog_before_anchor() {
        for anchor in ["1", "1_1_1_1", "1_1_!_1"] {
            assert_eq!(
                compute_idx_for_cluster_migration_str("tt", &[], anchor),
                Err(IndexError::EmptyCatalog)
            );
        }
        let anchor = datasets(&["1"]).remove(0);
        assert_eq!(
            compute_idx_for_cluster_migration("tt", &[], &anchor),
            Err(IndexError::EmptyCatalog)
        );
    }

    #[test]
    fn migration_rejects_malformed_anchor() {
        assert!(matches!(
            compute_idx_for_cluster_migration_str("tt", &["1"], "1_1_!_1"),
            Err(IndexError::Format { .. })
        ));
    }

    #[test]
    fn migration_skips_past_sparse_slots() {
        assert_eq!(
            compute_idx_for_cluster_migration_str("tt", &["0_3", "1"], "1").unwrap(),
            "0_4"
        );
    }

    #[test]
    fn migration_typed_form_matches_text_form() {
        let existing = datasets(&["0_1", "1", "2"]);
        let anchor = existing[1].clone();
        assert_eq!(
            compute_idx_for_cluster_migration("tt", &existing, &anchor).unwrap(),
            idx("0_2")
        );
    }

    #[test]
    fn append_follows_last_regular_dataset() {
        assert_eq!(compute_append_idx(&[]).unwrap(), idx("1"));
        assert_eq!(compute_append_idx(&datasets(&["0_1", "0_2"])).unwrap(), idx("1"));
        assert_eq!(compute_append_idx(&datasets(&["1", "1_1", "2"])).unwrap(), idx("3"));
        assert_eq!(compute_append_idx(&datasets(&["0_1", "1", "2_3"])).unwrap(), idx("3"));
    }

    fn arb_index() -> impl Strategy<Value = DatasetIndex> {
        prop::collection::vec(0u64..12, 1..=4).prop_map(|mut segments| {
            if segments == [0] {
                segments.push(1);
            }
            DatasetIndex::from_segments(segments).unwrap()
        })
    }

    fn zero_suffix_descendant(before: &DatasetIndex, after: &DatasetIndex) -> bool {
        before.is_ancestor_of(after) && after.segments()[before.depth()..].iter().all(|s| *s == 0)
    }

    proptest! {
        #[test]
        fn insert_result_is_strictly_between(a in arb_index(), b in arb_index()) {
            prop_assume!(a != b);
            let (before, after) = if a < b { (a, b) } else { (b, a) };
            match compute_insert_idx(&before, &after) {
                Ok(result) => {
                    prop_assert!(before < result && result < after);
                    prop_assert_eq!(result.first(), before.first());
                    prop_assert_eq!(DatasetIndex::parse(&result.to_string()).unwrap(), result);
                }
                Err(IndexError::NoRoom { .. }) => {
                    prop_assert!(zero_suffix_descendant(&before, &after));
                }
                Err(other) => return Err(TestCaseError::fail(format!("unexpected error {other}"))),
            }
        }

        #[test]
        fn insert_is_deterministic(a in arb_index(), b in arb_index()) {
            prop_assume!(a < b);
            prop_assert_eq!(compute_insert_idx(&a, &b), compute_insert_idx(&a, &b));
        }

        #[test]
        fn repeated_splits_keep_catalog_ordered(splits in prop::collection::vec(0usize..16, 1..24)) {
            let mut catalog = vec![idx("0_1"), idx("1"), idx("2"), idx("3")];
            for pick in splits {
                let position = pick % (catalog.len() - 1);
                let next = compute_insert_idx(&catalog[position], &catalog[position + 1]);
                if let Ok(next) = next {
                    catalog.insert(position + 1, next);
                }
            }
            let mut sorted = catalog.clone();
            sorted.sort();
            sorted.dedup();
            prop_assert_eq!(sorted, catalog);
        }

        #[test]
        fn non_numeric_segment_is_rejected(index in arb_index(), bad in "[a-z!?.]") {
            let text = format!("{index}_{bad}");
            let is_format_error = matches!(compute_insert_idx_str(&text, "99"), Err(IndexError::Format { .. }));
            prop_assert!(is_format_error);
        }
    }
}

//! Compiler intermediate entries and the persisted compiled-trace model.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;

/// Page size assumed by every persisted compiled trace. The spec allows an
/// implementation to query this at runtime, but the on-disk format bakes in
/// 4096; we don't query it, matching the documented policy.
pub const PAGE_SIZE_BYTES: u64 = 4096;

/// One merged event, before it has been assigned a playback-order position.
///
/// Two orderings exist over this type: `Ord` (used for playback, §4.3 step
/// 5) compares `(timestamp_relative, file_path, add_to_page_cache,
/// page_index)`; `IgnoreTimestampKey` (§4.3 step 4) compares the same tuple
/// without the timestamp, used to deduplicate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompilerEntry {
    pub file_path: String,
    pub timestamp_relative: u64,
    pub add_to_page_cache: bool,
    pub page_index: u64,
}

impl PartialOrd for CompilerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CompilerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        (
            self.timestamp_relative,
            &self.file_path,
            self.add_to_page_cache,
            self.page_index,
        )
            .cmp(&(
                other.timestamp_relative,
                &other.file_path,
                other.add_to_page_cache,
                other.page_index,
            ))
    }
}

/// Key used for step-4 merge-deduplication: identical except it drops the
/// timestamp, so two entries that differ only in when they were observed
/// collapse into one.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct IgnoreTimestampKey {
    pub file_path: String,
    pub add_to_page_cache: bool,
    pub page_index: u64,
}

impl CompilerEntry {
    pub fn dedup_key(&self) -> IgnoreTimestampKey {
        IgnoreTimestampKey {
            file_path: self.file_path.clone(),
            add_to_page_cache: self.add_to_page_cache,
            page_index: self.page_index,
        }
    }
}

/// Merge a batch of entries (possibly from multiple raw traces, §4.3
/// step 4): group by `IgnoreTimestampKey`, keep the minimum
/// `timestamp_relative` per group.
pub fn merge_dedup(entries: impl IntoIterator<Item = CompilerEntry>) -> Vec<CompilerEntry> {
    use std::collections::BTreeMap;

    let mut best: BTreeMap<IgnoreTimestampKey, u64> = BTreeMap::new();
    for entry in entries {
        let key = entry.dedup_key();
        best.entry(key)
            .and_modify(|ts| *ts = (*ts).min(entry.timestamp_relative))
            .or_insert(entry.timestamp_relative);
    }
    best.into_iter()
        .map(|(key, timestamp_relative)| CompilerEntry {
            file_path: key.file_path,
            add_to_page_cache: key.add_to_page_cache,
            page_index: key.page_index,
            timestamp_relative,
        })
        .collect()
}

/// Sort the merged set into playback order (§4.3 step 5).
pub fn sort_for_playback(entries: Vec<CompilerEntry>) -> Vec<CompilerEntry> {
    let mut set: BTreeSet<CompilerEntry> = BTreeSet::new();
    set.extend(entries);
    set.into_iter().collect()
}

/// One file known to a compiled trace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceIndexEntry {
    pub id: i64,
    pub file_name: String,
}

/// One playback entry: prefetch `file_length_bytes` bytes starting at
/// `file_offset_bytes` from the file named by `index_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceListEntry {
    pub index_id: i64,
    pub file_offset_bytes: u64,
    pub file_length_bytes: u64,
}

/// The persisted, playback-ordered prefetch plan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompiledTrace {
    pub index: Vec<TraceIndexEntry>,
    pub list: Vec<TraceListEntry>,
}

impl CompiledTrace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from merged, playback-sorted entries (§4.3 step 6): only
    /// `add_to_page_cache = true` entries are emitted, each file gets a
    /// monotonically increasing id on first sight.
    pub fn from_sorted_entries(entries: &[CompilerEntry]) -> Self {
        let mut trace = CompiledTrace::new();
        let mut ids: std::collections::HashMap<&str, i64> = std::collections::HashMap::new();
        let mut next_id: i64 = 0;

        for entry in entries {
            if !entry.add_to_page_cache {
                continue;
            }
            let id = *ids.entry(entry.file_path.as_str()).or_insert_with(|| {
                let id = next_id;
                next_id += 1;
                trace.index.push(TraceIndexEntry {
                    id,
                    file_name: entry.file_path.clone(),
                });
                id
            });
            trace.list.push(TraceListEntry {
                index_id: id,
                file_offset_bytes: entry.page_index * PAGE_SIZE_BYTES,
                file_length_bytes: PAGE_SIZE_BYTES,
            });
        }
        trace
    }

    /// Invariant check: every `index_id` referenced by `list` exists in
    /// `index`, and every `id` and `file_name` in `index` is unique.
    pub fn is_well_formed(&self) -> bool {
        let mut seen_ids = std::collections::HashSet::new();
        let mut seen_names = std::collections::HashSet::new();
        for entry in &self.index {
            if !seen_ids.insert(entry.id) || !seen_names.insert(entry.file_name.as_str()) {
                return false;
            }
        }
        self.list
            .iter()
            .all(|entry| seen_ids.contains(&entry.index_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(path: &str, ts: u64, add: bool, idx: u64) -> CompilerEntry {
        CompilerEntry {
            file_path: path.to_string(),
            timestamp_relative: ts,
            add_to_page_cache: add,
            page_index: idx,
        }
    }

    #[test]
    fn dedup_keeps_minimum_timestamp() {
        let entries = vec![
            entry("/a", 500, true, 1),
            entry("/a", 100, true, 1),
            entry("/a", 300, true, 1),
        ];
        let merged = merge_dedup(entries);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].timestamp_relative, 100);
    }

    #[test]
    fn delete_without_prior_add_is_dropped_on_emit() {
        let entries = vec![entry("/a", 10, false, 1)];
        let merged = merge_dedup(entries);
        let sorted = sort_for_playback(merged);
        let compiled = CompiledTrace::from_sorted_entries(&sorted);
        assert!(compiled.list.is_empty());
        assert!(compiled.index.is_empty());
    }

    #[test]
    fn playback_order_matches_timestamp_then_path() {
        let entries = vec![entry("/b", 5, true, 0), entry("/a", 5, true, 0)];
        let merged = merge_dedup(entries);
        let sorted = sort_for_playback(merged);
        assert_eq!(sorted[0].file_path, "/a");
        assert_eq!(sorted[1].file_path, "/b");
    }

    #[test]
    fn compiled_trace_is_well_formed() {
        let entries = vec![entry("/a", 1, true, 0), entry("/a", 2, true, 1)];
        let merged = merge_dedup(entries);
        let sorted = sort_for_playback(merged);
        let compiled = CompiledTrace::from_sorted_entries(&sorted);
        assert!(compiled.is_well_formed());
        assert_eq!(compiled.index.len(), 1);
        assert_eq!(compiled.list.len(), 2);
        assert!(
            compiled
                .list
                .iter()
                .all(|e| e.file_length_bytes == PAGE_SIZE_BYTES)
        );
    }

    #[test]
    fn empty_input_yields_empty_trace() {
        let compiled = CompiledTrace::from_sorted_entries(&[]);
        assert!(compiled.index.is_empty());
        assert!(compiled.list.is_empty());
        assert!(compiled.is_well_formed());
    }
}

/// §8's round-trip laws for `merge(inputs); sort_unique(...)`, checked over
/// randomly generated entry batches rather than hand-picked cases. Paths and
/// page indices are drawn from small fixed pools so dedup collisions are
/// actually exercised instead of vanishing into an all-distinct input.
#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    fn arb_entry() -> impl Strategy<Value = CompilerEntry> {
        (
            prop::sample::select(vec!["/a", "/b", "/c"]),
            0u64..1000,
            any::<bool>(),
            0u64..8,
        )
            .prop_map(|(file_path, timestamp_relative, add_to_page_cache, page_index)| CompilerEntry {
                file_path: file_path.to_string(),
                timestamp_relative,
                add_to_page_cache,
                page_index,
            })
    }

    proptest! {
        /// One merged entry per distinct `(file_path, add_to_page_cache,
        /// page_index)` key, regardless of how many times it was observed.
        #[test]
        fn merge_dedup_yields_exactly_one_entry_per_distinct_key(
            entries in prop::collection::vec(arb_entry(), 0..40)
        ) {
            let distinct_keys: std::collections::BTreeSet<_> =
                entries.iter().map(CompilerEntry::dedup_key).collect();
            let merged = merge_dedup(entries);
            prop_assert_eq!(merged.len(), distinct_keys.len());
        }

        /// The survivor for each key carries the minimum timestamp observed
        /// for that key across the whole input batch.
        #[test]
        fn merge_dedup_keeps_the_minimum_timestamp_per_key(
            entries in prop::collection::vec(arb_entry(), 0..40)
        ) {
            let mut expected: std::collections::BTreeMap<IgnoreTimestampKey, u64> =
                std::collections::BTreeMap::new();
            for e in &entries {
                expected
                    .entry(e.dedup_key())
                    .and_modify(|ts| *ts = (*ts).min(e.timestamp_relative))
                    .or_insert(e.timestamp_relative);
            }
            let merged = merge_dedup(entries);
            for entry in &merged {
                prop_assert_eq!(expected.get(&entry.dedup_key()), Some(&entry.timestamp_relative));
            }
        }

        /// Playback order is always non-decreasing by the full `Ord` key
        /// (timestamp, then path, then add/delete, then page index).
        #[test]
        fn sort_for_playback_is_nondecreasing(
            entries in prop::collection::vec(arb_entry(), 0..40)
        ) {
            let sorted = sort_for_playback(merge_dedup(entries));
            prop_assert!(sorted.windows(2).all(|pair| pair[0] <= pair[1]));
        }

        /// `CompiledTrace::from_sorted_entries` never produces a trace that
        /// violates its own `is_well_formed` invariant, no matter the input.
        #[test]
        fn compiled_trace_is_always_well_formed(
            entries in prop::collection::vec(arb_entry(), 0..40)
        ) {
            let sorted = sort_for_playback(merge_dedup(entries));
            let compiled = CompiledTrace::from_sorted_entries(&sorted);
            prop_assert!(compiled.is_well_formed());
        }
    }
}

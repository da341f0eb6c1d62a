/*
 * Copyright (C) 2025  The Software Heritage developers
 * See the AUTHORS file at the top-level directory of this distribution
 * License: GNU General Public License version 3, or any later version
 * See top-level LICENSE file for more information
 */

//! Grouping of tagged tuples by partition key

use std::collections::btree_map;
use std::collections::BTreeMap;

use anyhow::Result;

use crate::key::Emission;
use crate::sort::external::ExternalSorter;
use crate::sort::{sort_bucket, sort_bucket_external, KMerge, SortOrder};
use crate::value::Value;

/// A value waiting to be reduced, with the sort key it was emitted with
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub sort: Option<Value>,
    pub value: Value,
}

impl From<Emission> for (Value, Entry) {
    fn from(emission: Emission) -> Self {
        match emission {
            Emission::WithSort {
                partition,
                sort,
                value,
            } => (
                partition,
                Entry {
                    sort: Some(sort),
                    value,
                },
            ),
            Emission::WithoutSort { partition, value } => {
                (partition, Entry { sort: None, value })
            }
        }
    }
}

/// Entries grouped by partition key.
///
/// Within a key, entries keep their arrival order until sorted.
/// Keys are held in their total order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Partitions(BTreeMap<Value, Vec<Entry>>);

impl Partitions {
    pub fn new() -> Self {
        Partitions::default()
    }

    pub fn push(&mut self, emission: Emission) {
        let (key, entry) = emission.into();
        self.0.entry(key).or_default().push(entry);
    }

    pub fn get(&self, key: &Value) -> Option<&[Entry]> {
        self.0.get(key).map(Vec::as_slice)
    }

    /// Number of distinct partition keys
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Total number of entries, across partitions
    pub fn num_entries(&self) -> usize {
        self.0.values().map(Vec::len).sum()
    }

    pub fn keys(&self) -> impl Iterator<Item = &Value> {
        self.0.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Value, &[Entry])> {
        self.0.iter().map(|(key, entries)| (key, entries.as_slice()))
    }

    /// Sorts the entries of every partition independently.
    ///
    /// Partitions with more entries than the chunksize of `external` are
    /// sorted on disk.
    pub fn sort_buckets(
        &mut self,
        order: SortOrder,
        external: Option<&ExternalSorter>,
    ) -> Result<()> {
        for entries in self.0.values_mut() {
            match external {
                Some(sorter) if entries.len() > sorter.chunksize() => {
                    log::debug!("Sorting {} entries on disk", entries.len());
                    let bucket = std::mem::take(entries);
                    *entries = sort_bucket_external(bucket, order, sorter)?;
                }
                _ => sort_bucket(entries, order)?,
            }
        }
        Ok(())
    }
}

impl IntoIterator for Partitions {
    type Item = (Value, Vec<Entry>);
    type IntoIter = btree_map::IntoIter<Value, Vec<Entry>>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl FromIterator<Emission> for Partitions {
    fn from_iter<T: IntoIterator<Item = Emission>>(iter: T) -> Self {
        let mut partitions = Partitions::new();
        for emission in iter {
            partitions.push(emission);
        }
        partitions
    }
}

/// Groups emissions by partition key, in a single pass
pub fn partition(emissions: impl IntoIterator<Item = Emission>) -> Partitions {
    emissions.into_iter().collect()
}

/// Combines partitions built independently (eg. one per worker).
///
/// Without an `order`, entries of each key are concatenated in the order of
/// `all_partitions`. With one, every input must already be sorted by it:
/// entries are k-way merged, with ties resolved in the order of
/// `all_partitions`.
pub fn merge_partitions(
    all_partitions: Vec<Partitions>,
    order: Option<SortOrder>,
) -> Result<Partitions> {
    let mut all_partitions = all_partitions.into_iter();
    let Some(mut merged) = all_partitions.next() else {
        return Ok(Partitions::new());
    };
    let rest: Vec<Partitions> = all_partitions.collect();
    if rest.is_empty() {
        return Ok(merged);
    }

    let mut runs_by_key: BTreeMap<Value, Vec<Vec<Entry>>> = BTreeMap::new();
    for (key, entries) in std::mem::take(&mut merged.0) {
        runs_by_key.insert(key, vec![entries]);
    }
    for partitions in rest {
        for (key, entries) in partitions {
            runs_by_key.entry(key).or_default().push(entries);
        }
    }

    for (key, runs) in runs_by_key {
        let entries = match order {
            Some(order) if runs.len() > 1 && runs.iter().any(|run| order.applies_to(run)) => {
                KMerge::new(
                    runs.into_iter().map(|run| run.into_iter().map(Ok)),
                    |entry: &Entry| order.merge_key(entry),
                    order.reverse,
                )?
                .collect::<Result<Vec<_>>>()?
            }
            _ => runs.into_iter().flatten().collect(),
        };
        merged.0.insert(key, entries);
    }
    Ok(merged)
}

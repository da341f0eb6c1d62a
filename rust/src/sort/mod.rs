/*
 * Copyright (C) 2025  The Software Heritage developers
 * See the AUTHORS file at the top-level directory of this distribution
 * License: GNU General Public License version 3, or any later version
 * See top-level LICENSE file for more information
 */

//! Checked in-memory sorting, and k-way merging of sorted iterators
//!
//! Sorting uses the total order of [`Value`], then walks the result once with
//! [`Value::try_cmp`] so heterogeneous keys surface as
//! [`UnorderableKeyError`] instead of being silently ordered by kind.

use std::cmp::Ordering;

use anyhow::{bail, Result};
use dary_heap::{PeekMut, QuaternaryHeap};

use crate::errors::UnorderableKeyError;
use crate::partition::Entry;
use crate::value::Value;

pub mod external;
use external::ExternalSorter;

/// How values inside a partition are ordered
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SortOrder {
    /// Break ties with the value; sort on the value alone when entries have no
    /// sort key
    pub with_value: bool,
    /// Descending order
    pub reverse: bool,
}

impl SortOrder {
    pub fn ascending() -> Self {
        SortOrder::default()
    }

    /// Whether entries of a bucket need sorting at all. Entries without sort
    /// key are only sorted on their value when asked to.
    pub fn applies_to(&self, entries: &[Entry]) -> bool {
        self.with_value || entries.first().is_some_and(|entry| entry.sort.is_some())
    }

    /// Key an entry is ordered by, as a single value
    pub(crate) fn merge_key(&self, entry: &Entry) -> Value {
        match (&entry.sort, self.with_value) {
            (Some(sort), false) => sort.clone(),
            (Some(sort), true) => Value::Tuple(vec![sort.clone(), entry.value.clone()]),
            (None, _) => entry.value.clone(),
        }
    }

    fn cmp_entries(&self, a: &Entry, b: &Entry) -> Ordering {
        match (&a.sort, &b.sort) {
            (Some(x), Some(y)) if self.with_value => {
                x.cmp(y).then_with(|| a.value.cmp(&b.value))
            }
            (Some(x), Some(y)) => x.cmp(y),
            _ => a.value.cmp(&b.value),
        }
    }

    fn try_cmp_entries(&self, a: &Entry, b: &Entry) -> Result<Ordering, UnorderableKeyError> {
        match (&a.sort, &b.sort) {
            (Some(x), Some(y)) if self.with_value => match x.try_cmp(y)? {
                Ordering::Equal => a.value.try_cmp(&b.value),
                ordering => Ok(ordering),
            },
            (Some(x), Some(y)) => x.try_cmp(y),
            _ => a.value.try_cmp(&b.value),
        }
    }
}

/// Stable sort of `items` by `cmp`, then checks every adjacent pair with
/// `try_cmp`
pub fn checked_sort_by<T>(
    items: &mut [T],
    reverse: bool,
    cmp: impl Fn(&T, &T) -> Ordering,
    try_cmp: impl Fn(&T, &T) -> Result<Ordering, UnorderableKeyError>,
) -> Result<(), UnorderableKeyError> {
    if reverse {
        items.sort_by(|a, b| cmp(b, a));
    } else {
        items.sort_by(|a, b| cmp(a, b));
    }
    for pair in items.windows(2) {
        try_cmp(&pair[0], &pair[1])?;
    }
    Ok(())
}

/// Stable sort of `items` by the [`Value`] returned by `key`
///
/// ```
/// use tinymr::sort::checked_sort_by_key;
/// use tinymr::Value;
///
/// let mut pairs = vec![(Value::from(2), "b"), (Value::from(1), "a"), (Value::from(2), "c")];
/// checked_sort_by_key(&mut pairs, |(k, _)| k, true).unwrap();
/// assert_eq!(pairs.iter().map(|(_, v)| *v).collect::<Vec<_>>(), vec!["b", "c", "a"]);
///
/// let mut mixed = vec![Value::from(1), Value::from("1")];
/// assert!(checked_sort_by_key(&mut mixed, |v| v, false).is_err());
/// ```
pub fn checked_sort_by_key<T, F>(
    items: &mut [T],
    key: F,
    reverse: bool,
) -> Result<(), UnorderableKeyError>
where
    F: Fn(&T) -> &Value,
{
    checked_sort_by(
        items,
        reverse,
        |a, b| key(a).cmp(key(b)),
        |a, b| key(a).try_cmp(key(b)),
    )
}

pub fn sort_values(values: &mut [Value], reverse: bool) -> Result<(), UnorderableKeyError> {
    checked_sort_by_key(values, |v| v, reverse)
}

/// Sorts the entries of one partition.
///
/// Entries carrying a sort key are sorted on it (then on the value, with
/// [`SortOrder::with_value`]); entries without one are sorted on their value
/// only with [`SortOrder::with_value`], and left in arrival order otherwise.
pub fn sort_bucket(entries: &mut [Entry], order: SortOrder) -> Result<(), UnorderableKeyError> {
    if !order.applies_to(entries) {
        return Ok(());
    }
    checked_sort_by(
        entries,
        order.reverse,
        |a, b| order.cmp_entries(a, b),
        |a, b| order.try_cmp_entries(a, b),
    )
}

/// Like [`sort_bucket`], but the entries go through `sorter`, so buckets
/// larger than its chunksize are sorted on disk.
pub fn sort_bucket_external(
    entries: Vec<Entry>,
    order: SortOrder,
    sorter: &ExternalSorter,
) -> Result<Vec<Entry>> {
    if !order.applies_to(&entries) {
        return Ok(entries);
    }
    let sorter = sorter
        .clone()
        .with_reverse(order.reverse)
        .with_key(move |record| encoded_entry_key(record, order));
    sorter
        .sort_stream(entries.into_iter().map(encode_entry))?
        .map(|record| decode_entry(record?))
        .collect()
}

fn encode_entry(entry: Entry) -> Value {
    Value::Tuple(vec![
        Value::Bool(entry.sort.is_some()),
        entry.sort.unwrap_or_default(),
        entry.value,
    ])
}

fn encoded_entry_key(record: &Value, order: SortOrder) -> Value {
    match record.as_tuple() {
        Some([Value::Bool(true), sort, value]) if order.with_value => {
            Value::Tuple(vec![sort.clone(), value.clone()])
        }
        Some([Value::Bool(true), sort, _]) => sort.clone(),
        Some([_, _, value]) => value.clone(),
        _ => record.clone(),
    }
}

fn decode_entry(record: Value) -> Result<Entry> {
    let Value::Tuple(fields) = record else {
        bail!("Expected an encoded entry, got {record}");
    };
    match <[Value; 3]>::try_from(fields) {
        Ok([Value::Bool(has_sort), sort, value]) => Ok(Entry {
            sort: has_sort.then_some(sort),
            value,
        }),
        Ok(fields) => bail!("Expected an encoded entry, got {:?}", fields),
        Err(fields) => bail!("Expected an encoded entry, got {:?}", fields),
    }
}

/// The head of a sorted iterator, with the rest of it.
///
/// Comparison is the **reverse** of the head's key, so a max-heap of them
/// yields the smallest head first. Equal keys are broken by source index,
/// which keeps the merge stable.
struct HeadTail<T, I> {
    key: Value,
    head: T,
    source: usize,
    tail: I,
    reverse: bool,
}

impl<T, I> PartialEq for HeadTail<T, I> {
    #[inline(always)]
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<T, I> Eq for HeadTail<T, I> {}

impl<T, I> PartialOrd for HeadTail<T, I> {
    #[inline(always)]
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T, I> Ord for HeadTail<T, I> {
    #[inline(always)]
    fn cmp(&self, other: &Self) -> Ordering {
        let key_order = if self.reverse {
            other.key.cmp(&self.key)
        } else {
            self.key.cmp(&other.key)
        };
        key_order
            .then_with(|| self.source.cmp(&other.source))
            .reverse()
    }
}

/// Merges sorted iterators with a [quaternary heap](dary_heap::QuaternaryHeap),
/// yielding in increasing (or decreasing, if `reverse`) key order.
///
/// Every yielded key is checked against the previous one with
/// [`Value::try_cmp`]; the merge stops after the first error, whether it
/// comes from a source or from an unorderable pair of keys.
///
/// ```
/// use tinymr::sort::KMerge;
/// use tinymr::Value;
///
/// let runs = vec![
///     vec![Value::from(1), Value::from(4)],
///     vec![Value::from(2), Value::from(3)],
/// ];
/// let merged = KMerge::new(
///     runs.into_iter().map(|run| run.into_iter().map(Ok)),
///     Value::clone,
///     false,
/// )
/// .unwrap()
/// .collect::<anyhow::Result<Vec<_>>>()
/// .unwrap();
/// assert_eq!(merged, tinymr::keys![1, 2, 3, 4]);
/// ```
pub struct KMerge<T, I, F>
where
    I: Iterator<Item = Result<T>>,
    F: Fn(&T) -> Value,
{
    heap: QuaternaryHeap<HeadTail<T, I>>,
    key: F,
    reverse: bool,
    last_key: Option<Value>,
    failed: bool,
}

impl<T, I, F> KMerge<T, I, F>
where
    I: Iterator<Item = Result<T>>,
    F: Fn(&T) -> Value,
{
    /// Reads the first item of every iterator; fails if any of them does.
    pub fn new(iters: impl IntoIterator<Item = I>, key: F, reverse: bool) -> Result<Self> {
        let iters = iters.into_iter();
        let mut heap = QuaternaryHeap::with_capacity(iters.size_hint().1.unwrap_or(10));
        for (source, mut iter) in iters.enumerate() {
            if let Some(head) = iter.next() {
                let head = head?;
                heap.push(HeadTail {
                    key: key(&head),
                    head,
                    source,
                    tail: iter,
                    reverse,
                });
            }
        }
        Ok(KMerge {
            heap,
            key,
            reverse,
            last_key: None,
            failed: false,
        })
    }

    pub fn is_reverse(&self) -> bool {
        self.reverse
    }

    fn pop(&mut self) -> Option<Result<(Value, T)>> {
        let mut head_tail = self.heap.peek_mut()?;
        match head_tail.tail.next() {
            None => {
                let HeadTail { key, head, .. } = PeekMut::pop(head_tail);
                Some(Ok((key, head)))
            }
            Some(Ok(item)) => {
                let new_key = (self.key)(&item);
                let key = std::mem::replace(&mut head_tail.key, new_key);
                let head = std::mem::replace(&mut head_tail.head, item);
                Some(Ok((key, head)))
            }
            Some(Err(e)) => Some(Err(e)),
        }
    }
}

impl<T, I, F> Iterator for KMerge<T, I, F>
where
    I: Iterator<Item = Result<T>>,
    F: Fn(&T) -> Value,
{
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let (key, head) = match self.pop()? {
            Ok(popped) => popped,
            Err(e) => {
                self.failed = true;
                return Some(Err(e));
            }
        };
        if let Some(last_key) = &self.last_key {
            if let Err(e) = last_key.try_cmp(&key) {
                self.failed = true;
                return Some(Err(e.into()));
            }
        }
        self.last_key = Some(key);
        Some(Ok(head))
    }
}

/*
 * Copyright (C) 2025  The Software Heritage developers
 * See the AUTHORS file at the top-level directory of this distribution
 * License: GNU General Public License version 3, or any later version
 * See top-level LICENSE file for more information
 */

//! Sorting for data that doesn't fit in RAM
//!
//! Records are read in chunks, each chunk is sorted in memory and written to
//! its own file (a *run*) in a temporary directory, then all runs are k-way
//! merged. Temporary directories are owned by [`Runs`], and removed when the
//! [`Runs`] (or the [`Sorted`] iterator holding them) is dropped.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tempfile::TempDir;

use super::{checked_sort_by_key, sort_values, KMerge};
use crate::errors::InvalidConfigurationError;
use crate::pool::WorkerPool;
use crate::serialize::{BinarySerializer, RecordReader, Serializer};
use crate::value::Value;

/// Extracts the key records are sorted on
pub type KeyFn = Arc<dyn Fn(&Value) -> Value + Send + Sync>;

type MergeKey = Box<dyn Fn(&Value) -> Value + Send + Sync>;

pub const DEFAULT_CHUNKSIZE: usize = 100_000;
pub const DEFAULT_MAX_MERGE_WIDTH: usize = 256;

/// Sorted runs on disk, and the temporary directory holding them (if they
/// are not caller-owned files).
///
/// Dropping this deletes the directory, and every run in it.
pub struct Runs {
    paths: Vec<PathBuf>,
    serializer: Arc<dyn Serializer>,
    // last, so it is removed after everything else is released
    dir: Option<TempDir>,
}

impl fmt::Debug for Runs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runs")
            .field("paths", &self.paths)
            .field("serializer", &self.serializer)
            .field("dir", &self.dir.as_ref().map(TempDir::path))
            .finish()
    }
}

impl Runs {
    fn new(serializer: Arc<dyn Serializer>) -> Self {
        Runs {
            paths: Vec::new(),
            serializer,
            dir: None,
        }
    }

    /// Number of runs
    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    /// The temporary directory holding the runs, if one was created
    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_ref().map(TempDir::path)
    }

    /// Reads the records of the `i`-th run
    pub fn read(&self, i: usize) -> Result<RecordReader> {
        let path = self
            .paths
            .get(i)
            .with_context(|| format!("There are only {} runs", self.paths.len()))?;
        self.serializer.reader(path)
    }

    fn readers(&self) -> impl Iterator<Item = Result<RecordReader>> + '_ {
        (0..self.len()).map(|i| self.read(i))
    }

    /// Returns the temporary directory, creating it on first use
    fn temp_dir(&mut self, parent: Option<&Path>) -> Result<PathBuf> {
        if let Some(dir) = &self.dir {
            return Ok(dir.path().to_owned());
        }
        let mut builder = tempfile::Builder::new();
        builder.prefix("tinymr-");
        let dir = match parent {
            Some(parent) => builder.tempdir_in(parent),
            None => builder.tempdir(),
        }
        .context("Could not create temporary directory for sorting")?;
        let path = dir.path().to_owned();
        self.dir = Some(dir);
        Ok(path)
    }
}

enum SortedInner {
    Memory(std::vec::IntoIter<Value>),
    // `merge` is declared first so its readers are closed before the runs are deleted
    Merge {
        merge: KMerge<Value, RecordReader, MergeKey>,
        runs: Vec<Runs>,
    },
}

/// Iterator on sorted records, returned by [`ExternalSorter`].
///
/// Temporary runs backing it are deleted once it is exhausted or dropped.
pub struct Sorted {
    inner: SortedInner,
}

impl Sorted {
    fn empty() -> Self {
        Sorted {
            inner: SortedInner::Memory(Vec::new().into_iter()),
        }
    }

    /// Number of temporary runs this iterator is still reading from
    pub fn num_runs(&self) -> usize {
        match &self.inner {
            SortedInner::Memory(_) => 0,
            SortedInner::Merge { runs, .. } => runs.iter().map(Runs::len).sum(),
        }
    }
}

impl fmt::Debug for Sorted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sorted")
            .field("num_runs", &self.num_runs())
            .finish_non_exhaustive()
    }
}

impl Iterator for Sorted {
    type Item = Result<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        match &mut self.inner {
            SortedInner::Memory(records) => records.next().map(Ok),
            SortedInner::Merge { merge, .. } => {
                let next = merge.next();
                if next.is_none() {
                    // release temporary files as early as possible
                    *self = Sorted::empty();
                }
                next
            }
        }
    }
}

/// External merge sort of [`Value`] records.
///
/// ```
/// use tinymr::sort::external::ExternalSorter;
/// use tinymr::Value;
///
/// let sorted = ExternalSorter::new()
///     .with_chunksize(2)
///     .sort_stream((0..9).rev().map(Value::from))?
///     .collect::<anyhow::Result<Vec<_>>>()?;
/// assert_eq!(sorted, (0..9).map(Value::from).collect::<Vec<_>>());
/// # Ok::<(), anyhow::Error>(())
/// ```
#[derive(Clone)]
pub struct ExternalSorter {
    chunksize: usize,
    jobs: usize,
    serializer: Arc<dyn Serializer>,
    key: Option<KeyFn>,
    reverse: bool,
    temp_dir: Option<PathBuf>,
    allow_memory_sort: bool,
    max_merge_width: usize,
}

impl fmt::Debug for ExternalSorter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExternalSorter")
            .field("chunksize", &self.chunksize)
            .field("jobs", &self.jobs)
            .field("serializer", &self.serializer)
            .field("key", &self.key.as_ref().map(|_| "<fn>"))
            .field("reverse", &self.reverse)
            .field("temp_dir", &self.temp_dir)
            .field("allow_memory_sort", &self.allow_memory_sort)
            .field("max_merge_width", &self.max_merge_width)
            .finish()
    }
}

impl Default for ExternalSorter {
    fn default() -> Self {
        ExternalSorter {
            chunksize: DEFAULT_CHUNKSIZE,
            jobs: 1,
            serializer: Arc::new(BinarySerializer::default()),
            key: None,
            reverse: false,
            temp_dir: None,
            allow_memory_sort: true,
            max_merge_width: DEFAULT_MAX_MERGE_WIDTH,
        }
    }
}

impl ExternalSorter {
    pub fn new() -> Self {
        ExternalSorter::default()
    }

    /// Sets the number of records sorted in memory and written to each run
    pub fn with_chunksize(mut self, chunksize: usize) -> Self {
        self.chunksize = chunksize;
        self
    }

    /// Sets the number of chunks (or files) sorted in parallel
    pub fn with_jobs(mut self, jobs: usize) -> Self {
        self.jobs = jobs;
        self
    }

    /// Sets the format of temporary runs
    pub fn with_serializer(mut self, serializer: impl Serializer + 'static) -> Self {
        self.serializer = Arc::new(serializer);
        self
    }

    /// Sorts records on `key(record)` instead of the record itself
    pub fn with_key(mut self, key: impl Fn(&Value) -> Value + Send + Sync + 'static) -> Self {
        self.key = Some(Arc::new(key));
        self
    }

    pub fn with_reverse(mut self, reverse: bool) -> Self {
        self.reverse = reverse;
        self
    }

    /// Sets the directory temporary directories are created in, instead of
    /// the platform default
    pub fn with_temp_dir(mut self, path: impl AsRef<Path>) -> Self {
        self.temp_dir = Some(path.as_ref().to_owned());
        self
    }

    /// Whether input fitting in a single chunk is sorted without touching
    /// the disk
    pub fn with_memory_sort(mut self, allow: bool) -> Self {
        self.allow_memory_sort = allow;
        self
    }

    /// Sets the maximum number of runs merged at once. Beyond this, runs are
    /// merged in groups into fewer, larger runs first.
    pub fn with_max_merge_width(mut self, width: usize) -> Self {
        self.max_merge_width = width;
        self
    }

    pub fn chunksize(&self) -> usize {
        self.chunksize
    }

    fn validate(&self) -> Result<(), InvalidConfigurationError> {
        for (name, value) in [
            ("chunksize", self.chunksize),
            ("jobs", self.jobs),
            ("max_merge_width", self.max_merge_width),
        ] {
            if value == 0 {
                return Err(InvalidConfigurationError::NonPositive { name, value });
            }
        }
        Ok(())
    }

    fn merge_key(&self) -> MergeKey {
        match self.key.clone() {
            Some(key) => Box::new(move |record: &Value| key(record)),
            None => Box::new(Value::clone),
        }
    }

    fn pool(&self) -> Result<WorkerPool> {
        WorkerPool::new(self.jobs, 1, true)
    }

    fn sort_chunk(&self, mut chunk: Vec<Value>) -> Result<Vec<Value>> {
        match &self.key {
            None => {
                sort_values(&mut chunk, self.reverse)?;
                Ok(chunk)
            }
            Some(key) => {
                let mut keyed: Vec<(Value, Value)> =
                    chunk.into_iter().map(|record| (key(&record), record)).collect();
                checked_sort_by_key(&mut keyed, |(k, _)| k, self.reverse)?;
                Ok(keyed.into_iter().map(|(_, record)| record).collect())
            }
        }
    }

    /// Sorts a stream of records, spilling to disk if it holds more than one
    /// chunk
    pub fn sort_stream(&self, records: impl IntoIterator<Item = Value>) -> Result<Sorted> {
        self.sort_records(records.into_iter().map(Ok))
    }

    /// Like [`sort_stream`](Self::sort_stream), for records that may fail to
    /// be read
    pub fn sort_records(
        &self,
        records: impl IntoIterator<Item = Result<Value>>,
    ) -> Result<Sorted> {
        self.validate()?;
        log::debug!(
            "Sorting a stream with {} jobs, chunksize {} and serializer {:?}",
            self.jobs,
            self.chunksize,
            self.serializer
        );
        let mut records = records.into_iter();
        let first = next_chunk(&mut records, self.chunksize)?;
        if self.allow_memory_sort && first.len() < self.chunksize {
            log::debug!(
                "Got {} items with chunksize {}, sorting in memory",
                first.len(),
                self.chunksize
            );
            return Ok(Sorted {
                inner: SortedInner::Memory(self.sort_chunk(first)?.into_iter()),
            });
        }
        let runs = self.spill(first, records)?;
        self.merge_runs(vec![runs])
    }

    /// Sorts a stream into runs on disk without merging them, even if it would
    /// fit in one chunk
    pub fn sort_into_files(&self, records: impl IntoIterator<Item = Value>) -> Result<Runs> {
        self.validate()?;
        let mut records = records.into_iter().map(Ok);
        let first = next_chunk(&mut records, self.chunksize)?;
        self.spill(first, records)
    }

    /// Sorts the records of a file, read with `deserializer`
    pub fn sort_file<S: Serializer>(&self, path: impl AsRef<Path>, deserializer: &S) -> Result<Sorted> {
        let path = path.as_ref();
        log::debug!("Sorting {} with {:?}", path.display(), deserializer);
        let records = deserializer.reader(path)?;
        self.sort_records(records)
            .with_context(|| format!("Could not sort {}", path.display()))
    }

    /// Sorts several files into runs, in parallel across files, then merges
    /// all runs
    pub fn sort_files<P, S>(&self, paths: &[P], deserializer: &S) -> Result<Sorted>
    where
        P: AsRef<Path> + Sync,
        S: Serializer,
    {
        self.validate()?;
        log::info!("Sorting {} files with {} jobs", paths.len(), self.jobs);
        let per_file = ExternalSorter {
            jobs: 1,
            ..self.clone()
        };
        let runs = self
            .pool()?
            .run(paths.iter().enumerate(), |(i, path)| {
                let path = path.as_ref();
                let mut records = deserializer.reader(path)?;
                let first = next_chunk(&mut records, per_file.chunksize)?;
                let runs = per_file
                    .spill(first, records)
                    .with_context(|| format!("Could not sort {}", path.display()))?;
                Ok((i, runs))
            })
            .collect::<Result<Vec<_>>>()?;
        let runs = sorted_by_index(runs);
        log::info!(
            "Done sorting, merging {} runs",
            runs.iter().map(Runs::len).sum::<usize>()
        );
        self.merge_runs(runs)
    }

    /// Merges files that are already sorted (by this sorter's key and
    /// direction). The files are left in place.
    pub fn merge_files<P, S>(&self, paths: &[P], deserializer: S) -> Result<Sorted>
    where
        P: AsRef<Path>,
        S: Serializer + 'static,
    {
        self.validate()?;
        let files = Runs {
            paths: paths.iter().map(|path| path.as_ref().to_owned()).collect(),
            serializer: Arc::new(deserializer),
            dir: None,
        };
        self.merge_runs(vec![files])
    }

    /// Merges runs, previously returned by [`sort_into_files`](Self::sort_into_files)
    pub fn merge_runs(&self, runs: Vec<Runs>) -> Result<Sorted> {
        let runs = self.pre_merge(runs)?;
        let readers = runs
            .iter()
            .flat_map(Runs::readers)
            .collect::<Result<Vec<_>>>()?;
        if readers.is_empty() {
            return Ok(Sorted::empty());
        }
        let merge = KMerge::new(readers, self.merge_key(), self.reverse)?;
        Ok(Sorted {
            inner: SortedInner::Merge { merge, runs },
        })
    }

    /// Splits the input in chunks, and writes each of them sorted to a new run.
    ///
    /// Chunks are read `jobs` at a time, and sorted in parallel.
    fn spill(
        &self,
        first: Vec<Value>,
        mut records: impl Iterator<Item = Result<Value>>,
    ) -> Result<Runs> {
        let pool = self.pool()?;
        let mut runs = Runs::new(self.serializer.clone());
        let mut pending = Some(first);
        loop {
            let mut wave = Vec::with_capacity(self.jobs);
            while wave.len() < self.jobs {
                let chunk = match pending.take() {
                    Some(chunk) => chunk,
                    None => next_chunk(&mut records, self.chunksize)?,
                };
                if chunk.is_empty() {
                    break;
                }
                wave.push(chunk);
            }
            if wave.is_empty() {
                break;
            }

            let dir = runs.temp_dir(self.temp_dir.as_deref())?;
            let first_index = runs.len();
            let tasks = wave
                .into_iter()
                .enumerate()
                .map(|(i, chunk)| (first_index + i, chunk));
            let written = pool
                .run(tasks, |(i, chunk)| {
                    let path = dir.join(format!("run_{i}"));
                    let sorted = self.sort_chunk(chunk)?;
                    let count = self.serializer.serialize(&path, &mut sorted.into_iter())?;
                    log::debug!("Wrote {} items to {}", count, path.display());
                    Ok((i, path))
                })
                .collect::<Result<Vec<_>>>()?;
            runs.paths.extend(sorted_by_index(written));
        }
        log::debug!("Sorted data into {} runs", runs.len());
        Ok(runs)
    }

    /// Merges groups of runs into larger runs until there are no more than
    /// `max_merge_width` of them
    fn pre_merge(&self, mut runs: Vec<Runs>) -> Result<Vec<Runs>> {
        let width = self.max_merge_width.max(2);
        loop {
            let total: usize = runs.iter().map(Runs::len).sum();
            if total <= width {
                return Ok(runs);
            }
            log::info!("Pre-merging {total} runs in groups of {width}");
            let mut merged = Runs::new(self.serializer.clone());
            let dir = merged.temp_dir(self.temp_dir.as_deref())?;
            {
                let sources: Vec<(&Runs, usize)> = runs
                    .iter()
                    .flat_map(|r| (0..r.len()).map(move |i| (r, i)))
                    .collect();
                let groups = sources
                    .chunks(width)
                    .map(<[_]>::to_vec)
                    .enumerate()
                    .collect::<Vec<_>>();
                let written = self
                    .pool()?
                    .run(groups, |(i, group)| {
                        let path = dir.join(format!("run_{i}"));
                        let readers = group
                            .iter()
                            .map(|(r, j)| r.read(*j))
                            .collect::<Result<Vec<_>>>()?;
                        let merge = KMerge::new(readers, self.merge_key(), self.reverse)?;
                        let mut writer = self.serializer.writer(&path)?;
                        let mut count = 0;
                        for record in merge {
                            writer.write(&record?)?;
                            count += 1;
                        }
                        writer.finish()?;
                        log::debug!("Pre-merged {} items into {}", count, path.display());
                        Ok((i, path))
                    })
                    .collect::<Result<Vec<_>>>()?;
                merged.paths = sorted_by_index(written);
            }
            // drops (and deletes) the previous runs
            runs = vec![merged];
        }
    }
}

fn next_chunk(
    records: &mut impl Iterator<Item = Result<Value>>,
    chunksize: usize,
) -> Result<Vec<Value>> {
    records.by_ref().take(chunksize).collect()
}

fn sorted_by_index<T>(mut items: Vec<(usize, T)>) -> Vec<T> {
    items.sort_by_key(|(i, _)| *i);
    items.into_iter().map(|(_, item)| item).collect()
}

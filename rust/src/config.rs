/*
 * Copyright (C) 2025  The Software Heritage developers
 * See the AUTHORS file at the top-level directory of this distribution
 * License: GNU General Public License version 3, or any later version
 * See top-level LICENSE file for more information
 */

use crate::errors::InvalidConfigurationError;
use crate::key::KeyLayout;
use crate::sort::external::ExternalSorter;
use crate::sort::SortOrder;

/// Settings of a [`Task`](crate::pipeline::Task), read but never mutated while it runs.
///
/// Per-phase settings left to `None` fall back to the global one.
///
/// ```
/// use tinymr::TaskConfig;
///
/// let config = TaskConfig {
///     jobs: 4,
///     reduce_jobs: Some(1),
///     ..Default::default()
/// };
/// assert_eq!(config.map_jobs(), 4);
/// assert_eq!(config.reduce_jobs(), 1);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskConfig {
    pub n_partition_keys: usize,
    pub n_sort_keys: usize,

    pub jobs: usize,
    pub map_jobs: Option<usize>,
    pub reduce_jobs: Option<usize>,

    pub chunksize: usize,
    pub map_chunksize: Option<usize>,
    pub reduce_chunksize: Option<usize>,

    pub sort: bool,
    pub sort_map: Option<bool>,
    pub sort_combine: Option<bool>,
    pub sort_reduce: Option<bool>,
    pub sort_output: Option<bool>,

    /// Break ties between equal sort keys with the value (or sort on the
    /// value alone when tuples carry no sort key)
    pub sort_map_with_value: bool,
    pub sort_map_reverse: bool,
    pub sort_reduce_with_value: bool,
    pub sort_reduce_reverse: bool,

    /// Partitions with more entries than this are sorted on disk, in runs
    /// of this many entries
    pub external_sort_chunksize: Option<usize>,

    /// Workers are threads. Process pools are not available, so this must
    /// stay `true` whenever a phase uses more than one job.
    pub threaded: bool,
}

impl Default for TaskConfig {
    fn default() -> Self {
        TaskConfig {
            n_partition_keys: 1,
            n_sort_keys: 0,
            jobs: 1,
            map_jobs: None,
            reduce_jobs: None,
            chunksize: 1,
            map_chunksize: None,
            reduce_chunksize: None,
            sort: true,
            sort_map: None,
            sort_combine: None,
            sort_reduce: None,
            sort_output: None,
            sort_map_with_value: false,
            sort_map_reverse: false,
            sort_reduce_with_value: false,
            sort_reduce_reverse: false,
            external_sort_chunksize: None,
            threaded: true,
        }
    }
}

impl TaskConfig {
    pub fn map_jobs(&self) -> usize {
        self.map_jobs.unwrap_or(self.jobs)
    }
    pub fn reduce_jobs(&self) -> usize {
        self.reduce_jobs.unwrap_or(self.jobs)
    }
    pub fn map_chunksize(&self) -> usize {
        self.map_chunksize.unwrap_or(self.chunksize)
    }
    pub fn reduce_chunksize(&self) -> usize {
        self.reduce_chunksize.unwrap_or(self.chunksize)
    }
    pub fn sort_map(&self) -> bool {
        self.sort_map.unwrap_or(self.sort)
    }
    pub fn sort_combine(&self) -> bool {
        self.sort_combine.unwrap_or(self.sort)
    }
    pub fn sort_reduce(&self) -> bool {
        self.sort_reduce.unwrap_or(self.sort)
    }
    pub fn sort_output(&self) -> bool {
        self.sort_output.unwrap_or(self.sort)
    }

    /// Order applied to map (and combine) output, if sorting is enabled
    pub fn map_order(&self) -> Option<SortOrder> {
        self.sort_map().then_some(SortOrder {
            with_value: self.sort_map_with_value,
            reverse: self.sort_map_reverse,
        })
    }

    pub fn combine_order(&self) -> Option<SortOrder> {
        self.sort_combine().then_some(SortOrder {
            with_value: self.sort_map_with_value,
            reverse: self.sort_map_reverse,
        })
    }

    pub fn reduce_order(&self) -> Option<SortOrder> {
        self.sort_reduce().then_some(SortOrder {
            with_value: self.sort_reduce_with_value,
            reverse: self.sort_reduce_reverse,
        })
    }

    /// Sorter used for partitions too large to be sorted in memory
    pub fn external_sorter(&self) -> Option<ExternalSorter> {
        self.external_sort_chunksize
            .map(|chunksize| ExternalSorter::new().with_chunksize(chunksize))
    }

    pub fn layout(&self) -> Result<KeyLayout, InvalidConfigurationError> {
        KeyLayout::new(self.n_partition_keys, self.n_sort_keys)
    }

    /// Checks the configuration can be run, without running anything
    pub fn validate(&self) -> Result<(), InvalidConfigurationError> {
        self.layout()?;
        for (name, value) in [
            ("jobs", self.jobs),
            ("map_jobs", self.map_jobs()),
            ("reduce_jobs", self.reduce_jobs()),
            ("chunksize", self.chunksize),
            ("map_chunksize", self.map_chunksize()),
            ("reduce_chunksize", self.reduce_chunksize()),
            (
                "external_sort_chunksize",
                self.external_sort_chunksize.unwrap_or(1),
            ),
        ] {
            if value == 0 {
                return Err(InvalidConfigurationError::NonPositive { name, value });
            }
        }
        if !self.threaded {
            let jobs = self.map_jobs().max(self.reduce_jobs());
            if jobs > 1 {
                return Err(InvalidConfigurationError::UnsupportedPoolMode { jobs });
            }
        }
        Ok(())
    }
}

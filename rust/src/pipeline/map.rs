/*
 * Copyright (C) 2025  The Software Heritage developers
 * See the AUTHORS file at the top-level directory of this distribution
 * License: GNU General Public License version 3, or any later version
 * See top-level LICENSE file for more information
 */

use anyhow::Result;
use itertools::Itertools;

use super::{reconcile_arity, KeyCheck, MapFn, ReduceFn, Shard};
use crate::config::TaskConfig;
use crate::key::{ArityGate, KeyLayout, Phase};
use crate::observer::PipelineObserver;
use crate::partition::{merge_partitions, Partitions};
use crate::pool::WorkerPool;
use crate::sort::external::ExternalSorter;

pub(super) struct MapStage<'a, I> {
    pub mapper: &'a MapFn<I>,
    pub combiner: Option<&'a ReduceFn>,
    pub check_keys: Option<&'a KeyCheck>,
    pub layout: KeyLayout,
    pub config: &'a TaskConfig,
    pub external: Option<&'a ExternalSorter>,
}

impl<I: Send> MapStage<'_, I> {
    /// Maps, partitions, sorts and combines all of `input`.
    ///
    /// With one job, the input is streamed through a single shard. Otherwise
    /// it is split in shards of `map_chunksize` items, each processed
    /// independently by a worker, and their partitions are merged.
    pub fn run(
        &self,
        input: impl IntoIterator<Item = I>,
        observer: &mut dyn PipelineObserver,
    ) -> Result<Partitions> {
        let config = self.config;
        let pool = WorkerPool::new(config.map_jobs(), 1, config.threaded)?;
        if pool.is_serial() {
            let shard = self.run_shard(input, true)?;
            observer.items_processed(Phase::Map, shard.items);
            return Ok(shard.partitions);
        }

        let mut chunks: Vec<Vec<I>> = Vec::new();
        for chunk in &input.into_iter().chunks(config.map_chunksize()) {
            chunks.push(chunk.collect());
        }
        log::debug!(
            "Mapping {} chunks with {} jobs",
            chunks.len(),
            pool.jobs()
        );

        let mut shards = Vec::with_capacity(chunks.len());
        for shard in pool.run(chunks, |chunk| self.run_shard(chunk, false)) {
            let shard = shard?;
            observer.items_processed(Phase::Map, shard.items);
            shards.push(shard);
        }

        let first = reconcile_arity(Phase::Map, shards.iter().map(|s| s.first.as_ref()))?;
        if let (Some(check_keys), Some(first)) = (self.check_keys, first) {
            check_keys(first)?;
        }
        let order = if self.combiner.is_some() {
            reconcile_arity(
                Phase::Combine,
                shards.iter().map(|s| s.combine_first.as_ref()),
            )?;
            config.combine_order()
        } else {
            config.map_order()
        };
        merge_partitions(shards.into_iter().map(|s| s.partitions).collect(), order)
    }

    fn run_shard(&self, items: impl IntoIterator<Item = I>, check_now: bool) -> Result<Shard> {
        let mut gate = ArityGate::new(Phase::Map, self.layout);
        let mut partitions = Partitions::new();
        let mut count = 0;
        for item in items {
            count += 1;
            for tuple in (self.mapper)(item)? {
                let first = gate.first().is_none();
                partitions.push(gate.check(tuple)?);
                if first && check_now {
                    if let (Some(check_keys), Some(first)) = (self.check_keys, gate.first()) {
                        check_keys(first)?;
                    }
                }
            }
        }
        if let Some(order) = self.config.map_order() {
            partitions.sort_buckets(order, self.external)?;
        }

        let mut shard = Shard {
            partitions,
            first: gate.first().cloned(),
            combine_first: None,
            items: count,
        };
        if let Some(combiner) = self.combiner {
            self.combine(combiner, &mut shard)?;
        }
        Ok(shard)
    }

    /// Replaces the partitions of `shard` with their combined, re-partitioned
    /// and re-sorted version
    fn combine(&self, combiner: &ReduceFn, shard: &mut Shard) -> Result<()> {
        let mut gate = ArityGate::new(Phase::Combine, self.layout);
        let mut combined = Partitions::new();
        for (key, entries) in std::mem::take(&mut shard.partitions) {
            let values = entries.into_iter().map(|entry| entry.value).collect();
            for tuple in combiner(&key, values)? {
                combined.push(gate.check(tuple)?);
            }
        }
        if let Some(order) = self.config.combine_order() {
            combined.sort_buckets(order, self.external)?;
        }
        shard.partitions = combined;
        shard.combine_first = gate.first().cloned();
        Ok(())
    }
}

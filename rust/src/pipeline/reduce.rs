/*
 * Copyright (C) 2025  The Software Heritage developers
 * See the AUTHORS file at the top-level directory of this distribution
 * License: GNU General Public License version 3, or any later version
 * See top-level LICENSE file for more information
 */

use anyhow::Result;
use itertools::Itertools;

use super::{reconcile_arity, KeyCheck, Reducer, Shard};
use crate::config::TaskConfig;
use crate::key::{ArityGate, KeyLayout, Phase};
use crate::observer::PipelineObserver;
use crate::partition::{merge_partitions, Partitions};
use crate::pool::WorkerPool;
use crate::sort::external::ExternalSorter;
use crate::value::Value;

pub(super) struct ReduceStage<'a> {
    pub reducer: &'a Reducer,
    pub check_keys: Option<&'a KeyCheck>,
    pub layout: KeyLayout,
    pub config: &'a TaskConfig,
    pub external: Option<&'a ExternalSorter>,
}

impl ReduceStage<'_> {
    /// Reduces every partition, then partitions and sorts the reducer's output.
    ///
    /// `partitions` is consumed as it is reduced.
    pub fn run(
        &self,
        partitions: Partitions,
        observer: &mut dyn PipelineObserver,
    ) -> Result<Partitions> {
        let config = self.config;
        let pool = WorkerPool::new(config.reduce_jobs(), 1, config.threaded)?;
        let groups = partitions.into_iter().map(|(key, entries)| {
            let values: Vec<Value> = entries.into_iter().map(|entry| entry.value).collect();
            (key, values)
        });
        if pool.is_serial() {
            let shard = self.run_shard(groups, true)?;
            observer.items_processed(Phase::Reduce, shard.items);
            return Ok(shard.partitions);
        }

        let mut chunks: Vec<Vec<(Value, Vec<Value>)>> = Vec::new();
        for chunk in &groups.chunks(config.reduce_chunksize()) {
            chunks.push(chunk.collect());
        }
        log::debug!(
            "Reducing {} chunks of keys with {} jobs",
            chunks.len(),
            pool.jobs()
        );

        let mut shards = Vec::with_capacity(chunks.len());
        for shard in pool.run(chunks, |chunk| self.run_shard(chunk, false)) {
            let shard = shard?;
            observer.items_processed(Phase::Reduce, shard.items);
            shards.push(shard);
        }

        let first = reconcile_arity(Phase::Reduce, shards.iter().map(|s| s.first.as_ref()))?;
        if let (Some(check_keys), Some(first)) = (self.check_keys, first) {
            check_keys(first)?;
        }
        merge_partitions(
            shards.into_iter().map(|s| s.partitions).collect(),
            config.reduce_order(),
        )
    }

    fn run_shard(
        &self,
        groups: impl IntoIterator<Item = (Value, Vec<Value>)>,
        check_now: bool,
    ) -> Result<Shard> {
        let mut gate = ArityGate::new(Phase::Reduce, self.layout);
        let mut partitions = Partitions::new();
        let mut count = 0;
        for (key, values) in groups {
            count += 1;
            for tuple in self.reducer.call(&key, values)? {
                let first = gate.first().is_none();
                partitions.push(gate.check(tuple)?);
                if first && check_now {
                    if let (Some(check_keys), Some(first)) = (self.check_keys, gate.first()) {
                        check_keys(first)?;
                    }
                }
            }
        }
        if let Some(order) = self.config.reduce_order() {
            partitions.sort_buckets(order, self.external)?;
        }
        Ok(Shard {
            partitions,
            first: gate.first().cloned(),
            combine_first: None,
            items: count,
        })
    }
}

/*
 * Copyright (C) 2025  The Software Heritage developers
 * See the AUTHORS file at the top-level directory of this distribution
 * License: GNU General Public License version 3, or any later version
 * See top-level LICENSE file for more information
 */

//! The map → partition → (combine →) sort → reduce pipeline
//!
//! ```
//! use tinymr::pipeline::{Reducer, Task};
//! use tinymr::{keys, Value};
//!
//! let mut task = Task::builder(
//!     |line: &str| Ok(line.split_whitespace().map(|word| keys![word, 1]).collect::<Vec<_>>()),
//!     Reducer::single(|word, counts| {
//!         let total: i64 = counts.iter().filter_map(Value::as_int).sum();
//!         Ok(keys![word.clone(), total])
//!     }),
//! )
//! .build()?;
//!
//! let counts = task.run(["a b a", "b a"])?;
//! assert_eq!(counts.get(&"a".into()).and_then(|v| v.one()), Some(&Value::Int(3)));
//! # Ok::<(), anyhow::Error>(())
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;

use crate::config::TaskConfig;
use crate::errors::{ClosedTaskError, KeyArityError};
use crate::key::{KeyTuple, Phase};
use crate::observer::{LogObserver, PipelineObserver};
use crate::partition::Partitions;
use crate::value::Value;

mod map;
mod reduce;

/// Expands an input item into tagged tuples
pub type MapFn<I> = Arc<dyn Fn(I) -> Result<Vec<KeyTuple>> + Send + Sync>;
/// Aggregates the values of one partition key into tagged tuples
pub type ReduceFn = Arc<dyn Fn(&Value, Vec<Value>) -> Result<Vec<KeyTuple>> + Send + Sync>;
/// Inspects the first tuple of a phase
pub type KeyCheck = Arc<dyn Fn(&[Value]) -> Result<()> + Send + Sync>;

type Hook = Box<dyn FnMut() -> Result<()> + Send>;

/// A reduce step, and whether it returns one tuple per key or any number
#[derive(Clone)]
pub struct Reducer {
    f: ReduceFn,
    single: bool,
}

impl Reducer {
    /// A reducer returning exactly one tuple per key. Output keeps one
    /// value per key.
    pub fn single<F>(f: F) -> Self
    where
        F: Fn(&Value, Vec<Value>) -> Result<KeyTuple> + Send + Sync + 'static,
    {
        Reducer {
            f: Arc::new(move |key: &Value, values: Vec<Value>| Ok(vec![f(key, values)?])),
            single: true,
        }
    }

    /// A reducer returning any number of tuples per key. Output keeps a
    /// sequence of values per key.
    pub fn many<F, T>(f: F) -> Self
    where
        F: Fn(&Value, Vec<Value>) -> Result<T> + Send + Sync + 'static,
        T: IntoIterator<Item = KeyTuple>,
    {
        Reducer {
            f: Arc::new(move |key: &Value, values: Vec<Value>| {
                Ok(f(key, values)?.into_iter().collect())
            }),
            single: false,
        }
    }

    pub fn is_single(&self) -> bool {
        self.single
    }

    pub(crate) fn call(&self, key: &Value, values: Vec<Value>) -> Result<Vec<KeyTuple>> {
        (self.f)(key, values)
    }
}

/// Values a key ended up with
#[derive(Debug, Clone, PartialEq)]
pub enum Values {
    One(Value),
    Many(Vec<Value>),
}

impl Values {
    pub fn one(&self) -> Option<&Value> {
        match self {
            Values::One(value) => Some(value),
            Values::Many(_) => None,
        }
    }

    pub fn many(&self) -> Option<&[Value]> {
        match self {
            Values::One(_) => None,
            Values::Many(values) => Some(values),
        }
    }

    pub fn into_vec(self) -> Vec<Value> {
        match self {
            Values::One(value) => vec![value],
            Values::Many(values) => values,
        }
    }
}

/// Result of a pipeline run: every final partition key with its value(s),
/// in ascending key order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Output {
    entries: Vec<(Value, Values)>,
}

impl Output {
    fn from_partitions(partitions: Partitions, single: bool, check_order: bool) -> Result<Self> {
        if check_order {
            let keys: Vec<&Value> = partitions.keys().collect();
            for pair in keys.windows(2) {
                pair[0].try_cmp(pair[1])?;
            }
        }
        let entries = partitions
            .into_iter()
            .filter_map(|(key, entries)| {
                let mut values = entries.into_iter().map(|entry| entry.value);
                let values = if single {
                    Values::One(values.next()?)
                } else {
                    Values::Many(values.collect())
                };
                Some((key, values))
            })
            .collect();
        Ok(Output { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &Value) -> Option<&Values> {
        self.entries
            .binary_search_by(|(k, _)| k.cmp(key))
            .ok()
            .map(|i| &self.entries[i].1)
    }

    pub fn keys(&self) -> impl Iterator<Item = &Value> {
        self.entries.iter().map(|(key, _)| key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Value, &Values)> {
        self.entries.iter().map(|(key, values)| (key, values))
    }

    pub fn into_map(self) -> BTreeMap<Value, Values> {
        self.entries.into_iter().collect()
    }
}

impl IntoIterator for Output {
    type Item = (Value, Values);
    type IntoIter = std::vec::IntoIter<(Value, Values)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

/// What a worker hands back to the orchestrating thread
pub(crate) struct Shard {
    pub partitions: Partitions,
    /// First tuple emitted by the phase, and by the combiner if any
    pub first: Option<KeyTuple>,
    pub combine_first: Option<KeyTuple>,
    pub items: usize,
}

/// Checks all shards of a phase sampled tuples of the same arity, and
/// returns the first tuple of the phase
pub(crate) fn reconcile_arity<'a>(
    phase: Phase,
    firsts: impl IntoIterator<Item = Option<&'a KeyTuple>>,
) -> Result<Option<&'a KeyTuple>, KeyArityError> {
    let mut reference: Option<&KeyTuple> = None;
    for first in firsts.into_iter().flatten() {
        match reference {
            None => reference = Some(first),
            Some(reference) if reference.len() != first.len() => {
                return Err(KeyArityError {
                    phase,
                    expected: reference.len(),
                    got: first.len(),
                    tuple: first.clone(),
                })
            }
            Some(_) => {}
        }
    }
    Ok(reference)
}

/// Builds a [`Task`]
pub struct TaskBuilder<I, O = Output> {
    mapper: MapFn<I>,
    combiner: Option<ReduceFn>,
    reducers: Vec<Reducer>,
    config: TaskConfig,
    observer: Box<dyn PipelineObserver>,
    init_map: Option<Hook>,
    init_reduce: Option<Hook>,
    check_map_keys: Option<KeyCheck>,
    check_reduce_keys: Option<KeyCheck>,
    on_close: Option<Box<dyn FnOnce() -> Result<()> + Send>>,
    output: Box<dyn FnMut(Output) -> Result<O> + Send>,
}

impl<I, O> TaskBuilder<I, O> {
    pub fn config(mut self, config: TaskConfig) -> Self {
        self.config = config;
        self
    }

    /// Pre-reduces each worker's partitions right after mapping
    pub fn combiner<F, T>(mut self, f: F) -> Self
    where
        F: Fn(&Value, Vec<Value>) -> Result<T> + Send + Sync + 'static,
        T: IntoIterator<Item = KeyTuple>,
    {
        self.combiner = Some(Arc::new(move |key: &Value, values: Vec<Value>| {
            Ok(f(key, values)?.into_iter().collect())
        }));
        self
    }

    /// Appends a reduce step, fed with the re-partitioned output of the
    /// previous one
    pub fn chain_reducer(mut self, reducer: Reducer) -> Self {
        self.reducers.push(reducer);
        self
    }

    pub fn observer(mut self, observer: impl PipelineObserver + 'static) -> Self {
        self.observer = Box::new(observer);
        self
    }

    /// Runs before each map phase
    pub fn init_map(mut self, f: impl FnMut() -> Result<()> + Send + 'static) -> Self {
        self.init_map = Some(Box::new(f));
        self
    }

    /// Runs after the map phase completed, before the first reduce step
    pub fn init_reduce(mut self, f: impl FnMut() -> Result<()> + Send + 'static) -> Self {
        self.init_reduce = Some(Box::new(f));
        self
    }

    /// Inspects the first tuple emitted by the mapper, before the rest of the
    /// input is mapped
    pub fn check_map_keys(
        mut self,
        f: impl Fn(&[Value]) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.check_map_keys = Some(Arc::new(f));
        self
    }

    /// Inspects the first tuple emitted by each reduce step
    pub fn check_reduce_keys(
        mut self,
        f: impl Fn(&[Value]) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.check_reduce_keys = Some(Arc::new(f));
        self
    }

    /// Runs once, when the task is closed
    pub fn on_close(mut self, f: impl FnOnce() -> Result<()> + Send + 'static) -> Self {
        self.on_close = Some(Box::new(f));
        self
    }

    /// Post-processes the output of every run
    pub fn output<O2>(
        self,
        f: impl FnMut(Output) -> Result<O2> + Send + 'static,
    ) -> TaskBuilder<I, O2> {
        TaskBuilder {
            mapper: self.mapper,
            combiner: self.combiner,
            reducers: self.reducers,
            config: self.config,
            observer: self.observer,
            init_map: self.init_map,
            init_reduce: self.init_reduce,
            check_map_keys: self.check_map_keys,
            check_reduce_keys: self.check_reduce_keys,
            on_close: self.on_close,
            output: Box::new(f),
        }
    }

    /// Fails if the configuration is invalid
    pub fn build(self) -> Result<Task<I, O>> {
        self.config.validate()?;
        Ok(Task {
            mapper: self.mapper,
            combiner: self.combiner,
            reducers: self.reducers,
            config: self.config,
            observer: self.observer,
            init_map: self.init_map,
            init_reduce: self.init_reduce,
            check_map_keys: self.check_map_keys,
            check_reduce_keys: self.check_reduce_keys,
            on_close: self.on_close,
            output: self.output,
            closed: false,
        })
    }
}

/// A map/reduce task.
///
/// A task can be run any number of times until it is closed, either
/// explicitly with [`Task::close`], at the end of [`Task::scoped`], or when
/// dropped.
pub struct Task<I, O = Output> {
    mapper: MapFn<I>,
    combiner: Option<ReduceFn>,
    reducers: Vec<Reducer>,
    config: TaskConfig,
    observer: Box<dyn PipelineObserver>,
    init_map: Option<Hook>,
    init_reduce: Option<Hook>,
    check_map_keys: Option<KeyCheck>,
    check_reduce_keys: Option<KeyCheck>,
    on_close: Option<Box<dyn FnOnce() -> Result<()> + Send>>,
    output: Box<dyn FnMut(Output) -> Result<O> + Send>,
    closed: bool,
}

impl<I: 'static> Task<I, Output> {
    pub fn builder<F, T>(mapper: F, reducer: Reducer) -> TaskBuilder<I, Output>
    where
        F: Fn(I) -> Result<T> + Send + Sync + 'static,
        T: IntoIterator<Item = KeyTuple>,
    {
        TaskBuilder {
            mapper: Arc::new(move |item: I| Ok(mapper(item)?.into_iter().collect())),
            combiner: None,
            reducers: vec![reducer],
            config: TaskConfig::default(),
            observer: Box::new(LogObserver::new()),
            init_map: None,
            init_reduce: None,
            check_map_keys: None,
            check_reduce_keys: None,
            on_close: None,
            output: Box::new(Ok),
        }
    }
}

impl<I, O> Task<I, O> {
    pub fn config(&self) -> &TaskConfig {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Closes the task, running its `on_close` hook. Closing a closed task
    /// does nothing.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        log::debug!("Closing task");
        match self.on_close.take() {
            Some(on_close) => on_close(),
            None => Ok(()),
        }
    }

    /// Runs `f` with the task, then closes it, whether `f` succeeded or not
    pub fn scoped<R>(&mut self, f: impl FnOnce(&mut Self) -> Result<R>) -> Result<R> {
        struct CloseGuard<'a, I, O>(&'a mut Task<I, O>);

        impl<I, O> Drop for CloseGuard<'_, I, O> {
            fn drop(&mut self) {
                if let Err(e) = self.0.close() {
                    log::error!("Could not close task: {e:#}");
                }
            }
        }

        let guard = CloseGuard(self);
        let result = f(&mut *guard.0);
        let closed = guard.0.close();
        drop(guard);
        let value = result?;
        closed?;
        Ok(value)
    }
}

impl<I: Send, O> Task<I, O> {
    /// Runs the whole pipeline on `input`
    pub fn run(&mut self, input: impl IntoIterator<Item = I>) -> Result<O> {
        if self.closed {
            return Err(ClosedTaskError.into());
        }
        let layout = self.config.layout()?;
        let external = self.config.external_sorter();

        if let Some(init_map) = &mut self.init_map {
            init_map()?;
        }
        self.observer.phase_started(Phase::Map);
        let stage = map::MapStage {
            mapper: &self.mapper,
            combiner: self.combiner.as_ref(),
            check_keys: self.check_map_keys.as_ref(),
            layout,
            config: &self.config,
            external: external.as_ref(),
        };
        let mut partitions = stage.run(input, self.observer.as_mut())?;
        self.observer.phase_done(Phase::Map);
        log::debug!(
            "Map phase produced {} entries in {} partitions",
            partitions.num_entries(),
            partitions.len()
        );

        if let Some(init_reduce) = &mut self.init_reduce {
            init_reduce()?;
        }
        let mut single = true;
        for reducer in &self.reducers {
            self.observer.phase_started(Phase::Reduce);
            let stage = reduce::ReduceStage {
                reducer,
                check_keys: self.check_reduce_keys.as_ref(),
                layout,
                config: &self.config,
                external: external.as_ref(),
            };
            partitions = stage.run(partitions, self.observer.as_mut())?;
            self.observer.phase_done(Phase::Reduce);
            single = reducer.is_single();
        }

        let output = Output::from_partitions(partitions, single, self.config.sort_output())?;
        (self.output)(output)
    }
}

impl<I, O> Drop for Task<I, O> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::error!("Could not close task: {e:#}");
        }
    }
}

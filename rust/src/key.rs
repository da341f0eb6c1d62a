/*
 * Copyright (C) 2025  The Software Heritage developers
 * See the AUTHORS file at the top-level directory of this distribution
 * License: GNU General Public License version 3, or any later version
 * See top-level LICENSE file for more information
 */

//! Tagged tuples and the arity contract shared by every phase
//!
//! A mapper, combiner or reducer emits tuples shaped
//! `(p1, ..., pk, [s1, ..., sm,] value)`. The first tuple of a phase fixes
//! the [`Shape`]; every later tuple must have the same number of elements.

use std::fmt;

use anyhow::Result;

use crate::errors::{InvalidConfigurationError, KeyArityError};
use crate::value::Value;

/// A tagged tuple, as emitted by user callbacks
pub type KeyTuple = Vec<Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Map,
    Combine,
    Reduce,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Map => write!(f, "map"),
            Phase::Combine => write!(f, "combine"),
            Phase::Reduce => write!(f, "reduce"),
        }
    }
}

/// How many leading elements of a tuple are partition and sort keys
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyLayout {
    pub n_partition_keys: usize,
    pub n_sort_keys: usize,
}

impl KeyLayout {
    pub fn new(n_partition_keys: usize, n_sort_keys: usize) -> Result<Self, InvalidConfigurationError> {
        if n_partition_keys == 0 {
            return Err(InvalidConfigurationError::NoPartitionKey);
        }
        Ok(KeyLayout {
            n_partition_keys,
            n_sort_keys,
        })
    }

    /// Number of elements of a tuple carrying a sort key
    pub fn with_sort_arity(&self) -> usize {
        self.n_partition_keys + self.n_sort_keys + 1
    }

    /// Number of elements of a tuple without a sort key
    pub fn without_sort_arity(&self) -> usize {
        self.n_partition_keys + 1
    }
}

/// Which of the two tuple shapes a phase emits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    WithSort,
    WithoutSort,
}

/// A tagged tuple, split into its parts
#[derive(Debug, Clone, PartialEq)]
pub enum Emission {
    WithSort {
        partition: Value,
        sort: Value,
        value: Value,
    },
    WithoutSort {
        partition: Value,
        value: Value,
    },
}

impl Emission {
    pub fn partition(&self) -> &Value {
        match self {
            Emission::WithSort { partition, .. } | Emission::WithoutSort { partition, .. } => {
                partition
            }
        }
    }
}

/// Collapses `values` into a single key: the value itself if there is only one,
/// a [`Value::Tuple`] otherwise
fn collapse(mut values: Vec<Value>) -> Value {
    if values.len() == 1 {
        values.pop().unwrap_or_default()
    } else {
        Value::Tuple(values)
    }
}

/// Validates the arity of every tuple emitted in one phase, and splits them
/// into [`Emission`]s.
///
/// The first tuple seen fixes the shape; it is kept so sanity hooks can
/// inspect it afterwards.
///
/// ```
/// use tinymr::key::{ArityGate, Emission, KeyLayout, Phase, Shape};
/// use tinymr::{keys, Value};
///
/// let mut gate = ArityGate::new(Phase::Map, KeyLayout::new(1, 1).unwrap());
/// let emission = gate.check(keys!["k", 2, "v"]).unwrap();
/// assert_eq!(gate.shape(), Some(Shape::WithSort));
/// assert_eq!(emission.partition(), &Value::from("k"));
/// assert!(gate.check(keys!["k", "v"]).is_err());
/// ```
#[derive(Debug, Clone)]
pub struct ArityGate {
    phase: Phase,
    layout: KeyLayout,
    shape: Option<Shape>,
    first: Option<KeyTuple>,
}

impl ArityGate {
    pub fn new(phase: Phase, layout: KeyLayout) -> Self {
        ArityGate {
            phase,
            layout,
            shape: None,
            first: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// The shape fixed by the first tuple, if any tuple was seen
    pub fn shape(&self) -> Option<Shape> {
        self.shape
    }

    /// The first tuple of the phase
    pub fn first(&self) -> Option<&KeyTuple> {
        self.first.as_ref()
    }

    fn arity_error(&self, expected: usize, tuple: KeyTuple) -> KeyArityError {
        KeyArityError {
            phase: self.phase,
            expected,
            got: tuple.len(),
            tuple,
        }
    }

    fn resolve_shape(&self, len: usize) -> Option<Shape> {
        if self.layout.n_sort_keys > 0 && len == self.layout.with_sort_arity() {
            Some(Shape::WithSort)
        } else if len == self.layout.without_sort_arity() {
            Some(Shape::WithoutSort)
        } else {
            None
        }
    }

    pub fn check(&mut self, tuple: KeyTuple) -> Result<Emission, KeyArityError> {
        let shape = match self.shape {
            Some(shape) => shape,
            None => {
                let Some(shape) = self.resolve_shape(tuple.len()) else {
                    return Err(self.arity_error(self.layout.with_sort_arity(), tuple));
                };
                self.shape = Some(shape);
                self.first = Some(tuple.clone());
                shape
            }
        };
        let expected = match shape {
            Shape::WithSort => self.layout.with_sort_arity(),
            Shape::WithoutSort => self.layout.without_sort_arity(),
        };
        if tuple.len() != expected {
            return Err(self.arity_error(expected, tuple));
        }

        let mut tuple = tuple;
        let value = tuple.pop().unwrap_or_default();
        let rest = tuple.split_off(self.layout.n_partition_keys);
        let partition = collapse(tuple);
        Ok(match shape {
            Shape::WithSort => Emission::WithSort {
                partition,
                sort: collapse(rest),
                value,
            },
            Shape::WithoutSort => Emission::WithoutSort { partition, value },
        })
    }
}

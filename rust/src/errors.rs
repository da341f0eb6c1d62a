/*
 * Copyright (C) 2025  The Software Heritage developers
 * See the AUTHORS file at the top-level directory of this distribution
 * License: GNU General Public License version 3, or any later version
 * See top-level LICENSE file for more information
 */

//! Contract violations reported by the engine
//!
//! Every error here travels inside an [`anyhow::Error`]; use
//! [`anyhow::Error::downcast_ref`] to recover it.

use thiserror::Error;

use crate::key::Phase;
use crate::value::Value;

/// A tagged tuple does not have the arity sampled at the start of its phase
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{phase} emitted a tuple with {got} elements, expected {expected}: {tuple:?}")]
pub struct KeyArityError {
    pub phase: Phase,
    pub expected: usize,
    pub got: usize,
    pub tuple: Vec<Value>,
}

/// Two keys of mutually incomparable kinds were compared while sorting
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Cannot order {left:?} against {right:?}")]
pub struct UnorderableKeyError {
    pub left: Value,
    pub right: Value,
}

/// A task was invoked after being closed
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Task is closed")]
pub struct ClosedTaskError;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvalidConfigurationError {
    #[error("{name} must be at least 1, got {value}")]
    NonPositive { name: &'static str, value: usize },
    #[error("Process pools are not supported; set threaded = true to use {jobs} jobs")]
    UnsupportedPoolMode { jobs: usize },
    #[error("Tuples need at least one partition key")]
    NoPartitionKey,
    #[error("Delimiter {0:?} cannot be used in text records")]
    Delimiter(char),
}

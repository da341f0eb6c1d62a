// Copyright (C) 2025  The Software Heritage developers
// See the AUTHORS file at the top-level directory of this distribution
// License: GNU General Public License version 3, or any later version
// See top-level LICENSE file for more information

#![doc = include_str!("../README.md")]

mod value;
pub use value::Value;

pub mod config;
pub use config::TaskConfig;
pub mod errors;
pub use errors::{ClosedTaskError, InvalidConfigurationError, KeyArityError, UnorderableKeyError};
pub mod key;
pub use key::{KeyTuple, Phase};

pub mod observer;
pub mod partition;
pub mod pipeline;
pub use pipeline::{Output, Reducer, Task, Values};
pub mod pool;
pub mod serialize;
pub mod sort;

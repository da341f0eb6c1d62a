/*
 * Copyright (C) 2025  The Software Heritage developers
 * See the AUTHORS file at the top-level directory of this distribution
 * License: GNU General Public License version 3, or any later version
 * See top-level LICENSE file for more information
 */

//! On-disk record formats used for sorted runs and sorted files

use std::fmt::Debug;
use std::path::Path;

use anyhow::{Context, Result};

use crate::value::Value;

mod binary;
pub use binary::BinarySerializer;
mod json;
pub use json::JsonLinesSerializer;
mod text;
pub use text::{parse_field, TextSerializer};

/// Records read back from a file, in the order they were written
pub type RecordReader = Box<dyn Iterator<Item = Result<Value>> + Send>;

/// Writes records to a file opened by a [`Serializer`]
pub trait RecordWrite {
    fn write(&mut self, record: &Value) -> Result<()>;
    /// Flushes everything to disk. Records written without calling this may be lost.
    fn finish(self: Box<Self>) -> Result<()>;
}

/// A record format.
///
/// Every record a [`Serializer`] writes must be read back as an equal
/// [`Value`], including [`Value::OrderableNone`].
pub trait Serializer: Send + Sync + Debug {
    fn writer(&self, path: &Path) -> Result<Box<dyn RecordWrite + Send>>;
    fn reader(&self, path: &Path) -> Result<RecordReader>;

    /// Writes all `records` to a new file at `path`, and returns how many
    /// were written
    fn serialize(&self, path: &Path, records: &mut dyn Iterator<Item = Value>) -> Result<usize> {
        let mut writer = self.writer(path)?;
        let mut count = 0;
        for record in records {
            writer
                .write(&record)
                .with_context(|| format!("Could not write record to {}", path.display()))?;
            count += 1;
        }
        writer
            .finish()
            .with_context(|| format!("Could not flush to {}", path.display()))?;
        Ok(count)
    }
}

/*
 * Copyright (C) 2025  The Software Heritage developers
 * See the AUTHORS file at the top-level directory of this distribution
 * License: GNU General Public License version 3, or any later version
 * See top-level LICENSE file for more information
 */

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{ensure, Context, Result};

use super::{RecordReader, RecordWrite, Serializer};
use crate::value::Value;

/// Newline-delimited JSON, one record per line.
///
/// Records keep their kind, eg. `{"Tuple":[{"Str":"key"},{"Int":3}]}`, so
/// strings that look like numbers read back as strings. JSON has no NaN or
/// infinity, so records containing them cannot be written.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonLinesSerializer;

fn is_finite(value: &Value) -> bool {
    match value {
        Value::Float(f) => f.is_finite(),
        Value::Tuple(fields) => fields.iter().all(is_finite),
        _ => true,
    }
}

struct JsonLinesWriter {
    path: PathBuf,
    out: BufWriter<File>,
}

impl RecordWrite for JsonLinesWriter {
    fn write(&mut self, record: &Value) -> Result<()> {
        ensure!(
            is_finite(record),
            "{record:?} cannot be written as JSON, it holds a non-finite float"
        );
        serde_json::to_writer(&mut self.out, record)
            .with_context(|| format!("Could not write record to {}", self.path.display()))?;
        self.out
            .write_all(b"\n")
            .with_context(|| format!("Could not write record to {}", self.path.display()))
    }

    fn finish(self: Box<Self>) -> Result<()> {
        let JsonLinesWriter { path, out } = *self;
        out.into_inner()
            .with_context(|| format!("Could not flush to {}", path.display()))?
            .sync_all()
            .with_context(|| format!("Could not sync {}", path.display()))
    }
}

impl Serializer for JsonLinesSerializer {
    fn writer(&self, path: &Path) -> Result<Box<dyn RecordWrite + Send>> {
        let file = File::create(path)
            .with_context(|| format!("Could not create {}", path.display()))?;
        Ok(Box::new(JsonLinesWriter {
            path: path.to_owned(),
            out: BufWriter::new(file),
        }))
    }

    fn reader(&self, path: &Path) -> Result<RecordReader> {
        let file =
            File::open(path).with_context(|| format!("Could not open {}", path.display()))?;
        let path = path.to_owned();
        let records = serde_json::Deserializer::from_reader(BufReader::new(file))
            .into_iter::<Value>()
            .map(move |record| {
                record.with_context(|| format!("Could not decode record from {}", path.display()))
            });
        Ok(Box::new(records))
    }
}

/*
 * Copyright (C) 2025  The Software Heritage developers
 * See the AUTHORS file at the top-level directory of this distribution
 * License: GNU General Public License version 3, or any later version
 * See top-level LICENSE file for more information
 */

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::mem;
use std::path::{Path, PathBuf};

use anyhow::{bail, ensure, Context, Result};

use super::{RecordReader, RecordWrite, Serializer};
use crate::errors::InvalidConfigurationError;
use crate::value::Value;

/// Delimited text records, one per line.
///
/// A [`Value::Tuple`] is written as one field per element; any other value
/// as a single field. Fields are read back through [`parse_field`], so
/// writing fails for values that would come back different: strings that
/// look like a number or a keyword (eg. `"12"` or `"none"`), non-finite
/// floats, and tuples of fewer than two elements.
#[derive(Debug, Clone, Copy)]
pub struct TextSerializer {
    delimiter: char,
}

impl Default for TextSerializer {
    fn default() -> Self {
        TextSerializer { delimiter: '\t' }
    }
}

impl TextSerializer {
    pub fn new(delimiter: char) -> Result<Self, InvalidConfigurationError> {
        if delimiter == '\n' || delimiter == '\r' {
            return Err(InvalidConfigurationError::Delimiter(delimiter));
        }
        Ok(TextSerializer { delimiter })
    }

    pub fn delimiter(&self) -> char {
        self.delimiter
    }

    /// Formats one field, failing unless [`parse_field`] reads it back as the
    /// same value of the same kind
    fn format_field(&self, field: &Value) -> Result<String> {
        let text = match field {
            Value::None => "none".to_owned(),
            Value::OrderableNone => "orderablenone".to_owned(),
            Value::Bool(b) => b.to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => format!("{f:?}"),
            Value::Str(s) => {
                if s.contains(self.delimiter) || s.contains(['\n', '\r']) {
                    bail!("{s:?} cannot be written as a text field");
                }
                s.clone()
            }
            Value::Tuple(_) => bail!("Nested tuples cannot be written as text: {field}"),
        };
        let parsed = parse_field(&text);
        ensure!(
            mem::discriminant(&parsed) == mem::discriminant(field) && parsed == *field,
            "{field:?} cannot be written as text, it would be read back as {parsed:?}"
        );
        Ok(text)
    }

    /// Parses one line into a record
    pub fn parse_line(&self, line: &str) -> Value {
        let mut fields: Vec<Value> = line.split(self.delimiter).map(parse_field).collect();
        if fields.len() == 1 {
            fields.pop().unwrap_or_default()
        } else {
            Value::Tuple(fields)
        }
    }
}

struct TextWriter {
    path: PathBuf,
    serializer: TextSerializer,
    out: BufWriter<File>,
}

impl RecordWrite for TextWriter {
    fn write(&mut self, record: &Value) -> Result<()> {
        let fields = match record {
            Value::Tuple(fields) if fields.len() < 2 => {
                bail!("Tuples of fewer than 2 elements cannot be written as text: {record:?}")
            }
            Value::Tuple(fields) => fields.as_slice(),
            _ => std::slice::from_ref(record),
        };
        let mut line = String::new();
        for (i, field) in fields.iter().enumerate() {
            if i > 0 {
                line.push(self.serializer.delimiter);
            }
            line.push_str(&self.serializer.format_field(field)?);
        }
        line.push('\n');
        self.out
            .write_all(line.as_bytes())
            .with_context(|| format!("Could not write record to {}", self.path.display()))
    }

    fn finish(self: Box<Self>) -> Result<()> {
        let TextWriter { path, out, .. } = *self;
        out.into_inner()
            .with_context(|| format!("Could not flush to {}", path.display()))?
            .sync_all()
            .with_context(|| format!("Could not sync {}", path.display()))
    }
}

impl Serializer for TextSerializer {
    fn writer(&self, path: &Path) -> Result<Box<dyn RecordWrite + Send>> {
        let file = File::create(path)
            .with_context(|| format!("Could not create {}", path.display()))?;
        Ok(Box::new(TextWriter {
            path: path.to_owned(),
            serializer: *self,
            out: BufWriter::new(file),
        }))
    }

    fn reader(&self, path: &Path) -> Result<RecordReader> {
        let file =
            File::open(path).with_context(|| format!("Could not open {}", path.display()))?;
        let serializer = *self;
        let path = path.to_owned();
        Ok(Box::new(BufReader::new(file).lines().map(move |line| {
            let line =
                line.with_context(|| format!("Could not read line from {}", path.display()))?;
            Ok(serializer.parse_line(&line))
        })))
    }
}

/// Whether `digits` is a non-empty run of ASCII digits without leading zero
/// (`"0"` itself is allowed)
fn is_canonical_integer(digits: &str) -> bool {
    !digits.is_empty()
        && digits.bytes().all(|b| b.is_ascii_digit())
        && (digits == "0" || !digits.starts_with('0'))
}

/// Converts a text field to the most specific [`Value`] it spells.
///
/// Signed numbers and fractions are typed too (`"-3"`, `"0.5"`), so every
/// finite `Int` and `Float` the text writer emits reads back as itself.
/// Integers with a leading zero stay strings.
///
/// ```
/// use tinymr::serialize::parse_field;
/// use tinymr::Value;
///
/// assert_eq!(parse_field("42"), Value::Int(42));
/// assert_eq!(parse_field("-3"), Value::Int(-3));
/// assert_eq!(parse_field("007"), Value::from("007"));
/// assert_eq!(parse_field("2.5"), Value::Float(2.5));
/// assert_eq!(parse_field("TRUE"), Value::Bool(true));
/// assert!(parse_field("None").is_none());
/// assert_eq!(parse_field("orderablenone"), Value::OrderableNone);
/// assert_eq!(parse_field("word"), Value::from("word"));
/// ```
pub fn parse_field(field: &str) -> Value {
    let unsigned = field.strip_prefix('-').unwrap_or(field);
    if is_canonical_integer(unsigned) {
        if let Ok(i) = field.parse::<i64>() {
            return Value::Int(i);
        }
    }

    let integral_part = unsigned
        .split(['.', 'e', 'E'])
        .next()
        .unwrap_or_default();
    if unsigned.contains(['.', 'e', 'E']) && is_canonical_integer(integral_part) {
        if let Ok(f) = field.parse::<f64>() {
            return Value::Float(f);
        }
    }

    match field.to_ascii_lowercase().as_str() {
        "none" => Value::None,
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        "orderablenone" => Value::OrderableNone,
        _ => Value::Str(field.to_owned()),
    }
}

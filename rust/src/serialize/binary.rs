/*
 * Copyright (C) 2025  The Software Heritage developers
 * See the AUTHORS file at the top-level directory of this distribution
 * License: GNU General Public License version 3, or any later version
 * See top-level LICENSE file for more information
 */

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, ensure, Context, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use super::{RecordReader, RecordWrite, Serializer};
use crate::value::Value;

/// Marks the end of a file, in place of a record length
const END_OF_FILE: u32 = u32::MAX;

/// Compressed binary records.
///
/// A file is a zstd stream of records, each written as its length (`u32`,
/// little-endian) followed by its bincode encoding, and terminated by
/// `u32::MAX`. A file missing its terminator is reported as truncated.
#[derive(Debug, Clone, Copy)]
pub struct BinarySerializer {
    pub compression_level: i32,
}

impl Default for BinarySerializer {
    fn default() -> Self {
        BinarySerializer {
            compression_level: 3,
        }
    }
}

struct BinaryWriter {
    path: PathBuf,
    encoder: zstd::stream::write::Encoder<'static, File>,
}

impl RecordWrite for BinaryWriter {
    fn write(&mut self, record: &Value) -> Result<()> {
        let bytes = bincode::serialize(record).context("Could not encode record")?;
        let len: u32 = bytes
            .len()
            .try_into()
            .context("Record is 2^32 bytes or longer")?;
        ensure!(len != END_OF_FILE, "Record is 2^32 - 1 bytes long");
        self.encoder
            .write_u32::<LittleEndian>(len)
            .with_context(|| format!("Could not write record to {}", self.path.display()))?;
        self.encoder
            .write_all(&bytes)
            .with_context(|| format!("Could not write record to {}", self.path.display()))?;
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<()> {
        let BinaryWriter { path, mut encoder } = *self;
        encoder
            .write_u32::<LittleEndian>(END_OF_FILE)
            .with_context(|| format!("Could not write to {}", path.display()))?;
        encoder
            .finish()
            .with_context(|| format!("Could not flush to {}", path.display()))?
            .sync_all()
            .with_context(|| format!("Could not sync {}", path.display()))?;
        Ok(())
    }
}

fn read_record(decoder: &mut impl Read, path: &Path) -> Result<Option<Value>> {
    let len = match decoder.read_u32::<LittleEndian>() {
        Ok(len) => len,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            bail!("{} is truncated", path.display())
        }
        Err(e) => {
            return Err(e).with_context(|| format!("Could not read record size from {}", path.display()))
        }
    };
    if len == END_OF_FILE {
        return Ok(None);
    }
    let mut bytes = vec![0u8; len as usize];
    decoder
        .read_exact(&mut bytes)
        .with_context(|| format!("Could not read record from {}", path.display()))?;
    let record = bincode::deserialize(&bytes)
        .with_context(|| format!("Could not decode record from {}", path.display()))?;
    Ok(Some(record))
}

impl Serializer for BinarySerializer {
    fn writer(&self, path: &Path) -> Result<Box<dyn RecordWrite + Send>> {
        let file = File::create(path)
            .with_context(|| format!("Could not create {}", path.display()))?;
        let encoder = zstd::stream::write::Encoder::new(file, self.compression_level)
            .with_context(|| format!("Could not create ZSTD encoder for {}", path.display()))?;
        Ok(Box::new(BinaryWriter {
            path: path.to_owned(),
            encoder,
        }))
    }

    fn reader(&self, path: &Path) -> Result<RecordReader> {
        let file =
            File::open(path).with_context(|| format!("Could not open {}", path.display()))?;
        let mut decoder = zstd::stream::read::Decoder::new(file)
            .with_context(|| format!("Could not decompress {}", path.display()))?;
        let path = path.to_owned();
        let mut done = false;
        Ok(Box::new(std::iter::from_fn(move || {
            if done {
                return None;
            }
            match read_record(&mut decoder, &path) {
                Ok(Some(record)) => Some(Ok(record)),
                Ok(None) => {
                    done = true;
                    None
                }
                Err(e) => {
                    done = true;
                    Some(Err(e))
                }
            }
        })))
    }
}

// Copyright (C) 2025  The Software Heritage developers
// See the AUTHORS file at the top-level directory of this distribution
// License: GNU General Public License version 3, or any later version
// See top-level LICENSE file for more information

//! Tasks behind the `tinymr` command

use std::fs::File;
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use dsi_progress_logger::{progress_logger, ProgressLog};

use tinymr::serialize::{Serializer, TextSerializer};
use tinymr::sort::external::ExternalSorter;
use tinymr::{keys, KeyTuple, Reducer, Task, TaskConfig, Value};

/// The current version of tinymr-cli.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Lines of all `paths`, one file after the other
pub fn read_lines(paths: &[PathBuf]) -> Result<impl Iterator<Item = io::Result<String>>> {
    let files = paths
        .iter()
        .map(|path| {
            File::open(path).with_context(|| format!("Could not open {}", path.display()))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(files
        .into_iter()
        .flat_map(|file| BufReader::new(file).lines()))
}

fn split_words(line: io::Result<String>) -> Result<Vec<KeyTuple>> {
    let line = line.context("Could not read line")?;
    Ok(line.split_whitespace().map(|word| keys![word, 1]).collect())
}

fn sum_counts(word: &Value, counts: Vec<Value>) -> Result<KeyTuple> {
    Ok(keys![word, counts.iter().filter_map(Value::as_int).sum::<i64>()])
}

/// Counts whitespace-separated words, returned in lexicographic order
pub fn wordcount_task(
    config: TaskConfig,
    combine: bool,
) -> Result<Task<io::Result<String>, Vec<(String, i64)>>> {
    let pl = progress_logger!(item_name = "line", display_memory = true);
    let mut builder = Task::builder(split_words, Reducer::single(sum_counts));
    if combine {
        builder = builder.combiner(|word: &Value, counts: Vec<Value>| {
            Ok(vec![sum_counts(word, counts)?])
        });
    }
    builder
        .config(config)
        .observer(pl)
        .output(|output| {
            output
                .into_iter()
                .map(|(word, count)| -> Result<(String, i64)> {
                    let count = count
                        .one()
                        .and_then(Value::as_int)
                        .with_context(|| format!("No count for {word}"))?;
                    Ok((word.to_string(), count))
                })
                .collect()
        })
        .build()
}

/// Writes `word<TAB>count` lines
pub fn write_counts(mut out: impl Write, counts: &[(String, i64)]) -> Result<()> {
    for (word, count) in counts {
        writeln!(out, "{word}\t{count}").context("Could not write word count")?;
    }
    out.flush().context("Could not flush word counts")
}

/// Sorts the records of delimited text files into `output`, and returns how
/// many were written
pub fn sort_text_files(
    paths: &[PathBuf],
    output: &Path,
    sorter: &ExternalSorter,
    serializer: TextSerializer,
) -> Result<usize> {
    let sorted = sorter.sort_files(paths, &serializer)?;

    let mut pl = progress_logger!(item_name = "record", display_memory = true);
    pl.start(format!("Writing sorted records to {}", output.display()));
    let mut writer = serializer.writer(output)?;
    let mut count = 0;
    for record in sorted {
        writer.write(&record?)?;
        count += 1;
        pl.light_update();
    }
    writer.finish()?;
    pl.done();
    Ok(count)
}

// Copyright (C) 2025  The Software Heritage developers
// See the AUTHORS file at the top-level directory of this distribution
// License: GNU General Public License version 3, or any later version
// See top-level LICENSE file for more information

use std::io::BufWriter;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use tinymr::serialize::TextSerializer;
use tinymr::sort::external::{ExternalSorter, DEFAULT_CHUNKSIZE};
use tinymr::TaskConfig;
use tinymr_cli::{read_lines, sort_text_files, wordcount_task, write_counts};

#[derive(Parser, Debug)]
#[command(version = tinymr_cli::VERSION)]
/// Map/reduce and external sorting of text files
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Counts words of the given files, and prints them with their count
    Wordcount {
        #[arg(required = true)]
        files: Vec<PathBuf>,
        #[arg(short, long, default_value_t = num_cpus::get())]
        jobs: usize,
        #[arg(long, default_value_t = 1000)]
        /// Number of lines handed to each worker at once
        chunksize: usize,
        #[arg(long)]
        /// Pre-reduces counts in each worker
        combine: bool,
    },
    /// Sorts the lines of delimited text files, field by field
    Sort {
        #[arg(required = true)]
        files: Vec<PathBuf>,
        #[arg(short, long)]
        output: PathBuf,
        #[arg(long, default_value_t = DEFAULT_CHUNKSIZE)]
        /// Number of records sorted in memory and written to each temporary file
        chunksize: usize,
        #[arg(short, long, default_value_t = num_cpus::get())]
        jobs: usize,
        #[arg(short, long)]
        reverse: bool,
        #[arg(short, long, default_value_t = '\t')]
        delimiter: char,
        #[arg(long)]
        /// Where to create temporary files, instead of the system's default
        temp_dir: Option<PathBuf>,
    },
}

pub fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match args.command {
        Commands::Wordcount {
            files,
            jobs,
            chunksize,
            combine,
        } => {
            let config = TaskConfig {
                jobs,
                chunksize,
                ..Default::default()
            };
            let mut task = wordcount_task(config, combine)?;
            let counts = task.scoped(|task| task.run(read_lines(&files)?))?;
            log::info!("Found {} distinct words", counts.len());
            write_counts(BufWriter::new(std::io::stdout().lock()), &counts)
        }
        Commands::Sort {
            files,
            output,
            chunksize,
            jobs,
            reverse,
            delimiter,
            temp_dir,
        } => {
            let serializer = TextSerializer::new(delimiter)?;
            let mut sorter = ExternalSorter::new()
                .with_chunksize(chunksize)
                .with_jobs(jobs)
                .with_reverse(reverse)
                .with_serializer(serializer);
            if let Some(temp_dir) = temp_dir {
                sorter = sorter.with_temp_dir(temp_dir);
            }
            let count = sort_text_files(&files, &output, &sorter, serializer)
                .with_context(|| format!("Could not sort into {}", output.display()))?;
            log::info!("Wrote {} records to {}", count, output.display());
            Ok(())
        }
    }
}

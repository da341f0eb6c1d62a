// Copyright (C) 2025  The Software Heritage developers
// See the AUTHORS file at the top-level directory of this distribution
// License: GNU General Public License version 3, or any later version
// See top-level LICENSE file for more information

//! Progress reporting for pipeline runs
//!
//! An observer is handed to a [`Task`](crate::pipeline::Task) when it is built
//! and only sees that task's runs.

use std::time::Instant;

use dsi_progress_logger::ProgressLog;

use crate::key::Phase;

/// Receives phase boundaries and item counts from a running pipeline.
///
/// Counts are reported from the orchestrating thread only, once per
/// completed shard.
pub trait PipelineObserver: Send {
    fn phase_started(&mut self, phase: Phase);
    /// `count` more items went through `phase`
    fn items_processed(&mut self, phase: Phase, count: usize);
    fn phase_done(&mut self, phase: Phase);
}

impl<T: ProgressLog + Send> PipelineObserver for T {
    fn phase_started(&mut self, phase: Phase) {
        self.start(format!("Running {phase} phase..."));
    }
    fn items_processed(&mut self, _phase: Phase, count: usize) {
        self.update_with_count(count);
    }
    fn phase_done(&mut self, _phase: Phase) {
        self.done();
    }
}

/// Logs phases and their duration with [`log`]
#[derive(Debug, Default)]
pub struct LogObserver {
    started: Option<(Phase, Instant)>,
    count: usize,
}

impl LogObserver {
    pub fn new() -> Self {
        LogObserver::default()
    }
}

impl PipelineObserver for LogObserver {
    fn phase_started(&mut self, phase: Phase) {
        log::info!("Starting {phase} phase");
        self.started = Some((phase, Instant::now()));
        self.count = 0;
    }
    fn items_processed(&mut self, phase: Phase, count: usize) {
        self.count += count;
        log::debug!("{phase}: {} items processed", self.count);
    }
    fn phase_done(&mut self, phase: Phase) {
        match self.started.take() {
            Some((started_phase, start)) if started_phase == phase => log::info!(
                "Finished {phase} phase: {} items in {:.2?}",
                self.count,
                start.elapsed()
            ),
            _ => log::info!("Finished {phase} phase"),
        }
    }
}

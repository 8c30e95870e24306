// Copyright (c) 2024-present, tarmac-index
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use std::path::Path;

/// Outcome of checking whether an index needs rebuilding.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IndexUpdateCheck {
    /// No rebuild needed.
    Ok,
    /// Rebuild needed: index not present.
    Missing,
    /// Rebuild needed: index older than the trace file.
    TooOld,
    /// Rebuild needed: index has the wrong file format.
    WrongFormat,
    /// Rebuild needed: the previous indexing run did not finish.
    Incomplete,
    /// Rebuild explicitly requested.
    Forced,
    /// Index is being built in memory, not on disk.
    InMemory,
}

/// Diagnostics sink for indexing and querying.
///
/// Front-ends differ in where diagnostics can go (stderr, a progress-bar
/// dialog, a log file), so everything user-visible flows through this
/// capability, passed explicitly to whoever needs it. Fatal conditions are
/// `Result`s, not callbacks.
pub trait Reporter {
    /// Announces the outcome of an index freshness check.
    fn indexing_status(&self, index_file: &Path, trace_file: &Path, status: IndexUpdateCheck) {
        let _ = (index_file, trace_file, status);
    }

    /// A warning tied to a trace-file line (e.g. a parse problem the
    /// indexer can recover from).
    fn indexing_warning(&self, trace_file: &Path, lineno: u64, msg: &str) {
        let _ = (trace_file, lineno, msg);
    }

    /// A fatal problem tied to a trace-file line. Indexing stops after
    /// this; the failure also comes back to the caller as an error.
    fn indexing_error(&self, trace_file: &Path, lineno: u64, msg: &str) {
        let _ = (trace_file, lineno, msg);
    }

    /// Indexing is starting; `total` is the trace length in bytes.
    fn indexing_start(&self, total: u64) {
        let _ = total;
    }

    /// Byte position progress during indexing. Must not re-enter the
    /// indexer.
    fn indexing_progress(&self, pos: u64) {
        let _ = pos;
    }

    /// Indexing finished (successfully or not).
    fn indexing_done(&self) {}
}

/// Routes all diagnostics through the `log` facade.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogReporter;

impl Reporter for LogReporter {
    fn indexing_status(&self, index_file: &Path, trace_file: &Path, status: IndexUpdateCheck) {
        log::info!(
            "index {:?} for trace {:?}: {:?}",
            index_file,
            trace_file,
            status
        );
    }

    fn indexing_warning(&self, trace_file: &Path, lineno: u64, msg: &str) {
        log::warn!("{}:{}: {}", trace_file.display(), lineno, msg);
    }

    fn indexing_error(&self, trace_file: &Path, lineno: u64, msg: &str) {
        log::error!("{}:{}: {}", trace_file.display(), lineno, msg);
    }

    fn indexing_start(&self, total: u64) {
        log::debug!("indexing {total} bytes");
    }

    fn indexing_progress(&self, _pos: u64) {}

    fn indexing_done(&self) {
        log::debug!("indexing done");
    }
}

/// Swallows everything. Useful in tests and embedding contexts.
#[derive(Clone, Copy, Debug, Default)]
pub struct SilentReporter;

impl Reporter for SilentReporter {}

// Copyright (c) 2024-present, tarmac-index
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Deciding whether an index is usable, and rebuilding it when not.

use crate::arena::Arena;
use crate::format::{check_magic, FileHeader, FLAG_COMPLETE, MAGIC_LEN};
use crate::indexer::{build_in_memory_index, run_indexer, IndexParams, TracePair};
use crate::reporter::{IndexUpdateCheck, Reporter};
use crate::Result;
use std::fs::File;
use std::path::Path;

/// What a quick look at an index file's header reveals.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IndexHeaderState {
    Ok,
    WrongFormat,
    Incomplete,
}

/// Validates the magic number, version and completion flag of an index
/// file without opening the trace.
pub fn check_index_header(index_filename: &Path) -> std::io::Result<IndexHeaderState> {
    let file = File::open(index_filename)?;
    let arena = Arena::open_readonly(file)?;

    if check_magic(&arena).is_err() {
        return Ok(IndexHeaderState::WrongFormat);
    }

    let header: FileHeader = arena.get(MAGIC_LEN as u64)?;
    if header.flags & FLAG_COMPLETE == 0 {
        return Ok(IndexHeaderState::Incomplete);
    }

    Ok(IndexHeaderState::Ok)
}

/// Options for [`update_index`].
#[derive(Clone, Copy, Debug, Default)]
pub struct UpdateOptions {
    /// Rebuild even if the index looks fine.
    pub force: bool,
    /// Build in memory instead of touching the index file.
    pub in_memory: bool,
    pub params: IndexParams,
}

/// Ensures `trace.index_filename` is a usable index for the trace,
/// rebuilding it if it is missing, stale, malformed or incomplete.
///
/// With `in_memory` set, the on-disk index is ignored entirely and the
/// freshly built arena is returned instead.
pub fn update_index(
    trace: &TracePair,
    opts: &UpdateOptions,
    reporter: &dyn Reporter,
) -> Result<Option<Arena>> {
    if opts.in_memory {
        reporter.indexing_status(
            &trace.index_filename,
            &trace.tarmac_filename,
            IndexUpdateCheck::InMemory,
        );
        let arena = build_in_memory_index(&trace.tarmac_filename, opts.params, reporter)?;
        return Ok(Some(arena));
    }

    let status = if opts.force {
        IndexUpdateCheck::Forced
    } else {
        freshness(trace)?
    };

    reporter.indexing_status(&trace.index_filename, &trace.tarmac_filename, status);

    if status != IndexUpdateCheck::Ok {
        run_indexer(trace, opts.params, reporter)?;
    }
    Ok(None)
}

fn freshness(trace: &TracePair) -> Result<IndexUpdateCheck> {
    let index_meta = match std::fs::metadata(&trace.index_filename) {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(IndexUpdateCheck::Missing);
        }
        Err(e) => return Err(e.into()),
    };

    let trace_meta = std::fs::metadata(&trace.tarmac_filename)?;
    if let (Ok(index_time), Ok(trace_time)) = (index_meta.modified(), trace_meta.modified()) {
        if index_time < trace_time {
            return Ok(IndexUpdateCheck::TooOld);
        }
    }

    Ok(match check_index_header(&trace.index_filename)? {
        IndexHeaderState::Ok => IndexUpdateCheck::Ok,
        IndexHeaderState::WrongFormat => IndexUpdateCheck::WrongFormat,
        IndexHeaderState::Incomplete => IndexUpdateCheck::Incomplete,
    })
}

// Copyright (c) 2024-present, tarmac-index
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Indexing and navigation engine for Tarmac CPU trace files.
//!
//! Tarmac traces are text files, one line per event, and routinely run to
//! gigabytes. This crate builds a persistent on-disk index over such a
//! trace once, then answers navigation queries against it in logarithmic
//! time and bounded memory: seek by time, by trace line, or by program
//! counter; read any register or memory address as of any point in the
//! trace; and translate line numbers under folded-away function calls.
//!
//! The index is a single append-only file holding several AVL trees that
//! share one arena. Tree updates above a commit watermark are
//! copy-on-write, which is how every per-timestamp memory snapshot stays
//! readable forever at the cost of one rewritten spine per update.
//!
//! # Example usage
//!
//! ```no_run
//! use tarmac_index::{
//!     run_indexer, FoldedView, IndexParams, IndexReader, LogReporter, TracePair,
//! };
//!
//! let trace = TracePair::for_trace("trace.tarmac".into());
//! run_indexer(&trace, IndexParams::default(), &LogReporter)?;
//!
//! let index = IndexReader::open(&trace)?;
//!
//! // Where was the program at time 10000?
//! if let Some(node) = index.node_at_time(10_000)? {
//!     println!("pc = {:#x} at line {}", node.pc, node.trace_file_firstline);
//!
//!     // What was in r0 just after that?
//!     let r0 = tarmac_index::registers::REG_32_R0;
//!     if let Some(value) = index.get_reg_value(node.memory_root, &r0)? {
//!         println!("r0 = {value:#x}");
//!     }
//! }
//!
//! // Fold-aware line numbering starts from a view.
//! let view = FoldedView::new(&index)?;
//! println!("{} lines visible", view.total_visible_lines());
//! #
//! # Ok::<(), tarmac_index::Error>(())
//! ```

#![forbid(unsafe_code)]
#![deny(clippy::all, clippy::cargo)]
#![warn(missing_docs)]
#![deny(clippy::unwrap_used)]
#![warn(clippy::pedantic, clippy::nursery)]
#![warn(clippy::expect_used)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::option_if_let_else)]

pub mod arena;

#[doc(hidden)]
pub mod avl;

#[doc(hidden)]
pub mod coding;

mod error;

pub mod expr;

mod fold;

#[doc(hidden)]
pub mod format;

mod image;
mod indexer;

#[doc(hidden)]
pub mod memtree;

pub mod navigator;

mod rebuild;

pub mod registers;

mod reporter;

pub mod parser;

pub use {
    arena::{Arena, Offset},
    error::{Error, Result},
    fold::{FoldStateAnnotation, FoldStatePayload, FoldedView},
    format::{
        ByPCPayload, FileHeader, MemoryPayload, MemorySubPayload, SeqOrderPayload,
        KNOWN_INVALID_PC, MEM_TYPE_MEMORY, MEM_TYPE_REGISTER,
    },
    image::{EmptyImage, ImageLookup},
    indexer::{build_in_memory_index, run_indexer, IndexParams, TracePair},
    navigator::{IndexReader, Navigator},
    parser::{ParseParams, TarmacLineParser, Time},
    rebuild::{check_index_header, update_index, IndexHeaderState, UpdateOptions},
    reporter::{IndexUpdateCheck, LogReporter, Reporter, SilentReporter},
};

// Copyright (c) 2024-present, tarmac-index
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Per-view fold state: which call-depth windows are visible where.
//!
//! A view's fold state is a set of non-overlapping regions that tile the
//! physical line range; every physical line belongs to exactly one region.
//! Each region restricts which call depths are shown inside it, and caches
//! its own physical and visible line counts so the rank searches below can
//! translate between the two numbering systems without touching the index
//! for untouched regions.

use crate::memtree::{AvlMem, MemAnnotation, MemPayload, MemSearchStep};
use crate::navigator::IndexReader;
use crate::format::SeqOrderPayload;
use std::cmp::Ordering;
use std::io;

/// One fold region: a physical line range plus a visible depth window.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FoldStatePayload {
    pub first_physical_line: u32,
    pub last_physical_line: u32,
    /// What the first visible line of this region would be if the entire
    /// buffer were at this depth window; an anchor usable directly with
    /// the index's line translation.
    pub first_quasivis_line: u32,
    pub mindepth: u32,
    pub maxdepth: u32,
    pub n_physical_lines: u32,
    pub n_visible_lines: u32,
}

impl MemPayload for FoldStatePayload {
    fn cmp_payload(&self, other: &Self) -> Ordering {
        if self.last_physical_line < other.first_physical_line {
            Ordering::Less
        } else if self.first_physical_line > other.last_physical_line {
            Ordering::Greater
        } else {
            Ordering::Equal
        }
    }
}

/// Subtree totals of both line counts, for rank searches.
#[derive(Clone, Debug, Default)]
pub struct FoldStateAnnotation {
    pub n_physical_lines: u32,
    pub n_visible_lines: u32,
}

impl MemAnnotation<FoldStatePayload> for FoldStateAnnotation {
    fn from_payload(payload: &FoldStatePayload) -> Self {
        Self {
            n_physical_lines: payload.n_physical_lines,
            n_visible_lines: payload.n_visible_lines,
        }
    }

    fn combine(lhs: &Self, rhs: &Self) -> Self {
        Self {
            n_physical_lines: lhs.n_physical_lines + rhs.n_physical_lines,
            n_visible_lines: lhs.n_visible_lines + rhs.n_visible_lines,
        }
    }
}

fn out_of_range() -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, "line offset beyond end of trace")
}

/// A fold-aware view over one index.
pub struct FoldedView<'a> {
    index: &'a IndexReader,
    fold_states: AvlMem<FoldStatePayload, FoldStateAnnotation>,
}

impl<'a> FoldedView<'a> {
    /// Creates a view with everything visible: a single region covering
    /// the whole file with an unbounded depth window.
    pub fn new(index: &'a IndexReader) -> io::Result<Self> {
        let mut view = Self {
            index,
            fold_states: AvlMem::new(),
        };
        if let Some(last) = index.find_buffer_limit(true)? {
            view.set_fold_state(
                1,
                last.trace_file_firstline + last.trace_file_lines - 1,
                0,
                u32::MAX,
            )?;
        }
        Ok(view)
    }

    fn translate(&self, line: u32, mindepth: u32, maxdepth: u32) -> io::Result<u32> {
        self.index
            .lrt_translate_may_fail(line, 0, u32::MAX, mindepth, maxdepth)?
            .ok_or_else(out_of_range)
    }

    fn translate_range(
        &self,
        linestart: u32,
        lineend: u32,
        mindepth_in: u32,
        maxdepth_in: u32,
        mindepth_out: u32,
        maxdepth_out: u32,
    ) -> io::Result<u32> {
        self.index
            .lrt_translate_range(
                linestart,
                lineend,
                mindepth_in,
                maxdepth_in,
                mindepth_out,
                maxdepth_out,
            )?
            .ok_or_else(out_of_range)
    }

    /// Applies the depth window `[mindepth, maxdepth)` to the physical
    /// line range `firstline..=lastline`.
    ///
    /// Any existing region overlapping the range is removed; parts of it
    /// outside the range are clipped and reinserted with recomputed line
    /// counts, so the tiling invariant survives.
    pub fn set_fold_state(
        &mut self,
        firstline: u32,
        lastline: u32,
        mindepth: u32,
        maxdepth: u32,
    ) -> io::Result<()> {
        let first_quasivis_line = self.translate(firstline - 1, mindepth, maxdepth)?;
        let fsp = FoldStatePayload {
            first_physical_line: firstline,
            last_physical_line: lastline,
            first_quasivis_line,
            mindepth,
            maxdepth,
            n_physical_lines: lastline - firstline + 1,
            n_visible_lines: self.translate(lastline, mindepth, maxdepth)? - first_quasivis_line,
        };

        while let Some(found) = self.fold_states.remove_matching(&fsp) {
            if found.first_physical_line < fsp.first_physical_line {
                let mut part = found.clone();
                part.last_physical_line = fsp.first_physical_line - 1;
                part.n_physical_lines =
                    part.last_physical_line - part.first_physical_line + 1;
                part.n_visible_lines = self.translate_range(
                    part.first_physical_line - 1,
                    part.last_physical_line,
                    0,
                    u32::MAX,
                    part.mindepth,
                    part.maxdepth,
                )?;
                self.fold_states.insert(part);
            }
            if found.last_physical_line > fsp.last_physical_line {
                let mut part = found;
                part.first_physical_line = fsp.last_physical_line + 1;
                part.n_physical_lines =
                    part.last_physical_line - part.first_physical_line + 1;
                let first_quasivis_line_after = part.first_quasivis_line + part.n_visible_lines;
                part.n_visible_lines = self.translate_range(
                    part.first_physical_line - 1,
                    part.last_physical_line,
                    0,
                    u32::MAX,
                    part.mindepth,
                    part.maxdepth,
                )?;
                part.first_quasivis_line = first_quasivis_line_after - part.n_visible_lines;
                self.fold_states.insert(part);
            }
        }

        self.fold_states.insert(fsp);
        Ok(())
    }

    /// Maps a 0-based visible line to its 1-based physical line.
    pub fn visible_to_physical_line(&self, visline: u32) -> io::Result<Option<u32>> {
        let mut target = visline;
        let mut vislines_before = 0u32;
        let mut physlines_before = 0u32;

        let found = self.fold_states.search(|lhs, here, rhs| {
            if let Some(lhs) = lhs {
                if target < lhs.n_visible_lines {
                    return MemSearchStep::Left;
                }
                target -= lhs.n_visible_lines;
                vislines_before += lhs.n_visible_lines;
                physlines_before += lhs.n_physical_lines;
            }
            if target < here.n_visible_lines || (target == here.n_visible_lines && rhs.is_none())
            {
                return MemSearchStep::Stop;
            }
            target -= here.n_visible_lines;
            vislines_before += here.n_visible_lines;
            physlines_before += here.n_physical_lines;
            if let Some(rhs) = rhs {
                if target <= rhs.n_visible_lines {
                    return MemSearchStep::Right;
                }
                target -= rhs.n_visible_lines;
                vislines_before += rhs.n_visible_lines;
                physlines_before += rhs.n_physical_lines;
            }
            MemSearchStep::Abort
        });

        let Some(fsp) = found.cloned() else {
            return Ok(None);
        };

        let within = self.index.lrt_translate_range(
            fsp.first_quasivis_line,
            fsp.first_quasivis_line + visline - vislines_before,
            fsp.mindepth,
            fsp.maxdepth,
            0,
            u32::MAX,
        )?;
        Ok(within.map(|w| 1 + physlines_before + w))
    }

    /// Maps a 1-based physical line to its 0-based visible line (the
    /// number of visible lines strictly before it).
    pub fn physical_to_visible_line(&self, physline: u32) -> io::Result<Option<u32>> {
        let mut target = physline - 1;
        let mut vislines_before = 0u32;

        let found = self.fold_states.search(|lhs, here, rhs| {
            if let Some(lhs) = lhs {
                if target < lhs.n_physical_lines {
                    return MemSearchStep::Left;
                }
                target -= lhs.n_physical_lines;
                vislines_before += lhs.n_visible_lines;
            }
            if target < here.n_physical_lines
                || (target == here.n_physical_lines && rhs.is_none())
            {
                return MemSearchStep::Stop;
            }
            target -= here.n_physical_lines;
            vislines_before += here.n_visible_lines;
            if let Some(rhs) = rhs {
                if target <= rhs.n_physical_lines {
                    return MemSearchStep::Right;
                }
                target -= rhs.n_physical_lines;
                vislines_before += rhs.n_visible_lines;
            }
            MemSearchStep::Abort
        });

        let Some(fsp) = found.cloned() else {
            return Ok(None);
        };

        let within = self.index.lrt_translate_range(
            fsp.first_physical_line - 1,
            physline - 1,
            0,
            u32::MAX,
            fsp.mindepth,
            fsp.maxdepth,
        )?;
        Ok(within.map(|w| vislines_before + w))
    }

    /// Total number of visible lines under the current fold state.
    #[must_use]
    pub fn total_visible_lines(&self) -> u32 {
        self.fold_states
            .root_annotation()
            .map_or(0, |a| a.n_visible_lines)
    }

    /// The sequence node containing a visible line, plus the line's
    /// offset within it.
    pub fn get_node_by_visline(
        &self,
        visline: u32,
    ) -> io::Result<Option<(SeqOrderPayload, u32)>> {
        let Some(physline) = self.visible_to_physical_line(visline)? else {
            return Ok(None);
        };
        let Some(node) = self.index.node_at_line(physline)? else {
            return Ok(None);
        };
        let offset = physline - node.trace_file_firstline;
        Ok(Some((node, offset)))
    }

    /// The fold region containing a physical line.
    #[must_use]
    pub fn region_at_line(&self, physline: u32) -> Option<FoldStatePayload> {
        let probe = FoldStatePayload {
            first_physical_line: physline,
            last_physical_line: physline,
            first_quasivis_line: 0,
            mindepth: 0,
            maxdepth: 0,
            n_physical_lines: 1,
            n_visible_lines: 0,
        };
        self.fold_states
            .search(|_, here, _| match probe.cmp_payload(here) {
                Ordering::Less => MemSearchStep::Left,
                Ordering::Greater => MemSearchStep::Right,
                Ordering::Equal => MemSearchStep::Stop,
            })
            .cloned()
    }
}

// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! In-memory coverage registry.
//!
//! Instrumented code owns the counter arrays as statics and increments them
//! from arbitrary threads. The registry only ever touches a counter slot with a
//! single atomic load or store, and never mutates block metadata.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoverageError {
    #[error(
        "coverage: mismatched sizes for {file}: {counters} counters, {positions} positions, {stmts} statement counts"
    )]
    MismatchedSizes {
        file: String,
        counters: usize,
        positions: usize,
        stmts: usize,
    },
}

/// One instrumented statement region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoverBlock {
    pub line0: u32,
    pub col0: u16,
    pub line1: u32,
    pub col1: u16,
    pub stmts: u16,
}

/// Coverage variables of one source file, as emitted by the instrumentation
/// step: one counter per block, three position words per block
/// (start line, end line, packed columns) and one statement count per block.
#[derive(Debug, Clone, Copy)]
pub struct CoverVar {
    pub file: &'static str,
    pub count: &'static [AtomicU32],
    pub pos: &'static [u32],
    pub num_stmt: &'static [u16],
}

impl CoverVar {
    pub const fn new(
        file: &'static str,
        count: &'static [AtomicU32],
        pos: &'static [u32],
        num_stmt: &'static [u16],
    ) -> Self {
        CoverVar {
            file,
            count,
            pos,
            num_stmt,
        }
    }

    fn check_sizes(&self) -> Result<(), CoverageError> {
        if 3 * self.count.len() != self.pos.len() || self.count.len() != self.num_stmt.len() {
            return Err(CoverageError::MismatchedSizes {
                file: self.file.to_string(),
                counters: self.count.len(),
                positions: self.pos.len(),
                stmts: self.num_stmt.len(),
            });
        }
        Ok(())
    }

    fn blocks(&self) -> Vec<CoverBlock> {
        self.num_stmt
            .iter()
            .enumerate()
            .map(|(i, stmts)| {
                let cols = self.pos[3 * i + 2];
                CoverBlock {
                    line0: self.pos[3 * i],
                    col0: cols as u16,
                    line1: self.pos[3 * i + 1],
                    col1: (cols >> 16) as u16,
                    stmts: *stmts,
                }
            })
            .collect()
    }

    fn clear(&self) {
        for slot in self.count {
            slot.store(0, Ordering::Relaxed);
        }
    }
}

/// Coverage variables of one package (the main program or a dependency).
#[derive(Debug, Clone, Default)]
pub struct PackageCover {
    pub import_path: String,
    pub vars: Vec<CoverVar>,
}

impl PackageCover {
    pub fn new(import_path: impl Into<String>, vars: Vec<CoverVar>) -> Self {
        PackageCover {
            import_path: import_path.into(),
            vars,
        }
    }
}

/// Point-in-time view over the resident counters, keyed by file.
///
/// Counter arrays are borrowed, not copied: reading a hit count is an atomic
/// load on the live slot.
#[derive(Debug, Default)]
pub struct CoverageSnapshot {
    pub counters: BTreeMap<String, &'static [AtomicU32]>,
    pub blocks: BTreeMap<String, Vec<CoverBlock>>,
}

impl CoverageSnapshot {
    /// Registers one file's coverage. A file that is already present keeps its
    /// first counter array; packages reachable through several import paths
    /// would otherwise be counted twice.
    pub fn load_file_cover(&mut self, var: &CoverVar) -> Result<(), CoverageError> {
        var.check_sizes()?;
        if self.counters.contains_key(var.file) {
            debug!("Coverage for {} already registered", var.file);
            return Ok(());
        }
        self.counters.insert(var.file.to_string(), var.count);
        self.blocks.insert(var.file.to_string(), var.blocks());
        Ok(())
    }

    pub fn total_blocks(&self) -> usize {
        self.counters.values().map(|counter| counter.len()).sum()
    }

    pub fn covered_blocks(&self) -> usize {
        self.counters
            .values()
            .flat_map(|counter| counter.iter())
            .filter(|slot| slot.load(Ordering::Relaxed) > 0)
            .count()
    }
}

/// Every coverage source group linked into the binary.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    packages: Vec<PackageCover>,
}

impl Registry {
    /// `deps` are loaded before `main`, so a file known to both keeps the
    /// dependency's counters.
    pub fn new(main: PackageCover, deps: Vec<PackageCover>) -> Self {
        let mut packages = deps;
        packages.push(main);
        Registry { packages }
    }

    /// Aggregates every known file's counters and blocks.
    pub fn load(&self) -> Result<CoverageSnapshot, CoverageError> {
        let mut snapshot = CoverageSnapshot::default();
        for package in &self.packages {
            debug!(
                "Loading coverage of {} ({} files)",
                package.import_path,
                package.vars.len()
            );
            for var in &package.vars {
                snapshot.load_file_cover(var)?;
            }
        }
        Ok(snapshot)
    }

    /// Zeroes every counter slot in place. Block metadata is untouched.
    pub fn clear(&self) {
        for var in self.packages.iter().flat_map(|package| package.vars.iter()) {
            var.clear();
        }
    }
}

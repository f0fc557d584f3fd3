use std::path::PathBuf;

use anyhow::{ensure, Result};

use crate::settings::SETTINGS;

pub const BINARY_ARITY: usize = 2;
pub const QUAD_ARITY: usize = 4;
pub const OCT_ARITY: usize = 8;

/// Size of a serialized field element in bytes.
pub const NODE_SIZE: usize = 32;

/// Sector counts the engine can interleave in a single run.
pub const SECTOR_COUNTS: [usize; 8] = [1, 2, 4, 8, 16, 32, 64, 128];

/// Shape of the sectors processed by one run. All sectors of a run share it.
#[derive(Debug, Clone, Copy)]
pub struct SectorParams {
    /// Number of encoding layers; also the column arity.
    pub num_layers: usize,
    /// Partitions (separate tree-c/tree-r files) per sector.
    pub num_partitions: usize,
    /// Arity of tree-c and tree-r.
    pub arity: usize,
    /// Rows of tree-r above the leaves that are never persisted.
    pub discard_rows: usize,
    /// Nodes per sector.
    pub num_nodes: u64,
    /// Nodes per page of the layer source.
    pub nodes_per_page: u64,
    /// Sectors hashed in parallel.
    pub parallel_sectors: usize,
}

impl SectorParams {
    pub fn new(
        num_layers: usize,
        num_partitions: usize,
        arity: usize,
        discard_rows: usize,
        num_nodes: u64,
        nodes_per_page: u64,
        parallel_sectors: usize,
    ) -> Result<Self> {
        ensure!(
            num_layers == 2 || num_layers == 11,
            "unsupported layer count: {}",
            num_layers
        );
        ensure!(
            arity == BINARY_ARITY || arity == QUAD_ARITY || arity == OCT_ARITY,
            "unsupported tree arity: {}",
            arity
        );
        ensure!(
            SECTOR_COUNTS.contains(&parallel_sectors),
            "unsupported parallel sector count: {}",
            parallel_sectors
        );
        ensure!(
            matches!(num_partitions, 1 | 2 | 4 | 8),
            "unsupported partition count: {}",
            num_partitions
        );
        ensure!(
            num_nodes % num_partitions as u64 == 0,
            "{} nodes do not split into {} partitions",
            num_nodes,
            num_partitions
        );
        let rows = exact_log(arity, num_nodes / num_partitions as u64);
        ensure!(
            rows.is_some(),
            "partition of {} nodes is not a power of arity {}",
            num_nodes / num_partitions as u64,
            arity
        );
        ensure!(
            (discard_rows as u32) < rows.expect("checked above"),
            "discard rows {} leave no tree to persist",
            discard_rows
        );
        ensure!(
            nodes_per_page > 0 && num_nodes % nodes_per_page == 0,
            "page of {} nodes does not divide the sector",
            nodes_per_page
        );

        Ok(SectorParams {
            num_layers,
            num_partitions,
            arity,
            discard_rows,
            num_nodes,
            nodes_per_page,
            parallel_sectors,
        })
    }

    pub fn nodes_per_partition(&self) -> u64 {
        self.num_nodes / self.num_partitions as u64
    }

    pub fn sector_size(&self) -> u64 {
        self.num_nodes * NODE_SIZE as u64
    }
}

/// Thread placement for the run. Cores are only bound when given (and the
/// `cpu-binding` feature is enabled).
#[derive(Debug, Clone, Default)]
pub struct Pc2Topology {
    /// Core for the top-of-tree hasher thread.
    pub hasher_core: Option<usize>,
    /// First core of the writer range; writers bind to consecutive cores.
    pub writer_core: Option<usize>,
    /// Writer thread count; 0 selects the configured default.
    pub writer_threads: usize,
}

/// Per-run configuration, seeded from the global settings so tests can
/// override individual knobs without touching the environment.
#[derive(Debug, Clone)]
pub struct Pc2Config {
    pub output_dir: PathBuf,
    /// Optional per-sector data files; a present entry switches that sector
    /// from CC to encoding the last layer with the file's contents.
    pub data_files: Vec<Option<PathBuf>>,
    /// Skip tree-c and the sealed-data writes, build tree-r only.
    pub tree_r_only: bool,
    pub batch_size: usize,
    pub stream_count: usize,
    pub disk_io_batch_size: usize,
    pub num_host_batches: usize,
    pub num_host_empty_batches: usize,
    pub disable_file_writes: bool,
    pub disable_page_reads: bool,
}

impl Pc2Config {
    pub fn new<P: Into<PathBuf>>(output_dir: P) -> Self {
        Pc2Config {
            output_dir: output_dir.into(),
            data_files: Vec::new(),
            tree_r_only: false,
            batch_size: SETTINGS.batch_size,
            stream_count: SETTINGS.stream_count,
            disk_io_batch_size: SETTINGS.disk_io_batch_size,
            num_host_batches: SETTINGS.num_host_batches,
            num_host_empty_batches: SETTINGS.num_host_empty_batches,
            disable_file_writes: SETTINGS.disable_file_writes,
            disable_page_reads: SETTINGS.disable_page_reads,
        }
    }
}

/// Exact logarithm of `n` in base `base`, or `None` if `n` is not a power.
pub(crate) fn exact_log(base: usize, mut n: u64) -> Option<u32> {
    let base = base as u64;
    let mut log = 0;
    while n > 1 {
        if n % base != 0 {
            return None;
        }
        n /= base;
        log += 1;
    }
    if n == 1 {
        Some(log)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_log() {
        assert_eq!(exact_log(8, 512), Some(3));
        assert_eq!(exact_log(8, 1), Some(0));
        assert_eq!(exact_log(8, 128), None);
        assert_eq!(exact_log(2, 128), Some(7));
        assert_eq!(exact_log(2, 0), None);
    }

    #[test]
    fn test_sector_params_validation() {
        assert!(SectorParams::new(11, 1, 8, 1, 4096, 128, 2).is_ok());
        // not a power of the arity
        assert!(SectorParams::new(11, 1, 8, 1, 8192, 128, 2).is_err());
        // discard rows swallow the whole tree
        assert!(SectorParams::new(11, 1, 8, 4, 4096, 128, 2).is_err());
        assert!(SectorParams::new(3, 1, 8, 1, 4096, 128, 2).is_err());
        assert!(SectorParams::new(11, 3, 8, 1, 4096, 128, 2).is_err());
        assert!(SectorParams::new(11, 1, 8, 1, 4096, 128, 3).is_err());
    }
}

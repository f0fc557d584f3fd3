use std::cell::UnsafeCell;
use std::fs::File;
use std::mem::size_of;
use std::path::PathBuf;
use std::slice;
use std::sync::atomic::{AtomicU64, Ordering::SeqCst};
use std::sync::Arc;

use anyhow::{ensure, Context, Result};
use blstrs::Scalar as Fr;
use log::{info, warn};
use mapr::{Mmap, MmapMut, MmapOptions};

use crate::params::{SectorParams, NODE_SIZE};

/// Source of the pre-computed encoding layers. A run holds one staging slot
/// per stream; `load_layers` begins filling a slot asynchronously and the
/// caller observes completion by `valid` reaching the returned count.
///
/// Slot contents after a completed load are layer-major, node-major,
/// sector-minor: element `(layer, node, sector)` sits at
/// `layer * batch * sectors + node * sectors + sector`.
pub trait LayerReader: Send + Sync + 'static {
    fn num_layers(&self) -> usize;

    /// Whether the backing medium stores elements big-endian. Drives the
    /// byte reversal applied around the data-file addition.
    fn data_is_big_endian(&self) -> bool;

    /// Begin asynchronously loading `batch` nodes across `num_layers` layers
    /// starting at `(start_layer, start_node)` into `slot`. Returns the value
    /// `valid` reaches once the slot is fully populated.
    fn load_layers(
        self: Arc<Self>,
        slot: usize,
        start_layer: usize,
        start_node: u64,
        batch: usize,
        num_layers: usize,
        valid: Arc<AtomicU64>,
    ) -> Result<u64>;

    /// Safety: only call after the pending load for `slot` completed; the
    /// slice is invalidated by the next load into the same slot.
    unsafe fn slot(&self, slot: usize) -> &[Fr];
}

/// Staging slot backed by an anonymous, page-locked map so a device runtime
/// can DMA straight out of it.
struct PinnedSlot {
    map: UnsafeCell<MmapMut>,
    elements: usize,
}

unsafe impl Sync for PinnedSlot {}
unsafe impl Send for PinnedSlot {}

impl PinnedSlot {
    fn new(elements: usize) -> Result<Self> {
        Ok(PinnedSlot {
            map: UnsafeCell::new(allocate_pinned(elements * size_of::<Fr>())?),
            elements,
        })
    }

    /// Safety: the caller must synchronize all access; concurrent fills may
    /// only touch disjoint ranges.
    #[allow(clippy::mut_from_ref)]
    unsafe fn slice_mut(&self) -> &mut [Fr] {
        let map = &mut *self.map.get();
        slice::from_raw_parts_mut(map.as_mut_ptr() as *mut Fr, self.elements)
    }

    /// Safety: no fill may be active.
    unsafe fn slice(&self) -> &[Fr] {
        let map = &*self.map.get();
        slice::from_raw_parts(map.as_ptr() as *const Fr, self.elements)
    }
}

fn allocate_pinned(len: usize) -> Result<MmapMut> {
    match MmapOptions::new()
        .len(len)
        .private()
        .clone()
        .lock()
        .map_anon()
        .and_then(|mut buf| {
            buf.mlock()?;
            Ok(buf)
        }) {
        Ok(buf) => Ok(buf),
        Err(err) => {
            // fallback to not locked if permissions are not available
            warn!("failed to lock staging slot {:?}, falling back", err);
            let buf = MmapOptions::new().len(len).private().map_anon()?;
            Ok(buf)
        }
    }
}

/// Reader over the per-sector layer files left behind by the labeling phase,
/// mapped read-only. Loads are spread over the global thread pool, one task
/// per layer, each bumping `valid` once.
pub struct MmapLayerReader {
    layers: Vec<Vec<Mmap>>,
    slots: Vec<PinnedSlot>,
    num_nodes: u64,
    parallel_sectors: usize,
    num_layers: usize,
    batch: usize,
    big_endian: bool,
}

impl MmapLayerReader {
    /// `layer_paths[sector][layer]` name the label files, lowest layer first.
    pub fn open(
        layer_paths: &[Vec<PathBuf>],
        params: &SectorParams,
        batch: usize,
        stream_count: usize,
        big_endian: bool,
    ) -> Result<Self> {
        ensure!(
            layer_paths.len() == params.parallel_sectors,
            "expected layer files for {} sectors, got {}",
            params.parallel_sectors,
            layer_paths.len()
        );
        info!(
            "mapping {} layer files per sector for {} sectors",
            params.num_layers, params.parallel_sectors
        );

        let mut layers = Vec::with_capacity(layer_paths.len());
        for per_sector in layer_paths {
            ensure!(
                per_sector.len() == params.num_layers,
                "expected {} layers, got {}",
                params.num_layers,
                per_sector.len()
            );
            let mut maps = Vec::with_capacity(per_sector.len());
            for path in per_sector {
                let file =
                    File::open(path).with_context(|| format!("failed to open {:?}", path))?;
                let len = file.metadata()?.len();
                ensure!(
                    len == params.sector_size(),
                    "layer file {:?} is {} bytes, expected {}",
                    path,
                    len,
                    params.sector_size()
                );
                // Safety: mapped read-only; the labeling phase is done with it.
                maps.push(unsafe { MmapOptions::new().map(&file)? });
            }
            layers.push(maps);
        }

        let slot_elements = batch * params.num_layers * params.parallel_sectors;
        let slots = (0..stream_count)
            .map(|_| PinnedSlot::new(slot_elements))
            .collect::<Result<Vec<_>>>()?;

        Ok(MmapLayerReader {
            layers,
            slots,
            num_nodes: params.num_nodes,
            parallel_sectors: params.parallel_sectors,
            num_layers: params.num_layers,
            batch,
            big_endian,
        })
    }

    fn fill_layer(&self, slot: usize, layer: usize, layer_slot: usize, start_node: u64, batch: usize) {
        let sectors = self.parallel_sectors;
        // Safety: every pending fill of this slot writes a disjoint
        // per-layer region.
        let out = unsafe { self.slots[slot].slice_mut() };
        let base = layer_slot * batch * sectors;
        for (s, maps) in self.layers.iter().enumerate() {
            let bytes = &maps[layer][start_node as usize * NODE_SIZE..][..batch * NODE_SIZE];
            for (n, chunk) in bytes.chunks(NODE_SIZE).enumerate() {
                let mut repr = [0u8; NODE_SIZE];
                repr.copy_from_slice(chunk);
                let element = if self.big_endian {
                    Fr::from_bytes_be(&repr)
                } else {
                    Fr::from_bytes_le(&repr)
                };
                out[base + n * sectors + s] =
                    Option::from(element).expect("invalid field element in layer data");
            }
        }
    }
}

impl LayerReader for MmapLayerReader {
    fn num_layers(&self) -> usize {
        self.num_layers
    }

    fn data_is_big_endian(&self) -> bool {
        self.big_endian
    }

    fn load_layers(
        self: Arc<Self>,
        slot: usize,
        start_layer: usize,
        start_node: u64,
        batch: usize,
        num_layers: usize,
        valid: Arc<AtomicU64>,
    ) -> Result<u64> {
        ensure!(slot < self.slots.len(), "slot {} out of range", slot);
        ensure!(batch <= self.batch, "batch {} exceeds slot capacity", batch);
        ensure!(
            start_layer + num_layers <= self.num_layers,
            "layer range out of bounds"
        );
        ensure!(
            start_node + batch as u64 <= self.num_nodes,
            "node range [{}, {}) out of bounds",
            start_node,
            start_node + batch as u64
        );

        for l in 0..num_layers {
            let reader = Arc::clone(&self);
            let valid = Arc::clone(&valid);
            rayon::spawn(move || {
                reader.fill_layer(slot, start_layer + l, l, start_node, batch);
                valid.fetch_add(1, SeqCst);
            });
        }
        Ok(num_layers as u64)
    }

    unsafe fn slot(&self, slot: usize) -> &[Fr] {
        self.slots[slot].slice()
    }
}

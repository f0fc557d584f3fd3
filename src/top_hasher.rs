use std::sync::Arc;

use blstrs::Scalar as Fr;
use log::trace;

use crate::file_layout::SectorFile;
use crate::hash::hash_children;
use crate::params::NODE_SIZE;
use crate::tree_address::TreeAddress;

/// Hash the remaining top of one partition tree on the CPU and write every
/// produced node into the per-sector partition file.
///
/// `inputs` is the final leaf stash of all streams, stream-major and
/// sector-major within a stream: the leaf for `(sector, node)` with
/// `node = stream * group + offset` sits at
/// `stream * sectors * group + sector * group + offset`.
///
/// `top` describes the serialized shape of the top tree. Its first stored
/// layer lines up with the tail of the partition file, so nodes land at
/// `tree.data_size() - top.data_size() + top.address(..)`. For tree-r a
/// non-zero `top.skipped()` keeps the discarded rows off the disk. The
/// roots (one per sector) are copied into `roots`.
#[allow(clippy::too_many_arguments)]
pub fn hash_top(
    inputs: &[Fr],
    sectors: usize,
    group: usize,
    arity: usize,
    tree: &TreeAddress,
    top: &TreeAddress,
    files: &[Arc<SectorFile>],
    roots: &mut [Fr],
) {
    let top_leaves = inputs.len() / sectors;
    debug_assert_eq!(inputs.len() % sectors, 0);
    debug_assert_eq!(roots.len(), sectors);
    let file_offset = tree.data_size() - top.data_size();
    let skipped = top.skipped();

    for (s, root) in roots.iter_mut().enumerate() {
        let mut level: Vec<Fr> = (0..top_leaves)
            .map(|i| {
                let stream = i / group;
                let node = i % group;
                inputs[stream * sectors * group + s * group + node]
            })
            .collect();

        // Logical layer within the top tree; its leaves are layer 0 and were
        // already emitted by the streams.
        let mut layer = 1usize;
        while level.len() > 1 {
            let next: Vec<Fr> = level.chunks(arity).map(hash_children).collect();
            if layer >= skipped {
                let stored = layer - skipped;
                for (n, element) in next.iter().enumerate() {
                    let offset = file_offset + top.address(stored, n as u64);
                    files[s]
                        .write_data(offset, &element.to_bytes_le())
                        .expect("top hash write failed");
                }
            }
            level = next;
            layer += 1;
        }
        *root = level[0];
        trace!("sector {} topped out", s);
    }
}

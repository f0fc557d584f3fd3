use blstrs::Scalar as Fr;
use rayon::prelude::*;

use crate::hash::{hash_children, hash_column};

/// Batch hashing backend of one stream. The engine only ever keeps a single
/// operation in flight per stream, so implementations are free to use the
/// whole device (or, here, the thread pool) per call. A CUDA/OpenCL builder
/// plugs in at this seam.
pub trait BatchHasher: Send {
    /// Column-hash slot data (layer-major, node-major, sector-minor) into
    /// sector-major hashes: `out[sector * batch + node]`.
    fn hash_columns(
        &mut self,
        slot: &[Fr],
        layers: usize,
        batch: usize,
        sectors: usize,
        out: &mut [Fr],
    );

    /// One arity reduction of sector-major input into sector-major output.
    fn hash_tree_level(&mut self, input: &[Fr], arity: usize, sectors: usize, out: &mut [Fr]);

    /// Tree leaves from node-major (sector-interleaved) replica data.
    fn hash_interleaved_leaves(
        &mut self,
        replica: &[Fr],
        arity: usize,
        sectors: usize,
        out: &mut [Fr],
    );
}

#[derive(Debug, Default)]
pub struct CpuBatchHasher;

impl BatchHasher for CpuBatchHasher {
    fn hash_columns(
        &mut self,
        slot: &[Fr],
        layers: usize,
        batch: usize,
        sectors: usize,
        out: &mut [Fr],
    ) {
        debug_assert_eq!(out.len(), batch * sectors);
        debug_assert!(slot.len() >= layers * batch * sectors);
        out.par_iter_mut().enumerate().for_each(|(i, out)| {
            let s = i / batch;
            let n = i % batch;
            let column: Vec<Fr> = (0..layers)
                .map(|l| slot[l * batch * sectors + n * sectors + s])
                .collect();
            *out = hash_column(&column);
        });
    }

    fn hash_tree_level(&mut self, input: &[Fr], arity: usize, sectors: usize, out: &mut [Fr]) {
        let per_sector_out = out.len() / sectors;
        let per_sector_in = input.len() / sectors;
        debug_assert_eq!(per_sector_out * arity, per_sector_in);
        out.par_iter_mut().enumerate().for_each(|(i, out)| {
            let s = i / per_sector_out;
            let g = i % per_sector_out;
            *out = hash_children(&input[s * per_sector_in + g * arity..][..arity]);
        });
    }

    fn hash_interleaved_leaves(
        &mut self,
        replica: &[Fr],
        arity: usize,
        sectors: usize,
        out: &mut [Fr],
    ) {
        let per_sector_out = out.len() / sectors;
        debug_assert_eq!(replica.len(), out.len() * arity);
        out.par_iter_mut().enumerate().for_each(|(i, out)| {
            let s = i / per_sector_out;
            let g = i % per_sector_out;
            let children: Vec<Fr> = (0..arity)
                .map(|k| replica[(g * arity + k) * sectors + s])
                .collect();
            *out = hash_children(&children);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ff::Field;
    use rand::SeedableRng;
    use rand_xorshift::XorShiftRng;

    #[test]
    fn test_layouts_agree_with_direct_hashing() {
        let mut rng = XorShiftRng::from_seed([3u8; 16]);
        let (layers, batch, sectors, arity) = (2, 8, 2, 2);
        let slot: Vec<Fr> = (0..layers * batch * sectors)
            .map(|_| Fr::random(&mut rng))
            .collect();

        let mut hasher = CpuBatchHasher::default();
        let mut columns = vec![Fr::ZERO; batch * sectors];
        hasher.hash_columns(&slot, layers, batch, sectors, &mut columns);
        assert_eq!(
            columns[batch + 3], // sector 1, node 3
            hash_column(&[slot[3 * sectors + 1], slot[batch * sectors + 3 * sectors + 1]])
        );

        let mut level = vec![Fr::ZERO; batch * sectors / arity];
        hasher.hash_tree_level(&columns, arity, sectors, &mut level);
        assert_eq!(level[1], hash_children(&columns[2..4]));

        let replica = &slot[batch * sectors..]; // node-major slice
        let mut leaves = vec![Fr::ZERO; batch * sectors / arity];
        hasher.hash_interleaved_leaves(replica, arity, sectors, &mut leaves);
        // sector 0, group 1 gathers nodes 2 and 3 of sector 0
        assert_eq!(
            leaves[1],
            hash_children(&[replica[2 * sectors], replica[3 * sectors]])
        );
    }
}

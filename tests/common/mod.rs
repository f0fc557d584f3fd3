use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use blstrs::Scalar as Fr;
use ff::Field;
use rand::SeedableRng;
use rand_xorshift::XorShiftRng;

use fil_pc2::file_layout::FileLayout;
use fil_pc2::hash::{hash_children, hash_column};
use fil_pc2::reader::MmapLayerReader;
use fil_pc2::{run_pc2, Pc2Config, Pc2Topology, PersistentAux, SectorParams, NODE_SIZE};

pub const TEST_SEED: [u8; 16] = [
    0x59, 0x62, 0xbe, 0x5d, 0x76, 0x3d, 0x31, 0x8d, 0x17, 0xdb, 0x37, 0x32, 0x54, 0x06, 0xbc, 0xe5,
];

/// All files a run emits, rebuilt by plain recursion for comparison.
pub struct NaiveOutput {
    /// `[sector][partition]` serialized tree bytes.
    pub tree_c: Vec<Vec<Vec<u8>>>,
    pub tree_r: Vec<Vec<Vec<u8>>>,
    /// `[sector]` big-endian sealed bytes.
    pub sealed: Vec<Vec<u8>>,
    pub p_aux: Vec<(Fr, Fr)>,
}

/// Serialize an arity-`arity` tree over `leaves`, skipping the bottom
/// `skips` layers, and return the bytes plus the root.
pub fn serialize_tree(leaves: &[Fr], arity: usize, skips: usize) -> (Vec<u8>, Fr) {
    let mut levels = vec![leaves.to_vec()];
    while levels.last().expect("no levels").len() > 1 {
        let next: Vec<Fr> = levels
            .last()
            .expect("no levels")
            .chunks(arity)
            .map(hash_children)
            .collect();
        levels.push(next);
    }
    let mut bytes = Vec::new();
    for level in levels.iter().skip(skips) {
        for element in level {
            bytes.extend_from_slice(&element.to_bytes_le());
        }
    }
    let root = levels.last().expect("no levels")[0];
    (bytes, root)
}

/// Recursive reference for the whole run.
pub fn naive_pc2(
    layers: &[Vec<Vec<Fr>>],
    data: &[Option<Vec<Fr>>],
    arity: usize,
    partitions: usize,
    discard_rows: usize,
    tree_r_only: bool,
) -> NaiveOutput {
    let sectors = layers.len();
    let num_nodes = layers[0][0].len();
    let nodes_per_partition = num_nodes / partitions;

    let mut out = NaiveOutput {
        tree_c: Vec::new(),
        tree_r: Vec::new(),
        sealed: Vec::new(),
        p_aux: Vec::new(),
    };

    for s in 0..sectors {
        let replica: Vec<Fr> = {
            let last = layers[s].last().expect("no layers");
            match &data[s] {
                Some(values) => last.iter().zip(values).map(|(k, v)| k + v).collect(),
                None => last.clone(),
            }
        };
        out.sealed.push(
            replica
                .iter()
                .flat_map(|el| el.to_bytes_be().to_vec())
                .collect(),
        );

        let column_hashes: Vec<Fr> = (0..num_nodes)
            .map(|n| {
                let column: Vec<Fr> = layers[s].iter().map(|layer| layer[n]).collect();
                hash_column(&column)
            })
            .collect();

        let mut files_c = Vec::new();
        let mut files_r = Vec::new();
        let mut roots_c = Vec::new();
        let mut roots_r = Vec::new();
        for p in 0..partitions {
            let range = p * nodes_per_partition..(p + 1) * nodes_per_partition;
            let (bytes_c, root_c) = serialize_tree(&column_hashes[range.clone()], arity, 0);
            files_c.push(bytes_c);
            roots_c.push(root_c);

            let (bytes_r, root_r) = serialize_tree(&replica[range], arity, discard_rows + 1);
            files_r.push(bytes_r);
            roots_r.push(root_r);
        }

        let comm_c = if tree_r_only {
            Fr::ZERO
        } else if partitions > 1 {
            hash_children(&roots_c)
        } else {
            roots_c[0]
        };
        let comm_r_last = if partitions > 1 {
            hash_children(&roots_r)
        } else {
            roots_r[0]
        };
        out.p_aux.push((comm_c, comm_r_last));

        out.tree_c.push(files_c);
        out.tree_r.push(files_r);
    }

    out
}

/// Random layer data for every sector.
pub fn random_layers(params: &SectorParams, seed: [u8; 16]) -> Vec<Vec<Vec<Fr>>> {
    let mut rng = XorShiftRng::from_seed(seed);
    (0..params.parallel_sectors)
        .map(|_| {
            (0..params.num_layers)
                .map(|_| {
                    (0..params.num_nodes)
                        .map(|_| Fr::random(&mut rng))
                        .collect()
                })
                .collect()
        })
        .collect()
}

/// Write the layer label files where the reader expects them and return
/// their paths, `[sector][layer]`.
pub fn write_layer_files(
    layout: &FileLayout,
    layers: &[Vec<Vec<Fr>>],
) -> Vec<Vec<PathBuf>> {
    layers
        .iter()
        .enumerate()
        .map(|(s, per_sector)| {
            per_sector
                .iter()
                .enumerate()
                .map(|(l, nodes)| {
                    let path = layout.layer_path(s, l + 1);
                    let parent = path.parent().expect("no parent");
                    fs::create_dir_all(parent).expect("create_dir_all failure");
                    let bytes: Vec<u8> =
                        nodes.iter().flat_map(|el| el.to_bytes_le().to_vec()).collect();
                    fs::write(&path, &bytes).expect("layer write failure");
                    path
                })
                .collect()
        })
        .collect()
}

/// Write optional per-sector data files and record them in the config.
pub fn write_data_files(
    config: &mut Pc2Config,
    layout_dir: &std::path::Path,
    data: &[Option<Vec<Fr>>],
) {
    config.data_files = data
        .iter()
        .enumerate()
        .map(|(s, values)| {
            values.as_ref().map(|values| {
                let path = layout_dir.join(format!("staged-data-{}", s));
                let bytes: Vec<u8> =
                    values.iter().flat_map(|el| el.to_bytes_le().to_vec()).collect();
                fs::write(&path, &bytes).expect("data write failure");
                path
            })
        })
        .collect();
}

/// Stream a full run over the given layers and return the emitted roots.
pub fn run_engine(
    params: &SectorParams,
    config: &Pc2Config,
    layers: &[Vec<Vec<Fr>>],
) -> Vec<PersistentAux> {
    let layout = FileLayout::new(
        &config.output_dir,
        params.parallel_sectors,
        params.num_partitions,
    );
    let paths = write_layer_files(&layout, layers);
    let reader = MmapLayerReader::open(&paths, params, config.batch_size, config.stream_count, false)
        .expect("reader open failure");
    run_pc2(Arc::new(reader), params, &Pc2Topology::default(), config).expect("run failure")
}

/// Compare every emitted file against the reference.
pub fn assert_outputs_match(
    params: &SectorParams,
    config: &Pc2Config,
    naive: &NaiveOutput,
    aux: &[PersistentAux],
) {
    let layout = FileLayout::new(
        &config.output_dir,
        params.parallel_sectors,
        params.num_partitions,
    );
    for s in 0..params.parallel_sectors {
        for p in 0..params.num_partitions {
            if !config.tree_r_only {
                let bytes = fs::read(layout.tree_c_path(s, p)).expect("tree-c read failure");
                assert_eq!(bytes, naive.tree_c[s][p], "tree-c mismatch at ({}, {})", s, p);
            }
            let bytes = fs::read(layout.tree_r_path(s, p)).expect("tree-r read failure");
            assert_eq!(bytes, naive.tree_r[s][p], "tree-r mismatch at ({}, {})", s, p);
        }

        if !config.tree_r_only {
            let bytes = fs::read(layout.sealed_path(s)).expect("sealed read failure");
            assert_eq!(bytes, naive.sealed[s], "sealed mismatch at sector {}", s);
        }

        let (comm_c, comm_r_last) = naive.p_aux[s];
        assert_eq!(aux[s].comm_c, comm_c, "comm_c mismatch at sector {}", s);
        assert_eq!(
            aux[s].comm_r_last, comm_r_last,
            "comm_r_last mismatch at sector {}",
            s
        );

        let bytes = fs::read(layout.p_aux_path(s)).expect("p_aux read failure");
        assert_eq!(bytes.len(), 2 * NODE_SIZE);
        assert_eq!(&bytes[..NODE_SIZE], &comm_c.to_bytes_le()[..]);
        assert_eq!(&bytes[NODE_SIZE..], &comm_r_last.to_bytes_le()[..]);
    }
}

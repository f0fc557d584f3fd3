use anyhow::{ensure, Result};

/// Byte layout of one serialized tree file: the stored layers concatenated
/// bottom-up, each layer a run of fixed-size nodes. Tree-r files are built
/// with `layer_skips > 0`, which drops that many layers off the bottom;
/// `layer` arguments below always index the *stored* layers, starting at 0
/// for the first layer that actually hits the disk.
#[derive(Debug, Clone)]
pub struct TreeAddress {
    arity: usize,
    node_size: u64,
    skipped: usize,
    layer_nodes: Vec<u64>,
    layer_offsets: Vec<u64>,
}

impl TreeAddress {
    pub fn new(leaf_count: u64, arity: usize, node_size: u64, layer_skips: usize) -> Result<Self> {
        ensure!(arity >= 2, "invalid arity: {}", arity);
        ensure!(leaf_count >= 1, "empty tree");
        ensure!(node_size > 0, "invalid node size");

        let mut sizes = Vec::new();
        let mut nodes = leaf_count;
        loop {
            sizes.push(nodes);
            if nodes == 1 {
                break;
            }
            ensure!(
                nodes % arity as u64 == 0,
                "layer of {} nodes does not divide by arity {}",
                nodes,
                arity
            );
            nodes /= arity as u64;
        }
        ensure!(
            layer_skips < sizes.len(),
            "cannot skip {} of {} layers",
            layer_skips,
            sizes.len()
        );

        let layer_nodes: Vec<u64> = sizes[layer_skips..].to_vec();
        let mut layer_offsets = Vec::with_capacity(layer_nodes.len());
        let mut offset = 0u64;
        for nodes in &layer_nodes {
            layer_offsets.push(offset);
            offset += nodes * node_size;
        }

        Ok(TreeAddress {
            arity,
            node_size,
            skipped: layer_skips,
            layer_nodes,
            layer_offsets,
        })
    }

    /// Number of stored layers.
    pub fn layers(&self) -> usize {
        self.layer_nodes.len()
    }

    /// Layers dropped off the bottom of the logical tree.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    pub fn arity(&self) -> usize {
        self.arity
    }

    pub fn nodes_at(&self, layer: usize) -> u64 {
        self.layer_nodes[layer]
    }

    /// Byte offset of a node inside the serialized file.
    pub fn address(&self, layer: usize, node: u64) -> u64 {
        debug_assert!(layer < self.layer_nodes.len(), "layer out of range");
        debug_assert!(node < self.layer_nodes[layer], "node out of range");
        self.layer_offsets[layer] + node * self.node_size
    }

    /// Total size of the serialized file in bytes.
    pub fn data_size(&self) -> u64 {
        *self.layer_offsets.last().expect("at least one layer") + self.node_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_is_monotone() {
        let tree = TreeAddress::new(512, 8, 32, 0).expect("new failure");
        assert_eq!(tree.layers(), 4);

        let mut last = None;
        for layer in 0..tree.layers() {
            for node in 0..tree.nodes_at(layer) {
                let addr = tree.address(layer, node);
                assert!(addr < tree.data_size());
                if let Some(prev) = last {
                    assert!(addr > prev, "address must grow with (layer, node)");
                    assert_eq!(addr, prev + 32);
                }
                last = Some(addr);
            }
        }
        // 512 + 64 + 8 + 1 nodes of 32 bytes
        assert_eq!(tree.data_size(), 585 * 32);
    }

    #[test]
    fn test_layer_skips() {
        let full = TreeAddress::new(512, 8, 32, 0).expect("new failure");
        let skipped = TreeAddress::new(512, 8, 32, 2).expect("new failure");

        assert_eq!(skipped.layers(), 2);
        assert_eq!(skipped.nodes_at(0), 8);
        assert_eq!(skipped.data_size(), 9 * 32);
        // the first stored layer of the skipped tree is layer 2 of the full one
        assert_eq!(
            full.address(2, 3) - full.address(2, 0),
            skipped.address(0, 3) - skipped.address(0, 0)
        );
    }

    #[test]
    fn test_single_node_tree() {
        let tree = TreeAddress::new(1, 8, 32, 0).expect("new failure");
        assert_eq!(tree.layers(), 1);
        assert_eq!(tree.data_size(), 32);
        assert_eq!(tree.address(0, 0), 0);
    }

    #[test]
    fn test_invalid_shapes() {
        assert!(TreeAddress::new(0, 8, 32, 0).is_err());
        assert!(TreeAddress::new(100, 8, 32, 0).is_err());
        assert!(TreeAddress::new(64, 8, 32, 3).is_err());
    }
}

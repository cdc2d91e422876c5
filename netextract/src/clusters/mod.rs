//! Hierarchical cluster engine
//!
//! Step 1 computes local clusters for every cell in parallel. Step 2
//! ([`HierClusters::build`]) joins them across instance boundaries,
//! bottom-up and single-threaded.

pub mod hier;
pub mod local;

use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet};

use crate::connectivity::Connectivity;
use crate::layout::{CellIndex, LayerIndex, Layout};

pub use hier::{CellClusters, ClusterInstance, ConnectedCluster, HierClusters};
pub use local::{LocalCluster, LocalClusters, Node, NodeGeometry, NodeKind, SplitOptions, TerminalInput};

/// Cluster id, unique within one cell (starting at 1)
pub type ClusterId = usize;

/// Compute the local clusters of `cells` on the given pool
pub fn build_local_clusters(
    layout: &Layout,
    cells: &[CellIndex],
    conn: &Connectivity,
    terminals: &BTreeMap<CellIndex, Vec<TerminalInput<'_>>>,
    split: &SplitOptions,
    pool: &rayon::ThreadPool,
) -> BTreeMap<CellIndex, LocalClusters> {
    let layers: BTreeSet<LayerIndex> = conn.layers();
    pool.install(|| {
        cells
            .par_iter()
            .map(|&ci| {
                let cell_terminals = terminals.get(&ci).map(Vec::as_slice).unwrap_or(&[]);
                let lc = LocalClusters::build(layout, ci, conn, &layers, cell_terminals, split);
                (ci, lc)
            })
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geom::Rect;
    use crate::layout::LayerInfo;

    #[test]
    fn test_thread_count_does_not_change_numbering() {
        let mut ly = Layout::new(0.001);
        let m1 = ly.insert_layer(LayerInfo::new(1, 0));
        let mut cells = Vec::new();
        for c in 0..6 {
            let ci = ly.add_cell(format!("C{}", c));
            for k in 0..20 {
                let x = (k * 37 % 11) * 10;
                ly.insert_shape(ci, m1, Rect::new(x, k * 7, x + 12, k * 7 + 5));
            }
            cells.push(ci);
        }
        let mut conn = Connectivity::new();
        conn.connect(m1);
        let split = SplitOptions {
            area_ratio: 3.0,
            max_vertex_count: 16,
        };

        let ids = |threads: usize| {
            let pool = rayon::ThreadPoolBuilder::new().num_threads(threads).build().unwrap();
            build_local_clusters(&ly, &cells, &conn, &BTreeMap::new(), &split, &pool)
                .into_iter()
                .map(|(ci, lc)| (ci, lc.clusters().iter().map(|c| c.nodes.clone()).collect::<Vec<_>>()))
                .collect::<Vec<_>>()
        };
        assert_eq!(ids(1), ids(4));
    }
}

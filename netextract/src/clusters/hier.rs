//! Hierarchical cluster propagation
//!
//! Cells are processed bottom-up. For each cell a union-find runs over the
//! cell's local clusters and the child clusters reached through its
//! instances. Child geometry is found by descending the instance tree with
//! the composed transformation, and every hit remembers the instance path
//! it was found on. When a child cluster turns out to be connected but is
//! not yet exposed in an intermediate cell of that path, a pin-only cluster
//! is created there.
//!
//! All joins are scoped to the cell they are observed in: a cell
//! instantiated twice never has its clusters merged because one of its
//! instantiations happens to connect them.

use petgraph::unionfind::UnionFind;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::connectivity::Connectivity;
use crate::core::ExtractError;
use crate::geom::{Rect, Trans};
use crate::layout::{CellIndex, Layout};

use super::local::{pieces_connect, LocalClusters, Piece};
use super::ClusterId;

/// A child cluster seen through one instance of the cell
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ClusterInstance {
    /// Instance index inside the parent cell
    pub instance: usize,
    /// Cluster id inside the instantiated cell
    pub cluster: ClusterId,
}

/// A cluster of one cell including everything it connects to below
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectedCluster {
    pub id: ClusterId,
    pub locals: Vec<ClusterId>,
    pub instances: Vec<ClusterInstance>,
    pub global_nets: BTreeSet<usize>,
}

/// Local and connected clusters of one cell
#[derive(Debug, Clone, Default, Serialize)]
pub struct CellClusters {
    local: LocalClusters,
    clusters: BTreeMap<ClusterId, ConnectedCluster>,
    #[serde(skip)]
    local_to_cluster: BTreeMap<ClusterId, ClusterId>,
    #[serde(skip)]
    instance_to_cluster: HashMap<ClusterInstance, ClusterId>,
    bbox: Option<Rect>,
    next_id: ClusterId,
}

impl CellClusters {
    pub fn local(&self) -> &LocalClusters {
        &self.local
    }

    pub fn clusters(&self) -> impl Iterator<Item = &ConnectedCluster> {
        self.clusters.values()
    }

    pub fn cluster(&self, id: ClusterId) -> Option<&ConnectedCluster> {
        self.clusters.get(&id)
    }

    pub fn len(&self) -> usize {
        self.clusters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }

    pub fn cluster_of_local(&self, local: ClusterId) -> Option<ClusterId> {
        self.local_to_cluster.get(&local).copied()
    }

    /// The cluster a child cluster is connected to, if it is connected here
    pub fn cluster_of_instance(&self, instance: usize, child: ClusterId) -> Option<ClusterId> {
        self.instance_to_cluster
            .get(&ClusterInstance {
                instance,
                cluster: child,
            })
            .copied()
    }

    /// Bounding box of the clustered geometry of the cell's subtree
    pub fn bbox(&self) -> Option<Rect> {
        self.bbox
    }

    /// Text labels of a cluster's local parts, in local cluster order
    pub fn labels(&self, id: ClusterId) -> Vec<&str> {
        let Some(cluster) = self.cluster(id) else {
            return Vec::new();
        };
        cluster
            .locals
            .iter()
            .filter_map(|&l| self.local.cluster(l))
            .flat_map(|lc| lc.labels.iter().map(String::as_str))
            .collect()
    }

    fn insert(&mut self, cluster: ConnectedCluster) {
        for &l in &cluster.locals {
            self.local_to_cluster.insert(l, cluster.id);
        }
        for &ci in &cluster.instances {
            self.instance_to_cluster.insert(ci, cluster.id);
        }
        self.next_id = self.next_id.max(cluster.id + 1);
        self.clusters.insert(cluster.id, cluster);
    }

    /// Expose a child cluster in this cell, creating a pin-only cluster if needed
    fn propagate(
        &mut self,
        instance: usize,
        child: ClusterId,
        global_nets: BTreeSet<usize>,
    ) -> ClusterId {
        let key = ClusterInstance {
            instance,
            cluster: child,
        };
        if let Some(&id) = self.instance_to_cluster.get(&key) {
            return id;
        }
        let id = self.next_id;
        self.insert(ConnectedCluster {
            id,
            locals: Vec::new(),
            instances: vec![key],
            global_nets,
        });
        id
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct HitOrigin {
    /// (cell, instance index in that cell) from the processed cell downwards
    path: Vec<(CellIndex, usize)>,
    leaf_cell: CellIndex,
    leaf_local: ClusterId,
}

#[derive(Debug)]
struct Hit {
    origin: HitOrigin,
    pieces: Vec<Piece>,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum Endpoint {
    Local(ClusterId),
    Child(HitOrigin),
}

/// Connected clusters of every cell below the top cell
#[derive(Debug, Clone, Default, Serialize)]
pub struct HierClusters {
    top: CellIndex,
    cells: BTreeMap<CellIndex, CellClusters>,
}

impl HierClusters {
    /// Propagate the local clusters of all cells bottom-up
    pub fn build(
        layout: &Layout,
        top: CellIndex,
        conn: &Connectivity,
        mut locals: BTreeMap<CellIndex, LocalClusters>,
    ) -> Result<Self, ExtractError> {
        let order = layout.cells_bottom_up(top)?;
        let mut hier = HierClusters {
            top,
            cells: BTreeMap::new(),
        };
        for ci in order {
            let local = locals.remove(&ci).unwrap_or_default();
            hier.build_cell(layout, ci, conn, local);
        }
        Ok(hier)
    }

    pub fn top_cell(&self) -> CellIndex {
        self.top
    }

    pub fn cell(&self, cell: CellIndex) -> Option<&CellClusters> {
        self.cells.get(&cell)
    }

    pub fn cells(&self) -> impl Iterator<Item = (CellIndex, &CellClusters)> {
        self.cells.iter().map(|(ci, cc)| (*ci, cc))
    }

    fn instance_bbox(&self, layout: &Layout, cell: CellIndex, instance: usize) -> Option<Rect> {
        let inst = layout.cell(cell).instances().get(instance)?;
        let bbox = self.cells.get(&inst.cell)?.bbox?;
        Some(bbox.transformed(&inst.trans))
    }

    fn collect_hits(
        &self,
        layout: &Layout,
        cell: CellIndex,
        trans: &Trans,
        region: &Rect,
        path: &mut Vec<(CellIndex, usize)>,
        out: &mut Vec<Hit>,
    ) {
        let Some(cc) = self.cells.get(&cell) else {
            return;
        };
        let local_region = region.transformed(&trans.inverted());
        for lc in cc.local.clusters() {
            if !lc.bbox.touches(&local_region) {
                continue;
            }
            let pieces: Vec<Piece> = cc
                .local
                .pieces(lc.id, Some(&local_region))
                .iter()
                .map(|p| p.transformed(trans))
                .collect();
            if !pieces.is_empty() {
                out.push(Hit {
                    origin: HitOrigin {
                        path: path.clone(),
                        leaf_cell: cell,
                        leaf_local: lc.id,
                    },
                    pieces,
                });
            }
        }
        for (ii, inst) in layout.cell(cell).instances().iter().enumerate() {
            let Some(child_bbox) = self.cells.get(&inst.cell).and_then(|c| c.bbox) else {
                continue;
            };
            if !child_bbox.transformed(&inst.trans).touches(&local_region) {
                continue;
            }
            path.push((cell, ii));
            let t = trans.concat(&inst.trans);
            self.collect_hits(layout, inst.cell, &t, region, path, out);
            path.pop();
        }
    }

    fn instance_hits(
        &self,
        layout: &Layout,
        cell: CellIndex,
        instance: usize,
        region: &Rect,
    ) -> Vec<Hit> {
        let mut out = Vec::new();
        if let Some(inst) = layout.cell(cell).instances().get(instance) {
            let mut path = vec![(cell, instance)];
            self.collect_hits(layout, inst.cell, &inst.trans, region, &mut path, &mut out);
        }
        out
    }

    /// Map a hit to (instance of the processed cell, cluster id in its cell)
    fn resolve(&mut self, layout: &Layout, origin: &HitOrigin) -> Option<ClusterInstance> {
        let (_, first_instance) = *origin.path.first()?;
        let mut id = self.cells.get(&origin.leaf_cell)?.cluster_of_local(origin.leaf_local)?;
        for &(cell, instance) in origin.path[1..].iter().rev() {
            let child_cell = layout.cell(cell).instances().get(instance)?.cell;
            let globals = self
                .cells
                .get(&child_cell)
                .and_then(|c| c.cluster(id))
                .map(|c| c.global_nets.clone())
                .unwrap_or_default();
            id = self.cells.get_mut(&cell)?.propagate(instance, id, globals);
        }
        Some(ClusterInstance {
            instance: first_instance,
            cluster: id,
        })
    }

    fn build_cell(
        &mut self,
        layout: &Layout,
        ci: CellIndex,
        conn: &Connectivity,
        local: LocalClusters,
    ) {
        let instances = layout.cell(ci).instances();
        let inst_boxes: Vec<Option<Rect>> = (0..instances.len())
            .map(|ii| self.instance_bbox(layout, ci, ii))
            .collect();

        let mut pending: BTreeSet<(Endpoint, Endpoint)> = BTreeSet::new();

        for lc in local.clusters() {
            let own = local.pieces(lc.id, None);
            for (ii, ib) in inst_boxes.iter().enumerate() {
                if !ib.is_some_and(|b| b.touches(&lc.bbox)) {
                    continue;
                }
                for hit in self.instance_hits(layout, ci, ii, &lc.bbox) {
                    if pieces_connect(&own, &hit.pieces, conn) {
                        pending.insert((Endpoint::Local(lc.id), Endpoint::Child(hit.origin)));
                    }
                }
            }
        }

        for i in 0..instances.len() {
            for j in (i + 1)..instances.len() {
                let (Some(bi), Some(bj)) = (inst_boxes[i], inst_boxes[j]) else {
                    continue;
                };
                let Some(region) = bi.clipped(&bj) else {
                    continue;
                };
                let hits_i = self.instance_hits(layout, ci, i, &region);
                if hits_i.is_empty() {
                    continue;
                }
                let hits_j = self.instance_hits(layout, ci, j, &region);
                for a in &hits_i {
                    for b in &hits_j {
                        if pieces_connect(&a.pieces, &b.pieces, conn) {
                            pending.insert((
                                Endpoint::Child(a.origin.clone()),
                                Endpoint::Child(b.origin.clone()),
                            ));
                        }
                    }
                }
            }
        }

        // items 0..n are the local clusters, child clusters get appended
        let n = local.len();
        let mut interned: Vec<ClusterInstance> = Vec::new();
        let mut item_of: BTreeMap<ClusterInstance, usize> = BTreeMap::new();
        let mut intern = |key: ClusterInstance| -> usize {
            *item_of.entry(key).or_insert_with(|| {
                interned.push(key);
                n + interned.len() - 1
            })
        };

        let mut edges: Vec<(usize, usize)> = Vec::new();
        for (a, b) in &pending {
            let mut item = |e: &Endpoint, hier: &mut Self| -> Option<usize> {
                match e {
                    Endpoint::Local(id) => Some(id - 1),
                    Endpoint::Child(origin) => hier.resolve(layout, origin).map(&mut intern),
                }
            };
            if let (Some(x), Some(y)) = (item(a, self), item(b, self)) {
                edges.push((x, y));
            }
        }

        let mut by_global: BTreeMap<usize, usize> = BTreeMap::new();
        let mut global_edges = |item: usize, nets: &BTreeSet<usize>, edges: &mut Vec<(usize, usize)>| {
            for &g in nets {
                let first = *by_global.entry(g).or_insert(item);
                if first != item {
                    edges.push((first, item));
                }
            }
        };
        for lc in local.clusters() {
            global_edges(lc.id - 1, &lc.global_nets, &mut edges);
        }
        for (ii, inst) in instances.iter().enumerate() {
            let Some(child) = self.cells.get(&inst.cell) else {
                continue;
            };
            for cluster in child.clusters().filter(|c| !c.global_nets.is_empty()) {
                let item = intern(ClusterInstance {
                    instance: ii,
                    cluster: cluster.id,
                });
                global_edges(item, &cluster.global_nets, &mut edges);
            }
        }

        let total = n + interned.len();
        let mut uf = UnionFind::<usize>::new(total);
        for (x, y) in edges {
            uf.union(x, y);
        }

        let mut groups: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for item in 0..total {
            groups.entry(uf.find(item)).or_default().push(item);
        }
        let mut groups: Vec<Vec<usize>> = groups.into_values().collect();
        groups.sort_by_key(|g| g[0]);

        let bbox = Rect::bounding(local.bbox().iter().chain(inst_boxes.iter().flatten()));
        let mut cell_clusters = CellClusters {
            local,
            bbox,
            next_id: n + 1,
            ..CellClusters::default()
        };

        let mut next_pin_only = n + 1;
        for group in groups {
            let id = if group[0] < n {
                group[0] + 1
            } else {
                next_pin_only += 1;
                next_pin_only - 1
            };
            let mut cluster = ConnectedCluster {
                id,
                locals: Vec::new(),
                instances: Vec::new(),
                global_nets: BTreeSet::new(),
            };
            for item in group {
                if item < n {
                    let l = item + 1;
                    cluster.locals.push(l);
                    if let Some(lc) = cell_clusters.local.cluster(l) {
                        cluster.global_nets.extend(lc.global_nets.iter().copied());
                    }
                } else {
                    let key = interned[item - n];
                    cluster.instances.push(key);
                    let child_cell = instances[key.instance].cell;
                    if let Some(c) = self.cells.get(&child_cell).and_then(|c| c.cluster(key.cluster)) {
                        cluster.global_nets.extend(c.global_nets.iter().copied());
                    }
                }
            }
            cluster.instances.sort();
            cell_clusters.insert(cluster);
        }

        tracing::debug!(
            "cell '{}': {} local clusters, {} connected clusters",
            layout.cell(ci).name(),
            n,
            cell_clusters.len()
        );
        self.cells.insert(ci, cell_clusters);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clusters::local::SplitOptions;
    use crate::layout::{Instance, LayerInfo};

    const SPLIT: SplitOptions = SplitOptions {
        area_ratio: 3.0,
        max_vertex_count: 16,
    };

    fn locals_for(layout: &Layout, top: CellIndex, conn: &Connectivity) -> BTreeMap<CellIndex, LocalClusters> {
        let layers = conn.layers();
        layout
            .called_cells(top)
            .into_iter()
            .map(|ci| (ci, LocalClusters::build(layout, ci, conn, &layers, &[], &SPLIT)))
            .collect()
    }

    /// CHILD has two separate wires; TOP places it twice and bridges the
    /// wires of the first instance only.
    fn bridged_twice() -> (Layout, CellIndex, CellIndex, Connectivity) {
        let mut ly = Layout::new(0.001);
        let m1 = ly.insert_layer(LayerInfo::new(1, 0));
        let top = ly.add_cell("TOP");
        let child = ly.add_cell("CHILD");
        ly.insert_shape(child, m1, Rect::new(0, 0, 100, 10));
        ly.insert_shape(child, m1, Rect::new(0, 50, 100, 60));
        ly.insert_instance(top, Instance::new(child, Trans::IDENTITY));
        ly.insert_instance(top, Instance::new(child, Trans::shift(1000, 0)));
        ly.insert_shape(top, m1, Rect::new(40, 0, 50, 60));
        let mut conn = Connectivity::new();
        conn.connect(m1);
        (ly, top, child, conn)
    }

    #[test]
    fn test_bridge_is_scoped_to_instance() {
        let (ly, top, child, conn) = bridged_twice();
        let hier = HierClusters::build(&ly, top, &conn, locals_for(&ly, top, &conn)).unwrap();

        let child_cc = hier.cell(child).unwrap();
        assert_eq!(child_cc.len(), 2);

        let top_cc = hier.cell(top).unwrap();
        let bridge = top_cc.cluster(1).unwrap();
        assert_eq!(
            bridge.instances,
            vec![
                ClusterInstance { instance: 0, cluster: 1 },
                ClusterInstance { instance: 0, cluster: 2 },
            ]
        );
        assert_eq!(top_cc.cluster_of_instance(1, 1), None);
        assert_eq!(top_cc.len(), 1);
    }

    #[test]
    fn test_abutting_instances_join() {
        let (mut ly, top, child, conn) = bridged_twice();
        ly.insert_instance(top, Instance::new(child, Trans::shift(100, 0)));
        let hier = HierClusters::build(&ly, top, &conn, locals_for(&ly, top, &conn)).unwrap();
        let top_cc = hier.cell(top).unwrap();

        // instance 2 abuts instance 0 on both wires, so joins the bridge
        let bridge = top_cc.cluster(1).unwrap();
        assert!(bridge.instances.contains(&ClusterInstance { instance: 2, cluster: 1 }));
        assert!(bridge.instances.contains(&ClusterInstance { instance: 2, cluster: 2 }));
        assert_eq!(top_cc.bbox(), Some(Rect::new(0, 0, 1100, 60)));
    }

    #[test]
    fn test_intermediate_cell_gets_pin_only_cluster() {
        let mut ly = Layout::new(0.001);
        let m1 = ly.insert_layer(LayerInfo::new(1, 0));
        let top = ly.add_cell("TOP");
        let mid = ly.add_cell("MID");
        let leaf = ly.add_cell("LEAF");
        ly.insert_shape(leaf, m1, Rect::new(0, 0, 10, 10));
        ly.insert_instance(mid, Instance::new(leaf, Trans::shift(5, 5)));
        ly.insert_instance(top, Instance::new(mid, Trans::IDENTITY));
        ly.insert_shape(top, m1, Rect::new(15, 15, 30, 30));
        let mut conn = Connectivity::new();
        conn.connect(m1);

        let hier = HierClusters::build(&ly, top, &conn, locals_for(&ly, top, &conn)).unwrap();
        let mid_cc = hier.cell(mid).unwrap();
        assert_eq!(mid_cc.cluster_of_instance(0, 1), Some(1));
        assert!(mid_cc.cluster(1).unwrap().locals.is_empty());

        let top_cc = hier.cell(top).unwrap();
        assert_eq!(top_cc.cluster_of_instance(0, 1), Some(1));
        assert_eq!(top_cc.labels(1), Vec::<&str>::new());
    }

    #[test]
    fn test_global_nets_join_unrelated_clusters() {
        let mut ly = Layout::new(0.001);
        let tie = ly.insert_layer(LayerInfo::new(5, 0));
        let top = ly.add_cell("TOP");
        let a = ly.add_cell("A");
        let b = ly.add_cell("B");
        ly.insert_shape(a, tie, Rect::new(0, 0, 10, 10));
        ly.insert_shape(b, tie, Rect::new(0, 0, 10, 10));
        ly.insert_instance(top, Instance::new(a, Trans::IDENTITY));
        ly.insert_instance(top, Instance::new(b, Trans::shift(5000, 0)));
        let mut conn = Connectivity::new();
        let vdd = conn.connect_global(tie, "VDD");

        let hier = HierClusters::build(&ly, top, &conn, locals_for(&ly, top, &conn)).unwrap();
        let top_cc = hier.cell(top).unwrap();
        assert_eq!(top_cc.len(), 1);
        let joined = top_cc.clusters().next().unwrap();
        assert_eq!(joined.instances.len(), 2);
        assert_eq!(joined.global_nets, BTreeSet::from([vdd]));
    }
}

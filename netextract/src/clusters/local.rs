//! Local clusters: connected shape groups confined to one cell
//!
//! Nodes are the cell's own shapes on connected layers (ascending layer
//! index, then shape index), followed by the device terminal nodes of the
//! cell. Cluster ids start at 1 and follow the smallest node index of each
//! cluster, so numbering never depends on scheduling.

use petgraph::unionfind::UnionFind;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

use crate::connectivity::Connectivity;
use crate::geom::{Point, Polygon, Rect, Shape, Trans};
use crate::layout::{CellIndex, LayerIndex, Layout};

use super::ClusterId;

/// Polygon splitting thresholds
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SplitOptions {
    pub area_ratio: f64,
    pub max_vertex_count: usize,
}

impl SplitOptions {
    fn splits(&self, polygon: &Polygon) -> bool {
        if polygon.vertex_count() > self.max_vertex_count {
            return true;
        }
        let area = polygon.area() as f64;
        area > 0.0 && polygon.bbox().area() as f64 > self.area_ratio * area
    }
}

/// What a node stands for
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum NodeKind {
    /// Shape `index` of the cell's shape list on `layer`
    Shape { layer: LayerIndex, index: usize },
    /// Terminal `terminal` of device `device` (engine device pool index)
    Terminal { device: usize, terminal: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum NodeGeometry {
    Area(Vec<Rect>),
    Point(Point),
}

/// A clustering node
#[derive(Debug, Clone, Serialize)]
pub struct Node {
    pub kind: NodeKind,
    pub layer: LayerIndex,
    pub geometry: NodeGeometry,
    pub bbox: Rect,
    pub label: Option<String>,
    #[serde(skip)]
    split: bool,
}

impl Node {
    pub fn is_terminal(&self) -> bool {
        matches!(self.kind, NodeKind::Terminal { .. })
    }

    pub fn is_text(&self) -> bool {
        matches!(self.geometry, NodeGeometry::Point(_))
    }

    pub fn contains(&self, p: Point) -> bool {
        match &self.geometry {
            NodeGeometry::Area(rects) => rects.iter().any(|r| r.contains(p)),
            NodeGeometry::Point(at) => *at == p,
        }
    }

    pub fn pieces(&self) -> impl Iterator<Item = Piece> + '_ {
        let geometry: Vec<PieceGeometry> = match &self.geometry {
            NodeGeometry::Area(rects) => rects.iter().copied().map(PieceGeometry::Area).collect(),
            NodeGeometry::Point(p) => vec![PieceGeometry::Point(*p)],
        };
        geometry.into_iter().map(move |geometry| Piece {
            layer: self.layer,
            terminal: self.is_terminal(),
            geometry,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceGeometry {
    Area(Rect),
    Point(Point),
}

/// Elementary geometry used in contact tests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Piece {
    pub layer: LayerIndex,
    pub terminal: bool,
    pub geometry: PieceGeometry,
}

impl Piece {
    pub fn bbox(&self) -> Rect {
        match self.geometry {
            PieceGeometry::Area(r) => r,
            PieceGeometry::Point(p) => Rect::at(p),
        }
    }

    pub fn transformed(&self, trans: &Trans) -> Piece {
        let geometry = match self.geometry {
            PieceGeometry::Area(r) => PieceGeometry::Area(r.transformed(trans)),
            PieceGeometry::Point(p) => PieceGeometry::Point(trans.apply(p)),
        };
        Piece { geometry, ..*self }
    }

    /// Connection rule between two pieces
    ///
    /// Terminals never connect to terminals and texts never to texts; all
    /// other pairs need connected layers and closed contact.
    pub fn connects(&self, other: &Piece, conn: &Connectivity) -> bool {
        if self.terminal && other.terminal {
            return false;
        }
        let touching = match (self.geometry, other.geometry) {
            (PieceGeometry::Point(_), PieceGeometry::Point(_)) => false,
            (PieceGeometry::Area(a), PieceGeometry::Area(b)) => a.touches(&b),
            (PieceGeometry::Area(r), PieceGeometry::Point(p))
            | (PieceGeometry::Point(p), PieceGeometry::Area(r)) => r.contains(p),
        };
        touching && conn.interacts(self.layer, other.layer)
    }
}

/// True if any piece of `a` connects to any piece of `b`
pub fn pieces_connect(a: &[Piece], b: &[Piece], conn: &Connectivity) -> bool {
    a.iter().any(|pa| {
        let bb = pa.bbox();
        b.iter()
            .any(|pb| pb.bbox().touches(&bb) && pa.connects(pb, conn))
    })
}

/// Terminal shapes of one device terminal placed in a cell
#[derive(Debug, Clone, Copy)]
pub struct TerminalInput<'a> {
    pub device: usize,
    pub terminal: usize,
    pub layer: LayerIndex,
    pub shapes: &'a [Polygon],
}

/// A connected shape group inside one cell
#[derive(Debug, Clone, Serialize)]
pub struct LocalCluster {
    pub id: ClusterId,
    pub nodes: Vec<usize>,
    pub bbox: Rect,
    pub global_nets: BTreeSet<usize>,
    pub labels: Vec<String>,
}

/// All local clusters of one cell
#[derive(Debug, Clone, Default, Serialize)]
pub struct LocalClusters {
    nodes: Vec<Node>,
    clusters: Vec<LocalCluster>,
    #[serde(skip)]
    node_cluster: Vec<ClusterId>,
}

struct SweepItem {
    node: usize,
    bbox: Rect,
    pieces: Vec<Piece>,
}

impl LocalClusters {
    /// Cluster the own shapes of `cell` on `layers` plus the given terminals
    pub fn build(
        layout: &Layout,
        cell: CellIndex,
        conn: &Connectivity,
        layers: &BTreeSet<LayerIndex>,
        terminals: &[TerminalInput<'_>],
        split: &SplitOptions,
    ) -> Self {
        let mut nodes = Vec::new();
        for &layer in layers {
            for (index, shape) in layout.cell(cell).shapes(layer).iter().enumerate() {
                let kind = NodeKind::Shape { layer, index };
                nodes.push(shape_node(kind, layer, shape, split));
            }
        }
        for t in terminals {
            let rects: Vec<Rect> = t.shapes.iter().flat_map(Polygon::rects).collect();
            let Some(bbox) = Rect::bounding(&rects) else {
                continue;
            };
            nodes.push(Node {
                kind: NodeKind::Terminal {
                    device: t.device,
                    terminal: t.terminal,
                },
                layer: t.layer,
                geometry: NodeGeometry::Area(rects),
                bbox,
                label: None,
                split: true,
            });
        }

        let mut uf = UnionFind::<usize>::new(nodes.len());
        let mut items = sweep_items(&nodes);
        items.sort_by_key(|it| (it.bbox.left, it.node));

        for i in 0..items.len() {
            let a = &items[i];
            for b in &items[i + 1..] {
                if b.bbox.left > a.bbox.right {
                    break;
                }
                if a.node == b.node || !a.bbox.touches(&b.bbox) || uf.equiv(a.node, b.node) {
                    continue;
                }
                if pieces_connect(&a.pieces, &b.pieces, conn) {
                    uf.union(a.node, b.node);
                }
            }
        }

        let mut root_to_id: BTreeMap<usize, ClusterId> = BTreeMap::new();
        let mut clusters: Vec<LocalCluster> = Vec::new();
        let mut node_cluster = Vec::with_capacity(nodes.len());
        for (n, node) in nodes.iter().enumerate() {
            let root = uf.find(n);
            let id = *root_to_id.entry(root).or_insert_with(|| {
                clusters.push(LocalCluster {
                    id: clusters.len() + 1,
                    nodes: Vec::new(),
                    bbox: node.bbox,
                    global_nets: BTreeSet::new(),
                    labels: Vec::new(),
                });
                clusters.len()
            });
            let cluster = &mut clusters[id - 1];
            cluster.nodes.push(n);
            cluster.bbox = cluster.bbox.union(&node.bbox);
            cluster.global_nets.extend(conn.global_nets_of(node.layer));
            if let Some(label) = &node.label {
                cluster.labels.push(label.clone());
            }
            node_cluster.push(id);
        }

        Self {
            nodes,
            clusters,
            node_cluster,
        }
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn clusters(&self) -> &[LocalCluster] {
        &self.clusters
    }

    pub fn cluster(&self, id: ClusterId) -> Option<&LocalCluster> {
        id.checked_sub(1).and_then(|i| self.clusters.get(i))
    }

    pub fn len(&self) -> usize {
        self.clusters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }

    pub fn cluster_of_node(&self, node: usize) -> Option<ClusterId> {
        self.node_cluster.get(node).copied()
    }

    /// Contact geometry of a cluster, optionally restricted to `region`
    pub fn pieces(&self, id: ClusterId, region: Option<&Rect>) -> Vec<Piece> {
        let Some(cluster) = self.cluster(id) else {
            return Vec::new();
        };
        cluster
            .nodes
            .iter()
            .flat_map(|&n| self.nodes[n].pieces())
            .filter(|p| region.map_or(true, |r| p.bbox().touches(r)))
            .collect()
    }

    /// Cluster owning a shape node on `layer` that contains `p`
    pub fn cluster_at(&self, layer: LayerIndex, p: Point) -> Option<ClusterId> {
        self.nodes
            .iter()
            .enumerate()
            .find(|(_, node)| {
                node.layer == layer && !node.is_terminal() && node.bbox.contains(p) && node.contains(p)
            })
            .and_then(|(n, _)| self.cluster_of_node(n))
    }

    /// Bounding box of all clusters
    pub fn bbox(&self) -> Option<Rect> {
        Rect::bounding(self.clusters.iter().map(|c| &c.bbox))
    }
}

fn shape_node(kind: NodeKind, layer: LayerIndex, shape: &Shape, split: &SplitOptions) -> Node {
    match shape {
        Shape::Polygon(polygon) => Node {
            kind,
            layer,
            geometry: NodeGeometry::Area(polygon.rects()),
            bbox: polygon.bbox(),
            label: None,
            split: split.splits(polygon),
        },
        Shape::Text(text) => Node {
            kind,
            layer,
            geometry: NodeGeometry::Point(text.position),
            bbox: Rect::at(text.position),
            label: Some(text.string.clone()),
            split: false,
        },
    }
}

fn sweep_items(nodes: &[Node]) -> Vec<SweepItem> {
    let mut items = Vec::new();
    for (n, node) in nodes.iter().enumerate() {
        if node.split {
            items.extend(node.pieces().map(|p| SweepItem {
                node: n,
                bbox: p.bbox(),
                pieces: vec![p],
            }));
        } else {
            items.push(SweepItem {
                node: n,
                bbox: node.bbox,
                pieces: node.pieces().collect(),
            });
        }
    }
    items
}

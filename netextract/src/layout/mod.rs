//! Hierarchical Layout
//!
//! An in-memory layout database: cells holding per-layer shape lists and
//! instances of other cells. This is the read-only input of the extractor
//! and also the target for net materialization.

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::core::ExtractError;
use crate::geom::{Rect, Shape, Trans};

/// Index of a cell inside its layout
pub type CellIndex = usize;

/// Index of a layer inside its layout
pub type LayerIndex = usize;

/// Layer properties
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct LayerInfo {
    pub layer: u32,
    pub datatype: u32,
    pub name: Option<String>,
}

impl LayerInfo {
    pub fn new(layer: u32, datatype: u32) -> Self {
        Self {
            layer,
            datatype,
            name: None,
        }
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            layer: 0,
            datatype: 0,
            name: Some(name.into()),
        }
    }
}

impl std::fmt::Display for LayerInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} ({}/{})", name, self.layer, self.datatype),
            None => write!(f, "{}/{}", self.layer, self.datatype),
        }
    }
}

/// A placement of a cell inside another cell
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub cell: CellIndex,
    pub trans: Trans,
}

impl Instance {
    pub fn new(cell: CellIndex, trans: Trans) -> Self {
        Self { cell, trans }
    }
}

/// A layout cell
#[derive(Debug, Clone, Default, Serialize)]
pub struct Cell {
    name: String,
    shapes: BTreeMap<LayerIndex, Vec<Shape>>,
    instances: Vec<Instance>,
}

impl Cell {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Shapes on a layer (empty if the layer is unused in this cell)
    pub fn shapes(&self, layer: LayerIndex) -> &[Shape] {
        self.shapes.get(&layer).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn layers(&self) -> impl Iterator<Item = LayerIndex> + '_ {
        self.shapes.keys().copied()
    }

    pub fn instances(&self) -> &[Instance] {
        &self.instances
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty() && self.shapes.values().all(Vec::is_empty)
    }

    pub(crate) fn clear_layer(&mut self, layer: LayerIndex) {
        self.shapes.remove(&layer);
    }
}

/// The hierarchical layout
#[derive(Debug, Clone, Serialize)]
pub struct Layout {
    dbu: f64,
    cells: Vec<Cell>,
    layers: Vec<LayerInfo>,
    #[serde(skip)]
    cell_names: HashMap<String, CellIndex>,
}

impl Default for Layout {
    fn default() -> Self {
        Self::new(0.001)
    }
}

impl Layout {
    /// Create an empty layout with the given database unit (in micrometers)
    pub fn new(dbu: f64) -> Self {
        Self {
            dbu,
            cells: Vec::new(),
            layers: Vec::new(),
            cell_names: HashMap::new(),
        }
    }

    pub fn dbu(&self) -> f64 {
        self.dbu
    }

    pub fn add_cell(&mut self, name: impl Into<String>) -> CellIndex {
        let name = name.into();
        let index = self.cells.len();
        self.cell_names.insert(name.clone(), index);
        self.cells.push(Cell {
            name,
            ..Cell::default()
        });
        index
    }

    /// A cell name not used yet, derived from `base`
    pub fn unique_cell_name(&self, base: &str) -> String {
        if !self.cell_names.contains_key(base) {
            return base.to_string();
        }
        (1..)
            .map(|n| format!("{}${}", base, n))
            .find(|candidate| !self.cell_names.contains_key(candidate))
            .unwrap_or_else(|| base.to_string())
    }

    pub fn cell(&self, index: CellIndex) -> &Cell {
        &self.cells[index]
    }

    pub(crate) fn cell_mut(&mut self, index: CellIndex) -> &mut Cell {
        &mut self.cells[index]
    }

    pub fn try_cell(&self, index: CellIndex) -> Option<&Cell> {
        self.cells.get(index)
    }

    pub fn cell_count(&self) -> usize {
        self.cells.len()
    }

    pub fn cell_by_name(&self, name: &str) -> Option<CellIndex> {
        self.cell_names.get(name).copied()
    }

    pub fn insert_layer(&mut self, info: LayerInfo) -> LayerIndex {
        self.layers.push(info);
        self.layers.len() - 1
    }

    pub fn layer_info(&self, layer: LayerIndex) -> Option<&LayerInfo> {
        self.layers.get(layer)
    }

    pub(crate) fn layer_info_mut(&mut self, layer: LayerIndex) -> Option<&mut LayerInfo> {
        self.layers.get_mut(layer)
    }

    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    /// Find a layer by layer/datatype numbers
    pub fn find_layer(&self, layer: u32, datatype: u32) -> Option<LayerIndex> {
        self.layers
            .iter()
            .position(|l| l.layer == layer && l.datatype == datatype)
    }

    pub fn find_layer_by_name(&self, name: &str) -> Option<LayerIndex> {
        self.layers
            .iter()
            .position(|l| l.name.as_deref() == Some(name))
    }

    pub fn insert_shape(&mut self, cell: CellIndex, layer: LayerIndex, shape: impl Into<Shape>) {
        self.cells[cell]
            .shapes
            .entry(layer)
            .or_default()
            .push(shape.into());
    }

    pub fn insert_shapes(
        &mut self,
        cell: CellIndex,
        layer: LayerIndex,
        shapes: impl IntoIterator<Item = Shape>,
    ) {
        self.cells[cell]
            .shapes
            .entry(layer)
            .or_default()
            .extend(shapes);
    }

    /// Place `instance` into `parent`; no cycle check happens here
    pub fn insert_instance(&mut self, parent: CellIndex, instance: Instance) {
        self.cells[parent].instances.push(instance);
    }

    /// Cells not instantiated anywhere
    pub fn top_cells(&self) -> Vec<CellIndex> {
        let used: BTreeSet<CellIndex> = self
            .cells
            .iter()
            .flat_map(|c| c.instances.iter().map(|i| i.cell))
            .collect();
        (0..self.cells.len()).filter(|c| !used.contains(c)).collect()
    }

    /// All cells reachable from `top` (including `top`), in discovery order
    pub fn called_cells(&self, top: CellIndex) -> Vec<CellIndex> {
        let mut seen = BTreeSet::new();
        let mut order = Vec::new();
        let mut stack = vec![top];
        while let Some(ci) = stack.pop() {
            if !seen.insert(ci) {
                continue;
            }
            order.push(ci);
            for inst in self.cells[ci].instances.iter().rev() {
                if !seen.contains(&inst.cell) {
                    stack.push(inst.cell);
                }
            }
        }
        order
    }

    /// Cells below `top` in parent-before-child order
    ///
    /// Fails with a structural error if the hierarchy contains a cycle.
    pub fn cells_top_down(&self, top: CellIndex) -> Result<Vec<CellIndex>, ExtractError> {
        let reachable = self.called_cells(top);
        let mut graph: DiGraph<CellIndex, ()> = DiGraph::new();
        let mut nodes: BTreeMap<CellIndex, NodeIndex> = BTreeMap::new();
        for &ci in &reachable {
            nodes.insert(ci, graph.add_node(ci));
        }
        for &ci in &reachable {
            for inst in &self.cells[ci].instances {
                graph.add_edge(nodes[&ci], nodes[&inst.cell], ());
            }
        }
        toposort(&graph, None)
            .map(|order| order.into_iter().map(|n| graph[n]).collect())
            .map_err(|cycle| {
                let ci = graph[cycle.node_id()];
                ExtractError::Structural(format!(
                    "cell '{}' is part of a cycle in the instance hierarchy",
                    self.cells[ci].name
                ))
            })
    }

    /// Cells below `top` in child-before-parent order
    pub fn cells_bottom_up(&self, top: CellIndex) -> Result<Vec<CellIndex>, ExtractError> {
        let mut order = self.cells_top_down(top)?;
        order.reverse();
        Ok(order)
    }

    /// Bounding box of a cell including its subtree (None if empty)
    pub fn cell_bbox(&self, cell: CellIndex) -> Result<Option<Rect>, ExtractError> {
        let mut boxes: HashMap<CellIndex, Option<Rect>> = HashMap::new();
        for ci in self.cells_bottom_up(cell)? {
            let c = &self.cells[ci];
            let own = c.shapes.values().flatten().map(Shape::bbox);
            let children = c
                .instances
                .iter()
                .filter_map(|i| boxes.get(&i.cell).copied().flatten().map(|b| b.transformed(&i.trans)));
            let all: Vec<Rect> = own.chain(children).collect();
            boxes.insert(ci, Rect::bounding(&all));
        }
        Ok(boxes.get(&cell).copied().flatten())
    }

    /// Shapes of `cell` and its subtree on `layer`, in `cell` coordinates
    pub fn flat_shapes(&self, cell: CellIndex, layer: LayerIndex) -> Vec<Shape> {
        let mut out = Vec::new();
        self.collect_flat(cell, layer, &Trans::IDENTITY, &mut out, 0);
        out
    }

    fn collect_flat(
        &self,
        cell: CellIndex,
        layer: LayerIndex,
        trans: &Trans,
        out: &mut Vec<Shape>,
        depth: usize,
    ) {
        // guards against cyclic layouts; proper cycle errors come from cells_top_down
        if depth > self.cells.len() {
            return;
        }
        let c = &self.cells[cell];
        out.extend(c.shapes(layer).iter().map(|s| s.transformed(trans)));
        for inst in &c.instances {
            let t = trans.concat(&inst.trans);
            self.collect_flat(inst.cell, layer, &t, out, depth + 1);
        }
    }
}

/// Mapping of cells of one layout to cells of another
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CellMapping {
    map: BTreeMap<CellIndex, CellIndex>,
}

impl CellMapping {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, from: CellIndex, to: CellIndex) {
        self.map.insert(from, to);
    }

    pub fn target_of(&self, from: CellIndex) -> Option<CellIndex> {
        self.map.get(&from).copied()
    }

    pub fn contains(&self, from: CellIndex) -> bool {
        self.map.contains_key(&from)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (CellIndex, CellIndex)> + '_ {
        self.map.iter().map(|(a, b)| (*a, *b))
    }
}

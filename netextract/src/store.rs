//! Deep Layer Store
//!
//! Holds the extractor's private copy of the input hierarchy. Every original
//! or derived layer lives here under a stable internal layer index; callers
//! receive [`Region`] handles that point at those indexes.
//!
//! Ownership model:
//! - a [`Region`] is a reference counted handle owned by the caller
//! - the store keeps a `Weak` back-reference per layer (used for name lookup)
//! - the extractor retains its own `Region` clones for layers it depends on
//! - layers without any live handle are released before clustering

use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crate::core::ExtractError;
use crate::geom::boolean::{not_rects, BoolOp};
use crate::geom::{Polygon, Rect, Shape, Trans};
use crate::layout::{CellIndex, Instance, LayerIndex, LayerInfo, Layout};

static NEXT_STORE_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug)]
struct DeepLayer {
    store: u64,
    index: LayerIndex,
}

/// Caller-side handle of a layer inside the extractor
#[derive(Debug, Clone)]
pub struct Region {
    layer: Arc<DeepLayer>,
}

impl Region {
    pub(crate) fn index(&self) -> LayerIndex {
        self.layer.index
    }

    fn store(&self) -> u64 {
        self.layer.store
    }
}

impl PartialEq for Region {
    fn eq(&self, other: &Self) -> bool {
        self.store() == other.store() && self.index() == other.index()
    }
}

impl Eq for Region {}

/// Which shapes of an original layer a region takes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShapeFilter {
    #[default]
    All,
    Polygons,
    Texts,
}

impl ShapeFilter {
    fn accepts(self, shape: &Shape) -> bool {
        match self {
            ShapeFilter::All => true,
            ShapeFilter::Polygons => !shape.is_text(),
            ShapeFilter::Texts => shape.is_text(),
        }
    }
}

/// Hierarchy-preserving layer store
pub struct DeepLayerStore {
    id: u64,
    source: Arc<Layout>,
    source_top: CellIndex,
    layout: Layout,
    top: Option<CellIndex>,
    /// Source cell -> internal cell
    cell_map: BTreeMap<CellIndex, CellIndex>,
    handles: BTreeMap<LayerIndex, Weak<DeepLayer>>,
    names: BTreeMap<String, LayerIndex>,
    released: BTreeSet<LayerIndex>,
}

impl DeepLayerStore {
    pub fn new(source: Arc<Layout>, top: CellIndex) -> Result<Self, ExtractError> {
        if source.try_cell(top).is_none() {
            return Err(ExtractError::Configuration(format!(
                "top cell index {} does not exist in the input layout",
                top
            )));
        }
        let layout = Layout::new(source.dbu());
        Ok(Self {
            id: NEXT_STORE_ID.fetch_add(1, Ordering::Relaxed),
            source,
            source_top: top,
            layout,
            top: None,
            cell_map: BTreeMap::new(),
            handles: BTreeMap::new(),
            names: BTreeMap::new(),
            released: BTreeSet::new(),
        })
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Internal top cell; `None` until the first layer was made
    pub fn top_cell(&self) -> Option<CellIndex> {
        self.top
    }

    pub fn source(&self) -> &Layout {
        &self.source
    }

    pub fn dbu(&self) -> f64 {
        self.layout.dbu()
    }

    /// Number of layers still holding data
    pub fn live_layer_count(&self) -> usize {
        self.layout.layer_count() - self.released.len()
    }

    fn ensure_hierarchy(&mut self) -> CellIndex {
        if let Some(top) = self.top {
            return top;
        }
        let source = Arc::clone(&self.source);
        let cells = source.called_cells(self.source_top);
        let mut map: BTreeMap<CellIndex, CellIndex> = BTreeMap::new();
        for &ci in &cells {
            let internal = self.layout.add_cell(source.cell(ci).name());
            map.insert(ci, internal);
        }
        for &ci in &cells {
            for inst in source.cell(ci).instances() {
                if let Some(&child) = map.get(&inst.cell) {
                    self.layout
                        .insert_instance(map[&ci], Instance::new(child, inst.trans));
                }
            }
        }
        let top = map[&self.source_top];
        tracing::debug!(
            "copied hierarchy of {} cells below '{}'",
            cells.len(),
            source.cell(self.source_top).name()
        );
        self.top = Some(top);
        self.cell_map = map;
        top
    }

    fn register(&mut self, index: LayerIndex, name: Option<&str>) -> Region {
        let layer = Arc::new(DeepLayer {
            store: self.id,
            index,
        });
        self.handles.insert(index, Arc::downgrade(&layer));
        let region = Region { layer };
        if let Some(name) = name.filter(|n| !n.is_empty()) {
            self.assign_name(index, name);
        }
        region
    }

    fn assign_name(&mut self, index: LayerIndex, name: &str) {
        self.names.retain(|_, v| *v != index);
        self.names.insert(name.to_string(), index);
        if let Some(info) = self.layout.layer_info_mut(index) {
            info.name = Some(name.to_string());
        }
    }

    /// Bring an original layer into the store
    pub fn make_layer(
        &mut self,
        source_layer: LayerIndex,
        filter: ShapeFilter,
        name: Option<&str>,
    ) -> Result<Region, ExtractError> {
        let info = self
            .source
            .layer_info(source_layer)
            .cloned()
            .ok_or_else(|| {
                ExtractError::Configuration(format!(
                    "layer index {} does not exist in the input layout",
                    source_layer
                ))
            })?;
        self.ensure_hierarchy();

        let index = self.layout.insert_layer(LayerInfo { name: None, ..info });
        let source = Arc::clone(&self.source);
        let mut copied = 0usize;
        for (&ci, &internal) in &self.cell_map {
            let shapes: Vec<Shape> = source
                .cell(ci)
                .shapes(source_layer)
                .iter()
                .filter(|s| filter.accepts(s))
                .cloned()
                .collect();
            copied += shapes.len();
            self.layout.insert_shapes(internal, index, shapes);
        }
        tracing::debug!(
            "layer {} -> internal layer {} ({} shapes)",
            source_layer,
            index,
            copied
        );
        Ok(self.register(index, name))
    }

    /// Derive a new layer with a boolean operation, cell by cell
    ///
    /// OR stays cell-local. AND and NOT evaluate each shape of `a` against
    /// the flat `b` geometry around every placement of its cell. Results that
    /// agree across all placements stay in the cell; the others are written
    /// per placement into the top cell.
    pub fn derive(
        &mut self,
        op: BoolOp,
        a: &Region,
        b: &Region,
        pool: &rayon::ThreadPool,
    ) -> Result<Region, ExtractError> {
        let la = self.layer_of(a)?;
        let lb = self.layer_of(b)?;
        let top = self.ensure_hierarchy();
        let order = self.layout.cells_top_down(top)?;

        let layout = &self.layout;
        let results: Vec<(CellIndex, Derived)> = match op {
            BoolOp::Or => pool.install(|| {
                order
                    .par_iter()
                    .map(|&ci| {
                        let a_own = own_polygons(layout, ci, la);
                        let b_own = own_polygons(layout, ci, lb);
                        (ci, Derived::local(op.apply(&a_own, &b_own)))
                    })
                    .collect()
            }),
            BoolOp::And | BoolOp::Not => {
                let placements = placements(layout, top, &order);
                let flat_b: Vec<(Rect, Polygon)> = layout
                    .flat_shapes(top, lb)
                    .iter()
                    .filter_map(Shape::as_polygon)
                    .map(|p| (p.bbox(), p.clone()))
                    .collect();
                pool.install(|| {
                    order
                        .par_iter()
                        .map(|&ci| {
                            let trans = placements.get(&ci).map(Vec::as_slice).unwrap_or(&[]);
                            (ci, derive_in_placements(layout, ci, op, la, trans, &flat_b))
                        })
                        .collect()
                })
            }
        };

        let index = self.layout.insert_layer(LayerInfo::default());
        let mut lifted = 0;
        for (ci, derived) in results {
            self.layout
                .insert_shapes(ci, index, derived.local.into_iter().map(Shape::Polygon));
            lifted += derived.lifted.len();
            self.layout
                .insert_shapes(top, index, derived.lifted.into_iter().map(Shape::Polygon));
        }
        tracing::debug!(
            "derived internal layer {} = {} {} {} ({} polygons lifted to top)",
            index,
            la,
            op,
            lb,
            lifted
        );
        Ok(self.register(index, None))
    }

    /// Resolve a handle to its internal layer index
    pub fn layer_of(&self, region: &Region) -> Result<LayerIndex, ExtractError> {
        if region.store() != self.id {
            return Err(ExtractError::Configuration(
                "layer handle belongs to a different extractor".to_string(),
            ));
        }
        let index = region.index();
        if index >= self.layout.layer_count() || self.released.contains(&index) {
            return Err(ExtractError::Configuration(format!(
                "unknown layer handle (internal layer {})",
                index
            )));
        }
        Ok(index)
    }

    pub fn set_name(&mut self, region: &Region, name: &str) -> Result<(), ExtractError> {
        let index = self.layer_of(region)?;
        self.assign_name(index, name);
        Ok(())
    }

    pub fn name_of(&self, region: &Region) -> Result<Option<&str>, ExtractError> {
        let index = self.layer_of(region)?;
        Ok(self
            .layout
            .layer_info(index)
            .and_then(|info| info.name.as_deref()))
    }

    /// Look a layer up by its formal name, if some handle is still alive
    pub fn region_by_name(&self, name: &str) -> Option<Region> {
        let index = self.names.get(name)?;
        let layer = self.handles.get(index)?.upgrade()?;
        Some(Region { layer })
    }

    /// Drop the shapes of layers nobody references anymore
    ///
    /// Layers in `retained` are kept even without a live caller handle.
    pub fn release_unreferenced(&mut self, retained: &BTreeSet<LayerIndex>) -> usize {
        let dead: Vec<LayerIndex> = self
            .handles
            .iter()
            .filter(|(index, weak)| weak.strong_count() == 0 && !retained.contains(index))
            .map(|(index, _)| *index)
            .collect();
        for &index in &dead {
            self.handles.remove(&index);
            self.names.retain(|_, v| *v != index);
            for ci in 0..self.layout.cell_count() {
                self.layout.cell_mut(ci).clear_layer(index);
            }
            self.released.insert(index);
        }
        if !dead.is_empty() {
            tracing::debug!("released {} unreferenced layers", dead.len());
        }
        dead.len()
    }

    /// Polygons of one cell (own shapes only) on an internal layer
    pub fn cell_polygons(&self, cell: CellIndex, layer: LayerIndex) -> Vec<Polygon> {
        self.layout
            .cell(cell)
            .shapes(layer)
            .iter()
            .filter_map(|s| s.as_polygon().cloned())
            .collect()
    }
}

fn own_polygons(layout: &Layout, cell: CellIndex, layer: LayerIndex) -> Vec<Polygon> {
    layout
        .cell(cell)
        .shapes(layer)
        .iter()
        .filter_map(|s| s.as_polygon().cloned())
        .collect()
}

/// Result of one cell's derivation
#[derive(Default)]
struct Derived {
    /// Polygons in the cell's own frame
    local: Vec<Polygon>,
    /// Polygons in the top frame
    lifted: Vec<Polygon>,
}

impl Derived {
    fn local(local: Vec<Polygon>) -> Self {
        Self {
            local,
            lifted: Vec::new(),
        }
    }
}

/// Every placement of each cell as a transformation into the top frame
fn placements(
    layout: &Layout,
    top: CellIndex,
    top_down: &[CellIndex],
) -> BTreeMap<CellIndex, Vec<Trans>> {
    let mut out: BTreeMap<CellIndex, Vec<Trans>> = BTreeMap::new();
    out.insert(top, vec![Trans::IDENTITY]);
    for &parent in top_down {
        let Some(outer) = out.get(&parent).cloned() else {
            continue;
        };
        for inst in layout.cell(parent).instances() {
            let entry = out.entry(inst.cell).or_default();
            entry.extend(outer.iter().map(|t| t.concat(&inst.trans)));
        }
    }
    out
}

fn derive_in_placements(
    layout: &Layout,
    cell: CellIndex,
    op: BoolOp,
    la: LayerIndex,
    placements: &[Trans],
    flat_b: &[(Rect, Polygon)],
) -> Derived {
    let mut out = Derived::default();
    for shape in own_polygons(layout, cell, la) {
        let mut results: Vec<Vec<Polygon>> = placements
            .iter()
            .map(|t| {
                let reach = shape.bbox().transformed(t);
                let back = t.inverted();
                let nearby: Vec<Polygon> = flat_b
                    .iter()
                    .filter(|(bbox, _)| bbox.touches(&reach))
                    .map(|(_, p)| p.transformed(&back))
                    .collect();
                op.apply(std::slice::from_ref(&shape), &nearby)
            })
            .collect();
        if results.is_empty() {
            continue;
        }
        if results[1..].iter().all(|r| same_area(&results[0], r)) {
            out.local.append(&mut results[0]);
        } else {
            for (t, r) in placements.iter().zip(results) {
                out.lifted.extend(r.iter().map(|p| p.transformed(t)));
            }
        }
    }
    out
}

/// Whether two polygon sets cover the same points
fn same_area(a: &[Polygon], b: &[Polygon]) -> bool {
    let ra: Vec<Rect> = a.iter().flat_map(|p| p.rects()).collect();
    let rb: Vec<Rect> = b.iter().flat_map(|p| p.rects()).collect();
    not_rects(&ra, &rb).is_empty() && not_rects(&rb, &ra).is_empty()
}

//! Extraction engine shared by the library API and the CLI.
//!
//! [`LayoutToNetlist`] drives the stages in order: layer preparation,
//! device extraction, connectivity declaration, netlist extraction and
//! finally queries. Probing and net materialization live in `probe.rs` and
//! `materialize.rs`.

use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;

use rayon::prelude::*;

use crate::clusters::{build_local_clusters, HierClusters, SplitOptions, TerminalInput};
use crate::connectivity::Connectivity;
use crate::devices::{
    CellGeometry, DeviceClass, DeviceExtractor, DeviceRecord, Recognition, TerminalRecord,
};
use crate::geom::boolean::BoolOp;
use crate::layout::{CellIndex, LayerIndex, Layout};
use crate::netlist::{Netlist, NetlistBuilder};
use crate::store::{DeepLayerStore, Region, ShapeFilter};

#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Structural error: {0}")]
    Structural(String),
    #[error("Deck error: {0}")]
    Deck(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

fn default_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn default_area_ratio() -> f64 {
    3.0
}

fn default_max_vertex_count() -> usize {
    16
}

/// Tuning knobs of an extraction run.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct ExtractionOptions {
    /// Worker threads for clustering, derivation and device recognition
    #[serde(default = "default_threads")]
    pub threads: usize,
    /// Polygons whose bounding box exceeds this multiple of their area are split
    #[serde(default = "default_area_ratio")]
    pub area_ratio: f64,
    /// Polygons with more vertexes than this are split
    #[serde(default = "default_max_vertex_count")]
    pub max_vertex_count: usize,
}

impl Default for ExtractionOptions {
    fn default() -> Self {
        Self {
            threads: default_threads(),
            area_ratio: default_area_ratio(),
            max_vertex_count: default_max_vertex_count(),
        }
    }
}

/// Hierarchical layout-to-netlist extractor.
pub struct LayoutToNetlist {
    pub(crate) store: DeepLayerStore,
    pub(crate) conn: Connectivity,
    options: ExtractionOptions,
    /// Layers the engine depends on (connected layers, device inputs)
    dlrefs: BTreeMap<LayerIndex, Region>,
    pub(crate) devices: Vec<DeviceRecord>,
    device_classes: BTreeMap<String, DeviceClass>,
    pub(crate) clusters: Option<HierClusters>,
    pub(crate) netlist: Option<Netlist>,
}

impl LayoutToNetlist {
    /// Create an extractor for the hierarchy below `top`
    pub fn new(layout: Arc<Layout>, top: CellIndex) -> Result<Self, ExtractError> {
        Self::with_options(layout, top, ExtractionOptions::default())
    }

    pub fn with_options(
        layout: Arc<Layout>,
        top: CellIndex,
        options: ExtractionOptions,
    ) -> Result<Self, ExtractError> {
        Ok(Self {
            store: DeepLayerStore::new(layout, top)?,
            conn: Connectivity::new(),
            options,
            dlrefs: BTreeMap::new(),
            devices: Vec::new(),
            device_classes: BTreeMap::new(),
            clusters: None,
            netlist: None,
        })
    }

    pub fn options(&self) -> &ExtractionOptions {
        &self.options
    }

    pub fn set_threads(&mut self, threads: usize) {
        self.options.threads = threads.max(1);
    }

    pub fn threads(&self) -> usize {
        self.options.threads
    }

    pub fn set_area_ratio(&mut self, ratio: f64) {
        self.options.area_ratio = ratio;
    }

    pub fn area_ratio(&self) -> f64 {
        self.options.area_ratio
    }

    pub fn set_max_vertex_count(&mut self, n: usize) {
        self.options.max_vertex_count = n;
    }

    pub fn max_vertex_count(&self) -> usize {
        self.options.max_vertex_count
    }

    fn thread_pool(&self) -> Result<rayon::ThreadPool, ExtractError> {
        rayon::ThreadPoolBuilder::new()
            .num_threads(self.options.threads.max(1))
            .build()
            .map_err(|e| ExtractError::Configuration(format!("cannot create thread pool: {}", e)))
    }

    // ---- layers ----

    /// Original layer with polygons and texts
    pub fn make_layer(&mut self, layer: LayerIndex, name: Option<&str>) -> Result<Region, ExtractError> {
        self.store.make_layer(layer, ShapeFilter::All, name)
    }

    pub fn make_polygon_layer(
        &mut self,
        layer: LayerIndex,
        name: Option<&str>,
    ) -> Result<Region, ExtractError> {
        self.store.make_layer(layer, ShapeFilter::Polygons, name)
    }

    pub fn make_text_layer(
        &mut self,
        layer: LayerIndex,
        name: Option<&str>,
    ) -> Result<Region, ExtractError> {
        self.store.make_layer(layer, ShapeFilter::Texts, name)
    }

    fn derive(&mut self, op: BoolOp, a: &Region, b: &Region) -> Result<Region, ExtractError> {
        let pool = self.thread_pool()?;
        self.store.derive(op, a, b, &pool)
    }

    pub fn and(&mut self, a: &Region, b: &Region) -> Result<Region, ExtractError> {
        self.derive(BoolOp::And, a, b)
    }

    pub fn not(&mut self, a: &Region, b: &Region) -> Result<Region, ExtractError> {
        self.derive(BoolOp::Not, a, b)
    }

    pub fn or(&mut self, a: &Region, b: &Region) -> Result<Region, ExtractError> {
        self.derive(BoolOp::Or, a, b)
    }

    /// Give a layer a formal name
    pub fn name(&mut self, region: &Region, name: &str) -> Result<(), ExtractError> {
        self.store.set_name(region, name)
    }

    pub fn layer_name(&self, region: &Region) -> Result<Option<String>, ExtractError> {
        Ok(self.store.name_of(region)?.map(str::to_string))
    }

    /// Look a layer up by name; `None` once nothing references it anymore
    pub fn layer_by_name(&self, name: &str) -> Option<Region> {
        self.store.region_by_name(name)
    }

    /// Internal layer index of a handle
    pub fn layer_of(&self, region: &Region) -> Result<LayerIndex, ExtractError> {
        self.store.layer_of(region)
    }

    fn retain(&mut self, region: &Region) -> Result<LayerIndex, ExtractError> {
        let index = self.store.layer_of(region)?;
        self.dlrefs.entry(index).or_insert_with(|| region.clone());
        Ok(index)
    }

    // ---- devices ----

    /// Run a device extractor over every cell; returns the number of devices found
    pub fn extract_devices(
        &mut self,
        extractor: &mut dyn DeviceExtractor,
        layers: &BTreeMap<String, Region>,
    ) -> Result<usize, ExtractError> {
        let class = extractor.device_class().clone();
        for role in extractor.layer_roles() {
            if role.required && !layers.contains_key(role.name) {
                return Err(ExtractError::Configuration(format!(
                    "device extractor '{}' requires layer '{}' ({})",
                    class.name, role.name, role.description
                )));
            }
        }

        let mut role_layers: BTreeMap<String, LayerIndex> = BTreeMap::new();
        for (role, region) in layers {
            if !extractor.layer_roles().iter().any(|r| r.name == role) {
                tracing::warn!(
                    "device extractor '{}' ignores unknown layer '{}'",
                    class.name,
                    role
                );
                continue;
            }
            let index = self.retain(region)?;
            role_layers.insert(role.clone(), index);
        }

        let top = self.store.top_cell().ok_or_else(|| {
            ExtractError::Configuration("no layers have been created yet".to_string())
        })?;
        let started = Instant::now();
        let layout = self.store.layout();
        let order = layout.cells_bottom_up(top)?;
        let dbu = layout.dbu();

        let pool = self.thread_pool()?;
        let shared: &dyn DeviceExtractor = &*extractor;
        let store = &self.store;
        let results: Vec<(CellIndex, Recognition)> = pool.install(|| {
            order
                .par_iter()
                .map(|&ci| {
                    let geometry = CellGeometry {
                        cell_name: layout.cell(ci).name().to_string(),
                        dbu,
                        layers: role_layers
                            .iter()
                            .map(|(role, &l)| (role.clone(), store.cell_polygons(ci, l)))
                            .collect(),
                    };
                    let recognition = if geometry.is_empty() {
                        Recognition::default()
                    } else {
                        shared.recognize(&geometry)
                    };
                    (ci, recognition)
                })
                .collect()
        });

        let mut found = 0usize;
        for (ci, recognition) in results {
            for occurrence in recognition.devices {
                let terminals = occurrence
                    .terminals
                    .into_iter()
                    .filter_map(|t| {
                        let layer = role_layers.get(&t.role).copied()?;
                        Some(TerminalRecord {
                            name: t.terminal,
                            layer,
                            shapes: t.shapes,
                        })
                    })
                    .collect();
                self.devices.push(DeviceRecord {
                    class: class.name.clone(),
                    cell: ci,
                    parameters: occurrence.parameters,
                    terminals,
                });
                found += 1;
            }
            for error in recognition.errors {
                tracing::warn!("{}: {}", class.name, error);
                extractor.push_error(error);
            }
        }

        tracing::info!(
            "extracted {} '{}' devices in {:.2?}",
            found,
            class.name,
            started.elapsed()
        );
        self.device_classes.entry(class.name.clone()).or_insert(class);
        Ok(found)
    }

    // ---- connectivity ----

    /// Shapes on `region` connect to each other
    pub fn connect(&mut self, region: &Region) -> Result<(), ExtractError> {
        let l = self.retain(region)?;
        self.conn.connect(l);
        Ok(())
    }

    /// Shapes on `a` connect to shapes on `b`
    pub fn connect_layers(&mut self, a: &Region, b: &Region) -> Result<(), ExtractError> {
        let la = self.retain(a)?;
        let lb = self.retain(b)?;
        self.conn.connect_layers(la, lb);
        Ok(())
    }

    /// Bind every shape on `region` to the global net `name`
    pub fn connect_global(&mut self, region: &Region, name: &str) -> Result<usize, ExtractError> {
        let l = self.retain(region)?;
        Ok(self.conn.connect_global(l, name))
    }

    pub fn global_net_name(&self, id: usize) -> Result<&str, ExtractError> {
        self.conn
            .global_net_name(id)
            .ok_or_else(|| ExtractError::Configuration(format!("unknown global net id {}", id)))
    }

    pub fn global_net_id(&self, name: &str) -> Result<usize, ExtractError> {
        self.conn
            .global_net_id(name)
            .ok_or_else(|| ExtractError::Configuration(format!("unknown global net '{}'", name)))
    }

    pub fn connectivity(&self) -> &Connectivity {
        &self.conn
    }

    // ---- extraction ----

    /// Build the cluster hierarchy and the netlist (once)
    pub fn extract_netlist(&mut self) -> Result<(), ExtractError> {
        if self.netlist.is_some() {
            return Err(ExtractError::Configuration(
                "the netlist has already been extracted".to_string(),
            ));
        }
        let top = self.store.top_cell().ok_or_else(|| {
            ExtractError::Configuration("no layers have been created yet".to_string())
        })?;
        if self.conn.is_empty() {
            return Err(ExtractError::Configuration(
                "no connected layers have been declared".to_string(),
            ));
        }

        let retained: BTreeSet<LayerIndex> =
            self.dlrefs.keys().copied().chain(self.conn.layers()).collect();
        self.store.release_unreferenced(&retained);

        let started = Instant::now();
        let pool = self.thread_pool()?;
        let layout = self.store.layout();
        let order = layout.cells_bottom_up(top)?;

        let mut terminals: BTreeMap<CellIndex, Vec<TerminalInput<'_>>> = BTreeMap::new();
        for (device, record) in self.devices.iter().enumerate() {
            for (terminal, t) in record.terminals.iter().enumerate() {
                terminals.entry(record.cell).or_default().push(TerminalInput {
                    device,
                    terminal,
                    layer: t.layer,
                    shapes: &t.shapes,
                });
            }
        }

        let split = SplitOptions {
            area_ratio: self.options.area_ratio,
            max_vertex_count: self.options.max_vertex_count,
        };
        let locals = build_local_clusters(layout, &order, &self.conn, &terminals, &split, &pool);
        tracing::info!(
            "local clusters of {} cells computed on {} threads in {:.2?}",
            order.len(),
            self.options.threads,
            started.elapsed()
        );

        let clusters = HierClusters::build(layout, top, &self.conn, locals)?;
        let netlist = NetlistBuilder::new(layout, &clusters, &self.conn, &self.devices)
            .build(self.device_classes.values().cloned())?;
        tracing::info!("netlist extracted in {:.2?}", started.elapsed());

        self.clusters = Some(clusters);
        self.netlist = Some(netlist);
        Ok(())
    }

    pub fn has_netlist(&self) -> bool {
        self.netlist.is_some()
    }

    pub fn netlist(&self) -> Result<&Netlist, ExtractError> {
        self.netlist.as_ref().ok_or_else(not_extracted)
    }

    /// Mutable access, e.g. for purging
    pub fn netlist_mut(&mut self) -> Result<&mut Netlist, ExtractError> {
        self.netlist.as_mut().ok_or_else(not_extracted)
    }

    pub fn net_clusters(&self) -> Result<&HierClusters, ExtractError> {
        self.clusters.as_ref().ok_or_else(not_extracted)
    }

    /// The engine's private copy of the hierarchy
    pub fn internal_layout(&self) -> &Layout {
        self.store.layout()
    }

    pub fn internal_top_cell(&self) -> Option<CellIndex> {
        self.store.top_cell()
    }

    pub fn device_records(&self) -> &[DeviceRecord] {
        &self.devices
    }
}

fn not_extracted() -> ExtractError {
    ExtractError::Configuration("the netlist has not been extracted yet".to_string())
}

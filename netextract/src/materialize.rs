//! Net materialization
//!
//! Renders the geometry of nets into a target layout, either flattened or
//! with one sub-cell per circuit part, and maps internal cells onto target
//! cells.

use std::collections::{BTreeMap, BTreeSet};

use crate::clusters::{ClusterId, HierClusters, LocalClusters, NodeKind};
use crate::core::{ExtractError, LayoutToNetlist};
use crate::geom::{Shape, Trans};
use crate::layout::{CellIndex, CellMapping, Instance, LayerIndex, Layout};
use crate::netlist::{DeviceId, Net, NetRef, Netlist};
use crate::store::Region;

/// Naming of the cells net materialization creates
///
/// - `net_cell_prefix`: ([`LayoutToNetlist::build_all_nets`] only) put each
///   net into its own cell `prefix + net name`
/// - `circuit_cell_prefix`: keep the hierarchy, one cell per circuit part
///   named `prefix + circuit name`; without it sub-circuit parts are flattened
/// - `device_cell_prefix`: emit device terminal shapes into per-device cells
///   named `prefix + device name`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetBuildOptions {
    pub net_cell_prefix: Option<String>,
    pub circuit_cell_prefix: Option<String>,
    pub device_cell_prefix: Option<String>,
}

impl NetBuildOptions {
    pub fn flat() -> Self {
        Self::default()
    }

    pub fn with_net_cells(mut self, prefix: &str) -> Self {
        self.net_cell_prefix = Some(prefix.to_string());
        self
    }

    pub fn with_circuit_cells(mut self, prefix: &str) -> Self {
        self.circuit_cell_prefix = Some(prefix.to_string());
        self
    }

    pub fn with_device_cells(mut self, prefix: &str) -> Self {
        self.device_cell_prefix = Some(prefix.to_string());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Descend {
    /// Own shapes only
    Local,
    /// Sub-circuit parts merged into the same target cell
    Flatten,
    /// One target cell per (cell, cluster)
    SubCells,
}

/// Target cells created so far, reused by later writes of the same run
#[derive(Default)]
struct CellCache {
    /// (internal cell, cluster) -> circuit part cell
    parts: BTreeMap<(CellIndex, ClusterId), CellIndex>,
    /// (internal cell, device) -> device cell
    devices: BTreeMap<(CellIndex, DeviceId), CellIndex>,
}

/// Read-only state of one materialization run
struct NetWriter<'a> {
    engine: &'a LayoutToNetlist,
    clusters: &'a HierClusters,
    netlist: &'a Netlist,
    /// (target layer, internal layer)
    layers: Vec<(LayerIndex, LayerIndex)>,
    options: &'a NetBuildOptions,
    descend: Descend,
}

impl NetWriter<'_> {
    fn layout(&self) -> &Layout {
        self.engine.internal_layout()
    }

    fn write(
        &self,
        cell: CellIndex,
        cluster: ClusterId,
        target: &mut Layout,
        target_cell: CellIndex,
        trans: &Trans,
        cache: &mut CellCache,
    ) {
        let Some(cc) = self.clusters.cell(cell) else {
            return;
        };
        let Some(connected) = cc.cluster(cluster) else {
            return;
        };

        for &(target_layer, layer) in &self.layers {
            let shapes = local_shapes(self.layout(), cc.local(), cell, &connected.locals, layer);
            target.insert_shapes(
                target_cell,
                target_layer,
                shapes.iter().map(|s| s.transformed(trans)),
            );
        }

        self.write_devices(cell, cluster, target, target_cell, trans, cache);

        if self.descend == Descend::Local {
            return;
        }
        for child in &connected.instances {
            let Some(inst) = self.layout().cell(cell).instances().get(child.instance) else {
                continue;
            };
            let child_trans = trans.concat(&inst.trans);
            match (&self.options.circuit_cell_prefix, self.descend) {
                (Some(prefix), Descend::SubCells) => {
                    let key = (inst.cell, child.cluster);
                    let sub = match cache.parts.get(&key) {
                        Some(&sub) => sub,
                        None => {
                            let base = format!("{}{}", prefix, self.layout().cell(inst.cell).name());
                            let sub = target.add_cell(target.unique_cell_name(&base));
                            cache.parts.insert(key, sub);
                            self.write(inst.cell, child.cluster, target, sub, &Trans::IDENTITY, cache);
                            sub
                        }
                    };
                    target.insert_instance(target_cell, Instance::new(sub, child_trans));
                }
                _ => self.write(inst.cell, child.cluster, target, target_cell, &child_trans, cache),
            }
        }
    }

    /// Reference the devices of `cell` attached to `cluster`
    ///
    /// Each device gets one cell holding all of its terminal shapes, created
    /// on first use. Every net touching the device instantiates that cell.
    fn write_devices(
        &self,
        cell: CellIndex,
        cluster: ClusterId,
        target: &mut Layout,
        target_cell: CellIndex,
        trans: &Trans,
        cache: &mut CellCache,
    ) {
        let Some(prefix) = &self.options.device_cell_prefix else {
            return;
        };
        let Some(circuit) = self.netlist.circuit(cell) else {
            return;
        };
        for device in circuit.devices.values() {
            if !device.terminals.values().any(|&net| net == cluster) {
                continue;
            }
            let dc = match cache.devices.get(&(cell, device.id)) {
                Some(&dc) => dc,
                None => {
                    let Some(record) = self.engine.device_records().get(device.record) else {
                        continue;
                    };
                    let name = target.unique_cell_name(&format!("{}{}", prefix, device.name));
                    let dc = target.add_cell(name);
                    for t in &record.terminals {
                        for &(target_layer, layer) in &self.layers {
                            if layer == t.layer {
                                target.insert_shapes(
                                    dc,
                                    target_layer,
                                    t.shapes.iter().cloned().map(Shape::Polygon),
                                );
                            }
                        }
                    }
                    cache.devices.insert((cell, device.id), dc);
                    dc
                }
            };
            target.insert_instance(target_cell, Instance::new(dc, *trans));
        }
    }
}

fn local_shapes(
    layout: &Layout,
    local: &LocalClusters,
    cell: CellIndex,
    locals: &[ClusterId],
    layer: LayerIndex,
) -> Vec<Shape> {
    let shapes = layout.cell(cell).shapes(layer);
    let mut out = Vec::new();
    for &l in locals {
        let Some(lc) = local.cluster(l) else {
            continue;
        };
        for &n in &lc.nodes {
            if let NodeKind::Shape { layer: nl, index } = local.nodes()[n].kind {
                if nl == layer {
                    if let Some(s) = shapes.get(index) {
                        out.push(s.clone());
                    }
                }
            }
        }
    }
    out
}

impl LayoutToNetlist {
    fn checked_net(&self, net: NetRef) -> Result<&Net, ExtractError> {
        self.netlist()?.net(net).ok_or_else(|| {
            ExtractError::Configuration(format!(
                "unknown net {} in circuit {}",
                net.net, net.circuit
            ))
        })
    }

    fn layer_map(
        &self,
        lmap: &BTreeMap<LayerIndex, Region>,
    ) -> Result<Vec<(LayerIndex, LayerIndex)>, ExtractError> {
        lmap.iter()
            .map(|(target, region)| Ok((*target, self.layer_of(region)?)))
            .collect()
    }

    fn writer<'a>(
        &'a self,
        lmap: &BTreeMap<LayerIndex, Region>,
        options: &'a NetBuildOptions,
        descend: Descend,
    ) -> Result<NetWriter<'a>, ExtractError> {
        Ok(NetWriter {
            engine: self,
            clusters: self.net_clusters()?,
            netlist: self.netlist()?,
            layers: self.layer_map(lmap)?,
            options,
            descend,
        })
    }

    /// Shapes of a net on one layer, in the net's circuit coordinates
    ///
    /// With `recursive` the parts inside sub-circuits are included,
    /// transformed into the circuit.
    pub fn shapes_of_net(
        &self,
        net: NetRef,
        region: &Region,
        recursive: bool,
    ) -> Result<Vec<Shape>, ExtractError> {
        self.checked_net(net)?;
        let clusters = self.net_clusters()?;
        let layer = self.layer_of(region)?;
        let layout = self.internal_layout();

        let mut out = Vec::new();
        let mut stack = vec![(net.circuit, net.net, Trans::IDENTITY)];
        while let Some((cell, cluster, trans)) = stack.pop() {
            let Some(cc) = clusters.cell(cell) else {
                continue;
            };
            let Some(connected) = cc.cluster(cluster) else {
                continue;
            };
            out.extend(
                local_shapes(layout, cc.local(), cell, &connected.locals, layer)
                    .iter()
                    .map(|s| s.transformed(&trans)),
            );
            if recursive {
                for child in connected.instances.iter().rev() {
                    if let Some(inst) = layout.cell(cell).instances().get(child.instance) {
                        stack.push((inst.cell, child.cluster, trans.concat(&inst.trans)));
                    }
                }
            }
        }
        Ok(out)
    }

    /// Copy one net into `target_cell` of `target`
    ///
    /// `lmap` maps target layers to the layers to copy. Sub-circuit parts are
    /// flattened unless a circuit cell prefix is given.
    pub fn build_net(
        &self,
        net: NetRef,
        target: &mut Layout,
        target_cell: CellIndex,
        lmap: &BTreeMap<LayerIndex, Region>,
        options: &NetBuildOptions,
    ) -> Result<(), ExtractError> {
        self.checked_net(net)?;
        if target.try_cell(target_cell).is_none() {
            return Err(ExtractError::Configuration(format!(
                "target cell {} does not exist",
                target_cell
            )));
        }
        let descend = if options.circuit_cell_prefix.is_some() {
            Descend::SubCells
        } else {
            Descend::Flatten
        };
        let writer = self.writer(lmap, options, descend)?;
        let mut cache = CellCache::default();
        writer.write(net.circuit, net.net, target, target_cell, &Trans::IDENTITY, &mut cache);
        Ok(())
    }

    /// Copy every net into the target cells given by `cmap`
    ///
    /// Without a circuit cell prefix each net contributes its own shapes to
    /// its circuit's cell. With one, nets with pins are skipped since their
    /// parent nets render them.
    pub fn build_all_nets(
        &self,
        cmap: &CellMapping,
        target: &mut Layout,
        lmap: &BTreeMap<LayerIndex, Region>,
        options: &NetBuildOptions,
    ) -> Result<(), ExtractError> {
        let descend = if options.circuit_cell_prefix.is_some() {
            Descend::SubCells
        } else {
            Descend::Local
        };
        let writer = self.writer(lmap, options, descend)?;
        let netlist = writer.netlist;
        let mut cache = CellCache::default();
        let mut written = 0usize;

        for id in netlist.circuits_bottom_up() {
            let (Some(circuit), Some(mapped)) = (netlist.circuit(id), cmap.target_of(id)) else {
                continue;
            };
            for net in circuit.nets.values() {
                if descend == Descend::SubCells && !net.pins.is_empty() {
                    continue;
                }
                let cell = match &options.net_cell_prefix {
                    Some(prefix) => {
                        let name = target.unique_cell_name(&format!("{}{}", prefix, net.expanded_name()));
                        let nc = target.add_cell(name);
                        target.insert_instance(mapped, Instance::new(nc, Trans::IDENTITY));
                        nc
                    }
                    None => mapped,
                };
                writer.write(id, net.id, target, cell, &Trans::IDENTITY, &mut cache);
                written += 1;
            }
        }
        tracing::info!("materialized {} nets", written);
        Ok(())
    }

    /// Map internal cells onto `target`, creating missing cells by name
    ///
    /// The internal top cell maps to `target_cell`. Cells created here get
    /// instances in their (mapped) parents, with the original placement.
    pub fn cell_mapping_into(
        &self,
        target: &mut Layout,
        target_cell: CellIndex,
    ) -> Result<CellMapping, ExtractError> {
        let top = self.mapping_top(target, target_cell)?;
        let layout = self.internal_layout();
        let order = layout.cells_top_down(top)?;

        let mut cmap = CellMapping::new();
        let mut created = BTreeSet::new();
        for &ci in &order {
            if ci == top {
                cmap.insert(ci, target_cell);
                continue;
            }
            let name = layout.cell(ci).name();
            let mapped = match target.cell_by_name(name) {
                Some(existing) => existing,
                None => {
                    created.insert(ci);
                    target.add_cell(name)
                }
            };
            cmap.insert(ci, mapped);
        }

        for &ci in &order {
            let Some(parent) = cmap.target_of(ci) else {
                continue;
            };
            for inst in layout.cell(ci).instances() {
                if !created.contains(&inst.cell) {
                    continue;
                }
                if let Some(child) = cmap.target_of(inst.cell) {
                    target.insert_instance(parent, Instance::new(child, inst.trans));
                }
            }
        }
        tracing::debug!("cell mapping: {} cells, {} created", cmap.len(), created.len());
        Ok(cmap)
    }

    /// Map internal cells onto existing `target` cells by name only
    pub fn const_cell_mapping_into(
        &self,
        target: &Layout,
        target_cell: CellIndex,
    ) -> Result<CellMapping, ExtractError> {
        let top = self.mapping_top(target, target_cell)?;
        let layout = self.internal_layout();
        let mut cmap = CellMapping::new();
        for ci in layout.called_cells(top) {
            if ci == top {
                cmap.insert(ci, target_cell);
            } else if let Some(mapped) = target.cell_by_name(layout.cell(ci).name()) {
                cmap.insert(ci, mapped);
            }
        }
        Ok(cmap)
    }

    fn mapping_top(&self, target: &Layout, target_cell: CellIndex) -> Result<CellIndex, ExtractError> {
        if target.try_cell(target_cell).is_none() {
            return Err(ExtractError::Configuration(format!(
                "target cell {} does not exist",
                target_cell
            )));
        }
        self.internal_top_cell().ok_or_else(|| {
            ExtractError::Configuration("no layers have been created yet".to_string())
        })
    }
}

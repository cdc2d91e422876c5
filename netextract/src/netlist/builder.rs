//! Netlist builder
//!
//! Turns the cluster hierarchy and the device pool into circuits, bottom-up:
//! - one net per connected cluster of the cell
//! - devices bound through their terminal nodes
//! - a sub-circuit per instance; wherever a cluster includes a child
//!   cluster, the child net gets a pin and the sub-circuit binds it

use std::collections::{BTreeMap, HashMap};

use crate::clusters::{CellClusters, ClusterId, ConnectedCluster, HierClusters, NodeKind};
use crate::connectivity::Connectivity;
use crate::core::ExtractError;
use crate::devices::{DeviceClass, DeviceRecord};
use crate::layout::{CellIndex, Layout};

use super::{Circuit, Device, Net, NetSubcircuitPinRef, NetTerminalRef, Netlist, SubCircuit};

pub struct NetlistBuilder<'a> {
    layout: &'a Layout,
    clusters: &'a HierClusters,
    conn: &'a Connectivity,
    devices: &'a [DeviceRecord],
}

impl<'a> NetlistBuilder<'a> {
    pub fn new(
        layout: &'a Layout,
        clusters: &'a HierClusters,
        conn: &'a Connectivity,
        devices: &'a [DeviceRecord],
    ) -> Self {
        Self {
            layout,
            clusters,
            conn,
            devices,
        }
    }

    pub fn build(
        &self,
        classes: impl IntoIterator<Item = DeviceClass>,
    ) -> Result<Netlist, ExtractError> {
        let top = self.clusters.top_cell();
        let order = self.layout.cells_bottom_up(top)?;

        let mut netlist = Netlist::new();
        for class in classes {
            netlist.add_device_class(class);
        }
        netlist.top = Some(top);

        let mut devices_by_cell: BTreeMap<CellIndex, Vec<usize>> = BTreeMap::new();
        for (index, record) in self.devices.iter().enumerate() {
            devices_by_cell.entry(record.cell).or_default().push(index);
        }

        let empty = CellClusters::default();
        for ci in order {
            let cc = self.clusters.cell(ci).unwrap_or(&empty);
            let pooled = devices_by_cell.get(&ci).map(Vec::as_slice).unwrap_or(&[]);
            let circuit = self.build_circuit(ci, cc, pooled, &mut netlist);
            netlist.circuits.insert(ci, circuit);
        }

        tracing::info!(
            "netlist built: {} circuits, {} devices",
            netlist.circuits.len(),
            netlist.device_count()
        );
        Ok(netlist)
    }

    fn net_name(&self, cc: &CellClusters, cluster: &ConnectedCluster) -> Option<String> {
        if let Some(label) = cc.labels(cluster.id).first() {
            return Some(label.to_string());
        }
        cluster
            .global_nets
            .iter()
            .find_map(|&g| self.conn.global_net_name(g))
            .map(str::to_string)
    }

    fn build_circuit(
        &self,
        ci: CellIndex,
        cc: &CellClusters,
        pooled: &[usize],
        netlist: &mut Netlist,
    ) -> Circuit {
        let cell = self.layout.cell(ci);
        let mut circuit = Circuit::new(ci, cell.name());

        for cluster in cc.clusters() {
            circuit
                .nets
                .insert(cluster.id, Net::new(cluster.id, self.net_name(cc, cluster)));
        }

        let mut terminal_net: HashMap<(usize, usize), ClusterId> = HashMap::new();
        let local = cc.local();
        for (n, node) in local.nodes().iter().enumerate() {
            if let NodeKind::Terminal { device, terminal } = node.kind {
                let net = local
                    .cluster_of_node(n)
                    .and_then(|l| cc.cluster_of_local(l));
                if let Some(net) = net {
                    terminal_net.insert((device, terminal), net);
                }
            }
        }

        for (k, &record_index) in pooled.iter().enumerate() {
            let record = &self.devices[record_index];
            let id = k + 1;
            let mut terminals = BTreeMap::new();
            for (ti, t) in record.terminals.iter().enumerate() {
                let Some(&net) = terminal_net.get(&(record_index, ti)) else {
                    continue;
                };
                terminals.insert(t.name.clone(), net);
                if let Some(n) = circuit.nets.get_mut(&net) {
                    n.terminals.push(NetTerminalRef {
                        device: id,
                        terminal: t.name.clone(),
                    });
                }
            }
            circuit.devices.insert(
                id,
                Device {
                    id,
                    name: format!("${}", id),
                    class: record.class.clone(),
                    parameters: record.parameters.clone(),
                    terminals,
                    record: record_index,
                },
            );
        }

        for (ii, inst) in cell.instances().iter().enumerate() {
            circuit.subcircuits.insert(
                ii,
                SubCircuit {
                    id: ii,
                    name: format!("${}", ii + 1),
                    circuit: inst.cell,
                    trans: inst.trans,
                    pins: BTreeMap::new(),
                },
            );
        }

        for cluster in cc.clusters() {
            for child in &cluster.instances {
                let Some(inst) = cell.instances().get(child.instance) else {
                    continue;
                };
                let Some(pin) = netlist
                    .circuit_mut(inst.cell)
                    .and_then(|c| c.ensure_pin(child.cluster))
                else {
                    continue;
                };
                if let Some(sc) = circuit.subcircuits.get_mut(&child.instance) {
                    sc.pins.insert(pin, cluster.id);
                }
                if let Some(n) = circuit.nets.get_mut(&cluster.id) {
                    n.subcircuit_pins.push(NetSubcircuitPinRef {
                        subcircuit: child.instance,
                        pin,
                    });
                }
            }
        }

        tracing::debug!(
            "circuit '{}': {} nets, {} devices, {} subcircuits",
            circuit.name,
            circuit.nets.len(),
            circuit.devices.len(),
            circuit.subcircuits.len()
        );
        circuit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clusters::{LocalClusters, SplitOptions, TerminalInput};
    use crate::geom::{Point, Polygon, Rect, Text, Trans};
    use crate::layout::{Instance, LayerInfo};

    #[test]
    fn test_child_pins_and_device_terminals() {
        let mut ly = Layout::new(0.001);
        let m1 = ly.insert_layer(LayerInfo::new(1, 0));
        let top = ly.add_cell("TOP");
        let child = ly.add_cell("CHILD");
        ly.insert_shape(child, m1, Rect::new(0, 0, 100, 10));
        ly.insert_instance(top, Instance::new(child, Trans::IDENTITY));
        ly.insert_shape(top, m1, Rect::new(100, 0, 200, 10));
        ly.insert_shape(top, m1, Text::new("OUT", Point::new(150, 5)));

        let mut conn = Connectivity::new();
        conn.connect(m1);

        let records = vec![DeviceRecord {
            class: "RES".into(),
            cell: child,
            parameters: BTreeMap::new(),
            terminals: vec![crate::devices::TerminalRecord {
                name: "A".into(),
                layer: m1,
                shapes: vec![Polygon::from_rect(Rect::new(0, 0, 10, 10))],
            }],
        }];
        let split = SplitOptions { area_ratio: 3.0, max_vertex_count: 16 };
        let layers = conn.layers();
        let terminal = [TerminalInput {
            device: 0,
            terminal: 0,
            layer: m1,
            shapes: &records[0].terminals[0].shapes,
        }];
        let mut locals = BTreeMap::new();
        locals.insert(top, LocalClusters::build(&ly, top, &conn, &layers, &[], &split));
        locals.insert(child, LocalClusters::build(&ly, child, &conn, &layers, &terminal, &split));
        let hier = HierClusters::build(&ly, top, &conn, locals).unwrap();

        let nl = NetlistBuilder::new(&ly, &hier, &conn, &records)
            .build([DeviceClass::new("RES")])
            .unwrap();

        let c = nl.circuit_by_name("CHILD").unwrap();
        assert_eq!(c.devices.len(), 1);
        assert_eq!(c.devices[&1].net_for_terminal("A"), Some(1));
        assert_eq!(c.pins.len(), 1);

        let t = nl.top_circuit().unwrap();
        let out = t.net_by_name("OUT").unwrap();
        assert_eq!(out.subcircuit_pins, vec![NetSubcircuitPinRef { subcircuit: 0, pin: 0 }]);
        assert_eq!(t.subcircuits[&0].net_for_pin(0), Some(out.id));
    }
}

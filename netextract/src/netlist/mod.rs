//! Netlist
//!
//! The extracted circuit graph: one [`Circuit`] per cell holding nets,
//! devices, pins and sub-circuits. Net ids are the cluster ids of the cell
//! the circuit was built from, sub-circuit ids are the instance indexes of
//! that cell.

pub mod builder;

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::devices::DeviceClass;
use crate::geom::Trans;
use crate::layout::CellIndex;

pub use builder::NetlistBuilder;

/// Circuit id: the index of the cell it was built from
pub type CircuitId = CellIndex;
/// Net id: the cluster id inside the circuit's cell
pub type NetId = usize;
pub type DeviceId = usize;
/// Sub-circuit id: the instance index inside the parent cell
pub type SubCircuitId = usize;
pub type PinId = usize;

/// Reference to a net of a specific circuit
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct NetRef {
    pub circuit: CircuitId,
    pub net: NetId,
}

impl NetRef {
    pub fn new(circuit: CircuitId, net: NetId) -> Self {
        Self { circuit, net }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct NetTerminalRef {
    pub device: DeviceId,
    pub terminal: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct NetSubcircuitPinRef {
    pub subcircuit: SubCircuitId,
    pub pin: PinId,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Net {
    pub id: NetId,
    pub name: Option<String>,
    pub terminals: Vec<NetTerminalRef>,
    pub pins: Vec<PinId>,
    pub subcircuit_pins: Vec<NetSubcircuitPinRef>,
}

impl Net {
    pub fn new(id: NetId, name: Option<String>) -> Self {
        Self {
            id,
            name,
            terminals: Vec::new(),
            pins: Vec::new(),
            subcircuit_pins: Vec::new(),
        }
    }

    /// Name for display; unnamed nets show as `$<id>`
    pub fn expanded_name(&self) -> String {
        match &self.name {
            Some(n) => n.clone(),
            None => format!("${}", self.id),
        }
    }

    /// No device terminal and no sub-circuit pin attached
    pub fn is_passive(&self) -> bool {
        self.terminals.is_empty() && self.subcircuit_pins.is_empty()
    }

    /// Attached to nothing at all
    pub fn is_floating(&self) -> bool {
        self.is_passive() && self.pins.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Pin {
    pub id: PinId,
    pub name: String,
    pub net: NetId,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Device {
    pub id: DeviceId,
    pub name: String,
    pub class: String,
    pub parameters: BTreeMap<String, f64>,
    /// Terminal name -> net; unconnected terminals are absent
    pub terminals: BTreeMap<String, NetId>,
    /// Index into the extractor's device pool
    #[serde(skip)]
    pub(crate) record: usize,
}

impl Device {
    pub fn parameter(&self, name: &str) -> Option<f64> {
        self.parameters.get(name).copied()
    }

    pub fn net_for_terminal(&self, terminal: &str) -> Option<NetId> {
        self.terminals.get(terminal).copied()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubCircuit {
    pub id: SubCircuitId,
    pub name: String,
    pub circuit: CircuitId,
    pub trans: Trans,
    /// Pin of the referenced circuit -> net of the parent circuit
    pub pins: BTreeMap<PinId, NetId>,
}

impl SubCircuit {
    pub fn net_for_pin(&self, pin: PinId) -> Option<NetId> {
        self.pins.get(&pin).copied()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Circuit {
    pub id: CircuitId,
    pub name: String,
    pub pins: BTreeMap<PinId, Pin>,
    pub nets: BTreeMap<NetId, Net>,
    pub devices: BTreeMap<DeviceId, Device>,
    pub subcircuits: BTreeMap<SubCircuitId, SubCircuit>,
}

impl Circuit {
    pub fn new(id: CircuitId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            pins: BTreeMap::new(),
            nets: BTreeMap::new(),
            devices: BTreeMap::new(),
            subcircuits: BTreeMap::new(),
        }
    }

    pub fn net(&self, id: NetId) -> Option<&Net> {
        self.nets.get(&id)
    }

    pub fn net_by_name(&self, name: &str) -> Option<&Net> {
        self.nets.values().find(|n| n.name.as_deref() == Some(name))
    }

    pub fn device_by_name(&self, name: &str) -> Option<&Device> {
        self.devices.values().find(|d| d.name == name)
    }

    pub fn pin(&self, id: PinId) -> Option<&Pin> {
        self.pins.get(&id)
    }

    pub fn net_for_pin(&self, pin: PinId) -> Option<&Net> {
        self.pin(pin).and_then(|p| self.net(p.net))
    }

    /// The pin of a net, created on first request
    pub(crate) fn ensure_pin(&mut self, net: NetId) -> Option<PinId> {
        let n = self.nets.get_mut(&net)?;
        if let Some(&pin) = n.pins.first() {
            return Some(pin);
        }
        let id = self.pins.keys().next_back().map_or(0, |last| last + 1);
        n.pins.push(id);
        let name = n.expanded_name();
        self.pins.insert(id, Pin { id, name, net });
        Some(id)
    }

    pub fn is_empty(&self) -> bool {
        self.nets.is_empty() && self.devices.is_empty() && self.subcircuits.is_empty()
    }
}

/// The extracted netlist
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Netlist {
    pub device_classes: BTreeMap<String, DeviceClass>,
    pub circuits: BTreeMap<CircuitId, Circuit>,
    pub top: Option<CircuitId>,
}

impl Netlist {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn circuit(&self, id: CircuitId) -> Option<&Circuit> {
        self.circuits.get(&id)
    }

    pub fn circuit_mut(&mut self, id: CircuitId) -> Option<&mut Circuit> {
        self.circuits.get_mut(&id)
    }

    pub fn circuit_by_name(&self, name: &str) -> Option<&Circuit> {
        self.circuits.values().find(|c| c.name == name)
    }

    pub fn top_circuit(&self) -> Option<&Circuit> {
        self.top.and_then(|id| self.circuit(id))
    }

    pub fn net(&self, net: NetRef) -> Option<&Net> {
        self.circuit(net.circuit).and_then(|c| c.net(net.net))
    }

    pub fn device_class(&self, name: &str) -> Option<&DeviceClass> {
        self.device_classes.get(name)
    }

    pub fn add_device_class(&mut self, class: DeviceClass) {
        self.device_classes.entry(class.name.clone()).or_insert(class);
    }

    pub fn device_count(&self) -> usize {
        self.circuits.values().map(|c| c.devices.len()).sum()
    }

    /// Circuits with every child before its parents
    pub fn circuits_bottom_up(&self) -> Vec<CircuitId> {
        let mut graph: DiGraph<CircuitId, ()> = DiGraph::new();
        let nodes: BTreeMap<CircuitId, NodeIndex> = self
            .circuits
            .keys()
            .map(|&id| (id, graph.add_node(id)))
            .collect();
        for c in self.circuits.values() {
            for sc in c.subcircuits.values() {
                if let Some(&child) = nodes.get(&sc.circuit) {
                    graph.add_edge(nodes[&c.id], child, ());
                }
            }
        }
        match toposort(&graph, None) {
            Ok(order) => order.into_iter().rev().map(|n| graph[n]).collect(),
            Err(_) => self.circuits.keys().copied().collect(),
        }
    }

    /// Remove passive nets, their pins and the parents' bindings to them
    pub fn purge_nets(&mut self) {
        self.purge_impl(false);
    }

    /// Like [`Netlist::purge_nets`], then drop circuits left without nets
    /// and devices (except the top circuit) together with their instances
    pub fn purge(&mut self) {
        self.purge_impl(true);
    }

    fn purge_impl(&mut self, remove_empty: bool) {
        let mut removed_nets = 0usize;
        let mut removed_circuits = 0usize;
        for id in self.circuits_bottom_up() {
            let Some(circuit) = self.circuits.get_mut(&id) else {
                continue;
            };
            let passive: Vec<NetId> = circuit
                .nets
                .values()
                .filter(|n| n.is_passive())
                .map(|n| n.id)
                .collect();
            let mut dropped_pins = BTreeSet::new();
            for net in passive {
                if let Some(n) = circuit.nets.remove(&net) {
                    for pin in n.pins {
                        circuit.pins.remove(&pin);
                        dropped_pins.insert(pin);
                    }
                    removed_nets += 1;
                }
            }
            let drop_circuit = remove_empty
                && self.top != Some(id)
                && circuit.nets.is_empty()
                && circuit.devices.is_empty();

            for parent in self.circuits.values_mut() {
                let mut unbound: Vec<(NetId, NetSubcircuitPinRef)> = Vec::new();
                for sc in parent.subcircuits.values_mut().filter(|sc| sc.circuit == id) {
                    let pins: Vec<PinId> = if drop_circuit {
                        sc.pins.keys().copied().collect()
                    } else {
                        dropped_pins.iter().copied().collect()
                    };
                    for pin in pins {
                        if let Some(net) = sc.pins.remove(&pin) {
                            unbound.push((net, NetSubcircuitPinRef { subcircuit: sc.id, pin }));
                        }
                    }
                }
                for (net, r) in unbound {
                    if let Some(n) = parent.nets.get_mut(&net) {
                        n.subcircuit_pins.retain(|x| *x != r);
                    }
                }
                if drop_circuit {
                    parent.subcircuits.retain(|_, sc| sc.circuit != id);
                }
            }
            if drop_circuit {
                self.circuits.remove(&id);
                removed_circuits += 1;
            }
        }
        tracing::debug!(
            "purge removed {} nets and {} circuits",
            removed_nets,
            removed_circuits
        );
    }
}

fn write_parameters(f: &mut fmt::Formatter<'_>, parameters: &BTreeMap<String, f64>) -> fmt::Result {
    let list: Vec<String> = parameters
        .iter()
        .map(|(k, v)| format!("{}={}", k, format_value(*v)))
        .collect();
    write!(f, " [{}]", list.join(", "))
}

fn format_value(v: f64) -> String {
    let rounded = (v * 1e6).round() / 1e6;
    format!("{}", rounded)
}

impl fmt::Display for Netlist {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for id in self.circuits_bottom_up() {
            let Some(c) = self.circuit(id) else {
                continue;
            };
            let pins: Vec<String> = c
                .pins
                .values()
                .map(|p| {
                    let net = c.net(p.net).map(Net::expanded_name).unwrap_or_default();
                    format!("{}={}", p.name, net)
                })
                .collect();
            writeln!(f, "circuit {} ({});", c.name, pins.join(", "))?;

            for d in c.devices.values() {
                let terms: Vec<String> = d
                    .terminals
                    .iter()
                    .map(|(t, net)| {
                        let name = c.net(*net).map(Net::expanded_name).unwrap_or_default();
                        format!("{}={}", t, name)
                    })
                    .collect();
                write!(f, "  device {} {} ({})", d.class, d.name, terms.join(", "))?;
                write_parameters(f, &d.parameters)?;
                writeln!(f, ";")?;
            }

            for sc in c.subcircuits.values() {
                let child = self.circuit(sc.circuit);
                let child_name = child.map(|x| x.name.as_str()).unwrap_or("?");
                let pins: Vec<String> = sc
                    .pins
                    .iter()
                    .map(|(pin, net)| {
                        let pin_name = child
                            .and_then(|x| x.pin(*pin))
                            .map(|p| p.name.clone())
                            .unwrap_or_else(|| format!("${}", pin));
                        let net_name = c.net(*net).map(Net::expanded_name).unwrap_or_default();
                        format!("{}={}", pin_name, net_name)
                    })
                    .collect();
                writeln!(f, "  subcircuit {} {} ({});", child_name, sc.name, pins.join(", "))?;
            }
            writeln!(f, "end;")?;
        }
        Ok(())
    }
}

//! Connectivity model
//!
//! Declares which layers conduct into which, and which layers carry a
//! name-bound global net. All declarations are idempotent and
//! order-independent.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

use crate::layout::LayerIndex;

/// Layer connectivity plus global net bindings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Connectivity {
    connected: BTreeMap<LayerIndex, BTreeSet<LayerIndex>>,
    global_nets: BTreeMap<LayerIndex, BTreeSet<usize>>,
    global_net_names: Vec<String>,
}

impl Connectivity {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shapes on `layer` connect to each other
    pub fn connect(&mut self, layer: LayerIndex) {
        self.connected.entry(layer).or_default().insert(layer);
    }

    /// Shapes on `a` connect to shapes on `b` (and vice versa)
    pub fn connect_layers(&mut self, a: LayerIndex, b: LayerIndex) {
        self.connected.entry(a).or_default().insert(b);
        self.connected.entry(b).or_default().insert(a);
    }

    /// Bind every shape on `layer` to the global net `name`; returns its id
    pub fn connect_global(&mut self, layer: LayerIndex, name: &str) -> usize {
        let id = self.global_net_id_or_insert(name);
        self.global_nets.entry(layer).or_default().insert(id);
        id
    }

    fn global_net_id_or_insert(&mut self, name: &str) -> usize {
        match self.global_net_id(name) {
            Some(id) => id,
            None => {
                self.global_net_names.push(name.to_string());
                self.global_net_names.len() - 1
            }
        }
    }

    pub fn global_net_id(&self, name: &str) -> Option<usize> {
        self.global_net_names.iter().position(|n| n == name)
    }

    pub fn global_net_name(&self, id: usize) -> Option<&str> {
        self.global_net_names.get(id).map(String::as_str)
    }

    pub fn global_net_count(&self) -> usize {
        self.global_net_names.len()
    }

    /// True if shapes on `a` and `b` conduct into each other
    pub fn interacts(&self, a: LayerIndex, b: LayerIndex) -> bool {
        self.connected.get(&a).is_some_and(|s| s.contains(&b))
    }

    /// Global net ids bound to `layer`
    pub fn global_nets_of(&self, layer: LayerIndex) -> impl Iterator<Item = usize> + '_ {
        self.global_nets.get(&layer).into_iter().flatten().copied()
    }

    /// Every layer taking part in connectivity, ascending
    pub fn layers(&self) -> BTreeSet<LayerIndex> {
        self.connected
            .keys()
            .chain(self.global_nets.keys())
            .copied()
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.connected.is_empty() && self.global_nets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symmetric_and_idempotent() {
        let mut a = Connectivity::new();
        a.connect_layers(1, 2);
        a.connect_layers(1, 2);
        a.connect_layers(2, 1);
        a.connect(1);

        let mut b = Connectivity::new();
        b.connect(1);
        b.connect_layers(2, 1);

        assert_eq!(a, b);
        assert!(a.interacts(2, 1));
        assert!(!a.interacts(2, 2));
        assert_eq!(a.layers(), BTreeSet::from([1, 2]));
    }

    #[test]
    fn test_global_ids_are_stable_per_name() {
        let mut c = Connectivity::new();
        let vdd = c.connect_global(3, "VDD");
        let vss = c.connect_global(4, "VSS");
        assert_eq!(c.connect_global(5, "VDD"), vdd);
        assert_ne!(vdd, vss);
        assert_eq!(c.global_net_name(vss), Some("VSS"));
        assert_eq!(c.global_net_id("GND"), None);
        assert_eq!(c.global_nets_of(5).collect::<Vec<_>>(), vec![vdd]);
        assert!(c.layers().contains(&5));
    }
}

//! MOS transistor extractors
//!
//! Input roles:
//! - `SD`: source/drain diffusion (active area minus gate)
//! - `G`: gate area (active area overlapped by poly)
//! - `P`: optional poly layer carrying the gate terminal
//! - `W`: well or bulk layer (four-terminal flavor only)
//!
//! Every gate shape must touch exactly two source/drain regions. The width
//! is half the gate edge length shared with source/drain, the length is
//! gate area divided by width.

use petgraph::unionfind::UnionFind;
use std::collections::{BTreeMap, BTreeSet};

use super::{
    CellGeometry, DeviceClass, DeviceExtractor, DeviceOccurrence, LayerRole, Recognition,
    RecognitionError, TerminalGeometry,
};
use crate::geom::{Polygon, Rect};

const MOS3_ROLES: [LayerRole; 3] = [
    LayerRole::required("SD", "source/drain diffusion"),
    LayerRole::required("G", "gate area"),
    LayerRole::optional("P", "poly carrying the gate terminal"),
];

const MOS4_ROLES: [LayerRole; 4] = [
    LayerRole::required("SD", "source/drain diffusion"),
    LayerRole::required("G", "gate area"),
    LayerRole::optional("P", "poly carrying the gate terminal"),
    LayerRole::required("W", "well carrying the bulk terminal"),
];

fn mos_class(name: &str, with_bulk: bool) -> DeviceClass {
    let class = DeviceClass::new(name)
        .with_terminal("S", "source")
        .with_terminal("G", "gate")
        .with_terminal("D", "drain");
    let class = if with_bulk {
        class.with_terminal("B", "bulk")
    } else {
        class
    };
    class
        .with_parameter("L", "gate length (um)", 0.0)
        .with_parameter("W", "gate width (um)", 0.0)
        .with_parameter("AS", "source area (um^2)", 0.0)
        .with_parameter("AD", "drain area (um^2)", 0.0)
}

/// Three-terminal MOS transistor (S, G, D)
#[derive(Debug, Clone)]
pub struct Mos3Transistor {
    class: DeviceClass,
    errors: Vec<RecognitionError>,
}

impl Mos3Transistor {
    pub fn new(name: &str) -> Self {
        Self {
            class: mos_class(name, false),
            errors: Vec::new(),
        }
    }
}

impl DeviceExtractor for Mos3Transistor {
    fn device_class(&self) -> &DeviceClass {
        &self.class
    }

    fn layer_roles(&self) -> &[LayerRole] {
        &MOS3_ROLES
    }

    fn recognize(&self, geometry: &CellGeometry) -> Recognition {
        recognize_mos(geometry, false)
    }

    fn errors(&self) -> &[RecognitionError] {
        &self.errors
    }

    fn push_error(&mut self, error: RecognitionError) {
        self.errors.push(error);
    }

    fn clear_errors(&mut self) {
        self.errors.clear();
    }
}

/// Four-terminal MOS transistor (S, G, D, B)
#[derive(Debug, Clone)]
pub struct Mos4Transistor {
    class: DeviceClass,
    errors: Vec<RecognitionError>,
}

impl Mos4Transistor {
    pub fn new(name: &str) -> Self {
        Self {
            class: mos_class(name, true),
            errors: Vec::new(),
        }
    }
}

impl DeviceExtractor for Mos4Transistor {
    fn device_class(&self) -> &DeviceClass {
        &self.class
    }

    fn layer_roles(&self) -> &[LayerRole] {
        &MOS4_ROLES
    }

    fn recognize(&self, geometry: &CellGeometry) -> Recognition {
        recognize_mos(geometry, true)
    }

    fn errors(&self) -> &[RecognitionError] {
        &self.errors
    }

    fn push_error(&mut self, error: RecognitionError) {
        self.errors.push(error);
    }

    fn clear_errors(&mut self) {
        self.errors.clear();
    }
}

/// Touching SD polygons, grouped; groups ordered by their first polygon
fn sd_groups(sd: &[Polygon]) -> Vec<Vec<usize>> {
    let mut uf = UnionFind::<usize>::new(sd.len());
    for i in 0..sd.len() {
        for j in (i + 1)..sd.len() {
            if sd[i].interacts(&sd[j]) {
                uf.union(i, j);
            }
        }
    }
    let mut groups: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for i in 0..sd.len() {
        groups.entry(uf.find(i)).or_default().push(i);
    }
    let mut groups: Vec<Vec<usize>> = groups.into_values().collect();
    groups.sort_by_key(|g| g[0]);
    groups
}

/// Total length of edges `a` and `b` share (overlaps don't count)
fn shared_edge_length(a: &Polygon, b: &Polygon) -> i64 {
    let theirs = b.rects();
    let mut total = 0;
    for ra in a.rects() {
        for rb in &theirs {
            if let Some(c) = ra.clipped(rb) {
                if c.area() == 0 {
                    total += c.width() + c.height();
                }
            }
        }
    }
    total
}

fn recognize_mos(geometry: &CellGeometry, with_bulk: bool) -> Recognition {
    let mut out = Recognition::default();
    let sd = geometry.layer("SD");
    let gates = geometry.layer("G");
    if gates.is_empty() {
        return out;
    }

    let groups = sd_groups(sd);
    let gate_role = if geometry.has_layer("P") { "P" } else { "G" };
    let dbu = geometry.dbu;

    let error = |message: String, at: Rect| RecognitionError {
        cell: geometry.cell_name.clone(),
        message,
        geometry: Some(at),
    };

    for gate in gates {
        let touching: BTreeSet<usize> = groups
            .iter()
            .enumerate()
            .filter(|(_, g)| g.iter().any(|&i| sd[i].interacts(gate)))
            .map(|(gi, _)| gi)
            .collect();

        if touching.len() != 2 {
            out.errors.push(error(
                format!(
                    "expected two source/drain regions at gate, found {}",
                    touching.len()
                ),
                gate.bbox(),
            ));
            continue;
        }

        let edge: i64 = touching
            .iter()
            .flat_map(|&gi| groups[gi].iter())
            .map(|&i| shared_edge_length(gate, &sd[i]))
            .sum();
        if edge == 0 {
            out.errors.push(error(
                "gate shares no edge with source/drain".to_string(),
                gate.bbox(),
            ));
            continue;
        }

        let width = edge as f64 / 2.0;
        let length = gate.area() as f64 / width;

        let mut ends = touching.iter().map(|&gi| &groups[gi]);
        let (Some(source), Some(drain)) = (ends.next(), ends.next()) else {
            continue;
        };
        let area = |g: &[usize]| -> f64 {
            g.iter().map(|&i| sd[i].area() as f64).sum::<f64>() * dbu * dbu
        };
        let shapes = |g: &[usize]| -> Vec<Polygon> { g.iter().map(|&i| sd[i].clone()).collect() };

        let mut parameters = BTreeMap::new();
        parameters.insert("L".to_string(), length * dbu);
        parameters.insert("W".to_string(), width * dbu);
        parameters.insert("AS".to_string(), area(source));
        parameters.insert("AD".to_string(), area(drain));

        let mut terminals = vec![
            TerminalGeometry {
                terminal: "S".to_string(),
                role: "SD".to_string(),
                shapes: shapes(source),
            },
            TerminalGeometry {
                terminal: "G".to_string(),
                role: gate_role.to_string(),
                shapes: vec![gate.clone()],
            },
            TerminalGeometry {
                terminal: "D".to_string(),
                role: "SD".to_string(),
                shapes: shapes(drain),
            },
        ];
        if with_bulk {
            terminals.push(TerminalGeometry {
                terminal: "B".to_string(),
                role: "W".to_string(),
                shapes: vec![gate.clone()],
            });
        }

        out.devices.push(DeviceOccurrence {
            parameters,
            terminals,
        });
    }
    out
}

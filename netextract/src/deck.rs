//! Extraction decks
//!
//! A deck is a JSON file holding a small hierarchical layout together with
//! the recipe to extract it: which layers to take, how to derive new ones,
//! which devices to recognize and how layers connect.
//!
//! ```json
//! {
//!   "dbu": 0.001,
//!   "layers": [{ "name": "metal1", "layer": 1 }],
//!   "cells": [{ "name": "TOP", "shapes": [{ "layer": "metal1", "box": [0, 0, 100, 10] }] }],
//!   "top": "TOP",
//!   "extraction": {
//!     "inputs": [{ "name": "m1", "source": "metal1" }],
//!     "connect": [["m1"]]
//!   }
//! }
//! ```

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use crate::core::{ExtractError, ExtractionOptions, LayoutToNetlist};
use crate::devices::{DeviceExtractor, Mos3Transistor, Mos4Transistor, RecognitionError};
use crate::geom::boolean::BoolOp;
use crate::geom::{Point, Polygon, Rect, Text, Trans};
use crate::layout::{CellIndex, Instance, LayerInfo, Layout};
use crate::store::{Region, ShapeFilter};

fn default_dbu() -> f64 {
    0.001
}

#[derive(Debug, Clone, Deserialize)]
pub struct LayerSpec {
    pub name: String,
    #[serde(default)]
    pub layer: u32,
    #[serde(default)]
    pub datatype: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ShapeSpec {
    Box {
        layer: String,
        #[serde(rename = "box")]
        corners: [i64; 4],
    },
    Polygon {
        layer: String,
        polygon: Vec<[i64; 2]>,
    },
    Text {
        layer: String,
        text: String,
        at: [i64; 2],
    },
}

impl ShapeSpec {
    fn layer(&self) -> &str {
        match self {
            ShapeSpec::Box { layer, .. }
            | ShapeSpec::Polygon { layer, .. }
            | ShapeSpec::Text { layer, .. } => layer,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct InstanceSpec {
    pub cell: String,
    #[serde(default)]
    pub at: [i64; 2],
    /// Counter-clockwise rotation in degrees (multiple of 90)
    #[serde(default)]
    pub rotation: u32,
    #[serde(default)]
    pub mirror: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CellSpec {
    pub name: String,
    #[serde(default)]
    pub shapes: Vec<ShapeSpec>,
    #[serde(default)]
    pub instances: Vec<InstanceSpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InputSpec {
    pub name: String,
    pub source: String,
    #[serde(default)]
    pub kind: ShapeFilter,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DerivedSpec {
    pub name: String,
    pub op: BoolOp,
    pub a: String,
    pub b: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractorKind {
    Mos3,
    Mos4,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceSpec {
    pub extractor: ExtractorKind,
    pub class: String,
    /// Role name -> extraction layer name
    pub layers: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GlobalSpec {
    pub layer: String,
    pub net: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExtractionSpec {
    #[serde(default)]
    pub inputs: Vec<InputSpec>,
    #[serde(default)]
    pub derived: Vec<DerivedSpec>,
    #[serde(default)]
    pub devices: Vec<DeviceSpec>,
    /// `[a]` connects a layer to itself, `[a, b]` connects two layers
    #[serde(default)]
    pub connect: Vec<Vec<String>>,
    #[serde(default)]
    pub global: Vec<GlobalSpec>,
}

/// A layout plus its extraction recipe
#[derive(Debug, Clone, Deserialize)]
pub struct Deck {
    #[serde(default = "default_dbu")]
    pub dbu: f64,
    pub layers: Vec<LayerSpec>,
    pub cells: Vec<CellSpec>,
    pub top: String,
    #[serde(default)]
    pub options: Option<ExtractionOptions>,
    #[serde(default)]
    pub extraction: ExtractionSpec,
}

/// Result of running a deck
pub struct Extraction {
    pub engine: LayoutToNetlist,
    /// Extraction layers by deck name
    pub regions: BTreeMap<String, Region>,
    pub recognition_errors: Vec<RecognitionError>,
}

fn deck_error(msg: String) -> ExtractError {
    ExtractError::Deck(msg)
}

impl Deck {
    pub fn load(path: &Path) -> Result<Self, ExtractError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    pub fn from_json(json: &str) -> Result<Self, ExtractError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Build the layout; returns it together with the top cell
    pub fn build_layout(&self) -> Result<(Layout, CellIndex), ExtractError> {
        let mut layout = Layout::new(self.dbu);
        let mut layers = BTreeMap::new();
        for l in &self.layers {
            let info = LayerInfo {
                layer: l.layer,
                datatype: l.datatype,
                name: Some(l.name.clone()),
            };
            if layers.insert(l.name.clone(), layout.insert_layer(info)).is_some() {
                return Err(deck_error(format!("layer '{}' is defined twice", l.name)));
            }
        }

        for c in &self.cells {
            if layout.cell_by_name(&c.name).is_some() {
                return Err(deck_error(format!("cell '{}' is defined twice", c.name)));
            }
            layout.add_cell(&c.name);
        }

        for c in &self.cells {
            let ci = layout
                .cell_by_name(&c.name)
                .ok_or_else(|| deck_error(format!("cell '{}' vanished", c.name)))?;
            for s in &c.shapes {
                let layer = *layers.get(s.layer()).ok_or_else(|| {
                    deck_error(format!("cell '{}': unknown layer '{}'", c.name, s.layer()))
                })?;
                match s {
                    ShapeSpec::Box { corners: [x1, y1, x2, y2], .. } => {
                        layout.insert_shape(ci, layer, Rect::new(*x1, *y1, *x2, *y2));
                    }
                    ShapeSpec::Polygon { polygon, .. } => {
                        if polygon.len() < 3 {
                            return Err(deck_error(format!(
                                "cell '{}': polygon needs at least three points",
                                c.name
                            )));
                        }
                        let points = polygon.iter().map(|[x, y]| Point::new(*x, *y)).collect();
                        layout.insert_shape(ci, layer, Polygon::new(points));
                    }
                    ShapeSpec::Text { text, at: [x, y], .. } => {
                        layout.insert_shape(ci, layer, Text::new(text.clone(), Point::new(*x, *y)));
                    }
                }
            }
            for inst in &c.instances {
                let child = layout.cell_by_name(&inst.cell).ok_or_else(|| {
                    deck_error(format!("cell '{}': unknown cell '{}'", c.name, inst.cell))
                })?;
                if inst.rotation % 90 != 0 {
                    return Err(deck_error(format!(
                        "cell '{}': rotation {} is not a multiple of 90",
                        c.name, inst.rotation
                    )));
                }
                let trans = Trans::new(
                    ((inst.rotation / 90) % 4) as u8,
                    inst.mirror,
                    Point::new(inst.at[0], inst.at[1]),
                );
                layout.insert_instance(ci, Instance::new(child, trans));
            }
        }

        let top = layout
            .cell_by_name(&self.top)
            .ok_or_else(|| deck_error(format!("unknown top cell '{}'", self.top)))?;
        Ok((layout, top))
    }

    /// Build the layout, run the recipe and extract the netlist
    pub fn run(&self, threads: Option<usize>) -> Result<Extraction, ExtractError> {
        let (layout, top) = self.build_layout()?;
        let mut options = self.options.clone().unwrap_or_default();
        if let Some(t) = threads {
            options.threads = t.max(1);
        }
        tracing::info!(
            "deck: {} cells, {} layers, top '{}'",
            layout.cell_count(),
            layout.layer_count(),
            self.top
        );

        let mut engine = LayoutToNetlist::with_options(Arc::new(layout), top, options)?;
        let mut regions: BTreeMap<String, Region> = BTreeMap::new();
        let recipe = &self.extraction;

        for input in &recipe.inputs {
            let source = self
                .layers
                .iter()
                .position(|l| l.name == input.source)
                .ok_or_else(|| deck_error(format!("input '{}': unknown layer '{}'", input.name, input.source)))?;
            let region = match input.kind {
                ShapeFilter::All => engine.make_layer(source, Some(&input.name))?,
                ShapeFilter::Polygons => engine.make_polygon_layer(source, Some(&input.name))?,
                ShapeFilter::Texts => engine.make_text_layer(source, Some(&input.name))?,
            };
            regions.insert(input.name.clone(), region);
        }

        let lookup = |regions: &BTreeMap<String, Region>, name: &str| -> Result<Region, ExtractError> {
            regions
                .get(name)
                .cloned()
                .ok_or_else(|| deck_error(format!("unknown extraction layer '{}'", name)))
        };

        for d in &recipe.derived {
            let a = lookup(&regions, &d.a)?;
            let b = lookup(&regions, &d.b)?;
            let region = match d.op {
                BoolOp::And => engine.and(&a, &b)?,
                BoolOp::Not => engine.not(&a, &b)?,
                BoolOp::Or => engine.or(&a, &b)?,
            };
            engine.name(&region, &d.name)?;
            regions.insert(d.name.clone(), region);
        }

        let mut recognition_errors = Vec::new();
        for device in &recipe.devices {
            let mut extractor: Box<dyn DeviceExtractor> = match device.extractor {
                ExtractorKind::Mos3 => Box::new(Mos3Transistor::new(&device.class)),
                ExtractorKind::Mos4 => Box::new(Mos4Transistor::new(&device.class)),
            };
            let mut layers = BTreeMap::new();
            for (role, name) in &device.layers {
                layers.insert(role.clone(), lookup(&regions, name)?);
            }
            engine.extract_devices(extractor.as_mut(), &layers)?;
            recognition_errors.extend(extractor.errors().iter().cloned());
        }

        for pair in &recipe.connect {
            match pair.as_slice() {
                [a] => engine.connect(&lookup(&regions, a)?)?,
                [a, b] => engine.connect_layers(&lookup(&regions, a)?, &lookup(&regions, b)?)?,
                _ => {
                    return Err(deck_error(format!(
                        "connect entries take one or two layers, got {:?}",
                        pair
                    )))
                }
            }
        }
        for g in &recipe.global {
            engine.connect_global(&lookup(&regions, &g.layer)?, &g.net)?;
        }

        engine.extract_netlist()?;
        Ok(Extraction {
            engine,
            regions,
            recognition_errors,
        })
    }
}

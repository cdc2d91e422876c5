//! Device Extraction Framework
//!
//! A device extractor recognizes device occurrences from the geometry of a
//! set of named input layers ("roles"), one cell at a time. Each occurrence
//! carries its parameters and binds every terminal to shapes on one of the
//! input layers. Those terminal shapes later join the nets they touch.
//!
//! Recognition problems are not fatal: they are recorded on the extractor
//! as [`RecognitionError`]s and extraction continues.

pub mod mos;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::geom::{Polygon, Rect};
use crate::layout::{CellIndex, LayerIndex};

pub use mos::{Mos3Transistor, Mos4Transistor};

/// Terminal of a device class
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalDefinition {
    pub name: String,
    pub description: String,
}

/// Parameter of a device class
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterDefinition {
    pub name: String,
    pub description: String,
    pub default: f64,
}

/// A device model: its name, terminals and parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceClass {
    pub name: String,
    pub terminals: Vec<TerminalDefinition>,
    pub parameters: Vec<ParameterDefinition>,
}

impl DeviceClass {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            terminals: Vec::new(),
            parameters: Vec::new(),
        }
    }

    pub fn with_terminal(mut self, name: &str, description: &str) -> Self {
        self.terminals.push(TerminalDefinition {
            name: name.to_string(),
            description: description.to_string(),
        });
        self
    }

    pub fn with_parameter(mut self, name: &str, description: &str, default: f64) -> Self {
        self.parameters.push(ParameterDefinition {
            name: name.to_string(),
            description: description.to_string(),
            default,
        });
        self
    }

    pub fn has_terminal(&self, name: &str) -> bool {
        self.terminals.iter().any(|t| t.name == name)
    }
}

/// An input layer an extractor consumes
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LayerRole {
    pub name: &'static str,
    pub description: &'static str,
    pub required: bool,
}

impl LayerRole {
    pub const fn required(name: &'static str, description: &'static str) -> Self {
        Self {
            name,
            description,
            required: true,
        }
    }

    pub const fn optional(name: &'static str, description: &'static str) -> Self {
        Self {
            name,
            description,
            required: false,
        }
    }
}

/// Geometry of one cell as seen by an extractor (own shapes only)
#[derive(Debug, Clone, Default)]
pub struct CellGeometry {
    pub cell_name: String,
    /// Database unit in micrometers
    pub dbu: f64,
    pub layers: BTreeMap<String, Vec<Polygon>>,
}

impl CellGeometry {
    pub fn layer(&self, role: &str) -> &[Polygon] {
        self.layers.get(role).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn has_layer(&self, role: &str) -> bool {
        self.layers.contains_key(role)
    }

    pub fn is_empty(&self) -> bool {
        self.layers.values().all(Vec::is_empty)
    }
}

/// Shapes bound to one terminal of a device occurrence
#[derive(Debug, Clone, PartialEq)]
pub struct TerminalGeometry {
    pub terminal: String,
    /// Role name of the layer the shapes live on
    pub role: String,
    pub shapes: Vec<Polygon>,
}

/// One recognized device
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DeviceOccurrence {
    pub parameters: BTreeMap<String, f64>,
    pub terminals: Vec<TerminalGeometry>,
}

/// Non-fatal recognition problem
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecognitionError {
    pub cell: String,
    pub message: String,
    pub geometry: Option<Rect>,
}

impl std::fmt::Display for RecognitionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.geometry {
            Some(r) => write!(f, "{} (in cell {} at {})", self.message, self.cell, r),
            None => write!(f, "{} (in cell {})", self.message, self.cell),
        }
    }
}

/// Outcome of recognizing one cell
#[derive(Debug, Clone, Default)]
pub struct Recognition {
    pub devices: Vec<DeviceOccurrence>,
    pub errors: Vec<RecognitionError>,
}

/// Terminal shapes of a pooled device, on an internal layer
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TerminalRecord {
    pub name: String,
    pub layer: LayerIndex,
    pub shapes: Vec<Polygon>,
}

/// A device in the extractor's engine-wide pool
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceRecord {
    pub class: String,
    pub cell: CellIndex,
    pub parameters: BTreeMap<String, f64>,
    pub terminals: Vec<TerminalRecord>,
}

/// Device recognition plug-in
///
/// `recognize` runs concurrently on several cells, so it only gets shared
/// access; the engine records the errors it returns through `push_error`
/// afterwards.
pub trait DeviceExtractor: Send + Sync {
    fn device_class(&self) -> &DeviceClass;

    fn layer_roles(&self) -> &[LayerRole];

    fn recognize(&self, geometry: &CellGeometry) -> Recognition;

    fn errors(&self) -> &[RecognitionError];

    fn push_error(&mut self, error: RecognitionError);

    fn clear_errors(&mut self);
}

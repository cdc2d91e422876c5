//! netextract - hierarchical layout-to-netlist extraction
//!
//! Takes a hierarchical layout (cells, instances, shapes on layers), a set of
//! device recognizers and a connectivity description, and produces a
//! hierarchical netlist of circuits, nets, pins, devices and sub-circuits.
//! Nets can be probed by location and rendered back into a layout.
//!
//! # Quick Start
//!
//! ```no_run
//! use netextract::prelude::*;
//! use std::path::Path;
//!
//! let deck = Deck::load(Path::new("inverter.json")).unwrap();
//! let extraction = deck.run(None).unwrap();
//! let netlist = extraction.engine.netlist().unwrap();
//! print!("{}", netlist);
//! ```
//!
//! # Pipeline
//!
//! - **Layers**: [`LayoutToNetlist::make_layer`] and the boolean derivations
//!   keep the cell hierarchy of the source layout
//! - **Devices**: [`DeviceExtractor`] implementations recognize devices per
//!   cell and leave terminal geometry behind
//! - **Connectivity**: intra-/inter-layer connections and global nets
//! - **Extraction**: [`LayoutToNetlist::extract_netlist`] clusters shapes
//!   hierarchically and builds the netlist

pub mod clusters;
pub mod connectivity;
pub mod core;
pub mod deck;
pub mod devices;
pub mod geom;
pub mod layout;
pub mod netlist;
pub mod store;

mod materialize;
mod probe;

// Re-export main types
pub use core::{ExtractError, ExtractionOptions, LayoutToNetlist};
pub use deck::{Deck, Extraction};
pub use devices::{DeviceExtractor, Mos3Transistor, Mos4Transistor, RecognitionError};
pub use geom::{Point, Rect, Trans};
pub use layout::{CellMapping, Layout};
pub use materialize::NetBuildOptions;
pub use netlist::{NetRef, Netlist};
pub use store::{Region, ShapeFilter};

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::{
        Deck, DeviceExtractor, ExtractError, ExtractionOptions, Layout, LayoutToNetlist,
        Mos3Transistor, Mos4Transistor, NetBuildOptions, NetRef, Netlist, Point, Rect, Region,
        Trans,
    };
}

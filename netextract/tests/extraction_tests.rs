//! End-to-end tests for the extraction pipeline

use netextract::geom::{Polygon, Shape};
use netextract::layout::{CellIndex, Instance, LayerInfo};
use netextract::prelude::*;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;

fn fixture_path(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name)
}

fn inverter_deck() -> Deck {
    Deck::load(&fixture_path("inverter.json")).expect("fixture should load")
}

fn net_name(circuit: &netextract::netlist::Circuit, terminal_net: Option<usize>) -> String {
    terminal_net
        .and_then(|id| circuit.net(id))
        .map(|n| n.expanded_name())
        .unwrap_or_default()
}

/// Single metal layer engine over `layout`
fn metal_engine(layout: Layout, top: CellIndex, threads: usize) -> (LayoutToNetlist, Region) {
    let m1 = layout.find_layer(1, 0).expect("metal layer");
    let mut l2n = LayoutToNetlist::new(Arc::new(layout), top).unwrap();
    l2n.set_threads(threads);
    let metal = l2n.make_layer(m1, Some("metal1")).unwrap();
    l2n.connect(&metal).unwrap();
    (l2n, metal)
}

#[test]
fn test_inverter_netlist() {
    let ex = inverter_deck().run(None).expect("extraction should succeed");
    assert!(ex.recognition_errors.is_empty(), "{:?}", ex.recognition_errors);

    let netlist = ex.engine.netlist().unwrap();
    let inv = netlist.top_circuit().expect("top circuit");
    assert_eq!(inv.name, "INV");
    assert_eq!(inv.devices.len(), 2);
    for name in ["VDD", "VSS", "IN", "OUT"] {
        assert!(inv.net_by_name(name).is_some(), "net {} missing", name);
    }

    let pmos = inv.devices.values().find(|d| d.class == "PMOS").unwrap();
    let nmos = inv.devices.values().find(|d| d.class == "NMOS").unwrap();

    let sd = |d: &netextract::netlist::Device| -> BTreeSet<String> {
        ["S", "D"]
            .iter()
            .map(|t| net_name(inv, d.net_for_terminal(t)))
            .collect()
    };
    assert_eq!(sd(pmos), BTreeSet::from(["VDD".to_string(), "OUT".to_string()]));
    assert_eq!(sd(nmos), BTreeSet::from(["VSS".to_string(), "OUT".to_string()]));
    assert_eq!(net_name(inv, pmos.net_for_terminal("G")), "IN");
    assert_eq!(net_name(inv, nmos.net_for_terminal("G")), "IN");

    for d in [pmos, nmos] {
        assert!((d.parameter("W").unwrap() - 1.0).abs() < 1e-9);
        assert!((d.parameter("L").unwrap() - 0.2).abs() < 1e-9);
    }

    let out = NetRef::new(inv.id, inv.net_by_name("OUT").unwrap().id);
    let upper = ex.engine.shapes_of_net(out, &ex.regions["metal2"], true).unwrap();
    assert_eq!(upper.len(), 1);

    let listing = netlist.to_string();
    assert!(listing.contains("circuit INV"));
    assert!(listing.contains("device PMOS $"));
}

#[test]
fn test_purge_keeps_connected_nets() {
    let mut ex = inverter_deck().run(Some(1)).unwrap();
    let netlist = ex.engine.netlist_mut().unwrap();
    netlist.purge();

    let inv = netlist.top_circuit().unwrap();
    assert_eq!(inv.nets.len(), 4);
    assert!(inv.nets.values().all(|n| !n.terminals.is_empty()));
}

#[test]
fn test_thread_count_does_not_change_the_netlist() {
    let deck = inverter_deck();
    let reference = serde_json::to_string(deck.run(Some(1)).unwrap().engine.netlist().unwrap()).unwrap();
    for threads in [2, 8] {
        let other = serde_json::to_string(deck.run(Some(threads)).unwrap().engine.netlist().unwrap()).unwrap();
        assert_eq!(reference, other, "netlist differs with {} threads", threads);
    }
}

/// TOP holds a grid of abutting CELL instances; each CELL has two wires.
fn grid_layout(n: i64) -> (Layout, CellIndex) {
    let mut ly = Layout::new(0.001);
    let m1 = ly.insert_layer(LayerInfo::new(1, 0));
    let top = ly.add_cell("TOP");
    let cell = ly.add_cell("CELL");
    ly.insert_shape(cell, m1, Rect::new(0, 0, 100, 10));
    ly.insert_shape(cell, m1, Rect::new(0, 50, 100, 60));
    for i in 0..n {
        for j in 0..n {
            ly.insert_instance(top, Instance::new(cell, Trans::shift(i * 100, j * 200)));
        }
    }
    ly.insert_shape(top, m1, Rect::new(-10, 0, 0, 60));
    (ly, top)
}

#[test]
fn test_thread_count_does_not_change_hierarchical_netlist() {
    let run = |threads| {
        let (ly, top) = grid_layout(6);
        let (mut l2n, _) = metal_engine(ly, top, threads);
        l2n.extract_netlist().unwrap();
        serde_json::to_string(l2n.netlist().unwrap()).unwrap()
    };
    let reference = run(1);
    assert_eq!(reference, run(2));
    assert_eq!(reference, run(8));
}

#[test]
fn test_connections_inside_one_instance_stay_local() {
    let mut ly = Layout::new(0.001);
    let m1 = ly.insert_layer(LayerInfo::new(1, 0));
    let top = ly.add_cell("TOP");
    let child = ly.add_cell("CHILD");
    ly.insert_shape(child, m1, Rect::new(0, 0, 100, 10));
    ly.insert_shape(child, m1, Rect::new(200, 0, 300, 10));
    ly.insert_instance(top, Instance::new(child, Trans::IDENTITY));
    ly.insert_instance(top, Instance::new(child, Trans::shift(0, 1000)));
    ly.insert_shape(top, m1, Rect::new(100, 0, 200, 10));
    ly.insert_shape(top, m1, netextract::geom::Text::new("BR", Point::new(150, 5)));

    let (mut l2n, _) = metal_engine(ly, top, 2);
    l2n.extract_netlist().unwrap();
    let netlist = l2n.netlist().unwrap();

    let c = netlist.circuit_by_name("CHILD").unwrap();
    assert_eq!(c.nets.len(), 2);
    assert_eq!(c.pins.len(), 2);

    let t = netlist.top_circuit().unwrap();
    let bridge = t.net_by_name("BR").unwrap();
    assert_eq!(bridge.subcircuit_pins.len(), 2);
    assert!(bridge.subcircuit_pins.iter().all(|p| p.subcircuit == 0));
    assert!(t.subcircuits[&1].pins.is_empty());
}

#[test]
fn test_global_nets_join_across_hierarchy() {
    let mut ly = Layout::new(0.001);
    let m1 = ly.insert_layer(LayerInfo::new(1, 0));
    let top = ly.add_cell("TOP");
    let child = ly.add_cell("CHILD");
    ly.insert_shape(top, m1, Rect::new(0, 0, 10, 10));
    ly.insert_shape(top, m1, Rect::new(100, 0, 110, 10));
    ly.insert_shape(child, m1, Rect::new(0, 0, 10, 10));
    ly.insert_instance(top, Instance::new(child, Trans::shift(1000, 0)));

    let (mut l2n, metal) = metal_engine(ly, top, 1);
    let id = l2n.connect_global(&metal, "VDD").unwrap();
    assert_eq!(l2n.connect_global(&metal, "VDD").unwrap(), id);
    assert_eq!(l2n.global_net_name(id).unwrap(), "VDD");
    l2n.extract_netlist().unwrap();

    let netlist = l2n.netlist().unwrap();
    let t = netlist.top_circuit().unwrap();
    let vdd: Vec<_> = t.nets.values().filter(|n| n.name.as_deref() == Some("VDD")).collect();
    assert_eq!(vdd.len(), 1);
    assert_eq!(vdd[0].subcircuit_pins.len(), 1);

    let shapes = l2n
        .shapes_of_net(NetRef::new(t.id, vdd[0].id), &metal, true)
        .unwrap();
    assert_eq!(shapes.len(), 3);
}

#[test]
fn test_repeated_connections_are_idempotent() {
    let build = |repeat: usize| {
        let (ly, top) = grid_layout(3);
        let (mut l2n, metal) = metal_engine(ly, top, 1);
        for _ in 0..repeat {
            l2n.connect(&metal).unwrap();
            l2n.connect_layers(&metal, &metal).unwrap();
        }
        l2n.extract_netlist().unwrap();
        serde_json::to_string(l2n.netlist().unwrap()).unwrap()
    };
    assert_eq!(build(0), build(3));
}

#[test]
fn test_touching_corners_connect() {
    let mut ly = Layout::new(0.001);
    let m1 = ly.insert_layer(LayerInfo::new(1, 0));
    let top = ly.add_cell("TOP");
    ly.insert_shape(top, m1, Rect::new(0, 0, 10, 10));
    ly.insert_shape(top, m1, Rect::new(10, 10, 20, 20));
    ly.insert_shape(top, m1, Rect::new(21, 21, 30, 30));

    let (mut l2n, _) = metal_engine(ly, top, 1);
    l2n.extract_netlist().unwrap();
    assert_eq!(l2n.netlist().unwrap().top_circuit().unwrap().nets.len(), 2);
}

#[test]
fn test_split_thresholds_do_not_change_clusters() {
    let comb = Polygon::new(vec![
        Point::new(0, 0),
        Point::new(0, 500),
        Point::new(10, 500),
        Point::new(10, 10),
        Point::new(100, 10),
        Point::new(100, 500),
        Point::new(110, 500),
        Point::new(110, 0),
    ]);
    let run = |area_ratio: f64, max_vertex_count: usize| {
        let mut ly = Layout::new(0.001);
        let m1 = ly.insert_layer(LayerInfo::new(1, 0));
        let top = ly.add_cell("TOP");
        ly.insert_shape(top, m1, comb.clone());
        ly.insert_shape(top, m1, Rect::new(110, 490, 200, 500));
        ly.insert_shape(top, m1, Rect::new(20, 490, 90, 500));
        let mut l2n = LayoutToNetlist::new(Arc::new(ly), top).unwrap();
        l2n.set_area_ratio(area_ratio);
        l2n.set_max_vertex_count(max_vertex_count);
        let metal = l2n.make_layer(m1, None).unwrap();
        l2n.connect(&metal).unwrap();
        l2n.extract_netlist().unwrap();
        serde_json::to_string(l2n.netlist().unwrap()).unwrap()
    };
    let reference = run(1000.0, 1000);
    assert_eq!(reference, run(1.0, 4));
    assert_eq!(reference, run(3.0, 16));
}

#[test]
fn test_shapes_of_net_lead_back_to_the_net() {
    let ex = inverter_deck().run(None).unwrap();
    let metal = &ex.regions["metal1"];
    let netlist = ex.engine.netlist().unwrap();
    let inv = netlist.top_circuit().unwrap();

    for net in inv.nets.values() {
        let r = NetRef::new(inv.id, net.id);
        let shapes = ex.engine.shapes_of_net(r, metal, true).unwrap();
        for shape in shapes {
            if let Shape::Polygon(p) = shape {
                let at = p.rects()[0].center();
                assert_eq!(ex.engine.probe_net(metal, at).unwrap(), Some(r));
            }
        }
    }
}

#[test]
fn test_net_lookup_walks_up_to_the_connected_circuit() {
    let mut ly = Layout::new(0.001);
    let m1 = ly.insert_layer(LayerInfo::new(1, 0));
    let top = ly.add_cell("TOP");
    let child = ly.add_cell("CHILD");
    ly.insert_shape(child, m1, Rect::new(0, 0, 100, 10));
    ly.insert_shape(child, m1, Rect::new(0, 50, 10, 60));
    ly.insert_instance(top, Instance::new(child, Trans::IDENTITY));
    ly.insert_instance(top, Instance::new(child, Trans::shift(0, 1000)));
    ly.insert_instance(top, Instance::new(child, Trans::new(1, false, Point::new(3000, 0))));
    ly.insert_shape(top, m1, Rect::new(100, 0, 200, 10));

    let (mut l2n, metal) = metal_engine(ly, top, 1);
    l2n.extract_netlist().unwrap();
    let netlist = l2n.netlist().unwrap();
    let top_id = netlist.top_circuit().unwrap().id;
    let child_id = netlist.circuit_by_name("CHILD").unwrap().id;

    let joined = l2n.probe_net(&metal, Point::new(50, 5)).unwrap().unwrap();
    assert_eq!(joined.circuit, top_id);
    assert_eq!(l2n.probe_net(&metal, Point::new(150, 5)).unwrap(), Some(joined));

    let alone = l2n.probe_net(&metal, Point::new(50, 1005)).unwrap().unwrap();
    assert_eq!(alone.circuit, child_id);

    assert_eq!(l2n.probe_net(&metal, Point::new(100, 10)).unwrap(), Some(joined));
    assert_eq!(l2n.probe_net(&metal, Point::new(5000, 5000)).unwrap(), None);
    assert_eq!(l2n.probe_net_um(&metal, 0.05, 0.005).unwrap(), Some(joined));

    // inside the child's bounding box but between its shapes
    assert_eq!(l2n.probe_net(&metal, Point::new(50, 30)).unwrap(), None);
    assert_eq!(l2n.probe_net(&metal, Point::new(50, 1030)).unwrap(), None);

    // rotated placement: bbox spans x 2940..3000, y 0..100
    assert_eq!(l2n.probe_net(&metal, Point::new(2970, 50)).unwrap(), None);
    let rotated = l2n.probe_net(&metal, Point::new(2995, 50)).unwrap().unwrap();
    assert_eq!(rotated, alone);
    let stub = l2n.probe_net(&metal, Point::new(2945, 5)).unwrap().unwrap();
    assert_eq!(stub.circuit, child_id);
    assert_ne!(stub, alone);
}

#[test]
fn test_bad_gate_is_reported_and_skipped() {
    let mut ly = Layout::new(0.001);
    let active = ly.insert_layer(LayerInfo::new(1, 0));
    let poly = ly.insert_layer(LayerInfo::new(2, 0));
    let top = ly.add_cell("TOP");
    ly.insert_shape(top, active, Rect::new(0, 0, 1000, 1000));
    ly.insert_shape(top, poly, Rect::new(400, -200, 600, 1200));
    // poly runs off the right edge: only one source/drain side
    ly.insert_shape(top, active, Rect::new(2000, 0, 3000, 1000));
    ly.insert_shape(top, poly, Rect::new(2400, -200, 3200, 1200));

    let mut l2n = LayoutToNetlist::new(Arc::new(ly), top).unwrap();
    let active = l2n.make_polygon_layer(active, Some("active")).unwrap();
    let poly = l2n.make_polygon_layer(poly, Some("poly")).unwrap();
    let gate = l2n.and(&active, &poly).unwrap();
    let sd = l2n.not(&active, &poly).unwrap();

    let mut nmos = Mos3Transistor::new("NMOS");
    let layers = BTreeMap::from([
        ("SD".to_string(), sd.clone()),
        ("G".to_string(), gate),
        ("P".to_string(), poly.clone()),
    ]);
    assert_eq!(l2n.extract_devices(&mut nmos, &layers).unwrap(), 1);
    assert_eq!(nmos.errors().len(), 1);
    assert_eq!(nmos.errors()[0].cell, "TOP");

    l2n.connect(&poly).unwrap();
    l2n.connect(&sd).unwrap();
    l2n.extract_netlist().unwrap();
    let circuit = l2n.netlist().unwrap().top_circuit().unwrap();
    assert_eq!(circuit.devices.len(), 1);
    let device = circuit.devices.values().next().unwrap();
    assert_eq!(device.class, "NMOS");
    assert!((device.parameter("W").unwrap() - 1.0).abs() < 1e-9);
}

#[test]
fn test_gate_drawn_in_parent_over_child_active() {
    let mut ly = Layout::new(0.001);
    let active = ly.insert_layer(LayerInfo::new(1, 0));
    let poly = ly.insert_layer(LayerInfo::new(2, 0));
    let top = ly.add_cell("TOP");
    let child = ly.add_cell("DIFF");
    ly.insert_shape(child, active, Rect::new(0, 0, 1000, 1000));
    ly.insert_shape(top, poly, Rect::new(400, -200, 600, 1200));
    ly.insert_instance(top, Instance::new(child, Trans::IDENTITY));
    ly.insert_instance(top, Instance::new(child, Trans::shift(5000, 0)));

    let mut l2n = LayoutToNetlist::new(Arc::new(ly), top).unwrap();
    let active = l2n.make_polygon_layer(active, Some("active")).unwrap();
    let poly = l2n.make_polygon_layer(poly, Some("poly")).unwrap();
    let gate = l2n.and(&active, &poly).unwrap();
    let sd = l2n.not(&active, &poly).unwrap();

    let mut nmos = Mos3Transistor::new("NMOS");
    let layers = BTreeMap::from([
        ("SD".to_string(), sd.clone()),
        ("G".to_string(), gate),
        ("P".to_string(), poly.clone()),
    ]);
    assert_eq!(l2n.extract_devices(&mut nmos, &layers).unwrap(), 1);
    assert!(nmos.errors().is_empty(), "{:?}", nmos.errors());

    l2n.connect(&poly).unwrap();
    l2n.connect(&sd).unwrap();
    l2n.extract_netlist().unwrap();
    assert_eq!(l2n.netlist().unwrap().device_count(), 1);
}

#[test]
fn test_cyclic_hierarchy_is_rejected() {
    let mut ly = Layout::new(0.001);
    let m1 = ly.insert_layer(LayerInfo::new(1, 0));
    let a = ly.add_cell("A");
    let b = ly.add_cell("B");
    ly.insert_shape(a, m1, Rect::new(0, 0, 10, 10));
    ly.insert_instance(a, Instance::new(b, Trans::IDENTITY));
    ly.insert_instance(b, Instance::new(a, Trans::shift(100, 0)));

    let (mut l2n, _) = metal_engine(ly, a, 1);
    let err = l2n.extract_netlist().unwrap_err();
    assert!(matches!(err, ExtractError::Structural(_)), "{}", err);
    assert!(!l2n.has_netlist());
}

#[test]
fn test_build_all_nets_flat() {
    let ex = inverter_deck().run(None).unwrap();
    let mut target = Layout::new(0.001);
    let tl = target.insert_layer(LayerInfo::named("metal1"));
    let tc = target.add_cell("INV_NETS");

    let cmap = ex.engine.cell_mapping_into(&mut target, tc).unwrap();
    let lmap = BTreeMap::from([(tl, ex.regions["metal1"].clone())]);
    ex.engine
        .build_all_nets(&cmap, &mut target, &lmap, &NetBuildOptions::flat())
        .unwrap();

    let polygons = target
        .cell(tc)
        .shapes(tl)
        .iter()
        .filter(|s| !s.is_text())
        .count();
    assert_eq!(polygons, 4);
}

#[test]
fn test_build_all_nets_into_net_cells() {
    let ex = inverter_deck().run(None).unwrap();
    let mut target = Layout::new(0.001);
    let tl = target.insert_layer(LayerInfo::named("metal1"));
    let tc = target.add_cell("TOP");

    let cmap = ex.engine.cell_mapping_into(&mut target, tc).unwrap();
    let lmap = BTreeMap::from([(tl, ex.regions["metal1"].clone())]);
    let options = NetBuildOptions::flat()
        .with_net_cells("NET_")
        .with_device_cells("DEV_");
    ex.engine.build_all_nets(&cmap, &mut target, &lmap, &options).unwrap();

    for name in ["NET_VDD", "NET_VSS", "NET_IN", "NET_OUT"] {
        let cell = target.cell_by_name(name).unwrap_or_else(|| panic!("{} missing", name));
        assert!(!target.cell(cell).shapes(tl).is_empty());
    }
    assert_eq!(target.cell(tc).instances().len(), 4);
}

#[test]
fn test_device_cells_are_shared_between_nets() {
    let ex = inverter_deck().run(None).unwrap();
    let mut target = Layout::new(0.001);
    let tc = target.add_cell("TOP");
    let cmap = ex.engine.cell_mapping_into(&mut target, tc).unwrap();

    let mut lmap = BTreeMap::new();
    for name in ["metal1", "poly", "psd", "nsd", "pgate", "ngate"] {
        let tl = target.insert_layer(LayerInfo::named(name));
        lmap.insert(tl, ex.regions[name].clone());
    }
    let options = NetBuildOptions::flat()
        .with_net_cells("NET_")
        .with_device_cells("DEV_");
    ex.engine.build_all_nets(&cmap, &mut target, &lmap, &options).unwrap();

    let device_cells: Vec<CellIndex> = (0..target.cell_count())
        .filter(|&ci| target.cell(ci).name().starts_with("DEV_"))
        .collect();
    let mut names: Vec<&str> = device_cells.iter().map(|&ci| target.cell(ci).name()).collect();
    names.sort();
    assert_eq!(names, vec!["DEV_$1", "DEV_$2"]);

    // each transistor is referenced by its source, gate and drain nets
    for &dc in &device_cells {
        let refs: usize = (0..target.cell_count())
            .map(|ci| {
                target
                    .cell(ci)
                    .instances()
                    .iter()
                    .filter(|inst| inst.cell == dc)
                    .count()
            })
            .sum();
        assert_eq!(refs, 3, "{}", target.cell(dc).name());
        let shapes: usize = lmap.keys().map(|&tl| target.cell(dc).shapes(tl).len()).sum();
        assert!(shapes >= 3);
    }
}

#[test]
fn test_build_net_keeps_circuit_cells() {
    let mut ly = Layout::new(0.001);
    let m1 = ly.insert_layer(LayerInfo::new(1, 0));
    let top = ly.add_cell("TOP");
    let child = ly.add_cell("CHILD");
    ly.insert_shape(child, m1, Rect::new(0, 0, 100, 10));
    ly.insert_instance(top, Instance::new(child, Trans::IDENTITY));
    ly.insert_instance(top, Instance::new(child, Trans::shift(100, 0)));

    let (mut l2n, metal) = metal_engine(ly, top, 1);
    l2n.extract_netlist().unwrap();
    let t = l2n.netlist().unwrap().top_circuit().unwrap();
    let net = NetRef::new(t.id, *t.nets.keys().next().unwrap());

    let mut target = Layout::new(0.001);
    let tl = target.insert_layer(LayerInfo::new(1, 0));
    let tc = target.add_cell("OUT");
    let lmap = BTreeMap::from([(tl, metal.clone())]);

    l2n.build_net(net, &mut target, tc, &lmap, &NetBuildOptions::flat().with_circuit_cells("C_"))
        .unwrap();
    assert_eq!(target.cell(tc).instances().len(), 2);
    let sub = target.cell_by_name("C_CHILD").unwrap();
    assert_eq!(target.cell(sub).shapes(tl).len(), 1);

    let mut flat = Layout::new(0.001);
    let fl = flat.insert_layer(LayerInfo::new(1, 0));
    let fc = flat.add_cell("OUT");
    let lmap = BTreeMap::from([(fl, metal)]);
    l2n.build_net(net, &mut flat, fc, &lmap, &NetBuildOptions::flat()).unwrap();
    assert_eq!(flat.cell(fc).shapes(fl).len(), 2);
    assert!(flat.cell(fc).instances().is_empty());
}

#[test]
fn test_deck_file_errors() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    std::io::Write::write_all(&mut file, b"{ \"layers\": [").unwrap();
    assert!(matches!(Deck::load(file.path()), Err(ExtractError::Json(_))));

    let missing = file.path().with_extension("missing");
    assert!(matches!(Deck::load(&missing), Err(ExtractError::Io(_))));

    let dir = tempfile::tempdir().unwrap();
    let copy = dir.path().join("inverter.json");
    std::fs::copy(fixture_path("inverter.json"), &copy).unwrap();
    let deck = Deck::load(&copy).unwrap();
    assert_eq!(deck.top, "INV");
}

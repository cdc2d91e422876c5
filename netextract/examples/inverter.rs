//! Extract a CMOS inverter deck and print its netlist.

use netextract::prelude::*;
use std::path::Path;

fn main() -> Result<(), ExtractError> {
    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "tests/fixtures/inverter.json".to_string());
    let path = Path::new(&path);

    if !path.exists() {
        eprintln!("File not found: {}", path.display());
        eprintln!("Usage: cargo run --example inverter [path/to/deck.json]");
        std::process::exit(1);
    }

    let deck = Deck::load(path)?;
    let mut extraction = deck.run(None)?;
    for error in &extraction.recognition_errors {
        eprintln!("warning: {}", error);
    }

    let netlist = extraction.engine.netlist_mut()?;
    netlist.purge();
    print!("{}", netlist);

    if let Some(metal) = extraction.regions.get("metal1") {
        let at = Point::new(1400, 1750);
        match extraction.engine.probe_net(metal, at)? {
            Some(net) => {
                let name = extraction
                    .engine
                    .netlist()?
                    .net(net)
                    .map(|n| n.expanded_name())
                    .unwrap_or_default();
                println!("net at ({}, {}): {}", at.x, at.y, name);
            }
            None => println!("no net at ({}, {})", at.x, at.y),
        }
    }
    Ok(())
}

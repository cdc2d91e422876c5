//! netextract CLI - layout-to-netlist extraction from the command line.

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand, ValueEnum};
use netextract::{Deck, Extraction, Netlist, RecognitionError};
use std::path::{Path, PathBuf};
use std::process;

#[derive(Parser)]
#[command(name = "netextract")]
#[command(about = "Hierarchical layout-to-netlist extraction tool", long_about = None)]
#[command(version)]
struct Cli {
    /// Log progress to stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Extract the netlist of a deck
    Extract {
        /// Path to the JSON deck
        #[arg(value_name = "DECK")]
        deck: PathBuf,

        /// Output format
        #[arg(short, long, value_enum, default_value = "human")]
        format: OutputFormat,

        /// Remove nets without device terminals and empty circuits
        #[arg(long)]
        purge: bool,

        /// Worker threads (overrides the deck options)
        #[arg(short, long)]
        threads: Option<usize>,

        /// Exit with error code if device recognition reported problems
        #[arg(long)]
        strict: bool,
    },

    /// Report the net at a location of the top cell
    Probe {
        /// Path to the JSON deck
        #[arg(value_name = "DECK")]
        deck: PathBuf,

        /// Extraction layer to probe
        #[arg(short, long)]
        layer: String,

        /// X coordinate in micrometers
        #[arg(short = 'x', long, allow_hyphen_values = true)]
        x: f64,

        /// Y coordinate in micrometers
        #[arg(short = 'y', long, allow_hyphen_values = true)]
        y: f64,

        /// Worker threads (overrides the deck options)
        #[arg(short, long)]
        threads: Option<usize>,
    },

    /// List the layers and derivations of a deck
    Layers {
        /// Path to the JSON deck
        #[arg(value_name = "DECK")]
        deck: PathBuf,
    },
}

#[derive(Clone, ValueEnum)]
enum OutputFormat {
    /// Human-readable netlist listing
    Human,
    /// JSON output for scripts
    Json,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let result = match cli.command {
        Commands::Extract {
            deck,
            format,
            purge,
            threads,
            strict,
        } => handle_extract(&deck, format, purge, threads, strict),
        Commands::Probe {
            deck,
            layer,
            x,
            y,
            threads,
        } => handle_probe(&deck, &layer, x, y, threads),
        Commands::Layers { deck } => handle_layers(&deck),
    };

    let exit_code = match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            1
        }
    };
    process::exit(exit_code);
}

fn init_logging(verbose: bool) {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::WARN
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn load_deck(path: &Path) -> anyhow::Result<Deck> {
    Deck::load(path).with_context(|| format!("cannot load deck {}", path.display()))
}

fn run_deck(path: &Path, threads: Option<usize>) -> anyhow::Result<Extraction> {
    let deck = load_deck(path)?;
    deck.run(threads)
        .with_context(|| format!("extraction of {} failed", path.display()))
}

fn handle_extract(
    path: &Path,
    format: OutputFormat,
    purge: bool,
    threads: Option<usize>,
    strict: bool,
) -> anyhow::Result<i32> {
    let mut extraction = run_deck(path, threads)?;
    for error in &extraction.recognition_errors {
        eprintln!("warning: {}", error);
    }

    let netlist = extraction.engine.netlist_mut()?;
    if purge {
        netlist.purge();
    }

    match format {
        OutputFormat::Human => output_human(netlist),
        OutputFormat::Json => output_json(netlist, &extraction.recognition_errors)?,
    }

    if strict && !extraction.recognition_errors.is_empty() {
        return Ok(2);
    }
    Ok(0)
}

fn output_human(netlist: &Netlist) {
    print!("{}", netlist);
}

fn output_json(netlist: &Netlist, errors: &[RecognitionError]) -> anyhow::Result<()> {
    let output = serde_json::json!({
        "netlist": netlist,
        "recognition_errors": errors,
        "summary": {
            "circuits": netlist.circuits.len(),
            "nets": netlist.circuits.values().map(|c| c.nets.len()).sum::<usize>(),
            "devices": netlist.device_count(),
        }
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn handle_probe(
    path: &Path,
    layer: &str,
    x: f64,
    y: f64,
    threads: Option<usize>,
) -> anyhow::Result<i32> {
    let extraction = run_deck(path, threads)?;
    let region = extraction
        .regions
        .get(layer)
        .ok_or_else(|| anyhow!("deck has no extraction layer '{}'", layer))?;

    match extraction.engine.probe_net_um(region, x, y)? {
        Some(net) => {
            let netlist = extraction.engine.netlist()?;
            let circuit = netlist
                .circuit(net.circuit)
                .map(|c| c.name.as_str())
                .unwrap_or("?");
            let name = netlist
                .net(net)
                .map(|n| n.expanded_name())
                .unwrap_or_default();
            println!("{}:{}", circuit, name);
            Ok(0)
        }
        None => {
            println!("no net at ({}, {})", x, y);
            Ok(1)
        }
    }
}

fn handle_layers(path: &Path) -> anyhow::Result<i32> {
    let deck = load_deck(path)?;

    println!("Layout layers:\n");
    for l in &deck.layers {
        println!("  {:<12} {}/{}", l.name, l.layer, l.datatype);
    }

    let recipe = &deck.extraction;
    println!("\nExtraction layers:\n");
    for input in &recipe.inputs {
        println!("  {:<12} <- {} ({:?})", input.name, input.source, input.kind);
    }
    for d in &recipe.derived {
        println!("  {:<12} <- {} {} {}", d.name, d.a, d.op, d.b);
    }

    if !recipe.devices.is_empty() {
        println!("\nDevices:\n");
        for d in &recipe.devices {
            let roles: Vec<String> = d
                .layers
                .iter()
                .map(|(role, layer)| format!("{}={}", role, layer))
                .collect();
            println!("  {:<12} {:?} ({})", d.class, d.extractor, roles.join(", "));
        }
    }

    if !recipe.global.is_empty() {
        println!("\nGlobal nets:\n");
        for g in &recipe.global {
            println!("  {:<12} on {}", g.net, g.layer);
        }
    }
    Ok(0)
}

//! tactus - Hierarchical musical timing resolver.
//!
//! Composes a run of sections, phrases, measures and beats in two layers (a
//! primary meter and an aligned polyrhythm), then writes:
//!
//! - `<out>/<layer>.mid`: the layer's tempo map and unit markers
//! - `<out>/unit-map.json`: every resolved unit with its span
//! - `<out>/diagnostics/*.ndjson`: one file per enabled diagnostic category
//!
//! # Usage
//!
//! ```bash
//! cargo run -- --seed 7 --out output
//! RUST_LOG=tactus=debug cargo run -- --config tactus.json --trace
//! ```

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tactus::config::{Config, CountRange};
use tactus::diagnostics::DiagnosticCategory;
use tactus::engine::{self, Composition};
use tactus::export::{write_timing_map, write_unit_map};
use tactus::time::format_time;
use tracing_subscriber::EnvFilter;

/// Command-line options for the application.
struct CliOptions {
    /// JSON configuration file.
    config: Option<PathBuf>,
    seed: Option<u64>,
    /// Fixed number of sections, overriding the configured range.
    sections: Option<u32>,
    /// Output directory.
    out: PathBuf,
    bounded: bool,
    /// Record every diagnostic category.
    trace: bool,
}

impl CliOptions {
    /// Parses command-line arguments.
    ///
    /// Supports:
    /// - `--config <path>` or `-c <path>`: Load a JSON configuration
    /// - `--seed <n>` or `-s <n>`: Seed for every random draw
    /// - `--sections <n>`: Fixed section count
    /// - `--out <dir>` or `-o <dir>`: Output directory (default `output`)
    /// - `--bounded`: Substitute 1 for missing totals
    /// - `--trace`: Record index traces as well
    /// - `--help` or `-h`: Print help and exit
    fn parse() -> Result<Self> {
        let args: Vec<String> = std::env::args().collect();
        let mut options = Self {
            config: None,
            seed: None,
            sections: None,
            out: PathBuf::from("output"),
            bounded: false,
            trace: false,
        };
        let mut i = 1;

        while i < args.len() {
            let flag = args[i].as_str();
            match flag {
                "--config" | "-c" => options.config = Some(PathBuf::from(value(&args, &mut i, flag)?)),
                "--seed" | "-s" => {
                    let raw = value(&args, &mut i, flag)?;
                    options.seed = Some(raw.parse().with_context(|| format!("Invalid seed: {raw}"))?);
                }
                "--sections" => {
                    let raw = value(&args, &mut i, flag)?;
                    let sections: u32 = raw
                        .parse()
                        .with_context(|| format!("Invalid section count: {raw}"))?;
                    if sections == 0 {
                        bail!("--sections must be at least 1");
                    }
                    options.sections = Some(sections);
                }
                "--out" | "-o" => options.out = PathBuf::from(value(&args, &mut i, flag)?),
                "--bounded" => options.bounded = true,
                "--trace" => options.trace = true,
                "--help" | "-h" => {
                    print_help(args.first().map(String::as_str).unwrap_or("tactus"));
                    std::process::exit(0);
                }
                other => {
                    eprintln!("Unknown option: {}", other);
                    eprintln!("Use --help for usage information");
                    std::process::exit(1);
                }
            }
            i += 1;
        }

        Ok(options)
    }

    /// Merges the flags over a loaded (or default) configuration.
    fn apply(&self, config: &mut Config) {
        if self.seed.is_some() {
            config.seed = self.seed;
        }
        if let Some(sections) = self.sections {
            config.sections = CountRange::new(sections, sections);
        }
        if self.bounded {
            config.bounded = true;
        }
        if self.trace {
            config.diagnostics = DiagnosticCategory::ALL.to_vec();
        }
    }
}

/// Takes the argument following a flag.
fn value<'a>(args: &'a [String], i: &mut usize, flag: &str) -> Result<&'a str> {
    *i += 1;
    match args.get(*i) {
        Some(value) => Ok(value),
        None => bail!("{flag} requires an argument"),
    }
}

fn print_help(program: &str) {
    eprintln!("tactus - Hierarchical musical timing resolver");
    eprintln!();
    eprintln!("Usage: {} [OPTIONS]", program);
    eprintln!();
    eprintln!("Options:");
    eprintln!("  -c, --config PATH   Load a JSON configuration file");
    eprintln!("  -s, --seed N        Seed for structure and composer draws");
    eprintln!("      --sections N    Compose exactly N sections");
    eprintln!("  -o, --out DIR       Output directory (default: output)");
    eprintln!("      --bounded       Treat missing totals as 1 instead of failing");
    eprintln!("      --trace         Record per-unit index traces");
    eprintln!("  -h, --help          Print this help message");
    eprintln!();
    eprintln!("Log verbosity is controlled with RUST_LOG (e.g. RUST_LOG=tactus=debug).");
}

/// Writes every output file for a finished composition.
fn write_outputs(composition: &Composition, out: &Path) -> Result<()> {
    fs::create_dir_all(out)
        .with_context(|| format!("Failed to create output directory {}", out.display()))?;

    for layer in &composition.layers {
        let path = out.join(format!("{}.mid", layer.name));
        write_timing_map(&layer.sink, composition.ppq, &path)
            .with_context(|| format!("Failed to write {}", path.display()))?;
    }

    let unit_map = out.join("unit-map.json");
    write_unit_map(
        composition.layers.iter().flat_map(|layer| layer.ledger.iter()),
        &unit_map,
    )
    .with_context(|| format!("Failed to write {}", unit_map.display()))?;

    let diagnostics = out.join("diagnostics");
    composition
        .diagnostics
        .write_ndjson(&diagnostics)
        .with_context(|| format!("Failed to write diagnostics to {}", diagnostics.display()))?;
    Ok(())
}

fn print_summary(composition: &Composition, out: &Path) {
    println!(
        "Composed {} sections (seed {}) in {}",
        composition.sections,
        composition.seed,
        format_time(composition.duration_seconds())
    );
    for layer in &composition.layers {
        println!(
            "  {:<8} {:>7} units {:>6} events  ends {}",
            layer.name,
            layer.ledger.len(),
            layer.sink.len(),
            format_time(layer.context.section_start_time)
        );
    }
    println!(
        "  {} diagnostic entries, output in {}",
        composition.diagnostics.len(),
        out.display()
    );
}

/// Main entry point.
fn main() -> Result<()> {
    let cli = CliOptions::parse()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut config = match &cli.config {
        Some(path) => Config::load_from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => Config::default(),
    };
    cli.apply(&mut config);
    let errors = config.validate();
    if !errors.is_empty() {
        bail!("Invalid configuration: {}", errors.join("; "));
    }

    let composition = engine::compose(&config).context("Composition failed")?;
    write_outputs(&composition, &cli.out)?;
    print_summary(&composition, &cli.out);
    Ok(())
}

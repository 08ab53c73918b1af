//! Command-line driver for the fusion passes.
//!
//! Usage:
//!   graph-fuse fuse program.json -o fused.json
//!   graph-fuse validate program.json
//!   graph-fuse passes

use std::path::PathBuf;
use std::process;

use graph_fuse::parse::program;
use graph_fuse::pass::ConvElementwiseAddFusePass;
use graph_fuse::{PassManager, PassRegistry};

fn main() {
    env_logger::init();

    let args: Vec<String> = std::env::args().skip(1).collect();

    match args.first().map(|s| s.as_str()) {
        Some("fuse") => cmd_fuse(&args[1..]),
        Some("validate") => cmd_validate(&args[1..]),
        Some("passes") => cmd_passes(),
        Some("--help") | Some("-h") | None => print_usage(),
        Some(other) => {
            eprintln!("error: unknown subcommand '{other}'");
            eprintln!();
            print_usage();
            process::exit(1);
        }
    }
}

fn print_usage() {
    eprintln!("graph-fuse — inference graph fusion passes");
    eprintln!();
    eprintln!("Usage:");
    eprintln!("  graph-fuse fuse <program.json> [-o <out.json>] [--pass <NAME>]...");
    eprintln!("  graph-fuse validate <program.json>");
    eprintln!("  graph-fuse passes");
    eprintln!();
    eprintln!("Subcommands:");
    eprintln!("  fuse      Run passes over a program and write the rewritten program");
    eprintln!("  validate  Check a program's graph invariants");
    eprintln!("  passes    List registered passes");
    eprintln!();
    eprintln!("Environment:");
    eprintln!("  RUST_LOG=info    Per-pass summaries");
    eprintln!("  RUST_LOG=debug   Every skipped or fused match");
}

// ---------------------------------------------------------------------------
// fuse
// ---------------------------------------------------------------------------

fn cmd_fuse(args: &[String]) {
    const USAGE: &str = "Usage: graph-fuse fuse <program.json> [-o <out.json>] [--pass <NAME>]...";

    let mut program_path: Option<String> = None;
    let mut out_path: Option<PathBuf> = None;
    let mut passes: Vec<String> = Vec::new();

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--out" | "-o" => {
                i += 1;
                out_path = Some(PathBuf::from(args.get(i).unwrap_or_else(|| {
                    eprintln!("{USAGE}");
                    process::exit(1);
                })));
            }
            "--pass" | "-p" => {
                i += 1;
                passes.push(
                    args.get(i)
                        .unwrap_or_else(|| {
                            eprintln!("--pass requires a pass name");
                            process::exit(1);
                        })
                        .clone(),
                );
            }
            "--help" | "-h" => {
                eprintln!("{USAGE}");
                eprintln!();
                eprintln!("Run fusion passes over a JSON program description.");
                eprintln!();
                eprintln!("Options:");
                eprintln!("  -o, --out <FILE>   Output file (default: stdout)");
                eprintln!(
                    "  -p, --pass <NAME>  Pass to run, repeatable (default: {})",
                    ConvElementwiseAddFusePass::NAME
                );
                process::exit(0);
            }
            _ => {
                if program_path.is_none() {
                    program_path = Some(args[i].clone());
                } else {
                    eprintln!("Unexpected argument: {}", args[i]);
                    eprintln!("{USAGE}");
                    process::exit(1);
                }
            }
        }
        i += 1;
    }

    let program_path = program_path.unwrap_or_else(|| {
        eprintln!("{USAGE}");
        process::exit(1);
    });
    if passes.is_empty() {
        passes.push(ConvElementwiseAddFusePass::NAME.to_string());
    }

    let mut graph = program::load(&program_path).unwrap_or_else(|err| {
        eprintln!("Error loading {program_path}: {err}");
        process::exit(1);
    });

    let registry = PassRegistry::default();
    let names: Vec<&str> = passes.iter().map(String::as_str).collect();
    let manager = PassManager::from_names(&registry, &names).unwrap_or_else(|err| {
        eprintln!("Error: {err}");
        eprintln!("       graph-fuse passes lists the available passes");
        process::exit(1);
    });

    let results = manager.run(&mut graph).unwrap_or_else(|err| {
        eprintln!("Error: {err}");
        process::exit(1);
    });
    for (name, result) in &results {
        eprintln!(
            "==> {name}: {} rewrite(s){}",
            result.match_count,
            if result.applied { "" } else { " (unchanged)" }
        );
    }

    match out_path {
        Some(path) => {
            if let Err(err) = program::save(&graph, &path) {
                eprintln!("Error writing {}: {err}", path.display());
                process::exit(1);
            }
            eprintln!("Wrote {}", path.display());
        }
        None => {
            let json = serde_json::to_string_pretty(&program::to_program(&graph))
                .unwrap_or_else(|err| {
                    eprintln!("Error: {err}");
                    process::exit(1);
                });
            println!("{json}");
        }
    }
}

// ---------------------------------------------------------------------------
// validate / passes
// ---------------------------------------------------------------------------

fn cmd_validate(args: &[String]) {
    let Some(path) = args.first() else {
        eprintln!("Usage: graph-fuse validate <program.json>");
        process::exit(1);
    };

    let graph = program::load(path).unwrap_or_else(|err| {
        eprintln!("Error loading {path}: {err}");
        process::exit(1);
    });
    if let Err(err) = graph.validate() {
        eprintln!("{path}: {err}");
        process::exit(1);
    }
    eprintln!(
        "{path}: ok ({} ops, {} tensors)",
        graph.len(),
        graph.tensors().count()
    );
}

fn cmd_passes() {
    for name in PassRegistry::default().names() {
        println!("{name}");
    }
}

// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 bioflow contributors

//! Status command - report per-output up-to-date state

use colored::Colorize;
use miette::Result;

use crate::graph::DependencyGraph;
use crate::meta::MetaStore;

/// Report which recorded outputs are up to date
pub async fn run(output: Option<String>, verbose: bool) -> Result<()> {
    let workdir = std::env::current_dir()
        .map_err(|e| miette::miette!("Failed to get current directory: {}", e))?;

    let store = MetaStore::new(&workdir);
    let metas = store.scan()?;

    if metas.is_empty() {
        println!("No recorded outputs under {}", store.dir().display());
        return Ok(());
    }

    let graph = DependencyGraph::build(metas)?;

    let graph = match output {
        Some(ref path) => graph.filter(path).ok_or_else(|| {
            miette::miette!("No recorded output matches '{}'", path)
        })?,
        None => graph,
    };

    println!();
    println!("{}: {} output(s)", "Dependency state".bold(), graph.len());
    println!("{}", "═".repeat(50));

    for node in graph.leaves() {
        for value in &node.values {
            print_value(value, verbose);
        }
    }

    if verbose {
        println!();
        print!("{}", graph.to_text());
    }

    Ok(())
}

fn print_value(value: &crate::meta::OutputMeta, verbose: bool) {
    let marker = match value.up_to_date {
        Some(true) => "✓".green(),
        Some(false) => "✗".red(),
        None => "?".yellow(),
    };

    print!("  {} {}", marker, value.output_path.bold());
    if value.cleaned {
        print!(" {}", "(cleaned)".dimmed());
    }
    if value.preserve {
        print!(" {}", "(preserved)".cyan());
    }
    println!();

    if verbose && !value.inputs.is_empty() {
        println!("      {}", format!("from: {}", value.inputs.join(", ")).dimmed());
    }
}

// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 bioflow contributors

//! Graph command - render the output dependency graph

use miette::Result;

use super::GraphFormat;
use crate::graph::DependencyGraph;
use crate::meta::MetaStore;

/// Render the dependency graph over recorded outputs
pub async fn run(format: GraphFormat, _verbose: bool) -> Result<()> {
    let workdir = std::env::current_dir()
        .map_err(|e| miette::miette!("Failed to get current directory: {}", e))?;

    let store = MetaStore::new(&workdir);
    let metas = store.scan()?;

    if metas.is_empty() {
        println!("No recorded outputs under {}", store.dir().display());
        return Ok(());
    }

    let graph = DependencyGraph::build(metas)?;

    match format {
        GraphFormat::Text => print!("{}", graph.to_text()),
        GraphFormat::Dot => print!("{}", graph.to_dot()),
    }

    Ok(())
}

// SPDX-FileCopyrightText: 2026 The zb Authors
// SPDX-License-Identifier: MIT

//! The build dependency graph.
//!
//! Loads the derivation closure of a desired output set and computes, for
//! every derivation, the set of outputs that must be realized together.
//! That set is keyed by the structural pseudo-hash, so two structurally
//! equivalent derivations agree on their output choices, which is what
//! protects multi-output reuse from inconsistency.

use std::collections::{BTreeMap, BTreeSet};

use zb_store_core::aterm;
use zb_store_core::derivation::{Derivation, OutputName};
use zb_store_core::drv_hash::{DrvHash, pseudo_hash};
use zb_store_core::store_path::StorePath;

use crate::error::{Result, ServerError};
use crate::store::Store;

#[derive(Debug, Clone)]
pub struct GraphNode {
    pub derivation: Derivation,
    /// Derivations that consume one of this node's outputs.
    pub dependents: BTreeSet<StorePath>,
    /// Outputs that must be realized for this build.
    pub used_outputs: BTreeSet<OutputName>,
    /// Structural hash; nodes sharing it share output choices.
    pub pseudo: DrvHash,
}

#[derive(Debug, Clone)]
pub struct DependencyGraph {
    pub nodes: BTreeMap<StorePath, GraphNode>,
    /// Derivations with no derivation inputs, in first-discovery order.
    pub roots: Vec<StorePath>,
}

/// Load and parse a derivation from the store.
pub async fn load_derivation(store: &Store, drv_path: &StorePath) -> Result<Derivation> {
    if !drv_path.is_derivation() {
        return Err(ServerError::InvalidParams(format!(
            "'{drv_path}' is not a derivation"
        )));
    }
    let real = store.real_path(drv_path);
    let text = tokio::fs::read_to_string(&real).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            ServerError::ObjectNotExist(store.dir().display_path(drv_path))
        } else {
            ServerError::io(format!("failed to read {}", real.display()), e)
        }
    })?;
    let name_s = drv_path
        .name()
        .as_str()
        .strip_suffix(zb_store_core::derivation::DRV_EXTENSION)
        .unwrap_or(drv_path.name().as_str());
    let name = name_s
        .parse()
        .map_err(|e| ServerError::InvalidParams(format!("bad derivation name: {e}")))?;
    let drv = aterm::parse(store.dir(), &name, &text)
        .map_err(|e| ServerError::InvalidParams(format!("failed to parse {drv_path}: {e}")))?;
    drv.validate()
        .map_err(|e| ServerError::InvalidParams(e.to_string()))?;
    Ok(drv)
}

/// Build the dependency graph of `want`: each entry names a derivation
/// and the outputs wanted from it.
pub async fn analyze(
    store: &Store,
    want: &[(StorePath, BTreeSet<OutputName>)],
) -> Result<DependencyGraph> {
    // First pass: DFS-load the derivation closure.
    let mut nodes: BTreeMap<StorePath, GraphNode> = BTreeMap::new();
    let mut roots: Vec<StorePath> = Vec::new();
    let mut stack: Vec<StorePath> = want.iter().map(|(p, _)| p.clone()).collect();

    while let Some(drv_path) = stack.pop() {
        if nodes.contains_key(&drv_path) {
            continue;
        }
        let derivation = load_derivation(store, &drv_path).await?;
        let pseudo = pseudo_hash(store.dir(), &derivation)
            .map_err(|e| ServerError::internal(format!("hashing {drv_path}: {e}")))?;

        stack.extend(derivation.input_derivations.keys().cloned());
        if derivation.input_derivations.is_empty() {
            roots.push(drv_path.clone());
        }
        nodes.insert(
            drv_path,
            GraphNode {
                derivation,
                dependents: BTreeSet::new(),
                used_outputs: BTreeSet::new(),
                pseudo,
            },
        );
    }

    // Second pass: wanted outputs accumulate per structural class, and
    // dependents edges are populated from each derivation-input edge.
    let mut wanted_by_pseudo: BTreeMap<DrvHash, BTreeSet<OutputName>> = BTreeMap::new();
    let edges: Vec<(StorePath, BTreeSet<OutputName>, StorePath)> = nodes
        .iter()
        .flat_map(|(path, node)| {
            node.derivation
                .input_derivations
                .iter()
                .map(|(input, outputs)| (input.clone(), outputs.clone(), path.clone()))
                .collect::<Vec<_>>()
        })
        .collect();
    for (input, outputs, dependent) in edges {
        let node = nodes
            .get_mut(&input)
            .ok_or_else(|| ServerError::internal(format!("missing node for {input}")))?;
        node.dependents.insert(dependent);
        wanted_by_pseudo
            .entry(node.pseudo)
            .or_default()
            .extend(outputs);
    }
    for (drv_path, outputs) in want {
        let node = nodes
            .get(drv_path)
            .ok_or_else(|| ServerError::internal(format!("missing node for {drv_path}")))?;
        let outputs = if outputs.is_empty() {
            node.derivation.outputs.keys().cloned().collect()
        } else {
            outputs.clone()
        };
        wanted_by_pseudo
            .entry(node.pseudo)
            .or_default()
            .extend(outputs);
    }

    // Final pass: every node looks its used outputs up by pseudo-hash.
    for node in nodes.values_mut() {
        if let Some(outputs) = wanted_by_pseudo.get(&node.pseudo) {
            node.used_outputs = outputs.clone();
        }
        if node.used_outputs.is_empty() {
            node.used_outputs = node.derivation.outputs.keys().cloned().collect();
        }
    }

    Ok(DependencyGraph { nodes, roots })
}

impl DependencyGraph {
    /// Dependents of `drv_path` whose derivation inputs are all in
    /// `completed`.
    pub fn ready_dependents(
        &self,
        drv_path: &StorePath,
        completed: &BTreeSet<StorePath>,
    ) -> Vec<StorePath> {
        let Some(node) = self.nodes.get(drv_path) else {
            return Vec::new();
        };
        node.dependents
            .iter()
            .filter(|dependent| {
                self.nodes
                    .get(*dependent)
                    .map(|d| {
                        d.derivation
                            .input_derivations
                            .keys()
                            .all(|input| completed.contains(input))
                    })
                    .unwrap_or(false)
            })
            .cloned()
            .collect()
    }
}

//! Structure nodes of a provenance graph.
//!
//! The locator content is a serialized [`GraphNode`] whose attributes follow
//! the `StructureData` layout: `cell`, `pbc1`..`pbc3`, `kinds` (name,
//! symbols, weights, optional mass) and `sites` (kind name, Cartesian
//! position). The node uuid is the declared id and `mtime` the
//! modification time. Node extras are handed to the property joiner.

use serde::Deserialize;

use super::EntryParser;
use crate::graph::GraphNode;
use crate::models::{ParsedDocument, ResolvedLocator, GRAPH_STRUCTURE_FORMAT};
use crate::structure::{Site, Species, Structure};

pub struct GraphNodeParser;

#[derive(Debug, Deserialize)]
struct Kind {
    name: String,
    symbols: Vec<String>,
    weights: Vec<f64>,
    #[serde(default)]
    mass: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct NodeSite {
    kind_name: String,
    position: [f64; 3],
}

impl EntryParser for GraphNodeParser {
    fn name(&self) -> &str {
        "graph-node"
    }

    fn formats(&self) -> &[&str] {
        &[GRAPH_STRUCTURE_FORMAT]
    }

    fn parse(&self, locator: &ResolvedLocator) -> Result<Vec<ParsedDocument>, String> {
        let node: GraphNode = serde_json::from_slice(&locator.content).map_err(|e| e.to_string())?;
        let mut doc = ParsedDocument::structure(structure(&node)?);
        doc.declared_id = Some(node.uuid);
        doc.last_modified = node.mtime;
        doc.extras = node.extras;
        Ok(vec![doc])
    }
}

fn field<T: serde::de::DeserializeOwned>(node: &GraphNode, name: &str) -> Result<Option<T>, String> {
    node.attributes
        .get(name)
        .map(|v| serde_json::from_value(v.clone()).map_err(|e| format!("attribute '{}': {}", name, e)))
        .transpose()
}

fn structure(node: &GraphNode) -> Result<Structure, String> {
    let cell: Option<[[f64; 3]; 3]> = field(node, "cell")?;
    let mut pbc = [false; 3];
    for (axis, flag) in pbc.iter_mut().enumerate() {
        *flag = field(node, &format!("pbc{}", axis + 1))?.unwrap_or(cell.is_some());
    }

    let mut structure = Structure::new(cell, pbc);
    let kinds: Vec<Kind> = field(node, "kinds")?.unwrap_or_default();
    for kind in kinds {
        let mass = kind.mass.map(|m| vec![m; kind.symbols.len()]);
        structure.add_species(Species {
            name: kind.name,
            chemical_symbols: kind.symbols,
            concentration: kind.weights,
            mass,
        });
    }
    let sites: Vec<NodeSite> = field(node, "sites")?.unwrap_or_default();
    structure.sites = sites
        .into_iter()
        .map(|s| Site {
            species: s.kind_name,
            position: s.position,
        })
        .collect();
    Ok(structure)
}

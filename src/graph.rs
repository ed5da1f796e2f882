//! Provenance-graph sources.
//!
//! A graph source is a JSON export of a provenance graph:
//!
//! ```json
//! {
//!   "nodes":  [{"uuid": "...", "node_type": "data.core.structure.StructureData.",
//!               "mtime": "...", "attributes": {...}, "extras": {...}}],
//!   "links":  [{"input": "<uuid>", "output": "<uuid>",
//!               "link_type": "create", "label": "output_structure"}],
//!   "groups": [{"label": "relaxed", "nodes": ["<uuid>", ...]}]
//! }
//! ```
//!
//! The export may be a loose file or sit inside an archive (`graph.json`,
//! else the first `.json` member). Named profiles map to export files via
//! [`GraphProfiles`].
//!
//! Structures are the `StructureData` nodes of a group. Property values are
//! read by [`traverse`], which walks incoming/outgoing links from the
//! structure node and projects an attribute path of the final node. Every hop
//! must land on exactly one node.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use crate::archive::open_source;
use crate::config::{GraphSource, NodeHop, TraversalStep};
use crate::error::MakerError;
use crate::models::{ResolvedLocator, GRAPH_STRUCTURE_FORMAT};

/// Environment variable naming a directory of `<profile>.json` exports.
pub const PROFILE_DIR_ENV: &str = "OPTIMAKE_GRAPH_PROFILE_DIR";

const STRUCTURE_CLASS: &str = "StructureData";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphNode {
    pub uuid: String,
    pub node_type: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub ctime: Option<String>,
    #[serde(default)]
    pub mtime: Option<String>,
    #[serde(default)]
    pub attributes: Map<String, Value>,
    #[serde(default)]
    pub extras: Map<String, Value>,
}

impl GraphNode {
    /// Class name of the node, e.g. `StructureData` for
    /// `data.core.structure.StructureData.`.
    pub fn class_name(&self) -> &str {
        self.node_type
            .split('.')
            .filter(|s| !s.is_empty())
            .last()
            .unwrap_or("")
    }

    pub fn is_a(&self, class: &str) -> bool {
        if self.node_type == class || self.class_name() == class {
            return true;
        }
        match class {
            "Node" => true,
            "Data" => self.node_type.starts_with("data."),
            "ProcessNode" => self.node_type.starts_with("process."),
            "CalculationNode" => self.node_type.starts_with("process.calculation."),
            "WorkflowNode" => self.node_type.starts_with("process.workflow."),
            _ => false,
        }
    }

    /// Value at a dotted path (`attributes.energy`, `uuid`, `extras.tag.0`).
    pub fn project(&self, path: &str) -> Option<Value> {
        let mut parts = path.split('.');
        let head = parts.next()?;
        let mut current = match head {
            "uuid" => Value::String(self.uuid.clone()),
            "node_type" => Value::String(self.node_type.clone()),
            "label" => Value::String(self.label.clone()),
            "ctime" => Value::String(self.ctime.clone()?),
            "mtime" => Value::String(self.mtime.clone()?),
            "attributes" => Value::Object(self.attributes.clone()),
            "extras" => Value::Object(self.extras.clone()),
            // Bare attribute names are looked up in `attributes`.
            other => self.attributes.get(other)?.clone(),
        };
        for part in parts {
            current = match current {
                Value::Object(mut map) => map.remove(part)?,
                Value::Array(mut items) => {
                    let index: usize = part.parse().ok()?;
                    if index >= items.len() {
                        return None;
                    }
                    items.swap_remove(index)
                }
                _ => return None,
            };
        }
        Some(current)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphLink {
    pub input: String,
    pub output: String,
    #[serde(default)]
    pub link_type: String,
    #[serde(default)]
    pub label: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GraphGroup {
    pub label: String,
    #[serde(default)]
    pub nodes: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct GraphExport {
    nodes: Vec<GraphNode>,
    #[serde(default)]
    links: Vec<GraphLink>,
    #[serde(default)]
    groups: Vec<GraphGroup>,
}

/// Read access to a provenance graph.
pub trait GraphStore {
    fn node(&self, uuid: &str) -> Option<&GraphNode>;

    /// Structure nodes of `group` (all structure nodes for `None`), in
    /// storage order.
    fn structures(&self, group: Option<&str>) -> Result<Vec<&GraphNode>>;

    /// Links pointing into `uuid`, with their source node.
    fn incoming(&self, uuid: &str) -> Vec<(&GraphLink, &GraphNode)>;

    /// Links leaving `uuid`, with their target node.
    fn outgoing(&self, uuid: &str) -> Vec<(&GraphLink, &GraphNode)>;
}

/// In-memory graph loaded from a JSON export.
#[derive(Debug, Default)]
pub struct JsonGraphStore {
    nodes: Vec<GraphNode>,
    index: HashMap<String, usize>,
    links: Vec<GraphLink>,
    incoming: HashMap<String, Vec<usize>>,
    outgoing: HashMap<String, Vec<usize>>,
    groups: Vec<GraphGroup>,
}

impl JsonGraphStore {
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        let export: GraphExport =
            serde_json::from_slice(bytes).context("Failed to parse graph export")?;

        let mut store = JsonGraphStore::default();
        for node in export.nodes {
            store.index.insert(node.uuid.clone(), store.nodes.len());
            store.nodes.push(node);
        }
        for (i, link) in export.links.into_iter().enumerate() {
            store.outgoing.entry(link.input.clone()).or_default().push(i);
            store.incoming.entry(link.output.clone()).or_default().push(i);
            store.links.push(link);
        }
        store.groups = export.groups;
        Ok(store)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn neighbours(&self, link_ids: Option<&Vec<usize>>, pick_input: bool) -> Vec<(&GraphLink, &GraphNode)> {
        link_ids
            .map(|ids| {
                ids.iter()
                    .filter_map(|&i| {
                        let link = &self.links[i];
                        let other = if pick_input { &link.input } else { &link.output };
                        self.node(other).map(|node| (link, node))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl GraphStore for JsonGraphStore {
    fn node(&self, uuid: &str) -> Option<&GraphNode> {
        self.index.get(uuid).map(|&i| &self.nodes[i])
    }

    fn structures(&self, group: Option<&str>) -> Result<Vec<&GraphNode>> {
        let Some(label) = group else {
            return Ok(self
                .nodes
                .iter()
                .filter(|n| n.is_a(STRUCTURE_CLASS))
                .collect());
        };
        let group = self
            .groups
            .iter()
            .find(|g| g.label == label)
            .ok_or_else(|| MakerError::SourceNotFound {
                path: label.to_string(),
                reason: "graph group does not exist".to_string(),
            })?;
        Ok(group
            .nodes
            .iter()
            .filter_map(|uuid| self.node(uuid))
            .filter(|n| n.is_a(STRUCTURE_CLASS))
            .collect())
    }

    fn incoming(&self, uuid: &str) -> Vec<(&GraphLink, &GraphNode)> {
        self.neighbours(self.incoming.get(uuid), true)
    }

    fn outgoing(&self, uuid: &str) -> Vec<(&GraphLink, &GraphNode)> {
        self.neighbours(self.outgoing.get(uuid), false)
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Profiles and opening
// ═══════════════════════════════════════════════════════════════════════

/// Named graph profiles available to a run.
#[derive(Debug, Clone, Default)]
pub struct GraphProfiles {
    profiles: BTreeMap<String, PathBuf>,
    profile_dir: Option<PathBuf>,
}

impl GraphProfiles {
    pub fn new(profiles: impl IntoIterator<Item = (String, PathBuf)>) -> Self {
        Self {
            profiles: profiles.into_iter().collect(),
            profile_dir: None,
        }
    }

    /// Add the profile directory from [`PROFILE_DIR_ENV`], if set.
    pub fn with_env(mut self) -> Self {
        self.profile_dir = std::env::var_os(PROFILE_DIR_ENV).map(PathBuf::from);
        self
    }

    pub fn with_profile_dir(mut self, dir: PathBuf) -> Self {
        self.profile_dir = Some(dir);
        self
    }

    pub fn lookup(&self, name: &str) -> Result<PathBuf> {
        if let Some(path) = self.profiles.get(name) {
            return Ok(path.clone());
        }
        if let Some(dir) = &self.profile_dir {
            let path = dir.join(format!("{}.json", name));
            if path.is_file() {
                return Ok(path);
            }
        }
        Err(MakerError::SourceNotFound {
            path: name.to_string(),
            reason: format!(
                "unknown graph profile; pass --graph-profile {}=<export> or set {}",
                name, PROFILE_DIR_ENV
            ),
        }
        .into())
    }
}

/// Open the graph named by `source`.
pub fn open_graph(root: &Path, source: &GraphSource, profiles: &GraphProfiles) -> Result<JsonGraphStore> {
    let (base, file) = match source {
        GraphSource::File(file) => (root.to_path_buf(), file.clone()),
        GraphSource::Profile(name) => {
            let path = profiles.lookup(name)?;
            let file = path
                .file_name()
                .map(|f| f.to_string_lossy().to_string())
                .unwrap_or_default();
            let base = path.parent().map(Path::to_path_buf).unwrap_or_default();
            (base, file)
        }
    };

    let contents = open_source(&base, &file)?;
    let member = if contents.container {
        contents
            .members
            .iter()
            .find(|m| m.path.rsplit('/').next() == Some("graph.json"))
            .or_else(|| contents.members.iter().find(|m| m.path.ends_with(".json")))
    } else {
        contents.members.first()
    }
    .ok_or_else(|| MakerError::SourceNotFound {
        path: file.clone(),
        reason: "no graph export found".to_string(),
    })?;

    let store = JsonGraphStore::from_json(&member.content)
        .with_context(|| format!("Failed to open graph source {}", file))?;
    tracing::debug!(file = %file, nodes = store.len(), "opened graph source");
    Ok(store)
}

/// Locators for the structure nodes of `group`.
pub fn resolve_graph(store: &dyn GraphStore, group: Option<&str>) -> Result<Vec<ResolvedLocator>> {
    store
        .structures(group)?
        .into_iter()
        .map(|node| {
            Ok(ResolvedLocator {
                path: node.uuid.clone(),
                member: node.uuid.clone(),
                content: serde_json::to_vec(node)?,
                modified: node
                    .mtime
                    .as_deref()
                    .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
                    .map(|t| t.with_timezone(&Utc)),
                format_hint: Some(GRAPH_STRUCTURE_FORMAT.to_string()),
                origin_node: Some(node.uuid.clone()),
            })
        })
        .collect()
}

// ═══════════════════════════════════════════════════════════════════════
// Traversal
// ═══════════════════════════════════════════════════════════════════════

/// Run a query from `start`. Returns `Ok(None)` when the projected path is
/// absent on the final node, `Err(reason)` when a hop is missing or
/// ambiguous.
pub fn traverse(
    store: &dyn GraphStore,
    start: &str,
    steps: &[TraversalStep],
) -> std::result::Result<Option<Value>, String> {
    let mut current = store
        .node(start)
        .ok_or_else(|| format!("start node {} not in graph", start))?;

    for (i, step) in steps.iter().enumerate() {
        let (hop, neighbours, direction) = match step {
            TraversalStep::Project(path) => return Ok(current.project(path)),
            TraversalStep::Incoming(hop) => (hop, store.incoming(&current.uuid), "incoming"),
            TraversalStep::Outgoing(hop) => (hop, store.outgoing(&current.uuid), "outgoing"),
        };

        let mut candidates: Vec<&GraphNode> = Vec::new();
        for (link, node) in neighbours {
            if node.is_a(&hop.node_type)
                && filters_match(hop, node, link)
                && !candidates.iter().any(|c| c.uuid == node.uuid)
            {
                candidates.push(node);
            }
        }
        current = match candidates.as_slice() {
            [single] => *single,
            [] => {
                return Err(format!(
                    "step {}: no {} {} node",
                    i + 1,
                    direction,
                    hop.node_type
                ))
            }
            many => {
                return Err(format!(
                    "step {}: {} {} {} nodes, expected one",
                    i + 1,
                    many.len(),
                    direction,
                    hop.node_type
                ))
            }
        };
    }
    Err("query has no project step".to_string())
}

fn filters_match(hop: &NodeHop, node: &GraphNode, link: &GraphLink) -> bool {
    hop.filters
        .iter()
        .all(|(path, condition)| condition_holds(node.project(path).as_ref(), condition))
        && hop.edge_filters.iter().all(|(key, condition)| {
            let value = match key.as_str() {
                "label" => Value::String(link.label.clone()),
                "type" | "link_type" => Value::String(link.link_type.clone()),
                _ => return false,
            };
            condition_holds(Some(&value), condition)
        })
}

/// A filter is a literal (equality) or `{operator: operand}` with
/// `==`, `!==`, `in`, `!in`, `like`, `<`, `<=`, `>`, `>=`.
fn condition_holds(value: Option<&Value>, condition: &Value) -> bool {
    let Value::Object(ops) = condition else {
        return value == Some(condition);
    };
    ops.iter().all(|(op, operand)| match op.as_str() {
        "==" => value == Some(operand),
        "!==" | "!=" => value != Some(operand),
        "in" => operand
            .as_array()
            .is_some_and(|items| value.is_some_and(|v| items.contains(v))),
        "!in" => operand
            .as_array()
            .is_some_and(|items| !value.is_some_and(|v| items.contains(v))),
        "like" => match (value.and_then(Value::as_str), operand.as_str()) {
            (Some(text), Some(pattern)) => like_match(text, pattern),
            _ => false,
        },
        "<" | "<=" | ">" | ">=" => match (value.and_then(Value::as_f64), operand.as_f64()) {
            (Some(a), Some(b)) => match op.as_str() {
                "<" => a < b,
                "<=" => a <= b,
                ">" => a > b,
                _ => a >= b,
            },
            _ => false,
        },
        _ => false,
    })
}

/// SQL `LIKE`: `%` any run of characters, `_` one character.
fn like_match(text: &str, pattern: &str) -> bool {
    let text: Vec<char> = text.chars().collect();
    let pattern: Vec<char> = pattern.chars().collect();
    let (mut t, mut p) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;
    while t < text.len() {
        if p < pattern.len() && (pattern[p] == '_' || pattern[p] == text[t]) {
            t += 1;
            p += 1;
        } else if p < pattern.len() && pattern[p] == '%' {
            backtrack = Some((p, t));
            p += 1;
        } else if let Some((bp, bt)) = backtrack {
            p = bp + 1;
            t = bt + 1;
            backtrack = Some((bp, bt + 1));
        } else {
            return false;
        }
    }
    pattern[p..].iter().all(|&c| c == '%')
}

#[cfg(test)]
pub(crate) mod fixtures {
    //! A small provenance graph: two structures in group `relaxed`, each
    //! produced by a calculation with an `output_parameters` dict.

    pub fn graph_json() -> String {
        serde_json::json!({
            "nodes": [
                {"uuid": "s1", "node_type": "data.core.structure.StructureData.",
                 "mtime": "2024-03-01T12:00:00+00:00",
                 "attributes": {
                     "cell": [[4.0, 0.0, 0.0], [0.0, 4.0, 0.0], [0.0, 0.0, 4.0]],
                     "pbc1": true, "pbc2": true, "pbc3": true,
                     "kinds": [{"name": "Na", "symbols": ["Na"], "weights": [1.0], "mass": 22.99},
                               {"name": "Cl", "symbols": ["Cl"], "weights": [1.0], "mass": 35.45}],
                     "sites": [{"kind_name": "Na", "position": [0.0, 0.0, 0.0]},
                               {"kind_name": "Cl", "position": [2.0, 2.0, 2.0]}]}},
                {"uuid": "s2", "node_type": "data.core.structure.StructureData.",
                 "attributes": {
                     "cell": [[3.0, 0.0, 0.0], [0.0, 3.0, 0.0], [0.0, 0.0, 3.0]],
                     "pbc1": true, "pbc2": true, "pbc3": true,
                     "kinds": [{"name": "Si", "symbols": ["Si"], "weights": [1.0]}],
                     "sites": [{"kind_name": "Si", "position": [0.0, 0.0, 0.0]}]}},
                {"uuid": "s3", "node_type": "data.core.structure.StructureData.",
                 "attributes": {"cell": [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
                                "kinds": [], "sites": []}},
                {"uuid": "c1", "node_type": "process.calculation.calcjob.CalcJobNode.",
                 "attributes": {"exit_status": 0}},
                {"uuid": "c2", "node_type": "process.calculation.calcjob.CalcJobNode.",
                 "attributes": {"exit_status": 0}},
                {"uuid": "c3", "node_type": "process.calculation.calcjob.CalcJobNode.",
                 "attributes": {"exit_status": 1}},
                {"uuid": "p1", "node_type": "data.core.dict.Dict.",
                 "attributes": {"energy": -3.5, "converged": true}},
                {"uuid": "p2", "node_type": "data.core.dict.Dict.",
                 "attributes": {"energy": -1.25}},
                {"uuid": "r2", "node_type": "data.core.dict.Dict.",
                 "attributes": {"note": "retrieved"}}
            ],
            "links": [
                {"input": "c1", "output": "s1", "link_type": "create", "label": "output_structure"},
                {"input": "c1", "output": "p1", "link_type": "create", "label": "output_parameters"},
                {"input": "c2", "output": "s2", "link_type": "create", "label": "output_structure"},
                {"input": "c2", "output": "p2", "link_type": "create", "label": "output_parameters"},
                {"input": "c2", "output": "r2", "link_type": "create", "label": "retrieved"},
                {"input": "s2", "output": "c3", "link_type": "input_calc", "label": "structure"}
            ],
            "groups": [{"label": "relaxed", "nodes": ["s1", "s2", "c1"]}]
        })
        .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::graph_json;
    use super::*;
    use serde_json::json;

    fn store() -> JsonGraphStore {
        JsonGraphStore::from_json(graph_json().as_bytes()).unwrap()
    }

    fn hop(node_type: &str) -> NodeHop {
        NodeHop {
            node_type: node_type.to_string(),
            ..Default::default()
        }
    }

    fn energy_query() -> Vec<TraversalStep> {
        let mut to_params = hop("Dict");
        to_params
            .edge_filters
            .insert("label".to_string(), json!("output_parameters"));
        vec![
            TraversalStep::Incoming(hop("CalcJobNode")),
            TraversalStep::Outgoing(to_params),
            TraversalStep::Project("attributes.energy".to_string()),
        ]
    }

    #[test]
    fn group_members_are_structure_nodes_in_storage_order() {
        let store = store();
        let locators = resolve_graph(&store, Some("relaxed")).unwrap();
        let paths: Vec<&str> = locators.iter().map(|l| l.path.as_str()).collect();
        assert_eq!(paths, vec!["s1", "s2"]);
        assert_eq!(locators[0].origin_node.as_deref(), Some("s1"));
        assert_eq!(locators[0].format(), GRAPH_STRUCTURE_FORMAT);
        assert!(locators[0].modified.is_some());
    }

    #[test]
    fn no_group_selects_every_structure() {
        let store = store();
        assert_eq!(resolve_graph(&store, None).unwrap().len(), 3);
    }

    #[test]
    fn missing_group_is_source_not_found() {
        let err = resolve_graph(&store(), Some("nope")).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<MakerError>(),
            Some(MakerError::SourceNotFound { .. })
        ));
    }

    #[test]
    fn traversal_follows_edge_filters() {
        let store = store();
        assert_eq!(
            traverse(&store, "s1", &energy_query()).unwrap(),
            Some(json!(-3.5))
        );
        assert_eq!(
            traverse(&store, "s2", &energy_query()).unwrap(),
            Some(json!(-1.25))
        );
    }

    #[test]
    fn ambiguous_hop_is_an_error() {
        let store = store();
        let steps = vec![
            TraversalStep::Incoming(hop("CalcJobNode")),
            TraversalStep::Outgoing(hop("Dict")),
            TraversalStep::Project("attributes.energy".to_string()),
        ];
        let err = traverse(&store, "s2", &steps).unwrap_err();
        assert!(err.contains("2 outgoing Dict nodes"), "{}", err);
    }

    #[test]
    fn missing_hop_is_an_error() {
        let store = store();
        let err = traverse(&store, "s3", &energy_query()).unwrap_err();
        assert!(err.contains("no incoming CalcJobNode"), "{}", err);
    }

    #[test]
    fn node_filters_select_candidates() {
        let store = store();
        let mut failed = hop("CalcJobNode");
        failed
            .filters
            .insert("attributes.exit_status".to_string(), json!({"==": 1}));
        let steps = vec![
            TraversalStep::Outgoing(failed),
            TraversalStep::Project("uuid".to_string()),
        ];
        assert_eq!(traverse(&store, "s2", &steps).unwrap(), Some(json!("c3")));
    }

    #[test]
    fn absent_projection_is_none() {
        let store = store();
        let steps = vec![TraversalStep::Project("attributes.missing".to_string())];
        assert_eq!(traverse(&store, "s1", &steps).unwrap(), None);
    }

    #[test]
    fn like_patterns() {
        assert!(like_match("output_parameters", "output%"));
        assert!(like_match("abc", "a_c"));
        assert!(like_match("abc", "%"));
        assert!(!like_match("abc", "a_"));
        assert!(like_match("a.b.c", "%.c"));
    }

    #[test]
    fn profile_lookup_uses_explicit_table_then_directory() {
        let tmp = tempfile::TempDir::new().unwrap();
        std::fs::write(tmp.path().join("main.json"), graph_json()).unwrap();

        let profiles = GraphProfiles::new([("alt".to_string(), tmp.path().join("main.json"))])
            .with_profile_dir(tmp.path().to_path_buf());
        assert_eq!(profiles.lookup("alt").unwrap(), tmp.path().join("main.json"));
        assert_eq!(profiles.lookup("main").unwrap(), tmp.path().join("main.json"));
        assert!(profiles.lookup("other").is_err());

        let store = open_graph(
            Path::new("/nonexistent"),
            &GraphSource::Profile("main".to_string()),
            &profiles,
        )
        .unwrap();
        assert_eq!(store.len(), 9);
    }

    #[test]
    fn graph_export_inside_zip() {
        let tmp = tempfile::TempDir::new().unwrap();
        let bytes = crate::archive::fixtures::zip_bytes(&[
            ("README.txt", b"export".as_slice()),
            ("graph.json", graph_json().as_bytes()),
        ]);
        std::fs::write(tmp.path().join("export.zip"), bytes).unwrap();
        let store = open_graph(
            tmp.path(),
            &GraphSource::File("export.zip".to_string()),
            &GraphProfiles::default(),
        )
        .unwrap();
        assert!(store.node("p1").is_some());
    }
}

//! `optimade.yaml` annotation file parsing and validation.
//!
//! The file lives at the root of a data archive and describes how the raw
//! files are turned into OPTIMADE entries:
//!
//! ```yaml
//! config_version: 0.1.0
//! database_description: Relaxed perovskites
//! entries:
//!   - entry_type: structures
//!     entry_paths:
//!       - file: structures.zip
//!         matches: ["cifs/**/*.cif"]
//!     property_paths:
//!       - file: data.csv
//!     property_definitions:
//!       - name: energy
//!         type: float
//!         unit: eV
//!         aliases: [total_energy]
//! ```
//!
//! Parsing happens in two steps: serde reads the YAML into loosely-typed
//! `Raw*` structs, then [`Config::from_raw`] validates them into the closed
//! types used by the pipeline. Every validation failure is a
//! [`MakerError::Config`] and is reported before any data file is opened.

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use crate::error::MakerError;

/// File names searched for at the archive root, in order.
pub const CONFIG_FILE_NAMES: [&str; 2] = ["optimade.yaml", "optimade.yml"];

// ═══════════════════════════════════════════════════════════════════════
// Validated model
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
pub struct Config {
    pub config_version: String,
    pub database_description: String,
    pub entries: Entries,
}

/// Either typed entry blocks to convert, or a prebuilt JSONL file.
#[derive(Debug, Clone)]
pub enum Entries {
    Typed(Vec<EntryConfig>),
    Jsonl(JsonlConfig),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JsonlConfig {
    /// Archive holding the JSONL file, if it is compressed.
    #[serde(default)]
    pub file: Option<String>,
    /// Path of the JSONL file, inside `file` when given.
    pub jsonl_path: String,
}

#[derive(Debug, Clone)]
pub struct EntryConfig {
    pub entry_type: EntryType,
    pub entry_paths: Vec<EntryPathSpec>,
    pub property_paths: Vec<FileSpec>,
    pub property_definitions: Vec<PropertyDefinition>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntryType {
    Structures,
    References,
    /// Provider-specific entry type, always starting with `_`.
    Custom(String),
}

impl EntryType {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "structures" => Some(EntryType::Structures),
            "references" => Some(EntryType::References),
            other if other.starts_with('_') && other.len() > 1 => {
                Some(EntryType::Custom(other.to_string()))
            }
            _ => None,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            EntryType::Structures => "structures",
            EntryType::References => "references",
            EntryType::Custom(name) => name,
        }
    }

    /// Position in the output stream: structures, references, then the rest.
    pub fn output_rank(&self) -> u8 {
        match self {
            EntryType::Structures => 0,
            EntryType::References => 1,
            EntryType::Custom(_) => 2,
        }
    }
}

impl std::fmt::Display for EntryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A file (archive, compressed file, plain file or directory) plus optional
/// glob patterns selecting members inside it.
#[derive(Debug, Clone, PartialEq)]
pub struct FileSpec {
    pub file: String,
    pub matches: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EntryPathSpec {
    Archive(FileSpec),
    Graph(GraphSpec),
}

#[derive(Debug, Clone, PartialEq)]
pub struct GraphSpec {
    pub source: GraphSource,
    /// Group label; `None` selects every structure node in the store.
    pub group: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GraphSource {
    /// Graph export file, relative to the archive root.
    File(String),
    /// Named profile, looked up in the run's profile table.
    Profile(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PropertyType {
    #[serde(alias = "str")]
    String,
    #[serde(alias = "int")]
    Integer,
    Float,
    #[serde(alias = "bool")]
    Boolean,
    Timestamp,
    List,
    #[serde(alias = "dict")]
    Dictionary,
}

impl PropertyType {
    /// OPTIMADE data type name.
    pub fn as_str(&self) -> &'static str {
        match self {
            PropertyType::String => "string",
            PropertyType::Integer => "integer",
            PropertyType::Float => "float",
            PropertyType::Boolean => "boolean",
            PropertyType::Timestamp => "timestamp",
            PropertyType::List => "list",
            PropertyType::Dictionary => "dictionary",
        }
    }
}

#[derive(Debug, Clone)]
pub struct PropertyDefinition {
    pub name: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub unit: Option<String>,
    pub property_type: PropertyType,
    pub maps_to: Option<String>,
    /// Alternate column/key names, tried in order after `name`.
    pub aliases: Vec<String>,
    pub required: bool,
    pub graph_query: Vec<TraversalStep>,
}

impl PropertyDefinition {
    /// Candidate source names: the primary name, then each alias.
    pub fn lookup_names(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.name.as_str()).chain(self.aliases.iter().map(String::as_str))
    }

    /// Attribute key under which the property is served.
    pub fn field_name(&self, provider_prefix: &str) -> String {
        prefixed_field(&self.name, provider_prefix)
    }
}

/// `_<prefix>_<name>`, unless `name` already carries the prefix.
pub fn prefixed_field(name: &str, provider_prefix: &str) -> String {
    let prefix = format!("_{}", provider_prefix);
    if name.starts_with(&prefix) {
        name.to_string()
    } else {
        format!("{}_{}", prefix, name)
    }
}

/// One step of a provenance-graph query.
#[derive(Debug, Clone, PartialEq)]
pub enum TraversalStep {
    /// Read an attribute path (e.g. `attributes.energy`) of the current node.
    Project(String),
    /// Move to the single incoming neighbour of the given node type.
    Incoming(NodeHop),
    /// Move to the single outgoing neighbour of the given node type.
    Outgoing(NodeHop),
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct NodeHop {
    pub node_type: String,
    pub filters: BTreeMap<String, Value>,
    pub edge_filters: BTreeMap<String, Value>,
}

// ═══════════════════════════════════════════════════════════════════════
// Raw (serde) model
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    #[serde(default)]
    config_version: Option<String>,
    database_description: String,
    entries: serde_yaml::Value,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawEntryConfig {
    entry_type: String,
    entry_paths: OneOrMany<RawPathSpec>,
    #[serde(default)]
    property_paths: Vec<RawPathSpec>,
    #[serde(default)]
    property_definitions: Vec<RawPropertyDefinition>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    Many(Vec<T>),
    One(T),
}

impl<T> OneOrMany<T> {
    fn into_vec(self) -> Vec<T> {
        match self {
            OneOrMany::Many(v) => v,
            OneOrMany::One(v) => vec![v],
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawPathSpec {
    #[serde(default)]
    file: Option<String>,
    #[serde(default)]
    matches: Option<Vec<String>>,
    #[serde(default, alias = "aiida_file")]
    graph_file: Option<String>,
    #[serde(default, alias = "aiida_profile")]
    graph_profile: Option<String>,
    #[serde(default, alias = "aiida_group")]
    graph_group: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawPropertyDefinition {
    name: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    unit: Option<String>,
    #[serde(rename = "type")]
    property_type: PropertyType,
    #[serde(default)]
    maps_to: Option<String>,
    #[serde(default)]
    aliases: Option<Vec<String>>,
    #[serde(default)]
    required: bool,
    #[serde(default, alias = "aiida_query")]
    graph_query: Option<OneOrMany<RawQueryStep>>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawQueryStep {
    #[serde(default)]
    project: Option<String>,
    #[serde(default)]
    incoming_node: Option<String>,
    #[serde(default)]
    outgoing_node: Option<String>,
    #[serde(default)]
    filters: Option<BTreeMap<String, Value>>,
    #[serde(default)]
    edge_filters: Option<BTreeMap<String, Value>>,
}

// ═══════════════════════════════════════════════════════════════════════
// Loading and validation
// ═══════════════════════════════════════════════════════════════════════

fn config_error(message: impl Into<String>) -> anyhow::Error {
    MakerError::Config(message.into()).into()
}

/// Locate the annotation file at the root of an archive directory.
pub fn find_config(archive_root: &Path) -> Result<PathBuf> {
    CONFIG_FILE_NAMES
        .iter()
        .map(|name| archive_root.join(name))
        .find(|p| p.is_file())
        .ok_or_else(|| {
            MakerError::SourceNotFound {
                path: archive_root.join(CONFIG_FILE_NAMES[0]).display().to_string(),
                reason: "no optimade.yaml or optimade.yml at the archive root".to_string(),
            }
            .into()
        })
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    Config::from_yaml(&content)
        .with_context(|| format!("Failed to load config file: {}", path.display()))
}

impl Config {
    pub fn from_yaml(content: &str) -> Result<Config> {
        let raw: RawConfig = serde_yaml::from_str(content)
            .map_err(|e| config_error(format!("malformed YAML: {}", e)))?;
        Config::from_raw(raw)
    }

    fn from_raw(raw: RawConfig) -> Result<Config> {
        let config_version = match raw.config_version {
            Some(v) if is_semver_like(&v) => v,
            other => return Err(MakerError::UnsupportedConfigVersion { found: other }.into()),
        };

        let entries = match raw.entries {
            serde_yaml::Value::Sequence(_) => {
                let raw_entries: Vec<RawEntryConfig> = serde_yaml::from_value(raw.entries)
                    .map_err(|e| config_error(format!("invalid entries: {}", e)))?;
                Entries::Typed(validate_entries(raw_entries)?)
            }
            serde_yaml::Value::Mapping(_) => {
                let jsonl: JsonlConfig = serde_yaml::from_value(raw.entries)
                    .map_err(|e| config_error(format!("invalid JSONL entries: {}", e)))?;
                Entries::Jsonl(jsonl)
            }
            _ => {
                return Err(config_error(
                    "entries must be a list of entry blocks or a JSONL mapping",
                ))
            }
        };

        Ok(Config {
            config_version,
            database_description: raw.database_description,
            entries,
        })
    }

    /// Entry blocks, empty for a JSONL passthrough config.
    pub fn entry_configs(&self) -> &[EntryConfig] {
        match &self.entries {
            Entries::Typed(entries) => entries,
            Entries::Jsonl(_) => &[],
        }
    }
}

fn is_semver_like(version: &str) -> bool {
    let parts: Vec<&str> = version.split('.').collect();
    parts.len() == 3
        && parts
            .iter()
            .all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()))
}

fn validate_entries(raw_entries: Vec<RawEntryConfig>) -> Result<Vec<EntryConfig>> {
    if raw_entries.is_empty() {
        return Err(config_error("entries must not be empty"));
    }

    let mut seen = HashSet::new();
    let mut entries = Vec::with_capacity(raw_entries.len());
    for raw in raw_entries {
        let entry_type = EntryType::parse(&raw.entry_type).ok_or_else(|| {
            config_error(format!(
                "entry type must be 'structures', 'references' or start with '_', not '{}'",
                raw.entry_type
            ))
        })?;
        if !seen.insert(entry_type.clone()) {
            return Err(config_error(format!(
                "entry type '{}' is listed more than once",
                entry_type
            )));
        }
        entries.push(validate_entry(entry_type, raw)?);
    }
    Ok(entries)
}

fn validate_entry(entry_type: EntryType, raw: RawEntryConfig) -> Result<EntryConfig> {
    let entry_paths = raw
        .entry_paths
        .into_vec()
        .into_iter()
        .map(|p| entry_path_spec(&entry_type, p))
        .collect::<Result<Vec<_>>>()?;

    if entry_paths.is_empty() {
        return Err(config_error(format!(
            "{}: at least one entry path is required",
            entry_type
        )));
    }
    let graph_count = entry_paths
        .iter()
        .filter(|p| matches!(p, EntryPathSpec::Graph(_)))
        .count();
    if graph_count > 0 && entry_paths.len() > 1 {
        return Err(config_error(format!(
            "{}: a graph source cannot be combined with other entry paths",
            entry_type
        )));
    }
    if graph_count > 0 && entry_type != EntryType::Structures {
        return Err(config_error(format!(
            "{}: graph sources only provide structures",
            entry_type
        )));
    }

    let property_paths = raw
        .property_paths
        .into_iter()
        .map(|p| match entry_path_spec(&entry_type, p)? {
            EntryPathSpec::Archive(spec) => Ok(spec),
            EntryPathSpec::Graph(_) => Err(config_error(format!(
                "{}: property paths must name a file, graph properties use graph_query",
                entry_type
            ))),
        })
        .collect::<Result<Vec<_>>>()?;

    let mut names = HashSet::new();
    let mut property_definitions = Vec::with_capacity(raw.property_definitions.len());
    for raw_def in raw.property_definitions {
        let def = property_definition(&entry_type, raw_def)?;
        if !names.insert(def.name.clone()) {
            return Err(config_error(format!(
                "{}: property '{}' is defined more than once",
                entry_type, def.name
            )));
        }
        if !def.graph_query.is_empty() && graph_count == 0 {
            return Err(config_error(format!(
                "{}: property '{}' has a graph query but the entries do not come from a graph source",
                entry_type, def.name
            )));
        }
        property_definitions.push(def);
    }

    Ok(EntryConfig {
        entry_type,
        entry_paths,
        property_paths,
        property_definitions,
    })
}

fn entry_path_spec(entry_type: &EntryType, raw: RawPathSpec) -> Result<EntryPathSpec> {
    let kinds = [
        raw.file.is_some(),
        raw.graph_file.is_some(),
        raw.graph_profile.is_some(),
    ]
    .iter()
    .filter(|set| **set)
    .count();
    if kinds != 1 {
        return Err(config_error(format!(
            "{}: each path must set exactly one of 'file', 'graph_file' or 'graph_profile'",
            entry_type
        )));
    }

    if let Some(file) = raw.file {
        if raw.graph_group.is_some() {
            return Err(config_error(format!(
                "{}: 'graph_group' is only valid for graph sources",
                entry_type
            )));
        }
        if file.trim().is_empty() {
            return Err(config_error(format!("{}: empty file path", entry_type)));
        }
        return Ok(EntryPathSpec::Archive(FileSpec {
            file,
            matches: raw.matches.unwrap_or_default(),
        }));
    }

    if raw.matches.is_some() {
        return Err(config_error(format!(
            "{}: 'matches' is only valid together with 'file'",
            entry_type
        )));
    }
    let source = match (raw.graph_file, raw.graph_profile) {
        (Some(file), None) => GraphSource::File(file),
        (None, Some(profile)) => GraphSource::Profile(profile),
        _ => unreachable!("exactly one locator kind checked above"),
    };
    Ok(EntryPathSpec::Graph(GraphSpec {
        source,
        group: raw.graph_group,
    }))
}

fn property_definition(
    entry_type: &EntryType,
    raw: RawPropertyDefinition,
) -> Result<PropertyDefinition> {
    if !is_identifier(&raw.name) {
        return Err(config_error(format!(
            "{}: property name '{}' must match ^[a-z_][a-z_0-9]*$",
            entry_type, raw.name
        )));
    }
    if let Some(maps_to) = &raw.maps_to {
        if !is_canonical_reference(maps_to) {
            return Err(config_error(format!(
                "{}: maps_to of '{}' must be an http(s) URI or a URN, not '{}'",
                entry_type, raw.name, maps_to
            )));
        }
    }

    let graph_query = match raw.graph_query {
        Some(steps) => traversal_steps(entry_type, &raw.name, steps.into_vec())?,
        None => Vec::new(),
    };

    Ok(PropertyDefinition {
        name: raw.name,
        title: raw.title,
        description: raw.description,
        unit: raw.unit,
        property_type: raw.property_type,
        maps_to: raw.maps_to,
        aliases: raw.aliases.unwrap_or_default(),
        required: raw.required,
        graph_query,
    })
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

fn is_canonical_reference(value: &str) -> bool {
    let rest = value
        .strip_prefix("https://")
        .or_else(|| value.strip_prefix("http://"))
        .or_else(|| value.strip_prefix("urn:"));
    matches!(rest, Some(r) if !r.is_empty() && !r.contains(char::is_whitespace))
}

fn traversal_steps(
    entry_type: &EntryType,
    property: &str,
    raw_steps: Vec<RawQueryStep>,
) -> Result<Vec<TraversalStep>> {
    let invalid = |message: &str| {
        config_error(format!(
            "{}: graph query of '{}': {}",
            entry_type, property, message
        ))
    };

    let mut steps = Vec::with_capacity(raw_steps.len());
    for raw in raw_steps {
        if matches!(steps.last(), Some(TraversalStep::Project(_))) {
            return Err(invalid("'project' must be the last step"));
        }
        let has_filters = raw.filters.is_some() || raw.edge_filters.is_some();
        let step = match (raw.project, raw.incoming_node, raw.outgoing_node) {
            (Some(path), None, None) => {
                if has_filters {
                    return Err(invalid(
                        "'filters' and 'edge_filters' only apply to incoming_node or outgoing_node",
                    ));
                }
                TraversalStep::Project(path)
            }
            (None, Some(node_type), None) => TraversalStep::Incoming(NodeHop {
                node_type,
                filters: raw.filters.unwrap_or_default(),
                edge_filters: raw.edge_filters.unwrap_or_default(),
            }),
            (None, None, Some(node_type)) => TraversalStep::Outgoing(NodeHop {
                node_type,
                filters: raw.filters.unwrap_or_default(),
                edge_filters: raw.edge_filters.unwrap_or_default(),
            }),
            (None, None, None) => {
                return Err(invalid(
                    "each step needs one of 'project', 'incoming_node' or 'outgoing_node'",
                ))
            }
            _ => {
                return Err(invalid(
                    "a step may set only one of 'project', 'incoming_node' or 'outgoing_node'",
                ))
            }
        };
        steps.push(step);
    }

    if !matches!(steps.last(), Some(TraversalStep::Project(_))) {
        return Err(invalid("the query must end with a 'project' step"));
    }
    Ok(steps)
}

//! Core data models used throughout optimake.
//!
//! These types represent the locators, parsed documents and entry records
//! that flow through the conversion pipeline. None of them outlive a run.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::config::EntryType;
use crate::structure::Structure;

/// Format hint attached to locators that come from a provenance graph.
pub const GRAPH_STRUCTURE_FORMAT: &str = "graph-structure";

/// One item selected by the source resolver.
#[derive(Debug, Clone)]
pub struct ResolvedLocator {
    /// Full path, `<file>/<member>` for archive members. Input to id assignment.
    pub path: String,
    /// Path of the item inside its archive (equals `path` for loose files).
    pub member: String,
    /// Raw bytes, already decompressed.
    pub content: Vec<u8>,
    pub modified: Option<DateTime<Utc>>,
    /// Explicit format, when it cannot be derived from the path extension.
    pub format_hint: Option<String>,
    /// Originating node for graph-sourced items.
    pub origin_node: Option<String>,
}

impl ResolvedLocator {
    pub fn from_bytes(path: String, member: String, content: Vec<u8>) -> Self {
        Self {
            path,
            member,
            content,
            modified: None,
            format_hint: None,
            origin_node: None,
        }
    }

    /// Lower-case format key: the explicit hint, or the file extension with
    /// compression suffixes removed (`1.cif.gz` → `cif`).
    pub fn format(&self) -> String {
        if let Some(hint) = &self.format_hint {
            return hint.clone();
        }
        file_format(&self.member)
    }
}

/// Lower-case extension of a path, ignoring `.gz`/`.bz2` suffixes.
pub fn file_format(path: &str) -> String {
    let name = path.rsplit('/').next().unwrap_or(path).to_lowercase();
    let name = name
        .strip_suffix(".gz")
        .or_else(|| name.strip_suffix(".bz2"))
        .unwrap_or(&name);
    match name.rfind('.') {
        Some(pos) if pos > 0 => name[pos + 1..].to_string(),
        _ => String::new(),
    }
}

/// What a parser produced for one document.
#[derive(Debug, Clone)]
pub enum DocumentContent {
    Structure(Structure),
    /// Ready-made OPTIMADE attributes (references, custom entry types).
    Attributes(Map<String, Value>),
}

/// One document produced by a parser.
#[derive(Debug, Clone)]
pub struct ParsedDocument {
    pub content: DocumentContent,
    /// Identifier hardcoded in the source data, if any.
    pub declared_id: Option<String>,
    /// Auxiliary key/value data shipped with the document, matched against
    /// property definitions by the joiner.
    pub extras: Map<String, Value>,
    /// Modification time recorded inside the document (graph nodes).
    pub last_modified: Option<String>,
}

impl ParsedDocument {
    pub fn structure(structure: Structure) -> Self {
        Self {
            content: DocumentContent::Structure(structure),
            declared_id: None,
            extras: Map::new(),
            last_modified: None,
        }
    }

    pub fn attributes(attributes: Map<String, Value>) -> Self {
        Self {
            content: DocumentContent::Attributes(attributes),
            declared_id: None,
            extras: Map::new(),
            last_modified: None,
        }
    }
}

/// An entry on its way to the output stream.
#[derive(Debug, Clone)]
pub struct EntryRecord {
    pub entry_type: EntryType,
    pub id: String,
    pub attributes: Map<String, Value>,
    /// Full locator path the record was parsed from.
    pub locator: String,
    /// Member path within the archive.
    pub member: String,
    pub origin_node: Option<String>,
    pub extras: Map<String, Value>,
}

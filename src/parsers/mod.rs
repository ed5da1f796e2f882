//! Format parsers and the per-run parser registry.
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │                ParserRegistry                 │
//! │  structures   references    _custom types     │
//! │  ┌─────────┐  ┌──────────┐  ┌──────────────┐  │
//! │  │CIF      │  │JSON      │  │JSON          │  │
//! │  │pymatgen │  │BibTeX    │  │attributes    │  │
//! │  │ext. XYZ │  └──────────┘  └──────────────┘  │
//! │  │graph    │                                  │
//! │  └─────────┘                                  │
//! └───────────────┬───────────────────────────────┘
//!                 ▼
//!      parse(entry type, locator) → Vec<ParsedDocument>
//! ```
//!
//! Parsers whose [`formats`](EntryParser::formats) contain the locator's
//! format are tried first, in registration order; when none claims the
//! format, every parser of the entry type is tried. The first parser that
//! yields at least one document wins.
//!
//! The registry is an ordinary value built once per run and passed down,
//! so tests can register their own parsers.

pub mod cif;
pub mod graph_node;
pub mod pymatgen;
pub mod references;
pub mod xyz;

use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::config::EntryType;
use crate::models::{ParsedDocument, ResolvedLocator};

/// Registry key collecting parsers for provider-specific entry types.
const CUSTOM_KEY: &str = "_";

/// Turns the raw bytes of one locator into documents.
pub trait EntryParser {
    /// Short name used in error messages.
    fn name(&self) -> &str;

    /// Lower-case file formats (extensions) this parser claims.
    fn formats(&self) -> &[&str];

    /// Parse the locator. A file holding several documents returns them
    /// in file order. Errors are human-readable reasons.
    fn parse(&self, locator: &ResolvedLocator) -> Result<Vec<ParsedDocument>, String>;
}

#[derive(Default)]
pub struct ParserRegistry {
    parsers: BTreeMap<String, Vec<Box<dyn EntryParser>>>,
}

impl ParserRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in parser.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(&EntryType::Structures, Box::new(cif::CifParser));
        registry.register(&EntryType::Structures, Box::new(pymatgen::PymatgenParser));
        registry.register(&EntryType::Structures, Box::new(xyz::ExtxyzParser));
        registry.register(&EntryType::Structures, Box::new(graph_node::GraphNodeParser));
        registry.register(&EntryType::References, Box::new(references::JsonReferenceParser));
        registry.register(&EntryType::References, Box::new(references::BibtexParser));
        registry.register(
            &EntryType::Custom(CUSTOM_KEY.to_string()),
            Box::new(JsonAttributesParser),
        );
        registry
    }

    /// Add a parser for `entry_type`. `Custom("_")` registers a parser for
    /// every custom entry type without a dedicated one.
    pub fn register(&mut self, entry_type: &EntryType, parser: Box<dyn EntryParser>) {
        self.parsers
            .entry(entry_type.as_str().to_string())
            .or_default()
            .push(parser);
    }

    fn parsers_for(&self, entry_type: &EntryType) -> &[Box<dyn EntryParser>] {
        let dedicated = self.parsers.get(entry_type.as_str());
        let fallback = match entry_type {
            EntryType::Custom(_) => self.parsers.get(CUSTOM_KEY),
            _ => None,
        };
        dedicated.or(fallback).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn supports(&self, entry_type: &EntryType) -> bool {
        !self.parsers_for(entry_type).is_empty()
    }

    pub fn parse(
        &self,
        entry_type: &EntryType,
        locator: &ResolvedLocator,
    ) -> Result<Vec<ParsedDocument>, String> {
        let all = self.parsers_for(entry_type);
        if all.is_empty() {
            return Err(format!("no parser registered for entry type '{}'", entry_type));
        }

        let format = locator.format();
        let claimed: Vec<&dyn EntryParser> = all
            .iter()
            .map(|p| &**p)
            .filter(|p| p.formats().contains(&format.as_str()))
            .collect();
        let candidates: Vec<&dyn EntryParser> = if claimed.is_empty() {
            all.iter().map(|p| &**p).collect()
        } else {
            claimed
        };

        let mut errors = Vec::new();
        for parser in candidates {
            match parser.parse(locator) {
                Ok(docs) if !docs.is_empty() => return Ok(docs),
                Ok(_) => errors.push(format!("{}: no documents", parser.name())),
                Err(reason) => errors.push(format!("{}: {}", parser.name(), reason)),
            }
        }
        Err(errors.join("; "))
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Shared helpers
// ═══════════════════════════════════════════════════════════════════════

pub(crate) fn utf8(locator: &ResolvedLocator) -> Result<&str, String> {
    std::str::from_utf8(&locator.content).map_err(|e| format!("not UTF-8 text: {}", e))
}

/// The objects of a JSON document: a list, a single object, or an object
/// whose values are lists of objects (`{"entries": [...]}`).
pub(crate) fn json_objects(value: Value) -> Result<Vec<Map<String, Value>>, String> {
    let items = match value {
        Value::Array(items) => items,
        Value::Object(map) if map.values().any(Value::is_array) && !looks_like_record(&map) => map
            .into_iter()
            .filter_map(|(_, v)| match v {
                Value::Array(items) => Some(items),
                _ => None,
            })
            .flatten()
            .collect(),
        Value::Object(map) => vec![Value::Object(map)],
        _ => return Err("expected a JSON object or list".to_string()),
    };
    items
        .into_iter()
        .map(|item| match item {
            Value::Object(map) => Ok(map),
            other => Err(format!("expected a JSON object, found {}", type_name(&other))),
        })
        .collect()
}

/// A single record carries scalar identity fields next to its lists.
fn looks_like_record(map: &Map<String, Value>) -> bool {
    map.contains_key("@class") || map.contains_key("id") || map.contains_key("attributes")
}

pub(crate) fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}

/// Declared id of a record: `id` as a string or number.
pub(crate) fn declared_id(map: &Map<String, Value>) -> Option<String> {
    match map.get("id")? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Custom entry types: JSON objects whose fields become attributes.
///
/// An object with an `attributes` member is taken as an OPTIMADE-style
/// record (`id`, `attributes`); otherwise every field except `id` is an
/// attribute.
pub struct JsonAttributesParser;

impl EntryParser for JsonAttributesParser {
    fn name(&self) -> &str {
        "json"
    }

    fn formats(&self) -> &[&str] {
        &["json"]
    }

    fn parse(&self, locator: &ResolvedLocator) -> Result<Vec<ParsedDocument>, String> {
        let value: Value = serde_json::from_str(utf8(locator)?).map_err(|e| e.to_string())?;
        json_objects(value)?
            .into_iter()
            .map(|mut map| {
                let id = declared_id(&map);
                map.remove("id");
                map.remove("type");
                let attributes = match map.remove("attributes") {
                    Some(Value::Object(attrs)) => attrs,
                    Some(other) => {
                        return Err(format!("'attributes' must be an object, found {}", type_name(&other)))
                    }
                    None => map,
                };
                let mut doc = ParsedDocument::attributes(attributes);
                doc.declared_id = id;
                Ok(doc)
            })
            .collect()
    }
}

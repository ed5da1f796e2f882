//! OPTIMADE JSON-Lines output.
//!
//! ```text
//! {"x-optimade": {"meta": {"api_version": "1.2.0"}}}      ← header
//! {"type": "info", "id": "structures", ...}              ← one per entry type
//! {"type": "info", "id": "references", ...}
//! {"id": "set1/101", "type": "structures", "attributes": {...}}
//! {"id": "set2/102", "type": "structures", "attributes": {...}}
//! ```
//!
//! Entry types are ordered structures, references, then custom types in
//! declaration order; records keep resolution order within their type.
//! The file is written to a temporary sibling and renamed into place, so a
//! failed run never leaves partial output behind.

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::config::{EntryType, PropertyDefinition};
use crate::error::MakerError;
use crate::models::EntryRecord;

pub const OPTIMADE_API_VERSION: &str = "1.2.0";

/// `(name, type, description)` of the standard fields shared by all entry
/// types.
const COMMON_FIELDS: &[(&str, &str, &str)] = &[
    ("id", "string", "An entry's ID as defined by the database provider."),
    ("type", "string", "The name of the type of an entry."),
    ("immutable_id", "string", "The entry's immutable ID."),
    ("last_modified", "timestamp", "Date and time representing when the entry was last modified."),
];

const STRUCTURE_FIELDS: &[(&str, &str, &str)] = &[
    ("elements", "list", "The chemical symbols of the different elements present in the structure."),
    ("nelements", "integer", "Number of different elements in the structure."),
    ("elements_ratios", "list", "Relative proportions of the different elements in the structure."),
    ("chemical_formula_descriptive", "string", "The chemical formula for a structure as a string in a form chosen by the API implementation."),
    ("chemical_formula_reduced", "string", "The reduced chemical formula for a structure."),
    ("chemical_formula_anonymous", "string", "The anonymous formula is the chemical_formula_reduced, but where the elements are instead first ordered by their chemical proportion number, and then, in order left to right, replaced by anonymous symbols A, B, C, ..., Z, Aa, Ba, ..., Za, Ab, Bb, ..."),
    ("dimension_types", "list", "List of three integers describing the periodicity of the boundaries of the unit cell."),
    ("nperiodic_dimensions", "integer", "An integer specifying the number of periodic dimensions in the structure."),
    ("lattice_vectors", "list", "The three lattice vectors in Cartesian coordinates, in angstrom."),
    ("cartesian_site_positions", "list", "Cartesian positions of each site in the structure, in angstrom."),
    ("nsites", "integer", "An integer specifying the length of the cartesian_site_positions property."),
    ("species", "list", "A list describing the species of the sites of this structure."),
    ("species_at_sites", "list", "Name of the species at each site."),
    ("structure_features", "list", "A list of strings that flag which special features are used by the structure."),
];

const REFERENCE_FIELDS: &[(&str, &str, &str)] = &[
    ("authors", "list", "List of person objects containing the authors of the reference."),
    ("editors", "list", "List of person objects containing the editors of the reference."),
    ("doi", "string", "The digital object identifier of the reference."),
    ("url", "string", "The URL of the reference."),
    ("address", "string", "Meaning of property matches the BiBTeX specification."),
    ("annote", "string", "Meaning of property matches the BiBTeX specification."),
    ("booktitle", "string", "Meaning of property matches the BiBTeX specification."),
    ("chapter", "string", "Meaning of property matches the BiBTeX specification."),
    ("crossref", "string", "Meaning of property matches the BiBTeX specification."),
    ("edition", "string", "Meaning of property matches the BiBTeX specification."),
    ("howpublished", "string", "Meaning of property matches the BiBTeX specification."),
    ("institution", "string", "Meaning of property matches the BiBTeX specification."),
    ("journal", "string", "Meaning of property matches the BiBTeX specification."),
    ("key", "string", "Meaning of property matches the BiBTeX specification."),
    ("month", "string", "Meaning of property matches the BiBTeX specification."),
    ("note", "string", "Meaning of property matches the BiBTeX specification."),
    ("number", "string", "Meaning of property matches the BiBTeX specification."),
    ("organization", "string", "Meaning of property matches the BiBTeX specification."),
    ("pages", "string", "Meaning of property matches the BiBTeX specification."),
    ("publisher", "string", "Meaning of property matches the BiBTeX specification."),
    ("school", "string", "Meaning of property matches the BiBTeX specification."),
    ("series", "string", "Meaning of property matches the BiBTeX specification."),
    ("title", "string", "Meaning of property matches the BiBTeX specification."),
    ("bib_type", "string", "Type of the reference, corresponding to the type property in the BiBTeX specification."),
    ("volume", "string", "Meaning of property matches the BiBTeX specification."),
    ("year", "string", "Meaning of property matches the BiBTeX specification."),
];

/// Records of one entry type together with its definitions.
pub struct EntryGroup<'a> {
    pub entry_type: &'a EntryType,
    pub definitions: &'a [PropertyDefinition],
    pub records: &'a [EntryRecord],
}

#[derive(Serialize)]
struct EntryLine<'a> {
    id: &'a str,
    #[serde(rename = "type")]
    entry_type: &'a str,
    attributes: &'a Map<String, Value>,
}

pub fn header() -> Value {
    json!({"x-optimade": {"meta": {"api_version": OPTIMADE_API_VERSION}}})
}

fn standard_fields(entry_type: &EntryType) -> impl Iterator<Item = &'static (&'static str, &'static str, &'static str)> {
    let specific: &[(&str, &str, &str)] = match entry_type {
        EntryType::Structures => STRUCTURE_FIELDS,
        EntryType::References => REFERENCE_FIELDS,
        EntryType::Custom(_) => &[],
    };
    COMMON_FIELDS.iter().chain(specific.iter())
}

/// The info record of one entry type: provider fields first, then the
/// standard fields of the type.
pub fn info_record(entry_type: &EntryType, definitions: &[PropertyDefinition], provider_prefix: &str) -> Value {
    let mut properties = Map::new();
    let mut order = Vec::new();

    for definition in definitions {
        let name = definition.field_name(provider_prefix);
        let mut field = Map::new();
        field.insert("type".to_string(), json!(definition.property_type.as_str()));
        let optional = [
            ("title", &definition.title),
            ("description", &definition.description),
            ("unit", &definition.unit),
            ("x-optimade-definition", &definition.maps_to),
        ];
        for (key, value) in optional {
            if let Some(v) = value {
                field.insert(key.to_string(), json!(v));
            }
        }
        order.push(name.clone());
        properties.insert(name, Value::Object(field));
    }

    for (name, kind, description) in standard_fields(entry_type) {
        if properties.contains_key(*name) {
            continue;
        }
        order.push(name.to_string());
        properties.insert(
            name.to_string(),
            json!({"type": kind, "description": description}),
        );
    }

    json!({
        "type": "info",
        "id": entry_type.as_str(),
        "description": entry_type.as_str(),
        "formats": ["json"],
        "properties": properties,
        "output_fields_by_format": {"json": order},
    })
}

pub fn entry_line(record: &EntryRecord) -> Result<String> {
    Ok(serde_json::to_string(&EntryLine {
        id: &record.id,
        entry_type: record.entry_type.as_str(),
        attributes: &record.attributes,
    })?)
}

/// Every output line, in stream order.
pub fn render(groups: &[EntryGroup], provider_prefix: &str) -> Result<Vec<String>> {
    let mut ordered: Vec<&EntryGroup> = groups.iter().collect();
    ordered.sort_by_key(|g| g.entry_type.output_rank());

    let mut lines = vec![header().to_string()];
    for group in &ordered {
        lines.push(info_record(group.entry_type, group.definitions, provider_prefix).to_string());
    }
    for group in &ordered {
        for record in group.records {
            lines.push(entry_line(record)?);
        }
    }
    Ok(lines)
}

/// Refuse to replace an existing output unless `overwrite` is set.
pub fn check_output(path: &Path, overwrite: bool) -> Result<()> {
    if path.exists() && !overwrite {
        return Err(MakerError::OutputExists(path.to_path_buf()).into());
    }
    Ok(())
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".partial");
    path.with_file_name(name)
}

/// Write `lines` to `path` through a temporary sibling file.
pub fn write_lines(path: &Path, lines: &[String], overwrite: bool) -> Result<()> {
    check_output(path, overwrite)?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create output directory: {}", parent.display()))?;
    }

    let temp = temp_path(path);
    let written = (|| -> Result<()> {
        let mut file = std::io::BufWriter::new(std::fs::File::create(&temp)?);
        for line in lines {
            file.write_all(line.as_bytes())?;
            file.write_all(b"\n")?;
        }
        file.flush()?;
        Ok(())
    })();
    if let Err(e) = written {
        let _ = std::fs::remove_file(&temp);
        return Err(e.context(format!("Failed to write {}", temp.display())));
    }

    std::fs::rename(&temp, path)
        .with_context(|| format!("Failed to move output into place: {}", path.display()))?;
    tracing::info!(path = %path.display(), lines = lines.len(), "wrote JSON-Lines output");
    Ok(())
}

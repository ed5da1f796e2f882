//! Property joining: attaching configured properties to entry records.
//!
//! Values come from three kinds of source, applied in this order so that
//! later sources win on conflict:
//!
//! | Source | Lookup |
//! |--------|--------|
//! | Document extras (e.g. `ComputedStructureEntry.data`) | definition name, then aliases |
//! | Property tables (CSV, TSV, JSON) in configured order | column by name, then first alias present |
//! | Provenance graph | `graph_query` traversal from the record's origin node |
//!
//! Table rows are matched to records by key: the record id, then the full
//! locator path, then the member path. A key without `/` may also name a
//! file (`101.cif`) or a bare stem (`101`) when exactly one record has it.
//! Anything else is an unresolved row. Every value is coerced to the declared type and stored under the
//! provider-prefixed field name.

use anyhow::Result;
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use crate::coerce::{coerce, display_value};
use crate::config::{EntryType, FileSpec, PropertyDefinition};
use crate::error::{ItemError, MakerError, RunReport};
use crate::graph::{traverse, GraphStore};
use crate::models::{file_format, EntryRecord, ResolvedLocator};
use crate::resolve::resolve_files;

/// One row of a property table: its key and non-empty cells.
#[derive(Debug, Clone)]
pub struct PropertyRow {
    pub key: String,
    pub values: Map<String, Value>,
}

/// A parsed property table.
#[derive(Debug, Clone)]
pub struct PropertyTable {
    /// Locator path the table was read from.
    pub source: String,
    pub key_column: String,
    /// Every column except the key column, in file order.
    pub columns: Vec<String>,
    pub rows: Vec<PropertyRow>,
    /// Rows that could not be read, as `row N: reason`.
    pub skipped: Vec<String>,
}

impl PropertyTable {
    /// Parse a CSV, TSV or JSON table. Errors are human-readable reasons.
    pub fn from_locator(locator: &ResolvedLocator) -> std::result::Result<Self, String> {
        match locator.format().as_str() {
            "csv" => delimited(locator, b','),
            "tsv" | "tab" => delimited(locator, b'\t'),
            "json" => json_table(locator),
            other => Err(format!("unsupported property file format '{}'", other)),
        }
    }

    /// The column providing `definition`: its name, else the first alias
    /// present.
    pub fn column_for<'a>(&self, definition: &'a PropertyDefinition) -> Option<&'a str> {
        definition
            .lookup_names()
            .find(|name| self.columns.iter().any(|c| c == name))
    }
}

/// `id`, else the first column whose name contains `id` (case-insensitive).
fn key_column(columns: &[String]) -> Option<String> {
    columns
        .iter()
        .find(|c| c.as_str() == "id")
        .or_else(|| columns.iter().find(|c| c.to_lowercase().contains("id")))
        .cloned()
}

fn delimited(locator: &ResolvedLocator, delimiter: u8) -> std::result::Result<PropertyTable, String> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(locator.content.as_slice());
    let headers: Vec<String> = reader
        .headers()
        .map_err(|e| e.to_string())?
        .iter()
        .map(str::to_string)
        .collect();
    let key = key_column(&headers).ok_or("no id column")?;

    let mut rows = Vec::new();
    let mut skipped = Vec::new();
    for (line, record) in reader.records().enumerate() {
        let record = match record {
            Ok(record) => record,
            Err(e) => {
                skipped.push(format!("row {}: {}", line + 1, e));
                continue;
            }
        };
        if record.len() != headers.len() {
            skipped.push(format!(
                "row {}: expected {} fields, found {}",
                line + 1,
                headers.len(),
                record.len()
            ));
            continue;
        }
        let mut values = Map::new();
        let mut row_key = None;
        for (header, cell) in headers.iter().zip(record.iter()) {
            if cell.is_empty() {
                continue;
            }
            if *header == key {
                row_key = Some(cell.to_string());
            } else {
                values.insert(header.clone(), Value::String(cell.to_string()));
            }
        }
        match row_key {
            Some(key) => rows.push(PropertyRow { key, values }),
            None => skipped.push(format!("row {}: empty id", line + 1)),
        }
    }

    Ok(PropertyTable {
        source: locator.path.clone(),
        columns: headers.into_iter().filter(|h| *h != key).collect(),
        key_column: key,
        rows,
        skipped,
    })
}

/// `{"<id>": {...}, ...}` or `[{"id": ..., ...}, ...]`.
fn json_table(locator: &ResolvedLocator) -> std::result::Result<PropertyTable, String> {
    let value: Value = serde_json::from_slice(&locator.content).map_err(|e| e.to_string())?;
    let mut skipped = Vec::new();
    let (key, keyed): (String, Vec<(String, Map<String, Value>)>) = match value {
        Value::Object(map) if map.values().all(Value::is_object) => (
            "id".to_string(),
            map.into_iter()
                .filter_map(|(k, v)| match v {
                    Value::Object(o) => Some((k, o)),
                    _ => None,
                })
                .collect(),
        ),
        Value::Array(items) => {
            let objects: Vec<Map<String, Value>> = items
                .into_iter()
                .map(|item| match item {
                    Value::Object(o) => Ok(o),
                    _ => Err("property list items must be objects".to_string()),
                })
                .collect::<std::result::Result<_, _>>()?;
            let mut names: Vec<String> = Vec::new();
            for object in &objects {
                for name in object.keys() {
                    if !names.contains(name) {
                        names.push(name.clone());
                    }
                }
            }
            let key = key_column(&names).ok_or("no id field")?;
            let mut keyed = Vec::with_capacity(objects.len());
            for (i, mut object) in objects.into_iter().enumerate() {
                let id = match object.remove(&key) {
                    Some(Value::String(s)) if !s.is_empty() => s,
                    Some(Value::Number(n)) => n.to_string(),
                    _ => {
                        skipped.push(format!("item {}: missing '{}'", i, key));
                        continue;
                    }
                };
                keyed.push((id, object));
            }
            (key, keyed)
        }
        _ => return Err("expected an object of objects or a list of objects".to_string()),
    };

    let mut columns: Vec<String> = Vec::new();
    let rows = keyed
        .into_iter()
        .map(|(id, values)| {
            for name in values.keys() {
                if !columns.contains(name) {
                    columns.push(name.clone());
                }
            }
            let values = values
                .into_iter()
                .filter(|(_, v)| !v.is_null() && v.as_str() != Some(""))
                .collect();
            PropertyRow { key: id, values }
        })
        .collect();

    Ok(PropertyTable {
        source: locator.path.clone(),
        key_column: key,
        columns,
        rows,
        skipped,
    })
}

/// Resolve and parse every property path. Members that are not tables
/// are ignored; unreadable tables are recorded as parse issues and skipped.
pub fn load_tables(root: &Path, specs: &[FileSpec], report: &mut RunReport) -> Result<Vec<PropertyTable>> {
    let mut tables = Vec::new();
    for spec in specs {
        for locator in resolve_files(root, spec)? {
            if !is_table_format(&locator.path) {
                tracing::debug!(path = %locator.path, "not a property table, skipping");
                continue;
            }
            match PropertyTable::from_locator(&locator) {
                Ok(table) => {
                    tracing::debug!(
                        source = %table.source,
                        rows = table.rows.len(),
                        skipped = table.skipped.len(),
                        key = %table.key_column,
                        "loaded property table"
                    );
                    for reason in &table.skipped {
                        report.record(ItemError::Parse {
                            path: table.source.clone(),
                            reason: reason.clone(),
                        });
                    }
                    tables.push(table);
                }
                Err(reason) => report.record(ItemError::Parse {
                    path: locator.path.clone(),
                    reason,
                }),
            }
        }
    }
    Ok(tables)
}

/// Whether `path` looks like a property table.
pub fn is_table_format(path: &str) -> bool {
    matches!(file_format(path).as_str(), "csv" | "tsv" | "tab" | "json")
}

// ═══════════════════════════════════════════════════════════════════════
// Row resolution
// ═══════════════════════════════════════════════════════════════════════

fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Final path component without extensions.
fn stem(path: &str) -> &str {
    let name = file_name(path);
    match name.char_indices().skip(1).find(|(_, c)| *c == '.') {
        Some((pos, _)) => &name[..pos],
        None => name,
    }
}

/// Lookup tables from row keys to record indices. `None` marks an
/// ambiguous key.
struct RowIndex {
    by_id: HashMap<String, usize>,
    by_locator: HashMap<String, usize>,
    by_member: HashMap<String, Option<usize>>,
    by_file_name: HashMap<String, Option<usize>>,
    by_stem: HashMap<String, Option<usize>>,
}

impl RowIndex {
    fn new(records: &[EntryRecord]) -> Self {
        let mut index = RowIndex {
            by_id: HashMap::new(),
            by_locator: HashMap::new(),
            by_member: HashMap::new(),
            by_file_name: HashMap::new(),
            by_stem: HashMap::new(),
        };
        for (i, record) in records.iter().enumerate() {
            index.by_id.insert(record.id.clone(), i);
            index.by_locator.insert(record.locator.clone(), i);
            insert_unique(&mut index.by_member, &record.member, i);
            insert_unique(&mut index.by_file_name, file_name(&record.locator), i);
            insert_unique(&mut index.by_stem, stem(&record.locator), i);
        }
        index
    }

    fn resolve(&self, key: &str) -> Option<usize> {
        if let Some(&i) = self.by_id.get(key).or_else(|| self.by_locator.get(key)) {
            return Some(i);
        }
        if let Some(slot) = self.by_member.get(key) {
            return *slot;
        }
        if key.contains('/') {
            return None;
        }
        let lookup = if stem(key) == key {
            &self.by_stem
        } else {
            &self.by_file_name
        };
        lookup.get(key).copied().flatten()
    }
}

fn insert_unique(map: &mut HashMap<String, Option<usize>>, key: &str, index: usize) {
    map.entry(key.to_string())
        .and_modify(|slot| {
            if *slot != Some(index) {
                *slot = None;
            }
        })
        .or_insert(Some(index));
}

// ═══════════════════════════════════════════════════════════════════════
// Joining
// ═══════════════════════════════════════════════════════════════════════

/// Everything the joiner needs besides the records and tables.
pub struct JoinContext<'a> {
    pub entry_type: &'a EntryType,
    pub definitions: &'a [PropertyDefinition],
    pub provider_prefix: &'a str,
    pub graph: Option<&'a dyn GraphStore>,
}

/// Field-consistency findings of one join.
#[derive(Debug, Default, PartialEq)]
pub struct JoinOutcome {
    /// Source fields that no definition covers; they are not emitted.
    pub unconfigured: Vec<String>,
    /// Definitions no source provided a value for.
    pub missing: Vec<String>,
}

/// Attach properties to `records`.
///
/// Fails with [`MakerError::MissingColumn`] when a required definition has
/// no source at all. Row, coercion and traversal problems are recorded in
/// `report`.
pub fn join(
    ctx: &JoinContext,
    records: &mut [EntryRecord],
    tables: &[PropertyTable],
    report: &mut RunReport,
) -> Result<JoinOutcome> {
    check_required(ctx, records, tables)?;

    let mut found: BTreeSet<&str> = BTreeSet::new();

    for record in records.iter_mut() {
        for definition in ctx.definitions {
            let Some(raw) = definition
                .lookup_names()
                .find_map(|name| record.extras.get(name).filter(|v| !v.is_null()).cloned())
            else {
                continue;
            };
            found.insert(definition.name.as_str());
            set_value(ctx, record, definition, &raw, report);
        }
    }

    let index = RowIndex::new(records);
    for table in tables {
        let columns: Vec<(&PropertyDefinition, &str)> = ctx
            .definitions
            .iter()
            .filter_map(|d| table.column_for(d).map(|column| (d, column)))
            .collect();
        for row in &table.rows {
            let Some(i) = index.resolve(&row.key) else {
                report.record(ItemError::UnresolvedPropertyRow {
                    source_path: table.source.clone(),
                    key: row.key.clone(),
                });
                continue;
            };
            for (definition, column) in &columns {
                if let Some(raw) = row.values.get(*column) {
                    found.insert(definition.name.as_str());
                    set_value(ctx, &mut records[i], definition, raw, report);
                }
            }
        }
    }

    if let Some(graph) = ctx.graph {
        for record in records.iter_mut() {
            let Some(origin) = record.origin_node.clone() else {
                continue;
            };
            for definition in ctx.definitions.iter().filter(|d| !d.graph_query.is_empty()) {
                match traverse(graph, &origin, &definition.graph_query) {
                    Ok(Some(raw)) => {
                        found.insert(definition.name.as_str());
                        set_value(ctx, record, definition, &raw, report);
                    }
                    Ok(None) => {}
                    Err(reason) => report.record(ItemError::Traversal {
                        id: record.id.clone(),
                        property: definition.name.clone(),
                        reason,
                    }),
                }
            }
        }
    }

    let outcome = consistency(ctx, records, tables, &found);
    if !outcome.unconfigured.is_empty() {
        tracing::warn!(
            entry_type = %ctx.entry_type,
            "fields {:?} are present in the data but not configured; they will be omitted",
            outcome.unconfigured
        );
    }
    if !outcome.missing.is_empty() {
        tracing::warn!(
            entry_type = %ctx.entry_type,
            "fields {:?} are configured but missing from the data; check for typos or missing aliases",
            outcome.missing
        );
    }
    Ok(outcome)
}

fn check_required(ctx: &JoinContext, records: &[EntryRecord], tables: &[PropertyTable]) -> Result<()> {
    for definition in ctx.definitions.iter().filter(|d| d.required) {
        let provided = !definition.graph_query.is_empty()
            || tables.iter().any(|t| t.column_for(definition).is_some())
            || records
                .iter()
                .any(|r| definition.lookup_names().any(|n| r.extras.contains_key(n)));
        if !provided {
            return Err(MakerError::MissingColumn {
                entry_type: ctx.entry_type.to_string(),
                name: definition.name.clone(),
            }
            .into());
        }
    }
    Ok(())
}

fn set_value(
    ctx: &JoinContext,
    record: &mut EntryRecord,
    definition: &PropertyDefinition,
    raw: &Value,
    report: &mut RunReport,
) {
    match coerce(raw, definition.property_type) {
        Some(value) => {
            record
                .attributes
                .insert(definition.field_name(ctx.provider_prefix), value);
        }
        None => report.record(ItemError::TypeCoercion {
            id: record.id.clone(),
            property: definition.name.clone(),
            value: display_value(raw),
            expected: definition.property_type.as_str().to_string(),
        }),
    }
}

fn consistency(
    ctx: &JoinContext,
    records: &[EntryRecord],
    tables: &[PropertyTable],
    found: &BTreeSet<&str>,
) -> JoinOutcome {
    let configured: BTreeSet<&str> = ctx
        .definitions
        .iter()
        .flat_map(|d| d.lookup_names())
        .collect();

    let mut present: BTreeSet<&str> = BTreeSet::new();
    for table in tables {
        present.extend(table.columns.iter().map(String::as_str));
    }
    for record in records {
        present.extend(record.extras.keys().map(String::as_str));
    }

    JoinOutcome {
        unconfigured: present
            .difference(&configured)
            .map(|s| s.to_string())
            .collect(),
        missing: ctx
            .definitions
            .iter()
            .filter(|d| !found.contains(d.name.as_str()))
            .map(|d| d.name.clone())
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PropertyType;
    use crate::graph::{fixtures::graph_json, JsonGraphStore};
    use crate::config::{NodeHop, TraversalStep};
    use serde_json::json;

    fn definition(name: &str, property_type: PropertyType) -> PropertyDefinition {
        PropertyDefinition {
            name: name.to_string(),
            title: None,
            description: None,
            unit: None,
            property_type,
            maps_to: None,
            aliases: Vec::new(),
            required: false,
            graph_query: Vec::new(),
        }
    }

    fn record(id: &str, locator: &str, member: &str) -> EntryRecord {
        EntryRecord {
            entry_type: EntryType::Structures,
            id: id.to_string(),
            attributes: Map::new(),
            locator: locator.to_string(),
            member: member.to_string(),
            origin_node: None,
            extras: Map::new(),
        }
    }

    fn records() -> Vec<EntryRecord> {
        vec![
            record("set1/101", "structures.zip/cifs/set1/101.cif", "cifs/set1/101.cif"),
            record("set2/102", "structures.zip/cifs/set2/102.cif", "cifs/set2/102.cif"),
        ]
    }

    fn table(path: &str, content: &str) -> PropertyTable {
        let locator =
            ResolvedLocator::from_bytes(path.to_string(), path.to_string(), content.as_bytes().to_vec());
        PropertyTable::from_locator(&locator).unwrap()
    }

    fn ctx<'a>(definitions: &'a [PropertyDefinition]) -> JoinContext<'a> {
        JoinContext {
            entry_type: &EntryType::Structures,
            definitions,
            provider_prefix: "exmpl",
            graph: None,
        }
    }

    #[test]
    fn key_column_selection() {
        let t = table("p.csv", "name,mat_id,energy\nx,set1/101,1\n");
        assert_eq!(t.key_column, "mat_id");
        assert_eq!(t.columns, vec!["name", "energy"]);
        let t = table("p.csv", "mat_id,id,energy\nx,set1/101,1\n");
        assert_eq!(t.key_column, "id");
        assert_eq!(t.rows[0].key, "set1/101");
    }

    #[test]
    fn rows_resolve_by_id_path_member_and_stem() {
        let defs = [definition("energy", PropertyType::Float)];
        let mut recs = records();
        let t = table(
            "p.csv",
            "id,energy\nset1/101,-1.0\nstructures.zip/cifs/set2/102.cif,-2.0\n",
        );
        let mut report = RunReport::new();
        join(&ctx(&defs), &mut recs, &[t], &mut report).unwrap();
        assert_eq!(recs[0].attributes["_exmpl_energy"], json!(-1.0));
        assert_eq!(recs[1].attributes["_exmpl_energy"], json!(-2.0));

        let mut recs = records();
        let t = table("p.tsv", "id\tenergy\ncifs/set1/101.cif\t-3.0\n102.cif\t-4.0\n");
        join(&ctx(&defs), &mut recs, &[t], &mut report).unwrap();
        assert_eq!(recs[0].attributes["_exmpl_energy"], json!(-3.0));
        assert_eq!(recs[1].attributes["_exmpl_energy"], json!(-4.0));
        assert!(report.is_empty());
    }

    #[test]
    fn ambiguous_stems_do_not_resolve() {
        let defs = [definition("energy", PropertyType::Float)];
        let mut recs = vec![
            record("a/1", "x.zip/a/1.cif", "a/1.cif"),
            record("b/1", "x.zip/b/1.cif", "b/1.cif"),
        ];
        let mut report = RunReport::new();
        join(&ctx(&defs), &mut recs, &[table("p.csv", "id,energy\n1,2.0\nzzz,1\n")], &mut report).unwrap();
        assert_eq!(report.count("unresolved property row"), 2);
        assert!(recs.iter().all(|r| r.attributes.is_empty()));
    }

    #[test]
    fn aliases_and_missing_optional_columns() {
        let mut energy = definition("energy", PropertyType::Float);
        energy.aliases = vec!["E".to_string(), "total_energy".to_string()];
        let defs = [energy, definition("band_gap", PropertyType::Float)];
        let mut recs = records();
        let mut report = RunReport::new();
        let outcome = join(
            &ctx(&defs),
            &mut recs,
            &[table("p.csv", "id,total_energy,E,note\nset1/101,5,-1.5,x\nset2/102,6,,y\n")],
            &mut report,
        )
        .unwrap();
        // The first alias present in the table wins, empty cells are absent.
        assert_eq!(recs[0].attributes["_exmpl_energy"], json!(-1.5));
        assert!(!recs[1].attributes.contains_key("_exmpl_energy"));
        assert!(!recs[0].attributes.contains_key("_exmpl_band_gap"));
        assert_eq!(outcome.unconfigured, vec!["note"]);
        assert_eq!(outcome.missing, vec!["band_gap"]);
    }

    #[test]
    fn required_without_source_is_fatal() {
        let mut gap = definition("band_gap", PropertyType::Float);
        gap.required = true;
        let defs = [gap];
        let mut recs = records();
        let err = join(
            &ctx(&defs),
            &mut recs,
            &[table("p.csv", "id,energy\nset1/101,1\n")],
            &mut RunReport::new(),
        )
        .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<MakerError>(),
            Some(MakerError::MissingColumn { name, .. }) if name == "band_gap"
        ));
    }

    #[test]
    fn coercion_failures_drop_the_value() {
        let defs = [definition("count", PropertyType::Integer)];
        let mut recs = records();
        let mut report = RunReport::new();
        join(
            &ctx(&defs),
            &mut recs,
            &[table("p.csv", "id,count\nset1/101,3\nset2/102,three\n")],
            &mut report,
        )
        .unwrap();
        assert_eq!(recs[0].attributes["_exmpl_count"], json!(3));
        assert!(!recs[1].attributes.contains_key("_exmpl_count"));
        assert_eq!(
            report.issues()[0],
            ItemError::TypeCoercion {
                id: "set2/102".to_string(),
                property: "count".to_string(),
                value: "three".to_string(),
                expected: "integer".to_string(),
            }
        );
    }

    #[test]
    fn table_order_only_matters_on_conflict() {
        let defs = [
            definition("energy", PropertyType::Float),
            definition("gap", PropertyType::Float),
        ];
        let a = table("a.csv", "id,energy\nset1/101,1\n");
        let b = table("b.json", r#"{"set1/101": {"gap": 0.5}}"#);
        let c = table("c.json", r#"[{"id": "set1/101", "energy": 2}]"#);

        let mut ab = records();
        join(&ctx(&defs), &mut ab, &[a.clone(), b.clone()], &mut RunReport::new()).unwrap();
        let mut ba = records();
        join(&ctx(&defs), &mut ba, &[b, a.clone()], &mut RunReport::new()).unwrap();
        assert_eq!(ab[0].attributes, ba[0].attributes);

        let mut ac = records();
        join(&ctx(&defs), &mut ac, &[a, c], &mut RunReport::new()).unwrap();
        assert_eq!(ac[0].attributes["_exmpl_energy"], json!(2.0));
    }

    #[test]
    fn embedded_extras_are_matched_by_name_then_alias() {
        let mut gap = definition("band_gap", PropertyType::Float);
        gap.aliases = vec!["gap".to_string()];
        let defs = [gap];
        let mut recs = records();
        recs[0].extras.insert("gap".to_string(), json!(1.1));
        recs[1].extras.insert("band_gap".to_string(), json!(0.2));
        recs[1].extras.insert("gap".to_string(), json!(9.9));
        join(&ctx(&defs), &mut recs, &[], &mut RunReport::new()).unwrap();
        assert_eq!(recs[0].attributes["_exmpl_band_gap"], json!(1.1));
        assert_eq!(recs[1].attributes["_exmpl_band_gap"], json!(0.2));
    }

    #[test]
    fn graph_queries_run_from_origin_nodes() {
        let store = JsonGraphStore::from_json(graph_json().as_bytes()).unwrap();
        let mut params = NodeHop {
            node_type: "Dict".to_string(),
            ..Default::default()
        };
        params
            .edge_filters
            .insert("label".to_string(), json!("output_parameters"));
        let mut energy = definition("energy", PropertyType::Float);
        energy.graph_query = vec![
            TraversalStep::Incoming(NodeHop {
                node_type: "CalcJobNode".to_string(),
                ..Default::default()
            }),
            TraversalStep::Outgoing(params),
            TraversalStep::Project("attributes.energy".to_string()),
        ];
        let defs = [energy];

        let mut recs = vec![record("s1", "s1", "s1"), record("s3", "s3", "s3")];
        recs[0].origin_node = Some("s1".to_string());
        recs[1].origin_node = Some("s3".to_string());

        let context = JoinContext {
            graph: Some(&store),
            ..ctx(&defs)
        };
        let mut report = RunReport::new();
        join(&context, &mut recs, &[], &mut report).unwrap();
        assert_eq!(recs[0].attributes["_exmpl_energy"], json!(-3.5));
        assert!(recs[1].attributes.is_empty());
        assert_eq!(report.count("graph traversal"), 1);
    }

    #[test]
    fn malformed_tables_are_rejected() {
        let bad = |path: &str, content: &str| {
            let locator = ResolvedLocator::from_bytes(
                path.to_string(),
                path.to_string(),
                content.as_bytes().to_vec(),
            );
            PropertyTable::from_locator(&locator).unwrap_err()
        };
        assert_eq!(bad("p.csv", "name,energy\nx,1\n"), "no id column");
        assert!(bad("p.json", "[1, 2]").contains("objects"));
        assert!(bad("p.xlsx", "").contains("unsupported"));
    }

    #[test]
    fn unknown_path_keys_do_not_fall_back_to_stems() {
        let defs = [definition("energy", PropertyType::Float)];
        let mut recs = records();
        let mut report = RunReport::new();
        join(
            &ctx(&defs),
            &mut recs,
            &[table("p.csv", "id,energy\n101,-1.0\nset9/101,-7.0\n")],
            &mut report,
        )
        .unwrap();
        // A bare stem names its unique record; a path naming no record does not.
        assert_eq!(recs[0].attributes["_exmpl_energy"], json!(-1.0));
        assert!(recs[1].attributes.is_empty());
        assert_eq!(
            report.issues(),
            &[ItemError::UnresolvedPropertyRow {
                source_path: "p.csv".to_string(),
                key: "set9/101".to_string(),
            }]
        );
    }

    #[test]
    fn bad_rows_are_skipped_one_by_one() {
        let t = table("p.csv", "id,energy,gap\nset1/101,-1.0,0.5\nset2/102,-2.0\n,-3.0,0.1\n");
        assert_eq!(t.rows.len(), 1);
        assert_eq!(t.rows[0].key, "set1/101");
        assert_eq!(t.skipped.len(), 2);
        assert!(t.skipped[0].starts_with("row 2: expected 3 fields, found 2"));
        assert_eq!(t.skipped[1], "row 3: empty id");

        let t = table("p.json", r#"[{"id": "set1/101", "gap": 1}, {"gap": 2}]"#);
        assert_eq!(t.rows.len(), 1);
        assert_eq!(t.skipped, vec!["item 1: missing 'id'"]);
    }

    #[test]
    fn loading_reports_bad_rows_and_keeps_the_rest() {
        let tmp = tempfile::TempDir::new().unwrap();
        std::fs::write(
            tmp.path().join("props.csv"),
            "id,energy,gap\nset1/101,-1.0,0.5\nset2/102,-2.0\n",
        )
        .unwrap();
        let spec = FileSpec {
            file: "props.csv".to_string(),
            matches: Vec::new(),
        };
        let mut report = RunReport::new();
        let tables = load_tables(tmp.path(), &[spec], &mut report).unwrap();
        assert_eq!(tables.len(), 1);
        assert_eq!(report.count("parse"), 1);

        let defs = [definition("energy", PropertyType::Float)];
        let mut recs = records();
        join(&ctx(&defs), &mut recs, &tables, &mut report).unwrap();
        assert_eq!(recs[0].attributes["_exmpl_energy"], json!(-1.0));
        assert!(recs[1].attributes.is_empty());
    }

    #[test]
    fn stems() {
        assert_eq!(stem("set1/101.cif"), "101");
        assert_eq!(stem("a.b.c"), "a");
        assert_eq!(stem(".hidden"), ".hidden");
        assert!(is_table_format("data/props.TSV"));
    }
}

//! Conversion pipeline orchestration.
//!
//! Coordinates the full flow for every configured entry type:
//!
//! ```text
//! optimade.yaml ──▶ resolve ──▶ parse ──▶ normalize ──▶ assign ids
//!                                                        │
//!   optimade.jsonl ◀── emit ◀── join properties ◀────────┘
//! ```
//!
//! Fatal errors ([`MakerError`]) abort the run before anything is written.
//! Per-item problems are collected in a [`RunReport`] and summarized at the
//! end. A config whose `entries` points at a prebuilt JSONL file is copied
//! through after validation.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::archive::open_source;
use crate::coerce::parse_timestamp;
use crate::config::{find_config, load_config, Config, Entries, EntryConfig, EntryPathSpec, JsonlConfig};
use crate::emit::{self, EntryGroup};
use crate::error::{ItemError, MakerError, RunReport};
use crate::graph::{GraphProfiles, GraphStore, JsonGraphStore};
use crate::ids::assign_ids;
use crate::models::{DocumentContent, EntryRecord, ParsedDocument, ResolvedLocator};
use crate::parsers::ParserRegistry;
use crate::progress::{ConvertProgressEvent, ConvertProgressReporter};
use crate::properties::{join, load_tables, JoinContext};
use crate::resolve::{resolve, resolve_files};

/// Environment variable overriding the default provider prefix.
pub const PROVIDER_PREFIX_ENV: &str = "OPTIMAKE_PROVIDER_PREFIX";

pub const DEFAULT_PROVIDER_PREFIX: &str = "optimake";

/// Default output file name, written at the archive root.
pub const DEFAULT_OUTPUT: &str = "optimade.jsonl";

/// Provider prefix from [`PROVIDER_PREFIX_ENV`], else [`DEFAULT_PROVIDER_PREFIX`].
pub fn default_provider_prefix() -> String {
    std::env::var(PROVIDER_PREFIX_ENV)
        .ok()
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| DEFAULT_PROVIDER_PREFIX.to_string())
}

/// Runtime options of a conversion.
#[derive(Debug, Clone)]
pub struct ConvertOptions {
    /// Output path; `<archive>/optimade.jsonl` when unset.
    pub output: Option<PathBuf>,
    pub overwrite: bool,
    /// Maximum number of locators taken from each entry path.
    pub limit: Option<usize>,
    pub provider_prefix: String,
    pub profiles: GraphProfiles,
}

impl Default for ConvertOptions {
    fn default() -> Self {
        Self {
            output: None,
            overwrite: false,
            limit: None,
            provider_prefix: default_provider_prefix(),
            profiles: GraphProfiles::default().with_env(),
        }
    }
}

impl ConvertOptions {
    pub fn output_path(&self, archive: &Path) -> PathBuf {
        self.output
            .clone()
            .unwrap_or_else(|| archive.join(DEFAULT_OUTPUT))
    }
}

/// Outcome of a successful conversion.
#[derive(Debug)]
pub struct ConvertSummary {
    pub output: PathBuf,
    /// Entry counts per type, in output order.
    pub counts: Vec<(String, usize)>,
    pub lines: usize,
    pub report: RunReport,
    /// Set when the archive shipped a prebuilt JSONL file.
    pub passthrough: bool,
}

/// Convert the archive at `archive` and print a summary to stdout.
pub fn run_convert(
    archive: &Path,
    options: &ConvertOptions,
    progress: &dyn ConvertProgressReporter,
) -> Result<ConvertSummary> {
    let summary = convert_archive(archive, options, progress)?;

    println!("convert {}", archive.display());
    if summary.passthrough {
        println!("  prebuilt JSONL copied");
    }
    for (entry_type, count) in &summary.counts {
        println!("  {}: {} entries", entry_type, count);
    }
    println!("  lines written: {}", summary.lines);
    if !summary.report.is_empty() {
        println!("  skipped or dropped items: {}", summary.report.issues().len());
        for line in summary.report.summary() {
            println!("    {}", line);
        }
    }
    println!("  output: {}", summary.output.display());
    println!("ok");
    Ok(summary)
}

/// Convert the archive at `archive` into an OPTIMADE JSONL file.
pub fn convert_archive(
    archive: &Path,
    options: &ConvertOptions,
    progress: &dyn ConvertProgressReporter,
) -> Result<ConvertSummary> {
    let config = load_config(&find_config(archive)?)?;
    let output = options.output_path(archive);
    emit::check_output(&output, options.overwrite)?;

    tracing::info!(
        archive = %archive.display(),
        description = %config.database_description,
        "converting archive"
    );

    match &config.entries {
        Entries::Jsonl(jsonl) => {
            let lines = passthrough(archive, jsonl, &output, options.overwrite)?;
            Ok(ConvertSummary {
                output,
                counts: Vec::new(),
                lines,
                report: RunReport::new(),
                passthrough: true,
            })
        }
        Entries::Typed(entries) => {
            let registry = ParserRegistry::with_defaults();
            let mut report = RunReport::new();
            let mut built = Vec::with_capacity(entries.len());
            for entry in entries {
                let records = build_entries(archive, entry, &registry, options, progress, &mut report)
                    .with_context(|| format!("Failed to convert {} entries", entry.entry_type))?;
                built.push((entry, records));
            }

            let groups: Vec<EntryGroup> = built
                .iter()
                .map(|(entry, records)| EntryGroup {
                    entry_type: &entry.entry_type,
                    definitions: &entry.property_definitions,
                    records,
                })
                .collect();
            let lines = emit::render(&groups, &options.provider_prefix)?;
            progress.report(ConvertProgressEvent::Writing {
                lines: lines.len() as u64,
            });
            emit::write_lines(&output, &lines, options.overwrite)?;

            let mut counts: Vec<(u8, String, usize)> = built
                .iter()
                .map(|(entry, records)| {
                    (
                        entry.entry_type.output_rank(),
                        entry.entry_type.to_string(),
                        records.len(),
                    )
                })
                .collect();
            counts.sort_by_key(|(rank, _, _)| *rank);

            Ok(ConvertSummary {
                output,
                counts: counts.into_iter().map(|(_, t, n)| (t, n)).collect(),
                lines: lines.len(),
                report,
                passthrough: false,
            })
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Entry building
// ═══════════════════════════════════════════════════════════════════════

/// A parsed document waiting for its identifier.
struct ParsedItem {
    path: String,
    locator: ResolvedLocator,
    doc: ParsedDocument,
}

/// Resolve, parse, identify and join the entries of one entry block.
pub fn build_entries(
    archive: &Path,
    entry: &EntryConfig,
    registry: &ParserRegistry,
    options: &ConvertOptions,
    progress: &dyn ConvertProgressReporter,
    report: &mut RunReport,
) -> Result<Vec<EntryRecord>> {
    let entry_type = entry.entry_type.to_string();
    if !registry.supports(&entry.entry_type) {
        bail!("No parser is registered for entry type '{}'", entry_type);
    }

    progress.report(ConvertProgressEvent::Resolving {
        entry_type: entry_type.clone(),
    });
    let mut locators = Vec::new();
    let mut graph: Option<JsonGraphStore> = None;
    for spec in &entry.entry_paths {
        let mut resolution = resolve(archive, spec, &options.profiles)?;
        if let Some(limit) = options.limit {
            resolution.locators.truncate(limit);
        }
        tracing::debug!(
            entry_type = %entry_type,
            locators = resolution.locators.len(),
            "resolved entry path"
        );
        locators.extend(resolution.locators);
        if graph.is_none() {
            graph = resolution.graph;
        }
    }

    let items = parse_all(entry, registry, locators, progress, report)?;
    let mut records = identify(entry, items)?;

    let tables = load_tables(archive, &entry.property_paths, report)?;
    progress.report(ConvertProgressEvent::Joining {
        entry_type: entry_type.clone(),
        tables: tables.len() as u64,
    });
    let ctx = JoinContext {
        entry_type: &entry.entry_type,
        definitions: &entry.property_definitions,
        provider_prefix: &options.provider_prefix,
        graph: graph.as_ref().map(|g| g as &dyn GraphStore),
    };
    join(&ctx, &mut records, &tables, report)?;

    tracing::info!(entry_type = %entry_type, entries = records.len(), "built entries");
    Ok(records)
}

fn parse_all(
    entry: &EntryConfig,
    registry: &ParserRegistry,
    locators: Vec<ResolvedLocator>,
    progress: &dyn ConvertProgressReporter,
    report: &mut RunReport,
) -> Result<Vec<ParsedItem>> {
    let total = locators.len();
    let mut items = Vec::new();

    for (n, locator) in locators.into_iter().enumerate() {
        progress.report(ConvertProgressEvent::Parsing {
            entry_type: entry.entry_type.to_string(),
            n: n as u64 + 1,
            total: total as u64,
        });

        let docs = match registry.parse(&entry.entry_type, &locator) {
            Ok(docs) => docs,
            Err(reason) => {
                report.record(ItemError::Parse {
                    path: locator.path.clone(),
                    reason,
                });
                continue;
            }
        };

        let multiple = docs.len() > 1;
        for (i, mut doc) in docs.into_iter().enumerate() {
            let path = if multiple {
                format!("{}/{}", locator.path, i)
            } else {
                locator.path.clone()
            };
            if let DocumentContent::Structure(structure) = doc.content {
                match structure.normalize() {
                    Ok(normalized) => doc.content = DocumentContent::Structure(normalized),
                    Err(reason) => {
                        report.record(ItemError::Parse { path, reason });
                        continue;
                    }
                }
            }
            items.push(ParsedItem {
                path,
                locator: locator.clone(),
                doc,
            });
        }
    }

    if items.is_empty() {
        return Err(MakerError::NoEntriesParsed {
            entry_type: entry.entry_type.to_string(),
            attempted: total,
        }
        .into());
    }
    Ok(items)
}

/// Assign ids and build the records' base attributes.
fn identify(entry: &EntryConfig, items: Vec<ParsedItem>) -> Result<Vec<EntryRecord>> {
    let paths: Vec<String> = items.iter().map(|item| item.path.clone()).collect();
    let derived = assign_ids(&paths)?;

    let mut seen: HashMap<String, String> = HashMap::new();
    let mut records = Vec::with_capacity(items.len());
    for (item, derived_id) in items.into_iter().zip(derived) {
        let id = item.doc.declared_id.clone().unwrap_or(derived_id);
        if let Some(first) = seen.insert(id.clone(), item.path.clone()) {
            return Err(MakerError::IdentifierCollision {
                id,
                first,
                second: item.path,
            }
            .into());
        }

        let mut attributes = match item.doc.content {
            DocumentContent::Structure(structure) => structure.to_attributes(),
            DocumentContent::Attributes(attributes) => attributes,
        };
        let immutable_id = item.doc.declared_id.clone().unwrap_or_else(|| item.path.clone());
        attributes.insert("immutable_id".to_string(), json!(immutable_id));
        if let Some(modified) = last_modified(item.doc.last_modified.as_deref(), item.locator.modified) {
            attributes.insert("last_modified".to_string(), json!(modified));
        }

        records.push(EntryRecord {
            entry_type: entry.entry_type.clone(),
            id,
            attributes,
            locator: item.path,
            member: item.locator.member,
            origin_node: item.locator.origin_node,
            extras: item.doc.extras,
        });
    }
    Ok(records)
}

/// RFC 3339 UTC time of the document, else of its archive member.
fn last_modified(recorded: Option<&str>, member: Option<DateTime<Utc>>) -> Option<String> {
    recorded
        .and_then(parse_timestamp)
        .or(member)
        .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
}

// ═══════════════════════════════════════════════════════════════════════
// Prebuilt JSONL
// ═══════════════════════════════════════════════════════════════════════

fn read_jsonl(archive: &Path, jsonl: &JsonlConfig) -> Result<Vec<u8>> {
    match &jsonl.file {
        Some(file) => {
            let wanted = jsonl.jsonl_path.trim_start_matches("./");
            let contents = open_source(archive, file)?;
            contents
                .members
                .into_iter()
                .find(|m| m.path == wanted || m.path.ends_with(&format!("/{}", wanted)))
                .map(|m| m.content)
                .ok_or_else(|| {
                    MakerError::SourceNotFound {
                        path: format!("{}/{}", file, wanted),
                        reason: "JSONL file not found in archive".to_string(),
                    }
                    .into()
                })
        }
        None => {
            let contents = open_source(archive, &jsonl.jsonl_path)?;
            contents
                .members
                .into_iter()
                .next()
                .map(|m| m.content)
                .ok_or_else(|| {
                    MakerError::SourceNotFound {
                        path: jsonl.jsonl_path.clone(),
                        reason: "empty JSONL source".to_string(),
                    }
                    .into()
                })
        }
    }
}

/// Validate a prebuilt JSONL file and return its non-empty lines.
pub fn validate_jsonl(content: &[u8], source: &str) -> Result<Vec<String>> {
    let text = std::str::from_utf8(content)
        .map_err(|e| MakerError::Config(format!("{} is not UTF-8: {}", source, e)))?;
    let lines: Vec<String> = text
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(str::to_string)
        .collect();

    for (n, line) in lines.iter().enumerate() {
        let value: Value = serde_json::from_str(line).map_err(|e| {
            MakerError::Config(format!("{} line {} is not valid JSON: {}", source, n + 1, e))
        })?;
        if n == 0 && value.get("x-optimade").is_none() {
            return Err(MakerError::Config(format!(
                "{} does not start with an x-optimade header line",
                source
            ))
            .into());
        }
    }
    if lines.is_empty() {
        return Err(MakerError::Config(format!("{} is empty", source)).into());
    }
    Ok(lines)
}

fn passthrough(archive: &Path, jsonl: &JsonlConfig, output: &Path, overwrite: bool) -> Result<usize> {
    let content = read_jsonl(archive, jsonl)?;
    let lines = validate_jsonl(&content, &jsonl.jsonl_path)?;

    let source = archive.join(&jsonl.jsonl_path);
    let same_file = jsonl.file.is_none()
        && matches!(
            (source.canonicalize(), output.canonicalize()),
            (Ok(a), Ok(b)) if a == b
        );
    if same_file {
        tracing::info!(path = %output.display(), "prebuilt JSONL is already in place");
        return Ok(lines.len());
    }

    emit::write_lines(output, &lines, overwrite)?;
    Ok(lines.len())
}

// ═══════════════════════════════════════════════════════════════════════
// Dry-run check
// ═══════════════════════════════════════════════════════════════════════

/// Locator counts of one configured source.
#[derive(Debug)]
pub struct SourceCheck {
    pub entry_type: String,
    /// `entry` or `property`.
    pub role: &'static str,
    pub source: String,
    pub locators: usize,
}

#[derive(Debug)]
pub struct CheckSummary {
    pub config: Config,
    pub sources: Vec<SourceCheck>,
    /// First few derived ids per entry type.
    pub sample_ids: Vec<(String, Vec<String>)>,
}

const SAMPLE_IDS: usize = 5;

fn describe(spec: &EntryPathSpec) -> String {
    match spec {
        EntryPathSpec::Archive(file) => file.file.clone(),
        EntryPathSpec::Graph(graph) => match &graph.source {
            crate::config::GraphSource::File(f) => format!("graph {}", f),
            crate::config::GraphSource::Profile(p) => format!("graph profile {}", p),
        },
    }
}

/// Validate the config and resolve every source without parsing.
pub fn check_archive(archive: &Path, options: &ConvertOptions) -> Result<CheckSummary> {
    let config = load_config(&find_config(archive)?)?;
    let mut sources = Vec::new();
    let mut sample_ids = Vec::new();

    if let Entries::Jsonl(jsonl) = &config.entries {
        let content = read_jsonl(archive, jsonl)?;
        let lines = validate_jsonl(&content, &jsonl.jsonl_path)?;
        sources.push(SourceCheck {
            entry_type: "jsonl".to_string(),
            role: "entry",
            source: jsonl.jsonl_path.clone(),
            locators: lines.len(),
        });
    }

    for entry in config.entry_configs() {
        let mut paths = Vec::new();
        for spec in &entry.entry_paths {
            let mut resolution = resolve(archive, spec, &options.profiles)?;
            if let Some(limit) = options.limit {
                resolution.locators.truncate(limit);
            }
            sources.push(SourceCheck {
                entry_type: entry.entry_type.to_string(),
                role: "entry",
                source: describe(spec),
                locators: resolution.locators.len(),
            });
            paths.extend(resolution.locators.into_iter().map(|l| l.path));
        }
        for spec in &entry.property_paths {
            let locators = resolve_files(archive, spec)?;
            sources.push(SourceCheck {
                entry_type: entry.entry_type.to_string(),
                role: "property",
                source: spec.file.clone(),
                locators: locators.len(),
            });
        }
        if !paths.is_empty() {
            let ids = assign_ids(&paths)?;
            sample_ids.push((
                entry.entry_type.to_string(),
                ids.into_iter().take(SAMPLE_IDS).collect(),
            ));
        }
    }

    Ok(CheckSummary {
        config,
        sources,
        sample_ids,
    })
}

/// Run [`check_archive`] and print its findings to stdout.
pub fn run_check(archive: &Path, options: &ConvertOptions) -> Result<()> {
    let summary = check_archive(archive, options)?;
    println!("check {}", archive.display());
    println!("  config version: {}", summary.config.config_version);
    println!("  description: {}", summary.config.database_description);
    for source in &summary.sources {
        println!(
            "  {} {} {}: {} files",
            source.entry_type, source.role, source.source, source.locators
        );
    }
    for (entry_type, ids) in &summary.sample_ids {
        println!("  {} ids: {}", entry_type, ids.join(", "));
    }
    println!("ok");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::fixtures::zip_bytes;
    use crate::progress::NoProgress;
    use tempfile::TempDir;

    const NACL: &str = "data_nacl\n_cell_length_a 5.64\n_cell_length_b 5.64\n_cell_length_c 5.64\n_cell_angle_alpha 90\n_cell_angle_beta 90\n_cell_angle_gamma 90\nloop_\n_atom_site_label\n_atom_site_type_symbol\n_atom_site_fract_x\n_atom_site_fract_y\n_atom_site_fract_z\nNa1 Na 0 0 0\nCl1 Cl 0.5 0.5 0.5\n";

    fn options() -> ConvertOptions {
        ConvertOptions {
            output: None,
            overwrite: false,
            limit: None,
            provider_prefix: "exmpl".to_string(),
            profiles: GraphProfiles::default(),
        }
    }

    fn archive(config: &str, files: &[(&str, &[u8])]) -> TempDir {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("optimade.yaml"), config).unwrap();
        for (name, content) in files {
            let path = tmp.path().join(name);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).unwrap();
            }
            std::fs::write(path, content).unwrap();
        }
        tmp
    }

    fn output_lines(tmp: &TempDir) -> Vec<Value> {
        std::fs::read_to_string(tmp.path().join(DEFAULT_OUTPUT))
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    const STRUCTURES: &str = r#"
config_version: 0.1.0
database_description: test
entries:
  - entry_type: structures
    entry_paths:
      - file: structures.zip
        matches: ["cifs/**/*.cif"]
    property_paths:
      - file: props.csv
    property_definitions:
      - name: energy
        type: float
        aliases: [total_energy]
"#;

    fn structures_zip(second: &str) -> Vec<u8> {
        zip_bytes(&[
            ("cifs/set1/101.cif", NACL.as_bytes()),
            ("cifs/set2/102.cif", second.as_bytes()),
        ])
    }

    #[test]
    fn converts_zip_of_cifs_with_properties() {
        let zip = structures_zip(NACL);
        let tmp = archive(
            STRUCTURES,
            &[
                ("structures.zip", zip.as_slice()),
                ("props.csv", b"id,total_energy,note\nset1/101,-1.5,a\nset2/102,-2.5,b\n".as_slice()),
            ],
        );
        let summary = convert_archive(tmp.path(), &options(), &NoProgress).unwrap();
        assert_eq!(summary.counts, vec![("structures".to_string(), 2)]);
        assert!(summary.report.is_empty());

        let lines = output_lines(&tmp);
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0]["x-optimade"]["meta"]["api_version"], json!("1.2.0"));
        assert_eq!(lines[1]["id"], json!("structures"));
        assert_eq!(lines[2]["id"], json!("set1/101"));
        assert_eq!(lines[2]["attributes"]["_exmpl_energy"], json!(-1.5));
        assert_eq!(
            lines[2]["attributes"]["immutable_id"],
            json!("structures.zip/cifs/set1/101.cif")
        );
        assert_eq!(lines[3]["attributes"]["chemical_formula_reduced"], json!("ClNa"));
        assert!(lines[3]["attributes"].get("note").is_none());
    }

    #[test]
    fn unparseable_item_is_skipped() {
        let zip = structures_zip("data_broken\n_cell_length_a oops\n");
        let tmp = archive(
            STRUCTURES,
            &[("structures.zip", zip.as_slice()), ("props.csv", b"id,energy\n101,-1\n".as_slice())],
        );
        let summary = convert_archive(tmp.path(), &options(), &NoProgress).unwrap();
        assert_eq!(summary.report.count("parse"), 1);
        let lines = output_lines(&tmp);
        assert_eq!(lines.len(), 3);
        // A single surviving path keeps only its stem.
        assert_eq!(lines[2]["id"], json!("101"));
        assert_eq!(lines[2]["attributes"]["_exmpl_energy"], json!(-1.0));
    }

    #[test]
    fn nothing_parsed_is_fatal_and_writes_nothing() {
        let zip = zip_bytes(&[("cifs/a.cif", b"garbage".as_slice())]);
        let tmp = archive(STRUCTURES, &[("structures.zip", zip.as_slice()), ("props.csv", b"id\n".as_slice())]);
        let err = convert_archive(tmp.path(), &options(), &NoProgress).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<MakerError>(),
            Some(MakerError::NoEntriesParsed { attempted: 1, .. })
        ));
        assert!(!tmp.path().join(DEFAULT_OUTPUT).exists());
    }

    #[test]
    fn existing_output_is_refused_before_work() {
        let zip = structures_zip(NACL);
        let tmp = archive(
            STRUCTURES,
            &[("structures.zip", zip.as_slice()), ("props.csv", b"id\n".as_slice()), (DEFAULT_OUTPUT, b"keep\n".as_slice())],
        );
        let err = convert_archive(tmp.path(), &options(), &NoProgress).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<MakerError>(),
            Some(MakerError::OutputExists(_))
        ));

        let mut overwrite = options();
        overwrite.overwrite = true;
        convert_archive(tmp.path(), &overwrite, &NoProgress).unwrap();
        assert_eq!(output_lines(&tmp).len(), 4);
    }

    #[test]
    fn limit_caps_each_entry_path() {
        let zip = structures_zip(NACL);
        let tmp = archive(STRUCTURES, &[("structures.zip", zip.as_slice()), ("props.csv", b"id\n".as_slice())]);
        let mut limited = options();
        limited.limit = Some(1);
        let summary = convert_archive(tmp.path(), &limited, &NoProgress).unwrap();
        assert_eq!(summary.counts[0].1, 1);
    }

    #[test]
    fn declared_ids_win_and_must_be_unique() {
        let config = r#"
config_version: 0.1.0
database_description: refs
entries:
  - entry_type: references
    entry_paths:
      - file: refs.json
"#;
        let tmp = archive(
            config,
            &[("refs.json", br#"[{"id": "smith2020", "title": "A"}, {"id": "doe2021", "title": "B"}]"#.as_slice())],
        );
        convert_archive(tmp.path(), &options(), &NoProgress).unwrap();
        let lines = output_lines(&tmp);
        assert_eq!(lines[2]["id"], json!("smith2020"));
        assert_eq!(lines[2]["type"], json!("references"));
        assert_eq!(lines[2]["attributes"]["immutable_id"], json!("smith2020"));

        let tmp = archive(
            config,
            &[("refs.json", br#"[{"id": "same", "title": "A"}, {"id": "same", "title": "B"}]"#.as_slice())],
        );
        let err = convert_archive(tmp.path(), &options(), &NoProgress).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<MakerError>(),
            Some(MakerError::IdentifierCollision { .. })
        ));
    }

    #[test]
    fn prebuilt_jsonl_is_validated_and_copied() {
        let config = "config_version: 0.1.0\ndatabase_description: x\nentries:\n  file: data.zip\n  jsonl_path: db.jsonl\n";
        let jsonl = "{\"x-optimade\": {\"meta\": {\"api_version\": \"1.1.0\"}}}\n{\"type\": \"info\", \"id\": \"structures\"}\n";
        let zip = zip_bytes(&[("db.jsonl", jsonl.as_bytes())]);
        let tmp = archive(config, &[("data.zip", zip.as_slice())]);
        let summary = convert_archive(tmp.path(), &options(), &NoProgress).unwrap();
        assert!(summary.passthrough);
        assert_eq!(output_lines(&tmp).len(), 2);

        assert!(validate_jsonl(b"{\"type\": \"info\"}\n", "x").is_err());
        assert!(validate_jsonl(b"{\"x-optimade\": {}}\nnot json\n", "x").is_err());
    }

    #[test]
    fn check_resolves_without_writing() {
        let zip = structures_zip(NACL);
        let tmp = archive(STRUCTURES, &[("structures.zip", zip.as_slice()), ("props.csv", b"id\n".as_slice())]);
        let summary = check_archive(tmp.path(), &options()).unwrap();
        assert_eq!(summary.sources.len(), 2);
        assert_eq!(summary.sources[0].locators, 2);
        assert_eq!(summary.sources[1].role, "property");
        assert_eq!(
            summary.sample_ids,
            vec![("structures".to_string(), vec!["set1/101".to_string(), "set2/102".to_string()])]
        );
        assert!(!tmp.path().join(DEFAULT_OUTPUT).exists());
    }

    #[test]
    fn last_modified_prefers_recorded_time() {
        let member = DateTime::parse_from_rfc3339("2020-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(
            last_modified(Some("2024-03-01T12:00:00+02:00"), Some(member)).as_deref(),
            Some("2024-03-01T10:00:00Z")
        );
        assert_eq!(
            last_modified(None, Some(member)).as_deref(),
            Some("2020-01-01T00:00:00Z")
        );
        assert_eq!(last_modified(Some("garbage"), None), None);
    }
}

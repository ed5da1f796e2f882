//! Serving a converted archive through an external OPTIMADE server.
//!
//! `optimake serve <archive>` makes sure `optimade.jsonl` exists (converting
//! the archive when it does not), derives the server configuration from
//! the JSONL and launches the server process:
//!
//! ```text
//! archive/ ──convert──▶ optimade.jsonl ──read info lines──▶ provider_fields
//!                                │                               │
//!                                ▼                               ▼
//!                     optimade_config.json ◀──────── base_url, provider
//!                                │
//!                                ▼
//!     OPTIMADE_CONFIG_FILE=… uvicorn optimade.server.main:app --host … --port …
//! ```
//!
//! Ctrl-C stops the child process.

use anyhow::{bail, Context, Result};
use serde_json::{json, Map, Value};
use std::io::BufRead;
use std::path::{Path, PathBuf};

use crate::convert::{run_convert, ConvertOptions, DEFAULT_OUTPUT};
use crate::progress::ConvertProgressReporter;

/// File name of the generated server configuration, next to the JSONL.
pub const SERVER_CONFIG_FILE: &str = "optimade_config.json";

/// Environment variable the server reads its configuration path from.
pub const SERVER_CONFIG_ENV: &str = "OPTIMADE_CONFIG_FILE";

pub const DEFAULT_SERVER_COMMAND: [&str; 2] = ["uvicorn", "optimade.server.main:app"];

/// Entry types whose custom fields the server can declare.
const PROVIDER_FIELD_TYPES: [&str; 2] = ["structures", "references"];

#[derive(Debug, Clone)]
pub struct ServeOptions {
    pub host: String,
    pub port: u16,
    /// Server program and its leading arguments.
    pub command: Vec<String>,
    /// JSON file merged over the generated configuration.
    pub extra_config: Option<PathBuf>,
    /// Prefix to serve under; detected from the JSONL when unset.
    pub provider_prefix: Option<String>,
    pub convert: ConvertOptions,
}

impl Default for ServeOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5000,
            command: DEFAULT_SERVER_COMMAND.iter().map(|s| s.to_string()).collect(),
            extra_config: None,
            provider_prefix: None,
            convert: ConvertOptions::default(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Provider fields
// ═══════════════════════════════════════════════════════════════════════

/// Swap the prefix of a `_<prefix>_<name>` field.
pub fn replace_provider_prefix(name: &str, prefix: &str) -> String {
    let parts: Vec<&str> = name.split('_').collect();
    if parts.len() > 2 {
        format!("_{}_{}", prefix, parts[2..].join("_"))
    } else {
        format!("_{}", prefix)
    }
}

/// Info records of a JSONL file: every line after the header up to the
/// first entry record. Malformed lines are skipped with a warning.
fn info_records(jsonl: &Path) -> Result<Vec<Value>> {
    let file = std::fs::File::open(jsonl)
        .with_context(|| format!("Failed to open {}", jsonl.display()))?;
    let mut records = Vec::new();
    for (n, line) in std::io::BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let value: Value = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(_) => {
                tracing::warn!(line = n + 1, "skipping malformed JSONL line");
                continue;
            }
        };
        if value.get("x-optimade").is_some() {
            continue;
        }
        if value.get("properties").is_none() {
            break;
        }
        records.push(value);
    }
    Ok(records)
}

/// Entry type an info record describes: `id` for `type: info` records,
/// `description` for older files without a type.
fn info_entry_type(record: &Value) -> Option<&str> {
    match record.get("type").and_then(Value::as_str) {
        Some("info") => record.get("id").and_then(Value::as_str),
        Some(_) => None,
        None => record.get("description").and_then(Value::as_str),
    }
}

/// Custom (`_`-prefixed) fields declared in the info records, per entry
/// type, as `{name, description, unit, type}` objects.
pub fn provider_fields(jsonl: &Path, replace_prefix: Option<&str>) -> Result<Map<String, Value>> {
    let mut fields = Map::new();
    for record in info_records(jsonl)? {
        let Some(entry_type) = info_entry_type(&record) else {
            continue;
        };
        if !PROVIDER_FIELD_TYPES.contains(&entry_type) {
            continue;
        }
        let Some(properties) = record.get("properties").and_then(Value::as_object) else {
            continue;
        };
        let declared: Vec<Value> = properties
            .iter()
            .filter(|(name, _)| name.starts_with('_'))
            .map(|(name, definition)| {
                let name = match replace_prefix {
                    Some(prefix) => replace_provider_prefix(name, prefix),
                    None => name.clone(),
                };
                let mut field = Map::new();
                field.insert("name".to_string(), json!(name));
                for key in ["description", "unit", "type"] {
                    if let Some(v) = definition.get(key).filter(|v| !v.is_null()) {
                        field.insert(key.to_string(), v.clone());
                    }
                }
                Value::Object(field)
            })
            .collect();
        if !declared.is_empty() {
            fields.insert(entry_type.to_string(), Value::Array(declared));
        }
    }
    Ok(fields)
}

/// Prefix used by the custom fields of a JSONL file, if any.
pub fn detect_provider_prefix(jsonl: &Path) -> Result<Option<String>> {
    for record in info_records(jsonl)? {
        let Some(properties) = record.get("properties").and_then(Value::as_object) else {
            continue;
        };
        for name in properties.keys() {
            let mut parts = name.splitn(3, '_');
            if let (Some(""), Some(prefix), Some(_)) = (parts.next(), parts.next(), parts.next()) {
                if !prefix.is_empty() {
                    return Ok(Some(prefix.to_string()));
                }
            }
        }
    }
    Ok(None)
}

// ═══════════════════════════════════════════════════════════════════════
// Server configuration
// ═══════════════════════════════════════════════════════════════════════

/// Configuration JSON for the OPTIMADE server.
pub fn server_config(jsonl: &Path, options: &ServeOptions) -> Result<Value> {
    let detected = detect_provider_prefix(jsonl)?;
    let prefix = options
        .provider_prefix
        .clone()
        .or_else(|| detected.clone())
        .unwrap_or_else(|| options.convert.provider_prefix.clone());
    let replace = match &detected {
        Some(found) if *found != prefix => {
            tracing::warn!(
                detected = %found,
                serving = %prefix,
                "provider prefix differs from the one in the JSONL; renaming declared fields"
            );
            Some(prefix.as_str())
        }
        _ => None,
    };

    let mut config = json!({
        "debug": false,
        "insert_test_data": false,
        "insert_from_jsonl": jsonl.display().to_string(),
        "database_backend": "mongomock",
        "base_url": format!("http://{}:{}", options.host, options.port),
        "provider": {
            "prefix": prefix,
            "name": "Optimake",
            "description": "Provider created with optimake",
            "homepage": null,
        },
        "provider_fields": provider_fields(jsonl, replace)?,
    });

    if let Some(extra) = &options.extra_config {
        let text = std::fs::read_to_string(extra)
            .with_context(|| format!("Failed to read extra server config: {}", extra.display()))?;
        let extra: Value = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse extra server config: {}", extra.display()))?;
        let Value::Object(extra) = extra else {
            bail!("Extra server config must be a JSON object");
        };
        if let Value::Object(map) = &mut config {
            map.extend(extra);
        }
    }
    Ok(config)
}

pub fn write_server_config(dir: &Path, config: &Value) -> Result<PathBuf> {
    let path = dir.join(SERVER_CONFIG_FILE);
    std::fs::write(&path, serde_json::to_string_pretty(config)?)
        .with_context(|| format!("Failed to write server config: {}", path.display()))?;
    Ok(path)
}

/// Convert if needed, write the server config and run the server until it
/// exits or Ctrl-C is pressed.
pub async fn run_serve(
    archive: &Path,
    options: &ServeOptions,
    progress: &dyn ConvertProgressReporter,
) -> Result<()> {
    if !archive.is_dir() {
        bail!("Archive directory does not exist: {}", archive.display());
    }
    let jsonl = archive.join(DEFAULT_OUTPUT);
    if jsonl.exists() {
        tracing::info!(path = %jsonl.display(), "using existing JSONL");
    } else {
        tracing::info!(path = %jsonl.display(), "JSONL missing, converting archive");
        let convert = ConvertOptions {
            output: Some(jsonl.clone()),
            ..options.convert.clone()
        };
        run_convert(archive, &convert, progress)?;
    }

    let config = server_config(&jsonl, options)?;
    let config_path = write_server_config(archive, &config)?;

    let Some((program, args)) = options.command.split_first() else {
        bail!("Empty server command");
    };
    tracing::info!(
        command = %options.command.join(" "),
        config = %config_path.display(),
        "starting OPTIMADE server"
    );
    let mut child = tokio::process::Command::new(program)
        .args(args)
        .arg("--host")
        .arg(&options.host)
        .arg("--port")
        .arg(options.port.to_string())
        .env(SERVER_CONFIG_ENV, &config_path)
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("Failed to start server command '{}'", program))?;

    tokio::select! {
        status = child.wait() => {
            let status = status?;
            if !status.success() {
                bail!("Server exited with {}", status);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("stopping server");
            child.kill().await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const JSONL: &str = r#"{"x-optimade": {"meta": {"api_version": "1.2.0"}}}
{"type": "info", "id": "structures", "properties": {"_exmpl_energy": {"type": "float", "unit": "eV", "description": "E", "title": null}, "nsites": {"type": "integer"}}}
{"type": "info", "id": "_exmpl_calcs", "properties": {"_exmpl_code": {"type": "string"}}}
{"id": "a", "type": "structures", "attributes": {"_exmpl_energy": 1.0}}
{"type": "info", "id": "references", "properties": {"_exmpl_late": {"type": "string"}}}
"#;

    fn jsonl() -> (TempDir, PathBuf) {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(DEFAULT_OUTPUT);
        std::fs::write(&path, JSONL).unwrap();
        (tmp, path)
    }

    #[test]
    fn prefix_replacement() {
        assert_eq!(replace_provider_prefix("_exmpl_band_gap", "mcloud"), "_mcloud_band_gap");
        assert_eq!(replace_provider_prefix("_exmpl", "mcloud"), "_mcloud");
    }

    #[test]
    fn provider_fields_come_from_leading_info_lines() {
        let (_tmp, path) = jsonl();
        let fields = provider_fields(&path, None).unwrap();
        assert_eq!(
            Value::Object(fields),
            json!({"structures": [{"name": "_exmpl_energy", "type": "float", "unit": "eV", "description": "E"}]})
        );
        let renamed = provider_fields(&path, Some("other")).unwrap();
        assert_eq!(renamed["structures"][0]["name"], json!("_other_energy"));
    }

    #[test]
    fn prefix_is_detected() {
        let (_tmp, path) = jsonl();
        assert_eq!(detect_provider_prefix(&path).unwrap().as_deref(), Some("exmpl"));
    }

    #[test]
    fn config_uses_detected_prefix_and_extra_file() {
        let (tmp, path) = jsonl();
        let extra = tmp.path().join("extra.json");
        std::fs::write(&extra, r#"{"debug": true, "page_limit": 50}"#).unwrap();
        let options = ServeOptions {
            extra_config: Some(extra),
            ..ServeOptions::default()
        };
        let config = server_config(&path, &options).unwrap();
        assert_eq!(config["provider"]["prefix"], json!("exmpl"));
        assert_eq!(config["base_url"], json!("http://127.0.0.1:5000"));
        assert_eq!(config["debug"], json!(true));
        assert_eq!(config["page_limit"], json!(50));
        assert_eq!(config["insert_from_jsonl"], json!(path.display().to_string()));

        let written = write_server_config(tmp.path(), &config).unwrap();
        let back: Value = serde_json::from_str(&std::fs::read_to_string(written).unwrap()).unwrap();
        assert_eq!(back, config);
    }
}

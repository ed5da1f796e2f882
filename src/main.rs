//! # optimake CLI
//!
//! The `optimake` binary converts annotated archives into OPTIMADE JSONL
//! and can hand the result to an OPTIMADE server.
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `optimake convert <archive>` | Write `<archive>/optimade.jsonl` |
//! | `optimake check <archive>` | Resolve every entry path without writing |
//! | `optimake serve <archive>` | Convert if needed, then run an OPTIMADE server |
//!
//! ## Examples
//!
//! ```bash
//! # Convert, replacing an earlier output
//! optimake convert ./archive --overwrite
//!
//! # Try the first 10 files of every entry path
//! optimake convert ./archive --limit 10 --jsonl-path /tmp/sample.jsonl
//!
//! # Resolve a graph profile to a local export
//! optimake convert ./archive --graph-profile mc3d=./exports/mc3d.json
//!
//! # Serve on another port
//! optimake serve ./archive --port 5001
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use optimake::convert::{self, ConvertOptions};
use optimake::graph::GraphProfiles;
use optimake::logging;
use optimake::progress::ProgressMode;
use optimake::serve::{self, ServeOptions};

/// optimake converts annotated materials-science archives into OPTIMADE
/// JSON-Lines.
#[derive(Parser)]
#[command(
    name = "optimake",
    about = "optimake: convert annotated archives into OPTIMADE JSONL",
    version,
    long_about = "optimake reads the optimade.yaml of an archive, parses the structure and \
    reference files it names, joins property tables and graph properties, and writes a \
    single OPTIMADE JSON-Lines file."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Convert an archive to OPTIMADE JSONL.
    ///
    /// Writes `optimade.jsonl` at the archive root unless `--jsonl-path`
    /// is given. Unparseable items are skipped and summarized; fatal
    /// errors leave no output file behind.
    Convert {
        /// Archive directory containing `optimade.yaml`.
        path: PathBuf,

        /// Output file instead of `<path>/optimade.jsonl`.
        #[arg(long)]
        jsonl_path: Option<PathBuf>,

        /// Replace an existing output file.
        #[arg(long)]
        overwrite: bool,

        /// Only take the first N files of each entry path.
        #[arg(long)]
        limit: Option<usize>,

        /// Provider prefix for custom fields (`_<prefix>_<name>`).
        ///
        /// Defaults to `$OPTIMAKE_PROVIDER_PREFIX`, else `optimake`.
        #[arg(long)]
        provider_prefix: Option<String>,

        /// Map a graph profile name to an export file (`NAME=PATH`).
        #[arg(long = "graph-profile", value_parser = parse_key_val)]
        graph_profiles: Vec<(String, String)>,

        /// Progress on stderr: auto, human, json, off.
        #[arg(long, default_value = "auto")]
        progress: String,
    },

    /// Resolve every entry path without parsing or writing.
    ///
    /// Reports how many files each entry path and property path matches
    /// and previews the ids the conversion would assign.
    Check {
        /// Archive directory containing `optimade.yaml`.
        path: PathBuf,

        /// Only take the first N files of each entry path.
        #[arg(long)]
        limit: Option<usize>,

        /// Map a graph profile name to an export file (`NAME=PATH`).
        #[arg(long = "graph-profile", value_parser = parse_key_val)]
        graph_profiles: Vec<(String, String)>,
    },

    /// Serve an archive through an OPTIMADE server.
    ///
    /// Converts the archive first when `optimade.jsonl` is missing, writes
    /// `optimade_config.json` next to it and runs the server command with
    /// `OPTIMADE_CONFIG_FILE` pointing at that file.
    Serve {
        /// Archive directory containing `optimade.yaml` or `optimade.jsonl`.
        path: PathBuf,

        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        #[arg(long, default_value_t = 5000)]
        port: u16,

        /// Server command; `--host` and `--port` are appended.
        #[arg(long, num_args = 1.., default_values_t = serve::DEFAULT_SERVER_COMMAND.map(String::from))]
        command: Vec<String>,

        /// JSON file merged over the generated server config.
        #[arg(long)]
        extra_config: Option<PathBuf>,

        /// Serve under this provider prefix instead of the detected one.
        #[arg(long)]
        provider_prefix: Option<String>,

        /// Map a graph profile name to an export file (`NAME=PATH`).
        #[arg(long = "graph-profile", value_parser = parse_key_val)]
        graph_profiles: Vec<(String, String)>,
    },
}

/// Parse a `KEY=VALUE` string into a tuple.
fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let pos = s
        .find('=')
        .ok_or_else(|| format!("invalid KEY=VALUE: no '=' found in '{}'", s))?;
    Ok((s[..pos].to_string(), s[pos + 1..].to_string()))
}

fn profiles(pairs: Vec<(String, String)>) -> GraphProfiles {
    GraphProfiles::new(pairs.into_iter().map(|(k, v)| (k, PathBuf::from(v)))).with_env()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Convert {
            path,
            jsonl_path,
            overwrite,
            limit,
            provider_prefix,
            graph_profiles,
            progress,
        } => {
            let mode = ProgressMode::from_flag(&progress).ok_or_else(|| {
                anyhow::anyhow!(
                    "invalid --progress value '{}': expected auto, human, json or off",
                    progress
                )
            })?;
            let options = ConvertOptions {
                output: jsonl_path,
                overwrite,
                limit,
                provider_prefix: provider_prefix.unwrap_or_else(convert::default_provider_prefix),
                profiles: profiles(graph_profiles),
            };
            let reporter = mode.reporter();
            convert::run_convert(&path, &options, reporter.as_ref())?;
        }
        Commands::Check {
            path,
            limit,
            graph_profiles,
        } => {
            let options = ConvertOptions {
                limit,
                profiles: profiles(graph_profiles),
                ..ConvertOptions::default()
            };
            convert::run_check(&path, &options)?;
        }
        Commands::Serve {
            path,
            host,
            port,
            command,
            extra_config,
            provider_prefix,
            graph_profiles,
        } => {
            let options = ServeOptions {
                host,
                port,
                command,
                extra_config,
                convert: ConvertOptions {
                    provider_prefix: provider_prefix
                        .clone()
                        .unwrap_or_else(convert::default_provider_prefix),
                    profiles: profiles(graph_profiles),
                    ..ConvertOptions::default()
                },
                provider_prefix,
            };
            let reporter = ProgressMode::default_for_tty().reporter();
            serve::run_serve(&path, &options, reporter.as_ref()).await?;
        }
    }

    Ok(())
}

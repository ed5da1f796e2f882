//! # optimake
//!
//! Converts an annotated archive of materials-science data into an
//! OPTIMADE JSON-Lines file that an OPTIMADE server can ingest directly.
//!
//! An archive carries an `optimade.yaml` describing which files hold which
//! entry types, how to parse them and which extra properties to attach.
//! The pipeline resolves those files, parses them into entries, assigns
//! ids, joins property tables and writes one JSONL file.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//! │ optimade.yaml│──▶│   Resolve    │──▶│    Parse     │
//! │   (config)   │   │ zip/tar/glob │   │ CIF/XYZ/BIB… │
//! └──────────────┘   └──────┬───────┘   └──────┬───────┘
//!                           │ graph           │
//!                           ▼                 ▼
//!                    ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//!                    │  Graph store │──▶│ Ids + Join   │──▶│  Emit JSONL  │
//!                    │ (traversals) │   │ CSV/JSON     │   │ header+info  │
//!                    └──────────────┘   └──────────────┘   └──────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! optimake convert ./archive          # writes ./archive/optimade.jsonl
//! optimake check ./archive            # resolve only, write nothing
//! optimake serve ./archive            # convert if needed, launch a server
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | `optimade.yaml` schema and loading |
//! | [`archive`] | Opening directories, files, zip and tar sources |
//! | [`resolve`] | Entry path specs to locators |
//! | [`graph`] | Provenance graph store and traversals |
//! | [`parsers`] | Format parsers and the registry |
//! | [`structure`] | Structure model and OPTIMADE attributes |
//! | [`ids`] | Deterministic id derivation |
//! | [`properties`] | Property tables and the join |
//! | [`coerce`] | Value coercion to declared types |
//! | [`emit`] | Header, info records and JSONL output |
//! | [`convert`] | The conversion pipeline and dry-run check |
//! | [`serve`] | Server config generation and launch |
//! | [`progress`] | Progress reporting on stderr |
//! | [`logging`] | `tracing` subscriber setup |
//! | [`error`] | Error and skipped-item types |
//! | [`models`] | Locators, documents and entry records |

pub mod archive;
pub mod coerce;
pub mod config;
pub mod convert;
pub mod emit;
pub mod error;
pub mod graph;
pub mod ids;
pub mod logging;
pub mod models;
pub mod parsers;
pub mod progress;
pub mod properties;
pub mod resolve;
pub mod serve;
pub mod structure;

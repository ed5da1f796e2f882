//! Source resolution: from a configured path spec to ordered locators.
//!
//! [`resolve`] dispatches on the [`EntryPathSpec`] variant:
//!
//! - `Archive`: open the file via [`crate::archive`], then filter members
//!   with the spec's glob patterns ([`resolve_files`]).
//! - `Graph`: open the provenance graph and list the members of the
//!   selected group ([`crate::graph::resolve_graph`]).
//!
//! Output order is the archive (or graph storage) order, concatenated per
//! pattern, without duplicates. A pattern that selects nothing is a
//! [`MakerError::NoMatch`].

use anyhow::Result;
use globset::{GlobBuilder, GlobMatcher};
use std::path::Path;

use crate::archive::{open_source, ArchiveMember};
use crate::config::{EntryPathSpec, FileSpec};
use crate::error::MakerError;
use crate::graph::{self, GraphProfiles, JsonGraphStore};
use crate::models::ResolvedLocator;

/// Locators produced for one entry path, plus the graph store they came
/// from (kept open for property traversals).
pub struct Resolution {
    pub locators: Vec<ResolvedLocator>,
    pub graph: Option<JsonGraphStore>,
}

impl std::fmt::Debug for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolution")
            .field("locators", &self.locators.len())
            .field("graph", &self.graph.as_ref().map(|g| g.len()))
            .finish()
    }
}

/// Resolve one entry path spec relative to the archive `root`.
pub fn resolve(root: &Path, spec: &EntryPathSpec, profiles: &GraphProfiles) -> Result<Resolution> {
    match spec {
        EntryPathSpec::Archive(file_spec) => Ok(Resolution {
            locators: resolve_files(root, file_spec)?,
            graph: None,
        }),
        EntryPathSpec::Graph(graph_spec) => {
            let store = graph::open_graph(root, &graph_spec.source, profiles)?;
            let locators = graph::resolve_graph(&store, graph_spec.group.as_deref())?;
            Ok(Resolution {
                locators,
                graph: Some(store),
            })
        }
    }
}

/// Resolve a file spec into locators, in archive order.
pub fn resolve_files(root: &Path, spec: &FileSpec) -> Result<Vec<ResolvedLocator>> {
    let contents = open_source(root, &spec.file)?;
    let file = spec.file.trim_end_matches('/');
    let archive_dir = Path::new(file)
        .parent()
        .map(|p| p.to_string_lossy().replace('\\', "/"))
        .filter(|p| !p.is_empty());

    let candidates: Vec<Candidate> = contents
        .members
        .into_iter()
        .map(|member| {
            if contents.container {
                let mut names = vec![member.path.clone()];
                if let Some(dir) = &archive_dir {
                    names.push(format!("{}/{}", dir, member.path));
                }
                Candidate {
                    path: format!("{}/{}", file, member.path),
                    names,
                    member,
                }
            } else {
                let base = file.rsplit('/').next().unwrap_or(file).to_string();
                Candidate {
                    path: file.to_string(),
                    names: vec![file.to_string(), base],
                    member: ArchiveMember {
                        path: file.to_string(),
                        ..member
                    },
                }
            }
        })
        .collect();

    let selected = select(&candidates, &spec.matches, file)?;
    Ok(selected
        .into_iter()
        .map(|i| {
            let c = &candidates[i];
            ResolvedLocator {
                path: c.path.clone(),
                member: c.member.path.clone(),
                content: c.member.content.clone(),
                modified: c.member.modified,
                format_hint: None,
                origin_node: None,
            }
        })
        .collect())
}

struct Candidate {
    /// Full locator path.
    path: String,
    /// Names the patterns are matched against.
    names: Vec<String>,
    member: ArchiveMember,
}

/// Indices of the candidates selected by `patterns`, in pattern order.
fn select(candidates: &[Candidate], patterns: &[String], file: &str) -> Result<Vec<usize>> {
    if patterns.is_empty() {
        return Ok((0..candidates.len()).collect());
    }

    let mut taken = vec![false; candidates.len()];
    let mut selected = Vec::new();
    for pattern in patterns {
        let matcher = PatternMatcher::new(pattern)?;
        let mut matched = 0usize;
        for (i, candidate) in candidates.iter().enumerate() {
            if candidate.names.iter().any(|n| matcher.is_match(n)) {
                matched += 1;
                if !taken[i] {
                    taken[i] = true;
                    selected.push(i);
                }
            }
        }
        if matched == 0 {
            return Err(MakerError::NoMatch {
                file: file.to_string(),
                pattern: pattern.clone(),
            }
            .into());
        }
    }
    Ok(selected)
}

/// Glob pattern (`*` stays within one path component) or exact path.
enum PatternMatcher {
    Glob(GlobMatcher),
    Exact(String),
}

impl PatternMatcher {
    fn new(pattern: &str) -> Result<Self> {
        let trimmed = pattern.trim_start_matches("./");
        if trimmed.contains(['*', '?', '[', '{']) {
            let glob = GlobBuilder::new(trimmed)
                .literal_separator(true)
                .build()
                .map_err(|e| MakerError::Config(format!("invalid pattern '{}': {}", pattern, e)))?;
            Ok(PatternMatcher::Glob(glob.compile_matcher()))
        } else {
            Ok(PatternMatcher::Exact(trimmed.to_string()))
        }
    }

    fn is_match(&self, name: &str) -> bool {
        match self {
            PatternMatcher::Glob(m) => m.is_match(name),
            PatternMatcher::Exact(p) => p == name,
        }
    }
}

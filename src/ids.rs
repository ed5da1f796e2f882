//! Stable short identifiers derived from locator paths.
//!
//! ```text
//! structures.zip/cifs/set1/101.cif ─┐   common leading components: structures.zip/cifs
//! structures.zip/cifs/set2/102.cif ─┘   common extension:          .cif
//!                                        ids: set1/101, set2/102
//! ```
//!
//! The result depends only on the set of paths, so re-running on unchanged
//! input yields the same ids regardless of enumeration order.

use crate::error::MakerError;

/// Compute one id per path, in input order.
pub fn assign_ids(paths: &[String]) -> Result<Vec<String>, MakerError> {
    let ids = match paths {
        [] => Vec::new(),
        [single] => {
            let base = single.rsplit('/').next().unwrap_or(single);
            vec![strip_all_extensions(base)]
        }
        _ => strip_common_extensions(strip_common_components(paths)),
    };
    check_unique(paths, &ids)?;
    Ok(ids)
}

fn strip_common_components(paths: &[String]) -> Vec<String> {
    let split: Vec<Vec<&str>> = paths.iter().map(|p| p.split('/').collect()).collect();
    let shortest = split.iter().map(Vec::len).min().unwrap_or(0);

    let common_leading = (0..shortest)
        .take_while(|&i| split.iter().all(|parts| parts[i] == split[0][i]))
        .count()
        .min(shortest.saturating_sub(1));

    let remaining = shortest - common_leading;
    let common_trailing = (1..=remaining)
        .take_while(|&k| {
            let last = &split[0][split[0].len() - k];
            split.iter().all(|parts| &parts[parts.len() - k] == last)
        })
        .count()
        .min(remaining.saturating_sub(1));

    split
        .iter()
        .map(|parts| parts[common_leading..parts.len() - common_trailing].join("/"))
        .collect()
}

fn strip_common_extensions(mut ids: Vec<String>) -> Vec<String> {
    loop {
        let Some(ext) = ids.first().and_then(|id| extension(id)) else {
            return ids;
        };
        let ext = ext.to_string();
        if !ids.iter().all(|id| extension(id) == Some(ext.as_str())) {
            return ids;
        }
        for id in &mut ids {
            id.truncate(id.len() - ext.len());
        }
    }
}

fn strip_all_extensions(name: &str) -> String {
    let mut name = name;
    while let Some(ext) = extension(name) {
        name = &name[..name.len() - ext.len()];
    }
    name.to_string()
}

/// Extension of the last path component including the dot; leading dots of
/// the component do not start an extension.
fn extension(path: &str) -> Option<&str> {
    let base = path.rsplit('/').next().unwrap_or(path);
    let stem_start = base.len() - base.trim_start_matches('.').len();
    let dot = base[stem_start..].rfind('.')? + stem_start;
    Some(&path[path.len() - (base.len() - dot)..])
}

fn check_unique(paths: &[String], ids: &[String]) -> Result<(), MakerError> {
    let mut seen: std::collections::HashMap<&str, &str> = std::collections::HashMap::new();
    for (path, id) in paths.iter().zip(ids) {
        if id.is_empty() {
            return Err(MakerError::IdentifierCollision {
                id: String::new(),
                first: path.clone(),
                second: path.clone(),
            });
        }
        if let Some(first) = seen.insert(id.as_str(), path.as_str()) {
            return Err(MakerError::IdentifierCollision {
                id: id.clone(),
                first: first.to_string(),
                second: path.clone(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(paths: &[&str]) -> Vec<String> {
        let owned: Vec<String> = paths.iter().map(|p| p.to_string()).collect();
        assign_ids(&owned).unwrap()
    }

    #[test]
    fn strips_common_prefix_and_extension() {
        assert_eq!(
            ids(&[
                "structures.zip/cifs/set1/101.cif",
                "structures.zip/cifs/set2/102.cif"
            ]),
            vec!["set1/101", "set2/102"]
        );
    }

    #[test]
    fn common_layouts() {
        assert_eq!(
            ids(&["data/structures/1.cif", "data/structures/2.cif", "data/structures/3.cif"]),
            vec!["1", "2", "3"]
        );
        assert_eq!(
            ids(&["data/structures/1", "data/structures/2", "data/structures/3"]),
            vec!["1", "2", "3"]
        );
        assert_eq!(
            ids(&[
                "data/structures/1/POSCAR",
                "data/structures/2/POSCAR",
                "data/structures/3/POSCAR"
            ]),
            vec!["1", "2", "3"]
        );
        assert_eq!(ids(&["data1", "data2", "data3"]), vec!["data1", "data2", "data3"]);
        assert_eq!(
            ids(&[
                "data.tar.gz/data/structures/1.cif.gz",
                "data.tar.gz/data/structures/2.cif.gz",
                "data.tar.gz/data/structures/3.cif.gz"
            ]),
            vec!["1", "2", "3"]
        );
    }

    #[test]
    fn mixed_extensions_are_kept() {
        assert_eq!(
            ids(&[
                "data.tar.gz/data/set1/1.cif/file",
                "data.tar.gz/data/set1/2.cif/file",
                "data.tar.gz/data/set2/3.xyz/file",
                "data.tar.gz/data/set2/4.xyz/file"
            ]),
            vec!["set1/1.cif", "set1/2.cif", "set2/3.xyz", "set2/4.xyz"]
        );
    }

    #[test]
    fn multi_document_locators() {
        assert_eq!(ids(&["frames.extxyz/0", "frames.extxyz/1"]), vec!["0", "1"]);
        assert_eq!(
            ids(&["a/frames.extxyz/0", "a/frames.extxyz/1", "a/other.extxyz/0"]),
            vec!["frames.extxyz/0", "frames.extxyz/1", "other.extxyz/0"]
        );
    }

    #[test]
    fn single_path_uses_stem() {
        assert_eq!(ids(&["archive.zip/cifs/NaCl.cif"]), vec!["NaCl"]);
        assert_eq!(ids(&["x.cif.gz"]), vec!["x"]);
    }

    #[test]
    fn hidden_file_dot_is_not_an_extension() {
        assert_eq!(extension("a/.hidden"), None);
        assert_eq!(extension("a.b/c"), None);
        assert_eq!(extension("a/b.cif"), Some(".cif"));
    }

    #[test]
    fn independent_of_order() {
        let forward = ids(&["d/a/1.cif", "d/b/2.cif", "d/b/3.cif"]);
        let mut backward = ids(&["d/b/3.cif", "d/b/2.cif", "d/a/1.cif"]);
        backward.reverse();
        assert_eq!(forward, backward);
    }

    #[test]
    fn duplicate_paths_collide() {
        let paths = vec!["d/1.cif".to_string(), "d/1.cif".to_string()];
        let err = assign_ids(&paths).unwrap_err();
        assert!(matches!(err, MakerError::IdentifierCollision { .. }));
    }

    #[test]
    fn differing_extensions_are_not_stripped() {
        let paths = vec!["d/1.cif".to_string(), "d/1.xyz".to_string(), "d/2.cif".to_string()];
        assert_eq!(assign_ids(&paths).unwrap(), vec!["1.cif", "1.xyz", "2.cif"]);

        let paths = vec!["a/x.cif".to_string(), "a/x.cif.gz".to_string()];
        assert_eq!(assign_ids(&paths).unwrap(), vec!["x.cif", "x.cif.gz"]);
    }

    #[test]
    fn empty_id_is_a_collision() {
        let paths = vec!["d/.cif".to_string()];
        assert_eq!(assign_ids(&paths).unwrap(), vec![".cif"]);

        let paths = vec!["dir/".to_string()];
        let err = assign_ids(&paths).unwrap_err();
        match err {
            MakerError::IdentifierCollision { id, .. } => assert!(id.is_empty()),
            other => panic!("unexpected {:?}", other),
        }
    }
}

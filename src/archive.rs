//! Transparent reading of archives, compressed files and directories.
//!
//! A source file named in `optimade.yaml` may be any of:
//!
//! | Kind | Detected by |
//! |------|-------------|
//! | zip | `.zip`, or `PK\x03\x04` magic |
//! | tar | `.tar`, or `ustar` magic at offset 257 |
//! | gzip / bzip2 tar | `.tar.gz`, `.tgz`, `.tar.bz2`, `.tbz2`, or a tar inside `.gz`/`.bz2` |
//! | single compressed file | `.gz`, `.bz2`, or gzip/bzip2 magic |
//! | directory | filesystem metadata |
//! | plain file | anything else |
//!
//! Containers are read fully into memory, member by member, in archive
//! order. Members that are themselves archives are expanded recursively and
//! appear as `<member>/<inner member>`; compressed single members keep their
//! name and are decompressed in place. All handles are dropped before
//! returning.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use std::io::{Cursor, Read};
use std::path::{Component, Path};
use walkdir::WalkDir;

use crate::error::MakerError;

/// Maximum decompressed bytes read from a single member (zip-bomb protection).
const MAX_MEMBER_BYTES: u64 = 4 * 1024 * 1024 * 1024;
/// Maximum archive-in-archive depth.
const MAX_NESTING: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    Zip,
    Tar,
    TarGz,
    TarBz2,
    Gzip,
    Bzip2,
    Plain,
}

impl ArchiveKind {
    pub fn is_container(&self) -> bool {
        matches!(
            self,
            ArchiveKind::Zip | ArchiveKind::Tar | ArchiveKind::TarGz | ArchiveKind::TarBz2
        )
    }
}

/// One file read out of a source.
#[derive(Debug, Clone)]
pub struct ArchiveMember {
    /// Path relative to the container root, `/`-separated.
    pub path: String,
    pub content: Vec<u8>,
    pub modified: Option<DateTime<Utc>>,
}

/// Everything read from one configured source file.
#[derive(Debug)]
pub struct SourceContents {
    /// `true` for zip/tar/directories, whose members get `<file>/<member>`
    /// locators; `false` for single files.
    pub container: bool,
    pub members: Vec<ArchiveMember>,
}

/// Classify a file by name, falling back to magic bytes.
pub fn detect_kind(name: &str, head: &[u8]) -> ArchiveKind {
    let lower = name.to_lowercase();
    if lower.ends_with(".zip") {
        return ArchiveKind::Zip;
    }
    if lower.ends_with(".tar") {
        return ArchiveKind::Tar;
    }
    if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
        return ArchiveKind::TarGz;
    }
    if lower.ends_with(".tar.bz2") || lower.ends_with(".tbz2") || lower.ends_with(".tbz") {
        return ArchiveKind::TarBz2;
    }
    if lower.ends_with(".gz") {
        return ArchiveKind::Gzip;
    }
    if lower.ends_with(".bz2") {
        return ArchiveKind::Bzip2;
    }

    if head.starts_with(b"PK\x03\x04") || head.starts_with(b"PK\x05\x06") {
        ArchiveKind::Zip
    } else if head.starts_with(&[0x1f, 0x8b]) {
        ArchiveKind::Gzip
    } else if head.starts_with(b"BZh") {
        ArchiveKind::Bzip2
    } else if is_tar(head) {
        ArchiveKind::Tar
    } else {
        ArchiveKind::Plain
    }
}

fn is_tar(bytes: &[u8]) -> bool {
    bytes.len() > 262 && &bytes[257..262] == b"ustar"
}

/// Open the source `file` (relative to `root`) and read all its members.
///
/// `file` must stay inside `root`: absolute paths and `..` are rejected.
pub fn open_source(root: &Path, file: &str) -> Result<SourceContents> {
    let escapes = Path::new(file).components().any(|c| {
        matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_))
    });
    if escapes {
        return Err(MakerError::Config(format!(
            "source '{}' must be a relative path inside the archive",
            file
        ))
        .into());
    }
    let full = root.join(file);
    let metadata = std::fs::metadata(&full).map_err(|e| MakerError::SourceNotFound {
        path: full.display().to_string(),
        reason: e.to_string(),
    })?;

    if metadata.is_dir() {
        return Ok(SourceContents {
            container: true,
            members: read_directory(&full)?,
        });
    }

    let bytes = std::fs::read(&full).map_err(|e| MakerError::SourceNotFound {
        path: full.display().to_string(),
        reason: e.to_string(),
    })?;
    let modified = metadata.modified().ok().map(DateTime::<Utc>::from);

    let kind = resolved_kind(file, &bytes)?;
    let members = expand(file, kind, bytes, modified, 0)
        .with_context(|| format!("Failed to read archive {}", full.display()))?;
    Ok(SourceContents {
        container: kind.is_container(),
        members,
    })
}

/// Like [`detect_kind`], but looks inside gzip/bzip2 streams for a tar.
fn resolved_kind(name: &str, bytes: &[u8]) -> Result<ArchiveKind> {
    let kind = detect_kind(name, bytes);
    Ok(match kind {
        ArchiveKind::Gzip if is_tar(&peek_decompressed(kind, bytes)?) => ArchiveKind::TarGz,
        ArchiveKind::Bzip2 if is_tar(&peek_decompressed(kind, bytes)?) => ArchiveKind::TarBz2,
        other => other,
    })
}

fn peek_decompressed(kind: ArchiveKind, bytes: &[u8]) -> Result<Vec<u8>> {
    let mut head = Vec::with_capacity(512);
    let reader: Box<dyn Read + '_> = match kind {
        ArchiveKind::Gzip => Box::new(flate2::read::MultiGzDecoder::new(bytes)),
        _ => Box::new(bzip2::read::BzDecoder::new(bytes)),
    };
    reader
        .take(512)
        .read_to_end(&mut head)
        .context("corrupt compressed stream")?;
    Ok(head)
}

fn expand(
    name: &str,
    kind: ArchiveKind,
    bytes: Vec<u8>,
    modified: Option<DateTime<Utc>>,
    depth: usize,
) -> Result<Vec<ArchiveMember>> {
    if depth > MAX_NESTING {
        bail!("archives nested deeper than {} levels in {}", MAX_NESTING, name);
    }

    let raw_members = match kind {
        ArchiveKind::Zip => read_zip(&bytes)?,
        ArchiveKind::Tar => read_tar(bytes.as_slice())?,
        ArchiveKind::TarGz => read_tar(flate2::read::MultiGzDecoder::new(bytes.as_slice()))?,
        ArchiveKind::TarBz2 => read_tar(bzip2::read::BzDecoder::new(bytes.as_slice()))?,
        ArchiveKind::Gzip | ArchiveKind::Bzip2 => {
            return Ok(vec![ArchiveMember {
                path: name.to_string(),
                content: decompress(kind, &bytes)?,
                modified,
            }]);
        }
        ArchiveKind::Plain => {
            return Ok(vec![ArchiveMember {
                path: name.to_string(),
                content: bytes,
                modified,
            }]);
        }
    };

    let mut members = Vec::with_capacity(raw_members.len());
    for member in raw_members {
        members.extend(expand_member(member, depth + 1)?);
    }
    Ok(members)
}

/// Expand a member that is itself an archive; plain members pass through.
fn expand_member(member: ArchiveMember, depth: usize) -> Result<Vec<ArchiveMember>> {
    let kind = resolved_kind(&member.path, &member.content)?;
    match kind {
        ArchiveKind::Plain => Ok(vec![member]),
        ArchiveKind::Gzip | ArchiveKind::Bzip2 => {
            let content = decompress(kind, &member.content)
                .with_context(|| format!("Failed to decompress {}", member.path))?;
            Ok(vec![ArchiveMember {
                content,
                ..member
            }])
        }
        _ => {
            let inner = expand(&member.path, kind, member.content, member.modified, depth)
                .with_context(|| format!("Failed to read nested archive {}", member.path))?;
            Ok(inner
                .into_iter()
                .map(|m| ArchiveMember {
                    path: format!("{}/{}", member.path, m.path),
                    ..m
                })
                .collect())
        }
    }
}

fn decompress(kind: ArchiveKind, bytes: &[u8]) -> Result<Vec<u8>> {
    let reader: Box<dyn Read + '_> = match kind {
        ArchiveKind::Gzip => Box::new(flate2::read::MultiGzDecoder::new(bytes)),
        ArchiveKind::Bzip2 => Box::new(bzip2::read::BzDecoder::new(bytes)),
        other => bail!("{:?} is not a single-file compression format", other),
    };
    read_bounded(reader, "compressed stream")
}

fn read_bounded<R: Read>(reader: R, name: &str) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    reader
        .take(MAX_MEMBER_BYTES)
        .read_to_end(&mut out)
        .with_context(|| format!("Failed to read {}", name))?;
    if out.len() as u64 >= MAX_MEMBER_BYTES {
        bail!("{} exceeds size limit ({} bytes)", name, MAX_MEMBER_BYTES);
    }
    Ok(out)
}

fn normalize_member_path(raw: &str) -> String {
    let path = raw.replace('\\', "/");
    path.trim_start_matches("./").trim_start_matches('/').to_string()
}

fn is_junk(path: &str) -> bool {
    path.starts_with("__MACOSX/") || path.rsplit('/').next().is_some_and(|n| n.starts_with("._"))
}

fn read_zip(bytes: &[u8]) -> Result<Vec<ArchiveMember>> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).context("invalid zip archive")?;
    let mut members = Vec::with_capacity(archive.len());
    for i in 0..archive.len() {
        let file = archive.by_index(i).context("invalid zip entry")?;
        if file.is_dir() {
            continue;
        }
        let path = normalize_member_path(file.name());
        if path.is_empty() || is_junk(&path) {
            continue;
        }
        let stamp: Option<zip::DateTime> = Option::from(file.last_modified());
        let modified = stamp.and_then(zip_time);
        let content = read_bounded(file, &path)?;
        members.push(ArchiveMember {
            path,
            content,
            modified,
        });
    }
    Ok(members)
}

fn zip_time(stamp: zip::DateTime) -> Option<DateTime<Utc>> {
    Utc.with_ymd_and_hms(
        stamp.year() as i32,
        stamp.month() as u32,
        stamp.day() as u32,
        stamp.hour() as u32,
        stamp.minute() as u32,
        stamp.second() as u32,
    )
    .single()
}

fn read_tar<R: Read>(reader: R) -> Result<Vec<ArchiveMember>> {
    let mut archive = tar::Archive::new(reader);
    let mut members = Vec::new();
    for entry in archive.entries().context("invalid tar archive")? {
        let mut entry = entry.context("invalid tar entry")?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let path = normalize_member_path(&entry.path()?.to_string_lossy());
        if path.is_empty() || is_junk(&path) {
            continue;
        }
        let modified = entry
            .header()
            .mtime()
            .ok()
            .and_then(|secs| Utc.timestamp_opt(secs as i64, 0).single());
        let content = read_bounded(&mut entry, &path)?;
        members.push(ArchiveMember {
            path,
            content,
            modified,
        });
    }
    Ok(members)
}

fn read_directory(dir: &Path) -> Result<Vec<ArchiveMember>> {
    let mut members = Vec::new();
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let relative = path.strip_prefix(dir).unwrap_or(path);
        let rel_str = normalize_member_path(&relative.to_string_lossy());
        let modified = entry
            .metadata()
            .ok()
            .and_then(|m| m.modified().ok())
            .map(DateTime::<Utc>::from);
        let content = std::fs::read(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        members.extend(expand_member(
            ArchiveMember {
                path: rel_str,
                content,
                modified,
            },
            1,
        )?);
    }
    Ok(members)
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use tempfile::TempDir;

    fn paths(members: &[ArchiveMember]) -> Vec<&str> {
        members.iter().map(|m| m.path.as_str()).collect()
    }

    #[test]
    fn detects_kinds_by_extension_and_magic() {
        assert_eq!(detect_kind("a.zip", b""), ArchiveKind::Zip);
        assert_eq!(detect_kind("a.tar.gz", b""), ArchiveKind::TarGz);
        assert_eq!(detect_kind("a.TGZ", b""), ArchiveKind::TarGz);
        assert_eq!(detect_kind("a.cif.gz", b""), ArchiveKind::Gzip);
        assert_eq!(detect_kind("a.tar.bz2", b""), ArchiveKind::TarBz2);
        assert_eq!(detect_kind("blob", b"PK\x03\x04rest"), ArchiveKind::Zip);
        assert_eq!(detect_kind("blob", &[0x1f, 0x8b, 0x08]), ArchiveKind::Gzip);
        assert_eq!(detect_kind("a.cif", b"data_x"), ArchiveKind::Plain);
    }

    #[test]
    fn reads_zip_members_in_order() {
        let tmp = TempDir::new().unwrap();
        let bytes = zip_bytes(&[("cifs/b.cif", b"B"), ("cifs/a.cif", b"A")]);
        std::fs::write(tmp.path().join("s.zip"), bytes).unwrap();

        let source = open_source(tmp.path(), "s.zip").unwrap();
        assert!(source.container);
        assert_eq!(paths(&source.members), vec!["cifs/b.cif", "cifs/a.cif"]);
        assert_eq!(source.members[1].content, b"A");
    }

    #[test]
    fn reads_tar_gz_and_detects_tar_inside_plain_gz() {
        let tmp = TempDir::new().unwrap();
        let tgz = gzip_bytes(&tar_bytes(&[("data/1.cif", b"one")]));
        std::fs::write(tmp.path().join("a.tar.gz"), &tgz).unwrap();
        std::fs::write(tmp.path().join("b.gz"), &tgz).unwrap();

        let a = open_source(tmp.path(), "a.tar.gz").unwrap();
        assert_eq!(paths(&a.members), vec!["data/1.cif"]);
        assert!(a.members[0].modified.is_some());

        let b = open_source(tmp.path(), "b.gz").unwrap();
        assert!(b.container);
        assert_eq!(paths(&b.members), vec!["data/1.cif"]);
    }

    #[test]
    fn single_compressed_file_is_decompressed() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("x.cif.gz"), gzip_bytes(b"data_x")).unwrap();

        let source = open_source(tmp.path(), "x.cif.gz").unwrap();
        assert!(!source.container);
        assert_eq!(paths(&source.members), vec!["x.cif.gz"]);
        assert_eq!(source.members[0].content, b"data_x");
    }

    #[test]
    fn nested_archives_are_expanded() {
        let tmp = TempDir::new().unwrap();
        let inner = zip_bytes(&[("1.cif", b"inner one")]);
        let compressed = gzip_bytes(b"two");
        let outer = tar_bytes(&[
            ("batch/inner.zip", inner.as_slice()),
            ("batch/2.cif.gz", compressed.as_slice()),
        ]);
        std::fs::write(tmp.path().join("outer.tar"), outer).unwrap();

        let source = open_source(tmp.path(), "outer.tar").unwrap();
        assert_eq!(
            paths(&source.members),
            vec!["batch/inner.zip/1.cif", "batch/2.cif.gz"]
        );
        assert_eq!(source.members[0].content, b"inner one");
        assert_eq!(source.members[1].content, b"two");
    }

    #[test]
    fn directories_are_walked_in_sorted_order() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("data");
        std::fs::create_dir_all(dir.join("sub")).unwrap();
        std::fs::write(dir.join("z.cif"), "z").unwrap();
        std::fs::write(dir.join("sub/a.cif"), "a").unwrap();

        let source = open_source(tmp.path(), "data").unwrap();
        assert!(source.container);
        assert_eq!(paths(&source.members), vec!["sub/a.cif", "z.cif"]);
    }

    #[test]
    fn missing_source_is_source_not_found() {
        let tmp = TempDir::new().unwrap();
        let err = open_source(tmp.path(), "nope.zip").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<MakerError>(),
            Some(MakerError::SourceNotFound { .. })
        ));
    }

    #[test]
    fn sources_outside_the_root_are_rejected() {
        let tmp = TempDir::new().unwrap();
        let inner = tmp.path().join("archive");
        std::fs::create_dir(&inner).unwrap();
        std::fs::write(tmp.path().join("outside.cif"), "data_x\n").unwrap();

        for file in ["../outside.cif", "data/../../outside.cif"] {
            let err = open_source(&inner, file).unwrap_err();
            assert!(matches!(err.downcast_ref::<MakerError>(), Some(MakerError::Config(_))));
        }
        let absolute = tmp.path().join("outside.cif");
        let err = open_source(&inner, &absolute.display().to_string()).unwrap_err();
        assert!(matches!(err.downcast_ref::<MakerError>(), Some(MakerError::Config(_))));
    }

    #[test]
    fn macos_junk_is_skipped() {
        let tmp = TempDir::new().unwrap();
        let bytes = zip_bytes(&[("a.cif", b"A"), ("__MACOSX/._a.cif", b"junk")]);
        std::fs::write(tmp.path().join("s.zip"), bytes).unwrap();
        let source = open_source(tmp.path(), "s.zip").unwrap();
        assert_eq!(paths(&source.members), vec!["a.cif"]);
    }
}

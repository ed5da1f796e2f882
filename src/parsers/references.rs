//! Reference parsers: OPTIMADE-style JSON records and BibTeX.
//!
//! Both produce the attribute vocabulary of the OPTIMADE `references`
//! entry type. Person lists (`authors`, `editors`) are emitted as lists of
//! `{name, firstname, lastname}` objects; JSON files may give them as plain
//! strings.

use serde_json::{json, Map, Value};

use super::{declared_id, json_objects, type_name, utf8, EntryParser};
use crate::models::{ParsedDocument, ResolvedLocator};

/// BibTeX fields carried over verbatim as string attributes.
const BIBTEX_FIELDS: &[&str] = &[
    "address",
    "annote",
    "booktitle",
    "chapter",
    "crossref",
    "edition",
    "howpublished",
    "institution",
    "journal",
    "key",
    "month",
    "note",
    "number",
    "organization",
    "pages",
    "publisher",
    "school",
    "series",
    "title",
    "volume",
    "year",
    "doi",
    "url",
];

const PERSON_FIELDS: [&str; 2] = ["authors", "editors"];

// ═══════════════════════════════════════════════════════════════════════
// JSON
// ═══════════════════════════════════════════════════════════════════════

pub struct JsonReferenceParser;

impl EntryParser for JsonReferenceParser {
    fn name(&self) -> &str {
        "json-references"
    }

    fn formats(&self) -> &[&str] {
        &["json"]
    }

    fn parse(&self, locator: &ResolvedLocator) -> Result<Vec<ParsedDocument>, String> {
        let value: Value = serde_json::from_str(utf8(locator)?).map_err(|e| e.to_string())?;
        json_objects(value)?
            .into_iter()
            .enumerate()
            .map(|(i, map)| json_reference(map).map_err(|e| format!("reference {}: {}", i, e)))
            .collect()
    }
}

fn json_reference(mut map: Map<String, Value>) -> Result<ParsedDocument, String> {
    let id = declared_id(&map);
    map.remove("id");
    map.remove("type");
    let mut attributes = match map.remove("attributes") {
        Some(Value::Object(attrs)) => attrs,
        Some(other) => return Err(format!("'attributes' must be an object, found {}", type_name(&other))),
        None => map,
    };
    for field in PERSON_FIELDS {
        if let Some(value) = attributes.remove(field) {
            attributes.insert(field.to_string(), people(value)?);
        }
    }
    let mut doc = ParsedDocument::attributes(attributes);
    doc.declared_id = id;
    Ok(doc)
}

fn people(value: Value) -> Result<Value, String> {
    let items = match value {
        Value::Array(items) => items,
        Value::String(s) => return Ok(person_list(&s)),
        other => return Err(format!("person list must be a list, found {}", type_name(&other))),
    };
    let people = items
        .into_iter()
        .map(|item| match item {
            Value::String(s) => Ok(person(&s)),
            Value::Object(o) => Ok(Value::Object(o)),
            other => Err(format!("person must be a string or object, found {}", type_name(&other))),
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Value::Array(people))
}

/// `"Last, First"` or `"First Last"` → `{name, firstname, lastname}`.
fn person(raw: &str) -> Value {
    let raw = raw.trim();
    let (first, last) = match raw.split_once(',') {
        Some((last, first)) => (first.trim(), last.trim()),
        None => match raw.rsplit_once(' ') {
            Some((first, last)) => (first.trim(), last.trim()),
            None => ("", raw),
        },
    };
    let name = if first.is_empty() {
        last.to_string()
    } else {
        format!("{} {}", first, last)
    };
    let mut map = Map::new();
    map.insert("name".to_string(), json!(name));
    if !first.is_empty() {
        map.insert("firstname".to_string(), json!(first));
    }
    map.insert("lastname".to_string(), json!(last));
    Value::Object(map)
}

/// BibTeX-style `A and B and C`.
fn person_list(raw: &str) -> Value {
    Value::Array(
        raw.split(" and ")
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(person)
            .collect(),
    )
}

// ═══════════════════════════════════════════════════════════════════════
// BibTeX
// ═══════════════════════════════════════════════════════════════════════

/// `@article{key, field = {value}, ...}`. The citation key is the declared
/// id and the entry type becomes `bib_type`. `@string`, `@preamble` and
/// `@comment` blocks are skipped.
pub struct BibtexParser;

impl EntryParser for BibtexParser {
    fn name(&self) -> &str {
        "bibtex"
    }

    fn formats(&self) -> &[&str] {
        &["bib", "bibtex"]
    }

    fn parse(&self, locator: &ResolvedLocator) -> Result<Vec<ParsedDocument>, String> {
        let text = utf8(locator)?;
        let mut reader = BibReader::new(text);
        let mut docs = Vec::new();
        while let Some(entry) = reader.next_entry()? {
            docs.push(entry);
        }
        Ok(docs)
    }
}

struct BibReader {
    chars: Vec<char>,
    pos: usize,
}

impl BibReader {
    fn new(text: &str) -> Self {
        Self {
            chars: text.chars().collect(),
            pos: 0,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn skip_ws(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.pos += 1;
        }
    }

    fn expect(&mut self, c: char) -> Result<(), String> {
        self.skip_ws();
        match self.peek() {
            Some(found) if found == c => {
                self.pos += 1;
                Ok(())
            }
            Some(found) => Err(format!("expected '{}' at offset {}, found '{}'", c, self.pos, found)),
            None => Err(format!("expected '{}', found end of input", c)),
        }
    }

    fn word(&mut self) -> String {
        self.skip_ws();
        let start = self.pos;
        while self
            .peek()
            .is_some_and(|c| !c.is_whitespace() && !matches!(c, '{' | '}' | '(' | ')' | ',' | '=' | '"' | '#'))
        {
            self.pos += 1;
        }
        self.chars[start..self.pos].iter().collect()
    }

    /// Skip to the character after the matching close of a block starting
    /// at the current open brace or parenthesis.
    fn skip_block(&mut self) -> Result<(), String> {
        self.skip_ws();
        let close = match self.peek() {
            Some('{') => '}',
            Some('(') => ')',
            _ => return Ok(()),
        };
        let open = self.chars[self.pos];
        let mut depth = 0;
        while let Some(c) = self.peek() {
            self.pos += 1;
            if c == open {
                depth += 1;
            } else if c == close {
                depth -= 1;
                if depth == 0 {
                    return Ok(());
                }
            }
        }
        Err("unterminated block".to_string())
    }

    fn braced(&mut self) -> Result<String, String> {
        self.pos += 1;
        let mut depth = 1;
        let mut out = String::new();
        while let Some(c) = self.peek() {
            self.pos += 1;
            match c {
                '{' => depth += 1,
                '}' => {
                    depth -= 1;
                    if depth == 0 {
                        return Ok(out);
                    }
                }
                _ => out.push(c),
            }
        }
        Err("unterminated braced value".to_string())
    }

    fn quoted(&mut self) -> Result<String, String> {
        self.pos += 1;
        let mut depth = 0;
        let mut out = String::new();
        while let Some(c) = self.peek() {
            self.pos += 1;
            match c {
                '{' => depth += 1,
                '}' => depth -= 1,
                '"' if depth == 0 => return Ok(out),
                _ => out.push(c),
            }
        }
        Err("unterminated quoted value".to_string())
    }

    /// A field value, joining `#` concatenations.
    fn value(&mut self) -> Result<String, String> {
        let mut out = String::new();
        loop {
            self.skip_ws();
            match self.peek() {
                Some('{') => out.push_str(&self.braced()?),
                Some('"') => out.push_str(&self.quoted()?),
                _ => out.push_str(&self.word()),
            }
            self.skip_ws();
            if self.peek() == Some('#') {
                self.pos += 1;
            } else {
                return Ok(out);
            }
        }
    }

    fn next_entry(&mut self) -> Result<Option<ParsedDocument>, String> {
        loop {
            match self.chars[self.pos..].iter().position(|&c| c == '@') {
                Some(offset) => self.pos += offset + 1,
                None => return Ok(None),
            }
            let bib_type = self.word().to_lowercase();
            if matches!(bib_type.as_str(), "comment" | "preamble" | "string") {
                self.skip_block()?;
                continue;
            }

            self.skip_ws();
            let close = match self.peek() {
                Some('{') => '}',
                Some('(') => ')',
                _ => return Err(format!("malformed @{} entry", bib_type)),
            };
            self.pos += 1;
            let key = self.word();
            if key.is_empty() {
                return Err(format!("@{} entry without a citation key", bib_type));
            }

            let mut attributes = Map::new();
            attributes.insert("bib_type".to_string(), json!(bib_type));
            loop {
                self.skip_ws();
                match self.peek() {
                    Some(',') => {
                        self.pos += 1;
                        continue;
                    }
                    Some(c) if c == close => {
                        self.pos += 1;
                        break;
                    }
                    None => return Err(format!("unterminated entry '{}'", key)),
                    _ => {}
                }
                let field = self.word().to_lowercase();
                if field.is_empty() {
                    return Err(format!("entry '{}': malformed field at offset {}", key, self.pos));
                }
                self.expect('=')?;
                let value = collapse_ws(&self.value()?);
                insert_field(&mut attributes, &field, value);
            }

            let mut doc = ParsedDocument::attributes(attributes);
            doc.declared_id = Some(key);
            return Ok(Some(doc));
        }
    }
}

fn collapse_ws(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn insert_field(attributes: &mut Map<String, Value>, field: &str, value: String) {
    match field {
        "author" => {
            attributes.insert("authors".to_string(), person_list(&value));
        }
        "editor" => {
            attributes.insert("editors".to_string(), person_list(&value));
        }
        f if BIBTEX_FIELDS.contains(&f) => {
            attributes.insert(f.to_string(), json!(value));
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DocumentContent;

    fn parse(parser: &dyn EntryParser, path: &str, text: &str) -> Result<Vec<ParsedDocument>, String> {
        let locator =
            ResolvedLocator::from_bytes(path.to_string(), path.to_string(), text.as_bytes().to_vec());
        parser.parse(&locator)
    }

    fn attrs(doc: &ParsedDocument) -> &Map<String, Value> {
        match &doc.content {
            DocumentContent::Attributes(a) => a,
            other => panic!("unexpected {:?}", other),
        }
    }

    const BIB: &str = r#"
@comment{ignored {nested} block}
@string{jcp = "J. Chem. Phys."}
@Article{Smith2020,
  author = {Smith, Jane and John {van} Doe},
  title = {A {Study} of
           Salts},
  journal = "Phys. Rev. B",
  year = 2020,
  doi = {10.1000/xyz},
  keywords = {ignored}
}
@book(Jones1999, title = "Book", publisher = {Pub})
"#;

    #[test]
    fn bibtex_entries() {
        let docs = parse(&BibtexParser, "refs.bib", BIB).unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].declared_id.as_deref(), Some("Smith2020"));

        let a = attrs(&docs[0]);
        assert_eq!(a["bib_type"], json!("article"));
        assert_eq!(a["title"], json!("A Study of Salts"));
        assert_eq!(a["journal"], json!("Phys. Rev. B"));
        assert_eq!(a["year"], json!("2020"));
        assert_eq!(
            a["authors"],
            json!([
                {"name": "Jane Smith", "firstname": "Jane", "lastname": "Smith"},
                {"name": "John van Doe", "firstname": "John van", "lastname": "Doe"}
            ])
        );
        assert!(!a.contains_key("keywords"));

        assert_eq!(docs[1].declared_id.as_deref(), Some("Jones1999"));
        assert_eq!(attrs(&docs[1])["publisher"], json!("Pub"));
    }

    #[test]
    fn bibtex_errors() {
        assert!(parse(&BibtexParser, "r.bib", "@article{key, title = {open").is_err());
        assert!(parse(&BibtexParser, "r.bib", "@article{, title = {x}}").is_err());
        assert!(parse(&BibtexParser, "r.bib", "no entries here").unwrap().is_empty());
    }

    #[test]
    fn json_references_normalize_people() {
        let text = r#"[
            {"id": "r1", "title": "T", "authors": ["Jane Smith", {"name": "X"}]},
            {"id": "r2", "attributes": {"doi": "10.1/a", "editors": "Doe, John and Roe, Rick"}}
        ]"#;
        let docs = parse(&JsonReferenceParser, "refs.json", text).unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].declared_id.as_deref(), Some("r1"));
        assert_eq!(attrs(&docs[0])["authors"][0]["lastname"], json!("Smith"));
        assert_eq!(attrs(&docs[0])["authors"][1], json!({"name": "X"}));
        assert!(!attrs(&docs[0]).contains_key("id"));
        assert_eq!(attrs(&docs[1])["editors"][1]["name"], json!("Rick Roe"));
    }

    #[test]
    fn json_references_reject_bad_people() {
        let err = parse(&JsonReferenceParser, "refs.json", r#"{"id": "r", "authors": 3}"#)
            .unwrap_err();
        assert!(err.contains("person list"), "{}", err);
    }
}

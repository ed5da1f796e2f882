//! Extended XYZ parser (multi-frame).
//!
//! ```text
//! 2
//! Lattice="4.0 0 0 0 4.0 0 0 0 4.0" Properties=species:S:1:pos:R:3 energy=-3.2 pbc="T T T"
//! Na 0.0 0.0 0.0
//! Cl 2.0 2.0 2.0
//! ```
//!
//! Every frame is one document. Comment-line keys other than `Lattice`,
//! `Properties` and `pbc` become document extras (numbers, `T`/`F`
//! booleans, or strings). Plain XYZ files without a `Lattice` are molecules.

use serde_json::{Number, Value};

use super::{utf8, EntryParser};
use crate::models::{ParsedDocument, ResolvedLocator};
use crate::structure::{canonical_symbol, Structure};

pub struct ExtxyzParser;

impl EntryParser for ExtxyzParser {
    fn name(&self) -> &str {
        "extxyz"
    }

    fn formats(&self) -> &[&str] {
        &["xyz", "extxyz"]
    }

    fn parse(&self, locator: &ResolvedLocator) -> Result<Vec<ParsedDocument>, String> {
        let text = utf8(locator)?;
        let mut lines = text.lines();
        let mut docs = Vec::new();
        let mut frame = 0;

        while let Some(count_line) = lines.next() {
            if count_line.trim().is_empty() {
                continue;
            }
            let natoms: usize = count_line
                .trim()
                .parse()
                .map_err(|_| format!("frame {}: expected an atom count, found '{}'", frame, count_line.trim()))?;
            let comment = lines.next().unwrap_or("");
            let mut atom_lines = Vec::with_capacity(natoms);
            for _ in 0..natoms {
                atom_lines.push(
                    lines
                        .next()
                        .ok_or_else(|| format!("frame {}: expected {} atoms", frame, natoms))?,
                );
            }
            docs.push(parse_frame(comment, &atom_lines).map_err(|e| format!("frame {}: {}", frame, e))?);
            frame += 1;
        }
        Ok(docs)
    }
}

fn parse_frame(comment: &str, atom_lines: &[&str]) -> Result<ParsedDocument, String> {
    let info = parse_comment(comment)?;

    let lattice = match info.get("lattice") {
        Some(text) => Some(parse_lattice(text)?),
        None => None,
    };
    let pbc = match info.get("pbc") {
        Some(text) => {
            let flags: Vec<bool> = text.split_whitespace().map(flag).collect::<Result<_, _>>()?;
            <[bool; 3]>::try_from(flags).map_err(|_| "pbc needs three flags".to_string())?
        }
        None => [lattice.is_some(); 3],
    };

    let (species_col, pos_col) = match info.get("properties") {
        Some(spec) => property_columns(spec)?,
        None => (0, 1),
    };

    let mut structure = Structure::new(lattice, pbc);
    for line in atom_lines {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < pos_col + 3 || fields.len() <= species_col {
            return Err(format!("short atom line '{}'", line.trim()));
        }
        let symbol = canonical_symbol(fields[species_col])
            .ok_or_else(|| format!("unknown element '{}'", fields[species_col]))?;
        let mut position = [0.0; 3];
        for (axis, value) in position.iter_mut().enumerate() {
            *value = fields[pos_col + axis]
                .parse()
                .map_err(|_| format!("invalid coordinate '{}'", fields[pos_col + axis]))?;
        }
        structure.push_atom(symbol, position);
    }

    let mut doc = ParsedDocument::structure(structure);
    for (key, raw) in info.iter() {
        if !matches!(key.as_str(), "lattice" | "properties" | "pbc") {
            doc.extras.insert(raw.0.clone(), scalar(&raw.1));
        }
    }
    Ok(doc)
}

/// Comment-line `key=value` pairs, keyed by lower-case key, keeping the
/// original key spelling next to the value.
struct Info(Vec<(String, (String, String))>);

impl Info {
    fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, (_, v))| v.as_str())
    }

    fn iter(&self) -> impl Iterator<Item = (&String, &(String, String))> {
        self.0.iter().map(|(k, v)| (k, v))
    }
}

fn parse_comment(comment: &str) -> Result<Info, String> {
    let chars: Vec<char> = comment.chars().collect();
    let mut pairs = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        if chars[i].is_whitespace() {
            i += 1;
            continue;
        }
        let start = i;
        while i < chars.len() && chars[i] != '=' && !chars[i].is_whitespace() {
            i += 1;
        }
        let key: String = chars[start..i].iter().collect();
        let value = if i < chars.len() && chars[i] == '=' {
            i += 1;
            match chars.get(i) {
                Some(&open @ ('"' | '{')) => {
                    let close = if open == '"' { '"' } else { '}' };
                    let from = i + 1;
                    let to = chars[from..]
                        .iter()
                        .position(|&c| c == close)
                        .map(|p| from + p)
                        .ok_or_else(|| format!("unterminated value for '{}'", key))?;
                    i = to + 1;
                    chars[from..to].iter().collect()
                }
                _ => {
                    let from = i;
                    while i < chars.len() && !chars[i].is_whitespace() {
                        i += 1;
                    }
                    chars[from..i].iter().collect()
                }
            }
        } else {
            "T".to_string()
        };
        pairs.push((key.to_lowercase(), (key, value)));
    }
    Ok(Info(pairs))
}

fn parse_lattice(text: &str) -> Result<[[f64; 3]; 3], String> {
    let numbers: Vec<f64> = text
        .split_whitespace()
        .map(|v| v.parse::<f64>().map_err(|_| format!("invalid lattice value '{}'", v)))
        .collect::<Result<_, _>>()?;
    if numbers.len() != 9 {
        return Err(format!("lattice needs 9 numbers, found {}", numbers.len()));
    }
    Ok([
        [numbers[0], numbers[1], numbers[2]],
        [numbers[3], numbers[4], numbers[5]],
        [numbers[6], numbers[7], numbers[8]],
    ])
}

fn flag(text: &str) -> Result<bool, String> {
    match text {
        "T" | "t" | "True" | "true" => Ok(true),
        "F" | "f" | "False" | "false" => Ok(false),
        other => Err(format!("invalid flag '{}'", other)),
    }
}

/// Columns of `species` and the first `pos` column in a
/// `name:type:count` properties spec.
fn property_columns(spec: &str) -> Result<(usize, usize), String> {
    let parts: Vec<&str> = spec.split(':').collect();
    if parts.len() % 3 != 0 {
        return Err(format!("malformed Properties '{}'", spec));
    }
    let mut column = 0;
    let (mut species, mut pos) = (None, None);
    for triple in parts.chunks(3) {
        let count: usize = triple[2]
            .parse()
            .map_err(|_| format!("malformed Properties '{}'", spec))?;
        match triple[0] {
            "species" => species = Some(column),
            "pos" => pos = Some(column),
            _ => {}
        }
        column += count;
    }
    match (species, pos) {
        (Some(s), Some(p)) => Ok((s, p)),
        _ => Err("Properties must include species and pos".to_string()),
    }
}

fn scalar(text: &str) -> Value {
    if let Ok(i) = text.parse::<i64>() {
        return Value::from(i);
    }
    if let Some(n) = text.parse::<f64>().ok().and_then(Number::from_f64) {
        return Value::Number(n);
    }
    match text {
        "T" | "True" => Value::Bool(true),
        "F" | "False" => Value::Bool(false),
        _ => Value::String(text.to_string()),
    }
}

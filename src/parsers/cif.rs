//! Crystallographic Information File (CIF) parser.
//!
//! Supports the subset of CIF 1.1 used by structure dumps: data blocks,
//! tag/value pairs, `loop_` tables, quoted and semicolon-delimited values,
//! numbers with standard uncertainties (`5.640(3)`). Each data block that
//! carries atom sites becomes one structure.
//!
//! Sites are given in fractional coordinates and expanded with the
//! block's symmetry operations (`_symmetry_equiv_pos_as_xyz` or
//! `_space_group_symop_operation_xyz`). Images closer than
//! [`MERGE_TOLERANCE`] Å are merged; atoms of different elements on one
//! position form a mixed-occupancy site.

use std::collections::HashMap;

use super::{utf8, EntryParser};
use crate::models::{ParsedDocument, ResolvedLocator};
use crate::structure::{
    canonical_symbol, fractional_to_cartesian, lattice_from_parameters, Site, Species, Structure,
};

/// Distance (Å) below which two symmetry images are the same site.
const MERGE_TOLERANCE: f64 = 1e-2;

const SYMOP_TAGS: [&str; 3] = [
    "_symmetry_equiv_pos_as_xyz",
    "_space_group_symop_operation_xyz",
    "_space_group_symop.operation_xyz",
];

pub struct CifParser;

impl EntryParser for CifParser {
    fn name(&self) -> &str {
        "cif"
    }

    fn formats(&self) -> &[&str] {
        &["cif", "mcif"]
    }

    fn parse(&self, locator: &ResolvedLocator) -> Result<Vec<ParsedDocument>, String> {
        let blocks = parse_blocks(utf8(locator)?)?;
        let mut docs = Vec::new();
        for block in &blocks {
            if let Some(structure) =
                block_structure(block).map_err(|e| format!("data_{}: {}", block.name, e))?
            {
                docs.push(ParsedDocument::structure(structure));
            }
        }
        if docs.is_empty() {
            return Err("no data block with atom sites".to_string());
        }
        Ok(docs)
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Syntax
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, PartialEq)]
enum Token {
    Block(String),
    Loop,
    Tag(String),
    Value(String),
}

fn tokenize(text: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut lines = text.lines().enumerate();
    while let Some((lineno, line)) = lines.next() {
        if let Some(first) = line.strip_prefix(';') {
            let mut field = first.to_string();
            let mut closed = false;
            for (_, next) in lines.by_ref() {
                if next.starts_with(';') {
                    closed = true;
                    break;
                }
                field.push('\n');
                field.push_str(next);
            }
            if !closed {
                return Err(format!("unterminated text field at line {}", lineno + 1));
            }
            tokens.push(Token::Value(field.trim().to_string()));
            continue;
        }
        tokenize_line(line, lineno + 1, &mut tokens)?;
    }
    Ok(tokens)
}

fn tokenize_line(line: &str, lineno: usize, tokens: &mut Vec<Token>) -> Result<(), String> {
    let chars: Vec<char> = line.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
        } else if c == '#' {
            break;
        } else if c == '\'' || c == '"' {
            // A quote only closes when followed by whitespace or end of line.
            let start = i + 1;
            let mut end = start;
            loop {
                if end >= chars.len() {
                    return Err(format!("unterminated quoted value at line {}", lineno));
                }
                if chars[end] == c && chars.get(end + 1).map_or(true, |n| n.is_whitespace()) {
                    break;
                }
                end += 1;
            }
            tokens.push(Token::Value(chars[start..end].iter().collect()));
            i = end + 1;
        } else {
            let start = i;
            while i < chars.len() && !chars[i].is_whitespace() {
                i += 1;
            }
            let word: String = chars[start..i].iter().collect();
            let lower = word.to_ascii_lowercase();
            if lower.starts_with("data_") {
                tokens.push(Token::Block(word[5..].to_string()));
            } else if lower == "loop_" {
                tokens.push(Token::Loop);
            } else if lower.starts_with("save_") || lower == "global_" || lower == "stop_" {
                continue;
            } else if word.starts_with('_') {
                tokens.push(Token::Tag(lower));
            } else {
                tokens.push(Token::Value(word));
            }
        }
    }
    Ok(())
}

#[derive(Debug, Default)]
struct CifBlock {
    name: String,
    items: HashMap<String, String>,
    loops: Vec<CifLoop>,
}

#[derive(Debug)]
struct CifLoop {
    tags: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl CifLoop {
    fn column(&self, tag: &str) -> Option<usize> {
        self.tags.iter().position(|t| t == tag)
    }
}

impl CifBlock {
    fn get(&self, tag: &str) -> Option<&str> {
        self.items.get(tag).map(String::as_str)
    }

    fn loop_with(&self, tag: &str) -> Option<&CifLoop> {
        self.loops.iter().find(|l| l.column(tag).is_some())
    }

    fn number(&self, tag: &str) -> Option<f64> {
        self.get(tag).and_then(cif_number)
    }
}

fn parse_blocks(text: &str) -> Result<Vec<CifBlock>, String> {
    let tokens = tokenize(text)?;
    let mut blocks: Vec<CifBlock> = Vec::new();
    let mut iter = tokens.into_iter().peekable();

    while let Some(token) = iter.next() {
        if let Token::Block(name) = token {
            blocks.push(CifBlock {
                name,
                ..Default::default()
            });
            continue;
        }
        let block = blocks
            .last_mut()
            .ok_or_else(|| "content before the first data_ block".to_string())?;
        match token {
            Token::Loop => {
                let mut tags = Vec::new();
                while let Some(Token::Tag(_)) = iter.peek() {
                    if let Some(Token::Tag(tag)) = iter.next() {
                        tags.push(tag);
                    }
                }
                let mut values = Vec::new();
                while let Some(Token::Value(_)) = iter.peek() {
                    if let Some(Token::Value(v)) = iter.next() {
                        values.push(v);
                    }
                }
                if tags.is_empty() || values.len() % tags.len() != 0 {
                    return Err(format!(
                        "loop with {} tags has {} values",
                        tags.len(),
                        values.len()
                    ));
                }
                let rows = values.chunks(tags.len()).map(<[String]>::to_vec).collect();
                block.loops.push(CifLoop { tags, rows });
            }
            Token::Tag(tag) => match iter.next() {
                Some(Token::Value(value)) => {
                    block.items.insert(tag, value);
                }
                _ => return Err(format!("tag {} has no value", tag)),
            },
            Token::Value(value) => return Err(format!("unexpected value '{}'", value)),
            Token::Block(_) => unreachable!("handled above"),
        }
    }
    Ok(blocks)
}

/// Numeric value without its standard uncertainty; `?` and `.` are absent.
fn cif_number(text: &str) -> Option<f64> {
    let text = text.trim();
    if text == "?" || text == "." {
        return None;
    }
    let bare = match text.find('(') {
        Some(pos) => &text[..pos],
        None => text,
    };
    bare.parse().ok()
}

// ═══════════════════════════════════════════════════════════════════════
// Symmetry
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq)]
struct SymOp {
    rotation: [[f64; 3]; 3],
    translation: [f64; 3],
}

impl SymOp {
    fn identity() -> Self {
        Self {
            rotation: [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
            translation: [0.0; 3],
        }
    }

    fn apply(&self, p: [f64; 3]) -> [f64; 3] {
        let mut out = self.translation;
        for (row, value) in self.rotation.iter().zip(out.iter_mut()) {
            *value += row[0] * p[0] + row[1] * p[1] + row[2] * p[2];
        }
        out
    }

    /// Parse an operation such as `-x+1/2, y, z+1/2`.
    fn parse(text: &str) -> Result<Self, String> {
        let parts: Vec<&str> = text.split(',').map(str::trim).collect();
        if parts.len() != 3 {
            return Err(format!("symmetry operation '{}' needs three components", text));
        }
        let mut op = SymOp {
            rotation: [[0.0; 3]; 3],
            translation: [0.0; 3],
        };
        for (axis, part) in parts.iter().enumerate() {
            parse_component(part, &mut op.rotation[axis], &mut op.translation[axis])
                .map_err(|e| format!("symmetry operation '{}': {}", text, e))?;
        }
        Ok(op)
    }
}

fn parse_component(expr: &str, row: &mut [f64; 3], constant: &mut f64) -> Result<(), String> {
    let compact: String = expr.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.is_empty() {
        return Err("empty component".to_string());
    }

    let mut terms = Vec::new();
    let mut current = String::new();
    for c in compact.chars() {
        if (c == '+' || c == '-') && !current.is_empty() {
            terms.push(std::mem::take(&mut current));
        }
        current.push(c);
    }
    terms.push(current);

    for term in terms {
        let (sign, body) = match term.strip_prefix('-') {
            Some(rest) => (-1.0, rest),
            None => (1.0, term.strip_prefix('+').unwrap_or(&term)),
        };
        let body = body.to_ascii_lowercase();
        let var = body.find(['x', 'y', 'z']);
        match var {
            Some(pos) => {
                let axis = match &body[pos..pos + 1] {
                    "x" => 0,
                    "y" => 1,
                    _ => 2,
                };
                let coefficient = body[..pos].trim_end_matches('*');
                let divisor = body[pos + 1..].strip_prefix('/');
                let mut factor = if coefficient.is_empty() {
                    1.0
                } else {
                    fraction(coefficient)?
                };
                if let Some(d) = divisor {
                    factor /= fraction(d)?;
                } else if pos + 1 != body.len() {
                    return Err(format!("cannot read term '{}'", term));
                }
                row[axis] += sign * factor;
            }
            None => *constant += sign * fraction(&body)?,
        }
    }
    Ok(())
}

fn fraction(text: &str) -> Result<f64, String> {
    let parsed = match text.split_once('/') {
        Some((n, d)) => match (n.parse::<f64>(), d.parse::<f64>()) {
            (Ok(n), Ok(d)) if d != 0.0 => Some(n / d),
            _ => None,
        },
        None => text.parse::<f64>().ok(),
    };
    parsed.ok_or_else(|| format!("cannot read number '{}'", text))
}

fn symmetry_operations(block: &CifBlock) -> Result<Vec<SymOp>, String> {
    for tag in SYMOP_TAGS {
        if let Some(table) = block.loop_with(tag) {
            let col = table.column(tag).unwrap_or(0);
            return table.rows.iter().map(|row| SymOp::parse(&row[col])).collect();
        }
        if let Some(single) = block.get(tag) {
            return Ok(vec![SymOp::parse(single)?]);
        }
    }
    Ok(vec![SymOp::identity()])
}

// ═══════════════════════════════════════════════════════════════════════
// Structure assembly
// ═══════════════════════════════════════════════════════════════════════

/// Element of a type symbol or label: `Fe2+` → `Fe`, `O1` → `O`, `CL` → `Cl`.
fn element_of(raw: &str) -> Option<&'static str> {
    let letters: String = raw.chars().take_while(|c| c.is_ascii_alphabetic()).collect();
    if letters.len() >= 2 {
        if let Some(symbol) = canonical_symbol(&letters[..2]) {
            return Some(symbol);
        }
    }
    letters.get(..1).and_then(canonical_symbol)
}

struct PendingSite {
    frac: [f64; 3],
    occupants: Vec<(&'static str, f64)>,
}

fn block_structure(block: &CifBlock) -> Result<Option<Structure>, String> {
    let Some(atoms) = block.loop_with("_atom_site_fract_x") else {
        return Ok(None);
    };

    let length = |tag: &str| {
        block
            .number(tag)
            .ok_or_else(|| format!("missing or invalid {}", tag))
    };
    let angle = |tag: &str| block.number(tag).unwrap_or(90.0);
    let lattice = lattice_from_parameters(
        length("_cell_length_a")?,
        length("_cell_length_b")?,
        length("_cell_length_c")?,
        angle("_cell_angle_alpha"),
        angle("_cell_angle_beta"),
        angle("_cell_angle_gamma"),
    )?;

    let column = |tag: &str| atoms.column(tag);
    let symbol_col = column("_atom_site_type_symbol")
        .or_else(|| column("_atom_site_label"))
        .ok_or("atom sites have neither type symbols nor labels")?;
    let label_col = column("_atom_site_label");
    let xyz = [
        column("_atom_site_fract_x"),
        column("_atom_site_fract_y"),
        column("_atom_site_fract_z"),
    ];
    let [Some(cx), Some(cy), Some(cz)] = xyz else {
        return Err("incomplete fractional coordinates".to_string());
    };
    let occupancy_col = column("_atom_site_occupancy");

    let ops = symmetry_operations(block)?;
    let mut sites: Vec<PendingSite> = Vec::new();

    for row in &atoms.rows {
        let symbol = element_of(&row[symbol_col])
            .or_else(|| label_col.and_then(|c| element_of(&row[c])))
            .ok_or_else(|| format!("cannot determine element of '{}'", row[symbol_col]))?;
        let frac = [cx, cy, cz].map(|c| cif_number(&row[c]));
        let [Some(x), Some(y), Some(z)] = frac else {
            return Err(format!("invalid coordinates for site '{}'", row[symbol_col]));
        };
        let occupancy = occupancy_col
            .and_then(|c| cif_number(&row[c]))
            .unwrap_or(1.0);

        for op in &ops {
            let image = op.apply([x, y, z]).map(wrap);
            match sites
                .iter_mut()
                .find(|s| periodic_distance(&lattice, s.frac, image) < MERGE_TOLERANCE)
            {
                Some(site) => {
                    if !site.occupants.iter().any(|(s, _)| *s == symbol) {
                        site.occupants.push((symbol, occupancy));
                    }
                }
                None => sites.push(PendingSite {
                    frac: image,
                    occupants: vec![(symbol, occupancy)],
                }),
            }
        }
    }

    let mut structure = Structure::new(Some(lattice), [true; 3]);
    for site in sites {
        let name = species_name(&mut structure, &site.occupants);
        structure.sites.push(Site {
            species: name,
            position: fractional_to_cartesian(&lattice, site.frac),
        });
    }
    Ok(Some(structure))
}

/// Name of the species for `occupants`, registering it on first use.
fn species_name(structure: &mut Structure, occupants: &[(&'static str, f64)]) -> String {
    let symbols: Vec<String> = occupants.iter().map(|(s, _)| s.to_string()).collect();
    let concentration: Vec<f64> = occupants.iter().map(|(_, c)| *c).collect();
    if let Some(existing) = structure
        .species
        .iter()
        .find(|s| s.chemical_symbols == symbols && s.concentration == concentration)
    {
        return existing.name.clone();
    }

    let base = symbols.concat();
    let mut name = base.clone();
    let mut n = 1;
    while structure.species.iter().any(|s| s.name == name) {
        n += 1;
        name = format!("{}{}", base, n);
    }
    structure.add_species(Species {
        name: name.clone(),
        chemical_symbols: symbols,
        concentration,
        mass: None,
    });
    name
}

fn wrap(x: f64) -> f64 {
    let w = x - x.floor();
    if (1.0 - w).abs() < 1e-8 {
        0.0
    } else {
        w
    }
}

fn periodic_distance(lattice: &[[f64; 3]; 3], a: [f64; 3], b: [f64; 3]) -> f64 {
    let mut delta = [0.0; 3];
    for i in 0..3 {
        let d = a[i] - b[i];
        delta[i] = d - d.round();
    }
    let cart = fractional_to_cartesian(lattice, delta);
    cart.iter().map(|v| v * v).sum::<f64>().sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DocumentContent;

    const NACL: &str = r#"# rock salt
data_NaCl
_cell_length_a    5.640(2)
_cell_length_b    5.640(2)
_cell_length_c    5.640(2)
_cell_angle_alpha 90
_cell_angle_beta  90
_cell_angle_gamma 90
_symmetry_space_group_name_H-M 'F m -3 m'
loop_
_symmetry_equiv_pos_as_xyz
  'x, y, z'
  'x, y+1/2, z+1/2'
  'x+1/2, y, z+1/2'
  'x+1/2, y+1/2, z'
loop_
_atom_site_label
_atom_site_type_symbol
_atom_site_fract_x
_atom_site_fract_y
_atom_site_fract_z
_atom_site_occupancy
Na1 Na+ 0.0 0.0 0.0 1.0
Cl1 Cl- 0.5 0.5 0.5 1.0
"#;

    fn parse(text: &str) -> Result<Vec<ParsedDocument>, String> {
        let locator = ResolvedLocator::from_bytes(
            "x.cif".to_string(),
            "x.cif".to_string(),
            text.as_bytes().to_vec(),
        );
        CifParser.parse(&locator)
    }

    fn structure(doc: &ParsedDocument) -> &Structure {
        match &doc.content {
            DocumentContent::Structure(s) => s,
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn expands_symmetry_operations() {
        let docs = parse(NACL).unwrap();
        assert_eq!(docs.len(), 1);
        let s = structure(&docs[0]);
        assert_eq!(s.sites.len(), 8);
        let na = s.sites.iter().filter(|site| site.species == "Na").count();
        assert_eq!(na, 4);
        assert!((s.lattice_vectors.unwrap()[0][0] - 5.64).abs() < 1e-9);
        let attrs = s.clone().normalize().unwrap().to_attributes();
        assert_eq!(attrs["chemical_formula_reduced"], "ClNa");
    }

    #[test]
    fn mixed_occupancy_forms_one_site() {
        let cif = "data_alloy
_cell_length_a 3.0
_cell_length_b 3.0
_cell_length_c 3.0
loop_
_atom_site_label
_atom_site_fract_x
_atom_site_fract_y
_atom_site_fract_z
_atom_site_occupancy
Fe1 0 0 0 0.5
Ni1 0 0 0 0.5
";
        let docs = parse(cif).unwrap();
        let s = structure(&docs[0]);
        assert_eq!(s.sites.len(), 1);
        assert_eq!(s.species[0].chemical_symbols, vec!["Fe", "Ni"]);
        assert_eq!(s.species[0].concentration, vec![0.5, 0.5]);
        assert_eq!(s.species[0].name, "FeNi");
    }

    #[test]
    fn multiple_blocks_yield_multiple_documents() {
        let one = "data_a\n_cell_length_a 4\n_cell_length_b 4\n_cell_length_c 4\nloop_\n_atom_site_type_symbol\n_atom_site_fract_x\n_atom_site_fract_y\n_atom_site_fract_z\nSi 0 0 0\n";
        let text = format!("{}{}", one, one.replace("data_a", "data_b"));
        assert_eq!(parse(&text).unwrap().len(), 2);
    }

    #[test]
    fn text_fields_and_quotes() {
        let tokens = tokenize("_title\n;\nmulti line\ntext\n;\n_name 'it''s here'\n").unwrap();
        assert_eq!(tokens[1], Token::Value("multi line\ntext".to_string()));
        assert_eq!(tokens[3], Token::Value("it''s here".to_string()));
    }

    #[test]
    fn parses_symmetry_operations() {
        let op = SymOp::parse("-x+1/2, y-x, 0.25+z").unwrap();
        assert_eq!(op.rotation[0], [-1.0, 0.0, 0.0]);
        assert_eq!(op.rotation[1], [-1.0, 1.0, 0.0]);
        assert_eq!(op.translation, [0.5, 0.0, 0.25]);
        assert_eq!(op.apply([0.25, 0.5, 0.125]), [0.25, 0.25, 0.375]);
        assert!(SymOp::parse("x, y").is_err());
        assert!(SymOp::parse("x, y, q").is_err());
    }

    #[test]
    fn element_symbols_from_labels() {
        assert_eq!(element_of("Fe2+"), Some("Fe"));
        assert_eq!(element_of("O1"), Some("O"));
        assert_eq!(element_of("CL"), Some("Cl"));
        assert_eq!(element_of("Co3"), Some("Co"));
        assert_eq!(element_of("123"), None);
    }

    #[test]
    fn uncertainties_and_placeholders() {
        assert_eq!(cif_number("5.640(3)"), Some(5.64));
        assert_eq!(cif_number("?"), None);
        assert_eq!(cif_number("."), None);
    }

    #[test]
    fn missing_cell_is_an_error() {
        let err = parse("data_x\nloop_\n_atom_site_type_symbol\n_atom_site_fract_x\n_atom_site_fract_y\n_atom_site_fract_z\nSi 0 0 0\n")
            .unwrap_err();
        assert!(err.contains("_cell_length_a"), "{}", err);
        assert!(parse("data_x\n_cell_length_a 4\n").is_err());
    }
}

//! pymatgen JSON documents (`Structure.as_dict()`,
//! `ComputedStructureEntry.as_dict()`, `Molecule.as_dict()`).
//!
//! A file may hold one object, a list, or an object whose values are lists.
//! For computed entries the `data` mapping (plus `energy` and `correction`)
//! is kept as document extras for the property joiner, and the first of
//! `entry_id`, `data.id`, `data.mat_id`, `data.task_id` becomes the declared
//! id.

use serde_json::{Map, Value};

use super::{json_objects, utf8, EntryParser};
use crate::models::{ParsedDocument, ResolvedLocator};
use crate::structure::{canonical_symbol, fractional_to_cartesian, Site, Species, Structure};

const DATA_ID_KEYS: [&str; 3] = ["id", "mat_id", "task_id"];

pub struct PymatgenParser;

impl EntryParser for PymatgenParser {
    fn name(&self) -> &str {
        "pymatgen"
    }

    fn formats(&self) -> &[&str] {
        &["json"]
    }

    fn parse(&self, locator: &ResolvedLocator) -> Result<Vec<ParsedDocument>, String> {
        let value: Value = serde_json::from_str(utf8(locator)?).map_err(|e| e.to_string())?;
        json_objects(value)?
            .iter()
            .enumerate()
            .map(|(i, obj)| parse_object(obj).map_err(|e| format!("object {}: {}", i, e)))
            .collect()
    }
}

fn parse_object(obj: &Map<String, Value>) -> Result<ParsedDocument, String> {
    let class = obj.get("@class").and_then(Value::as_str).unwrap_or("");
    match class {
        "ComputedStructureEntry" => computed_entry(obj),
        "Structure" | "IStructure" => Ok(ParsedDocument::structure(structure(obj)?)),
        "Molecule" | "IMolecule" => Ok(ParsedDocument::structure(molecule(obj)?)),
        "" if obj.contains_key("structure") => computed_entry(obj),
        "" if obj.contains_key("lattice") && obj.contains_key("sites") => {
            Ok(ParsedDocument::structure(structure(obj)?))
        }
        other => Err(format!("unsupported pymatgen class '{}'", other)),
    }
}

fn computed_entry(obj: &Map<String, Value>) -> Result<ParsedDocument, String> {
    let inner = obj
        .get("structure")
        .and_then(Value::as_object)
        .ok_or("computed entry without a structure")?;
    let mut doc = ParsedDocument::structure(structure(inner)?);

    let data = obj
        .get("data")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();

    doc.declared_id = obj
        .get("entry_id")
        .and_then(id_string)
        .or_else(|| DATA_ID_KEYS.iter().find_map(|k| data.get(*k).and_then(id_string)));

    for key in ["energy", "correction"] {
        if let Some(v) = obj.get(key) {
            doc.extras.insert(key.to_string(), v.clone());
        }
    }
    doc.extras.extend(data);
    Ok(doc)
}

fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn vector(value: Option<&Value>) -> Option<[f64; 3]> {
    let items = value?.as_array()?;
    if items.len() != 3 {
        return None;
    }
    Some([items[0].as_f64()?, items[1].as_f64()?, items[2].as_f64()?])
}

fn lattice(obj: &Map<String, Value>) -> Result<([[f64; 3]; 3], [bool; 3]), String> {
    let lattice = obj
        .get("lattice")
        .and_then(Value::as_object)
        .ok_or("missing lattice")?;
    let rows = lattice
        .get("matrix")
        .and_then(Value::as_array)
        .filter(|rows| rows.len() == 3)
        .ok_or("lattice matrix must have three rows")?;
    let mut matrix = [[0.0; 3]; 3];
    for (i, row) in rows.iter().enumerate() {
        matrix[i] = vector(Some(row)).ok_or("lattice rows must hold three numbers")?;
    }
    let pbc = match lattice.get("pbc").and_then(Value::as_array) {
        Some(flags) if flags.len() == 3 => [
            flags[0].as_bool().unwrap_or(true),
            flags[1].as_bool().unwrap_or(true),
            flags[2].as_bool().unwrap_or(true),
        ],
        _ => [true; 3],
    };
    Ok((matrix, pbc))
}

/// Occupants of a site: `[{"element": "Fe", "occu": 0.5}, ...]`.
fn occupants(site: &Map<String, Value>) -> Result<Vec<(String, f64)>, String> {
    let species = site
        .get("species")
        .and_then(Value::as_array)
        .ok_or("site without species")?;
    species
        .iter()
        .map(|sp| {
            let element = sp
                .get("element")
                .and_then(Value::as_str)
                .ok_or("species without element")?;
            // Oxidation-state decorated symbols ("Fe2+") keep only the element.
            let letters: String = element.chars().take_while(|c| c.is_ascii_alphabetic()).collect();
            let symbol = canonical_symbol(&letters)
                .ok_or_else(|| format!("unknown element '{}'", element))?;
            let occu = sp.get("occu").and_then(Value::as_f64).unwrap_or(1.0);
            Ok((symbol.to_string(), occu))
        })
        .collect()
}

fn add_site(structure: &mut Structure, occupants: Vec<(String, f64)>, position: [f64; 3]) {
    let symbols: Vec<String> = occupants.iter().map(|(s, _)| s.clone()).collect();
    let concentration: Vec<f64> = occupants.iter().map(|(_, c)| *c).collect();
    let name = match structure
        .species
        .iter()
        .find(|s| s.chemical_symbols == symbols && s.concentration == concentration)
    {
        Some(existing) => existing.name.clone(),
        None => {
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
    };
    structure.sites.push(Site {
        species: name,
        position,
    });
}

fn sites(obj: &Map<String, Value>) -> Result<&Vec<Value>, String> {
    obj.get("sites")
        .and_then(Value::as_array)
        .ok_or_else(|| "missing sites".to_string())
}

fn structure(obj: &Map<String, Value>) -> Result<Structure, String> {
    let (matrix, pbc) = lattice(obj)?;
    let mut structure = Structure::new(Some(matrix), pbc);
    for (i, site) in sites(obj)?.iter().enumerate() {
        let site = site.as_object().ok_or("site is not an object")?;
        let position = match vector(site.get("xyz")) {
            Some(xyz) => xyz,
            None => {
                let abc = vector(site.get("abc"))
                    .ok_or_else(|| format!("site {} has no coordinates", i))?;
                fractional_to_cartesian(&matrix, abc)
            }
        };
        add_site(&mut structure, occupants(site)?, position);
    }
    Ok(structure)
}

fn molecule(obj: &Map<String, Value>) -> Result<Structure, String> {
    let mut structure = Structure::new(None, [false; 3]);
    for (i, site) in sites(obj)?.iter().enumerate() {
        let site = site.as_object().ok_or("site is not an object")?;
        let position =
            vector(site.get("xyz")).ok_or_else(|| format!("site {} has no coordinates", i))?;
        add_site(&mut structure, occupants(site)?, position);
    }
    Ok(structure)
}

//! Canonical structure record and its OPTIMADE attribute form.
//!
//! Parsers build a [`Structure`] (cell, periodicity, species, cartesian
//! sites); [`Structure::normalize`] validates it, and
//! [`Structure::to_attributes`] derives the OPTIMADE `structures` fields:
//!
//! | Field | Derived from |
//! |-------|--------------|
//! | `elements`, `nelements`, `elements_ratios` | species symbols weighted by concentration |
//! | `chemical_formula_*` | per-element counts, alphabetical |
//! | `dimension_types`, `nperiodic_dimensions` | `pbc` |
//! | `lattice_vectors`, `cartesian_site_positions`, `nsites` | cell and sites |
//! | `species`, `species_at_sites` | species table and site labels |
//! | `structure_features` | `["disorder"]` for mixed or partial occupancy |

use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

const TOLERANCE: f64 = 1e-6;

/// Chemical symbols accepted in species, in atomic-number order.
pub const ELEMENTS: [&str; 118] = [
    "H", "He", "Li", "Be", "B", "C", "N", "O", "F", "Ne", "Na", "Mg", "Al", "Si", "P", "S", "Cl",
    "Ar", "K", "Ca", "Sc", "Ti", "V", "Cr", "Mn", "Fe", "Co", "Ni", "Cu", "Zn", "Ga", "Ge", "As",
    "Se", "Br", "Kr", "Rb", "Sr", "Y", "Zr", "Nb", "Mo", "Tc", "Ru", "Rh", "Pd", "Ag", "Cd", "In",
    "Sn", "Sb", "Te", "I", "Xe", "Cs", "Ba", "La", "Ce", "Pr", "Nd", "Pm", "Sm", "Eu", "Gd", "Tb",
    "Dy", "Ho", "Er", "Tm", "Yb", "Lu", "Hf", "Ta", "W", "Re", "Os", "Ir", "Pt", "Au", "Hg", "Tl",
    "Pb", "Bi", "Po", "At", "Rn", "Fr", "Ra", "Ac", "Th", "Pa", "U", "Np", "Pu", "Am", "Cm", "Bk",
    "Cf", "Es", "Fm", "Md", "No", "Lr", "Rf", "Db", "Sg", "Bh", "Hs", "Mt", "Ds", "Rg", "Cn", "Nh",
    "Fl", "Mc", "Lv", "Ts", "Og",
];

/// Placeholder symbols allowed besides real elements.
const VACANCY: &str = "vacancy";
const UNKNOWN: &str = "X";

/// Canonical spelling of a chemical symbol (`NA` → `Na`), if it is one.
pub fn canonical_symbol(symbol: &str) -> Option<&'static str> {
    if symbol.eq_ignore_ascii_case(VACANCY) {
        return Some(VACANCY);
    }
    if symbol == UNKNOWN {
        return Some(UNKNOWN);
    }
    ELEMENTS
        .iter()
        .find(|e| e.eq_ignore_ascii_case(symbol))
        .copied()
}

#[derive(Debug, Clone, PartialEq)]
pub struct Species {
    pub name: String,
    pub chemical_symbols: Vec<String>,
    pub concentration: Vec<f64>,
    pub mass: Option<Vec<f64>>,
}

impl Species {
    /// Fully occupied single-element species named after its element.
    pub fn element(symbol: &str) -> Self {
        Self {
            name: symbol.to_string(),
            chemical_symbols: vec![symbol.to_string()],
            concentration: vec![1.0],
            mass: None,
        }
    }

    fn is_disordered(&self) -> bool {
        let total: f64 = self.concentration.iter().sum();
        self.chemical_symbols.len() > 1
            || total < 1.0 - TOLERANCE
            || self.chemical_symbols.iter().any(|s| s == VACANCY)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Site {
    /// Name of an entry in [`Structure::species`].
    pub species: String,
    /// Cartesian position in Ångström.
    pub position: [f64; 3],
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Structure {
    /// Rows are the cell vectors in Ångström; `None` for molecules.
    pub lattice_vectors: Option<[[f64; 3]; 3]>,
    pub pbc: [bool; 3],
    pub species: Vec<Species>,
    pub sites: Vec<Site>,
}

impl Structure {
    pub fn new(lattice_vectors: Option<[[f64; 3]; 3]>, pbc: [bool; 3]) -> Self {
        Self {
            lattice_vectors,
            pbc,
            species: Vec::new(),
            sites: Vec::new(),
        }
    }

    /// Register `species` unless one with the same name exists.
    pub fn add_species(&mut self, species: Species) {
        if !self.species.iter().any(|s| s.name == species.name) {
            self.species.push(species);
        }
    }

    /// Add a fully occupied site of a single element.
    pub fn push_atom(&mut self, symbol: &str, position: [f64; 3]) {
        self.add_species(Species::element(symbol));
        self.sites.push(Site {
            species: symbol.to_string(),
            position,
        });
    }

    /// Validate and canonicalize symbols. Errors are human-readable reasons.
    pub fn normalize(mut self) -> Result<Structure, String> {
        if self.sites.is_empty() {
            return Err("structure has no sites".to_string());
        }
        if self.pbc.iter().any(|p| *p) && self.lattice_vectors.is_none() {
            return Err("periodic structure without lattice vectors".to_string());
        }
        if let Some(lattice) = &self.lattice_vectors {
            if lattice.iter().flatten().any(|v| !v.is_finite()) {
                return Err("lattice vectors are not finite".to_string());
            }
            if determinant(lattice).abs() < TOLERANCE {
                return Err("lattice vectors are linearly dependent".to_string());
            }
        }

        for species in &mut self.species {
            if species.chemical_symbols.is_empty()
                || species.chemical_symbols.len() != species.concentration.len()
            {
                return Err(format!(
                    "species '{}' has mismatched symbols and concentrations",
                    species.name
                ));
            }
            for symbol in &mut species.chemical_symbols {
                *symbol = canonical_symbol(symbol)
                    .ok_or_else(|| format!("unknown chemical symbol '{}'", symbol))?
                    .to_string();
            }
            let total: f64 = species.concentration.iter().sum();
            if species.concentration.iter().any(|c| !c.is_finite() || *c < 0.0)
                || total > 1.0 + 1e-3
            {
                return Err(format!(
                    "species '{}' has invalid concentrations {:?}",
                    species.name, species.concentration
                ));
            }
        }

        for site in &self.sites {
            if !self.species.iter().any(|s| s.name == site.species) {
                return Err(format!("site refers to unknown species '{}'", site.species));
            }
            if site.position.iter().any(|v| !v.is_finite()) {
                return Err("site position is not finite".to_string());
            }
        }

        let used: Vec<&str> = self.sites.iter().map(|s| s.species.as_str()).collect();
        self.species.retain(|s| used.contains(&s.name.as_str()));
        Ok(self)
    }

    /// Total occupancy per chemical element, alphabetical.
    fn element_counts(&self) -> BTreeMap<String, f64> {
        let mut counts = BTreeMap::new();
        for site in &self.sites {
            let Some(species) = self.species.iter().find(|s| s.name == site.species) else {
                continue;
            };
            for (symbol, conc) in species.chemical_symbols.iter().zip(&species.concentration) {
                if symbol != VACANCY {
                    *counts.entry(symbol.clone()).or_insert(0.0) += conc;
                }
            }
        }
        counts
    }

    pub fn to_attributes(&self) -> Map<String, Value> {
        let counts = self.element_counts();
        let total: f64 = counts.values().sum();
        let elements: Vec<&String> = counts.keys().collect();
        let ratios: Vec<f64> = counts.values().map(|c| round(c / total)).collect();
        let reduced = reduce(&counts);

        let mut attrs = Map::new();
        attrs.insert("elements".into(), json!(elements));
        attrs.insert("nelements".into(), json!(counts.len()));
        attrs.insert("elements_ratios".into(), json!(ratios));
        attrs.insert(
            "chemical_formula_descriptive".into(),
            json!(formula(counts.iter().map(|(e, c)| (e.as_str(), *c)))),
        );
        attrs.insert(
            "chemical_formula_reduced".into(),
            json!(formula(reduced.iter().map(|(e, c)| (e.as_str(), *c)))),
        );
        attrs.insert(
            "chemical_formula_anonymous".into(),
            json!(anonymous_formula(&reduced)),
        );

        let dimension_types: Vec<u8> = self.pbc.iter().map(|p| u8::from(*p)).collect();
        attrs.insert("dimension_types".into(), json!(dimension_types));
        attrs.insert(
            "nperiodic_dimensions".into(),
            json!(self.pbc.iter().filter(|p| **p).count()),
        );
        attrs.insert("lattice_vectors".into(), json!(self.lattice_vectors));
        let positions: Vec<[f64; 3]> = self.sites.iter().map(|s| s.position).collect();
        attrs.insert("cartesian_site_positions".into(), json!(positions));
        attrs.insert("nsites".into(), json!(self.sites.len()));
        attrs.insert(
            "species".into(),
            Value::Array(self.species.iter().map(species_json).collect()),
        );
        let at_sites: Vec<&str> = self.sites.iter().map(|s| s.species.as_str()).collect();
        attrs.insert("species_at_sites".into(), json!(at_sites));

        let features: Vec<&str> = if self.species.iter().any(Species::is_disordered) {
            vec!["disorder"]
        } else {
            vec![]
        };
        attrs.insert("structure_features".into(), json!(features));
        attrs
    }
}

fn species_json(species: &Species) -> Value {
    let mut obj = Map::new();
    obj.insert("name".into(), json!(species.name));
    obj.insert("chemical_symbols".into(), json!(species.chemical_symbols));
    obj.insert("concentration".into(), json!(species.concentration));
    if let Some(mass) = &species.mass {
        obj.insert("mass".into(), json!(mass));
    }
    Value::Object(obj)
}

fn round(value: f64) -> f64 {
    (value * 1e8).round() / 1e8
}

fn is_integral(value: f64) -> bool {
    (value - value.round()).abs() < TOLERANCE
}

fn gcd(a: u64, b: u64) -> u64 {
    if b == 0 {
        a
    } else {
        gcd(b, a % b)
    }
}

/// Counts divided by their greatest common divisor when all are integral.
fn reduce(counts: &BTreeMap<String, f64>) -> BTreeMap<String, f64> {
    if !counts.values().all(|c| is_integral(*c) && *c >= 1.0) {
        return counts.clone();
    }
    let divisor = counts
        .values()
        .map(|c| c.round() as u64)
        .fold(0, gcd)
        .max(1);
    counts
        .iter()
        .map(|(e, c)| (e.clone(), (c.round() as u64 / divisor) as f64))
        .collect()
}

fn format_count(count: f64) -> String {
    if is_integral(count) {
        let n = count.round() as u64;
        if n == 1 {
            String::new()
        } else {
            n.to_string()
        }
    } else {
        let text = format!("{:.4}", count);
        text.trim_end_matches('0').trim_end_matches('.').to_string()
    }
}

fn formula<'a>(counts: impl Iterator<Item = (&'a str, f64)>) -> String {
    counts
        .map(|(element, count)| format!("{}{}", element, format_count(count)))
        .collect()
}

/// Anonymous symbols: `A`..`Z`, then `Aa`, `Ba`, ..., `Za`, `Ab`, ...
fn anonymous_symbol(index: usize) -> String {
    let upper = char::from(b'A' + (index % 26) as u8);
    if index < 26 {
        upper.to_string()
    } else {
        let lower = char::from(b'a' + ((index / 26 - 1) % 26) as u8);
        format!("{}{}", upper, lower)
    }
}

/// Reduced counts sorted in descending order, labelled by [`anonymous_symbol`].
fn anonymous_formula(reduced: &BTreeMap<String, f64>) -> String {
    let mut counts: Vec<f64> = reduced.values().copied().collect();
    counts.sort_by(|a, b| b.total_cmp(a));
    counts
        .into_iter()
        .enumerate()
        .map(|(i, c)| format!("{}{}", anonymous_symbol(i), format_count(c)))
        .collect()
}

fn determinant(m: &[[f64; 3]; 3]) -> f64 {
    m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1])
        - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
        + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0])
}

/// Cell vectors from lengths (Å) and angles (degrees): `a` along x, `b` in
/// the xy plane.
pub fn lattice_from_parameters(
    a: f64,
    b: f64,
    c: f64,
    alpha: f64,
    beta: f64,
    gamma: f64,
) -> Result<[[f64; 3]; 3], String> {
    let (alpha, beta, gamma) = (alpha.to_radians(), beta.to_radians(), gamma.to_radians());
    let cx = c * beta.cos();
    let cy = c * (alpha.cos() - beta.cos() * gamma.cos()) / gamma.sin();
    let cz_squared = c * c - cx * cx - cy * cy;
    if !(cz_squared > 0.0) || gamma.sin().abs() < TOLERANCE {
        return Err("cell parameters do not describe a valid cell".to_string());
    }
    let clean = |v: f64| if v.abs() < 1e-10 { 0.0 } else { v };
    Ok([
        [a, 0.0, 0.0],
        [clean(b * gamma.cos()), clean(b * gamma.sin()), 0.0],
        [clean(cx), clean(cy), cz_squared.sqrt()],
    ])
}

/// `frac · lattice`.
pub fn fractional_to_cartesian(lattice: &[[f64; 3]; 3], frac: [f64; 3]) -> [f64; 3] {
    let mut out = [0.0; 3];
    for (axis, value) in out.iter_mut().enumerate() {
        *value = (0..3).map(|i| frac[i] * lattice[i][axis]).sum();
    }
    out
}

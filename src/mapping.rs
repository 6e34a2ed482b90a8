use log::warn;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Dealership brand, which determines the statement layout for a given year.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, JsonSchema)]
#[serde(rename_all = "PascalCase")]
pub enum Brand {
    Stellantis,
    Gm,
    Ford,
    Honda,
    /// A brand without a dedicated statement layout. Uploads for these are
    /// stored as attachments only; no automated parsing is attempted.
    Other(String),
}

impl Brand {
    /// Stellantis statements arrive as a multi-sheet "data dump" and get a
    /// specialized scanning pass before literal cell mappings are consulted.
    pub fn uses_data_dump_layout(&self) -> bool {
        matches!(self, Brand::Stellantis)
    }
}

/// A spreadsheet cell coordinate. Row and column are 0-based.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
pub struct CellRef {
    #[schemars(description = "Worksheet name as it appears in the workbook tab")]
    pub sheet: String,
    pub row: u32,
    pub col: u32,
}

impl CellRef {
    pub fn new(sheet: impl Into<String>, row: u32, col: u32) -> Self {
        Self {
            sheet: sheet.into(),
            row,
            col,
        }
    }

    /// A1-style rendering, for log and discrepancy messages.
    pub fn a1(&self) -> String {
        let mut col_letters = String::new();
        let mut n = self.col as usize;
        loop {
            let remainder = n % 26;
            col_letters.insert(0, (b'A' + remainder as u8) as char);
            if n < 26 {
                break;
            }
            n = n / 26 - 1;
        }
        format!("{}{}", col_letters, self.row + 1)
    }
}

/// Maps one statement cell to a (department, metric) pair for a brand/year
/// layout. Authored by admins; read-only during import.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CellMapping {
    pub brand: Brand,

    #[schemars(description = "Statement year this mapping applies to")]
    pub year: i32,

    pub cell: CellRef,

    #[schemars(description = "Department label as printed on the statement (e.g. 'Parts Department')")]
    pub department: String,

    #[schemars(description = "Metric key from the metric catalog")]
    pub metric_key: String,

    #[serde(default)]
    #[schemars(description = "Optional pay-type or category filter for split layouts")]
    pub pay_type: Option<String>,
}

/// The full set of authored cell mappings, queried per brand and year.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct MappingSet {
    mappings: Vec<CellMapping>,
}

impl MappingSet {
    pub fn new(mappings: Vec<CellMapping>) -> Self {
        Self { mappings }
    }

    /// Mappings governing one brand's layout for one statement year, in
    /// authored order. An empty result is a configuration gap, not an
    /// error: the caller skips automated parsing.
    pub fn resolve(&self, brand: &Brand, year: i32) -> Vec<&CellMapping> {
        self.mappings
            .iter()
            .filter(|m| &m.brand == brand && m.year == year)
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }

    pub fn schema_as_json() -> Result<String, serde_json::Error> {
        let schema = schemars::schema_for!(MappingSet);
        serde_json::to_string_pretty(&schema)
    }
}

/// Normalizes a department label for matching: lower-case, drop the word
/// "department", collapse runs of non-alphanumerics to single spaces, trim.
/// Display names vary between the statement and the database ("Parts" vs
/// "Parts Department"), so both sides are normalized before comparison.
pub fn normalize_department_name(name: &str) -> String {
    let lowered = name.to_lowercase();
    let mut cleaned = String::with_capacity(lowered.len());
    let mut last_was_space = true;
    for c in lowered.chars() {
        if c.is_alphanumeric() {
            cleaned.push(c);
            last_was_space = false;
        } else if !last_was_space {
            cleaned.push(' ');
            last_was_space = true;
        }
    }
    cleaned
        .split_whitespace()
        .filter(|word| *word != "department")
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DepartmentRecord {
    pub id: u64,
    pub store_id: u64,
    pub name: String,
}

/// Resolves statement department labels to department records by
/// normalized-name lookup.
#[derive(Debug, Clone, Default)]
pub struct DepartmentDirectory {
    by_normalized: BTreeMap<String, DepartmentRecord>,
}

impl DepartmentDirectory {
    pub fn new(departments: Vec<DepartmentRecord>) -> Self {
        let by_normalized = departments
            .into_iter()
            .map(|d| (normalize_department_name(&d.name), d))
            .collect();
        Self { by_normalized }
    }

    /// Looks up a statement label. Unresolved labels are logged as warnings
    /// with the known names for context; the caller records a per-department
    /// error status rather than aborting the import.
    pub fn resolve(&self, label: &str) -> Option<&DepartmentRecord> {
        let normalized = normalize_department_name(label);
        let found = self.by_normalized.get(&normalized);
        if found.is_none() {
            warn!(
                "Unresolved department label '{}' (normalized '{}'); known departments: {:?}",
                label,
                normalized,
                self.by_normalized
                    .values()
                    .map(|d| d.name.as_str())
                    .collect::<Vec<_>>()
            );
        }
        found
    }

    pub fn records(&self) -> impl Iterator<Item = &DepartmentRecord> {
        self.by_normalized.values()
    }

    /// Departments sharing a store with the given department, excluding it.
    /// Attachment propagation targets after an import.
    pub fn siblings_of(&self, department_id: u64) -> Vec<&DepartmentRecord> {
        let Some(store_id) = self
            .by_normalized
            .values()
            .find(|d| d.id == department_id)
            .map(|d| d.store_id)
        else {
            return Vec::new();
        };
        self.by_normalized
            .values()
            .filter(|d| d.store_id == store_id && d.id != department_id)
            .collect()
    }
}

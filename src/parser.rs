use crate::catalog::MetricCatalog;
use crate::error::{FinancialOpsError, Result};
use crate::mapping::{normalize_department_name, Brand, CellMapping};
use calamine::{open_workbook_auto, Data, Reader};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Which uploaded file types are accepted, and which of those can be parsed.
/// Passed in explicitly rather than kept as an ambient table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadPolicy {
    pub accepted_extensions: Vec<String>,
    pub parseable_extensions: Vec<String>,
}

impl Default for UploadPolicy {
    fn default() -> Self {
        Self {
            accepted_extensions: ["xlsx", "xlsm", "xls", "csv", "pdf"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            // PDF is stored as an opaque attachment, never parsed.
            parseable_extensions: ["xlsx", "xlsm", "xls", "csv"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl UploadPolicy {
    fn extension_of(path: &Path) -> String {
        path.extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
            .to_lowercase()
    }

    pub fn accepts(&self, path: &Path) -> bool {
        self.accepted_extensions
            .contains(&Self::extension_of(path))
    }

    pub fn parseable(&self, path: &Path) -> bool {
        self.parseable_extensions
            .contains(&Self::extension_of(path))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Number(f64),
    Text(String),
    Bool(bool),
}

/// One worksheet held as a sparse cell map. Both calamine workbooks and CSV
/// files load into this, so the parsing strategies never touch file formats.
#[derive(Debug, Clone, Default)]
pub struct SheetGrid {
    pub name: String,
    cells: BTreeMap<(u32, u32), CellValue>,
    max_row: u32,
}

impl SheetGrid {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cells: BTreeMap::new(),
            max_row: 0,
        }
    }

    pub fn set(&mut self, row: u32, col: u32, value: CellValue) {
        self.max_row = self.max_row.max(row);
        self.cells.insert((row, col), value);
    }

    pub fn set_number(&mut self, row: u32, col: u32, value: f64) {
        self.set(row, col, CellValue::Number(value));
    }

    pub fn set_text(&mut self, row: u32, col: u32, value: impl Into<String>) {
        self.set(row, col, CellValue::Text(value.into()));
    }

    pub fn get(&self, row: u32, col: u32) -> Option<&CellValue> {
        self.cells.get(&(row, col))
    }

    /// Numeric read. Non-numeric and missing cells are `None`, never zero.
    pub fn number(&self, row: u32, col: u32) -> Option<f64> {
        match self.get(row, col) {
            Some(CellValue::Number(n)) => Some(*n),
            _ => None,
        }
    }

    pub fn text(&self, row: u32, col: u32) -> Option<&str> {
        match self.get(row, col) {
            Some(CellValue::Text(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn max_row(&self) -> u32 {
        self.max_row
    }
}

/// An uploaded statement workbook, format-agnostic once loaded.
#[derive(Debug, Clone, Default)]
pub struct Workbook {
    sheets: Vec<SheetGrid>,
}

impl Workbook {
    pub fn new(sheets: Vec<SheetGrid>) -> Self {
        Self { sheets }
    }

    /// Opens an uploaded statement. Dispatches on extension: Excel formats
    /// through calamine, CSV as a single synthetic sheet named after the
    /// file stem. Corrupt or unreadable files are a parse error.
    pub fn open(path: &Path) -> Result<Self> {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
            .to_lowercase();

        match extension.as_str() {
            "xlsx" | "xlsm" | "xls" => Self::open_excel(path),
            "csv" => Self::open_csv(path),
            other => Err(FinancialOpsError::UnsupportedFileType(other.to_string())),
        }
    }

    fn open_excel(path: &Path) -> Result<Self> {
        let mut workbook = open_workbook_auto(path)
            .map_err(|e| FinancialOpsError::Parse(format!("Failed to open workbook: {}", e)))?;

        let sheet_names = workbook.sheet_names().to_vec();
        let mut sheets = Vec::with_capacity(sheet_names.len());

        for name in sheet_names {
            let range = workbook
                .worksheet_range(&name)
                .map_err(|e| FinancialOpsError::Parse(format!("Sheet '{}': {}", name, e)))?;

            let mut grid = SheetGrid::new(&name);
            let (start_row, start_col) = range.start().unwrap_or((0, 0));

            for (r, c, data) in range.used_cells() {
                let row = start_row + r as u32;
                let col = start_col + c as u32;
                match data {
                    Data::Float(f) => grid.set_number(row, col, *f),
                    Data::Int(i) => grid.set_number(row, col, *i as f64),
                    Data::Bool(b) => grid.set(row, col, CellValue::Bool(*b)),
                    Data::String(s) if !s.trim().is_empty() => {
                        grid.set_text(row, col, s.trim());
                    }
                    _ => {}
                }
            }
            sheets.push(grid);
        }

        debug!("Opened workbook {:?} with {} sheets", path, sheets.len());
        Ok(Self { sheets })
    }

    fn open_csv(path: &Path) -> Result<Self> {
        let sheet_name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("Sheet1")
            .to_string();

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_path(path)
            .map_err(|e| FinancialOpsError::Parse(format!("Failed to open CSV: {}", e)))?;

        let mut grid = SheetGrid::new(&sheet_name);
        for (row_idx, record) in reader.records().enumerate() {
            let record =
                record.map_err(|e| FinancialOpsError::Parse(format!("CSV row error: {}", e)))?;
            for (col_idx, field) in record.iter().enumerate() {
                let field = field.trim();
                if field.is_empty() {
                    continue;
                }
                // Statement cells carry formatted numbers: commas and
                // parenthesized negatives.
                if let Some(n) = parse_statement_number(field) {
                    grid.set_number(row_idx as u32, col_idx as u32, n);
                } else {
                    grid.set_text(row_idx as u32, col_idx as u32, field);
                }
            }
        }

        Ok(Self { sheets: vec![grid] })
    }

    pub fn sheet(&self, name: &str) -> Option<&SheetGrid> {
        self.sheets.iter().find(|s| s.name == name)
    }

    pub fn sheets(&self) -> &[SheetGrid] {
        &self.sheets
    }

    /// The sheet a data-dump layout keeps its figures on: the first sheet
    /// whose name contains "data", else the sole/first sheet.
    pub fn data_sheet(&self) -> Option<&SheetGrid> {
        self.sheets
            .iter()
            .find(|s| s.name.to_lowercase().contains("data"))
            .or_else(|| self.sheets.first())
    }
}

fn parse_statement_number(field: &str) -> Option<f64> {
    let cleaned = field.replace([',', '$'], "");
    let (cleaned, negate) = if cleaned.starts_with('(') && cleaned.ends_with(')') {
        (cleaned[1..cleaned.len() - 1].to_string(), true)
    } else {
        (cleaned, false)
    };
    cleaned
        .trim()
        .parse::<f64>()
        .ok()
        .map(|n| if negate { -n } else { n })
}

/// A named line item beneath a main metric on the statement, collected
/// verbatim per department.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParsedSubMetric {
    pub name: String,
    pub parent_metric_key: String,
    pub value: Option<f64>,
}

/// Output of one statement parse: department label -> metric key -> value,
/// plus the sub-metric line items found under each department.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParsedStatement {
    pub metrics: BTreeMap<String, BTreeMap<String, Option<f64>>>,
    pub sub_metrics: BTreeMap<String, Vec<ParsedSubMetric>>,
}

impl ParsedStatement {
    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty() && self.sub_metrics.is_empty()
    }

    fn entry(&mut self, department: &str) -> &mut BTreeMap<String, Option<f64>> {
        self.metrics.entry(department.to_string()).or_default()
    }
}

/// One parse contract per brand layout, selected once per import.
pub trait StatementParser {
    fn parse(&self, workbook: &Workbook, mappings: &[&CellMapping]) -> Result<ParsedStatement>;
}

/// Selects the parsing strategy for a brand. Stellantis statements get the
/// data-dump scan with mapping fallback; everything else reads mapped cells
/// directly.
pub fn parser_for_brand<'a>(
    brand: &Brand,
    catalog: &'a MetricCatalog,
) -> Box<dyn StatementParser + 'a> {
    if brand.uses_data_dump_layout() {
        Box::new(DataDumpParser { catalog })
    } else {
        Box::new(CellMappingParser)
    }
}

/// Reads each mapped cell by its configured coordinate. Zero mappings is a
/// silent no-op: the statement simply has nothing to auto-import.
pub struct CellMappingParser;

impl StatementParser for CellMappingParser {
    fn parse(&self, workbook: &Workbook, mappings: &[&CellMapping]) -> Result<ParsedStatement> {
        let mut parsed = ParsedStatement::default();

        for mapping in mappings {
            let value = workbook
                .sheet(&mapping.cell.sheet)
                .and_then(|sheet| sheet.number(mapping.cell.row, mapping.cell.col));
            parsed
                .entry(&mapping.department)
                .insert(mapping.metric_key.clone(), value);
        }

        if !mappings.is_empty() {
            info!(
                "Cell-mapping parse extracted {} departments from {} mappings",
                parsed.metrics.len(),
                mappings.len()
            );
        }
        Ok(parsed)
    }
}

/// Stellantis-style "data dump" layout: a single data sheet with department
/// section headers followed by labeled metric rows and named sub-metric line
/// items. The scan runs first; literal cell mappings only fill metrics the
/// scan left null.
pub struct DataDumpParser<'a> {
    pub catalog: &'a MetricCatalog,
}

impl<'a> DataDumpParser<'a> {
    /// A section header is a text cell in the first column whose label ends
    /// with "department".
    fn header_label(sheet: &SheetGrid, row: u32) -> Option<String> {
        let text = sheet.text(row, 0)?;
        if text.to_lowercase().trim_end().ends_with("department") {
            Some(text.to_string())
        } else {
            None
        }
    }

    /// Maps a statement row label to a catalog metric key by normalized
    /// display name.
    fn metric_key_for_label(&self, label: &str) -> Option<String> {
        let normalized = normalize_department_name(label);
        self.catalog
            .iter()
            .find(|m| normalize_department_name(&m.display_name) == normalized)
            .map(|m| m.key.clone())
    }

    fn scan(&self, sheet: &SheetGrid) -> ParsedStatement {
        let mut parsed = ParsedStatement::default();
        let mut current_department: Option<String> = None;
        let mut current_metric_key: Option<String> = None;

        for row in 0..=sheet.max_row() {
            if let Some(header) = Self::header_label(sheet, row) {
                current_department = Some(header);
                current_metric_key = None;
                continue;
            }

            let Some(department) = current_department.clone() else {
                continue;
            };
            let Some(label) = sheet.text(row, 0) else {
                continue;
            };
            let value = sheet.number(row, 1);

            if let Some(key) = self.metric_key_for_label(label) {
                parsed.entry(&department).insert(key.clone(), value);
                current_metric_key = Some(key);
            } else if let Some(parent) = current_metric_key.clone() {
                // Unrecognized labels under a known metric are its line items.
                parsed
                    .sub_metrics
                    .entry(department)
                    .or_default()
                    .push(ParsedSubMetric {
                        name: label.to_string(),
                        parent_metric_key: parent,
                        value,
                    });
            }
        }

        parsed
    }
}

impl<'a> StatementParser for DataDumpParser<'a> {
    fn parse(&self, workbook: &Workbook, mappings: &[&CellMapping]) -> Result<ParsedStatement> {
        let mut parsed = match workbook.data_sheet() {
            Some(sheet) => self.scan(sheet),
            None => ParsedStatement::default(),
        };

        // Mapping pass fills gaps only; scanned values take precedence.
        for mapping in mappings {
            let existing = parsed
                .metrics
                .get(&mapping.department)
                .and_then(|metrics| metrics.get(&mapping.metric_key))
                .copied()
                .flatten();
            if existing.is_some() {
                continue;
            }
            let value = workbook
                .sheet(&mapping.cell.sheet)
                .and_then(|sheet| sheet.number(mapping.cell.row, mapping.cell.col));
            if value.is_some() {
                parsed
                    .entry(&mapping.department)
                    .insert(mapping.metric_key.clone(), value);
            }
        }

        info!(
            "Data-dump parse extracted {} departments, {} with sub-metric line items",
            parsed.metrics.len(),
            parsed.sub_metrics.len()
        );
        Ok(parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::CellRef;

    fn mapping(dept: &str, key: &str, sheet: &str, row: u32, col: u32) -> CellMapping {
        CellMapping {
            brand: Brand::Gm,
            year: 2024,
            cell: CellRef::new(sheet, row, col),
            department: dept.to_string(),
            metric_key: key.to_string(),
            pay_type: None,
        }
    }

    #[test]
    fn test_parse_statement_number() {
        assert_eq!(parse_statement_number("1,234.50"), Some(1234.5));
        assert_eq!(parse_statement_number("$500"), Some(500.0));
        assert_eq!(parse_statement_number("(2,000)"), Some(-2000.0));
        assert_eq!(parse_statement_number("n/a"), None);
    }

    #[test]
    fn test_cell_mapping_parser_missing_cells_are_null() {
        let mut sheet = SheetGrid::new("Summary");
        sheet.set_number(4, 2, 50000.0);
        sheet.set_text(5, 2, "n/a");
        let workbook = Workbook::new(vec![sheet]);

        let m1 = mapping("Service", "total_sales", "Summary", 4, 2);
        let m2 = mapping("Service", "gross_profit", "Summary", 5, 2);
        let m3 = mapping("Service", "sales_expense", "Summary", 6, 2);

        let parsed = CellMappingParser
            .parse(&workbook, &[&m1, &m2, &m3])
            .unwrap();

        let service = parsed.metrics.get("Service").unwrap();
        assert_eq!(service.get("total_sales").copied().flatten(), Some(50000.0));
        // Non-numeric and missing cells are null, never zero.
        assert_eq!(service.get("gross_profit").copied().flatten(), None);
        assert_eq!(service.get("sales_expense").copied().flatten(), None);
    }

    #[test]
    fn test_cell_mapping_parser_no_mappings_is_noop() {
        let workbook = Workbook::new(vec![SheetGrid::new("Summary")]);
        let parsed = CellMappingParser.parse(&workbook, &[]).unwrap();
        assert!(parsed.is_empty());
    }

    fn data_dump_sheet() -> SheetGrid {
        let mut sheet = SheetGrid::new("Data");
        sheet.set_text(0, 0, "Service Department");
        sheet.set_text(1, 0, "Total Sales");
        sheet.set_number(1, 1, 80000.0);
        sheet.set_text(2, 0, "Gross Profit");
        sheet.set_number(2, 1, 32000.0);
        sheet.set_text(3, 0, "Customer Pay Labor");
        sheet.set_number(3, 1, 21000.0);
        sheet.set_text(4, 0, "Warranty Labor");
        sheet.set_number(4, 1, 11000.0);
        sheet.set_text(6, 0, "Parts Department");
        sheet.set_text(7, 0, "Total Sales");
        sheet.set_number(7, 1, 40000.0);
        sheet
    }

    #[test]
    fn test_data_dump_scan_sections_and_sub_metrics() {
        let catalog = MetricCatalog::standard();
        let workbook = Workbook::new(vec![data_dump_sheet()]);
        let parser = DataDumpParser { catalog: &catalog };

        let parsed = parser.parse(&workbook, &[]).unwrap();

        let service = parsed.metrics.get("Service Department").unwrap();
        assert_eq!(service.get("total_sales").copied().flatten(), Some(80000.0));
        assert_eq!(service.get("gross_profit").copied().flatten(), Some(32000.0));

        let subs = parsed.sub_metrics.get("Service Department").unwrap();
        assert_eq!(subs.len(), 2);
        assert_eq!(subs[0].name, "Customer Pay Labor");
        assert_eq!(subs[0].parent_metric_key, "gross_profit");
        assert_eq!(subs[0].value, Some(21000.0));

        let parts = parsed.metrics.get("Parts Department").unwrap();
        assert_eq!(parts.get("total_sales").copied().flatten(), Some(40000.0));
    }

    #[test]
    fn test_data_dump_mapping_fallback_fills_gaps_only() {
        let catalog = MetricCatalog::standard();
        let mut dump = data_dump_sheet();
        // sales_expense never appears in the dump for Service.
        dump.set_number(20, 5, 999.0);
        let mut mapped_sheet = SheetGrid::new("Page2");
        mapped_sheet.set_number(0, 0, 7000.0);
        mapped_sheet.set_number(1, 0, 123456.0);
        let workbook = Workbook::new(vec![dump, mapped_sheet]);

        // Fallback for a gap, and a conflicting mapping for a scanned value.
        let gap = mapping("Service Department", "sales_expense", "Page2", 0, 0);
        let conflict = mapping("Service Department", "total_sales", "Page2", 1, 0);

        let parser = DataDumpParser { catalog: &catalog };
        let parsed = parser.parse(&workbook, &[&gap, &conflict]).unwrap();

        let service = parsed.metrics.get("Service Department").unwrap();
        // Gap filled from the mapping pass.
        assert_eq!(service.get("sales_expense").copied().flatten(), Some(7000.0));
        // Scanned value wins over the mapping.
        assert_eq!(service.get("total_sales").copied().flatten(), Some(80000.0));
    }

    #[test]
    fn test_parser_for_brand_dispatch() {
        let catalog = MetricCatalog::standard();
        let workbook = Workbook::new(vec![data_dump_sheet()]);

        // Stellantis goes through the data-dump scan even with no mappings.
        let parsed = parser_for_brand(&Brand::Stellantis, &catalog)
            .parse(&workbook, &[])
            .unwrap();
        assert!(!parsed.is_empty());

        // Other brands read mapped cells only.
        let parsed = parser_for_brand(&Brand::Gm, &catalog)
            .parse(&workbook, &[])
            .unwrap();
        assert!(parsed.is_empty());
    }

    #[test]
    fn test_workbook_open_rejects_pdf() {
        let err = Workbook::open(Path::new("statement.pdf")).unwrap_err();
        assert!(matches!(err, FinancialOpsError::UnsupportedFileType(_)));
    }

    #[test]
    fn test_workbook_open_corrupt_file_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.xlsx");
        std::fs::write(&path, b"this is not a spreadsheet").unwrap();
        let err = Workbook::open(&path).unwrap_err();
        assert!(matches!(err, FinancialOpsError::Parse(_)));
    }

    #[test]
    fn test_workbook_open_csv() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("statement.csv");
        std::fs::write(&path, "Service Department,\nTotal Sales,\"50,000\"\n").unwrap();

        let workbook = Workbook::open(&path).unwrap();
        let sheet = workbook.sheet("statement").unwrap();
        assert_eq!(sheet.text(0, 0), Some("Service Department"));
        assert_eq!(sheet.number(1, 1), Some(50000.0));
        // The sole CSV sheet doubles as the data sheet.
        assert_eq!(workbook.data_sheet().unwrap().name, "statement");
    }

    #[test]
    fn test_upload_policy() {
        let policy = UploadPolicy::default();
        assert!(policy.accepts(Path::new("s.xlsx")));
        assert!(policy.accepts(Path::new("s.pdf")));
        assert!(!policy.accepts(Path::new("s.docx")));
        assert!(policy.parseable(Path::new("s.csv")));
        assert!(!policy.parseable(Path::new("s.pdf")));
    }
}

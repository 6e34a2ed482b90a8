//! # Dealership Financials
//!
//! A library for importing dealership financial statements from spreadsheet
//! uploads, reconciling them against stored monthly data, and projecting
//! forward-looking forecasts.
//!
//! ## Core Concepts
//!
//! - **Metric Catalog**: The closed set of tracked financial metrics; derived
//!   percentage metrics carry a numerator/denominator calculation and are
//!   never stored directly
//! - **Cell Mappings**: Per-brand, per-year spreadsheet coordinates that tell
//!   the parser where each department's metrics live
//! - **Reconciliation**: Parsed values compared cell-for-cell against stored
//!   entries, classified per department as match, imported, mismatch, or error
//! - **Import**: Unconditional upsert of parsed values, with per-write retry
//!   and partial success kept visible
//! - **Aggregation**: Quarter and annual rollups that recompute ratios from
//!   summed components rather than averaging percentages
//! - **Forecasting**: Driver and weight based projection where locked cells
//!   survive recomputation
//!
//! ## Example
//!
//! ```rust,ignore
//! use dealership_financials::*;
//!
//! let catalog = MetricCatalog::standard();
//! let mappings = MappingSet::new(vec![]);
//! let directory = DepartmentDirectory::new(vec![DepartmentRecord {
//!     id: 1,
//!     store_id: 10,
//!     name: "New Car".to_string(),
//! }]);
//!
//! let importer = StatementImporter::new(&catalog, &mappings, &directory);
//! let mut store = MemoryStore::new();
//! let report = importer.process(
//!     &mut store,
//!     std::path::Path::new("statement.xlsx"),
//!     &Brand::Stellantis,
//!     "2024-06".parse()?,
//!     1,
//!     None,
//! )?;
//! ```

pub mod admin;
pub mod aggregate;
pub mod catalog;
pub mod debounce;
pub mod error;
pub mod forecast;
pub mod import;
pub mod mapping;
pub mod month;
pub mod parser;
pub mod reconcile;
pub mod store;

pub use admin::{resend_user_invite, Caller, IdentityProvider, InviteError, Role};
pub use aggregate::{
    apply_cell_edit, classify_variance, effective_target, sub_metric_effective_target,
    variance_against_target, AggregationEngine, Rollup, VarianceLevel,
};
pub use catalog::{Calculation, MetricCatalog, MetricDefinition, TargetDirection, ValueType};
pub use debounce::{CellKey, DebounceBuffer, PendingEdit};
pub use error::{FinancialOpsError, Result};
pub use forecast::{
    distribute_quarter_edit, project_year, recompute_and_persist, set_entry_lock, BaselineYear,
    ForecastDrivers, ForecastWeights,
};
pub use import::{import_statement, ImportConfig, ImportFailure, ImportOutcome};
pub use mapping::{
    normalize_department_name, Brand, CellMapping, CellRef, DepartmentDirectory, DepartmentRecord,
    MappingSet,
};
pub use month::{parse_period_string, Month};
pub use parser::{
    parser_for_brand, ParsedStatement, SheetGrid, StatementParser, UploadPolicy, Workbook,
};
pub use reconcile::{reconcile_statement, DepartmentValidation, Discrepancy, ValidationStatus};
pub use store::{
    with_retry, Attachment, FinancialEntry, FinancialStore, FinancialTarget, ForecastEntryRow,
    ForecastWeightRow, MemoryStore, StoreError, SubMetricEntry, SubMetricTarget,
};

use log::{debug, info};
use std::path::Path;

/// Everything that came out of one upload: how each department reconciled,
/// and what was actually written.
#[derive(Debug)]
pub struct ImportReport {
    pub validations: Vec<DepartmentValidation>,
    pub outcome: ImportOutcome,
}

/// End-to-end statement pipeline: open the file, pick the brand's parsing
/// strategy, reconcile against stored data, then import.
pub struct StatementImporter<'a> {
    catalog: &'a MetricCatalog,
    mappings: &'a MappingSet,
    directory: &'a DepartmentDirectory,
    policy: UploadPolicy,
    import_config: ImportConfig,
}

impl<'a> StatementImporter<'a> {
    pub fn new(
        catalog: &'a MetricCatalog,
        mappings: &'a MappingSet,
        directory: &'a DepartmentDirectory,
    ) -> Self {
        Self {
            catalog,
            mappings,
            directory,
            policy: UploadPolicy::default(),
            import_config: ImportConfig::default(),
        }
    }

    pub fn with_import_config(mut self, config: ImportConfig) -> Self {
        self.import_config = config;
        self
    }

    fn parse(&self, path: &Path, brand: &Brand, month: Month) -> Result<ParsedStatement> {
        let workbook = Workbook::open(path)?;
        let mappings = self.mappings.resolve(brand, month.year());
        debug!(
            "Parsing {} with {} cell mappings for {:?} {}",
            path.display(),
            mappings.len(),
            brand,
            month.year()
        );
        parser_for_brand(brand, self.catalog).parse(&workbook, &mappings)
    }

    /// Parses and reconciles without writing anything. The preview shown
    /// before an import is confirmed.
    pub fn validate(
        &self,
        store: &dyn FinancialStore,
        path: &Path,
        brand: &Brand,
        month: Month,
    ) -> Result<Vec<DepartmentValidation>> {
        let parsed = self.parse(path, brand, month)?;
        reconcile_statement(&parsed, self.directory, store, month)
    }

    /// Runs the full pipeline. Files the upload policy accepts but cannot
    /// parse (PDF) are stored as attachments only.
    pub fn process(
        &self,
        store: &mut dyn FinancialStore,
        path: &Path,
        brand: &Brand,
        month: Month,
        actor: u64,
        attachment: Option<&Attachment>,
    ) -> Result<ImportReport> {
        if !self.policy.accepts(path) {
            return Err(FinancialOpsError::UnsupportedFileType(
                path.display().to_string(),
            ));
        }

        if !self.policy.parseable(path) {
            info!(
                "Upload {} accepted as attachment only; no data extracted",
                path.display()
            );
            let mut outcome = ImportOutcome {
                brand: Some(brand.clone()),
                ..ImportOutcome::default()
            };
            if let Some(attachment) = attachment {
                self.attach_only(store, attachment, &mut outcome)?;
            }
            return Ok(ImportReport {
                validations: Vec::new(),
                outcome,
            });
        }

        let parsed = self.parse(path, brand, month)?;
        let validations = reconcile_statement(&parsed, self.directory, store, month)?;
        let outcome = import_statement(
            store,
            &parsed,
            self.directory,
            self.catalog,
            month,
            actor,
            brand,
            attachment,
            &self.import_config,
        )?;

        Ok(ImportReport {
            validations,
            outcome,
        })
    }

    fn attach_only(
        &self,
        store: &mut dyn FinancialStore,
        attachment: &Attachment,
        outcome: &mut ImportOutcome,
    ) -> Result<()> {
        store.replace_attachment(attachment.clone())?;
        for sibling in self.directory.siblings_of(attachment.department_id) {
            store.replace_attachment(Attachment {
                department_id: sibling.id,
                ..attachment.clone()
            })?;
            outcome.attachments_propagated.push(sibling.id);
        }
        Ok(())
    }
}

use crate::error::Result;
use crate::mapping::DepartmentDirectory;
use crate::month::Month;
use crate::parser::ParsedStatement;
use crate::store::FinancialStore;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStatus {
    /// Every compared metric equal, nothing new to store.
    Match,
    /// At least one parsed value has no stored counterpart.
    Imported,
    /// At least one compared metric differs. Wins over Imported because it
    /// requires human review.
    Mismatch,
    /// The department label could not be resolved to a department record.
    Error,
}

/// One spreadsheet-vs-stored divergence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Discrepancy {
    pub metric_key: String,
    pub excel_value: f64,
    pub db_value: f64,
}

/// Per-department outcome of comparing a parsed statement against storage.
/// Transient: computed per import action, never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepartmentValidation {
    pub department_label: String,
    pub department_id: Option<u64>,
    pub status: ValidationStatus,
    pub discrepancies: Vec<Discrepancy>,
    /// Metric keys present in the statement but absent in storage.
    pub new_metrics: Vec<String>,
}

/// Compares parsed metric values against stored entries for the target
/// month. Equality is exact: entry values are whole-rounded on the way in,
/// so any difference is a real discrepancy.
pub fn reconcile_statement(
    parsed: &ParsedStatement,
    directory: &DepartmentDirectory,
    store: &dyn FinancialStore,
    month: Month,
) -> Result<Vec<DepartmentValidation>> {
    let mut results = Vec::new();

    for (label, metrics) in &parsed.metrics {
        let Some(record) = directory.resolve(label) else {
            results.push(DepartmentValidation {
                department_label: label.clone(),
                department_id: None,
                status: ValidationStatus::Error,
                discrepancies: Vec::new(),
                new_metrics: Vec::new(),
            });
            continue;
        };

        let stored = store.entries(record.id, month).map_err(crate::error::FinancialOpsError::Storage)?;

        let mut discrepancies = Vec::new();
        let mut new_metrics = Vec::new();

        for (metric_key, parsed_value) in metrics {
            let Some(excel_value) = parsed_value else {
                continue;
            };
            match stored.iter().find(|e| &e.metric_key == metric_key) {
                Some(entry) => {
                    if entry.value != *excel_value {
                        discrepancies.push(Discrepancy {
                            metric_key: metric_key.clone(),
                            excel_value: *excel_value,
                            db_value: entry.value,
                        });
                    }
                }
                None => new_metrics.push(metric_key.clone()),
            }
        }

        // A department can show both new values and a mismatch on different
        // metrics; mismatch takes precedence. Any net-new value is enough to
        // mark Imported even when every overlapping metric matches.
        let status = if !discrepancies.is_empty() {
            ValidationStatus::Mismatch
        } else if !new_metrics.is_empty() {
            ValidationStatus::Imported
        } else {
            ValidationStatus::Match
        };

        results.push(DepartmentValidation {
            department_label: label.clone(),
            department_id: Some(record.id),
            status,
            discrepancies,
            new_metrics,
        });
    }

    Ok(results)
}

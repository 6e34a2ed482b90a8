use crate::catalog::MetricCatalog;
use crate::error::Result;
use crate::mapping::{Brand, DepartmentDirectory};
use crate::month::Month;
use crate::parser::ParsedStatement;
use crate::store::{
    round_for_storage, with_retry, Attachment, FinancialEntry, FinancialStore, SubMetricEntry,
    DEFAULT_RETRY_ATTEMPTS, DEFAULT_RETRY_BASE_DELAY,
};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ImportConfig {
    pub retry_attempts: u32,
    pub retry_base_delay: Duration,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            retry_base_delay: DEFAULT_RETRY_BASE_DELAY,
        }
    }
}

/// A write that failed after retries were exhausted. Reported to the caller
/// for display; values already committed are not rolled back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportFailure {
    pub department_label: String,
    pub metric_key: String,
    pub reason: String,
    /// Connectivity failures are messaged differently from other causes.
    pub transient: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImportOutcome {
    /// Brand layout the statement was imported under, kept with the outcome
    /// so a stored result remains traceable to its parsing strategy.
    pub brand: Option<Brand>,
    pub entries_written: u32,
    pub sub_metrics_written: u32,
    pub failures: Vec<ImportFailure>,
    pub skipped_departments: Vec<String>,
    /// Department ids the triggering attachment was propagated to.
    pub attachments_propagated: Vec<u64>,
}

impl ImportOutcome {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty() && self.skipped_departments.is_empty()
    }
}

/// Upserts every parsed metric and sub-metric value for the target month.
/// Import always refreshes, regardless of validator classification:
/// sub-metrics are outside validation and must be kept in sync. After the
/// primary department's import completes, the triggering attachment is
/// propagated to sibling departments at the same store.
#[allow(clippy::too_many_arguments)]
pub fn import_statement(
    store: &mut dyn FinancialStore,
    parsed: &ParsedStatement,
    directory: &DepartmentDirectory,
    catalog: &MetricCatalog,
    month: Month,
    actor: u64,
    brand: &Brand,
    attachment: Option<&Attachment>,
    config: &ImportConfig,
) -> Result<ImportOutcome> {
    let mut outcome = ImportOutcome {
        brand: Some(brand.clone()),
        ..ImportOutcome::default()
    };

    info!(
        "Importing statement for {} ({:?}): {} departments",
        month,
        brand,
        parsed.metrics.len()
    );

    for (label, metrics) in &parsed.metrics {
        let Some(record) = directory.resolve(label) else {
            outcome.skipped_departments.push(label.clone());
            continue;
        };

        for (metric_key, value) in metrics {
            let Some(value) = value else { continue };
            if catalog.is_derived(metric_key) {
                warn!(
                    "Skipping derived metric '{}' for '{}': derived values are never stored",
                    metric_key, label
                );
                continue;
            }

            let entry = FinancialEntry {
                department_id: record.id,
                month,
                metric_key: metric_key.clone(),
                value: round_for_storage(*value),
                notes: None,
                created_by: actor,
            };

            let result = with_retry(config.retry_attempts, config.retry_base_delay, || {
                store.upsert_entry(entry.clone())
            });
            match result {
                Ok(()) => outcome.entries_written += 1,
                Err(e) => outcome.failures.push(ImportFailure {
                    department_label: label.clone(),
                    metric_key: metric_key.clone(),
                    reason: e.to_string(),
                    transient: e.is_transient(),
                }),
            }
        }

        if let Some(subs) = parsed.sub_metrics.get(label) {
            for sub in subs {
                let Some(value) = sub.value else { continue };
                let entry = SubMetricEntry {
                    department_id: record.id,
                    month,
                    parent_metric_key: sub.parent_metric_key.clone(),
                    name: sub.name.clone(),
                    value: round_for_storage(value),
                };
                let result = with_retry(config.retry_attempts, config.retry_base_delay, || {
                    store.upsert_sub_metric(entry.clone())
                });
                match result {
                    Ok(()) => outcome.sub_metrics_written += 1,
                    Err(e) => outcome.failures.push(ImportFailure {
                        department_label: label.clone(),
                        metric_key: format!("{}/{}", sub.parent_metric_key, sub.name),
                        reason: e.to_string(),
                        transient: e.is_transient(),
                    }),
                }
            }
        }
    }

    // One uploaded statement commonly covers every department at the store,
    // so the attachment record is cloned to siblings after the primary
    // department's import completes.
    if let Some(primary) = attachment {
        propagate_attachment(store, directory, primary, config, &mut outcome)?;
    }

    info!(
        "Import finished: {} entries, {} sub-metrics, {} failures",
        outcome.entries_written,
        outcome.sub_metrics_written,
        outcome.failures.len()
    );
    Ok(outcome)
}

fn propagate_attachment(
    store: &mut dyn FinancialStore,
    directory: &DepartmentDirectory,
    primary: &Attachment,
    config: &ImportConfig,
    outcome: &mut ImportOutcome,
) -> Result<()> {
    for sibling in directory.siblings_of(primary.department_id) {
        let clone = Attachment {
            department_id: sibling.id,
            ..primary.clone()
        };
        let result = with_retry(config.retry_attempts, config.retry_base_delay, || {
            store.replace_attachment(clone.clone())
        });
        match result {
            Ok(()) => {
                debug!(
                    "Propagated attachment {} to department {}",
                    primary.file_name, sibling.id
                );
                outcome.attachments_propagated.push(sibling.id);
            }
            Err(e) => outcome.failures.push(ImportFailure {
                department_label: sibling.name.clone(),
                metric_key: "attachment".to_string(),
                reason: e.to_string(),
                transient: e.is_transient(),
            }),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::DepartmentRecord;
    use crate::parser::ParsedSubMetric;
    use crate::store::MemoryStore;
    use std::collections::BTreeMap;

    fn month(s: &str) -> Month {
        s.parse().unwrap()
    }

    fn directory() -> DepartmentDirectory {
        DepartmentDirectory::new(vec![
            DepartmentRecord {
                id: 1,
                store_id: 10,
                name: "Service".to_string(),
            },
            DepartmentRecord {
                id: 2,
                store_id: 10,
                name: "Parts".to_string(),
            },
        ])
    }

    fn fast_config() -> ImportConfig {
        ImportConfig {
            retry_attempts: 3,
            retry_base_delay: Duration::from_millis(1),
        }
    }

    fn parsed_statement() -> ParsedStatement {
        let mut parsed = ParsedStatement::default();
        let mut metrics = BTreeMap::new();
        metrics.insert("total_sales".to_string(), Some(50000.4));
        metrics.insert("gross_profit".to_string(), Some(20000.0));
        metrics.insert("sales_expense".to_string(), None);
        parsed.metrics.insert("Service".to_string(), metrics);
        parsed.sub_metrics.insert(
            "Service".to_string(),
            vec![ParsedSubMetric {
                name: "Customer Pay Labor".to_string(),
                parent_metric_key: "gross_profit".to_string(),
                value: Some(12000.0),
            }],
        );
        parsed
    }

    #[test]
    fn test_import_upserts_rounded_values() {
        let mut store = MemoryStore::new();
        let outcome = import_statement(
            &mut store,
            &parsed_statement(),
            &directory(),
            &MetricCatalog::standard(),
            month("2024-03"),
            7,
            &Brand::Gm,
            None,
            &fast_config(),
        )
        .unwrap();

        assert_eq!(outcome.entries_written, 2);
        assert_eq!(outcome.sub_metrics_written, 1);
        assert!(outcome.is_complete());
        assert_eq!(outcome.brand, Some(Brand::Gm));

        let sales = store.entry(1, month("2024-03"), "total_sales").unwrap().unwrap();
        assert_eq!(sales.value, 50000.0);
        assert_eq!(sales.created_by, 7);
        // Null parsed cells are never written.
        assert!(store.entry(1, month("2024-03"), "sales_expense").unwrap().is_none());
    }

    #[test]
    fn test_import_overwrites_existing_regardless_of_mismatch() {
        let mut store = MemoryStore::new();
        store
            .upsert_entry(FinancialEntry {
                department_id: 1,
                month: month("2024-03"),
                metric_key: "total_sales".to_string(),
                value: 45000.0,
                notes: None,
                created_by: 1,
            })
            .unwrap();

        import_statement(
            &mut store,
            &parsed_statement(),
            &directory(),
            &MetricCatalog::standard(),
            month("2024-03"),
            7,
            &Brand::Gm,
            None,
            &fast_config(),
        )
        .unwrap();

        let sales = store.entry(1, month("2024-03"), "total_sales").unwrap().unwrap();
        assert_eq!(sales.value, 50000.0);
    }

    #[test]
    fn test_derived_metrics_are_never_stored() {
        let mut parsed = ParsedStatement::default();
        let mut metrics = BTreeMap::new();
        metrics.insert("gross_profit_pct".to_string(), Some(40.0));
        parsed.metrics.insert("Service".to_string(), metrics);

        let mut store = MemoryStore::new();
        let outcome = import_statement(
            &mut store,
            &parsed,
            &directory(),
            &MetricCatalog::standard(),
            month("2024-03"),
            7,
            &Brand::Gm,
            None,
            &fast_config(),
        )
        .unwrap();

        assert_eq!(outcome.entries_written, 0);
        assert!(store.entry(1, month("2024-03"), "gross_profit_pct").unwrap().is_none());
    }

    #[test]
    fn test_attachment_propagates_to_siblings() {
        let mut store = MemoryStore::new();
        let primary = Attachment {
            department_id: 1,
            month: month("2024-03"),
            file_name: "march.xlsx".to_string(),
            file_path: "statements/10/march.xlsx".to_string(),
            file_type: "xlsx".to_string(),
            file_size: 2048,
            uploaded_by: 7,
        };
        store.replace_attachment(primary.clone()).unwrap();

        let outcome = import_statement(
            &mut store,
            &parsed_statement(),
            &directory(),
            &MetricCatalog::standard(),
            month("2024-03"),
            7,
            &Brand::Gm,
            Some(&primary),
            &fast_config(),
        )
        .unwrap();

        assert_eq!(outcome.attachments_propagated, vec![2]);
        let sibling = store.attachment(2, month("2024-03")).unwrap().unwrap();
        assert_eq!(sibling.file_path, primary.file_path);
        // Shared file path: still a single stored object.
        assert_eq!(store.stored_files().unwrap().len(), 1);
    }

    #[test]
    fn test_transient_failures_are_retried() {
        let mut store = MemoryStore::new();
        store.fail_next_writes(2);

        let outcome = import_statement(
            &mut store,
            &parsed_statement(),
            &directory(),
            &MetricCatalog::standard(),
            month("2024-03"),
            7,
            &Brand::Gm,
            None,
            &fast_config(),
        )
        .unwrap();

        assert!(outcome.is_complete(), "retries should absorb two transient failures");
        assert_eq!(outcome.entries_written, 2);
    }

    #[test]
    fn test_partial_success_is_visible() {
        let mut store = MemoryStore::new();
        // More consecutive failures than the retry budget for one write.
        store.fail_next_writes(3);

        let outcome = import_statement(
            &mut store,
            &parsed_statement(),
            &directory(),
            &MetricCatalog::standard(),
            month("2024-03"),
            7,
            &Brand::Gm,
            None,
            &fast_config(),
        )
        .unwrap();

        assert_eq!(outcome.failures.len(), 1);
        assert!(outcome.failures[0].transient);
        // Later writes still committed; nothing is rolled back.
        assert!(outcome.entries_written >= 1);
    }

    #[test]
    fn test_unresolved_department_is_skipped_not_fatal() {
        let mut parsed = ParsedStatement::default();
        let mut metrics = BTreeMap::new();
        metrics.insert("total_sales".to_string(), Some(100.0));
        parsed.metrics.insert("Body Shop".to_string(), metrics);

        let mut store = MemoryStore::new();
        let outcome = import_statement(
            &mut store,
            &parsed,
            &directory(),
            &MetricCatalog::standard(),
            month("2024-03"),
            7,
            &Brand::Gm,
            None,
            &fast_config(),
        )
        .unwrap();

        assert_eq!(outcome.skipped_departments, vec!["Body Shop".to_string()]);
        assert_eq!(outcome.entries_written, 0);
    }
}

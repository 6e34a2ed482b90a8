use crate::month::Month;
use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    /// Connectivity-style failure worth retrying.
    #[error("Transient storage failure: {0}")]
    Transient(String),

    #[error("Storage failure: {0}")]
    Terminal(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Entry values are whole-rounded before storage.
pub fn round_for_storage(value: f64) -> f64 {
    value.round()
}

/// Row in `financial_entries`, unique on (department_id, month, metric_key).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FinancialEntry {
    pub department_id: u64,
    pub month: Month,
    pub metric_key: String,
    pub value: f64,
    #[serde(default)]
    pub notes: Option<String>,
    pub created_by: u64,
}

/// Row in `financial_targets`, unique on (department_id, metric_key,
/// quarter, year). One row per quarter, carried across the calendar year.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FinancialTarget {
    pub department_id: u64,
    pub metric_key: String,
    pub quarter: u32,
    pub year: i32,
    pub target_value: f64,
    pub target_direction: crate::catalog::TargetDirection,
}

/// A named line item stored independently of its parent metric. Sub-metrics
/// roll up into the parent but are never authoritative for it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubMetricEntry {
    pub department_id: u64,
    pub month: Month,
    pub parent_metric_key: String,
    pub name: String,
    pub value: f64,
}

/// Independent target for a sub-metric, keyed by name/quarter/year.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubMetricTarget {
    pub department_id: u64,
    pub name: String,
    pub quarter: u32,
    pub year: i32,
    pub target_value: f64,
}

/// Row in `financial_attachments`, unique on (department_id, month).
/// Replacing is upsert semantics: old file and row removed, never appended.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Attachment {
    pub department_id: u64,
    pub month: Month,
    pub file_name: String,
    pub file_path: String,
    pub file_type: String,
    pub file_size: u64,
    pub uploaded_by: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ForecastEntryRow {
    pub department_id: u64,
    pub year: i32,
    pub month: u32,
    pub metric_key: String,
    pub value: f64,
    pub baseline: f64,
    pub locked: bool,
}

/// Fraction of the annual total assigned to one month, unique on
/// (department_id, year, month).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ForecastWeightRow {
    pub department_id: u64,
    pub year: i32,
    pub month: u32,
    pub weight: f64,
    pub locked: bool,
}

/// Boundary to the hosted relational store and object storage. Uniqueness
/// constraints on the keyed tuples are the only concurrency guard
/// (last-write-wins); there is no optimistic-concurrency token.
pub trait FinancialStore {
    fn entries(&self, department_id: u64, month: Month) -> StoreResult<Vec<FinancialEntry>>;
    fn entry(
        &self,
        department_id: u64,
        month: Month,
        metric_key: &str,
    ) -> StoreResult<Option<FinancialEntry>>;
    fn upsert_entry(&mut self, entry: FinancialEntry) -> StoreResult<()>;
    fn delete_entry(
        &mut self,
        department_id: u64,
        month: Month,
        metric_key: &str,
    ) -> StoreResult<()>;

    fn targets(&self, department_id: u64, year: i32) -> StoreResult<Vec<FinancialTarget>>;
    fn upsert_target(&mut self, target: FinancialTarget) -> StoreResult<()>;

    fn sub_metric_entries(
        &self,
        department_id: u64,
        month: Month,
    ) -> StoreResult<Vec<SubMetricEntry>>;
    fn upsert_sub_metric(&mut self, entry: SubMetricEntry) -> StoreResult<()>;
    fn sub_metric_targets(
        &self,
        department_id: u64,
        year: i32,
    ) -> StoreResult<Vec<SubMetricTarget>>;
    fn upsert_sub_metric_target(&mut self, target: SubMetricTarget) -> StoreResult<()>;

    fn attachment(&self, department_id: u64, month: Month) -> StoreResult<Option<Attachment>>;
    /// Replaces any existing attachment for the (department, month): deletes
    /// the old row and its stored file alongside the insert. At most one
    /// attachment exists afterward.
    fn replace_attachment(&mut self, attachment: Attachment) -> StoreResult<()>;

    fn forecast_entries(
        &self,
        department_id: u64,
        year: i32,
    ) -> StoreResult<Vec<ForecastEntryRow>>;
    fn upsert_forecast_entry(&mut self, entry: ForecastEntryRow) -> StoreResult<()>;
    fn forecast_weights(
        &self,
        department_id: u64,
        year: i32,
    ) -> StoreResult<Vec<ForecastWeightRow>>;
    fn upsert_forecast_weight(&mut self, weight: ForecastWeightRow) -> StoreResult<()>;

    /// Object-storage paths currently held. Used to verify replacement
    /// removed the superseded file.
    fn stored_files(&self) -> StoreResult<Vec<String>>;
}

/// In-memory implementation used in tests and as the reference semantics for
/// the hosted backend.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: BTreeMap<(u64, Month, String), FinancialEntry>,
    targets: BTreeMap<(u64, String, u32, i32), FinancialTarget>,
    sub_metrics: BTreeMap<(u64, Month, String, String), SubMetricEntry>,
    sub_metric_targets: BTreeMap<(u64, String, u32, i32), SubMetricTarget>,
    attachments: BTreeMap<(u64, Month), Attachment>,
    forecast_entries: BTreeMap<(u64, i32, u32, String), ForecastEntryRow>,
    forecast_weights: BTreeMap<(u64, i32, u32), ForecastWeightRow>,
    files: Vec<String>,
    fail_next_writes: u32,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `n` write calls fail transiently. Exercises the
    /// importer's retry path.
    pub fn fail_next_writes(&mut self, n: u32) {
        self.fail_next_writes = n;
    }

    fn check_write(&mut self) -> StoreResult<()> {
        if self.fail_next_writes > 0 {
            self.fail_next_writes -= 1;
            return Err(StoreError::Transient("injected connectivity failure".to_string()));
        }
        Ok(())
    }
}

impl FinancialStore for MemoryStore {
    fn entries(&self, department_id: u64, month: Month) -> StoreResult<Vec<FinancialEntry>> {
        Ok(self
            .entries
            .values()
            .filter(|e| e.department_id == department_id && e.month == month)
            .cloned()
            .collect())
    }

    fn entry(
        &self,
        department_id: u64,
        month: Month,
        metric_key: &str,
    ) -> StoreResult<Option<FinancialEntry>> {
        Ok(self
            .entries
            .get(&(department_id, month, metric_key.to_string()))
            .cloned())
    }

    fn upsert_entry(&mut self, entry: FinancialEntry) -> StoreResult<()> {
        self.check_write()?;
        let key = (entry.department_id, entry.month, entry.metric_key.clone());
        self.entries.insert(key, entry);
        Ok(())
    }

    fn delete_entry(
        &mut self,
        department_id: u64,
        month: Month,
        metric_key: &str,
    ) -> StoreResult<()> {
        self.check_write()?;
        self.entries
            .remove(&(department_id, month, metric_key.to_string()));
        Ok(())
    }

    fn targets(&self, department_id: u64, year: i32) -> StoreResult<Vec<FinancialTarget>> {
        Ok(self
            .targets
            .values()
            .filter(|t| t.department_id == department_id && t.year == year)
            .cloned()
            .collect())
    }

    fn upsert_target(&mut self, target: FinancialTarget) -> StoreResult<()> {
        self.check_write()?;
        let key = (
            target.department_id,
            target.metric_key.clone(),
            target.quarter,
            target.year,
        );
        self.targets.insert(key, target);
        Ok(())
    }

    fn sub_metric_entries(
        &self,
        department_id: u64,
        month: Month,
    ) -> StoreResult<Vec<SubMetricEntry>> {
        Ok(self
            .sub_metrics
            .values()
            .filter(|e| e.department_id == department_id && e.month == month)
            .cloned()
            .collect())
    }

    fn upsert_sub_metric(&mut self, entry: SubMetricEntry) -> StoreResult<()> {
        self.check_write()?;
        let key = (
            entry.department_id,
            entry.month,
            entry.parent_metric_key.clone(),
            entry.name.clone(),
        );
        self.sub_metrics.insert(key, entry);
        Ok(())
    }

    fn sub_metric_targets(
        &self,
        department_id: u64,
        year: i32,
    ) -> StoreResult<Vec<SubMetricTarget>> {
        Ok(self
            .sub_metric_targets
            .values()
            .filter(|t| t.department_id == department_id && t.year == year)
            .cloned()
            .collect())
    }

    fn upsert_sub_metric_target(&mut self, target: SubMetricTarget) -> StoreResult<()> {
        self.check_write()?;
        let key = (
            target.department_id,
            target.name.clone(),
            target.quarter,
            target.year,
        );
        self.sub_metric_targets.insert(key, target);
        Ok(())
    }

    fn attachment(&self, department_id: u64, month: Month) -> StoreResult<Option<Attachment>> {
        Ok(self.attachments.get(&(department_id, month)).cloned())
    }

    fn replace_attachment(&mut self, attachment: Attachment) -> StoreResult<()> {
        self.check_write()?;
        let key = (attachment.department_id, attachment.month);
        if let Some(old) = self.attachments.remove(&key) {
            // File cleanup only when it isn't shared with the replacement.
            if old.file_path != attachment.file_path {
                self.files.retain(|f| f != &old.file_path);
            }
        }
        if !self.files.contains(&attachment.file_path) {
            self.files.push(attachment.file_path.clone());
        }
        self.attachments.insert(key, attachment);
        Ok(())
    }

    fn forecast_entries(
        &self,
        department_id: u64,
        year: i32,
    ) -> StoreResult<Vec<ForecastEntryRow>> {
        Ok(self
            .forecast_entries
            .values()
            .filter(|e| e.department_id == department_id && e.year == year)
            .cloned()
            .collect())
    }

    fn upsert_forecast_entry(&mut self, entry: ForecastEntryRow) -> StoreResult<()> {
        self.check_write()?;
        let key = (
            entry.department_id,
            entry.year,
            entry.month,
            entry.metric_key.clone(),
        );
        self.forecast_entries.insert(key, entry);
        Ok(())
    }

    fn forecast_weights(
        &self,
        department_id: u64,
        year: i32,
    ) -> StoreResult<Vec<ForecastWeightRow>> {
        Ok(self
            .forecast_weights
            .values()
            .filter(|w| w.department_id == department_id && w.year == year)
            .cloned()
            .collect())
    }

    fn upsert_forecast_weight(&mut self, weight: ForecastWeightRow) -> StoreResult<()> {
        self.check_write()?;
        let key = (weight.department_id, weight.year, weight.month);
        self.forecast_weights.insert(key, weight);
        Ok(())
    }

    fn stored_files(&self) -> StoreResult<Vec<String>> {
        Ok(self.files.clone())
    }
}

pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_BASE_DELAY: Duration = Duration::from_millis(200);

/// Retries a storage operation on transient failures with exponential
/// backoff. Retries are safe because every write is a keyed upsert.
pub fn with_retry<T>(
    attempts: u32,
    base_delay: Duration,
    mut op: impl FnMut() -> StoreResult<T>,
) -> StoreResult<T> {
    let mut delay = base_delay;
    let mut last_err = StoreError::Terminal("no attempts made".to_string());

    for attempt in 1..=attempts.max(1) {
        match op() {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < attempts => {
                warn!(
                    "Transient storage failure (attempt {}/{}): {}; retrying in {:?}",
                    attempt, attempts, e, delay
                );
                std::thread::sleep(delay);
                delay *= 2;
                last_err = e;
            }
            Err(e) => return Err(e),
        }
    }

    Err(last_err)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn month(s: &str) -> Month {
        s.parse().unwrap()
    }

    fn entry(dept: u64, m: &str, key: &str, value: f64) -> FinancialEntry {
        FinancialEntry {
            department_id: dept,
            month: month(m),
            metric_key: key.to_string(),
            value,
            notes: None,
            created_by: 1,
        }
    }

    #[test]
    fn test_entry_round_trip_is_idempotent() {
        let mut store = MemoryStore::new();
        let e = entry(1, "2024-03", "total_sales", round_for_storage(50000.4));
        store.upsert_entry(e.clone()).unwrap();
        store.upsert_entry(e.clone()).unwrap();

        let read = store.entry(1, month("2024-03"), "total_sales").unwrap().unwrap();
        assert_eq!(read.value, 50000.0);
        assert_eq!(store.entries(1, month("2024-03")).unwrap().len(), 1);
    }

    #[test]
    fn test_upsert_overwrites_on_same_key() {
        let mut store = MemoryStore::new();
        store.upsert_entry(entry(1, "2024-03", "total_sales", 100.0)).unwrap();
        store.upsert_entry(entry(1, "2024-03", "total_sales", 200.0)).unwrap();

        let read = store.entry(1, month("2024-03"), "total_sales").unwrap().unwrap();
        assert_eq!(read.value, 200.0);
    }

    #[test]
    fn test_delete_entry() {
        let mut store = MemoryStore::new();
        store.upsert_entry(entry(1, "2024-03", "total_sales", 100.0)).unwrap();
        store.delete_entry(1, month("2024-03"), "total_sales").unwrap();
        assert!(store.entry(1, month("2024-03"), "total_sales").unwrap().is_none());
    }

    #[test]
    fn test_attachment_replacement_removes_old_file_and_row() {
        let mut store = MemoryStore::new();
        let first = Attachment {
            department_id: 1,
            month: month("2024-03"),
            file_name: "march_v1.xlsx".to_string(),
            file_path: "statements/march_v1.xlsx".to_string(),
            file_type: "xlsx".to_string(),
            file_size: 1000,
            uploaded_by: 7,
        };
        let second = Attachment {
            file_name: "march_v2.xlsx".to_string(),
            file_path: "statements/march_v2.xlsx".to_string(),
            ..first.clone()
        };

        store.replace_attachment(first).unwrap();
        store.replace_attachment(second).unwrap();

        let current = store.attachment(1, month("2024-03")).unwrap().unwrap();
        assert_eq!(current.file_name, "march_v2.xlsx");
        // Exactly one attachment and one stored file remain.
        assert_eq!(store.stored_files().unwrap(), vec!["statements/march_v2.xlsx"]);
    }

    #[test]
    fn test_propagated_attachment_shares_file_path() {
        let mut store = MemoryStore::new();
        let primary = Attachment {
            department_id: 1,
            month: month("2024-03"),
            file_name: "march.xlsx".to_string(),
            file_path: "statements/march.xlsx".to_string(),
            file_type: "xlsx".to_string(),
            file_size: 1000,
            uploaded_by: 7,
        };
        let sibling = Attachment {
            department_id: 2,
            ..primary.clone()
        };

        store.replace_attachment(primary).unwrap();
        store.replace_attachment(sibling).unwrap();

        // One shared file, two rows.
        assert_eq!(store.stored_files().unwrap().len(), 1);
        assert!(store.attachment(1, month("2024-03")).unwrap().is_some());
        assert!(store.attachment(2, month("2024-03")).unwrap().is_some());
    }

    #[test]
    fn test_with_retry_recovers_from_transient_failures() {
        let mut failures = 2;
        let result = with_retry(3, Duration::from_millis(1), || {
            if failures > 0 {
                failures -= 1;
                Err(StoreError::Transient("flaky".to_string()))
            } else {
                Ok(42)
            }
        });
        assert_eq!(result.unwrap(), 42);
    }

    #[test]
    fn test_with_retry_exhausts_on_persistent_transient() {
        let result: StoreResult<()> = with_retry(3, Duration::from_millis(1), || {
            Err(StoreError::Transient("down".to_string()))
        });
        assert!(matches!(result, Err(StoreError::Transient(_))));
    }

    #[test]
    fn test_with_retry_does_not_retry_terminal() {
        let mut calls = 0;
        let result: StoreResult<()> = with_retry(3, Duration::from_millis(1), || {
            calls += 1;
            Err(StoreError::Terminal("constraint violation".to_string()))
        });
        assert!(matches!(result, Err(StoreError::Terminal(_))));
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_fail_next_writes_is_transient() {
        let mut store = MemoryStore::new();
        store.fail_next_writes(1);
        let err = store.upsert_entry(entry(1, "2024-03", "total_sales", 1.0)).unwrap_err();
        assert!(err.is_transient());
        store.upsert_entry(entry(1, "2024-03", "total_sales", 1.0)).unwrap();
    }
}

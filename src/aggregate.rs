use crate::catalog::{MetricCatalog, TargetDirection, ValueType};
use crate::error::{FinancialOpsError, Result};
use crate::month::Month;
use crate::store::{
    round_for_storage, FinancialEntry, FinancialStore, FinancialTarget, SubMetricEntry,
    SubMetricTarget,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rollup {
    Sum,
    Average,
}

/// Color classification for a grid cell against its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VarianceLevel {
    Success,
    Warning,
    Destructive,
}

/// Unfavorable variances within this many percentage points stay Warning.
const WARNING_BAND: f64 = 10.0;

pub struct AggregationEngine<'a> {
    catalog: &'a MetricCatalog,
}

impl<'a> AggregationEngine<'a> {
    pub fn new(catalog: &'a MetricCatalog) -> Self {
        Self { catalog }
    }

    fn stored_value(entries: &[FinancialEntry], metric_key: &str, month: Month) -> Option<f64> {
        entries
            .iter()
            .find(|e| e.metric_key == metric_key && e.month == month)
            .map(|e| e.value)
    }

    fn stored_sum(entries: &[FinancialEntry], metric_key: &str, months: &[Month]) -> Option<f64> {
        let values: Vec<f64> = entries
            .iter()
            .filter(|e| e.metric_key == metric_key && months.contains(&e.month))
            .map(|e| e.value)
            .collect();
        if values.is_empty() {
            None
        } else {
            Some(values.iter().sum())
        }
    }

    /// Displayed value for one metric and month. Percentage metrics with a
    /// calculation are derived from the current numerator and denominator
    /// entries on every call; they are never read from storage.
    pub fn monthly_value(
        &self,
        entries: &[FinancialEntry],
        metric_key: &str,
        month: Month,
    ) -> Option<f64> {
        match self.catalog.get(metric_key).and_then(|m| m.calculation.as_ref()) {
            Some(calc) => {
                let numerator = Self::stored_value(entries, &calc.numerator_key, month)?;
                let denominator = Self::stored_value(entries, &calc.denominator_key, month)?;
                ratio_pct(numerator, denominator)
            }
            None => Self::stored_value(entries, metric_key, month),
        }
    }

    /// Aggregate over a set of months (a quarter or a year). Dollar and
    /// unit metrics sum or average; percentage metrics recompute the ratio
    /// from aggregated numerator and denominator totals. Averaging
    /// pre-computed monthly percentages would mis-weight uneven months.
    pub fn period_value(
        &self,
        entries: &[FinancialEntry],
        metric_key: &str,
        months: &[Month],
        rollup: Rollup,
    ) -> Option<f64> {
        match self.catalog.get(metric_key).and_then(|m| m.calculation.as_ref()) {
            Some(calc) => {
                let numerator = Self::stored_sum(entries, &calc.numerator_key, months)?;
                let denominator = Self::stored_sum(entries, &calc.denominator_key, months)?;
                ratio_pct(numerator, denominator)
            }
            None => {
                let values: Vec<f64> = entries
                    .iter()
                    .filter(|e| e.metric_key == metric_key && months.contains(&e.month))
                    .map(|e| e.value)
                    .collect();
                if values.is_empty() {
                    return None;
                }
                let sum: f64 = values.iter().sum();
                match rollup {
                    Rollup::Sum => Some(sum),
                    Rollup::Average => Some(sum / values.len() as f64),
                }
            }
        }
    }

    fn sub_sum(
        sub_entries: &[SubMetricEntry],
        parent_key: &str,
        name: &str,
        months: &[Month],
    ) -> Option<f64> {
        let values: Vec<f64> = sub_entries
            .iter()
            .filter(|s| {
                s.parent_metric_key == parent_key && s.name == name && months.contains(&s.month)
            })
            .map(|s| s.value)
            .collect();
        if values.is_empty() {
            None
        } else {
            Some(values.iter().sum())
        }
    }

    /// Sub-metric aggregate mirroring the parent rule. Under a calculated
    /// percentage parent, the sub-metric's ratio is derived from matching
    /// sub-metric names beneath the numerator and denominator parents; when
    /// the denominator parent has no matching breakdown, fall back to the
    /// denominator parent's total.
    pub fn sub_metric_period_value(
        &self,
        entries: &[FinancialEntry],
        sub_entries: &[SubMetricEntry],
        parent_metric_key: &str,
        name: &str,
        months: &[Month],
        rollup: Rollup,
    ) -> Option<f64> {
        match self
            .catalog
            .get(parent_metric_key)
            .and_then(|m| m.calculation.as_ref())
        {
            Some(calc) => {
                let numerator = Self::sub_sum(sub_entries, &calc.numerator_key, name, months)?;
                let denominator = Self::sub_sum(sub_entries, &calc.denominator_key, name, months)
                    .or_else(|| Self::stored_sum(entries, &calc.denominator_key, months))?;
                ratio_pct(numerator, denominator)
            }
            None => {
                let values: Vec<f64> = sub_entries
                    .iter()
                    .filter(|s| {
                        s.parent_metric_key == parent_metric_key
                            && s.name == name
                            && months.contains(&s.month)
                    })
                    .map(|s| s.value)
                    .collect();
                if values.is_empty() {
                    return None;
                }
                let sum: f64 = values.iter().sum();
                match rollup {
                    Rollup::Sum => Some(sum),
                    Rollup::Average => Some(sum / values.len() as f64),
                }
            }
        }
    }
}

fn ratio_pct(numerator: f64, denominator: f64) -> Option<f64> {
    if denominator == 0.0 {
        None
    } else {
        Some(numerator / denominator * 100.0)
    }
}

/// Resolves the target a value is colored against: the explicit quarterly
/// target, else a month-specific goal target, else the forecast value as a
/// last resort.
pub fn effective_target(
    quarterly_targets: &[FinancialTarget],
    metric_key: &str,
    month: Month,
    goal_target: Option<f64>,
    forecast_value: Option<f64>,
) -> Option<f64> {
    quarterly_targets
        .iter()
        .find(|t| {
            t.metric_key == metric_key && t.quarter == month.quarter() && t.year == month.year()
        })
        .map(|t| t.target_value)
        .or(goal_target)
        .or(forecast_value)
}

/// Resolves the target a sub-metric roll-up is colored against. Sub-metric
/// targets are authored independently per line-item name and quarter; the
/// parent metric's target never applies to a line item, so there is no
/// fallback chain here.
pub fn sub_metric_effective_target(
    targets: &[SubMetricTarget],
    name: &str,
    month: Month,
) -> Option<f64> {
    targets
        .iter()
        .find(|t| t.name == name && t.quarter == month.quarter() && t.year == month.year())
        .map(|t| t.target_value)
}

/// Percentage variance of a value against its target, with the raw
/// difference used for percentage-type metrics (their values already are
/// percentage points).
pub fn variance_against_target(value: f64, target: f64, value_type: ValueType) -> f64 {
    match value_type {
        ValueType::Percentage => value - target,
        _ => {
            if target == 0.0 {
                value - target
            } else {
                (value - target) / target.abs() * 100.0
            }
        }
    }
}

pub fn classify_variance(variance: f64, direction: TargetDirection) -> VarianceLevel {
    let favorable = match direction {
        TargetDirection::Above => variance >= 0.0,
        TargetDirection::Below => variance <= 0.0,
    };
    if favorable {
        VarianceLevel::Success
    } else if variance.abs() <= WARNING_BAND {
        VarianceLevel::Warning
    } else {
        VarianceLevel::Destructive
    }
}

/// Persists a direct cell edit: values are whole-rounded before storage and
/// empty input deletes the entry rather than storing a null or zero.
/// Derived percentage metrics are rejected outright. Callers buffer rapid
/// keystrokes through the debounce layer before reaching this.
pub fn apply_cell_edit(
    store: &mut dyn FinancialStore,
    catalog: &MetricCatalog,
    department_id: u64,
    month: Month,
    metric_key: &str,
    input: Option<f64>,
    actor: u64,
) -> Result<()> {
    if catalog.is_derived(metric_key) {
        return Err(FinancialOpsError::DerivedMetricWrite(metric_key.to_string()));
    }
    if catalog.get(metric_key).is_none() {
        return Err(FinancialOpsError::UnknownMetric(metric_key.to_string()));
    }

    match input {
        Some(value) => {
            store.upsert_entry(FinancialEntry {
                department_id,
                month,
                metric_key: metric_key.to_string(),
                value: round_for_storage(value),
                notes: None,
                created_by: actor,
            })?;
        }
        None => {
            store.delete_entry(department_id, month, metric_key)?;
        }
    }
    Ok(())
}

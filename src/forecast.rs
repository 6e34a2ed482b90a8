use crate::error::{FinancialOpsError, Result};
use crate::month::Month;
use crate::store::{FinancialEntry, FinancialStore, ForecastEntryRow, ForecastWeightRow};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const SALES_KEY: &str = "total_sales";
pub const GROSS_PROFIT_KEY: &str = "gross_profit";
pub const SALES_EXPENSE_KEY: &str = "sales_expense";
pub const FIXED_EXPENSE_KEY: &str = "fixed_expense";
pub const DEPARTMENT_PROFIT_KEY: &str = "department_profit";

/// How the annual change is spread across months. System-calculated from
/// prior-year seasonality unless a month is manually overridden and locked;
/// locked months are left alone by recalculation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForecastWeights {
    weights: [f64; 12],
    locked: [bool; 12],
}

impl ForecastWeights {
    pub fn flat() -> Self {
        Self {
            weights: [1.0 / 12.0; 12],
            locked: [false; 12],
        }
    }

    /// Derives monthly weights from prior-year sales seasonality. A year
    /// with no sales data falls back to a flat distribution.
    pub fn from_prior_year_sales(monthly_sales: &[f64; 12]) -> Self {
        let total: f64 = monthly_sales.iter().sum();
        if total == 0.0 {
            return Self::flat();
        }
        let mut weights = [0.0; 12];
        for (i, sales) in monthly_sales.iter().enumerate() {
            weights[i] = sales / total;
        }
        Self {
            weights,
            locked: [false; 12],
        }
    }

    pub fn from_rows(rows: &[ForecastWeightRow]) -> Result<Self> {
        let mut weights = Self::flat();
        for row in rows {
            if !(1..=12).contains(&row.month) {
                return Err(FinancialOpsError::InvalidForecastWeights(format!(
                    "month {} out of range",
                    row.month
                )));
            }
            weights.weights[(row.month - 1) as usize] = row.weight;
            weights.locked[(row.month - 1) as usize] = row.locked;
        }
        Ok(weights)
    }

    /// Manual override. Locking is what freezes the month against system
    /// recalculation.
    pub fn set(&mut self, month: u32, weight: f64, locked: bool) -> Result<()> {
        if !(1..=12).contains(&month) {
            return Err(FinancialOpsError::InvalidForecastWeights(format!(
                "month {} out of range",
                month
            )));
        }
        if weight < 0.0 {
            return Err(FinancialOpsError::InvalidForecastWeights(format!(
                "weight {} must be non-negative",
                weight
            )));
        }
        self.weights[(month - 1) as usize] = weight;
        self.locked[(month - 1) as usize] = locked;
        Ok(())
    }

    /// Recalculates unlocked months from prior-year seasonality, leaving
    /// locked overrides untouched.
    pub fn recalculate_unlocked(&mut self, monthly_sales: &[f64; 12]) {
        let system = Self::from_prior_year_sales(monthly_sales);
        for i in 0..12 {
            if !self.locked[i] {
                self.weights[i] = system.weights[i];
            }
        }
    }

    pub fn is_locked(&self, month: u32) -> bool {
        self.locked[(month - 1) as usize]
    }

    pub fn raw(&self, month: u32) -> f64 {
        self.weights[(month - 1) as usize]
    }

    /// Normalized fractions summing to 1.0. Stored weights are left as
    /// authored (the sum-to-one invariant is assumed, not enforced); the
    /// distribution math normalizes on the way in so it stays stable.
    pub fn fractions(&self) -> [f64; 12] {
        let total: f64 = self.weights.iter().sum();
        if total == 0.0 {
            return [1.0 / 12.0; 12];
        }
        let mut fractions = [0.0; 12];
        for i in 0..12 {
            fractions[i] = self.weights[i] / total;
        }
        fractions
    }

    pub fn to_rows(&self, department_id: u64, year: i32) -> Vec<ForecastWeightRow> {
        (0..12)
            .map(|i| ForecastWeightRow {
                department_id,
                year,
                month: i as u32 + 1,
                weight: self.weights[i],
                locked: self.locked[i],
            })
            .collect()
    }
}

/// Scalar growth and margin drivers, each initialized from the prior year's
/// realized ratios.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ForecastDrivers {
    /// Year-over-year sales growth, as a fraction (0.05 = +5%).
    pub sales_growth: f64,
    /// Gross profit as a fraction of projected sales.
    pub gross_profit_ratio: f64,
    /// Sales expense as a fraction of gross profit.
    pub sales_expense_ratio: f64,
    /// Annual fixed expense dollars, distributed by weight.
    pub fixed_expense_annual: f64,
}

impl ForecastDrivers {
    pub fn from_prior_year(baseline: &BaselineYear) -> Self {
        let sales = baseline.annual_total(SALES_KEY);
        let gross = baseline.annual_total(GROSS_PROFIT_KEY);
        let sales_expense = baseline.annual_total(SALES_EXPENSE_KEY);
        Self {
            sales_growth: 0.0,
            gross_profit_ratio: if sales == 0.0 { 0.0 } else { gross / sales },
            sales_expense_ratio: if gross == 0.0 { 0.0 } else { sales_expense / gross },
            fixed_expense_annual: baseline.annual_total(FIXED_EXPENSE_KEY),
        }
    }
}

/// Prior-year entry values arranged per metric and month, the comparison
/// baseline for every projected cell.
#[derive(Debug, Clone, Default)]
pub struct BaselineYear {
    values: BTreeMap<String, [f64; 12]>,
}

impl BaselineYear {
    pub fn from_entries(entries: &[FinancialEntry], year: i32) -> Self {
        let mut values: BTreeMap<String, [f64; 12]> = BTreeMap::new();
        for entry in entries {
            if entry.month.year() != year {
                continue;
            }
            let slot = values.entry(entry.metric_key.clone()).or_insert([0.0; 12]);
            slot[(entry.month.month() - 1) as usize] = entry.value;
        }
        Self { values }
    }

    pub fn monthly(&self, metric_key: &str) -> [f64; 12] {
        self.values.get(metric_key).copied().unwrap_or([0.0; 12])
    }

    pub fn value(&self, metric_key: &str, month: u32) -> f64 {
        self.monthly(metric_key)[(month - 1) as usize]
    }

    pub fn annual_total(&self, metric_key: &str) -> f64 {
        self.monthly(metric_key).iter().sum()
    }
}

/// Produces the full-year projection. Entries already marked locked keep
/// their value and are excluded from recomputation; everything else
/// re-flows from the drivers and weights.
pub fn project_year(
    department_id: u64,
    forecast_year: i32,
    baseline: &BaselineYear,
    weights: &ForecastWeights,
    drivers: &ForecastDrivers,
    existing: &[ForecastEntryRow],
) -> Vec<ForecastEntryRow> {
    let fractions = weights.fractions();
    let projected_annual_sales = baseline.annual_total(SALES_KEY) * (1.0 + drivers.sales_growth);

    let locked: BTreeMap<(u32, &str), f64> = existing
        .iter()
        .filter(|e| e.locked)
        .map(|e| ((e.month, e.metric_key.as_str()), e.value))
        .collect();

    let mut rows = Vec::with_capacity(12 * 5);
    for month in 1..=12u32 {
        let fraction = fractions[(month - 1) as usize];

        let sales = projected_annual_sales * fraction;
        let sales = locked.get(&(month, SALES_KEY)).copied().unwrap_or(sales);

        let gross = sales * drivers.gross_profit_ratio;
        let gross = locked
            .get(&(month, GROSS_PROFIT_KEY))
            .copied()
            .unwrap_or(gross);

        let sales_expense = gross * drivers.sales_expense_ratio;
        let sales_expense = locked
            .get(&(month, SALES_EXPENSE_KEY))
            .copied()
            .unwrap_or(sales_expense);

        let fixed = drivers.fixed_expense_annual * fraction;
        let fixed = locked
            .get(&(month, FIXED_EXPENSE_KEY))
            .copied()
            .unwrap_or(fixed);

        // Department profit follows the same component relationships as the
        // aggregation grid.
        let profit = gross - sales_expense - fixed;
        let profit = locked
            .get(&(month, DEPARTMENT_PROFIT_KEY))
            .copied()
            .unwrap_or(profit);

        for (metric_key, value) in [
            (SALES_KEY, sales),
            (GROSS_PROFIT_KEY, gross),
            (SALES_EXPENSE_KEY, sales_expense),
            (FIXED_EXPENSE_KEY, fixed),
            (DEPARTMENT_PROFIT_KEY, profit),
        ] {
            rows.push(ForecastEntryRow {
                department_id,
                year: forecast_year,
                month,
                metric_key: metric_key.to_string(),
                value,
                baseline: baseline.value(metric_key, month),
                locked: locked.contains_key(&(month, metric_key)),
            });
        }
    }
    rows
}

/// Spreads a quarter-level edit back across the quarter's three months,
/// proportionally to their existing weights (the inverse of aggregation).
pub fn distribute_quarter_edit(
    quarter: u32,
    entered_value: f64,
    weights: &ForecastWeights,
) -> Result<[(u32, f64); 3]> {
    if !(1..=4).contains(&quarter) {
        return Err(FinancialOpsError::InvalidForecastWeights(format!(
            "quarter {} out of range",
            quarter
        )));
    }
    let first = (quarter - 1) * 3 + 1;
    let months = [first, first + 1, first + 2];
    let quarter_weight: f64 = months.iter().map(|m| weights.raw(*m)).sum();

    let mut out = [(0u32, 0.0f64); 3];
    for (i, m) in months.iter().enumerate() {
        let share = if quarter_weight == 0.0 {
            1.0 / 3.0
        } else {
            weights.raw(*m) / quarter_weight
        };
        out[i] = (*m, entered_value * share);
    }
    Ok(out)
}

/// Re-projects after a driver or weight change and bulk-persists every
/// non-locked value. Driver edits are buffered through the debounce layer
/// before reaching this.
pub fn recompute_and_persist(
    store: &mut dyn FinancialStore,
    department_id: u64,
    forecast_year: i32,
    weights: &ForecastWeights,
    drivers: &ForecastDrivers,
) -> Result<Vec<ForecastEntryRow>> {
    let prior_start = Month::new(forecast_year - 1, 1)?;
    let prior_months = prior_start.year_months();
    let mut prior_entries = Vec::new();
    for m in prior_months {
        prior_entries.extend(store.entries(department_id, m)?);
    }
    let baseline = BaselineYear::from_entries(&prior_entries, forecast_year - 1);

    let existing = store.forecast_entries(department_id, forecast_year)?;
    let rows = project_year(
        department_id,
        forecast_year,
        &baseline,
        weights,
        drivers,
        &existing,
    );

    let mut persisted = 0;
    for row in &rows {
        if row.locked {
            continue;
        }
        store.upsert_forecast_entry(row.clone())?;
        persisted += 1;
    }
    for weight_row in weights.to_rows(department_id, forecast_year) {
        store.upsert_forecast_weight(weight_row)?;
    }

    debug!(
        "Recomputed forecast {} for department {}: {} rows persisted",
        forecast_year, department_id, persisted
    );
    info!(
        "Forecast {} department {}: projected annual sales {:.0}",
        forecast_year,
        department_id,
        baseline.annual_total(SALES_KEY) * (1.0 + drivers.sales_growth)
    );
    Ok(rows)
}

/// Flips the lock on one forecast cell. Locking freezes the cell; the next
/// recomputation flows around it.
pub fn set_entry_lock(
    store: &mut dyn FinancialStore,
    department_id: u64,
    forecast_year: i32,
    month: u32,
    metric_key: &str,
    locked: bool,
) -> Result<()> {
    let existing = store.forecast_entries(department_id, forecast_year)?;
    let Some(row) = existing
        .into_iter()
        .find(|e| e.month == month && e.metric_key == metric_key)
    else {
        return Ok(());
    };
    store.upsert_forecast_entry(ForecastEntryRow { locked, ..row })?;
    Ok(())
}

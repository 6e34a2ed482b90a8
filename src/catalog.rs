use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "PascalCase")]
pub enum ValueType {
    #[schemars(description = "A dollar amount. Aggregates by sum or average.")]
    Dollar,

    #[schemars(
        description = "A percentage. When a calculation is defined, the value is always derived from the numerator and denominator metrics and never stored."
    )]
    Percentage,

    #[schemars(description = "A unit count (vehicles sold, repair orders). Aggregates by sum or average.")]
    Unit,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "PascalCase")]
pub enum TargetDirection {
    #[schemars(description = "Higher values are favorable (sales, gross profit).")]
    Above,

    #[schemars(description = "Lower values are favorable (expenses, expense ratios).")]
    Below,
}

/// Numerator/denominator pair for a derived percentage metric.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
pub struct Calculation {
    #[schemars(description = "Metric key of the numerator (a dollar metric).")]
    pub numerator_key: String,

    #[schemars(description = "Metric key of the denominator (a dollar metric).")]
    pub denominator_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct MetricDefinition {
    #[schemars(description = "Stable identifier used as the storage key (e.g. 'total_sales').")]
    pub key: String,

    #[schemars(description = "Display name shown in grids (e.g. 'Total Sales').")]
    pub display_name: String,

    #[schemars(description = "Short explanation of what the metric measures.")]
    pub description: String,

    pub value_type: ValueType,

    pub target_direction: TargetDirection,

    #[serde(default)]
    #[schemars(
        description = "For percentage metrics, the dollar metrics the value is derived from. Metrics with a calculation are never edited or stored directly."
    )]
    pub calculation: Option<Calculation>,
}

/// Registry of metric definitions. Built once at startup and passed into the
/// engines that need it; catalog entries are immutable at runtime.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct MetricCatalog {
    metrics: Vec<MetricDefinition>,
}

impl MetricCatalog {
    pub fn new(metrics: Vec<MetricDefinition>) -> Self {
        Self { metrics }
    }

    /// The standard dealership department metric set.
    pub fn standard() -> Self {
        let dollar = |key: &str, name: &str, desc: &str, dir: TargetDirection| MetricDefinition {
            key: key.to_string(),
            display_name: name.to_string(),
            description: desc.to_string(),
            value_type: ValueType::Dollar,
            target_direction: dir,
            calculation: None,
        };
        let pct = |key: &str, name: &str, desc: &str, dir: TargetDirection, num: &str, den: &str| {
            MetricDefinition {
                key: key.to_string(),
                display_name: name.to_string(),
                description: desc.to_string(),
                value_type: ValueType::Percentage,
                target_direction: dir,
                calculation: Some(Calculation {
                    numerator_key: num.to_string(),
                    denominator_key: den.to_string(),
                }),
            }
        };

        Self::new(vec![
            dollar(
                "total_sales",
                "Total Sales",
                "Total department sales for the month",
                TargetDirection::Above,
            ),
            dollar(
                "gross_profit",
                "Gross Profit",
                "Sales less cost of sales",
                TargetDirection::Above,
            ),
            dollar(
                "sales_expense",
                "Sales Expense",
                "Variable selling expense",
                TargetDirection::Below,
            ),
            dollar(
                "fixed_expense",
                "Fixed Expense",
                "Fixed overhead allocated to the department",
                TargetDirection::Below,
            ),
            dollar(
                "department_profit",
                "Department Profit",
                "Gross profit less sales and fixed expense",
                TargetDirection::Above,
            ),
            MetricDefinition {
                key: "units_sold".to_string(),
                display_name: "Units Sold".to_string(),
                description: "Vehicles or repair orders closed in the month".to_string(),
                value_type: ValueType::Unit,
                target_direction: TargetDirection::Above,
                calculation: None,
            },
            pct(
                "gross_profit_pct",
                "Gross Profit %",
                "Gross profit as a share of total sales",
                TargetDirection::Above,
                "gross_profit",
                "total_sales",
            ),
            pct(
                "sales_expense_pct",
                "Sales Expense %",
                "Sales expense as a share of gross profit",
                TargetDirection::Below,
                "sales_expense",
                "gross_profit",
            ),
            pct(
                "profit_margin_pct",
                "Profit Margin %",
                "Department profit as a share of total sales",
                TargetDirection::Above,
                "department_profit",
                "total_sales",
            ),
        ])
    }

    pub fn get(&self, key: &str) -> Option<&MetricDefinition> {
        self.metrics.iter().find(|m| m.key == key)
    }

    /// Metrics in definition order, which is also grid display order.
    pub fn iter(&self) -> impl Iterator<Item = &MetricDefinition> {
        self.metrics.iter()
    }

    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }

    /// True when the metric's value is always computed from a calculation
    /// pair. Derived metrics are rejected by the storage boundary.
    pub fn is_derived(&self, key: &str) -> bool {
        self.get(key).is_some_and(|m| m.calculation.is_some())
    }

    pub fn schema_as_json() -> Result<String, serde_json::Error> {
        let schema = schemars::schema_for!(MetricCatalog);
        serde_json::to_string_pretty(&schema)
    }
}

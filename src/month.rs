use crate::error::{FinancialOpsError, Result};
use chrono::{Datelike, Days, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A calendar month identified as "YYYY-MM". Entries, attachments and
/// validation results are all keyed by this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Month {
    year: i32,
    month: u32,
}

impl Month {
    pub fn new(year: i32, month: u32) -> Result<Self> {
        if !(1..=12).contains(&month) {
            return Err(FinancialOpsError::InvalidMonth(format!(
                "{:04}-{:02}",
                year, month
            )));
        }
        Ok(Self { year, month })
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn month(&self) -> u32 {
        self.month
    }

    /// Calendar quarter, 1 through 4.
    pub fn quarter(&self) -> u32 {
        (self.month - 1) / 3 + 1
    }

    /// The three months making up this month's quarter.
    pub fn quarter_months(&self) -> [Month; 3] {
        let first = (self.quarter() - 1) * 3 + 1;
        [
            Month {
                year: self.year,
                month: first,
            },
            Month {
                year: self.year,
                month: first + 1,
            },
            Month {
                year: self.year,
                month: first + 2,
            },
        ]
    }

    /// All twelve months of this month's calendar year.
    pub fn year_months(&self) -> Vec<Month> {
        (1..=12)
            .map(|m| Month {
                year: self.year,
                month: m,
            })
            .collect()
    }

    pub fn next(&self) -> Month {
        if self.month == 12 {
            Month {
                year: self.year + 1,
                month: 1,
            }
        } else {
            Month {
                year: self.year,
                month: self.month + 1,
            }
        }
    }

    pub fn prev(&self) -> Month {
        if self.month == 1 {
            Month {
                year: self.year - 1,
                month: 12,
            }
        } else {
            Month {
                year: self.year,
                month: self.month - 1,
            }
        }
    }

    /// Same month one year earlier. Used as the forecast baseline.
    pub fn prior_year(&self) -> Month {
        Month {
            year: self.year - 1,
            month: self.month,
        }
    }

    pub fn first_day(&self) -> NaiveDate {
        NaiveDate::from_ymd_opt(self.year, self.month, 1)
            .unwrap_or(NaiveDate::from_ymd_opt(self.year, 1, 1).unwrap_or_default())
    }

    pub fn last_day(&self) -> NaiveDate {
        last_day_of_month(self.year, self.month)
    }
}

impl fmt::Display for Month {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl FromStr for Month {
    type Err = FinancialOpsError;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.trim().splitn(2, '-');
        let year = parts
            .next()
            .and_then(|p| p.parse::<i32>().ok())
            .ok_or_else(|| FinancialOpsError::InvalidMonth(s.to_string()))?;
        let month = parts
            .next()
            .and_then(|p| p.parse::<u32>().ok())
            .ok_or_else(|| FinancialOpsError::InvalidMonth(s.to_string()))?;
        Month::new(year, month)
    }
}

impl TryFrom<String> for Month {
    type Error = FinancialOpsError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<Month> for String {
    fn from(m: Month) -> String {
        m.to_string()
    }
}

pub fn last_day_of_month(year: i32, month: u32) -> NaiveDate {
    let next_month = if month == 12 { 1 } else { month + 1 };
    let next_year = if month == 12 { year + 1 } else { year };

    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .and_then(|d| d.checked_sub_days(Days::new(1)))
        .unwrap_or_default()
}

pub fn months_between(start: Month, end: Month) -> i32 {
    let year_diff = end.year() - start.year();
    let month_diff = end.month() as i32 - start.month() as i32;
    year_diff * 12 + month_diff
}

/// Parses a period string in the format "YYYY-MM" or "YYYY-MM:YYYY-MM"
/// into an inclusive month range.
pub fn parse_period_string(period: &str) -> Result<(Month, Month)> {
    let parts: Vec<&str> = period.split(':').collect();

    match parts.len() {
        1 => {
            let m: Month = parts[0].parse()?;
            Ok((m, m))
        }
        2 => {
            let start: Month = parts[0].parse()?;
            let end: Month = parts[1].parse()?;
            if end < start {
                return Err(FinancialOpsError::InvalidMonth(format!(
                    "period '{}' ends before it starts",
                    period
                )));
            }
            Ok((start, end))
        }
        _ => Err(FinancialOpsError::InvalidMonth(format!(
            "Invalid period format: {}. Expected 'YYYY-MM' or 'YYYY-MM:YYYY-MM'",
            period
        ))),
    }
}

pub fn months_in_range(start: Month, end: Month) -> Vec<Month> {
    let mut months = Vec::new();
    let mut current = start;
    while current <= end {
        months.push(current);
        current = current.next();
    }
    months
}

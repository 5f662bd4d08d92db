use crate::ContractError;
use chrono::{Datelike, NaiveDate};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

/// Identifies one independent time series: a brand sold in a state.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SeriesKey {
    pub brand: String,
    pub state: String,
}

impl SeriesKey {
    pub fn new(brand: impl Into<String>, state: impl Into<String>) -> Self {
        Self {
            brand: brand.into(),
            state: state.into(),
        }
    }
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.brand, self.state)
    }
}

/// A calendar year-month bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Period {
    pub year: i32,
    pub month: u32,
}

impl Period {
    pub fn new(year: i32, month: u32) -> Result<Self, ContractError> {
        if !(1..=12).contains(&month) || NaiveDate::from_ymd_opt(year, month, 1).is_none() {
            return Err(ContractError::InvalidPeriod(format!("{year:04}-{month:02}")));
        }
        Ok(Self { year, month })
    }

    /// Accepts `YYYY-MM`, `YYYY-MM-DD`, `YYYY/MM` and `YYYYMM`. The day, when
    /// present, must still be a real calendar day but is otherwise ignored.
    pub fn parse(token: &str) -> Result<Self, ContractError> {
        let trimmed = token.trim();
        let captures = period_patterns()
            .iter()
            .find_map(|pattern| pattern.captures(trimmed))
            .ok_or_else(|| ContractError::InvalidPeriod(token.to_string()))?;

        let year = captures["year"]
            .parse::<i32>()
            .map_err(|_| ContractError::InvalidPeriod(token.to_string()))?;
        let month = captures["month"]
            .parse::<u32>()
            .map_err(|_| ContractError::InvalidPeriod(token.to_string()))?;
        let period =
            Self::new(year, month).map_err(|_| ContractError::InvalidPeriod(token.to_string()))?;

        if let Some(day) = captures.name("day") {
            let day = day
                .as_str()
                .parse::<u32>()
                .map_err(|_| ContractError::InvalidPeriod(token.to_string()))?;
            if NaiveDate::from_ymd_opt(year, month, day).is_none() {
                return Err(ContractError::InvalidPeriod(token.to_string()));
            }
        }

        Ok(period)
    }

    pub fn first_day(&self) -> NaiveDate {
        NaiveDate::from_ymd_opt(self.year, self.month, 1).unwrap_or(NaiveDate::MIN)
    }

    pub fn quarter(&self) -> u32 {
        (self.month - 1) / 3 + 1
    }

    pub fn from_date(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
        }
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl FromStr for Period {
    type Err = ContractError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        Self::parse(input)
    }
}

/// One pattern per accepted shape; separators never mix.
fn period_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"^(?P<year>\d{4})-(?P<month>\d{2})(?:-(?P<day>\d{2}))?$",
            r"^(?P<year>\d{4})/(?P<month>\d{2})$",
            r"^(?P<year>\d{4})(?P<month>\d{2})$",
        ]
        .into_iter()
        .map(|pattern| Regex::new(pattern).expect("valid regex"))
        .collect()
    })
}

/// One cleaned sales record as handed over by the cleaning stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub brand: String,
    pub state: String,
    pub period: String,
    pub value: f64,
    #[serde(default)]
    pub source_batch: String,
}

impl Observation {
    pub fn new(
        brand: impl Into<String>,
        state: impl Into<String>,
        period: impl Into<String>,
        value: f64,
        source_batch: impl Into<String>,
    ) -> Self {
        Self {
            brand: brand.into(),
            state: state.into(),
            period: period.into(),
            value,
            source_batch: source_batch.into(),
        }
    }

    pub fn series_key(&self) -> SeriesKey {
        SeriesKey::new(self.brand.trim(), self.state.trim())
    }

    /// Checks the record and returns its parsed period.
    pub fn validate(&self) -> Result<Period, ContractError> {
        if self.brand.trim().is_empty() {
            return Err(ContractError::InvalidObservation {
                field: "brand",
                reason: "empty".to_string(),
            });
        }
        if self.state.trim().is_empty() {
            return Err(ContractError::InvalidObservation {
                field: "state",
                reason: "empty".to_string(),
            });
        }
        if !self.value.is_finite() {
            return Err(ContractError::InvalidObservation {
                field: "value",
                reason: format!("not finite: {}", self.value),
            });
        }
        Period::parse(&self.period)
    }
}

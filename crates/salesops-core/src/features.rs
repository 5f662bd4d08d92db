use crate::sales_contracts::{Observation, Period, SeriesKey};
use crate::ContractError;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, VecDeque};

/// Number of strictly preceding periods a series needs before it yields a row.
pub const LAG_DEPTH: usize = 3;

/// One model-ready row for a (series, period) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRow {
    pub brand: String,
    pub state: String,
    pub period_date: NaiveDate,
    pub year: i32,
    pub month: u32,
    pub quarter: u32,
    pub y: f64,
    pub lag_1: f64,
    pub lag_2: f64,
    pub lag_3: f64,
    pub rolling_avg_3: f64,
    pub observation_count: u32,
}

impl FeatureRow {
    pub fn series_key(&self) -> SeriesKey {
        SeriesKey::new(self.brand.clone(), self.state.clone())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExcludedObservation {
    pub index: usize,
    pub error: ContractError,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct FeatureDerivation {
    pub rows: Vec<FeatureRow>,
    pub groups: usize,
    pub series: usize,
    pub excluded: Vec<ExcludedObservation>,
}

impl FeatureDerivation {
    pub fn target_values(&self) -> Vec<f64> {
        self.rows.iter().map(|row| row.y).collect()
    }

    pub fn fingerprint(&self) -> String {
        fingerprint_rows(&self.rows)
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct PeriodGroup {
    total: f64,
    count: u32,
}

/// Trailing window of the last `LAG_DEPTH` values, newest first, with a
/// running sum so the rolling average never re-scans the window.
#[derive(Debug, Default)]
struct LagBuffer {
    values: VecDeque<f64>,
    sum: f64,
}

impl LagBuffer {
    fn is_full(&self) -> bool {
        self.values.len() == LAG_DEPTH
    }

    fn push(&mut self, value: f64) {
        if self.is_full() {
            if let Some(evicted) = self.values.pop_back() {
                self.sum -= evicted;
            }
        }
        self.values.push_front(value);
        self.sum += value;
    }

    fn lag(&self, offset: usize) -> f64 {
        self.values[offset - 1]
    }

    fn mean(&self) -> f64 {
        self.sum / LAG_DEPTH as f64
    }
}

/// Full recompute of the feature table from the current observation set.
///
/// Observations sharing a (series, period) are summed. Each series is walked
/// in ascending period order; a row is emitted only once three earlier
/// periods exist, so the first three periods of every series are dropped.
/// Lags are positional over observed periods, not calendar offsets, which
/// keeps irregular calendars with gaps well defined. Output is ordered by
/// series key and then period date.
pub fn derive_features(observations: &[Observation]) -> FeatureDerivation {
    let mut derivation = FeatureDerivation::default();
    let mut grouped = BTreeMap::<SeriesKey, BTreeMap<Period, PeriodGroup>>::new();

    for (index, observation) in observations.iter().enumerate() {
        let period = match observation.validate() {
            Ok(period) => period,
            Err(error) => {
                derivation.excluded.push(ExcludedObservation { index, error });
                continue;
            }
        };
        let group = grouped
            .entry(observation.series_key())
            .or_default()
            .entry(period)
            .or_default();
        group.total += observation.value;
        group.count += 1;
    }

    derivation.series = grouped.len();
    for (series, periods) in &grouped {
        derivation.groups += periods.len();
        let mut lags = LagBuffer::default();

        for (period, group) in periods {
            if lags.is_full() {
                derivation.rows.push(FeatureRow {
                    brand: series.brand.clone(),
                    state: series.state.clone(),
                    period_date: period.first_day(),
                    year: period.year,
                    month: period.month,
                    quarter: period.quarter(),
                    y: group.total,
                    lag_1: lags.lag(1),
                    lag_2: lags.lag(2),
                    lag_3: lags.lag(3),
                    rolling_avg_3: lags.mean(),
                    observation_count: group.count,
                });
            }
            lags.push(group.total);
        }
    }

    derivation
}

pub fn fingerprint_rows(rows: &[FeatureRow]) -> String {
    let mut hasher = Sha256::new();
    for row in rows {
        hasher.update(
            format!(
                "{}|{}|{}|{}|{}|{}|{}|{}|{}\n",
                row.brand,
                row.state,
                row.period_date,
                row.y,
                row.lag_1,
                row.lag_2,
                row.lag_3,
                row.rolling_avg_3,
                row.observation_count
            )
            .as_bytes(),
        );
    }
    hasher
        .finalize()
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

use std::collections::BTreeSet;
use std::io::Read;
use std::path::Path;

use serde::Deserialize;
use tracing::{info, warn};

use super::error::{SimError, SimResult};
use super::types::ReturnRecord;

/// First year with real international equity data; earlier rows reuse the
/// US stock return.
pub const INTL_PROXY_BEFORE: i32 = 1970;

#[derive(Debug, Deserialize)]
struct CsvRow {
    #[serde(rename = "Year")]
    year: i32,
    #[serde(rename = "US Stock")]
    us_stock: Option<f64>,
    #[serde(rename = "International Stock")]
    intl_stock: Option<f64>,
    #[serde(rename = "US Bond")]
    us_bond: Option<f64>,
    #[serde(rename = "US Inflation")]
    inflation: Option<f64>,
}

impl CsvRow {
    fn into_record(self) -> Option<ReturnRecord> {
        let us_stock = self.us_stock?;
        let intl_stock = match self.intl_stock {
            Some(v) => v,
            None if self.year < INTL_PROXY_BEFORE => us_stock,
            None => return None,
        };
        Some(ReturnRecord {
            year: self.year,
            us_stock_return: us_stock,
            intl_stock_return: intl_stock,
            us_bond_return: self.us_bond?,
            inflation_rate: self.inflation?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct HistoricalReturns {
    records: Vec<ReturnRecord>,
}

impl HistoricalReturns {
    pub fn from_records(mut records: Vec<ReturnRecord>) -> SimResult<Self> {
        let before = records.len();
        records.retain(|r| {
            let ok = [
                r.us_stock_return,
                r.intl_stock_return,
                r.us_bond_return,
                r.inflation_rate,
            ]
            .iter()
            .all(|v| v.is_finite());
            if !ok {
                warn!(year = r.year, "dropping row with non-finite values");
            }
            ok
        });

        // Stable sort keeps the first occurrence of a duplicated year first.
        records.sort_by_key(|r| r.year);
        let mut seen = BTreeSet::new();
        records.retain(|r| {
            let first = seen.insert(r.year);
            if !first {
                warn!(year = r.year, "duplicate year, keeping first record");
            }
            first
        });

        if records.is_empty() {
            return Err(SimError::Data(format!(
                "no valid rows ({before} read before cleaning)"
            )));
        }
        for pair in records.windows(2) {
            if pair[1].year != pair[0].year + 1 {
                return Err(SimError::Data(format!(
                    "history must be contiguous, gap between {} and {}",
                    pair[0].year, pair[1].year
                )));
            }
        }

        Ok(Self { records })
    }

    pub fn from_csv_reader<R: Read>(reader: R) -> SimResult<Self> {
        let mut rdr = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
        let mut records = Vec::new();
        for row in rdr.deserialize::<CsvRow>() {
            let row = row?;
            let year = row.year;
            match row.into_record() {
                Some(record) => records.push(record),
                None => warn!(year, "dropping row with missing values"),
            }
        }
        Self::from_records(records)
    }

    pub fn from_csv_path(path: &Path) -> SimResult<Self> {
        let file = std::fs::File::open(path)?;
        let history = Self::from_csv_reader(file)?;
        info!(
            path = %path.display(),
            first_year = history.first_year(),
            last_year = history.last_year(),
            "loaded historical returns"
        );
        Ok(history)
    }

    pub fn records(&self) -> &[ReturnRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn first_year(&self) -> i32 {
        self.records[0].year
    }

    pub fn last_year(&self) -> i32 {
        self.records[self.records.len() - 1].year
    }

    pub fn index_of(&self, year: i32) -> Option<usize> {
        if year < self.first_year() || year > self.last_year() {
            return None;
        }
        Some((year - self.first_year()) as usize)
    }

    pub fn span_from(&self, year: i32) -> Option<usize> {
        self.index_of(year).map(|idx| self.records.len() - idx)
    }

    pub fn slice_from(&self, year: i32) -> &[ReturnRecord] {
        match self.index_of(year) {
            Some(idx) => &self.records[idx..],
            None => &[],
        }
    }
}

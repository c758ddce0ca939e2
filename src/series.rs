//! Joint time-indexed price table: calendar alignment, reference-driven row
//! filtering, gap filling, and the normalize / daily-returns transforms.

use chrono::{Days, NaiveDate};
use std::collections::HashMap;
use std::fmt::Write as _;

use crate::quotes::PriceSeries;

/// A table indexed by a continuous calendar date range, one column per
/// joined series (plus `<code>_V` volume columns when requested). Cells are
/// `None` until a join supplies a value; fills run column-wise afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct PriceTable {
    dates: Vec<NaiveDate>,
    columns: Vec<String>,
    /// Row-major, `cells[row][col]`, aligned with `dates` and `columns`.
    cells: Vec<Vec<Option<f64>>>,
}

impl PriceTable {
    /// An empty table over every calendar day in `[dfrom, dto]`.
    pub fn new(dfrom: NaiveDate, dto: NaiveDate) -> Self {
        let mut dates = Vec::new();
        let mut date = dfrom;
        while date <= dto {
            dates.push(date);
            date = date + Days::new(1);
        }
        let cells = vec![Vec::new(); dates.len()];
        Self {
            dates,
            columns: Vec::new(),
            cells,
        }
    }

    pub fn n_rows(&self) -> usize {
        self.dates.len()
    }

    pub fn n_cols(&self) -> usize {
        self.columns.len()
    }

    pub fn dates(&self) -> &[NaiveDate] {
        &self.dates
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn value(&self, row: usize, col: usize) -> Option<f64> {
        self.cells[row][col]
    }

    /// Left-joins one security's series onto the date index. Dates outside
    /// the index are dropped; index dates absent from the series stay None.
    pub fn join(&mut self, series: &PriceSeries) {
        let by_date: HashMap<NaiveDate, (f64, Option<f64>)> = series
            .rows
            .iter()
            .map(|(date, price, volume)| (*date, (*price, *volume)))
            .collect();

        self.columns.push(series.code.clone());
        if series.has_volume {
            self.columns.push(format!("{}_V", series.code));
        }
        for (row, date) in self.dates.iter().enumerate() {
            let found = by_date.get(date);
            self.cells[row].push(found.map(|(price, _)| *price));
            if series.has_volume {
                self.cells[row].push(found.and_then(|(_, volume)| *volume));
            }
        }
    }

    /// Drops every row whose value in `col` is missing. Returns false when
    /// the column does not exist (nothing is dropped).
    pub fn drop_missing_in(&mut self, col: &str) -> bool {
        let Some(index) = self.column_index(col) else {
            return false;
        };
        self.retain_rows(|cells| cells[index].is_some());
        true
    }

    /// Drops every row with any missing value.
    pub fn drop_missing_any(&mut self) {
        self.retain_rows(|cells| cells.iter().all(|v| v.is_some()));
    }

    fn retain_rows(&mut self, keep: impl Fn(&[Option<f64>]) -> bool) {
        let mut kept_dates = Vec::with_capacity(self.dates.len());
        let mut kept_cells = Vec::with_capacity(self.cells.len());
        for (date, cells) in self.dates.iter().zip(self.cells.iter()) {
            if keep(cells) {
                kept_dates.push(*date);
                kept_cells.push(cells.clone());
            }
        }
        self.dates = kept_dates;
        self.cells = kept_cells;
    }

    /// Forward-fill: each missing cell takes the last seen value above it.
    /// Must run before `fill_backward` so that backward-fill only patches a
    /// true leading gap.
    pub fn fill_forward(&mut self) {
        for col in 0..self.columns.len() {
            let mut last = None;
            for row in 0..self.dates.len() {
                match self.cells[row][col] {
                    Some(v) => last = Some(v),
                    None => self.cells[row][col] = last,
                }
            }
        }
    }

    /// Backward-fill: each still-missing cell takes the next value below it.
    pub fn fill_backward(&mut self) {
        for col in 0..self.columns.len() {
            let mut next = None;
            for row in (0..self.dates.len()).rev() {
                match self.cells[row][col] {
                    Some(v) => next = Some(v),
                    None => self.cells[row][col] = next,
                }
            }
        }
    }

    /// Rescales every column to a base of 1.0 at the first row. Operates on
    /// a copy; a missing first-row value leaves that column untouched as
    /// missing cells.
    pub fn normalize(&self) -> Self {
        let mut out = self.clone();
        if out.dates.is_empty() {
            return out;
        }
        for col in 0..out.columns.len() {
            let base = out.cells[0][col];
            for row in 0..out.dates.len() {
                out.cells[row][col] = match (out.cells[row][col], base) {
                    (Some(v), Some(b)) => Some(v / b),
                    _ => None,
                };
            }
        }
        out
    }

    /// Simple daily returns, `v[t]/v[t-1] - 1`, with the first row defined
    /// as 0 for every column. Operates on a copy.
    pub fn daily_returns(&self) -> Self {
        let mut out = self.clone();
        if out.dates.is_empty() {
            return out;
        }
        for col in 0..out.columns.len() {
            for row in (1..out.dates.len()).rev() {
                out.cells[row][col] =
                    match (self.cells[row][col], self.cells[row - 1][col]) {
                        (Some(v), Some(prev)) => Some(v / prev - 1.0),
                        _ => None,
                    };
            }
            out.cells[0][col] = self.cells[0][col].map(|_| 0.0);
        }
        out
    }

    /// A copy containing only the named columns, in the given order.
    pub fn select(&self, names: &[String]) -> Self {
        let indices: Vec<usize> = names
            .iter()
            .filter_map(|n| self.column_index(n))
            .collect();
        let columns = indices.iter().map(|&i| self.columns[i].clone()).collect();
        let cells = self
            .cells
            .iter()
            .map(|row| indices.iter().map(|&i| row[i]).collect())
            .collect();
        Self {
            dates: self.dates.clone(),
            columns,
            cells,
        }
    }

    /// Dense values with no missing cells; rows retaining a `None` after
    /// fill are reported by date in the error.
    pub fn dense(&self) -> Result<Vec<Vec<f64>>, String> {
        let mut dense = Vec::with_capacity(self.cells.len());
        for (date, row) in self.dates.iter().zip(self.cells.iter()) {
            let mut out = Vec::with_capacity(row.len());
            for (col, value) in row.iter().enumerate() {
                match value {
                    Some(v) => out.push(*v),
                    None => {
                        return Err(format!(
                            "missing value at {} in column {}",
                            date, self.columns[col]
                        ));
                    }
                }
            }
            dense.push(out);
        }
        Ok(dense)
    }

    /// First `n` rows rendered for diagnostics and error dumps.
    pub fn head(&self, n: usize) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "DATE\t{}", self.columns.join("\t"));
        for (date, row) in self.dates.iter().zip(self.cells.iter()).take(n) {
            let rendered: Vec<String> = row
                .iter()
                .map(|v| v.map_or("NaN".to_string(), |x| format!("{x:.6}")))
                .collect();
            let _ = writeln!(out, "{date}\t{}", rendered.join("\t"));
        }
        out
    }
}

//! Per-security quote cache: one CSV file per security per query date,
//! fetched from the remote history endpoint on miss and rotated so only the
//! newest snapshot per security survives.

use async_trait::async_trait;
use chrono::NaiveDate;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::catalog::{CatalogMode, SecurityRecord, SNAPSHOT_DATE_FORMAT};
use crate::error::PortoptError;

/// Remote source for one security's raw quotes CSV.
#[async_trait]
pub trait HistoryProvider: Send + Sync {
    async fn fetch_history(
        &self,
        security: &SecurityRecord,
        to_date: NaiveDate,
    ) -> Result<String, PortoptError>;
}

/// What to extract from a cached quotes file.
#[derive(Debug, Clone)]
pub struct QuoteRequest<'a> {
    /// Price column to read, e.g. `CLOSE`.
    pub price_field: &'a str,
    pub volume: bool,
    pub download_if_not_exists: bool,
}

/// One security's daily series as read from its cache file.
#[derive(Debug, Clone)]
pub struct PriceSeries {
    pub code: String,
    pub has_volume: bool,
    /// Chronological `(date, price, volume)` rows.
    pub rows: Vec<(NaiveDate, f64, Option<f64>)>,
}

pub struct QuoteStore {
    dir: PathBuf,
    tf_symbol: String,
    provider: Arc<dyn HistoryProvider>,
}

impl QuoteStore {
    pub fn new(
        dir: impl Into<PathBuf>,
        tf_symbol: impl Into<String>,
        provider: Arc<dyn HistoryProvider>,
    ) -> Self {
        Self {
            dir: dir.into(),
            tf_symbol: tf_symbol.into(),
            provider,
        }
    }

    /// Canonical cache file name. Must stay bit-exact between the read and
    /// write paths; the date component is the query's "to" date.
    pub fn file_name(security: &SecurityRecord, tf_symbol: &str, to_date: NaiveDate) -> String {
        format!(
            "{}_{}_{}_{}_{}_{}_{}.csv",
            security.market_id,
            security.market_name,
            security.emitent_id,
            security.emitent_code,
            security.safe_emitent_name(),
            tf_symbol,
            to_date.format(SNAPSHOT_DATE_FORMAT)
        )
    }

    /// Everything before the date component; shared by all snapshots of the
    /// same security and used to find rotation candidates.
    fn file_prefix(security: &SecurityRecord, tf_symbol: &str) -> String {
        format!(
            "{}_{}_{}_{}_{}_{}_",
            security.market_id,
            security.market_name,
            security.emitent_id,
            security.emitent_code,
            security.safe_emitent_name(),
            tf_symbol,
        )
    }

    pub fn quote_path(&self, security: &SecurityRecord, to_date: NaiveDate) -> PathBuf {
        self.dir
            .join(Self::file_name(security, &self.tf_symbol, to_date))
    }

    /// Returns the cached series for `security`, downloading it first when
    /// absent and permitted. A failed download is not retried; it surfaces
    /// to the caller. After a successful update-mode fetch, older snapshots
    /// of the same security are rotated away.
    pub async fn load_or_fetch(
        &self,
        security: &SecurityRecord,
        mode: CatalogMode,
        to_date: NaiveDate,
        request: &QuoteRequest<'_>,
    ) -> Result<PriceSeries, PortoptError> {
        let path = self.quote_path(security, to_date);

        if !path.is_file() {
            warn!("{} doesn't exist", path.display());
            if !request.download_if_not_exists {
                return Err(PortoptError::PriceFetch(format!(
                    "{} is not cached and downloads are disabled",
                    path.display()
                )));
            }
            self.refresh(security, mode, to_date).await?;
        }

        read_series(&path, security, request)
    }

    /// Downloads and persists a fresh snapshot unconditionally, rotating
    /// older ones away in update mode.
    pub async fn refresh(
        &self,
        security: &SecurityRecord,
        mode: CatalogMode,
        to_date: NaiveDate,
    ) -> Result<PathBuf, PortoptError> {
        info!("Downloading quotes for {}", security.emitent_code);
        let path = self.quote_path(security, to_date);
        let body = self.provider.fetch_history(security, to_date).await?;
        write_raw_csv(&path, &body)?;
        // Rotation runs only after the new file is fully written, and never
        // for explicit dated queries.
        if mode == CatalogMode::Update {
            self.rotate(security)?;
        }
        Ok(path)
    }

    /// Keeps only the newest file sharing this security's naming prefix.
    fn rotate(&self, security: &SecurityRecord) -> Result<(), PortoptError> {
        let prefix = Self::file_prefix(security, &self.tf_symbol);
        let mut candidates = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name.starts_with(&prefix) && name.ends_with(".csv") {
                let modified = fs::metadata(&path)?.modified()?;
                candidates.push((modified, path));
            }
        }
        if candidates.len() < 2 {
            return Ok(());
        }
        candidates.sort_by_key(|(modified, _)| *modified);
        let (_, keep) = candidates.pop().expect("at least two candidates");
        debug!("Rotation keeps {}", keep.display());
        for (_, path) in candidates {
            debug!("Rotation deletes {}", path.display());
            fs::remove_file(path)?;
        }
        Ok(())
    }
}

/// Writes the downloaded body, stripping the provider's angle-bracket
/// decorations from the header row only.
fn write_raw_csv(path: &Path, body: &str) -> Result<(), PortoptError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut lines = body.lines();
    let mut output = String::with_capacity(body.len());
    if let Some(header) = lines.next() {
        output.push_str(&header.replace(['<', '>'], ""));
        output.push('\n');
    }
    for line in lines {
        output.push_str(line);
        output.push('\n');
    }
    fs::write(path, output)?;
    Ok(())
}

/// Reads a cached `;`-separated quotes file into a date-indexed series.
fn read_series(
    path: &Path,
    security: &SecurityRecord,
    request: &QuoteRequest<'_>,
) -> Result<PriceSeries, PortoptError> {
    info!("Start reading the {}", path.display());
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b';')
        .flexible(true)
        .from_path(path)?;

    let headers = reader.headers()?.clone();
    let position = |name: &str| headers.iter().position(|h| h == name);

    let date_idx = position("DATE").ok_or_else(|| {
        PortoptError::PriceFetch(format!("{} has no DATE column", path.display()))
    })?;
    let price_idx = position(request.price_field).ok_or_else(|| {
        PortoptError::PriceFetch(format!(
            "{} has no {} column",
            path.display(),
            request.price_field
        ))
    })?;
    let vol_idx = if request.volume {
        Some(position("VOL").ok_or_else(|| {
            PortoptError::PriceFetch(format!("{} has no VOL column", path.display()))
        })?)
    } else {
        None
    };

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        let Some(date_raw) = record.get(date_idx) else {
            continue;
        };
        let Some(date) = parse_quote_date(date_raw) else {
            warn!("Skipping row with unparseable date '{}'", date_raw);
            continue;
        };
        let Some(price) = record.get(price_idx).and_then(parse_value) else {
            // Missing prices stay missing; alignment fills them later.
            continue;
        };
        let volume = vol_idx.and_then(|i| record.get(i).and_then(parse_value));
        rows.push((date, price, volume));
    }

    Ok(PriceSeries {
        code: security.emitent_code.clone(),
        has_volume: request.volume,
        rows,
    })
}

fn parse_value(raw: &str) -> Option<f64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("nan") {
        return None;
    }
    trimmed.parse().ok()
}

/// The provider's date column format depends on the configured `dtf` code;
/// accept the handful of shapes it can produce.
fn parse_quote_date(raw: &str) -> Option<NaiveDate> {
    const FORMATS: [&str; 5] = ["%Y%m%d", "%d.%m.%y", "%d.%m.%Y", "%Y-%m-%d", "%d/%m/%y"];
    let trimmed = raw.trim();
    FORMATS
        .iter()
        .find_map(|f| NaiveDate::parse_from_str(trimmed, f).ok())
}

//! Metadata catalog: resolves market/issuer identifiers into security
//! records backed by dated local snapshot files.

use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::PortoptError;

pub const SNAPSHOT_DATE_FORMAT: &str = "%d-%m-%Y";

/// One row of the metadata catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityRecord {
    pub market_id: i64,
    pub market_name: String,
    pub emitent_id: i64,
    pub emitent_code: String,
    pub emitent_name: String,
}

impl SecurityRecord {
    /// Issuer name made safe for use inside a filename.
    pub fn safe_emitent_name(&self) -> String {
        self.emitent_name.replace('/', "_")
    }
}

/// The catalog fields a security can be addressed by.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum SecurityField {
    MarketId,
    MarketName,
    EmitentId,
    EmitentCode,
    EmitentName,
}

impl SecurityField {
    pub const ALL: [Self; 5] = [
        Self::MarketId,
        Self::MarketName,
        Self::EmitentId,
        Self::EmitentCode,
        Self::EmitentName,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MarketId => "market_id",
            Self::MarketName => "market_name",
            Self::EmitentId => "emitent_id",
            Self::EmitentCode => "emitent_code",
            Self::EmitentName => "emitent_name",
        }
    }

    pub fn parse_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|f| f.as_str() == name)
    }

    /// The record's value for this field, stringified for comparison.
    pub fn value_of(&self, record: &SecurityRecord) -> String {
        match self {
            Self::MarketId => record.market_id.to_string(),
            Self::MarketName => record.market_name.clone(),
            Self::EmitentId => record.emitent_id.to_string(),
            Self::EmitentCode => record.emitent_code.clone(),
            Self::EmitentName => record.emitent_name.clone(),
        }
    }
}

/// Match predicates over the catalog fields.
///
/// A record matches if it matches ANY populated field (logical OR across
/// fields, OR within a field's allowed-value set). Callers typically filter
/// by a single field and leave the rest empty; an entirely empty filter
/// matches nothing. This loose semantics is intentional and relied upon by
/// portfolio definitions.
#[derive(Debug, Clone, Default)]
pub struct SecurityFilter {
    pub market_ids: Vec<i64>,
    pub market_names: Vec<String>,
    pub emitent_ids: Vec<i64>,
    pub emitent_codes: Vec<String>,
    pub emitent_names: Vec<String>,
}

impl SecurityFilter {
    pub fn matches(&self, record: &SecurityRecord) -> bool {
        self.market_ids.contains(&record.market_id)
            || self.market_names.iter().any(|n| *n == record.market_name)
            || self.emitent_ids.contains(&record.emitent_id)
            || self.emitent_codes.iter().any(|c| *c == record.emitent_code)
            || self.emitent_names.iter().any(|n| *n == record.emitent_name)
    }
}

/// Snapshot selection mode: refresh-and-use-newest, or an explicit date.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatalogMode {
    Update,
    AsOf(NaiveDate),
}

impl CatalogMode {
    pub fn parse(s: &str) -> Result<Self, PortoptError> {
        if s.eq_ignore_ascii_case("update") {
            return Ok(Self::Update);
        }
        NaiveDate::parse_from_str(s, SNAPSHOT_DATE_FORMAT)
            .map(Self::AsOf)
            .map_err(|_| {
                PortoptError::CatalogFetch(format!(
                    "mode must be 'update' or a dd-mm-yyyy date, got '{s}'"
                ))
            })
    }

    /// The "to" date used for quote queries and file naming under this mode.
    pub fn to_date(&self, today: NaiveDate) -> NaiveDate {
        match self {
            Self::Update => today,
            Self::AsOf(date) => *date,
        }
    }
}

/// Remote source producing a full catalog of security records.
#[async_trait]
pub trait CatalogProvider: Send + Sync {
    async fn fetch_catalog(&self) -> Result<Vec<SecurityRecord>, PortoptError>;
}

/// Local catalog of dated snapshot files plus the remote provider used to
/// refresh them in update mode.
pub struct MetadataCatalog {
    dir: PathBuf,
    provider: Arc<dyn CatalogProvider>,
}

impl MetadataCatalog {
    pub fn new(dir: impl Into<PathBuf>, provider: Arc<dyn CatalogProvider>) -> Self {
        Self {
            dir: dir.into(),
            provider,
        }
    }

    /// Resolves securities matching `filter` under the given mode.
    ///
    /// Update mode loads today's snapshot if present, otherwise fetches a
    /// fresh one and then loads the newest dated file. An explicit date loads
    /// exactly that snapshot and never fetches.
    pub async fn resolve(
        &self,
        mode: CatalogMode,
        filter: &SecurityFilter,
        today: NaiveDate,
    ) -> Result<Vec<SecurityRecord>, PortoptError> {
        let (records, path) = self.snapshot(mode, today).await?;
        let selected = select(records, filter);
        info!("Found {} securities in {}", selected.len(), path.display());
        Ok(selected)
    }

    /// The full snapshot for the given mode, without filtering.
    pub async fn snapshot(
        &self,
        mode: CatalogMode,
        today: NaiveDate,
    ) -> Result<(Vec<SecurityRecord>, PathBuf), PortoptError> {
        let path = match mode {
            CatalogMode::Update => {
                let todays = self.snapshot_path(today);
                if todays.is_file() {
                    todays
                } else {
                    let records = self.provider.fetch_catalog().await?;
                    self.save_snapshot(&records, today)?;
                    self.newest_snapshot()?
                        .ok_or_else(|| PortoptError::CatalogNotFound(self.dir.clone()))?
                }
            }
            CatalogMode::AsOf(date) => {
                let path = self.snapshot_path(date);
                if !path.is_file() {
                    return Err(PortoptError::CatalogNotFound(path));
                }
                path
            }
        };

        let records = load_snapshot(&path)?;
        Ok((records, path))
    }

    pub fn snapshot_path(&self, date: NaiveDate) -> PathBuf {
        self.dir
            .join(format!("{}.csv", date.format(SNAPSHOT_DATE_FORMAT)))
    }

    /// Persists a fresh snapshot as `DD-MM-YYYY.csv` in the metadata dir.
    pub fn save_snapshot(
        &self,
        records: &[SecurityRecord],
        date: NaiveDate,
    ) -> Result<PathBuf, PortoptError> {
        fs::create_dir_all(&self.dir)?;
        let path = self.snapshot_path(date);
        let mut writer = csv::WriterBuilder::new()
            .delimiter(b';')
            .from_path(&path)?;
        for record in records {
            writer.serialize(record)?;
        }
        writer.flush()?;
        debug!("Wrote catalog snapshot {}", path.display());
        Ok(path)
    }

    /// The snapshot file with the most recent date encoded in its name.
    pub fn newest_snapshot(&self) -> Result<Option<PathBuf>, PortoptError> {
        let mut newest: Option<(NaiveDate, PathBuf)> = None;
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if path.extension().and_then(|e| e.to_str()) != Some("csv") {
                continue;
            }
            let Ok(date) = NaiveDate::parse_from_str(stem, SNAPSHOT_DATE_FORMAT) else {
                continue;
            };
            if newest.as_ref().is_none_or(|(d, _)| date > *d) {
                newest = Some((date, path));
            }
        }
        Ok(newest.map(|(_, p)| p))
    }
}

fn load_snapshot(path: &Path) -> Result<Vec<SecurityRecord>, PortoptError> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b';')
        .from_path(path)
        .map_err(|e| PortoptError::CatalogFetch(format!("{}: {e}", path.display())))?;
    let mut records = Vec::new();
    for row in reader.deserialize() {
        let record: SecurityRecord = row?;
        records.push(record);
    }
    Ok(records)
}

/// Filter, strip stray quotes from codes and de-duplicate by `emitent_id`
/// keeping the first occurrence.
fn select(records: Vec<SecurityRecord>, filter: &SecurityFilter) -> Vec<SecurityRecord> {
    let mut seen = HashSet::new();
    records
        .into_iter()
        .filter(|r| filter.matches(r))
        .map(|mut r| {
            r.emitent_code = r.emitent_code.replace('\'', "");
            r
        })
        .filter(|r| seen.insert(r.emitent_id))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: i64, code: &str) -> SecurityRecord {
        SecurityRecord {
            market_id: 1,
            market_name: "MICEX".into(),
            emitent_id: id,
            emitent_code: code.into(),
            emitent_name: format!("Issuer {code}"),
        }
    }

    #[test]
    fn filter_matches_any_field() {
        let filter = SecurityFilter {
            emitent_codes: vec!["SBER".into(), "GAZP".into()],
            ..Default::default()
        };
        let snapshot = vec![record(3, "SBER"), record(16842, "GAZP"), record(8, "LKOH")];

        let selected = select(snapshot, &filter);
        assert_eq!(selected.len(), 2);
        assert_eq!(selected[0].emitent_code, "SBER");
        assert_eq!(selected[1].emitent_code, "GAZP");
    }

    #[test]
    fn empty_filter_matches_nothing() {
        let selected = select(vec![record(3, "SBER")], &SecurityFilter::default());
        assert!(selected.is_empty());
    }

    #[test]
    fn select_dedups_by_emitent_id_keeping_first() {
        let filter = SecurityFilter {
            market_ids: vec![1],
            ..Default::default()
        };
        let mut duplicate = record(3, "SBER");
        duplicate.market_name = "MICEX duplicate".into();
        let selected = select(vec![record(3, "SBER"), duplicate], &filter);

        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].market_name, "MICEX");
    }

    #[test]
    fn select_strips_quotes_from_codes() {
        let filter = SecurityFilter {
            emitent_ids: vec![3],
            ..Default::default()
        };
        let selected = select(vec![record(3, "'SBER'")], &filter);
        assert_eq!(selected[0].emitent_code, "SBER");
    }

    #[test]
    fn mode_parsing() {
        assert_eq!(CatalogMode::parse("update").unwrap(), CatalogMode::Update);
        assert_eq!(
            CatalogMode::parse("05-03-2021").unwrap(),
            CatalogMode::AsOf(NaiveDate::from_ymd_opt(2021, 3, 5).unwrap())
        );
        assert!(CatalogMode::parse("2021-03-05").is_err());
    }

    #[test]
    fn snapshot_roundtrip_and_newest() {
        let dir = tempfile::tempdir().unwrap();

        struct NoFetch;
        #[async_trait]
        impl CatalogProvider for NoFetch {
            async fn fetch_catalog(&self) -> Result<Vec<SecurityRecord>, PortoptError> {
                panic!("must not fetch in this test");
            }
        }

        let catalog = MetadataCatalog::new(dir.path(), Arc::new(NoFetch));
        let older = NaiveDate::from_ymd_opt(2021, 3, 4).unwrap();
        let newer = NaiveDate::from_ymd_opt(2021, 3, 5).unwrap();

        catalog.save_snapshot(&[record(3, "SBER")], older).unwrap();
        catalog
            .save_snapshot(&[record(3, "SBER"), record(8, "LKOH")], newer)
            .unwrap();

        let newest = catalog.newest_snapshot().unwrap().unwrap();
        assert!(newest.ends_with("05-03-2021.csv"));

        let records = load_snapshot(&newest).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].emitent_code, "LKOH");
    }

    #[tokio::test]
    async fn as_of_mode_missing_snapshot_is_an_error() {
        let dir = tempfile::tempdir().unwrap();

        struct NoFetch;
        #[async_trait]
        impl CatalogProvider for NoFetch {
            async fn fetch_catalog(&self) -> Result<Vec<SecurityRecord>, PortoptError> {
                panic!("dated queries must never fetch");
            }
        }

        let catalog = MetadataCatalog::new(dir.path(), Arc::new(NoFetch));
        let date = NaiveDate::from_ymd_opt(2021, 3, 5).unwrap();
        let err = catalog
            .resolve(
                CatalogMode::AsOf(date),
                &SecurityFilter::default(),
                date,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PortoptError::CatalogNotFound(_)));
    }
}

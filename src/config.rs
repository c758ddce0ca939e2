use anyhow::{Context, Result};
use chrono::NaiveDate;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::{fs, path::PathBuf};
use tracing::debug;

use crate::catalog::{SecurityField, SecurityFilter, SecurityRecord};

/// Per-security options inside a portfolio definition.
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct SecurityOpts {
    /// Whether a short (negative) allocation is permitted for this security.
    #[serde(default)]
    pub short: bool,
}

/// The securities of a portfolio, keyed by whichever catalog field the user
/// prefers to identify them with. Typically only one of the maps is populated.
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct SecuritiesSpec {
    #[serde(default)]
    pub market_id: BTreeMap<i64, SecurityOpts>,
    #[serde(default)]
    pub market_name: BTreeMap<String, SecurityOpts>,
    #[serde(default)]
    pub emitent_id: BTreeMap<i64, SecurityOpts>,
    #[serde(default)]
    pub emitent_code: BTreeMap<String, SecurityOpts>,
    #[serde(default)]
    pub emitent_name: BTreeMap<String, SecurityOpts>,
}

impl SecuritiesSpec {
    /// Catalog filter carrying the populated identifier lists.
    pub fn filter(&self) -> SecurityFilter {
        SecurityFilter {
            market_ids: self.market_id.keys().copied().collect(),
            market_names: self.market_name.keys().cloned().collect(),
            emitent_ids: self.emitent_id.keys().copied().collect(),
            emitent_codes: self.emitent_code.keys().cloned().collect(),
            emitent_names: self.emitent_name.keys().cloned().collect(),
        }
    }

    /// Looks up the `short` flag for a resolved record. A record selected by
    /// any of its fields falls back to long-only when no entry matches.
    pub fn is_shortable(&self, record: &SecurityRecord) -> bool {
        if let Some(opts) = self.emitent_code.get(&record.emitent_code) {
            return opts.short;
        }
        if let Some(opts) = self.emitent_id.get(&record.emitent_id) {
            return opts.short;
        }
        if let Some(opts) = self.emitent_name.get(&record.emitent_name) {
            return opts.short;
        }
        if let Some(opts) = self.market_id.get(&record.market_id) {
            return opts.short;
        }
        if let Some(opts) = self.market_name.get(&record.market_name) {
            return opts.short;
        }
        false
    }
}

/// The reference security, specified as a single catalog field/value pair,
/// e.g. `emitent_code: SBER`. Its data availability gates row inclusion
/// during alignment.
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct ReferenceSpec(pub BTreeMap<SecurityField, serde_yaml::Value>);

impl ReferenceSpec {
    pub fn field_value(&self) -> Option<(SecurityField, String)> {
        self.0.iter().next().map(|(field, value)| {
            let value = match value {
                serde_yaml::Value::String(s) => s.clone(),
                serde_yaml::Value::Number(n) => n.to_string(),
                other => serde_yaml::to_string(other)
                    .unwrap_or_default()
                    .trim()
                    .to_string(),
            };
            (*field, value)
        })
    }

    /// Unified lookup contract: does this record's configured field carry the
    /// configured value?
    pub fn matches(&self, record: &SecurityRecord) -> bool {
        self.field_value()
            .is_some_and(|(field, value)| field.value_of(record) == value)
    }
}

/// One named portfolio definition.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PortfolioSpec {
    pub name: String,
    /// `update` (refresh metadata, use the newest snapshot) or an explicit
    /// `dd-mm-yyyy` snapshot date.
    #[serde(default = "default_mode")]
    pub mode: String,
    pub securities: SecuritiesSpec,
    #[serde(default)]
    pub reference: ReferenceSpec,
    #[serde(default)]
    pub start_date: Option<NaiveDate>,
    /// Alternative to `start_date`: a lookback like "365 days" ending today.
    #[serde(default)]
    pub period: Option<String>,
    #[serde(default)]
    pub end_date: Option<NaiveDate>,
    /// Which price column of the quotes CSV to use.
    #[serde(default = "default_price_field")]
    pub price: String,
    #[serde(default)]
    pub volume: bool,
    #[serde(default = "default_true")]
    pub download_if_not_exists: bool,
    #[serde(default = "default_true")]
    pub normed: bool,
    #[serde(default)]
    pub daily_returns: bool,
    #[serde(default = "default_start_value")]
    pub start_value: f64,
    /// Annual risk-free rate as a fraction, e.g. 0.05 for 5%.
    #[serde(default)]
    pub risk_free_rate: f64,
}

fn default_mode() -> String {
    "update".to_string()
}

fn default_price_field() -> String {
    "CLOSE".to_string()
}

fn default_true() -> bool {
    true
}

fn default_start_value() -> f64 {
    1_000_000.0
}

/// Start/stop markers delimiting an embedded array inside a provider page.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Marker {
    pub start: String,
    pub stop: String,
}

/// Markers plus the split symbol for one embedded issuer list.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ListMarker {
    pub start: String,
    pub stop: String,
    pub split: String,
}

/// Markers for the four issuer lists embedded in the provider's cache page.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct EmitentMarkers {
    pub emitent_ids: ListMarker,
    pub emitent_names: ListMarker,
    pub emitent_codes: ListMarker,
    pub emitent_markets: ListMarker,
}

/// Opaque formatting codes forwarded to the history endpoint, plus the
/// timeframe table mapping a period symbol to the provider's period index.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RequestParams {
    pub date_format: u8,
    pub time_format: u8,
    pub sep_fields: u8,
    pub sep_digits: u8,
    pub header: u8,
    pub period: String,
    pub kinds_of_periods: BTreeMap<String, u8>,
}

impl RequestParams {
    /// Resolves the configured period symbol into the provider's index.
    pub fn timeframe(&self) -> Result<(u8, String)> {
        let symbol = self.period.clone();
        let index = self
            .kinds_of_periods
            .get(&symbol)
            .copied()
            .with_context(|| format!("Unknown period symbol in config: {symbol}"))?;
        Ok((index, symbol))
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ProviderConfig {
    pub market_info_url: String,
    pub emitent_cache_url: String,
    pub history_url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub markets_marker: Marker,
    pub emitent_markers: EmitentMarkers,
    pub request: RequestParams,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AppConfig {
    /// Directory for dated catalog snapshot files.
    #[serde(default = "default_metadata_dir")]
    pub metadata_dir: PathBuf,
    /// Directory for per-security quote cache files.
    #[serde(default = "default_quotes_dir")]
    pub quotes_dir: PathBuf,
    pub provider: ProviderConfig,
    pub portfolios: Vec<PortfolioSpec>,
}

fn default_metadata_dir() -> PathBuf {
    PathBuf::from("metadata")
}

fn default_quotes_dir() -> PathBuf {
    PathBuf::from("quotes")
}

impl AppConfig {
    pub fn load() -> Result<Self> {
        debug!("Loading default config");
        let config_path = Self::default_config_path()?;
        Self::load_from_path(&config_path)
    }

    pub fn default_config_path() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("io", "portopt", "portopt")
            .context("Could not determine project directories")?;
        Ok(proj_dirs.config_dir().join("config.yaml"))
    }

    pub fn load_from_path<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let config_str = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: Self = serde_yaml::from_str(&config_str)
            .with_context(|| format!("Failed to parse config file: {}", path.as_ref().display()))?;
        debug!("Successfully loaded config");
        Ok(config)
    }

    pub fn portfolio(&self, name: &str) -> Result<&PortfolioSpec> {
        self.portfolios
            .iter()
            .find(|p| p.name == name)
            .with_context(|| format!("Portfolio '{name}' is not defined in the config"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_yaml() -> &'static str {
        r#"
metadata_dir: "meta"
quotes_dir: "quotes"
provider:
  market_info_url: "http://example.com/markets"
  emitent_cache_url: "http://example.com/cache.js"
  history_url: "http://example.com/export"
  headers:
    User-Agent: "portopt/1.0"
  markets_marker:
    start: "markets: ["
    stop: "]"
  emitent_markers:
    emitent_ids: { start: "aEmitentIds = [", stop: "]", split: "," }
    emitent_names: { start: "aEmitentNames = [", stop: "]", split: "','" }
    emitent_codes: { start: "aEmitentCodes = [", stop: "]", split: "','" }
    emitent_markets: { start: "aEmitentMarkets = [", stop: "]", split: "," }
  request:
    date_format: 1
    time_format: 1
    sep_fields: 3
    sep_digits: 1
    header: 1
    period: "D"
    kinds_of_periods: { D: 8, W: 9, M: 10 }
portfolios:
  - name: "demo"
    securities:
      emitent_code:
        SBER: { short: true }
        GAZP: {}
    reference:
      emitent_code: SBER
    period: "365 days"
    start_value: 500000
    risk_free_rate: 0.05
"#
    }

    #[test]
    fn test_config_deserialization() {
        let config: AppConfig = serde_yaml::from_str(sample_yaml()).expect("Failed to deserialize");

        assert_eq!(config.portfolios.len(), 1);
        let portfolio = &config.portfolios[0];
        assert_eq!(portfolio.name, "demo");
        assert_eq!(portfolio.mode, "update");
        assert_eq!(portfolio.price, "CLOSE");
        assert!(portfolio.download_if_not_exists);
        assert!(portfolio.normed);
        assert!(!portfolio.daily_returns);
        assert_eq!(portfolio.start_value, 500_000.0);
        assert_eq!(portfolio.risk_free_rate, 0.05);

        assert!(portfolio.securities.emitent_code["SBER"].short);
        assert!(!portfolio.securities.emitent_code["GAZP"].short);

        let (field, value) = portfolio.reference.field_value().unwrap();
        assert_eq!(field, SecurityField::EmitentCode);
        assert_eq!(value, "SBER");

        let (index, symbol) = config.provider.request.timeframe().unwrap();
        assert_eq!(index, 8);
        assert_eq!(symbol, "D");
    }

    #[test]
    fn test_filter_from_securities_spec() {
        let config: AppConfig = serde_yaml::from_str(sample_yaml()).unwrap();
        let filter = config.portfolios[0].securities.filter();
        assert_eq!(filter.emitent_codes, vec!["GAZP", "SBER"]);
        assert!(filter.market_ids.is_empty());
    }

    #[test]
    fn test_shortable_lookup() {
        let config: AppConfig = serde_yaml::from_str(sample_yaml()).unwrap();
        let spec = &config.portfolios[0].securities;

        let sber = SecurityRecord {
            market_id: 1,
            market_name: "MICEX".into(),
            emitent_id: 3,
            emitent_code: "SBER".into(),
            emitent_name: "Sberbank".into(),
        };
        let lkoh = SecurityRecord {
            emitent_code: "LKOH".into(),
            ..sber.clone()
        };

        assert!(spec.is_shortable(&sber));
        assert!(!spec.is_shortable(&lkoh));
    }
}

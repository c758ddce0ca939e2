//! Portfolio assembly: catalog resolution, per-security quote loading,
//! calendar alignment and the optimization run, end to end.

use anyhow::{Context, Result, bail};
use chrono::{Days, NaiveDate};
use comfy_table::Cell;
use std::sync::Arc;
use tracing::{info, warn};

use crate::catalog::{CatalogMode, MetadataCatalog, SecurityField, SecurityRecord};
use crate::config::{AppConfig, PortfolioSpec};
use crate::optimize::{Allocation, Optimizer};
use crate::providers::finam::FinamProvider;
use crate::quotes::{QuoteRequest, QuoteStore};
use crate::series::PriceTable;
use crate::ui;

/// The assembled joint price table plus the records backing its columns.
pub struct Assembled {
    pub table: PriceTable,
    pub records: Vec<SecurityRecord>,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
}

/// Result of one optimization run over a portfolio definition.
#[derive(Debug)]
pub struct PortfolioReport {
    pub name: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub shortable: Vec<bool>,
    pub allocation: Allocation,
}

impl PortfolioReport {
    pub fn display_as_table(&self) -> String {
        let mut table = ui::new_styled_table();
        table.set_header(vec![
            ui::header_cell("Symbol"),
            ui::header_cell("Weight"),
            ui::header_cell("Bounds"),
        ]);
        for ((code, weight), short) in self
            .allocation
            .codes
            .iter()
            .zip(&self.allocation.weights)
            .zip(&self.shortable)
        {
            let bounds = if *short { "(-1, 1)" } else { "(0, 1)" };
            table.add_row(vec![
                Cell::new(code),
                ui::weight_cell(*weight),
                Cell::new(bounds),
            ]);
        }

        let stats = &self.allocation.stats;
        let mut output = format!(
            "Portfolio: {} ({} .. {})\n\n",
            ui::style_text(&self.name, ui::StyleType::Title),
            self.start_date,
            self.end_date,
        );
        output.push_str(&table.to_string());
        output.push_str(&format!(
            "\n\n{}: {}\n{}: {:.6}\n{}: {:.6}\n{}: {:.2}%",
            ui::style_text("Sharpe Ratio", ui::StyleType::TotalLabel),
            ui::style_text(&format!("{:.4}", stats.sharpe_ratio), ui::StyleType::TotalValue),
            ui::style_text("Volatility (stdev of daily returns)", ui::StyleType::TotalLabel),
            stats.std_daily_return,
            ui::style_text("Average Daily Return", ui::StyleType::TotalLabel),
            stats.avg_daily_return,
            ui::style_text("Cumulative Return", ui::StyleType::TotalLabel),
            stats.cumulative_return * 100.0,
        ));
        output
    }
}

/// The component chain behind one run: metadata catalog lookup, per-security
/// file cache, alignment and optimization. All paths and endpoints come from
/// the configuration passed at construction; there is no ambient state.
pub struct Pipeline {
    catalog: MetadataCatalog,
    quotes: QuoteStore,
}

impl Pipeline {
    pub fn new(catalog: MetadataCatalog, quotes: QuoteStore) -> Self {
        Self { catalog, quotes }
    }

    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let provider = Arc::new(FinamProvider::new(config.provider.clone()));
        let (_, tf_symbol) = config.provider.request.timeframe()?;
        Ok(Self::new(
            MetadataCatalog::new(&config.metadata_dir, provider.clone()),
            QuoteStore::new(&config.quotes_dir, tf_symbol, provider),
        ))
    }

    /// Builds the aligned, filled (and optionally normalized) price table
    /// for a portfolio definition.
    pub async fn assemble(&self, spec: &PortfolioSpec, today: NaiveDate) -> Result<Assembled> {
        let mode = CatalogMode::parse(&spec.mode)?;
        let (start_date, end_date) = resolve_range(spec, today)?;
        let file_date = mode.to_date(today);

        let filter = spec.securities.filter();
        let records = self.catalog.resolve(mode, &filter, today).await?;
        if records.is_empty() {
            bail!("no securities matched for portfolio '{}'", spec.name);
        }

        let request = QuoteRequest {
            price_field: &spec.price,
            volume: spec.volume,
            download_if_not_exists: spec.download_if_not_exists,
        };

        let mut table = PriceTable::new(start_date, end_date);
        let mut reference_seen = false;
        let pb = ui::new_progress_bar(records.len() as u64);
        for record in &records {
            let series = self
                .quotes
                .load_or_fetch(record, mode, file_date, &request)
                .await?;
            table.join(&series);
            if spec.reference.matches(record) {
                reference_seen = true;
                table.drop_missing_in(&record.emitent_code);
            }
            pb.inc(1);
        }
        pb.finish_and_clear();

        if !reference_seen {
            // A misconfigured reference degrades to the strict row filter
            // instead of aborting the assembly.
            match spec.reference.field_value() {
                Some((field, value)) => warn!(
                    "Reference security paper {}:{} hasn't been found",
                    field.as_str(),
                    value
                ),
                None => warn!("No reference security configured"),
            }
            table.drop_missing_any();
        }

        table.fill_forward();
        table.fill_backward();

        if spec.normed {
            table = table.normalize();
        }
        if spec.daily_returns {
            table = table.daily_returns();
        }

        info!(
            "Result dataset has size {} x {}",
            table.n_rows(),
            table.n_cols()
        );
        info!("First rows:\n{}", table.head(3));

        Ok(Assembled {
            table,
            records,
            start_date,
            end_date,
        })
    }

    /// Full run: assemble the table, split out the reference, optimize.
    pub async fn optimize(&self, spec: &PortfolioSpec, today: NaiveDate) -> Result<PortfolioReport> {
        let assembled = self.assemble(spec, today).await?;

        let universe: Vec<&SecurityRecord> = assembled
            .records
            .iter()
            .filter(|r| !spec.reference.matches(r))
            .filter(|r| assembled.table.column_index(&r.emitent_code).is_some())
            .collect();
        if universe.is_empty() {
            bail!(
                "portfolio '{}' has no securities to optimize besides the reference",
                spec.name
            );
        }

        let codes: Vec<String> = universe.iter().map(|r| r.emitent_code.clone()).collect();
        let shortable: Vec<bool> = universe
            .iter()
            .map(|r| spec.securities.is_shortable(r))
            .collect();
        let prices = assembled.table.select(&codes);

        let optimizer = Optimizer::new(spec.start_value, spec.risk_free_rate);
        let allocation = optimizer.optimize(&prices, &shortable)?;
        info!("Portfolio '{}' is ready", spec.name);

        Ok(PortfolioReport {
            name: spec.name.clone(),
            start_date: assembled.start_date,
            end_date: assembled.end_date,
            shortable,
            allocation,
        })
    }

    /// Downloads fresh quote snapshots for every security of the portfolio,
    /// rotating superseded cache files in update mode.
    pub async fn fetch(&self, spec: &PortfolioSpec, today: NaiveDate) -> Result<usize> {
        let mode = CatalogMode::parse(&spec.mode)?;
        let file_date = mode.to_date(today);
        let records = self
            .catalog
            .resolve(mode, &spec.securities.filter(), today)
            .await?;

        let pb = ui::new_progress_bar(records.len() as u64);
        for record in &records {
            info!("Start saving the following: {:?}", record);
            self.quotes.refresh(record, mode, file_date).await?;
            pb.inc(1);
        }
        pb.finish_and_clear();
        Ok(records.len())
    }

    /// Distinct values of one catalog column, in snapshot order.
    pub async fn catalog_values(
        &self,
        mode: &str,
        field: SecurityField,
        today: NaiveDate,
    ) -> Result<Vec<String>> {
        let mode = CatalogMode::parse(mode)?;
        let (records, _) = self.catalog.snapshot(mode, today).await?;
        let mut seen = std::collections::HashSet::new();
        Ok(records
            .iter()
            .map(|r| field.value_of(r))
            .filter(|v| seen.insert(v.clone()))
            .collect())
    }
}

/// The requested calendar range: an explicit start date or a "N days"
/// lookback from today, ending at the explicit end date or today.
fn resolve_range(spec: &PortfolioSpec, today: NaiveDate) -> Result<(NaiveDate, NaiveDate)> {
    let end_date = spec.end_date.unwrap_or(today);
    let start_date = if let Some(date) = spec.start_date {
        date
    } else if let Some(period) = &spec.period {
        let days = period
            .split_whitespace()
            .find_map(|token| token.parse::<u64>().ok())
            .with_context(|| format!("No day count in period '{period}'"))?;
        today - Days::new(days)
    } else {
        bail!(
            "portfolio '{}' needs either start_date or period",
            spec.name
        );
    };
    if start_date > end_date {
        bail!("start date {start_date} is after end date {end_date}");
    }
    Ok((start_date, end_date))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::CatalogProvider;
    use crate::error::PortoptError;
    use crate::quotes::HistoryProvider;
    use async_trait::async_trait;

    fn spec_yaml(mode: &str, reference_code: &str) -> PortfolioSpec {
        serde_yaml::from_str(&format!(
            r#"
name: "test"
mode: "{mode}"
securities:
  emitent_code:
    SBER: {{ short: false }}
    GAZP: {{ short: true }}
reference:
  emitent_code: {reference_code}
start_date: 2021-03-01
end_date: 2021-03-05
start_value: 1000
risk_free_rate: 0.0
"#
        ))
        .unwrap()
    }

    struct StubCatalog;

    #[async_trait]
    impl CatalogProvider for StubCatalog {
        async fn fetch_catalog(&self) -> Result<Vec<SecurityRecord>, PortoptError> {
            Ok(vec![
                SecurityRecord {
                    market_id: 1,
                    market_name: "MICEX".into(),
                    emitent_id: 3,
                    emitent_code: "SBER".into(),
                    emitent_name: "Sberbank".into(),
                },
                SecurityRecord {
                    market_id: 1,
                    market_name: "MICEX".into(),
                    emitent_id: 16842,
                    emitent_code: "GAZP".into(),
                    emitent_name: "Gazprom".into(),
                },
                SecurityRecord {
                    market_id: 1,
                    market_name: "MICEX".into(),
                    emitent_id: 8,
                    emitent_code: "LKOH".into(),
                    emitent_name: "Lukoil".into(),
                },
            ])
        }
    }

    struct StubHistory;

    #[async_trait]
    impl HistoryProvider for StubHistory {
        async fn fetch_history(
            &self,
            security: &SecurityRecord,
            _to_date: NaiveDate,
        ) -> Result<String, PortoptError> {
            // GAZP misses 02-03 and 04-03; SBER covers every business day.
            let body = match security.emitent_code.as_str() {
                "SBER" => {
                    "<DATE>;<CLOSE>\n20210301;100\n20210302;102\n20210303;104\n20210304;103\n20210305;105\n"
                }
                "GAZP" => "<DATE>;<CLOSE>\n20210301;200\n20210303;205\n20210305;210\n",
                other => {
                    return Err(PortoptError::PriceFetch(format!(
                        "unexpected security {other}"
                    )));
                }
            };
            Ok(body.to_string())
        }
    }

    fn pipeline(dir: &std::path::Path) -> Pipeline {
        Pipeline::new(
            MetadataCatalog::new(dir.join("metadata"), Arc::new(StubCatalog)),
            QuoteStore::new(dir.join("quotes"), "D", Arc::new(StubHistory)),
        )
    }

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2021, 3, d).unwrap()
    }

    #[test]
    fn range_from_period_lookback() {
        let mut spec = spec_yaml("update", "SBER");
        spec.start_date = None;
        spec.end_date = None;
        spec.period = Some("30 days".to_string());

        let (start, end) = resolve_range(&spec, date(31)).unwrap();
        assert_eq!(start, date(1));
        assert_eq!(end, date(31));
    }

    #[tokio::test]
    async fn assemble_joins_fills_and_normalizes() {
        let dir = tempfile::tempdir().unwrap();
        let spec = spec_yaml("update", "SBER");

        let assembled = pipeline(dir.path())
            .assemble(&spec, date(5))
            .await
            .unwrap();
        let table = &assembled.table;

        // Only SBER and GAZP are requested; LKOH stays out of the table.
        assert_eq!(table.columns(), &["SBER".to_string(), "GAZP".to_string()]);
        assert_eq!(table.n_rows(), 5);

        // GAZP's gap on 02-03 is forward-filled from 01-03 and the table
        // is normalized to a base of 1.
        let gazp = table.column_index("GAZP").unwrap();
        assert_eq!(table.value(0, gazp), Some(1.0));
        assert_eq!(table.value(1, gazp), Some(1.0));
        assert_eq!(table.value(2, gazp), Some(205.0 / 200.0));
    }

    #[tokio::test]
    async fn missing_reference_degrades_to_strict_row_filter() {
        let dir = tempfile::tempdir().unwrap();
        // The reference points at a code that never resolves.
        let spec = spec_yaml("update", "YNDX");

        let assembled = pipeline(dir.path())
            .assemble(&spec, date(5))
            .await
            .unwrap();

        // Fallback keeps only rows where every column has a value: the
        // three days GAZP actually traded.
        assert_eq!(assembled.table.n_rows(), 3);
        assert_eq!(
            assembled.table.dates(),
            &[date(1), date(3), date(5)]
        );
    }

    #[tokio::test]
    async fn optimize_excludes_the_reference_from_the_universe() {
        let dir = tempfile::tempdir().unwrap();
        let spec = spec_yaml("update", "SBER");

        let report = pipeline(dir.path()).optimize(&spec, date(5)).await.unwrap();

        assert_eq!(report.allocation.codes, vec!["GAZP".to_string()]);
        assert_eq!(report.shortable, vec![true]);
        let budget: f64 = report.allocation.weights.iter().map(|w| w.abs()).sum();
        assert!((budget - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn fetch_refreshes_every_matched_security() {
        let dir = tempfile::tempdir().unwrap();
        let spec = spec_yaml("update", "SBER");

        let count = pipeline(dir.path()).fetch(&spec, date(5)).await.unwrap();
        assert_eq!(count, 2);

        let quotes = std::fs::read_dir(dir.path().join("quotes")).unwrap().count();
        assert_eq!(quotes, 2);
    }

    #[tokio::test]
    async fn catalog_values_lists_distinct_column_values() {
        let dir = tempfile::tempdir().unwrap();
        let values = pipeline(dir.path())
            .catalog_values("update", SecurityField::MarketName, date(5))
            .await
            .unwrap();
        assert_eq!(values, vec!["MICEX".to_string()]);
    }
}

pub mod catalog;
pub mod config;
pub mod error;
pub mod log;
pub mod optimize;
pub mod portfolio;
pub mod providers;
pub mod quotes;
pub mod series;
pub mod ui;

use anyhow::{Context, Result};
use chrono::Local;
use tracing::{debug, info};

use crate::config::{AppConfig, PortfolioSpec};
use crate::portfolio::Pipeline;

pub enum AppCommand {
    /// Solve the allocation for one or all configured portfolios.
    Optimize { portfolio: Option<String> },
    /// Download fresh quote snapshots for one or all portfolios.
    Fetch { portfolio: Option<String> },
    /// List distinct values of one catalog column.
    Catalog { mode: String, column: String },
}

pub async fn run_command(command: AppCommand, config_path: Option<&str>) -> Result<()> {
    info!("Portfolio optimizer starting...");

    let config = match config_path {
        Some(path) => AppConfig::load_from_path(path)?,
        None => AppConfig::load()?,
    };
    debug!("Loaded config: {config:#?}");

    let pipeline = Pipeline::from_config(&config)?;
    let today = Local::now().date_naive();

    match command {
        AppCommand::Optimize { portfolio } => {
            for spec in selected_portfolios(&config, portfolio.as_deref())? {
                let report = pipeline.optimize(spec, today).await?;
                println!("{}\n", report.display_as_table());
            }
        }
        AppCommand::Fetch { portfolio } => {
            for spec in selected_portfolios(&config, portfolio.as_deref())? {
                let count = pipeline.fetch(spec, today).await?;
                info!("Saved {} securities for portfolio '{}'", count, spec.name);
            }
        }
        AppCommand::Catalog { mode, column } => {
            let field = catalog::SecurityField::parse_name(&column)
                .with_context(|| format!("Unknown catalog column '{column}'"))?;
            let values = pipeline.catalog_values(&mode, field, today).await?;
            for value in values {
                println!("{value}");
            }
        }
    }
    Ok(())
}

fn selected_portfolios<'a>(
    config: &'a AppConfig,
    name: Option<&str>,
) -> Result<Vec<&'a PortfolioSpec>> {
    match name {
        Some(name) => Ok(vec![config.portfolio(name)?]),
        None => Ok(config.portfolios.iter().collect()),
    }
}

use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use portopt::log::init_logging;

#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to optional configuration file
    #[arg(short, long, global = true)]
    config_path: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Create default configuration
    Setup,
    /// List distinct values of a catalog column
    Catalog {
        /// `update` or an explicit dd-mm-yyyy snapshot date
        #[arg(short, long, default_value = "update")]
        mode: String,
        /// market_id, market_name, emitent_id, emitent_code or emitent_name
        #[arg(long, default_value = "emitent_code")]
        column: String,
    },
    /// Download quote history for a portfolio (all portfolios by default)
    Fetch { portfolio: Option<String> },
    /// Solve for the optimal allocation of a portfolio
    Optimize { portfolio: Option<String> },
}

impl From<Commands> for portopt::AppCommand {
    fn from(cmd: Commands) -> portopt::AppCommand {
        match cmd {
            Commands::Optimize { portfolio } => portopt::AppCommand::Optimize { portfolio },
            Commands::Fetch { portfolio } => portopt::AppCommand::Fetch { portfolio },
            Commands::Catalog { mode, column } => portopt::AppCommand::Catalog { mode, column },
            Commands::Setup => unreachable!("Setup command should be handled separately"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbose);

    let result = match cli.command {
        Some(Commands::Setup) => setup(),
        Some(cmd) => portopt::run_command(cmd.into(), cli.config_path.as_deref()).await,
        None => {
            Cli::command().print_help()?;
            Ok(())
        }
    };

    if let Err(e) = &result {
        tracing::error!(error = %e, "Application failed");
    }
    result
}

fn setup() -> anyhow::Result<()> {
    use anyhow::Context;

    let path = portopt::config::AppConfig::default_config_path()?;

    if path.exists() {
        anyhow::bail!("Configuration file already exists at {}", path.display());
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }

    let default_config = r#"---
metadata_dir: "metadata"
quotes_dir: "quotes"

provider:
  market_info_url: "https://www.finam.ru/profile/moex-akcii/sberbank/export/"
  emitent_cache_url: "https://www.finam.ru/cache/icharts/icharts.js"
  history_url: "https://export.finam.ru/payload.csv"
  headers:
    User-Agent: "Mozilla/5.0 (X11; Linux x86_64)"
  markets_marker:
    start: "markets: ["
    stop: "]"
  emitent_markers:
    emitent_ids: { start: "var aEmitentIds = [", stop: "]", split: "," }
    emitent_names: { start: "var aEmitentNames = [", stop: "]", split: "','" }
    emitent_codes: { start: "var aEmitentCodes = [", stop: "]", split: "','" }
    emitent_markets: { start: "var aEmitentMarkets = [", stop: "]", split: "," }
  request:
    date_format: 1
    time_format: 1
    sep_fields: 3
    sep_digits: 1
    header: 1
    period: "D"
    kinds_of_periods: { T: 1, M1: 2, M5: 3, M10: 4, M15: 5, M30: 6, H: 7, D: 8, W: 9, MN: 10 }

portfolios:
  - name: "example"
    mode: "update"
    securities:
      emitent_code:
        SBER: { short: false }
        GAZP: { short: true }
    reference:
      emitent_code: SBER
    period: "365 days"
    price: "CLOSE"
    volume: false
    download_if_not_exists: true
    normed: true
    daily_returns: false
    start_value: 1000000
    risk_free_rate: 0.0
"#;

    std::fs::write(&path, default_config)
        .with_context(|| format!("Failed to write config file to {}", path.display()))?;

    tracing::info!("Created default configuration at {}", path.display());
    Ok(())
}

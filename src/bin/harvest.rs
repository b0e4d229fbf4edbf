//! Harvest CLI
//!
//! Usage:
//!   harvest companies --nace 47.111 41.200
//!   harvest companies --nace .
//!   harvest companies --nace 47.111 --geo 0301 4601 --geo-type kommunenummer
//!   harvest resplit --kind nace --geo 0301 4601 --geo-type kommunenummer
//!   harvest fetch roles --missing
//!   harvest fetch financials --missing --year 2024 --limit 5000
//!   harvest fetch companies --stale-days 30
//!   harvest fill --orgnr 912345678 923609016
//!   harvest accounts --orgnr 912345678
//!
//! Environment variables: see `HarvestConfig::from_env`. `RUST_LOG`
//! overrides the default `info` log filter.
//!
//! Exit codes: 0 on success, 2 when the upstream rate limit aborted the run,
//! 1 for any other failure.

use clap::{Args, Parser, Subcommand};
use dotenv::dotenv;
use log::{error, info};
use registry_harvest::config::{load_credentials, ConfigError, HarvestConfig};
use registry_harvest::pipeline::{GeoType, HttpFetcher, RunSummary};
use registry_harvest::sources::brreg::{Entity, Selection};
use registry_harvest::warehouse::SqliteWarehouse;
use registry_harvest::{HarvestError, HarvestResult, Harvester};
use std::process::ExitCode;
use std::sync::Arc;

const RATE_LIMIT_EXIT: u8 = 2;

#[derive(Parser)]
#[command(name = "harvest")]
#[command(version = "0.1.0")]
#[command(about = "Harvest business-registry data into a SQLite warehouse")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Maximum simultaneous in-flight requests (overrides HARVEST_CONCURRENCY)
    #[arg(long, global = true)]
    concurrency: Option<usize>,

    /// Key results transformed together (overrides HARVEST_BATCH_SIZE)
    #[arg(long, global = true)]
    batch_size: Option<usize>,

    /// Row count that triggers a checkpoint (overrides HARVEST_SAVE_INTERVAL)
    #[arg(long, global = true)]
    save_interval: Option<usize>,
}

#[derive(Subcommand)]
enum Command {
    /// Search companies by NACE code and/or geography
    Companies {
        /// NACE codes; `.` selects every code in the code table
        #[arg(long, num_args = 1..)]
        nace: Vec<String>,

        /// Geography values matching --geo-type
        #[arg(long, num_args = 1..)]
        geo: Vec<String>,

        #[arg(long, value_enum, default_value = "kommunenummer")]
        geo_type: GeoType,
    },

    /// Re-run keys recorded as overflowing, split by geography
    Resplit {
        /// Ledger kind whose keys are re-split
        #[arg(long, default_value = "nace")]
        kind: String,

        #[arg(long, num_args = 1.., required = true)]
        geo: Vec<String>,

        #[arg(long, value_enum, default_value = "kommunenummer")]
        geo_type: GeoType,
    },

    /// Fetch companies, roles or financials by organisation number
    Fetch {
        #[arg(value_enum)]
        entity: Entity,

        #[command(flatten)]
        selection: SelectionArgs,
    },

    /// Fetch financials, company details and roles for the given companies
    Fill {
        #[arg(long, num_args = 1.., required = true)]
        orgnr: Vec<String>,
    },

    /// Fetch annual accounts from the commercial API
    Accounts {
        #[command(flatten)]
        selection: SelectionArgs,
    },
}

#[derive(Args)]
struct SelectionArgs {
    /// Explicit organisation numbers
    #[arg(long, num_args = 1..)]
    orgnr: Vec<String>,

    /// Known companies last fetched more than this many days ago
    #[arg(long)]
    stale_days: Option<i64>,

    /// Known companies with no rows of the fetched entity yet
    #[arg(long)]
    missing: bool,

    /// Accounting year for --missing financials
    #[arg(long, default_value_t = 2024)]
    year: i32,

    /// Maximum companies for --missing financials
    #[arg(long)]
    limit: Option<usize>,
}

impl SelectionArgs {
    fn selection(&self, entity: Option<Entity>) -> Result<Selection, ConfigError> {
        if !self.orgnr.is_empty() {
            return Ok(Selection::Explicit(self.orgnr.clone()));
        }
        if let Some(days) = self.stale_days {
            return Ok(Selection::Stale { days });
        }
        match (self.missing, entity) {
            (true, Some(Entity::Roles)) => Ok(Selection::MissingRoles),
            (true, Some(Entity::Financials)) => Ok(Selection::MissingFinancials {
                year: self.year,
                limit: self.limit,
            }),
            (true, _) => Err(ConfigError::InvalidValue(
                "--missing applies to roles and financials only".to_string(),
            )),
            (false, _) => Err(ConfigError::InvalidValue(
                "one of --orgnr, --stale-days or --missing is required".to_string(),
            )),
        }
    }
}

fn log_summary(label: &str, summary: &RunSummary) {
    info!("📊 {} summary:", label);
    info!("   ├─ Keys: {}", summary.keys);
    info!("   ├─ Completed: {}", summary.completed);
    info!("   ├─ Failed: {}", summary.failed);
    info!("   ├─ Overflowed: {}", summary.overflowed);
    info!("   └─ Rows: {} in {} checkpoints", summary.rows, summary.checkpoints);
}

async fn execute(harvester: &Harvester, command: Command) -> HarvestResult<()> {
    match command {
        Command::Companies {
            nace,
            geo,
            geo_type,
        } => {
            let summary = harvester.search_companies(&nace, &geo, geo_type).await?;
            log_summary("Company search", &summary);
        }
        Command::Resplit {
            kind,
            geo,
            geo_type,
        } => {
            let summary = harvester.resplit(&kind, &geo, geo_type).await?;
            log_summary("Re-split", &summary);
        }
        Command::Fetch { entity, selection } => {
            let selection = selection.selection(Some(entity))?;
            let summary = harvester.fetch_entity(entity, &selection).await?;
            log_summary(&format!("{:?}", entity), &summary);
        }
        Command::Fill { orgnr } => {
            let summaries = harvester.fill_companies(&orgnr).await?;
            for (label, summary) in ["Financials", "Companies", "Roles"].iter().zip(&summaries) {
                log_summary(label, summary);
            }
        }
        Command::Accounts { selection } => {
            let selection = selection.selection(None)?;
            let summary = harvester.accounts(&selection).await?;
            log_summary("Accounts", &summary);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    let mut config = HarvestConfig::from_env();
    if let Some(concurrency) = cli.concurrency {
        config.concurrency = concurrency;
    }
    if let Some(batch_size) = cli.batch_size {
        config.batch_size = batch_size;
    }
    if let Some(save_interval) = cli.save_interval {
        config.save_interval = save_interval;
    }
    config.validate()?;

    info!("🚀 Registry harvest");
    info!("   ├─ Warehouse: {}", config.db_path);
    info!("   ├─ Ledger: {}", config.ledger_path.display());
    info!(
        "   └─ Concurrency {}, batch size {}, save interval {}",
        config.concurrency, config.batch_size, config.save_interval
    );

    let warehouse = Arc::new(SqliteWarehouse::open(&config.db_path)?);
    let fetcher = Arc::new(HttpFetcher::new(config.timeout_secs));
    let mut harvester = Harvester::new(config.clone(), fetcher, warehouse);

    if matches!(cli.command, Command::Accounts { .. }) {
        let path = config
            .enin_credentials_path
            .clone()
            .ok_or_else(|| ConfigError::MissingVariable("ENIN_CREDENTIALS_PATH".to_string()))?;
        let credentials = load_credentials(&path)?;
        harvester = harvester.with_accounts_fetcher(Arc::new(
            HttpFetcher::new(config.timeout_secs).with_credentials(credentials),
        ));
    }

    let result = execute(&harvester, cli.command).await;

    // Runs however the command ended
    if let Err(e) = harvester.finish().await {
        error!("❌ Cleanup failed: {}", e);
    }

    match result {
        Ok(()) => {
            info!("✅ Harvest finished");
            Ok(ExitCode::SUCCESS)
        }
        Err(e @ HarvestError::RateLimited { .. }) => {
            error!("🛑 Rate limit exceeded, run aborted. {}", e);
            error!("   └─ Unsaved rows were dropped; wait for the cooldown and re-run");
            Ok(ExitCode::from(RATE_LIMIT_EXIT))
        }
        Err(e) => Err(e.into()),
    }
}

use anyhow::{Context, Result};
use chrono::{Datelike, Utc};
use clap::{Args, Parser, Subcommand};
use cpl_core::{ConventionCalendar, ConventionDay};
use cpl_search::{
    by_category_name, by_game_system, load_category_summary, load_event_groups,
    lookup_event, merge_starred_events, parse_query, partition, search_groups, LinkConfig,
    SearchFilters,
};
use cpl_storage::{EventFilter, EventStore, PgEventStore, StoreConfig};
use cpl_sync::SyncConfig;
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "cpl-cli")]
#[command(about = "Convention event planner command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create the events table and its indexes.
    Migrate,
    /// Reconcile one catalog snapshot into the store.
    Sync {
        /// File path or http(s) URL; defaults to CPL_SNAPSHOT_SOURCE.
        #[arg(long)]
        snapshot: Option<String>,
        #[arg(long)]
        year: Option<i32>,
        #[arg(long)]
        batch_size: Option<usize>,
    },
    /// Free-text search, grouped by category.
    Search {
        query: String,
        #[arg(long)]
        year: Option<String>,
        #[command(flatten)]
        filters: FilterArgs,
    },
    /// Event groups of one category code, grouped by game system.
    Category {
        code: String,
        #[arg(long)]
        year: Option<i32>,
        /// Comma list such as `thu,fri`.
        #[arg(long)]
        days: Option<String>,
    },
    /// Active event counts per event type.
    Categories {
        #[arg(long)]
        year: Option<i32>,
    },
    /// One event and its repeated sessions.
    Event { id: String },
    /// Calendar blocks for a list of starred event ids.
    Calendar {
        #[arg(long)]
        year: Option<i32>,
        #[arg(required = true)]
        ids: Vec<String>,
    },
}

#[derive(Debug, Args)]
struct FilterArgs {
    #[arg(long)]
    days: Option<String>,
    #[arg(long)]
    start_before: Option<u32>,
    #[arg(long)]
    start_after: Option<u32>,
    #[arg(long)]
    end_before: Option<u32>,
    #[arg(long)]
    end_after: Option<u32>,
}

impl From<FilterArgs> for SearchFilters {
    fn from(args: FilterArgs) -> Self {
        Self {
            days: args.days.as_deref().map(ConventionDay::parse_list).unwrap_or_default(),
            start_before_hour: args.start_before,
            start_after_hour: args.start_after,
            end_before_hour: args.end_before,
            end_after_hour: args.end_after,
        }
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn calendar_from_env() -> Result<ConventionCalendar> {
    match std::env::var("CPL_TIME_ZONE") {
        Ok(name) => ConventionCalendar::from_name(&name).context("reading CPL_TIME_ZONE"),
        Err(_) => Ok(ConventionCalendar::default()),
    }
}

async fn connect() -> Result<PgEventStore> {
    PgEventStore::connect(&StoreConfig::from_env())
        .await
        .context("connecting to event store")
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn current_year() -> i32 {
    Utc::now().year()
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync {
        snapshot: None,
        year: None,
        batch_size: None,
    }) {
        Commands::Migrate => {
            connect().await?.migrate().await.context("running migrations")?;
            info!("schema is up to date");
        }
        Commands::Sync {
            snapshot,
            year,
            batch_size,
        } => {
            let mut config = SyncConfig::from_env();
            if let Some(snapshot) = snapshot {
                config.snapshot_location = snapshot;
            }
            if year.is_some() {
                config.snapshot_year = year;
            }
            if let Some(batch_size) = batch_size {
                config.batch_size = batch_size;
            }
            let summary = cpl_sync::run_sync_with_config(&config).await?;
            print_json(&summary)?;
        }
        Commands::Search {
            query,
            year,
            filters,
        } => {
            let store = connect().await?;
            let parsed = SearchFilters::from(filters).apply_to(parse_query(&query, year.as_deref()));
            let groups = search_groups(&store, &parsed, &calendar_from_env()?).await?;
            print_json(&partition(groups, by_category_name))?;
        }
        Commands::Category { code, year, days } => {
            let store = connect().await?;
            let days = days.as_deref().map(ConventionDay::parse_list).unwrap_or_default();
            let groups = load_event_groups(
                &store,
                &code,
                year.unwrap_or_else(current_year),
                &days,
                &calendar_from_env()?,
            )
            .await?;
            print_json(&partition(groups, by_game_system))?;
        }
        Commands::Categories { year } => {
            let store = connect().await?;
            let summary = load_category_summary(&store, year.unwrap_or_else(current_year)).await?;
            print_json(&summary)?;
        }
        Commands::Event { id } => {
            let store = connect().await?;
            let lookup = lookup_event(&store, &id, &calendar_from_env()?)
                .await
                .with_context(|| format!("looking up event {id}"))?;
            print_json(&lookup)?;
        }
        Commands::Calendar { year, ids } => {
            let store = connect().await?;
            let year = year.unwrap_or_else(current_year);
            let loaded = store.load_events(&EventFilter::active(year)).await?;
            let merge = merge_starred_events(
                &ids,
                &loaded,
                &calendar_from_env()?,
                &LinkConfig::from_env(),
            );
            print_json(&merge)?;
        }
    }

    Ok(())
}

use std::sync::Arc;

use {
    anyhow::Context as _,
    belfry_cron::{HandlerFn, Scheduler, SqliteStore, Store, parse},
    chrono::{DateTime, Utc},
    chrono_tz::Tz,
    clap::{Parser, Subcommand},
    tokio_util::sync::CancellationToken,
    tracing::{info, warn},
    tracing_subscriber::EnvFilter,
};

#[derive(Parser)]
#[command(name = "belfry", about = "belfry — exactly-once cron scheduling over a shared store")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// SQLite database URL shared by all scheduler instances.
    #[arg(
        long,
        global = true,
        env = "BELFRY_DB",
        default_value = "sqlite://belfry.db"
    )]
    db: String,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduling loop until interrupted.
    Run,
    /// Register an entry.
    Add {
        /// 5-field cron expression: minute hour day-of-month month day-of-week.
        expression: String,
        #[arg(long)]
        name: String,
        /// IANA timezone the schedule is evaluated in (default: local).
        #[arg(long, env = "BELFRY_TZ")]
        tz: Option<String>,
        /// Free-text metadata carried with the entry.
        #[arg(long)]
        meta: Option<String>,
    },
    /// Delete an entry by expression and name.
    Rm {
        expression: String,
        #[arg(long)]
        name: String,
        #[arg(long, env = "BELFRY_TZ")]
        tz: Option<String>,
    },
    /// List active entries as JSON lines.
    Ls,
    /// List events recorded in [from, to) as JSON lines.
    Events {
        #[arg(long)]
        from: DateTime<Utc>,
        #[arg(long)]
        to: DateTime<Utc>,
    },
    /// Delete events older than the given instant.
    Prune {
        #[arg(long)]
        before: DateTime<Utc>,
    },
}

fn parse_tz(tz: Option<String>) -> anyhow::Result<Option<Tz>> {
    tz.map(|name| {
        name.parse()
            .map_err(|_| anyhow::anyhow!("unknown timezone: {name}"))
    })
    .transpose()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    let store = Arc::new(
        SqliteStore::connect(&cli.db)
            .await
            .with_context(|| format!("failed to open store at {}", cli.db))?,
    );

    match cli.command {
        Commands::Run => run(store).await?,
        Commands::Add {
            expression,
            name,
            tz,
            meta,
        } => {
            store.initialize().await?;
            let mut entry = parse(&expression, parse_tz(tz)?, &name)?;
            entry.meta = meta;
            store.add_entry(&entry).await?;
            info!(%entry, "entry added");
        }
        Commands::Rm {
            expression,
            name,
            tz,
        } => {
            store.initialize().await?;
            let entry = parse(&expression, parse_tz(tz)?, &name)?;
            store.delete_entry(&entry).await?;
            info!(%entry, "entry deleted");
        }
        Commands::Ls => {
            store.initialize().await?;
            for entry in store.entries().await? {
                println!("{}", serde_json::to_string(&entry)?);
            }
        }
        Commands::Events { from, to } => {
            store.initialize().await?;
            for event in store.events(from, to).await? {
                println!("{}", serde_json::to_string(&event)?);
            }
        }
        Commands::Prune { before } => {
            store.initialize().await?;
            let pruned = store.delete_events(before).await?;
            info!(pruned, %before, "events pruned");
        }
    }

    Ok(())
}

async fn run(store: Arc<SqliteStore>) -> anyhow::Result<()> {
    let handler: HandlerFn = Arc::new(|name| info!(%name, "entry fired"));
    let scheduler = Scheduler::new(handler, store);

    // Surface per-tick errors that the scheduler survives.
    if let Some(mut errors) = scheduler.take_error_receiver() {
        tokio::spawn(async move {
            while let Some(error) = errors.recv().await {
                warn!(%error, "scheduler reported");
            }
        });
    }

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_interrupt.cancel();
        }
    });

    scheduler.run(cancel).await?;
    Ok(())
}

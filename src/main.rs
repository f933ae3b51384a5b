use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use tracing::warn;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

mod db;
mod eligibility;
mod error;
mod executor;
mod import;
mod models;
mod report;
mod repository;
mod rules;
mod store;

use executor::{Executor, ExecutorConfig};
use models::{BatchReport, ProgressionType, RunMode, ScheduleType};
use repository::{Clock, FixedClock, SystemClock};
use rules::RuleStore;

#[derive(Debug, Clone, Copy)]
enum Scope {
    All,
    One(ScheduleType),
}

fn parse_scope(value: &str) -> Result<Scope, String> {
    if value.eq_ignore_ascii_case("all") {
        Ok(Scope::All)
    } else {
        value.parse::<ScheduleType>().map(Scope::One)
    }
}

#[derive(Parser)]
#[command(name = "level-progression")]
#[command(about = "Student level progression for university schedules", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    /// Per-call storage timeout in milliseconds
    #[arg(long, global = true, env = "PROGRESSION_TIMEOUT_MS", default_value_t = 5000)]
    timeout_ms: u64,
    /// Extra attempts for read-only storage calls
    #[arg(long, global = true, env = "PROGRESSION_READ_RETRIES", default_value_t = 2)]
    read_retries: u32,
    /// Name recorded as `performed_by` in history
    #[arg(long, global = true, env = "PROGRESSION_OPERATOR", default_value = "system")]
    operator: String,
    #[arg(long, global = true, default_value_t = 5)]
    max_connections: u32,
    /// Print run reports as JSON
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load realistic seed data
    Seed,
    /// Import progression rules from a CSV file
    ImportRules {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Import student progress records from a CSV file
    Import {
        #[arg(long)]
        csv: PathBuf,
    },
    /// List stored progression rules
    Rules,
    /// Evaluate students and optionally commit their progression
    Run {
        /// Schedule type, or "all"
        #[arg(long, value_parser = parse_scope)]
        schedule: Scope,
        /// Write progressions instead of reporting them
        #[arg(long)]
        commit: bool,
        #[arg(long)]
        as_of: Option<NaiveDate>,
        /// Log rejected attempts during commit runs
        #[arg(long)]
        verbose: bool,
    },
    /// Commit every schedule whose trigger date is today
    Auto {
        #[arg(long)]
        as_of: Option<NaiveDate>,
    },
    /// Progress a single student record
    Promote {
        #[arg(long)]
        record: Uuid,
        /// Skip the period requirement and any hold
        #[arg(long = "override")]
        override_rules: bool,
        #[arg(long)]
        as_of: Option<NaiveDate>,
    },
    /// Place a record on hold, or release it
    Hold {
        #[arg(long)]
        record: Uuid,
        #[arg(long)]
        release: bool,
    },
    /// Eligibility counts for a schedule type
    Summary {
        #[arg(long)]
        schedule: ScheduleType,
    },
    /// Show recent progressions, newest first
    History {
        #[arg(long, default_value_t = 20)]
        limit: usize,
        /// Show rejected attempts instead
        #[arg(long)]
        rejections: bool,
    },
    /// Write a markdown dry-run report for a schedule type
    Report {
        #[arg(long)]
        schedule: ScheduleType,
        #[arg(long)]
        as_of: Option<NaiveDate>,
        #[arg(long, default_value = "progression-report.md")]
        out: PathBuf,
    },
    /// Dry run over CSV files without a database
    Simulate {
        #[arg(long)]
        rules: PathBuf,
        #[arg(long)]
        records: PathBuf,
        #[arg(long, value_parser = parse_scope, default_value = "all")]
        schedule: Scope,
        #[arg(long)]
        as_of: Option<NaiveDate>,
    },
}

fn executor_config(cli: &Cli, verbose: bool) -> ExecutorConfig {
    ExecutorConfig {
        call_timeout: Duration::from_millis(cli.timeout_ms),
        read_retries: cli.read_retries,
        performed_by: cli.operator.clone(),
        verbose,
    }
}

fn print_reports(reports: &[BatchReport], json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(reports)?);
        return Ok(());
    }
    for batch in reports {
        print!("{}", report::batch_summary(batch));
        print!("{}", report::outcome_lines(batch));
    }
    Ok(())
}

/// Runs `work` while Ctrl-C stops the executor before its next student.
async fn interruptible<T>(executor: &Executor, work: impl Future<Output = T>) -> T {
    let watcher = executor.cancel_when(async {
        let interrupted = tokio::signal::ctrl_c().await.is_ok();
        if interrupted {
            warn!("interrupt received; stopping after the current student");
        }
        interrupted
    });
    let output = work.await;
    watcher.abort();
    output
}

async fn run_scope(executor: &Executor, scope: Scope, mode: RunMode, as_of: NaiveDate) -> Vec<BatchReport> {
    interruptible(executor, async {
        match scope {
            Scope::All => executor.run_all(mode, as_of).await,
            Scope::One(schedule_type) => {
                vec![executor.run_progression(schedule_type, mode, as_of).await]
            }
        }
    })
    .await
}

fn ensure_not_aborted(reports: &[BatchReport]) -> anyhow::Result<()> {
    if reports.iter().any(|r| r.aborted) {
        anyhow::bail!("one or more runs aborted; see warnings above");
    }
    let unrecorded: usize = reports.iter().map(|r| r.unrecorded.len()).sum();
    if unrecorded > 0 {
        anyhow::bail!("{unrecorded} progressions have no history entry; reconcile before the next run");
    }
    Ok(())
}

async fn simulate(
    cli: &Cli,
    rules_path: &Path,
    records_path: &Path,
    scope: Scope,
    as_of: NaiveDate,
) -> anyhow::Result<()> {
    let store = Arc::new(store::MemoryStore::new());

    let rules_file = std::fs::File::open(rules_path)
        .with_context(|| format!("cannot open {}", rules_path.display()))?;
    let parsed_rules = import::read_rules(rules_file)?;
    for rule in &parsed_rules.rows {
        store.save_rule(rule).await?;
    }

    let records_file = std::fs::File::open(records_path)
        .with_context(|| format!("cannot open {}", records_path.display()))?;
    let parsed_records = import::read_enrolments(records_file)?;
    for row in parsed_records.rows {
        store.add_student(&row.record.student_id, &row.full_name).await;
        store.put_document(row.record.to_document()).await;
    }
    for rejected in parsed_rules.rejected.iter().chain(&parsed_records.rejected) {
        warn!(%rejected, "row skipped");
    }

    let clock: Arc<dyn Clock> = Arc::new(FixedClock(as_of.and_time(chrono::NaiveTime::MIN).and_utc()));
    let executor = Executor::from_store(store, clock, executor_config(cli, false));
    let reports = run_scope(&executor, scope, RunMode::DryRun, as_of).await;
    print_reports(&reports, cli.json)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "level_progression=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let today = clock.now().date_naive();

    if let Commands::Simulate {
        rules,
        records,
        schedule,
        as_of,
    } = &cli.command
    {
        return simulate(&cli, rules, records, *schedule, as_of.unwrap_or(today)).await;
    }

    let database_url = std::env::var("DATABASE_URL")
        .context("DATABASE_URL must be set to a production Postgres instance")?;

    let pool = PgPoolOptions::new()
        .max_connections(cli.max_connections)
        .connect(&database_url)
        .await
        .context("failed to connect to Postgres")?;
    let store = Arc::new(db::PgStore::new(pool.clone()));

    match &cli.command {
        Commands::InitDb => {
            db::init_db(&pool).await?;
            println!("Schema ready.");
        }
        Commands::Seed => {
            db::seed(&pool).await?;
            println!("Seed data inserted.");
        }
        Commands::ImportRules { csv } => {
            let (saved, rejected) = db::import_rules(&pool, csv).await?;
            for line in &rejected {
                println!("skipped {line}");
            }
            println!("Saved {saved} rules from {}.", csv.display());
        }
        Commands::Import { csv } => {
            let (written, rejected) = db::import_csv(&pool, csv).await?;
            for line in &rejected {
                println!("skipped {line}");
            }
            println!("Wrote {written} progress records from {}.", csv.display());
        }
        Commands::Rules => {
            let rules = store.list_rules().await?;
            if rules.is_empty() {
                println!("No progression rules stored.");
            }
            for rule in rules {
                println!(
                    "- {} {}: {} of [{}], trigger {:02}-{:02}, +{} per level{}",
                    rule.schedule_type,
                    if rule.is_active { "(active)" } else { "(inactive)" },
                    rule.required_periods,
                    rule.period_names.join(", "),
                    rule.progression_month,
                    rule.progression_day,
                    rule.level_increment,
                    rule.max_level
                        .map(|level| format!(", final level {level}"))
                        .unwrap_or_default()
                );
            }
        }
        Commands::Run {
            schedule,
            commit,
            as_of,
            verbose,
        } => {
            let executor = Executor::from_store(store, clock, executor_config(&cli, *verbose));
            let mode = if *commit { RunMode::Commit } else { RunMode::DryRun };
            let reports = run_scope(&executor, *schedule, mode, as_of.unwrap_or(today)).await;
            print_reports(&reports, cli.json)?;
            ensure_not_aborted(&reports)?;
        }
        Commands::Auto { as_of } => {
            let executor = Executor::from_store(store, clock, executor_config(&cli, false));
            let reports =
                interruptible(&executor, executor.run_scheduled(as_of.unwrap_or(today))).await;
            print_reports(&reports, cli.json)?;
            ensure_not_aborted(&reports)?;
        }
        Commands::Promote {
            record,
            override_rules,
            as_of,
        } => {
            let executor = Executor::from_store(store, clock, executor_config(&cli, false));
            let progression_type = if *override_rules {
                ProgressionType::Override
            } else {
                ProgressionType::Manual
            };
            let outcome = executor
                .progress_student(*record, progression_type, as_of.unwrap_or(today))
                .await?;
            println!(
                "{} progressed {} -> {} ({})",
                outcome.student_id,
                outcome.from_level,
                outcome.to_level.unwrap_or(outcome.from_level),
                outcome.reason
            );
        }
        Commands::Hold { record, release } => {
            let executor = Executor::from_store(store, clock, executor_config(&cli, false));
            let status = executor.set_hold(*record, !*release).await?;
            println!("Record {record} is now {status}.");
        }
        Commands::Summary { schedule } => {
            let executor = Executor::from_store(store, clock, executor_config(&cli, false));
            let summary = executor.eligibility_summary(*schedule).await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!("{schedule} schedule eligibility:");
                print!("{}", report::summary_lines(&summary));
            }
        }
        Commands::History { limit, rejections } => {
            let executor = Executor::from_store(store, clock, executor_config(&cli, false));
            if *rejections {
                let attempts = executor.rejected_attempts(*limit).await?;
                print!("{}", report::rejection_lines(&attempts));
            } else {
                let entries = executor.progression_history(*limit).await?;
                if cli.json {
                    println!("{}", serde_json::to_string_pretty(&entries)?);
                } else {
                    print!("{}", report::history_lines(&entries));
                }
            }
        }
        Commands::Report {
            schedule,
            as_of,
            out,
        } => {
            let executor = Executor::from_store(store, clock, executor_config(&cli, false));
            let batch = executor
                .run_progression(*schedule, RunMode::DryRun, as_of.unwrap_or(today))
                .await;
            let summary = executor.eligibility_summary(*schedule).await.ok();
            let history = executor.progression_history(10).await?;
            let output = report::build_report(&batch, summary.as_ref(), &history);
            std::fs::write(out, output)?;
            println!("Report written to {}.", out.display());
        }
        // Runs without a database; handled before connecting.
        Commands::Simulate { .. } => {}
    }

    Ok(())
}

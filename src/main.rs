use std::path::PathBuf;

use anyhow::Context;
use chrono::{NaiveDate, Utc};
use clap::{ArgGroup, Parser, Subcommand};
use serde::Serialize;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod batch;
mod config;
mod consensus;
mod db;
mod error;
mod flagging;
mod jobs;
#[cfg(test)]
mod memory;
mod models;
mod numeric;
mod performance;
mod report;
mod scoring;
mod store;

use crate::batch::{BatchReport, Outcome};
use crate::config::QualityConfig;
use crate::consensus::ConsensusEngine;
use crate::db::PgStore;
use crate::flagging::QualityFlaggingEngine;
use crate::models::{PaymentStatus, ReviewStatus, Severity};
use crate::performance::PerformanceEngine;
use crate::store::QualityStore;

#[derive(Parser)]
#[command(name = "microtask-quality")]
#[command(about = "Consensus, payments and quality flags for crowdsourced image labeling", long_about = None)]
struct Cli {
    /// TOML file with thresholds and rates; built-in defaults when omitted
    #[arg(long, global = true, env = "QUALITY_CONFIG")]
    config: Option<PathBuf>,
    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load realistic seed answers
    Seed {
        /// First day of seeded answers; defaults to two days ago
        #[arg(long)]
        start: Option<NaiveDate>,
    },
    /// Import answers from a CSV file
    ImportAnswers {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Calculate consensus for every image of a question
    Consensus {
        #[arg(long)]
        question: i64,
    },
    /// Recalculate consensus for selected images (all when none given)
    Recalculate {
        #[arg(long)]
        question: i64,
        #[arg(long = "image", value_delimiter = ',')]
        images: Vec<i64>,
    },
    /// Show the stored consensus for one image
    GroundTruth {
        #[arg(long)]
        question: i64,
        #[arg(long)]
        image: i64,
    },
    /// Consensus statistics for a question
    ConsensusStats {
        #[arg(long)]
        question: i64,
    },
    /// List images needing review, or record a review decision
    #[command(group(
        ArgGroup::new("target")
            .args(["question", "result_id"])
            .required(true)
            .multiple(false)
    ))]
    Review {
        #[arg(long)]
        question: Option<i64>,
        #[arg(long, requires_all = ["status", "reviewer"])]
        result_id: Option<i64>,
        #[arg(long)]
        status: Option<ReviewStatus>,
        #[arg(long)]
        reviewer: Option<String>,
    },
    /// Calculate daily performance for a question, or one worker on it
    Performance {
        #[arg(long)]
        question: i64,
        #[arg(long)]
        date: Option<NaiveDate>,
        #[arg(long)]
        worker: Option<String>,
    },
    /// Recalculate daily performance over a date range
    PeriodPayments {
        #[arg(long)]
        start: NaiveDate,
        #[arg(long)]
        end: NaiveDate,
        #[arg(long)]
        question: Option<i64>,
    },
    /// Approve pending payments
    ApprovePayments {
        #[arg(long, value_delimiter = ',', required = true)]
        ids: Vec<i64>,
        #[arg(long)]
        approved_by: String,
        #[arg(long)]
        reference: Option<String>,
    },
    /// Move payments to a new status
    PaymentStatus {
        #[arg(long, value_delimiter = ',', required = true)]
        ids: Vec<i64>,
        #[arg(long)]
        status: PaymentStatus,
        /// Transaction references, paired with ids by position
        #[arg(long, value_delimiter = ',')]
        transaction_ids: Vec<String>,
    },
    /// Payment totals for a period
    PaymentSummary {
        #[arg(long)]
        start: NaiveDate,
        #[arg(long)]
        end: NaiveDate,
        #[arg(long)]
        question: Option<i64>,
    },
    /// Performance rollup for one worker
    WorkerSummary {
        #[arg(long)]
        worker: String,
        #[arg(long)]
        start: NaiveDate,
        #[arg(long)]
        end: NaiveDate,
        #[arg(long)]
        question: Option<i64>,
    },
    /// Rank workers by average consensus score
    Leaderboard {
        #[arg(long)]
        start: NaiveDate,
        #[arg(long)]
        end: NaiveDate,
        #[arg(long)]
        question: Option<i64>,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Run low-consensus and speed checks for a question
    QualityCheck {
        #[arg(long)]
        question: i64,
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Raise a manual quality flag
    Flag {
        #[arg(long)]
        worker: String,
        #[arg(long)]
        question: i64,
        #[arg(long)]
        description: String,
        #[arg(long, default_value = "medium")]
        severity: Severity,
        #[arg(long)]
        flagged_by: String,
    },
    /// Resolve a quality flag
    ResolveFlag {
        #[arg(long)]
        id: i64,
        #[arg(long)]
        resolved_by: String,
        #[arg(long)]
        notes: String,
        #[arg(long)]
        action: Option<String>,
    },
    /// List unresolved flags, or every flag of one worker
    Flags {
        #[arg(long)]
        question: Option<i64>,
        #[arg(long)]
        severity: Option<Severity>,
        #[arg(long, conflicts_with_all = ["question", "severity"])]
        worker: Option<String>,
        #[arg(long, requires = "worker")]
        resolved: Option<bool>,
    },
    /// Flag counts by severity and type
    FlagStats {
        #[arg(long)]
        question: Option<i64>,
    },
    /// Nightly pipeline: consensus, performance, then quality checks
    RunDaily {
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Weekly rollup of the seven days ending at the given date
    RunWeekly {
        #[arg(long)]
        week_end: Option<NaiveDate>,
    },
    /// Write payment rows for a period as CSV
    ExportPayments {
        #[arg(long)]
        start: NaiveDate,
        #[arg(long)]
        end: NaiveDate,
        #[arg(long)]
        question: Option<i64>,
        #[arg(long, default_value = "payments.csv")]
        out: PathBuf,
    },
    /// Generate a markdown report
    Report {
        #[arg(long)]
        start: NaiveDate,
        #[arg(long)]
        end: NaiveDate,
        #[arg(long)]
        question: Option<i64>,
        #[arg(long, default_value_t = 10)]
        limit: usize,
        #[arg(long, default_value = "report.md")]
        out: PathBuf,
    },
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_failures<T>(outcome: &Outcome<T>) {
    for failure in &outcome.failures {
        println!("  failed {}: {}", failure.key, failure.error);
    }
}

fn print_batch(report: &BatchReport) {
    println!(
        "{}: {} questions processed, {} skipped, {} produced, {} errors (run {})",
        report.job,
        report.succeeded,
        report.skipped,
        report.produced,
        report.error_count(),
        report.run_id
    );
    for failure in &report.failures {
        println!("  failed {}: {}", failure.key, failure.error);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "microtask_quality=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = QualityConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    let database_url = std::env::var("DATABASE_URL")
        .context("DATABASE_URL must be set to a production Postgres instance")?;

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .context("failed to connect to Postgres")?;
    let store = PgStore::new(pool.clone());
    let now = Utc::now();
    let today = config.local_date(now);
    let json = cli.json;

    match cli.command {
        Commands::InitDb => {
            db::init_db(&pool).await?;
            println!("Schema ready.");
        }
        Commands::Seed { start } => {
            let start = start.unwrap_or(today - chrono::Duration::days(2));
            let inserted = db::seed(&store, start).await?;
            println!("Seeded {inserted} answers starting {start}.");
        }
        Commands::ImportAnswers { csv } => {
            let inserted = db::import_answers_csv(&store, &csv).await?;
            println!("Inserted {inserted} answers from {}.", csv.display());
        }
        Commands::Consensus { question } => {
            let outcome = ConsensusEngine::new(&store, &config)
                .calculate_for_question(question, now)
                .await?;
            if json {
                print_json(&outcome)?;
            } else {
                let review = outcome.items.iter().filter(|r| r.requires_review).count();
                println!(
                    "Consensus for question {question}: {} images, {review} need review, {} errors.",
                    outcome.items.len(),
                    outcome.failures.len()
                );
                print_failures(&outcome);
            }
        }
        Commands::Recalculate { question, images } => {
            let outcome = ConsensusEngine::new(&store, &config)
                .recalculate(question, &images, now)
                .await?;
            if json {
                print_json(&outcome)?;
            } else {
                println!(
                    "Recalculated {} images for question {question}, {} errors.",
                    outcome.items.len(),
                    outcome.failures.len()
                );
                print_failures(&outcome);
            }
        }
        Commands::GroundTruth { question, image } => {
            let result = ConsensusEngine::new(&store, &config)
                .ground_truth(question, image)
                .await?;
            match result {
                Some(row) if json => print_json(&row)?,
                Some(row) => println!(
                    "Image {image}: {} at {}% of {} responses, review {}.",
                    row.ground_truth.as_deref().unwrap_or("-"),
                    row.consensus_percentage,
                    row.total_responses,
                    row.review_status
                ),
                None => println!("No consensus for image {image} on question {question}."),
            }
        }
        Commands::ConsensusStats { question } => {
            let stats = ConsensusEngine::new(&store, &config).statistics(question).await?;
            if json {
                print_json(&stats)?;
            } else {
                println!(
                    "Question {}: {} images, {} agreed, {} need review, average consensus {}% (threshold {}%)",
                    stats.question_id,
                    stats.total_images,
                    stats.with_consensus,
                    stats.requiring_review,
                    stats.average_consensus_percentage,
                    stats.threshold
                );
            }
        }
        Commands::Review {
            question,
            result_id,
            status,
            reviewer,
        } => {
            let engine = ConsensusEngine::new(&store, &config);
            match (question, result_id, status, reviewer) {
                (_, Some(result_id), Some(status), Some(reviewer)) => {
                    match engine.review(result_id, status, &reviewer, now).await? {
                        Some(row) if json => print_json(&row)?,
                        Some(row) => println!(
                            "Consensus {} on image {} marked {} by {reviewer}.",
                            row.id, row.image_id, row.review_status
                        ),
                        None => println!("Consensus result {result_id} not found."),
                    }
                }
                (Some(question), ..) => {
                    let rows = engine.images_requiring_review(question).await?;
                    if json {
                        print_json(&rows)?;
                    } else if rows.is_empty() {
                        println!("No images need review for question {question}.");
                    } else {
                        for row in rows {
                            println!(
                                "- result {} image {}: {} at {}% of {} responses ({})",
                                row.id,
                                row.image_id,
                                row.ground_truth.as_deref().unwrap_or("-"),
                                row.consensus_percentage,
                                row.total_responses,
                                row.review_status
                            );
                        }
                    }
                }
                _ => anyhow::bail!("review needs --question, or --result-id with --status and --reviewer"),
            }
        }
        Commands::Performance {
            question,
            date,
            worker,
        } => {
            let date = date.unwrap_or(today);
            let engine = PerformanceEngine::new(&store, &config);
            match worker {
                Some(worker) => match engine.calculate_daily(&worker, question, date, now).await? {
                    Some(row) if json => print_json(&row)?,
                    Some(row) => println!(
                        "{} on {}: {}/{} correct, score {}%, {} tier, total {}.",
                        row.worker_id,
                        row.date,
                        row.correct_answers,
                        row.tasks_completed,
                        row.consensus_score,
                        row.quality_tier,
                        row.total_payment
                    ),
                    None => println!("No answers from {worker} on question {question} for {date}."),
                },
                None => {
                    let outcome = engine
                        .calculate_daily_for_question(question, date, now)
                        .await?;
                    if json {
                        print_json(&outcome)?;
                    } else {
                        println!(
                            "Scored {} workers on question {question} for {date}, {} errors.",
                            outcome.items.len(),
                            outcome.failures.len()
                        );
                        print_failures(&outcome);
                    }
                }
            }
        }
        Commands::PeriodPayments {
            start,
            end,
            question,
        } => {
            let outcome = PerformanceEngine::new(&store, &config)
                .calculate_period(start, end, question, now)
                .await?;
            if json {
                print_json(&outcome)?;
            } else {
                println!(
                    "Calculated {} worker-days from {start} to {end}, {} errors.",
                    outcome.items.len(),
                    outcome.failures.len()
                );
                print_failures(&outcome);
            }
        }
        Commands::ApprovePayments {
            ids,
            approved_by,
            reference,
        } => {
            let approved = PerformanceEngine::new(&store, &config)
                .approve_payments(&ids, &approved_by, reference.as_deref(), now)
                .await?;
            println!("Approved {approved} of {} payments.", ids.len());
        }
        Commands::PaymentStatus {
            ids,
            status,
            transaction_ids,
        } => {
            let updated = PerformanceEngine::new(&store, &config)
                .update_payment_status(&ids, status, &transaction_ids, now)
                .await?;
            println!("Moved {updated} of {} payments to {status}.", ids.len());
        }
        Commands::PaymentSummary {
            start,
            end,
            question,
        } => {
            let summary = PerformanceEngine::new(&store, &config)
                .payment_summary(start, end, question)
                .await?;
            if json {
                print_json(&summary)?;
            } else {
                println!(
                    "{} workers from {start} to {end}: base {}, bonuses {}, total {}.",
                    summary.total_workers,
                    summary.total_base_pay,
                    summary.total_bonuses,
                    summary.total_payment
                );
                let tiers = summary.by_tier;
                println!(
                    "Tiers: excellent {}, good {}, fair {}, poor {}.",
                    tiers.excellent, tiers.good, tiers.fair, tiers.poor
                );
            }
        }
        Commands::WorkerSummary {
            worker,
            start,
            end,
            question,
        } => {
            let summary = PerformanceEngine::new(&store, &config)
                .worker_summary(&worker, start, end, question)
                .await?;
            match summary {
                Some(summary) if json => print_json(&summary)?,
                Some(summary) => {
                    println!(
                        "{}: {} days, {} tasks, average score {}%, earned {}, {} flags.",
                        summary.worker_id,
                        summary.days_worked,
                        summary.total_tasks,
                        summary.average_consensus_score,
                        summary.total_earnings,
                        summary.flags.len()
                    );
                    for day in &summary.days {
                        println!(
                            "- {} question {}: {}% {} {} ({})",
                            day.date,
                            day.question_id,
                            day.consensus_score,
                            day.quality_tier,
                            day.total_payment,
                            day.payment_status
                        );
                    }
                }
                None => println!("No performance for {worker} from {start} to {end}."),
            }
        }
        Commands::Leaderboard {
            start,
            end,
            question,
            limit,
        } => {
            let standings = PerformanceEngine::new(&store, &config)
                .leaderboard(start, end, question, limit)
                .await?;
            if json {
                print_json(&standings)?;
            } else if standings.is_empty() {
                println!("No performance recorded for this window.");
            } else {
                for (rank, standing) in standings.iter().enumerate() {
                    println!(
                        "{}. {} avg {}% over {} days, {} tasks, earned {}",
                        rank + 1,
                        standing.worker_id,
                        standing.average_consensus_score,
                        standing.days_worked,
                        standing.total_tasks,
                        standing.total_earnings
                    );
                }
            }
        }
        Commands::QualityCheck { question, date } => {
            let as_of = date.unwrap_or(today);
            let engine = QualityFlaggingEngine::new(&store, &config);
            let mut outcome = engine.flag_low_performers(question, as_of, now).await?;
            outcome.extend(engine.flag_anomalous_speed(question, as_of, now).await?);
            if json {
                print_json(&outcome)?;
            } else {
                println!(
                    "Raised {} flags on question {question} for {as_of}, {} errors.",
                    outcome.items.len(),
                    outcome.failures.len()
                );
                for flag in &outcome.items {
                    println!("- [{}] {}: {}", flag.severity, flag.worker_id, flag.description);
                }
                print_failures(&outcome);
            }
        }
        Commands::Flag {
            worker,
            question,
            description,
            severity,
            flagged_by,
        } => {
            let flag = QualityFlaggingEngine::new(&store, &config)
                .create_manual_flag(&worker, question, &description, severity, &flagged_by, now)
                .await?;
            if json {
                print_json(&flag)?;
            } else {
                println!("Flag {} raised for {worker}.", flag.id);
            }
        }
        Commands::ResolveFlag {
            id,
            resolved_by,
            notes,
            action,
        } => {
            let flag = QualityFlaggingEngine::new(&store, &config)
                .resolve_flag(id, &resolved_by, &notes, action.as_deref(), now)
                .await?;
            match flag {
                Some(flag) if json => print_json(&flag)?,
                Some(flag) => println!(
                    "Flag {} resolved by {}.",
                    flag.id,
                    flag.resolved_by.as_deref().unwrap_or("-")
                ),
                None => println!("Flag {id} not found."),
            }
        }
        Commands::Flags {
            question,
            severity,
            worker,
            resolved,
        } => {
            let engine = QualityFlaggingEngine::new(&store, &config);
            let flags = match worker {
                Some(worker) => engine.worker_flags(&worker, resolved).await?,
                None => engine.unresolved_flags(question, severity).await?,
            };
            if json {
                print_json(&flags)?;
            } else if flags.is_empty() {
                println!("No flags found.");
            } else {
                for flag in flags {
                    println!(
                        "- #{} [{}] {} {} on question {} at {}{}: {}",
                        flag.id,
                        flag.severity,
                        flag.flag_type,
                        flag.worker_id,
                        flag.question_id,
                        flag.flagged_at.format("%Y-%m-%d %H:%M"),
                        if flag.resolved { " (resolved)" } else { "" },
                        flag.description
                    );
                }
            }
        }
        Commands::FlagStats { question } => {
            let stats = QualityFlaggingEngine::new(&store, &config)
                .flag_statistics(question)
                .await?;
            if json {
                print_json(&stats)?;
            } else {
                println!(
                    "{} flags: {} unresolved, {} resolved.",
                    stats.total, stats.unresolved, stats.resolved
                );
                println!(
                    "Severity: high {}, medium {}, low {}.",
                    stats.by_severity.high, stats.by_severity.medium, stats.by_severity.low
                );
                println!(
                    "Type: low consensus {}, high speed {}, manual {}.",
                    stats.by_type.low_consensus, stats.by_type.high_speed, stats.by_type.manual
                );
            }
        }
        Commands::RunDaily { date } => {
            let as_of = date.unwrap_or(today);
            let report = jobs::run_daily(&store, &config, as_of, now).await?;
            if json {
                print_json(&report)?;
            } else {
                println!("Daily run for {as_of}:");
                print_batch(&report.consensus);
                print_batch(&report.performance);
                print_batch(&report.quality);
            }
            if report.error_count() > 0 {
                anyhow::bail!("daily run finished with {} errors", report.error_count());
            }
        }
        Commands::RunWeekly { week_end } => {
            let week_end = week_end.unwrap_or(today);
            let report = jobs::run_weekly_payments(&store, &config, week_end, now).await?;
            if json {
                print_json(&report)?;
            } else {
                print_batch(&report);
            }
            if report.error_count() > 0 {
                anyhow::bail!("weekly run finished with {} errors", report.error_count());
            }
        }
        Commands::ExportPayments {
            start,
            end,
            question,
            out,
        } => {
            anyhow::ensure!(start <= end, "start {start} is after end {end}");
            let rows = store.performance_in_range(start, end, question, None).await?;
            let file = std::fs::File::create(&out)
                .with_context(|| format!("failed to create {}", out.display()))?;
            let written = report::write_payments_csv(file, &rows)?;
            println!("Exported {written} payment rows to {}.", out.display());
        }
        Commands::Report {
            start,
            end,
            question,
            limit,
            out,
        } => {
            let performance = PerformanceEngine::new(&store, &config);
            let flagging = QualityFlaggingEngine::new(&store, &config);
            let summary = performance.payment_summary(start, end, question).await?;
            let standings = performance.leaderboard(start, end, question, limit).await?;
            let flag_stats = flagging.flag_statistics(question).await?;
            let open_flags = flagging.unresolved_flags(question, None).await?;
            let report = report::build_report(&summary, &flag_stats, &standings, &open_flags);
            std::fs::write(&out, report)?;
            println!("Report written to {}.", out.display());
        }
    }

    Ok(())
}

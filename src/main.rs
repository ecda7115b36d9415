use std::path::PathBuf;

use anyhow::{bail, Context};
use chrono::Utc;
use clap::{ArgGroup, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod db;
mod error;
mod ingest;
mod matcher;
mod models;
mod reconcile;
mod report;

#[derive(Parser)]
#[command(name = "biobank-tracker")]
#[command(about = "Biobank sample tracker with study identifier reconciliation", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load realistic seed data
    Seed,
    /// Reconcile a batch of study identifiers from a CSV or JSON file
    #[command(group(
        ArgGroup::new("source")
            .args(["csv", "json"])
            .required(true)
            .multiple(false)
    ))]
    ImportIdentifiers {
        #[arg(long)]
        csv: Option<PathBuf>,
        #[arg(long)]
        json: Option<PathBuf>,
    },
    /// Import clinical-data rows from a CSV or JSON file
    #[command(group(
        ArgGroup::new("source")
            .args(["csv", "json"])
            .required(true)
            .multiple(false)
    ))]
    ImportClinical {
        #[arg(long)]
        csv: Option<PathBuf>,
        #[arg(long)]
        json: Option<PathBuf>,
    },
    /// Look up the clinical record matching one sample
    Lookup {
        #[arg(long)]
        sample: String,
    },
    /// List samples with their clinical annotations
    Annotate {
        #[arg(long)]
        cohort: Option<String>,
    },
    /// Generate a markdown coverage report
    Report {
        #[arg(long)]
        cohort: Option<String>,
        #[arg(long, default_value = "report.md")]
        out: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let database_url =
        std::env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite://biobank.db".to_string());
    let pool = db::connect(&database_url).await?;

    match cli.command {
        Commands::InitDb => {
            db::init_db(&pool).await?;
            println!("Schema ready.");
        }
        Commands::Seed => {
            db::init_db(&pool).await?;
            db::seed(&pool).await?;
            println!("Seed data inserted.");
        }
        Commands::ImportIdentifiers { csv, json } => {
            let rows = match (csv, json) {
                (Some(path), _) => ingest::read_identifier_csv(&path)?,
                (None, Some(path)) => ingest::read_identifier_json(&path)?,
                (None, None) => bail!("either --csv or --json is required"),
            };
            let outcome = reconcile::reconcile_identifiers(&pool, &rows).await?;
            println!(
                "Identifiers reconciled: {} total, {} created, {} updated, {} skipped.",
                outcome.total, outcome.created, outcome.updated, outcome.skipped
            );
        }
        Commands::ImportClinical { csv, json } => {
            let rows = match (csv, json) {
                (Some(path), _) => ingest::read_clinical_csv(&path)?,
                (None, Some(path)) => ingest::read_clinical_json(&path)?,
                (None, None) => bail!("either --csv or --json is required"),
            };
            let outcome = reconcile::import_clinical(&pool, &rows).await?;
            println!(
                "Clinical rows imported: {} total, {} created, {} updated, {} skipped.",
                outcome.total, outcome.created, outcome.updated, outcome.skipped
            );
        }
        Commands::Lookup { sample } => {
            let record = db::fetch_sample(&pool, &sample)
                .await?
                .with_context(|| format!("no sample named {sample}"))?;
            match matcher::clinical_data_for_sample(&pool, &record).await? {
                Some(clinical) => {
                    let key = match (&clinical.sample_date, &clinical.music_timepoint) {
                        (Some(date), _) => format!("date {date}"),
                        (None, Some(timepoint)) => format!("timepoint {timepoint}"),
                        (None, None) => "no key".to_string(),
                    };
                    println!("Clinical data for {sample} ({key}):");
                    println!("  crp: {}", fmt_number(clinical.crp));
                    println!("  calprotectin: {}", fmt_number(clinical.calprotectin));
                    println!(
                        "  mucosal healing 3-6 months: {}",
                        fmt_flag(clinical.endoscopic_mucosal_healing_at_3_6_months)
                    );
                    println!(
                        "  mucosal healing 12 months: {}",
                        fmt_flag(clinical.endoscopic_mucosal_healing_at_12_months)
                    );
                }
                None => println!("No clinical data matched sample {sample}."),
            }
        }
        Commands::Annotate { cohort } => {
            let annotated = matcher::annotate_samples(&pool, cohort.as_deref()).await?;
            if annotated.is_empty() {
                println!("No samples found.");
                return Ok(());
            }
            for entry in &annotated {
                println!(
                    "- {} [{}] {} crp {} calprotectin {} healing(3-6m) {} healing(12m) {}",
                    entry.sample_id,
                    entry.cohort,
                    entry.identifier_name.as_deref().unwrap_or("-"),
                    fmt_number(entry.crp),
                    fmt_number(entry.calprotectin),
                    fmt_flag(entry.endoscopic_mucosal_healing_at_3_6_months),
                    fmt_flag(entry.endoscopic_mucosal_healing_at_12_months),
                );
            }
        }
        Commands::Report { cohort, out } => {
            let annotated = matcher::annotate_samples(&pool, cohort.as_deref()).await?;
            let identifier_count = db::count_identifiers(&pool).await?;
            let report = report::build_report(
                cohort.as_deref(),
                Utc::now().date_naive(),
                identifier_count,
                &annotated,
            );
            std::fs::write(&out, report)?;
            println!("Report written to {}.", out.display());
        }
    }

    Ok(())
}

fn fmt_number(value: Option<f64>) -> String {
    value.map(|v| format!("{v:.1}")).unwrap_or_else(|| "-".to_string())
}

fn fmt_flag(value: Option<bool>) -> String {
    match value {
        Some(true) => "yes".to_string(),
        Some(false) => "no".to_string(),
        None => "-".to_string(),
    }
}

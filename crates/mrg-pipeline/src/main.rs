//! MRG command line
//!
//! Runs golden-record merge batches against the record API, previews
//! batch plans, merges local record files and standardizes allergy terms.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use colored::*;
use indicatif::{ProgressBar, ProgressStyle};
use log::error;
use mrg_core::allergy::AllergyStandardizer;
use mrg_core::{
    BatchCoordinator, FileCheckpointStore, MergeEngine, RankingPolicy, RecordGrouper,
    StandardizedPatientRecord,
};
use mrg_pipeline::config::check_threshold;
use mrg_pipeline::{BatchRunner, HttpApi, PipelineConfig, PipelineError, RecordSource, Result};

#[derive(Parser)]
#[command(name = "mrg")]
#[command(about = "Patient golden-record merge pipeline")]
struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = "mrg.toml", env = "MRG_CONFIG")]
    config: PathBuf,

    /// Override the configured environment
    #[arg(short, long)]
    environment: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Merge every pending batch and submit the golden records
    Run {
        /// Override the configured batch size
        #[arg(short, long)]
        batch_size: Option<usize>,

        /// Merge and submit a single person-code instead of the batch plan
        #[arg(long)]
        patient: Option<String>,

        /// Disable the progress bar
        #[arg(long)]
        quiet: bool,
    },

    /// Show the batch plan and which windows are already complete
    Plan {
        /// Override the configured batch size
        #[arg(short, long)]
        batch_size: Option<usize>,
    },

    /// Merge a JSON file of standardized records and print the golden records
    MergeFile {
        /// JSON array of standardized records
        #[arg(short, long)]
        input: PathBuf,

        /// Ranking CSV (default: the configured one)
        #[arg(short, long)]
        ranking: Option<PathBuf>,

        /// Write the merged records here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Standardize free-text allergy terms against a vocabulary
    Allergies {
        /// Vocabulary file, one term per line (default: the configured one)
        #[arg(short, long)]
        vocabulary: Option<PathBuf>,

        /// Minimum similarity for a match
        #[arg(short, long)]
        threshold: Option<f64>,

        /// Raw allergy entries
        #[arg(required = true)]
        terms: Vec<String>,
    },
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    match execute(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{}", err);
            eprintln!("{} {}", "error:".red().bold(), err);
            if err.is_configuration() {
                ExitCode::from(2)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

fn execute(cli: Cli) -> Result<()> {
    let mut config = PipelineConfig::load(&cli.config)?;
    config.apply_env_overrides();
    if let Some(environment) = cli.environment {
        config.environment = environment;
    }
    config.validate()?;

    match cli.command {
        Commands::Run { batch_size, patient, quiet } => {
            run(&config, batch_size.unwrap_or(config.batch.size), patient.as_deref(), quiet)
        }
        Commands::Plan { batch_size } => plan(&config, batch_size.unwrap_or(config.batch.size)),
        Commands::MergeFile { input, ranking, output } => {
            merge_file(&config, &input, ranking.as_deref(), output.as_deref())
        }
        Commands::Allergies { vocabulary, threshold, terms } => allergies(
            &config,
            vocabulary.as_deref(),
            check_threshold(threshold.unwrap_or(config.allergy.threshold))?,
            &terms,
        ),
    }
}

fn header(title: &str) {
    println!("{}", "═".repeat(60).cyan());
    println!("{}", format!("  {}", title).cyan().bold());
    println!("{}", "═".repeat(60).cyan());
}

fn progress_bar(len: u64, quiet: bool) -> ProgressBar {
    if quiet {
        return ProgressBar::hidden();
    }
    let progress = ProgressBar::new(len);
    if let Ok(style) = ProgressStyle::with_template(
        "{spinner:.green} [{elapsed_precise}] [{bar:32.cyan/blue}] {pos}/{len} batches {msg}",
    ) {
        progress.set_style(style.progress_chars("=> "));
    }
    progress
}

fn run(config: &PipelineConfig, batch_size: usize, patient: Option<&str>, quiet: bool) -> Result<()> {
    let policy = config.ranking_policy()?;
    let registry = config.registry()?;
    let api = HttpApi::from_config(config)?;
    let mut sink = HttpApi::from_config(config)?;
    let store = FileCheckpointStore::open(&config.checkpoint.path)?;
    let coordinator = BatchCoordinator::new(store, config.environment.clone());

    header(&format!("MERGE RUN: {} (ranking {})", config.environment, policy.version()));
    let mut runner = BatchRunner::new(&api, &mut sink, coordinator, &policy, &registry, batch_size);

    if let Some(code) = patient {
        return match runner.run_patient(code)? {
            Some(merged) => {
                println!("{} merged and submitted {}", "✓".green(), merged.patient_code.bold());
                Ok(())
            }
            None => {
                println!("{} no records for {}", "!".yellow(), code);
                Ok(())
            }
        };
    }

    let (_, planned) = runner.plan()?;
    let progress = progress_bar(planned.len() as u64, quiet);
    let summary = runner.run_with(|report| {
        if report.skipped {
            progress.set_message(format!("offset {} skipped", report.batch.offset));
        } else {
            progress.set_message(format!(
                "offset {}: {} patients",
                report.batch.offset, report.patients_merged
            ));
        }
        progress.inc(1);
    })?;
    progress.finish_and_clear();

    println!("Population:       {}", summary.total_count);
    println!("Batches planned:  {}", summary.batches_planned);
    println!("Batches skipped:  {}", summary.batches_skipped);
    println!("Batches merged:   {}", summary.batches_processed.to_string().green());
    println!("Records fetched:  {}", summary.records_fetched);
    println!("Patients merged:  {} of {} expected", summary.patients_merged, summary.patients_expected);
    if !summary.is_consistent() {
        println!(
            "{} run total differs from the planned count by {}",
            "mismatch".yellow().bold(),
            summary.patients_expected.abs_diff(summary.patients_merged)
        );
    }
    if summary.mismatches.is_empty() {
        println!("{}", "All windows consistent".green());
    } else {
        for mismatch in &summary.mismatches {
            println!(
                "{} offset {}: merged {} of {} expected",
                "mismatch".yellow().bold(),
                mismatch.offset,
                mismatch.merged,
                mismatch.expected
            );
        }
    }
    Ok(())
}

fn plan(config: &PipelineConfig, batch_size: usize) -> Result<()> {
    let api = HttpApi::from_config(config)?;
    let store = FileCheckpointStore::open(&config.checkpoint.path)?;
    let coordinator = BatchCoordinator::new(store, config.environment.clone());

    let total = api.count()?;
    let batches = coordinator.plan_batches(total, batch_size)?;

    header(&format!("BATCH PLAN: {} patients in {}", total, config.environment));
    let mut pending = 0;
    for batch in &batches {
        let done = coordinator.has_completed(batch.offset, batch.batch_size, coordinator.environment())?;
        let status = if done {
            "done".green()
        } else {
            pending += 1;
            "pending".yellow()
        };
        println!(
            "  offset {:>8}  size {:>6}  span {:>6}  {}",
            batch.offset,
            batch.batch_size,
            batch.span(total),
            status
        );
    }
    println!();
    println!("{} of {} batches pending", pending.to_string().bold(), batches.len());
    Ok(())
}

fn merge_file(config: &PipelineConfig, input: &Path, ranking: Option<&Path>, output: Option<&Path>) -> Result<()> {
    let policy = match ranking {
        Some(path) => RankingPolicy::from_csv_path(path, config.ranking.version.as_deref())?,
        None => config.ranking_policy()?,
    };
    let registry = config.registry()?;

    let content = fs::read_to_string(input)?;
    let records: Vec<StandardizedPatientRecord> = serde_json::from_str(&content)
        .map_err(|e| PipelineError::Decode(format!("{}: {}", input.display(), e)))?;

    let (groups, stats) = RecordGrouper::group_with_stats(records);
    let engine = MergeEngine::new(&policy, &registry);
    let outcomes = engine.merge_all(&groups)?;
    let merged: Vec<_> = outcomes.iter().map(|o| &o.record).collect();

    let json = serde_json::to_string_pretty(&merged).map_err(mrg_core::MergeError::from)?;
    match output {
        Some(path) => {
            fs::write(path, json)?;
            eprintln!(
                "{} {} records -> {} golden records ({} superseded) written to {}",
                "✓".green(),
                stats.records,
                merged.len(),
                stats.superseded,
                path.display()
            );
        }
        None => println!("{}", json),
    }

    let conflicted = outcomes.iter().filter(|o| !o.conflicting_fields.is_empty()).count();
    if conflicted > 0 {
        eprintln!("{} {} patients had conflicting fields", "note:".cyan(), conflicted);
    }
    Ok(())
}

fn allergies(config: &PipelineConfig, vocabulary: Option<&Path>, threshold: f64, terms: &[String]) -> Result<()> {
    let path = vocabulary
        .map(Path::to_path_buf)
        .or_else(|| config.allergy.vocabulary_path.clone())
        .ok_or_else(|| PipelineError::Config("no allergy vocabulary configured".to_string()))?;
    let vocabulary: Vec<String> = fs::read_to_string(&path)?
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect();

    let standardizer = AllergyStandardizer::new(vocabulary, threshold);
    let result = standardizer.standardize(terms);

    header(&format!("ALLERGIES (threshold {:.2})", threshold));
    for matched in &result.matched {
        println!(
            "  {} {:<30} -> {} ({:.3})",
            "✓".green(),
            matched.raw,
            matched.term.bold(),
            matched.similarity
        );
    }
    for unmatched in &result.unmatched {
        println!("  {} {}", "✗".red(), unmatched.raw);
    }
    Ok(())
}

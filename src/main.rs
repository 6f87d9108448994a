// src/main.rs
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};
use serde::Serialize;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use scoring_lib::ensemble::TrainerConfig;
use scoring_lib::features::RawApplication;
use scoring_lib::feedback::Outcome;
use scoring_lib::retrain::RetrainOutcome;
use scoring_lib::store;
use scoring_lib::utils::config::{EngineConfig, StoreConfig};
use scoring_lib::utils::env::load_env;
use scoring_lib::utils::progress::ProgressConfig;
use scoring_lib::ScoringEngine;

#[derive(Parser)]
#[command(author, version, about = "Credit-risk ensemble scoring engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Print compact JSON instead of pretty-printed JSON
    #[arg(long, global = true)]
    compact: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Train on the bulk dataset and commit a new model version
    Train {
        /// Bulk CSV (overrides BULK_DATASET_PATH)
        #[arg(long)]
        data: Option<PathBuf>,
        /// JSON file with a full trainer configuration
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Score one application (JSON file, or - for stdin)
    Predict {
        input: PathBuf,
        /// Serving-time decision threshold override
        #[arg(long)]
        threshold: Option<f64>,
    },
    /// Score one application and attribute the score to its attributes
    Explain { input: PathBuf },
    /// Record the actual outcome for an application scored by the current model
    Feedback {
        input: PathBuf,
        /// repaid | default
        #[arg(long)]
        actual: Outcome,
        /// Wait for a retraining run this record triggers
        #[arg(long)]
        wait: bool,
    },
    /// Retrain from accumulated feedback now
    Retrain,
    /// Validation/holdout metrics of every variant trained with the serving model
    Compare,
    /// List persisted model versions
    Versions,
    /// Serve the previous model version again
    Rollback,
}

fn read_application(input: &Path) -> Result<RawApplication> {
    let raw = if input == Path::new("-") {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("Failed to read application from stdin")?;
        buf
    } else {
        std::fs::read_to_string(input).with_context(|| format!("Failed to read {}", input.display()))?
    };
    serde_json::from_str(&raw).context("Application is not valid JSON")
}

fn emit<T: Serialize>(value: &T, compact: bool) -> Result<()> {
    let out = if compact {
        serde_json::to_string(value)?
    } else {
        serde_json::to_string_pretty(value)?
    };
    println!("{}", out);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    load_env();
    info!("Starting credit scoring engine");

    let cli = Cli::parse();
    let engine_config = EngineConfig::from_env();
    engine_config.log_config();
    let trainer_config = TrainerConfig::from_env();
    let store_config = StoreConfig::from_env();
    store_config.log_config();

    let stores = store::open(&store_config)
        .await
        .context("Failed to open model and feedback stores")?;
    let engine = ScoringEngine::start(engine_config, trainer_config, ProgressConfig::from_env(), stores).await?;

    match cli.command {
        Command::Train { data, config } => {
            if let Some(path) = data {
                engine.load_bulk_dataset(&path).await?;
            }
            let config = match config {
                Some(path) => {
                    let raw = std::fs::read_to_string(&path)
                        .with_context(|| format!("Failed to read {}", path.display()))?;
                    Some(serde_json::from_str::<TrainerConfig>(&raw).context("Invalid trainer configuration")?)
                }
                None => None,
            };
            let summary = engine.train_final(config).await?;
            emit(&summary, cli.compact)?;
        }
        Command::Predict { input, threshold } => {
            let application = read_application(&input)?;
            emit(&engine.predict_with_threshold(&application, threshold)?, cli.compact)?;
        }
        Command::Explain { input } => {
            let application = read_application(&input)?;
            let explained = engine.explain(&application)?;
            for item in &explained.explanation.summary {
                info!("  {}", item.text);
            }
            emit(&explained, cli.compact)?;
        }
        Command::Feedback { input, actual, wait } => {
            let application = read_application(&input)?;
            let shown = engine.predict(&application)?;
            let ack = engine.record_feedback(application, shown, actual).await?;
            if ack.retrain_triggered {
                if wait {
                    while engine.retrain_running() {
                        tokio::time::sleep(Duration::from_millis(250)).await;
                    }
                    info!("Background retraining finished; serving {:?}", engine.current_summary().map(|s| s.version));
                } else {
                    warn!("Retraining was triggered; exiting now abandons it (use --wait)");
                }
            }
            emit(&ack, cli.compact)?;
        }
        Command::Retrain => {
            let outcome = engine.retrain().await?;
            if let RetrainOutcome::RolledBack(report) = &outcome {
                warn!(
                    "Candidate rejected: AUC {:.4} vs incumbent {:.4}",
                    report.candidate_auc,
                    report.incumbent_auc.unwrap_or_default()
                );
            }
            emit(&outcome, cli.compact)?;
        }
        Command::Compare => emit(&engine.compare_models()?, cli.compact)?,
        Command::Versions => emit(&engine.versions().await?, cli.compact)?,
        Command::Rollback => emit(&engine.rollback().await?, cli.compact)?,
    }

    Ok(())
}

use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use autonet_ensemble::{
    nodes::{OptimizationSummary, MASTER_TASK_ID},
    store::TrialEntry,
    BuildEnsemble, BuildOutcome, EnsembleInputs, EnsembleTelemetry, IdentityTransform,
    LabelTransform, LogLevel, OneHotDecoding, PipelineConfig, PredictionStore, TrialHistory,
};
use clap::{Parser, Subcommand};
use indexmap::IndexMap;
use serde::Serialize;
use serde_json::{json, Value};

#[derive(Parser, Debug)]
#[command(name = "ens", version, about = "Ensemble builder for autonet result directories")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Builds an ensemble from a finished search.
    Build {
        #[arg(long)]
        config: PathBuf,
        /// Overrides `result_logger_dir` from the config.
        #[arg(long)]
        results_dir: Option<PathBuf>,
        /// Writes the summary here instead of stdout.
        #[arg(long)]
        output: Option<PathBuf>,
        /// JSONL telemetry log.
        #[arg(long)]
        log: Option<PathBuf>,
    },
    /// Lists the models stored in a prediction artifact.
    Inspect {
        #[arg(long)]
        artifact: PathBuf,
        /// Decodes one-hot labels before reporting shapes.
        #[arg(long)]
        one_hot: bool,
    },
    /// Lists finished trials.
    History {
        #[arg(long)]
        results_dir: PathBuf,
        /// Number of entries to display.
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
}

#[derive(Debug, Serialize)]
struct BuildSummary {
    ensemble_built: bool,
    final_metric_score: f64,
    optimized_hyperparameter_config: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    ensemble_final_metric_score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ensemble_test_score: Option<f64>,
    weights: IndexMap<String, f64>,
    ensemble_configs: IndexMap<String, Value>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Build {
            config,
            results_dir,
            output,
            log,
        } => handle_build(&config, results_dir, output.as_deref(), log),
        Commands::Inspect { artifact, one_hot } => handle_inspect(&artifact, one_hot),
        Commands::History { results_dir, limit } => {
            let history = TrialHistory::load(&results_dir)?;
            let skip = history.len().saturating_sub(limit);
            for entry in history.entries().iter().skip(skip) {
                println!(
                    "{} | {} | {} | {}",
                    entry.identifier, entry.score, entry.finished_at, entry.config
                );
            }
            Ok(())
        }
    }
}

fn handle_build(
    config_path: &Path,
    results_dir: Option<PathBuf>,
    output: Option<&Path>,
    log: Option<PathBuf>,
) -> Result<()> {
    let mut config = PipelineConfig::load(config_path)?;
    if let Some(dir) = results_dir {
        config.result_logger_dir = dir;
    }
    config.task_id = MASTER_TASK_ID;

    let mut telemetry = EnsembleTelemetry::builder("ens").min_level(LogLevel::Debug);
    if let Some(path) = log {
        telemetry = telemetry.log_path(path);
    }
    let telemetry = telemetry.build()?;

    let history = TrialHistory::load(&config.result_logger_dir)?;
    let summary = best_trial(&history, config.minimize);
    let inputs = EnsembleInputs::from_config(&config)?;
    let outcome = BuildEnsemble::new()
        .with_telemetry(telemetry)
        .fit(&config, false, summary, &inputs)
        .with_context(|| {
            format!(
                "building ensemble from {}",
                config.result_logger_dir.display()
            )
        })?;

    let report = summarize(outcome);
    let rendered = serde_json::to_string_pretty(&report)?;
    match output {
        Some(path) => {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(path, rendered)
                .with_context(|| format!("writing summary {}", path.display()))?;
        }
        None => println!("{rendered}"),
    }
    Ok(())
}

fn best_trial(history: &TrialHistory, minimize: bool) -> OptimizationSummary {
    let rank = |a: &&TrialEntry, b: &&TrialEntry| {
        let ordering = a.score.total_cmp(&b.score);
        if minimize {
            ordering.reverse()
        } else {
            ordering
        }
    };
    history
        .entries()
        .iter()
        .filter(|entry| !entry.score.is_nan())
        // earliest trial wins ties
        .min_by(|a, b| rank(b, a))
        .map_or_else(
            || OptimizationSummary {
                final_metric_score: f64::NAN,
                optimized_hyperparameter_config: Value::Null,
                budget: 0.0,
            },
            |entry| OptimizationSummary {
                final_metric_score: entry.score,
                optimized_hyperparameter_config: entry.config.clone(),
                budget: entry.identifier.budget,
            },
        )
}

fn summarize(outcome: BuildOutcome) -> BuildSummary {
    match outcome {
        BuildOutcome::Skipped(summary) => BuildSummary {
            ensemble_built: false,
            final_metric_score: summary.final_metric_score,
            optimized_hyperparameter_config: summary.optimized_hyperparameter_config,
            ensemble_final_metric_score: None,
            ensemble_test_score: None,
            weights: IndexMap::new(),
            ensemble_configs: IndexMap::new(),
        },
        BuildOutcome::EnsembleBuilt {
            summary,
            ensemble,
            ensemble_final_metric_score,
            ensemble_configs,
            ensemble_test_score,
        } => BuildSummary {
            ensemble_built: true,
            final_metric_score: summary.final_metric_score,
            optimized_hyperparameter_config: summary.optimized_hyperparameter_config,
            ensemble_final_metric_score: Some(ensemble_final_metric_score),
            ensemble_test_score,
            weights: ensemble
                .weights()
                .iter()
                .map(|member| (member.identifier.to_string(), member.weight))
                .collect(),
            ensemble_configs: ensemble_configs
                .into_iter()
                .map(|(identifier, config)| (identifier.to_string(), config))
                .collect(),
        },
    }
}

fn handle_inspect(artifact: &Path, one_hot: bool) -> Result<()> {
    let transform: &dyn LabelTransform = if one_hot {
        &OneHotDecoding
    } else {
        &IdentityTransform
    };
    let stored = PredictionStore::read(artifact, transform)
        .with_context(|| format!("reading artifact {}", artifact.display()))?;
    println!(
        "{}",
        json!({
            "labels": [stored.labels.n_samples(), stored.labels.n_targets()],
            "test_labels": stored
                .test_labels
                .as_ref()
                .map(|labels| [labels.n_samples(), labels.n_targets()]),
            "models": stored.predictions.len(),
        })
    );
    for (identifier, record) in &stored.predictions {
        let shape = record.validation.first().map(|fold| fold.dim());
        println!(
            "{identifier} | validation folds {} | test folds {} | shape {:?}",
            record.validation.len(),
            record.test.len(),
            shape
        );
    }
    Ok(())
}

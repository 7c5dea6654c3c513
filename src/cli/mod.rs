//! Command-line interface

use crate::config::RunConfig;
use crate::dataset::DatasetLoader;
use crate::error::Result;
use crate::runner::{self, CancelToken, FoldOutcome, RunSummary};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "emocv",
    about = "Grouped cross-validation evaluation for emotion recognition",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run an evaluation described by a YAML configuration
    Run {
        /// Run configuration file
        config: PathBuf,
        /// Run folds across all cores, overriding the configuration
        #[arg(long)]
        parallel: bool,
    },
    /// Check a run configuration without executing it
    Validate {
        /// Run configuration file
        config: PathBuf,
    },
    /// Summarise a dataset
    Info {
        /// Feature-matrix CSV
        features: PathBuf,
        /// Metadata CSV
        labels: PathBuf,
        /// Grouping key to summarise
        #[arg(long, default_value = "speaker")]
        partition: String,
    },
}

pub fn execute(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Run { config, parallel } => {
            let mut config = RunConfig::from_yaml_file(&config)?;
            if parallel {
                config.parallel = true;
            }
            let summary = runner::execute(&config, CancelToken::new())?;
            print_summary(&config, &summary);
            Ok(())
        }
        Commands::Validate { config } => {
            let config = RunConfig::from_yaml_file(&config)?;
            config.validate()?;
            println!("{}", "configuration ok".green());
            Ok(())
        }
        Commands::Info {
            features,
            labels,
            partition,
        } => {
            let dataset = DatasetLoader::new("unnamed", "unnamed")
                .with_group_keys(&[&partition])
                .load(&features, &labels)?;
            println!("{}", "Dataset".bold());
            println!("  instances: {}", dataset.n_instances());
            println!("  features:  {}", dataset.n_features());
            println!("  classes:   {} ({})", dataset.n_classes(), dataset.classes.join(", "));
            let grouping = dataset.grouping(&partition)?;
            println!(
                "  {}: {} ({})",
                partition,
                grouping.n_groups(),
                grouping.names.join(", ")
            );
            Ok(())
        }
    }
}

fn print_summary(config: &RunConfig, summary: &RunSummary) {
    if summary.cancelled {
        println!("{}", "run cancelled".yellow().bold());
    }
    println!(
        "{} {} / {} / {}",
        "Evaluation complete:".green().bold(),
        config.corpus,
        config.clf,
        config.feature_set
    );
    println!(
        "  folds:      {} ok, {} failed",
        summary.n_success(),
        summary.n_failed()
    );
    println!(
        "  mean UAR:   {:.4} (std {:.4})",
        summary.mean_uar, summary.std_uar
    );
    println!(
        "  pooled:     UAR {:.4}, accuracy {:.4}",
        summary.pooled_uar, summary.pooled_accuracy
    );
    for (bucket, uar) in &summary.bucket_uars {
        println!("  {:<11} UAR {:.4}", format!("{}:", bucket), uar);
    }
    for outcome in &summary.outcomes {
        if let FoldOutcome::Failure { fold_idx, kind, message, .. } = outcome {
            println!(
                "  {} fold {}: {} ({})",
                "failed".red(),
                fold_idx,
                kind,
                message
            );
        }
    }
    println!("  results:    {}", config.results.display());
}

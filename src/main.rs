//! 画像分類サービスのCLI
//!
//! `serve` でHTTP APIを起動するほか、初期化・学習・推論・状態確認・
//! エクスポートを単発で実行できる。

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::info;

use fruit_classifier_lib::logging::{init_logging, LogConfig};
use fruit_classifier_lib::ml::{BurnEngine, DatasetSource, InferenceService};
use fruit_classifier_lib::model::AppConfig;
use fruit_classifier_lib::{LifecycleError, LifecycleSettings, ModelLifecycleManager};

/// Image classifier lifecycle service
#[derive(Parser, Debug)]
#[command(name = "fruit_classifier")]
#[command(version)]
#[command(about = "Train, serve and export a small image classifier", long_about = None)]
struct Cli {
    /// Path to the JSON configuration file
    #[arg(short, long, global = true, env = "FRUIT_CLASSIFIER_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true, default_value = "false")]
    verbose: bool,

    /// Dataset root (`<root>/<label>/<image>`)
    #[arg(long, global = true, env = "FRUIT_CLASSIFIER_DATASET_ROOT")]
    dataset_root: Option<PathBuf>,

    /// Directory holding model/, labels.json and info.json
    #[arg(long, global = true, env = "FRUIT_CLASSIFIER_ARTIFACT_DIR")]
    artifact_dir: Option<PathBuf>,

    /// Subcommand to execute
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP API server
    Serve {
        /// Host to bind to
        #[arg(long, env = "FRUIT_CLASSIFIER_HOST")]
        host: Option<String>,

        /// Port to listen on
        #[arg(short, long, env = "FRUIT_CLASSIFIER_PORT")]
        port: Option<u16>,
    },

    /// Load the persisted model, or train one from the dataset if none exists
    Init,

    /// Train a new model from a dataset directory
    Train {
        /// Dataset directory (defaults to the configured dataset root)
        #[arg(short, long)]
        dataset: Option<PathBuf>,

        /// Number of training epochs
        #[arg(short, long)]
        epochs: Option<usize>,
    },

    /// Classify one image with the persisted model
    Predict {
        /// Image file to classify
        image: PathBuf,
    },

    /// Show the model status
    Status,

    /// Write the persisted model as a tar.gz archive
    Export {
        /// Output file
        #[arg(short, long)]
        output: PathBuf,
    },
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_config = if cli.verbose {
        LogConfig::verbose()
    } else {
        LogConfig::default()
    };
    init_logging(&log_config)?;

    let config_path = cli.config.clone().unwrap_or_else(AppConfig::default_path);
    let mut config = AppConfig::load_or_default(&config_path);
    if let Some(root) = cli.dataset_root {
        config.paths.dataset_root = root;
    }
    if let Some(dir) = cli.artifact_dir {
        config.paths.artifact_dir = dir;
    }
    if let Commands::Train { epochs: Some(epochs), .. } = &cli.command {
        config.training.num_epochs = *epochs;
    }
    config.log_summary();

    let lifecycle = ModelLifecycleManager::new(
        Arc::new(BurnEngine::new()),
        LifecycleSettings::from_config(&config),
    );

    match cli.command {
        Commands::Serve { host, port } => {
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            fruit_classifier_lib::server::serve(&config, lifecycle).await?;
        }

        Commands::Init => {
            let outcome = lifecycle.initialize().await?;
            print_json(&outcome)?;
        }

        Commands::Train { dataset, .. } => {
            let root = dataset.unwrap_or_else(|| config.paths.dataset_root.clone());
            let report = lifecycle.train_from(DatasetSource::Directory(root)).await?;
            print_json(&report)?;
        }

        Commands::Predict { image } => {
            lifecycle.load_persisted().await?;
            let bytes = std::fs::read(&image)
                .with_context(|| format!("Failed to read image: {:?}", image))?;
            let prediction = InferenceService::new(lifecycle.clone()).predict(bytes).await?;
            print_json(&prediction)?;
        }

        Commands::Status => {
            match lifecycle.load_persisted().await {
                Ok(_) | Err(LifecycleError::ArtifactNotFound(_)) => {}
                Err(e) => info!("保存済みモデルを読み込めませんでした: {}", e),
            }
            print_json(&lifecycle.status())?;
        }

        Commands::Export { output } => {
            if !lifecycle.store().exists() {
                return Err(LifecycleError::ArtifactNotFound(
                    lifecycle.store().root().display().to_string(),
                )
                .into());
            }
            let file = File::create(&output)
                .with_context(|| format!("Failed to create {:?}", output))?;
            let mut writer = lifecycle.exporter().export_to_writer(BufWriter::new(file))?;
            writer.flush()?;
            info!("モデルをエクスポートしました: {}", output.display());
        }
    }

    Ok(())
}

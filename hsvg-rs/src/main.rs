//! CLI entry point for hsvg-rs.

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use hsvg_rs::cli::{Cli, Commands};
use hsvg_rs::{HsvgConfig, Result, Trainer};

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { config } => {
            tracing::info!("Validating configuration: {}", config.display());
            let config = HsvgConfig::from_file(&config)?;
            config.validate()?;
            println!("✓ Configuration is valid");
            println!("  Levels: {}", config.n_level());
            println!(
                "  Frames: {} past, {} future, {} eval",
                config.training.n_past, config.training.n_future, config.training.n_eval
            );
            println!("  Run directory: {}", config.checkpoint_dir().display());
        }
        Commands::Train {
            config,
            preset,
            overrides,
        } => {
            match &config {
                Some(path) => tracing::info!("Starting training with config: {}", path.display()),
                None => tracing::info!("Starting training with preset: {}", preset),
            }
            let config = Commands::train_config(config.as_ref(), &preset, &overrides)?;
            tracing::info!("Random Seed: {}", config.seed);

            let mut trainer = Trainer::new(config)?;
            let history = trainer.train()?;
            if let Some(last) = history.last() {
                println!(
                    "✓ Finished epoch {} (rec {:.5}, kld {:.5})",
                    last.epoch, last.rec, last.kld
                );
            } else {
                println!("✓ Nothing to do: all epochs already trained");
            }
        }
        Commands::Init { output, preset } => {
            tracing::info!("Generating config for preset: {}", preset);
            let config = HsvgConfig::from_preset(&preset)?;
            config.to_file(&output)?;
            println!("✓ Configuration written to: {}", output.display());
        }
    }

    Ok(())
}

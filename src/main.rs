use anyhow::Context;
use clap::Parser;

use arbiter::cli::{self, Cli, Commands, SimulationConfig};
use arbiter::config::AppConfig;
use arbiter::logging::{init_logging, init_logging_simple};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::CheckConfig => {
            init_logging_simple();
            let config = AppConfig::load_from(&cli.config)
                .with_context(|| format!("loading config from {}", cli.config.display()))?;
            cli::check_config(&config)?;
        }
        Commands::Simulate {
            symbols,
            cycles,
            seed,
            equity,
        } => {
            let config = AppConfig::load_validated(&cli.config)?;
            init_logging(&config.logging);
            cli::run_simulation(
                &config,
                SimulationConfig {
                    symbols,
                    cycles,
                    seed,
                    equity,
                },
            )
            .await?;
        }
        Commands::Arbitrate {
            state,
            symbol,
            mandates,
        } => {
            init_logging_simple();
            cli::run_arbitrate(&symbol, &state, &mandates)?;
        }
    }

    Ok(())
}

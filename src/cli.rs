use clap::{Parser, Subcommand};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::Decimal;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::coordinator::{Pipeline, PipelineConfig, PipelineHandle};
use crate::domain::{
    AccountState, Direction, HotStateSnapshot, Mandate, MandateKind, MarketQuote, PositionState,
    Symbol,
};
use crate::error::{ArbiterError, Result};
use crate::exchange::{Dispatch, PaperVenue};
use crate::persistence::{JsonFileStore, MemoryStore, PositionStore};
use crate::platform::{arbitrate, HotStateReader, HotStateStore};

#[derive(Parser)]
#[command(name = "arbiter")]
#[command(version)]
#[command(about = "Mandate arbitration and position lifecycle core", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config directory
    #[arg(short, long, default_value = "config", env = "ARBITER_CONFIG_DIR")]
    pub config: PathBuf,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Load and validate configuration, then print the effective values
    CheckConfig,
    /// Run the pipeline against a paper venue with random mandates
    Simulate {
        /// Number of symbols
        #[arg(long, default_value = "4")]
        symbols: usize,
        /// Number of decision cycles
        #[arg(long, default_value = "50")]
        cycles: u64,
        /// RNG seed
        #[arg(long, default_value = "7")]
        seed: u64,
        /// Starting account equity
        #[arg(long, default_value = "100000")]
        equity: Decimal,
    },
    /// Arbitrate one symbol from the command line
    Arbitrate {
        /// Current position state (FLAT, ENTERING, OPEN, REDUCING, CLOSING)
        #[arg(long, default_value = "FLAT")]
        state: String,
        /// Symbol to arbitrate
        #[arg(long, default_value = "BTC")]
        symbol: String,
        /// KIND:AUTHORITY:SOURCE[:DIRECTION:QUANTITY], repeatable
        #[arg(long = "mandate", required = true)]
        mandates: Vec<String>,
    },
}

/// Print the validated configuration as TOML
pub fn check_config(config: &AppConfig) -> Result<()> {
    config.validate()?;
    let rendered = toml::to_string_pretty(config).map_err(|e| ArbiterError::Other(e.into()))?;
    println!("{}", rendered);
    println!("# configuration OK");
    Ok(())
}

/// Parse `KIND:AUTHORITY:SOURCE[:DIRECTION:QUANTITY]`
pub fn parse_mandate(symbol: &str, raw: &str) -> Result<Mandate> {
    let parts: Vec<&str> = raw.split(':').collect();
    if parts.len() != 3 && parts.len() != 5 {
        return Err(ArbiterError::InvalidMandate(format!(
            "expected KIND:AUTHORITY:SOURCE[:DIRECTION:QUANTITY], got {}",
            raw
        )));
    }

    let kind = MandateKind::try_from(parts[0]).map_err(ArbiterError::InvalidMandate)?;
    let authority: u32 = parts[1]
        .parse()
        .map_err(|_| ArbiterError::InvalidMandate(format!("bad authority: {}", parts[1])))?;
    let mut mandate = Mandate::new(symbol, kind, parts[2]).with_authority(authority);

    if parts.len() == 5 {
        let direction = Direction::try_from(parts[3]).map_err(ArbiterError::InvalidMandate)?;
        let quantity: Decimal = parts[4]
            .parse()
            .map_err(|_| ArbiterError::InvalidMandate(format!("bad quantity: {}", parts[4])))?;
        mandate = mandate.with_direction(direction).with_quantity(quantity);
    }

    mandate.validate()?;
    Ok(mandate)
}

/// One-shot pure arbitration, printed as JSON
pub fn run_arbitrate(symbol: &str, state: &str, args: &[String]) -> Result<()> {
    let state = PositionState::try_from(state).map_err(ArbiterError::InvalidConfig)?;
    let mandates = args
        .iter()
        .map(|arg| parse_mandate(symbol, arg))
        .collect::<Result<Vec<_>>>()?;

    let action = arbitrate(&Symbol::from(symbol), state, &mandates);
    println!("{}", serde_json::to_string_pretty(&action)?);
    Ok(())
}

/// Simulation parameters
#[derive(Debug, Clone)]
pub struct SimulationConfig {
    pub symbols: usize,
    pub cycles: u64,
    pub seed: u64,
    pub equity: Decimal,
}

/// Drive a pipeline with random prices and mandates against a paper venue
pub async fn run_simulation(app: &AppConfig, sim: SimulationConfig) -> Result<()> {
    let mut rng = StdRng::seed_from_u64(sim.seed);
    let symbols: Vec<Symbol> = (0..sim.symbols.max(1))
        .map(|i| Symbol::from(format!("SYM{}", i)))
        .collect();
    let mut marks: Vec<Decimal> = symbols
        .iter()
        .map(|_| Decimal::from(rng.gen_range(50i64..500)))
        .collect();

    let (mut writer, reader) = HotStateStore::new(market_snapshot(sim.equity, &symbols, &marks));
    let (venue, dispatches) = PaperVenue::new(256);
    let venue = Arc::new(venue);

    let store: Arc<dyn PositionStore> = match &app.persistence.path {
        Some(path) => Arc::new(JsonFileStore::open(path).await?),
        None => Arc::new(MemoryStore::new()),
    };

    let config = PipelineConfig {
        cycle_interval_ms: 0,
        ..app.pipeline.clone()
    };
    let pipeline = Pipeline::new(
        config,
        Arc::new(app.risk.clone()),
        reader.clone(),
        venue.clone(),
        store,
    );
    let report = pipeline.recover().await?;
    info!(restored = report.restored, "simulation starting");

    let handle = pipeline.handle();
    let monitor = pipeline.monitor();
    let runner = tokio::spawn(pipeline.run());
    let filler = tokio::spawn(fill_dispatches(
        dispatches,
        venue.clone(),
        handle.clone(),
        reader,
        sim.seed,
    ));

    let sources = ["trend", "meanrev", "risk", "carry"];
    for cycle in 0..sim.cycles {
        for mark in marks.iter_mut() {
            let step = Decimal::new(rng.gen_range(-200..=200), 4);
            *mark = (*mark * (Decimal::ONE + step)).max(Decimal::ONE);
        }
        writer.publish(market_snapshot(sim.equity, &symbols, &marks));

        for _ in 0..rng.gen_range(0..=symbols.len()) {
            let symbol = symbols[rng.gen_range(0..symbols.len())].clone();
            let source = sources[rng.gen_range(0..sources.len())];
            let authority: u32 = rng.gen_range(0..5);
            let mandate = match rng.gen_range(0..10) {
                0 => Mandate::new(symbol, MandateKind::Exit, source),
                1 => Mandate::new(symbol, MandateKind::Block, source),
                2 | 3 => Mandate::new(symbol, MandateKind::Reduce, source)
                    .with_quantity(Decimal::from(rng.gen_range(1i64..5))),
                4..=7 => {
                    let direction = if rng.gen_bool(0.5) {
                        Direction::Long
                    } else {
                        Direction::Short
                    };
                    Mandate::entry(
                        symbol,
                        source,
                        direction,
                        Decimal::from(rng.gen_range(1i64..20)),
                    )
                }
                _ => Mandate::new(symbol, MandateKind::Hold, source),
            };
            handle.submit_mandate(mandate.with_authority(authority))?;
        }

        let summary = handle.run_cycle().await?;
        debug!(
            cycle,
            dispatched = summary.dispatched(),
            rejected = summary.count("rejected"),
            "cycle complete"
        );
        // Let the paper venue settle before the next cycle
        tokio::task::yield_now().await;
    }

    let stats = monitor.stats();
    let risk = monitor.risk().await;
    let positions = monitor.positions();

    handle.shutdown().await?;
    drop(handle);
    match runner.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "pipeline stopped with error"),
        Err(e) => warn!(error = %e, "pipeline task failed"),
    }
    filler.abort();

    println!("{}", serde_json::to_string_pretty(&stats)?);
    if let Some(risk) = risk {
        println!("{}", serde_json::to_string_pretty(&risk.metrics)?);
    }
    for position in positions.values().filter(|p| !p.is_flat()) {
        println!(
            "{:<8} {:<9} {:>10} @ {}",
            position.symbol(),
            position.state(),
            position.signed_quantity(),
            position
                .entry_price()
                .map(|p| p.round_dp(4).to_string())
                .unwrap_or_else(|| "-".to_string())
        );
    }
    Ok(())
}

fn market_snapshot(equity: Decimal, symbols: &[Symbol], marks: &[Decimal]) -> HotStateSnapshot {
    symbols
        .iter()
        .zip(marks)
        .fold(
            HotStateSnapshot::new(AccountState::new(equity)),
            |snapshot, (symbol, mark)| snapshot.with_quote(symbol.clone(), MarketQuote::new(*mark)),
        )
}

/// Paper venue driver: fill at the current mark, reject one order in ten
async fn fill_dispatches(
    mut dispatches: mpsc::Receiver<Dispatch>,
    venue: Arc<PaperVenue>,
    handle: PipelineHandle,
    reader: HotStateReader,
    seed: u64,
) {
    let mut rng = StdRng::seed_from_u64(seed.wrapping_add(1));
    while let Some(dispatch) = dispatches.recv().await {
        let (_, snapshot) = reader.read();
        let mark = snapshot
            .quote(&dispatch.symbol)
            .map(|q| q.mark_price)
            .unwrap_or(Decimal::ONE);

        let report = if rng.gen_ratio(1, 10) {
            venue.reject(&dispatch, "paper venue: simulated reject")
        } else {
            venue.fill(&dispatch, mark)
        };
        if let Err(e) = handle.report_execution(report).await {
            debug!(symbol = %dispatch.symbol, error = %e, "report not applied");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_parse_mandate() {
        let exit = parse_mandate("BTC", "exit:3:risk").unwrap();
        assert_eq!(exit.kind, MandateKind::Exit);
        assert_eq!(exit.authority, 3);
        assert_eq!(exit.source_id, "risk");

        let entry = parse_mandate("BTC", "ENTRY:1:trend:long:2.5").unwrap();
        assert_eq!(entry.direction, Some(Direction::Long));
        assert_eq!(entry.quantity, dec!(2.5));

        assert!(parse_mandate("BTC", "entry:1:trend").is_err());
        assert!(parse_mandate("BTC", "exit:x:risk").is_err());
        assert!(parse_mandate("BTC", "exit").is_err());
    }

    #[test]
    fn test_cli_parses_arbitrate() {
        let cli = Cli::try_parse_from([
            "arbiter",
            "arbitrate",
            "--state",
            "open",
            "--mandate",
            "reduce:2:a",
            "--mandate",
            "exit:0:b",
        ])
        .unwrap();
        match cli.command {
            Commands::Arbitrate {
                state, mandates, ..
            } => {
                assert_eq!(state, "open");
                assert_eq!(mandates.len(), 2);
            }
            _ => panic!("expected arbitrate"),
        }
    }
}

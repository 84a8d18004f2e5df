use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use depinguard::config::{GuardConfig, LogFormat, LoggingConfig};
use depinguard::ledger::{verify_records, RecordMirror};
use depinguard::pipeline::{Guard, Outcome};

#[derive(Parser)]
#[command(
    name = "depinguard",
    about = "Streaming sensor anomaly scoring with a tamper-evident event ledger",
    version,
    long_about = None
)]
struct Cli {
    /// Config file (defaults to $DEPINGUARD_CONFIG, then /etc/depinguard/depinguard.toml)
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (API server + pipeline + idle sweep)
    Serve {
        /// Bind address, overrides [server].bind
        #[arg(long)]
        bind: Option<String>,
    },

    /// Verify a mirrored ledger database offline
    Verify {
        /// SQLite mirror file, overrides [ledger].mirror_path
        #[arg(long)]
        db: Option<PathBuf>,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Run newline-delimited JSON readings through the pipeline
    Replay {
        /// Input file, one reading per line
        input: PathBuf,

        /// Print every outcome as a JSON line
        #[arg(long)]
        json: bool,
    },

    /// Drive the pipeline with a synthetic device fleet
    Simulate {
        /// Number of devices
        #[arg(long, default_value = "5")]
        devices: usize,

        /// Total readings to generate
        #[arg(long, default_value = "200")]
        count: usize,

        /// Probability that a reading is an injected anomaly
        #[arg(long, default_value = "0.05")]
        anomaly_rate: f64,

        /// RNG seed for reproducible runs
        #[arg(long)]
        seed: Option<u64>,

        /// Print every outcome as a JSON line
        #[arg(long)]
        json: bool,
    },

    /// Fit scaler bounds from known-normal readings
    FitScaler {
        /// Input file, one reading per line
        input: PathBuf,

        /// Where to write the scaler JSON
        #[arg(long, default_value = "scaler.json")]
        output: PathBuf,
    },

    /// Derive the model threshold from known-normal readings
    Calibrate {
        /// Input file, one reading per line
        input: PathBuf,

        /// Write the threshold to this file
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

fn init_tracing(logging: &LoggingConfig) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));

    match logging.format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init(),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init(),
    }
}

fn print_outcome(outcome: &Outcome, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(outcome)?);
        return Ok(());
    }
    let v = &outcome.verdict;
    let score = v
        .score
        .map(|s| format!("{s:.5}"))
        .unwrap_or_else(|| "-".to_string());
    let record = outcome
        .record
        .as_ref()
        .map(|r| format!("#{}", r.index))
        .unwrap_or_default();
    println!(
        "{:<14} | {:<10} | {:<9} | {:<14} | {:<7} | {}",
        v.device_id,
        format!("{:?}", v.state),
        score,
        format!("{:?}", v.reason),
        record,
        v.recommendation
    );
    Ok(())
}

fn print_header(json: bool) {
    if !json {
        println!(
            "{:<14} | {:<10} | {:<9} | {:<14} | {:<7} | Recommendation",
            "Device", "State", "Score", "Reason", "Record"
        );
        println!("{:-<14}-|-{:-<10}-|-{:-<9}-|-{:-<14}-|-{:-<7}-|-{:-<30}", "", "", "", "", "", "");
    }
}

fn print_summary(guard: &Guard, json: bool) {
    if json {
        return;
    }
    let c = guard.get_counters();
    let report = guard.verify_chain();
    println!();
    println!("Readings:   {}", c.total_readings);
    println!("Anomalies:  {}", c.total_anomalies);
    println!("Records:    {}", c.records_appended);
    println!("Rejected:   {}", c.rejected_readings);
    println!("Degraded:   {}", c.scorer_degraded);
    println!("Chain:      {}", if report.ok { "ok" } else { "BROKEN" });
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = GuardConfig::load_or_default(cli.config.as_deref())?;
    init_tracing(&config.logging);

    match cli.command {
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            tracing::info!(bind = %config.server.bind, "Starting depinguard daemon");
            depinguard::serve(config).await?;
        }
        Commands::Verify { db, json } => {
            let path = db
                .or(config.ledger.mirror_path)
                .context("no ledger database given (use --db or set [ledger].mirror_path)")?;
            anyhow::ensure!(path.exists(), "ledger database not found: {}", path.display());
            let mirror = depinguard::storage::SqliteMirror::open(&path)?;
            let records = mirror.load_all()?;
            let report = verify_records(&records);

            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else if report.ok {
                println!("chain ok ({} records)", report.length);
            } else if let Some(index) = report.first_bad_index {
                println!("chain BROKEN at record {index} of {}", report.length);
            }
            if !report.ok {
                std::process::exit(2);
            }
        }
        Commands::Replay { input, json } => {
            config.ledger.mirror_path = None;
            let readings = depinguard::calibrate::read_readings(&input)?;
            let guard = Guard::from_config(&config).await?;
            print_header(json);
            for reading in &readings {
                match guard.process(reading).await {
                    Ok(outcome) => print_outcome(&outcome, json)?,
                    Err(e) => tracing::warn!(device_id = %reading.device_id, code = e.code(), error = %e, "reading skipped"),
                }
            }
            print_summary(&guard, json);
        }
        Commands::Simulate {
            devices,
            count,
            anomaly_rate,
            seed,
            json,
        } => {
            let guard = Guard::from_config(&config).await?;
            let mut fleet = depinguard::simulate::Fleet::new(devices, anomaly_rate, seed)?;
            tracing::info!(devices = fleet.devices().len(), count, anomaly_rate, "Starting simulation");
            print_header(json);
            // One reading per device per round, processed concurrently.
            let mut remaining = count;
            while remaining > 0 {
                let round = remaining.min(fleet.devices().len());
                let batch: Vec<_> = (0..round).map(|_| fleet.next_reading().reading).collect();
                let outcomes = futures::future::join_all(batch.iter().map(|r| guard.process(r))).await;
                for outcome in outcomes {
                    print_outcome(&outcome?, json)?;
                }
                remaining -= round;
            }
            guard.flush().await;
            print_summary(&guard, json);
        }
        Commands::FitScaler { input, output } => {
            let readings = depinguard::calibrate::read_readings(&input)?;
            let scaler = depinguard::calibrate::fit_scaler(
                &readings,
                config.window.features,
                config.scaler.feature_range,
            )?;
            scaler.save(&output)?;
            println!(
                "scaler written to {} (min {:?}, max {:?})",
                output.display(),
                scaler.data_min(),
                scaler.data_max()
            );
        }
        Commands::Calibrate { input, output } => {
            let readings = depinguard::calibrate::read_readings(&input)?;
            let calibration = depinguard::calibrate::calibrate(&config, &readings).await?;
            let s = calibration.summary;
            println!("sequences: {}", s.count);
            println!("mean:      {:.6}", s.mean);
            println!("std_dev:   {:.6}", s.std_dev);
            println!("threshold: {:.6}", calibration.threshold);
            if let Some(path) = output {
                depinguard::calibrate::write_threshold(&path, calibration.threshold)?;
                println!("threshold written to {}", path.display());
            }
        }
    }

    Ok(())
}

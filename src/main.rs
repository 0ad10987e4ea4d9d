use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;

use gridpam::anomaly::store::AnomalyColumns;
use gridpam::classify::{
    extract_feeders, AmiClassifier, Classifier, EdnaClassifier, ScadaClassifier, Selection,
    Ticket, TicketClassifier, TimeBounds,
};
use gridpam::config::PipelineConfig;
use gridpam::detect::RollingWindowDetector;
use gridpam::signature::{FeederTable, SignatureTable, SignatureTransformer, TargetAssigner};
use gridpam::storage;
use gridpam::table::EventTable;

#[derive(Parser)]
#[command(
    name = "gridpam",
    about = "Anomaly extraction and outage signatures for distribution grid feeders",
    version,
    long_about = None
)]
struct Cli {
    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    json_logs: bool,

    /// Pipeline configuration (TOML); falls back to GRIDPAM_CONFIG
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Extract anomalies from one source's canonical event table
    Extract {
        /// Source the table came from
        #[arg(long, value_enum)]
        source: Source,

        /// Event table (JSON with `columns` and `records`)
        #[arg(long)]
        input: PathBuf,

        /// Feeder metadata (JSON array); needed for AMI customer counts
        #[arg(long)]
        feeders: Option<PathBuf>,

        /// `default`, `all`, or a comma separated list of anomaly names
        #[arg(long)]
        anomalies: Option<String>,

        /// Drop anomalies before this RFC 3339 instant
        #[arg(long)]
        start: Option<DateTime<Utc>>,

        /// Drop anomalies after this RFC 3339 instant
        #[arg(long)]
        end: Option<DateTime<Utc>>,

        /// Output file for the anomaly columns; stdout when omitted
        #[arg(long)]
        output: Option<PathBuf>,

        /// Also persist to this SQLite database
        #[arg(long)]
        db: Option<PathBuf>,
    },

    /// Build signature rows from extracted anomalies
    Build {
        /// Anomaly columns written by `extract` (JSON)
        #[arg(long)]
        anomalies: PathBuf,

        /// Feeder metadata (JSON array)
        #[arg(long)]
        feeders: PathBuf,

        /// Ticket event table for initial labels
        #[arg(long)]
        tickets: Option<PathBuf>,

        /// Relabel with the configured lookahead/lookback window
        #[arg(long, requires = "tickets")]
        relabel: bool,

        /// Worker partitions; negative counts back from the core count
        #[arg(long, allow_hyphen_values = true)]
        jobs: Option<i64>,

        /// Output file for the signature table; stdout when omitted
        #[arg(long)]
        output: Option<PathBuf>,

        /// Also persist to this SQLite database
        #[arg(long)]
        db: Option<PathBuf>,
    },

    /// Assign an outage target pair to a built signature table
    Label {
        /// Signature table written by `build` (JSON)
        #[arg(long)]
        signatures: PathBuf,

        /// Ticket event table
        #[arg(long)]
        tickets: PathBuf,

        /// Hours before a power-off a row may precede it
        #[arg(long)]
        lookahead: Option<f64>,

        /// Hours after a power-off a row may follow it
        #[arg(long)]
        lookback: Option<f64>,

        /// Outage column name
        #[arg(long)]
        outage: Option<String>,

        /// Ticket column name
        #[arg(long)]
        ticket: Option<String>,

        /// Output file for the labelled table; stdout when omitted
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Source {
    Scada,
    Ami,
    Edna,
    Tickets,
}

impl Source {
    fn as_str(self) -> &'static str {
        match self {
            Source::Scada => "scada",
            Source::Ami => "ami",
            Source::Edna => "edna",
            Source::Tickets => "tickets",
        }
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("failed to parse {}", path.display()))
}

fn write_json<T: Serialize>(output: Option<&Path>, value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value)?;
    match output {
        Some(path) => {
            std::fs::write(path, text)
                .with_context(|| format!("failed to write {}", path.display()))?;
            tracing::info!(path = %path.display(), "output written");
        }
        None => println!("{}", text),
    }
    Ok(())
}

fn open_db(path: &Path, config: &PipelineConfig) -> Result<storage::Pool> {
    storage::open_pool(&path.to_string_lossy(), &config.storage)
        .with_context(|| format!("failed to open database {}", path.display()))
}

fn load_tickets(path: &Path) -> Result<Vec<Ticket>> {
    let table = EventTable::load(path)?;
    Ok(Ticket::load_all(&table)?)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);
    let config = PipelineConfig::resolve(cli.config.as_deref())?;

    match cli.command {
        Commands::Extract {
            source,
            input,
            feeders,
            anomalies,
            start,
            end,
            output,
            db,
        } => {
            tracing::info!(source = source.as_str(), input = %input.display(), "Extracting anomalies");
            let table = EventTable::load(&input)?;
            let classifier: Box<dyn Classifier> = match source {
                Source::Scada => Box::new(ScadaClassifier),
                Source::Tickets => Box::new(TicketClassifier),
                Source::Edna => Box::new(EdnaClassifier::new(RollingWindowDetector::new(
                    config.extract.window_hours,
                ))),
                Source::Ami => {
                    let customers = match &feeders {
                        Some(path) => FeederTable::load(path)?.customer_counts(),
                        None => {
                            tracing::warn!("no feeder metadata given, AMI percentages unavailable");
                            Default::default()
                        }
                    };
                    Box::new(AmiClassifier::new(customers))
                }
            };
            let selection = anomalies
                .as_deref()
                .map(Selection::parse)
                .unwrap_or_else(|| config.selection(source.as_str()));

            let bounds = TimeBounds::new(
                start.or(config.extract.start),
                end.or(config.extract.end),
            );

            let feeder_ids = classifier.feeders(&table)?;
            let store =
                extract_feeders(classifier.as_ref(), &table, &feeder_ids, &selection, &bounds)?;

            if let Some(path) = db.as_deref().or(config.storage.db_path.as_deref()) {
                storage::save_anomalies(&open_db(path, &config)?, &store)?;
            }
            write_json(output.as_deref(), &store.to_columns()?)?;
        }
        Commands::Build {
            anomalies,
            feeders,
            tickets,
            relabel,
            jobs,
            output,
            db,
        } => {
            let records = read_json::<AnomalyColumns>(&anomalies)?.into_records();
            let feeders = FeederTable::load(&feeders)?
                .with_min_customers(config.feeders.min_customers);
            let tickets = tickets.as_deref().map(load_tickets).transpose()?;
            let n_jobs = jobs.unwrap_or(config.signatures.n_jobs);
            tracing::info!(anomalies = records.len(), feeders = feeders.len(), n_jobs, "Building signatures");

            let mut transformer = SignatureTransformer::new(
                config.column_specs()?,
                config.signatures.anomaly_map.clone(),
                feeders,
                n_jobs,
            )?
            .with_seed(config.signatures.seed)
            .with_target(config.targets.columns());

            transformer.transform(&records, tickets.as_deref()).await?;
            if let (true, Some(tickets)) = (relabel, &tickets) {
                transformer
                    .add_target(tickets, &config.targets.assigner())
                    .await?;
            }
            let table = transformer
                .into_table()
                .context("signature table missing after build")?;

            if let Some(path) = db.as_deref().or(config.storage.db_path.as_deref()) {
                storage::save_signatures(&open_db(path, &config)?, &table)?;
            }
            write_json(output.as_deref(), &table)?;
        }
        Commands::Label {
            signatures,
            tickets,
            lookahead,
            lookback,
            outage,
            ticket,
            output,
        } => {
            let mut table: SignatureTable = read_json(&signatures)?;
            let tickets = load_tickets(&tickets)?;
            let mut target = config.targets.clone();
            if let Some(h) = lookahead {
                target.lookahead_hours = h;
            }
            if let Some(h) = lookback {
                target.lookback_hours = h;
            }
            if let Some(name) = outage {
                target.outage = name;
            }
            if let Some(name) = ticket {
                target.ticket = name;
            }
            let assigner: TargetAssigner = target.assigner();
            tracing::info!(rows = table.len(), tickets = tickets.len(), outage = %target.outage, "Labelling signatures");
            assigner.assign(&mut table, &tickets);
            write_json(output.as_deref(), &table)?;
        }
    }

    Ok(())
}

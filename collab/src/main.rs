use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::PathBuf;
use tracing::{info, warn};

use collab_analytics::{
    metrics, parse_events, EngagementHistoryRecord, HistorySink, JsonLinesHistory, Replayer,
    SessionEvent, SessionId,
};
use collab_core::{init_logging, load_config};

#[derive(Parser, Debug)]
#[command(name = "collab")]
#[command(about = "Adaptive quality and engagement analytics for media sessions", long_about = None)]
struct Cli {
    /// Config file (YAML, TOML or JSON)
    #[arg(long, global = true, env = "COLLAB_CONFIG")]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a recorded event log through a session and print what it emits
    Replay {
        /// JSON-lines event log
        file: PathBuf,

        /// Session id used for the replayed session
        #[arg(long, default_value = "replay")]
        session: String,

        /// Print quality directives only
        #[arg(long)]
        quality_only: bool,

        /// Append engagement history records to this file
        #[arg(long)]
        history: Option<PathBuf>,

        /// Dump Prometheus metrics to stderr when done
        #[arg(long)]
        metrics: bool,
    },
    /// Print the effective configuration as JSON
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // 1. Load configuration (file, then environment overrides)
    let config = load_config(cli.config.as_deref())?;

    // 2. Initialize logging
    init_logging(&config.logging)?;

    match cli.command {
        Command::Replay {
            file,
            session,
            quality_only,
            history,
            metrics: dump_metrics,
        } => {
            let reader = File::open(&file)
                .with_context(|| format!("Failed to open event log {}", file.display()))?;
            let events = parse_events(BufReader::new(reader))?;
            info!(path = %file.display(), events = events.len(), "Event log loaded");

            let replayer = Replayer::new(SessionId::from(session.as_str()), config.analytics)?;
            let outcome = replayer.run(&events);

            let stdout = std::io::stdout();
            let mut out = stdout.lock();
            let mut records = Vec::new();
            for event in &outcome.events {
                if let SessionEvent::Engagement(report) = event {
                    records.extend(EngagementHistoryRecord::from_report(report));
                    if quality_only {
                        continue;
                    }
                }
                serde_json::to_writer(&mut out, event)?;
                out.write_all(b"\n")?;
            }
            out.flush()?;

            if let Some(path) = history {
                let file = std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&path)
                    .with_context(|| format!("Failed to open history file {}", path.display()))?;
                let sink = JsonLinesHistory::new(BufWriter::new(file));
                let written = records.len();
                sink.record(records).await?;
                info!(path = %path.display(), records = written, "Engagement history written");
            }

            if outcome.rejected > 0 {
                warn!(rejected = outcome.rejected, "Some log entries could not be applied");
            }
            info!(
                emitted = outcome.events.len(),
                sessions_ended = outcome.sessions_ended,
                final_tier = ?outcome.final_snapshot.as_ref().map(|s| s.tier),
                "Replay complete"
            );

            if dump_metrics {
                eprint!("{}", metrics::gather()?);
            }
        }
        Command::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

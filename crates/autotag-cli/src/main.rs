mod display;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use autotag_core::{Category, ServiceType, Settings, Thresholds};
use autotag_service::{ServiceError, TaggingService};
use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(name = "autotag", version)]
#[command(about = "Tag support conversations by fusing rule, model and human signals")]
struct Cli {
    #[command(flatten)]
    settings: SettingsArgs,

    /// Print results as JSON instead of cards
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct SettingsArgs {
    /// Confidence at or above which decisions are committed
    #[arg(long, env = "AUTOTAG_HIGH_THRESHOLD", default_value_t = Thresholds::DEFAULT_HIGH)]
    high_threshold: f64,

    /// Confidence below which the user is asked to clarify
    #[arg(long, env = "AUTOTAG_LOW_THRESHOLD", default_value_t = Thresholds::DEFAULT_LOW)]
    low_threshold: f64,

    #[arg(long, env = "AUTOTAG_RULES_PATH", default_value = "data/rules.yaml")]
    rules_path: PathBuf,

    #[arg(long, env = "AUTOTAG_CORPUS_PATH", default_value = "data/sample_messages.jsonl")]
    corpus_path: PathBuf,

    #[arg(long, env = "AUTOTAG_MODELS_DIR", default_value = "data/models")]
    models_dir: PathBuf,

    /// DuckDB file holding tickets
    #[arg(long, env = "AUTOTAG_DATABASE_PATH", default_value = "data/autotag.duckdb")]
    database_path: PathBuf,

    /// Keep tickets in memory for this invocation only
    #[arg(long)]
    in_memory: bool,

    #[arg(long, env = "AUTOTAG_ADJUDICATOR_TIMEOUT_MS", default_value_t = 5_000)]
    adjudicator_timeout_ms: u64,

    /// Chat-completions endpoint; the keyword heuristic is used when unset
    #[arg(long, env = "AUTOTAG_ADJUDICATOR_URL")]
    adjudicator_url: Option<String>,

    #[arg(long, env = "AUTOTAG_ADJUDICATOR_MODEL")]
    adjudicator_model: Option<String>,

    #[arg(long, env = "AUTOTAG_ADJUDICATOR_API_KEY", hide_env_values = true)]
    adjudicator_api_key: Option<String>,
}

impl SettingsArgs {
    fn into_settings(self) -> Settings {
        Settings {
            high_threshold: self.high_threshold,
            low_threshold: self.low_threshold,
            rules_path: self.rules_path,
            corpus_path: self.corpus_path,
            models_dir: self.models_dir,
            database_path: (!self.in_memory).then_some(self.database_path),
            adjudicator_timeout_ms: self.adjudicator_timeout_ms,
            adjudicator_url: self.adjudicator_url,
            adjudicator_model: self.adjudicator_model,
            adjudicator_api_key: self.adjudicator_api_key,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Ingest a message and tag its conversation
    Ingest {
        /// Conversation (thread) identifier
        #[arg(short, long)]
        conversation: String,

        /// Sender role: user, agent or bot
        #[arg(short, long, default_value = "user")]
        sender: String,

        /// Message text
        #[arg(required = true, num_args = 1..)]
        text: Vec<String>,
    },
    /// List tickets, most recently updated first
    List,
    /// Show a ticket with its messages and tag history
    Show { ticket_id: String },
    /// Force a tag as an agent
    Override {
        ticket_id: String,
        #[arg(long)]
        service_type: ServiceType,
        #[arg(long)]
        category: Category,
        #[arg(long)]
        reason: String,
    },
    /// Answer a ticket's clarifying question
    Clarify { ticket_id: String, choice: String },
    /// Retrain the classifier from the sample corpus
    Retrain,
    /// Tagging metrics over all tickets
    Metrics,
    /// Ingest every sample-corpus record as its own conversation
    Seed,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt::init();
    tracing::debug!("autotag v{}", env!("CARGO_PKG_VERSION"));

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            exit_code(&e)
        }
    }
}

/// Distinct exit codes per failure class so scripts can tell them apart.
fn exit_code(err: &anyhow::Error) -> ExitCode {
    match err.downcast_ref::<ServiceError>() {
        Some(ServiceError::Validation(_)) => ExitCode::from(2),
        Some(ServiceError::NotFound(_)) => ExitCode::from(3),
        Some(e) if e.is_transient() => ExitCode::from(75),
        _ => ExitCode::FAILURE,
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let settings = cli.settings.into_settings();
    if let Some(dir) = settings.database_path.as_ref().and_then(|p| p.parent())
        && !dir.as_os_str().is_empty()
    {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating {}", dir.display()))?;
    }
    let service = TaggingService::from_settings(&settings)?;
    let json = cli.json;

    match cli.command {
        Command::Ingest {
            conversation,
            sender,
            text,
        } => {
            let outcome = service
                .ingest(&conversation, &sender, &text.join(" "))
                .await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&outcome)?);
            } else {
                display::print_ingest(&outcome);
            }
        }
        Command::List => {
            let tickets = service.list_tickets()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&tickets)?);
            } else {
                display::print_ticket_list(&tickets);
            }
        }
        Command::Show { ticket_id } => {
            let detail = service.get_ticket(&ticket_id)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&detail)?);
            } else {
                display::print_ticket_card(&detail);
            }
        }
        Command::Override {
            ticket_id,
            service_type,
            category,
            reason,
        } => {
            let detail = service
                .override_tags(&ticket_id, service_type, category, &reason)
                .await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&detail)?);
            } else {
                display::print_ticket_card(&detail);
            }
        }
        Command::Clarify { ticket_id, choice } => {
            let detail = service.resolve_clarifier(&ticket_id, &choice).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&detail)?);
            } else {
                display::print_ticket_card(&detail);
            }
        }
        Command::Retrain => {
            let metrics = service.retrain().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&metrics)?);
            } else {
                display::print_training(&metrics);
            }
        }
        Command::Metrics => {
            let metrics = service.metrics()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&metrics)?);
            } else {
                display::print_metrics(&metrics);
            }
        }
        Command::Seed => {
            let report = service.seed().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!(
                    "Seeded {} conversations ({} already present)",
                    report.ingested, report.skipped
                );
            }
        }
    }

    Ok(())
}

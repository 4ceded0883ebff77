//! Conclave CLI
//!
//! Operational entrypoint for the orchestration core: pre-flight key
//! validation, one-shot agent requests (with optional streaming), full
//! deliberations, and observability snapshots.

use std::io::Write;
use std::path::Path;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use dotenv::dotenv;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use conclave::deliberation::{DeliberationOptions, EnrichmentTarget, VotingStrategy};
use conclave::models::{AgentRequest, Provider};
use conclave::Orchestrator;

#[derive(Debug, Parser)]
#[command(name = "conclave", about = "Multi-provider LLM agent orchestration core")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ProviderArg {
    Deepseek,
    Qwen,
    Perplexity,
}

impl From<ProviderArg> for Provider {
    fn from(arg: ProviderArg) -> Self {
        match arg {
            ProviderArg::Deepseek => Provider::Reasoner,
            ProviderArg::Qwen => Provider::Technical,
            ProviderArg::Perplexity => Provider::Research,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StrategyArg {
    Unanimous,
    Majority,
    Supermajority,
    Weighted,
}

impl From<StrategyArg> for VotingStrategy {
    fn from(arg: StrategyArg) -> Self {
        match arg {
            StrategyArg::Unanimous => VotingStrategy::Unanimous,
            StrategyArg::Majority => VotingStrategy::Majority,
            StrategyArg::Supermajority => VotingStrategy::Supermajority,
            StrategyArg::Weighted => VotingStrategy::Weighted,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Validate every registered API key with a minimal probe.
    Preflight,
    /// Send a single request to one provider.
    Ask {
        #[arg(long, value_enum)]
        provider: ProviderArg,
        #[arg(long, default_value = "analyze")]
        task_type: String,
        prompt: String,
        /// Request chain-of-thought reasoning (cost-guarded).
        #[arg(long)]
        thinking: bool,
        /// Stream deltas to stdout as they arrive.
        #[arg(long)]
        stream: bool,
    },
    /// Run a multi-agent deliberation over a question.
    Deliberate {
        question: String,
        /// Participating agents (defaults to all three providers).
        #[arg(long, value_enum, value_delimiter = ',')]
        agents: Vec<ProviderArg>,
        #[arg(long, default_value_t = 3)]
        max_rounds: usize,
        #[arg(long, default_value_t = 0.7)]
        min_confidence: f64,
        #[arg(long, value_enum, default_value_t = StrategyArg::Majority)]
        strategy: StrategyArg,
        /// Enrich round-1 prompts with market context for this symbol.
        #[arg(long)]
        symbol: Option<String>,
        #[arg(long, default_value = "generic", requires = "symbol")]
        strategy_type: String,
        /// Wall-clock budget in seconds.
        #[arg(long)]
        deadline_secs: Option<u64>,
    },
    /// Print the observability snapshot (pools, breakers, counters).
    Snapshot,
}

#[tokio::main]
async fn main() -> Result<()> {
    load_env();
    init_tracing();

    let cli = Cli::parse();
    let orchestrator = Orchestrator::from_env();

    match cli.command {
        Command::Preflight => {
            let results = orchestrator.preflight_validate().await;
            println!("{}", serde_json::to_string_pretty(&results)?);
        }
        Command::Ask {
            provider,
            task_type,
            prompt,
            thinking,
            stream,
        } => {
            let mut request = AgentRequest::new(provider.into(), task_type, prompt).with_thinking(thinking);
            request.stream = stream;

            let response = if stream {
                orchestrator
                    .stream_request(
                        &request,
                        |_| {},
                        |chunk| {
                            print!("{chunk}");
                            let _ = std::io::stdout().flush();
                        },
                    )
                    .await
            } else {
                orchestrator.send_request(&request).await
            };

            if stream {
                println!();
            } else if response.success {
                println!("{}", response.content);
            }

            if !response.success {
                eprintln!(
                    "request failed: {} ({:?})",
                    response.error.as_deref().unwrap_or("unknown"),
                    response.failure_kind
                );
                std::process::exit(1);
            }
            info!("Completed in {:.0}ms", response.latency_ms);
        }
        Command::Deliberate {
            question,
            agents,
            max_rounds,
            min_confidence,
            strategy,
            symbol,
            strategy_type,
            deadline_secs,
        } => {
            let agents: Vec<Provider> = if agents.is_empty() {
                Provider::ALL.to_vec()
            } else {
                agents.into_iter().map(Provider::from).collect()
            };
            let options = DeliberationOptions {
                max_rounds,
                min_confidence,
                voting_strategy: strategy.into(),
                deadline: deadline_secs.map(std::time::Duration::from_secs),
                enrichment: symbol.map(|symbol| EnrichmentTarget {
                    symbol,
                    strategy_type,
                }),
            };

            let result = orchestrator.deliberate(&question, &agents, options).await;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Command::Snapshot => {
            let snapshot = orchestrator.get_snapshot();
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }
    }

    Ok(())
}

fn load_env() {
    // Standard dotenv search (cwd + parents), then the manifest dir for
    // runs with --manifest-path from elsewhere.
    let _ = dotenv();

    let manifest_dir = Path::new(env!("CARGO_MANIFEST_DIR"));
    let candidate = manifest_dir.join(".env");
    if candidate.exists() {
        let _ = dotenv::from_path(&candidate);
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "conclave=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

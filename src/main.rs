mod doctor;
mod offline;

use std::io::{self, BufRead};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{CommandFactory, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use fingraph_agent::{
    ChannelObserver, CompiledGraph, FallbackQueryParser, GraphExecutor, IntentClassifier,
    PipelineBuilder, ProgressTracker, Route, RuleBasedQueryParser, StageKind,
};
use fingraph_core::config::AppConfig;
use fingraph_core::state::StateRecord;

use offline::OfflineAgent;

#[derive(Parser)]
#[command(name = "fingraph", version, about = "Multi-agent financial research orchestration")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "fingraph.toml")]
    config: PathBuf,

    /// Session ID (auto-generated if not provided)
    #[arg(short, long)]
    session: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Classify a query and show which optional stages would run
    Classify {
        /// Comma-separated ticker symbols; extracted from the query if omitted
        #[arg(long, value_delimiter = ',')]
        symbols: Vec<String>,
        #[arg(trailing_var_arg = true)]
        query: Vec<String>,
    },
    /// Extract symbols, intent, and entities from a query
    Parse {
        /// Prior conversation to resolve references against
        #[arg(long)]
        context: Option<String>,
        #[arg(trailing_var_arg = true)]
        query: Vec<String>,
    },
    /// Print the compiled execution plan
    Plan,
    /// Run the pipeline with offline agents and print the final state
    Run {
        #[arg(long, value_delimiter = ',')]
        symbols: Vec<String>,
        /// Also print the per-stage trace and execution order
        #[arg(long)]
        trace: bool,
        #[arg(trailing_var_arg = true)]
        query: Vec<String>,
    },
    /// Show current configuration
    Config,
    /// Check configuration and graph wiring
    Doctor,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("fingraph=info,warn")),
        )
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    // Handle completions before config loading
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "fingraph", &mut io::stdout());
        return Ok(());
    }

    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Classify { symbols, query } => {
            let query = read_query(query);
            let classifier = IntentClassifier::new(&config.classifier).with_parser(parser(&config));
            let classification = classifier.classify(&query, &normalize(symbols), None).await;
            let route = Route::from_classification(
                classification.query_type,
                &classification.intent_flags,
            );
            println!("{}", serde_json::to_string_pretty(&classification)?);
            println!("route: {}", route);
        }
        Commands::Parse { context, query } => {
            let query = read_query(query);
            let parsed = parser(&config).parse(&query, context.as_deref()).await;
            println!("{}", serde_json::to_string_pretty(&parsed)?);
        }
        Commands::Plan => {
            let graph = build_graph(&config)?;
            for line in graph.describe() {
                println!("{}", line);
            }
        }
        Commands::Run {
            symbols,
            trace,
            query,
        } => {
            let query = read_query(query);
            let session = cli
                .session
                .unwrap_or_else(|| fingraph_core::types::TransactionId::new().0);
            run_once(&config, session, query, normalize(symbols), trace).await?;
        }
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Doctor => {
            if !doctor::run_doctor(&config) {
                std::process::exit(1);
            }
        }
        Commands::Completions { .. } => unreachable!("handled before config load"),
    }

    Ok(())
}

fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        info!(path = %path.display(), "Loading config");
        Ok(AppConfig::load(path)?)
    } else {
        warn!(path = %path.display(), "No config file found, using defaults");
        Ok(AppConfig::default())
    }
}

fn parser(config: &AppConfig) -> FallbackQueryParser {
    FallbackQueryParser::new(RuleBasedQueryParser::new(&config.parser))
}

fn build_graph(config: &AppConfig) -> anyhow::Result<CompiledGraph> {
    let classifier = IntentClassifier::new(&config.classifier).with_parser(parser(config));
    let graph = PipelineBuilder::new(config.workflow.clone())
        .classifier(classifier)
        .research(OfflineAgent::arc(StageKind::Research))
        .analysis(OfflineAgent::arc(StageKind::Analysis))
        .filing(OfflineAgent::arc(StageKind::Filing))
        .comparison(OfflineAgent::arc(StageKind::Comparison))
        .trend(OfflineAgent::arc(StageKind::Trend))
        .reporting(OfflineAgent::arc(StageKind::Reporting))
        .build()?;
    Ok(graph)
}

async fn run_once(
    config: &AppConfig,
    session: String,
    query: String,
    symbols: Vec<String>,
    show_trace: bool,
) -> anyhow::Result<()> {
    let graph = Arc::new(build_graph(config)?);
    let state = StateRecord::new(session, query).with_symbols(symbols);

    let (observer, rx) = ChannelObserver::channel(
        state.transaction_id.clone(),
        config.workflow.progress_channel_capacity,
    );
    let tracker_cancel = CancellationToken::new();
    let tracker = ProgressTracker::spawn(rx, tracker_cancel.clone());

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    let executor = GraphExecutor::new(graph)
        .with_observer(Arc::new(observer))
        .with_cancellation(cancel);
    let (final_state, trace) = executor.execute_traced(state).await;
    // Dropping the executor closes the progress channel.
    drop(executor);
    let tracker = tracker.await?;

    if show_trace {
        println!("{}", serde_json::to_string_pretty(&trace)?);
        println!(
            "{}",
            serde_json::to_string_pretty(tracker.execution_order())?
        );
    }
    println!("{}", serde_json::to_string_pretty(&final_state)?);
    eprintln!("status: {}", final_state.status());
    Ok(())
}

fn read_query(words: Vec<String>) -> String {
    let text = words.join(" ");
    if !text.trim().is_empty() {
        return text;
    }
    io::stdin()
        .lock()
        .lines()
        .map_while(|l| l.ok())
        .collect::<Vec<_>>()
        .join("\n")
}

fn normalize(symbols: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for s in symbols {
        let s = s.trim().to_uppercase();
        if !s.is_empty() && !out.contains(&s) {
            out.push(s);
        }
    }
    out
}

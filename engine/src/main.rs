use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;

use cascade_clients::{
    CircuitBreakerConfig, ClientRegistry, EchoClient, HttpModelClient, PriceTable, RateLimitConfig,
};
use cascade_engine::{EngineConfig, ExecuteOptions, Pipeline};
use cascade_memory::{HashEmbedder, MemoryBank, MemoryBankConfig, NoteStore};
use cascade_observability::{init_process_logging, ProcessKind, TraceStoreConfig};
use cascade_types::ModelRole;

#[derive(Parser, Debug)]
#[command(name = "cascade-engine", about = "Run a query through the cascade pipeline")]
struct Args {
    /// Query text.
    query: String,

    /// Optional domain hint, e.g. "distributed-systems".
    #[arg(long)]
    domain: Option<String>,

    /// Tenant identifier.
    #[arg(long, default_value = "default")]
    tenant: String,

    /// Engine config file (JSON). Defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Total wall budget in milliseconds.
    #[arg(long)]
    max_wall_ms: Option<u64>,

    /// Total cost budget in micro-currency units.
    #[arg(long)]
    max_cost_micros: Option<u64>,

    /// Dump the full session trace after the result.
    #[arg(long)]
    trace: bool,

    /// Seed for deterministic ordering.
    #[arg(long)]
    seed: Option<u64>,

    /// SQLite path for the memory bank. Memory retrieval is skipped when
    /// omitted.
    #[arg(long)]
    memory_db: Option<PathBuf>,

    /// Base URL of an OpenAI-compatible endpoint for the teacher client.
    /// Both roles fall back to local echo clients when omitted.
    #[arg(long, env = "CASCADE_TEACHER_URL")]
    teacher_url: Option<String>,

    /// Model name for the teacher client.
    #[arg(long, default_value = "gpt-4o")]
    teacher_model: String,

    /// API key for the remote clients.
    #[arg(long, env = "CASCADE_API_KEY")]
    api_key: Option<String>,

    /// Logs directory.
    #[arg(long, default_value = "./logs")]
    logs_dir: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let (_guard, _info) = init_process_logging(ProcessKind::Cli, &args.logs_dir, 7)?;

    let config = match &args.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };

    let clients = build_clients(&args).await;
    let mut builder = Pipeline::builder(config.clone())
        .with_clients(clients)
        .with_trace_config(TraceStoreConfig::default());

    if let Some(db_path) = &args.memory_db {
        let store = NoteStore::open(db_path).await?;
        let bank = MemoryBank::new(
            store,
            Arc::new(HashEmbedder::new()),
            MemoryBankConfig {
                merge_threshold: config.memory.similarity_merge_threshold,
                ..MemoryBankConfig::default()
            },
        )?;
        builder = builder.with_memory(Arc::new(bank));
    }

    let pipeline = builder.build().await?;

    let mut budget = config.budget_defaults.clone();
    if let Some(max_wall_ms) = args.max_wall_ms {
        budget.max_wall_ms = max_wall_ms;
    }
    if let Some(max_cost_micros) = args.max_cost_micros {
        budget.max_cost_micros = max_cost_micros;
    }

    let options = ExecuteOptions {
        domain_hint: args.domain.clone(),
        budget: Some(budget),
        tenant_id: Some(args.tenant.clone()),
        deterministic_seed: args.seed,
        trace: true,
        ..ExecuteOptions::default()
    };

    let cancel = CancellationToken::new();
    let result = pipeline
        .execute_with_cancel(&args.query, options, cancel)
        .await?;

    println!("{}", serde_json::to_string_pretty(&result)?);
    if args.trace {
        if let Some(session) = pipeline.get_trace(&result.session_id).await {
            println!("{}", serde_json::to_string_pretty(&session)?);
        }
    }

    pipeline.shutdown().await;
    Ok(())
}

async fn build_clients(args: &Args) -> ClientRegistry {
    let registry = ClientRegistry::new();
    match &args.teacher_url {
        Some(url) => {
            registry
                .register(
                    "teacher",
                    ModelRole::Teacher,
                    Arc::new(HttpModelClient::new(
                        "teacher-remote",
                        url.clone(),
                        args.api_key.clone(),
                        args.teacher_model.clone(),
                        PriceTable::default(),
                    )),
                    RateLimitConfig::default(),
                    CircuitBreakerConfig::default(),
                )
                .await;
            registry
                .register(
                    "student",
                    ModelRole::Student,
                    Arc::new(HttpModelClient::new(
                        "student-remote",
                        url.clone(),
                        args.api_key.clone(),
                        args.teacher_model.clone(),
                        PriceTable {
                            micros_per_1k_tokens_in: 100,
                            micros_per_1k_tokens_out: 300,
                        },
                    )),
                    RateLimitConfig::default(),
                    CircuitBreakerConfig::default(),
                )
                .await;
        }
        None => {
            registry
                .register(
                    "teacher",
                    ModelRole::Teacher,
                    Arc::new(EchoClient::new("echo-teacher")),
                    RateLimitConfig::default(),
                    CircuitBreakerConfig::default(),
                )
                .await;
            registry
                .register(
                    "student",
                    ModelRole::Student,
                    Arc::new(EchoClient::new("echo-student")),
                    RateLimitConfig::default(),
                    CircuitBreakerConfig::default(),
                )
                .await;
        }
    }
    registry
}

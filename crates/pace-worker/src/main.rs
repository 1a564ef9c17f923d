use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};
use pace_worker::handler::LogHandler;
use pace_worker::{BlockingQueue, Job, QueueName, RedisQueue, Worker, WorkerConfig};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "pace-worker")]
#[command(about = "Blocking-queue job worker", long_about = None)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct GlobalArgs {
    /// Path to configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Redis URL
    #[arg(long, global = true)]
    redis: Option<String>,

    /// Key namespace queues live under
    #[arg(long, global = true)]
    namespace: Option<String>,

    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Consume jobs until SIGTERM, SIGQUIT or SIGINT
    Run {
        /// Queue name (defaults to $PACE_QUEUE)
        #[arg(short, long)]
        queue: Option<String>,
    },

    /// Push a JSON job onto a queue
    Enqueue {
        /// Queue name (defaults to $PACE_QUEUE)
        #[arg(short, long)]
        queue: Option<String>,

        /// Job payload as a JSON document
        payload: String,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum LogFormat {
    Text,
    Json,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_tracing(cli.global.log_format);
    let config = load_config(&cli.global)?;

    match cli.command {
        Command::Run { queue } => {
            let worker = Worker::with_redis(queue.as_deref(), config)?;
            worker.start(LogHandler).await?;
        }
        Command::Enqueue { queue, payload } => {
            let queue = QueueName::resolve(queue.as_deref(), config.queue.as_deref(), &config.namespace)?;
            let job = Job::new(serde_json::from_str(&payload).context("Payload is not valid JSON")?);

            let store = RedisQueue::open(&config.redis_url)?;
            store.push(queue.key(), job.encode()?).await?;
            info!("Enqueued job on {}", queue.key());
        }
    }

    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".into());
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Text => registry
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_target(false))
            .init(),
    }
}

/// Defaults, then the config file, then `PACE_*` variables, then flags.
fn load_config(args: &GlobalArgs) -> anyhow::Result<WorkerConfig> {
    let config = match &args.config {
        Some(path) => WorkerConfig::from_file(path)?,
        None => WorkerConfig::default(),
    };
    let mut config = config.merge_env(|key| std::env::var(key).ok());

    if let Some(url) = &args.redis {
        config.redis_url = url.clone();
    }
    if let Some(namespace) = &args.namespace {
        config.namespace = namespace.clone();
    }

    Ok(config)
}

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mq_load::config::{ClientSettings, LoadConfig, NEWEST_OFFSET, Topology};
use mq_load::logging;
use mq_load::output::OutputWriter;
use mq_load::roles::consumer::{TailOptions, tail};
use mq_load::roles::load::run_load;
use mq_load::roles::topic;
use mq_load::transport::config::parse_connect_kv;
use mq_load::transport::{ClientFactory, TopicClient, TopicFilter};
use tokio::signal;

#[derive(Parser)]
#[command(name = "mq-load")]
#[command(about = "Load generator and consumer for topic services")]
struct Cli {
    /// YAML file with engine, connection params and verbosity
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable diagnostic output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Explicit tracing filter, overrides --verbose (e.g. "mq_load=trace")
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Topic service engine (memory, nats)
    #[arg(long, global = true)]
    engine: Option<String>,

    /// Connection parameters as key=value, e.g. url=nats://127.0.0.1:4222
    #[arg(long = "connect", global = true)]
    connect: Vec<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load test a broker by spawning producer and/or consumer workers
    Load {
        /// Topic to load. A UUID is generated per unit of work if not given
        #[arg(short, long, default_value = "")]
        topic: String,

        /// Number of units of work to spawn
        #[arg(short, long, default_value = "1")]
        num: usize,

        /// Worker topology: producer, consumer, or paired
        #[arg(long = "type", default_value = "paired")]
        kind: String,

        /// Producer in-flight window and consumer pull size
        #[arg(short, long, default_value = "100")]
        limit: usize,

        /// Size of each produced message in bytes
        #[arg(long, default_value = "100")]
        msg_size: usize,

        /// How long to run, e.g. 30s or 2m
        #[arg(long, default_value = "30s", value_parser = humantime::parse_duration)]
        duration: Duration,

        /// Delay between produce/consume iterations; 0s runs as fast as possible
        #[arg(long, default_value = "0s", value_parser = humantime::parse_duration)]
        ticker: Duration,

        /// Keep consumers waiting for new messages instead of stopping at the end
        #[arg(short, long)]
        follow: bool,

        /// Consumer start offset, -1 for the newest message
        #[arg(short, long, default_value = "0", allow_hyphen_values = true)]
        offset: i64,

        /// Optional CSV file for per-worker reports
        #[arg(long)]
        csv: Option<PathBuf>,
    },
    /// Print messages from a topic
    Consume {
        #[arg(short, long, required = true)]
        topic: String,

        /// Offset to consume from, -1 for the last available message
        #[arg(short, long, default_value_t = NEWEST_OFFSET, allow_hyphen_values = true)]
        offset: i64,

        /// Maximum number of messages per pull
        #[arg(short, long, default_value = "100")]
        limit: usize,

        /// Keep consuming until Ctrl+C
        #[arg(short, long)]
        follow: bool,
    },
    /// Append messages to a topic
    Produce {
        #[arg(short, long, required = true)]
        topic: String,

        /// Message to send; repeat for several
        #[arg(short, long = "msg", required = true)]
        msgs: Vec<String>,
    },
    /// Manage topics
    Topic {
        #[command(subcommand)]
        command: TopicCommands,
    },
}

#[derive(Subcommand)]
enum TopicCommands {
    /// Create a new topic
    Create {
        #[arg(short, long, required = true)]
        topic: String,
    },
    /// Delete a topic
    Delete {
        #[arg(short, long, required = true)]
        topic: String,
    },
    /// List topics
    List {
        #[arg(long, default_value = "")]
        prefix: String,
        #[arg(long, default_value = "")]
        suffix: String,
        #[arg(short, long, default_value = "")]
        regex: String,
    },
    /// Get the min and max offsets of a topic
    Offsets {
        #[arg(short, long, required = true)]
        topic: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let file_settings = match &cli.config {
        Some(path) => ClientSettings::from_file(path)?,
        None => ClientSettings::default(),
    };
    let settings = file_settings.merge(cli.engine, parse_connect_kv(&cli.connect), cli.verbose);

    // Initialize logging
    logging::init(settings.verbose, cli.log_level.as_deref())?;

    let factory = settings.factory()?;
    tracing::debug!(?factory, "connection settings");

    match cli.command {
        Commands::Load {
            topic,
            num,
            kind,
            limit,
            msg_size,
            duration,
            ticker,
            follow,
            offset,
            csv,
        } => {
            let topology: Topology = kind.parse()?;
            let cfg = LoadConfig {
                workers: num,
                topology,
                topic: None,
                batch_size: limit,
                payload_size: msg_size,
                duration,
                pacing: ticker,
                follow,
                start_offset: offset,
            }
            .with_topic(&topic);
            cfg.validate()?;
            let mut out = match csv {
                Some(path) => OutputWriter::new_csv(path)?,
                None => OutputWriter::new_stdout(),
            };
            run_load(&cfg, Arc::new(factory), &mut out).await?;
            Ok(())
        }
        Commands::Consume {
            topic,
            offset,
            limit,
            follow,
        } => {
            let client = connect(&factory).await?;
            let opts = TailOptions {
                offset,
                limit,
                follow,
            };
            let mut stdout = io::stdout();
            tokio::select! {
                res = tail(client.as_ref(), topic.as_bytes(), &opts, &mut stdout) => {
                    res.with_context(|| format!("unable to consume message(s) from {topic:?}"))?;
                }
                _ = signal::ctrl_c() => {
                    tracing::debug!("Ctrl+C received, stopping consumer");
                }
            }
            client.shutdown().await?;
            Ok(())
        }
        Commands::Produce { topic, msgs } => {
            let client = connect(&factory).await?;
            topic::produce(client.as_ref(), &topic, &msgs).await?;
            client.shutdown().await?;
            Ok(())
        }
        Commands::Topic { command } => {
            let client = connect(&factory).await?;
            let client = client.as_ref();
            let mut stdout = io::stdout();
            match command {
                TopicCommands::Create { topic } => topic::create(client, &topic).await?,
                TopicCommands::Delete { topic } => topic::delete(client, &topic).await?,
                TopicCommands::List {
                    prefix,
                    suffix,
                    regex,
                } => {
                    let filter = TopicFilter::new(&prefix, &suffix, &regex)
                        .with_context(|| format!("invalid regex {regex:?}"))?;
                    topic::list(client, &filter, &mut stdout).await?;
                }
                TopicCommands::Offsets { topic } => {
                    topic::offsets(client, &topic, &mut stdout).await?;
                }
            }
            client.shutdown().await?;
            Ok(())
        }
    }
}

async fn connect(factory: &dyn ClientFactory) -> Result<Arc<dyn TopicClient>> {
    tracing::debug!("connecting");
    let client = factory
        .connect()
        .await
        .context("unable to connect to broker")?;
    tracing::debug!("client connection successful");
    Ok(client)
}

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};
use edgeflow_core::checkpoint::{FsStore, InMemoryStore, Store};
use edgeflow_core::runtime::{SinkNode, SourceNode, Topology, WindowNode};
use edgeflow_core::time::{system_clock, Clock};
use edgeflow_core::types::{Message, Qos, StreamEvent, Tuple};
use edgeflow_core::window::{WindowConfig, WindowType};
use edgeflow_core::RuleOptions;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "edgeflow")]
#[command(about = "EdgeFlow rule runner", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a windowed rule over generated sources and print its windows as JSON lines.
    Run(RunArgs),
    /// List the committed checkpoints of a state directory.
    Inspect {
        #[arg(long)]
        state_dir: PathBuf,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    #[arg(long, default_value = "rule")]
    rule_id: String,
    #[arg(long, value_enum, default_value_t = WindowTypeArg::Tumbling)]
    window_type: WindowTypeArg,
    /// Window length in ms, or tuples for count windows.
    #[arg(long, default_value_t = 1000)]
    length: i64,
    /// Hop interval, session gap or count step.
    #[arg(long, default_value_t = 0)]
    interval: i64,
    #[arg(long, value_delimiter = ',', default_value = "demo")]
    sources: Vec<String>,
    /// Milliseconds between generated tuples, per source.
    #[arg(long, default_value_t = 100)]
    rate_ms: u64,
    #[arg(long, default_value_t = 10)]
    duration_secs: u64,
    /// JSON rule options; the flags below override it.
    #[arg(long)]
    options: Option<PathBuf>,
    #[arg(long)]
    event_time: bool,
    #[arg(long)]
    late_tolerance: Option<i64>,
    #[arg(long, value_enum)]
    qos: Option<QosArg>,
    #[arg(long)]
    checkpoint_interval_ms: Option<u64>,
    /// Persist checkpoints here and restore from the latest one on start.
    #[arg(long)]
    state_dir: Option<PathBuf>,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum WindowTypeArg {
    NotWindow,
    Tumbling,
    Hopping,
    Sliding,
    Session,
    Count,
}

impl From<WindowTypeArg> for WindowType {
    fn from(arg: WindowTypeArg) -> Self {
        match arg {
            WindowTypeArg::NotWindow => WindowType::NotWindow,
            WindowTypeArg::Tumbling => WindowType::Tumbling,
            WindowTypeArg::Hopping => WindowType::Hopping,
            WindowTypeArg::Sliding => WindowType::Sliding,
            WindowTypeArg::Session => WindowType::Session,
            WindowTypeArg::Count => WindowType::Count,
        }
    }
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum QosArg {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl From<QosArg> for Qos {
    fn from(arg: QosArg) -> Self {
        match arg {
            QosArg::AtMostOnce => Qos::AtMostOnce,
            QosArg::AtLeastOnce => Qos::AtLeastOnce,
            QosArg::ExactlyOnce => Qos::ExactlyOnce,
        }
    }
}

impl RunArgs {
    fn rule_options(&self) -> anyhow::Result<RuleOptions> {
        let mut options = match &self.options {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read {}", path.display()))?;
                RuleOptions::from_json(&raw)?
            }
            None => RuleOptions::default(),
        };
        if self.event_time {
            options.is_event_time = true;
        }
        if let Some(late_tolerance) = self.late_tolerance {
            options.late_tolerance = late_tolerance;
        }
        if let Some(qos) = self.qos {
            options.qos = qos.into();
        }
        if let Some(interval) = self.checkpoint_interval_ms {
            options.checkpoint_interval = interval;
        }
        options.validate()?;
        Ok(options)
    }

    fn window_config(&self) -> WindowConfig {
        WindowConfig::new(self.window_type.into(), self.length, self.interval)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => run(args).await?,
        Commands::Inspect { state_dir } => {
            let store = FsStore::new(&state_dir)?;
            for checkpoint_id in store.list_checkpoints()? {
                let metadata = store.load_checkpoint(checkpoint_id)?;
                println!(
                    "{}",
                    json!({ "checkpointId": metadata.checkpoint_id, "ops": metadata.op_ids })
                );
            }
        }
    }
    Ok(())
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    let options = args.rule_options()?;
    let window = args.window_config();
    let store: Arc<dyn Store> = match &args.state_dir {
        Some(dir) => Arc::new(FsStore::new(dir)?),
        None => Arc::new(InMemoryStore::new()),
    };

    let mut topology = Topology::new(&args.rule_id, options.clone())?.with_store(store);
    topology.add_operator(WindowNode::new(
        "window",
        window,
        args.sources.clone(),
        &options,
    )?)?;
    let (sink, mut results) = SinkNode::new("sink", &options);
    topology.add_sink(sink)?;

    let mut feeds = Vec::with_capacity(args.sources.len());
    for name in &args.sources {
        let (source, feed) = SourceNode::channel(name, options.buffer_length);
        let source = if options.is_event_time {
            source.with_timestamp_field("ts")
        } else {
            source
        };
        topology.add_source(source)?;
        topology.connect(name, "window")?;
        feeds.push((name.clone(), feed));
    }
    topology.connect("window", "sink")?;
    topology.open().await?;

    let clock = system_clock();
    let period = Duration::from_millis(args.rate_ms.max(1));
    let producers: Vec<_> = feeds
        .into_iter()
        .map(|(name, feed)| tokio::spawn(produce(name, feed, period, clock.clone())))
        .collect();

    let deadline = tokio::time::sleep(Duration::from_secs(args.duration_secs));
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            event = results.recv() => match event {
                Some(StreamEvent::Window(window)) => println!("{}", serde_json::to_string(&window)?),
                Some(StreamEvent::Tuple(tuple)) => println!("{}", serde_json::to_string(&tuple)?),
                Some(StreamEvent::Error(error)) => warn!(%error, "Rule reported an error"),
                Some(_) => {}
                None => break,
            },
        }
    }

    for producer in producers {
        producer.abort();
    }
    topology.close().await?;

    let mut nodes = serde_json::Map::new();
    for name in args.sources.iter().map(String::as_str).chain(["window", "sink"]) {
        if let Some(stats) = topology.stats(name) {
            nodes.insert(name.to_string(), serde_json::to_value(stats)?);
        }
    }
    let mut summary = json!({ "rule": args.rule_id, "nodes": nodes });
    if let Some(coordinator) = topology.coordinator() {
        summary["completedCheckpoints"] = json!(coordinator.complete_count()?);
        summary["latestCheckpoint"] = json!(coordinator.latest()?);
    }
    eprintln!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

/// Feed one source with `{seq, ts}` tuples until the rule stops.
async fn produce(
    name: String,
    feed: mpsc::Sender<Tuple>,
    period: Duration,
    clock: Arc<dyn Clock>,
) {
    let mut ticker = tokio::time::interval(period);
    let mut seq: u64 = 0;
    loop {
        ticker.tick().await;
        let mut message = Message::new();
        message.insert("seq".to_string(), json!(seq));
        message.insert("ts".to_string(), json!(clock.now_ms()));
        if feed.send(Tuple::new(name.clone(), message, 0)).await.is_err() {
            return;
        }
        seq += 1;
    }
}

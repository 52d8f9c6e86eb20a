//! CLI for the graphyte Graphite exporter and render reader.
//!
//! Provides commands for sending metrics to Carbon, querying or following
//! the render API, and inspecting encoder output.

use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use clap::{Args, Parser, Subcommand, ValueEnum};
use graphyte::cursor::PollCursor;
use graphyte::reader::poll_once;
use graphyte::{
    ClientConfig, GraphitePublisher, HttpRenderClient, IterativeReader, PoolConfig, Protocol,
    PublisherConfig, ReaderConfig, Record, RenderConfig, ResultEnvelope, TimeBound,
};
use serde::de::DeserializeOwned;
use tracing_subscriber::EnvFilter;

/// Graphite/Carbon exporter and render-API reader CLI.
#[derive(Parser)]
#[command(name = "graphyte", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Send one metric, or plaintext lines from stdin, to Carbon.
    Send(SendArgs),

    /// Query the render API once, or keep polling with --follow.
    Render(RenderArgs),

    /// Print the bytes an encoder produces for one metric.
    Encode {
        /// Wire protocol.
        #[arg(long, default_value = "plaintext")]
        protocol: Protocol,

        /// Print the frame as hex instead of raw bytes.
        #[arg(long)]
        hex: bool,

        #[command(flatten)]
        metric: MetricArgs,
    },
}

/// One metric given on the command line.
#[derive(Args)]
struct MetricArgs {
    /// Metric path.
    path: Option<String>,

    /// Metric value.
    value: Option<f64>,

    /// Epoch seconds; defaults to now.
    #[arg(long)]
    timestamp: Option<i64>,

    /// Tag as key=value; repeatable.
    #[arg(long = "tag", value_parser = parse_tag)]
    tags: Vec<(String, String)>,
}

#[derive(Args)]
struct SendArgs {
    /// JSON publisher config file; flags override its values.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Carbon host.
    #[arg(long)]
    host: Option<String>,

    /// Carbon port; defaults to the protocol's port.
    #[arg(long)]
    port: Option<u16>,

    /// Wire protocol.
    #[arg(long)]
    protocol: Option<Protocol>,

    /// Number of pooled connections.
    #[arg(long)]
    pool_size: Option<usize>,

    /// Read `<path> <value> [timestamp]` lines from stdin.
    #[arg(long)]
    stdin: bool,

    #[command(flatten)]
    metric: MetricArgs,
}

#[derive(Args)]
struct RenderArgs {
    /// JSON reader config file; flags override its values.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Graphite web root, e.g. http://graphite.local:8080.
    #[arg(long)]
    url: Option<String>,

    /// Target expression; repeatable.
    #[arg(long = "target")]
    targets: Vec<String>,

    /// Lower bound (epoch seconds or a Graphite time expression).
    #[arg(long)]
    from: Option<String>,

    /// Upper bound (epoch seconds or a Graphite time expression).
    #[arg(long)]
    until: Option<String>,

    /// Ask Graphite to drop null datapoints.
    #[arg(long)]
    no_null_points: bool,

    /// Basic auth user name.
    #[arg(long)]
    user: Option<String>,

    /// Basic auth password.
    #[arg(long, requires = "user")]
    password: Option<String>,

    /// Keep polling until interrupted.
    #[arg(long)]
    follow: bool,

    /// Poll interval in seconds when following.
    #[arg(long)]
    interval: Option<u64>,

    /// Output format.
    #[arg(long, default_value = "csv")]
    format: OutputFormat,
}

/// Output format for render results.
#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    /// Comma-separated values.
    Csv,
    /// One JSON object per record.
    Json,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Send(args) => cmd_send(args).await,
        Commands::Render(args) => cmd_render(args).await,
        Commands::Encode {
            protocol,
            hex,
            metric,
        } => cmd_encode(protocol, hex, &metric),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

/// Implements `graphyte send`.
async fn cmd_send(args: SendArgs) -> Result<(), Box<dyn std::error::Error>> {
    let file = args.config.as_ref().map(read_config::<PublisherConfig>).transpose()?;
    let config = publisher_config(&args, file)?;

    let records = if args.stdin {
        read_stdin_records()?
    } else {
        vec![metric_record(&args.metric)?]
    };

    let mut publisher = GraphitePublisher::new(config);
    publisher.start().await?;
    let sent = publisher.publish(&records).await;
    publisher.stop().await?;
    sent?;

    eprintln!(
        "sent {} record(s) to {}",
        records.len(),
        publisher.config().client.address()
    );
    Ok(())
}

/// Applies `send` flags over an optional config file.
///
/// Without a file, the port defaults to the protocol's Carbon port. A port
/// from the file is only replaced by `--port`.
fn publisher_config(
    args: &SendArgs,
    file: Option<PublisherConfig>,
) -> Result<PublisherConfig, Box<dyn std::error::Error>> {
    let mut config = match file {
        Some(config) => config,
        None => {
            let host = args.host.clone().ok_or("--host or --config is required")?;
            PublisherConfig::new(ClientConfig::new(host, args.protocol.unwrap_or_default()))
        }
    };
    if let Some(host) = &args.host {
        config.client.host.clone_from(host);
    }
    if let Some(protocol) = args.protocol {
        config.client.protocol = protocol;
    }
    if let Some(port) = args.port {
        config.client.port = port;
    }
    if let Some(size) = args.pool_size {
        config.pool = PoolConfig { size, ..config.pool };
    }
    Ok(config)
}

/// Implements `graphyte render`.
async fn cmd_render(args: RenderArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => read_config::<ReaderConfig>(path)?,
        None => {
            let url = args.url.clone().ok_or("--url or --config is required")?;
            ReaderConfig::new(RenderConfig::new(url))
        }
    };
    if let Some(url) = args.url {
        config.render.url = url;
    }
    config.targets.extend(args.targets);
    if let Some(from) = args.from.as_deref() {
        config.from = Some(parse_time_bound(from));
    }
    if let Some(until) = args.until.as_deref() {
        config.until = Some(parse_time_bound(until));
    }
    if args.no_null_points {
        config.no_null_points = Some(true);
    }
    if let Some(user) = args.user {
        config.render = config.render.with_basic_auth(user, args.password.unwrap_or_default());
    }
    if let Some(secs) = args.interval {
        config.poll_interval = Duration::from_secs(secs);
    }
    config.validate()?;

    if !args.follow {
        let client = HttpRenderClient::new(config.render.clone())?;
        let envelope = poll_once(&client, &config, &mut PollCursor::new()).await?;
        print_envelope(&envelope, args.format)?;
        return Ok(());
    }

    let mut reader = IterativeReader::http(config, tokio::runtime::Handle::current());
    reader.start()?;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            envelope = reader.next() => match envelope {
                Some(envelope) => print_envelope(&envelope, args.format)?,
                None => break,
            },
        }
    }
    reader.stop().await;
    Ok(())
}

/// Implements `graphyte encode`.
fn cmd_encode(protocol: Protocol, hex: bool, metric: &MetricArgs) -> Result<(), Box<dyn std::error::Error>> {
    let frame = protocol.encode(&[metric_record(metric)?]);
    let mut stdout = std::io::stdout().lock();
    if hex {
        let text: String = frame.iter().map(|b| format!("{b:02x}")).collect();
        writeln!(stdout, "{text}")?;
    } else {
        stdout.write_all(&frame)?;
    }
    Ok(())
}

fn print_envelope(envelope: &ResultEnvelope, format: OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    let mut stdout = std::io::stdout().lock();
    match format {
        OutputFormat::Csv => {
            for record in &envelope.records {
                writeln!(stdout, "{},{},{}", record.path(), record.epoch_seconds(), record.value())?;
            }
        }
        OutputFormat::Json => {
            for record in &envelope.records {
                let tags: serde_json::Map<String, serde_json::Value> = record
                    .tags()
                    .iter()
                    .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
                    .collect();
                let line = serde_json::json!({
                    "target": record.path(),
                    "timestamp": record.epoch_seconds(),
                    "value": record.value(),
                    "tags": tags,
                });
                writeln!(stdout, "{line}")?;
            }
        }
    }
    tracing::debug!(
        records = envelope.meters.fetched_count,
        elapsed_ms = envelope.meters.elapsed.as_millis(),
        "render cycle"
    );
    Ok(())
}

fn metric_record(metric: &MetricArgs) -> Result<Record, Box<dyn std::error::Error>> {
    let path = metric.path.clone().ok_or("metric path is required")?;
    let value = metric.value.ok_or("metric value is required")?;
    let record = match metric.timestamp {
        Some(ts) => Record::at_epoch_seconds(path, value, ts),
        None => Record::new(path, value, SystemTime::now()),
    };
    Ok(record.with_tags(metric.tags.iter().cloned()))
}

/// Parses `<path> <value> [timestamp]` lines; blank lines are skipped.
fn read_stdin_records() -> Result<Vec<Record>, Box<dyn std::error::Error>> {
    let mut records = Vec::new();
    for (n, line) in std::io::stdin().lock().lines().enumerate() {
        let line = line?;
        let mut fields = line.split_whitespace();
        let Some(path) = fields.next() else {
            continue;
        };
        let value: f64 = fields
            .next()
            .ok_or_else(|| format!("line {}: missing value", n + 1))?
            .parse()?;
        let record = match fields.next() {
            Some(ts) => Record::at_epoch_seconds(path, value, ts.parse()?),
            None => Record::new(path, value, SystemTime::now()),
        };
        records.push(record);
    }
    Ok(records)
}

fn read_config<T: DeserializeOwned>(path: &PathBuf) -> Result<T, Box<dyn std::error::Error>> {
    let data = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&data)?)
}

fn parse_time_bound(s: &str) -> TimeBound {
    match s.parse::<i64>() {
        Ok(secs) => TimeBound::Epoch(secs),
        Err(_) => TimeBound::Relative(s.to_string()),
    }
}

fn parse_tag(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((k, v)) if !k.is_empty() => Ok((k.to_string(), v.to_string())),
        _ => Err(format!("expected key=value, got '{s}'")),
    }
}

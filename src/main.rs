use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use pathprobe::clock::SystemClock;
use pathprobe::config::PathProbeConfig;
use pathprobe::engine::tcp_probe::run_tcp_probe;
use pathprobe::engine::udp_flow::udp_test;
use pathprobe::engine::{Outcome, TestKind};
use pathprobe::orchestrator::{DirectionSummary, Orchestrator, PathReport, RunSettings};
use pathprobe::server::ProbeServer;
use pathprobe::trace::{LogSink, NullSink, TraceEntry, TraceEvent, TraceWriter};

#[derive(Parser)]
#[command(
    name = "pathprobe",
    about = "UDP/TCP path reachability and throughput prober",
    version,
    long_about = None
)]
struct Cli {
    /// Config file (overrides PATHPROBE_CONFIG and the system location)
    #[arg(long, global = true, env = "PATHPROBE_CONFIG")]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the probe server on every configured port
    Serve {
        /// Ports to listen on (comma separated)
        #[arg(long, value_delimiter = ',')]
        ports: Option<Vec<u16>>,

        /// Local address to bind
        #[arg(long)]
        bind: Option<String>,
    },

    /// Full run: reachability on all ports, then UDP vs TCP throughput
    Run {
        /// Server host name or address
        #[arg(long)]
        server: String,

        /// Ports to probe (comma separated, preference order)
        #[arg(long, value_delimiter = ',')]
        ports: Option<Vec<u16>>,

        /// Rounds of each throughput pair
        #[arg(long)]
        repetitions: Option<u32>,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Run a single UDP test (1 = reachability, 5 = download, 6 = upload)
    Udp {
        /// Server endpoint, HOST:PORT
        #[arg(long)]
        target: String,

        #[arg(long, value_parser = ["1", "5", "6"])]
        kind: String,

        /// Requested send rate in packets/sec
        #[arg(long)]
        rate: Option<u64>,
    },

    /// Run a single TCP test (2 = reachability, 3 = download, 4 = upload)
    Tcp {
        /// Server endpoint, HOST:PORT
        #[arg(long)]
        target: String,

        #[arg(long, value_parser = ["2", "3", "4"])]
        kind: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => PathProbeConfig::load(path)?,
        None => PathProbeConfig::load_or_default(),
    };
    if cli.log_json {
        config.logging.json = true;
    }
    init_tracing(&config);

    match cli.command {
        Commands::Serve { ports, bind } => {
            if let Some(ports) = ports {
                config.network.ports = ports;
            }
            if let Some(bind) = bind {
                config.network.bind_address = bind;
            }
            config.validate()?;
            serve(&config).await?;
        }
        Commands::Run {
            server,
            ports,
            repetitions,
            json,
        } => {
            if let Some(ports) = ports {
                config.network.ports = ports;
            }
            if let Some(repetitions) = repetitions {
                config.client.repetitions = repetitions;
            }
            let server = resolve_host(&server).await?;
            let report = run(&config, server).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_report(&report);
            }
        }
        Commands::Udp { target, kind, rate } => {
            if let Some(rate) = rate {
                config.client.rate_pps = rate;
            }
            config.validate()?;
            let kind = parse_kind(&kind)?;
            let peer = resolve_endpoint(&target).await?;
            let outcome = udp_test(
                config.network.bind_ip()?,
                peer,
                config.flow_config(kind),
                &SystemClock,
            )
            .await?;
            finish_single(&outcome)?;
        }
        Commands::Tcp { target, kind } => {
            config.validate()?;
            let kind = parse_kind(&kind)?;
            let peer = resolve_endpoint(&target).await?;
            let outcome = run_tcp_probe(peer, kind, &config.tcp_probe_config()).await;
            finish_single(&outcome)?;
        }
    }

    Ok(())
}

fn init_tracing(config: &PathProbeConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if config.logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Open the configured trace file, if any.
async fn open_trace(
    config: &PathProbeConfig,
) -> Result<Option<(TraceWriter, tokio::task::JoinHandle<Result<u64>>)>> {
    match &config.logging.trace_path {
        Some(path) => Ok(Some(
            TraceWriter::open(path, config.logging.trace_capacity).await?,
        )),
        None => Ok(None),
    }
}

/// Drop the last writer handle and wait for the file to be flushed.
async fn close_trace(trace: Option<(TraceWriter, tokio::task::JoinHandle<Result<u64>>)>) {
    if let Some((writer, task)) = trace {
        drop(writer);
        match task.await {
            Ok(Ok(lines)) => tracing::debug!(lines, "trace closed"),
            Ok(Err(e)) => tracing::warn!(error = %e, "trace writer failed"),
            Err(e) => tracing::warn!(error = %e, "trace writer task panicked"),
        }
    }
}

fn sink_for(trace: &Option<(TraceWriter, tokio::task::JoinHandle<Result<u64>>)>) -> Arc<dyn LogSink> {
    match trace {
        Some((writer, _)) => Arc::new(writer.clone()),
        None => Arc::new(NullSink),
    }
}

async fn serve(config: &PathProbeConfig) -> Result<()> {
    let trace = open_trace(config).await?;
    let server = ProbeServer::new(config, sink_for(&trace))?;
    let shutdown = server.shutdown_token();
    let running = server.start().await?;
    tracing::info!(ports = ?running.ports(), "pathprobe server running");

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, shutting down");
        }
        shutdown.cancel();
    });
    running.wait().await;
    drop(server);

    close_trace(trace).await;
    Ok(())
}

async fn run(config: &PathProbeConfig, server: IpAddr) -> Result<PathReport> {
    let settings = RunSettings::from_config(config)?;
    let trace = open_trace(config).await?;

    let orchestrator = Orchestrator::new(settings).with_sink(sink_for(&trace));
    let report = orchestrator.run(server).await;
    drop(orchestrator);

    if let Some((writer, _)) = &trace {
        let entry = TraceEntry::new(TraceEvent::PathReport)
            .with_peer(server)
            .with_test_id(report.run_id)
            .with_detail(serde_json::to_value(&report)?);
        writer.append_blocking(entry.to_line()).await?;
    }
    close_trace(trace).await;
    Ok(report)
}

fn parse_kind(code: &str) -> Result<TestKind> {
    code.parse::<u8>()
        .ok()
        .and_then(TestKind::from_code)
        .with_context(|| format!("unknown test kind: {}", code))
}

async fn resolve_host(host: &str) -> Result<IpAddr> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ip);
    }
    tokio::net::lookup_host((host, 0))
        .await
        .with_context(|| format!("failed to resolve {}", host))?
        .next()
        .map(|addr| addr.ip())
        .with_context(|| format!("{} resolved to no addresses", host))
}

async fn resolve_endpoint(target: &str) -> Result<SocketAddr> {
    if let Ok(addr) = target.parse::<SocketAddr>() {
        return Ok(addr);
    }
    tokio::net::lookup_host(target)
        .await
        .with_context(|| format!("failed to resolve {}", target))?
        .next()
        .with_context(|| format!("{} resolved to no addresses", target))
}

fn finish_single(outcome: &Outcome) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(outcome)?);
    if !outcome.success {
        bail!(
            "{} against {} failed: {}",
            outcome.kind,
            outcome.endpoint,
            outcome
                .failure
                .map(|f| f.to_string())
                .unwrap_or_else(|| "unknown".into())
        );
    }
    Ok(())
}

fn print_report(report: &PathReport) {
    println!("\n=== pathprobe report ===");
    println!("Server:  {}", report.server);
    println!("Run:     {}", report.run_id);
    println!("\n{:<8} | {:<5} | TCP", "Port", "UDP");
    println!("{:-<8}-|-{:-<5}-|-{:-<5}", "", "", "");
    for p in &report.reachability {
        println!(
            "{:<8} | {:<5} | {}",
            p.port,
            if p.udp { "ok" } else { "--" },
            if p.tcp { "ok" } else { "--" }
        );
    }
    match report.selected_port {
        Some(port) => println!("\nSelected port: {}", port),
        None => {
            println!("\nNo port passed both UDP and TCP reachability.");
            println!("========================\n");
            return;
        }
    }
    let direction = |name: &str, summary: &Option<DirectionSummary>| {
        if let Some(s) = summary {
            println!(
                "{:<9} UDP {:>12} B/s ({} ok)  TCP {:>12} B/s ({} ok)  faster: {:?}",
                name,
                fmt_rate(s.udp_bytes_per_sec),
                s.udp_successes,
                fmt_rate(s.tcp_bytes_per_sec),
                s.tcp_successes,
                s.faster
            );
        }
    };
    direction("Download", &report.download);
    direction("Upload", &report.upload);
    println!("========================\n");
}

fn fmt_rate(rate: Option<f64>) -> String {
    rate.map(|r| format!("{:.0}", r)).unwrap_or_else(|| "-".into())
}

use std::net::IpAddr;
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use bytes::BytesMut;
use clap::Parser;
use clap_derive::Parser;
use tokio::select;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, Level};

use nodelatency::aggregator::aggregator::Aggregator;
use nodelatency::aggregator::aggregator_config::AggregatorConfig;
use nodelatency::monitor::latency_store::LatencyStore;
use nodelatency::monitor::monitor_config::{MonitorConfig, NodeLatencyConfig};
use nodelatency::monitor::node_events::{NodeEvent, NodeIpsData};
use nodelatency::monitor::probe_scheduler::ProbeScheduler;
use nodelatency::monitor::report_client::{ReportClient, StaticReportClientProvider};
use nodelatency::net::raw_icmp_socket::RawSocketFactory;
use nodelatency::stats::node_summary::NodeSummary;

/// Probes the given peers from this host and prints what an aggregator would show. Opening raw
///  ICMP sockets requires root or CAP_NET_RAW.
#[derive(Parser)]
struct Args {
    /// peer IP addresses to probe, each one is treated as a separate node
    #[clap(required = true)]
    peer: Vec<IpAddr>,

    #[clap(long, default_value = "local")]
    node_name: String,

    #[clap(long, default_value_t = 5)]
    interval_seconds: u32,

    #[clap(long, default_value_t = false)]
    ipv6: bool,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

/// Sends summaries through their binary encoding, the way they would travel between processes
struct EncodingReportClient {
    aggregator: Aggregator,
}

#[async_trait]
impl ReportClient for EncodingReportClient {
    async fn push(&self, summary: NodeSummary) -> anyhow::Result<()> {
        let mut buf = BytesMut::new();
        summary.ser(&mut buf);
        debug!("pushing summary of {} bytes", buf.len());

        let decoded = NodeSummary::deser(&buf)?;
        self.aggregator.collect(decoded).await;
        Ok(())
    }
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    if args.interval_seconds == 0 {
        return Err(anyhow!("interval must be at least one second"));
    }

    let (aggregator, intake) = Aggregator::new(&AggregatorConfig::new());

    let mut node_config = NodeLatencyConfig::new(args.node_name.clone());
    node_config.ipv6_enabled = args.ipv6;

    let scheduler = ProbeScheduler::new(
        Arc::new(node_config),
        Arc::new(LatencyStore::new()),
        Arc::new(RawSocketFactory),
        Arc::new(StaticReportClientProvider::new(Arc::new(EncodingReportClient { aggregator: aggregator.clone() }))),
    );

    let monitor_config = MonitorConfig::from_ping_interval_seconds(true, args.interval_seconds);
    let (_config_sender, config_receiver) = watch::channel(monitor_config);
    let (node_sender, node_receiver) = mpsc::channel(args.peer.len().max(1));
    for (i, ip) in args.peer.iter().enumerate() {
        node_sender.send(NodeEvent::NodeAdded(NodeIpsData {
            name: format!("peer-{}", i),
            ips: vec![*ip],
        })).await?;
    }

    let (shutdown_sender, shutdown_receiver) = watch::channel(false);
    let shutdown = |mut receiver: watch::Receiver<bool>| async move {
        loop {
            let stop = *receiver.borrow_and_update();
            if stop || receiver.changed().await.is_err() {
                break;
            }
        }
    };

    let monitor = tokio::spawn(scheduler.run(config_receiver, node_receiver, shutdown(shutdown_receiver.clone())));
    let collector = tokio::spawn(intake.run(shutdown(shutdown_receiver)));

    let mut print_ticks = tokio::time::interval(monitor_config.interval);
    loop {
        select! {
            _ = print_ticks.tick() => print_latencies(&aggregator, &args.node_name).await,
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    info!("shutting down");
    shutdown_sender.send_replace(true);
    monitor.await?;
    collector.await?;
    Ok(())
}

async fn print_latencies(aggregator: &Aggregator, node_name: &str) {
    let summary = aggregator.get(node_name).await;
    if summary.entries.is_empty() {
        println!("{}: no measurements yet", node_name);
    }
    for entry in &summary.entries {
        match entry.latency.last_measured_rtt {
            Some(rtt) => println!("{} -> {}: {:?} ({:?})", node_name, entry.peer_ip, rtt, entry.latency.status()),
            None => println!("{} -> {}: no reply ({:?})", node_name, entry.peer_ip, entry.latency.status()),
        }
    }
}

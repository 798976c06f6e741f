use std::collections::BTreeMap;
use std::future::Future;
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::select;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, trace, warn};

use crate::aggregator::aggregator_config::AggregatorConfig;
use crate::monitor::report_client::ReportClient;
use crate::stats::latency_entry::LatencyEntry;
use crate::stats::node_summary::{NodeSummary, PeerLatency};

/// source node -> peer IP -> latest entry
type LatencyTable = BTreeMap<String, BTreeMap<IpAddr, LatencyEntry>>;

/// Central collection point for the summaries of all nodes.
///
/// Incoming summaries go through a bounded queue to a single consumer ([SummaryIntake]), which is
///  the only writer of the table. When the queue is full, [Aggregator::collect] waits for room.
#[derive(Clone)]
pub struct Aggregator {
    table: Arc<RwLock<LatencyTable>>,
    intake: mpsc::Sender<NodeSummary>,
}

/// The consumer side of the aggregator's intake queue. It must be [SummaryIntake::run] for
///  collected summaries to show up in queries.
pub struct SummaryIntake {
    table: Arc<RwLock<LatencyTable>>,
    receiver: mpsc::Receiver<NodeSummary>,
}

impl Aggregator {
    pub fn new(config: &AggregatorConfig) -> (Aggregator, SummaryIntake) {
        let table: Arc<RwLock<LatencyTable>> = Default::default();
        let (intake, receiver) = mpsc::channel(config.effective_queue_capacity());

        let aggregator = Aggregator {
            table: table.clone(),
            intake,
        };
        let summary_intake = SummaryIntake {
            table,
            receiver,
        };
        (aggregator, summary_intake)
    }

    pub async fn collect(&self, summary: NodeSummary) {
        if let Err(e) = self.intake.send(summary).await {
            warn!("aggregator intake is not running - dropping latency summary from {}", e.0.source_node);
        }
    }

    /// The latest data reported by a node. A node that never reported yields a summary without
    ///  entries.
    pub async fn get(&self, node_name: &str) -> NodeSummary {
        match self.table.read().await.get(node_name) {
            Some(row) => to_summary(node_name, row),
            None => NodeSummary::empty(node_name),
        }
    }

    pub async fn list(&self) -> Vec<NodeSummary> {
        self.table.read().await
            .iter()
            .map(|(node_name, row)| to_summary(node_name, row))
            .collect()
    }

    /// Removes all data reported by a node, e.g. after it left the cluster. Returns whether the
    ///  node had reported anything.
    pub async fn delete(&self, node_name: &str) -> bool {
        let removed = self.table.write().await
            .remove(node_name)
            .is_some();
        if removed {
            debug!("deleted latency data reported by {}", node_name);
        }
        removed
    }
}

fn to_summary(node_name: &str, row: &BTreeMap<IpAddr, LatencyEntry>) -> NodeSummary {
    NodeSummary {
        source_node: node_name.to_string(),
        entries: row.iter()
            .map(|(peer_ip, latency)| PeerLatency {
                peer_ip: *peer_ip,
                latency: latency.clone(),
            })
            .collect(),
    }
}

/// Pushing to an in-process aggregator, for agents running in the same process
#[async_trait]
impl ReportClient for Aggregator {
    async fn push(&self, summary: NodeSummary) -> anyhow::Result<()> {
        self.collect(summary).await;
        Ok(())
    }
}

impl SummaryIntake {
    /// Applies collected summaries until `shutdown` completes or all [Aggregator] handles are
    ///  dropped. Summaries that are still queued at that point are discarded.
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) {
        info!("starting node latency aggregator");

        tokio::pin!(shutdown);
        loop {
            select! {
                summary = self.receiver.recv() => {
                    match summary {
                        Some(summary) => self.on_summary(summary).await,
                        None => {
                            debug!("all aggregator handles were dropped");
                            break;
                        }
                    }
                }
                _ = &mut shutdown => break,
            }
        }

        info!("node latency aggregator stopped");
    }

    /// Each entry in the summary replaces the previous entry for the same peer as a whole. Peers
    ///  that are not in the summary keep their previous entries.
    async fn on_summary(&self, summary: NodeSummary) {
        trace!("applying {} latency entries from {}", summary.entries.len(), summary.source_node);

        let mut table = self.table.write().await;
        let row = table.entry(summary.source_node).or_default();
        for entry in summary.entries {
            row.insert(entry.peer_ip, entry.latency);
        }
    }
}

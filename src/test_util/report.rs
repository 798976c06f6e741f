use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::monitor::report_client::ReportClient;
use crate::stats::node_summary::NodeSummary;

/// [ReportClient] that keeps every pushed summary
#[derive(Default)]
pub struct RecordingReportClient {
    pushed: RwLock<Vec<NodeSummary>>,
}
impl RecordingReportClient {
    pub fn new() -> RecordingReportClient {
        Default::default()
    }

    /// returns pushed summaries, clearing the internal buffer
    pub async fn pushed(&self) -> Vec<NodeSummary> {
        let mut lock = self.pushed.write().await;
        std::mem::take(&mut *lock)
    }
}

#[async_trait]
impl ReportClient for RecordingReportClient {
    async fn push(&self, summary: NodeSummary) -> anyhow::Result<()> {
        self.pushed.write().await.push(summary);
        Ok(())
    }
}

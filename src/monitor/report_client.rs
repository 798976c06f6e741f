use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;

use crate::stats::node_summary::NodeSummary;

/// Delivers a node's summary to the central aggregator. Delivery is fire-and-forget: a failed
///  push is logged by the caller and never retried.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ReportClient: Send + Sync + 'static {
    async fn push(&self, summary: NodeSummary) -> anyhow::Result<()>;
}

/// Hands out the client to use for a single push. It is asked once per probing pass, so an
///  implementation can reconnect or pick up new credentials between passes.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ReportClientProvider: Send + Sync + 'static {
    async fn get_client(&self) -> anyhow::Result<Arc<dyn ReportClient>>;
}

pub struct StaticReportClientProvider {
    client: Arc<dyn ReportClient>,
}
impl StaticReportClientProvider {
    pub fn new(client: Arc<dyn ReportClient>) -> StaticReportClientProvider {
        StaticReportClientProvider {
            client,
        }
    }
}

#[async_trait]
impl ReportClientProvider for StaticReportClientProvider {
    async fn get_client(&self) -> anyhow::Result<Arc<dyn ReportClient>> {
        Ok(self.client.clone())
    }
}

use tracing::warn;

#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// Number of summaries that can wait for the consumer task before `collect` starts blocking
    ///  its callers. Should grow with the number of reporting nodes.
    pub intake_queue_capacity: usize,
}

impl AggregatorConfig {
    pub fn new() -> AggregatorConfig {
        AggregatorConfig {
            intake_queue_capacity: 1000,
        }
    }

    pub fn effective_queue_capacity(&self) -> usize {
        if self.intake_queue_capacity == 0 {
            warn!("intake queue capacity must be positive, using 1");
            1
        }
        else {
            self.intake_queue_capacity
        }
    }
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        AggregatorConfig::new()
    }
}

pub mod aggregator;
pub mod aggregator_config;

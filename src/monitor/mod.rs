pub mod latency_store;
pub mod monitor_config;
pub mod node_events;
pub mod ping_engine;
pub mod probe_scheduler;
pub mod report_client;

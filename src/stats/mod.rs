pub mod latency_entry;
pub mod node_summary;

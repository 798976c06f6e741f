pub mod aggregator;
pub mod monitor;
pub mod net;
pub mod stats;
pub mod util;
pub mod test_util;

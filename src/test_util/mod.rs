pub mod net;
pub mod report;

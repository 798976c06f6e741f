use std::time::Duration;

use tracing::warn;

use crate::net::ip_family::IpFamily;

pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(60);
pub const MIN_PING_INTERVAL: Duration = Duration::from_secs(1);

/// room for a maximum size IPv4 header, the ICMP header and a send timestamp
pub const MIN_RECEIVE_BUFFER_SIZE: usize = 128;

/// Runtime monitoring settings. A new snapshot replaces the previous one as a whole, it is never
///  patched field by field.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct MonitorConfig {
    pub enabled: bool,
    pub interval: Duration,
}

impl MonitorConfig {
    pub fn disabled() -> MonitorConfig {
        MonitorConfig {
            enabled: false,
            interval: DEFAULT_PING_INTERVAL,
        }
    }

    pub fn enabled_with_interval(interval: Duration) -> MonitorConfig {
        MonitorConfig {
            enabled: true,
            interval,
        }
    }

    /// for config sources that carry the interval as whole seconds
    pub fn from_ping_interval_seconds(enabled: bool, ping_interval_seconds: u32) -> MonitorConfig {
        MonitorConfig {
            enabled,
            interval: Duration::from_secs(ping_interval_seconds as u64),
        }
    }

    /// The interval the ticker actually uses. Anything below [MIN_PING_INTERVAL] (including zero,
    ///  which is not a valid ticker period) is raised to it.
    pub fn effective_interval(&self) -> Duration {
        if self.interval < MIN_PING_INTERVAL {
            warn!("ping interval {:?} is below the minimum, using {:?} instead", self.interval, MIN_PING_INTERVAL);
            MIN_PING_INTERVAL
        }
        else {
            self.interval
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        MonitorConfig::disabled()
    }
}

/// Static per-agent settings that do not change while the agent is running.
#[derive(Debug, Clone)]
pub struct NodeLatencyConfig {
    /// name of the node this agent runs on - it never probes itself
    pub node_name: String,
    pub ipv4_enabled: bool,
    pub ipv6_enabled: bool,
    /// size of the buffer each receive loop reads datagrams into; longer datagrams are truncated
    ///  by the socket
    pub receive_buffer_size: usize,
}

impl NodeLatencyConfig {
    pub fn new(node_name: impl Into<String>) -> NodeLatencyConfig {
        NodeLatencyConfig {
            node_name: node_name.into(),
            ipv4_enabled: true,
            ipv6_enabled: false,
            receive_buffer_size: 256,
        }
    }

    pub fn effective_receive_buffer_size(&self) -> usize {
        if self.receive_buffer_size < MIN_RECEIVE_BUFFER_SIZE {
            warn!("receive buffer size {} is too small for echo replies, using {} instead", self.receive_buffer_size, MIN_RECEIVE_BUFFER_SIZE);
            MIN_RECEIVE_BUFFER_SIZE
        }
        else {
            self.receive_buffer_size
        }
    }

    pub fn is_family_enabled(&self, family: IpFamily) -> bool {
        match family {
            IpFamily::V4 => self.ipv4_enabled,
            IpFamily::V6 => self.ipv6_enabled,
        }
    }
}

use std::net::IpAddr;

/// Changes to the set of cluster nodes and their addresses, as delivered by whatever keeps track
///  of cluster membership.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum NodeEvent {
    NodeAdded(NodeIpsData),
    /// the node's addresses changed - carries the full new set of addresses
    NodeUpdated(NodeIpsData),
    NodeDeleted(NodeDeletedData),
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NodeIpsData {
    pub name: String,
    pub ips: Vec<IpAddr>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NodeDeletedData {
    pub name: String,
}

impl NodeEvent {
    pub fn node_name(&self) -> &str {
        match self {
            NodeEvent::NodeAdded(data) => &data.name,
            NodeEvent::NodeUpdated(data) => &data.name,
            NodeEvent::NodeDeleted(data) => &data.name,
        }
    }
}

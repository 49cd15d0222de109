//! Control-plane events broadcast to interested consumers (the WebSocket
//! fan-out hub subscribes to this channel).

use crate::persist::nodes::NodeKind;

/// Events emitted by the control plane after durable state changes.
#[derive(Debug, Clone)]
pub enum ControlEvent {
    /// A node registered or re-registered itself
    NodeAutoRegistered {
        /// PVE or PBS
        kind: NodeKind,
        /// Instance name after the operation
        name: String,
        /// Normalized host URL
        host_url: String,
    },
    /// Discovery state should be refreshed
    DiscoveryUpdated,
    /// The externally visible base URL was learned from a request
    PublicUrlCaptured {
        /// Captured base URL
        url: String,
    },
}

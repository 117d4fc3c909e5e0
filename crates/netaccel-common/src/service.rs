//! Control-plane service records

use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// Transport protocol a service listens on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceProtocol {
    Tcp,
    Udp,
}

impl ServiceProtocol {
    /// IANA protocol number
    pub fn number(self) -> u8 {
        match self {
            ServiceProtocol::Tcp => 6,
            ServiceProtocol::Udp => 17,
        }
    }
}

/// A proxied service as distributed by the control plane.
///
/// Only the fields the acceleration layer needs to place traffic are kept:
/// where the service lives and whether its traffic must go through the
/// userspace proxy for authentication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub id: u64,
    pub name: String,
    pub address: IpAddr,
    pub port: u16,
    pub protocol: ServiceProtocol,
    #[serde(default)]
    pub auth_required: bool,
}

impl Service {
    /// Workload hint used for CPU group placement
    pub fn workload_hint(&self) -> &'static str {
        if self.auth_required {
            "packet_processing"
        } else {
            "general"
        }
    }
}

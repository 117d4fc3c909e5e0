//! Service rule table shared with the XDP program

use netaccel_common::Service;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};

/// Verdict the fast path applies to matching traffic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum RuleAction {
    Drop = 0,
    Pass = 1,
    /// Send to the AF_XDP socket for slow-path handling
    Redirect = 2,
}

/// One `service_rules` entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRule {
    pub service_id: u32,
    pub address: Ipv4Addr,
    pub port: u16,
    pub protocol: u8,
    pub action: RuleAction,
    pub auth_required: bool,
}

/// Encoded value size, matches `struct service_rule` in the program
pub const RULE_VALUE_LEN: usize = 20;

impl ServiceRule {
    /// Rule for `service`, `None` for addresses the program cannot match
    pub fn for_service(service: &Service) -> Option<Self> {
        let IpAddr::V4(address) = service.address else {
            return None;
        };

        // Authentication happens in userspace
        let action = if service.auth_required {
            RuleAction::Redirect
        } else {
            RuleAction::Pass
        };

        Some(Self {
            service_id: service.id as u32,
            address,
            port: service.port,
            protocol: service.protocol.number(),
            action,
            auth_required: service.auth_required,
        })
    }

    /// Map key: the /24 network with the protocol in the low byte
    pub fn key(&self) -> u32 {
        (u32::from(self.address) & 0xFFFF_FF00) | u32::from(self.protocol)
    }

    pub fn key_bytes(&self) -> [u8; 4] {
        self.key().to_ne_bytes()
    }

    /// Value layout: id, address, port, protocol, action, redirect
    /// address, redirect port, auth flag, padding
    pub fn encode(&self) -> [u8; RULE_VALUE_LEN] {
        let mut value = [0u8; RULE_VALUE_LEN];
        value[0..4].copy_from_slice(&self.service_id.to_ne_bytes());
        value[4..8].copy_from_slice(&u32::from(self.address).to_ne_bytes());
        value[8..10].copy_from_slice(&self.port.to_ne_bytes());
        value[10] = self.protocol;
        value[11] = self.action as u8;
        // 12..18 redirect address and port stay zero
        value[18] = u8::from(self.auth_required);
        value
    }
}

/// Build the keyed rule table for `services`.
///
/// Services sharing a /24 and protocol collapse onto one key; the later
/// service wins. Returns the table and the services that were skipped.
pub(crate) fn rule_table(services: &[Service]) -> (BTreeMap<u32, ServiceRule>, Vec<&Service>) {
    let mut table = BTreeMap::new();
    let mut skipped = Vec::new();

    for service in services {
        match ServiceRule::for_service(service) {
            Some(rule) => {
                table.insert(rule.key(), rule);
            }
            None => skipped.push(service),
        }
    }

    (table, skipped)
}

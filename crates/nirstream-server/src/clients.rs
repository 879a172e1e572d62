//! Client roster
//!
//! Admission and removal both go through the roster lock, so the capacity
//! check and the slot it grants are a single step.

use crate::{lock, AppState, RejectReason, ServerEvent};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::net::SocketAddr;

/// One attached export client
#[derive(Debug, Clone, Serialize)]
pub struct ClientStatus {
    /// `client:<n>`
    pub name: String,
    pub ip: String,
    pub ip_family: &'static str,
    pub port: u16,
    pub connected_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct Roster {
    clients: Vec<ClientStatus>,
    next_id: u64,
}

impl Roster {
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn clients(&self) -> &[ClientStatus] {
        &self.clients
    }

    fn admit(&mut self, addr: SocketAddr, capacity: usize) -> Result<String, RejectReason> {
        if self.clients.len() >= capacity {
            return Err(RejectReason::Capacity);
        }
        self.next_id += 1;
        let name = format!("client:{}", self.next_id);
        self.clients.push(ClientStatus {
            name: name.clone(),
            ip: addr.ip().to_string(),
            ip_family: if addr.is_ipv4() { "IPv4" } else { "IPv6" },
            port: addr.port(),
            connected_at: Utc::now(),
        });
        Ok(name)
    }

    fn remove(&mut self, name: &str) -> bool {
        let before = self.clients.len();
        self.clients.retain(|c| c.name != name);
        self.clients.len() != before
    }
}

/// Occupied roster slot, released on drop
pub struct ClientSlot {
    name: String,
    state: AppState,
}

impl ClientSlot {
    /// Claim a slot for a connection from `addr`
    pub fn claim(state: &AppState, addr: SocketAddr) -> Result<Self, RejectReason> {
        let name = lock(&state.roster).admit(addr, state.config.max_clients)?;
        tracing::info!(client = %name, %addr, "Export client connected");
        state.notify(ServerEvent::ClientConnected {
            client: name.clone(),
            addr: addr.to_string(),
        });
        state.publish_status();
        Ok(Self {
            name,
            state: state.clone(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for ClientSlot {
    fn drop(&mut self) {
        let (removed, now_empty) = {
            let mut roster = lock(&self.state.roster);
            let removed = roster.remove(&self.name);
            (removed, roster.is_empty())
        };
        if !removed {
            return;
        }
        tracing::info!(client = %self.name, "Export client disconnected");
        if now_empty {
            self.state.halt_stream();
        }
        self.state.notify(ServerEvent::ClientDisconnected {
            client: self.name.clone(),
        });
        self.state.publish_status();
    }
}

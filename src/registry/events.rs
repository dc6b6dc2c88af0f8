//! Tunnel lifecycle events
//!
//! The registry broadcasts an event whenever a node's tunnel attaches or goes
//! away. Subscribers that fall behind miss events rather than slowing the
//! relay down.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use super::entry::MappingEntry;
use super::token::Token;

/// Buffered events per subscriber
pub const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TunnelEventKind {
    Connect,
    Close,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelEvent {
    pub kind: TunnelEventKind,
    pub ip: String,
    pub port: u16,
    pub token: Token,
    pub at: DateTime<Utc>,
}

impl TunnelEvent {
    pub(crate) fn new(kind: TunnelEventKind, entry: &MappingEntry) -> Self {
        Self {
            kind,
            ip: entry.ip().to_string(),
            port: entry.port(),
            token: entry.token(),
            at: Utc::now(),
        }
    }
}

pub(crate) fn channel() -> broadcast::Sender<TunnelEvent> {
    broadcast::channel(EVENT_CAPACITY).0
}

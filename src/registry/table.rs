//! Connection registry
//!
//! Maps a remote peer's `(ip, port)` to its [`MappingEntry`], with at most one
//! live entry per pair. A secondary index resolves correlation tokens back to
//! entries.
//!
//! Locking is split in two granularities: the map shard locks guard only the
//! structure (insert, unlink, lookup) and the entry's own lock guards its
//! pending response. No code path holds both at once.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tokio::sync::broadcast;

use super::entry::MappingEntry;
use super::error::RegistryError;
use super::events::{self, TunnelEvent, TunnelEventKind};
use super::token::{OsTokenSource, Token, TokenSource};

/// Default depth of each entry's outbound frame queue
pub const DEFAULT_OUTBOUND_QUEUE: usize = 32;

/// Default cap on registered peers
pub const DEFAULT_MAX_PEERS: usize = 1024;

/// Key for peer mapping: (ip, port)
type PeerKey = (String, u16);

/// Thread-safe directory of remote peers
#[derive(Clone)]
pub struct ConnectionRegistry {
    /// (ip, port) -> entry. Check-then-insert runs under one shard lock.
    peers: Arc<DashMap<PeerKey, Arc<MappingEntry>>>,

    /// token -> entry, kept in step with `peers`
    tokens: Arc<DashMap<Token, Arc<MappingEntry>>>,

    /// Linked peers; kept beside `peers` so the cap is checked without
    /// touching other shards
    count: Arc<AtomicUsize>,

    next_sequence: Arc<AtomicU64>,
    token_source: Arc<dyn TokenSource>,
    outbound_queue: usize,
    max_peers: usize,
    events: broadcast::Sender<TunnelEvent>,
}

impl ConnectionRegistry {
    /// Create an empty registry drawing tokens from the OS entropy pool
    pub fn new() -> Self {
        Self {
            peers: Arc::new(DashMap::new()),
            tokens: Arc::new(DashMap::new()),
            count: Arc::new(AtomicUsize::new(0)),
            next_sequence: Arc::new(AtomicU64::new(0)),
            token_source: Arc::new(OsTokenSource),
            outbound_queue: DEFAULT_OUTBOUND_QUEUE,
            max_peers: DEFAULT_MAX_PEERS,
            events: events::channel(),
        }
    }

    /// Replace the token source (before the registry is shared)
    pub fn with_token_source(mut self, source: Arc<dyn TokenSource>) -> Self {
        self.token_source = source;
        self
    }

    /// Set the outbound queue depth for entries created from now on
    pub fn with_outbound_queue(mut self, depth: usize) -> Self {
        self.outbound_queue = depth.max(1);
        self
    }

    /// Cap the number of registered peers
    pub fn with_max_peers(mut self, max: usize) -> Self {
        self.max_peers = max.max(1);
        self
    }

    /// Receive tunnel connect and close events from now on
    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.events.subscribe()
    }

    pub(crate) fn publish(&self, kind: TunnelEventKind, entry: &MappingEntry) {
        // No subscribers is fine
        let _ = self.events.send(TunnelEvent::new(kind, entry));
    }

    /// Return the live entry for `(ip, port)`, creating it if there is none
    ///
    /// The boolean is `true` when this call created the entry. Concurrent
    /// callers for the same pair always observe the same entry.
    ///
    /// Only the combination of an empty address and port 0 is rejected. A
    /// new peer is refused once the registry holds its maximum.
    pub fn find_or_create(
        &self,
        ip: &str,
        port: u16,
    ) -> Result<(Arc<MappingEntry>, bool), RegistryError> {
        if ip.is_empty() && port == 0 {
            return Err(RegistryError::InvalidArgument(
                "peer address and port are both missing".to_string(),
            ));
        }

        let key = (copy_ip(ip)?, port);

        match self.peers.entry(key) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_live() {
                    return Ok((Arc::clone(occupied.get()), false));
                }

                // Tombstone: treat as absent and replace it
                let entry = self.allocate(ip, port)?;
                let stale = occupied.insert(Arc::clone(&entry));
                self.tokens.remove(&stale.token());
                self.tokens.insert(entry.token(), Arc::clone(&entry));

                log::debug!(
                    "Replaced closed mapping: peer={}:{}, old_token={}, token={}",
                    ip,
                    port,
                    stale.token(),
                    entry.token()
                );
                Ok((entry, true))
            }
            Entry::Vacant(vacant) => {
                let max = self.max_peers;
                if self
                    .count
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                        (n < max).then_some(n + 1)
                    })
                    .is_err()
                {
                    log::warn!("Peer table full, refusing {}:{} (max {})", ip, port, max);
                    return Err(RegistryError::Capacity(max));
                }

                let entry = match self.allocate(ip, port) {
                    Ok(entry) => entry,
                    Err(e) => {
                        self.count.fetch_sub(1, Ordering::AcqRel);
                        return Err(e);
                    }
                };
                self.tokens.insert(entry.token(), Arc::clone(&entry));
                vacant.insert(Arc::clone(&entry));

                log::debug!(
                    "Created mapping: peer={}:{}, token={}",
                    ip,
                    port,
                    entry.token()
                );
                Ok((entry, true))
            }
        }
    }

    /// Build a new entry. Nothing is linked in until this succeeds.
    fn allocate(&self, ip: &str, port: u16) -> Result<Arc<MappingEntry>, RegistryError> {
        let token = self.token_source.generate()?;
        let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);

        Ok(Arc::new(MappingEntry::new(
            copy_ip(ip)?,
            port,
            token,
            sequence,
            self.outbound_queue,
        )))
    }

    /// Unlink `entry`, then close it and wake its waiters
    ///
    /// Only removes the map slots still pointing at this very entry, so a
    /// stale handle never evicts a newer entry for the same peer. Returns
    /// `false` if the entry was already closed.
    pub fn remove(&self, entry: &Arc<MappingEntry>) -> bool {
        let key = (entry.ip().to_string(), entry.port());

        let unlinked = self
            .peers
            .remove_if(&key, |_, current| Arc::ptr_eq(current, entry))
            .is_some();
        self.tokens
            .remove_if(&entry.token(), |_, current| Arc::ptr_eq(current, entry));

        let closed = entry.close();

        if unlinked {
            self.count.fetch_sub(1, Ordering::AcqRel);
            log::debug!(
                "Removed mapping: peer={}:{}, token={}, waiters={}",
                entry.ip(),
                entry.port(),
                entry.token(),
                entry.waiters()
            );
        }

        closed
    }

    /// Resolve a correlation token to its live entry
    pub fn lookup_by_token(&self, token: Token) -> Result<Arc<MappingEntry>, RegistryError> {
        if token.is_nil() {
            return Err(RegistryError::InvalidArgument("nil token".to_string()));
        }

        self.tokens
            .get(&token)
            .map(|entry| Arc::clone(entry.value()))
            .filter(|entry| entry.is_live())
            .ok_or(RegistryError::NotFound)
    }

    /// Get the live entry for `(ip, port)` without creating one
    pub fn lookup(&self, ip: &str, port: u16) -> Option<Arc<MappingEntry>> {
        let key = (ip.to_string(), port);
        self.peers
            .get(&key)
            .map(|entry| Arc::clone(entry.value()))
            .filter(|entry| entry.is_live())
    }

    /// Snapshot of all entries in creation order
    pub fn entries(&self) -> Vec<Arc<MappingEntry>> {
        let mut entries: Vec<Arc<MappingEntry>> = self
            .peers
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        entries.sort_by_key(|entry| entry.sequence());
        entries
    }

    /// Number of registered peers
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Whether any registered peer has a tunnel attached
    pub fn has_attached(&self) -> bool {
        self.peers
            .iter()
            .any(|entry| entry.value().is_live() && entry.value().is_attached())
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Copy the peer address, reporting allocation failure instead of aborting
fn copy_ip(ip: &str) -> Result<String, RegistryError> {
    let mut owned = String::new();
    owned
        .try_reserve_exact(ip.len())
        .map_err(|_| RegistryError::OutOfMemory)?;
    owned.push_str(ip);
    Ok(owned)
}

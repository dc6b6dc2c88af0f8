//! Mapping entry: one remote peer's tunnel slot
//!
//! An entry is the rendezvous point between the tunnel session that receives
//! a node's responses and the dispatchers waiting for them. It holds at most
//! one pending response. Depositing a second response before the first is
//! collected replaces it.
//!
//! Every forwarded request is registered on the entry under its own request
//! id. The id travels down the tunnel with the request; a node that echoes it
//! back gets its answer routed to that request only, and an answer for a
//! request that already gave up is discarded.
//!
//! The entry lock (`slot`) guards the pending response and the set of
//! outstanding requests. The `closed` flag is written under that lock so a
//! waiter that checks it under the lock never misses a close, but it can also
//! be read lock-free by the registry, which must never hold a map lock and an
//! entry lock at the same time. Where both are needed, the attach lock
//! (`outbound_rx`) is taken before the entry lock.

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Notify, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::token::Token;

/// Lifecycle of an entry as seen from outside
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Live,
    /// Removed from the registry; waiters have been woken with a cancellation
    Closed,
}

/// What happened to a deposited response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deposit {
    Stored,
    /// An older, uncollected response was discarded
    Replaced,
    /// The request it answers is no longer waiting; the payload was dropped
    Stale,
    /// The entry is closed; the payload was dropped
    Rejected,
}

/// Why a wait for a response ended without one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitError {
    TimedOut,
    Closed,
}

/// A node's answer, as held in the entry's slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Request id echoed by the node, if it sent one back
    pub request: Option<u64>,

    /// Status reported by the node
    pub code: i32,

    pub body: String,
}

impl Response {
    fn answers(&self, request: u64) -> bool {
        self.request.is_none_or(|id| id == request)
    }
}

/// A serialized request headed for the peer
#[derive(Debug)]
pub(crate) struct Outbound {
    request: u64,
    frame: String,
}

/// Result of trying to attach a tunnel to an entry
#[derive(Debug)]
pub enum Attach {
    Attached(OutboundQueue),
    /// Another tunnel already serves this entry
    Busy,
    /// The entry was removed in the meantime
    Closed,
}

#[derive(Debug, Default)]
struct Slot {
    response: Option<Response>,
    outstanding: HashSet<u64>,
}

/// One remote peer's registered tunnel slot
#[derive(Debug)]
pub struct MappingEntry {
    ip: String,
    port: u16,
    token: Token,
    sequence: u64,
    created_at: DateTime<Utc>,

    slot: Mutex<Slot>,
    closed: AtomicBool,
    ready: Notify,
    retired: CancellationToken,
    waiters: AtomicUsize,
    next_request: AtomicU64,

    attached: AtomicBool,
    outbound: mpsc::Sender<Outbound>,
    /// Receiving half, claimed once by the tunnel session serving this peer
    outbound_rx: Mutex<Option<mpsc::Receiver<Outbound>>>,
}

impl MappingEntry {
    pub(crate) fn new(ip: String, port: u16, token: Token, sequence: u64, queue_depth: usize) -> Self {
        let (outbound, outbound_rx) = mpsc::channel(queue_depth.max(1));

        Self {
            ip,
            port,
            token,
            sequence,
            created_at: Utc::now(),
            slot: Mutex::new(Slot::default()),
            closed: AtomicBool::new(false),
            ready: Notify::new(),
            retired: CancellationToken::new(),
            waiters: AtomicUsize::new(0),
            next_request: AtomicU64::new(1),
            attached: AtomicBool::new(false),
            outbound,
            outbound_rx: Mutex::new(Some(outbound_rx)),
        }
    }

    pub fn ip(&self) -> &str {
        &self.ip
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn token(&self) -> Token {
        self.token
    }

    /// Creation order within the owning registry
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn state(&self) -> EntryState {
        if self.closed.load(Ordering::Acquire) {
            EntryState::Closed
        } else {
            EntryState::Live
        }
    }

    pub fn is_live(&self) -> bool {
        self.state() == EntryState::Live
    }

    /// Whether a tunnel session has claimed this entry
    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::Acquire)
    }

    /// Number of dispatchers currently blocked on this entry
    pub fn waiters(&self) -> usize {
        self.waiters.load(Ordering::Acquire)
    }

    pub fn has_pending_response(&self) -> bool {
        self.lock_slot().response.is_some()
    }

    /// Cancelled once the entry closes
    pub fn close_signal(&self) -> CancellationToken {
        self.retired.clone()
    }

    fn lock_slot(&self) -> MutexGuard<'_, Slot> {
        // Slot holds plain data; a panicked holder cannot leave it half-written
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_attach(&self) -> MutexGuard<'_, Option<mpsc::Receiver<Outbound>>> {
        self.outbound_rx.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim the receiving half of the outbound queue for a tunnel session
    pub(crate) fn attach(self: &Arc<Self>) -> Attach {
        let mut rx = self.lock_attach();
        if self.closed.load(Ordering::Acquire) {
            return Attach::Closed;
        }

        match rx.take() {
            Some(rx) => {
                self.attached.store(true, Ordering::Release);
                Attach::Attached(OutboundQueue {
                    entry: Arc::clone(self),
                    rx,
                })
            }
            None => Attach::Busy,
        }
    }

    /// Register a new request and return its id
    ///
    /// With no other request outstanding, any response still in the slot
    /// answers nobody and is discarded. Returns `None` once the entry is
    /// closed.
    pub(crate) fn begin_request(&self) -> Option<u64> {
        let mut slot = self.lock_slot();
        if self.closed.load(Ordering::Acquire) {
            return None;
        }

        if slot.outstanding.is_empty() {
            if let Some(stale) = slot.response.take() {
                log::debug!(
                    "Discarding unclaimed response: token={}, code={}, len={}",
                    self.token,
                    stale.code,
                    stale.body.len()
                );
            }
        }

        let request = self.next_request.fetch_add(1, Ordering::Relaxed);
        slot.outstanding.insert(request);
        Some(request)
    }

    /// Withdraw a request; its frame is no longer sent and its answer is dropped
    pub(crate) fn finish_request(&self, request: u64) {
        let mut slot = self.lock_slot();
        slot.outstanding.remove(&request);
        if slot
            .response
            .as_ref()
            .is_some_and(|response| response.request == Some(request))
        {
            slot.response = None;
        }
    }

    pub(crate) fn is_outstanding(&self, request: u64) -> bool {
        self.lock_slot().outstanding.contains(&request)
    }

    /// Queue a request frame for the peer without blocking
    ///
    /// While no tunnel is attached, a full queue is first cleared of frames
    /// whose requests were withdrawn.
    pub(crate) fn enqueue(&self, request: u64, frame: String) -> Result<(), TrySendError<String>> {
        let frame_of = |e: TrySendError<Outbound>| match e {
            TrySendError::Full(item) => TrySendError::Full(item.frame),
            TrySendError::Closed(item) => TrySendError::Closed(item.frame),
        };

        match self.outbound.try_send(Outbound { request, frame }) {
            Err(TrySendError::Full(item)) => {
                self.prune_withdrawn();
                self.outbound.try_send(item).map_err(frame_of)
            }
            other => other.map_err(frame_of),
        }
    }

    fn prune_withdrawn(&self) {
        let mut guard = self.lock_attach();
        // An attached session skips withdrawn frames as it drains them
        let Some(rx) = guard.as_mut() else {
            return;
        };

        let mut live = Vec::new();
        let mut dropped = 0usize;
        while let Ok(item) = rx.try_recv() {
            if self.is_outstanding(item.request) {
                live.push(item);
            } else {
                dropped += 1;
            }
        }

        for item in live {
            if let Err(e) = self.outbound.try_send(item) {
                log::warn!("Lost queued request while pruning: token={}, error={e}", self.token);
            }
        }

        if dropped > 0 {
            log::debug!("Pruned withdrawn requests: token={}, count={}", self.token, dropped);
        }
    }

    /// Store a response and wake every waiter
    pub(crate) fn deposit(&self, response: Response) -> Deposit {
        let outcome = {
            let mut slot = self.lock_slot();
            if self.closed.load(Ordering::Acquire) {
                return Deposit::Rejected;
            }
            if response
                .request
                .is_some_and(|request| !slot.outstanding.contains(&request))
            {
                return Deposit::Stale;
            }
            match slot.response.replace(response) {
                Some(_) => Deposit::Replaced,
                None => Deposit::Stored,
            }
        };

        self.ready.notify_waiters();
        outcome
    }

    /// Mark the entry closed, drop any pending response and wake every waiter
    ///
    /// Returns `false` if the entry was already closed.
    pub(crate) fn close(&self) -> bool {
        {
            let mut slot = self.lock_slot();
            if self.closed.swap(true, Ordering::AcqRel) {
                return false;
            }
            slot.response = None;
        }

        self.ready.notify_waiters();
        self.retired.cancel();
        true
    }

    /// Wait until a response for `request` is deposited, the entry closes, or
    /// `deadline` passes
    ///
    /// A response carrying no request id is taken by whichever request sees
    /// it first. A successful wait moves the response out of the entry.
    pub(crate) async fn wait_response(
        &self,
        request: u64,
        deadline: Instant,
    ) -> Result<Response, WaitError> {
        let _waiter = WaiterGuard::register(&self.waiters);

        loop {
            // Register interest before checking, so a wakeup between the
            // check and the await is not lost
            let mut notified = std::pin::pin!(self.ready.notified());
            notified.as_mut().enable();

            {
                let mut slot = self.lock_slot();
                if self.closed.load(Ordering::Acquire) {
                    return Err(WaitError::Closed);
                }
                if slot
                    .response
                    .as_ref()
                    .is_some_and(|response| response.answers(request))
                {
                    if let Some(response) = slot.response.take() {
                        return Ok(response);
                    }
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(WaitError::TimedOut);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn pending_response(&self) -> Option<Response> {
        self.lock_slot().response.clone()
    }
}

/// Frames queued for a peer, as drained by its tunnel session
#[derive(Debug)]
pub struct OutboundQueue {
    entry: Arc<MappingEntry>,
    rx: mpsc::Receiver<Outbound>,
}

impl OutboundQueue {
    /// Next frame whose request is still waiting; `None` once the entry is gone
    pub async fn next(&mut self) -> Option<String> {
        while let Some(item) = self.rx.recv().await {
            if self.entry.is_outstanding(item.request) {
                return Some(item.frame);
            }
            log::debug!(
                "Skipping withdrawn request: token={}, request={}",
                self.entry.token(),
                item.request
            );
        }
        None
    }
}

/// Counts a dispatcher as waiting for as long as it is alive
struct WaiterGuard<'a>(&'a AtomicUsize);

impl<'a> WaiterGuard<'a> {
    fn register(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

//! Request dispatcher
//!
//! REST-facing half of the rendezvous: forwards a request body down the
//! peer's tunnel tagged with the entry's token and a fresh request number,
//! then waits (bounded) for the tunnel session to deposit the node's answer.
//! A request that gives up is withdrawn: its frame is skipped if still
//! queued and a late answer to it is dropped.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;

use super::error::DispatchError;
use super::wire::Envelope;
use crate::registry::{ConnectionRegistry, MappingEntry, Response, Token, WaitError};

/// Default wait for a node's response
pub const DEFAULT_FORWARD_TIMEOUT: Duration = Duration::from_millis(5_000);

/// Upper bound on any requested wait
pub const MAX_FORWARD_TIMEOUT: Duration = Duration::from_millis(60_000);

/// Rounds of find-or-create when the entry closes under us
const REGISTER_ATTEMPTS: usize = 3;

/// Result of forwarding one request
#[derive(Debug)]
pub struct Forwarded {
    /// Token of the entry used, if one was obtained
    pub token: Option<Token>,
    pub result: Result<Response, DispatchError>,
}

#[derive(Clone)]
pub struct RequestDispatcher {
    registry: ConnectionRegistry,
    default_timeout: Duration,
    max_timeout: Duration,
}

impl RequestDispatcher {
    pub fn new(registry: ConnectionRegistry, default_timeout: Duration, max_timeout: Duration) -> Self {
        Self {
            registry,
            default_timeout,
            max_timeout: max_timeout.max(default_timeout),
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Resolve a caller-supplied timeout: missing or zero means the default,
    /// anything above the maximum is clamped
    pub fn effective_timeout(&self, requested: Option<Duration>) -> Duration {
        match requested {
            Some(timeout) if !timeout.is_zero() => timeout.min(self.max_timeout),
            _ => self.default_timeout,
        }
    }

    /// Forward `body` to the peer at `ip:port` and wait up to `timeout` for its response
    pub async fn dispatch(
        &self,
        ip: &str,
        port: u16,
        body: &str,
        timeout: Duration,
    ) -> Result<Response, DispatchError> {
        self.forward(ip, port, body, timeout).await.result
    }

    /// Like [`RequestDispatcher::dispatch`], also reporting the correlation token
    pub async fn forward(&self, ip: &str, port: u16, body: &str, timeout: Duration) -> Forwarded {
        let deadline = Instant::now() + timeout;

        let (entry, request) = match self.register(ip, port) {
            Ok(registered) => registered,
            Err((token, e)) => return Forwarded { token, result: Err(e) },
        };

        let withdraw = Withdraw(&entry, request);
        let result = exchange(&entry, request, body, deadline, timeout).await;
        drop(withdraw);

        match &result {
            Ok(response) => log::debug!(
                "Forward complete: peer={}:{}, token={}, seq={}, code={}, len={}",
                ip,
                port,
                entry.token(),
                request,
                response.code,
                response.body.len()
            ),
            Err(e) => log::warn!(
                "Forward failed: peer={}:{}, token={}, seq={}: {}",
                ip,
                port,
                entry.token(),
                request,
                e
            ),
        }

        Forwarded {
            token: Some(entry.token()),
            result,
        }
    }

    /// Find the peer's live entry and register a request on it
    fn register(
        &self,
        ip: &str,
        port: u16,
    ) -> Result<(Arc<MappingEntry>, u64), (Option<Token>, DispatchError)> {
        let mut last = None;

        for _ in 0..REGISTER_ATTEMPTS {
            let (entry, created) = match self.registry.find_or_create(ip, port) {
                Ok(found) => found,
                Err(e) => return Err((None, e.into())),
            };

            if created {
                log::debug!(
                    "No tunnel for {}:{} yet, request queued until it connects: token={}",
                    ip,
                    port,
                    entry.token()
                );
            }

            match entry.begin_request() {
                Some(request) => return Ok((entry, request)),
                // Closed between lookup and registration; look again
                None => last = Some(entry.token()),
            }
        }

        Err((last, DispatchError::Cancelled))
    }
}

/// Withdraws a request when dropped, including when the caller's future is
/// dropped mid-wait
struct Withdraw<'a>(&'a MappingEntry, u64);

impl Drop for Withdraw<'_> {
    fn drop(&mut self) {
        self.0.finish_request(self.1);
    }
}

async fn exchange(
    entry: &MappingEntry,
    request: u64,
    body: &str,
    deadline: Instant,
    timeout: Duration,
) -> Result<Response, DispatchError> {
    let frame = Envelope::request(entry.token(), body)
        .with_seq(Some(request))
        .encode()?;

    entry.enqueue(request, frame).map_err(|e| match e {
        TrySendError::Full(_) => DispatchError::Unavailable("outbound queue full"),
        // Receiver dropped: the session serving this entry is gone
        TrySendError::Closed(_) => DispatchError::Cancelled,
    })?;

    entry.wait_response(request, deadline).await.map_err(|e| match e {
        WaitError::TimedOut => DispatchError::Timeout(timeout),
        WaitError::Closed => DispatchError::Cancelled,
    })
}

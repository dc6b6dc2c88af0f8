//! Tunnel session
//!
//! One live websocket connection from a remote node. The session attaches to
//! the node's mapping entry on connect, deposits responses on the entry as
//! they arrive and removes the entry when the connection ends, waking any
//! dispatcher still waiting on it.
//!
//! A node that reconnects while its old tunnel is still registered takes
//! over: the old entry is removed, which cancels its waiters and tells the
//! old session to stop, and the new connection gets a fresh entry.

use std::sync::Arc;

use super::error::{SessionError, WireError};
use super::wire::Envelope;
use crate::registry::{
    Attach, ConnectionRegistry, Deposit, MappingEntry, OutboundQueue, Response, Token,
    TunnelEventKind,
};

/// Rounds of find-or-create before giving up on a contended peer
const ATTACH_ATTEMPTS: usize = 3;

pub struct TunnelSession {
    registry: ConnectionRegistry,
    entry: Arc<MappingEntry>,
    outbound: Option<OutboundQueue>,
    closed: bool,
}

impl TunnelSession {
    /// Attach a newly accepted connection from `ip:port`
    ///
    /// Reuses the peer's entry if a dispatcher created it first; requests
    /// queued before the tunnel came up are delivered once the caller starts
    /// draining [`TunnelSession::take_outbound`]. An entry already served by
    /// another tunnel is removed and replaced.
    pub fn on_connect(
        registry: &ConnectionRegistry,
        ip: &str,
        port: u16,
    ) -> Result<Self, SessionError> {
        for _ in 0..ATTACH_ATTEMPTS {
            let (entry, created) = registry.find_or_create(ip, port)?;

            match entry.attach() {
                Attach::Attached(outbound) => {
                    log::info!(
                        "Tunnel connected: peer={}:{}, token={}, new_entry={}",
                        ip,
                        port,
                        entry.token(),
                        created
                    );
                    registry.publish(TunnelEventKind::Connect, &entry);

                    return Ok(Self {
                        registry: registry.clone(),
                        entry,
                        outbound: Some(outbound),
                        closed: false,
                    });
                }
                Attach::Busy => {
                    log::info!(
                        "Peer {}:{} reconnected, dropping previous tunnel: token={}",
                        ip,
                        port,
                        entry.token()
                    );
                    registry.remove(&entry);
                }
                // Removed between lookup and attach; look again
                Attach::Closed => {}
            }
        }

        Err(SessionError::Contended {
            ip: ip.to_string(),
            port,
        })
    }

    pub fn entry(&self) -> &Arc<MappingEntry> {
        &self.entry
    }

    pub fn token(&self) -> Token {
        self.entry.token()
    }

    /// Frames queued for the peer. Available once.
    pub fn take_outbound(&mut self) -> Option<OutboundQueue> {
        self.outbound.take()
    }

    /// Deposit a response for whoever is waiting on this peer
    ///
    /// An uncollected earlier response is overwritten.
    pub fn on_message(&self, response: Response) {
        let len = response.body.len();
        let request = response.request;
        match self.entry.deposit(response) {
            Deposit::Stored => {
                log::debug!("Response stored: token={}, len={}", self.token(), len);
            }
            Deposit::Replaced => {
                log::debug!(
                    "Response stored, discarding uncollected one: token={}, len={}",
                    self.token(),
                    len
                );
            }
            Deposit::Stale => {
                log::debug!(
                    "Dropping late response: token={}, seq={:?}",
                    self.token(),
                    request
                );
            }
            Deposit::Rejected => {
                log::warn!(
                    "Dropping response for closed entry: peer={}:{}, token={}",
                    self.entry.ip(),
                    self.entry.port(),
                    self.token()
                );
            }
        }
    }

    /// Decode a text frame from the node and deposit its status and data
    pub fn on_frame(&self, text: &str) -> Result<(), WireError> {
        let envelope = Envelope::decode(text)?;

        if !envelope.is_response() {
            return Err(WireError::UnexpectedType(envelope.kind));
        }
        if envelope.uuid != self.token() {
            return Err(WireError::TokenMismatch {
                expected: self.token(),
                received: envelope.uuid,
            });
        }

        log::debug!(
            "Response from node: token={}, seq={:?}, code={}, len={}",
            envelope.uuid,
            envelope.seq,
            envelope.message.code,
            envelope.message.length
        );
        self.on_message(Response {
            request: envelope.seq,
            code: envelope.message.code,
            body: envelope.message.data,
        });
        Ok(())
    }

    /// Tear down: remove the entry and cancel pending waits
    pub fn on_close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        self.registry.remove(&self.entry);
        self.registry.publish(TunnelEventKind::Close, &self.entry);
        log::info!(
            "Tunnel closed: peer={}:{}, token={}",
            self.entry.ip(),
            self.entry.port(),
            self.token()
        );
    }
}

impl Drop for TunnelSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{EntryState, RegistryError};

    fn untagged(body: &str) -> Response {
        Response {
            request: None,
            code: 200,
            body: body.to_string(),
        }
    }

    #[test]
    fn test_connect_creates_entry() {
        let registry = ConnectionRegistry::new();

        let mut session = TunnelSession::on_connect(&registry, "10.0.0.5", 9000).expect("connect");

        assert!(session.take_outbound().is_some());
        assert!(session.take_outbound().is_none());
        let found = registry.lookup("10.0.0.5", 9000).expect("registered");
        assert_eq!(found.token(), session.token());
        assert!(found.is_attached());
    }

    #[test]
    fn test_connect_reuses_entry_created_by_dispatcher() {
        let registry = ConnectionRegistry::new();
        let (entry, _) = registry.find_or_create("10.0.0.5", 9000).expect("create");
        assert!(!entry.is_attached());

        let session = TunnelSession::on_connect(&registry, "10.0.0.5", 9000).expect("connect");

        assert_eq!(session.token(), entry.token());
        assert!(entry.is_attached());
    }

    #[test]
    fn test_reconnect_replaces_previous_tunnel() {
        let registry = ConnectionRegistry::new();
        let first = TunnelSession::on_connect(&registry, "10.0.0.5", 9000).expect("connect");
        let old_entry = Arc::clone(first.entry());
        let stop = old_entry.close_signal();

        let second = TunnelSession::on_connect(&registry, "10.0.0.5", 9000).expect("reconnect");

        assert!(stop.is_cancelled());
        assert!(!old_entry.is_live());
        assert_ne!(second.token(), old_entry.token());

        // The old session finishing late leaves the new one registered
        first.on_close();
        let found = registry.lookup("10.0.0.5", 9000).expect("still registered");
        assert!(Arc::ptr_eq(&found, second.entry()));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_connect_rejects_invalid_peer() {
        let registry = ConnectionRegistry::new();

        let err = match TunnelSession::on_connect(&registry, "", 0) {
            Ok(_) => panic!("should be rejected"),
            Err(e) => e,
        };
        assert!(matches!(
            err,
            SessionError::Registry(RegistryError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_sequential_messages_keep_last() {
        let registry = ConnectionRegistry::new();
        let session = TunnelSession::on_connect(&registry, "10.0.0.5", 9000).expect("connect");

        session.on_message(untagged("A"));
        session.on_message(untagged("B"));

        assert_eq!(session.entry().pending_response(), Some(untagged("B")));
    }

    #[test]
    fn test_frame_deposits_code_and_data() {
        let registry = ConnectionRegistry::new();
        let session = TunnelSession::on_connect(&registry, "10.0.0.5", 9000).expect("connect");
        let request = session.entry().begin_request().expect("live");
        let frame = Envelope::response(session.token(), 404, "{\"ok\":false}")
            .with_seq(Some(request))
            .encode()
            .expect("encode");

        session.on_frame(&frame).expect("accepted");

        assert_eq!(
            session.entry().pending_response(),
            Some(Response {
                request: Some(request),
                code: 404,
                body: "{\"ok\":false}".to_string(),
            })
        );
    }

    #[test]
    fn test_frame_for_withdrawn_request_is_dropped() {
        let registry = ConnectionRegistry::new();
        let session = TunnelSession::on_connect(&registry, "10.0.0.5", 9000).expect("connect");
        let request = session.entry().begin_request().expect("live");
        session.entry().finish_request(request);
        let frame = Envelope::response(session.token(), 200, "late")
            .with_seq(Some(request))
            .encode()
            .expect("encode");

        session.on_frame(&frame).expect("well formed");

        assert!(!session.entry().has_pending_response());
    }

    #[test]
    fn test_frame_with_foreign_token_is_dropped() {
        let registry = ConnectionRegistry::new();
        let session = TunnelSession::on_connect(&registry, "10.0.0.5", 9000).expect("connect");
        let (other, _) = registry.find_or_create("10.0.0.6", 9000).expect("create");
        let frame = Envelope::response(other.token(), 200, "x").encode().expect("encode");

        let err = session.on_frame(&frame).expect_err("mismatch");

        assert!(matches!(err, WireError::TokenMismatch { .. }));
        assert!(!session.entry().has_pending_response());
    }

    #[test]
    fn test_request_frame_from_node_is_rejected() {
        let registry = ConnectionRegistry::new();
        let session = TunnelSession::on_connect(&registry, "10.0.0.5", 9000).expect("connect");
        let frame = Envelope::request(session.token(), "x").encode().expect("encode");

        let err = session.on_frame(&frame).expect_err("wrong direction");
        assert!(matches!(err, WireError::UnexpectedType(kind) if kind == "node_request"));
    }

    #[test]
    fn test_close_removes_entry() {
        let registry = ConnectionRegistry::new();
        let session = TunnelSession::on_connect(&registry, "10.0.0.5", 9000).expect("connect");
        let entry = Arc::clone(session.entry());

        session.on_close();

        assert_eq!(entry.state(), EntryState::Closed);
        assert!(registry.is_empty());
        assert!(registry.lookup_by_token(entry.token()).is_err());
    }

    #[test]
    fn test_drop_closes_session() {
        let registry = ConnectionRegistry::new();
        let entry = {
            let session = TunnelSession::on_connect(&registry, "10.0.0.5", 9000).expect("connect");
            Arc::clone(session.entry())
        };

        assert!(!entry.is_live());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_lifecycle_events_published() {
        let registry = ConnectionRegistry::new();
        let mut events = registry.subscribe();

        let session = TunnelSession::on_connect(&registry, "10.0.0.5", 9000).expect("connect");
        let token = session.token();
        session.on_close();

        let connect = events.try_recv().expect("connect event");
        assert_eq!(connect.kind, TunnelEventKind::Connect);
        assert_eq!((connect.ip.as_str(), connect.port), ("10.0.0.5", 9000));
        assert_eq!(connect.token, token);

        let close = events.try_recv().expect("close event");
        assert_eq!(close.kind, TunnelEventKind::Close);
        assert_eq!(close.token, token);
        assert!(events.try_recv().is_err());
    }
}

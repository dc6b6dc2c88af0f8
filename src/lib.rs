//! Mesh relay
//!
//! Remote nodes keep a websocket tunnel open to the relay. Each node's
//! `(ip, port)` is mapped to a correlation token in a
//! [`ConnectionRegistry`](registry::ConnectionRegistry). REST clients ask the
//! [`RequestDispatcher`](relay::RequestDispatcher) to forward a request; it
//! sends the request down the node's tunnel and waits, bounded, for the
//! [`TunnelSession`](relay::TunnelSession) to hand back the response.

pub mod cli;
pub mod registry;
pub mod relay;
pub mod server;

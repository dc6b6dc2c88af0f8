pub mod dispatch;
pub mod error;
pub mod session;
pub mod wire;

pub use dispatch::{DEFAULT_FORWARD_TIMEOUT, Forwarded, MAX_FORWARD_TIMEOUT, RequestDispatcher};
pub use error::{DispatchError, SessionError, WireError};
pub use session::TunnelSession;
pub use wire::Envelope;

pub mod entry;
pub mod error;
pub mod events;
pub mod table;
pub mod token;

pub use entry::{Attach, Deposit, EntryState, MappingEntry, OutboundQueue, Response, WaitError};
pub use error::RegistryError;
pub use events::{TunnelEvent, TunnelEventKind};
pub use table::{ConnectionRegistry, DEFAULT_MAX_PEERS, DEFAULT_OUTBOUND_QUEUE};
pub use token::{AllocationError, OsTokenSource, Token, TokenSource};

//! Correlation token allocation
//!
//! Every mapping entry is identified by a random 128-bit token. The token is
//! handed back to REST callers and stamped on every frame sent down the
//! tunnel, so a node's response can be matched to the slot that is waiting
//! for it.

use rand::TryRngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Correlation token assigned to a mapping entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Token(Uuid);

impl Token {
    /// The all-zero token. Never allocated; rejected by lookups.
    pub const NIL: Token = Token(Uuid::nil());

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for Token {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// The entropy source could not produce a token
#[derive(Debug, thiserror::Error)]
#[error("entropy source unavailable: {0}")]
pub struct AllocationError(pub String);

/// Produces tokens for new mapping entries
///
/// Only uniqueness with overwhelming probability is required; tokens carry
/// no ordering.
pub trait TokenSource: Send + Sync {
    fn generate(&self) -> Result<Token, AllocationError>;
}

/// Random (version 4) tokens drawn from the operating system's entropy pool
#[derive(Debug, Default, Clone, Copy)]
pub struct OsTokenSource;

impl TokenSource for OsTokenSource {
    fn generate(&self) -> Result<Token, AllocationError> {
        let mut bytes = [0u8; 16];
        OsRng
            .try_fill_bytes(&mut bytes)
            .map_err(|e| AllocationError(e.to_string()))?;

        // Builder stamps the version and variant bits, so the result is never nil
        Ok(Token(uuid::Builder::from_random_bytes(bytes).into_uuid()))
    }
}

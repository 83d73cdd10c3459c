//! Error types for chain storage and validation.

use thiserror::Error;

use kestrel_core::error::VerifyError;

/// Failures from the key-value backend or record corruption.
///
/// Fatal to the chain: the engine halts rather than continue over a store it
/// can no longer trust.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("backend: {0}")] Backend(String),
    #[error("corrupt record under key {0}")] Corrupt(String),
    #[error("missing record: {0}")] Missing(String),
}

/// Errors surfaced by the chain engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    /// Consensus rejection: carries reject code, reason, and ban score.
    #[error(transparent)] Verify(#[from] VerifyError),
    /// Store failure. Halts the chain.
    #[error(transparent)] Store(#[from] StoreError),
}

impl ChainError {
    /// Whether this error is a consensus rejection (as opposed to a fatal
    /// store failure).
    pub fn is_verify(&self) -> bool {
        matches!(self, Self::Verify(_))
    }

    pub fn verify(&self) -> Option<&VerifyError> {
        match self {
            Self::Verify(e) => Some(e),
            Self::Store(_) => None,
        }
    }
}

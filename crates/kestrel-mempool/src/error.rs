//! Mempool error types.

use thiserror::Error;

use kestrel_core::error::VerifyError;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MempoolError {
    /// Policy or consensus rejection; carries the reject code and score.
    #[error(transparent)] Verify(#[from] VerifyError),
    /// The pool is at capacity and the transaction did not displace anything.
    #[error("mempool full")] Full,
    /// The orphan pool is at its hard cap.
    #[error("orphan pool full")] OrphanPoolFull,
}

impl MempoolError {
    pub fn verify(&self) -> Option<&VerifyError> {
        match self {
            Self::Verify(err) => Some(err),
            _ => None,
        }
    }
}

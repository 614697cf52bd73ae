//! Error taxonomy for the accounting core: allocation failure, reservation
//! admission failure, a missing/dead stripe, and a detected accounting
//! inconsistency. Overflow of a packed sector field is *not* a variant
//! here — it's a bug, not a recoverable condition, and is raised as a
//! panic from the checked add at the call site (see
//! [`crate::bucket_mark::Mark`]).

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AccountingError {
    #[error("allocation failed")]
    NoMemory,

    #[error("no space: requested {requested} sectors, {available} available")]
    NoSpace { requested: u64, available: u64 },

    #[error("stripe {idx} missing or dead")]
    MissingStripe { idx: u64 },

    #[error("accounting inconsistency: {0}")]
    Inconsistency(String),
}

pub type Result<T> = std::result::Result<T, AccountingError>;

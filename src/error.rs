// src/error.rs
use std::fmt;

/// Every failure a ledger invocation can surface. An error always aborts
/// the invocation before anything is handed to the substrate, so a failed
/// operation never leaves a partial write behind.
#[derive(Debug)]
pub enum LedgerError {
    /// A referenced document is absent.
    NotFound(String),
    /// A create targeted an id that is already taken.
    AlreadyExists(String),
    /// Malformed payload, missing required field, or a non-positive /
    /// non-finite numeric input.
    Validation(String),
    /// A transfer exceeds the sender's balance.
    InsufficientFunds,
    /// A burn or purchase exceeds the circulating / available supply.
    InsufficientSupply,
    /// The requested lifecycle transition is not allowed from the
    /// document's current state.
    InvalidStateTransition(String),
    /// The storage substrate failed or returned an undecodable document.
    Storage(String),
}

impl fmt::Display for LedgerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound(what) => write!(f, "{} does not exist", what),
            Self::AlreadyExists(what) => write!(f, "{} already exists", what),
            Self::Validation(msg) => write!(f, "Validation failed: {}", msg),
            Self::InsufficientFunds => write!(f, "Insufficient balance"),
            Self::InsufficientSupply => write!(f, "Insufficient token supply"),
            Self::InvalidStateTransition(msg) => {
                write!(f, "Invalid state transition: {}", msg)
            }
            Self::Storage(msg) => write!(f, "Storage error: {}", msg),
        }
    }
}

impl std::error::Error for LedgerError {}

impl From<serde_json::Error> for LedgerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

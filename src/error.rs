use crate::domain::action::ActionKind;
use crate::domain::payin::{FailureReason, PayInId};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PayError {
    #[error("unknown action type {0:?}")]
    UnknownAction(ActionKind),
    #[error("action requires an authenticated account")]
    AnonymousNotAllowed,
    #[error("pay-in does not belong to the caller")]
    NotOwner,
    #[error("insufficient funds")]
    InsufficientFunds,
    #[error("pay-in {0} not found")]
    PayInNotFound(PayInId),
    #[error("invoice creation failed: {0}")]
    InvoiceCreation(String),
    #[error("invoice wrap rejected ({reason:?}): {detail}")]
    Wrap {
        reason: FailureReason,
        detail: String,
    },
    #[error("action execution failed: {0}")]
    Execution(String),
    #[error("retry not allowed: {0}")]
    RetryNotAllowed(&'static str),
    #[error("transition precondition not met: {0}")]
    Precondition(&'static str),
    #[error("payment node error: {0}")]
    Node(String),
    #[error("store error: {0}")]
    Store(String),
    #[cfg(feature = "storage-rocksdb")]
    #[error("storage error: {0}")]
    Rocks(#[from] rocksdb::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, PayError>;

impl PayError {
    /// The machine-readable reason recorded on a pay-in this error fails.
    pub fn failure_reason(&self) -> FailureReason {
        match self {
            Self::Wrap { reason, .. } => *reason,
            Self::InvoiceCreation(_) | Self::Node(_) => FailureReason::InvoiceCreationFailed,
            Self::Execution(_) => FailureReason::ExecutionFailed,
            Self::InsufficientFunds => FailureReason::InsufficientFunds,
            _ => FailureReason::UnknownFailure,
        }
    }
}

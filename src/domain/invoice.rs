use crate::domain::account::AccountId;
use crate::domain::msats::Msats;
use crate::domain::payin::PayoutPurpose;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::SystemTime;

/// Hex-encoded payment hash of an invoice. Unique per bound invoice.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PaymentHash(pub String);

impl fmt::Display for PaymentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The fields of a decoded payment request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecodedInvoice {
    pub hash: PaymentHash,
    pub msats: Option<Msats>,
    pub expires_at: SystemTime,
    pub cltv_delta: u32,
    pub destination: String,
    pub features: Vec<u32>,
    pub description: Option<String>,
    pub description_hash: Option<String>,
}

/// The incoming invoice bound to a pay-in, collecting the unpaid remainder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncomingBolt11 {
    pub hash: PaymentHash,
    pub bolt11: String,
    pub msats_requested: Msats,
    pub msats_received: Option<Msats>,
    pub expires_at: SystemTime,
    /// Settlement secret. Known at creation for our own hold invoices,
    /// learned from the outgoing payment for wrapped ones.
    pub preimage: Option<String>,
    pub confirmed_at: Option<SystemTime>,
    pub cancelled_at: Option<SystemTime>,
    /// Whether settlement is deferred until an explicit settle call.
    pub hold: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutgoingStatus {
    Pending,
    Confirmed,
    Failed,
}

/// The outgoing payment bound to a pay-in: a forwarded peer invoice or a
/// withdrawal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutgoingBolt11 {
    pub hash: PaymentHash,
    pub bolt11: String,
    pub msats: Msats,
    pub purpose: PayoutPurpose,
    pub recipient: Option<AccountId>,
    /// Routing-fee budget the payment may spend.
    pub max_fee: Msats,
    pub fee_paid: Option<Msats>,
    pub msats_paid: Option<Msats>,
    pub preimage: Option<String>,
    pub status: OutgoingStatus,
    pub failure: Option<String>,
    /// Absolute heights observed when the incoming hold invoice was accepted,
    /// recorded at forward time to bound the outgoing timelock.
    pub expiry_height: Option<u32>,
    pub accept_height: Option<u32>,
}

/// Externally observed state of an incoming invoice, carried in job payloads.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InvoiceSnapshot {
    pub hash: PaymentHash,
    pub is_held: bool,
    pub is_confirmed: bool,
    pub is_canceled: bool,
    pub received: Option<Msats>,
    pub preimage: Option<String>,
    pub confirmed_at: Option<SystemTime>,
    pub expiry_height: Option<u32>,
    pub accept_height: Option<u32>,
}

/// Externally observed state of an outgoing payment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PaymentSnapshot {
    pub hash: PaymentHash,
    pub is_confirmed: bool,
    pub is_failed: bool,
    /// The payment was never handed to the node; treated like a failure.
    pub not_sent: bool,
    pub msats_paid: Option<Msats>,
    pub fee_paid: Option<Msats>,
    pub preimage: Option<String>,
    pub failure: Option<String>,
}

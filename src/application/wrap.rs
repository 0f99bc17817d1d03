use crate::application::cache::TtlCache;
use crate::domain::invoice::DecodedInvoice;
use crate::domain::msats::Msats;
use crate::domain::payin::FailureReason;
use crate::domain::ports::{Clock, CreateHoldInvoice, CreateInvoice, CreatedInvoice, PaymentNode};
use crate::error::{PayError, Result};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::debug;

/// Feature bits an outgoing invoice may advertise: variable-length onions,
/// payment secret, basic MPP, blinded paths, TLV payment data, trampoline.
const ALLOWED_FEATURE_BITS: &[u32] = &[8, 9, 14, 15, 16, 17, 25, 48, 49, 149, 151, 262, 263];

/// Blocks of timelock reserved for one settlement hop to resolve safely.
pub const MIN_SETTLEMENT_CLTV_DELTA: u32 = 80;

/// Fixed wrapping policy. Tunables only move in tests.
#[derive(Debug, Clone)]
pub struct WrapPolicy {
    pub min_outgoing: Msats,
    pub max_outgoing: Msats,
    /// Shortest remaining life an outgoing invoice may have, and the slice
    /// shaved off the wrapping invoice's own expiry.
    pub expiry_buffer: Duration,
    /// Longest expiry the wrapping invoice will carry.
    pub max_expiry: Duration,
    pub min_incoming_cltv_delta: u32,
    pub max_incoming_cltv_delta: u32,
    /// Estimated fee may not exceed this many parts per hundred of the
    /// outgoing amount.
    pub max_fee_percent: u64,
    /// Routing-fee budget = ceil(estimate × fee_pad_num / fee_pad_den).
    pub fee_pad_num: u64,
    pub fee_pad_den: u64,
    /// Service markup: wrapped principal = ceil(out × markup_num / markup_den).
    pub markup_num: u64,
    pub markup_den: u64,
    pub estimate_timeout: Duration,
    pub height_cache_ttl: Duration,
}

impl Default for WrapPolicy {
    fn default() -> Self {
        Self {
            min_outgoing: Msats(900),
            max_outgoing: Msats(9_000_000_000),
            expiry_buffer: Duration::from_secs(300),
            max_expiry: Duration::from_secs(900),
            min_incoming_cltv_delta: 200,
            max_incoming_cltv_delta: 360,
            max_fee_percent: 2,
            fee_pad_num: 11,
            fee_pad_den: 10,
            markup_num: 10,
            markup_den: 9,
            estimate_timeout: Duration::from_secs(5),
            height_cache_ttl: Duration::from_secs(60),
        }
    }
}

/// The terms of an outgoing invoice wrapped into a hold invoice.
#[derive(Debug, Clone)]
pub struct WrappedInvoice {
    pub invoice: CreatedInvoice,
    /// Amount the wrapping invoice collects.
    pub msats: Msats,
    /// Padded routing-fee budget, to be trued up after settlement.
    pub fee_budget: Msats,
    /// Built-in service markup over the outgoing amount.
    pub markup: Msats,
    pub expires_at: SystemTime,
    pub cltv_delta: u32,
}

/// Description source for the wrapping invoice. Supplying both an explicit
/// description and an explicit hash is rejected.
#[derive(Debug, Clone, Default)]
pub struct WrapDescription {
    pub description: Option<String>,
    pub description_hash: Option<String>,
}

fn wrap_err(reason: FailureReason, detail: impl Into<String>) -> PayError {
    PayError::Wrap {
        reason,
        detail: detail.into(),
    }
}

/// Validates an externally supplied payment request and creates the hold
/// invoice that wraps it, reusing the outgoing payment hash so settlement of
/// one settles the other.
pub struct InvoiceWrapper {
    node: Arc<dyn PaymentNode>,
    clock: Arc<dyn Clock>,
    policy: WrapPolicy,
    height_cache: TtlCache<u32>,
}

impl InvoiceWrapper {
    pub fn new(node: Arc<dyn PaymentNode>, clock: Arc<dyn Clock>, policy: WrapPolicy) -> Self {
        let height_cache = TtlCache::new(policy.height_cache_ttl);
        Self {
            node,
            clock,
            policy,
            height_cache,
        }
    }

    async fn block_height(&self) -> Result<u32> {
        let now = self.clock.now();
        if let Some(height) = self.height_cache.get(now) {
            return Ok(height);
        }
        let height = self.node.block_height().await?;
        self.height_cache.put(height, now);
        Ok(height)
    }

    /// Policy checks that need no node round-trip. Split out so the invalid
    /// cases reject before any RPC.
    fn validate(
        &self,
        outgoing: &DecodedInvoice,
        desc: &WrapDescription,
        now: SystemTime,
    ) -> Result<Msats> {
        let Some(amount) = outgoing.msats else {
            return Err(wrap_err(
                FailureReason::WrapUnknown,
                "outgoing invoice has no amount",
            ));
        };
        if amount < self.policy.min_outgoing || amount > self.policy.max_outgoing {
            return Err(wrap_err(
                FailureReason::WrapUnknown,
                format!("outgoing amount {amount} out of bounds"),
            ));
        }
        if let Some(bit) = outgoing
            .features
            .iter()
            .find(|bit| !ALLOWED_FEATURE_BITS.contains(bit))
        {
            return Err(wrap_err(
                FailureReason::WrapUnknown,
                format!("unsupported feature bit {bit}"),
            ));
        }
        if desc.description.is_some() && desc.description_hash.is_some() {
            return Err(wrap_err(
                FailureReason::WrapUnknown,
                "both description and description hash supplied",
            ));
        }
        let min_life = now + self.policy.expiry_buffer;
        if outgoing.expires_at < min_life {
            return Err(wrap_err(
                FailureReason::WrapHighPredictedExpiry,
                "outgoing invoice expires too soon",
            ));
        }
        Ok(amount)
    }

    pub async fn wrap(
        &self,
        bolt11: &str,
        outgoing: &DecodedInvoice,
        custodial_remainder: Msats,
        desc: WrapDescription,
    ) -> Result<WrappedInvoice> {
        let now = self.clock.now();
        let amount = self.validate(outgoing, &desc, now)?;

        // expiry clamped into the horizon, minus the settlement buffer
        let horizon = now + self.policy.max_expiry;
        let expires_at = outgoing.expires_at.min(horizon) - self.policy.expiry_buffer;

        let height = self.block_height().await?;
        let estimate = self
            .node
            .estimate_route_fee(
                &outgoing.destination,
                amount,
                bolt11,
                self.policy.estimate_timeout,
            )
            .await?;

        let worst_case_delta = estimate.timelock_height.saturating_sub(height);
        let cltv_delta = (worst_case_delta + 2 * MIN_SETTLEMENT_CLTV_DELTA)
            .max(self.policy.min_incoming_cltv_delta);
        if cltv_delta > self.policy.max_incoming_cltv_delta {
            return Err(wrap_err(
                FailureReason::WrapHighPredictedExpiry,
                format!("predicted settlement delta {cltv_delta} blocks exceeds maximum"),
            ));
        }

        if estimate.fee > Msats(amount.0 * self.policy.max_fee_percent / 100) {
            return Err(wrap_err(
                FailureReason::WrapHighPredictedFee,
                format!("predicted routing fee {} too high for {amount}", estimate.fee),
            ));
        }

        let fee_budget = estimate
            .fee
            .ceil_mul(self.policy.fee_pad_num, self.policy.fee_pad_den);
        let markup = amount
            .ceil_mul(self.policy.markup_num, self.policy.markup_den)
            .saturating_sub(amount);
        let msats = custodial_remainder + amount + markup + fee_budget;

        let (description, description_hash) = match desc {
            WrapDescription {
                description: Some(d),
                ..
            } => (Some(d), None),
            WrapDescription {
                description_hash: Some(h),
                ..
            } => (None, Some(h)),
            _ => (
                outgoing.description.clone(),
                outgoing.description_hash.clone(),
            ),
        };

        debug!(
            hash = %outgoing.hash,
            %msats,
            %fee_budget,
            %markup,
            cltv_delta,
            "wrapping outgoing invoice"
        );

        let invoice = self
            .node
            .create_hold_invoice(CreateHoldInvoice {
                hash: Some(outgoing.hash.clone()),
                invoice: CreateInvoice {
                    description,
                    description_hash,
                    msats,
                    expires_at,
                },
                cltv_delta,
            })
            .await?;

        Ok(WrappedInvoice {
            invoice,
            msats,
            fee_budget,
            markup,
            expires_at,
            cltv_delta,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::invoice::PaymentHash;
    use crate::infrastructure::in_memory::ManualClock;
    use crate::infrastructure::mock_node::MockNode;

    fn wrapper_with(node: &MockNode, clock: &ManualClock) -> InvoiceWrapper {
        InvoiceWrapper::new(
            Arc::new(node.clone()),
            Arc::new(clock.clone()),
            WrapPolicy::default(),
        )
    }

    fn decoded(msats: u64, now: SystemTime) -> DecodedInvoice {
        DecodedInvoice {
            hash: PaymentHash("ab".repeat(32)),
            msats: Some(Msats(msats)),
            expires_at: now + Duration::from_secs(600),
            cltv_delta: 40,
            destination: "peer".into(),
            features: vec![8, 14, 17],
            description: Some("forwarded".into()),
            description_hash: None,
        }
    }

    #[tokio::test]
    async fn test_wrap_amount_and_budget() {
        let node = MockNode::new();
        let clock = ManualClock::new(SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000));
        node.set_route_estimate(Msats(1000), 40);
        let wrapper = wrapper_with(&node, &clock);

        let out = decoded(90_000, clock.now());
        let wrapped = wrapper
            .wrap("lnext1abc", &out, Msats(5000), WrapDescription::default())
            .await
            .unwrap();

        // markup = ceil(90_000 * 10 / 9) - 90_000 = 10_000
        assert_eq!(wrapped.markup, Msats(10_000));
        // budget = ceil(1000 * 11 / 10) = 1100
        assert_eq!(wrapped.fee_budget, Msats(1100));
        assert_eq!(wrapped.msats, Msats(5000 + 90_000 + 10_000 + 1100));
        assert_eq!(wrapped.invoice.hash, out.hash);
        // preimage stays with the far payee
        assert!(wrapped.invoice.preimage.is_none());
    }

    #[tokio::test]
    async fn test_wrap_rejects_high_fee() {
        let node = MockNode::new();
        let clock = ManualClock::new(SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000));
        // 50 sats predicted on a 1000-sat invoice: 5% > 2% cap
        node.set_route_estimate(Msats(50_000), 40);
        let wrapper = wrapper_with(&node, &clock);

        let out = decoded(1_000_000, clock.now());
        let err = wrapper
            .wrap("lnext1abc", &out, Msats::ZERO, WrapDescription::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PayError::Wrap {
                reason: FailureReason::WrapHighPredictedFee,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_wrap_rejects_unknown_feature_bit() {
        let node = MockNode::new();
        let clock = ManualClock::new(SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000));
        let wrapper = wrapper_with(&node, &clock);

        let mut out = decoded(90_000, clock.now());
        out.features.push(30);
        let err = wrapper
            .wrap("lnext1abc", &out, Msats::ZERO, WrapDescription::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PayError::Wrap {
                reason: FailureReason::WrapUnknown,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_wrap_rejects_conflicting_descriptions() {
        let node = MockNode::new();
        let clock = ManualClock::new(SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000));
        let wrapper = wrapper_with(&node, &clock);

        let out = decoded(90_000, clock.now());
        let err = wrapper
            .wrap(
                "lnext1abc",
                &out,
                Msats::ZERO,
                WrapDescription {
                    description: Some("a".into()),
                    description_hash: Some("b".into()),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PayError::Wrap { .. }));
    }

    #[tokio::test]
    async fn test_wrap_rejects_imminent_expiry() {
        let node = MockNode::new();
        let clock = ManualClock::new(SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000));
        let wrapper = wrapper_with(&node, &clock);

        let mut out = decoded(90_000, clock.now());
        out.expires_at = clock.now() + Duration::from_secs(120);
        let err = wrapper
            .wrap("lnext1abc", &out, Msats::ZERO, WrapDescription::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PayError::Wrap {
                reason: FailureReason::WrapHighPredictedExpiry,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_wrap_rejects_excessive_cltv() {
        let node = MockNode::new();
        let clock = ManualClock::new(SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000));
        // worst case delta 340 + 160 buffer = 500 > 360 max
        node.set_route_estimate(Msats(1000), 260);
        let wrapper = wrapper_with(&node, &clock);

        let out = decoded(90_000, clock.now());
        let err = wrapper
            .wrap("lnext1abc", &out, Msats::ZERO, WrapDescription::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PayError::Wrap {
                reason: FailureReason::WrapHighPredictedExpiry,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_wrap_rejects_amount_out_of_bounds() {
        let node = MockNode::new();
        let clock = ManualClock::new(SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000));
        let wrapper = wrapper_with(&node, &clock);

        let out = decoded(100, clock.now());
        assert!(wrapper
            .wrap("lnext1abc", &out, Msats::ZERO, WrapDescription::default())
            .await
            .is_err());

        let out = decoded(10_000_000_000, clock.now());
        assert!(wrapper
            .wrap("lnext1abc", &out, Msats::ZERO, WrapDescription::default())
            .await
            .is_err());
    }
}

use crate::domain::invoice::{DecodedInvoice, InvoiceSnapshot, PaymentHash, PaymentSnapshot};
use crate::domain::msats::Msats;
use crate::domain::ports::{
    CreateHoldInvoice, CreateInvoice, CreatedInvoice, PayRequest, PaymentNode, RouteEstimate,
};
use crate::error::{PayError, Result};
use async_trait::async_trait;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::fmt::Write as _;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

/// Asynchronous node notification, the mock equivalent of an invoice or
/// payment subscription stream.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeEvent {
    Invoice(InvoiceSnapshot),
    Payment(PaymentSnapshot),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum InvoiceState {
    Open,
    Held,
    Settled,
    Canceled,
}

#[derive(Debug, Clone)]
struct MockInvoice {
    bolt11: String,
    msats: Msats,
    hold: bool,
    preimage: Option<String>,
    state: InvoiceState,
    received: Option<Msats>,
    expires_at: SystemTime,
    cltv_delta: u32,
    accept_height: Option<u32>,
}

#[derive(Default)]
struct Inner {
    invoices: HashMap<PaymentHash, MockInvoice>,
    /// Invoices issued by "other nodes", decodable but not settleable here.
    external: HashMap<String, DecodedInvoice>,
    external_preimages: HashMap<PaymentHash, String>,
    pending_payments: HashMap<PaymentHash, PayRequest>,
    events: VecDeque<NodeEvent>,
    height: u32,
    route_fee: Msats,
    route_slack: u32,
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().fold(String::new(), |mut out, b| {
        let _ = write!(out, "{b:02x}");
        out
    })
}

fn sha256_hex(data: &[u8]) -> String {
    hex(&Sha256::digest(data))
}

/// In-process payment node standing in for an LND-style backend: generates
/// preimages, tracks invoice and payment state, and surfaces settlement
/// notifications as a drainable event queue.
#[derive(Clone)]
pub struct MockNode {
    inner: Arc<Mutex<Inner>>,
}

impl Default for MockNode {
    fn default() -> Self {
        Self::new()
    }
}

impl MockNode {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                height: 800_000,
                route_fee: Msats(1000),
                route_slack: 40,
                ..Inner::default()
            })),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("mock node lock poisoned")
    }

    pub fn set_block_height(&self, height: u32) {
        self.lock().height = height;
    }

    pub fn set_route_estimate(&self, fee: Msats, slack: u32) {
        let mut inner = self.lock();
        inner.route_fee = fee;
        inner.route_slack = slack;
    }

    /// Registers an invoice "issued by a peer node": decodable, payable via
    /// `pay`, preimage revealed on settlement. Returns (bolt11, hash).
    #[allow(clippy::too_many_arguments)]
    pub fn register_external_invoice(
        &self,
        msats: Option<Msats>,
        destination: &str,
        cltv_delta: u32,
        features: Vec<u32>,
        description: Option<String>,
        description_hash: Option<String>,
        expires_at: SystemTime,
    ) -> (String, PaymentHash) {
        let mut preimage_bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut preimage_bytes);
        let preimage = hex(&preimage_bytes);
        let hash = PaymentHash(sha256_hex(preimage.as_bytes()));
        let bolt11 = format!("lnext1{}", &hash.0[..24]);
        let decoded = DecodedInvoice {
            hash: hash.clone(),
            msats,
            expires_at,
            cltv_delta,
            destination: destination.to_string(),
            features,
            description,
            description_hash,
        };
        let mut inner = self.lock();
        inner.external.insert(bolt11.clone(), decoded);
        inner.external_preimages.insert(hash.clone(), preimage);
        (bolt11, hash)
    }

    /// Simulates a payer settling one of our plain invoices.
    pub fn pay_incoming(&self, hash: &PaymentHash, amount: Msats) {
        let mut inner = self.lock();
        let height = inner.height;
        let Some(inv) = inner.invoices.get_mut(hash) else {
            return;
        };
        inv.received = Some(amount);
        let snapshot = if inv.hold {
            inv.state = InvoiceState::Held;
            inv.accept_height = Some(height);
            InvoiceSnapshot {
                hash: hash.clone(),
                is_held: true,
                received: Some(amount),
                expiry_height: Some(height + inv.cltv_delta),
                accept_height: Some(height),
                ..InvoiceSnapshot::default()
            }
        } else {
            inv.state = InvoiceState::Settled;
            InvoiceSnapshot {
                hash: hash.clone(),
                is_confirmed: true,
                received: Some(amount),
                preimage: inv.preimage.clone(),
                confirmed_at: Some(SystemTime::now()),
                ..InvoiceSnapshot::default()
            }
        };
        inner.events.push_back(NodeEvent::Invoice(snapshot));
    }

    /// Completes a pending outgoing payment, revealing the payee's preimage.
    pub fn complete_payment(&self, hash: &PaymentHash, fee_paid: Msats) {
        let mut inner = self.lock();
        let Some(req) = inner.pending_payments.remove(hash) else {
            return;
        };
        let msats_paid = inner
            .external
            .get(&req.bolt11)
            .and_then(|d| d.msats)
            .unwrap_or(Msats::ZERO);
        let preimage = inner.external_preimages.get(hash).cloned();
        inner.events.push_back(NodeEvent::Payment(PaymentSnapshot {
            hash: hash.clone(),
            is_confirmed: true,
            msats_paid: Some(msats_paid),
            fee_paid: Some(fee_paid),
            preimage,
            ..PaymentSnapshot::default()
        }));
    }

    /// Fails a pending outgoing payment.
    pub fn fail_payment(&self, hash: &PaymentHash, failure: &str) {
        let mut inner = self.lock();
        inner.pending_payments.remove(hash);
        inner.events.push_back(NodeEvent::Payment(PaymentSnapshot {
            hash: hash.clone(),
            is_failed: true,
            failure: Some(failure.to_string()),
            ..PaymentSnapshot::default()
        }));
    }

    pub fn take_events(&self) -> Vec<NodeEvent> {
        self.lock().events.drain(..).collect()
    }

    pub fn has_pending_payment(&self, hash: &PaymentHash) -> bool {
        self.lock().pending_payments.contains_key(hash)
    }

    pub fn pending_payment_hashes(&self) -> Vec<PaymentHash> {
        self.lock().pending_payments.keys().cloned().collect()
    }

    pub fn invoice_state(&self, hash: &PaymentHash) -> Option<&'static str> {
        self.lock().invoices.get(hash).map(|i| match i.state {
            InvoiceState::Open => "open",
            InvoiceState::Held => "held",
            InvoiceState::Settled => "settled",
            InvoiceState::Canceled => "canceled",
        })
    }
}

#[async_trait]
impl PaymentNode for MockNode {
    async fn create_invoice(&self, req: CreateInvoice) -> Result<CreatedInvoice> {
        let mut preimage_bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut preimage_bytes);
        let preimage = hex(&preimage_bytes);
        let hash = PaymentHash(sha256_hex(preimage.as_bytes()));
        let bolt11 = format!("lnmock1{}", &hash.0[..24]);
        let mut inner = self.lock();
        inner.invoices.insert(
            hash.clone(),
            MockInvoice {
                bolt11: bolt11.clone(),
                msats: req.msats,
                hold: false,
                preimage: Some(preimage.clone()),
                state: InvoiceState::Open,
                received: None,
                expires_at: req.expires_at,
                cltv_delta: 80,
                accept_height: None,
            },
        );
        Ok(CreatedInvoice {
            bolt11,
            hash,
            preimage: Some(preimage),
        })
    }

    async fn create_hold_invoice(&self, req: CreateHoldInvoice) -> Result<CreatedInvoice> {
        let (hash, preimage) = match req.hash {
            Some(hash) => (hash, None),
            None => {
                let mut preimage_bytes = [0u8; 32];
                rand::thread_rng().fill_bytes(&mut preimage_bytes);
                let preimage = hex(&preimage_bytes);
                (PaymentHash(sha256_hex(preimage.as_bytes())), Some(preimage))
            }
        };
        let bolt11 = format!("lnhold1{}", &hash.0[..24]);
        let mut inner = self.lock();
        if inner.invoices.contains_key(&hash) {
            return Err(PayError::InvoiceCreation(format!(
                "duplicate payment hash {hash}"
            )));
        }
        inner.invoices.insert(
            hash.clone(),
            MockInvoice {
                bolt11: bolt11.clone(),
                msats: req.invoice.msats,
                hold: true,
                preimage: preimage.clone(),
                state: InvoiceState::Open,
                received: None,
                expires_at: req.invoice.expires_at,
                cltv_delta: req.cltv_delta,
                accept_height: None,
            },
        );
        Ok(CreatedInvoice {
            bolt11,
            hash,
            preimage,
        })
    }

    async fn settle_hold_invoice(&self, preimage: &str) -> Result<()> {
        let hash = PaymentHash(sha256_hex(preimage.as_bytes()));
        let mut inner = self.lock();
        let Some(inv) = inner.invoices.get_mut(&hash) else {
            return Err(PayError::Node(format!("no invoice for hash {hash}")));
        };
        match inv.state {
            InvoiceState::Held => {
                inv.state = InvoiceState::Settled;
                inv.preimage = Some(preimage.to_string());
                let received = inv.received;
                inner.events.push_back(NodeEvent::Invoice(InvoiceSnapshot {
                    hash,
                    is_confirmed: true,
                    received,
                    preimage: Some(preimage.to_string()),
                    confirmed_at: Some(SystemTime::now()),
                    ..InvoiceSnapshot::default()
                }));
                Ok(())
            }
            InvoiceState::Settled => Ok(()),
            InvoiceState::Open => Err(PayError::Node("invoice not accepted yet".into())),
            InvoiceState::Canceled => Err(PayError::Node("invoice already canceled".into())),
        }
    }

    async fn cancel_invoice(&self, hash: &PaymentHash) -> Result<()> {
        let mut inner = self.lock();
        let Some(inv) = inner.invoices.get_mut(hash) else {
            return Err(PayError::Node(format!("no invoice for hash {hash}")));
        };
        match inv.state {
            InvoiceState::Settled => Err(PayError::Node("invoice already settled".into())),
            InvoiceState::Canceled => Ok(()),
            _ => {
                inv.state = InvoiceState::Canceled;
                inner.events.push_back(NodeEvent::Invoice(InvoiceSnapshot {
                    hash: hash.clone(),
                    is_canceled: true,
                    ..InvoiceSnapshot::default()
                }));
                Ok(())
            }
        }
    }

    async fn decode(&self, bolt11: &str) -> Result<DecodedInvoice> {
        let inner = self.lock();
        if let Some(decoded) = inner.external.get(bolt11) {
            return Ok(decoded.clone());
        }
        inner
            .invoices
            .iter()
            .find(|(_, inv)| inv.bolt11 == bolt11)
            .map(|(hash, inv)| DecodedInvoice {
                hash: hash.clone(),
                msats: Some(inv.msats),
                expires_at: inv.expires_at,
                cltv_delta: inv.cltv_delta,
                destination: "self".to_string(),
                features: vec![8, 14, 17],
                description: None,
                description_hash: None,
            })
            .ok_or_else(|| PayError::Node(format!("cannot decode {bolt11}")))
    }

    async fn estimate_route_fee(
        &self,
        _destination: &str,
        _msats: Msats,
        bolt11: &str,
        _timeout: Duration,
    ) -> Result<RouteEstimate> {
        let inner = self.lock();
        let cltv_delta = inner
            .external
            .get(bolt11)
            .map(|d| d.cltv_delta)
            .unwrap_or(80);
        Ok(RouteEstimate {
            fee: inner.route_fee,
            timelock_height: inner.height + cltv_delta + inner.route_slack,
        })
    }

    async fn pay(&self, req: PayRequest) -> Result<()> {
        let mut inner = self.lock();
        let Some(decoded) = inner.external.get(&req.bolt11) else {
            return Err(PayError::Node(format!("cannot pay unknown {}", req.bolt11)));
        };
        let hash = decoded.hash.clone();
        inner.pending_payments.insert(hash, req);
        Ok(())
    }

    async fn block_height(&self) -> Result<u32> {
        Ok(self.lock().height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_hold_invoice_lifecycle() {
        let node = MockNode::new();
        let created = node
            .create_hold_invoice(CreateHoldInvoice {
                hash: None,
                invoice: CreateInvoice {
                    description: Some("test".into()),
                    description_hash: None,
                    msats: Msats(5000),
                    expires_at: SystemTime::now() + Duration::from_secs(600),
                },
                cltv_delta: 200,
            })
            .await
            .unwrap();
        let preimage = created.preimage.unwrap();

        node.pay_incoming(&created.hash, Msats(5000));
        assert_eq!(node.invoice_state(&created.hash), Some("held"));

        node.settle_hold_invoice(&preimage).await.unwrap();
        assert_eq!(node.invoice_state(&created.hash), Some("settled"));

        let events = node.take_events();
        assert_eq!(events.len(), 2);
        match &events[0] {
            NodeEvent::Invoice(snap) => assert!(snap.is_held),
            other => panic!("unexpected event {other:?}"),
        }
        match &events[1] {
            NodeEvent::Invoice(snap) => {
                assert!(snap.is_confirmed);
                assert_eq!(snap.preimage.as_deref(), Some(preimage.as_str()));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_settle_requires_accept() {
        let node = MockNode::new();
        let created = node
            .create_hold_invoice(CreateHoldInvoice {
                hash: None,
                invoice: CreateInvoice {
                    description: None,
                    description_hash: None,
                    msats: Msats(1000),
                    expires_at: SystemTime::now() + Duration::from_secs(600),
                },
                cltv_delta: 200,
            })
            .await
            .unwrap();
        let err = node
            .settle_hold_invoice(&created.preimage.unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, PayError::Node(_)));
    }

    #[tokio::test]
    async fn test_external_payment_reveals_preimage() {
        let node = MockNode::new();
        let (bolt11, hash) = node.register_external_invoice(
            Some(Msats(9000)),
            "peer",
            40,
            vec![8, 14, 17],
            Some("peer invoice".into()),
            None,
            SystemTime::now() + Duration::from_secs(600),
        );

        node.pay(PayRequest {
            bolt11,
            max_fee: Msats(500),
            max_timeout_height: None,
        })
        .await
        .unwrap();
        assert!(node.has_pending_payment(&hash));

        node.complete_payment(&hash, Msats(120));
        let events = node.take_events();
        match &events[0] {
            NodeEvent::Payment(snap) => {
                assert!(snap.is_confirmed);
                assert_eq!(snap.msats_paid, Some(Msats(9000)));
                assert_eq!(snap.fee_paid, Some(Msats(120)));
                let preimage = snap.preimage.as_ref().unwrap();
                assert_eq!(PaymentHash(sha256_hex(preimage.as_bytes())), hash);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancel_settled_invoice_rejected() {
        let node = MockNode::new();
        let created = node
            .create_invoice(CreateInvoice {
                description: None,
                description_hash: None,
                msats: Msats(2000),
                expires_at: SystemTime::now() + Duration::from_secs(600),
            })
            .await
            .unwrap();
        node.pay_incoming(&created.hash, Msats(2000));
        assert!(node.cancel_invoice(&created.hash).await.is_err());
    }
}

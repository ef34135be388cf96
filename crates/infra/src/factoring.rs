//! Factoring workflow orchestration.
//!
//! The orchestrator owns the request lifecycle: eligibility re-check, intent
//! persisted before the partner call, bounded-timeout submission, and the
//! reconciliation loop for requests the partner left pending. Financing
//! notifications update invoice state and, on `deposited`, credit the
//! issuer's wallet through the ledger with the partner event id as the
//! idempotency key.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{info, warn};

use apexfin_core::{apply_fee_bps, BasisPoints, Currency, DomainError, UserId};
use apexfin_events::{EventBus, EventEnvelope};
use apexfin_invoicing::{
    FactoringDecision, FactoringPolicy, FinancingStatus, Invoice, InvoiceCommand, InvoiceId,
};
use apexfin_ledger::{TransactionKind, TransactionMetadata};
use apexfin_wallet::WalletId;

use crate::error::{ServiceError, ServiceResult};
use crate::event_store::EventStore;
use crate::fiscal::FiscalProvider;
use crate::invoicing_service::InvoicingService;
use crate::ledger_service::{LedgerService, NewTransaction};
use crate::retry::RetryPolicy;
use crate::wallet_service::WalletService;

/// Factoring request sent to a partner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartnerRequest {
    pub invoice_id: InvoiceId,
    pub amount: u64,
    pub currency: Currency,
    pub due_date: DateTime<Utc>,
    pub client_name: String,
    pub client_tax_id: String,
    /// Issuer credit score (0-1000 scale).
    pub risk_score: u32,
    /// Issuer completed identity verification.
    pub verified: bool,
    pub invoice_age_days: i64,
}

/// Partner answer to a factoring request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PartnerResponse {
    Approved {
        anticipated_amount: u64,
        fee_bps: BasisPoints,
        processing_hours: u32,
    },
    Rejected {
        reason: String,
    },
    ManualReview {
        conditions: Vec<String>,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum PartnerError {
    #[error("partner timed out")]
    Timeout,
    #[error("partner unavailable: {0}")]
    Unavailable(String),
}

/// Outbound factoring partner interface.
#[async_trait]
pub trait FactoringPartner: Send + Sync {
    fn partner_id(&self) -> &str;

    async fn submit(&self, request: &PartnerRequest) -> Result<PartnerResponse, PartnerError>;

    /// Poll the decision for a previously-submitted request.
    async fn poll(&self, invoice_id: InvoiceId) -> Result<PartnerResponse, PartnerError>;
}

#[async_trait]
impl<P> FactoringPartner for Arc<P>
where
    P: FactoringPartner + ?Sized,
{
    fn partner_id(&self) -> &str {
        (**self).partner_id()
    }

    async fn submit(&self, request: &PartnerRequest) -> Result<PartnerResponse, PartnerError> {
        (**self).submit(request).await
    }

    async fn poll(&self, invoice_id: InvoiceId) -> Result<PartnerResponse, PartnerError> {
        (**self).poll(invoice_id).await
    }
}

/// Deterministic simulated partner for tests and demos.
///
/// Decision rules mirror a typical MXN factoring desk: identity
/// verification required, minimum amount, credit-score gate, a lead-time
/// window on the due date, and an invoice-age limit. The fee starts at 250
/// bps and moves with score, lead time, and volume. Amounts above the
/// partner's ceiling go to manual review instead of auto-approval.
pub struct SimulatedPartner {
    /// Minimum financeable amount in cents.
    pub min_amount: u64,
    /// Auto-approval ceiling in cents; larger requests go to manual review.
    pub max_amount: u64,
    pub min_risk_score: u32,
    pub min_lead_days: i64,
    pub max_invoice_age_days: i64,
    decisions: Mutex<HashMap<InvoiceId, PartnerResponse>>,
}

impl Default for SimulatedPartner {
    fn default() -> Self {
        Self {
            min_amount: 500_000,
            max_amount: 50_000_000,
            min_risk_score: 650,
            min_lead_days: 5,
            max_invoice_age_days: 30,
            decisions: Mutex::new(HashMap::new()),
        }
    }
}

impl SimulatedPartner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the response `poll` should return for an invoice. Lets tests
    /// drive the reconciliation path explicitly.
    pub fn set_poll_response(&self, invoice_id: InvoiceId, response: PartnerResponse) {
        if let Ok(mut decisions) = self.decisions.lock() {
            decisions.insert(invoice_id, response);
        }
    }

    fn decide(&self, request: &PartnerRequest) -> PartnerResponse {
        if !request.verified {
            return PartnerResponse::Rejected {
                reason: "kyc_incomplete".to_string(),
            };
        }
        if request.amount < self.min_amount {
            return PartnerResponse::Rejected {
                reason: "amount_too_low".to_string(),
            };
        }
        if request.risk_score < self.min_risk_score {
            return PartnerResponse::Rejected {
                reason: "low_credit_score".to_string(),
            };
        }
        let days_until_due = (request.due_date - Utc::now()).num_days();
        if days_until_due < self.min_lead_days {
            return PartnerResponse::Rejected {
                reason: "due_date_too_close".to_string(),
            };
        }
        if request.invoice_age_days > self.max_invoice_age_days {
            return PartnerResponse::Rejected {
                reason: "invoice_too_old".to_string(),
            };
        }
        if request.amount > self.max_amount {
            return PartnerResponse::ManualReview {
                conditions: vec![
                    "manual underwriting required above the auto-approval ceiling".to_string(),
                ],
            };
        }

        // Base 250 bps, adjusted by score, lead time, and volume.
        let mut fee_bps: i64 = 250;
        if request.risk_score >= 750 {
            fee_bps -= 50;
        } else if request.risk_score < 700 {
            fee_bps += 50;
        }
        if days_until_due > 60 {
            fee_bps += 30;
        } else if days_until_due < 15 {
            fee_bps -= 20;
        }
        if request.amount > 5_000_000 {
            fee_bps -= 20;
        }
        let fee_bps = fee_bps.max(0) as BasisPoints;

        let (anticipated_amount, _) =
            apply_fee_bps(request.amount, fee_bps).unwrap_or((request.amount, 0));
        PartnerResponse::Approved {
            anticipated_amount,
            fee_bps,
            processing_hours: 4,
        }
    }
}

#[async_trait]
impl FactoringPartner for SimulatedPartner {
    fn partner_id(&self) -> &str {
        "konfio"
    }

    async fn submit(&self, request: &PartnerRequest) -> Result<PartnerResponse, PartnerError> {
        let response = self.decide(request);
        if let Ok(mut decisions) = self.decisions.lock() {
            decisions
                .entry(request.invoice_id)
                .or_insert_with(|| response.clone());
        }
        Ok(response)
    }

    async fn poll(&self, invoice_id: InvoiceId) -> Result<PartnerResponse, PartnerError> {
        self.decisions
            .lock()
            .ok()
            .and_then(|decisions| decisions.get(&invoice_id).cloned())
            .ok_or_else(|| PartnerError::Unavailable("unknown request".to_string()))
    }
}

/// Inbound financing notification from a partner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinancingNotification {
    Processing,
    Deposited,
    Collected,
    Overdue,
    #[serde(other)]
    Unknown,
}

impl FinancingNotification {
    pub fn as_status(&self) -> Option<FinancingStatus> {
        match self {
            FinancingNotification::Processing => Some(FinancingStatus::Processing),
            FinancingNotification::Deposited => Some(FinancingStatus::Deposited),
            FinancingNotification::Collected => Some(FinancingStatus::Collected),
            FinancingNotification::Overdue => Some(FinancingStatus::Overdue),
            FinancingNotification::Unknown => None,
        }
    }
}

/// Issuer risk inputs forwarded to the partner.
#[derive(Debug, Clone, Copy)]
pub struct RiskProfile {
    pub risk_score: u32,
    pub verified: bool,
}

pub struct FactoringOrchestrator<S, B, F, P> {
    invoicing: Arc<InvoicingService<S, B, F>>,
    wallets: Arc<WalletService<S, B>>,
    ledger: Arc<LedgerService<S, B>>,
    partner: P,
    policy: FactoringPolicy,
    retry: RetryPolicy,
    partner_timeout: Duration,
}

impl<S, B, F, P> FactoringOrchestrator<S, B, F, P>
where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
    F: FiscalProvider,
    P: FactoringPartner,
{
    pub fn new(
        invoicing: Arc<InvoicingService<S, B, F>>,
        wallets: Arc<WalletService<S, B>>,
        ledger: Arc<LedgerService<S, B>>,
        partner: P,
    ) -> Self {
        Self {
            invoicing,
            wallets,
            ledger,
            partner,
            policy: FactoringPolicy::default(),
            retry: RetryPolicy::exponential(
                5,
                Duration::from_millis(500),
                Duration::from_secs(60),
            ),
            partner_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_policy(mut self, policy: FactoringPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_partner_timeout(mut self, timeout: Duration) -> Self {
        self.partner_timeout = timeout;
        self
    }

    /// Submit an invoice for factoring.
    ///
    /// Eligibility is re-checked first; an ineligible invoice fails without
    /// contacting the partner. The pending intent is persisted before the
    /// network call, so a timeout leaves the request `pending` for the
    /// reconciliation job; the synchronous caller gets `PartnerTimeout`.
    pub async fn request(&self, invoice_id: InvoiceId, risk: RiskProfile) -> ServiceResult<Invoice> {
        let invoice = self.invoicing.get(invoice_id)?;
        let now = Utc::now();
        let blockers = invoice.factoring_blockers(&self.policy, now);
        if !blockers.is_empty() {
            return Err(ServiceError::Domain(DomainError::not_eligible(blockers)));
        }

        let invoice = self.invoicing.execute(
            invoice_id,
            InvoiceCommand::RequestFactoring {
                partner_id: self.partner.partner_id().to_string(),
                occurred_at: now,
            },
        )?;

        let request = self.partner_request(&invoice, risk, now);
        match tokio::time::timeout(self.partner_timeout, self.partner.submit(&request)).await {
            Ok(Ok(response)) => self.record_response(invoice_id, response),
            Ok(Err(e)) => {
                warn!(invoice = %invoice_id, error = %e, "partner submission failed, leaving request pending");
                Err(ServiceError::Domain(DomainError::PartnerTimeout))
            }
            Err(_) => {
                warn!(invoice = %invoice_id, "partner submission timed out, leaving request pending");
                Err(ServiceError::Domain(DomainError::PartnerTimeout))
            }
        }
    }

    /// Reconciliation job for requests the partner left pending.
    ///
    /// Polls with backoff up to the retry budget; after exhaustion the
    /// request is marked rejected with a timeout reason and must be
    /// resubmitted manually.
    pub async fn reconcile(&self, invoice_id: InvoiceId) -> ServiceResult<Invoice> {
        for attempt in 1..=self.retry.max_attempts {
            tokio::time::sleep(self.retry.delay_for_attempt(attempt)).await;

            match tokio::time::timeout(self.partner_timeout, self.partner.poll(invoice_id)).await {
                Ok(Ok(PartnerResponse::ManualReview { .. })) => {
                    info!(invoice = %invoice_id, attempt, "request still in manual review");
                }
                Ok(Ok(response)) => return self.record_response(invoice_id, response),
                Ok(Err(e)) => {
                    warn!(invoice = %invoice_id, attempt, error = %e, "partner poll failed");
                }
                Err(_) => {
                    warn!(invoice = %invoice_id, attempt, "partner poll timed out");
                }
            }
        }

        self.invoicing.execute(
            invoice_id,
            InvoiceCommand::RecordFactoringDecision {
                decision: FactoringDecision::Rejected {
                    reason: "partner did not answer within the reconciliation window".to_string(),
                },
                occurred_at: Utc::now(),
            },
        )
    }

    /// Partner financing notification, keyed by the partner event id.
    ///
    /// Updates only `factoring.financing_status`. The first time the
    /// financing status reaches `deposited` (or a later stage, when
    /// notifications arrive out of order) the anticipated amount is credited
    /// to the issuer's wallet through a ledger deposit whose idempotency key
    /// is the partner event id, so duplicate delivery cannot double-credit.
    pub fn on_financing_update(
        &self,
        invoice_id: InvoiceId,
        notification: FinancingNotification,
        partner_event_id: &str,
    ) -> ServiceResult<Invoice> {
        let Some(status) = notification.as_status() else {
            warn!(invoice = %invoice_id, event = partner_event_id, "unknown financing status, routing to manual review");
            return self.invoicing.get(invoice_id);
        };

        let before = self.invoicing.get(invoice_id)?;
        let invoice = self.invoicing.execute(
            invoice_id,
            InvoiceCommand::UpdateFinancingStatus {
                status,
                occurred_at: Utc::now(),
            },
        )?;

        // Credit on the transition into the deposited stage, wherever it is
        // first observed. A `collected` arriving ahead of its `deposited`
        // still implies the money moved; the absorbed `deposited` that
        // follows must not credit a second time.
        let was_deposited = deposit_stage_reached(&before);
        let is_deposited = deposit_stage_reached(&invoice);
        if is_deposited && !was_deposited {
            self.credit_deposit(&invoice, partner_event_id)?;
        }
        Ok(invoice)
    }

    fn record_response(
        &self,
        invoice_id: InvoiceId,
        response: PartnerResponse,
    ) -> ServiceResult<Invoice> {
        match response {
            PartnerResponse::Approved {
                anticipated_amount,
                fee_bps,
                ..
            } => self.invoicing.execute(
                invoice_id,
                InvoiceCommand::RecordFactoringDecision {
                    decision: FactoringDecision::Approved {
                        anticipated_amount,
                        fee_bps,
                    },
                    occurred_at: Utc::now(),
                },
            ),
            PartnerResponse::Rejected { reason } => self.invoicing.execute(
                invoice_id,
                InvoiceCommand::RecordFactoringDecision {
                    decision: FactoringDecision::Rejected { reason },
                    occurred_at: Utc::now(),
                },
            ),
            // The partner kept the request; reconciliation takes over.
            PartnerResponse::ManualReview { .. } => self.invoicing.get(invoice_id),
        }
    }

    fn credit_deposit(&self, invoice: &Invoice, partner_event_id: &str) -> ServiceResult<()> {
        let factoring = invoice
            .factoring()
            .ok_or_else(|| ServiceError::Domain(DomainError::validation("no factoring state")))?;
        let amount = factoring.anticipated_amount.ok_or_else(|| {
            ServiceError::Domain(DomainError::validation("deposit without an approved amount"))
        })?;
        let issuer: UserId = invoice
            .issuer()
            .ok_or(ServiceError::Domain(DomainError::UnknownInvoice))?;

        let wallet: WalletId = self
            .wallets
            .get_or_create(issuer, invoice.currency())?
            .id_typed();

        let transaction = self.ledger.open(NewTransaction {
            kind: TransactionKind::Deposit,
            from_wallet: None,
            to_wallet: Some(wallet),
            amount,
            currency: invoice.currency(),
            description: format!(
                "factoring deposit for invoice {}",
                invoice.invoice_number().unwrap_or_default()
            ),
            metadata: TransactionMetadata {
                order_id: None,
                invoice_id: Some((invoice.id_typed().0).into()),
                partner_id: Some(factoring.partner_id.clone()),
                fees: factoring
                    .fee_bps
                    .and_then(|bps| apply_fee_bps(invoice.amount(), bps).ok())
                    .map(|(_, fee)| fee),
            },
            idempotency_key: partner_event_id.to_string(),
        })?;
        self.ledger.complete(transaction.id_typed())?;

        info!(
            invoice = %invoice.id_typed(),
            wallet = %wallet,
            amount,
            "factoring deposit credited"
        );
        Ok(())
    }

    fn partner_request(
        &self,
        invoice: &Invoice,
        risk: RiskProfile,
        now: DateTime<Utc>,
    ) -> PartnerRequest {
        let client = invoice.client();
        PartnerRequest {
            invoice_id: invoice.id_typed(),
            amount: invoice.amount(),
            currency: invoice.currency(),
            due_date: invoice.due_date().unwrap_or(now),
            client_name: client.map(|c| c.name.clone()).unwrap_or_default(),
            client_tax_id: client.map(|c| c.tax_id.clone()).unwrap_or_default(),
            risk_score: risk.risk_score,
            verified: risk.verified,
            invoice_age_days: invoice.age_days(now),
        }
    }
}

/// Whether the invoice's financing has reached the deposited stage (the
/// deposit itself or anything after it).
fn deposit_stage_reached(invoice: &Invoice) -> bool {
    matches!(
        invoice.factoring().and_then(|f| f.financing_status),
        Some(
            FinancingStatus::Deposited | FinancingStatus::Overdue | FinancingStatus::Collected
        )
    )
}

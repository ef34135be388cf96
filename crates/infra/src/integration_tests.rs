//! End-to-end flows across the invoice, factoring, ledger, and webhook
//! services, wired against the in-memory store and bus.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use apexfin_core::{Currency, DomainError, UserId};
use apexfin_events::{EventEnvelope, InMemoryEventBus};
use apexfin_invoicing::{
    ClientInfo, FactoringRequestStatus, FinancingStatus, InvoiceId, InvoiceItem, InvoiceStatus,
    StampData,
};

use crate::error::ServiceError;
use crate::event_store::InMemoryEventStore;
use crate::factoring::{
    FactoringOrchestrator, FactoringPartner, FinancingNotification, PartnerError, PartnerRequest,
    PartnerResponse, RiskProfile, SimulatedPartner,
};
use crate::fiscal::{AcceptingFiscalProvider, FiscalEvent};
use crate::invoicing_service::{InvoicingService, NewInvoice};
use crate::ledger_service::LedgerService;
use crate::retry::RetryPolicy;
use crate::wallet_service::WalletService;
use crate::webhook::{FactoringEvent, WebhookEvent, WebhookOutcome, WebhookReconciler};

type Store = Arc<InMemoryEventStore>;
type Bus = Arc<InMemoryEventBus<EventEnvelope<JsonValue>>>;
type Partner = Arc<SimulatedPartner>;

struct Env {
    wallets: Arc<WalletService<Store, Bus>>,
    invoicing: Arc<InvoicingService<Store, Bus, AcceptingFiscalProvider>>,
    partner: Partner,
    orchestrator: Arc<FactoringOrchestrator<Store, Bus, AcceptingFiscalProvider, Partner>>,
    reconciler: WebhookReconciler<Store, Bus, AcceptingFiscalProvider, Partner>,
}

fn env() -> Env {
    apexfin_observability::init();
    let store: Store = Arc::new(InMemoryEventStore::new());
    let bus: Bus = Arc::new(InMemoryEventBus::new());
    let wallets = Arc::new(WalletService::new(store.clone(), bus.clone()));
    let ledger = Arc::new(LedgerService::new(store.clone(), bus.clone(), wallets.clone()));
    let invoicing = Arc::new(InvoicingService::new(store, bus, AcceptingFiscalProvider));
    let partner: Partner = Arc::new(SimulatedPartner::new());
    let orchestrator = Arc::new(
        FactoringOrchestrator::new(invoicing.clone(), wallets.clone(), ledger, partner.clone())
            .with_retry(RetryPolicy::fixed(3, Duration::from_millis(1)))
            .with_partner_timeout(Duration::from_millis(50)),
    );
    let reconciler = WebhookReconciler::new(invoicing.clone(), orchestrator.clone());
    Env {
        wallets,
        invoicing,
        partner,
        orchestrator,
        reconciler,
    }
}

fn new_invoice(issuer: UserId, subtotal: u64, tax: u64) -> NewInvoice {
    NewInvoice {
        issuer,
        client: ClientInfo {
            name: "Acme SA de CV".to_string(),
            tax_id: "AAA010101AAA".to_string(),
            email: "billing@acme.test".to_string(),
            address: None,
        },
        items: vec![InvoiceItem {
            description: "consulting".to_string(),
            quantity: 1,
            unit_price: subtotal,
            total: subtotal,
        }],
        tax,
        currency: Currency::Mxn,
        due_date: Utc::now() + ChronoDuration::days(30),
        description: String::new(),
    }
}

fn stamp(uuid: Uuid) -> StampData {
    StampData {
        uuid,
        seal: "SEAL==".to_string(),
        xml_url: "https://fiscal.test/cfdi.xml".to_string(),
        pdf_url: "https://fiscal.test/cfdi.pdf".to_string(),
        stamped_at: Utc::now(),
    }
}

fn stamped_event(event_id: &str, invoice_id: InvoiceId, uuid: Uuid) -> WebhookEvent {
    let stamp = stamp(uuid);
    WebhookEvent::Fiscal(FiscalEvent::Stamped {
        event_id: event_id.to_string(),
        invoice_id,
        uuid: stamp.uuid,
        seal: stamp.seal,
        xml_url: stamp.xml_url,
        pdf_url: stamp.pdf_url,
        stamped_at: stamp.stamped_at,
    })
}

fn financing_event(
    event_id: &str,
    invoice_id: InvoiceId,
    status: FinancingNotification,
) -> WebhookEvent {
    WebhookEvent::Factoring(FactoringEvent::FinancingUpdate {
        event_id: event_id.to_string(),
        invoice_id,
        status,
    })
}

fn good_risk() -> RiskProfile {
    RiskProfile {
        risk_score: 720,
        verified: true,
    }
}

#[tokio::test]
async fn factoring_happy_path_credits_the_issuer_once() {
    let env = env();
    let issuer = UserId::new();
    let id = env
        .invoicing
        .create(new_invoice(issuer, 500_000, 100_000))
        .unwrap()
        .id_typed();
    env.invoicing.issue(id).unwrap();

    let stamped = stamped_event("evt-stamp-1", id, Uuid::now_v7());
    assert_eq!(
        env.reconciler.process(stamped.clone()).unwrap(),
        WebhookOutcome::Applied
    );
    assert_eq!(env.invoicing.get(id).unwrap().status(), InvoiceStatus::Active);
    assert_eq!(
        env.reconciler.process(stamped).unwrap(),
        WebhookOutcome::Duplicate
    );

    let invoice = env.orchestrator.request(id, good_risk()).await.unwrap();
    let factoring = invoice.factoring().unwrap();
    assert_eq!(factoring.request_status, FactoringRequestStatus::Approved);
    assert_eq!(factoring.fee_bps, Some(250));
    assert_eq!(factoring.anticipated_amount, Some(585_000));

    let deposited = financing_event("evt-dep-1", id, FinancingNotification::Deposited);
    assert_eq!(
        env.reconciler.process(deposited.clone()).unwrap(),
        WebhookOutcome::Applied
    );
    let wallet_id = env.wallets.lookup(issuer, Currency::Mxn).unwrap();
    assert_eq!(env.wallets.get(wallet_id).unwrap().balance(), 585_000);

    // Redelivery of the same partner event cannot double-credit.
    assert_eq!(
        env.reconciler.process(deposited).unwrap(),
        WebhookOutcome::Duplicate
    );
    assert_eq!(env.wallets.get(wallet_id).unwrap().balance(), 585_000);

    // Neither can a fresh event id carrying the same status.
    let replayed = financing_event("evt-dep-2", id, FinancingNotification::Deposited);
    assert_eq!(
        env.reconciler.process(replayed).unwrap(),
        WebhookOutcome::Applied
    );
    assert_eq!(env.wallets.get(wallet_id).unwrap().balance(), 585_000);

    // A stale `processing` update arriving after the deposit is absorbed.
    let stale = financing_event("evt-proc-1", id, FinancingNotification::Processing);
    assert_eq!(
        env.reconciler.process(stale).unwrap(),
        WebhookOutcome::Applied
    );
    assert_eq!(
        env.invoicing
            .get(id)
            .unwrap()
            .factoring()
            .unwrap()
            .financing_status,
        Some(FinancingStatus::Deposited)
    );
}

#[tokio::test]
async fn collected_arriving_before_deposited_still_credits_once() {
    let env = env();
    let issuer = UserId::new();
    let id = env
        .invoicing
        .create(new_invoice(issuer, 500_000, 100_000))
        .unwrap()
        .id_typed();
    env.invoicing.issue(id).unwrap();
    env.reconciler
        .process(stamped_event("evt-stamp-1", id, Uuid::now_v7()))
        .unwrap();
    env.orchestrator.request(id, good_risk()).await.unwrap();

    // The partner's notifications arrive out of order: collection first.
    let collected = financing_event("evt-col-1", id, FinancingNotification::Collected);
    assert_eq!(
        env.reconciler.process(collected).unwrap(),
        WebhookOutcome::Applied
    );
    let wallet_id = env.wallets.lookup(issuer, Currency::Mxn).unwrap();
    assert_eq!(env.wallets.get(wallet_id).unwrap().balance(), 585_000);

    // The late `deposited` is absorbed by the status rank and must not
    // credit a second time.
    let deposited = financing_event("evt-dep-1", id, FinancingNotification::Deposited);
    assert_eq!(
        env.reconciler.process(deposited).unwrap(),
        WebhookOutcome::Applied
    );
    assert_eq!(env.wallets.get(wallet_id).unwrap().balance(), 585_000);
    assert_eq!(
        env.invoicing
            .get(id)
            .unwrap()
            .factoring()
            .unwrap()
            .financing_status,
        Some(FinancingStatus::Collected)
    );
}

#[tokio::test]
async fn manual_review_resolves_through_reconciliation() {
    let env = env();
    let id = env
        .invoicing
        .create(new_invoice(UserId::new(), 60_000_000, 0))
        .unwrap()
        .id_typed();
    env.invoicing.issue(id).unwrap();
    env.reconciler
        .process(stamped_event("evt-stamp-1", id, Uuid::now_v7()))
        .unwrap();

    // Above the partner's auto-approval ceiling: the request stays pending.
    let invoice = env.orchestrator.request(id, good_risk()).await.unwrap();
    assert_eq!(
        invoice.factoring().unwrap().request_status,
        FactoringRequestStatus::Pending
    );

    env.partner.set_poll_response(
        id,
        PartnerResponse::Approved {
            anticipated_amount: 58_500_000,
            fee_bps: 250,
            processing_hours: 4,
        },
    );
    let invoice = env.orchestrator.reconcile(id).await.unwrap();
    let factoring = invoice.factoring().unwrap();
    assert_eq!(factoring.request_status, FactoringRequestStatus::Approved);
    assert_eq!(factoring.anticipated_amount, Some(58_500_000));
}

#[tokio::test]
async fn reconciliation_exhaustion_rejects_the_request() {
    let env = env();
    let id = env
        .invoicing
        .create(new_invoice(UserId::new(), 60_000_000, 0))
        .unwrap()
        .id_typed();
    env.invoicing.issue(id).unwrap();
    env.reconciler
        .process(stamped_event("evt-stamp-1", id, Uuid::now_v7()))
        .unwrap();
    env.orchestrator.request(id, good_risk()).await.unwrap();

    // The partner keeps answering manual review; the budget runs out.
    let invoice = env.orchestrator.reconcile(id).await.unwrap();
    let factoring = invoice.factoring().unwrap();
    assert_eq!(factoring.request_status, FactoringRequestStatus::Rejected);
    assert!(factoring
        .rejection_reason
        .as_deref()
        .unwrap()
        .contains("reconciliation window"));
}

struct StalledPartner;

#[async_trait::async_trait]
impl FactoringPartner for StalledPartner {
    fn partner_id(&self) -> &str {
        "stalled"
    }

    async fn submit(&self, _request: &PartnerRequest) -> Result<PartnerResponse, PartnerError> {
        std::future::pending().await
    }

    async fn poll(&self, _invoice_id: InvoiceId) -> Result<PartnerResponse, PartnerError> {
        std::future::pending().await
    }
}

#[tokio::test]
async fn partner_timeout_leaves_the_request_pending() {
    let store: Store = Arc::new(InMemoryEventStore::new());
    let bus: Bus = Arc::new(InMemoryEventBus::new());
    let wallets = Arc::new(WalletService::new(store.clone(), bus.clone()));
    let ledger = Arc::new(LedgerService::new(store.clone(), bus.clone(), wallets.clone()));
    let invoicing = Arc::new(InvoicingService::new(store, bus, AcceptingFiscalProvider));
    let orchestrator =
        FactoringOrchestrator::new(invoicing.clone(), wallets, ledger, StalledPartner)
            .with_retry(RetryPolicy::fixed(2, Duration::from_millis(1)))
            .with_partner_timeout(Duration::from_millis(5));

    let id = invoicing
        .create(new_invoice(UserId::new(), 500_000, 100_000))
        .unwrap()
        .id_typed();
    invoicing.issue(id).unwrap();
    invoicing.on_stamp_confirmed(id, stamp(Uuid::now_v7())).unwrap();

    let err = orchestrator.request(id, good_risk()).await.unwrap_err();
    assert!(matches!(
        err,
        ServiceError::Domain(DomainError::PartnerTimeout)
    ));
    assert_eq!(
        invoicing.get(id).unwrap().factoring().unwrap().request_status,
        FactoringRequestStatus::Pending
    );

    // Polls never answer either; exhaustion closes the request.
    let invoice = orchestrator.reconcile(id).await.unwrap();
    assert_eq!(
        invoice.factoring().unwrap().request_status,
        FactoringRequestStatus::Rejected
    );
}

#[tokio::test]
async fn draft_invoice_is_not_eligible() {
    let env = env();
    let id = env
        .invoicing
        .create(new_invoice(UserId::new(), 500_000, 0))
        .unwrap()
        .id_typed();

    let err = env.orchestrator.request(id, good_risk()).await.unwrap_err();
    assert!(matches!(
        err,
        ServiceError::Domain(DomainError::FactoringNotEligible { .. })
    ));
}

#[test]
fn cancellation_webhooks_reconcile_out_of_order() {
    let env = env();
    let id = env
        .invoicing
        .create(new_invoice(UserId::new(), 500_000, 0))
        .unwrap()
        .id_typed();
    env.invoicing.issue(id).unwrap();

    let uuid = Uuid::now_v7();
    let cancel = WebhookEvent::Fiscal(FiscalEvent::Cancelled {
        event_id: "evt-cancel-1".to_string(),
        uuid,
        reason: "client request".to_string(),
    });

    // The cancellation arrived before its stamp; it stays unprocessed so a
    // redelivery can land once the stamp is known.
    assert_eq!(
        env.reconciler.process(cancel.clone()).unwrap(),
        WebhookOutcome::ManualReview
    );

    env.reconciler
        .process(stamped_event("evt-stamp-1", id, uuid))
        .unwrap();
    assert_eq!(
        env.reconciler.process(cancel).unwrap(),
        WebhookOutcome::Applied
    );
    assert_eq!(
        env.invoicing.get(id).unwrap().status(),
        InvoiceStatus::Cancelled
    );
}

#[test]
fn unknown_webhook_payloads_route_to_manual_review() {
    let env = env();

    let event: WebhookEvent =
        serde_json::from_str(r#"{"source":"fiscal","type":"address_updated"}"#).unwrap();
    assert_eq!(
        env.reconciler.process(event).unwrap(),
        WebhookOutcome::ManualReview
    );

    let event: WebhookEvent =
        serde_json::from_str(r#"{"source":"factoring","type":"limit_changed"}"#).unwrap();
    assert_eq!(
        env.reconciler.process(event).unwrap(),
        WebhookOutcome::ManualReview
    );
}

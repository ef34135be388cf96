//! Shared idempotent webhook dispatch for fiscal and factoring events.
//!
//! Every inbound event carries a provider-assigned id. The reconciler
//! persists processed ids and consults current entity state before applying
//! any transition, so each side effect lands at most once under duplicate or
//! out-of-order delivery. Unrecognized events route to the manual-review
//! path and stay unprocessed, never silently coerced.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::warn;

use apexfin_events::{EventBus, EventEnvelope};
use apexfin_invoicing::{InvoiceId, InvoiceStatus, StampData};

use crate::error::ServiceResult;
use crate::event_store::EventStore;
use crate::factoring::{FactoringOrchestrator, FactoringPartner, FinancingNotification};
use crate::fiscal::{FiscalEvent, FiscalProvider};
use crate::invoicing_service::InvoicingService;

/// Inbound factoring partner webhook event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FactoringEvent {
    FinancingUpdate {
        event_id: String,
        invoice_id: InvoiceId,
        status: FinancingNotification,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum WebhookEvent {
    Fiscal(FiscalEvent),
    Factoring(FactoringEvent),
}

/// What the reconciler did with an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookOutcome {
    /// The transition was applied (or absorbed as an entity-level no-op).
    Applied,
    /// The provider event id was already processed; nothing happened.
    Duplicate,
    /// The event could not be applied automatically and needs an operator.
    ManualReview,
}

pub struct WebhookReconciler<S, B, F, P> {
    invoicing: Arc<InvoicingService<S, B, F>>,
    orchestrator: Arc<FactoringOrchestrator<S, B, F, P>>,
    processed: RwLock<HashSet<String>>,
}

impl<S, B, F, P> WebhookReconciler<S, B, F, P>
where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
    F: FiscalProvider,
    P: FactoringPartner,
{
    pub fn new(
        invoicing: Arc<InvoicingService<S, B, F>>,
        orchestrator: Arc<FactoringOrchestrator<S, B, F, P>>,
    ) -> Self {
        Self {
            invoicing,
            orchestrator,
            processed: RwLock::new(HashSet::new()),
        }
    }

    /// Apply one inbound event idempotently.
    pub fn process(&self, event: WebhookEvent) -> ServiceResult<WebhookOutcome> {
        let Some(event_id) = event_id(&event) else {
            warn!("unrecognized webhook event, routing to manual review");
            return Ok(WebhookOutcome::ManualReview);
        };
        let event_id = event_id.to_string();
        if self.is_processed(&event_id) {
            return Ok(WebhookOutcome::Duplicate);
        }

        let outcome = match event {
            WebhookEvent::Fiscal(fiscal) => self.process_fiscal(fiscal)?,
            WebhookEvent::Factoring(factoring) => self.process_factoring(factoring)?,
        };

        if outcome == WebhookOutcome::Applied {
            self.mark_processed(event_id);
        }
        Ok(outcome)
    }

    fn process_fiscal(&self, event: FiscalEvent) -> ServiceResult<WebhookOutcome> {
        match event {
            FiscalEvent::Stamped {
                invoice_id,
                uuid,
                seal,
                xml_url,
                pdf_url,
                stamped_at,
                ..
            } => {
                self.invoicing.on_stamp_confirmed(
                    invoice_id,
                    StampData {
                        uuid,
                        seal,
                        xml_url,
                        pdf_url,
                        stamped_at,
                    },
                )?;
                Ok(WebhookOutcome::Applied)
            }
            FiscalEvent::Cancelled { uuid, reason, .. } => {
                let Some(invoice_id) = self.invoicing.invoice_for_stamp(uuid) else {
                    // Possibly delivered ahead of its stamped event; leave
                    // unprocessed so a redelivery can land.
                    warn!(%uuid, "fiscal cancellation for an unknown stamp");
                    return Ok(WebhookOutcome::ManualReview);
                };
                if self.invoicing.get(invoice_id)?.status() == InvoiceStatus::Cancelled {
                    return Ok(WebhookOutcome::Applied);
                }
                self.invoicing.cancel(invoice_id, reason)?;
                Ok(WebhookOutcome::Applied)
            }
            FiscalEvent::StampError {
                invoice_id,
                code,
                message,
                ..
            } => {
                self.invoicing.on_stamp_error(invoice_id, code, message)?;
                Ok(WebhookOutcome::Applied)
            }
            FiscalEvent::EmailSent {
                invoice_id,
                recipient,
                at,
                ..
            } => {
                self.invoicing.on_email_sent(invoice_id, recipient, at)?;
                Ok(WebhookOutcome::Applied)
            }
            FiscalEvent::Unknown => {
                warn!("unknown fiscal event kind, routing to manual review");
                Ok(WebhookOutcome::ManualReview)
            }
        }
    }

    fn process_factoring(&self, event: FactoringEvent) -> ServiceResult<WebhookOutcome> {
        match event {
            FactoringEvent::FinancingUpdate {
                event_id,
                invoice_id,
                status,
            } => {
                if status.as_status().is_none() {
                    warn!(invoice = %invoice_id, "unknown financing status, routing to manual review");
                    return Ok(WebhookOutcome::ManualReview);
                }
                self.orchestrator
                    .on_financing_update(invoice_id, status, &event_id)?;
                Ok(WebhookOutcome::Applied)
            }
            FactoringEvent::Unknown => {
                warn!("unknown factoring event kind, routing to manual review");
                Ok(WebhookOutcome::ManualReview)
            }
        }
    }

    fn is_processed(&self, event_id: &str) -> bool {
        self.processed
            .read()
            .map(|processed| processed.contains(event_id))
            .unwrap_or(false)
    }

    fn mark_processed(&self, event_id: String) {
        if let Ok(mut processed) = self.processed.write() {
            processed.insert(event_id);
        }
    }
}

fn event_id(event: &WebhookEvent) -> Option<&str> {
    match event {
        WebhookEvent::Fiscal(fiscal) => fiscal.event_id(),
        WebhookEvent::Factoring(FactoringEvent::FinancingUpdate { event_id, .. }) => {
            Some(event_id)
        }
        WebhookEvent::Factoring(FactoringEvent::Unknown) => None,
    }
}

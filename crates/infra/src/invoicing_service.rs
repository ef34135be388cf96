//! Application service for the invoice lifecycle.
//!
//! Outbound: validates and submits invoices to the fiscal provider, with
//! intent persisted (`sent`) before the network call. Inbound: applies
//! provider webhooks idempotently, logging anomalies instead of mutating an
//! already-stamped invoice.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use tracing::warn;
use uuid::Uuid;

use apexfin_core::{AggregateId, Currency, DomainError, UserId};
use apexfin_events::{EventBus, EventEnvelope};
use apexfin_invoicing::{
    ClientInfo, CreateInvoice, Invoice, InvoiceCommand, InvoiceId, InvoiceItem, InvoiceStatus,
    StampData,
};

use crate::command_dispatcher::{CommandDispatcher, DispatchError};
use crate::error::{ServiceError, ServiceResult};
use crate::event_store::EventStore;
use crate::fiscal::FiscalProvider;

const AGGREGATE_TYPE: &str = "invoice";
const MAX_ATTEMPTS: u32 = 5;

/// Request to create a draft invoice.
#[derive(Debug, Clone)]
pub struct NewInvoice {
    pub issuer: UserId,
    pub client: ClientInfo,
    pub items: Vec<InvoiceItem>,
    pub tax: u64,
    pub currency: Currency,
    pub due_date: DateTime<Utc>,
    pub description: String,
}

pub struct InvoicingService<S, B, F> {
    dispatcher: CommandDispatcher<S, B>,
    fiscal: F,
    /// Fiscal stamp uuid → invoice, for webhooks that only carry the uuid.
    stamp_index: RwLock<HashMap<Uuid, InvoiceId>>,
}

impl<S, B, F> InvoicingService<S, B, F>
where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
    F: FiscalProvider,
{
    pub fn new(store: S, bus: B, fiscal: F) -> Self {
        Self {
            dispatcher: CommandDispatcher::new(store, bus),
            fiscal,
            stamp_index: RwLock::new(HashMap::new()),
        }
    }

    pub fn create(&self, request: NewInvoice) -> ServiceResult<Invoice> {
        let invoice_id = InvoiceId::new(AggregateId::new());
        let command = InvoiceCommand::Create(CreateInvoice {
            invoice_id,
            issuer: request.issuer,
            client: request.client,
            items: request.items,
            tax: request.tax,
            currency: request.currency,
            due_date: request.due_date,
            description: request.description,
            occurred_at: Utc::now(),
        });
        self.execute(invoice_id, command)
    }

    pub fn get(&self, invoice_id: InvoiceId) -> ServiceResult<Invoice> {
        let invoice = self
            .dispatcher
            .hydrate(invoice_id.0, |id| Invoice::empty(InvoiceId::new(id)))
            .map_err(ServiceError::from)?;
        if !invoice.is_created() {
            return Err(ServiceError::Domain(DomainError::UnknownInvoice));
        }
        Ok(invoice)
    }

    /// Submit an invoice for stamping: `draft`/`error` → `sent`, then the
    /// outbound call. A synchronous provider failure leaves the invoice
    /// `sent`; the definitive outcome arrives via webhook either way.
    pub fn issue(&self, invoice_id: InvoiceId) -> ServiceResult<Invoice> {
        let invoice = self.execute(
            invoice_id,
            InvoiceCommand::Issue {
                occurred_at: Utc::now(),
            },
        )?;

        if let Err(e) = self.fiscal.submit(&invoice) {
            warn!(invoice = %invoice_id, error = %e, "stamping submission failed, awaiting webhook retry");
            return Err(ServiceError::Domain(DomainError::StampingFailed(
                e.to_string(),
            )));
        }
        Ok(invoice)
    }

    /// Cancel an active invoice.
    pub fn cancel(&self, invoice_id: InvoiceId, reason: String) -> ServiceResult<Invoice> {
        self.execute(
            invoice_id,
            InvoiceCommand::Cancel {
                reason,
                occurred_at: Utc::now(),
            },
        )
    }

    /// Webhook: the provider confirmed the stamp.
    pub fn on_stamp_confirmed(&self, invoice_id: InvoiceId, stamp: StampData) -> ServiceResult<Invoice> {
        let current = self.get(invoice_id)?;
        if current.status() == InvoiceStatus::Active {
            match current.stamp() {
                Some(existing) if existing.uuid == stamp.uuid => {
                    // Duplicate delivery; nothing to do.
                    return Ok(current);
                }
                _ => {
                    warn!(
                        invoice = %invoice_id,
                        incoming_uuid = %stamp.uuid,
                        "stamp confirmation with a different uuid on an active invoice, ignoring"
                    );
                    return Ok(current);
                }
            }
        }

        let uuid = stamp.uuid;
        let invoice = self.execute(invoice_id, InvoiceCommand::ConfirmStamp { stamp })?;
        if let Ok(mut index) = self.stamp_index.write() {
            index.insert(uuid, invoice_id);
        }
        Ok(invoice)
    }

    /// Webhook: the provider failed to stamp. Late errors on an active
    /// invoice are anomalies, logged and absorbed.
    pub fn on_stamp_error(
        &self,
        invoice_id: InvoiceId,
        code: String,
        message: String,
    ) -> ServiceResult<Invoice> {
        let current = self.get(invoice_id)?;
        if current.status() == InvoiceStatus::Active {
            warn!(
                invoice = %invoice_id,
                code,
                "stamp error received after confirmation, ignoring"
            );
            return Ok(current);
        }
        self.execute(
            invoice_id,
            InvoiceCommand::RecordStampError {
                code,
                message,
                occurred_at: Utc::now(),
            },
        )
    }

    /// Webhook: the provider sent the invoice email.
    pub fn on_email_sent(
        &self,
        invoice_id: InvoiceId,
        recipient: String,
        sent_at: DateTime<Utc>,
    ) -> ServiceResult<Invoice> {
        self.execute(invoice_id, InvoiceCommand::RecordEmail { recipient, sent_at })
    }

    /// Resolve a fiscal stamp uuid to its invoice.
    pub fn invoice_for_stamp(&self, uuid: Uuid) -> Option<InvoiceId> {
        self.stamp_index
            .read()
            .ok()
            .and_then(|index| index.get(&uuid).copied())
    }

    /// Execute an invoice command with bounded optimistic retry.
    pub fn execute(&self, invoice_id: InvoiceId, command: InvoiceCommand) -> ServiceResult<Invoice> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self
                .dispatcher
                .dispatch(invoice_id.0, AGGREGATE_TYPE, &command, |id| {
                    Invoice::empty(InvoiceId::new(id))
                }) {
                Ok((invoice, _)) => return Ok(invoice),
                Err(DispatchError::Concurrency(msg)) if attempt < MAX_ATTEMPTS => {
                    warn!(invoice = %invoice_id, attempt, %msg, "invoice append conflicted, retrying");
                }
                Err(e) => return Err(ServiceError::from(e)),
            }
        }
    }
}

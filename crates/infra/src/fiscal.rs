//! Fiscal provider integration: outbound stamping submission and the
//! inbound webhook event shapes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use apexfin_core::DomainResult;
use apexfin_invoicing::{Invoice, InvoiceId};

/// Outbound stamping submission.
///
/// Submission is fire-and-forget from the core's perspective: the invoice is
/// marked `sent` before the call, and the outcome arrives later as a webhook
/// (`stamped` or `stamp_error`).
pub trait FiscalProvider: Send + Sync {
    fn submit(&self, invoice: &Invoice) -> DomainResult<()>;
}

/// Provider stub that accepts every submission. The stamp confirmation still
/// has to arrive via webhook, so tests drive both halves explicitly.
#[derive(Debug, Default)]
pub struct AcceptingFiscalProvider;

impl FiscalProvider for AcceptingFiscalProvider {
    fn submit(&self, _invoice: &Invoice) -> DomainResult<()> {
        Ok(())
    }
}

/// Inbound fiscal webhook event.
///
/// Closed union: an unrecognized `type` tag deserializes to `Unknown` and is
/// routed to the manual-review path, never silently coerced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FiscalEvent {
    Stamped {
        /// Provider-assigned delivery id, used for idempotent dispatch.
        event_id: String,
        invoice_id: InvoiceId,
        uuid: Uuid,
        seal: String,
        xml_url: String,
        pdf_url: String,
        stamped_at: DateTime<Utc>,
    },
    /// The provider cancelled a stamped invoice; resolved to an invoice via
    /// the fiscal uuid recorded at stamping time.
    Cancelled {
        event_id: String,
        uuid: Uuid,
        reason: String,
    },
    StampError {
        event_id: String,
        invoice_id: InvoiceId,
        code: String,
        message: String,
    },
    EmailSent {
        event_id: String,
        invoice_id: InvoiceId,
        recipient: String,
        at: DateTime<Utc>,
    },
    #[serde(other)]
    Unknown,
}

impl FiscalEvent {
    /// Provider delivery id, absent for unrecognized events.
    pub fn event_id(&self) -> Option<&str> {
        match self {
            FiscalEvent::Stamped { event_id, .. }
            | FiscalEvent::Cancelled { event_id, .. }
            | FiscalEvent::StampError { event_id, .. }
            | FiscalEvent::EmailSent { event_id, .. } => Some(event_id),
            FiscalEvent::Unknown => None,
        }
    }
}

//! Invoicing module: invoice lifecycle, fiscal stamping, and the factoring
//! state carried on each invoice.
//!
//! Pure domain logic; webhook plumbing and partner calls live in infra.

pub mod invoice;

pub use invoice::{
    invoice_number_code, ClientInfo, CreateInvoice, EmailRecord, FactoringDecision,
    FactoringPolicy, FactoringRequestStatus, FactoringState, FinancingStatus, Invoice,
    InvoiceCommand, InvoiceEvent, InvoiceId, InvoiceItem, InvoiceStatus, StampData,
};

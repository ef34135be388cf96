//! Infrastructure layer: event store, command dispatch, application
//! services, and external partner adapters.

pub mod command_dispatcher;
pub mod error;
pub mod event_store;
pub mod factoring;
pub mod fiscal;
pub mod invoicing_service;
pub mod ledger_service;
pub mod rate_limit;
pub mod retry;
pub mod wallet_service;
pub mod webhook;

#[cfg(test)]
mod integration_tests;

pub use command_dispatcher::{CommandDispatcher, DispatchError};
pub use error::{ServiceError, ServiceResult};
pub use event_store::{EventStore, EventStoreError, InMemoryEventStore, StoredEvent, UncommittedEvent};
pub use factoring::{
    FactoringOrchestrator, FactoringPartner, FinancingNotification, PartnerError, PartnerRequest,
    PartnerResponse, RiskProfile, SimulatedPartner,
};
pub use fiscal::{AcceptingFiscalProvider, FiscalEvent, FiscalProvider};
pub use invoicing_service::{InvoicingService, NewInvoice};
pub use ledger_service::{LedgerService, NewTransaction, WalletAudit};
pub use rate_limit::{NoopLimiter, RateLimiter, TokenBucketLimiter};
pub use retry::{BackoffStrategy, RetryPolicy};
pub use wallet_service::WalletService;
pub use webhook::{FactoringEvent, WebhookEvent, WebhookOutcome, WebhookReconciler};

//! Domain error model.

use thiserror::Error;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Keep this focused on deterministic business failures (validation,
/// invariants, illegal transitions). Infrastructure concerns (storage,
/// concurrency-retry exhaustion) live in the infra layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. zero amount, malformed input).
    #[error("validation failed: {0}")]
    Validation(String),

    /// Spendable balance cannot cover the requested amount.
    #[error("insufficient funds: requested {requested}, spendable {spendable}")]
    InsufficientFunds { requested: u64, spendable: u64 },

    /// Cashback balance cannot cover the requested redemption.
    #[error("insufficient cashback: requested {requested}, available {available}")]
    InsufficientCashback { requested: u64, available: u64 },

    /// A credit draw exceeds the remaining credit line.
    #[error("credit limit exceeded: requested {requested}, available {available}")]
    CreditLimitExceeded { requested: u64, available: u64 },

    /// A state machine was asked to perform an illegal transition.
    #[error("invalid state transition: {entity} cannot go from {from} to {attempted}")]
    InvalidStateTransition {
        entity: &'static str,
        from: &'static str,
        attempted: &'static str,
    },

    /// Invoice does not satisfy the factoring eligibility rules.
    #[error("invoice not eligible for factoring: {}", reasons.join("; "))]
    FactoringNotEligible { reasons: Vec<String> },

    /// The factoring partner did not answer within the allotted window.
    #[error("factoring partner timed out")]
    PartnerTimeout,

    /// The factoring partner declined the request.
    #[error("factoring partner rejected the request: {0}")]
    PartnerRejected(String),

    /// The fiscal provider refused or failed the stamping submission.
    #[error("fiscal stamping failed: {0}")]
    StampingFailed(String),

    /// Cancellation requested on an already-cancelled invoice.
    #[error("invoice is already cancelled")]
    AlreadyCancelled,

    /// Mutation attempted on a deactivated wallet.
    #[error("wallet is deactivated")]
    WalletInactive,

    /// Wallet is frozen for manual reconciliation after an audit mismatch.
    #[error("wallet is halted pending manual reconciliation")]
    WalletHalted,

    /// Caller exceeded its request budget.
    #[error("rate limit exceeded")]
    RateLimited,

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A requested wallet does not exist.
    #[error("unknown wallet")]
    UnknownWallet,

    /// A requested invoice does not exist.
    #[error("unknown invoice")]
    UnknownInvoice,

    /// A requested transaction does not exist.
    #[error("unknown transaction")]
    UnknownTransaction,

    /// A conflict occurred (e.g. stale version / optimistic concurrency).
    #[error("conflict: {0}")]
    Conflict(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn invalid_transition(
        entity: &'static str,
        from: &'static str,
        attempted: &'static str,
    ) -> Self {
        Self::InvalidStateTransition {
            entity,
            from,
            attempted,
        }
    }

    pub fn not_eligible(reasons: Vec<String>) -> Self {
        Self::FactoringNotEligible { reasons }
    }
}

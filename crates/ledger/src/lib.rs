//! Ledger module: the append-only record of monetary movements.
//!
//! Each movement is a `Transaction` aggregate with a `pending` →
//! `completed`/`failed`/`cancelled` lifecycle. Balance effects applied on
//! completion are recorded on the event so reconciliation can replay the
//! ledger without re-deriving kind semantics.

pub mod transaction;

pub use transaction::{
    reference_code, AppliedLeg, OpenTransaction, Transaction, TransactionCommand,
    TransactionEvent, TransactionId, TransactionKind, TransactionMetadata, TransactionStatus,
};

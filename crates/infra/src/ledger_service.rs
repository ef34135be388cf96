//! Application service for the transaction ledger.
//!
//! Owns the idempotency-key index, routes transaction kinds to wallet legs
//! on completion, compensates partial applications, and runs the replay
//! audit that cross-checks wallet state against completed transactions.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use chrono::Utc;
use serde_json::Value as JsonValue;
use tracing::{error, warn};

use apexfin_core::{AggregateId, Currency, DomainError, DomainResult};
use apexfin_events::{EventBus, EventEnvelope};
use apexfin_ledger::{
    AppliedLeg, OpenTransaction, Transaction, TransactionCommand, TransactionId, TransactionKind,
    TransactionMetadata, TransactionStatus,
};
use apexfin_wallet::{FundsSource, WalletCommand, WalletEvent, WalletId};

use crate::command_dispatcher::CommandDispatcher;
use crate::error::{ServiceError, ServiceResult};
use crate::event_store::EventStore;
use crate::wallet_service::WalletService;

const AGGREGATE_TYPE: &str = "ledger.transaction";

/// Request to open a ledger transaction.
#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub kind: TransactionKind,
    pub from_wallet: Option<WalletId>,
    pub to_wallet: Option<WalletId>,
    pub amount: u64,
    pub currency: Currency,
    pub description: String,
    pub metadata: TransactionMetadata,
    pub idempotency_key: String,
}

/// Outcome of a replay audit over one wallet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalletAudit {
    pub wallet_id: WalletId,
    /// Sum of signed deltas of completed ledger transactions.
    pub ledger_net: i128,
    /// Net of ledger-driven movements folded from the wallet stream.
    pub wallet_net: i128,
    pub consistent: bool,
}

pub struct LedgerService<S, B> {
    dispatcher: CommandDispatcher<S, B>,
    wallets: Arc<WalletService<S, B>>,
    /// Idempotency key → existing transaction.
    keys: RwLock<HashMap<String, TransactionId>>,
    /// Every transaction ever opened, for the replay audit.
    transactions: RwLock<Vec<TransactionId>>,
    /// Per-transaction completion guards: leg application and the terminal
    /// append must not interleave across concurrent `complete` calls.
    completion: Mutex<HashMap<TransactionId, Arc<Mutex<()>>>>,
}

impl<S, B> LedgerService<S, B>
where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
{
    pub fn new(store: S, bus: B, wallets: Arc<WalletService<S, B>>) -> Self {
        Self {
            dispatcher: CommandDispatcher::new(store, bus),
            wallets,
            keys: RwLock::new(HashMap::new()),
            transactions: RwLock::new(Vec::new()),
            completion: Mutex::new(HashMap::new()),
        }
    }

    /// Open a transaction in `pending`. Reusing an idempotency key returns
    /// the existing transaction unchanged.
    pub fn open(&self, request: NewTransaction) -> ServiceResult<Transaction> {
        if let Some(existing) = self.lookup_key(&request.idempotency_key) {
            return self.get(existing);
        }
        validate_leg_shape(request.kind, request.from_wallet, request.to_wallet)
            .map_err(ServiceError::Domain)?;

        let mut keys = self
            .keys
            .write()
            .map_err(|_| ServiceError::Domain(DomainError::conflict("key index poisoned")))?;
        if let Some(&existing) = keys.get(&request.idempotency_key) {
            drop(keys);
            return self.get(existing);
        }

        let transaction_id = TransactionId::new(AggregateId::new());
        let command = TransactionCommand::Open(OpenTransaction {
            transaction_id,
            idempotency_key: request.idempotency_key.clone(),
            kind: request.kind,
            from_wallet: request.from_wallet,
            to_wallet: request.to_wallet,
            amount: request.amount,
            currency: request.currency,
            description: request.description,
            metadata: request.metadata,
            occurred_at: Utc::now(),
        });
        let (transaction, _) = self
            .dispatcher
            .dispatch(transaction_id.0, AGGREGATE_TYPE, &command, |id| {
                Transaction::empty(TransactionId::new(id))
            })
            .map_err(ServiceError::from)?;

        keys.insert(request.idempotency_key, transaction_id);
        if let Ok(mut transactions) = self.transactions.write() {
            transactions.push(transaction_id);
        }
        Ok(transaction)
    }

    pub fn get(&self, transaction_id: TransactionId) -> ServiceResult<Transaction> {
        let transaction = self
            .dispatcher
            .hydrate(transaction_id.0, |id| {
                Transaction::empty(TransactionId::new(id))
            })
            .map_err(ServiceError::from)?;
        if !transaction.is_created() {
            return Err(ServiceError::Domain(DomainError::UnknownTransaction));
        }
        Ok(transaction)
    }

    /// Apply the ledger effect of a pending transaction.
    ///
    /// Legs are derived from the transaction kind, applied in canonical
    /// wallet-id order, and compensated in reverse if a later leg fails.
    /// Completing an already-completed transaction is a no-op returning the
    /// same result.
    pub fn complete(&self, transaction_id: TransactionId) -> ServiceResult<Transaction> {
        // One completion at a time per transaction; the loser of the race
        // re-reads the stream below and sees the terminal state.
        let guard = self.completion_guard(transaction_id)?;
        let _held = guard
            .lock()
            .map_err(|_| ServiceError::Domain(DomainError::conflict("completion guard poisoned")))?;

        let transaction = self.get(transaction_id)?;
        match transaction.status() {
            TransactionStatus::Completed => return Ok(transaction),
            TransactionStatus::Pending => {}
            other => {
                return Err(ServiceError::Domain(DomainError::invalid_transition(
                    "transaction",
                    other.as_str(),
                    "completed",
                )));
            }
        }

        let mut legs = plan_legs(&transaction);
        // Canonical total order keeps concurrent two-wallet completions from
        // livelocking against each other.
        legs.sort_by_key(|(wallet_id, _)| *wallet_id);

        let mut applied: Vec<(WalletId, Vec<WalletEvent>)> = Vec::new();
        for (wallet_id, command) in legs {
            match self.wallets.execute(wallet_id, command) {
                Ok((_, events)) => applied.push((wallet_id, events)),
                Err(e) => {
                    self.compensate(transaction_id, &applied);
                    let reason = e.to_string();
                    self.dispatch(
                        transaction_id,
                        TransactionCommand::Fail {
                            reason,
                            occurred_at: Utc::now(),
                        },
                    )?;
                    return Err(e);
                }
            }
        }

        let applied_legs: Vec<AppliedLeg> = applied
            .iter()
            .flat_map(|(wallet_id, events)| {
                events.iter().filter_map(|event| {
                    balance_delta(event).map(|delta| AppliedLeg {
                        wallet: *wallet_id,
                        balance_delta: delta,
                    })
                })
            })
            .collect();

        match self.dispatch(
            transaction_id,
            TransactionCommand::Complete {
                legs: applied_legs,
                occurred_at: Utc::now(),
            },
        ) {
            Ok(transaction) => Ok(transaction),
            Err(e) => {
                // A publish failure means the completion is already durable;
                // only roll the legs back when the append never landed.
                if !matches!(e, ServiceError::Publish(_)) {
                    self.compensate(transaction_id, &applied);
                }
                Err(e)
            }
        }
    }

    fn completion_guard(&self, transaction_id: TransactionId) -> ServiceResult<Arc<Mutex<()>>> {
        let mut guards = self
            .completion
            .lock()
            .map_err(|_| ServiceError::Domain(DomainError::conflict("completion index poisoned")))?;
        Ok(guards.entry(transaction_id).or_default().clone())
    }

    /// Mark a pending transaction failed.
    pub fn fail(&self, transaction_id: TransactionId, reason: String) -> ServiceResult<Transaction> {
        self.get(transaction_id)?;
        self.dispatch(
            transaction_id,
            TransactionCommand::Fail {
                reason,
                occurred_at: Utc::now(),
            },
        )
    }

    /// Cancel a pending transaction.
    pub fn cancel(&self, transaction_id: TransactionId) -> ServiceResult<Transaction> {
        self.get(transaction_id)?;
        self.dispatch(
            transaction_id,
            TransactionCommand::Cancel {
                occurred_at: Utc::now(),
            },
        )
    }

    /// Replay audit: recompute the wallet's ledger net from completed
    /// transactions and compare with the net folded from the wallet stream.
    ///
    /// A mismatch is flagged, never auto-corrected: the wallet is halted
    /// until manual reconciliation clears it.
    pub fn audit_wallet(&self, wallet_id: WalletId) -> ServiceResult<WalletAudit> {
        let wallet = self.wallets.get(wallet_id)?;

        let ids: Vec<TransactionId> = self
            .transactions
            .read()
            .map_err(|_| ServiceError::Domain(DomainError::conflict("audit index poisoned")))?
            .clone();

        let mut ledger_net: i128 = 0;
        for id in ids {
            let transaction = self.get(id)?;
            if transaction.status() == TransactionStatus::Completed {
                ledger_net += transaction.signed_delta_for(wallet_id);
            }
        }

        let wallet_net = wallet.transaction_net();
        let consistent = ledger_net == wallet_net;
        if !consistent {
            error!(
                wallet = %wallet_id,
                ledger_net,
                wallet_net,
                "replay audit mismatch, halting wallet"
            );
            self.wallets.halt(wallet_id);
        }

        Ok(WalletAudit {
            wallet_id,
            ledger_net,
            wallet_net,
            consistent,
        })
    }

    fn dispatch(
        &self,
        transaction_id: TransactionId,
        command: TransactionCommand,
    ) -> ServiceResult<Transaction> {
        let (transaction, _) = self
            .dispatcher
            .dispatch(transaction_id.0, AGGREGATE_TYPE, &command, |id| {
                Transaction::empty(TransactionId::new(id))
            })
            .map_err(ServiceError::from)?;
        Ok(transaction)
    }

    /// Undo already-applied legs after a later leg failed. Runs best-effort:
    /// a compensation failure is logged and left for the replay audit.
    fn compensate(&self, transaction_id: TransactionId, applied: &[(WalletId, Vec<WalletEvent>)]) {
        for (wallet_id, events) in applied.iter().rev() {
            for event in events.iter().rev() {
                let Some(inverse) = inverse_command(event, transaction_id) else {
                    continue;
                };
                if let Err(e) = self.wallets.execute(*wallet_id, inverse) {
                    error!(
                        wallet = %wallet_id,
                        transaction = %transaction_id,
                        error = %e,
                        "leg compensation failed"
                    );
                }
            }
        }
        warn!(transaction = %transaction_id, "compensated partial transaction");
    }

    fn lookup_key(&self, idempotency_key: &str) -> Option<TransactionId> {
        self.keys
            .read()
            .ok()
            .and_then(|keys| keys.get(idempotency_key).copied())
    }
}

/// Wallet legs implied by a transaction, before canonical ordering.
fn plan_legs(transaction: &Transaction) -> Vec<(WalletId, WalletCommand)> {
    let source = FundsSource::Transaction {
        id: (transaction.id_typed().0).into(),
    };
    let amount = transaction.amount();
    let now = Utc::now();
    let mut legs = Vec::new();

    if let Some(from) = transaction.from_wallet() {
        let command = match transaction.kind() {
            TransactionKind::CreditPayment => WalletCommand::PayCredit {
                amount,
                source,
                occurred_at: now,
            },
            _ => WalletCommand::Debit {
                amount,
                allow_overdraft: false,
                source,
                occurred_at: now,
            },
        };
        legs.push((from, command));
    }

    if let Some(to) = transaction.to_wallet() {
        let command = match transaction.kind() {
            TransactionKind::CreditDraw => WalletCommand::DrawCredit {
                amount,
                source,
                occurred_at: now,
            },
            TransactionKind::Cashback => WalletCommand::AddCashback {
                amount,
                occurred_at: now,
            },
            _ => WalletCommand::Credit {
                amount,
                source,
                occurred_at: now,
            },
        };
        legs.push((to, command));
    }

    legs
}

/// Which wallet legs each transaction kind requires.
fn validate_leg_shape(
    kind: TransactionKind,
    from: Option<WalletId>,
    to: Option<WalletId>,
) -> DomainResult<()> {
    let shape_err = |msg: &str| Err(DomainError::validation(msg.to_string()));
    match kind {
        TransactionKind::Transfer => {
            if from.is_none() || to.is_none() {
                return shape_err("transfer requires both source and destination wallets");
            }
        }
        TransactionKind::Cashback | TransactionKind::Deposit | TransactionKind::CreditDraw => {
            if to.is_none() {
                return shape_err("destination wallet is required");
            }
            if from.is_some() {
                return shape_err("source wallet is not allowed for this kind");
            }
        }
        TransactionKind::Withdrawal | TransactionKind::CreditPayment => {
            if from.is_none() {
                return shape_err("source wallet is required");
            }
            if to.is_some() {
                return shape_err("destination wallet is not allowed for this kind");
            }
        }
        TransactionKind::Purchase => {
            if from.is_none() {
                return shape_err("source wallet is required");
            }
        }
    }
    Ok(())
}

/// Signed balance effect of a wallet event, if it has one. Cashback accrual
/// moves `cashback_available`, not balance, so it carries no leg.
fn balance_delta(event: &WalletEvent) -> Option<i64> {
    match event {
        WalletEvent::Credited { amount, .. } | WalletEvent::CreditDrawn { amount, .. } => {
            Some(*amount as i64)
        }
        WalletEvent::Debited { amount, .. } | WalletEvent::CreditPaid { amount, .. } => {
            Some(-(*amount as i64))
        }
        _ => None,
    }
}

/// Inverse wallet command for compensation, built from the emitted event so
/// partially-satisfied commands (credit payments) reverse exactly.
fn inverse_command(event: &WalletEvent, transaction_id: TransactionId) -> Option<WalletCommand> {
    let source = FundsSource::Transaction {
        id: (transaction_id.0).into(),
    };
    let now = Utc::now();
    match event {
        WalletEvent::Credited { amount, .. } => Some(WalletCommand::Debit {
            amount: *amount,
            allow_overdraft: true,
            source,
            occurred_at: now,
        }),
        WalletEvent::Debited { amount, .. } => Some(WalletCommand::Credit {
            amount: *amount,
            source,
            occurred_at: now,
        }),
        WalletEvent::CreditDrawn { amount, .. } => Some(WalletCommand::PayCredit {
            amount: *amount,
            source,
            occurred_at: now,
        }),
        WalletEvent::CreditPaid { amount, .. } => Some(WalletCommand::DrawCredit {
            amount: *amount,
            source,
            occurred_at: now,
        }),
        _ => None,
    }
}

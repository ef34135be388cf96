//! Application service for wallets.
//!
//! Serializes per-wallet mutations through the optimistic append: load,
//! rehydrate, handle, append `Exact(version)`. Conflicts retry up to a
//! bounded attempt count and then surface `TransientConflict`. Operations on
//! different wallets share no lock.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use chrono::Utc;
use serde_json::Value as JsonValue;
use tracing::warn;

use apexfin_core::{AggregateId, Currency, DomainError, UserId};
use apexfin_events::{EventBus, EventEnvelope};
use apexfin_wallet::{FundsSource, Wallet, WalletCommand, WalletEvent, WalletId};

use crate::command_dispatcher::{CommandDispatcher, DispatchError};
use crate::error::{ServiceError, ServiceResult};
use crate::event_store::EventStore;

const AGGREGATE_TYPE: &str = "wallet";
const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Wallet store service. One wallet per `(owner, currency)`.
pub struct WalletService<S, B> {
    dispatcher: CommandDispatcher<S, B>,
    /// Lookup from (owner, currency) to the wallet stream.
    index: RwLock<HashMap<(UserId, Currency), WalletId>>,
    /// Wallets frozen by the replay audit, pending manual reconciliation.
    halted: RwLock<HashSet<WalletId>>,
    max_attempts: u32,
}

impl<S, B> WalletService<S, B>
where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
{
    pub fn new(store: S, bus: B) -> Self {
        Self {
            dispatcher: CommandDispatcher::new(store, bus),
            index: RwLock::new(HashMap::new()),
            halted: RwLock::new(HashSet::new()),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Look up the wallet for `(owner, currency)`, opening a zeroed one on
    /// first use.
    pub fn get_or_create(&self, owner: UserId, currency: Currency) -> ServiceResult<Wallet> {
        if let Some(wallet_id) = self.lookup(owner, currency) {
            return self.get(wallet_id);
        }

        // Hold the index write lock across the open so concurrent callers
        // cannot race two wallets into existence for the same key.
        let mut index = self
            .index
            .write()
            .map_err(|_| ServiceError::Domain(DomainError::conflict("wallet index poisoned")))?;
        if let Some(&wallet_id) = index.get(&(owner, currency)) {
            drop(index);
            return self.get(wallet_id);
        }

        let wallet_id = WalletId::new(AggregateId::new());
        let command = WalletCommand::Open {
            owner,
            currency,
            occurred_at: Utc::now(),
        };
        let (wallet, _) = self
            .dispatcher
            .dispatch(wallet_id.0, AGGREGATE_TYPE, &command, |id| {
                Wallet::empty(WalletId::new(id))
            })
            .map_err(ServiceError::from)?;
        index.insert((owner, currency), wallet_id);
        Ok(wallet)
    }

    /// Current wallet state, rehydrated from its stream.
    pub fn get(&self, wallet_id: WalletId) -> ServiceResult<Wallet> {
        let wallet = self
            .dispatcher
            .hydrate(wallet_id.0, |id| Wallet::empty(WalletId::new(id)))
            .map_err(ServiceError::from)?;
        if !wallet.is_created() {
            return Err(ServiceError::Domain(DomainError::UnknownWallet));
        }
        Ok(wallet)
    }

    pub fn lookup(&self, owner: UserId, currency: Currency) -> Option<WalletId> {
        self.index
            .read()
            .ok()
            .and_then(|index| index.get(&(owner, currency)).copied())
    }

    pub fn credit(&self, wallet_id: WalletId, amount: u64, source: FundsSource) -> ServiceResult<Wallet> {
        self.execute(
            wallet_id,
            WalletCommand::Credit {
                amount,
                source,
                occurred_at: Utc::now(),
            },
        )
        .map(|(wallet, _)| wallet)
    }

    pub fn debit(
        &self,
        wallet_id: WalletId,
        amount: u64,
        allow_overdraft: bool,
        source: FundsSource,
    ) -> ServiceResult<Wallet> {
        self.execute(
            wallet_id,
            WalletCommand::Debit {
                amount,
                allow_overdraft,
                source,
                occurred_at: Utc::now(),
            },
        )
        .map(|(wallet, _)| wallet)
    }

    pub fn freeze(&self, wallet_id: WalletId, amount: u64) -> ServiceResult<Wallet> {
        self.execute(
            wallet_id,
            WalletCommand::Freeze {
                amount,
                occurred_at: Utc::now(),
            },
        )
        .map(|(wallet, _)| wallet)
    }

    pub fn unfreeze(&self, wallet_id: WalletId, amount: u64) -> ServiceResult<Wallet> {
        self.execute(
            wallet_id,
            WalletCommand::Unfreeze {
                amount,
                occurred_at: Utc::now(),
            },
        )
        .map(|(wallet, _)| wallet)
    }

    pub fn add_cashback(&self, wallet_id: WalletId, amount: u64) -> ServiceResult<Wallet> {
        self.execute(
            wallet_id,
            WalletCommand::AddCashback {
                amount,
                occurred_at: Utc::now(),
            },
        )
        .map(|(wallet, _)| wallet)
    }

    pub fn redeem_cashback(&self, wallet_id: WalletId, amount: u64) -> ServiceResult<Wallet> {
        self.execute(
            wallet_id,
            WalletCommand::RedeemCashback {
                amount,
                occurred_at: Utc::now(),
            },
        )
        .map(|(wallet, _)| wallet)
    }

    pub fn draw_credit(&self, wallet_id: WalletId, amount: u64, source: FundsSource) -> ServiceResult<Wallet> {
        self.execute(
            wallet_id,
            WalletCommand::DrawCredit {
                amount,
                source,
                occurred_at: Utc::now(),
            },
        )
        .map(|(wallet, _)| wallet)
    }

    pub fn pay_credit(&self, wallet_id: WalletId, amount: u64, source: FundsSource) -> ServiceResult<Wallet> {
        self.execute(
            wallet_id,
            WalletCommand::PayCredit {
                amount,
                source,
                occurred_at: Utc::now(),
            },
        )
        .map(|(wallet, _)| wallet)
    }

    pub fn set_credit_limit(&self, wallet_id: WalletId, new_limit: u64) -> ServiceResult<Wallet> {
        self.execute(
            wallet_id,
            WalletCommand::SetCreditLimit {
                new_limit,
                occurred_at: Utc::now(),
            },
        )
        .map(|(wallet, _)| wallet)
    }

    pub fn deactivate(&self, wallet_id: WalletId) -> ServiceResult<Wallet> {
        self.execute(
            wallet_id,
            WalletCommand::Deactivate {
                occurred_at: Utc::now(),
            },
        )
        .map(|(wallet, _)| wallet)
    }

    /// Execute a wallet command with bounded optimistic retry.
    ///
    /// Returns the post-state wallet and the committed domain events; the
    /// ledger uses the events to record applied balance legs.
    pub fn execute(
        &self,
        wallet_id: WalletId,
        command: WalletCommand,
    ) -> ServiceResult<(Wallet, Vec<WalletEvent>)> {
        if self.is_halted(wallet_id) {
            return Err(ServiceError::Domain(DomainError::WalletHalted));
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self
                .dispatcher
                .dispatch(wallet_id.0, AGGREGATE_TYPE, &command, |id| {
                    Wallet::empty(WalletId::new(id))
                }) {
                Ok((wallet, committed)) => {
                    let events = committed
                        .iter()
                        .map(|stored| {
                            serde_json::from_value(stored.payload.clone())
                                .map_err(|e| ServiceError::Deserialize(e.to_string()))
                        })
                        .collect::<Result<Vec<WalletEvent>, _>>()?;
                    return Ok((wallet, events));
                }
                Err(DispatchError::Concurrency(msg)) if attempt < self.max_attempts => {
                    warn!(wallet = %wallet_id, attempt, %msg, "wallet append conflicted, retrying");
                }
                Err(e) => return Err(ServiceError::from(e)),
            }
        }
    }

    /// Freeze all mutations on a wallet after an audit mismatch.
    pub fn halt(&self, wallet_id: WalletId) {
        if let Ok(mut halted) = self.halted.write() {
            halted.insert(wallet_id);
        }
    }

    /// Lift the halt after manual reconciliation.
    pub fn clear_halt(&self, wallet_id: WalletId) {
        if let Ok(mut halted) = self.halted.write() {
            halted.remove(&wallet_id);
        }
    }

    pub fn is_halted(&self, wallet_id: WalletId) -> bool {
        self.halted
            .read()
            .map(|halted| halted.contains(&wallet_id))
            .unwrap_or(false)
    }
}

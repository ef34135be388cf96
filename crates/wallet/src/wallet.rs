use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use apexfin_core::{Aggregate, AggregateId, AggregateRoot, Currency, DomainError, UserId};
use apexfin_events::Event;

/// Wallet identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WalletId(pub AggregateId);

impl WalletId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for WalletId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Origin of a balance movement.
///
/// `Transaction` carries the ledger transaction id so the replay audit can
/// separate ledger-driven movements from manual adjustments.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FundsSource {
    /// Manual/administrative adjustment.
    Manual,
    /// Movement applied by a completed ledger transaction.
    Transaction { id: Uuid },
}

impl FundsSource {
    pub fn transaction_id(&self) -> Option<Uuid> {
        match self {
            FundsSource::Transaction { id } => Some(*id),
            FundsSource::Manual => None,
        }
    }
}

/// Aggregate root: Wallet.
///
/// One wallet per (owner, currency). Balances are u64 cents; derived values
/// (`spendable_balance`, `available_credit`, `total_available`) are computed,
/// never stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Wallet {
    id: WalletId,
    owner: Option<UserId>,
    currency: Currency,
    balance: u64,
    frozen_balance: u64,
    cashback_available: u64,
    credit_limit: u64,
    used_credit: u64,
    is_active: bool,
    /// Net balance effect of ledger-driven movements (replay audit input).
    transaction_net: i128,
    last_updated: Option<DateTime<Utc>>,
    version: u64,
    created: bool,
}

impl Wallet {
    /// Create an empty, not-yet-created aggregate instance for rehydration.
    pub fn empty(id: WalletId) -> Self {
        Self {
            id,
            owner: None,
            currency: Currency::default(),
            balance: 0,
            frozen_balance: 0,
            cashback_available: 0,
            credit_limit: 0,
            used_credit: 0,
            is_active: true,
            transaction_net: 0,
            last_updated: None,
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> WalletId {
        self.id
    }

    pub fn owner(&self) -> Option<UserId> {
        self.owner
    }

    pub fn currency(&self) -> Currency {
        self.currency
    }

    pub fn balance(&self) -> u64 {
        self.balance
    }

    pub fn frozen_balance(&self) -> u64 {
        self.frozen_balance
    }

    pub fn cashback_available(&self) -> u64 {
        self.cashback_available
    }

    pub fn credit_limit(&self) -> u64 {
        self.credit_limit
    }

    pub fn used_credit(&self) -> u64 {
        self.used_credit
    }

    pub fn is_active(&self) -> bool {
        self.is_active
    }

    pub fn is_created(&self) -> bool {
        self.created
    }

    pub fn last_updated(&self) -> Option<DateTime<Utc>> {
        self.last_updated
    }

    /// Balance minus the frozen portion.
    pub fn spendable_balance(&self) -> u64 {
        self.balance.saturating_sub(self.frozen_balance)
    }

    /// Remaining credit line.
    pub fn available_credit(&self) -> u64 {
        self.credit_limit.saturating_sub(self.used_credit)
    }

    /// Everything the owner could spend right now.
    pub fn total_available(&self) -> u64 {
        self.spendable_balance() + self.cashback_available + self.available_credit()
    }

    /// Net balance effect of completed ledger transactions on this wallet.
    pub fn transaction_net(&self) -> i128 {
        self.transaction_net
    }
}

impl AggregateRoot for Wallet {
    type Id = WalletId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Wallet commands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WalletCommand {
    Open {
        owner: UserId,
        currency: Currency,
        occurred_at: DateTime<Utc>,
    },
    Credit {
        amount: u64,
        source: FundsSource,
        occurred_at: DateTime<Utc>,
    },
    Debit {
        amount: u64,
        allow_overdraft: bool,
        source: FundsSource,
        occurred_at: DateTime<Utc>,
    },
    Freeze {
        amount: u64,
        occurred_at: DateTime<Utc>,
    },
    Unfreeze {
        amount: u64,
        occurred_at: DateTime<Utc>,
    },
    AddCashback {
        amount: u64,
        occurred_at: DateTime<Utc>,
    },
    RedeemCashback {
        amount: u64,
        occurred_at: DateTime<Utc>,
    },
    DrawCredit {
        amount: u64,
        source: FundsSource,
        occurred_at: DateTime<Utc>,
    },
    PayCredit {
        amount: u64,
        source: FundsSource,
        occurred_at: DateTime<Utc>,
    },
    SetCreditLimit {
        new_limit: u64,
        occurred_at: DateTime<Utc>,
    },
    Deactivate {
        occurred_at: DateTime<Utc>,
    },
}

/// Wallet events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WalletEvent {
    Opened {
        wallet_id: WalletId,
        owner: UserId,
        currency: Currency,
        occurred_at: DateTime<Utc>,
    },
    Credited {
        amount: u64,
        source: FundsSource,
        occurred_at: DateTime<Utc>,
    },
    Debited {
        amount: u64,
        source: FundsSource,
        occurred_at: DateTime<Utc>,
    },
    BalanceFrozen {
        amount: u64,
        occurred_at: DateTime<Utc>,
    },
    BalanceUnfrozen {
        amount: u64,
        occurred_at: DateTime<Utc>,
    },
    CashbackAdded {
        amount: u64,
        occurred_at: DateTime<Utc>,
    },
    CashbackRedeemed {
        amount: u64,
        occurred_at: DateTime<Utc>,
    },
    CreditDrawn {
        amount: u64,
        source: FundsSource,
        occurred_at: DateTime<Utc>,
    },
    /// `amount` is the portion actually paid (min of requested and used credit).
    CreditPaid {
        amount: u64,
        source: FundsSource,
        occurred_at: DateTime<Utc>,
    },
    CreditLimitSet {
        new_limit: u64,
        occurred_at: DateTime<Utc>,
    },
    Deactivated {
        occurred_at: DateTime<Utc>,
    },
}

impl Event for WalletEvent {
    fn event_type(&self) -> &'static str {
        match self {
            WalletEvent::Opened { .. } => "wallet.opened",
            WalletEvent::Credited { .. } => "wallet.credited",
            WalletEvent::Debited { .. } => "wallet.debited",
            WalletEvent::BalanceFrozen { .. } => "wallet.balance_frozen",
            WalletEvent::BalanceUnfrozen { .. } => "wallet.balance_unfrozen",
            WalletEvent::CashbackAdded { .. } => "wallet.cashback_added",
            WalletEvent::CashbackRedeemed { .. } => "wallet.cashback_redeemed",
            WalletEvent::CreditDrawn { .. } => "wallet.credit_drawn",
            WalletEvent::CreditPaid { .. } => "wallet.credit_paid",
            WalletEvent::CreditLimitSet { .. } => "wallet.credit_limit_set",
            WalletEvent::Deactivated { .. } => "wallet.deactivated",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            WalletEvent::Opened { occurred_at, .. }
            | WalletEvent::Credited { occurred_at, .. }
            | WalletEvent::Debited { occurred_at, .. }
            | WalletEvent::BalanceFrozen { occurred_at, .. }
            | WalletEvent::BalanceUnfrozen { occurred_at, .. }
            | WalletEvent::CashbackAdded { occurred_at, .. }
            | WalletEvent::CashbackRedeemed { occurred_at, .. }
            | WalletEvent::CreditDrawn { occurred_at, .. }
            | WalletEvent::CreditPaid { occurred_at, .. }
            | WalletEvent::CreditLimitSet { occurred_at, .. }
            | WalletEvent::Deactivated { occurred_at } => *occurred_at,
        }
    }
}

impl Aggregate for Wallet {
    type Command = WalletCommand;
    type Event = WalletEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            WalletEvent::Opened {
                wallet_id,
                owner,
                currency,
                ..
            } => {
                self.id = *wallet_id;
                self.owner = Some(*owner);
                self.currency = *currency;
                self.is_active = true;
                self.created = true;
            }
            WalletEvent::Credited { amount, source, .. } => {
                self.balance = self.balance.saturating_add(*amount);
                if source.transaction_id().is_some() {
                    self.transaction_net += i128::from(*amount);
                }
            }
            WalletEvent::Debited { amount, source, .. } => {
                self.balance = self.balance.saturating_sub(*amount);
                // A debit may dip into the frozen portion; keep the
                // frozen_balance <= balance invariant by clamping.
                self.frozen_balance = self.frozen_balance.min(self.balance);
                if source.transaction_id().is_some() {
                    self.transaction_net -= i128::from(*amount);
                }
            }
            WalletEvent::BalanceFrozen { amount, .. } => {
                self.frozen_balance = self.frozen_balance.saturating_add(*amount);
            }
            WalletEvent::BalanceUnfrozen { amount, .. } => {
                self.frozen_balance = self.frozen_balance.saturating_sub(*amount);
            }
            WalletEvent::CashbackAdded { amount, .. } => {
                self.cashback_available = self.cashback_available.saturating_add(*amount);
            }
            WalletEvent::CashbackRedeemed { amount, .. } => {
                self.cashback_available = self.cashback_available.saturating_sub(*amount);
                self.balance = self.balance.saturating_add(*amount);
            }
            WalletEvent::CreditDrawn { amount, source, .. } => {
                self.used_credit = self.used_credit.saturating_add(*amount);
                self.balance = self.balance.saturating_add(*amount);
                if source.transaction_id().is_some() {
                    self.transaction_net += i128::from(*amount);
                }
            }
            WalletEvent::CreditPaid { amount, source, .. } => {
                self.used_credit = self.used_credit.saturating_sub(*amount);
                self.balance = self.balance.saturating_sub(*amount);
                self.frozen_balance = self.frozen_balance.min(self.balance);
                if source.transaction_id().is_some() {
                    self.transaction_net -= i128::from(*amount);
                }
            }
            WalletEvent::CreditLimitSet { new_limit, .. } => {
                self.credit_limit = *new_limit;
            }
            WalletEvent::Deactivated { .. } => {
                self.is_active = false;
            }
        }

        self.last_updated = Some(event.occurred_at());
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            WalletCommand::Open {
                owner,
                currency,
                occurred_at,
            } => self.handle_open(*owner, *currency, *occurred_at),
            WalletCommand::Credit {
                amount,
                source,
                occurred_at,
            } => {
                self.ensure_mutable()?;
                ensure_positive(*amount)?;
                Ok(vec![WalletEvent::Credited {
                    amount: *amount,
                    source: source.clone(),
                    occurred_at: *occurred_at,
                }])
            }
            WalletCommand::Debit {
                amount,
                allow_overdraft,
                source,
                occurred_at,
            } => self.handle_debit(*amount, *allow_overdraft, source.clone(), *occurred_at),
            WalletCommand::Freeze {
                amount,
                occurred_at,
            } => {
                self.ensure_mutable()?;
                ensure_positive(*amount)?;
                if self.frozen_balance.saturating_add(*amount) > self.balance {
                    return Err(DomainError::InsufficientFunds {
                        requested: *amount,
                        spendable: self.spendable_balance(),
                    });
                }
                Ok(vec![WalletEvent::BalanceFrozen {
                    amount: *amount,
                    occurred_at: *occurred_at,
                }])
            }
            WalletCommand::Unfreeze {
                amount,
                occurred_at,
            } => {
                self.ensure_mutable()?;
                ensure_positive(*amount)?;
                if *amount > self.frozen_balance {
                    return Err(DomainError::validation(
                        "cannot unfreeze more than the frozen balance",
                    ));
                }
                Ok(vec![WalletEvent::BalanceUnfrozen {
                    amount: *amount,
                    occurred_at: *occurred_at,
                }])
            }
            WalletCommand::AddCashback {
                amount,
                occurred_at,
            } => {
                self.ensure_mutable()?;
                ensure_positive(*amount)?;
                Ok(vec![WalletEvent::CashbackAdded {
                    amount: *amount,
                    occurred_at: *occurred_at,
                }])
            }
            WalletCommand::RedeemCashback {
                amount,
                occurred_at,
            } => {
                self.ensure_mutable()?;
                ensure_positive(*amount)?;
                if *amount > self.cashback_available {
                    return Err(DomainError::InsufficientCashback {
                        requested: *amount,
                        available: self.cashback_available,
                    });
                }
                Ok(vec![WalletEvent::CashbackRedeemed {
                    amount: *amount,
                    occurred_at: *occurred_at,
                }])
            }
            WalletCommand::DrawCredit {
                amount,
                source,
                occurred_at,
            } => {
                self.ensure_mutable()?;
                ensure_positive(*amount)?;
                if *amount > self.available_credit() {
                    return Err(DomainError::CreditLimitExceeded {
                        requested: *amount,
                        available: self.available_credit(),
                    });
                }
                Ok(vec![WalletEvent::CreditDrawn {
                    amount: *amount,
                    source: source.clone(),
                    occurred_at: *occurred_at,
                }])
            }
            WalletCommand::PayCredit {
                amount,
                source,
                occurred_at,
            } => self.handle_pay_credit(*amount, source.clone(), *occurred_at),
            WalletCommand::SetCreditLimit {
                new_limit,
                occurred_at,
            } => {
                self.ensure_mutable()?;
                if *new_limit < self.used_credit {
                    return Err(DomainError::validation(
                        "credit limit cannot drop below the used credit",
                    ));
                }
                Ok(vec![WalletEvent::CreditLimitSet {
                    new_limit: *new_limit,
                    occurred_at: *occurred_at,
                }])
            }
            WalletCommand::Deactivate { occurred_at } => {
                self.ensure_created()?;
                if !self.is_active {
                    // Already deactivated; nothing to record.
                    return Ok(vec![]);
                }
                Ok(vec![WalletEvent::Deactivated {
                    occurred_at: *occurred_at,
                }])
            }
        }
    }
}

impl Wallet {
    fn ensure_created(&self) -> Result<(), DomainError> {
        if !self.created {
            return Err(DomainError::UnknownWallet);
        }
        Ok(())
    }

    fn ensure_mutable(&self) -> Result<(), DomainError> {
        self.ensure_created()?;
        if !self.is_active {
            return Err(DomainError::WalletInactive);
        }
        Ok(())
    }

    fn handle_open(
        &self,
        owner: UserId,
        currency: Currency,
        occurred_at: DateTime<Utc>,
    ) -> Result<Vec<WalletEvent>, DomainError> {
        if self.created {
            return Err(DomainError::conflict("wallet already exists"));
        }
        Ok(vec![WalletEvent::Opened {
            wallet_id: self.id,
            owner,
            currency,
            occurred_at,
        }])
    }

    fn handle_debit(
        &self,
        amount: u64,
        allow_overdraft: bool,
        source: FundsSource,
        occurred_at: DateTime<Utc>,
    ) -> Result<Vec<WalletEvent>, DomainError> {
        self.ensure_mutable()?;
        ensure_positive(amount)?;

        // Overdraft only bypasses the frozen reservation; the balance itself
        // can never go negative.
        let ceiling = if allow_overdraft {
            self.balance
        } else {
            self.spendable_balance()
        };
        if amount > ceiling {
            return Err(DomainError::InsufficientFunds {
                requested: amount,
                spendable: self.spendable_balance(),
            });
        }

        Ok(vec![WalletEvent::Debited {
            amount,
            source,
            occurred_at,
        }])
    }

    fn handle_pay_credit(
        &self,
        amount: u64,
        source: FundsSource,
        occurred_at: DateTime<Utc>,
    ) -> Result<Vec<WalletEvent>, DomainError> {
        self.ensure_mutable()?;
        ensure_positive(amount)?;

        let payable = amount.min(self.used_credit);
        if payable == 0 {
            // No outstanding credit; nothing to pay.
            return Ok(vec![]);
        }
        if payable > self.spendable_balance() {
            return Err(DomainError::InsufficientFunds {
                requested: payable,
                spendable: self.spendable_balance(),
            });
        }

        Ok(vec![WalletEvent::CreditPaid {
            amount: payable,
            source,
            occurred_at,
        }])
    }
}

fn ensure_positive(amount: u64) -> Result<(), DomainError> {
    if amount == 0 {
        return Err(DomainError::validation("amount must be positive"));
    }
    Ok(())
}


#[cfg(test)]
mod invariant_tests {
    use super::*;
    use apexfin_events::execute;
    use proptest::prelude::*;

    fn arb_command() -> impl Strategy<Value = WalletCommand> {
        let at = chrono::Utc::now();
        prop_oneof![
            (1u64..10_000).prop_map(move |amount| WalletCommand::Credit {
                amount,
                source: FundsSource::Manual,
                occurred_at: at,
            }),
            (1u64..10_000, any::<bool>()).prop_map(move |(amount, allow_overdraft)| {
                WalletCommand::Debit {
                    amount,
                    allow_overdraft,
                    source: FundsSource::Manual,
                    occurred_at: at,
                }
            }),
            (1u64..10_000).prop_map(move |amount| WalletCommand::Freeze {
                amount,
                occurred_at: at,
            }),
            (1u64..10_000).prop_map(move |amount| WalletCommand::Unfreeze {
                amount,
                occurred_at: at,
            }),
            (1u64..10_000).prop_map(move |amount| WalletCommand::AddCashback {
                amount,
                occurred_at: at,
            }),
            (1u64..10_000).prop_map(move |amount| WalletCommand::RedeemCashback {
                amount,
                occurred_at: at,
            }),
            (1u64..10_000).prop_map(move |amount| WalletCommand::DrawCredit {
                amount,
                source: FundsSource::Manual,
                occurred_at: at,
            }),
            (1u64..10_000).prop_map(move |amount| WalletCommand::PayCredit {
                amount,
                source: FundsSource::Manual,
                occurred_at: at,
            }),
            (0u64..20_000).prop_map(move |new_limit| WalletCommand::SetCreditLimit {
                new_limit,
                occurred_at: at,
            }),
        ]
    }

    proptest! {
        /// Monetary invariants hold after every accepted command, no matter
        /// the order or mix of operations (rejected commands change nothing).
        #[test]
        fn invariants_hold_for_any_command_sequence(
            commands in proptest::collection::vec(arb_command(), 1..60)
        ) {
            let mut wallet = Wallet::empty(WalletId::new(AggregateId::new()));
            execute(
                &mut wallet,
                &WalletCommand::Open {
                    owner: UserId::new(),
                    currency: Currency::Mxn,
                    occurred_at: chrono::Utc::now(),
                },
            )
            .unwrap();

            for cmd in &commands {
                let before = wallet.clone();
                match execute(&mut wallet, cmd) {
                    Ok(_) => {}
                    Err(_) => prop_assert_eq!(&wallet, &before),
                }

                prop_assert!(wallet.frozen_balance() <= wallet.balance());
                prop_assert!(wallet.used_credit() <= wallet.credit_limit());
                prop_assert_eq!(
                    wallet.spendable_balance(),
                    wallet.balance() - wallet.frozen_balance()
                );
            }
        }
    }
}

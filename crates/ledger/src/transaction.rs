use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use apexfin_core::{Aggregate, AggregateId, AggregateRoot, Currency, DomainError, DomainResult};
use apexfin_events::Event;
use apexfin_wallet::WalletId;

/// Transaction identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionId(pub AggregateId);

impl TransactionId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Kinds of monetary movement the ledger records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Transfer,
    Cashback,
    Withdrawal,
    Purchase,
    Deposit,
    CreditDraw,
    CreditPayment,
}

/// Transaction status lifecycle. `Pending` is the only non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Completed,
    Failed,
    Cancelled,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Completed => "completed",
            TransactionStatus::Failed => "failed",
            TransactionStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, TransactionStatus::Pending)
    }
}

/// Opaque references linking a transaction to the rest of the platform.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionMetadata {
    pub order_id: Option<String>,
    pub invoice_id: Option<Uuid>,
    pub partner_id: Option<String>,
    /// Fees withheld, in cents.
    pub fees: Option<u64>,
}

/// Balance effect actually applied to one wallet when the transaction
/// completed. Recorded on the `Completed` event so reconciliation can replay
/// the ledger without re-deriving kind semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedLeg {
    pub wallet: WalletId,
    pub balance_delta: i64,
}

/// Aggregate root: ledger Transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    id: TransactionId,
    idempotency_key: Option<String>,
    from_wallet: Option<WalletId>,
    to_wallet: Option<WalletId>,
    amount: u64,
    currency: Currency,
    kind: TransactionKind,
    status: TransactionStatus,
    description: String,
    metadata: TransactionMetadata,
    reference: Option<String>,
    applied_legs: Vec<AppliedLeg>,
    created_at: Option<DateTime<Utc>>,
    processed_at: Option<DateTime<Utc>>,
    failure_reason: Option<String>,
    version: u64,
    created: bool,
}

impl Transaction {
    /// Empty aggregate for rehydration.
    pub fn empty(id: TransactionId) -> Self {
        Self {
            id,
            idempotency_key: None,
            from_wallet: None,
            to_wallet: None,
            amount: 0,
            currency: Currency::default(),
            kind: TransactionKind::Transfer,
            status: TransactionStatus::Pending,
            description: String::new(),
            metadata: TransactionMetadata::default(),
            reference: None,
            applied_legs: Vec::new(),
            created_at: None,
            processed_at: None,
            failure_reason: None,
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> TransactionId {
        self.id
    }

    pub fn idempotency_key(&self) -> Option<&str> {
        self.idempotency_key.as_deref()
    }

    pub fn from_wallet(&self) -> Option<WalletId> {
        self.from_wallet
    }

    pub fn to_wallet(&self) -> Option<WalletId> {
        self.to_wallet
    }

    pub fn amount(&self) -> u64 {
        self.amount
    }

    pub fn currency(&self) -> Currency {
        self.currency
    }

    pub fn kind(&self) -> TransactionKind {
        self.kind
    }

    pub fn status(&self) -> TransactionStatus {
        self.status
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn metadata(&self) -> &TransactionMetadata {
        &self.metadata
    }

    /// Human-readable reference code (`APXyymmddnnnnn`).
    pub fn reference(&self) -> Option<&str> {
        self.reference.as_deref()
    }

    pub fn processed_at(&self) -> Option<DateTime<Utc>> {
        self.processed_at
    }

    pub fn failure_reason(&self) -> Option<&str> {
        self.failure_reason.as_deref()
    }

    pub fn is_created(&self) -> bool {
        self.created
    }

    /// Legs applied on completion (empty unless `Completed`).
    pub fn applied_legs(&self) -> &[AppliedLeg] {
        &self.applied_legs
    }

    /// Signed balance effect this transaction had on `wallet`.
    pub fn signed_delta_for(&self, wallet: WalletId) -> i128 {
        self.applied_legs
            .iter()
            .filter(|leg| leg.wallet == wallet)
            .map(|leg| i128::from(leg.balance_delta))
            .sum()
    }
}

/// Generate the human-readable reference code from the transaction id and
/// its creation time. Deterministic: replays produce the same code.
pub fn reference_code(id: TransactionId, created_at: DateTime<Utc>) -> String {
    use chrono::Datelike;
    let uuid: Uuid = id.0.into();
    let tail = u32::from_be_bytes(uuid.as_bytes()[12..16].try_into().expect("uuid is 16 bytes"));
    format!(
        "APX{:02}{:02}{:02}{:05}",
        created_at.year() % 100,
        created_at.month(),
        created_at.day(),
        tail % 100_000
    )
}

impl AggregateRoot for Transaction {
    type Id = TransactionId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: open a new transaction in `pending`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenTransaction {
    pub transaction_id: TransactionId,
    pub idempotency_key: String,
    pub kind: TransactionKind,
    pub from_wallet: Option<WalletId>,
    pub to_wallet: Option<WalletId>,
    pub amount: u64,
    pub currency: Currency,
    pub description: String,
    pub metadata: TransactionMetadata,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransactionCommand {
    Open(OpenTransaction),
    /// Record that both legs were applied to the wallet store.
    Complete {
        legs: Vec<AppliedLeg>,
        occurred_at: DateTime<Utc>,
    },
    Fail {
        reason: String,
        occurred_at: DateTime<Utc>,
    },
    Cancel {
        occurred_at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransactionEvent {
    Opened {
        transaction_id: TransactionId,
        idempotency_key: String,
        kind: TransactionKind,
        from_wallet: Option<WalletId>,
        to_wallet: Option<WalletId>,
        amount: u64,
        currency: Currency,
        description: String,
        metadata: TransactionMetadata,
        reference: String,
        occurred_at: DateTime<Utc>,
    },
    Completed {
        legs: Vec<AppliedLeg>,
        occurred_at: DateTime<Utc>,
    },
    Failed {
        reason: String,
        occurred_at: DateTime<Utc>,
    },
    Cancelled {
        occurred_at: DateTime<Utc>,
    },
}

impl Event for TransactionEvent {
    fn event_type(&self) -> &'static str {
        match self {
            TransactionEvent::Opened { .. } => "ledger.transaction.opened",
            TransactionEvent::Completed { .. } => "ledger.transaction.completed",
            TransactionEvent::Failed { .. } => "ledger.transaction.failed",
            TransactionEvent::Cancelled { .. } => "ledger.transaction.cancelled",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            TransactionEvent::Opened { occurred_at, .. }
            | TransactionEvent::Completed { occurred_at, .. }
            | TransactionEvent::Failed { occurred_at, .. }
            | TransactionEvent::Cancelled { occurred_at } => *occurred_at,
        }
    }
}

impl Aggregate for Transaction {
    type Command = TransactionCommand;
    type Event = TransactionEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            TransactionEvent::Opened {
                transaction_id,
                idempotency_key,
                kind,
                from_wallet,
                to_wallet,
                amount,
                currency,
                description,
                metadata,
                reference,
                occurred_at,
            } => {
                self.id = *transaction_id;
                self.idempotency_key = Some(idempotency_key.clone());
                self.kind = *kind;
                self.from_wallet = *from_wallet;
                self.to_wallet = *to_wallet;
                self.amount = *amount;
                self.currency = *currency;
                self.description = description.clone();
                self.metadata = metadata.clone();
                self.reference = Some(reference.clone());
                self.status = TransactionStatus::Pending;
                self.created_at = Some(*occurred_at);
                self.created = true;
            }
            TransactionEvent::Completed { legs, occurred_at } => {
                self.status = TransactionStatus::Completed;
                self.applied_legs = legs.clone();
                self.processed_at = Some(*occurred_at);
            }
            TransactionEvent::Failed {
                reason,
                occurred_at,
            } => {
                self.status = TransactionStatus::Failed;
                self.failure_reason = Some(reason.clone());
                self.processed_at = Some(*occurred_at);
            }
            TransactionEvent::Cancelled { occurred_at } => {
                self.status = TransactionStatus::Cancelled;
                self.processed_at = Some(*occurred_at);
            }
        }

        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            TransactionCommand::Open(cmd) => self.handle_open(cmd),
            TransactionCommand::Complete { legs, occurred_at } => {
                self.handle_complete(legs, *occurred_at)
            }
            TransactionCommand::Fail {
                reason,
                occurred_at,
            } => self.handle_terminal(
                "failed",
                TransactionEvent::Failed {
                    reason: reason.clone(),
                    occurred_at: *occurred_at,
                },
            ),
            TransactionCommand::Cancel { occurred_at } => self.handle_terminal(
                "cancelled",
                TransactionEvent::Cancelled {
                    occurred_at: *occurred_at,
                },
            ),
        }
    }
}

impl Transaction {
    fn handle_open(&self, cmd: &OpenTransaction) -> DomainResult<Vec<TransactionEvent>> {
        if self.created {
            return Err(DomainError::conflict("transaction already exists"));
        }
        if cmd.amount == 0 {
            return Err(DomainError::validation("amount must be positive"));
        }
        if cmd.from_wallet.is_none() && cmd.to_wallet.is_none() {
            return Err(DomainError::validation(
                "transaction must reference at least one wallet",
            ));
        }
        if let (Some(from), Some(to)) = (cmd.from_wallet, cmd.to_wallet) {
            if from == to {
                return Err(DomainError::validation(
                    "source and destination wallets must differ",
                ));
            }
        }
        if cmd.idempotency_key.is_empty() {
            return Err(DomainError::validation("idempotency key must not be empty"));
        }

        Ok(vec![TransactionEvent::Opened {
            transaction_id: cmd.transaction_id,
            idempotency_key: cmd.idempotency_key.clone(),
            kind: cmd.kind,
            from_wallet: cmd.from_wallet,
            to_wallet: cmd.to_wallet,
            amount: cmd.amount,
            currency: cmd.currency,
            description: cmd.description.clone(),
            metadata: cmd.metadata.clone(),
            reference: reference_code(cmd.transaction_id, cmd.occurred_at),
            occurred_at: cmd.occurred_at,
        }])
    }

    fn handle_complete(
        &self,
        legs: &[AppliedLeg],
        occurred_at: DateTime<Utc>,
    ) -> DomainResult<Vec<TransactionEvent>> {
        if !self.created {
            return Err(DomainError::UnknownTransaction);
        }
        match self.status {
            TransactionStatus::Pending => Ok(vec![TransactionEvent::Completed {
                legs: legs.to_vec(),
                occurred_at,
            }]),
            // Completing a completed transaction is an idempotent no-op.
            TransactionStatus::Completed => Ok(vec![]),
            other => Err(DomainError::invalid_transition(
                "transaction",
                other.as_str(),
                "completed",
            )),
        }
    }

    fn handle_terminal(
        &self,
        attempted: &'static str,
        event: TransactionEvent,
    ) -> DomainResult<Vec<TransactionEvent>> {
        if !self.created {
            return Err(DomainError::UnknownTransaction);
        }
        match self.status {
            TransactionStatus::Pending => Ok(vec![event]),
            other => Err(DomainError::invalid_transition(
                "transaction",
                other.as_str(),
                attempted,
            )),
        }
    }
}


#[cfg(test)]
mod invariant_tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    proptest! {
        /// Reference codes always carry the APX prefix, a six-digit date and
        /// a five-digit sequence, for any id and creation time.
        #[test]
        fn reference_code_shape_holds(
            bytes in proptest::array::uniform16(any::<u8>()),
            secs in 0i64..4_102_444_800, // through 2099
        ) {
            let id = TransactionId::new(AggregateId::from_uuid(Uuid::from_bytes(bytes)));
            let at = Utc.timestamp_opt(secs, 0).unwrap();
            let code = reference_code(id, at);

            prop_assert_eq!(code.len(), 14);
            prop_assert!(code.starts_with("APX"));
            prop_assert!(code[3..].bytes().all(|b| b.is_ascii_digit()));
            // Deterministic under replay.
            prop_assert_eq!(code, reference_code(id, at));
        }

        /// A terminal transaction never emits further events.
        #[test]
        fn terminal_states_reject_all_commands(terminal in 0usize..3) {
            let id = TransactionId::new(AggregateId::new());
            let mut tx = Transaction::empty(id);
            let now = Utc::now();
            tx.apply(&TransactionEvent::Opened {
                transaction_id: id,
                idempotency_key: "k".to_string(),
                kind: TransactionKind::Deposit,
                from_wallet: None,
                to_wallet: Some(WalletId::new(AggregateId::new())),
                amount: 50,
                currency: Currency::Mxn,
                description: String::new(),
                metadata: TransactionMetadata::default(),
                reference: reference_code(id, now),
                occurred_at: now,
            });
            let event = match terminal {
                0 => TransactionEvent::Completed { legs: vec![], occurred_at: now },
                1 => TransactionEvent::Failed { reason: "r".to_string(), occurred_at: now },
                _ => TransactionEvent::Cancelled { occurred_at: now },
            };
            tx.apply(&event);

            let fail = TransactionCommand::Fail { reason: "late".to_string(), occurred_at: now };
            let cancel = TransactionCommand::Cancel { occurred_at: now };
            prop_assert!(tx.handle(&fail).is_err());
            prop_assert!(tx.handle(&cancel).is_err());
            let complete = TransactionCommand::Complete { legs: vec![], occurred_at: now };
            match tx.status() {
                TransactionStatus::Completed => prop_assert!(tx.handle(&complete).unwrap().is_empty()),
                _ => prop_assert!(tx.handle(&complete).is_err()),
            }
        }
    }
}

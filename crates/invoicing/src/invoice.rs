use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use apexfin_core::{
    Aggregate, AggregateId, AggregateRoot, BasisPoints, Currency, DomainError, DomainResult,
    UserId,
};
use apexfin_events::Event;

/// Invoice identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InvoiceId(pub AggregateId);

impl InvoiceId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for InvoiceId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Fiscal lifecycle of an invoice.
///
/// `error` is recoverable (the invoice can be resubmitted); `cancelled` is
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Draft,
    Sent,
    Active,
    Error,
    Cancelled,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Draft => "draft",
            InvoiceStatus::Sent => "sent",
            InvoiceStatus::Active => "active",
            InvoiceStatus::Error => "error",
            InvoiceStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub name: String,
    pub tax_id: String,
    pub email: String,
    pub address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceItem {
    pub description: String,
    pub quantity: u32,
    /// Unit price in cents.
    pub unit_price: u64,
    /// Line total in cents; must equal `quantity * unit_price`.
    pub total: u64,
}

/// Fiscal stamp recorded when the provider confirms the invoice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StampData {
    pub uuid: Uuid,
    pub seal: String,
    pub xml_url: String,
    pub pdf_url: String,
    pub stamped_at: DateTime<Utc>,
}

/// Provider email notification, appended to the invoice log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailRecord {
    pub recipient: String,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactoringRequestStatus {
    Pending,
    Approved,
    Rejected,
}

/// Post-approval financing state, driven by partner notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinancingStatus {
    Processing,
    Deposited,
    Collected,
    Overdue,
}

impl FinancingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FinancingStatus::Processing => "processing",
            FinancingStatus::Deposited => "deposited",
            FinancingStatus::Collected => "collected",
            FinancingStatus::Overdue => "overdue",
        }
    }

    /// Monotonic ordering used to absorb out-of-order notifications.
    fn rank(&self) -> u8 {
        match self {
            FinancingStatus::Processing => 0,
            FinancingStatus::Deposited => 1,
            FinancingStatus::Overdue => 2,
            FinancingStatus::Collected => 3,
        }
    }
}

/// Factoring state carried on the invoice. Tracked independently of the
/// fiscal `status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactoringState {
    pub partner_id: String,
    pub requested_at: DateTime<Utc>,
    pub decided_at: Option<DateTime<Utc>>,
    pub request_status: FactoringRequestStatus,
    pub anticipated_amount: Option<u64>,
    pub fee_bps: Option<BasisPoints>,
    pub rejection_reason: Option<String>,
    pub financing_status: Option<FinancingStatus>,
}

/// Eligibility thresholds for factoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactoringPolicy {
    /// Minimum invoice amount in cents.
    pub min_amount: u64,
    /// The due date must be strictly more than this many days away.
    pub min_lead_days: i64,
}

impl Default for FactoringPolicy {
    fn default() -> Self {
        Self {
            min_amount: 100_000,
            min_lead_days: 1,
        }
    }
}

/// Partner decision on a factoring request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FactoringDecision {
    Approved {
        anticipated_amount: u64,
        fee_bps: BasisPoints,
    },
    Rejected {
        reason: String,
    },
}

/// Aggregate root: Invoice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invoice {
    id: InvoiceId,
    issuer: Option<UserId>,
    invoice_number: Option<String>,
    client: Option<ClientInfo>,
    items: Vec<InvoiceItem>,
    subtotal: u64,
    tax: u64,
    amount: u64,
    currency: Currency,
    due_date: Option<DateTime<Utc>>,
    description: String,
    status: InvoiceStatus,
    stamp: Option<StampData>,
    factoring: Option<FactoringState>,
    email_log: Vec<EmailRecord>,
    cancellation_reason: Option<String>,
    cancelled_at: Option<DateTime<Utc>>,
    created_at: Option<DateTime<Utc>>,
    version: u64,
    created: bool,
}

impl Invoice {
    /// Empty aggregate for rehydration.
    pub fn empty(id: InvoiceId) -> Self {
        Self {
            id,
            issuer: None,
            invoice_number: None,
            client: None,
            items: Vec::new(),
            subtotal: 0,
            tax: 0,
            amount: 0,
            currency: Currency::default(),
            due_date: None,
            description: String::new(),
            status: InvoiceStatus::Draft,
            stamp: None,
            factoring: None,
            email_log: Vec::new(),
            cancellation_reason: None,
            cancelled_at: None,
            created_at: None,
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> InvoiceId {
        self.id
    }

    pub fn issuer(&self) -> Option<UserId> {
        self.issuer
    }

    /// Human-readable invoice number (`APX-yyyymm-nnnn`).
    pub fn invoice_number(&self) -> Option<&str> {
        self.invoice_number.as_deref()
    }

    pub fn client(&self) -> Option<&ClientInfo> {
        self.client.as_ref()
    }

    pub fn items(&self) -> &[InvoiceItem] {
        &self.items
    }

    pub fn subtotal(&self) -> u64 {
        self.subtotal
    }

    pub fn tax(&self) -> u64 {
        self.tax
    }

    pub fn amount(&self) -> u64 {
        self.amount
    }

    pub fn currency(&self) -> Currency {
        self.currency
    }

    pub fn due_date(&self) -> Option<DateTime<Utc>> {
        self.due_date
    }

    pub fn status(&self) -> InvoiceStatus {
        self.status
    }

    pub fn stamp(&self) -> Option<&StampData> {
        self.stamp.as_ref()
    }

    pub fn factoring(&self) -> Option<&FactoringState> {
        self.factoring.as_ref()
    }

    pub fn email_log(&self) -> &[EmailRecord] {
        &self.email_log
    }

    pub fn cancellation_reason(&self) -> Option<&str> {
        self.cancellation_reason.as_deref()
    }

    pub fn is_created(&self) -> bool {
        self.created
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created_at
    }

    /// Days since the invoice was created.
    pub fn age_days(&self, now: DateTime<Utc>) -> i64 {
        match self.created_at {
            Some(created) => (now - created).num_days(),
            None => 0,
        }
    }

    /// Days until the due date, negative once past due.
    pub fn days_until_due(&self, now: DateTime<Utc>) -> i64 {
        match self.due_date {
            Some(due) => (due - now).num_days(),
            None => 0,
        }
    }

    /// Pure eligibility predicate over the current snapshot.
    pub fn can_be_factored(&self, policy: &FactoringPolicy, now: DateTime<Utc>) -> bool {
        self.factoring_blockers(policy, now).is_empty()
    }

    /// Reasons the invoice cannot be factored right now. Empty means
    /// eligible.
    pub fn factoring_blockers(&self, policy: &FactoringPolicy, now: DateTime<Utc>) -> Vec<String> {
        let mut blockers = Vec::new();

        if !matches!(self.status, InvoiceStatus::Sent | InvoiceStatus::Active) {
            blockers.push(format!(
                "invoice is {}, expected sent or active",
                self.status.as_str()
            ));
        }
        if self.amount < policy.min_amount {
            blockers.push(format!(
                "amount {} below minimum {}",
                self.amount, policy.min_amount
            ));
        }
        if self.days_until_due(now) <= policy.min_lead_days {
            blockers.push(format!(
                "due date must be more than {} day(s) away",
                policy.min_lead_days
            ));
        }
        if let Some(factoring) = &self.factoring {
            match factoring.request_status {
                FactoringRequestStatus::Pending => {
                    blockers.push("a factoring request is already pending".to_string());
                }
                FactoringRequestStatus::Approved => {
                    blockers.push("invoice is already factored".to_string());
                }
                // A rejected request may be resubmitted.
                FactoringRequestStatus::Rejected => {}
            }
        }

        blockers
    }
}

/// Generate the human-readable invoice number from the invoice id and its
/// creation time. Deterministic: replays produce the same number.
pub fn invoice_number_code(id: InvoiceId, created_at: DateTime<Utc>) -> String {
    use chrono::Datelike;
    let uuid: Uuid = id.0.into();
    let tail = u16::from_be_bytes(uuid.as_bytes()[14..16].try_into().expect("uuid is 16 bytes"));
    format!(
        "APX-{:04}{:02}-{:04}",
        created_at.year(),
        created_at.month(),
        tail % 10_000
    )
}

impl AggregateRoot for Invoice {
    type Id = InvoiceId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: create a draft invoice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateInvoice {
    pub invoice_id: InvoiceId,
    pub issuer: UserId,
    pub client: ClientInfo,
    pub items: Vec<InvoiceItem>,
    /// Tax in cents, added on top of the item subtotal.
    pub tax: u64,
    pub currency: Currency,
    pub due_date: DateTime<Utc>,
    pub description: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InvoiceCommand {
    Create(CreateInvoice),
    /// Submit to the fiscal provider (`draft`/`error` → `sent`).
    Issue {
        occurred_at: DateTime<Utc>,
    },
    /// Fiscal provider confirmed the stamp (`sent` → `active`).
    ConfirmStamp {
        stamp: StampData,
    },
    /// Fiscal provider reported a stamping failure (`sent` → `error`).
    RecordStampError {
        code: String,
        message: String,
        occurred_at: DateTime<Utc>,
    },
    /// Provider email notification; no state transition.
    RecordEmail {
        recipient: String,
        sent_at: DateTime<Utc>,
    },
    /// Cancel an active invoice. Irreversible.
    Cancel {
        reason: String,
        occurred_at: DateTime<Utc>,
    },
    RequestFactoring {
        partner_id: String,
        occurred_at: DateTime<Utc>,
    },
    RecordFactoringDecision {
        decision: FactoringDecision,
        occurred_at: DateTime<Utc>,
    },
    /// Partner financing notification; updates `factoring.financing_status`
    /// only.
    UpdateFinancingStatus {
        status: FinancingStatus,
        occurred_at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InvoiceEvent {
    Created {
        invoice_id: InvoiceId,
        issuer: UserId,
        invoice_number: String,
        client: ClientInfo,
        items: Vec<InvoiceItem>,
        subtotal: u64,
        tax: u64,
        amount: u64,
        currency: Currency,
        due_date: DateTime<Utc>,
        description: String,
        occurred_at: DateTime<Utc>,
    },
    Issued {
        occurred_at: DateTime<Utc>,
    },
    Stamped {
        stamp: StampData,
        occurred_at: DateTime<Utc>,
    },
    StampFailed {
        code: String,
        message: String,
        occurred_at: DateTime<Utc>,
    },
    EmailLogged {
        recipient: String,
        sent_at: DateTime<Utc>,
        occurred_at: DateTime<Utc>,
    },
    Cancelled {
        reason: String,
        occurred_at: DateTime<Utc>,
    },
    FactoringRequested {
        partner_id: String,
        occurred_at: DateTime<Utc>,
    },
    FactoringApproved {
        anticipated_amount: u64,
        fee_bps: BasisPoints,
        occurred_at: DateTime<Utc>,
    },
    FactoringRejected {
        reason: String,
        occurred_at: DateTime<Utc>,
    },
    FinancingStatusChanged {
        status: FinancingStatus,
        occurred_at: DateTime<Utc>,
    },
}

impl Event for InvoiceEvent {
    fn event_type(&self) -> &'static str {
        match self {
            InvoiceEvent::Created { .. } => "invoice.created",
            InvoiceEvent::Issued { .. } => "invoice.issued",
            InvoiceEvent::Stamped { .. } => "invoice.stamped",
            InvoiceEvent::StampFailed { .. } => "invoice.stamp_failed",
            InvoiceEvent::EmailLogged { .. } => "invoice.email_logged",
            InvoiceEvent::Cancelled { .. } => "invoice.cancelled",
            InvoiceEvent::FactoringRequested { .. } => "invoice.factoring.requested",
            InvoiceEvent::FactoringApproved { .. } => "invoice.factoring.approved",
            InvoiceEvent::FactoringRejected { .. } => "invoice.factoring.rejected",
            InvoiceEvent::FinancingStatusChanged { .. } => "invoice.factoring.financing_changed",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            InvoiceEvent::Created { occurred_at, .. }
            | InvoiceEvent::Issued { occurred_at }
            | InvoiceEvent::StampFailed { occurred_at, .. }
            | InvoiceEvent::EmailLogged { occurred_at, .. }
            | InvoiceEvent::Cancelled { occurred_at, .. }
            | InvoiceEvent::FactoringRequested { occurred_at, .. }
            | InvoiceEvent::FactoringApproved { occurred_at, .. }
            | InvoiceEvent::FactoringRejected { occurred_at, .. }
            | InvoiceEvent::FinancingStatusChanged { occurred_at, .. } => *occurred_at,
            InvoiceEvent::Stamped { occurred_at, .. } => *occurred_at,
        }
    }
}

impl Aggregate for Invoice {
    type Command = InvoiceCommand;
    type Event = InvoiceEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            InvoiceEvent::Created {
                invoice_id,
                issuer,
                invoice_number,
                client,
                items,
                subtotal,
                tax,
                amount,
                currency,
                due_date,
                description,
                occurred_at,
            } => {
                self.id = *invoice_id;
                self.issuer = Some(*issuer);
                self.invoice_number = Some(invoice_number.clone());
                self.client = Some(client.clone());
                self.items = items.clone();
                self.subtotal = *subtotal;
                self.tax = *tax;
                self.amount = *amount;
                self.currency = *currency;
                self.due_date = Some(*due_date);
                self.description = description.clone();
                self.status = InvoiceStatus::Draft;
                self.created_at = Some(*occurred_at);
                self.created = true;
            }
            InvoiceEvent::Issued { .. } => {
                self.status = InvoiceStatus::Sent;
            }
            InvoiceEvent::Stamped { stamp, .. } => {
                self.stamp = Some(stamp.clone());
                self.status = InvoiceStatus::Active;
            }
            InvoiceEvent::StampFailed { .. } => {
                self.status = InvoiceStatus::Error;
            }
            InvoiceEvent::EmailLogged {
                recipient, sent_at, ..
            } => {
                self.email_log.push(EmailRecord {
                    recipient: recipient.clone(),
                    sent_at: *sent_at,
                });
            }
            InvoiceEvent::Cancelled {
                reason,
                occurred_at,
            } => {
                self.status = InvoiceStatus::Cancelled;
                self.cancellation_reason = Some(reason.clone());
                self.cancelled_at = Some(*occurred_at);
            }
            InvoiceEvent::FactoringRequested {
                partner_id,
                occurred_at,
            } => {
                self.factoring = Some(FactoringState {
                    partner_id: partner_id.clone(),
                    requested_at: *occurred_at,
                    decided_at: None,
                    request_status: FactoringRequestStatus::Pending,
                    anticipated_amount: None,
                    fee_bps: None,
                    rejection_reason: None,
                    financing_status: None,
                });
            }
            InvoiceEvent::FactoringApproved {
                anticipated_amount,
                fee_bps,
                occurred_at,
            } => {
                if let Some(factoring) = &mut self.factoring {
                    factoring.request_status = FactoringRequestStatus::Approved;
                    factoring.decided_at = Some(*occurred_at);
                    factoring.anticipated_amount = Some(*anticipated_amount);
                    factoring.fee_bps = Some(*fee_bps);
                }
            }
            InvoiceEvent::FactoringRejected {
                reason,
                occurred_at,
            } => {
                if let Some(factoring) = &mut self.factoring {
                    factoring.request_status = FactoringRequestStatus::Rejected;
                    factoring.decided_at = Some(*occurred_at);
                    factoring.rejection_reason = Some(reason.clone());
                }
            }
            InvoiceEvent::FinancingStatusChanged { status, .. } => {
                if let Some(factoring) = &mut self.factoring {
                    factoring.financing_status = Some(*status);
                }
            }
        }

        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            InvoiceCommand::Create(cmd) => self.handle_create(cmd),
            InvoiceCommand::Issue { occurred_at } => self.handle_issue(*occurred_at),
            InvoiceCommand::ConfirmStamp { stamp } => self.handle_confirm_stamp(stamp),
            InvoiceCommand::RecordStampError {
                code,
                message,
                occurred_at,
            } => self.handle_stamp_error(code, message, *occurred_at),
            InvoiceCommand::RecordEmail { recipient, sent_at } => {
                self.ensure_created()?;
                Ok(vec![InvoiceEvent::EmailLogged {
                    recipient: recipient.clone(),
                    sent_at: *sent_at,
                    occurred_at: *sent_at,
                }])
            }
            InvoiceCommand::Cancel {
                reason,
                occurred_at,
            } => self.handle_cancel(reason, *occurred_at),
            InvoiceCommand::RequestFactoring {
                partner_id,
                occurred_at,
            } => self.handle_request_factoring(partner_id, *occurred_at),
            InvoiceCommand::RecordFactoringDecision {
                decision,
                occurred_at,
            } => self.handle_factoring_decision(decision, *occurred_at),
            InvoiceCommand::UpdateFinancingStatus {
                status,
                occurred_at,
            } => self.handle_financing_status(*status, *occurred_at),
        }
    }
}

impl Invoice {
    fn ensure_created(&self) -> DomainResult<()> {
        if self.created {
            Ok(())
        } else {
            Err(DomainError::UnknownInvoice)
        }
    }

    fn handle_create(&self, cmd: &CreateInvoice) -> DomainResult<Vec<InvoiceEvent>> {
        if self.created {
            return Err(DomainError::conflict("invoice already exists"));
        }
        if cmd.items.is_empty() {
            return Err(DomainError::validation("invoice must have at least one item"));
        }
        if cmd.client.name.is_empty() || cmd.client.tax_id.is_empty() {
            return Err(DomainError::validation("client name and tax id are required"));
        }

        let mut subtotal: u64 = 0;
        for item in &cmd.items {
            if item.quantity == 0 {
                return Err(DomainError::validation("item quantity must be positive"));
            }
            let expected = u64::from(item.quantity)
                .checked_mul(item.unit_price)
                .ok_or_else(|| DomainError::validation("item total overflows"))?;
            if expected != item.total {
                return Err(DomainError::validation(
                    "item total must equal quantity times unit price",
                ));
            }
            subtotal = subtotal
                .checked_add(item.total)
                .ok_or_else(|| DomainError::validation("invoice subtotal overflows"))?;
        }
        if subtotal == 0 {
            return Err(DomainError::validation("invoice amount must be positive"));
        }
        let amount = subtotal
            .checked_add(cmd.tax)
            .ok_or_else(|| DomainError::validation("invoice amount overflows"))?;
        if cmd.due_date <= cmd.occurred_at {
            return Err(DomainError::validation("due date must be in the future"));
        }

        Ok(vec![InvoiceEvent::Created {
            invoice_id: cmd.invoice_id,
            issuer: cmd.issuer,
            invoice_number: invoice_number_code(cmd.invoice_id, cmd.occurred_at),
            client: cmd.client.clone(),
            items: cmd.items.clone(),
            subtotal,
            tax: cmd.tax,
            amount,
            currency: cmd.currency,
            due_date: cmd.due_date,
            description: cmd.description.clone(),
            occurred_at: cmd.occurred_at,
        }])
    }

    fn handle_issue(&self, occurred_at: DateTime<Utc>) -> DomainResult<Vec<InvoiceEvent>> {
        self.ensure_created()?;
        match self.status {
            InvoiceStatus::Draft | InvoiceStatus::Error => {
                Ok(vec![InvoiceEvent::Issued { occurred_at }])
            }
            other => Err(DomainError::invalid_transition(
                "invoice",
                other.as_str(),
                "sent",
            )),
        }
    }

    fn handle_confirm_stamp(&self, stamp: &StampData) -> DomainResult<Vec<InvoiceEvent>> {
        self.ensure_created()?;
        match self.status {
            InvoiceStatus::Sent => Ok(vec![InvoiceEvent::Stamped {
                stamp: stamp.clone(),
                occurred_at: stamp.stamped_at,
            }]),
            // Duplicate confirmation with the same fiscal uuid is a no-op;
            // a different uuid on an active invoice is an anomaly the
            // caller logs. Neither mutates state.
            InvoiceStatus::Active => Ok(vec![]),
            other => Err(DomainError::invalid_transition(
                "invoice",
                other.as_str(),
                "active",
            )),
        }
    }

    fn handle_stamp_error(
        &self,
        code: &str,
        message: &str,
        occurred_at: DateTime<Utc>,
    ) -> DomainResult<Vec<InvoiceEvent>> {
        self.ensure_created()?;
        match self.status {
            InvoiceStatus::Sent => Ok(vec![InvoiceEvent::StampFailed {
                code: code.to_string(),
                message: message.to_string(),
                occurred_at,
            }]),
            // A late error after a confirmation, or a duplicate error
            // delivery, is absorbed. Confirmations take precedence.
            InvoiceStatus::Active | InvoiceStatus::Error => Ok(vec![]),
            other => Err(DomainError::invalid_transition(
                "invoice",
                other.as_str(),
                "error",
            )),
        }
    }

    fn handle_cancel(
        &self,
        reason: &str,
        occurred_at: DateTime<Utc>,
    ) -> DomainResult<Vec<InvoiceEvent>> {
        self.ensure_created()?;
        match self.status {
            InvoiceStatus::Active => Ok(vec![InvoiceEvent::Cancelled {
                reason: reason.to_string(),
                occurred_at,
            }]),
            InvoiceStatus::Cancelled => Err(DomainError::AlreadyCancelled),
            other => Err(DomainError::invalid_transition(
                "invoice",
                other.as_str(),
                "cancelled",
            )),
        }
    }

    fn handle_request_factoring(
        &self,
        partner_id: &str,
        occurred_at: DateTime<Utc>,
    ) -> DomainResult<Vec<InvoiceEvent>> {
        self.ensure_created()?;
        if partner_id.is_empty() {
            return Err(DomainError::validation("partner id must not be empty"));
        }
        if let Some(factoring) = &self.factoring {
            match factoring.request_status {
                FactoringRequestStatus::Pending => {
                    return Err(DomainError::not_eligible(vec![
                        "a factoring request is already pending".to_string(),
                    ]));
                }
                FactoringRequestStatus::Approved => {
                    return Err(DomainError::not_eligible(vec![
                        "invoice is already factored".to_string(),
                    ]));
                }
                FactoringRequestStatus::Rejected => {}
            }
        }

        Ok(vec![InvoiceEvent::FactoringRequested {
            partner_id: partner_id.to_string(),
            occurred_at,
        }])
    }

    fn handle_factoring_decision(
        &self,
        decision: &FactoringDecision,
        occurred_at: DateTime<Utc>,
    ) -> DomainResult<Vec<InvoiceEvent>> {
        self.ensure_created()?;
        let factoring = self
            .factoring
            .as_ref()
            .ok_or_else(|| DomainError::validation("no factoring request on invoice"))?;
        if factoring.request_status != FactoringRequestStatus::Pending {
            return Err(DomainError::invalid_transition(
                "factoring request",
                match factoring.request_status {
                    FactoringRequestStatus::Approved => "approved",
                    FactoringRequestStatus::Rejected => "rejected",
                    FactoringRequestStatus::Pending => "pending",
                },
                "decided",
            ));
        }

        let event = match decision {
            FactoringDecision::Approved {
                anticipated_amount,
                fee_bps,
            } => {
                if *anticipated_amount == 0 || *anticipated_amount > self.amount {
                    return Err(DomainError::validation(
                        "anticipated amount must be positive and at most the invoice amount",
                    ));
                }
                InvoiceEvent::FactoringApproved {
                    anticipated_amount: *anticipated_amount,
                    fee_bps: *fee_bps,
                    occurred_at,
                }
            }
            FactoringDecision::Rejected { reason } => InvoiceEvent::FactoringRejected {
                reason: reason.clone(),
                occurred_at,
            },
        };
        Ok(vec![event])
    }

    fn handle_financing_status(
        &self,
        status: FinancingStatus,
        occurred_at: DateTime<Utc>,
    ) -> DomainResult<Vec<InvoiceEvent>> {
        self.ensure_created()?;
        let factoring = self
            .factoring
            .as_ref()
            .ok_or_else(|| DomainError::validation("no factoring request on invoice"))?;
        if factoring.request_status != FactoringRequestStatus::Approved {
            return Err(DomainError::invalid_transition(
                "financing",
                "not approved",
                status.as_str(),
            ));
        }

        // Notifications can arrive duplicated or out of order; only forward
        // movement is recorded.
        match factoring.financing_status {
            Some(current) if status.rank() <= current.rank() => Ok(vec![]),
            _ => Ok(vec![InvoiceEvent::FinancingStatusChanged {
                status,
                occurred_at,
            }]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use apexfin_events::execute;
    use chrono::Duration;

    fn client() -> ClientInfo {
        ClientInfo {
            name: "Acme SA de CV".to_string(),
            tax_id: "AAA010101AAA".to_string(),
            email: "billing@acme.test".to_string(),
            address: None,
        }
    }

    fn item(quantity: u32, unit_price: u64) -> InvoiceItem {
        InvoiceItem {
            description: "consulting".to_string(),
            quantity,
            unit_price,
            total: u64::from(quantity) * unit_price,
        }
    }

    fn create_cmd(now: DateTime<Utc>) -> CreateInvoice {
        CreateInvoice {
            invoice_id: InvoiceId::new(AggregateId::new()),
            issuer: UserId::new(),
            client: client(),
            items: vec![item(2, 75_000)],
            tax: 24_000,
            currency: Currency::Mxn,
            due_date: now + Duration::days(30),
            description: "august services".to_string(),
            occurred_at: now,
        }
    }

    fn draft(now: DateTime<Utc>) -> Invoice {
        let cmd = create_cmd(now);
        let mut invoice = Invoice::empty(cmd.invoice_id);
        execute(&mut invoice, &InvoiceCommand::Create(cmd)).unwrap();
        invoice
    }

    fn sent(now: DateTime<Utc>) -> Invoice {
        let mut invoice = draft(now);
        execute(&mut invoice, &InvoiceCommand::Issue { occurred_at: now }).unwrap();
        invoice
    }

    fn stamp(uuid: Uuid, at: DateTime<Utc>) -> StampData {
        StampData {
            uuid,
            seal: "SEAL==".to_string(),
            xml_url: "https://fiscal.test/cfdi.xml".to_string(),
            pdf_url: "https://fiscal.test/cfdi.pdf".to_string(),
            stamped_at: at,
        }
    }

    fn active(now: DateTime<Utc>) -> Invoice {
        let mut invoice = sent(now);
        execute(
            &mut invoice,
            &InvoiceCommand::ConfirmStamp {
                stamp: stamp(Uuid::now_v7(), now),
            },
        )
        .unwrap();
        invoice
    }

    #[test]
    fn create_computes_totals_and_number() {
        let now = Utc::now();
        let invoice = draft(now);
        assert_eq!(invoice.subtotal(), 150_000);
        assert_eq!(invoice.tax(), 24_000);
        assert_eq!(invoice.amount(), 174_000);
        assert_eq!(invoice.status(), InvoiceStatus::Draft);

        let number = invoice.invoice_number().unwrap();
        assert!(number.starts_with("APX-"));
        assert_eq!(number.len(), 15);
    }

    #[test]
    fn create_rejects_inconsistent_items() {
        let now = Utc::now();
        let mut cmd = create_cmd(now);
        cmd.items[0].total += 1;
        let invoice = Invoice::empty(cmd.invoice_id);
        let err = invoice.handle(&InvoiceCommand::Create(cmd)).unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));

        let mut cmd = create_cmd(now);
        cmd.items.clear();
        let err = invoice.handle(&InvoiceCommand::Create(cmd)).unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));

        let mut cmd = create_cmd(now);
        cmd.due_date = now - Duration::days(1);
        let err = invoice.handle(&InvoiceCommand::Create(cmd)).unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn lifecycle_draft_sent_active() {
        let now = Utc::now();
        let invoice = active(now);
        assert_eq!(invoice.status(), InvoiceStatus::Active);
        assert!(invoice.stamp().is_some());
    }

    #[test]
    fn stamp_error_allows_retry() {
        let now = Utc::now();
        let mut invoice = sent(now);
        execute(
            &mut invoice,
            &InvoiceCommand::RecordStampError {
                code: "301".to_string(),
                message: "invalid tax id".to_string(),
                occurred_at: now,
            },
        )
        .unwrap();
        assert_eq!(invoice.status(), InvoiceStatus::Error);

        execute(&mut invoice, &InvoiceCommand::Issue { occurred_at: now }).unwrap();
        assert_eq!(invoice.status(), InvoiceStatus::Sent);
    }

    #[test]
    fn duplicate_stamp_confirmation_is_absorbed() {
        let now = Utc::now();
        let mut invoice = active(now);
        let recorded = invoice.stamp().unwrap().clone();

        // Same uuid redelivered.
        let events = invoice
            .handle(&InvoiceCommand::ConfirmStamp {
                stamp: recorded.clone(),
            })
            .unwrap();
        assert!(events.is_empty());

        // A different uuid on an active invoice is ignored too.
        let events = invoice
            .handle(&InvoiceCommand::ConfirmStamp {
                stamp: stamp(Uuid::now_v7(), now),
            })
            .unwrap();
        assert!(events.is_empty());
        assert_eq!(invoice.stamp(), Some(&recorded));
    }

    #[test]
    fn late_stamp_error_on_active_is_absorbed() {
        let now = Utc::now();
        let mut invoice = active(now);
        let events = execute(
            &mut invoice,
            &InvoiceCommand::RecordStampError {
                code: "500".to_string(),
                message: "provider hiccup".to_string(),
                occurred_at: now,
            },
        )
        .unwrap();
        assert!(events.is_empty());
        assert_eq!(invoice.status(), InvoiceStatus::Active);
    }

    #[test]
    fn cancel_only_from_active() {
        let now = Utc::now();

        let draft_invoice = draft(now);
        let err = draft_invoice
            .handle(&InvoiceCommand::Cancel {
                reason: "customer request".to_string(),
                occurred_at: now,
            })
            .unwrap_err();
        assert!(matches!(err, DomainError::InvalidStateTransition { .. }));

        let mut invoice = active(now);
        execute(
            &mut invoice,
            &InvoiceCommand::Cancel {
                reason: "customer request".to_string(),
                occurred_at: now,
            },
        )
        .unwrap();
        assert_eq!(invoice.status(), InvoiceStatus::Cancelled);

        let err = invoice
            .handle(&InvoiceCommand::Cancel {
                reason: "again".to_string(),
                occurred_at: now,
            })
            .unwrap_err();
        assert!(matches!(err, DomainError::AlreadyCancelled));
    }

    #[test]
    fn email_notifications_accumulate() {
        let now = Utc::now();
        let mut invoice = sent(now);
        for recipient in ["billing@acme.test", "cfo@acme.test"] {
            execute(
                &mut invoice,
                &InvoiceCommand::RecordEmail {
                    recipient: recipient.to_string(),
                    sent_at: now,
                },
            )
            .unwrap();
        }
        assert_eq!(invoice.email_log().len(), 2);
        assert_eq!(invoice.status(), InvoiceStatus::Sent);
    }

    #[test]
    fn factoring_eligibility() {
        let now = Utc::now();
        let policy = FactoringPolicy::default();

        let invoice = sent(now);
        assert!(invoice.can_be_factored(&policy, now));

        // Draft invoices are not eligible.
        let blockers = draft(now).factoring_blockers(&policy, now);
        assert_eq!(blockers.len(), 1);
        assert!(blockers[0].contains("draft"));

        // Below the minimum amount.
        let strict = FactoringPolicy {
            min_amount: 1_000_000,
            ..policy
        };
        assert!(!invoice.can_be_factored(&strict, now));

        // Too close to the due date.
        assert!(!invoice.can_be_factored(&policy, now + Duration::days(29)));
    }

    #[test]
    fn pending_request_blocks_resubmission_rejected_does_not() {
        let now = Utc::now();
        let mut invoice = sent(now);
        execute(
            &mut invoice,
            &InvoiceCommand::RequestFactoring {
                partner_id: "konfio".to_string(),
                occurred_at: now,
            },
        )
        .unwrap();

        let err = invoice
            .handle(&InvoiceCommand::RequestFactoring {
                partner_id: "konfio".to_string(),
                occurred_at: now,
            })
            .unwrap_err();
        assert!(matches!(err, DomainError::FactoringNotEligible { .. }));

        execute(
            &mut invoice,
            &InvoiceCommand::RecordFactoringDecision {
                decision: FactoringDecision::Rejected {
                    reason: "risk score too low".to_string(),
                },
                occurred_at: now,
            },
        )
        .unwrap();

        // Rejected requests may be resubmitted.
        execute(
            &mut invoice,
            &InvoiceCommand::RequestFactoring {
                partner_id: "konfio".to_string(),
                occurred_at: now,
            },
        )
        .unwrap();
        let factoring = invoice.factoring().unwrap();
        assert_eq!(factoring.request_status, FactoringRequestStatus::Pending);
        assert!(factoring.rejection_reason.is_none());
    }

    #[test]
    fn approval_validates_anticipated_amount() {
        let now = Utc::now();
        let mut invoice = sent(now);
        execute(
            &mut invoice,
            &InvoiceCommand::RequestFactoring {
                partner_id: "konfio".to_string(),
                occurred_at: now,
            },
        )
        .unwrap();

        let err = invoice
            .handle(&InvoiceCommand::RecordFactoringDecision {
                decision: FactoringDecision::Approved {
                    anticipated_amount: invoice.amount() + 1,
                    fee_bps: 500,
                },
                occurred_at: now,
            })
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));

        let anticipated = invoice.amount() * 95 / 100;
        execute(
            &mut invoice,
            &InvoiceCommand::RecordFactoringDecision {
                decision: FactoringDecision::Approved {
                    anticipated_amount: anticipated,
                    fee_bps: 500,
                },
                occurred_at: now,
            },
        )
        .unwrap();
        let factoring = invoice.factoring().unwrap();
        assert_eq!(factoring.request_status, FactoringRequestStatus::Approved);
        assert_eq!(factoring.fee_bps, Some(500));
    }

    #[test]
    fn financing_status_moves_forward_only() {
        let now = Utc::now();
        let mut invoice = sent(now);
        execute(
            &mut invoice,
            &InvoiceCommand::RequestFactoring {
                partner_id: "konfio".to_string(),
                occurred_at: now,
            },
        )
        .unwrap();
        execute(
            &mut invoice,
            &InvoiceCommand::RecordFactoringDecision {
                decision: FactoringDecision::Approved {
                    anticipated_amount: 100_000,
                    fee_bps: 500,
                },
                occurred_at: now,
            },
        )
        .unwrap();

        for status in [FinancingStatus::Processing, FinancingStatus::Deposited] {
            let events = execute(
                &mut invoice,
                &InvoiceCommand::UpdateFinancingStatus {
                    status,
                    occurred_at: now,
                },
            )
            .unwrap();
            assert_eq!(events.len(), 1);
        }

        // Duplicate and out-of-order notifications are absorbed.
        for status in [FinancingStatus::Deposited, FinancingStatus::Processing] {
            let events = execute(
                &mut invoice,
                &InvoiceCommand::UpdateFinancingStatus {
                    status,
                    occurred_at: now,
                },
            )
            .unwrap();
            assert!(events.is_empty());
        }
        assert_eq!(
            invoice.factoring().unwrap().financing_status,
            Some(FinancingStatus::Deposited)
        );
    }

    #[test]
    fn financing_status_requires_approval() {
        let now = Utc::now();
        let mut invoice = sent(now);
        execute(
            &mut invoice,
            &InvoiceCommand::RequestFactoring {
                partner_id: "konfio".to_string(),
                occurred_at: now,
            },
        )
        .unwrap();

        let err = invoice
            .handle(&InvoiceCommand::UpdateFinancingStatus {
                status: FinancingStatus::Deposited,
                occurred_at: now,
            })
            .unwrap_err();
        assert!(matches!(err, DomainError::InvalidStateTransition { .. }));
    }
}

#[cfg(test)]
mod invariant_tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn arb_webhook_command() -> impl Strategy<Value = InvoiceCommand> {
        let at = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        prop_oneof![
            Just(InvoiceCommand::Issue { occurred_at: at }),
            any::<u128>().prop_map(move |n| InvoiceCommand::ConfirmStamp {
                stamp: StampData {
                    uuid: Uuid::from_u128(n),
                    seal: "SEAL==".to_string(),
                    xml_url: String::new(),
                    pdf_url: String::new(),
                    stamped_at: at,
                },
            }),
            Just(InvoiceCommand::RecordStampError {
                code: "500".to_string(),
                message: "err".to_string(),
                occurred_at: at,
            }),
            Just(InvoiceCommand::RecordEmail {
                recipient: "x@y.test".to_string(),
                sent_at: at,
            }),
            Just(InvoiceCommand::Cancel {
                reason: "r".to_string(),
                occurred_at: at,
            }),
        ]
    }

    proptest! {
        /// Cancellation is terminal: no webhook or command sequence moves a
        /// cancelled invoice to another status, and rejected commands leave
        /// state unchanged.
        #[test]
        fn cancelled_is_terminal(commands in proptest::collection::vec(arb_webhook_command(), 1..20)) {
            let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
            let id = InvoiceId::new(AggregateId::new());
            let mut invoice = Invoice::empty(id);
            let create = CreateInvoice {
                invoice_id: id,
                issuer: UserId::new(),
                client: ClientInfo {
                    name: "Acme".to_string(),
                    tax_id: "AAA010101AAA".to_string(),
                    email: "a@b.test".to_string(),
                    address: None,
                },
                items: vec![InvoiceItem {
                    description: "svc".to_string(),
                    quantity: 1,
                    unit_price: 200_000,
                    total: 200_000,
                }],
                tax: 0,
                currency: Currency::Mxn,
                due_date: now + chrono::Duration::days(30),
                description: String::new(),
                occurred_at: now,
            };
            apexfin_events::execute(&mut invoice, &InvoiceCommand::Create(create)).unwrap();

            let mut cancelled = false;
            for command in &commands {
                let before = invoice.clone();
                match invoice.handle(command) {
                    Ok(events) => {
                        for event in &events {
                            invoice.apply(event);
                        }
                    }
                    Err(_) => prop_assert_eq!(&invoice, &before),
                }
                if cancelled {
                    prop_assert_eq!(invoice.status(), InvoiceStatus::Cancelled);
                }
                if invoice.status() == InvoiceStatus::Cancelled {
                    cancelled = true;
                }
            }
        }

        /// Invoice numbers keep the APX-yyyymm-nnnn shape for any id.
        #[test]
        fn invoice_number_shape_holds(n in any::<u128>(), secs in 0i64..4_102_444_800) {
            let id = InvoiceId::new(AggregateId::from_uuid(Uuid::from_u128(n)));
            let at = Utc.timestamp_opt(secs, 0).unwrap();
            let code = invoice_number_code(id, at);
            prop_assert_eq!(code.len(), 15);
            prop_assert!(code.starts_with("APX-"));
            prop_assert_eq!(code.as_bytes()[10], b'-');
        }
    }
}
